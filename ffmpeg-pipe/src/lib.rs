//! FFmpeg-backed media pipeline: demux, decode, scale/resample, encode and
//! mux, plus a threaded capture job tying them together.

/// Registers FFmpeg components (formats, devices, codecs). Call once at
/// startup before opening device inputs like dshow or v4l2.
pub fn init() -> anyhow::Result<()> {
    ffmpeg_next::init().map_err(|e| anyhow::anyhow!("ffmpeg_next init: {}", e))
}

pub mod capture;
pub mod config;
pub mod decoder;
pub mod device;
pub mod encoder;
pub mod error;
pub mod fifo;
pub mod frame;
pub mod hw;
pub mod input;
pub mod metadata;
pub mod output;
pub mod packet;
pub mod resampler;
pub mod scaler;
pub mod stream;

#[cfg(test)]
mod test_util;

pub use capture::{Capture, CaptureHandle, CaptureStats};
pub use config::CaptureConfig;
pub use error::{CodecOutput, PipeError, Status};
