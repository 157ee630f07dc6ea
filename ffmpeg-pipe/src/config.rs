use std::collections::HashMap;
use std::ffi::CString;
use std::path::PathBuf;

use ffmpeg_next::{ChannelLayout, Rational, ffi, format::Pixel, format::Sample};
use serde::{Deserialize, Serialize};

use crate::{
    encoder::{AudioSettings, VideoSettings},
    error::PipeError,
    hw::HwAccel,
    stream::StreamDescriptor,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    pub source: SourceConfig,
    #[serde(default)]
    pub video: Option<VideoEncodeConfig>,
    #[serde(default)]
    pub audio: Option<AudioEncodeConfig>,
    pub sink: SinkConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// File, URL or device name (`video=USB Camera` for dshow).
    pub url: String,
    /// Forced input format, e.g. "dshow", "v4l2", "lavfi".
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub options: HashMap<String, String>,
    /// Stream to capture; first stream of the kind when unset.
    #[serde(default)]
    pub video_stream: Option<usize>,
    #[serde(default)]
    pub audio_stream: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoEncodeConfig {
    pub codec: String,
    pub bitrate: usize,
    /// Output size; the source size when unset.
    pub width: Option<u32>,
    pub height: Option<u32>,
    /// Output frame rate; the source rate when unset.
    pub frame_rate: Option<u32>,
    pub gop_size: u32,
    pub b_frames: usize,
    pub pixel_format: String,
    pub options: HashMap<String, String>,
    /// Decode on this accelerator when available.
    pub hwaccel: Option<HwAccel>,
    pub prefer_hardware_encoder: bool,
}

impl Default for VideoEncodeConfig {
    fn default() -> Self {
        Self {
            codec: "libx264".to_string(),
            bitrate: 1_000_000,
            width: None,
            height: None,
            frame_rate: None,
            gop_size: 120,
            b_frames: 0,
            pixel_format: "yuv420p".to_string(),
            options: HashMap::new(),
            hwaccel: None,
            prefer_hardware_encoder: false,
        }
    }
}

impl VideoEncodeConfig {
    pub fn settings(
        &self,
        stream: &StreamDescriptor,
        global_header: bool,
    ) -> anyhow::Result<VideoSettings> {
        let frame_rate = match self.frame_rate {
            Some(fps) if fps > 0 => Rational::new(fps as i32, 1),
            _ if stream.rate().numerator() > 0 && stream.rate().denominator() > 0 => stream.rate(),
            _ => Rational::new(25, 1),
        };
        let width = self.width.unwrap_or(stream.width());
        let height = self.height.unwrap_or(stream.height());
        if width == 0 || height == 0 {
            return Err(PipeError::Unsupported(format!(
                "video stream {} has no size, set width and height",
                stream.index()
            ))
            .into());
        }
        Ok(VideoSettings {
            codec: self.codec.clone(),
            bitrate: self.bitrate,
            width,
            height,
            time_base: frame_rate.invert(),
            frame_rate,
            gop_size: self.gop_size,
            b_frames: self.b_frames,
            pixel_format: parse_pixel_format(&self.pixel_format)?,
            prefer_hardware: self.prefer_hardware_encoder,
            global_header,
            options: self.options.clone(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioEncodeConfig {
    pub codec: String,
    pub bitrate: usize,
    pub sample_rate: u32,
    pub channels: u32,
    pub sample_format: String,
    pub frame_size: usize,
    pub options: HashMap<String, String>,
}

impl Default for AudioEncodeConfig {
    fn default() -> Self {
        Self {
            codec: "libmp3lame".to_string(),
            bitrate: 128_000,
            sample_rate: 44_100,
            channels: 2,
            sample_format: "fltp".to_string(),
            frame_size: 1024,
            options: HashMap::new(),
        }
    }
}

impl AudioEncodeConfig {
    pub fn settings(&self, global_header: bool) -> anyhow::Result<AudioSettings> {
        if self.channels == 0 || self.sample_rate == 0 {
            let message = "audio needs channels and a sample rate".to_string();
            return Err(PipeError::Unsupported(message).into());
        }
        Ok(AudioSettings {
            codec: self.codec.clone(),
            bitrate: self.bitrate,
            sample_rate: self.sample_rate,
            layout: ChannelLayout::default(self.channels as i32),
            channels: self.channels,
            sample_format: parse_sample_format(&self.sample_format)?,
            frame_size: self.frame_size,
            global_header,
            options: self.options.clone(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SinkConfig {
    /// Container file or URL; the format is inferred from the name unless given.
    File {
        path: PathBuf,
        #[serde(default)]
        format: Option<String>,
    },
    /// Bare elementary stream of a single encoder.
    Raw { path: PathBuf },
}

/// Pixel format by FFmpeg name, e.g. "yuv420p" or "nv12".
pub fn parse_pixel_format(name: &str) -> anyhow::Result<Pixel> {
    let cname = CString::new(name)
        .map_err(|e| anyhow::anyhow!("invalid pixel format {:?}: {}", name, e))?;
    let format = Pixel::from(unsafe { ffi::av_get_pix_fmt(cname.as_ptr()) });
    if format == Pixel::None {
        return Err(PipeError::Unsupported(format!("unknown pixel format: {}", name)).into());
    }
    Ok(format)
}

/// Sample format by FFmpeg name, e.g. "s16" or "fltp".
pub fn parse_sample_format(name: &str) -> anyhow::Result<Sample> {
    let cname = CString::new(name)
        .map_err(|e| anyhow::anyhow!("invalid sample format {:?}: {}", name, e))?;
    let format = Sample::from(unsafe { ffi::av_get_sample_fmt(cname.as_ptr()) });
    if format == Sample::None {
        return Err(PipeError::Unsupported(format!("unknown sample format: {}", name)).into());
    }
    Ok(format)
}
