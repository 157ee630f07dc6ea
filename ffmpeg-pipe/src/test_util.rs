//! Media fixtures synthesised with FFmpeg's native codecs.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use ffmpeg_next::{ChannelLayout, Rational, format::Pixel, format::Sample, format::sample::Type};

use crate::{
    encoder::{AudioSettings, Encoder, VideoSettings},
    error::CodecOutput,
    frame::{AudioFrame, Frame, VideoFrame},
    output::Muxer,
};

pub const WIDTH: u32 = 64;
pub const HEIGHT: u32 = 48;
pub const AUDIO_RATE: u32 = 44_100;

pub fn video_settings(fps: i32, gop: u32, global_header: bool) -> VideoSettings {
    let mut options = HashMap::new();
    // keep keyframes on the gop grid only
    options.insert("sc_threshold".to_string(), "1000000000".to_string());
    VideoSettings {
        codec: "mpeg4".to_string(),
        bitrate: 200_000,
        width: WIDTH,
        height: HEIGHT,
        time_base: Rational::new(1, fps),
        frame_rate: Rational::new(fps, 1),
        gop_size: gop,
        b_frames: 0,
        pixel_format: Pixel::YUV420P,
        global_header,
        options,
        ..VideoSettings::default()
    }
}

pub fn mpeg4_encoder(fps: i32, global_header: bool) -> anyhow::Result<Encoder> {
    crate::init()?;
    let mut encoder = Encoder::new();
    encoder.set_video_param(&video_settings(fps, 10, global_header))?;
    Ok(encoder)
}

/// YUV420P frame whose luma drifts slowly with `index`.
pub fn gray_frame(width: u32, height: u32, index: i64) -> anyhow::Result<Frame> {
    let mut frame = VideoFrame::alloc(Pixel::YUV420P, width, height)?;
    frame.plane_mut(0)?.fill(64 + (index % 64) as u8);
    frame.plane_mut(1)?.fill(128);
    frame.plane_mut(2)?.fill(128);
    frame.set_pts(Some(index));
    Ok(Frame::Video(frame))
}

/// Packed s16 stereo tone, `samples` long, starting at sample `offset`.
pub fn tone_frame(samples: usize, offset: usize) -> anyhow::Result<AudioFrame> {
    let layout = ChannelLayout::STEREO;
    let mut frame = AudioFrame::alloc(Sample::I16(Type::Packed), samples, layout)?;
    frame.set_rate(AUDIO_RATE);
    frame.set_pts(Some(offset as i64));
    let data = frame.plane_mut(0)?;
    for i in 0..samples {
        let t = (offset + i) as f32 / AUDIO_RATE as f32;
        let value = ((t * 440.0 * std::f32::consts::TAU).sin() * 8000.0) as i16;
        let bytes = value.to_le_bytes();
        let at = i * 4;
        data[at..at + 2].copy_from_slice(&bytes);
        data[at + 2..at + 4].copy_from_slice(&bytes);
    }
    Ok(frame)
}

fn drain_into(
    encoder: &mut Encoder,
    muxer: &mut Muxer,
    index: usize,
    to_eof: bool,
) -> anyhow::Result<()> {
    let stream_tb = muxer.time_base(index)?;
    loop {
        match encoder.get_packet()? {
            CodecOutput::Data(mut packet) => {
                packet.set_index(index);
                packet.rescale_ts(stream_tb);
                muxer.write_packet(packet)?;
            }
            CodecOutput::Again if to_eof => continue,
            _ => return Ok(()),
        }
    }
}

/// Writes `seconds` of mpeg4 video at `fps` into an mkv file, with a
/// keyframe every `gop` frames.
pub fn write_video_file(dir: &Path, seconds: u32, fps: i32, gop: u32) -> anyhow::Result<PathBuf> {
    write_media(dir, "video.mkv", seconds, Some((fps, gop)), false, 0)
}

/// Like [`write_video_file`], but the first frame is stamped `first_frame`
/// frame durations after zero, as a capture device or mpegts source would.
pub fn write_offset_video_file(
    dir: &Path,
    seconds: u32,
    fps: i32,
    first_frame: i64,
) -> anyhow::Result<PathBuf> {
    write_media(dir, "offset.mkv", seconds, Some((fps, fps as u32)), false, first_frame)
}

/// Writes `seconds` of mpeg4 video plus pcm_s16le stereo audio.
pub fn write_av_file(dir: &Path, seconds: u32) -> anyhow::Result<PathBuf> {
    write_media(dir, "av.mkv", seconds, Some((10, 10)), true, 0)
}

/// Writes `seconds` of pcm_s16le stereo audio only.
pub fn write_audio_file(dir: &Path, seconds: u32) -> anyhow::Result<PathBuf> {
    write_media(dir, "audio.mkv", seconds, None, true, 0)
}

fn write_media(
    dir: &Path,
    name: &str,
    seconds: u32,
    video: Option<(i32, u32)>,
    audio: bool,
    first_frame: i64,
) -> anyhow::Result<PathBuf> {
    crate::init()?;
    let path = dir.join(name);
    let mut muxer = Muxer::new();
    muxer.create_output(&path.to_string_lossy(), None)?;
    let global_header = muxer.needs_global_header()?;

    let mut video_encoder = match video {
        Some((fps, gop)) => {
            let mut encoder = Encoder::new();
            encoder.set_video_param(&video_settings(fps, gop, global_header))?;
            let index = muxer.create_stream(&encoder)?;
            Some((encoder, index, fps))
        }
        None => None,
    };
    let mut audio_encoder = if audio {
        let mut encoder = Encoder::new();
        let frame_size = encoder.set_audio_param(&AudioSettings {
            codec: "pcm_s16le".to_string(),
            bitrate: 0,
            sample_rate: AUDIO_RATE,
            layout: ChannelLayout::STEREO,
            channels: 2,
            sample_format: Sample::I16(Type::Packed),
            frame_size: 1024,
            global_header,
            options: HashMap::new(),
        })?;
        let index = muxer.create_stream(&encoder)?;
        Some((encoder, index, frame_size))
    } else {
        None
    };
    muxer.write_header()?;

    if let Some((encoder, index, fps)) = video_encoder.as_mut() {
        for i in first_frame..first_frame + seconds as i64 * *fps as i64 {
            encoder.push_frame(Some(&gray_frame(WIDTH, HEIGHT, i)?))?;
            drain_into(encoder, &mut muxer, *index, false)?;
        }
        encoder.push_frame(None)?;
        drain_into(encoder, &mut muxer, *index, true)?;
    }
    if let Some((encoder, index, frame_size)) = audio_encoder.as_mut() {
        let total = seconds as usize * AUDIO_RATE as usize;
        let mut offset = 0;
        while offset < total {
            let samples = (*frame_size).min(total - offset);
            encoder.push_frame(Some(&Frame::Audio(tone_frame(samples, offset)?)))?;
            drain_into(encoder, &mut muxer, *index, false)?;
            offset += samples;
        }
        encoder.push_frame(None)?;
        drain_into(encoder, &mut muxer, *index, true)?;
    }
    muxer.cleanup();
    Ok(path)
}

/// Encodes `count` frames without global headers and concatenates the
/// packets into one raw mpeg4 elementary stream.
pub fn mpeg4_elementary_stream(count: i64) -> anyhow::Result<(Vec<u8>, usize)> {
    let mut encoder = mpeg4_encoder(25, false)?;
    let mut bytes = Vec::new();
    let mut packets = 0;
    for i in 0..count {
        encoder.push_frame(Some(&gray_frame(WIDTH, HEIGHT, i)?))?;
        while let CodecOutput::Data(packet) = encoder.get_packet()? {
            bytes.extend_from_slice(packet.data());
            packets += 1;
        }
    }
    encoder.push_frame(None)?;
    while let CodecOutput::Data(packet) = encoder.get_packet()? {
        bytes.extend_from_slice(packet.data());
        packets += 1;
    }
    Ok((bytes, packets))
}
