use std::collections::{HashMap, VecDeque};

use ffmpeg_next::{
    ChannelLayout, Dictionary, Rational,
    codec::{self, Parameters},
    format::{Pixel, Sample},
    media,
};

use crate::{
    error::{CodecOutput, PipeError, Status, check, invalid_state, is_again},
    frame::Frame,
    hw::{find_hw_encoder, pixel_format_for_encoder},
    packet::Packet,
};

#[derive(Debug, Clone)]
pub struct VideoSettings {
    pub codec: String,
    pub bitrate: usize,
    pub width: u32,
    pub height: u32,
    pub time_base: Rational,
    pub frame_rate: Rational,
    pub gop_size: u32,
    pub b_frames: usize,
    pub pixel_format: Pixel,
    /// Try a hardware encoder for `codec` first, falling back to `codec`.
    pub prefer_hardware: bool,
    /// Put codec headers in extradata instead of the bitstream. Required
    /// by containers such as mp4 and mkv.
    pub global_header: bool,
    pub options: HashMap<String, String>,
}

impl Default for VideoSettings {
    fn default() -> Self {
        Self {
            codec: "libx264".to_string(),
            bitrate: 1_000_000,
            width: 1920,
            height: 1080,
            time_base: Rational::new(1, 24),
            frame_rate: Rational::new(24, 1),
            gop_size: 120,
            b_frames: 0,
            pixel_format: Pixel::YUV420P,
            prefer_hardware: false,
            global_header: false,
            options: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AudioSettings {
    pub codec: String,
    pub bitrate: usize,
    pub sample_rate: u32,
    pub layout: ChannelLayout,
    pub channels: u32,
    pub sample_format: Sample,
    /// Samples per frame to use when the codec accepts any size.
    pub frame_size: usize,
    pub global_header: bool,
    pub options: HashMap<String, String>,
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            codec: "libmp3lame".to_string(),
            bitrate: 128_000,
            sample_rate: 44_100,
            layout: ChannelLayout::STEREO,
            channels: 2,
            sample_format: Sample::F32(ffmpeg_next::format::sample::Type::Planar),
            frame_size: 1024,
            global_header: false,
            options: HashMap::new(),
        }
    }
}

pub enum EncoderType {
    Video(ffmpeg_next::codec::encoder::Video),
    Audio(ffmpeg_next::codec::encoder::Audio),
}

impl EncoderType {
    fn send(&mut self, frame: Option<&Frame>) -> Result<(), ffmpeg_next::Error> {
        match (self, frame) {
            (EncoderType::Video(encoder), Some(frame)) => encoder.send_frame(frame.as_inner()),
            (EncoderType::Audio(encoder), Some(frame)) => encoder.send_frame(frame.as_inner()),
            (EncoderType::Video(encoder), None) => encoder.send_eof(),
            (EncoderType::Audio(encoder), None) => encoder.send_eof(),
        }
    }

    fn receive(&mut self, packet: &mut ffmpeg_next::Packet) -> Result<(), ffmpeg_next::Error> {
        match self {
            EncoderType::Video(encoder) => encoder.receive_packet(packet),
            EncoderType::Audio(encoder) => encoder.receive_packet(packet),
        }
    }

    fn as_ptr(&self) -> *const ffmpeg_next::ffi::AVCodecContext {
        unsafe {
            match self {
                EncoderType::Video(encoder) => encoder.0.as_ptr(),
                EncoderType::Audio(encoder) => encoder.0.as_ptr(),
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Picture {
    format: Pixel,
    width: u32,
    height: u32,
}

struct Opened {
    inner: EncoderType,
    codec_name: String,
    picture: Option<Picture>,
    time_base: Rational,
    frame_duration: i64,
    frame_size: usize,
    // frames the codec refused with EAGAIN; `None` is the drain marker
    pending: VecDeque<Option<Frame>>,
    draining: bool,
}

unsafe impl Send for Opened {}

impl Opened {
    fn submit_pending(&mut self) -> anyhow::Result<()> {
        while let Some(front) = self.pending.front() {
            if front.is_none() && self.draining {
                self.pending.pop_front();
                continue;
            }
            match self.inner.send(front.as_ref()) {
                Ok(()) => {
                    if front.is_none() {
                        self.draining = true;
                    }
                    self.pending.pop_front();
                }
                Err(e) if is_again(&e) => break,
                Err(e) => {
                    self.pending.pop_front();
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }
}

fn dictionary(options: &HashMap<String, String>) -> Dictionary<'static> {
    let mut dict = Dictionary::new();
    for (key, value) in options {
        dict.set(key, value);
    }
    dict
}

/// Frame-to-packet encoder. Packets come out in [`Encoder::time_base`].
pub struct Encoder {
    opened: Option<Opened>,
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Encoder {
    pub fn new() -> Self {
        Self { opened: None }
    }

    pub fn status(&self) -> Status {
        if self.opened.is_some() {
            Status::Running
        } else {
            Status::Stopped
        }
    }

    /// Opens `codec` and returns it with the pixel format it was opened for.
    fn open_video(
        codec: ffmpeg_next::Codec,
        settings: &VideoSettings,
    ) -> anyhow::Result<(ffmpeg_next::codec::encoder::Video, Pixel)> {
        let format = pixel_format_for_encoder(settings.pixel_format, codec.name());
        let ctx = ffmpeg_next::codec::Context::new_with_codec(codec);
        let mut encoder = ctx.encoder().video()?;
        encoder.set_width(settings.width);
        encoder.set_height(settings.height);
        encoder.set_format(format);
        encoder.set_bit_rate(settings.bitrate);
        encoder.set_frame_rate(Some(settings.frame_rate));
        encoder.set_time_base(settings.time_base);
        encoder.set_gop(settings.gop_size);
        encoder.set_max_b_frames(settings.b_frames);
        if settings.global_header {
            encoder.set_flags(codec::Flags::GLOBAL_HEADER);
        }
        Ok((encoder.open_with(dictionary(&settings.options))?, format))
    }

    /// Opens a video encoder. With `prefer_hardware`, a hardware encoder
    /// for the codec is tried first and the software codec is used if it
    /// is missing or fails to open.
    pub fn set_video_param(&mut self, settings: &VideoSettings) -> anyhow::Result<()> {
        if self.opened.is_some() {
            return Err(invalid_state("encoder", Status::Running, Status::Stopped));
        }

        let software = || {
            ffmpeg_next::encoder::find_by_name(&settings.codec)
                .ok_or_else(|| {
                    PipeError::Unsupported(format!("codec not found: {}", settings.codec))
                })
        };

        let hardware = if settings.prefer_hardware {
            find_hw_encoder(&settings.codec)
        } else {
            None
        };

        let ((encoder, format), codec_name) = match hardware {
            Some(hw_codec) => {
                let hw_name = hw_codec.name().to_string();
                log::info!("attempting hardware encoder: {}", hw_name);
                match Self::open_video(hw_codec, settings) {
                    Ok(opened) => (opened, hw_name),
                    Err(e) => {
                        log::warn!(
                            "hardware encoder {} failed: {}, falling back to {}",
                            hw_name,
                            e,
                            settings.codec
                        );
                        (Self::open_video(software()?, settings)?, settings.codec.clone())
                    }
                }
            }
            None => (Self::open_video(software()?, settings)?, settings.codec.clone()),
        };

        let time_base: Rational = unsafe { (*encoder.0.as_ptr()).time_base.into() };
        let frame_duration = if settings.frame_rate.numerator() > 0 {
            crate::stream::rescale(1, settings.frame_rate.invert(), time_base).max(1)
        } else {
            0
        };
        log::info!(
            "video encoder opened: {} {}x{} {:?}, time_base: {}/{}",
            codec_name,
            settings.width,
            settings.height,
            format,
            time_base.numerator(),
            time_base.denominator()
        );

        self.opened = Some(Opened {
            inner: EncoderType::Video(encoder),
            codec_name,
            picture: Some(Picture {
                format,
                width: settings.width,
                height: settings.height,
            }),
            time_base,
            frame_duration,
            frame_size: 0,
            pending: VecDeque::new(),
            draining: false,
        });
        Ok(())
    }

    /// Opens an audio encoder and returns the number of samples every
    /// pushed frame must carry (only the last frame may be shorter).
    pub fn set_audio_param(&mut self, settings: &AudioSettings) -> anyhow::Result<usize> {
        if self.opened.is_some() {
            return Err(invalid_state("encoder", Status::Running, Status::Stopped));
        }
        if settings.layout.channels() as u32 != settings.channels {
            return Err(PipeError::Unsupported(format!(
                "{} channels do not match layout {:?}",
                settings.channels, settings.layout
            ))
            .into());
        }

        let codec = ffmpeg_next::encoder::find_by_name(&settings.codec)
            .ok_or_else(|| PipeError::Unsupported(format!("codec not found: {}", settings.codec)))?;
        let ctx = ffmpeg_next::codec::Context::new_with_codec(codec);
        let mut encoder = ctx.encoder().audio()?;
        encoder.set_rate(settings.sample_rate as i32);
        encoder.set_channel_layout(settings.layout);
        encoder.set_format(settings.sample_format);
        encoder.set_bit_rate(settings.bitrate);
        encoder.set_time_base(Rational::new(1, settings.sample_rate as i32));
        if settings.global_header {
            encoder.set_flags(codec::Flags::GLOBAL_HEADER);
        }
        let encoder = encoder.open_with(dictionary(&settings.options))?;

        let (frame_size, time_base): (i32, Rational) =
            unsafe { ((*encoder.0.as_ptr()).frame_size, (*encoder.0.as_ptr()).time_base.into()) };
        // 0 means the codec takes frames of any size
        let frame_size = match frame_size.max(0) as usize {
            0 => settings.frame_size,
            n => n,
        };
        log::info!(
            "audio encoder opened: {} {} Hz {:?} {:?}, frame size: {}",
            settings.codec,
            settings.sample_rate,
            settings.layout,
            settings.sample_format,
            frame_size
        );

        self.opened = Some(Opened {
            inner: EncoderType::Audio(encoder),
            codec_name: settings.codec.clone(),
            picture: None,
            time_base,
            frame_duration: 0,
            frame_size,
            pending: VecDeque::new(),
            draining: false,
        });
        Ok(frame_size)
    }

    fn running(&self) -> anyhow::Result<&Opened> {
        self.opened
            .as_ref()
            .ok_or_else(|| invalid_state("encoder", Status::Stopped, Status::Running))
    }

    fn running_mut(&mut self) -> anyhow::Result<&mut Opened> {
        self.opened
            .as_mut()
            .ok_or_else(|| invalid_state("encoder", Status::Stopped, Status::Running))
    }

    /// Submits one frame, pts in [`Encoder::time_base`]. `None` starts the
    /// drain; pull packets with [`Encoder::get_packet`] until `Eof`.
    pub fn push_frame(&mut self, frame: Option<&Frame>) -> anyhow::Result<()> {
        let opened = self.running_mut()?;
        if let Some(frame) = frame {
            match (&opened.inner, frame) {
                (EncoderType::Video(_), Frame::Video(video)) => {
                    let shape = Picture {
                        format: video.format(),
                        width: video.width(),
                        height: video.height(),
                    };
                    if opened.picture != Some(shape) {
                        return Err(PipeError::Unsupported(format!(
                            "encoder takes {:?}, frame is {:?}",
                            opened.picture, shape
                        ))
                        .into());
                    }
                }
                (EncoderType::Audio(_), Frame::Audio(audio)) => {
                    if audio.samples() > opened.frame_size {
                        return Err(PipeError::Unsupported(format!(
                            "{} samples exceed the encoder frame size {}",
                            audio.samples(),
                            opened.frame_size
                        ))
                        .into());
                    }
                }
                (_, Frame::Hardware(_)) => {
                    return Err(PipeError::Unsupported(
                        "hardware frame must be transferred before encoding".to_string(),
                    )
                    .into());
                }
                _ => {
                    return Err(PipeError::Unsupported(
                        "frame type does not match encoder".to_string(),
                    )
                    .into());
                }
            }
        }
        opened.pending.push_back(frame.cloned());
        opened.submit_pending()
    }

    /// Next encoded packet, if one is ready.
    pub fn get_packet(&mut self) -> anyhow::Result<CodecOutput<Packet>> {
        let opened = self.running_mut()?;
        opened.submit_pending()?;

        let mut packet = ffmpeg_next::Packet::empty();
        match opened.inner.receive(&mut packet) {
            Ok(()) => {
                if packet.duration() == 0 && opened.frame_duration > 0 {
                    packet.set_duration(opened.frame_duration);
                }
                Ok(CodecOutput::Data(Packet::from((packet, opened.time_base))))
            }
            Err(ffmpeg_next::Error::Eof) => Ok(CodecOutput::Eof),
            Err(e) if is_again(&e) => Ok(CodecOutput::Again),
            Err(e) => Err(e.into()),
        }
    }

    /// Time base of every packet this encoder produces.
    pub fn time_base(&self) -> anyhow::Result<Rational> {
        Ok(self.running()?.time_base)
    }

    /// Samples per audio frame; 0 for video.
    pub fn frame_size(&self) -> anyhow::Result<usize> {
        Ok(self.running()?.frame_size)
    }

    pub fn medium(&self) -> anyhow::Result<media::Type> {
        Ok(match self.running()?.inner {
            EncoderType::Video(_) => media::Type::Video,
            EncoderType::Audio(_) => media::Type::Audio,
        })
    }

    /// Pixel format, width and height every pushed video frame must have.
    pub fn picture(&self) -> anyhow::Result<(Pixel, u32, u32)> {
        let picture = self
            .running()?
            .picture
            .ok_or_else(|| {
                PipeError::Unsupported("audio encoder has no picture shape".to_string())
            })?;
        Ok((picture.format, picture.width, picture.height))
    }

    pub fn codec_name(&self) -> anyhow::Result<&str> {
        Ok(&self.running()?.codec_name)
    }

    /// Stream parameters describing this encoder's output.
    pub fn codec_parameters(&self) -> anyhow::Result<Parameters> {
        let opened = self.running()?;
        let mut parameters = Parameters::new();
        let ret = unsafe {
            ffmpeg_next::ffi::avcodec_parameters_from_context(
                parameters.as_mut_ptr(),
                opened.inner.as_ptr(),
            )
        };
        check(ret, "avcodec_parameters_from_context")?;
        Ok(parameters)
    }

    pub fn cleanup(&mut self) {
        if let Some(opened) = self.opened.take() {
            if !opened.pending.is_empty() {
                log::warn!(
                    "encoder {} closed with {} unsent frames",
                    opened.codec_name,
                    opened.pending.len()
                );
            }
        }
    }
}
