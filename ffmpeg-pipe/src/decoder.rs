use std::collections::VecDeque;
use std::ffi::c_int;
use std::ptr;

use ffmpeg_next::{
    Rational,
    codec::{Id, Parameters},
    ffi, media,
};

use crate::{
    error::{CodecOutput, PipeError, Status, invalid_state, is_again},
    frame::{AudioFrame, Frame, HwFrame, VideoFrame},
    hw::{self, HwAccel, HwDevice},
    packet::Packet,
};

enum DecoderType {
    Video(ffmpeg_next::codec::decoder::Video),
    Audio(ffmpeg_next::codec::decoder::Audio),
}

impl DecoderType {
    fn send(&mut self, packet: Option<&Packet>) -> Result<(), ffmpeg_next::Error> {
        match (self, packet) {
            (DecoderType::Video(decoder), Some(packet)) => decoder.send_packet(packet.as_inner()),
            (DecoderType::Audio(decoder), Some(packet)) => decoder.send_packet(packet.as_inner()),
            (DecoderType::Video(decoder), None) => decoder.send_eof(),
            (DecoderType::Audio(decoder), None) => decoder.send_eof(),
        }
    }

    fn receive(
        &mut self,
        hw_format: Option<ffmpeg_next::format::Pixel>,
    ) -> anyhow::Result<CodecOutput<Frame>> {
        let result = match self {
            DecoderType::Video(decoder) => {
                let mut frame = ffmpeg_next::frame::Video::empty();
                decoder.receive_frame(&mut frame).map(|()| {
                    if frame.pts().is_none() {
                        frame.set_pts(frame.timestamp());
                    }
                    if hw_format == Some(frame.format()) {
                        Frame::Hardware(HwFrame::new(frame))
                    } else {
                        Frame::Video(VideoFrame::from(frame))
                    }
                })
            }
            DecoderType::Audio(decoder) => {
                let mut frame = ffmpeg_next::frame::Audio::empty();
                decoder.receive_frame(&mut frame).map(|()| {
                    if frame.pts().is_none() {
                        frame.set_pts(frame.timestamp());
                    }
                    Frame::Audio(AudioFrame::from(frame))
                })
            }
        };

        match result {
            Ok(frame) => Ok(CodecOutput::Data(frame)),
            Err(ffmpeg_next::Error::Eof) => Ok(CodecOutput::Eof),
            Err(e) if is_again(&e) => Ok(CodecOutput::Again),
            Err(e) => Err(e.into()),
        }
    }

    fn as_mut_ptr(&mut self) -> *mut ffi::AVCodecContext {
        unsafe {
            match self {
                DecoderType::Video(decoder) => decoder.as_mut_ptr(),
                DecoderType::Audio(decoder) => decoder.as_mut_ptr(),
            }
        }
    }
}

/// Splits a raw elementary byte stream into codec units.
struct Parser {
    ctx: *mut ffi::AVCodecParserContext,
}

impl Parser {
    fn new(id: Id) -> Option<Self> {
        let codec_id: ffi::AVCodecID = id.into();
        let ctx = unsafe { ffi::av_parser_init(codec_id as c_int) };
        if ctx.is_null() { None } else { Some(Self { ctx }) }
    }

    /// Returns bytes consumed and, if one completed, the next unit.
    fn parse(&mut self, codec: *mut ffi::AVCodecContext, data: &[u8]) -> (usize, Option<Vec<u8>>) {
        let mut out: *mut u8 = ptr::null_mut();
        let mut out_size: c_int = 0;
        let used = unsafe {
            ffi::av_parser_parse2(
                self.ctx,
                codec,
                &mut out,
                &mut out_size,
                if data.is_empty() { ptr::null() } else { data.as_ptr() },
                data.len() as c_int,
                ffi::AV_NOPTS_VALUE,
                ffi::AV_NOPTS_VALUE,
                0,
            )
        };
        let unit = if out_size > 0 && !out.is_null() {
            Some(unsafe { std::slice::from_raw_parts(out, out_size as usize) }.to_vec())
        } else {
            None
        };
        (used.max(0) as usize, unit)
    }
}

impl Drop for Parser {
    fn drop(&mut self) {
        unsafe { ffi::av_parser_close(self.ctx) };
    }
}

struct Opened {
    inner: DecoderType,
    time_base: Rational,
    hw_format: Option<ffmpeg_next::format::Pixel>,
    parser: Option<Parser>,
    // input the codec refused with EAGAIN; `None` is the drain marker
    pending: VecDeque<Option<Packet>>,
    draining: bool,
    // keeps the device alive for as long as the codec references it
    _device: Option<HwDevice>,
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

    fn enqueue(&mut self, packet: Option<&Packet>) {
        let packet = packet.map(|packet| {
            let mut packet = packet.clone();
            packet.rescale_ts(self.time_base);
            packet
        });
        self.pending.push_back(packet);
    }

    fn step(&mut self) -> anyhow::Result<CodecOutput<Frame>> {
        self.submit_pending()?;
        self.inner.receive(self.hw_format)
    }
}

/// Packet-to-frame decoder.
///
/// Each call submits at most one unit of input and hands back at most one
/// frame; `CodecOutput::Again` asks for more input. Passing `None` starts
/// the drain, after which repeated calls return the buffered frames and
/// finally `CodecOutput::Eof`.
pub struct Decoder {
    opened: Option<Opened>,
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder {
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

    /// Opens a decoder for `parameters`. Packet and frame timestamps are in
    /// `time_base`. With `accel`, frames come out as [`Frame::Hardware`]
    /// when the device can be opened; otherwise decoding stays in software.
    pub fn copy_param(
        &mut self,
        parameters: &Parameters,
        time_base: Rational,
        accel: Option<HwAccel>,
    ) -> anyhow::Result<()> {
        if self.opened.is_some() {
            return Err(invalid_state("decoder", Status::Running, Status::Stopped));
        }

        let codec = ffmpeg_next::decoder::find(parameters.id()).ok_or_else(|| {
            PipeError::Unsupported(format!("no decoder for {:?}", parameters.id()))
        })?;

        let mut decoder_ctx = ffmpeg_next::codec::Context::from_parameters(parameters.clone())?;
        unsafe {
            (*decoder_ctx.as_mut_ptr()).time_base = time_base.into();
            (*decoder_ctx.as_mut_ptr()).pkt_timebase = time_base.into();
        }

        let mut hw_format = None;
        let mut device = None;
        if let Some(accel) = accel.filter(|_| parameters.medium() == media::Type::Video) {
            match hw::hw_pixel_format(&codec, accel) {
                Some(format) => match HwDevice::create(accel) {
                    Ok(dev) => {
                        unsafe { (*decoder_ctx.as_mut_ptr()).hw_device_ctx = dev.new_ref() };
                        hw_format = Some(format);
                        device = Some(dev);
                    }
                    Err(e) => log::warn!(
                        "hardware device {:?} unavailable: {}, decoding in software",
                        accel,
                        e
                    ),
                },
                None => log::warn!(
                    "{} has no {:?} support, decoding in software",
                    codec.name(),
                    accel
                ),
            }
        }

        let inner = match parameters.medium() {
            media::Type::Video => {
                let decoder = decoder_ctx.decoder().open_as(codec)?.video()?;
                if decoder.width() == 0 || decoder.height() == 0 {
                    log::debug!(
                        "{} opened without dimensions, taking them from the bitstream",
                        codec.name()
                    );
                }
                DecoderType::Video(decoder)
            }
            media::Type::Audio => {
                DecoderType::Audio(decoder_ctx.decoder().open_as(codec)?.audio()?)
            }
            other => {
                let message = format!("cannot decode {:?} streams", other);
                return Err(PipeError::Unsupported(message).into());
            }
        };

        log::info!(
            "decoder opened: {}, time_base: {}/{}, hardware: {}",
            codec.name(),
            time_base.numerator(),
            time_base.denominator(),
            hw_format.is_some()
        );

        self.opened = Some(Opened {
            inner,
            time_base,
            hw_format,
            parser: Parser::new(parameters.id()),
            pending: VecDeque::new(),
            draining: false,
            _device: device,
        });
        Ok(())
    }

    fn running_mut(&mut self) -> anyhow::Result<&mut Opened> {
        self.opened
            .as_mut()
            .ok_or_else(|| invalid_state("decoder", Status::Stopped, Status::Running))
    }

    /// Submits `packet` (rescaled to the decoder time base) or, with `None`,
    /// starts draining; returns at most one frame.
    pub fn decode(&mut self, packet: Option<&Packet>) -> anyhow::Result<CodecOutput<Frame>> {
        let opened = self.running_mut()?;
        opened.enqueue(packet);
        opened.step()
    }

    /// Pulls the next buffered frame without submitting input.
    pub fn receive_frame(&mut self) -> anyhow::Result<CodecOutput<Frame>> {
        self.running_mut()?.step()
    }

    /// Decodes a raw elementary stream. Returns the result plus the number
    /// of input bytes consumed; call again with the remainder until the
    /// whole buffer is used. `None` or an empty slice starts the drain.
    pub fn decode_bytes(
        &mut self,
        data: Option<&[u8]>,
    ) -> anyhow::Result<(CodecOutput<Frame>, usize)> {
        let opened = self.running_mut()?;
        let codec_ptr = opened.inner.as_mut_ptr();
        let time_base = opened.time_base;
        let parser = opened
            .parser
            .as_mut()
            .ok_or_else(|| PipeError::Unsupported("codec has no bitstream parser".to_string()))?;

        let data = data.unwrap_or_default();
        if data.is_empty() {
            if !opened.draining && !opened.pending.iter().any(Option::is_none) {
                let (_, unit) = parser.parse(codec_ptr, &[]);
                if let Some(unit) = unit {
                    opened.pending.push_back(Some(Packet::copy(&unit, time_base)));
                }
                opened.pending.push_back(None);
            }
            return Ok((opened.step()?, 0));
        }

        let (used, unit) = parser.parse(codec_ptr, data);
        if let Some(unit) = unit {
            opened.pending.push_back(Some(Packet::copy(&unit, time_base)));
        }
        Ok((opened.step()?, used))
    }

    /// Whether decoded frames stay in accelerator memory.
    pub fn produces_hw_frames(&self) -> bool {
        self.opened.as_ref().is_some_and(|o| o.hw_format.is_some())
    }

    pub fn time_base(&self) -> anyhow::Result<Rational> {
        self.opened
            .as_ref()
            .map(|o| o.time_base)
            .ok_or_else(|| invalid_state("decoder", Status::Stopped, Status::Running))
    }

    /// Drops buffered input and codec state, e.g. after a seek. Also
    /// re-arms a drained decoder.
    pub fn flush(&mut self) -> anyhow::Result<()> {
        let opened = self.running_mut()?;
        opened.pending.clear();
        opened.draining = false;
        unsafe { ffi::avcodec_flush_buffers(opened.inner.as_mut_ptr()) };
        Ok(())
    }

    pub fn cleanup(&mut self) {
        if self.opened.take().is_some() {
            log::debug!("decoder closed");
        }
    }
}
