use std::collections::HashMap;
use std::ffi::{CString, c_int, c_void};
use std::io::Read;
use std::path::Path;
use std::ptr;

use ffmpeg_next::{
    Dictionary, Rational, ffi,
    util::mathematics::{Rescale, rescale::TIME_BASE},
};

use crate::{
    error::{CodecOutput, PipeError, Status, check, invalid_state, is_again},
    packet::Packet,
    stream::StreamDescriptor,
};

/// Default AVIO buffer size for reader-backed sources.
pub const DEFAULT_IO_BUFFER_SIZE: usize = 32 * 1024;

/// Where a demuxer pulls bytes from.
pub enum Source {
    /// File path, network URL or capture device name (e.g. `video=USB Camera`).
    Url(String),
    /// Pull-based byte source replacing direct file/device access.
    Reader {
        reader: Box<dyn Read + Send>,
        buffer_size: usize,
    },
}

impl Source {
    pub fn url(url: impl Into<String>) -> Self {
        Source::Url(url.into())
    }

    pub fn reader<R: Read + Send + 'static>(reader: R) -> Self {
        Source::Reader {
            reader: Box::new(reader),
            buffer_size: DEFAULT_IO_BUFFER_SIZE,
        }
    }
}

/// Video and audio stream indices of an opened source.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamIndices {
    pub video: Vec<usize>,
    pub audio: Vec<usize>,
}

/// AVIO context driving a boxed reader. Must outlive the format context
/// that reads through it.
struct ReaderIo {
    avio: *mut ffi::AVIOContext,
    reader: *mut Box<dyn Read + Send>,
}

unsafe impl Send for ReaderIo {}

unsafe extern "C" fn read_reader(opaque: *mut c_void, buf: *mut u8, buf_size: c_int) -> c_int {
    if buf_size <= 0 {
        return 0;
    }
    let reader = unsafe { &mut *(opaque as *mut Box<dyn Read + Send>) };
    let buf = unsafe { std::slice::from_raw_parts_mut(buf, buf_size as usize) };
    match reader.read(buf) {
        Ok(0) => ffi::AVERROR_EOF,
        Ok(n) => n as c_int,
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
            ffi::AVERROR(ffmpeg_next::util::error::EAGAIN)
        }
        Err(e) => {
            log::error!("custom source read error: {}", e);
            ffi::AVERROR(ffmpeg_next::util::error::EIO)
        }
    }
}

impl ReaderIo {
    fn new(reader: Box<dyn Read + Send>, buffer_size: usize) -> anyhow::Result<Self> {
        let buffer_size = buffer_size.max(4096);
        let reader = Box::into_raw(Box::new(reader));
        unsafe {
            let buffer = ffi::av_malloc(buffer_size) as *mut u8;
            if buffer.is_null() {
                drop(Box::from_raw(reader));
                return Err(PipeError::Alloc("avio buffer").into());
            }
            let avio = ffi::avio_alloc_context(
                buffer,
                buffer_size as c_int,
                0,
                reader as *mut c_void,
                Some(read_reader),
                None,
                None,
            );
            if avio.is_null() {
                ffi::av_free(buffer as *mut c_void);
                drop(Box::from_raw(reader));
                return Err(PipeError::Alloc("avio context").into());
            }
            Ok(Self { avio, reader })
        }
    }
}

impl Drop for ReaderIo {
    fn drop(&mut self) {
        unsafe {
            if !self.avio.is_null() {
                // avio may have swapped its buffer, free whatever it holds now
                ffi::av_freep(&mut (*self.avio).buffer as *mut *mut u8 as *mut c_void);
                ffi::avio_context_free(&mut self.avio);
            }
            if !self.reader.is_null() {
                drop(Box::from_raw(self.reader));
                self.reader = ptr::null_mut();
            }
        }
    }
}

struct Opened {
    // declared before `io` so the format context closes first
    input: ffmpeg_next::format::context::Input,
    io: Option<ReaderIo>,
    streams: Vec<StreamDescriptor>,
    at_end: bool,
}

unsafe impl Send for Opened {}

/// Container/device reader producing packets in container order.
pub struct Demuxer {
    opened: Option<Opened>,
}

impl Default for Demuxer {
    fn default() -> Self {
        Self::new()
    }
}

impl Demuxer {
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

    /// Resolve input format by name (e.g. "dshow", "v4l2", "lavfi").
    fn find_input_format(name: &str) -> anyhow::Result<*const ffi::AVInputFormat> {
        let cname = CString::new(name)
            .map_err(|e| anyhow::anyhow!("invalid format name {:?}: {}", name, e))?;
        let ptr = unsafe { ffi::av_find_input_format(cname.as_ptr()) };
        if ptr.is_null() {
            return Err(PipeError::Unsupported(format!("input format not found: {}", name)).into());
        }
        Ok(ptr as *const ffi::AVInputFormat)
    }

    fn dictionary(options: &HashMap<String, String>) -> Dictionary<'static> {
        let mut dict = Dictionary::new();
        for (key, value) in options {
            dict.set(key, value);
        }
        dict
    }

    /// Opens `source`. `format` forces a demuxer/device (e.g. "dshow");
    /// `options` are handed to the backend unvalidated.
    pub fn open(
        &mut self,
        source: Source,
        format: Option<&str>,
        options: &HashMap<String, String>,
    ) -> anyhow::Result<()> {
        if self.opened.is_some() {
            return Err(invalid_state("demuxer", Status::Running, Status::Stopped));
        }

        let (input, io) = match source {
            Source::Url(url) => (Self::open_url(&url, format, options)?, None),
            Source::Reader {
                reader,
                buffer_size,
            } => {
                let io = ReaderIo::new(reader, buffer_size)?;
                (Self::open_reader(&io, format, options)?, Some(io))
            }
        };

        let streams: Vec<StreamDescriptor> = input.streams().map(StreamDescriptor::from).collect();
        for stream in &streams {
            log::info!(
                "demuxer stream index: {}, codec: {:?}, time_base: {}/{}",
                stream.index(),
                stream.codec_id(),
                stream.time_base().numerator(),
                stream.time_base().denominator()
            );
        }

        self.opened = Some(Opened {
            input,
            io,
            streams,
            at_end: false,
        });
        Ok(())
    }

    fn open_url(
        url: &str,
        format: Option<&str>,
        options: &HashMap<String, String>,
    ) -> anyhow::Result<ffmpeg_next::format::context::Input> {
        use ffmpeg_next::format::format::Format;

        let path = Path::new(url);
        let opts = Self::dictionary(options);
        let input = match format {
            Some(name) => {
                let fmt = Self::find_input_format(name)?;
                let fmt = unsafe { ffmpeg_next::format::format::Input::wrap(fmt as *mut _) };
                ffmpeg_next::format::open_with(path, &Format::Input(fmt), opts)?.input()
            }
            None => ffmpeg_next::format::input_with_dictionary(path, opts)?,
        };
        Ok(input)
    }

    fn open_reader(
        io: &ReaderIo,
        format: Option<&str>,
        options: &HashMap<String, String>,
    ) -> anyhow::Result<ffmpeg_next::format::context::Input> {
        let fmt = match format {
            Some(name) => Self::find_input_format(name)?,
            None => ptr::null(),
        };

        unsafe {
            let mut ctx = ffi::avformat_alloc_context();
            if ctx.is_null() {
                return Err(PipeError::Alloc("format context").into());
            }
            (*ctx).pb = io.avio;
            (*ctx).flags |= ffi::AVFMT_FLAG_CUSTOM_IO as c_int;

            let mut opts = Self::dictionary(options).disown();
            let ret = ffi::avformat_open_input(&mut ctx, ptr::null(), fmt as _, &mut opts);
            Dictionary::own(opts);
            // avformat_open_input frees the context on failure
            check(ret, "avformat_open_input")?;

            let ret = ffi::avformat_find_stream_info(ctx, ptr::null_mut());
            if ret < 0 {
                ffi::avformat_close_input(&mut ctx);
                check(ret, "avformat_find_stream_info")?;
            }
            Ok(ffmpeg_next::format::context::Input::wrap(ctx))
        }
    }

    fn running(&self) -> anyhow::Result<&Opened> {
        self.opened
            .as_ref()
            .ok_or_else(|| invalid_state("demuxer", Status::Stopped, Status::Running))
    }

    fn running_mut(&mut self) -> anyhow::Result<&mut Opened> {
        self.opened
            .as_mut()
            .ok_or_else(|| invalid_state("demuxer", Status::Stopped, Status::Running))
    }

    /// Next packet in container order.
    ///
    /// Returns `Again` when a live source has nothing ready yet; the caller
    /// decides whether to retry. Once the source is exhausted every call
    /// returns `Eof`.
    pub fn read_packet(&mut self) -> anyhow::Result<CodecOutput<Packet>> {
        let opened = self.running_mut()?;
        if opened.at_end {
            return Ok(CodecOutput::Eof);
        }

        let mut packet = ffmpeg_next::Packet::empty();
        match packet.read(&mut opened.input) {
            Ok(()) => {}
            Err(ffmpeg_next::Error::Eof) => {
                opened.at_end = true;
                return Ok(CodecOutput::Eof);
            }
            Err(e) if is_again(&e) => return Ok(CodecOutput::Again),
            Err(e) => return Err(e.into()),
        }

        let time_base = match opened.streams.get(packet.stream()) {
            Some(stream) => stream.time_base(),
            None => opened
                .input
                .stream(packet.stream())
                .map(|s| s.time_base())
                .ok_or_else(|| anyhow::anyhow!("packet for unknown stream {}", packet.stream()))?,
        };
        Ok(CodecOutput::Data(Packet::from((packet, time_base))))
    }

    /// Container end expressed in `time_base`, if the container knows it.
    fn end_in(opened: &Opened, time_base: Rational) -> Option<i64> {
        let duration = opened.input.duration();
        if duration == ffi::AV_NOPTS_VALUE || duration <= 0 {
            return None;
        }
        let start = unsafe { (*opened.input.as_ptr()).start_time };
        let start = if start == ffi::AV_NOPTS_VALUE { 0 } else { start };
        Some((start + duration).rescale(TIME_BASE, time_base))
    }

    /// Repositions to the closest keyframe at or before `timestamp`
    /// (in the stream's time base). Seeking past the end is accepted and
    /// makes the next read report end of stream.
    pub fn seek_frame(&mut self, stream_index: usize, timestamp: i64) -> anyhow::Result<()> {
        let opened = self.running_mut()?;
        let time_base = opened
            .streams
            .get(stream_index)
            .map(|s| s.time_base())
            .ok_or_else(|| PipeError::Unsupported(format!("no stream {}", stream_index)))?;

        if let Some(end) = Self::end_in(opened, time_base) {
            if timestamp >= end {
                log::debug!("seek to {} beyond end {}, stream {}", timestamp, end, stream_index);
                opened.at_end = true;
                return Ok(());
            }
        }

        let ret = unsafe {
            ffi::av_seek_frame(
                opened.input.as_mut_ptr(),
                stream_index as c_int,
                timestamp,
                ffi::AVSEEK_FLAG_BACKWARD as c_int,
            )
        };
        check(ret, "av_seek_frame")?;
        opened.at_end = false;
        Ok(())
    }

    pub fn streams(&self) -> anyhow::Result<&[StreamDescriptor]> {
        Ok(&self.running()?.streams)
    }

    pub fn stream(&self, index: usize) -> anyhow::Result<&StreamDescriptor> {
        self.running()?
            .streams
            .get(index)
            .ok_or_else(|| PipeError::Unsupported(format!("no stream {}", index)).into())
    }

    /// Container duration rescaled to `target`; `None` when unknown (live sources).
    pub fn duration(&self, target: Rational) -> anyhow::Result<Option<i64>> {
        let opened = self.running()?;
        let duration = opened.input.duration();
        if duration == ffi::AV_NOPTS_VALUE || duration < 0 {
            return Ok(None);
        }
        Ok(Some(duration.rescale(TIME_BASE, target)))
    }

    pub fn stream_indices(&self) -> anyhow::Result<StreamIndices> {
        let opened = self.running()?;
        let mut indices = StreamIndices::default();
        for stream in &opened.streams {
            if stream.is_video() {
                indices.video.push(stream.index());
            } else if stream.is_audio() {
                indices.audio.push(stream.index());
            }
        }
        Ok(indices)
    }

    pub fn format_name(&self) -> anyhow::Result<String> {
        Ok(self.running()?.input.format().name().to_string())
    }

    pub fn bit_rate(&self) -> anyhow::Result<i64> {
        Ok(self.running()?.input.bit_rate())
    }

    pub fn is_custom_io(&self) -> bool {
        self.opened.as_ref().is_some_and(|o| o.io.is_some())
    }

    /// Releases everything; always succeeds, also when already stopped.
    pub fn cleanup(&mut self) {
        if self.opened.take().is_some() {
            log::debug!("demuxer closed");
        }
    }
}
