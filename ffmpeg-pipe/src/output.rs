use std::io::Write;

use ffmpeg_next::{Rational, ffi};

use crate::{
    encoder::Encoder,
    error::{PipeError, Status, invalid_state},
    packet::Packet,
};

struct Opened {
    inner: ffmpeg_next::format::context::Output,
    destination: String,
    have_written_header: bool,
    have_written_trailer: bool,
}

/// Container writer.
///
/// Call order is `create_output`, `create_stream` for every stream,
/// `write_header`, then `write_packet` with packets already rescaled to
/// [`Muxer::time_base`] of their stream, and finally `finish`/`cleanup`.
pub struct Muxer {
    opened: Option<Opened>,
}

unsafe impl Send for Muxer {}

impl Default for Muxer {
    fn default() -> Self {
        Self::new()
    }
}

impl Muxer {
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

    /// Opens `destination`, inferring the container from its name unless
    /// `format` names one (e.g. "mpegts" for a pipe).
    pub fn create_output(&mut self, destination: &str, format: Option<&str>) -> anyhow::Result<()> {
        if self.opened.is_some() {
            return Err(invalid_state("muxer", Status::Running, Status::Stopped));
        }
        let inner = match format {
            Some(format) => ffmpeg_next::format::output_as(destination, format)?,
            None => ffmpeg_next::format::output(destination)?,
        };
        log::info!("muxer output {} ({})", destination, inner.format().name());
        self.opened = Some(Opened {
            inner,
            destination: destination.to_string(),
            have_written_header: false,
            have_written_trailer: false,
        });
        Ok(())
    }

    fn running(&self) -> anyhow::Result<&Opened> {
        self.opened
            .as_ref()
            .ok_or_else(|| invalid_state("muxer", Status::Stopped, Status::Running))
    }

    fn running_mut(&mut self) -> anyhow::Result<&mut Opened> {
        self.opened
            .as_mut()
            .ok_or_else(|| invalid_state("muxer", Status::Stopped, Status::Running))
    }

    /// Whether encoders feeding this container must be opened with
    /// global headers.
    pub fn needs_global_header(&self) -> anyhow::Result<bool> {
        let opened = self.running()?;
        let flags = unsafe { (*(*opened.inner.as_ptr()).oformat).flags };
        Ok(flags & ffi::AVFMT_GLOBALHEADER as i32 != 0)
    }

    /// Registers `encoder`'s output as a new stream and returns its index.
    pub fn create_stream(&mut self, encoder: &Encoder) -> anyhow::Result<usize> {
        let opened = self.running_mut()?;
        if opened.have_written_header {
            return Err(PipeError::Ordering("create_stream after write_header").into());
        }
        let parameters = encoder.codec_parameters()?;
        let time_base = encoder.time_base()?;

        let mut writer_stream = opened
            .inner
            .add_stream(ffmpeg_next::encoder::find(parameters.id()))?;
        writer_stream.set_parameters(parameters);
        writer_stream.set_time_base(time_base);
        unsafe {
            // let the container pick its own tag for the codec
            (*(*writer_stream.as_mut_ptr()).codecpar).codec_tag = 0;
        }
        let index = writer_stream.index();
        log::debug!("muxer stream {} from {}", index, encoder.codec_name()?);
        Ok(index)
    }

    pub fn write_header(&mut self) -> anyhow::Result<()> {
        let opened = self.running_mut()?;
        if opened.have_written_header {
            return Err(PipeError::Ordering("write_header called twice").into());
        }
        if opened.inner.nb_streams() == 0 {
            return Err(PipeError::Ordering("write_header before any create_stream").into());
        }
        opened.inner.write_header()?;
        opened.have_written_header = true;
        for stream in opened.inner.streams() {
            let tb = stream.time_base();
            log::info!(
                "{} stream {} time_base: {}/{}",
                opened.destination,
                stream.index(),
                tb.numerator(),
                tb.denominator()
            );
        }
        Ok(())
    }

    /// Time base the container picked for stream `index`. Only final once
    /// the header is written.
    pub fn time_base(&self, index: usize) -> anyhow::Result<Rational> {
        let opened = self.running()?;
        if !opened.have_written_header {
            return Err(PipeError::Ordering("time_base before write_header").into());
        }
        opened
            .inner
            .stream(index)
            .map(|s| s.time_base())
            .ok_or_else(|| PipeError::Unsupported(format!("no output stream {}", index)).into())
    }

    pub fn stream_count(&self) -> anyhow::Result<usize> {
        Ok(self.running()?.inner.nb_streams() as usize)
    }

    /// Writes `packet` to the stream named by its index, interleaving by dts.
    pub fn write_packet(&mut self, mut packet: Packet) -> anyhow::Result<()> {
        let opened = self.running_mut()?;
        if !opened.have_written_header {
            return Err(PipeError::Ordering("write_packet before write_header").into());
        }
        if opened.have_written_trailer {
            return Err(PipeError::Ordering("write_packet after finish").into());
        }
        let expected = opened
            .inner
            .stream(packet.index())
            .map(|s| s.time_base())
            .ok_or_else(|| PipeError::Unsupported(format!("no output stream {}", packet.index())))?;
        if packet.time_base() != expected {
            return Err(PipeError::TimeBaseMismatch {
                expected,
                actual: packet.time_base(),
            }
            .into());
        }

        let p = packet.as_inner_mut();
        p.set_position(-1);
        p.write_interleaved(&mut opened.inner)?;
        Ok(())
    }

    /// Writes the trailer. Further packets are refused.
    pub fn finish(&mut self) -> anyhow::Result<()> {
        let opened = self.running_mut()?;
        if opened.have_written_header && !opened.have_written_trailer {
            opened.have_written_trailer = true;
            opened.inner.write_trailer()?;
        }
        Ok(())
    }

    /// Writes a pending trailer and closes the output.
    pub fn cleanup(&mut self) {
        if self.opened.is_some() {
            if let Err(e) = self.finish() {
                log::error!("muxer trailer failed: {}", e);
            }
        }
        self.opened = None;
    }
}

impl Drop for Muxer {
    fn drop(&mut self) {
        self.cleanup();
    }
}

/// Destination for encoded packets.
pub trait PacketSink: Send {
    /// Registers an encoder and returns the sink-side stream index.
    fn add_stream(&mut self, encoder: &Encoder) -> anyhow::Result<usize>;

    /// Called once all streams are registered.
    fn start(&mut self) -> anyhow::Result<()>;

    /// `packet` is in its encoder's time base.
    fn write(&mut self, index: usize, packet: Packet) -> anyhow::Result<()>;

    fn finish(&mut self) -> anyhow::Result<()>;

    fn needs_global_header(&self) -> bool {
        false
    }
}

/// Sink that muxes into a container, rescaling each packet to its stream.
pub struct MuxSink {
    muxer: Muxer,
}

impl MuxSink {
    pub fn create(destination: &str, format: Option<&str>) -> anyhow::Result<Self> {
        let mut muxer = Muxer::new();
        muxer.create_output(destination, format)?;
        Ok(Self { muxer })
    }
}

impl PacketSink for MuxSink {
    fn add_stream(&mut self, encoder: &Encoder) -> anyhow::Result<usize> {
        self.muxer.create_stream(encoder)
    }

    fn start(&mut self) -> anyhow::Result<()> {
        self.muxer.write_header()
    }

    fn write(&mut self, index: usize, mut packet: Packet) -> anyhow::Result<()> {
        packet.rescale_ts(self.muxer.time_base(index)?);
        packet.set_index(index);
        self.muxer.write_packet(packet)
    }

    fn finish(&mut self) -> anyhow::Result<()> {
        self.muxer.finish()?;
        self.muxer.cleanup();
        Ok(())
    }

    fn needs_global_header(&self) -> bool {
        self.muxer.needs_global_header().unwrap_or(false)
    }
}

/// Sink that writes the bare elementary stream of a single encoder,
/// e.g. a `.264` or `.mp3` file.
pub struct RawSink<W: Write + Send> {
    writer: W,
    streams: usize,
    bytes: u64,
}

impl<W: Write + Send> RawSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            streams: 0,
            bytes: 0,
        }
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write + Send> PacketSink for RawSink<W> {
    fn add_stream(&mut self, _encoder: &Encoder) -> anyhow::Result<usize> {
        if self.streams > 0 {
            return Err(
                PipeError::Unsupported("raw sink carries a single stream".to_string()).into(),
            );
        }
        self.streams += 1;
        Ok(0)
    }

    fn start(&mut self) -> anyhow::Result<()> {
        if self.streams == 0 {
            return Err(PipeError::Ordering("raw sink started without a stream").into());
        }
        Ok(())
    }

    fn write(&mut self, _index: usize, packet: Packet) -> anyhow::Result<()> {
        self.writer.write_all(packet.data())?;
        self.bytes += packet.size() as u64;
        Ok(())
    }

    fn finish(&mut self) -> anyhow::Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}
