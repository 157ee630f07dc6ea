//! Live capture: demux, decode, convert, encode and store on a worker thread.
//!
//! The controller opens every adapter, then moves them into a worker that
//! loops until the source ends or the stop token is cancelled. The worker
//! hands its state back through the join handle, so the final drain
//! (leftover samples, encoder flush, trailer) runs on the controller thread
//! only after the worker has exited.

use std::fs::File;
use std::io::BufWriter;
use std::thread::JoinHandle;
use std::time::Duration;

use ffmpeg_next::{ChannelLayout, Rational};
use tokio_util::sync::CancellationToken;

use crate::{
    config::{AudioEncodeConfig, CaptureConfig, SinkConfig, VideoEncodeConfig},
    decoder::Decoder,
    encoder::Encoder,
    error::{CodecOutput, PipeError},
    fifo::SampleFifo,
    frame::{AudioFrame, Frame, VideoFrame},
    input::{Demuxer, Source},
    output::{MuxSink, PacketSink, RawSink},
    packet::Packet,
    resampler::{AudioShape, Resampler},
    scaler::Scaler,
    stream::{StreamDescriptor, rescale},
};

/// Pause before asking a source that had nothing ready for another packet.
const RETRY_INTERVAL: Duration = Duration::from_millis(1);

/// Counters reported when a capture ends.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaptureStats {
    pub packets_read: u64,
    pub video_frames_encoded: u64,
    pub audio_frames_encoded: u64,
    pub packets_written: u64,
    /// Samples that entered the leveling fifo.
    pub samples_buffered: u64,
    /// Samples taken out of the fifo for encoding.
    pub samples_encoded: u64,
    /// Samples resident in the fifo when the worker stopped.
    pub samples_left_at_stop: u64,
    /// The source ran out before a stop was requested.
    pub end_of_source: bool,
}

fn write_available(
    encoder: &mut Encoder,
    sink: &mut dyn PacketSink,
    index: usize,
    stats: &mut CaptureStats,
) -> anyhow::Result<()> {
    while let CodecOutput::Data(packet) = encoder.get_packet()? {
        sink.write(index, packet)?;
        stats.packets_written += 1;
    }
    Ok(())
}

/// Pulls every delayed packet out of a drained encoder.
fn write_remaining(
    encoder: &mut Encoder,
    sink: &mut dyn PacketSink,
    index: usize,
    stats: &mut CaptureStats,
) -> anyhow::Result<()> {
    loop {
        match encoder.get_packet()? {
            CodecOutput::Data(packet) => {
                sink.write(index, packet)?;
                stats.packets_written += 1;
            }
            CodecOutput::Eof => return Ok(()),
            CodecOutput::Again => {
                log::warn!("encoder asked for input while draining");
                return Ok(());
            }
        }
    }
}

struct VideoPath {
    stream_index: usize,
    stream_time_base: Rational,
    decoder: Decoder,
    scaler: Scaler,
    encoder: Encoder,
    encoder_time_base: Rational,
    sink_index: usize,
    /// First rescaled source pts; output video starts at zero like audio.
    origin: Option<i64>,
    last_pts: Option<i64>,
}

impl VideoPath {
    fn open(
        stream: &StreamDescriptor,
        config: &VideoEncodeConfig,
        sink: &mut dyn PacketSink,
    ) -> anyhow::Result<Self> {
        let mut decoder = Decoder::new();
        decoder.copy_param(stream.parameters(), stream.time_base(), config.hwaccel)?;

        let settings = config.settings(stream, sink.needs_global_header())?;
        let mut encoder = Encoder::new();
        encoder.set_video_param(&settings)?;
        let sink_index = sink.add_stream(&encoder)?;

        Ok(Self {
            stream_index: stream.index(),
            stream_time_base: stream.time_base(),
            decoder,
            scaler: Scaler::new(),
            encoder_time_base: encoder.time_base()?,
            encoder,
            sink_index,
            origin: None,
            last_pts: None,
        })
    }

    fn decode(
        &mut self,
        packet: Option<&Packet>,
        sink: &mut dyn PacketSink,
        stats: &mut CaptureStats,
    ) -> anyhow::Result<()> {
        let mut out = self.decoder.decode(packet)?;
        while let CodecOutput::Data(frame) = out {
            self.encode(frame, sink, stats)?;
            out = self.decoder.receive_frame()?;
        }
        Ok(())
    }

    fn encode(
        &mut self,
        frame: Frame,
        sink: &mut dyn PacketSink,
        stats: &mut CaptureStats,
    ) -> anyhow::Result<()> {
        let frame = match frame {
            Frame::Video(frame) => frame,
            Frame::Hardware(frame) => frame.transfer()?,
            Frame::Audio(_) => return Ok(()),
        };
        let mut frame = self.convert(frame)?;

        // rescaled source timing from zero, forced strictly increasing
        let pts = match frame.pts() {
            Some(pts) => {
                let pts = rescale(pts, self.stream_time_base, self.encoder_time_base);
                pts - *self.origin.get_or_insert(pts)
            }
            None => self.last_pts.map_or(0, |last| last + 1),
        };
        let pts = match self.last_pts {
            Some(last) if pts <= last => last + 1,
            _ => pts,
        };
        self.last_pts = Some(pts);
        frame.set_pts(Some(pts));

        self.encoder.push_frame(Some(&Frame::Video(frame)))?;
        stats.video_frames_encoded += 1;
        write_available(&mut self.encoder, sink, self.sink_index, stats)
    }

    /// Converts to the encoder's pixel format and size when they differ.
    fn convert(&mut self, frame: VideoFrame) -> anyhow::Result<VideoFrame> {
        let (format, width, height) = self.encoder.picture()?;
        if frame.format() == format && frame.width() == width && frame.height() == height {
            return Ok(frame);
        }
        if !self.scaler.accepts(&frame) {
            self.scaler.cleanup();
            self.scaler
                .create_sws(frame.format(), frame.width(), frame.height(), format, width, height)?;
        }
        self.scaler.run(&frame)
    }

    fn drain(&mut self, sink: &mut dyn PacketSink, stats: &mut CaptureStats) -> anyhow::Result<()> {
        loop {
            match self.decoder.decode(None)? {
                CodecOutput::Data(frame) => self.encode(frame, sink, stats)?,
                CodecOutput::Again => continue,
                CodecOutput::Eof => break,
            }
        }
        self.encoder.push_frame(None)?;
        write_remaining(&mut self.encoder, sink, self.sink_index, stats)
    }

    fn cleanup(&mut self) {
        self.decoder.cleanup();
        self.scaler.cleanup();
        self.encoder.cleanup();
    }
}

struct AudioPath {
    stream_index: usize,
    source_channels: u32,
    decoder: Decoder,
    resampler: Resampler,
    fifo: SampleFifo,
    encoder: Encoder,
    target: AudioShape,
    frame_size: usize,
    encoder_time_base: Rational,
    sink_index: usize,
    next_sample: i64,
}

impl AudioPath {
    fn open(
        stream: &StreamDescriptor,
        config: &AudioEncodeConfig,
        sink: &mut dyn PacketSink,
    ) -> anyhow::Result<Self> {
        let mut decoder = Decoder::new();
        decoder.copy_param(stream.parameters(), stream.time_base(), None)?;

        let settings = config.settings(sink.needs_global_header())?;
        let mut encoder = Encoder::new();
        let frame_size = encoder.set_audio_param(&settings)?;
        let sink_index = sink.add_stream(&encoder)?;
        let target = AudioShape {
            layout: settings.layout,
            rate: settings.sample_rate,
            format: settings.sample_format,
        };

        Ok(Self {
            stream_index: stream.index(),
            source_channels: stream.channels(),
            decoder,
            resampler: Resampler::new(),
            fifo: SampleFifo::new(target.format, target.layout, target.rate)?,
            encoder_time_base: encoder.time_base()?,
            encoder,
            target,
            frame_size,
            sink_index,
            next_sample: 0,
        })
    }

    fn decode(
        &mut self,
        packet: Option<&Packet>,
        sink: &mut dyn PacketSink,
        stats: &mut CaptureStats,
    ) -> anyhow::Result<()> {
        let mut out = self.decoder.decode(packet)?;
        while let CodecOutput::Data(frame) = out {
            if let Frame::Audio(frame) = frame {
                self.resample(Some(&frame))?;
                self.encode_full_frames(sink, stats)?;
            }
            out = self.decoder.receive_frame()?;
        }
        Ok(())
    }

    fn source_shape(&self, frame: &AudioFrame) -> AudioShape {
        let layout = if frame.channel_layout().is_empty() {
            ChannelLayout::default(self.source_channels.max(1) as i32)
        } else {
            frame.channel_layout()
        };
        AudioShape {
            layout,
            rate: frame.rate(),
            format: frame.format(),
        }
    }

    /// Resamples `frame` (or flushes with `None`) into the fifo.
    fn resample(&mut self, frame: Option<&AudioFrame>) -> anyhow::Result<usize> {
        if let Some(frame) = frame {
            let shape = self.source_shape(frame);
            let current = self.resampler.source().ok();
            if current != Some(shape) {
                if let Some(previous) = current {
                    let tail = self.flush_resampler()?;
                    log::info!(
                        "audio input changed from {:?} to {:?}, flushed {} samples",
                        previous,
                        shape,
                        tail
                    );
                }
                self.resampler.cleanup();
                self.resampler.create_swr(shape, self.target)?;
            }
        } else if self.resampler.source().is_err() {
            return Ok(0);
        }

        let input = frame.map_or(0, AudioFrame::samples);
        let capacity = self.resampler.max_output(input)?.max(1);
        let mut out = AudioFrame::alloc(self.target.format, capacity, self.target.layout)?;
        let produced = self.resampler.convert(frame, &mut out)?;
        self.fifo.write(&out, produced)?;
        Ok(produced)
    }

    /// Moves whatever the resampler still holds into the fifo.
    fn flush_resampler(&mut self) -> anyhow::Result<usize> {
        let mut total = 0;
        loop {
            let produced = self.resample(None)?;
            if produced == 0 {
                return Ok(total);
            }
            total += produced;
        }
    }

    fn encode_fifo_frame(
        &mut self,
        mut frame: AudioFrame,
        sink: &mut dyn PacketSink,
        stats: &mut CaptureStats,
    ) -> anyhow::Result<()> {
        let sample_base = Rational::new(1, self.target.rate as i32);
        let pts = rescale(self.next_sample, sample_base, self.encoder_time_base);
        self.next_sample += frame.samples() as i64;
        frame.set_pts(Some(pts));
        self.encoder.push_frame(Some(&Frame::Audio(frame)))?;
        stats.audio_frames_encoded += 1;
        write_available(&mut self.encoder, sink, self.sink_index, stats)
    }

    fn encode_full_frames(
        &mut self,
        sink: &mut dyn PacketSink,
        stats: &mut CaptureStats,
    ) -> anyhow::Result<()> {
        while let Some(frame) = self.fifo.read_full(self.frame_size)? {
            self.encode_fifo_frame(frame, sink, stats)?;
        }
        Ok(())
    }

    /// Empties decoder, resampler and fifo, then flushes the encoder.
    fn drain(&mut self, sink: &mut dyn PacketSink, stats: &mut CaptureStats) -> anyhow::Result<()> {
        loop {
            match self.decoder.decode(None)? {
                CodecOutput::Data(Frame::Audio(frame)) => {
                    self.resample(Some(&frame))?;
                }
                CodecOutput::Data(_) | CodecOutput::Again => continue,
                CodecOutput::Eof => break,
            }
        }
        self.flush_resampler()?;

        self.encode_full_frames(sink, stats)?;
        // the last frame may be short
        while let Some(frame) = self.fifo.read(self.frame_size)? {
            self.encode_fifo_frame(frame, sink, stats)?;
        }
        self.encoder.push_frame(None)?;
        write_remaining(&mut self.encoder, sink, self.sink_index, stats)
    }

    fn cleanup(&mut self) {
        self.decoder.cleanup();
        self.resampler.cleanup();
        self.encoder.cleanup();
    }
}

/// Everything the worker thread owns while running.
struct Worker {
    demuxer: Demuxer,
    video: Option<VideoPath>,
    audio: Option<AudioPath>,
    sink: Box<dyn PacketSink>,
    stats: CaptureStats,
}

impl Worker {
    fn run(&mut self, cancel: &CancellationToken) -> anyhow::Result<()> {
        while !cancel.is_cancelled() {
            match self.demuxer.read_packet()? {
                CodecOutput::Data(packet) => {
                    self.stats.packets_read += 1;
                    self.process(&packet)?;
                }
                // live source with nothing ready, check the token again
                CodecOutput::Again => std::thread::sleep(RETRY_INTERVAL),
                CodecOutput::Eof => {
                    log::info!("capture source reached end of stream");
                    self.stats.end_of_source = true;
                    break;
                }
            }
        }
        Ok(())
    }

    fn process(&mut self, packet: &Packet) -> anyhow::Result<()> {
        let sink = self.sink.as_mut();
        if let Some(video) = self.video.as_mut().filter(|v| v.stream_index == packet.index()) {
            return video.decode(Some(packet), sink, &mut self.stats);
        }
        if let Some(audio) = self.audio.as_mut().filter(|a| a.stream_index == packet.index()) {
            return audio.decode(Some(packet), sink, &mut self.stats);
        }
        Ok(())
    }

    /// Runs on the controller after the worker thread has been joined.
    fn drain(&mut self) -> anyhow::Result<()> {
        let sink = self.sink.as_mut();
        if let Some(audio) = self.audio.as_mut() {
            self.stats.samples_left_at_stop = audio.fifo.len() as u64;
            audio.drain(sink, &mut self.stats)?;
            self.stats.samples_buffered = audio.fifo.total_written();
            self.stats.samples_encoded = audio.fifo.total_read();
        }
        if let Some(video) = self.video.as_mut() {
            video.drain(sink, &mut self.stats)?;
        }
        sink.finish()
    }

    fn cleanup(&mut self) {
        if let Some(video) = self.video.as_mut() {
            video.cleanup();
        }
        if let Some(audio) = self.audio.as_mut() {
            audio.cleanup();
        }
        self.demuxer.cleanup();
    }
}

fn open_sink(config: &SinkConfig) -> anyhow::Result<Box<dyn PacketSink>> {
    let sink: Box<dyn PacketSink> = match config {
        SinkConfig::File { path, format } => {
            Box::new(MuxSink::create(&path.to_string_lossy(), format.as_deref())?)
        }
        SinkConfig::Raw { path } => Box::new(RawSink::new(BufWriter::new(File::create(path)?))),
    };
    Ok(sink)
}

fn pick_stream(wanted: Option<usize>, candidates: &[usize], kind: &str) -> anyhow::Result<usize> {
    match wanted {
        Some(index) if candidates.contains(&index) => Ok(index),
        Some(index) => {
            Err(PipeError::Unsupported(format!("stream {} is not a {} stream", index, kind)).into())
        }
        None => candidates
            .first()
            .copied()
            .ok_or_else(|| PipeError::Unsupported(format!("source has no {} stream", kind)).into()),
    }
}

pub struct Capture;

impl Capture {
    /// Opens source, codecs and sink, then starts the worker thread.
    pub fn start(config: CaptureConfig) -> anyhow::Result<CaptureHandle> {
        if config.video.is_none() && config.audio.is_none() {
            return Err(
                PipeError::Unsupported("capture needs a video or audio section".to_string()).into(),
            );
        }

        let mut demuxer = Demuxer::new();
        demuxer.open(
            Source::url(config.source.url.clone()),
            config.source.format.as_deref(),
            &config.source.options,
        )?;
        let indices = demuxer.stream_indices()?;

        let mut sink = open_sink(&config.sink)?;
        let video = match &config.video {
            Some(video_config) => {
                let index = pick_stream(config.source.video_stream, &indices.video, "video")?;
                let stream = demuxer.stream(index)?.clone();
                Some(VideoPath::open(&stream, video_config, sink.as_mut())?)
            }
            None => None,
        };
        let audio = match &config.audio {
            Some(audio_config) => {
                let index = pick_stream(config.source.audio_stream, &indices.audio, "audio")?;
                let stream = demuxer.stream(index)?.clone();
                Some(AudioPath::open(&stream, audio_config, sink.as_mut())?)
            }
            None => None,
        };
        sink.start()?;

        let mut worker = Worker {
            demuxer,
            video,
            audio,
            sink,
            stats: CaptureStats::default(),
        };

        let cancel = CancellationToken::new();
        let done = CancellationToken::new();
        let worker_cancel = cancel.clone();
        let worker_done = done.clone();
        let handle = std::thread::Builder::new()
            .name("capture".to_string())
            .spawn(move || {
                let result = worker.run(&worker_cancel);
                if let Err(e) = &result {
                    log::error!("capture worker failed: {:#}", e);
                }
                worker_done.cancel();
                (worker, result)
            })?;
        log::info!("capture started: {}", config.source.url);

        Ok(CaptureHandle {
            cancel,
            done,
            worker: Some(handle),
        })
    }
}

/// Controller side of a running capture.
pub struct CaptureHandle {
    cancel: CancellationToken,
    done: CancellationToken,
    worker: Option<JoinHandle<(Worker, anyhow::Result<()>)>>,
}

impl CaptureHandle {
    /// Token that stops the worker when cancelled, e.g. from a signal handler.
    pub fn stop_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancelled once the worker loop has exited on its own or after a stop.
    pub fn finished_token(&self) -> CancellationToken {
        self.done.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.done.is_cancelled()
    }

    /// Asks the worker to stop, then drains and closes everything.
    pub fn stop(mut self) -> anyhow::Result<CaptureStats> {
        self.cancel.cancel();
        self.finish()
    }

    /// Waits for the source to end on its own, then drains and closes.
    pub fn wait(mut self) -> anyhow::Result<CaptureStats> {
        self.finish()
    }

    fn finish(&mut self) -> anyhow::Result<CaptureStats> {
        let Some(handle) = self.worker.take() else {
            return Err(PipeError::Ordering("capture already finished").into());
        };
        let (mut worker, result) = handle
            .join()
            .map_err(|_| anyhow::anyhow!("capture worker panicked"))?;

        let drained = match result {
            Ok(()) => worker.drain(),
            Err(e) => {
                // still close the container so what was written stays readable
                if let Err(finish_err) = worker.sink.finish() {
                    log::error!("closing sink after failure: {}", finish_err);
                }
                Err(e)
            }
        };
        worker.cleanup();
        drained?;

        log::info!("capture stopped: {:?}", worker.stats);
        Ok(worker.stats)
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        if self.worker.is_some() {
            self.cancel.cancel();
            if let Err(e) = self.finish() {
                log::error!("capture shutdown failed: {:#}", e);
            }
        }
    }
}

#[cfg(test)]
#[path = "capture_test.rs"]
mod capture_test;
