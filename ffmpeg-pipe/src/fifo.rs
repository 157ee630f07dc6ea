use std::{ffi::c_void, ptr::NonNull};

use ffmpeg_next::{
    ChannelLayout,
    ffi::{
        AVAudioFifo, AVSampleFormat, av_audio_fifo_alloc, av_audio_fifo_free, av_audio_fifo_read,
        av_audio_fifo_size, av_audio_fifo_write,
    },
    format::Sample,
};

use crate::{
    error::{PipeError, check},
    frame::AudioFrame,
};

/// First-in first-out sample store that levels variable-sized resampler
/// output into the fixed frame size an encoder asks for.
///
/// Keeps lifetime counters so that `total_written == total_read + len`
/// holds at any point.
pub struct SampleFifo {
    fifo: NonNull<AVAudioFifo>,
    format: Sample,
    layout: ChannelLayout,
    rate: u32,
    total_written: u64,
    total_read: u64,
}

// The fifo is owned exclusively and only touched through `&mut self`.
unsafe impl Send for SampleFifo {}

impl SampleFifo {
    pub fn new(format: Sample, layout: ChannelLayout, rate: u32) -> anyhow::Result<Self> {
        let channels = layout.channels().max(1);
        let fifo = unsafe { av_audio_fifo_alloc(AVSampleFormat::from(format), channels, 1) };
        let fifo = NonNull::new(fifo).ok_or(PipeError::Alloc("audio fifo"))?;
        Ok(Self {
            fifo,
            format,
            layout,
            rate,
            total_written: 0,
            total_read: 0,
        })
    }

    /// Resident samples per channel.
    pub fn len(&self) -> usize {
        unsafe { av_audio_fifo_size(self.fifo.as_ptr()) }.max(0) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_written(&self) -> u64 {
        self.total_written
    }

    pub fn total_read(&self) -> u64 {
        self.total_read
    }

    /// Appends the first `samples` samples of `frame`.
    pub fn write(&mut self, frame: &AudioFrame, samples: usize) -> anyhow::Result<()> {
        if frame.format() != self.format || frame.channel_layout() != self.layout {
            return Err(PipeError::Unsupported(format!(
                "fifo holds {:?} {:?}, frame is {:?} {:?}",
                self.format,
                self.layout,
                frame.format(),
                frame.channel_layout()
            ))
            .into());
        }
        if samples > frame.samples() {
            return Err(PipeError::Unsupported(format!(
                "cannot take {} samples from a {} sample frame",
                samples,
                frame.samples()
            ))
            .into());
        }
        if samples == 0 {
            return Ok(());
        }
        let written = unsafe {
            let data = (*frame.as_ptr()).extended_data as *mut *mut c_void;
            av_audio_fifo_write(self.fifo.as_ptr(), data as _, samples as i32)
        };
        check(written, "av_audio_fifo_write")?;
        if written as usize != samples {
            return Err(PipeError::Alloc("audio fifo").into());
        }
        self.total_written += samples as u64;
        Ok(())
    }

    /// Removes up to `samples` samples as a new frame, `None` when empty.
    pub fn read(&mut self, samples: usize) -> anyhow::Result<Option<AudioFrame>> {
        let count = samples.min(self.len());
        if count == 0 {
            return Ok(None);
        }
        let mut frame = AudioFrame::alloc(self.format, count, self.layout)?;
        frame.set_rate(self.rate);
        frame.make_writable()?;
        let read = unsafe {
            let data = (*frame.as_mut_ptr()).extended_data as *mut *mut c_void;
            av_audio_fifo_read(self.fifo.as_ptr(), data as _, count as i32)
        };
        check(read, "av_audio_fifo_read")?;
        if read as usize != count {
            return Err(PipeError::Ordering("audio fifo returned a short read").into());
        }
        self.total_read += count as u64;
        Ok(Some(frame))
    }

    /// Removes exactly `samples` samples, or nothing if fewer are resident.
    pub fn read_full(&mut self, samples: usize) -> anyhow::Result<Option<AudioFrame>> {
        if samples == 0 || self.len() < samples {
            return Ok(None);
        }
        self.read(samples)
    }
}

impl Drop for SampleFifo {
    fn drop(&mut self) {
        unsafe { av_audio_fifo_free(self.fifo.as_ptr()) };
    }
}
