use std::ffi::c_int;
use std::ptr;

use ffmpeg_next::{ChannelLayout, format::Sample, software::resampling};

use crate::{
    error::{PipeError, Status, check, invalid_state},
    frame::AudioFrame,
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AudioShape {
    pub layout: ChannelLayout,
    pub rate: u32,
    pub format: Sample,
}

struct Opened {
    context: resampling::Context,
    src: AudioShape,
    dst: AudioShape,
}

/// Sample format / layout / rate converter.
///
/// Output cadence does not follow input cadence: when rates differ, part of
/// every input block stays buffered inside the converter, so one call may
/// produce fewer samples than the destination can hold. Pass `None` as
/// input to flush what is left.
pub struct Resampler {
    opened: Option<Opened>,
}

unsafe impl Send for Resampler {}

impl Default for Resampler {
    fn default() -> Self {
        Self::new()
    }
}

impl Resampler {
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

    pub fn create_swr(&mut self, src: AudioShape, dst: AudioShape) -> anyhow::Result<()> {
        if self.opened.is_some() {
            return Err(invalid_state("resampler", Status::Running, Status::Stopped));
        }
        let context = resampling::Context::get(
            src.format,
            src.layout,
            src.rate,
            dst.format,
            dst.layout,
            dst.rate,
        )?;
        log::debug!("resampler {:?} -> {:?}", src, dst);
        self.opened = Some(Opened { context, src, dst });
        Ok(())
    }

    fn running(&self) -> anyhow::Result<&Opened> {
        self.opened
            .as_ref()
            .ok_or_else(|| invalid_state("resampler", Status::Stopped, Status::Running))
    }

    pub fn source(&self) -> anyhow::Result<AudioShape> {
        Ok(self.running()?.src)
    }

    pub fn destination(&self) -> anyhow::Result<AudioShape> {
        Ok(self.running()?.dst)
    }

    /// Samples held inside the converter, expressed at the output rate.
    pub fn delay(&self) -> anyhow::Result<usize> {
        let opened = self.running()?;
        let delay = unsafe {
            ffmpeg_next::ffi::swr_get_delay(
                opened.context.as_ptr() as *mut _,
                opened.dst.rate as i64,
            )
        };
        Ok(delay.max(0) as usize)
    }

    /// Upper bound on what converting `input` more samples can produce.
    pub fn max_output(&self, input: usize) -> anyhow::Result<usize> {
        let opened = self.running()?;
        let ret = unsafe {
            ffmpeg_next::ffi::swr_get_out_samples(opened.context.as_ptr() as *mut _, input as c_int)
        };
        Ok(check(ret, "swr_get_out_samples")? as usize)
    }

    /// Converts `src` into `dst` and returns how many samples per channel
    /// were written. `dst.samples()` is the capacity; it is not changed, so
    /// only the first returned count of samples is meaningful.
    pub fn convert(
        &mut self,
        src: Option<&AudioFrame>,
        dst: &mut AudioFrame,
    ) -> anyhow::Result<usize> {
        let opened = self
            .opened
            .as_mut()
            .ok_or_else(|| invalid_state("resampler", Status::Stopped, Status::Running))?;

        if dst.format() != opened.dst.format || dst.channel_layout() != opened.dst.layout {
            return Err(PipeError::Unsupported(format!(
                "resampler writes {:?} {:?}, destination is {:?} {:?}",
                opened.dst.format,
                opened.dst.layout,
                dst.format(),
                dst.channel_layout()
            ))
            .into());
        }
        if let Some(src) = src {
            if src.format() != opened.src.format {
                return Err(PipeError::Unsupported(format!(
                    "resampler reads {:?}, source is {:?}",
                    opened.src.format,
                    src.format()
                ))
                .into());
            }
        }
        if !dst.is_writable() {
            let message = "convert destination is shared, make it writable first";
            return Err(PipeError::Ordering(message).into());
        }

        let capacity = dst.samples();
        let (in_data, in_count) = match src {
            Some(src) => {
                let data = unsafe { (*src.as_ptr()).extended_data as *const *const u8 };
                (data, src.samples())
            }
            None => (ptr::null(), 0),
        };
        let produced = unsafe {
            ffmpeg_next::ffi::swr_convert(
                opened.context.as_mut_ptr(),
                (*dst.as_mut_ptr()).extended_data as _,
                capacity as c_int,
                in_data as _,
                in_count as c_int,
            )
        };
        let produced = check(produced, "swr_convert")? as usize;
        dst.set_rate(opened.dst.rate);
        Ok(produced)
    }

    pub fn cleanup(&mut self) {
        self.opened = None;
    }
}

#[cfg(test)]
mod tests {
    use ffmpeg_next::format::sample::Type;

    use super::*;

    fn fltp_48k() -> AudioShape {
        AudioShape {
            layout: ChannelLayout::STEREO,
            rate: 48_000,
            format: Sample::F32(Type::Planar),
        }
    }

    fn s32p_44k() -> AudioShape {
        AudioShape {
            layout: ChannelLayout::STEREO,
            rate: 44_100,
            format: Sample::I32(Type::Planar),
        }
    }

    #[test]
    fn test_operations_require_create() -> anyhow::Result<()> {
        let mut resampler = Resampler::new();
        let mut dst = AudioFrame::alloc(Sample::I32(Type::Planar), 1024, ChannelLayout::STEREO)?;
        assert!(PipeError::is_invalid_state(&resampler.convert(None, &mut dst).unwrap_err()));
        assert!(PipeError::is_invalid_state(&resampler.delay().unwrap_err()));
        resampler.cleanup();
        resampler.cleanup();

        resampler.create_swr(fltp_48k(), s32p_44k())?;
        let err = resampler.create_swr(fltp_48k(), s32p_44k()).unwrap_err();
        assert!(PipeError::is_invalid_state(&err));
        Ok(())
    }

    #[test]
    fn test_rate_change_conserves_samples() -> anyhow::Result<()> {
        let mut resampler = Resampler::new();
        resampler.create_swr(fltp_48k(), s32p_44k())?;

        let mut src = AudioFrame::alloc(fltp_48k().format, 1024, ChannelLayout::STEREO)?;
        src.plane_mut(0)?.fill(0);
        src.plane_mut(1)?.fill(0);
        let mut dst = AudioFrame::alloc(s32p_44k().format, 2048, ChannelLayout::STEREO)?;

        let blocks = 47;
        let mut produced = 0;
        for _ in 0..blocks {
            let n = resampler.convert(Some(&src), &mut dst)?;
            assert!(n <= dst.samples());
            produced += n;
        }
        // the filter holds back a tail until flushed
        loop {
            let n = resampler.convert(None, &mut dst)?;
            if n == 0 {
                break;
            }
            produced += n;
        }
        assert_eq!(dst.rate(), 44_100);

        let expected = blocks * 1024 * 44_100 / 48_000;
        let diff = produced.abs_diff(expected);
        assert!(diff <= 2, "produced {} expected about {}", produced, expected);
        Ok(())
    }

    #[test]
    fn test_small_destination_keeps_the_rest_buffered() -> anyhow::Result<()> {
        let mut resampler = Resampler::new();
        let same_rate = AudioShape {
            rate: 48_000,
            ..s32p_44k()
        };
        resampler.create_swr(fltp_48k(), same_rate)?;

        let src = AudioFrame::alloc(fltp_48k().format, 1024, ChannelLayout::STEREO)?;
        let mut dst = AudioFrame::alloc(same_rate.format, 256, ChannelLayout::STEREO)?;
        assert_eq!(resampler.convert(Some(&src), &mut dst)?, 256);
        assert!(resampler.delay()? >= 1024 - 256);
        assert_eq!(resampler.convert(None, &mut dst)?, 256);
        Ok(())
    }
}
