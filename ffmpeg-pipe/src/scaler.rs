use std::ffi::c_int;

use ffmpeg_next::{
    format::Pixel,
    software::scaling::{self, flag::Flags},
};

use crate::{
    error::{PipeError, Status, check, invalid_state},
    frame::VideoFrame,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Geometry {
    format: Pixel,
    width: u32,
    height: u32,
}

struct Opened {
    context: scaling::Context,
    src: Geometry,
    dst: Geometry,
}

/// Pixel format / size converter. Never allocates destination storage in
/// [`Scaler::scale`]; [`Scaler::run`] is the allocating convenience.
pub struct Scaler {
    opened: Option<Opened>,
}

unsafe impl Send for Scaler {}

impl Default for Scaler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scaler {
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

    pub fn create_sws(
        &mut self,
        src_format: Pixel,
        src_width: u32,
        src_height: u32,
        dst_format: Pixel,
        dst_width: u32,
        dst_height: u32,
    ) -> anyhow::Result<()> {
        if self.opened.is_some() {
            return Err(invalid_state("scaler", Status::Running, Status::Stopped));
        }
        let context = scaling::Context::get(
            src_format,
            src_width,
            src_height,
            dst_format,
            dst_width,
            dst_height,
            Flags::BICUBIC,
        )?;
        log::debug!(
            "scaler {:?} {}x{} -> {:?} {}x{}",
            src_format,
            src_width,
            src_height,
            dst_format,
            dst_width,
            dst_height
        );
        self.opened = Some(Opened {
            context,
            src: Geometry {
                format: src_format,
                width: src_width,
                height: src_height,
            },
            dst: Geometry {
                format: dst_format,
                width: dst_width,
                height: dst_height,
            },
        });
        Ok(())
    }

    /// Whether the context converts frames shaped like `frame`.
    pub fn accepts(&self, frame: &VideoFrame) -> bool {
        self.opened.as_ref().is_some_and(|o| {
            o.src
                == Geometry {
                    format: frame.format(),
                    width: frame.width(),
                    height: frame.height(),
                }
        })
    }

    /// Converts `rows` source rows starting at `first_row` into `dst` and
    /// returns the number of destination rows written. `dst` must be
    /// privately owned and match the destination geometry.
    pub fn scale(
        &mut self,
        src: &VideoFrame,
        first_row: u32,
        rows: u32,
        dst: &mut VideoFrame,
    ) -> anyhow::Result<usize> {
        let opened = self
            .opened
            .as_mut()
            .ok_or_else(|| invalid_state("scaler", Status::Stopped, Status::Running))?;

        let src_geometry = Geometry {
            format: src.format(),
            width: src.width(),
            height: src.height(),
        };
        let dst_geometry = Geometry {
            format: dst.format(),
            width: dst.width(),
            height: dst.height(),
        };
        if src_geometry != opened.src || dst_geometry != opened.dst {
            return Err(PipeError::Unsupported(format!(
                "scaler built for {:?} -> {:?}, got {:?} -> {:?}",
                opened.src, opened.dst, src_geometry, dst_geometry
            ))
            .into());
        }
        if first_row.saturating_add(rows) > src.height() {
            return Err(PipeError::Unsupported(format!(
                "rows {}..{} outside a {} row frame",
                first_row,
                first_row.saturating_add(rows),
                src.height()
            ))
            .into());
        }
        if !dst.is_writable() {
            let message = "scale destination is shared, make it writable first";
            return Err(PipeError::Ordering(message).into());
        }

        let produced = unsafe {
            let src_ptr = src.as_ptr();
            let dst_ptr = dst.as_mut_ptr();
            ffmpeg_next::ffi::sws_scale(
                opened.context.as_mut_ptr(),
                (*src_ptr).data.as_ptr() as _,
                (*src_ptr).linesize.as_ptr() as _,
                first_row as c_int,
                rows as c_int,
                (*dst_ptr).data.as_ptr() as _,
                (*dst_ptr).linesize.as_ptr() as _,
            )
        };
        Ok(check(produced, "sws_scale")? as usize)
    }

    /// Converts a whole frame into newly allocated storage, keeping its pts.
    pub fn run(&mut self, src: &VideoFrame) -> anyhow::Result<VideoFrame> {
        let dst = self
            .opened
            .as_ref()
            .map(|o| o.dst)
            .ok_or_else(|| invalid_state("scaler", Status::Stopped, Status::Running))?;
        let mut out = VideoFrame::alloc(dst.format, dst.width, dst.height)?;
        self.scale(src, 0, src.height(), &mut out)?;
        out.set_pts(src.pts());
        Ok(out)
    }

    pub fn cleanup(&mut self) {
        self.opened = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gray_rgb(width: u32, height: u32) -> anyhow::Result<VideoFrame> {
        let mut frame = VideoFrame::alloc(Pixel::RGB24, width, height)?;
        frame.plane_mut(0)?.fill(128);
        Ok(frame)
    }

    #[test]
    fn test_operations_require_create() -> anyhow::Result<()> {
        let mut scaler = Scaler::new();
        let src = gray_rgb(32, 16)?;
        let mut dst = VideoFrame::alloc(Pixel::YUV420P, 32, 16)?;
        assert!(PipeError::is_invalid_state(&scaler.scale(&src, 0, 16, &mut dst).unwrap_err()));
        assert!(PipeError::is_invalid_state(&scaler.run(&src).unwrap_err()));
        scaler.cleanup();
        scaler.cleanup();
        assert_eq!(scaler.status(), Status::Stopped);
        Ok(())
    }

    #[test]
    fn test_scale_full_frame() -> anyhow::Result<()> {
        let mut scaler = Scaler::new();
        scaler.create_sws(Pixel::RGB24, 64, 48, Pixel::YUV420P, 32, 24)?;
        let err = scaler
            .create_sws(Pixel::RGB24, 64, 48, Pixel::YUV420P, 32, 24)
            .unwrap_err();
        assert!(PipeError::is_invalid_state(&err));

        let mut src = gray_rgb(64, 48)?;
        src.set_pts(Some(7));
        assert!(scaler.accepts(&src));

        let mut dst = VideoFrame::alloc(Pixel::YUV420P, 32, 24)?;
        assert_eq!(scaler.scale(&src, 0, 48, &mut dst)?, 24);

        let out = scaler.run(&src)?;
        assert_eq!((out.width(), out.height(), out.format()), (32, 24, Pixel::YUV420P));
        assert_eq!(out.pts(), Some(7));
        // mid gray stays mid gray in luma, chroma is neutral
        let luma = out.plane(0)[0];
        assert!((120..=135).contains(&luma), "luma {}", luma);
        assert!((124..=132).contains(&out.plane(1)[0]));
        Ok(())
    }

    #[test]
    fn test_shared_destination_is_rejected() -> anyhow::Result<()> {
        let mut scaler = Scaler::new();
        scaler.create_sws(Pixel::RGB24, 32, 16, Pixel::YUV420P, 32, 16)?;
        let src = gray_rgb(32, 16)?;

        let mut dst = VideoFrame::alloc(Pixel::YUV420P, 32, 16)?;
        let reader = dst.clone();
        let err = scaler.scale(&src, 0, 16, &mut dst).unwrap_err();
        assert!(matches!(err.downcast_ref::<PipeError>(), Some(PipeError::Ordering(_))));

        dst.make_writable()?;
        assert_eq!(scaler.scale(&src, 0, 16, &mut dst)?, 16);
        drop(reader);
        Ok(())
    }

    #[test]
    fn test_geometry_mismatch_is_rejected() -> anyhow::Result<()> {
        let mut scaler = Scaler::new();
        scaler.create_sws(Pixel::RGB24, 32, 16, Pixel::YUV420P, 32, 16)?;
        let src = gray_rgb(16, 16)?;
        let mut dst = VideoFrame::alloc(Pixel::YUV420P, 32, 16)?;
        let err = scaler.scale(&src, 0, 16, &mut dst).unwrap_err();
        assert!(matches!(err.downcast_ref::<PipeError>(), Some(PipeError::Unsupported(_))));
        assert!(!scaler.accepts(&src));
        Ok(())
    }
}
