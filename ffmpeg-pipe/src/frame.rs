use ffmpeg_next::{
    ChannelLayout,
    ffi::{AVFrame, av_frame_copy_props, av_frame_is_writable, av_frame_make_writable, av_frame_ref},
    format::{Pixel, Sample},
};

use crate::error::{PipeError, check};

/// Decoded media unit, or raw media headed for an encoder.
#[derive(Clone)]
pub enum Frame {
    Video(VideoFrame),
    Audio(AudioFrame),
    /// Video frame still resident in accelerator memory. Call
    /// [`HwFrame::transfer`] before touching pixels.
    Hardware(HwFrame),
}

impl Frame {
    pub fn pts(&self) -> Option<i64> {
        match self {
            Frame::Video(frame) => frame.pts(),
            Frame::Audio(frame) => frame.pts(),
            Frame::Hardware(frame) => frame.pts(),
        }
    }

    pub fn set_pts(&mut self, pts: Option<i64>) {
        match self {
            Frame::Video(frame) => frame.set_pts(pts),
            Frame::Audio(frame) => frame.set_pts(pts),
            Frame::Hardware(frame) => frame.frame.set_pts(pts),
        }
    }

    pub fn is_hardware(&self) -> bool {
        matches!(self, Frame::Hardware(_))
    }

    pub(crate) fn as_inner(&self) -> &ffmpeg_next::Frame {
        match self {
            Frame::Video(frame) => &*frame.frame,
            Frame::Audio(frame) => &*frame.frame,
            Frame::Hardware(frame) => &*frame.frame,
        }
    }
}

/// Takes a new reference on `src` instead of copying its planes.
fn share(src: *const AVFrame, dst: *mut AVFrame) -> bool {
    unsafe { av_frame_ref(dst, src) >= 0 }
}

fn writable(frame: *const AVFrame) -> bool {
    unsafe { av_frame_is_writable(frame as *mut AVFrame) != 0 }
}

fn make_writable(frame: *mut AVFrame) -> anyhow::Result<()> {
    check(unsafe { av_frame_make_writable(frame) }, "av_frame_make_writable")?;
    Ok(())
}

pub struct VideoFrame {
    frame: ffmpeg_next::frame::Video,
}

impl VideoFrame {
    /// Allocates planes for `format` at `width`x`height`.
    pub fn alloc(format: Pixel, width: u32, height: u32) -> anyhow::Result<Self> {
        let frame = ffmpeg_next::frame::Video::new(format, width, height);
        if unsafe { (*frame.as_ptr()).data[0].is_null() } {
            return Err(PipeError::Alloc("video frame buffer").into());
        }
        Ok(Self { frame })
    }

    pub fn width(&self) -> u32 {
        self.frame.width()
    }

    pub fn height(&self) -> u32 {
        self.frame.height()
    }

    pub fn format(&self) -> Pixel {
        self.frame.format()
    }

    pub fn pts(&self) -> Option<i64> {
        self.frame.pts()
    }

    pub fn set_pts(&mut self, pts: Option<i64>) {
        self.frame.set_pts(pts);
    }

    pub fn is_key(&self) -> bool {
        self.frame.is_key()
    }

    pub fn planes(&self) -> usize {
        self.frame.planes()
    }

    /// Bytes per row of `plane`, padding included.
    pub fn stride(&self, plane: usize) -> usize {
        self.frame.stride(plane)
    }

    pub fn plane(&self, plane: usize) -> &[u8] {
        self.frame.data(plane)
    }

    /// Mutable access to `plane`; detaches shared buffers first.
    pub fn plane_mut(&mut self, plane: usize) -> anyhow::Result<&mut [u8]> {
        self.make_writable()?;
        Ok(self.frame.data_mut(plane))
    }

    pub fn is_writable(&self) -> bool {
        writable(unsafe { self.frame.as_ptr() })
    }

    pub fn make_writable(&mut self) -> anyhow::Result<()> {
        make_writable(unsafe { self.frame.as_mut_ptr() })
    }

    pub(crate) fn as_ptr(&self) -> *const AVFrame {
        unsafe { self.frame.as_ptr() }
    }

    pub(crate) fn as_mut_ptr(&mut self) -> *mut AVFrame {
        unsafe { self.frame.as_mut_ptr() }
    }
}

impl Clone for VideoFrame {
    fn clone(&self) -> Self {
        let mut frame = ffmpeg_next::frame::Video::empty();
        if share(self.as_ptr(), unsafe { frame.as_mut_ptr() }) {
            Self { frame }
        } else {
            Self {
                frame: self.frame.clone(),
            }
        }
    }
}

impl From<ffmpeg_next::frame::Video> for VideoFrame {
    fn from(frame: ffmpeg_next::frame::Video) -> Self {
        Self { frame }
    }
}

pub struct AudioFrame {
    frame: ffmpeg_next::frame::Audio,
}

impl AudioFrame {
    /// Allocates room for `samples` samples per channel.
    pub fn alloc(format: Sample, samples: usize, layout: ChannelLayout) -> anyhow::Result<Self> {
        let frame = ffmpeg_next::frame::Audio::new(format, samples, layout);
        if unsafe { (*frame.as_ptr()).data[0].is_null() } {
            return Err(PipeError::Alloc("audio frame buffer").into());
        }
        Ok(Self { frame })
    }

    pub fn samples(&self) -> usize {
        self.frame.samples()
    }

    pub fn format(&self) -> Sample {
        self.frame.format()
    }

    pub fn channel_layout(&self) -> ChannelLayout {
        self.frame.channel_layout()
    }

    pub fn channels(&self) -> usize {
        self.frame.channel_layout().channels().max(0) as usize
    }

    pub fn rate(&self) -> u32 {
        self.frame.rate()
    }

    pub fn set_rate(&mut self, rate: u32) {
        self.frame.set_rate(rate);
    }

    pub fn pts(&self) -> Option<i64> {
        self.frame.pts()
    }

    pub fn set_pts(&mut self, pts: Option<i64>) {
        self.frame.set_pts(pts);
    }

    pub fn is_planar(&self) -> bool {
        self.frame.is_planar()
    }

    /// Number of data planes: one per channel when planar, otherwise one.
    pub fn planes(&self) -> usize {
        if self.is_planar() { self.channels() } else { 1 }
    }

    /// Bytes one sample occupies in a single plane.
    pub fn sample_stride(&self) -> usize {
        let bytes = self.format().bytes();
        if self.is_planar() {
            bytes
        } else {
            bytes * self.channels()
        }
    }

    /// Bytes of sample data held in each plane.
    pub fn plane_len(&self) -> usize {
        self.samples() * self.sample_stride()
    }

    /// Sample data of `plane`, sized by the sample count rather than the
    /// padded line size. Only `linesize[0]` is set for audio, so every
    /// plane is addressed through `extended_data`.
    pub fn plane(&self, plane: usize) -> &[u8] {
        match self.plane_ptr(plane) {
            Some(data) => unsafe { std::slice::from_raw_parts(data, self.plane_len()) },
            None => &[],
        }
    }

    pub fn plane_mut(&mut self, plane: usize) -> anyhow::Result<&mut [u8]> {
        self.make_writable()?;
        let len = self.plane_len();
        match self.plane_ptr(plane) {
            Some(data) => Ok(unsafe { std::slice::from_raw_parts_mut(data, len) }),
            None => Ok(Default::default()),
        }
    }

    fn plane_ptr(&self, plane: usize) -> Option<*mut u8> {
        if plane >= self.planes() {
            return None;
        }
        unsafe {
            let frame = self.frame.as_ptr();
            let planes = (*frame).extended_data;
            if planes.is_null() {
                return None;
            }
            let data = *planes.add(plane);
            (!data.is_null()).then_some(data)
        }
    }

    pub fn is_writable(&self) -> bool {
        writable(unsafe { self.frame.as_ptr() })
    }

    pub fn make_writable(&mut self) -> anyhow::Result<()> {
        make_writable(unsafe { self.frame.as_mut_ptr() })
    }

    pub(crate) fn as_ptr(&self) -> *const AVFrame {
        unsafe { self.frame.as_ptr() }
    }

    pub(crate) fn as_mut_ptr(&mut self) -> *mut AVFrame {
        unsafe { self.frame.as_mut_ptr() }
    }
}

impl Clone for AudioFrame {
    fn clone(&self) -> Self {
        let mut frame = ffmpeg_next::frame::Audio::empty();
        if share(self.as_ptr(), unsafe { frame.as_mut_ptr() }) {
            Self { frame }
        } else {
            Self {
                frame: self.frame.clone(),
            }
        }
    }
}

impl From<ffmpeg_next::frame::Audio> for AudioFrame {
    fn from(frame: ffmpeg_next::frame::Audio) -> Self {
        Self { frame }
    }
}

/// Decoded video frame living in device memory.
pub struct HwFrame {
    frame: ffmpeg_next::frame::Video,
}

impl HwFrame {
    pub(crate) fn new(frame: ffmpeg_next::frame::Video) -> Self {
        Self { frame }
    }

    /// The accelerator surface format, e.g. `Pixel::CUDA`.
    pub fn format(&self) -> Pixel {
        self.frame.format()
    }

    pub fn width(&self) -> u32 {
        self.frame.width()
    }

    pub fn height(&self) -> u32 {
        self.frame.height()
    }

    pub fn pts(&self) -> Option<i64> {
        self.frame.pts()
    }

    /// Downloads the surface into host memory.
    pub fn transfer(&self) -> anyhow::Result<VideoFrame> {
        let mut host = ffmpeg_next::frame::Video::empty();
        unsafe {
            check(
                ffmpeg_next::ffi::av_hwframe_transfer_data(
                    host.as_mut_ptr(),
                    self.frame.as_ptr(),
                    0,
                ),
                "av_hwframe_transfer_data",
            )?;
            check(
                av_frame_copy_props(host.as_mut_ptr(), self.frame.as_ptr()),
                "av_frame_copy_props",
            )?;
        }
        Ok(VideoFrame::from(host))
    }
}

impl Clone for HwFrame {
    fn clone(&self) -> Self {
        let mut frame = ffmpeg_next::frame::Video::empty();
        if share(unsafe { self.frame.as_ptr() }, unsafe { frame.as_mut_ptr() }) {
            Self { frame }
        } else {
            Self {
                frame: self.frame.clone(),
            }
        }
    }
}

unsafe impl Send for VideoFrame {}
unsafe impl Send for AudioFrame {}
unsafe impl Send for HwFrame {}
