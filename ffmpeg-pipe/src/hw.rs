//! Hardware acceleration.
//!
//! Device creation and capability lookup for decoders, plus hardware encoder
//! discovery (CUDA/VAAPI/QSV/V4L2M2M) with fallback to software codecs when
//! none is available.

use std::ptr;

use ffmpeg_next::{
    Codec,
    ffi::{self, AVBufferRef, AVHWDeviceType},
    format::Pixel,
};
use serde::{Deserialize, Serialize};

use crate::error::check;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HwAccel {
    Cuda,
    Vaapi,
    Qsv,
    VideoToolbox,
    D3d11va,
    Dxva2,
}

impl HwAccel {
    fn device_type(self) -> AVHWDeviceType {
        match self {
            HwAccel::Cuda => AVHWDeviceType::AV_HWDEVICE_TYPE_CUDA,
            HwAccel::Vaapi => AVHWDeviceType::AV_HWDEVICE_TYPE_VAAPI,
            HwAccel::Qsv => AVHWDeviceType::AV_HWDEVICE_TYPE_QSV,
            HwAccel::VideoToolbox => AVHWDeviceType::AV_HWDEVICE_TYPE_VIDEOTOOLBOX,
            HwAccel::D3d11va => AVHWDeviceType::AV_HWDEVICE_TYPE_D3D11VA,
            HwAccel::Dxva2 => AVHWDeviceType::AV_HWDEVICE_TYPE_DXVA2,
        }
    }
}

/// Reference to an opened accelerator device.
pub struct HwDevice {
    ctx: *mut AVBufferRef,
    accel: HwAccel,
}

unsafe impl Send for HwDevice {}

impl HwDevice {
    pub fn create(accel: HwAccel) -> anyhow::Result<Self> {
        let mut ctx: *mut AVBufferRef = ptr::null_mut();
        let ret = unsafe {
            ffi::av_hwdevice_ctx_create(
                &mut ctx,
                accel.device_type(),
                ptr::null(),
                ptr::null_mut(),
                0,
            )
        };
        check(ret, "av_hwdevice_ctx_create")?;
        log::info!("opened hardware device: {:?}", accel);
        Ok(Self { ctx, accel })
    }

    pub fn accel(&self) -> HwAccel {
        self.accel
    }

    /// New reference for a codec context to own.
    pub(crate) fn new_ref(&self) -> *mut AVBufferRef {
        unsafe { ffi::av_buffer_ref(self.ctx) }
    }
}

impl Drop for HwDevice {
    fn drop(&mut self) {
        unsafe { ffi::av_buffer_unref(&mut self.ctx) };
    }
}

/// Surface format `codec` produces when driven through `accel`, or `None`
/// when the codec has no device-context path for that accelerator.
pub fn hw_pixel_format(codec: &Codec, accel: HwAccel) -> Option<Pixel> {
    let wanted = accel.device_type();
    let mut i = 0;
    loop {
        let config = unsafe { ffi::avcodec_get_hw_config(codec.as_ptr(), i) };
        if config.is_null() {
            return None;
        }
        let config = unsafe { &*config };
        let by_device = config.methods & ffi::AV_CODEC_HW_CONFIG_METHOD_HW_DEVICE_CTX as i32 != 0;
        if by_device && config.device_type == wanted {
            return Some(Pixel::from(config.pix_fmt));
        }
        i += 1;
    }
}

/// Try to find a hardware-accelerated encoder for the given software codec name.
pub fn find_hw_encoder(codec_name: &str) -> Option<Codec> {
    let hw_names: &[&str] = match codec_name {
        "libx264" | "h264" => &["h264_nvenc", "h264_vaapi", "h264_qsv", "h264_v4l2m2m"],
        "libx265" | "hevc" | "h265" => &["hevc_nvenc", "hevc_vaapi", "hevc_qsv", "hevc_v4l2m2m"],
        "libaom-av1" | "libsvtav1" | "av1" => &["av1_nvenc", "av1_vaapi", "av1_qsv"],
        _ => &[],
    };

    for name in hw_names {
        if let Some(codec) = ffmpeg_next::encoder::find_by_name(name) {
            log::info!("found hardware encoder: {}", name);
            return Some(codec);
        }
    }
    None
}

/// Pixel format an encoder should be fed. Hardware encoders take NV12 in
/// place of packed RGB or YUYV input; software codecs get what was asked for.
pub fn pixel_format_for_encoder(requested: Pixel, codec_name: &str) -> Pixel {
    let is_hw = ["nvenc", "vaapi", "qsv", "v4l2m2m"]
        .iter()
        .any(|suffix| codec_name.contains(suffix));
    match requested {
        Pixel::RGB24 | Pixel::BGR24 | Pixel::RGBA | Pixel::BGRA | Pixel::YUYV422 if is_hw => {
            Pixel::NV12
        }
        _ => requested,
    }
}
