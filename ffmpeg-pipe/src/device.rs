//! Capture device discovery: which input formats the linked FFmpeg offers
//! and what to pass as the source URL for each.

use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Video,
    Audio,
}

/// One device input format (e.g. "v4l2", "dshow") and usable source URLs.
#[derive(Debug, Clone)]
pub struct DeviceFormat {
    pub kind: DeviceKind,
    /// Value for `SourceConfig::format`.
    pub format: String,
    pub description: String,
    /// Candidate values for `SourceConfig::url`; empty if not enumerable.
    pub sources: Vec<String>,
}

impl DeviceFormat {
    fn new(kind: DeviceKind, inner: ffmpeg_next::Format) -> Self {
        let format = inner.name().to_string();
        Self {
            kind,
            sources: sources_for_format(kind, &format),
            description: inner.description().to_string(),
            format,
        }
    }
}

impl Display for DeviceFormat {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:?} format: {}, description: {}, sources: {:?}",
            self.kind, self.format, self.description, self.sources
        )
    }
}

fn sources_for_format(kind: DeviceKind, format: &str) -> Vec<String> {
    match (kind, format) {
        (DeviceKind::Video, "v4l2") => video_device_paths(Path::new("/dev"))
            .map(|paths| {
                paths
                    .into_iter()
                    .filter_map(|p| p.into_os_string().into_string().ok())
                    .collect()
            })
            .unwrap_or_default(),
        (DeviceKind::Video, "lavfi") => vec![
            "testsrc=size=1280x720:rate=25".to_string(),
            "color=c=blue:s=1280x720".to_string(),
        ],
        (DeviceKind::Audio, "lavfi") => vec!["sine=frequency=440:sample_rate=48000".to_string()],
        // names come from `-list_devices true`; these are the URL shapes
        (DeviceKind::Video, "dshow") => vec!["video=<device name>".to_string()],
        (DeviceKind::Audio, "dshow") => vec!["audio=<device name>".to_string()],
        (DeviceKind::Video, "avfoundation") => vec!["0:none".to_string()],
        (DeviceKind::Audio, "avfoundation") => vec!["none:0".to_string()],
        (DeviceKind::Audio, "alsa" | "pulse") => vec!["default".to_string()],
        _ => Vec::new(),
    }
}

/// Entries named `video*` under `dir`, sorted.
pub fn video_device_paths(dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|s| s.starts_with("video"))
        })
        .collect();
    paths.sort();
    Ok(paths)
}

/// Every video and audio capture format compiled into FFmpeg.
pub fn input_devices() -> Vec<DeviceFormat> {
    ffmpeg_next::device::input::video()
        .map(|format| DeviceFormat::new(DeviceKind::Video, format))
        .chain(
            ffmpeg_next::device::input::audio()
                .map(|format| DeviceFormat::new(DeviceKind::Audio, format)),
        )
        .collect()
}
