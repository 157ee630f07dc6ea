use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;

use ffmpeg_pipe::CaptureConfig;
use serde::Deserialize;

pub struct AppConfig {
    log_level: log::LevelFilter,
    ffmpeg_log_level: ffmpeg_next::util::log::Level,
}

impl AppConfig {
    fn from_env() -> Self {
        let log_level = std::env::var("CAPTURE_LOG")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(log::LevelFilter::Info);
        let ffmpeg_log_level = match std::env::var("CAPTURE_FFMPEG_LOG").as_deref() {
            Ok("quiet") => ffmpeg_next::util::log::Level::Quiet,
            Ok("error") => ffmpeg_next::util::log::Level::Error,
            Ok("info") => ffmpeg_next::util::log::Level::Info,
            Ok("debug") => ffmpeg_next::util::log::Level::Debug,
            _ => ffmpeg_next::util::log::Level::Warning,
        };
        Self {
            log_level,
            ffmpeg_log_level,
        }
    }

    pub fn log_level(&self) -> log::LevelFilter {
        self.log_level
    }

    pub fn ffmpeg_log_level(&self) -> ffmpeg_next::util::log::Level {
        self.ffmpeg_log_level
    }
}

pub fn config() -> &'static AppConfig {
    static CONFIG: LazyLock<AppConfig> = LazyLock::new(AppConfig::from_env);
    &CONFIG
}

/// A capture job file: the capture settings plus an optional time limit.
#[derive(Debug, Deserialize)]
pub struct Job {
    #[serde(flatten)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub duration_secs: Option<u64>,
}

impl Job {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("reading job {}: {}", path.display(), e))?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn duration(&self) -> Option<Duration> {
        self.duration_secs.map(Duration::from_secs)
    }
}
