//! Source summary in the spirit of ffprobe, built on [`Demuxer`].

use std::collections::HashMap;
use std::fmt;

use ffmpeg_next::Rational;

use crate::input::{Demuxer, Source};

#[derive(Debug, Clone)]
pub struct FormatInfo {
    /// Demuxer name, e.g. "matroska,webm".
    pub format_name: String,
    /// None when the container does not know (live devices, raw streams).
    pub duration_sec: Option<f64>,
    /// Total bitrate in bps; 0 if unknown.
    pub bit_rate: i64,
    pub nb_streams: usize,
}

#[derive(Debug, Clone)]
pub struct StreamInfo {
    pub index: usize,
    /// "video", "audio", "subtitle", ...
    pub codec_type: String,
    pub codec_name: String,
    /// e.g. "1/1000"
    pub time_base: String,
    /// Frame rate, e.g. "25/1"
    pub rate: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub sample_rate: Option<u32>,
    pub channels: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct MediaInfo {
    pub format: FormatInfo,
    pub streams: Vec<StreamInfo>,
}

impl fmt::Display for MediaInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "[FORMAT]")?;
        writeln!(f, "format_name={}", self.format.format_name)?;
        match self.format.duration_sec {
            Some(d) => writeln!(f, "duration_sec={:.3}", d)?,
            None => writeln!(f, "duration_sec=N/A")?,
        }
        writeln!(f, "bit_rate={}", self.format.bit_rate)?;
        writeln!(f, "nb_streams={}", self.format.nb_streams)?;
        writeln!(f, "[/FORMAT]")?;
        for s in &self.streams {
            writeln!(f, "[STREAM]")?;
            writeln!(f, "index={}", s.index)?;
            writeln!(f, "codec_type={}", s.codec_type)?;
            writeln!(f, "codec_name={}", s.codec_name)?;
            writeln!(f, "time_base={}", s.time_base)?;
            writeln!(f, "rate={}", s.rate)?;
            if let (Some(w), Some(h)) = (s.width, s.height) {
                writeln!(f, "width={}", w)?;
                writeln!(f, "height={}", h)?;
            }
            if let Some(sr) = s.sample_rate {
                writeln!(f, "sample_rate={}", sr)?;
            }
            if let Some(c) = s.channels {
                writeln!(f, "channels={}", c)?;
            }
            writeln!(f, "[/STREAM]")?;
        }
        Ok(())
    }
}

fn ratio(r: Rational) -> String {
    format!("{}/{}", r.numerator(), r.denominator())
}

/// Opens `url` (optionally with a forced input format) and describes it.
///
/// ```ignore
/// let info = ffmpeg_pipe::metadata::probe("input.mkv", None)?;
/// println!("{}", info);
/// ```
pub fn probe(url: &str, format: Option<&str>) -> anyhow::Result<MediaInfo> {
    let mut demuxer = Demuxer::new();
    demuxer.open(Source::url(url), format, &HashMap::new())?;

    let duration_sec = demuxer
        .duration(Rational::new(1, 1000))?
        .map(|ms| ms as f64 / 1000.0);
    let streams = demuxer
        .streams()?
        .iter()
        .map(|stream| {
            let (width, height) = if stream.is_video() {
                (Some(stream.width()), Some(stream.height()))
            } else {
                (None, None)
            };
            let (sample_rate, channels) = if stream.is_audio() {
                (Some(stream.sample_rate()), Some(stream.channels()))
            } else {
                (None, None)
            };
            StreamInfo {
                index: stream.index(),
                codec_type: format!("{:?}", stream.medium()).to_lowercase(),
                codec_name: format!("{:?}", stream.codec_id()).to_lowercase(),
                time_base: ratio(stream.time_base()),
                rate: ratio(stream.rate()),
                width,
                height,
                sample_rate,
                channels,
            }
        })
        .collect::<Vec<_>>();

    let info = MediaInfo {
        format: FormatInfo {
            format_name: demuxer.format_name()?,
            duration_sec,
            bit_rate: demuxer.bit_rate()?,
            nb_streams: streams.len(),
        },
        streams,
    };
    demuxer.cleanup();
    Ok(info)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util;

    #[test]
    fn test_probe_av_file() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = test_util::write_av_file(dir.path(), 2)?;

        let info = probe(&path.to_string_lossy(), None)?;
        assert!(info.format.format_name.contains("matroska"));
        assert_eq!(info.format.nb_streams, 2);
        let duration = info.format.duration_sec.unwrap();
        assert!((duration - 2.0).abs() < 0.1, "{}", duration);

        let video = &info.streams[0];
        assert_eq!(video.codec_type, "video");
        assert_eq!(video.codec_name, "mpeg4");
        assert_eq!((video.width, video.height), (Some(test_util::WIDTH), Some(test_util::HEIGHT)));
        let audio = &info.streams[1];
        assert_eq!(audio.codec_type, "audio");
        assert_eq!(audio.sample_rate, Some(test_util::AUDIO_RATE));
        assert_eq!(audio.channels, Some(2));

        let text = info.to_string();
        assert_eq!(text.matches("[STREAM]").count(), 2);
        assert!(text.contains("codec_name=pcm_s16le"));
        Ok(())
    }

    #[test]
    fn test_probe_missing_file() {
        crate::init().unwrap();
        assert!(probe("/nonexistent/input.mkv", None).is_err());
    }
}
