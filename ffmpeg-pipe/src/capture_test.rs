use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use ffmpeg_next::{Rational, codec::Id};

use super::*;
use crate::{
    config::SourceConfig,
    input::{Demuxer, Source},
    output::MuxSink,
    stream::rescale,
    test_util,
};

fn source(path: &Path) -> SourceConfig {
    SourceConfig {
        url: path.to_string_lossy().to_string(),
        format: None,
        options: HashMap::new(),
        video_stream: None,
        audio_stream: None,
    }
}

fn mpeg4(width: u32, height: u32) -> VideoEncodeConfig {
    VideoEncodeConfig {
        codec: "mpeg4".to_string(),
        bitrate: 200_000,
        width: Some(width),
        height: Some(height),
        gop_size: 10,
        ..VideoEncodeConfig::default()
    }
}

fn aac() -> AudioEncodeConfig {
    AudioEncodeConfig {
        codec: "aac".to_string(),
        sample_rate: 48_000,
        ..AudioEncodeConfig::default()
    }
}

fn file_sink(path: &Path) -> SinkConfig {
    SinkConfig::File {
        path: path.to_path_buf(),
        format: None,
    }
}

fn count_packets(path: &Path) -> anyhow::Result<(Vec<StreamDescriptor>, Vec<usize>)> {
    let mut demuxer = Demuxer::new();
    demuxer.open(Source::url(path.to_string_lossy()), None, &HashMap::new())?;
    let streams = demuxer.streams()?.to_vec();
    let mut counts = vec![0; streams.len()];
    while let Some(packet) = demuxer.read_packet()?.into_data() {
        counts[packet.index()] += 1;
    }
    Ok((streams, counts))
}

#[test]
fn test_capture_file_to_container() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let input = test_util::write_av_file(dir.path(), 2)?;
    let output = dir.path().join("out.mkv");

    let handle = Capture::start(CaptureConfig {
        source: source(&input),
        video: Some(mpeg4(32, 24)),
        audio: Some(aac()),
        sink: file_sink(&output),
    })?;
    let stats = handle.wait()?;

    assert!(stats.end_of_source);
    assert_eq!(stats.video_frames_encoded, 20);
    assert_eq!(stats.samples_buffered, stats.samples_encoded);
    assert!(stats.samples_left_at_stop < 1024);
    // two seconds at 48 kHz, give or take the resampler edge
    assert!(stats.samples_encoded.abs_diff(96_000) < 2048, "{:?}", stats);

    let (streams, counts) = count_packets(&output)?;
    assert_eq!(streams.len(), 2);
    assert_eq!(streams[0].codec_id(), Id::MPEG4);
    assert_eq!((streams[0].width(), streams[0].height()), (32, 24));
    assert_eq!(streams[1].codec_id(), Id::AAC);
    assert_eq!(streams[1].sample_rate(), 48_000);
    assert_eq!(counts[0], 20);
    assert!(counts[1] > 0);
    assert_eq!(counts.iter().sum::<usize>() as u64, stats.packets_written);
    Ok(())
}

#[test]
fn test_audio_only_fifo_is_emptied_on_drain() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let input = test_util::write_audio_file(dir.path(), 1)?;
    let output = dir.path().join("out.mka");

    let stats = Capture::start(CaptureConfig {
        source: source(&input),
        video: None,
        audio: Some(aac()),
        sink: file_sink(&output),
    })?
    .wait()?;

    assert_eq!(stats.video_frames_encoded, 0);
    assert_eq!(stats.samples_buffered, stats.samples_encoded);
    // every frame but the last is full
    assert_eq!(stats.audio_frames_encoded, stats.samples_encoded.div_ceil(1024));

    let (streams, counts) = count_packets(&output)?;
    assert_eq!(streams.len(), 1);
    assert!(streams[0].is_audio());
    assert!(counts[0] > 0);
    Ok(())
}

#[test]
fn test_stop_drains_and_closes_output() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let input = test_util::write_video_file(dir.path(), 60, 25, 25)?;
    let output = dir.path().join("out.mkv");

    let handle = Capture::start(CaptureConfig {
        source: source(&input),
        video: Some(mpeg4(test_util::WIDTH, test_util::HEIGHT)),
        audio: None,
        sink: file_sink(&output),
    })?;
    let stop = handle.stop_token();
    std::thread::sleep(Duration::from_millis(50));
    stop.cancel();
    let stats = handle.stop()?;

    assert!(stats.packets_read < 1500);
    assert!(!stats.end_of_source);
    // no b-frames: after the drain every encoded frame has its packet
    assert_eq!(stats.packets_written, stats.video_frames_encoded);

    // the trailer was written, so the file reads back cleanly
    let (_, counts) = count_packets(&output)?;
    assert_eq!(counts[0] as u64, stats.packets_written);
    Ok(())
}

#[test]
fn test_stop_during_audio_capture_drains_the_fifo() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let input = test_util::write_audio_file(dir.path(), 60)?;
    let output = dir.path().join("out.mka");

    let handle = Capture::start(CaptureConfig {
        source: source(&input),
        video: None,
        audio: Some(aac()),
        sink: file_sink(&output),
    })?;
    std::thread::sleep(Duration::from_millis(50));
    let stats = handle.stop()?;

    assert!(!stats.end_of_source);
    assert!(stats.packets_read > 0);
    assert!(stats.samples_buffered > 0);
    // whatever sat in the fifo at stop went out as the last frames
    assert!(stats.samples_left_at_stop < 1024);
    assert_eq!(stats.samples_buffered, stats.samples_encoded);
    assert_eq!(stats.audio_frames_encoded, stats.samples_encoded.div_ceil(1024));
    assert!(stats.samples_encoded < 60 * 48_000);

    let (streams, counts) = count_packets(&output)?;
    assert!(streams[0].is_audio());
    assert_eq!(counts[0] as u64, stats.packets_written);
    Ok(())
}

#[test]
fn test_video_timestamps_start_at_zero() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    // first frame five seconds in
    let input = test_util::write_offset_video_file(dir.path(), 2, 10, 50)?;
    let output = dir.path().join("out.mkv");

    let mut demuxer = Demuxer::new();
    demuxer.open(Source::url(input.to_string_lossy()), None, &HashMap::new())?;
    let first = demuxer.read_packet()?.into_data().expect("source packet");
    let source_seconds = rescale(first.pts().unwrap_or(0), first.time_base(), Rational::new(1, 1));
    assert_eq!(source_seconds, 5);
    demuxer.cleanup();

    let stats = Capture::start(CaptureConfig {
        source: source(&input),
        video: Some(mpeg4(test_util::WIDTH, test_util::HEIGHT)),
        audio: None,
        sink: file_sink(&output),
    })?
    .wait()?;
    assert_eq!(stats.video_frames_encoded, 20);

    let mut demuxer = Demuxer::new();
    demuxer.open(Source::url(output.to_string_lossy()), None, &HashMap::new())?;
    let mut pts = Vec::new();
    while let Some(packet) = demuxer.read_packet()?.into_data() {
        pts.push(rescale(packet.pts().unwrap_or(-1), packet.time_base(), Rational::new(1, 10)));
    }
    assert_eq!(pts.len(), 20);
    assert_eq!(pts[0], 0);
    assert!(pts.windows(2).all(|w| w[0] < w[1]));
    assert!(pts[19] < 50, "{:?}", pts);
    Ok(())
}

#[test]
fn test_input_shape_change_keeps_resampler_tail() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let input = test_util::write_audio_file(dir.path(), 1)?;
    let mut demuxer = Demuxer::new();
    demuxer.open(Source::url(input.to_string_lossy()), None, &HashMap::new())?;
    let stream = demuxer.stream(0)?.clone();

    let mut sink = MuxSink::create(&dir.path().join("out.mka").to_string_lossy(), None)?;
    let mut path = AudioPath::open(&stream, &aac(), &mut sink)?;

    // 441 samples are 480 at 48 kHz from 44.1 kHz and 960 from 22.05 kHz
    for i in 0..10 {
        path.resample(Some(&test_util::tone_frame(441, i * 441)?))?;
    }
    for i in 0..10 {
        let mut frame = test_util::tone_frame(441, i * 441)?;
        frame.set_rate(22_050);
        path.resample(Some(&frame))?;
    }
    assert_eq!(path.resampler.source()?.rate, 22_050);
    path.flush_resampler()?;

    let buffered = path.fifo.total_written() as usize;
    assert!(buffered.abs_diff(4_800 + 9_600) <= 4, "buffered {}", buffered);
    path.cleanup();
    Ok(())
}

#[test]
fn test_finished_token_fires_at_end_of_source() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let input = test_util::write_video_file(dir.path(), 1, 10, 10)?;

    let handle = Capture::start(CaptureConfig {
        source: source(&input),
        video: Some(mpeg4(test_util::WIDTH, test_util::HEIGHT)),
        audio: None,
        sink: file_sink(&dir.path().join("out.mkv")),
    })?;
    let finished = handle.finished_token();
    for _ in 0..500 {
        if finished.is_cancelled() {
            break;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(handle.is_finished());
    let stats = handle.stop()?;
    assert!(stats.end_of_source);
    assert_eq!(stats.video_frames_encoded, 10);
    Ok(())
}

#[test]
fn test_raw_sink_writes_elementary_stream() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let input = test_util::write_video_file(dir.path(), 1, 10, 10)?;
    let output = dir.path().join("out.m4v");

    let stats = Capture::start(CaptureConfig {
        source: source(&input),
        video: Some(mpeg4(test_util::WIDTH, test_util::HEIGHT)),
        audio: None,
        sink: SinkConfig::Raw { path: output.clone() },
    })?
    .wait()?;
    assert_eq!(stats.packets_written, 10);

    let bytes = std::fs::read(&output)?;
    // in-band headers, so the stream starts with a start code
    assert_eq!(&bytes[..3], &[0, 0, 1]);
    Ok(())
}

#[test]
fn test_start_rejects_bad_jobs() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let input = test_util::write_av_file(dir.path(), 1)?;

    let nothing = Capture::start(CaptureConfig {
        source: source(&input),
        video: None,
        audio: None,
        sink: file_sink(&dir.path().join("a.mkv")),
    });
    assert!(nothing.is_err());

    // a raw sink holds one stream only
    let two_streams = Capture::start(CaptureConfig {
        source: source(&input),
        video: Some(mpeg4(test_util::WIDTH, test_util::HEIGHT)),
        audio: Some(aac()),
        sink: SinkConfig::Raw {
            path: dir.path().join("b.raw"),
        },
    });
    assert!(two_streams.is_err());

    let mut wrong_kind = source(&input);
    wrong_kind.video_stream = Some(1);
    let wrong_kind = Capture::start(CaptureConfig {
        source: wrong_kind,
        video: Some(mpeg4(test_util::WIDTH, test_util::HEIGHT)),
        audio: None,
        sink: file_sink(&dir.path().join("c.mkv")),
    });
    assert!(matches!(
        wrong_kind.err().and_then(|e| e.downcast::<PipeError>().ok()),
        Some(PipeError::Unsupported(_))
    ));

    let missing = Capture::start(CaptureConfig {
        source: source(&dir.path().join("missing.mkv")),
        video: Some(mpeg4(test_util::WIDTH, test_util::HEIGHT)),
        audio: None,
        sink: file_sink(&dir.path().join("d.mkv")),
    });
    assert!(missing.is_err());
    Ok(())
}
