use std::path::PathBuf;

use ffmpeg_pipe::{Capture, metadata};

mod config;

fn init_logging() {
    let config = config::config();
    env_logger::Builder::from_default_env()
        .filter_level(config.log_level())
        .filter_module("ffmpeg_pipe", config.log_level())
        .init();
    ffmpeg_next::util::log::set_level(config.ffmpeg_log_level());
}

fn usage() -> ! {
    eprintln!("usage: pipe-capture capture <job.json> | probe <url> [format] | devices");
    std::process::exit(2);
}

async fn run_capture(path: PathBuf) -> anyhow::Result<()> {
    let job = config::Job::load(&path)?;
    let limit = job.duration();
    let handle = Capture::start(job.capture)?;
    let stop = handle.stop_token();
    let finished = handle.finished_token();

    let timeout = async {
        match limit {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending().await,
        }
    };
    tokio::select! {
        _ = finished.cancelled() => {
            log::info!("capture source ended");
        },
        _ = tokio::signal::ctrl_c() => {
            log::info!("interrupted, stopping capture");
            stop.cancel();
        },
        _ = timeout => {
            log::info!("time limit reached, stopping capture");
            stop.cancel();
        },
    }

    // joining and draining block, keep them off the runtime
    let stats = tokio::task::spawn_blocking(move || handle.stop()).await??;
    println!("{:#?}", stats);
    Ok(())
}

#[tokio::main]
async fn main() {
    init_logging();
    if let Err(e) = ffmpeg_pipe::init() {
        eprintln!("Error initializing ffmpeg: {}", e);
        std::process::exit(1);
    }

    let args: Vec<String> = std::env::args().skip(1).collect();
    let result = match args.iter().map(String::as_str).collect::<Vec<_>>().as_slice() {
        ["capture", job] => run_capture(PathBuf::from(job)).await,
        ["probe", url] => metadata::probe(url, None).map(|info| print!("{}", info)),
        ["probe", url, format] => {
            metadata::probe(url, Some(*format)).map(|info| print!("{}", info))
        }
        ["devices"] => {
            for device in ffmpeg_pipe::device::input_devices() {
                println!("{}", device);
            }
            Ok(())
        }
        _ => usage(),
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}
