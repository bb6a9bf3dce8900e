use std::sync::Arc;

use clap::{Parser, ValueEnum};
use omaf_player::{OmafPlayer, PlayerEvent};
use tracing::{error, info, level_filters::LevelFilter, warn};

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug, ValueEnum)]
enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Parser, Debug)]
#[command(version, about, long_about = "A headless OMAF VR video streaming client.")]
struct Args {
    /// Source: a local .mp4 path or an http(s) MPD URL.
    uri: String,
    #[arg(short, long, default_value = "info")]
    log_level: LogLevel,
    /// Target download buffer in milliseconds.
    #[arg(short, long, default_value = "4000")]
    buffering_ms: u64,
    /// How long to run before stopping, in seconds.
    #[arg(short, long, default_value = "30")]
    duration: u64,
}

fn log_filter(args: &Args) -> LevelFilter {
    match args.log_level {
        LogLevel::Trace => LevelFilter::TRACE,
        LogLevel::Debug => LevelFilter::DEBUG,
        LogLevel::Info => LevelFilter::INFO,
        LogLevel::Warn => LevelFilter::WARN,
        LogLevel::Error => LevelFilter::ERROR,
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .compact()
        .with_target(false)
        .with_file(true)
        .with_line_number(true)
        .with_max_level(log_filter(&args))
        .init();

    info!("starting OMAF player (headless)");
    info!("{:?}", args);

    let callback = Arc::new(|event: PlayerEvent| match event {
        PlayerEvent::StreamsCreated => info!("new streams available"),
        PlayerEvent::DownloadIssue(issue) => warn!("download issue: {:?}", issue),
        PlayerEvent::Error(err) => error!("pipeline error: {}", err),
        PlayerEvent::Info(message) => info!("{}", message),
        PlayerEvent::Warning(message) => warn!("{}", message),
    });

    let player = if args.uri.starts_with("http://") || args.uri.starts_with("https://") {
        OmafPlayer::open_url(&args.uri, callback).await
    } else {
        OmafPlayer::open_file(&args.uri, callback)
    };
    let player = match player {
        Ok(player) => player,
        Err(err) => {
            error!("failed to open {}: {}", args.uri, err);
            return;
        }
    };

    player.set_buffering_time(args.buffering_ms);
    player.start();
    info!(
        "player started: {} video / {} audio / {} metadata streams, sources {:?}",
        player.video_streams().len(),
        player.audio_streams().len(),
        player.metadata_streams().len(),
        player.video_source_types()
    );

    // pull frames at a fixed cadence, the way a decoder thread would
    let fps = 30u64;
    let frame_interval = std::time::Duration::from_micros(1_000_000 / fps);
    let started = std::time::Instant::now();
    let mut frames = 0u64;
    while started.elapsed().as_secs() < args.duration {
        let now_us = started.elapsed().as_micros() as u64;
        for packet in player.read_video_frames(now_us) {
            frames += 1;
            if packet.config_changed {
                info!(
                    "stream {}: new decoder configuration ({} bytes)",
                    packet.stream_id,
                    packet.decoder_config.as_ref().map(|c| c.len()).unwrap_or(0)
                );
            }
            if frames % 300 == 0 {
                info!(
                    "stream {}: {} frames, pts {} ms",
                    packet.stream_id,
                    frames,
                    packet.presentation_time_us / 1000
                );
            }
        }
        let _ = player.read_audio_frames();
        let _ = player.read_metadata(now_us);
        tokio::time::sleep(frame_interval).await;
    }

    player.stop();
    info!("stopped after {} video frames", frames);
}
