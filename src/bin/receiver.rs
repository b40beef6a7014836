//! Stream Receiver Application
//!
//! Receives the VIC video and audio streams and emulates a render consumer
//! ticking at the configured frame rate.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::{interval, MissedTickBehavior};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use c64u_stream::{
    config::AppConfig,
    network::TcpControlSender,
    stream::{StatsReporter, StreamContext},
    timing::normalize_target_fps,
};

const STATS_INTERVAL: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting C64U stream receiver");

    // Config path from the first argument, platform default otherwise
    let config = match std::env::args().nth(1).map(PathBuf::from) {
        Some(path) => AppConfig::load(&path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => AppConfig::load_or_default()?,
    };
    config.validate()?;

    let control = Arc::new(TcpControlSender::new(
        config.network.device_address.clone(),
        config.network.control_port,
        config.network.control_timeout(),
    ));
    if control.is_unconfigured() {
        tracing::warn!("No device address configured; start the stream on the device manually");
    }

    let target_fps = normalize_target_fps(config.timing.target_fps);
    let mut context = StreamContext::new(config, control)?;
    context.start()?;

    tracing::info!(
        "Listening for video on {:?}, audio on {:?}",
        context.local_video_addr(),
        context.local_audio_addr()
    );

    let recorder = context.recorder();
    if recorder.is_recording() || recorder.is_saving_frames() {
        tracing::info!("Recording into {}", recorder.output_dir().display());
    }

    let mut render_tick = interval(Duration::from_secs_f64(1.0 / target_fps));
    render_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut stats_tick = interval(STATS_INTERVAL);
    stats_tick.tick().await;

    let audio = context.audio_frames();
    let mut reporter = StatsReporter::new(context.stats(), Instant::now());
    let mut rendered: u64 = 0;
    let mut audio_samples: u64 = 0;

    tracing::info!("Receiving - press Ctrl+C to stop");

    loop {
        tokio::select! {
            _ = render_tick.tick() => {
                let now = Instant::now();
                if context.poll_should_render(now) {
                    if let Some(frame) = context.acquire_frame_for_render(now) {
                        // Stand-in for a texture upload
                        if frame.is_fresh() {
                            rendered += 1;
                        }
                    }
                }

                // Nothing plays the audio, keep the channel drained
                while let Ok(frame) = audio.try_recv() {
                    audio_samples += frame.samples.len() as u64;
                }
            }
            _ = stats_tick.tick() => {
                reporter.report(context.stats(), Instant::now());
                if let Some(timing) = context.timing_stats() {
                    tracing::info!(
                        "TIMING: {:?} | debt {:.2} | {} dropped | {} duplicated | {} interpolated",
                        context.active_strategy(),
                        timing.frame_debt,
                        timing.frames_dropped,
                        timing.frames_duplicated,
                        timing.frames_interpolated
                    );
                }
                let snapshot = serde_json::to_string(&context.stats().snapshot())?;
                tracing::debug!(
                    %snapshot,
                    rendered,
                    audio_samples,
                    "Stats snapshot"
                );
            }
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to listen for Ctrl+C")?;
                tracing::info!("Shutting down");
                break;
            }
        }
    }

    if let Some(summary) = context.recorder().stop() {
        tracing::info!(
            "Recorded {} frames and {} audio samples in {} ms",
            summary.frames,
            summary.audio_samples,
            summary.duration_ms
        );
    }
    context.stop();
    tracing::info!("Rendered {} fresh frames", rendered);
    Ok(())
}
