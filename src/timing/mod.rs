//! Frame timing engine
//!
//! The device produces frames at 50.125 Hz (PAL) or 59.826 Hz (NTSC) while the
//! consumer usually renders at an even 50 or 60 Hz. The timing engine sits
//! between the double buffer and the consumer and decides, per render tick,
//! whether to hand over a frame and which one.
//!
//! Rendering is never withheld for long: the pacing policy delivers whenever
//! half a target interval has passed. Frame debt is bookkeeping only and shows
//! up in the statistics as dropped and duplicated frames.

pub mod strategy;

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::ConfigError;
use strategy::{Adaptive, DeliveryStrategy, Interpolation, Passthrough, VsyncAware};

/// Deliveries that always go through so the consumer never starts on a black screen
const WARMUP_DELIVERIES: u64 = 10;

/// Source frames needed before pacing kicks in
const MIN_SOURCE_FRAMES: u64 = 5;

/// Source frames needed before frame debt is tracked
const DEBT_MIN_SOURCE_FRAMES: u64 = 10;

/// Debt beyond which one frame is counted as dropped or duplicated
const DEBT_THRESHOLD: f64 = 2.0;

/// Standard consumer rates and the tolerance used to snap to them
const STANDARD_RATES: [f64; 4] = [60.0, 50.0, 30.0, 25.0];
const STANDARD_RATE_TOLERANCE: f64 = 1.0;

/// Mismatch between source and target rate worth a warning
const RATE_MISMATCH_WARN: f64 = 0.01;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimingStrategy {
    #[default]
    Passthrough = 0,
    Adaptive = 1,
    Interpolation = 2,
    VsyncAware = 3,
}

impl TimingStrategy {
    /// Map the numeric selector used by host settings
    pub fn from_selector(selector: i64) -> Result<Self, ConfigError> {
        match selector {
            0 => Ok(TimingStrategy::Passthrough),
            1 => Ok(TimingStrategy::Adaptive),
            2 => Ok(TimingStrategy::Interpolation),
            3 => Ok(TimingStrategy::VsyncAware),
            other => Err(ConfigError::InvalidStrategy(other)),
        }
    }

    pub fn selector(self) -> i64 {
        self as i64
    }
}

/// Snap a measured consumer rate to the nearest standard rate within 1 Hz
pub fn normalize_target_fps(raw: f64) -> f64 {
    for rate in STANDARD_RATES {
        if (raw - rate).abs() <= STANDARD_RATE_TOLERANCE {
            return rate;
        }
    }

    warn!("Non-standard target frame rate: {:.3} Hz", raw);
    raw
}

fn interval_for(fps: f64) -> Duration {
    Duration::from_nanos((1_000_000_000.0 / fps) as u64)
}

/// Which pixels a delivery should show
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameSource {
    /// The double buffer's front buffer
    Front,
    /// A copy owned by the strategy
    Snapshot(usize),
}

/// Counters and pacing state shared by every strategy
#[derive(Debug)]
pub struct TimingState {
    target_fps: f64,
    source_fps: f64,
    target_interval: Duration,
    source_interval: Duration,
    frame_debt: f64,
    last_delivery: Option<Instant>,
    last_source_frame: Option<Instant>,
    /// Start of the current debt window and frames received at that point
    debt_window: Option<(Instant, u64)>,
    frames_delivered: u64,
    frames_received: u64,
    frames_dropped: u64,
    frames_duplicated: u64,
    frames_interpolated: u64,
}

impl TimingState {
    pub fn new(target_fps: f64, source_fps: f64) -> Self {
        Self {
            target_fps,
            source_fps,
            target_interval: interval_for(target_fps),
            source_interval: interval_for(source_fps),
            frame_debt: 0.0,
            last_delivery: None,
            last_source_frame: None,
            debt_window: None,
            frames_delivered: 0,
            frames_received: 0,
            frames_dropped: 0,
            frames_duplicated: 0,
            frames_interpolated: 0,
        }
    }

    pub fn target_interval(&self) -> Duration {
        self.target_interval
    }

    pub fn source_interval(&self) -> Duration {
        self.source_interval
    }

    pub fn last_source_frame(&self) -> Option<Instant> {
        self.last_source_frame
    }

    pub fn record_source_frame(&mut self, now: Instant) {
        self.frames_received += 1;
        self.last_source_frame = Some(now);
    }

    /// Delivery policy of the pacing strategies
    pub fn paced_should_deliver(&mut self, now: Instant) -> bool {
        self.update_debt(now);

        if self.frames_delivered < WARMUP_DELIVERIES {
            return true;
        }

        let last = match self.last_delivery {
            Some(last) if self.frames_received >= MIN_SOURCE_FRAMES => last,
            _ => {
                self.last_delivery = Some(now);
                return true;
            }
        };

        let elapsed = now.saturating_duration_since(last);
        if elapsed >= self.target_interval / 2 {
            return true;
        }

        let expected = elapsed.as_nanos() / self.target_interval.as_nanos().max(1);
        u128::from(self.frames_delivered) <= expected
    }

    fn update_debt(&mut self, now: Instant) {
        if self.frames_received <= DEBT_MIN_SOURCE_FRAMES {
            return;
        }

        let Some((start, received_at_start)) = self.debt_window else {
            self.debt_window = Some((now, self.frames_received));
            return;
        };

        let elapsed = now.saturating_duration_since(start);
        if elapsed <= self.target_interval {
            return;
        }

        let frames = (self.frames_received - received_at_start) as f64;
        let source_rate = frames / elapsed.as_secs_f64();
        self.frame_debt += source_rate / self.target_fps - 1.0;
        self.debt_window = Some((now, self.frames_received));
    }

    /// Turn accumulated debt into drop/duplicate counts
    pub fn settle_debt(&mut self) {
        if self.frame_debt > DEBT_THRESHOLD {
            self.frame_debt -= 1.0;
            self.frames_dropped += 1;
        } else if self.frame_debt < -DEBT_THRESHOLD {
            self.frame_debt += 1.0;
            self.frames_duplicated += 1;
        }
    }

    pub fn record_interpolated(&mut self) {
        self.frames_interpolated += 1;
    }

    pub fn on_delivered(&mut self, now: Instant) {
        self.frames_delivered += 1;

        if let Some(last) = self.last_delivery {
            if now.saturating_duration_since(last) < self.target_interval / 2 {
                self.frames_duplicated += 1;
            }
        }

        self.last_delivery = Some(now);
    }

    pub fn frame_debt(&self) -> f64 {
        self.frame_debt
    }

    pub fn stats(&self) -> TimingStats {
        TimingStats {
            target_fps: self.target_fps,
            source_fps: self.source_fps,
            frame_debt: self.frame_debt,
            frames_delivered: self.frames_delivered,
            frames_received: self.frames_received,
            frames_dropped: self.frames_dropped,
            frames_duplicated: self.frames_duplicated,
            frames_interpolated: self.frames_interpolated,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TimingStats {
    pub target_fps: f64,
    pub source_fps: f64,
    pub frame_debt: f64,
    pub frames_delivered: u64,
    pub frames_received: u64,
    pub frames_dropped: u64,
    pub frames_duplicated: u64,
    pub frames_interpolated: u64,
}

impl TimingStats {
    fn percent(count: u64, total: u64) -> f64 {
        if total == 0 {
            0.0
        } else {
            100.0 * count as f64 / total as f64
        }
    }

    /// Dropped frames as a share of received frames
    pub fn drop_rate(&self) -> f64 {
        Self::percent(self.frames_dropped, self.frames_received)
    }

    pub fn duplicate_rate(&self) -> f64 {
        Self::percent(self.frames_duplicated, self.frames_delivered)
    }

    pub fn interpolation_rate(&self) -> f64 {
        Self::percent(self.frames_interpolated, self.frames_delivered)
    }
}

/// Outcome of creating the timing engine
pub enum TimingInit {
    Initialized(FrameTiming),
    /// The requested strategy could not be set up; `timing` runs adaptive instead
    InitializedWithFallback { timing: FrameTiming, reason: String },
}

impl TimingInit {
    pub fn into_timing(self) -> FrameTiming {
        match self {
            TimingInit::Initialized(timing) => timing,
            TimingInit::InitializedWithFallback { timing, .. } => timing,
        }
    }
}

/// Timing engine for one detected video format
pub struct FrameTiming {
    state: TimingState,
    strategy: Box<dyn DeliveryStrategy>,
}

impl FrameTiming {
    pub fn new(
        kind: TimingStrategy,
        target_fps: f64,
        source_fps: f64,
        frame_size: usize,
    ) -> TimingInit {
        let state = TimingState::new(target_fps, source_fps);

        info!(
            strategy = ?kind,
            "Timing initialized: source {:.3} Hz -> target {:.1} Hz",
            source_fps,
            target_fps
        );
        info!(
            "Frame intervals: source {:.3} ms, target {:.3} ms",
            state.source_interval.as_secs_f64() * 1000.0,
            state.target_interval.as_secs_f64() * 1000.0
        );

        let mismatch = (source_fps - target_fps).abs() / target_fps;
        if mismatch > RATE_MISMATCH_WARN {
            warn!(
                "Source and target rates differ by {:.1}%, expect dropped or repeated frames",
                mismatch * 100.0
            );
        }

        let strategy: Box<dyn DeliveryStrategy> = match kind {
            TimingStrategy::Passthrough => Box::new(Passthrough),
            TimingStrategy::Adaptive => Box::new(Adaptive),
            TimingStrategy::VsyncAware => Box::new(VsyncAware),
            TimingStrategy::Interpolation => match Interpolation::allocate(frame_size) {
                Ok(ring) => {
                    info!("Interpolation buffers allocated");
                    Box::new(ring)
                }
                Err(e) => {
                    let reason = format!("interpolation buffers ({} bytes each): {}", frame_size, e);
                    warn!("Failed to allocate {}, falling back to adaptive", reason);
                    return TimingInit::InitializedWithFallback {
                        timing: Self {
                            state,
                            strategy: Box::new(Adaptive),
                        },
                        reason,
                    };
                }
            },
        };

        TimingInit::Initialized(Self { state, strategy })
    }

    pub fn should_deliver(&mut self, now: Instant) -> bool {
        self.strategy.should_deliver(&mut self.state, now)
    }

    pub fn select_frame(&mut self, now: Instant) -> FrameSource {
        self.strategy.select_frame(&mut self.state, now)
    }

    pub fn snapshot(&self, index: usize) -> Option<&[u8]> {
        self.strategy.snapshot(index)
    }

    pub fn keeps_snapshots(&self) -> bool {
        self.strategy.keeps_snapshots()
    }

    /// A new frame was committed to the front buffer. See
    /// [`DeliveryStrategy::on_source_frame`] for what happens to `snapshot`.
    pub fn on_source_frame(&mut self, snapshot: &mut Vec<u8>, now: Instant) {
        self.strategy.on_source_frame(&mut self.state, snapshot, now);
    }

    pub fn on_delivered(&mut self, now: Instant) {
        self.state.on_delivered(now);
    }

    /// Strategy actually in effect
    pub fn strategy(&self) -> TimingStrategy {
        self.strategy.kind()
    }

    pub fn frame_debt(&self) -> f64 {
        self.state.frame_debt()
    }

    pub fn stats(&self) -> TimingStats {
        self.state.stats()
    }
}

impl Drop for FrameTiming {
    fn drop(&mut self) {
        let stats = self.state.stats();
        if stats.frames_received == 0 {
            return;
        }

        info!(
            "Final timing stats: {} received, {} delivered",
            stats.frames_received, stats.frames_delivered
        );
        info!(
            "Drops: {} ({:.1}%), Duplicates: {} ({:.1}%), Interpolated: {} ({:.1}%)",
            stats.frames_dropped,
            stats.drop_rate(),
            stats.frames_duplicated,
            stats.duplicate_rate(),
            stats.frames_interpolated,
            stats.interpolation_rate()
        );
    }
}
