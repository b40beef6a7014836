//! Stream statistics
//!
//! Counters are plain relaxed atomics written by the worker threads and read
//! by whoever wants a report. A [`StatsSnapshot`] is a consistent-enough copy
//! for logging; no counter is ever used for control flow.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::video::assembler::{FrameOutcome, IngestReport, PacketDisposition};

const NO_SEQUENCE: u32 = u32::MAX;

/// Detects gaps in a wrapping u16 sequence
#[derive(Debug)]
struct SequenceTracker {
    last: AtomicU32,
}

impl SequenceTracker {
    fn new() -> Self {
        Self {
            last: AtomicU32::new(NO_SEQUENCE),
        }
    }

    /// Returns how many sequence numbers were skipped before `sequence`
    fn observe(&self, sequence: u16) -> u16 {
        let previous = self.last.swap(u32::from(sequence), Ordering::Relaxed);
        if previous == NO_SEQUENCE {
            return 0;
        }

        let expected = (previous as u16).wrapping_add(1);
        let gap = sequence.wrapping_sub(expected);
        // Anything in the upper half is a reordered or repeated packet
        if gap < 0x8000 {
            gap
        } else {
            0
        }
    }

    fn reset(&self) {
        self.last.store(NO_SEQUENCE, Ordering::Relaxed);
    }
}

#[derive(Debug)]
pub struct StreamStats {
    video_packets: AtomicU64,
    video_bytes: AtomicU64,
    audio_packets: AtomicU64,
    audio_bytes: AtomicU64,
    invalid_packets: AtomicU64,
    duplicate_packets: AtomicU64,
    stale_packets: AtomicU64,
    out_of_range_packets: AtomicU64,
    video_sequence_gaps: AtomicU64,
    audio_sequence_gaps: AtomicU64,
    frames_completed: AtomicU64,
    frames_timed_out: AtomicU64,
    frames_preempted: AtomicU64,
    buffer_swaps: AtomicU64,
    frames_delivered: AtomicU64,
    audio_overflows: AtomicU64,
    video_sequence: SequenceTracker,
    audio_sequence: SequenceTracker,
}

impl Default for StreamStats {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamStats {
    pub fn new() -> Self {
        Self {
            video_packets: AtomicU64::new(0),
            video_bytes: AtomicU64::new(0),
            audio_packets: AtomicU64::new(0),
            audio_bytes: AtomicU64::new(0),
            invalid_packets: AtomicU64::new(0),
            duplicate_packets: AtomicU64::new(0),
            stale_packets: AtomicU64::new(0),
            out_of_range_packets: AtomicU64::new(0),
            video_sequence_gaps: AtomicU64::new(0),
            audio_sequence_gaps: AtomicU64::new(0),
            frames_completed: AtomicU64::new(0),
            frames_timed_out: AtomicU64::new(0),
            frames_preempted: AtomicU64::new(0),
            buffer_swaps: AtomicU64::new(0),
            frames_delivered: AtomicU64::new(0),
            audio_overflows: AtomicU64::new(0),
            video_sequence: SequenceTracker::new(),
            audio_sequence: SequenceTracker::new(),
        }
    }

    fn counters(&self) -> [&AtomicU64; 16] {
        [
            &self.video_packets,
            &self.video_bytes,
            &self.audio_packets,
            &self.audio_bytes,
            &self.invalid_packets,
            &self.duplicate_packets,
            &self.stale_packets,
            &self.out_of_range_packets,
            &self.video_sequence_gaps,
            &self.audio_sequence_gaps,
            &self.frames_completed,
            &self.frames_timed_out,
            &self.frames_preempted,
            &self.buffer_swaps,
            &self.frames_delivered,
            &self.audio_overflows,
        ]
    }

    /// Any datagram that arrived on the video socket
    pub fn record_video_datagram(&self, bytes: usize) {
        self.video_packets.fetch_add(1, Ordering::Relaxed);
        self.video_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_video_sequence(&self, sequence: u16) {
        let gap = self.video_sequence.observe(sequence);
        if gap > 0 {
            self.video_sequence_gaps.fetch_add(u64::from(gap), Ordering::Relaxed);
        }
    }

    pub fn record_audio_datagram(&self, bytes: usize) {
        self.audio_packets.fetch_add(1, Ordering::Relaxed);
        self.audio_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_audio_sequence(&self, sequence: u16) {
        let gap = self.audio_sequence.observe(sequence);
        if gap > 0 {
            self.audio_sequence_gaps.fetch_add(u64::from(gap), Ordering::Relaxed);
        }
    }

    pub fn record_invalid(&self) {
        self.invalid_packets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_outcome(&self, outcome: FrameOutcome) {
        let counter = match outcome {
            FrameOutcome::Completed(_) => &self.frames_completed,
            FrameOutcome::TimedOut(_) => &self.frames_timed_out,
            FrameOutcome::Preempted(_) => &self.frames_preempted,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Fold one assembler report into the counters
    pub fn apply(&self, report: &IngestReport) {
        match report.disposition {
            PacketDisposition::Stored => {}
            PacketDisposition::Duplicate => {
                self.duplicate_packets.fetch_add(1, Ordering::Relaxed);
            }
            PacketDisposition::Stale => {
                self.stale_packets.fetch_add(1, Ordering::Relaxed);
            }
            PacketDisposition::OutOfRange => {
                self.out_of_range_packets.fetch_add(1, Ordering::Relaxed);
            }
        }

        if let Some(outcome) = report.previous {
            self.record_outcome(outcome);
        }
        if let Some(frame_number) = report.completed {
            self.record_outcome(FrameOutcome::Completed(frame_number));
        }
    }

    pub fn record_swap(&self) {
        self.buffer_swaps.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delivered(&self) {
        self.frames_delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_audio_overflow(&self) {
        self.audio_overflows.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reset(&self) {
        for counter in self.counters() {
            counter.store(0, Ordering::Relaxed);
        }
        self.video_sequence.reset();
        self.audio_sequence.reset();
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        StatsSnapshot {
            timestamp: Utc::now(),
            video_packets: load(&self.video_packets),
            video_bytes: load(&self.video_bytes),
            audio_packets: load(&self.audio_packets),
            audio_bytes: load(&self.audio_bytes),
            invalid_packets: load(&self.invalid_packets),
            duplicate_packets: load(&self.duplicate_packets),
            stale_packets: load(&self.stale_packets),
            out_of_range_packets: load(&self.out_of_range_packets),
            video_sequence_gaps: load(&self.video_sequence_gaps),
            audio_sequence_gaps: load(&self.audio_sequence_gaps),
            frames_completed: load(&self.frames_completed),
            frames_timed_out: load(&self.frames_timed_out),
            frames_preempted: load(&self.frames_preempted),
            buffer_swaps: load(&self.buffer_swaps),
            frames_delivered: load(&self.frames_delivered),
            audio_overflows: load(&self.audio_overflows),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub timestamp: DateTime<Utc>,
    pub video_packets: u64,
    pub video_bytes: u64,
    pub audio_packets: u64,
    pub audio_bytes: u64,
    pub invalid_packets: u64,
    pub duplicate_packets: u64,
    pub stale_packets: u64,
    pub out_of_range_packets: u64,
    pub video_sequence_gaps: u64,
    pub audio_sequence_gaps: u64,
    pub frames_completed: u64,
    pub frames_timed_out: u64,
    pub frames_preempted: u64,
    pub buffer_swaps: u64,
    pub frames_delivered: u64,
    pub audio_overflows: u64,
}

impl StatsSnapshot {
    /// Video packets lost in transit, as a percentage of packets sent
    pub fn video_loss_percent(&self) -> f64 {
        let expected = self.video_packets + self.video_sequence_gaps;
        if expected == 0 {
            0.0
        } else {
            100.0 * self.video_sequence_gaps as f64 / expected as f64
        }
    }

    pub fn frames_dropped(&self) -> u64 {
        self.frames_timed_out + self.frames_preempted
    }

    /// True when nothing has been counted since the last reset
    pub fn is_empty(&self) -> bool {
        self.video_packets == 0
            && self.audio_packets == 0
            && self.invalid_packets == 0
            && self.frames_completed == 0
            && self.frames_dropped() == 0
            && self.buffer_swaps == 0
            && self.frames_delivered == 0
            && self.audio_overflows == 0
    }
}

/// Rates over one reporting period
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct StatsRates {
    pub completed_fps: f64,
    pub delivered_fps: f64,
    pub video_pps: f64,
    pub video_mbps: f64,
    pub audio_pps: f64,
    pub loss_percent: f64,
}

/// Periodic rate logging from successive snapshots
pub struct StatsReporter {
    last: StatsSnapshot,
    last_at: Instant,
}

impl StatsReporter {
    pub fn new(stats: &StreamStats, now: Instant) -> Self {
        Self {
            last: stats.snapshot(),
            last_at: now,
        }
    }

    /// Compute and log rates since the previous call
    pub fn report(&mut self, stats: &StreamStats, now: Instant) -> StatsRates {
        let current = stats.snapshot();
        let secs = now.saturating_duration_since(self.last_at).as_secs_f64();
        let rates = Self::rates(&self.last, &current, secs);

        info!(
            "VIDEO: {:.1} fps | {:.2} Mbps | {:.0} pps | Loss: {:.1}% | Frames: {}",
            rates.completed_fps,
            rates.video_mbps,
            rates.video_pps,
            rates.loss_percent,
            current.frames_completed
        );
        info!(
            "DELIVERY: {:.1} fps delivered | {} timed out | {} preempted | {} invalid",
            rates.delivered_fps,
            current.frames_timed_out,
            current.frames_preempted,
            current.invalid_packets
        );
        if current.audio_packets > 0 {
            info!(
                "AUDIO: {:.0} pps | {} gaps | {} overflows",
                rates.audio_pps, current.audio_sequence_gaps, current.audio_overflows
            );
        }

        self.last = current;
        self.last_at = now;
        rates
    }

    fn rates(before: &StatsSnapshot, after: &StatsSnapshot, secs: f64) -> StatsRates {
        if secs <= 0.0 {
            return StatsRates::default();
        }

        // Counters can go backwards across a reset
        let delta = |a: u64, b: u64| b.saturating_sub(a) as f64;
        let packets = delta(before.video_packets, after.video_packets);
        let gaps = delta(before.video_sequence_gaps, after.video_sequence_gaps);

        StatsRates {
            completed_fps: delta(before.frames_completed, after.frames_completed) / secs,
            delivered_fps: delta(before.frames_delivered, after.frames_delivered) / secs,
            video_pps: packets / secs,
            video_mbps: delta(before.video_bytes, after.video_bytes) * 8.0 / secs / 1_000_000.0,
            audio_pps: delta(before.audio_packets, after.audio_packets) / secs,
            loss_percent: if packets + gaps > 0.0 {
                100.0 * gaps / (packets + gaps)
            } else {
                0.0
            },
        }
    }
}
