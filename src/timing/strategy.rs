//! Frame delivery strategies
//!
//! Every strategy answers the same two questions on each consumer tick:
//! should a frame be handed over now, and which one. Shared bookkeeping lives
//! in [`TimingState`]; a strategy only owns what is specific to it.

use std::collections::TryReserveError;
use std::mem;
use std::time::Instant;

use tracing::trace;

use super::{FrameSource, TimingState, TimingStrategy};

pub trait DeliveryStrategy: Send {
    fn kind(&self) -> TimingStrategy;

    fn should_deliver(&mut self, state: &mut TimingState, now: Instant) -> bool;

    fn select_frame(&mut self, state: &mut TimingState, now: Instant) -> FrameSource;

    /// Whether [`DeliveryStrategy::on_source_frame`] wants a copy of each frame
    fn keeps_snapshots(&self) -> bool {
        false
    }

    /// A completed source frame was published to the front buffer.
    ///
    /// `snapshot` holds a copy of it when the strategy keeps snapshots. The
    /// strategy may swap in a buffer of its own for the caller to reuse.
    fn on_source_frame(&mut self, state: &mut TimingState, _snapshot: &mut Vec<u8>, now: Instant) {
        state.record_source_frame(now);
    }

    /// Pixels of a strategy-owned snapshot
    fn snapshot(&self, _index: usize) -> Option<&[u8]> {
        None
    }
}

/// Hand over the front buffer on every tick
pub struct Passthrough;

impl DeliveryStrategy for Passthrough {
    fn kind(&self) -> TimingStrategy {
        TimingStrategy::Passthrough
    }

    fn should_deliver(&mut self, _state: &mut TimingState, _now: Instant) -> bool {
        true
    }

    fn select_frame(&mut self, _state: &mut TimingState, _now: Instant) -> FrameSource {
        FrameSource::Front
    }
}

/// Paced delivery with frame-debt bookkeeping
pub struct Adaptive;

impl DeliveryStrategy for Adaptive {
    fn kind(&self) -> TimingStrategy {
        TimingStrategy::Adaptive
    }

    fn should_deliver(&mut self, state: &mut TimingState, now: Instant) -> bool {
        state.paced_should_deliver(now)
    }

    fn select_frame(&mut self, state: &mut TimingState, _now: Instant) -> FrameSource {
        // Never withholds a render, the debt only feeds statistics
        state.settle_debt();
        FrameSource::Front
    }
}

/// Same pacing as [`Adaptive`]; reserved for alignment with consumer vsync
pub struct VsyncAware;

impl DeliveryStrategy for VsyncAware {
    fn kind(&self) -> TimingStrategy {
        TimingStrategy::VsyncAware
    }

    fn should_deliver(&mut self, state: &mut TimingState, now: Instant) -> bool {
        state.paced_should_deliver(now)
    }

    fn select_frame(&mut self, state: &mut TimingState, _now: Instant) -> FrameSource {
        state.settle_debt();
        FrameSource::Front
    }
}

const RING_SLOTS: usize = 3;

/// Keeps copies of the last three source frames.
///
/// Delivery returns the newest copy; blending between the two timestamped
/// neighbours of the delivery instant is not implemented.
pub struct Interpolation {
    ring: [Vec<u8>; RING_SLOTS],
    timestamps: [Option<Instant>; RING_SLOTS],
    write_index: usize,
    ready: bool,
}

impl Interpolation {
    pub fn allocate(frame_size: usize) -> Result<Self, TryReserveError> {
        let mut ring: [Vec<u8>; RING_SLOTS] = Default::default();
        for slot in &mut ring {
            slot.try_reserve_exact(frame_size)?;
            slot.resize(frame_size, 0);
        }

        Ok(Self {
            ring,
            timestamps: [None; RING_SLOTS],
            write_index: 0,
            ready: false,
        })
    }

    pub fn newest(&self) -> Option<(usize, Instant)> {
        if !self.ready {
            return None;
        }
        self.timestamps[self.write_index].map(|at| (self.write_index, at))
    }
}

impl DeliveryStrategy for Interpolation {
    fn kind(&self) -> TimingStrategy {
        TimingStrategy::Interpolation
    }

    fn should_deliver(&mut self, state: &mut TimingState, now: Instant) -> bool {
        state.paced_should_deliver(now)
    }

    fn select_frame(&mut self, state: &mut TimingState, now: Instant) -> FrameSource {
        match self.newest() {
            Some((index, captured_at)) => {
                trace!(
                    slot = index,
                    age_us = now.saturating_duration_since(captured_at).as_micros() as u64,
                    "Delivering snapshot"
                );
                state.record_interpolated();
                FrameSource::Snapshot(index)
            }
            None => FrameSource::Front,
        }
    }

    fn keeps_snapshots(&self) -> bool {
        true
    }

    fn on_source_frame(&mut self, state: &mut TimingState, snapshot: &mut Vec<u8>, now: Instant) {
        state.record_source_frame(now);
        if snapshot.is_empty() {
            return;
        }

        // O(1): the filled copy takes the oldest slot, which goes back to the caller
        let next = (self.write_index + 1) % RING_SLOTS;
        mem::swap(&mut self.ring[next], snapshot);
        self.timestamps[next] = Some(now);
        self.write_index = next;
        self.ready = true;
    }

    fn snapshot(&self, index: usize) -> Option<&[u8]> {
        self.ring.get(index).map(Vec::as_slice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_passthrough_always_front() {
        let mut state = TimingState::new(50.0, 50.0);
        let mut strategy = Passthrough;
        let now = Instant::now();

        for _ in 0..100 {
            assert!(strategy.should_deliver(&mut state, now));
            assert_eq!(strategy.select_frame(&mut state, now), FrameSource::Front);
        }
    }

    #[test]
    fn test_interpolation_ring_rotates() {
        let mut state = TimingState::new(50.0, 50.0);
        let mut strategy = Interpolation::allocate(4).unwrap();
        let start = Instant::now();

        assert_eq!(strategy.select_frame(&mut state, start), FrameSource::Front);

        let mut spare = Vec::new();
        for value in 1..=4u8 {
            let at = start + Duration::from_millis(20 * u64::from(value));
            spare.clear();
            spare.extend_from_slice(&[value; 4]);
            strategy.on_source_frame(&mut state, &mut spare, at);
        }
        // The last write displaced slot 1, which held frame 1
        assert_eq!(spare, vec![1u8; 4]);

        // 4 writes into 3 slots starting after index 0: 1, 2, 0, 1
        let FrameSource::Snapshot(index) = strategy.select_frame(&mut state, start) else {
            panic!("expected snapshot");
        };
        assert_eq!(index, 1);
        assert_eq!(strategy.snapshot(index), Some(&[4u8; 4][..]));
        assert_eq!(strategy.snapshot(0), Some(&[3u8; 4][..]));
        assert_eq!(state.stats().frames_received, 4);
        assert_eq!(state.stats().frames_interpolated, 1);
    }

    #[test]
    fn test_empty_snapshot_leaves_ring_alone() {
        let mut state = TimingState::new(50.0, 50.0);
        let mut strategy = Interpolation::allocate(4).unwrap();

        strategy.on_source_frame(&mut state, &mut Vec::new(), Instant::now());
        assert_eq!(strategy.newest(), None);
        assert_eq!(state.stats().frames_received, 1);
        assert!(!Adaptive.keeps_snapshots());
        assert!(strategy.keeps_snapshots());
    }

    #[test]
    fn test_interpolation_allocation_failure() {
        assert!(Interpolation::allocate(usize::MAX).is_err());
    }
}
