//! Frame assembly from lossy, unordered video packets
//!
//! One slot table is live at a time and belongs to the frame number in
//! progress. A packet carrying a different frame number finalizes the current
//! frame (delivered, timed out or preempted) before a fresh table is started.
//!
//! ```text
//!            packet(n)                      last slot filled
//!  Empty ───────────────▶ Accumulating ─────────────────────▶ Complete ──▶ sink
//!    ▲                        │   │
//!    │        packet(m != n)  │   │ age > timeout
//!    │◀── Preempted ──────────┘   └──────────▶ TimedOut
//!    └────────────────────────────────────────────┘
//! ```

use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::constants::{FRAME_TIMEOUT, MAX_PACKETS_PER_FRAME, VIDEO_PAYLOAD_SIZE};
use crate::protocol::VideoPacket;
use crate::video::format::{FormatDetector, VideoFormat};

/// Receives each assembled frame exactly once
pub trait FrameSink {
    fn frame_complete(&mut self, frame: &AssembledFrame<'_>);
}

/// Lifecycle of the frame in progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    Empty,
    Accumulating,
    Complete,
    TimedOut,
}

/// How a frame left the slot table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    Completed(u16),
    /// Incomplete and older than the timeout budget
    TimedOut(u16),
    /// Incomplete, displaced by a newer frame number before timing out
    Preempted(u16),
}

/// What happened to an individual packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketDisposition {
    Stored,
    /// Slot already filled for this frame; first writer wins
    Duplicate,
    /// Packet index beyond the slot table
    OutOfRange,
    /// Late packet for a frame that was already finalized
    Stale,
}

/// Result of feeding one packet to the assembler
#[derive(Debug, Clone, PartialEq)]
pub struct IngestReport {
    pub disposition: PacketDisposition,
    /// Finalization of the previous frame, when this packet displaced it
    pub previous: Option<FrameOutcome>,
    /// Frame number completed by this packet
    pub completed: Option<u16>,
    /// Newly detected format, if this packet changed it
    pub format_change: Option<VideoFormat>,
}

impl IngestReport {
    fn new(disposition: PacketDisposition) -> Self {
        Self {
            disposition,
            previous: None,
            completed: None,
            format_change: None,
        }
    }
}

/// Borrowed view of one stored packet
#[derive(Debug, Clone, Copy)]
pub struct PacketRef<'a> {
    pub line_number: u16,
    pub lines_per_packet: u8,
    pub payload: &'a [u8],
}

/// A complete frame handed to a [`FrameSink`]
pub struct AssembledFrame<'a> {
    frame_number: u16,
    format: VideoFormat,
    table: &'a FrameSlotTable,
}

impl<'a> AssembledFrame<'a> {
    pub fn frame_number(&self) -> u16 {
        self.frame_number
    }

    pub fn format(&self) -> VideoFormat {
        self.format
    }

    /// Stored packets in slot order
    pub fn packets(&self) -> impl Iterator<Item = PacketRef<'a>> + 'a {
        self.table.stored()
    }
}

struct PacketSlot {
    line_number: u16,
    lines_per_packet: u8,
    received: bool,
    data: Box<[u8]>,
}

impl PacketSlot {
    fn new() -> Self {
        Self {
            line_number: 0,
            lines_per_packet: 0,
            received: false,
            data: vec![0; VIDEO_PAYLOAD_SIZE].into_boxed_slice(),
        }
    }
}

enum SlotInsert {
    Stored,
    Duplicate,
    OutOfRange,
}

/// Fixed-capacity packet storage for the frame in progress
pub struct FrameSlotTable {
    frame_number: Option<u16>,
    expected_packets: Option<u16>,
    received_packets: u16,
    started_at: Option<Instant>,
    slots: Vec<PacketSlot>,
}

impl FrameSlotTable {
    pub fn new() -> Self {
        Self {
            frame_number: None,
            expected_packets: None,
            received_packets: 0,
            started_at: None,
            slots: (0..MAX_PACKETS_PER_FRAME).map(|_| PacketSlot::new()).collect(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn frame_number(&self) -> Option<u16> {
        self.frame_number
    }

    pub fn expected_packets(&self) -> Option<u16> {
        self.expected_packets
    }

    pub fn received_packets(&self) -> u16 {
        self.received_packets
    }

    pub fn is_complete(&self) -> bool {
        self.received_packets > 0 && Some(self.received_packets) == self.expected_packets
    }

    pub fn is_timed_out(&self, now: Instant, budget: Duration) -> bool {
        self.started_at
            .is_some_and(|start| now.saturating_duration_since(start) > budget)
    }

    pub fn state(&self, now: Instant, budget: Duration) -> FrameState {
        if self.frame_number.is_none() {
            FrameState::Empty
        } else if self.is_complete() {
            FrameState::Complete
        } else if self.is_timed_out(now, budget) {
            FrameState::TimedOut
        } else {
            FrameState::Accumulating
        }
    }

    fn begin(&mut self, frame_number: u16, now: Instant) {
        self.clear();
        self.frame_number = Some(frame_number);
        self.started_at = Some(now);
    }

    fn clear(&mut self) {
        for slot in &mut self.slots {
            slot.received = false;
        }
        self.frame_number = None;
        self.expected_packets = None;
        self.received_packets = 0;
        self.started_at = None;
    }

    fn insert(&mut self, packet: &VideoPacket<'_>) -> SlotInsert {
        let Some(slot) = self.slots.get_mut(packet.header.packet_index()) else {
            return SlotInsert::OutOfRange;
        };
        if slot.received {
            return SlotInsert::Duplicate;
        }

        slot.line_number = packet.header.line_number;
        slot.lines_per_packet = packet.header.lines_per_packet;
        slot.data.copy_from_slice(packet.payload);
        slot.received = true;
        self.received_packets += 1;
        SlotInsert::Stored
    }

    fn set_expected(&mut self, packets: u16) {
        if self.expected_packets.is_none() {
            self.expected_packets = Some(packets);
        }
    }

    fn stored(&self) -> impl Iterator<Item = PacketRef<'_>> + '_ {
        self.slots.iter().filter(|slot| slot.received).map(|slot| PacketRef {
            line_number: slot.line_number,
            lines_per_packet: slot.lines_per_packet,
            payload: &slot.data,
        })
    }
}

impl Default for FrameSlotTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Frame assembly state machine for one video stream
pub struct FrameAssembler {
    table: FrameSlotTable,
    detector: FormatDetector,
    timeout: Duration,
    /// Guards against delivering the same frame number twice
    last_completed: Option<u16>,
    /// Last frame number that left the table for any reason
    last_finalized: Option<u16>,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self::with_timeout(FRAME_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            table: FrameSlotTable::new(),
            detector: FormatDetector::new(),
            timeout,
            last_completed: None,
            last_finalized: None,
        }
    }

    /// Feed one validated packet
    pub fn ingest<S: FrameSink + ?Sized>(
        &mut self,
        packet: &VideoPacket<'_>,
        now: Instant,
        sink: &mut S,
    ) -> IngestReport {
        let header = packet.header;
        let mut report = IngestReport::new(PacketDisposition::Stored);

        if self.table.frame_number() != Some(header.frame_number) {
            if self.last_finalized == Some(header.frame_number) {
                trace!(frame = header.frame_number, "Ignoring late packet");
                report.disposition = PacketDisposition::Stale;
                return report;
            }

            report.previous = self.finalize(now, sink);
            self.table.begin(header.frame_number, now);
        }

        match self.table.insert(packet) {
            SlotInsert::Stored => {}
            SlotInsert::Duplicate => report.disposition = PacketDisposition::Duplicate,
            SlotInsert::OutOfRange => {
                debug!(
                    frame = header.frame_number,
                    line = header.line_number,
                    "Packet index out of range"
                );
                report.disposition = PacketDisposition::OutOfRange;
                return report;
            }
        }

        if header.last_packet && self.table.expected_packets().is_none() {
            self.table.set_expected(header.packet_index() as u16 + 1);
            report.format_change = self.detector.observe(&header);
        }

        if self.table.is_complete() {
            if self.deliver(sink) {
                report.completed = Some(header.frame_number);
            }
            self.last_finalized = Some(header.frame_number);
            self.table.clear();
        }

        report
    }

    /// Give up on a frame that has been accumulating past the timeout.
    ///
    /// Called by the receive loop while the socket is idle so a stalled frame
    /// is counted even if no further packet arrives.
    pub fn expire(&mut self, now: Instant) -> Option<FrameOutcome> {
        if self.table.state(now, self.timeout) != FrameState::TimedOut {
            return None;
        }

        let frame_number = self.table.frame_number()?;
        debug!(
            frame = frame_number,
            received = self.table.received_packets(),
            "Frame timed out"
        );
        self.last_finalized = Some(frame_number);
        self.table.clear();
        Some(FrameOutcome::TimedOut(frame_number))
    }

    fn finalize<S: FrameSink + ?Sized>(&mut self, now: Instant, sink: &mut S) -> Option<FrameOutcome> {
        let frame_number = self.table.frame_number()?;

        let outcome = if self.table.is_complete() {
            if self.deliver(sink) {
                Some(FrameOutcome::Completed(frame_number))
            } else {
                None
            }
        } else if self.table.is_timed_out(now, self.timeout) {
            Some(FrameOutcome::TimedOut(frame_number))
        } else {
            Some(FrameOutcome::Preempted(frame_number))
        };

        self.last_finalized = Some(frame_number);
        self.table.clear();
        outcome
    }

    fn deliver<S: FrameSink + ?Sized>(&mut self, sink: &mut S) -> bool {
        let Some(frame_number) = self.table.frame_number() else {
            return false;
        };
        if self.last_completed == Some(frame_number) {
            return false;
        }

        let frame = AssembledFrame {
            frame_number,
            format: self.detector.current().unwrap_or_else(VideoFormat::pal),
            table: &self.table,
        };
        sink.frame_complete(&frame);
        self.last_completed = Some(frame_number);
        true
    }

    pub fn state(&self, now: Instant) -> FrameState {
        self.table.state(now, self.timeout)
    }

    pub fn table(&self) -> &FrameSlotTable {
        &self.table
    }

    pub fn format(&self) -> Option<VideoFormat> {
        self.detector.current()
    }

    pub fn last_completed(&self) -> Option<u16> {
        self.last_completed
    }

    /// Forget all frame state, including the detected format
    pub fn reset(&mut self) {
        self.table.clear();
        self.detector.reset();
        self.last_completed = None;
        self.last_finalized = None;
    }
}

impl Default for FrameAssembler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{BYTES_PER_LINE, LINES_PER_PACKET, PAL_HEIGHT};
    use crate::protocol::PacketHeader;
    use crate::video::buffer::DoubleBuffer;
    use crate::video::palette::bgra;
    use bytes::Bytes;
    use proptest::prelude::*;

    #[derive(Default)]
    struct RecordingSink {
        frames: Vec<(u16, usize)>,
    }

    impl FrameSink for RecordingSink {
        fn frame_complete(&mut self, frame: &AssembledFrame<'_>) {
            self.frames.push((frame.frame_number(), frame.packets().count()));
        }
    }

    fn packet_count(height: u32) -> usize {
        (height / u32::from(LINES_PER_PACKET)) as usize
    }

    /// Packets of one frame; every byte of packet `i` is `fill(i)`
    fn frame_packets(frame: u16, height: u32, fill: impl Fn(usize) -> u8) -> Vec<Bytes> {
        let count = packet_count(height);
        (0..count)
            .map(|i| {
                let header = PacketHeader::new(
                    i as u16,
                    frame,
                    (i * usize::from(LINES_PER_PACKET)) as u16,
                    i + 1 == count,
                );
                let payload = vec![fill(i); VIDEO_PAYLOAD_SIZE];
                VideoPacket::encode(&header, &payload).unwrap()
            })
            .collect()
    }

    fn feed<S: FrameSink>(
        assembler: &mut FrameAssembler,
        bytes: &Bytes,
        now: Instant,
        sink: &mut S,
    ) -> IngestReport {
        let packet = VideoPacket::decode(bytes).unwrap();
        assembler.ingest(&packet, now, sink)
    }

    #[test]
    fn test_in_order_frame_assembles_once() {
        let mut assembler = FrameAssembler::new();
        let mut sink = RecordingSink::default();
        let now = Instant::now();
        let packets = frame_packets(1, PAL_HEIGHT, |_| 0x10);

        let mut completed = Vec::new();
        for bytes in &packets {
            let report = feed(&mut assembler, bytes, now, &mut sink);
            assert_eq!(report.disposition, PacketDisposition::Stored);
            completed.extend(report.completed);
        }

        assert_eq!(completed, vec![1]);
        assert_eq!(sink.frames, vec![(1, 68)]);
        assert_eq!(assembler.state(now), FrameState::Empty);
        assert_eq!(assembler.last_completed(), Some(1));
    }

    #[test]
    fn test_assembled_pixels_match_palette() {
        let mut assembler = FrameAssembler::new();
        let mut buffers = DoubleBuffer::new(384, PAL_HEIGHT);
        let now = Instant::now();
        // Each packet gets a distinct nibble pair
        let packets = frame_packets(9, PAL_HEIGHT, |i| (i as u8 & 0x0F) | ((i as u8 + 3) & 0x0F) << 4);

        for bytes in packets.iter().rev() {
            feed(&mut assembler, bytes, now, &mut buffers);
        }

        assert!(buffers.is_frame_ready());
        let frame = buffers.read_handle();
        let stride = 384 * 4;
        for y in 0..PAL_HEIGHT as usize {
            let i = y / usize::from(LINES_PER_PACKET);
            let low = i as u8 & 0x0F;
            let high = (i as u8 + 3) & 0x0F;
            for x in 0..BYTES_PER_LINE {
                let left = y * stride + x * 8;
                assert_eq!(&frame[left..left + 4], &bgra(low));
                assert_eq!(&frame[left + 4..left + 8], &bgra(high));
            }
        }
    }

    #[test]
    fn test_missing_packet_preempted_without_leakage() {
        let mut assembler = FrameAssembler::new();
        let mut sink = RecordingSink::default();
        let now = Instant::now();
        let first = frame_packets(1, PAL_HEIGHT, |_| 0x11);
        let second = frame_packets(2, PAL_HEIGHT, |_| 0x22);

        for (i, bytes) in first.iter().enumerate() {
            if i != 30 {
                assert!(feed(&mut assembler, bytes, now, &mut sink).completed.is_none());
            }
        }

        let report = feed(&mut assembler, &second[0], now, &mut sink);
        assert_eq!(report.previous, Some(FrameOutcome::Preempted(1)));
        assert!(report.completed.is_none());
        assert!(sink.frames.is_empty());

        let table = assembler.table();
        assert_eq!(table.frame_number(), Some(2));
        assert_eq!(table.received_packets(), 1);
        assert_eq!(table.expected_packets(), None);

        for bytes in &second[1..] {
            feed(&mut assembler, bytes, now, &mut sink);
        }
        assert_eq!(sink.frames, vec![(2, 68)]);
    }

    #[test]
    fn test_timed_out_frame_dropped_once() {
        let mut assembler = FrameAssembler::new();
        let mut sink = RecordingSink::default();
        let start = Instant::now();
        let first = frame_packets(1, PAL_HEIGHT, |_| 0);
        let second = frame_packets(2, PAL_HEIGHT, |_| 0);

        for bytes in &first[..10] {
            feed(&mut assembler, bytes, start, &mut sink);
        }
        assert_eq!(assembler.state(start), FrameState::Accumulating);

        let late = start + FRAME_TIMEOUT + Duration::from_millis(1);
        assert_eq!(assembler.state(late), FrameState::TimedOut);

        let report = feed(&mut assembler, &second[0], late, &mut sink);
        assert_eq!(report.previous, Some(FrameOutcome::TimedOut(1)));

        // Stragglers of the dropped frame do not resurrect it
        let report = feed(&mut assembler, &first[10], late, &mut sink);
        assert_eq!(report.disposition, PacketDisposition::Stale);
        assert!(report.previous.is_none());
        assert_eq!(assembler.table().frame_number(), Some(2));
    }

    #[test]
    fn test_expire_stalled_frame() {
        let mut assembler = FrameAssembler::new();
        let mut sink = RecordingSink::default();
        let start = Instant::now();
        let packets = frame_packets(5, PAL_HEIGHT, |_| 0);

        feed(&mut assembler, &packets[0], start, &mut sink);
        assert_eq!(assembler.expire(start + Duration::from_millis(50)), None);

        let late = start + Duration::from_millis(150);
        assert_eq!(assembler.expire(late), Some(FrameOutcome::TimedOut(5)));
        assert_eq!(assembler.expire(late), None);
        assert_eq!(assembler.state(late), FrameState::Empty);

        let report = feed(&mut assembler, &packets[1], late, &mut sink);
        assert_eq!(report.disposition, PacketDisposition::Stale);
    }

    #[test]
    fn test_first_writer_wins() {
        let mut assembler = FrameAssembler::new();
        let mut buffers = DoubleBuffer::new(384, PAL_HEIGHT);
        let now = Instant::now();
        let original = frame_packets(3, PAL_HEIGHT, |_| 0x11);
        let rewrite = frame_packets(3, PAL_HEIGHT, |_| 0x22);

        feed(&mut assembler, &original[0], now, &mut buffers);
        let report = feed(&mut assembler, &rewrite[0], now, &mut buffers);
        assert_eq!(report.disposition, PacketDisposition::Duplicate);
        assert_eq!(assembler.table().received_packets(), 1);

        for bytes in &original[1..] {
            feed(&mut assembler, bytes, now, &mut buffers);
        }
        assert_eq!(&buffers.read_handle()[..4], &bgra(1));
    }

    #[test]
    fn test_out_of_range_index_ignored() {
        let mut assembler = FrameAssembler::new();
        let mut sink = RecordingSink::default();
        let now = Instant::now();

        let header = PacketHeader::new(0, 4, (MAX_PACKETS_PER_FRAME * 4) as u16, false);
        let bytes = VideoPacket::encode(&header, &[]).unwrap();
        let report = feed(&mut assembler, &bytes, now, &mut sink);
        assert_eq!(report.disposition, PacketDisposition::OutOfRange);
        assert_eq!(assembler.table().received_packets(), 0);

        for bytes in &frame_packets(4, PAL_HEIGHT, |_| 0) {
            feed(&mut assembler, bytes, now, &mut sink);
        }
        assert_eq!(sink.frames, vec![(4, 68)]);
    }

    #[test]
    fn test_late_duplicate_does_not_redeliver() {
        let mut assembler = FrameAssembler::new();
        let mut sink = RecordingSink::default();
        let now = Instant::now();
        let packets = frame_packets(7, PAL_HEIGHT, |_| 0);

        for bytes in &packets {
            feed(&mut assembler, bytes, now, &mut sink);
        }
        let report = feed(&mut assembler, packets.last().unwrap(), now, &mut sink);

        assert_eq!(report.disposition, PacketDisposition::Stale);
        assert_eq!(sink.frames.len(), 1);
    }

    #[test]
    fn test_format_change_reported() {
        let mut assembler = FrameAssembler::new();
        let mut sink = RecordingSink::default();
        let now = Instant::now();

        let pal = frame_packets(1, PAL_HEIGHT, |_| 0);
        let report = feed(&mut assembler, pal.last().unwrap(), now, &mut sink);
        assert_eq!(report.format_change.map(|f| f.height), Some(PAL_HEIGHT));

        let ntsc = frame_packets(2, 240, |_| 0);
        let mut change = None;
        for bytes in &ntsc {
            let report = feed(&mut assembler, bytes, now, &mut sink);
            change = change.or(report.format_change);
        }
        assert_eq!(change.map(|f| f.expected_fps()), Some(60.0));
        assert_eq!(sink.frames.last(), Some(&(2, 60)));

        assembler.reset();
        assert!(assembler.format().is_none());
        assert!(assembler.last_completed().is_none());
    }

    proptest! {
        #[test]
        fn completes_iff_every_packet_arrives(
            order in Just((0..68usize).collect::<Vec<_>>()).prop_shuffle(),
            dropped in proptest::option::of(0..68usize),
        ) {
            let mut assembler = FrameAssembler::new();
            let mut sink = RecordingSink::default();
            let now = Instant::now();
            let packets = frame_packets(11, PAL_HEIGHT, |i| i as u8);

            for i in order {
                if Some(i) != dropped {
                    feed(&mut assembler, &packets[i], now, &mut sink);
                }
            }

            if dropped.is_some() {
                prop_assert!(sink.frames.is_empty());
                prop_assert_eq!(assembler.table().received_packets(), 67);
            } else {
                prop_assert_eq!(sink.frames.clone(), vec![(11u16, 68usize)]);
            }
        }
    }
}
