//! Receive loops for the video and audio sockets
//!
//! Each loop runs on its own OS thread against a non-blocking socket. A
//! socket that would block is polled again after a short sleep; any other
//! socket error ends the loop and clears the running flag. Lock order is
//! assembler first, then frame. The frame lock is only taken to exchange
//! buffers; conversion, timing setup and snapshot copies happen before it.

use std::io::ErrorKind;
use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Instant;

use crossbeam_channel::{Sender, TrySendError};
use parking_lot::Mutex;
use tracing::{debug, error, info, trace};

use crate::constants::{MAX_DATAGRAM_SIZE, RECEIVE_IDLE_SLEEP};
use crate::protocol::{AudioPacket, VideoPacket};
use crate::record::Recorder;
use crate::stream::context::SharedFrame;
use crate::stream::stats::StreamStats;
use crate::stream::watchdog::PacketActivity;
use crate::timing::{FrameTiming, TimingInit};
use crate::video::assembler::{AssembledFrame, FrameAssembler, FrameSink};
use crate::video::palette::blit_packet;

/// One decoded audio packet, ready for the consumer
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub sequence: u16,
    /// Interleaved stereo samples
    pub samples: Vec<i16>,
    pub received_at: Instant,
}

/// Video worker side of the frame hand-off.
///
/// Owns the frame being converted and a spare snapshot buffer, so the frame
/// lock is held only while `Vec`s change hands.
pub(crate) struct FramePublisher<'a> {
    shared: &'a Mutex<SharedFrame>,
    stats: &'a StreamStats,
    recorder: &'a Recorder,
    frame: Vec<u8>,
    snapshot: Vec<u8>,
    /// Dimensions the installed timing engine was built for
    timing_dimensions: Option<(u32, u32)>,
}

impl<'a> FramePublisher<'a> {
    pub(crate) fn new(shared: &'a Mutex<SharedFrame>, stats: &'a StreamStats, recorder: &'a Recorder) -> Self {
        Self {
            shared,
            stats,
            recorder,
            frame: Vec::new(),
            snapshot: Vec::new(),
            timing_dimensions: None,
        }
    }
}

impl FrameSink for FramePublisher<'_> {
    fn frame_complete(&mut self, frame: &AssembledFrame<'_>) {
        let format = frame.format();
        let dimensions = (format.width, format.height);

        let size = format.frame_size();
        if self.frame.len() != size {
            self.frame.clear();
            self.frame.resize(size, 0);
        }
        for packet in frame.packets() {
            blit_packet(
                packet.payload,
                packet.line_number,
                packet.lines_per_packet,
                &mut self.frame,
                format.height,
            );
        }
        self.recorder.on_frame(&self.frame, format.width, format.height);

        let (installed, strategy, target_fps, keeps_snapshots) = {
            let shared = self.shared.lock();
            (
                shared.timing.is_some(),
                shared.strategy,
                shared.target_fps,
                shared.timing.as_ref().is_some_and(FrameTiming::keeps_snapshots),
            )
        };

        // Only this worker installs timing engines, so the answer above stays valid
        let replacement = if !installed || self.timing_dimensions != Some(dimensions) {
            let init = FrameTiming::new(strategy, target_fps, format.expected_fps(), size);
            if let TimingInit::InitializedWithFallback { reason, .. } = &init {
                debug!(reason = %reason, "Timing engine running in fallback mode");
            }
            self.timing_dimensions = Some(dimensions);
            Some(init.into_timing())
        } else {
            None
        };

        let keeps_snapshots = replacement
            .as_ref()
            .map_or(keeps_snapshots, FrameTiming::keeps_snapshots);
        if keeps_snapshots {
            self.snapshot.clear();
            self.snapshot.extend_from_slice(&self.frame);
        }

        let retired = {
            let mut guard = self.shared.lock();
            let shared = &mut *guard;
            let retired = replacement.and_then(|timing| shared.timing.replace(timing));

            shared.buffers.publish(&mut self.frame, format.width, format.height);
            if let Some(timing) = shared.timing.as_mut() {
                timing.on_source_frame(&mut self.snapshot, Instant::now());
            }
            retired
        };
        self.stats.record_swap();

        // Logs final stats and frees its ring after the lock is released
        drop(retired);
    }
}

/// Decode one video datagram and feed it to the assembler
pub(crate) fn handle_video_datagram(
    data: &[u8],
    now: Instant,
    assembler: &Mutex<FrameAssembler>,
    publisher: &mut FramePublisher<'_>,
) {
    let stats = publisher.stats;
    stats.record_video_datagram(data.len());

    let packet = match VideoPacket::decode(data) {
        Ok(packet) => packet,
        Err(e) => {
            trace!("Dropping video packet: {}", e);
            stats.record_invalid();
            return;
        }
    };
    stats.record_video_sequence(packet.header.sequence);

    let report = assembler.lock().ingest(&packet, now, publisher);
    stats.apply(&report);
}

/// Shared state a video worker runs against
pub(crate) struct VideoWorker<'a> {
    pub(crate) running: &'a AtomicBool,
    pub(crate) activity: &'a PacketActivity,
    pub(crate) assembler: &'a Mutex<FrameAssembler>,
    pub(crate) shared: &'a Mutex<SharedFrame>,
    pub(crate) stats: &'a StreamStats,
    pub(crate) recorder: &'a Recorder,
}

pub(crate) fn run_video_loop(socket: UdpSocket, worker: VideoWorker<'_>) {
    info!("Video receive loop started on {:?}", socket.local_addr().ok());
    let mut buf = [0u8; MAX_DATAGRAM_SIZE];
    let mut publisher = FramePublisher::new(worker.shared, worker.stats, worker.recorder);

    while worker.running.load(Ordering::Relaxed) {
        match socket.recv_from(&mut buf) {
            Ok((len, _)) => {
                let now = Instant::now();
                worker.activity.mark(now);
                handle_video_datagram(&buf[..len], now, worker.assembler, &mut publisher);
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                if let Some(outcome) = worker.assembler.lock().expire(Instant::now()) {
                    worker.stats.record_outcome(outcome);
                }
                thread::sleep(RECEIVE_IDLE_SLEEP);
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => {
                error!("Video socket error, stopping stream: {}", e);
                worker.running.store(false, Ordering::SeqCst);
                break;
            }
        }
    }

    info!("Video receive loop stopped");
}

/// Decode one audio datagram and hand it to the consumer without blocking
pub(crate) fn handle_audio_datagram(
    data: &[u8],
    now: Instant,
    tx: &Sender<AudioFrame>,
    stats: &StreamStats,
    recorder: &Recorder,
) {
    stats.record_audio_datagram(data.len());

    let packet = match AudioPacket::decode(data) {
        Ok(packet) => packet,
        Err(e) => {
            trace!("Dropping audio packet: {}", e);
            stats.record_invalid();
            return;
        }
    };
    stats.record_audio_sequence(packet.sequence);
    recorder.record_audio(&packet.samples);

    let frame = AudioFrame {
        sequence: packet.sequence,
        samples: packet.samples,
        received_at: now,
    };
    match tx.try_send(frame) {
        Ok(()) => {}
        Err(TrySendError::Full(_)) => stats.record_audio_overflow(),
        Err(TrySendError::Disconnected(_)) => {}
    }
}

/// Shared state an audio worker runs against
pub(crate) struct AudioWorker<'a> {
    pub(crate) running: &'a AtomicBool,
    pub(crate) activity: &'a PacketActivity,
    pub(crate) tx: &'a Sender<AudioFrame>,
    pub(crate) stats: &'a StreamStats,
    pub(crate) recorder: &'a Recorder,
}

pub(crate) fn run_audio_loop(socket: UdpSocket, worker: AudioWorker<'_>) {
    info!("Audio receive loop started on {:?}", socket.local_addr().ok());
    let mut buf = [0u8; MAX_DATAGRAM_SIZE];

    while worker.running.load(Ordering::Relaxed) {
        match socket.recv_from(&mut buf) {
            Ok((len, _)) => {
                let now = Instant::now();
                worker.activity.mark(now);
                handle_audio_datagram(&buf[..len], now, worker.tx, worker.stats, worker.recorder);
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(RECEIVE_IDLE_SLEEP),
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => {
                error!("Audio socket error, stopping stream: {}", e);
                worker.running.store(false, Ordering::SeqCst);
                break;
            }
        }
    }

    info!("Audio receive loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RecordConfig;
    use crate::constants::{AUDIO_FRAMES_PER_PACKET, BYTES_PER_LINE, LINES_PER_PACKET, PAL_HEIGHT};
    use crate::protocol::PacketHeader;
    use crate::timing::TimingStrategy;
    use crate::video::palette::bgra;
    use crate::video::DoubleBuffer;
    use crossbeam_channel::bounded;
    use std::time::Duration;

    fn shared(strategy: TimingStrategy) -> Mutex<SharedFrame> {
        Mutex::new(SharedFrame {
            buffers: DoubleBuffer::new(384, PAL_HEIGHT),
            timing: None,
            strategy,
            target_fps: 50.0,
        })
    }

    fn idle_recorder() -> Recorder {
        Recorder::new(&RecordConfig::default())
    }

    fn feed_frame(
        frame: u16,
        height: u32,
        color: u8,
        assembler: &Mutex<FrameAssembler>,
        publisher: &mut FramePublisher<'_>,
    ) {
        let packets = height / u32::from(LINES_PER_PACKET);
        let payload = vec![color | (color << 4); BYTES_PER_LINE * usize::from(LINES_PER_PACKET)];
        for index in 0..packets {
            let header = PacketHeader::new(
                (u32::from(frame) * packets + index) as u16,
                frame,
                (index * u32::from(LINES_PER_PACKET)) as u16,
                index + 1 == packets,
            );
            let bytes = VideoPacket::encode(&header, &payload).unwrap();
            handle_video_datagram(&bytes, Instant::now(), assembler, publisher);
        }
    }

    #[test]
    fn test_completed_frame_reaches_front_buffer() {
        let assembler = Mutex::new(FrameAssembler::new());
        let shared = shared(TimingStrategy::Adaptive);
        let stats = StreamStats::new();
        let recorder = idle_recorder();
        let mut publisher = FramePublisher::new(&shared, &stats, &recorder);

        feed_frame(1, PAL_HEIGHT, 5, &assembler, &mut publisher);

        let guard = shared.lock();
        assert!(guard.buffers.is_frame_ready());
        assert!(guard.buffers.read_handle().chunks(4).all(|px| px == bgra(5)));
        let timing = guard.timing.as_ref().unwrap();
        assert_eq!(timing.strategy(), TimingStrategy::Adaptive);
        assert_eq!(timing.stats().frames_received, 1);
        drop(guard);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.frames_completed, 1);
        assert_eq!(snapshot.buffer_swaps, 1);
        assert_eq!(snapshot.video_packets, 68);
        assert_eq!(snapshot.video_sequence_gaps, 0);
    }

    #[test]
    fn test_format_change_resizes_and_restarts_timing() {
        let assembler = Mutex::new(FrameAssembler::new());
        let shared = shared(TimingStrategy::Passthrough);
        let stats = StreamStats::new();
        let recorder = idle_recorder();
        let mut publisher = FramePublisher::new(&shared, &stats, &recorder);

        feed_frame(1, PAL_HEIGHT, 1, &assembler, &mut publisher);
        feed_frame(2, PAL_HEIGHT, 2, &assembler, &mut publisher);
        assert_eq!(shared.lock().timing.as_ref().unwrap().stats().frames_received, 2);

        feed_frame(3, 240, 3, &assembler, &mut publisher);
        let guard = shared.lock();
        assert_eq!(guard.buffers.dimensions(), (384, 240));
        assert_eq!(guard.buffers.frame_size(), 384 * 240 * 4);
        assert!(guard.buffers.read_handle().chunks(4).all(|px| px == bgra(3)));
        let timing = guard.timing.as_ref().unwrap();
        assert_eq!(timing.stats().source_fps, 60.0);
        assert_eq!(timing.stats().frames_received, 1);
    }

    #[test]
    fn test_interpolation_snapshots_follow_frames() {
        let assembler = Mutex::new(FrameAssembler::new());
        let shared = shared(TimingStrategy::Interpolation);
        let stats = StreamStats::new();
        let recorder = idle_recorder();
        let mut publisher = FramePublisher::new(&shared, &stats, &recorder);

        for (frame, color) in [(1u16, 4u8), (2, 8), (3, 12), (4, 9)] {
            feed_frame(frame, PAL_HEIGHT, color, &assembler, &mut publisher);

            let mut guard = shared.lock();
            let timing = guard.timing.as_mut().unwrap();
            assert_eq!(timing.strategy(), TimingStrategy::Interpolation);
            let crate::timing::FrameSource::Snapshot(index) = timing.select_frame(Instant::now()) else {
                panic!("expected snapshot");
            };
            let pixels = timing.snapshot(index).unwrap();
            assert_eq!(pixels.len(), 384 * 272 * 4);
            assert!(pixels.chunks(4).all(|px| px == bgra(color)));
        }
    }

    #[test]
    fn test_conversion_runs_without_frame_lock() {
        let dir = tempfile::tempdir().unwrap();
        let assembler = Mutex::new(FrameAssembler::new());
        let shared = shared(TimingStrategy::Interpolation);
        let stats = StreamStats::new();
        let recorder = Recorder::new(&RecordConfig {
            save_frames: true,
            record_video: false,
            output_dir: dir.path().to_path_buf(),
        });

        thread::scope(|scope| {
            // The consumer holds the frame lock for the whole conversion
            let guard = shared.lock();

            let worker = scope.spawn(|| {
                let mut publisher = FramePublisher::new(&shared, &stats, &recorder);
                feed_frame(1, PAL_HEIGHT, 7, &assembler, &mut publisher);
            });

            // The converted frame reaches the recorder before the lock is needed
            let deadline = Instant::now() + Duration::from_secs(10);
            while recorder.saved_frames() == 0 && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(1));
            }
            assert_eq!(recorder.saved_frames(), 1);
            assert!(!guard.buffers.is_frame_ready());
            drop(guard);

            worker.join().unwrap();
        });

        let guard = shared.lock();
        assert!(guard.buffers.read_handle().chunks(4).all(|px| px == bgra(7)));
        assert_eq!(guard.timing.as_ref().unwrap().stats().frames_received, 1);
    }

    #[test]
    fn test_invalid_datagram_counted() {
        let assembler = Mutex::new(FrameAssembler::new());
        let shared = shared(TimingStrategy::Passthrough);
        let stats = StreamStats::new();
        let recorder = idle_recorder();
        let mut publisher = FramePublisher::new(&shared, &stats, &recorder);

        handle_video_datagram(&[0u8; 100], Instant::now(), &assembler, &mut publisher);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.video_packets, 1);
        assert_eq!(snapshot.invalid_packets, 1);
        assert!(!shared.lock().buffers.is_frame_ready());
    }

    #[test]
    fn test_audio_overflow_never_blocks() {
        let (tx, rx) = bounded(1);
        let stats = StreamStats::new();
        let recorder = idle_recorder();

        for sequence in 0..3u16 {
            let packet = AudioPacket {
                sequence,
                samples: vec![sequence as i16; AUDIO_FRAMES_PER_PACKET * 2],
            };
            handle_audio_datagram(&packet.encode().unwrap(), Instant::now(), &tx, &stats, &recorder);
        }

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.audio_packets, 3);
        assert_eq!(snapshot.audio_overflows, 2);
        assert_eq!(rx.try_recv().unwrap().sequence, 0);
    }

    #[test]
    fn test_audio_reaches_recording() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, _rx) = bounded(4);
        let stats = StreamStats::new();
        let recorder = Recorder::new(&RecordConfig {
            save_frames: false,
            record_video: true,
            output_dir: dir.path().to_path_buf(),
        });
        let paths = recorder.start().unwrap();

        let packet = AudioPacket {
            sequence: 1,
            samples: vec![3; AUDIO_FRAMES_PER_PACKET * 2],
        };
        handle_audio_datagram(&packet.encode().unwrap(), Instant::now(), &tx, &stats, &recorder);

        let summary = recorder.stop().unwrap();
        assert_eq!(summary.audio_samples, (AUDIO_FRAMES_PER_PACKET * 2) as u64);
        assert_eq!(
            std::fs::metadata(&paths.audio).unwrap().len(),
            (AUDIO_FRAMES_PER_PACKET * 4) as u64
        );
    }

    /// A connected UDP socket reports the ICMP port unreachable of an earlier
    /// send as a receive error
    #[cfg(target_os = "linux")]
    #[test]
    fn test_fatal_socket_error_clears_running() {
        let closed = UdpSocket::bind("127.0.0.1:0").unwrap();
        let closed_addr = closed.local_addr().unwrap();
        drop(closed);

        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket.connect(closed_addr).unwrap();
        socket.send(&[0u8; 4]).unwrap();
        socket.set_nonblocking(true).unwrap();

        let running = AtomicBool::new(true);
        let activity = PacketActivity::new();
        let assembler = Mutex::new(FrameAssembler::new());
        let shared = shared(TimingStrategy::Passthrough);
        let stats = StreamStats::new();
        let recorder = idle_recorder();
        let exited = AtomicBool::new(false);

        thread::scope(|scope| {
            scope.spawn(|| {
                run_video_loop(
                    socket,
                    VideoWorker {
                        running: &running,
                        activity: &activity,
                        assembler: &assembler,
                        shared: &shared,
                        stats: &stats,
                        recorder: &recorder,
                    },
                );
                exited.store(true, Ordering::SeqCst);
            });

            let deadline = Instant::now() + Duration::from_secs(5);
            while !exited.load(Ordering::SeqCst) && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(5));
            }
            let cleared = !running.load(Ordering::SeqCst);
            // Release the loop if the error never arrived
            running.store(false, Ordering::SeqCst);
            assert!(cleared, "socket error did not stop the stream");
        });
    }
}
