//! Stream lifecycle and the consumer interface
//!
//! A [`StreamContext`] owns everything for one device: the sockets and their
//! worker threads, the live assembler, the double buffer, the timing engine
//! and the statistics. The consumer only ever touches the frame lock, through
//! [`StreamContext::poll_should_render`] and
//! [`StreamContext::acquire_frame_for_render`].

use std::net::SocketAddr;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::{Mutex, MutexGuard};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::constants::{PAL_HEIGHT, PIXELS_PER_LINE};
use crate::error::{NetworkError, Result};
use crate::network::{create_udp_socket, ControlSender};
use crate::protocol::{ControlCommand, StreamId};
use crate::record::Recorder;
use crate::stream::receiver::{run_audio_loop, run_video_loop, AudioFrame, AudioWorker, VideoWorker};
use crate::stream::stats::StreamStats;
use crate::stream::watchdog::{run_retry_loop, PacketActivity};
use crate::timing::{normalize_target_fps, FrameSource, FrameTiming, TimingStats, TimingStrategy};
use crate::video::{DoubleBuffer, FrameAssembler};

/// Everything guarded by the frame lock
pub(crate) struct SharedFrame {
    pub(crate) buffers: DoubleBuffer,
    /// Created once the video format is known
    pub(crate) timing: Option<FrameTiming>,
    pub(crate) strategy: TimingStrategy,
    pub(crate) target_fps: f64,
}

/// A frame handed to the consumer.
///
/// Holds the frame lock until dropped, so render and release it promptly.
pub struct FrameView<'a> {
    guard: MutexGuard<'a, SharedFrame>,
    source: FrameSource,
    fresh: bool,
}

impl FrameView<'_> {
    pub fn dimensions(&self) -> (u32, u32) {
        self.guard.buffers.dimensions()
    }

    pub fn source(&self) -> FrameSource {
        self.source
    }

    /// False when the same source frame was handed out before
    pub fn is_fresh(&self) -> bool {
        self.fresh
    }
}

impl Deref for FrameView<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        let front = self.guard.buffers.read_handle();
        match self.source {
            FrameSource::Front => front,
            FrameSource::Snapshot(index) => self
                .guard
                .timing
                .as_ref()
                .and_then(|timing| timing.snapshot(index))
                .unwrap_or(front),
        }
    }
}

pub struct StreamContext {
    id: Uuid,
    config: AppConfig,
    control: Arc<dyn ControlSender>,
    running: Arc<AtomicBool>,
    shared: Arc<Mutex<SharedFrame>>,
    assembler: Arc<Mutex<FrameAssembler>>,
    stats: Arc<StreamStats>,
    recorder: Arc<Recorder>,
    activity: Arc<PacketActivity>,
    audio_tx: Sender<AudioFrame>,
    audio_rx: Receiver<AudioFrame>,
    /// Receive workers
    workers: Vec<JoinHandle<()>>,
    /// Start command watchdog; dropping the sender stops it
    watchdog: Option<(Sender<()>, JoinHandle<()>)>,
    video_addr: Option<SocketAddr>,
    audio_addr: Option<SocketAddr>,
}

impl StreamContext {
    pub fn new(config: AppConfig, control: Arc<dyn ControlSender>) -> Result<Self> {
        config.timing.validate()?;
        let strategy = config.timing.strategy()?;
        let target_fps = normalize_target_fps(config.timing.target_fps);
        let (audio_tx, audio_rx) = bounded(config.audio.channel_capacity.max(1));

        let shared = SharedFrame {
            buffers: DoubleBuffer::new(u32::from(PIXELS_PER_LINE), PAL_HEIGHT),
            timing: None,
            strategy,
            target_fps,
        };

        let id = Uuid::new_v4();
        info!(%id, ?strategy, target_fps, "Stream context created");

        Ok(Self {
            id,
            assembler: Arc::new(Mutex::new(FrameAssembler::with_timeout(
                config.timing.frame_timeout(),
            ))),
            recorder: Arc::new(Recorder::new(&config.record)),
            config,
            control,
            running: Arc::new(AtomicBool::new(false)),
            shared: Arc::new(Mutex::new(shared)),
            stats: Arc::new(StreamStats::new()),
            activity: Arc::new(PacketActivity::new()),
            audio_tx,
            audio_rx,
            workers: Vec::new(),
            watchdog: None,
            video_addr: None,
            audio_addr: None,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Bind the sockets, start the workers and ask the device to stream
    pub fn start(&mut self) -> Result<()> {
        if self.is_streaming() {
            return Ok(());
        }
        // A worker that died on a socket error leaves its siblings to reap
        if !self.workers.is_empty() || self.watchdog.is_some() {
            warn!(id = %self.id, "Restarting after a receive worker failed");
            self.stop();
        }

        let network = &self.config.network;
        let video_socket =
            create_udp_socket(&network.bind_address, network.video_port, network.recv_buffer_size)?;
        let audio_socket = if self.config.audio.enabled {
            Some(create_udp_socket(
                &network.bind_address,
                network.audio_port,
                network.recv_buffer_size,
            )?)
        } else {
            None
        };

        self.video_addr = video_socket.local_addr().ok();
        self.audio_addr = audio_socket.as_ref().and_then(|s| s.local_addr().ok());
        self.activity.mark(Instant::now());
        self.running.store(true, Ordering::SeqCst);

        if self.config.record.record_video {
            if let Err(e) = self.recorder.start() {
                error!("Failed to start recording: {}", e);
            }
        }

        let short_id = self.id.simple().to_string();
        let short_id = &short_id[..8];

        let video = {
            let running = self.running.clone();
            let activity = self.activity.clone();
            let assembler = self.assembler.clone();
            let shared = self.shared.clone();
            let stats = self.stats.clone();
            let recorder = self.recorder.clone();
            thread::Builder::new()
                .name(format!("c64u-video-{}", short_id))
                .spawn(move || {
                    run_video_loop(
                        video_socket,
                        VideoWorker {
                            running: &running,
                            activity: &activity,
                            assembler: &assembler,
                            shared: &shared,
                            stats: &stats,
                            recorder: &recorder,
                        },
                    )
                })
        };
        match video {
            Ok(handle) => self.workers.push(handle),
            Err(e) => {
                self.stop();
                return Err(NetworkError::ThreadSpawn(e.to_string()).into());
            }
        }

        if let Some(audio_socket) = audio_socket {
            let running = self.running.clone();
            let activity = self.activity.clone();
            let tx = self.audio_tx.clone();
            let stats = self.stats.clone();
            let recorder = self.recorder.clone();
            let audio = thread::Builder::new()
                .name(format!("c64u-audio-{}", short_id))
                .spawn(move || {
                    run_audio_loop(
                        audio_socket,
                        AudioWorker {
                            running: &running,
                            activity: &activity,
                            tx: &tx,
                            stats: &stats,
                            recorder: &recorder,
                        },
                    )
                });
            match audio {
                Ok(handle) => self.workers.push(handle),
                Err(e) => {
                    self.stop();
                    return Err(NetworkError::ThreadSpawn(e.to_string()).into());
                }
            }
        }

        let commands = self.start_commands();
        for command in &commands {
            if let Err(e) = self.control.send(command) {
                warn!("Failed to send {} start command: {}", command.stream(), e);
            }
        }

        if self.config.network.start_retry && !commands.is_empty() {
            let (shutdown_tx, shutdown_rx) = bounded::<()>(0);
            let activity = self.activity.clone();
            let control = self.control.clone();
            let silence = self.config.network.retry_silence();
            let watchdog = thread::Builder::new()
                .name(format!("c64u-retry-{}", short_id))
                .spawn(move || {
                    run_retry_loop(&shutdown_rx, &activity, control.as_ref(), &commands, silence)
                });
            match watchdog {
                Ok(handle) => self.watchdog = Some((shutdown_tx, handle)),
                Err(e) => {
                    self.stop();
                    return Err(NetworkError::ThreadSpawn(e.to_string()).into());
                }
            }
        }

        info!(
            id = %self.id,
            "Streaming started: video {:?}, audio {:?}",
            self.video_addr,
            self.audio_addr
        );
        Ok(())
    }

    fn streams(&self) -> Vec<(StreamId, Option<SocketAddr>)> {
        let mut streams = vec![(StreamId::Video, self.video_addr)];
        if self.config.audio.enabled {
            streams.push((StreamId::Audio, self.audio_addr));
        }
        streams
    }

    /// Empty when no client address is configured
    fn start_commands(&self) -> Vec<ControlCommand> {
        let client = &self.config.network.client_address;
        if client.is_empty() {
            return Vec::new();
        }

        self.streams()
            .into_iter()
            .filter_map(|(stream, addr)| {
                addr.map(|addr| ControlCommand::Start {
                    stream,
                    destination: format!("{}:{}", client, addr.port()),
                })
            })
            .collect()
    }

    fn send_stop_commands(&self) {
        if self.config.network.client_address.is_empty() {
            return;
        }

        for (stream, _) in self.streams() {
            if let Err(e) = self.control.send(&ControlCommand::Stop { stream }) {
                warn!("Failed to send {} stop command: {}", stream, e);
            }
        }
    }

    /// Stop the device, join the workers and reset all stream state
    pub fn stop(&mut self) {
        let was_running = self.running.swap(false, Ordering::SeqCst);
        if !was_running && self.workers.is_empty() && self.watchdog.is_none() {
            return;
        }

        // The watchdog must be gone before the stop commands go out
        if let Some((shutdown, handle)) = self.watchdog.take() {
            drop(shutdown);
            if handle.join().is_err() {
                error!("Start command watchdog panicked");
            }
        }
        self.send_stop_commands();

        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                error!("Stream worker panicked");
            }
        }
        self.recorder.stop();

        self.assembler.lock().reset();
        {
            let mut shared = self.shared.lock();
            shared.buffers.clear();
            shared.timing = None;
        }
        while self.audio_rx.try_recv().is_ok() {}
        self.stats.reset();
        self.video_addr = None;
        self.audio_addr = None;

        info!(id = %self.id, "Streaming stopped");
    }

    /// False once stopped, or after a receive worker hit a socket error
    pub fn is_streaming(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Consumer tick: is there a frame worth rendering now
    pub fn poll_should_render(&self, now: Instant) -> bool {
        let mut shared = self.shared.lock();
        if !shared.buffers.is_frame_ready() {
            return false;
        }
        match shared.timing.as_mut() {
            Some(timing) => timing.should_deliver(now),
            None => true,
        }
    }

    /// Take the frame lock and pick the pixels to render.
    ///
    /// Returns `None` until the first frame has been assembled.
    pub fn acquire_frame_for_render(&self, now: Instant) -> Option<FrameView<'_>> {
        let mut guard = self.shared.lock();
        if !guard.buffers.is_frame_ready() {
            return None;
        }

        let source = match guard.timing.as_mut() {
            Some(timing) => {
                let source = timing.select_frame(now);
                timing.on_delivered(now);
                source
            }
            None => FrameSource::Front,
        };
        let fresh = guard.buffers.acknowledge();
        self.stats.record_delivered();

        Some(FrameView {
            guard,
            source,
            fresh,
        })
    }

    pub fn frame_dimensions(&self) -> (u32, u32) {
        self.shared.lock().buffers.dimensions()
    }

    /// Copy of the current front buffer
    pub fn capture_front_buffer(&self) -> Vec<u8> {
        self.shared.lock().buffers.read_handle().to_vec()
    }

    pub fn timing_stats(&self) -> Option<TimingStats> {
        self.shared.lock().timing.as_ref().map(FrameTiming::stats)
    }

    /// Strategy in effect, which differs from the configured one after a fallback
    pub fn active_strategy(&self) -> Option<TimingStrategy> {
        self.shared.lock().timing.as_ref().map(FrameTiming::strategy)
    }

    pub fn stats(&self) -> &StreamStats {
        &self.stats
    }

    /// Frame saving and recording; usable while streaming
    pub fn recorder(&self) -> &Recorder {
        &self.recorder
    }

    /// Decoded audio packets in arrival order
    pub fn audio_frames(&self) -> Receiver<AudioFrame> {
        self.audio_rx.clone()
    }

    pub fn local_video_addr(&self) -> Option<SocketAddr> {
        self.video_addr
    }

    pub fn local_audio_addr(&self) -> Option<SocketAddr> {
        self.audio_addr
    }
}

impl Drop for StreamContext {
    fn drop(&mut self) {
        self.stop();
    }
}
