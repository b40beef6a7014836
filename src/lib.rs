//! # C64U Stream
//!
//! Receiver for the C64 Ultimate VIC video and audio streams.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                            C64 ULTIMATE DEVICE                               │
//! │        VIC stream (UDP :11000)              Audio stream (UDP :11001)        │
//! └───────────────┬──────────────────────────────────────┬──────────────────────┘
//!                 │ 780 byte packets, lossy, unordered    │ 770 byte PCM packets
//!                 ▼                                       ▼
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                          STREAM CONTEXT (stream)                             │
//! │  ┌──────────────────────────────┐        ┌──────────────────────────────┐   │
//! │  │  Video Thread                │        │  Audio Thread                │   │
//! │  │  protocol::video decode      │        │  protocol::audio decode      │   │
//! │  │            │                 │        │            │                 │   │
//! │  │            ▼                 │        │            ▼                 │   │
//! │  │  video::assembler            │        │  crossbeam channel           │   │
//! │  │  (slot table, timeout,       │        │  (AudioFrame, never blocks)  │   │
//! │  │   format detection)          │        └──────────────────────────────┘   │
//! │  │            │ complete        │                                           │
//! │  │            ▼                 │                                           │
//! │  │  video::palette (4 bit ->    │        ┌──────────────────────────────┐   │
//! │  │  BGRA) into worker buffer,   │        │  Retry Thread                │   │
//! │  │  snapshot copy, record       │        │  re-sends start commands     │   │
//! │  └────────────┼─────────────────┘        │  while both sockets are quiet│   │
//! │               │ buffer exchange          └──────────────────────────────┘   │
//! │               ▼                                                             │
//! │  ┌─────────────────────────────────────────────────────────────────────┐   │
//! │  │  Frame lock: video::buffer (front/back swap) + timing engine         │   │
//! │  └─────────────────────────────────────────────────────────────────────┘   │
//! └───────────────┬─────────────────────────────────────────────────────────────┘
//!                 │ poll_should_render / acquire_frame_for_render
//!                 ▼
//!         Consumer render tick (50/60 Hz)
//! ```

pub mod config;
pub mod error;
pub mod network;
pub mod protocol;
pub mod record;
pub mod stream;
pub mod timing;
pub mod video;

pub use error::{Error, Result};
pub use stream::{FrameView, StreamContext};
pub use timing::TimingStrategy;

/// Protocol and application constants
pub mod constants {
    use std::time::Duration;

    /// Size of every VIC stream datagram
    pub const VIDEO_PACKET_SIZE: usize = 780;

    /// Size of the VIC stream packet header
    pub const VIDEO_HEADER_SIZE: usize = 12;

    /// Pixel payload carried by one video packet
    pub const VIDEO_PAYLOAD_SIZE: usize = VIDEO_PACKET_SIZE - VIDEO_HEADER_SIZE;

    /// Size of every audio datagram
    pub const AUDIO_PACKET_SIZE: usize = 770;

    /// Size of the audio packet header (sequence number only)
    pub const AUDIO_HEADER_SIZE: usize = 2;

    /// Stereo sample frames per audio packet
    pub const AUDIO_FRAMES_PER_PACKET: usize = 192;

    /// Nominal audio sample rate
    pub const AUDIO_SAMPLE_RATE: u32 = 48_000;

    /// Horizontal resolution, identical for PAL and NTSC
    pub const PIXELS_PER_LINE: u16 = 384;

    /// Packed bytes per raster line (two pixels per byte)
    pub const BYTES_PER_LINE: usize = PIXELS_PER_LINE as usize / 2;

    /// Raster lines carried by one packet
    pub const LINES_PER_PACKET: u8 = 4;

    /// Only 4-bit indexed color is streamed
    pub const BITS_PER_PIXEL: u8 = 4;

    /// Visible PAL frame height
    pub const PAL_HEIGHT: u32 = 272;

    /// PAL frame height with the full overscan border
    pub const PAL_OVERSCAN_HEIGHT: u32 = 288;

    /// Visible NTSC frame height
    pub const NTSC_HEIGHT: u32 = 240;

    /// Slot table capacity. Covers a PAL overscan frame (72 packets);
    /// a regular PAL frame uses 68.
    pub const MAX_PACKETS_PER_FRAME: usize = 72;

    /// Age after which an incomplete frame is given up
    pub const FRAME_TIMEOUT: Duration = Duration::from_millis(100);

    /// Default UDP port for the VIC stream
    pub const DEFAULT_VIDEO_PORT: u16 = 11000;

    /// Default UDP port for the audio stream
    pub const DEFAULT_AUDIO_PORT: u16 = 11001;

    /// TCP port of the device's command interface
    pub const CONTROL_PORT: u16 = 64;

    /// Device address meaning "not configured"
    pub const UNCONFIGURED_DEVICE_IP: &str = "0.0.0.0";

    /// Receive buffer large enough to detect oversized datagrams
    pub const MAX_DATAGRAM_SIZE: usize = 1500;

    /// Sleep between polls of a socket that would block
    pub const RECEIVE_IDLE_SLEEP: Duration = Duration::from_millis(1);

    /// Pause after re-sending start commands
    pub const RETRY_BASE_DELAY: Duration = Duration::from_millis(200);

    /// Extra pause per consecutive failed attempt
    pub const RETRY_BACKOFF_STEP: Duration = Duration::from_millis(300);

    /// Longest pause between attempts
    pub const RETRY_MAX_DELAY: Duration = Duration::from_secs(3);

    /// How often the watchdog checks for silence
    pub const RETRY_POLL_INTERVAL: Duration = Duration::from_millis(100);

    /// Pause while no device address is configured
    pub const RETRY_UNCONFIGURED_WAIT: Duration = Duration::from_secs(1);
}
