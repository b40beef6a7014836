//! Error types for the stream receiver

use thiserror::Error;

/// Main error type for the crate
#[derive(Error, Debug)]
pub enum Error {
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Packet error: {0}")]
    Packet(#[from] PacketError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Recording error: {0}")]
    Record(#[from] RecordError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Malformed or foreign datagrams
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PacketError {
    #[error("Invalid packet length: {actual} bytes (expected {expected})")]
    InvalidLength { expected: usize, actual: usize },

    #[error("Invalid packet format: lines={lines_per_packet}, pixels={pixels_per_line}, bits={bits_per_pixel}")]
    InvalidFormat {
        lines_per_packet: u8,
        pixels_per_line: u16,
        bits_per_pixel: u8,
    },

    #[error("Payload too large: {0} bytes")]
    PayloadTooLarge(usize),
}

/// Network errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Socket bind failed: {0}")]
    BindFailed(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Control destination too long: {0} bytes")]
    DestinationTooLong(usize),

    #[error("Failed to spawn worker thread: {0}")]
    ThreadSpawn(String),
}

/// Frame capture and recording errors
#[derive(Error, Debug)]
pub enum RecordError {
    #[error("Failed to create {path}: {reason}")]
    CreateFailed { path: String, reason: String },

    #[error("Failed to write recording: {0}")]
    WriteFailed(String),

    #[error("Failed to encode image: {0}")]
    Encode(String),

    #[error("Frame buffer holds {actual} bytes, {width}x{height} needs {expected}")]
    FrameSize {
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Failed to serialize config: {0}")]
    Serialize(String),

    #[error("Invalid timing strategy selector: {0}")]
    InvalidStrategy(i64),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("No configuration directory available on this platform")]
    NoConfigDir,
}

/// Result type alias for the crate
pub type Result<T> = std::result::Result<T, Error>;
