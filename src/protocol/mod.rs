//! Wire formats spoken by the C64 Ultimate streaming interface

pub mod audio;
pub mod control;
pub mod video;

pub use audio::AudioPacket;
pub use control::{ControlCommand, StreamId};
pub use video::{PacketHeader, VideoPacket};
