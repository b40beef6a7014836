//! Stream lifecycle, receive loops and statistics

pub mod context;
pub mod receiver;
pub mod stats;
mod watchdog;

pub use context::{FrameView, StreamContext};
pub use receiver::AudioFrame;
pub use stats::{StatsRates, StatsReporter, StatsSnapshot, StreamStats};
