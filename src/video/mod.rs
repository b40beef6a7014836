//! Video path: packet assembly, color conversion and double buffering

pub mod assembler;
pub mod buffer;
pub mod format;
pub mod palette;

pub use assembler::{AssembledFrame, FrameAssembler, FrameOutcome, FrameSink, FrameState, IngestReport};
pub use buffer::DoubleBuffer;
pub use format::{FormatDetector, VideoFormat, VideoStandard};
