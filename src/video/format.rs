//! Video format detection from the last packet of a frame

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::constants::{NTSC_HEIGHT, PAL_HEIGHT, PAL_OVERSCAN_HEIGHT, PIXELS_PER_LINE};
use crate::protocol::PacketHeader;

/// Frames at or below this height are assumed to be NTSC
const HEURISTIC_NTSC_MAX_HEIGHT: u32 = 250;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoStandard {
    Pal,
    Ntsc,
}

impl VideoStandard {
    /// Rate the source is expected to deliver, used for pacing
    pub fn nominal_fps(self) -> f64 {
        match self {
            VideoStandard::Pal => 50.0,
            VideoStandard::Ntsc => 60.0,
        }
    }

    /// Exact VIC-II refresh rate of the machine
    pub fn native_fps(self) -> f64 {
        match self {
            VideoStandard::Pal => 50.125,
            VideoStandard::Ntsc => 59.826,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VideoFormat {
    pub width: u32,
    pub height: u32,
    pub standard: VideoStandard,
    /// False when the standard was guessed from an unknown height
    pub recognized: bool,
}

impl VideoFormat {
    pub fn from_height(height: u32) -> Self {
        let (standard, recognized) = match height {
            PAL_HEIGHT | PAL_OVERSCAN_HEIGHT => (VideoStandard::Pal, true),
            NTSC_HEIGHT => (VideoStandard::Ntsc, true),
            h if h <= HEURISTIC_NTSC_MAX_HEIGHT => (VideoStandard::Ntsc, false),
            _ => (VideoStandard::Pal, false),
        };

        Self {
            width: u32::from(PIXELS_PER_LINE),
            height,
            standard,
            recognized,
        }
    }

    /// Format assumed before anything has been detected
    pub fn pal() -> Self {
        Self::from_height(PAL_HEIGHT)
    }

    pub fn expected_fps(&self) -> f64 {
        self.standard.nominal_fps()
    }

    /// Size of one BGRA frame in bytes
    pub fn frame_size(&self) -> usize {
        self.width as usize * self.height as usize * 4
    }
}

/// Tracks the detected format across frames
#[derive(Debug, Default)]
pub struct FormatDetector {
    current: Option<VideoFormat>,
}

impl FormatDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inspect a last-packet header. Returns the new format when it changed.
    pub fn observe(&mut self, header: &PacketHeader) -> Option<VideoFormat> {
        let height = header.frame_height();
        if self.current.map(|f| f.height) == Some(height) {
            return None;
        }

        let format = VideoFormat::from_height(height);
        if format.recognized {
            info!(
                "Detected {:?} format: {}x{} @ {:.0} Hz",
                format.standard,
                format.width,
                format.height,
                format.expected_fps()
            );
        } else {
            warn!(
                "Unknown video format: {}x{}, assuming {:.0} Hz",
                format.width,
                format.height,
                format.expected_fps()
            );
        }

        self.current = Some(format);
        Some(format)
    }

    pub fn current(&self) -> Option<VideoFormat> {
        self.current
    }

    pub fn reset(&mut self) {
        self.current = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn last_packet(line_number: u16) -> PacketHeader {
        PacketHeader::new(0, 1, line_number, true)
    }

    #[test]
    fn test_known_heights() {
        let pal = VideoFormat::from_height(272);
        assert_eq!(pal.standard, VideoStandard::Pal);
        assert!(pal.recognized);
        assert_eq!(pal.expected_fps(), 50.0);

        let overscan = VideoFormat::from_height(288);
        assert_eq!(overscan.standard, VideoStandard::Pal);
        assert!(overscan.recognized);
        assert_eq!(overscan.expected_fps(), 50.0);
        assert_eq!(overscan.frame_size(), 384 * 288 * 4);

        let ntsc = VideoFormat::from_height(240);
        assert_eq!(ntsc.standard, VideoStandard::Ntsc);
        assert!(ntsc.recognized);
        assert_eq!(ntsc.expected_fps(), 60.0);
    }

    #[test]
    fn test_heuristic_fallback() {
        let tall = VideoFormat::from_height(296);
        assert_eq!(tall.expected_fps(), 50.0);
        assert!(!tall.recognized);

        assert_eq!(VideoFormat::from_height(250).expected_fps(), 60.0);
        assert_eq!(VideoFormat::from_height(251).expected_fps(), 50.0);
        assert_eq!(VideoFormat::from_height(200).expected_fps(), 60.0);
    }

    #[test]
    fn test_detector_reports_changes_only() {
        let mut detector = FormatDetector::new();

        let first = detector.observe(&last_packet(268)).unwrap();
        assert_eq!(first.height, 272);
        assert_eq!(first.width, 384);

        assert!(detector.observe(&last_packet(268)).is_none());

        let changed = detector.observe(&last_packet(236)).unwrap();
        assert_eq!(changed.height, 240);
        assert_eq!(detector.current(), Some(changed));

        let overscan = detector.observe(&last_packet(284)).unwrap();
        assert_eq!(overscan.height, 288);
        assert!(overscan.recognized);

        detector.reset();
        assert!(detector.current().is_none());
        assert!(detector.observe(&last_packet(236)).is_some());
    }
}
