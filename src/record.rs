//! Frame capture and raw stream recording
//!
//! Two independent features share one output directory:
//! - frame saving writes every completed frame as a timestamped BMP
//! - recording appends raw BGRA frames and raw PCM audio to their own files
//!   and logs one CSV row per frame to a timing file
//!
//! Both are driven from the receive threads after a frame has been converted,
//! outside the frame lock. Open recording files sit behind their own lock.

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use bytes::{BufMut, BytesMut};
use chrono::{DateTime, Utc};
use image::{ImageFormat, RgbImage};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::RecordConfig;
use crate::constants::AUDIO_SAMPLE_RATE;
use crate::error::{RecordError, Result};
use crate::video::palette::BYTES_PER_PIXEL;

/// Files written by one recording session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordingPaths {
    pub video: PathBuf,
    pub audio: PathBuf,
    pub timing: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordingSummary {
    pub started_at: DateTime<Utc>,
    pub frames: u64,
    /// Interleaved 16-bit samples, both channels counted
    pub audio_samples: u64,
    pub duration_ms: i64,
}

struct RecordingSession {
    video: BufWriter<File>,
    audio: BufWriter<File>,
    timing: BufWriter<File>,
    paths: RecordingPaths,
    started_at: DateTime<Utc>,
    frames: u64,
    audio_samples: u64,
}

impl RecordingSession {
    fn write_frame(&mut self, frame: &[u8], width: u32, height: u32) -> io::Result<()> {
        self.video.write_all(frame)?;
        writeln!(
            self.timing,
            "{},{},{},{},{}",
            self.frames,
            Utc::now().timestamp_millis(),
            width,
            height,
            frame.len()
        )?;
        self.timing.flush()?;
        self.frames += 1;
        Ok(())
    }

    fn write_audio(&mut self, samples: &[i16]) -> io::Result<()> {
        let mut buf = BytesMut::with_capacity(samples.len() * 2);
        for sample in samples {
            buf.put_i16_le(*sample);
        }
        self.audio.write_all(&buf)?;
        self.audio_samples += samples.len() as u64;
        Ok(())
    }

    fn finish(mut self) -> RecordingSummary {
        for (name, writer) in [
            ("video", &mut self.video),
            ("audio", &mut self.audio),
            ("timing", &mut self.timing),
        ] {
            if let Err(e) = writer.flush() {
                warn!("Failed to flush {} recording: {}", name, e);
            }
        }

        RecordingSummary {
            started_at: self.started_at,
            frames: self.frames,
            audio_samples: self.audio_samples,
            duration_ms: (Utc::now() - self.started_at).num_milliseconds(),
        }
    }
}

fn create_failed(path: &Path, e: io::Error) -> RecordError {
    RecordError::CreateFailed {
        path: path.display().to_string(),
        reason: e.to_string(),
    }
}

fn create_file(path: &Path) -> std::result::Result<BufWriter<File>, RecordError> {
    File::create(path)
        .map(BufWriter::new)
        .map_err(|e| create_failed(path, e))
}

pub struct Recorder {
    output_dir: PathBuf,
    save_frames: AtomicBool,
    saved_frames: AtomicU32,
    /// Mirrors `session.is_some()` so idle calls skip the lock
    active: AtomicBool,
    session: Mutex<Option<RecordingSession>>,
}

impl Recorder {
    pub fn new(config: &RecordConfig) -> Self {
        Self {
            output_dir: config.output_dir.clone(),
            save_frames: AtomicBool::new(config.save_frames),
            saved_frames: AtomicU32::new(0),
            active: AtomicBool::new(false),
            session: Mutex::new(None),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn set_save_frames(&self, enabled: bool) {
        self.save_frames.store(enabled, Ordering::Relaxed);
    }

    pub fn is_saving_frames(&self) -> bool {
        self.save_frames.load(Ordering::Relaxed)
    }

    pub fn saved_frames(&self) -> u32 {
        self.saved_frames.load(Ordering::Relaxed)
    }

    pub fn is_recording(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    fn ensure_output_dir(&self) -> std::result::Result<(), RecordError> {
        fs::create_dir_all(&self.output_dir).map_err(|e| create_failed(&self.output_dir, e))
    }

    /// Write one BGRA frame as `frame_<unix ms>_<counter>.bmp`
    pub fn save_frame(&self, frame: &[u8], width: u32, height: u32) -> Result<PathBuf> {
        let expected = width as usize * height as usize * BYTES_PER_PIXEL;
        if frame.len() != expected {
            return Err(RecordError::FrameSize {
                width,
                height,
                expected,
                actual: frame.len(),
            }
            .into());
        }
        self.ensure_output_dir()?;

        let index = self.saved_frames.fetch_add(1, Ordering::Relaxed);
        let path = self.output_dir.join(format!(
            "frame_{}_{:05}.bmp",
            Utc::now().timestamp_millis(),
            index
        ));

        let rgb: Vec<u8> = frame
            .chunks_exact(BYTES_PER_PIXEL)
            .flat_map(|px| [px[2], px[1], px[0]])
            .collect();
        let image = RgbImage::from_raw(width, height, rgb)
            .ok_or_else(|| RecordError::Encode("pixel buffer does not match dimensions".into()))?;
        image
            .save_with_format(&path, ImageFormat::Bmp)
            .map_err(|e| RecordError::Encode(e.to_string()))?;

        Ok(path)
    }

    /// Open a new recording session. Returns the open session's files when
    /// one is already running.
    pub fn start(&self) -> Result<RecordingPaths> {
        let mut session = self.session.lock();
        if let Some(existing) = session.as_ref() {
            return Ok(existing.paths.clone());
        }
        self.ensure_output_dir()?;

        let started_at = Utc::now();
        let stamp = started_at.timestamp_millis();
        let paths = RecordingPaths {
            video: self.output_dir.join(format!("video_{}.raw", stamp)),
            audio: self.output_dir.join(format!("audio_{}.raw", stamp)),
            timing: self.output_dir.join(format!("timing_{}.csv", stamp)),
        };

        let video = create_file(&paths.video)?;
        let audio = create_file(&paths.audio)?;
        let mut timing = create_file(&paths.timing)?;

        let header = format!(
            "# C64U raw recording\n\
             # Started: {}\n\
             # Video: raw BGRA frames back to back, sizes per row below\n\
             # Audio: raw 16-bit signed little-endian PCM, stereo, {} Hz\n\
             frame,timestamp_ms,width,height,bytes\n",
            started_at.to_rfc3339(),
            AUDIO_SAMPLE_RATE
        );
        timing
            .write_all(header.as_bytes())
            .and_then(|_| timing.flush())
            .map_err(|e| RecordError::WriteFailed(e.to_string()))?;

        info!("Started recording: {}", paths.video.display());
        *session = Some(RecordingSession {
            video,
            audio,
            timing,
            paths: paths.clone(),
            started_at,
            frames: 0,
            audio_samples: 0,
        });
        self.active.store(true, Ordering::Release);
        Ok(paths)
    }

    /// Append a frame to the open session, if any
    pub fn record_frame(&self, frame: &[u8], width: u32, height: u32) {
        if !self.is_recording() {
            return;
        }

        let mut session = self.session.lock();
        if let Some(session) = session.as_mut() {
            if let Err(e) = session.write_frame(frame, width, height) {
                warn!("Failed to write video frame to recording: {}", e);
            }
        }
    }

    /// Append interleaved samples to the open session, if any
    pub fn record_audio(&self, samples: &[i16]) {
        if !self.is_recording() {
            return;
        }

        let mut session = self.session.lock();
        if let Some(session) = session.as_mut() {
            if let Err(e) = session.write_audio(samples) {
                warn!("Failed to write audio data to recording: {}", e);
            }
        }
    }

    /// Close the session and flush its files
    pub fn stop(&self) -> Option<RecordingSummary> {
        let session = self.session.lock().take()?;
        self.active.store(false, Ordering::Release);

        let summary = session.finish();
        info!(
            "Recording stopped. Frames: {}, audio samples: {}",
            summary.frames, summary.audio_samples
        );
        Some(summary)
    }

    /// Hook for every completed frame
    pub fn on_frame(&self, frame: &[u8], width: u32, height: u32) {
        if self.is_saving_frames() {
            if let Err(e) = self.save_frame(frame, width, height) {
                warn!("Failed to save frame: {}", e);
            }
        }
        self.record_frame(frame, width, height);
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::palette::bgra;
    use crate::Error;

    fn recorder(dir: &Path) -> Recorder {
        Recorder::new(&RecordConfig {
            save_frames: false,
            record_video: false,
            output_dir: dir.to_path_buf(),
        })
    }

    #[test]
    fn test_save_frame_writes_bmp() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = recorder(&dir.path().join("frames"));

        // Red on the left, light blue on the right
        let mut frame = Vec::new();
        for _ in 0..2 {
            frame.extend_from_slice(&bgra(2));
            frame.extend_from_slice(&bgra(14));
        }

        let path = recorder.save_frame(&frame, 2, 2).unwrap();
        assert!(path.file_name().unwrap().to_string_lossy().starts_with("frame_"));
        assert!(path.to_string_lossy().ends_with("_00000.bmp"));
        assert_eq!(recorder.saved_frames(), 1);

        let image = image::open(&path).unwrap().to_rgb8();
        assert_eq!(image.dimensions(), (2, 2));
        let red = bgra(2);
        assert_eq!(image.get_pixel(0, 1).0, [red[2], red[1], red[0]]);
        let blue = bgra(14);
        assert_eq!(image.get_pixel(1, 0).0, [blue[2], blue[1], blue[0]]);
    }

    #[test]
    fn test_save_frame_rejects_wrong_size() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = recorder(dir.path());

        assert!(matches!(
            recorder.save_frame(&[0u8; 12], 2, 2),
            Err(Error::Record(RecordError::FrameSize { expected: 16, actual: 12, .. }))
        ));
        assert_eq!(recorder.saved_frames(), 0);
    }

    #[test]
    fn test_recording_session_writes_all_files() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = recorder(dir.path());

        // Nothing is written while idle
        recorder.record_frame(&[1u8; 8], 2, 1);
        assert!(!recorder.is_recording());

        let paths = recorder.start().unwrap();
        assert!(recorder.is_recording());
        assert_eq!(recorder.start().unwrap(), paths);

        recorder.record_frame(&[1u8; 8], 2, 1);
        recorder.record_audio(&[1, -1, 2, -2]);
        recorder.record_frame(&[2u8; 8], 2, 1);

        let summary = recorder.stop().unwrap();
        assert!(!recorder.is_recording());
        assert_eq!(summary.frames, 2);
        assert_eq!(summary.audio_samples, 4);

        let video = fs::read(&paths.video).unwrap();
        assert_eq!(video.len(), 16);
        assert_eq!(&video[8..], &[2u8; 8]);

        let audio = fs::read(&paths.audio).unwrap();
        assert_eq!(audio, vec![1, 0, 0xFF, 0xFF, 2, 0, 0xFE, 0xFF]);

        let timing = fs::read_to_string(&paths.timing).unwrap();
        let rows: Vec<&str> = timing.lines().filter(|l| !l.starts_with('#')).collect();
        assert_eq!(rows[0], "frame,timestamp_ms,width,height,bytes");
        assert!(rows[1].starts_with("0,"));
        assert!(rows[1].ends_with(",2,1,8"));
        assert!(rows[2].starts_with("1,"));
        assert_eq!(rows.len(), 3);

        assert!(recorder.stop().is_none());
    }

    #[test]
    fn test_on_frame_saves_when_enabled() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = recorder(dir.path());
        let frame = bgra(5).repeat(4);

        recorder.on_frame(&frame, 2, 2);
        assert_eq!(recorder.saved_frames(), 0);

        recorder.set_save_frames(true);
        recorder.on_frame(&frame, 2, 2);
        recorder.on_frame(&frame, 2, 2);
        assert_eq!(recorder.saved_frames(), 2);

        let bmps = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().extension().is_some_and(|ext| ext == "bmp"))
            .count();
        assert_eq!(bmps, 2);
    }
}
