//! Receiver configuration
//!
//! Stored as TOML. Every field has a default so a partial file is valid.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::constants::{CONTROL_PORT, DEFAULT_AUDIO_PORT, DEFAULT_VIDEO_PORT, UNCONFIGURED_DEVICE_IP};
use crate::error::{ConfigError, Result};
use crate::timing::TimingStrategy;

const CONFIG_FILE_NAME: &str = "config.toml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub network: NetworkConfig,
    pub timing: TimingConfig,
    pub audio: AudioConfig,
    pub record: RecordConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Device command interface host; "0.0.0.0" disables start/stop commands
    pub device_address: String,
    /// Local address the UDP sockets bind to
    pub bind_address: String,
    /// Address the device should stream to; empty skips the start command
    pub client_address: String,
    pub video_port: u16,
    pub audio_port: u16,
    pub control_port: u16,
    pub recv_buffer_size: usize,
    pub control_timeout_ms: u64,
    /// Re-send start commands while the device stays silent
    pub start_retry: bool,
    /// Silence on both sockets after which start commands are re-sent
    pub retry_silence_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            device_address: UNCONFIGURED_DEVICE_IP.to_string(),
            bind_address: "0.0.0.0".to_string(),
            client_address: String::new(),
            video_port: DEFAULT_VIDEO_PORT,
            audio_port: DEFAULT_AUDIO_PORT,
            control_port: CONTROL_PORT,
            recv_buffer_size: 1024 * 1024,
            control_timeout_ms: 1000,
            start_retry: true,
            retry_silence_ms: 500,
        }
    }
}

impl NetworkConfig {
    pub fn control_timeout(&self) -> Duration {
        Duration::from_millis(self.control_timeout_ms)
    }

    pub fn retry_silence(&self) -> Duration {
        Duration::from_millis(self.retry_silence_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// 0 passthrough, 1 adaptive, 2 interpolation, 3 vsync-aware
    pub strategy: i64,
    /// Consumer render rate; snapped to a standard rate when close to one
    pub target_fps: f64,
    pub frame_timeout_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            strategy: TimingStrategy::Passthrough.selector(),
            target_fps: 50.0,
            frame_timeout_ms: 100,
        }
    }
}

impl TimingConfig {
    pub fn strategy(&self) -> std::result::Result<TimingStrategy, ConfigError> {
        TimingStrategy::from_selector(self.strategy)
    }

    pub fn frame_timeout(&self) -> Duration {
        Duration::from_millis(self.frame_timeout_ms)
    }

    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        self.strategy()?;

        if !self.target_fps.is_finite() || self.target_fps <= 0.0 {
            return Err(ConfigError::InvalidValue {
                field: "timing.target_fps",
                reason: format!("{} is not a usable frame rate", self.target_fps),
            });
        }

        if self.frame_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "timing.frame_timeout_ms",
                reason: "must be greater than 0".into(),
            });
        }

        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub enabled: bool,
    /// Decoded packets buffered for the consumer before new ones are dropped
    pub channel_capacity: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            channel_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordConfig {
    /// Save every completed frame as a BMP
    pub save_frames: bool,
    /// Record raw video, raw audio and a timing log while streaming
    pub record_video: bool,
    pub output_dir: PathBuf,
}

impl Default for RecordConfig {
    fn default() -> Self {
        Self {
            save_frames: false,
            record_video: false,
            output_dir: std::env::temp_dir().join("c64u_frames"),
        }
    }
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: AppConfig =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from the platform config directory, falling back to defaults
    /// when no file exists yet
    pub fn load_or_default() -> Result<Self> {
        let path = Self::default_path()?;
        if path.exists() {
            info!("Loading configuration from {}", path.display());
            Self::load(&path)
        } else {
            info!("No configuration at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    pub fn default_path() -> std::result::Result<PathBuf, ConfigError> {
        ProjectDirs::from("com", "c64u", "c64u-stream")
            .map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
            .ok_or(ConfigError::NoConfigDir)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        self.timing.validate()?;

        for (field, port) in [
            ("network.video_port", self.network.video_port),
            ("network.audio_port", self.network.audio_port),
            ("network.control_port", self.network.control_port),
        ] {
            if port == 0 {
                return Err(ConfigError::InvalidValue {
                    field,
                    reason: "port must not be 0".into(),
                });
            }
        }

        if self.network.video_port == self.network.audio_port {
            return Err(ConfigError::InvalidValue {
                field: "network.audio_port",
                reason: format!("clashes with video port {}", self.network.video_port),
            });
        }

        if self.network.start_retry && self.network.retry_silence_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "network.retry_silence_ms",
                reason: "must be greater than 0".into(),
            });
        }

        if self.audio.channel_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                field: "audio.channel_capacity",
                reason: "must be greater than 0".into(),
            });
        }

        let record = &self.record;
        if (record.save_frames || record.record_video) && record.output_dir.as_os_str().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "record.output_dir",
                reason: "required when saving frames or recording".into(),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        config.validate().unwrap();
        assert_eq!(config.network.video_port, 11000);
        assert_eq!(config.network.audio_port, 11001);
        assert_eq!(config.timing.strategy().unwrap(), TimingStrategy::Passthrough);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            "[network]\ndevice_address = \"192.168.1.64\"\n\n[timing]\nstrategy = 1\n",
        )
        .unwrap();

        let config = AppConfig::load(&path).unwrap();
        assert_eq!(config.network.device_address, "192.168.1.64");
        assert_eq!(config.network.video_port, 11000);
        assert_eq!(config.timing.strategy().unwrap(), TimingStrategy::Adaptive);
        assert!(config.audio.enabled);
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = AppConfig::default();
        config.timing.strategy = 2;
        config.timing.target_fps = 60.0;
        config.network.client_address = "10.0.0.5".into();
        config.save(&path).unwrap();

        assert_eq!(AppConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_rejects_invalid_values() {
        let mut config = AppConfig::default();
        config.timing.strategy = 4;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidStrategy(4))));

        let mut config = AppConfig::default();
        config.network.video_port = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { field: "network.video_port", .. })
        ));

        let mut config = AppConfig::default();
        config.timing.target_fps = 0.0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.record.save_frames = true;
        config.record.output_dir = PathBuf::new();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { field: "record.output_dir", .. })
        ));
    }

    #[test]
    fn test_timing_rejects_unusable_rates() {
        for fps in [0.0, -50.0, f64::NAN, f64::INFINITY] {
            let timing = TimingConfig {
                target_fps: fps,
                ..TimingConfig::default()
            };
            assert!(
                matches!(
                    timing.validate(),
                    Err(ConfigError::InvalidValue { field: "timing.target_fps", .. })
                ),
                "{} accepted",
                fps
            );
        }
        TimingConfig::default().validate().unwrap();
    }

    #[test]
    fn test_parse_error_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[timing\nstrategy = ").unwrap();

        assert!(matches!(
            AppConfig::load(&path),
            Err(Error::Config(ConfigError::Parse(_)))
        ));
    }
}
