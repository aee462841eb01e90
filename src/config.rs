//! Pipeline configuration
//!
//! Every tunable lives in an explicit config object handed to the
//! component that needs it at construction time. Sections map one-to-one
//! onto pipeline stages and can be partially overridden from a TOML file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::constants;
use crate::error::{Error, Result};

/// Root configuration for the caption pipeline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptionConfig {
    pub framer: FramerConfig,
    pub recognition: RecognitionConfig,
    pub translation: TranslationConfig,
    pub delivery: DeliveryConfig,
    pub api: ApiConfig,
}

impl CaptionConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&raw)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from an explicit path, from the default location if one
    /// exists there, or fall back to defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::load(path);
        }
        if let Some(default) = Self::default_path() {
            if default.exists() {
                return Self::load(&default);
            }
        }
        Ok(Self::default())
    }

    /// Platform config file location (e.g. `~/.config/polyglot-captions/config.toml`).
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "polyglot-captions")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Sanity-check the values a TOML file may have overridden.
    pub fn validate(&self) -> Result<()> {
        if !(8_000..=48_000).contains(&self.framer.target_sample_rate) {
            return Err(Error::Config(format!(
                "framer.target_sample_rate out of range: {}",
                self.framer.target_sample_rate
            )));
        }
        if self.framer.frame_ms == 0 || self.framer.frame_ms > 1_000 {
            return Err(Error::Config(format!(
                "framer.frame_ms out of range: {}",
                self.framer.frame_ms
            )));
        }
        if self.framer.overflow_factor < 2 {
            return Err(Error::Config(
                "framer.overflow_factor must be at least 2".into(),
            ));
        }
        if self.recognition.max_consecutive_failures == 0 {
            return Err(Error::Config(
                "recognition.max_consecutive_failures must be at least 1".into(),
            ));
        }
        if self.translation.max_in_flight == 0 {
            return Err(Error::Config(
                "translation.max_in_flight must be at least 1".into(),
            ));
        }
        if self.delivery.queue_capacity < 2 {
            return Err(Error::Config(
                "delivery.queue_capacity must be at least 2".into(),
            ));
        }
        if self.delivery.max_recent_per_speaker == 0 {
            return Err(Error::Config(
                "delivery.max_recent_per_speaker must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Audio framer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FramerConfig {
    /// Sample rate the recognizer expects
    pub target_sample_rate: u32,
    /// Duration of one emitted PCM frame
    pub frame_ms: u32,
    /// Frames whose RMS (on [0, 1] normalized samples) falls below this
    /// are suppressed as silence
    pub silence_rms: f32,
    /// Pending-sample ceiling, expressed in frame sizes; excess oldest
    /// samples are discarded
    pub overflow_factor: usize,
    /// Capacity of the lock-free ingest ring, in chunks
    pub ingest_capacity: usize,
}

impl Default for FramerConfig {
    fn default() -> Self {
        Self {
            target_sample_rate: constants::RECOGNIZER_SAMPLE_RATE,
            frame_ms: constants::DEFAULT_FRAME_MS,
            silence_rms: 0.01,
            overflow_factor: 10,
            ingest_capacity: constants::INGEST_RING_CAPACITY,
        }
    }
}

impl FramerConfig {
    /// Samples per emitted frame at the target rate.
    pub fn frame_samples(&self) -> usize {
        (self.target_sample_rate as usize * self.frame_ms as usize) / 1_000
    }

    pub fn frame_duration(&self) -> Duration {
        Duration::from_millis(self.frame_ms as u64)
    }
}

/// Recognition session settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecognitionConfig {
    /// Recognizer endpoints, used round-robin by the TCP backend
    pub servers: Vec<String>,
    pub connect_timeout_ms: u64,
    /// First reconnect delay; doubles per attempt
    pub initial_backoff_ms: u64,
    /// Reconnect delay ceiling
    pub max_backoff_ms: u64,
    /// Consecutive failures before the session enters the error state
    pub max_consecutive_failures: u32,
    /// Tear the session down after this long without audio
    pub idle_timeout_ms: u64,
    /// Depth of the frame channel feeding one session
    pub frame_channel_capacity: usize,
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            servers: vec![constants::DEFAULT_RECOGNIZER_ADDR.to_string()],
            connect_timeout_ms: 10_000,
            initial_backoff_ms: 500,
            max_backoff_ms: 15_000,
            max_consecutive_failures: 5,
            idle_timeout_ms: 30_000,
            frame_channel_capacity: 64,
        }
    }
}

impl RecognitionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// Backoff delay for the given zero-based attempt number.
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.initial_backoff_ms.max(1);
        let delay = base.saturating_mul(1u64 << attempt.min(16));
        Duration::from_millis(delay.min(self.max_backoff_ms))
    }
}

/// Translation router settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranslationConfig {
    /// HTTP endpoint for the bundled GTX-style provider
    pub endpoint: String,
    /// HTTP endpoint for the MyMemory-style fallback provider; empty
    /// disables the fallback chain
    pub fallback_endpoint: String,
    /// Also translate interim segments (finals are always translated)
    pub translate_interim: bool,
    pub request_timeout_ms: u64,
    /// Bound on concurrent backend calls; excess requests queue
    pub max_in_flight: usize,
    pub cache_ttl_ms: u64,
    /// Entries beyond this are not cached
    pub cache_capacity: usize,
}

impl Default for TranslationConfig {
    fn default() -> Self {
        Self {
            endpoint: constants::DEFAULT_TRANSLATE_ENDPOINT.to_string(),
            fallback_endpoint: constants::DEFAULT_FALLBACK_ENDPOINT.to_string(),
            translate_interim: false,
            request_timeout_ms: 3_000,
            max_in_flight: 4,
            cache_ttl_ms: 120_000,
            cache_capacity: 5_000,
        }
    }
}

impl TranslationConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }
}

/// Caption delivery settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Per-listener queue depth
    pub queue_capacity: usize,
    /// How long a finalized caption stays visible
    pub display_duration_ms: u64,
    /// Recent-caption buffer size per speaker (snapshot query)
    pub max_recent_per_speaker: usize,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 32,
            display_duration_ms: 6_000,
            max_recent_per_speaker: 8,
        }
    }
}

impl DeliveryConfig {
    pub fn display_duration(&self) -> Duration {
        Duration::from_millis(self.display_duration_ms)
    }
}

/// HTTP/WebSocket surface settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub bind_address: String,
    pub http_port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            http_port: constants::DEFAULT_HTTP_PORT,
        }
    }
}
