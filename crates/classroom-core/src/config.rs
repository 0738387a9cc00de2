//! Configuration for the classroom session layer
//!
//! All sections have working defaults so an empty configuration is valid.
//! [`ClassroomConfig::load`] layers an optional TOML file and `CLASSROOM__*`
//! environment variables on top (for example `CLASSROOM__RECOVERY__MAX_RETRIES=5`).

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ClassroomError, ClassroomResult};
use crate::quality::QualityThresholds;
use crate::recovery::RecoveryPolicy;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassroomConfig {
    pub negotiation: NegotiationConfig,
    pub recovery: RecoveryConfig,
    pub quality: QualityConfig,
    pub access: AccessConfig,
    pub devices: DeviceConfig,
    pub relay: RelayConfig,
    pub logging: LogSettings,
}

/// Offer/answer phase limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NegotiationConfig {
    /// How long a participant may stay in `negotiating` before an error is raised
    pub timeout_ms: u64,
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self { timeout_ms: 30_000 }
    }
}

impl NegotiationConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Automatic reconnection policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub initial_delay_ms: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_ms: 2_000,
            initial_delay_ms: 1_000,
        }
    }
}

impl RecoveryConfig {
    pub fn policy(&self) -> RecoveryPolicy {
        RecoveryPolicy {
            max_retries: self.max_retries,
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            initial_delay: Duration::from_millis(self.initial_delay_ms),
        }
    }
}

/// Connection quality sampling
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    pub sample_interval_ms: u64,
    pub thresholds: QualityThresholds,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            sample_interval_ms: 2_000,
            thresholds: QualityThresholds::default(),
        }
    }
}

impl QualityConfig {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }
}

/// Authorization check and join/leave telemetry endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessConfig {
    pub validate_url: Option<String>,
    pub telemetry_url: Option<String>,
    pub api_key: Option<String>,
    pub request_timeout_ms: u64,
    /// Extra attempts after a transient failure of the authorization check
    pub transient_retries: u32,
    pub retry_delay_ms: u64,
}

impl Default for AccessConfig {
    fn default() -> Self {
        Self {
            validate_url: None,
            telemetry_url: None,
            api_key: None,
            request_timeout_ms: 10_000,
            transient_retries: 1,
            retry_delay_ms: 500,
        }
    }
}

impl AccessConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// Local capture settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub capture_audio: bool,
    pub capture_video: bool,
    /// Where the chosen camera/microphone are remembered between sessions
    pub preferences_path: Option<PathBuf>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            capture_audio: true,
            capture_video: true,
            preferences_path: None,
        }
    }
}

/// Signaling relay location
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub url: Option<String>,
}

/// Logging settings as they appear in configuration files
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    pub level: String,
    pub json: bool,
    pub file_info: bool,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            file_info: false,
        }
    }
}

impl ClassroomConfig {
    /// Load configuration from an optional file plus the environment
    pub fn load(path: Option<&Path>) -> ClassroomResult<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("CLASSROOM")
                .separator("__")
                .try_parsing(true),
        );

        let config: ClassroomConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make the session layer misbehave
    pub fn validate(&self) -> ClassroomResult<()> {
        if self.quality.sample_interval_ms == 0 {
            return Err(ClassroomError::InvalidConfiguration {
                field: "quality.sample_interval_ms".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.negotiation.timeout_ms == 0 {
            return Err(ClassroomError::InvalidConfiguration {
                field: "negotiation.timeout_ms".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }
        if !self.devices.capture_audio && !self.devices.capture_video {
            return Err(ClassroomError::InvalidConfiguration {
                field: "devices".to_string(),
                reason: "at least one of capture_audio or capture_video is required".to_string(),
            });
        }
        self.quality.thresholds.validate()
    }

    pub fn with_recovery(mut self, max_retries: u32, retry_delay: Duration) -> Self {
        self.recovery.max_retries = max_retries;
        self.recovery.retry_delay_ms = retry_delay.as_millis() as u64;
        self
    }

    pub fn with_negotiation_timeout(mut self, timeout: Duration) -> Self {
        self.negotiation.timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_video(mut self, enabled: bool) -> Self {
        self.devices.capture_video = enabled;
        self
    }
}
