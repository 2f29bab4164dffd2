use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{PalaverError, Result};

/// Top-level configuration for the widget runtime.
///
/// Loaded from a TOML file by the embedding host. Each section corresponds
/// to one orchestrator component or cross-cutting concern. Server-fetched
/// per-chatbot settings (`ChatbotConfig`) override the quota default.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WidgetConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub tts: TtsConfig,
    #[serde(default)]
    pub recording: RecordingConfig,
}

impl Default for WidgetConfig {
    fn default() -> Self {
        Self {
            general: GeneralConfig::default(),
            api: ApiConfig::default(),
            auth: AuthConfig::default(),
            tts: TtsConfig::default(),
            recording: RecordingConfig::default(),
        }
    }
}

impl WidgetConfig {
    /// Load configuration from a TOML file.
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: WidgetConfig = toml::from_str(&content)?;
        info!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    /// Load configuration from a TOML file, falling back to defaults if the
    /// file does not exist or cannot be parsed.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(
                    "Failed to load config from {}: {}. Using defaults.",
                    path.display(),
                    e
                );
                Self::default()
            }
        }
    }

    /// Save the current configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| PalaverError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        info!("Configuration saved to {}", path.display());
        Ok(())
    }
}

/// General settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Data directory for the SQLite session store.
    pub data_dir: String,
    /// Log level: trace, debug, info, warn, error.
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            data_dir: "~/.palaver".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// Backend API settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Base URL of the widget backend.
    pub base_url: String,
    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            timeout_secs: 30,
        }
    }
}

/// Authentication flow settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Seconds a user must wait between OTP resend requests.
    pub resend_cooldown_secs: i64,
    /// Required length of a one-time code.
    pub otp_length: usize,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            resend_cooldown_secs: 60,
            otp_length: 6,
        }
    }
}

/// Text-to-speech generation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TtsConfig {
    /// Debounce window before a generation request is issued.
    pub debounce_ms: u64,
    /// Additional attempts after the first failure.
    pub max_retries: u32,
    /// Linear backoff step between retries, in seconds.
    pub retry_backoff_secs: u64,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 500,
            max_retries: 2,
            retry_backoff_secs: 1,
        }
    }
}

/// Microphone capture settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    /// Hard ceiling on capture duration in seconds.
    pub max_duration_secs: u64,
    /// Capture encodings to probe, most preferred first.
    pub mime_preferences: Vec<String>,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            max_duration_secs: 30,
            mime_preferences: vec![
                "audio/webm;codecs=opus".to_string(),
                "audio/webm".to_string(),
                "audio/mp4".to_string(),
                "audio/wav".to_string(),
            ],
        }
    }
}
