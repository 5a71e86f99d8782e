// src/config/mod.rs
//! Configuration management module
//!
//! Configuration is layered: built-in defaults, then a TOML file, then
//! environment variables, then validation.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Multimodal generation service
    pub gemini: GeminiConfig,
    /// Upload/poll behaviour and request deadline
    pub pipeline: PipelineConfig,
    /// Retry policy for rate-limited calls
    pub retry: RetryConfig,
    /// Stage 1 prompt and generation settings
    pub analysis: AnalysisConfig,
    /// Optional voice synthesis
    pub voice: VoiceConfig,
    /// Media limits and run record storage
    pub storage: StorageConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Multimodal generation service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeminiConfig {
    /// API key; usually supplied through the environment
    pub api_key: String,
    /// Service base URL
    pub base_url: String,
    /// Model used for both stages
    pub model: String,
    /// Per-HTTP-request timeout in seconds
    pub request_timeout_secs: u64,
}

/// Pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Interval between processing-status checks, in seconds
    pub poll_interval_secs: u64,
    /// Ceiling on waiting for one upload to become ready, in seconds
    pub processing_timeout_secs: u64,
    /// Optional deadline for a whole analysis request, in seconds
    pub request_timeout_secs: Option<u64>,
    /// Run the structured-data extraction stage after the report
    pub extract_structured: bool,
}

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts per remote call, including the first one
    pub max_attempts: u32,
    /// Backoff unit; attempt `n` sleeps `n * base_delay_ms`
    pub base_delay_ms: u64,
}

/// Analysis configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Built-in prompt template name (`technique` or `biomechanics`)
    pub template: String,
    /// Custom template file overriding the built-in one
    pub prompt_template_path: Option<PathBuf>,
    /// Sampling temperature for the report
    pub temperature: Option<f32>,
    /// Output ceiling for the report
    pub max_output_tokens: Option<u32>,
    /// Reject requests that carry no query text
    pub require_query: bool,
}

/// Voice provider selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoiceProvider {
    ElevenLabs,
    Disabled,
}

/// Voice synthesis configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceConfig {
    pub provider: VoiceProvider,
    pub api_key: String,
    pub base_url: String,
    pub model_id: String,
    pub default_voice_id: String,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory for saved analysis runs
    pub results_directory: PathBuf,
    /// Maximum accepted media size in megabytes
    pub max_file_size_mb: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: "https://generativelanguage.googleapis.com".to_string(),
            model: "gemini-2.5-flash".to_string(),
            request_timeout_secs: 900,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 1,
            processing_timeout_secs: 180,
            request_timeout_secs: None,
            extract_structured: true,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 2000,
        }
    }
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            template: "technique".to_string(),
            prompt_template_path: None,
            temperature: Some(0.4),
            max_output_tokens: Some(8192),
            require_query: false,
        }
    }
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            provider: VoiceProvider::Disabled,
            api_key: String::new(),
            base_url: "https://api.elevenlabs.io".to_string(),
            model_id: "eleven_monolingual_v1".to_string(),
            default_voice_id: "21m00Tcm4TlvDq8ikWAM".to_string(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            results_directory: default_results_dir(),
            max_file_size_mb: 50,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl PipelineConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn processing_timeout(&self) -> Duration {
        Duration::from_secs(self.processing_timeout_secs)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_secs.map(Duration::from_secs)
    }
}

impl StorageConfig {
    pub fn max_file_size_bytes(&self) -> u64 {
        self.max_file_size_mb * 1024 * 1024
    }
}

impl Config {
    /// Load configuration from an explicit file (or the default locations)
    /// and environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::load_from_file(path)?,
            None => match Self::default_file() {
                Some(found) => Self::load_from_file(&found)?,
                None => Config::default(),
            },
        };

        config.load_from_env()?;
        config.validate()?;

        Ok(config)
    }

    /// First existing config file among `./config.toml` and the user config dir.
    fn default_file() -> Option<PathBuf> {
        let local = PathBuf::from("config.toml");
        if local.exists() {
            return Some(local);
        }
        dirs::config_dir()
            .map(|dir| dir.join("technique-coach").join("config.toml"))
            .filter(|candidate| candidate.exists())
    }

    /// Load configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Override values from environment variables
    pub fn load_from_env(&mut self) -> Result<()> {
        if let Ok(key) = std::env::var("GEMINI_API_KEY").or_else(|_| std::env::var("GOOGLE_API_KEY")) {
            self.gemini.api_key = key;
        }
        if let Ok(model) = std::env::var("GEMINI_MODEL") {
            self.gemini.model = model;
        }
        if let Ok(base_url) = std::env::var("GEMINI_BASE_URL") {
            self.gemini.base_url = base_url;
        }
        if let Ok(key) = std::env::var("ELEVENLABS_API_KEY") {
            self.voice.api_key = key;
            if self.voice.provider == VoiceProvider::Disabled && !self.voice.api_key.is_empty() {
                self.voice.provider = VoiceProvider::ElevenLabs;
            }
        }
        if let Ok(dir) = std::env::var("COACH_RESULTS_DIR") {
            self.storage.results_directory = PathBuf::from(dir);
        }
        if let Ok(level) = std::env::var("LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(timeout) = std::env::var("COACH_PROCESSING_TIMEOUT_SECS") {
            self.pipeline.processing_timeout_secs = timeout
                .parse()
                .context("Invalid COACH_PROCESSING_TIMEOUT_SECS")?;
        }

        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.pipeline.poll_interval_secs == 0 {
            return Err(anyhow::anyhow!("pipeline.poll_interval_secs cannot be 0"));
        }
        if self.pipeline.processing_timeout_secs == 0 {
            return Err(anyhow::anyhow!("pipeline.processing_timeout_secs cannot be 0"));
        }
        if self.pipeline.request_timeout_secs == Some(0) {
            return Err(anyhow::anyhow!("pipeline.request_timeout_secs cannot be 0"));
        }
        if self.retry.max_attempts == 0 {
            return Err(anyhow::anyhow!("retry.max_attempts must be at least 1"));
        }
        if self.gemini.base_url.is_empty() {
            return Err(anyhow::anyhow!("gemini.base_url cannot be empty"));
        }
        if self.storage.max_file_size_mb == 0 {
            return Err(anyhow::anyhow!("storage.max_file_size_mb cannot be 0"));
        }
        if self.voice.provider == VoiceProvider::ElevenLabs && self.voice.api_key.is_empty() {
            return Err(anyhow::anyhow!(
                "voice.api_key is required when using the elevenlabs provider"
            ));
        }

        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => return Err(anyhow::anyhow!("Invalid log level: {}", self.logging.level)),
        }

        Ok(())
    }

    /// Checked only by commands that call the model.
    pub fn require_gemini_key(&self) -> Result<()> {
        if self.gemini.api_key.is_empty() {
            return Err(anyhow::anyhow!(
                "GEMINI_API_KEY (or GOOGLE_API_KEY) is not set"
            ));
        }
        Ok(())
    }

    /// Save configuration to file
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Check if voice output is configured
    pub fn is_voice_configured(&self) -> bool {
        self.voice.provider != VoiceProvider::Disabled && !self.voice.api_key.is_empty()
    }
}

/// Default directory for saved analysis runs
pub fn default_results_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|dir| dir.join("technique-coach").join("analysis_results"))
        .unwrap_or_else(|| PathBuf::from("./analysis_results"))
}
