//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// A value parsed but is not usable
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
            ConfigError::Invalid(msg) => write!(f, "Invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Video codec family selected for the transcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    H264,
    #[default]
    H265,
}

/// Hardware path used for decode and encode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HwAccel {
    /// Software encode on the CPU.
    #[default]
    None,
    /// Intel Quick Sync Video.
    Qsv,
    /// NVIDIA NVENC via CUDA.
    Nvenc,
}

/// Output quality tier. Higher quality means larger files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum QualityTier {
    High,
    Medium,
    #[default]
    Low,
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Codec::H264 => write!(f, "h264"),
            Codec::H265 => write!(f, "h265"),
        }
    }
}

impl fmt::Display for HwAccel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HwAccel::None => write!(f, "none"),
            HwAccel::Qsv => write!(f, "qsv"),
            HwAccel::Nvenc => write!(f, "nvenc"),
        }
    }
}

impl fmt::Display for QualityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QualityTier::High => write!(f, "high"),
            QualityTier::Medium => write!(f, "medium"),
            QualityTier::Low => write!(f, "low"),
        }
    }
}

impl FromStr for Codec {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "h264" | "avc" | "x264" => Ok(Codec::H264),
            "h265" | "hevc" | "x265" => Ok(Codec::H265),
            other => Err(ConfigError::Invalid(format!("unknown codec '{}'", other))),
        }
    }
}

impl FromStr for HwAccel {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "none" | "cpu" | "" => Ok(HwAccel::None),
            "qsv" => Ok(HwAccel::Qsv),
            "nvenc" | "cuda" => Ok(HwAccel::Nvenc),
            other => Err(ConfigError::Invalid(format!("unknown hw_accel '{}'", other))),
        }
    }
}

impl FromStr for QualityTier {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "high" => Ok(QualityTier::High),
            "medium" => Ok(QualityTier::Medium),
            "low" => Ok(QualityTier::Low),
            other => Err(ConfigError::Invalid(format!("unknown quality '{}'", other))),
        }
    }
}

/// Filesystem locations used by the daemon
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PathsConfig {
    /// Directory watched for new video files (scanned recursively)
    #[serde(default)]
    pub input_dir: PathBuf,
    /// Directory receiving `compressed_<stem>.mp4` outputs
    #[serde(default)]
    pub output_dir: PathBuf,
    /// Transcoder executable, either a path or a name resolved via PATH
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: PathBuf,
    /// SQLite database holding the job table
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
}

fn default_ffmpeg_path() -> PathBuf {
    PathBuf::from("ffmpeg")
}

fn default_database_path() -> PathBuf {
    PathBuf::from("compressd.db")
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            input_dir: PathBuf::new(),
            output_dir: PathBuf::new(),
            ffmpeg_path: default_ffmpeg_path(),
            database_path: default_database_path(),
        }
    }
}

/// Encode policy. Immutable once the daemon starts.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct EncodeConfig {
    #[serde(default)]
    pub codec: Codec,
    #[serde(default)]
    pub hw_accel: HwAccel,
    #[serde(default)]
    pub quality: QualityTier,
    /// Remove the source file once its job is recorded as done
    #[serde(default)]
    pub delete_source_on_success: bool,
}

/// Compression scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SchedulerConfig {
    /// Seconds between polls of the pending queue (default 5)
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Maximum concurrent encodes (0 = auto-derive)
    #[serde(default)]
    pub max_concurrent_jobs: u32,
    /// Seconds running encodes get to exit on shutdown (default 5)
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
    /// Age after which a Compressing row is reclaimed at startup (default 30)
    #[serde(default = "default_stale_claim_secs")]
    pub stale_claim_secs: u64,
}

fn default_poll_interval_secs() -> u64 {
    5
}

fn default_shutdown_grace_secs() -> u64 {
    5
}

fn default_stale_claim_secs() -> u64 {
    30
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            max_concurrent_jobs: 0,
            shutdown_grace_secs: default_shutdown_grace_secs(),
            stale_claim_secs: default_stale_claim_secs(),
        }
    }
}

/// Directory monitor configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MonitorConfig {
    /// Debounce after a filesystem notification, in milliseconds (default 1000)
    #[serde(default = "default_settle_millis")]
    pub settle_millis: u64,
    /// Attempts made for a transient failure before the event is dropped (default 3)
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    /// First backoff delay in milliseconds, doubled per attempt (default 500)
    #[serde(default = "default_retry_base_millis")]
    pub retry_base_millis: u64,
    /// Lowercase extensions without the dot; empty accepts every file
    #[serde(default)]
    pub extensions: Vec<String>,
}

fn default_settle_millis() -> u64 {
    1000
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_base_millis() -> u64 {
    500
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            settle_millis: default_settle_millis(),
            retry_attempts: default_retry_attempts(),
            retry_base_millis: default_retry_base_millis(),
            extensions: Vec::new(),
        }
    }
}

/// Metrics endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
    #[serde(default = "default_metrics_listen")]
    pub listen: String,
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_metrics_listen() -> String {
    "127.0.0.1:7878".to_string()
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            listen: default_metrics_listen(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub encode: EncodeConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the config.toml file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - COMPRESSD_INPUT_DIR -> paths.input_dir
    /// - COMPRESSD_OUTPUT_DIR -> paths.output_dir
    /// - COMPRESSD_FFMPEG_PATH -> paths.ffmpeg_path
    /// - COMPRESSD_DATABASE_PATH -> paths.database_path
    /// - COMPRESSD_CODEC -> encode.codec
    /// - COMPRESSD_HW_ACCEL -> encode.hw_accel
    /// - COMPRESSD_QUALITY -> encode.quality
    /// - COMPRESSD_DELETE_SOURCE -> encode.delete_source_on_success
    /// - COMPRESSD_MAX_CONCURRENT_JOBS -> scheduler.max_concurrent_jobs
    ///
    /// Values that fail to parse leave the existing setting untouched.
    pub fn apply_env_overrides(&mut self) {
        if let Some(dir) = non_empty_env("COMPRESSD_INPUT_DIR") {
            self.paths.input_dir = PathBuf::from(dir);
        }

        if let Some(dir) = non_empty_env("COMPRESSD_OUTPUT_DIR") {
            self.paths.output_dir = PathBuf::from(dir);
        }

        if let Some(path) = non_empty_env("COMPRESSD_FFMPEG_PATH") {
            self.paths.ffmpeg_path = PathBuf::from(path);
        }

        if let Some(path) = non_empty_env("COMPRESSD_DATABASE_PATH") {
            self.paths.database_path = PathBuf::from(path);
        }

        if let Ok(val) = env::var("COMPRESSD_CODEC") {
            if let Ok(codec) = val.parse::<Codec>() {
                self.encode.codec = codec;
            }
        }

        if let Ok(val) = env::var("COMPRESSD_HW_ACCEL") {
            if let Ok(hw) = val.parse::<HwAccel>() {
                self.encode.hw_accel = hw;
            }
        }

        if let Ok(val) = env::var("COMPRESSD_QUALITY") {
            if let Ok(quality) = val.parse::<QualityTier>() {
                self.encode.quality = quality;
            }
        }

        if let Ok(val) = env::var("COMPRESSD_DELETE_SOURCE") {
            // Accept "true", "1", "yes" as true; "false", "0", "no" as false
            match val.to_lowercase().as_str() {
                "true" | "1" | "yes" => self.encode.delete_source_on_success = true,
                "false" | "0" | "no" => self.encode.delete_source_on_success = false,
                _ => {}
            }
        }

        if let Ok(val) = env::var("COMPRESSD_MAX_CONCURRENT_JOBS") {
            if let Ok(jobs) = val.parse::<u32>() {
                self.scheduler.max_concurrent_jobs = jobs;
            }
        }
    }

    /// Check the settings the daemon cannot run without.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.paths.input_dir.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("paths.input_dir is required".to_string()));
        }
        if self.paths.output_dir.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("paths.output_dir is required".to_string()));
        }
        if self.scheduler.poll_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "scheduler.poll_interval_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Load configuration from file, apply environment overrides and validate
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}
