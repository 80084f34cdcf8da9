//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
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

/// Control server configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    /// Address the control server binds to (default 127.0.0.1)
    #[serde(default = "default_host")]
    pub host: String,
    /// Well-known control port (default 1984)
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    1984
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// What to do with an encoder's output file when its job is aborted or fails
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PartialOutputPolicy {
    /// Leave whatever the encoder wrote on disk
    #[default]
    Keep,
    /// Remove the job's declared output path
    Delete,
}

/// Frame pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EncodingConfig {
    /// Frame producer worker threads (0 = one per logical core)
    #[serde(default)]
    pub max_threads: u32,
    /// Completed-but-unwritten frames kept in memory (0 = derive)
    #[serde(default)]
    pub cached_frames_limit: u32,
    /// Grace period before an aborted encoder is killed, in milliseconds
    #[serde(default = "default_abort_timeout_ms")]
    pub abort_timeout_ms: u64,
    /// Partial output handling for aborted/failed encodes
    #[serde(default)]
    pub partial_output: PartialOutputPolicy,
}

fn default_abort_timeout_ms() -> u64 {
    3000
}

impl Default for EncodingConfig {
    fn default() -> Self {
        Self {
            max_threads: 0,
            cached_frames_limit: 0,
            abort_timeout_ms: default_abort_timeout_ms(),
            partial_output: PartialOutputPolicy::Keep,
        }
    }
}

/// Persistent state configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StorageConfig {
    /// Directory holding the job list, presets and the instance lock
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
}

fn default_state_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(env::temp_dir)
        .join("framejob")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
        }
    }
}

/// Clip produced by the built-in blank-clip frame producer
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProducerConfig {
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    #[serde(default = "default_fps_num")]
    pub fps_num: u64,
    #[serde(default = "default_fps_den")]
    pub fps_den: u64,
    #[serde(default = "default_bits_per_sample")]
    pub bits_per_sample: u32,
    /// Chroma subsampling: "420", "422", "444" or "gray"
    #[serde(default = "default_subsampling")]
    pub subsampling: String,
    #[serde(default = "default_num_frames")]
    pub num_frames: u64,
    /// Artificial per-frame compute time in milliseconds
    #[serde(default)]
    pub frame_delay_ms: u64,
}

fn default_width() -> u32 {
    640
}

fn default_height() -> u32 {
    480
}

fn default_fps_num() -> u64 {
    24
}

fn default_fps_den() -> u64 {
    1
}

fn default_bits_per_sample() -> u32 {
    8
}

fn default_subsampling() -> String {
    "420".to_string()
}

fn default_num_frames() -> u64 {
    240
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            width: default_width(),
            height: default_height(),
            fps_num: default_fps_num(),
            fps_den: default_fps_den(),
            bits_per_sample: default_bits_per_sample(),
            subsampling: default_subsampling(),
            num_frames: default_num_frames(),
            frame_delay_ms: 0,
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub encoding: EncodingConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub producer: ProducerConfig,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the config file and handles missing optional fields with defaults.
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
    /// - FRAMEJOB_HOST -> server.host
    /// - FRAMEJOB_PORT -> server.port
    /// - FRAMEJOB_MAX_THREADS -> encoding.max_threads
    /// - FRAMEJOB_CACHED_FRAMES_LIMIT -> encoding.cached_frames_limit
    /// - FRAMEJOB_ABORT_TIMEOUT_MS -> encoding.abort_timeout_ms
    /// - FRAMEJOB_STATE_DIR -> storage.state_dir
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("FRAMEJOB_HOST") {
            if !val.trim().is_empty() {
                self.server.host = val.trim().to_string();
            }
        }

        if let Ok(val) = env::var("FRAMEJOB_PORT") {
            if let Ok(port) = val.parse::<u16>() {
                self.server.port = port;
            }
        }

        if let Ok(val) = env::var("FRAMEJOB_MAX_THREADS") {
            if let Ok(threads) = val.parse::<u32>() {
                self.encoding.max_threads = threads;
            }
        }

        if let Ok(val) = env::var("FRAMEJOB_CACHED_FRAMES_LIMIT") {
            if let Ok(limit) = val.parse::<u32>() {
                self.encoding.cached_frames_limit = limit;
            }
        }

        if let Ok(val) = env::var("FRAMEJOB_ABORT_TIMEOUT_MS") {
            if let Ok(ms) = val.parse::<u64>() {
                self.encoding.abort_timeout_ms = ms;
            }
        }

        if let Ok(val) = env::var("FRAMEJOB_STATE_DIR") {
            if !val.is_empty() {
                self.storage.state_dir = PathBuf::from(val);
            }
        }
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Like [`Config::load`], but a missing file yields the defaults
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            let mut config = Self::default();
            config.apply_env_overrides();
            return Ok(config);
        }
        Self::load(path)
    }

    /// Path of the persisted job list
    pub fn jobs_file(&self) -> PathBuf {
        self.storage.state_dir.join("jobs.json")
    }

    /// Path of the single-instance lock file
    pub fn lock_file(&self) -> PathBuf {
        self.storage.state_dir.join("framejob.lock")
    }
}
