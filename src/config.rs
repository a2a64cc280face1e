//! Configuration types for the playback proxy

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{ProxyError, Result};

/// File name of the persisted resource index, relative to the cache root
pub const INDEX_FILE_NAME: &str = "network.json";

/// Layer that recordings are written to and that is consulted last on reads
pub const DEFAULT_LAYER: &str = "default";

/// Request header selecting cascade layers for a single request
pub const CASCADE_HEADER: &str = "x-proxy-cascade";

/// Assumed proxy overhead folded into recorded TTFB, in milliseconds
pub const DEFAULT_LATENCY_GAP_MS: f64 = 15.0;

/// Default autosave period in seconds
pub const DEFAULT_AUTOSAVE_SECS: u64 = 5;

/// Operating mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Forward everything to the origin and record it
    Online,
    /// Serve from recordings only; misses are 404
    Offline,
    /// Serve from recordings, record on a miss
    #[default]
    Mixed,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Online => "online",
            Self::Offline => "offline",
            Self::Mixed => "mixed",
        };
        f.write_str(name)
    }
}

impl FromStr for Mode {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "online" => Ok(Self::Online),
            "offline" => Ok(Self::Offline),
            "mixed" => Ok(Self::Mixed),
            other => Err(ProxyError::ConfigError(format!(
                "Unknown mode '{other}', expected online, offline or mixed"
            ))),
        }
    }
}

/// How the index picks a recording when no exact URL match exists
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MatchStrategy {
    /// Longest common prefix of path+query minus edit distance of the rest
    #[default]
    PrefixEditDistance,
    /// Same method/scheme/host/pathname, closest query string
    PathTree,
}

impl FromStr for MatchStrategy {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "prefix-edit-distance" | "prefix" => Ok(Self::PrefixEditDistance),
            "path-tree" | "tree" => Ok(Self::PathTree),
            other => Err(ProxyError::ConfigError(format!(
                "Unknown match strategy '{other}'"
            ))),
        }
    }
}

/// Playback timing knobs, mutable for the lifetime of an engine
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackSettings {
    /// Delay the response by the recorded TTFB
    pub waiting: bool,
    /// Limit the body to the recorded (or fixed) data rate
    pub throttling: bool,
    /// Playback speed multiplier; 2.0 replays twice as fast
    pub speed: f64,
    /// Fixed bytes per second; 0 means use the recorded rate
    pub fixed_data_rate: f64,
    /// Proxy overhead compensation in milliseconds
    pub latency_gap: f64,
}

impl Default for PlaybackSettings {
    fn default() -> Self {
        Self {
            waiting: true,
            throttling: true,
            speed: 1.0,
            fixed_data_rate: 0.0,
            latency_gap: DEFAULT_LATENCY_GAP_MS,
        }
    }
}

impl PlaybackSettings {
    /// Validate the timing knobs
    ///
    /// # Errors
    ///
    /// Returns error if speed is not positive or a rate/gap is negative
    pub fn validate(&self) -> Result<()> {
        if !self.speed.is_finite() || self.speed <= 0.0 {
            return Err(ProxyError::ConfigError(format!(
                "speed must be a positive number, got {}",
                self.speed
            )));
        }
        if !self.fixed_data_rate.is_finite() || self.fixed_data_rate < 0.0 {
            return Err(ProxyError::ConfigError(format!(
                "fixed_data_rate cannot be negative, got {}",
                self.fixed_data_rate
            )));
        }
        if !self.latency_gap.is_finite() || self.latency_gap < 0.0 {
            return Err(ProxyError::ConfigError(format!(
                "latency_gap cannot be negative, got {}",
                self.latency_gap
            )));
        }
        Ok(())
    }
}

/// Resource limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum concurrent client connections
    pub max_connections: usize,
    /// Maximum client request body size in bytes
    pub max_request_size: usize,
    /// Maximum origin response body size in bytes
    pub max_response_size: usize,
    /// Origin request timeout in milliseconds; 0 disables it
    pub upstream_timeout_ms: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: 4096,
            max_request_size: 64 * 1024 * 1024, // 64 MB
            max_response_size: 256 * 1024 * 1024, // 256 MB
            upstream_timeout_ms: 0,
        }
    }
}

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Cache root holding the index file and the body layers
    pub cache_root: PathBuf,
    /// Listen host
    pub host: String,
    /// Listen port; 0 picks a free port
    pub port: u16,
    /// Operating mode
    pub mode: Mode,
    /// Query parameters whose values are blanked before matching and storage
    pub ignore_params: Vec<String>,
    /// Layers consulted before the default layer, in precedence order
    pub cascade: Vec<String>,
    /// Approximate matching strategy
    pub match_strategy: MatchStrategy,
    /// Expose origin metrics in response headers
    pub debug_headers: bool,
    /// Autosave period in seconds; 0 disables autosave
    pub autosave_secs: u64,
    /// Playback timing
    pub playback: PlaybackSettings,
    /// Resource limits
    pub limits: LimitsConfig,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            cache_root: PathBuf::from("./"),
            host: "localhost".to_string(),
            port: 0,
            mode: Mode::default(),
            ignore_params: Vec::new(),
            cascade: Vec::new(),
            match_strategy: MatchStrategy::default(),
            debug_headers: false,
            autosave_secs: DEFAULT_AUTOSAVE_SECS,
            playback: PlaybackSettings::default(),
            limits: LimitsConfig::default(),
        }
    }
}

impl ProxyConfig {
    /// Configuration rooted at `cache_root` with every other value defaulted
    #[must_use]
    pub fn with_cache_root(cache_root: impl Into<PathBuf>) -> Self {
        Self {
            cache_root: cache_root.into(),
            ..Self::default()
        }
    }

    /// Load configuration from TOML file
    ///
    /// # Errors
    ///
    /// Returns error if file cannot be read or parsed
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ProxyError::ConfigError(format!("Failed to read config file: {e}")))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| ProxyError::ConfigError(format!("Failed to parse config: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Path of the persisted index file
    #[must_use]
    pub fn index_path(&self) -> PathBuf {
        self.cache_root.join(INDEX_FILE_NAME)
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns error if configuration is invalid
    pub fn validate(&self) -> Result<()> {
        if self.cache_root.as_os_str().is_empty() {
            return Err(ProxyError::ConfigError(
                "cache_root cannot be empty".to_string(),
            ));
        }

        if self.host.is_empty() {
            return Err(ProxyError::ConfigError("host cannot be empty".to_string()));
        }

        for layer in &self.cascade {
            validate_layer_name(layer)?;
        }

        if self.limits.max_connections == 0 {
            return Err(ProxyError::ConfigError(
                "max_connections must be > 0".to_string(),
            ));
        }

        if self.limits.max_request_size == 0 || self.limits.max_response_size == 0 {
            return Err(ProxyError::ConfigError(
                "max_request_size and max_response_size must be > 0".to_string(),
            ));
        }

        self.playback.validate()
    }

    /// Make sure the cache root exists and is a directory
    ///
    /// # Errors
    ///
    /// Returns error if the cache root cannot be created
    pub fn ensure_cache_root(&self) -> Result<()> {
        std::fs::create_dir_all(&self.cache_root).map_err(|e| {
            ProxyError::ConfigError(format!(
                "Cache root {} is not writable: {e}",
                self.cache_root.display()
            ))
        })?;

        if !self.cache_root.is_dir() {
            return Err(ProxyError::ConfigError(format!(
                "Cache root is not a directory: {}",
                self.cache_root.display()
            )));
        }

        Ok(())
    }
}

/// Validate a cascade layer name
///
/// # Errors
///
/// Returns error if the name could escape the cache root
pub fn validate_layer_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(ProxyError::ConfigError(
            "Layer name cannot be empty".to_string(),
        ));
    }

    if name.contains('/') || name.contains('\\') || name.contains('\0') {
        return Err(ProxyError::ConfigError(format!(
            "Layer name cannot contain path separators: {name}"
        )));
    }

    if name.starts_with('.') {
        return Err(ProxyError::ConfigError(format!(
            "Layer name cannot start with dot: {name}"
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::{NamedTempFile, TempDir};

    #[test]
    fn test_config_parse() {
        let config_toml = r#"
            cache_root = "/tmp/cache"
            mode = "offline"
            ignore_params = ["_", "utm_source"]

            [playback]
            speed = 2.0
            throttling = false
        "#;

        let config: ProxyConfig = toml::from_str(config_toml).unwrap();
        assert_eq!(config.mode, Mode::Offline);
        assert_eq!(config.ignore_params, vec!["_", "utm_source"]);
        assert!((config.playback.speed - 2.0).abs() < f64::EPSILON);
        assert!(!config.playback.throttling);
        assert!(config.playback.waiting);
        assert_eq!(config.host, "localhost");
        assert_eq!(config.match_strategy, MatchStrategy::PrefixEditDistance);
    }

    #[test]
    fn test_config_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        let config_toml = r#"
            cache_root = "/tmp"
            mode = "online"
            match_strategy = "path-tree"
        "#;
        file.write_all(config_toml.as_bytes()).unwrap();

        let config = ProxyConfig::from_file(file.path()).unwrap();
        assert_eq!(config.mode, Mode::Online);
        assert_eq!(config.match_strategy, MatchStrategy::PathTree);
        assert_eq!(config.index_path(), PathBuf::from("/tmp/network.json"));
    }

    #[test]
    fn test_invalid_speed() {
        let mut config = ProxyConfig::with_cache_root("/tmp");
        config.playback.speed = 0.0;
        assert!(config.validate().is_err());

        config.playback.speed = f64::NAN;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_cascade_layer() {
        let mut config = ProxyConfig::with_cache_root("/tmp");
        config.cascade = vec!["../escape".to_string()];
        assert!(config.validate().is_err());

        config.cascade = vec!["overrides".to_string()];
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_mode_from_str() {
        assert_eq!("online".parse::<Mode>().unwrap(), Mode::Online);
        assert_eq!("OFFLINE".parse::<Mode>().unwrap(), Mode::Offline);
        assert_eq!("mixed".parse::<Mode>().unwrap(), Mode::Mixed);
        assert!("sideways".parse::<Mode>().is_err());
        assert_eq!(Mode::Offline.to_string(), "offline");
    }

    #[test]
    fn test_ensure_cache_root_creates_directory() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("nested/cache");
        let config = ProxyConfig::with_cache_root(&root);

        config.ensure_cache_root().unwrap();
        assert!(root.is_dir());
    }
}
