//! Configuration for Keel builds.
//!
//! ```toml
//! [cache]
//! dir = ".keel/cache"
//! max_heap = "2G"
//! history_depth = 3
//! batch_window_ms = 200
//!
//! [cache.capacities]
//! fileHashes = 100000
//!
//! [evaluation]
//! max_reasons = 3
//!
//! [logging]
//! level = "info"
//! json = false
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Once, OnceLock};
use std::time::Duration;

use keel_cache::{CacheCapacityConfig, WorkerConfig};
use keel_uptodate::SessionConfig;
use parking_lot::ReentrantMutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing_subscriber::prelude::*;

pub const KEEL_CONFIG_ENV_VAR: &str = "KEEL_CONFIG_PATH";
pub const KEEL_CACHE_DIR_ENV_VAR: &str = "KEEL_CACHE_DIR";

const CONFIG_FILE_NAME: &str = "keel.toml";
const DEFAULT_CACHE_DIR: &str = ".keel/cache";

/// A byte size which supports both raw byte counts and human-friendly suffixes (`512M`, `2GiB`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ByteSize(pub u64);

impl Serialize for ByteSize {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_u64(self.0)
    }
}

impl<'de> Deserialize<'de> for ByteSize {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Bytes(u64),
            Human(String),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Bytes(value) => Ok(ByteSize(value)),
            Repr::Human(value) => parse_byte_size(&value)
                .map(ByteSize)
                .map_err(serde::de::Error::custom),
        }
    }
}

/// Parses `1024`, `64K`, `512MB`, `2GiB` and similar. Suffixes are binary multiples.
pub fn parse_byte_size(input: &str) -> Result<u64, String> {
    let trimmed = input.trim();
    let split = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (digits, suffix) = trimmed.split_at(split);
    let value: u64 = digits
        .parse()
        .map_err(|_| format!("invalid byte size {input:?}"))?;
    let shift = match suffix.trim().to_ascii_uppercase().as_str() {
        "" | "B" => 0,
        "K" | "KB" | "KIB" => 10,
        "M" | "MB" | "MIB" => 20,
        "G" | "GB" | "GIB" => 30,
        "T" | "TB" | "TIB" => 40,
        _ => return Err(format!("unknown byte size suffix in {input:?}")),
    };
    value
        .checked_mul(1u64 << shift)
        .ok_or_else(|| format!("byte size {input:?} is too large"))
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    /// Cache directory, relative to the build root unless absolute.
    #[serde(default)]
    pub dir: Option<PathBuf>,

    /// Heap the in-memory caches may assume. Detected from system memory when unset.
    #[serde(default)]
    pub max_heap: Option<ByteSize>,

    /// Execution records kept per work item.
    #[serde(default = "CacheConfig::default_history_depth")]
    pub history_depth: usize,

    #[serde(default = "CacheConfig::default_batch_window_ms")]
    pub batch_window_ms: u64,

    #[serde(default = "CacheConfig::default_max_locking_time_ms")]
    pub max_locking_time_ms: u64,

    #[serde(default = "CacheConfig::default_queue_capacity")]
    pub queue_capacity: usize,

    /// Entry limits per logical cache name, overriding the heap-scaled defaults.
    #[serde(default)]
    pub capacities: BTreeMap<String, usize>,
}

impl CacheConfig {
    fn default_history_depth() -> usize {
        keel_history::DEFAULT_HISTORY_DEPTH
    }

    fn default_batch_window_ms() -> u64 {
        WorkerConfig::default().batch_window.as_millis() as u64
    }

    fn default_max_locking_time_ms() -> u64 {
        WorkerConfig::default().max_locking_time.as_millis() as u64
    }

    fn default_queue_capacity() -> usize {
        WorkerConfig::default().queue_capacity
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: None,
            max_heap: None,
            history_depth: Self::default_history_depth(),
            batch_window_ms: Self::default_batch_window_ms(),
            max_locking_time_ms: Self::default_max_locking_time_ms(),
            queue_capacity: Self::default_queue_capacity(),
            capacities: BTreeMap::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EvaluationConfig {
    /// Out-of-date reasons reported per work item.
    #[serde(default = "EvaluationConfig::default_max_reasons")]
    pub max_reasons: usize,
}

impl EvaluationConfig {
    fn default_max_reasons() -> usize {
        keel_uptodate::DEFAULT_MAX_REASONS
    }
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            max_reasons: Self::default_max_reasons(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// A level (`info`, `debug`, ...) or a full `EnvFilter` directive string.
    #[serde(default = "LoggingConfig::default_level")]
    pub level: String,

    /// Emit logs as JSON lines.
    #[serde(default)]
    pub json: bool,

    #[serde(default = "LoggingConfig::default_stderr")]
    pub stderr: bool,
}

impl LoggingConfig {
    fn default_level() -> String {
        "info".to_owned()
    }

    fn default_stderr() -> bool {
        true
    }

    fn normalize_level_directives(input: &str) -> String {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Self::default_level();
        }
        match trimmed.to_ascii_lowercase().as_str() {
            "trace" => "trace".to_owned(),
            "debug" => "debug".to_owned(),
            "info" => "info".to_owned(),
            "warn" | "warning" => "warn".to_owned(),
            "error" => "error".to_owned(),
            _ => trimmed.to_owned(),
        }
    }

    fn config_env_filter(&self) -> tracing_subscriber::EnvFilter {
        let directives = Self::normalize_level_directives(&self.level);
        tracing_subscriber::EnvFilter::try_new(directives).unwrap_or_else(|_| {
            tracing_subscriber::EnvFilter::default().add_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
        })
    }

    /// The effective filter: the configured level merged with `RUST_LOG`, if set.
    pub fn env_filter(&self) -> tracing_subscriber::EnvFilter {
        let env_directives = std::env::var("RUST_LOG")
            .ok()
            .map(|value| value.trim().to_owned())
            .filter(|value| !value.is_empty());
        let config_directives = Self::normalize_level_directives(&self.level);

        match env_directives {
            Some(env_directives) => tracing_subscriber::EnvFilter::try_new(format!("{config_directives},{env_directives}"))
                .or_else(|_| tracing_subscriber::EnvFilter::try_new(env_directives))
                .unwrap_or_else(|_| self.config_env_filter()),
            None => self.config_env_filter(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
            json: false,
            stderr: Self::default_stderr(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KeelConfig {
    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub evaluation: EvaluationConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse toml config: {0}")]
    Toml(String),
    #[error("invalid value for {field}: {message}")]
    Invalid { field: &'static str, message: String },
}

impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> Self {
        // The default `Display` includes a source snippet; keep just the message.
        ConfigError::Toml(err.message().to_owned())
    }
}

impl KeelConfig {
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::load_from_str(&text)
    }

    pub fn load_from_str(text: &str) -> Result<Self, ConfigError> {
        let config: KeelConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache.history_depth == 0 {
            return Err(ConfigError::Invalid {
                field: "cache.history_depth",
                message: "must be at least 1".to_owned(),
            });
        }
        if self.cache.queue_capacity == 0 {
            return Err(ConfigError::Invalid {
                field: "cache.queue_capacity",
                message: "must be at least 1".to_owned(),
            });
        }
        if let Some((name, _)) = self.cache.capacities.iter().find(|(_, capacity)| **capacity == 0) {
            return Err(ConfigError::Invalid {
                field: "cache.capacities",
                message: format!("capacity of {name:?} must be at least 1"),
            });
        }
        Ok(())
    }

    /// The cache directory for a build rooted at `root`.
    ///
    /// [`KEEL_CACHE_DIR_ENV_VAR`] wins over the configured directory.
    pub fn cache_dir(&self, root: &Path) -> PathBuf {
        let from_env = {
            let _guard = config_env_lock().lock();
            std::env::var_os(KEEL_CACHE_DIR_ENV_VAR).filter(|value| !value.is_empty())
        };
        let dir = from_env
            .map(PathBuf::from)
            .or_else(|| self.cache.dir.clone())
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CACHE_DIR));
        if dir.is_absolute() {
            dir
        } else {
            root.join(dir)
        }
    }

    pub fn capacity_config(&self) -> CacheCapacityConfig {
        let base = match self.cache.max_heap {
            Some(ByteSize(bytes)) => CacheCapacityConfig::new(bytes),
            None => CacheCapacityConfig::detect(),
        };
        self.cache
            .capacities
            .iter()
            .fold(base, |config, (name, capacity)| config.with_override(name.clone(), *capacity))
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            batch_window: Duration::from_millis(self.cache.batch_window_ms),
            max_locking_time: Duration::from_millis(self.cache.max_locking_time_ms),
            queue_capacity: self.cache.queue_capacity,
        }
    }

    pub fn session_config(&self, root: &Path) -> SessionConfig {
        SessionConfig {
            cache_dir: self.cache_dir(root),
            capacities: self.capacity_config(),
            worker: self.worker_config(),
            history_depth: self.cache.history_depth,
            max_reasons: self.evaluation.max_reasons,
        }
    }
}

static CONFIG_ENV_LOCK: OnceLock<ReentrantMutex<()>> = OnceLock::new();

fn config_env_lock() -> &'static ReentrantMutex<()> {
    CONFIG_ENV_LOCK.get_or_init(|| ReentrantMutex::new(()))
}

/// Runs `f` while holding the lock that guards Keel's environment variable lookups.
pub fn with_config_env_lock<R>(f: impl FnOnce() -> R) -> R {
    let _guard = config_env_lock().lock();
    f()
}

/// Finds the configuration file for a build root: [`KEEL_CONFIG_ENV_VAR`] (absolute or relative
/// to `root`), then `keel.toml` in `root`.
pub fn discover_config_path(root: &Path) -> Option<PathBuf> {
    let _guard = config_env_lock().lock();
    if let Some(value) = std::env::var_os(KEEL_CONFIG_ENV_VAR) {
        let candidate = PathBuf::from(value);
        let path = if candidate.is_absolute() {
            candidate
        } else {
            root.join(candidate)
        };
        return Some(path.canonicalize().unwrap_or(path));
    }
    let path = root.join(CONFIG_FILE_NAME);
    path.is_file().then(|| path.canonicalize().unwrap_or(path))
}

/// Loads the configuration for a build root, or the defaults when there is none.
pub fn load_for_root(root: &Path) -> Result<(KeelConfig, Option<PathBuf>), ConfigError> {
    let Some(path) = discover_config_path(root) else {
        return Ok((KeelConfig::default(), None));
    };
    let config = KeelConfig::load_from_path(&path)?;
    tracing::debug!(target = "keel.config", path = %path.display(), "loaded config");
    Ok((config, Some(path)))
}

static TRACING_INIT: Once = Once::new();

/// Installs the global tracing subscriber. Only the first call in a process has an effect.
pub fn init_tracing(config: &LoggingConfig) {
    TRACING_INIT.call_once(|| {
        let filter = config.env_filter();
        let writer = if config.stderr {
            tracing_subscriber::fmt::writer::BoxMakeWriter::new(std::io::stderr)
        } else {
            tracing_subscriber::fmt::writer::BoxMakeWriter::new(std::io::sink)
        };

        let layer: Box<dyn tracing_subscriber::Layer<_> + Send + Sync> = if config.json {
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(writer)
                .with_ansi(false)
                .boxed()
        } else {
            tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .boxed()
        };

        if tracing_subscriber::registry().with(filter).with(layer).try_init().is_err() {
            // Another subscriber was installed first; keep it.
            return;
        }
        tracing::debug!(target = "keel.config", json = config.json, "tracing initialized");
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_synonyms_are_normalized() {
        assert_eq!(LoggingConfig::normalize_level_directives(" WARNING "), "warn");
        assert_eq!(LoggingConfig::normalize_level_directives(""), "info");
        assert_eq!(
            LoggingConfig::normalize_level_directives("keel.cache=trace"),
            "keel.cache=trace"
        );
    }

    #[test]
    fn byte_sizes_use_binary_suffixes() {
        assert_eq!(parse_byte_size("1024"), Ok(1024));
        assert_eq!(parse_byte_size("64K"), Ok(64 * 1024));
        assert_eq!(parse_byte_size("512mb"), Ok(512 * 1024 * 1024));
        assert_eq!(parse_byte_size("2GiB"), Ok(2 * 1024 * 1024 * 1024));
        assert!(parse_byte_size("12 parsecs").is_err());
        assert!(parse_byte_size("G").is_err());
    }
}
