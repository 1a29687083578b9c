use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::session::metrics::SessionMetrics;
use crate::session::schema::{AllowAll, Schema, Security, StaticSchema};
use crate::storage::Storage;

/// Tunables of a session, loadable from TOML.
///
/// ```toml
/// local_cache_capacity = 1024
/// link_consistency = true
/// validate_thread = true
/// navigation_batch = 1
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Records kept in the session-local cache.
    pub local_cache_capacity: usize,
    /// Whether reverse-adjacency bags are maintained.
    pub link_consistency: bool,
    /// Whether every operation checks that it runs on the owning thread.
    pub validate_thread: bool,
    /// `limit` passed to storage neighbour queries.
    pub navigation_batch: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            local_cache_capacity: 4096,
            link_consistency: true,
            validate_thread: true,
            navigation_batch: 1,
        }
    }
}

impl SessionConfig {
    /// Parses a TOML document; missing keys keep their defaults.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(contents).map_err(|source| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            source,
        })?;
        config.validate()
    }

    /// Loads the config from `explicit`, or from the default location.
    ///
    /// A missing file yields the defaults.
    pub fn load(explicit: Option<PathBuf>) -> Result<Self, ConfigError> {
        match explicit.or_else(default_config_path) {
            Some(path) if path.exists() => read_file(&path)?.validate(),
            _ => Ok(Self::default()),
        }
    }

    /// Writes the config as pretty TOML, creating parent directories.
    pub fn persist(&self, target: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|source| ConfigError::CreateDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let serialized =
            toml::to_string_pretty(self).map_err(|source| ConfigError::Serialize { source })?;
        fs::write(target, serialized).map_err(|source| ConfigError::Write {
            path: target.to_path_buf(),
            source,
        })
    }

    fn validate(self) -> Result<Self, ConfigError> {
        if self.local_cache_capacity == 0 {
            return Err(ConfigError::Invalid("local_cache_capacity must be positive"));
        }
        if self.navigation_batch == 0 {
            return Err(ConfigError::Invalid("navigation_batch must be positive"));
        }
        Ok(self)
    }
}

fn read_file(path: &Path) -> Result<SessionConfig, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Default config location: `<config dir>/sombra/session.toml`.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|base| base.join("sombra").join("session.toml"))
}

/// Config loading failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read session config {path}: {source}")]
    Read {
        /// File that failed.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// The file is not valid TOML for this config.
    #[error("failed to parse session config {path}: {source}")]
    Parse {
        /// File that failed.
        path: PathBuf,
        /// Underlying error.
        source: toml::de::Error,
    },
    /// The config could not be rendered.
    #[error("failed to serialize session config: {source}")]
    Serialize {
        /// Underlying error.
        source: toml::ser::Error,
    },
    /// The file could not be written.
    #[error("failed to write session config {path}: {source}")]
    Write {
        /// File that failed.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// The parent directory could not be created.
    #[error("failed to create config directory {path}: {source}")]
    CreateDir {
        /// Directory that failed.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// A value is out of range.
    #[error("invalid session config: {0}")]
    Invalid(&'static str),
}

/// Everything needed to open a [`super::Session`].
#[derive(Clone)]
pub struct SessionOptions {
    /// Storage engine shared with other sessions.
    pub storage: Arc<dyn Storage>,
    /// Schema collaborator.
    pub schema: Arc<dyn Schema>,
    /// Security collaborator.
    pub security: Arc<dyn Security>,
    /// Optional metrics sink.
    pub metrics: Option<Arc<dyn SessionMetrics>>,
    /// Tunables.
    pub config: SessionConfig,
}

impl SessionOptions {
    /// Options with an empty schema, permissive security and default tunables.
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            schema: Arc::new(StaticSchema::default()),
            security: Arc::new(AllowAll),
            metrics: None,
            config: SessionConfig::default(),
        }
    }

    /// Sets the schema collaborator.
    pub fn schema(mut self, schema: Arc<dyn Schema>) -> Self {
        self.schema = schema;
        self
    }

    /// Sets the security collaborator.
    pub fn security(mut self, security: Arc<dyn Security>) -> Self {
        self.security = security;
        self
    }

    /// Sets the metrics collection implementation.
    pub fn metrics(mut self, metrics: Arc<dyn SessionMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Replaces every tunable.
    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the local cache capacity.
    pub fn cache_capacity(mut self, records: usize) -> Self {
        self.config.local_cache_capacity = records;
        self
    }

    /// Enables or disables reverse-adjacency maintenance.
    pub fn link_consistency(mut self, enabled: bool) -> Self {
        self.config.link_consistency = enabled;
        self
    }

    /// Enables or disables the owning-thread check.
    pub fn validate_thread(mut self, enabled: bool) -> Self {
        self.config.validate_thread = enabled;
        self
    }
}
