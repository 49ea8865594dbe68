use serde::Deserialize;
use std::path::Path;

/// Settings shared by the producer and consumer binaries.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    #[serde(default = "defaults::pool_name")]
    pub pool_name: String,
    #[serde(default = "defaults::entries")]
    pub entries: u32,
    #[serde(default = "defaults::buckets")]
    pub buckets: usize,
    #[serde(default = "defaults::notifications")]
    pub notifications: usize,
    #[serde(default = "defaults::socket_dir")]
    pub socket_dir: String,
    #[serde(default = "defaults::log_level")]
    pub log_level: String,
    /// Consumer run time; 0 runs until a signal arrives.
    #[serde(default = "defaults::duration_secs")]
    pub duration_secs: u64,
    /// The producer signals the consumer after this many puts.
    #[serde(default = "defaults::notify_every")]
    pub notify_every: u64,
    /// Unlink a leftover segment with the same name before creating.
    #[serde(default)]
    pub replace_existing: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read '{path}'")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config")]
    Parse(#[from] toml::de::Error),
}

mod defaults {
    pub fn pool_name() -> String {
        "basalt_pool".into()
    }

    pub fn entries() -> u32 {
        1024
    }

    pub fn buckets() -> usize {
        2
    }

    pub fn notifications() -> usize {
        1
    }

    pub fn socket_dir() -> String {
        "/tmp".into()
    }

    pub fn log_level() -> String {
        "info".into()
    }

    pub fn duration_secs() -> u64 {
        10
    }

    pub fn notify_every() -> u64 {
        2048
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            pool_name: defaults::pool_name(),
            entries: defaults::entries(),
            buckets: defaults::buckets(),
            notifications: defaults::notifications(),
            socket_dir: defaults::socket_dir(),
            log_level: defaults::log_level(),
            duration_secs: defaults::duration_secs(),
            notify_every: defaults::notify_every(),
            replace_existing: false,
        }
    }
}

impl PipelineConfig {
    pub fn load(path: impl AsRef<Path> + ToString) -> Result<Self, ConfigError> {
        let toml_to_str = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        Self::parse(&toml_to_str)
    }

    pub fn parse(toml_str: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(toml_str)?)
    }

    /// Loads `path` when given, defaults otherwise.
    pub fn load_or_default(path: Option<String>) -> Result<Self, ConfigError> {
        match path {
            Some(p) => Self::load(p),
            None => Ok(Self::default()),
        }
    }
}
