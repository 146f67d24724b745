//! Configuration for a netcfg control-plane instance
//!
//! Configuration is loaded from TOML, then environment overrides
//! (`NETCFG_*`) are applied, then the result is validated. Every section
//! carries `#[serde(default)]` so a partial file is always accepted.

use crate::error::{NetcfgError, NetcfgResult};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub node: NodeConfig,
    pub coordination: CoordinationConfig,
    pub store: StoreConfig,
    pub allocator: AllocatorConfig,
    pub pipeline: PipelineConfig,
    pub policy: PolicyConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Identifies this instance as the origin of change notifications
    pub instance_id: String,

    /// Directory holding redb files for the durable backends
    pub data_dir: PathBuf,
}

/// Which implementation backs a collaborator seam
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Memory,
    Redb,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinationConfig {
    pub backend: BackendKind,

    /// redb file name under `node.data_dir`
    pub db_file: String,

    /// Attempts per coordination call before a transient failure surfaces
    pub session_retry_attempts: u32,

    #[serde(with = "humantime_serde")]
    pub session_retry_base_delay: Duration,

    #[serde(with = "humantime_serde")]
    pub session_retry_max_delay: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: BackendKind,
    pub db_file: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocatorConfig {
    /// Upper bound on alloc() conflict retries before giving up
    pub max_conflict_retries: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Retry a create once with a uniqueness suffix when the name is taken
    pub retry_on_name_collision: bool,

    /// Buffered change events per subscriber
    pub notification_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Accept 4-byte autonomous system numbers
    pub enable_4byte_as: bool,

    /// Route targets at or above this number are reserved for automatic
    /// allocation and may collide with a changed ASN
    pub bgp_rtgt_min_id: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset
    pub level: String,

    pub with_thread_ids: bool,

    pub with_file_location: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            instance_id: "netcfg-0".to_string(),
            data_dir: PathBuf::from("./data"),
        }
    }
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Memory,
            db_file: "coordination.redb".to_string(),
            session_retry_attempts: 5,
            session_retry_base_delay: Duration::from_millis(50),
            session_retry_max_delay: Duration::from_secs(2),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Memory,
            db_file: "objects.redb".to_string(),
        }
    }
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            max_conflict_retries: 4096,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            retry_on_name_collision: true,
            notification_capacity: 1024,
        }
    }
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            enable_4byte_as: false,
            bgp_rtgt_min_id: 8_000_000,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            with_thread_ids: true,
            with_file_location: false,
        }
    }
}

impl PolicyConfig {
    /// Highest autonomous system number accepted by validation
    pub fn max_asn(&self) -> u64 {
        if self.enable_4byte_as {
            u32::MAX as u64
        } else {
            u16::MAX as u64
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, apply env overrides and validate
    pub fn from_file<P: AsRef<Path>>(path: P) -> NetcfgResult<Self> {
        let contents = fs::read_to_string(path.as_ref()).map_err(|e| {
            NetcfgError::configuration(
                "config_file",
                format!("Failed to read {}: {}", path.as_ref().display(), e),
            )
        })?;

        let mut config = Self::from_toml_str(&contents)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(contents: &str) -> NetcfgResult<Self> {
        toml::from_str(contents)
            .map_err(|e| NetcfgError::configuration("config_file", format!("Failed to parse TOML: {}", e)))
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(id) = std::env::var("NETCFG_INSTANCE_ID") {
            self.node.instance_id = id;
        }
        if let Ok(dir) = std::env::var("NETCFG_DATA_DIR") {
            self.node.data_dir = PathBuf::from(dir);
        }
        if let Ok(level) = std::env::var("NETCFG_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(backend) = std::env::var("NETCFG_COORDINATION_BACKEND") {
            if let Some(kind) = parse_backend(&backend) {
                self.coordination.backend = kind;
            }
        }
        if let Ok(backend) = std::env::var("NETCFG_STORE_BACKEND") {
            if let Some(kind) = parse_backend(&backend) {
                self.store.backend = kind;
            }
        }
    }

    pub fn validate(&self) -> NetcfgResult<()> {
        if self.node.instance_id.is_empty() {
            return Err(NetcfgError::configuration(
                "node.instance_id",
                "Instance id cannot be empty",
            ));
        }

        let uses_redb = self.coordination.backend == BackendKind::Redb
            || self.store.backend == BackendKind::Redb;
        if uses_redb && self.node.data_dir.as_os_str().is_empty() {
            return Err(NetcfgError::configuration(
                "node.data_dir",
                "Data directory is required for redb backends",
            ));
        }

        if self.coordination.session_retry_attempts == 0 {
            return Err(NetcfgError::invalid_config(
                "coordination.session_retry_attempts",
                0,
                "must be at least 1",
            ));
        }

        if self.allocator.max_conflict_retries == 0 {
            return Err(NetcfgError::invalid_config(
                "allocator.max_conflict_retries",
                0,
                "must be at least 1",
            ));
        }

        if self.pipeline.notification_capacity == 0 {
            return Err(NetcfgError::invalid_config(
                "pipeline.notification_capacity",
                0,
                "must be at least 1",
            ));
        }

        match self.logging.level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => {
                return Err(NetcfgError::invalid_config(
                    "logging.level",
                    other,
                    "expected one of trace, debug, info, warn, error",
                ))
            }
        }

        Ok(())
    }

    pub fn coordination_db_path(&self) -> PathBuf {
        self.node.data_dir.join(&self.coordination.db_file)
    }

    pub fn store_db_path(&self) -> PathBuf {
        self.node.data_dir.join(&self.store.db_file)
    }
}

fn parse_backend(value: &str) -> Option<BackendKind> {
    match value.to_ascii_lowercase().as_str() {
        "memory" => Some(BackendKind::Memory),
        "redb" => Some(BackendKind::Redb),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert!(config.pipeline.retry_on_name_collision);
        assert_eq!(config.policy.max_asn(), 65535);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = Config::from_toml_str(
            r#"
            [node]
            instance_id = "cfg-a"

            [coordination]
            backend = "redb"
            session_retry_base_delay = "10ms"

            [policy]
            enable_4byte_as = true
            "#,
        )
        .unwrap();

        assert_eq!(config.node.instance_id, "cfg-a");
        assert_eq!(config.coordination.backend, BackendKind::Redb);
        assert_eq!(
            config.coordination.session_retry_base_delay,
            Duration::from_millis(10)
        );
        assert_eq!(config.coordination.session_retry_attempts, 5);
        assert_eq!(config.policy.max_asn(), u32::MAX as u64);
        assert_eq!(config.store.backend, BackendKind::Memory);
    }

    #[test]
    fn test_invalid_log_level_rejected() {
        let mut config = Config::default();
        config.logging.level = "chatty".to_string();
        let err = config.validate().unwrap_err();
        assert!(matches!(err, NetcfgError::ConfigurationError { ref component, .. } if component == "logging.level"));
    }

    #[test]
    fn test_zero_conflict_retries_rejected() {
        let mut config = Config::default();
        config.allocator.max_conflict_retries = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_db_paths_are_under_data_dir() {
        let mut config = Config::default();
        config.node.data_dir = PathBuf::from("/var/lib/netcfg");
        assert_eq!(
            config.coordination_db_path(),
            PathBuf::from("/var/lib/netcfg/coordination.redb")
        );
        assert_eq!(
            config.store_db_path(),
            PathBuf::from("/var/lib/netcfg/objects.redb")
        );
    }
}
