//! Server configuration.
//!
//! Every field has a default, so a TOML file only needs the keys it changes:
//!
//! ```toml
//! bind_addr = "0.0.0.0:9090"
//! storage_path = "/var/lib/manuscripts"
//! idle_timeout_secs = 900
//!
//! [[users]]
//! user_id = "alice"
//! name = "Alice Liddell"
//! role = "author"
//! ```

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::directory::UserProfile;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum concurrent sessions on one manuscript
    pub max_sessions_per_manuscript: usize,
    /// Outbound frames buffered per connection before a peer counts as lagging
    pub outbound_capacity: usize,
    /// WebSocket ping interval in seconds
    pub heartbeat_interval_secs: u64,
    /// RocksDB path (None = in-memory store)
    pub storage_path: Option<PathBuf>,
    /// Sessions with no activity for this long are ended
    pub idle_timeout_secs: u64,
    /// How often the idle reaper runs
    pub reap_interval_secs: u64,
    /// Largest version gap an edit may be transformed across
    pub max_transform_distance: u64,
    /// Applied edits between automatic snapshots (0 = off)
    pub auto_snapshot_interval: u64,
    /// How long an empty room stays loaded
    pub room_grace_secs: u64,
    /// Static user directory
    pub users: Vec<UserProfile>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_sessions_per_manuscript: 50,
            outbound_capacity: 256,
            heartbeat_interval_secs: 30,
            storage_path: None,
            idle_timeout_secs: 30 * 60,
            reap_interval_secs: 30,
            max_transform_distance: 500,
            auto_snapshot_interval: 100,
            room_grace_secs: 60,
            users: Vec::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

impl ServerConfig {
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs.max(1))
    }

    pub fn room_grace(&self) -> Duration {
        Duration::from_secs(self.room_grace_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Role;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.outbound_capacity, 256);
        assert!(config.storage_path.is_none());
        assert!(config.users.is_empty());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: ServerConfig = toml::from_str(
            r#"
            bind_addr = "0.0.0.0:8080"
            max_transform_distance = 10

            [[users]]
            user_id = "alice"
            name = "Alice"
            role = "editor"
            "#,
        )
        .unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:8080");
        assert_eq!(config.max_transform_distance, 10);
        assert_eq!(config.heartbeat_interval_secs, 30);
        assert_eq!(config.users.len(), 1);
        assert_eq!(config.users[0].role, Role::Editor);
    }

    #[test]
    fn test_from_toml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "storage_path = \"/tmp/ms\"\nroom_grace_secs = 5").unwrap();
        let config = ServerConfig::from_toml_file(file.path()).unwrap();
        assert_eq!(config.storage_path, Some(PathBuf::from("/tmp/ms")));
        assert_eq!(config.room_grace(), Duration::from_secs(5));
    }

    #[test]
    fn test_from_missing_file() {
        let err = ServerConfig::from_toml_file("/nonexistent/collab.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        assert!(toml::from_str::<ServerConfig>("idle_timeout_secs = \"soon\"").is_err());
    }
}
