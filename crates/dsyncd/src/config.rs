//! Daemon configuration file
//!
//! ```toml
//! [engine]
//! sync-interval-ms = 250
//! position-tolerance = 1.0
//!
//! [daemon]
//! replicas = 3
//! relay-latency-ms = 20
//! metrics-addr = "127.0.0.1:9464"
//! ```

use anyhow::{Context, Result};
use dsync_engine::SyncOptions;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct FileConfig {
    /// Options shared by every replica; `client-id` is assigned per replica
    pub engine: SyncOptions,
    pub daemon: DaemonConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct DaemonConfig {
    pub replicas: Option<usize>,
    pub relay_latency_ms: Option<u64>,
    pub metrics_addr: Option<SocketAddr>,
    pub scenario: Option<String>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).with_context(|| format!("reading config {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("parsing config {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_engine_and_daemon_tables() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dsync.toml");
        std::fs::write(
            &path,
            r#"
[engine]
sync-interval-ms = 250
ignore-minor-changes = false

[engine.extractor]
exclude-types = ["annotation"]

[daemon]
replicas = 3
metrics-addr = "127.0.0.1:9464"
"#,
        )
        .unwrap();

        let config = FileConfig::load(&path).unwrap();
        assert_eq!(config.engine.sync_interval_ms, 250);
        assert!(!config.engine.ignore_minor_changes);
        assert_eq!(config.engine.max_history_size, 100);
        assert_eq!(config.engine.extractor.exclude_types, vec!["annotation".to_string()]);
        assert_eq!(config.daemon.replicas, Some(3));
        assert_eq!(config.daemon.metrics_addr, Some("127.0.0.1:9464".parse().unwrap()));
        assert_eq!(config.daemon.relay_latency_ms, None);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert!(FileConfig::load(Path::new("/nonexistent/dsync.toml")).is_err());
    }
}
