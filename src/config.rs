//! Client configuration: endpoints plus tuning knobs, loadable from a
//! JSON file so deployments can point at a different backend without a
//! rebuild.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::transport::ReconnectPolicy;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Base URL of the REST surface, e.g. `http://127.0.0.1:8000/api`.
    #[serde(default = "default_api_base")]
    pub api_base: String,
    /// Base URL of the push channel, e.g. `ws://127.0.0.1:8000`.
    #[serde(default = "default_ws_base")]
    pub ws_base: String,
    #[serde(default)]
    pub reconnect: ReconnectPolicy,
    /// Default lifetime for locally requested approvals. `None` means they
    /// never expire on their own.
    #[serde(default = "default_approval_ttl_secs")]
    pub approval_ttl_secs: Option<u64>,
}

fn default_api_base() -> String {
    "http://127.0.0.1:8000/api".to_string()
}

fn default_ws_base() -> String {
    "ws://127.0.0.1:8000".to_string()
}

fn default_approval_ttl_secs() -> Option<u64> {
    Some(300)
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            ws_base: default_ws_base(),
            reconnect: ReconnectPolicy::default(),
            approval_ttl_secs: default_approval_ttl_secs(),
        }
    }
}

impl SyncConfig {
    /// Push-channel endpoint for one pipeline.
    pub fn ws_url(&self, pipeline_id: &str) -> String {
        format!("{}/ws/{}", self.ws_base.trim_end_matches('/'), pipeline_id)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config at {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let raw = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, raw)
            .with_context(|| format!("Failed to write config to {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let config: SyncConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, SyncConfig::default());
    }

    #[test]
    fn ws_url_joins_without_double_slash() {
        let config = SyncConfig {
            ws_base: "ws://host:9000/".to_string(),
            ..SyncConfig::default()
        };
        assert_eq!(config.ws_url("p1"), "ws://host:9000/ws/p1");
    }

    #[test]
    fn round_trips_through_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("sync.json");

        let config = SyncConfig {
            api_base: "http://backend:8000/api".to_string(),
            approval_ttl_secs: None,
            ..SyncConfig::default()
        };
        config.save(&path).unwrap();

        let loaded = SyncConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn load_reports_the_offending_path() {
        let err = SyncConfig::load(Path::new("/nonexistent/sync.json")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/sync.json"));
    }

    #[test]
    fn partial_file_keeps_remaining_defaults() {
        let config: SyncConfig =
            serde_json::from_str(r#"{"api_base": "http://other:1234/api"}"#).unwrap();
        assert_eq!(config.api_base, "http://other:1234/api");
        assert_eq!(config.ws_base, default_ws_base());
        assert_eq!(config.reconnect, ReconnectPolicy::default());
    }
}
