use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;

use fabricd_engine::EngineConfig;

/// Server configuration, loadable from TOML or JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    /// Cluster identifier, prefixed to the bus consumer id so several
    /// clusters can share one broker.
    pub cluster_id: String,
    /// Age in seconds after which an FQN creation lock with no backing
    /// row may be taken over.
    pub fqn_lock_stale_secs: u64,
    /// Configured route-target allocation minimum.
    pub rt_configured_min: u64,
    /// True when the global ASN is 4-byte.
    pub four_byte_asn: bool,
    /// Default list page size.
    pub page_limit_default: usize,
    /// Backlog size above which the notifier loop logs a warning.
    pub rabbit_max_pending_updates: u64,
    /// Path prefixes served without authentication.
    pub no_auth_prefixes: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8082)),
            cluster_id: String::from("default-cluster"),
            fqn_lock_stale_secs: 300,
            rt_configured_min: 0,
            four_byte_asn: false,
            page_limit_default: 256,
            rabbit_max_pending_updates: 4096,
            no_auth_prefixes: Vec::new(),
        }
    }
}

impl ServerConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "toml" => {
                let config: ServerConfig = toml::from_str(&contents)?;
                Ok(config)
            }
            "json" => {
                let config: ServerConfig = serde_json::from_str(&contents)?;
                Ok(config)
            }
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        }
    }

    /// The engine tuning knobs this configuration implies.
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            fqn_lock_stale_secs: self.fqn_lock_stale_secs,
            rt_configured_min: self.rt_configured_min,
            four_byte_asn: self.four_byte_asn,
            page_limit_default: self.page_limit_default,
        }
    }
}
