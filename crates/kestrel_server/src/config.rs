use serde::{Deserialize, Serialize};

use kestrel_common::config::KvStoreConfig;

/// Top-level daemon configuration (`kestrel.toml`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Control-plane RPC listen address.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// The store itself.
    #[serde(default)]
    pub store: KvStoreConfig,
}

fn default_listen_addr() -> String {
    "0.0.0.0:6262".to_string()
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            store: KvStoreConfig::default(),
        }
    }
}

impl DaemonConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.listen_addr.is_empty() {
            return Err("listen_addr must not be empty".into());
        }
        self.store.validate()
    }
}
