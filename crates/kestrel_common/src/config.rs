use serde::{Deserialize, Serialize};

/// KvStore configuration. One process hosts one store with one database per
/// configured area.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvStoreConfig {
    /// Name of this node. Used as the originator id of self-originated
    /// records and as this node's entry in publication node paths.
    pub node_name: String,
    /// Areas hosted by this store. Must be non-empty and unique.
    pub areas: Vec<String>,
    /// Default TTL applied to self-originated values, in milliseconds.
    #[serde(default = "default_key_ttl_ms")]
    pub key_ttl_ms: i64,
    /// Subtracted from every finite ttl on each outbound hop. Must be >= 1.
    #[serde(default = "default_ttl_decrement_ms")]
    pub ttl_decrement_ms: i64,
    /// Flood rate limit. Absent means unlimited.
    #[serde(default)]
    pub flood_rate: Option<FloodRate>,
    /// Ingress filter configuration (leaf-node mode).
    #[serde(default)]
    pub filters: FilterConfig,
    /// DSCP value for outgoing control-plane packets.
    #[serde(default)]
    pub ip_tos: Option<u32>,
    /// Makes the legacy wildcard-area fallback (`area = "0"` resolving to
    /// the sole configured area) explicit. The RPC-boundary fallback is
    /// retained for backwards compatibility regardless; this flag only
    /// validates that the alias is meaningful.
    #[serde(default)]
    pub wildcard_area_alias: bool,
    /// Peer sync and transport tunables.
    #[serde(default)]
    pub sync: SyncConfig,
}

fn default_key_ttl_ms() -> i64 {
    300_000
}

fn default_ttl_decrement_ms() -> i64 {
    1
}

/// Token-bucket parameters for the flood rate limiter.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FloodRate {
    /// Sustained publications per second.
    pub msgs_per_sec: u64,
    /// Maximum burst size.
    pub burst: u64,
}

/// Ingress filter configuration. Filters apply only when `set_leaf_node` is
/// true: keys matching neither filter set are rejected on ingress, and
/// full-sync dump requests carry the prefixes outward so peers pre-filter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilterConfig {
    #[serde(default)]
    pub key_prefix_filters: Vec<String>,
    #[serde(default)]
    pub key_originator_id_filters: Vec<String>,
    #[serde(default)]
    pub set_leaf_node: bool,
}

/// Peer sync and transport tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// TCP connect timeout for peer clients, in milliseconds.
    pub connect_timeout_ms: u64,
    /// Per-call processing timeout for peer RPCs, in milliseconds.
    pub request_timeout_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 1_000,
            request_timeout_ms: 5_000,
        }
    }
}

impl KvStoreConfig {
    /// Validate the configuration. Returns a human-readable reason on the
    /// first violation found.
    pub fn validate(&self) -> Result<(), String> {
        if self.node_name.is_empty() {
            return Err("node_name must not be empty".into());
        }
        if self.areas.is_empty() {
            return Err("at least one area must be configured".into());
        }
        let mut seen = std::collections::BTreeSet::new();
        for area in &self.areas {
            if area.is_empty() {
                return Err("area ids must not be empty".into());
            }
            if !seen.insert(area) {
                return Err(format!("duplicate area id: {area}"));
            }
        }
        if self.key_ttl_ms <= 0 {
            return Err("key_ttl_ms must be positive".into());
        }
        if self.ttl_decrement_ms < 1 {
            return Err("ttl_decrement_ms must be >= 1".into());
        }
        if self.key_ttl_ms <= self.ttl_decrement_ms {
            return Err("key_ttl_ms must exceed ttl_decrement_ms".into());
        }
        if let Some(rate) = &self.flood_rate {
            if rate.msgs_per_sec == 0 || rate.burst == 0 {
                return Err("flood_rate msgs_per_sec and burst must be >= 1".into());
            }
        }
        if self.wildcard_area_alias && self.areas.len() != 1 {
            return Err("wildcard_area_alias requires exactly one configured area".into());
        }
        if self.sync.connect_timeout_ms == 0 || self.sync.request_timeout_ms == 0 {
            return Err("sync timeouts must be >= 1ms".into());
        }
        Ok(())
    }
}

impl Default for KvStoreConfig {
    fn default() -> Self {
        Self {
            node_name: "kestrel".to_string(),
            areas: vec!["0".to_string()],
            key_ttl_ms: default_key_ttl_ms(),
            ttl_decrement_ms: default_ttl_decrement_ms(),
            flood_rate: None,
            filters: FilterConfig::default(),
            ip_tos: None,
            wildcard_area_alias: false,
            sync: SyncConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_valid() {
        assert!(KvStoreConfig::default().validate().is_ok());
    }

    #[test]
    fn test_empty_node_name_rejected() {
        let mut cfg = KvStoreConfig::default();
        cfg.node_name = String::new();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_no_areas_rejected() {
        let mut cfg = KvStoreConfig::default();
        cfg.areas.clear();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_duplicate_area_rejected() {
        let mut cfg = KvStoreConfig::default();
        cfg.areas = vec!["1".into(), "1".into()];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_zero_ttl_decrement_rejected() {
        let mut cfg = KvStoreConfig::default();
        cfg.ttl_decrement_ms = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_ttl_must_exceed_decrement() {
        let mut cfg = KvStoreConfig::default();
        cfg.key_ttl_ms = 5;
        cfg.ttl_decrement_ms = 5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_zero_flood_rate_rejected() {
        let mut cfg = KvStoreConfig::default();
        cfg.flood_rate = Some(FloodRate {
            msgs_per_sec: 0,
            burst: 8,
        });
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_wildcard_alias_requires_single_area() {
        let mut cfg = KvStoreConfig::default();
        cfg.areas = vec!["1".into(), "2".into()];
        cfg.wildcard_area_alias = true;
        assert!(cfg.validate().is_err());
        cfg.areas = vec!["1".into()];
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_toml_roundtrip_with_defaults() {
        let toml = r#"
node_name = "node-a"
areas = ["1", "2"]

[flood_rate]
msgs_per_sec = 500
burst = 100
"#;
        let cfg: KvStoreConfig = toml::from_str(toml).unwrap();
        assert_eq!(cfg.node_name, "node-a");
        assert_eq!(cfg.areas.len(), 2);
        assert_eq!(cfg.key_ttl_ms, 300_000);
        assert_eq!(cfg.ttl_decrement_ms, 1);
        assert_eq!(cfg.flood_rate.unwrap().msgs_per_sec, 500);
        assert!(!cfg.filters.set_leaf_node);
        assert!(cfg.validate().is_ok());
    }
}
