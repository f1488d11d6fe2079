use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config failed: {0}")]
    Read(String),
    #[error("parse config failed: {0}")]
    Parse(String),
    #[error("schema load failed: {0}")]
    SchemaLoad(String),
    #[error("schema validation failed: {0}")]
    SchemaValidation(String),
    #[error("unsupported config: {0}")]
    UnsupportedConfig(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: Server,
    pub store: Store,
    pub cluster: Cluster,
    #[serde(default)]
    pub coordination: Coordination,
    #[serde(default)]
    pub health: Health,
    #[serde(default)]
    pub balancer: Balancer,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    pub listen_addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Store {
    #[serde(rename = "type")]
    pub kind: String,
    pub sqlite_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cluster {
    pub peers: Vec<PeerEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerEntry {
    pub id: String,
    pub name: String,
    /// Identifier of this peer's account on the chat platform.
    pub external_id: String,
    #[serde(default)]
    pub primary: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Coordination {
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
}

impl Default for Coordination {
    fn default() -> Self {
        Self {
            lock_timeout_ms: default_lock_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Health {
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    #[serde(default = "default_stale_threshold_ms")]
    pub stale_threshold_ms: u64,
}

impl Default for Health {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            stale_threshold_ms: default_stale_threshold_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Balancer {
    #[serde(default = "default_strategy")]
    pub strategy: String,
    #[serde(default = "default_max_sessions_per_peer")]
    pub max_sessions_per_peer: u32,
    #[serde(default = "default_inactivity_threshold_ms")]
    pub inactivity_threshold_ms: u64,
}

impl Default for Balancer {
    fn default() -> Self {
        Self {
            strategy: default_strategy(),
            max_sessions_per_peer: default_max_sessions_per_peer(),
            inactivity_threshold_ms: default_inactivity_threshold_ms(),
        }
    }
}

fn default_lock_timeout_ms() -> u64 {
    10_000
}

fn default_tick_interval_ms() -> u64 {
    30_000
}

fn default_stale_threshold_ms() -> u64 {
    60_000
}

fn default_strategy() -> String {
    "priority".to_string()
}

fn default_max_sessions_per_peer() -> u32 {
    100
}

fn default_inactivity_threshold_ms() -> u64 {
    300_000
}

pub fn load_and_validate(path: &str) -> Result<Config, ConfigError> {
    let config_text =
        std::fs::read_to_string(path).map_err(|e| ConfigError::Read(e.to_string()))?;
    let value: serde_yaml::Value =
        serde_yaml::from_str(&config_text).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let instance = serde_json::to_value(value).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate_against_schema(&instance)?;

    let cfg: Config =
        serde_json::from_value(instance).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate_runtime_support(&cfg)?;
    Ok(cfg)
}

fn validate_against_schema(instance: &serde_json::Value) -> Result<(), ConfigError> {
    let schema_path = [
        std::path::PathBuf::from("config/config.schema.json"),
        std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .join("config/config.schema.json"),
    ]
    .into_iter()
    .find(|p| p.exists())
    .ok_or_else(|| {
        ConfigError::SchemaLoad(
            "config schema not found at config/config.schema.json or workspace config path"
                .to_string(),
        )
    })?;

    let schema_text =
        std::fs::read_to_string(schema_path).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;
    let schema: serde_json::Value =
        serde_json::from_str(&schema_text).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;

    let validator =
        jsonschema::validator_for(&schema).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;
    if let Err(first) = validator.validate(instance) {
        return Err(ConfigError::SchemaValidation(first.to_string()));
    }
    Ok(())
}

fn validate_runtime_support(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.store.kind != "memory" && cfg.store.kind != "sqlite" {
        return Err(ConfigError::UnsupportedConfig(format!(
            "store.type={} is not implemented; supported: memory, sqlite",
            cfg.store.kind
        )));
    }
    if cfg.store.kind == "memory" && cfg.store.sqlite_path.is_some() {
        return Err(ConfigError::UnsupportedConfig(
            "store.sqlite_path is not supported when store.type=memory".to_string(),
        ));
    }
    if cfg.store.kind == "sqlite"
        && cfg
            .store
            .sqlite_path
            .as_ref()
            .map(|v| v.trim().is_empty())
            .unwrap_or(true)
    {
        return Err(ConfigError::UnsupportedConfig(
            "store.sqlite_path is required when store.type=sqlite".to_string(),
        ));
    }
    if cfg.cluster.peers.is_empty() {
        return Err(ConfigError::UnsupportedConfig(
            "cluster.peers must list at least one peer".to_string(),
        ));
    }
    let primaries = cfg.cluster.peers.iter().filter(|p| p.primary).count();
    if primaries != 1 {
        return Err(ConfigError::UnsupportedConfig(format!(
            "cluster.peers must designate exactly one primary peer, found {primaries}"
        )));
    }
    let mut seen = std::collections::HashSet::new();
    for peer in &cfg.cluster.peers {
        if peer.id.trim().is_empty() {
            return Err(ConfigError::UnsupportedConfig(
                "cluster.peers entries require a non-empty id".to_string(),
            ));
        }
        if !seen.insert(peer.id.as_str()) {
            return Err(ConfigError::UnsupportedConfig(format!(
                "cluster.peers contains duplicate id {}",
                peer.id
            )));
        }
    }
    if cfg.balancer.strategy != "priority" && cfg.balancer.strategy != "least_loaded" {
        return Err(ConfigError::UnsupportedConfig(format!(
            "balancer.strategy={} is not implemented; supported: priority, least_loaded",
            cfg.balancer.strategy
        )));
    }
    if cfg.coordination.lock_timeout_ms == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "coordination.lock_timeout_ms must be >= 1".to_string(),
        ));
    }
    if cfg.health.tick_interval_ms == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "health.tick_interval_ms must be >= 1".to_string(),
        ));
    }
    if cfg.health.stale_threshold_ms == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "health.stale_threshold_ms must be >= 1".to_string(),
        ));
    }
    if cfg.balancer.max_sessions_per_peer == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "balancer.max_sessions_per_peer must be >= 1".to_string(),
        ));
    }
    if cfg.balancer.inactivity_threshold_ms == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "balancer.inactivity_threshold_ms must be >= 1".to_string(),
        ));
    }
    Ok(())
}
