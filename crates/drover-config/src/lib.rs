//! # drover-config
//!
//! Configuration management for drover distribution nodes.
//!
//! Loads configuration from:
//! 1. `~/.drover/config.toml` (global)
//! 2. `./drover.toml` (node-local, overrides global key by key)
//! 3. Environment variables (highest priority)
//!
//! The binary applies its command-line flags on top of the result.

pub mod logging;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub cache: CacheConfig,
    pub node: NodeConfig,
    pub worker: WorkerConfig,
    pub maintenance: MaintenanceConfig,
    pub poller: PollerConfig,
    pub alerts: AlertConfig,
    pub registry: RegistryConfig,
}

impl Config {
    /// Load config from standard locations
    pub fn load() -> Result<Self, ConfigError> {
        let mut table = toml::Table::new();

        if let Some(global_path) = Self::global_config_path() {
            if global_path.exists() {
                debug!("Loading global config from {:?}", global_path);
                merge_tables(&mut table, read_table(&global_path)?);
            }
        }

        let local_path = Path::new(LOCAL_CONFIG_FILE);
        if local_path.exists() {
            debug!("Loading node config from {:?}", local_path);
            merge_tables(&mut table, read_table(local_path)?);
        }

        let mut config: Config = toml::Value::Table(table).try_into()?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load a single explicit config file, then apply environment overrides.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        debug!("Loading config from {:?}", path);
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Global config path: ~/.drover/config.toml
    pub fn global_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".drover/config.toml"))
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary variable lookup.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(root) = lookup(ENV_CACHE_ROOT) {
            self.cache.root = PathBuf::from(root);
        }
        if let Some(limit) = parse_var(&lookup, ENV_CACHE_LIMIT) {
            self.cache.size_limit = limit;
        }
        if let Some(name) = lookup(ENV_NODE_NAME) {
            self.node.name = name;
        }
        if let Some(secs) = parse_var(&lookup, ENV_MAINTENANCE_INTERVAL) {
            self.maintenance.interval_secs = secs;
        }
        if let Some(count) = parse_var(&lookup, ENV_PRECACHE_BUILDS) {
            self.maintenance.precache_builds = count;
        }
        if let Some(path) = lookup(ENV_REGISTRY) {
            self.registry.path = PathBuf::from(path);
        }
    }

    /// Identity used when asking the registry for assigned tasks.
    ///
    /// An empty configured name falls back to the host name.
    pub fn node_name(&self) -> String {
        let configured = self.node.name.trim();
        if !configured.is_empty() {
            return configured.to_string();
        }
        match nix::unistd::gethostname() {
            Ok(name) => name.to_string_lossy().into_owned(),
            Err(e) => {
                warn!(error = %e, "Could not read host name, using default node name");
                DEFAULT_NODE_NAME.to_string()
            }
        }
    }

    /// Generate default config TOML string
    pub fn default_toml() -> String {
        Config::default().to_toml()
    }

    pub fn to_toml(&self) -> String {
        // Every field is a plain scalar or path, so rendering cannot fail.
        toml::to_string_pretty(self).unwrap_or_default()
    }
}

pub const LOCAL_CONFIG_FILE: &str = "drover.toml";
pub const DEFAULT_NODE_NAME: &str = "drover-node";

pub const ENV_CACHE_ROOT: &str = "DROVER_CACHE_ROOT";
pub const ENV_CACHE_LIMIT: &str = "DROVER_CACHE_LIMIT";
pub const ENV_NODE_NAME: &str = "DROVER_NODE_NAME";
pub const ENV_MAINTENANCE_INTERVAL: &str = "DROVER_MAINTENANCE_INTERVAL";
pub const ENV_PRECACHE_BUILDS: &str = "DROVER_PRECACHE_BUILDS";
pub const ENV_REGISTRY: &str = "DROVER_REGISTRY";

fn read_table(path: &Path) -> Result<toml::Table, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    Ok(contents.parse::<toml::Table>()?)
}

/// Overlay `overlay` onto `base`, descending into nested tables.
fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(nested)) => {
                merge_tables(existing, nested);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

fn parse_var<F, T>(lookup: &F, key: &str) -> Option<T>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = %raw, "Ignoring unparseable environment override");
            None
        }
    }
}

/// Cache storage configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Cache root holding the 256 shard directories
    pub root: PathBuf,
    /// Disk budget in bytes
    pub size_limit: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/var/cache/drover"),
            size_limit: 500 * 1024 * 1024 * 1024,
        }
    }
}

/// Node identity
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Name tasks are assigned to (empty = host name)
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Sleep when the request queue is empty
    pub idle_sleep_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            idle_sleep_ms: 1000,
        }
    }
}

impl WorkerConfig {
    pub fn idle_sleep(&self) -> Duration {
        Duration::from_millis(self.idle_sleep_ms)
    }
}

/// Orphan reclamation, eviction and idle precache
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    pub interval_secs: u64,
    /// Hashes checked against the registry per pass
    pub orphan_sample_size: usize,
    /// Newest ready builds warmed when idle
    pub precache_builds: usize,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            interval_secs: 300,
            orphan_sample_size: 500,
            precache_builds: 4,
        }
    }
}

impl MaintenanceConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerConfig {
    pub interval_secs: u64,
    /// Longest an executor waits for one file to reach the cache
    pub file_timeout_secs: u64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval_secs: 5,
            file_timeout_secs: 3600,
        }
    }
}

impl PollerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn file_timeout(&self) -> Duration {
        Duration::from_secs(self.file_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    /// Pause after a reported error before the loop carries on
    pub error_backoff_secs: u64,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            error_backoff_secs: 300,
        }
    }
}

impl AlertConfig {
    pub fn error_backoff(&self) -> Duration {
        Duration::from_secs(self.error_backoff_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Directory holding `registry.json`
    pub path: PathBuf,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/var/lib/drover/registry"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.maintenance.orphan_sample_size, 500);
        assert_eq!(config.maintenance.interval(), Duration::from_secs(300));
        assert_eq!(config.poller.interval(), Duration::from_secs(5));
        assert_eq!(config.alerts.error_backoff(), Duration::from_secs(300));
    }

    #[test]
    fn test_default_toml_generation() {
        let toml_str = Config::default_toml();
        assert!(toml_str.contains("[cache]"));
        assert!(toml_str.contains("[maintenance]"));
        assert!(toml_str.contains("orphan_sample_size = 500"));
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = Config::default();
        let parsed: Config = toml::from_str(&config.to_toml()).unwrap();
        assert_eq!(config, parsed);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let parsed: Config = toml::from_str("[cache]\nsize_limit = 10000\n").unwrap();
        assert_eq!(parsed.cache.size_limit, 10000);
        assert_eq!(parsed.cache.root, CacheConfig::default().root);
        assert_eq!(parsed.poller, PollerConfig::default());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config.apply_overrides(lookup_from(&[
            (ENV_CACHE_ROOT, "/srv/cache"),
            (ENV_CACHE_LIMIT, "12345"),
            (ENV_NODE_NAME, "node-7"),
            (ENV_PRECACHE_BUILDS, "2"),
        ]));
        assert_eq!(config.cache.root, PathBuf::from("/srv/cache"));
        assert_eq!(config.cache.size_limit, 12345);
        assert_eq!(config.node.name, "node-7");
        assert_eq!(config.maintenance.precache_builds, 2);
    }

    #[test]
    fn test_bad_numeric_override_is_ignored() {
        let mut config = Config::default();
        config.apply_overrides(lookup_from(&[(ENV_CACHE_LIMIT, "lots")]));
        assert_eq!(config.cache.size_limit, CacheConfig::default().size_limit);
    }

    #[test]
    fn test_merge_tables_overrides_key_by_key() {
        let mut base: toml::Table = "[cache]\nroot = \"/a\"\nsize_limit = 1\n".parse().unwrap();
        let overlay: toml::Table = "[cache]\nsize_limit = 2\n".parse().unwrap();
        merge_tables(&mut base, overlay);
        let config: Config = toml::Value::Table(base).try_into().unwrap();
        assert_eq!(config.cache.root, PathBuf::from("/a"));
        assert_eq!(config.cache.size_limit, 2);
    }

    #[test]
    fn test_node_name_prefers_configured() {
        let mut config = Config::default();
        config.node.name = "  prop-01 ".to_string();
        assert_eq!(config.node_name(), "prop-01");

        config.node.name.clear();
        assert!(!config.node_name().is_empty());
    }
}
