//! Integration tests for drover-config
//!
//! These tests verify the config loading pipeline with real files.

use std::path::PathBuf;
use std::time::Duration;
use tempfile::tempdir;

#[test]
fn test_load_node_config_from_file() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("drover.toml");

    let config_content = r#"
[cache]
root = "/data/drover"
size_limit = 10000

[node]
name = "prop-eu-1"

[maintenance]
interval_secs = 60
precache_builds = 2

[registry]
path = "/mnt/registry"
"#;
    std::fs::write(&path, config_content).unwrap();

    let config = drover_config::Config::load_from(&path).unwrap();

    assert_eq!(config.cache.size_limit, 10000);
    assert_eq!(config.node_name(), "prop-eu-1");
    assert_eq!(config.maintenance.interval(), Duration::from_secs(60));
    assert_eq!(config.maintenance.precache_builds, 2);
    // Unset keys keep their defaults.
    assert_eq!(config.maintenance.orphan_sample_size, 500);
    assert_eq!(config.poller.interval(), Duration::from_secs(5));
    // DROVER_* variables may be set by the environment running the tests.
    if std::env::var(drover_config::ENV_REGISTRY).is_err() {
        assert_eq!(config.registry.path, PathBuf::from("/mnt/registry"));
    }
}

#[test]
fn test_load_rejects_invalid_toml() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("drover.toml");
    std::fs::write(&path, "[cache\nroot = 1").unwrap();

    let err = drover_config::Config::load_from(&path).unwrap_err();
    assert!(matches!(err, drover_config::ConfigError::Toml(_)));
}

#[test]
fn test_load_missing_file_is_io_error() {
    let temp = tempdir().unwrap();
    let err = drover_config::Config::load_from(&temp.path().join("absent.toml")).unwrap_err();
    assert!(matches!(err, drover_config::ConfigError::Io(_)));
}
