use serial_test::serial;
use std::env;
use std::fs::write;
use std::path::PathBuf;
use tempfile::NamedTempFile;

use pricelist_sync::load_config::{load_config, DEFAULT_PORT};
use pricelist_sync_core::download::DEFAULT_UPSTREAM_URL;

fn config_file(yaml: &str) -> NamedTempFile {
    let file = NamedTempFile::new().expect("temp file");
    write(file.path(), yaml).unwrap();
    file
}

fn clear_overrides() {
    env::remove_var("UPSTREAM_URL");
    env::remove_var("STORE_PATH");
    env::remove_var("PORT");
}

#[test]
#[serial]
fn test_load_config_full_file() {
    clear_overrides();
    let file = config_file(
        r#"
upstream:
  url: "http://localhost:9000/prices"
  timeout_ms: 2500
store:
  path: ./data/lists.json
server:
  port: 8080
sync:
  retention: 5
  throttle_window_ms: 2000
"#,
    );

    let config = load_config(file.path()).expect("Config should load");

    assert_eq!(config.upstream.url, "http://localhost:9000/prices");
    assert_eq!(config.upstream.timeout_ms, 2500);
    assert_eq!(config.store.path, Some(PathBuf::from("./data/lists.json")));
    assert_eq!(config.server.port, 8080);
    assert_eq!(config.sync.retention, 5);
    assert_eq!(config.sync.throttle_window_ms, 2000);
    // Unset sync fields keep their defaults.
    assert_eq!(config.sync.max_fetch_attempts, 20);
}

#[test]
#[serial]
fn test_load_config_empty_file_uses_defaults() {
    clear_overrides();
    let file = config_file("");

    let config = load_config(file.path()).expect("Config should load");

    assert_eq!(config.upstream.url, DEFAULT_UPSTREAM_URL);
    assert_eq!(config.server.port, DEFAULT_PORT);
    assert_eq!(config.store.path, None);
    assert_eq!(config.sync.retention, 15);
}

#[test]
#[serial]
fn test_env_overrides_win_over_file() {
    clear_overrides();
    let file = config_file("upstream:\n  url: http://from-file\nserver:\n  port: 8080\n");
    env::set_var("UPSTREAM_URL", "http://from-env");
    env::set_var("STORE_PATH", "/tmp/from-env.json");
    env::set_var("PORT", "7070");

    let result = load_config(file.path());
    clear_overrides();
    let config = result.expect("Config should load");

    assert_eq!(config.upstream.url, "http://from-env");
    assert_eq!(config.store.path, Some(PathBuf::from("/tmp/from-env.json")));
    assert_eq!(config.server.port, 7070);
}

#[test]
#[serial]
fn test_invalid_port_env_is_an_error() {
    clear_overrides();
    let file = config_file("");
    env::set_var("PORT", "not-a-port");

    let result = load_config(file.path());
    clear_overrides();

    assert!(result.is_err());
}

#[test]
#[serial]
fn test_zero_retention_is_rejected() {
    clear_overrides();
    let file = config_file("sync:\n  retention: 0\n");

    let err = load_config(file.path()).unwrap_err();

    assert!(err.to_string().contains("retention"), "got: {err}");
}

#[test]
#[serial]
fn test_malformed_yaml_is_rejected() {
    clear_overrides();
    let file = config_file("sync: [unclosed\n");

    let err = load_config(file.path()).unwrap_err();

    assert!(err.to_string().contains("Failed to parse config YAML"));
}

#[test]
#[serial]
fn test_missing_file_is_rejected() {
    clear_overrides();
    let err = load_config("/definitely/not/here.yaml").unwrap_err();
    assert!(err.to_string().contains("Failed to read config file"));
}
