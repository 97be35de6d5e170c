//! Test for configuration loading
//!
//! This test verifies the priority order of configuration layers:
//! Command line overrides > Environment variables > Configuration file > Default values

use reorder_proxy::config::{
    auto_load, auto_load_with_warnings, ConfigBuilder, ConfigOverrides, ProxyConfig, ENV_PREFIX,
};
use serial_test::serial;
use std::env;
use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

const ENV_VARS: [&str; 4] = [
    "REORDER_PROXY_UPSTREAM_PORT",
    "REORDER_PROXY_WINDOW_SIZE",
    "REORDER_PROXY_SWAP_PATTERN",
    "REORDER_PROXY_LOG_LEVEL",
];

fn clear_env() {
    for var in ENV_VARS {
        env::remove_var(var);
    }
}

fn write_config(dir: &TempDir, content: &str) -> PathBuf {
    let path = dir.path().join("reorder-proxy.json");
    fs::write(&path, content).expect("Failed to write config file");
    path
}

#[test]
#[serial]
fn test_file_values_override_defaults() {
    clear_env();
    let dir = TempDir::new().unwrap();
    let path = write_config(
        &dir,
        r#"{
            "local_port": 16000,
            "upstream_host": "10.0.0.5",
            "window_size": 3,
            "delimiter": "\\r\\n"
        }"#,
    );

    let config = auto_load(Some(&path), ConfigOverrides::default()).unwrap();

    assert_eq!(config.local_port, 16000);
    assert_eq!(config.upstream_host, "10.0.0.5");
    assert_eq!(config.window_size, 3);
    assert_eq!(config.delimiter_bytes(), b"\r\n".to_vec());
    // Untouched fields keep their defaults
    assert_eq!(config.upstream_port, 5222);
    assert_eq!(config.buffer_capacity, ProxyConfig::default().buffer_capacity);
}

#[test]
#[serial]
fn test_priority_order() {
    clear_env();
    let dir = TempDir::new().unwrap();
    let path = write_config(
        &dir,
        r#"{
            "upstream_port": 6000,
            "window_size": 3,
            "log_level": "warn"
        }"#,
    );

    env::set_var("REORDER_PROXY_UPSTREAM_PORT", "6001");
    env::set_var("REORDER_PROXY_WINDOW_SIZE", "4");

    let overrides = ConfigOverrides {
        upstream_port: Some(6002),
        ..ConfigOverrides::default()
    };
    let config = auto_load(Some(&path), overrides);
    clear_env();
    let config = config.unwrap();

    // Command line beats environment
    assert_eq!(config.upstream_port, 6002);
    // Environment beats file
    assert_eq!(config.window_size, 4);
    // File beats defaults
    assert_eq!(config.log_level, "warn");
}

#[test]
#[serial]
fn test_swap_pattern_from_environment() {
    clear_env();
    env::set_var("REORDER_PROXY_SWAP_PATTERN", "2,0,1");

    let config = ConfigBuilder::new().with_env(ENV_PREFIX).build();
    clear_env();
    let config = config.unwrap();

    assert_eq!(config.swap_pattern, Some(vec![2, 0, 1]));
    assert_eq!(config.build_policy().unwrap().name(), "swap-pattern");
}

#[test]
#[serial]
fn test_missing_file_falls_back_to_defaults() {
    clear_env();
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("absent.json");

    let config = auto_load(Some(&path), ConfigOverrides::default()).unwrap();
    assert_eq!(config, ProxyConfig::default());
}

#[test]
#[serial]
fn test_warnings_are_returned_for_later_logging() {
    clear_env();
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, r#"{ "log_level": "verbose", "buffer_capacity": 1 }"#);

    let (config, warnings) =
        auto_load_with_warnings(Some(&path), ConfigOverrides::default()).unwrap();
    assert_eq!(config.log_level, "verbose");
    assert_eq!(warnings.len(), 2);
    assert!(warnings[0].contains("verbose"));
    assert!(warnings[1].contains("never be reordered"));

    let absent = dir.path().join("absent.json");
    let (_, warnings) = auto_load_with_warnings(Some(&absent), ConfigOverrides::default()).unwrap();
    assert_eq!(warnings.len(), 1);
    assert!(warnings[0].contains("absent.json"));
}

#[test]
#[serial]
fn test_invalid_values_are_rejected() {
    clear_env();
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, r#"{ "swap_pattern": [0, 0] }"#);
    assert!(auto_load(Some(&path), ConfigOverrides::default()).is_err());

    let path = write_config(&dir, r#"{ "upstream_port": "not a port" }"#);
    assert!(auto_load(Some(&path), ConfigOverrides::default()).is_err());

    // Validation can be turned off for partial configurations
    let path = write_config(&dir, r#"{ "window_size": 1 }"#);
    let config = ConfigBuilder::new()
        .with_file(&path)
        .without_validation()
        .build()
        .unwrap();
    assert_eq!(config.window_size, 1);
}

#[test]
fn test_per_client_configs() {
    let base = ProxyConfig::default();
    let clients: Vec<ProxyConfig> = (0..3).map(|i| base.for_client(i).unwrap()).collect();

    assert_eq!(
        clients.iter().map(|c| c.local_port).collect::<Vec<_>>(),
        vec![15224, 15225, 15226]
    );
    assert!(clients.iter().all(|c| c.upstream_port == 5222));
}

#[test]
fn test_from_file_round_trip() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("saved.json");

    let mut config = ProxyConfig::new("127.0.0.1", 15300, "127.0.0.1", 5300);
    config.swap_pattern = Some(vec![1, 2, 0]);
    fs::write(&path, serde_json::to_string_pretty(&config).unwrap()).unwrap();

    assert_eq!(ProxyConfig::from_file(&path).unwrap(), config);
}
