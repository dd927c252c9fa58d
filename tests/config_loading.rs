//! Integration test: Configuration utilities
//!
//! Tests the bin_common configuration loading functionality.

use realtime_sdk::bin_common::{load_config_from_env, load_options, ConfigType};
use realtime_sdk::realtime_core::protocol::Format;
use std::env;
use std::io::Write;

fn write_config(yaml: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(yaml.as_bytes()).unwrap();
    file
}

#[test]
fn test_client_config_default() {
    env::remove_var("REALTIME_CONFIG_PATH");

    let config_path = load_config_from_env(ConfigType::Client);
    assert_eq!(config_path.to_str().unwrap(), "config/realtime.yaml");
}

#[test]
fn test_custom_config() {
    let custom = ConfigType::Custom("custom/path.yaml".to_string());
    let config_path = load_config_from_env(custom);

    assert_eq!(config_path.to_str().unwrap(), "custom/path.yaml");
}

#[test]
fn test_load_options_from_yaml() {
    let file = write_config(
        "key: app.key:secret\n\
         realtime_host: realtime.internal\n\
         tls: false\n\
         format: json\n\
         disconnected_retry_timeout_ms: 5000\n\
         log_level: debug\n",
    );
    let path = file.path().to_str().unwrap().to_string();

    let options = load_options(ConfigType::Custom(path)).unwrap();
    assert_eq!(options.realtime_host.as_deref(), Some("realtime.internal"));
    assert!(!options.tls);
    assert_eq!(options.format, Format::Json);
    assert_eq!(options.disconnected_retry_timeout_ms, 5_000);
    assert_eq!(options.log_level, "debug");
    // Unset fields keep their defaults
    assert_eq!(options.connection_state_ttl_ms, 120_000);
    assert!(options.queue_messages);
}

#[test]
fn test_client_id_from_environment() {
    let file = write_config("key: app.key:secret\n");
    let path = file.path().to_str().unwrap().to_string();

    env::set_var("REALTIME_CLIENT_ID", "tail-1");
    let options = load_options(ConfigType::Custom(path));
    env::remove_var("REALTIME_CLIENT_ID");

    assert_eq!(options.unwrap().client_id.as_deref(), Some("tail-1"));
}

#[test]
fn test_invalid_options_rejected() {
    let file = write_config("key: app.key:secret\nrealtime_request_timeout_ms: 0\n");
    let path = file.path().to_str().unwrap().to_string();

    let error = load_options(ConfigType::Custom(path)).unwrap_err();
    assert!(format!("{:#}", error).contains("realtime_request_timeout_ms"));
}

#[test]
fn test_missing_file_is_an_error() {
    let result = load_options(ConfigType::Custom("does/not/exist.yaml".to_string()));
    assert!(result.is_err());
}
