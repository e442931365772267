use super::*;
use std::io::Write;
use tempfile::NamedTempFile;

const ENV_KEYS: &[&str] = &[
    "ENGINE_PING_INTERVAL_MS",
    "ENGINE_PING_TIMEOUT_MS",
    "ENGINE_UPGRADE_TIMEOUT_MS",
    "ENGINE_ALLOW_UPGRADES",
    "ENGINE_RPC_TIMEOUT_MS",
];

fn clear_env() {
    for key in ENV_KEYS {
        std::env::remove_var(key);
    }
}

fn write_config(yaml: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(yaml.as_bytes()).unwrap();
    file
}

#[test]
fn test_defaults() {
    let config = EngineConfig::default();
    assert_eq!(config.ping_interval(), Duration::from_secs(25));
    assert_eq!(config.ping_timeout(), Duration::from_secs(60));
    assert_eq!(config.upgrade_timeout(), Duration::from_secs(10));
    assert_eq!(config.transports.len(), 5);
    assert!(config.allow_upgrades);
    assert!(config.rpc_timeout().is_none());
    assert_eq!(config.logging.filter, "info");
}

#[test]
#[serial_test::serial]
fn test_load_partial_yaml_keeps_defaults() {
    clear_env();
    let file = write_config(
        "ping_interval_ms: 1000\ntransports:\n  - polling-xhr\n  - persistent-socket\n",
    );

    let config = EngineConfig::load(file.path()).unwrap();
    assert_eq!(config.ping_interval_ms, 1000);
    assert_eq!(config.ping_timeout_ms, 60_000);
    assert_eq!(
        config.transports,
        vec![TransportKind::PollingXhr, TransportKind::PersistentSocket]
    );
    assert!(!config.is_registered(TransportKind::PollingJsonp));
}

#[test]
#[serial_test::serial]
fn test_load_rejects_unknown_transport() {
    clear_env();
    let file = write_config("transports:\n  - carrier-pigeon\n");
    let err = EngineConfig::load(file.path()).unwrap_err();
    assert!(format!("{:#}", err).contains("Failed to parse config file"));
}

#[test]
fn test_load_missing_file_has_context() {
    let err = EngineConfig::load(Path::new("/nonexistent/engine.yaml")).unwrap_err();
    assert!(err.to_string().contains("Failed to read config file"));
}

#[test]
#[serial_test::serial]
fn test_env_overrides() {
    clear_env();
    std::env::set_var("ENGINE_PING_INTERVAL_MS", "500");
    std::env::set_var("ENGINE_ALLOW_UPGRADES", "false");
    std::env::set_var("ENGINE_RPC_TIMEOUT_MS", "250");
    std::env::set_var("ENGINE_PING_TIMEOUT_MS", "not-a-number");

    let mut config = EngineConfig::default();
    config.apply_env_overrides();
    clear_env();

    assert_eq!(config.ping_interval_ms, 500);
    assert!(!config.allow_upgrades);
    assert_eq!(config.rpc_timeout(), Some(Duration::from_millis(250)));
    assert_eq!(config.ping_timeout_ms, 60_000);
}

#[test]
fn test_policy_document_defaults_to_builtin() {
    let config = EngineConfig::default();
    assert_eq!(&*config.policy_document().unwrap(), DEFAULT_POLICY);
}

#[test]
fn test_policy_document_reads_file() {
    let file = write_config("<cross-domain-policy/>\0");
    let config = EngineConfig {
        policy_file: Some(file.path().to_path_buf()),
        ..EngineConfig::default()
    };
    assert_eq!(&*config.policy_document().unwrap(), b"<cross-domain-policy/>\0");
}
