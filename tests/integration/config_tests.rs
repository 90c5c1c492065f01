use clap::Parser;
use figment::providers::Serialized;
use statusrelay::cli::{Cli, Commands};
use statusrelay::config::{Config, ConfigError};
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;
use tempfile::tempdir;

// Tests reading the environment layer must not overlap with tests setting it.
static ENV_MUTEX: Mutex<()> = Mutex::new(());

fn env_guard() -> std::sync::MutexGuard<'static, ()> {
    ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner())
}

#[test]
fn test_config_load_defaults() {
    let figment = figment::Figment::from(Serialized::defaults(Config::default()));
    let config: Config = figment.extract().unwrap();

    assert_eq!(config.watcher.input_directory, PathBuf::from("./input"));
    assert_eq!(config.watcher.pattern, "*.xml");
    assert_eq!(config.watcher.interval_ms, 1000);
    assert!(!config.watcher.use_file_hash);
    assert_eq!(config.broker.host, "localhost");
    assert_eq!(config.broker.queue, "default-queue");
    assert_eq!(config.store.database_path, PathBuf::from("instrument.db"));
}

#[test]
fn test_config_load_from_toml() {
    let _env = env_guard();
    let temp_dir = tempdir().unwrap();
    let config_path = temp_dir.path().join("config.toml");

    let toml_content = r#"
[watcher]
input_directory = "/srv/snapshots"
use_file_hash = true
workers = 2

[broker]
host = "broker.lab"
routing_key = "line-7"
max_deliveries = 0

[store]
database_path = "/var/lib/statusrelay/modules.db"
"#;
    fs::write(&config_path, toml_content).unwrap();

    let config = Config::try_load_from_path(Some(&config_path)).unwrap();

    assert_eq!(config.watcher.input_directory, PathBuf::from("/srv/snapshots"));
    assert!(config.watcher.use_file_hash);
    assert_eq!(config.watcher.workers, 2);
    // Unset keys keep their defaults.
    assert_eq!(config.watcher.interval_ms, 1000);
    assert_eq!(config.broker.host, "broker.lab");
    assert_eq!(config.broker.port, 1883);
    assert_eq!(config.mqtt_settings().topic(), "instruments/line-7");
    assert_eq!(config.redelivery_policy().max_deliveries, 0);
    assert_eq!(
        config.store.database_path,
        PathBuf::from("/var/lib/statusrelay/modules.db")
    );
}

#[test]
fn test_env_overrides_file() {
    let _env = env_guard();
    let temp_dir = tempdir().unwrap();
    let config_path = temp_dir.path().join("config.toml");
    fs::write(&config_path, "[broker]\nhost = \"from-file\"\nport = 1884\n").unwrap();

    std::env::set_var("STATUSRELAY_BROKER__HOST", "from-env");
    std::env::set_var("STATUSRELAY_WATCHER__INTERVAL_MS", "250");
    let result = Config::try_load_from_path(Some(&config_path));
    std::env::remove_var("STATUSRELAY_BROKER__HOST");
    std::env::remove_var("STATUSRELAY_WATCHER__INTERVAL_MS");

    let config = result.unwrap();
    assert_eq!(config.broker.host, "from-env");
    assert_eq!(config.broker.port, 1884);
    assert_eq!(config.poller_config().interval, Duration::from_millis(250));
}

#[test]
fn test_cli_overrides_all_layers() {
    let _env = env_guard();
    let temp_dir = tempdir().unwrap();
    let config_path = temp_dir.path().join("config.toml");
    fs::write(
        &config_path,
        "[watcher]\ninterval_ms = 5000\nuse_file_hash = true\n[broker]\nport = 1884\n",
    )
    .unwrap();

    let cli = Cli::parse_from([
        "statusrelay",
        "watch",
        "--interval-ms",
        "100",
        "--no-hash",
        "--broker-port",
        "2883",
    ]);
    let mut config = Config::try_load_from_path(Some(&config_path)).unwrap();
    match cli.command {
        Commands::Watch(args) => config.merge_watch_args(&args),
        _ => panic!("Expected watch command"),
    }

    assert_eq!(config.watcher.interval_ms, 100);
    assert!(!config.watcher.use_file_hash);
    assert_eq!(config.broker.port, 2883);
    config.validate().unwrap();
}

#[test]
fn test_invalid_toml_is_reported_or_ignored() {
    let _env = env_guard();
    let temp_dir = tempdir().unwrap();
    let config_path = temp_dir.path().join("config.toml");
    fs::write(&config_path, "[watcher\ninterval_ms = \"soon\"").unwrap();

    assert!(matches!(
        Config::try_load_from_path(Some(&config_path)),
        Err(ConfigError::Load(_))
    ));

    let config = Config::load_from_path(Some(&config_path));
    assert_eq!(config.watcher.interval_ms, 1000);
}

#[test]
fn test_missing_file_uses_defaults() {
    let _env = env_guard();
    let temp_dir = tempdir().unwrap();
    let config = Config::try_load_from_path(Some(&temp_dir.path().join("absent.toml"))).unwrap();
    assert_eq!(config.broker.exchange, "instruments");
}

#[test]
fn test_save_then_load() {
    let _env = env_guard();
    let temp_dir = tempdir().unwrap();
    let config_path = temp_dir.path().join("nested").join("config.toml");

    let mut config = Config::default();
    config.broker.host = "broker.lab".to_string();
    config.broker.username = Some("relay".to_string());
    config.broker.password = Some("secret".to_string());
    config.watcher.pattern = "*.snapshot".to_string();
    config.save(&config_path).unwrap();

    let loaded = Config::try_load_from_path(Some(&config_path)).unwrap();
    assert_eq!(loaded.broker.host, "broker.lab");
    assert_eq!(loaded.watcher.pattern, "*.snapshot");
    assert_eq!(
        loaded.mqtt_settings().credentials,
        Some(("relay".to_string(), "secret".to_string()))
    );
}
