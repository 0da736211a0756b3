use conduit::logging::layers::file::log_file_path;
use conduit::logging::{ConsoleOutput, LoggingConfig};
use serial_test::serial;
use std::env;
use std::fs;
use tempfile::TempDir;

fn clear_logging_env() {
    env::remove_var("CONDUIT_LOG_DIR");
    env::remove_var("CONDUIT_LOG_CONSOLE");
}

#[test]
#[serial]
fn test_defaults_log_under_workspace() {
    clear_logging_env();
    let temp_dir = TempDir::new().unwrap();
    let config = LoggingConfig::load(Some(temp_dir.path())).unwrap();
    assert_eq!(config.default_level, "info");
    assert!(config.enable_file);
    assert_eq!(config.console_output, ConsoleOutput::Stderr);

    let path = log_file_path(&config, Some(temp_dir.path())).unwrap();
    assert!(path.ends_with(".conduit/logs/conduit.log"));
}

#[test]
#[serial]
fn test_workspace_file_and_env_override() {
    clear_logging_env();
    let temp_dir = TempDir::new().unwrap();
    let config_dir = temp_dir.path().join(".conduit/config");
    fs::create_dir_all(&config_dir).unwrap();
    fs::write(
        config_dir.join("logging.toml"),
        r#"
[logging]
default_level = "debug"
console_output = "none"
json = true
"#,
    )
    .unwrap();

    let absolute = temp_dir.path().join("custom-logs");
    env::set_var("CONDUIT_LOG_DIR", &absolute);
    let config = LoggingConfig::load(Some(temp_dir.path())).unwrap();
    clear_logging_env();

    assert_eq!(config.default_level, "debug");
    assert_eq!(config.console_output, ConsoleOutput::None);
    assert!(config.json);
    let path = log_file_path(&config, Some(temp_dir.path())).unwrap();
    assert_eq!(path, absolute.join("conduit.log"));
}

#[test]
#[serial]
fn test_invalid_level_is_rejected() {
    clear_logging_env();
    let temp_dir = TempDir::new().unwrap();
    let config_dir = temp_dir.path().join(".conduit/config");
    fs::create_dir_all(&config_dir).unwrap();
    fs::write(
        config_dir.join("logging.toml"),
        "[logging]\ndefault_level = \"conduit=loud\"\n",
    )
    .unwrap();

    assert!(LoggingConfig::load(Some(temp_dir.path())).is_err());
}

#[test]
#[serial]
fn test_relative_dir_cannot_escape_workspace() {
    clear_logging_env();
    let temp_dir = TempDir::new().unwrap();
    let workspace = temp_dir.path().join("ws");
    fs::create_dir_all(&workspace).unwrap();
    fs::create_dir_all(temp_dir.path().join("outside")).unwrap();

    let config = LoggingConfig {
        log_dir: Some("../outside".into()),
        ..Default::default()
    };
    assert!(log_file_path(&config, Some(&workspace)).is_err());
}
