//! Unit tests for config path resolution and graceful degradation
//!
//! Tests that manipulate MEDLEY_CONFIG are marked with #[serial]
//! so they do not race on the process environment.

use medley_common::config::{load_or_default, resolve_config_path, LoggingConfig, CONFIG_ENV_VAR};
use serde::Deserialize;
use serial_test::serial;
use std::env;
use std::io::Write;
use std::path::PathBuf;
use tempfile::NamedTempFile;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ServiceConfig {
    logging: LoggingConfig,
    label: String,
}

#[test]
#[serial]
fn test_env_var_used_when_no_cli_arg() {
    let test_path = "/tmp/medley-test-env-config.toml";
    env::set_var(CONFIG_ENV_VAR, test_path);

    let resolved = resolve_config_path(None, CONFIG_ENV_VAR, "medley-fed.toml");
    assert_eq!(resolved, Some(PathBuf::from(test_path)));

    env::remove_var(CONFIG_ENV_VAR);
}

#[test]
#[serial]
fn test_cli_arg_overrides_env_var() {
    env::set_var(CONFIG_ENV_VAR, "/tmp/from-env.toml");
    let cli = PathBuf::from("/tmp/from-cli.toml");

    let resolved = resolve_config_path(Some(&cli), CONFIG_ENV_VAR, "medley-fed.toml");
    assert_eq!(resolved, Some(cli));

    env::remove_var(CONFIG_ENV_VAR);
}

#[test]
#[serial]
fn test_blank_env_var_is_ignored() {
    env::set_var(CONFIG_ENV_VAR, "   ");

    let resolved = resolve_config_path(None, CONFIG_ENV_VAR, "medley-test-never-exists.toml");
    assert_ne!(resolved, Some(PathBuf::from("   ")));

    env::remove_var(CONFIG_ENV_VAR);
}

#[test]
fn test_load_existing_file() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, "label = \"edge\"\n[logging]\nlevel = \"debug\"").unwrap();

    let config: ServiceConfig = load_or_default(Some(file.path())).unwrap();
    assert_eq!(config.label, "edge");
    assert_eq!(config.logging.level, "debug");
    assert!(config.logging.ansi, "unspecified fields keep defaults");
}

#[test]
fn test_broken_file_is_an_error() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, "label = [unterminated").unwrap();

    let result: medley_common::Result<ServiceConfig> = load_or_default(Some(file.path()));
    assert!(result.is_err());
}

#[test]
fn test_no_path_uses_defaults() {
    let config: ServiceConfig = load_or_default(None).unwrap();
    assert_eq!(config.logging, LoggingConfig::default());
    assert!(config.label.is_empty());
}
