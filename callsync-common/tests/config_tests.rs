//! Tests for root folder resolution and TOML loading
//!
//! Tests touching process environment are serialized.

use callsync_common::config::{database_path, load_toml_or_default, resolve_root_folder};
use serde::Deserialize;
use serial_test::serial;
use std::io::Write;
use std::path::{Path, PathBuf};

const TEST_ENV: &str = "CALLSYNC_TEST_ROOT_FOLDER";

#[derive(Debug, Default, Deserialize, PartialEq)]
struct Sample {
    #[serde(default)]
    name: String,
    #[serde(default)]
    port: u16,
}

#[test]
#[serial]
fn test_cli_argument_wins() {
    std::env::set_var(TEST_ENV, "/tmp/from-env");
    let resolved = resolve_root_folder(Some(Path::new("/tmp/from-cli")), TEST_ENV, None);
    assert_eq!(resolved, PathBuf::from("/tmp/from-cli"));
    std::env::remove_var(TEST_ENV);
}

#[test]
#[serial]
fn test_env_var_beats_config_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "root_folder = \"/tmp/from-file\"").unwrap();

    std::env::set_var(TEST_ENV, "/tmp/from-env");
    let resolved = resolve_root_folder(None, TEST_ENV, Some(file.path()));
    assert_eq!(resolved, PathBuf::from("/tmp/from-env"));
    std::env::remove_var(TEST_ENV);
}

#[test]
#[serial]
fn test_config_file_root_folder() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "root_folder = \"/tmp/from-file\"").unwrap();

    std::env::remove_var(TEST_ENV);
    let resolved = resolve_root_folder(None, TEST_ENV, Some(file.path()));
    assert_eq!(resolved, PathBuf::from("/tmp/from-file"));
}

#[test]
fn test_missing_toml_yields_default() {
    let loaded: Sample =
        load_toml_or_default(Some(Path::new("/nonexistent/callsync/config.toml"))).unwrap();
    assert_eq!(loaded, Sample::default());

    let loaded: Sample = load_toml_or_default(None).unwrap();
    assert_eq!(loaded, Sample::default());
}

#[test]
fn test_toml_is_parsed() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "name = \"callsync\"\nport = 5800").unwrap();

    let loaded: Sample = load_toml_or_default(Some(file.path())).unwrap();
    assert_eq!(loaded.name, "callsync");
    assert_eq!(loaded.port, 5800);
}

#[test]
fn test_malformed_toml_is_an_error() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "port = \"not a number").unwrap();

    let loaded: callsync_common::Result<Sample> = load_toml_or_default(Some(file.path()));
    assert!(loaded.is_err());
}

#[test]
fn test_database_path_inside_root() {
    assert_eq!(
        database_path(Path::new("/var/lib/callsync")),
        PathBuf::from("/var/lib/callsync/callsync.db")
    );
}
