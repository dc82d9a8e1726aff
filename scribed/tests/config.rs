//! Configuration loading tests.

use std::io::Write as _;

use clap::Parser;

use scribed::{Cli, ScribedConfig};

#[test]
fn defaults_apply_when_the_file_is_missing() {
    let dir = tempfile::tempdir().unwrap();
    let config = ScribedConfig::load(&dir.path().join("missing.toml")).unwrap();
    assert_eq!(config.shutdown_grace_secs, 10);
    assert_eq!(config.engine.sync.chunk_size, 100);
    assert_eq!(config.engine.sync.workers, 8);
    assert!(!config.engine.extended_index);
}

#[test]
fn toml_values_override_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("scribed.toml");
    let mut file = std::fs::File::create(&path).unwrap();
    write!(
        file,
        r#"
shutdown_grace_secs = 30

[engine]
extended_index = true

[engine.sync]
chunk_size = 50
workers = 4

[engine.storage.database]
path = "/var/lib/scribe"
size = {{ gb = 64 }}
"#
    )
    .unwrap();

    let config = ScribedConfig::load(&path).unwrap();
    assert_eq!(config.shutdown_grace_secs, 30);
    assert!(config.engine.extended_index);
    assert_eq!(config.engine.sync.chunk_size, 50);
    assert_eq!(config.engine.sync.workers, 4);
    assert_eq!(
        config.engine.storage.database.path,
        std::path::PathBuf::from("/var/lib/scribe")
    );
    // Untouched sections keep their defaults.
    assert_eq!(config.engine.sync.debounce_ms, 1_009);
}

#[test]
fn invalid_tuning_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("scribed.toml");
    std::fs::write(&path, "[engine.sync]\nworkers = 0\n").unwrap();
    assert!(ScribedConfig::load(&path).is_err());
}

#[test]
fn cli_parses_operational_flags() {
    let cli = Cli::parse_from([
        "scribed",
        "--config",
        "/etc/scribe/scribed.toml",
        "--block-from",
        "1000",
        "--block-until",
        "2000",
    ]);
    assert_eq!(cli.config, std::path::PathBuf::from("/etc/scribe/scribed.toml"));
    assert_eq!(cli.block_from, Some(1000));
    assert_eq!(cli.block_until, Some(2000));
    assert!(!cli.sync && !cli.repair && !cli.fix_utxos);

    let cli = Cli::parse_from(["scribed", "--sync"]);
    assert!(cli.sync);
    assert_eq!(cli.rollback, None);
}
