//! Configuration Loading Tests

use giles::config::{Config, EngineKind};
use giles::error::GilesError;
use std::path::Path;

#[test]
fn test_load_full_file() {
    let path = std::env::temp_dir().join(format!("giles-config-{}.toml", std::process::id()));
    std::fs::write(
        &path,
        r#"
        [archiver]
        engine = "memory"
        log_level = "debug"
        coalesce_max = 1024

        [mongo]
        snapshot = "/var/lib/giles/metadata.bin"

        [btrdb]
        address = "10.0.0.2:4410"

        [bosswave]
        enabled = true
        query_topic = "site/query"

        [http]
        port = 9000

        [tcpjson]
        enabled = true

        [msgpackudp]
        enabled = true

        [websocket]
        enabled = true

        [profile]
        enabled = true
        interval_secs = 10
        "#,
    )
    .unwrap();

    let config = Config::load(&path).unwrap();
    std::fs::remove_file(&path).unwrap();

    assert_eq!(config.archiver.engine, EngineKind::Memory);
    assert_eq!(config.archiver.options().coalescer.max, 1024);
    assert_eq!(config.mongo.snapshot.as_deref(), Some(Path::new("/var/lib/giles/metadata.bin")));
    assert_eq!(config.btrdb.address, "10.0.0.2:4410");
    assert!(config.bosswave.enabled);
    assert_eq!(config.bosswave.query_topic, "site/query");
    assert_eq!(config.bosswave.ingest_topic, "giles/ingest");
    assert_eq!(config.http.port, 9000);
    assert!(config.tcpjson.enabled && config.msgpackudp.enabled && config.websocket.enabled);
    assert_eq!(config.profile.interval().as_secs(), 10);
}

#[test]
fn test_missing_file_is_a_config_error() {
    let err = Config::load(Path::new("/nonexistent/giles.toml")).unwrap_err();
    assert!(matches!(err, GilesError::Config(_)));
}
