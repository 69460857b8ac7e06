use serde_json::{Value, json};
use std::time::{SystemTime, UNIX_EPOCH};
use tether::config::{BasicConfig, ConfigSource, secrets};
use tether::connector::{self, ConnectorOptions};
use tether::db::DriverRegistry;

fn unique_config_path(prefix: &str) -> std::path::PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time before UNIX_EPOCH")
        .as_nanos();
    std::env::temp_dir().join(format!("tether-{prefix}-{}-{nanos}.json", std::process::id()))
}

#[tokio::test]
async fn stored_configuration_is_resealed_with_placeholders_kept() {
    let path = unique_config_path("persist");
    let document = json!({
        "name": "conn",
        "datamodels": [{
            "name": "pg",
            "class": "postgres",
            "APIKey": "0123456789abcdef0123456789abcdef0123",
            "connectionOptions": {
                "host": "%TETHER_PERSIST_TEST_HOST%",
                "password": "plain-secret"
            }
        }, {
            "name": "pg-env",
            "class": "postgres",
            "connectionOptions": { "password": "%TETHER_PERSIST_TEST_PASSWORD%" }
        }]
    });
    std::fs::write(&path, serde_json::to_string_pretty(&document).unwrap()).unwrap();

    let settings = BasicConfig {
        config_path: path.clone(),
        ..BasicConfig::default()
    };
    let connector = connector::spawn(ConnectorOptions::new(settings, DriverRegistry::new()))
        .await
        .expect("connector spawns");

    connector
        .load_config(ConfigSource::Stored)
        .await
        .expect("stored configuration loads");

    let stored: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    let options = &stored["datamodels"][0]["connectionOptions"];
    assert_eq!(options["host"], "%TETHER_PERSIST_TEST_HOST%");
    let sealed = options["password"].as_str().expect("password kept");
    assert_ne!(sealed, "plain-secret");
    assert_eq!(secrets::decrypt(sealed).unwrap(), "plain-secret");
    assert_eq!(
        stored["datamodels"][1]["connectionOptions"]["password"],
        "%TETHER_PERSIST_TEST_PASSWORD%"
    );

    // A second pass leaves an already sealed password alone.
    connector
        .load_config(ConfigSource::Stored)
        .await
        .expect("reload");
    let again: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(again["datamodels"][0]["connectionOptions"]["password"], sealed);
    assert_eq!(
        again["datamodels"][1]["connectionOptions"]["password"],
        "%TETHER_PERSIST_TEST_PASSWORD%"
    );

    let snapshot = connector.snapshot().await.expect("snapshot");
    assert_eq!(snapshot.datamodels[0].class, "Postgres");

    connector.shutdown().await;
    let _ = std::fs::remove_file(&path);
}

#[tokio::test]
async fn missing_file_is_reported_and_nothing_is_loaded() {
    let settings = BasicConfig {
        config_path: unique_config_path("missing"),
        ..BasicConfig::default()
    };
    let connector = connector::spawn(ConnectorOptions::new(settings, DriverRegistry::new()))
        .await
        .expect("connector spawns");

    let err = connector
        .load_config(ConfigSource::Stored)
        .await
        .expect_err("no file");
    assert_eq!(err.to_string(), "Error reading the configuration");
    assert!(connector.snapshot().await.unwrap().datamodels.is_empty());

    connector.shutdown().await;
}
