use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tether::ConnectorHandle;
use tether::config::{BasicConfig, ConfigSource};
use tether::connector::{self, ConnectorOptions};
use tether::db::DriverRegistry;
use tether::peer::{LoopbackFrame, PeerLink, PeerSessionHandle};
use tether_schema::Envelope;
use tokio::sync::mpsc;

fn unique_dir(prefix: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time before UNIX_EPOCH")
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("tether-{prefix}-{}-{nanos}", std::process::id()));
    std::fs::create_dir_all(&dir).expect("create scratch dir");
    dir
}

struct Harness {
    connector: ConnectorHandle,
    session: PeerSessionHandle,
    _rx: mpsc::UnboundedReceiver<LoopbackFrame>,
    dir: PathBuf,
}

impl Harness {
    async fn start(prefix: &str, key: Option<&str>) -> Self {
        let dir = unique_dir(prefix);
        std::fs::write(dir.join("restart.sh"), "#!/bin/bash\ntouch restarted\n")
            .expect("write restart script");

        let (tx, mut rx) = mpsc::unbounded_channel();
        let settings = BasicConfig {
            config_path: dir.join("config.json"),
            install_dir: dir.clone(),
            restart_script: PathBuf::from("restart.sh"),
            ..BasicConfig::default()
        };
        let connector = connector::spawn(
            ConnectorOptions::new(settings, DriverRegistry::new())
                .with_link(PeerLink::Loopback(tx)),
        )
        .await
        .expect("connector spawns");

        let mut document = json!({ "name": "conn", "remoteServers": ["http://ide.test/"] });
        if let Some(key) = key {
            document["remoteConfigurationKey"] = json!(key);
        }
        connector
            .load_config(ConfigSource::Inline(document))
            .await
            .expect("configuration loads");
        rx.recv().await.expect("init");
        let session = connector.snapshot().await.expect("snapshot").peers[0]
            .session
            .clone();

        Self {
            connector,
            session,
            _rx: rx,
            dir,
        }
    }

    async fn admin(&self, cmd: &str, args: Value) -> Envelope {
        self.connector
            .handle_peer_message(
                &self.session,
                json!({ "app": true, "cmd": cmd, "args": args, "cbid": 1 }),
            )
            .await
    }

    async fn stop(self) {
        self.connector.shutdown().await;
        let _ = std::fs::remove_dir_all(&self.dir);
    }
}

async fn appears(path: &Path) -> bool {
    for _ in 0..50 {
        if path.exists() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test]
async fn ping_needs_no_key() {
    let harness = Harness::start("admin-ping", None).await;
    let reply = harness.admin("ping", json!([])).await;
    assert_eq!(reply.app, Some(true));
    assert_eq!(reply.data.error, None);
    assert_eq!(reply.data.result, None);
    harness.stop().await;
}

#[tokio::test]
async fn guarded_commands_are_refused_without_a_configured_key() {
    let harness = Harness::start("admin-off", None).await;
    let reply = harness.admin("restart", json!([{ "key": "" }])).await;
    let error = reply.data.error.expect("refused");
    assert!(error.starts_with("Restart is not allowed."));

    let reply = harness
        .admin("changeConfig", json!([{ "name": "other" }, { "key": "x" }]))
        .await;
    assert!(reply.data.error.expect("refused").starts_with("Change of config is not allowed."));
    harness.stop().await;
}

#[cfg(unix)]
#[tokio::test]
async fn restart_with_a_wrong_key_spawns_nothing() {
    let harness = Harness::start("admin-wrongkey", Some("the-key")).await;
    let marker = harness.dir.join("restarted");

    let reply = harness.admin("restart", json!([{ "key": "not-the-key" }])).await;
    assert_eq!(reply.data.error.as_deref(), Some("Key for remote configuration is wrong"));
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!marker.exists());

    let reply = harness.admin("restart", json!([{ "key": "the-key" }])).await;
    assert_eq!(reply.data.error, None);
    assert!(appears(&marker).await, "restart script did not run");
    harness.stop().await;
}

#[tokio::test]
async fn change_config_applies_the_pushed_document() {
    let harness = Harness::start("admin-config", Some("the-key")).await;

    let pushed = json!({
        "name": "renamed",
        "remoteConfigurationKey": "the-key",
        "remoteServers": ["http://ide.test/"]
    });
    let reply = harness
        .admin("changeConfig", json!([pushed, { "key": "the-key" }]))
        .await;
    assert_eq!(reply.data.error, None);
    // The response is built before the reload with the old name.
    assert_eq!(reply.data.name, "conn");

    let snapshot = harness.connector.snapshot().await.expect("snapshot");
    assert_eq!(snapshot.name, "renamed");
    assert_eq!(snapshot.peers[0].session.id(), harness.session.id());

    let stored: Value = serde_json::from_str(
        &std::fs::read_to_string(harness.dir.join("config.json")).expect("config persisted"),
    )
    .expect("persisted json");
    assert_eq!(stored["name"], "renamed");

    let reply = harness.admin("reboot", json!([])).await;
    assert_eq!(reply.data.error.as_deref(), Some("Command 'reboot' unknown"));
    harness.stop().await;
}
