use serde_json::{Value, json};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tether::config::{BasicConfig, ConfigSource};
use tether::connector::{self, ConnectorOptions};
use tether::db::DriverRegistry;
use tether::peer::{LoopbackFrame, PeerLink, PeerSessionHandle};
use tether::ConnectorHandle;
use tether_schema::{Envelope, MessageType};
use tokio::sync::mpsc;

fn unique_path(prefix: &str, ext: &str) -> std::path::PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time before UNIX_EPOCH")
        .as_nanos();
    std::env::temp_dir().join(format!("tether-{prefix}-{}-{nanos}.{ext}", std::process::id()))
}

async fn spawn_loopback(prefix: &str) -> (ConnectorHandle, mpsc::UnboundedReceiver<LoopbackFrame>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let settings = BasicConfig {
        config_path: unique_path(prefix, "json"),
        ..BasicConfig::default()
    };
    let handle = connector::spawn(
        ConnectorOptions::new(settings, DriverRegistry::new()).with_link(PeerLink::Loopback(tx)),
    )
    .await
    .expect("connector spawns");
    (handle, rx)
}

async fn next_envelope(rx: &mut mpsc::UnboundedReceiver<LoopbackFrame>) -> Envelope {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("peer frame within 5s")
        .expect("loopback channel open")
        .envelope
}

async fn request(
    session: &PeerSessionHandle,
    rx: &mut mpsc::UnboundedReceiver<LoopbackFrame>,
    msg: Value,
) -> Envelope {
    session.deliver(msg).expect("session alive");
    next_envelope(rx).await
}

#[tokio::test]
async fn sqlite_open_execute_close_over_a_peer_session() {
    let (connector, mut rx) = spawn_loopback("e2e").await;
    let db_path = unique_path("e2e-db", "sqlite");

    connector
        .load_config(ConfigSource::Inline(json!({
            "name": "conn",
            "remoteServers": ["http://ide.test/"],
            "datamodels": [{
                "name": "db",
                "class": "sqlite",
                "APIKey": "0123456789abcdef0123456789abcdef0123",
                "connectionOptions": { "filename": db_path.display().to_string() }
            }]
        })))
        .await
        .expect("configuration loads");

    let init = next_envelope(&mut rx).await;
    assert_eq!(init.kind, MessageType::Init);
    assert_eq!(init.data.name, "conn");
    let dmlist = init.data.dmlist.expect("dmlist");
    assert_eq!(dmlist.len(), 1);
    assert_eq!(dmlist[0].key, "0123456789abcdef0123456789abcdef0123");

    let snapshot = connector.snapshot().await.expect("snapshot");
    assert!(snapshot.peers[0].connected);
    let session = snapshot.peers[0].session.clone();

    let opened = request(
        &session,
        &mut rx,
        json!({ "sid": "s1", "dmid": "d1", "cbid": 1, "dm": "db", "cmd": "open", "cid": "c1" }),
    )
    .await;
    assert_eq!(opened.kind, MessageType::Response);
    assert_eq!(opened.sid, Some(json!("s1")));
    assert_eq!(opened.dmid, Some(json!("d1")));
    assert_eq!(opened.cbid, Some(json!(1)));
    assert_eq!(opened.data.error, None);
    assert_eq!(opened.data.result, None);

    let executed = request(
        &session,
        &mut rx,
        json!({ "cbid": 2, "dm": "db", "cmd": "execute", "cid": "c1", "sql": "SELECT 1 AS x" }),
    )
    .await;
    assert_eq!(executed.data.error, None);
    let result = executed.data.result.expect("result set");
    assert_eq!(result["cols"], json!(["x"]));
    assert_eq!(result["rows"], json!([[1]]));
    assert!(result["times"]["qry"].is_u64());
    assert!(result["times"]["cc"].is_u64());

    let closed = request(
        &session,
        &mut rx,
        json!({ "cbid": 3, "dm": "db", "cmd": "close", "cid": "c1" }),
    )
    .await;
    assert_eq!(closed.data.error, None);

    let after_close = request(
        &session,
        &mut rx,
        json!({ "cbid": 4, "dm": "db", "cmd": "execute", "cid": "c1", "sql": "SELECT 1" }),
    )
    .await;
    assert_eq!(after_close.data.error.as_deref(), Some("Connection closed"));

    connector.shutdown().await;
    let _ = tokio::fs::remove_file(&db_path).await;
}

#[tokio::test]
async fn disconnect_releases_only_that_sessions_connections() {
    let (connector, mut rx) = spawn_loopback("cascade").await;
    let db_path = unique_path("cascade-db", "sqlite");
    let config = |servers: Value| {
        json!({
            "name": "conn",
            "remoteServers": servers,
            "datamodels": [{
                "name": "db",
                "class": "SQLite",
                "connectionOptions": { "filename": db_path.display().to_string() }
            }]
        })
    };

    connector
        .load_config(ConfigSource::Inline(config(json!([
            "http://a.test/",
            "http://b.test/"
        ]))))
        .await
        .expect("configuration loads");
    next_envelope(&mut rx).await;
    next_envelope(&mut rx).await;

    let snapshot = connector.snapshot().await.expect("snapshot");
    let session_a = snapshot.peers[0].session.clone();
    let session_b = snapshot.peers[1].session.clone();
    assert_eq!(session_a.url().as_str(), "http://a.test/");

    for (session, cid) in [(&session_a, "ca"), (&session_b, "cb")] {
        let opened = request(
            session,
            &mut rx,
            json!({ "dm": "db", "cmd": "open", "cid": cid }),
        )
        .await;
        assert_eq!(opened.data.error, None);
    }

    // Dropping server A closes its session.
    connector
        .load_config(ConfigSource::Inline(config(json!(["http://b.test/"]))))
        .await
        .expect("reload");

    let mut open = Vec::new();
    for _ in 0..50 {
        open = connector.snapshot().await.expect("snapshot").datamodels[0]
            .open_cids
            .clone();
        if open.len() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(open, vec!["cb".to_string()]);

    let snapshot = connector.snapshot().await.expect("snapshot");
    assert_eq!(snapshot.peers.len(), 1);
    assert_eq!(snapshot.peers[0].session.id(), session_b.id());

    connector.shutdown().await;
    let _ = tokio::fs::remove_file(&db_path).await;
}

#[tokio::test]
async fn transaction_state_follows_begin_and_rollback() {
    let (connector, mut rx) = spawn_loopback("txn").await;
    let db_path = unique_path("txn-db", "sqlite");
    connector
        .load_config(ConfigSource::Inline(json!({
            "name": "conn",
            "remoteServers": ["http://ide.test/"],
            "datamodels": [{
                "name": "db",
                "class": "sqlite",
                "connectionOptions": { "filename": db_path.display().to_string() }
            }]
        })))
        .await
        .expect("configuration loads");
    next_envelope(&mut rx).await;
    let session = connector.snapshot().await.expect("snapshot").peers[0]
        .session
        .clone();

    let steps = [
        json!({ "dm": "db", "cmd": "open", "cid": 7 }),
        json!({ "dm": "db", "cmd": "execute", "cid": 7, "sql": "CREATE TABLE t (v TEXT)" }),
        json!({ "dm": "db", "cmd": "begin", "cid": 7 }),
        json!({ "dm": "db", "cmd": "execute", "cid": 7, "sql": "INSERT INTO t (v) VALUES (?)", "pars": ["a"] }),
        json!({ "dm": "db", "cmd": "rollback", "cid": 7 }),
    ];
    for step in steps {
        let reply = request(&session, &mut rx, step.clone()).await;
        assert_eq!(reply.data.error, None, "step {step} failed");
    }

    let counted = request(
        &session,
        &mut rx,
        json!({ "dm": "db", "cmd": "execute", "cid": 7, "sql": "SELECT COUNT(*) AS n FROM t" }),
    )
    .await;
    assert_eq!(counted.data.result.expect("result")["rows"], json!([[0]]));

    let ping = request(&session, &mut rx, json!({ "dm": "db", "cmd": "ping" })).await;
    assert_eq!(ping.data.error, None);
    assert_eq!(ping.data.result, None);

    connector.shutdown().await;
    let _ = tokio::fs::remove_file(&db_path).await;
}
