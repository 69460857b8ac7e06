//! Socket transport of a peer session.
//!
//! Speaks Socket.IO over a websocket (see [`super::packet`]). A connection counts as attached
//! once the namespace connect is acknowledged. The loop reconnects with exponential backoff
//! until the owning session aborts it.

use backon::BackoffBuilder;
use futures::{SinkExt, StreamExt};
use ractor::ActorRef;
use tether_schema::{EVENT_INBOUND, EVENT_PEER_ERROR, TransportFrame};
use thiserror::Error as ThisError;
use tokio::{net::TcpStream, sync::mpsc, time::Instant};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{self, Message},
};
use tracing::{debug, error, info, warn};
use url::Url;

use super::PeerTransportOptions;
use super::packet::{self, Handshake, Packet, PacketError, PendingBinary};
use super::session::PeerSessionMessage;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, ThisError)]
enum LinkError {
    #[error(transparent)]
    Socket(#[from] tungstenite::Error),

    #[error(transparent)]
    Packet(#[from] PacketError),

    #[error("connection refused by peer: {0}")]
    Refused(String),

    #[error("connection closed during handshake")]
    Closed,
}

fn route_frame(session: &ActorRef<PeerSessionMessage>, url: &Url, frame: TransportFrame) {
    match frame.event.as_str() {
        EVENT_INBOUND => {
            if let Err(e) = ractor::cast!(session, PeerSessionMessage::Inbound(frame.data)) {
                warn!(url = %url, error = %e, "PeerSession gone, inbound message dropped");
            }
        }
        EVENT_PEER_ERROR => {
            let detail = frame
                .data
                .get("msg")
                .map(ToString::to_string)
                .unwrap_or_else(|| frame.data.to_string());
            info!(url = %url, detail = %detail, "IndeError from peer");
        }
        other => debug!(url = %url, event = other, "Ignoring peer event"),
    }
}

/// Upgrades, reads the engine handshake and joins `namespace`.
async fn open(endpoint: &Url, namespace: &str) -> Result<(Socket, Handshake), LinkError> {
    let (mut socket, _response) = connect_async(endpoint.as_str()).await?;
    let mut handshake = None;

    while let Some(message) = socket.next().await {
        let Message::Text(text) = message? else {
            continue;
        };
        match packet::decode(&text)? {
            Packet::Open(open) => {
                handshake = Some(open);
                socket.send(Message::Text(packet::encode_connect(namespace))).await?;
            }
            Packet::Ping => socket.send(Message::Text(packet::PONG.to_string())).await?,
            Packet::Connect { namespace: joined } if joined == namespace => {
                return handshake.map(|h| (socket, h)).ok_or(LinkError::Closed);
            }
            Packet::ConnectError { message, .. } => return Err(LinkError::Refused(message)),
            Packet::Close => return Err(LinkError::Closed),
            _ => {}
        }
    }
    Err(LinkError::Closed)
}

/// Serves one attached connection until it drops.
async fn serve(
    socket: Socket,
    handshake: &Handshake,
    namespace: &str,
    url: &Url,
    session: &ActorRef<PeerSessionMessage>,
    mut outbound: mpsc::UnboundedReceiver<TransportFrame>,
) {
    let (mut sink, mut source) = socket.split();
    let idle_limit = handshake.idle_limit();
    let idle = tokio::time::sleep(idle_limit);
    tokio::pin!(idle);
    let mut pending: Option<PendingBinary> = None;

    loop {
        tokio::select! {
            Some(frame) = outbound.recv() => {
                let text = packet::encode_event(namespace, &frame);
                if let Err(e) = sink.send(Message::Text(text)).await {
                    warn!(url = %url, error = %e, "Send to peer failed");
                    break;
                }
            }
            () = &mut idle => {
                warn!(url = %url, "Ping timeout");
                break;
            }
            incoming = source.next() => {
                idle.as_mut().reset(Instant::now() + idle_limit);
                match incoming {
                    Some(Ok(Message::Text(text))) => match packet::decode(&text) {
                        Ok(Packet::Ping) => {
                            if sink.send(Message::Text(packet::PONG.to_string())).await.is_err() {
                                break;
                            }
                        }
                        Ok(Packet::Event { namespace: ns, frame }) if ns == namespace => {
                            route_frame(session, url, frame);
                        }
                        Ok(Packet::BinaryEvent { namespace: ns, attachments, frame }) if ns == namespace => {
                            if attachments == 0 {
                                route_frame(session, url, frame);
                            } else {
                                pending = Some(PendingBinary::new(frame, attachments));
                            }
                        }
                        Ok(Packet::Disconnect { namespace: ns }) if ns == namespace => break,
                        Ok(Packet::Close) => break,
                        Ok(_) => {}
                        Err(e) => warn!(url = %url, error = %e, "Unreadable packet from peer"),
                    },
                    Some(Ok(Message::Binary(bytes))) => {
                        let completed = pending.as_mut().and_then(|p| p.push(bytes));
                        if let Some(frame) = completed {
                            pending = None;
                            route_frame(session, url, frame);
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = sink.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(url = %url, error = %e, "Peer connection failed");
                        break;
                    }
                }
            }
        }
    }
}

pub(crate) async fn run(
    url: Url,
    options: PeerTransportOptions,
    session: ActorRef<PeerSessionMessage>,
) {
    let endpoint = packet::engine_url(&url);
    let namespace = packet::namespace_of(&url);
    let mut delays = options.backoff().build();

    loop {
        match tokio::time::timeout(options.connect_timeout(), open(&endpoint, &namespace)).await {
            Ok(Ok((socket, handshake))) => {
                delays = options.backoff().build();
                debug!(url = %url, sid = %handshake.sid, "Engine handshake done");
                let (tx, rx) = mpsc::unbounded_channel();
                if ractor::cast!(session, PeerSessionMessage::Attached(tx)).is_err() {
                    return;
                }

                serve(socket, &handshake, &namespace, &url, &session, rx).await;

                if ractor::cast!(session, PeerSessionMessage::Detached).is_err() {
                    return;
                }
            }
            Ok(Err(e)) => error!(url = %url, error = %e, "Connect error"),
            Err(_) => error!(url = %url, "Connect timeout"),
        }

        if !options.reconnection {
            warn!(url = %url, "Reconnection disabled, giving up");
            return;
        }
        let delay = delays.next().unwrap_or_else(|| options.max_delay());
        debug!(url = %url, delay_ms = delay.as_millis() as u64, "Reconnecting");
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    /// Minimal Socket.IO server: handshake, namespace ack, one request, then waits for the reply.
    async fn serve_once(listener: TcpListener) -> Vec<String> {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        ws.send(Message::Text(
            r#"0{"sid":"s1","upgrades":[],"pingInterval":25000,"pingTimeout":20000}"#.into(),
        ))
        .await
        .unwrap();

        let mut seen = Vec::new();
        while let Some(Ok(message)) = ws.next().await {
            let Message::Text(text) = message else { continue };
            seen.push(text.clone());
            if text == "40" {
                ws.send(Message::Text(r#"40{"sid":"n1"}"#.into())).await.unwrap();
                ws.send(Message::Text("2".into())).await.unwrap();
                ws.send(Message::Text(
                    r#"42["cloudServerMsg",{"app":true,"cmd":"ping","cbid":1}]"#.into(),
                ))
                .await
                .unwrap();
            } else if text.starts_with("42") {
                break;
            }
        }
        seen
    }

    #[tokio::test]
    async fn joins_the_namespace_and_routes_events() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(serve_once(listener));

        let endpoint = packet::engine_url(&Url::parse(&format!("http://127.0.0.1:{port}/")).unwrap());
        let (socket, handshake) = open(&endpoint, "/").await.expect("socket joins");
        assert_eq!(handshake.sid, "s1");

        let (mut sink, mut source) = socket.split();
        let mut request = None;
        while let Some(Ok(Message::Text(text))) = source.next().await {
            match packet::decode(&text).unwrap() {
                Packet::Ping => sink.send(Message::Text(packet::PONG.into())).await.unwrap(),
                Packet::Event { frame, .. } => {
                    request = Some(frame);
                    break;
                }
                _ => {}
            }
        }
        let request = request.expect("event routed");
        assert_eq!(request.event, EVENT_INBOUND);
        assert_eq!(request.data["cmd"], "ping");

        let reply = TransportFrame {
            event: tether_schema::EVENT_OUTBOUND.into(),
            data: json!({ "type": "response", "cbid": 1 }),
        };
        sink.send(Message::Text(packet::encode_event("/", &reply)))
            .await
            .unwrap();

        let seen = server.await.unwrap();
        assert_eq!(seen[0], "40");
        assert!(seen.contains(&"3".to_string()));
        assert_eq!(
            seen.last().unwrap(),
            r#"42["cloudConnector",{"type":"response","cbid":1}]"#
        );
    }

    #[tokio::test]
    async fn refused_namespace_is_an_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            ws.send(Message::Text(
                r#"0{"sid":"s1","upgrades":[],"pingInterval":25000,"pingTimeout":20000}"#.into(),
            ))
            .await
            .unwrap();
            let _ = ws.next().await;
            ws.send(Message::Text(r#"44{"message":"Invalid namespace"}"#.into()))
                .await
                .unwrap();
            let _ = ws.next().await;
        });

        let endpoint =
            packet::engine_url(&Url::parse(&format!("http://127.0.0.1:{port}/")).unwrap());
        let err = open(&endpoint, "/").await.err().expect("refused");
        assert!(matches!(err, LinkError::Refused(ref m) if m == "Invalid namespace"));
    }
}
