use ractor::{Actor, ActorProcessingErr, ActorRef};
use serde_json::Value;
use tether_schema::{EVENT_OUTBOUND, Envelope, TransportFrame};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info, warn};
use url::Url;

use super::{LoopbackFrame, PeerLink, PeerTransportOptions, SessionId, transport};
use crate::connector::ConnectorHandle;
use crate::error::TetherError;
use crate::utils::logging::{redacted, with_pretty_json_debug};

#[derive(Debug)]
pub(crate) enum PeerSessionMessage {
    /// Send an envelope to the peer.
    Send(Envelope),

    /// The transport connected; frames for the peer go to this writer.
    Attached(mpsc::UnboundedSender<TransportFrame>),

    /// The transport lost its connection. It reconnects on its own.
    Detached,

    /// A request arrived from the peer.
    Inbound(Value),
}

/// Cheap handle to a running peer session.
#[derive(Clone)]
pub struct PeerSessionHandle {
    id: SessionId,
    url: Url,
    user_name: Option<String>,
    actor: ActorRef<PeerSessionMessage>,
}

impl std::fmt::Debug for PeerSessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerSessionHandle")
            .field("id", &self.id)
            .field("url", &self.url.as_str())
            .field("user_name", &self.user_name)
            .finish()
    }
}

impl PeerSessionHandle {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Directory user this session serves, if any.
    pub fn user_name(&self) -> Option<&str> {
        self.user_name.as_deref()
    }

    /// Queues an envelope for the peer. Envelopes sent while disconnected are dropped.
    pub fn send_message(&self, envelope: Envelope) -> Result<(), TetherError> {
        ractor::cast!(self.actor, PeerSessionMessage::Send(envelope))
            .map_err(|e| TetherError::RactorError(format!("PeerSession Send failed: {e}")))
    }

    /// Hands a request to the session as if the peer had sent it. Loopback links use this as
    /// their inbound path.
    pub fn deliver(&self, data: Value) -> Result<(), TetherError> {
        ractor::cast!(self.actor, PeerSessionMessage::Inbound(data))
            .map_err(|e| TetherError::RactorError(format!("PeerSession Inbound failed: {e}")))
    }

    /// Closes the session and waits until its cleanup ran.
    pub async fn disconnect(&self) {
        if let Err(e) = self.actor.stop_and_wait(None, None).await {
            debug!(session = %self.id, error = %e, "PeerSession already stopped");
        }
    }
}

pub(crate) struct PeerSessionArgs {
    pub id: SessionId,
    pub url: Url,
    pub user_name: Option<String>,
    pub options: PeerTransportOptions,
    pub link: PeerLink,
    pub connector: ConnectorHandle,
}

enum Outbox {
    Socket(mpsc::UnboundedSender<TransportFrame>),
    Loopback(mpsc::UnboundedSender<LoopbackFrame>),
}

struct PeerSessionState {
    handle: PeerSessionHandle,
    connector: ConnectorHandle,
    outbox: Option<Outbox>,
    transport: Option<JoinHandle<()>>,
}

impl PeerSessionState {
    fn mark_connected(&mut self, outbox: Outbox) {
        let reconnect = self.outbox.replace(outbox).is_some();
        if reconnect {
            // The writer of a dead connection was replaced without a Detached in between.
            self.connector.peer_disconnected(self.handle.id);
        }
        self.connector.peer_connected(self.handle.clone());
    }

    fn mark_disconnected(&mut self) {
        if self.outbox.take().is_some() {
            self.connector.peer_disconnected(self.handle.id);
        }
    }
}

struct PeerSession;

#[ractor::async_trait]
impl Actor for PeerSession {
    type Msg = PeerSessionMessage;
    type State = PeerSessionState;
    type Arguments = PeerSessionArgs;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        let handle = PeerSessionHandle {
            id: args.id,
            url: args.url.clone(),
            user_name: args.user_name,
            actor: myself.clone(),
        };
        let mut state = PeerSessionState {
            handle,
            connector: args.connector,
            outbox: None,
            transport: None,
        };

        match args.link {
            PeerLink::WebSocket => {
                info!(url = %args.url, "Try to connect");
                state.transport = Some(tokio::spawn(transport::run(
                    args.url,
                    args.options,
                    myself,
                )));
            }
            PeerLink::Loopback(tx) => state.mark_connected(Outbox::Loopback(tx)),
        }
        Ok(state)
    }

    async fn handle(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            PeerSessionMessage::Send(mut envelope) => {
                if let Some(user_name) = &state.handle.user_name {
                    envelope.user_name = Some(user_name.clone());
                }
                with_pretty_json_debug(&envelope, |json| {
                    debug!(url = %state.handle.url, envelope = %json, "Outbound message");
                });
                match &state.outbox {
                    Some(Outbox::Socket(tx)) => {
                        let frame = TransportFrame {
                            event: EVENT_OUTBOUND.to_string(),
                            data: serde_json::to_value(&envelope)?,
                        };
                        if tx.send(frame).is_err() {
                            warn!(url = %state.handle.url, "Peer writer gone, message dropped");
                        }
                    }
                    Some(Outbox::Loopback(tx)) => {
                        let frame = LoopbackFrame {
                            session: state.handle.id,
                            envelope,
                        };
                        if tx.send(frame).is_err() {
                            warn!(url = %state.handle.url, "Loopback receiver gone, message dropped");
                        }
                    }
                    None => {
                        debug!(url = %state.handle.url, "Not connected, message dropped");
                    }
                }
            }

            PeerSessionMessage::Attached(writer) => {
                info!(url = %state.handle.url, "Connected");
                state.mark_connected(Outbox::Socket(writer));
            }

            PeerSessionMessage::Detached => {
                info!(url = %state.handle.url, "Disconnected");
                state.mark_disconnected();
            }

            PeerSessionMessage::Inbound(data) => {
                info!(url = %state.handle.url, message = %redacted(&data), "Server onMessage");
                let connector = state.connector.clone();
                let handle = state.handle.clone();
                tokio::spawn(async move {
                    connector.on_peer_message(&handle, data).await;
                });
            }
        }
        Ok(())
    }

    async fn post_stop(
        &self,
        _myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        if let Some(transport) = state.transport.take() {
            transport.abort();
        }
        state.mark_disconnected();
        info!(url = %state.handle.url, "PeerSession stopped");
        Ok(())
    }
}

/// Starts a session towards `url`.
pub(crate) async fn spawn_session(args: PeerSessionArgs) -> Result<PeerSessionHandle, TetherError> {
    let id = args.id;
    let url = args.url.clone();
    let user_name = args.user_name.clone();
    let (actor, _join) = Actor::spawn(None, PeerSession, args)
        .await
        .map_err(|e| TetherError::RactorError(format!("PeerSession spawn failed: {e}")))?;
    Ok(PeerSessionHandle {
        id,
        url,
        user_name,
        actor,
    })
}
