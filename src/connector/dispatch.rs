use serde_json::Value;
use std::{sync::Arc, time::Instant};
use tether_schema::{Envelope, InboundMessage};
use tracing::{error, warn};

use super::{ConnectorHandle, admin};
use crate::error::{ErrorCategory, TetherError};
use crate::peer::PeerSessionHandle;
use crate::resources::ResourceProvider;

/// Where a request is addressed. The first present routing field wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Route {
    DataModel(String),
    FileSystem(String),
    Plugin(String),
    Admin,
    Unknown(String),
}

impl Route {
    pub fn of(msg: &InboundMessage) -> Self {
        let named = |field: &Option<String>| field.as_ref().filter(|name| !name.is_empty()).cloned();
        if let Some(name) = named(&msg.dm) {
            Self::DataModel(name)
        } else if let Some(name) = named(&msg.fs) {
            Self::FileSystem(name)
        } else if let Some(name) = named(&msg.plugin) {
            Self::Plugin(name)
        } else if msg.targets_app() {
            Self::Admin
        } else {
            Self::Unknown(msg.cmd.clone().unwrap_or_default())
        }
    }
}

pub(crate) enum Target {
    Provider(Arc<dyn ResourceProvider>),
    Admin(admin::AdminContext),
}

/// Answer of the connector actor to a routing question.
pub(crate) struct Resolution {
    /// Connector name at resolution time.
    pub name: String,
    pub target: Result<Target, TetherError>,
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Adds the connector round trip (`cc`) to results that carry provider timing.
fn merge_round_trip(result: &mut Value, started: Instant) {
    if let Some(times) = result.get_mut("times").and_then(Value::as_object_mut) {
        times.insert("cc".to_string(), Value::from(elapsed_ms(started)));
    }
}

/// Runs one inbound request and builds its response. Never fails: errors end up in
/// `data.error`.
pub(crate) async fn respond(
    connector: &ConnectorHandle,
    session: &PeerSessionHandle,
    msg: Value,
) -> Envelope {
    let started = Instant::now();
    let inbound: InboundMessage = serde_json::from_value(msg.clone()).unwrap_or_default();
    let route = Route::of(&inbound);
    let cmd = inbound.cmd.clone().unwrap_or_default();

    let (name, target) = match connector.resolve(route.clone()).await {
        Ok(resolution) => (resolution.name, resolution.target),
        Err(e) => (String::new(), Err(e)),
    };

    let mut envelope = Envelope::response_to(&inbound, &name);
    match route {
        Route::FileSystem(_) => envelope.fs = Some(true),
        Route::Plugin(_) => envelope.plugin = Some(true),
        Route::Admin => envelope.app = Some(true),
        Route::DataModel(_) | Route::Unknown(_) => {}
    }

    let outcome = match target {
        Ok(Target::Provider(provider)) => provider.on_message(session, &msg).await,
        Ok(Target::Admin(ctx)) => admin::handle(connector, &ctx, &msg).await,
        Err(e) => Err(e),
    };

    match outcome {
        Ok(Some(mut result)) => {
            merge_round_trip(&mut result, started);
            envelope.data.result = Some(result);
        }
        Ok(None) => {}
        Err(e) => {
            match e.category() {
                ErrorCategory::Configuration | ErrorCategory::Authorization => {
                    error!(cmd = %cmd, category = e.category().as_str(), error = %e, "Error executing command")
                }
                _ => warn!(cmd = %cmd, category = e.category().as_str(), error = %e, "Error executing command"),
            }
            envelope.data.error = Some(e.to_string());
        }
    }
    envelope
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn route(value: Value) -> Route {
        Route::of(&serde_json::from_value(value).unwrap())
    }

    #[test]
    fn first_routing_field_wins() {
        assert_eq!(
            route(json!({ "dm": "db", "fs": "docs", "app": true })),
            Route::DataModel("db".into())
        );
        assert_eq!(route(json!({ "fs": "docs", "plugin": "p" })), Route::FileSystem("docs".into()));
        assert_eq!(route(json!({ "plugin": "p", "app": 1 })), Route::Plugin("p".into()));
        assert_eq!(route(json!({ "app": true, "cmd": "ping" })), Route::Admin);
        assert_eq!(route(json!({ "cmd": "dance" })), Route::Unknown("dance".into()));
        assert_eq!(route(json!({ "dm": "", "cmd": "x" })), Route::Unknown("x".into()));
    }

    #[test]
    fn round_trip_only_joins_existing_timing() {
        let started = Instant::now();
        let mut timed = json!({ "cols": [], "times": { "qry": 3 } });
        merge_round_trip(&mut timed, started);
        assert!(timed["times"]["cc"].is_u64());
        assert_eq!(timed["times"]["qry"], 3);

        let mut plain = json!({ "cols": [] });
        merge_round_trip(&mut plain, started);
        assert!(plain.get("times").is_none());
    }
}
