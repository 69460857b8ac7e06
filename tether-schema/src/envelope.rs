use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Socket event carrying requests from a peer.
pub const EVENT_INBOUND: &str = "cloudServerMsg";
/// Socket event carrying init and response envelopes to a peer.
pub const EVENT_OUTBOUND: &str = "cloudConnector";
/// Socket event a peer uses to report a problem with this connector.
pub const EVENT_PEER_ERROR: &str = "indeError";

/// One socket event: its name and first argument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportFrame {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Init,
    Response,
}

/// Message sent to a peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sid: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dmid: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub appid: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cbid: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fs: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app: Option<bool>,

    /// Set by the session for peers addressed through a directory user name.
    #[serde(rename = "userName", default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,

    pub data: EnvelopeData,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeData {
    /// Connector name.
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dmlist: Option<Vec<CapabilityEntry>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fslist: Option<Vec<FileSystemCapability>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pluginslist: Option<Vec<CapabilityEntry>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A data model or plugin as announced to peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityEntry {
    pub name: String,
    pub class: String,
    pub key: String,
}

/// A file system as announced to peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileSystemCapability {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissions: Option<Value>,
    pub key: String,
}

impl Envelope {
    pub fn init(data: EnvelopeData) -> Self {
        Self {
            kind: MessageType::Init,
            sid: None,
            dmid: None,
            appid: None,
            cbid: None,
            fs: None,
            plugin: None,
            app: None,
            user_name: None,
            data,
        }
    }

    /// Response envelope echoing the correlation fields of `request`.
    pub fn response_to(request: &InboundMessage, connector_name: &str) -> Self {
        Self {
            kind: MessageType::Response,
            sid: request.sid.clone(),
            dmid: request.dmid.clone(),
            appid: request.appid.clone(),
            cbid: request.cbid.clone(),
            fs: None,
            plugin: None,
            app: None,
            user_name: None,
            data: EnvelopeData {
                name: connector_name.to_string(),
                ..EnvelopeData::default()
            },
        }
    }
}

/// Routing view of a request received from a peer.
///
/// Correlation fields are opaque and echoed back unchanged. Everything that is not a routing
/// field stays in `rest` for the addressed resource.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    #[serde(default)]
    pub sid: Option<Value>,
    #[serde(default)]
    pub dmid: Option<Value>,
    #[serde(default)]
    pub appid: Option<Value>,
    #[serde(default)]
    pub cbid: Option<Value>,
    #[serde(default)]
    pub dm: Option<String>,
    #[serde(default)]
    pub fs: Option<String>,
    #[serde(default)]
    pub plugin: Option<String>,
    #[serde(default)]
    pub app: Option<Value>,
    #[serde(default)]
    pub cmd: Option<String>,
    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

impl InboundMessage {
    /// Whether the message is addressed to the connector itself.
    pub fn targets_app(&self) -> bool {
        match &self.app {
            None | Some(Value::Null) | Some(Value::Bool(false)) => false,
            Some(Value::String(s)) => !s.is_empty(),
            Some(Value::Number(n)) => n.as_f64() != Some(0.0),
            Some(_) => true,
        }
    }
}
