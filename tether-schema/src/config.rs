//! Shape of the connector configuration document (`config.json`).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectorConfigFile {
    #[serde(default)]
    pub name: String,

    /// Shared secret guarding remote administration. Absent or empty disables it.
    #[serde(default)]
    pub remote_configuration_key: Option<String>,

    #[serde(default)]
    pub remote_servers: Vec<String>,

    /// Directory user names, either bare (`alice`) or pinned to a server
    /// (`https://host/path@alice`).
    #[serde(default)]
    pub remote_user_names: Vec<String>,

    #[serde(default)]
    pub datamodels: Vec<DataModelDescriptor>,

    #[serde(default)]
    pub file_systems: Vec<ProviderDescriptor>,

    #[serde(default)]
    pub plugins: Vec<ProviderDescriptor>,

    /// Transport overrides for peer sessions (`reconnectionDelay`, `reconnectionDelayMax`,
    /// `timeout`, all in milliseconds).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_options: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataModelDescriptor {
    pub name: String,

    /// Backend class, matched case-insensitively.
    pub class: String,

    #[serde(rename = "APIKey", default)]
    pub api_key: String,

    /// Driver-specific options handed to the backend verbatim.
    #[serde(rename = "connectionOptions", default)]
    pub connection_options: Value,

    /// Backend-specific extras such as `maxRows`.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl DataModelDescriptor {
    pub fn extra_u64(&self, key: &str) -> Option<u64> {
        self.extra.get(key).and_then(Value::as_u64)
    }
}

/// File system or plugin entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderDescriptor {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class: Option<String>,

    #[serde(rename = "APIKey", default)]
    pub api_key: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissions: Option<Value>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}
