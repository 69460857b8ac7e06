//! The reloadable connector configuration (`config.json`).
//!
//! Loading substitutes `%NAME%` environment placeholders in every string and decrypts
//! `password` values. Persisting starts again from the raw text, so placeholders survive and
//! only plaintext passwords change (they get encrypted).

use regex::{Captures, Regex};
use serde_json::Value;
use std::{collections::HashSet, path::Path, str::FromStr, sync::LazyLock};
use tether_schema::{ConnectorConfigFile, DataModelDescriptor, ProviderDescriptor};
use tracing::warn;
use url::Url;

use super::{BasicConfig, secrets};
use crate::db::BackendKind;
use crate::error::TetherError;
use crate::peer::PeerTransportOptions;

pub const ZERO_KEY: &str = "00000000-0000-0000-0000-000000000000";
const STRONG_KEY_LEN: usize = 36;

static ENV_PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"%([^%]+)%")
        .unwrap_or_else(|err| panic!("invalid env placeholder pattern: {err}"))
});

/// Where a reload takes its document from.
#[derive(Debug, Clone)]
pub enum ConfigSource {
    /// The file at `basic.config_path`.
    Stored,
    /// A document pushed by a peer (`changeConfig`).
    Inline(Value),
}

impl ConfigSource {
    pub async fn read(&self, settings: &BasicConfig) -> Result<String, TetherError> {
        match self {
            Self::Stored => tokio::fs::read_to_string(&settings.config_path)
                .await
                .map_err(|_| TetherError::Config("Error reading the configuration".to_string())),
            Self::Inline(value) => Ok(serde_json::to_string(value)?),
        }
    }
}

/// Where a peer session connects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerTarget {
    /// Application server, addressed by URL.
    Server(Url),
    /// Directory user; without a pinned server the URL comes from the directory service.
    User {
        server: Option<Url>,
        lookup_name: String,
        user_name: String,
    },
}

impl PeerTarget {
    /// Parses a `remoteUserNames` entry: `alice`, `team/alice` or `https://host@alice`.
    pub fn parse_user(entry: &str) -> Result<Self, TetherError> {
        let (server, lookup_name) = if entry.starts_with("http://") || entry.starts_with("https://")
        {
            let (url, user) = entry.rsplit_once('@').ok_or_else(|| {
                TetherError::Config(format!("remote user '{entry}' has a server but no user name"))
            })?;
            (Some(Url::parse(url)?), user.to_string())
        } else {
            (None, entry.to_string())
        };

        let user_name = lookup_name
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .to_string();
        if user_name.is_empty() {
            return Err(TetherError::Config(format!("remote user '{entry}' is empty")));
        }

        Ok(Self::User {
            server,
            lookup_name,
            user_name,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedDataModel {
    pub descriptor: DataModelDescriptor,
    pub kind: BackendKind,
}

/// A parsed and validated connector configuration.
#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    pub name: String,
    /// `None` disables guarded administrative commands.
    pub remote_configuration_key: Option<String>,
    pub peers: Vec<PeerTarget>,
    pub transport: PeerTransportOptions,
    pub datamodels: Vec<ValidatedDataModel>,
    pub file_systems: Vec<ProviderDescriptor>,
    pub plugins: Vec<ProviderDescriptor>,
    raw: String,
}

impl ConnectorConfig {
    pub fn parse(raw: &str) -> Result<Self, TetherError> {
        Self::parse_with_env(raw, |name| std::env::var(name).ok())
    }

    pub fn parse_with_env<F>(raw: &str, lookup: F) -> Result<Self, TetherError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let document: Value = serde_json::from_str(raw)
            .map_err(|e| TetherError::Config(format!("Error parsing the configuration: {e}")))?;
        let resolved = resolve_value(None, document, &lookup);
        let file: ConnectorConfigFile = serde_json::from_value(resolved)
            .map_err(|e| TetherError::Config(format!("Error parsing the configuration: {e}")))?;

        Self::validate(file, raw.to_string())
    }

    fn validate(file: ConnectorConfigFile, raw: String) -> Result<Self, TetherError> {
        let remote_configuration_key = file
            .remote_configuration_key
            .filter(|key| !key.is_empty() && key != ZERO_KEY);

        let mut seen = HashSet::new();
        let mut datamodels = Vec::with_capacity(file.datamodels.len());
        for mut descriptor in file.datamodels {
            check_name("Datamodel", &descriptor.name, &mut seen)?;
            let kind = BackendKind::from_str(&descriptor.class).map_err(|_| {
                TetherError::Config(format!(
                    "Datamodel '{}': unknown class '{}'",
                    descriptor.name, descriptor.class
                ))
            })?;
            descriptor.api_key = checked_api_key("Datamodel", &descriptor.name, descriptor.api_key);
            datamodels.push(ValidatedDataModel { descriptor, kind });
        }

        let file_systems = validate_providers("File system", file.file_systems)?;
        let plugins = validate_providers("Plugin", file.plugins)?;

        let mut peers = Vec::new();
        for server in &file.remote_servers {
            peers.push(PeerTarget::Server(Url::parse(server)?));
        }
        for entry in &file.remote_user_names {
            peers.push(PeerTarget::parse_user(entry)?);
        }

        let transport = match &file.connection_options {
            Some(options) => serde_json::from_value(options.clone()).map_err(|e| {
                TetherError::Config(format!("invalid connectionOptions: {e}"))
            })?,
            None => PeerTransportOptions::default(),
        };

        Ok(Self {
            name: file.name,
            remote_configuration_key,
            peers,
            transport,
            datamodels,
            file_systems,
            plugins,
            raw,
        })
    }

    /// The document as it should be written back: placeholders untouched, every plaintext
    /// password encrypted.
    pub fn sealed_document(&self) -> Result<String, TetherError> {
        let document: Value = serde_json::from_str(&self.raw)?;
        Ok(serde_json::to_string_pretty(&seal_passwords(None, document))?)
    }

    pub async fn persist(&self, path: &Path) -> Result<(), TetherError> {
        let sealed = self.sealed_document()?;
        tokio::fs::write(path, sealed).await?;
        Ok(())
    }
}

fn check_name(kind: &str, name: &str, seen: &mut HashSet<String>) -> Result<(), TetherError> {
    if name.is_empty() {
        return Err(TetherError::Config(format!("{kind} without a name")));
    }
    if !seen.insert(format!("{kind}:{name}")) {
        return Err(TetherError::Config(format!("{kind} '{name}' is defined twice")));
    }
    Ok(())
}

fn validate_providers(
    kind: &str,
    descriptors: Vec<ProviderDescriptor>,
) -> Result<Vec<ProviderDescriptor>, TetherError> {
    let mut seen = HashSet::new();
    descriptors
        .into_iter()
        .map(|mut descriptor| {
            check_name(kind, &descriptor.name, &mut seen)?;
            descriptor.api_key = checked_api_key(kind, &descriptor.name, descriptor.api_key);
            Ok(descriptor)
        })
        .collect()
}

fn checked_api_key(kind: &str, name: &str, key: String) -> String {
    if key == ZERO_KEY {
        warn!(resource = %name, "{kind} '{name}' uses the all-zero APIKey; it is ignored");
        return String::new();
    }
    if !key.is_empty() && key.len() < STRONG_KEY_LEN {
        warn!(resource = %name, "{kind} '{name}' has a weak APIKey ({} chars)", key.len());
    }
    key
}

/// Replaces `%NAME%` with the value of `NAME`; unknown names are kept verbatim.
pub fn substitute_env<F>(value: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    ENV_PLACEHOLDER
        .replace_all(value, |caps: &Captures| {
            lookup(&caps[1]).unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

fn resolve_value<F>(key: Option<&str>, value: Value, lookup: &F) -> Value
where
    F: Fn(&str) -> Option<String>,
{
    match value {
        Value::String(raw) => {
            if key == Some("password")
                && !raw.is_empty()
                && let Ok(plain) = secrets::decrypt(&raw)
            {
                return Value::String(plain);
            }
            Value::String(substitute_env(&raw, lookup))
        }
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|item| resolve_value(None, item, lookup))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| {
                    let resolved = resolve_value(Some(k.as_str()), v, lookup);
                    (k, resolved)
                })
                .collect(),
        ),
        other => other,
    }
}

fn seal_passwords(key: Option<&str>, value: Value) -> Value {
    match value {
        Value::String(s) if key == Some("password") && !s.is_empty() => {
            // Placeholders resolve from the environment on every load and stay readable.
            if secrets::is_encrypted(&s) || ENV_PLACEHOLDER.is_match(&s) {
                Value::String(s)
            } else {
                Value::String(secrets::encrypt(&s))
            }
        }
        Value::Array(items) => {
            Value::Array(items.into_iter().map(|item| seal_passwords(None, item)).collect())
        }
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| {
                    let sealed = seal_passwords(Some(k.as_str()), v);
                    (k, sealed)
                })
                .collect(),
        ),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn env(name: &str) -> Option<String> {
        match name {
            "DB_HOST" => Some("db.internal".to_string()),
            "DB_PORT" => Some("5432".to_string()),
            "DB_PASSWORD" => Some("from-env".to_string()),
            _ => None,
        }
    }

    #[test]
    fn substitution_replaces_known_names_only() {
        assert_eq!(substitute_env("%DB_HOST%:%DB_PORT%", env), "db.internal:5432");
        assert_eq!(substitute_env("%MISSING%", env), "%MISSING%");
        assert_eq!(substitute_env("100%", env), "100%");
    }

    #[test]
    fn passwords_decrypt_and_strings_substitute() {
        let raw = json!({
            "name": "conn",
            "datamodels": [{
                "name": "db1",
                "class": "postgres",
                "APIKey": "0123456789abcdef0123456789abcdef0123",
                "connectionOptions": {
                    "host": "%DB_HOST%",
                    "password": secrets::encrypt("pw"),
                }
            }]
        })
        .to_string();
        let cfg = ConnectorConfig::parse_with_env(&raw, env).unwrap();
        let options = &cfg.datamodels[0].descriptor.connection_options;
        assert_eq!(options["host"], "db.internal");
        assert_eq!(options["password"], "pw");
        assert_eq!(cfg.datamodels[0].kind, BackendKind::Postgres);
    }

    #[test]
    fn sealing_encrypts_plaintext_and_keeps_placeholders() {
        let already = secrets::encrypt("kept");
        let raw = json!({
            "name": "conn",
            "datamodels": [
                { "name": "a", "class": "mysql", "connectionOptions": { "password": "plain", "host": "%DB_HOST%" } },
                { "name": "b", "class": "mysql", "connectionOptions": { "password": already.clone() } }
            ]
        })
        .to_string();
        let cfg = ConnectorConfig::parse_with_env(&raw, env).unwrap();
        let sealed: Value = serde_json::from_str(&cfg.sealed_document().unwrap()).unwrap();

        let first = &sealed["datamodels"][0]["connectionOptions"];
        assert_eq!(first["host"], "%DB_HOST%");
        assert_eq!(secrets::decrypt(first["password"].as_str().unwrap()).unwrap(), "plain");
        assert_eq!(sealed["datamodels"][1]["connectionOptions"]["password"], already);
    }

    #[test]
    fn env_password_survives_a_save_and_reload() {
        let raw = json!({
            "name": "conn",
            "datamodels": [{
                "name": "a",
                "class": "mysql",
                "connectionOptions": { "password": "%DB_PASSWORD%" }
            }]
        })
        .to_string();
        let first = ConnectorConfig::parse_with_env(&raw, env).unwrap();
        assert_eq!(first.datamodels[0].descriptor.connection_options["password"], "from-env");

        let saved = first.sealed_document().unwrap();
        let stored: Value = serde_json::from_str(&saved).unwrap();
        assert_eq!(stored["datamodels"][0]["connectionOptions"]["password"], "%DB_PASSWORD%");

        let second = ConnectorConfig::parse_with_env(&saved, env).unwrap();
        assert_eq!(second.datamodels[0].descriptor.connection_options["password"], "from-env");
    }

    #[test]
    fn zero_or_empty_remote_key_disables_admin() {
        let parse = |key: Value| {
            ConnectorConfig::parse_with_env(
                &json!({ "name": "c", "remoteConfigurationKey": key }).to_string(),
                env,
            )
            .unwrap()
            .remote_configuration_key
        };
        assert_eq!(parse(json!(ZERO_KEY)), None);
        assert_eq!(parse(json!("")), None);
        assert_eq!(parse(json!("k-1")), Some("k-1".to_string()));
    }

    #[test]
    fn zero_api_key_is_cleared() {
        let raw = json!({
            "name": "c",
            "datamodels": [{ "name": "db", "class": "sqlite", "APIKey": ZERO_KEY }]
        })
        .to_string();
        let cfg = ConnectorConfig::parse_with_env(&raw, env).unwrap();
        assert_eq!(cfg.datamodels[0].descriptor.api_key, "");
    }

    #[test]
    fn invalid_documents_are_rejected() {
        assert!(ConnectorConfig::parse_with_env("{ not json", env).is_err());

        let unknown_class = json!({
            "name": "c",
            "datamodels": [{ "name": "db", "class": "cobol" }]
        });
        let err = ConnectorConfig::parse_with_env(&unknown_class.to_string(), env).unwrap_err();
        assert!(err.to_string().contains("unknown class"));

        let duplicate = json!({
            "name": "c",
            "datamodels": [
                { "name": "db", "class": "mysql" },
                { "name": "db", "class": "postgres" }
            ]
        });
        assert!(ConnectorConfig::parse_with_env(&duplicate.to_string(), env).is_err());
    }

    #[test]
    fn user_entries_parse_all_forms() {
        assert_eq!(
            PeerTarget::parse_user("alice").unwrap(),
            PeerTarget::User {
                server: None,
                lookup_name: "alice".into(),
                user_name: "alice".into()
            }
        );
        assert_eq!(
            PeerTarget::parse_user("team/alice").unwrap(),
            PeerTarget::User {
                server: None,
                lookup_name: "team/alice".into(),
                user_name: "alice".into()
            }
        );
        let PeerTarget::User { server, user_name, .. } =
            PeerTarget::parse_user("https://ide.example.com@bob").unwrap()
        else {
            panic!("expected user target");
        };
        assert_eq!(server.unwrap().as_str(), "https://ide.example.com/");
        assert_eq!(user_name, "bob");
    }
}
