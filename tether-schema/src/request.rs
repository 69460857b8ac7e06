use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{fmt, str::FromStr};

/// Commands understood by a data model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DbCommand {
    Open,
    Close,
    Execute,
    Begin,
    Commit,
    Rollback,
    ListTables,
    ListTablePrimaryKeys,
    ListTableColumns,
    ListTableForeignKeys,
    Ping,
}

impl DbCommand {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Close => "close",
            Self::Execute => "execute",
            Self::Begin => "begin",
            Self::Commit => "commit",
            Self::Rollback => "rollback",
            Self::ListTables => "listTables",
            Self::ListTablePrimaryKeys => "listTablePrimaryKeys",
            Self::ListTableColumns => "listTableColumns",
            Self::ListTableForeignKeys => "listTableForeignKeys",
            Self::Ping => "ping",
        }
    }

    /// Whether the command needs an open connection under its `cid`.
    pub const fn needs_connection(self) -> bool {
        !matches!(self, Self::Open | Self::Close | Self::Ping)
    }
}

impl FromStr for DbCommand {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "open" => Self::Open,
            "close" => Self::Close,
            "execute" => Self::Execute,
            "begin" => Self::Begin,
            "commit" => Self::Commit,
            "rollback" => Self::Rollback,
            "listTables" => Self::ListTables,
            "listTablePrimaryKeys" => Self::ListTablePrimaryKeys,
            "listTableColumns" => Self::ListTableColumns,
            "listTableForeignKeys" => Self::ListTableForeignKeys,
            "ping" => Self::Ping,
            other => return Err(other.to_string()),
        })
    }
}

impl fmt::Display for DbCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fields of an inbound message that a data model reads.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct DbRequest {
    #[serde(default)]
    pub cmd: String,

    /// Logical connection id. Peers send strings or numbers.
    #[serde(default)]
    pub cid: Option<Value>,

    #[serde(default)]
    pub sql: Option<String>,

    #[serde(default)]
    pub pars: Option<Vec<Value>>,

    #[serde(default)]
    pub options: Option<Value>,

    /// Ask the backend to return the generated `counter` column of an insert.
    #[serde(default)]
    pub ct: Option<bool>,
}

impl DbRequest {
    /// Connection id as a map key: strings verbatim, other JSON values in compact form.
    pub fn cid_key(&self) -> Option<String> {
        match self.cid.as_ref()? {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }

    pub fn schema_options(&self) -> SchemaOptions {
        self.options
            .as_ref()
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default()
    }
}

/// Filters for the introspection commands.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaOptions {
    /// Table name pattern (`%` and `_` wildcards).
    #[serde(default)]
    pub filter: Option<String>,

    /// `TABLE` or `VIEW`.
    #[serde(rename = "type", default)]
    pub table_type: Option<String>,

    #[serde(default)]
    pub table: Option<String>,

    #[serde(default)]
    pub schema: Option<String>,
}

/// Fields of an inbound message addressed to the connector itself.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct AdminRequest {
    #[serde(default)]
    pub cmd: String,

    #[serde(default)]
    pub args: Vec<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn commands_parse_by_wire_name() {
        for cmd in [
            DbCommand::Open,
            DbCommand::ListTablePrimaryKeys,
            DbCommand::ListTableForeignKeys,
        ] {
            assert_eq!(cmd.as_str().parse::<DbCommand>(), Ok(cmd));
        }
        assert_eq!("drop".parse::<DbCommand>(), Err("drop".to_string()));
    }

    #[test]
    fn numeric_cid_becomes_string_key() {
        let req: DbRequest = serde_json::from_value(json!({ "cmd": "open", "cid": 12 })).unwrap();
        assert_eq!(req.cid_key().as_deref(), Some("12"));
        let req: DbRequest = serde_json::from_value(json!({ "cmd": "open" })).unwrap();
        assert_eq!(req.cid_key(), None);
    }

    #[test]
    fn schema_options_read_type_field() {
        let req: DbRequest = serde_json::from_value(json!({
            "cmd": "listTables",
            "options": { "filter": "CUST%", "type": "view" }
        }))
        .unwrap();
        let options = req.schema_options();
        assert_eq!(options.filter.as_deref(), Some("CUST%"));
        assert_eq!(options.table_type.as_deref(), Some("view"));
    }
}
