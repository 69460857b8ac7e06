use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Normalized statement result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultSet {
    pub cols: Vec<String>,
    pub rows: Vec<Vec<Value>>,

    #[serde(rename = "rowsAffected", default, skip_serializing_if = "Option::is_none")]
    pub rows_affected: Option<u64>,

    #[serde(rename = "insertId", default, skip_serializing_if = "Option::is_none")]
    pub insert_id: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub times: Option<Timings>,
}

/// Elapsed milliseconds, filled in by the layer that measured them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timings {
    /// Time spent in the driver.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qry: Option<u64>,

    /// Time spent in the connector, routing included.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cc: Option<u64>,
}

// Introspection rows use the ODBC catalog column names whatever the backend.

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct TableRow {
    pub table_cat: Option<String>,
    pub table_schem: Option<String>,
    pub table_name: String,
    pub table_type: Option<String>,
    pub remarks: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct ColumnRow {
    pub table_cat: Option<String>,
    pub table_schem: Option<String>,
    pub table_name: String,
    pub column_name: String,
    pub type_name: Option<String>,
    pub column_size: Option<i64>,
    pub decimal_digits: Option<i64>,
    pub is_nullable: Option<String>,
    pub ordinal_position: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct PrimaryKeyRow {
    pub table_cat: Option<String>,
    pub table_schem: Option<String>,
    pub table_name: String,
    pub column_name: String,
    pub key_seq: Option<i64>,
    pub pk_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct ForeignKeyRow {
    pub pktable_schem: Option<String>,
    pub pktable_name: String,
    pub pkcolumn_name: String,
    pub fktable_schem: Option<String>,
    pub fktable_name: String,
    pub fkcolumn_name: String,
    pub key_seq: Option<i64>,
    pub fk_name: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn result_set_omits_absent_counters() {
        let rs = ResultSet {
            cols: vec!["x".into()],
            rows: vec![vec![json!(1)]],
            ..ResultSet::default()
        };
        assert_eq!(serde_json::to_value(&rs).unwrap(), json!({ "cols": ["x"], "rows": [[1]] }));
    }

    #[test]
    fn catalog_rows_use_odbc_names() {
        let row = PrimaryKeyRow {
            table_name: "t".into(),
            column_name: "id".into(),
            key_seq: Some(1),
            ..PrimaryKeyRow::default()
        };
        let wire = serde_json::to_value(&row).unwrap();
        assert_eq!(wire["TABLE_NAME"], "t");
        assert_eq!(wire["KEY_SEQ"], 1);
        assert!(wire.get("PK_NAME").is_some());
    }
}
