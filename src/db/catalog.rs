//! Schema introspection expressed as SQL against each backend's system views.
//!
//! Every listing selects a fixed column order, so one mapper per listing turns any backend's
//! result into the shared catalog rows.

use serde_json::Value;
use tether_schema::{ColumnRow, ForeignKeyRow, PrimaryKeyRow, ResultSet, SchemaOptions, TableRow};
use tether_sqlcore::SqlParam;

/// How a backend answers introspection commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Catalog {
    Postgres,
    MySql,
    SqlServer,
    Sqlite,
    Oracle,
    /// The driver exposes catalog functions; the connection answers directly.
    Native,
}

/// SQL text plus its positional parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogQuery {
    pub sql: String,
    pub params: Vec<SqlParam>,
}

struct Builder {
    catalog: Catalog,
    params: Vec<SqlParam>,
}

impl Builder {
    fn new(catalog: Catalog) -> Self {
        Self {
            catalog,
            params: Vec::new(),
        }
    }

    fn bind(&mut self, value: &str) -> String {
        self.params.push(SqlParam::Text(value.to_string()));
        let n = self.params.len();
        match self.catalog {
            Catalog::Postgres => format!("${n}"),
            Catalog::SqlServer => format!("@P{n}"),
            Catalog::Oracle => format!(":P{n}"),
            _ => "?".to_string(),
        }
    }

    fn text(&self, expr: &str) -> String {
        match self.catalog {
            Catalog::Postgres => format!("{expr}::text"),
            _ => expr.to_string(),
        }
    }

    fn int(&self, expr: &str) -> String {
        match self.catalog {
            Catalog::Postgres => format!("({expr})::int8"),
            Catalog::MySql => format!("CAST({expr} AS SIGNED)"),
            Catalog::SqlServer => format!("CAST({expr} AS BIGINT)"),
            _ => expr.to_string(),
        }
    }

    /// Restricts `column` to the schemas a user would expect to see.
    fn schema_scope(&mut self, column: &str, options: &SchemaOptions) -> String {
        match (&options.schema, self.catalog) {
            (Some(schema), _) => format!(" AND {column} = {}", self.bind(schema)),
            (None, Catalog::Postgres) => {
                format!(" AND {column} NOT IN ('pg_catalog', 'information_schema')")
            }
            (None, Catalog::MySql) => format!(" AND {column} = DATABASE()"),
            (None, _) => String::new(),
        }
    }

    fn finish(self, sql: String) -> CatalogQuery {
        CatalogQuery {
            sql,
            params: self.params,
        }
    }
}

fn odbc_table_type(requested: &str) -> String {
    requested.trim().to_ascii_uppercase()
}

impl Catalog {
    pub fn tables(self, options: &SchemaOptions) -> Option<CatalogQuery> {
        let mut b = Builder::new(self);
        let sql = match self {
            Catalog::Native => return None,
            Catalog::Sqlite => {
                let mut sql = "SELECT NULL, NULL, name, CASE type WHEN 'table' THEN 'TABLE' ELSE 'VIEW' END \
                     FROM sqlite_master WHERE type IN ('table', 'view') AND name NOT LIKE 'sqlite_%'"
                    .to_string();
                if let Some(filter) = &options.filter {
                    sql.push_str(&format!(" AND name LIKE {}", b.bind(filter)));
                }
                if let Some(kind) = &options.table_type {
                    sql.push_str(&format!(" AND type = {}", b.bind(&kind.to_ascii_lowercase())));
                }
                sql.push_str(" ORDER BY name");
                sql
            }
            Catalog::Oracle => {
                let mut sql = "SELECT NULL, USER, object_name, object_type FROM user_objects \
                     WHERE object_type IN ('TABLE', 'VIEW')"
                    .to_string();
                if let Some(filter) = &options.filter {
                    sql.push_str(&format!(" AND object_name LIKE {}", b.bind(filter)));
                }
                if let Some(kind) = &options.table_type {
                    sql.push_str(&format!(" AND object_type = {}", b.bind(&odbc_table_type(kind))));
                }
                sql.push_str(" ORDER BY object_name");
                sql
            }
            Catalog::Postgres | Catalog::MySql | Catalog::SqlServer => {
                let mut sql = format!(
                    "SELECT {}, {}, {}, {} FROM information_schema.tables WHERE 1 = 1",
                    b.text("table_catalog"),
                    b.text("table_schema"),
                    b.text("table_name"),
                    b.text("table_type"),
                );
                let scope = b.schema_scope("table_schema", options);
                sql.push_str(&scope);
                if let Some(filter) = &options.filter {
                    sql.push_str(&format!(" AND table_name LIKE {}", b.bind(filter)));
                }
                if let Some(kind) = &options.table_type {
                    let kind = match odbc_table_type(kind).as_str() {
                        "TABLE" => "BASE TABLE".to_string(),
                        other => other.to_string(),
                    };
                    sql.push_str(&format!(" AND table_type = {}", b.bind(&kind)));
                }
                sql.push_str(" ORDER BY table_schema, table_name");
                sql
            }
        };
        Some(b.finish(sql))
    }

    pub fn columns(self, options: &SchemaOptions) -> Option<CatalogQuery> {
        let table = options.table.clone().unwrap_or_default();
        let mut b = Builder::new(self);
        let sql = match self {
            Catalog::Native => return None,
            Catalog::Sqlite => {
                let t1 = b.bind(&table);
                let t2 = b.bind(&table);
                format!(
                    "SELECT NULL, NULL, {t1}, name, type, NULL, NULL, \
                     CASE \"notnull\" WHEN 1 THEN 'NO' ELSE 'YES' END, cid + 1 \
                     FROM pragma_table_info({t2}) ORDER BY cid"
                )
            }
            Catalog::Oracle => {
                let t = b.bind(&table);
                format!(
                    "SELECT NULL, USER, table_name, column_name, data_type, \
                     COALESCE(char_length, data_precision), data_scale, \
                     CASE nullable WHEN 'Y' THEN 'YES' ELSE 'NO' END, column_id \
                     FROM user_tab_columns WHERE table_name = {t} ORDER BY column_id"
                )
            }
            Catalog::Postgres | Catalog::MySql | Catalog::SqlServer => {
                let mut sql = format!(
                    "SELECT {}, {}, {}, {}, {}, {}, {}, {}, {} FROM information_schema.columns WHERE 1 = 1",
                    b.text("table_catalog"),
                    b.text("table_schema"),
                    b.text("table_name"),
                    b.text("column_name"),
                    b.text("data_type"),
                    b.int("COALESCE(character_maximum_length, numeric_precision)"),
                    b.int("numeric_scale"),
                    b.text("is_nullable"),
                    b.int("ordinal_position"),
                );
                let scope = b.schema_scope("table_schema", options);
                sql.push_str(&scope);
                sql.push_str(&format!(" AND table_name = {}", b.bind(&table)));
                sql.push_str(" ORDER BY ordinal_position");
                sql
            }
        };
        Some(b.finish(sql))
    }

    pub fn primary_keys(self, options: &SchemaOptions) -> Option<CatalogQuery> {
        let table = options.table.clone().unwrap_or_default();
        let mut b = Builder::new(self);
        let sql = match self {
            Catalog::Native => return None,
            Catalog::Sqlite => {
                let t1 = b.bind(&table);
                let t2 = b.bind(&table);
                format!(
                    "SELECT NULL, NULL, {t1}, name, pk, NULL FROM pragma_table_info({t2}) \
                     WHERE pk > 0 ORDER BY pk"
                )
            }
            Catalog::Oracle => {
                let t = b.bind(&table);
                format!(
                    "SELECT NULL, USER, c.table_name, cc.column_name, cc.position, c.constraint_name \
                     FROM user_constraints c \
                     JOIN user_cons_columns cc ON c.constraint_name = cc.constraint_name \
                     WHERE c.constraint_type = 'P' AND c.table_name = {t} ORDER BY cc.position"
                )
            }
            Catalog::Postgres | Catalog::MySql | Catalog::SqlServer => {
                let mut sql = format!(
                    "SELECT {}, {}, {}, {}, {}, {} \
                     FROM information_schema.table_constraints tc \
                     JOIN information_schema.key_column_usage kcu \
                       ON tc.constraint_name = kcu.constraint_name \
                      AND tc.table_schema = kcu.table_schema \
                      AND tc.table_name = kcu.table_name \
                     WHERE tc.constraint_type = 'PRIMARY KEY'",
                    b.text("kcu.table_catalog"),
                    b.text("kcu.table_schema"),
                    b.text("kcu.table_name"),
                    b.text("kcu.column_name"),
                    b.int("kcu.ordinal_position"),
                    b.text("tc.constraint_name"),
                );
                let scope = b.schema_scope("tc.table_schema", options);
                sql.push_str(&scope);
                sql.push_str(&format!(" AND tc.table_name = {}", b.bind(&table)));
                sql.push_str(" ORDER BY kcu.ordinal_position");
                sql
            }
        };
        Some(b.finish(sql))
    }

    pub fn foreign_keys(self, options: &SchemaOptions) -> Option<CatalogQuery> {
        let table = options.table.clone().unwrap_or_default();
        let mut b = Builder::new(self);
        let sql = match self {
            Catalog::Native => return None,
            Catalog::Sqlite => {
                let t1 = b.bind(&table);
                let t2 = b.bind(&table);
                format!(
                    "SELECT NULL, \"table\", \"to\", NULL, {t1}, \"from\", seq + 1, NULL \
                     FROM pragma_foreign_key_list({t2}) ORDER BY id, seq"
                )
            }
            Catalog::Oracle => {
                let t = b.bind(&table);
                format!(
                    "SELECT USER, r.table_name, r.column_name, USER, a.table_name, a.column_name, \
                     a.position, c.constraint_name \
                     FROM user_constraints c \
                     JOIN user_cons_columns a ON c.constraint_name = a.constraint_name \
                     JOIN user_cons_columns r ON c.r_constraint_name = r.constraint_name \
                      AND a.position = r.position \
                     WHERE c.constraint_type = 'R' AND c.table_name = {t} \
                     ORDER BY c.constraint_name, a.position"
                )
            }
            Catalog::MySql => {
                let mut sql = format!(
                    "SELECT kcu.referenced_table_schema, kcu.referenced_table_name, \
                     kcu.referenced_column_name, kcu.table_schema, kcu.table_name, kcu.column_name, \
                     {}, kcu.constraint_name \
                     FROM information_schema.key_column_usage kcu \
                     WHERE kcu.referenced_table_name IS NOT NULL",
                    b.int("kcu.ordinal_position"),
                );
                let scope = b.schema_scope("kcu.table_schema", options);
                sql.push_str(&scope);
                sql.push_str(&format!(" AND kcu.table_name = {}", b.bind(&table)));
                sql.push_str(" ORDER BY kcu.constraint_name, kcu.ordinal_position");
                sql
            }
            Catalog::Postgres | Catalog::SqlServer => {
                let mut sql = format!(
                    "SELECT {}, {}, {}, {}, {}, {}, {}, {} \
                     FROM information_schema.referential_constraints rc \
                     JOIN information_schema.key_column_usage fk \
                       ON rc.constraint_schema = fk.constraint_schema \
                      AND rc.constraint_name = fk.constraint_name \
                     JOIN information_schema.key_column_usage pk \
                       ON rc.unique_constraint_schema = pk.constraint_schema \
                      AND rc.unique_constraint_name = pk.constraint_name \
                      AND fk.position_in_unique_constraint = pk.ordinal_position \
                     WHERE 1 = 1",
                    b.text("pk.table_schema"),
                    b.text("pk.table_name"),
                    b.text("pk.column_name"),
                    b.text("fk.table_schema"),
                    b.text("fk.table_name"),
                    b.text("fk.column_name"),
                    b.int("fk.ordinal_position"),
                    b.text("rc.constraint_name"),
                );
                let scope = b.schema_scope("fk.table_schema", options);
                sql.push_str(&scope);
                sql.push_str(&format!(" AND fk.table_name = {}", b.bind(&table)));
                sql.push_str(" ORDER BY rc.constraint_name, fk.ordinal_position");
                sql
            }
        };
        Some(b.finish(sql))
    }
}

fn text_at(row: &[Value], i: usize) -> Option<String> {
    match row.get(i)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn int_at(row: &[Value], i: usize) -> Option<i64> {
    match row.get(i)? {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn normalize_table_type(value: Option<String>) -> Option<String> {
    value.map(|t| match t.as_str() {
        "BASE TABLE" => "TABLE".to_string(),
        other => other.to_ascii_uppercase(),
    })
}

pub fn table_rows(rs: ResultSet) -> Vec<TableRow> {
    rs.rows
        .iter()
        .map(|row| TableRow {
            table_cat: text_at(row, 0),
            table_schem: text_at(row, 1),
            table_name: text_at(row, 2).unwrap_or_default(),
            table_type: normalize_table_type(text_at(row, 3)),
            remarks: None,
        })
        .collect()
}

pub fn column_rows(rs: ResultSet) -> Vec<ColumnRow> {
    rs.rows
        .iter()
        .map(|row| ColumnRow {
            table_cat: text_at(row, 0),
            table_schem: text_at(row, 1),
            table_name: text_at(row, 2).unwrap_or_default(),
            column_name: text_at(row, 3).unwrap_or_default(),
            type_name: text_at(row, 4),
            column_size: int_at(row, 5),
            decimal_digits: int_at(row, 6),
            is_nullable: text_at(row, 7),
            ordinal_position: int_at(row, 8),
        })
        .collect()
}

pub fn primary_key_rows(rs: ResultSet) -> Vec<PrimaryKeyRow> {
    rs.rows
        .iter()
        .map(|row| PrimaryKeyRow {
            table_cat: text_at(row, 0),
            table_schem: text_at(row, 1),
            table_name: text_at(row, 2).unwrap_or_default(),
            column_name: text_at(row, 3).unwrap_or_default(),
            key_seq: int_at(row, 4),
            pk_name: text_at(row, 5),
        })
        .collect()
}

pub fn foreign_key_rows(rs: ResultSet) -> Vec<ForeignKeyRow> {
    rs.rows
        .iter()
        .map(|row| ForeignKeyRow {
            pktable_schem: text_at(row, 0),
            pktable_name: text_at(row, 1).unwrap_or_default(),
            pkcolumn_name: text_at(row, 2).unwrap_or_default(),
            fktable_schem: text_at(row, 3),
            fktable_name: text_at(row, 4).unwrap_or_default(),
            fkcolumn_name: text_at(row, 5).unwrap_or_default(),
            key_seq: int_at(row, 6),
            fk_name: text_at(row, 7),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn opts(filter: Option<&str>, kind: Option<&str>, table: Option<&str>) -> SchemaOptions {
        SchemaOptions {
            filter: filter.map(str::to_string),
            table_type: kind.map(str::to_string),
            table: table.map(str::to_string),
            schema: None,
        }
    }

    #[test]
    fn native_catalog_has_no_sql() {
        assert!(Catalog::Native.tables(&SchemaOptions::default()).is_none());
        assert!(Catalog::Native.foreign_keys(&SchemaOptions::default()).is_none());
    }

    #[test]
    fn placeholders_follow_backend_syntax() {
        let q = Catalog::Postgres
            .tables(&opts(Some("cust%"), Some("table"), None))
            .unwrap();
        assert!(q.sql.contains("table_name LIKE $1"));
        assert!(q.sql.contains("table_type = $2"));
        assert_eq!(
            q.params,
            vec![SqlParam::Text("cust%".into()), SqlParam::Text("BASE TABLE".into())]
        );

        let q = Catalog::SqlServer.columns(&opts(None, None, Some("t"))).unwrap();
        assert!(q.sql.contains("table_name = @P1"));

        let q = Catalog::Oracle.primary_keys(&opts(None, None, Some("T"))).unwrap();
        assert!(q.sql.contains("c.table_name = :P1"));
    }

    #[test]
    fn mysql_scopes_to_current_database() {
        let q = Catalog::MySql.tables(&SchemaOptions::default()).unwrap();
        assert!(q.sql.contains("table_schema = DATABASE()"));
        assert!(q.params.is_empty());
    }

    #[test]
    fn table_rows_normalize_base_table() {
        let rs = ResultSet {
            cols: vec![],
            rows: vec![vec![json!("db"), json!("public"), json!("orders"), json!("BASE TABLE")]],
            ..ResultSet::default()
        };
        let rows = table_rows(rs);
        assert_eq!(rows[0].table_name, "orders");
        assert_eq!(rows[0].table_type.as_deref(), Some("TABLE"));
    }

    #[test]
    fn column_rows_read_numbers_from_text() {
        let rs = ResultSet {
            cols: vec![],
            rows: vec![vec![
                Value::Null,
                Value::Null,
                json!("t"),
                json!("id"),
                json!("INTEGER"),
                json!("10"),
                Value::Null,
                json!("NO"),
                json!(1),
            ]],
            ..ResultSet::default()
        };
        let rows = column_rows(rs);
        assert_eq!(rows[0].column_size, Some(10));
        assert_eq!(rows[0].ordinal_position, Some(1));
        assert_eq!(rows[0].is_nullable.as_deref(), Some("NO"));
    }
}
