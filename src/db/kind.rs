use std::{fmt, str::FromStr};

/// Backend families a data model can use, selected by its `class`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    Postgres,
    MySql,
    SqlServer,
    Oracle,
    Odbc,
    Sqlite,
}

impl BackendKind {
    /// Class name as announced to peers.
    pub const fn class_name(self) -> &'static str {
        match self {
            Self::Postgres => "Postgres",
            Self::MySql => "MySQL",
            Self::SqlServer => "SQLServer",
            Self::Oracle => "Oracle",
            Self::Odbc => "ODBC",
            Self::Sqlite => "SQLite",
        }
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Self::Postgres,
            "mysql" | "mariadb" => Self::MySql,
            "sqlserver" | "mssql" => Self::SqlServer,
            "oracle" => Self::Oracle,
            "odbc" => Self::Odbc,
            "sqlite" => Self::Sqlite,
            other => return Err(other.to_string()),
        })
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.class_name())
    }
}
