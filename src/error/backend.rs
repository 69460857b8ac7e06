use thiserror::Error as ThisError;

/// Failure reported by a database driver.
#[derive(Debug, Clone, PartialEq, Eq, ThisError)]
#[error("{message}")]
pub struct BackendError {
    pub message: String,

    /// Five-character SQLSTATE when the driver reports one.
    pub sql_state: Option<String>,

    /// The driver considers the pool (not only the statement) unusable.
    pub fatal: bool,
}

impl BackendError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            sql_state: None,
            fatal: false,
        }
    }

    pub fn with_state(mut self, sql_state: impl Into<String>) -> Self {
        self.sql_state = Some(sql_state.into());
        self
    }

    pub fn fatal(mut self) -> Self {
        self.fatal = true;
        self
    }
}

impl From<sqlx::Error> for BackendError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) => {
                let base = BackendError::new(db.message());
                match db.code() {
                    Some(code) => base.with_state(code.into_owned()),
                    None => base,
                }
            }
            sqlx::Error::PoolClosed => BackendError::new(err.to_string()).fatal(),
            _ => BackendError::new(err.to_string()),
        }
    }
}

impl From<tiberius::error::Error> for BackendError {
    fn from(err: tiberius::error::Error) -> Self {
        match &err {
            tiberius::error::Error::Server(token) => {
                BackendError::new(token.message()).with_state(token.code().to_string())
            }
            tiberius::error::Error::Io { .. } | tiberius::error::Error::Tls(_) => {
                BackendError::new(err.to_string()).fatal()
            }
            _ => BackendError::new(err.to_string()),
        }
    }
}

#[cfg(feature = "odbc")]
impl From<odbc_api::Error> for BackendError {
    fn from(err: odbc_api::Error) -> Self {
        let base = BackendError::new(err.to_string());
        match &err {
            odbc_api::Error::Diagnostics { record, .. } => base.with_state(record.state.as_str()),
            _ => base,
        }
    }
}

#[cfg(feature = "oracle")]
impl From<oracle::Error> for BackendError {
    fn from(err: oracle::Error) -> Self {
        let base = BackendError::new(err.to_string());
        match err.db_error() {
            Some(db) => base.with_state(format!("ORA-{:05}", db.code())),
            None => base,
        }
    }
}
