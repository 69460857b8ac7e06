use thiserror::Error as ThisError;
use tether_sqlcore::BindError;

use super::BackendError;

#[derive(Debug, ThisError)]
pub enum TetherError {
    #[error("{0}")]
    Config(String),

    #[error("{class} driver not found.\nRebuild with the \"{feature}\" feature and try again")]
    DriverMissing {
        class: &'static str,
        feature: &'static str,
    },

    #[error("Datamodel '{0}' not found")]
    DataModelNotFound(String),

    #[error("File system '{0}' not found")]
    FileSystemNotFound(String),

    #[error("Plugin '{0}' not found")]
    PluginNotFound(String),

    #[error("Command '{0}' unknown")]
    UnknownCommand(String),

    #[error("Command '{0}' not supported")]
    UnsupportedCommand(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Bind(#[from] BindError),

    #[error("{0} is not allowed.\nFor allow it you need to set the remoteConfigurationKey in the config.")]
    NotAllowed(&'static str),

    #[error("Key for remote configuration is wrong")]
    WrongKey,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("URL parse error: {0}")]
    UrlError(#[from] url::ParseError),

    #[error("HTTP request error: {0}")]
    ReqwestError(#[from] reqwest::Error),

    #[error("Ractor error: {0}")]
    RactorError(String),

    #[error("Unexpected error: {0}")]
    UnexpectedError(String),
}

/// Coarse grouping of failures, used for log fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Configuration,
    Routing,
    Backend,
    Authorization,
    Transport,
    Internal,
}

impl ErrorCategory {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Configuration => "configuration",
            Self::Routing => "routing",
            Self::Backend => "backend",
            Self::Authorization => "authorization",
            Self::Transport => "transport",
            Self::Internal => "internal",
        }
    }
}

impl TetherError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Config(_) | Self::DriverMissing { .. } | Self::UrlError(_) => {
                ErrorCategory::Configuration
            }
            Self::DataModelNotFound(_)
            | Self::FileSystemNotFound(_)
            | Self::PluginNotFound(_)
            | Self::UnknownCommand(_)
            | Self::UnsupportedCommand(_)
            | Self::InvalidRequest(_) => ErrorCategory::Routing,
            Self::ConnectionClosed
            | Self::Backend(_)
            | Self::Bind(_) => ErrorCategory::Backend,
            Self::NotAllowed(_) | Self::WrongKey => ErrorCategory::Authorization,
            Self::ReqwestError(_) => ErrorCategory::Transport,
            Self::IoError(_) | Self::JsonError(_) | Self::RactorError(_) | Self::UnexpectedError(_) => {
                ErrorCategory::Internal
            }
        }
    }
}

impl From<sqlx::Error> for TetherError {
    fn from(err: sqlx::Error) -> Self {
        Self::Backend(err.into())
    }
}

impl From<tiberius::error::Error> for TetherError {
    fn from(err: tiberius::error::Error) -> Self {
        Self::Backend(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routing_messages_name_the_target() {
        assert_eq!(
            TetherError::DataModelNotFound("db9".into()).to_string(),
            "Datamodel 'db9' not found"
        );
        assert_eq!(
            TetherError::UnknownCommand("dance".into()).to_string(),
            "Command 'dance' unknown"
        );
        assert_eq!(TetherError::ConnectionClosed.to_string(), "Connection closed");
    }

    #[test]
    fn categories_group_variants() {
        assert_eq!(TetherError::WrongKey.category(), ErrorCategory::Authorization);
        assert_eq!(
            TetherError::PluginNotFound("p".into()).category(),
            ErrorCategory::Routing
        );
        assert_eq!(
            TetherError::DriverMissing { class: "ODBC", feature: "odbc" }.category(),
            ErrorCategory::Configuration
        );
        assert_eq!(
            TetherError::Backend(BackendError::new("boom")).category(),
            ErrorCategory::Backend
        );
    }

    #[test]
    fn not_allowed_names_the_action() {
        let msg = TetherError::NotAllowed("Restart").to_string();
        assert!(msg.starts_with("Restart is not allowed."));
        assert!(msg.contains("remoteConfigurationKey"));
    }
}
