pub mod config;
pub mod connector;
pub mod db;
pub mod error;
pub mod peer;
pub mod resources;
pub(crate) mod utils;

pub use connector::{ConnectorHandle, ConnectorOptions, ConnectorSnapshot};
pub use error::TetherError;
