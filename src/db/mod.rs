//! Relational data models.
//!
//! Layout:
//! - `broker.rs`: one [`ResourceBroker`] per configured data model (pool + logical connections)
//! - `backends/`: driver adapters behind the [`BackendAdapter`] seam
//! - `catalog.rs`: introspection SQL and its mapping onto ODBC catalog rows
//! - `probe.rs`: runtime discovery of driver features
//! - `registry.rs`: process-wide driver state

pub mod backends;
pub mod catalog;
pub mod probe;

mod broker;
mod kind;
mod registry;

pub use backends::{BackendAdapter, BackendConnection, BackendPool, Statement};
pub use broker::ResourceBroker;
pub use catalog::Catalog;
pub use kind::BackendKind;
pub use probe::Capabilities;
pub use registry::DriverRegistry;
