pub mod config;
pub mod envelope;
pub mod request;
pub mod result;

pub use config::{ConnectorConfigFile, DataModelDescriptor, ProviderDescriptor};
pub use envelope::{
    CapabilityEntry, EVENT_INBOUND, EVENT_OUTBOUND, EVENT_PEER_ERROR, Envelope, EnvelopeData,
    FileSystemCapability, InboundMessage, MessageType, TransportFrame,
};
pub use request::{AdminRequest, DbCommand, DbRequest, SchemaOptions};
pub use result::{ColumnRow, ForeignKeyRow, PrimaryKeyRow, ResultSet, TableRow, Timings};
