use ahash::AHashSet;
use std::sync::{Arc, Mutex, PoisonError};
use tether_schema::DataModelDescriptor;
use tracing::info;

use super::BackendKind;
use super::backends::{
    BackendAdapter, MySqlAdapter, OdbcAdapter, OracleAdapter, PostgresAdapter, SqlServerAdapter,
    SqliteAdapter,
};

/// Process-wide driver state, created once in `main` and shared by every broker.
///
/// Driver libraries that need global initialization (the ODBC environment) are set up here on
/// first use instead of living in module statics.
#[derive(Default)]
pub struct DriverRegistry {
    announced: Mutex<AHashSet<BackendKind>>,
    #[cfg(feature = "odbc")]
    odbc_env: std::sync::OnceLock<Result<&'static odbc_api::Environment, String>>,
}

impl DriverRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Adapter for a data model of the given kind.
    pub fn adapter(
        &self,
        kind: BackendKind,
        descriptor: &DataModelDescriptor,
    ) -> Arc<dyn BackendAdapter> {
        let first_use = self
            .announced
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(kind);
        if first_use {
            info!(class = %kind, "Driver initialized");
        }

        match kind {
            BackendKind::Postgres => Arc::new(PostgresAdapter),
            BackendKind::MySql => Arc::new(MySqlAdapter),
            BackendKind::Sqlite => Arc::new(SqliteAdapter),
            BackendKind::SqlServer => Arc::new(SqlServerAdapter),
            BackendKind::Oracle => Arc::new(OracleAdapter::new(descriptor.extra_u64("maxRows"))),
            BackendKind::Odbc => self.odbc_adapter(),
        }
    }

    #[cfg(feature = "odbc")]
    fn odbc_adapter(&self) -> Arc<dyn BackendAdapter> {
        let env = self.odbc_env.get_or_init(|| {
            odbc_api::Environment::new()
                .map(|env| &*Box::leak(Box::new(env)))
                .map_err(|e| e.to_string())
        });
        Arc::new(OdbcAdapter::new(env.clone()))
    }

    #[cfg(not(feature = "odbc"))]
    fn odbc_adapter(&self) -> Arc<dyn BackendAdapter> {
        Arc::new(OdbcAdapter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adapters_match_requested_kind() {
        let registry = DriverRegistry::new();
        let descriptor = DataModelDescriptor::default();
        for kind in [
            BackendKind::Postgres,
            BackendKind::MySql,
            BackendKind::Sqlite,
            BackendKind::SqlServer,
            BackendKind::Oracle,
            BackendKind::Odbc,
        ] {
            assert_eq!(registry.adapter(kind, &descriptor).kind(), kind);
        }
    }
}
