use ahash::AHashMap;
use async_trait::async_trait;
use serde_json::Value;
use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock},
    time::Instant,
};
use tether_schema::{
    CapabilityEntry, DataModelDescriptor, DbCommand, DbRequest, ResultSet, SchemaOptions, Timings,
};
use tether_sqlcore::{SqlParam, bind_parameters};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::backends::{BackendAdapter, BackendConnection, BackendPool, Statement};
use super::catalog::{self, CatalogQuery};
use super::probe::{self, Capabilities};
use super::{BackendKind, DriverRegistry};
use crate::error::TetherError;
use crate::peer::{PeerSessionHandle, SessionId};
use crate::resources::ResourceProvider;

/// Marker for an open transaction on a logical connection.
#[derive(Debug, Clone, Copy)]
struct TransactionToken {
    started: Instant,
}

#[derive(Clone)]
struct PoolSlot {
    pool: Arc<dyn BackendPool>,
    caps: Arc<Capabilities>,
}

struct LogicalConnection {
    conn: Box<dyn BackendConnection>,
    pool: Arc<dyn BackendPool>,
    caps: Arc<Capabilities>,
    transaction: Option<TransactionToken>,
}

#[derive(Clone)]
struct ConnectionSlot {
    owner: SessionId,
    conn: Arc<AsyncMutex<LogicalConnection>>,
}

/// One configured data model: a lazily built pool plus the logical connections peers opened
/// on it, keyed by `cid`.
///
/// Commands on the same `cid` are serialized; different `cid`s run concurrently.
pub struct ResourceBroker {
    instance_id: Uuid,
    kind: BackendKind,
    descriptor: RwLock<DataModelDescriptor>,
    adapter: Arc<dyn BackendAdapter>,
    pool: AsyncMutex<Option<PoolSlot>>,
    connections: Mutex<AHashMap<String, ConnectionSlot>>,
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

impl ResourceBroker {
    pub fn new(
        descriptor: DataModelDescriptor,
        kind: BackendKind,
        registry: &DriverRegistry,
    ) -> Arc<Self> {
        let adapter = registry.adapter(kind, &descriptor);
        Self::with_adapter(descriptor, adapter)
    }

    /// Broker over an explicit adapter.
    pub fn with_adapter(
        descriptor: DataModelDescriptor,
        adapter: Arc<dyn BackendAdapter>,
    ) -> Arc<Self> {
        Arc::new(Self {
            instance_id: Uuid::new_v4(),
            kind: adapter.kind(),
            descriptor: RwLock::new(descriptor),
            adapter,
            pool: AsyncMutex::new(None),
            connections: Mutex::new(AHashMap::new()),
        })
    }

    /// Identity of this broker instance. Survives configuration reloads that keep it.
    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    pub fn name(&self) -> String {
        self.read_descriptor().name.clone()
    }

    pub fn api_key(&self) -> String {
        self.read_descriptor().api_key.clone()
    }

    pub fn capability(&self) -> CapabilityEntry {
        let descriptor = self.read_descriptor();
        CapabilityEntry {
            name: descriptor.name.clone(),
            class: self.kind.class_name().to_string(),
            key: descriptor.api_key.clone(),
        }
    }

    /// Replaces the descriptor of a kept data model. Returns whether anything a peer sees or
    /// the pool depends on changed.
    ///
    /// New connection options drop the current pool; connections already open keep running
    /// on the old one until they are closed.
    pub async fn update_descriptor(&self, descriptor: DataModelDescriptor) -> bool {
        let (key_changed, options_changed) = {
            let current = self.read_descriptor();
            (
                current.api_key != descriptor.api_key,
                current.connection_options != descriptor.connection_options
                    || current.extra != descriptor.extra,
            )
        };

        if options_changed {
            info!(datamodel = %descriptor.name, "Connection options changed, pool will be rebuilt");
            self.pool.lock().await.take();
        }
        *self
            .descriptor
            .write()
            .unwrap_or_else(PoisonError::into_inner) = descriptor;

        key_changed || options_changed
    }

    /// `cid`s currently open, in no particular order.
    pub fn open_cids(&self) -> Vec<String> {
        self.lock_connections().keys().cloned().collect()
    }

    /// Whether the connection `cid` holds an open transaction. `None` if the `cid` is unknown.
    pub async fn in_transaction(&self, cid: &str) -> Option<bool> {
        let slot = self.lock_connections().get(cid).cloned()?;
        let lc = slot.conn.lock().await;
        Some(lc.transaction.is_some())
    }

    fn read_descriptor(&self) -> std::sync::RwLockReadGuard<'_, DataModelDescriptor> {
        self.descriptor.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_connections(&self) -> MutexGuard<'_, AHashMap<String, ConnectionSlot>> {
        self.connections.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn entry(&self, cid: &str) -> Result<Arc<AsyncMutex<LogicalConnection>>, TetherError> {
        self.lock_connections()
            .get(cid)
            .map(|slot| slot.conn.clone())
            .ok_or(TetherError::ConnectionClosed)
    }

    async fn pool_slot(&self) -> Result<PoolSlot, TetherError> {
        let mut guard = self.pool.lock().await;
        if let Some(slot) = guard.as_ref() {
            return Ok(slot.clone());
        }
        let options = self.read_descriptor().connection_options.clone();
        let pool = self.adapter.init_pool(&options).await?;
        info!(datamodel = %self.name(), class = %self.kind, "Pool created");
        let slot = PoolSlot {
            pool,
            caps: Arc::new(Capabilities::default()),
        };
        *guard = Some(slot.clone());
        Ok(slot)
    }

    /// Drops the current pool if `pool` is it and it reports itself broken.
    async fn discard_if_broken(&self, pool: &Arc<dyn BackendPool>) {
        if !pool.is_broken() {
            return;
        }
        let mut guard = self.pool.lock().await;
        if guard
            .as_ref()
            .is_some_and(|slot| Arc::ptr_eq(&slot.pool, pool))
        {
            warn!(datamodel = %self.name(), "Pool is broken, discarding it");
            guard.take();
        }
    }

    /// Opens a logical connection. Re-opening a known `cid` closes the previous one first.
    pub async fn open(&self, cid: &str, owner: SessionId) -> Result<(), TetherError> {
        let slot = self.pool_slot().await?;
        let conn = match slot.pool.acquire().await {
            Ok(conn) => conn,
            Err(e) => {
                self.discard_if_broken(&slot.pool).await;
                return Err(e);
            }
        };

        let logical = ConnectionSlot {
            owner,
            conn: Arc::new(AsyncMutex::new(LogicalConnection {
                conn,
                pool: slot.pool,
                caps: slot.caps,
                transaction: None,
            })),
        };
        let previous = self.lock_connections().insert(cid.to_string(), logical);
        if let Some(previous) = previous {
            debug!(datamodel = %self.name(), cid = %cid, "Replacing open connection");
            if let Err(e) = self.shutdown(previous.conn).await {
                warn!(datamodel = %self.name(), cid = %cid, error = %e, "Closing replaced connection failed");
            }
        }
        debug!(datamodel = %self.name(), cid = %cid, "Connection opened");
        Ok(())
    }

    /// Closes `cid`, rolling back an open transaction. Unknown `cid`s are ignored.
    pub async fn close(&self, cid: &str) -> Result<(), TetherError> {
        let removed = self.lock_connections().remove(cid);
        match removed {
            Some(slot) => {
                debug!(datamodel = %self.name(), cid = %cid, "Connection closed");
                self.shutdown(slot.conn).await
            }
            None => Ok(()),
        }
    }

    async fn shutdown(&self, conn: Arc<AsyncMutex<LogicalConnection>>) -> Result<(), TetherError> {
        let mut lc = conn.lock().await;
        if lc.transaction.take().is_some()
            && lc.caps.transactions() != Some(false)
            && let Err(e) = lc.conn.rollback().await
        {
            warn!(datamodel = %self.name(), error = %e, "Rollback on close failed");
        }
        lc.conn.close().await
    }

    pub async fn execute(
        &self,
        cid: &str,
        sql: &str,
        pars: &[Value],
        returning_counter: bool,
    ) -> Result<ResultSet, TetherError> {
        let entry = self.entry(cid)?;
        let mut lc = entry.lock().await;
        let params = SqlParam::list_from_wire(pars);

        let started = Instant::now();
        let result = self.run(&mut lc, sql, &params, returning_counter).await;
        if result.is_err() {
            self.discard_if_broken(&lc.pool).await;
        }
        let mut rs = result?;
        rs.times = Some(Timings {
            qry: Some(elapsed_ms(started)),
            cc: None,
        });
        Ok(rs)
    }

    async fn run(
        &self,
        lc: &mut LogicalConnection,
        sql: &str,
        params: &[SqlParam],
        returning_counter: bool,
    ) -> Result<ResultSet, TetherError> {
        let in_transaction = lc.transaction.is_some();
        if params.is_empty() || !self.adapter.probes_capabilities() {
            let stmt = Statement {
                sql,
                params,
                in_transaction,
                returning_counter,
            };
            return lc.conn.execute(stmt).await;
        }

        if lc.caps.parameters() == Some(false) {
            let bound = bind_parameters(sql, params, self.adapter.literals())?;
            let stmt = Statement {
                sql: &bound,
                params: &[],
                in_transaction,
                returning_counter,
            };
            return lc.conn.execute(stmt).await;
        }

        let stmt = Statement {
            sql,
            params,
            in_transaction,
            returning_counter,
        };
        match lc.conn.execute(stmt).await {
            Ok(rs) => {
                lc.caps.record_parameters(true);
                Ok(rs)
            }
            Err(TetherError::Backend(err))
                if lc.caps.parameters().is_none() && probe::parameters_unsupported(&err) =>
            {
                lc.caps.record_parameters(false);
                warn!(
                    datamodel = %self.name(),
                    error = %err,
                    "Driver rejects parameter markers, substituting literals from now on"
                );
                let bound = bind_parameters(sql, params, self.adapter.literals())?;
                let stmt = Statement {
                    sql: &bound,
                    params: &[],
                    in_transaction,
                    returning_counter,
                };
                lc.conn.execute(stmt).await
            }
            Err(e) => Err(e),
        }
    }

    pub async fn begin(&self, cid: &str) -> Result<(), TetherError> {
        let entry = self.entry(cid)?;
        let mut lc = entry.lock().await;
        // A nested begin goes to the driver too; the first token keeps its start time.
        let nested = lc.transaction.is_some();
        let token = lc.transaction.take().unwrap_or(TransactionToken {
            started: Instant::now(),
        });

        if lc.caps.transactions() == Some(false) {
            warn!(datamodel = %self.name(), cid = %cid, "Transactions not supported, running without one");
            lc.transaction = Some(token);
            return Ok(());
        }

        match lc.conn.begin().await {
            Ok(()) => {
                if self.adapter.probes_capabilities() {
                    lc.caps.record_transactions(true);
                }
                lc.transaction = Some(token);
                Ok(())
            }
            Err(TetherError::Backend(err))
                if self.adapter.probes_capabilities()
                    && lc.caps.transactions().is_none()
                    && probe::transactions_unsupported(&err) =>
            {
                lc.caps.record_transactions(false);
                warn!(
                    datamodel = %self.name(),
                    cid,
                    error = %err,
                    "Transactions not supported, running without one"
                );
                lc.transaction = Some(token);
                Ok(())
            }
            Err(e) => {
                if nested {
                    lc.transaction = Some(token);
                }
                self.discard_if_broken(&lc.pool).await;
                Err(e)
            }
        }
    }

    /// Commits the open transaction. The transaction is over whatever the outcome.
    pub async fn commit(&self, cid: &str) -> Result<(), TetherError> {
        self.finish_transaction(cid, true).await
    }

    /// Rolls back the open transaction. The transaction is over whatever the outcome.
    pub async fn rollback(&self, cid: &str) -> Result<(), TetherError> {
        self.finish_transaction(cid, false).await
    }

    async fn finish_transaction(&self, cid: &str, commit: bool) -> Result<(), TetherError> {
        let entry = self.entry(cid)?;
        let mut lc = entry.lock().await;
        let token = lc.transaction.take();

        let result = if lc.caps.transactions() == Some(false) {
            Ok(())
        } else if commit {
            lc.conn.commit().await
        } else {
            lc.conn.rollback().await
        };

        if let Some(token) = token {
            debug!(
                datamodel = %self.name(),
                cid,
                commit,
                elapsed_ms = elapsed_ms(token.started),
                "Transaction finished"
            );
        }
        if result.is_err() {
            self.discard_if_broken(&lc.pool).await;
        }
        result
    }

    async fn catalog_query(
        &self,
        lc: &mut LogicalConnection,
        query: &CatalogQuery,
    ) -> Result<ResultSet, TetherError> {
        let stmt = Statement {
            sql: &query.sql,
            params: &query.params,
            in_transaction: lc.transaction.is_some(),
            returning_counter: false,
        };
        lc.conn.execute(stmt).await
    }

    pub async fn list_tables(&self, cid: &str, options: &SchemaOptions) -> Result<Value, TetherError> {
        let entry = self.entry(cid)?;
        let mut lc = entry.lock().await;
        let rows = match self.adapter.catalog().tables(options) {
            Some(query) => catalog::table_rows(self.catalog_query(&mut lc, &query).await?),
            None => lc.conn.list_tables(options).await?,
        };
        Ok(serde_json::to_value(rows)?)
    }

    pub async fn list_table_columns(
        &self,
        cid: &str,
        options: &SchemaOptions,
    ) -> Result<Value, TetherError> {
        let entry = self.entry(cid)?;
        let mut lc = entry.lock().await;
        let rows = match self.adapter.catalog().columns(options) {
            Some(query) => catalog::column_rows(self.catalog_query(&mut lc, &query).await?),
            None => lc.conn.list_table_columns(options).await?,
        };
        Ok(serde_json::to_value(rows)?)
    }

    pub async fn list_table_primary_keys(
        &self,
        cid: &str,
        options: &SchemaOptions,
    ) -> Result<Value, TetherError> {
        let entry = self.entry(cid)?;
        let mut lc = entry.lock().await;
        let rows = match self.adapter.catalog().primary_keys(options) {
            Some(query) => catalog::primary_key_rows(self.catalog_query(&mut lc, &query).await?),
            None => lc.conn.list_table_primary_keys(options).await?,
        };
        Ok(serde_json::to_value(rows)?)
    }

    pub async fn list_table_foreign_keys(
        &self,
        cid: &str,
        options: &SchemaOptions,
    ) -> Result<Value, TetherError> {
        let entry = self.entry(cid)?;
        let mut lc = entry.lock().await;
        let rows = match self.adapter.catalog().foreign_keys(options) {
            Some(query) => catalog::foreign_key_rows(self.catalog_query(&mut lc, &query).await?),
            None => lc.conn.list_table_foreign_keys(options).await?,
        };
        Ok(serde_json::to_value(rows)?)
    }

    /// Routes one decoded request.
    pub async fn handle(
        &self,
        session: SessionId,
        request: &DbRequest,
    ) -> Result<Option<Value>, TetherError> {
        let cmd: DbCommand = request
            .cmd
            .parse()
            .map_err(TetherError::UnsupportedCommand)?;
        if cmd == DbCommand::Ping {
            return Ok(None);
        }

        let cid = request
            .cid_key()
            .ok_or_else(|| TetherError::InvalidRequest(format!("{cmd}: missing cid")))?;

        match cmd {
            DbCommand::Open => self.open(&cid, session).await.map(|_| None),
            DbCommand::Close => self.close(&cid).await.map(|_| None),
            DbCommand::Begin => self.begin(&cid).await.map(|_| None),
            DbCommand::Commit => self.commit(&cid).await.map(|_| None),
            DbCommand::Rollback => self.rollback(&cid).await.map(|_| None),
            DbCommand::Execute => {
                let sql = request
                    .sql
                    .as_deref()
                    .ok_or_else(|| TetherError::InvalidRequest("execute: missing sql".into()))?;
                let pars = request.pars.as_deref().unwrap_or_default();
                let rs = self
                    .execute(&cid, sql, pars, request.ct.unwrap_or(false))
                    .await?;
                Ok(Some(serde_json::to_value(rs)?))
            }
            DbCommand::ListTables => self.list_tables(&cid, &request.schema_options()).await.map(Some),
            DbCommand::ListTableColumns => self
                .list_table_columns(&cid, &request.schema_options())
                .await
                .map(Some),
            DbCommand::ListTablePrimaryKeys => self
                .list_table_primary_keys(&cid, &request.schema_options())
                .await
                .map(Some),
            DbCommand::ListTableForeignKeys => self
                .list_table_foreign_keys(&cid, &request.schema_options())
                .await
                .map(Some),
            DbCommand::Ping => Ok(None),
        }
    }

    /// Closes every connection opened by `session`.
    pub async fn release_session(&self, session: SessionId) {
        let owned: Vec<(String, ConnectionSlot)> = {
            let mut connections = self.lock_connections();
            let cids: Vec<String> = connections
                .iter()
                .filter(|(_, slot)| slot.owner == session)
                .map(|(cid, _)| cid.clone())
                .collect();
            cids.into_iter()
                .filter_map(|cid| connections.remove(&cid).map(|slot| (cid, slot)))
                .collect()
        };

        for (cid, slot) in owned {
            if let Err(e) = self.shutdown(slot.conn).await {
                warn!(datamodel = %self.name(), cid = %cid, error = %e, "Closing connection of disconnected peer failed");
            } else {
                debug!(datamodel = %self.name(), cid = %cid, "Closed connection of disconnected peer");
            }
        }
    }

    /// Closes every connection and the pool.
    pub async fn shutdown_all(&self) {
        let drained: Vec<(String, ConnectionSlot)> = self.lock_connections().drain().collect();
        for (cid, slot) in drained {
            if let Err(e) = self.shutdown(slot.conn).await {
                warn!(datamodel = %self.name(), cid = %cid, error = %e, "Closing connection failed");
            }
        }
        let slot = self.pool.lock().await.take();
        if let Some(slot) = slot {
            slot.pool.close().await;
            info!(datamodel = %self.name(), "Pool closed");
        }
    }
}

#[async_trait]
impl ResourceProvider for ResourceBroker {
    async fn on_message(
        &self,
        session: &PeerSessionHandle,
        msg: &Value,
    ) -> Result<Option<Value>, TetherError> {
        let request: DbRequest = serde_json::from_value(msg.clone())?;
        self.handle(session.id(), &request).await
    }

    async fn on_server_disconnected(&self, session: SessionId) {
        self.release_session(session).await;
    }

    async fn disconnect(&self) {
        self.shutdown_all().await;
    }
}
