//! The connector: owns peer sessions and every local resource, reconciles them against the
//! configuration and routes peer requests.
//!
//! All connector state lives in one actor. Reloads and target resolution are messages to it,
//! so a reload finishes before any later request picks its target. Providers run outside the
//! actor once resolved.

mod admin;
mod directory;
mod dispatch;
mod reconcile;

use ahash::AHashSet;
use futures::future::join_all;
use ractor::{Actor, ActorProcessingErr, ActorRef, RpcReplyPort};
use serde_json::Value;
use std::{sync::Arc, time::Duration};
use tether_schema::{Envelope, EnvelopeData, ProviderDescriptor};
use tracing::{debug, error, info, warn};
use url::Url;
use uuid::Uuid;

use self::directory::Directory;
use self::dispatch::{Resolution, Route, Target};
use self::reconcile::Planned;
use crate::config::{BasicConfig, ConfigSource, ConnectorConfig, PeerTarget, ValidatedDataModel};
use crate::db::{DriverRegistry, ResourceBroker};
use crate::error::TetherError;
use crate::peer::{
    PeerLink, PeerSessionArgs, PeerSessionHandle, PeerTransportOptions, SessionId, spawn_session,
};
use crate::resources::{ProviderEntry, ProviderFactories, ResourceProvider};

/// Everything the connector is built from, apart from its configuration document.
pub struct ConnectorOptions {
    pub settings: BasicConfig,
    pub registry: Arc<DriverRegistry>,
    pub link: PeerLink,
    pub factories: ProviderFactories,
}

impl ConnectorOptions {
    pub fn new(settings: BasicConfig, registry: Arc<DriverRegistry>) -> Self {
        Self {
            settings,
            registry,
            link: PeerLink::default(),
            factories: ProviderFactories::default(),
        }
    }

    pub fn with_link(mut self, link: PeerLink) -> Self {
        self.link = link;
        self
    }

    pub fn with_factories(mut self, factories: ProviderFactories) -> Self {
        self.factories = factories;
        self
    }
}

/// A live resource as seen from outside the connector.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceSnapshot {
    pub name: String,
    pub class: String,
    pub key: String,
    /// Stable while a reload keeps the resource.
    pub instance_id: Uuid,
    /// Logical connections currently open (data models only).
    pub open_cids: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct PeerSnapshot {
    pub session: PeerSessionHandle,
    pub connected: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ConnectorSnapshot {
    pub name: String,
    pub remote_configuration_enabled: bool,
    pub datamodels: Vec<ResourceSnapshot>,
    pub file_systems: Vec<ResourceSnapshot>,
    pub plugins: Vec<ResourceSnapshot>,
    pub peers: Vec<PeerSnapshot>,
}

pub(crate) enum ConnectorMessage {
    /// Load a configuration and reconcile against it. Replies whether capabilities changed.
    LoadConfig(ConfigSource, RpcReplyPort<Result<bool, TetherError>>),

    /// Find the provider a request is addressed to.
    Resolve(Route, RpcReplyPort<Resolution>),

    /// A session (re)established its link.
    PeerConnected(PeerSessionHandle),

    /// A session lost its link or was closed.
    PeerDisconnected(SessionId),

    Snapshot(RpcReplyPort<ConnectorSnapshot>),

    /// Close every session and resource.
    Shutdown(RpcReplyPort<()>),
}

/// Handle for interacting with the connector actor.
#[derive(Clone)]
pub struct ConnectorHandle {
    actor: ActorRef<ConnectorMessage>,
}

impl ConnectorHandle {
    /// Loads a configuration. On error the previous configuration stays in effect.
    pub async fn load_config(&self, source: ConfigSource) -> Result<bool, TetherError> {
        ractor::call!(self.actor, ConnectorMessage::LoadConfig, source)
            .map_err(|e| TetherError::RactorError(format!("LoadConfig RPC failed: {e}")))?
    }

    pub(crate) async fn resolve(&self, route: Route) -> Result<Resolution, TetherError> {
        ractor::call!(self.actor, ConnectorMessage::Resolve, route)
            .map_err(|e| TetherError::RactorError(format!("Resolve RPC failed: {e}")))
    }

    pub(crate) fn peer_connected(&self, session: PeerSessionHandle) {
        let _ = ractor::cast!(self.actor, ConnectorMessage::PeerConnected(session));
    }

    pub(crate) fn peer_disconnected(&self, session: SessionId) {
        let _ = ractor::cast!(self.actor, ConnectorMessage::PeerDisconnected(session));
    }

    /// Runs a peer request and returns the response envelope without sending it.
    pub async fn handle_peer_message(&self, session: &PeerSessionHandle, data: Value) -> Envelope {
        dispatch::respond(self, session, data).await
    }

    /// Runs a peer request and answers over the session it came from.
    pub async fn on_peer_message(&self, session: &PeerSessionHandle, data: Value) {
        let envelope = self.handle_peer_message(session, data).await;
        if let Err(e) = session.send_message(envelope) {
            warn!(session = %session.id(), error = %e, "Response could not be sent");
        }
    }

    pub async fn snapshot(&self) -> Result<ConnectorSnapshot, TetherError> {
        ractor::call!(self.actor, ConnectorMessage::Snapshot)
            .map_err(|e| TetherError::RactorError(format!("Snapshot RPC failed: {e}")))
    }

    /// Disconnects every peer, closes every resource and stops the actor.
    pub async fn shutdown(&self) {
        if let Err(e) = ractor::call!(self.actor, ConnectorMessage::Shutdown) {
            warn!(error = %e, "Connector already stopped");
        }
        self.actor.stop(None);
    }
}

/// Identity of a peer session: where it connects and whom it speaks for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PeerKey {
    url: Url,
    user_name: Option<String>,
}

struct PeerEntry {
    key: PeerKey,
    session: PeerSessionHandle,
}

struct ConnectorState {
    myself: ConnectorHandle,
    settings: Arc<BasicConfig>,
    registry: Arc<DriverRegistry>,
    link: PeerLink,
    factories: ProviderFactories,
    directory: Directory,

    name: String,
    remote_configuration_key: Option<String>,
    datamodels: Vec<Arc<ResourceBroker>>,
    file_systems: Vec<ProviderEntry>,
    plugins: Vec<ProviderEntry>,
    peers: Vec<PeerEntry>,
    connected: AHashSet<SessionId>,
}

impl ConnectorState {
    async fn load(&mut self, source: ConfigSource) -> Result<bool, TetherError> {
        let raw = source.read(&self.settings).await?;
        let config = ConnectorConfig::parse(&raw)?;

        let changed = self.apply(&config).await;
        info!(name = %self.name, changed, "Configuration loaded with success");

        if let Err(e) = config.persist(&self.settings.config_path).await {
            warn!(path = %self.settings.config_path.display(), error = %e, "Configuration could not be saved");
        }
        Ok(changed)
    }

    async fn apply(&mut self, config: &ConnectorConfig) -> bool {
        let mut changed = self.name != config.name;
        self.name = config.name.clone();
        self.remote_configuration_key = config.remote_configuration_key.clone();

        changed |= self.reconcile_datamodels(config.datamodels.clone()).await;
        changed |= self.reconcile_file_systems(config.file_systems.clone()).await;
        changed |= self.reconcile_plugins(config.plugins.clone()).await;
        self.reconcile_peers(config.peers.clone(), config.transport, changed)
            .await;
        changed
    }

    async fn reconcile_datamodels(&mut self, desired: Vec<ValidatedDataModel>) -> bool {
        let current = std::mem::take(&mut self.datamodels);
        // A class change replaces the broker.
        let plan = reconcile::plan(
            current,
            desired,
            |broker| (broker.name(), broker.kind()),
            |dm| (dm.descriptor.name.clone(), dm.kind),
        );
        let mut changed = plan.reshaped();

        for planned in plan.entries {
            match planned {
                Planned::Kept(broker, dm) => {
                    if broker.update_descriptor(dm.descriptor).await {
                        info!(datamodel = %broker.name(), "Datamodel updated");
                        changed = true;
                    }
                    self.datamodels.push(broker);
                }
                Planned::Added(dm) => {
                    info!(datamodel = %dm.descriptor.name, class = %dm.kind, "Datamodel added");
                    self.datamodels
                        .push(ResourceBroker::new(dm.descriptor, dm.kind, &self.registry));
                }
            }
        }

        for broker in plan.removed {
            broker.shutdown_all().await;
            info!(datamodel = %broker.name(), "Datamodel removed");
        }
        changed
    }

    async fn reconcile_file_systems(&mut self, desired: Vec<ProviderDescriptor>) -> bool {
        let current = std::mem::take(&mut self.file_systems);
        let plan = reconcile::plan(
            current,
            desired,
            |entry| entry.descriptor.name.clone(),
            |d| d.name.clone(),
        );
        let mut changed = plan.reshaped();

        for planned in plan.entries {
            match planned {
                Planned::Kept(mut entry, descriptor) => {
                    changed |= entry.update(descriptor);
                    self.file_systems.push(entry);
                }
                Planned::Added(descriptor) => match self.factories.build_file_system(&descriptor) {
                    Ok(entry) => {
                        info!(fs = %descriptor.name, "File system added");
                        self.file_systems.push(entry);
                    }
                    Err(e) => error!(fs = %descriptor.name, error = %e, "File system skipped"),
                },
            }
        }

        for entry in plan.removed {
            entry.provider.disconnect().await;
            info!(fs = %entry.name(), "File system removed");
        }
        changed
    }

    async fn reconcile_plugins(&mut self, desired: Vec<ProviderDescriptor>) -> bool {
        let current = std::mem::take(&mut self.plugins);
        let class_of = |d: &ProviderDescriptor| {
            d.class.as_deref().unwrap_or_default().to_ascii_lowercase()
        };
        let plan = reconcile::plan(
            current,
            desired,
            |entry| (entry.descriptor.name.clone(), class_of(&entry.descriptor)),
            |d| (d.name.clone(), class_of(d)),
        );
        let mut changed = plan.reshaped();

        for planned in plan.entries {
            match planned {
                Planned::Kept(mut entry, descriptor) => {
                    changed |= entry.update(descriptor);
                    self.plugins.push(entry);
                }
                Planned::Added(descriptor) => match self.factories.build_plugin(&descriptor) {
                    Ok(entry) => {
                        info!(plugin = %descriptor.name, "Plugin added");
                        self.plugins.push(entry);
                    }
                    Err(e) => error!(plugin = %descriptor.name, error = %e, "Plugin skipped"),
                },
            }
        }

        for entry in plan.removed {
            entry.provider.disconnect().await;
            info!(plugin = %entry.name(), "Plugin removed");
        }
        changed
    }

    /// Turns a configured target into a session identity, asking the directory when needed.
    async fn locate(&self, target: PeerTarget) -> Option<PeerKey> {
        match target {
            PeerTarget::Server(url) => Some(PeerKey {
                url,
                user_name: None,
            }),
            PeerTarget::User {
                server: Some(url),
                user_name,
                ..
            } => Some(PeerKey {
                url,
                user_name: Some(user_name),
            }),
            PeerTarget::User {
                server: None,
                lookup_name,
                user_name,
            } => match self.directory.server_for_user(&lookup_name).await {
                Ok(Some(url)) => Some(PeerKey {
                    url,
                    user_name: Some(user_name),
                }),
                Ok(None) => {
                    warn!(user = %lookup_name, "Can't locate the server for the user");
                    None
                }
                Err(e) => {
                    error!(user = %lookup_name, error = %e, "Error locating the server for the user");
                    None
                }
            },
        }
    }

    async fn reconcile_peers(
        &mut self,
        targets: Vec<PeerTarget>,
        transport: PeerTransportOptions,
        changed: bool,
    ) {
        let mut desired: Vec<PeerKey> = Vec::with_capacity(targets.len());
        for target in targets {
            if let Some(key) = self.locate(target).await
                && !desired.contains(&key)
            {
                desired.push(key);
            }
        }

        let current = std::mem::take(&mut self.peers);
        let plan = reconcile::plan(current, desired, |entry| entry.key.clone(), PeerKey::clone);

        for planned in plan.entries {
            match planned {
                Planned::Kept(entry, _) => {
                    if changed && self.connected.contains(&entry.session.id()) {
                        self.announce(&entry.session);
                    }
                    self.peers.push(entry);
                }
                Planned::Added(key) => {
                    let args = PeerSessionArgs {
                        id: SessionId::new(),
                        url: key.url.clone(),
                        user_name: key.user_name.clone(),
                        options: transport,
                        link: self.link.clone(),
                        connector: self.myself.clone(),
                    };
                    match spawn_session(args).await {
                        Ok(session) => {
                            info!(url = %key.url, user = ?key.user_name, "Server added");
                            self.peers.push(PeerEntry { key, session });
                        }
                        Err(e) => error!(url = %key.url, error = %e, "Server skipped"),
                    }
                }
            }
        }

        for entry in plan.removed {
            self.connected.remove(&entry.session.id());
            entry.session.disconnect().await;
            info!(url = %entry.key.url, user = ?entry.key.user_name, "Server removed");
        }
    }

    fn init_envelope(&self) -> Envelope {
        Envelope::init(EnvelopeData {
            name: self.name.clone(),
            version: Some(env!("CARGO_PKG_VERSION").to_string()),
            hostname: Some(gethostname::gethostname().to_string_lossy().into_owned()),
            dmlist: Some(self.datamodels.iter().map(|b| b.capability()).collect()),
            fslist: Some(
                self.file_systems
                    .iter()
                    .map(ProviderEntry::file_system_capability)
                    .collect(),
            ),
            pluginslist: Some(
                self.plugins
                    .iter()
                    .map(ProviderEntry::plugin_capability)
                    .collect(),
            ),
            ..EnvelopeData::default()
        })
    }

    fn announce(&self, session: &PeerSessionHandle) {
        debug!(session = %session.id(), url = %session.url(), "Announcing capabilities");
        if let Err(e) = session.send_message(self.init_envelope()) {
            warn!(session = %session.id(), error = %e, "Init could not be sent");
        }
    }

    fn providers(&self) -> Vec<Arc<dyn ResourceProvider>> {
        self.datamodels
            .iter()
            .map(|broker| broker.clone() as Arc<dyn ResourceProvider>)
            .chain(self.file_systems.iter().map(|e| e.provider.clone()))
            .chain(self.plugins.iter().map(|e| e.provider.clone()))
            .collect()
    }

    fn on_peer_connected(&mut self, session: PeerSessionHandle) {
        if !self.peers.iter().any(|p| p.session.id() == session.id()) {
            debug!(session = %session.id(), "Ignoring connect of a retired session");
            return;
        }
        self.connected.insert(session.id());
        self.announce(&session);
    }

    fn on_peer_disconnected(&mut self, session: SessionId) {
        self.connected.remove(&session);
        let providers = self.providers();
        tokio::spawn(async move {
            join_all(
                providers
                    .iter()
                    .map(|provider| provider.on_server_disconnected(session)),
            )
            .await;
            debug!(session = %session, "Released resources of disconnected peer");
        });
    }

    fn resolve(&self, route: Route) -> Resolution {
        let target = match route {
            Route::DataModel(name) => self
                .datamodels
                .iter()
                .find(|broker| broker.name() == name)
                .map(|broker| Target::Provider(broker.clone() as Arc<dyn ResourceProvider>))
                .ok_or(TetherError::DataModelNotFound(name)),
            Route::FileSystem(name) => self
                .file_systems
                .iter()
                .find(|entry| entry.name() == name)
                .map(|entry| Target::Provider(entry.provider.clone()))
                .ok_or(TetherError::FileSystemNotFound(name)),
            Route::Plugin(name) => self
                .plugins
                .iter()
                .find(|entry| entry.name() == name)
                .map(|entry| Target::Provider(entry.provider.clone()))
                .ok_or(TetherError::PluginNotFound(name)),
            Route::Admin => Ok(Target::Admin(admin::AdminContext {
                remote_configuration_key: self.remote_configuration_key.clone(),
                settings: self.settings.clone(),
            })),
            Route::Unknown(cmd) => Err(TetherError::UnknownCommand(cmd)),
        };
        Resolution {
            name: self.name.clone(),
            target,
        }
    }

    fn snapshot(&self) -> ConnectorSnapshot {
        let provider_snapshot = |entry: &ProviderEntry, class: String| ResourceSnapshot {
            name: entry.descriptor.name.clone(),
            class,
            key: entry.descriptor.api_key.clone(),
            instance_id: entry.instance_id(),
            open_cids: Vec::new(),
        };
        ConnectorSnapshot {
            name: self.name.clone(),
            remote_configuration_enabled: self.remote_configuration_key.is_some(),
            datamodels: self
                .datamodels
                .iter()
                .map(|broker| ResourceSnapshot {
                    name: broker.name(),
                    class: broker.kind().class_name().to_string(),
                    key: broker.api_key(),
                    instance_id: broker.instance_id(),
                    open_cids: broker.open_cids(),
                })
                .collect(),
            file_systems: self
                .file_systems
                .iter()
                .map(|entry| provider_snapshot(entry, String::new()))
                .collect(),
            plugins: self
                .plugins
                .iter()
                .map(|entry| {
                    provider_snapshot(entry, entry.descriptor.class.clone().unwrap_or_default())
                })
                .collect(),
            peers: self
                .peers
                .iter()
                .map(|entry| PeerSnapshot {
                    session: entry.session.clone(),
                    connected: self.connected.contains(&entry.session.id()),
                })
                .collect(),
        }
    }

    async fn shutdown(&mut self) {
        for entry in self.peers.drain(..) {
            entry.session.disconnect().await;
        }
        self.connected.clear();
        for broker in self.datamodels.drain(..) {
            broker.shutdown_all().await;
        }
        for entry in self.file_systems.drain(..).chain(self.plugins.drain(..)) {
            entry.provider.disconnect().await;
        }
        info!("Connector shut down");
    }
}

struct ConnectorActor;

#[ractor::async_trait]
impl Actor for ConnectorActor {
    type Msg = ConnectorMessage;
    type State = ConnectorState;
    type Arguments = ConnectorOptions;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        options: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        let directory = Directory::new(
            options.settings.directory_url.clone(),
            Duration::from_secs(options.settings.directory_cache_ttl_secs),
        );
        info!(
            config_path = %options.settings.config_path.display(),
            install_dir = %options.settings.install_dir.display(),
            directory_url = %options.settings.directory_url,
            "Connector started"
        );
        Ok(ConnectorState {
            myself: ConnectorHandle { actor: myself },
            settings: Arc::new(options.settings),
            registry: options.registry,
            link: options.link,
            factories: options.factories,
            directory,
            name: String::new(),
            remote_configuration_key: None,
            datamodels: Vec::new(),
            file_systems: Vec::new(),
            plugins: Vec::new(),
            peers: Vec::new(),
            connected: AHashSet::new(),
        })
    }

    async fn handle(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            ConnectorMessage::LoadConfig(source, reply) => {
                let result = state.load(source).await;
                if let Err(e) = &result {
                    error!(error = %e, "Configuration rejected, previous configuration kept");
                }
                let _ = reply.send(result);
            }
            ConnectorMessage::Resolve(route, reply) => {
                let _ = reply.send(state.resolve(route));
            }
            ConnectorMessage::PeerConnected(session) => state.on_peer_connected(session),
            ConnectorMessage::PeerDisconnected(session) => state.on_peer_disconnected(session),
            ConnectorMessage::Snapshot(reply) => {
                let _ = reply.send(state.snapshot());
            }
            ConnectorMessage::Shutdown(reply) => {
                state.shutdown().await;
                let _ = reply.send(());
            }
        }
        Ok(())
    }
}

/// Starts the connector with an empty configuration.
pub async fn spawn(options: ConnectorOptions) -> Result<ConnectorHandle, TetherError> {
    let (actor, _jh) = Actor::spawn(None, ConnectorActor, options)
        .await
        .map_err(|e| TetherError::RactorError(format!("Connector spawn failed: {e}")))?;
    Ok(ConnectorHandle { actor })
}
