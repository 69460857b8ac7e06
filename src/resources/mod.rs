//! The provider seam: data models, file systems and plugins all answer peer requests through
//! [`ResourceProvider`].
//!
//! File systems and plugins are built by factories registered on the connector.

use ahash::AHashMap;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tether_schema::{CapabilityEntry, FileSystemCapability, ProviderDescriptor};
use uuid::Uuid;

use crate::error::TetherError;
use crate::peer::{PeerSessionHandle, SessionId};

/// A local resource addressable by name from peers.
#[async_trait]
pub trait ResourceProvider: Send + Sync {
    /// Handles one request. `Ok(None)` answers without a `result`.
    async fn on_message(
        &self,
        session: &PeerSessionHandle,
        msg: &Value,
    ) -> Result<Option<Value>, TetherError>;

    /// Releases everything scoped to `session`. Must not fail.
    async fn on_server_disconnected(&self, session: SessionId);

    /// Called once when the resource leaves the configuration or the process exits.
    async fn disconnect(&self);
}

pub type ProviderFactory =
    Arc<dyn Fn(&ProviderDescriptor) -> Result<Arc<dyn ResourceProvider>, TetherError> + Send + Sync>;

/// Builders for file-system and plugin providers.
#[derive(Clone, Default)]
pub struct ProviderFactories {
    file_system: Option<ProviderFactory>,
    plugins: AHashMap<String, ProviderFactory>,
}

impl ProviderFactories {
    pub fn with_file_system<F>(mut self, factory: F) -> Self
    where
        F: Fn(&ProviderDescriptor) -> Result<Arc<dyn ResourceProvider>, TetherError>
            + Send
            + Sync
            + 'static,
    {
        self.file_system = Some(Arc::new(factory));
        self
    }

    /// Registers a plugin class. Classes match case-insensitively.
    pub fn with_plugin<F>(mut self, class: &str, factory: F) -> Self
    where
        F: Fn(&ProviderDescriptor) -> Result<Arc<dyn ResourceProvider>, TetherError>
            + Send
            + Sync
            + 'static,
    {
        self.plugins
            .insert(class.to_ascii_lowercase(), Arc::new(factory));
        self
    }

    pub(crate) fn build_file_system(
        &self,
        descriptor: &ProviderDescriptor,
    ) -> Result<ProviderEntry, TetherError> {
        let factory = self.file_system.as_ref().ok_or_else(|| {
            TetherError::Config(format!(
                "File system '{}': no file system provider is available",
                descriptor.name
            ))
        })?;
        Ok(ProviderEntry::new(descriptor.clone(), factory(descriptor)?))
    }

    pub(crate) fn build_plugin(
        &self,
        descriptor: &ProviderDescriptor,
    ) -> Result<ProviderEntry, TetherError> {
        let class = descriptor.class.as_deref().unwrap_or_default();
        let factory = self
            .plugins
            .get(&class.to_ascii_lowercase())
            .ok_or_else(|| {
                TetherError::Config(format!(
                    "Plugin '{}': unknown class '{class}'",
                    descriptor.name
                ))
            })?;
        Ok(ProviderEntry::new(descriptor.clone(), factory(descriptor)?))
    }
}

/// A live file system or plugin with the descriptor it was configured from.
#[derive(Clone)]
pub struct ProviderEntry {
    pub descriptor: ProviderDescriptor,
    pub provider: Arc<dyn ResourceProvider>,
    instance_id: Uuid,
}

impl ProviderEntry {
    pub fn new(descriptor: ProviderDescriptor, provider: Arc<dyn ResourceProvider>) -> Self {
        Self {
            descriptor,
            provider,
            instance_id: Uuid::new_v4(),
        }
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    /// Adopts a new descriptor for a kept entry. Returns whether it differs from the old one.
    pub(crate) fn update(&mut self, descriptor: ProviderDescriptor) -> bool {
        if self.descriptor == descriptor {
            return false;
        }
        self.descriptor = descriptor;
        true
    }

    pub fn file_system_capability(&self) -> FileSystemCapability {
        FileSystemCapability {
            name: self.descriptor.name.clone(),
            path: self.descriptor.path.clone(),
            permissions: self.descriptor.permissions.clone(),
            key: self.descriptor.api_key.clone(),
        }
    }

    pub fn plugin_capability(&self) -> CapabilityEntry {
        CapabilityEntry {
            name: self.descriptor.name.clone(),
            class: self.descriptor.class.clone().unwrap_or_default(),
            key: self.descriptor.api_key.clone(),
        }
    }
}
