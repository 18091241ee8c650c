use crate::backend::{EmbeddedBackend, InMemoryBackend, IndexBackend, RemoteBackend};
use crate::config::{validate_index_name, BackendKind, IndexingConfig};
use crate::error::{Result, SearchBindError};
use crate::failure::{FailureHandler, LoggingFailureHandler};
use crate::index::manager::{IndexManager, IndexStats};
use crate::index::writer::WriterRegistry;
use crate::optimizer::optimizer_from_config;
use crate::plan::{EntityBinding, IndexingPlan};
use crate::sync::SynchronizationStrategy;
use crate::tenancy::{strategy_for, MultiTenancyStrategy};
use dashmap::DashMap;
use futures::future::join_all;
use std::path::PathBuf;
use std::sync::Arc;

/// Entry point of the engine: owns one [`IndexManager`] per index and the
/// entity bindings plans are created from.
pub struct IndexRegistry {
    config: IndexingConfig,
    tenancy: Arc<dyn MultiTenancyStrategy>,
    failure_handler: Arc<dyn FailureHandler>,
    writers: Arc<WriterRegistry>,
    managers: DashMap<String, Arc<IndexManager>>,
    bindings: DashMap<String, Arc<EntityBinding>>,
}

impl IndexRegistry {
    pub fn new(config: IndexingConfig) -> Result<Arc<Self>> {
        Self::with_failure_handler(config, Arc::new(LoggingFailureHandler))
    }

    pub fn with_failure_handler(
        config: IndexingConfig,
        failure_handler: Arc<dyn FailureHandler>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let tenancy = strategy_for(config.multi_tenancy);
        tracing::info!(
            "index registry ready (backend={:?}, multi_tenancy={}, synchronization={})",
            config.backend,
            config.multi_tenancy,
            config.synchronization
        );
        Ok(Arc::new(IndexRegistry {
            config,
            tenancy,
            failure_handler,
            writers: Arc::new(WriterRegistry::default()),
            managers: DashMap::new(),
            bindings: DashMap::new(),
        }))
    }

    pub fn config(&self) -> &IndexingConfig {
        &self.config
    }

    pub fn tenancy(&self) -> &Arc<dyn MultiTenancyStrategy> {
        &self.tenancy
    }

    pub fn writers(&self) -> &Arc<WriterRegistry> {
        &self.writers
    }

    fn index_path(&self, name: &str) -> PathBuf {
        self.config.directory.join(name)
    }

    /// Open a backend of the configured kind for `name` and start its worker.
    /// Must be called from within a tokio runtime.
    pub fn create_index(&self, name: &str) -> Result<Arc<IndexManager>> {
        validate_index_name(name)?;
        if self.managers.contains_key(name) {
            return Err(SearchBindError::IndexAlreadyExists(name.to_string()));
        }
        let backend: Arc<dyn IndexBackend> = match self.config.backend {
            BackendKind::Embedded => Arc::new(EmbeddedBackend::open(
                name,
                &self.index_path(name),
                self.config.writer_buffer_bytes,
                &self.writers,
            )?),
            BackendKind::Remote => Arc::new(RemoteBackend::new(name, &self.config.connection)?),
            BackendKind::Memory => Arc::new(InMemoryBackend::new(name)),
        };
        self.register_index(name, backend)
    }

    /// Start a worker over a backend the caller built.
    pub fn register_index(
        &self,
        name: &str,
        backend: Arc<dyn IndexBackend>,
    ) -> Result<Arc<IndexManager>> {
        validate_index_name(name)?;
        match self.managers.entry(name.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(SearchBindError::IndexAlreadyExists(name.to_string()))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let manager = IndexManager::start(
                    name,
                    backend,
                    Arc::clone(&self.tenancy),
                    optimizer_from_config(&self.config.optimizer),
                    Arc::clone(&self.failure_handler),
                    &self.config.queue,
                );
                slot.insert(Arc::clone(&manager));
                tracing::info!("[{}] index registered", name);
                Ok(manager)
            }
        }
    }

    pub fn manager(&self, name: &str) -> Result<Arc<IndexManager>> {
        self.managers
            .get(name)
            .map(|m| Arc::clone(m.value()))
            .ok_or_else(|| SearchBindError::IndexNotFound(name.to_string()))
    }

    pub fn index_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.managers.iter().map(|m| m.key().clone()).collect();
        names.sort();
        names
    }

    pub fn stats(&self, name: &str) -> Result<IndexStats> {
        Ok(self.manager(name)?.stats())
    }

    /// Bind an entity type to an existing index. Rebinding replaces the
    /// previous binding for plans created afterwards.
    pub fn bind_entity(&self, binding: EntityBinding) -> Result<()> {
        if !self.managers.contains_key(binding.index_name()) {
            return Err(SearchBindError::IndexNotFound(
                binding.index_name().to_string(),
            ));
        }
        tracing::debug!(
            "binding entity type '{}' to index '{}'",
            binding.entity_type(),
            binding.index_name()
        );
        self.bindings
            .insert(binding.entity_type().to_string(), Arc::new(binding));
        Ok(())
    }

    pub fn binding(&self, entity_type: &str) -> Result<Arc<EntityBinding>> {
        self.bindings
            .get(entity_type)
            .map(|b| Arc::clone(b.value()))
            .ok_or_else(|| SearchBindError::UnknownEntityType(entity_type.to_string()))
    }

    /// A plan using the configured synchronization strategy.
    pub fn plan(&self, entity_type: &str, tenant_id: Option<&str>) -> Result<IndexingPlan> {
        self.plan_with(entity_type, tenant_id, self.config.synchronization)
    }

    pub fn plan_with(
        &self,
        entity_type: &str,
        tenant_id: Option<&str>,
        synchronization: SynchronizationStrategy,
    ) -> Result<IndexingPlan> {
        let binding = self.binding(entity_type)?;
        let manager = self.manager(binding.index_name())?;
        Ok(IndexingPlan::new(binding, Arc::clone(&self.tenancy), manager, tenant_id)?
            .with_synchronization(synchronization)
            .with_timeout(self.config.connection.request_timeout))
    }

    /// Stop one index: queued work is flushed before its backend closes.
    pub async fn drop_index(&self, name: &str) -> Result<()> {
        let (_, manager) = self
            .managers
            .remove(name)
            .ok_or_else(|| SearchBindError::IndexNotFound(name.to_string()))?;
        self.bindings.retain(|_, b| b.index_name() != name);
        manager.shutdown().await
    }

    /// Stop every index concurrently. Errors are logged and the first one is
    /// returned after all indexes had their chance to shut down.
    pub async fn shutdown(&self) -> Result<()> {
        let managers: Vec<Arc<IndexManager>> = self
            .index_names()
            .into_iter()
            .filter_map(|name| self.managers.remove(&name).map(|(_, m)| m))
            .collect();
        self.bindings.clear();

        let results = join_all(managers.iter().map(|m| m.shutdown())).await;
        let mut first_error = None;
        for (manager, result) in managers.iter().zip(results) {
            if let Err(e) = result {
                tracing::error!("[{}] shutdown failed: {}", manager.name(), e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
