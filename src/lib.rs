//! # Searchbind
//!
//! Coordinates indexing work between an application's entities and a search
//! backend. Change events are buffered per transaction in an
//! [`IndexingPlan`], coalesced per document, resolved to tenant-scoped ids and
//! routing keys, and handed to a single writer per index that batches,
//! commits and optionally refreshes.
//!
//! Backends: an embedded [Tantivy](https://github.com/quickwit-oss/tantivy)
//! index, a remote cluster speaking the `_bulk` REST dialect, and an
//! in-memory store for tests.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use searchbind::{EntityBinding, IndexRegistry, IndexingConfig};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # async fn run() -> searchbind::Result<()> {
//! let registry = IndexRegistry::new(IndexingConfig::from_env()?)?;
//! registry.create_index("books")?;
//! registry.bind_entity(EntityBinding::new("Book", "books"))?;
//!
//! let mut plan = registry.plan("Book", None)?;
//! plan.add("1", Arc::new(json!({"title": "Dune"})))?;
//! plan.execute_and_wait().await?;
//!
//! registry.shutdown().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Configuration
//!
//! [`IndexingConfig::from_env`] reads `SEARCHBIND_*` variables, see
//! [`config`] for the keys.

pub mod backend;
pub mod config;
pub mod error;
pub mod failure;
pub mod index;
pub mod optimizer;
pub mod plan;
pub mod routing;
pub mod sync;
pub mod tenancy;
pub mod types;
pub mod work;

pub use backend::{
    BackendOperation, EmbeddedBackend, InMemoryBackend, IndexBackend, OperationOutcome,
    RemoteBackend,
};
pub use config::{BackendKind, ConnectionConfig, IndexingConfig, OptimizerConfig, QueueConfig};
pub use error::{Result, SearchBindError};
pub use failure::{ErrorContext, FailureHandler, LoggingFailureHandler};
pub use index::{IndexManager, IndexRegistry, IndexStats, WorkExecutor, WorkFuture};
pub use optimizer::{IncrementalOptimizer, NoOpOptimizer, OptimizerStrategy};
pub use plan::{
    DiscardPolicy, DocumentMapper, EntityBinding, IndexedEntity, IndexingPlan, JsonDocumentMapper,
};
pub use routing::{DocumentRoutes, FieldRoutingBridge, RoutingBridge, RoutingResolver};
pub use sync::{RefreshPolicy, SynchronizationStrategy};
pub use tenancy::{DiscriminatorMultiTenancy, MultiTenancyStrategy, NoMultiTenancy, TenantFilter};
pub use types::{DocumentId, DocumentPayload, FieldValue, TenantId};
pub use work::{BatchResult, WorkItem, WorkType};

/// Install a `fmt` subscriber filtered by `RUST_LOG` (default `info`).
///
/// Does nothing if a global subscriber is already set.
pub fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
