//! Index backends: where resolved work finally lands.
//!
//! The executor translates each [`WorkItem`] into a [`BackendOperation`] and
//! hands runs of them to [`IndexBackend::apply`], which reports one
//! [`OperationOutcome`] per operation so partial failures can be attributed.

pub mod embedded;
pub mod memory;
pub mod remote;

pub use embedded::EmbeddedBackend;
pub use memory::InMemoryBackend;
pub use remote::RemoteBackend;

use crate::error::Result;
use crate::tenancy::{MultiTenancyStrategy, TenantFilter};
use crate::types::DocumentPayload;
use crate::work::{WorkItem, WorkType};
use async_trait::async_trait;

#[derive(Debug, Clone, PartialEq)]
pub enum BackendOperation {
    Add {
        document_id: String,
        routing_key: Option<String>,
        document: DocumentPayload,
    },
    /// Replace the document, first removing copies left on `stale_routing_keys`.
    Update {
        document_id: String,
        routing_key: Option<String>,
        stale_routing_keys: Vec<String>,
        document: DocumentPayload,
    },
    /// Remove the document from every listed route. `None` is the default
    /// route.
    Delete {
        document_id: String,
        routing_keys: Vec<Option<String>>,
    },
    /// Remove every document, or only those matching the tenant filter.
    Purge { filter: Option<TenantFilter> },
}

impl BackendOperation {
    /// Document-level and purge work translate; Flush and Optimize are
    /// handled by the executor directly and return `None`.
    pub fn from_work(item: &WorkItem, tenancy: &dyn MultiTenancyStrategy) -> Option<Self> {
        let document_id = || item.document_id().unwrap_or_default().to_string();
        let routing_key = item.routing_key().map(str::to_string);
        match item.work_type() {
            WorkType::Add | WorkType::Update => {
                let mut document = item.payload().cloned().unwrap_or_default();
                tenancy.contribute_to_document(&mut document, item.tenant_id());
                if item.work_type() == WorkType::Add {
                    Some(BackendOperation::Add {
                        document_id: document_id(),
                        routing_key,
                        document,
                    })
                } else {
                    Some(BackendOperation::Update {
                        document_id: document_id(),
                        routing_key,
                        stale_routing_keys: item.stale_routing_keys(),
                        document,
                    })
                }
            }
            WorkType::Delete => {
                let mut routing_keys = vec![routing_key];
                for key in item.previous_routing_keys() {
                    if Some(key.as_str()) != item.routing_key() {
                        routing_keys.push(Some(key.clone()));
                    }
                }
                Some(BackendOperation::Delete {
                    document_id: document_id(),
                    routing_keys,
                })
            }
            WorkType::PurgeAll => Some(BackendOperation::Purge {
                filter: tenancy.filter_or_none(item.tenant_id()),
            }),
            WorkType::Flush | WorkType::Optimize => None,
        }
    }

    pub fn document_id(&self) -> Option<&str> {
        match self {
            BackendOperation::Add { document_id, .. }
            | BackendOperation::Update { document_id, .. }
            | BackendOperation::Delete { document_id, .. } => Some(document_id),
            BackendOperation::Purge { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationOutcome {
    Completed,
    Failed(String),
    /// The backend stopped before reaching this operation.
    NotAttempted,
}

impl OperationOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, OperationOutcome::Completed)
    }
}

/// One physical index. Implementations are shared between the executor and
/// readers, so every method takes `&self`.
#[async_trait]
pub trait IndexBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Apply operations in order. Returns one outcome per operation; `Err`
    /// means nothing is known about any of them.
    async fn apply(&self, operations: &[BackendOperation]) -> Result<Vec<OperationOutcome>>;

    /// Make applied operations durable.
    async fn commit(&self) -> Result<()>;

    /// Explicit flush request. Defaults to a commit.
    async fn flush(&self) -> Result<()> {
        self.commit().await
    }

    /// Make committed operations visible to readers.
    async fn refresh(&self) -> Result<()>;

    /// Compact the index.
    async fn optimize(&self) -> Result<()>;

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
