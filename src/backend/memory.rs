//! In-memory backend with explicit commit and refresh points.
//!
//! Documents are kept per `(routing key, document id)`, the way a sharded
//! cluster keeps them, so a write on the wrong route leaves a visible stale
//! copy. Failures and latency can be injected for tests.

use super::{BackendOperation, IndexBackend, OperationOutcome};
use crate::error::{Result, SearchBindError};
use crate::types::DocumentPayload;
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

type ShardKey = (Option<String>, String);
type Documents = BTreeMap<ShardKey, DocumentPayload>;

#[derive(Default)]
struct MemoryState {
    working: Documents,
    committed: Documents,
    visible: Documents,
    applied: Vec<BackendOperation>,
    failing_ids: BTreeSet<String>,
    fail_commits: usize,
    fail_apply: Option<String>,
    apply_delay: Option<Duration>,
    commits: usize,
    refreshes: usize,
    optimizations: usize,
}

pub struct InMemoryBackend {
    name: String,
    state: Mutex<MemoryState>,
}

impl InMemoryBackend {
    pub fn new(name: impl Into<String>) -> Self {
        InMemoryBackend {
            name: name.into(),
            state: Mutex::new(MemoryState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Operations on this document id fail until [`Self::clear_failures`].
    pub fn fail_on(&self, document_id: impl Into<String>) {
        self.lock().failing_ids.insert(document_id.into());
    }

    /// The next `count` commits fail.
    pub fn fail_commits(&self, count: usize) {
        self.lock().fail_commits = count;
    }

    /// Every `apply` call fails as a whole with `cause`.
    pub fn fail_apply(&self, cause: impl Into<String>) {
        self.lock().fail_apply = Some(cause.into());
    }

    pub fn clear_failures(&self) {
        let mut state = self.lock();
        state.failing_ids.clear();
        state.fail_commits = 0;
        state.fail_apply = None;
    }

    pub fn set_apply_delay(&self, delay: Option<Duration>) {
        self.lock().apply_delay = delay;
    }

    /// Every operation successfully applied so far, in application order.
    pub fn applied_operations(&self) -> Vec<BackendOperation> {
        self.lock().applied.clone()
    }

    /// Copies of the document visible to readers, across all routes.
    pub fn visible_copies(&self, document_id: &str) -> Vec<(Option<String>, DocumentPayload)> {
        copies(&self.lock().visible, document_id)
    }

    pub fn visible_document(&self, document_id: &str) -> Option<DocumentPayload> {
        self.visible_copies(document_id)
            .into_iter()
            .next()
            .map(|(_, doc)| doc)
    }

    pub fn committed_document(&self, document_id: &str) -> Option<DocumentPayload> {
        copies(&self.lock().committed, document_id)
            .into_iter()
            .next()
            .map(|(_, doc)| doc)
    }

    pub fn visible_count(&self) -> usize {
        self.lock().visible.len()
    }

    pub fn committed_count(&self) -> usize {
        self.lock().committed.len()
    }

    pub fn commit_count(&self) -> usize {
        self.lock().commits
    }

    pub fn refresh_count(&self) -> usize {
        self.lock().refreshes
    }

    pub fn optimize_count(&self) -> usize {
        self.lock().optimizations
    }
}

fn copies(documents: &Documents, document_id: &str) -> Vec<(Option<String>, DocumentPayload)> {
    documents
        .iter()
        .filter(|((_, id), _)| id == document_id)
        .map(|((route, _), doc)| (route.clone(), doc.clone()))
        .collect()
}

fn apply_one(documents: &mut Documents, operation: &BackendOperation) {
    match operation {
        BackendOperation::Add {
            document_id,
            routing_key,
            document,
        } => {
            documents.insert((routing_key.clone(), document_id.clone()), document.clone());
        }
        BackendOperation::Update {
            document_id,
            routing_key,
            stale_routing_keys,
            document,
        } => {
            for stale in stale_routing_keys {
                documents.remove(&(Some(stale.clone()), document_id.clone()));
            }
            documents.insert((routing_key.clone(), document_id.clone()), document.clone());
        }
        BackendOperation::Delete {
            document_id,
            routing_keys,
        } => {
            for route in routing_keys {
                documents.remove(&(route.clone(), document_id.clone()));
            }
        }
        BackendOperation::Purge { filter: None } => documents.clear(),
        BackendOperation::Purge {
            filter: Some(filter),
        } => documents.retain(|_, doc| !filter.matches(doc)),
    }
}

#[async_trait]
impl IndexBackend for InMemoryBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn apply(&self, operations: &[BackendOperation]) -> Result<Vec<OperationOutcome>> {
        let delay = self.lock().apply_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.lock();
        if let Some(cause) = state.fail_apply.clone() {
            return Err(SearchBindError::Backend(cause));
        }

        let mut outcomes = Vec::with_capacity(operations.len());
        for operation in operations {
            let failing = operation
                .document_id()
                .is_some_and(|id| state.failing_ids.contains(id));
            if failing {
                outcomes.push(OperationOutcome::Failed(format!(
                    "injected failure for document '{}'",
                    operation.document_id().unwrap_or_default()
                )));
                continue;
            }
            apply_one(&mut state.working, operation);
            state.applied.push(operation.clone());
            outcomes.push(OperationOutcome::Completed);
        }
        Ok(outcomes)
    }

    async fn commit(&self) -> Result<()> {
        let mut state = self.lock();
        if state.fail_commits > 0 {
            state.fail_commits -= 1;
            return Err(SearchBindError::Backend(format!(
                "injected commit failure on '{}'",
                self.name
            )));
        }
        state.committed = state.working.clone();
        state.commits += 1;
        Ok(())
    }

    async fn refresh(&self) -> Result<()> {
        let mut state = self.lock();
        state.visible = state.committed.clone();
        state.refreshes += 1;
        Ok(())
    }

    async fn optimize(&self) -> Result<()> {
        self.lock().optimizations += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FieldValue;

    fn doc(title: &str) -> DocumentPayload {
        DocumentPayload::new().with_field("title", FieldValue::from(title))
    }

    #[tokio::test]
    async fn test_visibility_requires_commit_and_refresh() {
        let backend = InMemoryBackend::new("books");
        backend
            .apply(&[BackendOperation::Add {
                document_id: "1".into(),
                routing_key: None,
                document: doc("Dune"),
            }])
            .await
            .unwrap();
        assert_eq!(backend.committed_count(), 0);

        backend.commit().await.unwrap();
        assert_eq!(backend.committed_count(), 1);
        assert_eq!(backend.visible_count(), 0);

        backend.refresh().await.unwrap();
        assert_eq!(backend.visible_document("1"), Some(doc("Dune")));
    }

    #[tokio::test]
    async fn test_wrong_route_leaves_stale_copy() {
        let backend = InMemoryBackend::new("books");
        let add = |route: &str| BackendOperation::Add {
            document_id: "1".into(),
            routing_key: Some(route.into()),
            document: doc("Dune"),
        };
        backend.apply(&[add("scifi"), add("fantasy")]).await.unwrap();
        backend.commit().await.unwrap();
        backend.refresh().await.unwrap();
        assert_eq!(backend.visible_copies("1").len(), 2);
    }

    #[tokio::test]
    async fn test_injected_failure_is_per_operation() {
        let backend = InMemoryBackend::new("books");
        backend.fail_on("2");
        let outcomes = backend
            .apply(&[
                BackendOperation::Delete {
                    document_id: "2".into(),
                    routing_keys: vec![None],
                },
                BackendOperation::Add {
                    document_id: "3".into(),
                    routing_key: None,
                    document: doc("Emma"),
                },
            ])
            .await
            .unwrap();
        assert!(matches!(outcomes[0], OperationOutcome::Failed(_)));
        assert_eq!(outcomes[1], OperationOutcome::Completed);
        assert_eq!(backend.applied_operations().len(), 1);
    }
}
