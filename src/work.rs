//! Work items: immutable descriptions of a single index mutation.
//!
//! Executors branch on [`WorkType`] with an explicit `match`; there is no
//! visitor hierarchy.

use crate::error::{Result, SearchBindError};
use crate::failure::ErrorContext;
use crate::types::{DocumentId, DocumentPayload, TenantId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkType {
    Add,
    Update,
    Delete,
    PurgeAll,
    Flush,
    Optimize,
}

impl WorkType {
    /// PurgeAll, Flush and Optimize target the whole index and carry no
    /// document id.
    pub fn is_index_wide(self) -> bool {
        matches!(self, WorkType::PurgeAll | WorkType::Flush | WorkType::Optimize)
    }

    /// Whether repeating this operation converges to the same index state.
    ///
    /// `Add` appends without removing a previous copy, so replaying it can
    /// duplicate a document. Everything else is safe to repeat.
    pub fn is_idempotent(self) -> bool {
        !matches!(self, WorkType::Add)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WorkType::Add => "add",
            WorkType::Update => "update",
            WorkType::Delete => "delete",
            WorkType::PurgeAll => "purge_all",
            WorkType::Flush => "flush",
            WorkType::Optimize => "optimize",
        }
    }
}

impl fmt::Display for WorkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One atomic index mutation instruction.
///
/// `dirty_paths` is a hint: an empty set means the whole entity is considered
/// dirty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    work_type: WorkType,
    tenant_id: Option<TenantId>,
    document_id: Option<DocumentId>,
    routing_key: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    previous_routing_keys: BTreeSet<String>,
    entity_type_name: String,
    payload: Option<DocumentPayload>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    dirty_paths: BTreeSet<String>,
}

impl WorkItem {
    fn document_scoped(
        work_type: WorkType,
        entity_type_name: impl Into<String>,
        tenant_id: Option<TenantId>,
        document_id: impl Into<DocumentId>,
        routing_key: Option<String>,
        payload: Option<DocumentPayload>,
    ) -> Self {
        WorkItem {
            work_type,
            tenant_id,
            document_id: Some(document_id.into()),
            routing_key,
            previous_routing_keys: BTreeSet::new(),
            entity_type_name: entity_type_name.into(),
            payload,
            dirty_paths: BTreeSet::new(),
        }
    }

    fn index_wide(
        work_type: WorkType,
        entity_type_name: impl Into<String>,
        tenant_id: Option<TenantId>,
    ) -> Self {
        WorkItem {
            work_type,
            tenant_id,
            document_id: None,
            routing_key: None,
            previous_routing_keys: BTreeSet::new(),
            entity_type_name: entity_type_name.into(),
            payload: None,
            dirty_paths: BTreeSet::new(),
        }
    }

    pub fn add(
        entity_type_name: impl Into<String>,
        tenant_id: Option<TenantId>,
        document_id: impl Into<DocumentId>,
        routing_key: Option<String>,
        payload: DocumentPayload,
    ) -> Self {
        Self::document_scoped(
            WorkType::Add,
            entity_type_name,
            tenant_id,
            document_id,
            routing_key,
            Some(payload),
        )
    }

    pub fn update(
        entity_type_name: impl Into<String>,
        tenant_id: Option<TenantId>,
        document_id: impl Into<DocumentId>,
        routing_key: Option<String>,
        payload: DocumentPayload,
    ) -> Self {
        Self::document_scoped(
            WorkType::Update,
            entity_type_name,
            tenant_id,
            document_id,
            routing_key,
            Some(payload),
        )
    }

    pub fn delete(
        entity_type_name: impl Into<String>,
        tenant_id: Option<TenantId>,
        document_id: impl Into<DocumentId>,
        routing_key: Option<String>,
    ) -> Self {
        Self::document_scoped(
            WorkType::Delete,
            entity_type_name,
            tenant_id,
            document_id,
            routing_key,
            None,
        )
    }

    pub fn purge_all(entity_type_name: impl Into<String>, tenant_id: Option<TenantId>) -> Self {
        Self::index_wide(WorkType::PurgeAll, entity_type_name, tenant_id)
    }

    pub fn flush(entity_type_name: impl Into<String>, tenant_id: Option<TenantId>) -> Self {
        Self::index_wide(WorkType::Flush, entity_type_name, tenant_id)
    }

    pub fn optimize(entity_type_name: impl Into<String>, tenant_id: Option<TenantId>) -> Self {
        Self::index_wide(WorkType::Optimize, entity_type_name, tenant_id)
    }

    /// Routes the document may have been written to before, used to broadcast
    /// deletes when the routing key could have changed.
    pub fn with_previous_routing_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.previous_routing_keys = keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_dirty_paths<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dirty_paths = paths.into_iter().map(Into::into).collect();
        self
    }

    pub fn work_type(&self) -> WorkType {
        self.work_type
    }

    pub fn tenant_id(&self) -> Option<&str> {
        self.tenant_id.as_deref()
    }

    pub fn document_id(&self) -> Option<&str> {
        self.document_id.as_deref()
    }

    pub fn routing_key(&self) -> Option<&str> {
        self.routing_key.as_deref()
    }

    pub fn previous_routing_keys(&self) -> &BTreeSet<String> {
        &self.previous_routing_keys
    }

    /// Previous routes that differ from the current one. These are the routes
    /// a stale copy of the document could still live on.
    pub fn stale_routing_keys(&self) -> Vec<String> {
        self.previous_routing_keys
            .iter()
            .filter(|k| Some(k.as_str()) != self.routing_key.as_deref())
            .cloned()
            .collect()
    }

    pub fn entity_type_name(&self) -> &str {
        &self.entity_type_name
    }

    pub fn payload(&self) -> Option<&DocumentPayload> {
        self.payload.as_ref()
    }

    pub fn dirty_paths(&self) -> &BTreeSet<String> {
        &self.dirty_paths
    }

    pub fn safe_to_retry(&self) -> bool {
        self.work_type.is_idempotent()
    }

    /// Construction-time invariants: per-document work needs a non-empty id
    /// (and a payload for Add/Update); index-wide work must not carry one.
    pub fn validate(&self) -> Result<()> {
        if self.work_type.is_index_wide() {
            if self.document_id.is_some() || self.payload.is_some() {
                return Err(SearchBindError::illegal_state(format!(
                    "{} work on '{}' must not target a single document",
                    self.work_type, self.entity_type_name
                )));
            }
            return Ok(());
        }
        match self.document_id.as_deref() {
            Some(id) if !id.is_empty() => {}
            _ => {
                return Err(SearchBindError::illegal_state(format!(
                    "{} work on '{}' requires a document id",
                    self.work_type, self.entity_type_name
                )))
            }
        }
        if matches!(self.work_type, WorkType::Add | WorkType::Update) && self.payload.is_none() {
            return Err(SearchBindError::illegal_state(format!(
                "{} work on '{}' requires a payload",
                self.work_type, self.entity_type_name
            )));
        }
        Ok(())
    }

    /// Label used in logs: `add books#42`.
    pub fn describe(&self) -> String {
        match self.document_id.as_deref() {
            Some(id) => format!("{} {}#{}", self.work_type, self.entity_type_name, id),
            None => format!("{} {}", self.work_type, self.entity_type_name),
        }
    }
}

/// Outcome of one submission to an index executor.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchResult {
    pub succeeded: Vec<WorkItem>,
    pub failed: Option<ErrorContext>,
}

impl BatchResult {
    pub fn success(succeeded: Vec<WorkItem>) -> Self {
        BatchResult {
            succeeded,
            failed: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.failed.is_none()
    }

    /// Turn a partial failure into the aggregated error callers see.
    pub fn into_result(self) -> Result<BatchResult> {
        match self.failed {
            Some(ctx) => Err(SearchBindError::BatchFailure(Box::new(ctx))),
            None => Ok(self),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_wide_items_have_no_document() {
        let purge = WorkItem::purge_all("Book", None);
        assert!(purge.document_id().is_none());
        assert!(purge.validate().is_ok());
        assert!(purge.work_type().is_index_wide());
    }

    #[test]
    fn test_document_items_require_id() {
        let item = WorkItem::delete("Book", None, "", None);
        assert!(item.validate().is_err());

        let ok = WorkItem::delete("Book", None, "42", None);
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn test_retry_classification() {
        let add = WorkItem::add("Book", None, "1", None, DocumentPayload::new());
        let update = WorkItem::update("Book", None, "1", None, DocumentPayload::new());
        assert!(!add.safe_to_retry());
        assert!(update.safe_to_retry());
        assert!(WorkItem::purge_all("Book", None).safe_to_retry());
    }

    #[test]
    fn test_stale_routing_keys_exclude_current() {
        let item = WorkItem::update(
            "Book",
            None,
            "1",
            Some("fantasy".to_string()),
            DocumentPayload::new(),
        )
        .with_previous_routing_keys(["fantasy", "scifi"]);
        assert_eq!(item.stale_routing_keys(), vec!["scifi".to_string()]);
    }

    #[test]
    fn test_serializes_work_type_snake_case() {
        let item = WorkItem::purge_all("Book", Some("t1".to_string()));
        let json = serde_json::to_value(&item).unwrap();
        assert_eq!(json["work_type"], "purge_all");
        assert_eq!(json["tenant_id"], "t1");
    }
}
