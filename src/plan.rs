//! Indexing plans: per-transaction buffers of entity change events.
//!
//! A plan collects add/update/delete events for one entity binding and one
//! tenant, coalesces them per document, and turns them into an ordered list
//! of [`WorkItem`]s at [`IndexingPlan::prepare`]. Entity state is read at
//! prepare time, so the document reflects the latest state rather than the
//! state when the event was recorded.
//!
//! Coalescing per document (rows: pending state, columns: incoming event):
//!
//! | pending  | add    | update | delete    |
//! |----------|--------|--------|-----------|
//! | (none)   | Add    | Update | Delete    |
//! | Add      | Add    | Add    | (removed) |
//! | Update   | Update | Update | Delete    |
//! | Delete   | Update | Delete | Delete    |
//!
//! A PurgeAll discards the pending document changes recorded before it.
//! [`DiscardPolicy::KeepAll`] turns off both discards.

use crate::error::{Result, SearchBindError};
use crate::index::manager::{WorkExecutor, WorkFuture};
use crate::routing::{RoutingBridge, RoutingResolver};
use crate::sync::SynchronizationStrategy;
use crate::tenancy::MultiTenancyStrategy;
use crate::types::{DocumentId, DocumentPayload, TenantId};
use crate::work::{BatchResult, WorkItem, WorkType};
use indexmap::IndexMap;
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::Duration;

pub const DEFAULT_PLAN_TIMEOUT: Duration = Duration::from_secs(30);

/// Something whose current state can be indexed.
pub trait IndexedEntity: Send + Sync {
    fn state(&self) -> Value;
}

impl IndexedEntity for Value {
    fn state(&self) -> Value {
        self.clone()
    }
}

impl<T: IndexedEntity> IndexedEntity for RwLock<T> {
    fn state(&self) -> Value {
        match self.read() {
            Ok(guard) => guard.state(),
            Err(poisoned) => poisoned.into_inner().state(),
        }
    }
}

/// Turns entity state into the document written to the index.
pub trait DocumentMapper: Send + Sync {
    fn to_document(&self, raw_id: &str, state: &Value) -> Result<DocumentPayload>;
}

/// Indexes the top-level fields of a JSON object, optionally only a subset.
#[derive(Debug, Clone, Default)]
pub struct JsonDocumentMapper {
    fields: Option<BTreeSet<String>>,
}

impl JsonDocumentMapper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fields<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        JsonDocumentMapper {
            fields: Some(fields.into_iter().map(Into::into).collect()),
        }
    }
}

impl DocumentMapper for JsonDocumentMapper {
    fn to_document(&self, raw_id: &str, state: &Value) -> Result<DocumentPayload> {
        let mut payload = DocumentPayload::from_json(state).map_err(|e| {
            SearchBindError::InvalidDocument(format!("entity {}: {}", raw_id, e))
        })?;
        if let Some(fields) = &self.fields {
            payload.fields.retain(|name, _| fields.contains(name));
        }
        Ok(payload)
    }
}

/// How one entity type is indexed: target index, routing, mapping.
pub struct EntityBinding {
    entity_type: String,
    index_name: String,
    routing: Option<Arc<dyn RoutingBridge>>,
    mapper: Arc<dyn DocumentMapper>,
    indexed_paths: Option<BTreeSet<String>>,
}

impl fmt::Debug for EntityBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityBinding")
            .field("entity_type", &self.entity_type)
            .field("index_name", &self.index_name)
            .field("routed", &self.routing.is_some())
            .field("indexed_paths", &self.indexed_paths)
            .finish()
    }
}

impl EntityBinding {
    pub fn new(entity_type: impl Into<String>, index_name: impl Into<String>) -> Self {
        EntityBinding {
            entity_type: entity_type.into(),
            index_name: index_name.into(),
            routing: None,
            mapper: Arc::new(JsonDocumentMapper::new()),
            indexed_paths: None,
        }
    }

    pub fn with_routing(mut self, bridge: impl RoutingBridge + 'static) -> Self {
        self.routing = Some(Arc::new(bridge));
        self
    }

    pub fn with_mapper(mut self, mapper: impl DocumentMapper + 'static) -> Self {
        self.mapper = Arc::new(mapper);
        self
    }

    /// Paths the indexed document depends on. Updates whose dirty paths all
    /// fall outside them are skipped.
    pub fn with_indexed_paths<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.indexed_paths = Some(paths.into_iter().map(Into::into).collect());
        self
    }

    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }

    pub fn index_name(&self) -> &str {
        &self.index_name
    }

    pub fn routing(&self) -> Option<&Arc<dyn RoutingBridge>> {
        self.routing.as_ref()
    }

    pub fn mapper(&self) -> &Arc<dyn DocumentMapper> {
        &self.mapper
    }

    fn is_relevant(&self, dirty: &DirtyPaths) -> bool {
        let (Some(indexed), DirtyPaths::Paths(paths)) = (&self.indexed_paths, dirty) else {
            return true;
        };
        paths.is_empty()
            || paths
                .iter()
                .any(|path| indexed.iter().any(|ip| paths_overlap(ip, path)))
    }
}

/// `a` and `b` name the same path or one is nested under the other.
fn paths_overlap(a: &str, b: &str) -> bool {
    let nested = |outer: &str, inner: &str| {
        inner.len() > outer.len()
            && inner.starts_with(outer)
            && inner.as_bytes()[outer.len()] == b'.'
    };
    a == b || nested(a, b) || nested(b, a)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DiscardPolicy {
    /// Cancel add-then-delete pairs and drop work superseded by PurgeAll.
    #[default]
    Coalesce,
    /// Submit every recorded change.
    KeepAll,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Add,
    Update,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Event {
    Add,
    Update,
    Delete,
}

fn transition(current: Option<SlotState>, event: Event, policy: DiscardPolicy) -> Option<SlotState> {
    use SlotState as S;
    match (current, event) {
        (None, Event::Add) => Some(S::Add),
        (None, Event::Update) => Some(S::Update),
        (None, Event::Delete) => Some(S::Delete),

        (Some(S::Add), Event::Add | Event::Update) => Some(S::Add),
        (Some(S::Add), Event::Delete) => match policy {
            DiscardPolicy::Coalesce => None,
            DiscardPolicy::KeepAll => Some(S::Delete),
        },

        (Some(S::Update), Event::Add | Event::Update) => Some(S::Update),
        (Some(S::Update), Event::Delete) => Some(S::Delete),

        (Some(S::Delete), Event::Add) => Some(S::Update),
        (Some(S::Delete), Event::Update | Event::Delete) => Some(S::Delete),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum DirtyPaths {
    All,
    Paths(BTreeSet<String>),
}

impl DirtyPaths {
    fn merge(&mut self, other: DirtyPaths) {
        match (&mut *self, other) {
            (DirtyPaths::All, _) => {}
            (_, DirtyPaths::All) => *self = DirtyPaths::All,
            (DirtyPaths::Paths(mine), DirtyPaths::Paths(theirs)) => mine.extend(theirs),
        }
    }

    fn to_vec(&self) -> Vec<String> {
        match self {
            DirtyPaths::All => Vec::new(),
            DirtyPaths::Paths(paths) => paths.iter().cloned().collect(),
        }
    }
}

struct DocumentSlot {
    seq: u64,
    raw_id: String,
    state: SlotState,
    entity: Option<Arc<dyn IndexedEntity>>,
    dirty: DirtyPaths,
}

enum PlanState {
    Open,
    Prepared(Vec<WorkItem>),
    Executed,
}

/// Buffers the changes of one transaction for one entity type and tenant.
pub struct IndexingPlan {
    binding: Arc<EntityBinding>,
    resolver: RoutingResolver,
    executor: Arc<dyn WorkExecutor>,
    tenant_id: Option<TenantId>,
    synchronization: SynchronizationStrategy,
    timeout: Duration,
    discard_policy: DiscardPolicy,
    next_seq: u64,
    slots: IndexMap<(Option<TenantId>, DocumentId), DocumentSlot>,
    /// Slots recorded before a PurgeAll under [`DiscardPolicy::KeepAll`].
    sealed: Vec<DocumentSlot>,
    index_wide: Vec<(u64, WorkType)>,
    state: PlanState,
}

impl fmt::Debug for IndexingPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexingPlan")
            .field("entity_type", &self.binding.entity_type())
            .field("index", &self.binding.index_name())
            .field("tenant_id", &self.tenant_id)
            .field("synchronization", &self.synchronization)
            .field("pending", &self.len())
            .finish()
    }
}

impl IndexingPlan {
    /// Fails with a configuration error if the tenant id does not fit the
    /// tenancy strategy.
    pub fn new(
        binding: Arc<EntityBinding>,
        tenancy: Arc<dyn MultiTenancyStrategy>,
        executor: Arc<dyn WorkExecutor>,
        tenant_id: Option<&str>,
    ) -> Result<Self> {
        tenancy.check_tenant_id(
            tenant_id,
            &format!("indexing plan for '{}'", binding.entity_type()),
        )?;
        let resolver = RoutingResolver::new(
            binding.entity_type(),
            tenancy,
            binding.routing().cloned(),
        );
        Ok(IndexingPlan {
            binding,
            resolver,
            executor,
            tenant_id: tenant_id.map(str::to_string),
            synchronization: SynchronizationStrategy::default(),
            timeout: DEFAULT_PLAN_TIMEOUT,
            discard_policy: DiscardPolicy::default(),
            next_seq: 0,
            slots: IndexMap::new(),
            sealed: Vec::new(),
            index_wide: Vec::new(),
            state: PlanState::Open,
        })
    }

    pub fn with_synchronization(mut self, strategy: SynchronizationStrategy) -> Self {
        self.synchronization = strategy;
        self
    }

    /// Upper bound for [`Self::execute_and_wait`] under blocking strategies.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_discard_policy(mut self, policy: DiscardPolicy) -> Self {
        self.discard_policy = policy;
        self
    }

    pub fn entity_type(&self) -> &str {
        self.binding.entity_type()
    }

    pub fn tenant_id(&self) -> Option<&str> {
        self.tenant_id.as_deref()
    }

    pub fn synchronization(&self) -> SynchronizationStrategy {
        self.synchronization
    }

    /// Pending document changes and index-wide operations.
    pub fn len(&self) -> usize {
        self.slots.len() + self.sealed.len() + self.index_wide.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_executed(&self) -> bool {
        matches!(self.state, PlanState::Executed)
    }

    pub fn add(&mut self, id: impl Into<String>, entity: Arc<dyn IndexedEntity>) -> Result<()> {
        self.record(id.into(), Some(entity), Event::Add, DirtyPaths::All)
    }

    /// Reindex the whole entity.
    pub fn add_or_update(
        &mut self,
        id: impl Into<String>,
        entity: Arc<dyn IndexedEntity>,
    ) -> Result<()> {
        self.record(id.into(), Some(entity), Event::Update, DirtyPaths::All)
    }

    /// Reindex after a change limited to `dirty_paths`. An empty set means
    /// everything changed.
    pub fn add_or_update_paths<I, S>(
        &mut self,
        id: impl Into<String>,
        entity: Arc<dyn IndexedEntity>,
        dirty_paths: I,
    ) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let paths: BTreeSet<String> = dirty_paths.into_iter().map(Into::into).collect();
        let dirty = if paths.is_empty() {
            DirtyPaths::All
        } else {
            DirtyPaths::Paths(paths)
        };
        self.record(id.into(), Some(entity), Event::Update, dirty)
    }

    /// Delete an entity whose last state is known, so routes can be computed
    /// from it.
    pub fn delete(&mut self, id: impl Into<String>, entity: Arc<dyn IndexedEntity>) -> Result<()> {
        self.record(id.into(), Some(entity), Event::Delete, DirtyPaths::All)
    }

    /// Delete knowing only the id.
    pub fn delete_by_id(&mut self, id: impl Into<String>) -> Result<()> {
        self.record(id.into(), None, Event::Delete, DirtyPaths::All)
    }

    /// Remove every document of this plan's tenant (or of the whole index
    /// without multi-tenancy).
    pub fn purge_all(&mut self) -> Result<()> {
        self.ensure_mutable()?;
        let seq = self.take_seq();
        let superseded = std::mem::take(&mut self.slots);
        match self.discard_policy {
            DiscardPolicy::Coalesce => {
                if !superseded.is_empty() {
                    tracing::debug!(
                        "[{}] purge supersedes {} pending document changes",
                        self.binding.index_name(),
                        superseded.len()
                    );
                }
            }
            DiscardPolicy::KeepAll => self.sealed.extend(superseded.into_values()),
        }
        self.index_wide.push((seq, WorkType::PurgeAll));
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.push_index_wide(WorkType::Flush)
    }

    pub fn optimize(&mut self) -> Result<()> {
        self.push_index_wide(WorkType::Optimize)
    }

    /// Resolve ids, routes and documents into the ordered work list.
    ///
    /// Idempotent until the plan changes: a second call returns the same list
    /// without reading entity state again. On error the plan stays open.
    pub fn prepare(&mut self) -> Result<&[WorkItem]> {
        if let PlanState::Open = self.state {
            let work = self.build_work()?;
            tracing::debug!(
                "[{}] prepared {} work items for '{}'",
                self.binding.index_name(),
                work.len(),
                self.binding.entity_type()
            );
            self.state = PlanState::Prepared(work);
        }
        match &self.state {
            PlanState::Prepared(work) => Ok(work.as_slice()),
            _ => Err(self.spent()),
        }
    }

    /// Prepare if needed and hand the work to the executor. The plan is spent
    /// afterwards, unless the executor rejected the submission.
    pub fn execute(&mut self) -> Result<WorkFuture> {
        let work = self.prepare()?.to_vec();
        let prepared = std::mem::replace(&mut self.state, PlanState::Executed);

        if work.is_empty() {
            return Ok(WorkFuture::ready(
                self.binding.index_name(),
                Ok(BatchResult::default()),
            ));
        }

        match self.executor.submit(
            self.tenant_id.as_deref(),
            work,
            self.synchronization.refresh_policy(),
        ) {
            Ok(future) => Ok(future),
            Err(e) => {
                self.state = prepared;
                Err(e)
            }
        }
    }

    /// Execute and wait as the synchronization strategy prescribes. Returns
    /// `None` under the async strategy.
    pub async fn execute_and_wait(&mut self) -> Result<Option<BatchResult>> {
        let future = self.execute()?;
        self.synchronization.synchronize(future, self.timeout).await
    }

    fn take_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    fn spent(&self) -> SearchBindError {
        SearchBindError::illegal_state(format!(
            "Indexing plan for '{}' was already executed",
            self.binding.entity_type()
        ))
    }

    fn ensure_mutable(&mut self) -> Result<()> {
        match self.state {
            PlanState::Executed => Err(self.spent()),
            PlanState::Prepared(_) => {
                self.state = PlanState::Open;
                Ok(())
            }
            PlanState::Open => Ok(()),
        }
    }

    fn push_index_wide(&mut self, work_type: WorkType) -> Result<()> {
        self.ensure_mutable()?;
        let seq = self.take_seq();
        self.index_wide.push((seq, work_type));
        Ok(())
    }

    fn record(
        &mut self,
        raw_id: String,
        entity: Option<Arc<dyn IndexedEntity>>,
        event: Event,
        dirty: DirtyPaths,
    ) -> Result<()> {
        self.ensure_mutable()?;
        if raw_id.is_empty() {
            return Err(SearchBindError::illegal_state(format!(
                "Empty id for '{}'",
                self.binding.entity_type()
            )));
        }
        let document_id = self
            .resolver
            .document_id(self.tenant_id.as_deref(), &raw_id)?;
        let key = (self.tenant_id.clone(), document_id);
        let current = self.slots.get(&key).map(|slot| slot.state);

        let Some(next) = transition(current, event, self.discard_policy) else {
            self.slots.shift_remove(&key);
            return Ok(());
        };

        match self.slots.get_mut(&key) {
            Some(slot) => {
                // A pending delete routes from the state it was recorded with.
                let keeps_deleted_state = slot.state == SlotState::Delete
                    && next == SlotState::Delete
                    && slot.entity.is_some();
                slot.state = next;
                slot.dirty.merge(dirty);
                if entity.is_some() && !keeps_deleted_state {
                    slot.entity = entity;
                }
            }
            None => {
                let seq = self.take_seq();
                self.slots.insert(
                    key,
                    DocumentSlot {
                        seq,
                        raw_id,
                        state: next,
                        entity,
                        dirty,
                    },
                );
            }
        }
        Ok(())
    }

    fn build_work(&self) -> Result<Vec<WorkItem>> {
        let mut entries: Vec<(u64, WorkItem)> = Vec::with_capacity(self.len());
        for slot in self.sealed.iter().chain(self.slots.values()) {
            if let Some(item) = self.slot_to_work(slot)? {
                entries.push((slot.seq, item));
            }
        }
        for (seq, work_type) in &self.index_wide {
            let entity_type = self.binding.entity_type();
            let tenant = self.tenant_id.clone();
            let item = match work_type {
                WorkType::PurgeAll => WorkItem::purge_all(entity_type, tenant),
                WorkType::Flush => WorkItem::flush(entity_type, tenant),
                _ => WorkItem::optimize(entity_type, tenant),
            };
            entries.push((*seq, item));
        }
        entries.sort_by_key(|(seq, _)| *seq);
        Ok(entries.into_iter().map(|(_, item)| item).collect())
    }

    fn slot_to_work(&self, slot: &DocumentSlot) -> Result<Option<WorkItem>> {
        let tenant = self.tenant_id.as_deref();
        let entity_type = self.binding.entity_type();

        if slot.state == SlotState::Delete {
            let state = slot.entity.as_ref().map(|e| e.state());
            let resolved = self
                .resolver
                .resolve_for_delete(tenant, &slot.raw_id, state.as_ref())?;
            return Ok(Some(
                WorkItem::delete(
                    entity_type,
                    self.tenant_id.clone(),
                    resolved.document_id,
                    resolved.routing_key,
                )
                .with_previous_routing_keys(resolved.previous_routing_keys),
            ));
        }

        if slot.state == SlotState::Update && !self.binding.is_relevant(&slot.dirty) {
            tracing::trace!(
                "[{}] skipping {}#{}: no indexed path is dirty",
                self.binding.index_name(),
                entity_type,
                slot.raw_id
            );
            return Ok(None);
        }

        let entity = slot.entity.as_ref().ok_or_else(|| {
            SearchBindError::illegal_state(format!(
                "No entity state recorded for {}#{}",
                entity_type, slot.raw_id
            ))
        })?;
        let state = entity.state();
        let resolved = self.resolver.resolve(tenant, &slot.raw_id, &state)?;

        if !resolved.indexed {
            // The entity left the index (or never entered it).
            if slot.state == SlotState::Add {
                return Ok(None);
            }
            return Ok(Some(
                WorkItem::delete(
                    entity_type,
                    self.tenant_id.clone(),
                    resolved.document_id,
                    None,
                )
                .with_previous_routing_keys(resolved.previous_routing_keys),
            ));
        }

        let payload = self.binding.mapper().to_document(&slot.raw_id, &state)?;
        let item = match slot.state {
            SlotState::Add => WorkItem::add(
                entity_type,
                self.tenant_id.clone(),
                resolved.document_id,
                resolved.routing_key,
                payload,
            ),
            _ => WorkItem::update(
                entity_type,
                self.tenant_id.clone(),
                resolved.document_id,
                resolved.routing_key,
                payload,
            )
            .with_previous_routing_keys(resolved.previous_routing_keys)
            .with_dirty_paths(slot.dirty.to_vec()),
        };
        Ok(Some(item))
    }
}
