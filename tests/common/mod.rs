#![allow(dead_code)]

use searchbind::{
    EntityBinding, ErrorContext, FailureHandler, InMemoryBackend, IndexBackend, IndexRegistry,
    IndexedEntity, IndexingConfig,
};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Collects every error context the engine reports.
#[derive(Default)]
pub struct RecordingFailureHandler {
    contexts: Mutex<Vec<ErrorContext>>,
}

impl RecordingFailureHandler {
    pub fn contexts(&self) -> Vec<ErrorContext> {
        self.contexts.lock().unwrap().clone()
    }
}

impl FailureHandler for RecordingFailureHandler {
    fn handle(&self, context: &ErrorContext) {
        self.contexts.lock().unwrap().push(context.clone());
    }
}

pub struct Harness {
    pub registry: Arc<IndexRegistry>,
    pub backend: Arc<InMemoryBackend>,
    pub failures: Arc<RecordingFailureHandler>,
}

/// A registry with one in-memory index `books` bound to entity type `Book`.
pub fn harness(config: IndexingConfig) -> Harness {
    harness_with_binding(config, EntityBinding::new("Book", "books"))
}

pub fn harness_with_binding(config: IndexingConfig, binding: EntityBinding) -> Harness {
    let failures = Arc::new(RecordingFailureHandler::default());
    let registry = IndexRegistry::with_failure_handler(config, failures.clone()).unwrap();
    let backend = Arc::new(InMemoryBackend::new("books"));
    registry
        .register_index("books", backend.clone() as Arc<dyn IndexBackend>)
        .unwrap();
    registry.bind_entity(binding).unwrap();
    Harness {
        registry,
        backend,
        failures,
    }
}

/// In-memory config whose batches only flush when a test asks for it.
pub fn slow_commit_config() -> IndexingConfig {
    let mut config = IndexingConfig::in_memory();
    config.queue.commit_interval = Duration::from_secs(60);
    config.queue.batch_size = 1000;
    config
}

pub fn book(title: &str) -> Arc<dyn IndexedEntity> {
    Arc::new(json!({ "title": title }))
}

pub fn title_of(payload: &searchbind::DocumentPayload) -> Option<String> {
    payload
        .get("title")
        .and_then(|v| v.as_text())
        .map(str::to_string)
}
