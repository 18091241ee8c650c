//! Embedded tantivy backend: one on-disk index per index name.

use super::{BackendOperation, IndexBackend, OperationOutcome};
use crate::error::{Result, SearchBindError};
use crate::index::writer::{ManagedIndexWriter, WriterRegistry};
use crate::tenancy::TenantFilter;
use crate::types::DocumentPayload;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tantivy::collector::{Count, TopDocs};
use tantivy::query::{AllQuery, BooleanQuery, Occur, Query, TermQuery};
use tantivy::schema::{
    Field, IndexRecordOption, JsonObjectOptions, OwnedValue, Schema, TextFieldIndexing, STORED,
    STRING,
};
use tantivy::{Index, IndexReader, ReloadPolicy, TantivyDocument, Term};
use tokio::sync::Mutex;

const ID_FIELD: &str = "_id";
const ROUTING_FIELD: &str = "_routing";
const TENANT_FIELD: &str = "_tenant_id";
const SOURCE_FIELD: &str = "_source";

#[derive(Clone, Copy)]
struct EmbeddedFields {
    id: Field,
    routing: Field,
    tenant: Field,
    source: Field,
}

impl EmbeddedFields {
    fn from_schema(schema: &Schema) -> Result<Self> {
        Ok(EmbeddedFields {
            id: schema.get_field(ID_FIELD)?,
            routing: schema.get_field(ROUTING_FIELD)?,
            tenant: schema.get_field(TENANT_FIELD)?,
            source: schema.get_field(SOURCE_FIELD)?,
        })
    }
}

fn build_schema() -> Schema {
    let mut builder = Schema::builder();
    builder.add_text_field(ID_FIELD, STRING | STORED);
    builder.add_text_field(ROUTING_FIELD, STRING | STORED);
    builder.add_text_field(TENANT_FIELD, STRING | STORED);

    let source_indexing = TextFieldIndexing::default()
        .set_tokenizer("default")
        .set_index_option(IndexRecordOption::WithFreqsAndPositions);
    let source_opts = JsonObjectOptions::default()
        .set_stored()
        .set_indexing_options(source_indexing);
    builder.add_json_field(SOURCE_FIELD, source_opts);
    builder.build()
}

/// Readers see committed work only after [`IndexBackend::refresh`]; the
/// reader is reloaded manually so visibility follows the synchronization
/// strategy exactly.
pub struct EmbeddedBackend {
    name: String,
    path: PathBuf,
    index: Index,
    reader: IndexReader,
    fields: EmbeddedFields,
    writer: Mutex<Option<ManagedIndexWriter>>,
}

impl EmbeddedBackend {
    /// Open the index under `path`, creating it when missing.
    pub fn open(
        name: impl Into<String>,
        path: impl AsRef<Path>,
        buffer_bytes: usize,
        writers: &WriterRegistry,
    ) -> Result<Self> {
        let name = name.into();
        let path = path.as_ref().to_path_buf();
        let buffer_bytes = WriterRegistry::validate_buffer_size(buffer_bytes)?;

        let index = if path.join("meta.json").exists() {
            tracing::info!("[{}] opening embedded index at {}", name, path.display());
            Index::open_in_dir(&path)?
        } else {
            std::fs::create_dir_all(&path)?;
            tracing::info!("[{}] creating embedded index at {}", name, path.display());
            Index::create_in_dir(&path, build_schema())?
        };
        let fields = EmbeddedFields::from_schema(&index.schema())?;

        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::Manual)
            .try_into()?;

        let guard = writers.acquire(&name)?;
        let writer = ManagedIndexWriter::new(index.writer(buffer_bytes)?, guard);

        Ok(EmbeddedBackend {
            name,
            path,
            index,
            reader,
            fields,
            writer: Mutex::new(Some(writer)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Documents visible to readers.
    pub fn doc_count(&self) -> u64 {
        self.reader.searcher().num_docs()
    }

    /// Source of the visible document, or `None`.
    pub fn get_document(&self, document_id: &str) -> Result<Option<Value>> {
        let searcher = self.reader.searcher();
        let query = TermQuery::new(
            Term::from_field_text(self.fields.id, document_id),
            IndexRecordOption::Basic,
        );
        let top = searcher.search(&query, &TopDocs::with_limit(1))?;
        let Some((_, address)) = top.into_iter().next() else {
            return Ok(None);
        };
        let doc: TantivyDocument = searcher.doc(address)?;
        Ok(doc.get_first(self.fields.source).map(|v| {
            let owned: OwnedValue = v.into();
            owned_to_json(&owned)
        }))
    }

    /// Visible documents matching the tenant filter, or all of them.
    pub fn count_matching(&self, filter: Option<&TenantFilter>) -> Result<usize> {
        let searcher = self.reader.searcher();
        match filter {
            None => Ok(searcher.num_docs() as usize),
            Some(filter) => Ok(searcher.search(&*self.tenant_query(filter), &Count)?),
        }
    }

    fn tenant_query(&self, filter: &TenantFilter) -> Box<dyn Query> {
        let clauses: Vec<(Occur, Box<dyn Query>)> = filter
            .values()
            .into_iter()
            .map(|tenant| {
                let query: Box<dyn Query> = Box::new(TermQuery::new(
                    Term::from_field_text(self.fields.tenant, tenant),
                    IndexRecordOption::Basic,
                ));
                (Occur::Should, query)
            })
            .collect();
        Box::new(BooleanQuery::new(clauses))
    }

    fn to_tantivy(
        &self,
        document_id: &str,
        routing_key: Option<&str>,
        document: &DocumentPayload,
    ) -> Result<TantivyDocument> {
        let mut doc = TantivyDocument::new();
        doc.add_text(self.fields.id, document_id);
        if let Some(route) = routing_key {
            doc.add_text(self.fields.routing, route);
        }
        if let Some(tenant) = document
            .get(crate::tenancy::TENANT_ID_FIELD)
            .and_then(|v| v.as_text())
        {
            doc.add_text(self.fields.tenant, tenant);
        }
        doc.add_object(self.fields.source, json_to_btree(&document.to_json())?);
        Ok(doc)
    }

    fn closed(&self) -> SearchBindError {
        SearchBindError::illegal_state(format!("Embedded index '{}' is closed", self.name))
    }
}

#[async_trait]
impl IndexBackend for EmbeddedBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn apply(&self, operations: &[BackendOperation]) -> Result<Vec<OperationOutcome>> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or_else(|| self.closed())?;

        let mut outcomes = Vec::with_capacity(operations.len());
        for operation in operations {
            let result: Result<()> = match operation {
                BackendOperation::Add {
                    document_id,
                    routing_key,
                    document,
                } => self
                    .to_tantivy(document_id, routing_key.as_deref(), document)
                    .and_then(|doc| writer.add_document(doc).map(|_| ()).map_err(Into::into)),
                BackendOperation::Update {
                    document_id,
                    routing_key,
                    document,
                    ..
                } => self
                    .to_tantivy(document_id, routing_key.as_deref(), document)
                    .and_then(|doc| {
                        writer.delete_term(Term::from_field_text(self.fields.id, document_id));
                        writer.add_document(doc).map(|_| ()).map_err(Into::into)
                    }),
                BackendOperation::Delete { document_id, .. } => {
                    writer.delete_term(Term::from_field_text(self.fields.id, document_id));
                    Ok(())
                }
                // A delete query is ordered with the uncommitted adds around it,
                // unlike `delete_all_documents`.
                BackendOperation::Purge { filter: None } => writer
                    .delete_query(Box::new(AllQuery))
                    .map(|_| ())
                    .map_err(Into::into),
                BackendOperation::Purge {
                    filter: Some(filter),
                } => writer
                    .delete_query(self.tenant_query(filter))
                    .map(|_| ())
                    .map_err(Into::into),
            };

            match result {
                Ok(()) => outcomes.push(OperationOutcome::Completed),
                Err(e) => {
                    tracing::error!("[{}] embedded write failed: {}", self.name, e);
                    outcomes.push(OperationOutcome::Failed(e.to_string()));
                    break;
                }
            }
        }
        outcomes.resize(operations.len(), OperationOutcome::NotAttempted);
        Ok(outcomes)
    }

    async fn commit(&self) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or_else(|| self.closed())?;
        let opstamp = writer.commit()?;
        tracing::debug!("[{}] committed at opstamp {}", self.name, opstamp);
        Ok(())
    }

    async fn refresh(&self) -> Result<()> {
        self.reader.reload()?;
        Ok(())
    }

    /// Force-merge all segments into one and garbage-collect stale files.
    async fn optimize(&self) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or_else(|| self.closed())?;

        let segment_ids = self.index.searchable_segment_ids()?;
        tracing::info!("[{}] compacting {} segments", self.name, segment_ids.len());
        if segment_ids.len() > 1 {
            writer
                .merge(&segment_ids)
                .wait()
                .map_err(|e| SearchBindError::Tantivy(e.to_string()))?;
        }
        let gc = writer
            .garbage_collect_files()
            .wait()
            .map_err(|e| SearchBindError::Tantivy(e.to_string()))?;
        tracing::info!(
            "[{}] compact done, gc removed {} files",
            self.name,
            gc.deleted_files.len()
        );
        Ok(())
    }

    /// Drops the writer, releasing its registry slot and the directory lock.
    async fn close(&self) -> Result<()> {
        if let Some(writer) = self.writer.lock().await.take() {
            drop(writer);
            tracing::info!("[{}] embedded writer closed", self.name);
        }
        Ok(())
    }
}

fn json_to_btree(value: &Value) -> Result<BTreeMap<String, OwnedValue>> {
    match value {
        Value::Object(map) => Ok(map
            .iter()
            .map(|(k, v)| (k.clone(), json_to_owned(v)))
            .collect()),
        _ => Err(SearchBindError::InvalidDocument(
            "Expected JSON object".to_string(),
        )),
    }
}

fn json_to_owned(value: &Value) -> OwnedValue {
    match value {
        Value::Null => OwnedValue::Null,
        Value::Bool(b) => OwnedValue::Bool(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                OwnedValue::I64(i)
            } else if let Some(u) = n.as_u64() {
                OwnedValue::U64(u)
            } else {
                OwnedValue::F64(n.as_f64().unwrap_or_default())
            }
        }
        Value::String(s) => OwnedValue::Str(s.clone()),
        Value::Array(arr) => OwnedValue::Array(arr.iter().map(json_to_owned).collect()),
        Value::Object(map) => OwnedValue::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), json_to_owned(v)))
                .collect(),
        ),
    }
}

fn owned_to_json(value: &OwnedValue) -> Value {
    match value {
        OwnedValue::Str(s) => Value::String(s.clone()),
        OwnedValue::I64(i) => Value::from(*i),
        OwnedValue::U64(u) => Value::from(*u),
        OwnedValue::F64(f) => serde_json::Number::from_f64(*f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        OwnedValue::Bool(b) => Value::Bool(*b),
        OwnedValue::Array(arr) => Value::Array(arr.iter().map(owned_to_json).collect()),
        OwnedValue::Object(pairs) => {
            let mut map = Map::new();
            for (k, v) in pairs {
                map.insert(k.clone(), owned_to_json(v));
            }
            Value::Object(map)
        }
        _ => Value::Null,
    }
}
