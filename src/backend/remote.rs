//! HTTP search cluster backend speaking the `_bulk` / `_delete_by_query`
//! REST dialect.

use super::{BackendOperation, IndexBackend, OperationOutcome};
use crate::config::ConnectionConfig;
use crate::error::{Result, SearchBindError};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Semaphore;

/// One bulk action line and the operation it belongs to.
struct BulkEntry {
    operation: usize,
    /// Deletes on stale routes may find nothing; a 404 is fine there.
    tolerate_missing: bool,
}

pub struct RemoteBackend {
    name: String,
    client: reqwest::Client,
    uris: Vec<String>,
    next_uri: AtomicUsize,
    username: Option<String>,
    password: Option<String>,
    permits: Semaphore,
}

impl RemoteBackend {
    pub fn new(name: impl Into<String>, config: &ConnectionConfig) -> Result<Self> {
        if config.uris.is_empty() {
            return Err(SearchBindError::config(
                "Remote backend requires at least one URI",
            ));
        }
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(config.connection_timeout)
            .pool_idle_timeout(config.keep_alive)
            .pool_max_idle_per_host(config.max_connections_per_route)
            .tcp_keepalive(config.keep_alive)
            .build()?;

        Ok(RemoteBackend {
            name: name.into(),
            client,
            uris: config.uris.clone(),
            next_uri: AtomicUsize::new(0),
            username: config.username.clone(),
            password: config.password.clone(),
            permits: Semaphore::new(config.max_connections),
        })
    }

    /// Round-robin over the configured endpoints.
    fn url(&self, path: &str) -> String {
        let i = self.next_uri.fetch_add(1, Ordering::Relaxed) % self.uris.len();
        format!("{}/{}{}", self.uris[i], self.name, path)
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let builder = self.client.request(method, self.url(path));
        match &self.username {
            Some(user) => builder.basic_auth(user, self.password.as_deref()),
            None => builder,
        }
    }

    async fn send(&self, builder: reqwest::RequestBuilder, what: &str) -> Result<Value> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| SearchBindError::Backend("connection pool closed".to_string()))?;

        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SearchBindError::Backend(format!(
                "{} on '{}' returned {}: {}",
                what, self.name, status, body
            )));
        }
        let body = response.text().await?;
        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&body)?)
    }

    fn action(&self, kind: &str, document_id: &str, routing_key: Option<&str>) -> Value {
        let mut meta = json!({ "_index": self.name, "_id": document_id });
        if let Some(route) = routing_key {
            meta["routing"] = Value::String(route.to_string());
        }
        json!({ kind: meta })
    }

    /// Send one NDJSON bulk request and fold per-item statuses back onto the
    /// operations they came from.
    async fn send_bulk(
        &self,
        body: String,
        entries: &[BulkEntry],
        outcomes: &mut [OperationOutcome],
    ) -> Result<()> {
        let builder = self
            .request(reqwest::Method::POST, "/_bulk")
            .header(reqwest::header::CONTENT_TYPE, "application/x-ndjson")
            .body(body);
        let response = self.send(builder, "bulk request").await?;

        let items = response
            .get("items")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        for (i, entry) in entries.iter().enumerate() {
            let result = items
                .get(i)
                .and_then(Value::as_object)
                .and_then(|item| item.values().next());
            let failure = match result {
                None => Some("missing bulk item response".to_string()),
                Some(result) => {
                    let status = result.get("status").and_then(Value::as_u64).unwrap_or(0);
                    let ok = (200..300).contains(&status) || (entry.tolerate_missing && status == 404);
                    if ok {
                        None
                    } else {
                        Some(bulk_error_reason(result, status))
                    }
                }
            };
            let slot = &mut outcomes[entry.operation];
            match failure {
                Some(reason) if !matches!(slot, OperationOutcome::Failed(_)) => {
                    *slot = OperationOutcome::Failed(reason);
                }
                None if *slot == OperationOutcome::NotAttempted => {
                    *slot = OperationOutcome::Completed;
                }
                _ => {}
            }
        }
        Ok(())
    }
}

fn bulk_error_reason(result: &Value, status: u64) -> String {
    let error = result.get("error");
    let reason = error
        .and_then(|e| e.get("reason"))
        .and_then(Value::as_str)
        .or_else(|| error.and_then(Value::as_str))
        .unwrap_or("unknown error");
    format!("status {}: {}", status, reason)
}

#[async_trait]
impl IndexBackend for RemoteBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn apply(&self, operations: &[BackendOperation]) -> Result<Vec<OperationOutcome>> {
        let mut outcomes = vec![OperationOutcome::NotAttempted; operations.len()];
        let mut body = String::new();
        let mut entries: Vec<BulkEntry> = Vec::new();

        for (i, operation) in operations.iter().enumerate() {
            match operation {
                BackendOperation::Add {
                    document_id,
                    routing_key,
                    document,
                } => {
                    push_line(&mut body, &self.action("index", document_id, routing_key.as_deref()));
                    push_line(&mut body, &document.to_json());
                    entries.push(BulkEntry {
                        operation: i,
                        tolerate_missing: false,
                    });
                }
                BackendOperation::Update {
                    document_id,
                    routing_key,
                    stale_routing_keys,
                    document,
                } => {
                    for stale in stale_routing_keys {
                        tracing::warn!(
                            "[{}] deleting {} from stale route '{}'",
                            self.name,
                            document_id,
                            stale
                        );
                        push_line(&mut body, &self.action("delete", document_id, Some(stale)));
                        entries.push(BulkEntry {
                            operation: i,
                            tolerate_missing: true,
                        });
                    }
                    push_line(&mut body, &self.action("index", document_id, routing_key.as_deref()));
                    push_line(&mut body, &document.to_json());
                    entries.push(BulkEntry {
                        operation: i,
                        tolerate_missing: false,
                    });
                }
                BackendOperation::Delete {
                    document_id,
                    routing_keys,
                } => {
                    for route in routing_keys {
                        push_line(&mut body, &self.action("delete", document_id, route.as_deref()));
                        entries.push(BulkEntry {
                            operation: i,
                            tolerate_missing: true,
                        });
                    }
                }
                BackendOperation::Purge { filter } => {
                    if !entries.is_empty() {
                        self.send_bulk(std::mem::take(&mut body), &entries, &mut outcomes)
                            .await?;
                        entries.clear();
                        if outcomes[..i].iter().any(|o| !o.is_completed()) {
                            return Ok(outcomes);
                        }
                    }
                    let query = match filter {
                        Some(filter) => json!({ "query": filter.to_query_json() }),
                        None => json!({ "query": { "match_all": {} } }),
                    };
                    // Delete-by-query only sees searchable documents, so earlier
                    // bulk writes must be refreshed first.
                    let purged = match self.refresh().await {
                        Ok(()) => {
                            let builder = self
                                .request(
                                    reqwest::Method::POST,
                                    "/_delete_by_query?conflicts=proceed",
                                )
                                .json(&query);
                            self.send(builder, "delete by query").await
                        }
                        Err(e) => Err(e),
                    };
                    match purged {
                        Ok(_) => outcomes[i] = OperationOutcome::Completed,
                        Err(e) => {
                            outcomes[i] = OperationOutcome::Failed(e.to_string());
                            return Ok(outcomes);
                        }
                    }
                }
            }
        }

        if !entries.is_empty() {
            self.send_bulk(body, &entries, &mut outcomes).await?;
        }
        Ok(outcomes)
    }

    /// Bulk responses are acknowledged by the cluster's translog.
    async fn commit(&self) -> Result<()> {
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        self.send(self.request(reqwest::Method::POST, "/_flush"), "flush")
            .await
            .map(|_| ())
    }

    async fn refresh(&self) -> Result<()> {
        self.send(self.request(reqwest::Method::POST, "/_refresh"), "refresh")
            .await
            .map(|_| ())
    }

    async fn optimize(&self) -> Result<()> {
        self.send(
            self.request(reqwest::Method::POST, "/_forcemerge?max_num_segments=1"),
            "force merge",
        )
        .await
        .map(|_| ())
    }
}

fn push_line(body: &mut String, value: &Value) {
    body.push_str(&value.to_string());
    body.push('\n');
}
