use crate::backend::IndexBackend;
use crate::config::QueueConfig;
use crate::error::{Result, SearchBindError};
use crate::failure::FailureHandler;
use crate::index::write_queue::{create_write_queue, Submission, WorkerContext, WriteQueue};
use crate::optimizer::OptimizerStrategy;
use crate::sync::RefreshPolicy;
use crate::tenancy::MultiTenancyStrategy;
use crate::work::BatchResult;
use crate::work::WorkItem;
use serde::Serialize;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{mpsc::error::TrySendError, oneshot};
use tokio::task::JoinHandle;

/// Completion of one submission.
///
/// Awaiting it yields `Ok` only if every item succeeded; a partial failure
/// resolves to [`SearchBindError::BatchFailure`]. [`WorkFuture::outcome`]
/// returns the raw [`BatchResult`] instead.
#[derive(Debug)]
pub struct WorkFuture {
    index_name: String,
    rx: oneshot::Receiver<Result<BatchResult>>,
}

/// Sending half of a [`WorkFuture`].
pub struct WorkCompleter {
    tx: oneshot::Sender<Result<BatchResult>>,
}

impl WorkCompleter {
    pub fn complete(self, result: Result<BatchResult>) {
        // The caller may have stopped waiting (async plans, timeouts).
        let _ = self.tx.send(result);
    }
}

impl WorkFuture {
    pub fn channel(index_name: impl Into<String>) -> (WorkCompleter, WorkFuture) {
        let (tx, rx) = oneshot::channel();
        (
            WorkCompleter { tx },
            WorkFuture {
                index_name: index_name.into(),
                rx,
            },
        )
    }

    /// A future that is already complete.
    pub fn ready(index_name: impl Into<String>, result: Result<BatchResult>) -> WorkFuture {
        let (completer, future) = Self::channel(index_name);
        completer.complete(result);
        future
    }

    pub fn index_name(&self) -> &str {
        &self.index_name
    }

    /// The submission's result without turning partial failures into errors.
    pub async fn outcome(self) -> Result<BatchResult> {
        let index_name = self.index_name;
        self.rx
            .await
            .map_err(|_| SearchBindError::WorkerStopped(index_name))?
    }

    /// Wait at most `timeout`. Expiry leaves the work's fate unknown.
    pub async fn wait_timeout(self, timeout: Duration) -> Result<BatchResult> {
        let index = self.index_name.clone();
        match tokio::time::timeout(timeout, self).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!("[{}] gave up waiting after {:?}", index, timeout);
                Err(SearchBindError::Timeout {
                    index,
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }
}

impl Future for WorkFuture {
    type Output = Result<BatchResult>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        match Pin::new(&mut this.rx).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(result)) => Poll::Ready(result.and_then(BatchResult::into_result)),
            Poll::Ready(Err(_)) => {
                Poll::Ready(Err(SearchBindError::WorkerStopped(this.index_name.clone())))
            }
        }
    }
}

/// Accepts resolved work for one index. `submit` never blocks: it either
/// queues the work or fails immediately.
pub trait WorkExecutor: Send + Sync {
    fn index_name(&self) -> &str;

    fn submit(
        &self,
        tenant_id: Option<&str>,
        work: Vec<WorkItem>,
        refresh: RefreshPolicy,
    ) -> Result<WorkFuture>;
}

#[derive(Default)]
pub(crate) struct WorkerStats {
    pub submitted: AtomicU64,
    pub succeeded: AtomicU64,
    pub failed: AtomicU64,
    pub pending: AtomicU64,
    pub batches: AtomicU64,
    pub optimizations: AtomicU64,
}

/// Submission counters of one index.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IndexStats {
    pub submitted: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub pending: u64,
    pub batches: u64,
    pub optimizations: u64,
}

/// Owns the single writer task of one index.
///
/// All submissions for the index go through one bounded channel to one
/// worker, so work reaches the backend in submission order.
pub struct IndexManager {
    name: String,
    backend: Arc<dyn IndexBackend>,
    tenancy: Arc<dyn MultiTenancyStrategy>,
    optimizer: Arc<dyn OptimizerStrategy>,
    capacity: usize,
    queue: RwLock<Option<WriteQueue>>,
    worker: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    stats: Arc<WorkerStats>,
}

impl std::fmt::Debug for IndexManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexManager")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

impl IndexManager {
    /// Spawn the worker. Must be called from within a tokio runtime.
    pub fn start(
        name: impl Into<String>,
        backend: Arc<dyn IndexBackend>,
        tenancy: Arc<dyn MultiTenancyStrategy>,
        optimizer: Arc<dyn OptimizerStrategy>,
        failure_handler: Arc<dyn FailureHandler>,
        queue: &QueueConfig,
    ) -> Arc<Self> {
        let name = name.into();
        let stats = Arc::new(WorkerStats::default());
        let context = WorkerContext {
            index_name: name.clone(),
            backend: Arc::clone(&backend),
            tenancy: Arc::clone(&tenancy),
            optimizer: Arc::clone(&optimizer),
            failure_handler,
            stats: Arc::clone(&stats),
            batch_size: queue.batch_size,
            commit_interval: queue.commit_interval,
        };
        let (tx, handle) = create_write_queue(context, queue.capacity);

        Arc::new(IndexManager {
            name,
            backend,
            tenancy,
            optimizer,
            capacity: queue.capacity,
            queue: RwLock::new(Some(tx)),
            worker: tokio::sync::Mutex::new(Some(handle)),
            stats,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn backend(&self) -> &Arc<dyn IndexBackend> {
        &self.backend
    }

    pub fn tenancy(&self) -> &Arc<dyn MultiTenancyStrategy> {
        &self.tenancy
    }

    pub fn optimizer(&self) -> &Arc<dyn OptimizerStrategy> {
        &self.optimizer
    }

    pub fn stats(&self) -> IndexStats {
        let load = |counter: &AtomicU64| counter.load(Ordering::SeqCst);
        IndexStats {
            submitted: load(&self.stats.submitted),
            succeeded: load(&self.stats.succeeded),
            failed: load(&self.stats.failed),
            pending: load(&self.stats.pending),
            batches: load(&self.stats.batches),
            optimizations: load(&self.stats.optimizations),
        }
    }

    pub fn is_running(&self) -> bool {
        self.queue
            .read()
            .map(|q| q.as_ref().is_some_and(|tx| !tx.is_closed()))
            .unwrap_or(false)
    }

    /// Stop accepting work, let the worker flush what is queued, then close
    /// the backend.
    pub async fn shutdown(&self) -> Result<()> {
        let sender = match self.queue.write() {
            Ok(mut queue) => queue.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        drop(sender);

        if let Some(handle) = self.worker.lock().await.take() {
            if let Err(e) = handle.await {
                tracing::error!("[WQ {}] worker task failed: {}", self.name, e);
                return Err(SearchBindError::WorkerStopped(self.name.clone()));
            }
        }
        self.backend.close().await?;
        tracing::info!("[WQ {}] shut down", self.name);
        Ok(())
    }

    fn check_submission(&self, tenant_id: Option<&str>, work: &[WorkItem]) -> Result<()> {
        self.tenancy
            .check_tenant_id(tenant_id, &format!("submission to index '{}'", self.name))?;
        for item in work {
            item.validate()?;
            if item.tenant_id() != tenant_id {
                return Err(SearchBindError::illegal_state(format!(
                    "{} belongs to tenant {:?} but was submitted for tenant {:?}",
                    item.describe(),
                    item.tenant_id(),
                    tenant_id
                )));
            }
        }
        Ok(())
    }
}

impl WorkExecutor for IndexManager {
    fn index_name(&self) -> &str {
        &self.name
    }

    fn submit(
        &self,
        tenant_id: Option<&str>,
        work: Vec<WorkItem>,
        refresh: RefreshPolicy,
    ) -> Result<WorkFuture> {
        self.check_submission(tenant_id, &work)?;
        if work.is_empty() {
            return Ok(WorkFuture::ready(&self.name, Ok(BatchResult::default())));
        }

        let sender = self
            .queue
            .read()
            .ok()
            .and_then(|q| q.as_ref().cloned())
            .ok_or_else(|| SearchBindError::WorkerStopped(self.name.clone()))?;

        let (completer, future) = WorkFuture::channel(&self.name);
        let submission = Submission {
            id: uuid::Uuid::new_v4(),
            tenant_id: tenant_id.map(str::to_string),
            work,
            refresh,
            completer,
        };

        // Count before sending so the worker never decrements first.
        self.stats.pending.fetch_add(1, Ordering::SeqCst);
        match sender.try_send(submission) {
            Ok(()) => {
                self.stats.submitted.fetch_add(1, Ordering::SeqCst);
                Ok(future)
            }
            Err(TrySendError::Full(_)) => {
                self.stats.pending.fetch_sub(1, Ordering::SeqCst);
                tracing::warn!(
                    "[WQ {}] queue full, rejecting submission ({} pending)",
                    self.name,
                    self.capacity
                );
                Err(SearchBindError::QueueFull {
                    index: self.name.clone(),
                    capacity: self.capacity,
                })
            }
            Err(TrySendError::Closed(_)) => {
                self.stats.pending.fetch_sub(1, Ordering::SeqCst);
                Err(SearchBindError::WorkerStopped(self.name.clone()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;
    use crate::failure::{ErrorContext, LoggingFailureHandler};
    use crate::optimizer::NoOpOptimizer;
    use crate::tenancy::{DiscriminatorMultiTenancy, NoMultiTenancy};
    use crate::types::DocumentPayload;

    fn add(tenant: Option<&str>, id: &str) -> WorkItem {
        WorkItem::add("Book", tenant.map(str::to_string), id, None, DocumentPayload::new())
    }

    fn start(tenancy: Arc<dyn MultiTenancyStrategy>) -> (Arc<IndexManager>, Arc<InMemoryBackend>) {
        let backend = Arc::new(InMemoryBackend::new("books"));
        let manager = IndexManager::start(
            "books",
            backend.clone(),
            tenancy,
            Arc::new(NoOpOptimizer),
            Arc::new(LoggingFailureHandler),
            &QueueConfig::default(),
        );
        (manager, backend)
    }

    #[tokio::test]
    async fn test_future_maps_partial_failure_to_error() {
        let item = add(None, "1");
        let ctx = ErrorContext::from_completion("books", "boom", &[item.clone()], &[false]);
        let result = BatchResult {
            succeeded: vec![],
            failed: Some(ctx),
        };

        let err = WorkFuture::ready("books", Ok(result.clone())).await.unwrap_err();
        assert!(matches!(err, SearchBindError::BatchFailure(_)));

        let raw = WorkFuture::ready("books", Ok(result)).outcome().await.unwrap();
        assert_eq!(raw.failed.unwrap().operation_at_fault, Some(item));
    }

    #[tokio::test]
    async fn test_dropped_completer_means_worker_stopped() {
        let (completer, future) = WorkFuture::channel("books");
        drop(completer);
        assert!(matches!(
            future.await.unwrap_err(),
            SearchBindError::WorkerStopped(_)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_timeout_expires() {
        let (_completer, future) = WorkFuture::channel("books");
        let err = future
            .wait_timeout(Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, SearchBindError::Timeout { timeout_ms: 10, .. }));
    }

    #[tokio::test]
    async fn test_submit_checks_tenants() {
        let (manager, _) = start(Arc::new(DiscriminatorMultiTenancy::default()));
        assert!(manager
            .submit(None, vec![add(None, "1")], RefreshPolicy::None)
            .unwrap_err()
            .is_fatal());
        assert!(matches!(
            manager
                .submit(Some("t1"), vec![add(Some("t2"), "1")], RefreshPolicy::None)
                .unwrap_err(),
            SearchBindError::IllegalState(_)
        ));
        manager
            .submit(Some("t1"), vec![add(Some("t1"), "1")], RefreshPolicy::None)
            .unwrap()
            .await
            .unwrap();
        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_empty_submission_completes_immediately() {
        let (manager, backend) = start(Arc::new(NoMultiTenancy));
        let result = manager
            .submit(None, vec![], RefreshPolicy::AfterCommit)
            .unwrap()
            .await
            .unwrap();
        assert!(result.succeeded.is_empty());
        assert_eq!(manager.stats().submitted, 0);
        assert_eq!(backend.commit_count(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_flushes_and_stops() {
        let (manager, backend) = start(Arc::new(NoMultiTenancy));
        let future = manager
            .submit(None, vec![add(None, "1")], RefreshPolicy::None)
            .unwrap();
        manager.shutdown().await.unwrap();
        future.await.unwrap();

        assert!(backend.committed_document("1").is_some());
        assert!(!manager.is_running());
        assert_eq!(manager.stats().pending, 0);
    }
}
