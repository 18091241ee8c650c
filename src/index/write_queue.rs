//! Per-index write worker with hybrid batching.
//!
//! Submissions accumulate until either `batch_size` operations are pending,
//! the commit interval elapses, or a submission carries Flush/Optimize work.
//! Each batch is applied in submission order and committed once.

use crate::backend::{BackendOperation, IndexBackend, OperationOutcome};
use crate::failure::{ErrorContext, FailureHandler};
use crate::index::manager::{WorkCompleter, WorkerStats};
use crate::optimizer::OptimizerStrategy;
use crate::sync::RefreshPolicy;
use crate::tenancy::MultiTenancyStrategy;
use crate::types::TenantId;
use crate::work::{BatchResult, WorkItem, WorkType};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant};
use uuid::Uuid;

pub(crate) struct Submission {
    pub id: Uuid,
    pub tenant_id: Option<TenantId>,
    pub work: Vec<WorkItem>,
    pub refresh: RefreshPolicy,
    pub completer: WorkCompleter,
}

impl Submission {
    fn forces_flush(&self) -> bool {
        self.work
            .iter()
            .any(|w| matches!(w.work_type(), WorkType::Flush | WorkType::Optimize))
    }
}

pub(crate) type WriteQueue = mpsc::Sender<Submission>;

pub(crate) struct WorkerContext {
    pub index_name: String,
    pub backend: Arc<dyn IndexBackend>,
    pub tenancy: Arc<dyn MultiTenancyStrategy>,
    pub optimizer: Arc<dyn OptimizerStrategy>,
    pub failure_handler: Arc<dyn FailureHandler>,
    pub stats: Arc<WorkerStats>,
    pub batch_size: usize,
    pub commit_interval: Duration,
}

pub(crate) fn create_write_queue(
    ctx: WorkerContext,
    capacity: usize,
) -> (WriteQueue, tokio::task::JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(capacity);
    let handle = tokio::spawn(async move { process_writes(ctx, rx).await });
    (tx, handle)
}

async fn process_writes(ctx: WorkerContext, mut rx: mpsc::Receiver<Submission>) {
    tracing::info!(
        "[WQ {}] write queue started (batch_size={}, interval={:?})",
        ctx.index_name,
        ctx.batch_size,
        ctx.commit_interval
    );

    let mut pending: Vec<Submission> = Vec::new();
    let mut pending_ops = 0usize;
    let mut deadline = Instant::now() + ctx.commit_interval;

    loop {
        match timeout_at(deadline, rx.recv()).await {
            Ok(Some(submission)) => {
                tracing::trace!(
                    "[WQ {}] received submission {} ops={} tenant={:?}",
                    ctx.index_name,
                    submission.id,
                    submission.work.len(),
                    submission.tenant_id
                );
                let forces_flush = submission.forces_flush();
                pending_ops += submission.work.len();
                pending.push(submission);

                if forces_flush || pending_ops >= ctx.batch_size {
                    tracing::debug!(
                        "[WQ {}] {}, committing {} ops",
                        ctx.index_name,
                        if forces_flush { "flush requested" } else { "batch threshold" },
                        pending_ops
                    );
                    commit_batch(&ctx, &mut pending).await;
                    pending_ops = 0;
                    deadline = Instant::now() + ctx.commit_interval;
                }
            }
            Ok(None) => {
                tracing::info!(
                    "[WQ {}] channel closed, flushing {} pending",
                    ctx.index_name,
                    pending.len()
                );
                if !pending.is_empty() {
                    commit_batch(&ctx, &mut pending).await;
                }
                break;
            }
            Err(_timeout) => {
                if !pending.is_empty() {
                    tracing::debug!(
                        "[WQ {}] interval elapsed, flushing {} pending",
                        ctx.index_name,
                        pending.len()
                    );
                    commit_batch(&ctx, &mut pending).await;
                    pending_ops = 0;
                }
                deadline = Instant::now() + ctx.commit_interval;
            }
        }
    }
    tracing::info!("[WQ {}] write queue stopped", ctx.index_name);
}

/// Per-item completion flags of one submission, plus the cause of the first
/// failure if any.
struct Applied {
    completed: Vec<bool>,
    failure: Option<String>,
}

async fn commit_batch(ctx: &WorkerContext, pending: &mut Vec<Submission>) {
    let submissions: Vec<Submission> = pending.drain(..).collect();
    tracing::debug!(
        "[WQ {}] commit_batch: {} submissions",
        ctx.index_name,
        submissions.len()
    );

    let mut staged = Vec::with_capacity(submissions.len());
    for submission in submissions {
        let applied = apply_submission(ctx, &submission.work).await;
        staged.push((submission, applied));
    }

    let commit = ctx.backend.commit().await;
    if let Err(e) = &commit {
        tracing::error!("[WQ {}] commit error: {}", ctx.index_name, e);
    }

    let wants_refresh = staged
        .iter()
        .any(|(s, _)| s.refresh == RefreshPolicy::AfterCommit);
    let refresh = if commit.is_ok() && wants_refresh {
        ctx.backend.refresh().await
    } else {
        Ok(())
    };
    if let Err(e) = &refresh {
        tracing::error!("[WQ {}] refresh error: {}", ctx.index_name, e);
    }
    ctx.stats.batches.fetch_add(1, Ordering::SeqCst);

    for (submission, applied) in staged {
        ctx.stats.pending.fetch_sub(1, Ordering::SeqCst);

        let failure = match &commit {
            Err(e) => Some((e.to_string(), vec![false; submission.work.len()])),
            Ok(()) => applied.failure.map(|cause| (cause, applied.completed)),
        };

        if let Some((cause, completed)) = failure {
            let context =
                ErrorContext::from_completion(&ctx.index_name, cause, &submission.work, &completed);
            ctx.failure_handler.handle(&context);
            ctx.stats.failed.fetch_add(1, Ordering::SeqCst);

            let succeeded: Vec<WorkItem> = submission
                .work
                .iter()
                .zip(&completed)
                .filter(|(_, done)| **done)
                .map(|(item, _)| item.clone())
                .collect();
            record_transaction(ctx, &succeeded);
            submission.completer.complete(Ok(BatchResult {
                succeeded,
                failed: Some(context),
            }));
            continue;
        }

        if submission.refresh == RefreshPolicy::AfterCommit {
            if let Err(e) = &refresh {
                ctx.failure_handler.handle_error(&ctx.index_name, e);
                ctx.stats.failed.fetch_add(1, Ordering::SeqCst);
                submission.completer.complete(Err(e.clone()));
                continue;
            }
        }

        record_transaction(ctx, &submission.work);
        ctx.stats.succeeded.fetch_add(1, Ordering::SeqCst);
        submission
            .completer
            .complete(Ok(BatchResult::success(submission.work)));
    }

    if commit.is_ok() {
        match ctx.optimizer.maybe_optimize(ctx.backend.as_ref()).await {
            Ok(true) => {
                ctx.stats.optimizations.fetch_add(1, Ordering::SeqCst);
            }
            Ok(false) => {}
            Err(e) => tracing::error!("[WQ {}] automatic optimize failed: {}", ctx.index_name, e),
        }
    }
}

fn record_transaction(ctx: &WorkerContext, completed: &[WorkItem]) {
    let operations = completed
        .iter()
        .filter(|w| !w.work_type().is_index_wide())
        .count();
    ctx.optimizer.record_transaction(operations as u64);
}

/// Apply one submission's work in order, stopping at the first failure so
/// nothing after it runs out of order.
async fn apply_submission(ctx: &WorkerContext, work: &[WorkItem]) -> Applied {
    let mut completed = vec![false; work.len()];
    let mut i = 0;

    while i < work.len() {
        match work[i].work_type() {
            WorkType::Flush => {
                if let Err(e) = ctx.backend.flush().await {
                    return Applied {
                        completed,
                        failure: Some(e.to_string()),
                    };
                }
                completed[i] = true;
                i += 1;
            }
            WorkType::Optimize => {
                if let Err(e) = ctx.backend.optimize().await {
                    return Applied {
                        completed,
                        failure: Some(e.to_string()),
                    };
                }
                ctx.optimizer.force_reset();
                ctx.stats.optimizations.fetch_add(1, Ordering::SeqCst);
                tracing::info!("[WQ {}] explicit optimize done", ctx.index_name);
                completed[i] = true;
                i += 1;
            }
            _ => {
                let start = i;
                while i < work.len()
                    && !matches!(work[i].work_type(), WorkType::Flush | WorkType::Optimize)
                {
                    i += 1;
                }
                let operations: Vec<BackendOperation> = work[start..i]
                    .iter()
                    .filter_map(|item| BackendOperation::from_work(item, ctx.tenancy.as_ref()))
                    .collect();

                let outcomes = match ctx.backend.apply(&operations).await {
                    Ok(outcomes) => outcomes,
                    Err(e) => {
                        tracing::error!("[WQ {}] apply failed: {}", ctx.index_name, e);
                        return Applied {
                            completed,
                            failure: Some(e.to_string()),
                        };
                    }
                };

                let mut failure = None;
                for (offset, flag) in completed[start..i].iter_mut().enumerate() {
                    match outcomes.get(offset) {
                        Some(OperationOutcome::Completed) => *flag = true,
                        Some(OperationOutcome::Failed(cause)) => {
                            failure.get_or_insert_with(|| cause.clone());
                        }
                        Some(OperationOutcome::NotAttempted) | None => {
                            failure.get_or_insert_with(|| "operation not attempted".to_string());
                        }
                    }
                }
                if failure.is_some() {
                    return Applied { completed, failure };
                }
            }
        }
    }

    Applied {
        completed,
        failure: None,
    }
}
