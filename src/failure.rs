//! Partial batch failure reporting.

use crate::error::SearchBindError;
use crate::work::WorkItem;
use serde::Serialize;

/// What went wrong in one failed submission.
///
/// `operation_at_fault` is the first submitted operation (in submission order)
/// that did not complete; `failing_operations` are the other incomplete
/// operations, still in submission order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorContext {
    pub index_name: String,
    pub cause: String,
    pub operation_at_fault: Option<WorkItem>,
    pub failing_operations: Vec<WorkItem>,
}

impl ErrorContext {
    pub fn builder(index_name: impl Into<String>) -> ErrorContextBuilder {
        ErrorContextBuilder::new(index_name)
    }

    /// Build from per-item completion flags, `completed[i]` describing
    /// `submitted[i]`. Missing flags count as not completed.
    pub fn from_completion(
        index_name: impl Into<String>,
        cause: impl Into<String>,
        submitted: &[WorkItem],
        completed: &[bool],
    ) -> Self {
        let mut incomplete = submitted
            .iter()
            .enumerate()
            .filter(|(i, _)| !completed.get(*i).copied().unwrap_or(false))
            .map(|(_, item)| item.clone());

        let operation_at_fault = incomplete.next();
        let failing_operations = incomplete.collect();

        ErrorContext {
            index_name: index_name.into(),
            cause: cause.into(),
            operation_at_fault,
            failing_operations,
        }
    }

    /// Every operation that did not complete, fault first.
    pub fn all_failing(&self) -> impl Iterator<Item = &WorkItem> {
        self.operation_at_fault
            .iter()
            .chain(self.failing_operations.iter())
    }

    /// Incomplete operations that a generic retry policy may replay.
    pub fn retryable_operations(&self) -> Vec<WorkItem> {
        self.all_failing()
            .filter(|item| item.safe_to_retry())
            .cloned()
            .collect()
    }

    pub fn into_error(self) -> SearchBindError {
        SearchBindError::BatchFailure(Box::new(self))
    }
}

pub struct ErrorContextBuilder {
    index_name: String,
    cause: Option<String>,
    submitted: Vec<WorkItem>,
    completed: Vec<WorkItem>,
}

impl ErrorContextBuilder {
    pub fn new(index_name: impl Into<String>) -> Self {
        ErrorContextBuilder {
            index_name: index_name.into(),
            cause: None,
            submitted: Vec::new(),
            completed: Vec::new(),
        }
    }

    pub fn cause(mut self, cause: impl std::fmt::Display) -> Self {
        self.cause = Some(cause.to_string());
        self
    }

    pub fn all_work_to_be_done(mut self, submitted: impl IntoIterator<Item = WorkItem>) -> Self {
        self.submitted.extend(submitted);
        self
    }

    pub fn work_completed(mut self, item: WorkItem) -> Self {
        self.completed.push(item);
        self
    }

    pub fn works_completed(mut self, items: impl IntoIterator<Item = WorkItem>) -> Self {
        self.completed.extend(items);
        self
    }

    /// Completed items are matched against submitted ones as a multiset, so
    /// two identical submitted items need two completions.
    pub fn build(self) -> ErrorContext {
        let mut unmatched: Vec<&WorkItem> = self.completed.iter().collect();
        let flags: Vec<bool> = self
            .submitted
            .iter()
            .map(|item| match unmatched.iter().position(|c| *c == item) {
                Some(pos) => {
                    unmatched.swap_remove(pos);
                    true
                }
                None => false,
            })
            .collect();

        ErrorContext::from_completion(
            self.index_name,
            self.cause.unwrap_or_else(|| "unknown failure".to_string()),
            &self.submitted,
            &flags,
        )
    }
}

/// Receives every failure the engine observes, including those of
/// asynchronous plans nobody awaits.
pub trait FailureHandler: Send + Sync {
    fn handle(&self, context: &ErrorContext);

    fn handle_error(&self, index_name: &str, error: &SearchBindError) {
        match error.error_context() {
            Some(ctx) => self.handle(ctx),
            None => tracing::error!("[{}] indexing failed: {}", index_name, error),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingFailureHandler;

impl FailureHandler for LoggingFailureHandler {
    fn handle(&self, context: &ErrorContext) {
        let fault = context
            .operation_at_fault
            .as_ref()
            .map(|op| op.describe())
            .unwrap_or_else(|| "<none>".to_string());
        let failing: Vec<String> = context
            .failing_operations
            .iter()
            .map(|op| op.describe())
            .collect();
        tracing::error!(
            "[{}] indexing failure: {} (at fault: {}; also failed: [{}])",
            context.index_name,
            context.cause,
            fault,
            failing.join(", ")
        );
    }
}
