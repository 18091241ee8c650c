//! Synchronization strategies: how long the caller of a unit of work waits.

use crate::error::{Result, SearchBindError};
use crate::index::manager::WorkFuture;
use crate::work::BatchResult;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Whether the executor must make committed work visible to readers before
/// completing a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RefreshPolicy {
    #[default]
    None,
    AfterCommit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SynchronizationStrategy {
    /// Return as soon as the work is queued in-process.
    Async,
    /// Wait until the backend acknowledged the commit.
    #[default]
    Sync,
    /// Wait until the commit is acknowledged and visible to queries.
    ReadYourWrites,
}

impl SynchronizationStrategy {
    pub fn refresh_policy(self) -> RefreshPolicy {
        match self {
            SynchronizationStrategy::ReadYourWrites => RefreshPolicy::AfterCommit,
            SynchronizationStrategy::Async | SynchronizationStrategy::Sync => RefreshPolicy::None,
        }
    }

    pub fn blocks_caller(self) -> bool {
        !matches!(self, SynchronizationStrategy::Async)
    }

    /// Apply the strategy to a submitted unit of work.
    ///
    /// Async drops the future and returns `Ok(None)`; failures still reach the
    /// index's failure handler. Blocking strategies wait at most `timeout`; on
    /// expiry the outcome is unknown and [`SearchBindError::Timeout`] is
    /// returned.
    pub async fn synchronize(
        self,
        future: WorkFuture,
        timeout: Duration,
    ) -> Result<Option<BatchResult>> {
        if !self.blocks_caller() {
            tracing::debug!(
                "[{}] async plan queued, not waiting for completion",
                future.index_name()
            );
            return Ok(None);
        }
        future.wait_timeout(timeout).await.map(Some)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SynchronizationStrategy::Async => "async",
            SynchronizationStrategy::Sync => "write-sync",
            SynchronizationStrategy::ReadYourWrites => "read-sync",
        }
    }
}

impl fmt::Display for SynchronizationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SynchronizationStrategy {
    type Err = SearchBindError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "async" => Ok(SynchronizationStrategy::Async),
            "sync" | "write-sync" => Ok(SynchronizationStrategy::Sync),
            "read-sync" | "read-your-writes" => Ok(SynchronizationStrategy::ReadYourWrites),
            other => Err(SearchBindError::config(format!(
                "Unknown synchronization strategy '{}' (expected async, write-sync or read-sync)",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::work::WorkItem;

    #[test]
    fn test_parse_names_and_aliases() {
        assert_eq!(
            "async".parse::<SynchronizationStrategy>().unwrap(),
            SynchronizationStrategy::Async
        );
        assert_eq!(
            "sync".parse::<SynchronizationStrategy>().unwrap(),
            SynchronizationStrategy::Sync
        );
        assert_eq!(
            "Read-Your-Writes".parse::<SynchronizationStrategy>().unwrap(),
            SynchronizationStrategy::ReadYourWrites
        );
        assert!("eventually".parse::<SynchronizationStrategy>().is_err());
    }

    #[test]
    fn test_only_read_sync_refreshes() {
        assert_eq!(
            SynchronizationStrategy::ReadYourWrites.refresh_policy(),
            RefreshPolicy::AfterCommit
        );
        assert_eq!(
            SynchronizationStrategy::Sync.refresh_policy(),
            RefreshPolicy::None
        );
    }

    #[tokio::test]
    async fn test_async_does_not_wait() {
        let (_completer, future) = WorkFuture::channel("books");
        let outcome = SynchronizationStrategy::Async
            .synchronize(future, Duration::from_millis(10))
            .await
            .unwrap();
        assert!(outcome.is_none());
    }

    #[tokio::test]
    async fn test_sync_times_out_with_ambiguous_error() {
        let (_completer, future) = WorkFuture::channel("books");
        let err = SynchronizationStrategy::Sync
            .synchronize(future, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(err.is_ambiguous());
    }

    #[tokio::test]
    async fn test_sync_returns_result() {
        let item = WorkItem::purge_all("Book", None);
        let future = WorkFuture::ready("books", Ok(BatchResult::success(vec![item.clone()])));
        let outcome = SynchronizationStrategy::Sync
            .synchronize(future, Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome.succeeded, vec![item]);
    }
}
