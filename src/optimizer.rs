//! Automatic index compaction policies.

use crate::backend::IndexBackend;
use crate::config::OptimizerConfig;
use crate::error::Result;
use async_trait::async_trait;
use std::fmt::Debug;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OptimizerCounters {
    pub operations: u64,
    pub transactions: u64,
}

#[async_trait]
pub trait OptimizerStrategy: Send + Sync + Debug {
    /// Count one committed transaction of `operation_count` operations.
    fn record_transaction(&self, operation_count: u64);

    fn needs_optimization(&self) -> bool;

    /// Optimize now, resetting the counters.
    async fn optimize(&self, backend: &dyn IndexBackend) -> Result<()>;

    /// Optimize if a threshold is reached. Returns whether it fired.
    async fn maybe_optimize(&self, backend: &dyn IndexBackend) -> Result<bool>;

    fn force_reset(&self);

    fn counters(&self) -> OptimizerCounters;
}

pub fn optimizer_from_config(config: &OptimizerConfig) -> Arc<dyn OptimizerStrategy> {
    if config.is_enabled() {
        Arc::new(IncrementalOptimizer::new(
            config.operation_limit,
            config.transaction_limit,
        ))
    } else {
        Arc::new(NoOpOptimizer)
    }
}

/// Fires once either counter reaches its threshold. Check and reset happen
/// under one lock, so a concurrent `record_transaction` lands either before
/// the reset (and is absorbed by it) or after it (and counts toward the next
/// round).
#[derive(Debug)]
pub struct IncrementalOptimizer {
    operation_threshold: Option<u64>,
    transaction_threshold: Option<u64>,
    counters: Mutex<OptimizerCounters>,
}

impl IncrementalOptimizer {
    pub fn new(operation_threshold: Option<u64>, transaction_threshold: Option<u64>) -> Self {
        IncrementalOptimizer {
            operation_threshold,
            transaction_threshold,
            counters: Mutex::new(OptimizerCounters::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, OptimizerCounters> {
        self.counters.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn exceeded(&self, counters: &OptimizerCounters) -> bool {
        let ops = self
            .operation_threshold
            .is_some_and(|limit| counters.operations >= limit);
        let txs = self
            .transaction_threshold
            .is_some_and(|limit| counters.transactions >= limit);
        ops || txs
    }

    /// Reset and report whether a threshold was reached, atomically.
    fn take_if_exceeded(&self) -> bool {
        let mut counters = self.lock();
        if self.exceeded(&counters) {
            *counters = OptimizerCounters::default();
            true
        } else {
            false
        }
    }
}

#[async_trait]
impl OptimizerStrategy for IncrementalOptimizer {
    fn record_transaction(&self, operation_count: u64) {
        let mut counters = self.lock();
        counters.operations += operation_count;
        counters.transactions += 1;
    }

    fn needs_optimization(&self) -> bool {
        self.exceeded(&self.lock())
    }

    async fn optimize(&self, backend: &dyn IndexBackend) -> Result<()> {
        self.force_reset();
        backend.optimize().await
    }

    async fn maybe_optimize(&self, backend: &dyn IndexBackend) -> Result<bool> {
        if !self.take_if_exceeded() {
            return Ok(false);
        }
        tracing::info!("[{}] optimizer threshold reached, optimizing", backend.name());
        backend.optimize().await?;
        Ok(true)
    }

    fn force_reset(&self) {
        *self.lock() = OptimizerCounters::default();
    }

    fn counters(&self) -> OptimizerCounters {
        *self.lock()
    }
}

/// Never optimizes on its own.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpOptimizer;

#[async_trait]
impl OptimizerStrategy for NoOpOptimizer {
    fn record_transaction(&self, _operation_count: u64) {}

    fn needs_optimization(&self) -> bool {
        false
    }

    async fn optimize(&self, _backend: &dyn IndexBackend) -> Result<()> {
        Ok(())
    }

    async fn maybe_optimize(&self, _backend: &dyn IndexBackend) -> Result<bool> {
        Ok(false)
    }

    fn force_reset(&self) {}

    fn counters(&self) -> OptimizerCounters {
        OptimizerCounters::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;

    #[tokio::test]
    async fn test_fires_on_operation_threshold() {
        let backend = InMemoryBackend::new("books");
        let optimizer = IncrementalOptimizer::new(Some(10), None);

        optimizer.record_transaction(4);
        assert!(!optimizer.maybe_optimize(&backend).await.unwrap());
        optimizer.record_transaction(6);
        assert!(optimizer.needs_optimization());
        assert!(optimizer.maybe_optimize(&backend).await.unwrap());

        assert_eq!(backend.optimize_count(), 1);
        assert_eq!(optimizer.counters(), OptimizerCounters::default());
        assert!(!optimizer.maybe_optimize(&backend).await.unwrap());
    }

    #[tokio::test]
    async fn test_fires_on_transaction_threshold() {
        let backend = InMemoryBackend::new("books");
        let optimizer = IncrementalOptimizer::new(None, Some(2));
        optimizer.record_transaction(0);
        assert!(!optimizer.needs_optimization());
        optimizer.record_transaction(0);
        assert!(optimizer.maybe_optimize(&backend).await.unwrap());
    }

    #[tokio::test]
    async fn test_disabled_thresholds_never_fire() {
        let backend = InMemoryBackend::new("books");
        let optimizer = IncrementalOptimizer::new(None, None);
        for _ in 0..100 {
            optimizer.record_transaction(1000);
        }
        assert!(!optimizer.maybe_optimize(&backend).await.unwrap());
        assert_eq!(backend.optimize_count(), 0);
    }

    #[tokio::test]
    async fn test_noop_and_config_selection() {
        let backend = InMemoryBackend::new("books");
        NoOpOptimizer.record_transaction(1_000_000);
        assert!(!NoOpOptimizer.maybe_optimize(&backend).await.unwrap());
        NoOpOptimizer.optimize(&backend).await.unwrap();
        assert_eq!(backend.optimize_count(), 0);

        let chosen = optimizer_from_config(&OptimizerConfig {
            operation_limit: Some(1),
            transaction_limit: None,
        });
        chosen.record_transaction(1);
        assert!(chosen.needs_optimization());
    }

    #[test]
    fn test_concurrent_records_fire_at_most_once_per_threshold() {
        let optimizer = Arc::new(IncrementalOptimizer::new(Some(100), None));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let optimizer = Arc::clone(&optimizer);
                std::thread::spawn(move || {
                    let mut fired = 0;
                    for _ in 0..100 {
                        optimizer.record_transaction(1);
                        if optimizer.take_if_exceeded() {
                            fired += 1;
                        }
                    }
                    fired
                })
            })
            .collect();
        let fired: u64 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert!((1..=8).contains(&fired));
        assert!(optimizer.counters().operations < 100);
        assert!(!optimizer.needs_optimization());
    }
}
