mod common;

use common::{book, harness, harness_with_binding, slow_commit_config, title_of};
use searchbind::{
    BatchResult, DiscriminatorMultiTenancy, EntityBinding, FieldRoutingBridge, IndexingConfig,
    IndexingPlan, RefreshPolicy, SearchBindError, SynchronizationStrategy, WorkExecutor,
    WorkFuture, WorkItem, WorkType,
};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ============================================================
// END TO END AGAINST A MOCK EXECUTOR
// ============================================================

mod mock_executor {
    use super::*;

    #[derive(Default)]
    struct AlwaysSucceeds {
        received: Mutex<Vec<(Option<String>, Vec<WorkItem>)>>,
    }

    impl WorkExecutor for AlwaysSucceeds {
        fn index_name(&self) -> &str {
            "books"
        }

        fn submit(
            &self,
            tenant_id: Option<&str>,
            work: Vec<WorkItem>,
            _refresh: RefreshPolicy,
        ) -> searchbind::Result<WorkFuture> {
            self.received
                .lock()
                .unwrap()
                .push((tenant_id.map(str::to_string), work.clone()));
            Ok(WorkFuture::ready("books", Ok(BatchResult::success(work))))
        }
    }

    #[tokio::test]
    async fn test_single_add_reaches_executor_once() {
        let executor = Arc::new(AlwaysSucceeds::default());
        let mut plan = IndexingPlan::new(
            Arc::new(EntityBinding::new("Book", "books")),
            Arc::new(DiscriminatorMultiTenancy::default()),
            executor.clone(),
            Some("t1"),
        )
        .unwrap();

        let payload = json!({"title": "Dune", "year": 1965});
        plan.add("42", Arc::new(payload.clone())).unwrap();
        plan.prepare().unwrap();
        let result = plan.execute().unwrap().await.unwrap();

        let received = executor.received.lock().unwrap();
        assert_eq!(received.len(), 1);
        let (tenant, work) = &received[0];
        assert_eq!(tenant.as_deref(), Some("t1"));
        assert_eq!(work.len(), 1);
        assert_eq!(work[0].work_type(), WorkType::Add);
        assert_eq!(work[0].tenant_id(), Some("t1"));
        assert_eq!(work[0].document_id(), Some("t1_42"));
        assert_eq!(work[0].payload().unwrap().to_json(), payload);
        assert_eq!(result.succeeded, work.clone());
        assert!(result.failed.is_none());
    }
}

// ============================================================
// COALESCING THROUGH A LIVE INDEX
// ============================================================

mod coalescing {
    use super::*;

    #[tokio::test]
    async fn test_add_update_delete_never_touches_index() {
        let h = harness(IndexingConfig::in_memory());
        let mut plan = h.registry.plan("Book", None).unwrap();
        plan.add("1", book("a")).unwrap();
        plan.add_or_update("1", book("b")).unwrap();
        plan.add_or_update("1", book("c")).unwrap();
        plan.delete("1", book("c")).unwrap();

        assert!(plan.prepare().unwrap().is_empty());
        plan.execute_and_wait().await.unwrap();
        assert!(h.backend.applied_operations().is_empty());
    }

    #[tokio::test]
    async fn test_purge_barrier_within_plan() {
        let h = harness(IndexingConfig::in_memory());
        let mut plan = h.registry.plan("Book", None).unwrap();
        plan.add("1", book("a")).unwrap();
        plan.purge_all().unwrap();
        plan.add("2", book("b")).unwrap();

        let work = plan.prepare().unwrap();
        assert_eq!(work.len(), 2);
        assert_eq!(work[0].work_type(), WorkType::PurgeAll);
        assert_eq!(work[1].document_id(), Some("2"));

        plan.execute_and_wait().await.unwrap();
        assert!(h.backend.committed_document("1").is_none());
        assert!(h.backend.committed_document("2").is_some());
    }

    #[tokio::test]
    async fn test_latest_state_is_indexed() {
        let h = harness(IndexingConfig::in_memory());
        let entity = Arc::new(std::sync::RwLock::new(json!({"title": "first"})));
        let mut plan = h.registry.plan("Book", None).unwrap();
        plan.add("1", entity.clone()).unwrap();
        *entity.write().unwrap() = json!({"title": "at commit"});
        plan.execute_and_wait().await.unwrap();

        let doc = h.backend.committed_document("1").unwrap();
        assert_eq!(title_of(&doc).as_deref(), Some("at commit"));
    }
}

// ============================================================
// SYNCHRONIZATION STRATEGIES
// ============================================================

mod synchronization {
    use super::*;

    #[tokio::test]
    async fn test_sync_commits_without_refresh() {
        let h = harness(IndexingConfig::in_memory());
        let mut plan = h
            .registry
            .plan_with("Book", None, SynchronizationStrategy::Sync)
            .unwrap();
        plan.add("1", book("a")).unwrap();
        let result = plan.execute_and_wait().await.unwrap().unwrap();

        assert_eq!(result.succeeded.len(), 1);
        assert!(h.backend.committed_document("1").is_some());
        assert!(h.backend.visible_document("1").is_none());
        assert_eq!(h.backend.refresh_count(), 0);
    }

    #[tokio::test]
    async fn test_read_your_writes_refreshes_before_returning() {
        let h = harness(IndexingConfig::in_memory());
        let mut plan = h
            .registry
            .plan_with("Book", None, SynchronizationStrategy::ReadYourWrites)
            .unwrap();
        plan.add("1", book("a")).unwrap();
        plan.execute_and_wait().await.unwrap();

        assert!(h.backend.visible_document("1").is_some());
        assert_eq!(h.backend.refresh_count(), 1);
    }

    #[tokio::test]
    async fn test_async_returns_before_commit() {
        let h = harness(slow_commit_config());
        let mut plan = h
            .registry
            .plan_with("Book", None, SynchronizationStrategy::Async)
            .unwrap();
        plan.add("1", book("a")).unwrap();

        assert!(plan.execute_and_wait().await.unwrap().is_none());
        assert!(h.backend.committed_document("1").is_none());

        h.registry.shutdown().await.unwrap();
        assert!(h.backend.committed_document("1").is_some());
    }

    #[tokio::test]
    async fn test_configured_strategy_is_the_default() {
        let mut config = IndexingConfig::in_memory();
        config.synchronization = SynchronizationStrategy::ReadYourWrites;
        let h = harness(config);
        let plan = h.registry.plan("Book", None).unwrap();
        assert_eq!(plan.synchronization(), SynchronizationStrategy::ReadYourWrites);
    }
}

// ============================================================
// ORDERING ACROSS PLANS
// ============================================================

mod ordering {
    use super::*;

    #[tokio::test]
    async fn test_same_document_applied_in_submission_order() {
        let h = harness(IndexingConfig::in_memory());
        let mut first = h.registry.plan("Book", None).unwrap();
        let mut second = h.registry.plan("Book", None).unwrap();
        first.add("1", book("first")).unwrap();
        second.add_or_update("1", book("second")).unwrap();

        let f1 = first.execute().unwrap();
        let f2 = second.execute().unwrap();
        f1.await.unwrap();
        f2.await.unwrap();

        let applied = h.backend.applied_operations();
        assert_eq!(applied.len(), 2);
        let doc = h.backend.committed_document("1").unwrap();
        assert_eq!(title_of(&doc).as_deref(), Some("second"));
    }

    #[tokio::test]
    async fn test_tenant_purge_is_a_barrier_and_spares_other_tenants() {
        let mut config = IndexingConfig::in_memory();
        config.multi_tenancy = true;
        let h = harness(config);

        let mut t1 = h.registry.plan("Book", Some("t1")).unwrap();
        t1.add("1", book("a")).unwrap();
        t1.add("2", book("b")).unwrap();
        t1.execute_and_wait().await.unwrap();

        let mut t2 = h.registry.plan("Book", Some("t2")).unwrap();
        t2.add("1", book("other tenant")).unwrap();
        t2.execute_and_wait().await.unwrap();

        let mut purge = h.registry.plan("Book", Some("t1")).unwrap();
        purge.add("9", book("discarded")).unwrap();
        purge.purge_all().unwrap();
        purge.add("3", book("after purge")).unwrap();
        purge.execute_and_wait().await.unwrap();

        assert!(h.backend.committed_document("t1_1").is_none());
        assert!(h.backend.committed_document("t1_2").is_none());
        assert!(h.backend.committed_document("t1_9").is_none());
        assert!(h.backend.committed_document("t1_3").is_some());
        assert!(h.backend.committed_document("t2_1").is_some());
        assert_eq!(h.backend.committed_count(), 2);
    }

    #[tokio::test]
    async fn test_missing_tenant_is_fatal() {
        let mut config = IndexingConfig::in_memory();
        config.multi_tenancy = true;
        let h = harness(config);
        let err = h.registry.plan("Book", None).unwrap_err();
        assert!(matches!(err, SearchBindError::Config(_)));

        let h = harness(IndexingConfig::in_memory());
        assert!(h.registry.plan("Book", Some("t1")).unwrap_err().is_fatal());
    }
}

// ============================================================
// FAILURES
// ============================================================

mod failures {
    use super::*;

    #[tokio::test]
    async fn test_partial_failure_reports_first_incomplete_operation() {
        let h = harness(IndexingConfig::in_memory());
        h.backend.fail_on("2");

        let mut plan = h.registry.plan("Book", None).unwrap();
        plan.add("1", book("a")).unwrap();
        plan.add("2", book("b")).unwrap();
        plan.add("3", book("c")).unwrap();

        let err = plan.execute_and_wait().await.unwrap_err();
        let ctx = err.error_context().unwrap();
        assert_eq!(ctx.index_name, "books");
        assert_eq!(
            ctx.operation_at_fault.as_ref().and_then(|w| w.document_id()),
            Some("2")
        );
        assert!(ctx.failing_operations.is_empty());
        assert!(ctx.retryable_operations().is_empty());

        // No rollback of what succeeded.
        assert!(h.backend.committed_document("1").is_some());
        assert!(h.backend.committed_document("3").is_some());
        assert_eq!(h.failures.contexts().len(), 1);
    }

    #[tokio::test]
    async fn test_outcome_exposes_succeeded_and_failed() {
        let h = harness(IndexingConfig::in_memory());
        h.backend.fail_on("1");
        let mut plan = h.registry.plan("Book", None).unwrap();
        plan.add_or_update("1", book("a")).unwrap();
        plan.add_or_update("2", book("b")).unwrap();

        let result = plan.execute().unwrap().outcome().await.unwrap();
        assert_eq!(result.succeeded.len(), 1);
        let failed = result.failed.unwrap();
        assert_eq!(failed.retryable_operations().len(), 1);
    }

    #[tokio::test]
    async fn test_commit_failure_fails_every_item() {
        let h = harness(IndexingConfig::in_memory());
        h.backend.fail_commits(1);
        let mut plan = h.registry.plan("Book", None).unwrap();
        plan.add("1", book("a")).unwrap();
        plan.add("2", book("b")).unwrap();

        let err = plan.execute_and_wait().await.unwrap_err();
        let ctx = err.error_context().unwrap();
        assert_eq!(
            ctx.operation_at_fault.as_ref().and_then(|w| w.document_id()),
            Some("1")
        );
        assert_eq!(ctx.failing_operations.len(), 1);
        assert_eq!(
            h.registry.manager("books").unwrap().stats().failed,
            1
        );
    }

    #[tokio::test]
    async fn test_async_failures_reach_the_failure_handler() {
        let h = harness(IndexingConfig::in_memory());
        h.backend.fail_on("2");
        let mut plan = h
            .registry
            .plan_with("Book", None, SynchronizationStrategy::Async)
            .unwrap();
        plan.add("1", book("a")).unwrap();
        plan.add("2", book("b")).unwrap();
        assert!(plan.execute_and_wait().await.unwrap().is_none());

        h.registry.shutdown().await.unwrap();
        let contexts = h.failures.contexts();
        assert_eq!(contexts.len(), 1);
        assert_eq!(
            contexts[0]
                .operation_at_fault
                .as_ref()
                .and_then(|w| w.document_id()),
            Some("2")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_ambiguous() {
        let h = harness(IndexingConfig::in_memory());
        h.backend.set_apply_delay(Some(Duration::from_millis(500)));

        let mut plan = h
            .registry
            .plan("Book", None)
            .unwrap()
            .with_timeout(Duration::from_millis(50));
        plan.add("1", book("a")).unwrap();

        let err = plan.execute_and_wait().await.unwrap_err();
        assert!(matches!(err, SearchBindError::Timeout { .. }));
        assert!(err.is_ambiguous());

        // The work still lands; the caller just stopped waiting.
        h.registry.shutdown().await.unwrap();
        assert!(h.backend.committed_document("1").is_some());
        assert!(h.failures.contexts().is_empty());
    }

    #[tokio::test]
    async fn test_full_queue_rejects_without_spending_the_plan() {
        let mut config = IndexingConfig::in_memory();
        config.queue.capacity = 1;
        let h = harness(config);

        let mut first = h.registry.plan("Book", None).unwrap();
        first.add("1", book("a")).unwrap();
        let pending = first.execute().unwrap();

        let mut second = h.registry.plan("Book", None).unwrap();
        second.add("2", book("b")).unwrap();
        let err = second.execute().unwrap_err();
        assert!(matches!(err, SearchBindError::QueueFull { capacity: 1, .. }));
        assert!(!second.is_executed());

        pending.await.unwrap();
        second.execute().unwrap().await.unwrap();
        assert!(h.backend.committed_document("2").is_some());
    }

    #[tokio::test]
    async fn test_submitting_after_shutdown_fails() {
        let h = harness(IndexingConfig::in_memory());
        let manager = h.registry.manager("books").unwrap();
        let mut plan = h.registry.plan("Book", None).unwrap();
        manager.shutdown().await.unwrap();
        assert!(!manager.is_running());

        plan.add("1", book("a")).unwrap();
        assert!(matches!(
            plan.execute().unwrap_err(),
            SearchBindError::WorkerStopped(_)
        ));
    }
}

// ============================================================
// ROUTING
// ============================================================

mod routing {
    use super::*;

    fn routed() -> common::Harness {
        harness_with_binding(
            IndexingConfig::in_memory(),
            EntityBinding::new("Book", "books").with_routing(
                FieldRoutingBridge::new("genre")
                    .with_possible_values(["scifi", "fantasy"])
                    .excluding(["draft"]),
            ),
        )
    }

    async fn write(h: &common::Harness, id: &str, genre: &str) {
        let mut plan = h
            .registry
            .plan_with("Book", None, SynchronizationStrategy::ReadYourWrites)
            .unwrap();
        plan.add_or_update(id, Arc::new(json!({"title": id, "genre": genre})))
            .unwrap();
        plan.execute_and_wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_route_change_removes_stale_copy() {
        let h = routed();
        write(&h, "1", "scifi").await;
        write(&h, "1", "fantasy").await;

        let copies = h.backend.visible_copies("1");
        assert_eq!(copies.len(), 1);
        assert_eq!(copies[0].0.as_deref(), Some("fantasy"));
    }

    #[tokio::test]
    async fn test_excluded_state_deletes_from_every_route() {
        let h = routed();
        write(&h, "1", "scifi").await;
        write(&h, "1", "draft").await;
        assert!(h.backend.visible_copies("1").is_empty());
    }

    #[tokio::test]
    async fn test_delete_by_id_broadcasts_to_possible_routes() {
        let h = routed();
        write(&h, "1", "fantasy").await;

        let mut plan = h
            .registry
            .plan_with("Book", None, SynchronizationStrategy::ReadYourWrites)
            .unwrap();
        plan.delete_by_id("1").unwrap();
        plan.execute_and_wait().await.unwrap();
        assert!(h.backend.visible_copies("1").is_empty());
    }
}

// ============================================================
// BATCHING, FLUSH AND OPTIMIZE
// ============================================================

mod batching {
    use super::*;

    #[tokio::test]
    async fn test_flush_item_commits_immediately() {
        let h = harness(slow_commit_config());
        let mut plan = h
            .registry
            .plan("Book", None)
            .unwrap()
            .with_timeout(Duration::from_secs(5));
        plan.add("1", book("a")).unwrap();
        plan.flush().unwrap();
        plan.execute_and_wait().await.unwrap();
        assert!(h.backend.committed_document("1").is_some());
    }

    #[tokio::test]
    async fn test_work_waits_for_interval_without_flush() {
        let h = harness(slow_commit_config());
        let mut plan = h
            .registry
            .plan("Book", None)
            .unwrap()
            .with_timeout(Duration::from_millis(200));
        plan.add("1", book("a")).unwrap();
        assert!(plan.execute_and_wait().await.unwrap_err().is_ambiguous());
        assert_eq!(h.backend.commit_count(), 0);
    }

    #[tokio::test]
    async fn test_batch_size_triggers_commit() {
        let mut config = slow_commit_config();
        config.queue.batch_size = 2;
        let h = harness(config);
        let mut plan = h
            .registry
            .plan("Book", None)
            .unwrap()
            .with_timeout(Duration::from_secs(5));
        plan.add("1", book("a")).unwrap();
        plan.add("2", book("b")).unwrap();
        plan.execute_and_wait().await.unwrap();
        assert_eq!(h.backend.committed_count(), 2);
    }

    #[tokio::test]
    async fn test_explicit_optimize() {
        let h = harness(IndexingConfig::in_memory());
        let mut plan = h.registry.plan("Book", None).unwrap();
        plan.add("1", book("a")).unwrap();
        plan.optimize().unwrap();
        plan.execute_and_wait().await.unwrap();
        assert_eq!(h.backend.optimize_count(), 1);
    }

    #[tokio::test]
    async fn test_optimizer_threshold_fires_once() {
        let mut config = IndexingConfig::in_memory();
        config.optimizer.operation_limit = Some(3);
        let h = harness(config);
        let manager = h.registry.manager("books").unwrap();

        for batch in [["1", "2"], ["3", "4"]] {
            let mut plan = h.registry.plan("Book", None).unwrap();
            for id in batch {
                plan.add(id, book(id)).unwrap();
            }
            plan.execute_and_wait().await.unwrap();
        }
        h.registry.shutdown().await.unwrap();

        assert_eq!(h.backend.optimize_count(), 1);
        let stats = manager.stats();
        assert_eq!(stats.optimizations, 1);
        assert_eq!(stats.submitted, 2);
        assert_eq!(stats.succeeded, 2);
        assert_eq!(stats.pending, 0);
    }
}
