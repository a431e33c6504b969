//! Worker Module Tests
//!
//! ## Test Scopes
//! - **Processing**: results per object, match metadata, lease kept after reporting.
//! - **Fault isolation**: unreadable objects and broken queries.
//! - **Cancellation**: a running batch stops between objects.
//! - **Lifecycle**: compiled-query cache, lease renewal, loop shutdown.

#[cfg(test)]
mod tests {
    use crate::config::WorkerConfig;
    use crate::error::CoordinationError;
    use crate::jobs::types::*;
    use crate::matching::{CompiledQuery, Matcher, MatcherRegistry, SampleStore};
    use crate::queue::{Broker, MemoryBroker};
    use crate::storage::types::{IndexQuery, ObjectId};
    use crate::worker::Worker;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    /// Matches everything, sleeping a while per object.
    struct SlowMatcher {
        delay: Duration,
        compiles: Arc<AtomicUsize>,
    }

    struct CompiledSlow {
        delay: Duration,
    }

    impl CompiledQuery for CompiledSlow {
        fn index_query(&self) -> IndexQuery {
            IndexQuery::All
        }

        fn evaluate(&self, _data: &[u8]) -> anyhow::Result<ObjectOutcome> {
            std::thread::sleep(self.delay);
            Ok(ObjectOutcome::Matched {
                metadata: Metadata::new(),
            })
        }
    }

    impl Matcher for SlowMatcher {
        fn compile(&self, _query: &QuerySpec) -> Result<Arc<dyn CompiledQuery>, CoordinationError> {
            self.compiles.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(CompiledSlow { delay: self.delay }))
        }
    }

    struct Fixture {
        broker: Arc<MemoryBroker>,
        worker: Arc<Worker>,
        compiles: Arc<AtomicUsize>,
        _samples: TempDir,
    }

    fn fixture(config: WorkerConfig, slow_delay: Duration) -> Fixture {
        let samples = tempfile::tempdir().unwrap();
        std::fs::write(samples.path().join("hit.bin"), b"xx needle xx").unwrap();
        std::fs::write(samples.path().join("miss.bin"), b"nothing here").unwrap();
        for i in 0..10 {
            std::fs::write(samples.path().join(format!("s{}.bin", i)), b"data").unwrap();
        }

        let compiles = Arc::new(AtomicUsize::new(0));
        let matchers = MatcherRegistry::with_builtin();
        matchers.register(
            "slow",
            SlowMatcher {
                delay: slow_delay,
                compiles: compiles.clone(),
            },
        );

        let broker = Arc::new(MemoryBroker::new());
        let worker = Worker::new(
            broker.clone(),
            matchers,
            Arc::new(SampleStore::new(samples.path())),
            config,
        );

        Fixture {
            broker,
            worker,
            compiles,
            _samples: samples,
        }
    }

    fn fast_config() -> WorkerConfig {
        WorkerConfig {
            lease_wait: Duration::from_millis(50),
            ..WorkerConfig::default()
        }
    }

    async fn submit(broker: &MemoryBroker, query: QuerySpec, batches: &[&[&str]]) -> JobId {
        let job = JobRecord::new(query);
        broker.put_job(&job).await.unwrap();
        for (i, objects) in batches.iter().enumerate() {
            let task = TaskRecord::new(
                TaskKey::new(job.id.clone(), TaskId(i as u32)),
                objects.iter().map(|o| ObjectId::from(*o)).collect(),
            );
            broker.enqueue(&task).await.unwrap();
        }
        job.id
    }

    async fn results_of(report: &TaskReport) -> Vec<ResultEntry> {
        match &report.outcome {
            TaskOutcome::Completed { results } => results.clone(),
            other => panic!("expected completed outcome, got {:?}", other),
        }
    }

    // ============================================================
    // TEST 1: Processing
    // ============================================================

    #[tokio::test]
    async fn test_worker_reports_every_object_in_order() {
        // ARRANGE
        let fx = fixture(fast_config(), Duration::ZERO);
        let job = submit(
            &fx.broker,
            QuerySpec::new("literal", "needle"),
            &[&["hit.bin", "miss.bin"]],
        )
        .await;

        // ACT
        let handled = fx.worker.run_once().await.unwrap();

        // ASSERT
        assert!(handled);
        let report = fx.broker.next_report(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(report.key.job_id, job);
        assert_eq!(&report.worker, fx.worker.id());

        let results = results_of(&report).await;
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].object, ObjectId::from("hit.bin"));
        assert_eq!(results[1].outcome, ObjectOutcome::NotMatched);

        match &results[0].outcome {
            ObjectOutcome::Matched { metadata } => {
                assert_eq!(metadata["offset"], 3);
                assert_eq!(metadata["size"], 12);
                assert_eq!(metadata["sha256"].as_str().unwrap().len(), 64);
            }
            other => panic!("expected a match, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_worker_keeps_lease_after_reporting() {
        // ARRANGE
        let fx = fixture(fast_config(), Duration::ZERO);
        let job = submit(&fx.broker, QuerySpec::new("literal", "x"), &[&["miss.bin"]]).await;

        // ACT
        fx.worker.run_once().await.unwrap();

        // ASSERT: still leased and tracked for expiry until settled
        let key = TaskKey::new(job, TaskId(0));
        let task = fx.broker.get_task(&key).await.unwrap().unwrap();
        let report = fx.broker.next_report(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(task.state, TaskState::Leased);
        assert_eq!(task.lease.unwrap().lease_id, report.lease_id);
        assert_eq!(fx.broker.expired_leases(u64::MAX).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_run_once_on_empty_queue_returns_false() {
        let fx = fixture(fast_config(), Duration::ZERO);

        let handled = fx.worker.run_once().await.unwrap();

        assert!(!handled);
    }

    // ============================================================
    // TEST 2: Fault isolation
    // ============================================================

    #[tokio::test]
    async fn test_unreadable_object_does_not_abort_the_batch() {
        // ARRANGE
        let fx = fixture(fast_config(), Duration::ZERO);
        submit(
            &fx.broker,
            QuerySpec::new("literal", "needle"),
            &[&["missing.bin", "../escape.bin", "hit.bin"]],
        )
        .await;

        // ACT
        fx.worker.run_once().await.unwrap();

        // ASSERT
        let report = fx.broker.next_report(Duration::ZERO).await.unwrap().unwrap();
        let results = results_of(&report).await;
        assert!(results[0].outcome.is_error());
        assert!(results[1].outcome.is_error());
        assert!(results[2].outcome.is_match());
    }

    #[tokio::test]
    async fn test_broken_query_reports_task_failure() {
        // ARRANGE: bypass submit-time validation
        let fx = fixture(fast_config(), Duration::ZERO);
        submit(&fx.broker, QuerySpec::new("regex", "(unclosed"), &[&["hit.bin"]]).await;

        // ACT
        fx.worker.run_once().await.unwrap();

        // ASSERT
        let report = fx.broker.next_report(Duration::ZERO).await.unwrap().unwrap();
        assert!(matches!(report.outcome, TaskOutcome::Failed { .. }));
    }

    #[tokio::test]
    async fn test_task_of_unknown_job_reports_failure() {
        // ARRANGE: a task whose job record is missing
        let fx = fixture(fast_config(), Duration::ZERO);
        let orphan = TaskRecord::new(
            TaskKey::new(JobId::new(), TaskId(0)),
            vec![ObjectId::from("hit.bin")],
        );
        fx.broker.enqueue(&orphan).await.unwrap();

        // ACT
        fx.worker.run_once().await.unwrap();

        // ASSERT
        let report = fx.broker.next_report(Duration::ZERO).await.unwrap().unwrap();
        match report.outcome {
            TaskOutcome::Failed { error } => assert!(error.contains("not found")),
            other => panic!("expected failure, got {:?}", other),
        }
    }

    // ============================================================
    // TEST 3: Cancellation
    // ============================================================

    #[tokio::test]
    async fn test_cancellation_interrupts_running_task() {
        // ARRANGE: 10 objects at 50ms each
        let fx = fixture(fast_config(), Duration::from_millis(50));
        let objects: Vec<String> = (0..10).map(|i| format!("s{}.bin", i)).collect();
        let refs: Vec<&str> = objects.iter().map(String::as_str).collect();
        let job = submit(&fx.broker, QuerySpec::new("slow", ""), &[&refs]).await;

        let worker = fx.worker.clone();
        let running = tokio::spawn(async move { worker.run_once().await });

        // ACT
        tokio::time::sleep(Duration::from_millis(120)).await;
        fx.broker.mark_cancelled(&job).await.unwrap();
        running.await.unwrap().unwrap();

        // ASSERT
        let report = fx.broker.next_report(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(report.outcome, TaskOutcome::Interrupted);
    }

    // ============================================================
    // TEST 4: Lifecycle
    // ============================================================

    #[tokio::test]
    async fn test_query_is_compiled_once_per_job() {
        // ARRANGE
        let fx = fixture(fast_config(), Duration::ZERO);
        submit(
            &fx.broker,
            QuerySpec::new("slow", ""),
            &[&["s0.bin"], &["s1.bin"], &["s2.bin"]],
        )
        .await;

        // ACT
        for _ in 0..3 {
            assert!(fx.worker.run_once().await.unwrap());
        }

        // ASSERT
        assert_eq!(fx.compiles.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_lease_is_renewed_while_processing() {
        // ARRANGE: 90ms lease, renewed every 30ms, batch takes ~200ms
        let config = WorkerConfig {
            lease_timeout: Duration::from_millis(90),
            ..fast_config()
        };
        let fx = fixture(config, Duration::from_millis(50));
        submit(
            &fx.broker,
            QuerySpec::new("slow", ""),
            &[&["s0.bin", "s1.bin", "s2.bin", "s3.bin"]],
        )
        .await;

        let worker = fx.worker.clone();
        let running = tokio::spawn(async move { worker.run_once().await });

        // ACT: look past the original expiry
        tokio::time::sleep(Duration::from_millis(140)).await;
        let expired = fx.broker.expired_leases(now_ms()).await.unwrap();
        running.await.unwrap().unwrap();

        // ASSERT
        assert!(expired.is_empty(), "lease expired despite renewal");
        let report = fx.broker.next_report(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(results_of(&report).await.len(), 4);
    }

    #[tokio::test]
    async fn test_started_worker_drains_queue_and_stops_on_shutdown() {
        // ARRANGE
        let config = WorkerConfig {
            concurrency: 2,
            ..fast_config()
        };
        let fx = fixture(config, Duration::ZERO);
        submit(
            &fx.broker,
            QuerySpec::new("literal", "needle"),
            &[&["hit.bin"], &["miss.bin"], &["s0.bin"]],
        )
        .await;
        let shutdown = CancellationToken::new();

        // ACT
        let handles = fx.worker.clone().start(shutdown.clone());
        let mut reports = Vec::new();
        while reports.len() < 3 {
            let report = fx
                .broker
                .next_report(Duration::from_secs(5))
                .await
                .unwrap()
                .expect("worker reports every task");
            reports.push(report);
        }
        shutdown.cancel();

        // ASSERT
        for handle in handles {
            tokio::time::timeout(Duration::from_secs(2), handle)
                .await
                .expect("loop stops after shutdown")
                .unwrap();
        }
        let mut ids: Vec<u32> = reports.iter().map(|r| r.key.task_id.0).collect();
        ids.sort();
        assert_eq!(ids, vec![0, 1, 2]);
    }
}
