//! Task Queue Module Tests
//!
//! ## Test Scopes
//! - **Leasing**: FIFO order, lease exclusivity, blocking waits, cancellation gate.
//! - **Lease transitions**: renew, requeue and settle conditional on the lease id.
//! - **Ledger**: job records, submission order, dispatch index, per-task matches.
//! - **Reports**: FIFO consumption and wake-up on push.

#[cfg(test)]
mod tests {
    use crate::jobs::types::*;
    use crate::queue::{Broker, MemoryBroker};
    use crate::storage::types::ObjectId;
    use std::sync::Arc;
    use std::time::Duration;

    const LEASE: Duration = Duration::from_secs(30);
    const NO_WAIT: Duration = Duration::from_millis(0);

    fn task(job: &JobId, id: u32, objects: &[&str]) -> TaskRecord {
        TaskRecord::new(
            TaskKey::new(job.clone(), TaskId(id)),
            objects.iter().map(|o| ObjectId::from(*o)).collect(),
        )
    }

    fn report(task: &TaskRecord) -> TaskReport {
        let lease = task.lease.clone().unwrap();
        TaskReport {
            key: task.key.clone(),
            lease_id: lease.lease_id,
            worker: lease.worker,
            outcome: TaskOutcome::Interrupted,
            reported_at: now_ms(),
            deliveries: 0,
        }
    }

    // ============================================================
    // TEST 1: Leasing
    // ============================================================

    #[tokio::test]
    async fn test_lease_hands_out_tasks_in_fifo_order() {
        // ARRANGE
        let broker = MemoryBroker::new();
        let job = JobId::new();
        for id in 0..3 {
            broker.enqueue(&task(&job, id, &["a"])).await.unwrap();
        }
        let worker = WorkerId::new();

        // ACT
        let mut leased = Vec::new();
        while let Some(task) = broker.lease(&worker, LEASE, NO_WAIT).await.unwrap() {
            leased.push(task.key.task_id);
        }

        // ASSERT
        assert_eq!(leased, vec![TaskId(0), TaskId(1), TaskId(2)]);
    }

    #[tokio::test]
    async fn test_leased_task_is_invisible_to_other_workers() {
        // ARRANGE
        let broker = MemoryBroker::new();
        let job = JobId::new();
        broker.enqueue(&task(&job, 0, &["a"])).await.unwrap();

        // ACT
        let first = broker.lease(&WorkerId::new(), LEASE, NO_WAIT).await.unwrap();
        let second = broker.lease(&WorkerId::new(), LEASE, NO_WAIT).await.unwrap();

        // ASSERT
        let first = first.expect("first worker gets the task");
        assert_eq!(first.state, TaskState::Leased);
        assert!(first.lease.is_some());
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn test_concurrent_leases_never_share_a_task() {
        // ARRANGE
        let broker = Arc::new(MemoryBroker::new());
        let job = JobId::new();
        for id in 0..20 {
            broker.enqueue(&task(&job, id, &["a"])).await.unwrap();
        }

        // ACT: 8 workers drain the queue concurrently
        let mut handles = Vec::new();
        for _ in 0..8 {
            let broker = broker.clone();
            handles.push(tokio::spawn(async move {
                let worker = WorkerId::new();
                let mut got = Vec::new();
                while let Some(task) = broker.lease(&worker, LEASE, NO_WAIT).await.unwrap() {
                    got.push(task.key.task_id.0);
                }
                got
            }));
        }

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.await.unwrap());
        }

        // ASSERT: every task leased exactly once
        all.sort();
        assert_eq!(all, (0..20).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_lease_waits_for_enqueue() {
        // ARRANGE
        let broker = Arc::new(MemoryBroker::new());
        let job = JobId::new();

        let waiter = {
            let broker = broker.clone();
            tokio::spawn(async move {
                broker
                    .lease(&WorkerId::new(), LEASE, Duration::from_secs(5))
                    .await
                    .unwrap()
            })
        };

        // ACT
        tokio::time::sleep(Duration::from_millis(50)).await;
        broker.enqueue(&task(&job, 7, &["a"])).await.unwrap();

        // ASSERT
        let leased = waiter.await.unwrap().expect("waiter wakes up with the task");
        assert_eq!(leased.key.task_id, TaskId(7));
    }

    #[tokio::test]
    async fn test_lease_times_out_on_empty_queue() {
        let broker = MemoryBroker::new();

        let leased = broker
            .lease(&WorkerId::new(), LEASE, Duration::from_millis(30))
            .await
            .unwrap();

        assert!(leased.is_none());
    }

    #[tokio::test]
    async fn test_cancelled_job_tasks_are_never_leased() {
        // ARRANGE
        let broker = MemoryBroker::new();
        let cancelled = JobId::new();
        let live = JobId::new();
        broker.enqueue(&task(&cancelled, 0, &["a"])).await.unwrap();
        broker.enqueue(&task(&live, 0, &["b"])).await.unwrap();

        // ACT
        broker.mark_cancelled(&cancelled).await.unwrap();
        let leased = broker.lease(&WorkerId::new(), LEASE, NO_WAIT).await.unwrap();

        // ASSERT: the gate skips the cancelled job and drops its key
        assert_eq!(leased.unwrap().key.job_id, live);
        assert_eq!(broker.ready_len().await, 0);
        assert!(broker.is_cancelled(&cancelled).await.unwrap());
    }

    // ============================================================
    // TEST 2: Lease transitions
    // ============================================================

    #[tokio::test]
    async fn test_renew_requires_current_lease() {
        // ARRANGE
        let broker = MemoryBroker::new();
        let job = JobId::new();
        broker.enqueue(&task(&job, 0, &["a"])).await.unwrap();
        let leased = broker.lease(&WorkerId::new(), LEASE, NO_WAIT).await.unwrap().unwrap();
        let lease = leased.lease.clone().unwrap();

        // ACT
        let renewed = broker.renew(&leased.key, &lease.lease_id, LEASE).await.unwrap();
        let stale = broker.renew(&leased.key, &LeaseId::new(), LEASE).await.unwrap();

        // ASSERT
        assert!(renewed);
        assert!(!stale);
    }

    #[tokio::test]
    async fn test_settle_drops_lease_and_expiry_tracking() {
        // ARRANGE
        let broker = MemoryBroker::new();
        let job = JobId::new();
        broker.enqueue(&task(&job, 0, &["a"])).await.unwrap();
        let leased = broker.lease(&WorkerId::new(), LEASE, NO_WAIT).await.unwrap().unwrap();
        let lease_id = leased.lease.clone().unwrap().lease_id;
        assert_eq!(broker.expired_leases(u64::MAX).await.unwrap().len(), 1);

        // ACT
        let settled = broker
            .settle(&leased.key, TaskState::Succeeded)
            .await
            .unwrap()
            .unwrap();

        // ASSERT: no lease, not expired, not renewable, not leasable again
        assert_eq!(settled.state, TaskState::Succeeded);
        assert!(settled.lease.is_none());
        assert!(broker.expired_leases(u64::MAX).await.unwrap().is_empty());
        assert!(!broker.renew(&leased.key, &lease_id, LEASE).await.unwrap());
        assert!(broker.lease(&WorkerId::new(), LEASE, NO_WAIT).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_requeue_increments_attempts_once() {
        // ARRANGE
        let broker = MemoryBroker::new();
        let job = JobId::new();
        broker.enqueue(&task(&job, 0, &["a"])).await.unwrap();
        let leased = broker.lease(&WorkerId::new(), LEASE, NO_WAIT).await.unwrap().unwrap();
        let lease_id = leased.lease.clone().unwrap().lease_id;

        // ACT
        let requeued = broker.requeue(&leased.key, &lease_id).await.unwrap();
        let again = broker.requeue(&leased.key, &lease_id).await.unwrap();

        // ASSERT: second requeue is refused because the task is pending
        let requeued = requeued.unwrap();
        assert_eq!(requeued.attempts, 2);
        assert_eq!(requeued.state, TaskState::Pending);
        assert!(again.is_none());

        let released = broker.lease(&WorkerId::new(), LEASE, NO_WAIT).await.unwrap().unwrap();
        assert_eq!(released.attempts, 2);
        assert_ne!(released.lease.unwrap().lease_id, lease_id);
    }

    #[tokio::test]
    async fn test_requeue_refused_for_other_holder() {
        // ARRANGE
        let broker = MemoryBroker::new();
        let job = JobId::new();
        broker.enqueue(&task(&job, 0, &["a"])).await.unwrap();
        let leased = broker.lease(&WorkerId::new(), LEASE, NO_WAIT).await.unwrap().unwrap();

        // ACT
        let result = broker.requeue(&leased.key, &LeaseId::new()).await.unwrap();

        // ASSERT
        assert!(result.is_none());
        let stored = broker.get_task(&leased.key).await.unwrap().unwrap();
        assert_eq!(stored.attempts, 1);
        assert_eq!(stored.state, TaskState::Leased);
    }

    #[tokio::test]
    async fn test_expired_leases_lists_only_overdue_tasks() {
        // ARRANGE
        let broker = MemoryBroker::new();
        let job = JobId::new();
        broker.enqueue(&task(&job, 0, &["a"])).await.unwrap();
        broker.enqueue(&task(&job, 1, &["b"])).await.unwrap();

        let short = broker
            .lease(&WorkerId::new(), Duration::from_millis(10), NO_WAIT)
            .await
            .unwrap()
            .unwrap();
        broker.lease(&WorkerId::new(), LEASE, NO_WAIT).await.unwrap().unwrap();

        // ACT
        tokio::time::sleep(Duration::from_millis(30)).await;
        let expired = broker.expired_leases(now_ms()).await.unwrap();

        // ASSERT
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].key, short.key);
    }

    #[tokio::test]
    async fn test_settle_forces_state_and_drops_lease() {
        // ARRANGE
        let broker = MemoryBroker::new();
        let job = JobId::new();
        broker.enqueue(&task(&job, 0, &["a"])).await.unwrap();
        let leased = broker.lease(&WorkerId::new(), LEASE, NO_WAIT).await.unwrap().unwrap();

        // ACT
        let settled = broker
            .settle(&leased.key, TaskState::Succeeded)
            .await
            .unwrap()
            .unwrap();

        // ASSERT
        assert_eq!(settled.state, TaskState::Succeeded);
        assert!(settled.lease.is_none());

        let missing = TaskKey::new(job, TaskId(99));
        assert!(broker.settle(&missing, TaskState::Failed).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_enqueue_twice_lists_task_once() {
        // ARRANGE
        let broker = MemoryBroker::new();
        let job = JobId::new();
        let record = task(&job, 0, &["a"]);

        // ACT
        broker.enqueue(&record).await.unwrap();
        broker.enqueue(&record).await.unwrap();

        // ASSERT: one task for the job; the stale duplicate key is skipped
        assert_eq!(broker.tasks_for_job(&job).await.unwrap().len(), 1);
        assert!(broker.lease(&WorkerId::new(), LEASE, NO_WAIT).await.unwrap().is_some());
        assert!(broker.lease(&WorkerId::new(), LEASE, NO_WAIT).await.unwrap().is_none());
    }

    // ============================================================
    // TEST 3: Job ledger and matches
    // ============================================================

    #[tokio::test]
    async fn test_job_ledger_keeps_submission_order() {
        // ARRANGE
        let broker = MemoryBroker::new();
        let first = JobRecord::new(QuerySpec::new("literal", "a"));
        let second = JobRecord::new(QuerySpec::new("literal", "b"));

        // ACT: updating the first job does not move it
        broker.put_job(&first).await.unwrap();
        broker.put_job(&second).await.unwrap();
        let mut updated = first.clone();
        updated.status = JobStatus::Running;
        broker.put_job(&updated).await.unwrap();

        // ASSERT
        assert_eq!(
            broker.list_jobs().await.unwrap(),
            vec![first.id.clone(), second.id.clone()]
        );
        let stored = broker.get_job(&first.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Running);
        assert!(broker.get_job(&JobId::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_matches_are_paginated() {
        // ARRANGE
        let broker = MemoryBroker::new();
        let job = JobId::new();
        let records: Vec<MatchRecord> = (0..5)
            .map(|i| MatchRecord {
                object: ObjectId::from(format!("obj-{}", i).as_str()),
                task_id: TaskId(0),
                metadata: Metadata::new(),
            })
            .collect();
        broker.put_task_matches(&job, TaskId(0), &records).await.unwrap();

        // ACT
        let page = broker.matches(&job, 1, 2).await.unwrap();
        let tail = broker.matches(&job, 4, 10).await.unwrap();
        let unknown = broker.matches(&JobId::new(), 0, 10).await.unwrap();
        let far = broker.matches(&job, usize::MAX, usize::MAX).await.unwrap();

        // ASSERT
        assert_eq!(page, records[1..3].to_vec());
        assert_eq!(tail, records[4..].to_vec());
        assert!(unknown.is_empty());
        assert!(far.is_empty());
    }

    fn matched(task_id: u32, object: &str) -> MatchRecord {
        MatchRecord {
            object: ObjectId::from(object),
            task_id: TaskId(task_id),
            metadata: Metadata::new(),
        }
    }

    #[tokio::test]
    async fn test_task_matches_are_replaced_and_listed_by_task() {
        // ARRANGE
        let broker = MemoryBroker::new();
        let job = JobId::new();

        // ACT: task 3 lands first, task 1 is written twice, task 2 is cleared
        broker
            .put_task_matches(&job, TaskId(3), &[matched(3, "c")])
            .await
            .unwrap();
        broker
            .put_task_matches(&job, TaskId(1), &[matched(1, "a"), matched(1, "b")])
            .await
            .unwrap();
        broker
            .put_task_matches(&job, TaskId(1), &[matched(1, "a"), matched(1, "b")])
            .await
            .unwrap();
        broker
            .put_task_matches(&job, TaskId(2), &[matched(2, "x")])
            .await
            .unwrap();
        broker.put_task_matches(&job, TaskId(2), &[]).await.unwrap();

        // ASSERT
        let all = broker.matches(&job, 0, 100).await.unwrap();
        let objects: Vec<&str> = all.iter().map(|m| m.object.as_str()).collect();
        assert_eq!(objects, vec!["a", "b", "c"]);
        assert_eq!(broker.matches(&job, 2, 1).await.unwrap(), vec![matched(3, "c")]);
    }

    #[tokio::test]
    async fn test_dispatch_index_follows_job_records() {
        // ARRANGE
        let broker = MemoryBroker::new();
        let now = now_ms();
        let mut ready = JobRecord::new(QuerySpec::new("literal", "a"));
        let mut later = JobRecord::new(QuerySpec::new("literal", "b"));
        later.next_dispatch_at = now + 60_000;
        let mut running = JobRecord::new(QuerySpec::new("literal", "c"));
        running.status = JobStatus::Running;

        // ACT
        for job in [&ready, &later, &running] {
            broker.put_job(job).await.unwrap();
        }
        let due = broker.due_jobs(now, 10).await.unwrap();
        let eventually = broker.due_jobs(now + 60_000, 10).await.unwrap();
        let capped = broker.due_jobs(now + 60_000, 1).await.unwrap();

        // ASSERT
        assert_eq!(due, vec![ready.id.clone()]);
        assert_eq!(eventually, vec![ready.id.clone(), later.id.clone()]);
        assert_eq!(capped, vec![ready.id.clone()]);

        // ACT: claimed and cancelled jobs leave the index
        ready.status = JobStatus::Dispatching;
        later.cancelled = true;
        broker.put_job(&ready).await.unwrap();
        broker.put_job(&later).await.unwrap();

        // ASSERT
        assert!(broker.due_jobs(u64::MAX, 10).await.unwrap().is_empty());
        assert_eq!(broker.list_jobs().await.unwrap().len(), 3);
    }

    // ============================================================
    // TEST 4: Reports
    // ============================================================

    #[tokio::test]
    async fn test_reports_are_consumed_in_order_once() {
        // ARRANGE
        let broker = MemoryBroker::new();
        let job = JobId::new();
        broker.enqueue(&task(&job, 0, &["a"])).await.unwrap();
        broker.enqueue(&task(&job, 1, &["b"])).await.unwrap();
        let worker = WorkerId::new();
        let first = broker.lease(&worker, LEASE, NO_WAIT).await.unwrap().unwrap();
        let second = broker.lease(&worker, LEASE, NO_WAIT).await.unwrap().unwrap();

        // ACT
        broker.push_report(&report(&first)).await.unwrap();
        broker.push_report(&report(&second)).await.unwrap();

        // ASSERT
        let a = broker.next_report(NO_WAIT).await.unwrap().unwrap();
        let b = broker.next_report(NO_WAIT).await.unwrap().unwrap();
        assert_eq!(a.key, first.key);
        assert_eq!(b.key, second.key);
        assert!(broker.next_report(NO_WAIT).await.unwrap().is_none());
        assert_eq!(broker.report_backlog().await, 0);
    }

    #[tokio::test]
    async fn test_next_report_wakes_on_push() {
        // ARRANGE
        let broker = Arc::new(MemoryBroker::new());
        let job = JobId::new();
        broker.enqueue(&task(&job, 0, &["a"])).await.unwrap();
        let leased = broker.lease(&WorkerId::new(), LEASE, NO_WAIT).await.unwrap().unwrap();

        let waiter = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.next_report(Duration::from_secs(5)).await.unwrap() })
        };

        // ACT
        tokio::time::sleep(Duration::from_millis(50)).await;
        broker.push_report(&report(&leased)).await.unwrap();

        // ASSERT
        let received = waiter.await.unwrap().expect("report delivered");
        assert_eq!(received.key, leased.key);
    }
}
