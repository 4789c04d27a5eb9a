//! End-to-end queue scenarios, run against every store implementation.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeDelta, TimeZone, Utc};

use foreman_core::app::{App, AppBuilder, Lease, TaskHandler};
use foreman_core::domain::{
    NewTask, Outcome, QueueError, RetryDecision, TaskId, TaskStatus, WorkerId,
};
use foreman_core::impls::{InMemoryTaskStore, MemoryEventSink, NoopEventSink};
use foreman_core::ports::{Clock, FixedClock, IdGenerator, TaskStore};
use foreman_core::ForemanConfig;

fn memory_store() -> Arc<dyn TaskStore> {
    Arc::new(InMemoryTaskStore::new())
}

#[cfg(feature = "sqlite")]
fn sqlite_store() -> Arc<dyn TaskStore> {
    Arc::new(foreman_core::impls::SqliteTaskStore::open_in_memory().unwrap())
}

fn fixed_clock() -> FixedClock {
    FixedClock::new(Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap())
}

fn app(store: Arc<dyn TaskStore>, clock: &FixedClock) -> App {
    AppBuilder::new(ForemanConfig::default())
        .with_store(store)
        .with_clock(Arc::new(clock.clone()))
        .with_event_sink(Arc::new(NoopEventSink))
        .build()
        .unwrap()
}

async fn enqueue(app: &App, clock: &FixedClock, n: usize, max_attempts: u32) -> Vec<TaskId> {
    let mut ids = Vec::new();
    for i in 0..n {
        let rec = app
            .enqueuer
            .enqueue(NewTask::new(serde_json::json!({"file_id": i})).with_max_attempts(max_attempts))
            .await
            .unwrap();
        ids.push(rec.id);
        // distinct updated_at keeps dispatch order deterministic
        clock.advance(TimeDelta::seconds(1));
    }
    ids
}

async fn attempts_of(app: &App, id: TaskId) -> u32 {
    app.store.get(id).await.unwrap().unwrap().attempts
}

async fn three_tasks_three_failures(store: Arc<dyn TaskStore>) {
    let clock = fixed_clock();
    let app = app(store, &clock);
    let ids = enqueue(&app, &clock, 3, 3).await;
    let worker = app.ids.generate_worker_id();

    for round in 1..=3u32 {
        let res = app.dispatcher.dispatch(worker, 10).await.unwrap();
        assert_eq!(res.len(), 3, "round {round}");
        for lease in res.leases().unwrap() {
            assert_eq!(lease.attempts, round);
            let (_, decision) = app.leases.release_failure(lease, "ocr failed").await.unwrap();
            if round < 3 {
                assert!(matches!(decision, RetryDecision::Requeue { .. }));
            } else {
                assert_eq!(decision, RetryDecision::FailTerminal);
            }
        }
        clock.advance(TimeDelta::seconds(1));
    }

    let counts = app.status.counts().await.unwrap();
    assert_eq!(counts.failed, 3);
    assert_eq!(counts.total(), 3);
    for id in ids {
        let rec = app.store.get(id).await.unwrap().unwrap();
        assert_eq!(rec.status, TaskStatus::Failed);
        assert_eq!(rec.last_error.as_deref(), Some("ocr failed"));
    }
    assert!(app.dispatcher.dispatch(worker, 10).await.unwrap().is_empty());
}

async fn crash_then_reclaim(store: Arc<dyn TaskStore>) {
    let clock = fixed_clock();
    let app = app(store, &clock);
    let ids = enqueue(&app, &clock, 1, 3).await;
    let crashed = app.ids.generate_worker_id();

    let res = app.dispatcher.dispatch(crashed, 1).await.unwrap();
    let lease = res.leases().unwrap().remove(0);
    app.leases.begin(&lease).await.unwrap();

    // still live: nothing to reclaim
    clock.advance(TimeDelta::minutes(9));
    assert!(app.reclaimer.run_pass(clock.now()).await.unwrap().is_noop());

    clock.advance(TimeDelta::minutes(2));
    let report = app.reclaimer.run_pass(clock.now()).await.unwrap();
    assert_eq!(report.locks_released, ids);
    assert_eq!(report.orphans_requeued, ids);

    let rec = app.store.get(ids[0]).await.unwrap().unwrap();
    assert_eq!(rec.status, TaskStatus::Queued);
    assert_eq!(rec.attempts, 1);
    assert_eq!(rec.locked_by, None);

    // second pass finds nothing
    assert!(app.reclaimer.run_pass(clock.now()).await.unwrap().is_noop());

    // the crashed worker's late completion is rejected
    let err = app.leases.release_success(lease).await.unwrap_err();
    assert!(err.is_lease_lost());

    let again = app.dispatcher.dispatch(app.ids.generate_worker_id(), 1).await.unwrap();
    assert_eq!(again.claimed[0].attempts, 2);
}

async fn concurrent_dispatch_is_exclusive(store: Arc<dyn TaskStore>) {
    let clock = fixed_clock();
    let app = Arc::new(app(store, &clock));
    enqueue(&app, &clock, 7, 3).await;

    let a = {
        let app = app.clone();
        tokio::spawn(async move { app.dispatcher.dispatch(app.ids.generate_worker_id(), 5).await })
    };
    let b = {
        let app = app.clone();
        tokio::spawn(async move { app.dispatcher.dispatch(app.ids.generate_worker_id(), 5).await })
    };
    let a = a.await.unwrap().unwrap();
    let b = b.await.unwrap().unwrap();

    assert_eq!(a.len() + b.len(), 7);
    let distinct: HashSet<TaskId> = a.claimed_ids.iter().chain(&b.claimed_ids).copied().collect();
    assert_eq!(distinct.len(), 7);
    assert_eq!(app.status.counts().await.unwrap().dispatched, 7);
}

async fn attempts_never_decrease(store: Arc<dyn TaskStore>) {
    let clock = fixed_clock();
    let app = app(store, &clock);
    let ids = enqueue(&app, &clock, 1, 5).await;
    let id = ids[0];
    let mut seen = attempts_of(&app, id).await;

    let mut check = |now: u32| {
        assert!(now >= seen, "attempts went from {seen} to {now}");
        seen = now;
    };

    let w1 = app.ids.generate_worker_id();
    let lease = app.dispatcher.dispatch(w1, 1).await.unwrap().leases().unwrap().remove(0);
    check(attempts_of(&app, id).await);

    app.leases.release_failure(lease, "timeout").await.unwrap();
    check(attempts_of(&app, id).await);

    app.dispatcher.dispatch(w1, 1).await.unwrap();
    check(attempts_of(&app, id).await);

    clock.advance(TimeDelta::minutes(11));
    app.reclaimer.run_pass(clock.now()).await.unwrap();
    check(attempts_of(&app, id).await);

    let lease = app
        .dispatcher
        .dispatch(app.ids.generate_worker_id(), 1)
        .await
        .unwrap()
        .leases()
        .unwrap()
        .remove(0);
    check(attempts_of(&app, id).await);
    app.leases.release_success(lease).await.unwrap();
    check(attempts_of(&app, id).await);

    assert_eq!(seen, 3);
}

async fn stale_holder_cannot_write(store: Arc<dyn TaskStore>) {
    let clock = fixed_clock();
    let app = app(store, &clock);
    let ids = enqueue(&app, &clock, 1, 3).await;

    let old = app.ids.generate_worker_id();
    let mut stale = app.dispatcher.dispatch(old, 1).await.unwrap().leases().unwrap().remove(0);

    clock.advance(TimeDelta::minutes(11));
    app.reclaimer.run_pass(clock.now()).await.unwrap();
    let fresh = app
        .dispatcher
        .dispatch(app.ids.generate_worker_id(), 1)
        .await
        .unwrap()
        .leases()
        .unwrap()
        .remove(0);

    assert!(app.leases.renew(&mut stale).await.unwrap_err().is_lease_lost());
    assert!(app.leases.begin(&stale).await.unwrap_err().is_lease_lost());
    assert!(
        app.leases
            .release_failure(stale, "late")
            .await
            .unwrap_err()
            .is_lease_lost()
    );

    app.leases.begin(&fresh).await.unwrap();
    let rec = app.leases.release_success(fresh).await.unwrap();
    assert_eq!(rec.id, ids[0]);
    assert_eq!(rec.status, TaskStatus::Succeeded);
    assert_eq!(rec.last_error, None);
}

async fn missing_task_is_not_found(store: Arc<dyn TaskStore>) {
    let clock = fixed_clock();
    let app = app(store, &clock);
    let ghost = app.ids.generate_task_id();
    let err = app
        .store
        .complete(ghost, app.ids.generate_worker_id(), clock.now())
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::TaskNotFound(id) if id == ghost));
}

#[tokio::test]
async fn memory_three_tasks_three_failures() {
    three_tasks_three_failures(memory_store()).await;
}

#[tokio::test]
async fn memory_crash_then_reclaim() {
    crash_then_reclaim(memory_store()).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn memory_concurrent_dispatch_is_exclusive() {
    concurrent_dispatch_is_exclusive(memory_store()).await;
}

#[tokio::test]
async fn memory_attempts_never_decrease() {
    attempts_never_decrease(memory_store()).await;
}

#[tokio::test]
async fn memory_stale_holder_cannot_write() {
    stale_holder_cannot_write(memory_store()).await;
}

#[tokio::test]
async fn memory_missing_task_is_not_found() {
    missing_task_is_not_found(memory_store()).await;
}

#[cfg(feature = "sqlite")]
mod sqlite {
    use super::*;

    #[tokio::test]
    async fn three_tasks_three_failures() {
        super::three_tasks_three_failures(sqlite_store()).await;
    }

    #[tokio::test]
    async fn crash_then_reclaim() {
        super::crash_then_reclaim(sqlite_store()).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_dispatch_is_exclusive() {
        super::concurrent_dispatch_is_exclusive(sqlite_store()).await;
    }

    #[tokio::test]
    async fn attempts_never_decrease() {
        super::attempts_never_decrease(sqlite_store()).await;
    }

    #[tokio::test]
    async fn stale_holder_cannot_write() {
        super::stale_holder_cannot_write(sqlite_store()).await;
    }

    #[tokio::test]
    async fn missing_task_is_not_found() {
        super::missing_task_is_not_found(sqlite_store()).await;
    }
}

struct FlakyOcr {
    calls: AtomicUsize,
}

#[async_trait]
impl TaskHandler for FlakyOcr {
    async fn handle(&self, lease: &Lease) -> Outcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        // every task fails its first attempt
        if lease.attempts == 1 {
            Outcome::failure("GEMINI_429 rate limited")
        } else {
            Outcome::success()
        }
    }
}

#[tokio::test]
async fn worker_group_retries_until_done() {
    let mut config = ForemanConfig::default();
    config.worker.concurrency = 3;
    config.worker.poll_interval_ms = 5;
    let events = MemoryEventSink::new();
    let app = AppBuilder::new(config)
        .with_event_sink(Arc::new(events.clone()))
        .build()
        .unwrap();

    let job = app
        .enqueuer
        .enqueue_job((0..4).map(|i| serde_json::json!({"page": i})).collect())
        .await
        .unwrap();

    let handler = Arc::new(FlakyOcr {
        calls: AtomicUsize::new(0),
    });
    let group = app.spawn_workers(handler.clone());

    tokio::time::timeout(Duration::from_secs(5), async {
        while !app.status.summarize_job(job.job_id).await.unwrap().is_settled() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    group.shutdown_and_join().await;

    let summary = app.status.summarize_job(job.job_id).await.unwrap();
    assert_eq!(summary.succeeded, 4);
    assert_eq!(handler.calls.load(Ordering::SeqCst), 8);
    assert_eq!(events.count("task_requeued"), 4);
    assert_eq!(events.count("task_succeeded"), 4);
}

#[tokio::test]
async fn reclaimer_loop_recovers_abandoned_task() {
    let mut config = ForemanConfig::default();
    config.lease.duration_secs = 2;
    config.lease.renew_interval_secs = 1;
    config.lease.min_duration_secs = 1;
    config.reclaim.interval_secs = 1;
    let app = AppBuilder::new(config)
        .with_event_sink(Arc::new(NoopEventSink))
        .build()
        .unwrap();

    let rec = app.enqueuer.enqueue(NewTask::default()).await.unwrap();
    let abandoned: WorkerId = app.ids.generate_worker_id();
    app.dispatcher.dispatch(abandoned, 1).await.unwrap();

    let (tx, rx) = tokio::sync::watch::channel(false);
    let handle = tokio::spawn(app.reclaimer_loop().run(rx));

    // lease (2s) + one reclaim interval (1s), with slack
    tokio::time::timeout(Duration::from_secs(6), async {
        loop {
            let rec = app.store.get(rec.id).await.unwrap().unwrap();
            if rec.status == TaskStatus::Queued {
                assert_eq!(rec.attempts, 1);
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .unwrap();

    tx.send(true).unwrap();
    handle.await.unwrap();
}
