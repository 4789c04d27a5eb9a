//! WorkerLoop - タスク実行ループ
//!
//! # フロー
//! 1. Dispatcher::dispatch() で claim（何もなければ poll_interval だけ待つ）
//! 2. LeaseManager::begin() で processing へ
//! 3. TaskHandler を実行。並行して renew_interval ごとに lease を延長（select!）
//!    同じ batch で順番待ちの lease も同じ ticker で延長する
//! 4. Outcome に応じて release_success / release_failure
//!
//! renew が LeaseLost を返したら handler の future を drop し、結果は書きません。
//! プロセスが kill された場合は lease が切れるのを待ち、Reclaimer が回収します。

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, interval_at};
use tracing::{debug, info, warn};

use super::dispatcher::Dispatcher;
use super::lease::{Lease, LeaseManager};
use crate::domain::{Outcome, TaskId, WorkerId};
use crate::ports::IdGenerator;

/// External processing step (OCR / extraction, ...). The queue never looks
/// inside the payload; the handler does.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, lease: &Lease) -> Outcome;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerSettings {
    /// Tasks claimed per dispatch call.
    pub batch_size: usize,
    pub poll_interval: Duration,
    pub renew_interval: Duration,
}

/// What happened to one claimed task.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskRun {
    Succeeded,
    Failed { error: String },
    /// Lease lost mid-flight; nothing was written.
    Abandoned,
}

pub struct WorkerLoop {
    worker: WorkerId,
    dispatcher: Arc<Dispatcher>,
    leases: Arc<LeaseManager>,
    handler: Arc<dyn TaskHandler>,
    settings: WorkerSettings,
}

impl WorkerLoop {
    pub fn new(
        worker: WorkerId,
        dispatcher: Arc<Dispatcher>,
        leases: Arc<LeaseManager>,
        handler: Arc<dyn TaskHandler>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            worker,
            dispatcher,
            leases,
            handler,
            settings,
        }
    }

    pub fn worker_id(&self) -> WorkerId {
        self.worker
    }

    /// Loop until shutdown. Tasks already claimed are finished first; shutdown
    /// only stops taking new leases.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let worker = self.worker;
        info!(%worker, "worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }

            let claimed = match self.dispatcher.dispatch(worker, self.settings.batch_size).await {
                Ok(res) => res.leases(),
                Err(e) => Err(e),
            };

            let leases = match claimed {
                Ok(leases) if !leases.is_empty() => leases,
                Ok(_) => {
                    if idle(&mut shutdown, self.settings.poll_interval).await {
                        break;
                    }
                    continue;
                }
                Err(e) => {
                    warn!(%worker, error = %e, "dispatch failed");
                    if idle(&mut shutdown, self.settings.poll_interval).await {
                        break;
                    }
                    continue;
                }
            };

            self.process_batch(leases).await;
        }
        info!(%worker, "worker stopped");
    }

    /// Run one claimed task to completion (or abandonment).
    pub async fn process(&self, lease: Lease) -> TaskRun {
        let mut ticker = self.renew_ticker();
        self.run_one(lease, &mut VecDeque::new(), &mut Vec::new(), &mut ticker)
            .await
    }

    /// Run a claimed batch in claim order. Leases still waiting their turn
    /// are renewed on the same ticker as the running one; a waiting lease
    /// that is lost is reported as `Abandoned` and never started.
    pub async fn process_batch(&self, leases: Vec<Lease>) -> Vec<(TaskId, TaskRun)> {
        let mut ticker = self.renew_ticker();
        let mut waiting: VecDeque<Lease> = leases.into();
        let mut runs = Vec::with_capacity(waiting.len());
        let mut lost = Vec::new();
        while let Some(lease) = waiting.pop_front() {
            let task_id = lease.task_id;
            let run = self.run_one(lease, &mut waiting, &mut lost, &mut ticker).await;
            runs.push((task_id, run));
            runs.extend(lost.drain(..).map(|id| (id, TaskRun::Abandoned)));
        }
        runs
    }

    /// Extend every lease in `waiting`; lost ones are removed and returned.
    async fn renew_waiting(&self, waiting: &mut VecDeque<Lease>) -> Vec<TaskId> {
        let mut lost = Vec::new();
        let mut kept = VecDeque::with_capacity(waiting.len());
        for mut lease in waiting.drain(..) {
            match self.leases.renew(&mut lease).await {
                Ok(()) => kept.push_back(lease),
                Err(e) if e.is_lease_lost() => lost.push(lease.task_id),
                Err(e) => {
                    warn!(task_id = %lease.task_id, worker = %lease.worker, error = %e, "waiting lease renew failed");
                    kept.push_back(lease);
                }
            }
        }
        *waiting = kept;
        lost
    }

    fn renew_ticker(&self) -> Interval {
        let period = self.settings.renew_interval;
        interval_at(Instant::now() + period, period)
    }

    async fn run_one(
        &self,
        mut lease: Lease,
        waiting: &mut VecDeque<Lease>,
        lost: &mut Vec<TaskId>,
        ticker: &mut Interval,
    ) -> TaskRun {
        let task_id = lease.task_id;
        let worker = lease.worker;

        if let Err(e) = self.leases.begin(&lease).await {
            if !e.is_lease_lost() {
                warn!(%task_id, %worker, error = %e, "begin failed; leaving task to the reclaimer");
            }
            return TaskRun::Abandoned;
        }

        let snapshot = lease.clone();
        let handler = self.handler.handle(&snapshot);
        tokio::pin!(handler);

        let outcome = loop {
            tokio::select! {
                outcome = &mut handler => break outcome,
                _ = ticker.tick() => {
                    lost.extend(self.renew_waiting(waiting).await);
                    match self.leases.renew(&mut lease).await {
                        Ok(()) => {}
                        Err(e) if e.is_lease_lost() => return TaskRun::Abandoned,
                        // transient: keep working, the next tick retries
                        Err(e) => warn!(%task_id, %worker, error = %e, "lease renew failed"),
                    }
                }
            }
        };

        if outcome.is_success() {
            match self.leases.release_success(lease).await {
                Ok(_) => {
                    debug!(%task_id, %worker, "task succeeded");
                    TaskRun::Succeeded
                }
                Err(e) => {
                    if !e.is_lease_lost() {
                        warn!(%task_id, %worker, error = %e, "release_success failed");
                    }
                    TaskRun::Abandoned
                }
            }
        } else {
            let error = outcome.error_text();
            match self.leases.release_failure(lease, &error).await {
                Ok(_) => TaskRun::Failed { error },
                Err(e) => {
                    if !e.is_lease_lost() {
                        warn!(%task_id, %worker, error = %e, "release_failure failed");
                    }
                    TaskRun::Abandoned
                }
            }
        }
    }
}

/// Sleep `period` or until shutdown; true when the group handle is gone.
async fn idle(shutdown: &mut watch::Receiver<bool>, period: Duration) -> bool {
    tokio::select! {
        changed = shutdown.changed() => changed.is_err(),
        _ = tokio::time::sleep(period) => false,
    }
}

/// Worker group handle.
/// - `request_shutdown()` で新しい lease の取得を止める
/// - `shutdown_and_join()` で全ワーカーの終了を待つ
pub struct WorkerGroup {
    shutdown_tx: watch::Sender<bool>,
    workers: Vec<WorkerId>,
    joins: Vec<JoinHandle<()>>,
}

impl WorkerGroup {
    /// Spawn `n` workers, each with its own worker id.
    pub fn spawn(
        n: usize,
        ids: &dyn IdGenerator,
        dispatcher: Arc<Dispatcher>,
        leases: Arc<LeaseManager>,
        handler: Arc<dyn TaskHandler>,
        settings: WorkerSettings,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut workers = Vec::with_capacity(n);
        let mut joins = Vec::with_capacity(n);
        for _ in 0..n {
            let worker = WorkerLoop::new(
                ids.generate_worker_id(),
                Arc::clone(&dispatcher),
                Arc::clone(&leases),
                Arc::clone(&handler),
                settings,
            );
            workers.push(worker.worker_id());
            joins.push(tokio::spawn(worker.run(shutdown_rx.clone())));
        }

        Self {
            shutdown_tx,
            workers,
            joins,
        }
    }

    pub fn worker_ids(&self) -> &[WorkerId] {
        &self.workers
    }

    pub fn request_shutdown(&self) {
        // receivers may already be gone
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for j in self.joins {
            if let Err(e) = j.await {
                warn!(error = %e, "worker task panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{NewTask, RetryPolicy, TaskId, TaskRecord, TaskStatus};
    use crate::impls::{InMemoryTaskStore, NoopEventSink};
    use crate::ports::{Clock, SystemClock, TaskStore, UlidGenerator};
    use chrono::TimeDelta;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use ulid::Ulid;

    struct Harness {
        store: Arc<InMemoryTaskStore>,
        dispatcher: Arc<Dispatcher>,
        leases: Arc<LeaseManager>,
    }

    fn harness(lease: TimeDelta) -> Harness {
        let store = Arc::new(InMemoryTaskStore::new());
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let dispatcher = Arc::new(Dispatcher::new(
            store.clone(),
            clock.clone(),
            Arc::new(NoopEventSink),
            lease,
            10,
        ));
        let leases = Arc::new(LeaseManager::new(
            store.clone(),
            clock,
            Arc::new(NoopEventSink),
            RetryPolicy::default(),
            lease,
        ));
        Harness {
            store,
            dispatcher,
            leases,
        }
    }

    async fn enqueue(store: &InMemoryTaskStore, n: usize, max_attempts: u32) -> Vec<TaskId> {
        let mut ids = Vec::new();
        for i in 0..n {
            let rec = TaskRecord::new(
                TaskId::from_ulid(Ulid::new()),
                NewTask::new(serde_json::json!({"n": i})).with_max_attempts(max_attempts),
                5,
                chrono::Utc::now(),
            );
            ids.push(store.insert(rec).await.unwrap().id);
        }
        ids
    }

    fn settings(renew_ms: u64) -> WorkerSettings {
        WorkerSettings {
            batch_size: 1,
            poll_interval: Duration::from_millis(5),
            renew_interval: Duration::from_millis(renew_ms),
        }
    }

    struct CountingHandler {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl TaskHandler for CountingHandler {
        async fn handle(&self, _lease: &Lease) -> Outcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Outcome::failure("extraction failed")
            } else {
                Outcome::success()
            }
        }
    }

    struct SlowHandler(Duration);

    #[async_trait]
    impl TaskHandler for SlowHandler {
        async fn handle(&self, _lease: &Lease) -> Outcome {
            tokio::time::sleep(self.0).await;
            Outcome::success()
        }
    }

    #[tokio::test]
    async fn slow_handler_keeps_lease_alive() {
        let h = harness(TimeDelta::milliseconds(150));
        let ids = enqueue(&h.store, 1, 3).await;
        let worker = WorkerId::from_ulid(Ulid::new());

        let res = h.dispatcher.dispatch(worker, 1).await.unwrap();
        let lease = res.leases().unwrap().remove(0);
        let wl = WorkerLoop::new(
            worker,
            h.dispatcher.clone(),
            h.leases.clone(),
            Arc::new(SlowHandler(Duration::from_millis(400))),
            settings(40),
        );

        assert_eq!(wl.process(lease).await, TaskRun::Succeeded);
        let rec = h.store.get(ids[0]).await.unwrap().unwrap();
        assert_eq!(rec.status, TaskStatus::Succeeded);
    }

    #[tokio::test]
    async fn waiting_leases_in_a_batch_stay_alive() {
        let h = harness(TimeDelta::milliseconds(300));
        let ids = enqueue(&h.store, 2, 3).await;
        let worker = WorkerId::from_ulid(Ulid::new());

        let res = h.dispatcher.dispatch(worker, 2).await.unwrap();
        let leases = res.leases().unwrap();
        assert_eq!(leases.len(), 2);
        let wl = WorkerLoop::new(
            worker,
            h.dispatcher.clone(),
            h.leases.clone(),
            Arc::new(SlowHandler(Duration::from_millis(500))),
            WorkerSettings {
                batch_size: 2,
                ..settings(80)
            },
        );

        let runs = wl.process_batch(leases).await;
        assert_eq!(runs.len(), 2);
        assert!(runs.iter().all(|(_, run)| *run == TaskRun::Succeeded));
        for id in ids {
            let rec = h.store.get(id).await.unwrap().unwrap();
            assert_eq!(rec.status, TaskStatus::Succeeded);
            assert_eq!(rec.attempts, 1);
        }
    }

    #[tokio::test]
    async fn lost_waiting_lease_is_never_started() {
        let h = harness(TimeDelta::minutes(10));
        enqueue(&h.store, 2, 3).await;
        let worker = WorkerId::from_ulid(Ulid::new());
        let leases = h.dispatcher.dispatch(worker, 2).await.unwrap().leases().unwrap();
        let (first_id, waiting_id) = (leases[0].task_id, leases[1].task_id);

        // the reclaimer takes the second task while the first one runs
        let store = h.store.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let later = chrono::Utc::now() + TimeDelta::minutes(11);
            store.release_expired_locks(&[waiting_id], later).await.unwrap();
            store.requeue_orphans(&[waiting_id], later).await.unwrap();
        });

        let wl = WorkerLoop::new(
            worker,
            h.dispatcher.clone(),
            h.leases.clone(),
            Arc::new(SlowHandler(Duration::from_millis(200))),
            settings(50),
        );
        let runs = wl.process_batch(leases).await;

        assert_eq!(runs[0], (first_id, TaskRun::Succeeded));
        assert_eq!(runs[1], (waiting_id, TaskRun::Abandoned));
        assert_eq!(h.store.get(first_id).await.unwrap().unwrap().status, TaskStatus::Succeeded);
        // handed back before it ever started
        let rec = h.store.get(waiting_id).await.unwrap().unwrap();
        assert_eq!(rec.status, TaskStatus::Queued);
        assert_eq!(rec.started_at, None);
    }

    #[tokio::test]
    async fn lost_lease_abandons_without_writing() {
        let h = harness(TimeDelta::minutes(10));
        let ids = enqueue(&h.store, 1, 3).await;
        let worker = WorkerId::from_ulid(Ulid::new());

        let res = h.dispatcher.dispatch(worker, 1).await.unwrap();
        let lease = res.leases().unwrap().remove(0);

        // simulate the reclaimer taking the task away mid-flight
        let store = h.store.clone();
        let task_id = ids[0];
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let later = chrono::Utc::now() + TimeDelta::minutes(11);
            store.release_expired_locks(&[task_id], later).await.unwrap();
            store.requeue_orphans(&[task_id], later).await.unwrap();
        });

        let wl = WorkerLoop::new(
            worker,
            h.dispatcher.clone(),
            h.leases.clone(),
            Arc::new(SlowHandler(Duration::from_millis(500))),
            settings(50),
        );
        assert_eq!(wl.process(lease).await, TaskRun::Abandoned);

        let rec = h.store.get(task_id).await.unwrap().unwrap();
        assert_eq!(rec.status, TaskStatus::Queued);
        assert_eq!(rec.completed_at, None);
    }

    #[tokio::test]
    async fn group_drains_queue_and_stops() {
        let h = harness(TimeDelta::minutes(10));
        enqueue(&h.store, 6, 3).await;
        let handler = Arc::new(CountingHandler {
            calls: AtomicUsize::new(0),
            fail: false,
        });

        let group = WorkerGroup::spawn(
            3,
            &UlidGenerator::new(SystemClock),
            h.dispatcher.clone(),
            h.leases.clone(),
            handler.clone(),
            settings(1000),
        );
        assert_eq!(group.worker_ids().len(), 3);

        tokio::time::timeout(Duration::from_secs(2), async {
            while h.store.count_by_status().await.unwrap().succeeded < 6 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        group.shutdown_and_join().await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn failing_handler_exhausts_attempts() {
        let h = harness(TimeDelta::minutes(10));
        let ids = enqueue(&h.store, 1, 2).await;
        let handler = Arc::new(CountingHandler {
            calls: AtomicUsize::new(0),
            fail: true,
        });

        let group = WorkerGroup::spawn(
            1,
            &UlidGenerator::new(SystemClock),
            h.dispatcher.clone(),
            h.leases.clone(),
            handler.clone(),
            settings(1000),
        );

        tokio::time::timeout(Duration::from_secs(2), async {
            while h.store.count_by_status().await.unwrap().failed < 1 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        group.shutdown_and_join().await;

        let rec = h.store.get(ids[0]).await.unwrap().unwrap();
        assert_eq!(rec.attempts, 2);
        assert_eq!(rec.last_error.as_deref(), Some("extraction failed"));
        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
    }
}
