//! Task scheduling.
//!
//! Spawns one tokio task per declared Task. Each loop runs a cycle, then
//! sleeps for the requeue delay or until an external trigger wakes it.
//! A semaphore bounds how many cycles run at once across all Tasks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{Notify, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;

use remedy_core::types::{Phase, TaskKey, TaskSpec, TaskStatus};

use crate::error::{Result, SupervisorError};
use crate::reconciler::{CycleReport, Pipeline, TaskRuntime, WithdrawOutcome};

struct TaskHandle {
    runtime: Arc<TaskRuntime>,
    wake: Arc<Notify>,
    join: JoinHandle<()>,
}

/// Runs every declared Task on a bounded worker pool.
pub struct Supervisor {
    pipeline: Arc<Pipeline>,
    pool: Arc<Semaphore>,
    tasks: Mutex<HashMap<TaskKey, TaskHandle>>,
}

impl Supervisor {
    pub fn new(pipeline: Arc<Pipeline>, worker_pool_size: usize) -> Self {
        Self {
            pipeline,
            pool: Arc::new(Semaphore::new(worker_pool_size.max(1))),
            tasks: Mutex::new(HashMap::new()),
        }
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    fn tasks(&self) -> std::sync::MutexGuard<'_, HashMap<TaskKey, TaskHandle>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Declare or update a Task. Returns its generation.
    ///
    /// Re-declaring a retired Task starts it afresh.
    pub fn declare(&self, spec: TaskSpec) -> u64 {
        let key = spec.key.clone();
        let mut tasks = self.tasks();

        if let Some(handle) = tasks.get(&key) {
            if handle.runtime.phase() != Phase::Retired {
                let generation = handle.runtime.update_spec(spec);
                handle.wake.notify_one();
                return generation;
            }
        }

        let runtime = Arc::new(TaskRuntime::new(spec, self.pipeline.history_cap()));
        let wake = Arc::new(Notify::new());
        let join = tokio::spawn(task_loop(
            self.pipeline.clone(),
            runtime.clone(),
            wake.clone(),
            self.pool.clone(),
        ));
        tracing::info!(task = %key, "Task declared");

        if let Some(previous) = tasks.insert(
            key,
            TaskHandle {
                runtime,
                wake,
                join,
            },
        ) {
            previous.join.abort();
        }
        1
    }

    /// Withdraw a Task. Its history is kept and stays readable.
    pub fn withdraw(&self, key: &TaskKey) -> Result<WithdrawOutcome> {
        let tasks = self.tasks();
        let handle = tasks
            .get(key)
            .ok_or_else(|| SupervisorError::UnknownTask(key.to_string()))?;
        let outcome = handle.runtime.withdraw(&self.pipeline);
        handle.wake.notify_one();
        Ok(outcome)
    }

    /// Ask a Task to run a cycle now. Dropped if a cycle is already in flight.
    pub fn trigger(&self, key: &TaskKey, reason: &str) -> Result<()> {
        let tasks = self.tasks();
        let handle = tasks
            .get(key)
            .ok_or_else(|| SupervisorError::UnknownTask(key.to_string()))?;
        if !handle.runtime.coalesce_if_busy(&self.pipeline, reason) {
            handle.wake.notify_one();
        }
        Ok(())
    }

    pub fn status(&self, key: &TaskKey) -> Result<TaskStatus> {
        self.tasks()
            .get(key)
            .map(|handle| handle.runtime.status())
            .ok_or_else(|| SupervisorError::UnknownTask(key.to_string()))
    }

    /// Periodically forget expired idempotency entries.
    pub fn spawn_ledger_purge(&self, every: Duration) -> JoinHandle<()> {
        let pipeline = self.pipeline.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every.max(Duration::from_secs(1)));
            loop {
                ticker.tick().await;
                let purged = pipeline.ledger().purge_expired(Instant::now());
                if purged > 0 {
                    tracing::debug!(purged, "Expired ledger entries purged");
                }
            }
        })
    }

    /// Stop every Task loop. In-flight cycles are cancelled and rolled back.
    pub async fn shutdown(&self) {
        let handles: Vec<JoinHandle<()>> = self.tasks().drain().map(|(_, h)| h.join).collect();
        for handle in handles {
            handle.abort();
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    tracing::error!(error = %e, "Task loop panicked");
                }
            }
        }
        tracing::info!("Supervisor stopped");
    }
}

async fn task_loop(
    pipeline: Arc<Pipeline>,
    runtime: Arc<TaskRuntime>,
    wake: Arc<Notify>,
    pool: Arc<Semaphore>,
) {
    loop {
        let result = {
            let Ok(_permit) = pool.acquire().await else {
                break;
            };
            runtime.run_cycle(&pipeline).await
        };

        let delay = match result {
            Ok(report) if report.phase == Phase::Retired => break,
            Ok(report) => report.requeue_after.unwrap_or(pipeline.requeue().poll),
            Err(e) => {
                tracing::error!(error = %e, "Cycle failed");
                pipeline.requeue().backoff_base
            }
        };

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = wake.notified() => {}
        }
    }
}

/// Run one cycle for each runtime, bounded by `pool_size`.
pub async fn run_once(
    pipeline: Arc<Pipeline>,
    runtimes: Vec<Arc<TaskRuntime>>,
    pool_size: usize,
) -> Vec<Result<CycleReport>> {
    let pool = Arc::new(Semaphore::new(pool_size.max(1)));
    let mut set = JoinSet::new();

    for (index, runtime) in runtimes.into_iter().enumerate() {
        let pipeline = pipeline.clone();
        let pool = pool.clone();
        set.spawn(async move {
            let result = match pool.acquire().await {
                Ok(_permit) => runtime.run_cycle(&pipeline).await,
                Err(_) => Err(SupervisorError::PoolClosed),
            };
            (index, result)
        });
    }

    let mut results: Vec<(usize, Result<CycleReport>)> = Vec::new();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(entry) => results.push(entry),
            Err(e) => tracing::error!(error = %e, "Cycle task panicked"),
        }
    }
    results.sort_by_key(|(index, _)| *index);
    results.into_iter().map(|(_, result)| result).collect()
}
