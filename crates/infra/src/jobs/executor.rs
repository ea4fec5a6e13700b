//! Job executor with retry and backoff logic.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::store::JobStore;
use super::types::{Job, JobKind, JobResult, JobStatus};

/// Something that can run a claimed job.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> JobResult;
}

#[async_trait]
impl<F> JobHandler for F
where
    F: Fn(&Job) -> JobResult + Send + Sync,
{
    async fn handle(&self, job: &Job) -> JobResult {
        self(job)
    }
}

/// Job executor configuration.
#[derive(Debug, Clone)]
pub struct JobExecutorConfig {
    /// How often an idle worker polls for new jobs
    pub poll_interval: Duration,
    /// Number of concurrent worker tasks
    pub workers: usize,
    /// Name for logging
    pub name: String,
}

impl Default for JobExecutorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            workers: 4,
            name: "job-executor".to_string(),
        }
    }
}

impl JobExecutorConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

/// Handle to control a running executor pool.
#[derive(Debug)]
pub struct JobExecutorHandle {
    shutdown: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
    stats: Arc<Mutex<ExecutorStats>>,
    started: Instant,
}

impl JobExecutorHandle {
    /// Request graceful shutdown and wait for in-flight jobs to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for join in self.joins {
            let _ = join.await;
        }
    }

    /// Get current executor statistics.
    pub fn stats(&self) -> ExecutorStats {
        let mut stats = self
            .stats
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        stats.uptime_secs = self.started.elapsed().as_secs();
        stats
    }
}

/// Executor runtime statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ExecutorStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub jobs_dead_lettered: u64,
    pub current_running: usize,
    pub uptime_secs: u64,
}

/// Background job executor.
///
/// Polls a job store for pending jobs, executes them with registered handlers,
/// and handles retries and dead-lettering.
pub struct JobExecutor<S: JobStore> {
    store: S,
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl<S: JobStore + 'static> JobExecutor<S> {
    /// Create a new executor with the given store.
    pub fn new(store: S) -> Self {
        Self {
            store,
            handlers: HashMap::new(),
        }
    }

    /// Register a handler for a job kind: an exact type name, a `prefix.*`
    /// category, or `*`.
    pub fn register_handler<H>(&mut self, kind_pattern: impl Into<String>, handler: H)
    where
        H: JobHandler + 'static,
    {
        self.handlers.insert(kind_pattern.into(), Arc::new(handler));
    }

    /// Register an already shared handler.
    pub fn register_shared(&mut self, kind_pattern: impl Into<String>, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(kind_pattern.into(), handler);
    }

    fn get_handler(&self, kind: &JobKind) -> Option<&Arc<dyn JobHandler>> {
        let type_name = kind.type_name();
        if let Some(h) = self.handlers.get(type_name) {
            return Some(h);
        }

        // Category match: "call.*" matches "call.analyze".
        let category = self.handlers.iter().find(|(pattern, _)| {
            pattern
                .strip_suffix(".*")
                .is_some_and(|prefix| type_name.starts_with(prefix))
        });
        if let Some((_, h)) = category {
            return Some(h);
        }

        self.handlers.get("*")
    }

    /// Spawn `config.workers` tokio tasks that drain the store.
    pub fn spawn(self, config: JobExecutorConfig) -> JobExecutorHandle
    where
        S: Send + Sync,
    {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = Arc::new(Mutex::new(ExecutorStats::default()));
        let executor = Arc::new(self);

        let joins = (0..config.workers.max(1))
            .map(|index| {
                let executor = executor.clone();
                let config = config.clone();
                let shutdown = shutdown_rx.clone();
                let stats = stats.clone();
                tokio::spawn(async move { executor_loop(executor, config, index, shutdown, stats).await })
            })
            .collect();

        JobExecutorHandle {
            shutdown: shutdown_tx,
            joins,
            stats,
            started: Instant::now(),
        }
    }

    /// Claim and run at most one ready job. Returns false when the queue had
    /// nothing ready.
    pub async fn run_next(&self) -> Result<bool, String> {
        match self.store.claim_next().map_err(|e| e.to_string())? {
            Some(mut job) => {
                let _ = self.execute_one(&mut job).await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Run ready jobs until the queue has nothing ready (tests, admin drains).
    pub async fn drain(&self) -> Result<usize, String> {
        let mut ran = 0;
        while self.run_next().await? {
            ran += 1;
        }
        Ok(ran)
    }

    /// Execute a claimed job and persist the outcome.
    pub async fn execute_one(&self, job: &mut Job) -> Result<(), String> {
        let started = Utc::now();

        let Some(handler) = self.get_handler(&job.kind) else {
            let error = format!("no handler for job kind: {}", job.kind.type_name());
            warn!(job_id = %job.id, error = %error, "no handler for job");
            job.mark_failed(error.clone(), started);
            self.persist_failure(job, &error)?;
            return Err(error);
        };

        match handler.handle(job).await {
            JobResult::Success => {
                job.mark_completed(started);
                self.store.update(job).map_err(|e| e.to_string())?;
                debug!(job_id = %job.id, kind = job.kind.type_name(), "job completed");
                Ok(())
            }
            JobResult::Failure(error) => {
                job.mark_failed(error.clone(), started);
                self.persist_failure(job, &error)?;
                Err(error)
            }
        }
    }

    fn persist_failure(&self, job: &Job, error: &str) -> Result<(), String> {
        if matches!(job.status, JobStatus::DeadLettered { .. }) {
            warn!(job_id = %job.id, kind = job.kind.type_name(), error = %error, "job dead-lettered");
            self.store
                .dead_letter(job.clone(), error.to_string())
                .map_err(|e| e.to_string())
        } else {
            self.store.update(job).map_err(|e| e.to_string())
        }
    }
}

async fn executor_loop<S: JobStore + 'static>(
    executor: Arc<JobExecutor<S>>,
    config: JobExecutorConfig,
    index: usize,
    mut shutdown: watch::Receiver<bool>,
    stats: Arc<Mutex<ExecutorStats>>,
) {
    info!(executor = %config.name, worker = index, "job executor started");

    loop {
        if *shutdown.borrow() {
            break;
        }

        match executor.store.claim_next() {
            Ok(Some(mut job)) => {
                debug!(
                    executor = %config.name,
                    worker = index,
                    job_id = %job.id,
                    kind = job.kind.type_name(),
                    attempt = job.attempt,
                    "claimed job"
                );

                update_stats(&stats, |s| s.current_running += 1);
                let result = executor.execute_one(&mut job).await;
                update_stats(&stats, |s| {
                    s.current_running = s.current_running.saturating_sub(1);
                    s.jobs_processed += 1;
                    match &result {
                        Ok(()) => s.jobs_succeeded += 1,
                        Err(_) => {
                            s.jobs_failed += 1;
                            if matches!(job.status, JobStatus::DeadLettered { .. }) {
                                s.jobs_dead_lettered += 1;
                            }
                        }
                    }
                });

                if let Err(e) = result {
                    debug!(
                        executor = %config.name,
                        job_id = %job.id,
                        error = %e,
                        status = ?job.status,
                        "job execution failed"
                    );
                }
            }
            Ok(None) => idle(&config, &mut shutdown).await,
            Err(e) => {
                error!(executor = %config.name, error = %e, "failed to claim job");
                idle(&config, &mut shutdown).await;
            }
        }
    }

    info!(executor = %config.name, worker = index, "job executor stopped");
}

async fn idle(config: &JobExecutorConfig, shutdown: &mut watch::Receiver<bool>) {
    tokio::select! {
        _ = tokio::time::sleep(config.poll_interval) => {}
        _ = shutdown.changed() => {}
    }
}

fn update_stats(stats: &Mutex<ExecutorStats>, f: impl FnOnce(&mut ExecutorStats)) {
    let mut guard = stats.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    f(&mut guard);
}
