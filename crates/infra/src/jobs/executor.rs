//! Polling job executor with retries and dead-lettering.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use engage_core::TenantId;

use super::store::{JobStore, JobStoreError};
use super::types::{Job, JobResult, JobStatus};

pub type JobHandler = Arc<dyn Fn(&Job) -> JobResult + Send + Sync>;

/// Runs once a job has used up its attempts; receives the last error.
pub type DeadLetterHook = Arc<dyn Fn(&Job, &str) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct JobExecutorConfig {
    pub poll_interval: Duration,
    /// Worker threads polling the store.
    pub max_concurrent: usize,
    pub name: String,
    pub tenant_id: Option<TenantId>,
}

impl Default for JobExecutorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            max_concurrent: 4,
            name: "job-executor".to_string(),
            tenant_id: None,
        }
    }
}

impl JobExecutorConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_tenant(mut self, tenant_id: TenantId) -> Self {
        self.tenant_id = Some(tenant_id);
        self
    }

    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExecutorStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub jobs_dead_lettered: u64,
    pub current_running: usize,
    pub uptime_secs: u64,
}

#[derive(Debug)]
pub struct JobExecutorHandle {
    stop: Arc<AtomicBool>,
    workers: Vec<thread::JoinHandle<()>>,
    stats: Arc<Mutex<ExecutorStats>>,
}

impl JobExecutorHandle {
    /// Stop polling and wait for in-flight jobs.
    pub fn shutdown(self) {
        self.stop.store(true, Ordering::SeqCst);
        for worker in self.workers {
            let _ = worker.join();
        }
    }

    pub fn stats(&self) -> ExecutorStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

/// Outcome of one execution, as seen by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Execution {
    Succeeded,
    /// Failed, another attempt is scheduled.
    Retrying(String),
    DeadLettered(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error(transparent)]
    Store(#[from] JobStoreError),
}

/// Handlers are looked up by exact kind name, then `prefix.*`, then `*`.
pub struct JobExecutor<S: JobStore> {
    store: S,
    handlers: HashMap<String, JobHandler>,
    dead_letter_hooks: HashMap<String, DeadLetterHook>,
}

fn lookup<'a, T>(map: &'a HashMap<String, T>, type_name: &str) -> Option<&'a T> {
    if let Some(found) = map.get(type_name) {
        return Some(found);
    }
    map.iter()
        .filter_map(|(pattern, v)| pattern.strip_suffix(".*").map(|prefix| (prefix, v)))
        .filter(|(prefix, _)| type_name.starts_with(prefix) && type_name[prefix.len()..].starts_with('.'))
        .max_by_key(|(prefix, _)| prefix.len())
        .map(|(_, v)| v)
        .or_else(|| map.get("*"))
}

impl<S: JobStore + 'static> JobExecutor<S> {
    pub fn new(store: S) -> Self {
        Self { store, handlers: HashMap::new(), dead_letter_hooks: HashMap::new() }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn register_handler<F>(&mut self, kind_pattern: impl Into<String>, handler: F)
    where
        F: Fn(&Job) -> JobResult + Send + Sync + 'static,
    {
        self.handlers.insert(kind_pattern.into(), Arc::new(handler));
    }

    pub fn on_dead_letter<F>(&mut self, kind_pattern: impl Into<String>, hook: F)
    where
        F: Fn(&Job, &str) + Send + Sync + 'static,
    {
        self.dead_letter_hooks.insert(kind_pattern.into(), Arc::new(hook));
    }

    /// Run one claimed job and persist its new state.
    pub fn execute_one(&self, job: &mut Job) -> Result<Execution, ExecutorError> {
        let started = Utc::now();

        let result = match lookup(&self.handlers, job.kind.type_name()) {
            Some(handler) => handler(job),
            None => {
                error!(job_id = %job.id, kind = job.kind.type_name(), "no handler registered for job kind");
                JobResult::Failure(format!("no handler for job kind: {}", job.kind.type_name()))
            }
        };

        match result {
            JobResult::Success => {
                job.mark_completed(started);
                self.store.update(job)?;
                debug!(job_id = %job.id, "job completed");
                Ok(Execution::Succeeded)
            }
            JobResult::Failure(error) => self.fail(job, error, started, None),
            JobResult::RetryAfter(delay) => self.fail(job, "retry requested".into(), started, Some(delay)),
        }
    }

    fn fail(
        &self,
        job: &mut Job,
        error: String,
        started: chrono::DateTime<Utc>,
        delay: Option<Duration>,
    ) -> Result<Execution, ExecutorError> {
        job.mark_failed(error.clone(), started);

        if let JobStatus::DeadLettered { attempts, .. } = job.status {
            info!(job_id = %job.id, kind = job.kind.type_name(), attempts, error = %error, "job dead-lettered");
            self.store.update(job)?;
            self.store.dead_letter(job.clone(), error.clone())?;
            if let Some(hook) = lookup(&self.dead_letter_hooks, job.kind.type_name()) {
                hook(job, &error);
            }
            return Ok(Execution::DeadLettered(error));
        }

        if let Some(delay) = delay {
            job.scheduled_at = Some(Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default());
        }
        warn!(job_id = %job.id, attempt = job.attempt, error = %error, "job failed, retry scheduled");
        self.store.update(job)?;
        Ok(Execution::Retrying(error))
    }

    /// Claim and run jobs until none is ready. Returns how many ran.
    pub fn run_until_idle(&self, tenant_id: Option<TenantId>) -> Result<usize, ExecutorError> {
        let mut ran = 0;
        while let Some(mut job) = self.store.claim_next(tenant_id)? {
            self.execute_one(&mut job)?;
            ran += 1;
        }
        Ok(ran)
    }

    /// Start `max_concurrent` polling workers.
    pub fn spawn(self, config: JobExecutorConfig) -> io::Result<JobExecutorHandle>
    where
        S: Send + Sync,
    {
        let executor = Arc::new(self);
        let stop = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(Mutex::new(ExecutorStats::default()));
        let started = Instant::now();

        info!(executor = %config.name, workers = config.max_concurrent, "job executor started");

        let mut workers = Vec::with_capacity(config.max_concurrent);
        for n in 0..config.max_concurrent.max(1) {
            let (worker_executor, worker_stop, worker_stats, worker_config) =
                (executor.clone(), stop.clone(), stats.clone(), config.clone());
            let worker = thread::Builder::new()
                .name(format!("{}-{n}", config.name))
                .spawn(move || worker_loop(&worker_executor, &worker_config, &worker_stop, &worker_stats, started));
            match worker {
                Ok(w) => workers.push(w),
                Err(e) => {
                    stop.store(true, Ordering::SeqCst);
                    return Err(e);
                }
            }
        }

        Ok(JobExecutorHandle { stop, workers, stats })
    }
}

fn worker_loop<S: JobStore + 'static>(
    executor: &JobExecutor<S>,
    config: &JobExecutorConfig,
    stop: &AtomicBool,
    stats: &Mutex<ExecutorStats>,
    started: Instant,
) {
    let update = |f: &dyn Fn(&mut ExecutorStats)| {
        if let Ok(mut s) = stats.lock() {
            f(&mut s);
            s.uptime_secs = started.elapsed().as_secs();
        }
    };

    while !stop.load(Ordering::SeqCst) {
        match executor.store.claim_next(config.tenant_id) {
            Ok(Some(mut job)) => {
                debug!(executor = %config.name, job_id = %job.id, kind = job.kind.type_name(), "claimed job");
                update(&|s| s.current_running += 1);

                let outcome = executor.execute_one(&mut job);

                update(&|s| {
                    s.current_running = s.current_running.saturating_sub(1);
                    s.jobs_processed += 1;
                    match &outcome {
                        Ok(Execution::Succeeded) => s.jobs_succeeded += 1,
                        Ok(Execution::Retrying(_)) => s.jobs_failed += 1,
                        Ok(Execution::DeadLettered(_)) => {
                            s.jobs_failed += 1;
                            s.jobs_dead_lettered += 1;
                        }
                        Err(_) => s.jobs_failed += 1,
                    }
                });

                if let Err(e) = outcome {
                    error!(executor = %config.name, job_id = %job.id, error = %e, "failed to persist job state");
                }
            }
            Ok(None) => {
                debug!(executor = %config.name, "no ready jobs");
                thread::sleep(config.poll_interval);
            }
            Err(e) => {
                error!(executor = %config.name, error = %e, "failed to claim job");
                thread::sleep(config.poll_interval);
            }
        }
    }

    info!(executor = %config.name, "job executor worker stopped");
}
