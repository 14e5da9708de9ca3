use super::commands::{
    AcquireJobsCmd, ExecuteJobCmd, JobFailureCmd, JobRun, LockJobCmd, UnlockJobCmd,
};
use super::exclusive::ExclusiveJobLocks;
use super::model::Job;
use crate::command::CommandExecutor;
use crate::core::config::EngineConfig;
use crate::core::errors::{EngineError, Result};
use futures::future::join_all;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// Result of one acquisition cycle
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleOutcome {
    /// Jobs locked to this node
    pub acquired: usize,
    /// Jobs handed to a worker
    pub dispatched: usize,
    /// Jobs unlocked again because no worker was free
    pub released: usize,
    /// Every worker was busy at some point of the cycle
    pub saturated: bool,
}

/// Acquires due jobs, locks them to this node and runs them on a bounded
/// worker pool.
///
/// Each job runs in its own command. A failure is recorded by a separate
/// [`JobFailureCmd`] after the job's transaction rolled back.
pub struct JobExecutor {
    commands: CommandExecutor,
    config: EngineConfig,
    workers: Arc<Semaphore>,
    exclusive: ExclusiveJobLocks,
    notify: Arc<Notify>,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl JobExecutor {
    pub fn new(commands: CommandExecutor) -> Self {
        let services = commands.services().clone();
        let config = services.config.clone();
        Self {
            workers: Arc::new(Semaphore::new(config.max_workers)),
            notify: services.job_notify.clone(),
            exclusive: ExclusiveJobLocks::new(),
            shutdown_tx: Mutex::new(None),
            handle: Mutex::new(None),
            commands,
            config,
        }
    }

    /// Lock owner this executor writes on acquired jobs
    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    pub fn is_running(&self) -> bool {
        self.handle.lock().is_some()
    }

    /// Query up to `limit` due jobs and lock each to this node. Jobs another
    /// node locked in between are skipped.
    pub async fn acquire_jobs(&self, limit: usize) -> Result<Vec<Job>> {
        let candidates = self.commands.execute(AcquireJobsCmd { limit }).await?;

        // each lock is its own command so one lost race only skips that job
        let attempts = candidates.into_iter().map(|job| {
            let job_id = job.id.clone();
            let lock = LockJobCmd {
                job,
                owner: self.config.node_id.clone(),
                lock_duration: self.config.lock_duration,
            };
            async move { (job_id, self.commands.execute(lock).await) }
        });

        let mut locked = Vec::new();
        for (job_id, result) in join_all(attempts).await {
            match result {
                Ok(job) => locked.push(job),
                Err(e) if e.is_conflict() => {
                    debug!(job = %job_id, "Job was acquired by another node");
                }
                Err(e) => return Err(e),
            }
        }

        if !locked.is_empty() {
            debug!(node = %self.config.node_id, count = locked.len(), "Acquired jobs");
        }
        Ok(locked)
    }

    /// Acquire what the free workers can take and dispatch it
    pub async fn run_cycle(&self) -> Result<CycleOutcome> {
        let available = self.workers.available_permits();
        if available == 0 {
            return Ok(CycleOutcome {
                saturated: true,
                ..Default::default()
            });
        }

        let limit = available.min(self.config.acquisition_batch_size);
        let jobs = self.acquire_jobs(limit).await?;
        let mut outcome = CycleOutcome {
            acquired: jobs.len(),
            ..Default::default()
        };

        for job in jobs {
            match self.workers.clone().try_acquire_owned() {
                Ok(permit) => {
                    self.dispatch(job, permit);
                    outcome.dispatched += 1;
                }
                Err(_) => {
                    outcome.saturated = true;
                    self.release(job).await;
                    outcome.released += 1;
                }
            }
        }
        Ok(outcome)
    }

    /// Run one cycle and wait for its jobs to finish
    pub async fn execute_due_jobs(&self) -> Result<CycleOutcome> {
        let outcome = self.run_cycle().await?;
        self.wait_idle().await?;
        Ok(outcome)
    }

    /// Wait until no job is running
    pub async fn wait_idle(&self) -> Result<()> {
        let permits = u32::try_from(self.config.max_workers).map_err(|_| {
            EngineError::configuration_field("worker pool too large", "max_workers")
        })?;
        let _all = self
            .workers
            .acquire_many(permits)
            .await
            .map_err(|e| EngineError::internal_with_source("worker pool closed", e))?;
        Ok(())
    }

    /// Run a job right away on the calling task, ignoring its lock and due date.
    /// A failure is recorded on the job before it is returned.
    pub async fn execute_job_now(&self, job_id: &str) -> Result<JobRun> {
        match self
            .commands
            .execute(ExecuteJobCmd::new(job_id, None))
            .await
        {
            Ok(run) => Ok(run),
            Err(e) => {
                record_failure(&self.commands, job_id, None, &e).await;
                Err(e)
            }
        }
    }

    /// Start the acquisition loop on the current runtime
    pub fn start(self: &Arc<Self>) {
        let mut handle = self.handle.lock();
        if handle.is_some() {
            warn!(node = %self.config.node_id, "Job executor already running");
            return;
        }

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        *self.shutdown_tx.lock() = Some(shutdown_tx);

        let executor = self.clone();
        *handle = Some(tokio::spawn(async move {
            info!(
                node = %executor.config.node_id,
                workers = executor.config.max_workers,
                "Job executor started"
            );
            loop {
                let full_batch = match executor.run_cycle().await {
                    Ok(outcome) => {
                        !outcome.saturated
                            && outcome.acquired == executor.config.acquisition_batch_size
                    }
                    Err(e) => {
                        warn!(error = %e, "Job acquisition failed");
                        false
                    }
                };
                if full_batch {
                    // more may be due; poll again without waiting
                    tokio::task::yield_now().await;
                    continue;
                }

                let wait = executor.idle_wait();
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = executor.notify.notified() => {
                        debug!("Job executor woken by new jobs");
                    }
                    _ = sleep(wait) => {}
                }
            }
            info!(node = %executor.config.node_id, "Job executor stopped");
        }));
    }

    /// Stop the acquisition loop and wait for running jobs
    pub async fn shutdown(&self) -> Result<()> {
        if let Some(tx) = self.shutdown_tx.lock().take() {
            let _ = tx.send(());
        }
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            handle
                .await
                .map_err(|e| EngineError::internal_with_source("job executor loop panicked", e))?;
        }
        self.wait_idle().await
    }

    fn idle_wait(&self) -> Duration {
        let wait = self.config.acquisition_wait;
        let jitter_ms = (wait.as_millis() as u64) / 10;
        if jitter_ms == 0 {
            wait
        } else {
            wait + Duration::from_millis(fastrand::u64(0..=jitter_ms))
        }
    }

    fn dispatch(&self, job: Job, permit: OwnedSemaphorePermit) {
        let commands = self.commands.clone();
        let exclusive = self.exclusive.clone();
        let owner = self.config.node_id.clone();
        tokio::spawn(async move {
            run_job(commands, exclusive, owner, job).await;
            drop(permit);
        });
    }

    async fn release(&self, job: Job) {
        let unlock = UnlockJobCmd {
            job_id: job.id.clone(),
            owner: self.config.node_id.clone(),
        };
        if let Err(e) = self.commands.execute(unlock).await {
            warn!(job = %job.id, error = %e, "Failed to release job; it stays locked until expiry");
        }
    }
}

async fn run_job(commands: CommandExecutor, exclusive: ExclusiveJobLocks, owner: String, job: Job) {
    let _guard = match (&job.process_instance_id, job.exclusive) {
        (Some(process_instance_id), true) => Some(exclusive.lock(process_instance_id).await),
        _ => None,
    };

    match commands
        .execute(ExecuteJobCmd::new(&job.id, Some(owner.clone())))
        .await
    {
        Ok(JobRun::Executed) => {}
        Ok(run) => debug!(job = %job.id, outcome = ?run, "Job not executed"),
        Err(e) => record_failure(&commands, &job.id, Some(owner), &e).await,
    }
}

async fn record_failure(
    commands: &CommandExecutor,
    job_id: &str,
    owner: Option<String>,
    failure: &EngineError,
) {
    if let Err(e) = commands
        .execute(JobFailureCmd::from_error(job_id, owner, failure))
        .await
    {
        error!(
            job = job_id,
            failure = %failure,
            error = %e,
            "Could not record job failure; the job stays locked until expiry"
        );
    }
}
