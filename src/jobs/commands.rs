use super::model::{Job, EXCEPTION_STACKTRACE_NAME};
use crate::command::{Command, CommandContext};
use crate::core::clock::add_duration;
use crate::core::errors::{EngineError, Result};
use crate::history::HistoryEvent;
use crate::storage::{ByteArray, PersistenceSession};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error, warn};

/// Query due, unlocked jobs. Read-only; locking happens per job in [`LockJobCmd`].
#[derive(Debug, Clone)]
pub struct AcquireJobsCmd {
    pub limit: usize,
}

#[async_trait]
impl Command for AcquireJobsCmd {
    type Output = Vec<Job>;

    fn name(&self) -> &'static str {
        "AcquireJobs"
    }

    async fn execute(&self, ctx: &mut CommandContext) -> Result<Vec<Job>> {
        let now = ctx.now();
        ctx.persistence()?
            .find_acquirable_jobs(now, self.limit)
            .await
    }
}

/// Lock one job for `owner`. Fails with an optimistic lock conflict when
/// another node changed the job since it was queried.
#[derive(Debug, Clone)]
pub struct LockJobCmd {
    pub job: Job,
    pub owner: String,
    pub lock_duration: Duration,
}

#[async_trait]
impl Command for LockJobCmd {
    type Output = Job;

    fn name(&self) -> &'static str {
        "LockJob"
    }

    async fn execute(&self, ctx: &mut CommandContext) -> Result<Job> {
        let mut job = self.job.clone();
        job.lock(self.owner.clone(), add_duration(ctx.now(), self.lock_duration));
        ctx.persistence()?.update_job(job.clone())?;
        Ok(job)
    }
}

/// Release a lock held by `owner` without touching retries
#[derive(Debug, Clone)]
pub struct UnlockJobCmd {
    pub job_id: String,
    pub owner: String,
}

#[async_trait]
impl Command for UnlockJobCmd {
    type Output = ();

    fn name(&self) -> &'static str {
        "UnlockJob"
    }

    async fn execute(&self, ctx: &mut CommandContext) -> Result<()> {
        let persistence = ctx.persistence()?;
        if let Some(mut job) = persistence.find_job(&self.job_id).await? {
            if job.is_owned_by(&self.owner) {
                job.unlock();
                persistence.update_job(job)?;
            }
        }
        Ok(())
    }
}

/// How [`ExecuteJobCmd`] ended without error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobRun {
    Executed,
    /// Deleted by someone else before it ran
    Missing,
    /// Our lock expired and another node took the job
    LockLost,
}

/// Run a job's handler and delete the job, all in one transaction
#[derive(Debug, Clone)]
pub struct ExecuteJobCmd {
    pub job_id: String,
    /// Lock the caller expects to hold; `None` runs the job regardless
    pub lock_owner: Option<String>,
}

impl ExecuteJobCmd {
    pub fn new(job_id: impl Into<String>, lock_owner: Option<String>) -> Self {
        Self {
            job_id: job_id.into(),
            lock_owner,
        }
    }
}

#[async_trait]
impl Command for ExecuteJobCmd {
    type Output = JobRun;

    fn name(&self) -> &'static str {
        "ExecuteJob"
    }

    async fn execute(&self, ctx: &mut CommandContext) -> Result<JobRun> {
        let Some(job) = ctx.persistence()?.find_job(&self.job_id).await? else {
            debug!(job = %self.job_id, "Job vanished before execution");
            return Ok(JobRun::Missing);
        };
        if let Some(owner) = &self.lock_owner {
            if !job.is_owned_by(owner) {
                warn!(job = %job.id, owner = %owner, holder = ?job.lock_owner, "Job lock lost");
                return Ok(JobRun::LockLost);
            }
        }

        let handler = ctx.services().job_handlers.resolve(&job.handler_type)?;
        let execution = match &job.execution_id {
            Some(execution_id) => Some(
                ctx.persistence()?
                    .find_execution(execution_id)
                    .await?
                    .ok_or_else(|| {
                        EngineError::fault(format!(
                            "job {} references missing execution {}",
                            job.id, execution_id
                        ))
                    })?,
            ),
            None => None,
        };

        handler
            .execute(&job.handler_configuration, execution.as_ref(), ctx)
            .await
            .map_err(|e| handler_failure(&job.id, e))?;

        let persistence = ctx.persistence()?;
        if let Some(trace_id) = &job.exception_stacktrace_id {
            if let Some(trace) = persistence.find_byte_array(trace_id).await? {
                persistence.delete_byte_array(&trace);
            }
        }
        persistence.delete_job(&job);
        debug!(job = %job.id, handler = %job.handler_type, "Job executed");
        Ok(JobRun::Executed)
    }
}

/// Engine errors raised inside a handler keep their kind, except internal
/// ones which become job failures like any foreign error
fn handler_failure(job_id: &str, error: anyhow::Error) -> EngineError {
    match error.downcast::<EngineError>() {
        Ok(engine_error @ EngineError::Internal { .. }) => EngineError::JobExecutionFailure {
            job_id: job_id.to_string(),
            message: engine_error.to_string(),
            trace: engine_error.trace(),
            source: Some(Box::new(engine_error)),
        },
        Ok(engine_error) => engine_error,
        Err(foreign) => EngineError::job_failure(job_id, foreign),
    }
}

/// What to do with a job whose execution failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureAction {
    /// Decrement retries, record the exception, back off
    Retry,
    /// Unlock only; the job runs again on a later cycle
    Release,
    /// Retries to zero; needs an operator
    DeadLetter,
}

impl FailureAction {
    pub fn for_error(error: &EngineError) -> Self {
        match error {
            EngineError::OptimisticLockConflict { .. } => FailureAction::Release,
            EngineError::JobExecutionFailure { .. } | EngineError::Internal { .. } => {
                FailureAction::Retry
            }
            EngineError::EngineFault { .. }
            | EngineError::Configuration { .. }
            | EngineError::Validation { .. }
            | EngineError::NotFound { .. } => FailureAction::DeadLetter,
        }
    }
}

/// Record a failed execution on the job, in its own transaction
#[derive(Debug, Clone)]
pub struct JobFailureCmd {
    pub job_id: String,
    /// Lock the failed run held; `None` for runs outside acquisition
    pub expected_owner: Option<String>,
    pub action: FailureAction,
    pub message: String,
    pub trace: String,
}

impl JobFailureCmd {
    pub fn from_error(
        job_id: impl Into<String>,
        expected_owner: Option<String>,
        error: &EngineError,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            expected_owner,
            action: FailureAction::for_error(error),
            message: error.to_string(),
            trace: error.trace(),
        }
    }
}

#[async_trait]
impl Command for JobFailureCmd {
    type Output = Option<Job>;

    fn name(&self) -> &'static str {
        "JobFailure"
    }

    async fn execute(&self, ctx: &mut CommandContext) -> Result<Option<Job>> {
        let now = ctx.now();
        let config = ctx.config().clone();
        let max_message = config.max_exception_message_length;

        let Some(mut job) = ctx.persistence()?.find_job(&self.job_id).await? else {
            warn!(job = %self.job_id, "Failed job no longer exists");
            return Ok(None);
        };

        // a live lease of another node keeps its lock and retries
        let held_elsewhere = job.is_locked_at(now)
            && !self
                .expected_owner
                .as_deref()
                .is_some_and(|owner| job.is_owned_by(owner));
        if held_elsewhere {
            if self.action == FailureAction::Release {
                debug!(job = %job.id, holder = ?job.lock_owner, "Job locked elsewhere, nothing to release");
                return Ok(Some(job));
            }
            record_exception(ctx.persistence()?, &mut job, &self.message, &self.trace, max_message).await?;
            warn!(job = %job.id, holder = ?job.lock_owner, error = %self.message, "Job failed while locked by another node");
            ctx.persistence()?.update_job(job.clone())?;
            ctx.history()?.record(HistoryEvent::JobFailed {
                job_id: job.id.clone(),
                process_instance_id: job.process_instance_id.clone(),
                retries_left: job.retries,
                message: job.exception_message.clone().unwrap_or_default(),
            });
            return Ok(Some(job));
        }
        job.unlock();

        match self.action {
            FailureAction::Release => {
                debug!(job = %job.id, "Released job after conflict");
            }
            FailureAction::Retry => {
                job.retries = job.retries.saturating_sub(1);
                let attempt = config.default_job_retries.saturating_sub(job.retries).max(1);
                let delay = config.retry_delay_for(attempt);
                record_exception(ctx.persistence()?, &mut job, &self.message, &self.trace, max_message).await?;
                if job.retries > 0 {
                    job.due_date = add_duration(now, delay);
                    warn!(job = %job.id, retries_left = job.retries, due = %job.due_date, error = %self.message, "Job failed, will retry");
                } else {
                    error!(job = %job.id, error = %self.message, "Job failed, retries exhausted");
                }
            }
            FailureAction::DeadLetter => {
                job.retries = 0;
                record_exception(ctx.persistence()?, &mut job, &self.message, &self.trace, max_message).await?;
                error!(job = %job.id, error = %self.message, "Job failed with a non-retryable error");
            }
        }

        ctx.persistence()?.update_job(job.clone())?;
        if self.action != FailureAction::Release {
            ctx.history()?.record(HistoryEvent::JobFailed {
                job_id: job.id.clone(),
                process_instance_id: job.process_instance_id.clone(),
                retries_left: job.retries,
                message: job.exception_message.clone().unwrap_or_default(),
            });
        }
        Ok(Some(job))
    }
}

fn truncate_message(message: &str, max_chars: usize) -> String {
    match message.char_indices().nth(max_chars) {
        Some((cut, _)) => message[..cut].to_string(),
        None => message.to_string(),
    }
}

async fn record_exception(
    persistence: &mut PersistenceSession,
    job: &mut Job,
    message: &str,
    trace: &str,
    max_message: usize,
) -> Result<()> {
    job.exception_message = Some(truncate_message(message, max_message));

    if let Some(trace_id) = &job.exception_stacktrace_id {
        if let Some(mut bytes) = persistence.find_byte_array(trace_id).await? {
            bytes.bytes = trace.as_bytes().to_vec();
            return persistence.update_byte_array(bytes);
        }
    }

    let bytes = ByteArray::new(EXCEPTION_STACKTRACE_NAME, trace.as_bytes().to_vec());
    job.exception_stacktrace_id = Some(bytes.id.clone());
    persistence.insert_byte_array(bytes)
}

/// Give a job new retries and forget its last failure, e.g. to revive a dead letter
#[derive(Debug, Clone)]
pub struct SetJobRetriesCmd {
    pub job_id: String,
    pub retries: u32,
}

#[async_trait]
impl Command for SetJobRetriesCmd {
    type Output = ();

    fn name(&self) -> &'static str {
        "SetJobRetries"
    }

    async fn execute(&self, ctx: &mut CommandContext) -> Result<()> {
        let persistence = ctx.persistence()?;
        let mut job = persistence.job(&self.job_id).await?;
        job.retries = self.retries;
        job.exception_message = None;
        if let Some(trace_id) = job.exception_stacktrace_id.take() {
            if let Some(trace) = persistence.find_byte_array(&trace_id).await? {
                persistence.delete_byte_array(&trace);
            }
        }
        persistence.update_job(job)?;
        debug!(job = %self.job_id, retries = self.retries, "Job retries set");
        Ok(())
    }
}

/// Full trace of a job's last failure
#[derive(Debug, Clone)]
pub struct GetJobExceptionStacktraceCmd {
    pub job_id: String,
}

#[async_trait]
impl Command for GetJobExceptionStacktraceCmd {
    type Output = Option<String>;

    fn name(&self) -> &'static str {
        "GetJobExceptionStacktrace"
    }

    async fn execute(&self, ctx: &mut CommandContext) -> Result<Option<String>> {
        let persistence = ctx.persistence()?;
        let job = persistence.job(&self.job_id).await?;
        let Some(trace_id) = job.exception_stacktrace_id else {
            return Ok(None);
        };
        Ok(persistence
            .find_byte_array(&trace_id)
            .await?
            .map(|bytes| bytes.text()))
    }
}

/// Job queries
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobQuery {
    ProcessInstance(String),
    Execution(String),
    DeadLetter { limit: usize },
}

#[derive(Debug, Clone)]
pub struct ListJobsCmd {
    pub query: JobQuery,
}

#[async_trait]
impl Command for ListJobsCmd {
    type Output = Vec<Job>;

    fn name(&self) -> &'static str {
        "ListJobs"
    }

    async fn execute(&self, ctx: &mut CommandContext) -> Result<Vec<Job>> {
        let persistence = ctx.persistence()?;
        match &self.query {
            JobQuery::ProcessInstance(id) => persistence.find_jobs_by_process_instance(id).await,
            JobQuery::Execution(id) => persistence.find_jobs_by_execution(id).await,
            JobQuery::DeadLetter { limit } => persistence.find_dead_letter_jobs(*limit).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_action_by_error_kind() {
        assert_eq!(
            FailureAction::for_error(&EngineError::conflict("Job", "j", 1)),
            FailureAction::Release
        );
        assert_eq!(
            FailureAction::for_error(&EngineError::job_failure("j", anyhow::anyhow!("boom"))),
            FailureAction::Retry
        );
        assert_eq!(
            FailureAction::for_error(&EngineError::fault("active execution at join")),
            FailureAction::DeadLetter
        );
        assert_eq!(
            FailureAction::for_error(&EngineError::configuration("no handler")),
            FailureAction::DeadLetter
        );
    }

    #[test]
    fn test_truncate_counts_characters() {
        assert_eq!(truncate_message("héllo", 2), "hé");
        assert_eq!(truncate_message("short", 100), "short");
    }

    #[test]
    fn test_internal_handler_error_becomes_job_failure() {
        let internal: anyhow::Error = EngineError::internal("service down").into();
        let failure = handler_failure("j1", internal);
        assert!(matches!(failure, EngineError::JobExecutionFailure { .. }));

        let fault: anyhow::Error = EngineError::fault("tree broken").into();
        assert!(handler_failure("j1", fault).is_fault());
    }
}
