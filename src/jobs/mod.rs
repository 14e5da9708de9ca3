//! Asynchronous jobs: timers, async continuations and the executor that
//! acquires and runs them

pub mod commands;
pub mod exclusive;
pub mod executor;
pub mod handler;
pub mod model;

pub use commands::{
    AcquireJobsCmd, ExecuteJobCmd, FailureAction, GetJobExceptionStacktraceCmd, JobFailureCmd,
    JobQuery, JobRun, ListJobsCmd, LockJobCmd, SetJobRetriesCmd, UnlockJobCmd,
};
pub use exclusive::{ExclusiveGuard, ExclusiveJobLocks};
pub use executor::{CycleOutcome, JobExecutor};
pub use handler::{AsyncContinuationJobHandler, JobHandler, JobHandlerRegistry, TimerJobHandler};
pub use model::{Job, ASYNC_CONTINUATION_HANDLER, EXCEPTION_STACKTRACE_NAME, TIMER_HANDLER};
