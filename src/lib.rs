//! # procflow
//!
//! An embeddable business-process engine. Process definitions are graphs of
//! activities and sequence flows; running instances are trees of executions
//! that fork at parallel gateways and join again. Every engine operation runs
//! as a command inside one transaction, and timers and async continuations are
//! persisted as jobs that a job executor acquires, locks and runs.
//!
//! ```no_run
//! use procflow::{ProcessDefinition, ProcessEngine, EngineConfig};
//!
//! # async fn demo() -> procflow::Result<()> {
//! let engine = ProcessEngine::builder()
//!     .with_config(EngineConfig::development())
//!     .build()?;
//!
//! engine.deploy(
//!     ProcessDefinition::builder("review")
//!         .start_event("start")
//!         .user_task("review")
//!         .end_event("end")
//!         .flow("start", "review")
//!         .flow("review", "end")
//!         .build()?,
//! );
//!
//! let instance = engine.start_process_instance("review").await?;
//! engine.complete_task(&instance.id).await?;
//! # Ok(())
//! # }
//! ```

pub mod command;
pub mod core;
pub mod engine;
pub mod history;
pub mod jobs;
pub mod runtime;
pub mod storage;

pub use crate::command::{Command, CommandContext, CommandExecutor};
pub use crate::core::{
    Clock, EngineConfig, EngineConfigBuilder, EngineError, ErrorCategory, ManualClock, Result,
    SystemClock,
};
pub use crate::engine::{EngineServices, ProcessEngine, ProcessEngineBuilder};
pub use crate::history::{BufferingHistorySink, HistoryEvent, HistorySink, LoggingHistorySink};
pub use crate::jobs::{Job, JobExecutor, JobHandler, JobRun};
pub use crate::runtime::{ActivityHandler, Execution, ProcessDefinition};
pub use crate::storage::{EntityStore, MemoryStore};
