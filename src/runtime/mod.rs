//! Process runtime: definitions, the execution tree and the agenda that moves
//! executions through it

pub mod agenda;
pub mod behavior;
pub mod commands;
pub mod concurrency;
pub mod definition;
pub mod execution;

pub use agenda::{Agenda, Operation};
pub use behavior::{ActivityHandler, ActivityHandlerRegistry};
pub use commands::{
    CompleteTaskCmd, DeleteProcessInstanceCmd, GetExecutionCmd, ListExecutionsCmd, SignalCmd,
    StartProcessInstanceCmd,
};
pub use concurrency::JoinPartition;
pub use definition::{
    Activity, ActivityKind, Condition, DefinitionRepository, ProcessDefinition,
    ProcessDefinitionBuilder, Transition,
};
pub use execution::Execution;
