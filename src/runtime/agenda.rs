use super::behavior;
use crate::command::CommandContext;
use crate::core::errors::{EngineError, Result};
use std::collections::VecDeque;
use tracing::trace;

/// A pending step of process execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// Arrive at the execution's current activity; honours `async_before`
    ExecuteActivity { execution_id: String },
    /// Run the activity behaviour now, even when it is marked `async_before`
    ExecuteActivitySync { execution_id: String },
    /// Take the activity's outgoing flows
    LeaveActivity { execution_id: String },
    TakeTransition {
        execution_id: String,
        transition_id: String,
    },
    End { execution_id: String },
}

/// Work queue driving executions through the process graph.
///
/// Behaviours plan operations instead of calling each other, so arbitrarily
/// long synchronous paths run in a loop rather than by recursion.
#[derive(Debug, Default)]
pub struct Agenda {
    operations: VecDeque<Operation>,
}

impl Agenda {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn plan(&mut self, operation: Operation) {
        self.operations.push_back(operation);
    }

    /// Take the next operation without running it
    pub fn pop(&mut self) -> Option<Operation> {
        self.operations.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    /// Run until no operations are left or the first one fails
    pub async fn run(&mut self, ctx: &mut CommandContext) -> Result<()> {
        let limit = ctx.config().max_operations_per_command;
        let mut executed = 0usize;

        while let Some(operation) = self.pop() {
            executed += 1;
            if executed > limit {
                return Err(EngineError::fault(format!(
                    "more than {} operations in one command; the process loops without a wait state",
                    limit
                )));
            }
            trace!(?operation, "Running operation");

            match operation {
                Operation::ExecuteActivity { execution_id } => {
                    behavior::execute_activity(ctx, self, &execution_id, true).await?
                }
                Operation::ExecuteActivitySync { execution_id } => {
                    behavior::execute_activity(ctx, self, &execution_id, false).await?
                }
                Operation::LeaveActivity { execution_id } => {
                    behavior::leave(ctx, self, &execution_id).await?
                }
                Operation::TakeTransition {
                    execution_id,
                    transition_id,
                } => behavior::take_transition(ctx, self, &execution_id, &transition_id).await?,
                Operation::End { execution_id } => behavior::end(ctx, self, &execution_id).await?,
            }
        }
        Ok(())
    }
}
