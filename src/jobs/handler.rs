use crate::command::CommandContext;
use crate::core::registry::Registry;
use crate::runtime::{Agenda, Execution, Operation};
use anyhow::anyhow;
use async_trait::async_trait;
use tracing::warn;

/// Executes jobs of one handler type.
///
/// Runs inside the job's command context: everything the handler writes
/// commits together with the job's deletion, or not at all.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn execute(
        &self,
        configuration: &str,
        execution: Option<&Execution>,
        ctx: &mut CommandContext,
    ) -> anyhow::Result<()>;
}

/// Job handlers by handler type
pub type JobHandlerRegistry = Registry<dyn JobHandler>;

/// Fires a timer catch event: the execution leaves the timer activity
pub struct TimerJobHandler;

#[async_trait]
impl JobHandler for TimerJobHandler {
    async fn execute(
        &self,
        configuration: &str,
        execution: Option<&Execution>,
        ctx: &mut CommandContext,
    ) -> anyhow::Result<()> {
        let execution = execution.ok_or_else(|| anyhow!("timer job has no execution"))?;
        if !execution.is_at(configuration) {
            warn!(
                execution = %execution.id,
                timer = configuration,
                "Timer fired for an execution that already left the activity"
            );
            return Ok(());
        }

        let mut agenda = Agenda::new();
        agenda.plan(Operation::LeaveActivity {
            execution_id: execution.id.clone(),
        });
        agenda.run(ctx).await?;
        Ok(())
    }
}

/// Runs an `async_before` activity's behaviour
pub struct AsyncContinuationJobHandler;

#[async_trait]
impl JobHandler for AsyncContinuationJobHandler {
    async fn execute(
        &self,
        configuration: &str,
        execution: Option<&Execution>,
        ctx: &mut CommandContext,
    ) -> anyhow::Result<()> {
        let execution =
            execution.ok_or_else(|| anyhow!("async continuation job has no execution"))?;
        if !execution.is_at(configuration) {
            warn!(
                execution = %execution.id,
                activity = configuration,
                "Async continuation for an execution that already left the activity"
            );
            return Ok(());
        }

        let mut agenda = Agenda::new();
        agenda.plan(Operation::ExecuteActivitySync {
            execution_id: execution.id.clone(),
        });
        agenda.run(ctx).await?;
        Ok(())
    }
}
