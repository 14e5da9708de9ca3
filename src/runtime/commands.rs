use super::agenda::{Agenda, Operation};
use super::behavior::{current_activity, definition_for, remove_execution_tree};
use super::definition::ActivityKind;
use super::execution::Execution;
use crate::command::{Command, CommandContext};
use crate::core::errors::{EngineError, Result};
use crate::history::HistoryEvent;
use crate::jobs::model::TIMER_HANDLER;
use async_trait::async_trait;
use tracing::info;

/// Start a process instance of a deployed definition
#[derive(Debug, Clone)]
pub struct StartProcessInstanceCmd {
    pub definition_key: String,
    pub business_key: Option<String>,
}

impl StartProcessInstanceCmd {
    pub fn new(definition_key: impl Into<String>) -> Self {
        Self {
            definition_key: definition_key.into(),
            business_key: None,
        }
    }

    pub fn with_business_key(mut self, business_key: impl Into<String>) -> Self {
        self.business_key = Some(business_key.into());
        self
    }
}

#[async_trait]
impl Command for StartProcessInstanceCmd {
    type Output = Execution;

    fn name(&self) -> &'static str {
        "StartProcessInstance"
    }

    /// Returns the process instance as it stands when the command finishes;
    /// `is_ended` is set when it ran to completion.
    async fn execute(&self, ctx: &mut CommandContext) -> Result<Execution> {
        let definition = ctx
            .services()
            .definitions
            .get(&self.definition_key)
            .ok_or_else(|| EngineError::not_found("ProcessDefinition", &self.definition_key))?;

        let mut instance =
            Execution::new_process_instance(&definition.key, self.business_key.clone());
        instance.activity_id = Some(definition.initial().to_string());
        let instance_id = instance.id.clone();
        ctx.persistence()?.insert_execution(instance)?;

        let history = ctx.history()?;
        history.record(HistoryEvent::ProcessStarted {
            process_instance_id: instance_id.clone(),
            definition_key: definition.key.clone(),
            business_key: self.business_key.clone(),
        });
        history.record(HistoryEvent::ActivityStarted {
            process_instance_id: instance_id.clone(),
            execution_id: instance_id.clone(),
            activity_id: definition.initial().to_string(),
        });
        info!(
            process_instance = %instance_id,
            definition = %definition.key,
            "Starting process instance"
        );

        let mut agenda = Agenda::new();
        agenda.plan(Operation::ExecuteActivity {
            execution_id: instance_id.clone(),
        });
        agenda.run(ctx).await?;

        let persistence = ctx.persistence()?;
        match persistence.find_execution(&instance_id).await? {
            Some(instance) => Ok(instance),
            None => persistence
                .ended_execution(&instance_id)
                .ok_or_else(|| EngineError::fault("process instance vanished while starting")),
        }
    }
}

/// Complete the user task an execution waits in and continue the process
#[derive(Debug, Clone)]
pub struct CompleteTaskCmd {
    pub execution_id: String,
}

impl CompleteTaskCmd {
    pub fn new(execution_id: impl Into<String>) -> Self {
        Self {
            execution_id: execution_id.into(),
        }
    }
}

#[async_trait]
impl Command for CompleteTaskCmd {
    type Output = ();

    fn name(&self) -> &'static str {
        "CompleteTask"
    }

    async fn execute(&self, ctx: &mut CommandContext) -> Result<()> {
        let execution = ctx.persistence()?.execution(&self.execution_id).await?;
        let definition = definition_for(ctx, &execution)?;
        let activity = definition.activity(current_activity(&execution)?)?;

        if activity.kind != ActivityKind::UserTask || !execution.is_active {
            return Err(EngineError::validation_field(
                format!(
                    "execution {} is not waiting in a user task (at {})",
                    execution.id, activity.id
                ),
                "execution_id",
            ));
        }

        ctx.history()?.record(HistoryEvent::TaskCompleted {
            process_instance_id: execution.process_instance_id.clone(),
            execution_id: execution.id.clone(),
            activity_id: activity.id.clone(),
        });

        let mut agenda = Agenda::new();
        agenda.plan(Operation::LeaveActivity {
            execution_id: execution.id,
        });
        agenda.run(ctx).await
    }
}

/// Push an execution out of any wait state. A pending timer is cancelled.
#[derive(Debug, Clone)]
pub struct SignalCmd {
    pub execution_id: String,
}

impl SignalCmd {
    pub fn new(execution_id: impl Into<String>) -> Self {
        Self {
            execution_id: execution_id.into(),
        }
    }
}

#[async_trait]
impl Command for SignalCmd {
    type Output = ();

    fn name(&self) -> &'static str {
        "Signal"
    }

    async fn execute(&self, ctx: &mut CommandContext) -> Result<()> {
        let execution = ctx.persistence()?.execution(&self.execution_id).await?;
        let definition = definition_for(ctx, &execution)?;
        let activity = definition.activity(current_activity(&execution)?)?;

        match &activity.kind {
            ActivityKind::UserTask if execution.is_active => {
                return ctx.execute(CompleteTaskCmd::new(&execution.id)).await;
            }
            ActivityKind::TimerCatch { .. } if execution.is_active => {
                let persistence = ctx.persistence()?;
                for job in persistence.find_jobs_by_execution(&execution.id).await? {
                    if job.handler_type == TIMER_HANDLER {
                        persistence.delete_job(&job);
                    }
                }
            }
            _ => {
                return Err(EngineError::validation_field(
                    format!(
                        "execution {} is not in a wait state (at {})",
                        execution.id, activity.id
                    ),
                    "execution_id",
                ))
            }
        }

        let mut agenda = Agenda::new();
        agenda.plan(Operation::LeaveActivity {
            execution_id: execution.id,
        });
        agenda.run(ctx).await
    }
}

/// Remove a process instance with all its executions and jobs
#[derive(Debug, Clone)]
pub struct DeleteProcessInstanceCmd {
    pub process_instance_id: String,
    pub reason: Option<String>,
}

impl DeleteProcessInstanceCmd {
    pub fn new(process_instance_id: impl Into<String>, reason: Option<String>) -> Self {
        Self {
            process_instance_id: process_instance_id.into(),
            reason,
        }
    }
}

#[async_trait]
impl Command for DeleteProcessInstanceCmd {
    type Output = ();

    fn name(&self) -> &'static str {
        "DeleteProcessInstance"
    }

    async fn execute(&self, ctx: &mut CommandContext) -> Result<()> {
        let instance = ctx
            .persistence()?
            .execution(&self.process_instance_id)
            .await?;
        if !instance.is_process_instance() {
            return Err(EngineError::validation_field(
                format!("{} is not a process instance", instance.id),
                "process_instance_id",
            ));
        }

        remove_execution_tree(ctx, &instance).await?;
        ctx.history()?.record(HistoryEvent::ProcessEnded {
            process_instance_id: instance.id.clone(),
            reason: self.reason.clone(),
        });
        info!(
            process_instance = %instance.id,
            reason = self.reason.as_deref().unwrap_or("none"),
            "Deleted process instance"
        );
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct GetExecutionCmd {
    pub execution_id: String,
}

#[async_trait]
impl Command for GetExecutionCmd {
    type Output = Option<Execution>;

    fn name(&self) -> &'static str {
        "GetExecution"
    }

    async fn execute(&self, ctx: &mut CommandContext) -> Result<Option<Execution>> {
        ctx.persistence()?.find_execution(&self.execution_id).await
    }
}

/// All executions of a process instance, the root first
#[derive(Debug, Clone)]
pub struct ListExecutionsCmd {
    pub process_instance_id: String,
}

#[async_trait]
impl Command for ListExecutionsCmd {
    type Output = Vec<Execution>;

    fn name(&self) -> &'static str {
        "ListExecutions"
    }

    async fn execute(&self, ctx: &mut CommandContext) -> Result<Vec<Execution>> {
        ctx.persistence()?
            .find_executions_by_process_instance(&self.process_instance_id)
            .await
    }
}
