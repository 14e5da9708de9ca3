//! Activity behaviours and the execution-level operations the agenda runs

use super::agenda::{Agenda, Operation};
use super::concurrency;
use super::definition::{Activity, ActivityKind, ProcessDefinition};
use super::execution::Execution;
use crate::command::CommandContext;
use crate::core::clock::add_duration;
use crate::core::errors::{EngineError, Result};
use crate::core::registry::Registry;
use crate::history::HistoryEvent;
use crate::jobs::model::{Job, ASYNC_CONTINUATION_HANDLER, TIMER_HANDLER};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// User code run by service tasks
#[async_trait]
pub trait ActivityHandler: Send + Sync {
    async fn execute(&self, execution: &Execution, ctx: &mut CommandContext) -> anyhow::Result<()>;
}

/// Service task handlers by name
pub type ActivityHandlerRegistry = Registry<dyn ActivityHandler>;

pub(crate) fn definition_for(
    ctx: &CommandContext,
    execution: &Execution,
) -> Result<Arc<ProcessDefinition>> {
    ctx.services()
        .definitions
        .get(&execution.process_definition_key)
        .ok_or_else(|| {
            EngineError::fault(format!(
                "process definition {} of execution {} is not deployed",
                execution.process_definition_key, execution.id
            ))
        })
}

pub(crate) fn current_activity(execution: &Execution) -> Result<&str> {
    execution.activity_id.as_deref().ok_or_else(|| {
        EngineError::fault(format!("execution {} has no current activity", execution.id))
    })
}

fn record(ctx: &mut CommandContext, event: HistoryEvent) -> Result<()> {
    ctx.history()?.record(event);
    Ok(())
}

pub(crate) async fn execute_activity(
    ctx: &mut CommandContext,
    agenda: &mut Agenda,
    execution_id: &str,
    honour_async: bool,
) -> Result<()> {
    let execution = ctx.persistence()?.execution(execution_id).await?;
    let definition = definition_for(ctx, &execution)?;
    let activity = definition.activity(current_activity(&execution)?)?;

    if honour_async && activity.async_before {
        return schedule_job(ctx, &execution, activity, ASYNC_CONTINUATION_HANDLER, Duration::ZERO);
    }

    match &activity.kind {
        ActivityKind::StartEvent => agenda.plan(Operation::LeaveActivity {
            execution_id: execution.id.clone(),
        }),
        ActivityKind::EndEvent => agenda.plan(Operation::End {
            execution_id: execution.id.clone(),
        }),
        ActivityKind::UserTask => {
            debug!(execution = %execution.id, activity = %activity.id, "Waiting in user task");
            record(
                ctx,
                HistoryEvent::TaskCreated {
                    process_instance_id: execution.process_instance_id.clone(),
                    execution_id: execution.id.clone(),
                    activity_id: activity.id.clone(),
                },
            )?;
        }
        ActivityKind::ServiceTask { handler } => {
            let handler = ctx.services().activity_handlers.resolve(handler)?;
            handler.execute(&execution, ctx).await?;
            agenda.plan(Operation::LeaveActivity {
                execution_id: execution.id.clone(),
            });
        }
        ActivityKind::ParallelGateway => {
            parallel_gateway(ctx, agenda, execution, &definition, activity).await?
        }
        ActivityKind::ExclusiveGateway { default_flow } => {
            let transition_id = select_flow(&definition, activity, default_flow.as_deref(), &execution)?;
            agenda.plan(Operation::TakeTransition {
                execution_id: execution.id.clone(),
                transition_id,
            });
        }
        ActivityKind::TimerCatch { duration } => {
            schedule_job(ctx, &execution, activity, TIMER_HANDLER, *duration)?
        }
    }
    Ok(())
}

fn schedule_job(
    ctx: &mut CommandContext,
    execution: &Execution,
    activity: &Activity,
    handler_type: &str,
    delay: Duration,
) -> Result<()> {
    let due = add_duration(ctx.now(), delay);
    let job = Job::new(
        handler_type,
        activity.id.clone(),
        due,
        ctx.config().default_job_retries,
    )
    .for_execution(execution)
    .exclusive(activity.exclusive);

    debug!(
        job = %job.id,
        handler = handler_type,
        activity = %activity.id,
        due = %job.due_date,
        "Scheduled job"
    );
    ctx.persistence()?.insert_job(job)
}

async fn parallel_gateway(
    ctx: &mut CommandContext,
    agenda: &mut Agenda,
    execution: Execution,
    definition: &ProcessDefinition,
    activity: &Activity,
) -> Result<()> {
    let execution = concurrency::inactivate(ctx, execution)?;
    if execution.is_concurrent {
        // arrivals of siblings serialize on the shared root
        ctx.persistence()?
            .force_update_execution(execution.concurrency_root_id())
            .await?;
    }
    let partition =
        concurrency::find_inactive_concurrent_executions(ctx, &execution, &activity.id).await?;
    let incoming = definition.incoming_count(&activity.id)?;

    if !partition.others.is_empty() && partition.inactive.len() < incoming {
        debug!(
            gateway = %activity.id,
            arrived = partition.inactive.len(),
            pending = partition.others.len(),
            "Parallel gateway waiting"
        );
        return Ok(());
    }

    let joined: Vec<String> = partition.inactive.into_iter().map(|e| e.id).collect();
    let outgoing: Vec<String> = definition
        .outgoing(&activity.id)?
        .into_iter()
        .map(|t| t.id.clone())
        .collect();
    debug!(
        gateway = %activity.id,
        joined = joined.len(),
        outgoing = outgoing.len(),
        "Parallel gateway fired"
    );
    concurrency::take_all(ctx, agenda, &execution.id, &outgoing, joined).await
}

fn select_flow(
    definition: &ProcessDefinition,
    activity: &Activity,
    default_flow: Option<&str>,
    execution: &Execution,
) -> Result<String> {
    for transition in definition.outgoing(&activity.id)? {
        if Some(transition.id.as_str()) == default_flow {
            continue;
        }
        let selected = match &transition.condition {
            Some(condition) => condition.evaluate(execution),
            None => true,
        };
        if selected {
            return Ok(transition.id.clone());
        }
    }

    default_flow.map(str::to_string).ok_or_else(|| {
        EngineError::fault(format!(
            "no outgoing sequence flow of exclusive gateway {} can be selected",
            activity.id
        ))
    })
}

pub(crate) async fn leave(
    ctx: &mut CommandContext,
    agenda: &mut Agenda,
    execution_id: &str,
) -> Result<()> {
    let execution = ctx.persistence()?.execution(execution_id).await?;
    let definition = definition_for(ctx, &execution)?;
    let outgoing: Vec<String> = definition
        .outgoing(current_activity(&execution)?)?
        .into_iter()
        .map(|t| t.id.clone())
        .collect();

    match outgoing.len() {
        0 => agenda.plan(Operation::End {
            execution_id: execution.id.clone(),
        }),
        1 => agenda.plan(Operation::TakeTransition {
            execution_id: execution.id.clone(),
            transition_id: outgoing[0].clone(),
        }),
        _ => {
            // implicit parallel split; the leaving execution is reused for the first flow
            let joined = vec![execution.id.clone()];
            concurrency::take_all(ctx, agenda, &execution.id, &outgoing, joined).await?
        }
    }
    Ok(())
}

pub(crate) async fn take_transition(
    ctx: &mut CommandContext,
    agenda: &mut Agenda,
    execution_id: &str,
    transition_id: &str,
) -> Result<()> {
    let mut execution = ctx.persistence()?.execution(execution_id).await?;
    let definition = definition_for(ctx, &execution)?;
    let transition = definition.transition(transition_id)?;

    if let Some(previous) = execution.activity_id.clone() {
        record(
            ctx,
            HistoryEvent::ActivityEnded {
                process_instance_id: execution.process_instance_id.clone(),
                execution_id: execution.id.clone(),
                activity_id: previous,
            },
        )?;
    }

    execution.activity_id = Some(transition.target.clone());
    execution.is_active = true;
    ctx.persistence()?.update_execution(execution.clone())?;

    record(
        ctx,
        HistoryEvent::ActivityStarted {
            process_instance_id: execution.process_instance_id.clone(),
            execution_id: execution.id.clone(),
            activity_id: transition.target.clone(),
        },
    )?;
    agenda.plan(Operation::ExecuteActivity {
        execution_id: execution.id,
    });
    Ok(())
}

pub(crate) async fn end(
    ctx: &mut CommandContext,
    agenda: &mut Agenda,
    execution_id: &str,
) -> Result<()> {
    let execution = ctx.persistence()?.execution(execution_id).await?;

    if !execution.is_concurrent {
        remove_execution_tree(ctx, &execution).await?;
        if execution.is_process_instance() {
            info!(
                process_instance = %execution.id,
                definition = %execution.process_definition_key,
                "Process instance ended"
            );
            record(
                ctx,
                HistoryEvent::ProcessEnded {
                    process_instance_id: execution.id.clone(),
                    reason: None,
                },
            )?;
        } else if let Some(parent_id) = execution.parent_id.clone() {
            agenda.plan(Operation::End {
                execution_id: parent_id,
            });
        }
        return Ok(());
    }

    let root_id = execution.parent_id.clone().ok_or_else(|| {
        EngineError::fault(format!(
            "concurrent execution {} has no parent",
            execution.id
        ))
    })?;
    remove_execution_tree(ctx, &execution).await?;

    let remaining = ctx.persistence()?.find_child_executions(&root_id).await?;
    match remaining.as_slice() {
        [] => {
            let persistence = ctx.persistence()?;
            let mut root = persistence.execution(&root_id).await?;
            root.activity_id = execution.activity_id.clone();
            root.is_active = true;
            persistence.update_execution(root)?;
            agenda.plan(Operation::End {
                execution_id: root_id,
            });
        }
        [last] if !last.is_scope => {
            let definition = definition_for(ctx, &execution)?;
            let waiting_at_join = !last.is_active
                && last
                    .activity_id
                    .as_deref()
                    .map(|id| definition.activity(id))
                    .transpose()?
                    .is_some_and(|a| a.kind == ActivityKind::ParallelGateway);
            let merged = concurrency::merge_into_root(ctx, &root_id, last.clone()).await?;
            if merged && waiting_at_join {
                // nothing else can arrive at the join now
                agenda.plan(Operation::ExecuteActivitySync {
                    execution_id: root_id,
                });
            }
        }
        _ => {}
    }
    Ok(())
}

/// Delete an execution, its descendants and their jobs
pub(crate) async fn remove_execution_tree(
    ctx: &mut CommandContext,
    execution: &Execution,
) -> Result<()> {
    let mut pending = vec![execution.clone()];
    let mut doomed = Vec::new();
    while let Some(current) = pending.pop() {
        let children = ctx.persistence()?.find_child_executions(&current.id).await?;
        pending.extend(children);
        doomed.push(current);
    }

    // leaves first
    for doomed_execution in doomed.iter().rev() {
        let persistence = ctx.persistence()?;
        for job in persistence.find_jobs_by_execution(&doomed_execution.id).await? {
            if let Some(trace_id) = &job.exception_stacktrace_id {
                if let Some(trace) = persistence.find_byte_array(trace_id).await? {
                    persistence.delete_byte_array(&trace);
                }
            }
            persistence.delete_job(&job);
        }
        persistence.delete_execution(doomed_execution);

        if let Some(activity_id) = doomed_execution.activity_id.clone() {
            record(
                ctx,
                HistoryEvent::ActivityEnded {
                    process_instance_id: doomed_execution.process_instance_id.clone(),
                    execution_id: doomed_execution.id.clone(),
                    activity_id,
                },
            )?;
        }
    }
    Ok(())
}
