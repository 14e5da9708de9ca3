//! Fork/join control over the execution tree.
//!
//! A fork turns the forking execution's concurrency root inactive and gives it
//! one concurrent child per outgoing flow. A join collects the inactive
//! concurrent children waiting at the gateway and either collapses them back
//! into the root (one outgoing flow, every child joined) or reuses them for
//! the outgoing flows, creating children only when it runs out.

use super::agenda::{Agenda, Operation};
use super::behavior::remove_execution_tree;
use super::execution::Execution;
use crate::command::CommandContext;
use crate::core::errors::{EngineError, Result};
use std::collections::HashSet;
use tracing::debug;

/// Siblings of an execution split by whether they wait at a join
#[derive(Debug, Default, Clone, PartialEq)]
pub struct JoinPartition {
    /// Inactive executions at the join activity, including the caller
    pub inactive: Vec<Execution>,
    /// Every other sibling
    pub others: Vec<Execution>,
}

impl JoinPartition {
    /// Every concurrent sibling has arrived
    pub fn is_complete(&self) -> bool {
        self.others.is_empty()
    }
}

/// Mark an execution as waiting and persist it
pub fn inactivate(ctx: &mut CommandContext, mut execution: Execution) -> Result<Execution> {
    execution.is_active = false;
    ctx.persistence()?.update_execution(execution.clone())?;
    Ok(execution)
}

/// Partition the concurrent siblings of `execution` around `activity_id`.
///
/// A non-concurrent execution only considers itself. An *active* sibling at
/// the join activity means the tree is corrupt and is reported as a fault.
pub async fn find_inactive_concurrent_executions(
    ctx: &mut CommandContext,
    execution: &Execution,
    activity_id: &str,
) -> Result<JoinPartition> {
    let mut partition = JoinPartition::default();

    if !execution.is_concurrent {
        if !execution.is_active && execution.is_at(activity_id) {
            partition.inactive.push(execution.clone());
        } else {
            partition.others.push(execution.clone());
        }
        return Ok(partition);
    }

    let parent_id = execution.parent_id.as_deref().ok_or_else(|| {
        EngineError::fault(format!(
            "concurrent execution {} has no parent",
            execution.id
        ))
    })?;

    for sibling in ctx.persistence()?.find_child_executions(parent_id).await? {
        if sibling.is_at(activity_id) {
            if sibling.is_active {
                return Err(EngineError::fault(format!(
                    "execution {} is still active at join {}",
                    sibling.id, activity_id
                )));
            }
            partition.inactive.push(sibling);
        } else {
            partition.others.push(sibling);
        }
    }
    Ok(partition)
}

/// Send the execution's concurrency root down every transition in
/// `transitions`, reusing the `joined` executions.
pub async fn take_all(
    ctx: &mut CommandContext,
    agenda: &mut Agenda,
    execution_id: &str,
    transitions: &[String],
    joined: Vec<String>,
) -> Result<()> {
    if transitions.is_empty() {
        return Err(EngineError::fault(format!(
            "execution {} cannot take an empty set of transitions",
            execution_id
        )));
    }

    let execution = ctx.persistence()?.execution(execution_id).await?;
    let root_id = execution.concurrency_root_id().to_string();
    let mut root = ctx.persistence()?.execution(&root_id).await?;

    let mut recyclable: Vec<Execution> = Vec::new();
    for id in joined.iter().filter(|id| **id != root_id) {
        let joined_execution = ctx.persistence()?.execution(id).await?;
        if joined_execution.is_scope {
            return Err(EngineError::fault(format!(
                "scope execution {} cannot be joined",
                joined_execution.id
            )));
        }
        recyclable.push(joined_execution);
    }

    let siblings = ctx.persistence()?.find_child_executions(&root_id).await?;
    let sibling_ids: HashSet<&str> = siblings.iter().map(|s| s.id.as_str()).collect();
    let recyclable_ids: HashSet<&str> = recyclable.iter().map(|e| e.id.as_str()).collect();

    if transitions.len() == 1 && sibling_ids == recyclable_ids {
        debug!(
            root = %root.id,
            pruned = recyclable.len(),
            "Collapsing concurrent executions into their root"
        );
        for pruned in &recyclable {
            remove_execution_tree(ctx, pruned).await?;
        }
        root.is_active = true;
        root.is_concurrent = false;
        root.activity_id = execution.activity_id.clone();
        ctx.persistence()?.update_execution(root.clone())?;
        agenda.plan(Operation::TakeTransition {
            execution_id: root.id,
            transition_id: transitions[0].clone(),
        });
        return Ok(());
    }

    let mut recyclable = recyclable.into_iter();
    let mut outgoing = Vec::with_capacity(transitions.len());
    let mut created = 0usize;
    for transition_id in transitions {
        let mut out = match recyclable.next() {
            Some(reused) => reused,
            None => {
                let mut child = Execution::new_child(&root);
                child.activity_id = execution.activity_id.clone();
                ctx.persistence()?.insert_execution(child.clone())?;
                created += 1;
                child
            }
        };
        out.is_active = true;
        out.is_concurrent = true;
        out.is_scope = false;
        ctx.persistence()?.update_execution(out.clone())?;
        outgoing.push((out.id, transition_id.clone()));
    }

    let leftovers: Vec<Execution> = recyclable.collect();
    for leftover in &leftovers {
        remove_execution_tree(ctx, leftover).await?;
    }

    root.is_active = false;
    ctx.persistence()?.update_execution(root.clone())?;

    debug!(
        root = %root.id,
        outgoing = outgoing.len(),
        created,
        pruned = leftovers.len(),
        "Took all transitions"
    );
    for (execution_id, transition_id) in outgoing {
        agenda.plan(Operation::TakeTransition {
            execution_id,
            transition_id,
        });
    }
    Ok(())
}

/// Fold the last remaining concurrent child back into its root
pub(crate) async fn merge_into_root(
    ctx: &mut CommandContext,
    root_id: &str,
    last: Execution,
) -> Result<bool> {
    let persistence = ctx.persistence()?;
    if !persistence.find_child_executions(&last.id).await?.is_empty() {
        return Ok(false);
    }

    let mut root = persistence.execution(root_id).await?;
    root.activity_id = last.activity_id.clone();
    root.is_active = last.is_active;
    root.is_concurrent = false;
    persistence.update_execution(root.clone())?;

    for mut job in persistence.find_jobs_by_execution(&last.id).await? {
        job.execution_id = Some(root.id.clone());
        persistence.update_job(job)?;
    }
    persistence.delete_execution(&last);

    debug!(root = %root.id, merged = %last.id, "Merged last concurrent execution into root");
    Ok(true)
}
