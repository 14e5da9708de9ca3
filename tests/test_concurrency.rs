//! Fork/join behaviour of the execution tree

mod common;

use async_trait::async_trait;
use common::{engine, fork_join, node};
use pretty_assertions::assert_eq;
use procflow::runtime::concurrency::{find_inactive_concurrent_executions, take_all};
use procflow::runtime::{Agenda, JoinPartition, Operation};
use procflow::command::{CommitListener, StoreTransaction, TransactionContext, TransactionContextFactory};
use procflow::storage::{EntityStore, WriteBatch};
use procflow::{
    Command, CommandContext, EngineError, Execution, ManualClock, MemoryStore, ProcessDefinition,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Barrier;

fn concurrent_child(root: &Execution, activity: &str, active: bool) -> Execution {
    let mut child = Execution::new_child(root);
    child.activity_id = Some(activity.to_string());
    child.is_concurrent = true;
    child.is_active = active;
    child
}

async fn seed(store: &MemoryStore, executions: &[Execution]) {
    let mut batch = WriteBatch::new();
    for execution in executions {
        batch.insert(execution.clone());
    }
    store.apply(batch).await.unwrap();
}

struct Partition {
    execution_id: String,
    activity_id: String,
}

#[async_trait]
impl Command for Partition {
    type Output = JoinPartition;

    fn name(&self) -> &'static str {
        "Partition"
    }

    async fn execute(&self, ctx: &mut CommandContext) -> procflow::Result<JoinPartition> {
        let execution = ctx.persistence()?.execution(&self.execution_id).await?;
        find_inactive_concurrent_executions(ctx, &execution, &self.activity_id).await
    }
}

struct TakeAll {
    process_instance_id: String,
    execution_id: String,
    transitions: Vec<String>,
    joined: Vec<String>,
}

#[async_trait]
impl Command for TakeAll {
    type Output = (Vec<Operation>, Vec<Execution>);

    fn name(&self) -> &'static str {
        "TakeAll"
    }

    async fn execute(&self, ctx: &mut CommandContext) -> procflow::Result<Self::Output> {
        let mut agenda = Agenda::new();
        take_all(
            ctx,
            &mut agenda,
            &self.execution_id,
            &self.transitions,
            self.joined.clone(),
        )
        .await?;

        // drain without running; nothing is deployed
        let mut planned = Vec::new();
        while let Some(operation) = agenda.pop() {
            planned.push(operation);
        }
        let executions = ctx
            .persistence()?
            .find_executions_by_process_instance(&self.process_instance_id)
            .await?;
        Ok((planned, executions))
    }
}

#[tokio::test]
async fn test_fork_creates_one_concurrent_child_per_flow() {
    let t = engine();
    t.engine.deploy(fork_join(4));

    let instance = t.engine.start_process_instance("fork-join").await.unwrap();
    let executions = t.engine.executions(&instance.id).await.unwrap();

    let root = &executions[0];
    assert_eq!(root.id, instance.id);
    assert!(!root.is_active);
    assert!(root.is_at("fork"));

    let children = &executions[1..];
    assert_eq!(children.len(), 4);
    for child in children {
        assert_eq!(child.parent_id.as_deref(), Some(root.id.as_str()));
        assert!(child.is_concurrent);
        assert!(child.is_active);
        assert!(!child.is_scope);
    }
    let positions: HashSet<&str> = children
        .iter()
        .filter_map(|c| c.activity_id.as_deref())
        .collect();
    assert_eq!(
        positions,
        HashSet::from(["task_1", "task_2", "task_3", "task_4"])
    );
}

#[tokio::test]
async fn test_join_followed_by_fork_recycles_executions() {
    let t = engine();
    t.engine.deploy(
        ProcessDefinition::builder("relay")
            .start_event("start")
            .parallel_gateway("fork")
            .user_task("a")
            .user_task("b")
            .parallel_gateway("join")
            .user_task("c")
            .user_task("d")
            .end_event("end")
            .flow("start", "fork")
            .flow("fork", "a")
            .flow("fork", "b")
            .flow("a", "join")
            .flow("b", "join")
            .flow("join", "c")
            .flow("join", "d")
            .flow("c", "end")
            .flow("d", "end")
            .build()
            .unwrap(),
    );

    let instance = t.engine.start_process_instance("relay").await.unwrap();
    let before = t.engine.executions(&instance.id).await.unwrap();
    assert_eq!(before.len(), 3);
    let branch_ids: HashSet<String> = before[1..].iter().map(|e| e.id.clone()).collect();

    for execution in &before[1..] {
        t.engine.complete_task(&execution.id).await.unwrap();
    }

    let after = t.engine.executions(&instance.id).await.unwrap();
    assert_eq!(after.len(), 3, "joined executions are reused for the outgoing flows");
    let reused: HashSet<String> = after[1..].iter().map(|e| e.id.clone()).collect();
    assert_eq!(reused, branch_ids);
    assert_eq!(
        t.engine.active_activity_ids(&instance.id).await.unwrap(),
        vec!["c", "d"]
    );
}

#[tokio::test]
async fn test_active_sibling_at_join_is_a_fault() {
    let t = engine();
    let mut root = Execution::new_process_instance("any", None);
    root.activity_id = Some("fork".into());
    root.is_active = false;
    let waiting = concurrent_child(&root, "join", false);
    let broken = concurrent_child(&root, "join", true);
    seed(&t.store, &[root, waiting.clone(), broken]).await;

    let err = t
        .engine
        .execute(Partition {
            execution_id: waiting.id.clone(),
            activity_id: "join".into(),
        })
        .await
        .unwrap_err();
    assert!(err.is_fault(), "unexpected error: {err}");
}

#[tokio::test]
async fn test_partition_splits_waiting_from_running() {
    let t = engine();
    let mut root = Execution::new_process_instance("any", None);
    root.activity_id = Some("fork".into());
    root.is_active = false;
    let waiting = concurrent_child(&root, "join", false);
    let running = concurrent_child(&root, "task", true);
    seed(&t.store, &[root, waiting.clone(), running.clone()]).await;

    let partition = t
        .engine
        .execute(Partition {
            execution_id: waiting.id.clone(),
            activity_id: "join".into(),
        })
        .await
        .unwrap();
    assert!(!partition.is_complete());
    assert_eq!(partition.inactive.len(), 1);
    assert_eq!(partition.others[0].id, running.id);
}

#[tokio::test]
async fn test_take_all_collapses_when_every_sibling_joined() {
    let t = engine();
    let mut root = Execution::new_process_instance("any", None);
    root.activity_id = Some("fork".into());
    root.is_active = false;
    let first = concurrent_child(&root, "join", false);
    let second = concurrent_child(&root, "join", false);
    seed(&t.store, &[root.clone(), first.clone(), second.clone()]).await;

    let (planned, executions) = t
        .engine
        .execute(TakeAll {
            process_instance_id: root.id.clone(),
            execution_id: second.id.clone(),
            transitions: vec!["join->end".into()],
            joined: vec![first.id.clone(), second.id.clone()],
        })
        .await
        .unwrap();

    assert_eq!(
        planned,
        vec![Operation::TakeTransition {
            execution_id: root.id.clone(),
            transition_id: "join->end".into(),
        }]
    );
    assert_eq!(executions.len(), 1);
    assert!(executions[0].is_active);
    assert!(!executions[0].is_concurrent);
    assert!(executions[0].is_at("join"));
    assert_eq!(t.store.execution_count(), 1);
}

#[tokio::test]
async fn test_take_all_creates_children_when_recyclables_run_out() {
    let t = engine();
    let mut root = Execution::new_process_instance("any", None);
    root.activity_id = Some("fork".into());
    root.is_active = false;
    let joined = concurrent_child(&root, "join", false);
    let elsewhere = concurrent_child(&root, "task", true);
    seed(&t.store, &[root.clone(), joined.clone(), elsewhere.clone()]).await;

    let transitions: Vec<String> = vec!["join->x".into(), "join->y".into(), "join->z".into()];
    let (planned, executions) = t
        .engine
        .execute(TakeAll {
            process_instance_id: root.id.clone(),
            execution_id: joined.id.clone(),
            transitions: transitions.clone(),
            joined: vec![joined.id.clone()],
        })
        .await
        .unwrap();

    assert_eq!(planned.len(), 3);
    // root + untouched sibling + recycled + two new children
    assert_eq!(executions.len(), 5);
    assert!(!executions[0].is_active);
    match &planned[0] {
        Operation::TakeTransition {
            execution_id,
            transition_id,
        } => {
            assert_eq!(execution_id, &joined.id);
            assert_eq!(transition_id, "join->x");
        }
        other => panic!("unexpected operation {other:?}"),
    }
    let created: Vec<&Execution> = executions
        .iter()
        .filter(|e| e.id != root.id && e.id != joined.id && e.id != elsewhere.id)
        .collect();
    assert_eq!(created.len(), 2);
    assert!(created
        .iter()
        .all(|e| e.is_concurrent && e.is_active && e.is_at("join")));
}

#[tokio::test]
async fn test_take_all_without_transitions_is_a_fault() {
    let t = engine();
    let root = Execution::new_process_instance("any", None);
    seed(&t.store, &[root.clone()]).await;

    let err = t
        .engine
        .execute(TakeAll {
            process_instance_id: root.id.clone(),
            execution_id: root.id.clone(),
            transitions: Vec::new(),
            joined: vec![root.id.clone()],
        })
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::EngineFault { .. }));
    assert_eq!(t.store.execution_count(), 1);
}

/// Holds every commit at a barrier once armed, so two commands flush against
/// the same snapshot before either one writes
struct LockstepTransactions {
    store: Arc<dyn EntityStore>,
    armed: Arc<AtomicBool>,
    barrier: Arc<Barrier>,
}

struct LockstepTransaction {
    inner: StoreTransaction,
    armed: Arc<AtomicBool>,
    barrier: Arc<Barrier>,
}

impl TransactionContextFactory for LockstepTransactions {
    fn open(&self) -> Box<dyn TransactionContext> {
        Box::new(LockstepTransaction {
            inner: StoreTransaction::new(self.store.clone()),
            armed: self.armed.clone(),
            barrier: self.barrier.clone(),
        })
    }
}

#[async_trait]
impl TransactionContext for LockstepTransaction {
    fn stage(&mut self, batch: WriteBatch) {
        self.inner.stage(batch);
    }

    fn on_commit(&mut self, listener: CommitListener) {
        self.inner.on_commit(listener);
    }

    async fn commit(&mut self) -> procflow::Result<()> {
        if self.armed.load(Ordering::SeqCst) {
            self.barrier.wait().await;
        }
        self.inner.commit().await
    }

    async fn rollback(&mut self) -> procflow::Result<()> {
        self.inner.rollback().await
    }
}

#[tokio::test]
async fn test_simultaneous_arrivals_at_join_conflict() {
    let armed = Arc::new(AtomicBool::new(false));
    let store = Arc::new(MemoryStore::new());
    let transactions = Arc::new(LockstepTransactions {
        store: store.clone(),
        armed: armed.clone(),
        barrier: Arc::new(Barrier::new(2)),
    });
    let t = node(
        store,
        Arc::new(ManualClock::starting_now()),
        "node-a",
        move |b| b.with_transaction_factory(transactions),
    );
    t.engine.deploy(fork_join(2));

    let instance = t.engine.start_process_instance("fork-join").await.unwrap();
    let executions = t.engine.executions(&instance.id).await.unwrap();
    let first = executions.iter().find(|e| e.is_at("task_1")).unwrap().id.clone();
    let second = executions.iter().find(|e| e.is_at("task_2")).unwrap().id.clone();

    armed.store(true, Ordering::SeqCst);
    let (r1, r2) = tokio::join!(
        t.engine.complete_task(&first),
        t.engine.complete_task(&second)
    );
    armed.store(false, Ordering::SeqCst);

    // exactly one arrival commits; the other saw a stale tree
    let (committed, lost) = match (r1, r2) {
        (Ok(()), Err(err)) => (first.clone(), (second.clone(), err)),
        (Err(err), Ok(())) => (second.clone(), (first.clone(), err)),
        other => panic!("expected one conflict, got {other:?}"),
    };
    assert!(lost.1.is_conflict(), "unexpected error: {}", lost.1);
    assert!(lost.1.is_retryable());

    let waiting = t.engine.execution(&committed).await.unwrap().unwrap();
    assert!(waiting.is_at("join") && !waiting.is_active);
    let pending = t.engine.execution(&lost.0).await.unwrap().unwrap();
    assert!(pending.is_active && !pending.is_at("join"));

    t.engine.complete_task(&lost.0).await.unwrap();
    assert_eq!(
        t.engine.active_activity_ids(&instance.id).await.unwrap(),
        vec!["review"]
    );
}
