//! Shared helpers for the integration suites

#![allow(dead_code)]

use procflow::runtime::ActivityHandler;
use procflow::{
    BufferingHistorySink, CommandContext, EngineConfig, Execution, ManualClock, MemoryStore,
    ProcessDefinition, ProcessEngine, ProcessEngineBuilder,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

pub struct TestEngine {
    pub engine: ProcessEngine,
    pub clock: Arc<ManualClock>,
    pub store: Arc<MemoryStore>,
    pub history: BufferingHistorySink,
}

/// Engine on a fresh store with a manual clock and buffered history
pub fn engine() -> TestEngine {
    engine_with(|builder| builder)
}

pub fn engine_with(customize: impl FnOnce(ProcessEngineBuilder) -> ProcessEngineBuilder) -> TestEngine {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::starting_now());
    node(store, clock, "node-a", customize)
}

/// Another engine node sharing `store` and `clock`
pub fn node(
    store: Arc<MemoryStore>,
    clock: Arc<ManualClock>,
    node_id: &str,
    customize: impl FnOnce(ProcessEngineBuilder) -> ProcessEngineBuilder,
) -> TestEngine {
    let history = BufferingHistorySink::new();
    let mut config = EngineConfig::development();
    config.node_id = node_id.to_string();

    let builder = ProcessEngine::builder()
        .with_config(config)
        .with_store(store.clone())
        .with_clock(clock.clone())
        .with_history_sink(Arc::new(history.clone()));
    let engine = customize(builder).build().expect("engine builds");

    TestEngine {
        engine,
        clock,
        store,
        history,
    }
}

/// start -> task -> end
pub fn single_task() -> ProcessDefinition {
    ProcessDefinition::builder("single-task")
        .start_event("start")
        .user_task("task")
        .end_event("end")
        .flow("start", "task")
        .flow("task", "end")
        .build()
        .expect("valid definition")
}

/// start -> fork -> task_1..task_n -> join -> review -> end
pub fn fork_join(branches: usize) -> ProcessDefinition {
    let mut builder = ProcessDefinition::builder("fork-join")
        .start_event("start")
        .parallel_gateway("fork")
        .parallel_gateway("join")
        .user_task("review")
        .end_event("end")
        .flow("start", "fork")
        .flow("join", "review")
        .flow("review", "end");
    for i in 1..=branches {
        let task = format!("task_{}", i);
        builder = builder
            .user_task(task.clone())
            .flow("fork", task.clone())
            .flow(task, "join");
    }
    builder.build().expect("valid definition")
}

/// Counts calls and optionally fails until told otherwise
#[derive(Default)]
pub struct CountingHandler {
    pub calls: AtomicUsize,
    pub failures_left: AtomicUsize,
}

impl CountingHandler {
    pub fn failing(times: usize) -> Arc<Self> {
        let handler = Self::default();
        handler.failures_left.store(times, Ordering::SeqCst);
        Arc::new(handler)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ActivityHandler for CountingHandler {
    async fn execute(&self, _execution: &Execution, _ctx: &mut CommandContext) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            anyhow::bail!("downstream service unavailable");
        }
        Ok(())
    }
}

/// Tracks how many invocations overlap
#[derive(Default)]
pub struct SlowHandler {
    running: AtomicUsize,
    pub peak: AtomicUsize,
    pub calls: AtomicUsize,
}

#[async_trait]
impl ActivityHandler for SlowHandler {
    async fn execute(&self, _execution: &Execution, _ctx: &mut CommandContext) -> anyhow::Result<()> {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(30)).await;
        self.running.fetch_sub(1, Ordering::SeqCst);
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Run acquisition cycles until nothing is acquired
pub async fn drain_jobs(engine: &ProcessEngine) -> usize {
    let mut executed = 0;
    for _ in 0..50 {
        let outcome = engine
            .job_executor()
            .execute_due_jobs()
            .await
            .expect("cycle succeeds");
        if outcome.acquired == 0 {
            return executed;
        }
        executed += outcome.dispatched;
    }
    panic!("jobs kept coming after 50 cycles");
}
