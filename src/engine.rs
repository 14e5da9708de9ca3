//! Engine assembly: shared services, the public facade and its builder

use crate::command::session::{session_factory, SessionFactories, SessionFactory};
use crate::command::transaction::{StoreTransactionFactory, TransactionContextFactory};
use crate::command::{Command, CommandExecutor};
use crate::core::clock::{Clock, SystemClock};
use crate::core::config::EngineConfig;
use crate::core::errors::Result;
use crate::history::{HistorySession, HistorySink, LoggingHistorySink};
use crate::jobs::{
    AsyncContinuationJobHandler, GetJobExceptionStacktraceCmd, Job, JobExecutor, JobHandler,
    JobHandlerRegistry, JobQuery, JobRun, ListJobsCmd, SetJobRetriesCmd, TimerJobHandler,
    ASYNC_CONTINUATION_HANDLER, TIMER_HANDLER,
};
use crate::runtime::{
    ActivityHandler, ActivityHandlerRegistry, CompleteTaskCmd, DefinitionRepository,
    DeleteProcessInstanceCmd, Execution, GetExecutionCmd, ListExecutionsCmd, ProcessDefinition,
    SignalCmd, StartProcessInstanceCmd,
};
use crate::storage::{EntityStore, MemoryStore, PersistenceSession};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::info;

/// Everything a command context can reach
pub struct EngineServices {
    pub config: EngineConfig,
    pub clock: Arc<dyn Clock>,
    pub store: Arc<dyn EntityStore>,
    pub definitions: DefinitionRepository,
    pub job_handlers: JobHandlerRegistry,
    pub activity_handlers: ActivityHandlerRegistry,
    pub session_factories: SessionFactories,
    pub transactions: Arc<dyn TransactionContextFactory>,
    pub history: Arc<dyn HistorySink>,
    /// Signalled after a commit that created jobs
    pub job_notify: Arc<Notify>,
}

/// Entry point for deploying definitions and driving process instances
pub struct ProcessEngine {
    services: Arc<EngineServices>,
    commands: CommandExecutor,
    job_executor: Arc<JobExecutor>,
}

impl ProcessEngine {
    pub fn builder() -> ProcessEngineBuilder {
        ProcessEngineBuilder::new()
    }

    pub fn services(&self) -> &Arc<EngineServices> {
        &self.services
    }

    pub fn config(&self) -> &EngineConfig {
        &self.services.config
    }

    pub fn command_executor(&self) -> &CommandExecutor {
        &self.commands
    }

    pub fn job_executor(&self) -> &Arc<JobExecutor> {
        &self.job_executor
    }

    /// Run any command in its own transaction
    pub async fn execute<C: Command>(&self, command: C) -> Result<C::Output> {
        self.commands.execute(command).await
    }

    /// Make a definition available; redeploying a key replaces it
    pub fn deploy(&self, definition: ProcessDefinition) -> Arc<ProcessDefinition> {
        info!(definition = %definition.key, "Deploying process definition");
        self.services.definitions.deploy(definition)
    }

    pub async fn start_process_instance(&self, definition_key: &str) -> Result<Execution> {
        self.execute(StartProcessInstanceCmd::new(definition_key))
            .await
    }

    pub async fn start_process_instance_with_business_key(
        &self,
        definition_key: &str,
        business_key: &str,
    ) -> Result<Execution> {
        self.execute(StartProcessInstanceCmd::new(definition_key).with_business_key(business_key))
            .await
    }

    pub async fn complete_task(&self, execution_id: &str) -> Result<()> {
        self.execute(CompleteTaskCmd::new(execution_id)).await
    }

    pub async fn signal(&self, execution_id: &str) -> Result<()> {
        self.execute(SignalCmd::new(execution_id)).await
    }

    pub async fn delete_process_instance(
        &self,
        process_instance_id: &str,
        reason: Option<&str>,
    ) -> Result<()> {
        self.execute(DeleteProcessInstanceCmd::new(
            process_instance_id,
            reason.map(str::to_string),
        ))
        .await
    }

    pub async fn execution(&self, execution_id: &str) -> Result<Option<Execution>> {
        self.execute(GetExecutionCmd {
            execution_id: execution_id.to_string(),
        })
        .await
    }

    pub async fn executions(&self, process_instance_id: &str) -> Result<Vec<Execution>> {
        self.execute(ListExecutionsCmd {
            process_instance_id: process_instance_id.to_string(),
        })
        .await
    }

    /// Activities where an active execution of the instance currently is, sorted
    pub async fn active_activity_ids(&self, process_instance_id: &str) -> Result<Vec<String>> {
        let mut ids: Vec<String> = self
            .executions(process_instance_id)
            .await?
            .into_iter()
            .filter(|e| e.is_active)
            .filter_map(|e| e.activity_id)
            .collect();
        ids.sort();
        Ok(ids)
    }

    pub async fn jobs(&self, process_instance_id: &str) -> Result<Vec<Job>> {
        self.execute(ListJobsCmd {
            query: JobQuery::ProcessInstance(process_instance_id.to_string()),
        })
        .await
    }

    pub async fn dead_letter_jobs(&self, limit: usize) -> Result<Vec<Job>> {
        self.execute(ListJobsCmd {
            query: JobQuery::DeadLetter { limit },
        })
        .await
    }

    pub async fn set_job_retries(&self, job_id: &str, retries: u32) -> Result<()> {
        self.execute(SetJobRetriesCmd {
            job_id: job_id.to_string(),
            retries,
        })
        .await
    }

    pub async fn job_exception_stacktrace(&self, job_id: &str) -> Result<Option<String>> {
        self.execute(GetJobExceptionStacktraceCmd {
            job_id: job_id.to_string(),
        })
        .await
    }

    /// Run a job immediately, whatever its due date and lock
    pub async fn execute_job(&self, job_id: &str) -> Result<JobRun> {
        self.job_executor.execute_job_now(job_id).await
    }

    /// Start background job acquisition
    pub fn start_job_executor(&self) {
        self.job_executor.start();
    }

    /// Stop background job acquisition and wait for running jobs
    pub async fn shutdown(&self) -> Result<()> {
        self.job_executor.shutdown().await
    }
}

/// Builder for [`ProcessEngine`]
pub struct ProcessEngineBuilder {
    config: EngineConfig,
    store: Option<Arc<dyn EntityStore>>,
    clock: Option<Arc<dyn Clock>>,
    history: Option<Arc<dyn HistorySink>>,
    transactions: Option<Arc<dyn TransactionContextFactory>>,
    job_handlers: Vec<(String, Arc<dyn JobHandler>)>,
    activity_handlers: Vec<(String, Arc<dyn ActivityHandler>)>,
    session_factories: Vec<Arc<dyn SessionFactory>>,
}

impl Default for ProcessEngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessEngineBuilder {
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
            store: None,
            clock: None,
            history: None,
            transactions: None,
            job_handlers: Vec::new(),
            activity_handlers: Vec::new(),
            session_factories: Vec::new(),
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Share a store between engines to simulate a cluster
    pub fn with_store(mut self, store: Arc<dyn EntityStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn with_history_sink(mut self, sink: Arc<dyn HistorySink>) -> Self {
        self.history = Some(sink);
        self
    }

    pub fn with_transaction_factory(mut self, factory: Arc<dyn TransactionContextFactory>) -> Self {
        self.transactions = Some(factory);
        self
    }

    pub fn job_handler(mut self, handler_type: impl Into<String>, handler: Arc<dyn JobHandler>) -> Self {
        self.job_handlers.push((handler_type.into(), handler));
        self
    }

    /// Register the handler a service task names
    pub fn activity_handler(
        mut self,
        name: impl Into<String>,
        handler: Arc<dyn ActivityHandler>,
    ) -> Self {
        self.activity_handlers.push((name.into(), handler));
        self
    }

    /// Add a session type. A factory for an already registered type replaces it.
    pub fn session_factory(mut self, factory: Arc<dyn SessionFactory>) -> Self {
        self.session_factories.push(factory);
        self
    }

    pub fn build(self) -> Result<ProcessEngine> {
        self.config.validate()?;

        let store: Arc<dyn EntityStore> = self.store.unwrap_or_else(|| Arc::new(MemoryStore::new()));
        let transactions = self
            .transactions
            .unwrap_or_else(|| Arc::new(StoreTransactionFactory::new(store.clone())));

        let job_handlers = JobHandlerRegistry::new("job handler");
        job_handlers.register(TIMER_HANDLER, Arc::new(TimerJobHandler))?;
        job_handlers.register(ASYNC_CONTINUATION_HANDLER, Arc::new(AsyncContinuationJobHandler))?;
        for (handler_type, handler) in self.job_handlers {
            job_handlers.register(handler_type, handler)?;
        }

        let activity_handlers = ActivityHandlerRegistry::new("activity handler");
        for (name, handler) in self.activity_handlers {
            activity_handlers.register(name, handler)?;
        }

        let mut session_factories = SessionFactories::new();
        session_factories.register(session_factory(|services: &EngineServices| {
            PersistenceSession::new(services.store.clone())
                .with_job_notify(services.job_notify.clone())
        }));
        session_factories.register(session_factory(|services: &EngineServices| {
            HistorySession::new(services.history.clone())
        }));
        for factory in self.session_factories {
            session_factories.register(factory);
        }

        let services = Arc::new(EngineServices {
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            history: self.history.unwrap_or_else(|| Arc::new(LoggingHistorySink)),
            definitions: DefinitionRepository::new(),
            job_notify: Arc::new(Notify::new()),
            config: self.config,
            store,
            job_handlers,
            activity_handlers,
            session_factories,
            transactions,
        });

        let commands = CommandExecutor::new(services.clone());
        let job_executor = Arc::new(JobExecutor::new(commands.clone()));
        info!(node = %services.config.node_id, "Process engine built");

        Ok(ProcessEngine {
            services,
            commands,
            job_executor,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::errors::EngineError;
    use async_trait::async_trait;

    struct Noop;

    #[async_trait]
    impl JobHandler for Noop {
        async fn execute(
            &self,
            _configuration: &str,
            _execution: Option<&Execution>,
            _ctx: &mut crate::command::CommandContext,
        ) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_builtin_handlers_are_registered() {
        let engine = ProcessEngine::builder()
            .with_config(EngineConfig::development())
            .build()
            .unwrap();
        assert_eq!(
            engine.services().job_handlers.list(),
            vec![ASYNC_CONTINUATION_HANDLER.to_string(), TIMER_HANDLER.to_string()]
        );
        assert_eq!(engine.services().session_factories.len(), 2);
    }

    #[test]
    fn test_duplicate_job_handler_is_rejected() {
        let result = ProcessEngine::builder()
            .with_config(EngineConfig::development())
            .job_handler(TIMER_HANDLER, Arc::new(Noop))
            .build();
        assert!(matches!(result, Err(EngineError::Configuration { .. })));
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = EngineConfig::development();
        config.max_workers = 0;
        assert!(ProcessEngine::builder().with_config(config).build().is_err());
    }
}
