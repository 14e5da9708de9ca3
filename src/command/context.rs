use super::session::Session;
use super::transaction::TransactionContext;
use super::Command;
use crate::core::config::EngineConfig;
use crate::core::errors::{EngineError, Result};
use crate::engine::EngineServices;
use crate::history::HistorySession;
use crate::storage::PersistenceSession;
use chrono::{DateTime, Utc};
use std::any::TypeId;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, error, warn};

tokio::task_local! {
    static CURRENT: ContextScope;
}

/// Read-only view of the command running on the current task
#[derive(Clone)]
pub struct ContextScope {
    command: &'static str,
    depth: usize,
    services: Arc<EngineServices>,
}

impl ContextScope {
    pub fn command(&self) -> &'static str {
        self.command
    }

    /// 0 for the outermost command, +1 per nested command
    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn config(&self) -> &EngineConfig {
        &self.services.config
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.services.clock.now()
    }
}

impl fmt::Debug for ContextScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextScope")
            .field("command", &self.command)
            .field("depth", &self.depth)
            .finish()
    }
}

/// The command running on this task, if any
pub fn current() -> Option<ContextScope> {
    CURRENT.try_with(|scope| scope.clone()).ok()
}

/// Engine time inside a command, wall-clock time outside
pub fn now() -> DateTime<Utc> {
    current().map(|scope| scope.now()).unwrap_or_else(Utc::now)
}

pub(crate) async fn scoped<F: Future>(scope: ContextScope, future: F) -> F::Output {
    CURRENT.scope(scope, future).await
}

/// First error wins; later ones are logged and kept as suppressed
#[derive(Debug, Default)]
pub struct ErrorAccumulator {
    primary: Option<EngineError>,
    suppressed: Vec<EngineError>,
}

impl ErrorAccumulator {
    pub fn record(&mut self, error: EngineError) {
        if self.primary.is_none() {
            self.primary = Some(error);
        } else {
            warn!(error = %error, "Suppressed error after an earlier failure");
            self.suppressed.push(error);
        }
    }

    pub fn primary(&self) -> Option<&EngineError> {
        self.primary.as_ref()
    }

    pub fn suppressed(&self) -> &[EngineError] {
        &self.suppressed
    }

    pub fn has_failed(&self) -> bool {
        self.primary.is_some()
    }

    fn take_primary(&mut self) -> Option<EngineError> {
        self.primary.take()
    }
}

/// Transaction-scoped state shared by a command and everything it calls.
///
/// Opened by the [`CommandExecutor`](super::CommandExecutor), closed after the
/// command body returns: sessions are flushed in open order, the transaction
/// commits, every session is closed, and on any failure the transaction rolls
/// back and the first error is returned.
pub struct CommandContext {
    command: &'static str,
    services: Arc<EngineServices>,
    transaction: Box<dyn TransactionContext>,
    sessions: Vec<(TypeId, Box<dyn Session>)>,
    errors: ErrorAccumulator,
    depth: usize,
}

impl CommandContext {
    pub(crate) fn open(command: &'static str, services: Arc<EngineServices>) -> Self {
        let transaction = services.transactions.open();
        Self {
            command,
            services,
            transaction,
            sessions: Vec::new(),
            errors: ErrorAccumulator::default(),
            depth: 0,
        }
    }

    /// Name of the outermost command
    pub fn command_name(&self) -> &'static str {
        self.command
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn services(&self) -> &Arc<EngineServices> {
        &self.services
    }

    pub fn config(&self) -> &EngineConfig {
        &self.services.config
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.services.clock.now()
    }

    pub(crate) fn scope(&self, command: &'static str) -> ContextScope {
        ContextScope {
            command,
            depth: self.depth,
            services: self.services.clone(),
        }
    }

    /// The session of type `S`, opened on first use through its registered factory
    pub fn session<S: Session>(&mut self) -> Result<&mut S> {
        let type_id = TypeId::of::<S>();
        let index = match self.sessions.iter().position(|(id, _)| *id == type_id) {
            Some(index) => index,
            None => {
                let factory = self.services.session_factories.get(type_id).ok_or_else(|| {
                    EngineError::configuration(format!(
                        "no session factory registered for {}",
                        std::any::type_name::<S>()
                    ))
                })?;
                debug!(session = factory.session_name(), "Opening session");
                let session = factory.open(&self.services);
                self.sessions.push((type_id, session));
                self.sessions.len() - 1
            }
        };

        self.sessions[index]
            .1
            .as_any_mut()
            .downcast_mut::<S>()
            .ok_or_else(|| {
                EngineError::fault(format!(
                    "session factory for {} produced another type",
                    std::any::type_name::<S>()
                ))
            })
    }

    pub fn persistence(&mut self) -> Result<&mut PersistenceSession> {
        self.session::<PersistenceSession>()
    }

    pub fn history(&mut self) -> Result<&mut HistorySession> {
        self.session::<HistorySession>()
    }

    pub fn transaction(&mut self) -> &mut dyn TransactionContext {
        self.transaction.as_mut()
    }

    /// Record a failure. The context will roll back on close.
    pub fn exception(&mut self, error: EngineError) {
        self.errors.record(error);
    }

    pub fn errors(&self) -> &ErrorAccumulator {
        &self.errors
    }

    /// Run a nested command inside this context. It shares sessions and the
    /// transaction; its writes commit or roll back with the outer command.
    pub async fn execute<C: Command>(&mut self, command: C) -> Result<C::Output> {
        self.depth += 1;
        let scope = self.scope(command.name());
        debug!(command = command.name(), depth = self.depth, "Executing nested command");
        let result = scoped(scope, command.execute(self)).await;
        self.depth -= 1;
        result
    }

    /// Close the context, turning the command's outcome into the caller's result
    pub(crate) async fn close<T>(mut self, outcome: Result<T>) -> Result<T> {
        let mut value = None;
        match outcome {
            Ok(v) => value = Some(v),
            Err(e) => self.exception(e),
        }

        let mut committed = false;
        if !self.errors.has_failed() {
            if let Err(e) = self.flush_sessions().await {
                self.exception(e);
            } else if let Err(e) = self.transaction.commit().await {
                self.exception(e);
            } else {
                committed = true;
            }
        }

        self.close_sessions().await;

        if let Some(primary) = self.errors.take_primary() {
            if committed {
                warn!(command = self.command, error = %primary, "Session close failed after commit");
            } else if let Err(e) = self.transaction.rollback().await {
                error!(command = self.command, error = %e, "Rollback failed");
                self.errors.suppressed.push(e);
            }
            let primary = primary.in_command(self.command);
            debug!(
                command = self.command,
                error = %primary,
                suppressed = self.errors.suppressed().len(),
                "Command failed"
            );
            return Err(primary);
        }

        value.ok_or_else(|| {
            EngineError::fault(format!("command {} finished without a result", self.command))
        })
    }

    async fn flush_sessions(&mut self) -> Result<()> {
        for (_, session) in self.sessions.iter_mut() {
            session.flush(self.transaction.as_mut()).await?;
        }
        Ok(())
    }

    async fn close_sessions(&mut self) {
        let mut failures = Vec::new();
        for (_, session) in self.sessions.iter_mut() {
            if let Err(e) = session.close().await {
                failures.push(e);
            }
        }
        for failure in failures {
            self.exception(failure);
        }
    }
}
