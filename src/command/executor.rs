use super::context::{self, CommandContext};
use super::Command;
use crate::core::errors::Result;
use crate::engine::EngineServices;
use std::sync::Arc;
use tracing::debug;

/// Runs commands, each in its own context and transaction
#[derive(Clone)]
pub struct CommandExecutor {
    services: Arc<EngineServices>,
}

impl CommandExecutor {
    pub fn new(services: Arc<EngineServices>) -> Self {
        Self { services }
    }

    pub fn services(&self) -> &Arc<EngineServices> {
        &self.services
    }

    /// Execute `command` in a new context. Calling this from inside another
    /// command still opens a separate transaction; use
    /// [`CommandContext::execute`] to join the caller's.
    pub async fn execute<C: Command>(&self, command: C) -> Result<C::Output> {
        let name = command.name();
        debug!(command = name, "Executing command");

        let mut ctx = CommandContext::open(name, self.services.clone());
        let scope = ctx.scope(name);
        context::scoped(scope, async move {
            let outcome = command.execute(&mut ctx).await;
            ctx.close(outcome).await
        })
        .await
    }
}
