//! Command kernel
//!
//! Every engine operation is a [`Command`] run by the [`CommandExecutor`]
//! inside a fresh [`CommandContext`]: one transaction, lazily opened sessions,
//! and all-or-nothing effects.

pub mod context;
pub mod executor;
pub mod session;
pub mod transaction;

pub use context::{CommandContext, ContextScope, ErrorAccumulator};
pub use executor::CommandExecutor;
pub use session::{session_factory, Session, SessionFactories, SessionFactory};
pub use transaction::{
    CommitListener, StoreTransaction, StoreTransactionFactory, TransactionContext,
    TransactionContextFactory,
};

use crate::core::errors::Result;
use async_trait::async_trait;

/// A unit of engine work executed inside a command context
#[async_trait]
pub trait Command: Send + Sync {
    type Output: Send;

    /// Name used in logs, history and error reports
    fn name(&self) -> &'static str;

    async fn execute(&self, ctx: &mut CommandContext) -> Result<Self::Output>;
}
