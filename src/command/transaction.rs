use crate::core::errors::{EngineError, Result};
use crate::storage::{EntityStore, WriteBatch};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Callback run once the transaction committed
pub type CommitListener = Box<dyn FnOnce() + Send>;

/// Unit of atomic write bound to one command context
#[async_trait]
pub trait TransactionContext: Send {
    /// Queue writes; they reach the store on commit
    fn stage(&mut self, batch: WriteBatch);

    /// Register a callback that runs after a successful commit
    fn on_commit(&mut self, listener: CommitListener);

    async fn commit(&mut self) -> Result<()>;

    /// Discard staged writes and pending listeners
    async fn rollback(&mut self) -> Result<()>;
}

/// Opens one transaction per command context
pub trait TransactionContextFactory: Send + Sync {
    fn open(&self) -> Box<dyn TransactionContext>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Active,
    Committed,
    RolledBack,
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionState::Active => write!(f, "active"),
            TransactionState::Committed => write!(f, "committed"),
            TransactionState::RolledBack => write!(f, "rolled back"),
        }
    }
}

/// Transaction over an [`EntityStore`]: staged batches are applied as one
/// batch on commit, so either every write lands or none does.
pub struct StoreTransaction {
    store: Arc<dyn EntityStore>,
    staged: WriteBatch,
    listeners: Vec<CommitListener>,
    state: TransactionState,
}

impl StoreTransaction {
    pub fn new(store: Arc<dyn EntityStore>) -> Self {
        Self {
            store,
            staged: WriteBatch::new(),
            listeners: Vec::new(),
            state: TransactionState::Active,
        }
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }
}

#[async_trait]
impl TransactionContext for StoreTransaction {
    fn stage(&mut self, batch: WriteBatch) {
        self.staged.append(batch);
    }

    fn on_commit(&mut self, listener: CommitListener) {
        self.listeners.push(listener);
    }

    async fn commit(&mut self) -> Result<()> {
        if self.state != TransactionState::Active {
            return Err(EngineError::fault(format!(
                "cannot commit a transaction that is already {}",
                self.state
            )));
        }

        let batch = std::mem::take(&mut self.staged);
        if !batch.is_empty() {
            debug!(writes = batch.len(), "committing transaction");
            self.store.apply(batch).await?;
        }
        self.state = TransactionState::Committed;

        for listener in self.listeners.drain(..) {
            listener();
        }
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        if self.state == TransactionState::Committed {
            return Err(EngineError::fault("cannot roll back a committed transaction"));
        }
        if !self.staged.is_empty() {
            debug!(writes = self.staged.len(), "rolling back transaction");
        }
        self.staged = WriteBatch::new();
        self.listeners.clear();
        self.state = TransactionState::RolledBack;
        Ok(())
    }
}

pub struct StoreTransactionFactory {
    store: Arc<dyn EntityStore>,
}

impl StoreTransactionFactory {
    pub fn new(store: Arc<dyn EntityStore>) -> Self {
        Self { store }
    }
}

impl TransactionContextFactory for StoreTransactionFactory {
    fn open(&self) -> Box<dyn TransactionContext> {
        Box::new(StoreTransaction::new(self.store.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Execution;
    use crate::storage::MemoryStore;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn test_commit_applies_and_notifies() {
        let store = Arc::new(MemoryStore::new());
        let mut tx = StoreTransaction::new(store.clone());

        let mut batch = WriteBatch::new();
        batch.insert(Execution::new_process_instance("order", None));
        tx.stage(batch);

        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        tx.on_commit(Box::new(move || flag.store(true, Ordering::SeqCst)));

        tx.commit().await.unwrap();
        assert_eq!(tx.state(), TransactionState::Committed);
        assert!(fired.load(Ordering::SeqCst));
        assert_eq!(store.execution_count(), 1);
        assert!(tx.commit().await.is_err());
    }

    #[tokio::test]
    async fn test_rollback_discards_everything() {
        let store = Arc::new(MemoryStore::new());
        let mut tx = StoreTransaction::new(store.clone());

        let mut batch = WriteBatch::new();
        batch.insert(Execution::new_process_instance("order", None));
        tx.stage(batch);

        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        tx.on_commit(Box::new(move || flag.store(true, Ordering::SeqCst)));

        tx.rollback().await.unwrap();
        assert_eq!(tx.state(), TransactionState::RolledBack);
        assert!(!fired.load(Ordering::SeqCst));
        assert_eq!(store.execution_count(), 0);
    }
}
