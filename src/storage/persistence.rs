use super::{ByteArray, Entity, EntityStore, WriteBatch};
use crate::command::session::Session;
use crate::command::transaction::TransactionContext;
use crate::core::errors::{EngineError, Result};
use crate::jobs::Job;
use crate::runtime::Execution;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryState {
    /// Loaded from the store, or attached for update
    Persistent,
    /// Created in this command
    Inserted,
    /// Persistent row scheduled for deletion
    Deleted,
    /// Inserted and deleted again in this command; never written
    Discarded,
}

struct CachedEntity<T> {
    current: T,
    /// Snapshot as read from the store; `None` for detached updates
    original: Option<T>,
    state: EntryState,
    /// Written on flush even when unchanged, so its revision is checked and bumped
    forced: bool,
}

impl<T> CachedEntity<T> {
    fn is_live(&self) -> bool {
        matches!(self.state, EntryState::Persistent | EntryState::Inserted)
    }
}

/// Identity map for one entity kind
struct EntityCache<T> {
    entries: HashMap<String, CachedEntity<T>>,
    order: Vec<String>,
}

impl<T: Entity> EntityCache<T> {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            order: Vec::new(),
        }
    }

    /// `Some(None)` means the entity is known and was deleted in this command
    fn lookup(&self, id: &str) -> Option<Option<T>> {
        self.entries
            .get(id)
            .map(|cached| cached.is_live().then(|| cached.current.clone()))
    }

    fn track(&mut self, entity: T, original: Option<T>, state: EntryState) {
        let id = entity.id().to_string();
        self.order.push(id.clone());
        self.entries.insert(
            id,
            CachedEntity {
                current: entity,
                original,
                state,
                forced: false,
            },
        );
    }

    /// Register a row read from the store. An already cached version wins.
    fn remember(&mut self, entity: T) -> Option<T> {
        match self.entries.get(entity.id()) {
            Some(cached) => cached.is_live().then(|| cached.current.clone()),
            None => {
                self.track(entity.clone(), Some(entity.clone()), EntryState::Persistent);
                Some(entity)
            }
        }
    }

    fn insert(&mut self, entity: T) -> Result<()> {
        if self.entries.contains_key(entity.id()) {
            return Err(EngineError::fault(format!(
                "{} {} inserted twice",
                T::KIND.as_str(),
                entity.id()
            )));
        }
        self.track(entity, None, EntryState::Inserted);
        Ok(())
    }

    fn update(&mut self, entity: T) -> Result<()> {
        match self.entries.get_mut(entity.id()) {
            Some(cached) if cached.is_live() => {
                cached.current = entity;
                Ok(())
            }
            Some(_) => Err(EngineError::fault(format!(
                "{} {} was already deleted in this command",
                T::KIND.as_str(),
                entity.id()
            ))),
            None => {
                self.track(entity, None, EntryState::Persistent);
                Ok(())
            }
        }
    }

    fn force(&mut self, id: &str) -> Result<()> {
        match self.entries.get_mut(id) {
            Some(cached) if cached.is_live() => {
                cached.forced = true;
                Ok(())
            }
            _ => Err(EngineError::fault(format!(
                "{} {} is not loaded in this command",
                T::KIND.as_str(),
                id
            ))),
        }
    }

    fn delete(&mut self, entity: T) {
        match self.entries.get_mut(entity.id()) {
            Some(cached) => {
                cached.state = match cached.state {
                    EntryState::Inserted | EntryState::Discarded => EntryState::Discarded,
                    EntryState::Persistent | EntryState::Deleted => EntryState::Deleted,
                };
                cached.current = entity;
            }
            None => self.track(entity, None, EntryState::Deleted),
        }
    }

    fn removed(&self, id: &str) -> Option<T> {
        self.entries
            .get(id)
            .filter(|cached| !cached.is_live())
            .map(|cached| cached.current.clone())
    }

    /// Combine query results from the store with this command's pending changes
    fn merge(&mut self, rows: Vec<T>, filter: impl Fn(&T) -> bool) -> Vec<T> {
        let mut seen = HashSet::new();
        let mut merged = Vec::new();

        for row in rows {
            seen.insert(row.id().to_string());
            if let Some(entity) = self.remember(row) {
                if filter(&entity) {
                    merged.push(entity);
                }
            }
        }

        for id in &self.order {
            if seen.contains(id) {
                continue;
            }
            if let Some(cached) = self.entries.get(id) {
                if cached.is_live() && filter(&cached.current) {
                    seen.insert(id.clone());
                    merged.push(cached.current.clone());
                }
            }
        }
        merged
    }

    fn has_inserts(&self) -> bool {
        self.entries
            .values()
            .any(|cached| cached.state == EntryState::Inserted)
    }

    fn collect_writes(
        &self,
        inserts: &mut WriteBatch,
        updates: &mut WriteBatch,
        deletes: &mut WriteBatch,
    ) {
        for id in &self.order {
            let Some(cached) = self.entries.get(id) else {
                continue;
            };
            match cached.state {
                EntryState::Inserted => inserts.insert(cached.current.clone()),
                EntryState::Persistent => {
                    if cached.forced || cached.original.as_ref() != Some(&cached.current) {
                        updates.update(cached.current.clone());
                    }
                }
                EntryState::Deleted => deletes.delete(&cached.current),
                EntryState::Discarded => {}
            }
        }
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }
}

/// Identity map plus unit of work over an [`EntityStore`].
///
/// Every entity read in a command is cached, so two lookups of the same id
/// return the same state. Changes are written as one batch at flush, after a
/// revision check against the store.
pub struct PersistenceSession {
    store: Arc<dyn EntityStore>,
    job_notify: Option<Arc<Notify>>,
    executions: EntityCache<Execution>,
    jobs: EntityCache<Job>,
    byte_arrays: EntityCache<ByteArray>,
}

impl PersistenceSession {
    pub fn new(store: Arc<dyn EntityStore>) -> Self {
        Self {
            store,
            job_notify: None,
            executions: EntityCache::new(),
            jobs: EntityCache::new(),
            byte_arrays: EntityCache::new(),
        }
    }

    /// Wake the job executor after commits that created jobs
    pub fn with_job_notify(mut self, notify: Arc<Notify>) -> Self {
        self.job_notify = Some(notify);
        self
    }

    // Executions

    pub async fn find_execution(&mut self, id: &str) -> Result<Option<Execution>> {
        if let Some(cached) = self.executions.lookup(id) {
            return Ok(cached);
        }
        let loaded = self.store.find_execution(id).await?;
        Ok(loaded.and_then(|e| self.executions.remember(e)))
    }

    pub async fn execution(&mut self, id: &str) -> Result<Execution> {
        self.find_execution(id)
            .await?
            .ok_or_else(|| EngineError::not_found("Execution", id))
    }

    pub fn insert_execution(&mut self, execution: Execution) -> Result<()> {
        self.executions.insert(execution)
    }

    pub fn update_execution(&mut self, execution: Execution) -> Result<()> {
        self.executions.update(execution)
    }

    /// Write the execution on flush even if unchanged. Two commands that both
    /// force the same row cannot both commit.
    pub async fn force_update_execution(&mut self, id: &str) -> Result<()> {
        self.execution(id).await?;
        self.executions.force(id)
    }

    /// Mark an execution ended and schedule its row for deletion
    pub fn delete_execution(&mut self, execution: &Execution) {
        let mut ended = execution.clone();
        ended.is_ended = true;
        ended.is_active = false;
        self.executions.delete(ended);
    }

    /// Final state of an execution deleted in this command
    pub fn ended_execution(&self, id: &str) -> Option<Execution> {
        self.executions.removed(id)
    }

    pub async fn find_child_executions(&mut self, parent_id: &str) -> Result<Vec<Execution>> {
        let rows = self.store.find_child_executions(parent_id).await?;
        Ok(self
            .executions
            .merge(rows, |e| e.parent_id.as_deref() == Some(parent_id)))
    }

    pub async fn find_executions_by_process_instance(
        &mut self,
        process_instance_id: &str,
    ) -> Result<Vec<Execution>> {
        let rows = self
            .store
            .find_executions_by_process_instance(process_instance_id)
            .await?;
        Ok(self
            .executions
            .merge(rows, |e| e.process_instance_id == process_instance_id))
    }

    // Jobs

    pub async fn find_job(&mut self, id: &str) -> Result<Option<Job>> {
        if let Some(cached) = self.jobs.lookup(id) {
            return Ok(cached);
        }
        let loaded = self.store.find_job(id).await?;
        Ok(loaded.and_then(|j| self.jobs.remember(j)))
    }

    pub async fn job(&mut self, id: &str) -> Result<Job> {
        self.find_job(id)
            .await?
            .ok_or_else(|| EngineError::not_found("Job", id))
    }

    pub fn insert_job(&mut self, job: Job) -> Result<()> {
        self.jobs.insert(job)
    }

    /// Update a job. Jobs not read in this command are checked against the
    /// revision they carry.
    pub fn update_job(&mut self, job: Job) -> Result<()> {
        self.jobs.update(job)
    }

    pub fn delete_job(&mut self, job: &Job) {
        self.jobs.delete(job.clone());
    }

    pub async fn find_jobs_by_execution(&mut self, execution_id: &str) -> Result<Vec<Job>> {
        let rows = self.store.find_jobs_by_execution(execution_id).await?;
        Ok(self
            .jobs
            .merge(rows, |j| j.execution_id.as_deref() == Some(execution_id)))
    }

    pub async fn find_jobs_by_process_instance(
        &mut self,
        process_instance_id: &str,
    ) -> Result<Vec<Job>> {
        let rows = self
            .store
            .find_jobs_by_process_instance(process_instance_id)
            .await?;
        Ok(self
            .jobs
            .merge(rows, |j| j.process_instance_id.as_deref() == Some(process_instance_id)))
    }

    pub async fn find_acquirable_jobs(
        &mut self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>> {
        let rows = self.store.find_acquirable_jobs(now, limit).await?;
        let mut jobs = self.jobs.merge(rows, |j| j.is_acquirable_at(now));
        jobs.truncate(limit);
        Ok(jobs)
    }

    pub async fn find_dead_letter_jobs(&mut self, limit: usize) -> Result<Vec<Job>> {
        let rows = self.store.find_dead_letter_jobs(limit).await?;
        let mut jobs = self.jobs.merge(rows, Job::is_dead_letter);
        jobs.truncate(limit);
        Ok(jobs)
    }

    // Byte arrays

    pub async fn find_byte_array(&mut self, id: &str) -> Result<Option<ByteArray>> {
        if let Some(cached) = self.byte_arrays.lookup(id) {
            return Ok(cached);
        }
        let loaded = self.store.find_byte_array(id).await?;
        Ok(loaded.and_then(|b| self.byte_arrays.remember(b)))
    }

    pub fn insert_byte_array(&mut self, bytes: ByteArray) -> Result<()> {
        self.byte_arrays.insert(bytes)
    }

    pub fn update_byte_array(&mut self, bytes: ByteArray) -> Result<()> {
        self.byte_arrays.update(bytes)
    }

    pub fn delete_byte_array(&mut self, bytes: &ByteArray) {
        self.byte_arrays.delete(bytes.clone());
    }

    /// Writes this session would flush: inserts, then updates, then deletes
    pub fn pending_writes(&self) -> WriteBatch {
        let mut inserts = WriteBatch::new();
        let mut updates = WriteBatch::new();
        let mut deletes = WriteBatch::new();

        self.executions
            .collect_writes(&mut inserts, &mut updates, &mut deletes);
        self.jobs.collect_writes(&mut inserts, &mut updates, &mut deletes);
        self.byte_arrays
            .collect_writes(&mut inserts, &mut updates, &mut deletes);

        inserts.append(updates);
        inserts.append(deletes);
        inserts
    }

    fn clear(&mut self) {
        self.executions.clear();
        self.jobs.clear();
        self.byte_arrays.clear();
    }
}

#[async_trait]
impl Session for PersistenceSession {
    async fn flush(&mut self, tx: &mut dyn TransactionContext) -> Result<()> {
        let batch = self.pending_writes();
        if batch.is_empty() {
            return Ok(());
        }

        // fail before commit when another transaction got there first
        self.store.check(&batch).await?;

        debug!(writes = batch.len(), "flushing persistence session");
        let jobs_created = self.jobs.has_inserts();
        tx.stage(batch);

        if jobs_created {
            if let Some(notify) = self.job_notify.clone() {
                tx.on_commit(Box::new(move || notify.notify_one()));
            }
        }

        self.clear();
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.clear();
        Ok(())
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::transaction::StoreTransaction;
    use crate::jobs::model::TIMER_HANDLER;
    use crate::storage::{MemoryStore, WriteOp};

    async fn seeded() -> (Arc<MemoryStore>, Execution) {
        let store = Arc::new(MemoryStore::new());
        let mut root = Execution::new_process_instance("order", None);
        root.activity_id = Some("fork".into());
        let mut batch = WriteBatch::new();
        batch.insert(root.clone());
        store.apply(batch).await.unwrap();
        root.revision = 1;
        (store, root)
    }

    #[tokio::test]
    async fn test_identity_map_returns_pending_state() {
        let (store, root) = seeded().await;
        let mut session = PersistenceSession::new(store.clone());

        let mut loaded = session.execution(&root.id).await.unwrap();
        loaded.is_active = false;
        session.update_execution(loaded).unwrap();

        let again = session.execution(&root.id).await.unwrap();
        assert!(!again.is_active);
        // nothing reached the store yet
        assert!(store.find_execution(&root.id).await.unwrap().unwrap().is_active);
    }

    #[tokio::test]
    async fn test_child_query_merges_uncommitted_children() {
        let (store, root) = seeded().await;
        let mut session = PersistenceSession::new(store.clone());

        let mut first = Execution::new_child(&root);
        first.is_concurrent = true;
        let mut batch = WriteBatch::new();
        batch.insert(first.clone());
        store.apply(batch).await.unwrap();

        let second = Execution::new_child(&root);
        session.insert_execution(second.clone()).unwrap();

        let children = session.find_child_executions(&root.id).await.unwrap();
        let ids: Vec<&str> = children.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec![first.id.as_str(), second.id.as_str()]);

        session.delete_execution(&children[0]);
        let children = session.find_child_executions(&root.id).await.unwrap();
        assert_eq!(children.len(), 1);
        assert!(session.ended_execution(&first.id).unwrap().is_ended);
    }

    #[tokio::test]
    async fn test_inserted_then_deleted_is_never_written() {
        let (store, root) = seeded().await;
        let mut session = PersistenceSession::new(store);

        let job = Job::new(TIMER_HANDLER, "t", Utc::now(), 3).for_execution(&root);
        session.insert_job(job.clone()).unwrap();
        session.delete_job(&job);

        assert!(session.pending_writes().is_empty());
        assert!(session.find_job(&job.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_flush_orders_writes_and_detects_conflicts() {
        let (store, root) = seeded().await;
        let mut session = PersistenceSession::new(store.clone());

        let mut loaded = session.execution(&root.id).await.unwrap();
        loaded.is_active = false;
        session.update_execution(loaded).unwrap();
        session
            .insert_execution(Execution::new_child(&root))
            .unwrap();

        let batch = session.pending_writes();
        assert!(matches!(batch.ops[0], WriteOp::Insert(_)));
        assert!(matches!(batch.ops[1], WriteOp::Update(_)));

        // someone else updates the root first
        let mut concurrent = root.clone();
        concurrent.business_key = Some("other".into());
        let mut other = WriteBatch::new();
        other.update(concurrent);
        store.apply(other).await.unwrap();

        let mut tx = StoreTransaction::new(store.clone());
        let err = session.flush(&mut tx).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_forced_execution_is_written_unchanged() {
        let (store, root) = seeded().await;
        let mut session = PersistenceSession::new(store.clone());

        session.execution(&root.id).await.unwrap();
        assert!(session.pending_writes().is_empty());

        session.force_update_execution(&root.id).await.unwrap();
        let batch = session.pending_writes();
        assert_eq!(batch.len(), 1);
        assert!(matches!(batch.ops[0], WriteOp::Update(_)));

        let mut tx = StoreTransaction::new(store.clone());
        session.flush(&mut tx).await.unwrap();
        tx.commit().await.unwrap();
        let stored = store.find_execution(&root.id).await.unwrap().unwrap();
        assert_eq!(stored.revision, 2);

        let err = PersistenceSession::new(store)
            .force_update_execution("missing")
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound { .. }));
    }
}
