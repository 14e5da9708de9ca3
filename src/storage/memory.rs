use super::{ByteArray, Entity, EntityKind, EntityStore, Record, WriteBatch, WriteOp};
use crate::core::errors::{EngineError, Result};
use crate::jobs::Job;
use crate::runtime::Execution;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::trace;

struct Row<T> {
    seq: u64,
    entity: T,
}

struct Table<T> {
    rows: HashMap<String, Row<T>>,
}

impl<T: Entity> Table<T> {
    fn new() -> Self {
        Self {
            rows: HashMap::new(),
        }
    }

    fn get(&self, id: &str) -> Option<T> {
        self.rows.get(id).map(|row| row.entity.clone())
    }

    /// Matching rows in insertion order
    fn select(&self, filter: impl Fn(&T) -> bool) -> Vec<T> {
        let mut rows: Vec<&Row<T>> = self.rows.values().filter(|r| filter(&r.entity)).collect();
        rows.sort_by_key(|r| r.seq);
        rows.into_iter().map(|r| r.entity.clone()).collect()
    }

    fn check_insert(&self, id: &str) -> Result<()> {
        if self.rows.contains_key(id) {
            return Err(EngineError::conflict(T::KIND.as_str(), id, 0));
        }
        Ok(())
    }

    fn check_revision(&self, id: &str, revision: u32) -> Result<()> {
        match self.rows.get(id) {
            Some(row) if row.entity.revision() == revision => Ok(()),
            _ => Err(EngineError::conflict(T::KIND.as_str(), id, revision)),
        }
    }

    fn insert(&mut self, seq: u64, mut entity: T) {
        entity.set_revision(1);
        self.rows
            .insert(entity.id().to_string(), Row { seq, entity });
    }

    fn update(&mut self, mut entity: T) {
        if let Some(row) = self.rows.get_mut(entity.id()) {
            entity.set_revision(row.entity.revision() + 1);
            row.entity = entity;
        }
    }

    fn delete(&mut self, id: &str) {
        self.rows.remove(id);
    }
}

struct Tables {
    seq: u64,
    executions: Table<Execution>,
    jobs: Table<Job>,
    byte_arrays: Table<ByteArray>,
}

impl Tables {
    fn check(&self, op: &WriteOp) -> Result<()> {
        match op {
            WriteOp::Insert(record) => match record {
                Record::Execution(e) => self.executions.check_insert(&e.id),
                Record::Job(j) => self.jobs.check_insert(&j.id),
                Record::ByteArray(b) => self.byte_arrays.check_insert(&b.id),
            },
            WriteOp::Update(record) => self.check_revision(record.kind(), record.id(), record.revision()),
            WriteOp::Delete { kind, id, revision } => self.check_revision(*kind, id, *revision),
        }
    }

    fn check_revision(&self, kind: EntityKind, id: &str, revision: u32) -> Result<()> {
        match kind {
            EntityKind::Execution => self.executions.check_revision(id, revision),
            EntityKind::Job => self.jobs.check_revision(id, revision),
            EntityKind::ByteArray => self.byte_arrays.check_revision(id, revision),
        }
    }

    fn apply(&mut self, op: WriteOp) {
        match op {
            WriteOp::Insert(record) => {
                self.seq += 1;
                let seq = self.seq;
                match record {
                    Record::Execution(e) => self.executions.insert(seq, e),
                    Record::Job(j) => self.jobs.insert(seq, j),
                    Record::ByteArray(b) => self.byte_arrays.insert(seq, b),
                }
            }
            WriteOp::Update(record) => match record {
                Record::Execution(e) => self.executions.update(e),
                Record::Job(j) => self.jobs.update(j),
                Record::ByteArray(b) => self.byte_arrays.update(b),
            },
            WriteOp::Delete { kind, id, .. } => match kind {
                EntityKind::Execution => self.executions.delete(&id),
                EntityKind::Job => self.jobs.delete(&id),
                EntityKind::ByteArray => self.byte_arrays.delete(&id),
            },
        }
    }
}

/// In-process store with per-row revisions.
///
/// Several engines can share one `Arc<MemoryStore>`; they then behave like
/// cluster nodes on one database, including optimistic lock conflicts.
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables {
                seq: 0,
                executions: Table::new(),
                jobs: Table::new(),
                byte_arrays: Table::new(),
            }),
        }
    }

    /// Number of stored executions across all process instances
    pub fn execution_count(&self) -> usize {
        self.tables.read().executions.rows.len()
    }

    pub fn job_count(&self) -> usize {
        self.tables.read().jobs.rows.len()
    }

    pub fn byte_array_count(&self) -> usize {
        self.tables.read().byte_arrays.rows.len()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EntityStore for MemoryStore {
    async fn find_execution(&self, id: &str) -> Result<Option<Execution>> {
        Ok(self.tables.read().executions.get(id))
    }

    async fn find_child_executions(&self, parent_id: &str) -> Result<Vec<Execution>> {
        Ok(self
            .tables
            .read()
            .executions
            .select(|e| e.parent_id.as_deref() == Some(parent_id)))
    }

    async fn find_executions_by_process_instance(
        &self,
        process_instance_id: &str,
    ) -> Result<Vec<Execution>> {
        Ok(self
            .tables
            .read()
            .executions
            .select(|e| e.process_instance_id == process_instance_id))
    }

    async fn find_job(&self, id: &str) -> Result<Option<Job>> {
        Ok(self.tables.read().jobs.get(id))
    }

    async fn find_jobs_by_execution(&self, execution_id: &str) -> Result<Vec<Job>> {
        Ok(self
            .tables
            .read()
            .jobs
            .select(|j| j.execution_id.as_deref() == Some(execution_id)))
    }

    async fn find_jobs_by_process_instance(&self, process_instance_id: &str) -> Result<Vec<Job>> {
        Ok(self
            .tables
            .read()
            .jobs
            .select(|j| j.process_instance_id.as_deref() == Some(process_instance_id)))
    }

    async fn find_acquirable_jobs(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>> {
        let mut jobs = self.tables.read().jobs.select(|j| j.is_acquirable_at(now));
        // stable sort keeps insertion order among equal due dates
        jobs.sort_by_key(|j| j.due_date);
        jobs.truncate(limit);
        Ok(jobs)
    }

    async fn find_dead_letter_jobs(&self, limit: usize) -> Result<Vec<Job>> {
        let mut jobs = self.tables.read().jobs.select(|j| j.is_dead_letter());
        jobs.truncate(limit);
        Ok(jobs)
    }

    async fn find_byte_array(&self, id: &str) -> Result<Option<ByteArray>> {
        Ok(self.tables.read().byte_arrays.get(id))
    }

    async fn check(&self, batch: &WriteBatch) -> Result<()> {
        let tables = self.tables.read();
        for op in &batch.ops {
            tables.check(op)?;
        }
        Ok(())
    }

    async fn apply(&self, batch: WriteBatch) -> Result<()> {
        let mut tables = self.tables.write();
        for op in &batch.ops {
            tables.check(op)?;
        }
        trace!(writes = batch.len(), "applying write batch");
        for op in batch.ops {
            tables.apply(op);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::model::TIMER_HANDLER;
    use chrono::Duration;

    fn batch_of(f: impl FnOnce(&mut WriteBatch)) -> WriteBatch {
        let mut batch = WriteBatch::new();
        f(&mut batch);
        batch
    }

    #[tokio::test]
    async fn test_insert_sets_first_revision() {
        let store = MemoryStore::new();
        let execution = Execution::new_process_instance("order", None);
        let id = execution.id.clone();

        store
            .apply(batch_of(|b| b.insert(execution)))
            .await
            .unwrap();

        let stored = store.find_execution(&id).await.unwrap().unwrap();
        assert_eq!(stored.revision, 1);
    }

    #[tokio::test]
    async fn test_stale_update_is_rejected_and_nothing_applies() {
        let store = MemoryStore::new();
        let execution = Execution::new_process_instance("order", None);
        store
            .apply(batch_of(|b| b.insert(execution.clone())))
            .await
            .unwrap();

        let mut fresh = store.find_execution(&execution.id).await.unwrap().unwrap();
        fresh.is_active = false;
        store.apply(batch_of(|b| b.update(fresh.clone()))).await.unwrap();

        // second writer still holds revision 1
        let mut stale = fresh.clone();
        stale.revision = 1;
        stale.is_active = true;
        let other = Execution::new_process_instance("order", None);
        let err = store
            .apply(batch_of(|b| {
                b.insert(other.clone());
                b.update(stale);
            }))
            .await
            .unwrap_err();
        assert!(err.is_conflict());

        // the insert in the failed batch was not applied either
        assert!(store.find_execution(&other.id).await.unwrap().is_none());
        let stored = store.find_execution(&execution.id).await.unwrap().unwrap();
        assert_eq!(stored.revision, 2);
        assert!(!stored.is_active);
    }

    #[tokio::test]
    async fn test_delete_of_missing_row_conflicts() {
        let store = MemoryStore::new();
        let job = Job::new(TIMER_HANDLER, "t", Utc::now(), 3);
        let err = store.apply(batch_of(|b| b.delete(&job))).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_acquirable_query() {
        let store = MemoryStore::new();
        let now = Utc::now();

        let due = Job::new(TIMER_HANDLER, "due", now - Duration::seconds(5), 3);
        let later = Job::new(TIMER_HANDLER, "later", now + Duration::minutes(5), 3);
        let mut locked = Job::new(TIMER_HANDLER, "locked", now - Duration::seconds(10), 3);
        locked.lock("node-b", now + Duration::minutes(1));
        let mut expired = Job::new(TIMER_HANDLER, "expired", now - Duration::seconds(20), 3);
        expired.lock("node-b", now - Duration::seconds(1));
        let dead = Job::new(TIMER_HANDLER, "dead", now - Duration::seconds(30), 0);

        store
            .apply(batch_of(|b| {
                for job in [due, later, locked, expired, dead] {
                    b.insert(job);
                }
            }))
            .await
            .unwrap();

        let acquirable: Vec<String> = store
            .find_acquirable_jobs(now, 10)
            .await
            .unwrap()
            .into_iter()
            .map(|j| j.handler_configuration)
            .collect();
        assert_eq!(acquirable, vec!["expired".to_string(), "due".to_string()]);

        assert_eq!(store.find_acquirable_jobs(now, 1).await.unwrap().len(), 1);
        assert_eq!(store.find_dead_letter_jobs(10).await.unwrap().len(), 1);
    }
}
