//! Storage layer for the engine
//!
//! Entities are persisted through the [`EntityStore`] trait. Writes never go to
//! the store directly: a command's persistence session collects them into a
//! [`WriteBatch`], checks revisions at flush time and stages the batch into the
//! command's transaction, which applies it atomically on commit.

pub mod memory;
pub mod persistence;

pub use memory::MemoryStore;
pub use persistence::PersistenceSession;

use crate::core::errors::Result;
use crate::jobs::Job;
use crate::runtime::Execution;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kinds of persisted entities
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    Execution,
    Job,
    ByteArray,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Execution => "Execution",
            EntityKind::Job => "Job",
            EntityKind::ByteArray => "ByteArray",
        }
    }
}

/// A revisioned, persisted entity
pub trait Entity: Clone + PartialEq + Send + Sync + 'static {
    const KIND: EntityKind;

    fn id(&self) -> &str;
    fn revision(&self) -> u32;
    fn set_revision(&mut self, revision: u32);
    fn into_record(self) -> Record;
}

/// Binary blob referenced by id. Jobs keep their full exception trace here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteArray {
    pub id: String,
    pub name: String,
    pub bytes: Vec<u8>,
    pub revision: u32,
}

impl ByteArray {
    pub fn new(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            bytes,
            revision: 0,
        }
    }

    /// Bytes decoded as UTF-8, lossy
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

impl Entity for ByteArray {
    const KIND: EntityKind = EntityKind::ByteArray;

    fn id(&self) -> &str {
        &self.id
    }

    fn revision(&self) -> u32 {
        self.revision
    }

    fn set_revision(&mut self, revision: u32) {
        self.revision = revision;
    }

    fn into_record(self) -> Record {
        Record::ByteArray(self)
    }
}

/// Owned entity of any kind
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Execution(Execution),
    Job(Job),
    ByteArray(ByteArray),
}

impl Record {
    pub fn kind(&self) -> EntityKind {
        match self {
            Record::Execution(_) => EntityKind::Execution,
            Record::Job(_) => EntityKind::Job,
            Record::ByteArray(_) => EntityKind::ByteArray,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Record::Execution(e) => e.id(),
            Record::Job(j) => j.id(),
            Record::ByteArray(b) => b.id(),
        }
    }

    pub fn revision(&self) -> u32 {
        match self {
            Record::Execution(e) => e.revision(),
            Record::Job(j) => j.revision(),
            Record::ByteArray(b) => b.revision(),
        }
    }
}

/// One staged write. Updates and deletes carry the revision they were read at.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    Insert(Record),
    Update(Record),
    Delete {
        kind: EntityKind,
        id: String,
        revision: u32,
    },
}

/// Ordered set of writes applied all-or-nothing
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteBatch {
    pub ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<E: Entity>(&mut self, entity: E) {
        self.ops.push(WriteOp::Insert(entity.into_record()));
    }

    pub fn update<E: Entity>(&mut self, entity: E) {
        self.ops.push(WriteOp::Update(entity.into_record()));
    }

    pub fn delete<E: Entity>(&mut self, entity: &E) {
        self.ops.push(WriteOp::Delete {
            kind: E::KIND,
            id: entity.id().to_string(),
            revision: entity.revision(),
        });
    }

    pub fn append(&mut self, mut other: WriteBatch) {
        self.ops.append(&mut other.ops);
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }
}

/// Storage trait for entity persistence
#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn find_execution(&self, id: &str) -> Result<Option<Execution>>;

    /// Direct children of an execution, in creation order
    async fn find_child_executions(&self, parent_id: &str) -> Result<Vec<Execution>>;

    /// Every execution of a process instance, the root first
    async fn find_executions_by_process_instance(
        &self,
        process_instance_id: &str,
    ) -> Result<Vec<Execution>>;

    async fn find_job(&self, id: &str) -> Result<Option<Job>>;

    async fn find_jobs_by_execution(&self, execution_id: &str) -> Result<Vec<Job>>;

    async fn find_jobs_by_process_instance(&self, process_instance_id: &str) -> Result<Vec<Job>>;

    /// Jobs that are due, have retries left and are unlocked or whose lock
    /// expired, ordered by due date
    async fn find_acquirable_jobs(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>>;

    /// Jobs whose retries are exhausted
    async fn find_dead_letter_jobs(&self, limit: usize) -> Result<Vec<Job>>;

    async fn find_byte_array(&self, id: &str) -> Result<Option<ByteArray>>;

    /// Check every write's revision without applying anything
    async fn check(&self, batch: &WriteBatch) -> Result<()>;

    /// Check and apply a batch atomically. Applied rows get their revision bumped.
    async fn apply(&self, batch: WriteBatch) -> Result<()>;
}
