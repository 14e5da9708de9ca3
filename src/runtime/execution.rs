use crate::storage::{Entity, EntityKind, Record};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A token of control flow within a process instance.
///
/// Executions form a tree: the process instance is the root (`parent_id` is
/// `None`, `id == process_instance_id`). A forked execution becomes the
/// concurrency root of its concurrent children and goes inactive while they run.
/// Relations are ids resolved through the command's persistence session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Execution {
    pub id: String,
    pub process_instance_id: String,
    pub parent_id: Option<String>,
    pub process_definition_key: String,
    pub business_key: Option<String>,
    /// Current position in the definition. `None` only while being created.
    pub activity_id: Option<String>,
    pub is_active: bool,
    pub is_concurrent: bool,
    pub is_scope: bool,
    pub is_ended: bool,
    pub revision: u32,
}

impl Execution {
    /// Create the root execution of a new process instance
    pub fn new_process_instance(
        process_definition_key: impl Into<String>,
        business_key: Option<String>,
    ) -> Self {
        let id = Uuid::new_v4().to_string();
        Self {
            process_instance_id: id.clone(),
            id,
            parent_id: None,
            process_definition_key: process_definition_key.into(),
            business_key,
            activity_id: None,
            is_active: true,
            is_concurrent: false,
            is_scope: true,
            is_ended: false,
            revision: 0,
        }
    }

    /// Create a child of `parent` at the parent's activity
    pub fn new_child(parent: &Execution) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            process_instance_id: parent.process_instance_id.clone(),
            parent_id: Some(parent.id.clone()),
            process_definition_key: parent.process_definition_key.clone(),
            business_key: None,
            activity_id: parent.activity_id.clone(),
            is_active: true,
            is_concurrent: false,
            is_scope: false,
            is_ended: false,
            revision: 0,
        }
    }

    pub fn is_process_instance(&self) -> bool {
        self.parent_id.is_none()
    }

    pub fn is_at(&self, activity_id: &str) -> bool {
        self.activity_id.as_deref() == Some(activity_id)
    }

    /// The execution whose children are this execution's concurrent siblings.
    /// A concurrent execution's root is its parent, anything else is its own root.
    pub fn concurrency_root_id(&self) -> &str {
        match (&self.parent_id, self.is_concurrent && !self.is_scope) {
            (Some(parent), true) => parent,
            _ => &self.id,
        }
    }
}

impl Entity for Execution {
    const KIND: EntityKind = EntityKind::Execution;

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
        Record::Execution(self)
    }
}
