use crate::runtime::Execution;
use crate::storage::{Entity, EntityKind, Record};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Handler type of timer jobs
pub const TIMER_HANDLER: &str = "timer";
/// Handler type of asynchronous continuations
pub const ASYNC_CONTINUATION_HANDLER: &str = "async-continuation";

/// Name given to exception stacktrace blobs
pub const EXCEPTION_STACKTRACE_NAME: &str = "job.exceptionStacktrace";

/// A persisted unit of deferred work
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub execution_id: Option<String>,
    pub process_instance_id: Option<String>,
    pub handler_type: String,
    pub handler_configuration: String,
    pub due_date: DateTime<Utc>,
    pub lock_owner: Option<String>,
    pub lock_expiration_time: Option<DateTime<Utc>>,
    /// Remaining attempts. Zero means dead-lettered.
    pub retries: u32,
    pub exception_message: Option<String>,
    pub exception_stacktrace_id: Option<String>,
    /// Exclusive jobs of one process instance never run at the same time
    pub exclusive: bool,
    pub revision: u32,
}

impl Job {
    pub fn new(
        handler_type: impl Into<String>,
        handler_configuration: impl Into<String>,
        due_date: DateTime<Utc>,
        retries: u32,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            execution_id: None,
            process_instance_id: None,
            handler_type: handler_type.into(),
            handler_configuration: handler_configuration.into(),
            due_date,
            lock_owner: None,
            lock_expiration_time: None,
            retries,
            exception_message: None,
            exception_stacktrace_id: None,
            exclusive: true,
            revision: 0,
        }
    }

    /// Attach the job to an execution
    pub fn for_execution(mut self, execution: &Execution) -> Self {
        self.execution_id = Some(execution.id.clone());
        self.process_instance_id = Some(execution.process_instance_id.clone());
        self
    }

    pub fn exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }

    pub fn is_locked_at(&self, now: DateTime<Utc>) -> bool {
        matches!(self.lock_expiration_time, Some(expires) if expires > now)
    }

    pub fn is_dead_letter(&self) -> bool {
        self.retries == 0
    }

    /// Due, retries left, and not held by a live lock
    pub fn is_acquirable_at(&self, now: DateTime<Utc>) -> bool {
        self.due_date <= now && self.retries > 0 && !self.is_locked_at(now)
    }

    pub fn lock(&mut self, owner: impl Into<String>, until: DateTime<Utc>) {
        self.lock_owner = Some(owner.into());
        self.lock_expiration_time = Some(until);
    }

    pub fn unlock(&mut self) {
        self.lock_owner = None;
        self.lock_expiration_time = None;
    }

    pub fn is_owned_by(&self, owner: &str) -> bool {
        self.lock_owner.as_deref() == Some(owner)
    }
}

impl Entity for Job {
    const KIND: EntityKind = EntityKind::Job;

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
        Record::Job(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_acquirable_rules() {
        let now = Utc::now();
        let mut job = Job::new(TIMER_HANDLER, "wait", now, 3);
        assert!(job.is_acquirable_at(now));

        job.due_date = now + Duration::minutes(1);
        assert!(!job.is_acquirable_at(now));
        job.due_date = now;

        job.lock("node-a", now + Duration::minutes(5));
        assert!(job.is_locked_at(now));
        assert!(!job.is_acquirable_at(now));
        // expired locks do not protect the job
        assert!(job.is_acquirable_at(now + Duration::minutes(6)));

        job.unlock();
        job.retries = 0;
        assert!(job.is_dead_letter());
        assert!(!job.is_acquirable_at(now));
    }
}
