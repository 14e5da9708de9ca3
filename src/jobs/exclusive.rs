use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Per process instance mutex for exclusive jobs.
///
/// Two exclusive jobs of the same process instance never run at the same
/// time on this node. Entries are dropped once nobody holds or waits on them.
#[derive(Debug, Clone, Default)]
pub struct ExclusiveJobLocks {
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl ExclusiveJobLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, process_instance_id: &str) -> ExclusiveGuard {
        let mutex = self
            .locks
            .entry(process_instance_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = mutex.lock_owned().await;
        ExclusiveGuard {
            key: process_instance_id.to_string(),
            guard: Some(guard),
            locks: self.locks.clone(),
        }
    }

    /// Process instances with a held or awaited lock
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

pub struct ExclusiveGuard {
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl Drop for ExclusiveGuard {
    fn drop(&mut self) {
        // release first so the guard's own reference is gone
        self.guard.take();
        self.locks
            .remove_if(&self.key, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_instance_is_serialized() {
        let locks = ExclusiveJobLocks::new();
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let locks = locks.clone();
            let running = running.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                let _guard = locks.lock("pi-1").await;
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                running.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_different_instances_do_not_block() {
        let locks = ExclusiveJobLocks::new();
        let _first = locks.lock("pi-1").await;
        let second = tokio::time::timeout(Duration::from_millis(100), locks.lock("pi-2")).await;
        assert!(second.is_ok());
        assert_eq!(locks.len(), 2);
    }
}
