//! Per-topic mutual exclusion.
//!
//! Operations on one topic run one at a time; different topics never
//! contend.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Default)]
pub struct TopicLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl TopicLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to the topic.
    pub async fn lock(&self, topic: &str) -> OwnedMutexGuard<()> {
        let mutex = self
            .locks
            .entry(topic.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        mutex.lock_owned().await
    }

    /// Drop the lock entry if nobody holds or waits on it.
    pub fn prune(&self, topic: &str) {
        self.locks
            .remove_if(topic, |_, mutex| Arc::strong_count(mutex) == 1);
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_topic_serializes() {
        let locks = Arc::new(TopicLocks::new());
        let guard = locks.lock("t").await;

        let contender = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _g = locks.lock("t").await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        drop(guard);
        contender.await.unwrap();
    }

    #[tokio::test]
    async fn test_distinct_topics_do_not_contend() {
        let locks = TopicLocks::new();
        let _a = locks.lock("a").await;
        let b = tokio::time::timeout(Duration::from_millis(50), locks.lock("b")).await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn test_prune_keeps_held_locks() {
        let locks = TopicLocks::new();
        let guard = locks.lock("t").await;
        locks.prune("t");
        assert_eq!(locks.len(), 1);
        drop(guard);
        locks.prune("t");
        assert!(locks.is_empty());
    }
}
