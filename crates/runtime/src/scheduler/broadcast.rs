//! Broadcast groups for one-to-many delivery
//!
//! A group is a named `tokio::sync::broadcast` channel with a time-to-live.
//! Any create, subscribe or publish keeps a group alive; a group idle for
//! longer than its TTL is dropped the next time the registry is touched,
//! which closes every outstanding subscription.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

use dsl::Value;

use crate::types::SchedulerError;

/// Handle to a live broadcast group
#[derive(Debug, Clone)]
pub struct BroadcastGroup {
    id: String,
    ttl: Duration,
    sender: broadcast::Sender<Value>,
}

impl BroadcastGroup {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// Inbound stream of one group
#[derive(Debug)]
pub struct Subscription {
    group: String,
    receiver: broadcast::Receiver<Value>,
}

impl Subscription {
    pub fn group(&self) -> &str {
        &self.group
    }

    /// Wait for the next message
    pub async fn recv(&mut self) -> Result<Value, SchedulerError> {
        match self.receiver.recv().await {
            Ok(value) => Ok(value),
            Err(broadcast::error::RecvError::Closed) => Err(SchedulerError::GroupClosed {
                group: self.group.clone(),
            }),
            Err(broadcast::error::RecvError::Lagged(skipped)) => Err(SchedulerError::Lagged {
                group: self.group.clone(),
                skipped,
            }),
        }
    }
}

struct GroupEntry {
    group: BroadcastGroup,
    last_activity: Instant,
}

impl GroupEntry {
    fn expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_activity) >= self.group.ttl
    }
}

/// All broadcast groups of one scheduling pool
pub(crate) struct BroadcastRegistry {
    groups: Mutex<HashMap<String, GroupEntry>>,
    capacity: usize,
}

impl BroadcastRegistry {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            groups: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Create a group, or return the live group with the same id
    pub(crate) fn create(&self, id: &str, ttl: Duration) -> BroadcastGroup {
        let now = Instant::now();
        let mut groups = self.groups.lock();
        prune(&mut groups, now);

        let entry = groups.entry(id.to_string()).or_insert_with(|| {
            tracing::debug!("Creating broadcast group '{}' (ttl {:?})", id, ttl);
            let (sender, _) = broadcast::channel(self.capacity);
            GroupEntry {
                group: BroadcastGroup {
                    id: id.to_string(),
                    ttl,
                    sender,
                },
                last_activity: now,
            }
        });
        entry.last_activity = now;
        entry.group.clone()
    }

    pub(crate) fn subscribe(&self, id: &str) -> Result<Subscription, SchedulerError> {
        let now = Instant::now();
        let mut groups = self.groups.lock();
        prune(&mut groups, now);

        let entry = groups.get_mut(id).ok_or_else(|| SchedulerError::GroupNotFound {
            group: id.to_string(),
        })?;
        entry.last_activity = now;
        Ok(Subscription {
            group: id.to_string(),
            receiver: entry.group.sender.subscribe(),
        })
    }

    /// Deliver to every current subscriber; returns how many received it
    pub(crate) fn publish(&self, id: &str, payload: Value) -> Result<usize, SchedulerError> {
        let now = Instant::now();
        let mut groups = self.groups.lock();
        prune(&mut groups, now);

        let entry = groups.get_mut(id).ok_or_else(|| SchedulerError::GroupNotFound {
            group: id.to_string(),
        })?;
        entry.last_activity = now;
        entry
            .group
            .sender
            .send(payload)
            .map_err(|_| SchedulerError::NoSubscribers {
                group: id.to_string(),
            })
    }

    pub(crate) fn get(&self, id: &str) -> Option<BroadcastGroup> {
        let mut groups = self.groups.lock();
        prune(&mut groups, Instant::now());
        groups.get(id).map(|entry| entry.group.clone())
    }

    pub(crate) fn len(&self) -> usize {
        let mut groups = self.groups.lock();
        prune(&mut groups, Instant::now());
        groups.len()
    }

    pub(crate) fn clear(&self) {
        self.groups.lock().clear();
    }
}

fn prune(groups: &mut HashMap<String, GroupEntry>, now: Instant) {
    groups.retain(|id, entry| {
        let keep = !entry.expired(now);
        if !keep {
            tracing::debug!("Broadcast group '{}' expired", id);
        }
        keep
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_is_idempotent_while_live() {
        let registry = BroadcastRegistry::new(16);
        let first = registry.create("reviewers", Duration::from_secs(60));
        let _sub = registry.subscribe("reviewers").unwrap();
        let second = registry.create("reviewers", Duration::from_secs(5));

        assert_eq!(second.ttl(), Duration::from_secs(60));
        assert_eq!(first.subscriber_count(), 1);
        assert_eq!(second.subscriber_count(), 1);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_publish_reaches_every_subscriber() {
        let registry = BroadcastRegistry::new(16);
        registry.create("reviewers", Duration::from_secs(60));
        let mut a = registry.subscribe("reviewers").unwrap();
        let mut b = registry.subscribe("reviewers").unwrap();

        let delivered = registry.publish("reviewers", Value::from("draft")).unwrap();
        assert_eq!(delivered, 2);
        assert_eq!(a.recv().await.unwrap(), Value::from("draft"));
        assert_eq!(b.recv().await.unwrap(), Value::from("draft"));
    }

    #[tokio::test]
    async fn test_publish_failures() {
        let registry = BroadcastRegistry::new(16);
        assert!(matches!(
            registry.publish("nobody", Value::Empty),
            Err(SchedulerError::GroupNotFound { .. })
        ));

        registry.create("empty", Duration::from_secs(60));
        assert!(matches!(
            registry.publish("empty", Value::Empty),
            Err(SchedulerError::NoSubscribers { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_groups_expire() {
        let registry = BroadcastRegistry::new(16);
        registry.create("short", Duration::from_secs(10));
        let mut sub = registry.subscribe("short").unwrap();

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(registry.get("short").is_some());

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(registry.get("short").is_none());
        assert!(matches!(
            registry.subscribe("short"),
            Err(SchedulerError::GroupNotFound { .. })
        ));
        assert!(matches!(sub.recv().await, Err(SchedulerError::GroupClosed { .. })));
    }

    #[tokio::test]
    async fn test_lagging_subscriber() {
        let registry = BroadcastRegistry::new(1);
        registry.create("tiny", Duration::from_secs(60));
        let mut sub = registry.subscribe("tiny").unwrap();

        registry.publish("tiny", Value::Int(1)).unwrap();
        registry.publish("tiny", Value::Int(2)).unwrap();

        assert!(matches!(sub.recv().await, Err(SchedulerError::Lagged { skipped: 1, .. })));
        assert_eq!(sub.recv().await.unwrap(), Value::Int(2));
    }
}
