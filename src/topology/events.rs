//! Topology events
//!
//! `TopologyEvent` is the inbound feed that mutates cluster rings.
//! `ShardEvent` is what the registry publishes to its subscribers once a
//! mutation has been applied.

use crate::topology::node::{ShardInfo, StoreResource};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Inbound topology change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TopologyEvent {
    Create {
        data_center: String,
        store: StoreResource,
        info: ShardInfo,
    },
    Update {
        data_center: String,
        store: StoreResource,
        info: ShardInfo,
    },
    Remove {
        data_center: String,
        store: StoreResource,
        info: ShardInfo,
    },
    Resize {
        keyspace: String,
        data_center: String,
        to_cluster_size: u32,
        replication_factor: u32,
    },
    Promote {
        data_center: String,
        info: ShardInfo,
    },
}

impl TopologyEvent {
    pub fn keyspace(&self) -> &str {
        match self {
            TopologyEvent::Create { info, .. }
            | TopologyEvent::Update { info, .. }
            | TopologyEvent::Remove { info, .. }
            | TopologyEvent::Promote { info, .. } => &info.keyspace,
            TopologyEvent::Resize { keyspace, .. } => keyspace,
        }
    }
}

/// Applied change, as seen by subscribers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShardEvent {
    Created {
        store: StoreResource,
        info: ShardInfo,
    },
    Updated {
        store: StoreResource,
        info: ShardInfo,
        old: ShardInfo,
    },
    Removed {
        store: StoreResource,
        info: ShardInfo,
        /// The store hosts nothing else in this keyspace
        store_removed: bool,
    },
    Promoted {
        info: ShardInfo,
    },
    Resized {
        keyspace: String,
        to_cluster_size: u32,
        replication_factor: u32,
    },
}

/// Explicit list of subscriber channels
#[derive(Debug, Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<ShardEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ShardEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Deliver to every live subscriber, dropping the ones that hung up
    pub fn publish(&self, event: ShardEvent) {
        self.subscribers
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_reaches_all_and_prunes_closed() {
        let bus = EventBus::new();
        let mut a = bus.subscribe();
        let b = bus.subscribe();
        drop(b);

        let event = ShardEvent::Promoted {
            info: ShardInfo::new("users", 1, 1, 3, 2),
        };
        bus.publish(event.clone());
        assert_eq!(bus.subscriber_count(), 1);
        assert_eq!(a.try_recv().unwrap(), event);
    }

    #[test]
    fn test_topology_event_json() {
        let event = TopologyEvent::Resize {
            keyspace: "users".into(),
            data_center: "dc1".into(),
            to_cluster_size: 4,
            replication_factor: 2,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"resize\""));
        let back: TopologyEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.keyspace(), "users");
    }
}
