//! Cluster lifecycle events.
//!
//! Connection and subscription transitions are announced on a broadcast
//! channel so replication, logging, and embedder code can observe topology
//! changes without being wired into the endpoint internals. Emission is
//! synchronous and non-blocking; it is safe from inside the object store's
//! change hooks.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

/// A topology or subscription change in the mesh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MeshEvent {
    /// A client connection was bound to an endpoint.
    Connected {
        /// Endpoint name.
        endpoint: String,
    },
    /// An endpoint's connection closed and was torn down.
    Disconnected {
        /// Endpoint name.
        endpoint: String,
    },
    /// A topic was added to an endpoint's subscription set.
    SubscriptionRegistered {
        /// Endpoint name.
        endpoint: String,
        /// The topic that was added.
        topic: String,
    },
    /// A topic was removed from an endpoint's subscription set.
    SubscriptionUnregistered {
        /// Endpoint name.
        endpoint: String,
        /// The topic that was removed.
        topic: String,
    },
}

/// Cheap-clone handle to the cluster event channel.
#[derive(Debug, Clone)]
pub struct EventHub {
    sender: broadcast::Sender<MeshEvent>,
}

impl EventHub {
    /// Create a hub. `capacity` must be non-zero; slow receivers that fall
    /// more than `capacity` events behind observe a lag error.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event. Never blocks; events with no receivers are dropped.
    pub fn emit(&self, event: MeshEvent) {
        debug!(?event, "Mesh event");
        let _ = self.sender.send(event);
    }

    /// Subscribe to all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<MeshEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(1024)
    }
}
