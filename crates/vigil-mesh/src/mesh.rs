//! Process context for one Vigil mesh participant.
//!
//! [`Mesh::bootstrap`] is the single composition root: it builds the
//! object store, event hub, dispatch worker, and router, registers the
//! Endpoint object type, and creates this process's own endpoint.
//! Everything else receives cheap-clone handles from here; there is no
//! ambient global state.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, info};
use vigil_store::{AttributeChange, ObjectStore, TypeDefinition};
use vigil_types::{AttributeDescriptor, VigilError, VigilResult};

use crate::config::MeshConfig;
use crate::dispatch::Dispatcher;
use crate::endpoint::{parse_subscriptions, Endpoint, ENDPOINT_TYPE, SUBSCRIPTIONS_ATTR};
use crate::events::{EventHub, MeshEvent};
use crate::router::Router;

/// Shared handles for one mesh participant.
pub struct Mesh {
    config: MeshConfig,
    store: ObjectStore,
    events: EventHub,
    dispatcher: Dispatcher,
    router: Router,
    local: Arc<Endpoint>,
}

impl Mesh {
    /// Build the process context. Must be called inside a tokio runtime;
    /// the dispatch worker is spawned here.
    pub fn bootstrap(config: MeshConfig) -> VigilResult<Mesh> {
        if config.event_capacity == 0 {
            return Err(VigilError::Configuration(
                "event_capacity must be at least 1".to_string(),
            ));
        }

        let store = ObjectStore::new();
        let events = EventHub::new(config.event_capacity);
        let dispatcher = Dispatcher::new();
        register_endpoint_type(&store, &events)?;

        let router = Router::new(store.clone(), events.clone(), dispatcher.clone());
        let local =
            router.create_local_endpoint(&config.endpoint_name, &config.node, &config.service)?;
        info!(endpoint = %local.name(), "Mesh bootstrapped");

        Ok(Mesh {
            config,
            store,
            events,
            dispatcher,
            router,
            local,
        })
    }

    /// The configuration this mesh was built from.
    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    /// The object store, for registering further types and objects.
    pub fn store(&self) -> &ObjectStore {
        &self.store
    }

    /// The cluster event hub.
    pub fn events(&self) -> &EventHub {
        &self.events
    }

    /// The local dispatch queue.
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// The endpoint router.
    pub fn router(&self) -> &Router {
        &self.router
    }

    /// This process's own endpoint.
    pub fn local_endpoint(&self) -> &Arc<Endpoint> {
        &self.local
    }
}

impl fmt::Debug for Mesh {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mesh")
            .field("config", &self.config)
            .field("local", &self.local)
            .finish_non_exhaustive()
    }
}

/// Register the Endpoint object type: its classification table and the
/// change hook that turns subscription transitions into per-topic events.
fn register_endpoint_type(store: &ObjectStore, events: &EventHub) -> VigilResult<()> {
    let hub = events.clone();
    store.register_type(
        TypeDefinition::new(
            ENDPOINT_TYPE,
            vec![
                AttributeDescriptor::replicated("node"),
                AttributeDescriptor::replicated("service"),
                AttributeDescriptor::replicated(SUBSCRIPTIONS_ATTR),
                AttributeDescriptor::transient("client"),
                AttributeDescriptor::transient("local"),
            ],
        )
        .with_change_hook(Arc::new(move |identity, change| {
            if change.attribute == SUBSCRIPTIONS_ATTR {
                emit_subscription_diff(&hub, &identity.name, change);
            }
        })),
    )
}

/// Emit events for exactly the topics that changed between the old and new
/// subscription sets. Removed topics are reported before added ones.
fn emit_subscription_diff(events: &EventHub, endpoint: &str, change: &AttributeChange) {
    let old = parse_subscriptions(change.old.as_ref());
    let new = parse_subscriptions(Some(&change.new));

    for topic in old.difference(&new) {
        info!(endpoint = %endpoint, topic = %topic, "Removed subscription");
        events.emit(MeshEvent::SubscriptionUnregistered {
            endpoint: endpoint.to_string(),
            topic: topic.clone(),
        });
    }
    for topic in new.difference(&old) {
        debug!(endpoint = %endpoint, topic = %topic, "New subscription");
        events.emit(MeshEvent::SubscriptionRegistered {
            endpoint: endpoint.to_string(),
            topic: topic.clone(),
        });
    }
}
