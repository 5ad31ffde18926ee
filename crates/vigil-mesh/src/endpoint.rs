//! Cluster endpoints: local and remote members of the mesh.
//!
//! An endpoint wraps its reflective object (identity plus the replicated
//! subscription set) and adds connection handling. Local endpoints hand
//! matching requests to registered topic handlers through the dispatch
//! queue; remote endpoints forward them over the bound client connection.
//! Delivery is best effort: a request for a disconnected endpoint is
//! dropped, and connection close clears the endpoint's subscriptions.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use vigil_store::ReflectiveObject;
use vigil_types::{Message, Request, Response, RoutingKind, VigilError, VigilResult};

use crate::connection::{Connection, ConnectionEvent};
use crate::dispatch::Dispatcher;
use crate::events::{EventHub, MeshEvent};
use crate::router::RouterHandle;

/// Object type name for endpoints.
pub const ENDPOINT_TYPE: &str = "Endpoint";

/// Attribute holding the replicated subscription set.
pub(crate) const SUBSCRIPTIONS_ATTR: &str = "subscriptions";

/// Callback invoked for requests on a subscribed topic, with
/// (receiver, sender, request).
pub type TopicHandler = Arc<dyn Fn(&Arc<Endpoint>, &Arc<Endpoint>, &Request) + Send + Sync>;

/// A bound client connection on a remote endpoint.
struct ClientBinding {
    connection: Arc<dyn Connection>,
    pump: JoinHandle<()>,
    generation: u64,
    bound_at: DateTime<Utc>,
}

/// Connection handling half of an endpoint. Subscription and topic logic
/// is shared; only this differs between local and remote.
enum EndpointKind {
    /// This process's own identity. Permanently logically connected.
    Local,
    /// A peer. Connected only while a client connection is bound.
    Remote {
        client: RwLock<Option<ClientBinding>>,
        generation: AtomicU64,
    },
}

/// One member of the cluster, local or remote.
pub struct Endpoint {
    this: Weak<Endpoint>,
    object: Arc<ReflectiveObject>,
    kind: EndpointKind,
    handlers: DashMap<String, Vec<TopicHandler>>,
    events: EventHub,
    dispatcher: Dispatcher,
    router: RouterHandle,
}

impl Endpoint {
    pub(crate) fn new(
        object: Arc<ReflectiveObject>,
        local: bool,
        events: EventHub,
        dispatcher: Dispatcher,
        router: RouterHandle,
    ) -> Arc<Self> {
        let kind = if local {
            EndpointKind::Local
        } else {
            EndpointKind::Remote {
                client: RwLock::new(None),
                generation: AtomicU64::new(0),
            }
        };
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            object,
            kind,
            handlers: DashMap::new(),
            events,
            dispatcher,
            router,
        })
    }

    /// Endpoint name, unique in the cluster.
    pub fn name(&self) -> &str {
        self.object.name()
    }

    /// The backing reflective object.
    pub fn object(&self) -> &Arc<ReflectiveObject> {
        &self.object
    }

    /// True iff this is the process's own identity.
    pub fn is_local(&self) -> bool {
        matches!(self.kind, EndpointKind::Local)
    }

    /// Local endpoints are always connected. A remote endpoint is connected
    /// iff a client is bound and the transport agrees.
    pub fn is_connected(&self) -> bool {
        match &self.kind {
            EndpointKind::Local => true,
            EndpointKind::Remote { client, .. } => {
                let client = client.read().unwrap_or_else(|e| e.into_inner());
                client.as_ref().is_some_and(|b| b.connection.is_connected())
            }
        }
    }

    /// When the current client was bound, if one is.
    pub fn connected_since(&self) -> Option<DateTime<Utc>> {
        match &self.kind {
            EndpointKind::Local => None,
            EndpointKind::Remote { client, .. } => {
                let client = client.read().unwrap_or_else(|e| e.into_inner());
                client.as_ref().map(|b| b.bound_at)
            }
        }
    }

    /// Snapshot of the subscription set.
    pub fn subscriptions(&self) -> BTreeSet<String> {
        parse_subscriptions(self.object.get(SUBSCRIPTIONS_ATTR).as_ref())
    }

    /// Whether the endpoint is subscribed to a topic.
    pub fn has_subscription(&self, topic: &str) -> bool {
        self.subscriptions().contains(topic)
    }

    /// Add a topic to the subscription set.
    ///
    /// The stored set is replaced wholesale (copy-on-write), so the change
    /// hook always diffs a complete old/new pair. Re-registering an
    /// existing topic stores nothing and emits nothing.
    pub fn register_subscription(&self, topic: &str) {
        self.object.update(SUBSCRIPTIONS_ATTR, |old| {
            let mut set = parse_subscriptions(old);
            if !set.insert(topic.to_string()) {
                return None;
            }
            Some(subscriptions_value(&set))
        });
    }

    /// Remove a topic from the subscription set. Removing an absent topic
    /// stores nothing and emits nothing.
    pub fn unregister_subscription(&self, topic: &str) {
        self.object.update(SUBSCRIPTIONS_ATTR, |old| {
            let mut set = parse_subscriptions(old);
            if !set.remove(topic) {
                return None;
            }
            Some(subscriptions_value(&set))
        });
    }

    /// Drop every subscription.
    pub fn clear_subscriptions(&self) {
        self.object.update(SUBSCRIPTIONS_ATTR, |old| {
            if parse_subscriptions(old).is_empty() {
                return None;
            }
            Some(json!([]))
        });
    }

    /// Attach a callback for a topic and implicitly subscribe to it, so
    /// peers learn to route matching traffic here.
    pub fn register_topic_handler(&self, topic: &str, handler: TopicHandler) {
        self.handlers
            .entry(topic.to_string())
            .or_default()
            .push(handler);
        self.register_subscription(topic);
    }

    /// Detaching a handler is not supported in this baseline. The
    /// subscription created by `register_topic_handler` is replicated
    /// state; removing the callback alone would desynchronize the two, so
    /// the operation fails loudly instead of silently doing nothing.
    pub fn unregister_topic_handler(&self, _topic: &str) -> VigilResult<()> {
        Err(VigilError::NotImplemented("unregister_topic_handler"))
    }

    /// Bind a client connection, replacing any prior binding, and spawn
    /// the pump task that feeds inbound traffic into classification.
    /// Rejected on local endpoints.
    pub fn set_client(&self, connection: Arc<dyn Connection>) -> VigilResult<()> {
        let EndpointKind::Remote { client, generation } = &self.kind else {
            return Err(VigilError::LocalClientBinding(self.name().to_string()));
        };
        let endpoint = match self.this.upgrade() {
            Some(endpoint) => endpoint,
            None => {
                return Err(VigilError::Transport(
                    "endpoint is being torn down".to_string(),
                ))
            }
        };

        let bound_generation = generation.fetch_add(1, Ordering::SeqCst) + 1;
        let pump = tokio::spawn(pump_loop(
            endpoint,
            connection.subscribe(),
            bound_generation,
        ));
        let binding = ClientBinding {
            connection,
            pump,
            generation: bound_generation,
            bound_at: Utc::now(),
        };

        let replaced = {
            let mut client = client.write().unwrap_or_else(|e| e.into_inner());
            client.replace(binding)
        };
        if let Some(old) = replaced {
            old.pump.abort();
        }

        info!(endpoint = %self.name(), "Client connected");
        self.events.emit(MeshEvent::Connected {
            endpoint: self.name().to_string(),
        });
        Ok(())
    }

    /// Deliver a request to this endpoint.
    ///
    /// Disconnected endpoints drop the request; there is no retry and no
    /// queue. Local endpoints post (receiver, sender, request) to the
    /// dispatch queue for every handler registered on the topic; an
    /// unknown method is a silent no-op. Remote endpoints forward the
    /// request over the client connection, and a send racing a close is
    /// dropped.
    pub async fn process_request(&self, sender: &Arc<Endpoint>, request: Request) {
        if !self.is_connected() {
            debug!(
                endpoint = %self.name(),
                topic = %request.method,
                "Dropping request for disconnected endpoint"
            );
            return;
        }
        match &self.kind {
            EndpointKind::Local => {
                let handlers: Vec<TopicHandler> = match self.handlers.get(&request.method) {
                    Some(entry) => entry.value().clone(),
                    None => {
                        debug!(
                            endpoint = %self.name(),
                            topic = %request.method,
                            "No handler for topic"
                        );
                        return;
                    }
                };
                let Some(receiver) = self.this.upgrade() else {
                    return;
                };
                self.dispatcher
                    .post(receiver, sender.clone(), request, handlers);
            }
            EndpointKind::Remote { client, .. } => {
                let connection = {
                    let client = client.read().unwrap_or_else(|e| e.into_inner());
                    client.as_ref().map(|b| b.connection.clone())
                };
                let Some(connection) = connection else {
                    debug!(endpoint = %self.name(), "Client detached before send");
                    return;
                };
                if let Err(e) = connection.send_message(&Message::Request(request)).await {
                    debug!(
                        endpoint = %self.name(),
                        error = %e,
                        "Request lost on closing connection"
                    );
                }
            }
        }
    }

    /// Deliver a response to this endpoint. Local endpoints hand it to the
    /// router's response correlation, never to topic handlers; remote
    /// endpoints forward it to the peer.
    pub async fn process_response(&self, sender: &Arc<Endpoint>, response: Response) {
        if !self.is_connected() {
            debug!(
                endpoint = %self.name(),
                id = %response.id,
                "Dropping response for disconnected endpoint"
            );
            return;
        }
        match &self.kind {
            EndpointKind::Local => {
                if let Some(router) = self.router.upgrade() {
                    router.process_response_message(sender, response);
                }
            }
            EndpointKind::Remote { client, .. } => {
                let connection = {
                    let client = client.read().unwrap_or_else(|e| e.into_inner());
                    client.as_ref().map(|b| b.connection.clone())
                };
                let Some(connection) = connection else {
                    return;
                };
                if let Err(e) = connection.send_message(&Message::Response(response)).await {
                    debug!(
                        endpoint = %self.name(),
                        error = %e,
                        "Response lost on closing connection"
                    );
                }
            }
        }
    }

    /// Classification entry for raw inbound traffic from this endpoint's
    /// connection. Responses go to correlation; requests route anycast
    /// (id present) or multicast (id absent). A malformed value is logged
    /// and affects only that message.
    pub async fn inbound_message(&self, raw: Value) {
        let message = match Message::from_value(raw) {
            Ok(message) => message,
            Err(e) => {
                warn!(endpoint = %self.name(), error = %e, "Rejecting malformed message");
                return;
            }
        };
        let Some(sender) = self.this.upgrade() else {
            return;
        };
        let Some(router) = self.router.upgrade() else {
            debug!(endpoint = %self.name(), "Router gone, dropping inbound message");
            return;
        };
        match message {
            Message::Response(response) => router.process_response_message(&sender, response),
            Message::Request(request) => match request.routing_kind() {
                RoutingKind::Anycast => {
                    router.send_anycast_message(&sender, request).await;
                }
                RoutingKind::Multicast => {
                    router.send_multicast_message(&sender, request).await;
                }
            },
        }
    }

    /// Tear down after transport close: clear all subscriptions (lossy by
    /// contract, durable ones included), detach the client, emit
    /// Disconnected. Stale notifications from a replaced binding are
    /// ignored.
    fn client_closed(&self, generation: u64) {
        let EndpointKind::Remote { client, .. } = &self.kind else {
            return;
        };
        let detached = {
            let mut client = client.write().unwrap_or_else(|e| e.into_inner());
            match client.as_ref() {
                Some(binding) if binding.generation == generation => client.take(),
                _ => None,
            }
        };
        if detached.is_none() {
            return;
        }

        warn!(endpoint = %self.name(), "Lost connection to endpoint");
        self.clear_subscriptions();
        self.events.emit(MeshEvent::Disconnected {
            endpoint: self.name().to_string(),
        });
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("name", &self.name())
            .field("local", &self.is_local())
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

/// Per-connection task driving inbound events into the endpoint.
async fn pump_loop(
    endpoint: Arc<Endpoint>,
    mut events: broadcast::Receiver<ConnectionEvent>,
    generation: u64,
) {
    loop {
        match events.recv().await {
            Ok(ConnectionEvent::Inbound(raw)) => endpoint.inbound_message(raw).await,
            Ok(ConnectionEvent::Closed) => {
                endpoint.client_closed(generation);
                break;
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(endpoint = %endpoint.name(), missed, "Connection events lagged");
            }
            Err(broadcast::error::RecvError::Closed) => {
                endpoint.client_closed(generation);
                break;
            }
        }
    }
}

pub(crate) fn parse_subscriptions(value: Option<&Value>) -> BTreeSet<String> {
    value
        .and_then(Value::as_array)
        .map(|topics| {
            topics
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn subscriptions_value(set: &BTreeSet<String>) -> Value {
    Value::Array(set.iter().cloned().map(Value::String).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MeshConfig;
    use crate::connection::PipeConnection;
    use crate::mesh::Mesh;
    use std::time::Duration;

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    fn drain(rx: &mut broadcast::Receiver<MeshEvent>) -> Vec<MeshEvent> {
        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            seen.push(event);
        }
        seen
    }

    #[tokio::test]
    async fn test_local_endpoint_always_connected() {
        let mesh = Mesh::bootstrap(MeshConfig::default()).unwrap();
        let local = mesh.local_endpoint();

        assert!(local.is_local());
        assert!(local.is_connected());
        assert!(local.connected_since().is_none());
    }

    #[tokio::test]
    async fn test_set_client_on_local_rejected() {
        let mesh = Mesh::bootstrap(MeshConfig::default()).unwrap();
        let (a, _b) = PipeConnection::pair();

        let err = mesh.local_endpoint().set_client(a).unwrap_err();
        assert!(matches!(err, VigilError::LocalClientBinding(_)));
        assert!(mesh.local_endpoint().is_connected());
    }

    #[tokio::test]
    async fn test_subscription_register_and_unregister() {
        let mesh = Mesh::bootstrap(MeshConfig::default()).unwrap();
        let sat = mesh
            .router()
            .create_remote_endpoint("sat1", "10.0.0.1", "7978")
            .unwrap();

        sat.register_subscription("checker.execute");
        assert!(sat.has_subscription("checker.execute"));

        sat.unregister_subscription("checker.execute");
        assert!(!sat.has_subscription("checker.execute"));
        assert!(sat.subscriptions().is_empty());
    }

    #[tokio::test]
    async fn test_subscription_diff_emits_exact_events() {
        let mesh = Mesh::bootstrap(MeshConfig::default()).unwrap();
        let sat = mesh
            .router()
            .create_remote_endpoint("sat1", "10.0.0.1", "7978")
            .unwrap();
        sat.register_subscription("topic.a");
        sat.register_subscription("topic.b");

        // Move the set from {a, b} to {b, c} in one transition.
        let mut rx = mesh.events().subscribe();
        sat.object()
            .set(SUBSCRIPTIONS_ATTR, json!(["topic.b", "topic.c"]));

        let seen = drain(&mut rx);
        assert_eq!(
            seen,
            vec![
                MeshEvent::SubscriptionUnregistered {
                    endpoint: "sat1".to_string(),
                    topic: "topic.a".to_string(),
                },
                MeshEvent::SubscriptionRegistered {
                    endpoint: "sat1".to_string(),
                    topic: "topic.c".to_string(),
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_reregistering_existing_topic_emits_nothing() {
        let mesh = Mesh::bootstrap(MeshConfig::default()).unwrap();
        let sat = mesh
            .router()
            .create_remote_endpoint("sat1", "10.0.0.1", "7978")
            .unwrap();
        sat.register_subscription("topic.a");

        let mut rx = mesh.events().subscribe();
        sat.register_subscription("topic.a");
        assert!(drain(&mut rx).is_empty());

        sat.unregister_subscription("topic.never-had");
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_register_topic_handler_subscribes() {
        let mesh = Mesh::bootstrap(MeshConfig::default()).unwrap();
        let local = mesh.local_endpoint();

        local.register_topic_handler("checker.execute", Arc::new(|_, _, _| {}));
        assert!(local.has_subscription("checker.execute"));
    }

    #[tokio::test]
    async fn test_unregister_topic_handler_not_implemented() {
        let mesh = Mesh::bootstrap(MeshConfig::default()).unwrap();
        let local = mesh.local_endpoint();
        local.register_topic_handler("checker.execute", Arc::new(|_, _, _| {}));

        let err = local
            .unregister_topic_handler("checker.execute")
            .unwrap_err();
        assert!(matches!(err, VigilError::NotImplemented(_)));
        // The subscription stays; nothing was silently removed.
        assert!(local.has_subscription("checker.execute"));
    }

    #[tokio::test]
    async fn test_client_close_clears_subscriptions() {
        let mesh = Mesh::bootstrap(MeshConfig::default()).unwrap();
        let sat = mesh
            .router()
            .create_remote_endpoint("sat1", "10.0.0.1", "7978")
            .unwrap();
        let (a, b) = PipeConnection::pair();

        sat.set_client(a).unwrap();
        assert!(sat.is_connected());
        assert!(sat.connected_since().is_some());
        sat.register_subscription("checker.execute");

        let mut rx = mesh.events().subscribe();
        b.close();

        wait_until(|| sat.subscriptions().is_empty()).await;
        assert!(!sat.is_connected());
        assert!(sat.connected_since().is_none());

        let seen = drain(&mut rx);
        assert!(seen.contains(&MeshEvent::SubscriptionUnregistered {
            endpoint: "sat1".to_string(),
            topic: "checker.execute".to_string(),
        }));
        assert!(seen.contains(&MeshEvent::Disconnected {
            endpoint: "sat1".to_string(),
        }));
    }

    #[tokio::test]
    async fn test_rebinding_replaces_old_client_without_teardown() {
        let mesh = Mesh::bootstrap(MeshConfig::default()).unwrap();
        let sat = mesh
            .router()
            .create_remote_endpoint("sat1", "10.0.0.1", "7978")
            .unwrap();
        sat.register_subscription("checker.execute");

        let (a1, b1) = PipeConnection::pair();
        let (a2, _b2) = PipeConnection::pair();
        sat.set_client(a1).unwrap();
        sat.set_client(a2).unwrap();

        let mut rx = mesh.events().subscribe();
        b1.close();

        // The close of the replaced binding must not tear down the
        // current one.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(sat.is_connected());
        assert!(sat.has_subscription("checker.execute"));
        assert!(!drain(&mut rx).contains(&MeshEvent::Disconnected {
            endpoint: "sat1".to_string(),
        }));
    }

    #[tokio::test]
    async fn test_request_to_unbound_remote_is_dropped() {
        let mesh = Mesh::bootstrap(MeshConfig::default()).unwrap();
        let sat = mesh
            .router()
            .create_remote_endpoint("sat1", "10.0.0.1", "7978")
            .unwrap();
        assert!(!sat.is_connected());

        let sender = mesh.local_endpoint().clone();
        sat.process_request(&sender, Request::new("notify.send"))
            .await;
    }
}
