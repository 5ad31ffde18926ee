//! The endpoint router: registry, anycast/multicast delivery, response
//! correlation.
//!
//! The router owns the name-keyed endpoint registry and the pending-call
//! table. Delivery works on snapshots: the registry lock is held only for
//! lookup and iteration, never across an await. Routing misses are
//! informational outcomes, not errors.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, Weak};

use dashmap::DashMap;
use serde_json::json;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;
use vigil_store::ObjectStore;
use vigil_types::{Request, Response, VigilError, VigilResult};

use crate::dispatch::Dispatcher;
use crate::endpoint::{Endpoint, ENDPOINT_TYPE};
use crate::events::EventHub;

/// Outcome of an anycast send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// The request was handed to exactly one endpoint.
    Delivered,
    /// No destination was resolved; the request was dropped.
    NoRoute,
}

/// Picks the single destination for an anycast request.
///
/// Addressing is a collaborator concern; the router only requires that at
/// most one endpoint is chosen from the snapshot it passes in.
pub trait AddressResolver: Send + Sync {
    /// Choose one endpoint for the request, or none.
    fn resolve(&self, endpoints: &[Arc<Endpoint>], request: &Request) -> Option<Arc<Endpoint>>;
}

/// Default resolver: the first connected subscriber in endpoint-name
/// order, so repeated resolution over a stable topology is deterministic.
pub struct SubscriberResolver;

impl AddressResolver for SubscriberResolver {
    fn resolve(&self, endpoints: &[Arc<Endpoint>], request: &Request) -> Option<Arc<Endpoint>> {
        let mut candidates: Vec<Arc<Endpoint>> = endpoints
            .iter()
            .filter(|e| e.is_connected() && e.has_subscription(&request.method))
            .cloned()
            .collect();
        candidates.sort_by(|a, b| a.name().cmp(b.name()));
        candidates.into_iter().next()
    }
}

/// Callback run after every endpoint registration change, so an embedder
/// can recompute object authority over the new topology.
pub type AuthorityHook = Arc<dyn Fn(&Router) + Send + Sync>;

pub(crate) struct RouterInner {
    store: ObjectStore,
    events: EventHub,
    dispatcher: Dispatcher,
    endpoints: RwLock<HashMap<String, Arc<Endpoint>>>,
    pending: DashMap<String, oneshot::Sender<Response>>,
    resolver: Box<dyn AddressResolver>,
    authority_hook: RwLock<Option<AuthorityHook>>,
}

/// Cheap-clone handle to the endpoint router.
#[derive(Clone)]
pub struct Router {
    inner: Arc<RouterInner>,
}

/// Weak router reference held by endpoints, so dropping the router never
/// leaks the whole mesh through a reference cycle.
#[derive(Clone)]
pub(crate) struct RouterHandle {
    inner: Weak<RouterInner>,
}

impl RouterHandle {
    pub(crate) fn upgrade(&self) -> Option<Router> {
        self.inner.upgrade().map(|inner| Router { inner })
    }
}

impl Router {
    /// Create a router over a store, with the default anycast resolver.
    pub fn new(store: ObjectStore, events: EventHub, dispatcher: Dispatcher) -> Self {
        Self::with_resolver(store, events, dispatcher, Box::new(SubscriberResolver))
    }

    /// Create a router with a custom anycast resolver.
    pub fn with_resolver(
        store: ObjectStore,
        events: EventHub,
        dispatcher: Dispatcher,
        resolver: Box<dyn AddressResolver>,
    ) -> Self {
        Self {
            inner: Arc::new(RouterInner {
                store,
                events,
                dispatcher,
                endpoints: RwLock::new(HashMap::new()),
                pending: DashMap::new(),
                resolver,
                authority_hook: RwLock::new(None),
            }),
        }
    }

    pub(crate) fn handle(&self) -> RouterHandle {
        RouterHandle {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Create and register this process's own endpoint.
    pub fn create_local_endpoint(
        &self,
        name: &str,
        node: &str,
        service: &str,
    ) -> VigilResult<Arc<Endpoint>> {
        self.create_endpoint(name, node, service, true)
    }

    /// Create and register an endpoint for a peer.
    pub fn create_remote_endpoint(
        &self,
        name: &str,
        node: &str,
        service: &str,
    ) -> VigilResult<Arc<Endpoint>> {
        self.create_endpoint(name, node, service, false)
    }

    fn create_endpoint(
        &self,
        name: &str,
        node: &str,
        service: &str,
        local: bool,
    ) -> VigilResult<Arc<Endpoint>> {
        let mut initial = HashMap::new();
        initial.insert("node".to_string(), json!(node));
        initial.insert("service".to_string(), json!(service));
        initial.insert("local".to_string(), json!(local));

        let object = self.inner.store.create_object(ENDPOINT_TYPE, name, initial)?;
        let endpoint = Endpoint::new(
            object,
            local,
            self.inner.events.clone(),
            self.inner.dispatcher.clone(),
            self.handle(),
        );
        self.register_endpoint(endpoint.clone());
        Ok(endpoint)
    }

    /// Add an endpoint to the registry (replacing a same-named entry) and
    /// run the authority hook.
    pub fn register_endpoint(&self, endpoint: Arc<Endpoint>) {
        {
            let mut endpoints = self
                .inner
                .endpoints
                .write()
                .unwrap_or_else(|e| e.into_inner());
            endpoints.insert(endpoint.name().to_string(), endpoint.clone());
        }
        info!(
            endpoint = %endpoint.name(),
            local = endpoint.is_local(),
            "Endpoint registered"
        );
        self.run_authority_hook();
    }

    /// Remove an endpoint from the registry and the object store. Handles
    /// held elsewhere keep working, detached.
    pub fn unregister_endpoint(&self, name: &str) -> Option<Arc<Endpoint>> {
        let removed = {
            let mut endpoints = self
                .inner
                .endpoints
                .write()
                .unwrap_or_else(|e| e.into_inner());
            endpoints.remove(name)
        };
        if let Some(endpoint) = &removed {
            self.inner.store.remove_object(ENDPOINT_TYPE, endpoint.name());
            info!(endpoint = %endpoint.name(), "Endpoint unregistered");
            self.run_authority_hook();
        }
        removed
    }

    /// Install the callback run after every registration change.
    pub fn set_authority_hook(&self, hook: AuthorityHook) {
        let mut slot = self
            .inner
            .authority_hook
            .write()
            .unwrap_or_else(|e| e.into_inner());
        *slot = Some(hook);
    }

    fn run_authority_hook(&self) {
        let hook = {
            let hook = self
                .inner
                .authority_hook
                .read()
                .unwrap_or_else(|e| e.into_inner());
            hook.clone()
        };
        if let Some(hook) = hook {
            hook(self);
        }
    }

    /// Look up an endpoint by name.
    pub fn endpoint(&self, name: &str) -> Option<Arc<Endpoint>> {
        let endpoints = self
            .inner
            .endpoints
            .read()
            .unwrap_or_else(|e| e.into_inner());
        endpoints.get(name).cloned()
    }

    /// Like [`endpoint`](Self::endpoint), but an error when missing.
    pub fn endpoint_by_name(&self, name: &str) -> VigilResult<Arc<Endpoint>> {
        self.endpoint(name)
            .ok_or_else(|| VigilError::EndpointNotFound(name.to_string()))
    }

    /// Snapshot of all registered endpoints.
    pub fn endpoints(&self) -> Vec<Arc<Endpoint>> {
        let endpoints = self
            .inner
            .endpoints
            .read()
            .unwrap_or_else(|e| e.into_inner());
        endpoints.values().cloned().collect()
    }

    /// Number of registered endpoints.
    pub fn endpoint_count(&self) -> usize {
        let endpoints = self
            .inner
            .endpoints
            .read()
            .unwrap_or_else(|e| e.into_inner());
        endpoints.len()
    }

    /// Deliver an anycast request to exactly one resolved endpoint.
    ///
    /// Exactly one delivery attempt is made; there is no retry. A miss
    /// drops the request and is not an error.
    pub async fn send_anycast_message(
        &self,
        sender: &Arc<Endpoint>,
        request: Request,
    ) -> RouteOutcome {
        if request.id.is_none() {
            warn!(topic = %request.method, "Anycast request without correlation id");
        }
        let snapshot = self.endpoints();
        let Some(target) = self.inner.resolver.resolve(&snapshot, &request) else {
            debug!(topic = %request.method, "No route for anycast request");
            return RouteOutcome::NoRoute;
        };
        debug!(topic = %request.method, endpoint = %target.name(), "Anycast");
        target.process_request(sender, request).await;
        RouteOutcome::Delivered
    }

    /// Fan a multicast request out to every endpoint whose subscription
    /// set currently contains its topic. The sender is not excluded;
    /// exclusion, if desired, is the receiving handler's concern. Returns
    /// the number of endpoints the request was handed to.
    pub async fn send_multicast_message(
        &self,
        sender: &Arc<Endpoint>,
        request: Request,
    ) -> usize {
        let snapshot = self.endpoints();
        let mut delivered = 0;
        for endpoint in snapshot {
            if !endpoint.has_subscription(&request.method) {
                continue;
            }
            endpoint.process_request(sender, request.clone()).await;
            delivered += 1;
        }
        if delivered == 0 {
            debug!(topic = %request.method, "No subscribers for multicast");
        }
        delivered
    }

    /// Complete the pending call correlated to a response. A response with
    /// an unmatched id (unknown, late, or duplicate) is dropped.
    pub fn process_response_message(&self, sender: &Arc<Endpoint>, response: Response) {
        match self.inner.pending.remove(&response.id) {
            Some((id, tx)) => {
                debug!(sender = %sender.name(), id = %id, "Correlated response");
                let _ = tx.send(response);
            }
            None => {
                debug!(
                    sender = %sender.name(),
                    id = %response.id,
                    "Dropping response with unknown id"
                );
            }
        }
    }

    /// Anycast a request and hand back the pending call for its response.
    ///
    /// A correlation ID is assigned when absent, and the pending entry is
    /// registered before the send so a fast response cannot race it. On a
    /// routing miss the entry is dropped again, so the returned call
    /// resolves `None` instead of hanging.
    pub async fn call(&self, sender: &Arc<Endpoint>, mut request: Request) -> PendingCall {
        let id = match &request.id {
            Some(id) => id.clone(),
            None => {
                let id = Uuid::new_v4().to_string();
                request.id = Some(id.clone());
                id
            }
        };
        let (tx, rx) = oneshot::channel();
        self.inner.pending.insert(id.clone(), tx);

        if self.send_anycast_message(sender, request).await == RouteOutcome::NoRoute {
            self.inner.pending.remove(&id);
        }
        PendingCall {
            id,
            rx,
            router: Arc::downgrade(&self.inner),
        }
    }

    /// Outstanding calls awaiting responses.
    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }
}

/// A registered anycast call awaiting its response.
///
/// Dropping the call abandons it and evicts its correlation entry, so
/// calls that are delivered but never answered do not accumulate in the
/// pending table.
pub struct PendingCall {
    id: String,
    rx: oneshot::Receiver<Response>,
    router: Weak<RouterInner>,
}

impl PendingCall {
    /// The correlation ID carried by the request.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Await the correlated response. `None` means the call was lost (no
    /// route, or the entry was dropped); timeouts are the caller's
    /// concern.
    pub async fn response(mut self) -> Option<Response> {
        (&mut self.rx).await.ok()
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        let Some(inner) = self.router.upgrade() else {
            return;
        };
        // Evict only this call's entry: after `close` its sender reports
        // closed, while a replacement entry under a reused id does not.
        self.rx.close();
        inner.pending.remove_if(&self.id, |_, tx| tx.is_closed());
    }
}
