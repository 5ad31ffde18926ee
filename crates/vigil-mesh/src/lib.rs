//! Vigil mesh — cluster endpoint routing and messaging.
//!
//! Each process participates in the cluster as a named endpoint,
//! exchanging topic-addressed requests and correlated responses. A
//! transport delivers raw messages to an endpoint; the endpoint classifies
//! them and hands them to the router, which dispatches locally through the
//! FIFO dispatch queue or forwards over the peer's bound connection.
//!
//! ## Architecture
//!
//! - **Mesh**: Process context built once by `bootstrap`
//! - **Endpoint**: One cluster member, local or remote, with its
//!   replicated subscription set
//! - **Router**: Endpoint registry, anycast/multicast delivery, response
//!   correlation
//! - **Connection**: Trait seam for transports; `PipeConnection` is the
//!   in-process implementation
//! - **Dispatcher**: FIFO worker for local topic handlers

pub mod config;
pub mod connection;
pub mod dispatch;
pub mod endpoint;
pub mod events;
pub mod mesh;
pub mod router;

pub use config::{load_config, MeshConfig};
pub use connection::{Connection, ConnectionEvent, PipeConnection};
pub use dispatch::Dispatcher;
pub use endpoint::{Endpoint, TopicHandler, ENDPOINT_TYPE};
pub use events::{EventHub, MeshEvent};
pub use mesh::Mesh;
pub use router::{
    AddressResolver, AuthorityHook, PendingCall, RouteOutcome, Router, SubscriberResolver,
};
