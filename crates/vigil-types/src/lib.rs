//! Core types for the Vigil cluster communication layer.
//!
//! This crate defines the shared data structures used across the Vigil
//! object store and mesh crates: message shapes, attribute replication
//! classification, and the common error type. It contains no business logic.

pub mod error;
pub mod message;
pub mod replication;

pub use error::{VigilError, VigilResult};
pub use message::{Message, Request, Response, RoutingKind};
pub use replication::{AttributeDescriptor, ReplicationClass};
