//! Reflective object store for the Vigil cluster layer.
//!
//! Cluster state lives in reflective objects: an identity (type, name) plus
//! a dynamically-typed attribute map with synchronous change notification.
//! Each object type registers an attribute classification table (what is
//! replicated, what stays process-local) and an optional change hook that
//! runs inside the mutating object's critical section.

pub mod object;
pub mod schema;
pub mod store;

pub use object::{AttributeChange, ObjectIdentity, ReflectiveObject};
pub use schema::{ChangeHook, TypeDefinition, TypeRegistry};
pub use store::ObjectStore;
