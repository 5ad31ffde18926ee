//! Per-type attribute schemas and the classification registry.
//!
//! A type is registered once, at startup, with its full attribute
//! classification table. The table is immutable afterwards; lookups for
//! unknown types or attributes fall back to
//! [`ReplicationClass::Transient`] so nothing unexpected ever crosses the
//! wire.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::debug;
use vigil_types::{AttributeDescriptor, ReplicationClass, VigilError, VigilResult};

use crate::object::{AttributeChange, ObjectIdentity};

/// Change hook for a type, invoked synchronously inside the mutating
/// object's critical section. The hook receives the object identity and
/// the full old/new transition, and must not touch the object's attributes.
pub type ChangeHook = Arc<dyn Fn(&ObjectIdentity, &AttributeChange) + Send + Sync>;

/// Definition of a cluster object type.
pub struct TypeDefinition {
    /// Type name, unique across the registry.
    pub name: String,
    /// Attribute classification table.
    pub attributes: Vec<AttributeDescriptor>,
    /// Hook invoked on every attribute change of objects of this type.
    pub on_change: Option<ChangeHook>,
}

impl TypeDefinition {
    /// Define a type with its attribute table and no change hook.
    pub fn new(name: impl Into<String>, attributes: Vec<AttributeDescriptor>) -> Self {
        Self {
            name: name.into(),
            attributes,
            on_change: None,
        }
    }

    /// Attach a change hook.
    pub fn with_change_hook(mut self, hook: ChangeHook) -> Self {
        self.on_change = Some(hook);
        self
    }
}

/// Resolved registration record shared by every object of the type.
pub(crate) struct RegisteredType {
    pub(crate) classes: HashMap<String, ReplicationClass>,
    pub(crate) on_change: Option<ChangeHook>,
}

/// Thread-safe registry of object types and their classification tables.
#[derive(Clone)]
pub struct TypeRegistry {
    types: Arc<RwLock<HashMap<String, Arc<RegisteredType>>>>,
}

impl TypeRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            types: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register a type. Registering the same type twice, or a table that
    /// names the same attribute twice, is a configuration error.
    pub fn register_type(&self, definition: TypeDefinition) -> VigilResult<()> {
        let mut classes = HashMap::with_capacity(definition.attributes.len());
        for descriptor in &definition.attributes {
            if classes
                .insert(descriptor.name.clone(), descriptor.class)
                .is_some()
            {
                return Err(VigilError::Configuration(format!(
                    "type '{}' declares attribute '{}' twice",
                    definition.name, descriptor.name
                )));
            }
        }

        let mut types = self.types.write().unwrap_or_else(|e| e.into_inner());
        if types.contains_key(&definition.name) {
            return Err(VigilError::Configuration(format!(
                "type '{}' is already registered",
                definition.name
            )));
        }
        debug!(
            type_name = %definition.name,
            attributes = classes.len(),
            "Registered object type"
        );
        types.insert(
            definition.name,
            Arc::new(RegisteredType {
                classes,
                on_change: definition.on_change,
            }),
        );
        Ok(())
    }

    /// Resolve the replication class of an attribute. Unknown types and
    /// unclassified attributes are Transient.
    pub fn replication_class(&self, type_name: &str, attribute: &str) -> ReplicationClass {
        let types = self.types.read().unwrap_or_else(|e| e.into_inner());
        types
            .get(type_name)
            .and_then(|t| t.classes.get(attribute).copied())
            .unwrap_or(ReplicationClass::Transient)
    }

    /// Whether a type has been registered.
    pub fn is_registered(&self, type_name: &str) -> bool {
        let types = self.types.read().unwrap_or_else(|e| e.into_inner());
        types.contains_key(type_name)
    }

    pub(crate) fn lookup(&self, type_name: &str) -> Option<Arc<RegisteredType>> {
        let types = self.types.read().unwrap_or_else(|e| e.into_inner());
        types.get(type_name).cloned()
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}
