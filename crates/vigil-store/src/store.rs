//! The object store: a type registry plus the (type, name) object registry.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde_json::Value;
use tracing::debug;
use vigil_types::{ReplicationClass, VigilError, VigilResult};

use crate::object::{ObjectIdentity, ReflectiveObject};
use crate::schema::{TypeDefinition, TypeRegistry};

/// Cheap-clone handle bundling the type registry and the object registry.
///
/// Objects are shared (`Arc`); an object's registered lifetime ends on
/// explicit removal, but handles held elsewhere keep working afterwards.
#[derive(Clone)]
pub struct ObjectStore {
    types: TypeRegistry,
    objects: Arc<RwLock<HashMap<ObjectIdentity, Arc<ReflectiveObject>>>>,
}

impl ObjectStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            types: TypeRegistry::new(),
            objects: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// The type registry backing this store.
    pub fn types(&self) -> &TypeRegistry {
        &self.types
    }

    /// Register an object type. See [`TypeRegistry::register_type`].
    pub fn register_type(&self, definition: TypeDefinition) -> VigilResult<()> {
        self.types.register_type(definition)
    }

    /// Resolve the replication class of an attribute.
    pub fn replication_class(&self, type_name: &str, attribute: &str) -> ReplicationClass {
        self.types.replication_class(type_name, attribute)
    }

    /// Create and register an object of an already-registered type.
    ///
    /// Initial attributes are stored as-is; the change hook fires only for
    /// subsequent mutations.
    pub fn create_object(
        &self,
        type_name: &str,
        name: &str,
        initial: HashMap<String, Value>,
    ) -> VigilResult<Arc<ReflectiveObject>> {
        let Some(registration) = self.types.lookup(type_name) else {
            return Err(VigilError::Configuration(format!(
                "cannot create object of unregistered type '{type_name}'"
            )));
        };

        let identity = ObjectIdentity::new(type_name, name);
        let object = Arc::new(ReflectiveObject::new(
            identity.clone(),
            initial,
            registration,
        ));
        let mut objects = self.objects.write().unwrap_or_else(|e| e.into_inner());
        objects.insert(identity, object.clone());
        debug!(object = %object.identity(), "Registered object");
        Ok(object)
    }

    /// Look up a registered object.
    pub fn get_object(&self, type_name: &str, name: &str) -> Option<Arc<ReflectiveObject>> {
        let objects = self.objects.read().unwrap_or_else(|e| e.into_inner());
        objects
            .get(&ObjectIdentity::new(type_name, name))
            .cloned()
    }

    /// Unregister an object, returning the detached handle if it existed.
    pub fn remove_object(&self, type_name: &str, name: &str) -> Option<Arc<ReflectiveObject>> {
        let mut objects = self.objects.write().unwrap_or_else(|e| e.into_inner());
        let removed = objects.remove(&ObjectIdentity::new(type_name, name));
        if let Some(object) = &removed {
            debug!(object = %object.identity(), "Unregistered object");
        }
        removed
    }

    /// Snapshot of all registered objects of a type.
    pub fn objects_of_type(&self, type_name: &str) -> Vec<Arc<ReflectiveObject>> {
        let objects = self.objects.read().unwrap_or_else(|e| e.into_inner());
        objects
            .values()
            .filter(|o| o.type_name() == type_name)
            .cloned()
            .collect()
    }

    /// Total number of registered objects.
    pub fn object_count(&self) -> usize {
        let objects = self.objects.read().unwrap_or_else(|e| e.into_inner());
        objects.len()
    }
}

impl Default for ObjectStore {
    fn default() -> Self {
        Self::new()
    }
}
