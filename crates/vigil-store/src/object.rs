//! Reflective objects: dynamically-typed attribute maps with synchronous
//! change notification.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tracing::debug;

use crate::schema::RegisteredType;

/// Identity of a reflective object.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectIdentity {
    /// Registered type name.
    pub type_name: String,
    /// Object name, unique within the type.
    pub name: String,
}

impl ObjectIdentity {
    /// Create an identity from a type and object name.
    pub fn new(type_name: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.type_name, self.name)
    }
}

/// A single attribute transition, handed to the type's change hook.
#[derive(Debug, Clone)]
pub struct AttributeChange {
    /// Attribute that changed.
    pub attribute: String,
    /// Value before the change, if the attribute existed.
    pub old: Option<Value>,
    /// Value after the change.
    pub new: Value,
}

/// A cluster object: identity plus a dynamically-typed attribute map.
///
/// All mutation goes through [`set`](Self::set) or
/// [`update`](Self::update), which read the old value, store the new one,
/// and run the type's change hook under a single per-instance critical
/// section. Concurrent mutations of the same instance therefore never
/// interleave, and the hook always observes a consistent old/new pair.
pub struct ReflectiveObject {
    identity: ObjectIdentity,
    attributes: Mutex<HashMap<String, Value>>,
    registration: Arc<RegisteredType>,
}

impl ReflectiveObject {
    pub(crate) fn new(
        identity: ObjectIdentity,
        initial: HashMap<String, Value>,
        registration: Arc<RegisteredType>,
    ) -> Self {
        Self {
            identity,
            attributes: Mutex::new(initial),
            registration,
        }
    }

    /// The object's (type, name) identity.
    pub fn identity(&self) -> &ObjectIdentity {
        &self.identity
    }

    /// Registered type name.
    pub fn type_name(&self) -> &str {
        &self.identity.type_name
    }

    /// Object name.
    pub fn name(&self) -> &str {
        &self.identity.name
    }

    /// Read an attribute (cloned snapshot).
    pub fn get(&self, attribute: &str) -> Option<Value> {
        let attributes = self.attributes.lock().unwrap_or_else(|e| e.into_inner());
        attributes.get(attribute).cloned()
    }

    /// Store an attribute and synchronously run the type's change hook.
    pub fn set(&self, attribute: &str, value: Value) {
        self.update(attribute, move |_| Some(value));
    }

    /// Atomic load-modify-store transition.
    ///
    /// `f` receives the current value and returns the new one, or `None`
    /// for "no change" (nothing is stored, the hook does not run). The
    /// whole sequence, hook included, runs under the instance lock, so
    /// concurrent transitions on the same attribute cannot lose updates.
    /// The hook must not call `get`/`set`/`update` on this object.
    ///
    /// Returns whether a change was committed.
    pub fn update<F>(&self, attribute: &str, f: F) -> bool
    where
        F: FnOnce(Option<&Value>) -> Option<Value>,
    {
        let mut attributes = self.attributes.lock().unwrap_or_else(|e| e.into_inner());
        let old = attributes.get(attribute).cloned();
        let Some(new) = f(old.as_ref()) else {
            return false;
        };
        attributes.insert(attribute.to_string(), new.clone());
        debug!(object = %self.identity, attribute, "Attribute changed");

        if let Some(hook) = &self.registration.on_change {
            let change = AttributeChange {
                attribute: attribute.to_string(),
                old,
                new,
            };
            hook(&self.identity, &change);
        }
        true
    }

    /// Snapshot of all attributes, for replication serialization.
    pub fn attributes(&self) -> HashMap<String, Value> {
        let attributes = self.attributes.lock().unwrap_or_else(|e| e.into_inner());
        attributes.clone()
    }
}

impl fmt::Debug for ReflectiveObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReflectiveObject")
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    fn plain_object(name: &str) -> ReflectiveObject {
        ReflectiveObject::new(
            ObjectIdentity::new("Service", name),
            HashMap::new(),
            Arc::new(RegisteredType {
                classes: HashMap::new(),
                on_change: None,
            }),
        )
    }

    fn hooked_object(name: &str) -> (ReflectiveObject, Arc<Mutex<Vec<AttributeChange>>>) {
        let seen: Arc<Mutex<Vec<AttributeChange>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let object = ReflectiveObject::new(
            ObjectIdentity::new("Service", name),
            HashMap::new(),
            Arc::new(RegisteredType {
                classes: HashMap::new(),
                on_change: Some(Arc::new(move |_, change| {
                    sink.lock().unwrap().push(change.clone());
                })),
            }),
        );
        (object, seen)
    }

    #[test]
    fn test_set_and_get() {
        let object = plain_object("web");
        assert!(object.get("state").is_none());

        object.set("state", json!("critical"));
        assert_eq!(object.get("state"), Some(json!("critical")));
    }

    #[test]
    fn test_hook_sees_old_and_new() {
        let (object, seen) = hooked_object("web");
        object.set("state", json!("ok"));
        object.set("state", json!("warning"));

        let changes = seen.lock().unwrap();
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].old, None);
        assert_eq!(changes[0].new, json!("ok"));
        assert_eq!(changes[1].old, Some(json!("ok")));
        assert_eq!(changes[1].new, json!("warning"));
    }

    #[test]
    fn test_update_none_commits_nothing() {
        let (object, seen) = hooked_object("web");
        object.set("check_attempt", json!(1));

        let committed = object.update("check_attempt", |_| None);
        assert!(!committed);
        assert_eq!(object.get("check_attempt"), Some(json!(1)));
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_update_reads_current_value() {
        let object = plain_object("web");
        object.set("check_attempt", json!(1));

        let committed = object.update("check_attempt", |old| {
            let n = old.and_then(Value::as_i64).unwrap_or(0);
            Some(json!(n + 1))
        });
        assert!(committed);
        assert_eq!(object.get("check_attempt"), Some(json!(2)));
    }

    #[test]
    fn test_concurrent_updates_never_lose_increments() {
        let object = Arc::new(plain_object("web"));
        object.set("counter", json!(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let object = object.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..250 {
                    object.update("counter", |old| {
                        let n = old.and_then(Value::as_i64).unwrap_or(0);
                        Some(json!(n + 1))
                    });
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(object.get("counter"), Some(json!(1000)));
    }

    #[test]
    fn test_attributes_snapshot() {
        let object = plain_object("web");
        object.set("state", json!("ok"));
        object.set("check_attempt", json!(3));

        let snapshot = object.attributes();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot["state"], json!("ok"));
    }
}
