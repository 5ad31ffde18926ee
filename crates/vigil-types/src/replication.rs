//! Attribute replication classification.
//!
//! Every attribute of a cluster object type is tagged with a replication
//! class at type-registration time. The replication transport uses the tag
//! to decide what crosses the wire on change; config persistence uses it to
//! decide what is eligible for durable storage. Unclassified attributes are
//! treated as [`ReplicationClass::Transient`] so unexpected state is never
//! replicated.

use serde::{Deserialize, Serialize};

/// Whether changes to an attribute are propagated to other cluster members.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicationClass {
    /// Process-local state, never replicated or persisted.
    Transient,
    /// State whose changes are propagated to other cluster members.
    Replicated,
}

impl ReplicationClass {
    /// True for [`ReplicationClass::Replicated`].
    pub fn is_replicated(&self) -> bool {
        matches!(self, ReplicationClass::Replicated)
    }
}

/// One row of a type's attribute classification table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeDescriptor {
    /// Attribute name.
    pub name: String,
    /// Replication class declared for the attribute.
    pub class: ReplicationClass,
}

impl AttributeDescriptor {
    /// Declare a replicated attribute.
    pub fn replicated(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            class: ReplicationClass::Replicated,
        }
    }

    /// Declare a transient attribute.
    pub fn transient(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            class: ReplicationClass::Transient,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_constructors() {
        let d = AttributeDescriptor::replicated("next_check");
        assert_eq!(d.name, "next_check");
        assert!(d.class.is_replicated());

        let d = AttributeDescriptor::transient("scheduling_offset");
        assert_eq!(d.class, ReplicationClass::Transient);
    }

    #[test]
    fn test_class_serde_tags() {
        let json = serde_json::to_string(&ReplicationClass::Replicated).unwrap();
        assert_eq!(json, "\"replicated\"");
        let back: ReplicationClass = serde_json::from_str("\"transient\"").unwrap();
        assert_eq!(back, ReplicationClass::Transient);
    }
}
