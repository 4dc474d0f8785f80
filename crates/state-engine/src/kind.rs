//! Typed object model
//!
//! Every value materialized in the state tree is a [`StateObject`]: an
//! opaque payload tagged with an [`ObjectKind`]. Transformers declare the
//! kinds they accept and the kind they produce; the engine only ever looks
//! at the tag, never at the payload.

use std::any::Any;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use serde::{Serialize, Serializer};

use crate::error::{Result, StateError};

/// Identity tag attached to every object value.
///
/// Two kinds are equal when their ids are equal; the description is
/// display metadata only. Ids are therefore global: crates declaring kinds
/// must not reuse an id for a different kind, and a [`crate::Registry`]
/// rejects registrations that do. Kinds are usually declared as constants
/// next to the transformers that produce them.
#[derive(Clone, Copy)]
pub struct ObjectKind {
    id: &'static str,
    description: &'static str,
}

impl ObjectKind {
    /// Kind of the implicit root object every tree starts from
    pub const ROOT: ObjectKind = ObjectKind::new("root", "Root of the state tree");

    /// Declare a kind
    pub const fn new(id: &'static str, description: &'static str) -> Self {
        Self { id, description }
    }

    /// Stable identifier of this kind
    pub fn id(&self) -> &'static str {
        self.id
    }

    /// Human-readable description
    pub fn description(&self) -> &'static str {
        self.description
    }
}

impl PartialEq for ObjectKind {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ObjectKind {}

impl Hash for ObjectKind {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectKind({})", self.id)
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id)
    }
}

impl Serialize for ObjectKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.id)
    }
}

/// A materialized value: kind tag, label and an opaque shared payload.
///
/// Cloning is cheap; the payload is reference counted and never mutated
/// after construction.
#[derive(Clone)]
pub struct StateObject {
    kind: ObjectKind,
    label: String,
    description: Option<String>,
    data: Arc<dyn Any + Send + Sync>,
}

impl StateObject {
    /// Wrap a payload under a kind tag
    pub fn new<T: Any + Send + Sync>(kind: ObjectKind, label: impl Into<String>, data: T) -> Self {
        Self {
            kind,
            label: label.into(),
            description: None,
            data: Arc::new(data),
        }
    }

    /// The root object
    pub fn root() -> Self {
        Self::new(ObjectKind::ROOT, "Root", ())
    }

    /// Attach a description
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn kind(&self) -> ObjectKind {
        self.kind
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Borrow the payload as `T`, if it is one
    pub fn data<T: Any>(&self) -> Option<&T> {
        self.data.downcast_ref::<T>()
    }

    /// Borrow the payload as `T` or fail with [`StateError::InvalidData`]
    pub fn try_data<T: Any>(&self) -> Result<&T> {
        self.data::<T>().ok_or_else(|| StateError::InvalidData {
            kind: self.kind.id().to_string(),
            expected: std::any::type_name::<T>(),
        })
    }

    /// Whether both objects share the same payload allocation
    pub fn same_payload(&self, other: &StateObject) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }
}

impl fmt::Debug for StateObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateObject")
            .field("kind", &self.kind)
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}
