//! Fluent builder for tree edits
//!
//! A [`StateBuilder`] accumulates an ordered list of edit operations. It
//! has no side effects: nothing happens until the resulting
//! [`EditDescription`] is submitted to a [`crate::State`]. Only structural
//! well-formedness (ref syntax, a target for `apply`) is checked here;
//! kinds and parameters are validated at apply time.
//!
//! # Example
//!
//! ```ignore
//! let edits = StateBuilder::new()
//!     .to_root()
//!     .apply_as("load", &load, json!({"value": 10}))
//!     .apply_as("double", &double, json!({"factor": 3}))
//!     .build()?;
//! let report = state.submit(edits).await?;
//! ```

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::error::{Result, StateError};
use crate::transformer::Transformer;
use crate::tree::{is_valid_ref, Ref, ROOT_REF};

/// One graph edit
#[derive(Clone)]
pub enum EditOp {
    /// Create (or re-define) `cell_ref` as `transformer(params)` applied to `parent`
    Add {
        parent: Ref,
        cell_ref: Ref,
        transformer: Arc<Transformer>,
        params: Value,
    },
    /// Replace the parameters of an existing cell
    Update { cell_ref: Ref, params: Value },
    /// Remove a cell and its subtree
    Delete { cell_ref: Ref },
    /// Recompute a cell and its subtree even if nothing changed
    Refresh { cell_ref: Ref },
}

impl EditOp {
    /// The ref this operation targets
    pub fn cell_ref(&self) -> &str {
        match self {
            Self::Add { cell_ref, .. }
            | Self::Update { cell_ref, .. }
            | Self::Delete { cell_ref }
            | Self::Refresh { cell_ref } => cell_ref,
        }
    }
}

impl fmt::Debug for EditOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Add {
                parent,
                cell_ref,
                transformer,
                params,
            } => f
                .debug_struct("Add")
                .field("parent", parent)
                .field("cell_ref", cell_ref)
                .field("transformer", &transformer.id())
                .field("params", params)
                .finish(),
            Self::Update { cell_ref, params } => f
                .debug_struct("Update")
                .field("cell_ref", cell_ref)
                .field("params", params)
                .finish(),
            Self::Delete { cell_ref } => f.debug_struct("Delete").field("cell_ref", cell_ref).finish(),
            Self::Refresh { cell_ref } => f.debug_struct("Refresh").field("cell_ref", cell_ref).finish(),
        }
    }
}

/// Ordered, purely descriptive sequence of edits
#[derive(Debug, Clone, Default)]
pub struct EditDescription {
    ops: Vec<EditOp>,
}

impl EditDescription {
    pub fn ops(&self) -> &[EditOp] {
        &self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Fluent accumulator of edit operations
#[derive(Debug, Default)]
pub struct StateBuilder {
    ops: Vec<EditOp>,
    cursor: Option<Ref>,
    errors: Vec<String>,
}

impl StateBuilder {
    /// Create an empty builder with no target
    pub fn new() -> Self {
        Self::default()
    }

    /// Target an existing ref for subsequent `apply` calls
    pub fn to(mut self, cell_ref: impl Into<Ref>) -> Self {
        let cell_ref = cell_ref.into();
        self.check_ref(&cell_ref);
        self.cursor = Some(cell_ref);
        self
    }

    /// Target the root (start a new subtree)
    pub fn to_root(self) -> Self {
        self.to(ROOT_REF)
    }

    /// Current target ref
    pub fn current(&self) -> Option<&str> {
        self.cursor.as_deref()
    }

    /// Apply a transformer at the current target under a generated ref.
    ///
    /// The new node becomes the target, so calls chain into a path.
    pub fn apply(self, transformer: &Arc<Transformer>, params: Value) -> Self {
        let cell_ref = uuid::Uuid::new_v4().simple().to_string();
        self.apply_as(cell_ref, transformer, params)
    }

    /// Apply a transformer at the current target under an explicit ref
    pub fn apply_as(mut self, cell_ref: impl Into<Ref>, transformer: &Arc<Transformer>, params: Value) -> Self {
        let cell_ref = cell_ref.into();
        self.check_ref(&cell_ref);
        let Some(parent) = self.cursor.clone() else {
            self.errors.push(format!(
                "apply '{}' has no target; call to() or to_root() first",
                transformer.id()
            ));
            return self;
        };
        self.ops.push(EditOp::Add {
            parent,
            cell_ref: cell_ref.clone(),
            transformer: transformer.clone(),
            params,
        });
        self.cursor = Some(cell_ref);
        self
    }

    /// Replace the parameters of a cell
    pub fn update(mut self, cell_ref: impl Into<Ref>, params: Value) -> Self {
        let cell_ref = cell_ref.into();
        self.check_ref(&cell_ref);
        self.ops.push(EditOp::Update { cell_ref, params });
        self
    }

    /// Remove a cell and its subtree
    pub fn delete(mut self, cell_ref: impl Into<Ref>) -> Self {
        let cell_ref = cell_ref.into();
        self.check_ref(&cell_ref);
        if self.cursor.as_deref() == Some(cell_ref.as_str()) {
            self.cursor = None;
        }
        self.ops.push(EditOp::Delete { cell_ref });
        self
    }

    /// Force recomputation of a cell and its subtree
    pub fn refresh(mut self, cell_ref: impl Into<Ref>) -> Self {
        let cell_ref = cell_ref.into();
        self.check_ref(&cell_ref);
        self.ops.push(EditOp::Refresh { cell_ref });
        self
    }

    /// Finish the description, failing on the first structural problem
    pub fn build(self) -> Result<EditDescription> {
        if let Some(first) = self.errors.into_iter().next() {
            return Err(StateError::InvalidEdit(first));
        }
        Ok(EditDescription { ops: self.ops })
    }

    fn check_ref(&mut self, cell_ref: &str) {
        if !is_valid_ref(cell_ref) {
            self.errors.push(format!("'{}' is not a valid ref", cell_ref));
        }
    }
}
