//! State tree shape
//!
//! The tree stores, for every ref, the transform instance that defines it
//! (template + parameters + parent ref) and the ordered list of children.
//! Values live in cells (see [`crate::cell`]); this module is only about
//! structure, which makes it cheap to clone and diff.
//!
//! Every non-root node has exactly one parent that must exist, so the
//! structure is a tree rooted at [`ROOT_REF`] and acyclic by construction.
//! Re-parenting is rejected when the new parent lies inside the moved
//! subtree.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::error::{Result, StateError};
use crate::transformer::Transformer;

/// Stable reference string identifying a cell within one tree
pub type Ref = String;

/// Ref of the implicit root cell
pub const ROOT_REF: &str = "-=root=-";

/// Syntactic well-formedness of a ref: non-empty, no whitespace
pub fn is_valid_ref(cell_ref: &str) -> bool {
    !cell_ref.is_empty() && !cell_ref.chars().any(char::is_whitespace)
}

/// A transformer bound to a parent ref and concrete parameters.
///
/// This is the edge label of the tree. Parameters are kept as submitted;
/// validation against the (input-dependent) schema happens at apply time.
#[derive(Clone)]
pub struct TransformInstance {
    pub cell_ref: Ref,
    pub parent: Ref,
    pub transformer: Arc<Transformer>,
    pub params: Value,
}

impl TransformInstance {
    pub fn new(
        cell_ref: impl Into<Ref>,
        parent: impl Into<Ref>,
        transformer: Arc<Transformer>,
        params: Value,
    ) -> Self {
        Self {
            cell_ref: cell_ref.into(),
            parent: parent.into(),
            transformer,
            params,
        }
    }

    /// Same parent, same template and equal parameters
    pub fn same_definition(&self, other: &TransformInstance) -> bool {
        self.parent == other.parent
            && self.transformer.id() == other.transformer.id()
            && self.params == other.params
    }
}

impl fmt::Debug for TransformInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransformInstance")
            .field("cell_ref", &self.cell_ref)
            .field("parent", &self.parent)
            .field("transformer", &self.transformer.id())
            .field("params", &self.params)
            .finish()
    }
}

/// Shape of the state graph
#[derive(Debug, Clone)]
pub struct StateTree {
    nodes: HashMap<Ref, TransformInstance>,
    children: HashMap<Ref, Vec<Ref>>,
}

impl Default for StateTree {
    fn default() -> Self {
        Self::new()
    }
}

impl StateTree {
    /// Create a tree holding only the root
    pub fn new() -> Self {
        let mut children = HashMap::new();
        children.insert(ROOT_REF.to_string(), Vec::new());
        Self {
            nodes: HashMap::new(),
            children,
        }
    }

    pub fn contains(&self, cell_ref: &str) -> bool {
        cell_ref == ROOT_REF || self.nodes.contains_key(cell_ref)
    }

    /// Transform instance defining a non-root cell
    pub fn get(&self, cell_ref: &str) -> Option<&TransformInstance> {
        self.nodes.get(cell_ref)
    }

    pub fn parent(&self, cell_ref: &str) -> Option<&str> {
        self.nodes.get(cell_ref).map(|t| t.parent.as_str())
    }

    /// Children in insertion order
    pub fn children(&self, cell_ref: &str) -> &[Ref] {
        self.children.get(cell_ref).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Number of non-root cells
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Refs from the parent up to the root (root last)
    pub fn ancestors(&self, cell_ref: &str) -> Vec<Ref> {
        let mut out = Vec::new();
        let mut current = self.parent(cell_ref);
        while let Some(parent) = current {
            out.push(parent.to_string());
            current = self.parent(parent);
        }
        out
    }

    /// Whether `ancestor` lies on the parent chain of `cell_ref`
    pub fn is_ancestor(&self, ancestor: &str, cell_ref: &str) -> bool {
        self.ancestors(cell_ref).iter().any(|a| a == ancestor)
    }

    /// `cell_ref` and all of its descendants, parents before children
    pub fn subtree(&self, cell_ref: &str) -> Vec<Ref> {
        let mut out = Vec::new();
        if !self.contains(cell_ref) {
            return out;
        }
        let mut stack = vec![cell_ref.to_string()];
        while let Some(current) = stack.pop() {
            stack.extend(self.children(&current).iter().rev().cloned());
            out.push(current);
        }
        out
    }

    /// All non-root refs, parents before children, siblings in order
    pub fn topological_order(&self) -> Vec<Ref> {
        let mut order = self.subtree(ROOT_REF);
        order.remove(0);
        order
    }

    /// Add a new node under an existing parent
    pub fn insert(&mut self, instance: TransformInstance) -> Result<()> {
        let cell_ref = instance.cell_ref.clone();
        if !is_valid_ref(&cell_ref) {
            return Err(StateError::invalid_edit(format!("'{}' is not a valid ref", cell_ref)));
        }
        if self.contains(&cell_ref) {
            return Err(StateError::invalid_edit(format!("Ref '{}' already exists", cell_ref)));
        }
        if !self.contains(&instance.parent) {
            return Err(StateError::invalid_edit(format!(
                "Parent '{}' of '{}' does not exist",
                instance.parent, cell_ref
            )));
        }
        self.children
            .entry(instance.parent.clone())
            .or_default()
            .push(cell_ref.clone());
        self.children.insert(cell_ref.clone(), Vec::new());
        self.nodes.insert(cell_ref, instance);
        Ok(())
    }

    /// Replace the definition of an existing node, keeping its children.
    ///
    /// Moving a node under one of its own descendants is rejected.
    pub fn redefine(&mut self, instance: TransformInstance) -> Result<()> {
        let cell_ref = instance.cell_ref.clone();
        let old_parent = match self.nodes.get(&cell_ref) {
            Some(old) => old.parent.clone(),
            None => return Err(StateError::UnknownRef(cell_ref)),
        };
        if old_parent != instance.parent {
            if !self.contains(&instance.parent) {
                return Err(StateError::invalid_edit(format!(
                    "Parent '{}' of '{}' does not exist",
                    instance.parent, cell_ref
                )));
            }
            if instance.parent == cell_ref || self.is_ancestor(&cell_ref, &instance.parent) {
                return Err(StateError::invalid_edit(format!(
                    "Moving '{}' under '{}' would create a cycle",
                    cell_ref, instance.parent
                )));
            }
            if let Some(siblings) = self.children.get_mut(&old_parent) {
                siblings.retain(|c| c != &cell_ref);
            }
            self.children
                .entry(instance.parent.clone())
                .or_default()
                .push(cell_ref.clone());
        }
        self.nodes.insert(cell_ref, instance);
        Ok(())
    }

    /// Replace the parameters of a node; returns whether they changed
    pub fn set_params(&mut self, cell_ref: &str, params: Value) -> Result<bool> {
        let node = self
            .nodes
            .get_mut(cell_ref)
            .ok_or_else(|| StateError::UnknownRef(cell_ref.to_string()))?;
        if node.params == params {
            return Ok(false);
        }
        node.params = params;
        Ok(true)
    }

    /// Remove a node and all of its descendants; returns the removed refs
    pub fn remove_subtree(&mut self, cell_ref: &str) -> Result<Vec<Ref>> {
        if cell_ref == ROOT_REF {
            return Err(StateError::invalid_edit("The root cannot be removed"));
        }
        let parent = self
            .parent(cell_ref)
            .map(str::to_string)
            .ok_or_else(|| StateError::UnknownRef(cell_ref.to_string()))?;

        let removed = self.subtree(cell_ref);
        for r in &removed {
            self.nodes.remove(r);
            self.children.remove(r);
        }
        if let Some(siblings) = self.children.get_mut(&parent) {
            siblings.retain(|c| c != cell_ref);
        }
        Ok(removed)
    }
}
