//! Diffing an edit description against the current tree
//!
//! Planning is pure: it applies the edit operations to a copy of the tree
//! shape and works out which cells must be (re)computed. A cell is
//! affected when its own transform instance is new or changed (parent,
//! template or parameters), when it was explicitly refreshed, or when any
//! ancestor is affected. Everything else keeps its value and status.
//!
//! The raw parameter comparison here is conservative. An affected cell
//! whose validated parameters and input turn out unchanged is reused by
//! the engine without running its body.

use std::collections::HashSet;

use serde::Serialize;

use crate::builder::{EditDescription, EditOp};
use crate::error::{Result, StateError};
use crate::tree::{Ref, StateTree, TransformInstance, ROOT_REF};

/// Outcome of diffing an edit against a tree
#[derive(Debug, Clone)]
pub struct UpdatePlan {
    /// Tree shape after the edit
    pub tree: StateTree,
    /// Refs present before and gone after, parents before children
    pub removed: Vec<Ref>,
    /// Refs to (re)compute, parents before children, siblings in edit order
    pub affected: Vec<Ref>,
    /// Refs that did not exist before the edit
    pub created: Vec<Ref>,
    /// Refs named by a refresh; recomputed even when their inputs are unchanged
    pub forced: HashSet<Ref>,
}

impl UpdatePlan {
    /// True when the edit changes nothing
    pub fn is_noop(&self) -> bool {
        self.removed.is_empty() && self.affected.is_empty()
    }
}

/// A cell whose recomputation ended in an error
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CellFailure {
    pub cell_ref: Ref,
    pub reason: String,
}

/// Result of one submitted update
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateReport {
    pub update_id: String,
    /// Cells that committed a new value
    pub updated: Vec<Ref>,
    /// Cells whose validated inputs were unchanged and kept their value
    pub reused: Vec<Ref>,
    /// Cells left in the error state
    pub failed: Vec<CellFailure>,
    /// Cells left pending (cancelled or below a pending parent)
    pub pending: Vec<Ref>,
    /// Cells deleted by the edit
    pub removed: Vec<Ref>,
    /// Cancellation was requested while the update ran
    pub cancelled: bool,
}

impl UpdateReport {
    /// No failures and nothing left pending
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && self.pending.is_empty()
    }

    pub fn failure(&self, cell_ref: &str) -> Option<&CellFailure> {
        self.failed.iter().find(|f| f.cell_ref == cell_ref)
    }
}

/// Apply `edits` to a copy of `current` and compute the affected set.
///
/// A structurally invalid edit fails as a whole and leaves nothing behind.
pub fn plan_update(current: &StateTree, edits: &EditDescription) -> Result<UpdatePlan> {
    let mut tree = current.clone();
    let mut forced: HashSet<Ref> = HashSet::new();

    for op in edits.ops() {
        match op {
            EditOp::Add {
                parent,
                cell_ref,
                transformer,
                params,
            } => {
                let instance =
                    TransformInstance::new(cell_ref.clone(), parent.clone(), transformer.clone(), params.clone());
                match tree.get(cell_ref) {
                    None => tree.insert(instance)?,
                    Some(existing) if existing.same_definition(&instance) => {}
                    Some(_) => tree.redefine(instance)?,
                }
            }
            EditOp::Update { cell_ref, params } => {
                if cell_ref == ROOT_REF {
                    return Err(StateError::invalid_edit("The root has no parameters"));
                }
                tree.set_params(cell_ref, params.clone())?;
            }
            EditOp::Delete { cell_ref } => {
                if cell_ref == ROOT_REF {
                    return Err(StateError::invalid_edit("The root cannot be removed"));
                }
                if tree.contains(cell_ref) {
                    tree.remove_subtree(cell_ref)?;
                } else {
                    log::debug!("Delete of '{}' ignored: not in tree", cell_ref);
                }
            }
            EditOp::Refresh { cell_ref } => {
                if !tree.contains(cell_ref) {
                    return Err(StateError::UnknownRef(cell_ref.clone()));
                }
                forced.insert(cell_ref.clone());
            }
        }
    }

    // A forced ref deleted later in the same edit no longer matters.
    forced.retain(|r| tree.contains(r));

    let removed: Vec<Ref> = current
        .topological_order()
        .into_iter()
        .filter(|r| !tree.contains(r))
        .collect();

    let mut affected_set: HashSet<Ref> = HashSet::new();
    let mut affected = Vec::new();
    let mut created = Vec::new();
    for cell_ref in tree.topological_order() {
        let Some(instance) = tree.get(&cell_ref) else {
            continue;
        };
        let own_change = match current.get(&cell_ref) {
            None => {
                created.push(cell_ref.clone());
                true
            }
            Some(old) => !old.same_definition(instance),
        };
        let inherited = affected_set.contains(&instance.parent) || forced.contains(&cell_ref);
        if own_change || inherited {
            affected_set.insert(cell_ref.clone());
            affected.push(cell_ref);
        }
    }

    Ok(UpdatePlan {
        tree,
        removed,
        affected,
        created,
        forced,
    })
}
