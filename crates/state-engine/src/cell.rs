//! Object cells: the materialized value at one tree node

use serde::{Deserialize, Serialize};

use crate::kind::{ObjectKind, StateObject};
use crate::params::ParamValues;
use crate::tree::{Ref, TransformInstance, ROOT_REF};

/// Lifecycle status of a cell
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CellStatus {
    /// Scheduled, not yet started (or cancelled before completion)
    Pending,
    /// Body running
    Processing,
    /// Last computation committed a value
    Ok,
    /// Last computation was rejected or failed
    Error,
}

/// What a committed value was computed from
#[derive(Debug, Clone, PartialEq)]
pub struct Derivation {
    pub transformer: String,
    pub parent: Ref,
    /// Version of the parent value used as input
    pub parent_version: u64,
    /// Validated parameters, defaults filled in
    pub params: ParamValues,
}

/// Materialized, versioned instance of an object at one tree node.
///
/// The ref never changes across recomputations. A failed or cancelled
/// recomputation keeps `obj` at its last committed value.
#[derive(Debug, Clone)]
pub struct ObjectCell {
    pub cell_ref: Ref,
    /// Producing transform instance; `None` for the root
    pub transform: Option<TransformInstance>,
    pub status: CellStatus,
    /// Last committed value
    pub obj: Option<StateObject>,
    /// Reason of the last failure while `status == Error`
    pub error: Option<String>,
    /// Number of values committed so far
    pub version: u64,
    /// Inputs of the last committed value; `None` for the root
    pub derivation: Option<Derivation>,
}

impl ObjectCell {
    pub(crate) fn root() -> Self {
        Self {
            cell_ref: ROOT_REF.to_string(),
            transform: None,
            status: CellStatus::Ok,
            obj: Some(StateObject::root()),
            error: None,
            version: 1,
            derivation: None,
        }
    }

    pub(crate) fn pending(transform: TransformInstance) -> Self {
        Self {
            cell_ref: transform.cell_ref.clone(),
            transform: Some(transform),
            status: CellStatus::Pending,
            obj: None,
            error: None,
            version: 0,
            derivation: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == CellStatus::Ok
    }

    /// Kind of the committed value, if any
    pub fn kind(&self) -> Option<ObjectKind> {
        self.obj.as_ref().map(StateObject::kind)
    }

    /// Typed view of the committed value
    pub fn value<T: std::any::Any>(&self) -> Option<&T> {
        self.obj.as_ref().and_then(|o| o.data::<T>())
    }

    pub(crate) fn mark(&mut self, status: CellStatus) {
        self.status = status;
        if status != CellStatus::Error {
            self.error = None;
        }
    }

    pub(crate) fn commit(&mut self, obj: StateObject, derivation: Option<Derivation>) {
        self.obj = Some(obj);
        self.derivation = derivation;
        self.status = CellStatus::Ok;
        self.error = None;
        self.version += 1;
    }

    /// A value already computed from exactly `derivation`
    pub(crate) fn reusable(&self, derivation: &Derivation) -> bool {
        self.obj.is_some() && self.derivation.as_ref() == Some(derivation)
    }

    pub(crate) fn fail(&mut self, reason: impl Into<String>) {
        self.status = CellStatus::Error;
        self.error = Some(reason.into());
    }
}
