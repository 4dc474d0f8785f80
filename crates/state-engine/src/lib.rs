//! State Engine - a typed tree of derived objects
//!
//! This crate keeps a tree of objects in which every node is produced by
//! applying a registered transform to its parent's value. Edits to the tree
//! are described declaratively and submitted; the engine diffs them against
//! the current shape and recomputes only what changed.
//!
//! - Input-dependent parameter schemas, validated before any body runs
//! - Per-cell error state with the last committed value kept
//! - Concurrent recomputation of independent branches
//! - Cooperative cancellation and progress reporting
//! - Event streaming for external observers
//!
//! # Architecture
//!
//! - `Registry`: transformers and actions, indexed by accepted kind
//! - `StateBuilder`: side-effect free edit descriptions
//! - `State`: the tree, its cells and the update/apply engine
//! - `EventSink`: generic event delivery (broadcast channel, host callback)
//!
//! # Example
//!
//! ```ignore
//! use state_engine::{Registry, State};
//!
//! let state = State::new(Arc::new(Registry::with_builtins()?));
//! let edits = state
//!     .build()
//!     .to_root()
//!     .apply_as("load", &load, json!({"value": 10}))
//!     .apply_as("double", &double, json!({"factor": 3}))
//!     .build()?;
//! let report = state.submit(edits).await?;
//! assert!(report.is_success());
//! ```

pub mod action;
pub mod builder;
pub mod cell;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod kind;
pub mod params;
pub mod registry;
pub mod state;
pub mod transformer;
pub mod tree;
pub mod update;

// Re-export key types
pub use action::{Action, ActionApply, ActionBody, ActionDisplay, ActionFn, ActionInstance, ActionOutput};
pub use builder::{EditDescription, EditOp, StateBuilder};
pub use cell::{CellStatus, Derivation, ObjectCell};
pub use config::EngineConfig;
pub use context::{CancellationToken, GlobalContext, RuntimeContext};
pub use error::{Result, StateError, ValidationError};
pub use events::{BroadcastEventSink, CellWatcher, EventSink, NullEventSink, StateEvent, VecEventSink};
pub use kind::{ObjectKind, StateObject};
pub use params::{ParamDefinition, ParamKind, ParamSchema, ParamValues, SelectOption};
pub use registry::Registry;
pub use state::State;
pub use transformer::{TransformBody, Transformer, TransformerFn, TransformerMetadata};
pub use tree::{Ref, StateTree, TransformInstance, ROOT_REF};
pub use update::{plan_update, CellFailure, UpdatePlan, UpdateReport};

