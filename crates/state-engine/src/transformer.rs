//! Transform templates
//!
//! A [`Transformer`] is an immutable, named operation definition: the
//! object kinds it accepts, the kind it produces, a parameter schema that
//! may depend on the input value, and an asynchronous body computing the
//! output from one input object and validated parameters.
//!
//! Bodies never see the state tree. They get exactly one input object,
//! their parameters and a [`RuntimeContext`] for progress and
//! cancellation, which is what lets the engine schedule and re-invoke them
//! freely.
//!
//! # Example
//!
//! ```ignore
//! let double = Transformer::from_fn(
//!     TransformerMetadata::new("double", NUMBER).from(&[NUMBER]),
//!     ParamSchema::new().with("factor", ParamDefinition::numeric(2.0, 0.0, 10.0)),
//!     |input, params| {
//!         let x = input.try_data::<f64>()?;
//!         let factor = params["factor"].as_f64().unwrap_or(1.0);
//!         Ok(StateObject::new(NUMBER, "Doubled", x * factor))
//!     },
//! );
//! ```

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::context::{GlobalContext, RuntimeContext};
use crate::error::{Result, StateError};
use crate::kind::{ObjectKind, StateObject};
use crate::params::{ParamSchema, ParamValues};

/// Static description of a transformer
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransformerMetadata {
    /// Stable identity (e.g., "select-path"); unique within a registry
    pub id: String,
    /// Human-readable label
    pub label: String,
    /// Description of what the transformer does
    pub description: String,
    /// Accepted input kinds; empty means "root only"
    pub from: Vec<ObjectKind>,
    /// Kind of every object this transformer produces
    pub to: ObjectKind,
}

impl TransformerMetadata {
    /// Create metadata for a root-only transformer producing `to`
    pub fn new(id: impl Into<String>, to: ObjectKind) -> Self {
        let id = id.into();
        Self {
            label: id.clone(),
            id,
            description: String::new(),
            from: Vec::new(),
            to,
        }
    }

    /// Set the accepted input kinds
    pub fn from(mut self, kinds: &[ObjectKind]) -> Self {
        self.from = kinds.to_vec();
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Whether an input of `kind` may be fed to this transformer
    pub fn accepts(&self, kind: ObjectKind) -> bool {
        accepts_kind(&self.from, kind)
    }
}

/// Shared membership rule for transformers and actions: an empty `from`
/// set accepts only the root.
pub(crate) fn accepts_kind(from: &[ObjectKind], kind: ObjectKind) -> bool {
    if from.is_empty() {
        kind == ObjectKind::ROOT
    } else {
        from.contains(&kind)
    }
}

pub(crate) fn describe_kinds(from: &[ObjectKind]) -> String {
    if from.is_empty() {
        ObjectKind::ROOT.id().to_string()
    } else {
        from.iter().map(|k| k.id()).collect::<Vec<_>>().join(", ")
    }
}

/// The behaviour of a transformer
#[async_trait]
pub trait TransformBody: Send + Sync {
    /// Parameter schema for a given input. Must be pure; it is recomputed
    /// for every distinct input and never cached.
    fn params(&self, _input: &StateObject, _global: &GlobalContext) -> ParamSchema {
        ParamSchema::new()
    }

    /// Cheap, side-effect-free applicability check beyond kind membership
    fn is_applicable(&self, _input: &StateObject, _global: &GlobalContext) -> bool {
        true
    }

    /// Compute the output object
    async fn apply(
        &self,
        input: &StateObject,
        params: &ParamValues,
        ctx: &RuntimeContext,
    ) -> Result<StateObject>;
}

/// An immutable transform template
pub struct Transformer {
    metadata: TransformerMetadata,
    body: Box<dyn TransformBody>,
}

impl Transformer {
    /// Freeze a definition into a shareable template
    pub fn create(metadata: TransformerMetadata, body: impl TransformBody + 'static) -> Arc<Self> {
        Arc::new(Self {
            metadata,
            body: Box::new(body),
        })
    }

    /// Template backed by a synchronous closure and a fixed schema
    pub fn from_fn<F>(metadata: TransformerMetadata, schema: ParamSchema, apply: F) -> Arc<Self>
    where
        F: Fn(&StateObject, &ParamValues) -> Result<StateObject> + Send + Sync + 'static,
    {
        Self::create(
            metadata,
            FnTransform {
                schema,
                apply: Box::new(apply),
            },
        )
    }

    pub fn id(&self) -> &str {
        &self.metadata.id
    }

    pub fn metadata(&self) -> &TransformerMetadata {
        &self.metadata
    }

    pub fn accepts(&self, kind: ObjectKind) -> bool {
        self.metadata.accepts(kind)
    }

    /// Kind membership plus the body's own predicate
    pub fn is_applicable(&self, input: &StateObject, global: &GlobalContext) -> bool {
        self.accepts(input.kind()) && self.body.is_applicable(input, global)
    }

    /// Parameter schema for a concrete input
    pub fn schema(&self, input: &StateObject, global: &GlobalContext) -> ParamSchema {
        self.body.params(input, global)
    }

    /// Run the body and check the declared output kind.
    ///
    /// Parameters are expected to be validated already.
    pub async fn apply(
        &self,
        input: &StateObject,
        params: &ParamValues,
        ctx: &RuntimeContext,
    ) -> Result<StateObject> {
        let output = self.body.apply(input, params, ctx).await?;
        if output.kind() != self.metadata.to {
            return Err(StateError::operation(format!(
                "'{}' produced an object of kind '{}' but declares '{}'",
                self.metadata.id,
                output.kind(),
                self.metadata.to
            )));
        }
        Ok(output)
    }
}

impl fmt::Debug for Transformer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transformer")
            .field("id", &self.metadata.id)
            .field("to", &self.metadata.to)
            .finish_non_exhaustive()
    }
}

/// Synchronous closure-backed body
struct FnTransform {
    schema: ParamSchema,
    apply: Box<dyn Fn(&StateObject, &ParamValues) -> Result<StateObject> + Send + Sync>,
}

#[async_trait]
impl TransformBody for FnTransform {
    fn params(&self, _input: &StateObject, _global: &GlobalContext) -> ParamSchema {
        self.schema.clone()
    }

    async fn apply(
        &self,
        input: &StateObject,
        params: &ParamValues,
        _ctx: &RuntimeContext,
    ) -> Result<StateObject> {
        (self.apply)(input, params)
    }
}

/// Link-time registration of a built-in transformer.
///
/// ```ignore
/// inventory::submit!(state_engine::TransformerFn(select_path));
/// ```
pub struct TransformerFn(pub fn() -> Arc<Transformer>);

inventory::collect!(TransformerFn);
