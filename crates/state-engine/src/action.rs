//! Actions: user-invocable operations on a target cell
//!
//! An [`Action`] is either a thin wrapper over a [`Transformer`] (see
//! [`Action::from_transformer`]) or an arbitrary mutation of the tree. Each
//! action has a fresh identity, optional display metadata, the set of
//! object kinds it applies to, an applicability predicate and a parameter
//! schema that may depend on the target object and the global context.
//!
//! Actions are executed through [`State::apply_action`], which validates
//! the target and the parameters before calling the body.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::builder::{EditDescription, StateBuilder};
use crate::context::GlobalContext;
use crate::error::Result;
use crate::kind::{ObjectKind, StateObject};
use crate::params::{ParamSchema, ParamValues};
use crate::state::State;
use crate::transformer::{accepts_kind, Transformer};
use crate::update::UpdateReport;

/// Unique identifier of an action
pub type ActionId = String;

/// Display metadata of an action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionDisplay {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl ActionDisplay {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Everything an action body gets to work with
pub struct ActionApply<'a> {
    /// Ref of the target cell
    pub target: &'a str,
    /// Committed value of the target cell
    pub object: &'a StateObject,
    /// Validated parameters
    pub params: &'a ParamValues,
    pub state: &'a State,
    pub global: &'a GlobalContext,
}

/// What an action produced
#[derive(Debug)]
pub enum ActionOutput {
    None,
    Value(Value),
    /// An edit for the engine to submit on the action's behalf
    Edit(EditDescription),
    /// Report of an update the action already submitted
    Update(UpdateReport),
}

/// The behaviour of an action
#[async_trait]
pub trait ActionBody: Send + Sync {
    /// Parameter schema for a target object
    fn params(&self, _target: &StateObject, _global: &GlobalContext) -> ParamSchema {
        ParamSchema::new()
    }

    /// Pure, fast applicability check; may be called speculatively
    fn is_applicable(&self, _target: &StateObject, _global: &GlobalContext) -> bool {
        true
    }

    async fn apply(&self, ctx: ActionApply<'_>) -> Result<ActionOutput>;
}

/// A registered, user-invocable operation
pub struct Action {
    id: ActionId,
    display: Option<ActionDisplay>,
    from: Vec<ObjectKind>,
    body: Box<dyn ActionBody>,
}

impl Action {
    /// Freeze a definition under a fresh identity
    pub fn create(from: &[ObjectKind], display: Option<ActionDisplay>, body: impl ActionBody + 'static) -> Arc<Self> {
        Arc::new(Self {
            id: uuid::Uuid::new_v4().to_string(),
            display,
            from: from.to_vec(),
            body: Box::new(body),
        })
    }

    /// Start defining an action from closures
    pub fn build(from: &[ObjectKind]) -> ActionBuilder {
        ActionBuilder {
            from: from.to_vec(),
            display: None,
            schema: SchemaSource::Empty,
            applicable: None,
        }
    }

    /// Action whose body applies `transformer` at the target and submits
    /// the resulting edit.
    pub fn from_transformer(transformer: &Arc<Transformer>) -> Arc<Self> {
        let meta = transformer.metadata();
        let mut display = ActionDisplay::new(meta.label.clone());
        if !meta.description.is_empty() {
            display = display.with_description(meta.description.clone());
        }
        Self::create(
            &meta.from,
            Some(display),
            TransformerAction {
                transformer: transformer.clone(),
            },
        )
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn display(&self) -> Option<&ActionDisplay> {
        self.display.as_ref()
    }

    /// Accepted target kinds; empty means "root only"
    pub fn from(&self) -> &[ObjectKind] {
        &self.from
    }

    pub fn accepts(&self, kind: ObjectKind) -> bool {
        accepts_kind(&self.from, kind)
    }

    /// Kind membership plus the body's own predicate
    pub fn is_applicable(&self, target: &StateObject, global: &GlobalContext) -> bool {
        self.accepts(target.kind()) && self.body.is_applicable(target, global)
    }

    pub fn schema(&self, target: &StateObject, global: &GlobalContext) -> ParamSchema {
        self.body.params(target, global)
    }

    /// Bind concrete parameters
    pub fn instance(self: &Arc<Self>, params: Value) -> ActionInstance {
        ActionInstance {
            action: self.clone(),
            params,
        }
    }

    pub(crate) async fn run(&self, ctx: ActionApply<'_>) -> Result<ActionOutput> {
        self.body.apply(ctx).await
    }
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Action")
            .field("id", &self.id)
            .field("display", &self.display)
            .field("from", &self.from)
            .finish_non_exhaustive()
    }
}

/// An action bound to one parameter value set
#[derive(Debug, Clone)]
pub struct ActionInstance {
    pub action: Arc<Action>,
    pub params: Value,
}

struct TransformerAction {
    transformer: Arc<Transformer>,
}

#[async_trait]
impl ActionBody for TransformerAction {
    fn params(&self, target: &StateObject, global: &GlobalContext) -> ParamSchema {
        self.transformer.schema(target, global)
    }

    fn is_applicable(&self, target: &StateObject, global: &GlobalContext) -> bool {
        self.transformer.is_applicable(target, global)
    }

    async fn apply(&self, ctx: ActionApply<'_>) -> Result<ActionOutput> {
        let edits = StateBuilder::new()
            .to(ctx.target)
            .apply(&self.transformer, Value::Object(ctx.params.clone()))
            .build()?;
        let report = ctx.state.submit(edits).await?;
        Ok(ActionOutput::Update(report))
    }
}

type SchemaFn = Box<dyn Fn(&StateObject, &GlobalContext) -> ParamSchema + Send + Sync>;
type ApplicableFn = Box<dyn Fn(&StateObject, &GlobalContext) -> bool + Send + Sync>;
type ApplyFn = Box<dyn Fn(&ActionApply<'_>) -> Result<ActionOutput> + Send + Sync>;

enum SchemaSource {
    Empty,
    Fixed(ParamSchema),
    Dynamic(SchemaFn),
}

/// Closure-based action definition
///
/// ```ignore
/// let reset = Action::build(&[NUMBER])
///     .with_display(ActionDisplay::new("Reset"))
///     .with_params(ParamSchema::new().with("value", ParamDefinition::number(0.0)))
///     .define(|ctx| Ok(ActionOutput::Edit(
///         StateBuilder::new().update(ctx.target, Value::Object(ctx.params.clone())).build()?,
///     )));
/// ```
pub struct ActionBuilder {
    from: Vec<ObjectKind>,
    display: Option<ActionDisplay>,
    schema: SchemaSource,
    applicable: Option<ApplicableFn>,
}

impl ActionBuilder {
    pub fn with_display(mut self, display: ActionDisplay) -> Self {
        self.display = Some(display);
        self
    }

    /// Fixed parameter schema
    pub fn with_params(mut self, schema: ParamSchema) -> Self {
        self.schema = SchemaSource::Fixed(schema);
        self
    }

    /// Schema computed from the target object
    pub fn with_params_fn(
        mut self,
        f: impl Fn(&StateObject, &GlobalContext) -> ParamSchema + Send + Sync + 'static,
    ) -> Self {
        self.schema = SchemaSource::Dynamic(Box::new(f));
        self
    }

    pub fn with_applicable(mut self, f: impl Fn(&StateObject, &GlobalContext) -> bool + Send + Sync + 'static) -> Self {
        self.applicable = Some(Box::new(f));
        self
    }

    /// Finish with a synchronous body
    pub fn define(self, apply: impl Fn(&ActionApply<'_>) -> Result<ActionOutput> + Send + Sync + 'static) -> Arc<Action> {
        let from = self.from;
        let display = self.display;
        Action::create(
            &from,
            display,
            ClosureAction {
                schema: self.schema,
                applicable: self.applicable,
                apply: Box::new(apply),
            },
        )
    }
}

struct ClosureAction {
    schema: SchemaSource,
    applicable: Option<ApplicableFn>,
    apply: ApplyFn,
}

#[async_trait]
impl ActionBody for ClosureAction {
    fn params(&self, target: &StateObject, global: &GlobalContext) -> ParamSchema {
        match &self.schema {
            SchemaSource::Empty => ParamSchema::new(),
            SchemaSource::Fixed(schema) => schema.clone(),
            SchemaSource::Dynamic(f) => f(target, global),
        }
    }

    fn is_applicable(&self, target: &StateObject, global: &GlobalContext) -> bool {
        self.applicable.as_ref().map_or(true, |f| f(target, global))
    }

    async fn apply(&self, ctx: ActionApply<'_>) -> Result<ActionOutput> {
        (self.apply)(&ctx)
    }
}

/// Link-time registration of a built-in action.
pub struct ActionFn(pub fn() -> Arc<Action>);

inventory::collect!(ActionFn);
