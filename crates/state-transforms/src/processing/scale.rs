//! Scale
//!
//! Affine transform of a number: `x * factor + offset`.

use std::sync::Arc;

use async_trait::async_trait;
use state_engine::{
    Action, GlobalContext, ParamDefinition, ParamSchema, ParamValues, Result, RuntimeContext, StateObject,
    TransformBody, Transformer, TransformerMetadata,
};

use crate::kinds::NUMBER;

/// Scale template
///
/// # Parameters
/// - `factor` (numeric, [-1000, 1000], default 1)
/// - `offset` (numeric, [-1e6, 1e6], default 0)
pub struct Scale;

impl Scale {
    pub const ID: &'static str = "scale";

    pub fn metadata() -> TransformerMetadata {
        TransformerMetadata::new(Self::ID, NUMBER)
            .from(&[NUMBER])
            .with_label("Scale")
            .with_description("Multiplies by a factor and adds an offset")
    }

    pub fn transformer() -> Arc<Transformer> {
        Transformer::create(Self::metadata(), Scale)
    }

    pub fn action() -> Arc<Action> {
        Action::from_transformer(&Self::transformer())
    }
}

#[async_trait]
impl TransformBody for Scale {
    fn params(&self, _input: &StateObject, _global: &GlobalContext) -> ParamSchema {
        ParamSchema::new()
            .with(
                "factor",
                ParamDefinition::numeric(1.0, -1000.0, 1000.0)
                    .with_step(0.1)
                    .with_label("Factor"),
            )
            .with(
                "offset",
                ParamDefinition::numeric(0.0, -1e6, 1e6).with_label("Offset"),
            )
    }

    async fn apply(&self, input: &StateObject, params: &ParamValues, _ctx: &RuntimeContext) -> Result<StateObject> {
        let x = *input.try_data::<f64>()?;
        let factor = params.get("factor").and_then(|v| v.as_f64()).unwrap_or(1.0);
        let offset = params.get("offset").and_then(|v| v.as_f64()).unwrap_or(0.0);
        Ok(StateObject::new(NUMBER, "Scaled", x * factor + offset))
    }
}

inventory::submit!(state_engine::TransformerFn(Scale::transformer));
inventory::submit!(state_engine::ActionFn(Scale::action));
