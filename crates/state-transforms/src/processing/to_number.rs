//! To Number
//!
//! Reads JSON data as a single number.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use state_engine::{
    Action, ParamValues, Result, RuntimeContext, StateObject, TransformBody, Transformer, TransformerMetadata,
};

use crate::error::TransformError;
use crate::kinds::{DATA, NUMBER};

/// To Number template
///
/// Accepts a JSON number or a string holding one (surrounding whitespace
/// is ignored). Anything else, and non-finite results, fail the cell.
pub struct ToNumber;

impl ToNumber {
    pub const ID: &'static str = "to-number";

    pub fn metadata() -> TransformerMetadata {
        TransformerMetadata::new(Self::ID, NUMBER)
            .from(&[DATA])
            .with_label("To Number")
            .with_description("Reads JSON data as a number")
    }

    pub fn transformer() -> Arc<Transformer> {
        Transformer::create(Self::metadata(), ToNumber)
    }

    pub fn action() -> Arc<Action> {
        Action::from_transformer(&Self::transformer())
    }
}

/// Interpret a JSON value as a finite number
pub fn to_number(value: &Value) -> std::result::Result<f64, TransformError> {
    let number = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    number
        .filter(|n| n.is_finite())
        .ok_or_else(|| TransformError::NotNumeric {
            value: value.to_string(),
        })
}

#[async_trait]
impl TransformBody for ToNumber {
    async fn apply(&self, input: &StateObject, _params: &ParamValues, _ctx: &RuntimeContext) -> Result<StateObject> {
        let number = to_number(input.try_data::<Value>()?)?;
        Ok(StateObject::new(NUMBER, input.label(), number))
    }
}

inventory::submit!(state_engine::TransformerFn(ToNumber::transformer));
inventory::submit!(state_engine::ActionFn(ToNumber::action));
