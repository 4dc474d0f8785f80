//! Data Input
//!
//! Introduces a JSON value given as a parameter. This is the usual first
//! step under the root.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use state_engine::{
    Action, GlobalContext, ParamDefinition, ParamSchema, ParamValues, Result, RuntimeContext, StateObject,
    TransformBody, Transformer, TransformerMetadata,
};

use crate::kinds::DATA;

/// Data Input template
///
/// # Parameters
/// - `value` (json) - The data to introduce
/// - `label` (text) - Label of the produced object
///
/// # Output
/// A `data` object holding `value` unchanged.
pub struct DataInput;

impl DataInput {
    pub const ID: &'static str = "data-input";

    pub fn metadata() -> TransformerMetadata {
        TransformerMetadata::new(Self::ID, DATA)
            .with_label("Data Input")
            .with_description("Introduces a JSON value")
    }

    pub fn transformer() -> Arc<Transformer> {
        Transformer::create(Self::metadata(), DataInput)
    }

    pub fn action() -> Arc<Action> {
        Action::from_transformer(&Self::transformer())
    }
}

#[async_trait]
impl TransformBody for DataInput {
    fn params(&self, _input: &StateObject, _global: &GlobalContext) -> ParamSchema {
        ParamSchema::new()
            .with("value", ParamDefinition::json(Value::Null).with_label("Value"))
            .with("label", ParamDefinition::text("Data").with_label("Label"))
    }

    async fn apply(&self, _input: &StateObject, params: &ParamValues, _ctx: &RuntimeContext) -> Result<StateObject> {
        let value = params.get("value").cloned().unwrap_or(Value::Null);
        let label = params.get("label").and_then(Value::as_str).unwrap_or("Data");

        log::debug!("DataInput: introducing {} value", json_type(&value));
        Ok(StateObject::new(DATA, label, value))
    }
}

inventory::submit!(state_engine::TransformerFn(DataInput::transformer));
inventory::submit!(state_engine::ActionFn(DataInput::action));

pub(crate) fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_introduces_value() {
        let t = DataInput::transformer();
        let root = StateObject::root();
        let params = t
            .schema(&root, &GlobalContext::new())
            .validate(&json!({"value": {"a": [1, 2]}, "label": "Sensors"}))
            .unwrap();

        let out = t
            .apply(&root, &params, &RuntimeContext::detached("input"))
            .await
            .unwrap();
        assert_eq!(out.kind(), DATA);
        assert_eq!(out.label(), "Sensors");
        assert_eq!(out.data::<Value>(), Some(&json!({"a": [1, 2]})));
    }

    #[test]
    fn test_root_only() {
        let t = DataInput::transformer();
        assert!(t.is_applicable(&StateObject::root(), &GlobalContext::new()));
        assert!(!t.accepts(DATA));
    }
}
