//! Select Path
//!
//! Extracts a value from JSON data using a path expression.
//! Supports simple dot notation and array indexing.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use state_engine::{
    Action, GlobalContext, ParamDefinition, ParamSchema, ParamValues, Result, RuntimeContext, StateObject,
    TransformBody, Transformer, TransformerMetadata,
};

use crate::error::TransformError;
use crate::kinds::DATA;

/// Select Path template
///
/// # Path Syntax Examples
/// - `"name"` - Get the "name" field
/// - `"data.items"` - Get nested field
/// - `"[0]"` - Get first array element
/// - `"items[0].name"` - Combined access
/// - `""` - The whole value
///
/// # Parameters
/// - `path` (text) - Path expression
/// - `default` (json) - Value used when the path does not resolve;
///   `null` means "no default" and the cell fails instead
pub struct SelectPath;

impl SelectPath {
    pub const ID: &'static str = "select-path";

    pub fn metadata() -> TransformerMetadata {
        TransformerMetadata::new(Self::ID, DATA)
            .from(&[DATA])
            .with_label("Select Path")
            .with_description("Extracts a value from JSON data using a path expression")
    }

    pub fn transformer() -> Arc<Transformer> {
        Transformer::create(Self::metadata(), SelectPath)
    }

    pub fn action() -> Arc<Action> {
        Action::from_transformer(&Self::transformer())
    }
}

/// Extract a value from JSON using a path expression.
///
/// Supports:
/// - Dot notation: `field.nested.value`
/// - Array indexing: `[0]`, `items[1]`
/// - Combined: `data.items[0].name`
pub fn extract_path<'a>(json: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = json;
    let mut remaining = path;

    while !remaining.is_empty() {
        if let Some(rest) = remaining.strip_prefix('[') {
            let end = rest.find(']')?;
            let index = rest[..end].parse::<usize>().ok()?;
            current = current.get(index)?;
            remaining = &rest[end + 1..];
            remaining = remaining.strip_prefix('.').unwrap_or(remaining);
            continue;
        }

        let dot = remaining.find('.').unwrap_or(remaining.len());
        let bracket = remaining.find('[').unwrap_or(remaining.len());
        let (field, rest) = if dot < bracket {
            (&remaining[..dot], &remaining[dot + 1..])
        } else {
            (&remaining[..bracket], &remaining[bracket..])
        };

        if !field.is_empty() {
            current = current.get(field)?;
        }
        remaining = rest;
    }

    Some(current)
}

#[async_trait]
impl TransformBody for SelectPath {
    fn params(&self, input: &StateObject, _global: &GlobalContext) -> ParamSchema {
        let mut path = ParamDefinition::text("").with_label("Path");
        if let Some(Value::Object(fields)) = input.data::<Value>() {
            let names: Vec<&str> = fields.keys().map(String::as_str).collect();
            path = path.with_description(format!("Top-level fields: {}", names.join(", ")));
        }
        ParamSchema::new()
            .with("path", path)
            .with("default", ParamDefinition::json(Value::Null).with_label("Default"))
    }

    async fn apply(&self, input: &StateObject, params: &ParamValues, _ctx: &RuntimeContext) -> Result<StateObject> {
        let data = input.try_data::<Value>()?;
        let path = params.get("path").and_then(Value::as_str).unwrap_or_default();
        let default = params.get("default").filter(|v| !v.is_null());

        let value = match (extract_path(data, path), default) {
            (Some(found), _) => found.clone(),
            (None, Some(default)) => {
                log::debug!("SelectPath: '{}' not found, using default", path);
                default.clone()
            }
            (None, None) => {
                return Err(TransformError::PathNotFound {
                    path: path.to_string(),
                }
                .into())
            }
        };

        let label = if path.is_empty() { input.label().to_string() } else { path.to_string() };
        Ok(StateObject::new(DATA, label, value))
    }
}

inventory::submit!(state_engine::TransformerFn(SelectPath::transformer));
inventory::submit!(state_engine::ActionFn(SelectPath::action));

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use state_engine::StateError;

    async fn run(data: Value, params: Value) -> Result<StateObject> {
        let t = SelectPath::transformer();
        let input = StateObject::new(DATA, "input", data);
        let params = t.schema(&input, &GlobalContext::new()).validate(&params)?;
        t.apply(&input, &params, &RuntimeContext::detached("select")).await
    }

    #[test]
    fn test_extract_path() {
        let data = json!({
            "name": "sensor",
            "data": {"items": [{"name": "first"}, {"name": "second"}]},
        });
        assert_eq!(extract_path(&data, "name"), Some(&json!("sensor")));
        assert_eq!(extract_path(&data, "data.items[1].name"), Some(&json!("second")));
        assert_eq!(extract_path(&data, ""), Some(&data));
        assert_eq!(extract_path(&data, "data.items[5]"), None);
        assert_eq!(extract_path(&data, "missing"), None);
        assert_eq!(extract_path(&data, "data.items[x]"), None);

        let list = json!([{"arguments": {"content": "hi"}}]);
        assert_eq!(extract_path(&list, "[0].arguments.content"), Some(&json!("hi")));
    }

    #[tokio::test]
    async fn test_missing_path_uses_default() {
        let out = run(json!({"a": 1}), json!({"path": "b", "default": 7}))
            .await
            .unwrap();
        assert_eq!(out.data::<Value>(), Some(&json!(7)));
    }

    #[tokio::test]
    async fn test_missing_path_without_default_fails() {
        let err = run(json!({"a": 1}), json!({"path": "b"})).await.unwrap_err();
        assert!(matches!(err, StateError::Operation(ref m) if m.contains("'b'")));
    }

    #[test]
    fn test_schema_describes_input_fields() {
        let t = SelectPath::transformer();
        let global = GlobalContext::new();
        let object = StateObject::new(DATA, "o", json!({"alpha": 1, "beta": 2}));
        let schema = t.schema(&object, &global);
        let description = schema.get("path").unwrap().description.clone().unwrap();
        assert!(description.contains("alpha"));

        let scalar = StateObject::new(DATA, "s", json!(3));
        assert!(t.schema(&scalar, &global).get("path").unwrap().description.is_none());
    }
}
