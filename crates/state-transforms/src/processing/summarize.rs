//! Summarize
//!
//! Descriptive statistics over an array of numbers, computed in phases with
//! a cancellation checkpoint between each.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use state_engine::{
    Action, GlobalContext, ParamDefinition, ParamSchema, ParamValues, Result, RuntimeContext, StateObject,
    TransformBody, Transformer, TransformerMetadata,
};

use super::to_number::to_number;
use crate::error::TransformError;
use crate::kinds::DATA;

/// Statistics produced by [`Summarize`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub count: usize,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub stddev: f64,
}

impl Summary {
    /// Statistics of `values`; `sample` selects the n-1 denominator
    pub fn of(values: &[f64], sample: bool) -> std::result::Result<Self, TransformError> {
        if values.is_empty() {
            return Err(TransformError::Empty);
        }
        let count = values.len();
        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let mean = values.iter().sum::<f64>() / count as f64;
        let squares: f64 = values.iter().map(|v| (v - mean).powi(2)).sum();
        let denominator = if sample { count.saturating_sub(1) } else { count };
        let stddev = if denominator == 0 {
            0.0
        } else {
            (squares / denominator as f64).sqrt()
        };
        Ok(Self {
            count,
            min,
            max,
            mean,
            stddev,
        })
    }
}

/// Summarize template
///
/// # Parameters
/// - `skipInvalid` (boolean) - Ignore non-numeric elements instead of failing
/// - `sample` (boolean) - Sample rather than population standard deviation
///
/// # Output
/// A `data` object `{count, min, max, mean, stddev}`.
pub struct Summarize;

impl Summarize {
    pub const ID: &'static str = "summarize";

    pub fn metadata() -> TransformerMetadata {
        TransformerMetadata::new(Self::ID, DATA)
            .from(&[DATA])
            .with_label("Summarize")
            .with_description("Count, range, mean and standard deviation of a numeric array")
    }

    pub fn transformer() -> Arc<Transformer> {
        Transformer::create(Self::metadata(), Summarize)
    }

    pub fn action() -> Arc<Action> {
        Action::from_transformer(&Self::transformer())
    }
}

#[async_trait]
impl TransformBody for Summarize {
    fn params(&self, _input: &StateObject, _global: &GlobalContext) -> ParamSchema {
        ParamSchema::new()
            .with(
                "skipInvalid",
                ParamDefinition::boolean(false).with_label("Skip invalid elements"),
            )
            .with(
                "sample",
                ParamDefinition::boolean(false).with_label("Sample standard deviation"),
            )
    }

    fn is_applicable(&self, input: &StateObject, _global: &GlobalContext) -> bool {
        matches!(input.data::<Value>(), Some(Value::Array(_)))
    }

    async fn apply(&self, input: &StateObject, params: &ParamValues, ctx: &RuntimeContext) -> Result<StateObject> {
        let skip_invalid = params.get("skipInvalid").and_then(Value::as_bool).unwrap_or(false);
        let sample = params.get("sample").and_then(Value::as_bool).unwrap_or(false);

        ctx.checkpoint("Collecting values").await?;
        let items = match input.try_data::<Value>()? {
            Value::Array(items) => items,
            other => return Err(TransformError::NotAnArray(other.to_string()).into()),
        };
        let mut values = Vec::with_capacity(items.len());
        for (index, item) in items.iter().enumerate() {
            match to_number(item) {
                Ok(v) => values.push(v),
                Err(_) if skip_invalid => {
                    log::debug!("Summarize: skipping element {}", index);
                }
                Err(_) => {
                    return Err(TransformError::NotNumericAt {
                        index,
                        value: item.to_string(),
                    }
                    .into())
                }
            }
        }

        ctx.checkpoint("Computing statistics").await?;
        let summary = Summary::of(&values, sample)?;

        ctx.update("Done");
        Ok(StateObject::new(DATA, "Summary", serde_json::to_value(summary)?))
    }
}

inventory::submit!(state_engine::TransformerFn(Summarize::transformer));
inventory::submit!(state_engine::ActionFn(Summarize::action));
