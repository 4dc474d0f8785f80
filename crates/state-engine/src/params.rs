//! Parameter descriptors
//!
//! A [`ParamSchema`] declares the options an operation accepts: their
//! type, default, bounds or choices and a human description. The same
//! schema drives validation at apply time and is exported (as JSON) to
//! whatever layer renders editable controls.
//!
//! Parameter *values* are plain JSON objects. Validation fills in defaults
//! for missing entries and rejects anything outside the declared domain.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ValidationError;

/// A validated (or to-be-validated) set of parameter values
pub type ParamValues = serde_json::Map<String, Value>;

/// One selectable choice of a `Select` parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectOption {
    pub value: Value,
    pub label: String,
}

impl SelectOption {
    pub fn new(value: impl Into<Value>, label: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            label: label.into(),
        }
    }
}

/// Shape and domain of a single parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ParamKind {
    /// Number with optional inclusive bounds; `step` is a UI hint
    Numeric {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        step: Option<f64>,
    },
    Boolean,
    Text,
    /// One of a fixed list of values
    Select { options: Vec<SelectOption> },
    /// Arbitrary JSON
    Json,
    /// Nested record
    Group { params: ParamSchema },
}

/// Descriptor of one parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParamDefinition {
    #[serde(flatten)]
    pub kind: ParamKind,
    /// Value used when the parameter is omitted
    pub default_value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl ParamDefinition {
    fn of(kind: ParamKind, default_value: Value) -> Self {
        Self {
            kind,
            default_value,
            label: None,
            description: None,
        }
    }

    /// Bounded number
    pub fn numeric(default: f64, min: f64, max: f64) -> Self {
        Self::of(
            ParamKind::Numeric {
                min: Some(min),
                max: Some(max),
                step: None,
            },
            Value::from(default),
        )
    }

    /// Unbounded number
    pub fn number(default: f64) -> Self {
        Self::of(
            ParamKind::Numeric {
                min: None,
                max: None,
                step: None,
            },
            Value::from(default),
        )
    }

    pub fn boolean(default: bool) -> Self {
        Self::of(ParamKind::Boolean, Value::Bool(default))
    }

    pub fn text(default: impl Into<String>) -> Self {
        Self::of(ParamKind::Text, Value::String(default.into()))
    }

    pub fn select(default: impl Into<Value>, options: Vec<SelectOption>) -> Self {
        Self::of(ParamKind::Select { options }, default.into())
    }

    pub fn json(default: Value) -> Self {
        Self::of(ParamKind::Json, default)
    }

    /// Nested record; its default is the defaults of the inner schema
    pub fn group(params: ParamSchema) -> Self {
        let defaults = Value::Object(params.defaults());
        Self::of(ParamKind::Group { params }, defaults)
    }

    /// Set the UI step of a numeric parameter
    pub fn with_step(mut self, value: f64) -> Self {
        if let ParamKind::Numeric { step, .. } = &mut self.kind {
            *step = Some(value);
        }
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    fn check(&self, name: &str, value: &Value) -> Result<Value, ValidationError> {
        match &self.kind {
            ParamKind::Numeric { min, max, .. } => {
                let number = value.as_f64().ok_or_else(|| ValidationError::TypeMismatch {
                    name: name.to_string(),
                    expected: "a number",
                })?;
                let lo = min.unwrap_or(f64::NEG_INFINITY);
                let hi = max.unwrap_or(f64::INFINITY);
                if number.is_nan() || number < lo || number > hi {
                    return Err(ValidationError::OutOfRange {
                        name: name.to_string(),
                        value: number,
                        min: lo,
                        max: hi,
                    });
                }
                // Integers and floats of equal value validate to the same entry.
                Ok(Value::from(number))
            }
            ParamKind::Boolean => match value {
                Value::Bool(_) => Ok(value.clone()),
                _ => Err(ValidationError::TypeMismatch {
                    name: name.to_string(),
                    expected: "a boolean",
                }),
            },
            ParamKind::Text => match value {
                Value::String(_) => Ok(value.clone()),
                _ => Err(ValidationError::TypeMismatch {
                    name: name.to_string(),
                    expected: "a string",
                }),
            },
            ParamKind::Select { options } => {
                if options.iter().any(|o| &o.value == value) {
                    Ok(value.clone())
                } else {
                    Err(ValidationError::InvalidChoice {
                        name: name.to_string(),
                        value: value.to_string(),
                    })
                }
            }
            ParamKind::Json => Ok(value.clone()),
            ParamKind::Group { params } => params.validate_at(value, name).map(Value::Object),
        }
    }
}

/// Named parameter entry, in declaration order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamEntry {
    pub name: String,
    #[serde(flatten)]
    pub definition: ParamDefinition,
}

/// Ordered mapping from option name to descriptor
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParamSchema {
    entries: Vec<ParamEntry>,
}

impl ParamSchema {
    /// Create an empty schema
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or replace) a parameter
    pub fn with(mut self, name: impl Into<String>, definition: ParamDefinition) -> Self {
        let name = name.into();
        match self.entries.iter_mut().find(|e| e.name == name) {
            Some(entry) => entry.definition = definition,
            None => self.entries.push(ParamEntry { name, definition }),
        }
        self
    }

    pub fn get(&self, name: &str) -> Option<&ParamDefinition> {
        self.entries
            .iter()
            .find(|e| e.name == name)
            .map(|e| &e.definition)
    }

    pub fn entries(&self) -> &[ParamEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Default values for every declared parameter
    pub fn defaults(&self) -> ParamValues {
        self.entries
            .iter()
            .map(|e| (e.name.clone(), e.definition.default_value.clone()))
            .collect()
    }

    /// Validate a value set, filling in defaults for omitted entries.
    ///
    /// `null` stands for "all defaults".
    pub fn validate(&self, values: &Value) -> Result<ParamValues, ValidationError> {
        self.validate_at(values, "")
    }

    fn validate_at(&self, values: &Value, path: &str) -> Result<ParamValues, ValidationError> {
        let empty = ParamValues::new();
        let given = match values {
            Value::Null => &empty,
            Value::Object(map) => map,
            _ => {
                return Err(ValidationError::NotAnObject {
                    path: if path.is_empty() { "<root>".to_string() } else { path.to_string() },
                })
            }
        };

        let qualified = |name: &str| {
            if path.is_empty() {
                name.to_string()
            } else {
                format!("{}.{}", path, name)
            }
        };

        if let Some(unknown) = given.keys().find(|k| self.get(k).is_none()) {
            return Err(ValidationError::UnknownParam {
                name: qualified(unknown),
            });
        }

        let mut out = ParamValues::new();
        for entry in &self.entries {
            let name = qualified(&entry.name);
            let value = match given.get(&entry.name) {
                Some(v) => entry.definition.check(&name, v)?,
                None => entry.definition.default_value.clone(),
            };
            out.insert(entry.name.clone(), value);
        }
        Ok(out)
    }
}
