//! Object kinds produced by the built-in templates

use state_engine::ObjectKind;

/// Arbitrary JSON data; payload is a `serde_json::Value`
pub const DATA: ObjectKind = ObjectKind::new("data", "JSON data");

/// A single number; payload is an `f64`
pub const NUMBER: ObjectKind = ObjectKind::new("number", "A number");
