//! State Transforms
//!
//! Built-in transform templates for the state engine. Each template is an
//! atomic step that derives one object from its parent and registers
//! itself, together with a derived action, through `inventory`.
//!
//! # Categories
//!
//! - **Input**: Templates applied to the root that introduce data
//! - **Processing**: Templates that reshape, convert or analyze data
//!
//! # Kinds
//!
//! - [`kinds::DATA`]: a JSON value (`serde_json::Value` payload)
//! - [`kinds::NUMBER`]: a single number (`f64` payload)

pub mod error;
pub mod input;
pub mod kinds;
pub mod processing;

pub use error::TransformError;
pub use input::*;
pub use processing::*;
