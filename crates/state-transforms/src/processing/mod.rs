//! Processing templates
//!
//! Templates that reshape, convert or analyze their parent's value.

mod scale;
mod select_path;
mod summarize;
mod to_number;

pub use scale::Scale;
pub use select_path::{extract_path, SelectPath};
pub use summarize::{Summarize, Summary};
pub use to_number::{to_number, ToNumber};
