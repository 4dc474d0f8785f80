//! Input templates
//!
//! Templates applied to the root that bring data into the tree.

mod data_input;

pub use data_input::DataInput;
