//! Quantized inference graphs.
//!
//! A [`model::QuantizedModule`] runs an ordered graph of quantized operators on integer
//! codes. It is the clear-text reference the FHE driver compiles and checks against.

pub mod model;
pub mod node;
pub mod ops;
pub mod tensor;
pub mod utils;
