//! Utility modules for the quantized graph.

pub mod quantize;
