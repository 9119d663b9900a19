//! Compile and run quantized modules with an encrypted execution backend.
//!
//! The quantized graph itself lives in `atlas_quant`. This crate adds what is needed to
//! hand it to a homomorphic backend:
//! - [`fhe_module::FheModule`]: compilation from float calibration data, per-sample
//!   execution in simulation or encrypted mode, and the bit-width report
//! - [`config`]: compile options and error probability resolution
//! - [`backend`]: the compiler and circuit interfaces, plus a clear-text mock backend

pub mod backend;
pub mod config;
pub mod error;
pub mod fhe_module;

pub use error::FheError;
