//! Interfaces of the encrypted execution backend.
//!
//! A [`FheCompiler`] turns the fixed-arity forward function of a module into a circuit,
//! picking cryptographic parameters from a representative input set. The resulting
//! [`FheCircuit`] runs one sample at a time and exposes the integer ranges it observed
//! per operator tag.

use crate::{
    config::ResolvedCompileOptions,
    fhe_module::{ForwardProxy, InputSet},
};
use atlas_quant::{
    model::ModuleError,
    tensor::{Tensor, TensorError},
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

pub mod mock;

/// How a circuit argument is provided at run time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EncryptionStatus {
    Encrypted,
    Clear,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum BackendError {
    #[error("compilation failed: {0}")]
    Compilation(String),
    #[error("execution failed: {0}")]
    Execution(String),
    #[error("the input set is empty")]
    EmptyInputSet,
    #[error(transparent)]
    Module(#[from] ModuleError),
    #[error(transparent)]
    Tensor(#[from] TensorError),
}

pub trait FheCompiler {
    type Circuit: FheCircuit;

    /// Compile `function`, whose arguments are named in `encryption`.
    ///
    /// `inputset` yields one tuple of single-sample tensors per calibration sample, or the
    /// error that prevented slicing it. It can only be consumed once.
    fn compile(
        &self,
        function: ForwardProxy,
        encryption: &BTreeMap<String, EncryptionStatus>,
        inputset: InputSet,
        options: &ResolvedCompileOptions,
    ) -> Result<Self::Circuit, BackendError>;
}

/// A compiled circuit. Every call takes exactly one sample per argument.
pub trait FheCircuit: Send + Sync {
    /// Approximate the encrypted computation in the clear.
    fn simulate(&self, sample: &[Tensor<i64>]) -> Result<Tensor<i64>, BackendError>;

    /// Encrypt the sample, run the circuit and decrypt the result.
    fn encrypt_run_decrypt(&self, sample: &[Tensor<i64>]) -> Result<Tensor<i64>, BackendError>;

    /// Range of all integers computed under tags matching `pattern`.
    fn integer_range(&self, pattern: &Regex) -> Option<(i64, i64)>;

    /// Widest integer computed under tags matching `pattern`.
    fn maximum_integer_bit_width(&self, pattern: &Regex) -> Option<i32>;
}
