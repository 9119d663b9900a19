use crate::{backend::BackendError, config::ConfigError};
use atlas_quant::{
    model::{ErrorKind, ModuleError},
    tensor::TensorError,
};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum FheError {
    #[error(
        "The quantized module is not compiled. Please run compile(...) first before executing it in FHE."
    )]
    NotCompiled,
    #[error("Mismatched dataset lengths: {0:?}")]
    MismatchedDatasetLengths(Vec<usize>),
    #[error(
        "Inputs used for compiling a QuantizedModule should only be floating points and not \
         already-quantized values, got integer inputs at positions {0:?}"
    )]
    AlreadyQuantized(Vec<usize>),
    #[error("Inputset cannot be empty")]
    EmptyInputs,
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Module(#[from] ModuleError),
    #[error(transparent)]
    Tensor(#[from] TensorError),
    #[error("invalid tag pattern: {0}")]
    Pattern(#[from] regex::Error),
}

impl FheError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FheError::NotCompiled => ErrorKind::State,
            FheError::MismatchedDatasetLengths(_) | FheError::EmptyInputs => ErrorKind::Type,
            FheError::AlreadyQuantized(_) | FheError::Tensor(_) => ErrorKind::Value,
            FheError::Config(_) => ErrorKind::Config,
            FheError::Backend(BackendError::Module(e)) | FheError::Module(e) => e.kind(),
            FheError::Backend(_) | FheError::Pattern(_) => ErrorKind::Backend,
        }
    }
}
