use crate::{
    ops::OpError,
    tensor::{DType, TensorError},
    utils::quantize::SUPPORTED_N_BITS,
};
use itertools::Itertools;
use std::{fmt, ops::RangeInclusive};
use thiserror::Error;

/// Coarse classification of failures, shared with the FHE driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Wrong number of arguments.
    Type,
    /// Wrong element types, out-of-range codes, or inconsistent quantization.
    Value,
    /// The graph itself is malformed.
    Construction,
    /// An operation needs state (e.g. a compiled circuit) that is missing.
    State,
    /// Conflicting or invalid options.
    Config,
    /// The encrypted backend failed.
    Backend,
}

/// A tensor that should have been quantized, and the operator type that consumed it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QatFault {
    pub tensor: String,
    pub op_type: &'static str,
}

/// Every QAT fault found during one forward pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QatFaults(pub Vec<QatFault>);

impl fmt::Display for QatFaults {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Error occurred during quantization aware training (QAT) import: the following \
             tensors were expected to be quantized, but the values found during calibration \
             do not appear to be quantized.\n"
        )?;
        for fault in &self.0 {
            writeln!(
                f,
                "* Tensor {}, input of an {} operation",
                fault.tensor, fault.op_type
            )?;
        }
        write!(
            f,
            "\nCould not determine a unique scale for the quantization! \
             Please check the ONNX graph of this model."
        )
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ModuleError {
    #[error("Got {got} inputs, expected {expected}")]
    InputCount { got: usize, expected: usize },
    #[error(
        "Inputs: {} are not integer types. Make sure you quantize your input before calling forward.",
        .0.iter().map(|(idx, dtype)| format!("#{idx} ({dtype})")).join(", ")
    )]
    NonIntegerInputs(Vec<(usize, DType)>),
    #[error("{0}")]
    Qat(QatFaults),
    #[error("QuantizedModule only supports a single output for now, got {0}")]
    OutputCount(usize),
    #[error("tensor '{0}' is defined more than once")]
    DuplicateTensor(String),
    #[error("operator tag '{0}' is used by more than one node")]
    DuplicateTag(String),
    #[error("node '{node}' reads '{input}', which is neither a module input nor an earlier output")]
    UnresolvedInput { node: String, input: String },
    #[error("node '{node}' ({op_type}) takes {expected:?} inputs, got {got}")]
    NodeArity {
        node: String,
        op_type: &'static str,
        expected: RangeInclusive<usize>,
        got: usize,
    },
    #[error("output '{0}' is not produced by any node")]
    UnknownOutput(String),
    #[error("output '{0}' is not a quantized tensor")]
    OutputNotQuantized(String),
    #[error("node '{node}' failed: {source}")]
    Op { node: String, source: OpError },
    #[error(transparent)]
    Tensor(#[from] TensorError),
    #[error(
        "quantizer of '{tensor}' uses {n_bits} bits, supported widths are {:?}",
        SUPPORTED_N_BITS
    )]
    UnsupportedBitWidth { tensor: String, n_bits: u32 },
    #[error("input quantizers are not set, call set_input_quantizers first")]
    UnboundInputQuantizers,
    #[error("invalid module JSON: {0}")]
    Json(String),
}

impl ModuleError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ModuleError::InputCount { .. } => ErrorKind::Type,
            ModuleError::NonIntegerInputs(_)
            | ModuleError::Qat(_)
            | ModuleError::Op { .. }
            | ModuleError::Tensor(_)
            | ModuleError::OutputNotQuantized(_)
            | ModuleError::UnsupportedBitWidth { .. } => ErrorKind::Value,
            ModuleError::OutputCount(_)
            | ModuleError::DuplicateTensor(_)
            | ModuleError::DuplicateTag(_)
            | ModuleError::UnresolvedInput { .. }
            | ModuleError::NodeArity { .. }
            | ModuleError::UnknownOutput(_)
            | ModuleError::Json(_) => ErrorKind::Construction,
            ModuleError::UnboundInputQuantizers => ErrorKind::State,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_name_every_position() {
        let err = ModuleError::NonIntegerInputs(vec![(0, DType::F64), (2, DType::F32)]);
        let msg = err.to_string();
        assert!(msg.contains("#0 (float64)"), "{msg}");
        assert!(msg.contains("#2 (float32)"), "{msg}");
        assert_eq!(err.kind(), ErrorKind::Value);

        let faults = QatFaults(vec![
            QatFault {
                tensor: "a".into(),
                op_type: "Gemm",
            },
            QatFault {
                tensor: "b".into(),
                op_type: "Add",
            },
        ]);
        let msg = ModuleError::Qat(faults).to_string();
        assert!(msg.contains("* Tensor a, input of an Gemm operation"));
        assert!(msg.contains("* Tensor b, input of an Add operation"));
    }
}
