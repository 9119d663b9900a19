//! Quantized operators.
//!
//! Operators are declared once with [`define_operators!`], which generates one struct per
//! operator plus the [`Operator`] enum that dispatches to the [`Op`] implementations in the
//! sibling modules. Kernels receive their resolved inputs (absent ones as `None`) and a
//! call-local [`OpContext`] where they report QAT faults and, when requested, the inputs
//! they actually computed with.

use crate::{
    tensor::{OpValue, QuantizedTensor, Tensor, TensorError},
    utils::quantize::UniformQuantizer,
};
use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;
use thiserror::Error;

pub mod add;
pub mod constant;
pub mod gemm;
pub mod identity;
pub mod relu;

macro_rules! define_operators {
    // Internal rule to generate struct definition
    (@struct $operator:ident { $($field:ident : $ty:ty),* $(,)? }) => {
        #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
        pub struct $operator {
            $(pub $field: $ty),*
        }
    };
    (@struct $operator:ident ( $($ty:ty),* $(,)? )) => {
        #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
        pub struct $operator($(pub $ty),*);
    };

    // Main entry point
    (operators: [$($operator:ident $({ $($field:ident : $ty:ty),* $(,)? })? $(( $($tuple_ty:ty),* $(,)? ))?),* $(,)?]) => {
        $(
            define_operators!(@struct $operator $({ $($field: $ty),* })? $(( $($tuple_ty),* ))?);
        )*

        #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
        pub enum Operator {
            $(
                $operator($operator),
            )*
        }

        impl Operator {
            pub fn inner(&self) -> &dyn Op {
                match self {
                    $(
                        Operator::$operator(op) => op,
                    )*
                }
            }

            /// Operator type name as it appears in diagnostics.
            pub fn op_type(&self) -> &'static str {
                match self {
                    $(
                        Operator::$operator(_) => stringify!($operator),
                    )*
                }
            }
        }
    };
}

define_operators! {
    operators: [
        Add { output: UniformQuantizer },
        Constant(Tensor<f64>),
        Gemm { weights: QuantizedTensor, output: UniformQuantizer },
        Identity { output: UniformQuantizer },
        ReLU { output: UniformQuantizer },
    ]
}

/// Errors raised by operator kernels.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum OpError {
    #[error("required input #{0} is absent")]
    MissingInput(usize),
    #[error("incompatible input shapes {left:?} and {right:?}")]
    ShapeMismatch { left: Vec<usize>, right: Vec<usize> },
    #[error("integer accumulation overflows i64")]
    Overflow,
    #[error(transparent)]
    Tensor(#[from] TensorError),
}

pub trait Op {
    fn f(&self, inputs: &[Option<&OpValue>], ctx: &mut OpContext) -> Result<OpValue, OpError>;

    /// Accepted number of inputs.
    fn arity(&self) -> RangeInclusive<usize>;

    /// Input positions that may legitimately resolve to nothing at run time.
    fn optional_inputs(&self) -> &'static [usize] {
        &[]
    }

    /// Whether input `idx` must arrive quantized; a float value there is a QAT fault.
    fn requires_quantized_input(&self, _idx: usize) -> bool {
        false
    }

    /// Calibrated quantizer of the produced tensor, `None` for float producers.
    fn output_quantizer(&self) -> Option<&UniformQuantizer> {
        None
    }

    /// Every quantizer the operator computes with.
    fn quantizers(&self) -> Vec<&UniformQuantizer> {
        self.output_quantizer().into_iter().collect()
    }

    /// Whether backends fold this operator into its neighbours, leaving no tag behind.
    fn is_fusable(&self) -> bool {
        false
    }
}

impl Op for Operator {
    fn f(&self, inputs: &[Option<&OpValue>], ctx: &mut OpContext) -> Result<OpValue, OpError> {
        self.inner().f(inputs, ctx)
    }

    fn arity(&self) -> RangeInclusive<usize> {
        self.inner().arity()
    }

    fn optional_inputs(&self) -> &'static [usize] {
        self.inner().optional_inputs()
    }

    fn requires_quantized_input(&self, idx: usize) -> bool {
        self.inner().requires_quantized_input(idx)
    }

    fn output_quantizer(&self) -> Option<&UniformQuantizer> {
        self.inner().output_quantizer()
    }

    fn quantizers(&self) -> Vec<&UniformQuantizer> {
        self.inner().quantizers()
    }

    fn is_fusable(&self) -> bool {
        self.inner().is_fusable()
    }
}

/// State scoped to a single operator call.
#[derive(Debug, Default)]
pub struct OpContext {
    capture: bool,
    qat_faults: Vec<usize>,
    prepared: Vec<Option<Tensor<f64>>>,
}

impl OpContext {
    /// `capture` keeps the prepared inputs for the debug trace.
    pub fn new(capture: bool) -> Self {
        OpContext {
            capture,
            ..Default::default()
        }
    }

    /// Record that input `idx` should have been quantized but was not.
    pub fn flag_qat_fault(&mut self, idx: usize) {
        if !self.qat_faults.contains(&idx) {
            self.qat_faults.push(idx);
        }
    }

    pub fn qat_faults(&self) -> &[usize] {
        &self.qat_faults
    }

    pub fn take_prepared(&mut self) -> Vec<Option<Tensor<f64>>> {
        std::mem::take(&mut self.prepared)
    }

    /// Float view of every present input, flagging QAT faults along the way.
    pub fn prepare_inputs(
        &mut self,
        op: &dyn Op,
        inputs: &[Option<&OpValue>],
    ) -> Vec<Option<Tensor<f64>>> {
        let prepared: Vec<Option<Tensor<f64>>> = inputs
            .iter()
            .enumerate()
            .map(|(idx, input)| {
                let value = (*input)?;
                match value {
                    OpValue::Quantized(q) => {
                        let quantizer = q.quantizer();
                        if quantizer.options.is_qat && !quantizer.has_meaningful_scale() {
                            self.flag_qat_fault(idx);
                        }
                    }
                    OpValue::Float(_) if op.requires_quantized_input(idx) => {
                        self.flag_qat_fault(idx)
                    }
                    OpValue::Float(_) => {}
                }
                Some(value.to_float())
            })
            .collect();
        if self.capture {
            self.prepared = prepared.clone();
        }
        prepared
    }
}

/// Fetch a present prepared input or fail.
pub(crate) fn required(
    prepared: &[Option<Tensor<f64>>],
    idx: usize,
) -> Result<&Tensor<f64>, OpError> {
    prepared
        .get(idx)
        .and_then(Option::as_ref)
        .ok_or(OpError::MissingInput(idx))
}

/// Requantize a float result with the operator's output quantizer.
pub(crate) fn requantize(values: &Tensor<f64>, output: &UniformQuantizer) -> OpValue {
    OpValue::Quantized(QuantizedTensor::from_float(values, output.clone()))
}
