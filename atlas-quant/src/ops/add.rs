use super::{required, requantize, Add, Op, OpContext, OpError};
use crate::{
    tensor::{OpValue, Tensor},
    utils::quantize::UniformQuantizer,
};
use std::ops::RangeInclusive;

impl Op for Add {
    #[tracing::instrument(name = "Add::f", skip_all)]
    fn f(&self, inputs: &[Option<&OpValue>], ctx: &mut OpContext) -> Result<OpValue, OpError> {
        let prepared = ctx.prepare_inputs(self, inputs);
        let sum = broadcast_add(required(&prepared, 0)?, required(&prepared, 1)?)?;
        Ok(requantize(&sum, &self.output))
    }

    fn arity(&self) -> RangeInclusive<usize> {
        2..=2
    }

    fn output_quantizer(&self) -> Option<&UniformQuantizer> {
        Some(&self.output)
    }
}

/// `a + b` where `b` either matches `a` or matches its trailing dims.
pub(crate) fn broadcast_add(a: &Tensor<f64>, b: &Tensor<f64>) -> Result<Tensor<f64>, OpError> {
    if b.is_empty() || !a.dims().ends_with(b.dims()) {
        return Err(OpError::ShapeMismatch {
            left: a.dims().to_vec(),
            right: b.dims().to_vec(),
        });
    }
    let rhs = b.data();
    let data = a
        .iter()
        .enumerate()
        .map(|(i, &x)| x + rhs[i % rhs.len()])
        .collect();
    Ok(Tensor::construct(data, a.dims().to_vec()))
}
