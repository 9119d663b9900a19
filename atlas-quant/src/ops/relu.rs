use super::{required, requantize, Op, OpContext, OpError, ReLU};
use crate::{tensor::OpValue, utils::quantize::UniformQuantizer};
use std::ops::RangeInclusive;

impl Op for ReLU {
    #[tracing::instrument(name = "ReLU::f", skip_all)]
    fn f(&self, inputs: &[Option<&OpValue>], ctx: &mut OpContext) -> Result<OpValue, OpError> {
        let prepared = ctx.prepare_inputs(self, inputs);
        let x = required(&prepared, 0)?;
        Ok(requantize(&x.map(|&v| v.max(0.0)), &self.output))
    }

    fn arity(&self) -> RangeInclusive<usize> {
        1..=1
    }

    fn output_quantizer(&self) -> Option<&UniformQuantizer> {
        Some(&self.output)
    }
}
