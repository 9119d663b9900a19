use super::{required, requantize, Identity, Op, OpContext, OpError};
use crate::{tensor::OpValue, utils::quantize::UniformQuantizer};
use std::ops::RangeInclusive;

impl Op for Identity {
    #[tracing::instrument(name = "Identity::f", skip_all)]
    fn f(&self, inputs: &[Option<&OpValue>], ctx: &mut OpContext) -> Result<OpValue, OpError> {
        let prepared = ctx.prepare_inputs(self, inputs);
        Ok(requantize(required(&prepared, 0)?, &self.output))
    }

    fn arity(&self) -> RangeInclusive<usize> {
        1..=1
    }

    fn output_quantizer(&self) -> Option<&UniformQuantizer> {
        Some(&self.output)
    }

    fn is_fusable(&self) -> bool {
        true
    }
}
