use super::{Constant, Op, OpContext, OpError};
use crate::tensor::OpValue;
use std::ops::RangeInclusive;

impl Op for Constant {
    #[tracing::instrument(name = "Constant::f", skip_all)]
    fn f(&self, _inputs: &[Option<&OpValue>], _ctx: &mut OpContext) -> Result<OpValue, OpError> {
        Ok(OpValue::Float(self.0.clone()))
    }

    fn arity(&self) -> RangeInclusive<usize> {
        0..=0
    }

    fn is_fusable(&self) -> bool {
        true
    }
}
