use super::{add::broadcast_add, required, requantize, Gemm, Op, OpContext, OpError};
use crate::{
    tensor::{OpValue, QuantizedTensor, Tensor},
    utils::quantize::UniformQuantizer,
};
use std::ops::RangeInclusive;

impl Op for Gemm {
    /// `x @ W (+ bias)` with `x: [batch, k]` and `W: [k, n]`.
    ///
    /// Quantized inputs accumulate `(qx - zx) * (qw - zw)` in `i64` and apply both scales
    /// once at the end. A float `x` falls back to a float product.
    #[tracing::instrument(name = "Gemm::f", skip_all)]
    fn f(&self, inputs: &[Option<&OpValue>], ctx: &mut OpContext) -> Result<OpValue, OpError> {
        let prepared = ctx.prepare_inputs(self, inputs);
        let x_float = required(&prepared, 0)?;
        let (batch, k, n) = self.check_dims(x_float.dims())?;

        let product = match inputs.first().copied().flatten() {
            Some(OpValue::Quantized(x)) => self.integer_matmul(x)?,
            _ => self.float_matmul(x_float, batch, k, n),
        };
        let result = match prepared.get(1).and_then(Option::as_ref) {
            Some(bias) => broadcast_add(&product, bias)?,
            None => product,
        };
        Ok(requantize(&result, &self.output))
    }

    fn arity(&self) -> RangeInclusive<usize> {
        1..=2
    }

    fn optional_inputs(&self) -> &'static [usize] {
        &[1]
    }

    fn requires_quantized_input(&self, idx: usize) -> bool {
        idx == 0
    }

    fn output_quantizer(&self) -> Option<&UniformQuantizer> {
        Some(&self.output)
    }

    fn quantizers(&self) -> Vec<&UniformQuantizer> {
        vec![self.weights.quantizer(), &self.output]
    }
}

impl Gemm {
    fn check_dims(&self, x_dims: &[usize]) -> Result<(usize, usize, usize), OpError> {
        let w_dims = self.weights.qvalues().dims();
        match (x_dims, w_dims) {
            ([batch, k], [wk, n]) if k == wk => Ok((*batch, *k, *n)),
            _ => Err(OpError::ShapeMismatch {
                left: x_dims.to_vec(),
                right: w_dims.to_vec(),
            }),
        }
    }

    /// Integer accumulators `sum_i (qx - zx) * (qw - zw)` of `x @ W`, before scaling.
    pub fn accumulate(&self, x: &QuantizedTensor) -> Result<Tensor<i64>, OpError> {
        let (batch, k, n) = self.check_dims(x.qvalues().dims())?;
        let zx = x.quantizer().params.zero_point;
        let zw = self.weights.quantizer().params.zero_point;
        let xs = x.qvalues().data();
        let ws = self.weights.qvalues().data();

        let mut out = Vec::with_capacity(batch * n);
        for b in 0..batch {
            for j in 0..n {
                let mut acc = 0i64;
                for i in 0..k {
                    let dx = xs[b * k + i].checked_sub(zx).ok_or(OpError::Overflow)?;
                    let dw = ws[i * n + j].checked_sub(zw).ok_or(OpError::Overflow)?;
                    acc = dx
                        .checked_mul(dw)
                        .and_then(|p| acc.checked_add(p))
                        .ok_or(OpError::Overflow)?;
                }
                out.push(acc);
            }
        }
        Ok(Tensor::construct(out, vec![batch, n]))
    }

    fn integer_matmul(&self, x: &QuantizedTensor) -> Result<Tensor<f64>, OpError> {
        let scale = x.quantizer().params.scale * self.weights.quantizer().params.scale;
        Ok(self.accumulate(x)?.map(|&acc| acc as f64 * scale))
    }

    fn float_matmul(&self, x: &Tensor<f64>, batch: usize, k: usize, n: usize) -> Tensor<f64> {
        let w = self.weights.dequant();
        let (xs, ws) = (x.data(), w.data());
        let mut out = Vec::with_capacity(batch * n);
        for b in 0..batch {
            for j in 0..n {
                out.push((0..k).map(|i| xs[b * k + i] * ws[i * n + j]).sum());
            }
        }
        Tensor::construct(out, vec![batch, n])
    }
}
