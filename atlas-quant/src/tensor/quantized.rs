use super::{Tensor, TensorError};
use crate::utils::quantize::UniformQuantizer;
use serde::{Deserialize, Serialize};

/// Integer codes together with the quantizer that produced them.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QuantizedTensor {
    qvalues: Tensor<i64>,
    quantizer: UniformQuantizer,
}

impl QuantizedTensor {
    /// Wrap existing codes. Every code must fit the quantizer's integer range.
    pub fn new(qvalues: Tensor<i64>, quantizer: UniformQuantizer) -> Result<Self, TensorError> {
        let (min, max) = quantizer.range();
        if let Some(&value) = qvalues.iter().find(|&&v| v < min || v > max) {
            return Err(TensorError::OutOfRange {
                value,
                n_bits: quantizer.n_bits,
                min,
                max,
            });
        }
        Ok(QuantizedTensor { qvalues, quantizer })
    }

    /// Quantize float values with `quantizer`.
    pub fn from_float(values: &Tensor<f64>, quantizer: UniformQuantizer) -> Self {
        QuantizedTensor {
            qvalues: quantizer.quant(values),
            quantizer,
        }
    }

    pub fn qvalues(&self) -> &Tensor<i64> {
        &self.qvalues
    }

    pub fn quantizer(&self) -> &UniformQuantizer {
        &self.quantizer
    }

    pub fn dequant(&self) -> Tensor<f64> {
        self.quantizer.dequant(&self.qvalues)
    }

    pub fn into_qvalues(self) -> Tensor<i64> {
        self.qvalues
    }
}

/// A value flowing along a graph edge.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum OpValue {
    Quantized(QuantizedTensor),
    /// Raw float data, e.g. an initializer kept in float for calibration.
    Float(Tensor<f64>),
}

impl OpValue {
    pub fn dims(&self) -> &[usize] {
        match self {
            OpValue::Quantized(q) => q.qvalues().dims(),
            OpValue::Float(t) => t.dims(),
        }
    }

    /// Float view of the value: dequantized codes or the raw floats.
    pub fn to_float(&self) -> Tensor<f64> {
        match self {
            OpValue::Quantized(q) => q.dequant(),
            OpValue::Float(t) => t.clone(),
        }
    }

    pub fn as_quantized(&self) -> Option<&QuantizedTensor> {
        match self {
            OpValue::Quantized(q) => Some(q),
            OpValue::Float(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_rejects_out_of_range_codes() {
        let quantizer = UniformQuantizer::with_scale(2, 1.0, 0);
        let ok = QuantizedTensor::new(Tensor::from(vec![0, 3]), quantizer.clone());
        assert!(ok.is_ok());
        let err = QuantizedTensor::new(Tensor::from(vec![0, 4]), quantizer).unwrap_err();
        assert_eq!(
            err,
            TensorError::OutOfRange {
                value: 4,
                n_bits: 2,
                min: 0,
                max: 3
            }
        );
    }
}
