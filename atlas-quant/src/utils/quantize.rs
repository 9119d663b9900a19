//! Uniform affine quantization.
//!
//! A [`UniformQuantizer`] maps floats to integer codes with
//! `q = clamp(round_half_even(x / scale + zero_point), qmin, qmax)` and back with
//! `x = scale * (q - zero_point)`. Quantizers are plain values: modules clone them on
//! hand-off and never mutate a caller's copy.

use crate::tensor::Tensor;
use common::consts::DEFAULT_N_BITS;
use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;

/// Bit-widths a quantizer may use. Products of two codes must fit an `i64`.
pub const SUPPORTED_N_BITS: RangeInclusive<u32> = 1..=32;

/// How the integer range is laid out.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct QuantizationOptions {
    /// Codes are signed (`[-2^(n-1), 2^(n-1) - 1]`) instead of unsigned (`[0, 2^n - 1]`).
    pub is_signed: bool,
    /// The zero point is pinned to 0.
    pub is_symmetric: bool,
    /// Parameters come from quantization aware training rather than from calibration.
    pub is_qat: bool,
}

impl QuantizationOptions {
    pub fn signed() -> Self {
        QuantizationOptions {
            is_signed: true,
            ..Default::default()
        }
    }

    pub fn qat(mut self) -> Self {
        self.is_qat = true;
        self
    }
}

/// Float range observed during calibration.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct MinMaxStats {
    pub rmin: f64,
    pub rmax: f64,
}

/// Scale and zero point of an affine mapping.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct QuantizationParams {
    pub scale: f64,
    pub zero_point: i64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UniformQuantizer {
    pub n_bits: u32,
    pub options: QuantizationOptions,
    pub stats: Option<MinMaxStats>,
    pub params: QuantizationParams,
}

impl UniformQuantizer {
    pub fn new(n_bits: u32, options: QuantizationOptions, params: QuantizationParams) -> Self {
        UniformQuantizer {
            n_bits,
            options,
            stats: None,
            params,
        }
    }

    /// Unsigned quantizer with explicit scale and zero point.
    pub fn with_scale(n_bits: u32, scale: f64, zero_point: i64) -> Self {
        Self::new(
            n_bits,
            QuantizationOptions::default(),
            QuantizationParams { scale, zero_point },
        )
    }

    /// Fit scale and zero point so that `[rmin, rmax]` (widened to include 0) spans the
    /// integer range.
    pub fn from_stats(n_bits: u32, options: QuantizationOptions, stats: MinMaxStats) -> Self {
        let (qmin, qmax) = Self::int_range(n_bits, options.is_signed);
        let rmin = stats.rmin.min(0.0);
        let rmax = stats.rmax.max(0.0);
        let params = if options.is_symmetric {
            let amax = rmin.abs().max(rmax);
            let scale = if amax == 0.0 { 1.0 } else { amax / qmax as f64 };
            QuantizationParams {
                scale,
                zero_point: 0,
            }
        } else if rmax == rmin {
            QuantizationParams {
                scale: 1.0,
                zero_point: 0,
            }
        } else {
            let scale = (rmax - rmin) / (qmax - qmin) as f64;
            let zero_point = (qmin as f64 - rmin / scale).round_ties_even() as i64;
            QuantizationParams {
                scale,
                zero_point: zero_point.clamp(qmin, qmax),
            }
        };
        UniformQuantizer {
            n_bits,
            options,
            stats: Some(stats),
            params,
        }
    }

    fn int_range(n_bits: u32, is_signed: bool) -> (i64, i64) {
        // unsupported widths are rejected where quantizers enter a module
        let n_bits = n_bits.clamp(1, 63);
        if is_signed {
            (-(1i64 << (n_bits - 1)), (1i64 << (n_bits - 1)) - 1)
        } else {
            (0, ((1u64 << n_bits) - 1) as i64)
        }
    }

    /// Smallest and largest representable code.
    pub fn range(&self) -> (i64, i64) {
        Self::int_range(self.n_bits, self.options.is_signed)
    }

    pub fn has_supported_bit_width(&self) -> bool {
        SUPPORTED_N_BITS.contains(&self.n_bits)
    }

    /// Whether the scale can map a float range onto the integer grid. QAT imports that
    /// fail to find a unique scale end up with a zero or non-finite one.
    pub fn has_meaningful_scale(&self) -> bool {
        self.params.scale.is_finite() && self.params.scale > 0.0
    }

    pub fn quant_value(&self, value: f64) -> i64 {
        let (qmin, qmax) = self.range();
        let q = (value / self.params.scale + self.params.zero_point as f64).round_ties_even();
        // NaN casts to 0 before clamping
        (q as i64).clamp(qmin, qmax)
    }

    pub fn dequant_value(&self, qvalue: i64) -> f64 {
        self.params.scale * (qvalue as f64 - self.params.zero_point as f64)
    }

    pub fn quant(&self, values: &Tensor<f64>) -> Tensor<i64> {
        values.map(|&v| self.quant_value(v))
    }

    pub fn dequant(&self, qvalues: &Tensor<i64>) -> Tensor<f64> {
        qvalues.map(|&q| self.dequant_value(q))
    }
}

impl Default for UniformQuantizer {
    fn default() -> Self {
        Self::with_scale(DEFAULT_N_BITS, 1.0, 0)
    }
}
