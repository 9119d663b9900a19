/// Probability of error of a single programmable bootstrapping, used when the caller
/// sets neither `p_error` nor `global_p_error`.
pub const DEFAULT_P_ERROR_PBS: f64 = 6.3342483999973e-05;

/// Bit-width used for quantizers built without an explicit width.
pub const DEFAULT_N_BITS: u32 = 8;

/// Widest integer the encrypted backend can represent in a single value.
pub const MAX_BITWIDTH: u32 = 16;
