//! Items shared by the quantized graph crate and the FHE driver.

pub mod consts;
pub mod utils;
