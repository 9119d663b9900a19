use super::FheModule;
use crate::{backend::FheCircuit, error::FheError};
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeMap;

/// Integers computed by one operator of the compiled circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OpBitwidthReport {
    /// Smallest and largest value seen.
    pub range: (i64, i64),
    /// Bits needed to represent `range`.
    pub bitwidth: i32,
}

impl<C: FheCircuit> FheModule<C> {
    /// Ranges and bit-widths of the operators that survive in the compiled circuit, keyed
    /// by operator tag. `None` before compilation.
    ///
    /// An operator covers its own tag and any dot-separated sub-tag (`gemm`, `gemm.matmul`).
    /// Fused operators have no tag and are left out.
    #[tracing::instrument(name = "FheModule::bitwidth_and_range_report", skip_all)]
    pub fn bitwidth_and_range_report(
        &self,
    ) -> Result<Option<BTreeMap<String, OpBitwidthReport>>, FheError> {
        let Some(circuit) = self.fhe_circuit.as_ref() else {
            return Ok(None);
        };

        let mut report = BTreeMap::new();
        for node in self.module.nodes() {
            let pattern = tag_pattern(&node.tag)?;
            let range = circuit.integer_range(&pattern);
            let bitwidth = circuit.maximum_integer_bit_width(&pattern);
            if let (Some(range), Some(bitwidth)) = (range, bitwidth) {
                if bitwidth >= 0 {
                    report.insert(node.tag.clone(), OpBitwidthReport { range, bitwidth });
                }
            }
        }
        Ok(Some(report))
    }
}

fn tag_pattern(tag: &str) -> Result<Regex, regex::Error> {
    Regex::new(&format!(r"^{}(\..*)?$", regex::escape(tag)))
}
