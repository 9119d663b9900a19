//! A backend that evaluates circuits in the clear.
//!
//! [`MockCompiler`] runs every input set sample through the quantized graph and records
//! the integer range of each tagged operator. Fusable operators leave no tag behind, as
//! they would in a real compiler. A Gemm also records its raw accumulators under the
//! sub-tag `<tag>.matmul`.

use super::{BackendError, EncryptionStatus, FheCircuit, FheCompiler};
use crate::{config::ResolvedCompileOptions, fhe_module::ForwardProxy, fhe_module::InputSet};
use atlas_quant::{
    model::ModuleError,
    ops::{Op, Operator},
    tensor::{OpValue, Tensor},
};
use common::consts::MAX_BITWIDTH;
use itertools::Itertools;
use regex::Regex;
use std::{
    collections::BTreeMap,
    sync::atomic::{AtomicUsize, Ordering},
};

#[derive(Debug, Clone, Default)]
pub struct MockCompiler;

impl FheCompiler for MockCompiler {
    type Circuit = MockCircuit;

    #[tracing::instrument(name = "MockCompiler::compile", skip_all)]
    fn compile(
        &self,
        function: ForwardProxy,
        encryption: &BTreeMap<String, EncryptionStatus>,
        inputset: InputSet,
        options: &ResolvedCompileOptions,
    ) -> Result<MockCircuit, BackendError> {
        let mut ranges: BTreeMap<String, (i64, i64)> = BTreeMap::new();
        let mut inputset_len = 0;
        for sample in inputset {
            let sample = sample?;
            check_single_sample(&sample)?;
            let trace = function.trace(&sample)?;
            for node in function.module().nodes() {
                if node.operator.is_fusable() {
                    continue;
                }
                if let Some(q) = trace.node_outputs[&node.output].as_quantized() {
                    record_range(&mut ranges, &node.tag, q.qvalues().iter());
                }
                // The integer matmul is a sub-operation of the Gemm it belongs to.
                if let Operator::Gemm(gemm) = &node.operator {
                    let x = node
                        .inputs
                        .first()
                        .and_then(|name| trace.node_outputs.get(name))
                        .and_then(OpValue::as_quantized);
                    if let Some(x) = x {
                        let acc = gemm.accumulate(x).map_err(|source| ModuleError::Op {
                            node: node.output.clone(),
                            source,
                        })?;
                        record_range(&mut ranges, &format!("{}.matmul", node.tag), acc.iter());
                    }
                }
            }
            inputset_len += 1;
        }
        if inputset_len == 0 {
            return Err(BackendError::EmptyInputSet);
        }

        if let Some((tag, bits)) = ranges
            .iter()
            .map(|(tag, &range)| (tag, bit_width(range)))
            .find(|&(_, bits)| bits > MAX_BITWIDTH)
        {
            return Err(BackendError::Compilation(format!(
                "{tag} needs {bits} bits, the maximum is {MAX_BITWIDTH}"
            )));
        }
        if options.show_mlir {
            tracing::info!(?ranges, "circuit integer ranges");
        }
        tracing::debug!(samples = inputset_len, tags = ranges.len(), "compiled mock circuit");

        Ok(MockCircuit {
            function,
            encryption: encryption.clone(),
            options: options.clone(),
            ranges,
            inputset_len,
            simulate_calls: AtomicUsize::new(0),
            execute_calls: AtomicUsize::new(0),
        })
    }
}

/// A compiled mock circuit. Both execution modes compute the exact quantized forward.
#[derive(Debug)]
pub struct MockCircuit {
    function: ForwardProxy,
    encryption: BTreeMap<String, EncryptionStatus>,
    options: ResolvedCompileOptions,
    ranges: BTreeMap<String, (i64, i64)>,
    inputset_len: usize,
    simulate_calls: AtomicUsize,
    execute_calls: AtomicUsize,
}

impl MockCircuit {
    fn run(&self, sample: &[Tensor<i64>]) -> Result<Tensor<i64>, BackendError> {
        check_single_sample(sample).map_err(|e| BackendError::Execution(e.to_string()))?;
        Ok(self.function.call(sample)?)
    }

    pub fn encryption(&self) -> &BTreeMap<String, EncryptionStatus> {
        &self.encryption
    }

    pub fn options(&self) -> &ResolvedCompileOptions {
        &self.options
    }

    /// Number of samples the compiler drew from the input set.
    pub fn inputset_len(&self) -> usize {
        self.inputset_len
    }

    pub fn simulate_calls(&self) -> usize {
        self.simulate_calls.load(Ordering::Relaxed)
    }

    pub fn execute_calls(&self) -> usize {
        self.execute_calls.load(Ordering::Relaxed)
    }
}

impl FheCircuit for MockCircuit {
    fn simulate(&self, sample: &[Tensor<i64>]) -> Result<Tensor<i64>, BackendError> {
        self.simulate_calls.fetch_add(1, Ordering::Relaxed);
        self.run(sample)
    }

    fn encrypt_run_decrypt(&self, sample: &[Tensor<i64>]) -> Result<Tensor<i64>, BackendError> {
        self.execute_calls.fetch_add(1, Ordering::Relaxed);
        self.run(sample)
    }

    fn integer_range(&self, pattern: &Regex) -> Option<(i64, i64)> {
        self.ranges
            .iter()
            .filter(|(tag, _)| pattern.is_match(tag))
            .map(|(_, &range)| range)
            .reduce(|(a_min, a_max), (b_min, b_max)| (a_min.min(b_min), a_max.max(b_max)))
    }

    fn maximum_integer_bit_width(&self, pattern: &Regex) -> Option<i32> {
        self.ranges
            .iter()
            .filter(|(tag, _)| pattern.is_match(tag))
            .map(|(_, &range)| bit_width(range) as i32)
            .max()
    }
}

fn record_range<'a>(
    ranges: &mut BTreeMap<String, (i64, i64)>,
    tag: &str,
    values: impl Iterator<Item = &'a i64>,
) {
    let Some((&lo, &hi)) = values.minmax().into_option() else {
        return;
    };
    ranges
        .entry(tag.to_string())
        .and_modify(|(min, max)| {
            *min = (*min).min(lo);
            *max = (*max).max(hi);
        })
        .or_insert((lo, hi));
}

fn check_single_sample(sample: &[Tensor<i64>]) -> Result<(), BackendError> {
    match sample.iter().find(|t| t.dims().first() != Some(&1)) {
        Some(t) => Err(BackendError::Compilation(format!(
            "expected a single sample with leading dim 1, got dims {:?}",
            t.dims()
        ))),
        None => Ok(()),
    }
}

/// Bits needed to hold every integer of `[min, max]`, with a sign bit if `min < 0`.
pub(crate) fn bit_width((min, max): (i64, i64)) -> u32 {
    let unsigned_bits = |v: i64| (64 - (v as u64).leading_zeros()).max(1);
    if min < 0 {
        unsigned_bits(-(min + 1)).max(unsigned_bits(max.max(0))) + 1
    } else {
        unsigned_bits(max)
    }
}
