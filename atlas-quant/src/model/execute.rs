use super::{
    trace::DebugTrace, ModuleError, QatFault, QatFaults, QuantizedModule,
};
use crate::{
    ops::{Op, OpContext},
    tensor::{DynTensor, OpValue, QuantizedTensor, Tensor},
};
use std::collections::BTreeMap;

impl QuantizedModule {
    /// Run the graph on quantized inputs and return the output codes.
    ///
    /// # Errors
    ///
    /// [`ModuleError::NonIntegerInputs`] naming every input whose element type is not an
    /// integer, [`ModuleError::InputCount`] on an arity mismatch, and [`ModuleError::Qat`]
    /// listing every QAT fault found in the pass.
    #[tracing::instrument(name = "QuantizedModule::forward", skip_all)]
    pub fn forward(&self, qvalues: &[DynTensor]) -> Result<Tensor<i64>, ModuleError> {
        let qvalues = Self::integer_inputs(qvalues)?;
        self.forward_quantized(&qvalues)
    }

    /// Like [`forward`](Self::forward), also returning the inputs every operator received.
    ///
    /// The trace is local to this call.
    #[tracing::instrument(name = "QuantizedModule::forward_with_debug", skip_all)]
    pub fn forward_with_debug(
        &self,
        qvalues: &[DynTensor],
    ) -> Result<(Tensor<i64>, DebugTrace), ModuleError> {
        let qvalues = Self::integer_inputs(qvalues)?;
        let mut debug = DebugTrace::default();
        let node_outputs = self.execute_graph(&qvalues, Some(&mut debug))?;
        Ok((self.extract_output(node_outputs)?, debug))
    }

    /// Forward pass on `i64` codes, one tensor per declared input.
    pub fn forward_quantized(&self, qvalues: &[Tensor<i64>]) -> Result<Tensor<i64>, ModuleError> {
        let node_outputs = self.execute_graph(qvalues, None)?;
        self.extract_output(node_outputs)
    }

    /// Forward pass followed by dequantization of the output.
    pub fn forward_and_dequant(&self, qvalues: &[DynTensor]) -> Result<Tensor<f64>, ModuleError> {
        let q_out = self.forward(qvalues)?;
        Ok(self.dequantize_output(&q_out))
    }

    fn integer_inputs(qvalues: &[DynTensor]) -> Result<Vec<Tensor<i64>>, ModuleError> {
        let invalid: Vec<_> = qvalues
            .iter()
            .enumerate()
            .filter(|(_, value)| !value.dtype().is_integer())
            .map(|(idx, value)| (idx, value.dtype()))
            .collect();
        if !invalid.is_empty() {
            return Err(ModuleError::NonIntegerInputs(invalid));
        }
        Ok(qvalues.iter().filter_map(DynTensor::to_i64).collect())
    }

    /// Execute every node in order and return all tensors by name.
    ///
    /// QAT faults do not stop the pass; they are collected over the whole graph and
    /// reported together at the end.
    pub(crate) fn execute_graph(
        &self,
        qvalues: &[Tensor<i64>],
        mut debug: Option<&mut DebugTrace>,
    ) -> Result<BTreeMap<String, OpValue>, ModuleError> {
        self.check_input_count(qvalues.len())?;
        let mut layer_results = self.store_inputs(qvalues)?;
        let mut bad_qat_ops = Vec::new();

        for node in &self.nodes {
            let inputs: Vec<Option<&OpValue>> = node
                .inputs
                .iter()
                .map(|name| layer_results.get(name))
                .collect();

            let mut ctx = OpContext::new(debug.is_some());
            let output = node
                .operator
                .f(&inputs, &mut ctx)
                .map_err(|source| ModuleError::Op {
                    node: node.output.clone(),
                    source,
                })?;
            tracing::trace!(node = %node.output, op = node.operator.op_type(), "executed node");

            bad_qat_ops.extend(ctx.qat_faults().iter().map(|&idx| QatFault {
                tensor: node.inputs[idx].clone(),
                op_type: node.operator.op_type(),
            }));
            if let Some(trace) = debug.as_deref_mut() {
                trace.record(node, &inputs, ctx.take_prepared());
            }
            layer_results.insert(node.output.clone(), output);
        }

        if !bad_qat_ops.is_empty() {
            tracing::warn!(faults = bad_qat_ops.len(), "QAT import faults");
            return Err(ModuleError::Qat(QatFaults(bad_qat_ops)));
        }
        Ok(layer_results)
    }

    /// Pair each input code tensor with its quantizer.
    fn store_inputs(
        &self,
        qvalues: &[Tensor<i64>],
    ) -> Result<BTreeMap<String, OpValue>, ModuleError> {
        self.input_names
            .iter()
            .zip(qvalues.iter().zip(&self.input_quantizers))
            .map(|(name, (qvalue, quantizer))| -> Result<_, ModuleError> {
                let q = QuantizedTensor::new(qvalue.clone(), quantizer.clone())?;
                Ok((name.clone(), OpValue::Quantized(q)))
            })
            .collect()
    }

    fn extract_output(
        &self,
        mut node_outputs: BTreeMap<String, OpValue>,
    ) -> Result<Tensor<i64>, ModuleError> {
        let name = self.output_name();
        match node_outputs.remove(name) {
            Some(OpValue::Quantized(q)) => Ok(q.into_qvalues()),
            _ => Err(ModuleError::OutputNotQuantized(name.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        test::{identity_module, mlp_module, qat_module},
        ErrorKind,
    };
    use proptest::prelude::*;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn test_identity_scenario() {
        let module = identity_module();
        let x = Tensor::from(vec![1.0, 2.0, 3.0]);
        let q = module.quantize_input(&[x.clone()]).unwrap();
        assert_eq!(q[0].data(), &[1, 2, 3]);

        let out = module.forward(&[q[0].clone().into()]).unwrap();
        assert_eq!(out.data(), &[1, 2, 3]);
        assert_eq!(module.dequantize_output(&out), x);
        assert_eq!(module.forward_and_dequant(&[q[0].clone().into()]).unwrap(), x);
    }

    #[test]
    fn test_forward_accepts_int32_codes() {
        let module = identity_module();
        let out = module
            .forward(&[Tensor::from(vec![4i32, 5]).into()])
            .unwrap();
        assert_eq!(out.data(), &[4, 5]);
    }

    #[test]
    fn test_forward_rejects_wrong_arity() {
        let module = identity_module();
        let x: DynTensor = Tensor::from(vec![1i64]).into();
        let err = module.forward(&[x.clone(), x]).unwrap_err();
        assert_eq!(err, ModuleError::InputCount { got: 2, expected: 1 });
        assert_eq!(err.kind(), ErrorKind::Type);
    }

    #[test]
    fn test_forward_rejects_out_of_range_codes() {
        let module = identity_module();
        let err = module.forward(&[Tensor::from(vec![256i64]).into()]).unwrap_err();
        assert!(matches!(err, ModuleError::Tensor(_)));
    }

    #[test]
    fn test_qat_clean_module_runs() {
        let module = qat_module(&[]);
        let x = Tensor::construct(vec![0.5, -0.25, 1.0, 0.0], vec![2, 2]);
        let q = module.quantize_input(&[x]).unwrap();
        assert!(module.forward_quantized(&q).is_ok());
    }

    #[test]
    fn test_qat_corrupted_scale_is_reported_once() {
        let module = qat_module(&["hidden"]);
        let x = Tensor::construct(vec![0.5, -0.25, 1.0, 0.0], vec![2, 2]);
        let q = module.quantize_input(&[x]).unwrap();
        let err = module.forward_quantized(&q).unwrap_err();
        let ModuleError::Qat(QatFaults(faults)) = &err else {
            panic!("expected a QAT error, got {err}");
        };
        assert_eq!(
            faults,
            &vec![QatFault {
                tensor: "hidden".to_string(),
                op_type: "ReLU"
            }]
        );
        assert!(err.to_string().contains("* Tensor hidden, input of an ReLU operation"));
    }

    #[test]
    fn test_qat_faults_are_aggregated_over_the_graph() {
        let module = qat_module(&["hidden", "activated"]);
        let x = Tensor::construct(vec![0.5, -0.25, 1.0, 0.0], vec![2, 2]);
        let q = module.quantize_input(&[x]).unwrap();
        let Err(ModuleError::Qat(QatFaults(faults))) = module.forward_quantized(&q) else {
            panic!("expected a QAT error");
        };
        let tensors: Vec<_> = faults.iter().map(|f| f.tensor.as_str()).collect();
        assert_eq!(tensors, vec!["hidden", "activated"]);
    }

    #[test]
    fn test_debug_trace_is_call_local() {
        let mut rng = StdRng::seed_from_u64(7);
        let module = mlp_module(&mut rng);
        let x = Tensor::construct(vec![0.1, 0.2, 0.3, 0.4, -0.1, -0.2, -0.3, -0.4], vec![2, 4]);
        let q: Vec<DynTensor> = module
            .quantize_input(&[x])
            .unwrap()
            .into_iter()
            .map(Into::into)
            .collect();

        let (out, debug) = module.forward_with_debug(&q).unwrap();
        assert_eq!(out, module.forward(&q).unwrap());
        for node in module.nodes() {
            let record = &debug[node.tag.as_str()];
            assert_eq!(record.inputs.len(), node.inputs.len());
            assert_eq!(record.prepared.len(), node.inputs.len());
        }
        // the optional bias of the first layer is never produced
        let gemm = &debug["fc1"];
        assert_eq!(gemm.inputs[1].0, "fc1.bias");
        assert!(gemm.inputs[1].1.is_none());

        let (_, second) = module.forward_with_debug(&q).unwrap();
        assert_eq!(second.len(), debug.len());
    }

    proptest! {
        #[test]
        fn prop_forward_rejects_exactly_the_float_inputs(kinds in proptest::collection::vec(0u8..4, 1..5)) {
            let module = identity_module();
            let inputs: Vec<DynTensor> = kinds
                .iter()
                .map(|kind| match kind {
                    0 => Tensor::from(vec![1i32]).into(),
                    1 => Tensor::from(vec![1i64]).into(),
                    2 => Tensor::from(vec![1.0f32]).into(),
                    _ => Tensor::from(vec![1.0f64]).into(),
                })
                .collect();
            let floats: Vec<usize> = kinds
                .iter()
                .enumerate()
                .filter(|(_, &k)| k >= 2)
                .map(|(idx, _)| idx)
                .collect();
            let result = module.forward(&inputs);
            if floats.is_empty() {
                prop_assert!(!matches!(result, Err(ModuleError::NonIntegerInputs(_))));
            } else {
                let err = result.unwrap_err();
                let msg = err.to_string();
                for idx in &floats {
                    let needle = format!("#{idx} (");
                    prop_assert!(msg.contains(&needle));
                }
                let ModuleError::NonIntegerInputs(listed) = err else {
                    return Err(TestCaseError::fail("wrong error variant"));
                };
                let listed: Vec<usize> = listed.iter().map(|(idx, _)| *idx).collect();
                prop_assert_eq!(listed, floats);
            }
        }

        #[test]
        fn prop_identity_round_trip_within_half_lsb(values in proptest::collection::vec(0.0f64..=255.0, 1..16)) {
            let module = identity_module();
            let x = Tensor::from(values.clone());
            let q = module.quantize_input(&[x]).unwrap();
            let out = module.forward_quantized(&q).unwrap();
            let back = module.dequantize_output(&out);
            let lsb = module.output_quantizers()[0].params.scale;
            for (orig, got) in values.iter().zip(back.iter()) {
                prop_assert!((orig - got).abs() <= lsb / 2.0 + 1e-9);
            }
        }
    }
}
