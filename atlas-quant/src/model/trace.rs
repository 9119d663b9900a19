//! Helpers for tracing module execution and inspecting per-node tensors.

use crate::{
    model::{ModuleError, QuantizedModule},
    node::ComputationNode,
    tensor::{OpValue, Tensor},
};
use std::{collections::BTreeMap, ops::Index};

impl QuantizedModule {
    /// Execute the graph and capture every tensor it produces, module inputs included.
    pub fn trace(&self, qvalues: &[Tensor<i64>]) -> Result<Trace, ModuleError> {
        Ok(Trace::new(self.execute_graph(qvalues, None)?))
    }
}

/// Captures intermediate tensors from a module run, keyed by tensor name.
#[derive(Debug, Clone)]
pub struct Trace {
    pub node_outputs: BTreeMap<String, OpValue>,
}

impl Trace {
    pub fn new(node_outputs: BTreeMap<String, OpValue>) -> Self {
        Self { node_outputs }
    }

    /// Build a view of a specific node, including its inputs and output.
    pub fn layer_data<'a>(&'a self, computation_node: &'a ComputationNode) -> LayerData<'a> {
        LayerData {
            computation_node,
            layer_output: &self[computation_node.output.as_str()],
            input_tensors: self.input_tensors(computation_node),
        }
    }

    /// Inputs feeding the node, `None` where an optional input was never produced.
    pub fn input_tensors(&self, computation_node: &ComputationNode) -> Vec<Option<&OpValue>> {
        computation_node
            .inputs
            .iter()
            .map(|name| self.node_outputs.get(name))
            .collect()
    }
}

impl Index<&str> for Trace {
    type Output = OpValue;

    fn index(&self, name: &str) -> &Self::Output {
        &self.node_outputs[name]
    }
}

/// Metadata, inputs, and output for a single computation node.
pub struct LayerData<'a> {
    pub computation_node: &'a ComputationNode,
    pub layer_output: &'a OpValue,
    pub input_tensors: Vec<Option<&'a OpValue>>,
}

/// What one operator received during a debug forward pass.
#[derive(Debug, Clone, PartialEq)]
pub struct OpDebugRecord {
    /// Raw inputs by tensor name, in argument order.
    pub inputs: Vec<(String, Option<OpValue>)>,
    /// The float values the kernel computed with, after dequantization.
    pub prepared: Vec<Option<Tensor<f64>>>,
}

/// Operator inputs of one debug forward pass, keyed by operator tag.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DebugTrace(BTreeMap<String, OpDebugRecord>);

impl DebugTrace {
    pub(crate) fn record(
        &mut self,
        node: &ComputationNode,
        inputs: &[Option<&OpValue>],
        prepared: Vec<Option<Tensor<f64>>>,
    ) {
        let inputs = node
            .inputs
            .iter()
            .cloned()
            .zip(inputs.iter().map(|value| value.cloned()))
            .collect();
        self.0
            .insert(node.tag.clone(), OpDebugRecord { inputs, prepared });
    }

    pub fn get(&self, tag: &str) -> Option<&OpDebugRecord> {
        self.0.get(tag)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &OpDebugRecord)> {
        self.0.iter()
    }
}

impl Index<&str> for DebugTrace {
    type Output = OpDebugRecord;

    fn index(&self, tag: &str) -> &Self::Output {
        &self.0[tag]
    }
}

#[cfg(test)]
mod tests {
    use crate::{model::test::mlp_module, tensor::OpValue};
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn test_trace_exposes_every_layer() {
        let mut rng = StdRng::seed_from_u64(3);
        let module = mlp_module(&mut rng);
        let x = crate::tensor::Tensor::construct(vec![0.5; 8], vec![2, 4]);
        let q = module.quantize_input(&[x]).unwrap();
        let trace = module.trace(&q).unwrap();

        for node in module.nodes() {
            let layer = trace.layer_data(node);
            assert_eq!(layer.input_tensors.len(), node.inputs.len());
        }
        let out = module.forward_quantized(&q).unwrap();
        match &trace[module.output_name()] {
            OpValue::Quantized(t) => assert_eq!(t.qvalues(), &out),
            OpValue::Float(_) => panic!("output must be quantized"),
        }
    }
}
