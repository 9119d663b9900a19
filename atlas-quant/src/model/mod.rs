use crate::{
    node::ComputationNode,
    ops::Op,
    tensor::Tensor,
    utils::quantize::UniformQuantizer,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;

pub mod error;
/// Functions for executing the graph on quantized inputs.
pub mod execute;
pub mod trace;

pub use error::{ErrorKind, ModuleError, QatFault, QatFaults};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// Inference for a quantized model.
///
/// The graph is an ordered list of [`ComputationNode`]s. The order is a topological
/// order: every node only reads module inputs and outputs of earlier nodes, except for
/// inputs its operator declares optional. Exactly one output is supported.
///
/// Input quantizers are bound with [`QuantizedModule::set_input_quantizers`]; the output
/// quantizer is taken from the calibrated operator producing the output.
pub struct QuantizedModule {
    input_names: Vec<String>,
    output_names: Vec<String>,
    nodes: Vec<ComputationNode>,
    input_quantizers: Vec<UniformQuantizer>,
    output_quantizers: Vec<UniformQuantizer>,
    post_processing_params: Map<String, Value>,
}

impl QuantizedModule {
    /// Build a module from its declared inputs, its output and its nodes.
    ///
    /// # Errors
    ///
    /// Fails if the graph is not in topological order, names a tensor twice, reuses an
    /// operator tag, declares anything but a single output, if that output is not
    /// produced by a quantizing operator, or if an operator quantizer has an unsupported
    /// bit-width.
    #[tracing::instrument(name = "QuantizedModule::new", skip_all)]
    pub fn new<I, O, S, T>(
        input_names: I,
        output_names: O,
        nodes: Vec<ComputationNode>,
    ) -> Result<Self, ModuleError>
    where
        I: IntoIterator<Item = S>,
        O: IntoIterator<Item = T>,
        S: Into<String>,
        T: Into<String>,
    {
        let mut module = QuantizedModule {
            input_names: input_names.into_iter().map(Into::into).collect(),
            output_names: output_names.into_iter().map(Into::into).collect(),
            nodes,
            input_quantizers: Vec::new(),
            output_quantizers: Vec::new(),
            post_processing_params: Map::new(),
        };
        module.output_quantizers = module.validate()?;
        tracing::debug!(
            nodes = module.nodes.len(),
            inputs = module.input_names.len(),
            "built quantized module"
        );
        Ok(module)
    }

    /// Check the graph invariants and return the output quantizers.
    fn validate(&self) -> Result<Vec<UniformQuantizer>, ModuleError> {
        if self.output_names.len() != 1 {
            return Err(ModuleError::OutputCount(self.output_names.len()));
        }

        let mut known: HashSet<&str> = HashSet::new();
        for name in &self.input_names {
            if !known.insert(name) {
                return Err(ModuleError::DuplicateTensor(name.clone()));
            }
        }

        let mut tags: HashSet<&str> = HashSet::new();
        for node in &self.nodes {
            let arity = node.operator.arity();
            if !arity.contains(&node.inputs.len()) {
                return Err(ModuleError::NodeArity {
                    node: node.output.clone(),
                    op_type: node.operator.op_type(),
                    expected: arity,
                    got: node.inputs.len(),
                });
            }
            let optional = node.operator.optional_inputs();
            for (idx, input) in node.inputs.iter().enumerate() {
                if !known.contains(input.as_str()) && !optional.contains(&idx) {
                    return Err(ModuleError::UnresolvedInput {
                        node: node.output.clone(),
                        input: input.clone(),
                    });
                }
            }
            if !known.insert(&node.output) {
                return Err(ModuleError::DuplicateTensor(node.output.clone()));
            }
            if !tags.insert(&node.tag) {
                return Err(ModuleError::DuplicateTag(node.tag.clone()));
            }
            for quantizer in node.operator.quantizers() {
                check_bit_width(&node.output, quantizer)?;
            }
        }

        self.output_names
            .iter()
            .map(|name| {
                let node = self
                    .nodes
                    .iter()
                    .find(|node| &node.output == name)
                    .ok_or_else(|| ModuleError::UnknownOutput(name.clone()))?;
                node.operator
                    .output_quantizer()
                    .cloned()
                    .ok_or_else(|| ModuleError::OutputNotQuantized(name.clone()))
            })
            .collect()
    }

    /// Replace the input quantizers. The module keeps its own copies.
    ///
    /// # Errors
    ///
    /// [`ModuleError::InputCount`] if the count differs from the declared inputs,
    /// [`ModuleError::UnsupportedBitWidth`] if a width is outside
    /// [`SUPPORTED_N_BITS`](crate::utils::quantize::SUPPORTED_N_BITS).
    pub fn set_input_quantizers(
        &mut self,
        quantizers: &[UniformQuantizer],
    ) -> Result<(), ModuleError> {
        if quantizers.len() != self.input_names.len() {
            return Err(ModuleError::InputCount {
                got: quantizers.len(),
                expected: self.input_names.len(),
            });
        }
        for (name, quantizer) in self.input_names.iter().zip(quantizers) {
            check_bit_width(name, quantizer)?;
        }
        self.input_quantizers = quantizers.to_vec();
        Ok(())
    }

    /// Builder-style [`set_input_quantizers`](Self::set_input_quantizers).
    pub fn with_input_quantizers(
        mut self,
        quantizers: &[UniformQuantizer],
    ) -> Result<Self, ModuleError> {
        self.set_input_quantizers(quantizers)?;
        Ok(self)
    }

    /// Quantize float inputs with the bound input quantizers.
    pub fn quantize_input(&self, values: &[Tensor<f64>]) -> Result<Vec<Tensor<i64>>, ModuleError> {
        self.check_input_count(values.len())?;
        Ok(values
            .iter()
            .zip(&self.input_quantizers)
            .map(|(value, quantizer)| quantizer.quant(value))
            .collect())
    }

    /// Map output codes back to floats with the output quantizer.
    pub fn dequantize_output(&self, qvalues: &Tensor<i64>) -> Tensor<f64> {
        self.output_quantizers[0].dequant(qvalues)
    }

    /// Check that `got` inputs match the declared inputs and that quantizers are bound.
    pub fn check_input_count(&self, got: usize) -> Result<(), ModuleError> {
        let expected = self.input_names.len();
        if got != expected {
            return Err(ModuleError::InputCount { got, expected });
        }
        if self.input_quantizers.len() != expected {
            return Err(ModuleError::UnboundInputQuantizers);
        }
        Ok(())
    }

    pub fn to_json(&self) -> Result<String, ModuleError> {
        serde_json::to_string(self).map_err(|e| ModuleError::Json(e.to_string()))
    }

    /// Load a module serialized with [`to_json`](Self::to_json), re-checking the graph.
    pub fn from_json(json: &str) -> Result<Self, ModuleError> {
        let mut module: QuantizedModule =
            serde_json::from_str(json).map_err(|e| ModuleError::Json(e.to_string()))?;
        module.output_quantizers = module.validate()?;
        let quantizers = std::mem::take(&mut module.input_quantizers);
        if !quantizers.is_empty() {
            module.set_input_quantizers(&quantizers)?;
        }
        Ok(module)
    }
}

fn check_bit_width(tensor: &str, quantizer: &UniformQuantizer) -> Result<(), ModuleError> {
    if quantizer.has_supported_bit_width() {
        Ok(())
    } else {
        Err(ModuleError::UnsupportedBitWidth {
            tensor: tensor.to_string(),
            n_bits: quantizer.n_bits,
        })
    }
}

impl QuantizedModule {
    pub fn input_names(&self) -> &[String] {
        &self.input_names
    }

    pub fn output_names(&self) -> &[String] {
        &self.output_names
    }

    /// The single output tensor name.
    pub fn output_name(&self) -> &str {
        &self.output_names[0]
    }

    pub fn nodes(&self) -> &[ComputationNode] {
        &self.nodes
    }

    pub fn input_quantizers(&self) -> &[UniformQuantizer] {
        &self.input_quantizers
    }

    pub fn output_quantizers(&self) -> &[UniformQuantizer] {
        &self.output_quantizers
    }

    /// Free-form parameters for the model-level post-processing step.
    pub fn post_processing_params(&self) -> &Map<String, Value> {
        &self.post_processing_params
    }

    pub fn set_post_processing_params(&mut self, params: Map<String, Value>) {
        self.post_processing_params = params;
    }
}
