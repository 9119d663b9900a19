//! Quantized modules driven through an encrypted execution backend.
//!
//! - [`FheModule::compile`]: build a circuit from float calibration data
//! - [`FheModule::forward_in_fhe`]: run quantized inputs sample by sample on the circuit
//! - [`FheModule::bitwidth_and_range_report`]: integer ranges per operator after compilation
//! - [`predict`]: the client flow from float inputs to post-processed float outputs

use crate::{backend::FheCircuit, error::FheError};
use atlas_quant::{
    model::QuantizedModule,
    tensor::Tensor,
    utils::quantize::UniformQuantizer,
};

mod compile;
mod report;
mod run;

#[cfg(test)]
mod e2e_tests;

pub use compile::{ForwardProxy, InputSet};
pub use report::OpBitwidthReport;
pub use run::{run_per_sample, FheMode};

/// A model that can be evaluated in the clear or through a compiled circuit.
pub trait FheModel {
    type Circuit: FheCircuit;

    fn quantized_module(&self) -> &QuantizedModule;

    fn fhe_circuit(&self) -> Option<&Self::Circuit>;

    fn input_quantizers(&self) -> &[UniformQuantizer] {
        self.quantized_module().input_quantizers()
    }

    fn output_quantizers(&self) -> &[UniformQuantizer] {
        self.quantized_module().output_quantizers()
    }

    /// Final transform on dequantized outputs. Identity by default.
    fn post_processing(&self, values: Tensor<f64>) -> Tensor<f64> {
        values
    }
}

/// Where [`predict`] evaluates the quantized graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Execution {
    /// The quantized forward in the clear.
    #[default]
    Clear,
    Fhe(FheMode),
}

/// Quantize `values`, evaluate, dequantize and post-process.
#[tracing::instrument(name = "predict", skip_all)]
pub fn predict<M: FheModel>(
    model: &M,
    values: &[Tensor<f64>],
    execution: Execution,
) -> Result<Tensor<f64>, FheError> {
    let module = model.quantized_module();
    let q_values = module.quantize_input(values)?;
    let q_out = match execution {
        Execution::Clear => module.forward_quantized(&q_values)?,
        Execution::Fhe(mode) => {
            let circuit = model.fhe_circuit().ok_or(FheError::NotCompiled)?;
            run_per_sample(circuit, &q_values, mode)?
        }
    };
    Ok(model.post_processing(module.dequantize_output(&q_out)))
}

/// A [`QuantizedModule`] together with the circuit compiled from it.
#[derive(Debug)]
pub struct FheModule<C> {
    module: QuantizedModule,
    fhe_circuit: Option<C>,
}

impl<C: FheCircuit> FheModule<C> {
    pub fn new(module: QuantizedModule) -> Self {
        FheModule {
            module,
            fhe_circuit: None,
        }
    }

    pub fn module(&self) -> &QuantizedModule {
        &self.module
    }

    /// Mutable access to the graph, e.g. to rebind input quantizers. Compile again
    /// afterwards; the current circuit is kept as is.
    pub fn module_mut(&mut self) -> &mut QuantizedModule {
        &mut self.module
    }

    pub fn is_compiled(&self) -> bool {
        self.fhe_circuit.is_some()
    }

    /// The compiled circuit, or [`FheError::NotCompiled`].
    pub fn check_model_is_compiled(&self) -> Result<&C, FheError> {
        self.fhe_circuit.as_ref().ok_or(FheError::NotCompiled)
    }
}

impl<C: FheCircuit> FheModel for FheModule<C> {
    type Circuit = C;

    fn quantized_module(&self) -> &QuantizedModule {
        &self.module
    }

    fn fhe_circuit(&self) -> Option<&C> {
        self.fhe_circuit.as_ref()
    }
}
