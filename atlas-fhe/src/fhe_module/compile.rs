use super::FheModule;
use crate::{
    backend::{EncryptionStatus, FheCircuit, FheCompiler},
    config::CompileOptions,
    error::FheError,
};
use atlas_quant::{
    model::{trace::Trace, ModuleError, QuantizedModule},
    tensor::{DynTensor, Tensor, TensorError},
};
use std::collections::{BTreeMap, HashSet};

/// The module forward pass as a function of a fixed number of named arguments.
///
/// Argument names are derived from the module input names, made into identifiers and
/// deduplicated.
#[derive(Debug, Clone)]
pub struct ForwardProxy {
    module: QuantizedModule,
    arg_names: Vec<String>,
}

impl ForwardProxy {
    pub fn new(module: QuantizedModule) -> Self {
        let arg_names = proxy_arg_names(module.input_names());
        ForwardProxy { module, arg_names }
    }

    pub fn arg_names(&self) -> &[String] {
        &self.arg_names
    }

    /// Map from module input name to argument name.
    pub fn input_to_arg(&self) -> BTreeMap<&str, &str> {
        self.module
            .input_names()
            .iter()
            .map(String::as_str)
            .zip(self.arg_names.iter().map(String::as_str))
            .collect()
    }

    pub fn module(&self) -> &QuantizedModule {
        &self.module
    }

    pub fn call(&self, args: &[Tensor<i64>]) -> Result<Tensor<i64>, ModuleError> {
        self.module.forward_quantized(args)
    }

    /// Evaluate and keep every intermediate tensor.
    pub fn trace(&self, args: &[Tensor<i64>]) -> Result<Trace, ModuleError> {
        self.module.trace(args)
    }
}

fn proxy_arg_names(input_names: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    input_names
        .iter()
        .enumerate()
        .map(|(idx, name)| {
            let mut arg: String = name
                .chars()
                .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
                .collect();
            if arg.is_empty() || arg.starts_with(|c: char| c.is_ascii_digit()) {
                arg.insert(0, '_');
            }
            if !seen.insert(arg.clone()) {
                arg = format!("{arg}_{idx}");
                seen.insert(arg.clone());
            }
            arg
        })
        .collect()
}

/// Per-sample argument tuples for the compiler, produced lazily and consumable once.
///
/// Every tensor keeps its leading dimension, with size 1. A sample that cannot be sliced
/// out of the batch is yielded as an error, and iteration goes on with the next one.
#[derive(Debug)]
pub struct InputSet {
    q_inputs: Vec<Tensor<i64>>,
    next: usize,
    len: usize,
}

impl InputSet {
    /// `q_inputs` must all have `len` samples along the leading dimension.
    pub(crate) fn new(q_inputs: Vec<Tensor<i64>>, len: usize) -> Self {
        InputSet {
            q_inputs,
            next: 0,
            len,
        }
    }
}

impl Iterator for InputSet {
    type Item = Result<Vec<Tensor<i64>>, TensorError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.len {
            return None;
        }
        let idx = self.next;
        self.next += 1;
        Some(self.q_inputs.iter().map(|q| q.sample(idx)).collect())
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.len - self.next;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for InputSet {}

impl<C: FheCircuit> FheModule<C> {
    /// Compile the module forward pass with `compiler`.
    ///
    /// `inputs` are float calibration data, one tensor per module input, all with the
    /// same number of samples. They are quantized with the module's input quantizers.
    /// A previous circuit is replaced.
    #[tracing::instrument(name = "FheModule::compile", skip_all)]
    pub fn compile<B>(
        &mut self,
        compiler: &B,
        inputs: &[DynTensor],
        options: &CompileOptions,
    ) -> Result<&C, FheError>
    where
        B: FheCompiler<Circuit = C>,
    {
        let options = options.resolve()?;

        let ref_len = inputs.first().ok_or(FheError::EmptyInputs)?.batch_size()?;
        let lengths = inputs
            .iter()
            .map(DynTensor::batch_size)
            .collect::<Result<Vec<_>, _>>()?;
        if lengths.iter().any(|&len| len != ref_len) {
            return Err(FheError::MismatchedDatasetLengths(lengths));
        }

        let integer_inputs: Vec<usize> = inputs
            .iter()
            .enumerate()
            .filter(|(_, input)| input.dtype().is_integer())
            .map(|(idx, _)| idx)
            .collect();
        if !integer_inputs.is_empty() {
            return Err(FheError::AlreadyQuantized(integer_inputs));
        }

        let proxy = ForwardProxy::new(self.module.clone());
        let encryption: BTreeMap<String, EncryptionStatus> = proxy
            .arg_names()
            .iter()
            .map(|name| (name.clone(), EncryptionStatus::Encrypted))
            .collect();

        let float_inputs: Vec<Tensor<f64>> = inputs.iter().filter_map(DynTensor::to_f64).collect();
        let q_inputs = self.module.quantize_input(&float_inputs)?;
        let inputset = InputSet::new(q_inputs, ref_len);

        tracing::info!(samples = ref_len, inputs = inputs.len(), "compiling module");
        let circuit = compiler.compile(proxy, &encryption, inputset, &options)?;
        Ok(&*self.fhe_circuit.insert(circuit))
    }
}
