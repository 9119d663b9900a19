use super::FheModule;
use crate::{backend::FheCircuit, error::FheError};
use atlas_quant::tensor::Tensor;
use rayon::prelude::*;

/// Which circuit entry point evaluates each sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FheMode {
    /// Approximate the encrypted computation in the clear.
    #[default]
    Simulate,
    /// Encrypt, run and decrypt.
    Execute,
}

impl<C: FheCircuit> FheModule<C> {
    /// Run quantized inputs through the compiled circuit, one sample at a time.
    ///
    /// Results are concatenated along the leading dimension in input order.
    #[tracing::instrument(name = "FheModule::forward_in_fhe", skip_all)]
    pub fn forward_in_fhe(
        &self,
        qvalues: &[Tensor<i64>],
        mode: FheMode,
    ) -> Result<Tensor<i64>, FheError> {
        let circuit = self.check_model_is_compiled()?;
        self.module.check_input_count(qvalues.len())?;
        run_per_sample(circuit, qvalues, mode)
    }
}

/// Slice sample `i` out of every input, evaluate it on `circuit` and concatenate the
/// results in sample order.
pub fn run_per_sample<C: FheCircuit>(
    circuit: &C,
    qvalues: &[Tensor<i64>],
    mode: FheMode,
) -> Result<Tensor<i64>, FheError> {
    let n_samples = qvalues.first().ok_or(FheError::EmptyInputs)?.batch_size()?;
    let lengths = qvalues
        .iter()
        .map(Tensor::batch_size)
        .collect::<Result<Vec<_>, _>>()?;
    if lengths.iter().any(|&len| len != n_samples) {
        return Err(FheError::MismatchedDatasetLengths(lengths));
    }
    tracing::debug!(samples = n_samples, ?mode, "running circuit");

    let results = (0..n_samples)
        .into_par_iter()
        .map(|i| -> Result<Tensor<i64>, FheError> {
            let sample = qvalues
                .iter()
                .map(|q| q.sample(i))
                .collect::<Result<Vec<_>, _>>()?;
            let result = match mode {
                FheMode::Simulate => circuit.simulate(&sample)?,
                FheMode::Execute => circuit.encrypt_run_decrypt(&sample)?,
            };
            Ok(result)
        })
        .collect::<Result<Vec<_>, FheError>>()?;

    Ok(Tensor::concat_batch(&results)?)
}
