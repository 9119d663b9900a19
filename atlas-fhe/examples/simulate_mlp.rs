use atlas_fhe::{
    backend::mock::MockCompiler,
    config::CompileOptions,
    fhe_module::{FheMode, FheModule},
};
use atlas_quant::{model::test::mlp_module, tensor::Tensor};
use common::utils::logging::{setup_tracing, TracingMode};
use rand::{rngs::StdRng, Rng, SeedableRng};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _guard = setup_tracing(
        "simulate MLP",
        TracingMode::from_args(std::env::args()),
    );
    let mut rng = StdRng::seed_from_u64(0x100);
    let module = mlp_module(&mut rng);

    let n_samples = 64;
    let calibration: Vec<f64> = (0..n_samples * 4).map(|_| rng.gen_range(-1.0..1.0)).collect();
    let calibration = Tensor::construct(calibration, vec![n_samples, 4]);

    let mut fhe = FheModule::new(module);
    let options = CompileOptions::default().with_simulation(true);
    fhe.compile(&MockCompiler, &[calibration.clone().into()], &options)?;

    let q = fhe.module().quantize_input(&[calibration])?;
    let clear = fhe.module().forward_quantized(&q)?;
    let simulated = fhe.forward_in_fhe(&q, FheMode::Simulate)?;
    println!("simulation matches clear execution: {}", clear == simulated);

    if let Some(report) = fhe.bitwidth_and_range_report()? {
        for (tag, entry) in report {
            println!("{tag}: range {:?}, {} bits", entry.range, entry.bitwidth);
        }
    }
    Ok(())
}
