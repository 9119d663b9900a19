use crate::{
    backend::{
        mock::{MockCircuit, MockCompiler},
        BackendError, EncryptionStatus, FheCircuit, FheCompiler,
    },
    config::{CompileOptions, ConfigError, Configuration, ResolvedCompileOptions},
    error::FheError,
    fhe_module::{predict, Execution, FheMode, FheModel, FheModule, ForwardProxy, InputSet},
};
use atlas_quant::{
    model::{
        test::{identity_module, mlp_module, qat_module, signed_quantizer, ModuleBuilder},
        ErrorKind, ModuleError, QatFaults, QuantizedModule,
    },
    tensor::{DynTensor, QuantizedTensor, Tensor},
    utils::quantize::UniformQuantizer,
};
use common::consts::{DEFAULT_P_ERROR_PBS, MAX_BITWIDTH};
use rand::{rngs::StdRng, Rng, SeedableRng};
use regex::Regex;
use std::{
    collections::BTreeMap,
    sync::atomic::{AtomicUsize, Ordering},
};

/// Counts how often the backend is reached.
#[derive(Default)]
struct CountingCompiler {
    calls: AtomicUsize,
}

impl FheCompiler for CountingCompiler {
    type Circuit = MockCircuit;

    fn compile(
        &self,
        function: ForwardProxy,
        encryption: &BTreeMap<String, EncryptionStatus>,
        inputset: InputSet,
        options: &ResolvedCompileOptions,
    ) -> Result<MockCircuit, BackendError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        MockCompiler.compile(function, encryption, inputset, options)
    }
}

/// `sum = x + y` on unsigned codes with unit scale.
fn add_module() -> QuantizedModule {
    let mut b = ModuleBuilder::new();
    let x = b.input("x", UniformQuantizer::with_scale(8, 1.0, 0));
    let y = b.input("y", UniformQuantizer::with_scale(8, 1.0, 0));
    let sum = b.add("sum", &x, &y, UniformQuantizer::with_scale(9, 1.0, 0));
    b.mark_output(&sum);
    b.build().unwrap()
}

/// Sample `i` of the returned `[n, 2]` tensor holds `[i, i + 100]`.
fn index_tagged(n: usize) -> Tensor<f64> {
    let data = (0..n).flat_map(|i| [i as f64, i as f64 + 100.0]).collect();
    Tensor::construct(data, vec![n, 2])
}

fn random_inputs(rng: &mut StdRng, n: usize, width: usize) -> Tensor<f64> {
    let data = (0..n * width).map(|_| rng.gen_range(-1.0..1.0)).collect();
    Tensor::construct(data, vec![n, width])
}

fn compiled(module: QuantizedModule, inputs: &[Tensor<f64>]) -> FheModule<MockCircuit> {
    let mut fhe = FheModule::new(module);
    let inputs: Vec<DynTensor> = inputs.iter().cloned().map(Into::into).collect();
    fhe.compile(&MockCompiler, &inputs, &CompileOptions::default())
        .unwrap();
    fhe
}

#[test]
fn test_simulate_and_execute_preserve_sample_order() {
    let x = index_tagged(17);
    let fhe = compiled(identity_module(), &[x.clone()]);
    let q = fhe.module().quantize_input(&[x]).unwrap();

    let simulated = fhe.forward_in_fhe(&q, FheMode::Simulate).unwrap();
    let executed = fhe.forward_in_fhe(&q, FheMode::Execute).unwrap();
    assert_eq!(simulated.dims(), &[17, 2]);
    assert_eq!(simulated, q[0]);
    assert_eq!(executed, simulated);

    let circuit = fhe.check_model_is_compiled().unwrap();
    assert_eq!(circuit.simulate_calls(), 17);
    assert_eq!(circuit.execute_calls(), 17);
}

#[test]
fn test_multi_input_samples_stay_aligned() {
    let x = index_tagged(6);
    let y = Tensor::construct((0..12).map(|i| (i % 2) as f64).collect(), vec![6, 2]);
    let fhe = compiled(add_module(), &[x.clone(), y.clone()]);
    let circuit = fhe.check_model_is_compiled().unwrap();
    assert_eq!(circuit.inputset_len(), 6);

    let q = fhe.module().quantize_input(&[x, y]).unwrap();
    let out = fhe.forward_in_fhe(&q, FheMode::Simulate).unwrap();
    assert_eq!(out, fhe.module().forward_quantized(&q).unwrap());
    assert_eq!(out.sample(3).unwrap().data(), &[3, 104]);
}

#[test]
fn test_not_compiled_is_a_state_error() {
    let fhe: FheModule<MockCircuit> = FheModule::new(identity_module());
    let q = vec![Tensor::construct(vec![1, 2], vec![2, 1])];
    let err = fhe.forward_in_fhe(&q, FheMode::Simulate).unwrap_err();
    assert_eq!(err, FheError::NotCompiled);
    assert_eq!(err.kind(), ErrorKind::State);
    assert!(err.to_string().contains("compile"));
    assert_eq!(fhe.bitwidth_and_range_report().unwrap(), None);
    assert!(!fhe.is_compiled());
}

#[test]
fn test_report_omits_fused_operators() {
    let mut rng = StdRng::seed_from_u64(42);
    let module = mlp_module(&mut rng);
    let x = random_inputs(&mut rng, 32, 4);
    let fhe = compiled(module, &[x]);

    let report = fhe.bitwidth_and_range_report().unwrap().unwrap();
    let tags: Vec<&str> = report.keys().map(String::as_str).collect();
    assert_eq!(tags, vec!["act1", "fc1", "fc2"]);
    for entry in report.values() {
        assert!(entry.range.0 <= entry.range.1);
        assert!((1..=MAX_BITWIDTH as i32).contains(&entry.bitwidth));
    }
    // ReLU codes are unsigned and carry no accumulator
    assert!(report["act1"].range.0 >= 0);
    assert!(report["act1"].bitwidth <= 8);
}

/// `fc1` scales its accumulators down by 4 and `fc10` multiplies by 7.
fn chained_gemm_module() -> QuantizedModule {
    let weights = |w: i64| {
        QuantizedTensor::new(
            Tensor::construct(vec![w, 0, 0, w], vec![2, 2]),
            signed_quantizer(4, 1.0),
        )
        .unwrap()
    };
    let mut b = ModuleBuilder::new();
    let x = b.input("x", signed_quantizer(8, 1.0));
    let h = b.gemm("fc1", &x, None, weights(1), signed_quantizer(8, 4.0));
    let y = b.gemm("fc10", &h, None, weights(7), signed_quantizer(8, 1.0));
    b.mark_output(&y);
    b.build().unwrap()
}

#[test]
fn test_report_merges_sub_tags_of_each_operator() {
    let x = Tensor::construct(vec![0.0, 1.0, 4.0, 3.0, 1.0, 1.0, 3.0, 0.0], vec![4, 2]);
    let fhe = compiled(chained_gemm_module(), &[x]);
    let circuit = fhe.check_model_is_compiled().unwrap();
    let range = |pattern: &str| circuit.integer_range(&Regex::new(pattern).unwrap());
    assert_eq!(range(r"^fc1$"), Some((0, 1)));
    assert_eq!(range(r"^fc1\.matmul$"), Some((0, 4)));
    assert_eq!(range(r"^fc10$"), Some((0, 28)));
    assert_eq!(range(r"^fc10\.matmul$"), Some((0, 7)));

    let report = fhe.bitwidth_and_range_report().unwrap().unwrap();
    assert_eq!(report.len(), 2);
    // the accumulator widens fc1, while fc10 stays out of it
    assert_eq!(report["fc1"].range, (0, 4));
    assert_eq!(report["fc1"].bitwidth, 3);
    assert_eq!(report["fc10"].range, (0, 28));
    assert_eq!(report["fc10"].bitwidth, 5);
}

#[test]
fn test_compile_passes_resolved_options_and_roles() {
    let x = index_tagged(4);
    let fhe = compiled(identity_module(), &[x]);
    let circuit = fhe.check_model_is_compiled().unwrap();
    assert_eq!(circuit.options().p_error, Some(DEFAULT_P_ERROR_PBS));
    assert_eq!(circuit.options().global_p_error, None);
    assert_eq!(
        circuit.encryption(),
        &BTreeMap::from([("x".to_string(), EncryptionStatus::Encrypted)])
    );
}

#[test]
fn test_config_conflict_fails_before_backend() {
    let compiler = CountingCompiler::default();
    let mut fhe = FheModule::new(identity_module());
    let options = CompileOptions::default()
        .with_configuration(Configuration {
            p_error: Some(0.01),
            ..Default::default()
        })
        .with_global_p_error(0.1);
    let err = fhe
        .compile(&compiler, &[index_tagged(3).into()], &options)
        .unwrap_err();
    assert_eq!(err, FheError::Config(ConfigError::PErrorInConfiguration));
    assert_eq!(err.kind(), ErrorKind::Config);
    assert_eq!(compiler.calls.load(Ordering::Relaxed), 0);
    assert!(!fhe.is_compiled());
}

#[test]
fn test_compile_validates_calibration_data() {
    let mut fhe = FheModule::new(add_module());
    let x: DynTensor = index_tagged(3).into();
    let short: DynTensor = index_tagged(2).into();
    assert_eq!(
        fhe.compile(&MockCompiler, &[x.clone(), short], &CompileOptions::default())
            .unwrap_err(),
        FheError::MismatchedDatasetLengths(vec![3, 2])
    );

    let codes: DynTensor = Tensor::construct(vec![1i64; 6], vec![3, 2]).into();
    let err = fhe
        .compile(&MockCompiler, &[x.clone(), codes], &CompileOptions::default())
        .unwrap_err();
    assert_eq!(err, FheError::AlreadyQuantized(vec![1]));
    assert_eq!(err.kind(), ErrorKind::Value);

    let err = fhe
        .compile(&MockCompiler, &[x], &CompileOptions::default())
        .unwrap_err();
    assert_eq!(
        err,
        FheError::Module(ModuleError::InputCount {
            got: 1,
            expected: 2
        })
    );
    assert_eq!(err.kind(), ErrorKind::Type);

    assert_eq!(
        fhe.compile(&MockCompiler, &[], &CompileOptions::default())
            .unwrap_err(),
        FheError::EmptyInputs
    );
}

#[test]
fn test_qat_module_compiles_only_without_faults() {
    let x = Tensor::construct(vec![0.5, -0.25, 1.0, 0.0, 0.3, 0.2], vec![3, 2]);
    let fhe = compiled(qat_module(&[]), &[x.clone()]);
    let q = fhe.module().quantize_input(&[x.clone()]).unwrap();
    assert!(fhe.forward_in_fhe(&q, FheMode::Execute).is_ok());

    let mut fhe = FheModule::<MockCircuit>::new(qat_module(&["hidden"]));
    let err = fhe
        .compile(&MockCompiler, &[x.into()], &CompileOptions::default())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Value);
    let FheError::Backend(BackendError::Module(ModuleError::Qat(QatFaults(faults)))) = &err else {
        panic!("expected a QAT error, got {err}");
    };
    assert_eq!(faults.len(), 1);
    assert_eq!(faults[0].tensor, "hidden");
}

#[test]
fn test_recompile_replaces_circuit() {
    let mut fhe = compiled(identity_module(), &[index_tagged(2)]);
    assert_eq!(fhe.check_model_is_compiled().unwrap().inputset_len(), 2);
    fhe.compile(
        &MockCompiler,
        &[index_tagged(5).into()],
        &CompileOptions::default().with_simulation(true),
    )
    .unwrap();
    let circuit = fhe.check_model_is_compiled().unwrap();
    assert_eq!(circuit.inputset_len(), 5);
    assert!(circuit.options().simulate);
}

/// Thresholds dequantized outputs using a parameter stored on the module.
struct ThresholdModel {
    inner: FheModule<MockCircuit>,
}

impl FheModel for ThresholdModel {
    type Circuit = MockCircuit;

    fn quantized_module(&self) -> &QuantizedModule {
        self.inner.module()
    }

    fn fhe_circuit(&self) -> Option<&MockCircuit> {
        self.inner.fhe_circuit()
    }

    fn post_processing(&self, values: Tensor<f64>) -> Tensor<f64> {
        let threshold = self
            .quantized_module()
            .post_processing_params()
            .get("threshold")
            .and_then(|v| v.as_f64())
            .unwrap_or(0.0);
        values.map(|&v| if v > threshold { 1.0 } else { 0.0 })
    }
}

#[test]
fn test_predict_in_clear_and_fhe_agree() {
    let mut rng = StdRng::seed_from_u64(5);
    let mut module = mlp_module(&mut rng);
    let mut params = serde_json::Map::new();
    params.insert("threshold".into(), serde_json::json!(0.0));
    module.set_post_processing_params(params);

    let x = random_inputs(&mut rng, 8, 4);
    let model = ThresholdModel {
        inner: FheModule::new(module),
    };
    assert_eq!(
        predict(&model, &[x.clone()], Execution::Fhe(FheMode::Simulate)).unwrap_err(),
        FheError::NotCompiled
    );

    let model = ThresholdModel {
        inner: compiled(model.inner.module().clone(), &[x.clone()]),
    };
    let clear = predict(&model, &[x.clone()], Execution::Clear).unwrap();
    let fhe = predict(&model, &[x.clone()], Execution::Fhe(FheMode::Execute)).unwrap();
    assert_eq!(clear, fhe);
    assert_eq!(clear.dims(), &[8, 2]);
    assert!(clear.iter().all(|&v| v == 0.0 || v == 1.0));

    // the default post-processing is the identity
    let plain = predict(&model.inner, &[x.clone()], Execution::Clear).unwrap();
    let q = model.inner.module().quantize_input(&[x]).unwrap();
    let expected = model
        .inner
        .module()
        .dequantize_output(&model.inner.module().forward_quantized(&q).unwrap());
    assert_eq!(plain, expected);
}
