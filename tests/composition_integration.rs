//! Integration tests for stack composition.
//!
//! Tests cover:
//! - Stack JSON through a directory store into a static merge
//! - A missing adapter in the middle of a stack leaves the others applied
//! - Quantized merges are reproducible for a seed
//! - Dynamic composition agrees with the static merge

use std::collections::HashMap;
use std::path::PathBuf;

use candle_core::{DType, Device, Module, Tensor};
use lora_compose::{
    apply_stack, merge_weight, resolve_stack, Adapter, AdapterFactors, ComposeConfig,
    ComposeError, ComposedLinear, CompositionSession, MemoryStore, MergeOptions, ModelWeights,
    QuantScale, QuantizedWeight, Weight,
};

fn temp_root(label: &str) -> PathBuf {
    let root = std::env::temp_dir().join(format!(
        "lora_compose_it_{label}_{}",
        std::process::id()
    ));
    std::fs::create_dir_all(&root).unwrap();
    root
}

fn tensor(data: &[f32], rows: usize, cols: usize) -> Tensor {
    Tensor::from_vec(data.to_vec(), (rows, cols), &Device::Cpu).unwrap()
}

fn to_vec(t: &Tensor) -> Vec<f32> {
    t.to_dtype(DType::F32)
        .unwrap()
        .flatten_all()
        .unwrap()
        .to_vec1::<f32>()
        .unwrap()
}

fn save_adapter(root: &PathBuf, name: &str, layer: &str, up: Tensor, down: Tensor, alpha: f32) {
    let mut tensors = HashMap::new();
    tensors.insert(format!("{layer}.lora_up.weight"), up);
    tensors.insert(format!("{layer}.lora_down.weight"), down);
    tensors.insert(
        format!("{layer}.alpha"),
        Tensor::new(&[alpha], &Device::Cpu).unwrap(),
    );
    candle_core::safetensors::save(&tensors, root.join(format!("{name}.safetensors"))).unwrap();
}

fn model() -> ModelWeights {
    ModelWeights::new(Device::Cpu)
        .with(
            "unet.proj_in.weight",
            Tensor::zeros((2, 2), DType::F32, &Device::Cpu).unwrap(),
        )
        .with(
            "unet.proj_out.weight",
            Tensor::ones((2, 2), DType::F32, &Device::Cpu).unwrap(),
        )
}

/// A stack of three where the second adapter is missing composes like the
/// first and third alone.
#[test]
fn test_missing_adapter_in_stack_is_skipped() {
    let root = temp_root("partial");
    save_adapter(&root, "first", "lora_unet_unet_proj_in", tensor(&[1.0, 1.0], 2, 1), tensor(&[1.0, 1.0], 1, 2), 1.0);
    save_adapter(&root, "third", "lora_unet_unet_proj_in", tensor(&[1.0, -1.0], 2, 1), tensor(&[0.5, 0.5], 1, 2), 1.0);

    let config = ComposeConfig {
        search_dirs: vec![root.clone()],
        ..ComposeConfig::default()
    };
    config.validate().unwrap();
    let store = config.directory_store(&Device::Cpu);

    let entries = resolve_stack(
        r#"{
            "folders": [{
                "name": "styles",
                "loras": [
                    {"name": "first", "strength": 2.0, "enabled": true, "tags": ["a", "b"]},
                    {"name": "second", "strength": 1.0, "enabled": true, "tag": "lost"}
                ]
            }],
            "loras": [
                {"name": "third", "weight": "1.0", "enabled": "true", "tag": "c"},
                {"name": "disabled", "strength": 1.0, "enabled": false}
            ]
        }"#,
    );
    assert_eq!(entries.len(), 3);

    let result = apply_stack(&model(), &entries, &store, &config.merge_options());
    assert_eq!(result.applied, vec!["first".to_string(), "third".to_string()]);
    assert_eq!(result.skipped.len(), 1);
    assert_eq!(result.skipped[0].name, "second");
    assert!(matches!(result.skipped[0].error, ComposeError::NotFound { .. }));
    assert_eq!(result.tags, "a, b, c");
    assert_eq!(result.layers_patched, 1);

    let merged = result.weights.get("unet.proj_in.weight").unwrap();
    // 2·[[1,1],[1,1]] + [[0.5,0.5],[-0.5,-0.5]]
    assert_eq!(to_vec(&merged.to_float(&Device::Cpu).unwrap()), vec![2.5, 2.5, 1.5, 1.5]);

    let untouched = result.weights.get("unet.proj_out.weight").unwrap();
    assert_eq!(to_vec(&untouched.to_float(&Device::Cpu).unwrap()), vec![1.0; 4]);

    std::fs::remove_dir_all(root).ok();
}

/// The same stack merged into an int8 model gives identical results for the
/// same seed.
#[test]
fn test_quantized_stack_reproducible() {
    let store = MemoryStore::new()
        .with(Adapter::single(
            "a",
            "lora_unet_proj",
            AdapterFactors::new(tensor(&[0.3, -0.7], 2, 1), tensor(&[0.11, 0.29], 1, 2), None, Some(1.0)).unwrap(),
        ))
        .with(Adapter::single(
            "b",
            "base_model.model.proj",
            AdapterFactors::new(tensor(&[0.13, 0.05], 2, 1), tensor(&[-0.4, 0.9], 1, 2), None, None).unwrap(),
        ));
    let quantized = QuantizedWeight::new(vec![10, -20, 30, -40], QuantScale::PerTensor(0.01), vec![2, 2]).unwrap();
    let model = ModelWeights::new(Device::Cpu).with("proj.weight", quantized);
    let entries = resolve_stack(r#"[{"name": "a", "strength": 0.5}, {"name": "b", "strength": 1.5}]"#);
    let options = ComposeConfig::preset_quantized(99).merge_options();

    let first = apply_stack(&model, &entries, &store, &options);
    let second = apply_stack(&model, &entries, &store, &options);
    assert_eq!(first.applied.len(), 2);

    let (Some(Weight::Quantized(x)), Some(Weight::Quantized(y))) = (
        first.weights.get("proj.weight"),
        second.weights.get("proj.weight"),
    ) else {
        panic!("expected quantized weights");
    };
    assert_eq!(x.data(), y.data());
    assert_eq!(x.scale(), &QuantScale::PerTensor(0.01));
}

/// The concrete quantized scenario: zero data at scale 0.1 plus a delta of 2.0
/// everywhere lands exactly on 20.
#[test]
fn test_concrete_quantized_merge() {
    let base = Weight::Quantized(
        QuantizedWeight::new(vec![0; 4], QuantScale::PerTensor(0.1), vec![2, 2]).unwrap(),
    );
    let factors = AdapterFactors::new(tensor(&[1.0, 1.0], 2, 1), tensor(&[1.0, 1.0], 1, 2), None, Some(1.0)).unwrap();
    for seed in [0, 1, 42, u64::MAX] {
        let options = MergeOptions {
            seed,
            ..MergeOptions::default()
        };
        let out = merge_weight(&base, &[(&factors, 2.0)], &options).unwrap();
        let Weight::Quantized(q) = out.weight else {
            panic!("expected quantized weight");
        };
        assert_eq!(q.data(), &[20, 20, 20, 20]);
    }
}

/// Dynamic composition through `ComposedLinear` matches a layer built from
/// the statically merged weight.
#[test]
fn test_dynamic_matches_static() {
    let a = AdapterFactors::new(
        tensor(&[1.0, 0.5, -0.25, 2.0], 2, 2),
        tensor(&[0.5, 1.0, -1.0, 0.0, 0.25, 1.5], 2, 3),
        None,
        Some(4.0),
    )
    .unwrap();
    let b = AdapterFactors::new(tensor(&[0.3, -0.6], 2, 1), tensor(&[1.0, 2.0, 3.0], 1, 3), None, None).unwrap();
    let base = tensor(&[0.1, 0.2, 0.3, -0.1, -0.2, -0.3], 2, 3);

    let merged = merge_weight(
        &Weight::Float(base.clone()),
        &[(&a, 0.75), (&b, -1.25)],
        &MergeOptions::default(),
    )
    .unwrap();
    let static_layer = ComposedLinear::new(merged.weight, None, &Device::Cpu).unwrap();

    let mut session = CompositionSession::new();
    let store = MemoryStore::new()
        .with(Adapter::single("a", "attn.to_q", a))
        .with(Adapter::single("b", "attn.to_q", b));
    let active = session.activate_stack(
        &resolve_stack(r#"[{"name": "a", "strength": 0.75}, {"name": "b", "strength": -1.25}]"#),
        &store,
    );
    let handle = session.register_layer("attn.to_q.weight", &[2, 3]).unwrap();
    let mut dynamic_layer = ComposedLinear::new(base, None, &Device::Cpu).unwrap();
    dynamic_layer
        .set_composition(session.compose(&handle, &active).unwrap())
        .unwrap();

    let x = Tensor::new(&[[[1.0f32, -2.0, 0.5], [0.0, 1.0, 1.0]]], &Device::Cpu).unwrap();
    let expected = static_layer.forward(&x).unwrap();
    let got = Module::forward(&dynamic_layer, &x).unwrap();
    assert_eq!(got.dims(), &[1, 2, 2]);
    for (p, q) in to_vec(&got).iter().zip(to_vec(&expected)) {
        assert!((p - q).abs() < 1e-4, "{p} vs {q}");
    }

    // unchanged set: served from cache
    for _ in 0..5 {
        session.compose(&handle, &active).unwrap();
    }
    assert_eq!(session.recompute_count(), 1);
}

/// Corrupt files are reported per adapter, not fatal for the stack.
#[test]
fn test_corrupt_adapter_file_skipped() {
    let root = temp_root("corrupt");
    std::fs::write(root.join("broken.safetensors"), b"not a safetensors file").unwrap();
    save_adapter(&root, "good", "proj_in", tensor(&[1.0, 1.0], 2, 1), tensor(&[1.0, 1.0], 1, 2), 1.0);

    let store = lora_compose::DirectoryStore::new(vec![root.clone()]);
    let model = ModelWeights::new(Device::Cpu).with(
        "proj_in.weight",
        Tensor::zeros((2, 2), DType::F32, &Device::Cpu).unwrap(),
    );
    let entries = resolve_stack(
        r#"[{"name": "broken", "strength": 1.0, "tag": "x"}, {"name": "good", "strength": 1.0}]"#,
    );

    let result = apply_stack(&model, &entries, &store, &MergeOptions::default());
    assert_eq!(result.applied, vec!["good".to_string()]);
    assert!(matches!(result.skipped[0].error, ComposeError::CorruptFactors(_)));
    // resolved names keep their tags even when decoding fails
    assert_eq!(result.tags, "x");

    std::fs::remove_dir_all(root).ok();
}
