//! # lora-compose
//!
//! Composition of low-rank adapter (`LoRA`) stacks onto model weights.
//!
//! This crate provides:
//! - Stack resolution from JSON (lists or folders of adapter entries)
//! - Adapter factor loading from safetensors, kohya and PEFT key layouts
//! - Static merges into float or int8-quantized weights, with stochastic
//!   rounding and saturating integer addition
//! - Dynamic composition: cached concatenated factors per layer, rebuilt only
//!   when the active adapter set changes
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use lora_compose::{apply_stack, resolve_stack, ComposeConfig, ModelWeights};
//! use candle_core::Device;
//!
//! let config = ComposeConfig::from_file("compose.json")?;
//! let store = config.directory_store(&Device::Cpu);
//! let entries = resolve_stack(r#"[{"name": "style", "strength": 0.8}]"#);
//!
//! let result = apply_stack(&model, &entries, &store, &config.merge_options());
//! println!("patched {} layers ({})", result.layers_patched, result.tags);
//! ```
//!
//! ## Architecture
//!
//! Each adapter contributes `ΔW = scale · up × [mid ×] down` to a weight.
//! A static merge folds the deltas into a new weight once. The dynamic path
//! keeps the base untouched and applies the concatenated factors of the active
//! stack at forward time through [`ComposedLinear`].

#![warn(missing_docs)]
#![warn(clippy::pedantic)]

pub mod cache;
pub mod config;
pub mod delta;
pub mod error;
pub mod linear;
pub mod merge;
pub mod quantization;
pub mod stack;
pub mod store;
pub mod weights;

pub use cache::{
    ActiveAdapter, AdapterId, ComposedFactors, CompositionIdentity, CompositionSession,
    LayerHandle,
};
pub use config::ComposeConfig;
pub use delta::{choose_order, delta, dense_product, low_rank_pair, scale, MatmulOrder};
pub use error::{ComposeError, Result};
pub use linear::ComposedLinear;
pub use merge::{
    apply_stack, merge_weight, mix_seed, LayerFailure, MergeFailure, MergeMode, MergeOptions,
    MergeOutcome, SkippedAdapter, StackApplication,
};
pub use quantization::{
    add_saturating, quantize_delta, stochastic_round, QuantScale, QuantizedWeight, RoundingMode,
};
pub use stack::{join_tags, resolve_stack, resolve_value, AdapterEntry};
pub use store::{
    normalize_layer_key, Adapter, AdapterFactors, AdapterStore, DirectoryStore, MemoryStore,
};
pub use weights::{ModelWeights, Weight};
