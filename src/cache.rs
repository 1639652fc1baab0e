//! Dynamic composition: per-layer cached low-rank factors for the active stack.
//!
//! Instead of folding deltas into weights, each registered layer keeps the
//! concatenation of its active adapters' factors:
//!
//! ```text
//! combined_down = cat([s1·down1, s2·down2, ...], dim 0)    [Σr, in]
//! combined_up   = cat([up1, up2, ...], dim 1)              [out, Σr]
//! y = base(x) + (x · combined_downᵀ) · combined_upᵀ
//! ```
//!
//! The cached pair is rebuilt only when the layer's [`CompositionIdentity`]
//! changes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::Linear;

use crate::delta::low_rank_pair;
use crate::error::{ComposeError, Result};
use crate::stack::AdapterEntry;
use crate::store::{normalize_layer_key, Adapter, AdapterFactors, AdapterStore};

static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);

/// Index of an adapter registered with a [`CompositionSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AdapterId(usize);

impl AdapterId {
    /// Position in the session's adapter table.
    #[must_use]
    pub fn index(self) -> usize {
        self.0
    }
}

/// An adapter selected for the current request, with its strength.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ActiveAdapter {
    /// Registered adapter.
    pub id: AdapterId,
    /// Strength multiplier.
    pub strength: f32,
}

impl ActiveAdapter {
    /// Select `id` at `strength`.
    #[must_use]
    pub fn new(id: AdapterId, strength: f32) -> Self {
        Self { id, strength }
    }
}

/// Order-independent key of an active set: sorted `(id, strength bits)` pairs.
///
/// Zero strengths are dropped and `-0.0` is folded into `0.0`, so sets that
/// produce the same delta compare equal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct CompositionIdentity(Vec<(AdapterId, u32)>);

impl CompositionIdentity {
    /// Identity of `active`.
    pub fn from_active(active: impl IntoIterator<Item = ActiveAdapter>) -> Self {
        let mut pairs: Vec<(AdapterId, u32)> = active
            .into_iter()
            .filter(|a| a.strength != 0.0)
            .map(|a| (a.id, a.strength.to_bits()))
            .collect();
        pairs.sort_unstable();
        Self(pairs)
    }

    /// Whether no adapter contributes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of contributing adapters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }
}

/// Concatenated factors of every active adapter on one layer.
///
/// Applied as a module, it maps `x [.., in]` to the delta output `[.., out]`.
#[derive(Debug, Clone)]
pub struct ComposedFactors {
    down: Linear,
    up: Linear,
}

impl ComposedFactors {
    /// Wrap already-scaled factors: `up [out, R]`, `down [R, in]`.
    ///
    /// # Errors
    /// Returns `ShapeMismatch` if the inner ranks differ.
    pub fn new(combined_up: Tensor, combined_down: Tensor) -> Result<Self> {
        let (_, up_rank) = combined_up.dims2()?;
        let (down_rank, _) = combined_down.dims2()?;
        if up_rank != down_rank {
            return Err(ComposeError::ShapeMismatch {
                expected: vec![up_rank],
                actual: vec![down_rank],
            });
        }
        Ok(Self {
            down: Linear::new(combined_down, None),
            up: Linear::new(combined_up, None),
        })
    }

    /// Combined up factor `[out, R]`.
    #[must_use]
    pub fn combined_up(&self) -> &Tensor {
        self.up.weight()
    }

    /// Combined down factor `[R, in]`, strengths already applied.
    #[must_use]
    pub fn combined_down(&self) -> &Tensor {
        self.down.weight()
    }

    /// Total rank `R`.
    #[must_use]
    pub fn rank(&self) -> usize {
        self.down.weight().dims()[0]
    }

    /// Delta output for `x`, shape `[.., out]`.
    ///
    /// # Errors
    /// Returns error if `x`'s last dimension is not `in`.
    pub fn forward_delta(&self, x: &Tensor) -> Result<Tensor> {
        Ok(self.forward(x)?)
    }

    /// Dense `combined_up × combined_down`, equal to the sum of the active deltas.
    ///
    /// # Errors
    /// Returns error if the matmul fails.
    pub fn dense(&self) -> Result<Tensor> {
        Ok(self.up.weight().matmul(self.down.weight())?)
    }
}

impl Module for ComposedFactors {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        self.up.forward(&self.down.forward(xs)?)
    }
}

/// Registration of one layer with a session.
///
/// Not `Clone`: releasing consumes the handle.
#[derive(Debug)]
pub struct LayerHandle {
    session: u64,
    slot: u64,
    key: String,
}

impl LayerHandle {
    /// Normalized layer key.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }
}

#[derive(Debug)]
struct LayerSlot {
    key: String,
    shape: Vec<usize>,
    identity: CompositionIdentity,
    composed: Option<Arc<ComposedFactors>>,
}

/// Adapter table plus per-layer composition cache.
///
/// A session is driven from one thread; the `Arc<ComposedFactors>` it hands
/// out are immutable and may be shared freely. A rebuilt entry replaces the
/// old `Arc` only once it is complete.
#[derive(Debug)]
pub struct CompositionSession {
    id: u64,
    adapters: Vec<Arc<Adapter>>,
    by_name: HashMap<String, AdapterId>,
    layers: HashMap<u64, LayerSlot>,
    next_slot: u64,
    recomputations: u64,
}

impl Default for CompositionSession {
    fn default() -> Self {
        Self::new()
    }
}

impl CompositionSession {
    /// Create an empty session.
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: NEXT_SESSION.fetch_add(1, Ordering::Relaxed),
            adapters: Vec::new(),
            by_name: HashMap::new(),
            layers: HashMap::new(),
            next_slot: 0,
            recomputations: 0,
        }
    }

    /// Register an adapter, returning its id.
    ///
    /// A name already registered keeps its first adapter and id, so cached
    /// identities stay valid.
    pub fn add_adapter(&mut self, adapter: Adapter) -> AdapterId {
        if let Some(&id) = self.by_name.get(adapter.name()) {
            tracing::debug!(adapter = adapter.name(), "adapter already registered");
            return id;
        }
        let id = AdapterId(self.adapters.len());
        self.by_name.insert(adapter.name().to_string(), id);
        tracing::debug!(adapter = adapter.name(), layers = adapter.len(), "registered adapter");
        self.adapters.push(Arc::new(adapter));
        id
    }

    /// Id of a registered adapter.
    #[must_use]
    pub fn adapter_id(&self, name: &str) -> Option<AdapterId> {
        self.by_name.get(name).copied()
    }

    /// Registered adapter by id.
    #[must_use]
    pub fn adapter(&self, id: AdapterId) -> Option<&Arc<Adapter>> {
        self.adapters.get(id.index())
    }

    /// Turn stack entries into an active set, loading unknown adapters from `store`.
    ///
    /// Entries that cannot be loaded are logged and left out.
    pub fn activate_stack(
        &mut self,
        entries: &[AdapterEntry],
        store: &dyn AdapterStore,
    ) -> Vec<ActiveAdapter> {
        let mut active = Vec::with_capacity(entries.len());
        for entry in entries {
            let id = match self.adapter_id(&entry.name) {
                Some(id) => id,
                None => match store.load(&entry.name) {
                    Ok(adapter) => self.add_adapter(adapter),
                    Err(error) => {
                        tracing::warn!(adapter = %entry.name, error = %error, "skipping adapter");
                        continue;
                    }
                },
            };
            active.push(ActiveAdapter::new(id, entry.strength));
        }
        active
    }

    /// Register a layer by key and weight shape `[out, ...]`.
    ///
    /// # Errors
    /// Returns `InvalidConfig` for an empty or zero-sized shape.
    pub fn register_layer(&mut self, key: &str, weight_shape: &[usize]) -> Result<LayerHandle> {
        if weight_shape.is_empty() || weight_shape.contains(&0) {
            return Err(ComposeError::InvalidConfig(format!(
                "layer {key} has unusable shape {weight_shape:?}"
            )));
        }
        let key = normalize_layer_key(key);
        let slot = self.next_slot;
        self.next_slot += 1;
        self.layers.insert(
            slot,
            LayerSlot {
                key: key.clone(),
                shape: weight_shape.to_vec(),
                identity: CompositionIdentity::default(),
                composed: None,
            },
        );
        Ok(LayerHandle {
            session: self.id,
            slot,
            key,
        })
    }

    /// Drop a layer's cache entry. Returns whether the layer was registered here.
    pub fn release_layer(&mut self, handle: LayerHandle) -> bool {
        handle.session == self.id && self.layers.remove(&handle.slot).is_some()
    }

    /// Composed factors for `handle` under `active`, rebuilt only if the
    /// layer's identity changed.
    ///
    /// Returns `None` when no active adapter touches the layer. Adapters
    /// without factors for the layer, or with mismatched shapes, are left out.
    ///
    /// # Errors
    /// Returns `InvalidConfig` for a handle that is not registered here.
    pub fn compose(
        &mut self,
        handle: &LayerHandle,
        active: &[ActiveAdapter],
    ) -> Result<Option<Arc<ComposedFactors>>> {
        let slot = self.slot(handle)?;

        let mut applicable: Vec<(ActiveAdapter, Arc<AdapterFactors>)> = Vec::new();
        for a in active.iter().filter(|a| a.strength != 0.0) {
            let Some(adapter) = self.adapters.get(a.id.index()) else {
                tracing::debug!(id = a.id.index(), "unknown adapter id");
                continue;
            };
            if let Some(factors) = adapter.layer(&slot.key) {
                applicable.push((*a, Arc::clone(factors)));
            }
        }

        let identity = CompositionIdentity::from_active(applicable.iter().map(|(a, _)| *a));
        if identity == slot.identity {
            return Ok(slot.composed.clone());
        }

        let composed = build_composed(&slot.key, &slot.shape, &applicable)?.map(Arc::new);

        tracing::debug!(
            layer = %handle.key,
            adapters = identity.len(),
            "recomposed layer"
        );
        let slot = self
            .layers
            .get_mut(&handle.slot)
            .ok_or_else(|| unknown_handle(handle))?;
        slot.identity = identity;
        slot.composed.clone_from(&composed);
        self.recomputations += 1;
        Ok(composed)
    }

    /// Currently cached factors for `handle`, without recomputing.
    #[must_use]
    pub fn cached(&self, handle: &LayerHandle) -> Option<Arc<ComposedFactors>> {
        self.slot(handle).ok().and_then(|s| s.composed.clone())
    }

    /// Number of cache rebuilds so far.
    #[must_use]
    pub fn recompute_count(&self) -> u64 {
        self.recomputations
    }

    /// Number of registered layers.
    #[must_use]
    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }

    fn slot(&self, handle: &LayerHandle) -> Result<&LayerSlot> {
        if handle.session != self.id {
            return Err(unknown_handle(handle));
        }
        self.layers
            .get(&handle.slot)
            .ok_or_else(|| unknown_handle(handle))
    }
}

fn unknown_handle(handle: &LayerHandle) -> ComposeError {
    ComposeError::InvalidConfig(format!("layer {} is not registered in this session", handle.key))
}

fn build_composed(
    key: &str,
    shape: &[usize],
    applicable: &[(ActiveAdapter, Arc<AdapterFactors>)],
) -> Result<Option<ComposedFactors>> {
    let out = shape[0];
    let numel: usize = shape.iter().product();

    let mut pairs = Vec::with_capacity(applicable.len());
    for (active, factors) in applicable {
        if factors.out_features() != out || factors.delta_numel() != numel {
            let error = ComposeError::ShapeMismatch {
                expected: shape.to_vec(),
                actual: vec![factors.out_features(), factors.in_features()],
            };
            tracing::warn!(layer = key, id = active.id.index(), error = %error, "skipping adapter");
            continue;
        }
        match low_rank_pair(factors, active.strength) {
            Ok((up, down)) => pairs.push((active.id, up, down)),
            Err(error) => {
                tracing::warn!(layer = key, id = active.id.index(), error = %error, "skipping adapter");
            }
        }
    }
    concat_pairs(key, pairs)
}

fn align(t: &Tensor, device: &Device) -> Result<Tensor> {
    Ok(t.to_device(device)?.to_dtype(DType::F32)?)
}

/// Concatenate `(up, down)` pairs on the first pair's device as f32.
///
/// A pair that cannot be moved there is skipped with a warning.
fn concat_pairs(
    key: &str,
    pairs: Vec<(AdapterId, Tensor, Tensor)>,
) -> Result<Option<ComposedFactors>> {
    let Some(device) = pairs.first().map(|(_, up, _)| up.device().clone()) else {
        return Ok(None);
    };

    let mut ups = Vec::with_capacity(pairs.len());
    let mut downs = Vec::with_capacity(pairs.len());
    for (id, up, down) in pairs {
        let aligned = align(&up, &device).and_then(|up| Ok((up, align(&down, &device)?)));
        match aligned {
            Ok((up, down)) => {
                ups.push(up);
                downs.push(down);
            }
            Err(error) => {
                tracing::warn!(layer = key, id = id.index(), error = %error, "skipping adapter");
            }
        }
    }

    if ups.is_empty() {
        return Ok(None);
    }
    let combined_up = Tensor::cat(&ups, 1)?;
    let combined_down = Tensor::cat(&downs, 0)?;
    Ok(Some(ComposedFactors::new(combined_up, combined_down)?))
}
