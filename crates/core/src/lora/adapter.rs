//! Low-rank adapter deltas and their registry.

use std::collections::HashMap;

use candle_core::Tensor;

use crate::error::{CoreError, Result};

/// One low-rank weight delta in decomposed form.
///
/// The delta for an input `x` is `scale * (x @ lora_a.T @ lora_b.T)` with
/// `scale = alpha / rank`. For sharded base layers the decomposed halves
/// are pre-sharded to match: `lora_b` rows follow a column-parallel output
/// shard, `lora_a` columns follow a row-parallel input shard, so the delta
/// joins the base output before its collective.
#[derive(Debug)]
pub struct LowRankAdapter {
    /// Down-projection: `[rank, in_features]`
    lora_a: Tensor,
    /// Up-projection: `[out_features, rank]`
    lora_b: Tensor,
    scale: f64,
}

impl LowRankAdapter {
    pub fn new(lora_a: Tensor, lora_b: Tensor, alpha: f64) -> Result<Self> {
        let (rank, _) = lora_a.dims2().map_err(|_| {
            CoreError::shape(
                "lora_a",
                "[rank, in_features]",
                format!("{:?}", lora_a.dims()),
            )
        })?;
        let (_, b_rank) = lora_b.dims2().map_err(|_| {
            CoreError::shape(
                "lora_b",
                "[out_features, rank]",
                format!("{:?}", lora_b.dims()),
            )
        })?;
        if b_rank != rank {
            return Err(CoreError::shape(
                "lora_b",
                format!("rank {rank}"),
                format!("rank {b_rank}"),
            ));
        }
        Ok(Self {
            lora_a,
            lora_b,
            scale: alpha / rank as f64,
        })
    }

    pub fn rank(&self) -> usize {
        self.lora_a.dims()[0]
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    /// The additive contribution for `x`: `scale * (x @ lora_a.T @ lora_b.T)`.
    ///
    /// `x`: `[num_tokens, in_features]`.
    pub fn delta(&self, x: &Tensor) -> Result<Tensor> {
        let mid = x.matmul(&self.lora_a.t()?)?;
        let out = mid.matmul(&self.lora_b.t()?)?;
        if (self.scale - 1.0).abs() > f64::EPSILON {
            Ok(out.affine(self.scale, 0.0)?)
        } else {
            Ok(out)
        }
    }
}

/// Registry of adapter deltas, keyed by `(adapter_index, layer_name)`.
///
/// Filled once by the adapter loader after base weights; never mutated
/// during forward passes. A lookup miss for a layer means the adapter
/// simply does not touch that layer, and the base output stands alone.
#[derive(Debug, Default)]
pub struct AdapterStore {
    adapters: HashMap<u32, HashMap<String, LowRankAdapter>>,
}

impl AdapterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &mut self,
        adapter_index: u32,
        layer_name: impl Into<String>,
        adapter: LowRankAdapter,
    ) {
        self.adapters
            .entry(adapter_index)
            .or_default()
            .insert(layer_name.into(), adapter);
    }

    /// The delta for one layer, or `None` when the adapter leaves that
    /// layer untouched.
    pub fn get(&self, adapter_index: u32, layer_name: &str) -> Option<&LowRankAdapter> {
        self.adapters.get(&adapter_index)?.get(layer_name)
    }

    /// Whether any weights are loaded for this adapter index.
    pub fn has_adapter(&self, adapter_index: u32) -> bool {
        self.adapters.contains_key(&adapter_index)
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }

    /// Number of distinct adapter indices loaded.
    pub fn num_adapters(&self) -> usize {
        self.adapters.len()
    }
}

/// Per-request adapter choice, resolved against an [`AdapterStore`].
///
/// Borrowed view handed down through the layers; a `None` store or index
/// makes every lookup absent without branching at the call sites.
#[derive(Clone, Copy, Debug, Default)]
pub struct AdapterSelection<'a> {
    store: Option<&'a AdapterStore>,
    adapter_index: Option<u32>,
}

impl<'a> AdapterSelection<'a> {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn new(store: &'a AdapterStore, adapter_index: Option<u32>) -> Result<Self> {
        if let Some(index) = adapter_index {
            if !store.has_adapter(index) {
                return Err(CoreError::config(format!(
                    "adapter index {index} has no loaded weights"
                )));
            }
        }
        Ok(Self {
            store: Some(store),
            adapter_index,
        })
    }

    pub fn lookup(&self, layer_name: &str) -> Option<&'a LowRankAdapter> {
        let store = self.store?;
        let index = self.adapter_index?;
        store.get(index, layer_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn adapter(rank: usize, in_features: usize, out_features: usize, alpha: f64) -> LowRankAdapter {
        let device = Device::Cpu;
        let lora_a = Tensor::ones((rank, in_features), DType::F32, &device).unwrap();
        let lora_b = Tensor::ones((out_features, rank), DType::F32, &device).unwrap();
        LowRankAdapter::new(lora_a, lora_b, alpha).unwrap()
    }

    #[test]
    fn test_scale_is_alpha_over_rank() {
        let adapter = adapter(4, 16, 8, 8.0);
        assert!((adapter.scale() - 2.0).abs() < f64::EPSILON);
        assert_eq!(adapter.rank(), 4);
    }

    #[test]
    fn test_delta_with_ones_weights() {
        let device = Device::Cpu;
        let adapter = adapter(4, 16, 8, 8.0);

        // x @ a.T = [16 ones] summed = 16 per rank column; @ b.T = 64 per
        // output; * scale 2 = 128.
        let x = Tensor::ones((1, 16), DType::F32, &device).unwrap();
        let delta = adapter.delta(&x).unwrap();

        let values: Vec<f32> = delta.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(delta.dims(), &[1, 8]);
        assert!(values.iter().all(|&v| (v - 128.0).abs() < f32::EPSILON));
    }

    #[test]
    fn test_rank_mismatch_rejected() {
        let device = Device::Cpu;
        let lora_a = Tensor::ones((4, 16), DType::F32, &device).unwrap();
        let lora_b = Tensor::ones((8, 6), DType::F32, &device).unwrap();
        let err = LowRankAdapter::new(lora_a, lora_b, 8.0).unwrap_err();
        assert!(matches!(err, CoreError::Shape { .. }));
    }

    #[test]
    fn test_store_lookup_by_index_and_layer() {
        let mut store = AdapterStore::new();
        store.insert(0, "layers.0.self_attn.qkv_proj", adapter(2, 8, 8, 4.0));
        store.insert(1, "layers.0.self_attn.qkv_proj", adapter(2, 8, 8, 4.0));

        assert_eq!(store.num_adapters(), 2);
        assert!(store.get(0, "layers.0.self_attn.qkv_proj").is_some());
        assert!(store.get(0, "layers.1.self_attn.qkv_proj").is_none());
        assert!(store.get(2, "layers.0.self_attn.qkv_proj").is_none());
    }

    #[test]
    fn test_selection_rejects_unknown_index() {
        let store = AdapterStore::new();
        let err = AdapterSelection::new(&store, Some(7)).unwrap_err();
        assert!(matches!(err, CoreError::Configuration { .. }));
        assert!(err.to_string().contains("adapter index 7"));
    }

    #[test]
    fn test_selection_without_index_is_always_absent() {
        let mut store = AdapterStore::new();
        store.insert(0, "layers.0.mlp.down_proj", adapter(2, 8, 8, 4.0));

        let selection = AdapterSelection::new(&store, None).unwrap();
        assert!(selection.lookup("layers.0.mlp.down_proj").is_none());

        let selection = AdapterSelection::new(&store, Some(0)).unwrap();
        assert!(selection.lookup("layers.0.mlp.down_proj").is_some());
        // A layer the adapter does not cover stays absent.
        assert!(selection.lookup("layers.0.mlp.gate_up_proj").is_none());
    }
}
