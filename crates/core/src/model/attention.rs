use std::sync::Arc;

use candle_core::{Tensor, D};
use candle_nn::VarBuilder;

use crate::config::ModelPlan;
use crate::distributed::{DeviceCommunicator, ProcessGroup, QkvLinear, RowParallelLinear};
use crate::error::Result;
use crate::kv_cache::KvCache;
use crate::layers::{AttentionCapabilities, AttentionDispatcher, ForwardBatch, RotaryEncoder};
use crate::lora::AdapterSelection;

/// One layer's attention block: sharded QKV projection, rotary phase,
/// paged dispatch, sharded output projection.
///
/// Head counts here are rank-local; the projection layer validates the
/// global-count divisibility at load.
pub(crate) struct SelfAttention {
    qkv: QkvLinear,
    o_proj: RowParallelLinear,
    rotary: Arc<RotaryEncoder>,
    dispatcher: AttentionDispatcher,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
    qkv_adapter_key: String,
    o_adapter_key: String,
}

impl SelfAttention {
    pub fn load(
        plan: &ModelPlan,
        layer_name: &str,
        rotary: Arc<RotaryEncoder>,
        capabilities: AttentionCapabilities,
        vb: VarBuilder,
        pg: &dyn ProcessGroup,
    ) -> Result<Self> {
        let qkv = QkvLinear::load(
            plan.hidden_size,
            plan.num_attention_heads,
            plan.num_kv_heads,
            plan.head_dim,
            plan.attention_bias,
            plan.qkv_layout,
            vb.clone(),
            pg,
        )?;
        let o_proj = RowParallelLinear::new(
            plan.num_attention_heads * plan.head_dim,
            plan.hidden_size,
            false,
            vb.pp("o_proj"),
            pg,
        )?;

        let num_heads = qkv.query_size() / plan.head_dim;
        let num_kv_heads = qkv.kv_size() / plan.head_dim;
        let dispatcher = AttentionDispatcher::new(
            num_heads,
            num_kv_heads,
            plan.head_dim,
            plan.softmax_scale,
            plan.sliding_window,
            capabilities,
            vb.device(),
        )?;

        Ok(Self {
            qkv,
            o_proj,
            rotary,
            dispatcher,
            num_heads,
            num_kv_heads,
            head_dim: plan.head_dim,
            qkv_adapter_key: format!("{layer_name}.qkv_proj"),
            o_adapter_key: format!("{layer_name}.o_proj"),
        })
    }

    /// `hidden_states` is `[num_tokens, hidden]`, packed across sequences.
    #[allow(clippy::too_many_arguments)]
    pub fn forward(
        &self,
        hidden_states: &Tensor,
        cos: &Tensor,
        sin: &Tensor,
        batch: &ForwardBatch,
        cache: &mut KvCache,
        comm: &dyn DeviceCommunicator,
        adapters: AdapterSelection<'_>,
    ) -> Result<Tensor> {
        let num_tokens = batch.num_tokens();
        let query_size = self.qkv.query_size();
        let kv_size = self.qkv.kv_size();

        let qkv = self.qkv.forward_adapted(
            hidden_states,
            comm,
            adapters.lookup(&self.qkv_adapter_key),
        )?;
        let q = qkv
            .narrow(D::Minus1, 0, query_size)?
            .reshape((num_tokens, self.num_heads, self.head_dim))?;
        let k = qkv
            .narrow(D::Minus1, query_size, kv_size)?
            .reshape((num_tokens, self.num_kv_heads, self.head_dim))?;
        let v = qkv
            .narrow(D::Minus1, query_size + kv_size, kv_size)?
            .reshape((num_tokens, self.num_kv_heads, self.head_dim))?;

        // Rotate before the cache write so stored keys carry their phase.
        let (q, k) = self.rotary.apply(&q, &k, cos, sin)?;

        let attn = self.dispatcher.forward(&q, &k, &v, batch, cache)?;
        self.o_proj
            .forward_adapted(&attn, comm, adapters.lookup(&self.o_adapter_key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfig;
    use crate::distributed::{LocalProcessGroup, MockCommunicator};
    use crate::kv_cache::BlockTable;
    use crate::lora::{AdapterStore, LowRankAdapter};
    use candle_core::{DType, Device};
    use std::collections::HashMap;

    fn tiny_plan() -> ModelPlan {
        let config = ModelConfig {
            hidden_size: 4,
            intermediate_size: 8,
            num_attention_heads: 2,
            num_key_value_heads: Some(2),
            num_hidden_layers: 1,
            head_dim: Some(2),
            vocab_size: 16,
            max_position_embeddings: 32,
            ..Default::default()
        };
        ModelPlan::from_config(&config).unwrap()
    }

    fn rotary(plan: &ModelPlan, device: &Device) -> Arc<RotaryEncoder> {
        Arc::new(
            RotaryEncoder::new(
                &plan.rotary,
                plan.head_dim,
                plan.max_position_embeddings,
                DType::F32,
                device,
            )
            .unwrap(),
        )
    }

    fn prefill_batch(len: usize, block_size: usize) -> ForwardBatch {
        let table = BlockTable::new(vec![0, 1], block_size).unwrap();
        ForwardBatch::prefill(vec![0, len], vec![0], (0..len).collect(), vec![table]).unwrap()
    }

    #[test]
    fn forward_projects_back_to_hidden_size() {
        let device = Device::Cpu;
        let plan = tiny_plan();
        let pg = LocalProcessGroup::new();
        let comm = MockCommunicator::new(pg.clone());
        let vb = VarBuilder::zeros(DType::F32, &device);

        let rope = rotary(&plan, &device);
        let attn = SelfAttention::load(
            &plan,
            "layers.0.self_attn",
            rope.clone(),
            AttentionCapabilities::reference(),
            vb.pp("self_attn"),
            &pg,
        )
        .unwrap();

        let batch = prefill_batch(3, 4);
        let mut cache = KvCache::new(8, 2, 2, DType::F32, &device).unwrap();
        let positions = Tensor::from_vec(vec![0u32, 1, 2], 3, &device).unwrap();
        let (cos, sin) = rope.cos_sin(&positions).unwrap();

        let hidden = Tensor::ones(&[3, 4], DType::F32, &device).unwrap();
        let out = attn
            .forward(
                &hidden,
                &cos,
                &sin,
                &batch,
                &mut cache,
                &comm,
                AdapterSelection::none(),
            )
            .unwrap();

        assert_eq!(out.dims(), &[3, 4]);
    }

    #[test]
    fn adapter_on_qkv_projection_changes_output() {
        let device = Device::Cpu;
        let plan = tiny_plan();
        let pg = LocalProcessGroup::new();
        let comm = MockCommunicator::new(pg.clone());

        // Zero base projections, identity output projection: without an
        // adapter everything stays zero, with a QKV adapter the value path
        // carries signal through to the output.
        let map: HashMap<String, Tensor> = [
            (
                "self_attn.q_proj.weight".to_string(),
                Tensor::zeros((4, 4), DType::F32, &device).unwrap(),
            ),
            (
                "self_attn.k_proj.weight".to_string(),
                Tensor::zeros((4, 4), DType::F32, &device).unwrap(),
            ),
            (
                "self_attn.v_proj.weight".to_string(),
                Tensor::zeros((4, 4), DType::F32, &device).unwrap(),
            ),
            (
                "self_attn.o_proj.weight".to_string(),
                Tensor::eye(4, DType::F32, &device).unwrap(),
            ),
        ]
        .into_iter()
        .collect();
        let vb = VarBuilder::from_tensors(map, DType::F32, &device);

        let rope = rotary(&plan, &device);
        let attn = SelfAttention::load(
            &plan,
            "layers.0.self_attn",
            rope.clone(),
            AttentionCapabilities::reference(),
            vb.pp("self_attn"),
            &pg,
        )
        .unwrap();

        let mut store = AdapterStore::new();
        let lora_a = Tensor::ones((1, 4), DType::F32, &device).unwrap();
        let lora_b = Tensor::ones((12, 1), DType::F32, &device).unwrap();
        store.insert(
            0,
            "layers.0.self_attn.qkv_proj",
            LowRankAdapter::new(lora_a, lora_b, 1.0).unwrap(),
        );

        let batch = prefill_batch(2, 4);
        let positions = Tensor::from_vec(vec![0u32, 1], 2, &device).unwrap();
        let (cos, sin) = rope.cos_sin(&positions).unwrap();
        let hidden = Tensor::ones(&[2, 4], DType::F32, &device).unwrap();

        let mut cache = KvCache::new(8, 2, 2, DType::F32, &device).unwrap();
        let base = attn
            .forward(
                &hidden,
                &cos,
                &sin,
                &batch,
                &mut cache,
                &comm,
                AdapterSelection::none(),
            )
            .unwrap();

        let mut cache = KvCache::new(8, 2, 2, DType::F32, &device).unwrap();
        let selection = AdapterSelection::new(&store, Some(0)).unwrap();
        let adapted = attn
            .forward(&hidden, &cos, &sin, &batch, &mut cache, &comm, selection)
            .unwrap();

        let base_vals: Vec<f32> = base.flatten_all().unwrap().to_vec1().unwrap();
        let adapted_vals: Vec<f32> = adapted.flatten_all().unwrap().to_vec1().unwrap();
        assert!(base_vals.iter().all(|&v| v == 0.0));
        assert!(adapted_vals.iter().any(|&v| v != 0.0));
    }
}
