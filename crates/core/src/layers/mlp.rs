use candle_core::{Module, Tensor, D};
use candle_nn::{Activation, VarBuilder};

use crate::config::ModelPlan;
use crate::distributed::{DeviceCommunicator, GateUpLinear, ProcessGroup, RowParallelLinear};
use crate::error::Result;
use crate::lora::AdapterSelection;

/// Gated MLP (SwiGLU and friends), sharded over the intermediate size.
///
/// The fused gate/up projection is column-parallel and the down projection
/// row-parallel, so one all-reduce per MLP closes the block.
pub struct ShardedMlp {
    gate_up: GateUpLinear,
    down: RowParallelLinear,
    activation: Activation,
    gate_up_adapter_key: String,
    down_adapter_key: String,
}

impl ShardedMlp {
    pub fn load(
        plan: &ModelPlan,
        layer_name: &str,
        vb: VarBuilder,
        pg: &dyn ProcessGroup,
    ) -> Result<Self> {
        let gate_up = GateUpLinear::load(
            plan.hidden_size,
            plan.intermediate_size,
            plan.gate_up_layout,
            vb.clone(),
            pg,
        )?;
        let down = RowParallelLinear::new(
            plan.intermediate_size,
            plan.hidden_size,
            false,
            vb.pp("down_proj"),
            pg,
        )?;
        Ok(Self {
            gate_up,
            down,
            activation: plan.activation,
            gate_up_adapter_key: format!("{layer_name}.gate_up_proj"),
            down_adapter_key: format!("{layer_name}.down_proj"),
        })
    }

    /// `[num_tokens, hidden]` in, `[num_tokens, hidden]` out, reduced
    /// across ranks.
    pub fn forward(
        &self,
        hidden_states: &Tensor,
        comm: &dyn DeviceCommunicator,
        adapters: AdapterSelection<'_>,
    ) -> Result<Tensor> {
        let width = self.gate_up.intermediate_per_rank();
        let gate_up = self.gate_up.forward_adapted(
            hidden_states,
            comm,
            adapters.lookup(&self.gate_up_adapter_key),
        )?;
        let gate = gate_up.narrow(D::Minus1, 0, width)?;
        let up = gate_up.narrow(D::Minus1, width, width)?;
        let inner = (gate.apply(&self.activation)? * up)?;
        self.down
            .forward_adapted(&inner, comm, adapters.lookup(&self.down_adapter_key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ModelConfig, ProjectionLayout};
    use crate::distributed::{LocalProcessGroup, MockCommunicator};
    use candle_core::{DType, Device};
    use std::collections::HashMap;

    fn small_plan() -> ModelPlan {
        let config = ModelConfig {
            hidden_size: 8,
            intermediate_size: 16,
            num_attention_heads: 2,
            num_key_value_heads: Some(2),
            num_hidden_layers: 1,
            head_dim: Some(4),
            vocab_size: 32,
            ..Default::default()
        };
        ModelPlan::from_config(&config).unwrap()
    }

    #[test]
    fn forward_shape_round_trip() {
        let pg = LocalProcessGroup::new();
        let comm = MockCommunicator::new(pg.clone());
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);

        let mlp = ShardedMlp::load(&small_plan(), "layers.0.mlp", vb.pp("mlp"), &pg).unwrap();
        let input = Tensor::ones(&[5, 8], DType::F32, &Device::Cpu).unwrap();
        let output = mlp
            .forward(&input, &comm, AdapterSelection::none())
            .unwrap();

        assert_eq!(output.dims(), &[5, 8]);
    }

    #[test]
    fn silu_gating_matches_reference() {
        let device = Device::Cpu;
        let hidden = 2;
        let intermediate = 2;

        // gate = [[1, 0], [0, 1]], up = 2*I, down = I padded: with input
        // [1, 1] the inner value is silu(1) * 2 per lane.
        let gate = Tensor::eye(2, DType::F32, &device).unwrap();
        let up = (Tensor::eye(2, DType::F32, &device).unwrap() * 2.0).unwrap();
        let down = Tensor::eye(2, DType::F32, &device).unwrap();

        let map: HashMap<String, Tensor> = [
            ("mlp.gate_proj.weight".to_string(), gate),
            ("mlp.up_proj.weight".to_string(), up),
            ("mlp.down_proj.weight".to_string(), down),
        ]
        .into_iter()
        .collect();
        let vb = VarBuilder::from_tensors(map, DType::F32, &device);

        let config = ModelConfig {
            hidden_size: hidden,
            intermediate_size: intermediate,
            num_attention_heads: 1,
            num_key_value_heads: Some(1),
            num_hidden_layers: 1,
            head_dim: Some(2),
            vocab_size: 8,
            ..Default::default()
        };
        let plan = ModelPlan::from_config(&config).unwrap();
        assert_eq!(plan.gate_up_layout, ProjectionLayout::Split);

        let pg = LocalProcessGroup::new();
        let comm = MockCommunicator::new(pg.clone());
        let mlp = ShardedMlp::load(&plan, "layers.0.mlp", vb.pp("mlp"), &pg).unwrap();

        let input = Tensor::ones(&[1, 2], DType::F32, &device).unwrap();
        let output = mlp
            .forward(&input, &comm, AdapterSelection::none())
            .unwrap();

        let silu_one = 1.0 / (1.0 + (-1.0f32).exp());
        let expected = silu_one * 2.0;
        let values: Vec<f32> = output.flatten_all().unwrap().to_vec1().unwrap();
        for v in values {
            assert!((v - expected).abs() < 1e-6, "got {v}, expected {expected}");
        }
    }
}
