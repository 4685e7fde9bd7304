use candle_core::{Module, Tensor, D};
use candle_nn::{Activation, VarBuilder};

use crate::config::{ModelPlan, MoeSpec};
use crate::distributed::{
    DeviceCommunicator, GateUpLinear, ProcessGroup, ReduceOp, RowParallelLinear,
};
use crate::error::Result;
use crate::moe::router::{Router, RoutingTable};

/// One expert's gated MLP, sharded like the dense MLP but leaving the
/// down projection unreduced. The owning layer sums expert outputs first
/// and closes with a single all-reduce.
#[derive(Debug)]
struct Expert {
    gate_up: GateUpLinear,
    down: RowParallelLinear,
    activation: Activation,
}

impl Expert {
    fn load(plan: &ModelPlan, vb: VarBuilder, pg: &dyn ProcessGroup) -> Result<Self> {
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
        })
    }

    /// Rank-local partial output, `[rows, hidden]`, not yet reduced.
    fn forward_partial(&self, x: &Tensor, comm: &dyn DeviceCommunicator) -> Result<Tensor> {
        let width = self.gate_up.intermediate_per_rank();
        let gate_up = self.gate_up.forward(x, comm)?;
        let gate = gate_up.narrow(D::Minus1, 0, width)?;
        let up = gate_up.narrow(D::Minus1, width, width)?;
        let inner = (gate.apply(&self.activation)? * up)?;
        self.down.forward_partial(&inner)
    }
}

/// Mixture-of-experts feed-forward block.
///
/// Routing is replicated across ranks; expert weights are tensor-parallel
/// shards. The weighted per-expert combination happens on rank-local
/// partial sums, so exactly one all-reduce runs per layer regardless of
/// `top_k`.
#[derive(Debug)]
pub struct MoeLayer {
    router: Router,
    experts: Vec<Expert>,
    hidden_size: usize,
}

impl MoeLayer {
    pub fn load(
        plan: &ModelPlan,
        spec: &MoeSpec,
        vb: VarBuilder,
        pg: &dyn ProcessGroup,
    ) -> Result<Self> {
        let router = Router::load(plan.hidden_size, spec, vb.pp("gate"))?;
        let vb_experts = vb.pp("experts");
        let experts = (0..spec.num_experts)
            .map(|i| Expert::load(plan, vb_experts.pp(i), pg))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            router,
            experts,
            hidden_size: plan.hidden_size,
        })
    }

    /// Sparse dispatch: tokens are grouped per selected expert, each
    /// group runs one batched expert forward, and results scatter back
    /// weighted by the gate.
    pub fn forward(
        &self,
        hidden_states: &Tensor,
        comm: &dyn DeviceCommunicator,
    ) -> Result<Tensor> {
        let table = self.router.route(hidden_states)?;
        let num_tokens = table.num_tokens();
        let device = hidden_states.device();
        let dtype = hidden_states.dtype();

        let mut assignments: Vec<Vec<(u32, f32)>> = vec![Vec::new(); self.experts.len()];
        for token in 0..num_tokens {
            let (experts, weights) = table.for_token(token);
            for (&expert, &weight) in experts.iter().zip(weights) {
                assignments[expert as usize].push((token as u32, weight));
            }
        }

        let mut output =
            Tensor::zeros((num_tokens, self.hidden_size), dtype, device)?;
        for (expert, routed) in self.experts.iter().zip(&assignments) {
            if routed.is_empty() {
                continue;
            }
            let rows: Vec<u32> = routed.iter().map(|&(t, _)| t).collect();
            let weights: Vec<f32> = routed.iter().map(|&(_, w)| w).collect();

            let indices = Tensor::from_vec(rows, (routed.len(),), device)?;
            let input = hidden_states.index_select(&indices, 0)?;
            let partial = expert.forward_partial(&input, comm)?;

            let weights = Tensor::from_vec(weights, (routed.len(), 1), device)?
                .to_dtype(dtype)?;
            let weighted = partial.broadcast_mul(&weights)?;
            output = output.index_add(&indices, &weighted, 0)?;
        }

        comm.all_reduce(&output, ReduceOp::Sum)
    }

    /// Dense fallback: every expert runs over every token, masked by the
    /// gate weights. Slow, but a direct statement of the layer's math.
    pub fn forward_dense(
        &self,
        hidden_states: &Tensor,
        comm: &dyn DeviceCommunicator,
    ) -> Result<Tensor> {
        let table = self.router.route(hidden_states)?;
        let num_tokens = table.num_tokens();
        let device = hidden_states.device();
        let dtype = hidden_states.dtype();

        let mut output =
            Tensor::zeros((num_tokens, self.hidden_size), dtype, device)?;
        for (expert_index, expert) in self.experts.iter().enumerate() {
            let mut gate = vec![0f32; num_tokens];
            for token in 0..num_tokens {
                let (experts, weights) = table.for_token(token);
                for (&e, &w) in experts.iter().zip(weights) {
                    if e as usize == expert_index {
                        gate[token] = w;
                    }
                }
            }

            let partial = expert.forward_partial(hidden_states, comm)?;
            let gate = Tensor::from_vec(gate, (num_tokens, 1), device)?.to_dtype(dtype)?;
            output = (output + partial.broadcast_mul(&gate)?)?;
        }

        comm.all_reduce(&output, ReduceOp::Sum)
    }

    pub fn num_experts(&self) -> usize {
        self.experts.len()
    }
}
