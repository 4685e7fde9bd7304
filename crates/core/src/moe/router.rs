use candle_core::{DType, Module, Tensor, D};
use candle_nn::{Linear, VarBuilder};

use crate::config::MoeSpec;
use crate::error::{CoreError, Result};

/// Per-token routing decision: `top_k` expert indices and gating weights
/// per token, flattened with stride `top_k`.
#[derive(Debug, Clone)]
pub struct RoutingTable {
    experts: Vec<u32>,
    weights: Vec<f32>,
    top_k: usize,
}

impl RoutingTable {
    pub fn num_tokens(&self) -> usize {
        self.experts.len() / self.top_k
    }

    pub fn top_k(&self) -> usize {
        self.top_k
    }

    /// Selected experts and weights for one token, highest weight first.
    pub fn for_token(&self, token: usize) -> (&[u32], &[f32]) {
        let start = token * self.top_k;
        (
            &self.experts[start..start + self.top_k],
            &self.weights[start..start + self.top_k],
        )
    }
}

/// Top-k gating over a replicated router projection.
///
/// Every rank computes the same routing decision from the same input, so
/// the gate weight is deliberately unsharded. Exact score ties select the
/// lower expert index.
#[derive(Debug)]
pub struct Router {
    gate: Linear,
    num_experts: usize,
    top_k: usize,
    renormalize: bool,
}

impl Router {
    pub fn load(hidden_size: usize, spec: &MoeSpec, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get((spec.num_experts, hidden_size), "weight")?;
        Ok(Self {
            gate: Linear::new(weight, None),
            num_experts: spec.num_experts,
            top_k: spec.top_k,
            renormalize: spec.renormalize,
        })
    }

    pub fn num_experts(&self) -> usize {
        self.num_experts
    }

    pub fn top_k(&self) -> usize {
        self.top_k
    }

    /// Routes `[num_tokens, hidden_size]` activations. Selection runs on
    /// the host so the tie-break is deterministic across backends.
    pub fn route(&self, hidden_states: &Tensor) -> Result<RoutingTable> {
        let num_tokens = hidden_states.dim(0)?;
        let logits = self.gate.forward(hidden_states)?;
        let probs = candle_nn::ops::softmax(&logits, D::Minus1)?;
        let rows: Vec<Vec<f32>> = probs.to_dtype(DType::F32)?.to_vec2()?;
        if rows.len() != num_tokens {
            return Err(CoreError::shape(
                "router probabilities",
                format!("{num_tokens} rows"),
                format!("{}", rows.len()),
            ));
        }

        let mut experts = Vec::with_capacity(num_tokens * self.top_k);
        let mut weights = Vec::with_capacity(num_tokens * self.top_k);
        for row in rows {
            let mut order: Vec<usize> = (0..self.num_experts).collect();
            order.sort_by(|&a, &b| row[b].total_cmp(&row[a]).then(a.cmp(&b)));
            let selected = &order[..self.top_k];

            let mut selected_weights: Vec<f32> =
                selected.iter().map(|&e| row[e]).collect();
            if self.renormalize {
                let sum: f32 = selected_weights.iter().sum();
                for w in &mut selected_weights {
                    *w /= sum;
                }
            }

            experts.extend(selected.iter().map(|&e| e as u32));
            weights.extend(selected_weights);
        }

        Ok(RoutingTable {
            experts,
            weights,
            top_k: self.top_k,
        })
    }
}
