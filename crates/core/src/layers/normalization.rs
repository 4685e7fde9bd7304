use candle_core::{Module, Tensor};
use candle_nn::{LayerNorm, VarBuilder};

use crate::config::{NormKind, NormSpec};
use crate::error::Result;

/// Pre-norm with the residual fold built in.
///
/// `forward(x, residual)` adds the residual exactly once, normalizes the
/// sum, and hands both back: the normed tensor feeds the next sublayer and
/// the un-normed sum becomes the next residual. Whether the norm is RMS or
/// full layer norm is fixed at construction from the model plan.
pub struct ResidualNorm {
    op: NormOp,
}

enum NormOp {
    Rms { weight: Tensor, eps: f32 },
    Layer(LayerNorm),
}

impl ResidualNorm {
    pub fn load(size: usize, spec: NormSpec, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get(size, "weight")?;
        let op = match spec.kind {
            NormKind::Rms => NormOp::Rms {
                weight,
                eps: spec.eps as f32,
            },
            NormKind::Layer => {
                let bias = vb.get(size, "bias")?;
                NormOp::Layer(LayerNorm::new(weight, bias, spec.eps))
            }
        };
        Ok(Self { op })
    }

    /// Build an RMS variant from an existing weight.
    pub fn from_rms_weight(weight: Tensor, eps: f64) -> Self {
        Self {
            op: NormOp::Rms {
                weight,
                eps: eps as f32,
            },
        }
    }

    /// Returns `(normed, summed)` where `summed = x + residual` (or `x`
    /// alone at the start of a chain).
    pub fn forward(&self, x: &Tensor, residual: Option<&Tensor>) -> Result<(Tensor, Tensor)> {
        let summed = match residual {
            Some(residual) => (x + residual)?,
            None => x.clone(),
        };
        let normed = match &self.op {
            NormOp::Rms { weight, eps } => {
                candle_nn::ops::rms_norm(&summed.contiguous()?, weight, *eps)?
            }
            NormOp::Layer(norm) => norm.forward(&summed.contiguous()?)?,
        };
        Ok((normed, summed))
    }
}
