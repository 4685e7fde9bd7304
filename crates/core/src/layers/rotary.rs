use candle_core::{DType, Device, Tensor};

use crate::config::RotarySpec;
use crate::error::{CoreError, Result};

/// Rotary position encoder.
///
/// The rotation strategy is fixed at construction from the model plan:
/// full rotation over the whole head, partial rotation over a leading
/// prefix, or sectioned rotation driven by 3-axis position ids. The
/// apply path never inspects model identity.
///
/// Frequency tables are precomputed once per model up to the maximum
/// position; per-token rows are gathered from them each forward pass.
#[derive(Debug)]
pub struct RotaryEncoder {
    sin: Tensor,
    cos: Tensor,
    head_dim: usize,
    rotary_dim: usize,
    /// Per-axis frequency column counts for 3-axis position ids.
    sections: Option<Vec<usize>>,
}

impl RotaryEncoder {
    pub fn new(
        spec: &RotarySpec,
        head_dim: usize,
        max_position: usize,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        let rotary_dim = spec.rotary_dim;
        if rotary_dim == 0 || rotary_dim % 2 != 0 || rotary_dim > head_dim {
            return Err(CoreError::config(format!(
                "rotary_dim ({rotary_dim}) must be even and at most head_dim ({head_dim})"
            )));
        }
        if let Some(sections) = &spec.mrope_section {
            let sum: usize = sections.iter().sum();
            if sum != rotary_dim / 2 {
                return Err(CoreError::config(format!(
                    "mrope_section sum ({sum}) must equal rotary_dim / 2 ({})",
                    rotary_dim / 2
                )));
            }
        }

        // inv_freq[i] = 1 / theta^(2i / rotary_dim)
        let inv_freq: Vec<f32> = (0..rotary_dim)
            .step_by(2)
            .map(|i| 1.0 / (spec.theta as f32).powf(i as f32 / rotary_dim as f32))
            .collect();
        let inv_freq_len = inv_freq.len();
        let inv_freq = Tensor::from_vec(inv_freq, (1, inv_freq_len), device)?;
        let t = Tensor::arange(0u32, max_position as u32, device)?
            .to_dtype(DType::F32)?
            .reshape((max_position, 1))?;
        let freqs = t.matmul(&inv_freq)?;

        Ok(Self {
            sin: freqs.sin()?.to_dtype(dtype)?,
            cos: freqs.cos()?.to_dtype(dtype)?,
            head_dim,
            rotary_dim,
            sections: spec.mrope_section.clone(),
        })
    }

    pub fn rotary_dim(&self) -> usize {
        self.rotary_dim
    }

    pub fn is_sectioned(&self) -> bool {
        self.sections.is_some()
    }

    /// Gather the cos/sin rows for one batch of position ids.
    ///
    /// Computed once per forward pass and shared by every layer.
    /// Single-axis modes take `[num_tokens]` ids; sectioned mode takes the
    /// `[num_tokens, 3]` matrix produced by the position builder.
    pub fn cos_sin(&self, position_ids: &Tensor) -> Result<(Tensor, Tensor)> {
        match &self.sections {
            None => {
                if position_ids.rank() != 1 {
                    return Err(CoreError::shape(
                        "position ids",
                        "[num_tokens]",
                        format!("{:?}", position_ids.dims()),
                    ));
                }
                let cos = self.cos.index_select(position_ids, 0)?;
                let sin = self.sin.index_select(position_ids, 0)?;
                Ok((cos, sin))
            }
            Some(sections) => {
                if position_ids.rank() != 2 || position_ids.dim(1)? != 3 {
                    return Err(CoreError::shape(
                        "position ids",
                        "[num_tokens, 3]",
                        format!("{:?}", position_ids.dims()),
                    ));
                }
                // Each axis contributes its own section of frequency
                // columns; rows are gathered per axis and stitched back
                // in section order.
                let mut cos_parts = Vec::with_capacity(sections.len());
                let mut sin_parts = Vec::with_capacity(sections.len());
                let mut offset = 0;
                for (axis, &width) in sections.iter().enumerate() {
                    let axis_ids = position_ids.narrow(1, axis, 1)?.squeeze(1)?.contiguous()?;
                    let cos = self.cos.index_select(&axis_ids, 0)?;
                    let sin = self.sin.index_select(&axis_ids, 0)?;
                    cos_parts.push(cos.narrow(1, offset, width)?);
                    sin_parts.push(sin.narrow(1, offset, width)?);
                    offset += width;
                }
                let cos = Tensor::cat(&cos_parts, 1)?.contiguous()?;
                let sin = Tensor::cat(&sin_parts, 1)?.contiguous()?;
                Ok((cos, sin))
            }
        }
    }

    /// Rotate query and key states.
    ///
    /// q: `[num_tokens, num_heads, head_dim]`,
    /// k: `[num_tokens, num_kv_heads, head_dim]`,
    /// cos/sin: `[num_tokens, rotary_dim / 2]` from [`Self::cos_sin`].
    ///
    /// In partial mode only the leading `rotary_dim` positions of each
    /// head rotate; the tail passes through untouched.
    pub fn apply(
        &self,
        q: &Tensor,
        k: &Tensor,
        cos: &Tensor,
        sin: &Tensor,
    ) -> Result<(Tensor, Tensor)> {
        let q = self.rotate(q, cos, sin)?;
        let k = self.rotate(k, cos, sin)?;
        Ok((q, k))
    }

    fn rotate(&self, x: &Tensor, cos: &Tensor, sin: &Tensor) -> Result<Tensor> {
        let (_, _, head_dim) = x.dims3()?;
        if head_dim != self.head_dim {
            return Err(CoreError::shape(
                "rotary input",
                format!("head_dim {}", self.head_dim),
                format!("head_dim {head_dim}"),
            ));
        }

        // rope expects [b, h, t, d].
        let x = x.transpose(0, 1)?.unsqueeze(0)?.contiguous()?;

        let rotated = if self.rotary_dim == head_dim {
            candle_nn::rotary_emb::rope(&x, cos, sin)?
        } else {
            let x_rot = x.narrow(3, 0, self.rotary_dim)?.contiguous()?;
            let x_pass = x
                .narrow(3, self.rotary_dim, head_dim - self.rotary_dim)?
                .contiguous()?;
            let x_rot = candle_nn::rotary_emb::rope(&x_rot, cos, sin)?;
            Tensor::cat(&[x_rot, x_pass], 3)?
        };

        Ok(rotated.squeeze(0)?.transpose(0, 1)?.contiguous()?)
    }
}
