use candle_core::{DType, Device, Tensor};

use crate::error::Result;

/// Causal attention mask for one sequence of a prefill batch.
///
/// Returns `[seq_len, seq_len + seqlen_offset]` with 0 on visible slots and
/// -inf elsewhere; broadcasts over the head dimension when added to scores.
/// Row `i` sits at absolute position `i + seqlen_offset` and sees every
/// earlier position, bounded below by `sliding_window` when set (a window
/// of `w` admits the token itself plus the `w - 1` before it).
pub fn causal_mask(
    seq_len: usize,
    seqlen_offset: usize,
    sliding_window: Option<usize>,
    dtype: DType,
    device: &Device,
) -> Result<Tensor> {
    let total_len = seq_len + seqlen_offset;
    let mask: Vec<f32> = (0..seq_len)
        .flat_map(|i| {
            let pos = i + seqlen_offset;
            (0..total_len).map(move |j| {
                let visible = j <= pos
                    && match sliding_window {
                        Some(w) => j + w > pos,
                        None => true,
                    };
                if visible {
                    0.0
                } else {
                    f32::NEG_INFINITY
                }
            })
        })
        .collect();
    let mask = Tensor::from_vec(mask, (seq_len, total_len), device)?;
    Ok(mask.to_dtype(dtype)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mask_rows(mask: &Tensor) -> Vec<Vec<f32>> {
        mask.to_vec2().unwrap()
    }

    #[test]
    fn lower_triangle_is_visible() {
        let mask = causal_mask(3, 0, None, DType::F32, &Device::Cpu).unwrap();
        let rows = mask_rows(&mask);

        assert_eq!(rows[0], vec![0.0, f32::NEG_INFINITY, f32::NEG_INFINITY]);
        assert_eq!(rows[1], vec![0.0, 0.0, f32::NEG_INFINITY]);
        assert_eq!(rows[2], vec![0.0, 0.0, 0.0]);
    }

    #[test]
    fn offset_exposes_cached_positions() {
        let mask = causal_mask(2, 3, None, DType::F32, &Device::Cpu).unwrap();
        let rows = mask_rows(&mask);

        // Row 0 is absolute position 3: sees slots 0..=3 of 5.
        assert_eq!(rows[0], vec![0.0, 0.0, 0.0, 0.0, f32::NEG_INFINITY]);
        assert_eq!(rows[1], vec![0.0, 0.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn sliding_window_bounds_lookback() {
        let mask = causal_mask(4, 0, Some(2), DType::F32, &Device::Cpu).unwrap();
        let rows = mask_rows(&mask);

        let inf = f32::NEG_INFINITY;
        // Window of 2: self plus one predecessor.
        assert_eq!(rows[0], vec![0.0, inf, inf, inf]);
        assert_eq!(rows[1], vec![0.0, 0.0, inf, inf]);
        assert_eq!(rows[2], vec![inf, 0.0, 0.0, inf]);
        assert_eq!(rows[3], vec![inf, inf, 0.0, 0.0]);
    }

    #[test]
    fn sliding_window_with_offset() {
        let mask = causal_mask(1, 4, Some(3), DType::F32, &Device::Cpu).unwrap();
        let rows = mask_rows(&mask);

        let inf = f32::NEG_INFINITY;
        // Absolute position 4 with window 3 sees slots 2, 3, 4.
        assert_eq!(rows[0], vec![inf, inf, 0.0, 0.0, 0.0]);
    }
}
