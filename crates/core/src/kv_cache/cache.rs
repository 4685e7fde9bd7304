use candle_core::{DType, Device, Tensor};

use crate::error::{CoreError, Result};

/// One layer's key/value store, addressed by physical slot.
///
/// Layout is `[num_slots, num_kv_heads, head_dim]` for both buffers. Slot
/// assignment lives with the serving layer; this type only performs the
/// indexed writes and reads it is asked for, and rejects any slot outside
/// the allocated range instead of clamping.
pub struct KvCache {
    key: Tensor,
    value: Tensor,
    num_slots: usize,
    num_kv_heads: usize,
    head_dim: usize,
}

impl KvCache {
    pub fn new(
        num_slots: usize,
        num_kv_heads: usize,
        head_dim: usize,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        let shape = (num_slots, num_kv_heads, head_dim);
        Ok(Self {
            key: Tensor::zeros(shape, dtype, device)?,
            value: Tensor::zeros(shape, dtype, device)?,
            num_slots,
            num_kv_heads,
            head_dim,
        })
    }

    /// Allocates one cache per decoder layer.
    pub fn for_layers(
        num_layers: usize,
        num_slots: usize,
        num_kv_heads: usize,
        head_dim: usize,
        dtype: DType,
        device: &Device,
    ) -> Result<Vec<Self>> {
        tracing::debug!(
            num_layers,
            num_slots,
            num_kv_heads,
            head_dim,
            "allocating kv caches"
        );
        (0..num_layers)
            .map(|_| Self::new(num_slots, num_kv_heads, head_dim, dtype, device))
            .collect()
    }

    pub fn num_slots(&self) -> usize {
        self.num_slots
    }

    pub fn num_kv_heads(&self) -> usize {
        self.num_kv_heads
    }

    pub fn head_dim(&self) -> usize {
        self.head_dim
    }

    fn check_slots(&self, slots: &[usize]) -> Result<()> {
        for &slot in slots {
            if slot >= self.num_slots {
                return Err(CoreError::CacheIndex {
                    slot,
                    capacity: self.num_slots,
                });
            }
        }
        Ok(())
    }

    fn check_kv_shape(&self, context: &str, tensor: &Tensor, num_tokens: usize) -> Result<()> {
        let expected = [num_tokens, self.num_kv_heads, self.head_dim];
        if tensor.dims() != expected {
            return Err(CoreError::shape(
                context,
                format!("{expected:?}"),
                format!("{:?}", tensor.dims()),
            ));
        }
        Ok(())
    }

    /// Writes one token's key/value per slot. `key` and `value` are
    /// `[num_tokens, num_kv_heads, head_dim]`, aligned 1:1 with `slots`.
    ///
    /// Must run before the attention read of the same forward call so the
    /// new tokens are visible to themselves in prefill and to the next
    /// decode step.
    pub fn store(&mut self, key: &Tensor, value: &Tensor, slots: &[usize]) -> Result<()> {
        let num_tokens = slots.len();
        if num_tokens == 0 {
            return Ok(());
        }
        self.check_kv_shape("cache store key", key, num_tokens)?;
        self.check_kv_shape("cache store value", value, num_tokens)?;
        self.check_slots(slots)?;

        let indices = Tensor::from_vec(
            slots.iter().map(|&s| s as u32).collect::<Vec<_>>(),
            (num_tokens,),
            self.key.device(),
        )?
        .reshape((num_tokens, 1, 1))?
        .expand((num_tokens, self.num_kv_heads, self.head_dim))?
        .contiguous()?;

        self.key.scatter_set(&indices, &key.contiguous()?, 0)?;
        self.value.scatter_set(&indices, &value.contiguous()?, 0)?;
        Ok(())
    }

    /// Reads the given slots in order. Returns `(key, value)`, each
    /// `[num_slots_read, num_kv_heads, head_dim]`.
    pub fn gather(&self, slots: &[usize]) -> Result<(Tensor, Tensor)> {
        self.check_slots(slots)?;

        let indices = Tensor::from_vec(
            slots.iter().map(|&s| s as u32).collect::<Vec<_>>(),
            (slots.len(),),
            self.key.device(),
        )?;
        let key = self.key.index_select(&indices, 0)?;
        let value = self.value.index_select(&indices, 0)?;
        Ok((key, value))
    }

    /// Zeroes both buffers; capacity and layout are unchanged.
    pub fn reset(&mut self) -> Result<()> {
        self.key = self.key.zeros_like()?;
        self.value = self.value.zeros_like()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token_rows(values: &[f32], heads: usize, dim: usize) -> Tensor {
        // One constant row per token, easy to identify after a gather.
        let mut data = Vec::with_capacity(values.len() * heads * dim);
        for &v in values {
            data.extend(std::iter::repeat(v).take(heads * dim));
        }
        Tensor::from_vec(data, (values.len(), heads, dim), &Device::Cpu).unwrap()
    }

    fn first_values(tensor: &Tensor) -> Vec<f32> {
        let rows: Vec<Vec<Vec<f32>>> = tensor.to_vec3().unwrap();
        rows.iter().map(|r| r[0][0]).collect()
    }

    #[test]
    fn store_then_gather_preserves_slot_order() {
        let mut cache = KvCache::new(16, 2, 4, DType::F32, &Device::Cpu).unwrap();
        let k = token_rows(&[10.0, 20.0, 30.0], 2, 4);
        let v = token_rows(&[1.0, 2.0, 3.0], 2, 4);

        // Slots deliberately non-contiguous and out of order.
        cache.store(&k, &v, &[5, 2, 9]).unwrap();

        let (k_read, v_read) = cache.gather(&[2, 5, 9]).unwrap();
        assert_eq!(first_values(&k_read), vec![20.0, 10.0, 30.0]);
        assert_eq!(first_values(&v_read), vec![2.0, 1.0, 3.0]);
    }

    #[test]
    fn decode_read_sees_new_token_after_history() {
        let mut cache = KvCache::new(8, 1, 2, DType::F32, &Device::Cpu).unwrap();

        let k_prefill = token_rows(&[1.0, 2.0, 3.0], 1, 2);
        cache.store(&k_prefill, &k_prefill, &[0, 1, 2]).unwrap();

        let k_decode = token_rows(&[4.0], 1, 2);
        cache.store(&k_decode, &k_decode, &[3]).unwrap();

        let (k_read, _) = cache.gather(&[0, 1, 2, 3]).unwrap();
        assert_eq!(first_values(&k_read), vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn store_rejects_out_of_range_slot() {
        let mut cache = KvCache::new(4, 1, 2, DType::F32, &Device::Cpu).unwrap();
        let k = token_rows(&[1.0], 1, 2);

        let err = cache.store(&k, &k, &[4]).unwrap_err();
        assert!(matches!(
            err,
            CoreError::CacheIndex {
                slot: 4,
                capacity: 4
            }
        ));
    }

    #[test]
    fn gather_rejects_out_of_range_slot() {
        let cache = KvCache::new(4, 1, 2, DType::F32, &Device::Cpu).unwrap();
        let err = cache.gather(&[0, 7]).unwrap_err();
        assert!(matches!(err, CoreError::CacheIndex { slot: 7, .. }));
    }

    #[test]
    fn store_rejects_mismatched_token_count() {
        let mut cache = KvCache::new(4, 1, 2, DType::F32, &Device::Cpu).unwrap();
        let k = token_rows(&[1.0, 2.0], 1, 2);

        let err = cache.store(&k, &k, &[0]).unwrap_err();
        assert!(matches!(err, CoreError::Shape { .. }));
    }

    #[test]
    fn reset_clears_contents() {
        let mut cache = KvCache::new(4, 1, 2, DType::F32, &Device::Cpu).unwrap();
        let k = token_rows(&[9.0], 1, 2);
        cache.store(&k, &k, &[1]).unwrap();

        cache.reset().unwrap();

        let (k_read, v_read) = cache.gather(&[1]).unwrap();
        assert_eq!(first_values(&k_read), vec![0.0]);
        assert_eq!(first_values(&v_read), vec![0.0]);
    }
}
