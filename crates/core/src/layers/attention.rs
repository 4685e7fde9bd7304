use candle_core::Tensor;
use candle_nn::ops::softmax_last_dim;

use crate::error::{CoreError, Result};
use crate::kv_cache::{BlockTable, KvCache};
use crate::layers::mask::causal_mask;

/// Per-call batch descriptor for the attention dispatcher.
///
/// Activations arrive packed: all sequences concatenated along the token
/// axis with no padding. The presence of `cu_seqlen_prefill` selects the
/// mode: `Some` means prefill over the spans it delimits, `None` means
/// decode with exactly one new token per sequence.
#[derive(Debug, Clone)]
pub struct ForwardBatch {
    cu_seqlen_prefill: Option<Vec<usize>>,
    cache_lengths: Vec<usize>,
    slots: Vec<usize>,
    block_tables: Vec<BlockTable>,
}

impl ForwardBatch {
    /// Prefill over `cu_seqlens.len() - 1` sequences. `cu_seqlens` holds
    /// cumulative token offsets starting at 0; `cache_lengths[i]` is the
    /// number of tokens already cached for sequence `i` (non-zero for a
    /// continuation of an earlier call).
    pub fn prefill(
        cu_seqlens: Vec<usize>,
        cache_lengths: Vec<usize>,
        slots: Vec<usize>,
        block_tables: Vec<BlockTable>,
    ) -> Result<Self> {
        if cu_seqlens.len() < 2 {
            return Err(CoreError::shape(
                "cu_seqlen_prefill",
                "at least 2 offsets",
                format!("{}", cu_seqlens.len()),
            ));
        }
        if cu_seqlens[0] != 0 {
            return Err(CoreError::shape(
                "cu_seqlen_prefill",
                "first offset 0",
                format!("{}", cu_seqlens[0]),
            ));
        }
        if cu_seqlens.windows(2).any(|w| w[1] <= w[0]) {
            return Err(CoreError::shape(
                "cu_seqlen_prefill",
                "strictly increasing offsets",
                format!("{cu_seqlens:?}"),
            ));
        }
        let num_sequences = cu_seqlens.len() - 1;
        let num_tokens = cu_seqlens[num_sequences];
        Self::check_per_sequence(num_sequences, &cache_lengths, &block_tables)?;
        if slots.len() != num_tokens {
            return Err(CoreError::shape(
                "slots",
                format!("{num_tokens} entries"),
                format!("{}", slots.len()),
            ));
        }
        Ok(Self {
            cu_seqlen_prefill: Some(cu_seqlens),
            cache_lengths,
            slots,
            block_tables,
        })
    }

    /// Decode: one new token per sequence, in sequence order.
    pub fn decode(
        cache_lengths: Vec<usize>,
        slots: Vec<usize>,
        block_tables: Vec<BlockTable>,
    ) -> Result<Self> {
        let num_sequences = cache_lengths.len();
        if num_sequences == 0 {
            return Err(CoreError::shape(
                "cache_lengths",
                "at least 1 sequence",
                "0".to_string(),
            ));
        }
        Self::check_per_sequence(num_sequences, &cache_lengths, &block_tables)?;
        if slots.len() != num_sequences {
            return Err(CoreError::shape(
                "slots",
                format!("{num_sequences} entries (one per sequence)"),
                format!("{}", slots.len()),
            ));
        }
        Ok(Self {
            cu_seqlen_prefill: None,
            cache_lengths,
            slots,
            block_tables,
        })
    }

    fn check_per_sequence(
        num_sequences: usize,
        cache_lengths: &[usize],
        block_tables: &[BlockTable],
    ) -> Result<()> {
        if cache_lengths.len() != num_sequences {
            return Err(CoreError::shape(
                "cache_lengths",
                format!("{num_sequences} entries"),
                format!("{}", cache_lengths.len()),
            ));
        }
        if block_tables.len() != num_sequences {
            return Err(CoreError::shape(
                "block_tables",
                format!("{num_sequences} entries"),
                format!("{}", block_tables.len()),
            ));
        }
        Ok(())
    }

    pub fn is_prefill(&self) -> bool {
        self.cu_seqlen_prefill.is_some()
    }

    pub fn cu_seqlen_prefill(&self) -> Option<&[usize]> {
        self.cu_seqlen_prefill.as_deref()
    }

    pub fn num_sequences(&self) -> usize {
        self.cache_lengths.len()
    }

    /// Packed token count carried by this call.
    pub fn num_tokens(&self) -> usize {
        match &self.cu_seqlen_prefill {
            Some(cu) => cu[cu.len() - 1],
            None => self.cache_lengths.len(),
        }
    }

    pub fn cache_lengths(&self) -> &[usize] {
        &self.cache_lengths
    }

    pub fn slots(&self) -> &[usize] {
        &self.slots
    }

    pub fn block_tables(&self) -> &[BlockTable] {
        &self.block_tables
    }
}

/// How decode reads relate to a configured sliding window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheWindowing {
    /// Every written slot stays addressable; the dispatcher applies window
    /// limits at read time.
    Unbounded,
    /// The allocator recycles slots beyond the window and reads see a
    /// rolling buffer.
    Rolling,
}

/// What the attention backend can express, declared up front so
/// impossible combinations are rejected at construction instead of
/// surfacing mid-batch.
#[derive(Debug, Clone, Copy)]
pub struct AttentionCapabilities {
    pub supports_sliding_window: bool,
    pub cache_windowing: CacheWindowing,
}

impl AttentionCapabilities {
    /// Capabilities of the built-in reference backend.
    pub fn reference() -> Self {
        Self {
            supports_sliding_window: true,
            cache_windowing: CacheWindowing::Unbounded,
        }
    }
}

/// Routes each forward call to dense prefill or paged decode attention
/// over a shared slot-addressed cache.
///
/// Head counts are per-rank values. New keys/values are stored before
/// either read path runs, so prefill tokens can attend to themselves and
/// the next decode step observes them.
#[derive(Debug)]
pub struct AttentionDispatcher {
    kv_head_mapping: Tensor,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
    softmax_scale: f64,
    sliding_window: Option<usize>,
}

impl AttentionDispatcher {
    pub fn new(
        num_heads: usize,
        num_kv_heads: usize,
        head_dim: usize,
        softmax_scale: f64,
        sliding_window: Option<usize>,
        capabilities: AttentionCapabilities,
        device: &candle_core::Device,
    ) -> Result<Self> {
        if num_kv_heads == 0 || num_heads % num_kv_heads != 0 {
            return Err(CoreError::config(format!(
                "num_heads ({num_heads}) must be a multiple of num_kv_heads ({num_kv_heads})"
            )));
        }
        if sliding_window == Some(0) {
            return Err(CoreError::config("sliding_window must be non-zero"));
        }
        if sliding_window.is_some() && !capabilities.supports_sliding_window {
            return Err(CoreError::unsupported(
                "sliding-window attention on a backend without window support",
            ));
        }
        if capabilities.cache_windowing == CacheWindowing::Rolling {
            return Err(CoreError::unsupported(
                "rolling cache windows; decode reads assume an unbounded slot space",
            ));
        }

        // Each query head reads one KV head, in contiguous groups.
        let group_size = num_heads / num_kv_heads;
        let mapping: Vec<u32> = (0..num_heads).map(|h| (h / group_size) as u32).collect();
        let kv_head_mapping = Tensor::from_vec(mapping, (num_heads,), device)?;

        Ok(Self {
            kv_head_mapping,
            num_heads,
            num_kv_heads,
            head_dim,
            softmax_scale,
            sliding_window,
        })
    }

    /// `query` is `[num_tokens, num_heads, head_dim]`, `key`/`value` are
    /// `[num_tokens, num_kv_heads, head_dim]`, all packed and post-rotary.
    /// Returns `[num_tokens, num_heads * head_dim]`.
    pub fn forward(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        batch: &ForwardBatch,
        cache: &mut KvCache,
    ) -> Result<Tensor> {
        let expected = [batch.num_tokens(), self.num_heads, self.head_dim];
        if query.dims() != expected {
            return Err(CoreError::shape(
                "attention query",
                format!("{expected:?}"),
                format!("{:?}", query.dims()),
            ));
        }
        let expected_kv = [batch.num_tokens(), self.num_kv_heads, self.head_dim];
        if key.dims() != expected_kv {
            return Err(CoreError::shape(
                "attention key",
                format!("{expected_kv:?}"),
                format!("{:?}", key.dims()),
            ));
        }
        if value.dims() != expected_kv {
            return Err(CoreError::shape(
                "attention value",
                format!("{expected_kv:?}"),
                format!("{:?}", value.dims()),
            ));
        }

        // Store first: prefill reads its own tokens through the dense
        // span, decode reads them back from the cache.
        cache.store(key, value, batch.slots())?;

        match batch.cu_seqlen_prefill() {
            Some(cu_seqlens) => self.forward_prefill(query, key, value, cu_seqlens, batch, cache),
            None => self.forward_decode(query, batch, cache),
        }
    }

    fn forward_prefill(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        cu_seqlens: &[usize],
        batch: &ForwardBatch,
        cache: &KvCache,
    ) -> Result<Tensor> {
        let mut outputs = Vec::with_capacity(batch.num_sequences());
        for (seq, span) in cu_seqlens.windows(2).enumerate() {
            let (start, len) = (span[0], span[1] - span[0]);
            let cache_length = batch.cache_lengths()[seq];

            let q_seq = query.narrow(0, start, len)?;
            let k_new = key.narrow(0, start, len)?.contiguous()?;
            let v_new = value.narrow(0, start, len)?.contiguous()?;

            let (k_seq, v_seq) = if cache_length > 0 {
                let history = batch.block_tables()[seq].slots(cache_length)?;
                let (k_hist, v_hist) = cache.gather(&history)?;
                (
                    Tensor::cat(&[&k_hist, &k_new], 0)?,
                    Tensor::cat(&[&v_hist, &v_new], 0)?,
                )
            } else {
                (k_new, v_new)
            };

            let mask = causal_mask(
                len,
                cache_length,
                self.sliding_window,
                query.dtype(),
                query.device(),
            )?;
            outputs.push(self.attend(&q_seq, &k_seq, &v_seq, Some(&mask))?);
        }
        Ok(Tensor::cat(&outputs, 0)?)
    }

    fn forward_decode(
        &self,
        query: &Tensor,
        batch: &ForwardBatch,
        cache: &KvCache,
    ) -> Result<Tensor> {
        let mut outputs = Vec::with_capacity(batch.num_sequences());
        for seq in 0..batch.num_sequences() {
            let total_length = batch.cache_lengths()[seq] + 1;
            let first_visible = match self.sliding_window {
                Some(window) => total_length.saturating_sub(window),
                None => 0,
            };
            let table = &batch.block_tables()[seq];
            let visible: Vec<usize> = (first_visible..total_length)
                .map(|position| table.slot(position))
                .collect::<Result<_>>()?;

            let (k_seq, v_seq) = cache.gather(&visible)?;
            let q_seq = query.narrow(0, seq, 1)?;
            outputs.push(self.attend(&q_seq, &k_seq, &v_seq, None)?);
        }
        Ok(Tensor::cat(&outputs, 0)?)
    }

    /// Dense attention for one sequence. `q` is `[q_len, num_heads, d]`,
    /// `k`/`v` are `[kv_len, num_kv_heads, d]`, `mask` is `[q_len, kv_len]`.
    fn attend(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        mask: Option<&Tensor>,
    ) -> Result<Tensor> {
        let q_len = q.dim(0)?;

        let q = q.transpose(0, 1)?.contiguous()?;
        let k = k
            .transpose(0, 1)?
            .contiguous()?
            .index_select(&self.kv_head_mapping, 0)?;
        let v = v
            .transpose(0, 1)?
            .contiguous()?
            .index_select(&self.kv_head_mapping, 0)?;

        let scores = (q.matmul(&k.transpose(1, 2)?)? * self.softmax_scale)?;
        let scores = match mask {
            Some(mask) => scores.broadcast_add(mask)?,
            None => scores,
        };
        let probs = softmax_last_dim(&scores)?;
        let context = probs.matmul(&v)?;

        Ok(context
            .transpose(0, 1)?
            .contiguous()?
            .reshape((q_len, self.num_heads * self.head_dim))?)
    }
}
