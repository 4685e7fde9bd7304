//! Sharded linear layers for tensor parallelism.
//!
//! # Column parallel
//! Splits the output dimension: each rank computes a slice of the output.
//! Used for QKV and gate/up projections.
//!
//! # Row parallel
//! Splits the input dimension: each rank holds a slice of the weight and
//! the partial products are summed with an all-reduce.
//! Used for attention output and down projections.
//!
//! # Weight loading
//!
//! Checkpoints contain full, unsharded tensors. Each layer loads the full
//! tensor and extracts its shard at construction:
//! - column parallel slices the output dimension (dim 0 of the weight)
//! - row parallel slices the input dimension (dim 1)
//! - vocab parallel slices the vocabulary dimension (dim 0 of the table)
//!
//! Every divisibility requirement is checked here and surfaces as a
//! configuration error; shard sizes are never rounded.

use candle_core::{IndexOp, Tensor};
use candle_nn::VarBuilder;

use crate::config::ProjectionLayout;
use crate::error::{CoreError, Result};
use crate::lora::LowRankAdapter;

use super::communicator::{DeviceCommunicator, ReduceOp};
use super::process_group::ProcessGroup;

fn check_divisible(what: &str, value: usize, world_size: usize) -> Result<usize> {
    if value % world_size != 0 {
        return Err(CoreError::config(format!(
            "{what} ({value}) must be divisible by world size ({world_size})"
        )));
    }
    Ok(value / world_size)
}

/// Collapse leading dimensions into rows, checking the trailing dimension
/// against the weight shard's input width.
fn flatten_input(input: &Tensor, expected_in: usize, what: &str) -> Result<Tensor> {
    let dims = input.dims();
    let in_features = *dims
        .last()
        .ok_or_else(|| CoreError::shape(what, "at least 1 dimension", "0 dimensions"))?;
    if in_features != expected_in {
        return Err(CoreError::shape(
            what,
            format!("trailing dimension {expected_in}"),
            format!("trailing dimension {in_features}"),
        ));
    }
    let rows: usize = dims.iter().rev().skip(1).product();
    Ok(input.reshape((rows, in_features))?)
}

/// Slice a rank's rows out of a tensor laid out as consecutive sections.
///
/// `sections` holds the full row count of each constituent (e.g. Q, K, V of
/// a fused projection). Each section is sharded independently and the
/// per-rank slices are concatenated back in section order.
fn shard_sections(full: &Tensor, sections: &[usize], rank: usize, world_size: usize) -> Result<Tensor> {
    let mut offset = 0;
    let mut shards = Vec::with_capacity(sections.len());
    for &section in sections {
        let per_rank = section / world_size;
        shards.push(full.narrow(0, offset + rank * per_rank, per_rank)?);
        offset += section;
    }
    Ok(Tensor::cat(&shards, 0)?.contiguous()?)
}

/// Column-parallel linear layer.
///
/// Each rank computes `output_slice = input @ weight_slice.T + bias_slice`.
/// The slices are either consumed as-is by a following row-parallel layer
/// or assembled with an all-gather when `gather_output` is set.
#[derive(Debug)]
pub struct ColumnParallelLinear {
    /// Weight: `[out_features / world_size, in_features]`
    weight: Tensor,
    /// Optional bias: `[out_features / world_size]`
    bias: Option<Tensor>,
    tp_size: usize,
    tp_rank: usize,
    gather_output: bool,
}

impl ColumnParallelLinear {
    /// Load the full weight from the checkpoint and keep this rank's shard.
    pub fn new(
        in_features: usize,
        out_features: usize,
        bias: bool,
        gather_output: bool,
        vb: VarBuilder,
        pg: &dyn ProcessGroup,
    ) -> Result<Self> {
        let tp_size = pg.world_size();
        let tp_rank = pg.rank();
        let out_per_rank = check_divisible("out_features", out_features, tp_size)?;

        let start = tp_rank * out_per_rank;
        let end = start + out_per_rank;

        let full_weight = vb.get((out_features, in_features), "weight")?;
        let weight = full_weight.i(start..end)?.contiguous()?;

        let bias = if bias {
            let full_bias = vb.get(out_features, "bias")?;
            Some(full_bias.i(start..end)?.contiguous()?)
        } else {
            None
        };

        Ok(Self {
            weight,
            bias,
            tp_size,
            tp_rank,
            gather_output,
        })
    }

    /// Create from an already-sharded weight.
    pub fn from_parts(
        weight: Tensor,
        bias: Option<Tensor>,
        tp_size: usize,
        tp_rank: usize,
        gather_output: bool,
    ) -> Self {
        Self {
            weight,
            bias,
            tp_size,
            tp_rank,
            gather_output,
        }
    }

    pub fn forward(&self, input: &Tensor, comm: &dyn DeviceCommunicator) -> Result<Tensor> {
        self.forward_adapted(input, comm, None)
    }

    /// Forward with an optional low-rank delta folded into the local
    /// output slice. The delta's up-projection is sharded like the weight,
    /// so it joins before any gather.
    pub fn forward_adapted(
        &self,
        input: &Tensor,
        comm: &dyn DeviceCommunicator,
        adapter: Option<&LowRankAdapter>,
    ) -> Result<Tensor> {
        let input_dims = input.dims();
        let flat_input = flatten_input(input, self.weight.dim(1)?, "column-parallel input")?;
        let mut output = flat_input.matmul(&self.weight.t()?)?;

        if let Some(adapter) = adapter {
            output = (output + adapter.delta(&flat_input)?)?;
        }

        if let Some(bias) = &self.bias {
            output = output.broadcast_add(bias)?;
        }

        if self.gather_output && self.tp_size > 1 {
            output = comm.all_gather(&output, 1)?;
        }

        let mut out_shape: Vec<usize> = input_dims[..input_dims.len() - 1].to_vec();
        out_shape.push(output.dim(1)?);
        Ok(output.reshape(out_shape.as_slice())?)
    }

    pub fn tp_rank(&self) -> usize {
        self.tp_rank
    }

    pub fn tp_size(&self) -> usize {
        self.tp_size
    }

    pub(crate) fn weight(&self) -> &Tensor {
        &self.weight
    }

    pub(crate) fn bias(&self) -> Option<&Tensor> {
        self.bias.as_ref()
    }
}

/// Row-parallel linear layer.
///
/// Each rank computes `partial = input_slice @ weight_slice.T`; an
/// all-reduce sums the partials. The bias is added once, after the reduce.
#[derive(Debug)]
pub struct RowParallelLinear {
    /// Weight: `[out_features, in_features / world_size]`
    weight: Tensor,
    /// Optional bias: `[out_features]`, unsharded.
    bias: Option<Tensor>,
    tp_size: usize,
    tp_rank: usize,
}

impl RowParallelLinear {
    /// Load the full weight from the checkpoint and keep this rank's shard.
    pub fn new(
        in_features: usize,
        out_features: usize,
        bias: bool,
        vb: VarBuilder,
        pg: &dyn ProcessGroup,
    ) -> Result<Self> {
        let tp_size = pg.world_size();
        let tp_rank = pg.rank();
        let in_per_rank = check_divisible("in_features", in_features, tp_size)?;

        let start = tp_rank * in_per_rank;
        let end = start + in_per_rank;

        let full_weight = vb.get((out_features, in_features), "weight")?;
        let weight = full_weight.i((.., start..end))?.contiguous()?;

        let bias = if bias {
            Some(vb.get(out_features, "bias")?)
        } else {
            None
        };

        Ok(Self {
            weight,
            bias,
            tp_size,
            tp_rank,
        })
    }

    /// Create from an already-sharded weight.
    pub fn from_parts(weight: Tensor, bias: Option<Tensor>, tp_size: usize, tp_rank: usize) -> Self {
        Self {
            weight,
            bias,
            tp_size,
            tp_rank,
        }
    }

    pub fn forward(&self, input: &Tensor, comm: &dyn DeviceCommunicator) -> Result<Tensor> {
        self.forward_adapted(input, comm, None)
    }

    /// Rank-local partial product without the closing all-reduce. The
    /// caller owns the reduction point; bias is skipped and must be added
    /// after summing across ranks.
    pub fn forward_partial(&self, input: &Tensor) -> Result<Tensor> {
        let input_dims = input.dims();
        let flat_input = flatten_input(input, self.weight.dim(1)?, "row-parallel input")?;
        let output = flat_input.matmul(&self.weight.t()?)?;

        let mut out_shape: Vec<usize> = input_dims[..input_dims.len() - 1].to_vec();
        out_shape.push(output.dim(1)?);
        Ok(output.reshape(out_shape.as_slice())?)
    }

    /// Forward with an optional low-rank delta added to the rank-local
    /// partial product. The delta's down-projection is sharded like the
    /// weight, so a single all-reduce sums base and delta together.
    pub fn forward_adapted(
        &self,
        input: &Tensor,
        comm: &dyn DeviceCommunicator,
        adapter: Option<&LowRankAdapter>,
    ) -> Result<Tensor> {
        let input_dims = input.dims();
        let flat_input = flatten_input(input, self.weight.dim(1)?, "row-parallel input")?;
        let mut output = flat_input.matmul(&self.weight.t()?)?;

        if let Some(adapter) = adapter {
            output = (output + adapter.delta(&flat_input)?)?;
        }

        let mut output = if self.tp_size > 1 {
            comm.all_reduce(&output, ReduceOp::Sum)?
        } else {
            output
        };

        if let Some(bias) = &self.bias {
            output = output.broadcast_add(bias)?;
        }

        let mut out_shape: Vec<usize> = input_dims[..input_dims.len() - 1].to_vec();
        out_shape.push(output.dim(1)?);
        Ok(output.reshape(out_shape.as_slice())?)
    }

    pub fn tp_rank(&self) -> usize {
        self.tp_rank
    }

    pub fn tp_size(&self) -> usize {
        self.tp_size
    }
}

/// Fused query/key/value projection, column-parallel over heads.
///
/// Regardless of whether the checkpoint stores one fused slab or separate
/// `q_proj`/`k_proj`/`v_proj` tensors, the rank-local output is the same:
/// `[.., (num_heads_local + 2 * num_kv_heads_local) * head_dim]`, query
/// rows first. Callers split it by the local head counts.
#[derive(Debug)]
pub struct QkvLinear {
    proj: ColumnParallelLinear,
    query_size: usize,
    kv_size: usize,
}

impl QkvLinear {
    #[allow(clippy::too_many_arguments)]
    pub fn load(
        hidden_size: usize,
        num_heads: usize,
        num_kv_heads: usize,
        head_dim: usize,
        bias: bool,
        layout: ProjectionLayout,
        vb: VarBuilder,
        pg: &dyn ProcessGroup,
    ) -> Result<Self> {
        let tp_size = pg.world_size();
        let tp_rank = pg.rank();
        let heads_per_rank = check_divisible("num_attention_heads", num_heads, tp_size)?;
        let kv_heads_per_rank = check_divisible("num_key_value_heads", num_kv_heads, tp_size)?;

        let q_rows = num_heads * head_dim;
        let kv_rows = num_kv_heads * head_dim;
        let sections = [q_rows, kv_rows, kv_rows];

        let (weight, bias) = match layout {
            ProjectionLayout::Fused => {
                let vb = vb.pp("qkv_proj");
                let full = vb.get((q_rows + 2 * kv_rows, hidden_size), "weight")?;
                let weight = shard_sections(&full, &sections, tp_rank, tp_size)?;
                let bias = if bias {
                    let full = vb.get(q_rows + 2 * kv_rows, "bias")?;
                    Some(shard_sections(&full, &sections, tp_rank, tp_size)?)
                } else {
                    None
                };
                (weight, bias)
            }
            ProjectionLayout::Split => {
                let names = ["q_proj", "k_proj", "v_proj"];
                let mut weights = Vec::with_capacity(3);
                let mut biases = Vec::with_capacity(3);
                for (name, rows) in names.iter().zip(sections) {
                    let vb = vb.pp(name);
                    let per_rank = rows / tp_size;
                    let full = vb.get((rows, hidden_size), "weight")?;
                    weights.push(full.narrow(0, tp_rank * per_rank, per_rank)?);
                    if bias {
                        let full = vb.get(rows, "bias")?;
                        biases.push(full.narrow(0, tp_rank * per_rank, per_rank)?);
                    }
                }
                let weight = Tensor::cat(&weights, 0)?.contiguous()?;
                let bias = if bias {
                    Some(Tensor::cat(&biases, 0)?.contiguous()?)
                } else {
                    None
                };
                (weight, bias)
            }
        };

        Ok(Self {
            proj: ColumnParallelLinear::from_parts(weight, bias, tp_size, tp_rank, false),
            query_size: heads_per_rank * head_dim,
            kv_size: kv_heads_per_rank * head_dim,
        })
    }

    pub fn forward(&self, input: &Tensor, comm: &dyn DeviceCommunicator) -> Result<Tensor> {
        self.proj.forward(input, comm)
    }

    pub fn forward_adapted(
        &self,
        input: &Tensor,
        comm: &dyn DeviceCommunicator,
        adapter: Option<&LowRankAdapter>,
    ) -> Result<Tensor> {
        self.proj.forward_adapted(input, comm, adapter)
    }

    /// Rank-local width of the query slice.
    pub fn query_size(&self) -> usize {
        self.query_size
    }

    /// Rank-local width of each of the key and value slices.
    pub fn kv_size(&self) -> usize {
        self.kv_size
    }
}

/// Fused gate/up projection for gated MLPs, column-parallel.
///
/// Output is `[.., 2 * intermediate_local]`, gate rows first, for either
/// checkpoint layout.
#[derive(Debug)]
pub struct GateUpLinear {
    proj: ColumnParallelLinear,
    intermediate_per_rank: usize,
}

impl GateUpLinear {
    pub fn load(
        hidden_size: usize,
        intermediate_size: usize,
        layout: ProjectionLayout,
        vb: VarBuilder,
        pg: &dyn ProcessGroup,
    ) -> Result<Self> {
        let tp_size = pg.world_size();
        let tp_rank = pg.rank();
        let intermediate_per_rank =
            check_divisible("intermediate_size", intermediate_size, tp_size)?;

        let weight = match layout {
            ProjectionLayout::Fused => {
                let full = vb
                    .pp("gate_up_proj")
                    .get((2 * intermediate_size, hidden_size), "weight")?;
                shard_sections(
                    &full,
                    &[intermediate_size, intermediate_size],
                    tp_rank,
                    tp_size,
                )?
            }
            ProjectionLayout::Split => {
                let mut weights = Vec::with_capacity(2);
                for name in ["gate_proj", "up_proj"] {
                    let full = vb.pp(name).get((intermediate_size, hidden_size), "weight")?;
                    weights.push(full.narrow(
                        0,
                        tp_rank * intermediate_per_rank,
                        intermediate_per_rank,
                    )?);
                }
                Tensor::cat(&weights, 0)?.contiguous()?
            }
        };

        Ok(Self {
            proj: ColumnParallelLinear::from_parts(weight, None, tp_size, tp_rank, false),
            intermediate_per_rank,
        })
    }

    pub fn forward(&self, input: &Tensor, comm: &dyn DeviceCommunicator) -> Result<Tensor> {
        self.proj.forward(input, comm)
    }

    pub fn forward_adapted(
        &self,
        input: &Tensor,
        comm: &dyn DeviceCommunicator,
        adapter: Option<&LowRankAdapter>,
    ) -> Result<Tensor> {
        self.proj.forward_adapted(input, comm, adapter)
    }

    /// Rank-local width of each of the gate and up slices.
    pub fn intermediate_per_rank(&self) -> usize {
        self.intermediate_per_rank
    }
}

/// Vocabulary-parallel embedding.
///
/// Splits the vocabulary across ranks. Each token's row lives on exactly
/// one rank; lookups outside the local partition contribute zeros and the
/// all-reduce assembles the full embedding.
pub struct VocabParallelEmbedding {
    /// Embedding table: `[vocab_local, hidden_size]`
    embeddings: Tensor,
    tp_size: usize,
    /// Start of this rank's vocab partition.
    vocab_start: usize,
    /// End of the partition (exclusive).
    vocab_end: usize,
}

impl VocabParallelEmbedding {
    /// Load the full table from the checkpoint and keep this rank's rows.
    ///
    /// Uneven vocabularies are allowed; the last rank simply holds fewer
    /// rows.
    pub fn new(
        vocab_size: usize,
        hidden_size: usize,
        vb: VarBuilder,
        pg: &dyn ProcessGroup,
    ) -> Result<Self> {
        let tp_size = pg.world_size();
        let tp_rank = pg.rank();

        let vocab_per_rank = vocab_size.div_ceil(tp_size);
        let vocab_start = tp_rank * vocab_per_rank;
        let vocab_end = ((tp_rank + 1) * vocab_per_rank).min(vocab_size);

        let full = vb.get((vocab_size, hidden_size), "weight")?;
        let embeddings = full.i(vocab_start..vocab_end)?.contiguous()?;

        Ok(Self {
            embeddings,
            tp_size,
            vocab_start,
            vocab_end,
        })
    }

    /// Create from an already-sharded table.
    pub fn from_parts(embeddings: Tensor, vocab_size: usize, tp_size: usize, tp_rank: usize) -> Self {
        let vocab_per_rank = vocab_size.div_ceil(tp_size);
        let vocab_start = tp_rank * vocab_per_rank;
        let vocab_end = ((tp_rank + 1) * vocab_per_rank).min(vocab_size);

        Self {
            embeddings,
            tp_size,
            vocab_start,
            vocab_end,
        }
    }

    /// The rank-local slice of the table. Shared with a tied LM head.
    pub fn embeddings(&self) -> &Tensor {
        &self.embeddings
    }

    pub fn forward(&self, input_ids: &Tensor, comm: &dyn DeviceCommunicator) -> Result<Tensor> {
        let dtype = self.embeddings.dtype();
        let device = self.embeddings.device();
        let hidden_size = self.embeddings.dim(1)?;

        let input_shape = input_ids.dims();
        let flat_input = input_ids.flatten_all()?;

        if self.tp_size == 1 {
            let output = self.embeddings.embedding(&flat_input)?;
            let mut out_shape: Vec<usize> = input_shape.to_vec();
            out_shape.push(hidden_size);
            return Ok(output.reshape(out_shape.as_slice())?);
        }

        // Masked local lookup. Tokens outside [vocab_start, vocab_end) are
        // clamped to index 0 and zeroed out, so every token has a non-zero
        // row on exactly one rank and the sum reduce reassembles all rows.
        let input_i64 = flat_input.to_dtype(candle_core::DType::I64)?;

        let vocab_start_t =
            Tensor::new(&[self.vocab_start as i64], device)?.broadcast_as(input_i64.shape())?;
        let vocab_end_t =
            Tensor::new(&[self.vocab_end as i64], device)?.broadcast_as(input_i64.shape())?;

        let ge_start = input_i64.ge(&vocab_start_t)?;
        let lt_end = input_i64.lt(&vocab_end_t)?;
        let mask = ge_start.mul(&lt_end)?;

        let local_indices = (input_i64 - vocab_start_t)?;
        let max_local_idx = (self.vocab_end - self.vocab_start).saturating_sub(1) as i64;
        let local_indices = local_indices.clamp(0i64, max_local_idx)?;
        let local_indices = local_indices.to_dtype(candle_core::DType::U32)?;

        let embeddings = self.embeddings.embedding(&local_indices)?;
        let mask_f = mask.to_dtype(dtype)?.unsqueeze(1)?;
        let masked = embeddings.broadcast_mul(&mask_f)?;

        let output = comm.all_reduce(&masked, ReduceOp::Sum)?;

        let mut out_shape: Vec<usize> = input_shape.to_vec();
        out_shape.push(hidden_size);
        Ok(output.reshape(out_shape.as_slice())?)
    }
}
