//! Decoder layers composed into a tensor-parallel causal language model.
//!
//! Loading resolves every strategy choice up front: projection layouts
//! are probed from the checkpoint, dense or routed feed-forward comes
//! from the layer plan, tied embeddings reuse the vocab-parallel shard.
//! The forward path is a straight dual-stream pass over immutable layers.

mod attention;

use std::sync::Arc;

use candle_core::Tensor;
use candle_nn::VarBuilder;

use crate::config::{FeedForwardKind, LayerPlan, ModelPlan, ProjectionLayout};
use crate::distributed::{
    ColumnParallelLinear, DeviceCommunicator, ProcessGroup, ShardContext, VocabParallelEmbedding,
};
use crate::error::{CoreError, Result};
use crate::kv_cache::KvCache;
use crate::layers::{AttentionCapabilities, ForwardBatch, ResidualNorm, RotaryEncoder, ShardedMlp};
use crate::lora::AdapterSelection;
use crate::moe::MoeLayer;

use self::attention::SelfAttention;

/// Hook invoked after each decoder layer completes, letting a scheduler
/// interleave work with the forward pass. Implementations must not
/// change results; the default body does nothing.
pub trait StepMarker: Send + Sync {
    fn step(&self, layer_index: usize) -> Result<()> {
        let _ = layer_index;
        Ok(())
    }
}

/// Runs every layer back to back with no interleaved work.
#[derive(Debug, Clone, Copy, Default)]
pub struct EagerStep;

impl StepMarker for EagerStep {}

/// Input to the forward pass: token ids to embed, or hidden states
/// computed upstream (multimodal encoders, draft models).
#[derive(Debug, Clone, Copy)]
pub enum ModelInput<'a> {
    /// Rank-1 `u32` token ids, `[num_tokens]`.
    TokenIds(&'a Tensor),
    /// Precomputed embeddings, `[num_tokens, hidden_size]`.
    Embeddings(&'a Tensor),
}

/// Extra unembedding projections predicting the tokens after the next
/// one. The projections are built by an external loader; the model only
/// runs them over the same hidden rows as the main head.
#[derive(Debug)]
pub struct SpeculativeHead {
    heads: Vec<ColumnParallelLinear>,
}

impl SpeculativeHead {
    pub fn new(heads: Vec<ColumnParallelLinear>) -> Result<Self> {
        if heads.is_empty() {
            return Err(CoreError::config(
                "speculative head needs at least one projection",
            ));
        }
        Ok(Self { heads })
    }

    pub fn num_speculative(&self) -> usize {
        self.heads.len()
    }

    /// Projects hidden states through every head, returning
    /// `[num_tokens, num_speculative, vocab_size]`.
    pub fn forward(&self, hidden: &Tensor, comm: &dyn DeviceCommunicator) -> Result<Tensor> {
        let mut logits = Vec::with_capacity(self.heads.len());
        for head in &self.heads {
            logits.push(head.forward(hidden, comm)?);
        }
        Ok(Tensor::stack(&logits, 1)?)
    }
}

enum FeedForward {
    Dense(ShardedMlp),
    Moe(MoeLayer),
}

struct DecoderLayer {
    input_norm: ResidualNorm,
    self_attn: SelfAttention,
    post_attention_norm: ResidualNorm,
    feed_forward: FeedForward,
    residual_multiplier: Option<f64>,
}

impl DecoderLayer {
    fn load(
        plan: &ModelPlan,
        layer: &LayerPlan,
        rotary: Arc<RotaryEncoder>,
        capabilities: AttentionCapabilities,
        vb: VarBuilder,
        pg: &dyn ProcessGroup,
    ) -> Result<Self> {
        let name = format!("layers.{}", layer.index);
        let input_norm =
            ResidualNorm::load(plan.hidden_size, plan.norm, vb.pp("input_layernorm"))?;
        let self_attn = SelfAttention::load(
            plan,
            &format!("{name}.self_attn"),
            rotary,
            capabilities,
            vb.pp("self_attn"),
            pg,
        )?;
        let post_attention_norm = ResidualNorm::load(
            plan.hidden_size,
            plan.norm,
            vb.pp("post_attention_layernorm"),
        )?;
        let feed_forward = match layer.feed_forward {
            FeedForwardKind::Dense => FeedForward::Dense(ShardedMlp::load(
                plan,
                &format!("{name}.mlp"),
                vb.pp("mlp"),
                pg,
            )?),
            FeedForwardKind::Moe => {
                let spec = plan.moe.as_ref().ok_or_else(|| {
                    CoreError::config("layer plan routes to experts but the plan has no MoE spec")
                })?;
                FeedForward::Moe(MoeLayer::load(plan, spec, vb.pp("mlp"), pg)?)
            }
        };
        Ok(Self {
            input_norm,
            self_attn,
            post_attention_norm,
            feed_forward,
            residual_multiplier: layer.residual_multiplier,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn forward(
        &self,
        hidden_states: &Tensor,
        residual: Option<&Tensor>,
        cos: &Tensor,
        sin: &Tensor,
        batch: &ForwardBatch,
        cache: &mut KvCache,
        comm: &dyn DeviceCommunicator,
        adapters: AdapterSelection<'_>,
    ) -> Result<(Tensor, Tensor)> {
        let (normed, residual) = self.input_norm.forward(hidden_states, residual)?;
        let mut attn_out = self
            .self_attn
            .forward(&normed, cos, sin, batch, cache, comm, adapters)?;
        if let Some(multiplier) = self.residual_multiplier {
            attn_out = (attn_out * multiplier)?;
        }
        let (normed, residual) = self.post_attention_norm.forward(&attn_out, Some(&residual))?;
        let mut ff_out = match &self.feed_forward {
            FeedForward::Dense(mlp) => mlp.forward(&normed, comm, adapters)?,
            FeedForward::Moe(moe) => moe.forward(&normed, comm)?,
        };
        if let Some(multiplier) = self.residual_multiplier {
            ff_out = (ff_out * multiplier)?;
        }
        Ok((ff_out, residual))
    }
}

/// Embedding, decoder stack and final norm. Produces normalized hidden
/// states; unembedding lives in [`CausalLM`].
pub struct TransformerModel {
    embed_tokens: VocabParallelEmbedding,
    layers: Vec<DecoderLayer>,
    final_norm: ResidualNorm,
    rotary: Arc<RotaryEncoder>,
    hidden_size: usize,
    embedding_multiplier: Option<f64>,
    step_marker: Box<dyn StepMarker>,
}

impl TransformerModel {
    pub fn load(
        plan: &ModelPlan,
        capabilities: AttentionCapabilities,
        vb: VarBuilder,
        ctx: &ShardContext,
    ) -> Result<Self> {
        let pg = ctx.group();
        let embed_tokens = VocabParallelEmbedding::new(
            plan.vocab_size,
            plan.hidden_size,
            vb.pp("embed_tokens"),
            pg,
        )?;
        let rotary = Arc::new(RotaryEncoder::new(
            &plan.rotary,
            plan.head_dim,
            plan.max_position_embeddings,
            vb.dtype(),
            vb.device(),
        )?);
        let vb_layers = vb.pp("layers");
        let mut layers = Vec::with_capacity(plan.num_layers);
        for layer in &plan.layers {
            layers.push(DecoderLayer::load(
                plan,
                layer,
                Arc::clone(&rotary),
                capabilities,
                vb_layers.pp(layer.index),
                pg,
            )?);
        }
        let final_norm = ResidualNorm::load(plan.hidden_size, plan.norm, vb.pp("norm"))?;
        Ok(Self {
            embed_tokens,
            layers,
            final_norm,
            rotary,
            hidden_size: plan.hidden_size,
            embedding_multiplier: plan.embedding_multiplier,
            step_marker: Box::new(EagerStep),
        })
    }

    /// Replace the per-layer completion hook.
    pub fn set_step_marker(&mut self, marker: Box<dyn StepMarker>) {
        self.step_marker = marker;
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub(crate) fn embedding_table(&self) -> &Tensor {
        self.embed_tokens.embeddings()
    }

    /// Runs the decoder stack and final norm, returning hidden states
    /// `[num_tokens, hidden_size]`. `caches` holds one entry per layer.
    pub fn forward(
        &self,
        input: ModelInput<'_>,
        position_ids: &Tensor,
        batch: &ForwardBatch,
        caches: &mut [KvCache],
        comm: &dyn DeviceCommunicator,
        adapters: AdapterSelection<'_>,
    ) -> Result<Tensor> {
        let num_tokens = batch.num_tokens();
        if caches.len() != self.layers.len() {
            return Err(CoreError::shape(
                "kv caches",
                format!("{} caches", self.layers.len()),
                format!("{} caches", caches.len()),
            ));
        }
        let mut hidden = match input {
            ModelInput::TokenIds(ids) => {
                if ids.dims() != [num_tokens] {
                    return Err(CoreError::shape(
                        "input ids",
                        format!("[{num_tokens}]"),
                        format!("{:?}", ids.dims()),
                    ));
                }
                self.embed_tokens.forward(ids, comm)?
            }
            ModelInput::Embeddings(embeddings) => {
                if embeddings.dims() != [num_tokens, self.hidden_size] {
                    return Err(CoreError::shape(
                        "input embeddings",
                        format!("[{num_tokens}, {}]", self.hidden_size),
                        format!("{:?}", embeddings.dims()),
                    ));
                }
                embeddings.clone()
            }
        };
        // Applied on both input paths so precomputed embeddings stay
        // interchangeable with token ids.
        if let Some(multiplier) = self.embedding_multiplier {
            hidden = (hidden * multiplier)?;
        }
        if position_ids.dim(0)? != num_tokens {
            return Err(CoreError::shape(
                "position ids",
                format!("{num_tokens} leading entries"),
                format!("{:?}", position_ids.dims()),
            ));
        }
        let (cos, sin) = self.rotary.cos_sin(position_ids)?;

        let mut residual = None;
        for (layer_index, (layer, cache)) in
            self.layers.iter().zip(caches.iter_mut()).enumerate()
        {
            let (ff_out, summed) = layer.forward(
                &hidden,
                residual.as_ref(),
                &cos,
                &sin,
                batch,
                cache,
                comm,
                adapters,
            )?;
            hidden = ff_out;
            residual = Some(summed);
            self.step_marker.step(layer_index)?;
        }
        let (normed, _) = self.final_norm.forward(&hidden, residual.as_ref())?;
        Ok(normed)
    }
}

/// Fused tensor present and split tensor absent selects the fused path;
/// checkpoints carrying both load through the split names.
fn detect_layout(vb: &VarBuilder, fused_name: &str, split_name: &str) -> ProjectionLayout {
    if vb.contains_tensor(fused_name) && !vb.contains_tensor(split_name) {
        ProjectionLayout::Fused
    } else {
        ProjectionLayout::Split
    }
}

/// A complete causal language model: transformer stack plus
/// vocab-parallel unembedding, with optional speculative heads.
pub struct CausalLM {
    model: TransformerModel,
    lm_head: ColumnParallelLinear,
    logits_scaling: Option<f64>,
    speculative: Option<SpeculativeHead>,
}

// Not derivable: the transformer holds a `Box<dyn StepMarker>`.
impl std::fmt::Debug for CausalLM {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CausalLM")
            .field("num_layers", &self.model.num_layers())
            .field("logits_scaling", &self.logits_scaling)
            .field(
                "num_speculative",
                &self.speculative.as_ref().map(SpeculativeHead::num_speculative),
            )
            .finish_non_exhaustive()
    }
}

impl CausalLM {
    pub fn load(
        plan: &ModelPlan,
        capabilities: AttentionCapabilities,
        vb: VarBuilder,
        ctx: &ShardContext,
    ) -> Result<Self> {
        let mut plan = plan.clone();
        let probe = vb.pp("model").pp("layers").pp(0);
        plan.qkv_layout = detect_layout(&probe.pp("self_attn"), "qkv_proj.weight", "q_proj.weight");
        let mlp_probe = if plan.moe.is_some() {
            probe.pp("mlp").pp("experts").pp(0)
        } else {
            probe.pp("mlp")
        };
        plan.gate_up_layout = detect_layout(&mlp_probe, "gate_up_proj.weight", "gate_proj.weight");
        tracing::debug!(
            qkv_layout = ?plan.qkv_layout,
            gate_up_layout = ?plan.gate_up_layout,
            "resolved projection layouts"
        );
        tracing::info!(
            num_layers = plan.num_layers,
            hidden_size = plan.hidden_size,
            num_heads = plan.num_attention_heads,
            num_kv_heads = plan.num_kv_heads,
            vocab_size = plan.vocab_size,
            world_size = ctx.world_size(),
            moe = plan.moe.is_some(),
            "building causal lm"
        );

        let model = TransformerModel::load(&plan, capabilities, vb.pp("model"), ctx)?;
        let lm_head = if plan.tie_word_embeddings {
            // The embedding shard doubles as the head shard, so the
            // vocab split must be exact on every rank.
            if plan.vocab_size % ctx.world_size() != 0 {
                return Err(CoreError::config(format!(
                    "tied word embeddings need vocab_size ({}) divisible by world size ({})",
                    plan.vocab_size,
                    ctx.world_size()
                )));
            }
            ColumnParallelLinear::from_parts(
                model.embedding_table().clone(),
                None,
                ctx.world_size(),
                ctx.rank(),
                true,
            )
        } else {
            ColumnParallelLinear::new(
                plan.hidden_size,
                plan.vocab_size,
                false,
                true,
                vb.pp("lm_head"),
                ctx.group(),
            )?
        };
        Ok(Self {
            model,
            lm_head,
            logits_scaling: plan.logits_scaling,
            speculative: None,
        })
    }

    /// Attach speculative projections loaded by an external collaborator.
    pub fn set_speculative_head(&mut self, head: SpeculativeHead) {
        self.speculative = Some(head);
    }

    pub fn set_step_marker(&mut self, marker: Box<dyn StepMarker>) {
        self.model.set_step_marker(marker);
    }

    pub fn transformer(&self) -> &TransformerModel {
        &self.model
    }

    /// Full forward pass to logits.
    ///
    /// `lm_head_indices` selects the hidden rows to unembed, typically
    /// each sequence's last prefill token; `None` unembeds every row.
    /// When speculative heads are attached, the second tensor holds
    /// `[rows, num_speculative, vocab_size]` draft logits for the same
    /// rows, scaled by the same divisor as the main logits.
    #[allow(clippy::too_many_arguments)]
    pub fn forward(
        &self,
        input: ModelInput<'_>,
        position_ids: &Tensor,
        batch: &ForwardBatch,
        caches: &mut [KvCache],
        lm_head_indices: Option<&Tensor>,
        adapters: AdapterSelection<'_>,
        comm: &dyn DeviceCommunicator,
    ) -> Result<(Tensor, Option<Tensor>)> {
        let hidden = self
            .model
            .forward(input, position_ids, batch, caches, comm, adapters)?;
        let hidden = match lm_head_indices {
            Some(indices) => hidden.index_select(indices, 0)?,
            None => hidden,
        };
        let mut logits = self.lm_head.forward(&hidden, comm)?;
        let mut speculative = match &self.speculative {
            Some(head) => Some(head.forward(&hidden, comm)?),
            None => None,
        };
        if let Some(scale) = self.logits_scaling {
            logits = (logits / scale)?;
            if let Some(draft) = speculative {
                speculative = Some((draft / scale)?);
            }
        }
        Ok((logits, speculative))
    }
}
