use candle_nn::Activation;
use serde::Deserialize;

use crate::error::{CoreError, Result};

/// Raw model configuration, deserialized from a HuggingFace-style
/// `config.json`. Fields the core does not consume end up in `extra`.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    pub architectures: Vec<String>,
    pub hidden_size: usize,
    pub num_attention_heads: usize,
    #[serde(default)]
    pub num_key_value_heads: Option<usize>,
    pub num_hidden_layers: usize,
    pub intermediate_size: usize,
    pub vocab_size: usize,
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,
    #[serde(default)]
    pub head_dim: Option<usize>,
    #[serde(default = "default_hidden_act")]
    pub hidden_act: String,
    #[serde(default)]
    pub rms_norm_eps: Option<f64>,
    #[serde(default)]
    pub layer_norm_eps: Option<f64>,
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f64,
    #[serde(default)]
    pub partial_rotary_factor: Option<f64>,
    #[serde(default)]
    pub tie_word_embeddings: bool,
    #[serde(default)]
    pub sliding_window: Option<usize>,
    #[serde(default)]
    pub attention_bias: Option<bool>,
    #[serde(default)]
    pub quantize: Option<String>,

    // Mixture-of-experts fields, absent for dense models.
    #[serde(default)]
    pub num_local_experts: Option<usize>,
    #[serde(default)]
    pub num_experts_per_tok: Option<usize>,
    #[serde(default)]
    pub norm_topk_prob: Option<bool>,

    // Scaling knobs carried by some architecture families.
    #[serde(default)]
    pub attention_multiplier: Option<f64>,
    #[serde(default)]
    pub embedding_multiplier: Option<f64>,
    #[serde(default)]
    pub residual_multiplier: Option<f64>,
    #[serde(default)]
    pub logits_scaling: Option<f64>,

    // Vision-language extensions.
    #[serde(default)]
    pub mrope_section: Option<Vec<usize>>,
    #[serde(default)]
    pub vision_start_token_id: Option<u32>,
    #[serde(default)]
    pub vision_end_token_id: Option<u32>,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

fn default_hidden_act() -> String {
    "silu".to_string()
}

fn default_rope_theta() -> f64 {
    10_000.0
}

fn default_max_position_embeddings() -> usize {
    4096
}

impl ModelConfig {
    /// Head dimension, computed from the hidden size when the config does
    /// not carry it explicitly.
    pub fn head_dim(&self) -> usize {
        self.head_dim
            .unwrap_or(self.hidden_size / self.num_attention_heads)
    }

    /// Number of key/value heads; equals the query head count for MHA.
    pub fn num_kv_heads(&self) -> usize {
        self.num_key_value_heads
            .unwrap_or(self.num_attention_heads)
    }

    pub fn is_moe(&self) -> bool {
        self.num_local_experts.is_some() && self.num_experts_per_tok.is_some()
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            architectures: vec!["LlamaForCausalLM".to_string()],
            hidden_size: 4096,
            num_attention_heads: 32,
            num_key_value_heads: Some(8),
            num_hidden_layers: 32,
            intermediate_size: 11008,
            vocab_size: 32000,
            max_position_embeddings: 4096,
            head_dim: Some(128),
            hidden_act: "silu".to_string(),
            rms_norm_eps: Some(1e-6),
            layer_norm_eps: None,
            rope_theta: 10_000.0,
            partial_rotary_factor: None,
            tie_word_embeddings: false,
            sliding_window: None,
            attention_bias: None,
            quantize: None,
            num_local_experts: None,
            num_experts_per_tok: None,
            norm_topk_prob: None,
            attention_multiplier: None,
            embedding_multiplier: None,
            residual_multiplier: None,
            logits_scaling: None,
            mrope_section: None,
            vision_start_token_id: None,
            vision_end_token_id: None,
            extra: serde_json::Map::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NormKind {
    Rms,
    Layer,
}

#[derive(Debug, Clone, Copy)]
pub struct NormSpec {
    pub kind: NormKind,
    pub eps: f64,
}

/// How a multi-matrix projection is stored in the checkpoint: one fused
/// slab under a single name, or separate per-matrix tensors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProjectionLayout {
    #[default]
    Split,
    Fused,
}

#[derive(Debug, Clone)]
pub struct RotarySpec {
    pub theta: f64,
    /// Number of leading head dimensions that get rotated. Equal to
    /// `head_dim` for full rotary, strictly smaller in half-rotary mode.
    pub rotary_dim: usize,
    /// Per-axis inverse-frequency section lengths for 3-axis multimodal
    /// position ids. Must sum to `rotary_dim / 2`.
    pub mrope_section: Option<Vec<usize>>,
}

#[derive(Debug, Clone, Copy)]
pub struct MoeSpec {
    pub num_experts: usize,
    pub top_k: usize,
    pub renormalize: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedForwardKind {
    Dense,
    Moe,
}

/// Immutable per-layer configuration, produced once at load time. Forward
/// logic reads it but never mutates it.
#[derive(Debug, Clone)]
pub struct LayerPlan {
    pub index: usize,
    pub feed_forward: FeedForwardKind,
    pub residual_multiplier: Option<f64>,
}

/// Everything the forward pass needs, resolved from [`ModelConfig`] once.
/// Strategy choices (norm kind, projection layouts, MoE vs dense) are data
/// here; the hot path never re-derives them from the raw config.
#[derive(Debug, Clone)]
pub struct ModelPlan {
    pub hidden_size: usize,
    pub num_layers: usize,
    pub num_attention_heads: usize,
    pub num_kv_heads: usize,
    pub head_dim: usize,
    pub intermediate_size: usize,
    pub vocab_size: usize,
    pub max_position_embeddings: usize,
    pub norm: NormSpec,
    pub activation: Activation,
    pub rotary: RotarySpec,
    pub qkv_layout: ProjectionLayout,
    pub gate_up_layout: ProjectionLayout,
    pub attention_bias: bool,
    pub moe: Option<MoeSpec>,
    pub sliding_window: Option<usize>,
    /// Attention softmax scale, `head_dim^-0.5` unless the config
    /// overrides it with an attention multiplier.
    pub softmax_scale: f64,
    pub embedding_multiplier: Option<f64>,
    pub logits_scaling: Option<f64>,
    pub tie_word_embeddings: bool,
    pub layers: Vec<LayerPlan>,
}

fn resolve_activation(name: &str) -> Result<Activation> {
    match name {
        "silu" => Ok(Activation::Silu),
        "gelu" => Ok(Activation::Gelu),
        "gelu_new" => Ok(Activation::NewGelu),
        "gelu_pytorch_tanh" => Ok(Activation::GeluPytorchTanh),
        "relu" => Ok(Activation::Relu),
        other => Err(CoreError::config(format!(
            "unsupported hidden_act {other:?}"
        ))),
    }
}

impl ModelPlan {
    pub fn from_config(config: &ModelConfig) -> Result<Self> {
        if let Some(quantize) = &config.quantize {
            return Err(CoreError::config(format!(
                "no sharding strategy for quantization mode {quantize:?}"
            )));
        }

        let head_dim = config.head_dim();
        if head_dim == 0 {
            return Err(CoreError::config("head_dim must be non-zero"));
        }

        let rotary_dim = match config.partial_rotary_factor {
            Some(factor) => {
                if !(0.0..=1.0).contains(&factor) || factor == 0.0 {
                    return Err(CoreError::config(format!(
                        "partial_rotary_factor ({factor}) must be in (0, 1]"
                    )));
                }
                (head_dim as f64 * factor) as usize
            }
            None => head_dim,
        };
        if rotary_dim == 0 || rotary_dim % 2 != 0 {
            return Err(CoreError::config(format!(
                "rotary_dim ({rotary_dim}) must be a non-zero even number"
            )));
        }

        let norm = match (config.rms_norm_eps, config.layer_norm_eps) {
            (Some(eps), _) => NormSpec {
                kind: NormKind::Rms,
                eps,
            },
            (None, Some(eps)) => NormSpec {
                kind: NormKind::Layer,
                eps,
            },
            (None, None) => {
                tracing::warn!("config has no norm epsilon, falling back to rms_norm_eps=1e-6");
                NormSpec {
                    kind: NormKind::Rms,
                    eps: 1e-6,
                }
            }
        };

        let moe = match (config.num_local_experts, config.num_experts_per_tok) {
            (Some(num_experts), Some(top_k)) => {
                if top_k == 0 || top_k > num_experts {
                    return Err(CoreError::config(format!(
                        "num_experts_per_tok ({top_k}) must be in 1..={num_experts}"
                    )));
                }
                Some(MoeSpec {
                    num_experts,
                    top_k,
                    renormalize: config.norm_topk_prob.unwrap_or(true),
                })
            }
            (None, None) => None,
            _ => {
                return Err(CoreError::config(
                    "num_local_experts and num_experts_per_tok must be set together",
                ))
            }
        };

        let feed_forward = if moe.is_some() {
            FeedForwardKind::Moe
        } else {
            FeedForwardKind::Dense
        };
        let layers = (0..config.num_hidden_layers)
            .map(|index| LayerPlan {
                index,
                feed_forward,
                residual_multiplier: config.residual_multiplier,
            })
            .collect();

        let softmax_scale = config
            .attention_multiplier
            .unwrap_or_else(|| (head_dim as f64).powf(-0.5));

        tracing::debug!(
            norm = ?norm.kind,
            feed_forward = ?feed_forward,
            rotary_dim,
            sectioned = config.mrope_section.is_some(),
            "resolved model plan strategies"
        );

        Ok(Self {
            hidden_size: config.hidden_size,
            num_layers: config.num_hidden_layers,
            num_attention_heads: config.num_attention_heads,
            num_kv_heads: config.num_kv_heads(),
            head_dim,
            intermediate_size: config.intermediate_size,
            vocab_size: config.vocab_size,
            max_position_embeddings: config.max_position_embeddings,
            norm,
            activation: resolve_activation(&config.hidden_act)?,
            rotary: RotarySpec {
                theta: config.rope_theta,
                rotary_dim,
                mrope_section: config.mrope_section.clone(),
            },
            qkv_layout: ProjectionLayout::default(),
            gate_up_layout: ProjectionLayout::default(),
            attention_bias: config.attention_bias.unwrap_or(false),
            moe,
            sliding_window: config.sliding_window,
            softmax_scale,
            embedding_multiplier: config.embedding_multiplier,
            logits_scaling: config.logits_scaling,
            tie_word_embeddings: config.tie_word_embeddings,
            layers,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const QWEN3_06B_CONFIG: &str = r#"{
        "architectures": ["Qwen3ForCausalLM"],
        "attention_bias": false,
        "attention_dropout": 0.0,
        "bos_token_id": 151643,
        "eos_token_id": 151645,
        "head_dim": 128,
        "hidden_act": "silu",
        "hidden_size": 1024,
        "initializer_range": 0.02,
        "intermediate_size": 3072,
        "max_position_embeddings": 40960,
        "max_window_layers": 28,
        "model_type": "qwen3",
        "num_attention_heads": 16,
        "num_hidden_layers": 28,
        "num_key_value_heads": 8,
        "rms_norm_eps": 1e-06,
        "rope_scaling": null,
        "rope_theta": 1000000,
        "sliding_window": null,
        "tie_word_embeddings": true,
        "torch_dtype": "bfloat16",
        "transformers_version": "4.51.0",
        "use_cache": true,
        "use_sliding_window": false,
        "vocab_size": 151936
    }"#;

    const MIXTRAL_STYLE_CONFIG: &str = r#"{
        "architectures": ["MixtralForCausalLM"],
        "hidden_size": 4096,
        "intermediate_size": 14336,
        "num_attention_heads": 32,
        "num_hidden_layers": 32,
        "num_key_value_heads": 8,
        "num_local_experts": 8,
        "num_experts_per_tok": 2,
        "rms_norm_eps": 1e-05,
        "rope_theta": 1000000.0,
        "vocab_size": 32000
    }"#;

    const GRANITE_STYLE_CONFIG: &str = r#"{
        "architectures": ["GraniteForCausalLM"],
        "attention_multiplier": 0.0078125,
        "embedding_multiplier": 12.0,
        "hidden_size": 4096,
        "intermediate_size": 12800,
        "logits_scaling": 16.0,
        "num_attention_heads": 32,
        "num_hidden_layers": 40,
        "num_key_value_heads": 8,
        "residual_multiplier": 0.22,
        "rms_norm_eps": 1e-05,
        "vocab_size": 49155
    }"#;

    #[test]
    fn parse_qwen3_06b_config() {
        let config: ModelConfig =
            serde_json::from_str(QWEN3_06B_CONFIG).expect("failed to parse config");

        assert_eq!(config.architectures, vec!["Qwen3ForCausalLM"]);
        assert_eq!(config.hidden_size, 1024);
        assert_eq!(config.num_attention_heads, 16);
        assert_eq!(config.num_kv_heads(), 8);
        assert_eq!(config.num_hidden_layers, 28);
        assert_eq!(config.intermediate_size, 3072);
        assert_eq!(config.vocab_size, 151936);
        assert_eq!(config.head_dim(), 128);
        assert_eq!(config.max_position_embeddings, 40960);
        assert_eq!(config.hidden_act, "silu");
        assert_eq!(config.rms_norm_eps, Some(1e-6));
        assert_eq!(config.rope_theta, 1_000_000.0);
        assert!(config.tie_word_embeddings);
        assert!(!config.is_moe());
        // Unknown fields land in the extras map.
        assert!(config.extra.contains_key("torch_dtype"));
        assert!(config.extra.contains_key("eos_token_id"));
    }

    #[test]
    fn gqa_ratio_is_correct() {
        let config: ModelConfig =
            serde_json::from_str(QWEN3_06B_CONFIG).expect("failed to parse config");

        let gqa_groups = config.num_attention_heads / config.num_kv_heads();
        assert_eq!(gqa_groups, 2);
    }

    #[test]
    fn head_dim_computed_when_absent() {
        let config = ModelConfig {
            head_dim: None,
            hidden_size: 2048,
            num_attention_heads: 16,
            ..Default::default()
        };
        assert_eq!(config.head_dim(), 128);
    }

    #[test]
    fn plan_resolves_rms_norm_and_scale() {
        let config: ModelConfig = serde_json::from_str(QWEN3_06B_CONFIG).unwrap();
        let plan = ModelPlan::from_config(&config).unwrap();

        assert_eq!(plan.norm.kind, NormKind::Rms);
        assert_eq!(plan.norm.eps, 1e-6);
        assert_eq!(plan.rotary.rotary_dim, 128);
        assert!((plan.softmax_scale - (128f64).powf(-0.5)).abs() < 1e-12);
        assert!(plan.moe.is_none());
        assert_eq!(plan.layers.len(), 28);
        assert!(plan.tie_word_embeddings);
    }

    #[test]
    fn plan_resolves_layer_norm_from_eps_field() {
        let config = ModelConfig {
            rms_norm_eps: None,
            layer_norm_eps: Some(1e-5),
            ..Default::default()
        };
        let plan = ModelPlan::from_config(&config).unwrap();
        assert_eq!(plan.norm.kind, NormKind::Layer);
        assert_eq!(plan.norm.eps, 1e-5);
    }

    #[test]
    fn plan_resolves_moe_spec() {
        let config: ModelConfig = serde_json::from_str(MIXTRAL_STYLE_CONFIG).unwrap();
        let plan = ModelPlan::from_config(&config).unwrap();

        let moe = plan.moe.expect("moe spec");
        assert_eq!(moe.num_experts, 8);
        assert_eq!(moe.top_k, 2);
        assert!(moe.renormalize);
        assert!(plan
            .layers
            .iter()
            .all(|l| l.feed_forward == FeedForwardKind::Moe));
    }

    #[test]
    fn plan_carries_scaling_multipliers() {
        let config: ModelConfig = serde_json::from_str(GRANITE_STYLE_CONFIG).unwrap();
        let plan = ModelPlan::from_config(&config).unwrap();

        assert_eq!(plan.softmax_scale, 0.0078125);
        assert_eq!(plan.embedding_multiplier, Some(12.0));
        assert_eq!(plan.logits_scaling, Some(16.0));
        assert!(plan
            .layers
            .iter()
            .all(|l| l.residual_multiplier == Some(0.22)));
    }

    #[test]
    fn plan_rejects_bad_top_k() {
        let config = ModelConfig {
            num_local_experts: Some(4),
            num_experts_per_tok: Some(5),
            ..Default::default()
        };
        let err = ModelPlan::from_config(&config).unwrap_err();
        assert!(err.to_string().contains("num_experts_per_tok"));
    }

    #[test]
    fn plan_rejects_quantization() {
        let config = ModelConfig {
            quantize: Some("gptq".to_string()),
            ..Default::default()
        };
        let err = ModelPlan::from_config(&config).unwrap_err();
        assert!(err.to_string().contains("quantization"));
    }

    #[test]
    fn plan_rejects_unknown_activation() {
        let config = ModelConfig {
            hidden_act: "swishglu".to_string(),
            ..Default::default()
        };
        assert!(ModelPlan::from_config(&config).is_err());
    }

    #[test]
    fn partial_rotary_factor_shrinks_rotary_dim() {
        let config = ModelConfig {
            partial_rotary_factor: Some(0.5),
            ..Default::default()
        };
        let plan = ModelPlan::from_config(&config).unwrap();
        assert_eq!(plan.head_dim, 128);
        assert_eq!(plan.rotary.rotary_dim, 64);
    }

    #[test]
    fn odd_rotary_dim_is_rejected() {
        let config = ModelConfig {
            head_dim: Some(126),
            partial_rotary_factor: Some(0.5),
            ..Default::default()
        };
        assert!(ModelPlan::from_config(&config).is_err());
    }
}
