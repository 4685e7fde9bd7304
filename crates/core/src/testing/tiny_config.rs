use crate::config::ModelConfig;

/// Tiny dense decoder config (2 layers, 8 hidden, 2 heads over 1 kv head).
/// Small enough for CPU forward passes in unit tests.
pub fn tiny_config() -> ModelConfig {
    ModelConfig {
        architectures: vec!["LlamaForCausalLM".to_string()],
        hidden_size: 8,
        num_attention_heads: 2,
        num_key_value_heads: Some(1),
        num_hidden_layers: 2,
        intermediate_size: 16,
        vocab_size: 32,
        max_position_embeddings: 64,
        head_dim: None,
        hidden_act: "silu".to_string(),
        rms_norm_eps: Some(1e-5),
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

/// Tiny mixture-of-experts config: every layer routes over 4 experts,
/// 2 active per token, with renormalized gate weights.
pub fn tiny_moe_config() -> ModelConfig {
    ModelConfig {
        architectures: vec!["Qwen3MoeForCausalLM".to_string()],
        num_local_experts: Some(4),
        num_experts_per_tok: Some(2),
        norm_topk_prob: Some(true),
        ..tiny_config()
    }
}

/// Tiny vision-language config with 3-axis rotary sections and vision
/// marker tokens. Head dim 8 so the sections [2, 1, 1] cover the 4
/// frequency pairs.
pub fn tiny_multimodal_config() -> ModelConfig {
    ModelConfig {
        architectures: vec!["Qwen2_5_VLForCausalLM".to_string()],
        hidden_size: 16,
        vocab_size: 128,
        mrope_section: Some(vec![2, 1, 1]),
        vision_start_token_id: Some(100),
        vision_end_token_id: Some(101),
        ..tiny_config()
    }
}
