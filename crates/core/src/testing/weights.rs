use std::collections::HashMap;

use candle_core::{DType, Device, Shape, Tensor};
use candle_nn::VarBuilder;

use crate::config::{FeedForwardKind, ModelPlan, NormKind, ProjectionLayout};
use crate::error::{CoreError, Result};

fn small_randn<S: Into<Shape>>(shape: S, device: &Device) -> Result<Tensor> {
    Ok(Tensor::randn(0f32, 0.1, shape, device)?)
}

fn insert_norm(
    map: &mut HashMap<String, Tensor>,
    prefix: &str,
    plan: &ModelPlan,
    device: &Device,
) -> Result<()> {
    let hidden = plan.hidden_size;
    map.insert(
        format!("{prefix}.weight"),
        Tensor::ones(hidden, DType::F32, device)?,
    );
    if plan.norm.kind == NormKind::Layer {
        map.insert(
            format!("{prefix}.bias"),
            Tensor::zeros(hidden, DType::F32, device)?,
        );
    }
    Ok(())
}

fn insert_gate_up(
    map: &mut HashMap<String, Tensor>,
    prefix: &str,
    plan: &ModelPlan,
    device: &Device,
) -> Result<()> {
    let hidden = plan.hidden_size;
    let intermediate = plan.intermediate_size;
    match plan.gate_up_layout {
        ProjectionLayout::Fused => {
            map.insert(
                format!("{prefix}.gate_up_proj.weight"),
                small_randn((2 * intermediate, hidden), device)?,
            );
        }
        ProjectionLayout::Split => {
            map.insert(
                format!("{prefix}.gate_proj.weight"),
                small_randn((intermediate, hidden), device)?,
            );
            map.insert(
                format!("{prefix}.up_proj.weight"),
                small_randn((intermediate, hidden), device)?,
            );
        }
    }
    map.insert(
        format!("{prefix}.down_proj.weight"),
        small_randn((hidden, intermediate), device)?,
    );
    Ok(())
}

/// Random checkpoint map covering every tensor a causal LM built from
/// `plan` will request. Layouts, norms, bias and MoE settings in the
/// plan decide which names are present.
pub fn random_weight_map(plan: &ModelPlan, device: &Device) -> Result<HashMap<String, Tensor>> {
    let mut map = HashMap::new();
    let hidden = plan.hidden_size;
    let q_size = plan.num_attention_heads * plan.head_dim;
    let kv_size = plan.num_kv_heads * plan.head_dim;

    map.insert(
        "model.embed_tokens.weight".to_string(),
        small_randn((plan.vocab_size, hidden), device)?,
    );
    for layer in &plan.layers {
        let prefix = format!("model.layers.{}", layer.index);
        insert_norm(&mut map, &format!("{prefix}.input_layernorm"), plan, device)?;
        insert_norm(
            &mut map,
            &format!("{prefix}.post_attention_layernorm"),
            plan,
            device,
        )?;

        match plan.qkv_layout {
            ProjectionLayout::Fused => {
                map.insert(
                    format!("{prefix}.self_attn.qkv_proj.weight"),
                    small_randn((q_size + 2 * kv_size, hidden), device)?,
                );
                if plan.attention_bias {
                    map.insert(
                        format!("{prefix}.self_attn.qkv_proj.bias"),
                        Tensor::zeros(q_size + 2 * kv_size, DType::F32, device)?,
                    );
                }
            }
            ProjectionLayout::Split => {
                for (name, rows) in [("q_proj", q_size), ("k_proj", kv_size), ("v_proj", kv_size)]
                {
                    map.insert(
                        format!("{prefix}.self_attn.{name}.weight"),
                        small_randn((rows, hidden), device)?,
                    );
                    if plan.attention_bias {
                        map.insert(
                            format!("{prefix}.self_attn.{name}.bias"),
                            Tensor::zeros(rows, DType::F32, device)?,
                        );
                    }
                }
            }
        }
        map.insert(
            format!("{prefix}.self_attn.o_proj.weight"),
            small_randn((hidden, q_size), device)?,
        );

        match layer.feed_forward {
            FeedForwardKind::Dense => {
                insert_gate_up(&mut map, &format!("{prefix}.mlp"), plan, device)?;
            }
            FeedForwardKind::Moe => {
                let spec = plan.moe.ok_or_else(|| {
                    CoreError::config("layer plan routes to experts but the plan has no MoE spec")
                })?;
                map.insert(
                    format!("{prefix}.mlp.gate.weight"),
                    small_randn((spec.num_experts, hidden), device)?,
                );
                for expert in 0..spec.num_experts {
                    insert_gate_up(
                        &mut map,
                        &format!("{prefix}.mlp.experts.{expert}"),
                        plan,
                        device,
                    )?;
                }
            }
        }
    }
    insert_norm(&mut map, "model.norm", plan, device)?;
    if !plan.tie_word_embeddings {
        map.insert(
            "lm_head.weight".to_string(),
            small_randn((plan.vocab_size, hidden), device)?,
        );
    }
    Ok(map)
}

/// [`random_weight_map`] wrapped into a `VarBuilder`, the form model
/// loaders consume.
pub fn random_var_builder(plan: &ModelPlan, device: &Device) -> Result<VarBuilder<'static>> {
    let map = random_weight_map(plan, device)?;
    Ok(VarBuilder::from_tensors(map, DType::F32, device))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{tiny_config, tiny_moe_config};

    #[test]
    fn dense_map_covers_split_projections() {
        let plan = ModelPlan::from_config(&tiny_config()).unwrap();
        let map = random_weight_map(&plan, &Device::Cpu).unwrap();
        assert!(map.contains_key("model.embed_tokens.weight"));
        assert!(map.contains_key("model.layers.0.self_attn.q_proj.weight"));
        assert!(map.contains_key("model.layers.1.mlp.down_proj.weight"));
        assert!(map.contains_key("model.norm.weight"));
        assert!(map.contains_key("lm_head.weight"));
        assert!(!map.contains_key("model.layers.0.self_attn.qkv_proj.weight"));
    }

    #[test]
    fn fused_layouts_change_the_names() {
        let mut plan = ModelPlan::from_config(&tiny_config()).unwrap();
        plan.qkv_layout = ProjectionLayout::Fused;
        plan.gate_up_layout = ProjectionLayout::Fused;
        let map = random_weight_map(&plan, &Device::Cpu).unwrap();
        assert!(map.contains_key("model.layers.0.self_attn.qkv_proj.weight"));
        assert!(map.contains_key("model.layers.0.mlp.gate_up_proj.weight"));
        assert!(!map.contains_key("model.layers.0.self_attn.q_proj.weight"));
        assert!(!map.contains_key("model.layers.0.mlp.gate_proj.weight"));
    }

    #[test]
    fn tied_embeddings_drop_the_lm_head() {
        let mut config = tiny_config();
        config.tie_word_embeddings = true;
        let plan = ModelPlan::from_config(&config).unwrap();
        let map = random_weight_map(&plan, &Device::Cpu).unwrap();
        assert!(!map.contains_key("lm_head.weight"));
    }

    #[test]
    fn moe_map_has_router_and_experts() {
        let plan = ModelPlan::from_config(&tiny_moe_config()).unwrap();
        let map = random_weight_map(&plan, &Device::Cpu).unwrap();
        assert!(map.contains_key("model.layers.0.mlp.gate.weight"));
        assert!(map.contains_key("model.layers.0.mlp.experts.3.up_proj.weight"));
        assert!(!map.contains_key("model.layers.0.mlp.gate_proj.weight"));
    }
}
