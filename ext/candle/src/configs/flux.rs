use candle_transformers::models::flux;
use serde::Deserialize;

use crate::convert::flux::{count_blocks, has_guidance, hidden_size};
use crate::errors::{LoadError, Result};
use crate::weights::TensorSource;

/// `transformer/config.json` of a diffusers FLUX repository
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct FluxTransformerConfig {
    pub in_channels: usize,
    pub num_layers: usize,
    pub num_single_layers: usize,
    pub attention_head_dim: usize,
    pub num_attention_heads: usize,
    pub joint_attention_dim: usize,
    pub pooled_projection_dim: usize,
    pub guidance_embeds: bool,
    pub axes_dims_rope: Vec<usize>,
}

impl Default for FluxTransformerConfig {
    /// FLUX.1-dev
    fn default() -> Self {
        Self {
            in_channels: 64,
            num_layers: 19,
            num_single_layers: 38,
            attention_head_dim: 128,
            num_attention_heads: 24,
            joint_attention_dim: 4096,
            pooled_projection_dim: 768,
            guidance_embeds: true,
            axes_dims_rope: vec![16, 56, 56],
        }
    }
}

impl FluxTransformerConfig {
    pub fn hidden_size(&self) -> usize {
        self.attention_head_dim * self.num_attention_heads
    }

    pub fn to_candle(&self) -> flux::model::Config {
        flux::model::Config {
            in_channels: self.in_channels,
            vec_in_dim: self.pooled_projection_dim,
            context_in_dim: self.joint_attention_dim,
            hidden_size: self.hidden_size(),
            mlp_ratio: 4.0,
            num_heads: self.num_attention_heads,
            depth: self.num_layers,
            depth_single_blocks: self.num_single_layers,
            axes_dim: self.axes_dims_rope.clone(),
            theta: 10_000,
            qkv_bias: true,
            guidance_embed: self.guidance_embeds,
        }
    }
}

/// Candle preset for a single-file transformer: dev when the guidance
/// embedder is present, schnell otherwise.
pub fn preset(has_guidance: bool) -> flux::model::Config {
    if has_guidance {
        flux::model::Config::dev()
    } else {
        flux::model::Config::schnell()
    }
}

/// Candle config for a BFL-named transformer without a `config.json`: the
/// matching preset, with depth and width read off the tensors.
pub fn detect<S: TensorSource + ?Sized>(source: &S) -> Result<flux::model::Config> {
    let mut config = preset(has_guidance(source));
    let names = source.names();
    let depth = count_blocks(&names, "double_blocks");
    let depth_single = count_blocks(&names, "single_blocks");
    if depth > 0 {
        config.depth = depth;
    }
    if depth_single > 0 {
        config.depth_single_blocks = depth_single;
    }

    let hidden = hidden_size(source)?;
    if hidden != config.hidden_size {
        let head_dim = config.hidden_size / config.num_heads;
        if hidden % head_dim != 0 {
            return Err(LoadError::Unsupported(format!(
                "FLUX hidden size {hidden} is not a multiple of the head size {head_dim}"
            )));
        }
        config.hidden_size = hidden;
        config.num_heads = hidden / head_dim;
    }
    Ok(config)
}
