use candle_transformers::models::mmdit::model::Config;
use serde::Deserialize;

use crate::convert::flux::count_blocks;
use crate::errors::{LoadError, Result};
use crate::weights::TensorSource;

/// `transformer/config.json` of a diffusers SD3 repository
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct MmditConfig {
    pub patch_size: usize,
    pub in_channels: usize,
    pub out_channels: usize,
    pub num_layers: usize,
    pub attention_head_dim: usize,
    pub pooled_projection_dim: usize,
    pub pos_embed_max_size: usize,
    pub joint_attention_dim: usize,
}

impl Default for MmditConfig {
    /// SD3 medium
    fn default() -> Self {
        Self {
            patch_size: 2,
            in_channels: 16,
            out_channels: 16,
            num_layers: 24,
            attention_head_dim: 64,
            pooled_projection_dim: 2048,
            pos_embed_max_size: 192,
            joint_attention_dim: 4096,
        }
    }
}

impl MmditConfig {
    pub fn to_candle(&self) -> Config {
        Config {
            patch_size: self.patch_size,
            in_channels: self.in_channels,
            out_channels: self.out_channels,
            depth: self.num_layers,
            head_size: self.attention_head_dim,
            adm_in_channels: self.pooled_projection_dim,
            pos_embed_max_size: self.pos_embed_max_size,
            context_embed_size: self.joint_attention_dim,
            frequency_embedding_size: 256,
        }
    }

    /// Pick the candle preset from the joint block count of a single-file
    /// MMDiT (names relative to the diffusion model root).
    pub fn detect<S: TensorSource + ?Sized>(source: &S) -> Result<Config> {
        let names = source.names();
        let depth = count_blocks(&names, "joint_blocks");
        let dual_attention = names.iter().any(|n| n.contains(".x_block.attn2."));
        match (depth, dual_attention) {
            (24, true) => Ok(Config::sd3_5_medium()),
            (24, false) => Ok(Config::sd3_medium()),
            (38, _) => Ok(Config::sd3_5_large()),
            (0, _) => Err(LoadError::Unsupported("no MMDiT joint blocks found".into())),
            (other, _) => Err(LoadError::Unsupported(format!(
                "no MMDiT preset with {other} joint blocks"
            ))),
        }
    }
}
