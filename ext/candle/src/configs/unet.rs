use candle_transformers::models::stable_diffusion::unet_2d::{BlockConfig, UNet2DConditionModelConfig};
use serde::Deserialize;

use super::PerBlock;
use crate::errors::{LoadError, Result};

/// `unet/config.json` of a diffusers Stable Diffusion repository
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct UNetConfig {
    pub in_channels: usize,
    pub out_channels: usize,
    pub sample_size: usize,
    pub center_input_sample: bool,
    pub flip_sin_to_cos: bool,
    pub freq_shift: f64,
    pub block_out_channels: Vec<usize>,
    pub down_block_types: Vec<String>,
    pub layers_per_block: usize,
    pub downsample_padding: usize,
    pub mid_block_scale_factor: f64,
    pub norm_num_groups: usize,
    pub norm_eps: f64,
    pub cross_attention_dim: usize,
    pub attention_head_dim: PerBlock<usize>,
    pub transformer_layers_per_block: PerBlock<usize>,
    pub use_linear_projection: bool,
}

impl Default for UNetConfig {
    /// Stable Diffusion 1.5
    fn default() -> Self {
        Self {
            in_channels: 4,
            out_channels: 4,
            sample_size: 64,
            center_input_sample: false,
            flip_sin_to_cos: true,
            freq_shift: 0.,
            block_out_channels: vec![320, 640, 1280, 1280],
            down_block_types: vec![
                "CrossAttnDownBlock2D".into(),
                "CrossAttnDownBlock2D".into(),
                "CrossAttnDownBlock2D".into(),
                "DownBlock2D".into(),
            ],
            layers_per_block: 2,
            downsample_padding: 1,
            mid_block_scale_factor: 1.,
            norm_num_groups: 32,
            norm_eps: 1e-5,
            cross_attention_dim: 768,
            attention_head_dim: PerBlock::One(8),
            transformer_layers_per_block: PerBlock::One(1),
            use_linear_projection: false,
        }
    }
}

impl UNetConfig {
    pub fn to_candle(&self) -> Result<UNet2DConditionModelConfig> {
        let blocks = self
            .block_out_channels
            .iter()
            .enumerate()
            .map(|(i, &out_channels)| {
                let cross_attn = self
                    .down_block_types
                    .get(i)
                    .is_some_and(|t| t.starts_with("CrossAttn"));
                let attention_head_dim = self.attention_head_dim.get(i).ok_or_else(|| {
                    LoadError::msg(format!("no attention_head_dim for UNet block {i}"))
                })?;
                let use_cross_attn = if cross_attn {
                    Some(self.transformer_layers_per_block.get(i).unwrap_or(1))
                } else {
                    None
                };
                Ok(BlockConfig {
                    out_channels,
                    use_cross_attn,
                    attention_head_dim,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(UNet2DConditionModelConfig {
            center_input_sample: self.center_input_sample,
            flip_sin_to_cos: self.flip_sin_to_cos,
            freq_shift: self.freq_shift,
            blocks,
            layers_per_block: self.layers_per_block,
            downsample_padding: self.downsample_padding,
            mid_block_scale_factor: self.mid_block_scale_factor,
            norm_num_groups: self.norm_num_groups,
            norm_eps: self.norm_eps,
            cross_attention_dim: self.cross_attention_dim,
            sliced_attention_size: None,
            use_linear_projection: self.use_linear_projection,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sdxl_unet_config() {
        let cfg: UNetConfig = serde_json::from_str(
            r#"{
                "block_out_channels": [320, 640, 1280],
                "down_block_types": ["DownBlock2D", "CrossAttnDownBlock2D", "CrossAttnDownBlock2D"],
                "attention_head_dim": [5, 10, 20],
                "transformer_layers_per_block": [1, 2, 10],
                "cross_attention_dim": 2048,
                "use_linear_projection": true
            }"#,
        )
        .unwrap();
        let candle = cfg.to_candle().unwrap();
        assert_eq!(candle.blocks.len(), 3);
        assert_eq!(candle.blocks[0].use_cross_attn, None);
        assert_eq!(candle.blocks[1].use_cross_attn, Some(2));
        assert_eq!(candle.blocks[2].use_cross_attn, Some(10));
        assert_eq!(candle.blocks[2].attention_head_dim, 20);
        assert_eq!(candle.cross_attention_dim, 2048);
        assert!(candle.use_linear_projection);
    }

    #[test]
    fn test_default_is_sd15() {
        let candle = UNetConfig::default().to_candle().unwrap();
        assert_eq!(candle.blocks.len(), 4);
        assert!(candle.blocks.iter().take(3).all(|b| b.use_cross_attn == Some(1)));
        assert_eq!(candle.blocks[3].use_cross_attn, None);
        assert!(candle.blocks.iter().all(|b| b.attention_head_dim == 8));
    }

    #[test]
    fn test_empty_head_dims_fail() {
        let cfg = UNetConfig {
            attention_head_dim: PerBlock::Each(vec![]),
            ..Default::default()
        };
        assert!(cfg.to_candle().is_err());
    }
}
