use candle_transformers::models::stable_diffusion::vae::AutoEncoderKLConfig;
use serde::Deserialize;

/// `vae/config.json` of a diffusers repository
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct VaeConfig {
    pub in_channels: usize,
    pub out_channels: usize,
    pub latent_channels: usize,
    pub block_out_channels: Vec<usize>,
    pub layers_per_block: usize,
    pub norm_num_groups: usize,
    pub scaling_factor: f64,
    pub shift_factor: Option<f64>,
    pub use_quant_conv: bool,
    pub use_post_quant_conv: bool,
}

impl Default for VaeConfig {
    /// The Stable Diffusion 1.x/2.x VAE
    fn default() -> Self {
        Self {
            in_channels: 3,
            out_channels: 3,
            latent_channels: 4,
            block_out_channels: vec![128, 256, 512, 512],
            layers_per_block: 2,
            norm_num_groups: 32,
            scaling_factor: 0.18215,
            shift_factor: None,
            use_quant_conv: true,
            use_post_quant_conv: true,
        }
    }
}

impl VaeConfig {
    /// 16-channel VAE of SD3 single-file checkpoints
    pub fn sd3() -> Self {
        Self {
            latent_channels: 16,
            scaling_factor: 1.5305,
            shift_factor: Some(0.0609),
            use_quant_conv: false,
            use_post_quant_conv: false,
            ..Default::default()
        }
    }

    /// 16-channel VAE of FLUX
    pub fn flux() -> Self {
        Self {
            latent_channels: 16,
            scaling_factor: 0.3611,
            shift_factor: Some(0.1159),
            use_quant_conv: false,
            use_post_quant_conv: false,
            ..Default::default()
        }
    }

    pub fn to_candle(&self) -> AutoEncoderKLConfig {
        AutoEncoderKLConfig {
            block_out_channels: self.block_out_channels.clone(),
            layers_per_block: self.layers_per_block,
            latent_channels: self.latent_channels,
            norm_num_groups: self.norm_num_groups,
            use_quant_conv: self.use_quant_conv,
            use_post_quant_conv: self.use_post_quant_conv,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flux_vae_config() {
        let cfg: VaeConfig = serde_json::from_str(
            r#"{"latent_channels": 16, "scaling_factor": 0.3611, "shift_factor": 0.1159,
                "use_quant_conv": false, "use_post_quant_conv": false, "force_upcast": true}"#,
        )
        .unwrap();
        assert_eq!(cfg, VaeConfig::flux());
        let candle = cfg.to_candle();
        assert_eq!(candle.latent_channels, 16);
        assert!(!candle.use_quant_conv);
    }

    #[test]
    fn test_default_has_quant_convs() {
        let cfg: VaeConfig = serde_json::from_str("{}").unwrap();
        assert!(cfg.use_quant_conv && cfg.use_post_quant_conv);
        assert_eq!(cfg.shift_factor, None);
    }
}
