use candle_transformers::models::stable_diffusion::clip;
use serde::Deserialize;

use crate::errors::{LoadError, Result};

/// `text_encoder*/config.json` of a CLIP text model
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ClipConfig {
    pub hidden_size: usize,
    pub num_hidden_layers: usize,
    pub projection_dim: Option<usize>,
    pub max_position_embeddings: usize,
}

impl Default for ClipConfig {
    /// ViT-L/14
    fn default() -> Self {
        Self {
            hidden_size: 768,
            num_hidden_layers: 12,
            projection_dim: Some(768),
            max_position_embeddings: 77,
        }
    }
}

impl ClipConfig {
    /// ViT-bigG/14, the second SDXL/SD3 text encoder
    pub fn big_g() -> Self {
        Self {
            hidden_size: 1280,
            num_hidden_layers: 32,
            projection_dim: Some(1280),
            max_position_embeddings: 77,
        }
    }

    /// Candle preset matching the encoder width.
    pub fn to_candle(&self) -> Result<clip::Config> {
        match self.hidden_size {
            768 => Ok(clip::Config::v1_5()),
            1024 => Ok(clip::Config::v2_1()),
            1280 => Ok(clip::Config::sdxl2()),
            other => Err(LoadError::Unsupported(format!(
                "no CLIP text model preset with hidden size {other}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_by_width() {
        let cfg: ClipConfig =
            serde_json::from_str(r#"{"hidden_size": 1024, "num_hidden_layers": 23}"#).unwrap();
        assert!(cfg.to_candle().is_ok());
        assert!(ClipConfig::big_g().to_candle().is_ok());
        let odd = ClipConfig {
            hidden_size: 512,
            ..Default::default()
        };
        assert!(matches!(odd.to_candle(), Err(LoadError::Unsupported(_))));
    }
}
