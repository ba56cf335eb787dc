use candle_core::{DType, Device, Result as CandleResult};
use candle_nn::{Linear, VarBuilder};
use candle_transformers::models::mmdit::model::{Config as MmditModelConfig, MMDiT};
use candle_transformers::models::stable_diffusion::clip::ClipTextTransformer;
use candle_transformers::models::stable_diffusion::unet_2d::UNet2DConditionModel;
use candle_transformers::models::stable_diffusion::vae::AutoEncoderKL;
use candle_transformers::models::{flux, t5};
use candle_transformers::quantized_var_builder;
use std::path::Path;

use crate::configs::{ClipConfig, UNetConfig, VaeConfig};

/// FLUX transformer, dense or GGML-quantized.
pub enum FluxTransformer {
    Full {
        model: flux::model::Flux,
        config: flux::model::Config,
    },
    Quantized {
        model: flux::quantized_model::Flux,
        config: flux::model::Config,
    },
}

impl FluxTransformer {
    pub fn load(vb: VarBuilder, config: flux::model::Config) -> CandleResult<Self> {
        let model = flux::model::Flux::new(&config, vb)?;
        Ok(Self::Full { model, config })
    }

    /// Load GGML blocks straight from a GGUF file
    pub fn load_gguf(path: &Path, config: flux::model::Config, device: &Device) -> CandleResult<Self> {
        let vb = quantized_var_builder::VarBuilder::from_gguf(path, device)?;
        let model = flux::quantized_model::Flux::new(&config, vb)?;
        Ok(Self::Quantized { model, config })
    }

    pub fn config(&self) -> &flux::model::Config {
        match self {
            Self::Full { config, .. } | Self::Quantized { config, .. } => config,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Full { .. } => "full",
            Self::Quantized { .. } => "gguf",
        }
    }
}

pub struct Mmdit {
    pub model: MMDiT,
    pub config: MmditModelConfig,
}

impl Mmdit {
    pub fn load(vb: VarBuilder, config: MmditModelConfig, use_flash_attn: bool) -> CandleResult<Self> {
        let model = MMDiT::new(&config, use_flash_attn, vb)?;
        Ok(Self { model, config })
    }
}

/// A UNet together with the diffusers config it was built from, which is
/// reused when another UNet is swapped in.
pub struct Unet {
    pub model: UNet2DConditionModel,
    pub config: UNetConfig,
    pub dtype: DType,
}

impl Unet {
    pub fn load(vb: VarBuilder, config: UNetConfig, use_flash_attn: bool) -> crate::errors::Result<Self> {
        let dtype = vb.dtype();
        let model = UNet2DConditionModel::new(
            vb,
            config.in_channels,
            config.out_channels,
            use_flash_attn,
            config.to_candle()?,
        )?;
        Ok(Self { model, config, dtype })
    }
}

pub struct Vae {
    pub model: AutoEncoderKL,
    pub config: VaeConfig,
    pub dtype: DType,
}

impl Vae {
    pub fn load(vb: VarBuilder, config: VaeConfig) -> CandleResult<Self> {
        let dtype = vb.dtype();
        let model = AutoEncoderKL::new(vb, config.in_channels, config.out_channels, config.to_candle())?;
        Ok(Self { model, config, dtype })
    }
}

/// CLIP text transformer with the optional `text_projection` of
/// `CLIPTextModelWithProjection` exports.
pub struct ClipTextEncoder {
    pub model: ClipTextTransformer,
    pub projection: Option<Linear>,
    pub config: ClipConfig,
}

impl ClipTextEncoder {
    pub fn load(vb: VarBuilder, config: ClipConfig) -> crate::errors::Result<Self> {
        let model = ClipTextTransformer::new(vb.clone(), &config.to_candle()?)?;
        let projection = match config.projection_dim {
            Some(dim) if vb.contains_tensor("text_projection.weight") => Some(
                candle_nn::linear_no_bias(config.hidden_size, dim, vb.pp("text_projection"))?,
            ),
            _ => None,
        };
        Ok(Self {
            model,
            projection,
            config,
        })
    }
}

pub struct T5TextEncoder {
    pub model: t5::T5EncoderModel,
    pub config: t5::Config,
    pub dtype: DType,
}

impl T5TextEncoder {
    pub fn load(vb: VarBuilder, config: t5::Config) -> CandleResult<Self> {
        let dtype = vb.dtype();
        let model = t5::T5EncoderModel::load(vb, &config)?;
        Ok(Self { model, config, dtype })
    }
}
