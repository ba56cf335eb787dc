//! Pipeline containers.
//!
//! A pipeline only holds loaded components; sampling and scheduling are
//! driven by the caller. Every component is optional so loaders can build
//! a pipeline piecewise and substitute parts afterwards.

use candle_core::{DType, Device};
use tokenizers::Tokenizer;

mod components;
mod thread_safe;

pub use self::components::{ClipTextEncoder, FluxTransformer, Mmdit, T5TextEncoder, Unet, Vae};
pub use self::thread_safe::ThreadSafePipeline;

pub struct FluxPipeline {
    pub transformer: Option<FluxTransformer>,
    pub vae: Option<Vae>,
    pub text_encoder: Option<ClipTextEncoder>,
    pub text_encoder_2: Option<T5TextEncoder>,
    pub tokenizer: Option<Tokenizer>,
    pub tokenizer_2: Option<Tokenizer>,
    /// `scheduler_config.json`, passed through untouched
    pub scheduler: Option<serde_json::Value>,
    pub device: Device,
    pub dtype: DType,
}

impl FluxPipeline {
    pub fn empty(device: Device, dtype: DType) -> Self {
        Self {
            transformer: None,
            vae: None,
            text_encoder: None,
            text_encoder_2: None,
            tokenizer: None,
            tokenizer_2: None,
            scheduler: None,
            device,
            dtype,
        }
    }
}

pub struct Sd3Pipeline {
    pub transformer: Option<Mmdit>,
    pub vae: Option<Vae>,
    pub text_encoder: Option<ClipTextEncoder>,
    pub text_encoder_2: Option<ClipTextEncoder>,
    pub text_encoder_3: Option<T5TextEncoder>,
    pub tokenizer: Option<Tokenizer>,
    pub tokenizer_2: Option<Tokenizer>,
    pub tokenizer_3: Option<Tokenizer>,
    pub scheduler: Option<serde_json::Value>,
    pub device: Device,
    pub dtype: DType,
}

impl Sd3Pipeline {
    pub fn empty(device: Device, dtype: DType) -> Self {
        Self {
            transformer: None,
            vae: None,
            text_encoder: None,
            text_encoder_2: None,
            text_encoder_3: None,
            tokenizer: None,
            tokenizer_2: None,
            tokenizer_3: None,
            scheduler: None,
            device,
            dtype,
        }
    }
}

/// UNet-based Stable Diffusion (1.x/2.x/XL)
pub struct SdPipeline {
    pub unet: Option<Unet>,
    pub vae: Option<Vae>,
    pub text_encoder: Option<ClipTextEncoder>,
    pub text_encoder_2: Option<ClipTextEncoder>,
    pub tokenizer: Option<Tokenizer>,
    pub tokenizer_2: Option<Tokenizer>,
    pub scheduler: Option<serde_json::Value>,
    pub device: Device,
    pub dtype: DType,
}

impl SdPipeline {
    pub fn empty(device: Device, dtype: DType) -> Self {
        Self {
            unet: None,
            vae: None,
            text_encoder: None,
            text_encoder_2: None,
            tokenizer: None,
            tokenizer_2: None,
            scheduler: None,
            device,
            dtype,
        }
    }
}

pub enum Pipeline {
    Flux(FluxPipeline),
    Sd3(Sd3Pipeline),
    StableDiffusion(SdPipeline),
}

impl Pipeline {
    /// Diffusers class name of the pipeline
    pub fn class_name(&self) -> &'static str {
        match self {
            Self::Flux(_) => "FluxPipeline",
            Self::Sd3(_) => "StableDiffusion3Pipeline",
            Self::StableDiffusion(_) => "StableDiffusionPipeline",
        }
    }

    pub fn device(&self) -> &Device {
        match self {
            Self::Flux(p) => &p.device,
            Self::Sd3(p) => &p.device,
            Self::StableDiffusion(p) => &p.device,
        }
    }

    pub fn dtype(&self) -> DType {
        match self {
            Self::Flux(p) => p.dtype,
            Self::Sd3(p) => p.dtype,
            Self::StableDiffusion(p) => p.dtype,
        }
    }

    /// Component slots with whether each one is loaded.
    pub fn components(&self) -> Vec<(&'static str, bool)> {
        match self {
            Self::Flux(p) => vec![
                ("transformer", p.transformer.is_some()),
                ("vae", p.vae.is_some()),
                ("text_encoder", p.text_encoder.is_some()),
                ("text_encoder_2", p.text_encoder_2.is_some()),
                ("tokenizer", p.tokenizer.is_some()),
                ("tokenizer_2", p.tokenizer_2.is_some()),
                ("scheduler", p.scheduler.is_some()),
            ],
            Self::Sd3(p) => vec![
                ("transformer", p.transformer.is_some()),
                ("vae", p.vae.is_some()),
                ("text_encoder", p.text_encoder.is_some()),
                ("text_encoder_2", p.text_encoder_2.is_some()),
                ("text_encoder_3", p.text_encoder_3.is_some()),
                ("tokenizer", p.tokenizer.is_some()),
                ("tokenizer_2", p.tokenizer_2.is_some()),
                ("tokenizer_3", p.tokenizer_3.is_some()),
                ("scheduler", p.scheduler.is_some()),
            ],
            Self::StableDiffusion(p) => vec![
                ("unet", p.unet.is_some()),
                ("vae", p.vae.is_some()),
                ("text_encoder", p.text_encoder.is_some()),
                ("text_encoder_2", p.text_encoder_2.is_some()),
                ("tokenizer", p.tokenizer.is_some()),
                ("tokenizer_2", p.tokenizer_2.is_some()),
                ("scheduler", p.scheduler.is_some()),
            ],
        }
    }

    /// One-line summary, e.g. `FluxPipeline(transformer, vae, -text_encoder_2)`
    pub fn describe(&self) -> String {
        let parts: Vec<String> = self
            .components()
            .into_iter()
            .map(|(name, loaded)| if loaded { name.to_string() } else { format!("-{name}") })
            .collect();
        format!("{}({}) on {:?} as {:?}", self.class_name(), parts.join(", "), self.device(), self.dtype())
    }

    pub fn has_unet(&self) -> bool {
        matches!(self, Self::StableDiffusion(p) if p.unet.is_some())
    }
}
