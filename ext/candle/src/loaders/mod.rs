//! Loading paths for whole pipelines and single components.

use candle_core::{DType, Device};
use candle_nn::VarBuilder;
use candle_transformers::models::t5;
use serde::de::DeserializeOwned;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokenizers::Tokenizer;

use crate::configs::{read_config, ClipConfig, VaeConfig};
use crate::convert::{ldm_vae_rename, vae_rename, VaeLayout};
use crate::convert::vae::LDM_VAE_PREFIX;
use crate::errors::{LoadError, Result};
use crate::hub::HubClient;
use crate::pipelines::{ClipTextEncoder, T5TextEncoder, Vae};
use crate::tokenizer::TokenizerLoader;
use crate::weights::{var_builder, SafetensorsSource, TensorSource};

pub mod flux;
pub mod sd;
pub mod sd3;

pub use self::flux::{load_flux, load_quanto_text_encoder_2, load_quanto_transformer, load_transformer};
pub use self::sd::load_stable_diffusion;
pub use self::sd3::{load_sd3, load_te3};

/// A diffusers-layout repository, read from a local directory when present
/// and from the hub otherwise.
pub struct Repo<'a> {
    hub: &'a HubClient,
    local: Option<&'a Path>,
    repo_id: &'a str,
}

impl<'a> Repo<'a> {
    pub fn new(hub: &'a HubClient, local: Option<&'a Path>, repo_id: &'a str) -> Self {
        Self { hub, local, repo_id }
    }

    pub fn repo_id(&self) -> &str {
        self.repo_id
    }

    pub fn local(&self) -> Option<&Path> {
        self.local
    }

    pub fn file(&self, subfolder: &str, filename: &str) -> Result<PathBuf> {
        match self.local {
            Some(root) => self.hub.local_or_hub(root, self.repo_id, Some(subfolder), filename),
            None => self.hub.get(self.repo_id, Some(subfolder), filename),
        }
    }

    /// Whether the repository has `<subfolder>/<filename>`. A local
    /// directory answers on its own, without asking the hub.
    pub fn has(&self, subfolder: &str, filename: &str) -> bool {
        match self.local {
            Some(root) => root.join(subfolder).join(filename).is_file(),
            None => self.hub.get(self.repo_id, Some(subfolder), filename).is_ok(),
        }
    }

    /// `<subfolder>/config.json`
    pub fn config<T: DeserializeOwned>(&self, subfolder: &str) -> Result<T> {
        read_config(&self.file(subfolder, "config.json")?)
    }

    /// `<subfolder>/config.json`, or the default when it cannot be read.
    pub fn config_or_default<T: DeserializeOwned + Default>(&self, subfolder: &str) -> T {
        match self.config(subfolder) {
            Ok(cfg) => cfg,
            Err(e) => {
                tracing::debug!(repo = self.repo_id, subfolder, error = %e, "using default config");
                T::default()
            }
        }
    }

    pub fn weights(&self, subfolder: &str) -> Result<SafetensorsSource> {
        let files = self.hub.safetensors_files(self.local, self.repo_id, subfolder)?;
        Ok(SafetensorsSource::open_all(&files)?)
    }

    pub fn tokenizer(&self, subfolder: &str, fallback: &str) -> Result<Tokenizer> {
        TokenizerLoader::from_local_or_hub(self.hub, self.local, self.repo_id, subfolder, Some(fallback))
    }

    /// `scheduler/scheduler_config.json`, if the repository has one
    pub fn scheduler(&self) -> Option<serde_json::Value> {
        self.file("scheduler", "scheduler_config.json")
            .and_then(|path| read_config(&path))
            .map_err(|e| tracing::debug!(repo = self.repo_id, error = %e, "no scheduler config"))
            .ok()
    }

    pub fn load_clip(&self, subfolder: &str, dtype: DType, device: &Device) -> Result<ClipTextEncoder> {
        let config: ClipConfig = self.config_or_default(subfolder);
        let vb = var_builder(self.weights(subfolder)?, dtype, device);
        ClipTextEncoder::load(vb, config)
    }

    pub fn load_t5(&self, subfolder: &str, dtype: DType, device: &Device) -> Result<T5TextEncoder> {
        let config: t5::Config = self.config(subfolder)?;
        let vb = var_builder(self.weights(subfolder)?, dtype, device);
        Ok(T5TextEncoder::load(vb, config)?)
    }

    pub fn load_vae(&self, default: VaeConfig, dtype: DType, device: &Device) -> Result<Vae> {
        let config = self.config("vae").unwrap_or(default);
        let vb = vae_var_builder(self.weights("vae")?, dtype, device)?;
        Ok(Vae::load(vb, config)?)
    }
}

/// `VarBuilder` for a VAE in any of the supported naming schemes.
pub fn vae_var_builder<S: TensorSource + 'static>(
    source: S,
    dtype: DType,
    device: &Device,
) -> Result<VarBuilder<'static>> {
    let layout = VaeLayout::detect(&source)
        .ok_or_else(|| LoadError::Unsupported("no VAE tensors found".to_string()))?;
    let names: HashSet<String> = source.names().into_iter().collect();
    let vb = var_builder(source, dtype, device);
    Ok(match layout {
        // only names the export lacks are rewritten
        VaeLayout::Diffusers => vb.rename_f(move |name: &str| {
            if names.contains(name) {
                name.to_string()
            } else {
                vae_rename(name)
            }
        }),
        VaeLayout::Ldm { prefixed: false } => vb.rename_f(ldm_vae_rename),
        VaeLayout::Ldm { prefixed: true } => vb.rename_f(ldm_vae_rename).pp(LDM_VAE_PREFIX),
    })
}

/// Log a failed load, with the full error chain when debugging.
pub(crate) fn log_failure(context: &str, err: &LoadError, debug: bool) {
    tracing::error!(error = %err, "{context}");
    if debug {
        let mut source = std::error::Error::source(err);
        while let Some(cause) = source {
            tracing::error!(cause = %cause, "{context}: caused by");
            source = cause.source();
        }
        tracing::debug!(error = ?err, "{context}: details");
    }
}
