use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::errors::Result;

/// Name that disables the UNet override.
pub const NO_UNET: &str = "None";

/// Where loaded components are kept between uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OffloadMode {
    #[default]
    None,
    Model,
    Sequential,
}

/// Loader options shared by every loading path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderOptions {
    /// Registry name of the UNet/transformer override, or `"None"`
    pub sd_unet: String,
    /// Directory scanned by the UNet registry
    pub unet_dir: PathBuf,
    /// Cache directory for diffusers-layout repositories
    pub diffusers_dir: PathBuf,
    /// Cache directory for single-file hub downloads
    pub hfcache_dir: Option<PathBuf>,
    pub huggingface_token: Option<String>,
    /// Keep the VAE in f32 regardless of `dtype`
    pub no_half_vae: bool,
    pub diffusers_offload_mode: OffloadMode,
    /// Compute dtype for text encoders and transformers
    pub dtype: String,
    /// Compute dtype for UNets swapped in from the registry
    pub dtype_unet: String,
    /// `auto`, `cpu`, `cuda` or `metal`
    pub device: String,
    pub use_flash_attn: bool,
    /// Log full error chains for failed loads
    pub debug: bool,
}

impl Default for LoaderOptions {
    fn default() -> Self {
        Self {
            sd_unet: NO_UNET.to_string(),
            unet_dir: PathBuf::from("models/UNET"),
            diffusers_dir: PathBuf::from("models/Diffusers"),
            hfcache_dir: None,
            huggingface_token: None,
            no_half_vae: false,
            diffusers_offload_mode: OffloadMode::None,
            dtype: "f16".to_string(),
            dtype_unet: "f16".to_string(),
            device: "auto".to_string(),
            use_flash_attn: false,
            debug: false,
        }
    }
}

impl LoaderOptions {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Apply `HF_TOKEN`, `SD_UNET_DIR` and `SD_LOAD_DEBUG` from the environment.
    pub fn apply_env(mut self) -> Self {
        self.apply_vars(|key| std::env::var(key).ok());
        self
    }

    fn apply_vars(&mut self, var: impl Fn(&str) -> Option<String>) {
        if self.huggingface_token.is_none() {
            self.huggingface_token = var("HF_TOKEN").filter(|t| !t.is_empty());
        }
        if let Some(dir) = var("SD_UNET_DIR").filter(|d| !d.is_empty()) {
            self.unet_dir = PathBuf::from(dir);
        }
        if var("SD_LOAD_DEBUG").is_some() {
            self.debug = true;
        }
    }

    /// The UNet override, if one is selected.
    pub fn selected_unet(&self) -> Option<&str> {
        if self.sd_unet.is_empty() || self.sd_unet == NO_UNET {
            None
        } else {
            Some(&self.sd_unet)
        }
    }
}
