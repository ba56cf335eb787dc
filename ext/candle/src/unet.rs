//! Registry of standalone UNet/transformer files that can be swapped into a
//! loaded pipeline.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::checkpoint::QuantKind;
use crate::configs::{read_config, UNetConfig};
use crate::devices::{compute_device, parse_dtype, release_memory};
use crate::errors::{LoadError, Result};
use crate::loaders::{load_transformer, log_failure};
use crate::options::LoaderOptions;
use crate::pipelines::{FluxPipeline, Pipeline, SdPipeline, Unet};
use crate::weights::{var_builder, SafetensorsSource};

const EXTENSIONS: [&str; 2] = ["safetensors", "gguf"];

/// Weight files found under the UNet directory, keyed by file stem.
#[derive(Debug, Clone, Default)]
pub struct UnetRegistry {
    dir: PathBuf,
    items: BTreeMap<String, PathBuf>,
}

impl UnetRegistry {
    /// Registry over `dir`, scanned once on creation.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let mut registry = Self {
            dir: dir.into(),
            items: BTreeMap::new(),
        };
        registry.refresh();
        registry
    }

    pub fn from_options(options: &LoaderOptions) -> Self {
        Self::new(options.unet_dir.clone())
    }

    /// Rescan the directory. Returns the number of entries.
    pub fn refresh(&mut self) -> usize {
        self.items.clear();
        let files = WalkDir::new(&self.dir)
            .follow_links(true)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file());
        for entry in files {
            let path = entry.path();
            let wanted = path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| EXTENSIONS.iter().any(|e| ext.eq_ignore_ascii_case(e)));
            if !wanted {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                self.items.insert(stem.to_string(), path.to_path_buf());
            }
        }
        tracing::debug!(path = %self.dir.display(), items = self.items.len(), "Available UNets");
        self.items.len()
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn names(&self) -> Vec<&str> {
        self.items.keys().map(String::as_str).collect()
    }

    pub fn get(&self, name: &str) -> Option<&Path> {
        self.items.get(name).map(PathBuf::as_path)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Swap the UNet selected by `options.sd_unet` into `pipe`.
    ///
    /// Failures are logged and leave the pipeline as it was. Returns whether
    /// a new UNet or transformer was assigned.
    pub fn load_unet(&self, pipe: &mut Pipeline, options: &LoaderOptions) -> bool {
        let Some(name) = options.selected_unet() else {
            return false;
        };
        let Some(file) = self.get(name) else {
            tracing::error!(name, "UNet model not found");
            return false;
        };
        let config_file = file.with_extension("json");
        let config = config_file.is_file().then_some(config_file.as_path());

        let class = pipe.class_name();
        let result = match pipe {
            // load_transformer reports its own failures
            Pipeline::Flux(flux) => swap_transformer(flux, file, options),
            Pipeline::StableDiffusion(sd) if sd.unet.is_some() => {
                swap_unet(sd, name, file, config, options).map_err(|e| {
                    log_failure("Failed to load UNet model", &e, options.debug);
                    e
                })
            }
            _ => {
                tracing::error!(class, "UNet not found in current model");
                return false;
            }
        };
        match result {
            Ok(()) => {
                release_memory(pipe.device(), false);
                true
            }
            Err(_) => false,
        }
    }
}

fn swap_transformer(pipe: &mut FluxPipeline, file: &Path, options: &LoaderOptions) -> Result<()> {
    let transformer = load_transformer(file, options)?;
    pipe.transformer = None;
    pipe.transformer = Some(transformer);
    Ok(())
}

fn swap_unet(
    pipe: &mut SdPipeline,
    name: &str,
    file: &Path,
    config: Option<&Path>,
    options: &LoaderOptions,
) -> Result<()> {
    if QuantKind::classify(file) == QuantKind::Gguf {
        return Err(LoadError::Unsupported(format!(
            "{} is a gguf file, only FLUX transformers load from gguf",
            file.display()
        )));
    }
    let unet_config = match config {
        Some(path) => read_config::<UNetConfig>(path)?,
        None => pipe.unet.as_ref().map(|u| u.config.clone()).unwrap_or_default(),
    };
    tracing::info!(
        name,
        file = %file.display(),
        config = %config.map_or("default".into(), |p| p.display().to_string()),
        "Loading UNet"
    );

    let device = compute_device(options)?;
    let dtype = parse_dtype(&options.dtype_unet)?;
    let vb = var_builder(SafetensorsSource::open(file)?, dtype, &device);
    let unet = Unet::load(vb, unet_config, options.use_flash_attn)?;
    pipe.unet = None;
    pipe.unet = Some(unet);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipelines::Sd3Pipeline;
    use candle_core::{DType, Device};
    use std::fs;

    fn options(sd_unet: &str) -> LoaderOptions {
        LoaderOptions {
            sd_unet: sd_unet.to_string(),
            device: "cpu".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_refresh_scans_recursively() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("flux/dev")).unwrap();
        fs::write(dir.path().join("sdxl-turbo.safetensors"), b"").unwrap();
        fs::write(dir.path().join("flux/dev/flux1-dev-Q4_0.gguf"), b"").unwrap();
        fs::write(dir.path().join("flux/dev/flux1-dev-Q4_0.json"), b"{}").unwrap();
        fs::write(dir.path().join("notes.txt"), b"").unwrap();

        let mut registry = UnetRegistry::new(dir.path());
        assert_eq!(registry.names(), vec!["flux1-dev-Q4_0", "sdxl-turbo"]);
        assert_eq!(
            registry.get("flux1-dev-Q4_0"),
            Some(dir.path().join("flux/dev/flux1-dev-Q4_0.gguf").as_path())
        );

        fs::remove_file(dir.path().join("sdxl-turbo.safetensors")).unwrap();
        assert_eq!(registry.refresh(), 1);
        assert!(registry.get("sdxl-turbo").is_none());
    }

    #[test]
    fn test_missing_dir_is_empty() {
        let registry = UnetRegistry::new("/nonexistent/unet/dir");
        assert!(registry.is_empty());
    }

    #[test]
    fn test_load_unet_skips_none_and_unknown() {
        let dir = tempfile::tempdir().unwrap();
        let registry = UnetRegistry::new(dir.path());
        let mut pipe = Pipeline::Flux(FluxPipeline::empty(Device::Cpu, DType::F32));
        assert!(!registry.load_unet(&mut pipe, &options("None")));
        assert!(!registry.load_unet(&mut pipe, &options("missing")));
    }

    #[test]
    fn test_load_unet_needs_a_unet_slot() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("custom.safetensors"), b"").unwrap();
        let registry = UnetRegistry::new(dir.path());

        let mut sd3 = Pipeline::Sd3(Sd3Pipeline::empty(Device::Cpu, DType::F16));
        assert!(!registry.load_unet(&mut sd3, &options("custom")));
        let mut sd = Pipeline::StableDiffusion(SdPipeline::empty(Device::Cpu, DType::F16));
        assert!(!registry.load_unet(&mut sd, &options("custom")));
        assert!(!sd.has_unet());
    }

    #[test]
    fn test_failed_transformer_keeps_pipeline() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("broken.safetensors"), b"not a safetensors file").unwrap();
        let registry = UnetRegistry::new(dir.path());

        let mut pipe = Pipeline::Flux(FluxPipeline::empty(Device::Cpu, DType::F32));
        assert!(!registry.load_unet(&mut pipe, &options("broken")));
        assert_eq!(pipe.components()[0], ("transformer", false));
    }
}
