use candle_core::quantized::gguf_file;
use candle_core::{DType, Device};
use candle_transformers::models::{flux, t5};
use std::path::Path;

use super::{log_failure, Repo};
use crate::checkpoint::{CheckpointInfo, QuantKind};
use crate::configs::flux::{detect, preset};
use crate::configs::{FluxTransformerConfig, VaeConfig};
use crate::convert::bfl_source;
use crate::devices::{offload_device, parse_dtype, release_memory};
use crate::errors::{LoadError, Result};
use crate::hub::HubClient;
use crate::options::LoaderOptions;
use crate::pipelines::{FluxPipeline, FluxTransformer, T5TextEncoder};
use crate::tokenizer::{CLIP_L_TOKENIZER_REPO, T5_TOKENIZER_REPO};
use crate::weights::{
    var_builder, Nf4Source, QuantizationMap, QuantoSource, SafetensorsSource, TensorSource,
};

/// Repositories the remaining components come from when only a transformer
/// file is given, for guidance-distilled (dev) and timestep-distilled
/// (schnell) checkpoints.
pub const FLUX_BASE_REPO: &str = "black-forest-labs/FLUX.1-dev";
pub const FLUX_SCHNELL_REPO: &str = "black-forest-labs/FLUX.1-schnell";

const QUANTIZATION_MAP: &str = "quantization_map.json";
const TRANSFORMER_DTYPE_TENSOR: &str = "context_embedder.bias";
const T5_DTYPE_TENSOR: &str = "encoder.block.0.layer.0.SelfAttention.relative_attention_bias.weight";

/// Base repository matching a transformer with or without guidance embedding
pub fn base_repo(guidance: bool) -> &'static str {
    if guidance {
        FLUX_BASE_REPO
    } else {
        FLUX_SCHNELL_REPO
    }
}

/// Load a FLUX pipeline, picking the strategy from the checkpoint path.
///
/// Enables `no_half_vae` on the options when running in f16, since the FLUX
/// VAE overflows in half precision.
pub fn load_flux(
    checkpoint: &CheckpointInfo,
    options: &mut LoaderOptions,
    hub: &HubClient,
) -> Result<FluxPipeline> {
    let quant = checkpoint.quant();
    tracing::debug!(model = %checkpoint.name, %quant, "Loading FLUX");

    let device = offload_device(options)?;
    let dtype = parse_dtype(&options.dtype)?;
    let local = checkpoint.is_local_dir().then_some(checkpoint.path.as_path());
    let repo = Repo::new(hub, local, checkpoint.repo_id());
    let single_file = checkpoint.path.is_file();

    let transformer = match quant {
        QuantKind::Nf4 => {
            let loaded = if single_file {
                SafetensorsSource::open(&checkpoint.path)
                    .map_err(LoadError::from)
                    .and_then(|source| load_nf4_transformer(source, None, dtype, &device))
            } else {
                repo.weights("transformer").and_then(|source| {
                    let config = transformer_config(&repo);
                    load_nf4_transformer(source, config, dtype, &device)
                })
            };
            loaded.map_err(|e| {
                tracing::error!(error = %e, "FLUX: Failed to load nf4 transformer");
                e
            })?
        }
        QuantKind::Qint8 | QuantKind::Qint4 => load_quanto_transformer(checkpoint, options, hub)?,
        QuantKind::Gguf => load_gguf_transformer(&checkpoint.path, &device)?,
        QuantKind::None if single_file => load_transformer_file(&checkpoint.path, options)?,
        QuantKind::None => {
            let source = bfl_source(repo.weights("transformer")?)?;
            let config = match transformer_config(&repo) {
                Some(config) => config,
                None => detect(&source)?,
            };
            FluxTransformer::load(var_builder(source, dtype, &device), config)?
        }
    };

    let components = if single_file {
        let base = base_repo(transformer.config().guidance_embed);
        tracing::debug!(repo = base, "FLUX: components from base repository");
        Repo::new(hub, None, base)
    } else {
        Repo::new(hub, local, checkpoint.repo_id())
    };

    let mut pipe = FluxPipeline::empty(device.clone(), dtype);
    pipe.transformer = Some(transformer);
    pipe.text_encoder_2 = Some(match quant {
        QuantKind::Qint8 | QuantKind::Qint4 => load_quanto_text_encoder_2(checkpoint, options, hub)?,
        _ => components.load_t5("text_encoder_2", dtype, &device)?,
    });

    let vae_dtype = vae_dtype(options, dtype);
    pipe.vae = Some(components.load_vae(VaeConfig::flux(), vae_dtype, &device)?);
    pipe.text_encoder = Some(components.load_clip("text_encoder", dtype, &device)?);
    pipe.tokenizer = Some(components.tokenizer("tokenizer", CLIP_L_TOKENIZER_REPO)?);
    pipe.tokenizer_2 = Some(components.tokenizer("tokenizer_2", T5_TOKENIZER_REPO)?);
    pipe.scheduler = components.scheduler();

    release_memory(&device, false);
    Ok(pipe)
}

/// VAE dtype for a FLUX pipeline computing in `dtype`. The FLUX VAE
/// overflows in f16, so f16 turns `no_half_vae` on.
pub fn vae_dtype(options: &mut LoaderOptions, dtype: DType) -> DType {
    if dtype == DType::F16 && !options.no_half_vae {
        tracing::warn!("FLUX: does not support FP16 VAE, enabling no-half-vae");
        options.no_half_vae = true;
    }
    if options.no_half_vae {
        DType::F32
    } else {
        dtype
    }
}

/// Candle config from `transformer/config.json`, when the repository has one
fn transformer_config(repo: &Repo) -> Option<flux::model::Config> {
    repo.config::<FluxTransformerConfig>("transformer")
        .map(|cfg| cfg.to_candle())
        .map_err(|e| tracing::debug!(repo = repo.repo_id(), error = %e, "no transformer config"))
        .ok()
}

/// Load a quanto-serialized component of `checkpoint`.
///
/// Weights are rehydrated in the stored dtype of `dtype_tensor`; when that
/// differs from the configured dtype the component is cast on load.
fn load_quanto_component<T>(
    checkpoint: &CheckpointInfo,
    options: &LoaderOptions,
    hub: &HubClient,
    subfolder: &str,
    dtype_tensor: &str,
    build: impl FnOnce(&Repo, Box<dyn TensorSource>, DType, &Device) -> Result<T>,
) -> Result<T> {
    let local = checkpoint.is_local_dir().then_some(checkpoint.path.as_path());
    let repo = Repo::new(hub, local, checkpoint.repo_id());

    let map = QuantizationMap::from_file(&repo.file(subfolder, QUANTIZATION_MAP)?)?;
    let unsupported = map.unsupported_qtypes();
    if !unsupported.is_empty() {
        return Err(LoadError::Unsupported(format!(
            "{subfolder} uses quantization types {}",
            unsupported.join(", ")
        )));
    }
    tracing::debug!(subfolder, modules = map.len(), "quantization map");

    let source = QuantoSource::new(repo.weights(subfolder)?, map);
    let stored = source.reference_dtype(dtype_tensor).ok_or_else(|| {
        LoadError::msg(format!("{subfolder} has no {dtype_tensor} tensor to take the dtype from"))
    })?;
    let dtype = parse_dtype(&options.dtype)?;
    if stored != dtype {
        tracing::info!(subfolder, from = ?stored, to = ?dtype, "FLUX: casting quantized component");
    }

    let device = offload_device(options)?;
    build(&repo, Box::new(source), dtype, &device).map_err(|e| {
        tracing::error!(subfolder, error = %e, "{}", quanto_failure(subfolder, stored, dtype));
        e
    })
}

/// Log line for a quanto component that failed to build. The dtype hint is
/// only given when the component was cast.
fn quanto_failure(subfolder: &str, stored: DType, dtype: DType) -> String {
    if stored != dtype {
        format!("FLUX: Failed to cast {subfolder} to {dtype:?}, set dtype to {stored:?}")
    } else {
        format!("FLUX: Failed to load quantized {subfolder}")
    }
}

/// FLUX transformer from a quanto checkpoint (`transformer/`)
pub fn load_quanto_transformer(
    checkpoint: &CheckpointInfo,
    options: &LoaderOptions,
    hub: &HubClient,
) -> Result<FluxTransformer> {
    load_quanto_component(
        checkpoint,
        options,
        hub,
        "transformer",
        TRANSFORMER_DTYPE_TENSOR,
        |repo, source, dtype, device| {
            let source = bfl_source(source)?;
            let config = match transformer_config(repo) {
                Some(config) => config,
                None => detect(&source)?,
            };
            Ok(FluxTransformer::load(var_builder(source, dtype, device), config)?)
        },
    )
}

/// T5 text encoder from a quanto checkpoint (`text_encoder_2/`)
pub fn load_quanto_text_encoder_2(
    checkpoint: &CheckpointInfo,
    options: &LoaderOptions,
    hub: &HubClient,
) -> Result<T5TextEncoder> {
    load_quanto_component(
        checkpoint,
        options,
        hub,
        "text_encoder_2",
        T5_DTYPE_TENSOR,
        |repo, source, dtype, device| {
            let config: t5::Config = repo.config("text_encoder_2")?;
            Ok(T5TextEncoder::load(var_builder(source, dtype, device), config)?)
        },
    )
}

fn load_nf4_transformer<S: TensorSource + 'static>(
    source: S,
    config: Option<flux::model::Config>,
    dtype: DType,
    device: &Device,
) -> Result<FluxTransformer> {
    let source = Nf4Source::new(source);
    if !source.has_quant_state() {
        return Err(LoadError::BackendUnavailable {
            backend: "bitsandbytes",
            reason: "checkpoint carries no nf4 quant state".to_string(),
        });
    }
    let source = bfl_source(source)?;
    let config = match config {
        Some(config) => config,
        None => detect(&source)?,
    };
    Ok(FluxTransformer::load(var_builder(source, dtype, device), config)?)
}

fn load_gguf_transformer(path: &Path, device: &Device) -> Result<FluxTransformer> {
    let mut file = std::fs::File::open(path)?;
    let content = gguf_file::Content::read(&mut file)?;
    let guidance = content.tensor_infos.contains_key("guidance_in.in_layer.weight");
    tracing::debug!(path = %path.display(), tensors = content.tensor_infos.len(), guidance, "FLUX gguf");
    Ok(FluxTransformer::load_gguf(path, preset(guidance), device)?)
}

/// Load a single-file FLUX transformer, as registered in the UNet directory.
pub fn load_transformer(file: &Path, options: &LoaderOptions) -> Result<FluxTransformer> {
    let result = load_transformer_file(file, options);
    if let Err(e) = &result {
        log_failure("Failed to load UNet model", e, options.debug);
    }
    result
}

fn load_transformer_file(file: &Path, options: &LoaderOptions) -> Result<FluxTransformer> {
    if !file.is_file() {
        return Err(LoadError::NotFound(file.to_path_buf()));
    }
    let device = offload_device(options)?;
    let dtype = parse_dtype(&options.dtype)?;
    if QuantKind::classify(file) == QuantKind::Gguf {
        return load_gguf_transformer(file, &device);
    }

    let source = SafetensorsSource::open(file)?;
    if source.names().iter().any(|n| n.ends_with(".weight._data")) {
        return Err(LoadError::Unsupported(
            "quanto transformers need their quantization map, load them as a diffusers folder"
                .to_string(),
        ));
    }
    // nf4 tensors are rehydrated, plain ones pass through
    let source = bfl_source(Nf4Source::new(source))?;
    let config = detect(&source)?;
    tracing::info!(
        file = %file.display(),
        guidance = config.guidance_embed,
        dtype = ?dtype,
        "Loading FLUX transformer"
    );
    Ok(FluxTransformer::load(var_builder(source, dtype, &device), config)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::weights::test_util::MapSource;
    use candle_core::Tensor;
    use std::collections::HashMap;

    #[test]
    fn test_base_repo_follows_guidance() {
        assert_eq!(base_repo(true), "black-forest-labs/FLUX.1-dev");
        assert_eq!(base_repo(false), "black-forest-labs/FLUX.1-schnell");
    }

    #[test]
    fn test_f16_enables_no_half_vae() {
        let mut options = LoaderOptions::default();
        assert_eq!(vae_dtype(&mut options, DType::F16), DType::F32);
        assert!(options.no_half_vae);

        let mut options = LoaderOptions::default();
        assert_eq!(vae_dtype(&mut options, DType::BF16), DType::BF16);
        assert!(!options.no_half_vae);

        options.no_half_vae = true;
        assert_eq!(vae_dtype(&mut options, DType::BF16), DType::F32);
    }

    #[test]
    fn test_cast_hint_only_after_a_cast() {
        let cast = quanto_failure("transformer", DType::BF16, DType::F16);
        assert_eq!(cast, "FLUX: Failed to cast transformer to F16, set dtype to BF16");
        let plain = quanto_failure("transformer", DType::F16, DType::F16);
        assert_eq!(plain, "FLUX: Failed to load quantized transformer");
    }

    #[test]
    fn test_nf4_without_quant_state() {
        let packed = Tensor::zeros((4, 1), DType::U8, &Device::Cpu).unwrap();
        let source = MapSource(HashMap::from([("img_in.weight".to_string(), packed)]));
        match load_nf4_transformer(source, None, DType::F32, &Device::Cpu) {
            Err(LoadError::BackendUnavailable { backend, .. }) => assert_eq!(backend, "bitsandbytes"),
            Err(e) => panic!("unexpected error: {e}"),
            Ok(_) => panic!("loaded an nf4 transformer without quant state"),
        }
    }
}
