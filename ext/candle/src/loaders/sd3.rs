use candle_core::{DType, Device};
use candle_transformers::models::t5;
use std::path::{Path, PathBuf};

use super::{vae_var_builder, Repo};
use crate::checkpoint::Te3Variant;
use crate::configs::{read_config, MmditConfig, VaeConfig};
use crate::convert::PrefixedSource;
use crate::devices::{offload_device, release_memory};
use crate::errors::Result;
use crate::hub::HubClient;
use crate::options::LoaderOptions;
use crate::pipelines::{Mmdit, Pipeline, Sd3Pipeline, T5TextEncoder, Vae};
use crate::tokenizer::{CLIP_G_TOKENIZER_REPO, CLIP_L_TOKENIZER_REPO, T5_TOKENIZER_REPO};
use crate::weights::{var_builder, SafetensorsSource};

/// Diffusers repository the text encoders and tokenizers come from
pub const SD3_REPO: &str = "stabilityai/stable-diffusion-3-medium-diffusers";
/// Repository with the single-file checkpoint and the fp8 T5
pub const SD3_SINGLE_FILE_REPO: &str = "stabilityai/stable-diffusion-3-medium";
pub const SD3_SINGLE_FILE: &str = "sd3_medium.safetensors";
pub const T5_FP8_FILE: &str = "t5xxl_fp8_e4m3fn.safetensors";

const MMDIT_PREFIX: &str = "model.diffusion_model.";

/// Load a Stable Diffusion 3 pipeline.
///
/// The MMDiT and VAE come from `file` when it is an existing
/// `.safetensors` checkpoint, otherwise from the reference single-file
/// checkpoint on the hub. `config` may point to a diffusers
/// `transformer/config.json` (or the folder holding it); without one the
/// MMDiT variant is detected from its block count.
pub fn load_sd3(
    te3: Te3Variant,
    file: Option<&Path>,
    cache_dir: Option<&Path>,
    config: Option<&Path>,
    options: &LoaderOptions,
) -> Result<Sd3Pipeline> {
    let hub = HubClient::new(cache_dir, options.huggingface_token.as_deref())?;
    let dtype = DType::F16;
    let device = offload_device(options)?;

    let checkpoint = match file {
        Some(path) if is_safetensors(path) && path.is_file() => path.to_path_buf(),
        _ => hub.get(SD3_SINGLE_FILE_REPO, None, SD3_SINGLE_FILE)?,
    };
    tracing::info!(file = %checkpoint.display(), te3 = ?te3, "Loading SD3");

    let mut pipe = Sd3Pipeline::empty(device.clone(), dtype);
    pipe.transformer = Some(load_mmdit(&checkpoint, config, dtype, &device, options.use_flash_attn)?);
    let vb = vae_var_builder(SafetensorsSource::open(&checkpoint)?, dtype, &device)?;
    pipe.vae = Some(Vae::load(vb, VaeConfig::sd3())?);

    let repo = Repo::new(&hub, None, SD3_REPO);
    pipe.text_encoder = Some(repo.load_clip("text_encoder", dtype, &device)?);
    pipe.text_encoder_2 = Some(repo.load_clip("text_encoder_2", dtype, &device)?);
    pipe.tokenizer = Some(repo.tokenizer("tokenizer", CLIP_L_TOKENIZER_REPO)?);
    pipe.tokenizer_2 = Some(repo.tokenizer("tokenizer_2", CLIP_G_TOKENIZER_REPO)?);
    pipe.text_encoder_3 = load_t5(&hub, &repo, te3, dtype, &device)?;
    if pipe.text_encoder_3.is_some() {
        pipe.tokenizer_3 = Some(repo.tokenizer("tokenizer_3", T5_TOKENIZER_REPO)?);
    }
    pipe.scheduler = repo.scheduler();

    release_memory(&device, true);
    Ok(pipe)
}

/// Swap the T5 text encoder of an SD3 pipeline. Other pipelines are left
/// untouched.
pub fn load_te3(
    pipe: &mut Pipeline,
    te3: Te3Variant,
    cache_dir: Option<&Path>,
    options: &LoaderOptions,
) -> Result<()> {
    let pipe = match pipe {
        Pipeline::Sd3(pipe) => pipe,
        other => {
            tracing::debug!(class = other.class_name(), "no text_encoder_3 slot, skipping T5");
            return Ok(());
        }
    };
    let hub = HubClient::new(cache_dir, options.huggingface_token.as_deref())?;

    let repo = Repo::new(&hub, None, SD3_REPO);

    // drop the old encoder before loading the new one
    pipe.text_encoder_3 = None;
    pipe.text_encoder_3 = load_t5(&hub, &repo, te3, pipe.dtype, &pipe.device)?;
    if pipe.text_encoder_3.is_some() && pipe.tokenizer_3.is_none() {
        pipe.tokenizer_3 = Some(repo.tokenizer("tokenizer_3", T5_TOKENIZER_REPO)?);
    }

    release_memory(&pipe.device, true);
    Ok(())
}

fn load_mmdit(
    checkpoint: &Path,
    config: Option<&Path>,
    dtype: DType,
    device: &Device,
    use_flash_attn: bool,
) -> Result<Mmdit> {
    let source = PrefixedSource::new(SafetensorsSource::open(checkpoint)?, MMDIT_PREFIX);
    let config = match config {
        Some(path) => read_config::<MmditConfig>(&config_file(path))?.to_candle(),
        None => MmditConfig::detect(&source)?,
    };
    tracing::debug!(depth = config.depth, "SD3 MMDiT");
    Ok(Mmdit::load(var_builder(source, dtype, device), config, use_flash_attn)?)
}

/// T5 text encoder for `te3` in the pipeline dtype, or `None` when no T5
/// is wanted.
fn load_t5(
    hub: &HubClient,
    repo: &Repo,
    te3: Te3Variant,
    dtype: DType,
    device: &Device,
) -> Result<Option<T5TextEncoder>> {
    match te3 {
        Te3Variant::Fp16 => Ok(Some(repo.load_t5("text_encoder_3", dtype, device)?)),
        Te3Variant::Fp8 => {
            // fp8 weights are widened on load and kept in the pipeline dtype
            let config: t5::Config = repo.config("text_encoder_3")?;
            let path = hub.get(SD3_SINGLE_FILE_REPO, Some("text_encoders"), T5_FP8_FILE)?;
            let vb = var_builder(SafetensorsSource::open(&path)?, dtype, device);
            Ok(Some(T5TextEncoder::load(vb, config)?))
        }
        Te3Variant::None => Ok(None),
    }
}

fn is_safetensors(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("safetensors"))
}

fn config_file(path: &Path) -> PathBuf {
    if path.is_dir() {
        path.join("config.json")
    } else {
        path.to_path_buf()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::{VarBuilder, VarMap};

    const TINY_T5: &str = r#"{
        "vocab_size": 32, "d_model": 8, "d_kv": 4, "d_ff": 16, "num_layers": 1,
        "num_heads": 2, "relative_attention_num_buckets": 8, "dropout_rate": 0.0,
        "layer_norm_epsilon": 1e-6, "initializer_factor": 1.0,
        "feed_forward_proj": "gated-gelu", "is_encoder_decoder": true,
        "pad_token_id": 0, "eos_token_id": 1
    }"#;

    /// A random tiny T5 saved as `<root>/text_encoder_3`.
    fn tiny_t5(root: &Path) -> T5TextEncoder {
        let dir = root.join("text_encoder_3");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("config.json"), TINY_T5).unwrap();
        let config: t5::Config = serde_json::from_str(TINY_T5).unwrap();
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let encoder = T5TextEncoder::load(vb, config).unwrap();
        varmap.save(dir.join("model.safetensors")).unwrap();
        encoder
    }

    #[test]
    fn test_is_safetensors() {
        assert!(is_safetensors(Path::new("/models/sd3_medium.safetensors")));
        assert!(is_safetensors(Path::new("sd3.SAFETENSORS")));
        assert!(!is_safetensors(Path::new("sd3_medium.gguf")));
        assert!(!is_safetensors(Path::new("safetensors")));
    }

    #[test]
    fn test_config_file() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(config_file(dir.path()), dir.path().join("config.json"));
        let file = dir.path().join("transformer.json");
        assert_eq!(config_file(&file), file);
    }

    #[test]
    fn test_fp16_t5_follows_pipeline_dtype() {
        let dir = tempfile::tempdir().unwrap();
        tiny_t5(dir.path());
        let hub = HubClient::new(None, None).unwrap();
        let repo = Repo::new(&hub, Some(dir.path()), SD3_REPO);
        let t5 = load_t5(&hub, &repo, Te3Variant::Fp16, DType::F32, &Device::Cpu)
            .unwrap()
            .unwrap();
        assert_eq!(t5.dtype, DType::F32);
        assert_eq!(t5.config.d_model, 8);
        assert!(load_t5(&hub, &repo, Te3Variant::None, DType::F32, &Device::Cpu)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_load_te3_drops_t5() {
        let dir = tempfile::tempdir().unwrap();
        let mut sd3 = Sd3Pipeline::empty(Device::Cpu, DType::F32);
        sd3.text_encoder_3 = Some(tiny_t5(dir.path()));
        let mut pipe = Pipeline::Sd3(sd3);

        load_te3(&mut pipe, Te3Variant::None, None, &LoaderOptions::default()).unwrap();
        let Pipeline::Sd3(sd3) = &pipe else {
            panic!("pipeline kind changed");
        };
        assert!(sd3.text_encoder_3.is_none());
        assert_eq!(sd3.dtype, DType::F32);
    }

    #[test]
    fn test_load_te3_skips_other_pipelines() {
        let mut pipe = Pipeline::Flux(crate::pipelines::FluxPipeline::empty(Device::Cpu, DType::F32));
        load_te3(&mut pipe, Te3Variant::Fp16, None, &LoaderOptions::default()).unwrap();
        assert_eq!(pipe.class_name(), "FluxPipeline");
    }
}
