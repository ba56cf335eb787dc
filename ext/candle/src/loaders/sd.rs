use candle_core::DType;

use super::Repo;
use crate::checkpoint::CheckpointInfo;
use crate::configs::{UNetConfig, VaeConfig};
use crate::devices::{offload_device, parse_dtype, release_memory};
use crate::errors::Result;
use crate::hub::HubClient;
use crate::options::LoaderOptions;
use crate::pipelines::{SdPipeline, Unet};
use crate::tokenizer::{CLIP_G_TOKENIZER_REPO, CLIP_L_TOKENIZER_REPO};
use crate::weights::var_builder;

/// Load a UNet-based Stable Diffusion pipeline from a diffusers-layout
/// directory or hub repository.
///
/// The UNet is loaded in `dtype_unet`, everything else in `dtype`. A
/// `text_encoder_2/` folder marks an SDXL repository and is loaded with its
/// tokenizer.
pub fn load_stable_diffusion(
    checkpoint: &CheckpointInfo,
    options: &LoaderOptions,
    hub: &HubClient,
) -> Result<SdPipeline> {
    let device = offload_device(options)?;
    let dtype = parse_dtype(&options.dtype)?;
    let unet_dtype = parse_dtype(&options.dtype_unet)?;
    let local = checkpoint.is_local_dir().then_some(checkpoint.path.as_path());
    let repo = Repo::new(hub, local, checkpoint.repo_id());
    tracing::debug!(model = %checkpoint.name, ?dtype, ?unet_dtype, "Loading Stable Diffusion");

    let mut pipe = SdPipeline::empty(device.clone(), dtype);

    let unet_config: UNetConfig = repo.config_or_default("unet");
    let vb = var_builder(repo.weights("unet")?, unet_dtype, &device);
    pipe.unet = Some(Unet::load(vb, unet_config, options.use_flash_attn)?);

    let vae_dtype = if options.no_half_vae { DType::F32 } else { dtype };
    pipe.vae = Some(repo.load_vae(VaeConfig::default(), vae_dtype, &device)?);
    pipe.text_encoder = Some(repo.load_clip("text_encoder", dtype, &device)?);
    pipe.tokenizer = Some(repo.tokenizer("tokenizer", CLIP_L_TOKENIZER_REPO)?);

    if repo.has("text_encoder_2", "config.json") {
        tracing::debug!(model = %checkpoint.name, "second text encoder present, loading as SDXL");
        pipe.text_encoder_2 = Some(repo.load_clip("text_encoder_2", dtype, &device)?);
        pipe.tokenizer_2 = Some(repo.tokenizer("tokenizer_2", CLIP_G_TOKENIZER_REPO)?);
    }
    pipe.scheduler = repo.scheduler();

    release_memory(&device, false);
    Ok(pipe)
}
