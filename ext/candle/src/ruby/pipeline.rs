use magnus::{function, method, prelude::*, Error, RHash, RModule, Ruby, TryConvert, Value};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use crate::checkpoint::{CheckpointInfo, Te3Variant};
use crate::hub::HubClient;
use crate::loaders;
use crate::options::{LoaderOptions, OffloadMode};
use crate::pipelines::{Pipeline, ThreadSafePipeline};
use crate::ruby::errors::wrap_load_err;
use crate::ruby::{Device as RbDevice, Result as RbResult};
use crate::unet::UnetRegistry;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn kwarg<T: TryConvert>(kwargs: Option<&RHash>, key: &str) -> Option<T> {
    kwargs
        .and_then(|h| h.get(magnus::Symbol::new(key)))
        .and_then(|v| T::try_convert(v).ok())
}

/// Split `args` into positional values and a trailing keyword hash.
fn split_kwargs(args: &[Value]) -> (&[Value], Option<RHash>) {
    match args.last().and_then(|v| RHash::try_convert(*v).ok()) {
        Some(kwargs) => (&args[..args.len() - 1], Some(kwargs)),
        None => (args, None),
    }
}

/// Loader options from keyword arguments. `options_file:` names a TOML file
/// read first; the environment is applied before explicit keywords.
fn loader_options(kwargs: Option<&RHash>) -> RbResult<LoaderOptions> {
    let options = match kwarg::<String>(kwargs, "options_file") {
        Some(path) => LoaderOptions::from_toml_file(Path::new(&path)).map_err(wrap_load_err)?,
        None => LoaderOptions::default(),
    };
    let mut options = options.apply_env();

    if let Some(device) = kwarg::<RbDevice>(kwargs, "device") {
        options.device = device.name().to_string();
    }
    if let Some(dtype) = kwarg::<String>(kwargs, "dtype") {
        options.dtype = dtype;
    }
    if let Some(dtype) = kwarg::<String>(kwargs, "dtype_unet") {
        options.dtype_unet = dtype;
    }
    if let Some(name) = kwarg::<String>(kwargs, "sd_unet") {
        options.sd_unet = name;
    }
    if let Some(dir) = kwarg::<String>(kwargs, "unet_dir") {
        options.unet_dir = PathBuf::from(dir);
    }
    if let Some(dir) = kwarg::<String>(kwargs, "diffusers_dir") {
        options.diffusers_dir = PathBuf::from(dir);
    }
    if let Some(dir) = kwarg::<String>(kwargs, "hfcache_dir") {
        options.hfcache_dir = Some(PathBuf::from(dir));
    }
    if let Some(token) = kwarg::<String>(kwargs, "huggingface_token") {
        options.huggingface_token = Some(token);
    }
    if let Some(flag) = kwarg::<bool>(kwargs, "no_half_vae") {
        options.no_half_vae = flag;
    }
    if let Some(flag) = kwarg::<bool>(kwargs, "use_flash_attn") {
        options.use_flash_attn = flag;
    }
    if let Some(flag) = kwarg::<bool>(kwargs, "debug") {
        options.debug = flag;
    }
    if let Some(mode) = kwarg::<String>(kwargs, "offload") {
        options.diffusers_offload_mode = match mode.as_str() {
            "none" => OffloadMode::None,
            "model" => OffloadMode::Model,
            "sequential" => OffloadMode::Sequential,
            other => {
                return Err(Error::new(
                    magnus::exception::arg_error(),
                    format!("unknown offload mode '{other}'"),
                ))
            }
        };
    }
    Ok(options)
}

fn diffusers_hub(options: &LoaderOptions) -> RbResult<HubClient> {
    HubClient::for_diffusers(options).map_err(wrap_load_err)
}

fn checkpoint_args(args: &[Value]) -> RbResult<(CheckpointInfo, LoaderOptions)> {
    let (positional, kwargs) = split_kwargs(args);
    let name: String = match positional.first() {
        Some(v) => TryConvert::try_convert(*v)?,
        None => {
            return Err(Error::new(
                magnus::exception::arg_error(),
                "expected a checkpoint name",
            ))
        }
    };
    let path = match positional.get(1) {
        Some(v) => <String as TryConvert>::try_convert(*v)?,
        None => name.clone(),
    };
    let options = loader_options(kwargs.as_ref())?;
    Ok((CheckpointInfo::new(name, path), options))
}

#[magnus::wrap(class = "Candle::DiffusionPipeline", free_immediately)]
pub struct DiffusionPipeline {
    inner: ThreadSafePipeline,
    options: Mutex<LoaderOptions>,
}

impl DiffusionPipeline {
    fn new(pipeline: Pipeline, options: LoaderOptions) -> Self {
        Self {
            inner: ThreadSafePipeline::new(pipeline),
            options: Mutex::new(options),
        }
    }

    /// `DiffusionPipeline.load_flux(name, path = name, **options)`
    pub fn load_flux(args: &[Value]) -> RbResult<Self> {
        let (checkpoint, mut options) = checkpoint_args(args)?;
        let hub = diffusers_hub(&options)?;
        let pipe = loaders::load_flux(&checkpoint, &mut options, &hub).map_err(wrap_load_err)?;
        Ok(Self::new(Pipeline::Flux(pipe), options))
    }

    /// `DiffusionPipeline.load_stable_diffusion(name, path = name, **options)`
    pub fn load_stable_diffusion(args: &[Value]) -> RbResult<Self> {
        let (checkpoint, options) = checkpoint_args(args)?;
        let hub = diffusers_hub(&options)?;
        let pipe = loaders::load_stable_diffusion(&checkpoint, &options, &hub).map_err(wrap_load_err)?;
        Ok(Self::new(Pipeline::StableDiffusion(pipe), options))
    }

    /// `DiffusionPipeline.load_sd3(te3: nil, file: nil, cache_dir: nil, config: nil, **options)`
    pub fn load_sd3(args: &[Value]) -> RbResult<Self> {
        let (_, kwargs) = split_kwargs(args);
        let kwargs = kwargs.as_ref();
        let options = loader_options(kwargs)?;
        let te3 = Te3Variant::parse(kwarg::<String>(kwargs, "te3").as_deref());
        let file = kwarg::<String>(kwargs, "file").map(PathBuf::from);
        let cache_dir = kwarg::<String>(kwargs, "cache_dir").map(PathBuf::from);
        let config = kwarg::<String>(kwargs, "config").map(PathBuf::from);

        let pipe = loaders::load_sd3(
            te3,
            file.as_deref(),
            cache_dir.as_deref().or(options.hfcache_dir.as_deref()),
            config.as_deref(),
            &options,
        )
        .map_err(wrap_load_err)?;
        Ok(Self::new(Pipeline::Sd3(pipe), options))
    }

    /// Swap the T5 encoder; a no-op for pipelines without one.
    pub fn load_te3(&self, te3: Option<String>) -> RbResult<()> {
        let options = lock(&self.options).clone();
        let te3 = Te3Variant::parse(te3.as_deref());
        let mut pipe = self.inner.lock();
        loaders::load_te3(&mut pipe, te3, options.hfcache_dir.as_deref(), &options).map_err(wrap_load_err)
    }

    pub fn class_name(&self) -> &'static str {
        self.inner.lock().class_name()
    }

    /// `{ "transformer" => true, "vae" => false, ... }`
    pub fn components(ruby: &Ruby, rb_self: &Self) -> RbResult<RHash> {
        let hash = ruby.hash_new();
        for (name, loaded) in rb_self.inner.lock().components() {
            hash.aset(name, loaded)?;
        }
        Ok(hash)
    }

    pub fn device(&self) -> RbDevice {
        RbDevice::from_device(self.inner.lock().device())
    }

    pub fn dtype(&self) -> &'static str {
        self.inner.lock().dtype().as_str()
    }

    pub fn inspect(&self) -> String {
        self.inner.lock().describe()
    }
}

#[magnus::wrap(class = "Candle::UnetRegistry", free_immediately)]
pub struct RbUnetRegistry(Mutex<UnetRegistry>);

impl RbUnetRegistry {
    /// `UnetRegistry.new(dir)`; a nil `dir` scans the configured `unet_dir`.
    pub fn new(dir: Option<String>) -> Self {
        let registry = match dir {
            Some(dir) => UnetRegistry::new(dir),
            None => UnetRegistry::from_options(&LoaderOptions::default().apply_env()),
        };
        Self(Mutex::new(registry))
    }

    pub fn refresh(&self) -> usize {
        lock(&self.0).refresh()
    }

    pub fn names(&self) -> Vec<String> {
        lock(&self.0).names().into_iter().map(str::to_string).collect()
    }

    pub fn get(&self, name: String) -> Option<String> {
        lock(&self.0).get(&name).map(|p| p.display().to_string())
    }

    /// Swap `name` into `pipeline`. Failures are logged and return false.
    pub fn load_unet(&self, pipeline: &DiffusionPipeline, name: String) -> bool {
        let mut options = lock(&pipeline.options).clone();
        options.sd_unet = name;
        let mut pipe = pipeline.inner.lock();
        lock(&self.0).load_unet(&mut pipe, &options)
    }
}

pub fn init(rb_candle: RModule) -> RbResult<()> {
    let rb_pipeline = rb_candle.define_class("DiffusionPipeline", magnus::class::object())?;
    rb_pipeline.define_singleton_method("load_flux", function!(DiffusionPipeline::load_flux, -1))?;
    rb_pipeline.define_singleton_method("load_sd3", function!(DiffusionPipeline::load_sd3, -1))?;
    rb_pipeline.define_singleton_method(
        "load_stable_diffusion",
        function!(DiffusionPipeline::load_stable_diffusion, -1),
    )?;
    rb_pipeline.define_method("load_te3", method!(DiffusionPipeline::load_te3, 1))?;
    rb_pipeline.define_method("class_name", method!(DiffusionPipeline::class_name, 0))?;
    rb_pipeline.define_method("components", method!(DiffusionPipeline::components, 0))?;
    rb_pipeline.define_method("device", method!(DiffusionPipeline::device, 0))?;
    rb_pipeline.define_method("dtype", method!(DiffusionPipeline::dtype, 0))?;
    rb_pipeline.define_method("inspect", method!(DiffusionPipeline::inspect, 0))?;

    let rb_registry = rb_candle.define_class("UnetRegistry", magnus::class::object())?;
    rb_registry.define_singleton_method("new", function!(RbUnetRegistry::new, 1))?;
    rb_registry.define_method("refresh", method!(RbUnetRegistry::refresh, 0))?;
    rb_registry.define_method("names", method!(RbUnetRegistry::names, 0))?;
    rb_registry.define_method("[]", method!(RbUnetRegistry::get, 1))?;
    rb_registry.define_method("load_unet", method!(RbUnetRegistry::load_unet, 2))?;
    Ok(())
}
