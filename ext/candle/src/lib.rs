pub mod checkpoint;
pub mod configs;
pub mod convert;
pub mod devices;
pub mod errors;
pub mod hub;
pub mod loaders;
pub mod options;
pub mod pipelines;
pub mod tokenizer;
pub mod unet;
pub mod weights;

#[cfg(feature = "ruby")]
mod ruby;

pub use errors::{LoadError, Result};
pub use options::LoaderOptions;
pub use pipelines::Pipeline;
pub use unet::UnetRegistry;

// Export build configuration for runtime checks
#[cfg(feature = "ruby")]
pub fn get_build_info(ruby: &magnus::Ruby) -> magnus::RHash {
    let hash = ruby.hash_new();

    let _ = hash.aset("default_device", devices::DEFAULT_DEVICE);
    let _ = hash.aset("cuda_available", cfg!(feature = "cuda"));
    let _ = hash.aset("metal_available", cfg!(feature = "metal"));
    let _ = hash.aset("mkl_available", cfg!(feature = "mkl"));
    let _ = hash.aset("accelerate_available", cfg!(feature = "accelerate"));
    let _ = hash.aset("cudnn_available", cfg!(feature = "cudnn"));

    hash
}

#[cfg(feature = "ruby")]
#[magnus::init]
fn init(ruby: &magnus::Ruby) -> ruby::Result<()> {
    use magnus::{function, prelude::*};

    let rb_candle = ruby.define_module("Candle")?;

    rb_candle.define_singleton_method("build_info", function!(get_build_info, 0))?;

    ruby::device::init(rb_candle)?;
    ruby::pipeline::init(rb_candle)?;

    Ok(())
}
