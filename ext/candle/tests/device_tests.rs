use candle_core::{DType, Device as CoreDevice};

use candle_diffusion::devices::{
    available_devices, compute_device, offload_device, parse_dtype, release_memory, resolve_device,
    DEFAULT_DEVICE,
};
use candle_diffusion::options::{LoaderOptions, OffloadMode};

#[test]
fn test_cpu_always_resolves() {
    let cpu = resolve_device("CPU").unwrap();
    assert!(matches!(cpu, CoreDevice::Cpu));
    assert!(available_devices().contains(&"cpu"));
    if cfg!(not(any(feature = "cuda", feature = "metal"))) {
        assert_eq!(DEFAULT_DEVICE, "cpu");
    }
}

#[cfg(feature = "cuda")]
#[test]
#[ignore = "requires CUDA hardware"]
fn test_cuda_device_creation() {
    match resolve_device("cuda:0") {
        Ok(device) => assert!(matches!(device, CoreDevice::Cuda(_))),
        Err(_) => println!("No CUDA device available for testing"),
    }
}

#[cfg(feature = "metal")]
#[test]
#[ignore = "requires Metal hardware"]
fn test_metal_device_creation() {
    match resolve_device("metal") {
        Ok(device) => assert!(matches!(device, CoreDevice::Metal(_))),
        Err(_) => println!("No Metal device available for testing"),
    }
}

#[test]
fn test_offload_modes() {
    let mut opts = LoaderOptions {
        device: "cpu".to_string(),
        ..Default::default()
    };
    for mode in [OffloadMode::None, OffloadMode::Model, OffloadMode::Sequential] {
        opts.diffusers_offload_mode = mode;
        assert!(offload_device(&opts).unwrap().is_cpu());
    }
    assert!(compute_device(&opts).unwrap().is_cpu());

    opts.device = "vulkan".to_string();
    assert!(compute_device(&opts).is_err());
}

#[test]
fn test_default_dtypes_parse() {
    let opts = LoaderOptions::default();
    assert_eq!(parse_dtype(&opts.dtype).unwrap(), DType::F16);
    assert_eq!(parse_dtype(&opts.dtype_unet).unwrap(), DType::F16);
}

#[test]
fn test_release_memory_is_best_effort() {
    release_memory(&CoreDevice::Cpu, false);
    release_memory(&CoreDevice::Cpu, true);
}
