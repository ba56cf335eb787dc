use std::env;
use std::path::Path;

const CUDA_DIRS: [&str; 4] = [
    "/usr/local/cuda",
    "/opt/cuda",
    "C:\\Program Files\\NVIDIA GPU Computing Toolkit\\CUDA",
    "C:\\CUDA",
];

fn main() {
    println!("cargo::rustc-check-cfg=cfg(force_cpu)");
    println!("cargo::rustc-check-cfg=cfg(has_cuda)");
    println!("cargo::rustc-check-cfg=cfg(has_metal)");

    println!("cargo:rerun-if-changed=build.rs");
    for var in ["CANDLE_FORCE_CPU", "CANDLE_CUDA_PATH", "CUDA_ROOT", "CUDA_PATH"] {
        println!("cargo:rerun-if-env-changed={var}");
    }

    if env::var("CANDLE_FORCE_CPU").is_ok() {
        println!("cargo:rustc-cfg=force_cpu");
        println!("cargo:warning=CANDLE_FORCE_CPU is set, loading everything on the CPU");
        return;
    }

    // a backend only counts when its feature is compiled in as well
    if env::var("CARGO_FEATURE_CUDA").is_ok() && detect_cuda() {
        println!("cargo:rustc-cfg=has_cuda");
    }
    let macos = env::var("CARGO_CFG_TARGET_OS").is_ok_and(|os| os == "macos");
    if env::var("CARGO_FEATURE_METAL").is_ok() && macos {
        println!("cargo:rustc-cfg=has_metal");
    }
}

fn detect_cuda() -> bool {
    if ["CANDLE_CUDA_PATH", "CUDA_ROOT", "CUDA_PATH"]
        .iter()
        .any(|var| env::var(var).is_ok())
    {
        return true;
    }
    if CUDA_DIRS.iter().any(|dir| Path::new(dir).exists()) {
        return true;
    }
    env::var_os("PATH").is_some_and(|paths| {
        env::split_paths(&paths).any(|dir| dir.join("nvcc").exists() || dir.join("nvcc.exe").exists())
    })
}
