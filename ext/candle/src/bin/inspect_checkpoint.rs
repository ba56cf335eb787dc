use candle_core::quantized::gguf_file;
use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};

use candle_diffusion::checkpoint::QuantKind;
use candle_diffusion::convert::{FluxLayout, VaeLayout};
use candle_diffusion::errors::{LoadError, Result};
use candle_diffusion::hub::local_safetensors_files;
use candle_diffusion::weights::{group_names, group_of, QuantizationMap, SafetensorsSource, TensorSource};

const SAMPLE: usize = 5;

fn main() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!("Usage: {} <checkpoint file or diffusers directory>", args[0]);
        std::process::exit(1);
    }
    if let Err(e) = inspect(Path::new(&args[1])) {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

fn inspect(path: &Path) -> Result<()> {
    println!("Inspecting: {}", path.display());
    let quant = QuantKind::classify(path);
    println!("Quantization: {quant}");

    if quant == QuantKind::Gguf {
        return inspect_gguf(path);
    }

    let (files, component_dir) = weight_files(path)?;
    let source = SafetensorsSource::open_all(&files)?;
    println!("Files: {}", files.len());
    println!("Total tensors: {}", source.len());

    match FluxLayout::detect(&source) {
        Ok(FluxLayout::Diffusers) => println!("FLUX layout: diffusers"),
        Ok(FluxLayout::Bfl { prefix }) => println!("FLUX layout: BFL (prefix {prefix:?})"),
        Err(_) => println!("FLUX layout: none"),
    }
    match VaeLayout::detect(&source) {
        Some(layout) => println!("VAE layout: {layout:?}"),
        None => println!("VAE layout: none"),
    }

    print_groups(&source);

    if let Some(dir) = component_dir {
        let map_file = dir.join("quantization_map.json");
        if map_file.is_file() {
            let map = QuantizationMap::from_file(&map_file)?;
            println!("\nQuantization map: {} modules", map.len());
            let unsupported = map.unsupported_qtypes();
            if !unsupported.is_empty() {
                println!("  unsupported types: {}", unsupported.join(", "));
            }
        } else {
            println!("\nQuantization map: none");
        }
    }
    Ok(())
}

/// Weight files for `path`, plus the directory a quantization map would
/// sit in.
fn weight_files(path: &Path) -> Result<(Vec<PathBuf>, Option<PathBuf>)> {
    if path.is_file() {
        return Ok((vec![path.to_path_buf()], path.parent().map(Path::to_path_buf)));
    }
    for dir in [path.join("transformer"), path.to_path_buf()] {
        if let Some(files) = local_safetensors_files(&dir)? {
            return Ok((files, Some(dir)));
        }
    }
    Err(LoadError::NotFound(path.to_path_buf()))
}

fn print_groups(source: &SafetensorsSource) {
    let names = source.names();
    println!("\nTensor groups:");
    for (prefix, count) in group_names(&names) {
        println!("\n{prefix}: {count} tensors");
        let mut members: Vec<&String> = names.iter().filter(|n| group_of(n) == prefix).collect();
        members.sort();
        for name in members.iter().take(SAMPLE) {
            let dtype = source.stored_dtype(name).map(|d| format!("{d:?}")).unwrap_or_default();
            let shape = source.shape_of(name).unwrap_or_default();
            println!("  {name} -> {shape:?} {dtype}");
        }
        if members.len() > SAMPLE {
            println!("  ... and {} more", members.len() - SAMPLE);
        }
    }

    let mut dtypes: BTreeMap<String, usize> = BTreeMap::new();
    for name in &names {
        if let Some(dtype) = source.stored_dtype(name) {
            *dtypes.entry(format!("{dtype:?}")).or_insert(0) += 1;
        }
    }
    println!("\nStored dtypes:");
    for (dtype, count) in dtypes {
        println!("  {dtype}: {count}");
    }
}

fn inspect_gguf(path: &Path) -> Result<()> {
    let mut file = std::fs::File::open(path)?;
    let content = gguf_file::Content::read(&mut file)?;
    println!("Total tensors: {}", content.tensor_infos.len());
    let guidance = content.tensor_infos.contains_key("guidance_in.in_layer.weight");
    println!("FLUX guidance embedding: {guidance}");

    let mut dtypes: BTreeMap<String, usize> = BTreeMap::new();
    for info in content.tensor_infos.values() {
        *dtypes.entry(format!("{:?}", info.ggml_dtype)).or_insert(0) += 1;
    }
    println!("\nGGML dtypes:");
    for (dtype, count) in dtypes {
        println!("  {dtype}: {count}");
    }
    Ok(())
}
