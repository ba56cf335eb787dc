use candle_core::{DType, Device, Result as CandleResult, Tensor};
use memmap2::{Mmap, MmapOptions};
use safetensors::SafeTensors;
use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};

use super::fp8::fp8_e4m3_to_f32;
use super::{StoredDType, TensorSource};

#[derive(Debug, Clone)]
struct Entry {
    file: usize,
    dtype: StoredDType,
    shape: Vec<usize>,
    start: usize,
    end: usize,
}

/// Memory-mapped safetensors files, possibly sharded.
///
/// Headers are parsed once up front; tensor bytes are only touched when a
/// tensor is loaded. Storage dtypes candle lacks (fp8, small signed ints)
/// are widened to f32 on load.
pub struct SafetensorsSource {
    paths: Vec<PathBuf>,
    mmaps: Vec<Mmap>,
    entries: HashMap<String, Entry>,
    metadata: HashMap<String, String>,
}

impl std::fmt::Debug for SafetensorsSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SafetensorsSource")
            .field("paths", &self.paths)
            .field("tensors", &self.entries.len())
            .finish()
    }
}

impl SafetensorsSource {
    pub fn open(path: &Path) -> CandleResult<Self> {
        Self::open_all(&[path.to_path_buf()])
    }

    pub fn open_all(paths: &[PathBuf]) -> CandleResult<Self> {
        let mut mmaps = Vec::with_capacity(paths.len());
        let mut entries = HashMap::new();
        let mut metadata = HashMap::new();

        for (idx, path) in paths.iter().enumerate() {
            let file = File::open(path).map_err(|e| {
                candle_core::Error::Msg(format!("Failed to open {}: {}", path.display(), e))
            })?;
            // Safety: the checkpoint files are treated as read-only for the
            // lifetime of the source.
            let mmap = unsafe { MmapOptions::new().map(&file)? };

            let (header_len, header) = SafeTensors::read_metadata(&mmap).map_err(|e| {
                candle_core::Error::Msg(format!(
                    "Failed to read safetensors header of {}: {}",
                    path.display(),
                    e
                ))
            })?;
            let data_start = 8 + header_len;

            for (name, info) in header.tensors() {
                let (start, end) = info.data_offsets;
                entries.insert(
                    name,
                    Entry {
                        file: idx,
                        dtype: info.dtype,
                        shape: info.shape.clone(),
                        start: data_start + start,
                        end: data_start + end,
                    },
                );
            }
            if let Some(meta) = header.metadata() {
                metadata.extend(meta.clone());
            }
            mmaps.push(mmap);
        }

        Ok(Self {
            paths: paths.to_vec(),
            mmaps,
            entries,
            metadata,
        })
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// `__metadata__` entries of all files, merged
    pub fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }

    pub fn shape_of(&self, name: &str) -> Option<&[usize]> {
        self.entries.get(name).map(|e| e.shape.as_slice())
    }

    /// Raw stored bytes of `name`
    pub fn raw(&self, name: &str) -> CandleResult<&[u8]> {
        let entry = self.entry(name)?;
        Ok(&self.mmaps[entry.file][entry.start..entry.end])
    }

    fn entry(&self, name: &str) -> CandleResult<&Entry> {
        self.entries
            .get(name)
            .ok_or_else(|| candle_core::Error::CannotFindTensor { path: name.to_string() }.bt())
    }
}

impl TensorSource for SafetensorsSource {
    fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.keys().cloned().collect();
        names.sort();
        names
    }

    fn stored_dtype(&self, name: &str) -> Option<StoredDType> {
        self.entries.get(name).map(|e| e.dtype)
    }

    fn load(&self, name: &str, device: &Device) -> CandleResult<Tensor> {
        let entry = self.entry(name)?;
        let data = &self.mmaps[entry.file][entry.start..entry.end];
        decode(name, data, entry.dtype, &entry.shape, device)
    }
}

/// Decode raw little-endian tensor bytes into a candle tensor.
pub fn decode(
    name: &str,
    data: &[u8],
    dtype: StoredDType,
    shape: &[usize],
    device: &Device,
) -> CandleResult<Tensor> {
    let native = |dtype: DType| Tensor::from_raw_buffer(data, dtype, shape, device);
    match dtype {
        StoredDType::U8 | StoredDType::BOOL => native(DType::U8),
        StoredDType::U32 => native(DType::U32),
        StoredDType::I64 => native(DType::I64),
        StoredDType::F16 => native(DType::F16),
        StoredDType::BF16 => native(DType::BF16),
        StoredDType::F32 => native(DType::F32),
        StoredDType::F64 => native(DType::F64),
        StoredDType::I8 => {
            let values: Vec<f32> = data.iter().map(|&b| b as i8 as f32).collect();
            Tensor::from_vec(values, shape, device)
        }
        StoredDType::I16 => {
            let values: Vec<f32> = data
                .chunks_exact(2)
                .map(|c| i16::from_le_bytes([c[0], c[1]]) as f32)
                .collect();
            Tensor::from_vec(values, shape, device)
        }
        StoredDType::I32 => {
            let values: Vec<f32> = data
                .chunks_exact(4)
                .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]) as f32)
                .collect();
            Tensor::from_vec(values, shape, device)
        }
        StoredDType::F8_E4M3 => Tensor::from_vec(fp8_e4m3_to_f32(data), shape, device),
        other => candle_core::bail!("tensor {name} has unsupported storage dtype {other:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use safetensors::tensor::TensorView;

    #[test]
    fn test_decode_int8_and_fp8() {
        let bytes = [0xFFu8, 0x01, 0x80, 0x7F];
        let t = decode("w", &bytes, StoredDType::I8, &[2, 2], &Device::Cpu).unwrap();
        assert_eq!(t.dtype(), DType::F32);
        assert_eq!(
            t.flatten_all().unwrap().to_vec1::<f32>().unwrap(),
            vec![-1.0, 1.0, -128.0, 127.0]
        );

        let t = decode("w", &[0x38, 0xC0], StoredDType::F8_E4M3, &[2], &Device::Cpu).unwrap();
        assert_eq!(t.to_vec1::<f32>().unwrap(), vec![1.0, -2.0]);
    }

    #[test]
    fn test_open_sharded_files() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.safetensors");
        let b = dir.path().join("b.safetensors");

        let floats: Vec<u8> = [1.5f32, -2.0].iter().flat_map(|v| v.to_le_bytes()).collect();
        let view = TensorView::new(StoredDType::F32, vec![2], &floats).unwrap();
        safetensors::serialize_to_file([("x.weight", view)], &None, &a).unwrap();

        let ints = [3u8, 0xFD];
        let view = TensorView::new(StoredDType::I8, vec![1, 2], &ints).unwrap();
        safetensors::serialize_to_file([("y.weight", view)], &None, &b).unwrap();

        let source = SafetensorsSource::open_all(&[a, b]).unwrap();
        assert_eq!(source.names(), vec!["x.weight", "y.weight"]);
        assert_eq!(source.stored_dtype("y.weight"), Some(StoredDType::I8));
        assert_eq!(source.reference_dtype("x.weight"), Some(DType::F32));
        assert_eq!(source.reference_dtype("y.weight"), None);

        let x = source.load("x.weight", &Device::Cpu).unwrap();
        assert_eq!(x.to_vec1::<f32>().unwrap(), vec![1.5, -2.0]);
        let y = source.load("y.weight", &Device::Cpu).unwrap();
        assert_eq!(y.dims(), &[1, 2]);
        assert_eq!(y.flatten_all().unwrap().to_vec1::<f32>().unwrap(), vec![3.0, -3.0]);
        assert!(source.load("z.weight", &Device::Cpu).is_err());
    }
}
