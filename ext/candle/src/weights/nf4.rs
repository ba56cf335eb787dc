//! Rehydration of bitsandbytes 4-bit (nf4/fp4) checkpoints.

use candle_core::{DType, Device, Result as CandleResult, Tensor};
use serde::Deserialize;

use super::{StoredDType, TensorSource};

const QUANT_STATE_KEYS: [&str; 2] = [
    "quant_state.bitsandbytes__nf4",
    "quant_state.bitsandbytes__fp4",
];
const COMPANIONS: [&str; 4] = ["absmax", "quant_map", "nested_absmax", "nested_quant_map"];

/// The JSON blob bitsandbytes stores next to each packed weight
#[derive(Debug, Clone, Deserialize)]
pub struct QuantState {
    pub quant_type: String,
    pub blocksize: usize,
    pub dtype: String,
    pub shape: Vec<usize>,
    #[serde(default)]
    pub nested_blocksize: Option<usize>,
    #[serde(default)]
    pub nested_offset: Option<f32>,
}

impl QuantState {
    /// Parse a quant state blob, rejecting empty blocks.
    pub fn from_json(bytes: &[u8]) -> Result<Self, String> {
        let state: Self = serde_json::from_slice(bytes).map_err(|e| e.to_string())?;
        if state.blocksize == 0 {
            return Err("blocksize is 0".to_string());
        }
        if state.nested_blocksize == Some(0) {
            return Err("nested_blocksize is 0".to_string());
        }
        Ok(state)
    }

    pub fn dtype(&self) -> DType {
        match self.dtype.trim_start_matches("torch.") {
            "bfloat16" => DType::BF16,
            "float16" => DType::F16,
            _ => DType::F32,
        }
    }
}

/// Serves dense weights from a bitsandbytes 4-bit source.
pub struct Nf4Source<S> {
    inner: S,
}

impl<S: TensorSource> Nf4Source<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }

    /// Whether any tensor in the source carries a 4-bit quant state
    pub fn has_quant_state(&self) -> bool {
        self.inner
            .names()
            .iter()
            .any(|n| QUANT_STATE_KEYS.iter().any(|k| n.ends_with(k)))
    }

    fn quant_state_name(&self, weight: &str) -> Option<String> {
        QUANT_STATE_KEYS
            .iter()
            .map(|k| format!("{weight}.{k}"))
            .find(|n| self.inner.contains(n))
    }

    pub fn quant_state(&self, weight: &str) -> CandleResult<Option<QuantState>> {
        let Some(name) = self.quant_state_name(weight) else {
            return Ok(None);
        };
        let bytes = self
            .inner
            .load(&name, &Device::Cpu)?
            .flatten_all()?
            .to_dtype(DType::U8)?
            .to_vec1::<u8>()?;
        let state = QuantState::from_json(&bytes)
            .map_err(|e| candle_core::Error::Msg(format!("invalid quant state for {weight}: {e}")))?;
        Ok(Some(state))
    }

    fn f32_vec(&self, name: &str) -> CandleResult<Vec<f32>> {
        self.inner
            .load(name, &Device::Cpu)?
            .flatten_all()?
            .to_dtype(DType::F32)?
            .to_vec1::<f32>()
    }

    /// Per-block absmax, expanding the nested (double) quantization if present.
    fn absmax(&self, weight: &str, state: &QuantState) -> CandleResult<Vec<f32>> {
        let absmax_name = format!("{weight}.absmax");
        let nested_name = format!("{weight}.nested_absmax");
        if !self.inner.contains(&nested_name) {
            return self.f32_vec(&absmax_name);
        }

        let codes = self.f32_vec(&absmax_name)?;
        let nested_absmax = self.f32_vec(&nested_name)?;
        let nested_map = self.f32_vec(&format!("{weight}.nested_quant_map"))?;
        let block = state.nested_blocksize.unwrap_or(256);
        let offset = state.nested_offset.unwrap_or(0.0);
        codes
            .iter()
            .enumerate()
            .map(|(i, &code)| {
                let code = code as usize;
                let scale = nested_absmax.get(i / block).copied();
                match (nested_map.get(code), scale) {
                    (Some(v), Some(s)) => Ok(v * s + offset),
                    _ => candle_core::bail!("nested absmax of {weight} is out of range at {i}"),
                }
            })
            .collect()
    }

    fn dequantize(&self, weight: &str, state: &QuantState, device: &Device) -> CandleResult<Tensor> {
        let packed = self
            .inner
            .load(weight, &Device::Cpu)?
            .flatten_all()?
            .to_dtype(DType::U8)?
            .to_vec1::<u8>()?;
        let code = self.f32_vec(&format!("{weight}.quant_map"))?;
        if code.len() < 16 {
            candle_core::bail!("quant map of {weight} has {} entries, expected 16", code.len())
        }
        let absmax = self.absmax(weight, state)?;
        let numel: usize = state.shape.iter().product();
        if packed.len() * 2 < numel {
            candle_core::bail!("{weight} holds {} values, shape needs {numel}", packed.len() * 2)
        }
        if absmax.len() * state.blocksize < numel {
            candle_core::bail!("{weight} has too few absmax blocks for its shape")
        }

        let mut values = Vec::with_capacity(numel);
        for (i, byte) in packed.iter().enumerate() {
            // first value lives in the high nibble
            for (j, nibble) in [byte >> 4, byte & 0x0F].into_iter().enumerate() {
                let idx = i * 2 + j;
                if idx >= numel {
                    break;
                }
                values.push(code[nibble as usize] * absmax[idx / state.blocksize]);
            }
        }
        Tensor::from_vec(values, state.shape.as_slice(), device)?.to_dtype(state.dtype())
    }

    fn is_companion(name: &str) -> bool {
        COMPANIONS
            .iter()
            .chain(QUANT_STATE_KEYS.iter())
            .any(|c| name.ends_with(&format!(".weight.{c}")))
    }
}

impl<S: TensorSource> TensorSource for Nf4Source<S> {
    fn contains(&self, name: &str) -> bool {
        self.inner.contains(name)
    }

    fn names(&self) -> Vec<String> {
        self.inner
            .names()
            .into_iter()
            .filter(|n| !Self::is_companion(n))
            .collect()
    }

    fn stored_dtype(&self, name: &str) -> Option<StoredDType> {
        match self.quant_state(name) {
            Ok(Some(state)) => Some(match state.dtype() {
                DType::BF16 => StoredDType::BF16,
                DType::F16 => StoredDType::F16,
                _ => StoredDType::F32,
            }),
            _ => self.inner.stored_dtype(name),
        }
    }

    fn load(&self, name: &str, device: &Device) -> CandleResult<Tensor> {
        match self.quant_state(name)? {
            Some(state) => self.dequantize(name, &state, device),
            None => self.inner.load(name, device),
        }
    }

    fn is_regrouped(&self, name: &str) -> bool {
        self.inner.is_regrouped(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::weights::test_util::MapSource;
    use std::collections::HashMap;

    fn bytes_tensor(bytes: &[u8]) -> Tensor {
        Tensor::from_vec(bytes.to_vec(), bytes.len(), &Device::Cpu).unwrap()
    }

    fn code() -> Tensor {
        // code[i] = i / 8 - 1, enough to check nibble routing
        let values: Vec<f32> = (0..16).map(|i| i as f32 / 8.0 - 1.0).collect();
        Tensor::from_vec(values, 16, &Device::Cpu).unwrap()
    }

    #[test]
    fn test_dequantize_blocks() {
        let state = br#"{"quant_type": "nf4", "blocksize": 2, "dtype": "float32", "shape": [2, 2]}"#;
        let inner = MapSource(HashMap::from([
            // nibbles 8, 15 | 0, 4
            ("lin.weight".to_string(), bytes_tensor(&[0x8F, 0x04])),
            ("lin.weight.absmax".to_string(), Tensor::new(&[1f32, 2.0], &Device::Cpu).unwrap()),
            ("lin.weight.quant_map".to_string(), code()),
            ("lin.weight.quant_state.bitsandbytes__nf4".to_string(), bytes_tensor(state)),
            ("lin.bias".to_string(), Tensor::new(&[0.5f32, 0.5], &Device::Cpu).unwrap()),
        ]));
        let source = Nf4Source::new(inner);
        assert!(source.has_quant_state());
        assert_eq!(source.names(), vec!["lin.bias", "lin.weight"]);
        assert_eq!(source.stored_dtype("lin.weight"), Some(StoredDType::F32));

        let w = source.load("lin.weight", &Device::Cpu).unwrap();
        assert_eq!(w.dims(), &[2, 2]);
        // block 0: (8/8-1, 15/8-1) * 1 ; block 1: (0/8-1, 4/8-1) * 2
        assert_eq!(w.to_vec2::<f32>().unwrap(), vec![vec![0.0, 0.875], vec![-2.0, -1.0]]);
        let b = source.load("lin.bias", &Device::Cpu).unwrap();
        assert_eq!(b.to_vec1::<f32>().unwrap(), vec![0.5, 0.5]);
    }

    #[test]
    fn test_zero_blocksize_is_rejected() {
        let nested = br#"{"quant_type": "nf4", "blocksize": 2, "dtype": "float32",
            "shape": [4], "nested_blocksize": 0}"#;
        let inner = MapSource(HashMap::from([
            ("w.weight".to_string(), bytes_tensor(&[0xFF, 0xFF])),
            ("w.weight.absmax".to_string(), bytes_tensor(&[1, 3])),
            ("w.weight.nested_absmax".to_string(), Tensor::new(&[0.5f32], &Device::Cpu).unwrap()),
            ("w.weight.nested_quant_map".to_string(), code()),
            ("w.weight.quant_map".to_string(), code()),
            ("w.weight.quant_state.bitsandbytes__nf4".to_string(), bytes_tensor(nested)),
        ]));
        let err = Nf4Source::new(inner).load("w.weight", &Device::Cpu).unwrap_err();
        assert!(err.to_string().contains("nested_blocksize is 0"), "{err}");

        let flat = br#"{"quant_type": "nf4", "blocksize": 0, "dtype": "float32", "shape": [4]}"#;
        assert_eq!(QuantState::from_json(flat).unwrap_err(), "blocksize is 0");
    }

    #[test]
    fn test_nested_absmax() {
        let state = br#"{"quant_type": "nf4", "blocksize": 2, "dtype": "bfloat16",
            "shape": [4], "nested_blocksize": 2, "nested_offset": 0.5}"#;
        let nested_map: Vec<f32> = (0..256).map(|i| i as f32).collect();
        let inner = MapSource(HashMap::from([
            ("w.weight".to_string(), bytes_tensor(&[0xFF, 0xFF])),
            ("w.weight.absmax".to_string(), bytes_tensor(&[1, 3])),
            ("w.weight.nested_absmax".to_string(), Tensor::new(&[0.5f32], &Device::Cpu).unwrap()),
            (
                "w.weight.nested_quant_map".to_string(),
                Tensor::from_vec(nested_map, 256, &Device::Cpu).unwrap(),
            ),
            ("w.weight.quant_map".to_string(), code()),
            ("w.weight.quant_state.bitsandbytes__nf4".to_string(), bytes_tensor(state)),
        ]));
        let source = Nf4Source::new(inner);
        let w = source.load("w.weight", &Device::Cpu).unwrap();
        assert_eq!(w.dtype(), DType::BF16);
        // absmax = code * 0.5 + 0.5 -> [1.0, 2.0]; nibble 15 -> 0.875
        let w = w.to_dtype(DType::F32).unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(w, vec![0.875, 0.875, 1.75, 1.75]);
    }
}
