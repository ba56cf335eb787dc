//! Rehydration of optimum-quanto checkpoints.
//!
//! A quanto-serialized module stores its weight as `<module>.weight._data`
//! plus `._scale` (and `._shift` for packed int4/int2). The accompanying
//! `quantization_map.json` says which modules were quantized and to what.
//! Candle has no quanto kernels, so weights are expanded back to dense
//! tensors as they are requested.

use candle_core::{DType, Device, Result as CandleResult, Tensor};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

use super::{StoredDType, TensorSource};
use crate::errors::Result;

/// Per-module entry of a quantization map
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ModuleQuantization {
    pub weights: Option<String>,
    pub activations: Option<String>,
}

/// Weight qtypes that can be expanded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightQType {
    Int8,
    Float8,
    /// Packed ints with `bits` per value, grouped along the first axis
    Packed { bits: u8 },
}

impl WeightQType {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "qint8" => Some(Self::Int8),
            "qfloat8" | "qfloat8_e4m3fn" => Some(Self::Float8),
            "qint4" => Some(Self::Packed { bits: 4 }),
            "qint2" => Some(Self::Packed { bits: 2 }),
            _ => None,
        }
    }
}

/// A parsed `quantization_map.json`. The raw document is kept untouched.
#[derive(Debug, Clone)]
pub struct QuantizationMap {
    modules: BTreeMap<String, ModuleQuantization>,
    raw: serde_json::Value,
}

impl QuantizationMap {
    pub fn from_json_str(text: &str) -> Result<Self> {
        let raw: serde_json::Value = serde_json::from_str(text)?;
        let modules = serde_json::from_value(raw.clone())?;
        Ok(Self { modules, raw })
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn raw(&self) -> &serde_json::Value {
        &self.raw
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn module(&self, name: &str) -> Option<&ModuleQuantization> {
        self.modules.get(name)
    }

    /// Weight qtype of `module`, when it is quantized with a supported type.
    pub fn weight_qtype(&self, module: &str) -> Option<WeightQType> {
        self.modules
            .get(module)
            .and_then(|m| m.weights.as_deref())
            .and_then(WeightQType::parse)
    }

    /// Weight qtype names that appear in the map but cannot be expanded
    pub fn unsupported_qtypes(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .modules
            .values()
            .filter_map(|m| m.weights.clone())
            .filter(|w| w != "none" && WeightQType::parse(w).is_none())
            .collect();
        names.sort();
        names.dedup();
        names
    }
}

/// Serves dense weights from a quanto-serialized source.
pub struct QuantoSource<S> {
    inner: S,
    map: QuantizationMap,
}

impl<S: TensorSource> QuantoSource<S> {
    pub fn new(inner: S, map: QuantizationMap) -> Self {
        Self { inner, map }
    }

    pub fn map(&self) -> &QuantizationMap {
        &self.map
    }

    /// Module and qtype behind a `<module>.weight` request
    fn quantized_weight<'a>(&self, name: &'a str) -> Option<(&'a str, WeightQType)> {
        let module = name.strip_suffix(".weight")?;
        self.map.weight_qtype(module).map(|q| (module, q))
    }

    /// Name of the stored `_data` tensor, which may be nested one level for
    /// packed tensors.
    fn data_name(&self, weight: &str) -> Option<String> {
        [format!("{weight}._data"), format!("{weight}._data._data")]
            .into_iter()
            .find(|n| self.inner.contains(n))
    }

    fn dequantize(&self, weight: &str, qtype: WeightQType, device: &Device) -> CandleResult<Tensor> {
        let data_name = self.data_name(weight).ok_or_else(|| {
            candle_core::Error::Msg(format!("quantized weight {weight} has no _data tensor"))
        })?;
        let scale = self.inner.load(&format!("{weight}._scale"), device)?;
        let out_dtype = scale.dtype();
        let scale = scale.to_dtype(DType::F32)?;

        let dense = match qtype {
            WeightQType::Int8 | WeightQType::Float8 => {
                let data = self.inner.load(&data_name, device)?.to_dtype(DType::F32)?;
                data.broadcast_mul(&reshape_scale(&scale, data.rank())?)?
            }
            WeightQType::Packed { bits } => {
                let packed = self.inner.load(&data_name, device)?;
                let rows = scale.dim(0)?;
                let data = unpack(&packed, bits, rows)?;
                let scale = reshape_scale(&scale, data.rank())?;
                let shift_name = format!("{weight}._shift");
                if self.inner.contains(&shift_name) {
                    let integer_shift = matches!(
                        self.inner.stored_dtype(&shift_name),
                        Some(StoredDType::I8 | StoredDType::U8)
                    );
                    let shift = self.inner.load(&shift_name, device)?.to_dtype(DType::F32)?;
                    let shift = reshape_scale(&shift, data.rank())?;
                    if integer_shift {
                        data.broadcast_sub(&shift)?.broadcast_mul(&scale)?
                    } else {
                        data.broadcast_mul(&scale)?.broadcast_sub(&shift)?
                    }
                } else {
                    data.broadcast_mul(&scale)?
                }
            }
        };
        dense.to_dtype(out_dtype)
    }
}

/// Scales are stored as `(rows, 1)` or `(rows,)`; make them broadcastable.
fn reshape_scale(scale: &Tensor, rank: usize) -> CandleResult<Tensor> {
    if scale.rank() == rank || rank < 2 {
        return Ok(scale.clone());
    }
    let mut dims = vec![scale.elem_count()];
    dims.resize(rank, 1);
    scale.reshape(dims)
}

/// Unpack `bits`-wide values packed along dim 0.
///
/// Row `j` of the packed tensor holds rows `j`, `j + n`, `j + 2n`, ... of the
/// unpacked tensor in increasingly significant bit positions. The result is
/// truncated to `rows` rows.
pub fn unpack(packed: &Tensor, bits: u8, rows: usize) -> CandleResult<Tensor> {
    if !matches!(bits, 2 | 4) {
        candle_core::bail!("cannot unpack {bits}-bit values")
    }
    let dims = packed.dims().to_vec();
    if dims.is_empty() {
        candle_core::bail!("cannot unpack a scalar")
    }
    let packed_rows = dims[0];
    let row_len: usize = dims[1..].iter().product();
    let bytes = packed.flatten_all()?.to_dtype(DType::U8)?.to_vec1::<u8>()?;

    let per_byte = (8 / bits) as usize;
    let mask = (1u8 << bits) - 1;
    let mut values = Vec::with_capacity(bytes.len() * per_byte);
    for slot in 0..per_byte {
        let shift = bits as usize * slot;
        values.extend(bytes.iter().map(|&b| ((b >> shift) & mask) as f32));
    }

    let total_rows = packed_rows * per_byte;
    if rows > total_rows {
        candle_core::bail!("packed tensor holds {total_rows} rows, {rows} requested")
    }
    values.truncate(rows * row_len);
    let mut shape = dims;
    shape[0] = rows;
    Tensor::from_vec(values, shape, packed.device())
}

impl<S: TensorSource> TensorSource for QuantoSource<S> {
    fn contains(&self, name: &str) -> bool {
        match self.quantized_weight(name) {
            Some(_) => self.data_name(name).is_some(),
            None => self.inner.contains(name),
        }
    }

    fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .names()
            .into_iter()
            .filter_map(|n| {
                if let Some(weight) = n.strip_suffix("._data._data") {
                    return Some(weight.to_string());
                }
                if let Some(weight) = n.strip_suffix("._data") {
                    return Some(weight.to_string());
                }
                if n.ends_with("._scale") || n.ends_with("._shift") {
                    return None;
                }
                Some(n)
            })
            .collect();
        names.sort();
        names.dedup();
        names
    }

    fn stored_dtype(&self, name: &str) -> Option<StoredDType> {
        match self.quantized_weight(name) {
            Some(_) => self.inner.stored_dtype(&format!("{name}._scale")),
            None => self.inner.stored_dtype(name),
        }
    }

    fn load(&self, name: &str, device: &Device) -> CandleResult<Tensor> {
        match self.quantized_weight(name) {
            Some((_, qtype)) => self.dequantize(name, qtype, device),
            None => self.inner.load(name, device),
        }
    }

    /// Packed weights come back in their quantization groups.
    fn is_regrouped(&self, name: &str) -> bool {
        matches!(self.quantized_weight(name), Some((_, WeightQType::Packed { .. })))
    }
}
