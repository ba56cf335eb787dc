//! Tensor sources feeding candle `VarBuilder`s.
//!
//! Checkpoints come in several storage layouts (plain safetensors, fp8,
//! optimum-quanto packed ints, bitsandbytes nf4). Each layout is exposed as a
//! [`TensorSource`] that hands out dense tensors by name, and
//! [`SourceBackend`] turns any source into a `VarBuilder` so candle's model
//! constructors can pull weights from it lazily.

use candle_core::{DType, Device, Result as CandleResult, Shape, Tensor};
use candle_nn::var_builder::SimpleBackend;
use candle_nn::VarBuilder;
use std::collections::BTreeMap;

pub mod fp8;
pub mod mmaped;
pub mod nf4;
pub mod quanto;

pub use self::nf4::Nf4Source;
pub use self::quanto::{QuantizationMap, QuantoSource};
pub use self::mmaped::SafetensorsSource;

/// Storage dtype as recorded in a checkpoint header.
pub use ::safetensors::Dtype as StoredDType;

/// A named collection of tensors that can be materialized on a device.
pub trait TensorSource: Send + Sync {
    /// Whether `name` can be served by this source
    fn contains(&self, name: &str) -> bool;

    /// Every servable tensor name
    fn names(&self) -> Vec<String>;

    /// Dtype the tensor is stored with, before any conversion
    fn stored_dtype(&self, name: &str) -> Option<StoredDType>;

    /// Materialize `name` on `device`
    fn load(&self, name: &str, device: &Device) -> CandleResult<Tensor>;

    /// Candle dtype matching the stored dtype of `name`, if any
    fn reference_dtype(&self, name: &str) -> Option<DType> {
        self.stored_dtype(name).and_then(candle_dtype)
    }

    /// Whether `name` is served in its storage grouping rather than its
    /// module shape. Only such tensors may be reshaped on request.
    fn is_regrouped(&self, _name: &str) -> bool {
        false
    }
}

impl<T: TensorSource + ?Sized> TensorSource for Box<T> {
    fn contains(&self, name: &str) -> bool {
        (**self).contains(name)
    }

    fn names(&self) -> Vec<String> {
        (**self).names()
    }

    fn stored_dtype(&self, name: &str) -> Option<StoredDType> {
        (**self).stored_dtype(name)
    }

    fn load(&self, name: &str, device: &Device) -> CandleResult<Tensor> {
        (**self).load(name, device)
    }

    fn is_regrouped(&self, name: &str) -> bool {
        (**self).is_regrouped(name)
    }
}

/// Candle dtype for a stored dtype, when candle has a native equivalent.
pub fn candle_dtype(dtype: StoredDType) -> Option<DType> {
    match dtype {
        StoredDType::U8 => Some(DType::U8),
        StoredDType::U32 => Some(DType::U32),
        StoredDType::I64 => Some(DType::I64),
        StoredDType::F16 => Some(DType::F16),
        StoredDType::BF16 => Some(DType::BF16),
        StoredDType::F32 => Some(DType::F32),
        StoredDType::F64 => Some(DType::F64),
        _ => None,
    }
}

/// Group a tensor name belongs to: its first two path segments, or the
/// first one for short names.
pub fn group_of(name: &str) -> String {
    let parts: Vec<&str> = name.split('.').collect();
    if parts.len() > 2 {
        parts[0..2].join(".")
    } else {
        parts[0].to_string()
    }
}

fn squeezed(dims: &[usize]) -> Vec<usize> {
    dims.iter().copied().filter(|&d| d != 1).collect()
}

/// Group tensor names with [`group_of`], with counts.
pub fn group_names(names: &[String]) -> BTreeMap<String, usize> {
    let mut groups = BTreeMap::new();
    for name in names {
        *groups.entry(group_of(name)).or_insert(0) += 1;
    }
    groups
}

/// `SimpleBackend` adapter over a [`TensorSource`].
pub struct SourceBackend<S> {
    source: S,
}

impl<S: TensorSource + 'static> SourceBackend<S> {
    pub fn new(source: S) -> Self {
        Self { source }
    }

    /// Wrap the source into a `VarBuilder` producing `dtype` tensors on `device`.
    pub fn into_var_builder(self, dtype: DType, device: &Device) -> VarBuilder<'static> {
        VarBuilder::from_backend(Box::new(self), dtype, device.clone())
    }
}

/// Build a `VarBuilder` straight from a source.
pub fn var_builder<S: TensorSource + 'static>(
    source: S,
    dtype: DType,
    device: &Device,
) -> VarBuilder<'static> {
    SourceBackend::new(source).into_var_builder(dtype, device)
}

impl<S: TensorSource> SimpleBackend for SourceBackend<S> {
    fn get(
        &self,
        s: Shape,
        name: &str,
        _h: candle_nn::Init,
        dtype: DType,
        dev: &Device,
    ) -> CandleResult<Tensor> {
        let tensor = self.source.load(name, dev)?;
        let tensor = if tensor.shape() == &s {
            tensor
        } else if tensor.elem_count() == s.elem_count()
            && (squeezed(tensor.dims()) == squeezed(s.dims()) || self.source.is_regrouped(name))
        {
            // 1x1 convs stored as linears, or grouped rehydrated weights
            tensor.reshape(s)?
        } else {
            candle_core::bail!(
                "shape mismatch for {name}: expected {:?}, got {:?}",
                s.dims(),
                tensor.dims()
            )
        };
        tensor.to_dtype(dtype)
    }

    fn get_unchecked(&self, name: &str, dtype: DType, dev: &Device) -> CandleResult<Tensor> {
        self.source.load(name, dev)?.to_dtype(dtype)
    }

    fn contains_tensor(&self, name: &str) -> bool {
        self.source.contains(name)
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    use super::*;
    use std::collections::HashMap;

    /// In-memory source used by unit tests.
    pub struct MapSource(pub HashMap<String, Tensor>);

    impl TensorSource for MapSource {
        fn contains(&self, name: &str) -> bool {
            self.0.contains_key(name)
        }

        fn names(&self) -> Vec<String> {
            let mut names: Vec<String> = self.0.keys().cloned().collect();
            names.sort();
            names
        }

        fn stored_dtype(&self, name: &str) -> Option<StoredDType> {
            self.0.get(name).map(|t| match t.dtype() {
                DType::F16 => StoredDType::F16,
                DType::BF16 => StoredDType::BF16,
                DType::U8 => StoredDType::U8,
                _ => StoredDType::F32,
            })
        }

        fn load(&self, name: &str, device: &Device) -> CandleResult<Tensor> {
            match self.0.get(name) {
                Some(t) => t.to_device(device),
                None => candle_core::bail!("cannot find tensor {name}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_util::MapSource;
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_backend_squeezes_and_casts() {
        let conv = Tensor::arange(0f32, 6., &Device::Cpu)
            .unwrap()
            .reshape((2, 3, 1, 1))
            .unwrap();
        let source = MapSource(HashMap::from([("proj_out.weight".to_string(), conv)]));
        let vb = var_builder(source, DType::F16, &Device::Cpu);
        let w = vb.get((2, 3), "proj_out.weight").unwrap();
        assert_eq!(w.dims(), &[2, 3]);
        assert_eq!(w.dtype(), DType::F16);
        assert!(vb.contains_tensor("proj_out.weight"));
        assert!(vb.get((4, 4), "proj_out.weight").is_err());
    }

    #[test]
    fn test_backend_rejects_transposed_weight() {
        let lin = Tensor::arange(0f32, 6., &Device::Cpu)
            .unwrap()
            .reshape((3, 2))
            .unwrap();
        let flat = Tensor::arange(0f32, 6., &Device::Cpu).unwrap();
        let source = MapSource(HashMap::from([
            ("lin.weight".to_string(), lin),
            ("flat.weight".to_string(), flat),
        ]));
        let vb = var_builder(source, DType::F32, &Device::Cpu);
        let err = vb.get((2, 3), "lin.weight").unwrap_err().to_string();
        assert!(err.contains("shape mismatch"), "{err}");
        assert!(vb.get((2, 3), "flat.weight").is_err());
    }

    #[test]
    fn test_group_names() {
        let names = vec![
            "double_blocks.0.img_attn.qkv.weight".to_string(),
            "double_blocks.0.img_attn.proj.weight".to_string(),
            "img_in.weight".to_string(),
        ];
        let groups = group_names(&names);
        assert_eq!(groups.get("double_blocks.0"), Some(&2));
        assert_eq!(groups.get("img_in"), Some(&1));
        assert_eq!(groups.get("img_in.weight"), None);
        assert_eq!(groups.len(), 2);
    }
}
