//! FLUX transformer tensor layouts.
//!
//! Candle's flux model is written against the Black Forest Labs (BFL)
//! naming (`double_blocks.N.img_attn.qkv`, ...). Diffusers checkpoints split
//! the fused projections and rename the embedders, so they are served
//! through [`FluxKeyMap`], which rebuilds every BFL tensor on request.

use candle_core::{Device, Result as CandleResult, Tensor, D};
use std::collections::BTreeMap;

use crate::errors::{LoadError, Result};
use crate::weights::{StoredDType, TensorSource};

/// Prefixes BFL-layout single-file checkpoints are known to carry.
pub const BFL_PREFIXES: [&str; 3] = ["", "model.diffusion_model.", "diffusion_model."];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FluxLayout {
    Diffusers,
    Bfl { prefix: String },
}

impl FluxLayout {
    pub fn detect<S: TensorSource + ?Sized>(source: &S) -> Result<Self> {
        if source.contains("x_embedder.weight") {
            return Ok(Self::Diffusers);
        }
        for prefix in BFL_PREFIXES {
            if source.contains(&format!("{prefix}img_in.weight")) {
                return Ok(Self::Bfl {
                    prefix: prefix.to_string(),
                });
            }
        }
        Err(LoadError::Unsupported(
            "tensor names match neither the diffusers nor the BFL FLUX layout".to_string(),
        ))
    }
}

/// Number of `<group>.N.` blocks present among `names`
pub fn count_blocks(names: &[String], group: &str) -> usize {
    let prefix = format!("{group}.");
    names
        .iter()
        .filter_map(|n| n.strip_prefix(&prefix))
        .filter_map(|rest| rest.split('.').next())
        .filter_map(|idx| idx.parse::<usize>().ok())
        .max()
        .map_or(0, |max| max + 1)
}

/// How a BFL tensor is rebuilt from diffusers tensors.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Plan {
    Rename(String),
    /// concatenated along dim 0
    Concat(Vec<String>),
    /// `[scale, shift]` stored, `[shift, scale]` expected
    SwapHalves(String),
}

impl Plan {
    fn sources(&self) -> Vec<&str> {
        match self {
            Self::Rename(s) | Self::SwapHalves(s) => vec![s.as_str()],
            Self::Concat(parts) => parts.iter().map(String::as_str).collect(),
        }
    }
}

/// Serves BFL tensor names from a diffusers-layout FLUX transformer.
pub struct FluxKeyMap<S> {
    inner: S,
    plans: BTreeMap<String, Plan>,
}

impl<S: TensorSource> FluxKeyMap<S> {
    pub fn new(inner: S) -> Self {
        let names = inner.names();
        let depth = count_blocks(&names, "transformer_blocks");
        let depth_single = count_blocks(&names, "single_transformer_blocks");
        let plans = build_plans(depth, depth_single)
            .into_iter()
            .filter(|(_, plan)| plan.sources().iter().all(|s| inner.contains(s)))
            .collect();
        Self { inner, plans }
    }

    /// Diffusers name(s) a BFL tensor is built from
    pub fn sources_of(&self, name: &str) -> Option<Vec<&str>> {
        self.plans.get(name).map(Plan::sources)
    }
}

impl<S: TensorSource> TensorSource for FluxKeyMap<S> {
    fn contains(&self, name: &str) -> bool {
        self.plans.contains_key(name)
    }

    fn names(&self) -> Vec<String> {
        self.plans.keys().cloned().collect()
    }

    fn stored_dtype(&self, name: &str) -> Option<StoredDType> {
        let plan = self.plans.get(name)?;
        plan.sources()
            .first()
            .and_then(|s| self.inner.stored_dtype(s))
    }

    fn load(&self, name: &str, device: &Device) -> CandleResult<Tensor> {
        let Some(plan) = self.plans.get(name) else {
            candle_core::bail!("no diffusers tensor maps to {name}")
        };
        // grouped parts are joined flat; dim 0 splits and joins keep row-major order
        let flat = self.is_regrouped(name);
        let load = |src: &str| -> CandleResult<Tensor> {
            let t = self.inner.load(src, device)?;
            if flat {
                t.flatten_all()
            } else {
                Ok(t)
            }
        };
        match plan {
            Plan::Rename(src) => self.inner.load(src, device),
            Plan::Concat(parts) => {
                let tensors = parts
                    .iter()
                    .map(|p| load(p.as_str()))
                    .collect::<CandleResult<Vec<_>>>()?;
                Tensor::cat(&tensors, 0)
            }
            Plan::SwapHalves(src) => {
                let t = load(src.as_str())?;
                let half = t.dim(0)? / 2;
                let scale = t.narrow(0, 0, half)?;
                let shift = t.narrow(0, half, t.dim(0)? - half)?;
                Tensor::cat(&[shift, scale], 0)
            }
        }
    }

    fn is_regrouped(&self, name: &str) -> bool {
        self.plans
            .get(name)
            .is_some_and(|plan| plan.sources().iter().any(|s| self.inner.is_regrouped(s)))
    }
}

fn build_plans(depth: usize, depth_single: usize) -> Vec<(String, Plan)> {
    let mut plans = Vec::new();
    let mut linear = |bfl: String, src: String| {
        for suffix in ["weight", "bias"] {
            plans.push((format!("{bfl}.{suffix}"), Plan::Rename(format!("{src}.{suffix}"))));
        }
    };

    linear("img_in".into(), "x_embedder".into());
    linear("txt_in".into(), "context_embedder".into());
    for (bfl, src) in [
        ("time_in", "timestep_embedder"),
        ("vector_in", "text_embedder"),
        ("guidance_in", "guidance_embedder"),
    ] {
        linear(format!("{bfl}.in_layer"), format!("time_text_embed.{src}.linear_1"));
        linear(format!("{bfl}.out_layer"), format!("time_text_embed.{src}.linear_2"));
    }
    linear("final_layer.linear".into(), "proj_out".into());

    for i in 0..depth {
        let bfl = format!("double_blocks.{i}");
        let src = format!("transformer_blocks.{i}");
        for (b, s) in [
            ("img_mod.lin", "norm1.linear"),
            ("txt_mod.lin", "norm1_context.linear"),
            ("img_attn.proj", "attn.to_out.0"),
            ("txt_attn.proj", "attn.to_add_out"),
            ("img_mlp.0", "ff.net.0.proj"),
            ("img_mlp.2", "ff.net.2"),
            ("txt_mlp.0", "ff_context.net.0.proj"),
            ("txt_mlp.2", "ff_context.net.2"),
        ] {
            linear(format!("{bfl}.{b}"), format!("{src}.{s}"));
        }
    }
    for i in 0..depth_single {
        let bfl = format!("single_blocks.{i}");
        let src = format!("single_transformer_blocks.{i}");
        linear(format!("{bfl}.modulation.lin"), format!("{src}.norm.linear"));
        linear(format!("{bfl}.linear2"), format!("{src}.proj_out"));
    }

    for suffix in ["weight", "bias"] {
        plans.push((
            format!("final_layer.adaLN_modulation.1.{suffix}"),
            Plan::SwapHalves(format!("norm_out.linear.{suffix}")),
        ));
    }

    let concat = |src: &str, parts: &[&str], suffix: &str| {
        Plan::Concat(parts.iter().map(|p| format!("{src}.attn.{p}.{suffix}")).collect())
    };
    for i in 0..depth {
        let bfl = format!("double_blocks.{i}");
        let src = format!("transformer_blocks.{i}");
        for suffix in ["weight", "bias"] {
            plans.push((
                format!("{bfl}.img_attn.qkv.{suffix}"),
                concat(&src, &["to_q", "to_k", "to_v"], suffix),
            ));
            plans.push((
                format!("{bfl}.txt_attn.qkv.{suffix}"),
                concat(&src, &["add_q_proj", "add_k_proj", "add_v_proj"], suffix),
            ));
        }
        for (b, s) in [
            ("img_attn.norm.query_norm", "norm_q"),
            ("img_attn.norm.key_norm", "norm_k"),
            ("txt_attn.norm.query_norm", "norm_added_q"),
            ("txt_attn.norm.key_norm", "norm_added_k"),
        ] {
            plans.push((
                format!("{bfl}.{b}.scale"),
                Plan::Rename(format!("{src}.attn.{s}.weight")),
            ));
        }
    }
    for i in 0..depth_single {
        let bfl = format!("single_blocks.{i}");
        let src = format!("single_transformer_blocks.{i}");
        for suffix in ["weight", "bias"] {
            let mut parts: Vec<String> = ["to_q", "to_k", "to_v"]
                .iter()
                .map(|p| format!("{src}.attn.{p}.{suffix}"))
                .collect();
            parts.push(format!("{src}.proj_mlp.{suffix}"));
            plans.push((format!("{bfl}.linear1.{suffix}"), Plan::Concat(parts)));
        }
        for (b, s) in [("norm.query_norm", "norm_q"), ("norm.key_norm", "norm_k")] {
            plans.push((
                format!("{bfl}.{b}.scale"),
                Plan::Rename(format!("{src}.attn.{s}.weight")),
            ));
        }
    }
    plans
}

/// Strips a fixed prefix (e.g. `model.diffusion_model.`) from every name.
pub struct PrefixedSource<S> {
    inner: S,
    prefix: String,
}

impl<S: TensorSource> PrefixedSource<S> {
    pub fn new(inner: S, prefix: impl Into<String>) -> Self {
        Self {
            inner,
            prefix: prefix.into(),
        }
    }

    fn full(&self, name: &str) -> String {
        format!("{}{name}", self.prefix)
    }
}

impl<S: TensorSource> TensorSource for PrefixedSource<S> {
    fn contains(&self, name: &str) -> bool {
        self.inner.contains(&self.full(name))
    }

    fn names(&self) -> Vec<String> {
        self.inner
            .names()
            .into_iter()
            .filter_map(|n| n.strip_prefix(self.prefix.as_str()).map(str::to_string))
            .collect()
    }

    fn stored_dtype(&self, name: &str) -> Option<StoredDType> {
        self.inner.stored_dtype(&self.full(name))
    }

    fn load(&self, name: &str, device: &Device) -> CandleResult<Tensor> {
        self.inner.load(&self.full(name), device)
    }

    fn is_regrouped(&self, name: &str) -> bool {
        self.inner.is_regrouped(&self.full(name))
    }
}

/// Serve BFL names from any FLUX transformer source, whatever its layout.
pub fn bfl_source<S: TensorSource + 'static>(source: S) -> Result<Box<dyn TensorSource>> {
    Ok(match FluxLayout::detect(&source)? {
        FluxLayout::Diffusers => Box::new(FluxKeyMap::new(source)),
        FluxLayout::Bfl { prefix } if prefix.is_empty() => Box::new(source),
        FluxLayout::Bfl { prefix } => Box::new(PrefixedSource::new(source, prefix)),
    })
}

/// Whether a BFL source carries the guidance embedder (FLUX dev vs schnell)
pub fn has_guidance<S: TensorSource + ?Sized>(source: &S) -> bool {
    source.contains("guidance_in.in_layer.weight")
}

/// Width of the hidden state, read from the image embedder
pub fn hidden_size<S: TensorSource + ?Sized>(source: &S) -> CandleResult<usize> {
    source.load("img_in.weight", &Device::Cpu)?.dim(D::Minus(2))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::weights::test_util::MapSource;
    use crate::weights::{var_builder, QuantizationMap, QuantoSource};
    use candle_core::DType;
    use std::collections::HashMap;

    fn t(values: &[f32]) -> Tensor {
        Tensor::new(values, &Device::Cpu).unwrap()
    }

    fn diffusers_source() -> MapSource {
        let mut m = HashMap::new();
        for name in ["x_embedder", "context_embedder", "proj_out"] {
            m.insert(format!("{name}.weight"), t(&[1.0]));
            m.insert(format!("{name}.bias"), t(&[0.0]));
        }
        m.insert("norm_out.linear.weight".into(), t(&[1., 2., 3., 4.]));
        m.insert("norm_out.linear.bias".into(), t(&[5., 6.]));
        for (p, v) in [("to_q", 1.), ("to_k", 2.), ("to_v", 3.)] {
            m.insert(format!("transformer_blocks.0.attn.{p}.weight"), t(&[v]));
            m.insert(format!("transformer_blocks.0.attn.{p}.bias"), t(&[v]));
            m.insert(format!("single_transformer_blocks.1.attn.{p}.weight"), t(&[v]));
            m.insert(format!("single_transformer_blocks.1.attn.{p}.bias"), t(&[v]));
        }
        m.insert("single_transformer_blocks.1.proj_mlp.weight".into(), t(&[9., 9.]));
        m.insert("single_transformer_blocks.1.proj_mlp.bias".into(), t(&[9., 9.]));
        m.insert("single_transformer_blocks.1.attn.norm_q.weight".into(), t(&[0.5]));
        MapSource(m)
    }

    #[test]
    fn test_detect_layout() {
        assert_eq!(FluxLayout::detect(&diffusers_source()).unwrap(), FluxLayout::Diffusers);
        let bfl = MapSource(HashMap::from([(
            "model.diffusion_model.img_in.weight".to_string(),
            t(&[1.0]),
        )]));
        assert_eq!(
            FluxLayout::detect(&bfl).unwrap(),
            FluxLayout::Bfl {
                prefix: "model.diffusion_model.".into()
            }
        );
        let other = MapSource(HashMap::from([("conv_in.weight".to_string(), t(&[1.0]))]));
        assert!(matches!(FluxLayout::detect(&other), Err(LoadError::Unsupported(_))));
    }

    #[test]
    fn test_count_blocks() {
        let names = vec![
            "transformer_blocks.0.attn.to_q.weight".to_string(),
            "transformer_blocks.18.attn.to_q.weight".to_string(),
            "single_transformer_blocks.3.proj_out.weight".to_string(),
        ];
        assert_eq!(count_blocks(&names, "transformer_blocks"), 19);
        assert_eq!(count_blocks(&names, "single_transformer_blocks"), 4);
        assert_eq!(count_blocks(&names, "double_blocks"), 0);
    }

    #[test]
    fn test_key_map_fuses_and_swaps() {
        let map = FluxKeyMap::new(diffusers_source());
        assert!(map.contains("img_in.weight"));
        assert!(map.contains("double_blocks.0.img_attn.qkv.weight"));
        // no add_*_proj tensors in the fixture
        assert!(!map.contains("double_blocks.0.txt_attn.qkv.weight"));
        assert!(!map.contains("guidance_in.in_layer.weight"));
        assert_eq!(map.sources_of("final_layer.linear.bias"), Some(vec!["proj_out.bias"]));

        let qkv = map.load("double_blocks.0.img_attn.qkv.weight", &Device::Cpu).unwrap();
        assert_eq!(qkv.to_vec1::<f32>().unwrap(), vec![1., 2., 3.]);
        let linear1 = map.load("single_blocks.1.linear1.bias", &Device::Cpu).unwrap();
        assert_eq!(linear1.to_vec1::<f32>().unwrap(), vec![1., 2., 3., 9., 9.]);
        let norm = map.load("single_blocks.1.norm.query_norm.scale", &Device::Cpu).unwrap();
        assert_eq!(norm.to_vec1::<f32>().unwrap(), vec![0.5]);

        let ada = map.load("final_layer.adaLN_modulation.1.weight", &Device::Cpu).unwrap();
        assert_eq!(ada.to_vec1::<f32>().unwrap(), vec![3., 4., 1., 2.]);
        let ada = map.load("final_layer.adaLN_modulation.1.bias", &Device::Cpu).unwrap();
        assert_eq!(ada.to_vec1::<f32>().unwrap(), vec![6., 5.]);
    }

    #[test]
    fn test_prefixed_source() {
        let inner = MapSource(HashMap::from([
            ("diffusion_model.img_in.weight".to_string(), t(&[2.0])),
            ("first_stage_model.conv_in.weight".to_string(), t(&[1.0])),
        ]));
        let source = bfl_source(inner).unwrap();
        assert_eq!(source.names(), vec!["img_in.weight"]);
        assert!(source.contains("img_in.weight"));
        assert!(!has_guidance(&source));
        let w = source.load("img_in.weight", &Device::Cpu).unwrap();
        assert_eq!(w.to_vec1::<f32>().unwrap(), vec![2.0]);
    }

    #[test]
    fn test_qint4_projections_fuse_in_module_shape() {
        // each (2, 4) projection is stored as four groups of two, packed two rows per byte row
        let packed = Tensor::from_vec(vec![64u8, 81, 98, 115], (2, 2), &Device::Cpu).unwrap();
        let mut m = HashMap::new();
        let mut qmap = serde_json::Map::new();
        for (p, s) in [("to_q", 1f32), ("to_k", 2.), ("to_v", 3.)] {
            let module = format!("transformer_blocks.0.attn.{p}");
            let scale = Tensor::from_vec(vec![s; 4], (4, 1), &Device::Cpu).unwrap();
            m.insert(format!("{module}.weight._data"), packed.clone());
            m.insert(format!("{module}.weight._scale"), scale);
            qmap.insert(module, serde_json::json!({"weights": "qint4", "activations": "none"}));
        }
        let qmap = QuantizationMap::from_json_str(&serde_json::Value::Object(qmap).to_string()).unwrap();
        let map = FluxKeyMap::new(QuantoSource::new(MapSource(m), qmap));
        assert!(map.is_regrouped("double_blocks.0.img_attn.qkv.weight"));

        let vb = var_builder(map, DType::F32, &Device::Cpu);
        let qkv = vb.get((6, 4), "double_blocks.0.img_attn.qkv.weight").unwrap();
        let q = [vec![0., 1., 2., 3.], vec![4., 5., 6., 7.]];
        let expected: Vec<Vec<f32>> = [1f32, 2., 3.]
            .iter()
            .flat_map(|s| q.iter().map(move |row| row.iter().map(|v| v * s).collect()))
            .collect();
        assert_eq!(qkv.to_vec2::<f32>().unwrap(), expected);
    }
}
