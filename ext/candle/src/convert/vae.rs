//! VAE tensor naming.
//!
//! Candle's `AutoEncoderKL` requests diffusers-style module paths. Older
//! diffusers exports name the attention projections `query`/`key`/`value`/
//! `proj_attn`, newer ones `to_q`/`to_k`/`to_v`/`to_out.0`. Single-file
//! checkpoints keep the original LDM naming under `first_stage_model.`.

/// Prefix of the VAE inside LDM-style single-file checkpoints.
pub const LDM_VAE_PREFIX: &str = "first_stage_model";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VaeLayout {
    Diffusers,
    /// LDM naming, optionally nested under `first_stage_model.`
    Ldm { prefixed: bool },
}

impl VaeLayout {
    pub fn detect<S: crate::weights::TensorSource + ?Sized>(source: &S) -> Option<Self> {
        if source.contains("encoder.conv_in.weight") || source.contains("decoder.conv_in.weight") {
            let ldm = source.contains("decoder.mid.block_1.conv1.weight");
            return Some(if ldm {
                Self::Ldm { prefixed: false }
            } else {
                Self::Diffusers
            });
        }
        if source.contains(&format!("{LDM_VAE_PREFIX}.decoder.conv_in.weight")) {
            return Some(Self::Ldm { prefixed: true });
        }
        None
    }
}

/// Map legacy attention names onto the ones a diffusers export carries.
pub fn vae_rename(name: &str) -> String {
    let parts: Vec<&str> = name.split('.').collect();
    let mut out = Vec::with_capacity(parts.len() + 1);
    for part in parts {
        match part {
            "query" => out.push("to_q"),
            "key" => out.push("to_k"),
            "value" => out.push("to_v"),
            "proj_attn" => {
                out.push("to_out");
                out.push("0");
            }
            other => out.push(other),
        }
    }
    out.join(".")
}

/// Map a diffusers VAE path to its LDM single-file name.
///
/// `up_blocks` are stored in reverse order in LDM files, and the attention
/// projections are named `q`/`k`/`v`/`proj_out`.
pub fn ldm_vae_rename(name: &str) -> String {
    let parts: Vec<&str> = name.split('.').collect();
    let mut out: Vec<String> = Vec::with_capacity(parts.len());
    let mut i = 0;
    while i < parts.len() {
        let next = parts.get(i + 1).copied();
        match parts[i] {
            "down_blocks" => out.push("down".into()),
            "mid_block" => out.push("mid".into()),
            "up_blocks" => {
                out.push("up".into());
                if let Some(idx) = next.and_then(|n| n.parse::<usize>().ok()) {
                    out.push(3usize.saturating_sub(idx).to_string());
                    i += 1;
                }
            }
            "resnets" => {
                if i > 0 && parts[i - 1] == "mid_block" {
                    if let Some(idx) = next.and_then(|n| n.parse::<usize>().ok()) {
                        out.push(format!("block_{}", idx + 1));
                        i += 1;
                    }
                } else {
                    out.push("block".into());
                }
            }
            "attentions" => {
                // mid block only has one attention
                out.push("attn_1".into());
                i += 1;
            }
            "downsamplers" => {
                out.push("downsample".into());
                i += 1;
            }
            "upsamplers" => {
                out.push("upsample".into());
                i += 1;
            }
            "conv_shortcut" => out.push("nin_shortcut".into()),
            "group_norm" => out.push("norm".into()),
            "query" | "to_q" => out.push("q".into()),
            "key" | "to_k" => out.push("k".into()),
            "value" | "to_v" => out.push("v".into()),
            "proj_attn" => out.push("proj_out".into()),
            "to_out" => {
                out.push("proj_out".into());
                if next == Some("0") {
                    i += 1;
                }
            }
            "conv_norm_out" => out.push("norm_out".into()),
            other => out.push(other.to_string()),
        }
        i += 1;
    }
    out.join(".")
}
