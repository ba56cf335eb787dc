use std::fmt;
use std::path::{Path, PathBuf};

/// Prefix the model browser puts in front of hub checkpoints.
const DIFFUSERS_PREFIX: &str = "Diffusers/";

/// A checkpoint selected for loading: a display name plus where it lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointInfo {
    pub name: String,
    pub path: PathBuf,
}

impl CheckpointInfo {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
        }
    }

    /// Hub repository id for this checkpoint
    pub fn repo_id(&self) -> &str {
        self.name.strip_prefix(DIFFUSERS_PREFIX).unwrap_or(&self.name)
    }

    pub fn quant(&self) -> QuantKind {
        QuantKind::classify(&self.path)
    }

    /// True when the checkpoint path is a local directory in diffusers layout.
    pub fn is_local_dir(&self) -> bool {
        self.path.is_dir()
    }
}

/// Storage format of the weights, decided from the checkpoint path alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuantKind {
    /// optimum-quanto int8 weights with a quantization map
    Qint8,
    /// optimum-quanto packed int4 weights with a quantization map
    Qint4,
    /// bitsandbytes 4-bit normal-float weights
    Nf4,
    /// GGML blocks in a GGUF container
    Gguf,
    None,
}

impl QuantKind {
    /// Classify a checkpoint path by its quantization markers.
    ///
    /// Markers are matched case-insensitively anywhere in the path, in the
    /// order `qint8`, `qint4`, `nf4`.
    pub fn classify(path: &Path) -> Self {
        let lowered = path.to_string_lossy().to_lowercase();
        if lowered.contains("qint8") {
            Self::Qint8
        } else if lowered.contains("qint4") {
            Self::Qint4
        } else if lowered.contains("nf4") {
            Self::Nf4
        } else if lowered.ends_with(".gguf") {
            Self::Gguf
        } else {
            Self::None
        }
    }

    pub fn is_quanto(self) -> bool {
        matches!(self, Self::Qint8 | Self::Qint4)
    }
}

impl fmt::Display for QuantKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Qint8 => "qint8",
            Self::Qint4 => "qint4",
            Self::Nf4 => "nf4",
            Self::Gguf => "gguf",
            Self::None => "none",
        };
        f.write_str(name)
    }
}

/// Which T5 text encoder to attach to an SD3 pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Te3Variant {
    Fp16,
    Fp8,
    None,
}

impl Te3Variant {
    pub fn parse(value: Option<&str>) -> Self {
        let Some(value) = value else {
            return Self::None;
        };
        let lowered = value.to_lowercase();
        if lowered.contains("fp16") {
            Self::Fp16
        } else if lowered.contains("fp8") {
            Self::Fp8
        } else {
            Self::None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_markers() {
        let cases = [
            ("models/Diffusers/Disty0--FLUX.1-dev-qint8", QuantKind::Qint8),
            ("/m/FLUX.1-schnell-QINT4", QuantKind::Qint4),
            ("/m/flux1-dev-bnb-nf4-v2.safetensors", QuantKind::Nf4),
            ("/m/flux1-dev-Q4_0.gguf", QuantKind::Gguf),
            ("/m/black-forest-labs--FLUX.1-dev", QuantKind::None),
        ];
        for (path, expected) in cases {
            assert_eq!(QuantKind::classify(Path::new(path)), expected, "{path}");
        }
    }

    #[test]
    fn test_first_marker_wins() {
        // qint8 is checked before nf4 even when both appear
        let path = Path::new("/m/nf4-to-qint8-export");
        assert_eq!(QuantKind::classify(path), QuantKind::Qint8);
        let path = Path::new("/m/qint4-nf4.gguf");
        assert_eq!(QuantKind::classify(path), QuantKind::Qint4);
    }

    #[test]
    fn test_repo_id_strips_prefix() {
        let info = CheckpointInfo::new("Diffusers/Disty0/FLUX.1-dev-qint8", "/tmp/x");
        assert_eq!(info.repo_id(), "Disty0/FLUX.1-dev-qint8");
        let info = CheckpointInfo::new("black-forest-labs/FLUX.1-dev", "/tmp/x");
        assert_eq!(info.repo_id(), "black-forest-labs/FLUX.1-dev");
    }

    #[test]
    fn test_te3_variant() {
        assert_eq!(Te3Variant::parse(Some("FP16")), Te3Variant::Fp16);
        assert_eq!(Te3Variant::parse(Some("t5 fp8")), Te3Variant::Fp8);
        assert_eq!(Te3Variant::parse(Some("none")), Te3Variant::None);
        assert_eq!(Te3Variant::parse(None), Te3Variant::None);
    }
}
