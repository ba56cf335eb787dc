//! Serde mirrors of diffusers `config.json` documents, with conversions to
//! the candle model configs.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use std::path::Path;

use crate::errors::Result;

pub mod clip;
pub mod flux;
pub mod mmdit;
pub mod unet;
pub mod vae;

pub use self::clip::ClipConfig;
pub use self::flux::FluxTransformerConfig;
pub use self::mmdit::MmditConfig;
pub use self::unet::UNetConfig;
pub use self::vae::VaeConfig;

/// Read and parse a JSON config file.
pub fn read_config<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let text = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
}

/// A value diffusers stores either once or per block.
#[derive(Debug, Clone, PartialEq)]
pub enum PerBlock<T> {
    One(T),
    Each(Vec<T>),
}

impl<T: Copy> PerBlock<T> {
    /// Value for block `idx`, repeating the last entry for short lists.
    pub fn get(&self, idx: usize) -> Option<T> {
        match self {
            Self::One(v) => Some(*v),
            Self::Each(vs) => vs.get(idx).or(vs.last()).copied(),
        }
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for PerBlock<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw<T> {
            One(T),
            Each(Vec<T>),
        }
        Ok(match Raw::deserialize(deserializer)? {
            Raw::One(v) => Self::One(v),
            Raw::Each(vs) => Self::Each(vs),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_per_block_values() {
        let one: PerBlock<usize> = serde_json::from_str("8").unwrap();
        assert_eq!(one.get(3), Some(8));
        let each: PerBlock<usize> = serde_json::from_str("[5, 10, 20]").unwrap();
        assert_eq!(each.get(1), Some(10));
        assert_eq!(each.get(7), Some(20));
        let empty: PerBlock<usize> = serde_json::from_str("[]").unwrap();
        assert_eq!(empty.get(0), None);
    }
}
