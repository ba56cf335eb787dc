//! Tensor name layouts and the adapters between them.

pub mod flux;
pub mod vae;

pub use self::flux::{bfl_source, FluxKeyMap, FluxLayout, PrefixedSource};
pub use self::vae::{ldm_vae_rename, vae_rename, VaeLayout};
