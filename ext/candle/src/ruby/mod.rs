pub mod device;
pub mod errors;
pub mod pipeline;

pub use device::Device;

pub type Result<T> = std::result::Result<T, magnus::Error>;
