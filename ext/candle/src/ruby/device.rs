use magnus::Error;
use magnus::{class, function, method, Module, Object, RModule};

use ::candle_core::Device as CoreDevice;
use crate::devices;
use crate::ruby::Result;

/// Devices compiled into this build
pub fn available_devices() -> Vec<String> {
    devices::available_devices()
        .into_iter()
        .map(str::to_string)
        .collect()
}

/// Device picked from the compiled features, without probing hardware
pub fn default_device() -> Device {
    match devices::DEFAULT_DEVICE {
        "metal" => Device::Metal,
        "cuda" => Device::Cuda,
        _ => Device::Cpu,
    }
}

/// Best device that actually initializes at runtime
pub fn best_device() -> Device {
    Device::from_device(&devices::best_device())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[magnus::wrap(class = "Candle::Device")]
pub enum Device {
    Cpu,
    Cuda,
    Metal,
}

impl Device {
    pub fn cpu() -> Self {
        Self::Cpu
    }

    pub fn cuda() -> Result<Self> {
        if cfg!(not(feature = "cuda")) {
            return Err(Error::new(
                magnus::exception::runtime_error(),
                "CUDA support not compiled in. Rebuild with the cuda feature.",
            ));
        }
        Ok(Self::Cuda)
    }

    pub fn metal() -> Result<Self> {
        if cfg!(not(feature = "metal")) {
            return Err(Error::new(
                magnus::exception::runtime_error(),
                "Metal support not compiled in. Rebuild on macOS.",
            ));
        }
        Ok(Self::Metal)
    }

    pub fn from_device(device: &CoreDevice) -> Self {
        match device {
            CoreDevice::Cpu => Self::Cpu,
            CoreDevice::Cuda(_) => Self::Cuda,
            CoreDevice::Metal(_) => Self::Metal,
        }
    }

    /// Name understood by the loader options
    pub fn name(&self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::Cuda => "cuda",
            Self::Metal => "metal",
        }
    }

    pub fn __repr__(&self) -> String {
        self.name().to_string()
    }

    pub fn __str__(&self) -> String {
        self.__repr__()
    }

    pub fn __eq__(&self, other: &Device) -> bool {
        self == other
    }
}

impl magnus::TryConvert for Device {
    fn try_convert(val: magnus::Value) -> Result<Self> {
        if let Ok(device) = <magnus::typed_data::Obj<Device> as magnus::TryConvert>::try_convert(val) {
            return Ok(*device);
        }

        let device: String = magnus::TryConvert::try_convert(val)?;
        match device.as_str() {
            "cpu" => Ok(Device::Cpu),
            "cuda" => Ok(Device::Cuda),
            "metal" => Ok(Device::Metal),
            _ => Err(Error::new(magnus::exception::arg_error(), "invalid device")),
        }
    }
}

pub fn init(rb_candle: RModule) -> Result<()> {
    let rb_device = rb_candle.define_class("Device", class::object())?;
    rb_device.define_singleton_method("cpu", function!(Device::cpu, 0))?;
    rb_device.define_singleton_method("cuda", function!(Device::cuda, 0))?;
    rb_device.define_singleton_method("metal", function!(Device::metal, 0))?;
    rb_device.define_singleton_method("available_devices", function!(available_devices, 0))?;
    rb_device.define_singleton_method("default", function!(default_device, 0))?;
    rb_device.define_singleton_method("best", function!(best_device, 0))?;
    rb_device.define_method("to_s", method!(Device::__str__, 0))?;
    rb_device.define_method("inspect", method!(Device::__repr__, 0))?;
    rb_device.define_method("==", method!(Device::__eq__, 1))?;
    Ok(())
}
