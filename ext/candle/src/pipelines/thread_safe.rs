use std::sync::{Mutex, MutexGuard};

use super::Pipeline;

/// A pipeline shared behind a mutex, for callers that need `Send + Sync`.
pub struct ThreadSafePipeline {
    inner: Mutex<Pipeline>,
}

impl ThreadSafePipeline {
    pub fn new(pipeline: Pipeline) -> Self {
        Self {
            inner: Mutex::new(pipeline),
        }
    }

    /// Lock the pipeline. A panic in an earlier holder does not poison it;
    /// failed swaps leave the old components in place.
    pub fn lock(&self) -> MutexGuard<'_, Pipeline> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn into_inner(self) -> Pipeline {
        match self.inner.into_inner() {
            Ok(pipeline) => pipeline,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

// SAFETY: `Pipeline` is not `Send` only because candle's `MMDiT` keeps its
// joint blocks as `Box<dyn JointBlock>` without a `Send` bound. Every block
// type holds plain tensors and candle-nn layers, which are `Send + Sync`,
// and all access goes through the mutex.
unsafe impl Send for ThreadSafePipeline {}
unsafe impl Sync for ThreadSafePipeline {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipelines::Sd3Pipeline;
    use candle_core::{DType, Device};

    fn assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn test_thread_safe_pipeline_is_send_sync() {
        assert_send_sync::<ThreadSafePipeline>();
    }

    #[test]
    fn test_lock_from_another_thread() {
        let pipe = ThreadSafePipeline::new(Pipeline::Sd3(Sd3Pipeline::empty(Device::Cpu, DType::F16)));
        let class = std::thread::scope(|s| s.spawn(|| pipe.lock().class_name()).join().unwrap());
        assert_eq!(class, "StableDiffusion3Pipeline");
        assert_eq!(pipe.into_inner().dtype(), DType::F16);
    }
}
