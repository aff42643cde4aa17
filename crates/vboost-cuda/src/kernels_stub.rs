//! Stub CUDA device for builds without the `cuda-runtime` feature.

use vboost_core::device::EnhanceDevice;
use vboost_core::error::{EngineError, Result};
use vboost_core::params::{KernelParams, LaunchGeometry};
use vboost_core::types::FrameFormat;

fn unavailable() -> EngineError {
    EngineError::DeviceUnavailable(
        "vboost-cuda built without `cuda-runtime`; use the CPU device or rebuild with the feature"
            .into(),
    )
}

/// Placeholder for the CUDA device; cannot be constructed.
pub struct CudaEnhanceDevice {
    _private: (),
}

impl CudaEnhanceDevice {
    pub fn new(ordinal: usize) -> Result<Self> {
        let _ = ordinal;
        Err(unavailable())
    }
}

impl EnhanceDevice for CudaEnhanceDevice {
    fn name(&self) -> &'static str {
        "cuda"
    }

    fn allocate(&mut self, _format: &FrameFormat) -> Result<()> {
        Err(unavailable())
    }

    fn upload(&mut self, _samples: &[u16]) -> Result<()> {
        Err(unavailable())
    }

    fn launch(&mut self, _geometry: &LaunchGeometry, _params: &KernelParams) -> Result<()> {
        Err(unavailable())
    }

    fn download(&mut self, _out: &mut [u16]) -> Result<()> {
        Err(unavailable())
    }
}
