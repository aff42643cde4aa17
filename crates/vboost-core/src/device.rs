//! Enhancement device capability.
//!
//! A device owns exactly two frame-sized buffers (`in`, `out`) allocated once
//! and reused for every frame. The contract is synchronous: after `download`
//! returns, the result of the preceding `launch` is in host memory.

use crate::error::Result;
use crate::params::{KernelParams, LaunchGeometry};
use crate::types::FrameFormat;

/// Upload → launch → download capability for the enhancement kernel.
///
/// Implementations: NVRTC-compiled CUDA kernel, CPU reference.
pub trait EnhanceDevice: Send + 'static {
    /// Backend name for logs (`cuda`, `cpu`).
    fn name(&self) -> &'static str;

    /// Allocate the persistent `in` / `out` buffers for `format`.
    ///
    /// Called once per run. Failure is fatal.
    fn allocate(&mut self, format: &FrameFormat) -> Result<()>;

    /// Copy one frame of host samples into the `in` buffer.
    fn upload(&mut self, samples: &[u16]) -> Result<()>;

    /// Run the kernel from `in` to `out` over the given grid.
    fn launch(&mut self, geometry: &LaunchGeometry, params: &KernelParams) -> Result<()>;

    /// Copy the `out` buffer into `out`.
    fn download(&mut self, out: &mut [u16]) -> Result<()>;
}

impl<D: EnhanceDevice + ?Sized> EnhanceDevice for Box<D> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn allocate(&mut self, format: &FrameFormat) -> Result<()> {
        (**self).allocate(format)
    }

    fn upload(&mut self, samples: &[u16]) -> Result<()> {
        (**self).upload(samples)
    }

    fn launch(&mut self, geometry: &LaunchGeometry, params: &KernelParams) -> Result<()> {
        (**self).launch(geometry, params)
    }

    fn download(&mut self, out: &mut [u16]) -> Result<()> {
        (**self).download(out)
    }
}
