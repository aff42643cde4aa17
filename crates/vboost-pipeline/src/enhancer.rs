//! Host side of the enhancement step.

use vboost_core::device::EnhanceDevice;
use vboost_core::error::{EngineError, Result};
use vboost_core::params::{KernelParams, LaunchGeometry};
use vboost_core::types::{Frame, FrameFormat};

/// Drives one [`EnhanceDevice`] for one frame format.
///
/// Device buffers are allocated once in [`new`](Self::new). Each call to
/// [`enhance`](Self::enhance) is a synchronous upload → launch → download,
/// so at most one frame is on the device at a time.
pub struct DeviceEnhancer<D: EnhanceDevice> {
    device: D,
    format: FrameFormat,
    geometry: LaunchGeometry,
}

impl<D: EnhanceDevice> DeviceEnhancer<D> {
    pub fn new(mut device: D, format: FrameFormat, tile: u32) -> Result<Self> {
        let geometry = LaunchGeometry::for_format(&format, tile)?;
        device.allocate(&format)?;
        tracing::info!(
            device = device.name(),
            %format,
            grid = ?geometry.grid,
            block = ?geometry.block,
            threads = geometry.threads_per_block(),
            "Enhancer ready"
        );
        Ok(Self {
            device,
            format,
            geometry,
        })
    }

    pub fn device_name(&self) -> &'static str {
        self.device.name()
    }

    pub fn geometry(&self) -> &LaunchGeometry {
        &self.geometry
    }

    /// Enhance `frame` in place of its own sample buffer and return it.
    pub fn enhance(&mut self, mut frame: Frame, params: &KernelParams) -> Result<Frame> {
        let expected = self.format.sample_count();
        if frame.samples.len() != expected {
            return Err(EngineError::FormatMismatch {
                expected,
                actual: frame.samples.len(),
            });
        }
        self.device.upload(&frame.samples)?;
        self.device.launch(&self.geometry, params)?;
        self.device.download(&mut frame.samples)?;
        Ok(frame)
    }
}
