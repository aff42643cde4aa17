//! NVRTC-compiled CUDA enhancement device.
//!
//! The kernel source (`enhance.cu`) is compiled once per device at startup
//! with FMA contraction disabled, so results match
//! [`crate::reference`] bit for bit. Two frame-sized device buffers are
//! allocated once in [`EnhanceDevice::allocate`] and reused for every frame.

use std::sync::Arc;

use cudarc::driver::{CudaDevice, CudaFunction, CudaSlice, LaunchAsync, LaunchConfig};
use cudarc::nvrtc::{CompileOptions, compile_ptx_with_opts};

use vboost_core::device::EnhanceDevice;
use vboost_core::error::{EngineError, Result};
use vboost_core::params::{KernelParams, LaunchGeometry};
use vboost_core::types::FrameFormat;

use crate::ENHANCE_CUDA_SRC;

const MODULE_NAME: &str = "vboost_enhance";
const KERNEL_NAME: &str = "enhance_rgb48";

fn driver_err(op: &'static str) -> impl FnOnce(cudarc::driver::DriverError) -> EngineError {
    move |e| EngineError::Device(format!("{op} failed: {e}"))
}

struct DeviceBuffers {
    samples: usize,
    d_in: CudaSlice<u16>,
    d_out: CudaSlice<u16>,
}

/// CUDA-backed [`EnhanceDevice`].
pub struct CudaEnhanceDevice {
    device: Arc<CudaDevice>,
    kernel: CudaFunction,
    buffers: Option<DeviceBuffers>,
}

impl CudaEnhanceDevice {
    /// Open device `ordinal` and compile the kernel for it.
    pub fn new(ordinal: usize) -> Result<Self> {
        let device = CudaDevice::new(ordinal).map_err(driver_err("cuDeviceGet"))?;
        let kernel = Self::compile(&device)?;
        tracing::info!(ordinal, kernel = KERNEL_NAME, "CUDA enhancement kernel ready");
        Ok(Self {
            device,
            kernel,
            buffers: None,
        })
    }

    /// Compile `enhance.cu` with NVRTC and load it into `device`.
    pub fn compile(device: &Arc<CudaDevice>) -> Result<CudaFunction> {
        let opts = CompileOptions {
            fmad: Some(false),
            ..Default::default()
        };
        let ptx = compile_ptx_with_opts(ENHANCE_CUDA_SRC, opts)
            .map_err(|e| EngineError::Device(format!("NVRTC compile failed: {e}")))?;
        device
            .load_ptx(ptx, MODULE_NAME, &[KERNEL_NAME])
            .map_err(driver_err("cuModuleLoadData"))?;
        device.get_func(MODULE_NAME, KERNEL_NAME).ok_or_else(|| {
            EngineError::Device(format!(
                "Kernel function '{KERNEL_NAME}' not found in module '{MODULE_NAME}'"
            ))
        })
    }

    fn buffers(&mut self) -> Result<&mut DeviceBuffers> {
        self.buffers
            .as_mut()
            .ok_or_else(|| EngineError::Device("CUDA device used before allocate()".into()))
    }
}

impl EnhanceDevice for CudaEnhanceDevice {
    fn name(&self) -> &'static str {
        "cuda"
    }

    fn allocate(&mut self, format: &FrameFormat) -> Result<()> {
        let samples = format.sample_count();
        let d_in = self
            .device
            .alloc_zeros::<u16>(samples)
            .map_err(driver_err("cuMemAlloc(in)"))?;
        let d_out = self
            .device
            .alloc_zeros::<u16>(samples)
            .map_err(driver_err("cuMemAlloc(out)"))?;
        self.buffers = Some(DeviceBuffers {
            samples,
            d_in,
            d_out,
        });
        tracing::info!(
            width = format.width,
            height = format.height,
            bytes_per_buffer = format.frame_byte_size(),
            "CUDA frame buffers allocated"
        );
        Ok(())
    }

    fn upload(&mut self, samples: &[u16]) -> Result<()> {
        let device = self.device.clone();
        let buffers = self.buffers()?;
        if samples.len() != buffers.samples {
            return Err(EngineError::FormatMismatch {
                expected: buffers.samples,
                actual: samples.len(),
            });
        }
        device
            .htod_sync_copy_into(samples, &mut buffers.d_in)
            .map_err(driver_err("cuMemcpyHtoD"))
    }

    fn launch(&mut self, geometry: &LaunchGeometry, params: &KernelParams) -> Result<()> {
        let kernel = self.kernel.clone();
        let buffers = self.buffers()?;
        let cfg = LaunchConfig {
            grid_dim: geometry.grid,
            block_dim: geometry.block,
            shared_mem_bytes: 0,
        };
        // SAFETY: both buffers hold `width * height * 3` u16 samples, matching
        // the kernel's indexing; `d_in` and `d_out` never alias.
        unsafe {
            kernel.launch(
                cfg,
                (
                    &buffers.d_in,
                    &mut buffers.d_out,
                    geometry.width as i32,
                    geometry.height as i32,
                    params.sharpen_strength,
                    params.contrast_boost,
                    params.seed,
                ),
            )
        }
        .map_err(driver_err("cuLaunchKernel"))
    }

    fn download(&mut self, out: &mut [u16]) -> Result<()> {
        let device = self.device.clone();
        let buffers = self.buffers()?;
        if out.len() != buffers.samples {
            return Err(EngineError::FormatMismatch {
                expected: buffers.samples,
                actual: out.len(),
            });
        }
        // Synchronous copy: also surfaces asynchronous launch failures.
        device
            .dtoh_sync_copy_into(&buffers.d_out, out)
            .map_err(driver_err("cuMemcpyDtoH"))
    }
}
