#![doc = include_str!("../README.md")]

/// NVRTC-compiled CUDA enhancement device.
#[cfg(feature = "cuda-runtime")]
pub mod kernels;
#[cfg(not(feature = "cuda-runtime"))]
#[path = "kernels_stub.rs"]
pub mod kernels;
/// Host implementation of the enhancement kernel.
pub mod reference;

pub use kernels::CudaEnhanceDevice;
pub use reference::CpuReferenceDevice;

/// CUDA C source of the enhancement kernel.
pub const ENHANCE_CUDA_SRC: &str = include_str!("enhance.cu");

#[cfg(test)]
mod tests {
    use super::ENHANCE_CUDA_SRC;

    #[test]
    fn cuda_source_uses_reference_mixing_steps() {
        for step in [
            "n ^= n << 13;",
            "n ^= n >> 17;",
            "n ^= n << 5;",
            "seed ^ linear",
            "/ 255.0f - 0.5f) * 8.0f",
            "32768.0f",
            "(unsigned int)(v + 0.5f)",
        ] {
            assert!(
                ENHANCE_CUDA_SRC.contains(step),
                "kernel source is missing `{step}`"
            );
        }
    }
}
