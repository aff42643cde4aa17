//! Host implementation of the enhancement kernel.
//!
//! Mirrors `enhance.cu` operation for operation in `f32` (the device build
//! disables FMA contraction), so both backends produce bit-identical frames
//! for the same input, seed, and settings.

use vboost_core::device::EnhanceDevice;
use vboost_core::error::{EngineError, Result};
use vboost_core::params::{KernelParams, LaunchGeometry};
use vboost_core::types::FrameFormat;

const MID_GRAY: f32 = 32768.0;
const MAX_SAMPLE: f32 = 65535.0;

/// One step of the xorshift32 permutation.
#[inline]
pub const fn xorshift32(mut n: u32) -> u32 {
    n ^= n << 13;
    n ^= n >> 17;
    n ^= n << 5;
    n
}

/// Per-pixel dither offset in `[-4.0, 4.0]`, shared by all three channels.
#[inline]
pub fn dither_jitter(seed: u32, linear_index: u32) -> f32 {
    let n = xorshift32(seed ^ linear_index);
    ((n & 0xFF) as f32 / 255.0 - 0.5) * 8.0
}

/// Number of in-bounds samples in the 3×3 neighbourhood of `(x, y)`.
#[inline]
pub fn neighborhood_count(x: u32, y: u32, width: u32, height: u32) -> u32 {
    let span = |p: u32, len: u32| -> u32 {
        let lo = p.saturating_sub(1);
        let hi = (p + 1).min(len - 1);
        hi - lo + 1
    };
    span(x, width) * span(y, height)
}

/// Per-channel 3×3 mean around `(x, y)`, excluding out-of-bounds neighbours.
pub fn local_mean(input: &[u16], width: u32, height: u32, x: u32, y: u32) -> [f32; 3] {
    let mut sum = [0.0f32; 3];
    for oy in -1i64..=1 {
        let yy = y as i64 + oy;
        if yy < 0 || yy >= height as i64 {
            continue;
        }
        for ox in -1i64..=1 {
            let xx = x as i64 + ox;
            if xx < 0 || xx >= width as i64 {
                continue;
            }
            let n_idx = (yy as usize * width as usize + xx as usize) * 3;
            sum[0] += input[n_idx] as f32;
            sum[1] += input[n_idx + 1] as f32;
            sum[2] += input[n_idx + 2] as f32;
        }
    }
    let count = neighborhood_count(x, y, width, height) as f32;
    [sum[0] / count, sum[1] / count, sum[2] / count]
}

/// 16-bit store of a dithered value: rounds half up, saturates below zero,
/// wraps above 65535.
#[inline]
pub fn store_sample(v: f32) -> u16 {
    (v + 0.5) as u32 as u16
}

/// Enhance the pixel at `(x, y)` of `input`, writing its three samples to
/// `output`.
#[inline]
pub fn enhance_pixel(
    input: &[u16],
    output: &mut [u16],
    width: u32,
    height: u32,
    x: u32,
    y: u32,
    params: &KernelParams,
) {
    let linear = y.wrapping_mul(width).wrapping_add(x);
    let idx = (y as usize * width as usize + x as usize) * 3;
    let mean = local_mean(input, width, height, x, y);

    let mut out = [0.0f32; 3];
    for c in 0..3 {
        let mut v = input[idx + c] as f32;
        v = v + params.sharpen_strength * (v - mean[c]);
        v = (v - MID_GRAY) * params.contrast_boost + MID_GRAY;
        out[c] = v.clamp(0.0, MAX_SAMPLE);
    }

    let jitter = dither_jitter(params.seed, linear);
    for c in 0..3 {
        output[idx + c] = store_sample(out[c] + jitter);
    }
}

/// Enhance a whole interleaved frame. Pixel order is immaterial.
pub fn enhance_frame(
    input: &[u16],
    output: &mut [u16],
    width: u32,
    height: u32,
    params: &KernelParams,
) {
    for y in 0..height {
        for x in 0..width {
            enhance_pixel(input, output, width, height, x, y, params);
        }
    }
}

// ─── Device ──────────────────────────────────────────────────────────────────

struct HostBuffers {
    width: u32,
    height: u32,
    input: Vec<u16>,
    output: Vec<u16>,
}

/// [`EnhanceDevice`] backed by host memory and [`enhance_frame`].
#[derive(Default)]
pub struct CpuReferenceDevice {
    buffers: Option<HostBuffers>,
}

impl CpuReferenceDevice {
    pub fn new() -> Self {
        Self::default()
    }

    fn buffers(&mut self) -> Result<&mut HostBuffers> {
        self.buffers
            .as_mut()
            .ok_or_else(|| EngineError::Device("CPU device used before allocate()".into()))
    }
}

impl EnhanceDevice for CpuReferenceDevice {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn allocate(&mut self, format: &FrameFormat) -> Result<()> {
        let samples = format.sample_count();
        self.buffers = Some(HostBuffers {
            width: format.width,
            height: format.height,
            input: vec![0; samples],
            output: vec![0; samples],
        });
        tracing::info!(
            width = format.width,
            height = format.height,
            bytes_per_buffer = format.frame_byte_size(),
            "CPU reference buffers allocated"
        );
        Ok(())
    }

    fn upload(&mut self, samples: &[u16]) -> Result<()> {
        let buffers = self.buffers()?;
        if samples.len() != buffers.input.len() {
            return Err(EngineError::FormatMismatch {
                expected: buffers.input.len(),
                actual: samples.len(),
            });
        }
        buffers.input.copy_from_slice(samples);
        Ok(())
    }

    fn launch(&mut self, geometry: &LaunchGeometry, params: &KernelParams) -> Result<()> {
        let buffers = self.buffers()?;
        if geometry.width != buffers.width || geometry.height != buffers.height {
            return Err(EngineError::Device(format!(
                "launch geometry {}x{} does not match allocated {}x{}",
                geometry.width, geometry.height, buffers.width, buffers.height
            )));
        }
        enhance_frame(
            &buffers.input,
            &mut buffers.output,
            buffers.width,
            buffers.height,
            params,
        );
        Ok(())
    }

    fn download(&mut self, out: &mut [u16]) -> Result<()> {
        let buffers = self.buffers()?;
        if out.len() != buffers.output.len() {
            return Err(EngineError::FormatMismatch {
                expected: buffers.output.len(),
                actual: out.len(),
            });
        }
        out.copy_from_slice(&buffers.output);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vboost_core::params::{EnhanceSettings, dither_seed};
    use vboost_core::types::FrameRate;

    fn params(sharpen: f32, boost: f32, frame_index: u64) -> KernelParams {
        KernelParams {
            sharpen_strength: sharpen,
            contrast_boost: boost,
            seed: dither_seed(frame_index),
        }
    }

    fn gradient(width: u32, height: u32) -> Vec<u16> {
        let mut out = Vec::with_capacity((width * height * 3) as usize);
        for y in 0..height {
            for x in 0..width {
                for c in 0..3u32 {
                    out.push(((x * 4099 + y * 7919 + c * 1237) % 65536) as u16);
                }
            }
        }
        out
    }

    fn run(input: &[u16], width: u32, height: u32, p: &KernelParams) -> Vec<u16> {
        let mut out = vec![0u16; input.len()];
        enhance_frame(input, &mut out, width, height, p);
        out
    }

    #[test]
    fn neighborhood_counts_interior_edge_and_corner() {
        let (w, h) = (5, 4);
        assert_eq!(neighborhood_count(2, 2, w, h), 9);
        assert_eq!(neighborhood_count(0, 2, w, h), 6);
        assert_eq!(neighborhood_count(2, 0, w, h), 6);
        assert_eq!(neighborhood_count(4, 3, w, h), 4);
        assert_eq!(neighborhood_count(0, 0, w, h), 4);
        // Degenerate single-row image.
        assert_eq!(neighborhood_count(1, 0, 3, 1), 3);
        assert_eq!(neighborhood_count(0, 0, 1, 1), 1);
    }

    #[test]
    fn local_mean_divides_by_in_bounds_neighbours() {
        let (w, h) = (4, 3);
        let mut input = vec![0u16; (w * h * 3) as usize];
        input[..3].copy_from_slice(&[36, 72, 108]);
        assert_eq!(local_mean(&input, w, h, 0, 0), [9.0, 18.0, 27.0]);
        assert_eq!(local_mean(&input, w, h, 1, 0), [6.0, 12.0, 18.0]);
        assert_eq!(local_mean(&input, w, h, 1, 1), [4.0, 8.0, 12.0]);
    }

    #[test]
    fn constant_frame_has_constant_local_mean() {
        let (w, h) = (6, 5);
        let input = vec![12_345u16; (w * h * 3) as usize];
        for y in 0..h {
            for x in 0..w {
                assert_eq!(local_mean(&input, w, h, x, y), [12_345.0; 3]);
            }
        }

        // Sharpen term vanishes everywhere: strong sharpening only dithers.
        let p = params(2.0, 1.0, 9);
        let out = run(&input, w, h, &p);
        for y in 0..h {
            for x in 0..w {
                let jitter = dither_jitter(p.seed, y * w + x);
                let expected = store_sample(12_345.0 + jitter);
                let idx = ((y * w + x) * 3) as usize;
                assert_eq!(&out[idx..idx + 3], &[expected; 3]);
            }
        }
    }

    #[test]
    fn local_mean_averages_only_in_bounds_neighbours() {
        let (w, h) = (3, 3);
        let mut input = vec![0u16; 27];
        // Red channel holds the pixel's linear index.
        for i in 0..9 {
            input[i * 3] = i as u16;
        }
        // Corner (0,0): pixels 0,1,3,4.
        assert_eq!(local_mean(&input, w, h, 0, 0)[0], 8.0 / 4.0);
        // Edge (1,0): pixels 0,1,2,3,4,5.
        assert_eq!(local_mean(&input, w, h, 1, 0)[0], 15.0 / 6.0);
        // Centre: all nine.
        assert_eq!(local_mean(&input, w, h, 1, 1)[0], 36.0 / 9.0);
    }

    #[test]
    fn identity_settings_only_add_bounded_jitter() {
        let (w, h) = (7, 5);
        let input = gradient(w, h);
        let out = run(&input, w, h, &params(0.0, 1.0, 4));
        for (i, (&a, &b)) in input.iter().zip(&out).enumerate() {
            // Skip samples where the top-end store wrap can apply.
            if a > 65_530 {
                continue;
            }
            let diff = (b as i32 - a as i32).abs();
            assert!(diff <= 4, "sample {i}: in={a} out={b}");
        }
    }

    #[test]
    fn same_frame_index_is_bit_identical() {
        let (w, h) = (9, 7);
        let input = gradient(w, h);
        let settings = EnhanceSettings::default();
        let a = run(&input, w, h, &settings.kernel_params(42));
        let b = run(&input, w, h, &settings.kernel_params(42));
        assert_eq!(a, b);
    }

    #[test]
    fn different_frame_indices_change_dither() {
        let (w, h) = (4, 4);
        let input = vec![32_768u16; 48];
        let settings = EnhanceSettings::default();
        let a = run(&input, w, h, &settings.kernel_params(0));
        let b = run(&input, w, h, &settings.kernel_params(1));
        assert_ne!(a, b);
    }

    #[test]
    fn black_frame_with_strong_contrast_stays_in_range() {
        let (w, h) = (8, 8);
        let input = vec![0u16; (w * h * 3) as usize];
        let out = run(&input, w, h, &params(0.8, 2.0, 3));
        // Clamped to 0 before dithering; negative jitter saturates at 0.
        assert!(out.iter().all(|&v| v <= 4), "{out:?}");
    }

    #[test]
    fn white_frame_overflow_wraps_in_store() {
        let (w, h) = (4, 4);
        let input = vec![u16::MAX; 48];
        let p = params(0.0, 1.0, 1);
        let out = run(&input, w, h, &p);
        for linear in 0..w * h {
            let jitter = dither_jitter(p.seed, linear);
            let expected = ((65_535.0f32 + jitter + 0.5) as u32) as u16;
            let idx = (linear * 3) as usize;
            assert_eq!(out[idx], expected);
            if jitter >= 0.5 {
                assert!(out[idx] < 16, "expected wrap for jitter {jitter}");
            }
        }
    }

    #[test]
    fn jitter_spans_documented_range() {
        assert_eq!(dither_jitter(0, 0), -4.0);
        for i in 0..10_000u32 {
            let j = dither_jitter(0xDEAD_BEEF, i);
            assert!((-4.0..=4.0).contains(&j));
        }
    }

    #[test]
    fn device_reuses_buffers_across_frames() {
        let format = FrameFormat::rgb48(5, 3, FrameRate::default()).expect("format");
        let geometry = LaunchGeometry::for_format(&format, 16).expect("geometry");
        let mut device = CpuReferenceDevice::new();
        device.allocate(&format).expect("allocate");

        let input = gradient(5, 3);
        let settings = EnhanceSettings::vivid();
        for frame_index in 0..3 {
            let p = settings.kernel_params(frame_index);
            let mut out = vec![0u16; input.len()];
            device.upload(&input).expect("upload");
            device.launch(&geometry, &p).expect("launch");
            device.download(&mut out).expect("download");
            assert_eq!(out, run(&input, 5, 3, &p));
        }
    }

    #[test]
    fn device_rejects_wrong_sized_frames() {
        let format = FrameFormat::rgb48(2, 2, FrameRate::default()).expect("format");
        let mut device = CpuReferenceDevice::new();
        assert!(device.upload(&[0; 12]).is_err(), "upload before allocate");
        device.allocate(&format).expect("allocate");
        assert!(matches!(
            device.upload(&[0; 11]),
            Err(EngineError::FormatMismatch { expected: 12, actual: 11 })
        ));
    }
}
