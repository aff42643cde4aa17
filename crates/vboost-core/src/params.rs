//! Enhancement tunables, per-frame kernel parameters, and launch geometry.

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::types::FrameFormat;

/// Multiplicative hashing constant for the per-frame dither seed.
pub const KNUTH_CONSTANT: u32 = 2_654_435_761;

/// Default square tile edge (threads per block along x and y).
pub const DEFAULT_TILE: u32 = 16;

/// Largest tile edge whose block still fits the 1024-thread launch limit.
pub const MAX_TILE: u32 = 32;

/// `(frame_index * KNUTH_CONSTANT) mod 2^32`.
///
/// Identical frame indices always yield identical seeds, so the dither
/// pattern of a frame is reproducible across runs and devices.
#[inline]
pub const fn dither_seed(frame_index: u64) -> u32 {
    frame_index.wrapping_mul(KNUTH_CONSTANT as u64) as u32
}

// ─── Run-level settings ──────────────────────────────────────────────────────

/// Run-time tunables for the enhancement filter.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EnhanceSettings {
    /// Unsharp-mask gain against the 3×3 local mean. Typical range `0.0..=2.0`.
    pub sharpen_strength: f32,
    /// Gain around mid-gray. Typical range `1.0..=1.5`.
    pub contrast_boost: f32,
    /// Square block edge used for the 2-D launch grid.
    pub tile: u32,
}

impl EnhanceSettings {
    /// Tuning of the streaming tool: stronger sharpening and contrast.
    pub const fn vivid() -> Self {
        Self {
            sharpen_strength: 1.15,
            contrast_boost: 1.35,
            tile: DEFAULT_TILE,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.sharpen_strength.is_finite() && self.sharpen_strength >= 0.0) {
            return Err(EngineError::Config(format!(
                "sharpen_strength must be finite and >= 0, got {}",
                self.sharpen_strength
            )));
        }
        if !(self.contrast_boost.is_finite() && self.contrast_boost > 0.0) {
            return Err(EngineError::Config(format!(
                "contrast_boost must be finite and > 0, got {}",
                self.contrast_boost
            )));
        }
        if self.tile == 0 || self.tile > MAX_TILE {
            return Err(EngineError::Config(format!(
                "tile must be in 1..={MAX_TILE}, got {}",
                self.tile
            )));
        }
        Ok(())
    }

    /// Parameters for the frame at `frame_index`.
    pub fn kernel_params(&self, frame_index: u64) -> KernelParams {
        KernelParams {
            sharpen_strength: self.sharpen_strength,
            contrast_boost: self.contrast_boost,
            seed: dither_seed(frame_index),
        }
    }
}

impl Default for EnhanceSettings {
    fn default() -> Self {
        Self {
            sharpen_strength: 0.8,
            contrast_boost: 1.05,
            tile: DEFAULT_TILE,
        }
    }
}

// ─── Per-frame parameters ────────────────────────────────────────────────────

/// Immutable parameters for one kernel launch.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct KernelParams {
    pub sharpen_strength: f32,
    pub contrast_boost: f32,
    pub seed: u32,
}

// ─── Launch geometry ─────────────────────────────────────────────────────────

/// 2-D launch configuration covering every pixel of a frame.
///
/// A pure function of the frame dimensions and the tile edge.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LaunchGeometry {
    pub width: u32,
    pub height: u32,
    pub block: (u32, u32, u32),
    pub grid: (u32, u32, u32),
}

impl LaunchGeometry {
    pub fn for_format(format: &FrameFormat, tile: u32) -> Result<Self> {
        if tile == 0 || tile > MAX_TILE {
            return Err(EngineError::Config(format!(
                "tile must be in 1..={MAX_TILE}, got {tile}"
            )));
        }
        Ok(Self {
            width: format.width,
            height: format.height,
            block: (tile, tile, 1),
            grid: (
                format.width.div_ceil(tile),
                format.height.div_ceil(tile),
                1,
            ),
        })
    }

    pub const fn threads_per_block(&self) -> u32 {
        self.block.0 * self.block.1 * self.block.2
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FrameRate;

    #[test]
    fn seed_matches_knuth_hash() {
        assert_eq!(dither_seed(0), 0);
        assert_eq!(dither_seed(1), 2_654_435_761);
        assert_eq!(dither_seed(2), (2u64 * 2_654_435_761 % (1u64 << 32)) as u32);
        assert_eq!(dither_seed(12345), dither_seed(12345));
        assert_ne!(dither_seed(1), dither_seed(2));
    }

    #[test]
    fn kernel_params_carry_settings_and_seed() {
        let settings = EnhanceSettings::default();
        let params = settings.kernel_params(3);
        assert_eq!(params.sharpen_strength, 0.8);
        assert_eq!(params.contrast_boost, 1.05);
        assert_eq!(params.seed, dither_seed(3));
    }

    #[test]
    fn validate_rejects_bad_values() {
        assert!(EnhanceSettings::default().validate().is_ok());
        assert!(EnhanceSettings::vivid().validate().is_ok());

        let bad = [
            EnhanceSettings { sharpen_strength: -0.1, ..Default::default() },
            EnhanceSettings { sharpen_strength: f32::NAN, ..Default::default() },
            EnhanceSettings { contrast_boost: 0.0, ..Default::default() },
            EnhanceSettings { contrast_boost: f32::INFINITY, ..Default::default() },
            EnhanceSettings { tile: 0, ..Default::default() },
            EnhanceSettings { tile: 33, ..Default::default() },
        ];
        for settings in bad {
            assert!(settings.validate().is_err(), "{settings:?} should be rejected");
        }
    }

    #[test]
    fn settings_deserialize_with_defaults() {
        let settings: EnhanceSettings =
            serde_json::from_str(r#"{"contrast_boost": 1.2}"#).expect("parse");
        assert_eq!(settings.sharpen_strength, 0.8);
        assert_eq!(settings.contrast_boost, 1.2);
        assert_eq!(settings.tile, DEFAULT_TILE);
    }

    #[test]
    fn grid_covers_every_pixel() {
        let format = FrameFormat::rgb48(1920, 1080, FrameRate::default()).expect("format");
        let geometry = LaunchGeometry::for_format(&format, 16).expect("geometry");
        assert_eq!(geometry.block, (16, 16, 1));
        assert_eq!(geometry.grid, (120, 68, 1));
        assert!(geometry.grid.0 * geometry.block.0 >= format.width);
        assert!(geometry.grid.1 * geometry.block.1 >= format.height);
        assert_eq!(geometry.threads_per_block(), 256);
    }
}
