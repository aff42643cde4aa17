//! Host frame types and the raw frame format contract.
//!
//! # Wire layout
//!
//! Frames cross both byte channels as headerless `rgb48le`: row-major,
//! channel-interleaved `R G B` per pixel, one little-endian `u16` per sample.
//! Frame boundaries are implied solely by [`FrameFormat::frame_byte_size`].
//!
//! # Ownership model
//!
//! A [`Frame`] is exclusively owned by the stage currently processing it and is
//! moved, never shared, between stages.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

// ─── Frame rate ──────────────────────────────────────────────────────────────

/// Rational frame rate, e.g. `30000/1001`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameRate {
    pub num: u32,
    pub den: u32,
}

impl FrameRate {
    pub const fn new(num: u32, den: u32) -> Self {
        Self { num, den }
    }

    /// `true` when both terms are non-zero.
    pub const fn is_valid(self) -> bool {
        self.num > 0 && self.den > 0
    }

    pub fn as_f64(self) -> f64 {
        if self.den == 0 {
            0.0
        } else {
            self.num as f64 / self.den as f64
        }
    }
}

impl Default for FrameRate {
    fn default() -> Self {
        Self::new(30, 1)
    }
}

impl fmt::Display for FrameRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}

impl FromStr for FrameRate {
    type Err = EngineError;

    /// Accepts `num/den`, a bare integer, or a decimal such as `29.97`.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let invalid = || EngineError::Config(format!("Invalid frame rate '{s}'"));
        if let Some((num, den)) = s.split_once('/') {
            let num = num.trim().parse::<u32>().map_err(|_| invalid())?;
            let den = den.trim().parse::<u32>().map_err(|_| invalid())?;
            return Ok(Self::new(num, den));
        }
        if let Ok(whole) = s.parse::<u32>() {
            return Ok(Self::new(whole, 1));
        }
        let value = s.parse::<f64>().map_err(|_| invalid())?;
        if !(value.is_finite() && value > 0.0) {
            return Err(invalid());
        }
        Ok(Self::new((value * 1000.0).round() as u32, 1000))
    }
}

// ─── Frame format ────────────────────────────────────────────────────────────

/// Immutable per-run description of the raw frame stream.
///
/// Derived once, before the pipeline starts, from probed source metadata.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct FrameFormat {
    pub width: u32,
    pub height: u32,
    pub frame_rate: FrameRate,
    pub channels: u32,
    pub bytes_per_sample: u32,
}

impl FrameFormat {
    /// Channels per pixel of the `rgb48le` layout.
    pub const CHANNELS: u32 = 3;
    /// Bytes per sample of the `rgb48le` layout.
    pub const BYTES_PER_SAMPLE: u32 = 2;
    /// FFmpeg name of the raw pixel format carried on both channels.
    pub const PIX_FMT: &'static str = "rgb48le";

    /// 16-bit interleaved RGB format. Rejects empty frames.
    pub fn rgb48(width: u32, height: u32, frame_rate: FrameRate) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(EngineError::Config(format!(
                "Frame dimensions must be non-zero, got {width}x{height}"
            )));
        }
        if !frame_rate.is_valid() {
            return Err(EngineError::Config(format!(
                "Frame rate must be positive, got {frame_rate}"
            )));
        }
        let format = Self {
            width,
            height,
            frame_rate,
            channels: Self::CHANNELS,
            bytes_per_sample: Self::BYTES_PER_SAMPLE,
        };
        // Linear pixel indices are carried as 32-bit values by the kernel.
        if format.pixel_count() > u32::MAX as usize {
            return Err(EngineError::Config(format!(
                "Frame {width}x{height} exceeds the addressable pixel count"
            )));
        }
        Ok(format)
    }

    #[inline]
    pub const fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    #[inline]
    pub const fn sample_count(&self) -> usize {
        self.pixel_count() * self.channels as usize
    }

    /// `width * height * channels * bytes_per_sample`.
    #[inline]
    pub const fn frame_byte_size(&self) -> usize {
        self.sample_count() * self.bytes_per_sample as usize
    }
}

impl fmt::Display for FrameFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}x{} {} @ {}",
            self.width,
            self.height,
            Self::PIX_FMT,
            self.frame_rate
        )
    }
}

// ─── Frame ───────────────────────────────────────────────────────────────────

/// One decoded image: `width * height * 3` samples in wire order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    /// Zero-based position in the stream. Feeds the dither seed.
    pub index: u64,
    pub samples: Vec<u16>,
}

impl Frame {
    pub fn new(index: u64, samples: Vec<u16>) -> Self {
        Self { index, samples }
    }

    /// Frame filled with one value in every channel.
    pub fn filled(index: u64, format: &FrameFormat, value: u16) -> Self {
        Self::new(index, vec![value; format.sample_count()])
    }

    /// Decode a little-endian wire buffer. `bytes.len()` must be even.
    pub fn from_le_bytes(index: u64, bytes: &[u8]) -> Self {
        let samples = bytes
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        Self::new(index, samples)
    }

    /// Encode into `out` in little-endian wire order, replacing its contents.
    pub fn write_le_bytes(&self, out: &mut Vec<u8>) {
        out.clear();
        out.reserve(self.samples.len() * 2);
        for sample in &self.samples {
            out.extend_from_slice(&sample.to_le_bytes());
        }
    }
}

// ─── Pipeline state ──────────────────────────────────────────────────────────

/// Driver lifecycle: `Running -> Draining -> Stopped`, or `Running -> Stopped`
/// on a fatal error.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelinePhase {
    Running,
    Draining,
    Stopped,
}

/// Process-wide run counters, owned by the driver for the length of one run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PipelineState {
    pub phase: PipelinePhase,
    pub frames_read: u64,
    pub frames_written: u64,
    pub last_error: Option<String>,
}

/// Termination record of one external process.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ProcessExit {
    pub name: String,
    /// Exit code, `None` when terminated by a signal.
    pub code: Option<i32>,
    pub success: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_byte_size_matches_rgb48() {
        let format = FrameFormat::rgb48(4, 3, FrameRate::new(25, 1)).expect("format");
        assert_eq!(format.pixel_count(), 12);
        assert_eq!(format.sample_count(), 36);
        assert_eq!(format.frame_byte_size(), 72);
    }

    #[test]
    fn rgb48_rejects_empty_dimensions() {
        assert!(FrameFormat::rgb48(0, 10, FrameRate::default()).is_err());
        assert!(FrameFormat::rgb48(10, 0, FrameRate::default()).is_err());
        assert!(FrameFormat::rgb48(10, 10, FrameRate::new(0, 1)).is_err());
    }

    #[test]
    fn frame_rate_parses_ffprobe_forms() {
        assert_eq!("30000/1001".parse::<FrameRate>().unwrap(), FrameRate::new(30000, 1001));
        assert_eq!("24".parse::<FrameRate>().unwrap(), FrameRate::new(24, 1));
        assert_eq!("29.97".parse::<FrameRate>().unwrap(), FrameRate::new(29970, 1000));
        assert!("abc".parse::<FrameRate>().is_err());
        assert!("-5.0".parse::<FrameRate>().is_err());
    }

    #[test]
    fn wire_order_is_little_endian() {
        let frame = Frame::new(0, vec![0x0102, 0xA0B0]);
        let mut bytes = Vec::new();
        frame.write_le_bytes(&mut bytes);
        assert_eq!(bytes, vec![0x02, 0x01, 0xB0, 0xA0]);
        assert_eq!(Frame::from_le_bytes(0, &bytes), frame);
    }
}
