#![doc = include_str!("../README.md")]

pub mod enhancer;
pub mod pipeline;
pub mod runtime;
pub mod sink;
pub mod source;

pub use enhancer::DeviceEnhancer;
pub use pipeline::{EnhancePipeline, PipelineConfig, PipelineMetrics, PipelineReport};
pub use sink::FrameSink;
pub use source::FrameSource;
