#![doc = include_str!("../README.md")]

pub mod channel;
pub mod device;
pub mod error;
pub mod params;
pub mod types;
