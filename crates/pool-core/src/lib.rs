#![forbid(unsafe_code)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]

//! Shared configuration and path resolution for the OCR pool service.

pub mod config;
pub mod paths;

pub use config::{ModelConfig, PoolConfig, PreprocessConfig, ScalingConfig};
