//! Pixferry Core Library
//!
//! Shared domain models, error types, configuration, and hook traits used by
//! all pixferry components.

pub mod config;
pub mod error;
pub mod hooks;
pub mod models;

// Re-export commonly used types
pub use config::{
    CompressionPolicy, DedupePolicy, FeatureToggles, HashAlgorithm, ICloudPolicy, LoggingPolicy,
    PathLayout, PipelineConfig, PixelPolicy, RuntimePolicy, StagingPolicy, StorePolicy,
    VideoPreset,
};
pub use error::{PipelineError, PipelineResult};
pub use hooks::{NoOpNotifier, NoTwoFactorSource, Notifier, TwoFactorSource};
