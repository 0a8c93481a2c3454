// Parser module for job graph configuration
// Provides YAML parsing, lowering into typed models, and validation

pub mod error;
pub mod loader;
pub mod models;

pub use error::{ConfigError, ConfigErrorKind};
pub use loader::{PipelineLoader, DEFAULT_CONFIG_FILE};
