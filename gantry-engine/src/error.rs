// Engine errors
// Top-level error type for the public API

use crate::execution::graph::GraphError;
use crate::parser::error::ConfigError;

use thiserror::Error;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed configuration; nothing ran
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Cycle, unknown dependency or bad job selection; nothing ran
    #[error(transparent)]
    Graph(#[from] GraphError),

    /// The run finished but at least one job failed
    #[error("{failed} job(s) failed: {summary}")]
    StepFailure { failed: usize, summary: String },

    #[error("run cancelled")]
    Cancelled,
}

impl EngineError {
    /// Process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            EngineError::Config(_) | EngineError::Graph(_) => 2,
            EngineError::Cancelled => 130,
            _ => 1,
        }
    }
}
