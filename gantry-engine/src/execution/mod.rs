// Execution Engine Module
// Matrix expansion, DAG construction, scheduling and instance execution

pub mod events;
pub mod executor;
pub mod graph;
pub mod matrix;
pub mod runner;
pub mod scheduler;
pub mod sidecar;
pub mod status;

// Re-export key types
pub use events::{progress_channel, ExecutionEvent, LogLevel, ProgressReceiver, ProgressSender};
pub use executor::PipelineExecutor;
pub use graph::{ExecutionGraph, ExecutionPlan, GraphError, JobNode, PlannedJob};
pub use matrix::{JobInstance, MatrixExpander, Selection};
pub use runner::StepRunner;
pub use scheduler::{JobScheduler, RunOutcome};
pub use sidecar::{SidecarGuard, SidecarManager};
pub use status::{StatusTable, TransitionError};
