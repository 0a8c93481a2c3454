// Gantry Engine Library
// Job graph parsing, matrix expansion, scheduling, sidecars and verdicts

pub mod error;
pub mod execution;
pub mod parser;
pub mod pipeline;
pub mod report;
pub mod runners;
pub mod settings;
pub mod utils;

// Re-export commonly used types
pub use error::{EngineError, EngineResult};

// Re-export parser types
pub use parser::{ConfigError, ConfigErrorKind, PipelineLoader, DEFAULT_CONFIG_FILE};

// Re-export domain types
pub use pipeline::{
    InstanceResult, InstanceStatus, JobGraph, JobResult, JobStatus, JobTemplate, MatrixSpec,
    SidecarSpec, StepDefinition, StepOutcome, StepStatus,
};

// Re-export execution types
pub use execution::{
    progress_channel, ExecutionEvent, ExecutionGraph, ExecutionPlan, GraphError, JobInstance,
    JobScheduler, LogLevel, MatrixExpander, PipelineExecutor, ProgressReceiver, ProgressSender,
    RunOutcome, SidecarManager, StepRunner,
};

// Re-export report types
pub use report::{Outcome, ReportFormat, ResultAggregator, SummaryReporter, Verdict};

// Re-export runner types
pub use runners::{CommandOutput, CommandRequest, CommandRunner, DockerBackend, ShellRunner};

pub use settings::EngineSettings;
