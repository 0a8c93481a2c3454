// Pipeline Module
// Domain types for job graphs and their execution results

pub mod models;

pub use models::{
    ExcludeRule, IncludeEntry, InstanceResult, InstanceStatus, JobGraph, JobResult, JobStatus,
    JobTemplate, MatrixAxis, MatrixSpec, PortMapping, SidecarSpec, StepDefinition, StepOutcome,
    StepStatus,
};
