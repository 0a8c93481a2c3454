// Pipeline Models
// Strongly-typed job graph produced by the loader, plus execution status and result types

use crate::runners::shell::Shell;

use serde::{Serialize, Serializer};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Default readiness timeout for sidecars that do not declare one
pub const DEFAULT_READINESS_TIMEOUT: Duration = Duration::from_secs(60);

/// A fully loaded job graph (immutable after load)
#[derive(Debug, Clone, Default)]
pub struct JobGraph {
    /// Display name of the run
    pub name: String,
    /// Run-level environment, applied to every instance
    pub env: BTreeMap<String, String>,
    /// Job templates in declaration order
    pub jobs: Vec<JobTemplate>,
    /// Directory the configuration was loaded from
    pub source_dir: PathBuf,
}

impl JobGraph {
    /// Create an empty graph with the given name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Add a job template (builder style)
    pub fn with_job(mut self, job: JobTemplate) -> Self {
        self.jobs.push(job);
        self
    }

    /// Look up a job template by id
    pub fn get(&self, id: &str) -> Option<&JobTemplate> {
        self.jobs.iter().find(|job| job.id == id)
    }

    /// Whether any job needs sidecar services
    pub fn uses_sidecars(&self) -> bool {
        self.jobs.iter().any(|job| !job.sidecars.is_empty())
    }
}

/// A named unit of work, possibly expanded into several instances by a matrix
#[derive(Debug, Clone, PartialEq)]
pub struct JobTemplate {
    pub id: String,
    pub display_name: Option<String>,
    pub steps: Vec<StepDefinition>,
    pub matrix: Option<MatrixSpec>,
    /// Ids of jobs that must succeed before this one becomes ready
    pub needs: Vec<String>,
    pub sidecars: Vec<SidecarSpec>,
    pub env: BTreeMap<String, String>,
    /// Cancel sibling instances once one of them fails
    pub fail_fast: bool,
    /// Upper bound on concurrently running instances of this job
    pub max_parallel: Option<usize>,
    /// Start each workspace with a copy of the project source
    pub checkout: bool,
}

impl JobTemplate {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: None,
            steps: Vec::new(),
            matrix: None,
            needs: Vec::new(),
            sidecars: Vec::new(),
            env: BTreeMap::new(),
            fail_fast: false,
            max_parallel: None,
            checkout: false,
        }
    }

    pub fn with_step(mut self, step: StepDefinition) -> Self {
        self.steps.push(step);
        self
    }

    pub fn with_needs<I, S>(mut self, needs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.needs.extend(needs.into_iter().map(Into::into));
        self
    }

    pub fn with_matrix(mut self, matrix: MatrixSpec) -> Self {
        self.matrix = Some(matrix);
        self
    }

    pub fn with_sidecar(mut self, sidecar: SidecarSpec) -> Self {
        self.sidecars.push(sidecar);
        self
    }

    pub fn with_env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(name.into(), value.into());
        self
    }

    pub fn with_checkout(mut self, checkout: bool) -> Self {
        self.checkout = checkout;
        self
    }

    /// Label used in output: display name if present, id otherwise
    pub fn label(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.id)
    }
}

/// Matrix declaration on a job template
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MatrixSpec {
    /// Axes in declaration order
    pub axes: Vec<MatrixAxis>,
    pub exclude: Vec<ExcludeRule>,
    pub include: Vec<IncludeEntry>,
}

impl MatrixSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn axis<I, S>(mut self, name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.axes.push(MatrixAxis {
            name: name.into(),
            values: values.into_iter().map(Into::into).collect(),
        });
        self
    }

    pub fn exclude<I, K, V>(mut self, entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.exclude.push(ExcludeRule {
            entries: entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        });
        self
    }

    pub fn include<I, K, V>(mut self, entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.include.push(IncludeEntry {
            entries: entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        });
        self
    }

    pub fn get_axis(&self, name: &str) -> Option<&MatrixAxis> {
        self.axes.iter().find(|axis| axis.name == name)
    }

    /// Whether a selection is removed by any exclude rule
    pub fn is_excluded(&self, selection: &[(String, String)]) -> bool {
        self.exclude.iter().any(|rule| rule.matches(selection))
    }
}

/// One matrix dimension with its ordered values
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatrixAxis {
    pub name: String,
    pub values: Vec<String>,
}

/// Partial assignment; a combination matching every entry is excluded
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExcludeRule {
    pub entries: BTreeMap<String, String>,
}

impl ExcludeRule {
    pub fn matches(&self, selection: &[(String, String)]) -> bool {
        self.entries.iter().all(|(axis, value)| {
            selection
                .iter()
                .any(|(name, selected)| name == axis && selected == value)
        })
    }
}

/// Extra combination appended after the product
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IncludeEntry {
    /// Assignments in declaration order
    pub entries: Vec<(String, String)>,
}

/// One external command invocation within a job
#[derive(Debug, Clone, PartialEq)]
pub struct StepDefinition {
    pub name: String,
    pub command: String,
    pub shell: Shell,
    /// Relative paths resolve against the instance workspace
    pub working_directory: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    pub continue_on_error: bool,
    pub timeout: Option<Duration>,
}

impl StepDefinition {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            shell: Shell::default(),
            working_directory: None,
            env: BTreeMap::new(),
            continue_on_error: false,
            timeout: None,
        }
    }

    pub fn continue_on_error(mut self, value: bool) -> Self {
        self.continue_on_error = value;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(name.into(), value.into());
        self
    }

    pub fn with_working_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }
}

/// Auxiliary network service required by a job instance
#[derive(Debug, Clone, PartialEq)]
pub struct SidecarSpec {
    /// Service name, also used for connection environment variables
    pub name: String,
    pub image: String,
    pub version: Option<String>,
    pub ports: Vec<PortMapping>,
    /// Command run inside the service; exit code 0 means ready
    pub health_check: Option<String>,
    pub readiness_timeout: Duration,
    pub env: BTreeMap<String, String>,
}

impl SidecarSpec {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            version: None,
            ports: Vec::new(),
            health_check: None,
            readiness_timeout: DEFAULT_READINESS_TIMEOUT,
            env: BTreeMap::new(),
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn with_port(mut self, port: PortMapping) -> Self {
        self.ports.push(port);
        self
    }

    pub fn with_health_check(mut self, command: impl Into<String>) -> Self {
        self.health_check = Some(command.into());
        self
    }

    pub fn with_readiness_timeout(mut self, timeout: Duration) -> Self {
        self.readiness_timeout = timeout;
        self
    }

    /// Full image reference (`image:version` when a version is set)
    pub fn image_ref(&self) -> String {
        match &self.version {
            Some(version) => format!("{}:{}", self.image, version),
            None => self.image.clone(),
        }
    }
}

/// Host port -> container port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortMapping {
    pub host: u16,
    pub container: u16,
}

impl PortMapping {
    pub fn new(host: u16, container: u16) -> Self {
        Self { host, container }
    }

    /// Parse `"6379"` or `"16379:6379"`
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        match value.split_once(':') {
            Some((host, container)) => Some(Self {
                host: host.trim().parse().ok()?,
                container: container.trim().parse().ok()?,
            }),
            None => {
                let port = value.parse().ok()?;
                Some(Self {
                    host: port,
                    container: port,
                })
            }
        }
    }
}

/// Per-job scheduler state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Ready,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Skipped
        )
    }

    /// Edges of the job state machine
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::{Failed, Pending, Ready, Running, Skipped, Succeeded};
        matches!(
            (self, next),
            (Pending, Ready)
                | (Pending, Skipped)
                | (Ready, Running)
                | (Ready, Skipped)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Skipped)
        )
    }
}

/// Per-instance execution state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl InstanceStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            InstanceStatus::Succeeded | InstanceStatus::Failed | InstanceStatus::Skipped
        )
    }

    pub fn can_transition_to(self, next: InstanceStatus) -> bool {
        match self {
            InstanceStatus::Pending => next != InstanceStatus::Pending,
            InstanceStatus::Running => next.is_terminal(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Succeeded,
    Failed,
    Skipped,
}

/// Outcome of a single step
#[derive(Debug, Clone, Serialize)]
pub struct StepOutcome {
    pub name: String,
    pub status: StepStatus,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    #[serde(serialize_with = "serialize_duration")]
    pub duration: Duration,
    /// Why the step failed or was skipped, when not obvious from the exit code
    pub error: Option<String>,
    pub timed_out: bool,
}

impl StepOutcome {
    pub fn skipped(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: StepStatus::Skipped,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            duration: Duration::ZERO,
            error: Some(reason.into()),
            timed_out: false,
        }
    }

    /// Short human-readable description of a failure
    pub fn failure_reason(&self) -> String {
        if self.timed_out {
            format!("step '{}' timed out", self.name)
        } else if let Some(code) = self.exit_code {
            format!("step '{}' exited with code {}", self.name, code)
        } else if let Some(error) = &self.error {
            format!("step '{}' failed: {}", self.name, error)
        } else {
            format!("step '{}' failed", self.name)
        }
    }
}

/// Execution result of one job instance
#[derive(Debug, Clone, Serialize)]
pub struct InstanceResult {
    pub instance_id: String,
    pub job_id: String,
    pub selection: Vec<(String, String)>,
    pub status: InstanceStatus,
    pub steps: Vec<StepOutcome>,
    #[serde(serialize_with = "serialize_duration")]
    pub duration: Duration,
    /// Instance-level reason (sidecar failure, cancellation, skipped dependency)
    pub reason: Option<String>,
}

impl InstanceResult {
    pub fn pending(
        instance_id: impl Into<String>,
        job_id: impl Into<String>,
        selection: Vec<(String, String)>,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            job_id: job_id.into(),
            selection,
            status: InstanceStatus::Pending,
            steps: Vec::new(),
            duration: Duration::ZERO,
            reason: None,
        }
    }

    /// Move to `next` if the transition is legal; terminal states never change
    pub fn transition(&mut self, next: InstanceStatus) -> bool {
        if self.status.can_transition_to(next) {
            self.status = next;
            true
        } else {
            false
        }
    }

    pub fn failed_steps(&self) -> impl Iterator<Item = &StepOutcome> {
        self.steps
            .iter()
            .filter(|step| step.status == StepStatus::Failed)
    }
}

/// Aggregated result of a job across all of its instances
#[derive(Debug, Clone, Serialize)]
pub struct JobResult {
    pub job_id: String,
    pub status: JobStatus,
    pub instances: Vec<InstanceResult>,
    pub skip_reason: Option<String>,
    #[serde(serialize_with = "serialize_duration")]
    pub duration: Duration,
}

impl JobResult {
    /// Job status implied by its instances: any Failed fails the job,
    /// all Succeeded succeeds it, anything else (cancelled) is Skipped
    pub fn status_from_instances(instances: &[InstanceResult]) -> JobStatus {
        if instances
            .iter()
            .any(|i| i.status == InstanceStatus::Failed)
        {
            JobStatus::Failed
        } else if instances
            .iter()
            .all(|i| i.status == InstanceStatus::Succeeded)
        {
            JobStatus::Succeeded
        } else {
            JobStatus::Skipped
        }
    }
}

pub(crate) fn serialize_duration<S: Serializer>(
    duration: &Duration,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(duration.as_secs_f64())
}
