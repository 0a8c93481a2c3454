// Pipeline Loader
// Parses the YAML configuration and lowers it into a validated JobGraph

use crate::execution::matrix::MatrixExpander;
use crate::parser::error::{ConfigError, ConfigErrorKind};
use crate::parser::models::{RawJob, RawPipeline, RawScalar, RawService, RawStep};
use crate::pipeline::models::{
    ExcludeRule, IncludeEntry, JobGraph, JobTemplate, MatrixAxis, MatrixSpec, PortMapping,
    SidecarSpec, StepDefinition,
};
use crate::runners::shell::Shell;

use serde_yaml::{Mapping, Value};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file name
pub const DEFAULT_CONFIG_FILE: &str = "gantry.yml";

/// Loader for job graph configuration files
pub struct PipelineLoader;

impl PipelineLoader {
    /// Load and validate a configuration file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<JobGraph, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::io(path, &e))?;

        let source_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let source_dir = source_dir.canonicalize().unwrap_or(source_dir);

        Self::parse(&content, source_dir)
    }

    /// Parse and validate configuration from a YAML string
    pub fn parse(content: &str, source_dir: impl Into<PathBuf>) -> Result<JobGraph, ConfigError> {
        let raw: RawPipeline =
            serde_yaml::from_str(content).map_err(|e| ConfigError::from_yaml_error(&e, content))?;

        let graph = Self::lower(raw, source_dir.into())?;
        Self::validate(&graph)?;

        tracing::debug!(
            pipeline = %graph.name,
            jobs = graph.jobs.len(),
            "loaded job graph"
        );
        Ok(graph)
    }

    /// Semantic checks on a lowered graph; cycles are detected when the
    /// execution graph is built
    pub fn validate(graph: &JobGraph) -> Result<(), ConfigError> {
        if graph.jobs.is_empty() {
            return Err(ConfigError::new(
                ConfigErrorKind::InvalidSchema,
                "configuration declares no jobs",
            )
            .at("jobs")
            .with_suggestion("add at least one job under 'jobs:'"));
        }

        let ids: HashSet<&str> = graph.jobs.iter().map(|job| job.id.as_str()).collect();

        for job in &graph.jobs {
            let path = format!("jobs.{}", job.id);

            if job.steps.is_empty() {
                return Err(ConfigError::new(
                    ConfigErrorKind::InvalidSchema,
                    format!("job '{}' has no steps", job.id),
                )
                .at(path));
            }

            for dependency in &job.needs {
                if !ids.contains(dependency.as_str()) {
                    return Err(ConfigError::unknown_dependency(&job.id, dependency));
                }
            }

            if job.max_parallel == Some(0) {
                return Err(ConfigError::invalid_value("max-parallel must be at least 1")
                    .at(format!("{}.strategy.max-parallel", path)));
            }

            let mut names = HashSet::new();
            for (index, step) in job.steps.iter().enumerate() {
                let step_path = format!("{}.steps[{}]", path, index);
                if step.command.trim().is_empty() {
                    return Err(ConfigError::invalid_value("step command is empty").at(step_path));
                }
                if step.name.trim().is_empty() {
                    return Err(ConfigError::invalid_value("step name is empty").at(step_path));
                }
                if !names.insert(step.name.as_str()) {
                    return Err(ConfigError::invalid_value(format!(
                        "duplicate step name '{}' in job '{}'",
                        step.name, job.id
                    ))
                    .at(step_path));
                }
            }

            MatrixExpander::validate(job)?;
        }

        Ok(())
    }

    fn lower(raw: RawPipeline, source_dir: PathBuf) -> Result<JobGraph, ConfigError> {
        let mut graph = JobGraph::new(raw.name.unwrap_or_else(|| "pipeline".to_string()));
        graph.env = scalars_to_strings(raw.env);
        graph.source_dir = source_dir;

        for (key, value) in raw.jobs {
            let id = key_to_string(&key, "jobs")?;
            let path = format!("jobs.{}", id);
            if id.trim().is_empty() {
                return Err(ConfigError::invalid_value("job id is empty").at("jobs"));
            }

            let job: RawJob =
                serde_yaml::from_value(value).map_err(|e| ConfigError::from_value_error(&e, &path))?;
            graph.jobs.push(Self::lower_job(id, job, &path)?);
        }

        Ok(graph)
    }

    fn lower_job(id: String, raw: RawJob, path: &str) -> Result<JobTemplate, ConfigError> {
        let mut job = JobTemplate::new(id);
        job.display_name = raw.name;
        job.needs = raw.needs.to_vec();
        job.env = scalars_to_strings(raw.env);
        job.checkout = raw.checkout;

        if let Some(strategy) = raw.strategy {
            job.fail_fast = strategy.fail_fast.unwrap_or(false);
            job.max_parallel = strategy.max_parallel;
            if let Some(matrix) = strategy.matrix {
                job.matrix = Some(lower_matrix(matrix, &format!("{}.strategy.matrix", path))?);
            }
        }

        for (key, value) in raw.services {
            let name = key_to_string(&key, &format!("{}.services", path))?;
            let service_path = format!("{}.services.{}", path, name);
            let service: RawService = serde_yaml::from_value(value)
                .map_err(|e| ConfigError::from_value_error(&e, &service_path))?;
            job.sidecars.push(lower_service(name, service, &service_path)?);
        }

        for (index, step) in raw.steps.into_iter().enumerate() {
            let step_path = format!("{}.steps[{}]", path, index);
            job.steps.push(lower_step(step, &step_path)?);
        }

        Ok(job)
    }
}

fn lower_step(raw: RawStep, path: &str) -> Result<StepDefinition, ConfigError> {
    let name = raw.name.unwrap_or_else(|| default_step_name(&raw.run));
    let mut step = StepDefinition::new(name, raw.run);

    if let Some(shell) = raw.shell {
        step.shell = shell
            .parse::<Shell>()
            .map_err(|e| ConfigError::invalid_value(e).at(format!("{}.shell", path)))?;
    }

    step.working_directory = raw.working_directory.map(PathBuf::from);
    step.env = scalars_to_strings(raw.env);
    step.continue_on_error = raw.continue_on_error;

    if let Some(minutes) = raw.timeout_minutes {
        if !minutes.is_finite() || minutes <= 0.0 {
            return Err(ConfigError::invalid_value(format!(
                "timeout-minutes must be positive, got {}",
                minutes
            ))
            .at(format!("{}.timeout-minutes", path)));
        }
        let timeout = Duration::try_from_secs_f64(minutes * 60.0).map_err(|_| {
            ConfigError::invalid_value(format!("timeout-minutes {} is too large", minutes))
                .at(format!("{}.timeout-minutes", path))
        })?;
        step.timeout = Some(timeout);
    }

    Ok(step)
}

fn lower_service(name: String, raw: RawService, path: &str) -> Result<SidecarSpec, ConfigError> {
    if raw.image.trim().is_empty() {
        return Err(ConfigError::invalid_value("service image is empty").at(path));
    }

    let mut sidecar = SidecarSpec::new(name, raw.image);
    sidecar.version = raw.version.map(|v| v.to_string());
    sidecar.health_check = raw.health_check;
    sidecar.env = scalars_to_strings(raw.env);

    if let Some(seconds) = raw.readiness_timeout_seconds {
        if seconds == 0 {
            return Err(ConfigError::invalid_value("readiness-timeout-seconds must be positive")
                .at(format!("{}.readiness-timeout-seconds", path)));
        }
        sidecar.readiness_timeout = Duration::from_secs(seconds);
    }

    for port in raw.ports {
        let text = port.to_string();
        let mapping = PortMapping::parse(&text).ok_or_else(|| {
            ConfigError::invalid_value(format!(
                "invalid port mapping '{}', expected 'PORT' or 'HOST:CONTAINER'",
                text
            ))
            .at(format!("{}.ports", path))
        })?;
        sidecar.ports.push(mapping);
    }

    Ok(sidecar)
}

fn lower_matrix(raw: Mapping, path: &str) -> Result<MatrixSpec, ConfigError> {
    let mut matrix = MatrixSpec::new();

    for (key, value) in raw {
        let name = key_to_string(&key, path)?;
        match name.as_str() {
            "exclude" => {
                for entry in assignments(value, &format!("{}.exclude", path))? {
                    matrix.exclude.push(ExcludeRule {
                        entries: entry.into_iter().collect(),
                    });
                }
            }
            "include" => {
                for entry in assignments(value, &format!("{}.include", path))? {
                    matrix.include.push(IncludeEntry { entries: entry });
                }
            }
            _ => {
                let axis_path = format!("{}.{}", path, name);
                let Value::Sequence(items) = value else {
                    return Err(ConfigError::invalid_matrix(format!(
                        "axis '{}' must be a list of values",
                        name
                    ))
                    .at(axis_path));
                };
                let values = items
                    .iter()
                    .map(|item| scalar_to_string(item, &axis_path))
                    .collect::<Result<Vec<_>, _>>()?;
                matrix.axes.push(MatrixAxis { name, values });
            }
        }
    }

    Ok(matrix)
}

/// A list of `{axis: value}` mappings, keeping the order inside each mapping
fn assignments(value: Value, path: &str) -> Result<Vec<Vec<(String, String)>>, ConfigError> {
    let Value::Sequence(items) = value else {
        return Err(ConfigError::invalid_matrix("expected a list of mappings").at(path));
    };

    items
        .into_iter()
        .map(|item| -> Result<Vec<(String, String)>, ConfigError> {
            let Value::Mapping(mapping) = item else {
                return Err(ConfigError::invalid_matrix("expected a mapping of axis to value").at(path));
            };
            mapping
                .iter()
                .map(|(k, v)| Ok((key_to_string(k, path)?, scalar_to_string(v, path)?)))
                .collect()
        })
        .collect()
}

fn key_to_string(key: &Value, path: &str) -> Result<String, ConfigError> {
    match RawScalar::from_value(key) {
        Some(scalar) => Ok(scalar.to_string()),
        None => Err(ConfigError::new(ConfigErrorKind::InvalidSchema, "keys must be scalars").at(path)),
    }
}

fn scalar_to_string(value: &Value, path: &str) -> Result<String, ConfigError> {
    RawScalar::from_value(value)
        .map(|scalar| scalar.to_string())
        .ok_or_else(|| ConfigError::invalid_value("expected a scalar value").at(path))
}

fn scalars_to_strings(values: BTreeMap<String, RawScalar>) -> BTreeMap<String, String> {
    values
        .into_iter()
        .map(|(key, value)| (key, value.to_string()))
        .collect()
}

/// `Run <first line of the command>`
fn default_step_name(command: &str) -> String {
    let first = command.lines().map(str::trim).find(|l| !l.is_empty()).unwrap_or("");
    format!("Run {}", first)
}
