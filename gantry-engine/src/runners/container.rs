// Container Runner
// Starts, health-checks and removes sidecar service containers

use crate::pipeline::models::{PortMapping, SidecarSpec};

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;

/// Errors that can occur while managing sidecars
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SidecarError {
    #[error("container runtime '{0}' is not available")]
    RuntimeUnavailable(String),

    #[error("failed to start sidecar '{name}': {message}")]
    StartFailed { name: String, message: String },

    #[error("sidecar '{name}' was not healthy within {timeout:?}")]
    Timeout { name: String, timeout: Duration },

    #[error("failed to stop sidecar '{name}': {message}")]
    StopFailed { name: String, message: String },

    #[error("sidecar startup cancelled")]
    Cancelled,
}

/// Handle to a started sidecar
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SidecarHandle {
    /// Service name from the `SidecarSpec`
    pub name: String,
    /// Container name (unique per instance)
    pub container: String,
    /// Host the service is reachable on
    pub host: String,
    pub ports: Vec<PortMapping>,
}

/// Backend that actually runs sidecar services
#[async_trait::async_trait]
pub trait SidecarBackend: Send + Sync {
    async fn start(
        &self,
        instance_id: &str,
        spec: &SidecarSpec,
    ) -> Result<SidecarHandle, SidecarError>;

    /// Run the health check once; `true` means ready
    async fn is_healthy(&self, handle: &SidecarHandle, spec: &SidecarSpec) -> bool;

    async fn stop(&self, handle: &SidecarHandle) -> Result<(), SidecarError>;
}

/// Sidecar backend driving the docker CLI (or a compatible one such as podman)
#[derive(Debug, Clone)]
pub struct DockerBackend {
    binary: PathBuf,
}

static CONTAINER_SEQ: AtomicU64 = AtomicU64::new(0);

impl DockerBackend {
    /// Locate the runtime binary on PATH
    pub fn locate(runtime: &str) -> Result<Self, SidecarError> {
        which::which(runtime)
            .map(|binary| Self { binary })
            .map_err(|e| SidecarError::RuntimeUnavailable(format!("{}: {}", runtime, e)))
    }

    /// Arguments for `docker run` of a sidecar
    pub fn run_args(container: &str, spec: &SidecarSpec) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--rm".to_string(),
            "--name".to_string(),
            container.to_string(),
        ];

        for (key, value) in &spec.env {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }

        for port in &spec.ports {
            args.push("-p".to_string());
            args.push(format!("{}:{}", port.host, port.container));
        }

        args.push(spec.image_ref());
        args
    }

    async fn docker(&self, args: &[String]) -> std::io::Result<std::process::Output> {
        Command::new(&self.binary)
            .args(args)
            .stdin(std::process::Stdio::null())
            .output()
            .await
    }
}

/// Container name unique per instance and process
pub fn container_name(instance_id: &str, service: &str) -> String {
    let slug: String = format!("{}-{}", instance_id, service)
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    let seq = CONTAINER_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("gantry-{}-{}-{}", slug, std::process::id(), seq)
}

#[async_trait::async_trait]
impl SidecarBackend for DockerBackend {
    async fn start(
        &self,
        instance_id: &str,
        spec: &SidecarSpec,
    ) -> Result<SidecarHandle, SidecarError> {
        let container = container_name(instance_id, &spec.name);
        let args = Self::run_args(&container, spec);

        let output = self
            .docker(&args)
            .await
            .map_err(|e| SidecarError::RuntimeUnavailable(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SidecarError::StartFailed {
                name: spec.name.clone(),
                message: stderr.trim().to_string(),
            });
        }

        Ok(SidecarHandle {
            name: spec.name.clone(),
            container,
            host: "127.0.0.1".to_string(),
            ports: spec.ports.clone(),
        })
    }

    async fn is_healthy(&self, handle: &SidecarHandle, spec: &SidecarSpec) -> bool {
        let args: Vec<String> = match &spec.health_check {
            Some(check) => vec![
                "exec".to_string(),
                handle.container.clone(),
                "sh".to_string(),
                "-c".to_string(),
                check.clone(),
            ],
            // Without a health check, a running container counts as ready
            None => vec![
                "inspect".to_string(),
                "--format".to_string(),
                "{{.State.Running}}".to_string(),
                handle.container.clone(),
            ],
        };

        match self.docker(&args).await {
            Ok(output) if spec.health_check.is_some() => output.status.success(),
            Ok(output) => {
                output.status.success() && String::from_utf8_lossy(&output.stdout).trim() == "true"
            }
            Err(_) => false,
        }
    }

    async fn stop(&self, handle: &SidecarHandle) -> Result<(), SidecarError> {
        let args = vec![
            "rm".to_string(),
            "-f".to_string(),
            handle.container.clone(),
        ];

        let output = self.docker(&args).await.map_err(|e| SidecarError::StopFailed {
            name: handle.name.clone(),
            message: e.to_string(),
        })?;

        if !output.status.success() {
            return Err(SidecarError::StopFailed {
                name: handle.name.clone(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_args() {
        let mut spec = SidecarSpec::new("redis", "redis")
            .with_version("7")
            .with_port(PortMapping::new(16379, 6379));
        spec.env
            .insert("REDIS_ARGS".to_string(), "--save ''".to_string());

        let args = DockerBackend::run_args("gantry-test-redis", &spec);

        assert_eq!(&args[..5], &["run", "-d", "--rm", "--name", "gantry-test-redis"]);
        assert!(args.contains(&"REDIS_ARGS=--save ''".to_string()));
        assert!(args.contains(&"16379:6379".to_string()));
        assert_eq!(args.last(), Some(&"redis:7".to_string()));
    }

    #[test]
    fn test_container_names_are_unique() {
        let a = container_name("test (python=3.8, os=linux)", "redis");
        let b = container_name("test (python=3.8, os=linux)", "redis");

        assert_ne!(a, b);
        assert!(a.starts_with("gantry-test-python-3-8-os-linux-redis-"));
        assert!(a
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-'));
    }

    #[test]
    fn test_locate_missing_runtime() {
        let err = DockerBackend::locate("gantry-no-such-runtime").unwrap_err();
        assert!(matches!(err, SidecarError::RuntimeUnavailable(_)));
    }
}
