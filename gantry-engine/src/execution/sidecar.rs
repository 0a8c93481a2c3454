// Service Sidecar Manager
// Starts the sidecars of one instance, waits for readiness, and guarantees teardown

use super::events::{EventSender, ExecutionEvent, ProgressSender};
use super::matrix::env_key;
use crate::pipeline::models::SidecarSpec;
use crate::runners::container::{SidecarBackend, SidecarError, SidecarHandle};

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Starts and stops sidecars through a backend
#[derive(Clone)]
pub struct SidecarManager {
    backend: Option<Arc<dyn SidecarBackend>>,
    poll_interval: Duration,
    progress: Option<ProgressSender>,
}

impl SidecarManager {
    /// `backend` may be `None` when no job needs sidecars
    pub fn new(backend: Option<Arc<dyn SidecarBackend>>, poll_interval: Duration) -> Self {
        Self {
            backend,
            poll_interval,
            progress: None,
        }
    }

    pub fn with_progress(mut self, sender: ProgressSender) -> Self {
        self.progress = Some(sender);
        self
    }

    /// Start every sidecar and wait until each one is healthy.
    ///
    /// On any failure, sidecars already started are stopped before the error
    /// is returned.
    pub async fn acquire(
        &self,
        instance_id: &str,
        specs: &[SidecarSpec],
        cancel: &CancellationToken,
    ) -> Result<SidecarGuard, SidecarError> {
        let mut guard = SidecarGuard {
            instance_id: instance_id.to_string(),
            handles: Vec::new(),
            backend: self.backend.clone(),
            progress: self.progress.clone(),
        };

        if specs.is_empty() {
            return Ok(guard);
        }

        let Some(backend) = self.backend.clone() else {
            return Err(SidecarError::RuntimeUnavailable(
                "no container runtime configured".to_string(),
            ));
        };

        for spec in specs {
            if cancel.is_cancelled() {
                guard.release().await;
                return Err(SidecarError::Cancelled);
            }

            tracing::debug!(instance = instance_id, sidecar = %spec.name, image = %spec.image_ref(), "starting sidecar");
            let handle = match backend.start(instance_id, spec).await {
                Ok(handle) => handle,
                Err(e) => {
                    tracing::warn!(instance = instance_id, sidecar = %spec.name, error = %e, "sidecar failed to start");
                    guard.release().await;
                    return Err(e);
                }
            };
            guard.handles.push(handle.clone());

            if let Err(e) = self.wait_ready(backend.as_ref(), &handle, spec, cancel).await {
                tracing::warn!(instance = instance_id, sidecar = %spec.name, error = %e, "sidecar not ready");
                guard.release().await;
                return Err(e);
            }

            self.progress.send_event(ExecutionEvent::SidecarReady {
                instance_id: instance_id.to_string(),
                service: spec.name.clone(),
                image: spec.image_ref(),
            });
        }

        Ok(guard)
    }

    /// Poll the health check until it passes, the readiness timeout expires,
    /// or the run is cancelled
    async fn wait_ready(
        &self,
        backend: &dyn SidecarBackend,
        handle: &SidecarHandle,
        spec: &SidecarSpec,
        cancel: &CancellationToken,
    ) -> Result<(), SidecarError> {
        let poll = async {
            let mut interval = tokio::time::interval(self.poll_interval);
            loop {
                interval.tick().await;
                if backend.is_healthy(handle, spec).await {
                    return;
                }
            }
        };

        tokio::select! {
            result = tokio::time::timeout(spec.readiness_timeout, poll) => {
                result.map_err(|_| SidecarError::Timeout {
                    name: spec.name.clone(),
                    timeout: spec.readiness_timeout,
                })
            }
            _ = cancel.cancelled() => Err(SidecarError::Cancelled),
        }
    }
}

impl std::fmt::Debug for SidecarManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SidecarManager")
            .field("has_backend", &self.backend.is_some())
            .field("poll_interval", &self.poll_interval)
            .finish()
    }
}

/// Running sidecars of one instance.
///
/// Call [`SidecarGuard::release`] once the instance is done; dropping the guard
/// without releasing schedules teardown on the current runtime instead.
pub struct SidecarGuard {
    instance_id: String,
    handles: Vec<SidecarHandle>,
    backend: Option<Arc<dyn SidecarBackend>>,
    progress: Option<ProgressSender>,
}

impl SidecarGuard {
    pub fn handles(&self) -> &[SidecarHandle] {
        &self.handles
    }

    /// `GANTRY_SERVICE_<NAME>_HOST` / `_PORT` for every sidecar, plus
    /// `GANTRY_SERVICE_<NAME>_PORT_<CONTAINER_PORT>` for each mapping
    pub fn connection_env(&self) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        for handle in &self.handles {
            let prefix = format!("GANTRY_SERVICE_{}", env_key(&handle.name));
            env.insert(format!("{}_HOST", prefix), handle.host.clone());
            if let Some(first) = handle.ports.first() {
                env.insert(format!("{}_PORT", prefix), first.host.to_string());
            }
            for port in &handle.ports {
                env.insert(
                    format!("{}_PORT_{}", prefix, port.container),
                    port.host.to_string(),
                );
            }
        }
        env
    }

    /// Stop every sidecar; runs at most once per guard
    pub async fn release(mut self) {
        let handles = std::mem::take(&mut self.handles);
        teardown(
            self.backend.clone(),
            self.instance_id.clone(),
            handles,
            self.progress.clone(),
        )
        .await;
    }
}

impl Drop for SidecarGuard {
    fn drop(&mut self) {
        let handles = std::mem::take(&mut self.handles);
        if handles.is_empty() {
            return;
        }

        let backend = self.backend.clone();
        let instance_id = self.instance_id.clone();
        let progress = self.progress.clone();

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                tracing::debug!(instance = %instance_id, "sidecar guard dropped, scheduling teardown");
                runtime.spawn(teardown(backend, instance_id, handles, progress));
            }
            Err(_) => {
                let names: Vec<&str> = handles.iter().map(|h| h.container.as_str()).collect();
                tracing::error!(instance = %instance_id, containers = ?names, "no runtime available to stop sidecars");
            }
        }
    }
}

/// Stop sidecars in reverse start order; errors are logged, never propagated
async fn teardown(
    backend: Option<Arc<dyn SidecarBackend>>,
    instance_id: String,
    handles: Vec<SidecarHandle>,
    progress: Option<ProgressSender>,
) {
    let Some(backend) = backend else {
        return;
    };

    for handle in handles.iter().rev() {
        if let Err(e) = backend.stop(handle).await {
            tracing::warn!(instance = %instance_id, sidecar = %handle.name, error = %e, "failed to stop sidecar");
        }
        progress.send_event(ExecutionEvent::SidecarStopped {
            instance_id: instance_id.clone(),
            service: handle.name.clone(),
        });
    }
}
