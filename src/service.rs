//! Capture service: the long-lived entry point for callers.
//!
//! The controller retires whenever its queue runs dry, so callers never hold
//! it directly. [`CaptureService`] owns the current controller (if any),
//! starts a new one when a queue arrives and forwards status and abort
//! requests to it.

use crate::actors::{ThreadRegistry, ThreadState};
use crate::config::ControllerConfig;
use crate::controller::{ControllerStatus, ExperimentCaptureController, CONTROLLER_NAME};
use crate::error::{AppResult, CaptureError};
use crate::jobs::{JobDeps, JobSpec, JobSpecInput};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Dependency-injected capture service.
pub struct CaptureService {
    deps: JobDeps,
    config: ControllerConfig,
    registry: Arc<ThreadRegistry>,
    controller: Mutex<Option<ExperimentCaptureController>>,
}

impl CaptureService {
    /// Creates the service. No controller runs until the first queue.
    pub fn new(deps: JobDeps, config: ControllerConfig, registry: Arc<ThreadRegistry>) -> Self {
        Self {
            deps,
            config,
            registry,
            controller: Mutex::new(None),
        }
    }

    /// Validates and installs a job queue for experiment `xp_id`, starting a
    /// controller if none is running. Returns the stamped queue.
    pub async fn set_queue(
        &self,
        xp_id: i64,
        species: &str,
        inputs: &[JobSpecInput],
    ) -> AppResult<Vec<JobSpec>> {
        let specs = JobSpec::validate_queue(xp_id, species, inputs)?;
        let mut slot = self.controller.lock().await;

        let mut pending = specs.clone();
        for _ in 0..2 {
            let controller = self.live_controller(&mut slot).await?;
            match controller.replace_queue(pending) {
                Ok(()) => {
                    info!(xp_id, species, jobs = specs.len(), "queue accepted");
                    return Ok(specs);
                }
                Err(returned) => {
                    debug!("controller stopped while receiving the queue, restarting it");
                    pending = returned;
                }
            }
        }
        Err(CaptureError::ActorFailed {
            name: CONTROLLER_NAME.to_string(),
            reason: "controller kept stopping while the queue was handed over".to_string(),
        })
    }

    /// Snapshot of current, staged and queued jobs. Empty while no
    /// controller runs.
    pub async fn complete_status(&self) -> ControllerStatus {
        self.controller
            .lock()
            .await
            .as_ref()
            .filter(|controller| controller.is_running())
            .map(ExperimentCaptureController::complete_status)
            .unwrap_or_default()
    }

    /// Aborts everything. The camera abort and the power-supply reset are
    /// issued even when nothing is running.
    pub async fn abort_all(&self) {
        let slot = self.controller.lock().await;
        match slot.as_ref() {
            Some(controller) if controller.is_running() => controller.abort_all(),
            _ => {
                warn!("abort requested with no controller running");
                self.deps.collaborators.camera.abort();
                self.deps.collaborators.power.reset();
            }
        }
    }

    /// Aborts the running job only. Returns whether there was one.
    pub async fn abort_running_job(&self) -> bool {
        self.controller
            .lock()
            .await
            .as_ref()
            .is_some_and(ExperimentCaptureController::abort_running_job)
    }

    /// Whether a controller is currently running.
    pub async fn is_running(&self) -> bool {
        self.controller
            .lock()
            .await
            .as_ref()
            .is_some_and(ExperimentCaptureController::is_running)
    }

    /// Liveness of every registered actor.
    pub fn thread_states(&self) -> Vec<ThreadState> {
        self.registry.thread_states()
    }

    /// Liveness of one actor.
    pub fn thread_state(&self, name: &str) -> Option<ThreadState> {
        self.registry.thread_state(name)
    }

    /// Waits until the controller has retired on its own (queue done).
    pub async fn wait_idle(&self) {
        while self.is_running().await {
            tokio::time::sleep(self.config.tick).await;
        }
    }

    /// Stops the controller, aborting its jobs.
    pub async fn shutdown(&self) {
        let controller = self.controller.lock().await.take();
        if let Some(controller) = controller {
            controller.shutdown().await;
        }
    }

    async fn live_controller<'a>(
        &self,
        slot: &'a mut Option<ExperimentCaptureController>,
    ) -> AppResult<&'a ExperimentCaptureController> {
        let usable = slot
            .as_ref()
            .is_some_and(ExperimentCaptureController::is_running);
        if !usable {
            if let Some(old) = slot.take() {
                old.join().await;
            }
            info!("starting experiment capture controller");
            let controller = ExperimentCaptureController::spawn(self.deps.clone(), self.config);
            if !controller.wait_ready(self.config.ready_timeout).await {
                controller.shutdown().await;
                return Err(CaptureError::ReadyTimeout {
                    name: CONTROLLER_NAME.to_string(),
                    timeout: self.config.ready_timeout,
                });
            }
            *slot = Some(controller);
        }
        slot.as_ref().ok_or_else(|| CaptureError::ActorFailed {
            name: CONTROLLER_NAME.to_string(),
            reason: "controller missing after start".to_string(),
        })
    }
}
