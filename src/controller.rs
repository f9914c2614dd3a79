//! Experiment capture controller (ECC).
//!
//! Sequences the jobs of one experiment. The controller holds a FIFO queue of
//! validated job specs, at most one *current* job and at most one *staged*
//! job. Each tick:
//!
//! 1. Without a current job: promote and start the staged job, otherwise
//!    build and start the next queued job, otherwise reset the power supply
//!    and retire.
//! 2. With a current job: re-publish its status. Once it is aborted or past
//!    its end it is cleared. If it ends within the staging lead, the next
//!    queued job is built (not started) and staged so promotion on a later
//!    tick costs no construction time.
//!
//! A new controller gives up if no queue arrives within its startup window.
//! Retiring and [`ExperimentCaptureController::replace_queue`] take the same
//! lock, so a queue is never handed to a controller that is stopping.

use crate::actors::{self, ActorContext, ActorExit, ActorTask, HeartbeatActor};
use crate::config::ControllerConfig;
use crate::error::{AppResult, CaptureError};
use crate::jobs::{Job, JobDeps, JobSpec, JobSpecInput, JobStatus, JobStatusReport};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Name the controller heartbeats under.
pub const CONTROLLER_NAME: &str = "ECC";

/// Snapshot returned by [`ExperimentCaptureController::complete_status`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ControllerStatus {
    /// Job currently running.
    pub current_job: Option<JobStatusReport>,
    /// Job built and waiting for promotion.
    pub staged_job: Option<JobStatusReport>,
    /// Jobs not yet built, in order.
    pub queue: Vec<JobSpec>,
}

#[derive(Default)]
struct Slots {
    queue: VecDeque<JobSpec>,
    current: Option<Job>,
    staged: Option<Job>,
}

struct Shared {
    slots: Mutex<Slots>,
    queue_set: watch::Sender<bool>,
    deps: JobDeps,
    config: ControllerConfig,
}

/// Handle to the running controller.
pub struct ExperimentCaptureController {
    shared: Arc<Shared>,
    ctx: ActorContext,
    task: Mutex<Option<ActorTask>>,
}

impl ExperimentCaptureController {
    /// Starts a controller. It waits for a queue for up to
    /// `config.startup_window`.
    pub fn spawn(deps: JobDeps, config: ControllerConfig) -> Self {
        let (queue_set, _) = watch::channel(false);
        let ctx = ActorContext::new(
            CONTROLLER_NAME,
            config.tick,
            deps.clock,
            Arc::clone(&deps.dispatcher),
        );
        let shared = Arc::new(Shared {
            slots: Mutex::new(Slots::default()),
            queue_set,
            deps,
            config,
        });
        let task = actors::spawn(
            ControllerActor {
                shared: Arc::clone(&shared),
            },
            ctx.clone(),
        );
        Self {
            shared,
            ctx,
            task: Mutex::new(Some(task)),
        }
    }

    /// Validates `inputs`, stamps them with the experiment and replaces the
    /// queue. An invalid entry rejects the whole queue and keeps the old one.
    pub fn set_queue(
        &self,
        xp_id: i64,
        species: &str,
        inputs: &[JobSpecInput],
    ) -> AppResult<Vec<JobSpec>> {
        let specs = JobSpec::validate_queue(xp_id, species, inputs)?;
        self.replace_queue(specs.clone())
            .map_err(|_| CaptureError::ActorFailed {
                name: CONTROLLER_NAME.to_string(),
                reason: "controller is shutting down".to_string(),
            })?;
        Ok(specs)
    }

    /// Replaces the queue with already validated specs. A stopping
    /// controller hands them back.
    pub fn replace_queue(&self, specs: Vec<JobSpec>) -> Result<(), Vec<JobSpec>> {
        let mut slots = self.shared.slots.lock();
        if !self.ctx.is_running() {
            return Err(specs);
        }
        info!(jobs = specs.len(), "job queue set");
        slots.queue = specs.into();
        self.shared.queue_set.send_replace(true);
        Ok(())
    }

    /// Current, staged and queued jobs.
    pub fn complete_status(&self) -> ControllerStatus {
        let slots = self.shared.slots.lock();
        ControllerStatus {
            current_job: slots.current.as_ref().map(Job::status_report),
            staged_job: slots.staged.as_ref().map(Job::status_report),
            queue: slots.queue.iter().cloned().collect(),
        }
    }

    /// Clears the queue, drops the staged job, aborts the current one, and
    /// tells the camera to abort and the power supply to reset.
    pub fn abort_all(&self) {
        {
            let mut slots = self.shared.slots.lock();
            let dropped = slots.queue.len();
            slots.queue.clear();
            let staged = slots.staged.take();
            warn!(
                queued = dropped,
                staged = staged.is_some(),
                "aborting all capture jobs"
            );
            if let Some(current) = slots.current.take() {
                current.abort_job();
            }
        }
        let collaborators = &self.shared.deps.collaborators;
        collaborators.camera.abort();
        collaborators.power.reset();
    }

    /// Aborts only the current job; the queue carries on with the next
    /// tick. Returns whether a job was running.
    pub fn abort_running_job(&self) -> bool {
        let slots = self.shared.slots.lock();
        match slots.current.as_ref() {
            Some(current) => {
                info!(job = %current.name(), "aborting running job");
                current.abort_job();
                true
            }
            None => false,
        }
    }

    /// Whether the controller loop is still going.
    pub fn is_running(&self) -> bool {
        self.ctx.is_running()
    }

    /// Waits until the controller accepts queues.
    pub async fn wait_ready(&self, timeout: Duration) -> bool {
        self.ctx.wait_ready(timeout).await
    }

    /// Liveness control block.
    pub fn context(&self) -> &ActorContext {
        &self.ctx
    }

    /// Stops the controller, aborting its jobs, and waits for it.
    pub async fn shutdown(&self) {
        self.ctx.abort(false);
        self.join().await;
    }

    /// Waits for the controller loop to end.
    pub async fn join(&self) {
        let task = self.task.lock().take();
        if let Some(task) = task {
            task.join().await;
        }
    }
}

struct ControllerActor {
    shared: Arc<Shared>,
}

impl ControllerActor {
    fn tick(&self, ctx: &ActorContext, slots: &mut Slots) {
        let deps = &self.shared.deps;

        if slots.current.is_none() {
            if let Some(staged) = slots.staged.take() {
                info!(job = %staged.name(), "promoting staged job");
                staged.start();
                slots.current = Some(staged);
            } else if let Some(spec) = slots.queue.pop_front() {
                let job = Job::new(spec, deps.clone());
                info!(job = %job.name(), remaining = slots.queue.len(), "starting next job");
                job.start();
                slots.current = Some(job);
            } else {
                info!("job queue exhausted, resetting power supply");
                deps.collaborators.power.reset();
                ctx.finish();
                return;
            }
        }

        let Some(current) = slots.current.clone() else {
            return;
        };
        current.post_report();

        if current.status() == JobStatus::Aborted || current.is_expired() {
            debug!(job = %current.name(), status = %current.status(), "clearing current job");
            slots.current = None;
        } else if slots.staged.is_none()
            && !slots.queue.is_empty()
            && current.job_ends_in() < self.shared.config.staging_lead.as_secs_f64()
        {
            if let Some(spec) = slots.queue.pop_front() {
                let job = Job::new(spec, deps.clone());
                info!(job = %job.name(), after = %current.name(), "staging next job");
                slots.staged = Some(job);
            }
        }
    }
}

#[async_trait]
impl HeartbeatActor for ControllerActor {
    async fn pre_run(&mut self, ctx: &ActorContext) -> Result<(), CaptureError> {
        ctx.set_ready();
        let window = self.shared.config.startup_window;
        let mut queue_set = self.shared.queue_set.subscribe();
        let outcome = match tokio::time::timeout(window, queue_set.wait_for(|set| *set)).await {
            Ok(Ok(_)) => Ok(()),
            _ => Err(CaptureError::QueueNotSet(window)),
        };
        outcome
    }

    async fn heartbeat_run(&mut self, ctx: &ActorContext) -> Result<(), CaptureError> {
        let mut slots = self.shared.slots.lock();
        self.tick(ctx, &mut slots);
        Ok(())
    }

    async fn post_run(&mut self, ctx: &ActorContext, exit: &ActorExit) {
        if matches!(exit, ActorExit::Finished) {
            info!(actor = %ctx.name(), "controller finished");
            return;
        }
        let mut slots = self.shared.slots.lock();
        slots.queue.clear();
        slots.staged = None;
        if let Some(current) = slots.current.take() {
            current.abort_job();
        }
        warn!(actor = %ctx.name(), ?exit, "controller stopped");
    }
}
