//! Captureless job actor: holds a power setting for a fixed period.

use super::{Job, JobStatus, NonCaptureJobSpec};
use crate::actors::{ActorContext, ActorExit, HeartbeatActor};
use crate::error::CaptureError;
use crate::messages::PowerSetting;
use async_trait::async_trait;
use tracing::{debug, info};

pub(crate) struct NonCaptureJobActor {
    job: Job,
    spec: NonCaptureJobSpec,
}

impl NonCaptureJobActor {
    pub(crate) fn new(job: Job, spec: NonCaptureJobSpec) -> Self {
        Self { job, spec }
    }
}

#[async_trait]
impl HeartbeatActor for NonCaptureJobActor {
    async fn pre_run(&mut self, ctx: &ActorContext) -> Result<(), CaptureError> {
        let deps = self.job.deps();
        let start = deps.clock.now();
        let ends_after = start + self.spec.startup_delay + self.spec.duration;
        {
            let mut state = self.job.lock_state();
            state.start_timestamp = Some(start);
            state.job_ends_after = Some(ends_after);
            state.transition(JobStatus::StartupDelay);
        }
        deps.collaborators
            .power
            .set(PowerSetting::for_job(self.spec.voltage, self.spec.current));
        info!(
            actor = %ctx.name(),
            xp_id = self.spec.xp_id,
            voltage = self.spec.voltage,
            until = %ends_after,
            "holding power setting without captures"
        );
        ctx.set_ready();
        Ok(())
    }

    async fn heartbeat_run(&mut self, ctx: &ActorContext) -> Result<(), CaptureError> {
        let now = self.job.deps().clock.now();
        let expired = {
            let mut state = self.job.lock_state();
            let delay_over = state
                .start_timestamp
                .is_some_and(|start| now.seconds_since(start) >= self.spec.startup_delay);
            if state.status == JobStatus::StartupDelay && delay_over {
                state.transition(JobStatus::Running);
                debug!(actor = %ctx.name(), "startup delay over");
            }
            state.job_ends_after.is_some_and(|end| now >= end)
        };
        if expired {
            ctx.finish();
        }
        Ok(())
    }

    async fn post_run(&mut self, ctx: &ActorContext, exit: &ActorExit) {
        let now = self.job.deps().clock.now();
        let status = self
            .job
            .lock_state()
            .settle(matches!(exit, ActorExit::Failed(_)), now);
        info!(actor = %ctx.name(), %status, "captureless job stopped");
        self.job.post_report();
    }
}
