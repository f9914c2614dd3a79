//! Capture job actor.
//!
//! Setup stamps the start, sets the power supply, asks storage for a job
//! record and computes the capture schedule. The run walks the schedule,
//! handing each request to the camera `camera_preload` ahead of its
//! timestamp. The camera fires at the exact instant, so preloading hides the
//! substrate latency.

use super::{capture_schedule, CaptureJobSpec, Job, JobStatus};
use crate::actors::{ActorContext, ActorExit, HeartbeatActor};
use crate::clock::Timestamp;
use crate::error::CaptureError;
use crate::messages::{CaptureMetadata, CaptureRequest, JobRecordRequest, PowerSetting};
use async_trait::async_trait;
use tracing::{debug, error, info};

pub(crate) struct CaptureJobActor {
    job: Job,
    spec: CaptureJobSpec,
}

impl CaptureJobActor {
    pub(crate) fn new(job: Job, spec: CaptureJobSpec) -> Self {
        Self { job, spec }
    }
}

#[async_trait]
impl HeartbeatActor for CaptureJobActor {
    async fn pre_run(&mut self, ctx: &ActorContext) -> Result<(), CaptureError> {
        let deps = self.job.deps().clone();
        let clock = deps.clock;
        let start = clock.now();
        let first_capture = start + self.spec.startup_delay;
        let capture_times = capture_schedule(first_capture, self.spec.interval, self.spec.duration);

        {
            let mut state = self.job.lock_state();
            state.start_timestamp = Some(start);
            state.transition(JobStatus::StartupDelay);
        }
        info!(
            actor = %ctx.name(),
            xp_id = self.spec.xp_id,
            voltage = self.spec.voltage,
            current = self.spec.current,
            "starting capture job"
        );

        deps.collaborators
            .power
            .set(PowerSetting::for_job(self.spec.voltage, self.spec.current));

        let reply = deps.collaborators.storage.create_job_record(JobRecordRequest {
            xp_id: self.spec.xp_id,
            voltage: self.spec.voltage,
            current: self.spec.current,
            start_timestamp: start,
        });

        let Some(&last_capture) = capture_times.last() else {
            return Err(CaptureError::InvalidJobSpec {
                index: 0,
                reason: "capture job without captures".to_string(),
            });
        };
        {
            let mut state = self.job.lock_state();
            state.total = capture_times.len();
            state.remaining = capture_times.len();
            state.capture_times = capture_times;
            state.job_ends_after = Some(last_capture);
        }
        debug!(
            actor = %ctx.name(),
            first = %first_capture,
            last = %last_capture,
            "capture schedule prepared"
        );
        ctx.set_ready();

        let deadline = earlier(
            first_capture - deps.timing.record_margin,
            start + deps.timing.record_timeout,
        );
        let xp_id = self.spec.xp_id;
        match tokio::time::timeout_at(clock.instant_at(deadline), reply).await {
            Ok(Ok(cjr_id)) => {
                let assigned = *self.job.lock_state().cjr_id.get_or_insert(cjr_id);
                ctx.set_name(format!("XP_{xp_id}_CJR_{assigned}"));
                info!(actor = %ctx.name(), xp_id, cjr_id = assigned, "job record confirmed");
                Ok(())
            }
            Ok(Err(_)) => {
                error!(actor = %ctx.name(), xp_id, "storage dropped the job-record request");
                Err(CaptureError::JobRecordUnavailable { xp_id })
            }
            Err(_) => {
                error!(
                    actor = %ctx.name(),
                    xp_id,
                    deadline = %deadline,
                    "no job-record id before the first capture deadline"
                );
                Err(CaptureError::JobRecordTimeout { xp_id })
            }
        }
    }

    async fn heartbeat_run(&mut self, ctx: &ActorContext) -> Result<(), CaptureError> {
        let deps = self.job.deps().clone();
        let (times, total, cjr_id) = {
            let mut state = self.job.lock_state();
            state.transition(JobStatus::Running);
            (state.capture_times.clone(), state.total, state.cjr_id)
        };
        let meta = CaptureMetadata {
            xp_id: self.spec.xp_id,
            cjr_id,
            species: self.spec.species.clone(),
            voltage: self.spec.voltage,
            current: self.spec.current,
            is_cal_image: false,
        };

        for (i, &at) in times.iter().enumerate() {
            ctx.beat();
            deps.clock.sleep_until(at - deps.timing.camera_preload).await;
            if !ctx.is_running() {
                debug!(actor = %ctx.name(), remaining = total - i, "stopping before the next capture");
                break;
            }
            deps.collaborators.camera.queue_capture_request(CaptureRequest {
                requested_timestamp: at,
                meta: meta.clone(),
            });
            self.job.lock_state().remaining = total - i - 1;
        }

        ctx.finish();
        Ok(())
    }

    async fn post_run(&mut self, ctx: &ActorContext, exit: &ActorExit) {
        let now = self.job.deps().clock.now();
        let status = self
            .job
            .lock_state()
            .settle(matches!(exit, ActorExit::Failed(_)), now);
        match status {
            JobStatus::Completed => info!(actor = %ctx.name(), "capture job completed"),
            _ => info!(actor = %ctx.name(), %status, ?exit, "capture job stopped"),
        }
        self.job.post_report();
    }
}

fn earlier(a: Timestamp, b: Timestamp) -> Timestamp {
    if a.total_cmp(&b).is_le() {
        a
    } else {
        b
    }
}
