//! Capture jobs: specifications, status and the job handle.
//!
//! A job is one experimental run at a fixed voltage/current setting. Capture
//! jobs take images at a fixed interval; captureless jobs only hold the
//! setting for a while (for example a rest period between two capture runs).
//!
//! # State Machine
//!
//! ```text
//! Staged ──start──> StartupDelay ──schedule + record id──> Running ──> Completed
//!    │                   │                                   │
//!    └───────────────────┴──────── abort_job / failure ──────┴──> Aborted
//! ```
//!
//! `Completed` and `Aborted` are terminal: once reached the status never
//! changes again.
//!
//! Job specifications arrive as loosely-typed [`JobSpecInput`]s and are
//! validated once, at the queue boundary, into a [`JobSpec`].

mod capture;
mod non_capture;

use crate::actors::{self, ActorContext, ActorTask};
use crate::clock::{Clock, Timestamp};
use crate::config::JobsConfig;
use crate::error::{AppResult, CaptureError};
use crate::messages::{Dispatcher, JobRecordId};
use crate::proxy::Collaborators;
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

use capture::CaptureJobActor;
use non_capture::NonCaptureJobActor;

/// Reported as `seconds_left` before a job has computed its end time.
pub const UNSCHEDULED_SECONDS_LEFT: i64 = 1_000_000;

static JOB_SEQUENCE: AtomicU64 = AtomicU64::new(1);

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Constructed and queued for promotion, not started.
    Staged,
    /// Started; waiting for the first capture or the record id.
    StartupDelay,
    /// Walking the capture schedule (or holding the setting).
    Running,
    /// Schedule exhausted normally.
    Completed,
    /// Aborted externally or failed.
    Aborted,
}

impl JobStatus {
    /// Whether the status can no longer change.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Aborted)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Staged => "staged",
            JobStatus::StartupDelay => "startup_delay",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

/// Job specification as submitted by callers.
///
/// `interval <= 0` means "no captures".
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct JobSpecInput {
    /// Seconds between job start and the first capture.
    #[serde(default)]
    pub startup_delay: f64,
    /// Seconds between captures.
    #[serde(default)]
    pub interval: f64,
    /// Total length of the capture window in seconds.
    pub duration: f64,
    /// Voltage to hold.
    pub voltage: f64,
    /// Current limit to hold.
    pub current: f64,
}

/// Validated capture job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureJobSpec {
    /// Owning experiment.
    pub xp_id: i64,
    /// Species tag.
    pub species: String,
    /// Seconds before the first capture.
    pub startup_delay: f64,
    /// Seconds between captures, strictly positive.
    pub interval: f64,
    /// Length of the capture window.
    pub duration: f64,
    /// Voltage to hold.
    pub voltage: f64,
    /// Current limit.
    pub current: f64,
}

impl CaptureJobSpec {
    /// Number of captures the job will take.
    pub fn capture_count(&self) -> usize {
        capture_count(self.interval, self.duration)
    }
}

/// Validated captureless job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NonCaptureJobSpec {
    /// Owning experiment.
    pub xp_id: i64,
    /// Species tag.
    pub species: String,
    /// Seconds before the hold period starts.
    pub startup_delay: f64,
    /// Length of the hold period.
    pub duration: f64,
    /// Voltage to hold.
    pub voltage: f64,
    /// Current limit.
    pub current: f64,
}

/// A queued job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobSpec {
    /// Timed sequence of captures.
    Capture(CaptureJobSpec),
    /// Pure timed hold without captures.
    NonCapture(NonCaptureJobSpec),
}

impl JobSpec {
    /// Validates one input and stamps it with the experiment it belongs to.
    /// `index` is only used in the error message.
    pub fn from_input(
        index: usize,
        input: &JobSpecInput,
        xp_id: i64,
        species: &str,
    ) -> AppResult<Self> {
        let invalid = |reason: &str| CaptureError::InvalidJobSpec {
            index,
            reason: reason.to_string(),
        };

        for (field, value) in [
            ("startup_delay", input.startup_delay),
            ("interval", input.interval),
            ("duration", input.duration),
            ("voltage", input.voltage),
            ("current", input.current),
        ] {
            if !value.is_finite() {
                return Err(invalid(&format!("{field} must be finite")));
            }
        }
        if input.startup_delay < 0.0 {
            return Err(invalid("startup_delay must not be negative"));
        }
        if input.duration < 0.0 {
            return Err(invalid("duration must not be negative"));
        }
        if input.current < 0.0 {
            return Err(invalid("current must not be negative"));
        }

        if input.interval > 0.0 {
            if capture_count(input.interval, input.duration) == 0 {
                return Err(invalid("duration is shorter than one capture interval"));
            }
            Ok(JobSpec::Capture(CaptureJobSpec {
                xp_id,
                species: species.to_string(),
                startup_delay: input.startup_delay,
                interval: input.interval,
                duration: input.duration,
                voltage: input.voltage,
                current: input.current,
            }))
        } else {
            Ok(JobSpec::NonCapture(NonCaptureJobSpec {
                xp_id,
                species: species.to_string(),
                startup_delay: input.startup_delay,
                duration: input.duration,
                voltage: input.voltage,
                current: input.current,
            }))
        }
    }

    /// Validates a whole queue. Any invalid entry rejects the queue.
    pub fn validate_queue(
        xp_id: i64,
        species: &str,
        inputs: &[JobSpecInput],
    ) -> AppResult<Vec<JobSpec>> {
        inputs
            .iter()
            .enumerate()
            .map(|(index, input)| JobSpec::from_input(index, input, xp_id, species))
            .collect()
    }

    /// Owning experiment.
    pub fn xp_id(&self) -> i64 {
        match self {
            JobSpec::Capture(spec) => spec.xp_id,
            JobSpec::NonCapture(spec) => spec.xp_id,
        }
    }

    /// Species tag.
    pub fn species(&self) -> &str {
        match self {
            JobSpec::Capture(spec) => &spec.species,
            JobSpec::NonCapture(spec) => &spec.species,
        }
    }

    /// Voltage to hold.
    pub fn voltage(&self) -> f64 {
        match self {
            JobSpec::Capture(spec) => spec.voltage,
            JobSpec::NonCapture(spec) => spec.voltage,
        }
    }

    /// Current limit.
    pub fn current(&self) -> f64 {
        match self {
            JobSpec::Capture(spec) => spec.current,
            JobSpec::NonCapture(spec) => spec.current,
        }
    }

    /// Whether the job takes images.
    pub fn is_capture(&self) -> bool {
        matches!(self, JobSpec::Capture(_))
    }
}

// Tolerates representation error so that e.g. 0.3 / 0.1 yields 3.
fn capture_count(interval: f64, duration: f64) -> usize {
    if interval <= 0.0 || duration <= 0.0 {
        return 0;
    }
    ((duration / interval) + 1e-9).floor() as usize
}

/// Absolute capture times: `first + j * interval` for every capture.
pub fn capture_schedule(first: Timestamp, interval: f64, duration: f64) -> Vec<Timestamp> {
    (0..capture_count(interval, duration))
        .map(|j| first + j as f64 * interval)
        .collect()
}

/// Full status snapshot of a job, used both for job self-reports and for
/// controller snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatusReport {
    /// Lifecycle status.
    pub status: JobStatus,
    /// Owning experiment.
    pub xp_id: i64,
    /// Job record id once confirmed.
    pub cjr_id: Option<JobRecordId>,
    /// Species tag.
    pub species: String,
    /// Captures scheduled.
    pub total: usize,
    /// Captures not yet dispatched.
    pub remaining: usize,
    /// Voltage held.
    pub voltage: f64,
    /// Current limit held.
    pub current: f64,
    /// When the job started.
    pub start_timestamp: Option<Timestamp>,
    /// When the job stopped.
    pub stop_timestamp: Option<Timestamp>,
    /// Whole seconds until the scheduled end.
    pub seconds_left: i64,
    /// When this snapshot was taken; consumers keep the latest.
    pub reported_at: Timestamp,
}

/// Everything a job needs from the outside world.
#[derive(Clone)]
pub struct JobDeps {
    /// Shared time source.
    pub clock: Clock,
    /// Substrate entry point (heartbeats).
    pub dispatcher: Arc<dyn Dispatcher>,
    /// Camera, power supply and storage proxies.
    pub collaborators: Collaborators,
    /// Timing parameters.
    pub timing: JobsConfig,
}

impl JobDeps {
    /// Builds the dependencies over one dispatcher.
    pub fn new(clock: Clock, dispatcher: Arc<dyn Dispatcher>, timing: JobsConfig) -> Self {
        Self {
            clock,
            collaborators: Collaborators::new(Arc::clone(&dispatcher)),
            dispatcher,
            timing,
        }
    }
}

#[derive(Debug)]
pub(crate) struct JobState {
    status: JobStatus,
    cjr_id: Option<JobRecordId>,
    total: usize,
    remaining: usize,
    capture_times: Vec<Timestamp>,
    job_ends_after: Option<Timestamp>,
    start_timestamp: Option<Timestamp>,
    stop_timestamp: Option<Timestamp>,
}

impl JobState {
    fn new() -> Self {
        Self {
            status: JobStatus::Staged,
            cjr_id: None,
            total: 0,
            remaining: 0,
            capture_times: Vec::new(),
            job_ends_after: None,
            start_timestamp: None,
            stop_timestamp: None,
        }
    }

    /// Moves to `to` unless the current status is terminal.
    fn transition(&mut self, to: JobStatus) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = to;
        true
    }

    /// Applies the teardown rule: a running job completes, anything else
    /// that is not yet terminal (or any failed run) ends aborted.
    fn settle(&mut self, failed: bool, stopped_at: Timestamp) -> JobStatus {
        self.stop_timestamp = Some(stopped_at);
        if !failed && self.status == JobStatus::Running {
            self.transition(JobStatus::Completed);
        } else {
            self.transition(JobStatus::Aborted);
        }
        self.status
    }
}

struct JobInner {
    spec: JobSpec,
    state: Mutex<JobState>,
    ctx: ActorContext,
    deps: JobDeps,
    task: Mutex<Option<ActorTask>>,
}

/// Handle to one job. Clones refer to the same job.
#[derive(Clone)]
pub struct Job {
    inner: Arc<JobInner>,
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("name", &self.name())
            .field("status", &self.status())
            .finish()
    }
}

impl Job {
    /// Constructs a staged job. Nothing runs until [`Job::start`].
    pub fn new(spec: JobSpec, deps: JobDeps) -> Self {
        let seq = JOB_SEQUENCE.fetch_add(1, Ordering::Relaxed);
        let tick = deps.timing.tick;
        let ctx = match &spec {
            JobSpec::Capture(capture) => ActorContext::provisional(
                format!("XP_{}_CJR_pending_id.{}", capture.xp_id, seq),
                tick,
                deps.clock,
                Arc::clone(&deps.dispatcher),
            ),
            JobSpec::NonCapture(hold) => ActorContext::new(
                format!(
                    "job_without_capture_{}_seconds_at_{}_volts.{}",
                    hold.duration, hold.voltage, seq
                ),
                tick,
                deps.clock,
                Arc::clone(&deps.dispatcher),
            ),
        };

        Self {
            inner: Arc::new(JobInner {
                spec,
                state: Mutex::new(JobState::new()),
                ctx,
                deps,
                task: Mutex::new(None),
            }),
        }
    }

    /// Starts the job's actor. Returns `false` if it was already started or
    /// has already been aborted.
    pub fn start(&self) -> bool {
        let mut task = self.inner.task.lock();
        if task.is_some() {
            warn!(job = %self.name(), "job already started");
            return false;
        }
        if self.status().is_terminal() {
            warn!(job = %self.name(), status = %self.status(), "refusing to start a finished job");
            return false;
        }

        let ctx = self.inner.ctx.clone();
        *task = Some(match &self.inner.spec {
            JobSpec::Capture(spec) => {
                actors::spawn(CaptureJobActor::new(self.clone(), spec.clone()), ctx)
            }
            JobSpec::NonCapture(spec) => {
                actors::spawn(NonCaptureJobActor::new(self.clone(), spec.clone()), ctx)
            }
        });
        true
    }

    /// Stops the job. Already-dispatched captures still fire; nothing further
    /// is dispatched. Idempotent: a terminal status is left unchanged.
    pub fn abort_job(&self) {
        self.inner.ctx.abort(false);
        let changed = self.lock_state().transition(JobStatus::Aborted);
        if changed {
            info!(job = %self.name(), report = ?self.status_report(), "job aborted");
        }
        self.post_report();
    }

    /// Current status.
    pub fn status(&self) -> JobStatus {
        self.lock_state().status
    }

    /// Full status snapshot.
    pub fn status_report(&self) -> JobStatusReport {
        let now = self.inner.deps.clock.now();
        let state = self.lock_state();
        let seconds_left = match state.job_ends_after {
            Some(end) => end.seconds_since(now) as i64,
            None => UNSCHEDULED_SECONDS_LEFT,
        };
        JobStatusReport {
            status: state.status,
            xp_id: self.inner.spec.xp_id(),
            cjr_id: state.cjr_id,
            species: self.inner.spec.species().to_string(),
            total: state.total,
            remaining: state.remaining,
            voltage: self.inner.spec.voltage(),
            current: self.inner.spec.current(),
            start_timestamp: state.start_timestamp,
            stop_timestamp: state.stop_timestamp,
            seconds_left,
            reported_at: now,
        }
    }

    /// Publishes the status snapshot to storage. Safe to repeat.
    pub fn post_report(&self) {
        self.inner
            .deps
            .collaborators
            .storage
            .report_job_status(self.status_report());
    }

    /// Time of the last scheduled capture (or end of the hold period).
    pub fn job_ends_after(&self) -> Option<Timestamp> {
        self.lock_state().job_ends_after
    }

    /// Seconds until [`Job::job_ends_after`]; very large while unscheduled.
    pub fn job_ends_in(&self) -> f64 {
        match self.job_ends_after() {
            Some(end) => self.inner.deps.clock.seconds_until(end),
            None => UNSCHEDULED_SECONDS_LEFT as f64,
        }
    }

    /// Whether the scheduled end time has passed.
    pub fn is_expired(&self) -> bool {
        self.job_ends_after()
            .is_some_and(|end| end < self.inner.deps.clock.now())
    }

    /// The specification the job was built from.
    pub fn spec(&self) -> &JobSpec {
        &self.inner.spec
    }

    /// Actor name.
    pub fn name(&self) -> String {
        self.inner.ctx.name()
    }

    /// Job record id once confirmed.
    pub fn cjr_id(&self) -> Option<JobRecordId> {
        self.lock_state().cjr_id
    }

    /// Absolute capture schedule (empty until started).
    pub fn capture_times(&self) -> Vec<Timestamp> {
        self.lock_state().capture_times.clone()
    }

    /// When the job was started.
    pub fn start_timestamp(&self) -> Option<Timestamp> {
        self.lock_state().start_timestamp
    }

    /// Whether [`Job::start`] was called.
    pub fn is_started(&self) -> bool {
        self.inner.task.lock().is_some()
    }

    /// Whether the job's actor is still running (including teardown).
    pub fn is_alive(&self) -> bool {
        self.inner
            .task
            .lock()
            .as_ref()
            .is_some_and(|task| task.is_alive())
    }

    /// Waits for the job's actor to finish. Returns at once if not started.
    pub async fn join(&self) {
        let task = self.inner.task.lock().take();
        if let Some(task) = task {
            task.join().await;
        }
    }

    /// Whether both handles refer to the same job.
    pub fn is_same(&self, other: &Job) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Liveness control block of the job's actor.
    pub fn context(&self) -> &ActorContext {
        &self.inner.ctx
    }

    pub(crate) fn deps(&self) -> &JobDeps {
        &self.inner.deps
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, JobState> {
        self.inner.state.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(startup_delay: f64, interval: f64, duration: f64) -> JobSpecInput {
        JobSpecInput {
            startup_delay,
            interval,
            duration,
            voltage: 5.0,
            current: 1.0,
        }
    }

    #[test]
    fn positive_interval_builds_capture_spec() {
        let spec = JobSpec::from_input(0, &input(5.0, 2.0, 10.0), 1, "HP").unwrap();
        match spec {
            JobSpec::Capture(capture) => {
                assert_eq!(capture.xp_id, 1);
                assert_eq!(capture.species, "HP");
                assert_eq!(capture.capture_count(), 5);
            }
            other => panic!("expected capture spec, got {other:?}"),
        }
    }

    #[test]
    fn non_positive_interval_builds_hold_spec() {
        assert!(!JobSpec::from_input(0, &input(0.0, 0.0, 30.0), 1, "HP")
            .unwrap()
            .is_capture());
        assert!(!JobSpec::from_input(0, &input(0.0, -1.0, 30.0), 1, "HP")
            .unwrap()
            .is_capture());
    }

    #[test]
    fn invalid_entry_rejects_whole_queue() {
        let queue = [input(5.0, 2.0, 10.0), input(-1.0, 2.0, 10.0)];
        match JobSpec::validate_queue(1, "HP", &queue) {
            Err(CaptureError::InvalidJobSpec { index, .. }) => assert_eq!(index, 1),
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[test]
    fn capture_job_needs_at_least_one_capture() {
        assert!(JobSpec::from_input(0, &input(5.0, 20.0, 10.0), 1, "HP").is_err());
        assert!(JobSpec::from_input(0, &input(5.0, f64::NAN, 10.0), 1, "HP").is_err());
    }

    #[test]
    fn schedule_is_strictly_increasing_with_constant_step() {
        let first = Timestamp::from_secs(105.0);
        let times = capture_schedule(first, 2.0, 10.0);
        let secs: Vec<f64> = times.iter().map(|t| t.as_secs()).collect();
        assert_eq!(secs, vec![105.0, 107.0, 109.0, 111.0, 113.0]);

        for (interval, duration) in [(0.1, 0.3), (0.7, 10.0), (3.0, 3.0), (1.5, 100.0)] {
            let times = capture_schedule(first, interval, duration);
            assert_eq!(times.len(), capture_count(interval, duration));
            for pair in times.windows(2) {
                assert!((pair[1].seconds_since(pair[0]) - interval).abs() < 1e-9);
            }
        }
        assert_eq!(capture_count(0.1, 0.3), 3);
        assert_eq!(capture_count(0.7, 10.0), 14);
    }

    #[test]
    fn terminal_status_never_changes() {
        let mut state = JobState::new();
        assert!(state.transition(JobStatus::StartupDelay));
        assert!(state.transition(JobStatus::Running));
        assert_eq!(state.settle(false, Timestamp::from_secs(1.0)), JobStatus::Completed);
        assert!(!state.transition(JobStatus::Aborted));
        assert_eq!(state.settle(true, Timestamp::from_secs(2.0)), JobStatus::Completed);
    }

    #[test]
    fn failed_or_unstarted_runs_settle_as_aborted() {
        let mut state = JobState::new();
        state.transition(JobStatus::StartupDelay);
        assert_eq!(state.settle(false, Timestamp::from_secs(1.0)), JobStatus::Aborted);

        let mut state = JobState::new();
        state.transition(JobStatus::Running);
        assert_eq!(state.settle(true, Timestamp::from_secs(1.0)), JobStatus::Aborted);
    }

    #[test]
    fn status_serialises_snake_case() {
        assert_eq!(
            serde_json::to_string(&JobStatus::StartupDelay).unwrap(),
            "\"startup_delay\""
        );
        assert_eq!(JobStatus::Aborted.to_string(), "aborted");
    }
}
