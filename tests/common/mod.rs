//! Shared helpers for the integration tests.

#![allow(dead_code)]

use fishface::clock::{Clock, Timestamp};
use fishface::config::{FishFaceConfig, JobsConfig};
use fishface::jobs::{JobDeps, JobSpec, JobSpecInput, JobStatusReport};
use fishface::messages::{
    CaptureRequest, CapturedImage, Dispatcher, HeartbeatReport, JobRecordId, JobRecordRequest,
    Operation, PowerReading, PowerSetting,
};
use fishface::hardware::{CameraDevice, MockCamera, MockPowerSupply, PowerSupplyDevice};
use fishface::storage::{MemoryResultStore, ResultStore};
use fishface::system::{MockRig, System};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::oneshot;

/// Wall-clock anchor used by every test clock.
pub const T0: f64 = 1_700_000_000.0;

/// How the recording dispatcher answers `create_job_record`.
#[derive(Debug, Clone, Copy)]
pub enum RecordReply {
    /// Reply right away with sequential ids starting at the given one.
    Immediate(JobRecordId),
    /// Keep the request open forever.
    Never,
    /// Drop the reply channel.
    Drop,
}

/// Copy of an operation as it was dispatched.
#[derive(Debug, Clone)]
pub enum RecordedOp {
    CreateJobRecord(JobRecordRequest),
    QueueCaptureRequest(CaptureRequest),
    CameraAbort,
    SetPowerSupply(PowerSetting),
    ResetPowerSupply,
    ReportJobStatus(JobStatusReport),
    ReportCapturedImage(CapturedImage),
    ReportPowerSupply(PowerReading),
    Heartbeat(HeartbeatReport),
}

/// Operation plus the time it was dispatched.
#[derive(Debug, Clone)]
pub struct Recorded {
    pub at: Timestamp,
    pub op: RecordedOp,
}

/// Dispatcher that records every operation and plays storage for
/// `create_job_record`.
pub struct RecordingDispatcher {
    clock: Clock,
    reply: RecordReply,
    next_id: Mutex<JobRecordId>,
    parked: Mutex<Vec<oneshot::Sender<JobRecordId>>>,
    ops: Mutex<Vec<Recorded>>,
}

impl RecordingDispatcher {
    pub fn new(clock: Clock, reply: RecordReply) -> Arc<Self> {
        let first = match reply {
            RecordReply::Immediate(first) => first,
            _ => 1,
        };
        Arc::new(Self {
            clock,
            reply,
            next_id: Mutex::new(first),
            parked: Mutex::new(Vec::new()),
            ops: Mutex::new(Vec::new()),
        })
    }

    pub fn recorded(&self) -> Vec<Recorded> {
        self.ops.lock().clone()
    }

    pub fn capture_requests(&self) -> Vec<(Timestamp, CaptureRequest)> {
        self.ops
            .lock()
            .iter()
            .filter_map(|r| match &r.op {
                RecordedOp::QueueCaptureRequest(req) => Some((r.at, req.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn status_reports(&self) -> Vec<JobStatusReport> {
        self.ops
            .lock()
            .iter()
            .filter_map(|r| match &r.op {
                RecordedOp::ReportJobStatus(report) => Some(report.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn power_settings(&self) -> Vec<PowerSetting> {
        self.ops
            .lock()
            .iter()
            .filter_map(|r| match &r.op {
                RecordedOp::SetPowerSupply(setting) => Some(*setting),
                _ => None,
            })
            .collect()
    }

    pub fn record_requests(&self) -> Vec<JobRecordRequest> {
        self.ops
            .lock()
            .iter()
            .filter_map(|r| match &r.op {
                RecordedOp::CreateJobRecord(request) => Some(request.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn heartbeats(&self) -> Vec<HeartbeatReport> {
        self.ops
            .lock()
            .iter()
            .filter_map(|r| match &r.op {
                RecordedOp::Heartbeat(report) => Some(report.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, pred: impl Fn(&RecordedOp) -> bool) -> usize {
        self.ops.lock().iter().filter(|r| pred(&r.op)).count()
    }
}

impl Dispatcher for RecordingDispatcher {
    fn dispatch(&self, op: Operation) {
        let recorded = match op {
            Operation::CreateJobRecord { request, reply } => {
                match self.reply {
                    RecordReply::Immediate(_) => {
                        let mut next = self.next_id.lock();
                        let _ = reply.send(*next);
                        *next += 1;
                    }
                    RecordReply::Never => self.parked.lock().push(reply),
                    RecordReply::Drop => drop(reply),
                }
                RecordedOp::CreateJobRecord(request)
            }
            Operation::QueueCaptureRequest(req) => RecordedOp::QueueCaptureRequest(req),
            Operation::CameraAbort => RecordedOp::CameraAbort,
            Operation::SetPowerSupply(setting) => RecordedOp::SetPowerSupply(setting),
            Operation::ResetPowerSupply => RecordedOp::ResetPowerSupply,
            Operation::ReportJobStatus(report) => RecordedOp::ReportJobStatus(report),
            Operation::ReportCapturedImage(image) => RecordedOp::ReportCapturedImage(image),
            Operation::ReportPowerSupply(reading) => RecordedOp::ReportPowerSupply(reading),
            Operation::Heartbeat(report) => RecordedOp::Heartbeat(report),
        };
        self.ops.lock().push(Recorded {
            at: self.clock.now(),
            op: recorded,
        });
    }
}

/// Clock anchored at [`T0`]. Call inside a paused tokio test.
pub fn test_clock() -> Clock {
    Clock::anchored_at(Timestamp::from_secs(T0))
}

/// Job dependencies over a recording dispatcher with default timing.
pub fn job_deps(clock: Clock, dispatcher: &Arc<RecordingDispatcher>) -> JobDeps {
    JobDeps::new(
        clock,
        Arc::clone(dispatcher) as Arc<dyn Dispatcher>,
        JobsConfig::default(),
    )
}

pub fn input(
    startup_delay: f64,
    interval: f64,
    duration: f64,
    voltage: f64,
    current: f64,
) -> JobSpecInput {
    JobSpecInput {
        startup_delay,
        interval,
        duration,
        voltage,
        current,
    }
}

pub fn spec(xp_id: i64, input: JobSpecInput) -> JobSpec {
    JobSpec::from_input(0, &input, xp_id, "HP").unwrap()
}

/// Full system on the simulated rig.
pub fn start_system() -> (System, MockRig) {
    System::start_mock(FishFaceConfig::default(), test_clock())
}

/// Full system on simulated devices over the given store.
pub fn start_system_with_store(store: MemoryResultStore) -> (System, MockRig) {
    let config = FishFaceConfig::default();
    let clock = test_clock();
    let rig = MockRig {
        camera: Arc::new(
            MockCamera::new(clock, config.camera.width, config.camera.height)
                .with_rotation(config.camera.rotation),
        ),
        power: Arc::new(MockPowerSupply::new()),
        store: Arc::new(store),
    };
    let system = System::start(
        config,
        clock,
        Arc::clone(&rig.camera) as Arc<dyn CameraDevice>,
        Arc::clone(&rig.power) as Arc<dyn PowerSupplyDevice>,
        Arc::clone(&rig.store) as Arc<dyn ResultStore>,
    );
    (system, rig)
}

pub fn approx(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-6
}
