//! Message types for actor-based communication.
//!
//! Every interaction between actors of the capture core, and between the core
//! and its collaborators (camera, power supply, storage, liveness registry), is
//! an [`Operation`] handed to a [`Dispatcher`]. The set of operations is closed:
//! routing matches on the enum exhaustively, so adding an operation without
//! handling it is a compile error.
//!
//! # Message Flow
//!
//! ```text
//! Job / Controller / CaptureThread              Router task
//! --------------------------------              -----------
//! 1. Build Operation (helper method)
//! 2. dispatcher.dispatch(op)       ------>
//!                                               3. Receive op
//!                                               4. Route to collaborator
//!                                               5. Reply (create_job_record only)
//! 6. Await oneshot receiver        <------
//! ```
//!
//! Delivery is treated as at-least-once with arbitrary (usually sub-second)
//! delay. Every report is a complete snapshot so receivers can apply
//! last-write-wins without caring about duplicates or ordering.
//!
//! # Request/Reply
//!
//! Only `create_job_record` has a reply. Its helper returns the oneshot
//! receiver together with the operation:
//!
//! ```rust
//! use fishface::clock::Timestamp;
//! use fishface::messages::{JobRecordRequest, Operation};
//!
//! let request = JobRecordRequest {
//!     xp_id: 1,
//!     voltage: 5.0,
//!     current: 1.0,
//!     start_timestamp: Timestamp::from_secs(0.0),
//! };
//! let (op, reply) = Operation::create_job_record(request);
//! assert_eq!(op.name(), "create_job_record");
//! # drop(reply);
//! ```

use crate::clock::Timestamp;
use crate::jobs::JobStatusReport;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::oneshot;

/// Identifier assigned by storage to a capture job record.
pub type JobRecordId = i64;

/// Payload of `create_job_record`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecordRequest {
    /// Owning experiment.
    pub xp_id: i64,
    /// Voltage the job runs at.
    pub voltage: f64,
    /// Current limit the job runs at.
    pub current: f64,
    /// Start of the job, used by storage to correlate the record.
    pub start_timestamp: Timestamp,
}

/// Metadata attached to every capture request and forwarded with the image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureMetadata {
    /// Owning experiment.
    pub xp_id: i64,
    /// Job record the image belongs to (`None` for calibration images).
    pub cjr_id: Option<JobRecordId>,
    /// Species tag of the experiment.
    pub species: String,
    /// Voltage at capture time.
    pub voltage: f64,
    /// Current limit at capture time.
    pub current: f64,
    /// Calibration images are not attributed to a job record.
    pub is_cal_image: bool,
}

/// A capture to be taken at `requested_timestamp`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureRequest {
    /// Instant the shutter should fire.
    pub requested_timestamp: Timestamp,
    /// Attribution for the resulting image.
    pub meta: CaptureMetadata,
}

/// A completed capture on its way to storage.
#[derive(Clone)]
pub struct CapturedImage {
    /// Encoded image bytes as produced by the camera.
    pub data: Bytes,
    /// Timestamp the capture was requested for.
    pub requested_timestamp: Timestamp,
    /// Timestamp the device actually captured at.
    pub capture_timestamp: Timestamp,
    /// Clockwise rotation the camera applied, in degrees.
    pub rotation: u32,
    /// Attribution copied from the request.
    pub meta: CaptureMetadata,
}

impl fmt::Debug for CapturedImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapturedImage")
            .field("bytes", &self.data.len())
            .field("requested_timestamp", &self.requested_timestamp)
            .field("capture_timestamp", &self.capture_timestamp)
            .field("rotation", &self.rotation)
            .field("meta", &self.meta)
            .finish()
    }
}

/// Target state for the power supply.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PowerSetting {
    /// Output voltage in volts.
    pub voltage: f64,
    /// Current limit in amps.
    pub current: f64,
    /// Whether the output is enabled.
    pub enable_output: bool,
}

impl PowerSetting {
    /// Setting used by a job: output is enabled for any non-zero voltage.
    pub fn for_job(voltage: f64, current: f64) -> Self {
        Self {
            voltage,
            current,
            enable_output: voltage != 0.0,
        }
    }

    /// Safe idle state: zero volts, zero amps, output off.
    pub const fn off() -> Self {
        Self {
            voltage: 0.0,
            current: 0.0,
            enable_output: false,
        }
    }
}

/// Sensed power-supply values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PowerReading {
    /// When the values were read.
    pub timestamp: Timestamp,
    /// Sensed output voltage.
    pub voltage_meas: f64,
    /// Sensed output current.
    pub current_meas: f64,
    /// Free-form context supplied by the requester.
    pub extra: Option<String>,
}

/// Liveness report from one actor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatReport {
    /// Actor name.
    pub name: String,
    /// Time of the last heartbeat, `None` before the first one.
    pub timestamp: Option<Timestamp>,
    /// Number of heartbeats so far.
    pub count: u64,
    /// Set on the last report an actor ever sends.
    pub is_final: bool,
}

/// Named asynchronous operations exchanged through the substrate.
#[derive(Debug)]
pub enum Operation {
    /// Ask storage for a new capture job record.
    ///
    /// # Response
    ///
    /// The assigned id is sent on `reply`. Dropping `reply` signals that no
    /// record will be created.
    CreateJobRecord {
        /// Record attributes.
        request: JobRecordRequest,
        /// Reply channel for the assigned id.
        reply: oneshot::Sender<JobRecordId>,
    },

    /// Preload a capture into the camera actor.
    QueueCaptureRequest(CaptureRequest),

    /// Stop the camera actor and discard its pending captures.
    CameraAbort,

    /// Apply a voltage/current/output setting.
    SetPowerSupply(PowerSetting),

    /// Return the power supply to its safe idle state.
    ResetPowerSupply,

    /// Full job status snapshot for storage bookkeeping.
    ReportJobStatus(JobStatusReport),

    /// A captured image for storage.
    ReportCapturedImage(CapturedImage),

    /// Sensed power-supply values for storage.
    ReportPowerSupply(PowerReading),

    /// Liveness report for the thread registry.
    Heartbeat(HeartbeatReport),
}

impl Operation {
    /// Builds a `create_job_record` operation and the receiver for its reply.
    pub fn create_job_record(
        request: JobRecordRequest,
    ) -> (Self, oneshot::Receiver<JobRecordId>) {
        let (reply, rx) = oneshot::channel();
        (Operation::CreateJobRecord { request, reply }, rx)
    }

    /// Wire name of the operation, used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Operation::CreateJobRecord { .. } => "create_job_record",
            Operation::QueueCaptureRequest(_) => "queue_capture_request",
            Operation::CameraAbort => "camera_abort",
            Operation::SetPowerSupply(_) => "set_power_supply",
            Operation::ResetPowerSupply => "reset_power_supply",
            Operation::ReportJobStatus(_) => "report_job_status",
            Operation::ReportCapturedImage(_) => "report_captured_image",
            Operation::ReportPowerSupply(_) => "report_power_supply",
            Operation::Heartbeat(_) => "heartbeat",
        }
    }
}

/// Fire-and-forget entry point into the substrate.
///
/// Implementations must not block: dispatching happens from inside actor
/// loops with deadlines to honour.
pub trait Dispatcher: Send + Sync {
    /// Hands `op` to the substrate.
    fn dispatch(&self, op: Operation);
}
