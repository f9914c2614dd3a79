//! Typed proxies for the remote capability providers.
//!
//! The camera, the power supply and storage live behind the substrate. The
//! proxies turn method calls into [`Operation`]s so actors never build
//! messages by hand and never touch a collaborator directly.

use crate::jobs::JobStatusReport;
use crate::messages::{
    CaptureRequest, CapturedImage, Dispatcher, JobRecordId, JobRecordRequest, Operation,
    PowerReading, PowerSetting,
};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::trace;

/// Camera actor as seen from jobs and the controller.
#[derive(Clone)]
pub struct CameraProxy {
    dispatcher: Arc<dyn Dispatcher>,
}

impl CameraProxy {
    /// Wraps a dispatcher.
    pub fn new(dispatcher: Arc<dyn Dispatcher>) -> Self {
        Self { dispatcher }
    }

    /// Preloads a capture request. Fire-and-forget.
    pub fn queue_capture_request(&self, request: CaptureRequest) {
        trace!(at = %request.requested_timestamp, "queue_capture_request");
        self.dispatcher
            .dispatch(Operation::QueueCaptureRequest(request));
    }

    /// Cancels all outstanding camera work.
    pub fn abort(&self) {
        self.dispatcher.dispatch(Operation::CameraAbort);
    }
}

/// Power-supply actor.
#[derive(Clone)]
pub struct PowerSupplyProxy {
    dispatcher: Arc<dyn Dispatcher>,
}

impl PowerSupplyProxy {
    /// Wraps a dispatcher.
    pub fn new(dispatcher: Arc<dyn Dispatcher>) -> Self {
        Self { dispatcher }
    }

    /// Applies a setting. Idempotent and fire-and-forget.
    pub fn set(&self, setting: PowerSetting) {
        self.dispatcher.dispatch(Operation::SetPowerSupply(setting));
    }

    /// Returns the supply to zero volts, zero amps, output off.
    pub fn reset(&self) {
        self.dispatcher.dispatch(Operation::ResetPowerSupply);
    }
}

/// Storage collaborator.
#[derive(Clone)]
pub struct StorageProxy {
    dispatcher: Arc<dyn Dispatcher>,
}

impl StorageProxy {
    /// Wraps a dispatcher.
    pub fn new(dispatcher: Arc<dyn Dispatcher>) -> Self {
        Self { dispatcher }
    }

    /// Requests a new job record. The receiver yields the assigned id, or an
    /// error if storage dropped the request.
    pub fn create_job_record(&self, request: JobRecordRequest) -> oneshot::Receiver<JobRecordId> {
        let (op, reply) = Operation::create_job_record(request);
        self.dispatcher.dispatch(op);
        reply
    }

    /// Publishes a full job status snapshot.
    pub fn report_job_status(&self, report: JobStatusReport) {
        self.dispatcher.dispatch(Operation::ReportJobStatus(report));
    }

    /// Hands over a captured image.
    pub fn report_captured_image(&self, image: CapturedImage) {
        self.dispatcher
            .dispatch(Operation::ReportCapturedImage(image));
    }

    /// Publishes sensed power-supply values.
    pub fn report_power_supply(&self, reading: PowerReading) {
        self.dispatcher.dispatch(Operation::ReportPowerSupply(reading));
    }
}

/// All three proxies over one dispatcher.
#[derive(Clone)]
pub struct Collaborators {
    /// Camera actor.
    pub camera: CameraProxy,
    /// Power-supply actor.
    pub power: PowerSupplyProxy,
    /// Storage collaborator.
    pub storage: StorageProxy,
}

impl Collaborators {
    /// Builds the proxies over `dispatcher`.
    pub fn new(dispatcher: Arc<dyn Dispatcher>) -> Self {
        Self {
            camera: CameraProxy::new(Arc::clone(&dispatcher)),
            power: PowerSupplyProxy::new(Arc::clone(&dispatcher)),
            storage: StorageProxy::new(dispatcher),
        }
    }
}
