//! In-process operation substrate.
//!
//! [`ChannelDispatcher`] puts operations on an unbounded channel; the
//! [`Router`] task takes them off and hands each to its collaborator:
//!
//! ```text
//! jobs / ECC / capture thread ──dispatch──> mpsc ──> Router ─┬─> ResultStore
//!                                                            ├─> CameraService
//!                                                            ├─> PowerSupplyService
//!                                                            └─> ThreadRegistry
//! ```
//!
//! Operations are routed one at a time in arrival order, so power-supply
//! commands are applied sequentially. `create_job_record` is the exception:
//! it runs on its own task so a slow database never holds up captures.

use crate::actors::ThreadRegistry;
use crate::camera::CameraService;
use crate::messages::{Dispatcher, Operation};
use crate::power::PowerSupplyService;
use crate::storage::ResultStore;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, trace, warn};

/// [`Dispatcher`] over an unbounded channel.
#[derive(Clone)]
pub struct ChannelDispatcher {
    tx: mpsc::UnboundedSender<Operation>,
}

impl ChannelDispatcher {
    /// Creates a dispatcher and the receiving end for the router.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Operation>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Dispatcher for ChannelDispatcher {
    fn dispatch(&self, op: Operation) {
        if let Err(mpsc::error::SendError(op)) = self.tx.send(op) {
            warn!(operation = op.name(), "substrate closed, dropping operation");
        }
    }
}

/// Routes operations to the collaborators.
pub struct Router {
    storage: Arc<dyn ResultStore>,
    camera: Arc<CameraService>,
    power: Arc<PowerSupplyService>,
    registry: Arc<ThreadRegistry>,
}

impl Router {
    /// Creates a router.
    pub fn new(
        storage: Arc<dyn ResultStore>,
        camera: Arc<CameraService>,
        power: Arc<PowerSupplyService>,
        registry: Arc<ThreadRegistry>,
    ) -> Self {
        Self {
            storage,
            camera,
            power,
            registry,
        }
    }

    /// Routes until every sender is gone or `shutdown` fires. On shutdown the
    /// operations already queued are still delivered.
    pub async fn run(
        self,
        mut rx: mpsc::UnboundedReceiver<Operation>,
        mut shutdown: oneshot::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                biased;
                op = rx.recv() => match op {
                    Some(op) => self.route(op).await,
                    None => break,
                },
                _ = &mut shutdown => {
                    while let Ok(op) = rx.try_recv() {
                        self.route(op).await;
                    }
                    break;
                }
            }
        }
        debug!("router stopped");
    }

    /// Delivers one operation.
    pub async fn route(&self, op: Operation) {
        trace!(operation = op.name(), "routing");
        match op {
            Operation::CreateJobRecord { request, reply } => {
                let storage = Arc::clone(&self.storage);
                tokio::spawn(async move {
                    match storage.create_job_record(&request).await {
                        Ok(id) => {
                            if reply.send(id).is_err() {
                                warn!(
                                    xp_id = request.xp_id,
                                    cjr_id = id,
                                    "job stopped waiting before its record id arrived"
                                );
                            }
                        }
                        Err(err) => {
                            error!(xp_id = request.xp_id, error = %err, "job record creation failed");
                        }
                    }
                });
            }
            Operation::QueueCaptureRequest(request) => {
                if let Err(err) = self.camera.queue_capture_request(request).await {
                    error!(error = %err, "capture request could not be queued");
                }
            }
            Operation::CameraAbort => self.camera.abort().await,
            Operation::SetPowerSupply(setting) => {
                if let Err(err) = self.power.apply(setting).await {
                    error!(?setting, error = %err, "power supply setting failed");
                }
            }
            Operation::ResetPowerSupply => {
                if let Err(err) = self.power.reset().await {
                    error!(error = %err, "power supply reset failed");
                }
            }
            Operation::ReportJobStatus(report) => {
                if let Err(err) = self.storage.record_job_status(&report).await {
                    warn!(xp_id = report.xp_id, cjr_id = ?report.cjr_id, error = %err, "status report rejected");
                }
            }
            Operation::ReportCapturedImage(image) => {
                if let Err(err) = self.storage.store_image(&image).await {
                    error!(?image, error = %err, "captured image rejected");
                }
            }
            Operation::ReportPowerSupply(reading) => {
                if let Err(err) = self.storage.record_power_reading(&reading).await {
                    warn!(error = %err, "power reading rejected");
                }
            }
            Operation::Heartbeat(report) => {
                self.registry.receive_heartbeat(&report);
            }
        }
    }
}
