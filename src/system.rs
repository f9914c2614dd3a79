//! Assembly of the capture core.
//!
//! [`System::start`] wires the substrate, the collaborators and the capture
//! service from configuration and returns a handle that owns all of them.

use crate::actors::ThreadRegistry;
use crate::camera::CameraService;
use crate::clock::Clock;
use crate::config::FishFaceConfig;
use crate::hardware::{CameraDevice, MockCamera, MockPowerSupply, PowerSupplyDevice};
use crate::jobs::JobDeps;
use crate::messages::Dispatcher;
use crate::power::PowerSupplyService;
use crate::proxy::StorageProxy;
use crate::service::CaptureService;
use crate::storage::{MemoryResultStore, ResultStore};
use crate::substrate::{ChannelDispatcher, Router};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Simulated rig returned by [`System::start_mock`].
#[derive(Clone)]
pub struct MockRig {
    /// Simulated camera.
    pub camera: Arc<MockCamera>,
    /// Simulated power supply.
    pub power: Arc<MockPowerSupply>,
    /// In-memory storage.
    pub store: Arc<MemoryResultStore>,
}

/// Running capture core.
pub struct System {
    clock: Clock,
    config: FishFaceConfig,
    dispatcher: Arc<dyn Dispatcher>,
    registry: Arc<ThreadRegistry>,
    camera: Arc<CameraService>,
    power: Arc<PowerSupplyService>,
    service: CaptureService,
    router: JoinHandle<()>,
    router_shutdown: Option<oneshot::Sender<()>>,
}

impl System {
    /// Wires everything around the given devices and store and starts the
    /// router. Must be called inside a tokio runtime.
    pub fn start(
        config: FishFaceConfig,
        clock: Clock,
        camera: Arc<dyn CameraDevice>,
        power: Arc<dyn PowerSupplyDevice>,
        store: Arc<dyn ResultStore>,
    ) -> Self {
        let (channel, rx) = ChannelDispatcher::new();
        let dispatcher: Arc<dyn Dispatcher> = Arc::new(channel);
        let registry = Arc::new(ThreadRegistry::new());

        let camera = Arc::new(CameraService::new(
            camera,
            config.camera,
            clock,
            Arc::clone(&dispatcher),
        ));
        let power = Arc::new(PowerSupplyService::new(
            power,
            StorageProxy::new(Arc::clone(&dispatcher)),
            clock,
        ));

        let router = Router::new(
            store,
            Arc::clone(&camera),
            Arc::clone(&power),
            Arc::clone(&registry),
        );
        let (router_shutdown, shutdown_rx) = oneshot::channel();
        let router = tokio::spawn(router.run(rx, shutdown_rx));

        let deps = JobDeps::new(clock, Arc::clone(&dispatcher), config.jobs);
        let service = CaptureService::new(deps, config.controller, Arc::clone(&registry));
        info!("capture core started");

        Self {
            clock,
            config,
            dispatcher,
            registry,
            camera,
            power,
            service,
            router,
            router_shutdown: Some(router_shutdown),
        }
    }

    /// Starts the core on simulated hardware and in-memory storage.
    pub fn start_mock(config: FishFaceConfig, clock: Clock) -> (Self, MockRig) {
        let rig = MockRig {
            camera: Arc::new(
                MockCamera::new(clock, config.camera.width, config.camera.height)
                    .with_rotation(config.camera.rotation),
            ),
            power: Arc::new(MockPowerSupply::new()),
            store: Arc::new(MemoryResultStore::new()),
        };
        let system = Self::start(
            config,
            clock,
            Arc::clone(&rig.camera) as Arc<dyn CameraDevice>,
            Arc::clone(&rig.power) as Arc<dyn PowerSupplyDevice>,
            Arc::clone(&rig.store) as Arc<dyn ResultStore>,
        );
        (system, rig)
    }

    /// Capture service (queue, status, aborts).
    pub fn service(&self) -> &CaptureService {
        &self.service
    }

    /// Camera service.
    pub fn camera(&self) -> &CameraService {
        &self.camera
    }

    /// Power-supply service.
    pub fn power(&self) -> &PowerSupplyService {
        &self.power
    }

    /// Liveness registry.
    pub fn registry(&self) -> &ThreadRegistry {
        &self.registry
    }

    /// Entry point of the substrate.
    pub fn dispatcher(&self) -> Arc<dyn Dispatcher> {
        Arc::clone(&self.dispatcher)
    }

    /// Shared clock.
    pub fn clock(&self) -> Clock {
        self.clock
    }

    /// Effective configuration.
    pub fn config(&self) -> &FishFaceConfig {
        &self.config
    }

    /// Stops the controller and the camera, delivers the operations still
    /// in flight and stops the router.
    pub async fn shutdown(mut self) {
        self.service.shutdown().await;
        self.camera.shutdown().await;
        if let Some(tx) = self.router_shutdown.take() {
            // the router is gone already if this fails
            let _ = tx.send(());
        }
        if let Err(err) = self.router.await {
            error!(error = %err, "router task did not complete");
        }
        info!("capture core stopped");
    }
}
