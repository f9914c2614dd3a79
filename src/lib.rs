//! # FishFace Capture Core
//!
//! Capture-job coordination and heartbeat/liveness core of the FishFace
//! imaging rig. A power supply holds a voltage/current setting while a camera
//! captures fish at fixed intervals; this crate sequences those capture jobs
//! against wall-clock deadlines and keeps track of which background task is
//! alive.
//!
//! ## Crate Structure
//!
//! - **`clock`**: wall-clock timestamps anchored to tokio's monotonic clock.
//! - **`actors`**: the generic heartbeat actor loop and the liveness registry.
//! - **`messages`**: the closed set of operations exchanged between actors and
//!   collaborators, and the `Dispatcher` seam.
//! - **`proxy`**: typed camera, power-supply and storage proxies over a
//!   dispatcher.
//! - **`jobs`**: job specifications, validation, status reports and the
//!   capture / captureless job actors.
//! - **`controller`**: the experiment capture controller (queue, current and
//!   staged job).
//! - **`service`**: the long-lived capture service callers talk to.
//! - **`camera`**: the capture thread (exclusive camera owner) and the camera
//!   service.
//! - **`power`**: the power-supply service.
//! - **`storage`**: the storage collaborator trait and an in-memory store.
//! - **`hardware`**: device capability traits and mock devices.
//! - **`substrate`**: channel dispatcher and operation router.
//! - **`system`**: wiring of all of the above.
//! - **`config`**, **`logging`**, **`error`**, **`queue_file`**: ambient
//!   configuration, logging setup, the crate error type and queue files.

pub mod actors;
pub mod camera;
pub mod clock;
pub mod config;
pub mod controller;
pub mod error;
pub mod hardware;
pub mod jobs;
pub mod logging;
pub mod messages;
pub mod power;
pub mod proxy;
pub mod queue_file;
pub mod service;
pub mod storage;
pub mod substrate;
pub mod system;

pub use error::{AppResult, CaptureError};
