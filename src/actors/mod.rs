//! Heartbeat actors and their liveness registry.
//!
//! Every long-lived task in the capture core (controller, jobs, capture
//! thread) is a [`HeartbeatActor`] driven by [`spawn`]. Liveness flows into
//! the [`ThreadRegistry`] as `heartbeat` operations.

pub mod heartbeat;
pub mod registry;

pub use heartbeat::{spawn, ActorContext, ActorExit, ActorTask, HeartbeatActor, StopReason};
pub use registry::{ThreadRegistration, ThreadRegistry, ThreadState};
