//! Hardware abstraction for the capture rig.
//!
//! Capability traits live in [`capabilities`]; simulated devices for tests
//! and for running without a rig live in [`mock`].

pub mod capabilities;
pub mod mock;

pub use capabilities::{CameraDevice, PowerSupplyDevice};
pub use mock::{MockCamera, MockPowerSupply};

use crate::clock::Timestamp;
use bytes::Bytes;

/// One encoded image.
#[derive(Clone)]
pub struct Frame {
    /// Encoded image (JPEG).
    pub data: Bytes,
    /// When the exposure started.
    pub captured_at: Timestamp,
    /// Clockwise rotation applied by the device, in degrees.
    pub rotation: u32,
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("bytes", &self.data.len())
            .field("captured_at", &self.captured_at)
            .field("rotation", &self.rotation)
            .finish()
    }
}

/// Measured power-supply output.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PowerSense {
    /// Measured voltage in volts.
    pub voltage: f64,
    /// Measured current in amps.
    pub current: f64,
}
