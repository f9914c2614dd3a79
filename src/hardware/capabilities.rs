//! Hardware Capabilities
//!
//! Small capability traits for the two devices the capture core drives:
//!
//! - [`CameraDevice`]: a still camera that is opened lazily, captures one
//!   frame on demand and is released when idle
//! - [`PowerSupplyDevice`]: a programmable supply holding a voltage and a
//!   current limit, with switchable output and read-back of sensed values
//!
//! # Design Philosophy
//!
//! Each capability trait:
//! - Is async (uses #[async_trait])
//! - Is thread-safe (requires Send + Sync)
//! - Uses anyhow::Result for errors
//! - Focuses on ONE device
//!
//! Only one actor ever owns a device (the capture thread owns the camera,
//! the power-supply service owns the supply), so implementations do not
//! need to serialise concurrent callers themselves.
//!
//! # Example
//!
//! ```rust,ignore
//! async fn snapshot<C: CameraDevice>(camera: &C) -> Result<Frame> {
//!     camera.open().await?;
//!     let frame = camera.capture().await;
//!     camera.close().await?;
//!     frame
//! }
//! ```

use anyhow::Result;
use async_trait::async_trait;

use crate::hardware::{Frame, PowerSense};

/// Capability: Still Image Capture
///
/// # Contract
/// - `open` is idempotent; opening an open camera is a no-op
/// - `capture` requires an open camera and returns the encoded image plus the
///   time the exposure actually started
/// - `close` releases the device so other processes may use it
#[async_trait]
pub trait CameraDevice: Send + Sync {
    /// Acquire the device
    async fn open(&self) -> Result<()>;

    /// Release the device
    async fn close(&self) -> Result<()>;

    /// Whether the device is currently held
    fn is_open(&self) -> bool;

    /// Capture a single encoded frame
    ///
    /// # Returns
    /// - Ok(Frame) with the image bytes and the actual capture time
    /// - Err if the camera is closed or the hardware failed
    async fn capture(&self) -> Result<Frame>;

    /// Frame dimensions in pixels (width, height)
    fn resolution(&self) -> (u32, u32);

    /// Clockwise rotation applied to every frame, in degrees
    fn rotation(&self) -> u32;
}

/// Capability: Programmable Power Supply
///
/// # Contract
/// - Setters take effect immediately and are idempotent
/// - `reset` returns the supply to zero volts, zero amps, output off
/// - `sense` reads back the measured output (zero while the output is off)
#[async_trait]
pub trait PowerSupplyDevice: Send + Sync {
    /// Set the output voltage in volts
    async fn set_voltage(&self, volts: f64) -> Result<()>;

    /// Set the current limit in amps
    async fn set_current_limit(&self, amps: f64) -> Result<()>;

    /// Enable or disable the output
    async fn set_output(&self, enabled: bool) -> Result<()>;

    /// Return to the safe idle state
    async fn reset(&self) -> Result<()>;

    /// Read measured voltage and current
    async fn sense(&self) -> Result<PowerSense>;
}
