//! Mock Hardware Implementations
//!
//! Provides simulated devices for tests and for running the capture core
//! without a rig. All mock devices use async-safe operations
//! (tokio::time::sleep, not std::thread::sleep), so they behave under paused
//! tokio time.
//!
//! # Available Mocks
//!
//! - `MockCamera` - Simulated still camera producing small fake JPEGs
//! - `MockPowerSupply` - Simulated supply with noisy read-back
//!
//! # Performance Characteristics
//!
//! - MockCamera: 50ms open, 200ms exposure + readout per capture
//! - MockPowerSupply: 5ms per command

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::time::{sleep, Duration};
use tracing::debug;

use crate::clock::Clock;
use crate::hardware::capabilities::{CameraDevice, PowerSupplyDevice};
use crate::hardware::{Frame, PowerSense};

// =============================================================================
// MockCamera - Simulated Still Camera
// =============================================================================

/// Mock still camera
///
/// Simulates a camera with:
/// - Configurable resolution and rotation
/// - 200ms capture latency (configurable)
/// - Open/close tracking so tests can assert the device is released
/// - Injectable capture failures
///
/// # Example
///
/// ```rust,ignore
/// let camera = MockCamera::new(Clock::system(), 512, 384).with_rotation(180);
/// camera.open().await?;
/// let frame = camera.capture().await?;
/// assert!(frame.data.starts_with(&[0xFF, 0xD8]));
/// ```
pub struct MockCamera {
    clock: Clock,
    resolution: (u32, u32),
    rotation: u32,
    capture_latency: Duration,
    open: AtomicBool,
    frame_count: AtomicU64,
    open_count: AtomicU64,
    fail_captures: AtomicBool,
}

impl MockCamera {
    /// Create new mock camera with specified resolution
    pub fn new(clock: Clock, width: u32, height: u32) -> Self {
        Self {
            clock,
            resolution: (width, height),
            rotation: 0,
            capture_latency: Duration::from_millis(200),
            open: AtomicBool::new(false),
            frame_count: AtomicU64::new(0),
            open_count: AtomicU64::new(0),
            fail_captures: AtomicBool::new(false),
        }
    }

    /// Override the simulated capture latency
    pub fn with_capture_latency(mut self, latency: Duration) -> Self {
        self.capture_latency = latency;
        self
    }

    /// Rotate every frame clockwise by `degrees`
    pub fn with_rotation(mut self, degrees: u32) -> Self {
        self.rotation = degrees % 360;
        self
    }

    /// Make every following capture fail until reset
    pub fn set_failing(&self, failing: bool) {
        self.fail_captures.store(failing, Ordering::SeqCst);
    }

    /// Get total number of frames captured
    pub fn frame_count(&self) -> u64 {
        self.frame_count.load(Ordering::SeqCst)
    }

    /// How many times the device was opened
    pub fn open_count(&self) -> u64 {
        self.open_count.load(Ordering::SeqCst)
    }

    fn fake_jpeg(&self, frame_number: u64) -> Bytes {
        let (width, height) = self.resolution;
        let payload = (width as usize * height as usize / 64).max(16);
        let mut buf = BytesMut::with_capacity(payload + 4);
        buf.put_slice(&[0xFF, 0xD8]);
        for i in 0..payload {
            buf.put_u8(((frame_number as usize + i) % 251) as u8);
        }
        buf.put_slice(&[0xFF, 0xD9]);
        buf.freeze()
    }
}

#[async_trait]
impl CameraDevice for MockCamera {
    async fn open(&self) -> Result<()> {
        if self.open.load(Ordering::SeqCst) {
            return Ok(());
        }
        sleep(Duration::from_millis(50)).await;
        self.open.store(true, Ordering::SeqCst);
        self.open_count.fetch_add(1, Ordering::SeqCst);
        debug!("MockCamera: opened");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.open.swap(false, Ordering::SeqCst) {
            debug!("MockCamera: closed");
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn capture(&self) -> Result<Frame> {
        if !self.is_open() {
            return Err(anyhow!("MockCamera: capture on a closed camera"));
        }
        let captured_at = self.clock.now();
        // CRITICAL: Use tokio::time::sleep, NOT std::thread::sleep
        sleep(self.capture_latency).await;
        if self.fail_captures.load(Ordering::SeqCst) {
            return Err(anyhow!("MockCamera: simulated capture failure"));
        }
        let frame_number = self.frame_count.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Frame {
            data: self.fake_jpeg(frame_number),
            captured_at,
            rotation: self.rotation,
        })
    }

    fn resolution(&self) -> (u32, u32) {
        match self.rotation {
            90 | 270 => (self.resolution.1, self.resolution.0),
            _ => self.resolution,
        }
    }

    fn rotation(&self) -> u32 {
        self.rotation
    }
}

// =============================================================================
// MockPowerSupply - Simulated Programmable Supply
// =============================================================================

/// Setting currently held by a [`MockPowerSupply`].
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MockSupplyState {
    /// Programmed voltage
    pub voltage: f64,
    /// Programmed current limit
    pub current_limit: f64,
    /// Output enabled
    pub output: bool,
}

/// Mock power supply with simulated read-back
///
/// Simulates a supply with:
/// - 5ms per command
/// - Read-back with up to 5% random noise while the output is enabled
/// - Zero read-back while the output is off
pub struct MockPowerSupply {
    state: Mutex<MockSupplyState>,
    commands: AtomicU64,
}

impl MockPowerSupply {
    /// Create a supply in the idle state
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockSupplyState::default()),
            commands: AtomicU64::new(0),
        }
    }

    /// Currently programmed setting
    pub fn state(&self) -> MockSupplyState {
        *self.state.lock()
    }

    /// Number of commands received
    pub fn command_count(&self) -> u64 {
        self.commands.load(Ordering::SeqCst)
    }

    async fn command(&self) {
        self.commands.fetch_add(1, Ordering::SeqCst);
        sleep(Duration::from_millis(5)).await;
    }
}

impl Default for MockPowerSupply {
    fn default() -> Self {
        Self::new()
    }
}

fn noisy(value: f64) -> f64 {
    value * (1.0 + rand::thread_rng().gen_range(-0.05..=0.05))
}

#[async_trait]
impl PowerSupplyDevice for MockPowerSupply {
    async fn set_voltage(&self, volts: f64) -> Result<()> {
        self.command().await;
        self.state.lock().voltage = volts;
        Ok(())
    }

    async fn set_current_limit(&self, amps: f64) -> Result<()> {
        self.command().await;
        self.state.lock().current_limit = amps;
        Ok(())
    }

    async fn set_output(&self, enabled: bool) -> Result<()> {
        self.command().await;
        self.state.lock().output = enabled;
        Ok(())
    }

    async fn reset(&self) -> Result<()> {
        self.command().await;
        *self.state.lock() = MockSupplyState::default();
        Ok(())
    }

    async fn sense(&self) -> Result<PowerSense> {
        self.command().await;
        let state = self.state();
        if !state.output {
            return Ok(PowerSense {
                voltage: 0.0,
                current: 0.0,
            });
        }
        Ok(PowerSense {
            voltage: noisy(state.voltage),
            current: noisy(state.current_limit * 0.9),
        })
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_mock_camera_requires_open() {
        let camera = MockCamera::new(Clock::system(), 512, 384);
        assert!(camera.capture().await.is_err());

        camera.open().await.unwrap();
        camera.open().await.unwrap();
        assert_eq!(camera.open_count(), 1);

        let frame = camera.capture().await.unwrap();
        assert!(frame.data.starts_with(&[0xFF, 0xD8]));
        assert!(frame.data.ends_with(&[0xFF, 0xD9]));
        assert_eq!(camera.frame_count(), 1);

        camera.close().await.unwrap();
        assert!(!camera.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_mock_camera_stamps_exposure_start() {
        let clock = Clock::system();
        let camera = MockCamera::new(clock, 64, 48);
        camera.open().await.unwrap();
        let before = clock.now();
        let frame = camera.capture().await.unwrap();
        assert_eq!(frame.captured_at, before);
        assert!(clock.now().seconds_since(before) >= 0.2 - 1e-6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mock_camera_rotation() {
        let camera = MockCamera::new(Clock::system(), 64, 48).with_rotation(90);
        assert_eq!(camera.rotation(), 90);
        assert_eq!(camera.resolution(), (48, 64));
        camera.open().await.unwrap();
        let frame = camera.capture().await.unwrap();
        assert_eq!(frame.rotation, 90);

        let upside_down = MockCamera::new(Clock::system(), 64, 48).with_rotation(180);
        assert_eq!(upside_down.resolution(), (64, 48));
    }

    #[tokio::test(start_paused = true)]
    async fn test_mock_camera_injected_failure() {
        let camera = MockCamera::new(Clock::system(), 64, 48);
        camera.open().await.unwrap();
        camera.set_failing(true);
        assert!(camera.capture().await.is_err());
        assert_eq!(camera.frame_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mock_supply_sense_follows_output() {
        let supply = MockPowerSupply::new();
        supply.set_voltage(10.0).await.unwrap();
        supply.set_current_limit(2.0).await.unwrap();
        assert_eq!(supply.sense().await.unwrap().voltage, 0.0);

        supply.set_output(true).await.unwrap();
        let sense = supply.sense().await.unwrap();
        assert!((sense.voltage - 10.0).abs() <= 0.5 + 1e-9);
        assert!((sense.current - 1.8).abs() <= 0.09 + 1e-9);

        supply.reset().await.unwrap();
        assert_eq!(supply.state(), MockSupplyState::default());
    }
}
