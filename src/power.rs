//! Power-supply service.
//!
//! Owns the [`PowerSupplyDevice`] and applies settings sent as
//! `set_power_supply` / `reset_power_supply` operations. The router calls it
//! from a single task, so commands are applied one after another in arrival
//! order. After every change the sensed output is published to storage.

use crate::clock::Clock;
use crate::hardware::PowerSupplyDevice;
use crate::messages::{PowerReading, PowerSetting};
use crate::proxy::StorageProxy;
use anyhow::Result;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info};

/// Applies power settings and reports what the supply measures.
pub struct PowerSupplyService {
    device: Arc<dyn PowerSupplyDevice>,
    storage: StorageProxy,
    clock: Clock,
    setting: Mutex<Option<PowerSetting>>,
}

impl PowerSupplyService {
    /// Wraps a device.
    pub fn new(device: Arc<dyn PowerSupplyDevice>, storage: StorageProxy, clock: Clock) -> Self {
        Self {
            device,
            storage,
            clock,
            setting: Mutex::new(None),
        }
    }

    /// Programs voltage, current limit and output enable, then reports the
    /// sensed values.
    pub async fn apply(&self, setting: PowerSetting) -> Result<PowerReading> {
        let previous = *self.setting.lock();
        if previous == Some(setting) {
            debug!(?setting, "re-applying unchanged power setting");
        }

        self.device.set_voltage(setting.voltage).await?;
        info!(voltage = setting.voltage, "power supply voltage set");
        self.device.set_current_limit(setting.current).await?;
        info!(current = setting.current, "power supply current limit set");
        self.device.set_output(setting.enable_output).await?;
        info!(enabled = setting.enable_output, "power supply output switched");

        *self.setting.lock() = Some(setting);
        self.report(None).await
    }

    /// Returns the supply to zero volts, zero amps, output off.
    pub async fn reset(&self) -> Result<PowerReading> {
        self.device.reset().await?;
        *self.setting.lock() = Some(PowerSetting::off());
        info!("power supply reset");
        self.report(Some("reset".to_string())).await
    }

    /// Reads the supply and publishes `report_power_supply`.
    pub async fn report(&self, extra: Option<String>) -> Result<PowerReading> {
        let sense = self.device.sense().await?;
        let reading = PowerReading {
            timestamp: self.clock.now(),
            voltage_meas: sense.voltage,
            current_meas: sense.current,
            extra,
        };
        debug!(
            voltage = reading.voltage_meas,
            current = reading.current_meas,
            "power supply sensed"
        );
        self.storage.report_power_supply(reading.clone());
        Ok(reading)
    }

    /// Last setting applied through this service.
    pub fn setting(&self) -> Option<PowerSetting> {
        *self.setting.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::MockPowerSupply;
    use crate::messages::{Dispatcher, Operation};

    #[derive(Default)]
    struct Readings(parking_lot::Mutex<Vec<PowerReading>>);

    impl Dispatcher for Readings {
        fn dispatch(&self, op: Operation) {
            if let Operation::ReportPowerSupply(reading) = op {
                self.0.lock().push(reading);
            }
        }
    }

    fn service() -> (PowerSupplyService, Arc<MockPowerSupply>, Arc<Readings>) {
        let device = Arc::new(MockPowerSupply::new());
        let readings = Arc::new(Readings::default());
        let service = PowerSupplyService::new(
            Arc::clone(&device) as Arc<dyn PowerSupplyDevice>,
            StorageProxy::new(Arc::clone(&readings) as Arc<dyn Dispatcher>),
            Clock::system(),
        );
        (service, device, readings)
    }

    #[tokio::test(start_paused = true)]
    async fn apply_programs_device_and_reports() {
        let (service, device, readings) = service();
        let reading = service.apply(PowerSetting::for_job(12.0, 2.0)).await.unwrap();

        let state = device.state();
        assert_eq!(state.voltage, 12.0);
        assert_eq!(state.current_limit, 2.0);
        assert!(state.output);
        assert!(reading.voltage_meas > 11.0);
        assert_eq!(readings.0.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_voltage_keeps_output_off() {
        let (service, device, _) = service();
        let reading = service.apply(PowerSetting::for_job(0.0, 1.0)).await.unwrap();
        assert!(!device.state().output);
        assert_eq!(reading.voltage_meas, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_returns_to_idle() {
        let (service, device, readings) = service();
        service.apply(PowerSetting::for_job(12.0, 2.0)).await.unwrap();
        service.reset().await.unwrap();

        assert!(!device.state().output);
        assert_eq!(service.setting(), Some(PowerSetting::off()));
        let readings = readings.0.lock();
        assert_eq!(readings.last().unwrap().extra.as_deref(), Some("reset"));
    }
}
