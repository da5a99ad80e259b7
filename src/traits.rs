use anyhow::Result;

use crate::config::SystemConfig;
use crate::counter::GatePlan;
use crate::status::{EnvironmentReading, RawReading, SensorInfo, Trigger};

/// Raw pressure ADC channel.
#[cfg_attr(test, mockall::automock)]
pub trait AdcSource {
    fn read_raw(&mut self) -> Result<u16>;
}

/// Edge counter whose input is gated by a hardware-timed pulse.
///
/// One measurement is `clear()`, `gate(plan)`, `count()`. `gate` blocks
/// until the pulse generator has closed the gate again.
#[cfg_attr(test, mockall::automock)]
pub trait GatedCounter: Send {
    /// Pause, zero and resume the counter.
    fn clear(&mut self) -> Result<()>;

    /// Play `plan` on the pulse generator and return once the gate closed.
    fn gate(&mut self, plan: &GatePlan) -> Result<()>;

    /// Edges (rising and falling) accumulated since the last clear.
    fn count(&mut self) -> Result<u32>;

    /// Release the pulse generator after the last cycle. Default does nothing.
    fn halt(&mut self) -> Result<()> { Ok(()) }
}

/// Ambient temperature / pressure / humidity sensor.
#[cfg_attr(test, mockall::automock)]
pub trait EnvironmentSensor {
    fn read(&mut self) -> Result<EnvironmentReading>;
}

/// Persistent storage for the configuration.
#[cfg_attr(test, mockall::automock)]
pub trait ConfigStore {
    fn save(&mut self, config: &SystemConfig) -> Result<()>;
}

/// Outbound notification layer (HTTP, websocket, MQTT, ...).
#[cfg_attr(test, mockall::automock)]
pub trait Notifier {
    fn notify(&mut self, trigger: Trigger, info: &SensorInfo, raw: &RawReading);
}
