//! Runtime commands accepted from the API layer
//!
//! Commands arrive as JSON objects tagged by `method`, for example
//! `{"method": "Pressure.SetLimits", "low_thr": 480, "high_thr": 690}`.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method")]
pub enum Command {
    /// Current Sensor Info snapshot
    #[serde(rename = "Device.Status")]
    DeviceStatus,

    /// Raw ADC values mapped to 0% and 100%
    #[serde(rename = "Pressure.SetLimits")]
    PressureSetLimits { low_thr: f64, high_thr: f64 },

    /// Liter bounds for LOW / FULL
    #[serde(rename = "Tank.SetLimits")]
    TankSetLimits { low_thr: f64, high_thr: f64 },

    /// Overflow frequency threshold in Hz (0 disables)
    #[serde(rename = "Counter.SetLimits")]
    CounterSetLimits { freq_thr: f64 },

    #[serde(rename = "Counter.Start")]
    CounterStart,

    #[serde(rename = "Counter.Stop")]
    CounterStop,
}

impl Command {
    pub fn method(&self) -> &'static str {
        match self {
            Command::DeviceStatus => "Device.Status",
            Command::PressureSetLimits { .. } => "Pressure.SetLimits",
            Command::TankSetLimits { .. } => "Tank.SetLimits",
            Command::CounterSetLimits { .. } => "Counter.SetLimits",
            Command::CounterStart => "Counter.Start",
            Command::CounterStop => "Counter.Stop",
        }
    }

    /// Whether the command changes persisted configuration.
    pub fn is_config_change(&self) -> bool {
        matches!(
            self,
            Command::PressureSetLimits { .. } | Command::TankSetLimits { .. } | Command::CounterSetLimits { .. }
        )
    }
}
