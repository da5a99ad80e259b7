use serde::{Deserialize, Serialize};

/// Tank fill classification against the liter limits.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TankStatus {
    Low,
    #[default]
    Normal,
    Full,
}

impl TankStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TankStatus::Low => "low",
            TankStatus::Normal => "normal",
            TankStatus::Full => "full",
        }
    }
}

/// Why the notification layer is being called.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    /// Periodic heartbeat, nothing changed
    Timer,
    /// Raw ADC or counter values changed
    RawChanged,
    /// Volume, tank status or overflow flag changed
    StatusChanged,
}

/// One read of the ambient sensor
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Default)]
pub struct EnvironmentReading {
    pub temperature: f64, // degC
    pub pressure: f64,    // hPa
    pub humidity: f64,    // %RH
}

/// Calibrated state published to the notification layer
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct SensorInfo {
    /// Unix timestamp of the last sensor update
    pub timestamp: i64,
    pub air_temperature: f64,
    pub air_pressure: f64,
    pub air_humidity: f64,
    pub tank_liters: f64,
    pub tank_percentage: f64,
    pub tank_status: TankStatus,
    pub tank_overflow: bool,
}

/// Uncalibrated readings, mostly useful when choosing calibration points
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct RawReading {
    pub timestamp: i64,
    pub tank_pressure_adc: u16,
    pub counter_count: u32,
    pub counter_frequency: f64,
}
