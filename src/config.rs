use anyhow::{anyhow, Result};
use log::info;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::TankError;
use crate::traits::ConfigStore;

/// Full scale of the 12-bit pressure ADC
pub const ADC_MAX: f64 = 4096.0;
/// Highest accepted overflow frequency threshold
pub const MAX_FREQUENCY_THRESHOLD_HZ: f64 = 200.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SystemConfig {
    pub tank: TankConfig,
    pub pressure: PressureConfig,
    pub counter: CounterConfig,
    pub limits: Limits,
    pub notify: NotifyConfig,
}

/// Horizontal cylinder geometry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TankConfig {
    pub radius_cm: f64,
    pub length_cm: f64,
    /// Capacity used for the percentage. `None` = geometric volume.
    pub max_liters: Option<f64>,
    /// Volume change needed before a new reading is reported
    pub report_threshold_liters: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PressureConfig {
    pub adc_period_ms: u64,
    /// ADC samples averaged into one raw reading (<= 1 disables)
    pub oversample_count: usize,
    pub ema_alpha: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CounterConfig {
    /// Gate open time per measurement
    pub window_secs: f64,
    /// Start-to-start period of measurement cycles
    pub cycle_period_secs: f64,
    pub gate_clock_hz: f64,    // APB clock feeding the pulse generator
    pub gate_clock_div: u32,   // pulse generator divider
    pub autostart: bool,
}

/// Thresholds persisted in the config store and changeable at runtime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    pub pressure_low_raw: f64,
    pub pressure_high_raw: f64,
    pub liters_low: f64,
    pub liters_high: f64,
    /// 0 disables overflow detection
    pub overflow_frequency_hz: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    pub heartbeat_secs: f64,
    pub environment_period_ms: u64,
}

impl Default for TankConfig {
    fn default() -> Self {
        // Cylinder lying on its side, 100cm long, 50cm diameter
        TankConfig {
            radius_cm: 25.0,
            length_cm: 100.0,
            max_liters: None,
            report_threshold_liters: 1.5,
        }
    }
}

impl Default for PressureConfig {
    fn default() -> Self {
        PressureConfig {
            adc_period_ms: 40,
            oversample_count: 55,
            ema_alpha: 0.8,
        }
    }
}

impl Default for CounterConfig {
    fn default() -> Self {
        CounterConfig {
            window_secs: 1.0,
            cycle_period_secs: 1.1,
            gate_clock_hz: 80_000_000.0,
            gate_clock_div: 160, // 2us resolution
            autostart: true,
        }
    }
}

impl Default for Limits {
    fn default() -> Self {
        Limits {
            pressure_low_raw: 500.0,
            pressure_high_raw: 680.0,
            liters_low: 20.0,
            liters_high: 180.0,
            overflow_frequency_hz: 100.0,
        }
    }
}

impl Default for NotifyConfig {
    fn default() -> Self {
        NotifyConfig {
            heartbeat_secs: 5.0,
            environment_period_ms: 2500,
        }
    }
}

impl TankConfig {
    pub fn geometric_liters(&self) -> f64 {
        PI * self.radius_cm * self.radius_cm * self.length_cm / 1000.0
    }

    pub fn capacity_liters(&self) -> f64 {
        self.max_liters.unwrap_or_else(|| self.geometric_liters())
    }
}

// ============================================================================
// VALIDATION
// ============================================================================

impl Limits {
    pub fn validate_pressure(low: f64, high: f64) -> Result<(), TankError> {
        if !low.is_finite() || !high.is_finite() || low < 0.0 || high > ADC_MAX || low > high {
            return Err(TankError::Range(format!(
                "pressure limits need 0 <= low <= high <= {}, got low={} high={}",
                ADC_MAX, low, high
            )));
        }
        Ok(())
    }

    pub fn validate_liters(low: f64, high: f64, capacity: f64) -> Result<(), TankError> {
        if !low.is_finite() || !high.is_finite() || low < 0.0 || high > capacity || low > high {
            return Err(TankError::Range(format!(
                "tank limits need 0 <= low <= high <= {:.1}, got low={} high={}",
                capacity, low, high
            )));
        }
        Ok(())
    }

    pub fn validate_frequency(threshold_hz: f64) -> Result<(), TankError> {
        if !(0.0..=MAX_FREQUENCY_THRESHOLD_HZ).contains(&threshold_hz) {
            return Err(TankError::Range(format!(
                "frequency threshold must be in [0, {}], got {}",
                MAX_FREQUENCY_THRESHOLD_HZ, threshold_hz
            )));
        }
        Ok(())
    }

    pub fn validate(&self, capacity: f64) -> Result<(), TankError> {
        Self::validate_pressure(self.pressure_low_raw, self.pressure_high_raw)?;
        Self::validate_liters(self.liters_low, self.liters_high, capacity)?;
        Self::validate_frequency(self.overflow_frequency_hz)
    }
}

impl SystemConfig {
    /// Reject configurations the pipeline cannot be built from.
    pub fn validate(&self) -> Result<(), TankError> {
        let tank = &self.tank;
        if !(tank.radius_cm > 0.0 && tank.length_cm > 0.0) {
            return Err(TankError::Configuration(format!(
                "tank dimensions must be positive: radius={} length={}",
                tank.radius_cm, tank.length_cm
            )));
        }
        if let Some(max) = tank.max_liters {
            if !(max > 0.0) {
                return Err(TankError::Configuration(format!("tank capacity must be positive, got {}", max)));
            }
        }
        if !(tank.report_threshold_liters >= 0.0) {
            return Err(TankError::Configuration(format!(
                "report threshold must not be negative, got {}",
                tank.report_threshold_liters
            )));
        }
        if self.pressure.adc_period_ms == 0 {
            return Err(TankError::Configuration("ADC period must be non-zero".to_string()));
        }
        let counter = &self.counter;
        if !(counter.window_secs > 0.0) || !(counter.cycle_period_secs >= 0.0) {
            return Err(TankError::Configuration(format!(
                "counter window must be positive: window={}s period={}s",
                counter.window_secs, counter.cycle_period_secs
            )));
        }
        if !(counter.gate_clock_hz > 0.0) || counter.gate_clock_div == 0 {
            return Err(TankError::Configuration("gate clock must be positive".to_string()));
        }
        if !(self.notify.heartbeat_secs > 0.0 && self.notify.heartbeat_secs.is_finite()) {
            return Err(TankError::Configuration("heartbeat period must be positive".to_string()));
        }
        if self.notify.environment_period_ms == 0 {
            return Err(TankError::Configuration("environment period must be non-zero".to_string()));
        }
        self.limits.validate(tank.capacity_liters())
    }

    /// Load from a JSON file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!("[Config] {} not found, using defaults", path.display());
            return Ok(SystemConfig::default());
        }
        let text = fs::read_to_string(path)
            .map_err(|e| anyhow!("Failed to read config {}: {}", path.display(), e))?;
        let config: SystemConfig = serde_json::from_str(&text)
            .map_err(|e| anyhow!("Failed to parse config {}: {}", path.display(), e))?;
        info!("[Config] Loaded {}", path.display());
        Ok(config)
    }
}

// ============================================================================
// JSON FILE STORE
// ============================================================================

/// Persists the configuration as pretty JSON next to the binary.
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        JsonFileStore { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigStore for JsonFileStore {
    fn save(&mut self, config: &SystemConfig) -> Result<()> {
        let json = serde_json::to_string_pretty(config)?;
        // Write beside the target and rename so a crash never leaves half a file
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json).map_err(|e| anyhow!("Failed to write {}: {}", tmp.display(), e))?;
        fs::rename(&tmp, &self.path)
            .map_err(|e| anyhow!("Failed to replace {}: {}", self.path.display(), e))?;
        Ok(())
    }
}
