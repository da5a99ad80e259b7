//! Tank volume from water height
//!
//! The tank is a horizontal cylinder. For radius `r`, length `L` and water
//! height `h` the wetted cross-section is a circular segment:
//!
//! ```text
//! V = L * ( r^2 * acos(1 - h/r) - (r - h) * sqrt(2rh - h^2) )
//! ```
//!
//! Readings are debounced on liters: a new one is reported only after it
//! moved more than the report threshold away from the last reported value.

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::config::TankConfig;
use crate::error::TankError;
use crate::status::TankStatus;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Default)]
pub struct VolumeReading {
    pub liters: f64,
    pub percent: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TankGeometry {
    radius_cm: f64,
    length_cm: f64,
    capacity_liters: f64,
}

impl TankGeometry {
    pub fn new(radius_cm: f64, length_cm: f64, capacity_liters: f64) -> Result<Self, TankError> {
        if !(radius_cm > 0.0 && length_cm > 0.0 && capacity_liters > 0.0) {
            return Err(TankError::Configuration(format!(
                "invalid tank geometry: r={} L={} capacity={}",
                radius_cm, length_cm, capacity_liters
            )));
        }
        Ok(TankGeometry {
            radius_cm,
            length_cm,
            capacity_liters,
        })
    }

    pub fn from_config(tank: &TankConfig) -> Result<Self, TankError> {
        Self::new(tank.radius_cm, tank.length_cm, tank.capacity_liters())
    }

    pub fn diameter_cm(&self) -> f64 {
        2.0 * self.radius_cm
    }

    pub fn capacity_liters(&self) -> f64 {
        self.capacity_liters
    }

    /// Volume held at `height_cm`. Heights outside the tank are pinned to it.
    pub fn compute(&self, height_cm: f64) -> VolumeReading {
        let r = self.radius_cm;
        let h = if height_cm.is_nan() {
            0.0
        } else {
            height_cm.clamp(0.0, 2.0 * r)
        };

        // Both arguments sit exactly on their domain edge at h=0 and h=2r,
        // rounding must not push them past it
        let acos_arg = (1.0 - h / r).clamp(-1.0, 1.0);
        let sqrt_arg = (2.0 * r * h - h * h).max(0.0);

        let volume_cm3 = self.length_cm * (r * r * acos_arg.acos() - (r - h) * sqrt_arg.sqrt());
        let liters = volume_cm3 / 1000.0;

        VolumeReading {
            liters,
            percent: liters / self.capacity_liters * 100.0,
        }
    }
}

/// Debounced volume reporting.
#[derive(Debug)]
pub struct VolumeReporter {
    geometry: TankGeometry,
    threshold_liters: f64,
    last_reported_liters: f64,
}

impl VolumeReporter {
    pub fn new(geometry: TankGeometry, threshold_liters: f64) -> Self {
        VolumeReporter {
            geometry,
            threshold_liters,
            last_reported_liters: 0.0,
        }
    }

    /// Returns a reading only when it differs from the last reported one by
    /// more than the threshold.
    pub fn update(&mut self, height_cm: f64) -> Option<VolumeReading> {
        let reading = self.geometry.compute(height_cm);
        debug!("[Volume] height={:.2}cm -> {:.2}L ({:.1}%)", height_cm, reading.liters, reading.percent);

        if (reading.liters - self.last_reported_liters).abs() > self.threshold_liters {
            info!(
                "[Volume] {:.1}L -> {:.1}L ({:.1}%)",
                self.last_reported_liters, reading.liters, reading.percent
            );
            self.last_reported_liters = reading.liters;
            return Some(reading);
        }
        None
    }

    pub fn last_reported_liters(&self) -> f64 {
        self.last_reported_liters
    }

    pub fn geometry(&self) -> &TankGeometry {
        &self.geometry
    }
}

// ============================================================================
// STATUS
// ============================================================================

/// Classify against exclusive liter bounds: on a bound is still normal.
pub fn classify(liters: f64, low_liters: f64, high_liters: f64) -> TankStatus {
    if liters < low_liters {
        TankStatus::Low
    } else if liters > high_liters {
        TankStatus::Full
    } else {
        TankStatus::Normal
    }
}

/// Remembers the last notified value of a flag-like signal and reports only
/// real changes.
#[derive(Debug, Default)]
pub struct ChangeTracker<T> {
    last_notified: Option<T>,
}

impl<T: Copy + PartialEq> ChangeTracker<T> {
    pub fn new() -> Self {
        ChangeTracker { last_notified: None }
    }

    /// Seeded tracker: `value` counts as already notified.
    pub fn seeded(value: T) -> Self {
        ChangeTracker { last_notified: Some(value) }
    }

    /// True when `value` differs from the last notified value.
    pub fn update(&mut self, value: T) -> bool {
        if self.last_notified == Some(value) {
            return false;
        }
        self.last_notified = Some(value);
        true
    }

    pub fn last(&self) -> Option<T> {
        self.last_notified
    }
}
