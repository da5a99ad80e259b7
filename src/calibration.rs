//! Pressure calibration pipeline
//!
//! Two observables in series:
//!
//! 1. `tank_pressure_raw`: oversampling block average, then an EMA that
//!    smooths ADC noise. The EMA passes its first sample through unchanged.
//! 2. `tank_water_height`: linear fit raw -> percent (two calibration
//!    points at 0% and 100%), clamp to [0, 100], linear fit percent ->
//!    water height over the tank diameter.
//!
//! The first linear fit can be recalibrated at runtime without touching the
//! EMA state upstream.

use log::info;

use crate::config::{Limits, PressureConfig};
use crate::error::TankError;
use crate::filter::{BlockAverage, Clamp, ExpMovingAverage, Filter, LinearFit};
use crate::observable::{ObservableValue, Observed, ObserverId};

// Position of the raw -> percent fit in the height chain
const PRESSURE_FIT: usize = 0;

/// What one ADC sample produced.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CalibrationOutput {
    /// Smoothed raw value, when the raw stage accepted the sample
    pub raw: Option<f64>,
    /// Water height in cm, when the whole pipeline accepted the sample
    pub height: Option<f64>,
}

#[derive(Debug)]
pub struct CalibrationPipeline {
    raw: ObservableValue,
    height: ObservableValue,
    diameter_cm: f64,
}

impl CalibrationPipeline {
    pub fn new(
        low_raw: f64,
        high_raw: f64,
        radius_cm: f64,
        pressure: &PressureConfig,
    ) -> Result<Self, TankError> {
        if !(radius_cm > 0.0) {
            return Err(TankError::Configuration(format!("tank radius must be positive, got {}", radius_cm)));
        }
        let diameter_cm = 2.0 * radius_cm;

        let mut raw = ObservableValue::new("tank_pressure_raw", 0.0);
        if pressure.oversample_count > 1 {
            raw.add_filter(BlockAverage::new(pressure.oversample_count)?);
        }
        raw.add_filter(ExpMovingAverage::new(pressure.ema_alpha, true)?);

        let height = ObservableValue::new("tank_water_height", 0.0)
            .with_filter(LinearFit::new((low_raw, 0.0), (high_raw, 100.0))?)
            .with_filter(Clamp::new(0.0, 100.0)?)
            .with_filter(LinearFit::new((0.0, 0.0), (100.0, diameter_cm))?);

        info!(
            "[Pressure] Pipeline ready: raw {}..{} -> 0..{}cm, oversample={}, alpha={}",
            low_raw, high_raw, diameter_cm, pressure.oversample_count, pressure.ema_alpha
        );

        Ok(CalibrationPipeline {
            raw,
            height,
            diameter_cm,
        })
    }

    /// Feed one raw ADC sample.
    pub fn process(&mut self, adc: f64) -> CalibrationOutput {
        let raw = self.raw.process(adc);
        let height = raw.and_then(|smoothed| self.height.process(smoothed));
        CalibrationOutput { raw, height }
    }

    /// Move the 0% and 100% calibration points.
    ///
    /// Range-checked first; on any error the current calibration stays.
    pub fn set_thresholds(&mut self, low_raw: f64, high_raw: f64) -> Result<(), TankError> {
        Limits::validate_pressure(low_raw, high_raw)?;
        match self.height.filter_mut(PRESSURE_FIT) {
            Some(Filter::LinearFit(fit)) => fit.recalibrate((low_raw, 0.0), (high_raw, 100.0))?,
            _ => {
                return Err(TankError::Configuration(
                    "pressure fit missing from height chain".to_string(),
                ))
            }
        }
        info!("[Pressure] Calibration moved to {}..{}", low_raw, high_raw);
        Ok(())
    }

    /// Current (low, high) raw calibration points.
    pub fn thresholds(&self) -> Option<(f64, f64)> {
        match self.height.filters().get(PRESSURE_FIT) {
            Some(Filter::LinearFit(fit)) => {
                let [(low, _), (high, _)] = fit.points();
                Some((low, high))
            }
            _ => None,
        }
    }

    pub fn diameter_cm(&self) -> f64 {
        self.diameter_cm
    }

    /// Last smoothed raw value.
    pub fn raw_value(&self) -> f64 {
        self.raw.value()
    }

    /// Last water height in cm.
    pub fn height_value(&self) -> f64 {
        self.height.value()
    }

    pub fn subscribe_raw<F>(&mut self, observer: F) -> ObserverId
    where
        F: FnMut(&Observed<'_>) + 'static,
    {
        self.raw.subscribe(observer)
    }

    pub fn subscribe_height<F>(&mut self, observer: F) -> ObserverId
    where
        F: FnMut(&Observed<'_>) + 'static,
    {
        self.height.subscribe(observer)
    }

    pub fn unsubscribe_raw(&mut self, id: ObserverId) -> bool {
        self.raw.unsubscribe(id)
    }

    pub fn unsubscribe_height(&mut self, id: ObserverId) -> bool {
        self.height.unsubscribe(id)
    }
}
