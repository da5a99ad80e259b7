//! Simulated tank hardware
//!
//! A single physics model drives all three sensors so the binary and the
//! end-to-end tests run without a board. Simulated time advances with every
//! ADC read by the configured ADC period; the water level moves at a fixed
//! rate and stays within the tank. Once the level passes the overflow mark
//! the overflow probe starts pulsing.

use anyhow::{anyhow, Result};
use log::debug;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

use crate::counter::GatePlan;
use crate::status::EnvironmentReading;
use crate::traits::{AdcSource, EnvironmentSensor, GatedCounter};

/// Tunables for the simulated tank.
#[derive(Debug, Clone, PartialEq)]
pub struct SimSettings {
    pub diameter_cm: f64,
    pub start_level_cm: f64,
    /// Level change per simulated second, negative drains
    pub fill_rate_cm_per_s: f64,
    /// ADC reading at an empty and a full tank
    pub adc_empty: f64,
    pub adc_full: f64,
    /// Peak ADC noise in counts
    pub noise_counts: f64,
    /// Level above which the overflow probe pulses
    pub overflow_level_cm: f64,
    pub overflow_hz: f64,
    /// Sleep through gate windows like real hardware would
    pub realtime_gate: bool,
}

impl Default for SimSettings {
    fn default() -> Self {
        SimSettings {
            diameter_cm: 50.0,
            start_level_cm: 10.0,
            fill_rate_cm_per_s: 0.05,
            adc_empty: 500.0,
            adc_full: 680.0,
            noise_counts: 3.0,
            overflow_level_cm: 49.0,
            overflow_hz: 150.0,
            realtime_gate: true,
        }
    }
}

#[derive(Debug)]
struct TankPhysics {
    settings: SimSettings,
    time_secs: f64,
    level_cm: f64,
    noise_state: u64,
}

impl TankPhysics {
    fn advance(&mut self, dt_secs: f64) {
        self.time_secs += dt_secs;
        let level = self.level_cm + self.settings.fill_rate_cm_per_s * dt_secs;
        self.level_cm = level.clamp(0.0, self.settings.diameter_cm);
    }

    // xorshift64, uniform in [-1, 1]
    fn noise(&mut self) -> f64 {
        let mut x = self.noise_state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.noise_state = x;
        (x >> 11) as f64 / (1u64 << 53) as f64 * 2.0 - 1.0
    }

    fn adc(&mut self) -> u16 {
        let s = &self.settings;
        let fraction = self.level_cm / s.diameter_cm;
        let ideal = s.adc_empty + fraction * (s.adc_full - s.adc_empty);
        let noisy = ideal + self.noise() * self.settings.noise_counts;
        noisy.round().clamp(0.0, 4095.0) as u16
    }

    fn overflow_hz(&self) -> f64 {
        if self.level_cm >= self.settings.overflow_level_cm {
            self.settings.overflow_hz
        } else {
            0.0
        }
    }
}

/// Handle shared by all simulated sensors.
#[derive(Debug, Clone)]
pub struct SimTank {
    physics: Arc<Mutex<TankPhysics>>,
}

impl SimTank {
    pub fn new(settings: SimSettings) -> Self {
        let level_cm = settings.start_level_cm.clamp(0.0, settings.diameter_cm);
        SimTank {
            physics: Arc::new(Mutex::new(TankPhysics {
                settings,
                time_secs: 0.0,
                level_cm,
                noise_state: 0x2545_F491_4F6C_DD1D,
            })),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, TankPhysics>> {
        self.physics.lock().map_err(|_| anyhow!("simulated tank lock poisoned"))
    }

    pub fn level_cm(&self) -> Result<f64> {
        Ok(self.lock()?.level_cm)
    }

    pub fn set_level_cm(&self, level_cm: f64) -> Result<()> {
        let mut physics = self.lock()?;
        physics.level_cm = level_cm.clamp(0.0, physics.settings.diameter_cm);
        Ok(())
    }

    pub fn set_fill_rate(&self, cm_per_s: f64) -> Result<()> {
        self.lock()?.settings.fill_rate_cm_per_s = cm_per_s;
        Ok(())
    }

    /// Pressure ADC that advances simulated time by `period_secs` per read.
    pub fn adc(&self, period_secs: f64) -> SimAdc {
        SimAdc {
            tank: self.clone(),
            period_secs,
        }
    }

    pub fn counter(&self) -> SimCounter {
        SimCounter {
            tank: self.clone(),
            edges: 0,
            gated: false,
        }
    }

    pub fn environment(&self) -> SimEnvironment {
        SimEnvironment { tank: self.clone() }
    }
}

pub struct SimAdc {
    tank: SimTank,
    period_secs: f64,
}

impl AdcSource for SimAdc {
    fn read_raw(&mut self) -> Result<u16> {
        let mut physics = self.tank.lock()?;
        physics.advance(self.period_secs);
        Ok(physics.adc())
    }
}

/// Overflow probe edge counter.
pub struct SimCounter {
    tank: SimTank,
    edges: u32,
    gated: bool,
}

impl GatedCounter for SimCounter {
    fn clear(&mut self) -> Result<()> {
        self.edges = 0;
        self.gated = false;
        Ok(())
    }

    fn gate(&mut self, plan: &GatePlan) -> Result<()> {
        let window = plan.duration();
        let (frequency, realtime) = {
            let physics = self.tank.lock()?;
            (physics.overflow_hz(), physics.settings.realtime_gate)
        };
        if realtime {
            thread::sleep(window);
        }
        // Two edges per pulse
        self.edges = (2.0 * frequency * window.as_secs_f64()).round() as u32;
        self.gated = true;
        debug!("[Sim] Gate {:?} at {:.1}Hz -> {} edges", window, frequency, self.edges);
        Ok(())
    }

    fn count(&mut self) -> Result<u32> {
        if !self.gated {
            return Err(anyhow!("counter read before gate closed"));
        }
        Ok(self.edges)
    }
}

pub struct SimEnvironment {
    tank: SimTank,
}

impl EnvironmentSensor for SimEnvironment {
    fn read(&mut self) -> Result<EnvironmentReading> {
        let t = self.tank.lock()?.time_secs;
        // Slow daily-ish swing
        let phase = (t / 600.0).sin();
        Ok(EnvironmentReading {
            temperature: 21.0 + 2.0 * phase,
            pressure: 1013.0 - 1.5 * phase,
            humidity: 45.0 + 5.0 * phase,
        })
    }
}
