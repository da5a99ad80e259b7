//! Single-sample filters
//!
//! A filter inspects and possibly rewrites one working sample, then tells the
//! owning observable whether the sample may travel further down the chain.
//! Filters keep private state (countdowns, running averages) so the order in
//! which they are chained matters: averaging before clamping is not the same
//! as clamping before averaging.

use crate::error::TankError;

/// Verdict of one filter on one sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOutcome {
    /// Pass the (possibly modified) sample to the next filter.
    Continue,
    /// Drop the sample without notifying observers, e.g. more input needed.
    Stop,
    /// Reserved for rejecting malformed samples. Handled like `Stop`.
    Invalid,
}

// ============================================================================
// STATELESS FILTERS
// ============================================================================

/// Bounds the sample to `[min, max]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Clamp {
    min: f64,
    max: f64,
}

impl Clamp {
    pub fn new(min: f64, max: f64) -> Result<Self, TankError> {
        // Also rejects NaN bounds
        if !(min <= max) {
            return Err(TankError::Configuration(format!(
                "clamp bounds inverted: min={} max={}",
                min, max
            )));
        }
        Ok(Clamp { min, max })
    }

    fn apply(&self, value: &mut f64) -> FilterOutcome {
        // NaN compares false against both bounds, pin it to the floor
        if value.is_nan() || *value < self.min {
            *value = self.min;
        } else if *value > self.max {
            *value = self.max;
        }
        FilterOutcome::Continue
    }
}

/// Adds a constant to the sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Offset {
    delta: f64,
}

impl Offset {
    pub fn new(delta: f64) -> Self {
        Offset { delta }
    }

    fn apply(&self, value: &mut f64) -> FilterOutcome {
        *value += self.delta;
        FilterOutcome::Continue
    }
}

/// Two-point calibration line `y = slope * x + intercept`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinearFit {
    points: [(f64, f64); 2],
    slope: f64,
    intercept: f64,
}

impl LinearFit {
    pub fn new(p1: (f64, f64), p2: (f64, f64)) -> Result<Self, TankError> {
        let (slope, intercept) = Self::solve(p1, p2)?;
        Ok(LinearFit {
            points: [p1, p2],
            slope,
            intercept,
        })
    }

    /// Re-derive the line from new points. On error the current line is kept.
    pub fn recalibrate(&mut self, p1: (f64, f64), p2: (f64, f64)) -> Result<(), TankError> {
        let (slope, intercept) = Self::solve(p1, p2)?;
        self.points = [p1, p2];
        self.slope = slope;
        self.intercept = intercept;
        Ok(())
    }

    fn solve((x1, y1): (f64, f64), (x2, y2): (f64, f64)) -> Result<(f64, f64), TankError> {
        if ![x1, y1, x2, y2].iter().all(|v| v.is_finite()) {
            return Err(TankError::Configuration(format!(
                "linear fit points must be finite: ({}, {}) ({}, {})",
                x1, y1, x2, y2
            )));
        }
        if x1 == x2 {
            return Err(TankError::Configuration(format!(
                "linear fit needs two distinct x values, got {} twice",
                x1
            )));
        }
        let slope = (y1 - y2) / (x1 - x2);
        let intercept = y1 - slope * x1;
        Ok((slope, intercept))
    }

    pub fn points(&self) -> [(f64, f64); 2] {
        self.points
    }

    pub fn slope(&self) -> f64 {
        self.slope
    }

    pub fn intercept(&self) -> f64 {
        self.intercept
    }

    fn apply(&self, value: &mut f64) -> FilterOutcome {
        *value = self.slope * *value + self.intercept;
        FilterOutcome::Continue
    }
}

// ============================================================================
// STATEFUL FILTERS
// ============================================================================

/// Drops the first `remaining` samples that reach it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Skip {
    remaining: u16,
}

impl Skip {
    pub fn new(count: u16) -> Self {
        Skip { remaining: count }
    }

    pub fn remaining(&self) -> u16 {
        self.remaining
    }

    fn apply(&mut self) -> FilterOutcome {
        if self.remaining > 0 {
            self.remaining -= 1;
            return FilterOutcome::Stop;
        }
        FilterOutcome::Continue
    }
}

/// Exponential moving average, `y = prev + alpha * (x - prev)`.
///
/// The first sample seeds `previous`. With `pass_first` set, that first
/// sample is also forwarded untouched instead of being blended.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExpMovingAverage {
    alpha: f64,
    previous: f64,
    initialized: bool,
    pass_first: bool,
}

impl ExpMovingAverage {
    pub fn new(alpha: f64, pass_first: bool) -> Result<Self, TankError> {
        if !(alpha > 0.0 && alpha <= 1.0) {
            return Err(TankError::Configuration(format!(
                "EMA alpha must be in (0, 1], got {}",
                alpha
            )));
        }
        Ok(ExpMovingAverage {
            alpha,
            previous: 0.0,
            initialized: false,
            pass_first,
        })
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    /// Last output, `None` until the first sample arrived.
    pub fn previous(&self) -> Option<f64> {
        self.initialized.then_some(self.previous)
    }

    fn apply(&mut self, value: &mut f64) -> FilterOutcome {
        if !self.initialized {
            self.previous = *value;
            self.initialized = true;
        }
        if self.pass_first {
            self.pass_first = false;
            return FilterOutcome::Continue;
        }
        *value = self.previous + self.alpha * (*value - self.previous);
        self.previous = *value;
        FilterOutcome::Continue
    }
}

/// Collects `n` samples and forwards their mean, then starts over.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlockAverage {
    samples: usize,
    // Counts down from `samples` to zero
    counter: usize,
    accumulator: f64,
}

impl BlockAverage {
    pub fn new(samples: usize) -> Result<Self, TankError> {
        if samples == 0 {
            return Err(TankError::Configuration(
                "block average needs at least one sample".to_string(),
            ));
        }
        Ok(BlockAverage {
            samples,
            counter: samples,
            accumulator: 0.0,
        })
    }

    pub fn samples(&self) -> usize {
        self.samples
    }

    /// Samples still missing before the next mean is emitted.
    pub fn counter(&self) -> usize {
        self.counter
    }

    fn apply(&mut self, value: &mut f64) -> FilterOutcome {
        self.accumulator += *value;
        self.counter -= 1;
        if self.counter > 0 {
            return FilterOutcome::Stop;
        }

        *value = self.accumulator / self.samples as f64;
        self.accumulator = 0.0;
        self.counter = self.samples;
        FilterOutcome::Continue
    }
}

// ============================================================================
// FILTER SUM TYPE
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Clamp(Clamp),
    Offset(Offset),
    Skip(Skip),
    ExpMovingAverage(ExpMovingAverage),
    BlockAverage(BlockAverage),
    LinearFit(LinearFit),
}

impl Filter {
    /// Run this filter on the working sample.
    pub fn apply(&mut self, value: &mut f64) -> FilterOutcome {
        match self {
            Filter::Clamp(f) => f.apply(value),
            Filter::Offset(f) => f.apply(value),
            Filter::Skip(f) => f.apply(),
            Filter::ExpMovingAverage(f) => f.apply(value),
            Filter::BlockAverage(f) => f.apply(value),
            Filter::LinearFit(f) => f.apply(value),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Filter::Clamp(_) => "clamp",
            Filter::Offset(_) => "offset",
            Filter::Skip(_) => "skip",
            Filter::ExpMovingAverage(_) => "ema",
            Filter::BlockAverage(_) => "block-average",
            Filter::LinearFit(_) => "linear-fit",
        }
    }
}

impl From<Clamp> for Filter {
    fn from(f: Clamp) -> Self {
        Filter::Clamp(f)
    }
}

impl From<Offset> for Filter {
    fn from(f: Offset) -> Self {
        Filter::Offset(f)
    }
}

impl From<Skip> for Filter {
    fn from(f: Skip) -> Self {
        Filter::Skip(f)
    }
}

impl From<ExpMovingAverage> for Filter {
    fn from(f: ExpMovingAverage) -> Self {
        Filter::ExpMovingAverage(f)
    }
}

impl From<BlockAverage> for Filter {
    fn from(f: BlockAverage) -> Self {
        Filter::BlockAverage(f)
    }
}

impl From<LinearFit> for Filter {
    fn from(f: LinearFit) -> Self {
        Filter::LinearFit(f)
    }
}
