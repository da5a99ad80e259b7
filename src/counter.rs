//! Windowed frequency measurement for the overflow sensor
//!
//! The overflow probe produces a pulse train whose frequency rises when water
//! runs through the overflow. Frequency is measured by gating an edge counter:
//!
//! 1. clear the counter
//! 2. open the gate for exactly `window` using a hardware pulse generator
//! 3. read the accumulated edge count
//! 4. `frequency = edges / 2 / window` (both edges of every pulse are counted)
//!
//! The gate is timed by the pulse generator rather than a software sleep so
//! the window length does not jitter with scheduler load.
//!
//! Measurement runs on its own thread since step 2 blocks for the whole
//! window. Results leave the thread only through a channel; the thread never
//! touches application state. Stop requests are honoured between cycles.

use anyhow::{anyhow, Result};
use crossbeam_channel::Sender;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::config::CounterConfig;
use crate::error::TankError;
use crate::traits::GatedCounter;

// ============================================================================
// GATE PULSE PROGRAM
// ============================================================================

/// Longest half-item the pulse generator accepts (15 bit duration field)
pub const MAX_TICKS_PER_HALF: u32 = 0x7FFF;
/// Items that fit into one block of pulse generator memory
pub const MAX_GATE_ITEMS: usize = 64;

/// One pulse generator item: two (level, duration) halves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PulseItem {
    pub level0: bool,
    pub duration0: u16,
    pub level1: bool,
    pub duration1: u16,
}

/// Pulse program that holds the gate high for one measurement window.
#[derive(Debug, Clone, PartialEq)]
pub struct GatePlan {
    items: Vec<PulseItem>,
    tick_secs: f64,
    total_ticks: u64,
}

impl GatePlan {
    /// Split `window` into items of at most `MAX_TICKS_PER_HALF` ticks per
    /// half. A trailing odd half is closed with a zero-length low level.
    pub fn new(window: Duration, clock_hz: f64, clock_div: u32) -> Result<Self, TankError> {
        if !(clock_hz > 0.0) || clock_div == 0 {
            return Err(TankError::Configuration(format!(
                "gate clock must be positive: {}Hz / {}",
                clock_hz, clock_div
            )));
        }
        let tick_secs = clock_div as f64 / clock_hz;
        let total_ticks = (window.as_secs_f64() / tick_secs).round() as u64;
        if total_ticks == 0 {
            return Err(TankError::Configuration(format!(
                "gate window {:?} is shorter than one {:.1}us tick",
                window,
                tick_secs * 1e6
            )));
        }

        let mut items = Vec::new();
        let mut remaining = total_ticks;
        while remaining > 0 {
            let first = remaining.min(MAX_TICKS_PER_HALF as u64);
            remaining -= first;

            let item = if remaining > 0 {
                let second = remaining.min(MAX_TICKS_PER_HALF as u64);
                remaining -= second;
                PulseItem {
                    level0: true,
                    duration0: first as u16,
                    level1: true,
                    duration1: second as u16,
                }
            } else {
                PulseItem {
                    level0: true,
                    duration0: first as u16,
                    level1: false,
                    duration1: 0,
                }
            };
            items.push(item);

            if items.len() > MAX_GATE_ITEMS {
                return Err(TankError::Configuration(format!(
                    "gate window {:?} needs more than {} pulse items",
                    window, MAX_GATE_ITEMS
                )));
            }
        }

        Ok(GatePlan {
            items,
            tick_secs,
            total_ticks,
        })
    }

    pub fn from_config(config: &CounterConfig) -> Result<Self, TankError> {
        if !(config.window_secs > 0.0 && config.window_secs.is_finite()) {
            return Err(TankError::Configuration(format!(
                "counter window must be positive, got {}s",
                config.window_secs
            )));
        }
        Self::new(
            Duration::from_secs_f64(config.window_secs),
            config.gate_clock_hz,
            config.gate_clock_div,
        )
    }

    pub fn items(&self) -> &[PulseItem] {
        &self.items
    }

    pub fn total_ticks(&self) -> u64 {
        self.total_ticks
    }

    /// Gate-open time actually produced by the program.
    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.total_ticks as f64 * self.tick_secs)
    }
}

// ============================================================================
// READINGS
// ============================================================================

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Default)]
pub struct FrequencyReading {
    pub edge_count: u32,
    pub frequency_hz: f64,
}

impl FrequencyReading {
    pub fn from_edges(edge_count: u32, window_secs: f64) -> Self {
        let frequency_hz = if window_secs > 0.0 {
            edge_count as f64 / 2.0 / window_secs
        } else {
            0.0
        };
        FrequencyReading {
            edge_count,
            frequency_hz,
        }
    }
}

/// Overflow when the frequency reaches the threshold. A zero threshold
/// disables detection.
pub fn is_overflow(frequency_hz: f64, threshold_hz: f64) -> bool {
    threshold_hz > 0.0 && frequency_hz >= threshold_hz
}

/// One gated measurement: clear, gate, read.
pub fn measure_once<C: GatedCounter + ?Sized>(
    counter: &mut C,
    plan: &GatePlan,
    window_secs: f64,
) -> Result<FrequencyReading> {
    counter.clear()?;
    counter.gate(plan)?;
    let edges = counter.count()?;
    Ok(FrequencyReading::from_edges(edges, window_secs))
}

// ============================================================================
// MEASURER
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeasurerState {
    Idle,
    Running,
    Stopping,
}

struct Worker<C> {
    counter: Arc<Mutex<C>>,
    plan: GatePlan,
    window_secs: f64,
    cycle_period: Duration,
    state: Arc<Mutex<MeasurerState>>,
    stop_requested: Arc<AtomicBool>,
    tx: Sender<FrequencyReading>,
}

/// Runs gated measurement cycles on a dedicated thread.
pub struct FrequencyMeasurer<C: GatedCounter + 'static> {
    counter: Arc<Mutex<C>>,
    plan: GatePlan,
    window_secs: f64,
    cycle_period: Duration,
    state: Arc<Mutex<MeasurerState>>,
    stop_requested: Arc<AtomicBool>,
    tx: Sender<FrequencyReading>,
    worker: Option<JoinHandle<()>>,
}

impl<C: GatedCounter + 'static> FrequencyMeasurer<C> {
    pub fn new(counter: C, config: &CounterConfig, tx: Sender<FrequencyReading>) -> Result<Self, TankError> {
        let plan = GatePlan::from_config(config)?;
        if !(config.cycle_period_secs >= 0.0 && config.cycle_period_secs.is_finite()) {
            return Err(TankError::Configuration(format!(
                "cycle period must not be negative, got {}s",
                config.cycle_period_secs
            )));
        }

        info!(
            "[Counter] Gate window {:.3}s in {} pulse items, cycle period {:.3}s",
            config.window_secs,
            plan.items().len(),
            config.cycle_period_secs
        );

        Ok(FrequencyMeasurer {
            counter: Arc::new(Mutex::new(counter)),
            plan,
            window_secs: config.window_secs,
            cycle_period: Duration::from_secs_f64(config.cycle_period_secs),
            state: Arc::new(Mutex::new(MeasurerState::Idle)),
            stop_requested: Arc::new(AtomicBool::new(false)),
            tx,
            worker: None,
        })
    }

    pub fn state(&self) -> MeasurerState {
        *self.lock_state()
    }

    // A panicking worker must not wedge start/stop
    fn lock_state(&self) -> MutexGuard<'_, MeasurerState> {
        match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.state() == MeasurerState::Running
    }

    pub fn plan(&self) -> &GatePlan {
        &self.plan
    }

    /// Idle -> Running. Fails with `AlreadyRunning` unless idle.
    pub fn start(&mut self) -> Result<(), TankError> {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        if *state != MeasurerState::Idle {
            return Err(TankError::AlreadyRunning);
        }

        // A previous worker already marked itself idle, so it is about to exit
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }

        self.stop_requested.store(false, Ordering::SeqCst);
        *state = MeasurerState::Running;
        drop(state);

        let worker = Worker {
            counter: self.counter.clone(),
            plan: self.plan.clone(),
            window_secs: self.window_secs,
            cycle_period: self.cycle_period,
            state: self.state.clone(),
            stop_requested: self.stop_requested.clone(),
            tx: self.tx.clone(),
        };

        let spawned = thread::Builder::new()
            .name("frequency_count".to_string())
            .spawn(move || worker.run());

        match spawned {
            Ok(handle) => {
                self.worker = Some(handle);
                info!("[Counter] Started");
                Ok(())
            }
            Err(e) => {
                self.set_state(MeasurerState::Idle);
                Err(TankError::Configuration(format!("could not spawn measurement thread: {}", e)))
            }
        }
    }

    /// Running -> Stopping. The worker finishes its current window, publishes
    /// a zero reading and goes idle.
    pub fn stop(&self) -> Result<(), TankError> {
        let mut state = self.lock_state();
        if *state != MeasurerState::Running {
            return Err(TankError::NotRunning);
        }
        *state = MeasurerState::Stopping;
        self.stop_requested.store(true, Ordering::SeqCst);
        info!("[Counter] Stop requested");
        Ok(())
    }

    /// Block until the worker thread has exited.
    pub fn wait_idle(&mut self) {
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                warn!("[Counter] Measurement thread panicked");
                self.set_state(MeasurerState::Idle);
            }
        }
    }

    fn set_state(&self, new_state: MeasurerState) {
        *self.lock_state() = new_state;
    }
}

impl<C: GatedCounter + 'static> Drop for FrequencyMeasurer<C> {
    fn drop(&mut self) {
        let _ = self.stop();
        self.wait_idle();
    }
}

impl<C: GatedCounter> Worker<C> {
    fn run(self) {
        debug!("[Counter] Measurement thread up");
        let mut next_wake = Instant::now();

        loop {
            match self.cycle() {
                Ok(reading) => {
                    debug!(
                        "[Counter] edges={} frequency={:.1}Hz",
                        reading.edge_count, reading.frequency_hz
                    );
                    if self.tx.send(reading).is_err() {
                        warn!("[Counter] Reading receiver gone, stopping");
                        break;
                    }
                }
                // Transient: keep the last published reading, back off one window
                Err(e) => {
                    warn!("[Counter] Cycle skipped: {:#}", e);
                    if self.cycle_period.is_zero() {
                        thread::sleep(self.plan.duration());
                    }
                }
            }

            if !self.cycle_period.is_zero() {
                next_wake += self.cycle_period;
                let now = Instant::now();
                if next_wake > now {
                    thread::sleep(next_wake - now);
                } else {
                    next_wake = now;
                }
            }

            if self.stop_requested.load(Ordering::SeqCst) {
                break;
            }
        }

        self.shutdown();
    }

    fn cycle(&self) -> Result<FrequencyReading> {
        let mut counter = self.counter.lock().map_err(|_| anyhow!("counter lock poisoned"))?;
        measure_once(&mut *counter, &self.plan, self.window_secs)
    }

    fn shutdown(self) {
        match self.counter.lock() {
            Ok(mut counter) => {
                if let Err(e) = counter.halt() {
                    warn!("[Counter] Halt failed: {:#}", e);
                }
            }
            Err(_) => warn!("[Counter] Counter lock poisoned on shutdown"),
        }

        let _ = self.tx.send(FrequencyReading::default());

        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        *state = MeasurerState::Idle;
        info!("[Counter] Stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::MockGatedCounter;
    use crossbeam_channel::unbounded;
    use std::sync::atomic::AtomicUsize;

    fn fast_config() -> CounterConfig {
        CounterConfig {
            cycle_period_secs: 0.0,
            ..CounterConfig::default()
        }
    }

    fn counting_mock(edges: u32) -> MockGatedCounter {
        let mut mock = MockGatedCounter::new();
        mock.expect_clear().returning(|| Ok(()));
        mock.expect_gate().returning(|_| Ok(()));
        mock.expect_count().returning(move || Ok(edges));
        mock.expect_halt().returning(|| Ok(()));
        mock
    }

    #[test]
    fn test_frequency_from_edges() {
        let r = FrequencyReading::from_edges(382, 1.0);
        assert_eq!(r.edge_count, 382);
        assert_eq!(r.frequency_hz, 191.0);

        let r = FrequencyReading::from_edges(100, 0.5);
        assert_eq!(r.frequency_hz, 100.0);

        assert_eq!(FrequencyReading::from_edges(10, 0.0).frequency_hz, 0.0);
    }

    #[test]
    fn test_overflow_threshold() {
        assert!(is_overflow(191.0, 150.0));
        assert!(is_overflow(150.0, 150.0));
        assert!(!is_overflow(149.9, 150.0));
        // Zero disables detection entirely
        assert!(!is_overflow(0.0, 0.0));
        assert!(!is_overflow(10_000.0, 0.0));
    }

    #[test]
    fn test_gate_plan_one_second() {
        // 160 / 80MHz = 2us ticks -> 500000 ticks
        let plan = GatePlan::new(Duration::from_secs(1), 80_000_000.0, 160).unwrap();
        assert_eq!(plan.total_ticks(), 500_000);
        assert_eq!(plan.items().len(), 8);

        let sum: u64 = plan
            .items()
            .iter()
            .map(|i| i.duration0 as u64 + i.duration1 as u64)
            .sum();
        assert_eq!(sum, 500_000);
        assert!(plan.items().iter().all(|i| i.level0));
        assert_eq!(plan.items()[7].duration1 as u32, 500_000 - 15 * 32_767);
        assert!((plan.duration().as_secs_f64() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_gate_plan_odd_half_padded_low() {
        // Three full halves: second item ends with a zero-length low level
        let window = Duration::from_secs_f64(3.0 * 32_767.0 * 2e-6);
        let plan = GatePlan::new(window, 80_000_000.0, 160).unwrap();
        assert_eq!(plan.items().len(), 2);
        assert_eq!(
            plan.items()[1],
            PulseItem { level0: true, duration0: 32_767, level1: false, duration1: 0 }
        );
    }

    #[test]
    fn test_gate_plan_limits() {
        assert!(GatePlan::new(Duration::from_nanos(100), 80_000_000.0, 160).is_err());
        assert!(GatePlan::new(Duration::from_secs(60), 80_000_000.0, 160).is_err());
        assert!(GatePlan::new(Duration::from_secs(1), 0.0, 160).is_err());
    }

    #[test]
    fn test_measure_once_sequence() {
        let mut mock = MockGatedCounter::new();
        let mut seq = mockall::Sequence::new();
        mock.expect_clear().times(1).in_sequence(&mut seq).returning(|| Ok(()));
        mock.expect_gate().times(1).in_sequence(&mut seq).returning(|_| Ok(()));
        mock.expect_count().times(1).in_sequence(&mut seq).returning(|| Ok(382));

        let plan = GatePlan::from_config(&CounterConfig::default()).unwrap();
        let reading = measure_once(&mut mock, &plan, 1.0).unwrap();
        assert_eq!(reading, FrequencyReading { edge_count: 382, frequency_hz: 191.0 });
    }

    #[test]
    fn test_stop_before_start_fails() {
        let (tx, _rx) = unbounded();
        let m = FrequencyMeasurer::new(counting_mock(0), &fast_config(), tx).unwrap();
        assert_eq!(m.stop(), Err(TankError::NotRunning));
        assert_eq!(m.state(), MeasurerState::Idle);
    }

    #[test]
    fn test_start_twice_fails_and_cycle_publishes() {
        let _ = env_logger::builder().is_test(true).try_init();
        let (tx, rx) = unbounded();
        let mut m = FrequencyMeasurer::new(counting_mock(382), &fast_config(), tx).unwrap();

        m.start().unwrap();
        assert_eq!(m.start(), Err(TankError::AlreadyRunning));
        assert!(m.is_running());

        let reading = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(reading.edge_count, 382);
        assert_eq!(reading.frequency_hz, 191.0);

        m.stop().unwrap();
        assert_eq!(m.stop(), Err(TankError::NotRunning));
        m.wait_idle();
        assert_eq!(m.state(), MeasurerState::Idle);

        // Last thing published is the zeroed reading
        let last = rx.try_iter().last().unwrap();
        assert_eq!(last, FrequencyReading::default());
    }

    #[test]
    fn test_restart_after_stop() {
        let (tx, rx) = unbounded();
        let mut m = FrequencyMeasurer::new(counting_mock(20), &fast_config(), tx).unwrap();

        m.start().unwrap();
        rx.recv_timeout(Duration::from_secs(2)).unwrap();
        m.stop().unwrap();
        m.wait_idle();
        let _ = rx.try_iter().count();

        m.start().unwrap();
        let reading = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(reading.frequency_hz, 10.0);
        m.stop().unwrap();
        m.wait_idle();
    }

    #[test]
    fn test_failed_cycle_is_skipped() {
        let mut mock = MockGatedCounter::new();
        mock.expect_clear().returning(|| Ok(()));
        mock.expect_gate().returning(|_| Ok(()));
        mock.expect_halt().returning(|| Ok(()));
        let mut calls = 0;
        mock.expect_count().returning(move || {
            calls += 1;
            if calls == 1 {
                Err(anyhow!("pcnt read timeout"))
            } else {
                Ok(10)
            }
        });

        let (tx, rx) = unbounded();
        let mut m = FrequencyMeasurer::new(mock, &fast_config(), tx).unwrap();
        m.start().unwrap();
        let first = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(first.edge_count, 10);
        m.stop().unwrap();
        m.wait_idle();
    }

    #[test]
    fn test_failing_counter_backs_off_one_window() {
        let mut mock = MockGatedCounter::new();
        mock.expect_clear().returning(|| Ok(()));
        mock.expect_gate().returning(|_| Ok(()));
        mock.expect_halt().returning(|| Ok(()));
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        mock.expect_count().returning(move || {
            seen.fetch_add(1, Ordering::SeqCst);
            Err(anyhow!("pcnt read timeout"))
        });

        let config = CounterConfig {
            window_secs: 0.05,
            ..fast_config()
        };
        let (tx, rx) = unbounded();
        let mut m = FrequencyMeasurer::new(mock, &config, tx).unwrap();
        m.start().unwrap();
        thread::sleep(Duration::from_millis(200));
        m.stop().unwrap();
        m.wait_idle();

        // 200ms of 50ms back-offs: a handful of attempts, not a busy loop
        let attempts = calls.load(Ordering::SeqCst);
        assert!((1..=10).contains(&attempts), "{} attempts", attempts);
        // Only the zeroed reading from the stop
        assert_eq!(rx.try_iter().collect::<Vec<_>>(), vec![FrequencyReading::default()]);
    }

    #[test]
    fn test_poisoned_state_lock_is_recovered() {
        let (tx, _rx) = unbounded();
        let mut m = FrequencyMeasurer::new(counting_mock(4), &fast_config(), tx).unwrap();

        let state = m.state.clone();
        let _ = thread::spawn(move || {
            let _guard = state.lock().unwrap();
            panic!("poison the state lock");
        })
        .join();
        assert!(m.state.is_poisoned());

        assert_eq!(m.state(), MeasurerState::Idle);
        assert_eq!(m.stop(), Err(TankError::NotRunning));
        m.start().unwrap();
        assert!(m.is_running());
        m.stop().unwrap();
        m.wait_idle();
        assert_eq!(m.state(), MeasurerState::Idle);
    }

    #[test]
    fn test_cycle_period_paces_measurements() {
        let config = CounterConfig {
            cycle_period_secs: 0.05,
            ..CounterConfig::default()
        };
        let (tx, rx) = unbounded();
        let mut m = FrequencyMeasurer::new(counting_mock(2), &config, tx).unwrap();

        let started = Instant::now();
        m.start().unwrap();
        for _ in 0..3 {
            rx.recv_timeout(Duration::from_secs(2)).unwrap();
        }
        // Three readings need at least two full periods in between
        assert!(started.elapsed() >= Duration::from_millis(100));
        m.stop().unwrap();
        m.wait_idle();
    }
}
