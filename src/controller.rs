//! Tank controller - the designated context that owns all application state
//!
//! Everything that reads or writes the Sensor Info / Raw Reading snapshots,
//! the thresholds or the notification state runs here, on one thread:
//!
//! - ADC samples are pulled on the pressure period and pushed through the
//!   calibration pipeline. The volume reporter hangs off the height
//!   observable and queues debounced readings for the controller to drain.
//! - The frequency measurer runs on its own thread and hands readings back
//!   through a channel; the controller applies them.
//! - Commands are validated, persisted and only then applied.
//! - A heartbeat notification goes out when nothing else was sent for a while.

use chrono::Utc;
use crossbeam_channel::{unbounded, Receiver};
use log::{debug, info, warn};
use serde_json::{json, Value};
use std::time::{Duration, Instant};

use crate::calibration::CalibrationPipeline;
use crate::command::Command;
use crate::config::{Limits, SystemConfig};
use crate::counter::{is_overflow, FrequencyMeasurer, FrequencyReading, MeasurerState};
use crate::error::TankError;
use crate::status::{RawReading, SensorInfo, TankStatus, Trigger};
use crate::traits::{AdcSource, ConfigStore, EnvironmentSensor, GatedCounter, Notifier};
use crate::volume::{classify, ChangeTracker, TankGeometry, VolumeReading, VolumeReporter};

fn unix_now() -> i64 {
    Utc::now().timestamp()
}

// ============================================================================
// DATA STRUCTURES
// ============================================================================

pub struct TankController<A, C, E, N, S>
where
    A: AdcSource,
    C: GatedCounter + 'static,
    E: EnvironmentSensor,
    N: Notifier,
    S: ConfigStore,
{
    // Hardware and collaborators
    adc: A,
    environment: E,
    notifier: N,
    store: S,
    config: SystemConfig,

    // Pressure path
    pipeline: CalibrationPipeline,
    volume_rx: Receiver<VolumeReading>,
    adc_tracker: ChangeTracker<u16>,
    status_tracker: ChangeTracker<TankStatus>,

    // Overflow path
    measurer: FrequencyMeasurer<C>,
    frequency_rx: Receiver<FrequencyReading>,
    frequency_tracker: ChangeTracker<FrequencyReading>,
    overflow_tracker: ChangeTracker<bool>,

    // Published snapshots
    info: SensorInfo,
    raw: RawReading,

    // Heartbeat
    heartbeat: Duration,
    last_notify: Instant,
}

impl<A, C, E, N, S> TankController<A, C, E, N, S>
where
    A: AdcSource,
    C: GatedCounter + 'static,
    E: EnvironmentSensor,
    N: Notifier,
    S: ConfigStore,
{
    /// Build the pipeline from `config`. Invalid calibration or geometry
    /// prevents activation.
    pub fn new(
        adc: A,
        counter: C,
        environment: E,
        notifier: N,
        store: S,
        config: SystemConfig,
    ) -> Result<Self, TankError> {
        config.validate()?;

        let mut pipeline = CalibrationPipeline::new(
            config.limits.pressure_low_raw,
            config.limits.pressure_high_raw,
            config.tank.radius_cm,
            &config.pressure,
        )?;

        let geometry = TankGeometry::from_config(&config.tank)?;
        let mut reporter = VolumeReporter::new(geometry, config.tank.report_threshold_liters);
        let (volume_tx, volume_rx) = unbounded();
        pipeline.subscribe_height(move |observed| {
            if let Some(reading) = reporter.update(observed.value) {
                let _ = volume_tx.send(reading);
            }
        });

        let (frequency_tx, frequency_rx) = unbounded();
        let mut measurer = FrequencyMeasurer::new(counter, &config.counter, frequency_tx)?;
        if config.counter.autostart {
            measurer.start()?;
        }

        info!("=== Tank Controller Initialization ===");
        info!(
            "Tank: r={}cm L={}cm capacity={:.1}L report>{:.1}L",
            config.tank.radius_cm,
            config.tank.length_cm,
            geometry.capacity_liters(),
            config.tank.report_threshold_liters
        );
        info!(
            "Limits: pressure {}..{} raw, tank {}..{}L, overflow >= {}Hz",
            config.limits.pressure_low_raw,
            config.limits.pressure_high_raw,
            config.limits.liters_low,
            config.limits.liters_high,
            config.limits.overflow_frequency_hz
        );
        info!("=== Ready ===");

        let heartbeat = Duration::from_secs_f64(config.notify.heartbeat_secs);
        let info = SensorInfo::default();

        Ok(TankController {
            adc,
            environment,
            notifier,
            store,
            config,
            pipeline,
            volume_rx,
            adc_tracker: ChangeTracker::new(),
            // Nothing notified yet: the first classification is news
            status_tracker: ChangeTracker::new(),
            measurer,
            frequency_rx,
            frequency_tracker: ChangeTracker::new(),
            overflow_tracker: ChangeTracker::seeded(info.tank_overflow),
            info,
            raw: RawReading::default(),
            heartbeat,
            last_notify: Instant::now(),
        })
    }

    // ========================================================================
    // PUBLIC API
    // ========================================================================

    pub fn config(&self) -> &SystemConfig {
        &self.config
    }

    pub fn sensor_info(&self) -> &SensorInfo {
        &self.info
    }

    pub fn raw_reading(&self) -> &RawReading {
        &self.raw
    }

    pub fn pipeline(&self) -> &CalibrationPipeline {
        &self.pipeline
    }

    pub fn measurer_state(&self) -> MeasurerState {
        self.measurer.state()
    }

    pub fn adc_period(&self) -> Duration {
        Duration::from_millis(self.config.pressure.adc_period_ms)
    }

    pub fn environment_period(&self) -> Duration {
        Duration::from_millis(self.config.notify.environment_period_ms)
    }

    /// Readings queued by the measurement thread, for `select!`.
    pub fn frequency_events(&self) -> Receiver<FrequencyReading> {
        self.frequency_rx.clone()
    }

    /// When the heartbeat is due if nothing else is sent before.
    pub fn next_heartbeat(&self) -> Instant {
        self.last_notify + self.heartbeat
    }

    // ========================================================================
    // PRESSURE PATH
    // ========================================================================

    /// Read one ADC sample and run it through the pipeline.
    pub fn poll_adc(&mut self) {
        let sample = match self.adc.read_raw() {
            Ok(sample) => sample,
            Err(e) => {
                warn!("[Pressure] {}", TankError::transient(e));
                return;
            }
        };

        let output = self.pipeline.process(sample as f64);

        let mut raw_changed = false;
        if let Some(smoothed) = output.raw {
            let adc = smoothed.round().clamp(0.0, u16::MAX as f64) as u16;
            if self.adc_tracker.update(adc) {
                debug!("[Pressure] Smoothed ADC {}", adc);
                self.raw.tank_pressure_adc = adc;
                self.raw.timestamp = unix_now();
                raw_changed = true;
            }
        }

        // At most one reading per sample, keep the newest regardless
        let volume = self.volume_rx.try_iter().last();
        let volume_changed = volume.is_some();
        let status_changed = match volume {
            Some(reading) => self.apply_volume(reading),
            None => false,
        };

        // A volume report within the same status is only a raw change
        if status_changed {
            self.notify(Trigger::StatusChanged);
        } else if volume_changed || raw_changed {
            self.notify(Trigger::RawChanged);
        }
    }

    /// Store a debounced volume reading; true if the status flipped.
    fn apply_volume(&mut self, reading: VolumeReading) -> bool {
        self.info.tank_liters = reading.liters;
        self.info.tank_percentage = reading.percent;
        self.info.timestamp = unix_now();
        self.update_status()
    }

    fn update_status(&mut self) -> bool {
        let status = self.reclassify();
        let changed = self.status_tracker.update(status);
        if changed {
            info!("[Tank] Status -> {}", status.as_str());
        }
        changed
    }

    fn reclassify(&mut self) -> TankStatus {
        let limits = &self.config.limits;
        let status = classify(self.info.tank_liters, limits.liters_low, limits.liters_high);
        self.info.tank_status = status;
        status
    }

    // ========================================================================
    // OVERFLOW PATH
    // ========================================================================

    /// Apply one reading from the measurement thread.
    pub fn handle_frequency(&mut self, reading: FrequencyReading) {
        if !self.frequency_tracker.update(reading) {
            return;
        }

        self.raw.counter_count = reading.edge_count;
        self.raw.counter_frequency = reading.frequency_hz;
        self.raw.timestamp = unix_now();
        self.info.timestamp = self.raw.timestamp;

        if self.update_overflow() {
            self.notify(Trigger::StatusChanged);
        } else {
            self.notify(Trigger::RawChanged);
        }
    }

    /// Apply every reading queued so far.
    pub fn drain_frequency(&mut self) -> usize {
        let pending: Vec<FrequencyReading> = self.frequency_rx.try_iter().collect();
        for reading in &pending {
            self.handle_frequency(*reading);
        }
        pending.len()
    }

    /// Re-evaluate the overflow flag; true if it flipped.
    fn update_overflow(&mut self) -> bool {
        let overflow = is_overflow(self.raw.counter_frequency, self.config.limits.overflow_frequency_hz);
        self.info.tank_overflow = overflow;
        let changed = self.overflow_tracker.update(overflow);
        if changed {
            info!(
                "[Overflow] {} at {:.1}Hz",
                if overflow { "DETECTED" } else { "cleared" },
                self.raw.counter_frequency
            );
        }
        changed
    }

    // ========================================================================
    // ENVIRONMENT
    // ========================================================================

    pub fn poll_environment(&mut self) {
        match self.environment.read() {
            Ok(reading) => {
                debug!(
                    "[Environment] temp {:.2}, press {:.1}, humid {:.1}",
                    reading.temperature, reading.pressure, reading.humidity
                );
                self.info.air_temperature = reading.temperature;
                self.info.air_pressure = reading.pressure;
                self.info.air_humidity = reading.humidity;
                self.info.timestamp = unix_now();
            }
            Err(e) => warn!("[Environment] {}", TankError::transient(e)),
        }
    }

    // ========================================================================
    // NOTIFICATION
    // ========================================================================

    /// Send the heartbeat if nothing was notified for a full period.
    pub fn tick(&mut self, now: Instant) {
        if now.saturating_duration_since(self.last_notify) >= self.heartbeat {
            self.notify(Trigger::Timer);
        }
    }

    fn notify(&mut self, trigger: Trigger) {
        debug!("[Notify] {:?}", trigger);
        self.notifier.notify(trigger, &self.info, &self.raw);
        self.last_notify = Instant::now();
    }

    // ========================================================================
    // COMMANDS
    // ========================================================================

    /// Execute a command. Configuration changes are validated, persisted and
    /// only then applied; on any error the previous values stay in effect.
    pub fn apply(&mut self, command: Command) -> Result<Value, TankError> {
        if command.is_config_change() {
            info!("[Command] {} (persisted)", command.method());
        } else {
            info!("[Command] {}", command.method());
        }
        match command {
            Command::DeviceStatus => {
                serde_json::to_value(&self.info).map_err(|e| TankError::Configuration(e.to_string()))
            }
            Command::PressureSetLimits { low_thr, high_thr } => {
                Limits::validate_pressure(low_thr, high_thr)?;
                if low_thr == high_thr {
                    return Err(TankError::Configuration(format!(
                        "pressure limits must differ, got {} twice",
                        low_thr
                    )));
                }
                let mut next = self.config.clone();
                next.limits.pressure_low_raw = low_thr;
                next.limits.pressure_high_raw = high_thr;
                self.persist(&next)?;

                self.pipeline.set_thresholds(low_thr, high_thr)?;
                self.config = next;
                Ok(json!({ "status": true }))
            }
            Command::TankSetLimits { low_thr, high_thr } => {
                Limits::validate_liters(low_thr, high_thr, self.config.tank.capacity_liters())?;
                let mut next = self.config.clone();
                next.limits.liters_low = low_thr;
                next.limits.liters_high = high_thr;
                self.persist(&next)?;

                self.config = next;
                if self.update_status() {
                    self.notify(Trigger::StatusChanged);
                }
                Ok(json!({ "status": true }))
            }
            Command::CounterSetLimits { freq_thr } => {
                Limits::validate_frequency(freq_thr)?;
                let mut next = self.config.clone();
                next.limits.overflow_frequency_hz = freq_thr;
                self.persist(&next)?;

                self.config = next;
                if self.update_overflow() {
                    self.notify(Trigger::StatusChanged);
                }
                Ok(json!({ "status": true }))
            }
            Command::CounterStart => {
                self.measurer.start()?;
                Ok(json!({ "status": true }))
            }
            Command::CounterStop => {
                self.measurer.stop()?;
                Ok(json!({ "status": true }))
            }
        }
    }

    fn persist(&mut self, next: &SystemConfig) -> Result<(), TankError> {
        self.store.save(next).map_err(|e| {
            let err = TankError::storage(e);
            warn!("[Config] {}", err);
            err
        })
    }

    /// Stop the measurement thread and apply whatever it published last.
    pub fn shutdown(&mut self) {
        if self.measurer.is_running() {
            let _ = self.measurer.stop();
        }
        self.measurer.wait_idle();
        self.drain_frequency();
        info!("[Tank] Shutdown complete");
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PressureConfig;
    use crate::status::EnvironmentReading;
    use crate::traits::{MockAdcSource, MockConfigStore, MockEnvironmentSensor, MockGatedCounter, MockNotifier};
    use anyhow::anyhow;
    use mockall::Sequence;

    type TestController =
        TankController<MockAdcSource, MockGatedCounter, MockEnvironmentSensor, MockNotifier, MockConfigStore>;

    fn test_config() -> SystemConfig {
        let mut config = SystemConfig::default();
        config.pressure = PressureConfig {
            adc_period_ms: 40,
            oversample_count: 1,
            ema_alpha: 1.0,
        };
        config.counter.autostart = false;
        config.counter.cycle_period_secs = 0.0;
        config
    }

    fn adc_returning(value: u16) -> MockAdcSource {
        let mut adc = MockAdcSource::new();
        adc.expect_read_raw().returning(move || Ok(value));
        adc
    }

    fn build(adc: MockAdcSource, notifier: MockNotifier, store: MockConfigStore) -> TestController {
        TankController::new(
            adc,
            MockGatedCounter::new(),
            MockEnvironmentSensor::new(),
            notifier,
            store,
            test_config(),
        )
        .unwrap()
    }

    #[test]
    fn test_invalid_calibration_prevents_activation() {
        let mut config = test_config();
        config.limits.pressure_low_raw = 600.0;
        config.limits.pressure_high_raw = 600.0;
        let result = TankController::new(
            MockAdcSource::new(),
            MockGatedCounter::new(),
            MockEnvironmentSensor::new(),
            MockNotifier::new(),
            MockConfigStore::new(),
            config,
        );
        assert!(matches!(result, Err(TankError::Configuration(_))));
    }

    #[test]
    fn test_full_tank_notifies_status_once() {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut notifier = MockNotifier::new();
        notifier
            .expect_notify()
            .withf(|trigger, info, raw| {
                *trigger == Trigger::StatusChanged
                    && info.tank_status == TankStatus::Full
                    && (info.tank_percentage - 100.0).abs() < 1e-6
                    && raw.tank_pressure_adc == 680
            })
            .times(1)
            .return_const(());

        let mut controller = build(adc_returning(680), notifier, MockConfigStore::new());
        controller.poll_adc();
        // Same sample again: nothing changed, nothing sent
        controller.poll_adc();

        assert_eq!(controller.sensor_info().tank_status, TankStatus::Full);
        assert!((controller.sensor_info().tank_liters - 196.35).abs() < 0.01);
    }

    #[test]
    fn test_raw_change_without_volume_change() {
        let mut notifier = MockNotifier::new();
        let mut seq = Sequence::new();
        notifier
            .expect_notify()
            .withf(|trigger, _, _| *trigger == Trigger::StatusChanged)
            .times(1)
            .in_sequence(&mut seq)
            .return_const(());
        notifier
            .expect_notify()
            .withf(|trigger, _, raw| *trigger == Trigger::RawChanged && raw.tank_pressure_adc == 591)
            .times(1)
            .in_sequence(&mut seq)
            .return_const(());

        let mut adc = MockAdcSource::new();
        let mut samples = vec![590u16, 591].into_iter();
        adc.expect_read_raw()
            .returning(move || samples.next().ok_or_else(|| anyhow!("done")));

        let mut controller = build(adc, notifier, MockConfigStore::new());
        controller.poll_adc();
        // One raw count is about 0.3cm, well inside the volume debounce
        controller.poll_adc();
        assert_eq!(controller.sensor_info().tank_status, TankStatus::Normal);
    }

    #[test]
    fn test_volume_within_same_status_is_raw_change() {
        let mut notifier = MockNotifier::new();
        let mut seq = Sequence::new();
        notifier
            .expect_notify()
            .withf(|trigger, info, _| *trigger == Trigger::StatusChanged && info.tank_status == TankStatus::Normal)
            .times(1)
            .in_sequence(&mut seq)
            .return_const(());
        notifier
            .expect_notify()
            .withf(|trigger, info, _| *trigger == Trigger::RawChanged && info.tank_status == TankStatus::Normal)
            .times(2)
            .in_sequence(&mut seq)
            .return_const(());

        let mut adc = MockAdcSource::new();
        let mut samples = vec![590u16, 600, 610].into_iter();
        adc.expect_read_raw()
            .returning(move || samples.next().ok_or_else(|| anyhow!("done")));

        let mut controller = build(adc, notifier, MockConfigStore::new());
        let mut volumes = Vec::new();
        for _ in 0..3 {
            controller.poll_adc();
            volumes.push(controller.sensor_info().tank_liters);
        }

        // Every step is well past the debounce, yet the status never moved
        assert!(volumes[1] - volumes[0] > 1.5 && volumes[2] - volumes[1] > 1.5, "{:?}", volumes);
        assert_eq!(controller.sensor_info().tank_status, TankStatus::Normal);
    }

    #[test]
    fn test_transient_adc_error_is_skipped() {
        let mut adc = MockAdcSource::new();
        adc.expect_read_raw().returning(|| Err(anyhow!("adc busy")));

        // Notifier without expectations: any call would fail the test
        let mut controller = build(adc, MockNotifier::new(), MockConfigStore::new());
        controller.poll_adc();
        assert_eq!(controller.raw_reading(), &RawReading::default());
        assert_eq!(controller.sensor_info(), &SensorInfo::default());
    }

    #[test]
    fn test_environment_updates_snapshot_silently() {
        let mut environment = MockEnvironmentSensor::new();
        environment.expect_read().times(1).returning(|| {
            Ok(EnvironmentReading {
                temperature: 21.5,
                pressure: 1013.2,
                humidity: 48.0,
            })
        });
        environment.expect_read().returning(|| Err(anyhow!("i2c nack")));

        let mut controller = TankController::new(
            MockAdcSource::new(),
            MockGatedCounter::new(),
            environment,
            MockNotifier::new(),
            MockConfigStore::new(),
            test_config(),
        )
        .unwrap();

        controller.poll_environment();
        controller.poll_environment();
        assert_eq!(controller.sensor_info().air_temperature, 21.5);
        assert_eq!(controller.sensor_info().air_pressure, 1013.2);
        assert_eq!(controller.sensor_info().air_humidity, 48.0);
    }

    #[test]
    fn test_pressure_limits_persisted_then_applied() {
        let mut store = MockConfigStore::new();
        store
            .expect_save()
            .withf(|config| config.limits.pressure_low_raw == 400.0 && config.limits.pressure_high_raw == 900.0)
            .times(1)
            .returning(|_| Ok(()));

        let mut controller = build(MockAdcSource::new(), MockNotifier::new(), store);
        let reply = controller
            .apply(Command::PressureSetLimits { low_thr: 400.0, high_thr: 900.0 })
            .unwrap();

        assert_eq!(reply, json!({ "status": true }));
        assert_eq!(controller.config().limits.pressure_low_raw, 400.0);
        assert_eq!(controller.pipeline().thresholds(), Some((400.0, 900.0)));
    }

    #[test]
    fn test_storage_failure_keeps_previous_limits() {
        let mut store = MockConfigStore::new();
        store.expect_save().returning(|_| Err(anyhow!("flash write failed")));

        let mut controller = build(MockAdcSource::new(), MockNotifier::new(), store);
        let err = controller
            .apply(Command::PressureSetLimits { low_thr: 400.0, high_thr: 900.0 })
            .unwrap_err();

        assert!(matches!(err, TankError::Storage(_)));
        assert_eq!(controller.pipeline().thresholds(), Some((500.0, 680.0)));
        assert_eq!(controller.config().limits, Limits::default());
    }

    #[test]
    fn test_out_of_range_limits_never_reach_store() {
        // Store without expectations: a save would fail the test
        let mut controller = build(MockAdcSource::new(), MockNotifier::new(), MockConfigStore::new());

        let cases = [
            Command::PressureSetLimits { low_thr: 700.0, high_thr: 600.0 },
            Command::PressureSetLimits { low_thr: -1.0, high_thr: 600.0 },
            Command::PressureSetLimits { low_thr: 100.0, high_thr: 4097.0 },
            Command::TankSetLimits { low_thr: 50.0, high_thr: 500.0 },
            Command::CounterSetLimits { freq_thr: 250.0 },
        ];
        for command in cases {
            let err = controller.apply(command.clone()).unwrap_err();
            assert!(matches!(err, TankError::Range(_)), "{:?} gave {:?}", command, err);
        }

        let err = controller
            .apply(Command::PressureSetLimits { low_thr: 600.0, high_thr: 600.0 })
            .unwrap_err();
        assert!(matches!(err, TankError::Configuration(_)));
        assert_eq!(controller.config().limits, Limits::default());
    }

    #[test]
    fn test_tank_limits_reclassify_current_volume() {
        let mut notifier = MockNotifier::new();
        let mut seq = Sequence::new();
        notifier
            .expect_notify()
            .withf(|_, info, _| info.tank_status == TankStatus::Normal)
            .times(1)
            .in_sequence(&mut seq)
            .return_const(());
        notifier
            .expect_notify()
            .withf(|trigger, info, _| *trigger == Trigger::StatusChanged && info.tank_status == TankStatus::Low)
            .times(1)
            .in_sequence(&mut seq)
            .return_const(());

        let mut store = MockConfigStore::new();
        store.expect_save().returning(|_| Ok(()));

        // 590 is half way: about 98L
        let mut controller = build(adc_returning(590), notifier, store);
        controller.poll_adc();

        controller
            .apply(Command::TankSetLimits { low_thr: 100.0, high_thr: 150.0 })
            .unwrap();
        assert_eq!(controller.sensor_info().tank_status, TankStatus::Low);
        assert_eq!(controller.config().limits.liters_low, 100.0);
    }

    #[test]
    fn test_overflow_flag_follows_frequency() {
        let mut notifier = MockNotifier::new();
        let mut seq = Sequence::new();
        for (trigger, overflow) in [
            (Trigger::StatusChanged, true),
            (Trigger::StatusChanged, false),
            (Trigger::RawChanged, false),
        ] {
            notifier
                .expect_notify()
                .withf(move |t, info, _| *t == trigger && info.tank_overflow == overflow)
                .times(1)
                .in_sequence(&mut seq)
                .return_const(());
        }

        let mut controller = build(MockAdcSource::new(), notifier, MockConfigStore::new());

        // Default threshold is 100Hz
        controller.handle_frequency(FrequencyReading::from_edges(200, 1.0));
        // Identical reading is not news
        controller.handle_frequency(FrequencyReading::from_edges(200, 1.0));
        controller.handle_frequency(FrequencyReading::from_edges(100, 1.0));
        controller.handle_frequency(FrequencyReading::from_edges(120, 1.0));

        assert_eq!(controller.raw_reading().counter_count, 120);
        assert_eq!(controller.raw_reading().counter_frequency, 60.0);
    }

    #[test]
    fn test_zero_threshold_disables_overflow() {
        let mut notifier = MockNotifier::new();
        notifier
            .expect_notify()
            .withf(|trigger, info, _| *trigger == Trigger::RawChanged && !info.tank_overflow)
            .times(1)
            .return_const(());
        let mut store = MockConfigStore::new();
        store.expect_save().times(1).returning(|_| Ok(()));

        let mut controller = build(MockAdcSource::new(), notifier, store);
        controller.apply(Command::CounterSetLimits { freq_thr: 0.0 }).unwrap();
        controller.handle_frequency(FrequencyReading::from_edges(100_000, 1.0));
        assert!(!controller.sensor_info().tank_overflow);
    }

    #[test]
    fn test_heartbeat_after_quiet_period() {
        let mut notifier = MockNotifier::new();
        notifier
            .expect_notify()
            .withf(|trigger, _, _| *trigger == Trigger::Timer)
            .times(1)
            .return_const(());

        let mut controller = build(MockAdcSource::new(), notifier, MockConfigStore::new());
        controller.tick(Instant::now());
        controller.tick(Instant::now() + Duration::from_secs(6));
        // Heartbeat restarted the period
        controller.tick(Instant::now() + Duration::from_secs(1));
        assert!(controller.next_heartbeat() > Instant::now());
    }

    #[test]
    fn test_counter_start_stop_commands() {
        let mut counter = MockGatedCounter::new();
        counter.expect_clear().returning(|| Ok(()));
        counter.expect_gate().returning(|_| Ok(()));
        counter.expect_count().returning(|| Ok(40));
        counter.expect_halt().returning(|| Ok(()));

        let mut notifier = MockNotifier::new();
        notifier.expect_notify().return_const(());

        let mut controller = TankController::new(
            MockAdcSource::new(),
            counter,
            MockEnvironmentSensor::new(),
            notifier,
            MockConfigStore::new(),
            test_config(),
        )
        .unwrap();

        assert_eq!(controller.apply(Command::CounterStop), Err(TankError::NotRunning));
        controller.apply(Command::CounterStart).unwrap();
        assert_eq!(controller.apply(Command::CounterStart), Err(TankError::AlreadyRunning));

        let reading = controller.frequency_events().recv_timeout(Duration::from_secs(2)).unwrap();
        controller.handle_frequency(reading);
        assert_eq!(controller.raw_reading().counter_frequency, 20.0);

        controller.apply(Command::CounterStop).unwrap();
        controller.shutdown();
        assert_eq!(controller.measurer_state(), MeasurerState::Idle);
        // Final zeroed reading was applied
        assert_eq!(controller.raw_reading().counter_count, 0);
        assert_eq!(controller.raw_reading().counter_frequency, 0.0);
    }

    #[test]
    fn test_device_status_reply() {
        let mut controller = build(MockAdcSource::new(), MockNotifier::new(), MockConfigStore::new());
        let reply = controller.apply(Command::DeviceStatus).unwrap();
        assert_eq!(reply["tank_status"], "normal");
        assert_eq!(reply["tank_overflow"], false);
    }
}
