use anyhow::{anyhow, Result};
use clap::Parser;
use crossbeam_channel::{never, select, tick, unbounded, Receiver};
use log::{error, info, warn};
use serde_json::json;
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tankmon::command::Command;
use tankmon::config::{JsonFileStore, SystemConfig};
use tankmon::controller::TankController;
use tankmon::sim::{SimSettings, SimTank};
use tankmon::status::{RawReading, SensorInfo, Trigger};
use tankmon::traits::Notifier;

// Upper bound on how long the loop waits before re-checking Ctrl+C
const IDLE_WAIT: Duration = Duration::from_millis(200);

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// JSON configuration file, created on the first limit change
    #[arg(short, long, default_value = "tankmon.json")]
    config: PathBuf,

    #[arg(short, long, default_value_t = false)]
    verbose: bool,

    /// Simulated fill rate in cm/s (negative drains)
    #[arg(long, default_value_t = 0.05)]
    fill_rate: f64,

    /// Simulated overflow probe frequency once the tank is full
    #[arg(long, default_value_t = 150.0)]
    overflow_hz: f64,
}

/// Notification layer stand-in: one JSON line per notification.
struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&mut self, trigger: Trigger, info: &SensorInfo, raw: &RawReading) {
        let payload = json!({ "trigger": trigger, "sensor": info, "raw": raw });
        info!("[Notify] {}", payload);
    }
}

/// Newline-delimited JSON commands from stdin.
fn spawn_command_reader() -> Result<Receiver<String>> {
    let (tx, rx) = unbounded();
    thread::Builder::new()
        .name("stdin_commands".to_string())
        .spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                match line {
                    Ok(line) if line.trim().is_empty() => continue,
                    Ok(line) => {
                        if tx.send(line).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("[Command] stdin read failed: {}", e);
                        break;
                    }
                }
            }
        })
        .map_err(|e| anyhow!("Failed to spawn command reader: {}", e))?;
    Ok(rx)
}

fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::builder()
        .format_timestamp(None)
        .filter_level(if args.verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        })
        .init();

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();

    ctrlc::set_handler(move || {
        info!("Ctrl+C received. Shutting down...");
        r.store(false, Ordering::SeqCst);
    })?;

    let config = SystemConfig::load(&args.config)?;
    if let Err(e) = config.validate() {
        error!("Invalid configuration in {}: {}", args.config.display(), e);
        return Err(e.into());
    }

    let tank = SimTank::new(SimSettings {
        diameter_cm: 2.0 * config.tank.radius_cm,
        adc_empty: config.limits.pressure_low_raw,
        adc_full: config.limits.pressure_high_raw,
        overflow_level_cm: 2.0 * config.tank.radius_cm * 0.98,
        fill_rate_cm_per_s: args.fill_rate,
        overflow_hz: args.overflow_hz,
        ..SimSettings::default()
    });
    info!("Simulated tank: fill {}cm/s, overflow {}Hz", args.fill_rate, args.overflow_hz);

    let adc_period_secs = config.pressure.adc_period_ms as f64 / 1000.0;
    let mut controller = TankController::new(
        tank.adc(adc_period_secs),
        tank.counter(),
        tank.environment(),
        LogNotifier,
        JsonFileStore::new(args.config.clone()),
        config,
    )?;

    let adc_tick = tick(controller.adc_period());
    let environment_tick = tick(controller.environment_period());
    let frequency_rx = controller.frequency_events();
    let mut command_rx = spawn_command_reader()?;

    info!("Starting measurement loop...");
    while running.load(Ordering::SeqCst) {
        let mut stdin_open = true;

        select! {
            recv(adc_tick) -> _ => controller.poll_adc(),
            recv(environment_tick) -> _ => controller.poll_environment(),
            recv(frequency_rx) -> msg => {
                if let Ok(reading) = msg {
                    controller.handle_frequency(reading);
                }
            }
            recv(command_rx) -> msg => match msg {
                Ok(line) => {
                    let reply = match serde_json::from_str::<Command>(&line) {
                        Ok(command) => match controller.apply(command) {
                            Ok(value) => value,
                            Err(e) => json!({ "error": e.to_string() }),
                        },
                        Err(e) => json!({ "error": format!("bad request: {}", e) }),
                    };
                    println!("{}", reply);
                }
                Err(_) => stdin_open = false,
            },
            default(IDLE_WAIT) => {}
        }

        if !stdin_open {
            info!("[Command] stdin closed, commands disabled");
            command_rx = never();
        }

        controller.tick(Instant::now());
    }

    controller.shutdown();
    info!("Exiting.");
    Ok(())
}
