//! # Ride Recorder
//!
//! Records motion and position telemetry while the vehicle's engine runs.
//!
//! ## Usage
//!
//! ```bash
//! ride-recorder [config.toml]
//! ```
//!
//! Without an argument the configuration is read from `config/default.toml`.
//! `RUST_LOG` overrides the configured log level.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::time::{timeout, Duration};
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use ride_recorder::config::{Config, GpsSource, LoggingConfig};
use ride_recorder::engine::EngineStateMachine;
use ride_recorder::gps::gpsd::GpsdSource;
use ride_recorder::gps::nmea::NmeaSource;
use ride_recorder::gps::{PositionReader, ReaderSettings};
use ride_recorder::motion::IioMotionSensor;
use ride_recorder::power::{probe_from_config, PowerMonitor};
use ride_recorder::sampler::SampleLoop;
use ride_recorder::session::SessionManager;
use ride_recorder::shutdown::{trigger_on_signal, Shutdown};
use ride_recorder::storage::{SqliteStore, TelemetryStore};

/// Configuration used when no path is given on the command line
const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

/// How long the GPS reader gets to notice shutdown before it is abandoned
const READER_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Main entry point for the recorder daemon
///
/// # Control Flow
///
/// 1. **Initialization**
///    - Load and validate the configuration
///    - Set up logging (stdout plus a daily log file)
///    - Create the database schema and report rides left open by a crash
///    - Open the motion sensor and the power probe
///    - Start the GPS reader task and the signal handler
///
/// 2. **Main Loop**
///    - Wait (bounded) for a first GPS fix
///    - Run the sample loop until SIGINT or SIGTERM
///
/// 3. **Graceful Shutdown**
///    - Close the open ride, if any
///    - Stop the GPS reader
///
/// # Errors
///
/// Returns error if:
/// - The configuration cannot be loaded or is invalid
/// - The database cannot be opened
/// - The motion sensor is not available
#[tokio::main]
async fn main() -> Result<()> {
    let config_path = config_path_from_args(std::env::args().skip(1));
    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load configuration from {}", config_path.display()))?;

    let _log_guard = init_logging(&config.logging)?;

    info!("Ride Recorder v{} starting...", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded from {}", config_path.display());

    let store = SqliteStore::new(&config.storage.db_path, config.storage.busy_timeout());
    store
        .init_schema()
        .await
        .with_context(|| format!("failed to initialize database {}", config.storage.db_path))?;
    let store: Arc<dyn TelemetryStore> = Arc::new(store);
    info!("Database ready at {}", config.storage.db_path);

    if let Err(e) = SessionManager::new(store.clone()).dangling_sessions().await {
        warn!("Could not check for unfinished rides: {}", e);
    }

    let motion = IioMotionSensor::open(
        &config.motion.device_path,
        config.motion.magnetometer(),
        config.motion.output_data_rate_hz,
    )
    .context("motion sensor not available")?;

    let power = PowerMonitor::new(probe_from_config(&config.power), config.power.check_interval());

    let shutdown = Shutdown::new();
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = trigger_on_signal(signal_shutdown).await {
            error!("Signal handler failed: {}", e);
        }
    });

    let reader = PositionReader::new(config.gps.history_len);
    let settings = ReaderSettings {
        read_timeout: config.gps.read_timeout(),
        reconnect_interval: config.gps.reconnect_interval(),
    };
    let reader_task = match config.gps.source {
        GpsSource::Gpsd => reader.spawn(GpsdSource::new(&config.gps.gpsd_addr), settings, shutdown.clone()),
        GpsSource::Nmea => reader.spawn(
            NmeaSource::new(config.gps.serial_ports.clone(), config.gps.baud_rate),
            settings,
            shutdown.clone(),
        ),
    };

    info!("Waiting up to {:?} for a GPS fix...", config.gps.initial_fix_wait());
    match reader.wait_for_fix(config.gps.initial_fix_wait(), &mut shutdown.clone()).await {
        Some(fix) => info!(
            "GPS fix acquired at {:.6}, {:.6}",
            fix.latitude.unwrap_or_default(),
            fix.longitude.unwrap_or_default()
        ),
        None => warn!("No GPS fix yet; recording continues without position until one arrives"),
    }

    let mut sampler = SampleLoop::new(
        motion,
        reader.clone(),
        power,
        EngineStateMachine::new(config.engine.off_cooldown()),
        store,
        config.sampling.tick_interval(),
        config.sampling.status_log_interval_ticks,
    );
    sampler.run(shutdown.clone()).await;

    shutdown.trigger();
    if timeout(READER_JOIN_TIMEOUT, reader_task).await.is_err() {
        warn!("GPS reader did not stop within {:?}", READER_JOIN_TIMEOUT);
    }

    info!("Ride Recorder stopped");
    Ok(())
}

fn config_path_from_args(mut args: impl Iterator<Item = String>) -> PathBuf {
    args.next().map_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH), PathBuf::from)
}

/// Install the global subscriber: stdout always, plus a daily rolling file
/// when enabled. The returned guard flushes the file writer on drop.
fn init_logging(logging: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))
        .with_context(|| format!("invalid log level {:?}", logging.level))?;

    let (file_layer, guard) = if logging.file_enabled {
        std::fs::create_dir_all(&logging.log_dir)
            .with_context(|| format!("failed to create log directory {}", logging.log_dir))?;
        let appender = tracing_appender::rolling::daily(&logging.log_dir, "ride-recorder.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        (Some(fmt::layer().with_writer(writer).with_ansi(false)), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(file_layer)
        .init();

    Ok(guard)
}
