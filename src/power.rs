//! # Power Monitoring
//!
//! Answers "is the rig on external (bike) power?" without re-probing the
//! hardware more often than the configured check interval.
//!
//! Probes:
//! - [`SysfsBatteryProbe`]: UPS HAT battery status / voltage under
//!   `/sys/class/power_supply`
//! - [`ThrottledProbe`]: Raspberry Pi `vcgencmd get_throttled` under-voltage bit
//! - [`AlwaysExternal`]: rigs wired straight to the bike without a UPS

use std::fs;
use std::path::PathBuf;
use std::process::Command;

use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::{PowerConfig, PowerSource};
use crate::error::{RecorderError, Result};
use crate::types::PowerState;

/// Battery status strings meaning the charger is fed from outside
const EXTERNAL_STATUSES: &[&str] = &["Charging", "Not charging", "Full"];

/// Under-voltage-now bit of `get_throttled`
const THROTTLED_UNDER_VOLTAGE: u32 = 0x1;

/// Source of the raw external-power reading
#[cfg_attr(test, mockall::automock)]
pub trait PowerProbe: Send {
    /// Probe the hardware once. May be slow.
    fn probe(&mut self) -> Result<bool>;
}

/// Reads the UPS battery state from sysfs.
#[derive(Debug, Clone)]
pub struct SysfsBatteryProbe {
    status_path: PathBuf,
    voltage_path: PathBuf,
    min_external_voltage: f64,
}

impl SysfsBatteryProbe {
    pub fn new(status_path: impl Into<PathBuf>, voltage_path: impl Into<PathBuf>, min_external_voltage: f64) -> Self {
        Self {
            status_path: status_path.into(),
            voltage_path: voltage_path.into(),
            min_external_voltage,
        }
    }
}

impl PowerProbe for SysfsBatteryProbe {
    fn probe(&mut self) -> Result<bool> {
        if self.status_path.exists() {
            let status = fs::read_to_string(&self.status_path)?;
            return Ok(EXTERNAL_STATUSES.contains(&status.trim()));
        }

        if self.voltage_path.exists() {
            let raw = fs::read_to_string(&self.voltage_path)?;
            let microvolts: f64 = raw.trim().parse().map_err(|_| {
                RecorderError::PowerProbe(format!("Unreadable voltage_now value: {:?}", raw.trim()))
            })?;
            return Ok(microvolts / 1_000_000.0 > self.min_external_voltage);
        }

        Err(RecorderError::PowerProbe(format!(
            "Neither {} nor {} exists",
            self.status_path.display(),
            self.voltage_path.display()
        )))
    }
}

/// Runs `vcgencmd get_throttled` and reports external power while the
/// under-voltage bit is clear.
#[derive(Debug, Clone, Default)]
pub struct ThrottledProbe;

impl PowerProbe for ThrottledProbe {
    fn probe(&mut self) -> Result<bool> {
        let output = Command::new("vcgencmd").arg("get_throttled").output()?;
        if !output.status.success() {
            return Err(RecorderError::PowerProbe(format!(
                "vcgencmd exited with {}",
                output.status
            )));
        }
        let text = String::from_utf8_lossy(&output.stdout);
        let flags = parse_throttled(&text)?;
        Ok(flags & THROTTLED_UNDER_VOLTAGE == 0)
    }
}

/// Parse `throttled=0x50005` into its flag word
pub fn parse_throttled(output: &str) -> Result<u32> {
    let value = output
        .trim()
        .strip_prefix("throttled=")
        .ok_or_else(|| RecorderError::PowerProbe(format!("Unexpected vcgencmd output: {:?}", output.trim())))?;
    let hex = value.trim_start_matches("0x").trim_start_matches("0X");
    u32::from_str_radix(hex, 16)
        .map_err(|_| RecorderError::PowerProbe(format!("Bad throttled flags: {:?}", value)))
}

/// For rigs without a UPS: if the process is running, the bike is powering it.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysExternal;

impl PowerProbe for AlwaysExternal {
    fn probe(&mut self) -> Result<bool> {
        Ok(true)
    }
}

/// Build the probe selected in the configuration
pub fn probe_from_config(config: &PowerConfig) -> Box<dyn PowerProbe> {
    match config.source {
        PowerSource::Sysfs => Box::new(SysfsBatteryProbe::new(
            &config.battery_status_path,
            &config.battery_voltage_path,
            config.min_external_voltage,
        )),
        PowerSource::Throttled => Box::new(ThrottledProbe),
        PowerSource::Always => Box::new(AlwaysExternal),
    }
}

impl PowerProbe for Box<dyn PowerProbe> {
    fn probe(&mut self) -> Result<bool> {
        (**self).probe()
    }
}

/// Caching wrapper around a [`PowerProbe`].
///
/// The probe runs at most once per `check_interval`; between checks the
/// cached value is returned. Power gained/lost is logged once per edge.
pub struct PowerMonitor<P: PowerProbe> {
    probe: P,
    check_interval: Duration,
    state: PowerState,
    edges: u64,
}

impl<P: PowerProbe> PowerMonitor<P> {
    pub fn new(probe: P, check_interval: Duration) -> Self {
        Self {
            probe,
            check_interval,
            state: PowerState::default(),
            edges: 0,
        }
    }

    /// Current external-power reading, re-probing if the cache is stale
    pub fn external_power(&mut self) -> bool {
        self.external_power_at(Instant::now())
    }

    /// Same as [`external_power`](Self::external_power) with an explicit clock
    pub fn external_power_at(&mut self, now: Instant) -> bool {
        let stale = match self.state.last_checked {
            None => true,
            Some(checked) => now.saturating_duration_since(checked) >= self.check_interval,
        };
        if !stale {
            return self.state.external;
        }

        let reading = match self.probe.probe() {
            Ok(external) => external,
            Err(e) => {
                warn!("Could not check power source: {}", e);
                false
            }
        };

        let first = self.state.last_checked.is_none();
        let previous = self.state.external;
        self.state = PowerState {
            external: reading,
            last_checked: Some(now),
        };

        if first {
            info!("Initial power source: {}", describe(reading));
        } else if previous != reading {
            self.edges += 1;
            if reading {
                info!("External power connected (bike power)");
            } else {
                info!("Running on battery power (UPS)");
            }
        } else {
            debug!("Power source unchanged: {}", describe(reading));
        }

        reading
    }

    pub fn state(&self) -> PowerState {
        self.state
    }

    /// Number of power edges observed since start
    pub fn edge_count(&self) -> u64 {
        self.edges
    }
}

fn describe(external: bool) -> &'static str {
    if external {
        "external"
    } else {
        "battery"
    }
}
