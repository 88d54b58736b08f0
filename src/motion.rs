//! # Motion Sensor Module
//!
//! Non-blocking access to the 9-axis motion sensor.
//!
//! The concrete driver reads a Linux IIO device through sysfs. The ICM-20948
//! and most other I2C/SPI IMUs show up there once their kernel driver is
//! bound, as a directory of `in_<channel>_<axis>_raw` files.
//!
//! ## Readiness
//!
//! Sysfs has no data-ready flag, so the driver treats a new sample as ready
//! once one output-data-rate period has passed since the previous read.

use std::fs;
use std::path::{Path, PathBuf};

use tokio::time::{Duration, Instant};
use tracing::{debug, info};

use crate::error::{RecorderError, Result};
use crate::types::MotionSample;

const ACCEL_CHANNELS: [&str; 3] = ["in_accel_x_raw", "in_accel_y_raw", "in_accel_z_raw"];
const GYRO_CHANNELS: [&str; 3] = ["in_anglvel_x_raw", "in_anglvel_y_raw", "in_anglvel_z_raw"];
const MAGN_CHANNELS: [&str; 3] = ["in_magn_x_raw", "in_magn_y_raw", "in_magn_z_raw"];
const TEMP_CHANNEL: &str = "in_temp_raw";

/// Motion sensor driver contract
pub trait MotionSensor: Send {
    /// True if a sample newer than the last one read is available
    fn data_ready(&mut self) -> bool;

    /// Read the current sample. Only called after `data_ready()`.
    fn read_latest(&mut self) -> Result<MotionSample>;

    /// Pull one sample if the driver has one ready.
    ///
    /// Never blocks. `None` means "nothing new this tick"; read errors are
    /// logged at debug level and also yield `None`.
    fn read_motion(&mut self) -> Option<MotionSample> {
        if !self.data_ready() {
            return None;
        }
        match self.read_latest() {
            Ok(sample) => Some(sample),
            Err(e) => {
                debug!("Motion sample read failed: {}", e);
                None
            }
        }
    }
}

impl MotionSensor for Box<dyn MotionSensor> {
    fn data_ready(&mut self) -> bool {
        (**self).data_ready()
    }

    fn read_latest(&mut self) -> Result<MotionSample> {
        (**self).read_latest()
    }
}

/// IIO sysfs motion sensor
#[derive(Debug)]
pub struct IioMotionSensor {
    device: PathBuf,
    magnetometer: PathBuf,
    period: Duration,
    last_read: Option<Instant>,
}

impl IioMotionSensor {
    /// Open the sensor, checking that every required channel exists.
    ///
    /// # Arguments
    ///
    /// * `device` - IIO device directory holding accel and gyro channels
    /// * `magnetometer` - Directory holding the magnetometer channels; often a
    ///   separate IIO device on 9-axis parts
    /// * `output_data_rate_hz` - Rate at which the sensor produces new samples
    ///
    /// # Errors
    ///
    /// Returns `MotionSensor` naming the first missing channel file
    pub fn open(device: impl Into<PathBuf>, magnetometer: Option<PathBuf>, output_data_rate_hz: u32) -> Result<Self> {
        let device = device.into();
        let magnetometer = magnetometer.unwrap_or_else(|| device.clone());

        for channel in ACCEL_CHANNELS.iter().chain(GYRO_CHANNELS.iter()) {
            require_channel(&device, channel)?;
        }
        for channel in MAGN_CHANNELS.iter() {
            require_channel(&magnetometer, channel)?;
        }

        let name = fs::read_to_string(device.join("name")).unwrap_or_default();
        info!(
            "Motion sensor opened at {} ({})",
            device.display(),
            if name.trim().is_empty() { "unnamed" } else { name.trim() }
        );

        Ok(Self {
            device,
            magnetometer,
            period: Duration::from_secs_f64(1.0 / output_data_rate_hz.max(1) as f64),
            last_read: None,
        })
    }

    fn read_triplet(dir: &Path, channels: &[&str; 3]) -> Result<[f64; 3]> {
        Ok([
            read_channel(dir, channels[0])?,
            read_channel(dir, channels[1])?,
            read_channel(dir, channels[2])?,
        ])
    }
}

impl MotionSensor for IioMotionSensor {
    fn data_ready(&mut self) -> bool {
        match self.last_read {
            None => true,
            Some(at) => at.elapsed() >= self.period,
        }
    }

    fn read_latest(&mut self) -> Result<MotionSample> {
        self.last_read = Some(Instant::now());

        let [ax, ay, az] = Self::read_triplet(&self.device, &ACCEL_CHANNELS)?;
        let [gx, gy, gz] = Self::read_triplet(&self.device, &GYRO_CHANNELS)?;
        let [mx, my, mz] = Self::read_triplet(&self.magnetometer, &MAGN_CHANNELS)?;
        let temperature = read_channel(&self.device, TEMP_CHANNEL).ok();

        Ok(MotionSample {
            ax,
            ay,
            az,
            gx,
            gy,
            gz,
            mx,
            my,
            mz,
            temperature,
        })
    }
}

fn require_channel(dir: &Path, channel: &str) -> Result<()> {
    let path = dir.join(channel);
    if path.exists() {
        Ok(())
    } else {
        Err(RecorderError::MotionSensor(format!("missing channel {}", path.display())))
    }
}

fn read_channel(dir: &Path, channel: &str) -> Result<f64> {
    let path = dir.join(channel);
    let raw = fs::read_to_string(&path)?;
    raw.trim()
        .parse::<f64>()
        .map_err(|_| RecorderError::MotionSensor(format!("unreadable value {:?} in {}", raw.trim(), path.display())))
}

#[cfg(test)]
pub mod mocks {
    use super::*;
    use std::collections::VecDeque;

    /// Mock motion sensor replaying queued samples; `None` entries mean
    /// "not ready this tick". An exhausted queue is never ready.
    #[derive(Default)]
    pub struct MockMotionSensor {
        pub queue: VecDeque<Option<MotionSample>>,
    }

    impl MockMotionSensor {
        pub fn new(queue: Vec<Option<MotionSample>>) -> Self {
            Self { queue: queue.into() }
        }

        pub fn silent() -> Self {
            Self::default()
        }
    }

    impl MotionSensor for MockMotionSensor {
        fn data_ready(&mut self) -> bool {
            match self.queue.front() {
                Some(Some(_)) => true,
                Some(None) => {
                    self.queue.pop_front();
                    false
                }
                None => false,
            }
        }

        fn read_latest(&mut self) -> Result<MotionSample> {
            self.queue
                .pop_front()
                .flatten()
                .ok_or_else(|| RecorderError::MotionSensor("no queued sample".to_string()))
        }
    }

    pub fn sample(seed: f64) -> MotionSample {
        MotionSample {
            ax: seed,
            ay: seed + 1.0,
            az: seed + 2.0,
            gx: seed + 3.0,
            gy: seed + 4.0,
            gz: seed + 5.0,
            mx: seed + 6.0,
            my: seed + 7.0,
            mz: seed + 8.0,
            temperature: Some(21.5),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mocks::{sample, MockMotionSensor};
    use super::*;
    use tempfile::TempDir;

    fn fake_device(with_magn: bool) -> TempDir {
        let dir = TempDir::new().unwrap();
        let mut channels: Vec<&str> = ACCEL_CHANNELS.iter().chain(GYRO_CHANNELS.iter()).copied().collect();
        if with_magn {
            channels.extend(MAGN_CHANNELS.iter());
        }
        for (i, channel) in channels.iter().enumerate() {
            fs::write(dir.path().join(channel), format!("{}\n", i as i32 - 4)).unwrap();
        }
        fs::write(dir.path().join("name"), "icm20948\n").unwrap();
        dir
    }

    #[test]
    fn test_open_missing_device_fails() {
        let result = IioMotionSensor::open("/nonexistent/iio:device9", None, 100);
        assert!(matches!(result, Err(RecorderError::MotionSensor(_))));
    }

    #[test]
    fn test_open_without_magnetometer_fails() {
        let dir = fake_device(false);
        assert!(IioMotionSensor::open(dir.path(), None, 100).is_err());
    }

    #[test]
    fn test_separate_magnetometer_device() {
        let imu = fake_device(false);
        let magn = TempDir::new().unwrap();
        for channel in MAGN_CHANNELS {
            fs::write(magn.path().join(channel), "12\n").unwrap();
        }

        let mut sensor = IioMotionSensor::open(imu.path(), Some(magn.path().to_path_buf()), 100).unwrap();
        let reading = sensor.read_motion().unwrap();
        assert_eq!((reading.mx, reading.my, reading.mz), (12.0, 12.0, 12.0));
    }

    #[test]
    fn test_reads_all_axes() {
        let dir = fake_device(true);
        let mut sensor = IioMotionSensor::open(dir.path(), None, 100).unwrap();

        let reading = sensor.read_motion().expect("first read is always ready");
        assert_eq!(reading.ax, -4.0);
        assert_eq!(reading.gz, 1.0);
        assert_eq!(reading.mz, 4.0);
        assert_eq!(reading.temperature, None);
    }

    #[test]
    fn test_temperature_channel_is_optional() {
        let dir = fake_device(true);
        fs::write(dir.path().join(TEMP_CHANNEL), "2450\n").unwrap();
        let mut sensor = IioMotionSensor::open(dir.path(), None, 100).unwrap();
        assert_eq!(sensor.read_motion().unwrap().temperature, Some(2450.0));
    }

    #[test]
    fn test_not_ready_right_after_read() {
        let dir = fake_device(true);
        let mut sensor = IioMotionSensor::open(dir.path(), None, 1).unwrap();
        assert!(sensor.read_motion().is_some());
        assert!(sensor.read_motion().is_none());
    }

    #[test]
    fn test_garbage_value_yields_none() {
        let dir = fake_device(true);
        let mut sensor = IioMotionSensor::open(dir.path(), None, 100).unwrap();
        fs::write(dir.path().join("in_accel_x_raw"), "garbage\n").unwrap();
        assert!(sensor.read_motion().is_none());
    }

    #[test]
    fn test_mock_replays_queue() {
        let mut sensor = MockMotionSensor::new(vec![Some(sample(1.0)), None, Some(sample(2.0))]);
        assert_eq!(sensor.read_motion(), Some(sample(1.0)));
        assert_eq!(sensor.read_motion(), None);
        assert_eq!(sensor.read_motion(), Some(sample(2.0)));
        assert_eq!(sensor.read_motion(), None);
    }
}
