//! # Serial Communication Module
//!
//! Handles serial communication with a GPS receiver that speaks NMEA 0183
//! directly over USB or a UART.
//!
//! This module handles:
//! - Opening the first available serial device from a list of candidates
//! - Line-oriented async reads (one NMEA sentence per line)

pub mod port_trait;

use crate::error::{RecorderError, Result};
use port_trait::TokioSerialPort;
use tracing::{debug, info, warn};

/// Default GPS device paths to try (in order of preference)
pub const DEFAULT_DEVICE_PATHS: &[&str] = &[
    "/dev/ttyACM0", // USB CDC receivers (u-blox and friends)
    "/dev/ttyUSB0", // USB-to-serial adapters
];

/// GPS serial port handle
///
/// Wraps the opened port together with the path it was found at.
pub struct GpsSerial {
    port: TokioSerialPort,
    device_path: String,
}

impl std::fmt::Debug for GpsSerial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpsSerial")
            .field("device_path", &self.device_path)
            .finish_non_exhaustive()
    }
}

impl GpsSerial {
    /// Open connection to the GPS receiver with custom device paths
    ///
    /// # Arguments
    ///
    /// * `paths` - Device paths to try (e.g., &["/dev/ttyACM0"])
    /// * `baud_rate` - Receiver baud rate (9600 for most modules)
    ///
    /// # Errors
    ///
    /// Returns `SerialPortNotFound` listing every path tried if none opens
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use ride_recorder::serial::GpsSerial;
    ///
    /// let serial = GpsSerial::open_with_paths(&["/dev/ttyACM0"], 9600)?;
    /// println!("GPS on {}", serial.device_path());
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn open_with_paths<S: AsRef<str>>(paths: &[S], baud_rate: u32) -> Result<Self> {
        for path in paths {
            let path = path.as_ref();
            debug!("Trying to open GPS serial port: {}", path);

            match Self::open_port(path, baud_rate) {
                Ok(port) => {
                    info!("Opened GPS receiver at {} ({} baud)", path, baud_rate);
                    return Ok(Self {
                        port: TokioSerialPort::new(port),
                        device_path: path.to_string(),
                    });
                }
                Err(e) => {
                    warn!("Failed to open {}: {}", path, e);
                    continue;
                }
            }
        }

        let tried: Vec<&str> = paths.iter().map(|p| p.as_ref()).collect();
        Err(RecorderError::SerialPortNotFound(tried.join(", ")))
    }

    /// Open a specific serial port with 8N1 settings
    fn open_port(path: &str, baud_rate: u32) -> Result<tokio_serial::SerialStream> {
        use tokio_serial::SerialPortBuilderExt;

        tokio_serial::new(path, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| RecorderError::Serial(format!("Failed to open {}: {}", path, e)))
    }

    /// Get the device path of the opened serial port
    pub fn device_path(&self) -> &str {
        &self.device_path
    }

    /// Hand over the line reader, dropping the path bookkeeping
    pub fn into_port(self) -> TokioSerialPort {
        self.port
    }
}
