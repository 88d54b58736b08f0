//! # NMEA 0183 Source
//!
//! Reads sentences straight from a serial GPS receiver.
//!
//! - `$xxRMC` (recommended minimum): position, speed over ground in knots,
//!   course, and an `A`/`V` validity flag
//! - `$xxGGA` (fix data): satellites in use and HDOP
//!
//! Any talker id is accepted (`GP`, `GN`, `GL`, ...). When a `*HH` checksum
//! is present it must match.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::time::{timeout, Duration};

use tracing::debug;

use super::{decode_line_bytes, is_transient, PositionReport, PositionSource};
use crate::error::{RecorderError, Result};
use crate::serial::port_trait::SerialLineIO;
use crate::serial::GpsSerial;
use crate::types::{coordinates_valid, Fix, KNOTS_TO_MPH};

/// Position source reading NMEA sentences from a serial port
pub struct NmeaSource {
    paths: Vec<String>,
    baud_rate: u32,
    port: Option<Box<dyn SerialLineIO>>,
    // Partial sentence kept across timed-out reads
    buf: Vec<u8>,
}

impl NmeaSource {
    pub fn new(paths: Vec<String>, baud_rate: u32) -> Self {
        Self {
            paths,
            baud_rate,
            port: None,
            buf: Vec::new(),
        }
    }

    /// Source over an already opened port
    pub fn with_port(port: Box<dyn SerialLineIO>) -> Self {
        Self {
            paths: Vec::new(),
            baud_rate: 0,
            port: Some(port),
            buf: Vec::new(),
        }
    }
}

#[async_trait]
impl PositionSource for NmeaSource {
    async fn connect(&mut self) -> Result<()> {
        if self.port.is_some() {
            return Ok(());
        }
        let serial = GpsSerial::open_with_paths(&self.paths, self.baud_rate)?;
        self.port = Some(Box::new(serial.into_port()));
        self.buf.clear();
        Ok(())
    }

    async fn next_report(&mut self, wait: Duration) -> Result<Option<PositionReport>> {
        let port = self
            .port
            .as_mut()
            .ok_or_else(|| RecorderError::PositionSourceLost("serial port not open".to_string()))?;

        match timeout(wait, port.read_line(&mut self.buf)).await {
            Err(_) => Ok(None),
            Ok(Ok(0)) => {
                self.port = None;
                self.buf.clear();
                Err(RecorderError::PositionSourceLost("GPS serial port closed".to_string()))
            }
            Ok(Ok(_)) => {
                let report = decode_line_bytes(&self.buf, |line| decode_nmea_sentence(line, Utc::now()));
                self.buf.clear();
                Ok(Some(report))
            }
            Ok(Err(e)) if is_transient(e.kind()) => {
                debug!("Transient serial read error: {}", e);
                Ok(None)
            }
            Ok(Err(e)) => {
                self.port = None;
                self.buf.clear();
                Err(RecorderError::Io(e))
            }
        }
    }

    fn describe(&self) -> String {
        if self.paths.is_empty() {
            "NMEA serial receiver".to_string()
        } else {
            format!("NMEA receiver on {}", self.paths.join(" | "))
        }
    }
}

/// Decode one NMEA sentence
pub fn decode_nmea_sentence(line: &str, now: DateTime<Utc>) -> PositionReport {
    let line = line.trim();
    if line.is_empty() {
        return PositionReport::Ignored;
    }

    let body = match line.strip_prefix('$') {
        Some(body) => body,
        None => return PositionReport::Invalid(format!("missing '$': {:?}", line)),
    };

    let body = match body.split_once('*') {
        Some((data, checksum)) => {
            match u8::from_str_radix(checksum.trim(), 16) {
                Ok(expected) if expected == nmea_checksum(data) => data,
                Ok(_) => return PositionReport::Invalid(format!("checksum mismatch: {:?}", line)),
                Err(_) => return PositionReport::Invalid(format!("bad checksum field: {:?}", line)),
            }
        }
        None => body,
    };

    let fields: Vec<&str> = body.split(',').collect();
    let kind = fields[0];
    if !kind.is_ascii() || kind.len() < 5 {
        return PositionReport::Invalid(format!("short sentence id: {:?}", kind));
    }

    match &kind[kind.len() - 3..] {
        "RMC" => decode_rmc(&fields, now),
        "GGA" => decode_gga(&fields),
        _ => PositionReport::Ignored,
    }
}

/// XOR of every byte between `$` and `*`
pub fn nmea_checksum(data: &str) -> u8 {
    data.bytes().fold(0, |acc, b| acc ^ b)
}

fn decode_rmc(fields: &[&str], now: DateTime<Utc>) -> PositionReport {
    if fields.len() < 9 {
        return PositionReport::Invalid(format!("RMC has {} fields", fields.len()));
    }
    if fields[2] != "A" {
        return PositionReport::NoPosition;
    }
    if fields[3].is_empty() || fields[5].is_empty() {
        return PositionReport::NoPosition;
    }

    let latitude = match parse_coordinate(fields[3], fields[4], 2) {
        Some(lat) => lat,
        None => return PositionReport::Invalid(format!("bad latitude {:?}", fields[3])),
    };
    let longitude = match parse_coordinate(fields[5], fields[6], 3) {
        Some(lon) => lon,
        None => return PositionReport::Invalid(format!("bad longitude {:?}", fields[5])),
    };
    if !coordinates_valid(Some(latitude), Some(longitude)) {
        return PositionReport::NoPosition;
    }

    let speed_mph = fields[7].parse::<f64>().ok().map(|knots| knots * KNOTS_TO_MPH);
    let heading = fields[8].parse::<f64>().ok();

    PositionReport::Position(Fix::new(Some(latitude), Some(longitude), speed_mph, heading, true, None, now))
}

fn decode_gga(fields: &[&str]) -> PositionReport {
    if fields.len() < 9 {
        return PositionReport::Invalid(format!("GGA has {} fields", fields.len()));
    }
    PositionReport::Satellites {
        used: fields[7].parse::<u32>().ok(),
        hdop: fields[8].parse::<f64>().ok(),
    }
}

/// `ddmm.mmmm` / `dddmm.mmmm` plus hemisphere into signed decimal degrees
fn parse_coordinate(raw: &str, hemisphere: &str, degree_digits: usize) -> Option<f64> {
    if raw.len() <= degree_digits || !raw.is_ascii() {
        return None;
    }
    let degrees: f64 = raw[..degree_digits].parse().ok()?;
    let minutes: f64 = raw[degree_digits..].parse().ok()?;
    if !(0.0..60.0).contains(&minutes) {
        return None;
    }
    let value = degrees + minutes / 60.0;
    match hemisphere {
        "N" | "E" => Some(value),
        "S" | "W" => Some(-value),
        _ => None,
    }
}
