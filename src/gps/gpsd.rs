//! # gpsd Client
//!
//! Connects to a local gpsd over TCP, enables JSON watch mode and decodes
//! `TPV` (time-position-velocity) and `SKY` reports.
//!
//! gpsd sometimes ships values as strings, and client libraries use `"n/a"`
//! for absent fields, so every numeric field is accepted either as a JSON
//! number or as a numeric string.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use tracing::debug;

use super::{decode_line_bytes, is_transient, PositionReport, PositionSource};
use crate::error::{RecorderError, Result};
use crate::types::{coordinates_valid, Fix, MPS_TO_MPH};

/// Command asking gpsd to stream JSON reports
const WATCH_COMMAND: &[u8] = b"?WATCH={\"enable\":true,\"json\":true};\n";

/// gpsd `mode` at or above which the receiver has a 2D fix
const GPSD_MODE_2D: i64 = 2;

/// Position source backed by a gpsd socket
pub struct GpsdSource {
    addr: String,
    reader: Option<BufReader<OwnedReadHalf>>,
    // Partial report kept across timed-out reads
    buf: Vec<u8>,
    // Dropping the write half half-closes the socket, which gpsd treats as a hang-up
    writer: Option<OwnedWriteHalf>,
}

impl GpsdSource {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            reader: None,
            buf: Vec::new(),
            writer: None,
        }
    }

    fn disconnect(&mut self) {
        self.reader = None;
        self.writer = None;
        self.buf.clear();
    }
}

#[async_trait]
impl PositionSource for GpsdSource {
    async fn connect(&mut self) -> Result<()> {
        self.disconnect();
        let stream = TcpStream::connect(&self.addr).await?;
        let (read_half, mut write_half) = stream.into_split();
        write_half.write_all(WATCH_COMMAND).await?;
        write_half.flush().await?;
        self.reader = Some(BufReader::new(read_half));
        self.writer = Some(write_half);
        debug!("Sent WATCH command to gpsd at {}", self.addr);
        Ok(())
    }

    async fn next_report(&mut self, wait: Duration) -> Result<Option<PositionReport>> {
        let reader = self
            .reader
            .as_mut()
            .ok_or_else(|| RecorderError::PositionSourceLost("not connected".to_string()))?;

        match timeout(wait, reader.read_until(b'\n', &mut self.buf)).await {
            Err(_) => Ok(None),
            Ok(Ok(0)) => {
                self.disconnect();
                Err(RecorderError::PositionSourceLost(format!("gpsd at {} closed the connection", self.addr)))
            }
            Ok(Ok(_)) => {
                let report = decode_line_bytes(&self.buf, |line| decode_gpsd_line(line, Utc::now()));
                self.buf.clear();
                Ok(Some(report))
            }
            Ok(Err(e)) if is_transient(e.kind()) => {
                debug!("Transient gpsd read error: {}", e);
                Ok(None)
            }
            Ok(Err(e)) => {
                self.disconnect();
                Err(RecorderError::Io(e))
            }
        }
    }

    fn describe(&self) -> String {
        format!("gpsd at {}", self.addr)
    }
}

/// Decode one line of gpsd JSON.
///
/// Objects without a `class` are treated as `TPV`.
pub fn decode_gpsd_line(line: &str, now: DateTime<Utc>) -> PositionReport {
    let line = line.trim();
    if line.is_empty() {
        return PositionReport::Ignored;
    }

    let value: Value = match serde_json::from_str(line) {
        Ok(value) => value,
        Err(e) => return PositionReport::Invalid(format!("bad JSON: {}", e)),
    };

    if !value.is_object() {
        return PositionReport::Invalid("report is not a JSON object".to_string());
    }

    match value.get("class").and_then(Value::as_str) {
        None | Some("TPV") => decode_tpv(&value, now),
        Some("SKY") => decode_sky(&value),
        Some(_) => PositionReport::Ignored,
    }
}

fn decode_tpv(tpv: &Value, now: DateTime<Utc>) -> PositionReport {
    let latitude = number_field(tpv, "lat");
    let longitude = number_field(tpv, "lon");
    if !coordinates_valid(latitude, longitude) {
        return PositionReport::NoPosition;
    }

    let quality_ok = number_field(tpv, "mode").map_or(true, |mode| mode as i64 >= GPSD_MODE_2D);

    PositionReport::Position(Fix::new(
        latitude,
        longitude,
        number_field(tpv, "speed").map(|mps| mps * MPS_TO_MPH),
        number_field(tpv, "track"),
        quality_ok,
        number_field(tpv, "hdop"),
        now,
    ))
}

fn decode_sky(sky: &Value) -> PositionReport {
    let used = number_field(sky, "uSat").map(|n| n as u32).or_else(|| {
        sky.get("satellites").and_then(Value::as_array).map(|sats| {
            sats.iter()
                .filter(|sat| sat.get("used").and_then(Value::as_bool).unwrap_or(false))
                .count() as u32
        })
    });

    PositionReport::Satellites {
        used,
        hdop: number_field(sky, "hdop"),
    }
}

/// Numeric field given as a number or a numeric string; `"n/a"` is absent
fn number_field(obj: &Value, key: &str) -> Option<f64> {
    let n = match obj.get(key)? {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    n.is_finite().then_some(n)
}
