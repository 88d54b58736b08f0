//! # Shared Types
//!
//! Plain data shared between the readers, the sample loop and the store.
//! Every payload is decoded into one of these at the boundary, so nothing
//! downstream deals with loosely shaped sensor data.

use chrono::{DateTime, Utc};

/// Conversion factor from metres per second to miles per hour
pub const MPS_TO_MPH: f64 = 2.236_94;

/// Conversion factor from knots to miles per hour
pub const KNOTS_TO_MPH: f64 = 1.150_78;

/// One raw reading from the 9-axis motion sensor.
///
/// Values are in sensor-native units; calibration happens downstream.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotionSample {
    pub ax: f64,
    pub ay: f64,
    pub az: f64,
    pub gx: f64,
    pub gy: f64,
    pub gz: f64,
    pub mx: f64,
    pub my: f64,
    pub mz: f64,
    pub temperature: Option<f64>,
}

impl MotionSample {
    /// Sum of absolute acceleration on all three axes, in sensor units
    pub fn vibration_level(&self) -> f64 {
        self.ax.abs() + self.ay.abs() + self.az.abs()
    }
}

/// A decoded position report.
///
/// Construct through [`Fix::new`], which enforces that `has_fix` is never
/// set for a missing or zeroed coordinate pair.
#[derive(Debug, Clone, PartialEq)]
pub struct Fix {
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    /// Ground speed in miles per hour
    pub speed_mph: Option<f64>,
    /// Course over ground in degrees
    pub heading: Option<f64>,
    pub has_fix: bool,
    pub hdop: Option<f64>,
    pub captured_at: DateTime<Utc>,
}

impl Fix {
    /// Build a fix from decoded fields.
    ///
    /// `quality_ok` is the receiver's own verdict (e.g. gpsd `mode >= 2` or
    /// NMEA status `A`). The resulting `has_fix` additionally requires both
    /// coordinates to be usable.
    ///
    /// # Examples
    ///
    /// ```
    /// use chrono::Utc;
    /// use ride_recorder::types::Fix;
    ///
    /// let fix = Fix::new(Some(42.81), Some(-70.87), None, None, true, None, Utc::now());
    /// assert!(fix.has_fix);
    ///
    /// let zeroed = Fix::new(Some(0.0), Some(0.0), None, None, true, None, Utc::now());
    /// assert!(!zeroed.has_fix);
    /// ```
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        latitude: Option<f64>,
        longitude: Option<f64>,
        speed_mph: Option<f64>,
        heading: Option<f64>,
        quality_ok: bool,
        hdop: Option<f64>,
        captured_at: DateTime<Utc>,
    ) -> Self {
        let has_fix = quality_ok && coordinates_valid(latitude, longitude);
        Self {
            latitude,
            longitude,
            speed_mph,
            heading,
            has_fix,
            hdop,
            captured_at,
        }
    }

    /// True if the fix carries a usable coordinate pair
    pub fn has_position(&self) -> bool {
        coordinates_valid(self.latitude, self.longitude)
    }
}

/// Both coordinates present, finite, in range and non-zero.
///
/// Receivers without lock commonly report `0.0`, so an exact zero on either
/// axis is treated as "no position".
pub fn coordinates_valid(latitude: Option<f64>, longitude: Option<f64>) -> bool {
    match (latitude, longitude) {
        (Some(lat), Some(lon)) => {
            lat.is_finite()
                && lon.is_finite()
                && lat != 0.0
                && lon != 0.0
                && (-90.0..=90.0).contains(&lat)
                && (-180.0..=180.0).contains(&lon)
        }
        _ => false,
    }
}

/// Cached answer of the power probe
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PowerState {
    pub external: bool,
    pub last_checked: Option<tokio::time::Instant>,
}

/// Whether the engine is considered running
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EngineState {
    #[default]
    Off,
    On,
}

impl EngineState {
    pub fn is_on(self) -> bool {
        self == EngineState::On
    }
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineState::Off => write!(f, "off"),
            EngineState::On => write!(f, "on"),
        }
    }
}

/// A ride session row.
#[derive(Debug, Clone, PartialEq)]
pub struct RideSession {
    pub session_id: String,
    pub start_time: DateTime<Utc>,
    /// `None` while the ride is open, or after a crash
    pub end_time: Option<DateTime<Utc>>,
    pub max_speed: Option<f64>,
    pub point_count: Option<i64>,
}

impl RideSession {
    pub fn open(session_id: String, start_time: DateTime<Utc>) -> Self {
        Self {
            session_id,
            start_time,
            end_time: None,
            max_speed: None,
            point_count: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.end_time.is_none()
    }
}

/// One fused row written per tick while a session is open.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryRecord {
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    pub motion: Option<MotionSample>,
    pub on_external_power: bool,
    pub fix: Option<Fix>,
    pub satellites_used: Option<u32>,
}

impl TelemetryRecord {
    /// `gps_fix` column value: false when no fix snapshot exists
    pub fn gps_fix(&self) -> bool {
        self.fix.as_ref().map_or(false, |f| f.has_fix)
    }

    pub fn speed_mph(&self) -> Option<f64> {
        self.fix.as_ref().and_then(|f| f.speed_mph)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vibration_level_sums_absolute_acceleration() {
        let sample = MotionSample {
            ax: 0.25,
            ay: -0.5,
            az: -1.0,
            gx: 10.0,
            gy: 0.0,
            gz: 0.0,
            mx: 0.0,
            my: 0.0,
            mz: 0.0,
            temperature: None,
        };
        assert!((sample.vibration_level() - 1.75).abs() < 1e-12);
    }

    #[test]
    fn test_fix_requires_both_coordinates() {
        let now = Utc::now();
        assert!(!Fix::new(Some(42.8), None, None, None, true, None, now).has_fix);
        assert!(!Fix::new(None, Some(-70.8), None, None, true, None, now).has_fix);
        assert!(Fix::new(Some(42.8), Some(-70.8), None, None, true, None, now).has_fix);
    }

    #[test]
    fn test_zeroed_coordinates_never_a_fix() {
        let now = Utc::now();
        let fix = Fix::new(Some(0.0), Some(0.0), Some(10.0), None, true, Some(1.0), now);
        assert!(!fix.has_fix);
        assert!(!fix.has_position());
    }

    #[test]
    fn test_receiver_quality_is_respected() {
        let fix = Fix::new(Some(42.8), Some(-70.8), None, None, false, None, Utc::now());
        assert!(!fix.has_fix);
        assert!(fix.has_position());
    }

    #[test]
    fn test_out_of_range_coordinates_rejected() {
        assert!(!coordinates_valid(Some(91.0), Some(10.0)));
        assert!(!coordinates_valid(Some(10.0), Some(-181.0)));
        assert!(!coordinates_valid(Some(f64::NAN), Some(10.0)));
    }

    #[test]
    fn test_record_without_fix_reports_no_gps() {
        let record = TelemetryRecord {
            session_id: "20240601_120000".to_string(),
            timestamp: Utc::now(),
            motion: None,
            on_external_power: true,
            fix: None,
            satellites_used: None,
        };
        assert!(!record.gps_fix());
        assert_eq!(record.speed_mph(), None);
    }

    #[test]
    fn test_engine_state_default_is_off() {
        assert_eq!(EngineState::default(), EngineState::Off);
        assert!(EngineState::On.is_on());
        assert_eq!(EngineState::On.to_string(), "on");
    }
}
