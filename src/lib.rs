//! # Ride Recorder Library
//!
//! Unattended telemetry recording for a vehicle-mounted sensor rig.
//!
//! A ride starts when external power appears and ends once it has been gone
//! for a cooldown. While a ride is open, a fixed-rate loop fuses the latest
//! motion sample, position fix and power state into one stored record per
//! tick.

pub mod config;
pub mod engine;
pub mod error;
pub mod gps;
pub mod motion;
pub mod power;
pub mod sampler;
pub mod serial;
pub mod session;
pub mod shutdown;
pub mod storage;
pub mod types;
