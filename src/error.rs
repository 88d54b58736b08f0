//! # Error Types
//!
//! Custom error types for the ride recorder using `thiserror`.

use thiserror::Error;

/// Main error type for the ride recorder
#[derive(Debug, Error)]
pub enum RecorderError {
    /// Configuration file could not be parsed
    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    /// Configuration parsed but a value is out of range
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Persistence store errors
    #[error("Storage error: {0}")]
    Storage(#[from] sqlx::Error),

    /// Motion sensor could not be opened or read
    #[error("Motion sensor error: {0}")]
    MotionSensor(String),

    /// Power source probe failed
    #[error("Power probe error: {0}")]
    PowerProbe(String),

    /// No GPS serial device could be opened
    #[error("GPS serial port not found (tried: {0})")]
    SerialPortNotFound(String),

    /// Serial port errors
    #[error("Serial port error: {0}")]
    Serial(String),

    /// Connection to the positioning source dropped
    #[error("Positioning source disconnected: {0}")]
    PositionSourceLost(String),

    /// A ride session id that does not exist in the store
    #[error("Ride session not found: {0}")]
    SessionNotFound(String),
}

/// Result type alias for the ride recorder
pub type Result<T> = std::result::Result<T, RecorderError>;
