//! # Storage Module
//!
//! Persistence of ride sessions and telemetry records.
//!
//! The [`TelemetryStore`] trait is the seam between the recording engine and
//! the relational store; [`sqlite::SqliteStore`] is the production backend.

pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::types::{RideSession, TelemetryRecord};

pub use sqlite::SqliteStore;

/// Relational store for rides and telemetry
#[async_trait]
pub trait TelemetryStore: Send + Sync {
    /// Create tables and indexes if they do not exist, and seed the status row
    async fn init_schema(&self) -> Result<()>;

    async fn session_exists(&self, session_id: &str) -> Result<bool>;

    /// Id of the most recently inserted session, which is also the greatest
    async fn latest_session_id(&self) -> Result<Option<String>>;

    /// Insert an open session row (no end time) and mark it as the current ride
    async fn insert_session(&self, session_id: &str, start_time: DateTime<Utc>) -> Result<()>;

    /// Stamp the end time, persist the summary computed from stored records
    /// and clear the current ride
    async fn close_session(&self, session_id: &str, end_time: DateTime<Utc>) -> Result<RideSession>;

    async fn append_record(&self, record: &TelemetryRecord) -> Result<()>;

    /// Sessions with no end time, oldest first
    async fn open_sessions(&self) -> Result<Vec<RideSession>>;
}
