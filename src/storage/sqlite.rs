//! SQLite backend.
//!
//! Opens a fresh connection per operation, so a write in flight never holds
//! the database between ticks and other readers (dashboards, exporters) can
//! work against the same file.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection};
use sqlx::{ConnectOptions, Connection, FromRow};
use tokio::time::Duration;
use tracing::debug;

use super::TelemetryStore;
use crate::error::{RecorderError, Result};
use crate::types::{RideSession, TelemetryRecord};

const SCHEMA: [&str; 5] = [
    "CREATE TABLE IF NOT EXISTS rides (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        session_id TEXT UNIQUE NOT NULL,
        start_time TIMESTAMP NOT NULL,
        end_time TIMESTAMP,
        max_speed REAL,
        point_count INTEGER
    )",
    "CREATE TABLE IF NOT EXISTS telemetry (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        session_id TEXT NOT NULL REFERENCES rides (session_id),
        timestamp TIMESTAMP NOT NULL,
        ax REAL, ay REAL, az REAL,
        gx REAL, gy REAL, gz REAL,
        mx REAL, my REAL, mz REAL,
        temperature REAL,
        on_external_power BOOLEAN NOT NULL,
        latitude REAL,
        longitude REAL,
        speed REAL,
        heading REAL,
        gps_fix BOOLEAN NOT NULL,
        satellites_used INTEGER,
        hdop REAL,
        vibration_level REAL
    )",
    "CREATE INDEX IF NOT EXISTS idx_telemetry_session ON telemetry (session_id)",
    "CREATE TABLE IF NOT EXISTS status (
        id INTEGER PRIMARY KEY CHECK (id = 1),
        current_ride_id TEXT,
        tracking_active BOOLEAN NOT NULL DEFAULT 0,
        last_updated TIMESTAMP
    )",
    "INSERT OR IGNORE INTO status (id, tracking_active) VALUES (1, 0)",
];

const RIDE_COLUMNS: &str = "session_id, start_time, end_time, max_speed, point_count";

/// A `rides` row
#[derive(Debug, FromRow)]
struct RideRow {
    session_id: String,
    start_time: DateTime<Utc>,
    end_time: Option<DateTime<Utc>>,
    max_speed: Option<f64>,
    point_count: Option<i64>,
}

impl From<RideRow> for RideSession {
    fn from(row: RideRow) -> Self {
        RideSession {
            session_id: row.session_id,
            start_time: row.start_time,
            end_time: row.end_time,
            max_speed: row.max_speed,
            point_count: row.point_count,
        }
    }
}

/// Telemetry store backed by a SQLite file
#[derive(Debug, Clone)]
pub struct SqliteStore {
    options: SqliteConnectOptions,
    path: PathBuf,
}

impl SqliteStore {
    /// Create a store for the database at `path`.
    ///
    /// Nothing is opened until the first operation; the file is created on
    /// first use if it does not exist.
    pub fn new(path: impl Into<PathBuf>, busy_timeout: Duration) -> Self {
        let path = path.into();
        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(busy_timeout);
        Self { options, path }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    async fn connect(&self) -> Result<SqliteConnection> {
        Ok(self.options.connect().await?)
    }
}

#[async_trait]
impl TelemetryStore for SqliteStore {
    async fn init_schema(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let mut conn = self.connect().await?;
        for statement in SCHEMA {
            sqlx::query(statement).execute(&mut conn).await?;
        }
        conn.close().await?;
        debug!("Schema ready in {}", self.path.display());
        Ok(())
    }

    async fn session_exists(&self, session_id: &str) -> Result<bool> {
        let mut conn = self.connect().await?;
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM rides WHERE session_id = ?")
            .bind(session_id)
            .fetch_one(&mut conn)
            .await?;
        conn.close().await?;
        Ok(count > 0)
    }

    async fn latest_session_id(&self) -> Result<Option<String>> {
        let mut conn = self.connect().await?;
        // Ids are allocated above every stored id, so the newest row holds the greatest
        let latest: Option<(String,)> = sqlx::query_as("SELECT session_id FROM rides ORDER BY id DESC LIMIT 1")
            .fetch_optional(&mut conn)
            .await?;
        conn.close().await?;
        Ok(latest.map(|(session_id,)| session_id))
    }

    async fn insert_session(&self, session_id: &str, start_time: DateTime<Utc>) -> Result<()> {
        let mut conn = self.connect().await?;
        let mut tx = conn.begin().await?;

        sqlx::query("INSERT INTO rides (session_id, start_time) VALUES (?, ?)")
            .bind(session_id)
            .bind(start_time)
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE status SET current_ride_id = ?, tracking_active = 1, last_updated = ? WHERE id = 1")
            .bind(session_id)
            .bind(start_time)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        conn.close().await?;
        Ok(())
    }

    async fn close_session(&self, session_id: &str, end_time: DateTime<Utc>) -> Result<RideSession> {
        let mut conn = self.connect().await?;
        let mut tx = conn.begin().await?;

        let updated = sqlx::query(
            "UPDATE rides SET
                end_time = ?,
                max_speed = (SELECT MAX(speed) FROM telemetry WHERE session_id = ?),
                point_count = (SELECT COUNT(*) FROM telemetry WHERE session_id = ?)
             WHERE session_id = ?",
        )
        .bind(end_time)
        .bind(session_id)
        .bind(session_id)
        .bind(session_id)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(RecorderError::SessionNotFound(session_id.to_string()));
        }

        let row: RideRow = sqlx::query_as(&format!("SELECT {} FROM rides WHERE session_id = ?", RIDE_COLUMNS))
            .bind(session_id)
            .fetch_one(&mut *tx)
            .await?;

        sqlx::query("UPDATE status SET current_ride_id = NULL, tracking_active = 0, last_updated = ? WHERE id = 1")
            .bind(end_time)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        conn.close().await?;
        Ok(row.into())
    }

    async fn append_record(&self, record: &TelemetryRecord) -> Result<()> {
        let motion = record.motion.as_ref();
        let fix = record.fix.as_ref();

        let mut conn = self.connect().await?;
        sqlx::query(
            "INSERT INTO telemetry (
                session_id, timestamp,
                ax, ay, az, gx, gy, gz, mx, my, mz, temperature,
                on_external_power,
                latitude, longitude, speed, heading, gps_fix, satellites_used, hdop,
                vibration_level
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.session_id)
        .bind(record.timestamp)
        .bind(motion.map(|m| m.ax))
        .bind(motion.map(|m| m.ay))
        .bind(motion.map(|m| m.az))
        .bind(motion.map(|m| m.gx))
        .bind(motion.map(|m| m.gy))
        .bind(motion.map(|m| m.gz))
        .bind(motion.map(|m| m.mx))
        .bind(motion.map(|m| m.my))
        .bind(motion.map(|m| m.mz))
        .bind(motion.and_then(|m| m.temperature))
        .bind(record.on_external_power)
        .bind(fix.and_then(|f| f.latitude))
        .bind(fix.and_then(|f| f.longitude))
        .bind(fix.and_then(|f| f.speed_mph))
        .bind(fix.and_then(|f| f.heading))
        .bind(record.gps_fix())
        .bind(record.satellites_used.map(i64::from))
        .bind(fix.and_then(|f| f.hdop))
        .bind(motion.map(|m| m.vibration_level()))
        .execute(&mut conn)
        .await?;
        conn.close().await?;
        Ok(())
    }

    async fn open_sessions(&self) -> Result<Vec<RideSession>> {
        let mut conn = self.connect().await?;
        let rows: Vec<RideRow> = sqlx::query_as(&format!(
            "SELECT {} FROM rides WHERE end_time IS NULL ORDER BY id",
            RIDE_COLUMNS
        ))
        .fetch_all(&mut conn)
        .await?;
        conn.close().await?;
        Ok(rows.into_iter().map(RideSession::from).collect())
    }
}
