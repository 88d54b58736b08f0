//! # Session Module
//!
//! Ride session lifecycle: open a ride when the engine starts, close it with
//! summary statistics when the engine stops.
//!
//! ## Session ids
//!
//! Ids are the UTC start time as `YYYYMMDD_HHMMSS`. A new id is always
//! forced above every id already stored: if the clock went backwards, or two
//! rides start within the same second, the greatest stored id is bumped with
//! a numeric `_NNN` suffix instead. Ids order by [`session_id_key`]
//! (timestamp, then suffix as a number), so `_1000` follows `_999`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use crate::error::Result;
use crate::gps::ReaderStats;
use crate::storage::TelemetryStore;
use crate::types::RideSession;

/// Session id timestamp format
pub const SESSION_ID_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Owns the single open ride, if any
pub struct SessionManager {
    store: Arc<dyn TelemetryStore>,
    current: Option<RideSession>,
}

impl SessionManager {
    pub fn new(store: Arc<dyn TelemetryStore>) -> Self {
        Self { store, current: None }
    }

    pub fn current_session_id(&self) -> Option<&str> {
        self.current.as_ref().map(|s| s.session_id.as_str())
    }

    /// Open a new ride starting at `now`.
    ///
    /// Logs a warning and does nothing if a ride is already open.
    ///
    /// # Errors
    ///
    /// Returns the storage error if the ride row could not be inserted; no
    /// session is open afterwards and the caller decides when to retry.
    pub async fn on_engine_started(&mut self, now: DateTime<Utc>, stats: &ReaderStats) -> Result<()> {
        if let Some(open) = &self.current {
            warn!("Engine start while ride {} is still open, ignoring", open.session_id);
            return Ok(());
        }

        let session_id = self.insert_open_row(now).await?;
        info!(
            "Ride {} started (GPS: {} of {} reads ok, {:.1}%, {} satellites)",
            session_id, stats.successful_reads, stats.total_reads, stats.success_rate, stats.satellites_used
        );
        self.current = Some(RideSession::open(session_id, now));
        Ok(())
    }

    /// Close the open ride at `now`, persisting its summary.
    ///
    /// Returns the closed ride, or `None` if no ride was open.
    ///
    /// # Errors
    ///
    /// Returns the storage error if the close failed. The in-memory session
    /// is released either way; in storage the row stays open with no end
    /// time, exactly like after a crash.
    pub async fn on_engine_stopped(&mut self, now: DateTime<Utc>) -> Result<Option<RideSession>> {
        let Some(open) = self.current.take() else {
            return Ok(None);
        };

        match self.store.close_session(&open.session_id, now).await {
            Ok(closed) => {
                let minutes = (now - open.start_time).num_seconds() as f64 / 60.0;
                info!(
                    "Ride {} ended after {:.1} min: {} points, max speed {}",
                    closed.session_id,
                    minutes,
                    closed.point_count.unwrap_or(0),
                    closed
                        .max_speed
                        .map_or_else(|| "n/a".to_string(), |mph| format!("{:.1} mph", mph))
                );
                Ok(Some(closed))
            }
            Err(e) => {
                error!("Failed to close ride {}: {}", open.session_id, e);
                Err(e)
            }
        }
    }

    /// Rides left open by an earlier crash or power cut, each logged at
    /// warning level
    pub async fn dangling_sessions(&self) -> Result<Vec<RideSession>> {
        let open = self.store.open_sessions().await?;
        for ride in &open {
            warn!(
                "Ride {} (started {}) was never closed; its summary is missing",
                ride.session_id,
                ride.start_time.format("%Y-%m-%d %H:%M:%S")
            );
        }
        Ok(open)
    }

    async fn insert_open_row(&self, now: DateTime<Utc>) -> Result<String> {
        let session_id = self.allocate_session_id(now).await?;
        self.store.insert_session(&session_id, now).await?;
        Ok(session_id)
    }

    async fn allocate_session_id(&self, now: DateTime<Utc>) -> Result<String> {
        let candidate = now.format(SESSION_ID_FORMAT).to_string();
        let latest = self.store.latest_session_id().await?;
        let mut session_id = next_session_id(&candidate, latest.as_deref());
        while self.store.session_exists(&session_id).await? {
            session_id = bump_session_id(&session_id);
        }
        Ok(session_id)
    }
}

/// Ordering key of a session id: the timestamp part, then the numeric
/// suffix (0 when there is none)
pub fn session_id_key(session_id: &str) -> (&str, u64) {
    session_id
        .rsplit_once('_')
        .filter(|(base, suffix)| base.contains('_') && !suffix.is_empty() && suffix.bytes().all(|b| b.is_ascii_digit()))
        .and_then(|(base, suffix)| suffix.parse().ok().map(|n| (base, n)))
        .unwrap_or((session_id, 0))
}

/// Pick an id strictly greater than `latest`, preferring `candidate`
pub fn next_session_id(candidate: &str, latest: Option<&str>) -> String {
    match latest {
        Some(latest) if session_id_key(candidate) <= session_id_key(latest) => bump_session_id(latest),
        _ => candidate.to_string(),
    }
}

/// `20240601_120000` -> `20240601_120000_001` -> ... -> `20240601_120000_999`
/// -> `20240601_120000_1000`
pub fn bump_session_id(session_id: &str) -> String {
    let (base, n) = session_id_key(session_id);
    format!("{}_{:03}", base, n + 1)
}
