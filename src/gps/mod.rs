//! # Positioning Module
//!
//! Continuous position-fix reader that never blocks the sample loop.
//!
//! This module handles:
//! - Talking to the positioning source on its own tokio task
//! - Decoding raw reports (gpsd JSON or NMEA sentences) into [`Fix`]
//! - Publishing the latest valid fix plus rolling read statistics
//! - Reconnecting forever when the source goes away
//!
//! ## Locking
//!
//! The latest fix, the short history and the statistics live in one
//! `parking_lot::Mutex`. It is only ever held to copy a value in or out and
//! never across an `.await`, so the sample loop waits at most for one
//! critical section.

pub mod gpsd;
pub mod nmea;

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration, Instant};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::shutdown::Shutdown;
use crate::types::Fix;

/// One decoded report from the positioning source
#[derive(Debug, Clone, PartialEq)]
pub enum PositionReport {
    /// Report with a usable coordinate pair
    Position(Fix),
    /// Position report without usable coordinates (no lock yet)
    NoPosition,
    /// Satellite constellation summary
    Satellites { used: Option<u32>, hdop: Option<f64> },
    /// Message class the reader does not care about
    Ignored,
    /// Report that could not be decoded
    Invalid(String),
}

/// A stream of position reports.
///
/// `next_report` must give up after `timeout` and return `Ok(None)` so the
/// reader can check for shutdown. An `Err` means the connection is gone;
/// the reader will call `connect` again after a pause.
#[async_trait]
pub trait PositionSource: Send {
    async fn connect(&mut self) -> Result<()>;

    async fn next_report(&mut self, timeout: Duration) -> Result<Option<PositionReport>>;

    fn describe(&self) -> String;
}

#[async_trait]
impl PositionSource for Box<dyn PositionSource> {
    async fn connect(&mut self) -> Result<()> {
        (**self).connect().await
    }

    async fn next_report(&mut self, timeout: Duration) -> Result<Option<PositionReport>> {
        (**self).next_report(timeout).await
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}

/// Read quality statistics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReaderStats {
    /// Position-bearing reports received (valid or not)
    pub total_reads: u64,
    /// Reports that published a new fix
    pub successful_reads: u64,
    /// `successful_reads / total_reads` in percent
    pub success_rate: f64,
    pub last_fix_time: Option<DateTime<Utc>>,
    pub satellites_used: u32,
}

/// Timing knobs for the reader loop
#[derive(Debug, Clone, Copy)]
pub struct ReaderSettings {
    pub read_timeout: Duration,
    pub reconnect_interval: Duration,
}

impl Default for ReaderSettings {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_millis(500),
            reconnect_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Default)]
struct ReaderState {
    latest: Option<Fix>,
    history: VecDeque<Fix>,
    total_reads: u64,
    successful_reads: u64,
    last_fix_time: Option<DateTime<Utc>>,
    satellites_used: u32,
    last_hdop: Option<f64>,
}

/// Handle to the shared latest-fix cell.
///
/// Cheap to clone; every clone sees the same state. Only the task started by
/// [`spawn`](PositionReader::spawn) writes to it.
#[derive(Clone, Debug)]
pub struct PositionReader {
    state: Arc<Mutex<ReaderState>>,
    history_len: usize,
}

impl PositionReader {
    pub fn new(history_len: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(ReaderState::default())),
            history_len: history_len.max(1),
        }
    }

    /// Latest published fix, or `None` before the first valid report
    pub fn latest(&self) -> Option<Fix> {
        self.state.lock().latest.clone()
    }

    pub fn stats(&self) -> ReaderStats {
        let state = self.state.lock();
        let success_rate = if state.total_reads > 0 {
            state.successful_reads as f64 / state.total_reads as f64 * 100.0
        } else {
            0.0
        };
        ReaderStats {
            total_reads: state.total_reads,
            successful_reads: state.successful_reads,
            success_rate,
            last_fix_time: state.last_fix_time,
            satellites_used: state.satellites_used,
        }
    }

    /// The most recent fixes, oldest first
    pub fn history(&self) -> Vec<Fix> {
        self.state.lock().history.iter().cloned().collect()
    }

    /// Fold one decoded report into the shared state
    pub fn apply(&self, report: PositionReport) {
        match report {
            PositionReport::Position(mut fix) => {
                let mut state = self.state.lock();
                state.total_reads += 1;
                if !fix.has_position() {
                    return;
                }
                if fix.hdop.is_none() {
                    fix.hdop = state.last_hdop;
                }
                state.successful_reads += 1;
                if fix.has_fix {
                    state.last_fix_time = Some(fix.captured_at);
                }
                if state.history.len() == self.history_len {
                    state.history.pop_front();
                }
                state.history.push_back(fix.clone());
                state.latest = Some(fix);
            }
            PositionReport::NoPosition => {
                self.state.lock().total_reads += 1;
                debug!("Position report without a usable position");
            }
            PositionReport::Invalid(reason) => {
                self.state.lock().total_reads += 1;
                debug!("Undecodable position report: {}", reason);
            }
            PositionReport::Satellites { used, hdop } => {
                let mut state = self.state.lock();
                if let Some(used) = used {
                    state.satellites_used = used;
                }
                if hdop.is_some() {
                    state.last_hdop = hdop;
                }
            }
            PositionReport::Ignored => {}
        }
    }

    /// Start the reader loop on its own task
    pub fn spawn<S>(&self, source: S, settings: ReaderSettings, shutdown: Shutdown) -> JoinHandle<()>
    where
        S: PositionSource + 'static,
    {
        let reader = self.clone();
        tokio::spawn(async move { reader.run(source, settings, shutdown).await })
    }

    /// Read reports until shutdown, reconnecting whenever the source drops
    pub async fn run<S: PositionSource>(&self, mut source: S, settings: ReaderSettings, mut shutdown: Shutdown) {
        info!("GPS reader started ({})", source.describe());

        let mut connected = false;
        let mut failed_connects: u32 = 0;
        let mut lost_connections: u32 = 0;

        while !shutdown.is_triggered() {
            if !connected {
                match source.connect().await {
                    Ok(()) => {
                        info!("Connected to {}", source.describe());
                        connected = true;
                        failed_connects = 0;
                    }
                    Err(e) => {
                        if failed_connects == 0 {
                            warn!("Cannot reach {}: {} (retrying every {:?})", source.describe(), e, settings.reconnect_interval);
                        } else {
                            debug!("Reconnect attempt {} failed: {}", failed_connects + 1, e);
                        }
                        failed_connects = failed_connects.saturating_add(1);
                        pause(settings.reconnect_interval, &mut shutdown).await;
                        continue;
                    }
                }
            }

            match source.next_report(settings.read_timeout).await {
                Ok(Some(report)) => {
                    lost_connections = 0;
                    self.apply(report);
                }
                Ok(None) => {}
                Err(e) => {
                    if lost_connections == 0 {
                        warn!("GPS connection lost: {}", e);
                    } else {
                        debug!("GPS connection lost again ({} in a row): {}", lost_connections + 1, e);
                    }
                    lost_connections = lost_connections.saturating_add(1);
                    connected = false;
                    pause(settings.reconnect_interval, &mut shutdown).await;
                }
            }
        }

        info!("GPS reader stopped");
    }

    /// Wait until a first fix is available, `timeout` passes, or shutdown.
    pub async fn wait_for_fix(&self, timeout: Duration, shutdown: &mut Shutdown) -> Option<Fix> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(fix) = self.latest() {
                return Some(fix);
            }
            let now = Instant::now();
            if now >= deadline || shutdown.is_triggered() {
                return None;
            }
            let step = (deadline - now).min(Duration::from_millis(250));
            tokio::select! {
                _ = sleep(step) => {}
                _ = shutdown.wait() => return None,
            }
        }
    }
}

/// Decode one raw line, treating bytes that are not UTF-8 as a bad report
/// rather than a broken link.
pub(crate) fn decode_line_bytes(raw: &[u8], decode: impl FnOnce(&str) -> PositionReport) -> PositionReport {
    match std::str::from_utf8(raw) {
        Ok(line) => decode(line),
        Err(e) => PositionReport::Invalid(format!("non-UTF-8 bytes in report: {}", e)),
    }
}

/// Read errors that leave the link usable
pub(crate) fn is_transient(kind: io::ErrorKind) -> bool {
    matches!(kind, io::ErrorKind::TimedOut | io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock)
}

async fn pause(duration: Duration, shutdown: &mut Shutdown) {
    tokio::select! {
        _ = sleep(duration) => {}
        _ = shutdown.wait() => {}
    }
}
