//! # Sample Loop
//!
//! The fixed-rate root loop. Each tick it:
//!
//! 1. pulls a motion sample if the driver has one ready
//! 2. snapshots the latest position fix
//! 3. feeds the power reading through the engine state machine
//! 4. closes the ride on a falling edge, and opens one whenever the engine
//!    is on without a ride (so a failed open is retried next tick)
//! 5. writes one fused record while a ride is open
//!
//! and then sleeps until the next slot of a fixed schedule, so a slow tick
//! does not shift every later tick.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::time::{sleep_until, Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::engine::EngineStateMachine;
use crate::gps::PositionReader;
use crate::motion::MotionSensor;
use crate::power::{PowerMonitor, PowerProbe};
use crate::session::SessionManager;
use crate::shutdown::Shutdown;
use crate::storage::TelemetryStore;
use crate::types::{EngineState, TelemetryRecord};

/// Engine transition seen during one tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineEdge {
    Started,
    Stopped,
}

/// What one tick did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub engine: EngineState,
    pub edge: Option<EngineEdge>,
    pub record_written: bool,
}

/// Running counters, reported in the periodic status line
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopCounters {
    pub ticks: u64,
    pub motion_samples: u64,
    pub records_written: u64,
    pub write_failures: u64,
    pub overruns: u64,
}

/// Fixed-rate fusion loop
pub struct SampleLoop<M: MotionSensor, P: PowerProbe> {
    motion: M,
    reader: PositionReader,
    power: PowerMonitor<P>,
    engine: EngineStateMachine,
    sessions: SessionManager,
    store: Arc<dyn TelemetryStore>,
    period: Duration,
    status_every: u64,
    counters: LoopCounters,
    failed_opens: u32,
}

impl<M: MotionSensor, P: PowerProbe> SampleLoop<M, P> {
    /// Build the loop.
    ///
    /// # Arguments
    ///
    /// * `period` - Tick interval (1 / sampling rate)
    /// * `status_every` - Ticks between status log lines; 0 disables them
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        motion: M,
        reader: PositionReader,
        power: PowerMonitor<P>,
        engine: EngineStateMachine,
        store: Arc<dyn TelemetryStore>,
        period: Duration,
        status_every: u64,
    ) -> Self {
        Self {
            motion,
            reader,
            power,
            engine,
            sessions: SessionManager::new(store.clone()),
            store,
            period,
            status_every,
            counters: LoopCounters::default(),
            failed_opens: 0,
        }
    }

    pub fn counters(&self) -> LoopCounters {
        self.counters
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn engine_state(&self) -> EngineState {
        self.engine.state()
    }

    /// Run one tick at monotonic instant `now` and wall-clock time `wall`
    pub async fn tick(&mut self, now: Instant, wall: DateTime<Utc>) -> TickReport {
        self.counters.ticks += 1;

        let motion = self.motion.read_motion();
        if motion.is_some() {
            self.counters.motion_samples += 1;
        }
        let fix = self.reader.latest();

        let before = self.engine.state();
        let powered = self.power.external_power_at(now);
        let engine = self.engine.update(powered, now);

        let edge = match (before, engine) {
            (EngineState::Off, EngineState::On) => Some(EngineEdge::Started),
            (EngineState::On, EngineState::Off) => Some(EngineEdge::Stopped),
            _ => None,
        };

        match edge {
            Some(EngineEdge::Started) => info!("Engine started"),
            Some(EngineEdge::Stopped) => {
                info!("Engine stopped (no external power for {:?})", self.engine.cooldown());
                if let Err(e) = self.sessions.on_engine_stopped(wall).await {
                    warn!("Ride left open in storage: {}", e);
                }
            }
            None => {}
        }

        if engine.is_on() && self.sessions.current_session_id().is_none() {
            self.open_ride(wall).await;
        }

        let mut record_written = false;
        if let Some(session_id) = self.sessions.current_session_id() {
            let satellites_used = fix.as_ref().map(|_| self.reader.stats().satellites_used);
            let record = TelemetryRecord {
                session_id: session_id.to_string(),
                timestamp: wall,
                motion,
                on_external_power: powered,
                fix,
                satellites_used,
            };
            match self.store.append_record(&record).await {
                Ok(()) => {
                    self.counters.records_written += 1;
                    record_written = true;
                }
                Err(e) => {
                    self.counters.write_failures += 1;
                    error!("Failed to write telemetry record: {}", e);
                }
            }
        }

        TickReport {
            engine,
            edge,
            record_written,
        }
    }

    async fn open_ride(&mut self, wall: DateTime<Utc>) {
        match self.sessions.on_engine_started(wall, &self.reader.stats()).await {
            Ok(()) => {
                if self.failed_opens > 0 {
                    info!("Ride opened after {} failed attempts", self.failed_opens);
                }
                self.failed_opens = 0;
            }
            Err(e) => {
                if self.failed_opens == 0 {
                    error!("Failed to open ride, retrying every tick while the engine runs: {}", e);
                } else {
                    debug!("Ride open attempt {} failed: {}", self.failed_opens + 1, e);
                }
                self.failed_opens = self.failed_opens.saturating_add(1);
            }
        }
    }

    /// Tick until shutdown, then close any open ride.
    pub async fn run(&mut self, mut shutdown: Shutdown) -> LoopCounters {
        info!(
            "Sampling at {:.1}Hz, engine cooldown {:?}",
            1.0 / self.period.as_secs_f64(),
            self.engine.cooldown()
        );

        let mut next = Instant::now();
        while !shutdown.is_triggered() {
            let now = Instant::now();
            self.tick(now, Utc::now()).await;

            if self.status_every > 0 && self.counters.ticks % self.status_every == 0 {
                self.log_status(Instant::now());
            }

            next += self.period;
            let after = Instant::now();
            if next < after {
                self.counters.overruns += 1;
                debug!("Tick overran its slot by {:?}", after - next);
                next = after;
            }

            tokio::select! {
                _ = sleep_until(next) => {}
                _ = shutdown.wait() => break,
            }
        }

        self.finish(Utc::now()).await;
        info!(
            "Sample loop stopped after {} ticks ({} records written, {} write failures)",
            self.counters.ticks, self.counters.records_written, self.counters.write_failures
        );
        self.counters
    }

    /// Close the open ride the same way a falling engine edge would
    pub async fn finish(&mut self, wall: DateTime<Utc>) {
        if let Some(session_id) = self.sessions.current_session_id() {
            info!("Closing ride {} on shutdown", session_id);
            if let Err(e) = self.sessions.on_engine_stopped(wall).await {
                warn!("Ride left open after shutdown: {}", e);
            }
        }
    }

    fn log_status(&self, now: Instant) {
        let stats = self.reader.stats();
        let engine = match self.engine.remaining_cooldown(now) {
            Some(left) => format!("{} (stopping in {:.1}s)", self.engine.state(), left.as_secs_f64()),
            None => self.engine.state().to_string(),
        };
        info!(
            "Status: engine {}, {} power edges, ride {}, GPS {} ({:.0}% reads ok, {} sats, {} recent fixes), {} records written, {} write failures",
            engine,
            self.power.edge_count(),
            self.sessions.current_session_id().unwrap_or("none"),
            if self.reader.latest().map_or(false, |f| f.has_fix) { "fix" } else { "no fix" },
            stats.success_rate,
            stats.satellites_used,
            self.reader.history().len(),
            self.counters.records_written,
            self.counters.write_failures
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gps::PositionReport;
    use crate::motion::mocks::{sample, MockMotionSensor};
    use crate::power::MockPowerProbe;
    use crate::storage::mocks::MemoryStore;
    use crate::types::Fix;
    use chrono::TimeZone;
    use std::collections::VecDeque;

    const TICK: Duration = Duration::from_millis(200);

    fn scripted_power(readings: Vec<bool>) -> MockPowerProbe {
        let mut queue: VecDeque<bool> = readings.into();
        let mut probe = MockPowerProbe::new();
        probe.expect_probe().returning(move || Ok(queue.pop_front().unwrap_or(false)));
        probe
    }

    fn wall(n: u32) -> DateTime<Utc> {
        Utc.timestamp_opt(1_717_243_200, 0).unwrap() + chrono::Duration::milliseconds(200 * n as i64)
    }

    fn sample_loop(
        motion: MockMotionSensor,
        power: MockPowerProbe,
        store: &MemoryStore,
        reader: &PositionReader,
    ) -> SampleLoop<MockMotionSensor, MockPowerProbe> {
        SampleLoop::new(
            motion,
            reader.clone(),
            PowerMonitor::new(power, Duration::ZERO),
            EngineStateMachine::new(TICK * 5),
            Arc::new(store.clone()),
            TICK,
            0,
        )
    }

    #[tokio::test]
    async fn test_cooldown_scenario_opens_and_closes_one_ride() {
        let store = MemoryStore::new();
        let reader = PositionReader::new(10);
        let readings: Vec<bool> = [true; 3].into_iter().chain([false; 10]).collect();
        let mut sampler = sample_loop(MockMotionSensor::silent(), scripted_power(readings), &store, &reader);

        let base = Instant::now();
        let mut reports = Vec::new();
        for n in 1..=13u32 {
            reports.push(sampler.tick(base + TICK * n, wall(n)).await);
        }

        assert_eq!(reports[0].edge, Some(EngineEdge::Started));
        assert!(reports[..7].iter().all(|r| r.engine == EngineState::On));
        assert_eq!(reports[7].edge, Some(EngineEdge::Stopped));
        assert!(reports[7..].iter().all(|r| r.engine == EngineState::Off));

        // Records on ticks 1-7, none once the ride is closed
        assert_eq!(store.records().len(), 7);
        let rides = store.rides();
        assert_eq!(rides.len(), 1);
        assert_eq!(rides[0].end_time, Some(wall(8)));
        assert_eq!(rides[0].point_count, Some(7));
    }

    #[tokio::test]
    async fn test_no_records_without_session() {
        let store = MemoryStore::new();
        let reader = PositionReader::new(10);
        let motion = MockMotionSensor::new((0..20).map(|i| Some(sample(i as f64))).collect());
        let mut sampler = sample_loop(motion, scripted_power(vec![false; 20]), &store, &reader);

        let base = Instant::now();
        for n in 1..=20u32 {
            let report = sampler.tick(base + TICK * n, wall(n)).await;
            assert!(!report.record_written);
        }
        assert!(store.records().is_empty());
        assert!(store.rides().is_empty());
        assert_eq!(sampler.counters().motion_samples, 20);
    }

    #[tokio::test]
    async fn test_sensorless_ticks_still_write_records() {
        let store = MemoryStore::new();
        let reader = PositionReader::new(10);
        let mut sampler = sample_loop(MockMotionSensor::silent(), scripted_power(vec![true; 100]), &store, &reader);

        let base = Instant::now();
        for n in 1..=100u32 {
            sampler.tick(base + TICK * n, wall(n)).await;
        }

        let records = store.records();
        assert_eq!(records.len(), 100);
        assert!(records
            .iter()
            .all(|r| r.motion.is_none() && r.fix.is_none() && r.satellites_used.is_none() && !r.gps_fix()));
        let session_id = sampler.sessions().current_session_id().unwrap().to_string();
        assert!(records.iter().all(|r| r.session_id == session_id));
    }

    #[tokio::test]
    async fn test_record_fuses_motion_and_fix() {
        let store = MemoryStore::new();
        let reader = PositionReader::new(10);
        reader.apply(PositionReport::Position(Fix::new(
            Some(42.81),
            Some(-70.87),
            Some(31.0),
            Some(90.0),
            true,
            Some(0.8),
            wall(0),
        )));
        let motion = MockMotionSensor::new(vec![Some(sample(3.0))]);
        let mut sampler = sample_loop(motion, scripted_power(vec![true]), &store, &reader);

        let report = sampler.tick(Instant::now(), wall(1)).await;
        assert!(report.record_written);

        let record = &store.records()[0];
        assert_eq!(record.motion, Some(sample(3.0)));
        assert!(record.on_external_power);
        assert!(record.gps_fix());
        assert_eq!(record.speed_mph(), Some(31.0));
    }

    #[tokio::test]
    async fn test_write_failures_do_not_stop_the_loop() {
        let store = MemoryStore::new();
        let reader = PositionReader::new(10);
        let mut sampler = sample_loop(MockMotionSensor::silent(), scripted_power(vec![true; 6]), &store, &reader);
        let base = Instant::now();

        sampler.tick(base + TICK, wall(1)).await;
        store.set_fail_appends(true);
        for n in 2..=4u32 {
            let report = sampler.tick(base + TICK * n, wall(n)).await;
            assert!(!report.record_written);
        }
        store.set_fail_appends(false);
        for n in 5..=6u32 {
            assert!(sampler.tick(base + TICK * n, wall(n)).await.record_written);
        }

        let counters = sampler.counters();
        assert_eq!(counters.ticks, 6);
        assert_eq!(counters.records_written, 3);
        assert_eq!(counters.write_failures, 3);
    }

    #[tokio::test]
    async fn test_failed_open_retried_while_engine_on() {
        let store = MemoryStore::new();
        let reader = PositionReader::new(10);
        let mut sampler = sample_loop(MockMotionSensor::silent(), scripted_power(vec![true; 5]), &store, &reader);
        let base = Instant::now();

        store.set_fail_inserts(true);
        let first = sampler.tick(base + TICK, wall(1)).await;
        assert_eq!(first.edge, Some(EngineEdge::Started));
        assert!(!first.record_written);
        assert!(store.rides().is_empty());

        store.set_fail_inserts(false);
        let second = sampler.tick(base + TICK * 2, wall(2)).await;
        assert_eq!(second.edge, None);
        assert_eq!(second.engine, EngineState::On);
        assert!(second.record_written);

        for n in 3..=5u32 {
            assert!(sampler.tick(base + TICK * n, wall(n)).await.record_written);
        }
        let rides = store.rides();
        assert_eq!(rides.len(), 1);
        assert_eq!(rides[0].start_time, wall(2));
        assert_eq!(store.records().len(), 4);
    }

    #[tokio::test]
    async fn test_no_open_attempts_while_engine_off() {
        let store = MemoryStore::new();
        let reader = PositionReader::new(10);
        let readings: Vec<bool> = [true; 2].into_iter().chain([false; 8]).collect();
        let mut sampler = sample_loop(MockMotionSensor::silent(), scripted_power(readings), &store, &reader);
        let base = Instant::now();

        store.set_fail_inserts(true);
        for n in 1..=10u32 {
            sampler.tick(base + TICK * n, wall(n)).await;
        }
        assert_eq!(sampler.engine_state(), EngineState::Off);

        // Storage recovers after the engine went off: no ride appears
        store.set_fail_inserts(false);
        sampler.tick(base + TICK * 11, wall(11)).await;
        assert!(store.rides().is_empty());
        assert!(store.records().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_closes_open_ride() {
        let store = MemoryStore::new();
        let reader = PositionReader::new(10);
        let mut sampler = sample_loop(MockMotionSensor::silent(), scripted_power(vec![true; 1000]), &store, &reader);

        let shutdown = Shutdown::new();
        let trigger = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            trigger.trigger();
        });

        let counters = sampler.run(shutdown).await;

        assert!(counters.ticks >= 10);
        let rides = store.rides();
        assert_eq!(rides.len(), 1);
        assert!(rides.iter().all(|r| r.end_time.is_some()));
        assert_eq!(rides[0].point_count, Some(counters.records_written as i64));
        assert_eq!(sampler.sessions().current_session_id(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_with_status_lines() {
        let store = MemoryStore::new();
        let reader = PositionReader::new(10);
        let readings: Vec<bool> = [true; 3].into_iter().chain([false; 20]).collect();
        let mut sampler = SampleLoop::new(
            MockMotionSensor::silent(),
            reader.clone(),
            PowerMonitor::new(scripted_power(readings), Duration::ZERO),
            EngineStateMachine::new(TICK * 5),
            Arc::new(store.clone()),
            TICK,
            1,
        );

        let shutdown = Shutdown::new();
        let trigger = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(TICK * 12).await;
            trigger.trigger();
        });

        let counters = sampler.run(shutdown).await;
        assert!(counters.ticks >= 10);
        assert_eq!(store.rides().len(), 1);
        assert!(!store.rides()[0].is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_exits_immediately_when_already_shut_down() {
        let store = MemoryStore::new();
        let reader = PositionReader::new(10);
        let mut sampler = sample_loop(MockMotionSensor::silent(), scripted_power(vec![]), &store, &reader);

        let shutdown = Shutdown::new();
        shutdown.trigger();
        let counters = sampler.run(shutdown).await;
        assert_eq!(counters.ticks, 0);
        assert!(store.rides().is_empty());
    }
}
