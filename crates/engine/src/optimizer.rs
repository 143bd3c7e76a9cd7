//! Concurrent adaptive random search over strategy settings.
//!
//! A coordinator task owns every piece of mutable state (leaderboard,
//! learned constraints, RNG) and talks to a pool of stateless simulation
//! workers over channels. Each finished simulation immediately triggers
//! the next candidate draw, and the leaderboard is periodically mined to
//! tighten the sampling constraints.

use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::constraints::{ConstraintKey, ConstraintSet};
use crate::features::FeatureSeries;
use crate::leaderboard::{Leaderboard, LeaderboardEntry, SortColumn, SortDirection};
use crate::sampler::{sample_settings, ParameterSpace, SamplerLocks};
use crate::simulator::simulate;
use crate::types::{RatioWeights, SimulationResult, StrategySettings};

// ============================================================================
// Constants
// ============================================================================

pub const DEFAULT_LEADERBOARD_CAPACITY: usize = 10;
pub const DEFAULT_LEARNING_INTERVAL: Duration = Duration::from_secs(120);

const STATUS_TICK: Duration = Duration::from_millis(500);
/// One queued job per worker keeps every worker busy without building a
/// backlog the coordinator cannot retract on pause
const JOB_QUEUE_DEPTH: usize = 1;
const FALLBACK_WORKERS: usize = 4;

// ============================================================================
// Options, state, events
// ============================================================================

/// Everything a search session needs up front
#[derive(Debug, Clone)]
pub struct OptimizerOptions {
    pub space: ParameterSpace,
    pub locks: SamplerLocks,
    pub ratio_weights: RatioWeights,
    pub sort_column: SortColumn,
    pub sort_direction: SortDirection,
    pub capacity: usize,
    /// Worker task count, defaults to available parallelism
    pub workers: Option<usize>,
    pub learning_enabled: bool,
    pub learning_interval: Duration,
    /// Fixed RNG seed; with one worker this makes the candidate stream
    /// reproducible
    pub seed: Option<u64>,
}

impl Default for OptimizerOptions {
    fn default() -> Self {
        Self {
            space: ParameterSpace::default(),
            locks: SamplerLocks::default(),
            ratio_weights: RatioWeights::default(),
            sort_column: SortColumn::RobustnessRatio,
            sort_direction: SortDirection::Desc,
            capacity: DEFAULT_LEADERBOARD_CAPACITY,
            workers: None,
            learning_enabled: true,
            learning_interval: DEFAULT_LEARNING_INTERVAL,
            seed: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerState {
    Idle,
    Running,
    Paused,
}

impl OptimizerState {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Paused => "paused",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct OptimizerStatus {
    pub state: OptimizerState,
    pub tested: u64,
    pub phase: u32,
    pub workers: usize,
    pub leaderboard_len: usize,
}

impl OptimizerStatus {
    fn idle() -> Self {
        Self {
            state: OptimizerState::Idle,
            tested: 0,
            phase: 0,
            workers: 0,
            leaderboard_len: 0,
        }
    }
}

/// Pushed to the event channel as the search progresses
#[derive(Debug, Clone)]
pub enum OptimizerEvent {
    Status(OptimizerStatus),
    /// Emitted on every admission, sort change, clear and stop
    LeaderboardUpdated(Vec<LeaderboardEntry>),
    ConstraintsUpdated(ConstraintSet),
}

// ============================================================================
// Handle
// ============================================================================

enum Command {
    Start {
        series: Arc<FeatureSeries>,
        options: Box<OptimizerOptions>,
    },
    Pause,
    Resume,
    Stop,
    ClearResults,
    SetSort {
        column: SortColumn,
        direction: SortDirection,
    },
    RemoveConstraint(ConstraintKey),
    Snapshot {
        reply: oneshot::Sender<Vec<Arc<SimulationResult>>>,
    },
    Status {
        reply: oneshot::Sender<OptimizerStatus>,
    },
}

/// Cheap cloneable handle to the coordinator task. Dropping every handle
/// shuts the coordinator and its workers down.
#[derive(Clone)]
pub struct SearchOptimizer {
    commands: mpsc::UnboundedSender<Command>,
}

impl SearchOptimizer {
    /// Spawn the coordinator. Events stream to `events` for the lifetime
    /// of the handle; an uninterested caller can simply drop the receiver.
    pub fn spawn(events: mpsc::UnboundedSender<OptimizerEvent>) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let coordinator = Coordinator {
            commands: command_rx,
            events,
            session: None,
            reports: None,
            learning_tick: None,
            status_tick: None,
        };
        tokio::spawn(coordinator.run());
        Self { commands }
    }

    pub fn start(&self, series: Arc<FeatureSeries>, options: OptimizerOptions) {
        self.send(Command::Start {
            series,
            options: Box::new(options),
        });
    }

    pub fn pause(&self) {
        self.send(Command::Pause);
    }

    pub fn resume(&self) {
        self.send(Command::Resume);
    }

    pub fn stop(&self) {
        self.send(Command::Stop);
    }

    pub fn clear_results(&self) {
        self.send(Command::ClearResults);
    }

    pub fn set_sort(&self, column: SortColumn, direction: SortDirection) {
        self.send(Command::SetSort { column, direction });
    }

    pub fn remove_constraint(&self, key: ConstraintKey) {
        self.send(Command::RemoveConstraint(key));
    }

    /// Current leaderboard, best first. Empty while idle.
    pub async fn snapshot(&self) -> Vec<Arc<SimulationResult>> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Snapshot { reply });
        rx.await.unwrap_or_default()
    }

    pub async fn status(&self) -> OptimizerStatus {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Status { reply });
        rx.await.unwrap_or_else(|_| OptimizerStatus::idle())
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            warn!("optimizer coordinator is gone, command dropped");
        }
    }
}

// ============================================================================
// Worker pool
// ============================================================================

struct WorkerReport {
    worker_id: usize,
    result: Option<SimulationResult>,
}

struct WorkerPool {
    job_txs: Vec<mpsc::Sender<StrategySettings>>,
}

impl WorkerPool {
    /// Spawn `workers` simulation tasks sharing one feature series.
    /// Dropping the pool closes every job channel, which ends the tasks.
    fn spawn(workers: usize, series: Arc<FeatureSeries>) -> (Self, mpsc::Receiver<WorkerReport>) {
        let (report_tx, report_rx) = mpsc::channel(workers * 2);
        let mut job_txs = Vec::with_capacity(workers);
        for worker_id in 0..workers {
            let (job_tx, job_rx) = mpsc::channel(JOB_QUEUE_DEPTH);
            tokio::spawn(run_worker(
                worker_id,
                Arc::clone(&series),
                job_rx,
                report_tx.clone(),
            ));
            job_txs.push(job_tx);
        }
        (Self { job_txs }, report_rx)
    }

    fn size(&self) -> usize {
        self.job_txs.len()
    }

    fn dispatch(&self, worker_id: usize, settings: StrategySettings) {
        match self.job_txs[worker_id].try_send(settings) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(worker_id, "job queue full, dispatch skipped");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                error!(worker_id, "worker terminated, pool degraded");
            }
        }
    }
}

async fn run_worker(
    worker_id: usize,
    series: Arc<FeatureSeries>,
    mut jobs: mpsc::Receiver<StrategySettings>,
    reports: mpsc::Sender<WorkerReport>,
) {
    debug!(worker_id, "simulation worker up");
    while let Some(settings) = jobs.recv().await {
        let result = simulate(&settings, &series);
        if reports.send(WorkerReport { worker_id, result }).await.is_err() {
            break;
        }
        tokio::task::yield_now().await;
    }
    debug!(worker_id, "simulation worker down");
}

// ============================================================================
// Coordinator
// ============================================================================

/// Live search session. Dropping it tears the worker pool down and
/// discards the leaderboard and learned constraints, which is exactly
/// what stop means.
struct Session {
    options: OptimizerOptions,
    pool: WorkerPool,
    leaderboard: Leaderboard,
    constraints: ConstraintSet,
    rng: StdRng,
    paused: bool,
    tested: u64,
    /// Workers whose late results were discarded while paused
    idle_workers: Vec<usize>,
}

impl Session {
    fn dispatch(&mut self, worker_id: usize) {
        let settings = sample_settings(
            &self.options.space,
            &self.options.locks,
            &self.constraints,
            self.options.ratio_weights,
            &mut self.rng,
        );
        self.pool.dispatch(worker_id, settings);
    }

    fn seed_user_locks(constraints: &mut ConstraintSet, locks: &SamplerLocks) {
        for (&key, &value) in &locks.params {
            constraints.lock(key, value);
        }
    }
}

struct Coordinator {
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<OptimizerEvent>,
    session: Option<Session>,
    reports: Option<mpsc::Receiver<WorkerReport>>,
    learning_tick: Option<Interval>,
    status_tick: Option<Interval>,
}

async fn recv_or_pending(reports: &mut Option<mpsc::Receiver<WorkerReport>>) -> Option<WorkerReport> {
    match reports {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn tick_or_pending(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

fn new_interval(period: Duration) -> Interval {
    let period = period.max(Duration::from_millis(1));
    let mut interval = interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

fn default_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(FALLBACK_WORKERS)
}

impl Coordinator {
    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                report = recv_or_pending(&mut self.reports) => match report {
                    Some(report) => self.handle_report(report),
                    None => {
                        warn!("every worker has terminated, stopping session");
                        self.teardown();
                    }
                },
                _ = tick_or_pending(&mut self.learning_tick) => self.run_learning(),
                _ = tick_or_pending(&mut self.status_tick) => self.emit_status(),
            }
        }
        debug!("optimizer coordinator stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start { series, options } => self.start(series, *options),
            Command::Pause => self.pause(),
            Command::Resume => self.resume(),
            Command::Stop => self.stop(),
            Command::ClearResults => self.clear_results(),
            Command::SetSort { column, direction } => self.set_sort(column, direction),
            Command::RemoveConstraint(key) => self.remove_constraint(key),
            Command::Snapshot { reply } => {
                let results = self
                    .session
                    .as_ref()
                    .map(|s| s.leaderboard.results().to_vec())
                    .unwrap_or_default();
                let _ = reply.send(results);
            }
            Command::Status { reply } => {
                let _ = reply.send(self.status());
            }
        }
    }

    fn start(&mut self, series: Arc<FeatureSeries>, options: OptimizerOptions) {
        if self.session.is_some() {
            warn!("start ignored, a session is already live");
            return;
        }
        let workers = options.workers.unwrap_or_else(default_worker_count).max(1);
        let seed = options.seed;
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let mut constraints = ConstraintSet::default();
        Session::seed_user_locks(&mut constraints, &options.locks);
        let leaderboard = Leaderboard::new(options.capacity, options.sort_column, options.sort_direction);
        let learning_interval = options.learning_interval;
        let (pool, reports) = WorkerPool::spawn(workers, series);
        let mut session = Session {
            options,
            pool,
            leaderboard,
            constraints,
            rng,
            paused: false,
            tested: 0,
            idle_workers: Vec::new(),
        };
        for worker_id in 0..workers {
            session.dispatch(worker_id);
        }
        info!(workers, seed = ?seed, "search session started");
        self.session = Some(session);
        self.reports = Some(reports);
        self.learning_tick = Some(new_interval(learning_interval));
        self.status_tick = Some(new_interval(STATUS_TICK));
        self.emit_status();
    }

    fn handle_report(&mut self, report: WorkerReport) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.paused {
            // Job was in flight when the pause landed. Drop the result and
            // park the worker for resume.
            session.idle_workers.push(report.worker_id);
            return;
        }
        session.tested += 1;
        if let Some(result) = report.result {
            if result.kpis.trade_count >= 1 && session.leaderboard.admit(result) {
                let _ = self
                    .events
                    .send(OptimizerEvent::LeaderboardUpdated(session.leaderboard.entries()));
            }
        }
        session.dispatch(report.worker_id);
    }

    fn pause(&mut self) {
        let changed = match self.session.as_mut() {
            Some(session) if !session.paused => {
                session.paused = true;
                info!(tested = session.tested, "search paused");
                true
            }
            Some(_) => {
                warn!("pause ignored, session already paused");
                false
            }
            None => {
                warn!("pause ignored, no live session");
                false
            }
        };
        if changed {
            self.emit_status();
        }
    }

    fn resume(&mut self) {
        let changed = match self.session.as_mut() {
            Some(session) if session.paused => {
                session.paused = false;
                let idle = std::mem::take(&mut session.idle_workers);
                for worker_id in idle {
                    session.dispatch(worker_id);
                }
                info!("search resumed");
                true
            }
            Some(_) => {
                warn!("resume ignored, session is not paused");
                false
            }
            None => {
                warn!("resume ignored, no live session");
                false
            }
        };
        if changed {
            self.emit_status();
        }
    }

    fn stop(&mut self) {
        if self.session.is_none() {
            warn!("stop ignored, no live session");
            return;
        }
        info!("search stopped, results and learned constraints discarded");
        self.teardown();
    }

    fn teardown(&mut self) {
        self.session = None;
        self.reports = None;
        self.learning_tick = None;
        self.status_tick = None;
        let _ = self.events.send(OptimizerEvent::LeaderboardUpdated(Vec::new()));
        let _ = self
            .events
            .send(OptimizerEvent::ConstraintsUpdated(ConstraintSet::default()));
        self.emit_status();
    }

    fn clear_results(&mut self) {
        let Some(session) = self.session.as_mut() else {
            warn!("clear ignored, no live session");
            return;
        };
        session.leaderboard.clear();
        session.constraints = ConstraintSet::default();
        Session::seed_user_locks(&mut session.constraints, &session.options.locks);
        session.tested = 0;
        let constraints = session.constraints.clone();
        info!("results and learned constraints cleared, search continues");
        let _ = self.events.send(OptimizerEvent::LeaderboardUpdated(Vec::new()));
        let _ = self.events.send(OptimizerEvent::ConstraintsUpdated(constraints));
    }

    fn set_sort(&mut self, column: SortColumn, direction: SortDirection) {
        let Some(session) = self.session.as_mut() else {
            warn!("sort change ignored, no live session");
            return;
        };
        session.leaderboard.set_sort(column, direction);
        debug!(column = column.label(), direction = direction.label(), "sort changed");
        let _ = self
            .events
            .send(OptimizerEvent::LeaderboardUpdated(session.leaderboard.entries()));
    }

    fn remove_constraint(&mut self, key: ConstraintKey) {
        let Some(session) = self.session.as_mut() else {
            warn!("constraint removal ignored, no live session");
            return;
        };
        session.constraints.remove(key);
        debug!(?key, "constraint removed");
        let _ = self
            .events
            .send(OptimizerEvent::ConstraintsUpdated(session.constraints.clone()));
    }

    fn run_learning(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.paused || !session.options.learning_enabled {
            return;
        }
        let results = session.leaderboard.results();
        let survivors: Vec<&StrategySettings> = results.iter().map(|r| &r.settings).collect();
        if session.constraints.learn_from(&survivors) {
            info!(
                phase = session.constraints.phase,
                survivors = survivors.len(),
                "sampling constraints tightened from leaderboard"
            );
            let _ = self
                .events
                .send(OptimizerEvent::ConstraintsUpdated(session.constraints.clone()));
        }
    }

    fn status(&self) -> OptimizerStatus {
        match &self.session {
            Some(session) => OptimizerStatus {
                state: if session.paused {
                    OptimizerState::Paused
                } else {
                    OptimizerState::Running
                },
                tested: session.tested,
                phase: session.constraints.phase,
                workers: session.pool.size(),
                leaderboard_len: session.leaderboard.len(),
            },
            None => OptimizerStatus::idle(),
        }
    }

    fn emit_status(&self) {
        let _ = self.events.send(OptimizerEvent::Status(self.status()));
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::prepare_features;
    use crate::sampler::ParameterRange;
    use crate::types::Candle;
    use chrono::NaiveDate;
    use std::time::Duration;

    fn day(i: usize) -> NaiveDate {
        NaiveDate::from_ymd_opt(2021, 3, 1)
            .unwrap()
            .checked_add_days(chrono::Days::new(i as u64))
            .unwrap()
    }

    /// Uptrending series with enough texture that matches and trades are
    /// easy to find
    fn trending_series() -> Arc<FeatureSeries> {
        let mut candles = Vec::with_capacity(220);
        let mut close = 100.0_f64;
        for d in 0..220usize {
            let pct = match d % 7 {
                0 => 2.1,
                1 => -0.7,
                2 => 1.4,
                3 => -0.3,
                4 => 0.9,
                5 => -1.1,
                _ => 1.8,
            } + d as f64 * 0.002;
            let open = close;
            close = (close * (1.0 + pct / 100.0)).max(1.0);
            candles.push(Candle {
                date: day(d),
                open,
                high: open.max(close) * 1.01,
                low: open.min(close) * 0.99,
                close,
                volume: 1_000.0 + (d * 13 % 500) as f64,
            });
        }
        Arc::new(prepare_features(&candles).unwrap())
    }

    /// Narrow space so candidates trade often and simulations stay cheap
    fn fast_options(seed: u64) -> OptimizerOptions {
        OptimizerOptions {
            space: ParameterSpace {
                pattern_length: ParameterRange::new(1.0, 2.0, 1.0),
                holding_period: ParameterRange::new(1.0, 2.0, 1.0),
                lookback: ParameterRange::new(20.0, 40.0, 1.0),
                tolerance: ParameterRange::new(2.0, 5.0, 1.0),
                min_occurrences: ParameterRange::new(1.0, 3.0, 1.0),
                max_occurrences: ParameterRange::new(50.0, 100.0, 1.0),
                ..ParameterSpace::default()
            },
            capacity: 5,
            workers: Some(2),
            learning_enabled: false,
            seed: Some(seed),
            ..OptimizerOptions::default()
        }
    }

    fn spawn_headless() -> SearchOptimizer {
        let (events, _rx) = mpsc::unbounded_channel();
        SearchOptimizer::spawn(events)
    }

    #[tokio::test]
    async fn test_idle_until_started() {
        let optimizer = spawn_headless();
        let status = optimizer.status().await;
        assert_eq!(status.state, OptimizerState::Idle);
        assert_eq!(status.tested, 0);
        assert!(optimizer.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn test_lifecycle_transitions() {
        let optimizer = spawn_headless();
        optimizer.start(trending_series(), fast_options(7));
        assert_eq!(optimizer.status().await.state, OptimizerState::Running);

        optimizer.pause();
        assert_eq!(optimizer.status().await.state, OptimizerState::Paused);

        optimizer.resume();
        assert_eq!(optimizer.status().await.state, OptimizerState::Running);

        optimizer.stop();
        let status = optimizer.status().await;
        assert_eq!(status.state, OptimizerState::Idle);
        assert_eq!(status.tested, 0, "stop discards the session counters");
        assert!(optimizer.snapshot().await.is_empty(), "stop clears the leaderboard");
    }

    #[tokio::test]
    async fn test_search_fills_leaderboard() {
        let optimizer = spawn_headless();
        optimizer.start(trending_series(), fast_options(11));
        tokio::time::sleep(Duration::from_millis(600)).await;

        let status = optimizer.status().await;
        assert!(status.tested > 0, "workers should have simulated candidates");
        let snapshot = optimizer.snapshot().await;
        assert!(!snapshot.is_empty(), "trending series must yield admissible strategies");
        assert!(snapshot.len() <= 5, "leaderboard capacity respected");
        for result in &snapshot {
            assert!(result.kpis.trade_count >= 1, "only trading strategies are admitted");
        }
        optimizer.stop();
    }

    #[tokio::test]
    async fn test_start_while_running_is_ignored() {
        let optimizer = spawn_headless();
        optimizer.start(trending_series(), fast_options(3));
        let mut second = fast_options(4);
        second.workers = Some(3);
        optimizer.start(trending_series(), second);

        let status = optimizer.status().await;
        assert_eq!(status.workers, 2, "second start must not replace the live session");
        optimizer.stop();
    }

    #[tokio::test]
    async fn test_clear_results_keeps_session_alive() {
        let optimizer = spawn_headless();
        optimizer.start(trending_series(), fast_options(5));
        tokio::time::sleep(Duration::from_millis(400)).await;
        optimizer.pause();
        assert!(!optimizer.snapshot().await.is_empty());

        optimizer.clear_results();
        let status = optimizer.status().await;
        assert_eq!(status.state, OptimizerState::Paused, "clear must not stop the session");
        assert_eq!(status.tested, 0);
        assert!(optimizer.snapshot().await.is_empty());
        optimizer.stop();
    }

    #[tokio::test]
    async fn test_events_carry_progress() {
        let (events, mut rx) = mpsc::unbounded_channel();
        let optimizer = SearchOptimizer::spawn(events);
        optimizer.start(trending_series(), fast_options(13));

        let mut saw_status = false;
        let mut saw_leaderboard = false;
        let deadline = tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(event) = rx.recv().await {
                match event {
                    OptimizerEvent::Status(_) => saw_status = true,
                    OptimizerEvent::LeaderboardUpdated(entries) if !entries.is_empty() => {
                        saw_leaderboard = true
                    }
                    _ => {}
                }
                if saw_status && saw_leaderboard {
                    break;
                }
            }
        })
        .await;

        assert!(deadline.is_ok(), "expected status and leaderboard events within 5s");
        assert!(saw_status);
        assert!(saw_leaderboard);
        optimizer.stop();
    }

    #[tokio::test]
    async fn test_sort_change_reorders_snapshot() {
        let optimizer = spawn_headless();
        optimizer.start(trending_series(), fast_options(17));
        tokio::time::sleep(Duration::from_millis(500)).await;
        optimizer.pause();

        optimizer.set_sort(SortColumn::TradeCount, SortDirection::Asc);
        let snapshot = optimizer.snapshot().await;
        for pair in snapshot.windows(2) {
            assert!(
                pair[0].kpis.trade_count <= pair[1].kpis.trade_count,
                "snapshot must follow the new sort"
            );
        }
        optimizer.stop();
    }
}
