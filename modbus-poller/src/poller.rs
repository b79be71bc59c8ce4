//! Periodic and manual polling of devices.
//!
//! A [`Poller`] runs one task per [`PollTarget`]. Each task is a ticker firing
//! at a fixed rate plus at most one cycle at a time: a tick arriving while a
//! cycle is still running is skipped, never queued. A cycle makes a
//! best-effort connect, reads, and hands the result to a [`PollSink`].
//!
//! Background cycles keep failures to the log. Manual cycles started with
//! [`Poller::poll_once`] return them and report them to the sink.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::codec::{words_from_flags, Address, Word};
use crate::config::PollingConfig;
use crate::connection::ConnectionManager;
use crate::error::{OpError, PollError, ValidationError};
use crate::identity::DeviceKey;
use crate::request::{DataKind, ReadRange};

/// Register read by the online check.
pub const ONLINE_RANGE: ReadRange = ReadRange::single(0);

/// Latest successful read of one data space.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sample {
    pub address: Address,
    /// Registers as read; bits widened to `0|1`.
    pub values: Vec<Word>,
}

/// What a poll task reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PollKind {
    Data(DataKind),
    /// Reachability check against [`ONLINE_RANGE`].
    Online,
}

impl PollKind {
    /// Check `range` against the read cap of this kind. The online check
    /// always reads [`ONLINE_RANGE`], so any range is accepted for it.
    pub fn check(self, range: ReadRange) -> Result<ReadRange, ValidationError> {
        match self {
            Self::Data(kind) => range.check(kind),
            Self::Online => Ok(range),
        }
    }
}

impl fmt::Display for PollKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Data(kind) => kind.fmt(f),
            Self::Online => f.write_str("online"),
        }
    }
}

/// One device and one poll kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PollTarget {
    pub key: DeviceKey,
    pub kind: PollKind,
}

impl PollTarget {
    pub fn new(key: DeviceKey, kind: PollKind) -> Self {
        Self { key, kind }
    }

    pub fn data(key: DeviceKey, kind: DataKind) -> Self {
        Self::new(key, PollKind::Data(kind))
    }

    pub fn online(key: DeviceKey) -> Self {
        Self::new(key, PollKind::Online)
    }
}

impl fmt::Display for PollTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.key, self.kind)
    }
}

/// Requested shape of a poll task. Any change restarts the task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    pub enabled: bool,
    /// Requested period; the poller raises it to its minimum period.
    pub rate: Duration,
    pub range: ReadRange,
}

impl PollSettings {
    pub fn new(enabled: bool, rate: Duration, range: ReadRange) -> Self {
        Self {
            enabled,
            rate,
            range,
        }
    }

    pub fn online(enabled: bool, rate: Duration) -> Self {
        Self::new(enabled, rate, ONLINE_RANGE)
    }
}

/// Receives the outcome of poll cycles.
pub trait PollSink: Send + Sync {
    fn publish(&self, key: &DeviceKey, kind: DataKind, sample: Sample);

    fn set_online(&self, key: &DeviceKey, online: bool);

    /// Called for failures of manual polls only.
    fn report_error(&self, key: &DeviceKey, error: &PollError);
}

/// How a cycle treats its failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleMode {
    /// Logged at `debug`, never surfaced.
    Background,
    /// Returned to the caller and reported to the sink.
    Manual,
}

/// Point-in-time view of a running task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskSnapshot {
    pub settings: PollSettings,
    pub period: Duration,
    pub cycles: u64,
    pub skipped_ticks: u64,
    pub running: bool,
}

#[derive(Debug, Default)]
struct TaskStats {
    /// `true` while a cycle is Running, `false` while Idle.
    running: AtomicBool,
    cycles: AtomicU64,
    skipped: AtomicU64,
}

/// Returns a task to Idle when its cycle ends, however it ends.
struct Running(Arc<TaskStats>);

impl Drop for Running {
    fn drop(&mut self) {
        self.0.cycles.fetch_add(1, Ordering::SeqCst);
        self.0.running.store(false, Ordering::SeqCst);
    }
}

/// Cancellation of one task. `cancel` waits for a publish in progress, so
/// nothing of the task reaches the sink once it returns.
#[derive(Clone, Default)]
struct Lifeline {
    token: CancellationToken,
    gate: Arc<Mutex<()>>,
}

impl Lifeline {
    fn cancel(&self) {
        let _gate = lock(&self.gate);
        self.token.cancel();
    }
}

struct PollTask {
    settings: PollSettings,
    period: Duration,
    lifeline: Lifeline,
    range: watch::Sender<ReadRange>,
    stats: Arc<TaskStats>,
}

impl Drop for PollTask {
    fn drop(&mut self) {
        self.lifeline.cancel();
    }
}

#[derive(Clone)]
struct Cycle {
    manager: Arc<ConnectionManager>,
    sink: Arc<dyn PollSink>,
    target: PollTarget,
}

impl Cycle {
    async fn read(&self, range: ReadRange) -> Result<Vec<Word>, OpError> {
        let key = &self.target.key;
        let id = key.identity();
        if let Err(err) = self.manager.connect(id).await {
            debug!(device = %key, error = %err, "connect before poll failed");
        }

        let (address, length) = (range.address(), range.length());
        match self.target.kind {
            PollKind::Data(DataKind::Coils) => self
                .manager
                .read_coils(id, address, length)
                .await
                .map(|flags| words_from_flags(&flags)),
            PollKind::Data(DataKind::DiscreteInputs) => self
                .manager
                .read_discrete_inputs(id, address, length)
                .await
                .map(|flags| words_from_flags(&flags)),
            PollKind::Data(DataKind::HoldingRegisters) => {
                self.manager.read_holding_registers(id, address, length).await
            }
            PollKind::Data(DataKind::InputRegisters) => {
                self.manager.read_input_registers(id, address, length).await
            }
            PollKind::Online => {
                self.manager
                    .read_holding_registers(id, ONLINE_RANGE.address(), ONLINE_RANGE.length())
                    .await
            }
        }
    }

    fn finish(
        &self,
        mode: CycleMode,
        range: ReadRange,
        result: Result<Vec<Word>, OpError>,
    ) -> Result<Vec<Word>, PollError> {
        let key = &self.target.key;
        match (self.target.kind, &result) {
            (PollKind::Online, result) => {
                let online = matches!(result, Ok(values) if !values.is_empty());
                self.sink.set_online(key, online);
            }
            (PollKind::Data(kind), Ok(values)) => {
                let sample = Sample {
                    address: range.address(),
                    values: values.clone(),
                };
                self.sink.publish(key, kind, sample);
            }
            (PollKind::Data(_), Err(_)) => {}
        }

        result.map_err(|err| {
            let err = PollError::from(err);
            match mode {
                CycleMode::Background => {
                    debug!(device = %key, kind = %self.target.kind, error = %err, "poll failed");
                }
                CycleMode::Manual => {
                    warn!(device = %key, kind = %self.target.kind, error = %err, "manual poll failed");
                    self.sink.report_error(key, &err);
                }
            }
            err
        })
    }

    async fn run_background(self, range: ReadRange, lifeline: Lifeline, _running: Running) {
        let result = self.read(range).await;
        let _gate = lock(&lifeline.gate);
        if lifeline.token.is_cancelled() {
            trace!(poll = %self.target, "discarding result of cancelled poll");
            return;
        }
        // Failures were logged by `finish`.
        let _ = self.finish(CycleMode::Background, range, result);
    }

    async fn tick_loop(
        self,
        period: Duration,
        lifeline: Lifeline,
        params: watch::Receiver<ReadRange>,
        stats: Arc<TaskStats>,
    ) {
        let token = lifeline.token.clone();
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = interval.tick() => {}
            }

            let idle = stats
                .running
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok();
            if !idle {
                stats.skipped.fetch_add(1, Ordering::SeqCst);
                trace!(poll = %self.target, "previous cycle still running, tick skipped");
                continue;
            }

            let running = Running(stats.clone());
            let range = *params.borrow();
            tokio::spawn(self.clone().run_background(range, lifeline.clone(), running));
        }
        debug!(poll = %self.target, "poll task stopped");
    }
}

/// Schedules poll tasks over a shared [`ConnectionManager`].
pub struct Poller {
    manager: Arc<ConnectionManager>,
    sink: Arc<dyn PollSink>,
    min_period: Duration,
    tasks: Mutex<HashMap<PollTarget, PollTask>>,
    manual: Mutex<HashSet<PollTarget>>,
}

impl fmt::Debug for Poller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Poller")
            .field("min_period", &self.min_period)
            .field("tasks", &self.tasks().len())
            .finish_non_exhaustive()
    }
}

/// Clears the manual in-progress flag of a target.
struct Manual<'a> {
    flags: &'a Mutex<HashSet<PollTarget>>,
    target: PollTarget,
}

impl Drop for Manual<'_> {
    fn drop(&mut self) {
        lock(self.flags).remove(&self.target);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Poller {
    pub fn new(
        manager: Arc<ConnectionManager>,
        sink: Arc<dyn PollSink>,
        config: &PollingConfig,
    ) -> Self {
        let min_period = config.period_floor();
        if min_period != config.min_period {
            warn!(configured = ?config.min_period, used = ?min_period, "polling period floor raised");
        }
        Self {
            manager,
            sink,
            min_period,
            tasks: Mutex::new(HashMap::new()),
            manual: Mutex::new(HashSet::new()),
        }
    }

    fn tasks(&self) -> MutexGuard<'_, HashMap<PollTarget, PollTask>> {
        lock(&self.tasks)
    }

    /// Period a task with `rate` actually runs at.
    pub fn effective_period(&self, rate: Duration) -> Duration {
        rate.max(self.min_period)
    }

    fn cycle(&self, target: PollTarget) -> Cycle {
        Cycle {
            manager: self.manager.clone(),
            sink: self.sink.clone(),
            target,
        }
    }

    /// Bring the task for `target` in line with `settings`.
    ///
    /// Unchanged settings leave a running task alone. Otherwise the old task
    /// is cancelled and, if `settings.enabled`, a new one starts with an
    /// immediate first cycle. Returns whether anything was stopped or started.
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// [`PollError::Validation`] if an enabled task's range exceeds the read
    /// cap of `target`; the current task is left untouched.
    pub fn apply(&self, target: PollTarget, settings: PollSettings) -> Result<bool, PollError> {
        if settings.enabled {
            target.kind.check(settings.range)?;
        }

        let mut tasks = self.tasks();
        if tasks
            .get(&target)
            .is_some_and(|task| task.settings == settings)
        {
            return Ok(false);
        }
        if !settings.enabled {
            return Ok(tasks.remove(&target).is_some());
        }

        let period = self.effective_period(settings.rate);
        let lifeline = Lifeline::default();
        let (range, range_rx) = watch::channel(settings.range);
        let stats = Arc::new(TaskStats::default());
        tokio::spawn(self.cycle(target.clone()).tick_loop(
            period,
            lifeline.clone(),
            range_rx,
            stats.clone(),
        ));
        debug!(poll = %target, ?period, "poll task started");

        let task = PollTask {
            settings,
            period,
            lifeline,
            range,
            stats,
        };
        tasks.insert(target, task);
        Ok(true)
    }

    /// Change the range of a running task without restarting it. The next
    /// cycle reads the new range. Returns whether a task was running.
    pub fn set_range(&self, target: &PollTarget, range: ReadRange) -> Result<bool, PollError> {
        let range = target.kind.check(range)?;
        Ok(match self.tasks().get_mut(target) {
            Some(task) => {
                task.settings.range = range;
                task.range.send_replace(range);
                true
            }
            None => false,
        })
    }

    pub fn stop(&self, target: &PollTarget) -> bool {
        self.tasks().remove(target).is_some()
    }

    /// Stop every task of one device. Returns how many were running.
    pub fn stop_device(&self, key: &DeviceKey) -> usize {
        let mut tasks = self.tasks();
        let before = tasks.len();
        tasks.retain(|target, _| &target.key != key);
        before - tasks.len()
    }

    pub fn stop_all(&self) {
        self.tasks().clear();
    }

    pub fn snapshot(&self, target: &PollTarget) -> Option<TaskSnapshot> {
        self.tasks().get(target).map(|task| TaskSnapshot {
            settings: task.settings,
            period: task.period,
            cycles: task.stats.cycles.load(Ordering::SeqCst),
            skipped_ticks: task.stats.skipped.load(Ordering::SeqCst),
            running: task.stats.running.load(Ordering::SeqCst),
        })
    }

    pub fn active_targets(&self) -> Vec<PollTarget> {
        self.tasks().keys().cloned().collect()
    }

    /// Run one cycle now and wait for it.
    ///
    /// # Errors
    ///
    /// [`PollError::Validation`] if `range` exceeds the read cap of `target`,
    /// before any I/O. [`PollError::InProgress`] if a manual poll of the same
    /// target is still running. Otherwise the read failure, which is also
    /// reported to the sink.
    pub async fn poll_once(
        &self,
        target: &PollTarget,
        range: ReadRange,
    ) -> Result<Vec<Word>, PollError> {
        let range = target.kind.check(range)?;
        if !lock(&self.manual).insert(target.clone()) {
            return Err(PollError::InProgress(target.to_string()));
        }
        let _manual = Manual {
            flags: &self.manual,
            target: target.clone(),
        };

        let cycle = self.cycle(target.clone());
        let result = cycle.read(range).await;
        cycle.finish(CycleMode::Manual, range, result)
    }
}
