//! # Dispatcher
//!
//! The dispatcher owns a fixed pool of shard workers, the tracker registry
//! and the result collector. Every submitted job is broadcast to all shards;
//! the caller blocks until each shard has reported, an interrupt or
//! termination releases the job, or the deadline passes.
//!
//! ## Key Concepts
//! - Shards: contiguous slices of the unit list, one worker thread each
//! - Slots: one `Result<Vec<O>, Failure>` per unit, merged in unit order
//! - Interrupts: a unit returning `UnitError::Interrupted` stops the pool
//!
//! ## Lifecycle
//! `Running` until [`Dispatcher::terminate`] (or drop). Termination is
//! one-way and idempotent; blocked submitters are released with
//! `DispatchError::PoolTerminated`.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use serde::Serialize;
use shardcast_api::{BoxedUnit, DispatchError, Failure, JobId, SharedHandles, SharedRef, Slot};
use uuid::Uuid;

use super::collector::ResultCollector;
use super::config::DispatcherConfig;
use super::lock;
use super::shard::partition;
use super::tracker::{JobTracker, TrackerRegistry, WaitOutcome};
use super::worker::{JobRequest, SendFailure, Task, Worker};
use crate::{log_error, log_job, log_pool, logging};

/// Lifecycle state of a dispatcher pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DispatcherState {
    /// Accepting jobs
    Running = 0,
    /// Terminated; every submit fails with `PoolTerminated`
    Terminated = 1,
}

/// Snapshot of a dispatcher's counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatcherMetrics {
    /// Number of shards (worker threads) the pool was built with
    pub shard_count: usize,
    /// Workers still accepting jobs
    pub live_workers: usize,
    /// Jobs registered and not yet released
    pub pending_jobs: usize,
    pub submitted: u64,
    /// Jobs where every shard reported
    pub completed: u64,
    /// Completed jobs with at least one failed slot
    pub failed: u64,
    pub timed_out: u64,
    pub interrupted: u64,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    interrupted: AtomicU64,
}

/// Pool state shared between the dispatcher and its collector thread.
pub(crate) struct PoolShared {
    state: AtomicU8,
    interrupt: Mutex<Option<Failure>>,
    pub(crate) collector_stop: AtomicBool,
    /// Tells workers to skip whatever is still queued.
    halt: Arc<AtomicBool>,
    counters: Counters,
}

impl PoolShared {
    pub(crate) fn new() -> Self {
        Self {
            state: AtomicU8::new(DispatcherState::Running as u8),
            interrupt: Mutex::new(None),
            collector_stop: AtomicBool::new(false),
            halt: Arc::new(AtomicBool::new(false)),
            counters: Counters::default(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.state.load(Ordering::SeqCst) == DispatcherState::Running as u8
    }

    /// Keep the first interrupt observed.
    pub fn record_interrupt(&self, failure: Failure) {
        let mut interrupt = lock(&self.interrupt);
        if interrupt.is_none() {
            *interrupt = Some(failure);
        }
    }

    pub fn interrupt(&self) -> Option<Failure> {
        lock(&self.interrupt).clone()
    }
}

/// Fan-out/fan-in dispatcher over a fixed set of work units.
pub struct Dispatcher<P, O>
where
    P: Send + Sync + 'static,
    O: Send + 'static,
{
    id: String,
    config: DispatcherConfig,
    unit_names: Vec<String>,
    layout: Arc<[Vec<String>]>,
    shared: Arc<SharedHandles>,
    workers: Mutex<Vec<Worker<P>>>,
    collector: Mutex<Option<JoinHandle<()>>>,
    registry: Arc<TrackerRegistry<O>>,
    pool: Arc<PoolShared>,
    next_job: AtomicU64,
}

impl<P, O> Dispatcher<P, O>
where
    P: Send + Sync + 'static,
    O: Send + 'static,
{
    /// Build a dispatcher over `units` and start its threads.
    pub fn new(units: Vec<BoxedUnit<P, O>>, config: DispatcherConfig) -> Result<Self, DispatchError> {
        DispatcherBuilder::new().units(units).config(config).build()
    }

    pub fn builder() -> DispatcherBuilder<P, O> {
        DispatcherBuilder::new()
    }

    /// Run `action` on every unit and return one result list per unit.
    ///
    /// The first failed slot (in unit order) is raised as
    /// `DispatchError::UnitFailure` and the other results are discarded.
    pub fn submit(
        &self,
        action: &str,
        payload: P,
        timeout: Option<Duration>,
    ) -> Result<Vec<Vec<O>>, DispatchError> {
        let slots = self.submit_outcomes(action, payload, timeout)?;
        let results = slots
            .into_iter()
            .map(|slot| slot.map_err(DispatchError::UnitFailure))
            .collect::<Result<Vec<_>, _>>();
        if let Err(DispatchError::UnitFailure(failure)) = &results {
            self.pool.counters.failed.fetch_add(1, Ordering::Relaxed);
            log_job!(failure.job_id, "failed", unit = %failure.unit, kind = %failure.kind);
        }
        results
    }

    /// Run `action` on every unit and return each unit's raw outcome.
    pub fn submit_outcomes(
        &self,
        action: &str,
        payload: P,
        timeout: Option<Duration>,
    ) -> Result<Vec<Slot<O>>, DispatchError> {
        self.check_accepting()?;
        if self.unit_names.is_empty() {
            return Ok(Vec::new());
        }

        for handle in self.shared.values() {
            handle.ensure_active();
        }

        let job_id = self.next_job.fetch_add(1, Ordering::SeqCst) + 1;
        let tracker = Arc::new(JobTracker::new(job_id, self.layout.len()));
        self.registry.insert(Arc::clone(&tracker));

        // terminate or an interrupt may have drained the registry before the insert
        if let Err(err) = self.check_accepting() {
            self.registry.remove(job_id);
            return Err(err);
        }

        self.pool.counters.submitted.fetch_add(1, Ordering::Relaxed);
        let timeout = timeout.or(self.config.default_timeout);
        let deadline = timeout.and_then(|timeout| Instant::now().checked_add(timeout));
        log_job!(job_id, "submitted", action = action, shards = self.layout.len(), timeout = ?timeout);
        if !self.broadcast(&tracker, action, payload, deadline) {
            return Err(self.expire(job_id, action, timeout));
        }

        let remaining = deadline.map(|deadline| deadline.saturating_duration_since(Instant::now()));
        match tracker.wait(remaining) {
            WaitOutcome::Complete(slots) => {
                self.pool.counters.completed.fetch_add(1, Ordering::Relaxed);
                log_job!(job_id, "completed", slots = slots.len());
                Ok(slots)
            }
            WaitOutcome::Interrupted(failure) => {
                self.pool.counters.interrupted.fetch_add(1, Ordering::Relaxed);
                log_job!(job_id, "interrupted", unit = %failure.unit);
                Err(DispatchError::OperatorInterrupt(failure))
            }
            WaitOutcome::Terminated => {
                log_job!(job_id, "released_by_terminate");
                Err(DispatchError::PoolTerminated)
            }
            WaitOutcome::TimedOut => Err(self.expire(job_id, action, timeout)),
        }
    }

    fn expire(&self, job_id: JobId, action: &str, timeout: Option<Duration>) -> DispatchError {
        self.registry.remove(job_id);
        self.pool.counters.timed_out.fetch_add(1, Ordering::Relaxed);
        let deadline = timeout.unwrap_or_default();
        tracing::warn!(job_id, action, ?deadline, "job deadline exceeded, partial results discarded");
        DispatchError::DeadlineExceeded(deadline)
    }

    /// Async wrapper around [`submit`](Self::submit) that blocks on tokio's
    /// blocking pool instead of the calling task.
    pub async fn submit_async(
        self: &Arc<Self>,
        action: impl Into<String>,
        payload: P,
        timeout: Option<Duration>,
    ) -> Result<Vec<Vec<O>>, DispatchError> {
        let dispatcher = Arc::clone(self);
        let action = action.into();
        tokio::task::spawn_blocking(move || dispatcher.submit(&action, payload, timeout))
            .await
            .map_err(|e| DispatchError::Other(anyhow::anyhow!("submit task failed: {}", e)))?
    }

    fn check_accepting(&self) -> Result<(), DispatchError> {
        if !self.pool.is_running() {
            return Err(DispatchError::PoolTerminated);
        }
        if let Some(failure) = self.pool.interrupt() {
            return Err(DispatchError::OperatorInterrupt(failure));
        }
        Ok(())
    }

    /// Queue the job on every shard. Returns `false` when a bounded queue
    /// stayed full past `deadline`.
    fn broadcast(
        &self,
        tracker: &Arc<JobTracker<O>>,
        action: &str,
        payload: P,
        deadline: Option<Instant>,
    ) -> bool {
        let action: Arc<str> = Arc::from(action);
        let payload = Arc::new(payload);
        let senders: Vec<_> = lock(&self.workers).iter().map(Worker::sender).collect();
        for sender in &senders {
            let task = Task::Run(JobRequest {
                job_id: tracker.job_id(),
                action: Arc::clone(&action),
                payload: Arc::clone(&payload),
            });
            let shard = sender.shard();
            match sender.send(task, deadline) {
                Ok(()) => {}
                Err(SendFailure::Gone) => {
                    tracing::warn!(job_id = tracker.job_id(), shard, "worker gone, failing its units");
                    if tracker.mark_lost(shard, &self.layout[shard]) {
                        self.registry.remove(tracker.job_id());
                    }
                }
                Err(SendFailure::Full) => {
                    tracing::warn!(job_id = tracker.job_id(), shard, "worker queue still full at deadline");
                    return false;
                }
            }
        }
        true
    }

    /// Stop every worker and the collector, and release pending jobs.
    ///
    /// Idempotent. Blocked submitters are released with `PoolTerminated`
    /// right away; workers finish the unit they are running, skip anything
    /// still queued and exit. Worker or collector panics observed while
    /// joining are reported as `DispatchError::Shutdown` once the pool is
    /// fully torn down.
    pub fn terminate(&self) -> Result<(), DispatchError> {
        let previous = self
            .pool
            .state
            .swap(DispatcherState::Terminated as u8, Ordering::SeqCst);
        if previous == DispatcherState::Terminated as u8 {
            return Ok(());
        }
        self.pool.halt.store(true, Ordering::SeqCst);
        let released = self.registry.terminate_all();
        log_pool!(self.id, "terminating", released_jobs = released);

        let mut workers = std::mem::take(&mut *lock(&self.workers));
        for worker in &workers {
            worker.shutdown();
        }

        let mut errors = Vec::new();
        for worker in &mut workers {
            if let Err(err) = worker.join() {
                log_error!(err, dispatcher = %self.id);
                errors.push(err);
            }
        }

        self.pool.collector_stop.store(true, Ordering::SeqCst);
        if let Some(handle) = lock(&self.collector).take() {
            if handle.join().is_err() {
                errors.push("result collector panicked".to_string());
            }
        }

        log_pool!(self.id, "terminated");

        if errors.is_empty() {
            Ok(())
        } else {
            Err(DispatchError::Shutdown(errors.join("; ")))
        }
    }
}

impl<P, O> Dispatcher<P, O>
where
    P: Send + Sync + 'static,
    O: Send + 'static,
{
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> DispatcherState {
        if self.pool.is_running() {
            DispatcherState::Running
        } else {
            DispatcherState::Terminated
        }
    }

    /// The interrupt that stopped this pool, if any.
    pub fn interrupt(&self) -> Option<Failure> {
        self.pool.interrupt()
    }

    pub fn is_interrupted(&self) -> bool {
        self.pool.interrupt().is_some()
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Unit names in submission order.
    pub fn unit_names(&self) -> &[String] {
        &self.unit_names
    }

    pub fn shard_count(&self) -> usize {
        self.layout.len()
    }

    pub fn live_workers(&self) -> usize {
        lock(&self.workers).iter().filter(|w| w.is_alive()).count()
    }

    pub fn pending_jobs(&self) -> usize {
        self.registry.len()
    }

    pub fn metrics(&self) -> DispatcherMetrics {
        let counters = &self.pool.counters;
        DispatcherMetrics {
            shard_count: self.shard_count(),
            live_workers: self.live_workers(),
            pending_jobs: self.pending_jobs(),
            submitted: counters.submitted.load(Ordering::Relaxed),
            completed: counters.completed.load(Ordering::Relaxed),
            failed: counters.failed.load(Ordering::Relaxed),
            timed_out: counters.timed_out.load(Ordering::Relaxed),
            interrupted: counters.interrupted.load(Ordering::Relaxed),
        }
    }
}

impl<P, O> std::fmt::Debug for Dispatcher<P, O>
where
    P: Send + Sync + 'static,
    O: Send + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("units", &self.unit_names.len())
            .field("shards", &self.layout.len())
            .finish()
    }
}

impl<P, O> Drop for Dispatcher<P, O>
where
    P: Send + Sync + 'static,
    O: Send + 'static,
{
    fn drop(&mut self) {
        if let Err(err) = self.terminate() {
            log_error!(err, dispatcher = %self.id);
        }
    }
}

/// Builder for [`Dispatcher`].
pub struct DispatcherBuilder<P, O> {
    units: Vec<BoxedUnit<P, O>>,
    config: DispatcherConfig,
    shared: SharedHandles,
}

impl<P, O> DispatcherBuilder<P, O>
where
    P: Send + Sync + 'static,
    O: Send + 'static,
{
    pub fn new() -> Self {
        Self {
            units: Vec::new(),
            config: DispatcherConfig::default(),
            shared: SharedHandles::new(),
        }
    }

    pub fn unit(mut self, unit: BoxedUnit<P, O>) -> Self {
        self.units.push(unit);
        self
    }

    pub fn units(mut self, units: impl IntoIterator<Item = BoxedUnit<P, O>>) -> Self {
        self.units.extend(units);
        self
    }

    pub fn config(mut self, config: DispatcherConfig) -> Self {
        self.config = config;
        self
    }

    /// Register a shared-state handle units can reach through their context.
    pub fn shared(mut self, name: impl Into<String>, handle: SharedRef) -> Self {
        self.shared.insert(name.into(), handle);
        self
    }

    pub fn shared_handles(mut self, handles: SharedHandles) -> Self {
        self.shared.extend(handles);
        self
    }

    pub fn build(self) -> Result<Dispatcher<P, O>, DispatchError> {
        let DispatcherBuilder { units, config, shared } = self;
        config.validate()?;

        let mut seen = HashSet::new();
        for unit in &units {
            if !seen.insert(unit.name().to_string()) {
                return Err(DispatchError::DuplicateUnit(unit.name().to_string()));
            }
        }

        let id = format!("{}-{}", config.thread_name_prefix, Uuid::new_v4());
        let unit_names: Vec<String> = units.iter().map(|u| u.name().to_string()).collect();
        let shards = partition(units.len(), config.effective_parallelism(units.len()));
        let layout: Arc<[Vec<String>]> = shards
            .iter()
            .map(|range| unit_names[range.clone()].to_vec())
            .collect();

        let dispatch = logging::current_subscriber();
        let shared = Arc::new(shared);
        let registry = Arc::new(TrackerRegistry::new());
        let pool = Arc::new(PoolShared::new());
        let halt = Arc::clone(&pool.halt);

        let mut workers = Vec::with_capacity(shards.len());
        let mut receivers = Vec::with_capacity(shards.len());
        for (shard, range) in shards.iter().enumerate() {
            let shard_units = units[range.clone()].to_vec();
            match Worker::spawn(
                shard,
                shard_units,
                Arc::clone(&shared),
                Arc::clone(&halt),
                &config,
                dispatch.clone(),
            ) {
                Ok((worker, outbound)) => {
                    workers.push(worker);
                    receivers.push(outbound);
                }
                Err(err) => {
                    stop_workers(&mut workers);
                    return Err(err);
                }
            }
        }

        let collector = ResultCollector::new(
            id.clone(),
            receivers,
            Arc::clone(&layout),
            Arc::clone(&registry),
            Arc::clone(&pool),
            config.poll_interval,
        );
        let collector = match collector.spawn(format!("{}-collector", config.thread_name_prefix), dispatch) {
            Ok(handle) => handle,
            Err(err) => {
                stop_workers(&mut workers);
                return Err(err);
            }
        };

        log_pool!(id, "started", units = unit_names.len(), shards = layout.len());

        Ok(Dispatcher {
            id,
            config,
            unit_names,
            layout,
            shared,
            workers: Mutex::new(workers),
            collector: Mutex::new(Some(collector)),
            registry,
            pool,
            next_job: AtomicU64::new(0),
        })
    }
}

impl<P, O> Default for DispatcherBuilder<P, O>
where
    P: Send + Sync + 'static,
    O: Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

fn stop_workers<P>(workers: &mut Vec<Worker<P>>) {
    for worker in workers.iter() {
        worker.shutdown();
    }
    for worker in workers.iter_mut() {
        let _ = worker.join();
    }
    workers.clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardcast_api::{FailureKind, UnitContext, UnitResult, WorkUnit};

    struct Named(String);

    impl WorkUnit for Named {
        type Payload = u32;
        type Output = String;

        fn name(&self) -> &str {
            &self.0
        }

        fn invoke(&self, _action: &str, payload: &u32, _ctx: &UnitContext) -> UnitResult<String> {
            Ok(vec![format!("{}:{}", self.0, payload)])
        }
    }

    fn dispatcher(names: &[&str], parallelism: usize) -> Dispatcher<u32, String> {
        let units = names
            .iter()
            .map(|name| Arc::new(Named(name.to_string())) as BoxedUnit<u32, String>)
            .collect();
        let config = DispatcherConfig::default()
            .with_parallelism(parallelism)
            .with_poll_interval(Duration::from_millis(5));
        Dispatcher::new(units, config).unwrap()
    }

    #[test]
    fn test_lost_worker_fills_its_units() {
        let dispatcher = dispatcher(&["a", "b", "c", "d"], 2);
        {
            // stop shard 1 behind the dispatcher's back
            let mut workers = lock(&dispatcher.workers);
            workers[1].shutdown();
            workers[1].join().unwrap();
        }
        assert_eq!(dispatcher.live_workers(), 1);

        for payload in 0..3 {
            let slots = dispatcher
                .submit_outcomes("grep", payload, Some(Duration::from_secs(5)))
                .unwrap();
            assert_eq!(slots.len(), 4);
            assert_eq!(slots[0].as_ref().unwrap(), &vec![format!("a:{}", payload)]);
            assert_eq!(slots[1].as_ref().unwrap(), &vec![format!("b:{}", payload)]);
            for (slot, unit) in slots[2..].iter().zip(["c", "d"]) {
                let failure = slot.as_ref().unwrap_err();
                assert_eq!(failure.kind, FailureKind::WorkerLost);
                assert_eq!(failure.unit, unit);
                assert_eq!(failure.shard, 1);
            }
        }
        assert_eq!(dispatcher.pending_jobs(), 0);

        match dispatcher.submit("grep", 9, Some(Duration::from_secs(5))) {
            Err(DispatchError::UnitFailure(failure)) => assert_eq!(failure.unit, "c"),
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(dispatcher.terminate().is_ok());
    }
}
