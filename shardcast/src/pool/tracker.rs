//! Per-job bookkeeping.
//!
//! A `JobTracker` collects one report per shard and wakes its submitter when
//! the job is complete, when an interrupt or termination forces it ready, or
//! when the submitter's deadline passes. The `TrackerRegistry` maps job ids to
//! trackers for the result collector. Locks are always taken registry first,
//! tracker second.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

use shardcast_api::{Failure, FailureKind, JobId, Slot};

use super::lock;
use super::worker::ShardReport;

/// Why a tracker became ready before every shard reported.
#[derive(Debug, Clone)]
enum Forced {
    Interrupted(Failure),
    Terminated,
}

/// What the submitter gets back from [`JobTracker::wait`].
#[derive(Debug)]
pub(crate) enum WaitOutcome<O> {
    /// Every shard reported; one slot per unit in unit order.
    Complete(Vec<Slot<O>>),
    Interrupted(Failure),
    Terminated,
    TimedOut,
}

struct TrackerState<O> {
    reports: Vec<Option<Vec<Slot<O>>>>,
    received: usize,
    ready: bool,
    forced: Option<Forced>,
    abandoned: bool,
}

pub(crate) struct JobTracker<O> {
    job_id: JobId,
    expected: usize,
    state: Mutex<TrackerState<O>>,
    ready: Condvar,
}

impl<O> JobTracker<O> {
    pub fn new(job_id: JobId, shard_count: usize) -> Self {
        Self {
            job_id,
            expected: shard_count,
            state: Mutex::new(TrackerState {
                reports: (0..shard_count).map(|_| None).collect(),
                received: 0,
                ready: shard_count == 0,
                forced: None,
                abandoned: false,
            }),
            ready: Condvar::new(),
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Record a shard report. Returns `true` if this made the tracker ready.
    pub fn deliver(&self, report: ShardReport<O>) -> bool {
        let mut state = lock(&self.state);
        if state.ready || state.abandoned {
            return false;
        }
        let slot = match state.reports.get_mut(report.shard) {
            Some(slot) if slot.is_none() => slot,
            _ => return false,
        };

        let interrupt = report.interrupt().cloned();
        *slot = Some(report.slots);
        state.received += 1;

        if let Some(failure) = interrupt {
            state.forced = Some(Forced::Interrupted(failure));
            state.ready = true;
        } else if state.received == self.expected {
            state.ready = true;
        }

        if state.ready {
            self.ready.notify_all();
        }
        state.ready
    }

    /// Fill `shard` with worker-lost failures, one per unit name.
    pub fn mark_lost(&self, shard: usize, units: &[String]) -> bool {
        let slots = units
            .iter()
            .map(|unit| {
                Err(Failure::new(unit.as_str(), FailureKind::WorkerLost, "worker thread exited before reporting")
                    .with_job(self.job_id, shard))
            })
            .collect();
        self.deliver(ShardReport {
            job_id: self.job_id,
            shard,
            slots,
            interrupted: false,
        })
    }

    pub fn force_interrupt(&self, failure: Failure) {
        self.force(Forced::Interrupted(failure));
    }

    pub fn force_terminated(&self) {
        self.force(Forced::Terminated);
    }

    fn force(&self, reason: Forced) {
        let mut state = lock(&self.state);
        if state.ready {
            return;
        }
        state.forced = Some(reason);
        state.ready = true;
        self.ready.notify_all();
    }

    /// Block until ready or until `timeout` elapses. `None` waits forever.
    ///
    /// On timeout the tracker is marked abandoned under its own lock, so a
    /// completion racing the deadline is either observed here or ignored.
    pub fn wait(&self, timeout: Option<Duration>) -> WaitOutcome<O> {
        let guard = lock(&self.state);
        let mut state = match timeout {
            Some(timeout) => {
                let (mut state, result) = self
                    .ready
                    .wait_timeout_while(guard, timeout, |s| !s.ready)
                    .unwrap_or_else(PoisonError::into_inner);
                if result.timed_out() && !state.ready {
                    state.abandoned = true;
                    return WaitOutcome::TimedOut;
                }
                state
            }
            None => self
                .ready
                .wait_while(guard, |s| !s.ready)
                .unwrap_or_else(PoisonError::into_inner),
        };

        match state.forced.take() {
            Some(Forced::Interrupted(failure)) => WaitOutcome::Interrupted(failure),
            Some(Forced::Terminated) => WaitOutcome::Terminated,
            None => {
                let slots = state
                    .reports
                    .iter_mut()
                    .filter_map(Option::take)
                    .flatten()
                    .collect();
                WaitOutcome::Complete(slots)
            }
        }
    }
}

/// Job id to tracker map shared by submitters and the collector.
pub(crate) struct TrackerRegistry<O> {
    trackers: Mutex<HashMap<JobId, Arc<JobTracker<O>>>>,
}

impl<O> TrackerRegistry<O> {
    pub fn new() -> Self {
        Self {
            trackers: Mutex::new(HashMap::new()),
        }
    }

    pub fn insert(&self, tracker: Arc<JobTracker<O>>) {
        lock(&self.trackers).insert(tracker.job_id(), tracker);
    }

    pub fn remove(&self, job_id: JobId) -> Option<Arc<JobTracker<O>>> {
        lock(&self.trackers).remove(&job_id)
    }

    pub fn len(&self) -> usize {
        lock(&self.trackers).len()
    }

    /// Hand a report to its tracker, reaping the tracker once ready.
    /// Returns `false` for reports nobody is waiting on.
    pub fn route(&self, report: ShardReport<O>) -> bool {
        let mut trackers = lock(&self.trackers);
        let job_id = report.job_id;
        let Some(tracker) = trackers.get(&job_id) else {
            tracing::trace!(job_id, shard = report.shard, "dropping late report");
            return false;
        };
        if tracker.deliver(report) {
            trackers.remove(&job_id);
        }
        true
    }

    /// Force every pending tracker ready with `failure`. Returns how many.
    pub fn interrupt_all(&self, failure: &Failure) -> usize {
        let drained: Vec<_> = lock(&self.trackers).drain().collect();
        for (_, tracker) in &drained {
            tracker.force_interrupt(failure.clone());
        }
        drained.len()
    }

    /// Release every pending tracker with a terminated outcome.
    pub fn terminate_all(&self) -> usize {
        let drained: Vec<_> = lock(&self.trackers).drain().collect();
        for (_, tracker) in &drained {
            tracker.force_terminated();
        }
        drained.len()
    }

    /// Fill `shard` of every pending tracker with worker-lost failures.
    pub fn fail_shard(&self, shard: usize, units: &[String]) -> usize {
        let mut trackers = lock(&self.trackers);
        let ready: Vec<JobId> = trackers
            .values()
            .filter(|tracker| tracker.mark_lost(shard, units))
            .map(|tracker| tracker.job_id())
            .collect();
        for job_id in &ready {
            trackers.remove(job_id);
        }
        ready.len()
    }
}
