//! # Shard Worker
//!
//! A worker is a dedicated OS thread owning one shard of the unit list. It
//! takes jobs from its inbound channel in FIFO order, runs the job's action on
//! every unit of its shard in order, and sends exactly one report per job on
//! its outbound channel.
//!
//! ## Failure isolation
//! - A unit returning an error or panicking fills its own slot with a
//!   `Failure`; the remaining units of the shard still run.
//! - A unit returning `UnitError::Interrupted` stops the shard: the remaining
//!   slots are filled with interrupt markers, the report is tagged, queued
//!   jobs are answered with interrupt reports, and the thread exits.

use std::backtrace::{Backtrace, BacktraceStatus};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use shardcast_api::{
    BoxedUnit, DispatchError, Failure, FailureKind, JobId, SharedHandles, Slot, UnitContext,
    UnitError,
};

use super::config::DispatcherConfig;
use crate::{job_span, log_worker};

/// A job as seen by a worker.
pub(crate) struct JobRequest<P> {
    pub job_id: JobId,
    pub action: Arc<str>,
    pub payload: Arc<P>,
}

/// Messages on a worker's inbound channel.
pub(crate) enum Task<P> {
    Run(JobRequest<P>),
    /// Poison pill.
    Shutdown,
}

/// One worker's contribution to a job: one slot per unit of the shard.
#[derive(Debug)]
pub(crate) struct ShardReport<O> {
    pub job_id: JobId,
    pub shard: usize,
    pub slots: Vec<Slot<O>>,
    /// Set when a unit of this shard observed an operator interrupt.
    pub interrupted: bool,
}

impl<O> ShardReport<O> {
    /// The interrupt failure carried by this report, if any.
    pub fn interrupt(&self) -> Option<&Failure> {
        if !self.interrupted {
            return None;
        }
        self.slots
            .iter()
            .filter_map(|slot| slot.as_ref().err())
            .find(|failure| failure.is_interrupt())
    }
}

/// States a worker can be in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Waiting for or running jobs
    Running = 0,
    /// Draining its queue after an interrupt
    ShuttingDown = 1,
    /// Thread has exited
    Stopped = 2,
}

impl WorkerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => WorkerState::Running,
            1 => WorkerState::ShuttingDown,
            _ => WorkerState::Stopped,
        }
    }
}

/// Handle to a worker thread, owned by the dispatcher.
pub(crate) struct Worker<P> {
    shard: usize,
    inbound: flume::Sender<Task<P>>,
    thread: Option<JoinHandle<()>>,
    state: Arc<AtomicU8>,
}

impl<P: Send + Sync + 'static> Worker<P> {
    /// Spawn the worker thread for `shard`, returning its handle and the
    /// receiving end of its outbound report channel.
    pub fn spawn<O: Send + 'static>(
        shard: usize,
        units: Vec<BoxedUnit<P, O>>,
        shared: Arc<SharedHandles>,
        halt: Arc<AtomicBool>,
        config: &DispatcherConfig,
        dispatch: tracing::Dispatch,
    ) -> Result<(Self, flume::Receiver<ShardReport<O>>), DispatchError> {
        let (inbound_tx, inbound_rx) = match config.inbound_capacity {
            Some(capacity) => flume::bounded(capacity),
            None => flume::unbounded(),
        };
        let (outbound_tx, outbound_rx) = flume::unbounded();
        let state = Arc::new(AtomicU8::new(WorkerState::Running as u8));

        let runner = ShardRunner {
            shard,
            units,
            shared,
            halt,
            inbound: inbound_rx,
            outbound: outbound_tx,
            state: Arc::clone(&state),
        };

        let thread = std::thread::Builder::new()
            .name(format!("{}-worker-{}", config.thread_name_prefix, shard))
            .spawn(move || tracing::dispatcher::with_default(&dispatch, || runner.run()))
            .map_err(|e| DispatchError::WorkerSpawn(format!("shard {}: {}", shard, e)))?;

        let worker = Self {
            shard,
            inbound: inbound_tx,
            thread: Some(thread),
            state,
        };
        Ok((worker, outbound_rx))
    }


}

/// Why a task could not be queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SendFailure {
    /// The worker thread has exited.
    Gone,
    /// A bounded queue stayed full until the deadline.
    Full,
}

/// Sending side of one worker's queue, usable without the worker list lock.
pub(crate) struct WorkerSender<P> {
    shard: usize,
    inbound: flume::Sender<Task<P>>,
}

impl<P> WorkerSender<P> {
    pub fn shard(&self) -> usize {
        self.shard
    }

    /// Queue a task, waiting for room in a bounded queue until `deadline`.
    pub fn send(&self, task: Task<P>, deadline: Option<Instant>) -> Result<(), SendFailure> {
        match deadline {
            Some(deadline) => self.inbound.send_deadline(task, deadline).map_err(|err| match err {
                flume::SendTimeoutError::Timeout(_) => SendFailure::Full,
                flume::SendTimeoutError::Disconnected(_) => SendFailure::Gone,
            }),
            None => self.inbound.send(task).map_err(|_| SendFailure::Gone),
        }
    }
}

impl<P> Worker<P> {
    pub fn sender(&self) -> WorkerSender<P> {
        WorkerSender {
            shard: self.shard,
            inbound: self.inbound.clone(),
        }
    }

    /// Send the poison pill. A worker that already exited is fine.
    pub fn shutdown(&self) {
        let _ = self.inbound.send(Task::Shutdown);
    }

    /// Wait for the thread to exit. Errors carry the panic message.
    pub fn join(&mut self) -> Result<(), String> {
        match self.thread.take() {
            Some(handle) => handle.join().map_err(|e| {
                format!("worker for shard {} panicked: {}", self.shard, panic_message(&*e))
            }),
            None => Ok(()),
        }
    }

    pub fn shard(&self) -> usize {
        self.shard
    }

    pub fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_alive(&self) -> bool {
        self.state() == WorkerState::Running
    }
}

/// Marks the worker stopped however the thread exits.
struct StoppedOnDrop(Arc<AtomicU8>);

impl Drop for StoppedOnDrop {
    fn drop(&mut self) {
        self.0.store(WorkerState::Stopped as u8, Ordering::SeqCst);
    }
}

/// State moved onto the worker thread.
struct ShardRunner<P, O> {
    shard: usize,
    units: Vec<BoxedUnit<P, O>>,
    shared: Arc<SharedHandles>,
    /// Set by the dispatcher on terminate; queued jobs are skipped.
    halt: Arc<AtomicBool>,
    inbound: flume::Receiver<Task<P>>,
    outbound: flume::Sender<ShardReport<O>>,
    state: Arc<AtomicU8>,
}

impl<P: Send + Sync + 'static, O: Send + 'static> ShardRunner<P, O> {
    fn run(self) {
        let _stopped = StoppedOnDrop(Arc::clone(&self.state));
        log_worker!(self.shard, "started", units = self.units.len());

        loop {
            let job = match self.inbound.recv() {
                Ok(Task::Run(job)) => job,
                Ok(Task::Shutdown) => {
                    log_worker!(self.shard, "poison_pill");
                    break;
                }
                Err(_) => {
                    log_worker!(self.shard, "inbound_closed");
                    break;
                }
            };

            if self.halt.load(Ordering::SeqCst) {
                log_worker!(self.shard, "skipped_after_halt", job_id = job.job_id);
                continue;
            }

            let span = job_span!(job.job_id, job.action, shard = self.shard);
            let _guard = span.enter();

            let report = self.execute(&job);
            let interrupted = report.interrupted;
            if self.outbound.send(report).is_err() {
                log_worker!(self.shard, "collector_gone", job_id = job.job_id);
                break;
            }

            if interrupted {
                self.state.store(WorkerState::ShuttingDown as u8, Ordering::SeqCst);
                self.drain_after_interrupt();
                break;
            }
        }

        log_worker!(self.shard, "stopped");
    }

    fn execute(&self, job: &JobRequest<P>) -> ShardReport<O> {
        let ctx = UnitContext::new(
            job.job_id,
            self.shard,
            Arc::clone(&job.action),
            Arc::clone(&self.shared),
        );
        let mut slots = Vec::with_capacity(self.units.len());
        let mut interrupted = false;

        for unit in &self.units {
            if interrupted {
                slots.push(Err(self.interrupt_marker(unit.name(), job.job_id, "skipped after operator interrupt")));
                continue;
            }

            if !unit.supports(&job.action) {
                let err = UnitError::unknown_action(unit.name(), job.action.as_ref());
                slots.push(Err(Failure::from_unit_error(unit.name(), err).with_job(job.job_id, self.shard)));
                continue;
            }

            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                unit.invoke(&job.action, job.payload.as_ref(), &ctx)
            }));

            let slot = match outcome {
                Ok(Ok(results)) => Ok(results),
                Ok(Err(err)) => {
                    let failure =
                        Failure::from_unit_error(unit.name(), err).with_job(job.job_id, self.shard);
                    if failure.is_interrupt() {
                        interrupted = true;
                        tracing::error!(
                            unit = %failure.unit,
                            job_id = job.job_id,
                            shard = self.shard,
                            reason = %failure.message,
                            "operator interrupt observed, shutting worker down"
                        );
                    } else {
                        tracing::warn!(
                            unit = %failure.unit,
                            job_id = job.job_id,
                            shard = self.shard,
                            kind = %failure.kind,
                            "work unit failed: {}",
                            failure.message
                        );
                    }
                    Err(failure)
                }
                Err(panic) => {
                    let failure = Failure::new(unit.name(), FailureKind::Panic, panic_message(&*panic))
                        .with_job(job.job_id, self.shard)
                        .with_trace(capture_trace());
                    tracing::warn!(
                        unit = %failure.unit,
                        job_id = job.job_id,
                        shard = self.shard,
                        "work unit panicked: {}",
                        failure.message
                    );
                    Err(failure)
                }
            };
            slots.push(slot);
        }

        ShardReport {
            job_id: job.job_id,
            shard: self.shard,
            slots,
            interrupted,
        }
    }

    /// Answer every job still queued behind an interrupt so no tracker waits
    /// on this shard, stopping at the poison pill.
    fn drain_after_interrupt(&self) {
        let mut drained = 0usize;
        while let Ok(task) = self.inbound.try_recv() {
            let job = match task {
                Task::Run(job) => job,
                Task::Shutdown => break,
            };
            let slots = self
                .units
                .iter()
                .map(|unit| Err(self.interrupt_marker(unit.name(), job.job_id, "worker stopped by operator interrupt")))
                .collect();
            let report = ShardReport {
                job_id: job.job_id,
                shard: self.shard,
                slots,
                interrupted: true,
            };
            if self.outbound.send(report).is_err() {
                break;
            }
            drained += 1;
        }
        log_worker!(self.shard, "drained_after_interrupt", jobs = drained);
    }

    fn interrupt_marker(&self, unit: &str, job_id: JobId, message: &str) -> Failure {
        Failure::new(unit, FailureKind::Interrupted, message).with_job(job_id, self.shard)
    }
}

/// Extract a readable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else {
        "Unknown panic".to_string()
    }
}

fn capture_trace() -> Option<String> {
    let backtrace = Backtrace::capture();
    match backtrace.status() {
        BacktraceStatus::Captured => Some(backtrace.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardcast_api::{UnitResult, WorkUnit};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct Echo {
        name: String,
        mode: &'static str,
    }

    impl WorkUnit for Echo {
        type Payload = u32;
        type Output = String;

        fn name(&self) -> &str {
            &self.name
        }

        fn invoke(&self, action: &str, payload: &u32, _ctx: &UnitContext) -> UnitResult<String> {
            match self.mode {
                "fail" => Err(UnitError::failed("value", "bad input")),
                "panic" => panic!("unit exploded"),
                "interrupt" => Err(UnitError::interrupted("ctrl-c")),
                "empty" => Ok(vec![]),
                "sleep" => {
                    std::thread::sleep(Duration::from_millis(300));
                    Ok(vec![])
                }
                _ => Ok(vec![format!("{}:{}:{}", self.name, action, payload)]),
            }
        }
    }

    fn unit(name: &str, mode: &'static str) -> BoxedUnit<u32, String> {
        Arc::new(Echo { name: name.to_string(), mode })
    }

    fn spawn(units: Vec<BoxedUnit<u32, String>>) -> (Worker<u32>, flume::Receiver<ShardReport<String>>) {
        Worker::spawn(
            3,
            units,
            Arc::new(SharedHandles::new()),
            Arc::new(AtomicBool::new(false)),
            &DispatcherConfig::default(),
            crate::logging::current_subscriber(),
        )
        .unwrap()
    }

    fn run_job(worker: &Worker<u32>, job_id: JobId, payload: u32) {
        let job = JobRequest { job_id, action: Arc::from("grep"), payload: Arc::new(payload) };
        assert!(worker.sender().send(Task::Run(job), None).is_ok());
    }

    #[test]
    fn test_one_slot_per_unit_in_order() {
        let (mut worker, reports) = spawn(vec![unit("a", "ok"), unit("b", "empty"), unit("c", "ok")]);
        run_job(&worker, 1, 7);

        let report = reports.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(report.job_id, 1);
        assert_eq!(report.shard, 3);
        assert!(!report.interrupted);
        assert_eq!(report.slots.len(), 3);
        assert_eq!(report.slots[0].as_ref().unwrap(), &vec!["a:grep:7".to_string()]);
        assert!(report.slots[1].as_ref().unwrap().is_empty());
        assert_eq!(report.slots[2].as_ref().unwrap(), &vec!["c:grep:7".to_string()]);

        worker.shutdown();
        assert!(worker.join().is_ok());
        assert_eq!(worker.state(), WorkerState::Stopped);
    }

    #[test]
    fn test_failures_are_isolated() {
        let (mut worker, reports) = spawn(vec![unit("a", "fail"), unit("b", "panic"), unit("c", "ok")]);
        run_job(&worker, 4, 1);

        let report = reports.recv_timeout(Duration::from_secs(5)).unwrap();
        let first = report.slots[0].as_ref().unwrap_err();
        assert_eq!(first.unit, "a");
        assert_eq!(first.kind, FailureKind::Error("value".to_string()));
        assert_eq!(first.job_id, 4);
        assert_eq!(first.shard, 3);

        let second = report.slots[1].as_ref().unwrap_err();
        assert_eq!(second.kind, FailureKind::Panic);
        assert!(second.message.contains("unit exploded"));

        assert!(report.slots[2].is_ok());
        assert!(worker.is_alive());

        worker.shutdown();
        worker.join().unwrap();
    }

    #[test]
    fn test_interrupt_stops_shard_and_drains_queue() {
        let (mut worker, reports) = spawn(vec![unit("a", "ok"), unit("b", "interrupt"), unit("c", "ok")]);
        run_job(&worker, 1, 0);
        run_job(&worker, 2, 0);

        let first = reports.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(first.interrupted);
        assert_eq!(first.slots.len(), 3);
        assert!(first.slots[0].is_ok());
        assert_eq!(first.interrupt().map(|f| f.unit.as_str()), Some("b"));
        assert!(first.slots[2].as_ref().unwrap_err().is_interrupt());

        worker.join().unwrap();
        assert_eq!(worker.state(), WorkerState::Stopped);

        // job 2 was either drained with an interrupt report or never dequeued
        if let Ok(second) = reports.try_recv() {
            assert_eq!(second.job_id, 2);
            assert!(second.interrupted);
            assert!(second.slots.iter().all(|s| s.as_ref().unwrap_err().is_interrupt()));
        }
        assert_eq!(worker.sender().send(Task::Shutdown, None), Err(SendFailure::Gone));
    }

    struct Declared {
        calls: AtomicUsize,
    }

    impl WorkUnit for Declared {
        type Payload = u32;
        type Output = String;

        fn name(&self) -> &str {
            "declared"
        }

        fn actions(&self) -> &[&'static str] {
            &["grep"]
        }

        fn invoke(&self, action: &str, _payload: &u32, _ctx: &UnitContext) -> UnitResult<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![action.to_string()])
        }
    }

    #[test]
    fn test_undeclared_action_skips_unit() {
        let declared = Arc::new(Declared { calls: AtomicUsize::new(0) });
        let (mut worker, reports) = spawn(vec![declared.clone() as BoxedUnit<u32, String>, unit("b", "ok")]);
        let job = JobRequest { job_id: 5, action: Arc::from("audit"), payload: Arc::new(1) };
        assert!(worker.sender().send(Task::Run(job), None).is_ok());

        let report = reports.recv_timeout(Duration::from_secs(5)).unwrap();
        let failure = report.slots[0].as_ref().unwrap_err();
        assert_eq!(failure.unit, "declared");
        assert_eq!(failure.kind, FailureKind::Error("unknown_action".to_string()));
        assert_eq!(failure.job_id, 5);
        assert_eq!(declared.calls.load(Ordering::SeqCst), 0);

        // units without declared actions accept any action
        assert_eq!(report.slots[1].as_ref().unwrap(), &vec!["b:audit:1".to_string()]);

        worker.shutdown();
        worker.join().unwrap();
    }

    #[test]
    fn test_send_gives_up_on_full_queue() {
        let config = DispatcherConfig::default().with_inbound_capacity(1);
        let (mut worker, reports) = Worker::spawn(
            0,
            vec![unit("slow", "sleep")],
            Arc::new(SharedHandles::new()),
            Arc::new(AtomicBool::new(false)),
            &config,
            crate::logging::current_subscriber(),
        )
        .unwrap();
        let sender = worker.sender();
        let job = |job_id| Task::Run(JobRequest { job_id, action: Arc::from("grep"), payload: Arc::new(0) });

        // first job is picked up, second one fills the queue
        assert!(sender.send(job(1), None).is_ok());
        std::thread::sleep(Duration::from_millis(50));
        assert!(sender.send(job(2), None).is_ok());

        let started = Instant::now();
        let deadline = Some(started + Duration::from_millis(20));
        assert_eq!(sender.send(job(3), deadline), Err(SendFailure::Full));
        assert!(started.elapsed() < Duration::from_millis(200));

        assert_eq!(reports.recv_timeout(Duration::from_secs(5)).unwrap().job_id, 1);
        assert_eq!(reports.recv_timeout(Duration::from_secs(5)).unwrap().job_id, 2);
        worker.shutdown();
        worker.join().unwrap();
        assert_eq!(sender.send(job(4), None), Err(SendFailure::Gone));
    }
}
