//! Result collector: fans in every worker's outbound channel and routes
//! reports to job trackers.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use shardcast_api::DispatchError;

use super::dispatcher::PoolShared;
use super::tracker::TrackerRegistry;
use super::worker::ShardReport;
use crate::log_worker;

pub(crate) struct ResultCollector<O> {
    dispatcher_id: String,
    receivers: Vec<flume::Receiver<ShardReport<O>>>,
    /// Unit names per shard, used to fill the slots of a lost worker.
    layout: Arc<[Vec<String>]>,
    registry: Arc<TrackerRegistry<O>>,
    pool: Arc<PoolShared>,
    poll_interval: Duration,
}

enum Event<O> {
    Report(ShardReport<O>),
    Disconnected(usize),
}

impl<O: Send + 'static> ResultCollector<O> {
    pub fn new(
        dispatcher_id: String,
        receivers: Vec<flume::Receiver<ShardReport<O>>>,
        layout: Arc<[Vec<String>]>,
        registry: Arc<TrackerRegistry<O>>,
        pool: Arc<PoolShared>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            dispatcher_id,
            receivers,
            layout,
            registry,
            pool,
            poll_interval,
        }
    }

    pub fn spawn(self, thread_name: String, dispatch: tracing::Dispatch) -> Result<JoinHandle<()>, DispatchError> {
        std::thread::Builder::new()
            .name(thread_name)
            .spawn(move || tracing::dispatcher::with_default(&dispatch, || self.run()))
            .map_err(|e| DispatchError::WorkerSpawn(format!("result collector: {}", e)))
    }

    fn run(self) {
        let mut open: Vec<usize> = (0..self.receivers.len()).collect();
        tracing::debug!(dispatcher = %self.dispatcher_id, shards = open.len(), "result collector started");

        while !self.pool.collector_stop.load(Ordering::SeqCst) && !open.is_empty() {
            let mut selector = flume::Selector::new();
            for &shard in &open {
                selector = selector.recv(&self.receivers[shard], move |result| match result {
                    Ok(report) => Event::Report(report),
                    Err(_) => Event::Disconnected(shard),
                });
            }

            match selector.wait_timeout(self.poll_interval) {
                Ok(Event::Report(report)) => self.handle_report(report),
                Ok(Event::Disconnected(shard)) => {
                    open.retain(|s| *s != shard);
                    self.handle_disconnect(shard);
                }
                // poll interval elapsed, re-check the stop flag
                Err(_) => {}
            }
        }

        tracing::debug!(dispatcher = %self.dispatcher_id, "result collector stopped");
    }

    fn handle_report(&self, report: ShardReport<O>) {
        if let Some(failure) = report.interrupt().cloned() {
            tracing::error!(
                dispatcher = %self.dispatcher_id,
                unit = %failure.unit,
                job_id = failure.job_id,
                "operator interrupt, releasing pending jobs"
            );
            // record before releasing so racing submitters see it
            self.pool.record_interrupt(failure.clone());
            let released = self.registry.interrupt_all(&failure);
            tracing::debug!(released, "pending jobs interrupted");
            return;
        }

        let job_id = report.job_id;
        let shard = report.shard;
        if self.registry.route(report) {
            tracing::trace!(job_id, shard, "report routed");
        }
    }

    fn handle_disconnect(&self, shard: usize) {
        if !self.pool.is_running() || self.pool.interrupt().is_some() {
            log_worker!(shard, "channel_closed");
            return;
        }

        tracing::error!(
            dispatcher = %self.dispatcher_id,
            shard,
            "worker lost, failing its units for pending jobs"
        );
        let units = self.layout.get(shard).map(Vec::as_slice).unwrap_or_default();
        let completed = self.registry.fail_shard(shard, units);
        tracing::debug!(shard, completed, "pending jobs completed with worker-lost slots");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::tracker::{JobTracker, WaitOutcome};
    use shardcast_api::FailureKind;

    fn collector(
        receivers: Vec<flume::Receiver<ShardReport<u32>>>,
        layout: Vec<Vec<String>>,
        registry: &Arc<TrackerRegistry<u32>>,
        pool: &Arc<PoolShared>,
    ) -> JoinHandle<()> {
        ResultCollector::new(
            "test".to_string(),
            receivers,
            Arc::from(layout),
            Arc::clone(registry),
            Arc::clone(pool),
            Duration::from_millis(5),
        )
        .spawn("test-collector".to_string(), crate::logging::current_subscriber())
        .unwrap()
    }

    #[test]
    fn test_closed_channel_fails_pending_jobs() {
        let (tx0, rx0) = flume::unbounded();
        let (tx1, rx1) = flume::unbounded::<ShardReport<u32>>();
        let registry = Arc::new(TrackerRegistry::new());
        let pool = Arc::new(PoolShared::new());
        let tracker = Arc::new(JobTracker::new(1, 2));
        registry.insert(Arc::clone(&tracker));

        let layout = vec![vec!["a".to_string()], vec!["b".to_string(), "c".to_string()]];
        let handle = collector(vec![rx0, rx1], layout, &registry, &pool);

        tx0.send(ShardReport { job_id: 1, shard: 0, slots: vec![Ok(vec![7u32])], interrupted: false })
            .unwrap();
        // shard 1's worker dies without reporting
        drop(tx1);

        match tracker.wait(Some(Duration::from_secs(5))) {
            WaitOutcome::Complete(slots) => {
                assert_eq!(slots.len(), 3);
                assert_eq!(slots[0].as_ref().unwrap(), &vec![7u32]);
                for (slot, unit) in slots[1..].iter().zip(["b", "c"]) {
                    let failure = slot.as_ref().unwrap_err();
                    assert_eq!(failure.kind, FailureKind::WorkerLost);
                    assert_eq!(failure.unit, unit);
                    assert_eq!(failure.job_id, 1);
                }
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(registry.len(), 0);

        pool.collector_stop.store(true, Ordering::SeqCst);
        drop(tx0);
        handle.join().unwrap();
    }

    #[test]
    fn test_closed_channel_after_stop_is_quiet() {
        let (tx, rx) = flume::unbounded::<ShardReport<u32>>();
        let registry = Arc::new(TrackerRegistry::new());
        let pool = Arc::new(PoolShared::new());
        let tracker = Arc::new(JobTracker::new(2, 1));
        registry.insert(Arc::clone(&tracker));
        registry.interrupt_all(&shardcast_api::Failure::new("x", FailureKind::Interrupted, "stop"));
        pool.record_interrupt(shardcast_api::Failure::new("x", FailureKind::Interrupted, "stop"));

        let handle = collector(vec![rx], vec![vec!["x".to_string()]], &registry, &pool);
        drop(tx);
        // every channel closed: the collector exits on its own
        handle.join().unwrap();
        assert!(matches!(tracker.wait(None), WaitOutcome::Interrupted(_)));
    }
}
