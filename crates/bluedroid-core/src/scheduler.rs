//! Periodic per-channel sampling of one connected peripheral.
//!
//! Each [`PollingTask`] is a spawned loop driven by a tokio interval and
//! stopped through a cancellation token. At most one read per task is in
//! flight: ticks that arrive while a read is pending are skipped, and the
//! next tick is measured from the moment the pending read completes.
//!
//! Reads are polled inside the task itself, so cancelling a task drops any
//! read still in progress and its result is never logged or published.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::FutureExt;
use futures::future::{BoxFuture, join_all};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use bluedroid_types::{ChannelKind, Event, PeripheralHandle, Sample, SamplePayload};

use crate::driver::PeripheralDriver;
use crate::error::Result;
use crate::registry::SubscriberRegistry;
use crate::sample_log::SampleLog;

/// Identifies a polling task within its scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Counters kept by a running task.
#[derive(Debug, Default)]
pub struct PollingStats {
    completed: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
}

/// Point-in-time copy of [`PollingStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PollingStatsSnapshot {
    /// Reads that produced a sample.
    pub completed: u64,
    /// Reads that returned an error.
    pub failed: u64,
    /// Ticks dropped because a read was still pending.
    pub skipped: u64,
}

impl PollingStats {
    pub fn snapshot(&self) -> PollingStatsSnapshot {
        PollingStatsSnapshot {
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
        }
    }
}

/// A running periodic sampler for one channel.
#[derive(Debug)]
pub struct PollingTask {
    id: TaskId,
    channel: ChannelKind,
    period: Duration,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
    stats: Arc<PollingStats>,
}

impl PollingTask {
    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn channel(&self) -> ChannelKind {
        self.channel
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Whether the loop is still able to tick.
    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled() && !self.handle.is_finished()
    }

    pub fn stats(&self) -> PollingStatsSnapshot {
        self.stats.snapshot()
    }

    async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await
            && e.is_panic()
        {
            warn!("{} poller {} panicked", self.channel, self.id);
        }
    }
}

/// Where a poller reads from and where its samples go.
struct PollTarget {
    driver: Arc<dyn PeripheralDriver>,
    peripheral: PeripheralHandle,
    logs: Arc<SampleLog>,
    registry: Arc<SubscriberRegistry>,
}

/// Owns the polling tasks of one peripheral.
///
/// Dropping the scheduler cancels every task without waiting; use
/// [`PollingScheduler::stop_all`] for a synchronous teardown.
pub struct PollingScheduler {
    target: Arc<PollTarget>,
    tasks: HashMap<TaskId, PollingTask>,
    next_id: u64,
}

impl std::fmt::Debug for PollingScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollingScheduler")
            .field("peripheral", &self.target.peripheral.address)
            .field("tasks", &self.tasks.len())
            .finish()
    }
}

impl PollingScheduler {
    pub fn new(
        driver: Arc<dyn PeripheralDriver>,
        peripheral: PeripheralHandle,
        logs: Arc<SampleLog>,
        registry: Arc<SubscriberRegistry>,
    ) -> Self {
        Self {
            target: Arc::new(PollTarget {
                driver,
                peripheral,
                logs,
                registry,
            }),
            tasks: HashMap::new(),
            next_id: 0,
        }
    }

    /// Start sampling `channel` every `period`.
    ///
    /// The first read happens one period after the call. Must be called from
    /// within a tokio runtime.
    pub fn start(&mut self, channel: ChannelKind, period: Duration) -> TaskId {
        let id = TaskId(self.next_id);
        self.next_id += 1;

        let cancel = CancellationToken::new();
        let stats = Arc::new(PollingStats::default());
        let handle = tokio::spawn(run_poller(
            Arc::clone(&self.target),
            channel,
            period,
            cancel.clone(),
            Arc::clone(&stats),
        ));

        info!(
            "Polling {} on {} every {:?}",
            channel, self.target.peripheral.address, period
        );
        self.tasks.insert(
            id,
            PollingTask {
                id,
                channel,
                period,
                cancel,
                handle,
                stats,
            },
        );
        id
    }

    /// Stop one task and wait until it can no longer tick.
    ///
    /// Returns `false` if no such task is running; stopping twice is harmless.
    pub async fn stop(&mut self, id: TaskId) -> bool {
        match self.tasks.remove(&id) {
            Some(task) => {
                task.shutdown().await;
                debug!("Stopped poller {}", id);
                true
            }
            None => false,
        }
    }

    /// Stop every task, cancelling all before waiting on any.
    pub async fn stop_all(&mut self) {
        if self.tasks.is_empty() {
            return;
        }
        let tasks: Vec<PollingTask> = self.tasks.drain().map(|(_, task)| task).collect();
        for task in &tasks {
            task.cancel.cancel();
        }
        let count = tasks.len();
        join_all(tasks.into_iter().map(PollingTask::shutdown)).await;
        debug!(
            "Stopped {} poller(s) for {}",
            count, self.target.peripheral.address
        );
    }

    pub fn task(&self, id: TaskId) -> Option<&PollingTask> {
        self.tasks.get(&id)
    }

    pub fn task_ids(&self) -> Vec<TaskId> {
        let mut ids: Vec<TaskId> = self.tasks.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

impl Drop for PollingScheduler {
    fn drop(&mut self) {
        for task in self.tasks.values() {
            task.cancel.cancel();
        }
    }
}

async fn run_poller(
    target: Arc<PollTarget>,
    channel: ChannelKind,
    period: Duration,
    cancel: CancellationToken,
    stats: Arc<PollingStats>,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut pending: Option<BoxFuture<'static, Result<Sample>>> = None;

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,

            result = async {
                match pending.as_mut() {
                    Some(read) => read.await,
                    None => std::future::pending().await,
                }
            } => {
                pending = None;
                ticker.reset();
                handle_result(&target, channel, result, &stats);
            }

            _ = ticker.tick() => {
                if pending.is_some() {
                    stats.skipped.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                let driver = Arc::clone(&target.driver);
                let peripheral = target.peripheral.clone();
                pending = Some(
                    async move { driver.read_sample(&peripheral, channel).await }.boxed(),
                );
            }
        }
    }

    debug!("{} poller for {} exited", channel, target.peripheral.address);
}

fn handle_result(
    target: &PollTarget,
    channel: ChannelKind,
    result: Result<Sample>,
    stats: &PollingStats,
) {
    let address = &target.peripheral.address;
    let sample = match result {
        Ok(sample) => sample,
        Err(e) => {
            stats.failed.fetch_add(1, Ordering::Relaxed);
            warn!("{} read failed for {}: {}", channel, address, e);
            target
                .registry
                .publish(Event::Status(format!("Read failed for {}: {}", address, e)));
            return;
        }
    };
    stats.completed.fetch_add(1, Ordering::Relaxed);

    if let Err(e) = target.logs.append(&sample) {
        warn!("Dropped {} sample from {}: {}", channel, address, e);
        target.registry.publish(Event::Status(format!(
            "Could not save {} sample from {}: {}",
            channel, address, e
        )));
    }

    let event = match (sample.channel, sample.payload) {
        (_, SamplePayload::Acceleration(accel)) => Event::AccelerometerReading(accel),
        (ChannelKind::Battery, SamplePayload::Value(level)) => {
            Event::BatteryLevel(level.clamp(0, 100) as u8)
        }
        (_, SamplePayload::Value(v)) => Event::Status(format!("RSSI data for {}: {}", address, v)),
    };
    target.registry.publish(event);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::ConnectionEvent;
    use crate::mock::MockDriver;
    use bluedroid_types::Acceleration;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        driver: Arc<MockDriver>,
        logs: Arc<SampleLog>,
        registry: Arc<SubscriberRegistry>,
        scheduler: PollingScheduler,
    }

    async fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let logs = Arc::new(
            SampleLog::open(
                dir.path(),
                &[
                    (ChannelKind::Accelerometer, "accelerometer.csv".to_string()),
                    (ChannelKind::Rssi, "rssi.csv".to_string()),
                    (ChannelKind::Battery, "battery.csv".to_string()),
                ],
            )
            .unwrap(),
        );
        let registry = Arc::new(SubscriberRegistry::new());
        let driver = Arc::new(MockDriver::builder().acceleration(1.0, 2.0, 3.0).build());
        let handle = driver.add_mock_peripheral();
        let mut events = driver.connect(&handle).await.unwrap();
        assert_eq!(events.recv().await, Some(ConnectionEvent::Connected));

        let scheduler = PollingScheduler::new(
            driver.clone(),
            handle,
            Arc::clone(&logs),
            Arc::clone(&registry),
        );
        Fixture {
            _dir: dir,
            driver,
            logs,
            registry,
            scheduler,
        }
    }

    fn lines(logs: &SampleLog, channel: ChannelKind) -> Vec<String> {
        std::fs::read_to_string(logs.path(channel).unwrap())
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_polls_once_per_period() {
        let mut fx = fixture().await;
        let (_, mut rx) = fx.registry.subscribe();

        let id = fx
            .scheduler
            .start(ChannelKind::Accelerometer, Duration::from_millis(100));
        tokio::time::sleep(Duration::from_millis(1050)).await;
        assert!(fx.scheduler.stop(id).await);
        fx.logs.close_all().unwrap();

        let records = lines(&fx.logs, ChannelKind::Accelerometer);
        assert_eq!(records.len(), 10);
        assert!(records[0].ends_with(", 1.000000, 2.000000, 3.000000"));

        let mut readings = 0;
        while let Ok(event) = rx.try_recv() {
            assert_eq!(
                event,
                Event::AccelerometerReading(Acceleration::new(1.0, 2.0, 3.0))
            );
            readings += 1;
        }
        assert_eq!(readings, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_reads_are_never_concurrent() {
        let mut fx = fixture().await;
        fx.driver.set_read_latency(Duration::from_millis(50));

        let id = fx
            .scheduler
            .start(ChannelKind::Accelerometer, Duration::from_millis(16));
        tokio::time::sleep(Duration::from_millis(500)).await;

        let stats = fx.scheduler.task(id).unwrap().stats();
        fx.scheduler.stop(id).await;

        assert_eq!(fx.driver.max_concurrent_reads(), 1);
        assert!(stats.skipped > 0);
        // each cycle is one 50 ms read plus one 16 ms period
        assert!((6..=8).contains(&stats.completed), "{stats:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_next_tick_counts_from_read_completion() {
        let mut fx = fixture().await;
        fx.driver.set_read_latency(Duration::from_millis(20));

        let id = fx
            .scheduler
            .start(ChannelKind::Accelerometer, Duration::from_millis(100));
        tokio::time::sleep(Duration::from_millis(1000)).await;
        let stats = fx.scheduler.task(id).unwrap().stats();
        fx.scheduler.stop(id).await;

        // reads finish at 120, 240, ..., 960 ms
        assert_eq!(stats.completed, 8, "{stats:?}");
        assert_eq!(stats.skipped, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_errors_keep_task_running() {
        let mut fx = fixture().await;
        let (_, mut rx) = fx.registry.subscribe();
        fx.driver.set_transient_failures(2);

        let id = fx
            .scheduler
            .start(ChannelKind::Battery, Duration::from_millis(100));
        tokio::time::sleep(Duration::from_millis(450)).await;
        let stats = fx.scheduler.task(id).unwrap().stats();
        fx.scheduler.stop_all().await;

        assert_eq!(stats.failed, 2);
        assert_eq!(stats.completed, 2);

        let events: Vec<Event> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert_eq!(events.len(), 4);
        assert!(events[0].as_status().unwrap().starts_with("Read failed for"));
        assert!(events[1].as_status().is_some());
        assert_eq!(events[2], Event::BatteryLevel(85));
        assert_eq!(events[3], Event::BatteryLevel(85));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rssi_publishes_status() {
        let mut fx = fixture().await;
        let (_, mut rx) = fx.registry.subscribe();
        fx.driver.set_rssi(-72);

        fx.scheduler
            .start(ChannelKind::Rssi, Duration::from_millis(100));
        tokio::time::sleep(Duration::from_millis(150)).await;
        fx.scheduler.stop_all().await;

        let status = rx.try_recv().unwrap();
        assert!(status.as_status().unwrap().starts_with("RSSI data for "));
        assert!(status.as_status().unwrap().ends_with(": -72"));
        fx.logs.close_all().unwrap();
        assert!(lines(&fx.logs, ChannelKind::Rssi)[0].ends_with(", -72"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_appends_after_stop() {
        let mut fx = fixture().await;
        fx.driver.set_read_latency(Duration::from_millis(30));

        let id = fx
            .scheduler
            .start(ChannelKind::Accelerometer, Duration::from_millis(10));
        // stop while a read is in flight
        tokio::time::sleep(Duration::from_millis(25)).await;
        fx.scheduler.stop(id).await;
        let reads = fx.driver.read_count();

        tokio::time::sleep(Duration::from_millis(500)).await;
        fx.logs.close_all().unwrap();
        assert_eq!(fx.driver.read_count(), reads);
        assert!(lines(&fx.logs, ChannelKind::Accelerometer).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_failure_reports_status() {
        let mut fx = fixture().await;
        let (_, mut rx) = fx.registry.subscribe();
        fx.logs.close(ChannelKind::Accelerometer).unwrap();

        let id = fx
            .scheduler
            .start(ChannelKind::Accelerometer, Duration::from_millis(100));
        tokio::time::sleep(Duration::from_millis(250)).await;
        let stats = fx.scheduler.task(id).unwrap().stats();
        fx.scheduler.stop(id).await;

        assert_eq!(stats.completed, 2);
        let first = rx.try_recv().unwrap();
        assert!(first.as_status().unwrap().starts_with("Could not save accelerometer"));
        assert!(matches!(
            rx.try_recv().unwrap(),
            Event::AccelerometerReading(_)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_idempotent() {
        let mut fx = fixture().await;
        let id = fx
            .scheduler
            .start(ChannelKind::Rssi, Duration::from_millis(16));
        assert!(fx.scheduler.task(id).unwrap().is_running());
        assert!(fx.scheduler.stop(id).await);
        assert!(!fx.scheduler.stop(id).await);
        assert!(fx.scheduler.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_independent_channel_timers() {
        let mut fx = fixture().await;
        let accel = fx
            .scheduler
            .start(ChannelKind::Accelerometer, Duration::from_millis(10));
        let rssi = fx
            .scheduler
            .start(ChannelKind::Rssi, Duration::from_millis(100));
        assert_eq!(fx.scheduler.task_ids(), vec![accel, rssi]);

        tokio::time::sleep(Duration::from_millis(305)).await;
        let accel_stats = fx.scheduler.task(accel).unwrap().stats();
        let rssi_stats = fx.scheduler.task(rssi).unwrap().stats();
        fx.scheduler.stop_all().await;

        assert_eq!(accel_stats.completed, 30);
        assert_eq!(rssi_stats.completed, 3);
    }
}
