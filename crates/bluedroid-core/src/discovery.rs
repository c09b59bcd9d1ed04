//! Discovery and session fan-out.
//!
//! A [`DiscoveryCoordinator`] runs one scan, reports what it finds to
//! subscribers, and opens a [`DeviceSession`] for every new peripheral.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use futures::future::join_all;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use bluedroid_types::PeripheralHandle;

use crate::driver::DiscoveryEvent;
use crate::error::Result;
use crate::session::{DeviceSession, SessionContext, SessionState};

struct SessionEntry {
    session: Arc<DeviceSession>,
    task: JoinHandle<SessionState>,
}

type SessionMap = Arc<Mutex<HashMap<String, SessionEntry>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Runs a scan and owns the sessions it opens.
///
/// Sessions stay in the coordinator until they reach a terminal state.
pub struct DiscoveryCoordinator {
    ctx: SessionContext,
    cancel: CancellationToken,
    seen: Mutex<Vec<PeripheralHandle>>,
    sessions: SessionMap,
    scan: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for DiscoveryCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscoveryCoordinator")
            .field("seen", &self.peripherals_seen())
            .field("sessions", &self.session_count())
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

impl DiscoveryCoordinator {
    pub fn new(ctx: SessionContext) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            cancel: CancellationToken::new(),
            seen: Mutex::new(Vec::new()),
            sessions: Arc::new(Mutex::new(HashMap::new())),
            scan: Mutex::new(None),
        })
    }

    /// Start scanning.
    ///
    /// Fails if the driver cannot start a scan; subscribers are told to check
    /// that Bluetooth is enabled.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.ctx.registry.status("Listening for peripherals...");

        let events = match self.ctx.driver.discover(self.cancel.child_token()).await {
            Ok(events) => events,
            Err(e) => {
                warn!("Could not start discovery: {}", e);
                self.ctx
                    .registry
                    .status("Could not start discovery. Make sure Bluetooth is enabled.");
                return Err(e);
            }
        };

        let this = Arc::clone(self);
        let handle = tokio::spawn(async move { this.pump(events).await });
        *lock(&self.scan) = Some(handle);
        Ok(())
    }

    async fn pump(self: Arc<Self>, mut events: mpsc::Receiver<DiscoveryEvent>) {
        loop {
            let event = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    debug!("Discovery cancelled");
                    return;
                }
                event = events.recv() => event,
            };

            match event {
                Some(DiscoveryEvent::Found(peripheral)) => self.on_found(peripheral),
                Some(DiscoveryEvent::Complete) => {
                    self.on_complete();
                    return;
                }
                None => {
                    debug!("Discovery stream closed");
                    return;
                }
            }
        }
    }

    fn on_found(&self, peripheral: PeripheralHandle) {
        let count = {
            let mut seen = lock(&self.seen);
            if seen.iter().any(|p| p.id == peripheral.id) {
                return;
            }
            seen.push(peripheral.clone());
            seen.len()
        };

        let registry = &self.ctx.registry;
        registry.status(format!("Discovered peripheral {}", peripheral.address));
        registry.status(format!("There are now {} peripherals.", count));
        if let Some(rssi) = peripheral.rssi {
            registry.status(format!(
                "Peripheral {} has a signal strength of {} RSSI.",
                peripheral.address, rssi
            ));
        }

        self.open_session(peripheral);
    }

    fn on_complete(&self) {
        let seen = lock(&self.seen).clone();
        info!("Discovery complete, {} peripheral(s)", seen.len());

        let registry = &self.ctx.registry;
        registry.status(format!("Discovery complete. {} devices found.", seen.len()));
        for peripheral in &seen {
            registry.status(format!(
                "Peripheral name: {} address: {}",
                peripheral.display_name(),
                peripheral.address
            ));
        }
    }

    fn open_session(&self, peripheral: PeripheralHandle) {
        let id = peripheral.id.clone();
        let session = DeviceSession::new(peripheral, self.ctx.clone());

        let mut sessions = lock(&self.sessions);
        let task = {
            let session = Arc::clone(&session);
            let sessions = Arc::clone(&self.sessions);
            let id = id.clone();
            tokio::spawn(async move {
                let state = match session.connect().await {
                    Ok(events) => session.run(events).await,
                    Err(e) => {
                        debug!("Session for {} did not start: {}", id, e);
                        session.state()
                    }
                };
                lock(&sessions).remove(&id);
                state
            })
        };
        sessions.insert(id, SessionEntry { session, task });
    }

    /// Stop the scan. Open sessions are not touched. Calling it twice is a
    /// no-op.
    pub fn cancel(&self) {
        if !self.cancel.is_cancelled() {
            debug!("Cancelling discovery");
            self.cancel.cancel();
        }
    }

    /// Whether the scan is still running.
    pub fn is_scanning(&self) -> bool {
        lock(&self.scan)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Stop the scan and disconnect every session, waiting until each one
    /// reaches a terminal state.
    pub async fn disconnect_all(&self) {
        self.cancel();
        let scan = lock(&self.scan).take();
        if let Some(handle) = scan
            && let Err(e) = handle.await
            && e.is_panic()
        {
            warn!("Discovery task panicked");
        }

        let entries: Vec<SessionEntry> = lock(&self.sessions).drain().map(|(_, e)| e).collect();
        if entries.is_empty() {
            return;
        }
        info!("Disconnecting {} session(s)", entries.len());

        join_all(entries.iter().map(|entry| entry.session.disconnect())).await;
        for result in join_all(entries.into_iter().map(|entry| entry.task)).await {
            if let Err(e) = result
                && e.is_panic()
            {
                warn!("Session task panicked");
            }
        }
    }

    /// Unique peripherals reported by the scan so far.
    pub fn peripherals_seen(&self) -> usize {
        lock(&self.seen).len()
    }

    /// Peripherals reported by the scan so far, in discovery order.
    pub fn peripherals(&self) -> Vec<PeripheralHandle> {
        lock(&self.seen).clone()
    }

    /// Sessions that have not yet reached a terminal state.
    pub fn sessions(&self) -> Vec<Arc<DeviceSession>> {
        lock(&self.sessions)
            .values()
            .map(|entry| Arc::clone(&entry.session))
            .collect()
    }

    pub fn session_count(&self) -> usize {
        lock(&self.sessions).len()
    }
}

impl Drop for DiscoveryCoordinator {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use bluedroid_types::{ChannelKind, Event};
    use tempfile::TempDir;

    use crate::mock::MockDriver;
    use crate::registry::SubscriberRegistry;
    use crate::sample_log::SampleLog;
    use crate::session::SamplingPlan;

    fn context(driver: Arc<MockDriver>, dir: &TempDir) -> SessionContext {
        let logs = SampleLog::open(dir.path(), &[(ChannelKind::Rssi, "rssi.csv".to_string())])
            .unwrap();
        SessionContext {
            driver,
            registry: Arc::new(SubscriberRegistry::new()),
            logs: Arc::new(logs),
            plan: SamplingPlan::new().channel(ChannelKind::Rssi, Duration::from_millis(100)),
            indicator: false,
        }
    }

    fn statuses(rx: &mut mpsc::UnboundedReceiver<Event>) -> Vec<String> {
        std::iter::from_fn(|| rx.try_recv().ok())
            .filter_map(|e| e.as_status().map(str::to_string))
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_discovery_reports_and_connects() {
        let dir = TempDir::new().unwrap();
        let driver = Arc::new(MockDriver::new());
        let a = driver.add_mock_peripheral();
        let b = driver.add_mock_peripheral();
        let ctx = context(driver.clone(), &dir);
        let (_, mut rx) = ctx.registry.subscribe();

        let coordinator = DiscoveryCoordinator::new(ctx);
        coordinator.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(coordinator.peripherals_seen(), 2);
        assert_eq!(coordinator.session_count(), 2);
        assert!(!coordinator.is_scanning());
        assert!(driver.is_connected(&a));
        assert!(driver.is_connected(&b));

        let texts = statuses(&mut rx);
        assert_eq!(texts[0], "Listening for peripherals...");
        assert!(texts.contains(&format!("Discovered peripheral {}", a.address)));
        assert!(texts.contains(&"There are now 2 peripherals.".to_string()));
        assert!(texts.contains(&format!(
            "Peripheral {} has a signal strength of -55 RSSI.",
            b.address
        )));
        assert!(texts.contains(&"Discovery complete. 2 devices found.".to_string()));
        assert!(texts.contains(&format!(
            "Peripheral name: Mock Bean address: {}",
            a.address
        )));

        coordinator.disconnect_all().await;
        assert_eq!(coordinator.session_count(), 0);
        assert!(!driver.is_connected(&a));
        assert_eq!(driver.disconnect_requests(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_sightings_open_one_session() {
        let dir = TempDir::new().unwrap();
        let driver = Arc::new(MockDriver::new());
        let handle = driver.add_mock_peripheral();
        driver.add_peripheral(handle.clone());
        let ctx = context(driver.clone(), &dir);
        let (_, mut rx) = ctx.registry.subscribe();

        let coordinator = DiscoveryCoordinator::new(ctx);
        coordinator.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(coordinator.peripherals_seen(), 1);
        assert_eq!(coordinator.session_count(), 1);
        let discovered = statuses(&mut rx)
            .iter()
            .filter(|s| s.starts_with("Discovered peripheral"))
            .count();
        assert_eq!(discovered, 1);

        coordinator.disconnect_all().await;
    }

    #[tokio::test]
    async fn test_discovery_start_failure() {
        let dir = TempDir::new().unwrap();
        let driver = Arc::new(MockDriver::new());
        driver.set_refuse_discovery(true);
        let ctx = context(driver, &dir);
        let (_, mut rx) = ctx.registry.subscribe();

        let coordinator = DiscoveryCoordinator::new(ctx);
        assert!(coordinator.start().await.is_err());
        assert_eq!(
            statuses(&mut rx).last().map(String::as_str),
            Some("Could not start discovery. Make sure Bluetooth is enabled.")
        );
        // nothing to tear down
        coordinator.disconnect_all().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_sessions_are_dropped() {
        let dir = TempDir::new().unwrap();
        let driver = Arc::new(MockDriver::new());
        driver.set_refuse_connections(true);
        driver.add_mock_peripheral();

        let coordinator = DiscoveryCoordinator::new(context(driver, &dir));
        coordinator.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(coordinator.peripherals_seen(), 1);
        assert_eq!(coordinator.session_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let driver = Arc::new(MockDriver::new());
        let coordinator = DiscoveryCoordinator::new(context(driver, &dir));
        coordinator.start().await.unwrap();

        coordinator.cancel();
        coordinator.cancel();
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(!coordinator.is_scanning());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_all_while_connecting() {
        let dir = TempDir::new().unwrap();
        let driver = Arc::new(MockDriver::builder().connect_latency(Duration::from_millis(500)).build());
        let handle = driver.add_mock_peripheral();

        let coordinator = DiscoveryCoordinator::new(context(driver.clone(), &dir));
        coordinator.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(coordinator.session_count(), 1);

        coordinator.disconnect_all().await;
        assert_eq!(coordinator.session_count(), 0);
        assert!(!driver.is_connected(&handle));
    }
}
