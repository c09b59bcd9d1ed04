//! Connection lifecycle of one peripheral.
//!
//! ```text
//! Discovered --connect()--> Connecting --Connected--> Connected
//!                               |                         |
//!                               +--ConnectionFailed--> Failed
//!                                                         |
//! Connected --disconnect()--> Disconnecting --Disconnected--> Disconnected
//! Connected --Disconnected------------------------------> Disconnected
//! ```
//!
//! All transitions take the session lock, and pollers are stopped under that
//! lock before the state leaves `Connected`. Driver calls are made with the
//! lock released.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::{Mutex, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use bluedroid_types::{ChannelKind, Event, LedColor, PeripheralHandle};

use crate::driver::{ConnectionEvent, PeripheralDriver};
use crate::error::{ConnectionFailureReason, Error, Result};
use crate::registry::SubscriberRegistry;
use crate::sample_log::SampleLog;
use crate::scheduler::PollingScheduler;

/// Connection state of a [`DeviceSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Seen by a scan, no connection requested yet.
    Discovered,
    /// Connection requested, waiting for the outcome.
    Connecting,
    /// Link up, pollers running.
    Connected,
    /// Disconnect requested, waiting for the link to drop.
    Disconnecting,
    /// Link closed. Terminal.
    Disconnected,
    /// Connection attempt failed. Terminal.
    Failed,
}

impl SessionState {
    /// Whether no further transitions can happen.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Disconnected | SessionState::Failed)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionState::Discovered => "discovered",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Disconnecting => "disconnecting",
            SessionState::Disconnected => "disconnected",
            SessionState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Which channels to poll on every connected peripheral, and how often.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SamplingPlan {
    channels: Vec<(ChannelKind, Duration)>,
}

impl SamplingPlan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Poll `channel` every `period`. A channel added twice keeps the last period.
    #[must_use]
    pub fn channel(mut self, channel: ChannelKind, period: Duration) -> Self {
        self.channels.retain(|(kind, _)| *kind != channel);
        self.channels.push((channel, period));
        self
    }

    pub fn channels(&self) -> &[(ChannelKind, Duration)] {
        &self.channels
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

/// Everything a session needs from the service run that owns it.
#[derive(Clone)]
pub struct SessionContext {
    pub driver: Arc<dyn PeripheralDriver>,
    pub registry: Arc<SubscriberRegistry>,
    pub logs: Arc<SampleLog>,
    pub plan: SamplingPlan,
    /// Light the indicator LED while connected.
    pub indicator: bool,
}

impl std::fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionContext")
            .field("plan", &self.plan)
            .field("indicator", &self.indicator)
            .finish()
    }
}

struct SessionInner {
    state: SessionState,
    scheduler: PollingScheduler,
}

/// One peripheral's connection and its pollers.
pub struct DeviceSession {
    peripheral: PeripheralHandle,
    ctx: SessionContext,
    created_at: OffsetDateTime,
    inner: Mutex<SessionInner>,
    state_tx: watch::Sender<SessionState>,
    /// Cancels the one-shot info/battery read started on connect.
    info_cancel: CancellationToken,
}

impl std::fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSession")
            .field("peripheral", &self.peripheral.address)
            .field("state", &self.state())
            .finish()
    }
}

impl DeviceSession {
    pub fn new(peripheral: PeripheralHandle, ctx: SessionContext) -> Arc<Self> {
        let scheduler = PollingScheduler::new(
            Arc::clone(&ctx.driver),
            peripheral.clone(),
            Arc::clone(&ctx.logs),
            Arc::clone(&ctx.registry),
        );
        let (state_tx, _) = watch::channel(SessionState::Discovered);
        Arc::new(Self {
            peripheral,
            ctx,
            created_at: OffsetDateTime::now_utc(),
            inner: Mutex::new(SessionInner {
                state: SessionState::Discovered,
                scheduler,
            }),
            state_tx,
            info_cancel: CancellationToken::new(),
        })
    }

    pub fn peripheral(&self) -> &PeripheralHandle {
        &self.peripheral
    }

    pub fn created_at(&self) -> OffsetDateTime {
        self.created_at
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    /// Watch state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    /// Number of pollers currently running.
    pub async fn active_pollers(&self) -> usize {
        self.inner.lock().await.scheduler.len()
    }

    fn set_state(&self, inner: &mut SessionInner, state: SessionState) {
        debug!(
            "{}: {} -> {}",
            self.peripheral.address, inner.state, state
        );
        inner.state = state;
        self.state_tx.send_replace(state);
    }

    fn status(&self, text: String) {
        self.ctx.registry.status(text);
    }

    /// Request a connection.
    ///
    /// Returns the driver's event stream, to be handed to [`DeviceSession::run`].
    /// A driver that cannot even start connecting moves the session to
    /// `Failed`.
    pub async fn connect(&self) -> Result<mpsc::Receiver<ConnectionEvent>> {
        {
            let mut inner = self.inner.lock().await;
            if inner.state != SessionState::Discovered {
                return Err(Error::connection_failed(
                    Some(self.peripheral.id.clone()),
                    ConnectionFailureReason::Other(format!("session is already {}", inner.state)),
                ));
            }
            self.set_state(&mut inner, SessionState::Connecting);
        }

        self.status(format!("Connecting to {}...", self.peripheral.display_name()));
        match self.ctx.driver.connect(&self.peripheral).await {
            Ok(events) => Ok(events),
            Err(e) => {
                self.on_connection_failed(e.to_string()).await;
                Err(e)
            }
        }
    }

    /// Consume connection events until the session reaches a terminal state.
    ///
    /// A stream that closes early counts as a disconnect.
    pub async fn run(&self, mut events: mpsc::Receiver<ConnectionEvent>) -> SessionState {
        while let Some(event) = events.recv().await {
            self.handle_event(event).await;
            let state = self.state();
            if state.is_terminal() {
                return state;
            }
        }

        debug!("Event stream for {} closed", self.peripheral.address);
        self.on_disconnected().await;
        self.state()
    }

    /// Apply one driver event.
    pub async fn handle_event(&self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Connected => self.on_connected().await,
            ConnectionEvent::ConnectionFailed(reason) => self.on_connection_failed(reason).await,
            ConnectionEvent::Disconnected => self.on_disconnected().await,
            ConnectionEvent::Error(message) => {
                warn!("Peripheral error on {}: {}", self.peripheral.address, message);
                self.status(format!(
                    "Peripheral error ({}): {}",
                    self.peripheral.address, message
                ));
            }
        }
    }

    async fn on_connected(&self) {
        let disconnect_pending = {
            let mut inner = self.inner.lock().await;
            match inner.state {
                SessionState::Connecting => {
                    self.set_state(&mut inner, SessionState::Connected);
                    false
                }
                SessionState::Disconnecting => true,
                other => {
                    debug!("Ignoring connect for {} while {}", self.peripheral.address, other);
                    return;
                }
            }
        };
        if disconnect_pending {
            // disconnect() raced the connection; finish tearing it down
            if let Err(e) = self.ctx.driver.disconnect(&self.peripheral).await {
                warn!("Disconnect of {} failed: {}", self.peripheral.address, e);
                self.on_disconnected().await;
            }
            return;
        }

        info!("Connected to {}", self.peripheral.address);
        self.status(format!("Connected to {}.", self.peripheral.address));
        self.spawn_info_read();

        if self.ctx.indicator
            && let Err(e) = self
                .ctx
                .driver
                .set_indicator(&self.peripheral, LedColor::CONNECTED)
                .await
        {
            warn!("Could not set indicator on {}: {}", self.peripheral.address, e);
        }

        let mut inner = self.inner.lock().await;
        if inner.state != SessionState::Connected {
            return;
        }
        for (channel, period) in self.ctx.plan.channels() {
            inner.scheduler.start(*channel, *period);
        }
        // Under the lock, so a racing disconnect cannot report first
        self.ctx.registry.publish(Event::SensorStarted);
    }

    fn spawn_info_read(&self) {
        let driver = Arc::clone(&self.ctx.driver);
        let registry = Arc::clone(&self.ctx.registry);
        let peripheral = self.peripheral.clone();
        let cancel = self.info_cancel.clone();

        tokio::spawn(async move {
            let read = async {
                match driver.read_device_info(&peripheral).await {
                    Ok(info) => registry.status(format!(
                        "Device information for {}: {}",
                        peripheral.address, info
                    )),
                    Err(e) => registry.status(format!(
                        "Could not read device information from {}: {}",
                        peripheral.address, e
                    )),
                };
                match driver.read_battery(&peripheral).await {
                    Ok(level) => {
                        registry.publish(Event::BatteryLevel(level));
                    }
                    Err(e) => debug!("Battery read failed for {}: {}", peripheral.address, e),
                }
            };
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = read => {}
            }
        });
    }

    async fn on_connection_failed(&self, reason: String) {
        let next = {
            let mut inner = self.inner.lock().await;
            let next = match inner.state {
                SessionState::Connecting => SessionState::Failed,
                SessionState::Disconnecting | SessionState::Connected => {
                    inner.scheduler.stop_all().await;
                    SessionState::Disconnected
                }
                _ => return,
            };
            self.set_state(&mut inner, next);
            next
        };
        self.info_cancel.cancel();

        if next == SessionState::Failed {
            warn!("Connection to {} failed: {}", self.peripheral.address, reason);
            self.status(format!(
                "Connection to {} failed: {}",
                self.peripheral.address, reason
            ));
        } else {
            self.status(format!("Disconnected from {}.", self.peripheral.address));
        }
    }

    async fn on_disconnected(&self) {
        let next = {
            let mut inner = self.inner.lock().await;
            let next = match inner.state {
                SessionState::Connecting => SessionState::Failed,
                SessionState::Discovered
                | SessionState::Connected
                | SessionState::Disconnecting => SessionState::Disconnected,
                SessionState::Disconnected | SessionState::Failed => return,
            };
            inner.scheduler.stop_all().await;
            self.set_state(&mut inner, next);
            next
        };
        self.info_cancel.cancel();

        match next {
            SessionState::Failed => self.status(format!(
                "Connection to {} failed: link dropped while connecting",
                self.peripheral.address
            )),
            _ => {
                info!("Disconnected from {}", self.peripheral.address);
                self.status(format!("Disconnected from {}.", self.peripheral.address));
            }
        }
    }

    /// Request a disconnect.
    ///
    /// Pollers are stopped before this returns; the terminal state follows
    /// once the driver reports the link closed. Calling it on a session that
    /// is already disconnecting or finished does nothing.
    pub async fn disconnect(&self) {
        let was_connected = {
            let mut inner = self.inner.lock().await;
            match inner.state {
                SessionState::Discovered => {
                    self.set_state(&mut inner, SessionState::Disconnected);
                    return;
                }
                SessionState::Connecting => {
                    self.set_state(&mut inner, SessionState::Disconnecting);
                    false
                }
                SessionState::Connected => {
                    inner.scheduler.stop_all().await;
                    self.set_state(&mut inner, SessionState::Disconnecting);
                    true
                }
                SessionState::Disconnecting
                | SessionState::Disconnected
                | SessionState::Failed => return,
            }
        };
        self.info_cancel.cancel();

        if was_connected
            && self.ctx.indicator
            && let Err(e) = self
                .ctx
                .driver
                .set_indicator(&self.peripheral, LedColor::OFF)
                .await
        {
            debug!("Could not clear indicator on {}: {}", self.peripheral.address, e);
        }

        if let Err(e) = self.ctx.driver.disconnect(&self.peripheral).await {
            warn!("Disconnect of {} failed: {}", self.peripheral.address, e);
            self.on_disconnected().await;
        }
    }

    /// Wait until the session reaches a terminal state.
    pub async fn wait_terminal(&self) -> SessionState {
        let mut rx = self.state_tx.subscribe();
        match rx.wait_for(SessionState::is_terminal).await {
            Ok(state) => *state,
            Err(_) => self.state(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockDriver;
    use tempfile::TempDir;

    fn context(driver: Arc<MockDriver>, dir: &TempDir, indicator: bool) -> SessionContext {
        let logs = SampleLog::open(
            dir.path(),
            &[(ChannelKind::Accelerometer, "accelerometer.csv".to_string())],
        )
        .unwrap();
        SessionContext {
            driver,
            registry: Arc::new(SubscriberRegistry::new()),
            logs: Arc::new(logs),
            plan: SamplingPlan::new().channel(ChannelKind::Accelerometer, Duration::from_millis(16)),
            indicator,
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Event>) -> Vec<Event> {
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    #[test]
    fn test_sampling_plan_replaces_duplicates() {
        let plan = SamplingPlan::new()
            .channel(ChannelKind::Rssi, Duration::from_millis(16))
            .channel(ChannelKind::Rssi, Duration::from_millis(33));
        assert_eq!(
            plan.channels(),
            &[(ChannelKind::Rssi, Duration::from_millis(33))]
        );
    }

    #[test]
    fn test_terminal_states() {
        assert!(SessionState::Disconnected.is_terminal());
        assert!(SessionState::Failed.is_terminal());
        assert!(!SessionState::Disconnecting.is_terminal());
        assert_eq!(SessionState::Connecting.to_string(), "connecting");
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_starts_pollers() {
        let dir = TempDir::new().unwrap();
        let driver = Arc::new(MockDriver::new());
        let handle = driver.add_mock_peripheral();
        let ctx = context(driver.clone(), &dir, true);
        let (_, mut rx) = ctx.registry.subscribe();

        let session = DeviceSession::new(handle.clone(), ctx);
        let events = session.connect().await.unwrap();
        let runner = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.run(events).await })
        };

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(session.state(), SessionState::Connected);
        assert_eq!(session.active_pollers().await, 1);
        assert_eq!(
            driver.indicator_writes(),
            vec![(handle.id.clone(), LedColor::CONNECTED)]
        );

        session.disconnect().await;
        assert_eq!(session.active_pollers().await, 0);
        assert_eq!(runner.await.unwrap(), SessionState::Disconnected);
        assert_eq!(
            driver.indicator_writes().last(),
            Some(&(handle.id.clone(), LedColor::OFF))
        );

        let events = drain(&mut rx);
        assert!(events.contains(&Event::SensorStarted));
        assert!(events.contains(&Event::BatteryLevel(85)));
        assert!(
            events
                .iter()
                .any(|e| e.as_status().is_some_and(|s| s.starts_with("Device information")))
        );
        let disconnects = events
            .iter()
            .filter(|e| e.as_status().is_some_and(|s| s.starts_with("Disconnected from")))
            .count();
        assert_eq!(disconnects, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_sensor_started_precedes_disconnect() {
        for round in 0..50 {
            let dir = TempDir::new().unwrap();
            let driver = Arc::new(MockDriver::new());
            let handle = driver.add_mock_peripheral();
            let ctx = context(driver.clone(), &dir, false);
            let (_, mut rx) = ctx.registry.subscribe();

            let session = DeviceSession::new(handle, ctx);
            let events = session.connect().await.unwrap();
            let runner = {
                let session = Arc::clone(&session);
                tokio::spawn(async move { session.run(events).await })
            };
            for _ in 0..round % 5 {
                tokio::task::yield_now().await;
            }
            session.disconnect().await;
            assert_eq!(runner.await.unwrap(), SessionState::Disconnected);

            let events = drain(&mut rx);
            let started = events.iter().position(|e| *e == Event::SensorStarted);
            let disconnected = events
                .iter()
                .position(|e| e.as_status().is_some_and(|s| s.starts_with("Disconnected from")));
            if let (Some(started), Some(disconnected)) = (started, disconnected) {
                assert!(started < disconnected, "round {}: {:?}", round, events);
            }
        }
    }

    #[tokio::test]
    async fn test_refused_connection_fails() {
        let dir = TempDir::new().unwrap();
        let driver = Arc::new(MockDriver::new());
        driver.set_refuse_connections(true);
        let handle = driver.add_mock_peripheral();
        let ctx = context(driver.clone(), &dir, false);
        let (_, mut rx) = ctx.registry.subscribe();

        let session = DeviceSession::new(handle, ctx);
        let events = session.connect().await.unwrap();
        assert_eq!(session.run(events).await, SessionState::Failed);
        assert_eq!(session.active_pollers().await, 0);

        let events = drain(&mut rx);
        assert!(
            events
                .iter()
                .any(|e| e.as_status().is_some_and(|s| s.contains("failed")))
        );
        assert!(!events.contains(&Event::SensorStarted));
    }

    #[tokio::test]
    async fn test_connect_twice_is_rejected() {
        let dir = TempDir::new().unwrap();
        let driver = Arc::new(MockDriver::new());
        let handle = driver.add_mock_peripheral();
        let session = DeviceSession::new(handle, context(driver, &dir, false));
        let _events = session.connect().await.unwrap();
        assert!(session.connect().await.is_err());
    }

    #[tokio::test]
    async fn test_disconnect_before_connect() {
        let dir = TempDir::new().unwrap();
        let driver = Arc::new(MockDriver::new());
        let handle = driver.add_mock_peripheral();
        let session = DeviceSession::new(handle, context(driver.clone(), &dir, false));

        session.disconnect().await;
        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(driver.disconnect_requests(), 0);
        // terminal states ignore further requests
        session.disconnect().await;
        assert_eq!(session.wait_terminal().await, SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_closed_stream_while_connecting_fails() {
        let dir = TempDir::new().unwrap();
        let driver = Arc::new(MockDriver::new());
        let handle = driver.add_mock_peripheral();
        let session = DeviceSession::new(handle, context(driver, &dir, false));
        {
            let mut inner = session.inner.lock().await;
            session.set_state(&mut inner, SessionState::Connecting);
        }
        let (tx, rx) = mpsc::channel(1);
        drop(tx);
        assert_eq!(session.run(rx).await, SessionState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_peripheral_error_keeps_state() {
        let dir = TempDir::new().unwrap();
        let driver = Arc::new(MockDriver::new());
        let handle = driver.add_mock_peripheral();
        let ctx = context(driver.clone(), &dir, false);
        let (_, mut rx) = ctx.registry.subscribe();
        let session = DeviceSession::new(handle.clone(), ctx);

        let events = session.connect().await.unwrap();
        let runner = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.run(events).await })
        };
        tokio::time::sleep(Duration::from_millis(1)).await;

        driver.trigger_error(&handle, "low memory").await;
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(session.state(), SessionState::Connected);
        assert!(drain(&mut rx).contains(&Event::status(format!(
            "Peripheral error ({}): low memory",
            handle.address
        ))));

        driver.trigger_disconnect(&handle).await;
        assert_eq!(runner.await.unwrap(), SessionState::Disconnected);
    }
}
