//! Service lifecycle.
//!
//! [`SensorService`] owns one run at a time: the sample logs and the
//! discovery coordinator with its sessions. `start` and `stop` are both
//! idempotent and serialized against each other.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};

use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tracing::{info, warn};

use bluedroid_core::{
    DiscoveryCoordinator, PeripheralDriver, SampleLog, SessionContext, SubscriberRegistry,
};
use bluedroid_types::Event;

use crate::config::{Config, ConfigError};

/// Final status published by [`SensorService::stop`].
pub const STOPPED_STATUS: &str = "Sensor service stopped.";

/// Lifecycle state of a [`SensorService`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    /// Never started.
    Idle,
    Running,
    /// Stopped after running; may be started again.
    Stopped,
}

impl ServiceState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ServiceState::Running,
            2 => ServiceState::Stopped,
            _ => ServiceState::Idle,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            ServiceState::Idle => 0,
            ServiceState::Running => 1,
            ServiceState::Stopped => 2,
        }
    }
}

/// Lock-free view of the lifecycle, readable while start/stop are running.
struct LifecycleState {
    state: AtomicU8,
    /// Unix timestamp of the last start (0 = never).
    started_at: AtomicI64,
}

impl LifecycleState {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(ServiceState::Idle.as_u8()),
            started_at: AtomicI64::new(0),
        }
    }

    fn get(&self) -> ServiceState {
        ServiceState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set(&self, state: ServiceState) {
        self.state.store(state.as_u8(), Ordering::SeqCst);
        if state == ServiceState::Running {
            let now = OffsetDateTime::now_utc().unix_timestamp();
            self.started_at.store(now, Ordering::SeqCst);
        }
    }

    fn started_at(&self) -> Option<OffsetDateTime> {
        let ts = self.started_at.load(Ordering::SeqCst);
        if ts == 0 {
            None
        } else {
            OffsetDateTime::from_unix_timestamp(ts).ok()
        }
    }
}

struct Run {
    config: Config,
    logs: Arc<SampleLog>,
    coordinator: Arc<DiscoveryCoordinator>,
}

/// Service errors.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("Failed to open sample logs: {0}")]
    Logs(bluedroid_core::Error),
}

/// The sensor acquisition service.
pub struct SensorService {
    driver: Arc<dyn PeripheralDriver>,
    registry: Arc<SubscriberRegistry>,
    lifecycle: LifecycleState,
    run: Mutex<Option<Run>>,
}

impl std::fmt::Debug for SensorService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SensorService")
            .field("state", &self.state())
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl SensorService {
    pub fn new(driver: Arc<dyn PeripheralDriver>, registry: Arc<SubscriberRegistry>) -> Self {
        Self {
            driver,
            registry,
            lifecycle: LifecycleState::new(),
            run: Mutex::new(None),
        }
    }

    /// The registry events are published to.
    pub fn registry(&self) -> &Arc<SubscriberRegistry> {
        &self.registry
    }

    pub fn state(&self) -> ServiceState {
        self.lifecycle.get()
    }

    pub fn is_running(&self) -> bool {
        self.state() == ServiceState::Running
    }

    /// When the current (or last) run started.
    pub fn started_at(&self) -> Option<OffsetDateTime> {
        self.lifecycle.started_at()
    }

    /// Configuration of the current run.
    pub async fn config(&self) -> Option<Config> {
        self.run.lock().await.as_ref().map(|run| run.config.clone())
    }

    /// Sessions that are still connecting or connected.
    pub async fn session_count(&self) -> usize {
        self.run
            .lock()
            .await
            .as_ref()
            .map_or(0, |run| run.coordinator.session_count())
    }

    /// Start a run. Does nothing if already running.
    ///
    /// A scan that fails to start is reported to subscribers and leaves the
    /// service running, so that `stop` still tears it down cleanly.
    pub async fn start(&self, config: &Config) -> Result<(), ServiceError> {
        let mut run = self.run.lock().await;
        if run.is_some() {
            info!("Service already running");
            return Ok(());
        }
        config.validate()?;

        let logs = SampleLog::open(&config.storage.directory, &config.log_files()).map_err(|e| {
            self.registry
                .status(format!("Could not open sample logs: {}", e));
            ServiceError::Logs(e)
        })?;
        let logs = Arc::new(logs);

        let coordinator = DiscoveryCoordinator::new(SessionContext {
            driver: Arc::clone(&self.driver),
            registry: Arc::clone(&self.registry),
            logs: Arc::clone(&logs),
            plan: config.sampling_plan(),
            indicator: config.peripheral.indicator,
        });
        if let Err(e) = coordinator.start().await {
            warn!("Discovery did not start: {}", e);
        }

        *run = Some(Run {
            config: config.clone(),
            logs,
            coordinator,
        });
        self.lifecycle.set(ServiceState::Running);
        info!(
            "Service started, writing to {}",
            config.storage.directory.display()
        );
        Ok(())
    }

    /// Stop the current run. Does nothing if not running.
    ///
    /// Discovery is cancelled, every session is disconnected (pollers first),
    /// and the logs are flushed and closed before the final status and
    /// [`Event::SensorStopped`] are published.
    pub async fn stop(&self) {
        let mut run = self.run.lock().await;
        let Some(current) = run.take() else {
            return;
        };

        current.coordinator.disconnect_all().await;
        if let Err(e) = current.logs.close_all() {
            self.registry
                .status(format!("Could not close sample logs: {}", e));
        }

        self.lifecycle.set(ServiceState::Stopped);
        info!("Service stopped");
        self.registry.status(STOPPED_STATUS);
        self.registry.publish(Event::SensorStopped);
    }
}
