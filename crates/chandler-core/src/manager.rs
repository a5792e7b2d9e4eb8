//! Management of every known valve session.
//!
//! The [`ConnectionManager`] owns one [`ConnectionSession`] per address. It
//! follows a [`ValveDiscovery`] registry: sightings create or update sessions
//! and trigger a poll, lost valves are marked unavailable. A fixed-interval
//! timer polls every session regardless of recent activity.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use tokio::sync::{RwLock, mpsc};
use tokio::time::{Instant, MissedTickBehavior, interval_at, sleep};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

use chandler_types::Passcode;

use crate::discovery::{DiscoveryUpdate, ValveAdvertisement, ValveDiscovery};
use crate::error::{Error, Result};
use crate::events::{EventDispatcher, EventReceiver, ListenerId};
use crate::gatt::GattConnector;
use crate::session::{ConnectionSession, PollOutcome, SessionConfig, clamp_persistent_interval};

/// Default interval between polls of every session.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// Per-address settings that replace the session defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceOverrides {
    pub passcode: Option<Passcode>,
    pub persistent: Option<bool>,
    pub persistent_interval: Option<Duration>,
}

/// Configuration for the connection manager.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Interval of the poll-everything timer.
    pub poll_interval: Duration,
    /// Extra delay between the host becoming ready and the initial poll.
    pub startup_delay: Duration,
    /// Event channel capacity.
    pub event_capacity: usize,
    /// Defaults for new sessions.
    pub session: SessionConfig,
    /// Overrides keyed by address.
    pub devices: HashMap<String, DeviceOverrides>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            startup_delay: Duration::ZERO,
            event_capacity: 100,
            session: SessionConfig::default(),
            devices: HashMap::new(),
        }
    }
}

impl ManagerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    #[must_use]
    pub fn startup_delay(mut self, delay: Duration) -> Self {
        self.startup_delay = delay;
        self
    }

    #[must_use]
    pub fn session(mut self, session: SessionConfig) -> Self {
        self.session = session;
        self
    }

    /// Add overrides for one address.
    #[must_use]
    pub fn device(mut self, address: impl Into<String>, overrides: DeviceOverrides) -> Self {
        self.devices.insert(address.into(), overrides);
        self
    }

    /// Validate the configuration and return an error if invalid.
    ///
    /// Checks that:
    /// - `poll_interval` is > 0
    /// - `event_capacity` is > 0
    /// - the session connect and response timeouts are > 0
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval.is_zero() {
            return Err(Error::invalid_config("poll_interval must be > 0"));
        }
        if self.event_capacity == 0 {
            return Err(Error::invalid_config("event_capacity must be > 0"));
        }
        if self.session.connect_timeout.is_zero() {
            return Err(Error::invalid_config("connect_timeout must be > 0"));
        }
        if self.session.response_timeout.is_zero() {
            return Err(Error::invalid_config("response_timeout must be > 0"));
        }
        Ok(())
    }

    /// Session configuration for `address`, with overrides applied.
    #[must_use]
    pub fn session_config_for(&self, address: &str) -> SessionConfig {
        let mut config = self.session.clone();
        if let Some(overrides) = self.devices.get(address) {
            if let Some(passcode) = overrides.passcode {
                config.passcode = passcode;
            }
            if let Some(persistent) = overrides.persistent {
                config.persistent = persistent;
            }
            if let Some(interval) = overrides.persistent_interval {
                config.persistent_interval = clamp_persistent_interval(interval);
            }
        }
        config
    }
}

/// Owns the sessions for every known valve.
pub struct ConnectionManager<C: GattConnector> {
    connector: Arc<C>,
    config: ManagerConfig,
    sessions: RwLock<HashMap<String, Arc<ConnectionSession<C>>>>,
    events: EventDispatcher,
    cancel: CancellationToken,
    tasks: TaskTracker,
    listener: std::sync::Mutex<Option<(Arc<ValveDiscovery>, ListenerId)>>,
}

impl<C: GattConnector> std::fmt::Debug for ConnectionManager<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("config", &self.config)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl<C: GattConnector> ConnectionManager<C> {
    pub fn new(connector: Arc<C>, config: ManagerConfig) -> Self {
        Self {
            events: EventDispatcher::new(config.event_capacity),
            connector,
            config,
            sessions: RwLock::new(HashMap::new()),
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
            listener: std::sync::Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn events(&self) -> &EventDispatcher {
        &self.events
    }

    /// Subscribe to events from every session.
    pub fn subscribe(&self) -> EventReceiver {
        self.events.subscribe()
    }

    /// Start following `discovery`.
    ///
    /// Sessions are created for every valve already known. The initial poll
    /// runs once `ready` resolves, after the configured startup delay.
    pub async fn setup<F>(self: &Arc<Self>, discovery: Arc<ValveDiscovery>, ready: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        for valve in discovery.all() {
            self.ensure_session(valve).await;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let id = discovery.add_listener(move |update: &DiscoveryUpdate| {
            // Ignore error if the manager has shut down
            let _ = tx.send(update.clone());
        });
        *self.listener.lock().unwrap_or_else(PoisonError::into_inner) = Some((discovery, id));

        self.tasks.spawn(Arc::clone(self).forward_updates(rx));
        self.tasks.spawn(Arc::clone(self).initial_poll(ready));
        self.tasks.spawn(Arc::clone(self).poll_periodically());

        info!(
            sessions = self.sessions.read().await.len(),
            interval = ?self.config.poll_interval,
            "Connection manager started"
        );
    }

    async fn forward_updates(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<DiscoveryUpdate>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                update = rx.recv() => match update {
                    Some(update) => self.handle_update(update).await,
                    None => break,
                },
            }
        }
    }

    async fn initial_poll<F>(self: Arc<Self>, ready: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        tokio::select! {
            _ = self.cancel.cancelled() => return,
            _ = ready => {}
        }
        tokio::select! {
            _ = self.cancel.cancelled() => return,
            _ = sleep(self.config.startup_delay) => {}
        }
        debug!("Running initial poll");
        self.poll_all().await;
    }

    async fn poll_periodically(self: Arc<Self>) {
        let period = self.config.poll_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    debug!("Polling all valves");
                    self.poll_all().await;
                }
            }
        }
    }

    /// Apply one discovery change.
    pub async fn handle_update(&self, update: DiscoveryUpdate) {
        match update.valve {
            Some(valve) if !update.change.is_lost() => {
                let session = self.ensure_session(valve).await;
                self.spawn_poll(session);
            }
            _ => {
                if let Some(session) = self.session(&update.address).await {
                    debug!(address = %update.address, change = ?update.change, "Valve unreachable; suspending polls");
                    session.mark_unavailable().await;
                }
            }
        }
    }

    /// Create or update the session for a valve.
    pub async fn ensure_session(&self, valve: ValveAdvertisement) -> Arc<ConnectionSession<C>> {
        let address = valve.address().to_string();
        let session = {
            let mut sessions = self.sessions.write().await;
            Arc::clone(sessions.entry(address.clone()).or_insert_with(|| {
                debug!(%address, "Creating session");
                Arc::new(ConnectionSession::new(
                    address.clone(),
                    Arc::clone(&self.connector),
                    self.config.session_config_for(&address),
                    self.events.clone(),
                    &self.cancel,
                ))
            }))
        };
        session.update_from_advertisement(valve).await;
        session
    }

    pub async fn session(&self, address: &str) -> Option<Arc<ConnectionSession<C>>> {
        self.sessions.read().await.get(address).cloned()
    }

    pub async fn sessions(&self) -> Vec<Arc<ConnectionSession<C>>> {
        self.sessions.read().await.values().cloned().collect()
    }

    /// Poll one address now and wait for the outcome.
    pub async fn poll_now(&self, address: &str) -> Option<PollOutcome> {
        let session = self.session(address).await?;
        Some(session.poll().await)
    }

    /// Start a poll of every session.
    pub async fn poll_all(&self) {
        for session in self.sessions().await {
            self.spawn_poll(session);
        }
    }

    fn spawn_poll(&self, session: Arc<ConnectionSession<C>>) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.tasks.spawn(async move {
            let outcome = session.poll().await;
            debug!(address = %session.address(), ?outcome, "Poll finished");
        });
    }

    /// Stop timers and listeners, then shut every session down.
    pub async fn shutdown(&self) {
        self.cancel.cancel();

        let listener = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some((discovery, id)) = listener {
            discovery.remove_listener(id);
        }

        self.tasks.close();
        self.tasks.wait().await;

        let sessions: Vec<_> = self.sessions.write().await.drain().map(|(_, s)| s).collect();
        futures::future::join_all(sessions.iter().map(|s| s.shutdown())).await;
        info!(sessions = sessions.len(), "Connection manager stopped");
    }
}
