//! Connection session for a single valve.
//!
//! A [`ConnectionSession`] owns everything known about one address: the last
//! trusted advertisement, the cooldown gate, the cached request
//! characteristic, the decoded password state and the authentication lockout.
//! [`ConnectionSession::poll`] runs one connect, authenticate, request and
//! disconnect cycle.
//!
//! # Concurrency
//!
//! A per-session mutex guarantees at most one physical connection attempt per
//! address. A poll that finds the mutex held is dropped, not queued. When
//! persistent mode keeps the connection open, the mutex guard moves into the
//! keep-alive task, so ordinary polls are skipped until it ends.
//!
//! Every connection attempt, successful or not, arms a cooldown. A failed
//! connect also schedules a retry for when the cooldown elapses.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use time::OffsetDateTime;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tokio::time::{Instant, sleep, timeout};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, trace, warn};

use chandler_types::{
    AuthenticationState, Classification, DashboardSnapshot, DecodedPassword, Passcode,
    PasswordState, RequestCommand, ValveModel, is_clack_name,
};

use crate::auth::{MAX_AUTH_ATTEMPTS, new_auth_payload};
use crate::dashboard::DashboardReassembler;
use crate::discovery::ValveAdvertisement;
use crate::error::{Error, Result};
use crate::events::{EventDispatcher, ValveEvent};
use crate::gatt::{
    GattCharacteristic, GattClient, GattConnector, NotificationStream, notifying_characteristics,
    resolve_request_characteristic,
};
use crate::protocol::{
    DeviceListResponse, is_device_list_packet, parse_device_list, request_payload,
};

/// Default timeout for establishing a connection.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(20);

/// Default timeout for a request's response.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Minimum delay between connection attempts.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(15);

/// Pause after a successful reset request before disconnecting.
pub const DEFAULT_RESET_SETTLE: Duration = Duration::from_millis(500);

/// Passcode used when none is configured.
pub const DEFAULT_PASSCODE: Passcode = Passcode::new(1234);

/// Default Dashboard interval while a persistent connection is open.
pub const DEFAULT_PERSISTENT_INTERVAL: Duration = Duration::from_secs(30);

/// Shortest allowed persistent interval.
pub const MIN_PERSISTENT_INTERVAL: Duration = Duration::from_secs(5);

/// Longest allowed persistent interval.
pub const MAX_PERSISTENT_INTERVAL: Duration = Duration::from_secs(300);

/// Clamp a persistent interval to the allowed range.
#[must_use]
pub fn clamp_persistent_interval(interval: Duration) -> Duration {
    interval.clamp(MIN_PERSISTENT_INTERVAL, MAX_PERSISTENT_INTERVAL)
}

/// Configuration for a [`ConnectionSession`].
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Timeout for establishing a connection.
    pub connect_timeout: Duration,
    /// Timeout for each request's response.
    pub response_timeout: Duration,
    /// Minimum delay between connection attempts.
    pub cooldown: Duration,
    /// Pause after the reset request before disconnecting.
    pub reset_settle: Duration,
    /// Passcode for challenge/response authentication.
    pub passcode: Passcode,
    /// Keep the connection open after a successful poll.
    pub persistent: bool,
    /// Dashboard interval while a persistent connection is open.
    pub persistent_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            cooldown: DEFAULT_COOLDOWN,
            reset_settle: DEFAULT_RESET_SETTLE,
            passcode: DEFAULT_PASSCODE,
            persistent: false,
            persistent_interval: DEFAULT_PERSISTENT_INTERVAL,
        }
    }
}

impl SessionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    #[must_use]
    pub fn response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    #[must_use]
    pub fn cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    #[must_use]
    pub fn reset_settle(mut self, delay: Duration) -> Self {
        self.reset_settle = delay;
        self
    }

    #[must_use]
    pub fn passcode(mut self, passcode: Passcode) -> Self {
        self.passcode = passcode;
        self
    }

    #[must_use]
    pub fn persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    /// Set the persistent interval, clamped to the allowed range.
    #[must_use]
    pub fn persistent_interval(mut self, interval: Duration) -> Self {
        self.persistent_interval = clamp_persistent_interval(interval);
        self
    }
}

/// Why a poll did not connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The session is shutting down.
    ShuttingDown,
    /// The scanner reported the valve lost.
    Unavailable,
    /// Another poll or a persistent connection holds the session.
    InFlight,
    /// The connection cooldown has not elapsed; a retry is scheduled.
    Cooldown,
    /// No trusted advertisement has been recorded.
    NoAdvertisement,
    /// The valve model does not understand requests.
    UnsupportedModel,
}

/// What a completed exchange achieved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollReport {
    /// A DeviceList response was received.
    pub device_list: bool,
    /// Authentication was confirmed or not required.
    pub access_granted: bool,
    /// A complete Dashboard snapshot was decoded.
    pub dashboard: bool,
}

/// Result of [`ConnectionSession::poll`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Skipped(SkipReason),
    /// No connectable handle is known; the valve is probably out of range.
    NotConnectable,
    /// Connecting failed or timed out; a retry is scheduled.
    ConnectFailed,
    /// Connected, exchanged and disconnected.
    Completed(PollReport),
    /// Connected and exchanged; the connection stays open in persistent mode.
    Persistent(PollReport),
    /// Connected but the exchange failed.
    Failed,
}

impl PollOutcome {
    /// Whether a connection was opened and the exchange ran to completion.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, PollOutcome::Completed(_) | PollOutcome::Persistent(_))
    }
}

#[derive(Debug)]
struct SessionState {
    valve: Option<ValveAdvertisement>,
    available: bool,
    last_seen: Option<Instant>,
    last_success: Option<OffsetDateTime>,
    next_connection_at: Option<Instant>,
    request_characteristic: Option<GattCharacteristic>,
    password: Option<DecodedPassword>,
    serial_number: Option<String>,
    device_list_is_twin_valve: Option<bool>,
    dashboard: Option<DashboardSnapshot>,
    passcode: Passcode,
    /// Passcode that exhausted its authentication attempts.
    lockout: Option<Passcode>,
    persistent: bool,
    persistent_interval: Duration,
    cooldown_retry: Option<CancellationToken>,
    persistent_stop: Option<CancellationToken>,
}

/// State machine for one valve address.
pub struct ConnectionSession<C: GattConnector> {
    address: String,
    connector: Arc<C>,
    config: SessionConfig,
    events: EventDispatcher,
    state: RwLock<SessionState>,
    poll_lock: Arc<Mutex<()>>,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl<C: GattConnector> std::fmt::Debug for ConnectionSession<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionSession")
            .field("address", &self.address)
            .field("config", &self.config)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl<C: GattConnector> ConnectionSession<C> {
    /// Create a session. Cancelling `parent` shuts the session down.
    pub fn new(
        address: impl Into<String>,
        connector: Arc<C>,
        config: SessionConfig,
        events: EventDispatcher,
        parent: &CancellationToken,
    ) -> Self {
        let state = SessionState {
            valve: None,
            available: false,
            last_seen: None,
            last_success: None,
            next_connection_at: None,
            request_characteristic: None,
            password: None,
            serial_number: None,
            device_list_is_twin_valve: None,
            dashboard: None,
            passcode: config.passcode,
            lockout: None,
            persistent: config.persistent,
            persistent_interval: clamp_persistent_interval(config.persistent_interval),
            cooldown_retry: None,
            persistent_stop: None,
        };
        Self {
            address: address.into(),
            connector,
            config,
            events,
            state: RwLock::new(state),
            poll_lock: Arc::new(Mutex::new(())),
            cancel: parent.child_token(),
            tasks: TaskTracker::new(),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Record a sighting. Marks the session available; does not connect.
    pub async fn update_from_advertisement(&self, valve: ValveAdvertisement) {
        let mut state = self.state.write().await;
        state.valve = Some(valve);
        state.available = true;
        state.last_seen = Some(Instant::now());
    }

    /// Suppress polls until the next advertisement arrives.
    pub async fn mark_unavailable(&self) {
        self.state.write().await.available = false;
    }

    pub async fn is_available(&self) -> bool {
        self.state.read().await.available
    }

    /// When the last advertisement was recorded.
    pub async fn last_seen(&self) -> Option<Instant> {
        self.state.read().await.last_seen
    }

    /// Latest trusted advertisement, with any connection counter learned since.
    pub async fn valve(&self) -> Option<ValveAdvertisement> {
        self.state.read().await.valve.clone()
    }

    pub async fn last_success(&self) -> Option<OffsetDateTime> {
        self.state.read().await.last_success
    }

    pub async fn serial_number(&self) -> Option<String> {
        self.state.read().await.serial_number.clone()
    }

    pub async fn device_list_is_twin_valve(&self) -> Option<bool> {
        self.state.read().await.device_list_is_twin_valve
    }

    /// Latest complete Dashboard snapshot.
    pub async fn dashboard(&self) -> Option<DashboardSnapshot> {
        self.state.read().await.dashboard.clone()
    }

    pub async fn password(&self) -> Option<DecodedPassword> {
        self.state.read().await.password.clone()
    }

    /// Time left before another connection attempt is allowed.
    pub async fn cooldown_remaining(&self) -> Option<Duration> {
        let next = self.state.read().await.next_connection_at?;
        let now = Instant::now();
        (now < next).then(|| next - now)
    }

    pub async fn passcode(&self) -> Passcode {
        self.state.read().await.passcode
    }

    /// Change the passcode. A lockout recorded for another passcode is cleared.
    pub async fn set_passcode(&self, passcode: Passcode) {
        let cleared = {
            let mut state = self.state.write().await;
            state.passcode = passcode;
            match state.lockout {
                Some(locked) if locked != passcode => {
                    state.lockout = None;
                    true
                }
                _ => false,
            }
        };
        if cleared {
            info!(address = %self.address, "Passcode changed; authentication lockout cleared");
            self.publish_lockout(false);
        }
    }

    /// Whether authentication is suspended for the configured passcode.
    pub async fn authentication_lockout(&self) -> bool {
        let state = self.state.read().await;
        state.lockout.is_some_and(|locked| locked == state.passcode)
    }

    /// Latch or clear the lockout for the configured passcode.
    pub async fn set_authentication_lockout(&self, locked: bool) {
        let changed = {
            let mut state = self.state.write().await;
            let previous = state.lockout.is_some();
            state.lockout = locked.then_some(state.passcode);
            previous != locked
        };
        if changed {
            self.publish_lockout(locked);
        }
    }

    pub async fn clear_authentication_lockout(&self) {
        self.set_authentication_lockout(false).await;
    }

    pub async fn is_persistent(&self) -> bool {
        self.state.read().await.persistent
    }

    /// Enable or disable persistent mode. Disabling closes an open connection.
    pub async fn set_persistent(&self, persistent: bool) {
        let mut state = self.state.write().await;
        state.persistent = persistent;
        if !persistent && let Some(stop) = state.persistent_stop.take() {
            debug!(address = %self.address, "Stopping persistent connection");
            stop.cancel();
        }
    }

    /// Whether a persistent connection is currently open.
    pub async fn is_persistent_active(&self) -> bool {
        self.state.read().await.persistent_stop.is_some()
    }

    pub async fn persistent_poll_interval(&self) -> Duration {
        self.state.read().await.persistent_interval
    }

    /// Set the persistent interval. Returns the clamped value that was stored.
    pub async fn set_persistent_poll_interval(&self, interval: Duration) -> Duration {
        let interval = clamp_persistent_interval(interval);
        self.state.write().await.persistent_interval = interval;
        interval
    }

    /// Run one connection cycle.
    ///
    /// Never returns an error: failures are logged and reported as a
    /// [`PollOutcome`]. A panic inside the cycle is caught and reported as
    /// [`PollOutcome::Failed`].
    #[tracing::instrument(level = "debug", skip(self), fields(address = %self.address))]
    pub async fn poll(self: &Arc<Self>) -> PollOutcome {
        if self.cancel.is_cancelled() {
            return PollOutcome::Skipped(SkipReason::ShuttingDown);
        }
        if !self.is_available().await {
            return PollOutcome::Skipped(SkipReason::Unavailable);
        }
        let Ok(guard) = Arc::clone(&self.poll_lock).try_lock_owned() else {
            debug!("Skipping poll; another poll is already running");
            return PollOutcome::Skipped(SkipReason::InFlight);
        };
        match AssertUnwindSafe(self.poll_locked(guard)).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(panic) => {
                error!(panic = panic_message(&*panic), "Poll panicked");
                self.arm_cooldown().await;
                self.publish_poll(false);
                PollOutcome::Failed
            }
        }
    }

    /// [`Self::poll`] as a boxed future, for timer tasks.
    pub fn poll_boxed(self: Arc<Self>) -> BoxFuture<'static, PollOutcome> {
        Box::pin(async move { self.poll().await })
    }

    async fn poll_locked(self: &Arc<Self>, guard: OwnedMutexGuard<()>) -> PollOutcome {
        if let Some(remaining) = self.cooldown_remaining().await {
            debug!(?remaining, "Skipping poll; connection cooldown active");
            self.schedule_retry(remaining).await;
            return PollOutcome::Skipped(SkipReason::Cooldown);
        }

        let Some(valve) = self.valve().await else {
            debug!("Skipping poll; no advertisement data is available");
            return PollOutcome::Skipped(SkipReason::NoAdvertisement);
        };
        let classification = valve.classification;
        if !classification.model.is_some_and(|m| m.supports_requests()) {
            debug!(
                model = ?classification.model,
                "Requests are only defined for {} valves",
                ValveModel::Evb019
            );
            return PollOutcome::Skipped(SkipReason::UnsupportedModel);
        }

        if !self.connector.is_connectable(&self.address).await {
            debug!("Valve is not currently connectable");
            return PollOutcome::NotConnectable;
        }
        if self.cancel.is_cancelled() {
            return PollOutcome::Skipped(SkipReason::ShuttingDown);
        }

        self.cancel_retry().await;
        debug!("Connecting to valve to refresh diagnostic data");

        let connect = self
            .connector
            .connect(&self.address, self.config.connect_timeout);
        let client = match timeout(self.config.connect_timeout, connect).await {
            Ok(Ok(client)) => client,
            Ok(Err(e)) => {
                if e.is_connect_failure() {
                    debug!(error = %e, "Unable to establish connection");
                } else {
                    warn!(error = %e, "Unable to establish connection");
                }
                self.after_failed_connect().await;
                return PollOutcome::ConnectFailed;
            }
            Err(_) => {
                warn!(
                    timeout = ?self.config.connect_timeout,
                    "Timed out while attempting to connect"
                );
                self.after_failed_connect().await;
                return PollOutcome::ConnectFailed;
            }
        };

        let passcode = self.passcode().await;
        let outcome = match self.fetch(&client, &classification, passcode).await {
            Ok(report) => {
                self.state.write().await.last_success = Some(OffsetDateTime::now_utc());
                if report.access_granted
                    && self.is_persistent().await
                    && !self.cancel.is_cancelled()
                    && client.is_connected().await
                {
                    self.publish_poll(true);
                    self.start_persistent(client, guard).await;
                    return PollOutcome::Persistent(report);
                }
                PollOutcome::Completed(report)
            }
            Err(Error::Cancelled) => {
                debug!("Poll interrupted by shutdown");
                PollOutcome::Failed
            }
            Err(e) => {
                warn!(error = %e, "Error while retrieving data from valve");
                PollOutcome::Failed
            }
        };

        self.close(&client).await;
        self.arm_cooldown().await;
        self.publish_poll(outcome.is_success());
        outcome
    }

    async fn fetch(
        &self,
        client: &C::Client,
        classification: &Classification,
        passcode: Passcode,
    ) -> Result<PollReport> {
        let characteristic = self.request_characteristic(client).await?;
        let mut report = PollReport::default();

        let device_list = self
            .request_device_list(client, &characteristic, classification)
            .await?;
        report.access_granted = match device_list {
            Some(response) => {
                report.device_list = true;
                let password = self.apply_device_list(&response).await;
                if !password.needs_authentication() {
                    true
                } else {
                    match self
                        .authenticate(client, &characteristic, classification, passcode)
                        .await
                    {
                        Ok(()) => true,
                        Err(e @ Error::AuthenticationFailed { .. }) => {
                            debug!(error = %e, "Continuing without access");
                            false
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
            None => {
                debug!("Valve did not provide a DeviceList response during this poll");
                !classification.authentication_required
            }
        };

        if report.access_granted {
            report.dashboard = self
                .request_dashboard(client, &characteristic)
                .await?
                .is_some();
        } else {
            debug!("Skipping Dashboard request; valve is not authenticated");
        }
        Ok(report)
    }

    async fn request_characteristic(&self, client: &C::Client) -> Result<GattCharacteristic> {
        if let Some(cached) = self.state.read().await.request_characteristic.clone() {
            return Ok(cached);
        }

        let services = client.services().await?;
        let Some(characteristic) = resolve_request_characteristic(&services) else {
            debug!(
                services = services.len(),
                "Valve does not expose a writable characteristic suitable for requests"
            );
            return Err(Error::CharacteristicNotFound {
                service_count: services.len(),
            });
        };

        debug!(uuid = %characteristic.uuid, "Resolved request characteristic");
        self.state.write().await.request_characteristic = Some(characteristic.clone());
        Ok(characteristic)
    }

    /// Subscribe to every notifying characteristic, write `payload` and wait
    /// for the first notification `accept` turns into a value.
    ///
    /// Fails with [`Error::NoResponse`] when nothing acceptable arrives in time.
    async fn exchange<T, F>(
        &self,
        client: &C::Client,
        characteristic: &GattCharacteristic,
        payload: &[u8],
        request: RequestCommand,
        mut accept: F,
    ) -> Result<T>
    where
        T: Send,
        F: FnMut(&[u8]) -> Option<T> + Send,
    {
        let services = client.services().await?;
        let mut notifications = client.notifications().await?;

        let mut subscribed = Vec::new();
        for uuid in notifying_characteristics(&services) {
            match client.subscribe(uuid).await {
                Ok(()) => subscribed.push(uuid),
                Err(e) => debug!(%uuid, error = %e, "Failed to subscribe to notifications"),
            }
        }

        let result = self
            .send_and_wait(
                client,
                characteristic,
                payload,
                request,
                !subscribed.is_empty(),
                &mut notifications,
                &mut accept,
            )
            .await;

        for uuid in subscribed {
            if let Err(e) = client.unsubscribe(uuid).await {
                trace!(%uuid, error = %e, "Failed to unsubscribe");
            }
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn send_and_wait<T, F>(
        &self,
        client: &C::Client,
        characteristic: &GattCharacteristic,
        payload: &[u8],
        request: RequestCommand,
        subscribed: bool,
        notifications: &mut NotificationStream,
        accept: &mut F,
    ) -> Result<T>
    where
        T: Send,
        F: FnMut(&[u8]) -> Option<T> + Send,
    {
        client
            .write(
                characteristic.uuid,
                payload,
                characteristic.write_with_response(),
            )
            .await?;
        trace!(%request, "Request sent");

        if !subscribed {
            debug!(%request, "Valve does not expose a notifying characteristic");
            return Err(Error::NoResponse { request });
        }

        let wait = async {
            while let Some(notification) = notifications.next().await {
                if let Some(value) = accept(notification.value.as_slice()) {
                    return Some(value);
                }
            }
            None
        };
        tokio::select! {
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            result = timeout(self.config.response_timeout, wait) => match result {
                Ok(Some(value)) => Ok(value),
                Ok(None) => Err(Error::NoResponse { request }),
                Err(_) => {
                    debug!(%request, "Timed out waiting for response");
                    Err(Error::NoResponse { request })
                }
            },
        }
    }

    async fn request_device_list(
        &self,
        client: &C::Client,
        characteristic: &GattCharacteristic,
        classification: &Classification,
    ) -> Result<Option<DeviceListResponse>> {
        let response = self
            .exchange(
                client,
                characteristic,
                &request_payload(RequestCommand::DeviceList),
                RequestCommand::DeviceList,
                |packet| device_list_from(packet, classification),
            )
            .await;
        unanswered_as_none(response)
    }

    async fn request_dashboard(
        &self,
        client: &C::Client,
        characteristic: &GattCharacteristic,
    ) -> Result<Option<DashboardSnapshot>> {
        let mut reassembler = DashboardReassembler::new();
        let response = self
            .exchange(
                client,
                characteristic,
                &request_payload(RequestCommand::Dashboard),
                RequestCommand::Dashboard,
                |packet| reassembler.push(packet),
            )
            .await;
        let snapshot = unanswered_as_none(response)?;

        match &snapshot {
            Some(snapshot) => {
                debug!("Retrieved Dashboard response");
                self.state.write().await.dashboard = Some(snapshot.clone());
                self.events.send(ValveEvent::Dashboard {
                    address: self.address.clone(),
                    snapshot: snapshot.clone(),
                });
            }
            None => debug!("Valve did not provide a complete Dashboard response"),
        }
        Ok(snapshot)
    }

    /// Store identity and password state from a DeviceList response.
    async fn apply_device_list(&self, response: &DeviceListResponse) -> DecodedPassword {
        let firmware = {
            let mut state = self.state.write().await;
            if response.serial_number.is_some() {
                state.serial_number = response.serial_number.clone();
            }
            state.device_list_is_twin_valve = Some(response.is_twin_valve);
            state.password = Some(response.password.clone());

            state.valve.as_mut().and_then(|valve| {
                if let Some(counter) = response.connection_counter {
                    valve.classification.connection_counter = Some(counter);
                }
                let is_clack = valve
                    .advertisement
                    .name
                    .as_deref()
                    .is_some_and(is_clack_name);
                valve.classification.firmware.map(|f| f.label(is_clack))
            })
        };

        debug!(
            serial = ?response.serial_number,
            state = ?response.password.state,
            "Retrieved DeviceList response"
        );
        self.events.send(ValveEvent::DeviceInfo {
            address: self.address.clone(),
            serial_number: response.serial_number.clone(),
            firmware,
        });
        self.publish_authentication(&response.password);
        response.password.clone()
    }

    /// Run up to [`MAX_AUTH_ATTEMPTS`] challenge rounds.
    ///
    /// Fails with [`Error::AuthenticationFailed`] when the passcode is already
    /// locked out (zero attempts) or every round was rejected, in which case
    /// the lockout is latched for `passcode`.
    async fn authenticate(
        &self,
        client: &C::Client,
        characteristic: &GattCharacteristic,
        classification: &Classification,
        passcode: Passcode,
    ) -> Result<()> {
        if self.state.read().await.lockout == Some(passcode) {
            debug!("Skipping authentication; passcode is locked out");
            return Err(Error::AuthenticationFailed { attempts: 0 });
        }

        for attempt in 1..=MAX_AUTH_ATTEMPTS {
            let payload = new_auth_payload(passcode);
            let response = self
                .exchange(
                    client,
                    characteristic,
                    &payload,
                    RequestCommand::DeviceList,
                    |packet| device_list_from(packet, classification),
                )
                .await;

            match unanswered_as_none(response)? {
                Some(response) if response.password.authentication_state.is_authenticated() => {
                    info!(attempt, "Authenticated with valve");
                    let password = DecodedPassword {
                        state: PasswordState::Recovered,
                        authentication_state: AuthenticationState::Authenticated,
                        ..response.password
                    };
                    self.state.write().await.password = Some(password.clone());
                    self.publish_authentication(&password);
                    return Ok(());
                }
                Some(response) => {
                    debug!(attempt, status = ?response.status, "Authentication attempt rejected");
                }
                None => debug!(attempt, "No response to authentication attempt"),
            }
        }

        warn!(
            attempts = MAX_AUTH_ATTEMPTS,
            "Authentication failed; suspended until the passcode changes"
        );
        let password = DecodedPassword {
            state: PasswordState::RecoveryFailed,
            authentication_state: AuthenticationState::NotAuthenticated,
            authentication_required: true,
            passcode: None,
        };
        {
            let mut state = self.state.write().await;
            state.password = Some(password.clone());
            state.lockout = Some(passcode);
        }
        self.publish_authentication(&password);
        self.publish_lockout(true);
        Err(Error::AuthenticationFailed {
            attempts: MAX_AUTH_ATTEMPTS,
        })
    }

    /// Best-effort reset request, then disconnect.
    async fn close(&self, client: &C::Client) {
        let characteristic = self.state.read().await.request_characteristic.clone();
        if let Some(characteristic) = characteristic
            && client.is_connected().await
        {
            let reset = client
                .write(
                    characteristic.uuid,
                    &request_payload(RequestCommand::Reset),
                    characteristic.write_with_response(),
                )
                .await;
            match reset {
                Ok(()) => sleep(self.config.reset_settle).await,
                Err(e) => debug!(error = %e, "Reset request not sent"),
            }
        }

        if let Err(e) = client.disconnect().await {
            debug!(error = %e, "Error while disconnecting");
        }
    }

    async fn arm_cooldown(&self) {
        self.state.write().await.next_connection_at = Some(Instant::now() + self.config.cooldown);
    }

    async fn after_failed_connect(self: &Arc<Self>) {
        self.arm_cooldown().await;
        self.schedule_retry(self.config.cooldown).await;
        self.publish_poll(false);
    }

    /// Schedule a poll after `delay` unless one is already pending.
    async fn schedule_retry(self: &Arc<Self>, delay: Duration) {
        if self.cancel.is_cancelled() {
            return;
        }
        let mut state = self.state.write().await;
        if state
            .cooldown_retry
            .as_ref()
            .is_some_and(|t| !t.is_cancelled())
        {
            return;
        }
        trace!(?delay, "Scheduling poll retry");
        state.cooldown_retry = Some(self.spawn_poll_after(delay));
    }

    async fn cancel_retry(&self) {
        if let Some(token) = self.state.write().await.cooldown_retry.take() {
            token.cancel();
        }
    }

    fn spawn_poll_after(self: &Arc<Self>, delay: Duration) -> CancellationToken {
        let token = self.cancel.child_token();
        let cancelled = token.clone();
        let session = Arc::clone(self);
        self.tasks.spawn(async move {
            tokio::select! {
                _ = cancelled.cancelled() => {}
                _ = sleep(delay) => {
                    // Mark the retry as fired so a new one may be scheduled.
                    cancelled.cancel();
                    if session.is_available().await {
                        session.poll_boxed().await;
                    }
                }
            }
        });
        token
    }

    async fn start_persistent(self: &Arc<Self>, client: C::Client, guard: OwnedMutexGuard<()>) {
        let stop = self.cancel.child_token();
        self.state.write().await.persistent_stop = Some(stop.clone());
        info!(address = %self.address, "Keeping connection open in persistent mode");
        let session = Arc::clone(self);
        self.tasks
            .spawn(async move { session.run_persistent(client, guard, stop).await });
    }

    async fn run_persistent(
        self: Arc<Self>,
        client: C::Client,
        guard: OwnedMutexGuard<()>,
        stop: CancellationToken,
    ) {
        loop {
            let interval = self.persistent_poll_interval().await;
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = sleep(interval) => {}
            }
            if !self.is_persistent().await {
                break;
            }
            if !client.is_connected().await {
                debug!(address = %self.address, "Persistent connection dropped");
                break;
            }

            let result = match self.request_characteristic(&client).await {
                Ok(characteristic) => self.request_dashboard(&client, &characteristic).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(Some(_)) => {
                    self.state.write().await.last_success = Some(OffsetDateTime::now_utc());
                }
                Ok(None) => {
                    debug!(address = %self.address, "Persistent Dashboard request unanswered");
                    break;
                }
                Err(e) => {
                    debug!(address = %self.address, error = %e, "Persistent Dashboard request failed");
                    break;
                }
            }
        }

        self.state.write().await.persistent_stop = None;
        self.close(&client).await;
        self.arm_cooldown().await;
        drop(guard);
        debug!(address = %self.address, "Persistent connection closed");
        self.schedule_retry(self.config.cooldown).await;
    }

    /// Stop timers and any persistent connection, then wait for running work.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.cancel_retry().await;
        self.tasks.close();
        self.tasks.wait().await;
        let _idle = self.poll_lock.lock().await;
        debug!(address = %self.address, "Session shut down");
    }

    fn publish_poll(&self, success: bool) {
        self.events.send(ValveEvent::PollCompleted {
            address: self.address.clone(),
            success,
            at: OffsetDateTime::now_utc(),
        });
    }

    fn publish_authentication(&self, password: &DecodedPassword) {
        self.events.send(ValveEvent::Authentication {
            address: self.address.clone(),
            state: password.state,
            authentication_state: password.authentication_state,
        });
    }

    fn publish_lockout(&self, locked_out: bool) {
        self.events.send(ValveEvent::LockoutChanged {
            address: self.address.clone(),
            locked_out,
        });
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

/// An unanswered request is an expected outcome, not a failed poll.
fn unanswered_as_none<T>(result: Result<T>) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(Error::NoResponse { request }) => {
            trace!(%request, "Request unanswered");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

fn device_list_from(packet: &[u8], classification: &Classification) -> Option<DeviceListResponse> {
    if !is_device_list_packet(packet) {
        return None;
    }
    parse_device_list(packet, classification).ok()
}
