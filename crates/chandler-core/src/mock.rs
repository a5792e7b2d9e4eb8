//! Mock GATT backend for testing.
//!
//! [`MockConnector`] implements [`GattConnector`] over a set of scripted
//! [`MockValve`]s, so sessions and the manager can be exercised without
//! Bluetooth hardware.
//!
//! # Features
//!
//! - **Scripted valve**: answers DeviceList and Dashboard requests and
//!   verifies authentication payloads against a passcode
//! - **Failure injection**: refuse connections or fail writes
//! - **Latency simulation**: delay connects to exercise timeouts
//! - **Custom behavior**: replace the responder with any closure

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock as StdRwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock, broadcast};

use chandler_types::uuid::{GATT_PROFILES, GattProfile};
use chandler_types::{AUTHENTICATED_STATUS, NOT_AUTHENTICATED_STATUS, Passcode, RequestCommand};

use crate::auth::{is_auth_payload, verify_auth_payload};
use crate::error::{Error, Result};
use crate::gatt::{
    CharProperties, GattCharacteristic, GattClient, GattConnector, GattService, Notification,
    NotificationStream,
};

/// Computes the notifications sent in reply to a write.
pub type Responder = Arc<dyn Fn(&[u8]) -> Vec<Vec<u8>> + Send + Sync>;

/// A well-formed six-packet Dashboard burst in wire order.
///
/// Decodes to 9:41 pm, battery raw 100 (91 %), present flow 12.34,
/// peak flow 45.6, 500 left until regeneration and 123 used.
#[must_use]
pub fn sample_dashboard_burst() -> Vec<Vec<u8>> {
    let mut first = vec![117, 117, 0];
    first.extend_from_slice(&[
        9, 41, 1, // 9:41 pm
        100, // battery raw
        0x04, 0xD2, // present flow 1234
        0x01, 0xF4, // remaining 500
        0x00, 0x7B, // usage 123
        0x11, 0xD0, // peak flow 4560
        17, // hardness
        2, 0, // regen 2 am
        0b0001_0101, // shutoff setting, shutoff active, display off
    ]);
    first.push(57);

    let mut second = vec![117, 117, 1];
    second.extend_from_slice(&[14, 3, 4, 5, 6, 1, 0, 0x08, 30, 0x00, 0, 0, 0, 0, 0, 2]);
    second.push(58);

    let mut third = vec![117, 117, 2];
    third.extend((1..=17).map(|i| i as u8));
    let fourth: Vec<u8> = (18..38).map(|i| i as u8).collect();
    let fifth: Vec<u8> = (38..58).map(|i| i as u8).collect();
    let sixth = vec![58, 59, 60, 61, 62, 58];

    vec![first, second, third, fourth, fifth, sixth]
}

/// Build a DeviceList response.
#[must_use]
pub fn device_list_response(twin: bool, status: u8, counter: u8, serial: [u8; 4]) -> Vec<u8> {
    let opcode = RequestCommand::DeviceList.opcode();
    let mut packet = vec![opcode, opcode, u8::from(twin), 0, 0, 0, 0, status];
    packet.extend_from_slice(&[0, 0, 0, counter, 0]);
    packet.extend_from_slice(&serial);
    packet.extend_from_slice(&[0, 0, 0]);
    packet
}

/// Behavior of a scripted valve.
#[derive(Debug, Clone)]
pub struct ValveScript {
    /// Passcode the valve accepts. `None` means the valve never requires one.
    pub passcode: Option<Passcode>,
    pub twin: bool,
    pub connection_counter: u8,
    pub serial: [u8; 4],
    /// Notifications sent for a Dashboard request.
    pub dashboard: Vec<Vec<u8>>,
    /// Status reported before authentication succeeds.
    pub unauthenticated_status: u8,
}

impl Default for ValveScript {
    fn default() -> Self {
        Self {
            passcode: None,
            twin: true,
            connection_counter: 7,
            serial: [0x12, 0xAB, 0x00, 0x7F],
            dashboard: sample_dashboard_burst(),
            unauthenticated_status: NOT_AUTHENTICATED_STATUS,
        }
    }
}

impl ValveScript {
    fn into_responder(self) -> Responder {
        let authenticated = Arc::new(AtomicBool::new(self.passcode.is_none()));
        Arc::new(move |request: &[u8]| {
            let status = |ok: bool| {
                if ok {
                    AUTHENTICATED_STATUS
                } else {
                    self.unauthenticated_status
                }
            };
            let device_list = |ok: bool| {
                device_list_response(self.twin, status(ok), self.connection_counter, self.serial)
            };

            if is_auth_payload(request) {
                let accepted = self
                    .passcode
                    .is_some_and(|p| verify_auth_payload(request, p));
                if accepted {
                    authenticated.store(true, Ordering::SeqCst);
                }
                return vec![device_list(accepted)];
            }

            match request.first().copied().map(RequestCommand::from) {
                Some(RequestCommand::DeviceList) => {
                    vec![device_list(authenticated.load(Ordering::SeqCst))]
                }
                Some(RequestCommand::Dashboard) => self.dashboard.clone(),
                _ => Vec::new(),
            }
        })
    }
}

struct MockState {
    profile: GattProfile,
    max_write_without_response: Option<usize>,
    write_with_response: bool,
    connectable: AtomicBool,
    connected: AtomicBool,
    fail_connect: AtomicBool,
    fail_writes: AtomicBool,
    connect_latency_ms: AtomicU64,
    connect_attempts: AtomicU32,
    custom_responder: AtomicBool,
    script: ValveScript,
    responder: RwLock<Responder>,
    writes: Mutex<Vec<Vec<u8>>>,
    subscribed: Mutex<HashSet<uuid::Uuid>>,
    notifications: broadcast::Sender<Notification>,
}

/// A scripted valve. Clones share state.
#[derive(Clone)]
pub struct MockValve {
    state: Arc<MockState>,
}

impl std::fmt::Debug for MockValve {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockValve")
            .field("profile", &self.state.profile.name)
            .field("connected", &self.state.connected.load(Ordering::Relaxed))
            .field(
                "connect_attempts",
                &self.state.connect_attempts.load(Ordering::Relaxed),
            )
            .finish()
    }
}

impl MockValve {
    /// A valve that needs no passcode and answers every request.
    pub fn new() -> Self {
        MockValveBuilder::new().build()
    }

    pub fn builder() -> MockValveBuilder {
        MockValveBuilder::new()
    }

    /// Replace the responder. It stays in place across reconnects.
    pub async fn respond_with<F>(&self, responder: F)
    where
        F: Fn(&[u8]) -> Vec<Vec<u8>> + Send + Sync + 'static,
    {
        *self.state.responder.write().await = Arc::new(responder);
        self.state.custom_responder.store(true, Ordering::SeqCst);
    }

    pub fn set_connectable(&self, connectable: bool) {
        self.state.connectable.store(connectable, Ordering::SeqCst);
    }

    /// Make every connect attempt fail.
    pub fn set_fail_connect(&self, fail: bool) {
        self.state.fail_connect.store(fail, Ordering::SeqCst);
    }

    /// Make every write fail.
    pub fn set_fail_writes(&self, fail: bool) {
        self.state.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn set_connect_latency(&self, latency: Duration) {
        self.state
            .connect_latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Drop the link as if the valve went out of range.
    pub fn simulate_disconnect(&self) {
        self.state.connected.store(false, Ordering::SeqCst);
    }

    /// Push a notification on the profile's notify characteristic.
    pub async fn push_notification(&self, value: Vec<u8>) {
        self.state.notify(value).await;
    }

    pub fn connect_attempts(&self) -> u32 {
        self.state.connect_attempts.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.state.connected.load(Ordering::SeqCst)
    }

    /// Every payload written so far.
    pub async fn writes(&self) -> Vec<Vec<u8>> {
        self.state.writes.lock().await.clone()
    }

    /// Number of writes whose first byte is `command`'s opcode.
    pub async fn request_count(&self, command: RequestCommand) -> usize {
        self.state
            .writes
            .lock()
            .await
            .iter()
            .filter(|w| w.first() == Some(&command.opcode()) && !is_auth_payload(w))
            .count()
    }

    /// Number of authentication payloads written so far.
    pub async fn auth_attempts(&self) -> usize {
        self.state
            .writes
            .lock()
            .await
            .iter()
            .filter(|w| is_auth_payload(w))
            .count()
    }

    pub fn script(&self) -> &ValveScript {
        &self.state.script
    }

    fn services(&self) -> Vec<GattService> {
        let profile = &self.state.profile;
        let write = CharProperties {
            write: self.state.write_with_response,
            write_without_response: true,
            ..Default::default()
        };
        let notify = CharProperties {
            notify: true,
            ..Default::default()
        };
        let mut write_char = GattCharacteristic::new(profile.write, profile.service, write);
        write_char.max_write_without_response = self.state.max_write_without_response;
        vec![GattService {
            uuid: profile.service,
            characteristics: vec![
                write_char,
                GattCharacteristic::new(profile.notify, profile.service, notify),
            ],
        }]
    }
}

impl Default for MockValve {
    fn default() -> Self {
        Self::new()
    }
}

impl MockState {
    async fn notify(&self, value: Vec<u8>) {
        if !self.subscribed.lock().await.contains(&self.profile.notify) {
            return;
        }
        // Ignore error if no receivers
        let _ = self.notifications.send(Notification {
            uuid: self.profile.notify,
            value,
        });
    }
}

/// Builder for [`MockValve`].
#[derive(Debug, Clone)]
pub struct MockValveBuilder {
    profile: GattProfile,
    max_write_without_response: Option<usize>,
    write_with_response: bool,
    connectable: bool,
    script: ValveScript,
}

impl Default for MockValveBuilder {
    fn default() -> Self {
        Self {
            profile: GATT_PROFILES[0],
            max_write_without_response: None,
            write_with_response: true,
            connectable: true,
            script: ValveScript::default(),
        }
    }
}

impl MockValveBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// GATT profile exposed by the valve.
    #[must_use]
    pub fn profile(mut self, profile: GattProfile) -> Self {
        self.profile = profile;
        self
    }

    /// Expose only write-without-response with the given size limit.
    #[must_use]
    pub fn write_without_response_only(mut self, max_size: usize) -> Self {
        self.write_with_response = false;
        self.max_write_without_response = Some(max_size);
        self
    }

    #[must_use]
    pub fn connectable(mut self, connectable: bool) -> Self {
        self.connectable = connectable;
        self
    }

    /// Require authentication with `passcode`.
    #[must_use]
    pub fn passcode(mut self, passcode: Passcode) -> Self {
        self.script.passcode = Some(passcode);
        self
    }

    #[must_use]
    pub fn serial(mut self, serial: [u8; 4]) -> Self {
        self.script.serial = serial;
        self
    }

    #[must_use]
    pub fn dashboard(mut self, packets: Vec<Vec<u8>>) -> Self {
        self.script.dashboard = packets;
        self
    }

    #[must_use]
    pub fn unauthenticated_status(mut self, status: u8) -> Self {
        self.script.unauthenticated_status = status;
        self
    }

    #[must_use]
    pub fn script(mut self, script: ValveScript) -> Self {
        self.script = script;
        self
    }

    pub fn build(self) -> MockValve {
        let (notifications, _) = broadcast::channel(64);
        MockValve {
            state: Arc::new(MockState {
                profile: self.profile,
                max_write_without_response: self.max_write_without_response,
                write_with_response: self.write_with_response,
                connectable: AtomicBool::new(self.connectable),
                connected: AtomicBool::new(false),
                fail_connect: AtomicBool::new(false),
                fail_writes: AtomicBool::new(false),
                connect_latency_ms: AtomicU64::new(0),
                connect_attempts: AtomicU32::new(0),
                custom_responder: AtomicBool::new(false),
                responder: RwLock::new(self.script.clone().into_responder()),
                script: self.script,
                writes: Mutex::new(Vec::new()),
                subscribed: Mutex::new(HashSet::new()),
                notifications,
            }),
        }
    }
}

/// Connection to a [`MockValve`].
pub struct MockClient {
    valve: MockValve,
}

impl std::fmt::Debug for MockClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockClient")
            .field("valve", &self.valve)
            .finish()
    }
}

#[async_trait]
impl GattClient for MockClient {
    async fn services(&self) -> Result<Vec<GattService>> {
        if !self.valve.is_connected() {
            return Err(Error::NotConnected);
        }
        Ok(self.valve.services())
    }

    async fn write(&self, uuid: uuid::Uuid, data: &[u8], _with_response: bool) -> Result<()> {
        let state = &self.valve.state;
        if !self.valve.is_connected() {
            return Err(Error::NotConnected);
        }
        if state.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::write_failed(uuid, "mock write failure"));
        }
        if uuid != state.profile.write {
            return Err(Error::write_failed(uuid, "not writable"));
        }

        state.writes.lock().await.push(data.to_vec());
        let responder = Arc::clone(&*state.responder.read().await);
        for packet in responder(data) {
            state.notify(packet).await;
        }
        Ok(())
    }

    async fn subscribe(&self, uuid: uuid::Uuid) -> Result<()> {
        self.valve.state.subscribed.lock().await.insert(uuid);
        Ok(())
    }

    async fn unsubscribe(&self, uuid: uuid::Uuid) -> Result<()> {
        self.valve.state.subscribed.lock().await.remove(&uuid);
        Ok(())
    }

    async fn notifications(&self) -> Result<NotificationStream> {
        let rx = self.valve.state.notifications.subscribe();
        let stream = futures::stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(notification) => return Some((notification, rx)),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(Box::pin(stream))
    }

    async fn is_connected(&self) -> bool {
        self.valve.is_connected()
    }

    async fn disconnect(&self) -> Result<()> {
        let state = &self.valve.state;
        state.connected.store(false, Ordering::SeqCst);
        state.subscribed.lock().await.clear();
        Ok(())
    }
}

/// Connector over a set of mock valves keyed by address.
#[derive(Debug, Default)]
pub struct MockConnector {
    valves: StdRwLock<HashMap<String, MockValve>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a valve.
    #[must_use]
    pub fn with_valve(self, address: impl Into<String>, valve: MockValve) -> Self {
        self.add_valve(address, valve);
        self
    }

    pub fn add_valve(&self, address: impl Into<String>, valve: MockValve) {
        self.valves
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(address.into(), valve);
    }

    fn valve(&self, address: &str) -> Option<MockValve> {
        self.valves
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(address)
            .cloned()
    }
}

#[async_trait]
impl GattConnector for MockConnector {
    type Client = MockClient;

    async fn is_connectable(&self, address: &str) -> bool {
        self.valve(address)
            .is_some_and(|v| v.state.connectable.load(Ordering::SeqCst))
    }

    async fn connect(&self, address: &str, _timeout: Duration) -> Result<MockClient> {
        let valve = self
            .valve(address)
            .ok_or_else(|| Error::NotConnectable(address.to_string()))?;
        let state = &valve.state;
        state.connect_attempts.fetch_add(1, Ordering::SeqCst);

        let latency = state.connect_latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if state.fail_connect.load(Ordering::SeqCst) {
            return Err(Error::connection_failed(address, "mock connection failure"));
        }

        // Authentication does not survive a reconnect.
        if !state.custom_responder.load(Ordering::SeqCst) {
            *state.responder.write().await = state.script.clone().into_responder();
        }
        state.connected.store(true, Ordering::SeqCst);
        Ok(MockClient { valve })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::new_auth_payload;
    use crate::protocol::request_payload;
    use futures::StreamExt;

    const ADDRESS: &str = "AA:BB:CC:DD:EE:01";

    async fn connect(valve: &MockValve) -> MockClient {
        let connector = MockConnector::new().with_valve(ADDRESS, valve.clone());
        connector
            .connect(ADDRESS, Duration::from_secs(1))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_connect_counts_attempts() {
        let valve = MockValve::new();
        let connector = MockConnector::new().with_valve(ADDRESS, valve.clone());
        assert!(connector.is_connectable(ADDRESS).await);
        assert!(!connector.is_connectable("unknown").await);

        connector.connect(ADDRESS, Duration::ZERO).await.unwrap();
        assert_eq!(valve.connect_attempts(), 1);
        assert!(valve.is_connected());

        valve.set_fail_connect(true);
        assert!(connector.connect(ADDRESS, Duration::ZERO).await.is_err());
        assert_eq!(valve.connect_attempts(), 2);
    }

    #[tokio::test]
    async fn test_notifications_require_subscription() {
        let valve = MockValve::new();
        let client = connect(&valve).await;
        let notify = valve.state.profile.notify;
        let write = valve.state.profile.write;

        let mut stream = client.notifications().await.unwrap();
        client
            .write(write, &request_payload(RequestCommand::DeviceList), true)
            .await
            .unwrap();
        client.subscribe(notify).await.unwrap();
        client
            .write(write, &request_payload(RequestCommand::DeviceList), true)
            .await
            .unwrap();

        let first = stream.next().await.unwrap();
        assert_eq!(first.uuid, notify);
        assert_eq!(first.value[7], AUTHENTICATED_STATUS);
        assert_eq!(valve.request_count(RequestCommand::DeviceList).await, 2);
    }

    #[tokio::test]
    async fn test_scripted_authentication() {
        let valve = MockValve::builder().passcode(Passcode::new(4321)).build();
        let client = connect(&valve).await;
        let notify = valve.state.profile.notify;
        let write = valve.state.profile.write;
        client.subscribe(notify).await.unwrap();
        let mut stream = client.notifications().await.unwrap();

        client
            .write(write, &new_auth_payload(Passcode::new(1111)), true)
            .await
            .unwrap();
        assert_eq!(stream.next().await.unwrap().value[7], 0);

        client
            .write(write, &new_auth_payload(Passcode::new(4321)), true)
            .await
            .unwrap();
        assert_eq!(stream.next().await.unwrap().value[7], AUTHENTICATED_STATUS);
        assert_eq!(valve.auth_attempts().await, 2);
    }

    #[tokio::test]
    async fn test_dashboard_burst_and_failures() {
        let valve = MockValve::new();
        let client = connect(&valve).await;
        let (notify, write) = (valve.state.profile.notify, valve.state.profile.write);
        client.subscribe(notify).await.unwrap();
        let stream = client.notifications().await.unwrap();

        client
            .write(write, &request_payload(RequestCommand::Dashboard), true)
            .await
            .unwrap();
        let packets: Vec<_> = stream.take(6).map(|n| n.value).collect().await;
        assert_eq!(packets, sample_dashboard_burst());

        valve.set_fail_writes(true);
        assert!(client.write(write, &[0; 20], true).await.is_err());
        valve.simulate_disconnect();
        assert!(!client.is_connected().await);
        assert!(client.services().await.is_err());
    }

    #[test]
    fn test_device_list_response_layout() {
        let packet = device_list_response(true, 128, 9, [1, 2, 3, 4]);
        assert_eq!(packet.len(), 20);
        assert_eq!(&packet[..3], &[116, 116, 1]);
        assert_eq!(packet[7], 128);
        assert_eq!(packet[11], 9);
        assert_eq!(&packet[13..17], &[1, 2, 3, 4]);
    }
}
