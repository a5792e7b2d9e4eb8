//! Passive advertisement scanner.
//!
//! Listens to adapter events, turns peripheral properties into
//! [`Advertisement`]s and feeds them to a [`ValveDiscovery`]. Valves that stay
//! silent longer than the stale timeout are reported lost.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use btleplug::api::{Central, CentralEvent, Peripheral as _, PeripheralProperties, ScanFilter};
use btleplug::platform::{Adapter, PeripheralId};
use futures::StreamExt;
use tokio::time::{Instant, MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::advertisement::Advertisement;
use crate::btle::create_identifier;
use crate::discovery::{ChangeKind, ValveDiscovery};
use crate::error::Result;

/// Options for the passive scanner.
#[derive(Debug, Clone)]
pub struct ScannerOptions {
    /// Silence after which a valve is reported lost.
    pub stale_after: Duration,
    /// How often silent valves are checked.
    pub sweep_interval: Duration,
}

impl Default for ScannerOptions {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(5 * 60),
            sweep_interval: Duration::from_secs(30),
        }
    }
}

impl ScannerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn stale_after(mut self, duration: Duration) -> Self {
        self.stale_after = duration;
        self
    }

    #[must_use]
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }
}

/// Last time each valve was heard.
#[derive(Debug, Default)]
pub struct StaleTracker {
    heard: HashMap<String, Instant>,
}

impl StaleTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn touch(&mut self, address: &str, now: Instant) {
        self.heard.insert(address.to_string(), now);
    }

    /// Remove and return every address not heard within `stale_after`.
    pub fn expire(&mut self, now: Instant, stale_after: Duration) -> Vec<String> {
        let stale: Vec<String> = self
            .heard
            .iter()
            .filter(|(_, heard)| now.saturating_duration_since(**heard) > stale_after)
            .map(|(address, _)| address.clone())
            .collect();
        for address in &stale {
            self.heard.remove(address);
        }
        stale
    }

    pub fn len(&self) -> usize {
        self.heard.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heard.is_empty()
    }
}

/// Map a central event to the peripheral it concerns and the discovery change it means.
///
/// Events that say nothing about a device's presence map to `None`.
#[must_use]
pub fn change_for_event(event: CentralEvent) -> Option<(PeripheralId, ChangeKind)> {
    match event {
        CentralEvent::DeviceDiscovered(id)
        | CentralEvent::DeviceUpdated(id)
        | CentralEvent::ManufacturerDataAdvertisement { id, .. } => Some((id, ChangeKind::Seen)),
        CentralEvent::DeviceDisconnected(id) => Some((id, ChangeKind::Disconnected)),
        _ => None,
    }
}

/// Build an advertisement from peripheral properties.
///
/// btleplug does not expose the raw frame, so one is synthesized from the
/// manufacturer-data map.
#[must_use]
pub fn advertisement_from_properties(
    address: &str,
    properties: &PeripheralProperties,
) -> Advertisement {
    let mut advertisement = Advertisement::new(address);
    advertisement.name = properties.local_name.clone();
    advertisement.rssi = properties.rssi;
    advertisement.manufacturer_data = properties.manufacturer_data.clone();
    let raw = Advertisement::synthesize_raw(&advertisement.manufacturer_data);
    advertisement.with_raw(raw)
}

/// Feeds adapter advertisements into a discovery registry.
pub struct AdvertisementScanner {
    adapter: Adapter,
    discovery: Arc<ValveDiscovery>,
    options: ScannerOptions,
    tracker: std::sync::Mutex<StaleTracker>,
}

impl std::fmt::Debug for AdvertisementScanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdvertisementScanner")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl AdvertisementScanner {
    pub fn new(adapter: Adapter, discovery: Arc<ValveDiscovery>, options: ScannerOptions) -> Self {
        Self {
            adapter,
            discovery,
            options,
            tracker: std::sync::Mutex::new(StaleTracker::new()),
        }
    }

    pub fn discovery(&self) -> &Arc<ValveDiscovery> {
        &self.discovery
    }

    /// Start scanning in a background task until `cancel_token` fires.
    pub fn start(self: &Arc<Self>, cancel_token: CancellationToken) -> tokio::task::JoinHandle<()> {
        let scanner = Arc::clone(self);
        tokio::spawn(async move {
            info!("Starting advertisement scanner");
            if let Err(e) = scanner.run(&cancel_token).await {
                warn!("Advertisement scanner stopped: {}", e);
            }
        })
    }

    async fn run(&self, cancel_token: &CancellationToken) -> Result<()> {
        let mut events = self.adapter.events().await?;
        self.adapter.start_scan(ScanFilter::default()).await?;

        let mut sweep = interval(self.options.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => {
                    info!("Advertisement scanner cancelled");
                    break;
                }
                event = events.next() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => break,
                },
                _ = sweep.tick() => self.expire_stale(),
            }
        }

        self.adapter.stop_scan().await?;
        Ok(())
    }

    async fn handle_event(&self, event: CentralEvent) {
        let Some((id, change)) = change_for_event(event) else {
            return;
        };
        let Ok(peripheral) = self.adapter.peripheral(&id).await else {
            return;
        };
        let Ok(Some(properties)) = peripheral.properties().await else {
            return;
        };
        let address = create_identifier(&properties.address.to_string(), &id);

        if change.is_lost() {
            self.discovery.handle_unreachable(&address, change);
            return;
        }

        let advertisement = advertisement_from_properties(&address, &properties);
        if self.discovery.handle_sighting(advertisement, change).is_some() {
            self.tracker
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .touch(&address, Instant::now());
        }
    }

    fn expire_stale(&self) {
        let stale = self
            .tracker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .expire(Instant::now(), self.options.stale_after);
        for address in stale {
            debug!(%address, "Valve silent for too long");
            self.discovery.handle_lost(&address);
        }
    }
}
