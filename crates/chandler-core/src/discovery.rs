//! Registry of valves seen by the passive scanner.
//!
//! Every sighting is classified; only trustworthy classifications are kept.
//! When a sighting carries a payload that failed structural validation the
//! last good classification for that address is retained.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use chandler_types::Classification;

use crate::advertisement::{Advertisement, classify};
use crate::events::{ListenerId, ListenerRegistry};

/// Kind of change reported by the scanner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    /// A new advertisement was received.
    Seen,
    /// The device has not been heard from for too long.
    Lost,
    /// The device is visible but cannot currently be connected to.
    Unavailable,
    /// A connection to the device was dropped.
    Disconnected,
}

impl ChangeKind {
    /// True for changes that mean the valve can no longer be reached.
    #[must_use]
    pub fn is_lost(self) -> bool {
        matches!(
            self,
            ChangeKind::Lost | ChangeKind::Unavailable | ChangeKind::Disconnected
        )
    }
}

/// A valve advertisement together with its trusted classification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValveAdvertisement {
    pub advertisement: Advertisement,
    pub classification: Classification,
}

impl ValveAdvertisement {
    pub fn address(&self) -> &str {
        &self.advertisement.address
    }
}

/// Change delivered to discovery listeners.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveryUpdate {
    pub address: String,
    pub change: ChangeKind,
    /// Latest trusted advertisement. `None` for [`ChangeKind::Lost`] and for
    /// changes about addresses that were never trusted.
    pub valve: Option<ValveAdvertisement>,
}

/// Last trusted advertisement per address plus change listeners.
#[derive(Debug, Default)]
pub struct ValveDiscovery {
    valves: RwLock<HashMap<String, ValveAdvertisement>>,
    listeners: ListenerRegistry<DiscoveryUpdate>,
}

impl ValveDiscovery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a sighting and notify listeners.
    ///
    /// Returns the stored advertisement, or `None` when the sighting is not a
    /// valve or its payload cannot be trusted and no earlier one exists.
    pub fn handle_sighting(
        &self,
        advertisement: Advertisement,
        change: ChangeKind,
    ) -> Option<ValveAdvertisement> {
        let classification = classify(&advertisement)?;
        let address = advertisement.address.clone();

        let stored = {
            let mut valves = self.valves.write().unwrap_or_else(PoisonError::into_inner);
            let previous = valves.get(&address);

            let classification = if classification.should_discard() {
                debug!(%address, "Discarding untrusted valve advertisement");
                return None;
            } else if !classification.valve_data_parsed
                && let Some(previous) = previous
                && previous.classification.valve_data_parsed
            {
                trace!(%address, "Keeping previous classification over unparsed payload");
                previous.classification.clone()
            } else {
                classification
            };

            let valve = ValveAdvertisement {
                advertisement,
                classification,
            };
            valves.insert(address.clone(), valve.clone());
            valve
        };

        self.listeners.notify(&DiscoveryUpdate {
            address,
            change,
            valve: Some(stored.clone()),
        });
        Some(stored)
    }

    /// Forget an address after the scanner reported it lost.
    pub fn handle_lost(&self, address: &str) {
        let removed = self
            .valves
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(address);
        if removed.is_none() {
            return;
        }
        debug!(%address, "Valve lost");
        self.listeners.notify(&DiscoveryUpdate {
            address: address.to_string(),
            change: ChangeKind::Lost,
            valve: None,
        });
    }

    /// Report that a known valve became unreachable without forgetting it.
    ///
    /// Unknown addresses are ignored.
    pub fn handle_unreachable(&self, address: &str, change: ChangeKind) {
        let Some(valve) = self.get(address) else {
            return;
        };
        debug!(%address, ?change, "Valve unreachable");
        self.listeners.notify(&DiscoveryUpdate {
            address: address.to_string(),
            change,
            valve: Some(valve),
        });
    }

    #[must_use]
    pub fn get(&self, address: &str) -> Option<ValveAdvertisement> {
        self.valves
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(address)
            .cloned()
    }

    /// All currently known valves.
    #[must_use]
    pub fn all(&self) -> Vec<ValveAdvertisement> {
        self.valves
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn add_listener<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&DiscoveryUpdate) + Send + Sync + 'static,
    {
        self.listeners.add(callback)
    }

    /// Remove a listener. Removing twice is harmless.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chandler_types::uuid::CSI_MANUFACTURER_ID;
    use std::sync::{Arc, Mutex};

    const ADDRESS: &str = "AA:BB:CC:DD:EE:01";

    /// Classic Evb019 payload, firmware 3.05.
    fn classic_payload() -> Vec<u8> {
        vec![0x01, 0x00, 0x09, 0x1E, 0x02, 0x07, 0x01, 0x03, 0x05]
    }

    fn sighting(payload: Vec<u8>) -> Advertisement {
        let advertisement = Advertisement::new(ADDRESS)
            .with_name("CS_METER_SOFT")
            .with_rssi(-60)
            .with_manufacturer_data(CSI_MANUFACTURER_ID, payload);
        let raw = Advertisement::synthesize_raw(&advertisement.manufacturer_data);
        advertisement.with_raw(raw)
    }

    #[test]
    fn test_non_valve_is_ignored() {
        let discovery = ValveDiscovery::new();
        let other = Advertisement::new(ADDRESS).with_name("Thermo 1234");
        assert!(discovery.handle_sighting(other, ChangeKind::Seen).is_none());
        assert!(discovery.all().is_empty());
    }

    #[test]
    fn test_sighting_is_stored_and_broadcast() {
        let discovery = ValveDiscovery::new();
        let updates = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&updates);
        discovery.add_listener(move |u| sink.lock().unwrap().push(u.clone()));

        let stored = discovery
            .handle_sighting(sighting(classic_payload()), ChangeKind::Seen)
            .unwrap();
        assert_eq!(stored.address(), ADDRESS);
        assert!(stored.classification.valve_data_parsed);
        assert_eq!(discovery.get(ADDRESS), Some(stored));

        let updates = updates.lock().unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].change, ChangeKind::Seen);
    }

    #[test]
    fn test_unparsed_payload_keeps_previous_classification() {
        let discovery = ValveDiscovery::new();
        let good = discovery
            .handle_sighting(sighting(classic_payload()), ChangeKind::Seen)
            .unwrap();

        // ID only: structurally invalid, but not a discard case.
        let stored = discovery
            .handle_sighting(sighting(vec![0x01]), ChangeKind::Seen)
            .unwrap();
        assert_eq!(stored.classification, good.classification);
    }

    #[test]
    fn test_lost_removes_and_notifies_once() {
        let discovery = ValveDiscovery::new();
        let lost = Arc::new(Mutex::new(0));
        let sink = Arc::clone(&lost);
        discovery.add_listener(move |u| {
            if u.change == ChangeKind::Lost {
                *sink.lock().unwrap() += 1;
            }
        });

        discovery.handle_sighting(sighting(classic_payload()), ChangeKind::Seen);
        discovery.handle_lost(ADDRESS);
        discovery.handle_lost(ADDRESS);
        assert!(discovery.get(ADDRESS).is_none());
        assert_eq!(*lost.lock().unwrap(), 1);
    }

    #[test]
    fn test_unreachable_keeps_valve_and_notifies() {
        let discovery = ValveDiscovery::new();
        let changes = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&changes);
        discovery.add_listener(move |u| sink.lock().unwrap().push(u.change));

        discovery.handle_unreachable(ADDRESS, ChangeKind::Disconnected);
        assert!(changes.lock().unwrap().is_empty());

        discovery.handle_sighting(sighting(classic_payload()), ChangeKind::Seen);
        discovery.handle_unreachable(ADDRESS, ChangeKind::Disconnected);
        assert!(discovery.get(ADDRESS).is_some());
        assert_eq!(
            *changes.lock().unwrap(),
            vec![ChangeKind::Seen, ChangeKind::Disconnected]
        );
    }

    #[test]
    fn test_lost_class_changes() {
        assert!(!ChangeKind::Seen.is_lost());
        assert!(ChangeKind::Lost.is_lost());
        assert!(ChangeKind::Unavailable.is_lost());
        assert!(ChangeKind::Disconnected.is_lost());
    }

    #[test]
    fn test_removed_listener_is_silent() {
        let discovery = ValveDiscovery::new();
        let hits = Arc::new(Mutex::new(0));
        let sink = Arc::clone(&hits);
        let id = discovery.add_listener(move |_| *sink.lock().unwrap() += 1);
        assert!(discovery.remove_listener(id));
        assert!(!discovery.remove_listener(id));
        discovery.handle_sighting(sighting(classic_payload()), ChangeKind::Seen);
        assert_eq!(*hits.lock().unwrap(), 0);
    }
}
