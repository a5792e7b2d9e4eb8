//! GATT collaborator traits and request-characteristic resolution.
//!
//! The session never talks to a Bluetooth stack directly. It drives a
//! [`GattConnector`] to open connections and a [`GattClient`] to write
//! requests and receive notifications. [`crate::btle`] implements these on
//! top of btleplug; [`crate::mock`] provides a scripted valve for tests.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use uuid::Uuid;

use chandler_types::uuid::GATT_PROFILES;

use crate::error::Result;
use crate::protocol::REQUEST_LEN;

/// Property flags of a characteristic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CharProperties {
    pub write: bool,
    pub write_without_response: bool,
    pub notify: bool,
    pub indicate: bool,
}

impl CharProperties {
    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.write || self.write_without_response
    }

    #[must_use]
    pub fn is_notifying(&self) -> bool {
        self.notify || self.indicate
    }
}

/// A characteristic discovered on a connected valve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattCharacteristic {
    pub uuid: Uuid,
    /// UUID of the owning service.
    pub service: Uuid,
    pub properties: CharProperties,
    /// Largest write-without-response payload, when the backend knows it.
    pub max_write_without_response: Option<usize>,
}

impl GattCharacteristic {
    pub fn new(uuid: Uuid, service: Uuid, properties: CharProperties) -> Self {
        Self {
            uuid,
            service,
            properties,
            max_write_without_response: None,
        }
    }

    /// Set the write-without-response size limit.
    #[must_use]
    pub fn with_max_write_without_response(mut self, size: usize) -> Self {
        self.max_write_without_response = Some(size);
        self
    }

    /// Whether a full request can be written to this characteristic.
    ///
    /// A characteristic limited to write-without-response is rejected when
    /// its reported payload limit is below the request length.
    #[must_use]
    pub fn accepts_requests(&self) -> bool {
        if !self.properties.is_writable() {
            return false;
        }
        if !self.properties.write_without_response {
            return true;
        }
        self.max_write_without_response
            .is_none_or(|max| max >= REQUEST_LEN)
    }

    /// Whether writes should ask for a response.
    #[must_use]
    pub fn write_with_response(&self) -> bool {
        self.properties.write
    }
}

/// A GATT service and its characteristics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattService {
    pub uuid: Uuid,
    pub characteristics: Vec<GattCharacteristic>,
}

/// A value pushed by the valve on a notify/indicate characteristic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub uuid: Uuid,
    pub value: Vec<u8>,
}

/// Stream of notifications from every subscribed characteristic.
pub type NotificationStream = Pin<Box<dyn Stream<Item = Notification> + Send>>;

/// An open GATT connection to one valve.
#[async_trait]
pub trait GattClient: Send + Sync {
    /// Services discovered on the connection.
    async fn services(&self) -> Result<Vec<GattService>>;

    /// Write `data` to the characteristic `uuid`.
    async fn write(&self, uuid: Uuid, data: &[u8], with_response: bool) -> Result<()>;

    /// Enable notifications on `uuid`.
    async fn subscribe(&self, uuid: Uuid) -> Result<()>;

    /// Disable notifications on `uuid`.
    async fn unsubscribe(&self, uuid: Uuid) -> Result<()>;

    /// Stream of notifications received after this call.
    async fn notifications(&self) -> Result<NotificationStream>;

    async fn is_connected(&self) -> bool;

    async fn disconnect(&self) -> Result<()>;
}

/// Opens GATT connections by address.
#[async_trait]
pub trait GattConnector: Send + Sync + 'static {
    type Client: GattClient + 'static;

    /// Whether a connectable handle is currently known for `address`.
    async fn is_connectable(&self, address: &str) -> bool;

    /// Open a connection; implementations should give up after `timeout`.
    async fn connect(&self, address: &str, timeout: Duration) -> Result<Self::Client>;
}

/// Pick the characteristic used for requests.
///
/// Known vendor profiles are tried in priority order, then any other
/// characteristic that accepts writes.
#[must_use]
pub fn resolve_request_characteristic(services: &[GattService]) -> Option<GattCharacteristic> {
    let all = || services.iter().flat_map(|s| s.characteristics.iter());

    for profile in &GATT_PROFILES {
        let candidate = all().find(|c| {
            c.uuid == profile.write && c.service == profile.service && c.properties.is_writable()
        });
        if let Some(characteristic) = candidate
            && characteristic.accepts_requests()
        {
            return Some(characteristic.clone());
        }
    }

    all().find(|c| c.accepts_requests()).cloned()
}

/// Every characteristic that can push notifications or indications.
#[must_use]
pub fn notifying_characteristics(services: &[GattService]) -> Vec<Uuid> {
    let mut uuids: Vec<Uuid> = services
        .iter()
        .flat_map(|s| s.characteristics.iter())
        .filter(|c| c.properties.is_notifying())
        .map(|c| c.uuid)
        .collect();
    uuids.dedup();
    uuids
}

#[cfg(test)]
mod tests {
    use super::*;
    use chandler_types::uuid::{
        LEGACY_SERVICE, LEGACY_WRITE, NUS_NOTIFY, NUS_SERVICE, NUS_WRITE,
    };

    const WRITE: CharProperties = CharProperties {
        write: true,
        write_without_response: false,
        notify: false,
        indicate: false,
    };

    const WRITE_NO_RESPONSE: CharProperties = CharProperties {
        write: false,
        write_without_response: true,
        notify: false,
        indicate: false,
    };

    const NOTIFY: CharProperties = CharProperties {
        write: false,
        write_without_response: false,
        notify: true,
        indicate: false,
    };

    fn service(uuid: Uuid, characteristics: Vec<GattCharacteristic>) -> GattService {
        GattService {
            uuid,
            characteristics,
        }
    }

    #[test]
    fn test_profile_priority() {
        let services = vec![
            service(
                NUS_SERVICE,
                vec![
                    GattCharacteristic::new(NUS_WRITE, NUS_SERVICE, WRITE),
                    GattCharacteristic::new(NUS_NOTIFY, NUS_SERVICE, NOTIFY),
                ],
            ),
            service(
                LEGACY_SERVICE,
                vec![GattCharacteristic::new(LEGACY_WRITE, LEGACY_SERVICE, WRITE)],
            ),
        ];
        let resolved = resolve_request_characteristic(&services).unwrap();
        assert_eq!(resolved.uuid, LEGACY_WRITE);
    }

    #[test]
    fn test_profile_requires_matching_service() {
        let other = Uuid::from_u128(0x1234);
        let services = vec![
            service(
                other,
                vec![GattCharacteristic::new(LEGACY_WRITE, other, WRITE)],
            ),
            service(
                NUS_SERVICE,
                vec![GattCharacteristic::new(NUS_WRITE, NUS_SERVICE, WRITE)],
            ),
        ];
        let resolved = resolve_request_characteristic(&services).unwrap();
        assert_eq!(resolved.uuid, NUS_WRITE);
    }

    #[test]
    fn test_small_write_without_response_rejected() {
        let small = GattCharacteristic::new(NUS_WRITE, NUS_SERVICE, WRITE_NO_RESPONSE)
            .with_max_write_without_response(REQUEST_LEN - 1);
        assert!(!small.accepts_requests());

        let generic = Uuid::from_u128(0xABCD);
        let services = vec![service(
            NUS_SERVICE,
            vec![
                small,
                GattCharacteristic::new(generic, NUS_SERVICE, WRITE_NO_RESPONSE)
                    .with_max_write_without_response(REQUEST_LEN),
            ],
        )];
        let resolved = resolve_request_characteristic(&services).unwrap();
        assert_eq!(resolved.uuid, generic);
        assert!(!resolved.write_with_response());
    }

    #[test]
    fn test_unknown_limit_is_accepted() {
        let c = GattCharacteristic::new(NUS_WRITE, NUS_SERVICE, WRITE_NO_RESPONSE);
        assert!(c.accepts_requests());
    }

    #[test]
    fn test_generic_fallback_and_none() {
        let generic = Uuid::from_u128(0x42);
        let services = vec![service(
            generic,
            vec![
                GattCharacteristic::new(Uuid::from_u128(0x43), generic, NOTIFY),
                GattCharacteristic::new(generic, generic, WRITE),
            ],
        )];
        assert_eq!(
            resolve_request_characteristic(&services).map(|c| c.uuid),
            Some(generic)
        );

        let read_only = vec![service(
            generic,
            vec![GattCharacteristic::new(generic, generic, NOTIFY)],
        )];
        assert_eq!(resolve_request_characteristic(&read_only), None);
        assert_eq!(resolve_request_characteristic(&[]), None);
    }

    #[test]
    fn test_notifying_characteristics() {
        let services = vec![service(
            NUS_SERVICE,
            vec![
                GattCharacteristic::new(NUS_WRITE, NUS_SERVICE, WRITE),
                GattCharacteristic::new(NUS_NOTIFY, NUS_SERVICE, NOTIFY),
            ],
        )];
        assert_eq!(notifying_characteristics(&services), vec![NUS_NOTIFY]);
    }
}
