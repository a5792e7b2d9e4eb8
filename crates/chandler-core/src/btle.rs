//! btleplug backend for the GATT collaborator traits.
//!
//! [`BtleConnector`] resolves an address to a peripheral already known to the
//! adapter (the passive scanner keeps that cache warm) and opens a connection.
//! [`BtleClient`] wraps the connected peripheral.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    CharPropFlags, Characteristic, Central, Manager as _, Peripheral as _, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::StreamExt;
use tokio::sync::RwLock;
use tokio::time::timeout;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::gatt::{
    CharProperties, GattCharacteristic, GattClient, GattConnector, GattService, Notification,
    NotificationStream,
};

/// Get the first available Bluetooth adapter.
pub async fn get_adapter() -> Result<Adapter> {
    let manager = Manager::new().await?;
    let adapters = manager.adapters().await?;
    adapters.into_iter().next().ok_or(Error::NoAdapter)
}

/// Format a peripheral ID as a string.
///
/// On macOS, peripheral IDs are UUIDs. On other platforms they are MAC
/// addresses.
pub fn format_peripheral_id(id: &PeripheralId) -> String {
    format!("{:?}", id)
        .trim_start_matches("PeripheralId(")
        .trim_end_matches(')')
        .to_string()
}

/// Stable identifier for a peripheral.
///
/// Uses the Bluetooth address, or the peripheral ID where the platform hides
/// addresses behind `00:00:00:00:00:00`.
pub fn create_identifier(address: &str, peripheral_id: &PeripheralId) -> String {
    if address == "00:00:00:00:00:00" {
        format_peripheral_id(peripheral_id)
    } else {
        address.to_string()
    }
}

fn identifiers_match(identifier: &str, address: &str) -> bool {
    identifier.eq_ignore_ascii_case(address)
        || identifier.replace(':', "").eq_ignore_ascii_case(&address.replace(':', ""))
}

/// Convert btleplug property flags.
#[must_use]
pub fn char_properties(flags: CharPropFlags) -> CharProperties {
    CharProperties {
        write: flags.contains(CharPropFlags::WRITE),
        write_without_response: flags.contains(CharPropFlags::WRITE_WITHOUT_RESPONSE),
        notify: flags.contains(CharPropFlags::NOTIFY),
        indicate: flags.contains(CharPropFlags::INDICATE),
    }
}

/// Opens connections through a btleplug adapter.
#[derive(Debug, Clone)]
pub struct BtleConnector {
    adapter: Adapter,
    discovery_timeout: Duration,
}

impl BtleConnector {
    pub fn new(adapter: Adapter) -> Self {
        Self {
            adapter,
            discovery_timeout: Duration::from_secs(10),
        }
    }

    /// Use the first available adapter.
    pub async fn from_default_adapter() -> Result<Self> {
        Ok(Self::new(get_adapter().await?))
    }

    #[must_use]
    pub fn discovery_timeout(mut self, timeout: Duration) -> Self {
        self.discovery_timeout = timeout;
        self
    }

    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }

    async fn find_peripheral(&self, address: &str) -> Result<Option<Peripheral>> {
        for peripheral in self.adapter.peripherals().await? {
            if let Ok(Some(props)) = peripheral.properties().await {
                let identifier = create_identifier(&props.address.to_string(), &peripheral.id());
                if identifiers_match(&identifier, address) {
                    return Ok(Some(peripheral));
                }
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl GattConnector for BtleConnector {
    type Client = BtleClient;

    async fn is_connectable(&self, address: &str) -> bool {
        matches!(self.find_peripheral(address).await, Ok(Some(_)))
    }

    #[tracing::instrument(level = "debug", skip(self), fields(timeout = ?connect_timeout))]
    async fn connect(&self, address: &str, connect_timeout: Duration) -> Result<BtleClient> {
        let peripheral = self
            .find_peripheral(address)
            .await?
            .ok_or_else(|| Error::NotConnectable(address.to_string()))?;

        info!("Connecting to valve");
        timeout(connect_timeout, peripheral.connect())
            .await
            .map_err(|_| Error::timeout("connect to valve", connect_timeout))?
            .map_err(|e| Error::connection_failed(address, e.to_string()))?;

        if let Err(err) = discover_services(&peripheral, self.discovery_timeout).await {
            // Do not leave a half-open link behind.
            let _ = peripheral.disconnect().await;
            return Err(err);
        }

        let characteristics: HashMap<Uuid, Characteristic> = peripheral
            .characteristics()
            .into_iter()
            .map(|c| (c.uuid, c))
            .collect();
        debug!(count = characteristics.len(), "Cached characteristics");

        Ok(BtleClient {
            address: address.to_string(),
            peripheral,
            characteristics: RwLock::new(characteristics),
        })
    }
}

async fn discover_services(peripheral: &Peripheral, limit: Duration) -> Result<()> {
    timeout(limit, peripheral.discover_services())
        .await
        .map_err(|_| Error::timeout("discover services", limit))??;
    Ok(())
}

/// A connected valve.
pub struct BtleClient {
    address: String,
    peripheral: Peripheral,
    characteristics: RwLock<HashMap<Uuid, Characteristic>>,
}

impl std::fmt::Debug for BtleClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BtleClient")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

impl BtleClient {
    pub fn address(&self) -> &str {
        &self.address
    }

    async fn find_characteristic(&self, uuid: Uuid) -> Result<Characteristic> {
        self.characteristics
            .read()
            .await
            .get(&uuid)
            .cloned()
            .ok_or_else(|| Error::CharacteristicNotFound {
                service_count: self.peripheral.services().len(),
            })
    }
}

#[async_trait]
impl GattClient for BtleClient {
    async fn services(&self) -> Result<Vec<GattService>> {
        Ok(self
            .peripheral
            .services()
            .into_iter()
            .map(|service| GattService {
                uuid: service.uuid,
                characteristics: service
                    .characteristics
                    .iter()
                    .map(|c| {
                        GattCharacteristic::new(c.uuid, c.service_uuid, char_properties(c.properties))
                    })
                    .collect(),
            })
            .collect())
    }

    async fn write(&self, uuid: Uuid, data: &[u8], with_response: bool) -> Result<()> {
        let characteristic = self.find_characteristic(uuid).await?;
        let write_type = if with_response {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };
        self.peripheral
            .write(&characteristic, data, write_type)
            .await
            .map_err(|e| Error::write_failed(uuid, e.to_string()))
    }

    async fn subscribe(&self, uuid: Uuid) -> Result<()> {
        let characteristic = self.find_characteristic(uuid).await?;
        self.peripheral.subscribe(&characteristic).await?;
        Ok(())
    }

    async fn unsubscribe(&self, uuid: Uuid) -> Result<()> {
        let characteristic = self.find_characteristic(uuid).await?;
        self.peripheral.unsubscribe(&characteristic).await?;
        Ok(())
    }

    async fn notifications(&self) -> Result<NotificationStream> {
        let stream = self.peripheral.notifications().await?;
        Ok(Box::pin(stream.map(|n| Notification {
            uuid: n.uuid,
            value: n.value,
        })))
    }

    async fn is_connected(&self) -> bool {
        self.peripheral.is_connected().await.unwrap_or(false)
    }

    async fn disconnect(&self) -> Result<()> {
        self.characteristics.write().await.clear();
        self.peripheral.disconnect().await?;
        Ok(())
    }
}
