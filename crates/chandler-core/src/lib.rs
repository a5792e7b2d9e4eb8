//! BLE protocol engine for Chandler water-treatment valves.
//!
//! This crate classifies passive valve advertisements, connects to valves over
//! GATT, runs the DeviceList / authentication / Dashboard request cycle and
//! publishes decoded telemetry as [`ValveEvent`]s.
//!
//! # Features
//!
//! - **Advertisement classification**: model, firmware, status and error bits
//!   from split vendor manufacturer data
//! - **Challenge/response authentication**: CRC-8 chained passcode proof with
//!   bounded retries and a passcode-keyed lockout
//! - **Dashboard decoding**: six-packet telemetry bursts with all-or-nothing
//!   validation
//! - **Connection management**: one session per valve, connection cooldowns,
//!   retries and an optional persistent keep-alive
//!
//! # Architecture
//!
//! | Layer | Type |
//! |-------|------|
//! | Scanner | [`scanner::AdvertisementScanner`] feeds [`ValveDiscovery`] |
//! | Manager | [`ConnectionManager`] follows discovery and runs the poll timer |
//! | Session | [`ConnectionSession`] owns one valve's connection lifecycle |
//! | Transport | [`GattConnector`] / [`GattClient`], backed by [`btle`] or [`mock`] |
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use chandler_core::scanner::{AdvertisementScanner, ScannerOptions};
//! use chandler_core::{BtleConnector, ConnectionManager, ManagerConfig, ValveDiscovery};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let connector = BtleConnector::from_default_adapter().await?;
//!     let discovery = Arc::new(ValveDiscovery::new());
//!     let cancel = CancellationToken::new();
//!
//!     let scanner = Arc::new(AdvertisementScanner::new(
//!         connector.adapter().clone(),
//!         Arc::clone(&discovery),
//!         ScannerOptions::default(),
//!     ));
//!     scanner.start(cancel.clone());
//!
//!     let manager = Arc::new(ConnectionManager::new(Arc::new(connector), ManagerConfig::default()));
//!     let mut events = manager.subscribe();
//!     manager.setup(discovery, std::future::ready(())).await;
//!
//!     while let Ok(event) = events.recv().await {
//!         println!("{event:?}");
//!     }
//!     Ok(())
//! }
//! ```

pub mod advertisement;
pub mod auth;
pub mod btle;
pub mod dashboard;
pub mod discovery;
pub mod error;
pub mod events;
pub mod gatt;
pub mod manager;
pub mod mock;
pub mod protocol;
pub mod scanner;
pub mod session;

pub use chandler_types::types;
pub use chandler_types::uuid;

pub use advertisement::{Advertisement, classify};
pub use btle::{BtleClient, BtleConnector, create_identifier, format_peripheral_id};
pub use dashboard::DashboardReassembler;
pub use discovery::{ChangeKind, DiscoveryUpdate, ValveAdvertisement, ValveDiscovery};
pub use error::{Error, Result};
pub use events::{EventDispatcher, EventReceiver, EventSender, ListenerId, ValveEvent};
pub use gatt::{GattClient, GattConnector};
pub use manager::{ConnectionManager, DeviceOverrides, ManagerConfig};
pub use mock::{MockConnector, MockValve, MockValveBuilder};
pub use protocol::{DeviceListResponse, PasswordLayout};
pub use session::{ConnectionSession, PollOutcome, PollReport, SessionConfig, SkipReason};

pub use chandler_types::uuid as uuids;
pub use chandler_types::{
    Classification, DashboardSnapshot, FirmwareVersion, Passcode, PasswordState, RequestCommand,
    ValveModel, ValveType,
};
