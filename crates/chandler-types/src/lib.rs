//! Platform-agnostic protocol types for Chandler water-treatment valves.
//!
//! This crate holds the data model shared by the protocol engine
//! (chandler-core) and anything that consumes its output. It has no
//! Bluetooth dependency.
//!
//! # Features
//!
//! - Advertisement classification records and status decoding
//! - Dashboard telemetry snapshots
//! - Passcode and authentication state
//! - GATT profile UUIDs and the vendor manufacturer ID
//!
//! # Example
//!
//! ```
//! use chandler_types::{FirmwareVersion, ValveModel};
//!
//! let firmware = FirmwareVersion { major: 4, minor: 12 };
//! assert_eq!(firmware.number(), 412);
//! assert_eq!(ValveModel::from_firmware_version(firmware.number()), ValveModel::Evb019);
//! ```

pub mod auth;
pub mod dashboard;
pub mod error;
pub mod types;
pub mod uuid;

pub use auth::{
    AUTHENTICATED_STATUS, AuthenticationState, DecodedPassword, NOT_AUTHENTICATED_STATUS, Passcode,
    PasswordState,
};
pub use dashboard::{ClockTime, DashboardSnapshot, USAGE_HISTORY_LEN};
pub use error::{ParseError, ParseResult};
pub use types::{
    Classification, FirmwareVersion, RequestCommand, StatusFlags, ValveError, ValveModel,
    ValveType, can_report_low_salt, friendly_name, is_clack_name, matches_valve_prefix,
};
pub use uuid as uuids;
