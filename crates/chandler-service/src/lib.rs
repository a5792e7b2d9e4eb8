//! Background poller for Chandler BLE water-treatment valves.
//!
//! The service listens for valve advertisements, polls every valve it hears
//! on a fixed schedule and prints the decoded telemetry.
//!
//! # Configuration
//!
//! The service reads configuration from `~/.config/chandler/service.toml`:
//!
//! ```toml
//! [polling]
//! interval = 900        # poll every valve every 15 minutes
//! startup_delay = 5
//! cooldown = 15
//!
//! [auth]
//! passcode = "1234"
//!
//! [scanner]
//! stale_after = 300
//!
//! [[devices]]
//! address = "AA:BB:CC:DD:EE:FF"
//! alias = "softener"
//! passcode = "4321"
//! persistent = true
//! persistent_interval = 30
//! ```

pub mod config;
pub mod reporter;

pub use config::{
    AuthConfig, Config, ConfigError, DeviceConfig, PollingConfig, ScannerConfig, ValidationError,
};
pub use reporter::{OutputFormat, Reporter};
