//! Bluetooth identifiers for Chandler valve controllers.
//!
//! Valves expose their request/response channel through one of three
//! vendor GATT layouts depending on radio module and firmware generation.
//! [`GATT_PROFILES`] lists them in the order they should be tried.

use uuid::{Uuid, uuid};

/// Manufacturer ID carried in valve advertisements (1850).
pub const CSI_MANUFACTURER_ID: u16 = 0x073A;

/// Manufacturer ID as it appears on the wire (little-endian).
pub const CSI_MANUFACTURER_ID_LE: [u8; 2] = CSI_MANUFACTURER_ID.to_le_bytes();

// --- Legacy 16-bit vendor service ---

/// Legacy vendor service.
pub const LEGACY_SERVICE: Uuid = uuid!("00001000-0000-1000-8000-00805f9b34fb");

/// Legacy notify characteristic.
pub const LEGACY_NOTIFY: Uuid = uuid!("00001002-0000-1000-8000-00805f9b34fb");

/// Legacy request characteristic.
pub const LEGACY_WRITE: Uuid = uuid!("00001001-0000-1000-8000-00805f9b34fb");

// --- Nordic UART service ---

/// Nordic UART service used by newer radio modules.
pub const NUS_SERVICE: Uuid = uuid!("6e400001-b5a3-f393-e0a9-e50e24dcca9e");

/// Nordic UART TX (notify) characteristic.
pub const NUS_NOTIFY: Uuid = uuid!("6e400003-b5a3-f393-e0a9-e50e24dcca9e");

/// Nordic UART RX (write) characteristic.
pub const NUS_WRITE: Uuid = uuid!("6e400002-b5a3-f393-e0a9-e50e24dcca9e");

// --- Vendor 128-bit service ---

/// 128-bit vendor service.
pub const VENDOR_SERVICE: Uuid = uuid!("a725458c-bee1-4d2e-9555-edf5a8082303");

/// 128-bit vendor notify characteristic.
pub const VENDOR_NOTIFY: Uuid = uuid!("a725458c-bee2-4d2e-9555-edf5a8082303");

/// 128-bit vendor request characteristic.
pub const VENDOR_WRITE: Uuid = uuid!("a725458c-bee3-4d2e-9555-edf5a8082303");

/// One known service/characteristic layout for the valve request channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GattProfile {
    /// Short label used in logs.
    pub name: &'static str,
    /// Primary service UUID.
    pub service: Uuid,
    /// Characteristic that carries responses.
    pub notify: Uuid,
    /// Characteristic that accepts requests.
    pub write: Uuid,
}

/// Known request-channel layouts in priority order.
pub const GATT_PROFILES: [GattProfile; 3] = [
    GattProfile {
        name: "legacy",
        service: LEGACY_SERVICE,
        notify: LEGACY_NOTIFY,
        write: LEGACY_WRITE,
    },
    GattProfile {
        name: "nordic-uart",
        service: NUS_SERVICE,
        notify: NUS_NOTIFY,
        write: NUS_WRITE,
    },
    GattProfile {
        name: "vendor",
        service: VENDOR_SERVICE,
        notify: VENDOR_NOTIFY,
        write: VENDOR_WRITE,
    },
];

/// Returns true if `uuid` is the notify characteristic of any known profile.
#[must_use]
pub fn is_profile_notify(uuid: &Uuid) -> bool {
    GATT_PROFILES.iter().any(|p| p.notify == *uuid)
}
