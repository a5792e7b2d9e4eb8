//! Classification of passive valve advertisements.
//!
//! Valves broadcast a vendor manufacturer-data blob carrying firmware version,
//! status bits, error code, clock and type information. The blob may be split
//! over several AD structures, so the raw advertisement frame is re-scanned
//! rather than trusting the platform's manufacturer-data map.
//!
//! Payload layout (manufacturer ID included):
//!
//! | Offset | Evb034 | Evb019 with counter | Evb019 classic |
//! |--------|--------|---------------------|----------------|
//! | 0-1 | ID (LE) | ID (LE) | ID (LE) |
//! | 2 | status | status | status |
//! | 3 | error code | error bits | error bits |
//! | 4-5 | hours, minutes | hours, minutes | hours, minutes |
//! | 6 | type | connection counter | bootloader |
//! | 7 | series | twin sentinel (100) | series |
//! | 8.. | | bootloader, series, radio, type | radio, type / type |
//! | last 2 | firmware major, minor | firmware major, minor | firmware major, minor |

use std::collections::HashMap;

use bytes::Buf;
use serde::{Deserialize, Serialize};
use tracing::debug;

use chandler_types::uuid::{CSI_MANUFACTURER_ID, CSI_MANUFACTURER_ID_LE};
use chandler_types::{
    Classification, FirmwareVersion, StatusFlags, ValveError, ValveModel, ValveType,
    is_clack_name, matches_valve_prefix,
};

/// AD type for manufacturer-specific data.
const AD_TYPE_MANUFACTURER: u8 = 0xFF;

/// Sentinel byte at offset 7 of a valid twin-valve payload.
const TWIN_VALVE_SENTINEL: u8 = 100;

/// One sighting of a BLE device, as delivered by the scanner.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Advertisement {
    /// Stable device identifier.
    pub address: String,
    /// Advertised local name.
    pub name: Option<String>,
    /// Signal strength in dBm.
    pub rssi: Option<i16>,
    /// Manufacturer data keyed by company ID, without the ID bytes.
    pub manufacturer_data: HashMap<u16, Vec<u8>>,
    /// Raw advertisement frame (concatenated AD structures).
    pub raw: Vec<u8>,
}

impl Advertisement {
    /// Create an empty advertisement for an address.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Default::default()
        }
    }

    /// Set the local name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the RSSI.
    #[must_use]
    pub fn with_rssi(mut self, rssi: i16) -> Self {
        self.rssi = Some(rssi);
        self
    }

    /// Add a manufacturer-data entry.
    #[must_use]
    pub fn with_manufacturer_data(mut self, company_id: u16, data: Vec<u8>) -> Self {
        self.manufacturer_data.insert(company_id, data);
        self
    }

    /// Set the raw advertisement frame.
    #[must_use]
    pub fn with_raw(mut self, raw: Vec<u8>) -> Self {
        self.raw = raw;
        self
    }

    /// Build a raw frame from the manufacturer-data map.
    ///
    /// Used when the platform does not expose raw frames. Each entry becomes one
    /// manufacturer-specific AD structure; entries too large for a single
    /// structure are skipped.
    #[must_use]
    pub fn synthesize_raw(manufacturer_data: &HashMap<u16, Vec<u8>>) -> Vec<u8> {
        let mut ids: Vec<_> = manufacturer_data.keys().copied().collect();
        ids.sort_unstable();

        let mut raw = Vec::new();
        for id in ids {
            let data = &manufacturer_data[&id];
            let Ok(length) = u8::try_from(data.len() + 3) else {
                continue;
            };
            raw.push(length);
            raw.push(AD_TYPE_MANUFACTURER);
            raw.extend_from_slice(&id.to_le_bytes());
            raw.extend_from_slice(data);
        }
        raw
    }
}

/// Classify an advertisement.
///
/// Returns `None` when the local name does not carry a valve prefix.
/// Otherwise returns a [`Classification`]; callers must check
/// [`Classification::should_discard`] before using it.
pub fn classify(advertisement: &Advertisement) -> Option<Classification> {
    let name = advertisement.name.as_deref()?;
    if !matches_valve_prefix(name) {
        return None;
    }

    let mut classification =
        classify_manufacturer_data(&advertisement.manufacturer_data, &advertisement.raw);

    if let Some(code) = classification.valve_type_code {
        classification.valve_type = Some(ValveType::from_code(code, is_clack_name(name)));
    }
    Some(classification)
}

/// Classify manufacturer data, re-scanning `raw` for the full vendor payload.
pub fn classify_manufacturer_data(
    manufacturer_data: &HashMap<u16, Vec<u8>>,
    raw: &[u8],
) -> Classification {
    if !manufacturer_data.contains_key(&CSI_MANUFACTURER_ID) {
        return Classification::default();
    }

    let segments = extract_manufacturer_segments(raw);
    let Some(payload) = combine_segments(&segments) else {
        debug!("Vendor manufacturer data present but no segment in raw frame");
        return Classification {
            is_csi_device: true,
            ignore_advertisement: true,
            ..Default::default()
        };
    };

    let mut classification = Classification {
        is_csi_device: true,
        ..Default::default()
    };

    if !payload.starts_with(&CSI_MANUFACTURER_ID_LE) || payload.len() < 4 {
        debug!(len = payload.len(), "Vendor payload too short to parse firmware");
        return classification;
    }

    let firmware = decode_firmware(payload[payload.len() - 2], payload[payload.len() - 1]);
    let version = firmware.number();
    let model = ValveModel::from_firmware_version(version);

    classification.firmware = Some(firmware);
    classification.model = Some(model);
    classification.is_twin_valve = firmware.is_twin_valve();
    classification.is_400_series = firmware.is_400_series();
    classification.has_connection_counter = classification.is_twin_valve || version >= 412;

    match model {
        ValveModel::Evb034 => parse_evb034(&payload, &mut classification),
        ValveModel::Evb019 => parse_evb019(&payload, &mut classification),
    }

    classification
}

/// Return every manufacturer-specific AD payload that starts with the vendor ID.
///
/// Scanning stops at a zero-length structure or one that overruns the frame.
pub fn extract_manufacturer_segments(raw: &[u8]) -> Vec<&[u8]> {
    let mut segments = Vec::new();
    let mut index = 0;

    while index < raw.len() {
        let length = usize::from(raw[index]);
        index += 1;
        if length == 0 || index + length > raw.len() {
            break;
        }

        let ad_type = raw[index];
        let payload = &raw[index + 1..index + length];
        index += length;

        if ad_type == AD_TYPE_MANUFACTURER
            && payload.len() >= 2
            && payload.starts_with(&CSI_MANUFACTURER_ID_LE)
        {
            segments.push(payload);
        }
    }

    segments
}

/// Join segments into one payload. Continuation segments repeat the vendor ID,
/// which is dropped.
pub fn combine_segments(segments: &[&[u8]]) -> Option<Vec<u8>> {
    let (first, rest) = segments.split_first()?;
    if first.len() < 2 {
        return None;
    }

    let mut combined = first.to_vec();
    for segment in rest.iter().filter(|s| s.len() >= 2) {
        combined.extend_from_slice(&segment[2..]);
    }
    Some(combined)
}

/// Decode a firmware byte written as hexadecimal-as-decimal (0x25 means 25).
///
/// Bytes with a nibble above 9 are taken at face value.
#[must_use]
pub fn decode_firmware_byte(raw: u8) -> u8 {
    let (hi, lo) = (raw >> 4, raw & 0x0F);
    if hi <= 9 && lo <= 9 { hi * 10 + lo } else { raw }
}

/// Decode the trailing firmware bytes. A decoded minor of 250 or more is a
/// wrap marker and reads as 99.
#[must_use]
pub fn decode_firmware(major_raw: u8, minor_raw: u8) -> FirmwareVersion {
    let major = decode_firmware_byte(major_raw);
    let minor = match decode_firmware_byte(minor_raw) {
        m if m >= 250 => 99,
        m => m,
    };
    FirmwareVersion { major, minor }
}

fn parse_evb034(payload: &[u8], classification: &mut Classification) {
    if payload.len() < 10 {
        return;
    }

    let mut buf = &payload[2..];
    let status = buf.get_u8();
    let error = buf.get_u8();
    let hours = buf.get_u8();
    let minutes = buf.get_u8();
    let type_code = buf.get_u8();
    let series = buf.get_u8();

    classification.valve_data_parsed = true;
    apply_status(classification, status, ValveModel::Evb034);
    classification.valve_error = Some(ValveError::from_code(error));
    classification.valve_time_hours = Some(hours);
    classification.valve_time_minutes = Some(minutes);
    classification.valve_type_code = Some(type_code);
    classification.valve_series_version = Some(series);
}

fn parse_evb019(payload: &[u8], classification: &mut Classification) {
    if payload.len() < 6 {
        return;
    }

    let has_counter = classification.has_connection_counter;
    let long_enough = payload.len() >= 8 && (!has_counter || payload.len() >= 14);
    let twin_valid = !classification.is_twin_valve
        || payload.get(7).is_some_and(|b| *b == TWIN_VALVE_SENTINEL);

    if !(long_enough && twin_valid) {
        debug!(
            len = payload.len(),
            has_counter,
            twin = classification.is_twin_valve,
            "Evb019 payload failed structural validation"
        );
        return;
    }

    classification.valve_data_parsed = true;
    apply_status(classification, payload[2], ValveModel::Evb019);
    classification.valve_error = Some(ValveError::from_bit_pattern(payload[3]));
    classification.valve_time_hours = Some(payload[4]);
    classification.valve_time_minutes = Some(payload[5]);

    let at = |i: usize| payload.get(i).copied();
    if has_counter {
        classification.connection_counter = at(6);
        classification.bootloader_version = at(8);
        classification.valve_series_version = at(9);
        classification.radio_protocol_version = at(10);
        classification.valve_type_code = at(11);
    } else {
        classification.bootloader_version = at(6);
        classification.valve_series_version = at(7);
        if payload.len() == 12 {
            classification.radio_protocol_version = at(8);
            classification.valve_type_code = at(9);
        } else {
            classification.valve_type_code = at(8);
        }
    }
}

fn apply_status(classification: &mut Classification, raw: u8, model: ValveModel) {
    let flags = StatusFlags::decode(raw, model);
    classification.authentication_required = flags.authentication_required;
    classification.status = Some(flags);
}
