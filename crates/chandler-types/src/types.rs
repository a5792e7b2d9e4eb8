//! Core types describing a valve and its advertised state.

use core::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::ParseError;

/// Local-name prefixes advertised by valve controllers (matched case-insensitively).
pub const VALVE_NAME_PREFIXES: [&str; 3] = ["CS_", "C2_", "CL_"];

/// Local-name prefix identifying Clack-branded controllers.
pub const CLACK_NAME_PREFIX: &str = "cl_";

/// Fallback display name when the advertised name is not recognised.
pub const DEFAULT_FRIENDLY_NAME: &str = "Treatment Valve";

/// Manufacturer reported in device metadata.
pub const DEFAULT_MANUFACTURER: &str = "Chandler";

const FRIENDLY_NAME_OVERRIDES: [(&str, &str); 7] = [
    ("c2_1a", "Backwashing Filter"),
    ("c2_ff", "Backwashing Filter"),
    ("c2_1b", "Backwashing Filter"),
    ("c2_04", "Backwashing Filter"),
    ("cs_bw_filter", "Backwashing Filter"),
    ("c2_01", "Metered Softener"),
    ("cs_meter_soft", "Metered Softener"),
];

const LOW_SALT_CAPABLE_NAMES: [&str; 11] = [
    "CS_Meter_Soft",
    "CS_C_Meter_Soft",
    "C2_01",
    "C2_03",
    "C2_17",
    "C2_19",
    "C2_21",
    "CL_01",
    "CL_04",
    "CL_06",
    "CL_08",
];

/// Returns true if `name` starts with one of the known valve prefixes.
///
/// # Examples
///
/// ```
/// use chandler_types::matches_valve_prefix;
///
/// assert!(matches_valve_prefix("CS_Meter_Soft"));
/// assert!(matches_valve_prefix("c2_1a"));
/// assert!(!matches_valve_prefix("Thermo 12345"));
/// ```
#[must_use]
pub fn matches_valve_prefix(name: &str) -> bool {
    VALVE_NAME_PREFIXES.iter().any(|prefix| {
        name.get(..prefix.len())
            .is_some_and(|head| head.eq_ignore_ascii_case(prefix))
    })
}

/// Returns true if the advertised name identifies a Clack-branded controller.
#[must_use]
pub fn is_clack_name(name: &str) -> bool {
    name.trim()
        .get(..CLACK_NAME_PREFIX.len())
        .is_some_and(|head| head.eq_ignore_ascii_case(CLACK_NAME_PREFIX))
}

/// Map an advertised local name to a user-facing description.
#[must_use]
pub fn friendly_name(name: Option<&str>) -> &'static str {
    let Some(name) = name.map(str::trim).filter(|n| !n.is_empty()) else {
        return DEFAULT_FRIENDLY_NAME;
    };
    FRIENDLY_NAME_OVERRIDES
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map_or(DEFAULT_FRIENDLY_NAME, |(_, friendly)| friendly)
}

/// Returns true if a valve with this name has a salt sensor.
#[must_use]
pub fn can_report_low_salt(name: Option<&str>) -> bool {
    name.map(str::trim)
        .is_some_and(|n| LOW_SALT_CAPABLE_NAMES.iter().any(|c| c.eq_ignore_ascii_case(n)))
}

/// Controller board family, derived from the firmware version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ValveModel {
    /// Firmware below 6.00. The only family that answers GATT requests.
    Evb019,
    /// Firmware 6.00 and newer.
    Evb034,
}

impl ValveModel {
    /// Pick the board family for a combined firmware version (`major * 100 + minor`).
    #[must_use]
    pub fn from_firmware_version(version: u16) -> Self {
        if version >= 600 {
            ValveModel::Evb034
        } else {
            ValveModel::Evb019
        }
    }

    /// Whether the valve understands DeviceList/Dashboard requests.
    #[must_use]
    pub fn supports_requests(&self) -> bool {
        matches!(self, ValveModel::Evb019)
    }
}

impl fmt::Display for ValveModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValveModel::Evb019 => write!(f, "Evb019"),
            ValveModel::Evb034 => write!(f, "Evb034"),
        }
    }
}

impl core::str::FromStr for ValveModel {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "evb019" => Ok(ValveModel::Evb019),
            "evb034" => Ok(ValveModel::Evb034),
            _ => Err(ParseError::UnknownModel(s.to_string())),
        }
    }
}

/// Firmware version as advertised by the valve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FirmwareVersion {
    /// Major component (0-99).
    pub major: u8,
    /// Minor component (0-99).
    pub minor: u8,
}

impl FirmwareVersion {
    /// Combined version, `major * 100 + minor`.
    #[must_use]
    pub fn number(&self) -> u16 {
        u16::from(self.major) * 100 + u16::from(self.minor)
    }

    /// Twin-valve controllers report versions 1.00 through 1.99.
    #[must_use]
    pub fn is_twin_valve(&self) -> bool {
        (100..=199).contains(&self.number())
    }

    /// 4.xx firmware.
    #[must_use]
    pub fn is_400_series(&self) -> bool {
        (400..=499).contains(&self.number())
    }

    /// Display string used for device metadata, e.g. `C4.12`, `D1.19`, `L4.05`.
    #[must_use]
    pub fn label(&self, is_clack: bool) -> String {
        let prefix = if self.is_twin_valve() {
            'D'
        } else if is_clack {
            'L'
        } else {
            'C'
        };
        format!("{prefix}{}.{:02}", self.major, self.minor)
    }
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.major, self.minor)
    }
}

/// Decoded status bits from the advertisement status byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct StatusFlags {
    /// Raw status byte.
    pub raw: u8,
    /// Challenge/response authentication is required (Evb019 only).
    pub authentication_required: bool,
    /// Salt level is low.
    pub salt_low: bool,
    /// Water supply is shut off.
    pub water_off: bool,
    /// Valve is in bypass.
    pub bypass_on: bool,
}

impl StatusFlags {
    /// Decode the status byte. The bit layout differs between board families.
    #[must_use]
    pub fn decode(raw: u8, model: ValveModel) -> Self {
        match model {
            ValveModel::Evb019 => Self {
                raw,
                authentication_required: raw & 0x01 != 0,
                salt_low: raw & 0x02 != 0,
                water_off: raw & 0x04 != 0,
                bypass_on: raw & 0x08 != 0,
            },
            ValveModel::Evb034 => Self {
                raw,
                authentication_required: false,
                salt_low: raw & 0x01 != 0,
                water_off: raw & 0x02 != 0,
                bypass_on: raw & 0x04 != 0,
            },
        }
    }
}

/// Motor and homing faults reported by the valve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ValveError {
    /// No fault.
    NoError,
    /// Code 2.
    LostHomeSearching,
    /// Code 3.
    SlotsNotSeenNormalCurrent,
    /// Code 4.
    LostHomeNotFound,
    /// Code 5.
    SlotsNotSeenHighCurrent,
    /// Code 6.
    SlotsNotSeenNoCurrent,
    /// Code 7.
    MotorTimeout,
    /// Code 192.
    RegenAbortedOnBattery,
    /// A raw value with no known meaning.
    Unknown(u8),
}

impl ValveError {
    /// Decode an Evb019 error byte, which reports faults as single-bit patterns.
    ///
    /// ```
    /// use chandler_types::ValveError;
    ///
    /// assert_eq!(ValveError::from_bit_pattern(0), ValveError::NoError);
    /// assert_eq!(ValveError::from_bit_pattern(0x20), ValveError::MotorTimeout);
    /// assert_eq!(ValveError::from_bit_pattern(0x03), ValveError::Unknown(0x03));
    /// ```
    #[must_use]
    pub fn from_bit_pattern(raw: u8) -> Self {
        match raw {
            0 => ValveError::NoError,
            1 => ValveError::LostHomeSearching,
            2 => ValveError::SlotsNotSeenNormalCurrent,
            4 => ValveError::LostHomeNotFound,
            8 => ValveError::SlotsNotSeenHighCurrent,
            16 => ValveError::SlotsNotSeenNoCurrent,
            32 => ValveError::MotorTimeout,
            other => ValveError::Unknown(other),
        }
    }

    /// Decode an error code as carried directly by Evb034 advertisements.
    #[must_use]
    pub fn from_code(code: u8) -> Self {
        match code {
            0 => ValveError::NoError,
            2 => ValveError::LostHomeSearching,
            3 => ValveError::SlotsNotSeenNormalCurrent,
            4 => ValveError::LostHomeNotFound,
            5 => ValveError::SlotsNotSeenHighCurrent,
            6 => ValveError::SlotsNotSeenNoCurrent,
            7 => ValveError::MotorTimeout,
            192 => ValveError::RegenAbortedOnBattery,
            other => ValveError::Unknown(other),
        }
    }

    /// Numeric code of this fault.
    #[must_use]
    pub fn code(&self) -> u8 {
        match self {
            ValveError::NoError => 0,
            ValveError::LostHomeSearching => 2,
            ValveError::SlotsNotSeenNormalCurrent => 3,
            ValveError::LostHomeNotFound => 4,
            ValveError::SlotsNotSeenHighCurrent => 5,
            ValveError::SlotsNotSeenNoCurrent => 6,
            ValveError::MotorTimeout => 7,
            ValveError::RegenAbortedOnBattery => 192,
            ValveError::Unknown(raw) => *raw,
        }
    }

    /// Human-readable description. Clack boards name their drive motor differently.
    #[must_use]
    pub fn description(&self, is_clack: bool) -> String {
        match self {
            ValveError::NoError => "No Error".into(),
            ValveError::LostHomeSearching => "Lost home, but looking for home".into(),
            ValveError::SlotsNotSeenNormalCurrent => {
                "Not seeing slots, normal motor current".into()
            }
            ValveError::LostHomeNotFound => "Lost home, can't find it after looking".into(),
            ValveError::SlotsNotSeenHighCurrent => "Not seeing slots, high motor current".into(),
            ValveError::SlotsNotSeenNoCurrent => "Not seeing slots, no motor current".into(),
            ValveError::MotorTimeout if is_clack => "Drive 1 motor timeout error".into(),
            ValveError::MotorTimeout => "TWEDO motor timeout error".into(),
            ValveError::RegenAbortedOnBattery => {
                "Regen aborted, can't start a regen while on battery".into()
            }
            ValveError::Unknown(raw) => format!("Unknown error ({raw})"),
        }
    }
}

/// Consolidated valve application type.
///
/// Clack and standard controllers use disjoint numbering; see
/// [`ValveType::from_code`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ValveType {
    MeteredSoftener,
    TimeClockSoftener,
    BackwashingFilter,
    UltraFilter,
    CenturionNitro,
    CenturionNitroSidekick,
    NitroPro,
    NitroProSidekick,
    CenturionNitroSidekickV3,
    CommercialMeteredSoftener,
    CommercialBackwashingFilter,
    NitroFilter,
    Sidekick,
    CommercialAeration,
    ClackAeration,
    /// Code not present in the table for this brand.
    Unknown(u8),
}

impl ValveType {
    /// Map a raw type byte using the table selected by brand.
    ///
    /// ```
    /// use chandler_types::ValveType;
    ///
    /// assert_eq!(ValveType::from_code(3, true), ValveType::ClackAeration);
    /// assert_eq!(ValveType::from_code(3, false), ValveType::MeteredSoftener);
    /// ```
    #[must_use]
    pub fn from_code(code: u8, is_clack: bool) -> Self {
        if is_clack {
            Self::from_clack_code(code)
        } else {
            Self::from_standard_code(code)
        }
    }

    fn from_clack_code(code: u8) -> Self {
        match code {
            1 | 4 | 6 | 8 => ValveType::MeteredSoftener,
            2 | 5 | 7 | 9 => ValveType::BackwashingFilter,
            3 => ValveType::ClackAeration,
            other => ValveType::Unknown(other),
        }
    }

    fn from_standard_code(code: u8) -> Self {
        match code {
            1 | 3 | 19 | 21 => ValveType::MeteredSoftener,
            2 => ValveType::TimeClockSoftener,
            4..=7 | 20 | 22 | 26 | 27 => ValveType::BackwashingFilter,
            8 => ValveType::UltraFilter,
            9 | 11 => ValveType::CenturionNitro,
            10 | 12 => ValveType::CenturionNitroSidekick,
            13 => ValveType::NitroPro,
            14 | 15 => ValveType::NitroProSidekick,
            16 => ValveType::CenturionNitroSidekickV3,
            17 => ValveType::CommercialMeteredSoftener,
            18 => ValveType::CommercialBackwashingFilter,
            23 => ValveType::NitroFilter,
            24 => ValveType::Sidekick,
            25 => ValveType::CommercialAeration,
            other => ValveType::Unknown(other),
        }
    }

    /// Stable identifier used in published state.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            ValveType::MeteredSoftener => "MeteredSoftener",
            ValveType::TimeClockSoftener => "TimeClockSoftener",
            ValveType::BackwashingFilter => "BackwashingFilter",
            ValveType::UltraFilter => "UltraFilter",
            ValveType::CenturionNitro => "CenturionNitro",
            ValveType::CenturionNitroSidekick => "CenturionNitroSidekick",
            ValveType::NitroPro => "NitroPro",
            ValveType::NitroProSidekick => "NitroProSidekick",
            ValveType::CenturionNitroSidekickV3 => "CenturionNitroSidekickV3",
            ValveType::CommercialMeteredSoftener => "CommercialMeteredSoftener",
            ValveType::CommercialBackwashingFilter => "CommercialBackwashingFilter",
            ValveType::NitroFilter => "NitroFilter",
            ValveType::Sidekick => "Sidekick",
            ValveType::CommercialAeration => "CommercialAeration",
            ValveType::ClackAeration => "ClackAeration",
            ValveType::Unknown(_) => "Unknown",
        }
    }
}

impl fmt::Display for ValveType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Request opcodes understood by Evb019 valves.
///
/// A request is the opcode byte repeated across the whole request buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum RequestCommand {
    Reset,
    DeviceList,
    Dashboard,
    AdvancedSettings,
    StatusAndHistory,
    DealerInformation,
    Settings,
    /// Any other byte value.
    Unknown(u8),
}

impl RequestCommand {
    /// Wire value of the opcode.
    #[must_use]
    pub fn opcode(&self) -> u8 {
        match self {
            RequestCommand::Reset => 114,
            RequestCommand::DeviceList => 116,
            RequestCommand::Dashboard => 117,
            RequestCommand::AdvancedSettings => 118,
            RequestCommand::StatusAndHistory => 119,
            RequestCommand::DealerInformation => 120,
            RequestCommand::Settings => 121,
            RequestCommand::Unknown(raw) => *raw,
        }
    }
}

impl From<u8> for RequestCommand {
    fn from(value: u8) -> Self {
        match value {
            114 => RequestCommand::Reset,
            116 => RequestCommand::DeviceList,
            117 => RequestCommand::Dashboard,
            118 => RequestCommand::AdvancedSettings,
            119 => RequestCommand::StatusAndHistory,
            120 => RequestCommand::DealerInformation,
            121 => RequestCommand::Settings,
            other => RequestCommand::Unknown(other),
        }
    }
}

impl fmt::Display for RequestCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestCommand::Reset => write!(f, "Reset"),
            RequestCommand::DeviceList => write!(f, "DeviceList"),
            RequestCommand::Dashboard => write!(f, "Dashboard"),
            RequestCommand::AdvancedSettings => write!(f, "AdvancedSettings"),
            RequestCommand::StatusAndHistory => write!(f, "StatusAndHistory"),
            RequestCommand::DealerInformation => write!(f, "DealerInformation"),
            RequestCommand::Settings => write!(f, "Settings"),
            RequestCommand::Unknown(raw) => write!(f, "Unknown({raw})"),
        }
    }
}

/// State derived from one valve advertisement.
///
/// When `valve_data_parsed` is false the status, error, type and version
/// fields are `None` and the record must not replace a previously parsed one.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Classification {
    /// The advertisement carried the vendor manufacturer ID.
    pub is_csi_device: bool,
    /// The raw frame held no usable manufacturer segment.
    pub ignore_advertisement: bool,
    /// Advertised firmware version.
    pub firmware: Option<FirmwareVersion>,
    /// Board family.
    pub model: Option<ValveModel>,
    pub is_twin_valve: bool,
    pub is_400_series: bool,
    pub has_connection_counter: bool,
    /// The payload passed structural validation.
    pub valve_data_parsed: bool,
    pub status: Option<StatusFlags>,
    pub valve_error: Option<ValveError>,
    pub valve_time_hours: Option<u8>,
    pub valve_time_minutes: Option<u8>,
    /// Raw type byte.
    pub valve_type_code: Option<u8>,
    pub valve_type: Option<ValveType>,
    pub valve_series_version: Option<u8>,
    pub connection_counter: Option<u8>,
    pub bootloader_version: Option<u8>,
    pub radio_protocol_version: Option<u8>,
    pub authentication_required: bool,
}

impl Classification {
    /// Combined firmware version number, if known.
    #[must_use]
    pub fn firmware_version(&self) -> Option<u16> {
        self.firmware.map(|f| f.number())
    }

    /// Whether this record must be dropped entirely.
    ///
    /// Firmware 4.12 and newer, and twin valves, encode everything of interest in
    /// the structured payload; without it nothing derived can be trusted.
    #[must_use]
    pub fn should_discard(&self) -> bool {
        if !self.is_csi_device || self.ignore_advertisement {
            return true;
        }
        let requires_payload =
            self.is_twin_valve || self.firmware_version().is_some_and(|v| v >= 412);
        requires_payload && !self.valve_data_parsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_matching_is_case_insensitive() {
        assert!(matches_valve_prefix("cs_bw_filter"));
        assert!(matches_valve_prefix("Cl_04"));
        assert!(!matches_valve_prefix("C3_01"));
        assert!(!matches_valve_prefix("C2"));
        assert!(!matches_valve_prefix(""));
    }

    #[test]
    fn test_prefix_matching_multibyte_name() {
        assert!(!matches_valve_prefix("é"));
        assert!(!matches_valve_prefix("Cé_1"));
    }

    #[test]
    fn test_clack_name() {
        assert!(is_clack_name("CL_04"));
        assert!(is_clack_name("  cl_01"));
        assert!(!is_clack_name("CS_Meter_Soft"));
    }

    #[test]
    fn test_friendly_name() {
        assert_eq!(friendly_name(Some("C2_1A")), "Backwashing Filter");
        assert_eq!(friendly_name(Some(" cs_meter_soft ")), "Metered Softener");
        assert_eq!(friendly_name(Some("CS_Other")), DEFAULT_FRIENDLY_NAME);
        assert_eq!(friendly_name(Some("   ")), DEFAULT_FRIENDLY_NAME);
        assert_eq!(friendly_name(None), DEFAULT_FRIENDLY_NAME);
    }

    #[test]
    fn test_low_salt_capability() {
        assert!(can_report_low_salt(Some("cs_meter_soft")));
        assert!(can_report_low_salt(Some("CL_08")));
        assert!(!can_report_low_salt(Some("CS_BW_Filter")));
        assert!(!can_report_low_salt(None));
    }

    #[test]
    fn test_model_from_firmware() {
        assert_eq!(ValveModel::from_firmware_version(119), ValveModel::Evb019);
        assert_eq!(ValveModel::from_firmware_version(599), ValveModel::Evb019);
        assert_eq!(ValveModel::from_firmware_version(600), ValveModel::Evb034);
        assert!(ValveModel::Evb019.supports_requests());
        assert!(!ValveModel::Evb034.supports_requests());
    }

    #[test]
    fn test_model_parse() {
        assert_eq!("EVB019".parse::<ValveModel>(), Ok(ValveModel::Evb019));
        assert!(matches!(
            "evb999".parse::<ValveModel>(),
            Err(ParseError::UnknownModel(_))
        ));
    }

    #[test]
    fn test_firmware_label() {
        let twin = FirmwareVersion { major: 1, minor: 19 };
        assert_eq!(twin.label(false), "D1.19");
        assert_eq!(twin.label(true), "D1.19");

        let classic = FirmwareVersion { major: 4, minor: 5 };
        assert_eq!(classic.label(false), "C4.05");
        assert_eq!(classic.label(true), "L4.05");
        assert_eq!(classic.to_string(), "4.05");
        assert!(classic.is_400_series());
    }

    #[test]
    fn test_status_flags_layout_differs_by_model() {
        let evb019 = StatusFlags::decode(0b0000_1011, ValveModel::Evb019);
        assert!(evb019.authentication_required);
        assert!(evb019.salt_low);
        assert!(!evb019.water_off);
        assert!(evb019.bypass_on);

        let evb034 = StatusFlags::decode(0b0000_0011, ValveModel::Evb034);
        assert!(!evb034.authentication_required);
        assert!(evb034.salt_low);
        assert!(evb034.water_off);
        assert!(!evb034.bypass_on);
    }

    #[test]
    fn test_valve_error_bit_patterns() {
        let expected = [
            (1, 2),
            (2, 3),
            (4, 4),
            (8, 5),
            (16, 6),
            (32, 7),
        ];
        for (raw, code) in expected {
            assert_eq!(ValveError::from_bit_pattern(raw).code(), code);
        }
        assert_eq!(ValveError::from_bit_pattern(64), ValveError::Unknown(64));
    }

    #[test]
    fn test_valve_error_descriptions() {
        assert_eq!(
            ValveError::MotorTimeout.description(true),
            "Drive 1 motor timeout error"
        );
        assert_eq!(
            ValveError::MotorTimeout.description(false),
            "TWEDO motor timeout error"
        );
        assert_eq!(ValveError::from_code(192), ValveError::RegenAbortedOnBattery);
        assert_eq!(ValveError::Unknown(9).description(false), "Unknown error (9)");
    }

    #[test]
    fn test_valve_type_tables_are_brand_specific() {
        assert_eq!(ValveType::from_code(9, true), ValveType::BackwashingFilter);
        assert_eq!(ValveType::from_code(9, false), ValveType::CenturionNitro);
        assert_eq!(ValveType::from_code(27, false), ValveType::BackwashingFilter);
        assert_eq!(ValveType::from_code(27, true), ValveType::Unknown(27));
        assert_eq!(ValveType::from_code(0, false).name(), "Unknown");
    }

    #[test]
    fn test_request_opcodes() {
        assert_eq!(RequestCommand::DeviceList.opcode(), 116);
        assert_eq!(RequestCommand::Dashboard.opcode(), 117);
        assert_eq!(RequestCommand::from(114), RequestCommand::Reset);
        assert_eq!(RequestCommand::from(0), RequestCommand::Unknown(0));
        assert_eq!(RequestCommand::Unknown(3).opcode(), 3);
    }

    #[test]
    fn test_should_discard() {
        let modern_unparsed = Classification {
            is_csi_device: true,
            firmware: Some(FirmwareVersion { major: 4, minor: 12 }),
            ..Default::default()
        };
        assert!(modern_unparsed.should_discard());

        let classic_unparsed = Classification {
            is_csi_device: true,
            firmware: Some(FirmwareVersion { major: 3, minor: 20 }),
            ..Default::default()
        };
        assert!(!classic_unparsed.should_discard());

        assert!(Classification::default().should_discard());
    }

    #[test]
    fn test_classification_serialization() {
        let classification = Classification {
            is_csi_device: true,
            model: Some(ValveModel::Evb019),
            valve_error: Some(ValveError::Unknown(3)),
            ..Default::default()
        };
        let json = serde_json::to_string(&classification).unwrap();
        assert!(json.contains("\"model\":\"Evb019\""));
        let back: Classification = serde_json::from_str(&json).unwrap();
        assert_eq!(back, classification);
    }
}
