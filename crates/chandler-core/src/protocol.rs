//! Request framing and DeviceList response decoding.

use chandler_types::{
    AuthenticationState, Classification, DecodedPassword, PasswordState, RequestCommand,
};

use crate::error::{Error, Result};

/// Length of every request written to the valve.
pub const REQUEST_LEN: usize = 20;

/// Serial value reported by valves with no serial programmed.
const DEFAULT_SERIAL: &str = "FFFFFFFF";

/// DeviceList byte range holding the serial number.
const SERIAL_RANGE: core::ops::Range<usize> = 13..17;

/// Minimum DeviceList length that can carry a serial.
const SERIAL_MIN_LEN: usize = 18;

/// DeviceList status byte.
const STATUS_OFFSET: usize = 7;

/// Classic firmware stores the passcode as four clear digits here.
const CLASSIC_PASSCODE_RANGE: core::ops::Range<usize> = 8..12;

/// Challenge/response firmware reports the connection counter here.
const CONNECTION_COUNTER_OFFSET: usize = 11;

/// Build a request: the opcode repeated across the whole buffer.
///
/// ```
/// use chandler_core::protocol::request_payload;
/// use chandler_types::RequestCommand;
///
/// assert_eq!(request_payload(RequestCommand::Dashboard), [117; 20]);
/// ```
#[must_use]
pub fn request_payload(command: RequestCommand) -> [u8; REQUEST_LEN] {
    [command.opcode(); REQUEST_LEN]
}

/// How a valve encodes the password field of its DeviceList response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PasswordLayout {
    /// Older firmware: passcode digits in clear.
    Classic,
    /// Firmware with a connection counter: status byte plus counter.
    ChallengeResponse,
}

impl PasswordLayout {
    #[must_use]
    pub fn for_classification(classification: &Classification) -> Self {
        if classification.has_connection_counter {
            PasswordLayout::ChallengeResponse
        } else {
            PasswordLayout::Classic
        }
    }
}

/// Decoded DeviceList response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceListResponse {
    /// Byte 2 of the response.
    pub is_twin_valve: bool,
    /// Byte 7 of the response.
    pub status: Option<u8>,
    /// Serial number, `None` when absent or unprogrammed.
    pub serial_number: Option<String>,
    /// Connection counter learned from the response.
    pub connection_counter: Option<u8>,
    pub password: DecodedPassword,
}

/// Whether `packet` has the DeviceList signature.
#[must_use]
pub fn is_device_list_packet(packet: &[u8]) -> bool {
    let opcode = RequestCommand::DeviceList.opcode();
    packet.len() >= 3 && packet[0] == opcode && packet[1] == opcode && packet[2] <= 1
}

/// Decode a DeviceList response for a valve with the given classification.
pub fn parse_device_list(
    packet: &[u8],
    classification: &Classification,
) -> Result<DeviceListResponse> {
    if !is_device_list_packet(packet) {
        return Err(Error::InvalidData(format!(
            "not a DeviceList response ({} bytes)",
            packet.len()
        )));
    }

    let layout = PasswordLayout::for_classification(classification);
    let serial_number = if device_list_carries_serial(layout) {
        extract_serial(packet)
    } else {
        None
    };
    let connection_counter = match layout {
        PasswordLayout::ChallengeResponse => packet.get(CONNECTION_COUNTER_OFFSET).copied(),
        PasswordLayout::Classic => None,
    };

    Ok(DeviceListResponse {
        is_twin_valve: packet[2] == 1,
        status: packet.get(STATUS_OFFSET).copied(),
        serial_number,
        connection_counter,
        password: decode_password(packet, layout, classification.authentication_required),
    })
}

// TODO: confirm whether classic firmware variants report a serial through
// DeviceList; until then both layouts are decoded the same way.
fn device_list_carries_serial(layout: PasswordLayout) -> bool {
    match layout {
        PasswordLayout::ChallengeResponse => true,
        PasswordLayout::Classic => true,
    }
}

/// Extract the serial number from bytes 13-16, hex-encoded.
#[must_use]
pub fn extract_serial(packet: &[u8]) -> Option<String> {
    if packet.len() < SERIAL_MIN_LEN {
        return None;
    }
    let serial: String = packet[SERIAL_RANGE]
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect();
    (serial != DEFAULT_SERIAL).then_some(serial)
}

/// Decode the password/authentication field.
#[must_use]
pub fn decode_password(
    packet: &[u8],
    layout: PasswordLayout,
    advertised_auth_required: bool,
) -> DecodedPassword {
    match layout {
        PasswordLayout::Classic => decode_classic_password(packet),
        PasswordLayout::ChallengeResponse => {
            decode_challenge_password(packet, advertised_auth_required)
        }
    }
}

fn decode_classic_password(packet: &[u8]) -> DecodedPassword {
    let digits = packet.get(CLASSIC_PASSCODE_RANGE);
    let passcode = digits
        .filter(|d| d.iter().all(|b| *b <= 9))
        .map(|d| d.iter().map(|b| char::from(b'0' + b)).collect::<String>());

    DecodedPassword {
        state: if passcode.is_some() {
            PasswordState::Classic
        } else {
            PasswordState::Invalid
        },
        authentication_state: AuthenticationState::Unknown,
        authentication_required: false,
        passcode,
    }
}

fn decode_challenge_password(packet: &[u8], advertised_auth_required: bool) -> DecodedPassword {
    let Some(status) = packet.get(STATUS_OFFSET).copied() else {
        return DecodedPassword {
            state: PasswordState::Invalid,
            authentication_state: AuthenticationState::Unknown,
            authentication_required: advertised_auth_required,
            passcode: None,
        };
    };

    let authentication_state = AuthenticationState::from_status(status);
    let state = match (advertised_auth_required, authentication_state) {
        (false, _) | (true, AuthenticationState::Authenticated) => PasswordState::Valid,
        (true, AuthenticationState::NotAuthenticated) => PasswordState::AuthNeeded,
        (true, AuthenticationState::Unknown) => PasswordState::Retry,
    };

    DecodedPassword {
        state,
        authentication_state,
        authentication_required: advertised_auth_required,
        passcode: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn modern(auth_required: bool) -> Classification {
        Classification {
            is_csi_device: true,
            has_connection_counter: true,
            authentication_required: auth_required,
            ..Default::default()
        }
    }

    fn classic() -> Classification {
        Classification {
            is_csi_device: true,
            ..Default::default()
        }
    }

    fn device_list(status: u8) -> Vec<u8> {
        let mut packet = vec![116, 116, 1, 0, 0, 0, 0, status, 1, 2, 3, 9, 0];
        packet.extend_from_slice(&[0x12, 0xAB, 0x00, 0x7F]);
        packet.extend_from_slice(&[0, 0, 0]);
        packet
    }

    #[test]
    fn test_request_payload() {
        assert!(request_payload(RequestCommand::DeviceList).iter().all(|b| *b == 116));
        assert_eq!(request_payload(RequestCommand::Unknown(0)), [0; REQUEST_LEN]);
        assert_eq!(request_payload(RequestCommand::Unknown(255)), [255; REQUEST_LEN]);
    }

    #[test]
    fn test_device_list_signature() {
        assert!(is_device_list_packet(&[116, 116, 0]));
        assert!(is_device_list_packet(&[116, 116, 1, 5]));
        assert!(!is_device_list_packet(&[116, 116, 2]));
        assert!(!is_device_list_packet(&[116, 117, 0]));
        assert!(!is_device_list_packet(&[116, 116]));
    }

    #[test]
    fn test_serial_extraction() {
        assert_eq!(extract_serial(&device_list(0)), Some("12AB007F".into()));

        let mut unprogrammed = device_list(0);
        unprogrammed[13..17].copy_from_slice(&[0xFF; 4]);
        assert_eq!(extract_serial(&unprogrammed), None);

        assert_eq!(extract_serial(&device_list(0)[..17]), None);
    }

    #[test]
    fn test_authenticated_response() {
        let response = parse_device_list(&device_list(128), &modern(true)).unwrap();
        assert!(response.is_twin_valve);
        assert_eq!(response.status, Some(128));
        assert_eq!(response.connection_counter, Some(9));
        assert_eq!(response.password.state, PasswordState::Valid);
        assert_eq!(
            response.password.authentication_state,
            AuthenticationState::Authenticated
        );
        assert!(!response.password.needs_authentication());
    }

    #[test]
    fn test_unauthenticated_response_needs_auth() {
        let response = parse_device_list(&device_list(0), &modern(true)).unwrap();
        assert_eq!(response.password.state, PasswordState::AuthNeeded);
        assert!(response.password.needs_authentication());
    }

    #[test]
    fn test_inconclusive_status_is_not_success() {
        let response = parse_device_list(&device_list(64), &modern(true)).unwrap();
        assert_eq!(response.password.state, PasswordState::Retry);
        assert_eq!(
            response.password.authentication_state,
            AuthenticationState::Unknown
        );
        assert!(response.password.needs_authentication());
    }

    #[test]
    fn test_auth_not_required() {
        let response = parse_device_list(&device_list(0), &modern(false)).unwrap();
        assert_eq!(response.password.state, PasswordState::Valid);
        assert!(!response.password.needs_authentication());
    }

    #[test]
    fn test_classic_password_digits() {
        let response = parse_device_list(&device_list(0), &classic()).unwrap();
        assert_eq!(response.password.state, PasswordState::Classic);
        assert_eq!(response.password.passcode.as_deref(), Some("1239"));
        assert_eq!(response.connection_counter, None);

        let mut bad = device_list(0);
        bad[9] = 0x0A;
        let response = parse_device_list(&bad, &classic()).unwrap();
        assert_eq!(response.password.state, PasswordState::Invalid);
    }

    #[test]
    fn test_short_response() {
        let response = parse_device_list(&[116, 116, 0], &modern(true)).unwrap();
        assert_eq!(response.password.state, PasswordState::Invalid);
        assert_eq!(response.serial_number, None);
        assert!(parse_device_list(&[117, 117, 0], &modern(true)).is_err());
    }
}
