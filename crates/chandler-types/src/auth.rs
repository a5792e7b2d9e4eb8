//! Passcode and authentication state types.

use core::fmt;
use core::str::FromStr;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::ParseError;

/// DeviceList status byte reported once the challenge/response succeeded.
pub const AUTHENTICATED_STATUS: u8 = 128;

/// DeviceList status byte reported before authentication.
pub const NOT_AUTHENTICATED_STATUS: u8 = 0;

/// A four-digit valve passcode.
///
/// ```
/// use chandler_types::Passcode;
///
/// let passcode: Passcode = "1234".parse().unwrap();
/// assert_eq!(passcode.digits_ones_first(), [4, 3, 2, 1]);
/// assert_eq!(passcode.to_string(), "1234");
/// assert!("12a4".parse::<Passcode>().is_err());
/// ```
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(try_from = "String", into = "String")
)]
pub struct Passcode(u16);

impl Passcode {
    /// Build a passcode from a number; values are reduced modulo 10000.
    #[must_use]
    pub const fn new(value: u16) -> Self {
        Self(value % 10_000)
    }

    /// Numeric value (0-9999).
    #[must_use]
    pub fn value(&self) -> u16 {
        self.0
    }

    /// Decimal digits ordered ones, tens, hundreds, thousands.
    #[must_use]
    pub fn digits_ones_first(&self) -> [u8; 4] {
        let v = self.0;
        [
            (v % 10) as u8,
            (v / 10 % 10) as u8,
            (v / 100 % 10) as u8,
            (v / 1000 % 10) as u8,
        ]
    }
}

impl FromStr for Passcode {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.len() != 4 || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ParseError::InvalidPasscode(s.to_string()));
        }
        trimmed
            .parse::<u16>()
            .map(Passcode)
            .map_err(|_| ParseError::InvalidPasscode(s.to_string()))
    }
}

impl TryFrom<String> for Passcode {
    type Error = ParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Passcode> for String {
    fn from(value: Passcode) -> Self {
        value.to_string()
    }
}

impl fmt::Display for Passcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}", self.0)
    }
}

// Keep passcodes out of debug logs.
impl fmt::Debug for Passcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Passcode(****)")
    }
}

/// Outcome of decoding the password field of a DeviceList response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum PasswordState {
    /// Classic firmware reporting its passcode in clear digits.
    Classic,
    /// Authentication confirmed or not required.
    Valid,
    /// The field could not be decoded.
    Invalid,
    /// Status inconclusive; try again on the next poll.
    Retry,
    /// Authentication succeeded after one or more challenge rounds.
    Recovered,
    /// All challenge rounds were exhausted without success.
    RecoveryFailed,
    /// The valve requires a challenge/response round.
    AuthNeeded,
}

/// Authentication status as reported by the valve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum AuthenticationState {
    #[default]
    Unknown,
    NotAuthenticated,
    Authenticated,
}

impl AuthenticationState {
    /// Interpret a DeviceList status byte. Only [`AUTHENTICATED_STATUS`] counts as success.
    #[must_use]
    pub fn from_status(status: u8) -> Self {
        match status {
            AUTHENTICATED_STATUS => AuthenticationState::Authenticated,
            NOT_AUTHENTICATED_STATUS => AuthenticationState::NotAuthenticated,
            _ => AuthenticationState::Unknown,
        }
    }

    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        matches!(self, AuthenticationState::Authenticated)
    }
}

/// Decoded password/authentication field of a DeviceList response.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DecodedPassword {
    pub state: PasswordState,
    pub authentication_state: AuthenticationState,
    pub authentication_required: bool,
    /// Four-digit passcode. Only meaningful for classic firmware.
    pub passcode: Option<String>,
}

impl DecodedPassword {
    /// Whether a challenge/response round still has to be performed.
    #[must_use]
    pub fn needs_authentication(&self) -> bool {
        self.authentication_required && !self.authentication_state.is_authenticated()
    }
}
