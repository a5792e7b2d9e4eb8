//! CRC8 challenge/response authentication.
//!
//! Valves that advertise the authentication bit only answer requests after the
//! central proves knowledge of the four-digit passcode. The proof is a 20-byte
//! DeviceList write whose tail is a CRC chain over a random challenge with the
//! passcode digits folded in. Success is observed indirectly: the next
//! DeviceList response reports status
//! [`AUTHENTICATED_STATUS`](chandler_types::AUTHENTICATED_STATUS).

use rand::Rng;

use chandler_types::{Passcode, RequestCommand};

use crate::protocol::REQUEST_LEN;

/// Fixed signature at bytes 2-3 of an authentication payload.
pub const AUTH_SIGNATURE: [u8; 2] = [0x50, 0x41];

/// Challenge rounds attempted before latching a lockout.
pub const MAX_AUTH_ATTEMPTS: u32 = 4;

/// Allowed Hamming weights for the generator polynomial.
const POLYNOMIAL_WEIGHTS: core::ops::RangeInclusive<u32> = 4..=5;

fn crc8_msb(value: u8, polynomial: u8) -> u8 {
    let mut crc = value;
    for _ in 0..8 {
        crc = if crc & 0x80 != 0 {
            (crc << 1) ^ polynomial
        } else {
            crc << 1
        };
    }
    crc
}

/// Current CRC8 variant: `seed ^ crc8(value, polynomial)`.
#[must_use]
pub fn crc8(seed: u8, value: u8, polynomial: u8) -> u8 {
    seed ^ crc8_msb(value, polynomial)
}

/// Legacy bit-reversed CRC8 variant used for authentication payloads.
///
/// Shifts right and XORs with the bit-reversed polynomial.
#[must_use]
pub fn crc8_legacy(seed: u8, value: u8, polynomial: u8) -> u8 {
    let reflected = polynomial.reverse_bits();
    let mut crc = seed ^ value;
    for _ in 0..8 {
        crc = if crc & 0x01 != 0 {
            (crc >> 1) ^ reflected
        } else {
            crc >> 1
        };
    }
    crc
}

/// Which CRC8 variant a [`Crc8`] chain runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Crc8Variant {
    /// [`crc8`].
    Current,
    /// [`crc8_legacy`], used for authentication payloads.
    Legacy,
}

/// CRC8 chain that carries its seed across calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Crc8 {
    seed: u8,
    polynomial: u8,
    variant: Crc8Variant,
}

impl Crc8 {
    /// Current-variant chain.
    pub fn new(seed: u8, polynomial: u8) -> Self {
        Self {
            seed,
            polynomial,
            variant: Crc8Variant::Current,
        }
    }

    /// Legacy-variant chain.
    pub fn legacy(seed: u8, polynomial: u8) -> Self {
        Self {
            seed,
            polynomial,
            variant: Crc8Variant::Legacy,
        }
    }

    /// Feed one byte; the result becomes the seed for the next call.
    pub fn update(&mut self, value: u8) -> u8 {
        self.seed = match self.variant {
            Crc8Variant::Current => crc8(self.seed, value, self.polynomial),
            Crc8Variant::Legacy => crc8_legacy(self.seed, value, self.polynomial),
        };
        self.seed
    }

    /// Feed a slice and return the final state.
    pub fn update_all(&mut self, values: &[u8]) -> u8 {
        for value in values {
            self.update(*value);
        }
        self.seed
    }

    #[must_use]
    pub fn seed(&self) -> u8 {
        self.seed
    }
}

/// Random material for one authentication round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthChallenge {
    /// Generator polynomial, Hamming weight 4 or 5.
    pub polynomial: u8,
    pub seed: u8,
    pub value: u8,
}

impl AuthChallenge {
    /// Draw a fresh challenge.
    pub fn random<R: Rng + ?Sized>(rng: &mut R) -> Self {
        Self {
            polynomial: random_polynomial(rng),
            seed: rng.random(),
            value: rng.random(),
        }
    }
}

/// Draw an 8-bit polynomial with Hamming weight between 4 and 5.
pub fn random_polynomial<R: Rng + ?Sized>(rng: &mut R) -> u8 {
    loop {
        let candidate: u8 = rng.random();
        if POLYNOMIAL_WEIGHTS.contains(&candidate.count_ones()) {
            return candidate;
        }
    }
}

/// Build an authentication payload from explicit challenge material.
///
/// Layout: opcode ×2, signature, polynomial, seed, `value ^ seed`, four chained
/// legacy-CRC bytes each XORed with a passcode digit (ones first), then filler.
#[must_use]
pub fn build_auth_payload(
    challenge: AuthChallenge,
    passcode: Passcode,
    filler: [u8; REQUEST_LEN - 11],
) -> [u8; REQUEST_LEN] {
    let opcode = RequestCommand::DeviceList.opcode();
    let mut payload = [0u8; REQUEST_LEN];
    payload[0] = opcode;
    payload[1] = opcode;
    payload[2..4].copy_from_slice(&AUTH_SIGNATURE);
    payload[4] = challenge.polynomial;
    payload[5] = challenge.seed;
    payload[6] = challenge.value ^ challenge.seed;

    let mut chain = Crc8::legacy(challenge.value, challenge.polynomial);
    for (i, digit) in passcode.digits_ones_first().into_iter().enumerate() {
        payload[7 + i] = chain.update(payload[6 + i]) ^ digit;
    }

    payload[11..].copy_from_slice(&filler);
    payload
}

/// Build an authentication payload with a fresh random challenge and filler.
#[must_use]
pub fn new_auth_payload(passcode: Passcode) -> [u8; REQUEST_LEN] {
    let mut rng = rand::rng();
    let challenge = AuthChallenge::random(&mut rng);
    let mut filler = [0u8; REQUEST_LEN - 11];
    rng.fill(&mut filler);
    build_auth_payload(challenge, passcode, filler)
}

/// Check an authentication payload against a passcode, as the valve does.
///
/// The digits are recovered by replaying the CRC chain from the challenge
/// material carried in bytes 4-6.
#[must_use]
pub fn verify_auth_payload(payload: &[u8], passcode: Passcode) -> bool {
    let opcode = RequestCommand::DeviceList.opcode();
    if payload.len() != REQUEST_LEN
        || payload[..2] != [opcode, opcode]
        || payload[2..4] != AUTH_SIGNATURE
    {
        return false;
    }

    let (polynomial, seed) = (payload[4], payload[5]);
    let mut chain = Crc8::legacy(payload[6] ^ seed, polynomial);
    passcode
        .digits_ones_first()
        .into_iter()
        .enumerate()
        .all(|(i, digit)| payload[7 + i] ^ chain.update(payload[6 + i]) == digit)
}

/// Whether `packet` is an authentication payload rather than a plain request.
#[must_use]
pub fn is_auth_payload(packet: &[u8]) -> bool {
    packet.len() >= 4 && packet[2..4] == AUTH_SIGNATURE
}


/// Property-based tests for the CRC primitives.
#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn legacy_crc_is_deterministic(seed: u8, value: u8, polynomial: u8) {
            prop_assert_eq!(
                crc8_legacy(seed, value, polynomial),
                crc8_legacy(seed, value, polynomial)
            );
        }

        #[test]
        fn single_digit_change_alters_tail(
            polynomial: u8,
            seed: u8,
            value: u8,
            passcode in 0u16..10_000,
            position in 0usize..4,
            delta in 1u16..10,
        ) {
            let challenge = AuthChallenge { polynomial, seed, value };
            let place = 10u16.pow(position as u32);
            let digit = passcode / place % 10;
            let new_digit = (digit + delta) % 10;
            let changed = passcode - digit * place + new_digit * place;

            let a = build_auth_payload(challenge, Passcode::new(passcode), [0; 9]);
            let b = build_auth_payload(challenge, Passcode::new(changed), [0; 9]);
            prop_assert_ne!(a[7 + position], b[7 + position]);
        }
    }
}
