//! Dashboard response reassembly and decoding.
//!
//! A Dashboard request is answered with six notifications. Packets 0-2 carry
//! the opcode twice and their index; packets 3-5 are bare continuation data
//! and can only be placed by arrival order once packet 2 has been seen.
//! Reassembly therefore assumes the transport does not reorder packets 2-5.

use bytes::Buf;
use tracing::trace;

use chandler_types::{ClockTime, DashboardSnapshot, RequestCommand, USAGE_HISTORY_LEN};

/// Number of notifications in a Dashboard burst.
pub const DASHBOARD_PACKET_COUNT: usize = 6;

/// Length of a full-size notification.
const PACKET_LEN: usize = 20;

/// Tail byte of packet 0.
const FIRST_TAIL: u8 = 57;

/// Tail byte of packet 1 and of the final packet.
const SECOND_TAIL: u8 = 58;

/// Minimum length of the final packet (five history bytes plus tail).
const FINAL_MIN_LEN: usize = 6;

/// Collects Dashboard notifications until all six packets are present.
#[derive(Debug, Default, Clone)]
pub struct DashboardReassembler {
    packets: [Option<Vec<u8>>; DASHBOARD_PACKET_COUNT],
    next_unsigned: Option<usize>,
}

impl DashboardReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offer one notification. Returns the decoded snapshot once the burst is complete.
    ///
    /// Packets failing their structural check are dropped.
    pub fn push(&mut self, packet: &[u8]) -> Option<DashboardSnapshot> {
        match self.place(packet) {
            Some(index) => {
                trace!(index, len = packet.len(), "Dashboard packet stored");
                self.packets[index] = Some(packet.to_vec());
            }
            None => {
                trace!(len = packet.len(), "Dashboard packet dropped");
                return None;
            }
        }

        if self.is_complete() {
            let snapshot = self.decode();
            self.reset();
            return snapshot;
        }
        None
    }

    /// Number of packets currently held.
    #[must_use]
    pub fn received(&self) -> usize {
        self.packets.iter().filter(|p| p.is_some()).count()
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.packets.iter().all(Option::is_some)
    }

    /// Discard any partial burst.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    fn place(&mut self, packet: &[u8]) -> Option<usize> {
        if let Some(index) = signed_index(packet) {
            // a repeated signed packet is dropped, never taken as continuation data
            if self.packets[index].is_some() {
                return None;
            }
            if index == 2 && self.next_unsigned.is_none() {
                self.next_unsigned = Some(3);
            }
            return Some(index);
        }

        let index = self.next_unsigned?;
        let valid = if index == DASHBOARD_PACKET_COUNT - 1 {
            packet.len() >= FINAL_MIN_LEN && packet.last() == Some(&SECOND_TAIL)
        } else {
            packet.len() >= PACKET_LEN
        };
        if !valid {
            return None;
        }

        self.next_unsigned = (index + 1 < DASHBOARD_PACKET_COUNT).then_some(index + 1);
        Some(index)
    }

    fn decode(&self) -> Option<DashboardSnapshot> {
        let [first, second, third, fourth, fifth, sixth] = &self.packets;
        decode_packets([
            first.as_deref()?,
            second.as_deref()?,
            third.as_deref()?,
            fourth.as_deref()?,
            fifth.as_deref()?,
            sixth.as_deref()?,
        ])
    }
}

/// Index of a self-describing packet (0-2), or `None`.
fn signed_index(packet: &[u8]) -> Option<usize> {
    let opcode = RequestCommand::Dashboard.opcode();
    if packet.len() != PACKET_LEN || packet[0] != opcode || packet[1] != opcode {
        return None;
    }
    let tail = packet[PACKET_LEN - 1];
    match packet[2] {
        0 if tail == FIRST_TAIL => Some(0),
        1 if tail == SECOND_TAIL => Some(1),
        2 => Some(2),
        _ => None,
    }
}

/// Decode a complete, ordered burst.
#[must_use]
pub fn decode_packets(packets: [&[u8]; DASHBOARD_PACKET_COUNT]) -> Option<DashboardSnapshot> {
    let [first, second, third, fourth, fifth, sixth] = packets;
    if first.len() < 19
        || second.len() < 19
        || third.len() < PACKET_LEN
        || fourth.len() < PACKET_LEN
        || fifth.len() < PACKET_LEN
        || sixth.len() < 5
    {
        return None;
    }

    let mut buf = &first[3..19];
    let hour = buf.get_u8();
    let minute = buf.get_u8();
    let is_pm = buf.get_u8() != 0;
    let battery_raw = buf.get_u8();
    let present_flow = buf.get_u16();
    let water_remaining = buf.get_u16();
    let water_usage = buf.get_u16();
    let peak_flow = buf.get_u16();
    let hardness = buf.get_u8();
    let regen_hour = buf.get_u8();
    let regen_is_pm = buf.get_u8() == 1;
    let flags = buf.get_u8();

    let mut usage_history = Vec::with_capacity(USAGE_HISTORY_LEN);
    usage_history.extend_from_slice(&third[3..PACKET_LEN]);
    usage_history.extend_from_slice(&fourth[..PACKET_LEN]);
    usage_history.extend_from_slice(&fifth[..PACKET_LEN]);
    usage_history.extend_from_slice(&sixth[..5]);

    Some(DashboardSnapshot {
        time: ClockTime {
            hour,
            minute,
            is_pm,
        },
        battery_raw,
        battery_capacity: battery_capacity(battery_raw),
        present_flow: f32::from(present_flow) / 100.0,
        water_remaining_until_regeneration: water_remaining,
        water_usage,
        peak_flow: f32::from(peak_flow) / 100.0,
        water_hardness: hardness,
        regeneration_time_hour: regen_hour,
        regeneration_time_is_pm: regen_is_pm,
        shutoff_setting_enabled: flags & 0x01 != 0,
        bypass_setting_enabled: flags & 0x02 != 0,
        shutoff_active: flags & 0x04 != 0,
        bypass_active: flags & 0x08 != 0,
        display_off: flags & 0x10 != 0,
        filter_backwash: second[3],
        air_recharge: second[4],
        position_time: second[5],
        position_option_seconds: second[6],
        regen_cycle_position: second[7],
        regen_active: second[8],
        prefill_soak_mode: second[10] & 0x08 != 0,
        soak_timer: second[11],
        is_in_aeration: second[12] & 0x01 == 0,
        tank_in_service: second[18],
        usage_history,
    })
}

/// Battery discharge curve: (lower bound V, anchor V, anchor %, slope %/V).
const BATTERY_CURVE: [(f64, f64, f64, f64); 4] = [
    (8.91, 9.5, 100.0, 8.78),
    (8.48, 8.91, 94.78, 30.26),
    (7.43, 8.48, 81.84, 60.47),
    (6.5, 7.43, 18.68, 20.02),
];

/// Voltage at which the pack reads full.
const BATTERY_FULL_VOLTS: f64 = 9.5;

/// Convert a raw Dashboard battery byte to volts.
#[must_use]
pub fn battery_volts(raw: u8) -> f64 {
    f64::from(raw) * 4.0 * 0.002 * 11.0
}

/// Estimated capacity (0-100 %) for a pack voltage.
#[must_use]
pub fn capacity_from_volts(volts: f64) -> u8 {
    if volts >= BATTERY_FULL_VOLTS {
        return 100;
    }
    BATTERY_CURVE
        .iter()
        .find(|(floor, ..)| volts >= *floor)
        .map_or(0, |(_, anchor_volts, anchor_pct, slope)| {
            (anchor_pct - (anchor_volts - volts) * slope).clamp(0.0, 100.0) as u8
        })
}

/// Estimated capacity (0-100 %) for a raw Dashboard battery byte.
#[must_use]
pub fn battery_capacity(raw: u8) -> u8 {
    capacity_from_volts(battery_volts(raw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::sample_dashboard_burst as burst;

    fn feed(order: &[usize]) -> Option<DashboardSnapshot> {
        let packets = burst();
        let mut reassembler = DashboardReassembler::new();
        let mut result = None;
        for i in order {
            if let Some(snapshot) = reassembler.push(&packets[*i]) {
                result = Some(snapshot);
            }
        }
        result
    }

    #[test]
    fn test_in_order_decode() {
        let snapshot = feed(&[0, 1, 2, 3, 4, 5]).unwrap();
        assert_eq!(snapshot.time.hour, 9);
        assert_eq!(snapshot.time.minute, 41);
        assert!(snapshot.time.is_pm);
        assert_eq!(snapshot.battery_raw, 100);
        assert_eq!(snapshot.battery_capacity, 91);
        assert!((snapshot.present_flow - 12.34).abs() < 1e-4);
        assert!((snapshot.peak_flow - 45.6).abs() < 1e-4);
        assert_eq!(snapshot.water_remaining_until_regeneration, 500);
        assert_eq!(snapshot.water_usage, 123);
        assert_eq!(snapshot.water_hardness, 17);
        assert_eq!(snapshot.regeneration_time_hour, 2);
        assert!(!snapshot.regeneration_time_is_pm);
        assert!(snapshot.shutoff_setting_enabled);
        assert!(!snapshot.bypass_setting_enabled);
        assert!(snapshot.shutoff_active);
        assert!(!snapshot.bypass_active);
        assert!(snapshot.display_off);
        assert_eq!(snapshot.filter_backwash, 14);
        assert_eq!(snapshot.air_recharge, 3);
        assert_eq!(snapshot.position_time, 4);
        assert_eq!(snapshot.position_option_seconds, 5);
        assert_eq!(snapshot.regen_cycle_position, 6);
        assert_eq!(snapshot.regen_active, 1);
        assert!(snapshot.prefill_soak_mode);
        assert_eq!(snapshot.soak_timer, 30);
        assert!(snapshot.is_in_aeration);
        assert_eq!(snapshot.tank_in_service, 2);
        assert_eq!(snapshot.usage_history.len(), USAGE_HISTORY_LEN);
        assert_eq!(snapshot.usage_history[0], 1);
        assert_eq!(snapshot.usage_history[61], 62);
    }

    #[test]
    fn test_signed_packets_in_any_order() {
        let expected = feed(&[0, 1, 2, 3, 4, 5]).unwrap();
        for order in [
            [1, 0, 2, 3, 4, 5],
            [2, 3, 4, 5, 0, 1],
            [2, 0, 3, 1, 4, 5],
            [1, 2, 3, 4, 0, 5],
        ] {
            assert_eq!(feed(&order).as_ref(), Some(&expected), "{order:?}");
        }
    }

    #[test]
    fn test_unsigned_before_packet_two_is_dropped() {
        let packets = burst();
        let mut reassembler = DashboardReassembler::new();
        assert!(reassembler.push(&packets[3]).is_none());
        assert_eq!(reassembler.received(), 0);
    }

    #[test]
    fn test_missing_packet_yields_nothing() {
        assert!(feed(&[0, 1, 2, 3, 4]).is_none());
        assert!(feed(&[0, 2, 3, 4, 5]).is_none());
    }

    #[test]
    fn test_bad_tails_are_dropped() {
        let mut packets = burst();
        packets[0][19] = 58;
        let mut reassembler = DashboardReassembler::new();
        assert!(reassembler.push(&packets[0]).is_none());
        assert_eq!(reassembler.received(), 0);

        let mut packets = burst();
        packets[5][5] = 57;
        let mut reassembler = DashboardReassembler::new();
        for packet in &packets {
            assert!(reassembler.push(packet).is_none());
        }
        assert_eq!(reassembler.received(), 5);
    }

    #[test]
    fn test_short_continuation_is_not_stored_under_guessed_index() {
        let packets = burst();
        let mut reassembler = DashboardReassembler::new();
        reassembler.push(&packets[0]);
        reassembler.push(&packets[1]);
        reassembler.push(&packets[2]);
        reassembler.push(&packets[3][..10]);
        assert_eq!(reassembler.received(), 3);

        // the real packet 3 still fills slot 3
        reassembler.push(&packets[3]);
        reassembler.push(&packets[4]);
        assert!(reassembler.push(&packets[5]).is_some());
    }

    #[test]
    fn test_duplicate_signed_packet_is_not_double_counted() {
        let packets = burst();
        let mut reassembler = DashboardReassembler::new();
        reassembler.push(&packets[0]);
        reassembler.push(&packets[0]);
        assert_eq!(reassembler.received(), 1);
    }

    #[test]
    fn test_repeated_signed_packet_after_packet_two_is_dropped() {
        let packets = burst();
        let mut reassembler = DashboardReassembler::new();
        reassembler.push(&packets[0]);
        reassembler.push(&packets[1]);
        reassembler.push(&packets[2]);
        assert!(reassembler.push(&packets[0]).is_none());
        assert!(reassembler.push(&packets[1]).is_none());
        assert_eq!(reassembler.received(), 3);

        reassembler.push(&packets[3]);
        reassembler.push(&packets[4]);
        let snapshot = reassembler.push(&packets[5]).expect("complete burst");
        assert_eq!(Some(snapshot), feed(&[0, 1, 2, 3, 4, 5]));
    }

    #[test]
    fn test_reassembler_resets_after_completion() {
        let packets = burst();
        let mut reassembler = DashboardReassembler::new();
        for packet in &packets {
            reassembler.push(packet);
        }
        assert_eq!(reassembler.received(), 0);
    }

    #[test]
    fn test_battery_breakpoints() {
        assert_eq!(capacity_from_volts(9.5), 100);
        assert_eq!(capacity_from_volts(8.91), 94);
        assert_eq!(capacity_from_volts(8.48), 81);
        assert_eq!(capacity_from_volts(7.43), 18);
        assert_eq!(capacity_from_volts(6.5), 0);
        assert_eq!(capacity_from_volts(6.49), 0);
        assert_eq!(capacity_from_volts(12.0), 100);
    }

    #[test]
    fn test_battery_raw_values() {
        assert_eq!(battery_capacity(0), 0);
        assert_eq!(battery_capacity(73), 0);
        assert_eq!(battery_capacity(80), 10);
        assert_eq!(battery_capacity(90), 47);
        assert_eq!(battery_capacity(100), 91);
        assert_eq!(battery_capacity(104), 96);
        assert_eq!(battery_capacity(108), 100);
        assert_eq!(battery_capacity(255), 100);
    }
}

/// Property-based tests for reassembly.
#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn push_never_panics(packets in proptest::collection::vec(
            proptest::collection::vec(any::<u8>(), 0..24), 0..12)
        ) {
            let mut reassembler = DashboardReassembler::new();
            for packet in &packets {
                let _ = reassembler.push(packet);
            }
        }

        #[test]
        fn battery_capacity_is_monotonic(raw in 0u8..255) {
            prop_assert!(battery_capacity(raw) <= battery_capacity(raw + 1));
        }
    }
}
