//! Live telemetry decoded from a Dashboard response.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Number of entries in the daily usage histogram.
pub const USAGE_HISTORY_LEN: usize = 62;

/// Clock time as shown on the valve display (12-hour).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ClockTime {
    pub hour: u8,
    pub minute: u8,
    pub is_pm: bool,
}

/// Complete telemetry snapshot from one Dashboard burst.
///
/// A snapshot is only ever built from all six packets; it replaces the previous
/// one wholesale.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DashboardSnapshot {
    /// Valve clock.
    pub time: ClockTime,
    /// Raw battery reading.
    pub battery_raw: u8,
    /// Estimated battery capacity in percent (0-100).
    pub battery_capacity: u8,
    /// Current flow in gallons per minute.
    pub present_flow: f32,
    /// Gallons left before the next regeneration.
    pub water_remaining_until_regeneration: u16,
    /// Gallons used today.
    pub water_usage: u16,
    /// Peak flow in gallons per minute.
    pub peak_flow: f32,
    /// Hardness setting in grains.
    pub water_hardness: u8,
    /// Scheduled regeneration hour.
    pub regeneration_time_hour: u8,
    pub regeneration_time_is_pm: bool,
    pub shutoff_setting_enabled: bool,
    pub bypass_setting_enabled: bool,
    pub shutoff_active: bool,
    pub bypass_active: bool,
    pub display_off: bool,
    /// Days between filter backwashes.
    pub filter_backwash: u8,
    pub air_recharge: u8,
    pub position_time: u8,
    pub position_option_seconds: u8,
    pub regen_cycle_position: u8,
    /// Raw regeneration state; non-zero while regenerating.
    pub regen_active: u8,
    pub prefill_soak_mode: bool,
    pub soak_timer: u8,
    pub is_in_aeration: bool,
    pub tank_in_service: u8,
    /// Usage history in units of ten gallons, oldest first.
    pub usage_history: Vec<u8>,
}

impl DashboardSnapshot {
    /// True while the valve is regenerating.
    #[must_use]
    pub fn is_regenerating(&self) -> bool {
        self.regen_active != 0
    }

    /// Clock time in 24-hour form, or `None` if the hour is not 1-12.
    #[must_use]
    pub fn time_24h(&self) -> Option<(u8, u8)> {
        let hour = match (self.time.hour, self.time.is_pm) {
            (1..=11, false) => self.time.hour,
            (12, false) => 0,
            (1..=11, true) => self.time.hour + 12,
            (12, true) => 12,
            _ => return None,
        };
        Some((hour, self.time.minute))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot_at(hour: u8, is_pm: bool) -> DashboardSnapshot {
        DashboardSnapshot {
            time: ClockTime {
                hour,
                minute: 30,
                is_pm,
            },
            battery_raw: 0,
            battery_capacity: 0,
            present_flow: 0.0,
            water_remaining_until_regeneration: 0,
            water_usage: 0,
            peak_flow: 0.0,
            water_hardness: 0,
            regeneration_time_hour: 2,
            regeneration_time_is_pm: false,
            shutoff_setting_enabled: false,
            bypass_setting_enabled: false,
            shutoff_active: false,
            bypass_active: false,
            display_off: false,
            filter_backwash: 0,
            air_recharge: 0,
            position_time: 0,
            position_option_seconds: 0,
            regen_cycle_position: 0,
            regen_active: 0,
            prefill_soak_mode: false,
            soak_timer: 0,
            is_in_aeration: false,
            tank_in_service: 0,
            usage_history: vec![0; USAGE_HISTORY_LEN],
        }
    }

    #[test]
    fn test_time_24h() {
        assert_eq!(snapshot_at(12, false).time_24h(), Some((0, 30)));
        assert_eq!(snapshot_at(12, true).time_24h(), Some((12, 30)));
        assert_eq!(snapshot_at(7, true).time_24h(), Some((19, 30)));
        assert_eq!(snapshot_at(0, false).time_24h(), None);
    }

    #[test]
    fn test_is_regenerating() {
        let mut snapshot = snapshot_at(1, false);
        assert!(!snapshot.is_regenerating());
        snapshot.regen_active = 3;
        assert!(snapshot.is_regenerating());
    }
}
