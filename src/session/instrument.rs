//! Live power supply access for pre-load checks.
//!
//! Loading a session can drive a connected supply to the saved state. Before
//! that happens the loader compares the saved state with the live one and
//! reports every change that could damage a device under test.

use super::document::PowerSupplyState;

/// Read-only view of a connected power supply.
#[cfg_attr(test, mockall::automock)]
pub trait PowerSupply {
    fn channel_count(&self) -> usize;
    fn channel_name(&self, channel: usize) -> String;
    fn voltage_setpoint(&self, channel: usize) -> f64;
    fn current_setpoint(&self, channel: usize) -> f64;
    /// True when the channel shuts down on overcurrent, false when it current-limits.
    fn overcurrent_shutdown(&self, channel: usize) -> bool;
    fn channel_enabled(&self, channel: usize) -> bool;
    /// `None` if the supply has no master output switch.
    fn master_enabled(&self) -> Option<bool>;
}

/// Warnings for applying `saved` to `live`.
///
/// Lowering a setpoint or switching an output off is never reported.
pub fn preload_warnings(nickname: &str, live: &dyn PowerSupply, saved: &PowerSupplyState) -> Vec<String> {
    let mut warnings = Vec::new();

    if let (Some(want), Some(have)) = (saved.master_enable, live.master_enabled()) {
        if want != have {
            warnings.push(format!(
                "{}: master output will be turned {}",
                nickname,
                if want { "on" } else { "off" }
            ));
        }
    }

    let count = live.channel_count();
    if saved.channels.len() != count {
        tracing::warn!(
            "{}: session has {} channels, supply has {}",
            nickname,
            saved.channels.len(),
            count
        );
    }

    for (i, want) in saved.channels.iter().enumerate().take(count) {
        let name = live.channel_name(i);
        let volts = live.voltage_setpoint(i);
        if want.voltage > volts {
            warnings.push(format!(
                "{}: {} voltage will increase from {:.3} V to {:.3} V",
                nickname, name, volts, want.voltage
            ));
        }
        let amps = live.current_setpoint(i);
        if want.current > amps {
            warnings.push(format!(
                "{}: {} current limit will increase from {:.3} A to {:.3} A",
                nickname, name, amps, want.current
            ));
        }
        if live.overcurrent_shutdown(i) && !want.ocp_shutdown {
            warnings.push(format!(
                "{}: {} overcurrent shutdown will be disabled",
                nickname, name
            ));
        }
        if want.enabled && !live.channel_enabled(i) {
            warnings.push(format!("{}: {} output will be turned on", nickname, name));
        }
    }
    warnings
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::document::PowerChannelState;

    fn supply(volts: f64, amps: f64, ocp: bool, enabled: bool, master: Option<bool>) -> MockPowerSupply {
        let mut psu = MockPowerSupply::new();
        psu.expect_channel_count().return_const(1usize);
        psu.expect_channel_name().returning(|i| format!("CH{}", i + 1));
        psu.expect_voltage_setpoint().return_const(volts);
        psu.expect_current_setpoint().return_const(amps);
        psu.expect_overcurrent_shutdown().return_const(ocp);
        psu.expect_channel_enabled().return_const(enabled);
        psu.expect_master_enabled().return_const(master);
        psu
    }

    fn saved(voltage: f64, current: f64, ocp_shutdown: bool, enabled: bool, master: Option<bool>) -> PowerSupplyState {
        PowerSupplyState {
            master_enable: master,
            channels: vec![PowerChannelState {
                voltage,
                current,
                ocp_shutdown,
                enabled,
            }],
        }
    }

    #[test]
    fn test_identical_state_is_silent() {
        let psu = supply(3.3, 0.5, true, true, Some(true));
        assert!(preload_warnings("psu", &psu, &saved(3.3, 0.5, true, true, Some(true))).is_empty());
    }

    #[test]
    fn test_every_hazard_reported() {
        let psu = supply(1.8, 0.1, true, false, Some(false));
        let w = preload_warnings("psu", &psu, &saved(5.0, 1.0, false, true, Some(true)));
        assert_eq!(w.len(), 5, "{w:?}");
        assert!(w[0].contains("master output will be turned on"));
        assert!(w[1].contains("CH1 voltage will increase from 1.800 V to 5.000 V"));
        assert!(w[2].contains("current limit will increase"));
        assert!(w[3].contains("overcurrent shutdown will be disabled"));
        assert!(w[4].contains("CH1 output will be turned on"));
    }

    #[test]
    fn test_reductions_are_safe() {
        let psu = supply(5.0, 1.0, false, true, None);
        assert!(preload_warnings("psu", &psu, &saved(3.3, 0.2, true, false, Some(false))).is_empty());
    }

    #[test]
    fn test_master_off_is_reported() {
        let psu = supply(3.3, 0.5, false, true, Some(true));
        let w = preload_warnings("bench", &psu, &saved(3.3, 0.5, false, true, Some(false)));
        assert_eq!(w, vec!["bench: master output will be turned off".to_string()]);
    }

    #[test]
    fn test_extra_saved_channels_ignored() {
        let psu = supply(3.3, 0.5, false, true, None);
        let mut state = saved(3.3, 0.5, false, true, None);
        state.channels.push(PowerChannelState {
            voltage: 12.0,
            current: 3.0,
            ocp_shutdown: false,
            enabled: true,
        });
        assert!(preload_warnings("psu", &psu, &state).is_empty());
    }
}
