use serde::{Deserialize, Serialize};

/// Identifiers for the spacecraft subsystems managed by the power system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SubsystemId {
    Rf,
    Obc,
    Adcs,
    Thermal,
    Payload,
    Sensors,
}

impl SubsystemId {
    pub const ALL: [SubsystemId; 6] = [
        SubsystemId::Rf,
        SubsystemId::Obc,
        SubsystemId::Adcs,
        SubsystemId::Thermal,
        SubsystemId::Payload,
        SubsystemId::Sensors,
    ];

    /// Nominal power draw at full level, fixed by the CubeSat platform.
    pub fn base_power_w(self) -> f32 {
        match self {
            SubsystemId::Rf => 5.0,
            SubsystemId::Obc => 3.0,
            SubsystemId::Adcs => 4.0,
            SubsystemId::Thermal => 2.0,
            SubsystemId::Payload => 8.0,
            SubsystemId::Sensors => 1.5,
        }
    }

    pub fn from_wire(value: u8) -> Option<SubsystemId> {
        match value {
            0 => Some(SubsystemId::Rf),
            1 => Some(SubsystemId::Obc),
            2 => Some(SubsystemId::Adcs),
            3 => Some(SubsystemId::Thermal),
            4 => Some(SubsystemId::Payload),
            5 => Some(SubsystemId::Sensors),
            _ => None,
        }
    }

    pub fn to_wire(self) -> u8 {
        match self {
            SubsystemId::Rf => 0,
            SubsystemId::Obc => 1,
            SubsystemId::Adcs => 2,
            SubsystemId::Thermal => 3,
            SubsystemId::Payload => 4,
            SubsystemId::Sensors => 5,
        }
    }
}

impl core::fmt::Display for SubsystemId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let name = match self {
            SubsystemId::Rf => "RF",
            SubsystemId::Obc => "OBC",
            SubsystemId::Adcs => "ADCS",
            SubsystemId::Thermal => "THERMAL",
            SubsystemId::Payload => "PAYLOAD",
            SubsystemId::Sensors => "SENSORS",
        };
        write!(f, "{}", name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_codes_round_trip() {
        for id in SubsystemId::ALL {
            assert_eq!(SubsystemId::from_wire(id.to_wire()), Some(id));
        }
        assert_eq!(SubsystemId::from_wire(6), None);
    }

    #[test]
    fn base_power_matches_platform_figures() {
        let total: f32 = SubsystemId::ALL.iter().map(|s| s.base_power_w()).sum();
        assert!((total - 23.5).abs() < 1e-6);
    }
}
