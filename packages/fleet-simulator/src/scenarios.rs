//! scenarios.rs — Injectable device scenarios for the fleet simulator
//!
//! Each scenario reproduces a real-world device trajectory the pipeline has
//! to classify correctly: quiet health, slow degradation toward failure, a
//! flapping link, a cooling failure. Scenarios are declared per device in
//! fleet.toml or assigned round-robin from the CLI.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScenarioType {
    /// Steady −55 dBm, fast responses, always online, cool
    Healthy,
    /// RSSI walks −50 → −90, response time 200 → 800 ms, link starts
    /// flapping after the midpoint, errors and temperature climb
    Degrading,
    /// Good signal but the link drops out in bursts
    Flapping,
    /// Normal radio behavior with temperature ramping past 85 °C
    Overheating,
    /// Healthy radio that oscillates wildly between two RSSI levels
    Oscillating,
}

impl ScenarioType {
    /// Round-robin assignment for fleets declared only by `--devices N`.
    pub fn nth(i: usize) -> Self {
        match i % 5 {
            0 | 1 => Self::Healthy,
            2 => Self::Degrading,
            3 => Self::Flapping,
            _ => Self::Overheating,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceSpec {
    pub id: String,
    pub scenario: ScenarioType,
    /// Baseline RSSI for the healthy phase (default −55 dBm)
    #[serde(default = "default_base_rssi")]
    pub base_rssi: f64,
}

fn default_base_rssi() -> f64 {
    -55.0
}

#[derive(Debug, Clone, Deserialize)]
pub struct FleetConfig {
    pub devices: Vec<DeviceSpec>,
    /// Ticks a Degrading device takes to walk from healthy to failed
    #[serde(default = "default_degrade_ticks")]
    pub degrade_over_ticks: u32,
}

fn default_degrade_ticks() -> u32 {
    120
}

impl FleetConfig {
    /// Fleet built from a bare device count: mostly healthy, the rest a mix
    /// of failure modes.
    pub fn round_robin(count: usize) -> Self {
        Self {
            devices: (0..count)
                .map(|i| DeviceSpec {
                    id: format!("device-{:02}", i + 1),
                    scenario: ScenarioType::nth(i),
                    base_rssi: default_base_rssi(),
                })
                .collect(),
            degrade_over_ticks: default_degrade_ticks(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_robin_mixes_scenarios() {
        let fleet = FleetConfig::round_robin(5);
        assert_eq!(fleet.devices.len(), 5);
        assert_eq!(fleet.devices[0].scenario, ScenarioType::Healthy);
        assert_eq!(fleet.devices[2].scenario, ScenarioType::Degrading);
        assert_eq!(fleet.devices[4].scenario, ScenarioType::Overheating);
    }

    #[test]
    fn fleet_config_parses_from_toml() {
        let toml = r#"
            degrade_over_ticks = 60

            [[devices]]
            id = "lab-sensor"
            scenario = "DEGRADING"
            base_rssi = -48.0

            [[devices]]
            id = "lobby-ap"
            scenario = "HEALTHY"
        "#;
        let fleet: FleetConfig = toml::from_str(toml).unwrap();
        assert_eq!(fleet.degrade_over_ticks, 60);
        assert_eq!(fleet.devices[0].id, "lab-sensor");
        assert_eq!(fleet.devices[0].scenario, ScenarioType::Degrading);
        assert_eq!(fleet.devices[1].base_rssi, -55.0);
    }
}
