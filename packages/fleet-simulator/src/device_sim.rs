//! device_sim.rs — Per-device telemetry synthesis
//!
//! Each simulated device advances one tick at a time and emits a
//! `Measurement` consistent with its scenario: Gaussian radio noise around
//! a scenario-driven RSSI baseline, plus the optional health channels
//! (response time, online flag, error counter, temperature, power).

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};

use telemetry_types::Measurement;

use crate::scenarios::{DeviceSpec, ScenarioType};

pub struct DeviceSim {
    pub spec: DeviceSpec,
    tick: u32,
    degrade_over_ticks: u32,
    error_total: u32,
    rng: StdRng,
    rssi_noise: Normal<f64>,
    rt_noise: Normal<f64>,
}

impl DeviceSim {
    pub fn new(spec: DeviceSpec, degrade_over_ticks: u32, seed: u64) -> Self {
        Self {
            spec,
            tick: 0,
            degrade_over_ticks: degrade_over_ticks.max(1),
            error_total: 0,
            rng: StdRng::seed_from_u64(seed),
            rssi_noise: Normal::new(0.0, 1.5).expect("valid sigma"),
            rt_noise: Normal::new(0.0, 15.0).expect("valid sigma"),
        }
    }

    /// Degradation progress in [0, 1].
    fn progress(&self) -> f64 {
        (self.tick as f64 / self.degrade_over_ticks as f64).min(1.0)
    }

    /// Produce the next measurement and advance the device one tick.
    pub fn next_measurement(&mut self, timestamp_ms: i64) -> Measurement {
        let t = self.progress();
        let noise = self.rssi_noise.sample(&mut self.rng);

        let mut m = Measurement::rssi_only(&self.spec.id, timestamp_ms, self.spec.base_rssi + noise);
        m.snr = Some(25.0 + self.rng.gen_range(-5.0..5.0));
        m.frequency = Some(2.4);
        m.channel = Some(6);
        m.response_time_ms = Some((100.0 + self.rt_noise.sample(&mut self.rng)).max(1.0));
        m.is_online = Some(true);
        m.error_count = Some(0);
        m.temperature_c = Some(60.0 + self.rng.gen_range(-2.0..2.0));
        m.power_w = Some(8.0 + self.rng.gen_range(-0.5..0.5));

        match self.spec.scenario {
            ScenarioType::Healthy => {}
            ScenarioType::Degrading => {
                // signal fades, latency climbs, link starts flapping past
                // the midpoint, errors and temperature keep rising
                m.rssi = self.spec.base_rssi - 40.0 * t + noise;
                m.response_time_ms = Some(200.0 + 600.0 * t + self.rt_noise.sample(&mut self.rng).abs());
                if t > 0.5 {
                    m.is_online = Some(self.tick % 2 == 0);
                }
                if self.tick % 5 == 4 {
                    self.error_total += 1;
                }
                m.error_count = Some(self.error_total);
                m.temperature_c = Some(65.0 + 23.0 * t);
                m.power_w = Some(8.0 + 3.0 * t);
            }
            ScenarioType::Flapping => {
                // bursts of 3 offline ticks every 10
                let offline = self.tick % 10 < 3 && self.tick > 10;
                m.is_online = Some(!offline);
                if offline {
                    m.response_time_ms = None;
                }
            }
            ScenarioType::Overheating => {
                m.temperature_c = Some(60.0 + 35.0 * t + self.rng.gen_range(-1.0..1.0));
            }
            ScenarioType::Oscillating => {
                let level = if self.tick % 2 == 0 { 0.0 } else { -35.0 };
                m.rssi = self.spec.base_rssi + level + noise;
            }
        }

        self.tick += 1;
        m
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scenarios::DeviceSpec;

    fn sim(scenario: ScenarioType) -> DeviceSim {
        DeviceSim::new(
            DeviceSpec {
                id: "dev".into(),
                scenario,
                base_rssi: -55.0,
            },
            100,
            42,
        )
    }

    #[test]
    fn healthy_device_stays_near_baseline() {
        let mut sim = sim(ScenarioType::Healthy);
        for i in 0..50 {
            let m = sim.next_measurement(i);
            assert!((m.rssi - -55.0).abs() < 10.0);
            assert_eq!(m.is_online, Some(true));
            assert_eq!(m.error_count, Some(0));
        }
    }

    #[test]
    fn degrading_device_fades_and_flaps() {
        let mut sim = sim(ScenarioType::Degrading);
        let mut last = None;
        let mut saw_offline = false;
        for i in 0..100 {
            let m = sim.next_measurement(i);
            if m.is_online == Some(false) {
                saw_offline = true;
            }
            last = Some(m);
        }
        let last = last.unwrap();
        assert!(last.rssi < -80.0, "rssi {}", last.rssi);
        assert!(last.response_time_ms.unwrap() > 600.0);
        assert!(last.temperature_c.unwrap() > 85.0);
        assert!(last.error_count.unwrap() > 10);
        assert!(saw_offline);
    }

    #[test]
    fn overheating_device_crosses_the_threshold() {
        let mut sim = sim(ScenarioType::Overheating);
        let mut max_temp = f64::MIN;
        for i in 0..100 {
            let m = sim.next_measurement(i);
            max_temp = max_temp.max(m.temperature_c.unwrap());
        }
        assert!(max_temp > 85.0);
    }

    #[test]
    fn same_seed_is_reproducible() {
        let mut a = sim(ScenarioType::Healthy);
        let mut b = sim(ScenarioType::Healthy);
        for i in 0..20 {
            assert_eq!(a.next_measurement(i).rssi, b.next_measurement(i).rssi);
        }
    }
}
