//! Simulated bench for offline runs and tests. No instrument IO, no
//! sleeps; tuning converges after a configurable number of polls and
//! counts come from a small deterministic generator.

use std::time::Duration;

use crate::error::RamanError;
use crate::instrument::interface::Bench;
use crate::types::{
    AlignmentOutcome, ChannelEntry, ChannelSet, DetectorId, SwitchChannel, TuningStatus,
    WavelengthReading,
};

pub struct SimBench {
    wavelength_nm: f64,
    target_nm: f64,
    status: TuningStatus,
    polls_remaining: u32,
    /// Polls reporting `Tuning` before a tune settles into `Maintaining`.
    pub polls_to_converge: u32,
    /// Targets that never converge (the simulated laser sticks half a
    /// nanometer off and keeps reporting `Tuning`).
    pub fail_targets: Vec<f64>,
    /// Tune commands received, most recent last.
    pub tune_calls: Vec<f64>,
    active: Option<ChannelEntry>,
    rng_state: u64,
}

impl SimBench {
    pub fn new() -> Self {
        SimBench {
            wavelength_nm: 780.0,
            target_nm: 780.0,
            status: TuningStatus::Idle,
            polls_remaining: 0,
            polls_to_converge: 1,
            fail_targets: Vec::new(),
            tune_calls: Vec::new(),
            active: None,
            rng_state: 0x9e37_79b9,
        }
    }

    /// Two detectors on channels 1 and 2, mirroring a small bench.
    pub fn channel_set() -> ChannelSet {
        ChannelSet::new(vec![
            ChannelEntry {
                detector: DetectorId::new("sim-spad-a"),
                switch_channel: SwitchChannel(1),
            },
            ChannelEntry {
                detector: DetectorId::new("sim-spad-b"),
                switch_channel: SwitchChannel(2),
            },
        ])
    }

    /// Push the held wavelength off its set point, as a resonator
    /// wandering between exposures would.
    pub fn drift(&mut self, delta_nm: f64) {
        self.wavelength_nm += delta_nm;
    }

    fn fails(&self, target_nm: f64) -> bool {
        self.fail_targets.iter().any(|t| (t - target_nm).abs() < 1e-9)
    }

    fn next_noise(&mut self) -> f64 {
        // xorshift64, folded into [0, 1).
        let mut x = self.rng_state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.rng_state = x;
        (x >> 11) as f64 / (1u64 << 53) as f64
    }
}

impl Default for SimBench {
    fn default() -> Self {
        Self::new()
    }
}

impl Bench for SimBench {
    fn tune(&mut self, target_nm: f64) -> Result<(), RamanError> {
        self.tune_calls.push(target_nm);
        self.target_nm = target_nm;
        self.status = TuningStatus::Tuning;
        if self.fails(target_nm) {
            self.wavelength_nm = target_nm + 0.5;
            self.polls_remaining = u32::MAX;
        } else {
            self.polls_remaining = self.polls_to_converge;
        }
        Ok(())
    }

    fn read_wavelength(&mut self) -> Result<WavelengthReading, RamanError> {
        if self.status == TuningStatus::Tuning {
            if self.polls_remaining == 0 {
                self.status = TuningStatus::Maintaining;
                self.wavelength_nm = self.target_nm + 0.002;
            } else {
                self.polls_remaining = self.polls_remaining.saturating_sub(1);
                if !self.fails(self.target_nm) {
                    self.wavelength_nm = self.target_nm + 0.1;
                }
            }
        }
        Ok(WavelengthReading {
            wavelength_nm: self.wavelength_nm,
            status: self.status,
        })
    }

    fn stop_tuning(&mut self) -> Result<(), RamanError> {
        self.status = TuningStatus::Idle;
        Ok(())
    }

    fn realign(&mut self) -> Result<AlignmentOutcome, RamanError> {
        Ok(AlignmentOutcome::Aligned)
    }

    fn set_channel(&mut self, entry: &ChannelEntry) -> Result<(), RamanError> {
        self.active = Some(entry.clone());
        Ok(())
    }

    fn read_count(&mut self, _integration: Duration) -> Result<f64, RamanError> {
        let channel = self
            .active
            .as_ref()
            .map(|e| f64::from(e.switch_channel.0))
            .ok_or_else(|| RamanError::Protocol("no detector channel selected".to_string()))?;
        // A broad synthetic line centered at 800 nm plus shot-like noise.
        let line = 5_000.0 * (-((self.wavelength_nm - 800.0) / 5.0).powi(2)).exp();
        let noise = self.next_noise() * 50.0;
        Ok((200.0 * channel + line + noise).round())
    }

    fn read_power(&mut self) -> Result<f64, RamanError> {
        Ok(1.0e-6 * (1.0 + 0.02 * (self.next_noise() - 0.5)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tune_converges_after_configured_polls() {
        let mut bench = SimBench::new();
        bench.polls_to_converge = 2;
        bench.tune(800.0).unwrap();
        assert_eq!(bench.read_wavelength().unwrap().status, TuningStatus::Tuning);
        assert_eq!(bench.read_wavelength().unwrap().status, TuningStatus::Tuning);
        let reading = bench.read_wavelength().unwrap();
        assert_eq!(reading.status, TuningStatus::Maintaining);
        assert!((reading.wavelength_nm - 800.002).abs() < 1e-9);
    }

    #[test]
    fn failing_target_never_converges() {
        let mut bench = SimBench::new();
        bench.fail_targets.push(801.0);
        bench.tune(801.0).unwrap();
        for _ in 0..10 {
            let reading = bench.read_wavelength().unwrap();
            assert_eq!(reading.status, TuningStatus::Tuning);
            assert!((reading.wavelength_nm - 801.5).abs() < 1e-9);
        }
    }

    #[test]
    fn counts_need_a_selected_channel() {
        let mut bench = SimBench::new();
        assert!(bench.read_count(Duration::from_millis(1)).is_err());
        let set = SimBench::channel_set();
        bench.set_channel(set.get(0).unwrap()).unwrap();
        assert!(bench.read_count(Duration::from_millis(1)).unwrap() > 0.0);
    }
}
