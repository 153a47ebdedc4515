//! Cooperative exposure scheduling.
//!
//! The scheduler owns one pass over the target wavelength list. Each
//! [`ExposureScheduler::step`] call performs exactly one unit of work --
//! one tune-and-converge attempt or one exposure -- and returns, so the
//! host loop stays responsive to pause and stop requests between steps.
//!
//! Periodic maintenance (wavelength-drift recheck, beam-alignment check,
//! autosave) is clocked by accumulated hardware integration time, not
//! wall-clock time, and each boundary fires once per crossing.

use log::{debug, info, warn};
use std::mem;
use std::thread;
use std::time::Duration;

use crate::config::SweepConfig;
use crate::error::RamanError;
use crate::instrument::Bench;
use crate::tuning::TuningController;
use crate::types::{ChannelSet, ExposureSample, Step, SweepProgress};

/// Per-pass exposure parameters.
#[derive(Debug, Clone)]
pub struct ExposureSettings {
    /// Total exposure per repetition; subdivided into hardware ticks.
    pub integration: Duration,
    /// Hardware integration tick of the detector.
    pub tick: Duration,
    /// Repetition entries collected per (wavelength, channel) in a pass.
    pub repetitions: usize,
    /// Settle delay after a switch-channel change.
    pub measurement_delay: Duration,
    /// Acceptance window around the target after a reported tune success.
    pub wavelength_tolerance_nm: f64,
    /// Whole tune-and-converge invocations per wavelength per traversal.
    pub max_tune_calls: u32,
    /// Traversals (initial pass plus retry sub-passes) before unreached
    /// wavelengths are abandoned.
    pub max_pass_attempts: u32,
    /// Read retries for a flaky count or power query.
    pub max_read_retries: u32,
}

impl ExposureSettings {
    pub fn from_config(sweep: &SweepConfig, integration: Duration, tick: Duration, repetitions: usize) -> Self {
        ExposureSettings {
            integration,
            tick,
            repetitions,
            measurement_delay: sweep.measurement_delay(),
            wavelength_tolerance_nm: sweep.wavelength_tolerance_nm,
            max_tune_calls: sweep.max_tune_calls,
            max_pass_attempts: sweep.max_pass_attempts,
            max_read_retries: sweep.max_error_retries,
        }
    }

    fn ticks_per_exposure(&self) -> u32 {
        let ticks = (self.integration.as_secs_f64() / self.tick.as_secs_f64()).round() as u32;
        ticks.max(1)
    }
}

/// Enabled periodic subroutines and their elapsed-exposure intervals.
#[derive(Debug, Clone, Default)]
pub struct PeriodicChecks {
    pub drift: Option<Duration>,
    pub alignment: Option<Duration>,
    pub autosave: Option<Duration>,
}

impl PeriodicChecks {
    pub fn from_config(sweep: &SweepConfig) -> Self {
        PeriodicChecks {
            drift: sweep
                .check_wavelength
                .then(|| Duration::from_secs(sweep.check_wavelength_interval_s)),
            alignment: sweep
                .check_alignment
                .then(|| Duration::from_secs(sweep.alignment_interval_s)),
            autosave: sweep
                .auto_backup
                .then(|| Duration::from_secs(sweep.autobackup_interval_s)),
        }
    }
}

/// Edge-triggered periodic boundary: fires when the phase of the elapsed
/// clock within the interval wraps from high to low.
#[derive(Debug)]
struct IntervalEdge {
    interval_s: f64,
    prev_phase: f64,
}

impl IntervalEdge {
    fn new(interval: Duration) -> Self {
        IntervalEdge {
            interval_s: interval.as_secs_f64(),
            prev_phase: 0.0,
        }
    }

    fn crossed(&mut self, elapsed_s: f64) -> bool {
        let phase = elapsed_s % self.interval_s;
        let fired = phase < self.prev_phase;
        self.prev_phase = phase;
        fired
    }
}

/// Position within the pass cross-product.
#[derive(Debug, Clone, PartialEq)]
enum Phase {
    /// Next action: tune targets[wl_idx].
    Tune { wl_idx: usize },
    /// Next action: one exposure at the cursor position.
    Expose {
        wl_idx: usize,
        chan_idx: usize,
        repetition: usize,
        /// The switch must be moved before this exposure.
        select_channel: bool,
        measured_nm: f64,
    },
    Done,
}

pub struct ExposureScheduler {
    settings: ExposureSettings,
    tuner: TuningController,
    targets: Vec<f64>,
    channels: ChannelSet,
    failed: Vec<f64>,
    /// Traversal counter: 1 for the initial pass, +1 per retry sub-pass.
    traversal: u32,
    phase: Phase,
    /// Total exposed measurement time, seconds of hardware integration.
    elapsed_s: f64,
    samples_done: usize,
    samples_total: usize,
    drift_edge: Option<IntervalEdge>,
    alignment_edge: Option<IntervalEdge>,
    autosave_edge: Option<IntervalEdge>,
    autosave_pending: bool,
}

impl ExposureScheduler {
    pub fn new(
        settings: ExposureSettings,
        checks: PeriodicChecks,
        tuner: TuningController,
        targets: Vec<f64>,
        channels: ChannelSet,
    ) -> Self {
        let samples_total = targets.len() * channels.len() * settings.repetitions;
        ExposureScheduler {
            settings,
            tuner,
            targets,
            channels,
            failed: Vec::new(),
            traversal: 1,
            phase: Phase::Tune { wl_idx: 0 },
            elapsed_s: 0.0,
            samples_done: 0,
            samples_total,
            drift_edge: checks.drift.map(IntervalEdge::new),
            alignment_edge: checks.alignment.map(IntervalEdge::new),
            autosave_edge: checks.autosave.map(IntervalEdge::new),
            autosave_pending: false,
        }
    }

    /// Reset the pass position for the next pass. The elapsed-exposure
    /// clock and periodic phases carry over so session-wide boundaries
    /// keep their cadence across passes.
    pub fn rearm(&mut self, targets: Vec<f64>) {
        self.samples_total =
            targets.len() * self.channels.len() * self.settings.repetitions;
        self.samples_done = 0;
        self.targets = targets;
        self.failed.clear();
        self.traversal = 1;
        self.phase = Phase::Tune { wl_idx: 0 };
    }

    pub fn set_channels(&mut self, channels: ChannelSet) {
        self.channels = channels;
        self.samples_total =
            self.targets.len() * self.channels.len() * self.settings.repetitions;
    }

    pub fn is_done(&self) -> bool {
        self.phase == Phase::Done
    }

    /// True between an autosave boundary crossing and [`Self::autosave_taken`].
    pub fn autosave_due(&self) -> bool {
        self.autosave_pending
    }

    pub fn autosave_taken(&mut self) {
        self.autosave_pending = false;
    }

    /// Fill a progress snapshot with the scheduler's counters.
    pub fn report(&self, progress: &mut SweepProgress) {
        progress.current_wavelength_nm = match self.phase {
            Phase::Tune { wl_idx } => self.targets.get(wl_idx).copied(),
            Phase::Expose { wl_idx, .. } => self.targets.get(wl_idx).copied(),
            Phase::Done => None,
        };
        progress.current_repetition = match self.phase {
            Phase::Expose { repetition, .. } => repetition,
            _ => 0,
        };
        progress.samples_done = self.samples_done;
        progress.samples_total = self.samples_total;
        progress.elapsed_exposure_s = self.elapsed_s;
        progress.failed_wavelengths = self.failed.clone();
    }

    /// Perform one unit of work: a tune attempt or a single exposure.
    pub fn step(&mut self, bench: &mut dyn Bench) -> Result<Step, RamanError> {
        loop {
            match self.phase.clone() {
                Phase::Done => {
                    return Ok(Step::PassComplete {
                        unreached: self.failed.clone(),
                    })
                }
                Phase::Tune { wl_idx } => {
                    if wl_idx >= self.targets.len() {
                        if let Some(step) = self.finish_traversal() {
                            return Ok(step);
                        }
                        continue; // retry sub-pass armed, tune its first target
                    }
                    return self.tune_step(bench, wl_idx);
                }
                Phase::Expose {
                    wl_idx,
                    chan_idx,
                    repetition,
                    select_channel,
                    measured_nm,
                } => {
                    return self.expose_step(
                        bench,
                        wl_idx,
                        chan_idx,
                        repetition,
                        select_channel,
                        measured_nm,
                    )
                }
            }
        }
    }

    /// End of one traversal: either arm a retry sub-pass over the failed
    /// wavelengths or declare the pass complete.
    fn finish_traversal(&mut self) -> Option<Step> {
        if self.failed.is_empty() {
            info!("pass complete, all wavelengths reached");
            self.phase = Phase::Done;
            return Some(Step::PassComplete {
                unreached: Vec::new(),
            });
        }
        if self.traversal >= self.settings.max_pass_attempts {
            warn!(
                "pass complete with unreached wavelengths after {} traversals: {:?}",
                self.traversal, self.failed
            );
            self.phase = Phase::Done;
            return Some(Step::PassComplete {
                unreached: self.failed.clone(),
            });
        }
        let retry = mem::take(&mut self.failed);
        info!("retry sub-pass over {retry:?}");
        self.targets = retry;
        self.traversal += 1;
        self.phase = Phase::Tune { wl_idx: 0 };
        None
    }

    fn tune_step(&mut self, bench: &mut dyn Bench, wl_idx: usize) -> Result<Step, RamanError> {
        let target_nm = self.targets[wl_idx];
        let outcome = self.tuner.converge(
            bench,
            target_nm,
            self.settings.wavelength_tolerance_nm,
            self.settings.max_tune_calls,
        )?;
        if !outcome.converged {
            self.failed.push(target_nm);
            self.phase = Phase::Tune { wl_idx: wl_idx + 1 };
            return Ok(Step::TuningFailed { target_nm });
        }
        self.phase = Phase::Expose {
            wl_idx,
            chan_idx: 0,
            repetition: 0,
            select_channel: true,
            measured_nm: outcome.measured_nm,
        };
        Ok(Step::Tuned {
            target_nm,
            measured_nm: outcome.measured_nm,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn expose_step(
        &mut self,
        bench: &mut dyn Bench,
        wl_idx: usize,
        chan_idx: usize,
        repetition: usize,
        select_channel: bool,
        measured_nm: f64,
    ) -> Result<Step, RamanError> {
        let target_nm = self.targets[wl_idx];
        let entry = self
            .channels
            .get(chan_idx)
            .ok_or_else(|| RamanError::Protocol("channel cursor out of range".to_string()))?
            .clone();

        if select_channel {
            with_retry(self.settings.max_read_retries, || bench.set_channel(&entry))?;
            thread::sleep(self.settings.measurement_delay);
        }

        let ticks = self.settings.ticks_per_exposure();
        let tick_s = self.settings.tick.as_secs_f64();
        let mut counts = Vec::with_capacity(ticks as usize);
        let mut powers = Vec::with_capacity(ticks as usize);
        for _ in 0..ticks {
            let tick = self.settings.tick;
            counts.push(with_retry(self.settings.max_read_retries, || {
                bench.read_count(tick)
            })?);
            powers.push(with_retry(self.settings.max_read_retries, || {
                bench.read_power()
            })?);
            self.elapsed_s += tick_s;
        }

        self.run_periodic(bench, target_nm)?;

        let sample = ExposureSample {
            detector: entry.detector.clone(),
            wavelength_nm: target_nm,
            measured_nm,
            repetition,
            counts,
            powers,
            elapsed_s: self.elapsed_s,
        };
        self.samples_done += 1;
        self.advance_cursor(wl_idx, chan_idx, repetition, measured_nm);
        Ok(Step::Sample(sample))
    }

    fn advance_cursor(
        &mut self,
        wl_idx: usize,
        chan_idx: usize,
        repetition: usize,
        measured_nm: f64,
    ) {
        if repetition + 1 < self.settings.repetitions {
            self.phase = Phase::Expose {
                wl_idx,
                chan_idx,
                repetition: repetition + 1,
                select_channel: false,
                measured_nm,
            };
        } else if chan_idx + 1 < self.channels.len() {
            self.phase = Phase::Expose {
                wl_idx,
                chan_idx: chan_idx + 1,
                repetition: 0,
                select_channel: true,
                measured_nm,
            };
        } else {
            self.phase = Phase::Tune { wl_idx: wl_idx + 1 };
        }
    }

    /// Run whichever periodic boundaries the elapsed-exposure clock just
    /// crossed.
    fn run_periodic(&mut self, bench: &mut dyn Bench, target_nm: f64) -> Result<(), RamanError> {
        let elapsed_s = self.elapsed_s;
        let drift_crossed = self
            .drift_edge
            .as_mut()
            .is_some_and(|edge| edge.crossed(elapsed_s));
        if drift_crossed {
            self.recheck_wavelength(bench, target_nm)?;
        }
        if let Some(edge) = &mut self.alignment_edge {
            if edge.crossed(self.elapsed_s) {
                match bench.realign() {
                    Ok(outcome) => debug!("alignment check: {outcome:?}"),
                    Err(e) => warn!("alignment check failed: {e}"),
                }
            }
        }
        if let Some(edge) = &mut self.autosave_edge {
            if edge.crossed(self.elapsed_s) {
                self.autosave_pending = true;
            }
        }
        Ok(())
    }

    /// Drift recheck: re-tune to the current target if the wavemeter has
    /// wandered out of tolerance. Exposure counters are untouched, so
    /// already-collected repetitions survive.
    fn recheck_wavelength(
        &mut self,
        bench: &mut dyn Bench,
        target_nm: f64,
    ) -> Result<(), RamanError> {
        let reading = match bench.read_wavelength() {
            Ok(reading) => reading,
            Err(e) => {
                warn!("drift recheck read failed: {e}");
                return Ok(());
            }
        };
        let drift = (reading.wavelength_nm - target_nm).abs();
        if drift <= self.settings.wavelength_tolerance_nm {
            debug!("drift recheck: {:.4} nm off target", drift);
            return Ok(());
        }
        warn!(
            "drift recheck: {} nm measured against {} nm target, re-tuning",
            reading.wavelength_nm, target_nm
        );
        let outcome = self.tuner.converge(
            bench,
            target_nm,
            self.settings.wavelength_tolerance_nm,
            self.settings.max_tune_calls,
        )?;
        if !outcome.converged {
            warn!("re-tune after drift did not converge, continuing at {} nm", outcome.measured_nm);
        }
        Ok(())
    }
}

/// Bounded retry for flaky instrument operations. Only transient
/// transport faults are retried.
fn with_retry<T>(
    max_retries: u32,
    mut op: impl FnMut() -> Result<T, RamanError>,
) -> Result<T, RamanError> {
    let mut attempt = 0;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < max_retries => {
                attempt += 1;
                warn!("instrument operation failed (attempt {attempt}): {e}");
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::SimBench;
    use crate::tuning::TuningLimits;
    use crate::types::{
        AlignmentOutcome, ChannelEntry, DetectorId, SwitchChannel, WavelengthReading,
    };

    fn settings(repetitions: usize) -> ExposureSettings {
        ExposureSettings {
            integration: Duration::from_millis(3),
            tick: Duration::from_millis(1),
            repetitions,
            measurement_delay: Duration::ZERO,
            wavelength_tolerance_nm: 0.01,
            max_tune_calls: 2,
            max_pass_attempts: 3,
            max_read_retries: 3,
        }
    }

    fn tuner() -> TuningController {
        TuningController::new(TuningLimits {
            max_tuning_polls: 3,
            max_errors: 3,
            idle_tolerance_nm: 0.015,
            settle: Duration::ZERO,
        })
    }

    fn one_channel() -> ChannelSet {
        ChannelSet::new(vec![ChannelEntry {
            detector: DetectorId::new("sim-spad-a"),
            switch_channel: SwitchChannel(1),
        }])
    }

    fn drive_pass(scheduler: &mut ExposureScheduler, bench: &mut dyn Bench) -> Vec<Step> {
        let mut steps = Vec::new();
        loop {
            let step = scheduler.step(bench).unwrap();
            let done = matches!(step, Step::PassComplete { .. });
            steps.push(step);
            if done {
                break;
            }
        }
        steps
    }

    #[test]
    fn pass_produces_every_sample_in_order() {
        let mut bench = SimBench::new();
        let mut scheduler = ExposureScheduler::new(
            settings(2),
            PeriodicChecks::default(),
            tuner(),
            vec![800.0, 801.0, 802.0],
            one_channel(),
        );
        let steps = drive_pass(&mut scheduler, &mut bench);

        let samples: Vec<&ExposureSample> = steps
            .iter()
            .filter_map(|s| match s {
                Step::Sample(sample) => Some(sample),
                _ => None,
            })
            .collect();
        assert_eq!(samples.len(), 6);
        let order: Vec<(f64, usize)> = samples
            .iter()
            .map(|s| (s.wavelength_nm, s.repetition))
            .collect();
        assert_eq!(
            order,
            vec![
                (800.0, 0),
                (800.0, 1),
                (801.0, 0),
                (801.0, 1),
                (802.0, 0),
                (802.0, 1),
            ]
        );
        assert!(samples.iter().all(|s| s.counts.len() == 3));
        match steps.last() {
            Some(Step::PassComplete { unreached }) => assert!(unreached.is_empty()),
            other => panic!("unexpected final step {other:?}"),
        }
    }

    #[test]
    fn failed_wavelength_is_retried_in_sub_passes() {
        let mut bench = SimBench::new();
        bench.fail_targets.push(801.0);
        let mut scheduler = ExposureScheduler::new(
            settings(2),
            PeriodicChecks::default(),
            tuner(),
            vec![800.0, 801.0, 802.0],
            one_channel(),
        );
        let steps = drive_pass(&mut scheduler, &mut bench);

        let failures = steps
            .iter()
            .filter(|s| matches!(s, Step::TuningFailed { target_nm } if *target_nm == 801.0))
            .count();
        // Initial traversal plus two retry sub-passes.
        assert_eq!(failures, 3);

        let sampled: Vec<f64> = steps
            .iter()
            .filter_map(|s| match s {
                Step::Sample(sample) => Some(sample.wavelength_nm),
                _ => None,
            })
            .collect();
        assert!(!sampled.contains(&801.0));
        assert_eq!(sampled.len(), 4);

        match steps.last() {
            Some(Step::PassComplete { unreached }) => assert_eq!(unreached, &vec![801.0]),
            other => panic!("unexpected final step {other:?}"),
        }
    }

    #[test]
    fn sub_pass_retries_only_the_failed_wavelength() {
        let mut bench = SimBench::new();
        bench.fail_targets.push(801.0);
        let mut scheduler = ExposureScheduler::new(
            settings(1),
            PeriodicChecks::default(),
            tuner(),
            vec![800.0, 801.0],
            one_channel(),
        );
        let steps = drive_pass(&mut scheduler, &mut bench);

        // 800 tunes exactly once; only 801 is revisited.
        let tunes_800 = steps
            .iter()
            .filter(|s| matches!(s, Step::Tuned { target_nm, .. } if *target_nm == 800.0))
            .count();
        assert_eq!(tunes_800, 1);
    }

    #[test]
    fn elapsed_clock_sums_hardware_integration() {
        let mut bench = SimBench::new();
        let mut scheduler = ExposureScheduler::new(
            settings(1),
            PeriodicChecks::default(),
            tuner(),
            vec![800.0],
            one_channel(),
        );
        let steps = drive_pass(&mut scheduler, &mut bench);
        let sample = steps
            .iter()
            .find_map(|s| match s {
                Step::Sample(sample) => Some(sample),
                _ => None,
            })
            .unwrap();
        // 3 ticks of 1 ms.
        assert!((sample.elapsed_s - 0.003).abs() < 1e-9);
    }

    #[test]
    fn autosave_boundary_is_edge_triggered() {
        let mut edge = IntervalEdge::new(Duration::from_secs(10));
        assert!(!edge.crossed(4.0));
        assert!(!edge.crossed(9.0));
        assert!(edge.crossed(11.0)); // wrapped past 10
        assert!(!edge.crossed(12.0)); // no re-fire within the same period
        assert!(!edge.crossed(19.0));
        assert!(edge.crossed(21.0));
    }

    #[test]
    fn autosave_pending_until_taken() {
        let mut bench = SimBench::new();
        let checks = PeriodicChecks {
            autosave: Some(Duration::from_millis(4)),
            ..PeriodicChecks::default()
        };
        let mut scheduler = ExposureScheduler::new(
            settings(3),
            checks,
            tuner(),
            vec![800.0],
            one_channel(),
        );
        // Each exposure adds 3 ms; the 4 ms boundary is crossed during
        // the second exposure.
        scheduler.step(&mut bench).unwrap(); // tune
        scheduler.step(&mut bench).unwrap(); // exposure 1, elapsed 3 ms
        assert!(!scheduler.autosave_due());
        scheduler.step(&mut bench).unwrap(); // exposure 2, elapsed 6 ms
        assert!(scheduler.autosave_due());
        scheduler.autosave_taken();
        assert!(!scheduler.autosave_due());
    }

    #[test]
    fn progress_reports_position_and_counts() {
        let mut bench = SimBench::new();
        let mut scheduler = ExposureScheduler::new(
            settings(2),
            PeriodicChecks::default(),
            tuner(),
            vec![800.0, 801.0],
            SimBench::channel_set(),
        );
        let mut progress = SweepProgress::default();
        scheduler.report(&mut progress);
        assert_eq!(progress.samples_total, 8);
        assert_eq!(progress.samples_done, 0);

        scheduler.step(&mut bench).unwrap(); // tune 800
        scheduler.step(&mut bench).unwrap(); // first exposure
        scheduler.report(&mut progress);
        assert_eq!(progress.samples_done, 1);
        assert_eq!(progress.current_wavelength_nm, Some(800.0));
        assert_eq!(progress.current_repetition, 1);
    }

    /// Sim bench whose switch drops the first few select commands.
    struct FlakySwitch {
        inner: SimBench,
        failures_left: u32,
    }

    impl Bench for FlakySwitch {
        fn tune(&mut self, target_nm: f64) -> Result<(), RamanError> {
            self.inner.tune(target_nm)
        }

        fn read_wavelength(&mut self) -> Result<WavelengthReading, RamanError> {
            self.inner.read_wavelength()
        }

        fn stop_tuning(&mut self) -> Result<(), RamanError> {
            self.inner.stop_tuning()
        }

        fn realign(&mut self) -> Result<AlignmentOutcome, RamanError> {
            self.inner.realign()
        }

        fn set_channel(&mut self, entry: &ChannelEntry) -> Result<(), RamanError> {
            if self.failures_left > 0 {
                self.failures_left -= 1;
                return Err(RamanError::Timeout);
            }
            self.inner.set_channel(entry)
        }

        fn read_count(&mut self, integration: Duration) -> Result<f64, RamanError> {
            self.inner.read_count(integration)
        }

        fn read_power(&mut self) -> Result<f64, RamanError> {
            self.inner.read_power()
        }
    }

    #[test]
    fn flaky_channel_select_is_retried() {
        // Two dropped selects stay within max_read_retries = 3.
        let mut bench = FlakySwitch {
            inner: SimBench::new(),
            failures_left: 2,
        };
        let mut scheduler = ExposureScheduler::new(
            settings(1),
            PeriodicChecks::default(),
            tuner(),
            vec![800.0],
            one_channel(),
        );
        let steps = drive_pass(&mut scheduler, &mut bench);
        let samples = steps
            .iter()
            .filter(|s| matches!(s, Step::Sample(_)))
            .count();
        assert_eq!(samples, 1);
        assert!(matches!(
            steps.last(),
            Some(Step::PassComplete { unreached }) if unreached.is_empty()
        ));
    }

    #[test]
    fn drift_recheck_retunes_without_losing_repetitions() {
        let mut bench = SimBench::new();
        let checks = PeriodicChecks {
            drift: Some(Duration::from_millis(4)),
            ..PeriodicChecks::default()
        };
        let mut scheduler = ExposureScheduler::new(
            settings(3),
            checks,
            tuner(),
            vec![800.0],
            one_channel(),
        );
        scheduler.step(&mut bench).unwrap(); // tune
        scheduler.step(&mut bench).unwrap(); // repetition 0, elapsed 3 ms
        assert_eq!(bench.tune_calls, vec![800.0]);

        bench.drift(0.3);
        // Repetition 1 crosses the 4 ms drift boundary; the recheck sees
        // the wander and re-tunes.
        let step = scheduler.step(&mut bench).unwrap();
        assert!(matches!(step, Step::Sample(_)));
        assert_eq!(bench.tune_calls, vec![800.0, 800.0]);
        let reading = bench.read_wavelength().unwrap();
        assert!((reading.wavelength_nm - 800.002).abs() < 1e-9);

        // Already-collected repetitions survive; only the last one is
        // still owed and the pass completes.
        let steps = drive_pass(&mut scheduler, &mut bench);
        let repetitions: Vec<usize> = steps
            .iter()
            .filter_map(|s| match s {
                Step::Sample(sample) => Some(sample.repetition),
                _ => None,
            })
            .collect();
        assert_eq!(repetitions, vec![2]);
        assert!(matches!(
            steps.last(),
            Some(Step::PassComplete { unreached }) if unreached.is_empty()
        ));
    }

    #[test]
    fn read_retry_gives_up_after_the_budget() {
        let mut failures = 5;
        let result: Result<f64, RamanError> = with_retry(3, || {
            if failures > 0 {
                failures -= 1;
                Err(RamanError::Timeout)
            } else {
                Ok(1.0)
            }
        });
        assert!(result.is_err());

        let mut failures = 2;
        let result = with_retry(3, || {
            if failures > 0 {
                failures -= 1;
                Err(RamanError::Timeout)
            } else {
                Ok(1.0)
            }
        });
        assert_eq!(result.unwrap(), 1.0);
    }
}
