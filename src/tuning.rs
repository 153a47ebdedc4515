//! Bounded-retry wavelength tuning.
//!
//! One [`TuningController::achieve_wavelength`] call drives the laser
//! towards a target and watches the wavemeter until the subsystem either
//! maintains the target, reports an acceptable idle reading, or runs out
//! of retries. Failure to converge is a normal outcome, not an error,
//! and transient transport faults count against the same retry bound as
//! wavemeter dropouts; only non-retryable faults surface as `Err`.

use log::{debug, info, warn};
use std::thread;
use std::time::Duration;

use crate::config::SweepConfig;
use crate::error::RamanError;
use crate::instrument::Bench;
use crate::types::{TuneOutcome, TuningStatus};

/// Retry and tolerance bounds for one tune attempt.
#[derive(Debug, Clone)]
pub struct TuningLimits {
    /// Status polls reporting `Tuning` tolerated before giving up.
    pub max_tuning_polls: u32,
    /// Wavemeter dropouts and off-target idles tolerated before giving up.
    pub max_errors: u32,
    /// An idle reading within this distance of the target counts as done.
    pub idle_tolerance_nm: f64,
    /// Wait between the tune command or a busy poll and the next poll.
    pub settle: Duration,
}

impl TuningLimits {
    pub fn from_config(sweep: &SweepConfig) -> Self {
        TuningLimits {
            max_tuning_polls: sweep.max_tuning_retries,
            max_errors: sweep.max_error_retries,
            idle_tolerance_nm: sweep.idle_tolerance_nm,
            settle: sweep.settle_wait(),
        }
    }
}

pub struct TuningController {
    limits: TuningLimits,
}

impl TuningController {
    pub fn new(limits: TuningLimits) -> Self {
        TuningController { limits }
    }

    /// Tune to `target_nm` and poll until a terminal state.
    ///
    /// Retry counters must exceed their bounds before the attempt is
    /// declared failed, and a wavemeter dropout re-issues the tune
    /// command. A transient transport fault on the tune command or the
    /// wavemeter read is handled like a dropout, so only bound
    /// exhaustion surfaces as `converged == false`. An idle subsystem
    /// already within the idle tolerance is accepted without further
    /// tuning. The tuning operation is stopped on every terminal path
    /// so the laser holds its wavelength.
    pub fn achieve_wavelength(
        &self,
        bench: &mut dyn Bench,
        target_nm: f64,
    ) -> Result<TuneOutcome, RamanError> {
        let mut error_count: u32 = 0;
        let mut tuning_count: u32 = 0;
        let mut commanded = false;
        let mut measured_nm = 0.0;

        loop {
            if error_count > self.limits.max_errors {
                warn!("tuning to {target_nm} nm failed: too many errors");
                halt(bench);
                return Ok(TuneOutcome {
                    converged: false,
                    measured_nm,
                });
            }
            if tuning_count > self.limits.max_tuning_polls {
                warn!("tuning to {target_nm} nm failed: still busy after {tuning_count} polls");
                halt(bench);
                return Ok(TuneOutcome {
                    converged: false,
                    measured_nm,
                });
            }

            if !commanded {
                debug!("tune command: {target_nm} nm");
                match bench.tune(target_nm) {
                    Ok(()) => {
                        commanded = true;
                        thread::sleep(self.limits.settle);
                    }
                    Err(e) if e.is_transient() => {
                        warn!("tune command to {target_nm} nm failed: {e}");
                        error_count += 1;
                        continue;
                    }
                    Err(e) => return Err(e),
                }
            }

            let reading = match bench.read_wavelength() {
                Ok(reading) => reading,
                Err(e) if e.is_transient() => {
                    warn!("wavemeter read failed while tuning to {target_nm} nm: {e}");
                    halt(bench);
                    error_count += 1;
                    commanded = false;
                    continue;
                }
                Err(e) => return Err(e),
            };
            measured_nm = reading.wavelength_nm;

            match reading.status {
                TuningStatus::Maintaining => {
                    info!("tuned: maintaining {measured_nm} nm (target {target_nm})");
                    halt(bench);
                    return Ok(TuneOutcome {
                        converged: true,
                        measured_nm,
                    });
                }
                TuningStatus::Idle => {
                    if (measured_nm - target_nm).abs() <= self.limits.idle_tolerance_nm {
                        info!("tuned: idle at {measured_nm} nm, close enough to {target_nm}");
                        halt(bench);
                        return Ok(TuneOutcome {
                            converged: true,
                            measured_nm,
                        });
                    }
                    warn!("subsystem idle at {measured_nm} nm, off target {target_nm}");
                    error_count += 1;
                }
                TuningStatus::NoWavemeter => {
                    warn!("wavemeter unavailable while tuning to {target_nm} nm");
                    halt(bench);
                    error_count += 1;
                    commanded = false;
                }
                TuningStatus::Tuning => {
                    tuning_count += 1;
                    debug!("still tuning towards {target_nm} nm (poll {tuning_count})");
                    thread::sleep(self.limits.settle);
                }
            }
        }
    }

    /// Repeat whole tune attempts until one converges within
    /// `tolerance_nm`, up to `max_calls` attempts.
    pub fn converge(
        &self,
        bench: &mut dyn Bench,
        target_nm: f64,
        tolerance_nm: f64,
        max_calls: u32,
    ) -> Result<TuneOutcome, RamanError> {
        let mut last = TuneOutcome {
            converged: false,
            measured_nm: 0.0,
        };
        for call in 1..=max_calls.max(1) {
            last = self.achieve_wavelength(bench, target_nm)?;
            if last.converged && (last.measured_nm - target_nm).abs() <= tolerance_nm {
                return Ok(last);
            }
            debug!(
                "tune call {call}/{max_calls} to {target_nm} nm missed ({} nm)",
                last.measured_nm
            );
        }
        Ok(TuneOutcome {
            converged: false,
            measured_nm: last.measured_nm,
        })
    }
}

/// Stop the tuning operation, keeping the terminal path alive if the
/// stop itself fails on the wire.
fn halt(bench: &mut dyn Bench) {
    if let Err(e) = bench.stop_tuning() {
        warn!("stop tuning failed: {e}");
    }
}
