use serde::{Deserialize, Serialize};

use crate::error::RamanError;

/// Identifier of a photon-counting detector (its bus address, e.g. a VISA
/// or serial resource string).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DetectorId(pub String);

impl DetectorId {
    pub fn new(address: impl Into<String>) -> Self {
        DetectorId(address.into())
    }
}

impl std::fmt::Display for DetectorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Channel index on the optical switch routing light to a detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwitchChannel(pub u8);

impl std::fmt::Display for SwitchChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One detector routed through one switch channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelEntry {
    pub detector: DetectorId,
    pub switch_channel: SwitchChannel,
}

/// Ordered set of connected detector channels, built once at session
/// start. Iteration order is insertion order and defines visit order
/// within a wavelength.
#[derive(Debug, Clone, Default)]
pub struct ChannelSet {
    entries: Vec<ChannelEntry>,
}

impl ChannelSet {
    pub fn new(entries: Vec<ChannelEntry>) -> Self {
        ChannelSet { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&ChannelEntry> {
        self.entries.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChannelEntry> {
        self.entries.iter()
    }

    pub fn detectors(&self) -> Vec<DetectorId> {
        self.entries.iter().map(|e| e.detector.clone()).collect()
    }
}

/// Tuning status reported by the laser subsystem.
///
/// The wire status codes overload meaning (idle can be "inactive" or
/// "acceptable but not locked"); tolerance acceptance is decided by the
/// caller, never folded into this enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TuningStatus {
    /// No active tuning process; the wavelength may still be near target.
    Idle,
    /// Wavemeter unavailable; the reading is unusable.
    NoWavemeter,
    /// Tuning in progress.
    Tuning,
    /// Subsystem actively holds the target wavelength.
    Maintaining,
}

impl TuningStatus {
    /// Map a SolsTiS/ICE BLOC status code (0..=3) to a status.
    pub fn from_code(code: i64) -> Result<Self, RamanError> {
        match code {
            0 => Ok(TuningStatus::Idle),
            1 => Ok(TuningStatus::NoWavemeter),
            2 => Ok(TuningStatus::Tuning),
            3 => Ok(TuningStatus::Maintaining),
            other => Err(RamanError::Protocol(format!(
                "unknown tuning status code {other}"
            ))),
        }
    }
}

/// One wavemeter poll: measured wavelength plus the subsystem's status.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WavelengthReading {
    pub wavelength_nm: f64,
    pub status: TuningStatus,
}

/// Result of a whole tune-and-converge attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TuneOutcome {
    pub converged: bool,
    pub measured_nm: f64,
}

/// Result of a one-shot beam realignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlignmentOutcome {
    Aligned,
    Failed,
    /// Alignment subsystem reported itself inactive.
    Inactive,
}

/// One exposure at one (detector, wavelength, repetition): the sub-sample
/// sequences collected over the integration window. Consumed immediately
/// by the accumulator.
#[derive(Debug, Clone, PartialEq)]
pub struct ExposureSample {
    pub detector: DetectorId,
    /// Nominal target wavelength; keys the accumulation buffer.
    pub wavelength_nm: f64,
    /// Wavemeter reading at tune time.
    pub measured_nm: f64,
    /// Zero-based repetition index.
    pub repetition: usize,
    /// Detector counts, one per hardware integration tick.
    pub counts: Vec<f64>,
    /// Power-reference readings, one per tick.
    pub powers: Vec<f64>,
    /// Total exposed measurement time after this sample, seconds.
    pub elapsed_s: f64,
}

/// Discriminated result of one scheduler step.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// Laser converged on a target; exposures follow on subsequent steps.
    Tuned { target_nm: f64, measured_nm: f64 },
    /// Tuning did not converge; the wavelength is queued for a retry
    /// sub-pass and skipped for now.
    TuningFailed { target_nm: f64 },
    /// One exposure completed.
    Sample(ExposureSample),
    /// The pass is over. `unreached` lists wavelengths that never tuned
    /// even after retry sub-passes.
    PassComplete { unreached: Vec<f64> },
}

/// Session run state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    Idle,
    Running,
    Paused,
    Finalizing,
}

/// Control-surface commands, each handled at the next tick boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionCommand {
    Begin(crate::session::RunParams),
    Pause,
    Resume,
    Stop,
    SetTargets(Vec<f64>),
    SetChannels(Vec<ChannelEntry>),
}

/// Read-only snapshot of session progress, safe to poll at any time.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepProgress {
    pub state: Option<RunState>,
    pub pass_seq: u32,
    pub current_wavelength_nm: Option<f64>,
    pub current_repetition: usize,
    pub samples_done: usize,
    pub samples_total: usize,
    pub elapsed_exposure_s: f64,
    pub failed_wavelengths: Vec<f64>,
    pub connected_detectors: Vec<DetectorId>,
}

/// Expand a start/stop/step range into explicit target wavelengths,
/// inclusive of the stop endpoint.
pub fn expand_range(start_nm: f64, stop_nm: f64, step_nm: f64) -> Vec<f64> {
    if step_nm <= 0.0 || stop_nm < start_nm {
        return Vec::new();
    }
    let mut targets = Vec::new();
    let mut i = 0u32;
    loop {
        let wl = start_nm + f64::from(i) * step_nm;
        // Half-step slack so the endpoint survives float rounding.
        if wl > stop_nm + step_nm * 0.5 {
            break;
        }
        targets.push(wl);
        i += 1;
    }
    targets
}
