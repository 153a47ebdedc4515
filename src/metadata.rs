use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{DetectorId, SwitchChannel};

/// Metadata describing one measurement pass. Created at `begin`,
/// finalized (end timestamp, derived fields) when the pass completes,
/// then cloned with a bumped sequence number for the next pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub experiment_name: String,
    pub medium: String,
    pub notes: String,
    pub laser: String,
    /// Detector identity; filled per channel at finalize.
    pub spad_name: Option<String>,
    pub switch_channel: Option<u8>,
    pub filter_wavelength_nm: f64,
    pub spad_integration_time_ms: u64,
    pub spad_bias_v: f64,
    pub spad_threshold_v: f64,
    /// Exposure time per repetition [s].
    pub integration_s: u64,
    /// Number of exposures at each wavelength.
    pub repetitions: usize,
    /// Index number if part of a time series.
    pub seq_num: u32,
    pub excitation_wavelengths: Vec<f64>,
    pub excitation_ramanshifts: Vec<f64>,
    pub starttime: Option<DateTime<Utc>>,
    pub endtime: Option<DateTime<Utc>>,
}

impl Default for RunMetadata {
    fn default() -> Self {
        RunMetadata {
            experiment_name: "untitled".to_string(),
            medium: String::new(),
            notes: String::new(),
            laser: "SolsTiS".to_string(),
            spad_name: None,
            switch_channel: None,
            filter_wavelength_nm: 884.0,
            spad_integration_time_ms: 1000,
            spad_bias_v: 200.0,
            spad_threshold_v: 0.1,
            integration_s: 1,
            repetitions: 1,
            seq_num: 0,
            excitation_wavelengths: Vec::new(),
            excitation_ramanshifts: Vec::new(),
            starttime: None,
            endtime: None,
        }
    }
}

/// Shift of an excitation line relative to the filter edge [cm^-1].
pub fn raman_shift(wavelength_nm: f64, filter_wavelength_nm: f64) -> f64 {
    (1.0 / wavelength_nm - 1.0 / filter_wavelength_nm) * 1.0e7
}

impl RunMetadata {
    /// Stamp the start of a pass and derive shift units for the targets.
    pub fn begin(&mut self, targets: &[f64]) {
        self.starttime = Some(Utc::now());
        self.endtime = None;
        self.set_wavelengths(targets);
    }

    pub fn set_wavelengths(&mut self, wavelengths: &[f64]) {
        self.excitation_wavelengths = wavelengths.to_vec();
        self.excitation_ramanshifts = wavelengths
            .iter()
            .map(|wl| raman_shift(*wl, self.filter_wavelength_nm))
            .collect();
    }

    /// Stamp the end of a pass, restricted to the wavelengths that made
    /// it into the finalized tables.
    pub fn finalize_pass(&mut self, present_wavelengths: &[f64]) {
        self.endtime = Some(Utc::now());
        self.set_wavelengths(present_wavelengths);
    }

    /// Per-channel copy carrying the detector identity.
    pub fn for_detector(&self, detector: &DetectorId, channel: SwitchChannel) -> Self {
        let mut meta = self.clone();
        meta.spad_name = Some(detector.0.clone());
        meta.switch_channel = Some(channel.0);
        meta
    }

    /// Clone for the next pass of a repeated run: sequence number bumped,
    /// timestamps cleared.
    pub fn next_repetition(&self) -> Self {
        let mut meta = self.clone();
        meta.seq_num += 1;
        meta.starttime = None;
        meta.endtime = None;
        meta
    }

    /// Dataset name for this pass, suffixed with the sequence number.
    pub fn dataset_name(&self) -> String {
        format!("{}_{}", self.experiment_name, self.seq_num)
    }
}
