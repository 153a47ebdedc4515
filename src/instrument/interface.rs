use std::time::Duration;

use crate::error::RamanError;
use crate::types::{AlignmentOutcome, ChannelEntry, WavelengthReading};

/// Uniform facade over the measurement bench: the tunable laser, the
/// optical switch, the photon-counting detectors and the power reference.
///
/// The scheduler and the tuning controller are the only callers, and they
/// are never active at the same time, so implementations need no internal
/// locking. Every failure mode is an explicit status or error value the
/// caller inspects; implementations do not panic on hardware faults.
pub trait Bench: Send {
    /// Issue a tune command towards a target wavelength. Returns once the
    /// command is accepted; convergence is observed via
    /// [`Bench::read_wavelength`].
    fn tune(&mut self, target_nm: f64) -> Result<(), RamanError>;

    /// Poll the wavemeter: measured wavelength plus tuning status.
    fn read_wavelength(&mut self) -> Result<WavelengthReading, RamanError>;

    /// Stop any tuning operation in progress. The subsystem keeps the
    /// current wavelength without further commands.
    fn stop_tuning(&mut self) -> Result<(), RamanError>;

    /// Run the one-shot beam realignment routine.
    fn realign(&mut self) -> Result<AlignmentOutcome, RamanError>;

    /// Route light to a detector channel and make its detector the one
    /// subsequent count reads address.
    fn set_channel(&mut self, entry: &ChannelEntry) -> Result<(), RamanError>;

    /// Read one integration tick worth of counts from the active detector.
    fn read_count(&mut self, integration: Duration) -> Result<f64, RamanError>;

    /// Read the tap power reference [W].
    fn read_power(&mut self) -> Result<f64, RamanError>;
}
