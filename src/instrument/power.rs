//! SCPI power meter used to record excitation power next to each SPAD
//! exposure.

use log::{debug, info};

use crate::error::RamanError;
use crate::instrument::serial::SerialLink;

pub struct PowerMeter<L: SerialLink> {
    link: L,
}

impl<L: SerialLink> PowerMeter<L> {
    /// Enable auto-ranging and average-free readings.
    pub fn new(mut link: L) -> Result<Self, RamanError> {
        link.command("SENS:POW:RANG:AUTO 1")?;
        link.command("INP:FILT:STAT 0")?;
        info!("power meter: auto range on, input filter off");
        Ok(PowerMeter { link })
    }

    /// Set the wavelength correction used by the sensor.
    pub fn set_wavelength(&mut self, wavelength_nm: f64) -> Result<(), RamanError> {
        debug!("power meter: correction wavelength {wavelength_nm} nm");
        self.link
            .command(&format!("SENS:CORR:WAV {wavelength_nm:.3}"))
    }

    /// One power reading in watts.
    pub fn read_power(&mut self) -> Result<f64, RamanError> {
        let reply = self.link.query("MEAS:POW?")?;
        reply
            .trim()
            .parse::<f64>()
            .map_err(|_| RamanError::Protocol(format!("unreadable power reply: {reply:?}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::serial::mock::ScriptedLink;

    #[test]
    fn startup_configures_range_and_filter() {
        let meter = PowerMeter::new(ScriptedLink::new([])).unwrap();
        assert_eq!(
            meter.link.sent,
            vec!["SENS:POW:RANG:AUTO 1", "INP:FILT:STAT 0"]
        );
    }

    #[test]
    fn power_reading_parses_scientific_notation() {
        let mut meter = PowerMeter::new(ScriptedLink::new(["2.41e-07"])).unwrap();
        assert!((meter.read_power().unwrap() - 2.41e-7).abs() < 1e-12);
    }

    #[test]
    fn wavelength_is_formatted_in_nanometers() {
        let mut meter = PowerMeter::new(ScriptedLink::new([])).unwrap();
        meter.set_wavelength(800.5).unwrap();
        assert_eq!(
            meter.link.sent.last().map(String::as_str),
            Some("SENS:CORR:WAV 800.500")
        );
    }
}
