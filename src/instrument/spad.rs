//! Driver for the IDQuantique ID120 single-photon avalanche diode.
//!
//! The ID120 speaks an SCPI-like protocol over RS232. Voltages are
//! exchanged in microvolts, temperatures in millidegrees Celsius and
//! integration times in milliseconds.

use log::{debug, info, warn};
use std::time::Duration;

use crate::error::RamanError;
use crate::instrument::serial::SerialLink;

/// Detector operating point applied on [`Spad::arm`].
#[derive(Debug, Clone, Copy)]
pub struct SpadSettings {
    pub bias_v: f64,
    pub threshold_v: f64,
    pub temp_set_point_mdegc: i64,
    pub integration_time: Duration,
}

pub struct Spad<L: SerialLink> {
    link: L,
    integration_time: Duration,
}

impl<L: SerialLink> Spad<L> {
    pub fn new(link: L) -> Self {
        Spad {
            link,
            integration_time: Duration::from_millis(1000),
        }
    }

    /// Apply the operating point and start the detector.
    pub fn arm(&mut self, settings: &SpadSettings) -> Result<(), RamanError> {
        let bias_uv = (settings.bias_v * 1e6).round() as i64;
        let threshold_uv = (settings.threshold_v * 1e6).round() as i64;
        let integration_ms = settings.integration_time.as_millis();

        self.link.command(&format!("BIAS:VOLTAGE {bias_uv}"))?;
        self.link
            .command(&format!("THRESHOLD:VOLTAGE {threshold_uv}"))?;
        self.link.command(&format!(
            "REG:TEMP_SET_POINT {}",
            settings.temp_set_point_mdegc
        ))?;
        self.link
            .command(&format!("COUNTERS:INTEGRATION_TIME {integration_ms}"))?;
        self.link.command("REG:RUN TRUE")?;
        self.integration_time = settings.integration_time;

        info!(
            "SPAD armed: bias {} V, threshold {} V, set point {} mdegC, integration {} ms",
            settings.bias_v, settings.threshold_v, settings.temp_set_point_mdegc, integration_ms
        );
        Ok(())
    }

    pub fn integration_time(&self) -> Duration {
        self.integration_time
    }

    /// Accumulated detections over the last integration window.
    pub fn read_count(&mut self) -> Result<f64, RamanError> {
        let reply = self.link.query("COUNTERS:DETECTION_COUNT?")?;
        let count = parse_number(&reply)
            .ok_or_else(|| RamanError::Protocol(format!("unreadable count reply: {reply:?}")))?;
        debug!("SPAD count: {count}");
        Ok(count)
    }

    /// Cooler temperature in millidegrees Celsius.
    pub fn read_temperature_mdegc(&mut self) -> Result<i64, RamanError> {
        let reply = self.link.query("REG:MEASURED_TEMP?")?;
        parse_number(&reply)
            .map(|t| t as i64)
            .ok_or_else(|| RamanError::Protocol(format!("unreadable temperature: {reply:?}")))
    }

    /// True when the bias supply reports a fault.
    pub fn bias_error(&mut self) -> Result<bool, RamanError> {
        let reply = self.link.query("BIAS:ERROR_STATUS?")?;
        let faulted = reply.eq_ignore_ascii_case("TRUE");
        if faulted {
            warn!("SPAD bias supply reports an error");
        }
        Ok(faulted)
    }

    /// Stop the detector. Leaves cooling running.
    pub fn disarm(&mut self) -> Result<(), RamanError> {
        self.link.command("REG:RUN FALSE")
    }
}

/// Replies sometimes echo the command name before the value.
fn parse_number(reply: &str) -> Option<f64> {
    reply
        .split_whitespace()
        .rev()
        .find_map(|token| token.parse::<f64>().ok())
}
