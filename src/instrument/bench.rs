//! Hardware-backed [`Bench`] wiring the laser, optical switch, SPADs and
//! power meter together.

use log::{info, warn};
use std::collections::BTreeMap;
use std::thread;
use std::time::Duration;

use crate::config::AppConfig;
use crate::error::RamanError;
use crate::instrument::interface::Bench;
use crate::instrument::power::PowerMeter;
use crate::instrument::serial::UartLink;
use crate::instrument::solstis::{ConnectionConfig, SolstisClient};
use crate::instrument::spad::{Spad, SpadSettings};
use crate::instrument::switch::{OpticalSwitch, SWITCH_BAUD_RATE};
use crate::types::{
    AlignmentOutcome, ChannelEntry, ChannelSet, DetectorId, WavelengthReading,
};

const SPAD_BAUD_RATE: u32 = 115_200;
const SERIAL_TIMEOUT: Duration = Duration::from_secs(2);

pub struct HardwareBench {
    laser: SolstisClient,
    switch: OpticalSwitch<UartLink>,
    power_meter: Option<PowerMeter<UartLink>>,
    detectors: BTreeMap<DetectorId, Spad<UartLink>>,
    active: Option<DetectorId>,
    low_power_warning_w: f64,
}

impl HardwareBench {
    /// Connect every instrument. The laser and the switch are required;
    /// detectors that fail to open are dropped from the channel set, and
    /// a missing power meter degrades power readings to NaN.
    pub fn connect(config: &AppConfig) -> Result<(Self, ChannelSet), RamanError> {
        let laser = SolstisClient::builder()
            .host(&config.laser.host)
            .port(config.laser.port)
            .client_ip(&config.laser.client_ip)
            .config(ConnectionConfig {
                connect_timeout: Duration::from_secs(config.laser.connect_timeout_s),
                read_timeout: Duration::from_secs(config.laser.read_timeout_s),
                write_timeout: Duration::from_secs(config.laser.connect_timeout_s),
            })
            .build()?;

        let switch_link =
            UartLink::open(&config.detectors.switch_port, SWITCH_BAUD_RATE, SERIAL_TIMEOUT)?;
        let switch = OpticalSwitch::new(switch_link)?;

        let power_meter =
            match UartLink::open(&config.detectors.power_meter_port, SPAD_BAUD_RATE, SERIAL_TIMEOUT)
                .and_then(PowerMeter::new)
            {
                Ok(meter) => Some(meter),
                Err(e) => {
                    warn!("power meter unavailable, recording NaN powers: {e}");
                    None
                }
            };

        let settings = SpadSettings {
            bias_v: config.detectors.bias_v,
            threshold_v: config.detectors.threshold_v,
            temp_set_point_mdegc: config.detectors.temp_set_point_mdegc,
            integration_time: Duration::from_millis(config.detectors.integration_tick_ms),
        };

        let mut detectors = BTreeMap::new();
        let mut entries = Vec::new();
        for (address, &channel) in &config.detectors.channel_map {
            let id = DetectorId::new(address.clone());
            let result = UartLink::open(address, SPAD_BAUD_RATE, SERIAL_TIMEOUT)
                .map(Spad::new)
                .and_then(|mut spad| spad.arm(&settings).map(|()| spad));
            match result {
                Ok(spad) => {
                    info!("detector {id} on switch channel {channel}");
                    detectors.insert(id.clone(), spad);
                    entries.push(ChannelEntry {
                        detector: id,
                        switch_channel: crate::types::SwitchChannel(channel),
                    });
                }
                Err(e) => warn!("detector {id} dropped: {e}"),
            }
        }
        if entries.is_empty() {
            return Err(RamanError::NoUsableChannel);
        }

        let bench = HardwareBench {
            laser,
            switch,
            power_meter,
            detectors,
            active: None,
            low_power_warning_w: config.detectors.low_power_warning_w,
        };
        Ok((bench, ChannelSet::new(entries)))
    }

    /// Park the switch and stop the detectors. Called on shutdown.
    pub fn release(&mut self) {
        if let Err(e) = self.switch.park() {
            warn!("parking switch failed: {e}");
        }
        for (id, spad) in &mut self.detectors {
            if let Err(e) = spad.disarm() {
                warn!("disarming detector {id} failed: {e}");
            }
        }
    }
}

impl Drop for HardwareBench {
    fn drop(&mut self) {
        self.release();
    }
}

impl Bench for HardwareBench {
    fn tune(&mut self, target_nm: f64) -> Result<(), RamanError> {
        if let Some(meter) = &mut self.power_meter {
            meter.set_wavelength(target_nm)?;
        }
        self.laser.set_wavelength(target_nm)
    }

    fn read_wavelength(&mut self) -> Result<WavelengthReading, RamanError> {
        self.laser.poll_wavelength()
    }

    fn stop_tuning(&mut self) -> Result<(), RamanError> {
        self.laser.stop()
    }

    fn realign(&mut self) -> Result<AlignmentOutcome, RamanError> {
        self.laser.one_shot()
    }

    fn set_channel(&mut self, entry: &ChannelEntry) -> Result<(), RamanError> {
        self.switch.select(entry.switch_channel)?;
        self.active = Some(entry.detector.clone());
        Ok(())
    }

    fn read_count(&mut self, integration: Duration) -> Result<f64, RamanError> {
        let id = self
            .active
            .clone()
            .ok_or_else(|| RamanError::Protocol("no detector channel selected".to_string()))?;
        let spad = self
            .detectors
            .get_mut(&id)
            .ok_or_else(|| RamanError::Protocol(format!("unknown detector {id}")))?;
        // The counter accumulates over its hardware window; wait one
        // window out before sampling it.
        thread::sleep(integration);
        spad.read_count()
    }

    fn read_power(&mut self) -> Result<f64, RamanError> {
        match &mut self.power_meter {
            Some(meter) => {
                let watts = meter.read_power()?;
                if watts < self.low_power_warning_w {
                    warn!("tap power low: {watts:.3e} W");
                }
                Ok(watts)
            }
            None => Ok(f64::NAN),
        }
    }
}
