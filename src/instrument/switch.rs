//! Driver for the DiCon FiberOptics MEMS 1xN optical switch (RS232,
//! 115200 baud). Channel 0 parks the switch off every output.

use log::{debug, info, warn};

use crate::error::RamanError;
use crate::instrument::serial::SerialLink;
use crate::types::SwitchChannel;

pub const SWITCH_BAUD_RATE: u32 = 115_200;

pub struct OpticalSwitch<L: SerialLink> {
    link: L,
    channel_max: u8,
}

impl<L: SerialLink> OpticalSwitch<L> {
    /// Query the module configuration, then park the switch.
    pub fn new(mut link: L) -> Result<Self, RamanError> {
        let reply = link.query("CF?")?;
        let channel_max = parse_channel_count(&reply).unwrap_or_else(|| {
            warn!("switch: unreadable CF? reply {reply:?}, assuming 16 channels");
            16
        });
        info!("switch: {channel_max} channels");

        let mut switch = OpticalSwitch { link, channel_max };
        switch.park()?;
        Ok(switch)
    }

    pub fn channel_max(&self) -> u8 {
        self.channel_max
    }

    pub fn select(&mut self, channel: SwitchChannel) -> Result<(), RamanError> {
        if channel.0 > self.channel_max {
            return Err(RamanError::Protocol(format!(
                "switch channel {} out of range 0..={}",
                channel.0, self.channel_max
            )));
        }
        debug!("switch: selecting channel {}", channel.0);
        self.link.command(&format!("I1 {}", channel.0))
    }

    pub fn current_channel(&mut self) -> Result<SwitchChannel, RamanError> {
        let reply = self.link.query("I1?")?;
        parse_channel(&reply)
            .map(SwitchChannel)
            .ok_or_else(|| RamanError::Protocol(format!("unreadable channel reply: {reply:?}")))
    }

    /// Park off every output.
    pub fn park(&mut self) -> Result<(), RamanError> {
        self.link.command("PK")
    }
}

/// `CF?` replies `<type>,<channels>,...`.
fn parse_channel_count(reply: &str) -> Option<u8> {
    reply.split(',').nth(1)?.trim().parse().ok()
}

/// `I1?` replies the channel number, sometimes with trailing text.
fn parse_channel(reply: &str) -> Option<u8> {
    let digits: String = reply.chars().take_while(char::is_ascii_digit).collect();
    digits.parse().ok()
}
