//! Line-oriented serial transport shared by the SPAD, the fiber switch
//! and the power meter.

use log::trace;
use std::io::{Read, Write};
use std::time::Duration;

use crate::error::RamanError;

/// A request/reply serial line. Commands are sent with a trailing `\r`;
/// replies are read up to the first line terminator.
pub trait SerialLink: Send {
    /// Send a command that expects no reply.
    fn command(&mut self, cmd: &str) -> Result<(), RamanError>;

    /// Send a command and return the reply line, trimmed.
    fn query(&mut self, cmd: &str) -> Result<String, RamanError>;
}

/// [`SerialLink`] over a real UART port.
pub struct UartLink {
    port: Box<dyn serialport::SerialPort>,
    name: String,
}

impl UartLink {
    pub fn open(path: &str, baud_rate: u32, timeout: Duration) -> Result<Self, RamanError> {
        let port = serialport::new(path, baud_rate).timeout(timeout).open()?;
        Ok(UartLink {
            port,
            name: path.to_string(),
        })
    }

    fn write_line(&mut self, cmd: &str) -> Result<(), RamanError> {
        trace!("{} <- {cmd}", self.name);
        self.port
            .write_all(format!("{cmd}\r").as_bytes())
            .map_err(|e| RamanError::io(e, format!("writing to {}", self.name)))?;
        self.port
            .flush()
            .map_err(|e| RamanError::io(e, format!("flushing {}", self.name)))
    }

    fn read_line(&mut self) -> Result<String, RamanError> {
        let mut line = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            match self.port.read(&mut byte) {
                Ok(0) => break,
                Ok(_) => {
                    if byte[0] == b'\n' || byte[0] == b'\r' {
                        if line.is_empty() {
                            continue; // leftover terminator from a previous reply
                        }
                        break;
                    }
                    line.push(byte[0]);
                }
                Err(e)
                    if e.kind() == std::io::ErrorKind::TimedOut
                        || e.kind() == std::io::ErrorKind::WouldBlock =>
                {
                    if line.is_empty() {
                        return Err(RamanError::Timeout);
                    }
                    break;
                }
                Err(e) => return Err(RamanError::io(e, format!("reading from {}", self.name))),
            }
        }
        let reply = String::from_utf8_lossy(&line).trim().to_string();
        trace!("{} -> {reply}", self.name);
        Ok(reply)
    }
}

impl SerialLink for UartLink {
    fn command(&mut self, cmd: &str) -> Result<(), RamanError> {
        self.write_line(cmd)
    }

    fn query(&mut self, cmd: &str) -> Result<String, RamanError> {
        self.write_line(cmd)?;
        self.read_line()
    }
}
