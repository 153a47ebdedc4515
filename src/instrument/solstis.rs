//! Client for the SolsTiS tunable laser through its ICE BLOC controller.
//!
//! ICE BLOC speaks single-line JSON messages over TCP. Every exchange is
//! one request/reply pair matched by transmission id:
//!
//! ```json
//! {"message":{"transmission_id":[1],"op":"set_wave_m",
//!             "parameters":{"wavelength":[800.0]}}}
//! ```
//!
//! Operations used here: `start_link`, `set_wave_m`, `poll_wave_m`,
//! `stop_wave_m` and the `beam_alignment` one-shot. Stopping a tune
//! leaves the resonator holding the last wavelength, so no separate
//! lock command is needed between tunes.

use log::{debug, info, warn};
use serde_json::{json, Value};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

use crate::error::RamanError;
use crate::types::{AlignmentOutcome, TuningStatus, WavelengthReading};

/// Timeout settings for the laser TCP link.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(5),
        }
    }
}

/// Builder for [`SolstisClient`] connections.
#[derive(Default)]
pub struct SolstisClientBuilder {
    host: Option<String>,
    port: Option<u16>,
    client_ip: Option<String>,
    config: ConnectionConfig,
}

impl SolstisClientBuilder {
    pub fn host(mut self, host: &str) -> Self {
        self.host = Some(host.to_string());
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Client IP registered with ICE BLOC on `start_link`.
    pub fn client_ip(mut self, ip: &str) -> Self {
        self.client_ip = Some(ip.to_string());
        self
    }

    pub fn config(mut self, config: ConnectionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.config.read_timeout = timeout;
        self
    }

    pub fn build(self) -> Result<SolstisClient, RamanError> {
        let host = self.host.unwrap_or_else(|| "localhost".to_string());
        let port = self.port.unwrap_or(9001);
        let client_ip = self.client_ip.unwrap_or_else(|| "192.168.1.100".to_string());
        SolstisClient::connect(&host, port, &client_ip, self.config)
    }
}

/// TCP client for one SolsTiS laser.
pub struct SolstisClient {
    stream: TcpStream,
    next_id: u32,
}

impl SolstisClient {
    pub fn builder() -> SolstisClientBuilder {
        SolstisClientBuilder::default()
    }

    fn connect(
        host: &str,
        port: u16,
        client_ip: &str,
        config: ConnectionConfig,
    ) -> Result<Self, RamanError> {
        let addr: SocketAddr = format!("{host}:{port}")
            .parse()
            .or_else(|_| {
                // Resolve hostnames through ToSocketAddrs.
                use std::net::ToSocketAddrs;
                (host, port)
                    .to_socket_addrs()
                    .map_err(|e| RamanError::io(e, format!("resolving {host}:{port}")))?
                    .next()
                    .ok_or_else(|| {
                        RamanError::Protocol(format!("no address found for {host}:{port}"))
                    })
            })?;

        let stream = TcpStream::connect_timeout(&addr, config.connect_timeout)
            .map_err(|e| RamanError::io(e, format!("connecting to ICE BLOC at {addr}")))?;
        stream
            .set_read_timeout(Some(config.read_timeout))
            .map_err(|e| RamanError::io(e, "setting read timeout"))?;
        stream
            .set_write_timeout(Some(config.write_timeout))
            .map_err(|e| RamanError::io(e, "setting write timeout"))?;

        let mut client = SolstisClient { stream, next_id: 1 };
        client.start_link(client_ip)?;
        info!("SolsTiS: link started to {addr} as {client_ip}");
        Ok(client)
    }

    fn start_link(&mut self, client_ip: &str) -> Result<(), RamanError> {
        let params = self.transact("start_link", json!({ "ip_address": client_ip }))?;
        match params.get("status").and_then(Value::as_str) {
            Some("ok") => Ok(()),
            other => Err(RamanError::Protocol(format!(
                "start_link refused: {other:?}"
            ))),
        }
    }

    /// Start tuning towards `target_nm`.
    pub fn set_wavelength(&mut self, target_nm: f64) -> Result<(), RamanError> {
        let params = self.transact("set_wave_m", json!({ "wavelength": [target_nm] }))?;
        match status_code(&params) {
            Some(0) => {
                debug!("SolsTiS: started tuning to {target_nm}");
                Ok(())
            }
            other => Err(RamanError::Protocol(format!(
                "set_wave_m not accepted, status {other:?}"
            ))),
        }
    }

    /// Poll the wavemeter. A missing or unusable reading maps to
    /// [`TuningStatus::NoWavemeter`] with a zero wavelength rather than
    /// an error, matching the controller's own semantics.
    pub fn poll_wavelength(&mut self) -> Result<WavelengthReading, RamanError> {
        let params = self.transact("poll_wave_m", json!({}))?;
        let reading = parse_poll_reply(&params);
        debug!(
            "SolsTiS: wavemeter {} nm, status {:?}",
            reading.wavelength_nm, reading.status
        );
        Ok(reading)
    }

    /// Stop the tuning operation in progress. The laser holds the current
    /// wavelength afterwards.
    pub fn stop(&mut self) -> Result<(), RamanError> {
        let params = self.transact("stop_wave_m", json!({}))?;
        match status_code(&params) {
            Some(0) => Ok(()),
            other => Err(RamanError::Protocol(format!(
                "stop_wave_m failed, status {other:?}"
            ))),
        }
    }

    /// One-shot cavity beam alignment.
    pub fn one_shot(&mut self) -> Result<AlignmentOutcome, RamanError> {
        let params = self.transact("beam_alignment", json!({ "mode": [4] }))?;
        let outcome = match status_code(&params) {
            Some(0) => AlignmentOutcome::Aligned,
            Some(1) => AlignmentOutcome::Failed,
            _ => AlignmentOutcome::Inactive,
        };
        if outcome == AlignmentOutcome::Failed {
            warn!("SolsTiS: one-shot beam alignment failed");
        }
        Ok(outcome)
    }

    /// Send one command and read its reply, matching transmission ids.
    fn transact(&mut self, op: &str, parameters: Value) -> Result<Value, RamanError> {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1).max(1);

        let request = build_message(id, op, parameters);
        let bytes = serde_json::to_vec(&request)?;
        self.stream
            .write_all(&bytes)
            .map_err(|e| RamanError::io(e, format!("sending {op}")))?;

        let reply = self.read_reply(op)?;
        let message = reply
            .get("message")
            .ok_or_else(|| RamanError::Protocol(format!("{op}: reply without message")))?;

        let reply_id = message
            .get("transmission_id")
            .and_then(|v| v.get(0))
            .and_then(Value::as_u64);
        if reply_id != Some(u64::from(id)) {
            return Err(RamanError::ReplyMismatch {
                expected: id.to_string(),
                actual: format!("{reply_id:?}"),
            });
        }

        Ok(message.get("parameters").cloned().unwrap_or(Value::Null))
    }

    /// Accumulate bytes until a complete JSON object parses.
    fn read_reply(&mut self, op: &str) -> Result<Value, RamanError> {
        let mut buffer = Vec::with_capacity(1024);
        let mut chunk = [0u8; 1024];
        loop {
            let n = match self.stream.read(&mut chunk) {
                Ok(0) => {
                    return Err(RamanError::Protocol(format!(
                        "{op}: connection closed by controller"
                    )))
                }
                Ok(n) => n,
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    return Err(RamanError::Timeout)
                }
                Err(e) => return Err(RamanError::io(e, format!("reading {op} reply"))),
            };
            buffer.extend_from_slice(&chunk[..n]);
            match serde_json::from_slice::<Value>(&buffer) {
                Ok(value) => return Ok(value),
                Err(e) if e.is_eof() => continue,
                Err(e) => return Err(RamanError::Json(e)),
            }
        }
    }
}

fn build_message(id: u32, op: &str, parameters: Value) -> Value {
    // start_link/poll/stop take an empty parameter object; ICE BLOC
    // tolerates its presence either way.
    json!({
        "message": {
            "transmission_id": [id],
            "op": op,
            "parameters": parameters,
        }
    })
}

/// ICE BLOC encodes status both as `[n]` and as bare `n` depending on the
/// operation.
fn status_code(parameters: &Value) -> Option<i64> {
    match parameters.get("status") {
        Some(Value::Array(items)) => items.first().and_then(Value::as_i64),
        Some(value) => value.as_i64(),
        None => None,
    }
}

/// Interpret a `poll_wave_m` reply. Codes 0/2/3 carry a wavelength;
/// anything else means the wavemeter is not available.
fn parse_poll_reply(parameters: &Value) -> WavelengthReading {
    let status = status_code(parameters).and_then(|code| TuningStatus::from_code(code).ok());
    let wavelength = parameters
        .get("current_wavelength")
        .and_then(|v| v.get(0))
        .and_then(Value::as_f64);

    match (status, wavelength) {
        (Some(status), Some(wavelength_nm))
            if matches!(
                status,
                TuningStatus::Idle | TuningStatus::Tuning | TuningStatus::Maintaining
            ) =>
        {
            WavelengthReading {
                wavelength_nm,
                status,
            }
        }
        _ => WavelengthReading {
            wavelength_nm: 0.0,
            status: TuningStatus::NoWavemeter,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_carries_transmission_id_and_op() {
        let msg = build_message(91, "set_wave_m", json!({ "wavelength": [800.0] }));
        assert_eq!(msg["message"]["transmission_id"][0], 91);
        assert_eq!(msg["message"]["op"], "set_wave_m");
        assert_eq!(msg["message"]["parameters"]["wavelength"][0], 800.0);
    }

    #[test]
    fn status_code_accepts_array_and_scalar() {
        assert_eq!(status_code(&json!({ "status": [2] })), Some(2));
        assert_eq!(status_code(&json!({ "status": 1 })), Some(1));
        assert_eq!(status_code(&json!({})), None);
    }

    #[test]
    fn poll_reply_with_maintaining_status() {
        let reading = parse_poll_reply(&json!({
            "status": [3],
            "current_wavelength": [799.995]
        }));
        assert_eq!(reading.status, TuningStatus::Maintaining);
        assert!((reading.wavelength_nm - 799.995).abs() < 1e-9);
    }

    #[test]
    fn poll_reply_without_wavelength_is_no_wavemeter() {
        let reading = parse_poll_reply(&json!({ "status": [1] }));
        assert_eq!(reading.status, TuningStatus::NoWavemeter);
        assert_eq!(reading.wavelength_nm, 0.0);
    }

    #[test]
    fn poll_reply_with_garbage_is_no_wavemeter() {
        let reading = parse_poll_reply(&json!({ "banana": true }));
        assert_eq!(reading.status, TuningStatus::NoWavemeter);
    }
}
