//! CAN@net gateway channel.
//!
//! One TCP connection to a CAN@net 200/420 device drives up to four CAN
//! buses. The wire is line-oriented ASCII: data frames travel as
//! `M <bus> <id:08X> <data hex>`, while the control plane replies with
//! `R OK`, `R ERR <code> <descr>`, `R <device-id>`, `R V<version>`,
//! `E <bus> <event>` and `R CAN <bus> <status5> <buffer>` lines. Control
//! lines are surfaced as messages with arbitration id 0 so the network
//! layer can fold them into the device status map without ever matching
//! them to commands.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::debug;

use crate::can::bus::Bus;
use crate::can::message::Message;
use crate::error::CanError;

struct LineReader {
    half: OwnedReadHalf,
    buf: Vec<u8>,
}

pub struct CanNetBus {
    host: String,
    port: u16,
    buses: Vec<u8>,
    uid_bits: u32,
    reader: Mutex<Option<LineReader>>,
    writer: Mutex<Option<OwnedWriteHalf>>,
}

impl CanNetBus {
    pub fn new(host: &str, port: u16, buses: Vec<u8>, uid_bits: u32) -> Self {
        Self {
            host: host.to_string(),
            port,
            buses,
            uid_bits,
            reader: Mutex::new(None),
            writer: Mutex::new(None),
        }
    }

    pub fn channel(&self) -> &str {
        &self.host
    }

    pub fn buses(&self) -> &[u8] {
        &self.buses
    }

    /// Writes one control-plane line to the gateway.
    pub async fn write_device_command(&self, line: &str) -> Result<(), CanError> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(CanError::NotOpen)?;
        writer.write_all(line.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        Ok(())
    }

    fn parse_frame_line(&self, line: &str) -> Option<Message> {
        let mut parts = line.split_ascii_whitespace();
        if parts.next() != Some("M") {
            return None;
        }

        let bus = parts.next()?.parse::<u8>().ok()?;
        let arbitration_id = u32::from_str_radix(parts.next()?, 16).ok()?;

        let mut data = Vec::new();
        for part in parts {
            data.push(u8::from_str_radix(part, 16).ok()?);
        }

        Message::from_frame(arbitration_id, data, self.uid_bits, None, Some(bus)).ok()
    }
}

#[async_trait]
impl Bus for CanNetBus {
    async fn open(&self) -> Result<(), CanError> {
        let stream = TcpStream::connect((self.host.as_str(), self.port))
            .await
            .map_err(|source| CanError::Connection {
                channel: format!("{}:{}", self.host, self.port),
                source,
            })?;

        let (read_half, write_half) = stream.into_split();
        *self.reader.lock().await = Some(LineReader {
            half: read_half,
            buf: Vec::new(),
        });
        *self.writer.lock().await = Some(write_half);

        for bus in &self.buses {
            self.write_device_command(&format!("CAN {bus} START")).await?;
        }

        debug!(host = %self.host, port = self.port, buses = ?self.buses, "gateway open");

        Ok(())
    }

    async fn send(&self, message: &Message) -> Result<(), CanError> {
        if message.data.len() > 8 {
            return Err(CanError::FrameTooLong(message.data.len()));
        }

        let data_hex = message
            .data
            .iter()
            .map(|b| format!("{b:02X}"))
            .collect::<Vec<_>>()
            .join(" ");

        // An untargeted message goes out on every bus the gateway drives.
        let buses: Vec<u8> = match message.bus {
            Some(bus) => vec![bus],
            None => self.buses.clone(),
        };

        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(CanError::NotOpen)?;

        for bus in buses {
            let line = if data_hex.is_empty() {
                format!("M {bus} {id:08X}\n", id = message.arbitration_id)
            } else {
                format!("M {bus} {id:08X} {data_hex}\n", id = message.arbitration_id)
            };
            writer.write_all(line.as_bytes()).await?;
        }

        Ok(())
    }

    async fn recv(&self) -> Result<Message, CanError> {
        let mut guard = self.reader.lock().await;
        let reader = guard.as_mut().ok_or(CanError::NotOpen)?;

        loop {
            if let Some(pos) = reader.buf.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = reader.buf.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&line[..pos]).trim().to_string();

                if line.is_empty() {
                    continue;
                }

                if let Some(message) = self.parse_frame_line(&line) {
                    return Ok(message);
                }

                // Control-plane traffic; the network layer parses it.
                return Ok(Message {
                    arbitration_id: 0,
                    data: line.into_bytes(),
                    positioner_id: 0,
                    command_id: 0,
                    uid: 0,
                    response_code: 0,
                    interface: None,
                    bus: None,
                });
            }

            let mut chunk = [0u8; 1024];
            let n = reader.half.read(&mut chunk).await?;
            if n == 0 {
                return Err(CanError::NotOpen);
            }
            reader.buf.extend_from_slice(&chunk[..n]);
        }
    }

    async fn close(&self) {
        for bus in &self.buses {
            let _ = self.write_device_command(&format!("CAN {bus} STOP")).await;
        }
        *self.reader.lock().await = None;
        *self.writer.lock().await = None;
    }
}

/// Descriptions for the gateway `R ERR` codes.
pub fn gateway_error_description(code: u8) -> &'static str {
    match code {
        1 => "CAN baud rate not found",
        2 => "CAN stop failed",
        3 => "CAN start failed",
        4 => "CAN extended filter is full",
        5 => "CAN standard open filter set twice",
        6 => "CAN standard filter is full",
        7 => "CAN invalid identifier or mask for filter add",
        8 => "CAN baud rate detection is busy",
        9 => "CAN invalid parameter type",
        10 => "CAN invalid CAN state",
        11 => "CAN invalid parameter mode",
        12 => "CAN invalid port number",
        13 => "CAN init auto baud failed",
        14 => "CAN filter parameter is missing",
        15 => "CAN bus off parameter is missing",
        16 => "CAN parameter is missing",
        17 => "DEV parameter is missing",
        18 => "CAN invalid parameter brp",
        19 => "CAN invalid parameter sjw",
        20 => "CAN invalid parameter tSeg1",
        21 => "CAN invalid parameter tSeg2",
        22 => "CAN init custom failed",
        23 => "CAN init failed",
        24 => "CAN reset failed",
        25 => "CAN filter parameter is missing",
        27 => "CYC parameter is missing",
        28 => "CYC message stop failed",
        29 => "CYC message init failed",
        30 => "CYC message invalid parameter port",
        31 => "CYC message invalid parameter msg_num",
        32 => "CYC message invalid parameter time",
        33 => "CYC message invalid parameter data",
        _ => "unknown error",
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GatewayError {
    pub code: u8,
    pub description: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BusEvent {
    pub event: String,
    pub timestamp: DateTime<Utc>,
}

/// Decoded `R CAN <bus> <status5> <buffer>` line. The five status
/// characters map to the flags below; `-` means clear.
#[derive(Debug, Clone, Serialize)]
pub struct BusStatus {
    pub status: String,
    pub buffer: u32,
    pub bus_off: bool,
    pub error_warning: bool,
    pub data_overrun: bool,
    pub transmit_pending: bool,
    pub init_state: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DeviceStatus {
    pub name: Option<String>,
    pub version: Option<String>,
    pub errors: Vec<GatewayError>,
    pub events: HashMap<u8, Vec<BusEvent>>,
    pub buses: HashMap<u8, BusStatus>,
}

/// Folds gateway control-plane lines into per-interface device status.
pub struct DeviceStatusTracker {
    identify_re: Regex,
    version_re: Regex,
    error_re: Regex,
    event_re: Regex,
    status_re: Regex,
    status: HashMap<usize, DeviceStatus>,
}

impl Default for DeviceStatusTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceStatusTracker {
    pub fn new() -> Self {
        Self {
            identify_re: Regex::new(r"^R (?P<device>CAN@net \w+ \d+)$")
                .expect("static regex"),
            version_re: Regex::new(r"^R V(?P<version>[\d.]+)$").expect("static regex"),
            error_re: Regex::new(r"^R ERR (?P<code>\d{1,2})(?: (?P<descr>.+))?$")
                .expect("static regex"),
            event_re: Regex::new(r"^E (?P<bus>\d+) (?P<event>.+)$").expect("static regex"),
            status_re: Regex::new(r"^R CAN (?P<bus>\d+) (?P<status>[-\w]{5}) (?P<buffer>\d+)$")
                .expect("static regex"),
            status: HashMap::new(),
        }
    }

    pub fn status(&self) -> &HashMap<usize, DeviceStatus> {
        &self.status
    }

    /// Parses one control line from the given interface. Returns `false`
    /// when the line did not match any known form.
    pub fn handle_line(&mut self, interface: usize, line: &str) -> bool {
        if line.eq_ignore_ascii_case("r ok") {
            return true;
        }

        let entry = self.status.entry(interface).or_default();
        let now = Utc::now();

        if let Some(caps) = self.identify_re.captures(line) {
            entry.name = Some(caps["device"].to_string());
        } else if let Some(caps) = self.version_re.captures(line) {
            entry.version = Some(caps["version"].to_string());
        } else if let Some(caps) = self.error_re.captures(line) {
            let code = caps["code"].parse().unwrap_or(0);
            let description = caps
                .name("descr")
                .map(|m| m.as_str().to_string())
                .unwrap_or_else(|| gateway_error_description(code).to_string());
            entry.errors.insert(
                0,
                GatewayError {
                    code,
                    description,
                    timestamp: now,
                },
            );
        } else if let Some(caps) = self.event_re.captures(line) {
            let bus = caps["bus"].parse().unwrap_or(0);
            entry.events.entry(bus).or_default().insert(
                0,
                BusEvent {
                    event: caps["event"].to_string(),
                    timestamp: now,
                },
            );
        } else if let Some(caps) = self.status_re.captures(line) {
            let bus: u8 = caps["bus"].parse().unwrap_or(0);
            let status = caps["status"].to_string();
            let flags: Vec<bool> = status.chars().map(|c| c != '-').collect();

            entry.buses.insert(
                bus,
                BusStatus {
                    bus_off: flags[0],
                    error_warning: flags[1],
                    data_overrun: flags[2],
                    transmit_pending: flags[3],
                    init_state: flags[4],
                    status,
                    buffer: caps["buffer"].parse().unwrap_or(0),
                    timestamp: now,
                },
            );
        } else {
            debug!(interface, line, "gateway line cannot be parsed");
            return false;
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopus_proto::ident::DEFAULT_UID_BITS;
    use canopus_proto::CommandId;

    #[test]
    fn frame_lines_roundtrip() {
        let bus = CanNetBus::new("10.1.10.110", 19228, vec![1, 2], DEFAULT_UID_BITS);

        let msg = Message::new(CommandId::GetStatus, 7, 1, vec![0x01, 0xff], DEFAULT_UID_BITS)
            .unwrap();
        let line = format!("M 2 {:08X} 01 FF", msg.arbitration_id);

        let parsed = bus.parse_frame_line(&line).unwrap();
        assert_eq!(parsed.positioner_id, 7);
        assert_eq!(parsed.bus, Some(2));
        assert_eq!(parsed.data, vec![0x01, 0xff]);

        assert!(bus.parse_frame_line("R OK").is_none());
    }

    #[test]
    fn tracker_parses_control_plane() {
        let mut tracker = DeviceStatusTracker::new();

        assert!(tracker.handle_line(0, "R OK"));
        assert!(tracker.handle_line(0, "R CAN@net NT 420"));
        assert!(tracker.handle_line(0, "R V6.1.0"));
        assert!(tracker.handle_line(0, "E 2 CAN message lost"));
        assert!(tracker.handle_line(0, "R CAN 1 --p-- 42"));
        assert!(tracker.handle_line(0, "R ERR 3 CAN 1 start failed"));
        assert!(tracker.handle_line(0, "R ERR 23"));
        assert!(!tracker.handle_line(0, "garbage"));

        let status = &tracker.status()[&0];
        assert_eq!(status.name.as_deref(), Some("CAN@net NT 420"));
        assert_eq!(status.version.as_deref(), Some("6.1.0"));
        assert_eq!(status.errors[1].code, 3);
        assert_eq!(status.errors[0].code, 23);
        assert_eq!(status.errors[0].description, "CAN init failed");
        assert_eq!(status.events[&2][0].event, "CAN message lost");

        let bus1 = &status.buses[&1];
        assert!(!bus1.bus_off);
        assert!(bus1.data_overrun);
        assert_eq!(bus1.buffer, 42);
    }
}
