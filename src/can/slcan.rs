//! Serial-line CAN (slcan) channel.
//!
//! The adapter speaks the ASCII lawicel protocol over a serial port:
//! extended data frames are `T<id:08X><len><data hex>\r`. The channel is
//! configured for the 1 Mbit/s rate the positioner network runs at.

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::debug;

use crate::can::bus::Bus;
use crate::can::message::Message;
use crate::error::CanError;

struct LineReader {
    half: ReadHalf<SerialStream>,
    buf: Vec<u8>,
}

pub struct SlcanBus {
    channel: String,
    baudrate: u32,
    uid_bits: u32,
    reader: Mutex<Option<LineReader>>,
    writer: Mutex<Option<WriteHalf<SerialStream>>>,
}

impl SlcanBus {
    pub fn new(channel: &str, baudrate: u32, uid_bits: u32) -> Self {
        Self {
            channel: channel.to_string(),
            baudrate,
            uid_bits,
            reader: Mutex::new(None),
            writer: Mutex::new(None),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    async fn write_line(&self, line: &str) -> Result<(), CanError> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(CanError::NotOpen)?;
        writer.write_all(line.as_bytes()).await?;
        writer.write_all(b"\r").await?;
        Ok(())
    }

    /// Parses one `T` line into a message; `None` for anything else
    /// (standard frames, acks, error bells).
    fn parse_line(&self, line: &str) -> Option<Message> {
        let rest = line.strip_prefix('T')?;
        if rest.len() < 9 {
            return None;
        }

        let arbitration_id = u32::from_str_radix(&rest[0..8], 16).ok()?;
        let len = rest[8..9].parse::<usize>().ok()?;
        if rest.len() < 9 + len * 2 {
            return None;
        }

        let mut data = Vec::with_capacity(len);
        for ii in 0..len {
            let byte = u8::from_str_radix(&rest[9 + ii * 2..11 + ii * 2], 16).ok()?;
            data.push(byte);
        }

        Message::from_frame(arbitration_id, data, self.uid_bits, None, None).ok()
    }
}

#[async_trait]
impl Bus for SlcanBus {
    async fn open(&self) -> Result<(), CanError> {
        let stream = tokio_serial::new(&self.channel, self.baudrate)
            .open_native_async()
            .map_err(|err| CanError::Connection {
                channel: self.channel.clone(),
                source: std::io::Error::new(std::io::ErrorKind::Other, err),
            })?;

        let (read_half, write_half) = tokio::io::split(stream);
        *self.reader.lock().await = Some(LineReader {
            half: read_half,
            buf: Vec::new(),
        });
        *self.writer.lock().await = Some(write_half);

        // Reset the adapter, set the CAN bitrate (1 Mbit/s) and open.
        self.write_line("C").await?;
        self.write_line("S8").await?;
        self.write_line("O").await?;

        debug!(channel = %self.channel, "slcan channel open");

        Ok(())
    }

    async fn send(&self, message: &Message) -> Result<(), CanError> {
        if message.data.len() > 8 {
            return Err(CanError::FrameTooLong(message.data.len()));
        }

        let line = format!(
            "T{:08X}{}{}",
            message.arbitration_id,
            message.data.len(),
            hex::encode_upper(&message.data),
        );
        self.write_line(&line).await
    }

    async fn recv(&self) -> Result<Message, CanError> {
        let mut guard = self.reader.lock().await;
        let reader = guard.as_mut().ok_or(CanError::NotOpen)?;

        loop {
            if let Some(pos) = reader.buf.iter().position(|&b| b == b'\r') {
                let line: Vec<u8> = reader.buf.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&line[..line.len() - 1]).into_owned();

                if let Some(message) = self.parse_line(&line) {
                    return Ok(message);
                }
                continue;
            }

            let mut chunk = [0u8; 256];
            let n = reader.half.read(&mut chunk).await?;
            if n == 0 {
                return Err(CanError::NotOpen);
            }
            reader.buf.extend_from_slice(&chunk[..n]);
        }
    }

    async fn close(&self) {
        let _ = self.write_line("C").await;
        *self.reader.lock().await = None;
        *self.writer.lock().await = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopus_proto::ident::DEFAULT_UID_BITS;
    use canopus_proto::CommandId;

    #[test]
    fn parses_extended_frames_only() {
        let bus = SlcanBus::new("/dev/ttyACM0", 115_200, DEFAULT_UID_BITS);

        let msg =
            Message::new(CommandId::GetStatus, 19, 0, vec![0xab, 0xcd], DEFAULT_UID_BITS)
                .unwrap();
        let line = format!("T{:08X}2ABCD", msg.arbitration_id);

        let parsed = bus.parse_line(&line).unwrap();
        assert_eq!(parsed.positioner_id, 19);
        assert_eq!(parsed.data, vec![0xab, 0xcd]);

        assert!(bus.parse_line("t1002ABCD").is_none());
        assert!(bus.parse_line("z").is_none());
        assert!(bus.parse_line("T123").is_none());
    }
}
