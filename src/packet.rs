use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::command::Command;
use crate::crc::crc32;
use crate::{LightError, Result};

/// Every MCU control packet travels in one fixed-size HID report.
pub const REPORT_SIZE: usize = 64;

/// Placeholder payload for commands that take no argument; the protocol
/// rejects an empty payload field.
pub const DUMMY_PAYLOAD: &[u8] = b" ";

const START: u8 = 0x02;
const END: u8 = 0x03;
const SEP: u8 = b':';

/// Classification of a decoded MCU packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Unknown,
    /// The device reported a CRC failure in plain text,
    /// e.g. "CAL CRC ERROR:20000614:200152e8".
    CrcError,
    Command,
    Response,
    /// Asynchronous event originated by the MCU (key, proximity, ...).
    Mcu,
    HeartBeatResponse,
}

/// One MCU control packet.
///
/// Wire framing (ASCII): `0x02 ':' T ':' I ':' P ':' TS ':' CRC ':' 0x03`,
/// zero-padded to 64 bytes. `TS` is lowercase hex of the sender's
/// millisecond epoch; `CRC` is `%08x` of CRC-32 over everything up to and
/// including the separator before it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub kind: PacketKind,
    pub command: Option<Command>,
    pub payload: Vec<u8>,
    pub timestamp: Vec<u8>,
    /// Raw text for CRC-error / unknown / MCU packets.
    pub message: String,
}

impl Packet {
    /// Build a COMMAND packet stamped with the current time.
    pub fn command_packet(command: Command, payload: &[u8]) -> Packet {
        Packet {
            kind: PacketKind::Command,
            command: Some(command),
            payload: payload.to_vec(),
            timestamp: timestamp_now(),
            message: String::new(),
        }
    }

    /// Serialize into one 64-byte report.
    pub fn serialize(&self) -> Result<[u8; REPORT_SIZE]> {
        let mut report = [0u8; REPORT_SIZE];

        if matches!(
            self.kind,
            PacketKind::CrcError | PacketKind::Unknown | PacketKind::Mcu
        ) {
            if self.message.is_empty() {
                return Err(LightError::InvalidArgument(
                    "packet carries no message".into(),
                ));
            }
            let bytes = self.message.as_bytes();
            let n = bytes.len().min(REPORT_SIZE);
            report[..n].copy_from_slice(&bytes[..n]);
            return Ok(report);
        }

        let command = self.command.filter(|c| c.ty != 0 && c.id != 0).ok_or_else(|| {
            LightError::InvalidArgument("packet carries no command".into())
        })?;
        if self.payload.is_empty() || self.timestamp.is_empty() {
            return Err(LightError::InvalidArgument(
                "packet is missing payload or timestamp".into(),
            ));
        }

        let mut buf = Vec::with_capacity(REPORT_SIZE);
        buf.push(START);
        buf.push(SEP);
        buf.push(command.ty);
        buf.push(SEP);
        buf.push(command.id);
        buf.push(SEP);
        buf.extend_from_slice(&self.payload);
        buf.push(SEP);
        buf.extend_from_slice(&self.timestamp);
        buf.push(SEP);
        let checksum = crc32(&buf);
        buf.extend_from_slice(format!("{checksum:08x}").as_bytes());
        buf.push(SEP);
        buf.push(END);

        let n = buf.len().min(REPORT_SIZE);
        report[..n].copy_from_slice(&buf[..n]);
        Ok(report)
    }

    /// Deserialize one inbound report.
    pub fn deserialize(data: &[u8]) -> Result<Packet> {
        if data.is_empty() {
            return Err(LightError::Format("empty report".into()));
        }

        if data[0] == b'C' {
            // Plain-text CRC complaint from the device; taken at face value.
            return Ok(Packet {
                kind: PacketKind::CrcError,
                command: None,
                payload: Vec::new(),
                timestamp: Vec::new(),
                message: trimmed_text(data),
            });
        }

        if data[0] != START {
            return Err(LightError::Format(format!(
                "unrecognized data format: {}",
                trimmed_text(data)
            )));
        }

        // The end marker byte can also occur inside the frame; the scan
        // keeps the last match and verifies it.
        let mut end_idx = data.len() - 1;
        for (i, &b) in data.iter().enumerate() {
            if b == END {
                end_idx = i;
            }
        }
        if data[end_idx] != END || end_idx < 2 {
            return Err(LightError::Format(format!(
                "input does not end with 0x03: {}",
                trimmed_text(data)
            )));
        }

        // Strip the start marker and both framing separators.
        let interior = &data[2..end_idx - 1];
        let parts: Vec<&[u8]> = interior.split(|&b| b == SEP).collect();
        if parts.len() < 5 {
            return Err(LightError::Format(format!(
                "truncated packet ({} of 5 fields): {}",
                parts.len(),
                trimmed_text(data)
            )));
        }

        let (&ty, &id) = match (parts[0].first(), parts[1].first()) {
            (Some(ty), Some(id)) => (ty, id),
            _ => {
                return Err(LightError::Format(format!(
                    "empty command field: {}",
                    trimmed_text(data)
                )))
            }
        };
        let command = Command::new(ty, id);
        let payload = parts[2].to_vec();

        let mut packet = Packet {
            kind: PacketKind::Unknown,
            command: Some(command),
            payload,
            timestamp: Vec::new(),
            message: String::new(),
        };

        match ty {
            0x32 | 0x34 | 0x41 | 0x55 => {
                packet.kind = if ty == 0x41 && id == 0x4b {
                    PacketKind::HeartBeatResponse
                } else {
                    PacketKind::Response
                };
                packet.timestamp = parts[parts.len() - 2].to_vec();
            }
            0x31 | 0x33 | 0x40 | 0x54 => {
                packet.kind = PacketKind::Command;
                packet.timestamp = parts[parts.len() - 2].to_vec();
            }
            0x35 => {
                packet.kind = match id {
                    0x4b | 0x4c | 0x4d | 0x50 | 0x53 => PacketKind::Mcu,
                    _ => PacketKind::Unknown,
                };
                packet.message = trimmed_text(interior);
                packet.timestamp = timestamp_now();
            }
            _ => {
                packet.kind = PacketKind::Unknown;
                packet.message = trimmed_text(interior);
                packet.timestamp = timestamp_now();
            }
        }

        Ok(packet)
    }

    /// Parse the packet's hex-millisecond timestamp. Empty or unparsable
    /// timestamps yield `None`.
    pub fn decode_timestamp(&self) -> Option<SystemTime> {
        if self.timestamp.is_empty() {
            return None;
        }
        let hex = std::str::from_utf8(&self.timestamp).ok()?;
        match u64::from_str_radix(hex, 16) {
            Ok(millis) => Some(UNIX_EPOCH + Duration::from_millis(millis)),
            Err(err) => {
                log::error!("failed to parse timestamp {hex:?}: {err}");
                None
            }
        }
    }
}

/// Current time as lowercase hex milliseconds since epoch, the packet
/// timestamp format.
pub fn timestamp_now() -> Vec<u8> {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    format!("{millis:x}").into_bytes()
}

/// Report bytes as text with the zero padding stripped.
fn trimmed_text(data: &[u8]) -> String {
    let end = data
        .iter()
        .rposition(|&b| b != 0)
        .map_or(0, |last| last + 1);
    String::from_utf8_lossy(&data[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{firmware_independent, Instruction};

    #[test]
    fn serialize_get_brightness_literal() {
        let command = firmware_independent(Instruction::GetBrightnessLevel).unwrap();
        let packet = Packet {
            kind: PacketKind::Command,
            command: Some(command),
            payload: DUMMY_PAYLOAD.to_vec(),
            timestamp: b"18fd37a61db".to_vec(),
            message: String::new(),
        };

        let report = packet.serialize().unwrap();
        let preamble = b"\x02:3:1: :18fd37a61db:";
        assert_eq!(&report[..preamble.len()], preamble);

        let checksum = crc32(preamble);
        let crc_field = &report[preamble.len()..preamble.len() + 8];
        assert_eq!(crc_field, format!("{checksum:08x}").as_bytes());

        assert_eq!(report[preamble.len() + 8], b':');
        assert_eq!(report[preamble.len() + 9], 0x03);
        assert!(report[preamble.len() + 10..].iter().all(|&b| b == 0));
    }

    #[test]
    fn command_round_trip() {
        let packet = Packet::command_packet(Command::new(0x33, 0x43), b"payload");
        let report = packet.serialize().unwrap();
        let decoded = Packet::deserialize(&report).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn response_round_trip_keeps_fields() {
        let packet = Packet {
            kind: PacketKind::Response,
            command: Some(Command::new(0x34, 0x31)),
            payload: b"5".to_vec(),
            timestamp: b"18fd37a61db".to_vec(),
            message: String::new(),
        };
        let report = packet.serialize().unwrap();
        let decoded = Packet::deserialize(&report).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn serialize_rejects_missing_fields() {
        let no_payload = Packet {
            kind: PacketKind::Command,
            command: Some(Command::new(0x33, 0x31)),
            payload: Vec::new(),
            timestamp: timestamp_now(),
            message: String::new(),
        };
        assert!(matches!(
            no_payload.serialize(),
            Err(LightError::InvalidArgument(_))
        ));

        let no_command = Packet {
            kind: PacketKind::Command,
            command: None,
            payload: DUMMY_PAYLOAD.to_vec(),
            timestamp: timestamp_now(),
            message: String::new(),
        };
        assert!(matches!(
            no_command.serialize(),
            Err(LightError::InvalidArgument(_))
        ));
    }

    #[test]
    fn crc_error_text_is_taken_verbatim() {
        let raw = b"CAL CRC ERROR:20000614:200152e8";
        let mut report = [0u8; REPORT_SIZE];
        report[..raw.len()].copy_from_slice(raw);

        let packet = Packet::deserialize(&report).unwrap();
        assert_eq!(packet.kind, PacketKind::CrcError);
        assert_eq!(packet.message, "CAL CRC ERROR:20000614:200152e8");
    }

    #[test]
    fn heart_beat_response_is_classified() {
        let packet = Packet {
            kind: PacketKind::Command,
            command: Some(Command::new(0x40, 0x4b)),
            payload: DUMMY_PAYLOAD.to_vec(),
            timestamp: b"18fd37a61db".to_vec(),
            message: String::new(),
        };
        let mut report = packet.serialize().unwrap();
        // Flip the type byte to the response of a heart beat (0x41).
        report[2] = 0x41;
        // Re-frame: the CRC field is not re-verified by the decoder.
        let decoded = Packet::deserialize(&report).unwrap();
        assert_eq!(decoded.kind, PacketKind::HeartBeatResponse);
    }

    #[test]
    fn mcu_event_is_classified_with_payload() {
        let raw = b"\x02:5:K:UP:18fd37a61db:00000000:\x03";
        let mut report = [0u8; REPORT_SIZE];
        report[..raw.len()].copy_from_slice(raw);

        let decoded = Packet::deserialize(&report).unwrap();
        assert_eq!(decoded.kind, PacketKind::Mcu);
        assert_eq!(decoded.command, Some(Command::new(0x35, 0x4b)));
        assert_eq!(decoded.payload, b"UP");
    }

    #[test]
    fn unknown_mcu_id_is_unknown_kind() {
        let raw = b"\x02:5:z:??:18fd37a61db:00000000:\x03";
        let mut report = [0u8; REPORT_SIZE];
        report[..raw.len()].copy_from_slice(raw);

        let decoded = Packet::deserialize(&report).unwrap();
        assert_eq!(decoded.kind, PacketKind::Unknown);
    }

    #[test]
    fn truncated_packet_is_rejected() {
        let raw = b"\x02:3:1: :\x03";
        assert!(matches!(
            Packet::deserialize(raw),
            Err(LightError::Format(_))
        ));
    }

    #[test]
    fn foreign_first_byte_is_rejected() {
        let raw = b"\x7fgarbage";
        assert!(matches!(
            Packet::deserialize(raw),
            Err(LightError::Format(_))
        ));
    }

    #[test]
    fn scanner_keeps_last_end_marker() {
        // 0x03 can legitimately appear inside the frame; only the final one
        // terminates it.
        let packet = Packet::command_packet(Command::new(0x33, 0x56), &[0x03, b'x']);
        let report = packet.serialize().unwrap();
        let decoded = Packet::deserialize(&report).unwrap();
        assert_eq!(decoded.payload, vec![0x03, b'x']);
    }

    #[test]
    fn timestamp_decodes_to_epoch_millis() {
        let packet = Packet {
            kind: PacketKind::Response,
            command: Some(Command::new(0x34, 0x31)),
            payload: b"1".to_vec(),
            timestamp: b"18fd37a61db".to_vec(),
            message: String::new(),
        };
        let when = packet.decode_timestamp().unwrap();
        let millis = when
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_millis();
        assert_eq!(millis, 0x18fd37a61db);
    }
}
