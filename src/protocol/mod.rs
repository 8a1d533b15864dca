//! evohome wire protocol: frame parsing, command decode table, command
//! encoding and the payload datetime codecs.
//!
//! One radio message is one line of ASCII text. The payload is a hex string
//! whose structure depends on the 4-hex-character command code; the decode
//! table in [`decode`] maps each known code to a typed decoder, and
//! [`encode`] builds outbound frames for the send path.

pub mod datetime;
pub mod decode;
pub mod encode;
pub mod frame;
pub mod opentherm;

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Sentinel device id meaning "absent/unused".
pub const EMPTY_DEVICE_ID: &str = "--:------";

/// Message kind carried in the frame header, doubling as the send mode of
/// outbound commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgType {
    /// Unsolicited information / broadcast
    Info,
    /// Write
    Write,
    /// Request
    Request,
    /// Response
    Response,
}

impl MsgType {
    pub fn parse(s: &str) -> Option<MsgType> {
        match s.trim() {
            "I" => Some(MsgType::Info),
            "W" => Some(MsgType::Write),
            "RQ" => Some(MsgType::Request),
            "RP" => Some(MsgType::Response),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MsgType::Info => "I",
            MsgType::Write => "W",
            MsgType::Request => "RQ",
            MsgType::Response => "RP",
        }
    }
}

impl std::fmt::Display for MsgType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // pad() rather than write_str() so column widths apply.
        f.pad(self.as_str())
    }
}

/// One inbound frame, parsed into its fixed-offset fields with device names
/// resolved against the registry. Constructed by [`frame::parse_line`],
/// consumed synchronously by a decoder, then discarded.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    /// The frame exactly as received.
    pub raw: String,
    /// 3-digit signal strength indicator, when the firmware provides one.
    pub rssi: Option<String>,
    /// Tag of the serial link the frame arrived on.
    pub port: Option<u8>,
    pub msg_type: MsgType,
    pub source: String,
    pub source_type: String,
    pub source_name: String,
    pub device2: String,
    pub device3: String,
    /// device2 when present, else device3.
    pub destination: String,
    pub destination_type: String,
    pub destination_name: String,
    /// 4 hex chars, uppercased.
    pub command_code: String,
    /// Declared payload length in bytes.
    pub payload_length: usize,
    /// Hex payload; always exactly twice `payload_length` characters.
    pub payload: String,
}

impl ReceivedMessage {
    /// A frame is a broadcast when it is addressed back at its sender.
    pub fn is_broadcast(&self) -> bool {
        self.source == self.destination
    }

    /// Raw frame text with any signal-strength field stripped, so the same
    /// broadcast heard through different receivers compares equal.
    pub fn raw_without_rssi(&self) -> String {
        match &self.rssi {
            // "--- NNN  I ..." -> "---  I ..."
            Some(_) if self.raw.len() > 8 => format!("{}{}", &self.raw[..4], &self.raw[8..]),
            _ => self.raw.clone(),
        }
    }
}

/// One outbound instruction, mutated in place across retries by the send
/// queue until acknowledged, failed or cancelled.
#[derive(Debug, Clone)]
pub struct Command {
    pub code: String,
    pub name: Option<String>,
    /// Gateway's own device id.
    pub dev1: String,
    /// Target device (defaults to the main controller).
    pub dev2: String,
    /// Broadcast/filler device slot.
    pub dev3: String,
    /// dev2; the device whose reply counts as the acknowledgement.
    pub destination: String,
    pub send_mode: MsgType,
    pub payload: String,
    /// Human-readable argument description for status logging.
    pub arg_desc: String,
    /// The original instruction JSON, republished with the send status.
    pub instruction: String,
    pub wait_for_ack: bool,
    pub reset_ports_on_fail: bool,
    pub retries: u32,
    pub first_sent: Option<DateTime<Utc>>,
    pub last_retry: Option<DateTime<Utc>>,
    pub acknowledged: Option<DateTime<Utc>>,
    pub failed: bool,
}

impl Command {
    /// Payload length in bytes (the hex string holds two chars per byte).
    pub fn payload_length(&self) -> usize {
        self.payload.len() / 2
    }

    /// Assemble the outbound frame text (without line terminator). The
    /// payload length is rendered in decimal, unlike the hex command code.
    pub fn frame_text(&self) -> String {
        format!(
            "{} --- {} {} {} {:<4} {:03} {}",
            self.send_mode,
            self.dev1,
            self.dev2,
            self.dev3,
            self.code,
            self.payload_length(),
            self.payload
        )
    }

    /// Record a (re)send: stamp the first-send time on the initial attempt,
    /// the retry time always, and bump the retry counter.
    pub fn mark_sent(&mut self, now: DateTime<Utc>) {
        if self.retries == 0 {
            self.first_sent = Some(now);
        }
        self.last_retry = Some(now);
        self.retries += 1;
    }

    /// Display form of the argument description, used in status log lines.
    pub fn describe_args(&self) -> &str {
        if self.arg_desc == "[]" {
            ":"
        } else {
            &self.arg_desc
        }
    }

    pub fn display_name(&self) -> String {
        self.name
            .as_deref()
            .map(|n| n.to_uppercase())
            .unwrap_or_else(|| self.code.clone())
    }
}

/// One human-readable line produced by a decoder, rendered into the event
/// log by the gateway.
#[derive(Debug, Clone, PartialEq)]
pub struct DisplayRow {
    pub text: String,
    /// Zone the reading belongs to, when one applies.
    pub zone: Option<i32>,
    /// Trailing annotation, e.g. a payload length note.
    pub suffix: String,
}

impl DisplayRow {
    pub fn new(text: impl Into<String>) -> DisplayRow {
        DisplayRow {
            text: text.into(),
            zone: None,
            suffix: String::new(),
        }
    }

    pub fn for_zone(text: impl Into<String>, zone: i32) -> DisplayRow {
        DisplayRow {
            text: text.into(),
            zone: Some(zone),
            suffix: String::new(),
        }
    }

    pub fn with_suffix(text: impl Into<String>, suffix: impl Into<String>) -> DisplayRow {
        DisplayRow {
            text: text.into(),
            zone: None,
            suffix: suffix.into(),
        }
    }
}

/// A decoded reading destined for the broker, addressed relative to the
/// publish root as `<topic>/<name>`.
#[derive(Debug, Clone, PartialEq)]
pub struct Fact {
    /// Device or zone topic segment (snake-cased on publish).
    pub topic: String,
    pub name: String,
    pub value: FactValue,
}

impl Fact {
    pub fn new(topic: impl Into<String>, name: impl Into<String>, value: FactValue) -> Fact {
        Fact {
            topic: topic.into(),
            name: name.into(),
            value,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FactValue {
    Float(f64),
    Int(i64),
    Text(String),
    Json(serde_json::Value),
}

impl FactValue {
    /// Wire form of the value as published to the broker.
    pub fn render(&self) -> String {
        match self {
            FactValue::Float(v) => format!("{}", v),
            FactValue::Int(v) => format!("{}", v),
            FactValue::Text(s) => s.clone(),
            FactValue::Json(v) => v.to_string(),
        }
    }
}

/// Everything a decoder produced for one frame.
#[derive(Debug, Default)]
pub struct Decoded {
    pub rows: Vec<DisplayRow>,
    pub facts: Vec<Fact>,
    /// Appended to the command name in the event log, e.g. `_CTL` when a
    /// controller relays setpoints for several zones at once.
    pub label_suffix: Option<&'static str>,
}

impl Decoded {
    pub fn row(text: impl Into<String>) -> Decoded {
        Decoded {
            rows: vec![DisplayRow::new(text)],
            ..Decoded::default()
        }
    }

    pub fn push_fact(
        &mut self,
        topic: impl Into<String>,
        name: impl Into<String>,
        value: FactValue,
    ) {
        self.facts.push(Fact::new(topic, name, value));
    }
}

/// Protocol-layer decode failure. Logged with the offending raw frame and
/// dropped; never allowed to terminate the poll loop.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Invalid payload length of {actual} (should be {expected})")]
    PayloadLength { expected: &'static str, actual: usize },
    #[error("Bad hex field '{0}'")]
    BadHex(String),
    #[error("Invalid packed datetime '{0}'")]
    BadDatetime(String),
    #[error("{0}")]
    Invalid(String),
}

/// Parse a 2-hex-char field into a byte.
pub fn hex_u8(s: &str) -> Result<u8, DecodeError> {
    u8::from_str_radix(s, 16).map_err(|_| DecodeError::BadHex(s.to_string()))
}

/// Parse a 4-hex-char big-endian field into a u16.
pub fn hex_u16(s: &str) -> Result<u16, DecodeError> {
    u16::from_str_radix(s, 16).map_err(|_| DecodeError::BadHex(s.to_string()))
}

/// Convert a 4-hex-char quantity to physical units with the protocol's
/// centi-unit fixed-point convention.
///
/// The reference implementation documents this as a two's-complement decode
/// but in fact always interprets the 16 bits as unsigned; that behavior is
/// reproduced here, so below-zero temperatures read back as large positive
/// values.
pub fn centi_u16(s: &str) -> Result<f64, DecodeError> {
    Ok(hex_u16(s)? as f64 / 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn msg_type_roundtrip() {
        for s in ["I", "W", "RQ", "RP"] {
            assert_eq!(MsgType::parse(s).unwrap().as_str(), s);
        }
        assert_eq!(MsgType::parse(" I"), Some(MsgType::Info));
        assert_eq!(MsgType::parse("XX"), None);
    }

    #[test]
    fn msg_type_display_fills_column_width() {
        assert_eq!(format!("{:<2}", MsgType::Info), "I ");
        assert_eq!(format!("{:<2}", MsgType::Request), "RQ");
    }

    #[test]
    fn centi_u16_is_unsigned() {
        assert_eq!(centi_u16("0834").unwrap(), 21.0);
        assert_eq!(centi_u16("083C").unwrap(), 21.08);
        assert_eq!(centi_u16("0000").unwrap(), 0.0);
        // No sign extension: 0xFF38 (-2.00 in two's complement) reads as 653.36
        assert_eq!(centi_u16("FF38").unwrap(), 653.36);
        assert!(centi_u16("XYZW").is_err());
    }

    #[test]
    fn frame_text_renders_decimal_length() {
        let cmd = Command {
            code: "313F".to_string(),
            name: Some("date_request".to_string()),
            dev1: "18:318170".to_string(),
            dev2: "01:139901".to_string(),
            dev3: EMPTY_DEVICE_ID.to_string(),
            destination: "01:139901".to_string(),
            send_mode: MsgType::Request,
            payload: "00".to_string(),
            arg_desc: "[]".to_string(),
            instruction: String::new(),
            wait_for_ack: true,
            reset_ports_on_fail: false,
            retries: 0,
            first_sent: None,
            last_retry: None,
            acknowledged: None,
            failed: false,
        };
        assert_eq!(
            cmd.frame_text(),
            "RQ --- 18:318170 01:139901 --:------ 313F 001 00"
        );
    }

    #[test]
    fn mark_sent_stamps_first_send_once() {
        let mut cmd = Command {
            code: "313F".to_string(),
            name: None,
            dev1: String::new(),
            dev2: String::new(),
            dev3: String::new(),
            destination: String::new(),
            send_mode: MsgType::Request,
            payload: String::new(),
            arg_desc: String::new(),
            instruction: String::new(),
            wait_for_ack: true,
            reset_ports_on_fail: false,
            retries: 0,
            first_sent: None,
            last_retry: None,
            acknowledged: None,
            failed: false,
        };
        let t0 = Utc::now();
        cmd.mark_sent(t0);
        assert_eq!(cmd.retries, 1);
        assert_eq!(cmd.first_sent, Some(t0));
        let t1 = t0 + chrono::Duration::seconds(60);
        cmd.mark_sent(t1);
        assert_eq!(cmd.retries, 2);
        assert_eq!(cmd.first_sent, Some(t0));
        assert_eq!(cmd.last_retry, Some(t1));
    }
}
