//! Line-level frame parsing.
//!
//! Frames are fixed-offset ASCII. Two shapes exist in the wild: older
//! firmware emits the header directly after the `---` marker, newer firmware
//! inserts a 3-digit signal strength field first, shifting every later field
//! by four characters. Echoes of our own transmissions sometimes come back
//! with the marker missing or the message kind mangled, so a few
//! normalisation passes run before the offsets are applied.

use log::{error, warn};

use crate::registry::Registry;

use super::{MsgType, ReceivedMessage, EMPTY_DEVICE_ID};

/// Substrings the receiver firmware embeds in lines it already knows are
/// damaged. Any line containing one is dropped outright.
const CORRUPTION_MARKERS: &[&str] = &[
    "Invalid Manchester",
    "Collision",
    "Truncated",
    "_ENC",
    "_BAD",
    "BAD_",
    "ERR",
];

// Field offsets within a normalised frame without the signal strength field.
// The second shape adds RSSI_SHIFT to everything from KIND onwards.
const KIND: (usize, usize) = (4, 6);
const DEV1: (usize, usize) = (11, 20);
const DEV2: (usize, usize) = (21, 30);
const DEV3: (usize, usize) = (31, 40);
const CODE: (usize, usize) = (41, 45);
const LEN: (usize, usize) = (46, 49);
const PAYLOAD_START: usize = 50;
const RSSI_SHIFT: usize = 4;

/// Parse one received line into a message, or `None` if the line is
/// corrupt, a firmware debug line, or otherwise unusable. Parse failures on
/// lines that look like real frames are logged; known noise is dropped
/// silently.
pub fn parse_line(data: &str, port: Option<u8>, reg: &Registry) -> Option<ReceivedMessage> {
    let data = data.trim_end_matches(['\r', '\n']);
    if data.len() <= 40 || !data.is_ascii() {
        return None;
    }
    if CORRUPTION_MARKERS.iter().any(|m| data.contains(m)) {
        return None;
    }

    let line = normalize(data);
    match parse_frame(&line, port, reg) {
        Some(msg) => Some(msg),
        None => {
            if is_debug_line(&line) {
                None
            } else {
                error!("Pattern match failed on received data: '{}'", line);
                None
            }
        }
    }
}

/// Repair the leading marker. Echoes of commands we send sometimes arrive
/// without the `---` prefix, or with the message kind glued onto it.
fn normalize(data: &str) -> String {
    if data.starts_with("---") {
        return fix_kind_field(data);
    }
    if data.trim_start().starts_with("W---") {
        return fix_kind_field(&data[1..]);
    }
    let first_token = data.split(' ').next().unwrap_or("");
    let line = if first_token.len() < 2 {
        format!("---  {}", data)
    } else {
        format!("--- {}", data)
    };
    fix_kind_field(&line)
}

/// The single-character kinds `I` and `W` are right-aligned in a 2-character
/// field, but some firmware emits them left-aligned, pulling the rest of the
/// header one character early. Detect that by looking for the device list
/// marker one short of where it belongs and pad the kind back out.
fn fix_kind_field(line: &str) -> String {
    let b = line.as_bytes();
    for shift in [0usize, RSSI_SHIFT] {
        let kind = KIND.0 + shift;
        if b.len() > kind + 5
            && (b[kind] == b'I' || b[kind] == b'W')
            && b[kind + 1] == b' '
            && &line[kind + 2..kind + 5] == "---"
        {
            let mut fixed = String::with_capacity(line.len() + 1);
            fixed.push_str(&line[..kind]);
            fixed.push(' ');
            fixed.push_str(&line[kind..]);
            return fixed;
        }
    }
    line.to_string()
}

/// Firmware debug output looks like `--- xx.yy...`; not an error worth
/// logging.
fn is_debug_line(line: &str) -> bool {
    let b = line.as_bytes();
    line.starts_with("--- ")
        && b.len() > 6
        && (b[4].is_ascii_lowercase() || b[4].is_ascii_digit())
        && (b[5].is_ascii_lowercase() || b[5].is_ascii_digit())
        && b[6] == b'.'
}

fn slice(line: &str, range: (usize, usize), shift: usize) -> Option<&str> {
    line.get(range.0 + shift..range.1 + shift)
}

fn parse_frame(line: &str, port: Option<u8>, reg: &Registry) -> Option<ReceivedMessage> {
    // Newer firmware puts a 3-digit signal strength where the kind would be.
    let has_rssi = line
        .as_bytes()
        .get(4..7)
        .map(|b| b.iter().all(u8::is_ascii_digit))
        .unwrap_or(false);
    let shift = if has_rssi { RSSI_SHIFT } else { 0 };
    let rssi = if has_rssi {
        line.get(4..7).map(str::to_string)
    } else {
        None
    };

    let msg_type = MsgType::parse(slice(line, KIND, shift)?)?;
    let dev1 = slice(line, DEV1, shift)?.to_string();
    let dev2 = slice(line, DEV2, shift)?.to_string();
    let dev3 = slice(line, DEV3, shift)?.to_string();
    if !dev1.contains(':') {
        return None;
    }
    let command_code = slice(line, CODE, shift)?.to_uppercase();

    // A mangled length field is tolerated so the mismatch gets logged with
    // the frame content rather than dropped as line noise.
    let payload_length = slice(line, LEN, shift)?.trim().parse::<usize>().unwrap_or(0);
    let payload = line.get(PAYLOAD_START + shift..).unwrap_or("").trim().to_string();
    if payload.len() != payload_length * 2 {
        warn!(
            "Payload length {} does not match declared length {} in '{}'",
            payload.len(),
            payload_length,
            line
        );
        return None;
    }

    let destination = if dev2 != EMPTY_DEVICE_ID {
        dev2.clone()
    } else {
        dev3.clone()
    };
    let source_type = dev1.get(0..2).unwrap_or("").to_string();
    let destination_type = destination.get(0..2).unwrap_or("").to_string();
    let broadcast = dev1 == destination;

    // The controller addresses its broadcasts at itself; naming it by its
    // role reads better than the configured device name.
    let source_name = if broadcast && source_type == "01" {
        "CONTROLLER".to_string()
    } else {
        reg.device_name(&dev1)
    };
    let destination_name = if broadcast && destination_type == "01" {
        "CONTROLLER".to_string()
    } else {
        reg.device_name(&destination)
    };

    Some(ReceivedMessage {
        raw: line.to_string(),
        rssi,
        port,
        msg_type,
        source: dev1,
        source_type,
        source_name,
        device2: dev2,
        device3: dev3,
        destination,
        destination_type,
        destination_name,
        command_code,
        payload_length,
        payload,
    })
}
