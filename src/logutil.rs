//! Logging utilities: the columnar event-log row format for decoded
//! messages, and sanitizing raw serial lines so logs stay single-line.

use crate::protocol::{DisplayRow, ReceivedMessage};

/// Render one decoded reading as a fixed-width event log row:
/// message kind, source and destination, then the reading itself with an
/// optional zone column.
pub fn display_row(msg: &ReceivedMessage, row: &DisplayRow, zone_name: Option<&str>) -> String {
    let destination: &str = if msg.is_broadcast() {
        "BROADCAST MESSAGE"
    } else {
        &msg.destination_name
    };
    match row.zone {
        Some(zone) => {
            let zone_col = match zone_name {
                Some(name) => format!("@ {:<20}", name),
                None => " ".repeat(22),
            };
            format!(
                "{:<2}| {:<22} -> {:<22} | {:>5} {:<25} [Zone {:<3}] {}",
                msg.msg_type, msg.source_name, destination, row.text, zone_col, zone, row.suffix
            )
        }
        None => format!(
            "{:<2}| {:<22} -> {:<22} | {:>5} {}",
            msg.msg_type, msg.source_name, destination, row.text, row.suffix
        ),
    }
}

/// Escape a raw serial line for single-line logging:
/// - `\n` => `\\n`
/// - `\r` => `\\r`
/// - `\t` => `\\t`
/// - backslash => `\\\\`
///   Truncates very long strings with an ellipsis to cap log noise.
pub fn escape_log(s: &str) -> String {
    const MAX_PREVIEW: usize = 300;
    let mut out = String::with_capacity(s.len().min(MAX_PREVIEW) + 8);
    for (count, ch) in s.chars().enumerate() {
        if count >= MAX_PREVIEW {
            out.push('…');
            break;
        }
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {
                // Represent other control chars as hex \xNN
                use std::fmt::Write;
                let _ = write!(&mut out, "\\x{:02X}", c as u32);
            }
            c => out.push(c),
        }
    }
    out
}
