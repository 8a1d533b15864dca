//! Decoding of OpenTherm bridge traffic (command 3220).
//!
//! The bridge tunnels raw OpenTherm exchanges between controller and boiler.
//! Each frame carries one message: a type nibble, a data id and a 16-bit
//! value in 8.8 fixed point. Parity or protocol violations are reported but
//! produce no readings.

use super::{hex_u16, hex_u8, DecodeError, Decoded, DisplayRow, FactValue, ReceivedMessage};

/// OpenTherm message type from the masked type bits.
pub fn msg_type_name(type_id: u8) -> &'static str {
    match type_id {
        0 => "Read-Data",
        16 => "Write-Data",
        32 => "Invalid-Data",
        48 => "-reserved-",
        64 => "Read-Ack",
        80 => "Write-Ack",
        96 => "Data-Invalid",
        112 => "Unknown-DataId",
        _ => "Unknown",
    }
}

/// Even-parity fold over all bits of `x`.
pub fn parity(x: u32) -> u32 {
    x.count_ones() & 1
}

pub fn decode(msg: &ReceivedMessage) -> Result<Decoded, DecodeError> {
    if msg.payload_length != 5 {
        return Err(DecodeError::PayloadLength {
            expected: "5",
            actual: msg.payload_length,
        });
    }

    // Byte 0 is always 00. Byte 1 packs parity (bit 7), type (bits 4-6) and
    // the reserved low nibble.
    let flags = hex_u8(&msg.payload[2..4])?;
    let type_id = flags & 0x70;
    let type_name = msg_type_name(type_id);
    let data_id = hex_u8(&msg.payload[4..6])?;
    let value_hex = &msg.payload[6..10];

    let word = u32::from_str_radix(&msg.payload[2..10], 16)
        .map_err(|_| DecodeError::BadHex(msg.payload[2..10].to_string()))?;
    if (flags >> 7) as u32 != parity(word & 0x7FFF_FFFF) {
        return Ok(Decoded::row(format!(
            "Parity error. Msg type_id: {} ({}) id: {}, value: {}",
            type_id, type_name, data_id, value_hex
        )));
    }
    if flags & 0x0F != 0 {
        return Ok(Decoded::row(format!(
            "Protocol error. Msg type_id: {} ({}), id: {}, value: {}",
            type_id, type_name, data_id, value_hex
        )));
    }

    let value_int = hex_u16(value_hex)? as f64;
    let value = value_int / 256.0;
    let topic = format!("relays/{}", msg.source_name);
    let is_response = type_id > 0;

    let mut out = Decoded::default();
    let status = match data_id {
        5 => {
            let app_flags = &msg.payload[6..8];
            let oem_code = &msg.payload[8..10];
            if is_response {
                out.push_fact(&topic, "app_specific_flags", FactValue::Text(app_flags.into()));
                out.push_fact(&topic, "oem_fault_code", FactValue::Text(oem_code.into()));
                format!(
                    "{:2}/{:2}   : Application Specific Flags/OEM Fault Code",
                    app_flags, oem_code
                )
            } else {
                "Request App specific flags/OEM fault code".to_string()
            }
        }
        17 => {
            if is_response {
                out.push_fact(&topic, "relative_modulation", FactValue::Float(value));
                format!("{:5.1}%  : Relative modulation", value)
            } else {
                "Request Relative Modulation value".to_string()
            }
        }
        18 => {
            if is_response {
                out.push_fact(&topic, "ch_water_pressure", FactValue::Float(value));
                format!("{:5.1}   : CH Water Pressure (bar)", value)
            } else {
                "Request CH Water Pressure".to_string()
            }
        }
        19 => {
            if is_response {
                out.push_fact(&topic, "dhw_flow_rate", FactValue::Float(value));
                format!("{:5.1}   : DHW flow rate (l/min)", value)
            } else {
                "Request DHW Flow Rate".to_string()
            }
        }
        25 => {
            if is_response {
                out.push_fact(&topic, "boiler_temperature", FactValue::Float(value));
                format!("{:5.1}\u{00b0}C : Flow Water Temperature", value)
            } else {
                "Request Boiler Flow Water Temperature".to_string()
            }
        }
        26 => {
            if is_response {
                out.push_fact(&topic, "dhw_temperature", FactValue::Float(value));
                format!("{:5.1}\u{00b0}C : DHW Temperature", value)
            } else {
                "Request DHW Temperature".to_string()
            }
        }
        28 => {
            if is_response {
                out.push_fact(&topic, "return_water_temperature", FactValue::Float(value));
                format!("{:5.1}\u{00b0}C : Return Water Temperature", value)
            } else {
                "Request Boiler Return Water Temperature".to_string()
            }
        }
        115 => {
            if is_response {
                out.push_fact(&topic, "oem_diagnostic_code", FactValue::Float(value_int));
                format!("{:5.1}   : OEM diagnostic code", value_int)
            } else {
                "Request OEM Diagnostic code".to_string()
            }
        }
        other => format!(
            "Message Data ID not recognised. Type: {} ({}), Data ID: {}, value: {}",
            type_name, type_id, other, value_hex
        ),
    };
    out.rows.push(DisplayRow::new(status));
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{frame, MsgType};
    use crate::registry::Registry;

    fn build(payload: &str) -> ReceivedMessage {
        ReceivedMessage {
            raw: String::new(),
            rssi: None,
            port: None,
            msg_type: MsgType::Response,
            source: "10:333333".to_string(),
            source_type: "10".to_string(),
            source_name: "10:333333".to_string(),
            device2: "01:139901".to_string(),
            device3: "--:------".to_string(),
            destination: "01:139901".to_string(),
            destination_type: "01".to_string(),
            destination_name: "01:139901".to_string(),
            command_code: "3220".to_string(),
            payload_length: 5,
            payload: payload.to_string(),
        }
    }

    fn payload_with_parity(type_bits: u8, data_id: u8, value: u16) -> String {
        let word = ((type_bits as u32) << 24) | ((data_id as u32) << 16) | value as u32;
        let p = parity(word & 0x7FFF_FFFF);
        format!("00{:08X}", word | (p << 31))
    }

    #[test]
    fn parity_folds_words_with_high_bits_set() {
        assert_eq!(parity(0), 0);
        assert_eq!(parity(1), 1);
        // Type bits live in the top byte of the word; a fold must not
        // overflow its shift on them.
        assert_eq!(parity(0x4000_0000), 1);
        assert_eq!(parity(0x4019_0000), 0);
        assert_eq!(parity(u32::MAX), 0);
    }

    #[test]
    fn boiler_temperature_reads_in_degrees() {
        // Read-Ack for data id 25, value 0x3A00 = 58.0 in 8.8 fixed point
        let msg = build(&payload_with_parity(0x40, 25, 0x3A00));
        let out = decode(&msg).unwrap();
        assert_eq!(out.facts.len(), 1);
        assert_eq!(out.facts[0].name, "boiler_temperature");
        assert_eq!(out.facts[0].value, FactValue::Float(58.0));
        assert_eq!(out.facts[0].topic, "relays/10:333333");
    }

    #[test]
    fn read_request_produces_no_facts() {
        let msg = build(&payload_with_parity(0x00, 25, 0x0000));
        let out = decode(&msg).unwrap();
        assert!(out.facts.is_empty());
        assert_eq!(out.rows[0].text, "Request Boiler Flow Water Temperature");
    }

    #[test]
    fn flipped_parity_bit_is_reported_not_decoded() {
        let good = payload_with_parity(0x40, 25, 0x3A00);
        let flipped = {
            let word = u32::from_str_radix(&good[2..], 16).unwrap() ^ 0x8000_0000;
            format!("00{:08X}", word)
        };
        let out = decode(&build(&flipped)).unwrap();
        assert!(out.facts.is_empty());
        assert!(out.rows[0].text.starts_with("Parity error"));
    }

    #[test]
    fn reserved_bits_fail_protocol_check() {
        // Set a reserved low-nibble bit, then fix parity so only the
        // protocol check can object.
        let word: u32 = (0x41u32 << 24) | (25u32 << 16) | 0x3A00;
        let p = parity(word & 0x7FFF_FFFF);
        let msg = build(&format!("00{:08X}", word | (p << 31)));
        let out = decode(&msg).unwrap();
        assert!(out.facts.is_empty());
        assert!(out.rows[0].text.starts_with("Protocol error"));
    }

    #[test]
    fn wrong_length_is_an_error() {
        let mut msg = build("0000");
        msg.payload_length = 2;
        assert!(decode(&msg).is_err());
    }

    #[test]
    fn frame_parser_feeds_decoder() {
        let reg = Registry::empty("01:139901", "18:318170");
        let payload = payload_with_parity(0x40, 26, 0x2C80); // 44.5
        let line = format!(
            "--- RP --- 10:333333 01:139901 --:------ 3220 005 {}",
            payload
        );
        let msg = frame::parse_line(&line, None, &reg).unwrap();
        let out = decode(&msg).unwrap();
        assert_eq!(out.facts[0].name, "dhw_temperature");
        assert_eq!(out.facts[0].value, FactValue::Float(44.5));
    }
}
