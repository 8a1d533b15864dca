//! End-to-end checks of the inbound pipeline: raw serial line in, log rows
//! and broker facts out.

use evogateway::protocol::decode::{self, CommandKind};
use evogateway::protocol::frame;
use evogateway::protocol::FactValue;
use evogateway::registry::Registry;

fn registry() -> Registry {
    let mut reg = Registry::empty("01:139901", "18:318170");
    reg.insert_device("01:139901", "Controller", 0, false);
    reg.insert_device("04:999999", "Living Room", 3, true);
    reg.insert_device("04:111111", "Living Room TRV", 3, false);
    reg.insert_device("13:555555", "Boiler Relay", 0, false);
    reg
}

fn decode_line(line: &str, reg: &Registry) -> evogateway::protocol::Decoded {
    let msg = frame::parse_line(line, Some(1), reg).expect("frame should parse");
    let kind = CommandKind::from_code(&msg.command_code).expect("known command");
    decode::decode(kind, &msg, reg).expect("decode should succeed")
}

#[test]
fn zone_temperature_line_produces_fact() {
    let reg = registry();
    let decoded = decode_line(
        "--- I --- 04:111111 --:------ 01:139901 30C9 003 000834",
        &reg,
    );
    // 0x0834 = 2100 centidegrees
    assert_eq!(decoded.facts.len(), 1);
    let fact = &decoded.facts[0];
    assert_eq!(fact.topic, "Living Room/Living Room TRV");
    assert_eq!(fact.name, "temperature");
    assert_eq!(fact.value, FactValue::Float(21.0));
    assert_eq!(decoded.rows.len(), 1);
}

#[test]
fn rssi_prefixed_line_decodes_identically() {
    let reg = registry();
    let plain = decode_line(
        "--- I --- 04:111111 --:------ 01:139901 30C9 003 000834",
        &reg,
    );
    let with_rssi = decode_line(
        "--- 067 I --- 04:111111 --:------ 01:139901 30C9 003 000834",
        &reg,
    );
    assert_eq!(plain.facts, with_rssi.facts);
}

#[test]
fn controller_setpoint_broadcast_covers_every_zone() {
    let reg = registry();
    // Three zones in one 2309 broadcast from the controller
    let decoded = decode_line(
        "--- I --- 01:139901 --:------ 01:139901 2309 009 0007D001089802076C",
        &reg,
    );
    assert_eq!(decoded.rows.len(), 3);
    assert_eq!(decoded.label_suffix, Some("_CTL"));
    let setpoints: Vec<&FactValue> = decoded
        .facts
        .iter()
        .filter(|f| f.name == "setpoint_CTL")
        .map(|f| &f.value)
        .collect();
    assert_eq!(
        setpoints,
        vec![
            &FactValue::Float(20.0),
            &FactValue::Float(22.0),
            &FactValue::Float(19.0)
        ]
    );
}

#[test]
fn boiler_relay_demand_publishes_under_relays() {
    let reg = registry();
    // Zone byte 0xFC is the boiler relay, demand 0xC8 = 100%
    let decoded = decode_line(
        "--- I --- 01:139901 --:------ 13:555555 0008 002 FCC8",
        &reg,
    );
    let fact = &decoded.facts[0];
    assert_eq!(fact.topic, "Relays/BDR Boiler Relay");
    assert_eq!(fact.value, FactValue::Float(100.0));
}

#[test]
fn corrupt_lines_never_reach_the_decoders() {
    let reg = registry();
    for line in [
        "--- I --- 04:111111 --:------ 01:139901 30C9 003 0008", // short payload
        "--- I --- 04:111111 --:------ 01:139901 30C9 003 000834 *_BAD*",
        "short line",
    ] {
        assert!(frame::parse_line(line, None, &reg).is_none());
    }
}

#[test]
fn unknown_command_codes_are_left_to_the_caller() {
    let reg = registry();
    let msg = frame::parse_line(
        "--- I --- 01:139901 --:------ 01:139901 7FFF 003 00AABB",
        Some(1),
        &reg,
    )
    .unwrap();
    assert!(CommandKind::from_code(&msg.command_code).is_none());
}
