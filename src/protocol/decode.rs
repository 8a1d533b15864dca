//! The command decode table.
//!
//! Every wire command the gateway understands is a [`CommandKind`] variant;
//! the 4-hex-char code and the lowercase command name both map onto it, and
//! [`decode`] dispatches to the matching payload decoder. Unknown codes stay
//! outside the enum and are reported by the caller.

use chrono::{Duration, Utc};
use log::error;
use serde_json::json;

use crate::registry::{Registry, CTL_TYPE, OTB_TYPE, UFH_TYPE};

use super::datetime::{faultlog_datetime, packed_datetime_decode};
use super::{
    centi_u16, hex_u8, opentherm, DecodeError, Decoded, DisplayRow, FactValue, MsgType,
    ReceivedMessage,
};

/// Controller operating modes by wire id.
pub fn controller_mode_name(mode_id: u8) -> Option<&'static str> {
    match mode_id {
        0 => Some("Auto"),
        1 => Some("Heating Off"),
        2 => Some("Eco-Auto"),
        3 => Some("Away"),
        4 => Some("Day Off"),
        7 => Some("Custom"),
        _ => None,
    }
}

/// Closed set of decodable wire commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    ExternalSensor,
    ZoneName,
    ScheduleSync,
    RelayHeatDemand,
    ZoneInfo,
    Language,
    FaultLog,
    BatteryInfo,
    DhwSettings,
    Heartbeat,
    DhwTemperature,
    WindowStatus,
    Sync,
    DhwState,
    Bind,
    OpenThermTicker,
    SetpointUfh,
    BoilerSetpoint,
    Setpoint,
    SetpointOverride,
    ControllerMode,
    ZoneTemperature,
    DateRequest,
    ZoneHeatDemand,
    OpenTherm,
    ActuatorCheckReq,
    ActuatorState,
}

impl CommandKind {
    pub fn from_code(code: &str) -> Option<CommandKind> {
        use CommandKind::*;
        Some(match code {
            "0002" => ExternalSensor,
            "0004" => ZoneName,
            "0006" => ScheduleSync,
            "0008" => RelayHeatDemand,
            "000A" => ZoneInfo,
            "0100" => Language,
            "0418" => FaultLog,
            "1060" => BatteryInfo,
            "10A0" => DhwSettings,
            "10E0" => Heartbeat,
            "1260" => DhwTemperature,
            "12B0" => WindowStatus,
            "1F09" => Sync,
            "1F41" => DhwState,
            "1FC9" => Bind,
            "1FD4" => OpenThermTicker,
            "22C9" => SetpointUfh,
            "22D9" => BoilerSetpoint,
            "2309" => Setpoint,
            "2349" => SetpointOverride,
            "2E04" => ControllerMode,
            "30C9" => ZoneTemperature,
            "313F" => DateRequest,
            "3150" => ZoneHeatDemand,
            "3220" => OpenTherm,
            "3B00" => ActuatorCheckReq,
            "3EF0" => ActuatorState,
            _ => return None,
        })
    }

    pub fn from_name(name: &str) -> Option<CommandKind> {
        use CommandKind::*;
        Some(match name {
            "external_sensor" => ExternalSensor,
            "zone_name" => ZoneName,
            "schedule_sync" => ScheduleSync,
            "relay_heat_demand" => RelayHeatDemand,
            "zone_info" => ZoneInfo,
            "language" => Language,
            "fault_log" => FaultLog,
            "battery_info" => BatteryInfo,
            "dhw_settings" => DhwSettings,
            "heartbeat" => Heartbeat,
            "dhw_temperature" => DhwTemperature,
            "window_status" => WindowStatus,
            "sync" => Sync,
            "dhw_state" => DhwState,
            "bind" => Bind,
            "opentherm_ticker" => OpenThermTicker,
            "setpoint_ufh" => SetpointUfh,
            "boiler_setpoint" => BoilerSetpoint,
            "setpoint" => Setpoint,
            "setpoint_override" => SetpointOverride,
            "controller_mode" => ControllerMode,
            "zone_temperature" => ZoneTemperature,
            "date_request" | "ping" => DateRequest,
            "zone_heat_demand" => ZoneHeatDemand,
            "opentherm" => OpenTherm,
            "actuator_check_req" => ActuatorCheckReq,
            "actuator_state" => ActuatorState,
            _ => return None,
        })
    }

    pub fn code(&self) -> &'static str {
        use CommandKind::*;
        match self {
            ExternalSensor => "0002",
            ZoneName => "0004",
            ScheduleSync => "0006",
            RelayHeatDemand => "0008",
            ZoneInfo => "000A",
            Language => "0100",
            FaultLog => "0418",
            BatteryInfo => "1060",
            DhwSettings => "10A0",
            Heartbeat => "10E0",
            DhwTemperature => "1260",
            WindowStatus => "12B0",
            Sync => "1F09",
            DhwState => "1F41",
            Bind => "1FC9",
            OpenThermTicker => "1FD4",
            SetpointUfh => "22C9",
            BoilerSetpoint => "22D9",
            Setpoint => "2309",
            SetpointOverride => "2349",
            ControllerMode => "2E04",
            ZoneTemperature => "30C9",
            DateRequest => "313F",
            ZoneHeatDemand => "3150",
            OpenTherm => "3220",
            ActuatorCheckReq => "3B00",
            ActuatorState => "3EF0",
        }
    }

    pub fn name(&self) -> &'static str {
        use CommandKind::*;
        match self {
            ExternalSensor => "external_sensor",
            ZoneName => "zone_name",
            ScheduleSync => "schedule_sync",
            RelayHeatDemand => "relay_heat_demand",
            ZoneInfo => "zone_info",
            Language => "language",
            FaultLog => "fault_log",
            BatteryInfo => "battery_info",
            DhwSettings => "dhw_settings",
            Heartbeat => "heartbeat",
            DhwTemperature => "dhw_temperature",
            WindowStatus => "window_status",
            Sync => "sync",
            DhwState => "dhw_state",
            Bind => "bind",
            OpenThermTicker => "opentherm_ticker",
            SetpointUfh => "setpoint_ufh",
            BoilerSetpoint => "boiler_setpoint",
            Setpoint => "setpoint",
            SetpointOverride => "setpoint_override",
            ControllerMode => "controller_mode",
            ZoneTemperature => "zone_temperature",
            DateRequest => "date_request",
            ZoneHeatDemand => "zone_heat_demand",
            OpenTherm => "opentherm",
            ActuatorCheckReq => "actuator_check_req",
            ActuatorState => "actuator_state",
        }
    }
}

/// Decode one message's payload into log rows and broker facts.
pub fn decode(
    kind: CommandKind,
    msg: &ReceivedMessage,
    reg: &Registry,
) -> Result<Decoded, DecodeError> {
    use CommandKind::*;
    match kind {
        ExternalSensor | Heartbeat => Ok(Decoded::row(msg.raw.clone())),
        ZoneName | ScheduleSync | Bind => Ok(payload_dump(msg)),
        RelayHeatDemand => relay_heat_demand(msg, reg),
        ZoneInfo => zone_info(msg, reg),
        Language => language(msg),
        FaultLog => fault_log(msg, reg),
        BatteryInfo => battery_info(msg, reg),
        DhwSettings => dhw_settings(msg),
        DhwTemperature => dhw_temperature(msg),
        WindowStatus => window_status(msg, reg),
        Sync => sync(msg),
        DhwState => dhw_state(msg),
        OpenThermTicker => Ok(Decoded::default()),
        SetpointUfh => setpoint_ufh(msg, reg),
        BoilerSetpoint => boiler_setpoint(msg),
        Setpoint => setpoint(msg, reg),
        SetpointOverride => setpoint_override(msg, reg),
        ControllerMode => controller_mode(msg),
        ZoneTemperature => zone_temperature(msg, reg),
        DateRequest => Ok(Decoded::row("Ping/Datetime Sync")),
        ZoneHeatDemand => zone_heat_demand(msg, reg),
        OpenTherm => opentherm::decode(msg),
        ActuatorCheckReq => actuator_check_req(msg),
        ActuatorState => actuator_state(msg),
    }
}

/// Commands we only observe: show the payload and its length.
fn payload_dump(msg: &ReceivedMessage) -> Decoded {
    Decoded {
        rows: vec![DisplayRow::with_suffix(
            format!("Payload: {}", msg.payload),
            format!("Payload length: {}", msg.payload_length),
        )],
        ..Decoded::default()
    }
}

fn sync(msg: &ReceivedMessage) -> Result<Decoded, DecodeError> {
    // The controller broadcasts FF followed by the time to the next sync
    // broadcast in tenths of a second.
    if msg.payload.len() >= 6 && &msg.payload[0..2] == "FF" {
        let timeout = super::hex_u16(&msg.payload[2..6])? as f64 / 10.0;
        let next = Utc::now() + Duration::milliseconds((timeout * 1000.0) as i64);
        Ok(Decoded::row(format!(
            "Next sync at {} (in {} secs)",
            next.format("%H:%M:%S"),
            timeout
        )))
    } else {
        Ok(Decoded::row(format!("Payload: {}", msg.payload)))
    }
}

fn setpoint(msg: &ReceivedMessage, reg: &Registry) -> Result<Decoded, DecodeError> {
    if msg.payload_length % 3 != 0 {
        return Err(DecodeError::PayloadLength {
            expected: "multiple of 3",
            actual: msg.payload_length,
        });
    }
    let mut out = Decoded::default();
    // The controller relays all zone setpoints in a single frame; suffix the
    // command label so those rows are distinguishable from a single zone's.
    let fact_name = if msg.payload_length > 3 {
        out.label_suffix = Some("_CTL");
        "setpoint_CTL"
    } else {
        "setpoint"
    };
    for block in payload_blocks(&msg.payload, 6) {
        let zone_id = hex_u8(&block[0..2])? as i32 + 1;
        let zone_name = reg.zone_name(zone_id);
        let mut sp = centi_u16(&block[2..6])?;
        // Manually switching a TRV off reports a setpoint around 325.
        let flag = if sp >= 300.0 {
            sp = 0.0;
            " *(Heating is OFF)"
        } else {
            ""
        };
        out.rows
            .push(DisplayRow::for_zone(format!("{:5.2}\u{00b0}C{}", sp, flag), zone_id));
        out.push_fact(&zone_name, fact_name, FactValue::Float(sp));
        out.push_fact(&zone_name, "zone_id", FactValue::Int(zone_id as i64));
    }
    Ok(out)
}

fn setpoint_override(msg: &ReceivedMessage, reg: &Registry) -> Result<Decoded, DecodeError> {
    if msg.payload_length != 7 && msg.payload_length != 13 {
        return Err(DecodeError::PayloadLength {
            expected: "7 or 13",
            actual: msg.payload_length,
        });
    }
    let zone = reg.zone_details(hex_u8(&msg.payload[0..2])?, None);
    let new_setpoint = centi_u16(&msg.payload[2..6])?;

    let mut out = Decoded::default();
    let until = if msg.payload_length == 13 {
        let dtm = packed_datetime_decode(&msg.payload[14..])?;
        out.push_fact(&zone.topic, "mode", FactValue::Text("Temporary".into()));
        out.push_fact(
            &zone.topic,
            "mode_until",
            FactValue::Text(dtm.format("%Y-%m-%dT%H:%M:%SZ").to_string()),
        );
        format!(" - Until {}", dtm)
    } else {
        out.push_fact(&zone.topic, "mode", FactValue::Text("Scheduled".into()));
        out.push_fact(&zone.topic, "mode_until", FactValue::Text(String::new()));
        String::new()
    };
    out.rows.push(DisplayRow {
        text: format!("{:5.2}\u{00b0}C", new_setpoint),
        zone: Some(zone.id),
        suffix: until,
    });
    out.push_fact(&zone.topic, "setpointOverride", FactValue::Float(new_setpoint));
    Ok(out)
}

fn setpoint_ufh(msg: &ReceivedMessage, reg: &Registry) -> Result<Decoded, DecodeError> {
    if msg.payload_length % 6 != 0 {
        return Err(DecodeError::PayloadLength {
            expected: "multiple of 6",
            actual: msg.payload_length,
        });
    }
    let mut out = Decoded::default();
    for block in payload_blocks(&msg.payload, 12) {
        let zone = reg.zone_details(hex_u8(&block[0..2])?, None);
        let sp = centi_u16(&block[2..6])?;
        // Map the underfloor sub-zone back to the controller zone it serves.
        let (zone_id, zone_name) = match reg.ufh_zone(zone.id) {
            Some((id, name)) => (id, name),
            None => (zone.id, format!("UFH Zone {}", zone.id)),
        };
        out.rows
            .push(DisplayRow::for_zone(format!("{:5.2}\u{00b0}C", sp), zone_id));
        out.push_fact(&zone_name, "setpoint", FactValue::Float(sp));
    }
    Ok(out)
}

fn zone_temperature(msg: &ReceivedMessage, reg: &Registry) -> Result<Decoded, DecodeError> {
    if msg.payload_length == 1 {
        return Ok(Decoded::row("Zone temperature requested"));
    }
    if msg.payload_length % 3 != 0 {
        return Err(DecodeError::PayloadLength {
            expected: "1 or multiple of 3",
            actual: msg.payload_length,
        });
    }
    let mut out = Decoded::default();
    for block in payload_blocks(&msg.payload, 6) {
        // The controller's multi-zone frames carry the zone in the block;
        // individual sensors are identified by the sending device.
        let zone_id = if msg.source == reg.controller_id {
            hex_u8(&block[0..2])? as i32 + 1
        } else {
            reg.device_zone(&msg.source).unwrap_or(0)
        };
        let temperature = centi_u16(&block[2..6])?;
        out.rows.push(DisplayRow::for_zone(
            format!("{:5.2}\u{00b0}C", temperature),
            zone_id,
        ));
        out.push_fact(
            format!("{}/{}", reg.zone_name(zone_id), msg.source_name),
            "temperature",
            FactValue::Float(temperature),
        );
    }
    Ok(out)
}

fn window_status(msg: &ReceivedMessage, reg: &Registry) -> Result<Decoded, DecodeError> {
    if msg.payload_length < 3 {
        return Err(DecodeError::PayloadLength {
            expected: "at least 3",
            actual: msg.payload_length,
        });
    }
    let zone = reg.zone_details(hex_u8(&msg.payload[0..2])?, None);
    let status = match hex_u8(&msg.payload[2..4])? {
        0x00 => "CLOSED".to_string(),
        0xC8 => "OPEN".to_string(),
        other => format!("Unknown ({})", other),
    };
    let mut out = Decoded::default();
    out.rows
        .push(DisplayRow::for_zone(format!("{:>7}", status), zone.id));
    out.push_fact(
        format!("{}/{}", zone.name, msg.source_name),
        "window_status",
        FactValue::Text(status),
    );
    Ok(out)
}

fn relay_heat_demand(msg: &ReceivedMessage, reg: &Registry) -> Result<Decoded, DecodeError> {
    // Demand sent by the controller for the F9/FA/FC relay circuits.
    if msg.payload_length != 2 {
        return Err(DecodeError::PayloadLength {
            expected: "2",
            actual: msg.payload_length,
        });
    }
    let zone = reg.zone_details(hex_u8(&msg.payload[0..2])?, Some(&msg.source_type));
    let demand = hex_u8(&msg.payload[2..4])? as f64;
    let pct = demand / 200.0 * 100.0;
    let mut out = Decoded::default();
    out.rows
        .push(DisplayRow::new(format!("{:>6.1}% @ {}", pct, zone.name)));
    out.push_fact(&zone.topic, "heat_demand", FactValue::Float(pct));
    Ok(out)
}

fn zone_heat_demand(msg: &ReceivedMessage, reg: &Registry) -> Result<Decoded, DecodeError> {
    if msg.payload_length % 2 != 0 {
        return Err(DecodeError::PayloadLength {
            expected: "multiple of 2",
            actual: msg.payload_length,
        });
    }
    let mut out = Decoded::default();
    for block in payload_blocks(&msg.payload, 4) {
        let zone = reg.zone_details(hex_u8(&block[0..2])?, None);
        let demand = hex_u8(&block[2..4])? as f64;
        let mut zone_id = zone.id;
        let mut topic = zone.topic.clone();

        // Demand can come from an individual TRV, so key the topic by zone
        // and device together.
        if zone_id <= 12 {
            topic = format!("{}/{}", topic, msg.source_name);
        }

        if msg.source_type == UFH_TYPE && zone_id <= 8 {
            // The sub-zone index is zero based on the wire; addressing tells
            // us whose numbering the frame uses.
            let ufh_zone_id = zone_id - 1;
            if msg.destination_type == CTL_TYPE {
                // Controller numbering: the zone details above already match.
                topic = zone.name.clone();
            } else if msg.is_broadcast() {
                match reg.ufh_zone(ufh_zone_id) {
                    Some((id, name)) => {
                        zone_id = id;
                        topic = format!("{}/{}", name, msg.source_name);
                    }
                    None => {
                        topic = format!("UFH Sub-Zone Id {}/{}", ufh_zone_id, msg.source_name);
                    }
                }
            } else {
                error!(
                    "Underfloor heat demand with unexpected destination {} ({}): {}",
                    msg.destination, msg.destination_type, msg.raw
                );
            }
        }

        let pct = demand / 200.0 * 100.0;
        out.rows
            .push(DisplayRow::for_zone(format!("{:6.1}%", pct), zone_id));
        if !topic.is_empty() {
            out.push_fact(&topic, "heat_demand", FactValue::Float(pct));
        }
    }
    Ok(out)
}

fn dhw_settings(msg: &ReceivedMessage) -> Result<Decoded, DecodeError> {
    if msg.payload_length != 6 {
        return Err(DecodeError::PayloadLength {
            expected: "6",
            actual: msg.payload_length,
        });
    }
    let device_number = hex_u8(&msg.payload[0..2])?;
    let setpoint = centi_u16(&msg.payload[2..6])?;
    let overrun = hex_u8(&msg.payload[6..8])?;
    let differential = centi_u16(&msg.payload[8..12])?;
    let reheat_trigger = setpoint - differential;
    Ok(Decoded {
        rows: vec![DisplayRow::with_suffix(
            format!(
                "DHW Setpoint: {}\u{00b0}C; Re-heat triggered at {}\u{00b0}C. (Overrun state: {})",
                setpoint, reheat_trigger, overrun
            ),
            format!("(Device: {})", device_number),
        )],
        ..Decoded::default()
    })
}

fn actuator_check_req(msg: &ReceivedMessage) -> Result<Decoded, DecodeError> {
    // Relays use this broadcast to align their demand duty cycles.
    if msg.payload_length != 2 {
        return Err(DecodeError::PayloadLength {
            expected: "2",
            actual: msg.payload_length,
        });
    }
    let device_number = hex_u8(&msg.payload[0..2])?;
    Ok(Decoded::row(format!(
        "Actuator time period sync request: {}",
        device_number
    )))
}

fn actuator_state(msg: &ReceivedMessage) -> Result<Decoded, DecodeError> {
    if msg.payload_length == 1 && msg.msg_type == MsgType::Request {
        return Ok(Decoded::row("Request actuator state update"));
    }
    if msg.payload_length % 3 != 0 {
        return Err(DecodeError::PayloadLength {
            expected: "multiple of 3",
            actual: msg.payload_length,
        });
    }
    let mut out = Decoded::default();
    if msg.source_type == OTB_TYPE && msg.payload_length == 6 {
        // The OpenTherm bridge reports modulation and flame status instead
        // of a binary relay state.
        let rel_modulation = hex_u8(&msg.payload[2..4])? as f64;
        let flame = if hex_u8(&msg.payload[6..8])? == 0x0A {
            "ON"
        } else {
            "OFF"
        };
        let status = format!(
            "{:5.0}%  : Relative modulation (Flame: {})",
            rel_modulation, flame
        );
        let topic = format!("relays/{}/actuator_state", msg.source_name);
        out.push_fact(&topic, "relative_modulation", FactValue::Float(rel_modulation));
        out.push_fact(&topic, "flame", FactValue::Text(flame.into()));
        out.rows.push(DisplayRow::new(format!("{:>7}", status)));
    } else {
        let status = match hex_u8(&msg.payload[2..4])? {
            0xC8 => "ON".to_string(),
            0x00 => "OFF".to_string(),
            other => format!("Unknown: {}", other),
        };
        out.rows.push(DisplayRow::new(format!("{:>7}", status)));
        out.push_fact(
            format!("relays/{}", msg.source_name),
            "actuator_status",
            FactValue::Text(status),
        );
    }
    Ok(out)
}

fn dhw_state(msg: &ReceivedMessage) -> Result<Decoded, DecodeError> {
    if msg.payload_length == 1
        && (msg.msg_type == MsgType::Request || msg.msg_type == MsgType::Info)
    {
        return Ok(Decoded::row(format!("Request sent: {}", msg.payload)));
    }
    if msg.payload_length != 6 && msg.payload_length != 12 {
        return Err(DecodeError::PayloadLength {
            expected: "6 or 12",
            actual: msg.payload_length,
        });
    }
    let state_id = hex_u8(&msg.payload[2..4])?;
    let mode_id = hex_u8(&msg.payload[4..6])?;

    if state_id == 0xFF {
        return Ok(Decoded::row(format!("{}: DHW not installed", msg.source)));
    }
    let state = match state_id {
        1 => "On".to_string(),
        0 => "Off".to_string(),
        other => format!("Unknown state: {}", other),
    };
    let mode = match mode_id {
        0 => "Auto".to_string(),
        4 => "Timed".to_string(),
        other => other.to_string(),
    };

    let mut out = Decoded::default();
    let (until, mode_until) = if msg.payload_length == 12 {
        let dtm = packed_datetime_decode(&msg.payload[12..])?;
        (
            format!(" - Until {}", dtm),
            dtm.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
        )
    } else {
        (String::new(), String::new())
    };
    out.rows.push(DisplayRow {
        text: format!("State: {}, mode: {}", state, mode),
        zone: None,
        suffix: until,
    });
    out.push_fact("DHW", "state", FactValue::Int(state_id as i64));
    out.push_fact("DHW", "mode", FactValue::Text(mode));
    out.push_fact("DHW", "mode_until", FactValue::Text(mode_until));
    Ok(out)
}

fn dhw_temperature(msg: &ReceivedMessage) -> Result<Decoded, DecodeError> {
    if msg.payload_length == 1 {
        // Outbound request echo
        return Ok(Decoded::default());
    }
    if msg.payload_length != 3 {
        return Err(DecodeError::PayloadLength {
            expected: "3",
            actual: msg.payload_length,
        });
    }
    let temperature = centi_u16(&msg.payload[2..6])?;
    let mut out = Decoded::default();
    out.rows
        .push(DisplayRow::new(format!("{:5.2}\u{00b0}C", temperature)));
    out.push_fact("DHW", "temperature", FactValue::Float(temperature));
    Ok(out)
}

fn boiler_setpoint(msg: &ReceivedMessage) -> Result<Decoded, DecodeError> {
    if msg.payload_length == 1 && msg.msg_type == MsgType::Request {
        return Ok(Decoded::row("Setpoint update request"));
    }
    if msg.payload_length != 3 {
        return Err(DecodeError::PayloadLength {
            expected: "3",
            actual: msg.payload_length,
        });
    }
    let setpoint = centi_u16(&msg.payload[2..6])?;
    let mut out = Decoded::row(format!("Boiler setpoint: {}", setpoint));
    out.push_fact(
        format!("Relays/{}", msg.source_name),
        "boiler_setpoint",
        FactValue::Float(setpoint),
    );
    Ok(out)
}

fn zone_info(msg: &ReceivedMessage, reg: &Registry) -> Result<Decoded, DecodeError> {
    if msg.payload_length % 6 != 0 {
        return Err(DecodeError::PayloadLength {
            expected: "multiple of 6",
            actual: msg.payload_length,
        });
    }
    let mut out = Decoded::default();
    for block in payload_blocks(&msg.payload, 12) {
        let zone = reg.zone_details(hex_u8(&block[0..2])?, None);
        let zone_flags = hex_u8(&block[2..4])?;
        let min_temperature = centi_u16(&block[4..8])?;
        let max_temperature = centi_u16(&block[8..12])?;
        out.rows.push(DisplayRow {
            text: format!(
                "Temp. range: {}\u{00b0}C to {}\u{00b0}C",
                min_temperature, max_temperature
            ),
            zone: Some(zone.id),
            suffix: format!("(Flags: {})", zone_flags),
        });
    }
    Ok(out)
}

fn language(msg: &ReceivedMessage) -> Result<Decoded, DecodeError> {
    // ISO 639 locale setting, e.g. "en" padded out with FF bytes.
    if msg.payload_length != 5 {
        return Err(DecodeError::PayloadLength {
            expected: "5",
            actual: msg.payload_length,
        });
    }
    if &msg.payload[0..2] != "00" || &msg.payload[8..10] != "FF" {
        return Err(DecodeError::Invalid(format!(
            "Invalid language payload '{}'",
            msg.payload
        )));
    }
    let iso_hex = if &msg.payload[4..6] != "FF" {
        &msg.payload[2..6]
    } else {
        &msg.payload[2..4]
    };
    let mut iso_code = String::new();
    for i in (0..iso_hex.len()).step_by(2) {
        let byte = hex_u8(&iso_hex[i..i + 2])?;
        if byte != 0x00 && byte != 0xFF {
            iso_code.push(byte as char);
        }
    }
    Ok(Decoded::row(format!("{} ({})", iso_code, iso_hex)))
}

fn fault_log(msg: &ReceivedMessage, reg: &Registry) -> Result<Decoded, DecodeError> {
    if msg.payload_length == 3 {
        // Third byte selects the zero-based log entry when requesting.
        return Ok(Decoded::row(format!(
            "System fault log entry '{}' requested",
            msg.payload
        )));
    }
    if msg.payload_length != 22 {
        return Err(DecodeError::PayloadLength {
            expected: "22",
            actual: msg.payload_length,
        });
    }

    let dtm = faultlog_datetime(&msg.payload[20..28])?;

    // The faulting device id is packed as 6-bit type + 18-bit serial.
    let dev_id_int: u32 = (hex_u8(&msg.payload[38..40])? as u32) << 16
        | (hex_u8(&msg.payload[40..42])? as u32) << 8
        | hex_u8(&msg.payload[42..44])? as u32;
    let dev_id = format!("{:02}:{:06}", (dev_id_int >> 18) & 0x3F, dev_id_int & 0x3FFFF);
    let device_name = reg.device_name(&dev_id);

    let fault_type_id = hex_u8(&msg.payload[2..4])?;
    let log_entry_number = hex_u8(&msg.payload[4..6])?;
    let fault_code = hex_u8(&msg.payload[8..10])?;
    let dev_num = hex_u8(&msg.payload[10..12])?;
    let device_type_id = hex_u8(&msg.payload[12..14])?;

    let fault_type = match fault_type_id {
        0x00 | 0xC0 => "Fault".to_string(),
        0x40 => "Restore".to_string(),
        other => format!("Unknown info type '{}'", other),
    };
    let fault = match fault_code {
        0x04 => "Battery Low".to_string(),
        0x06 => "Comms Fault".to_string(),
        0x0A => "Sensor Error".to_string(),
        other => format!("Unknown fault code '{}'", other),
    };
    let device_type = match device_type_id {
        0x00 => "CONTROLLER".to_string(),
        0x01 => "SENSOR".to_string(),
        0x04 => "TRV".to_string(),
        0x05 => "DHW".to_string(),
        other => format!("Unknown device type '{}'", other),
    };

    let mut out = Decoded::row(format!(
        "{}: {} [{} {}] {}: '{}' (Device ID: {})",
        log_entry_number,
        dtm.format("%Y-%m-%d %H:%M:%S"),
        device_type,
        device_name,
        fault_type,
        fault,
        dev_id
    ));
    out.push_fact(
        "_faults",
        log_entry_number.to_string(),
        FactValue::Json(json!({
            "device_type": device_type,
            "device_id": dev_id,
            "device_name": device_name,
            "device_num": dev_num,
            "fault_type": fault_type,
            "fault": fault,
            "event_ts": dtm.format("%Y-%m-%dT%H:%M:%S").to_string(),
            "index": log_entry_number,
        })),
    );
    Ok(out)
}

fn battery_info(msg: &ReceivedMessage, reg: &Registry) -> Result<Decoded, DecodeError> {
    if msg.payload_length != 3 {
        return Err(DecodeError::PayloadLength {
            expected: "3",
            actual: msg.payload_length,
        });
    }
    let device_id = hex_u8(&msg.payload[0..2])?;
    let raw_level = hex_u8(&msg.payload[2..4])?;
    let low_battery = u8::from_str_radix(&msg.payload[4..5], 16)
        .map_err(|_| DecodeError::BadHex(msg.payload[4..5].to_string()))?;
    let zone_id = reg.device_zone(&msg.source).unwrap_or(0);

    // Recode to a 0-100 scale; 0xFF means full rather than 127.5.
    let battery = if raw_level == 0xFF {
        100.0
    } else {
        raw_level as f64 / 2.0
    };

    let suffix = if low_battery != 0 {
        format!("- LOW BATTERY WARNING (device ID {})", device_id)
    } else {
        format!("(device ID {})", device_id)
    };
    let mut out = Decoded::default();
    out.rows.push(DisplayRow {
        text: format!("{:.1}%", battery),
        zone: Some(zone_id),
        suffix,
    });
    let topic = if zone_id == crate::registry::DHW_ZONE_ID {
        "dhw".to_string()
    } else {
        reg.zone_name(zone_id)
    };
    out.push_fact(
        format!("{}/{}", topic, msg.source_name),
        "battery",
        FactValue::Float(battery),
    );
    Ok(out)
}

fn controller_mode(msg: &ReceivedMessage) -> Result<Decoded, DecodeError> {
    if msg.payload_length != 8 {
        return Err(DecodeError::PayloadLength {
            expected: "8",
            actual: msg.payload_length,
        });
    }
    let mode_id = hex_u8(&msg.payload[0..2])?;
    let mode = controller_mode_name(mode_id)
        .map(str::to_string)
        .unwrap_or_else(|| format!("Unknown ({})", mode_id));
    let duration_code = hex_u8(&msg.payload[14..16])?;

    let until = if duration_code == 1 {
        let dtm = packed_datetime_decode(&msg.payload[2..14])?;
        format!(" [Until {}]", dtm)
    } else if mode_id != 0 {
        " - PERMANENT".to_string()
    } else {
        String::new()
    };
    let mut out = Decoded::default();
    out.rows.push(DisplayRow {
        text: format!("{} mode", mode),
        zone: None,
        suffix: until,
    });
    out.push_fact(&msg.source_name, "mode", FactValue::Text(mode));
    Ok(out)
}

/// Iterate the payload in fixed-size hex-character blocks, dropping a
/// trailing partial block.
fn payload_blocks(payload: &str, block_chars: usize) -> impl Iterator<Item = &str> {
    (0..payload.len() / block_chars).map(move |i| &payload[i * block_chars..(i + 1) * block_chars])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{frame, EMPTY_DEVICE_ID};
    use crate::registry::Registry;

    fn reg() -> Registry {
        let mut r = Registry::empty("01:139901", "18:318170");
        r.insert_device("04:111111", "Living Room TRV", 3, true);
        r.insert_device("34:222222", "Kitchen Sensor", 5, true);
        r
    }

    fn build(code: &str, payload: &str, source: &str, dest: &str) -> ReceivedMessage {
        let line = format!(
            "---  I --- {} {} {} {} {:03} {}",
            source,
            EMPTY_DEVICE_ID,
            dest,
            code,
            payload.len() / 2,
            payload
        );
        frame::parse_line(&line, None, &reg()).unwrap()
    }

    #[test]
    fn command_table_is_bijective() {
        for code in [
            "0002", "0004", "0006", "0008", "000A", "0100", "0418", "1060", "10A0", "10E0",
            "1260", "12B0", "1F09", "1F41", "1FC9", "1FD4", "22C9", "22D9", "2309", "2349",
            "2E04", "30C9", "313F", "3150", "3220", "3B00", "3EF0",
        ] {
            let kind = CommandKind::from_code(code).unwrap();
            assert_eq!(kind.code(), code);
            assert_eq!(CommandKind::from_name(kind.name()), Some(kind));
        }
        assert!(CommandKind::from_code("FFFF").is_none());
        assert_eq!(
            CommandKind::from_name("ping"),
            Some(CommandKind::DateRequest)
        );
    }

    #[test]
    fn zone_temperature_from_sensor_uses_device_zone() {
        let msg = build("30C9", "00083C", "04:111111", "01:139901");
        let out = decode(CommandKind::ZoneTemperature, &msg, &reg()).unwrap();
        assert_eq!(out.rows[0].text, "21.08\u{00b0}C");
        assert_eq!(out.rows[0].zone, Some(3));
        assert_eq!(out.facts.len(), 1);
        assert_eq!(out.facts[0].topic, "Living Room TRV/Living Room TRV");
        assert_eq!(out.facts[0].value, FactValue::Float(21.08));
    }

    #[test]
    fn zone_temperature_from_controller_reads_zone_from_block() {
        let msg = build("30C9", "0208340307D0", "01:139901", "01:139901");
        let out = decode(CommandKind::ZoneTemperature, &msg, &reg()).unwrap();
        assert_eq!(out.rows[0].zone, Some(3));
        assert_eq!(out.rows[1].zone, Some(4));
        assert_eq!(out.facts[1].value, FactValue::Float(20.0));
    }

    #[test]
    fn setpoint_stride_violation_is_rejected() {
        let msg = build("2309", "02083403", "01:139901", "01:139901");
        let err = decode(CommandKind::Setpoint, &msg, &reg()).unwrap_err();
        assert!(matches!(err, DecodeError::PayloadLength { actual: 4, .. }));
    }

    #[test]
    fn multi_zone_setpoint_gets_controller_label() {
        let msg = build("2309", "020834030802", "01:139901", "01:139901");
        let out = decode(CommandKind::Setpoint, &msg, &reg()).unwrap();
        assert_eq!(out.label_suffix, Some("_CTL"));
        assert_eq!(out.facts[0].name, "setpoint_CTL");
        assert_eq!(out.facts[1].name, "zone_id");
        assert_eq!(out.facts[1].value, FactValue::Int(3));
    }

    #[test]
    fn trv_off_sentinel_reports_zero_setpoint() {
        // 0x7EF4 = 325.00, the value a TRV reports when switched off
        let msg = build("2309", "027EF4", "04:111111", "01:139901");
        let out = decode(CommandKind::Setpoint, &msg, &reg()).unwrap();
        assert!(out.rows[0].text.ends_with("*(Heating is OFF)"));
        assert_eq!(out.facts[0].value, FactValue::Float(0.0));
    }

    #[test]
    fn setpoint_override_with_until_is_temporary() {
        // zone 3 (byte 02), 21.50, mode 4, until 2026-03-01 22:00
        let msg = build("2349", "02086604FFFFFF0016010307EA", "01:139901", "01:139901");
        let out = decode(CommandKind::SetpointOverride, &msg, &reg()).unwrap();
        assert_eq!(out.facts[0].name, "mode");
        assert_eq!(out.facts[0].value, FactValue::Text("Temporary".into()));
        assert_eq!(
            out.facts[1].value,
            FactValue::Text("2026-03-01T22:00:00Z".into())
        );
        assert_eq!(out.facts[2].name, "setpointOverride");
        assert_eq!(out.facts[2].value, FactValue::Float(21.5));
    }

    #[test]
    fn window_status_decodes_open() {
        let msg = build("12B0", "02C800", "04:111111", "01:139901");
        let out = decode(CommandKind::WindowStatus, &msg, &reg()).unwrap();
        assert_eq!(out.rows[0].zone, Some(3));
        assert_eq!(out.facts[0].name, "window_status");
        assert_eq!(out.facts[0].value, FactValue::Text("OPEN".into()));
    }

    #[test]
    fn relay_heat_demand_maps_boiler_sentinel() {
        let msg = build("0008", "FC64", "01:139901", "01:139901");
        let out = decode(CommandKind::RelayHeatDemand, &msg, &reg()).unwrap();
        assert_eq!(out.facts[0].topic, "Relays/BDR Boiler Relay");
        assert_eq!(out.facts[0].value, FactValue::Float(50.0));
    }

    #[test]
    fn battery_full_sentinel_reads_100() {
        let msg = build("1060", "00FF01", "04:111111", "01:139901");
        let out = decode(CommandKind::BatteryInfo, &msg, &reg()).unwrap();
        assert_eq!(out.facts[0].value, FactValue::Float(100.0));
        assert_eq!(out.facts[0].topic, "Living Room TRV/Living Room TRV");
    }

    #[test]
    fn dhw_state_timed_with_until() {
        let msg = build("1F41", "000104FFFFFF0016010307EA", "01:139901", "01:139901");
        let out = decode(CommandKind::DhwState, &msg, &reg()).unwrap();
        assert_eq!(out.facts[0].value, FactValue::Int(1));
        assert_eq!(out.facts[1].value, FactValue::Text("Timed".into()));
        assert_eq!(
            out.facts[2].value,
            FactValue::Text("2026-03-01T22:00:00Z".into())
        );
    }

    #[test]
    fn controller_mode_away_permanent() {
        let msg = build("2E04", "03FFFFFFFFFFFF00", "01:139901", "01:139901");
        let out = decode(CommandKind::ControllerMode, &msg, &reg()).unwrap();
        assert_eq!(out.rows[0].text, "Away mode");
        assert_eq!(out.rows[0].suffix, " - PERMANENT");
        assert_eq!(out.facts[0].value, FactValue::Text("Away".into()));
    }

    #[test]
    fn language_decodes_iso_code() {
        let msg = build("0100", "00656EFFFF", "01:139901", "01:139901");
        let out = decode(CommandKind::Language, &msg, &reg()).unwrap();
        assert_eq!(out.rows[0].text, "en (656E)");
    }

    #[test]
    fn fault_log_entry_publishes_json() {
        // Entry 0: battery low fault on a TRV, 2020-06-15 10:30:44,
        // device 04:111111
        let packed: u64 = (20u64 << 24) | (6u64 << 36) | (15u64 << 31)
            | (10u64 << 19) | (30u64 << 13) | (44u64 << 7);
        let dev: u32 = (4u32 << 18) | 111111;
        let payload = format!(
            "00C00000040004000000{:08X}0000000000{:06X}",
            packed >> 8,
            dev
        );
        assert_eq!(payload.len(), 44);
        let msg = build("0418", &payload, "01:139901", "01:139901");
        let out = decode(CommandKind::FaultLog, &msg, &reg()).unwrap();
        assert_eq!(out.facts[0].topic, "_faults");
        assert_eq!(out.facts[0].name, "0");
        match &out.facts[0].value {
            FactValue::Json(v) => {
                assert_eq!(v["fault"], "Battery Low");
                assert_eq!(v["fault_type"], "Fault");
                assert_eq!(v["device_type"], "TRV");
                assert_eq!(v["device_id"], "04:111111");
                assert_eq!(v["event_ts"], "2020-06-15T10:30:44");
            }
            other => panic!("expected json fact, got {:?}", other),
        }
    }

    #[test]
    fn actuator_state_relay_on() {
        let msg = build("3EF0", "00C8FF", "13:444444", "01:139901");
        let out = decode(CommandKind::ActuatorState, &msg, &reg()).unwrap();
        assert_eq!(out.facts[0].name, "actuator_status");
        assert_eq!(out.facts[0].value, FactValue::Text("ON".into()));
    }
}
