//! Building outbound commands from control instructions.
//!
//! Instructions arrive as JSON on the command topic. The command is named
//! either by its lowercase name or its hex code; a handful of commands take
//! structured arguments that are packed into payloads here, everything else
//! defaults to an empty request or a caller-supplied raw payload.

use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::config::SenderConfig;
use crate::registry::Registry;

use super::datetime::parse_until;
use super::decode::{CommandKind, controller_mode_name};
use super::{Command, MsgType, EMPTY_DEVICE_ID};

/// A send instruction as read off the command topic.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CommandRequest {
    /// Lowercase command name; takes priority over `command_code`.
    pub command: Option<String>,
    /// Hex code, accepted as either a string ("313F") or an integer.
    pub command_code: Option<Value>,
    #[serde(default)]
    pub arguments: Map<String, Value>,
    pub send_mode: Option<String>,
    pub wait_for_ack: Option<bool>,
    pub reset_ports_on_fail: Option<bool>,
}

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("Instruction names neither a command nor a command code")]
    MissingCommand,
    #[error("Unrecognised command name '{0}'")]
    UnknownName(String),
    #[error("Invalid command code '{0}'")]
    BadCode(String),
    #[error("Missing required argument '{0}'")]
    MissingArgument(&'static str),
    #[error("Invalid argument '{name}': {detail}")]
    BadArgument { name: &'static str, detail: String },
    #[error("Invalid send mode '{0}'")]
    BadSendMode(String),
}

/// Resolve an instruction into a ready-to-transmit [`Command`].
pub fn build_command(
    req: &CommandRequest,
    reg: &Registry,
    sender: &SenderConfig,
    instruction: String,
) -> Result<Command, EncodeError> {
    let (kind, code) = resolve(req)?;
    let name = kind.map(|k| k.name().to_string());

    let explicit_mode = match &req.send_mode {
        Some(s) => Some(MsgType::parse(s).ok_or_else(|| EncodeError::BadSendMode(s.clone()))?),
        None => None,
    };

    let args = &req.arguments;
    let (payload, default_mode, arg_desc) = if let Some(raw) = args.get("payload") {
        let payload = raw
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| raw.to_string());
        (payload, MsgType::Info, "[]".to_string())
    } else {
        match kind {
            Some(CommandKind::DhwState) => dhw_state_payload(args)?,
            Some(CommandKind::DateRequest) => {
                ("00".to_string(), MsgType::Request, "[]".to_string())
            }
            Some(CommandKind::FaultLog) => {
                // Default to the most recent log entry
                ("000000".to_string(), MsgType::Request, "[]".to_string())
            }
            Some(CommandKind::ControllerMode) => controller_mode_payload(args)?,
            Some(CommandKind::SetpointOverride) => setpoint_override_payload(args, reg)?,
            _ => (String::new(), MsgType::Request, "[]".to_string()),
        }
    };
    let send_mode = explicit_mode.unwrap_or(default_mode);

    let dev1 = arg_device(args, "dev1").unwrap_or_else(|| sender.gateway_id.clone());
    let dev2 = arg_device(args, "dev2").unwrap_or_else(|| sender.controller_id.clone());
    let dev3 = arg_device(args, "dev3").unwrap_or_else(|| EMPTY_DEVICE_ID.to_string());

    Ok(Command {
        code,
        name,
        destination: dev2.clone(),
        dev1,
        dev2,
        dev3,
        send_mode,
        payload,
        arg_desc,
        instruction,
        wait_for_ack: req.wait_for_ack.unwrap_or(sender.resend_attempts > 0),
        reset_ports_on_fail: req
            .reset_ports_on_fail
            .unwrap_or(sender.auto_reset_ports_on_failure),
        retries: 0,
        first_sent: None,
        last_retry: None,
        acknowledged: None,
        failed: false,
    })
}

/// Resolve name/code into the table entry and the wire code. A name must be
/// known; an unknown code is passed through so raw payloads can exercise
/// undecoded commands.
fn resolve(req: &CommandRequest) -> Result<(Option<CommandKind>, String), EncodeError> {
    if let Some(name) = req.command.as_deref().filter(|n| !n.is_empty()) {
        let kind =
            CommandKind::from_name(name).ok_or_else(|| EncodeError::UnknownName(name.into()))?;
        return Ok((Some(kind), kind.code().to_string()));
    }
    let code = match &req.command_code {
        Some(Value::String(s)) => s.to_uppercase().replace("0X", ""),
        Some(Value::Number(n)) => match n.as_u64() {
            Some(v) => format!("{:04X}", v),
            None => return Err(EncodeError::BadCode(n.to_string())),
        },
        Some(other) => return Err(EncodeError::BadCode(other.to_string())),
        None => return Err(EncodeError::MissingCommand),
    };
    if code.len() != 4 || !code.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(EncodeError::BadCode(code));
    }
    Ok((CommandKind::from_code(&code), code))
}

fn arg_device(args: &Map<String, Value>, key: &str) -> Option<String> {
    args.get(key).and_then(Value::as_str).map(str::to_string)
}

fn arg_i64(args: &Map<String, Value>, name: &'static str) -> Result<i64, EncodeError> {
    args.get(name)
        .ok_or(EncodeError::MissingArgument(name))?
        .as_i64()
        .ok_or(EncodeError::BadArgument {
            name,
            detail: "expected an integer".to_string(),
        })
}

/// Validate and re-pack an `until` argument for the wire.
fn arg_until(args: &Map<String, Value>) -> Result<Option<(String, String)>, EncodeError> {
    let Some(value) = args.get("until") else {
        return Ok(None);
    };
    let text = value.as_str().ok_or(EncodeError::BadArgument {
        name: "until",
        detail: "expected a timestamp string".to_string(),
    })?;
    let dtm = parse_until(text).map_err(|e| EncodeError::BadArgument {
        name: "until",
        detail: e.to_string(),
    })?;
    Ok(Some((
        super::datetime::packed_datetime_encode(&dtm.naive_utc()),
        text.to_string(),
    )))
}

fn dhw_state_payload(
    args: &Map<String, Value>,
) -> Result<(String, MsgType, String), EncodeError> {
    let state_id = arg_i64(args, "state_id")?;
    let until = arg_until(args)?;
    let state_desc = if state_id == 1 { "ON" } else { "OFF" };

    let (mode_id, until_hex, arg_desc) = match &until {
        Some((hex, text)) => (4, hex.clone(), format!("[{} until {}]", state_desc, text)),
        None => {
            // Revert to auto unless a mode was given
            let mode_id = args.get("mode_id").and_then(Value::as_i64).unwrap_or(0);
            (mode_id, String::new(), format!("[{}]", state_desc))
        }
    };
    let payload = format!("00{:02X}{:02X}FFFFFF{}", state_id, mode_id, until_hex);
    Ok((payload, MsgType::Write, arg_desc))
}

fn controller_mode_payload(
    args: &Map<String, Value>,
) -> Result<(String, MsgType, String), EncodeError> {
    let mode_id = arg_i64(args, "mode")?;
    let mode_name = controller_mode_name(mode_id as u8).unwrap_or("Unknown");
    let until = arg_until(args)?;

    let (duration_code, until_hex, arg_desc) = match &until {
        Some((hex, text)) => (1, hex.clone(), format!("[{} until {}]", mode_name, text)),
        None => (0, "FFFFFFFFFFFF".to_string(), mode_name.to_string()),
    };
    let payload = format!("{:02X}{}{:02X}", mode_id, until_hex, duration_code);
    Ok((payload, MsgType::Write, arg_desc))
}

fn setpoint_override_payload(
    args: &Map<String, Value>,
    reg: &Registry,
) -> Result<(String, MsgType, String), EncodeError> {
    let zone_id = arg_i64(args, "zone_id")?;
    if !(1..=12).contains(&zone_id) {
        return Err(EncodeError::BadArgument {
            name: "zone_id",
            detail: format!("{} is outside 1..=12", zone_id),
        });
    }
    let setpoint = args
        .get("setpoint")
        .ok_or(EncodeError::MissingArgument("setpoint"))?
        .as_f64()
        .ok_or(EncodeError::BadArgument {
            name: "setpoint",
            detail: "expected a number".to_string(),
        })?;
    if !setpoint.is_finite() || !(0.0..=35.0).contains(&setpoint) {
        return Err(EncodeError::BadArgument {
            name: "setpoint",
            detail: format!("{} is outside 0..=35 degC", setpoint),
        });
    }
    let until = arg_until(args)?;
    let permanent = args
        .get("mode")
        .and_then(Value::as_str)
        .map(|m| m != "temporary")
        .unwrap_or(true);
    let zone_desc = reg.zone_name(zone_id as i32);

    // Modes: 0 auto, 1 temporary until next schedule change, 2 permanent,
    // 4 temporary until a given time. Setpoint 0 reverts to the schedule.
    let (mode, until_hex, arg_desc) = match &until {
        Some((hex, text)) => (
            4,
            hex.clone(),
            format!("['{}': {} degC until {}]", zone_desc, setpoint, text),
        ),
        None if setpoint > 0.0 => (
            if permanent { 2 } else { 1 },
            String::new(),
            format!("['{}': {} deg C]", zone_desc, setpoint),
        ),
        None => (0, String::new(), format!("['{}': {} deg C]", zone_desc, setpoint)),
    };
    let payload = format!(
        "{:02X}{:04X}{:02X}FFFFFF{}",
        zone_id - 1,
        (setpoint * 100.0) as u16,
        mode,
        until_hex
    );
    Ok((payload, MsgType::Write, arg_desc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::decode::{self, CommandKind};
    use crate::protocol::frame;
    use crate::protocol::FactValue;

    fn sender() -> SenderConfig {
        SenderConfig::default()
    }

    fn reg() -> Registry {
        let mut r = Registry::empty("01:139901", "18:318170");
        r.insert_device("04:111111", "Living Room", 3, true);
        r
    }

    fn request(json: &str) -> CommandRequest {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn name_takes_priority_over_code() {
        let req = request(r#"{"command": "date_request", "command_code": "2349"}"#);
        let cmd = build_command(&req, &reg(), &sender(), String::new()).unwrap();
        assert_eq!(cmd.code, "313F");
        assert_eq!(cmd.payload, "00");
        assert_eq!(cmd.send_mode, MsgType::Request);
        assert_eq!(cmd.dev1, "18:318170");
        assert_eq!(cmd.dev2, "01:139901");
        assert_eq!(cmd.destination, "01:139901");
    }

    #[test]
    fn numeric_command_code_is_accepted() {
        let req = request(r#"{"command_code": 12607}"#); // 0x313F
        let cmd = build_command(&req, &reg(), &sender(), String::new()).unwrap();
        assert_eq!(cmd.code, "313F");
    }

    #[test]
    fn missing_command_is_rejected() {
        let req = request(r#"{"arguments": {}}"#);
        assert!(matches!(
            build_command(&req, &reg(), &sender(), String::new()),
            Err(EncodeError::MissingCommand)
        ));
    }

    #[test]
    fn raw_payload_defaults_to_broadcast_mode() {
        let req = request(r#"{"command_code": "1FC9", "arguments": {"payload": "00FFFF"}}"#);
        let cmd = build_command(&req, &reg(), &sender(), String::new()).unwrap();
        assert_eq!(cmd.send_mode, MsgType::Info);
        assert_eq!(cmd.payload, "00FFFF");
    }

    #[test]
    fn fault_log_requests_latest_entry() {
        let req = request(r#"{"command": "fault_log"}"#);
        let cmd = build_command(&req, &reg(), &sender(), String::new()).unwrap();
        assert_eq!(cmd.code, "0418");
        assert_eq!(cmd.payload, "000000");
        assert_eq!(cmd.send_mode, MsgType::Request);
    }

    #[test]
    fn controller_mode_away_until() {
        let req = request(
            r#"{"command": "controller_mode",
                "arguments": {"mode": 3, "until": "2026-03-01T22:00:00Z"}}"#,
        );
        let cmd = build_command(&req, &reg(), &sender(), String::new()).unwrap();
        assert_eq!(cmd.send_mode, MsgType::Write);
        assert_eq!(cmd.payload, "030016010307EA01");
        assert!(cmd.arg_desc.contains("Away until"));
    }

    #[test]
    fn setpoint_override_roundtrips_through_decoder() {
        let req = request(
            r#"{"command": "setpoint_override",
                "arguments": {"zone_id": 3, "setpoint": 21.5}}"#,
        );
        let r = reg();
        let cmd = build_command(&req, &r, &sender(), String::new()).unwrap();
        assert_eq!(cmd.send_mode, MsgType::Write);
        assert_eq!(cmd.payload, "02086602FFFFFF");

        // Feed the assembled frame back through the receive path.
        let msg = frame::parse_line(&cmd.frame_text(), None, &r).unwrap();
        assert_eq!(msg.command_code, "2349");
        let out = decode::decode(CommandKind::SetpointOverride, &msg, &r).unwrap();
        let sp = out
            .facts
            .iter()
            .find(|f| f.name == "setpointOverride")
            .unwrap();
        assert_eq!(sp.value, FactValue::Float(21.5));
        assert_eq!(out.rows[0].zone, Some(3));
    }

    #[test]
    fn setpoint_override_rejects_out_of_range_arguments() {
        // Zone ids are 1-based; zone 0 would wrap to 0xFF on the wire.
        let req = request(
            r#"{"command": "setpoint_override",
                "arguments": {"zone_id": 0, "setpoint": 21.5}}"#,
        );
        assert!(matches!(
            build_command(&req, &reg(), &sender(), String::new()),
            Err(EncodeError::BadArgument { name: "zone_id", .. })
        ));

        let req = request(
            r#"{"command": "setpoint_override",
                "arguments": {"zone_id": 3, "setpoint": -5.0}}"#,
        );
        assert!(matches!(
            build_command(&req, &reg(), &sender(), String::new()),
            Err(EncodeError::BadArgument { name: "setpoint", .. })
        ));

        let req = request(
            r#"{"command": "setpoint_override",
                "arguments": {"zone_id": 3, "setpoint": 99.0}}"#,
        );
        assert!(matches!(
            build_command(&req, &reg(), &sender(), String::new()),
            Err(EncodeError::BadArgument { name: "setpoint", .. })
        ));
    }

    #[test]
    fn dhw_state_on_until() {
        let req = request(
            r#"{"command": "dhw_state",
                "arguments": {"state_id": 1, "until": "2026-03-01T22:00:00Z"}}"#,
        );
        let cmd = build_command(&req, &reg(), &sender(), String::new()).unwrap();
        assert_eq!(cmd.payload, "000104FFFFFF0016010307EA");
        assert_eq!(cmd.send_mode, MsgType::Write);
        assert_eq!(cmd.arg_desc, "[ON until 2026-03-01T22:00:00Z]");
    }

    #[test]
    fn ack_waiting_follows_retry_config_default() {
        let req = request(r#"{"command": "date_request"}"#);
        let cmd = build_command(&req, &reg(), &sender(), String::new()).unwrap();
        assert_eq!(cmd.wait_for_ack, sender().resend_attempts > 0);

        let req = request(r#"{"command": "date_request", "wait_for_ack": false}"#);
        let cmd = build_command(&req, &reg(), &sender(), String::new()).unwrap();
        assert!(!cmd.wait_for_ack);
    }
}
