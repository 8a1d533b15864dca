//! MQTT broker connection: fact publishing and the inbound control topic.
//!
//! Decoded readings are published retained under the configured root, each
//! with a `_ts` companion topic carrying the publish time. A single
//! subscription on the command topic receives JSON instructions, parsed
//! here and handed to the gateway loop over a channel.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use log::{debug, error, info, warn};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::config::{MqttConfig, SenderConfig};
use crate::protocol::encode::CommandRequest;
use crate::protocol::{Command, Fact};
use crate::registry::device_type_name;

/// Instruction received on the command topic.
#[derive(Debug)]
pub enum ControlRequest {
    /// `{"sys_config": "reset_com_ports"}`
    ResetComPorts,
    /// `{"sys_config": "cancel_commands"}`
    CancelCommands,
    /// A command to transmit, with the original instruction text.
    Send(Box<CommandRequest>, String),
}

/// Shape of the control JSON before deciding which request it is.
#[derive(Deserialize)]
struct ControlJson {
    sys_config: Option<String>,
    #[serde(flatten)]
    command: CommandRequest,
}

/// Parse one control topic payload.
pub fn parse_control(payload: &str) -> Result<ControlRequest> {
    let parsed: ControlJson =
        serde_json::from_str(payload).context("control instruction is not valid JSON")?;
    if let Some(sys) = parsed.sys_config {
        return match sys.as_str() {
            "reset_com_ports" => Ok(ControlRequest::ResetComPorts),
            "cancel_commands" => Ok(ControlRequest::CancelCommands),
            other => anyhow::bail!("system configuration command '{}' not recognised", other),
        };
    }
    if parsed.command.command.is_none() && parsed.command.command_code.is_none() {
        anyhow::bail!("instruction names neither a command nor a command code");
    }
    Ok(ControlRequest::Send(
        Box::new(parsed.command),
        payload.to_string(),
    ))
}

/// Lowercase a topic segment, dropping apostrophes and replacing spaces.
pub fn to_snake(name: &str) -> String {
    name.trim()
        .replace('\'', "")
        .replace(' ', "_")
        .replace("__", "_")
        .to_lowercase()
}

pub struct MqttHandle {
    /// `None` when no broker is configured; the gateway then runs as a
    /// pure listener and all publish calls are no-ops.
    client: Option<AsyncClient>,
    pub_topic: String,
    sub_topic: String,
    sent_command_topic: String,
    connected: Arc<Mutex<bool>>,
}

impl MqttHandle {
    /// Connect to the broker and start the event loop task. Control
    /// instructions arrive on the returned channel. An empty server
    /// address yields a disconnected handle and a channel that never
    /// carries anything.
    pub async fn connect(
        cfg: &MqttConfig,
        sender: &SenderConfig,
    ) -> Result<(MqttHandle, mpsc::Receiver<ControlRequest>)> {
        let gateway_type = device_type_name(
            sender.gateway_id.split(':').next().unwrap_or(""),
        )
        .unwrap_or("GWAY");
        let sent_command_topic = to_snake(&format!(
            "{}/{}_{}/sent_command",
            cfg.pub_topic, gateway_type, sender.gateway_name
        ));

        if cfg.server.is_empty() {
            info!("No MQTT broker configured, running as listener only");
            let (_tx, rx) = mpsc::channel(1);
            return Ok((
                MqttHandle {
                    client: None,
                    pub_topic: cfg.pub_topic.clone(),
                    sub_topic: cfg.sub_topic.clone(),
                    sent_command_topic,
                    connected: Arc::new(Mutex::new(false)),
                },
                rx,
            ));
        }

        let mut options = MqttOptions::new(&cfg.client_id, &cfg.server, cfg.port);
        options.set_keep_alive(Duration::from_secs(30));
        if !cfg.user.is_empty() {
            options.set_credentials(&cfg.user, &cfg.password);
        }

        let (client, mut eventloop) = AsyncClient::new(options, 32);
        let connected = Arc::new(Mutex::new(false));
        let (tx, rx) = mpsc::channel(32);

        let handle = MqttHandle {
            client: Some(client.clone()),
            pub_topic: cfg.pub_topic.clone(),
            sub_topic: cfg.sub_topic.clone(),
            sent_command_topic,
            connected: connected.clone(),
        };

        let sub_topic = cfg.sub_topic.clone();
        let server = cfg.server.clone();
        tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("Connected to MQTT broker at {}", server);
                        *connected.lock().unwrap() = true;
                        if let Err(e) = client.subscribe(&sub_topic, QoS::AtMostOnce).await {
                            error!("MQTT subscribe to '{}' failed: {}", sub_topic, e);
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        if publish.topic != sub_topic || publish.payload.is_empty() {
                            continue;
                        }
                        let payload = String::from_utf8_lossy(&publish.payload).to_string();
                        debug!("MQTT_SUB {}", payload);
                        match parse_control(&payload) {
                            Ok(request) => {
                                if tx.send(request).await.is_err() {
                                    // Gateway loop is gone, stop the task
                                    return;
                                }
                            }
                            Err(e) => warn!("Ignoring control instruction: {:#}", e),
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        *connected.lock().unwrap() = false;
                        warn!("MQTT connection error: {}, retrying in 5s", e);
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                }
            }
        });

        Ok((handle, rx))
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.lock().unwrap()
    }

    fn timestamp() -> String {
        Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
    }

    /// Publish retained under an absolute topic, without a `_ts` companion.
    pub async fn publish_raw(&self, topic: &str, value: impl Into<String>) {
        let Some(client) = &self.client else {
            return;
        };
        if let Err(e) = client
            .publish(topic, QoS::AtMostOnce, true, value.into())
            .await
        {
            warn!("MQTT publish to '{}' failed: {}", topic, e);
        }
    }

    async fn publish_with_ts(&self, topic: &str, value: String) {
        self.publish_raw(topic, value).await;
        self.publish_raw(&format!("{}_ts", topic), Self::timestamp())
            .await;
    }

    /// Publish one decoded fact and its timestamp companion.
    pub async fn publish_fact(&self, fact: &Fact) {
        if self.client.is_none() {
            return;
        }
        if !self.is_connected() {
            warn!("MQTT publish skipped as client is not connected to broker");
            return;
        }
        let topic = format!(
            "{}/{}/{}",
            self.pub_topic,
            to_snake(&fact.topic),
            fact.name.trim()
        );
        self.publish_with_ts(&topic, fact.value.render()).await;
    }

    /// Publish the status block after a command transmission, and clear the
    /// retained instruction off the command topic. Expects the command to
    /// have been stamped with [`Command::mark_sent`] already.
    pub async fn publish_command_sent(&self, cmd: &Command) {
        if self.client.is_none() {
            return;
        }
        if !self.is_connected() {
            warn!("Client not connected to MQTT broker. No command status messages posted");
            return;
        }
        let base = &self.sent_command_topic;
        // Reset failure state first so watchers never see a stale failure
        // paired with the new command.
        self.publish_raw(&format!("{}/failed", base), "false").await;
        self.publish_raw(&format!("{}/retries", base), (cmd.retries - 1).to_string())
            .await;
        self.publish_raw(&format!("{}/retry_ts", base), "").await;
        self.publish_raw(&format!("{}/ack", base), "false").await;
        self.publish_raw(
            &format!("{}/command", base),
            format!("{} {}", cmd.display_name(), cmd.arg_desc),
        )
        .await;
        self.publish_raw(&format!("{}/evo_msg", base), cmd.frame_text())
            .await;
        self.publish_raw(&format!("{}/org_instruction", base), cmd.instruction.clone())
            .await;
        self.publish_raw(&self.sub_topic, "").await;
        if cmd.retries == 1 {
            self.publish_raw(&format!("{}/initial_sent_ts", base), Self::timestamp())
                .await;
        } else {
            self.publish_raw(&format!("{}/last_retry_ts", base), Self::timestamp())
                .await;
        }
    }

    /// Mark the in-flight command acknowledged.
    pub async fn publish_command_ack(&self) {
        let base = &self.sent_command_topic;
        self.publish_with_ts(&format!("{}/failed", base), "false".to_string())
            .await;
        self.publish_raw(&format!("{}/ack", base), "true").await;
    }

    /// Mark the in-flight command failed.
    pub async fn publish_command_failed(&self) {
        let base = &self.sent_command_topic;
        self.publish_with_ts(&format!("{}/failed", base), "true".to_string())
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn to_snake_flattens_zone_names() {
        assert_eq!(to_snake("Living Room"), "living_room");
        assert_eq!(to_snake("Relays/BDR Boiler Relay"), "relays/bdr_boiler_relay");
        assert_eq!(to_snake("Chloe's Room"), "chloes_room");
        assert_eq!(to_snake("  DHW "), "dhw");
    }

    #[test]
    fn control_sys_config_commands() {
        assert!(matches!(
            parse_control(r#"{"sys_config": "reset_com_ports"}"#).unwrap(),
            ControlRequest::ResetComPorts
        ));
        assert!(matches!(
            parse_control(r#"{"sys_config": "cancel_commands"}"#).unwrap(),
            ControlRequest::CancelCommands
        ));
        assert!(parse_control(r#"{"sys_config": "reboot"}"#).is_err());
    }

    #[test]
    fn control_send_instruction_keeps_original_text() {
        let text = r#"{"command": "setpoint_override", "arguments": {"zone_id": 3, "setpoint": 21.5}}"#;
        match parse_control(text).unwrap() {
            ControlRequest::Send(req, instruction) => {
                assert_eq!(req.command.as_deref(), Some("setpoint_override"));
                assert_eq!(req.arguments["zone_id"], 3);
                assert_eq!(instruction, text);
            }
            other => panic!("expected a send request, got {:?}", other),
        }
    }

    #[test]
    fn control_rejects_empty_instruction() {
        assert!(parse_control(r#"{"arguments": {}}"#).is_err());
        assert!(parse_control("not json").is_err());
    }
}
