//! The gateway runtime: serial links, the poll loop, and the wiring between
//! frame decoding, the broker and the send queue.

pub mod dedup;
pub mod sendq;

use std::io::{Read, Write};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use log::{debug, error, info, warn};
use serialport::SerialPort;
use tokio::sync::mpsc;
use tokio::time::sleep;

use crate::config::{Config, SerialPortConfig};
use crate::logutil::{display_row, escape_log};
use crate::mqtt::{ControlRequest, MqttHandle};
use crate::protocol::decode::{self, CommandKind};
use crate::protocol::encode::{build_command, CommandRequest};
use crate::protocol::{frame, Command, ReceivedMessage};
use crate::registry::Registry;

use dedup::RecentFrames;
use sendq::{RetryDecision, SendQueue};

/// One open radio receiver/transmitter on a serial port.
pub struct SerialLink {
    tag: u8,
    name: String,
    baud: u32,
    retry_limit: u32,
    is_send_port: bool,
    port: Box<dyn SerialPort>,
    rx_buf: Vec<u8>,
}

impl SerialLink {
    /// Open the port with the configured retry budget, pausing between
    /// attempts so a device that is still enumerating gets a chance.
    pub async fn open(name: &str, cfg: &SerialPortConfig, tag: u8) -> Result<SerialLink> {
        let mut last_err = None;
        for attempt in 1..=cfg.retry_limit.max(1) {
            let builder = serialport::new(name, cfg.baud)
                .timeout(Duration::from_millis(500))
                .data_bits(serialport::DataBits::Eight)
                .stop_bits(serialport::StopBits::One)
                .parity(serialport::Parity::None);
            match builder.open() {
                Ok(mut port) => {
                    // Discard any startup chatter already buffered
                    let mut purge = [0u8; 512];
                    if let Ok(available) = port.bytes_to_read() {
                        if available > 0 {
                            let _ = port.read(&mut purge);
                        }
                    }
                    info!(
                        "Serial port {} opened at {} baud (port tag {})",
                        name, cfg.baud, tag
                    );
                    return Ok(SerialLink {
                        tag,
                        name: name.to_string(),
                        baud: cfg.baud,
                        retry_limit: cfg.retry_limit,
                        is_send_port: cfg.is_send_port,
                        port,
                        rx_buf: Vec::new(),
                    });
                }
                Err(e) => {
                    warn!(
                        "Failed to open serial port {} (attempt {} of {}): {}",
                        name, attempt, cfg.retry_limit, e
                    );
                    last_err = Some(e);
                    sleep(Duration::from_secs(5)).await;
                }
            }
        }
        Err(anyhow!(
            "Could not open serial port {}: {}",
            name,
            last_err.map(|e| e.to_string()).unwrap_or_default()
        ))
    }

    /// Drain whatever bytes are available and return any complete lines.
    fn poll_lines(&mut self) -> Vec<String> {
        let available = self.port.bytes_to_read().unwrap_or(0) as usize;
        if available > 0 {
            let mut buf = vec![0u8; available.min(4096)];
            if let Ok(n) = self.port.read(&mut buf) {
                self.rx_buf.extend_from_slice(&buf[..n]);
            }
        }
        let mut lines = Vec::new();
        while let Some(pos) = self.rx_buf.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.rx_buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw).trim().to_string();
            if !line.is_empty() {
                lines.push(line);
            }
        }
        lines
    }

    fn send_frame(&mut self, text: &str) -> Result<()> {
        self.port
            .write_all(format!("{}\r\n", text).as_bytes())
            .with_context(|| format!("Write to serial port {} failed", self.name))?;
        Ok(())
    }

    /// Close and reopen the port in place, reusing the configured retry budget.
    async fn reopen(&mut self) -> Result<()> {
        info!("Resetting serial port {}", self.name);
        let cfg = SerialPortConfig {
            baud: self.baud,
            retry_limit: self.retry_limit,
            is_send_port: self.is_send_port,
        };
        let fresh = SerialLink::open(&self.name.clone(), &cfg, self.tag).await?;
        self.port = fresh.port;
        self.rx_buf.clear();
        Ok(())
    }
}

pub struct Gateway {
    config: Config,
    registry: Registry,
    links: Vec<SerialLink>,
    mqtt: MqttHandle,
    control: mpsc::Receiver<ControlRequest>,
    sendq: SendQueue,
    recent: RecentFrames,
}

impl Gateway {
    /// Open the serial ports, load the device registry and connect to the
    /// broker. Fails when no port can be opened; a radio link is the whole
    /// point.
    pub async fn new(config: Config) -> Result<Gateway> {
        let mut links = Vec::new();
        let mut port_names: Vec<&String> = config.serial.ports.keys().collect();
        port_names.sort();
        for (i, name) in port_names.iter().enumerate() {
            let port_cfg = &config.serial.ports[*name];
            match SerialLink::open(name, port_cfg, (i + 1) as u8).await {
                Ok(link) => links.push(link),
                Err(e) => error!("{:#}", e),
            }
        }
        if links.is_empty() {
            return Err(anyhow!("No serial ports could be opened"));
        }

        let registry = Registry::load(
            &config.files.devices_file,
            &config.files.new_devices_file,
            &config.sender.controller_id,
            &config.sender.gateway_id,
            &config.sender.gateway_name,
        )?;
        registry.log_devices();

        let (mqtt, control) = MqttHandle::connect(&config.mqtt, &config.sender).await?;

        let sendq = SendQueue::new(
            config.sender.resend_timeout_secs,
            config.sender.resend_attempts,
            config.sender.auto_reset_ports_on_failure,
        );
        let recent = RecentFrames::new(config.gateway.max_history_stack_length);

        Ok(Gateway {
            config,
            registry,
            links,
            mqtt,
            control,
            sendq,
            recent,
        })
    }

    /// The main poll loop: control instructions, retry bookkeeping, queued
    /// transmissions, then inbound frames, forever.
    pub async fn run(&mut self) -> Result<()> {
        info!("Listening...");
        loop {
            while let Ok(request) = self.control.try_recv() {
                self.handle_control(request).await;
            }

            match self.sendq.check_resend(Utc::now()) {
                RetryDecision::Wait => {}
                RetryDecision::Resend { reset_ports_first } => {
                    if reset_ports_first {
                        if let Err(e) = self.reset_links().await {
                            error!("Serial port reset failed: {:#}", e);
                        }
                    }
                    self.transmit_in_flight().await;
                }
                RetryDecision::Fail => {
                    if let Some(cmd) = self.sendq.in_flight() {
                        error!(
                            "Possible failure in sending command '{}'. No ack received from controller",
                            cmd.display_name()
                        );
                    }
                    self.mqtt.publish_command_failed().await;
                }
            }

            if self.sendq.has_pending() && self.sendq.ready_to_send() {
                if let Some(command) = self.sendq.take_next() {
                    self.transmit_new(command).await;
                }
            }

            for i in 0..self.links.len() {
                let tag = self.links[i].tag;
                for line in self.links[i].poll_lines() {
                    self.process_line(&line, tag).await;
                }
            }

            sleep(Duration::from_millis(10)).await;
        }
    }

    async fn handle_control(&mut self, request: ControlRequest) {
        match request {
            ControlRequest::ResetComPorts => {
                if let Err(e) = self.reset_links().await {
                    error!("Serial port reset failed: {:#}", e);
                }
            }
            ControlRequest::CancelCommands => {
                self.sendq.cancel_all();
                info!("Cancelled all queued outbound commands");
            }
            ControlRequest::Send(request, instruction) => {
                self.enqueue_command(&request, instruction);
            }
        }
    }

    fn enqueue_command(&mut self, request: &CommandRequest, instruction: String) {
        match build_command(request, &self.registry, &self.config.sender, instruction) {
            Ok(command) => {
                self.sendq.enqueue(command);
            }
            Err(e) => error!("Rejected control instruction: {}", e),
        }
    }

    fn send_link_index(&self) -> Option<usize> {
        self.links.iter().position(|l| l.is_send_port)
    }

    async fn transmit_new(&mut self, command: Command) {
        self.sendq.set_in_flight(command);
        self.transmit_in_flight().await;
    }

    /// Write the in-flight command to the send port and publish its status.
    async fn transmit_in_flight(&mut self) {
        let Some(idx) = self.send_link_index() else {
            error!("No send-capable serial port configured, dropping outbound command");
            self.sendq.cancel_all();
            return;
        };
        let Some(frame_text) = self.sendq.in_flight().map(Command::frame_text) else {
            return;
        };
        if let Err(e) = self.links[idx].send_frame(&frame_text) {
            error!("{:#}", e);
            // Count the failed attempt; the retry timer picks the command up
            // again and the attempt budget still applies.
            if let Some(cmd) = self.sendq.in_flight_mut() {
                cmd.mark_sent(Utc::now());
            }
            return;
        }
        let snapshot = {
            let Some(cmd) = self.sendq.in_flight_mut() else {
                return;
            };
            cmd.mark_sent(Utc::now());
            cmd.clone()
        };
        info!("COMMAND_OUT: Sending '{}'", frame_text);
        info!(
            "{} {} Command SENT",
            snapshot.display_name(),
            snapshot.describe_args()
        );
        self.mqtt.publish_command_sent(&snapshot).await;
    }

    async fn reset_links(&mut self) -> Result<()> {
        for link in &mut self.links {
            link.reopen().await?;
        }
        Ok(())
    }

    /// Decode one received line, suppress duplicates, publish facts and
    /// correlate acknowledgements.
    async fn process_line(&mut self, line: &str, tag: u8) {
        let Some(msg) = frame::parse_line(line, Some(tag), &self.registry) else {
            if self.config.gateway.log_dropped_packets {
                debug!("Message dropped: '{}'", escape_log(line));
            }
            return;
        };

        let now = Utc::now();
        let signature = RecentFrames::signature(&msg, now);
        if self.config.gateway.drop_duplicate_messages && self.recent.contains(&signature) {
            debug!("^ {}", escape_log(&msg.raw));
            return;
        }
        self.recent.push(signature);

        self.registry.note_device(&msg.source);
        self.dispatch(&msg).await;

        if let Some(acked) = self
            .sendq
            .observe_ack(&msg, &self.registry.gateway_id, now)
        {
            self.mqtt.publish_command_ack().await;
            info!(
                "{} {} Command ACKNOWLEDGED",
                acked.display_name(),
                acked.describe_args()
            );
        }
    }

    async fn dispatch(&mut self, msg: &ReceivedMessage) {
        let Some(kind) = CommandKind::from_code(&msg.command_code) else {
            info!(
                "{:<18} Command code: {}, Payload: {}",
                "UNKNOWN COMMAND", msg.command_code, msg.payload
            );
            return;
        };
        match decode::decode(kind, msg, &self.registry) {
            Ok(decoded) => {
                let label = format!(
                    "{}{}",
                    kind.name().to_uppercase(),
                    decoded.label_suffix.unwrap_or("")
                );
                for row in &decoded.rows {
                    let zone_name = row
                        .zone
                        .filter(|z| self.registry.zone_known(*z))
                        .map(|z| self.registry.zone_name(z));
                    info!(
                        "{:<18} {}",
                        label,
                        display_row(msg, row, zone_name.as_deref())
                    );
                }
                debug!("{:<18} {}", label, escape_log(&msg.raw));
                for fact in &decoded.facts {
                    self.mqtt.publish_fact(fact).await;
                }
            }
            Err(e) => {
                error!(
                    "{:<18} {}. Raw msg: {}",
                    kind.name().to_uppercase(),
                    e,
                    msg.raw
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn opened_link_keeps_the_configured_retry_budget() {
        let (_master, slave) = serialport::TTYPort::pair().expect("pty pair");
        let path = slave.name().expect("pty path");
        drop(slave);
        let cfg = SerialPortConfig {
            baud: 115200,
            retry_limit: 5,
            is_send_port: true,
        };
        let link = SerialLink::open(&path, &cfg, 1).await.expect("open pty");
        assert_eq!(link.retry_limit, 5);
        assert!(link.is_send_port);
    }
}
