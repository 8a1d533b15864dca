//! # evogateway - evohome RF Listener/Sender Gateway
//!
//! evogateway bridges the evohome wireless heating protocol to MQTT. It listens
//! to the ASCII-hex frames emitted by a radio transceiver (an HGI80 or an
//! evofw2/evofw3 firmware board) on one or more serial links, decodes them into
//! typed messages, and publishes the extracted facts (temperatures, setpoints,
//! heat demand, relay states, fault log entries, ...) to an MQTT broker.
//! Commands received on an MQTT subscription topic are encoded back into
//! evohome frames and sent over the radio, with acknowledgement tracking and
//! timeout-driven retries.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use evogateway::config::Config;
//! use evogateway::gateway::Gateway;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     // Load configuration
//!     let config = Config::load("evogateway.toml").await?;
//!
//!     // Open serial links, connect to the broker and run the poll loop
//!     let mut gateway = Gateway::new(config).await?;
//!     gateway.run().await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`protocol`] - frame parsing, command decode table, command encoder and
//!   the payload datetime codecs
//! - [`gateway`] - serial link management, the poll loop, the send/ack/retry
//!   state machine and duplicate suppression
//! - [`registry`] - the device and zone registries loaded from `devices.json`
//! - [`mqtt`] - MQTT publication and the inbound command subscription
//! - [`config`] - TOML configuration management
//!
//! ## Data Flow
//!
//! ```text
//! serial bytes -> frame parser -> ReceivedMessage -> [dedup] -> decode table
//!                                      |                            |
//!                                      v                            v
//!                               ack correlation              MQTT publications
//!
//! MQTT subscription -> CommandRequest -> encoder -> Command -> send queue
//!                                                                 |
//!                                                                 v
//!                                                          serial bytes
//! ```

pub mod config;
pub mod gateway;
pub mod logutil;
pub mod mqtt;
pub mod protocol;
pub mod registry;
