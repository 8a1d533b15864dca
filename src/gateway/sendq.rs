//! Outbound command queue and acknowledgement tracking.
//!
//! One command is in flight at a time. A command waiting for an ack is
//! resent when no matching reply arrives within the timeout, up to the
//! configured attempt count, after which it is marked failed. The pending
//! queue is served newest-first, so a corrective instruction jumps ahead of
//! anything still waiting.

use chrono::{DateTime, Utc};
use log::info;

use crate::protocol::{Command, ReceivedMessage};

/// What the retry check decided for the in-flight command.
#[derive(Debug, PartialEq, Eq)]
pub enum RetryDecision {
    /// Nothing to do yet.
    Wait,
    /// Resend now; reset the serial ports first when this is the last try
    /// and port recovery is enabled.
    Resend { reset_ports_first: bool },
    /// Out of attempts; the command has been marked failed.
    Fail,
}

pub struct SendQueue {
    pending: Vec<Command>,
    in_flight: Option<Command>,
    timeout_secs: f64,
    max_attempts: u32,
    auto_reset_ports: bool,
}

impl SendQueue {
    pub fn new(timeout_secs: f64, max_attempts: u32, auto_reset_ports: bool) -> SendQueue {
        SendQueue {
            pending: Vec::new(),
            in_flight: None,
            timeout_secs,
            max_attempts,
            auto_reset_ports,
        }
    }

    pub fn enqueue(&mut self, command: Command) {
        self.pending.push(command);
    }

    /// Drop every queued command and forget the in-flight one.
    pub fn cancel_all(&mut self) {
        self.pending.clear();
        self.in_flight = None;
    }

    /// True when a new command can be taken: the previous one is finished
    /// or nothing is waiting on an ack.
    pub fn ready_to_send(&self) -> bool {
        match &self.in_flight {
            None => true,
            Some(cmd) => {
                !cmd.wait_for_ack || cmd.acknowledged.is_some() || cmd.failed
            }
        }
    }

    /// Take the next command to transmit, newest first.
    pub fn take_next(&mut self) -> Option<Command> {
        if !self.ready_to_send() {
            return None;
        }
        self.pending.pop()
    }

    pub fn set_in_flight(&mut self, command: Command) {
        self.in_flight = Some(command);
    }

    pub fn in_flight(&self) -> Option<&Command> {
        self.in_flight.as_ref()
    }

    pub fn in_flight_mut(&mut self) -> Option<&mut Command> {
        self.in_flight.as_mut()
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Decide whether the in-flight command needs resending. The caller
    /// performs the actual transmission (and port reset) and then stamps the
    /// command via [`Command::mark_sent`].
    pub fn check_resend(&mut self, now: DateTime<Utc>) -> RetryDecision {
        let timeout = self.timeout_secs;
        let max_attempts = self.max_attempts;
        let auto_reset = self.auto_reset_ports;
        let Some(cmd) = self.in_flight.as_mut() else {
            return RetryDecision::Wait;
        };
        if !cmd.wait_for_ack || cmd.acknowledged.is_some() || cmd.failed {
            return RetryDecision::Wait;
        }
        // A command with no send timestamp never left the port; treat it as
        // already overdue so a failed write does not park the queue.
        if let Some(reference) = cmd.last_retry.or(cmd.first_sent) {
            let elapsed = (now - reference).num_milliseconds() as f64 / 1000.0;
            if elapsed <= timeout {
                return RetryDecision::Wait;
            }
        }
        if cmd.retries <= max_attempts {
            info!(
                "{} {} Command NOT acknowledged. Resending attempt {} of {}...",
                cmd.display_name(),
                cmd.describe_args(),
                cmd.retries,
                max_attempts
            );
            RetryDecision::Resend {
                reset_ports_first: cmd.retries == max_attempts
                    && (auto_reset || cmd.reset_ports_on_fail),
            }
        } else {
            cmd.failed = true;
            RetryDecision::Fail
        }
    }

    /// Correlate an inbound message against the in-flight command. The
    /// controller does not echo a formal ack; a reply from the command's
    /// destination addressed at this gateway is taken as one. Returns the
    /// acknowledged command for status reporting.
    pub fn observe_ack(
        &mut self,
        msg: &ReceivedMessage,
        gateway_id: &str,
        now: DateTime<Utc>,
    ) -> Option<Command> {
        let cmd = self.in_flight.as_mut()?;
        if cmd.acknowledged.is_some() || cmd.failed {
            return None;
        }
        if msg.source == cmd.destination && msg.destination == gateway_id {
            cmd.acknowledged = Some(now);
            return Some(cmd.clone());
        }
        None
    }
}
