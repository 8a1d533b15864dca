//! Duplicate frame suppression.
//!
//! With two receivers on the same radio band most broadcasts arrive twice
//! within the same second. Frames are fingerprinted by their text (signal
//! strength stripped) plus a second-granularity timestamp, and checked
//! against a short history before dispatch.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};

use crate::protocol::ReceivedMessage;

pub struct RecentFrames {
    seen: VecDeque<String>,
    capacity: usize,
}

impl RecentFrames {
    pub fn new(capacity: usize) -> RecentFrames {
        RecentFrames {
            seen: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Fingerprint for one received frame at a given wall-clock time.
    pub fn signature(msg: &ReceivedMessage, now: DateTime<Utc>) -> String {
        format!("{} {}", now.format("%Y-%m-%d %H:%M:%S"), msg.raw_without_rssi())
    }

    pub fn contains(&self, signature: &str) -> bool {
        self.seen.iter().any(|s| s == signature)
    }

    /// Record a dispatched frame, evicting the oldest entry when full.
    pub fn push(&mut self, signature: String) {
        if self.seen.len() >= self.capacity {
            self.seen.pop_front();
        }
        self.seen.push_back(signature);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::frame;
    use crate::registry::Registry;

    fn msg(line: &str) -> ReceivedMessage {
        let reg = Registry::empty("01:139901", "18:318170");
        frame::parse_line(line, None, &reg).unwrap()
    }

    #[test]
    fn same_frame_same_second_is_a_duplicate() {
        let now = Utc::now();
        let mut recent = RecentFrames::new(10);
        let a = msg("---  I --- 04:111111 --:------ 01:139901 30C9 003 000834");
        let b = msg("--- 072  I --- 04:111111 --:------ 01:139901 30C9 003 000834");

        let sig_a = RecentFrames::signature(&a, now);
        assert!(!recent.contains(&sig_a));
        recent.push(sig_a);

        // Same broadcast heard through the second receiver
        assert!(recent.contains(&RecentFrames::signature(&b, now)));
    }

    #[test]
    fn next_second_is_not_a_duplicate() {
        let now = Utc::now();
        let mut recent = RecentFrames::new(10);
        let a = msg("---  I --- 04:111111 --:------ 01:139901 30C9 003 000834");
        recent.push(RecentFrames::signature(&a, now));

        let later = now + chrono::Duration::seconds(1);
        assert!(!recent.contains(&RecentFrames::signature(&a, later)));
    }

    #[test]
    fn history_is_bounded() {
        let now = Utc::now();
        let mut recent = RecentFrames::new(2);
        let a = msg("---  I --- 04:111111 --:------ 01:139901 30C9 003 000834");
        let sig = RecentFrames::signature(&a, now);
        recent.push(sig.clone());
        recent.push("x".to_string());
        recent.push("y".to_string());
        assert!(!recent.contains(&sig));
        assert!(recent.contains("y"));
    }
}
