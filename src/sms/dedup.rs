//! Duplicate suppression for incoming messages.
//!
//! Two layers:
//! * [`Debouncer`] drops a repeated new-message notification for the same
//!   storage index inside a short window (modems often emit it twice).
//! * [`ProcessedMessages`] remembers what has already been handled, keyed by
//!   storage index or by message content, and forgets entries after the
//!   retention window.
//!
//! Both take `now` explicitly so callers (and tests) control the clock.
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::config::DedupKeyMode;
use crate::sms::codec::ParsedSms;

#[derive(Debug)]
pub struct Debouncer {
    window: Duration,
    seen: HashMap<u32, Instant>,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            seen: HashMap::new(),
        }
    }

    /// True when the notification for `index` should be acted on.
    pub fn should_process(&mut self, index: u32, now: Instant) -> bool {
        let window = self.window;
        self.seen
            .retain(|_, at| now.saturating_duration_since(*at) < window);
        if self.seen.contains_key(&index) {
            return false;
        }
        self.seen.insert(index, now);
        true
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DedupKey {
    Index(u32),
    Content {
        sender: String,
        timestamp: String,
        message: String,
    },
}

impl DedupKey {
    pub fn for_sms(mode: DedupKeyMode, sms: &ParsedSms) -> Self {
        match mode {
            DedupKeyMode::Index => DedupKey::Index(sms.index),
            DedupKeyMode::Content => DedupKey::Content {
                sender: sms.sender.clone(),
                timestamp: sms.timestamp_raw.clone(),
                message: sms.message.clone(),
            },
        }
    }
}

#[derive(Debug)]
pub struct ProcessedMessages {
    retention: Duration,
    entries: HashMap<DedupKey, Instant>,
}

impl ProcessedMessages {
    pub fn new(retention: Duration) -> Self {
        Self {
            retention,
            entries: HashMap::new(),
        }
    }

    pub fn insert(&mut self, key: DedupKey, now: Instant) {
        self.entries.insert(key, now);
    }

    /// Present and not older than the retention window.
    pub fn contains(&self, key: &DedupKey, now: Instant) -> bool {
        self.entries
            .get(key)
            .map(|at| now.saturating_duration_since(*at) <= self.retention)
            .unwrap_or(false)
    }

    /// Drop entries whose age exceeds the retention window; returns how many.
    pub fn evict_expired(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        let retention = self.retention;
        self.entries
            .retain(|_, at| now.saturating_duration_since(*at) <= retention);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn sms(index: u32, sender: &str, message: &str) -> ParsedSms {
        ParsedSms {
            index,
            status: "REC UNREAD".into(),
            sender: sender.into(),
            timestamp_raw: "24/01/01,12:00:00".into(),
            message: message.into(),
            received_at: Utc::now(),
        }
    }

    #[test]
    fn debounce_suppresses_repeat_inside_window() {
        let mut d = Debouncer::new(Duration::from_secs(2));
        let t = Instant::now();
        assert!(d.should_process(3, t));
        assert!(!d.should_process(3, t + Duration::from_millis(500)));
        assert!(d.should_process(4, t + Duration::from_millis(600)));
        assert!(d.should_process(3, t + Duration::from_millis(2100)));
    }

    #[test]
    fn retention_boundary() {
        let mut p = ProcessedMessages::new(Duration::from_secs(3600));
        let t = Instant::now();
        let key = DedupKey::Index(7);
        p.insert(key.clone(), t);

        let almost = t + Duration::from_secs(3599);
        assert_eq!(p.evict_expired(almost), 0);
        assert!(p.contains(&key, almost));

        let after = t + Duration::from_secs(3601);
        assert!(!p.contains(&key, after));
        assert_eq!(p.evict_expired(after), 1);
        assert!(p.is_empty());
    }

    #[test]
    fn distinct_messages_from_same_sender_are_distinct_keys() {
        let mut p = ProcessedMessages::new(Duration::from_secs(3600));
        let now = Instant::now();
        let a = DedupKey::for_sms(DedupKeyMode::Content, &sms(1, "+1555", "first"));
        let b = DedupKey::for_sms(DedupKeyMode::Content, &sms(2, "+1555", "second"));
        p.insert(a.clone(), now);
        assert!(p.contains(&a, now));
        assert!(!p.contains(&b, now));
    }

    #[test]
    fn index_mode_keys_by_storage_slot() {
        let k = DedupKey::for_sms(DedupKeyMode::Index, &sms(5, "+1", "x"));
        assert_eq!(k, DedupKey::Index(5));
    }
}
