//! Unsolicited notification handling.
//!
//! The [`EventDispatcher`] drains the event stream in arrival order, classifies
//! each line as a [`Notification`] and reacts:
//!
//! - `NewSms(index)`: debounce, fetch with `AT+CMGR`, decode, dedup, notify
//!   subscribers, delete with `AT+CMGD`.
//! - `Ring`: query `AT+CLCC` and notify subscribers with the caller.
//! - `CallerId`: remembered for the next ring.
//! - `Unknown`: logged and dropped.
use log::{debug, info, warn};
use std::collections::VecDeque;
use std::sync::{Arc, RwLock};
use std::time::Instant;
use tokio::sync::{mpsc, watch};

use super::executor::CommandExecutor;
use crate::config::{Charset, DedupKeyMode, SmsConfig};
use crate::logutil::escape_log;
use crate::modem::classify::response_ok;
use crate::sms::codec::{self, ParsedSms};
use crate::sms::dedup::{DedupKey, Debouncer, ProcessedMessages};

/// A classified event line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// `+CMTI: "<mem>",<index>`
    NewSms(u32),
    /// `RING` or `+CRING: <type>`
    Ring,
    /// `+CLIP: "<number>",<type>,...`
    CallerId(String),
    Unknown(String),
}

impl Notification {
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        if let Some(pos) = line.find("+CMTI:") {
            let rest = &line[pos + "+CMTI:".len()..];
            let index = rest
                .rsplit(',')
                .next()
                .map(str::trim)
                .and_then(|s| s.parse::<u32>().ok());
            return match index {
                Some(i) => Notification::NewSms(i),
                None => Notification::Unknown(line.to_string()),
            };
        }
        if line == "RING" || line.starts_with("+CRING:") {
            return Notification::Ring;
        }
        if let Some(rest) = line.strip_prefix("+CLIP:") {
            if let Some(number) = first_quoted(rest) {
                return Notification::CallerId(number);
            }
        }
        Notification::Unknown(line.to_string())
    }
}

fn first_quoted(s: &str) -> Option<String> {
    let start = s.find('"')? + 1;
    let len = s[start..].find('"')?;
    let value = &s[start..start + len];
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

/// Calling number from an `AT+CLCC` response
/// (`+CLCC: <id>,<dir>,<stat>,<mode>,<mpty>,"<number>",<type>`).
pub fn caller_from_clcc(response: &str) -> Option<String> {
    response
        .lines()
        .map(str::trim)
        .filter_map(|l| l.strip_prefix("+CLCC:"))
        .find_map(first_quoted)
}

/// What subscribers receive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModemEvent {
    Sms(ParsedSms),
    Ring {
        caller: Option<String>,
        /// Raw `AT+CLCC` response, empty if the query failed.
        details: String,
    },
}

/// Receives decoded modem events. Runs on the dispatcher task, so
/// implementations should hand long work off rather than block.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &ModemEvent);
}

impl<F> EventHandler for F
where
    F: Fn(&ModemEvent) + Send + Sync,
{
    fn handle(&self, event: &ModemEvent) {
        self(event)
    }
}

#[derive(Clone, Default)]
pub struct Subscribers {
    handlers: Arc<RwLock<Vec<Arc<dyn EventHandler>>>>,
}

impl Subscribers {
    pub fn add(&self, handler: Arc<dyn EventHandler>) {
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(handler);
    }

    pub fn len(&self) -> usize {
        self.handlers.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn publish(&self, event: &ModemEvent) {
        let handlers = self
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for h in handlers {
            h.handle(event);
        }
    }
}

pub struct EventDispatcher {
    exec: Arc<CommandExecutor>,
    events: mpsc::Receiver<String>,
    /// Lines pulled while waiting for a hex body that turned out to be events.
    pending: VecDeque<String>,
    subscribers: Subscribers,
    sms: SmsConfig,
    charset: Charset,
    debouncer: Debouncer,
    processed: ProcessedMessages,
    last_caller: Option<String>,
    shutdown: watch::Receiver<bool>,
}

impl EventDispatcher {
    pub fn new(
        exec: Arc<CommandExecutor>,
        events: mpsc::Receiver<String>,
        subscribers: Subscribers,
        sms: SmsConfig,
        charset: Charset,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            exec,
            events,
            pending: VecDeque::new(),
            subscribers,
            debouncer: Debouncer::new(sms.debounce_window()),
            processed: ProcessedMessages::new(sms.retention()),
            sms,
            charset,
            last_caller: None,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        info!("Starting modem event dispatcher");
        loop {
            let line = match self.pending.pop_front() {
                Some(line) => line,
                None => {
                    tokio::select! {
                        changed = self.shutdown.changed() => {
                            if changed.is_err() || *self.shutdown.borrow() {
                                break;
                            }
                            continue;
                        }
                        ev = self.events.recv() => match ev {
                            Some(line) => line,
                            None => break,
                        }
                    }
                }
            };
            self.dispatch(&line).await;
        }
        info!("Modem event dispatcher shutting down");
    }

    /// Handle one event line.
    pub async fn dispatch(&mut self, line: &str) {
        match Notification::parse(line) {
            Notification::NewSms(index) => {
                info!("New SMS received at index {}", index);
                self.handle_new_sms(index).await;
            }
            Notification::Ring => {
                info!("Incoming call!");
                self.handle_ring().await;
            }
            Notification::CallerId(number) => {
                debug!("Caller id {}", number);
                self.last_caller = Some(number);
            }
            Notification::Unknown(raw) => {
                debug!("Received event: {}", escape_log(&raw));
            }
        }
    }

    async fn handle_ring(&mut self) {
        let details = match self.exec.execute_default("AT+CLCC").await {
            Ok(resp) => resp,
            Err(e) => {
                warn!("Caller id query failed: {}", e);
                String::new()
            }
        };
        let caller = caller_from_clcc(&details).or_else(|| self.last_caller.take());
        info!(
            "Incoming call detected from {}",
            caller.as_deref().unwrap_or("unknown caller")
        );
        self.subscribers.publish(&ModemEvent::Ring { caller, details });
    }

    async fn handle_new_sms(&mut self, index: u32) {
        let now = Instant::now();
        let evicted = self.processed.evict_expired(now);
        if evicted > 0 {
            debug!("Evicted {} processed-message records", evicted);
        }

        if !self.debouncer.should_process(index, now) {
            debug!("Duplicate new-SMS notification for index {} ignored", index);
            return;
        }
        if self.sms.dedup_key == DedupKeyMode::Index
            && self.processed.contains(&DedupKey::Index(index), now)
        {
            debug!("SMS at index {} already processed", index);
            return;
        }

        let response = match self.exec.execute_default(&format!("AT+CMGR={}", index)).await {
            Ok(resp) => resp,
            Err(e) => {
                warn!("Failed to fetch SMS {}: {}", index, e);
                return;
            }
        };
        if !codec::fetch_succeeded(&response) {
            warn!("Failed to fetch SMS {}: {}", index, escape_log(&response));
            return;
        }

        let (mut sms, header_ok) = match codec::parse_cmgr(&response, index) {
            Ok(sms) => (sms, true),
            Err(e) if e.partial.message.is_empty() => {
                // Nothing stored at this index (already read and deleted)
                warn!("SMS {} not published: {}", index, e);
                self.delete_read_message(index).await;
                return;
            }
            Err(e) => {
                warn!("{}", e);
                (e.partial, false)
            }
        };

        if self.charset == Charset::Ucs2 {
            if sms.message.is_empty() {
                if let Some(hex) = self.next_hex_line().await {
                    sms.message = hex;
                }
            }
            sms.sender = codec::decode_ucs2_hex(&sms.sender);
            sms.message = codec::decode_ucs2_hex(&sms.message);
        }

        let duplicate = if header_ok {
            let key = DedupKey::for_sms(self.sms.dedup_key, &sms);
            let seen = self.processed.contains(&key, now);
            self.processed.insert(key, Instant::now());
            seen
        } else {
            false
        };

        if duplicate {
            debug!("SMS from {} already processed", sms.sender);
        } else {
            info!(
                target: "sms",
                "SMS from {} at {} [{}]: {}",
                sms.sender,
                sms.timestamp_raw,
                sms.status,
                escape_log(&sms.message)
            );
            self.subscribers.publish(&ModemEvent::Sms(sms));
        }

        self.delete_read_message(index).await;
    }

    /// Free the storage slot. The processed record stays until the retention
    /// sweep, so a repeated notification for this index is still ignored.
    async fn delete_read_message(&self, index: u32) {
        if !self.sms.delete_after_read {
            return;
        }
        match self.exec.execute_default(&format!("AT+CMGD={}", index)).await {
            Ok(resp) if response_ok(&resp) => debug!("Deleted SMS {}", index),
            Ok(resp) => warn!("Delete of SMS {} rejected: {}", index, escape_log(&resp)),
            Err(e) => warn!("Delete of SMS {} failed: {}", index, e),
        }
    }

    /// Some firmwares deliver a UCS-2 body as a separate line after the
    /// response. Wait briefly for it; anything else goes back to the queue.
    async fn next_hex_line(&mut self) -> Option<String> {
        let wait = self.sms.hex_body_timeout();
        match tokio::time::timeout(wait, self.events.recv()).await {
            Ok(Some(line)) if codec::looks_like_hex(&line) => Some(line.trim().to_string()),
            Ok(Some(line)) => {
                self.pending.push_back(line);
                None
            }
            Ok(None) => None,
            Err(_) => {
                debug!("No separate hex body within {:?}", wait);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_notifications() {
        assert_eq!(Notification::parse("+CMTI: \"ME\",3"), Notification::NewSms(3));
        assert_eq!(Notification::parse("+CMTI: \"SM\", 12"), Notification::NewSms(12));
        assert_eq!(Notification::parse("RING"), Notification::Ring);
        assert_eq!(Notification::parse("+CRING: VOICE"), Notification::Ring);
        assert_eq!(
            Notification::parse("+CLIP: \"+15551234567\",145,\"\",0,\"\",0"),
            Notification::CallerId("+15551234567".to_string())
        );
        assert!(matches!(
            Notification::parse("+CMTI: \"SM\",x"),
            Notification::Unknown(_)
        ));
        assert!(matches!(
            Notification::parse("+CREG: 1"),
            Notification::Unknown(_)
        ));
    }

    #[test]
    fn clcc_caller() {
        let resp = "AT+CLCC\n+CLCC: 1,1,4,0,0,\"+15557654321\",145\nOK";
        assert_eq!(caller_from_clcc(resp).as_deref(), Some("+15557654321"));
        assert_eq!(caller_from_clcc("AT+CLCC\nOK"), None);
    }

    #[test]
    fn closures_are_handlers() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let hits = Arc::new(AtomicUsize::new(0));
        let subs = Subscribers::default();
        let h = hits.clone();
        subs.add(Arc::new(move |_: &ModemEvent| {
            h.fetch_add(1, Ordering::SeqCst);
        }));
        subs.publish(&ModemEvent::Ring {
            caller: None,
            details: String::new(),
        });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(subs.len(), 1);
    }
}
