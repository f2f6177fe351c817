//! Keyword auto-replies.
//!
//! An incoming SMS whose whole body is one of the recognised keywords
//! (`cpu`, `ram`, `signal`; case-insensitive, surrounding whitespace ignored)
//! gets a one-line answer queued back to the sender. Where the answer text
//! comes from is up to the [`SystemInfoProvider`]; the engine treats it as
//! opaque text.
use log::{debug, info, warn};
use std::sync::Arc;

use crate::modem::events::{EventHandler, ModemEvent};
use crate::sms::sender::OutgoingQueue;

const UNAVAILABLE: &str = "unavailable";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Keyword {
    Cpu,
    Ram,
    Signal,
}

impl Keyword {
    pub fn parse(body: &str) -> Option<Self> {
        match body.trim().to_ascii_lowercase().as_str() {
            "cpu" => Some(Keyword::Cpu),
            "ram" => Some(Keyword::Ram),
            "signal" => Some(Keyword::Signal),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Keyword::Cpu => "cpu",
            Keyword::Ram => "ram",
            Keyword::Signal => "signal",
        }
    }
}

/// Supplies the answer text for a keyword.
pub trait SystemInfoProvider: Send + Sync {
    fn answer(&self, keyword: Keyword) -> Option<String>;
}

/// Provider with nothing to report; every reply says `unavailable`.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHostInfo;

impl SystemInfoProvider for NoHostInfo {
    fn answer(&self, _keyword: Keyword) -> Option<String> {
        None
    }
}

/// `"<keyword>: <answer>"`, or `None` when `body` is not a keyword.
pub fn build_reply(body: &str, provider: &dyn SystemInfoProvider) -> Option<String> {
    let keyword = Keyword::parse(body)?;
    let answer = provider
        .answer(keyword)
        .unwrap_or_else(|| UNAVAILABLE.to_string());
    Some(format!("{}: {}", keyword.as_str(), answer))
}

/// Event handler turning keyword messages into queued replies.
pub struct AutoResponder {
    queue: OutgoingQueue,
    provider: Arc<dyn SystemInfoProvider>,
    /// Empty means anyone may ask.
    allowed_senders: Vec<String>,
}

impl AutoResponder {
    pub fn new(
        queue: OutgoingQueue,
        provider: Arc<dyn SystemInfoProvider>,
        allowed_senders: Vec<String>,
    ) -> Self {
        Self {
            queue,
            provider,
            allowed_senders,
        }
    }

    fn sender_allowed(&self, sender: &str) -> bool {
        self.allowed_senders.is_empty() || self.allowed_senders.iter().any(|s| s == sender)
    }
}

impl EventHandler for AutoResponder {
    fn handle(&self, event: &ModemEvent) {
        let ModemEvent::Sms(sms) = event else {
            return;
        };
        let Some(reply) = build_reply(&sms.message, self.provider.as_ref()) else {
            return;
        };
        if !self.sender_allowed(&sms.sender) {
            debug!("Ignoring keyword from unlisted sender {}", sms.sender);
            return;
        }
        info!("Queueing reply to {}", sms.sender);
        let receipt = self.queue.enqueue(&sms.sender, &reply);
        let destination = sms.sender.clone();
        tokio::spawn(async move {
            match receipt.await {
                Ok(Ok(())) => debug!("Reply to {} delivered to network", destination),
                Ok(Err(e)) => warn!("Reply to {} failed: {}", destination, e),
                Err(_) => warn!("Reply to {} dropped before sending", destination),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sms::codec::ParsedSms;
    use crate::sms::sender::OutgoingRequest;
    use chrono::Utc;
    use tokio::sync::mpsc;

    struct Fixed;

    impl SystemInfoProvider for Fixed {
        fn answer(&self, keyword: Keyword) -> Option<String> {
            match keyword {
                Keyword::Cpu => Some("12%".to_string()),
                _ => None,
            }
        }
    }

    fn sms(sender: &str, message: &str) -> ModemEvent {
        ModemEvent::Sms(ParsedSms {
            index: 1,
            status: "REC UNREAD".into(),
            sender: sender.into(),
            timestamp_raw: "24/01/01,12:00:00".into(),
            message: message.into(),
            received_at: Utc::now(),
        })
    }

    #[test]
    fn keyword_parsing() {
        assert_eq!(Keyword::parse("  CPU \n"), Some(Keyword::Cpu));
        assert_eq!(Keyword::parse("Signal"), Some(Keyword::Signal));
        assert_eq!(Keyword::parse("cpu please"), None);
    }

    #[test]
    fn reply_text() {
        assert_eq!(build_reply("cpu", &Fixed).as_deref(), Some("cpu: 12%"));
        assert_eq!(build_reply("ram", &Fixed).as_deref(), Some("ram: unavailable"));
        assert_eq!(build_reply("ram", &NoHostInfo).as_deref(), Some("ram: unavailable"));
        assert_eq!(build_reply("hello", &Fixed), None);
    }

    #[tokio::test]
    async fn responder_queues_reply_for_allowed_sender() {
        let (tx, mut rx) = mpsc::unbounded_channel::<OutgoingRequest>();
        let responder = AutoResponder::new(
            OutgoingQueue::new(tx),
            Arc::new(Fixed),
            vec!["+1555".to_string()],
        );

        responder.handle(&sms("+9999", "cpu"));
        responder.handle(&sms("+1555", "not a keyword"));
        responder.handle(&sms("+1555", "cpu"));

        let req = rx.try_recv().expect("one reply queued");
        assert_eq!(req.message.destination, "+1555");
        assert_eq!(req.message.body, "cpu: 12%");
        assert!(rx.try_recv().is_err());
    }
}
