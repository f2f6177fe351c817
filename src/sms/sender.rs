//! Outgoing SMS: the two-phase `AT+CMGS` handshake and the queue worker.
//!
//! ```text
//! AT+CMGF=1            -> OK
//! AT+CSCS="GSM"        -> OK
//! AT+CMGS="<dest>"     -> >
//! <body><CTRL-Z>       -> +CMGS: <ref> / OK
//! ```
//!
//! The whole exchange runs inside one [`ExecSession`] so no other command can
//! land between the prompt and the payload.
use log::{debug, error, info, warn};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};

use crate::config::{Charset, SmsConfig};
use crate::logutil::escape_log;
use crate::modem::classify::{response_ok, PROMPT};
use crate::modem::executor::{CommandExecutor, ExecSession, CTRL_Z, ESC};
use crate::modem::ModemError;

const SEND_CONFIRMATION: &str = "+CMGS";

/// A message waiting for transmission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub destination: String,
    pub body: String,
}

/// Result channel handed back to whoever enqueued a message.
pub type SendReceipt = oneshot::Receiver<Result<(), ModemError>>;

#[derive(Debug)]
pub(crate) struct OutgoingRequest {
    pub(crate) message: OutgoingMessage,
    pub(crate) reply: Option<oneshot::Sender<Result<(), ModemError>>>,
}

/// Cloneable submission handle for the outgoing queue.
#[derive(Debug, Clone)]
pub struct OutgoingQueue {
    tx: mpsc::UnboundedSender<OutgoingRequest>,
}

impl OutgoingQueue {
    pub(crate) fn new(tx: mpsc::UnboundedSender<OutgoingRequest>) -> Self {
        Self { tx }
    }

    /// Queue a message without waiting. The receipt resolves once the sender
    /// has tried it; dropping the receipt is fine.
    pub fn enqueue(&self, destination: &str, body: &str) -> SendReceipt {
        let (reply_tx, reply_rx) = oneshot::channel();
        let request = OutgoingRequest {
            message: OutgoingMessage {
                destination: destination.to_string(),
                body: body.to_string(),
            },
            reply: Some(reply_tx),
        };
        if let Err(mpsc::error::SendError(req)) = self.tx.send(request) {
            warn!("Outgoing queue closed; dropping message to {}", req.message.destination);
            if let Some(reply) = req.reply {
                let _ = reply.send(Err(ModemError::ShuttingDown));
            }
        }
        reply_rx
    }
}

/// Strip characters that would end or cancel the payload early.
fn sanitize_body(body: &str) -> String {
    body.chars().filter(|c| *c != CTRL_Z && *c != ESC).collect()
}

/// The destination is embedded in a quoted AT argument.
fn check_destination(destination: &str) -> Result<(), ModemError> {
    let d = destination.trim();
    if d.is_empty() || d.chars().any(|c| c == '"' || c.is_control()) {
        return Err(ModemError::Parse(format!(
            "invalid destination {:?}",
            destination
        )));
    }
    Ok(())
}

/// `sendSms(destination, body)` on an already held session.
pub async fn send_sms_in_session(
    session: &mut ExecSession<'_>,
    sms: &SmsConfig,
    receive_charset: Charset,
    destination: &str,
    body: &str,
) -> Result<(), ModemError> {
    check_destination(destination)?;
    let destination = destination.trim();
    for cmd in ["AT+CMGF=1", "AT+CSCS=\"GSM\""] {
        match session.execute_default(cmd).await {
            Ok(resp) if response_ok(&resp) => {}
            Ok(resp) => warn!("{} rejected: {}", cmd, escape_log(&resp)),
            Err(ModemError::NotConnected) => return Err(ModemError::NotConnected),
            Err(e) => warn!("{} failed: {}", cmd, e),
        }
    }

    let result = two_phase_send(session, sms, destination, body).await;

    if receive_charset != Charset::Gsm {
        let restore = format!("AT+CSCS=\"{}\"", receive_charset.at_name());
        if let Err(e) = session.execute_default(&restore).await {
            warn!("Failed to restore charset with {}: {}", restore, e);
        }
    }
    result
}

async fn two_phase_send(
    session: &mut ExecSession<'_>,
    sms: &SmsConfig,
    destination: &str,
    body: &str,
) -> Result<(), ModemError> {
    let cmgs = format!("AT+CMGS=\"{}\"", destination);
    let prompt = match session.execute(&cmgs, sms.prompt_timeout(), 1).await {
        Ok(resp) => resp,
        Err(ModemError::NoResponse { .. }) => String::new(),
        Err(e) => return Err(e),
    };
    if !prompt.lines().any(|l| l.trim() == PROMPT) {
        warn!("No send prompt after {}: {}", cmgs, escape_log(&prompt));
        session.cancel_input();
        return Err(ModemError::NoPrompt);
    }

    let payload = sanitize_body(body);
    let resp = match session.send_payload(&payload, sms.send_timeout()).await {
        Ok(resp) => resp,
        Err(ModemError::NoResponse { .. }) => {
            return Err(ModemError::SendRejected(
                "no confirmation from modem".to_string(),
            ))
        }
        Err(e) => return Err(e),
    };
    if resp.contains(SEND_CONFIRMATION) {
        info!(target: "sms", "Sent SMS to {}: {}", destination, escape_log(body));
        Ok(())
    } else {
        Err(ModemError::SendRejected(escape_log(&resp)))
    }
}

/// Queue worker: drains the outgoing queue one message at a time.
pub struct OutgoingSender {
    exec: Arc<CommandExecutor>,
    rx: mpsc::UnboundedReceiver<OutgoingRequest>,
    sms: SmsConfig,
    charset: Charset,
    shutdown: watch::Receiver<bool>,
}

impl OutgoingSender {
    pub(crate) fn new(
        exec: Arc<CommandExecutor>,
        rx: mpsc::UnboundedReceiver<OutgoingRequest>,
        sms: SmsConfig,
        charset: Charset,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            exec,
            rx,
            sms,
            charset,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        info!("Starting outgoing SMS sender task");
        loop {
            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }
                req = self.rx.recv() => {
                    match req {
                        Some(req) => self.process(req).await,
                        None => {
                            debug!("Outgoing queue closed");
                            break;
                        }
                    }
                }
            }
        }
        // Anything still queued will never be sent; tell the enqueuers.
        self.rx.close();
        while let Ok(req) = self.rx.try_recv() {
            if let Some(reply) = req.reply {
                let _ = reply.send(Err(ModemError::ShuttingDown));
            }
        }
        info!("Outgoing SMS sender task shutting down");
    }

    async fn process(&self, req: OutgoingRequest) {
        let OutgoingRequest { message, reply } = req;
        debug!("Sending queued SMS to {}", message.destination);
        let result = {
            let mut session = self.exec.session().await;
            send_sms_in_session(
                &mut session,
                &self.sms,
                self.charset,
                &message.destination,
                &message.body,
            )
            .await
        };
        if let Err(ref e) = result {
            error!("Failed to send SMS to {}: {}", message.destination, e);
        }
        if let Some(reply) = reply {
            let _ = reply.send(result);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_control_characters_removed() {
        assert_eq!(sanitize_body("a\u{1a}b\u{1b}c"), "abc");
        assert_eq!(sanitize_body("plain text"), "plain text");
    }

    #[test]
    fn destination_must_be_quotable() {
        assert!(check_destination("+15551234567").is_ok());
        assert!(matches!(check_destination(""), Err(ModemError::Parse(_))));
        assert!(matches!(check_destination("+1\"2"), Err(ModemError::Parse(_))));
        assert!(matches!(check_destination("+1\r\n"), Err(ModemError::Parse(_))));
    }

    #[tokio::test]
    async fn closed_queue_resolves_receipt_with_shutdown() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let queue = OutgoingQueue::new(tx);
        let result = queue.enqueue("+1", "x").await;
        assert!(matches!(result, Ok(Err(ModemError::ShuttingDown))));
    }
}
