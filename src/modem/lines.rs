//! Line assembly and the continuous reader task.
//!
//! The modem speaks CRLF-terminated text. [`LineBuffer`] is fed arbitrary
//! chunks and yields whole lines; the trailing partial fragment is kept for the
//! next chunk. [`LineReader`] polls the transport, feeds the buffer and routes
//! each line through the classifier.
use bytes::{Buf, BytesMut};
use log::{debug, info, trace, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

use super::classify::{classify, is_terminal, Route, TransactionSlot, PROMPT};
use super::transport::SharedTransport;
use crate::logutil::{escape_bytes, escape_log};

/// Upper bound on an unterminated fragment before it is discarded.
const MAX_LINE: usize = 16 * 1024;

pub struct LineBuffer {
    buf: BytesMut,
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl LineBuffer {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(1024),
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
        if self.buf.len() > MAX_LINE && !self.buf.contains(&b'\n') {
            warn!(
                "Discarding {} byte unterminated fragment: {}",
                self.buf.len(),
                escape_bytes(&self.buf[..64])
            );
            self.buf.clear();
        }
    }

    /// Next complete, non-empty line with surrounding whitespace removed.
    pub fn next_line(&mut self) -> Option<String> {
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let raw = self.buf.split_to(pos + 1);
            let line = String::from_utf8_lossy(&raw).trim().to_string();
            if !line.is_empty() {
                return Some(line);
            }
        }
        None
    }

    /// The send prompt arrives as `> ` with no terminator. When the pending
    /// fragment is exactly that, consume it and report true.
    pub fn take_prompt(&mut self) -> bool {
        let pending = String::from_utf8_lossy(&self.buf);
        if pending.trim() == PROMPT {
            self.buf.advance(self.buf.len());
            true
        } else {
            false
        }
    }

    /// Bytes held back waiting for a terminator.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

/// Reader task owning the read side of one open transport.
pub struct LineReader {
    transport: SharedTransport,
    buffer: LineBuffer,
    slot: TransactionSlot,
    responses: mpsc::Sender<String>,
    events: mpsc::Sender<String>,
    up: Arc<AtomicBool>,
    shutdown: watch::Receiver<bool>,
    poll_interval: Duration,
}

impl LineReader {
    pub fn new(
        transport: SharedTransport,
        slot: TransactionSlot,
        responses: mpsc::Sender<String>,
        events: mpsc::Sender<String>,
        up: Arc<AtomicBool>,
        shutdown: watch::Receiver<bool>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            transport,
            buffer: LineBuffer::new(),
            slot,
            responses,
            events,
            up,
            shutdown,
            poll_interval,
        }
    }

    /// Poll until shutdown or a transport error. On error the link is marked
    /// down and the task exits; reconnecting is the connection manager's job.
    pub async fn run(mut self) {
        info!("Starting modem reader task");
        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        debug!("Reader task received shutdown signal");
                        break;
                    }
                }
                _ = interval.tick() => {
                    if let Err(e) = self.poll() {
                        warn!("Serial read error, marking link down: {}", e);
                        self.up.store(false, Ordering::SeqCst);
                        break;
                    }
                }
            }
        }

        info!("Modem reader task shutting down");
    }

    /// One read + dispatch pass.
    pub fn poll(&mut self) -> std::io::Result<()> {
        let data = {
            let mut transport = self.transport.lock().unwrap_or_else(|e| e.into_inner());
            transport.read_available()?
        };
        if !data.is_empty() {
            trace!("RAW {} bytes: {}", data.len(), escape_bytes(&data));
            self.buffer.push(&data);
        }
        while let Some(line) = self.buffer.next_line() {
            self.route(line);
        }
        if self.slot.is_active() && self.buffer.take_prompt() {
            self.route(PROMPT.to_string());
        }
        Ok(())
    }

    fn route(&self, line: String) {
        let active = self.slot.current();
        match classify(&line, active.as_deref()) {
            Route::Response => {
                trace!("response line: {}", escape_log(&line));
                let terminal = is_terminal(&line);
                if let Err(e) = self.responses.try_send(line) {
                    warn!("Response queue rejected line: {}", e);
                }
                if terminal {
                    self.slot.finish();
                }
            }
            Route::Event => {
                debug!("event line: {}", escape_log(&line));
                if let Err(e) = self.events.try_send(line) {
                    warn!("Event queue rejected line: {}", e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emits_only_complete_lines() {
        let mut lb = LineBuffer::new();
        lb.push(b"\r\nOK\r\n+CMTI: \"SM\",");
        assert_eq!(lb.next_line().as_deref(), Some("OK"));
        assert_eq!(lb.next_line(), None);
        assert!(lb.pending() > 0);
        lb.push(b"3\r\n");
        assert_eq!(lb.next_line().as_deref(), Some("+CMTI: \"SM\",3"));
        assert_eq!(lb.next_line(), None);
        assert_eq!(lb.pending(), 0);
    }

    #[test]
    fn skips_blank_lines() {
        let mut lb = LineBuffer::new();
        lb.push(b"\r\n\r\n   \r\nRING\r\n");
        assert_eq!(lb.next_line().as_deref(), Some("RING"));
        assert_eq!(lb.next_line(), None);
    }

    #[test]
    fn prompt_without_terminator() {
        let mut lb = LineBuffer::new();
        lb.push(b"\r\n> ");
        assert_eq!(lb.next_line(), None);
        assert!(lb.take_prompt());
        assert_eq!(lb.pending(), 0);

        lb.push(b"partial");
        assert!(!lb.take_prompt());
        assert_eq!(lb.pending(), 7);
    }

    #[test]
    fn oversized_fragment_is_dropped() {
        let mut lb = LineBuffer::new();
        lb.push(&vec![b'A'; MAX_LINE + 1]);
        assert_eq!(lb.pending(), 0);
    }
}
