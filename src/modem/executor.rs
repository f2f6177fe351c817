//! Single-flight command execution.
//!
//! Every write to the modem happens while holding the execution lock owned by
//! [`CommandExecutor`]. A caller obtains an [`ExecSession`] (the lock guard) and
//! can run one or several commands without anybody else interposing, which is
//! what the two-phase `AT+CMGS` send depends on.
//!
//! State per attempt: `Idle -> Sent -> {Completed | TimedOut} -> Idle`.
use log::{debug, error, info, warn};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::classify::{is_terminal, TransactionSlot};
use super::connection::ConnectionManager;
use super::transport::SharedTransport;
use super::ModemError;
use crate::logutil::escape_log;

/// Line terminator appended to ordinary commands.
pub const CRLF: &str = "\r\n";
/// Ends an SMS payload.
pub const CTRL_Z: char = '\u{1a}';
/// Cancels a pending SMS payload.
pub const ESC: char = '\u{1b}';

/// An open transport together with its reader task.
pub struct Link {
    pub(crate) transport: SharedTransport,
    pub(crate) responses: mpsc::Receiver<String>,
    pub(crate) up: Arc<AtomicBool>,
    pub(crate) reader: Option<JoinHandle<()>>,
    pub(crate) shutdown: watch::Sender<bool>,
    pub(crate) description: String,
}

enum Collected {
    Complete(Vec<String>),
    TimedOut(Vec<String>),
    Closed,
}

impl Link {
    pub fn is_up(&self) -> bool {
        self.up.load(Ordering::SeqCst)
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Synchronous write on the calling task. Serial ports are opened with
    /// `transport::IO_TIMEOUT`, so a stalled line fails with `TimedOut`
    /// instead of parking the runtime thread.
    fn write(&self, data: &[u8]) -> io::Result<()> {
        let mut transport = self.transport.lock().unwrap_or_else(|e| e.into_inner());
        transport.write_all(data)
    }

    /// Drop lines left behind by an earlier attempt that timed out.
    fn discard_stale(&mut self) {
        let mut dropped = 0usize;
        while let Ok(line) = self.responses.try_recv() {
            debug!("discarding stale response line: {}", escape_log(&line));
            dropped += 1;
        }
        if dropped > 0 {
            debug!("discarded {} stale response lines", dropped);
        }
    }

    async fn collect(&mut self, timeout: Duration) -> Collected {
        let deadline = Instant::now() + timeout;
        let mut lines = Vec::new();
        loop {
            match tokio::time::timeout_at(deadline, self.responses.recv()).await {
                Ok(Some(line)) => {
                    let done = is_terminal(&line);
                    lines.push(line);
                    if done {
                        return Collected::Complete(lines);
                    }
                }
                Ok(None) => return Collected::Closed,
                Err(_) => return Collected::TimedOut(lines),
            }
        }
    }

    /// Stop the reader, wait for it, and release the device.
    pub async fn close(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(handle) = self.reader.take() {
            if let Err(e) = handle.await {
                warn!("Reader task ended abnormally: {}", e);
            }
        }
        let mut transport = self.transport.lock().unwrap_or_else(|e| e.into_inner());
        transport.close();
        info!("Closed modem link {}", self.description);
    }
}

#[derive(Default)]
pub struct ExecState {
    pub(crate) link: Option<Link>,
}

/// Owner of the execution lock and the connection manager.
pub struct CommandExecutor {
    state: Mutex<ExecState>,
    slot: TransactionSlot,
    connection: ConnectionManager,
    default_timeout: Duration,
    default_attempts: u32,
    closed: AtomicBool,
    // The installed link's `up` flag, readable without the execution lock
    link_up: StdMutex<Option<Arc<AtomicBool>>>,
}

impl CommandExecutor {
    pub fn new(
        slot: TransactionSlot,
        connection: ConnectionManager,
        default_timeout: Duration,
        default_attempts: u32,
    ) -> Self {
        Self {
            state: Mutex::new(ExecState::default()),
            slot,
            connection,
            default_timeout,
            default_attempts: default_attempts.max(1),
            closed: AtomicBool::new(false),
            link_up: StdMutex::new(None),
        }
    }

    /// Acquire the execution lock. Callers queue here in arrival order.
    pub async fn session(&self) -> ExecSession<'_> {
        ExecSession {
            state: self.state.lock().await,
            exec: self,
        }
    }

    /// Run one command under its own session.
    pub async fn execute(
        &self,
        command: &str,
        timeout: Duration,
        max_attempts: u32,
    ) -> Result<String, ModemError> {
        self.session().await.execute(command, timeout, max_attempts).await
    }

    pub async fn execute_default(&self, command: &str) -> Result<String, ModemError> {
        self.session().await.execute_default(command).await
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    pub fn default_attempts(&self) -> u32 {
        self.default_attempts
    }

    pub(crate) fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    /// Refuse all further commands; used by `Modem::stop`.
    pub(crate) fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Link status without waiting for an in-flight command.
    pub fn link_is_up(&self) -> bool {
        let up = self.link_up.lock().unwrap_or_else(|e| e.into_inner());
        up.as_ref()
            .map(|flag| flag.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    fn publish_link(&self, flag: Option<Arc<AtomicBool>>) {
        *self.link_up.lock().unwrap_or_else(|e| e.into_inner()) = flag;
    }
}

/// Exclusive right to talk to the modem. Dropping it releases the lock.
pub struct ExecSession<'a> {
    state: MutexGuard<'a, ExecState>,
    exec: &'a CommandExecutor,
}

impl<'a> ExecSession<'a> {
    pub fn is_connected(&self) -> bool {
        self.state.link.as_ref().map(Link::is_up).unwrap_or(false)
    }

    pub fn link_description(&self) -> Option<String> {
        self.state.link.as_ref().map(|l| l.description.clone())
    }

    pub(crate) fn install_link(&mut self, link: Link) {
        self.exec.publish_link(Some(link.up.clone()));
        self.state.link = Some(link);
    }

    /// Open the link if it is missing or the reader reported it down. This is
    /// a blocking reconnect performed by the caller that needs the modem.
    pub async fn ensure_connected(&mut self) -> Result<(), ModemError> {
        if self.exec.is_closed() {
            return Err(ModemError::ShuttingDown);
        }
        if self.is_connected() {
            return Ok(());
        }
        if self.state.link.is_some() {
            warn!("Modem link is down, reconnecting");
            self.disconnect().await;
        } else {
            info!("Modem not connected, connecting");
        }
        let exec = self.exec;
        match exec.connection().establish(self).await {
            Ok(()) => Ok(()),
            Err(e) => {
                error!("Reconnect failed: {}", e);
                Err(ModemError::NotConnected)
            }
        }
    }

    /// Close the current link, if any.
    pub async fn disconnect(&mut self) {
        if let Some(link) = self.state.link.take() {
            self.exec.publish_link(None);
            link.close().await;
        }
    }

    /// `execute(command, timeout, maxAttempts)`: write `command` + CRLF and
    /// wait for a terminal token, retrying immediately on timeout.
    pub async fn execute(
        &mut self,
        command: &str,
        timeout: Duration,
        max_attempts: u32,
    ) -> Result<String, ModemError> {
        self.ensure_connected().await?;
        self.transact(command, CRLF, timeout, max_attempts).await
    }

    pub async fn execute_default(&mut self, command: &str) -> Result<String, ModemError> {
        let (timeout, attempts) = (self.exec.default_timeout, self.exec.default_attempts);
        self.execute(command, timeout, attempts).await
    }

    /// Write an SMS payload terminated by CTRL-Z (no CRLF). Single attempt.
    ///
    /// Never reconnects: the payload is only valid on the link that showed
    /// the `>` prompt, and a fresh link is back in command mode.
    pub async fn send_payload(
        &mut self,
        body: &str,
        timeout: Duration,
    ) -> Result<String, ModemError> {
        if self.exec.is_closed() {
            return Err(ModemError::ShuttingDown);
        }
        if !self.is_connected() {
            warn!("Modem link lost between prompt and payload");
            return Err(ModemError::Transport(io::Error::new(
                io::ErrorKind::NotConnected,
                "link lost before payload",
            )));
        }
        let terminator = CTRL_Z.to_string();
        self.transact(body, &terminator, timeout, 1).await
    }

    /// Abort a pending payload prompt so the modem returns to command mode.
    pub fn cancel_input(&mut self) {
        if let Some(link) = self.state.link.as_ref() {
            if let Err(e) = link.write(ESC.to_string().as_bytes()) {
                warn!("Failed to cancel modem input: {}", e);
            }
        }
    }

    /// Core write/collect loop. Assumes a link is present.
    pub(crate) async fn transact(
        &mut self,
        text: &str,
        terminator: &str,
        timeout: Duration,
        max_attempts: u32,
    ) -> Result<String, ModemError> {
        let attempts = max_attempts.max(1);
        let wire = format!("{}{}", text, terminator);
        for attempt in 1..=attempts {
            let link = self.state.link.as_mut().ok_or(ModemError::NotConnected)?;
            link.discard_stale();

            let _active = self.exec.slot.begin(text);
            debug!("> {} (attempt {}/{})", escape_log(text), attempt, attempts);
            if let Err(e) = link.write(wire.as_bytes()) {
                error!("Write to {} failed: {}", link.description, e);
                link.up.store(false, Ordering::SeqCst);
                return Err(ModemError::Transport(e));
            }

            match link.collect(timeout).await {
                Collected::Complete(lines) => {
                    let response = lines.join("\n");
                    debug!("< {}", escape_log(&response));
                    return Ok(response);
                }
                Collected::TimedOut(partial) => {
                    if !partial.is_empty() {
                        debug!(
                            "partial response without terminal token: {}",
                            escape_log(&partial.join("\n"))
                        );
                    }
                    if attempt < attempts {
                        warn!(
                            "No response to {}. Retrying... (attempt {})",
                            escape_log(text),
                            attempt
                        );
                    }
                }
                Collected::Closed => {
                    link.up.store(false, Ordering::SeqCst);
                    return Err(ModemError::Transport(io::Error::new(
                        io::ErrorKind::BrokenPipe,
                        "serial reader stopped",
                    )));
                }
            }
        }
        error!(
            "No response to {} after {} attempts",
            escape_log(text),
            attempts
        );
        Err(ModemError::NoResponse {
            command: text.to_string(),
            attempts,
        })
    }
}
