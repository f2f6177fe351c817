//! Modem engine: transport, line routing, command execution and event
//! dispatch wired together behind one cloneable [`Modem`] handle.
//!
//! Task layout once connected:
//!
//! ```text
//! serial ──► LineReader ──┬─► responses ──► CommandExecutor (one command at a time)
//!                         └─► events ─────► EventDispatcher ──► subscribers
//! OutgoingQueue ──────────────────────────► OutgoingSender ───► CommandExecutor
//! ```
pub mod classify;
pub mod connection;
pub mod events;
pub mod executor;
pub mod lines;
pub mod transport;

use log::{info, warn};
use std::io;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::sms::sender::{
    send_sms_in_session, OutgoingQueue, OutgoingRequest, OutgoingSender, SendReceipt,
};
use classify::TransactionSlot;
use connection::{ConnectionManager, ProbeResult};
use events::{EventDispatcher, EventHandler, Subscribers};
use executor::{CommandExecutor, ExecSession};
use transport::Connector;

/// Failures surfaced by modem operations.
#[derive(Debug, Error)]
pub enum ModemError {
    /// No link could be opened or re-opened.
    #[error("modem not connected")]
    NotConnected,

    /// Every attempt timed out without a terminal token.
    #[error("no response to {command} after {attempts} attempts")]
    NoResponse { command: String, attempts: u32 },

    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    /// `AT+CMGS` did not produce the `>` payload prompt.
    #[error("modem did not prompt for message text")]
    NoPrompt,

    /// Payload was written but the modem did not confirm with `+CMGS`.
    #[error("message rejected: {0}")]
    SendRejected(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("modem is shutting down")]
    ShuttingDown,
}

/// Channel ends consumed when the background tasks first start.
struct Pending {
    events: mpsc::Receiver<String>,
    outgoing: mpsc::UnboundedReceiver<OutgoingRequest>,
}

struct Inner {
    config: Config,
    exec: Arc<CommandExecutor>,
    subscribers: Subscribers,
    outgoing: OutgoingQueue,
    pending: Mutex<Option<Pending>>,
    tasks: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
}

/// Cloneable handle on one modem.
#[derive(Clone)]
pub struct Modem {
    inner: Arc<Inner>,
}

impl Modem {
    pub fn new(config: Config, connector: Arc<dyn Connector>) -> Self {
        let slot = TransactionSlot::new();
        let (events_tx, events_rx) = mpsc::channel(config.modem.event_queue_capacity);
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);

        let connection =
            ConnectionManager::new(config.modem.clone(), connector, slot.clone(), events_tx);
        let exec = Arc::new(CommandExecutor::new(
            slot,
            connection,
            config.modem.command_timeout(),
            config.modem.max_attempts,
        ));

        Self {
            inner: Arc::new(Inner {
                config,
                exec,
                subscribers: Subscribers::default(),
                outgoing: OutgoingQueue::new(outgoing_tx),
                pending: Mutex::new(Some(Pending {
                    events: events_rx,
                    outgoing: outgoing_rx,
                })),
                tasks: tokio::sync::Mutex::new(Vec::new()),
                shutdown,
            }),
        }
    }

    /// Modem on real serial hardware.
    #[cfg(feature = "serial")]
    pub fn with_serial(config: Config) -> Self {
        Self::new(config, Arc::new(transport::SerialConnector))
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Open the link (probing if no port is configured), run the init
    /// sequence and start the dispatcher and sender tasks.
    pub async fn connect(&self) -> Result<(), ModemError> {
        {
            let mut session = self.inner.exec.session().await;
            session.ensure_connected().await?;
        }
        self.start_tasks().await;
        Ok(())
    }

    async fn start_tasks(&self) {
        let pending = self
            .inner
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(Pending { events, outgoing }) = pending else {
            return;
        };

        let sms = self.inner.config.sms.clone();
        let charset = self.inner.config.modem.charset;

        let dispatcher = EventDispatcher::new(
            self.inner.exec.clone(),
            events,
            self.inner.subscribers.clone(),
            sms.clone(),
            charset,
            self.inner.shutdown.subscribe(),
        );
        let sender = OutgoingSender::new(
            self.inner.exec.clone(),
            outgoing,
            sms,
            charset,
            self.inner.shutdown.subscribe(),
        );

        let mut tasks = self.inner.tasks.lock().await;
        tasks.push(tokio::spawn(dispatcher.run()));
        tasks.push(tokio::spawn(sender.run()));
    }

    /// Run one command and return the joined response lines.
    pub async fn execute(
        &self,
        command: &str,
        timeout: std::time::Duration,
        max_attempts: u32,
    ) -> Result<String, ModemError> {
        self.inner.exec.execute(command, timeout, max_attempts).await
    }

    pub async fn execute_default(&self, command: &str) -> Result<String, ModemError> {
        self.inner.exec.execute_default(command).await
    }

    /// Exclusive access for a multi-command exchange.
    pub async fn session(&self) -> ExecSession<'_> {
        self.inner.exec.session().await
    }

    /// Register a handler for decoded SMS and ring events.
    pub fn subscribe(&self, handler: Arc<dyn EventHandler>) {
        self.inner.subscribers.add(handler);
    }

    pub fn outgoing_queue(&self) -> OutgoingQueue {
        self.inner.outgoing.clone()
    }

    /// Queue a message for the sender task. Never blocks the caller.
    pub fn enqueue_outgoing(&self, destination: &str, body: &str) -> SendReceipt {
        self.inner.outgoing.enqueue(destination, body)
    }

    /// Send a message now, bypassing the queue.
    pub async fn send_sms(&self, destination: &str, body: &str) -> Result<(), ModemError> {
        let mut session = self.inner.exec.session().await;
        send_sms_in_session(
            &mut session,
            &self.inner.config.sms,
            self.inner.config.modem.charset,
            destination,
            body,
        )
        .await
    }

    /// Find a responding port without keeping it open.
    pub async fn probe(&self) -> Option<ProbeResult> {
        self.inner.exec.connection().probe().await
    }

    /// Current link status. Does not wait behind a command in flight.
    pub async fn is_connected(&self) -> bool {
        self.inner.exec.link_is_up()
    }

    /// Stop the background tasks and close the link. Commands issued after
    /// this fail with [`ModemError::ShuttingDown`].
    pub async fn stop(&self) {
        info!("Stopping modem");
        self.inner.exec.mark_closed();
        let _ = self.inner.shutdown.send(true);

        let handles: Vec<_> = self.inner.tasks.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("Modem task ended abnormally: {}", e);
            }
        }

        let mut session = self.inner.exec.session().await;
        session.disconnect().await;
        info!("Modem stopped");
    }
}
