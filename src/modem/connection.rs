//! Port discovery, link setup and modem initialization.
use log::{debug, info, warn};
use serde::Serialize;
use std::io;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;

use super::classify::{response_ok, TransactionSlot};
use super::executor::{ExecSession, Link, CRLF};
use super::lines::LineReader;
use super::transport::{Connector, SharedTransport};
use crate::config::ModemConfig;
use crate::logutil::{escape_bytes, escape_log};

/// Outcome of a successful probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeResult {
    pub port: String,
    pub baud_rate: u32,
}

pub struct ConnectionManager {
    config: ModemConfig,
    connector: Arc<dyn Connector>,
    slot: TransactionSlot,
    events: mpsc::Sender<String>,
}

impl ConnectionManager {
    pub fn new(
        config: ModemConfig,
        connector: Arc<dyn Connector>,
        slot: TransactionSlot,
        events: mpsc::Sender<String>,
    ) -> Self {
        Self {
            config,
            connector,
            slot,
            events,
        }
    }

    /// Try each candidate device at each configured bit rate and return the
    /// first pair that answers a bare `AT` with `OK`.
    pub async fn probe(&self) -> Option<ProbeResult> {
        probe_ports(self.connector.as_ref(), &self.config).await
    }

    /// Resolve the port, open the transport, start the reader and run the
    /// init sequence on `session`, which must not hold a live link.
    pub async fn establish(&self, session: &mut ExecSession<'_>) -> io::Result<()> {
        let target = match self.config.fixed_port() {
            Some(port) => ProbeResult {
                port: port.to_string(),
                baud_rate: self.config.baud_rate,
            },
            None => self.probe().await.ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotFound, "no working modem port found")
            })?,
        };

        let link = self.open_link(&target)?;
        info!("Connected to modem on {}", link.description());
        session.install_link(link);
        self.initialize(session).await;
        Ok(())
    }

    fn open_link(&self, target: &ProbeResult) -> io::Result<Link> {
        let transport = self.connector.open(&target.port, target.baud_rate)?;
        let description = transport.describe();
        let transport: SharedTransport = Arc::new(Mutex::new(transport));
        let (response_tx, response_rx) = mpsc::channel(self.config.event_queue_capacity);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let up = Arc::new(AtomicBool::new(true));

        let reader = LineReader::new(
            transport.clone(),
            self.slot.clone(),
            response_tx,
            self.events.clone(),
            up.clone(),
            shutdown_rx,
            self.config.poll_interval(),
        );
        let handle = tokio::spawn(reader.run());

        Ok(Link {
            transport,
            responses: response_rx,
            up,
            reader: Some(handle),
            shutdown: shutdown_tx,
            description,
        })
    }

    /// Run the init commands in order. Individual failures are logged and the
    /// sequence continues.
    async fn initialize(&self, session: &mut ExecSession<'_>) {
        for cmd in self.config.effective_init_commands() {
            let result = session
                .transact(
                    &cmd,
                    CRLF,
                    self.config.command_timeout(),
                    self.config.max_attempts,
                )
                .await;
            match result {
                Ok(resp) if response_ok(&resp) => {
                    info!("Init {} -> {}", cmd, escape_log(&resp));
                }
                Ok(resp) => {
                    warn!("Init {} rejected: {}", cmd, escape_log(&resp));
                }
                Err(e) => {
                    warn!("Init {} failed: {}", cmd, e);
                }
            }
        }
    }
}

/// Probe candidates with a trial connection per device/rate pair.
pub async fn probe_ports(connector: &dyn Connector, config: &ModemConfig) -> Option<ProbeResult> {
    let ports = match config.fixed_port() {
        Some(p) => vec![p.to_string()],
        None => connector.candidates(),
    };
    if ports.is_empty() {
        warn!("No candidate serial devices found");
        return None;
    }
    for port in &ports {
        for &baud_rate in &config.probe_baud_rates {
            info!("Attempting to connect to {} with baudrate {}...", port, baud_rate);
            let mut trial = match connector.open(port, baud_rate) {
                Ok(t) => t,
                Err(e) => {
                    debug!("Failed to open {} at {} baud: {}", port, baud_rate, e);
                    continue;
                }
            };
            let answered = match trial.write_all(format!("AT{}", CRLF).as_bytes()) {
                Ok(()) => {
                    sleep(config.probe_wait()).await;
                    match trial.read_available() {
                        Ok(data) => {
                            debug!("Probe reply: {}", escape_bytes(&data));
                            String::from_utf8_lossy(&data)
                                .lines()
                                .any(|l| l.trim() == "OK")
                        }
                        Err(e) => {
                            debug!("Probe read on {} failed: {}", port, e);
                            false
                        }
                    }
                }
                Err(e) => {
                    debug!("Probe write on {} failed: {}", port, e);
                    false
                }
            };
            trial.close();
            if answered {
                info!("Found working port: {} at {} baud", port, baud_rate);
                return Some(ProbeResult {
                    port: port.clone(),
                    baud_rate,
                });
            }
        }
    }
    warn!("No working port found");
    None
}
