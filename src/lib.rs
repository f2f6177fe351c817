//! # modemd - AT command engine for cellular modems
//!
//! modemd drives a serial cellular modem with AT commands, receives SMS and
//! call notifications, and sends SMS (including keyword auto-replies).
//!
//! ## Features
//!
//! - **Single-flight execution**: one command on the wire at a time, with
//!   per-command timeout and immediate retries.
//! - **Line demultiplexing**: a reader task splits the serial stream into
//!   command responses and unsolicited notifications.
//! - **SMS receive**: `+CMTI` notifications trigger fetch, decode (including
//!   UCS-2 hex), duplicate suppression and delete.
//! - **SMS send**: the two-phase `AT+CMGS` handshake from a background queue.
//! - **Port discovery**: probes candidate devices and bit rates, reconnects
//!   on demand after a link failure.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use modemd::config::Config;
//! use modemd::modem::events::ModemEvent;
//! use modemd::modem::Modem;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml").await?;
//!     let modem = Modem::with_serial(config);
//!
//!     modem.subscribe(Arc::new(|event: &ModemEvent| println!("{:?}", event)));
//!     modem.connect().await?;
//!
//!     let signal = modem.execute_default("AT+CSQ").await?;
//!     println!("{}", signal);
//!
//!     modem.stop().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`modem`] - Transport, line routing, command executor, event dispatch
//! - [`sms`] - `+CMGR` decoding, duplicate suppression, outgoing queue
//! - [`reply`] - Keyword auto-replies
//! - [`config`] - Configuration management and validation
//! - [`logutil`] - Log-safe rendering of wire text

pub mod config;
pub mod logutil;
pub mod modem;
pub mod reply;
pub mod sms;
