//! # Configuration Management Module
//!
//! Centralized, serde-backed configuration for the modem engine and the
//! `modemd` binary.
//!
//! ## Configuration Structure
//!
//! - [`ModemConfig`] - Serial link, probing, command timing and init sequence
//! - [`SmsConfig`] - SMS fetch/send timing and duplicate suppression
//! - [`ReplyConfig`] - Keyword auto-reply settings
//! - [`LoggingConfig`] - Log level and log files
//!
//! ## Usage
//!
//! ```rust,no_run
//! use modemd::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml").await?;
//!     println!("Serial Port: {}", config.modem.port);
//!     Config::create_default("config.toml").await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration File Format
//!
//! ```toml
//! [modem]
//! port = "/dev/ttyUSB0"   # empty string = auto-detect
//! baud_rate = 115200
//! charset = "GSM"
//!
//! [sms]
//! dedup_key = "index"
//!
//! [replies]
//! enabled = true
//!
//! [logging]
//! level = "info"
//! file = "modemd.log"
//! ```
//!
//! CLI arguments take precedence over values from the file.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::fs;

/// Character set the modem is asked to report SMS content in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Charset {
    /// Plain GSM alphabet; text is used as-is.
    #[default]
    #[serde(rename = "GSM")]
    Gsm,
    /// UCS-2 as a hex string; sender and body are decoded.
    #[serde(rename = "UCS2")]
    Ucs2,
}

impl Charset {
    /// Name used in `AT+CSCS="<name>"`.
    pub fn at_name(&self) -> &'static str {
        match self {
            Charset::Gsm => "GSM",
            Charset::Ucs2 => "UCS2",
        }
    }
}

/// How already-processed messages are recognised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DedupKeyMode {
    /// Modem storage index from the `+CMTI` notification.
    #[default]
    Index,
    /// `(sender, timestamp, message)` of the parsed message.
    Content,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModemConfig {
    /// Serial device path. Empty means probe the candidate devices.
    #[serde(default)]
    pub port: String,
    pub baud_rate: u32,
    /// Bit rates tried in order while probing.
    #[serde(default = "default_probe_baud_rates")]
    pub probe_baud_rates: Vec<u32>,
    /// How long to wait for `OK` after a probe `AT` (ms).
    #[serde(default = "default_probe_wait_ms")]
    pub probe_wait_ms: u64,
    /// Per-attempt response timeout for ordinary commands (ms).
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Reader idle sleep between polls (ms).
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default)]
    pub charset: Charset,
    /// Commands run after every (re)connect. Failures are logged, not fatal.
    #[serde(default = "default_init_commands")]
    pub init_commands: Vec<String>,
    /// Capacity of the event and response queues.
    #[serde(default = "default_queue_capacity")]
    pub event_queue_capacity: usize,
}

fn default_probe_baud_rates() -> Vec<u32> {
    vec![115200, 9600, 57600, 38400, 19200]
}

fn default_probe_wait_ms() -> u64 {
    1000
}

fn default_command_timeout_ms() -> u64 {
    2000
}

fn default_max_attempts() -> u32 {
    3
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_init_commands() -> Vec<String> {
    vec![
        "AT".to_string(),
        "AT+CMGF=1".to_string(),
        "AT+CNMI=2,1,0,0,0".to_string(),
        "AT+CLIP=1".to_string(),
    ]
}

fn default_queue_capacity() -> usize {
    256
}

impl ModemConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn probe_wait(&self) -> Duration {
        Duration::from_millis(self.probe_wait_ms)
    }

    /// Configured port, or `None` when auto-detection is requested.
    pub fn fixed_port(&self) -> Option<&str> {
        let p = self.port.trim();
        if p.is_empty() {
            None
        } else {
            Some(p)
        }
    }

    /// Init sequence with the charset selection appended when the configured
    /// charset is not already selected by one of the commands.
    pub fn effective_init_commands(&self) -> Vec<String> {
        let mut cmds = self.init_commands.clone();
        if self.charset == Charset::Ucs2
            && !cmds
                .iter()
                .any(|c| c.to_ascii_uppercase().starts_with("AT+CSCS="))
        {
            cmds.push(format!("AT+CSCS=\"{}\"", self.charset.at_name()));
        }
        cmds
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmsConfig {
    /// Wait for the `>` prompt after `AT+CMGS` (ms).
    #[serde(default = "default_prompt_timeout_ms")]
    pub prompt_timeout_ms: u64,
    /// Wait for `+CMGS:` after the payload (ms).
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
    /// Wait for a separately delivered hex body line (ms).
    #[serde(default = "default_hex_body_timeout_ms")]
    pub hex_body_timeout_ms: u64,
    /// Repeated new-message notifications inside this window are ignored (ms).
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    /// How long a processed message is remembered (s).
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
    #[serde(default)]
    pub dedup_key: DedupKeyMode,
    /// Issue `AT+CMGD` after a message has been fetched.
    #[serde(default = "default_true")]
    pub delete_after_read: bool,
}

fn default_prompt_timeout_ms() -> u64 {
    5000
}

fn default_send_timeout_ms() -> u64 {
    10000
}

fn default_hex_body_timeout_ms() -> u64 {
    2000
}

fn default_debounce_ms() -> u64 {
    2000
}

fn default_retention_secs() -> u64 {
    3600
}

fn default_true() -> bool {
    true
}

impl SmsConfig {
    pub fn prompt_timeout(&self) -> Duration {
        Duration::from_millis(self.prompt_timeout_ms)
    }
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
    pub fn hex_body_timeout(&self) -> Duration {
        Duration::from_millis(self.hex_body_timeout_ms)
    }
    pub fn debounce_window(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}

impl Default for SmsConfig {
    fn default() -> Self {
        Self {
            prompt_timeout_ms: default_prompt_timeout_ms(),
            send_timeout_ms: default_send_timeout_ms(),
            hex_body_timeout_ms: default_hex_body_timeout_ms(),
            debounce_ms: default_debounce_ms(),
            retention_secs: default_retention_secs(),
            dedup_key: DedupKeyMode::Index,
            delete_after_read: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ReplyConfig {
    /// Answer `cpu` / `ram` / `signal` keyword messages.
    #[serde(default)]
    pub enabled: bool,
    /// Only reply to these senders. Empty allows everyone.
    #[serde(default)]
    pub allowed_senders: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
    /// Separate log receiving every `target: "sms"` record.
    #[serde(default)]
    pub sms_file: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub modem: ModemConfig,
    #[serde(default)]
    pub sms: SmsConfig,
    #[serde(default)]
    pub replies: ReplyConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a file
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read config file {}: {}", path, e))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse config file {}: {}", path, e))?;

        config.validate()?;
        Ok(config)
    }

    /// Create a default configuration file
    pub async fn create_default(path: &str) -> Result<()> {
        let config = Config::default();
        let content = toml::to_string_pretty(&config)
            .map_err(|e| anyhow!("Failed to serialize default config: {}", e))?;

        fs::write(path, content)
            .await
            .map_err(|e| anyhow!("Failed to write config file {}: {}", path, e))?;

        Ok(())
    }

    /// Reject values the engine cannot operate with.
    pub fn validate(&self) -> Result<()> {
        if self.modem.max_attempts == 0 {
            return Err(anyhow!("modem.max_attempts must be at least 1"));
        }
        if self.modem.baud_rate == 0 {
            return Err(anyhow!("modem.baud_rate must be non-zero"));
        }
        if self.modem.fixed_port().is_none() && self.modem.probe_baud_rates.is_empty() {
            return Err(anyhow!(
                "modem.probe_baud_rates must not be empty when no port is configured"
            ));
        }
        if self.modem.event_queue_capacity == 0 {
            return Err(anyhow!("modem.event_queue_capacity must be at least 1"));
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            modem: ModemConfig {
                port: "/dev/ttyUSB0".to_string(),
                baud_rate: 115200,
                probe_baud_rates: default_probe_baud_rates(),
                probe_wait_ms: default_probe_wait_ms(),
                command_timeout_ms: default_command_timeout_ms(),
                max_attempts: default_max_attempts(),
                poll_interval_ms: default_poll_interval_ms(),
                charset: Charset::Gsm,
                init_commands: default_init_commands(),
                event_queue_capacity: default_queue_capacity(),
            },
            sms: SmsConfig::default(),
            replies: ReplyConfig::default(),
            logging: LoggingConfig {
                level: "info".to_string(),
                file: Some("modemd.log".to_string()),
                sms_file: Some("modemd-sms.log".to_string()),
            },
        }
    }
}
