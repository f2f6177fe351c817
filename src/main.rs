//! Binary entrypoint for the modemd CLI.
//!
//! Commands:
//! - `start [--port <path>] [-b <baud>]` - connect and serve SMS/ring events until Ctrl-C
//! - `init` - create a starter `config.toml`
//! - `probe` - find a responding port and print a JSON summary
//! - `at <COMMAND>` - run one AT command and print the response
//! - `send <DEST> <BODY>` - send one SMS through the outgoing queue
//!
//! See the library crate docs for module-level details: `modemd::`.
use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use log::{error, info};
use std::sync::Arc;
use std::time::Duration;

use modemd::config::Config;
use modemd::modem::events::ModemEvent;
use modemd::modem::Modem;
use modemd::reply::{AutoResponder, NoHostInfo};

#[derive(Parser)]
#[command(name = "modemd")]
#[command(about = "AT command engine for cellular modems")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (can be used before or after subcommand)
    #[arg(short, long, default_value = "config.toml", global = true)]
    config: String,

    /// Verbose logging (-v, -vv for more; may appear before or after subcommand)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to the modem and handle incoming events
    Start {
        /// Modem serial port (e.g., /dev/ttyUSB0); empty config value means probe
        #[arg(short, long)]
        port: Option<String>,

        /// Baud rate for the configured port
        #[arg(short = 'b', long)]
        baud: Option<u32>,
    },
    /// Write a default configuration file
    Init,
    /// Probe candidate ports and bit rates
    Probe,
    /// Execute a single AT command
    At {
        /// Command text, e.g. AT+CSQ
        command: String,
        /// Seconds to wait for a terminal token per attempt
        #[arg(short, long)]
        timeout: Option<u64>,
        /// Attempts before giving up
        #[arg(short, long)]
        attempts: Option<u32>,
    },
    /// Send one SMS
    Send {
        destination: String,
        body: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Init = cli.command {
        init_logging(&None, cli.verbose);
        Config::create_default(&cli.config).await?;
        info!("Configuration file created at {}", cli.config);
        return Ok(());
    }

    let mut config = Config::load(&cli.config).await?;
    init_logging(&Some(config.clone()), cli.verbose);
    info!("Starting modemd v{}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Commands::Init => {}
        Commands::Start { port, baud } => {
            if let Some(port) = port {
                config.modem.port = port;
            }
            if let Some(baud) = baud {
                config.modem.baud_rate = baud;
            }
            let modem = build_modem(config.clone())?;

            if config.replies.enabled {
                modem.subscribe(Arc::new(AutoResponder::new(
                    modem.outgoing_queue(),
                    Arc::new(NoHostInfo),
                    config.replies.allowed_senders.clone(),
                )));
            }
            modem.subscribe(Arc::new(|event: &ModemEvent| {
                if let ModemEvent::Ring { caller, .. } = event {
                    info!(
                        target: "sms",
                        "Call from {}",
                        caller.as_deref().unwrap_or("unknown caller")
                    );
                }
            }));

            modem
                .connect()
                .await
                .map_err(|e| anyhow!("Failed to connect to modem: {}", e))?;
            info!("Modem ready, waiting for events (Ctrl-C to stop)");

            tokio::signal::ctrl_c().await?;
            info!("Shutdown requested");
            modem.stop().await;
        }
        Commands::Probe => {
            let modem = build_modem(config)?;
            match modem.probe().await {
                Some(found) => {
                    let payload = serde_json::json!({
                        "status": "ok",
                        "port": found.port,
                        "baud_rate": found.baud_rate,
                    });
                    println!("{}", payload);
                }
                None => {
                    let payload = serde_json::json!({ "status": "not_found" });
                    println!("{}", payload);
                    std::process::exit(1);
                }
            }
        }
        Commands::At {
            command,
            timeout,
            attempts,
        } => {
            let timeout = timeout
                .map(Duration::from_secs)
                .unwrap_or_else(|| config.modem.command_timeout());
            let attempts = attempts.unwrap_or(config.modem.max_attempts);
            let modem = build_modem(config)?;
            modem
                .connect()
                .await
                .map_err(|e| anyhow!("Failed to connect to modem: {}", e))?;
            let result = modem.execute(&command, timeout, attempts).await;
            modem.stop().await;
            println!("{}", result?);
        }
        Commands::Send { destination, body } => {
            let modem = build_modem(config)?;
            modem
                .connect()
                .await
                .map_err(|e| anyhow!("Failed to connect to modem: {}", e))?;
            let receipt = modem.enqueue_outgoing(&destination, &body);
            let outcome = receipt
                .await
                .map_err(|_| anyhow!("Sender stopped before the message was sent"));
            modem.stop().await;
            match outcome? {
                Ok(()) => println!("Sent to {}", destination),
                Err(e) => {
                    error!("Send to {} failed: {}", destination, e);
                    return Err(e.into());
                }
            }
        }
    }

    Ok(())
}

#[cfg(feature = "serial")]
fn build_modem(config: Config) -> Result<Modem> {
    Ok(Modem::with_serial(config))
}

#[cfg(not(feature = "serial"))]
fn build_modem(_config: Config) -> Result<Modem> {
    log::warn!("Built without the 'serial' feature");
    Err(anyhow!(
        "serial support not compiled in; rebuild with --features serial"
    ))
}

fn open_append(path: &str) -> Option<std::fs::File> {
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .ok()
}

fn init_logging(config: &Option<Config>, verbosity: u8) {
    use std::io::Write;
    let mut builder = env_logger::Builder::new();
    // CLI verbosity overrides the configured level
    let base_level = match verbosity {
        0 => config
            .as_ref()
            .and_then(|c| c.logging.level.parse::<log::LevelFilter>().ok())
            .unwrap_or(log::LevelFilter::Info),
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    builder.filter_level(base_level);

    let Some(cfg) = config else {
        builder.format(|fmt, record| {
            let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
            writeln!(fmt, "{} [{}] {}", ts, record.level(), record.args())
        });
        let _ = builder.try_init();
        return;
    };

    let main_file = cfg
        .logging
        .file
        .as_deref()
        .and_then(open_append)
        .map(|f| std::sync::Arc::new(std::sync::Mutex::new(f)));
    let sms_file = cfg
        .logging
        .sms_file
        .as_deref()
        .and_then(open_append)
        .map(|f| std::sync::Arc::new(std::sync::Mutex::new(f)));
    // With a log file, only echo to the console when running in the foreground
    let echo = main_file.is_none() || atty::is(atty::Stream::Stdout);

    builder.format(move |fmt, record| {
        let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
        let line = format!("{} [{}] {}", ts, record.level(), record.args());

        if let Some(ref file) = main_file {
            if let Ok(mut guard) = file.lock() {
                let _ = writeln!(guard, "{}", line);
            }
        }
        if record.target() == "sms" {
            if let Some(ref file) = sms_file {
                if let Ok(mut guard) = file.lock() {
                    let _ = writeln!(guard, "{}", line);
                }
            }
        }

        if echo {
            writeln!(fmt, "{}", line)
        } else {
            Ok(())
        }
    });
    let _ = builder.try_init();
}
