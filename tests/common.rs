//! Test utilities & fixtures.
//! Builds engines on top of the in-memory mock modem with short timings.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use modemd::config::Config;
use modemd::modem::transport::mock::{MockConnector, MockModem};
use modemd::modem::Modem;

/// Defaults with timings shrunk so failure paths finish quickly.
pub fn fast_config() -> Config {
    let mut cfg = Config::default();
    cfg.modem.port = "/dev/mock0".to_string();
    cfg.modem.command_timeout_ms = 150;
    cfg.modem.poll_interval_ms = 5;
    cfg.modem.probe_wait_ms = 20;
    cfg.sms.prompt_timeout_ms = 150;
    cfg.sms.send_timeout_ms = 300;
    cfg.sms.hex_body_timeout_ms = 100;
    cfg.logging.file = None;
    cfg.logging.sms_file = None;
    cfg
}

pub fn modem_with(mock: &MockModem, config: Config) -> Modem {
    Modem::new(config, Arc::new(MockConnector::new(mock.clone())))
}

/// Connected engine over an always-OK mock.
pub async fn connected(config: Config) -> (MockModem, Modem) {
    let mock = MockModem::always_ok();
    let modem = modem_with(&mock, config);
    modem.connect().await.expect("connect");
    (mock, modem)
}

/// Poll `cond` until it holds or `within` elapses.
pub async fn wait_for<F: Fn() -> bool>(cond: F, within: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cond()
}
