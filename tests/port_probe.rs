mod common;

use std::sync::Arc;

use common::fast_config;
use modemd::modem::connection::probe_ports;
use modemd::modem::transport::mock::{reply, MockConnector, MockModem};
use modemd::modem::Modem;

#[tokio::test]
async fn probe_walks_ports_and_rates_in_order() {
    let mock = MockModem::always_ok();
    let connector = MockConnector::new(mock.clone())
        .with_ports(&["/dev/ttyUSB0", "/dev/ttyUSB1"])
        .accept_only("/dev/ttyUSB1", 57600);
    let mut cfg = fast_config();
    cfg.modem.port = String::new();

    let found = probe_ports(&connector, &cfg.modem).await.expect("found");
    assert_eq!(found.port, "/dev/ttyUSB1");
    assert_eq!(found.baud_rate, 57600);

    let opens = mock.opens();
    assert_eq!(
        opens[..7],
        [
            ("/dev/ttyUSB0".to_string(), 115200),
            ("/dev/ttyUSB0".to_string(), 9600),
            ("/dev/ttyUSB0".to_string(), 57600),
            ("/dev/ttyUSB0".to_string(), 38400),
            ("/dev/ttyUSB0".to_string(), 19200),
            ("/dev/ttyUSB1".to_string(), 115200),
            ("/dev/ttyUSB1".to_string(), 9600),
        ]
    );
    assert_eq!(opens.last().unwrap(), &("/dev/ttyUSB1".to_string(), 57600));
}

#[tokio::test]
async fn port_that_answers_error_is_skipped() {
    let mock = MockModem::new();
    mock.set_responder(|_| reply(&["ERROR"]));
    let connector = MockConnector::new(mock.clone()).with_ports(&["/dev/ttyACM0"]);
    let mut cfg = fast_config();
    cfg.modem.port = String::new();
    cfg.modem.probe_baud_rates = vec![115200, 9600];

    assert!(probe_ports(&connector, &cfg.modem).await.is_none());
    assert_eq!(mock.count_writes("AT"), 2);
}

#[tokio::test]
async fn connect_without_port_adopts_probed_device() {
    let mock = MockModem::always_ok();
    let connector = MockConnector::new(mock.clone())
        .with_ports(&["/dev/ttyUSB3"])
        .accept_only("/dev/ttyUSB3", 9600);
    let mut cfg = fast_config();
    cfg.modem.port = String::new();
    let modem = Modem::new(cfg, Arc::new(connector));

    modem.connect().await.expect("connect");
    let session = modem.session().await;
    assert_eq!(
        session.link_description().as_deref(),
        Some("mock:/dev/ttyUSB3")
    );
    drop(session);
    // Trial open at 115200 refused, 9600 probed, then the real open
    assert_eq!(mock.opens().last().unwrap(), &("/dev/ttyUSB3".to_string(), 9600));
    modem.stop().await;
}

#[tokio::test]
async fn no_candidates_means_nothing_found() {
    let mock = MockModem::always_ok();
    let connector = MockConnector::new(mock.clone()).with_ports(&[]);
    let mut cfg = fast_config();
    cfg.modem.port = String::new();
    let modem = Modem::new(cfg, Arc::new(connector));
    assert!(modem.probe().await.is_none());
    assert!(mock.opens().is_empty());
}
