mod common;

use std::time::Duration;

use common::{connected, fast_config};
use modemd::config::Charset;
use modemd::modem::transport::mock::reply;
use modemd::modem::ModemError;

const CMGS: &str = "AT+CMGS=\"+15551234567\"";

fn prompting_modem(cmd: &str) -> String {
    if cmd == CMGS {
        // Prompt arrives without a line terminator
        "\r\n> ".to_string()
    } else if cmd.ends_with('\u{1a}') {
        reply(&["+CMGS: 12", "OK"])
    } else {
        reply(&["OK"])
    }
}

#[tokio::test]
async fn send_sms_completes_two_phase_handshake() {
    let (mock, modem) = connected(fast_config()).await;
    mock.set_responder(prompting_modem);

    tokio_test::assert_ok!(modem.send_sms("+15551234567", "Hi").await);

    let written = mock.written();
    let tail: Vec<&str> = written.iter().rev().take(4).rev().map(String::as_str).collect();
    assert_eq!(
        tail,
        vec!["AT+CMGF=1", "AT+CSCS=\"GSM\"", CMGS, "Hi\u{1a}"]
    );
    modem.stop().await;
}

#[tokio::test]
async fn missing_prompt_fails_without_payload() {
    let (mock, modem) = connected(fast_config()).await;
    mock.set_responder(|cmd| {
        if cmd == CMGS {
            String::new()
        } else {
            reply(&["OK"])
        }
    });

    let err = modem.send_sms("+15551234567", "Hi").await.unwrap_err();
    assert!(matches!(err, ModemError::NoPrompt), "{err:?}");
    assert_eq!(mock.count_writes(CMGS), 1, "prompt step is not retried");
    assert!(!mock.written().iter().any(|w| w.starts_with("Hi")));
    // Pending input was cancelled with ESC
    assert_eq!(mock.count_writes("\u{1b}"), 1);
    modem.stop().await;
}

#[tokio::test]
async fn payload_without_confirmation_is_rejected() {
    let (mock, modem) = connected(fast_config()).await;
    mock.set_responder(|cmd| {
        if cmd == CMGS {
            "\r\n> ".to_string()
        } else if cmd.ends_with('\u{1a}') {
            reply(&["+CMS ERROR: 500"])
        } else {
            reply(&["OK"])
        }
    });

    let err = modem.send_sms("+15551234567", "Hi").await.unwrap_err();
    assert!(matches!(err, ModemError::SendRejected(_)), "{err:?}");
    modem.stop().await;
}

#[tokio::test]
async fn payload_is_not_sent_over_a_new_link() {
    let (mock, modem) = connected(fast_config()).await;
    mock.set_responder(prompting_modem);

    let mut session = modem.session().await;
    let prompt = session
        .execute(CMGS, Duration::from_millis(150), 1)
        .await
        .unwrap();
    assert_eq!(prompt, ">");

    mock.break_link();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let err = session
        .send_payload("Hi", Duration::from_millis(300))
        .await
        .unwrap_err();
    assert!(matches!(err, ModemError::Transport(_)), "{err:?}");
    drop(session);

    assert_eq!(mock.opens().len(), 1, "reconnected mid-send");
    assert!(!mock.written().iter().any(|w| w.ends_with('\u{1a}')));
    modem.stop().await;
}

#[tokio::test]
async fn control_characters_are_stripped_from_body() {
    let (mock, modem) = connected(fast_config()).await;
    mock.set_responder(prompting_modem);

    modem
        .send_sms("+15551234567", "a\u{1a}b\u{1b}c")
        .await
        .unwrap();
    assert_eq!(mock.count_writes("abc\u{1a}"), 1);
    modem.stop().await;
}

#[tokio::test]
async fn ucs2_receive_charset_is_restored_after_send() {
    let mut cfg = fast_config();
    cfg.modem.charset = Charset::Ucs2;
    let (mock, modem) = connected(cfg).await;
    mock.set_responder(prompting_modem);

    modem.send_sms("+15551234567", "Hi").await.unwrap();
    assert_eq!(
        mock.written().last().map(String::as_str),
        Some("AT+CSCS=\"UCS2\"")
    );
    modem.stop().await;
}

#[tokio::test]
async fn queued_message_reports_result_to_enqueuer() {
    let (mock, modem) = connected(fast_config()).await;
    mock.set_responder(prompting_modem);

    let receipt = modem.enqueue_outgoing("+15551234567", "queued");
    let result = tokio::time::timeout(Duration::from_secs(2), receipt)
        .await
        .expect("sender answered")
        .expect("receipt not dropped");
    assert!(result.is_ok());
    assert_eq!(mock.count_writes("queued\u{1a}"), 1);
    modem.stop().await;
}

#[tokio::test]
async fn queued_messages_go_out_in_order() {
    let (mock, modem) = connected(fast_config()).await;
    mock.set_responder(|cmd| {
        if cmd.starts_with("AT+CMGS=") {
            "\r\n> ".to_string()
        } else if cmd.ends_with('\u{1a}') {
            reply(&["+CMGS: 1", "OK"])
        } else {
            reply(&["OK"])
        }
    });

    let first = modem.enqueue_outgoing("+1", "one");
    let second = modem.enqueue_outgoing("+2", "two");
    assert!(second.await.unwrap().is_ok());
    assert!(first.await.unwrap().is_ok());

    let payloads: Vec<String> = mock
        .written()
        .into_iter()
        .filter(|w| w.ends_with('\u{1a}'))
        .collect();
    assert_eq!(payloads, vec!["one\u{1a}", "two\u{1a}"]);
    modem.stop().await;
}

#[tokio::test]
async fn enqueue_after_stop_reports_shutdown() {
    let (_mock, modem) = connected(fast_config()).await;
    modem.stop().await;
    let result = modem.enqueue_outgoing("+1", "late").await;
    assert!(matches!(result, Ok(Err(ModemError::ShuttingDown))));
}

#[tokio::test]
async fn unquotable_destination_is_refused_before_writing() {
    let (mock, modem) = connected(fast_config()).await;
    let before = mock.written().len();
    let err = tokio_test::assert_err!(modem.send_sms("+1\"; AT+CFUN=0", "x").await);
    assert!(matches!(err, ModemError::Parse(_)));
    assert_eq!(mock.written().len(), before);
    modem.stop().await;
}
