//! Response/event demultiplexing.
//!
//! Solicited output and unsolicited notifications share the same `+`-prefixed
//! syntax. The engine never has two commands outstanding, so the rule is:
//!
//! * no transaction active: every line is an event;
//! * transaction active: known unsolicited notifications are events, every
//!   other line (echo, `+` output, body text, terminal tokens) belongs to the
//!   response.
use std::sync::{Arc, Mutex, MutexGuard};

pub const OK: &str = "OK";
pub const ERROR: &str = "ERROR";
/// Send prompt emitted after `AT+CMGS`.
pub const PROMPT: &str = ">";
/// Vendor error prefixes that also end a transaction.
pub const VENDOR_ERRORS: [&str; 2] = ["+CME ERROR", "+CMS ERROR"];
/// Notification prefixes that are never part of a command response.
pub const UNSOLICITED: [&str; 4] = ["+CMTI:", "+CLIP:", "+CRING:", "RING"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Response,
    Event,
}

/// True when the line ends a transaction.
pub fn is_terminal(line: &str) -> bool {
    line == OK
        || line == ERROR
        || line == PROMPT
        || VENDOR_ERRORS.iter().any(|p| line.starts_with(p))
}

pub fn is_error(line: &str) -> bool {
    line == ERROR || VENDOR_ERRORS.iter().any(|p| line.starts_with(p))
}

/// True when the line is a notification the modem emits unprompted.
pub fn is_unsolicited(line: &str) -> bool {
    line == "RING" || UNSOLICITED.iter().any(|p| p.ends_with(':') && line.starts_with(p))
}

/// Route one trimmed, non-empty line given the active command (if any).
pub fn classify(line: &str, active: Option<&str>) -> Route {
    match active {
        None => Route::Event,
        Some(cmd) if line == cmd.trim() => Route::Response,
        Some(_) if is_terminal(line) => Route::Response,
        Some(_) if is_unsolicited(line) => Route::Event,
        Some(_) => Route::Response,
    }
}

/// True when a joined response ends in `OK`.
pub fn response_ok(response: &str) -> bool {
    response.lines().map(str::trim).any(|l| l == OK)
}

/// The in-flight correlation marker shared by the executor (writer) and the
/// reader (classifier). At most one command is recorded at a time.
#[derive(Clone, Default)]
pub struct TransactionSlot {
    active: Arc<Mutex<Option<String>>>,
}

impl TransactionSlot {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Option<String>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Mark `command` as in flight until the returned guard is dropped.
    pub fn begin(&self, command: &str) -> ActiveTransaction {
        *self.lock() = Some(command.trim().to_string());
        ActiveTransaction { slot: self.clone() }
    }

    /// The terminal token has been routed; lines after it are events even
    /// before the executor releases its guard.
    pub fn finish(&self) {
        *self.lock() = None;
    }

    pub fn current(&self) -> Option<String> {
        self.lock().clone()
    }

    pub fn is_active(&self) -> bool {
        self.lock().is_some()
    }
}

/// Clears the slot on drop, whichever way the attempt ended.
pub struct ActiveTransaction {
    slot: TransactionSlot,
}

impl Drop for ActiveTransaction {
    fn drop(&mut self) {
        *self.slot.lock() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_lines_are_events() {
        for line in ["+CMTI: \"ME\",3", "OK", "RING", "+CSQ: 20,99", "hello"] {
            assert_eq!(classify(line, None), Route::Event, "{line}");
        }
    }

    #[test]
    fn active_lines_belong_to_response() {
        let cmd = Some("AT+CSQ");
        assert_eq!(classify("AT+CSQ", cmd), Route::Response);
        assert_eq!(classify("+CSQ: 20,99", cmd), Route::Response);
        assert_eq!(classify("OK", cmd), Route::Response);
        assert_eq!(classify("+CME ERROR: 10", cmd), Route::Response);
        assert_eq!(classify(">", cmd), Route::Response);
        assert_eq!(classify("Hello", cmd), Route::Response);
    }

    #[test]
    fn notifications_escape_active_transaction() {
        let cmd = Some("AT+CMGR=3");
        assert_eq!(classify("+CMTI: \"SM\",4", cmd), Route::Event);
        assert_eq!(classify("RING", cmd), Route::Event);
        assert_eq!(classify("+CLIP: \"+15551234567\",145", cmd), Route::Event);
        assert_eq!(classify("+CMGR: \"REC UNREAD\",\"+1\",,\"x\"", cmd), Route::Response);
    }

    #[test]
    fn terminal_tokens() {
        assert!(is_terminal("OK"));
        assert!(is_terminal("ERROR"));
        assert!(is_terminal(">"));
        assert!(!is_terminal("> quoted reply"));
        assert!(is_terminal("+CMS ERROR: 500"));
        assert!(!is_terminal("+CMGS: 12"));
        assert!(!is_terminal("OKAY"));
        assert!(is_error("+CME ERROR: SIM not inserted"));
        assert!(!is_error("OK"));
    }

    #[test]
    fn slot_clears_on_drop() {
        let slot = TransactionSlot::new();
        {
            let _t = slot.begin("AT\r\n");
            assert_eq!(slot.current().as_deref(), Some("AT"));
        }
        assert!(!slot.is_active());
    }

    #[test]
    fn response_ok_checks_lines() {
        assert!(response_ok("AT\n+CSQ: 1,2\nOK"));
        assert!(!response_ok("AT\nERROR"));
        assert!(!response_ok("BOOK"));
    }
}
