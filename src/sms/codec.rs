//! Text-mode SMS decoding: `+CMGR` responses and UCS-2 hex payloads.
//!
//! Header format (quoting and the alpha field vary by firmware):
//!
//! ```text
//! +CMGR: "REC UNREAD","+15551234567",,"24/01/01,12:00:00"
//! +CMGR: "REC READ","+15551234567","24/01/01,12:00:00+04"
//! ```
//!
//! Decoding never fails hard: malformed input degrades to `Unknown` fields or
//! the undecoded input.
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::modem::classify::{is_terminal, OK};

pub const UNKNOWN: &str = "Unknown";
const HEADER_TOKEN: &str = "+CMGR:";

/// A received message as read from modem storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParsedSms {
    /// Storage index the message was read from.
    pub index: u32,
    pub status: String,
    pub sender: String,
    /// Timestamp exactly as the modem reported it.
    pub timestamp_raw: String,
    pub message: String,
    pub received_at: DateTime<Utc>,
}

impl ParsedSms {
    fn unknown(index: u32) -> Self {
        Self {
            index,
            status: UNKNOWN.to_string(),
            sender: UNKNOWN.to_string(),
            timestamp_raw: UNKNOWN.to_string(),
            message: String::new(),
            received_at: Utc::now(),
        }
    }
}

/// Header could not be located or read. Carries the best-effort result.
#[derive(Debug, Clone, Error)]
#[error("malformed +CMGR response: {reason}")]
pub struct ParseError {
    pub reason: String,
    pub partial: ParsedSms,
}

/// Split on commas that are outside double quotes, stripping the quotes.
fn split_fields(s: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut cur = String::new();
    let mut quoted = false;
    for ch in s.chars() {
        match ch {
            '"' => quoted = !quoted,
            ',' if !quoted => fields.push(std::mem::take(&mut cur).trim().to_string()),
            c => cur.push(c),
        }
    }
    fields.push(cur.trim().to_string());
    fields
}

fn field_or_unknown(fields: &[String], idx: usize) -> String {
    match fields.get(idx) {
        Some(f) if !f.is_empty() => f.clone(),
        _ => UNKNOWN.to_string(),
    }
}

/// Header fields in order: status, sender, timestamp.
///
/// Four or more fields: `status,sender,<alpha>,timestamp[,...]`.
/// Three fields: `status,sender,timestamp`.
pub fn parse_header(line: &str) -> (String, String, String) {
    let rest = line
        .trim()
        .strip_prefix(HEADER_TOKEN)
        .unwrap_or(line)
        .trim();
    let fields = split_fields(rest);
    let status = field_or_unknown(&fields, 0);
    let sender = field_or_unknown(&fields, 1);
    let timestamp = if fields.len() >= 4 {
        field_or_unknown(&fields, 3)
    } else {
        field_or_unknown(&fields, 2)
    };
    (status, sender, timestamp)
}

/// Parse a joined `AT+CMGR=<index>` response.
///
/// The body is every non-empty line after the header, up to the terminal
/// token. Echo lines before the header are ignored.
pub fn parse_cmgr(response: &str, index: u32) -> Result<ParsedSms, ParseError> {
    let lines: Vec<&str> = response.lines().map(str::trim).collect();
    let mut sms = ParsedSms::unknown(index);

    let Some(pos) = lines.iter().position(|l| l.starts_with(HEADER_TOKEN)) else {
        sms.message = lines
            .iter()
            .filter(|l| !l.is_empty() && !is_terminal(l) && !l.starts_with("AT"))
            .cloned()
            .collect::<Vec<_>>()
            .join("\n");
        return Err(ParseError {
            reason: "no +CMGR header".to_string(),
            partial: sms,
        });
    };

    let (status, sender, timestamp) = parse_header(lines[pos]);
    sms.status = status;
    sms.sender = sender;
    sms.timestamp_raw = timestamp;
    sms.message = lines[pos + 1..]
        .iter()
        .take_while(|l| !is_terminal(l))
        .filter(|l| !l.is_empty())
        .cloned()
        .collect::<Vec<_>>()
        .join("\n");
    Ok(sms)
}

/// True when the response carries the success terminal token.
pub fn fetch_succeeded(response: &str) -> bool {
    response.lines().any(|l| l.trim() == OK)
}

/// True when `s` (ignoring surrounding whitespace) is a non-empty hex string.
pub fn looks_like_hex(s: &str) -> bool {
    let t = s.trim();
    !t.is_empty() && t.chars().all(|c| c.is_ascii_hexdigit())
}

/// Decode a UCS-2 / UTF-16BE hex string. Returns the input unchanged when it
/// is not valid hex, is not a whole number of 16-bit units, or is not valid
/// UTF-16.
pub fn decode_ucs2_hex(input: &str) -> String {
    try_decode_ucs2_hex(input).unwrap_or_else(|| input.to_string())
}

fn try_decode_ucs2_hex(input: &str) -> Option<String> {
    let digits: Vec<u8> = input
        .trim()
        .trim_matches('"')
        .bytes()
        .filter(|b| !b.is_ascii_whitespace())
        .collect();
    if digits.is_empty() || digits.len() % 4 != 0 {
        return None;
    }
    let mut bytes = Vec::with_capacity(digits.len() / 2);
    for pair in digits.chunks(2) {
        let hi = (pair[0] as char).to_digit(16)?;
        let lo = (pair[1] as char).to_digit(16)?;
        bytes.push((hi * 16 + lo) as u8);
    }
    let units: Vec<u16> = bytes
        .chunks(2)
        .map(|c| u16::from_be_bytes([c[0], c[1]]))
        .collect();
    String::from_utf16(&units).ok()
}

/// Encode text as an uppercase UTF-16BE hex string.
pub fn encode_ucs2_hex(text: &str) -> String {
    text.encode_utf16()
        .flat_map(|u| u.to_be_bytes())
        .map(|b| format!("{:02X}", b))
        .collect()
}
