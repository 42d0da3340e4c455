//! Wire protocol decoding for Nexmosphere controllers.
//!
//! Controllers talk a compact line-based text protocol, CR+LF terminated:
//!
//! - `X<AAA><F>[<payload>]` — X-Talk device feedback (AAA = 3-digit
//!   zero-padded address, F = format letter)
//! - `XR[<2-letter-action><3-digit-address>]` — RFID tag event
//! - `D<AAA><F>[<KEY>=<VALUE>]` — diagnostic feedback
//!
//! Decoding is tolerant by design: a malformed bracket section yields no
//! feedback at all, and non-numeric address fields decode to 0. Nothing at
//! this layer is ever a hard error.

/// Outbound commands are framed with CR+LF, matching the controller firmware.
pub const LINE_TERMINATOR: &str = "\r\n";

/// Highest addressable device; address 0 is reserved by convention.
pub const MAX_DEVICE_ADDRESS: u16 = 999;

/// Protocol class of a decoded line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedbackKind {
    /// `X...` — X-Talk device feedback.
    DeviceTalk,
    /// `XR[...]` — RFID tag movement.
    RfidTag,
    /// `D...` — diagnostic feedback.
    Diagnostic,
    /// Anything else; carried through but never produces an event.
    Other,
}

/// One decoded line of controller feedback.
///
/// Ephemeral: created per incoming line, consumed within the same decode
/// step. The ingestion loop keeps the most recent one around to correlate
/// paired RFID events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Feedback {
    pub kind: FeedbackKind,
    /// Sub-command format letter; `None` for RFID tag lines.
    pub format: Option<char>,
    /// Payload between the first `[` and first `]`, whitespace-trimmed.
    pub command: String,
    pub address: u16,
    /// Original line as received.
    pub raw: String,
}

/// Decodes a raw feedback line (terminator already stripped).
///
/// Returns `None` when the bracketed section is absent or misordered;
/// callers must treat that as unparseable and skip the line.
pub fn decode_feedback(line: &str) -> Option<Feedback> {
    let open = line.find('[')?;
    let close = line.find(']')?;
    if close < open {
        return None;
    }
    let command = line[open + 1..close].trim().to_string();

    // RFID tag lines encode the antenna address inside the payload,
    // after a 2-letter action code.
    if line.starts_with("XR") {
        let address = command
            .get(2..)
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        return Some(Feedback {
            kind: FeedbackKind::RfidTag,
            format: None,
            command,
            address,
            raw: line.to_string(),
        });
    }

    let kind = match line.chars().next()? {
        'X' => FeedbackKind::DeviceTalk,
        'D' => FeedbackKind::Diagnostic,
        _ => FeedbackKind::Other,
    };
    let address = line
        .get(1..4)
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);
    let format = line.chars().nth(4).filter(|c| *c != '[');

    Some(Feedback {
        kind,
        format,
        command,
        address,
        raw: line.to_string(),
    })
}

/// Outbound `TYPE` discovery probe for one address: `D<AAA>B[TYPE]`.
pub fn type_probe(address: u16) -> String {
    format!("D{address:03}B[TYPE]")
}

/// Outbound RFID reader status probe: `X<AAA>B[]`.
pub fn rfid_status_probe(address: u16) -> String {
    format!("X{address:03}B[]")
}
