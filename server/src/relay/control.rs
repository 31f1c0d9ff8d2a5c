//! Demultiplexing control envelopes from terminal data.
//!
//! Clients send keystrokes and control messages over the same connection. A
//! text frame is a control message only if it parses *strictly* as one;
//! anything else, including malformed or unrelated JSON, is terminal input.

use serde::Deserialize;

/// Structured messages a client can interleave with terminal input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlMessage {
    /// `{"type":"resize","cols":<int>,"rows":<int>}`. Unknown extra fields are
    /// tolerated.
    Resize { cols: u16, rows: u16 },
}

/// A classified text frame.
#[derive(Debug, PartialEq, Eq)]
pub enum ClientFrame<'a> {
    Control(ControlMessage),
    Data(&'a [u8]),
}

/// Classify a text frame. Pure; never fails.
pub fn classify_text(text: &str) -> ClientFrame<'_> {
    // Keystrokes are by far the common case; skip JSON parsing for them.
    if text.trim_start().starts_with('{') {
        if let Ok(msg) = serde_json::from_str::<ControlMessage>(text) {
            return ClientFrame::Control(msg);
        }
    }
    ClientFrame::Data(text.as_bytes())
}
