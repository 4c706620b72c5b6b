//! Control signals posted from the page to the worker.

use tracing::debug;

/// Wire value of the skip-waiting signal.
pub const SKIP_WAITING: &str = "SKIP_WAITING";

/// Recognised control messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMessage {
    /// Activate the waiting version now.
    SkipWaiting,
}

impl ControlMessage {
    /// Parse a posted message. Unrecognised messages yield `None`.
    ///
    /// Accepts the bare value or a JSON string, with surrounding whitespace.
    pub fn parse(data: &str) -> Option<Self> {
        let trimmed = data.trim();
        let value = match serde_json::from_str::<String>(trimmed) {
            Ok(unquoted) => unquoted,
            Err(_) => trimmed.to_string(),
        };

        match value.trim() {
            SKIP_WAITING => Some(ControlMessage::SkipWaiting),
            _ => {
                debug!(len = data.len(), "Ignoring unrecognised control message");
                None
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ControlMessage::SkipWaiting => SKIP_WAITING,
        }
    }
}
