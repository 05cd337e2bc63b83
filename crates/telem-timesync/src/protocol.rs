//! Time-sync payload layouts.
//!
//! All fields are little-endian `u64`:
//!
//! | Message  | Layout                                 | Minimum |
//! |----------|----------------------------------------|---------|
//! | REQUEST  | `[sequence][t1]`                       | 16      |
//! | RESPONSE | `[sequence][t1][t2][t3]`               | 32      |
//! | ANNOUNCE | `[priority][unix_ms]`                  | 16      |
//!
//! Payloads shorter than the minimum are rejected before any field is read.
//! Trailing bytes beyond the minimum are ignored.

use serde::Serialize;
use std::fmt;
use telem_common::error::{TelemetryError, TelemetryResult};

/// Minimum REQUEST payload length in bytes.
pub const REQUEST_LEN: usize = 16;
/// Minimum RESPONSE payload length in bytes.
pub const RESPONSE_LEN: usize = 32;
/// Minimum ANNOUNCE payload length in bytes.
pub const ANNOUNCE_LEN: usize = 16;

/// Time-sync message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum MessageKind {
    /// Client asks the master for its time.
    Request,
    /// Master answers a request.
    Response,
    /// Master broadcasts absolute time.
    Announce,
}

impl MessageKind {
    /// Minimum payload length for this kind.
    #[must_use]
    pub fn min_len(self) -> usize {
        match self {
            Self::Request => REQUEST_LEN,
            Self::Response => RESPONSE_LEN,
            Self::Announce => ANNOUNCE_LEN,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::Response => "response",
            Self::Announce => "announce",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// REQUEST payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncRequest {
    /// Requester sequence number.
    pub sequence: u64,
    /// Client send time.
    pub t1: u64,
}

/// RESPONSE payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncResponse {
    /// Sequence number echoed from the request.
    pub sequence: u64,
    /// Client send time echoed from the request.
    pub t1: u64,
    /// Master receive time.
    pub t2: u64,
    /// Master reply time.
    pub t3: u64,
}

/// ANNOUNCE payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncAnnounce {
    /// Master priority (reserved for master election).
    pub priority: u64,
    /// Absolute time in milliseconds.
    pub unix_ms: u64,
}

/// Any time-sync message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeSyncMessage {
    /// REQUEST.
    Request(SyncRequest),
    /// RESPONSE.
    Response(SyncResponse),
    /// ANNOUNCE.
    Announce(SyncAnnounce),
}

impl TimeSyncMessage {
    /// Kind of this message.
    #[must_use]
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Request(_) => MessageKind::Request,
            Self::Response(_) => MessageKind::Response,
            Self::Announce(_) => MessageKind::Announce,
        }
    }

    /// Payload fields in wire order.
    #[must_use]
    pub fn words(&self) -> Vec<u64> {
        match *self {
            Self::Request(r) => vec![r.sequence, r.t1],
            Self::Response(r) => vec![r.sequence, r.t1, r.t2, r.t3],
            Self::Announce(a) => vec![a.priority, a.unix_ms],
        }
    }

    /// Encode the payload.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        self.words().iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    /// Decode a payload of the given kind.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::MalformedMessage`] if `payload` is shorter
    /// than the kind's fixed layout.
    pub fn decode(kind: MessageKind, payload: &[u8]) -> TelemetryResult<Self> {
        let words = read_words(kind, payload)?;
        Ok(match kind {
            MessageKind::Request => Self::Request(SyncRequest {
                sequence: words[0],
                t1: words[1],
            }),
            MessageKind::Response => Self::Response(SyncResponse {
                sequence: words[0],
                t1: words[1],
                t2: words[2],
                t3: words[3],
            }),
            MessageKind::Announce => Self::Announce(SyncAnnounce {
                priority: words[0],
                unix_ms: words[1],
            }),
        })
    }
}

fn read_words(kind: MessageKind, payload: &[u8]) -> TelemetryResult<Vec<u64>> {
    let expected = kind.min_len();
    if payload.len() < expected {
        return Err(TelemetryError::MalformedMessage {
            kind: kind.name(),
            expected,
            actual: payload.len(),
        });
    }

    Ok(payload[..expected]
        .chunks_exact(8)
        .map(|chunk| {
            let mut word = [0u8; 8];
            word.copy_from_slice(chunk);
            u64::from_le_bytes(word)
        })
        .collect())
}
