use thiserror::Error;

/// Telemetry error types covering argument validation, transport failures,
/// link bring-up, and untrusted protocol input.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TelemetryError {
    /// Null, empty, or inconsistent input to a logging or send call.
    #[error("bad argument: {0}")]
    BadArgument(String),

    /// Transport send failed.
    #[error("I/O failure: {0}")]
    IoFailure(String),

    /// Router, endpoint, or transport side creation failed.
    #[error("initialization failure: {0}")]
    InitializationFailure(String),

    /// Protocol payload shorter than its fixed layout.
    ///
    /// Produced by the decoders; the time-sync endpoint drops these silently
    /// because they originate from an untrusted peer.
    #[error("malformed {kind} message: expected at least {expected} bytes, got {actual}")]
    MalformedMessage {
        /// Message kind being decoded.
        kind: &'static str,
        /// Minimum payload length.
        expected: usize,
        /// Actual payload length.
        actual: usize,
    },

    /// A router queue reached its configured bound.
    #[error("queue full (capacity {capacity})")]
    QueueFull {
        /// Configured queue capacity.
        capacity: usize,
    },

    /// Invalid link lifecycle transition attempted.
    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition {
        /// Source state.
        from: String,
        /// Attempted target state.
        to: String,
    },
}

impl TelemetryError {
    /// Stable numeric result code for this error.
    ///
    /// Zero is reserved for success; every error maps to a negative code.
    #[must_use]
    pub fn code(&self) -> i32 {
        match self {
            Self::BadArgument(_) => -2,
            Self::IoFailure(_) => -3,
            Self::InitializationFailure(_) => -4,
            Self::MalformedMessage { .. } => -5,
            Self::QueueFull { .. } => -6,
            Self::InvalidStateTransition { .. } => -7,
        }
    }
}

/// Textual description for a numeric result code.
///
/// Returns `None` for codes that are not part of the taxonomy.
#[must_use]
pub fn describe_code(code: i32) -> Option<&'static str> {
    match code {
        0 => Some("ok"),
        -2 => Some("bad argument"),
        -3 => Some("I/O failure"),
        -4 => Some("initialization failure"),
        -5 => Some("malformed message"),
        -6 => Some("queue full"),
        -7 => Some("invalid state transition"),
        _ => None,
    }
}

/// Convenience type alias for telemetry operations.
pub type TelemetryResult<T> = Result<T, TelemetryError>;
