//! Error types for the HL7 engine

use std::time::Duration;

use thiserror::Error;

/// Result type alias used throughout the crate
pub type Result<T> = std::result::Result<T, Hl7Error>;

/// Everything that can go wrong between the wire and a parsed [`Message`](crate::Message).
#[derive(Error, Debug)]
pub enum Hl7Error {
    /// Unterminated or oversized MLLP envelope
    #[error("MLLP framing error: {0}")]
    Framing(String),

    #[error("HL7 parse error: {0}")]
    Parse(String),

    /// No response carrying the control id arrived before the deadline
    #[error("No response for control id '{control_id}' within {timeout:?}")]
    CorrelationTimeout { control_id: String, timeout: Duration },

    #[error("Connection error: {0}")]
    Connection(String),

    /// The peer answered with an MSA code other than accept
    #[error("Peer rejected message '{control_id}' with {code}: {text}")]
    ProtocolNack {
        code: String,
        control_id: String,
        text: String,
    },

    #[error("A listener is already running for device {0}")]
    ListenerExists(String),

    #[error("Control id '{0}' is already awaiting a response on this connection")]
    DuplicateControlId(String),

    #[error("Unknown device: {0}")]
    UnknownDevice(String),

    #[error("Configuration error: {0}")]
    Config(String),

    // tokio-util's codec traits need a From<io::Error>
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Hl7Error {
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse(msg.into())
    }

    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    pub fn framing(msg: impl Into<String>) -> Self {
        Self::Framing(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Whether the caller can reasonably try the same operation again
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Hl7Error::CorrelationTimeout { .. } | Hl7Error::Connection(_) | Hl7Error::Io(_)
        )
    }
}
