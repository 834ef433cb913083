//! Typed error model
//!
//! One variant per error kind named in the design's error-handling table.
//! Each variant either maps to a wire-level SIP response via
//! [`SipError::status_code`] or is meant to be logged and the offending
//! datagram dropped.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SipError {
    /// Malformed datagram; the codec could not even find a first line or a header colon.
    #[error("failed to parse SIP message: {0}")]
    Parse(String),

    /// Structural validation failed (bad URI, missing header, malformed SDP,
    /// self-call where `From`/`To` user parts match, ...).
    #[error("validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),

    /// The request names an extension outside the configured range.
    #[error("unknown extension: {0}")]
    UnknownExtension(String),

    /// The request names a known extension with no live binding.
    #[error("unregistered party: {0}")]
    UnregisteredParty(String),

    /// The callee is already in an active call.
    #[error("busy: {0}")]
    Busy(String),

    /// A dialog in `INITIATED` exceeded `CALL_SETUP_TIMEOUT`.
    #[error("call setup timed out: {0}")]
    SetupTimeout(String),

    /// ACK/BYE/response referencing a Call-ID with no matching dialog.
    #[error("unknown dialog: {0}")]
    UnknownDialog(String),

    /// RTP datagram whose source matched no stream table entry.
    #[error("unmatched RTP source: {0}")]
    UnmatchedRtp(String),

    /// Anything else unexpected; carries enough context to log, and a 500
    /// is sent only when the caller had enough headers to build one.
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl SipError {
    /// The SIP status code a client should see for this error, if any.
    /// `None` means the failure is invisible to the peer: the datagram is
    /// dropped and logged.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            SipError::Validation(_) => Some(400),
            SipError::UnknownExtension(_) | SipError::UnregisteredParty(_) => Some(404),
            SipError::Busy(_) => Some(486),
            SipError::Internal(_) => Some(500),
            SipError::Parse(_)
            | SipError::SetupTimeout(_)
            | SipError::UnknownDialog(_)
            | SipError::UnmatchedRtp(_) => None,
        }
    }

    /// The default reason phrase for this error's status code.
    pub fn reason_phrase(&self) -> &'static str {
        match self.status_code() {
            Some(400) => "Bad Request",
            Some(404) => "Not Found",
            Some(486) => "Busy Here",
            Some(500) => "Internal Server Error",
            _ => "",
        }
    }
}
