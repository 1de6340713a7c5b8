use std::fmt;
use thiserror::Error;

use crate::domain::email::MessageToken;

/// Failures surfaced by transports and the store.
///
/// `Connection` and `Protocol` abort a batch. `Fetch` and `Storage` are
/// confined to the message they happened on.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("fetch of message {token} failed: {reason}")]
    Fetch { token: MessageToken, reason: String },

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),
}

impl IngestError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, IngestError::Connection(_) | IngestError::Protocol(_))
    }
}

/// Why a single message was not stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    Fetch(String),
    Storage(String),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::Fetch(r) => write!(f, "fetch failed: {r}"),
            SkipReason::Storage(r) => write!(f, "storage failed: {r}"),
        }
    }
}

/// A part or header that could not be decoded. Always resolved to a
/// placeholder inside the message; only ever logged.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("invalid quoted-printable payload: {0}")]
    QuotedPrintable(#[from] quoted_printable::QuotedPrintableError),

    #[error("unparseable message: {0}")]
    Message(#[from] mailparse::MailParseError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_session_level_errors_are_fatal() {
        assert!(IngestError::Connection("refused".into()).is_fatal());
        assert!(IngestError::Protocol("no such folder".into()).is_fatal());
        assert!(
            !IngestError::Fetch {
                token: MessageToken(3),
                reason: "gone".into()
            }
            .is_fatal()
        );
        assert!(!IngestError::Storage(rusqlite::Error::InvalidQuery).is_fatal());
    }
}
