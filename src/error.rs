//! TLS error types
//!
//! Every failure the engine can report is a [`TlsError`]. The variants map onto
//! a small taxonomy ([`ErrorKind`]) which decides whether a connection survives
//! the error and which alert, if any, is sent to the peer before closing.

use crate::alert::AlertDescription;
use crate::verify::VerificationError;
use std::time::Duration;

/// TLS errors
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("OpenSSL error: {0}")]
    OpenSsl(#[from] openssl::error::ErrorStack),

    #[error("Transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    #[error("Certificate verification failed: {0}")]
    Verification(#[from] VerificationError),

    #[error("Record integrity failure: {0}")]
    Integrity(String),

    #[error("Handshake timed out after {0:?}")]
    Timeout(Duration),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Received fatal alert: {0}")]
    AlertReceived(AlertDescription),

    #[error("Connection truncated: transport closed without close_notify")]
    Truncated,

    #[error("Renegotiation limit exceeded: more than {limit} within {window:?}")]
    RenegotiationLimit { limit: usize, window: Duration },

    #[error("Connection is not established")]
    NotEstablished,

    #[error("Connection closed")]
    Closed,

    #[error("Connection previously failed: {0}")]
    Failed(String),

    #[error("Invalid TLS version: {0}")]
    InvalidVersion(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Certificate error: {0}")]
    Certificate(String),
}

/// Coarse classification of a [`TlsError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Negotiation,
    Verification,
    Integrity,
    Timeout,
    Transport,
    ProtocolViolation,
    Closed,
    Config,
    Internal,
}

impl TlsError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TlsError::Negotiation(_) => ErrorKind::Negotiation,
            TlsError::Verification(_) => ErrorKind::Verification,
            TlsError::Integrity(_) => ErrorKind::Integrity,
            TlsError::Timeout(_) => ErrorKind::Timeout,
            TlsError::Transport(_) | TlsError::Truncated => ErrorKind::Transport,
            TlsError::ProtocolViolation(_)
            | TlsError::AlertReceived(_)
            | TlsError::RenegotiationLimit { .. } => ErrorKind::ProtocolViolation,
            TlsError::NotEstablished | TlsError::Closed | TlsError::Failed(_) => ErrorKind::Closed,
            TlsError::InvalidVersion(_) | TlsError::InvalidConfig(_) | TlsError::Certificate(_) => {
                ErrorKind::Config
            }
            TlsError::OpenSsl(_) => ErrorKind::Internal,
        }
    }

    /// Whether the connection has to be torn down after this error.
    ///
    /// Only a tolerated verification failure is recoverable, and that case
    /// never reaches the caller as an error: it is recorded on the connection
    /// as `authorized == false` instead.
    pub fn is_fatal(&self) -> bool {
        !matches!(self.kind(), ErrorKind::Config)
    }

    /// Alert to send to the peer before closing, if any
    pub fn alert(&self) -> Option<AlertDescription> {
        use AlertDescription as A;
        match self {
            TlsError::Negotiation(msg) if msg.contains("application protocol") => {
                Some(A::NoApplicationProtocol)
            }
            TlsError::Negotiation(msg) if msg.contains("version") => Some(A::ProtocolVersion),
            TlsError::Negotiation(_) => Some(A::HandshakeFailure),
            TlsError::Verification(e) => Some(e.alert()),
            TlsError::Integrity(_) => Some(A::BadRecordMac),
            TlsError::Timeout(_) => Some(A::UserCanceled),
            TlsError::ProtocolViolation(msg) if msg.contains("record overflow") => {
                Some(A::RecordOverflow)
            }
            TlsError::ProtocolViolation(msg) if msg.contains("decode") => Some(A::DecodeError),
            TlsError::ProtocolViolation(msg) if msg.contains("decrypt error") => {
                Some(A::DecryptError)
            }
            TlsError::ProtocolViolation(_) => Some(A::UnexpectedMessage),
            TlsError::RenegotiationLimit { .. } => Some(A::NoRenegotiation),
            TlsError::OpenSsl(_) => Some(A::InternalError),
            // The peer is gone or already told us why.
            TlsError::Transport(_)
            | TlsError::Truncated
            | TlsError::AlertReceived(_)
            | TlsError::NotEstablished
            | TlsError::Closed
            | TlsError::Failed(_)
            | TlsError::InvalidVersion(_)
            | TlsError::InvalidConfig(_)
            | TlsError::Certificate(_) => None,
        }
    }

    pub(crate) fn decode(what: &str) -> Self {
        TlsError::ProtocolViolation(format!("decode error: malformed {}", what))
    }

    pub(crate) fn unexpected(what: impl std::fmt::Display) -> Self {
        TlsError::ProtocolViolation(format!("unexpected message: {}", what))
    }
}

impl From<TlsError> for std::io::Error {
    fn from(err: TlsError) -> Self {
        use std::io::ErrorKind as Io;
        let kind = match &err {
            TlsError::Transport(_) => Io::Other,
            TlsError::Timeout(_) => Io::TimedOut,
            TlsError::Truncated => Io::UnexpectedEof,
            TlsError::Closed | TlsError::NotEstablished | TlsError::Failed(_) => Io::NotConnected,
            TlsError::InvalidVersion(_) | TlsError::InvalidConfig(_) => Io::InvalidInput,
            TlsError::Integrity(_) | TlsError::ProtocolViolation(_) => Io::InvalidData,
            _ => Io::Other,
        };
        match err {
            TlsError::Transport(inner) => inner,
            other => std::io::Error::new(kind, other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_conversion() {
        let io: std::io::Error = TlsError::Truncated.into();
        assert_eq!(io.kind(), std::io::ErrorKind::UnexpectedEof);

        let io: std::io::Error = TlsError::Timeout(Duration::from_secs(1)).into();
        assert_eq!(io.kind(), std::io::ErrorKind::TimedOut);

        let inner = std::io::Error::from(std::io::ErrorKind::BrokenPipe);
        let io: std::io::Error = TlsError::Transport(inner).into();
        assert_eq!(io.kind(), std::io::ErrorKind::BrokenPipe);
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(TlsError::Negotiation("x".into()).kind(), ErrorKind::Negotiation);
        assert_eq!(TlsError::Truncated.kind(), ErrorKind::Transport);
        assert_eq!(
            TlsError::RenegotiationLimit { limit: 3, window: Duration::from_secs(600) }.kind(),
            ErrorKind::ProtocolViolation
        );
        assert_eq!(TlsError::Integrity("tag".into()).kind(), ErrorKind::Integrity);
        assert!(TlsError::Integrity("tag".into()).is_fatal());
        assert!(!TlsError::InvalidConfig("x".into()).is_fatal());
    }

    #[test]
    fn test_alert_mapping() {
        assert_eq!(
            TlsError::Negotiation("no common protocol version".into()).alert(),
            Some(AlertDescription::ProtocolVersion)
        );
        assert_eq!(
            TlsError::Negotiation("no application protocol".into()).alert(),
            Some(AlertDescription::NoApplicationProtocol)
        );
        assert_eq!(
            TlsError::Integrity("bad tag".into()).alert(),
            Some(AlertDescription::BadRecordMac)
        );
        assert_eq!(
            TlsError::decode("ClientHello").alert(),
            Some(AlertDescription::DecodeError)
        );
        assert_eq!(TlsError::Truncated.alert(), None);
    }
}
