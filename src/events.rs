//! Connection notifications
//!
//! The engine reports what happened on a connection through a callback
//! registered on the configuration. Handlers run synchronously on the thread
//! driving the connection and must not block.

use crate::cert::CertificateChain;
use crate::config::TlsVersion;
use crate::crypto::CipherSuite;
use crate::error::{ErrorKind, TlsError};
use crate::session::Session;
use crate::verify::VerificationError;
use std::fmt;
use std::sync::Arc;

/// Something observable happened on a connection
#[derive(Debug, Clone)]
pub enum TlsEvent {
    /// The handshake (or a renegotiation) completed
    HandshakeEstablished {
        version: TlsVersion,
        cipher: CipherSuite,
        resumed: bool,
        alpn_protocol: Option<String>,
        servername: Option<String>,
    },
    /// The handshake failed and the connection is being torn down
    HandshakeFailed { kind: ErrorKind, reason: String },
    /// The peer's chain arrived and was checked
    PeerCertificate {
        chain: CertificateChain,
        authorized: bool,
        error: Option<VerificationError>,
    },
    /// A resumable session is available, for external caching
    SessionNegotiated(Session),
    /// A fatal error after the handshake completed
    ProtocolError { kind: ErrorKind, reason: String },
}

impl TlsEvent {
    pub(crate) fn handshake_failed(error: &TlsError) -> Self {
        TlsEvent::HandshakeFailed { kind: error.kind(), reason: error.to_string() }
    }

    pub(crate) fn protocol_error(error: &TlsError) -> Self {
        TlsEvent::ProtocolError { kind: error.kind(), reason: error.to_string() }
    }
}

/// Callback receiving [`TlsEvent`]s
pub type EventHandler = Arc<dyn Fn(&TlsEvent) + Send + Sync>;

/// Optional handler with a no-op default
#[derive(Clone, Default)]
pub(crate) struct Events(Option<EventHandler>);

impl Events {
    pub(crate) fn new(handler: Option<EventHandler>) -> Self {
        Events(handler)
    }

    pub(crate) fn emit(&self, event: &TlsEvent) {
        if let Some(handler) = &self.0 {
            handler(event);
        }
    }
}

impl fmt::Debug for Events {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(if self.0.is_some() { "Events(handler)" } else { "Events(none)" })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_emit_reaches_handler() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let events = Events::new(Some(Arc::new(move |e: &TlsEvent| {
            sink.lock().unwrap().push(format!("{:?}", e));
        })));

        events.emit(&TlsEvent::handshake_failed(&TlsError::Timeout(
            std::time::Duration::from_secs(1),
        )));
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].contains("Timeout"));
    }

    #[test]
    fn test_no_handler_is_noop() {
        Events::default().emit(&TlsEvent::protocol_error(&TlsError::Truncated));
    }
}
