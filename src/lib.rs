//! vtls - blocking TLS connection engine
//!
//! This crate negotiates TLS connections over any duplex byte stream: version
//! and cipher suite agreement, certificate verification, ALPN, SNI based
//! certificate selection, session resumption, renegotiation limiting and
//! encrypted record framing. It is built on OpenSSL primitives and runs one
//! blocking connection per thread.
//!
//! ```no_run
//! use std::net::TcpStream;
//! use vtls::TlsConfig;
//!
//! let config = TlsConfig::client().servername("example.com").build()?;
//! let mut stream = config.connect(TcpStream::connect("example.com:443")?)?;
//! stream.write(b"ping")?;
//! # Ok::<(), vtls::TlsError>(())
//! ```

pub mod alert;
pub mod cert;
pub(crate) mod codec;
pub mod config;
pub mod connection;
pub mod crypto;
pub mod error;
pub mod events;
pub mod handshake;
pub mod info;
pub mod listener;
pub mod record;
pub mod session;
pub mod transport;
pub mod verify;

#[cfg(test)]
mod test_support;

pub use alert::{Alert, AlertDescription, AlertLevel};
pub use cert::{Certificate, CertificateChain, CertifiedKey};
pub use config::{ClientVerify, ServerContext, SniCallback, TlsConfig, TlsVersion};
pub use connection::TlsStream;
pub use crypto::{CipherSuite, NamedGroup};
pub use error::{ErrorKind, TlsError};
pub use events::TlsEvent;
pub use handshake::{HandshakeState, Role};
pub use info::{CertSummary, ConnectionInfo};
pub use listener::{memory_listener, ListenerConfig, ListenerEvent, ListenerHandle, TlsListener};
pub use session::{ResumptionPolicy, Session, SessionStore, TicketKey};
pub use transport::{memory_pair, MemoryTransport, Transport};
pub use verify::{TrustAnchors, VerificationError};

/// Result type for TLS operations
pub type Result<T> = std::result::Result<T, TlsError>;
