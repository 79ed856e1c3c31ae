//! Connection snapshot
//!
//! [`ConnectionInfo`] is a plain, cloneable summary of what a connection
//! negotiated, suitable for logging or reporting after the stream itself has
//! been consumed.

use crate::cert::Certificate;
use crate::handshake::Negotiated;

const UNDEF: &str = "<undef>";

/// Summary of one certificate in the peer chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertSummary {
    /// Subject common name
    pub subject: String,
    /// Issuer common name
    pub issuer: String,
    /// Subject alternative names, `DNS:` / `IP Address:` prefixed
    pub subject_alt_names: Vec<String>,
    pub fingerprint256: String,
}

impl CertSummary {
    pub fn from_certificate(cert: &Certificate) -> Self {
        CertSummary {
            subject: cert.subject.common_name.clone().unwrap_or_else(|| UNDEF.to_string()),
            issuer: cert.issuer.common_name.clone().unwrap_or_else(|| UNDEF.to_string()),
            subject_alt_names: cert.subject_alt_names.iter().map(|n| n.to_string()).collect(),
            fingerprint256: cert.fingerprint256.clone(),
        }
    }
}

/// What a connection negotiated
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    /// Negotiated version (e.g. "TLSv1.3"), `<undef>` before establishment
    pub version: String,

    /// Negotiated cipher suite name
    pub cipher: String,

    pub servername: Option<String>,

    pub alpn: Option<String>,

    /// Last alert sent or received
    pub alert: Option<String>,

    /// Whether the handshake or later I/O failed
    pub failed: bool,

    /// Peer chain, leaf first
    pub cert_chain: Vec<CertSummary>,

    pub sess_reused: bool,

    pub authorized: bool,

    /// Verification error code when not authorized
    pub authorization_error: Option<String>,
}

impl ConnectionInfo {
    pub(crate) fn new(negotiated: Option<&Negotiated>, failed: bool, alert: Option<String>) -> Self {
        let Some(n) = negotiated.filter(|_| !failed) else {
            return ConnectionInfo { failed, alert, ..Default::default() };
        };

        ConnectionInfo {
            version: n.version.as_str().to_string(),
            cipher: n.cipher_suite.name().to_string(),
            servername: n.servername.clone(),
            alpn: n.alpn_protocol.clone(),
            alert,
            failed,
            cert_chain: n
                .peer_chain
                .iter()
                .flat_map(|chain| chain.iter())
                .map(CertSummary::from_certificate)
                .collect(),
            sess_reused: n.resumed,
            authorized: n.authorized,
            authorization_error: n.authorization_error.as_ref().map(|e| e.code().to_string()),
        }
    }

    /// Certificate by depth (0 = peer)
    pub fn cert(&self, index: usize) -> Option<&CertSummary> {
        self.cert_chain.get(index)
    }
}

impl Default for ConnectionInfo {
    fn default() -> Self {
        ConnectionInfo {
            version: UNDEF.to_string(),
            cipher: UNDEF.to_string(),
            servername: None,
            alpn: None,
            alert: None,
            failed: true,
            cert_chain: Vec::new(),
            sess_reused: false,
            authorized: false,
            authorization_error: None,
        }
    }
}
