//! Peer certificate verification
//!
//! [`CertificateVerifier`] validates a presented chain against an explicitly
//! constructed set of [`TrustAnchors`] and, optionally, a hostname. It is pure:
//! the current time is an input and nothing is cached, so the handshake calls
//! it synchronously and tests call it directly.
//!
//! Checks run in a fixed order and the first failure is returned:
//!
//! 1. every certificate on the path is inside its validity window
//! 2. every certificate on the path is signed by the next one
//! 3. every issuer on the path, anchors included, is a CA
//! 4. the path ends at, or is issued by, a trust anchor
//! 5. the hostname matches the leaf's alt names (or its CN when it has none)

use crate::alert::AlertDescription;
use crate::cert::{Certificate, CertificateChain, SubjectAltName};
use crate::codec::{put_vec_u16, Reader};
use crate::error::TlsError;
use bytes::{BufMut, BytesMut};
use std::fs;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;

/// Why a peer certificate chain was not authorized
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VerificationError {
    #[error("peer did not present a certificate")]
    NoPeerCertificate,

    #[error("certificate at depth {depth} is not yet valid")]
    NotYetValid { depth: usize },

    #[error("certificate at depth {depth} has expired")]
    Expired { depth: usize },

    #[error("certificate signature failure at depth {depth}")]
    BadSignature { depth: usize },

    #[error("invalid CA certificate at depth {depth}")]
    InvalidCa { depth: usize },

    #[error("self signed certificate")]
    DepthZeroSelfSigned,

    #[error("self signed certificate in certificate chain")]
    SelfSignedInChain,

    #[error("unable to get local issuer certificate")]
    UntrustedIssuer,

    #[error("Hostname/IP does not match certificate's altnames: {0}")]
    HostnameMismatch(String),
}

impl VerificationError {
    /// OpenSSL-style error code, as reported in `authorization_error`
    pub fn code(&self) -> &'static str {
        match self {
            VerificationError::NoPeerCertificate => "ERR_TLS_NO_PEER_CERTIFICATE",
            VerificationError::NotYetValid { .. } => "CERT_NOT_YET_VALID",
            VerificationError::Expired { .. } => "CERT_HAS_EXPIRED",
            VerificationError::BadSignature { .. } => "CERT_SIGNATURE_FAILURE",
            VerificationError::InvalidCa { .. } => "INVALID_CA",
            VerificationError::DepthZeroSelfSigned => "DEPTH_ZERO_SELF_SIGNED_CERT",
            VerificationError::SelfSignedInChain => "SELF_SIGNED_CERT_IN_CHAIN",
            VerificationError::UntrustedIssuer => "UNABLE_TO_GET_ISSUER_CERT_LOCALLY",
            VerificationError::HostnameMismatch(_) => "ERR_TLS_CERT_ALTNAME_INVALID",
        }
    }

    /// True for the failures that mean "the issuer is not trusted"
    pub fn is_untrusted_issuer(&self) -> bool {
        matches!(
            self,
            VerificationError::DepthZeroSelfSigned
                | VerificationError::SelfSignedInChain
                | VerificationError::UntrustedIssuer
        )
    }

    pub(crate) fn alert(&self) -> AlertDescription {
        match self {
            VerificationError::NoPeerCertificate => AlertDescription::CertificateRequired,
            VerificationError::NotYetValid { .. }
            | VerificationError::InvalidCa { .. }
            | VerificationError::HostnameMismatch(_) => AlertDescription::BadCertificate,
            VerificationError::Expired { .. } => AlertDescription::CertificateExpired,
            VerificationError::BadSignature { .. } => AlertDescription::DecryptError,
            VerificationError::DepthZeroSelfSigned
            | VerificationError::SelfSignedInChain
            | VerificationError::UntrustedIssuer => AlertDescription::UnknownCa,
        }
    }

    pub(crate) fn encode(&self, buf: &mut BytesMut) -> Result<(), TlsError> {
        let (tag, depth, detail) = match self {
            VerificationError::NoPeerCertificate => (0u8, 0, ""),
            VerificationError::NotYetValid { depth } => (1, *depth, ""),
            VerificationError::Expired { depth } => (2, *depth, ""),
            VerificationError::BadSignature { depth } => (3, *depth, ""),
            VerificationError::InvalidCa { depth } => (4, *depth, ""),
            VerificationError::DepthZeroSelfSigned => (5, 0, ""),
            VerificationError::SelfSignedInChain => (6, 0, ""),
            VerificationError::UntrustedIssuer => (7, 0, ""),
            VerificationError::HostnameMismatch(detail) => (8, 0, detail.as_str()),
        };
        buf.put_u8(tag);
        buf.put_u16(depth.min(u16::MAX as usize) as u16);
        put_vec_u16(buf, detail.as_bytes())
    }

    pub(crate) fn decode(r: &mut Reader<'_>) -> Result<Self, TlsError> {
        let tag = r.u8()?;
        let depth = r.u16()? as usize;
        let detail = String::from_utf8(r.vec_u16()?.to_vec())
            .map_err(|_| TlsError::decode("verification error"))?;
        Ok(match tag {
            0 => VerificationError::NoPeerCertificate,
            1 => VerificationError::NotYetValid { depth },
            2 => VerificationError::Expired { depth },
            3 => VerificationError::BadSignature { depth },
            4 => VerificationError::InvalidCa { depth },
            5 => VerificationError::DepthZeroSelfSigned,
            6 => VerificationError::SelfSignedInChain,
            7 => VerificationError::UntrustedIssuer,
            8 => VerificationError::HostnameMismatch(detail),
            _ => return Err(TlsError::decode("verification error")),
        })
    }
}

/// Immutable set of trusted root certificates
#[derive(Debug, Clone, Default)]
pub struct TrustAnchors {
    anchors: Arc<Vec<Certificate>>,
}

impl TrustAnchors {
    pub fn new(anchors: Vec<Certificate>) -> Self {
        TrustAnchors { anchors: Arc::new(anchors) }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_pem(pem: &[u8]) -> Result<Self, TlsError> {
        let chain = CertificateChain::from_pem(pem)?;
        Ok(Self::new(chain.certificates().to_vec()))
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, TlsError> {
        Self::from_pem(&fs::read(path.as_ref())?)
    }

    pub fn len(&self) -> usize {
        self.anchors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.anchors.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Certificate> {
        self.anchors.iter()
    }

    pub fn contains(&self, cert: &Certificate) -> bool {
        self.anchors.iter().any(|a| a == cert)
    }

    /// Anchors whose subject names `cert`'s issuer
    fn issuers_of<'a>(&'a self, cert: &'a Certificate) -> impl Iterator<Item = &'a Certificate> {
        self.anchors.iter().filter(move |a| a.issued(cert))
    }
}

/// Caller-supplied replacement for the hostname check
pub type ServerIdentityCheck =
    Arc<dyn Fn(&str, &Certificate) -> Result<(), VerificationError> + Send + Sync>;

/// Chain and hostname verifier
#[derive(Debug, Clone, Default)]
pub struct CertificateVerifier {
    anchors: TrustAnchors,
}

impl CertificateVerifier {
    pub fn new(anchors: TrustAnchors) -> Self {
        CertificateVerifier { anchors }
    }

    pub fn anchors(&self) -> &TrustAnchors {
        &self.anchors
    }

    /// Verify `chain` (and `hostname`, if given) as of now
    pub fn verify(
        &self,
        chain: &CertificateChain,
        hostname: Option<&str>,
    ) -> Result<(), VerificationError> {
        self.verify_at(chain, hostname, SystemTime::now())
    }

    pub fn verify_at(
        &self,
        chain: &CertificateChain,
        hostname: Option<&str>,
        now: SystemTime,
    ) -> Result<(), VerificationError> {
        self.verify_chain_at(chain, now)?;
        if let (Some(host), Some(leaf)) = (hostname, chain.leaf()) {
            check_server_identity(host, leaf)?;
        }
        Ok(())
    }

    /// Steps 1 to 4 only
    pub fn verify_chain_at(
        &self,
        chain: &CertificateChain,
        now: SystemTime,
    ) -> Result<(), VerificationError> {
        let path = issuance_path(chain);
        if path.is_empty() {
            return Err(VerificationError::NoPeerCertificate);
        }

        for (depth, &index) in path.iter().enumerate() {
            let cert = &chain.certificates()[index];
            if now < cert.not_before {
                return Err(VerificationError::NotYetValid { depth });
            }
            if now > cert.not_after {
                return Err(VerificationError::Expired { depth });
            }
        }

        for (depth, pair) in path.windows(2).enumerate() {
            let (child, issuer) = (&chain.certificates()[pair[0]], &chain.certificates()[pair[1]]);
            if !child.is_signed_by(issuer) {
                return Err(VerificationError::BadSignature { depth });
            }
        }

        for (depth, &index) in path.iter().enumerate().skip(1) {
            if !chain.certificates()[index].is_ca {
                return Err(VerificationError::InvalidCa { depth });
            }
        }

        let depth = path.len() - 1;
        let last = &chain.certificates()[path[depth]];
        if self.anchors.contains(last) {
            return Ok(());
        }
        let mut named_by_anchor = false;
        for anchor in self.anchors.issuers_of(last) {
            named_by_anchor = true;
            if last.is_signed_by(anchor) {
                return if anchor.is_ca {
                    Ok(())
                } else {
                    Err(VerificationError::InvalidCa { depth: depth + 1 })
                };
            }
        }
        if named_by_anchor {
            return Err(VerificationError::BadSignature { depth });
        }

        if last.is_self_issued() {
            if depth == 0 {
                Err(VerificationError::DepthZeroSelfSigned)
            } else {
                Err(VerificationError::SelfSignedInChain)
            }
        } else {
            Err(VerificationError::UntrustedIssuer)
        }
    }
}

/// Indices of the certificates reachable from the leaf by following issuers
fn issuance_path(chain: &CertificateChain) -> Vec<usize> {
    let mut path = Vec::new();
    let mut current = if chain.is_empty() { None } else { Some(0) };
    while let Some(index) = current {
        if path.contains(&index) {
            break;
        }
        path.push(index);
        current = chain.issuer_index(index);
    }
    path
}

/// Check that `cert` is valid for `hostname`
///
/// IP literals only match IP alt names. DNS names match DNS alt names; the
/// common name is consulted only when the certificate has no DNS alt names.
pub fn check_server_identity(hostname: &str, cert: &Certificate) -> Result<(), VerificationError> {
    let host = hostname.trim_end_matches('.');
    let describe = || {
        let names: Vec<String> = cert.subject_alt_names.iter().map(|n| n.to_string()).collect();
        if names.is_empty() {
            format!(
                "Host: {}. is not cert's CN: {}",
                host,
                cert.subject.common_name.as_deref().unwrap_or("<undef>")
            )
        } else {
            format!("Host: {}. is not in the cert's altnames: {}", host, names.join(", "))
        }
    };

    if let Ok(ip) = host.parse::<IpAddr>() {
        let matched = cert
            .subject_alt_names
            .iter()
            .any(|n| matches!(n, SubjectAltName::Ip(addr) if *addr == ip));
        return if matched {
            Ok(())
        } else {
            Err(VerificationError::HostnameMismatch(describe()))
        };
    }

    let dns_names: Vec<&str> = cert
        .subject_alt_names
        .iter()
        .filter_map(|n| match n {
            SubjectAltName::Dns(name) => Some(name.as_str()),
            SubjectAltName::Ip(_) => None,
        })
        .collect();

    let matched = if dns_names.is_empty() {
        cert.subject
            .common_name
            .as_deref()
            .map(|cn| hostname_matches(cn, host))
            .unwrap_or(false)
    } else {
        dns_names.iter().any(|pattern| hostname_matches(pattern, host))
    };

    if matched {
        Ok(())
    } else {
        Err(VerificationError::HostnameMismatch(describe()))
    }
}

/// Match a DNS name against a certificate name pattern
///
/// A wildcard is only honoured as the entire leftmost label, matches exactly
/// one non-empty label, and needs at least two labels after it.
pub fn hostname_matches(pattern: &str, host: &str) -> bool {
    let pattern = pattern.trim_end_matches('.').to_ascii_lowercase();
    let host = host.trim_end_matches('.').to_ascii_lowercase();
    if pattern.is_empty() || host.is_empty() {
        return false;
    }

    let pattern_labels: Vec<&str> = pattern.split('.').collect();
    let host_labels: Vec<&str> = host.split('.').collect();
    if host_labels.iter().any(|l| l.is_empty()) {
        return false;
    }

    if pattern_labels[0] != "*" {
        return !pattern.contains('*') && pattern == host;
    }

    if pattern_labels.len() < 3 || pattern_labels[1..].iter().any(|l| l.contains('*')) {
        return false;
    }
    pattern_labels.len() == host_labels.len() && pattern_labels[1..] == host_labels[1..]
}
