//! Certificate handling and parsing
//!
//! Peer certificates arrive as DER blobs. They are parsed once into an
//! immutable [`Certificate`] that carries the fields callers inspect
//! (names, validity window, key, fingerprints, alt names) next to the parsed
//! OpenSSL object used for signature checks.

use crate::crypto::SignatureScheme;
use crate::error::TlsError;
use bytes::Bytes;
use openssl::asn1::{Asn1Time, Asn1TimeRef};
use openssl::bn::{BigNum, MsbOption};
use openssl::ec::{EcGroup, EcKey};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{Id, PKey, PKeyRef, Private, Public};
use openssl::x509::extension::{BasicConstraints, SubjectAlternativeName};
use openssl::x509::{X509NameBuilder, X509NameRef, X509Ref, X509VerifyResult, X509};
use std::fmt;
use std::fs;
use std::net::IpAddr;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Distinguished name fields of a certificate subject or issuer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DistinguishedName {
    pub country: Option<String>,
    pub state: Option<String>,
    pub locality: Option<String>,
    pub organization: Option<String>,
    pub organizational_unit: Option<String>,
    pub common_name: Option<String>,
}

impl DistinguishedName {
    fn from_x509_name(name: &X509NameRef) -> Self {
        let get = |nid: Nid| {
            name.entries_by_nid(nid)
                .next()
                .and_then(|entry| entry.data().as_utf8().ok())
                .map(|s| s.to_string())
        };
        DistinguishedName {
            country: get(Nid::COUNTRYNAME),
            state: get(Nid::STATEORPROVINCENAME),
            locality: get(Nid::LOCALITYNAME),
            organization: get(Nid::ORGANIZATIONNAME),
            organizational_unit: get(Nid::ORGANIZATIONALUNITNAME),
            common_name: get(Nid::COMMONNAME),
        }
    }
}

impl fmt::Display for DistinguishedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts = [
            ("C", &self.country),
            ("ST", &self.state),
            ("L", &self.locality),
            ("O", &self.organization),
            ("OU", &self.organizational_unit),
            ("CN", &self.common_name),
        ];
        let rendered: Vec<String> = parts
            .iter()
            .filter_map(|(key, value)| value.as_ref().map(|v| format!("{}={}", key, v)))
            .collect();
        f.write_str(&rendered.join(", "))
    }
}

/// A subject alternative name entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubjectAltName {
    Dns(String),
    Ip(IpAddr),
}

impl fmt::Display for SubjectAltName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubjectAltName::Dns(name) => write!(f, "DNS:{}", name),
            SubjectAltName::Ip(ip) => write!(f, "IP Address:{}", ip),
        }
    }
}

/// Public key algorithm of a certificate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAlgorithm {
    Rsa,
    Ec,
    Ed25519,
    Other,
}

/// Public key material of a certificate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKeyInfo {
    pub algorithm: KeyAlgorithm,
    pub bits: u32,
    /// SubjectPublicKeyInfo, DER encoded
    pub der: Vec<u8>,
}

/// Parsed X.509 certificate
#[derive(Clone)]
pub struct Certificate {
    pub subject: DistinguishedName,
    pub issuer: DistinguishedName,
    pub not_before: SystemTime,
    pub not_after: SystemTime,
    pub public_key: PublicKeyInfo,
    /// Upper-case hex serial number
    pub serial_number: String,
    /// SHA-1 fingerprint, colon separated hex
    pub fingerprint: String,
    /// SHA-256 fingerprint, colon separated hex
    pub fingerprint256: String,
    pub subject_alt_names: Vec<SubjectAltName>,
    /// basicConstraints marks the subject as a certificate authority
    pub is_ca: bool,
    /// DER encoding as received
    pub raw: Bytes,
    x509: X509,
}

impl Certificate {
    pub fn from_der(der: &[u8]) -> Result<Self, TlsError> {
        let x509 = X509::from_der(der)
            .map_err(|e| TlsError::Certificate(format!("Failed to parse certificate: {}", e)))?;
        Self::from_x509(x509)
    }

    /// Parse the first certificate of a PEM document
    pub fn from_pem(pem: &[u8]) -> Result<Self, TlsError> {
        let x509 = X509::from_pem(pem)
            .map_err(|e| TlsError::Certificate(format!("Failed to load certificate: {}", e)))?;
        Self::from_x509(x509)
    }

    pub fn from_x509(x509: X509) -> Result<Self, TlsError> {
        let pkey = x509.public_key()?;
        let algorithm = match pkey.id() {
            Id::RSA => KeyAlgorithm::Rsa,
            Id::EC => KeyAlgorithm::Ec,
            Id::ED25519 => KeyAlgorithm::Ed25519,
            _ => KeyAlgorithm::Other,
        };
        let der = x509.to_der()?;

        Ok(Certificate {
            subject: DistinguishedName::from_x509_name(x509.subject_name()),
            issuer: DistinguishedName::from_x509_name(x509.issuer_name()),
            not_before: asn1_to_system_time(x509.not_before())?,
            not_after: asn1_to_system_time(x509.not_after())?,
            public_key: PublicKeyInfo {
                algorithm,
                bits: pkey.bits(),
                der: pkey.public_key_to_der()?,
            },
            serial_number: x509.serial_number().to_bn()?.to_hex_str()?.to_string(),
            fingerprint: colon_hex(&x509.digest(MessageDigest::sha1())?),
            fingerprint256: colon_hex(&x509.digest(MessageDigest::sha256())?),
            subject_alt_names: subject_alt_names(&x509),
            is_ca: basic_constraints_ca(&der),
            raw: Bytes::from(der),
            x509,
        })
    }

    #[cfg(test)]
    pub(crate) fn x509(&self) -> &X509Ref {
        &self.x509
    }

    pub(crate) fn pkey(&self) -> Result<PKey<Public>, TlsError> {
        Ok(self.x509.public_key()?)
    }

    /// Whether `self`'s subject is the issuer named by `child`
    pub fn issued(&self, child: &Certificate) -> bool {
        self.x509.issued(&child.x509) == X509VerifyResult::OK
    }

    pub fn is_self_issued(&self) -> bool {
        self.issued(self)
    }

    /// Check `self`'s signature under `issuer`'s public key
    pub fn is_signed_by(&self, issuer: &Certificate) -> bool {
        match issuer.x509.public_key() {
            Ok(key) => self.x509.verify(&key).unwrap_or(false),
            Err(_) => false,
        }
    }

    pub fn is_valid_at(&self, now: SystemTime) -> bool {
        self.not_before <= now && now <= self.not_after
    }
}

impl PartialEq for Certificate {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl Eq for Certificate {}

impl fmt::Debug for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Certificate")
            .field("subject", &self.subject.to_string())
            .field("issuer", &self.issuer.to_string())
            .field("serial_number", &self.serial_number)
            .field("fingerprint256", &self.fingerprint256)
            .finish()
    }
}

fn asn1_to_system_time(time: &Asn1TimeRef) -> Result<SystemTime, TlsError> {
    let epoch = Asn1Time::from_unix(0)?;
    let diff = epoch.diff(time)?;
    let secs = diff.days as i64 * 86_400 + diff.secs as i64;
    Ok(if secs >= 0 {
        UNIX_EPOCH + Duration::from_secs(secs as u64)
    } else {
        UNIX_EPOCH - Duration::from_secs(secs.unsigned_abs())
    })
}

fn colon_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02X}", b)).collect::<Vec<_>>().join(":")
}

fn subject_alt_names(cert: &X509Ref) -> Vec<SubjectAltName> {
    let mut names = Vec::new();
    if let Some(san_ext) = cert.subject_alt_names() {
        for name in san_ext {
            if let Some(dns) = name.dnsname() {
                names.push(SubjectAltName::Dns(dns.to_string()));
            } else if let Some(ip) = name.ipaddress() {
                if let Ok(octets) = <[u8; 4]>::try_from(ip) {
                    names.push(SubjectAltName::Ip(IpAddr::from(octets)));
                } else if let Ok(octets) = <[u8; 16]>::try_from(ip) {
                    names.push(SubjectAltName::Ip(IpAddr::from(octets)));
                }
            }
        }
    }
    names
}

const OID_BASIC_CONSTRAINTS: &[u8] = &[0x55, 0x1d, 0x13];

/// Split one DER element off the front of `data` as (tag, contents, rest)
fn der_split(data: &[u8]) -> Option<(u8, &[u8], &[u8])> {
    let (&tag, rest) = data.split_first()?;
    let (&first, rest) = rest.split_first()?;
    let (len, rest) = if first < 0x80 {
        (first as usize, rest)
    } else {
        let n = (first & 0x7f) as usize;
        if n == 0 || n > 4 || rest.len() < n {
            return None;
        }
        let len = rest[..n].iter().fold(0usize, |acc, b| (acc << 8) | *b as usize);
        (len, &rest[n..])
    };
    if rest.len() < len {
        return None;
    }
    Some((tag, &rest[..len], &rest[len..]))
}

/// The cA flag of the basicConstraints extension; false when absent
///
/// OpenSSL only exposes the path length of this extension, so the flag is
/// read from the certificate DER: Certificate, tbsCertificate, the `[3]`
/// extensions wrapper, then each Extension's OID, optional critical flag and
/// OCTET STRING holding the BasicConstraints SEQUENCE.
fn basic_constraints_ca(der: &[u8]) -> bool {
    fn walk(der: &[u8]) -> Option<bool> {
        let (_, cert, _) = der_split(der)?;
        let (_, mut tbs, _) = der_split(cert)?;
        let wrapper = loop {
            let (tag, body, rest) = der_split(tbs)?;
            if tag == 0xa3 {
                break body;
            }
            tbs = rest;
        };
        let (_, mut extensions, _) = der_split(wrapper)?;
        while !extensions.is_empty() {
            let (_, extension, rest) = der_split(extensions)?;
            extensions = rest;
            let (_, oid, fields) = der_split(extension)?;
            if oid != OID_BASIC_CONSTRAINTS {
                continue;
            }
            let (mut tag, mut value, rest) = der_split(fields)?;
            if tag == 0x01 {
                (tag, value, _) = der_split(rest)?;
            }
            if tag != 0x04 {
                return None;
            }
            let (_, constraints, _) = der_split(value)?;
            return Some(match der_split(constraints) {
                Some((0x01, flag, _)) => flag.first().map_or(false, |b| *b != 0),
                _ => false,
            });
        }
        Some(false)
    }
    walk(der).unwrap_or(false)
}

/// Ordered certificate chain, leaf first
///
/// Issuer relationships are recorded as indices into the chain rather than
/// links between certificates: `issuer_index(i)` is the position of the
/// certificate that issued entry `i`, or `None` for a root or for an entry
/// whose issuer was not sent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CertificateChain {
    certs: Vec<Certificate>,
    issuers: Vec<Option<usize>>,
}

impl CertificateChain {
    pub fn new(certs: Vec<Certificate>) -> Self {
        let issuers = (0..certs.len())
            .map(|i| {
                if certs[i].is_self_issued() {
                    return None;
                }
                // Prefer the next entry, as a well-formed chain has it there.
                let mut candidates = (i + 1..certs.len()).chain(0..i);
                candidates.find(|&j| certs[j].issued(&certs[i]))
            })
            .collect();
        CertificateChain { certs, issuers }
    }

    pub fn from_der_list<B: AsRef<[u8]>>(ders: &[B]) -> Result<Self, TlsError> {
        let certs = ders
            .iter()
            .map(|der| Certificate::from_der(der.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(certs))
    }

    /// Parse every certificate in a PEM document, in order
    pub fn from_pem(pem: &[u8]) -> Result<Self, TlsError> {
        let stack = X509::stack_from_pem(pem)
            .map_err(|e| TlsError::Certificate(format!("Failed to load certificates: {}", e)))?;
        let certs = stack
            .into_iter()
            .map(Certificate::from_x509)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(certs))
    }

    pub fn leaf(&self) -> Option<&Certificate> {
        self.certs.first()
    }

    pub fn get(&self, index: usize) -> Option<&Certificate> {
        self.certs.get(index)
    }

    pub fn len(&self) -> usize {
        self.certs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.certs.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Certificate> {
        self.certs.iter()
    }

    pub fn certificates(&self) -> &[Certificate] {
        &self.certs
    }

    pub fn issuer_index(&self, index: usize) -> Option<usize> {
        self.issuers.get(index).copied().flatten()
    }

    pub fn issuer_of(&self, index: usize) -> Option<&Certificate> {
        self.issuer_index(index).and_then(|i| self.certs.get(i))
    }

    pub(crate) fn to_der_list(&self) -> Vec<Bytes> {
        self.certs.iter().map(|c| c.raw.clone()).collect()
    }
}

/// A certificate chain together with the private key of its leaf
#[derive(Clone)]
pub struct CertifiedKey {
    chain: CertificateChain,
    key: PKey<Private>,
    scheme: SignatureScheme,
}

impl CertifiedKey {
    pub fn new(chain: CertificateChain, key: PKey<Private>) -> Result<Self, TlsError> {
        let leaf = chain
            .leaf()
            .ok_or_else(|| TlsError::Certificate("Certificate chain is empty".to_string()))?;
        if !leaf.pkey()?.public_eq(&key) {
            return Err(TlsError::Certificate(
                "Private key does not match certificate".to_string(),
            ));
        }
        let scheme = SignatureScheme::for_key(&key)?;
        Ok(CertifiedKey { chain, key, scheme })
    }

    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<Self, TlsError> {
        let chain = CertificateChain::from_pem(cert_pem)?;
        let key = PKey::private_key_from_pem(key_pem)
            .map_err(|e| TlsError::Certificate(format!("Failed to load private key: {}", e)))?;
        Self::new(chain, key)
    }

    /// Load a PEM bundle holding the chain and the private key together
    pub fn from_pem_bundle(pem: &[u8]) -> Result<Self, TlsError> {
        Self::from_pem(pem, pem)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, TlsError> {
        let pem = fs::read(path.as_ref())?;
        Self::from_pem_bundle(&pem)
    }

    /// Generate an ephemeral self-signed P-256 identity
    ///
    /// Entries of `alt_names` that parse as IP addresses become IP SANs, the
    /// rest DNS SANs. Valid from an hour ago for one year.
    pub fn self_signed(common_name: &str, alt_names: &[&str]) -> Result<Self, TlsError> {
        let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1)?;
        let key = PKey::from_ec_key(EcKey::generate(&group)?)?;

        let mut name = X509NameBuilder::new()?;
        name.append_entry_by_nid(Nid::COMMONNAME, common_name)?;
        let name = name.build();

        let mut serial = BigNum::new()?;
        serial.rand(64, MsbOption::MAYBE_ZERO, false)?;

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);

        let mut builder = X509::builder()?;
        builder.set_version(2)?;
        let serial = serial.to_asn1_integer()?;
        builder.set_serial_number(&serial)?;
        builder.set_subject_name(&name)?;
        builder.set_issuer_name(&name)?;
        builder.set_pubkey(&key)?;
        let not_before = Asn1Time::from_unix((now - 3600) as libc::time_t)?;
        let not_after = Asn1Time::from_unix((now + 365 * 86_400) as libc::time_t)?;
        builder.set_not_before(&not_before)?;
        builder.set_not_after(&not_after)?;
        if !alt_names.is_empty() {
            let mut san = SubjectAlternativeName::new();
            for alt in alt_names {
                if alt.parse::<IpAddr>().is_ok() {
                    san.ip(alt);
                } else {
                    san.dns(alt);
                }
            }
            let ext = san.build(&builder.x509v3_context(None, None))?;
            builder.append_extension(ext)?;
        }
        builder.append_extension(BasicConstraints::new().build()?)?;
        builder.sign(&key, MessageDigest::sha256())?;

        let cert = Certificate::from_x509(builder.build())?;
        Self::new(CertificateChain::new(vec![cert]), key)
    }

    pub fn chain(&self) -> &CertificateChain {
        &self.chain
    }

    pub(crate) fn private_key(&self) -> &PKeyRef<Private> {
        &self.key
    }

    pub(crate) fn scheme(&self) -> SignatureScheme {
        self.scheme
    }
}

impl fmt::Debug for CertifiedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertifiedKey")
            .field("leaf", &self.chain.leaf())
            .field("scheme", &self.scheme)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{issue, make_ca};

    #[test]
    fn test_basic_constraints() {
        let (ca, ca_key) = make_ca("Root", None);
        let (inter, inter_key) = make_ca("Intermediate", Some((&ca, &ca_key)));
        let (leaf, _) = issue("api.example.com", &["api.example.com"], &inter, &inter_key);
        assert!(ca.is_ca);
        assert!(inter.is_ca);
        assert!(!leaf.is_ca);

        // cA explicitly FALSE is encoded as an empty SEQUENCE.
        let identity = CertifiedKey::self_signed("example.com", &[]).unwrap();
        assert!(!identity.chain().leaf().unwrap().is_ca);

        assert!(!basic_constraints_ca(&[]));
        assert!(!basic_constraints_ca(&[0x30, 0x82, 0xff]));
    }

    #[test]
    fn test_der_long_form_length() {
        let mut data = vec![0x04, 0x81, 0x80];
        data.extend(std::iter::repeat(7u8).take(0x80));
        data.push(0x05);
        let (tag, body, rest) = der_split(&data).unwrap();
        assert_eq!(tag, 0x04);
        assert_eq!(body.len(), 0x80);
        assert_eq!(rest, &[0x05]);
        assert!(der_split(&[0x04, 0x85, 1, 2, 3, 4, 5]).is_none());
        assert!(der_split(&[0x04, 0x02, 1]).is_none());
    }

    #[test]
    fn test_self_signed_identity() {
        let identity = CertifiedKey::self_signed("example.com", &["example.com", "*.example.com", "127.0.0.1"])
            .unwrap();
        let leaf = identity.chain().leaf().unwrap();

        assert_eq!(leaf.subject.common_name.as_deref(), Some("example.com"));
        assert_eq!(leaf.issuer, leaf.subject);
        assert!(leaf.is_self_issued());
        assert!(leaf.is_signed_by(leaf));
        assert!(leaf.is_valid_at(SystemTime::now()));
        assert_eq!(leaf.public_key.algorithm, KeyAlgorithm::Ec);
        assert_eq!(leaf.public_key.bits, 256);
        assert_eq!(
            leaf.subject_alt_names,
            vec![
                SubjectAltName::Dns("example.com".to_string()),
                SubjectAltName::Dns("*.example.com".to_string()),
                SubjectAltName::Ip("127.0.0.1".parse().unwrap()),
            ]
        );
        assert_eq!(leaf.fingerprint256.split(':').count(), 32);
        assert_eq!(leaf.fingerprint.split(':').count(), 20);
        assert_eq!(identity.scheme(), SignatureScheme::EcdsaP256Sha256);
    }

    #[test]
    fn test_der_round_trip() {
        let identity = CertifiedKey::self_signed("node", &[]).unwrap();
        let leaf = identity.chain().leaf().unwrap();
        let parsed = Certificate::from_der(&leaf.raw).unwrap();
        assert_eq!(&parsed, leaf);
        assert_eq!(parsed.serial_number, leaf.serial_number);
        assert!(parsed.subject_alt_names.is_empty());
    }

    #[test]
    fn test_chain_issuer_indices() {
        let (root, root_key) = make_ca("Root CA", None);
        let (inter, inter_key) = make_ca("Intermediate CA", Some((&root, &root_key)));
        let (leaf, _) = issue("api.example.com", &["api.example.com"], &inter, &inter_key);

        let chain = CertificateChain::new(vec![leaf.clone(), inter.clone(), root.clone()]);
        assert_eq!(chain.issuer_index(0), Some(1));
        assert_eq!(chain.issuer_index(1), Some(2));
        assert_eq!(chain.issuer_index(2), None);
        assert_eq!(chain.issuer_of(0), Some(&inter));
        assert!(leaf.is_signed_by(&inter));
        assert!(!leaf.is_signed_by(&root));

        // Out of order chains still resolve their issuers by name.
        let shuffled = CertificateChain::new(vec![leaf, root, inter]);
        assert_eq!(shuffled.issuer_index(0), Some(2));
        assert_eq!(shuffled.issuer_index(2), Some(1));
    }

    #[test]
    fn test_key_mismatch_rejected() {
        let a = CertifiedKey::self_signed("a", &[]).unwrap();
        let b = CertifiedKey::self_signed("b", &[]).unwrap();
        let err = CertifiedKey::new(a.chain().clone(), b.private_key().to_owned()).unwrap_err();
        assert!(matches!(err, TlsError::Certificate(_)));
    }

    #[test]
    fn test_pem_bundle_loading() {
        let identity = CertifiedKey::self_signed("bundle.test", &["bundle.test"]).unwrap();
        let mut pem = identity.chain().leaf().unwrap().x509().to_pem().unwrap();
        pem.extend_from_slice(&identity.private_key().private_key_to_pem_pkcs8().unwrap());

        let loaded = CertifiedKey::from_pem_bundle(&pem).unwrap();
        assert_eq!(loaded.chain().leaf(), identity.chain().leaf());

        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), &pem).unwrap();
        let from_file = CertifiedKey::from_file(file.path()).unwrap();
        assert_eq!(from_file.chain().len(), 1);
    }
}
