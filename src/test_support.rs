//! Certificate fixtures for unit tests

use crate::cert::{Certificate, CertificateChain, CertifiedKey};
use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::ec::{EcGroup, EcKey};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::x509::extension::{BasicConstraints, SubjectAlternativeName};
use openssl::x509::{X509Builder, X509NameBuilder, X509};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

fn new_key() -> PKey<Private> {
    let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).unwrap();
    PKey::from_ec_key(EcKey::generate(&group).unwrap()).unwrap()
}

fn unix(t: SystemTime) -> libc::time_t {
    t.duration_since(UNIX_EPOCH).unwrap().as_secs() as libc::time_t
}

fn builder(
    cn: &str,
    key: &PKey<Private>,
    not_before: SystemTime,
    not_after: SystemTime,
) -> X509Builder {
    let mut name = X509NameBuilder::new().unwrap();
    name.append_entry_by_nid(Nid::COMMONNAME, cn).unwrap();
    name.append_entry_by_nid(Nid::ORGANIZATIONNAME, "vtls tests").unwrap();
    let name = name.build();

    let mut serial = BigNum::new().unwrap();
    serial.rand(64, MsbOption::MAYBE_ZERO, false).unwrap();

    let mut builder = X509::builder().unwrap();
    builder.set_version(2).unwrap();
    builder.set_serial_number(&serial.to_asn1_integer().unwrap()).unwrap();
    builder.set_subject_name(&name).unwrap();
    builder.set_issuer_name(&name).unwrap();
    builder.set_pubkey(key).unwrap();
    builder.set_not_before(&Asn1Time::from_unix(unix(not_before)).unwrap()).unwrap();
    builder.set_not_after(&Asn1Time::from_unix(unix(not_after)).unwrap()).unwrap();
    builder
}

fn default_window() -> (SystemTime, SystemTime) {
    let now = SystemTime::now();
    (now - Duration::from_secs(3600), now + Duration::from_secs(30 * 86_400))
}

/// A CA certificate, self-signed when `parent` is None
pub fn make_ca(cn: &str, parent: Option<(&Certificate, &PKey<Private>)>) -> (Certificate, PKey<Private>) {
    let key = new_key();
    let (nb, na) = default_window();
    let mut b = builder(cn, &key, nb, na);
    b.append_extension(BasicConstraints::new().critical().ca().build().unwrap()).unwrap();
    match parent {
        Some((issuer, issuer_key)) => {
            b.set_issuer_name(issuer.x509().subject_name()).unwrap();
            b.sign(issuer_key, MessageDigest::sha256()).unwrap();
        }
        None => b.sign(&key, MessageDigest::sha256()).unwrap(),
    }
    (Certificate::from_x509(b.build()).unwrap(), key)
}

fn leaf_builder(
    cn: &str,
    alt_names: &[&str],
    key: &PKey<Private>,
    window: (SystemTime, SystemTime),
    issuer: &Certificate,
) -> X509Builder {
    let mut b = builder(cn, key, window.0, window.1);
    b.set_issuer_name(issuer.x509().subject_name()).unwrap();
    if !alt_names.is_empty() {
        let mut san = SubjectAlternativeName::new();
        for alt in alt_names {
            if alt.parse::<std::net::IpAddr>().is_ok() {
                san.ip(alt);
            } else {
                san.dns(alt);
            }
        }
        let ext = san.build(&b.x509v3_context(Some(issuer.x509()), None)).unwrap();
        b.append_extension(ext).unwrap();
    }
    b
}

/// An end-entity certificate issued by `issuer`
pub fn issue(
    cn: &str,
    alt_names: &[&str],
    issuer: &Certificate,
    issuer_key: &PKey<Private>,
) -> (Certificate, PKey<Private>) {
    let key = new_key();
    let mut b = leaf_builder(cn, alt_names, &key, default_window(), issuer);
    b.sign(issuer_key, MessageDigest::sha256()).unwrap();
    (Certificate::from_x509(b.build()).unwrap(), key)
}

/// An end-entity certificate (no alt names) with an explicit validity window
pub fn cert_with_validity(
    cn: &str,
    not_before: SystemTime,
    not_after: SystemTime,
    issuer: &Certificate,
    issuer_key: &PKey<Private>,
) -> Certificate {
    let key = new_key();
    let mut b = leaf_builder(cn, &[], &key, (not_before, not_after), issuer);
    b.sign(issuer_key, MessageDigest::sha256()).unwrap();
    Certificate::from_x509(b.build()).unwrap()
}

/// A root CA plus a server identity for `names` issued by it
pub fn ca_and_identity(names: &[&str]) -> (Certificate, CertifiedKey) {
    let (ca, ca_key) = make_ca("Test Root CA", None);
    let (leaf, key) = issue(names.first().copied().unwrap_or("localhost"), names, &ca, &ca_key);
    let identity = CertifiedKey::new(CertificateChain::new(vec![leaf]), key).unwrap();
    (ca, identity)
}
