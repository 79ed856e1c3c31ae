//! Shared fixtures for the integration tests

#![allow(dead_code)]

use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::ec::{EcGroup, EcKey};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::x509::extension::{BasicConstraints, SubjectAlternativeName};
use openssl::x509::{X509NameBuilder, X509};
use std::thread::{self, JoinHandle};
use vtls::{Certificate, CertifiedKey, MemoryTransport, TlsConfig, TlsStream, TrustAnchors};

/// A private CA and one leaf it issued, in both PEM and parsed form
pub struct Pki {
    pub ca_pem: Vec<u8>,
    pub leaf_pem: Vec<u8>,
    pub key_pem: Vec<u8>,
    pub ca: Certificate,
    pub identity: CertifiedKey,
}

impl Pki {
    pub fn anchors(&self) -> TrustAnchors {
        TrustAnchors::new(vec![self.ca.clone()])
    }
}

fn new_key() -> PKey<Private> {
    let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).unwrap();
    PKey::from_ec_key(EcKey::generate(&group).unwrap()).unwrap()
}

fn build(cn: &str, key: &PKey<Private>, issuer: Option<(&X509, &PKey<Private>)>, names: &[&str]) -> X509 {
    let mut name = X509NameBuilder::new().unwrap();
    name.append_entry_by_nid(Nid::COMMONNAME, cn).unwrap();
    let name = name.build();

    let mut serial = BigNum::new().unwrap();
    serial.rand(64, MsbOption::MAYBE_ZERO, false).unwrap();

    let mut b = X509::builder().unwrap();
    b.set_version(2).unwrap();
    b.set_serial_number(&serial.to_asn1_integer().unwrap()).unwrap();
    b.set_subject_name(&name).unwrap();
    b.set_pubkey(key).unwrap();
    b.set_not_before(&Asn1Time::days_from_now(0).unwrap()).unwrap();
    b.set_not_after(&Asn1Time::days_from_now(30).unwrap()).unwrap();

    match issuer {
        None => {
            b.set_issuer_name(&name).unwrap();
            b.append_extension(BasicConstraints::new().critical().ca().build().unwrap()).unwrap();
            b.sign(key, MessageDigest::sha256()).unwrap();
        }
        Some((ca, ca_key)) => {
            b.set_issuer_name(ca.subject_name()).unwrap();
            let mut san = SubjectAlternativeName::new();
            for n in names {
                if n.parse::<std::net::IpAddr>().is_ok() {
                    san.ip(n);
                } else {
                    san.dns(n);
                }
            }
            let ext = san.build(&b.x509v3_context(Some(ca), None)).unwrap();
            b.append_extension(ext).unwrap();
            b.sign(ca_key, MessageDigest::sha256()).unwrap();
        }
    }
    b.build()
}

/// CA "Integration Root" issuing a leaf for `names` (CN = first name)
pub fn pki(names: &[&str]) -> Pki {
    let ca_key = new_key();
    let ca = build("Integration Root", &ca_key, None, &[]);
    let key = new_key();
    let leaf = build(names[0], &key, Some((&ca, &ca_key)), names);

    let ca_pem = ca.to_pem().unwrap();
    let leaf_pem = leaf.to_pem().unwrap();
    let key_pem = key.private_key_to_pem_pkcs8().unwrap();
    Pki {
        ca: Certificate::from_pem(&ca_pem).unwrap(),
        identity: CertifiedKey::from_pem(&leaf_pem, &key_pem).unwrap(),
        ca_pem,
        leaf_pem,
        key_pem,
    }
}

/// Accept on one end of a memory pipe in a thread, then run `f`
pub fn serve<F, R>(config: TlsConfig, f: F) -> (MemoryTransport, JoinHandle<R>)
where
    F: FnOnce(Result<TlsStream<MemoryTransport>, vtls::TlsError>) -> R + Send + 'static,
    R: Send + 'static,
{
    let (client, server) = vtls::memory_pair();
    let handle = thread::spawn(move || f(config.accept(server)));
    (client, handle)
}

/// Read until close_notify
pub fn read_to_end(stream: &mut TlsStream<MemoryTransport>) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        let n = stream.read(&mut buf).unwrap();
        if n == 0 {
            return out;
        }
        out.extend_from_slice(&buf[..n]);
    }
}
