//! Key schedule
//!
//! ```text
//! early     = Extract(0, psk | 0)
//! handshake = Extract(Derive(early, "derived"), ecdhe | 0)
//!   c/s hs traffic = Derive(handshake, "c hs traffic" | "s hs traffic", H(CH..SH))
//! master    = Extract(Derive(handshake, "derived"), 0)
//!   c/s ap traffic = Derive(master, "c ap traffic" | "s ap traffic", H(CH..server Finished))
//!   res master     = Derive(master, "res master", H(CH..client Finished))
//! ```
//!
//! The resumption master secret covers the client's Finished, so a session
//! can only be issued once the client has authenticated.

use crate::config::TlsVersion;
use crate::crypto::{ct_eq, CipherSuite, HashAlgorithm, Hkdf, Secret};
use crate::error::TlsError;
use crate::record::TrafficKeys;
use tracing::debug;

pub(crate) struct KeySchedule {
    hkdf: Hkdf,
    suite: CipherSuite,
    early: Secret,
    client_hs: Option<Secret>,
    server_hs: Option<Secret>,
    master: Option<Secret>,
    resumption_master: Option<Secret>,
}

impl KeySchedule {
    pub(crate) fn new(
        version: TlsVersion,
        suite: CipherSuite,
        psk: Option<&[u8]>,
    ) -> Result<Self, TlsError> {
        let hkdf = Hkdf::new(suite.hash(), version.label_prefix());
        let zeros = vec![0u8; suite.hash().output_len()];
        let early = hkdf.extract(&[], psk.unwrap_or(&zeros))?;
        Ok(KeySchedule {
            hkdf,
            suite,
            early,
            client_hs: None,
            server_hs: None,
            master: None,
            resumption_master: None,
        })
    }

    pub(crate) fn hash(&self) -> HashAlgorithm {
        self.suite.hash()
    }

    fn empty_hash(&self) -> Result<Vec<u8>, TlsError> {
        self.hash().digest(&[])
    }

    fn finished_mac(&self, base: &[u8], transcript_hash: &[u8]) -> Result<Vec<u8>, TlsError> {
        let key = self
            .hkdf
            .expand_label(base, "finished", b"", self.hash().output_len())?;
        self.hash().hmac(&key, &[transcript_hash])
    }

    /// PSK binder over the hash of the ClientHello with its binder blanked
    pub(crate) fn binder(&self, truncated_hello_hash: &[u8]) -> Result<Vec<u8>, TlsError> {
        let binder_key = self
            .hkdf
            .derive_secret(&self.early, "res binder", &self.empty_hash()?)?;
        self.finished_mac(&binder_key, truncated_hello_hash)
    }

    pub(crate) fn check_binder(&self, truncated_hello_hash: &[u8], binder: &[u8]) -> Result<(), TlsError> {
        if ct_eq(&self.binder(truncated_hello_hash)?, binder) {
            Ok(())
        } else {
            Err(TlsError::ProtocolViolation("decrypt error: PSK binder mismatch".to_string()))
        }
    }

    /// Mix in the (EC)DHE secret and derive handshake traffic keys
    ///
    /// Returns (client, server) keys.
    pub(crate) fn handshake_keys(
        &mut self,
        shared_secret: Option<&[u8]>,
        hello_hash: &[u8],
    ) -> Result<(TrafficKeys, TrafficKeys), TlsError> {
        let zeros = vec![0u8; self.hash().output_len()];
        let salt = self.hkdf.derive_secret(&self.early, "derived", &self.empty_hash()?)?;
        let handshake = self.hkdf.extract(&salt, shared_secret.unwrap_or(&zeros))?;

        let client_hs = self.hkdf.derive_secret(&handshake, "c hs traffic", hello_hash)?;
        let server_hs = self.hkdf.derive_secret(&handshake, "s hs traffic", hello_hash)?;

        let salt = self.hkdf.derive_secret(&handshake, "derived", &self.empty_hash()?)?;
        self.master = Some(self.hkdf.extract(&salt, &zeros)?);

        let keys = (
            TrafficKeys::derive(&self.hkdf, self.suite, &client_hs)?,
            TrafficKeys::derive(&self.hkdf, self.suite, &server_hs)?,
        );
        self.client_hs = Some(client_hs);
        self.server_hs = Some(server_hs);
        debug!(suite = self.suite.name(), "Derived handshake traffic keys");
        Ok(keys)
    }

    /// Application traffic keys, (client, server)
    pub(crate) fn application_keys(
        &self,
        transcript_hash: &[u8],
    ) -> Result<(TrafficKeys, TrafficKeys), TlsError> {
        let master = self.master.as_ref().ok_or_else(out_of_order)?;
        let client_ap = self.hkdf.derive_secret(master, "c ap traffic", transcript_hash)?;
        let server_ap = self.hkdf.derive_secret(master, "s ap traffic", transcript_hash)?;
        debug!(suite = self.suite.name(), "Derived application traffic keys");
        Ok((
            TrafficKeys::derive(&self.hkdf, self.suite, &client_ap)?,
            TrafficKeys::derive(&self.hkdf, self.suite, &server_ap)?,
        ))
    }

    pub(crate) fn client_finished(&self, transcript_hash: &[u8]) -> Result<Vec<u8>, TlsError> {
        let base = self.client_hs.as_ref().ok_or_else(out_of_order)?;
        self.finished_mac(base, transcript_hash)
    }

    pub(crate) fn server_finished(&self, transcript_hash: &[u8]) -> Result<Vec<u8>, TlsError> {
        let base = self.server_hs.as_ref().ok_or_else(out_of_order)?;
        self.finished_mac(base, transcript_hash)
    }

    /// Fix the resumption master once the client's Finished is in the transcript
    pub(crate) fn derive_resumption_master(&mut self, transcript_hash: &[u8]) -> Result<(), TlsError> {
        let master = self.master.as_ref().ok_or_else(out_of_order)?;
        self.resumption_master = Some(self.hkdf.derive_secret(master, "res master", transcript_hash)?);
        Ok(())
    }

    /// Resumption secret for the ticket issued with `nonce`
    pub(crate) fn session_secret(&self, nonce: &[u8]) -> Result<Secret, TlsError> {
        let base = self.resumption_master.as_ref().ok_or_else(out_of_order)?;
        self.hkdf
            .expand_label(base, "resumption", nonce, self.hash().output_len())
    }
}

fn out_of_order() -> TlsError {
    TlsError::ProtocolViolation("key schedule used out of order".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{ContentType, RecordLayer};

    fn hash(data: &[u8]) -> Vec<u8> {
        HashAlgorithm::Sha256.digest(data).unwrap()
    }

    #[test]
    fn test_both_sides_derive_matching_keys() {
        let suite = CipherSuite::Aes128GcmSha256;
        let mut client = KeySchedule::new(TlsVersion::Tls13, suite, None).unwrap();
        let mut server = KeySchedule::new(TlsVersion::Tls13, suite, None).unwrap();
        let hello = hash(b"CH..SH");

        let (c_write, _) = client.handshake_keys(Some(b"shared"), &hello).unwrap();
        let (s_read, _) = server.handshake_keys(Some(b"shared"), &hello).unwrap();

        let mut tx = RecordLayer::new();
        let mut rx = RecordLayer::new();
        tx.install_write_keys(c_write);
        rx.install_read_keys(s_read);
        rx.push(&tx.frame(ContentType::Handshake, b"record").unwrap());
        assert_eq!(&rx.unframe().unwrap().unwrap().payload[..], b"record");

        let transcript = hash(b"CH..SF");
        assert_eq!(
            client.server_finished(&transcript).unwrap(),
            server.server_finished(&transcript).unwrap()
        );
        assert_ne!(
            client.client_finished(&transcript).unwrap(),
            client.server_finished(&transcript).unwrap()
        );
    }

    #[test]
    fn test_version_changes_keys() {
        let suite = CipherSuite::Aes128GcmSha256;
        let hello = hash(b"hello");
        let mut v13 = KeySchedule::new(TlsVersion::Tls13, suite, None).unwrap();
        let mut v12 = KeySchedule::new(TlsVersion::Tls12, suite, None).unwrap();
        let (k13, _) = v13.handshake_keys(Some(b"s"), &hello).unwrap();
        let (k12, _) = v12.handshake_keys(Some(b"s"), &hello).unwrap();

        let mut tx = RecordLayer::new();
        let mut rx = RecordLayer::new();
        tx.install_write_keys(k13);
        rx.install_read_keys(k12);
        rx.push(&tx.frame(ContentType::Handshake, b"record").unwrap());
        assert!(matches!(rx.unframe(), Err(TlsError::Integrity(_))));
    }

    #[test]
    fn test_binder() {
        let suite = CipherSuite::Aes256GcmSha384;
        let psk = [3u8; 48];
        let ks = KeySchedule::new(TlsVersion::Tls13, suite, Some(&psk)).unwrap();
        let h = HashAlgorithm::Sha384.digest(b"truncated hello").unwrap();
        let binder = ks.binder(&h).unwrap();
        assert_eq!(binder.len(), 48);
        assert!(ks.check_binder(&h, &binder).is_ok());

        let other = KeySchedule::new(TlsVersion::Tls13, suite, Some(&[4u8; 48])).unwrap();
        let err = other.check_binder(&h, &binder).unwrap_err();
        assert!(err.to_string().contains("binder"));
    }

    #[test]
    fn test_out_of_order_use() {
        let ks = KeySchedule::new(TlsVersion::Tls13, CipherSuite::Aes128GcmSha256, None).unwrap();
        assert!(ks.application_keys(&hash(b"x")).is_err());
        assert!(ks.session_secret(b"nonce").is_err());
    }

    #[test]
    fn test_resumption_secret_needs_full_transcript() {
        let suite = CipherSuite::Aes128GcmSha256;
        let mut client = KeySchedule::new(TlsVersion::Tls13, suite, None).unwrap();
        let mut server = KeySchedule::new(TlsVersion::Tls13, suite, None).unwrap();
        let hello = hash(b"CH..SH");
        client.handshake_keys(Some(b"shared"), &hello).unwrap();
        server.handshake_keys(Some(b"shared"), &hello).unwrap();

        // Handshake keys alone do not yield a resumption secret.
        assert!(server.session_secret(b"nonce").is_err());

        client.derive_resumption_master(&hash(b"CH..CF")).unwrap();
        server.derive_resumption_master(&hash(b"CH..CF")).unwrap();
        assert_eq!(
            &client.session_secret(b"nonce").unwrap()[..],
            &server.session_secret(b"nonce").unwrap()[..]
        );

        let mut other = KeySchedule::new(TlsVersion::Tls13, suite, None).unwrap();
        other.handshake_keys(Some(b"shared"), &hello).unwrap();
        other.derive_resumption_master(&hash(b"CH..SF")).unwrap();
        assert_ne!(
            &other.session_secret(b"nonce").unwrap()[..],
            &server.session_secret(b"nonce").unwrap()[..]
        );
    }
}
