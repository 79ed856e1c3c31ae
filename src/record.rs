//! Record layer
//!
//! Frames outbound messages into TLS records and reassembles inbound records
//! from an arbitrarily chunked byte stream. Once traffic keys are installed
//! for a direction, every record in that direction is sealed with the
//! negotiated AEAD: the real content type travels inside the ciphertext and
//! the outer header always says ApplicationData.
//!
//! Each direction keeps its own 64-bit sequence number, XORed into the IV to
//! form the nonce. Installing new keys resets it; running out of sequence
//! numbers or failing authentication is fatal.

use crate::crypto::{CipherSuite, Hkdf, Secret, NONCE_LEN, TAG_LEN};
use crate::error::TlsError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

/// Record header size (5 bytes)
pub const RECORD_HEADER_LEN: usize = 5;

/// Largest plaintext fragment a record may carry
pub const MAX_FRAGMENT_LEN: usize = 16384;

/// Smallest configurable outbound fragment size
pub const MIN_FRAGMENT_LEN: usize = 512;

/// Largest protected record body accepted from the peer
pub const MAX_CIPHERTEXT_LEN: usize = MAX_FRAGMENT_LEN + 256;

const LEGACY_RECORD_VERSION: u16 = 0x0303;

/// Record content types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ContentType {
    ChangeCipherSpec = 20,
    Alert = 21,
    Handshake = 22,
    ApplicationData = 23,
}

impl ContentType {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            20 => Some(ContentType::ChangeCipherSpec),
            21 => Some(ContentType::Alert),
            22 => Some(ContentType::Handshake),
            23 => Some(ContentType::ApplicationData),
            _ => None,
        }
    }
}

/// Key and IV for one direction of traffic
pub struct TrafficKeys {
    suite: CipherSuite,
    key: Secret,
    iv: [u8; NONCE_LEN],
}

impl TrafficKeys {
    pub fn new(suite: CipherSuite, key: &[u8], iv: [u8; NONCE_LEN]) -> Self {
        TrafficKeys { suite, key: Secret::new(key.to_vec()), iv }
    }

    /// Expand a traffic secret into key and IV
    pub fn derive(hkdf: &Hkdf, suite: CipherSuite, traffic_secret: &[u8]) -> Result<Self, TlsError> {
        let key = hkdf.expand_label(traffic_secret, "key", b"", suite.key_len())?;
        let iv_bytes = hkdf.expand_label(traffic_secret, "iv", b"", NONCE_LEN)?;
        let mut iv = [0u8; NONCE_LEN];
        iv.copy_from_slice(&iv_bytes);
        Ok(TrafficKeys { suite, key, iv })
    }

    pub fn suite(&self) -> CipherSuite {
        self.suite
    }

    fn nonce(&self, seq: u64) -> [u8; NONCE_LEN] {
        let mut nonce = self.iv;
        for (n, s) in nonce[NONCE_LEN - 8..].iter_mut().zip(seq.to_be_bytes()) {
            *n ^= s;
        }
        nonce
    }
}

impl fmt::Debug for TrafficKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrafficKeys").field("suite", &self.suite).finish_non_exhaustive()
    }
}

struct Protection {
    keys: TrafficKeys,
    seq: u64,
}

impl Protection {
    fn next_seq(&mut self) -> Result<u64, TlsError> {
        if self.seq == u64::MAX {
            return Err(TlsError::Integrity("record sequence number exhausted".to_string()));
        }
        let seq = self.seq;
        self.seq += 1;
        Ok(seq)
    }
}

/// A decoded (and, if keys are installed, decrypted) record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub content_type: ContentType,
    pub payload: Bytes,
}

/// Per-connection record framing state
pub struct RecordLayer {
    read_buf: BytesMut,
    read: Option<Protection>,
    write: Option<Protection>,
    max_fragment: usize,
}

impl RecordLayer {
    pub fn new() -> Self {
        RecordLayer {
            read_buf: BytesMut::with_capacity(RECORD_HEADER_LEN + MAX_CIPHERTEXT_LEN),
            read: None,
            write: None,
            max_fragment: MAX_FRAGMENT_LEN,
        }
    }

    /// Set the largest plaintext fragment put in an outbound record
    pub fn set_max_fragment_len(&mut self, len: usize) -> Result<(), TlsError> {
        if !(MIN_FRAGMENT_LEN..=MAX_FRAGMENT_LEN).contains(&len) {
            return Err(TlsError::InvalidConfig(format!(
                "Fragment length {} outside {}..={}",
                len, MIN_FRAGMENT_LEN, MAX_FRAGMENT_LEN
            )));
        }
        self.max_fragment = len;
        Ok(())
    }

    pub fn max_fragment_len(&self) -> usize {
        self.max_fragment
    }

    pub fn install_read_keys(&mut self, keys: TrafficKeys) {
        self.read = Some(Protection { keys, seq: 0 });
    }

    pub fn install_write_keys(&mut self, keys: TrafficKeys) {
        self.write = Some(Protection { keys, seq: 0 });
    }

    pub fn is_read_protected(&self) -> bool {
        self.read.is_some()
    }

    pub fn is_write_protected(&self) -> bool {
        self.write.is_some()
    }

    /// Frame `data` into one or more records
    ///
    /// Empty input still produces one (empty) record so that zero-length
    /// application writes are visible on the wire.
    pub fn frame(&mut self, content_type: ContentType, data: &[u8]) -> Result<BytesMut, TlsError> {
        let mut out = BytesMut::new();
        if data.is_empty() {
            self.frame_one(content_type, data, &mut out)?;
        }
        for chunk in data.chunks(self.max_fragment) {
            self.frame_one(content_type, chunk, &mut out)?;
        }
        Ok(out)
    }

    fn frame_one(
        &mut self,
        content_type: ContentType,
        fragment: &[u8],
        out: &mut BytesMut,
    ) -> Result<(), TlsError> {
        let protection = match self.write.as_mut() {
            None => {
                out.put_u8(content_type as u8);
                out.put_u16(LEGACY_RECORD_VERSION);
                out.put_u16(fragment.len() as u16);
                out.put_slice(fragment);
                return Ok(());
            }
            Some(p) => p,
        };

        let mut inner = Vec::with_capacity(fragment.len() + 1);
        inner.extend_from_slice(fragment);
        inner.push(content_type as u8);

        let mut header = [0u8; RECORD_HEADER_LEN];
        header[0] = ContentType::ApplicationData as u8;
        header[1..3].copy_from_slice(&LEGACY_RECORD_VERSION.to_be_bytes());
        header[3..5].copy_from_slice(&((inner.len() + TAG_LEN) as u16).to_be_bytes());

        let seq = protection.next_seq()?;
        let nonce = protection.keys.nonce(seq);
        let sealed = protection.keys.suite.seal(&protection.keys.key, &nonce, &header, &inner)?;

        out.put_slice(&header);
        out.put_slice(&sealed);
        Ok(())
    }

    /// Feed bytes read from the transport
    pub fn push(&mut self, data: &[u8]) {
        self.read_buf.extend_from_slice(data);
    }

    /// Bytes received but not yet consumed as a record
    pub fn buffered_len(&self) -> usize {
        self.read_buf.len()
    }

    /// Take the next complete record out of the buffer
    ///
    /// Returns `Ok(None)` when more bytes are needed. Can be called again
    /// after every `push`; partial records stay buffered.
    pub fn unframe(&mut self) -> Result<Option<Record>, TlsError> {
        if self.read_buf.len() < RECORD_HEADER_LEN {
            return Ok(None);
        }

        let outer_type = ContentType::from_u8(self.read_buf[0]).ok_or_else(|| {
            TlsError::ProtocolViolation(format!(
                "decode error: unknown record content type {}",
                self.read_buf[0]
            ))
        })?;
        if self.read_buf[1] != 0x03 {
            return Err(TlsError::ProtocolViolation(format!(
                "decode error: bad record version {:02x}{:02x}",
                self.read_buf[1], self.read_buf[2]
            )));
        }
        let length = u16::from_be_bytes([self.read_buf[3], self.read_buf[4]]) as usize;
        let limit = if self.read.is_some() { MAX_CIPHERTEXT_LEN } else { MAX_FRAGMENT_LEN };
        if length > limit {
            return Err(TlsError::ProtocolViolation(format!(
                "record overflow: {} byte record exceeds {}",
                length, limit
            )));
        }
        if self.read_buf.len() < RECORD_HEADER_LEN + length {
            return Ok(None);
        }

        let mut header = [0u8; RECORD_HEADER_LEN];
        header.copy_from_slice(&self.read_buf[..RECORD_HEADER_LEN]);
        self.read_buf.advance(RECORD_HEADER_LEN);
        let body = self.read_buf.split_to(length).freeze();

        let protection = match self.read.as_mut() {
            None => {
                return match outer_type {
                    ContentType::Handshake | ContentType::Alert => {
                        Ok(Some(Record { content_type: outer_type, payload: body }))
                    }
                    ContentType::ApplicationData => Err(TlsError::ProtocolViolation(
                        "application data before handshake completion".to_string(),
                    )),
                    ContentType::ChangeCipherSpec => Err(TlsError::unexpected("ChangeCipherSpec")),
                };
            }
            Some(p) => p,
        };

        if outer_type != ContentType::ApplicationData {
            return Err(TlsError::unexpected(format!(
                "unprotected {:?} record after keys were installed",
                outer_type
            )));
        }

        let seq = protection.next_seq()?;
        let nonce = protection.keys.nonce(seq);
        let mut inner = protection.keys.suite.open(&protection.keys.key, &nonce, &header, &body)?;

        // Strip zero padding; the last non-zero byte is the real content type.
        while inner.last() == Some(&0) {
            inner.pop();
        }
        let type_byte = inner
            .pop()
            .ok_or_else(|| TlsError::unexpected("protected record without content type"))?;
        let content_type = ContentType::from_u8(type_byte)
            .filter(|ct| *ct != ContentType::ChangeCipherSpec)
            .ok_or_else(|| TlsError::unexpected(format!("inner content type {}", type_byte)))?;
        if inner.len() > MAX_FRAGMENT_LEN {
            return Err(TlsError::ProtocolViolation(format!(
                "record overflow: {} byte plaintext",
                inner.len()
            )));
        }

        Ok(Some(Record { content_type, payload: Bytes::from(inner) }))
    }

    #[cfg(test)]
    pub(crate) fn set_sequence_numbers(&mut self, read: u64, write: u64) {
        if let Some(p) = self.read.as_mut() {
            p.seq = read;
        }
        if let Some(p) = self.write.as_mut() {
            p.seq = write;
        }
    }
}

impl Default for RecordLayer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(suite: CipherSuite, fill: u8) -> TrafficKeys {
        TrafficKeys::new(suite, &vec![fill; suite.key_len()], [fill; NONCE_LEN])
    }

    fn protected_pair(suite: CipherSuite) -> (RecordLayer, RecordLayer) {
        let mut tx = RecordLayer::new();
        let mut rx = RecordLayer::new();
        tx.install_write_keys(keys(suite, 7));
        rx.install_read_keys(keys(suite, 7));
        (tx, rx)
    }

    fn drain(rx: &mut RecordLayer) -> Vec<Record> {
        let mut records = Vec::new();
        while let Some(r) = rx.unframe().unwrap() {
            records.push(r);
        }
        records
    }

    #[test]
    fn test_plaintext_framing() {
        let mut tx = RecordLayer::new();
        let wire = tx.frame(ContentType::Handshake, b"hello").unwrap();
        assert_eq!(&wire[..5], &[22, 3, 3, 0, 5]);

        let mut rx = RecordLayer::new();
        rx.push(&wire);
        let record = rx.unframe().unwrap().unwrap();
        assert_eq!(record.content_type, ContentType::Handshake);
        assert_eq!(&record.payload[..], b"hello");
        assert!(rx.unframe().unwrap().is_none());
    }

    #[test]
    fn test_unframe_resumes_across_chunks() {
        let (mut tx, mut rx) = protected_pair(CipherSuite::Aes128GcmSha256);
        let wire = tx.frame(ContentType::ApplicationData, b"split me anywhere").unwrap();

        for byte in wire.iter() {
            assert!(rx.unframe().unwrap().is_none());
            rx.push(&[*byte]);
        }
        let record = rx.unframe().unwrap().unwrap();
        assert_eq!(&record.payload[..], b"split me anywhere");
        assert_eq!(rx.buffered_len(), 0);
    }

    #[test]
    fn test_fragmentation_and_reassembly() {
        for suite in CipherSuite::ALL {
            let (mut tx, mut rx) = protected_pair(suite);
            tx.set_max_fragment_len(MIN_FRAGMENT_LEN).unwrap();

            let payload: Vec<u8> = (0..(MAX_FRAGMENT_LEN * 2 + 17)).map(|i| i as u8).collect();
            let wire = tx.frame(ContentType::ApplicationData, &payload).unwrap();
            rx.push(&wire);

            let records = drain(&mut rx);
            assert_eq!(records.len(), payload.len().div_ceil(MIN_FRAGMENT_LEN));
            assert!(records.iter().all(|r| r.payload.len() <= MIN_FRAGMENT_LEN));
            let joined: Vec<u8> = records.iter().flat_map(|r| r.payload.to_vec()).collect();
            assert_eq!(joined, payload);
        }
    }

    #[test]
    fn test_default_fragment_is_protocol_maximum() {
        let (mut tx, mut rx) = protected_pair(CipherSuite::Aes256GcmSha384);
        let payload = vec![0xabu8; MAX_FRAGMENT_LEN + 1];
        rx.push(&tx.frame(ContentType::ApplicationData, &payload).unwrap());
        let records = drain(&mut rx);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].payload.len(), MAX_FRAGMENT_LEN);
        assert_eq!(records[1].payload.len(), 1);
    }

    #[test]
    fn test_empty_payload() {
        let (mut tx, mut rx) = protected_pair(CipherSuite::Chacha20Poly1305Sha256);
        rx.push(&tx.frame(ContentType::ApplicationData, b"").unwrap());
        let records = drain(&mut rx);
        assert_eq!(records.len(), 1);
        assert!(records[0].payload.is_empty());
    }

    #[test]
    fn test_fragment_bounds() {
        let mut layer = RecordLayer::new();
        assert!(layer.set_max_fragment_len(511).is_err());
        assert!(layer.set_max_fragment_len(16385).is_err());
        assert!(layer.set_max_fragment_len(512).is_ok());
        assert!(layer.set_max_fragment_len(16384).is_ok());
    }

    #[test]
    fn test_tampered_record_is_integrity_error() {
        let (mut tx, mut rx) = protected_pair(CipherSuite::Aes128GcmSha256);
        let mut wire = tx.frame(ContentType::ApplicationData, b"do not touch").unwrap();
        wire[RECORD_HEADER_LEN + 2] ^= 0x80;
        rx.push(&wire);
        assert!(matches!(rx.unframe(), Err(TlsError::Integrity(_))));
    }

    #[test]
    fn test_replayed_record_fails() {
        let (mut tx, mut rx) = protected_pair(CipherSuite::Aes128GcmSha256);
        let wire = tx.frame(ContentType::ApplicationData, b"once").unwrap();
        rx.push(&wire);
        rx.push(&wire);
        assert!(rx.unframe().unwrap().is_some());
        // Same bytes under the next sequence number do not authenticate.
        assert!(matches!(rx.unframe(), Err(TlsError::Integrity(_))));
    }

    #[test]
    fn test_sequence_exhaustion_is_fatal() {
        let (mut tx, _) = protected_pair(CipherSuite::Aes128GcmSha256);
        tx.set_sequence_numbers(0, u64::MAX - 1);
        assert!(tx.frame(ContentType::ApplicationData, b"last").is_ok());
        assert!(matches!(
            tx.frame(ContentType::ApplicationData, b"one too many"),
            Err(TlsError::Integrity(_))
        ));
    }

    #[test]
    fn test_inner_content_type_hidden() {
        let (mut tx, mut rx) = protected_pair(CipherSuite::Aes128GcmSha256);
        let wire = tx.frame(ContentType::Alert, &[1, 0]).unwrap();
        assert_eq!(wire[0], ContentType::ApplicationData as u8);
        rx.push(&wire);
        let record = rx.unframe().unwrap().unwrap();
        assert_eq!(record.content_type, ContentType::Alert);
    }

    #[test]
    fn test_plaintext_application_data_rejected() {
        let mut rx = RecordLayer::new();
        rx.push(&[23, 3, 3, 0, 2, b'h', b'i']);
        assert!(matches!(rx.unframe(), Err(TlsError::ProtocolViolation(_))));
    }

    #[test]
    fn test_oversized_record_rejected() {
        let mut rx = RecordLayer::new();
        rx.push(&[22, 3, 3, 0x40, 0x01]);
        let err = rx.unframe().unwrap_err();
        assert!(err.to_string().contains("record overflow"));
    }

    #[test]
    fn test_garbage_header_rejected() {
        let mut rx = RecordLayer::new();
        rx.push(b"GET / HTTP/1.1\r\n");
        assert!(matches!(rx.unframe(), Err(TlsError::ProtocolViolation(_))));
    }
}
