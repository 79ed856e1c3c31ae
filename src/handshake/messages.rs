//! Handshake message encoding
//!
//! Every message is `type(1) | length(3) | body`. Messages may span records
//! and records may carry several messages; [`HandshakeJoiner`] reassembles
//! them from record payloads.

use crate::codec::{put_nested, put_u24, put_vec_u16, put_vec_u24, put_vec_u8, Reader};
use crate::error::TlsError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Largest handshake message accepted from a peer
pub const MAX_HANDSHAKE_MESSAGE_LEN: usize = 1 << 16;

const HEADER_LEN: usize = 4;

/// Handshake message types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HandshakeType {
    HelloRequest = 0,
    ClientHello = 1,
    ServerHello = 2,
    NewSessionTicket = 4,
    Certificate = 11,
    CertificateRequest = 13,
    CertificateVerify = 15,
    Finished = 20,
}

impl HandshakeType {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0 => Some(HandshakeType::HelloRequest),
            1 => Some(HandshakeType::ClientHello),
            2 => Some(HandshakeType::ServerHello),
            4 => Some(HandshakeType::NewSessionTicket),
            11 => Some(HandshakeType::Certificate),
            13 => Some(HandshakeType::CertificateRequest),
            15 => Some(HandshakeType::CertificateVerify),
            20 => Some(HandshakeType::Finished),
            _ => None,
        }
    }
}

/// Resumption offer carried in a ClientHello
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PskOffer {
    pub identity: Bytes,
    pub binder: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientHello {
    pub random: [u8; 32],
    /// Offered versions, wire codes, preferred first
    pub versions: Vec<u16>,
    pub cipher_suites: Vec<u16>,
    /// (group, public key) pairs
    pub key_shares: Vec<(u16, Vec<u8>)>,
    pub server_name: Option<String>,
    pub alpn: Vec<String>,
    pub psk: Option<PskOffer>,
}

impl ClientHello {
    /// The full message with an empty binder, which is what the binder signs
    pub fn encode_for_binder(&self) -> Result<Bytes, TlsError> {
        let mut truncated = self.clone();
        if let Some(psk) = truncated.psk.as_mut() {
            psk.binder.clear();
        }
        HandshakeMessage::ClientHello(truncated).encode()
    }

    fn encode_body(&self, buf: &mut BytesMut) -> Result<(), TlsError> {
        buf.put_slice(&self.random);
        put_nested(buf, 1, |b| {
            self.versions.iter().for_each(|v| b.put_u16(*v));
            Ok(())
        })?;
        put_nested(buf, 2, |b| {
            self.cipher_suites.iter().for_each(|s| b.put_u16(*s));
            Ok(())
        })?;
        put_nested(buf, 2, |b| {
            for (group, key) in &self.key_shares {
                b.put_u16(*group);
                put_vec_u16(b, key)?;
            }
            Ok(())
        })?;
        put_vec_u16(buf, self.server_name.as_deref().unwrap_or("").as_bytes())?;
        put_alpn(buf, &self.alpn)?;
        match &self.psk {
            Some(psk) => {
                put_vec_u16(buf, &psk.identity)?;
                put_vec_u8(buf, &psk.binder)
            }
            None => {
                put_vec_u16(buf, &[])?;
                put_vec_u8(buf, &[])
            }
        }
    }

    fn decode_body(r: &mut Reader<'_>) -> Result<Self, TlsError> {
        let random = r.array()?;

        let mut list = r.sub_u8()?;
        let mut versions = Vec::new();
        while !list.is_empty() {
            versions.push(list.u16()?);
        }

        let mut list = r.sub_u16()?;
        let mut cipher_suites = Vec::new();
        while !list.is_empty() {
            cipher_suites.push(list.u16()?);
        }

        let mut list = r.sub_u16()?;
        let mut key_shares = Vec::new();
        while !list.is_empty() {
            let group = list.u16()?;
            key_shares.push((group, list.vec_u16()?.to_vec()));
        }

        let server_name = optional_string(r.vec_u16()?)?;
        let alpn = get_alpn(r)?;

        let identity = r.vec_u16()?;
        let binder = r.vec_u8()?;
        let psk = if identity.is_empty() {
            None
        } else {
            Some(PskOffer {
                identity: Bytes::copy_from_slice(identity),
                binder: binder.to_vec(),
            })
        };

        if versions.is_empty() || cipher_suites.is_empty() {
            return Err(TlsError::decode("ClientHello"));
        }

        Ok(ClientHello {
            random,
            versions,
            cipher_suites,
            key_shares,
            server_name,
            alpn,
            psk,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerHello {
    pub random: [u8; 32],
    pub version: u16,
    pub cipher_suite: u16,
    pub key_share: Option<(u16, Vec<u8>)>,
    pub resumed: bool,
    /// A NewSessionTicket follows the client's Finished
    pub session_ticket: bool,
    pub alpn: Option<String>,
}

const HELLO_RESUMED: u8 = 0x01;
const HELLO_SESSION_TICKET: u8 = 0x02;

impl ServerHello {
    fn encode_body(&self, buf: &mut BytesMut) -> Result<(), TlsError> {
        buf.put_slice(&self.random);
        buf.put_u16(self.version);
        buf.put_u16(self.cipher_suite);
        match &self.key_share {
            Some((group, key)) => {
                buf.put_u16(*group);
                put_vec_u16(buf, key)?;
            }
            None => {
                buf.put_u16(0);
                put_vec_u16(buf, &[])?;
            }
        }
        let mut flags = 0;
        if self.resumed {
            flags |= HELLO_RESUMED;
        }
        if self.session_ticket {
            flags |= HELLO_SESSION_TICKET;
        }
        buf.put_u8(flags);
        put_vec_u8(buf, self.alpn.as_deref().unwrap_or("").as_bytes())
    }

    fn decode_body(r: &mut Reader<'_>) -> Result<Self, TlsError> {
        let random = r.array()?;
        let version = r.u16()?;
        let cipher_suite = r.u16()?;
        let group = r.u16()?;
        let key = r.vec_u16()?;
        let key_share = if group == 0 { None } else { Some((group, key.to_vec())) };
        let flags = r.u8()?;
        if flags & !(HELLO_RESUMED | HELLO_SESSION_TICKET) != 0 {
            return Err(TlsError::decode("ServerHello"));
        }
        let alpn = optional_string(r.vec_u8()?)?;
        Ok(ServerHello {
            random,
            version,
            cipher_suite,
            key_share,
            resumed: flags & HELLO_RESUMED != 0,
            session_ticket: flags & HELLO_SESSION_TICKET != 0,
            alpn,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSessionTicket {
    pub lifetime: u32,
    pub nonce: Vec<u8>,
    /// Session id or sealed ticket
    pub identity: Bytes,
}

/// A decoded handshake message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeMessage {
    HelloRequest,
    ClientHello(ClientHello),
    ServerHello(ServerHello),
    NewSessionTicket(NewSessionTicket),
    /// DER certificates, leaf first; empty when a client has none
    Certificate(Vec<Bytes>),
    /// Acceptable signature schemes
    CertificateRequest(Vec<u16>),
    CertificateVerify { scheme: u16, signature: Vec<u8> },
    Finished(Vec<u8>),
}

impl HandshakeMessage {
    pub fn typ(&self) -> HandshakeType {
        match self {
            HandshakeMessage::HelloRequest => HandshakeType::HelloRequest,
            HandshakeMessage::ClientHello(_) => HandshakeType::ClientHello,
            HandshakeMessage::ServerHello(_) => HandshakeType::ServerHello,
            HandshakeMessage::NewSessionTicket(_) => HandshakeType::NewSessionTicket,
            HandshakeMessage::Certificate(_) => HandshakeType::Certificate,
            HandshakeMessage::CertificateRequest(_) => HandshakeType::CertificateRequest,
            HandshakeMessage::CertificateVerify { .. } => HandshakeType::CertificateVerify,
            HandshakeMessage::Finished(_) => HandshakeType::Finished,
        }
    }

    /// Encode with the 4 byte header
    pub fn encode(&self) -> Result<Bytes, TlsError> {
        let mut body = BytesMut::new();
        match self {
            HandshakeMessage::HelloRequest => {}
            HandshakeMessage::ClientHello(ch) => ch.encode_body(&mut body)?,
            HandshakeMessage::ServerHello(sh) => sh.encode_body(&mut body)?,
            HandshakeMessage::NewSessionTicket(t) => {
                body.put_u32(t.lifetime);
                put_vec_u8(&mut body, &t.nonce)?;
                put_vec_u16(&mut body, &t.identity)?;
            }
            HandshakeMessage::Certificate(certs) => {
                put_nested(&mut body, 3, |b| {
                    for der in certs {
                        put_vec_u24(b, der)?;
                    }
                    Ok(())
                })?;
            }
            HandshakeMessage::CertificateRequest(schemes) => {
                put_nested(&mut body, 2, |b| {
                    schemes.iter().for_each(|s| b.put_u16(*s));
                    Ok(())
                })?;
            }
            HandshakeMessage::CertificateVerify { scheme, signature } => {
                body.put_u16(*scheme);
                put_vec_u16(&mut body, signature)?;
            }
            HandshakeMessage::Finished(verify_data) => body.put_slice(verify_data),
        }

        let mut out = BytesMut::with_capacity(HEADER_LEN + body.len());
        out.put_u8(self.typ() as u8);
        put_u24(&mut out, body.len())?;
        out.put_slice(&body);
        Ok(out.freeze())
    }

    pub fn decode(typ: HandshakeType, body: &[u8]) -> Result<Self, TlsError> {
        let what = match typ {
            HandshakeType::HelloRequest => "HelloRequest",
            HandshakeType::ClientHello => "ClientHello",
            HandshakeType::ServerHello => "ServerHello",
            HandshakeType::NewSessionTicket => "NewSessionTicket",
            HandshakeType::Certificate => "Certificate",
            HandshakeType::CertificateRequest => "CertificateRequest",
            HandshakeType::CertificateVerify => "CertificateVerify",
            HandshakeType::Finished => "Finished",
        };
        let mut r = Reader::new(body, what);
        let msg = match typ {
            HandshakeType::HelloRequest => HandshakeMessage::HelloRequest,
            HandshakeType::ClientHello => HandshakeMessage::ClientHello(ClientHello::decode_body(&mut r)?),
            HandshakeType::ServerHello => HandshakeMessage::ServerHello(ServerHello::decode_body(&mut r)?),
            HandshakeType::NewSessionTicket => {
                let lifetime = r.u32()?;
                let nonce = r.vec_u8()?.to_vec();
                let identity = Bytes::copy_from_slice(r.vec_u16()?);
                if identity.is_empty() {
                    return Err(TlsError::decode(what));
                }
                HandshakeMessage::NewSessionTicket(NewSessionTicket { lifetime, nonce, identity })
            }
            HandshakeType::Certificate => {
                let mut list = r.sub_u24()?;
                let mut certs = Vec::new();
                while !list.is_empty() {
                    certs.push(Bytes::copy_from_slice(list.vec_u24()?));
                }
                HandshakeMessage::Certificate(certs)
            }
            HandshakeType::CertificateRequest => {
                let mut list = r.sub_u16()?;
                let mut schemes = Vec::new();
                while !list.is_empty() {
                    schemes.push(list.u16()?);
                }
                HandshakeMessage::CertificateRequest(schemes)
            }
            HandshakeType::CertificateVerify => {
                let scheme = r.u16()?;
                let signature = r.vec_u16()?.to_vec();
                HandshakeMessage::CertificateVerify { scheme, signature }
            }
            HandshakeType::Finished => HandshakeMessage::Finished(r.bytes(r.remaining())?.to_vec()),
        };
        r.finish()?;
        Ok(msg)
    }
}

fn optional_string(bytes: &[u8]) -> Result<Option<String>, TlsError> {
    if bytes.is_empty() {
        return Ok(None);
    }
    String::from_utf8(bytes.to_vec())
        .map(Some)
        .map_err(|_| TlsError::decode("name"))
}

fn put_alpn(buf: &mut BytesMut, protocols: &[String]) -> Result<(), TlsError> {
    put_nested(buf, 2, |b| {
        for p in protocols {
            put_vec_u8(b, p.as_bytes())?;
        }
        Ok(())
    })
}

fn get_alpn(r: &mut Reader<'_>) -> Result<Vec<String>, TlsError> {
    let mut list = r.sub_u16()?;
    let mut protocols = Vec::new();
    while !list.is_empty() {
        let name = list.vec_u8()?;
        match optional_string(name)? {
            Some(p) => protocols.push(p),
            None => return Err(TlsError::decode("ALPN protocol list")),
        }
    }
    Ok(protocols)
}

/// Reassembles handshake messages from record payloads
#[derive(Debug, Default)]
pub struct HandshakeJoiner {
    buf: BytesMut,
}

impl HandshakeJoiner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, payload: &[u8]) {
        self.buf.extend_from_slice(payload);
    }

    /// True when no partial message is buffered
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Next complete message and its raw encoding (header included)
    pub fn next_message(&mut self) -> Result<Option<(HandshakeMessage, Bytes)>, TlsError> {
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }
        let typ = HandshakeType::from_u8(self.buf[0]).ok_or_else(|| {
            TlsError::unexpected(format!("unknown handshake message type {}", self.buf[0]))
        })?;
        let len = ((self.buf[1] as usize) << 16) | ((self.buf[2] as usize) << 8) | self.buf[3] as usize;
        if len > MAX_HANDSHAKE_MESSAGE_LEN {
            return Err(TlsError::ProtocolViolation(format!(
                "handshake message of {} bytes exceeds {}",
                len, MAX_HANDSHAKE_MESSAGE_LEN
            )));
        }
        if self.buf.len() < HEADER_LEN + len {
            return Ok(None);
        }
        let raw = self.buf.split_to(HEADER_LEN + len).freeze();
        let msg = HandshakeMessage::decode(typ, &raw[HEADER_LEN..])?;
        Ok(Some((msg, raw)))
    }

    pub fn clear(&mut self) {
        self.buf.advance(self.buf.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client_hello() -> ClientHello {
        ClientHello {
            random: [7u8; 32],
            versions: vec![0x0304, 0x0303],
            cipher_suites: vec![0x1301, 0x1303],
            key_shares: vec![(0x001d, vec![1u8; 32])],
            server_name: Some("example.com".to_string()),
            alpn: vec!["h2".to_string(), "http/1.1".to_string()],
            psk: Some(PskOffer {
                identity: Bytes::from_static(b"ticket"),
                binder: vec![0xaa; 32],
            }),
        }
    }

    #[test]
    fn test_client_hello_decodes_to_itself() {
        let ch = client_hello();
        let raw = HandshakeMessage::ClientHello(ch.clone()).encode().unwrap();
        assert_eq!(raw[0], HandshakeType::ClientHello as u8);

        let mut joiner = HandshakeJoiner::new();
        joiner.push(&raw);
        let (msg, bytes) = joiner.next_message().unwrap().unwrap();
        assert_eq!(msg, HandshakeMessage::ClientHello(ch));
        assert_eq!(bytes, raw);
        assert!(joiner.is_empty());
    }

    #[test]
    fn test_binder_encoding_differs_only_in_binder() {
        let ch = client_hello();
        let full = HandshakeMessage::ClientHello(ch.clone()).encode().unwrap();
        let truncated = ch.encode_for_binder().unwrap();
        assert_eq!(full.len(), truncated.len() + 32);
        // Everything before the binder length byte is identical apart from the header length.
        let binder_len_at = truncated.len() - 1;
        assert_eq!(&full[4..binder_len_at], &truncated[4..binder_len_at]);
        assert_eq!(truncated[binder_len_at], 0);
    }

    #[test]
    fn test_joiner_handles_split_and_coalesced_messages() {
        let a = HandshakeMessage::Finished(vec![1u8; 32]).encode().unwrap();
        let b = HandshakeMessage::HelloRequest.encode().unwrap();
        let mut wire = a.to_vec();
        wire.extend_from_slice(&b);

        let mut joiner = HandshakeJoiner::new();
        joiner.push(&wire[..10]);
        assert!(joiner.next_message().unwrap().is_none());
        joiner.push(&wire[10..]);
        let (first, _) = joiner.next_message().unwrap().unwrap();
        let (second, _) = joiner.next_message().unwrap().unwrap();
        assert_eq!(first, HandshakeMessage::Finished(vec![1u8; 32]));
        assert_eq!(second, HandshakeMessage::HelloRequest);
        assert!(joiner.next_message().unwrap().is_none());
    }

    #[test]
    fn test_malformed_messages() {
        let mut joiner = HandshakeJoiner::new();
        joiner.push(&[2, 0, 0, 3, 1, 2, 3]);
        let err = joiner.next_message().unwrap_err();
        assert!(err.to_string().contains("decode error"));

        let mut joiner = HandshakeJoiner::new();
        joiner.push(&[99, 0, 0, 0]);
        assert!(matches!(joiner.next_message(), Err(TlsError::ProtocolViolation(_))));

        let mut joiner = HandshakeJoiner::new();
        joiner.push(&[1, 0x10, 0, 0]);
        assert!(joiner.next_message().is_err());
    }

    #[test]
    fn test_server_hello_flags() {
        let hello = ServerHello {
            random: [3u8; 32],
            version: 0x0304,
            cipher_suite: 0x1301,
            key_share: Some((0x001d, vec![2u8; 32])),
            resumed: false,
            session_ticket: true,
            alpn: Some("h2".to_string()),
        };
        let raw = HandshakeMessage::ServerHello(hello.clone()).encode().unwrap();
        let decoded = HandshakeMessage::decode(HandshakeType::ServerHello, &raw[4..]).unwrap();
        assert_eq!(decoded, HandshakeMessage::ServerHello(hello));

        // The flags byte sits right before the one-byte ALPN length.
        let mut bad = raw.to_vec();
        let flags_at = bad.len() - 1 - "h2".len() - 1;
        assert_eq!(bad[flags_at], 0x02);
        bad[flags_at] = 0x04;
        assert!(HandshakeMessage::decode(HandshakeType::ServerHello, &bad[4..]).is_err());
    }

    #[test]
    fn test_empty_certificate_list() {
        let raw = HandshakeMessage::Certificate(Vec::new()).encode().unwrap();
        assert_eq!(&raw[..], &[11, 0, 0, 3, 0, 0, 0]);
        let msg = HandshakeMessage::decode(HandshakeType::Certificate, &raw[4..]).unwrap();
        assert_eq!(msg, HandshakeMessage::Certificate(Vec::new()));
    }
}
