//! Handshake state machine
//!
//! The machine is sans-IO: it consumes decoded handshake messages and returns
//! an ordered list of [`Action`]s (messages to send, keys to install) for the
//! connection to carry out. Client and server follow different message
//! sequences, selected when the machine is built.
//!
//! Full handshake:
//!
//! ```text
//! Client                                   Server
//! ClientHello          -------->
//!                                          ServerHello
//!                                          [CertificateRequest]
//!                                          Certificate
//!                                          CertificateVerify
//!                      <--------           Finished
//! [Certificate
//!  CertificateVerify]
//! Finished             -------->
//!                      <--------           [NewSessionTicket]
//! ```
//!
//! A ticket is only issued after the client's Finished verifies, and the
//! session it carries records the client's certificate and its verdict.
//!
//! Everything after the hellos is protected with handshake traffic keys. A
//! resumed handshake skips certificates and key exchange: the server answers
//! ServerHello with Finished right away.

mod client;
mod key_schedule;
pub mod messages;
mod server;

pub use messages::{HandshakeJoiner, HandshakeMessage, HandshakeType};

use crate::cert::{CertificateChain, CertifiedKey};
use crate::config::{ConnectionOptions, TlsVersion};
use crate::crypto::{CipherSuite, HashAlgorithm, SignatureScheme};
use crate::error::TlsError;
use crate::events::TlsEvent;
use crate::record::TrafficKeys;
use crate::session::Session;
use crate::verify::{check_server_identity, VerificationError};
use bytes::Bytes;
use client::ClientHandshake;
use server::ServerHandshake;
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, warn};

/// Which side of the connection we are
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Handshake progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// Nothing sent or received yet
    Init,
    /// Client: ClientHello sent
    SentHello,
    /// Server: ClientHello being processed
    ReceivedHello,
    /// Client: handshake keys installed, waiting for the server certificate
    KeyExchange,
    /// Server: waiting for the client certificate it asked for
    CertificateExchange,
    /// Peer certificate received, waiting for its signature
    Verifying,
    /// Waiting for the peer's Finished
    Finished,
    Established,
    Failed,
}

impl HandshakeState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, HandshakeState::Established | HandshakeState::Failed)
    }
}

/// Side effect requested by the state machine
#[derive(Debug)]
pub(crate) enum Action {
    /// Send an encoded handshake message
    Send(Bytes),
    InstallReadKeys(TrafficKeys),
    InstallWriteKeys(TrafficKeys),
}

/// Outcome of a completed handshake
#[derive(Debug, Clone)]
pub struct Negotiated {
    pub version: TlsVersion,
    pub cipher_suite: CipherSuite,
    pub alpn_protocol: Option<String>,
    pub servername: Option<String>,
    pub resumed: bool,
    pub peer_chain: Option<CertificateChain>,
    pub authorized: bool,
    pub authorization_error: Option<VerificationError>,
    /// Session issued or resumed by this handshake
    pub session: Option<Session>,
}

/// Raw handshake messages exchanged so far
#[derive(Default)]
pub(crate) struct Transcript {
    messages: Vec<u8>,
}

impl Transcript {
    pub(crate) fn add(&mut self, raw: &[u8]) {
        self.messages.extend_from_slice(raw);
    }

    pub(crate) fn hash(&self, hash: HashAlgorithm) -> Result<Vec<u8>, TlsError> {
        hash.digest(&self.messages)
    }
}

const SERVER_VERIFY_CONTEXT: &[u8] = b"TLS 1.3, server CertificateVerify";
const CLIENT_VERIFY_CONTEXT: &[u8] = b"TLS 1.3, client CertificateVerify";

/// Content signed by CertificateVerify
fn verify_content(signer: Role, transcript_hash: &[u8]) -> Vec<u8> {
    let context = match signer {
        Role::Server => SERVER_VERIFY_CONTEXT,
        Role::Client => CLIENT_VERIFY_CONTEXT,
    };
    let mut content = vec![0x20u8; 64];
    content.extend_from_slice(context);
    content.push(0);
    content.extend_from_slice(transcript_hash);
    content
}

/// Certificate + CertificateVerify for our identity
fn certificate_flight(
    identity: &CertifiedKey,
    signer: Role,
    hash: HashAlgorithm,
    transcript: &mut Transcript,
) -> Result<Vec<Action>, TlsError> {
    let certificate = HandshakeMessage::Certificate(identity.chain().to_der_list()).encode()?;
    transcript.add(&certificate);

    let scheme = identity.scheme();
    let content = verify_content(signer, &transcript.hash(hash)?);
    let signature = scheme.sign(identity.private_key(), &content)?;
    let verify = HandshakeMessage::CertificateVerify { scheme: scheme.code(), signature }.encode()?;
    transcript.add(&verify);

    Ok(vec![Action::Send(certificate), Action::Send(verify)])
}

/// Check the peer's CertificateVerify against its leaf key
fn check_certificate_verify(
    chain: &CertificateChain,
    signer: Role,
    scheme: u16,
    signature: &[u8],
    transcript_hash: &[u8],
) -> Result<(), TlsError> {
    let leaf = chain
        .leaf()
        .ok_or_else(|| TlsError::unexpected("CertificateVerify without a certificate"))?;
    let scheme = SignatureScheme::from_code(scheme).ok_or_else(|| {
        TlsError::ProtocolViolation(format!("illegal parameter: signature scheme {:#06x}", scheme))
    })?;
    let content = verify_content(signer, transcript_hash);
    let key = leaf.pkey()?;
    if scheme.verify(&key, &content, signature)? {
        Ok(())
    } else {
        Err(TlsError::ProtocolViolation(
            "decrypt error: CertificateVerify signature mismatch".to_string(),
        ))
    }
}

/// Run the verifier and apply the authorization policy
///
/// Returns the tolerated error, if any; fails when the policy rejects it.
fn authorize_peer(
    options: &ConnectionOptions,
    chain: &CertificateChain,
    hostname: Option<&str>,
    reject: bool,
) -> Result<Option<VerificationError>, TlsError> {
    let result = options
        .verifier
        .verify_chain_at(chain, SystemTime::now())
        .and_then(|()| match (hostname, chain.leaf()) {
            (Some(host), Some(leaf)) => match &options.check_server_identity {
                Some(check) => check(host, leaf),
                None => check_server_identity(host, leaf),
            },
            _ => Ok(()),
        });

    let error = result.err();
    options.emit(&TlsEvent::PeerCertificate {
        chain: chain.clone(),
        authorized: error.is_none(),
        error: error.clone(),
    });

    match error {
        None => {
            debug!(depth = chain.len(), "Peer certificate verified");
            Ok(None)
        }
        Some(e) if reject => Err(TlsError::Verification(e)),
        Some(e) => {
            warn!(code = e.code(), "Tolerating unauthorized peer certificate: {}", e);
            Ok(Some(e))
        }
    }
}

/// A handshake in progress, client or server side
pub(crate) enum Handshake {
    Client(ClientHandshake),
    Server(ServerHandshake),
}

impl Handshake {
    pub(crate) fn new(role: Role, options: Arc<ConnectionOptions>) -> Self {
        match role {
            Role::Client => Handshake::Client(ClientHandshake::new(options)),
            Role::Server => Handshake::Server(ServerHandshake::new(options)),
        }
    }

    /// First flight; empty for servers
    pub(crate) fn start(&mut self) -> Result<Vec<Action>, TlsError> {
        match self {
            Handshake::Client(c) => c.start(),
            Handshake::Server(_) => Ok(Vec::new()),
        }
    }

    pub(crate) fn handle(&mut self, msg: HandshakeMessage, raw: &[u8]) -> Result<Vec<Action>, TlsError> {
        let before = self.state();
        let result = match self {
            Handshake::Client(c) => c.handle(msg, raw),
            Handshake::Server(s) => s.handle(msg, raw),
        };
        match &result {
            Ok(_) if self.state() != before => {
                debug!(from = ?before, to = ?self.state(), "Handshake state transition");
            }
            Ok(_) => {}
            Err(e) => {
                debug!(from = ?before, error = %e, "Handshake failed");
                self.fail();
            }
        }
        result
    }

    pub(crate) fn state(&self) -> HandshakeState {
        match self {
            Handshake::Client(c) => c.state,
            Handshake::Server(s) => s.state,
        }
    }

    fn fail(&mut self) {
        match self {
            Handshake::Client(c) => c.state = HandshakeState::Failed,
            Handshake::Server(s) => s.state = HandshakeState::Failed,
        }
    }

    /// Negotiated parameters, once established
    pub(crate) fn take_negotiated(&mut self) -> Option<Negotiated> {
        if self.state() != HandshakeState::Established {
            return None;
        }
        match self {
            Handshake::Client(c) => c.negotiated.take(),
            Handshake::Server(s) => s.negotiated.take(),
        }
    }
}
