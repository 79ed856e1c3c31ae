//! Server side of the handshake

use super::key_schedule::KeySchedule;
use super::messages::{ClientHello, NewSessionTicket, ServerHello};
use super::{
    authorize_peer, certificate_flight, check_certificate_verify, Action, HandshakeMessage,
    HandshakeState, Negotiated, Role, Transcript,
};
use crate::cert::{CertificateChain, CertifiedKey};
use crate::config::{ClientVerify, ConnectionOptions, TlsVersion};
use crate::crypto::{ct_eq, random_array, CipherSuite, KeyShare, NamedGroup, SignatureScheme};
use crate::error::TlsError;
use crate::events::TlsEvent;
use crate::record::TrafficKeys;
use crate::session::{ResumptionPolicy, Session};
use crate::verify::VerificationError;
use bytes::Bytes;
use std::sync::Arc;
use tracing::debug;

pub(crate) struct ServerHandshake {
    options: Arc<ConnectionOptions>,
    pub(super) state: HandshakeState,
    pub(super) negotiated: Option<Negotiated>,
    transcript: Transcript,
    schedule: Option<KeySchedule>,
    version: TlsVersion,
    suite: CipherSuite,
    resumed: bool,
    alpn: Option<String>,
    servername: Option<String>,
    session: Option<Session>,
    peer_chain: Option<CertificateChain>,
    authorization_error: Option<VerificationError>,
    /// Client application keys, installed once its Finished checks out
    pending_read_keys: Option<TrafficKeys>,
}

impl ServerHandshake {
    pub(crate) fn new(options: Arc<ConnectionOptions>) -> Self {
        ServerHandshake {
            options,
            state: HandshakeState::Init,
            negotiated: None,
            transcript: Transcript::default(),
            schedule: None,
            version: TlsVersion::Tls13,
            suite: CipherSuite::Aes128GcmSha256,
            resumed: false,
            alpn: None,
            servername: None,
            session: None,
            peer_chain: None,
            authorization_error: None,
            pending_read_keys: None,
        }
    }

    pub(crate) fn handle(&mut self, msg: HandshakeMessage, raw: &[u8]) -> Result<Vec<Action>, TlsError> {
        match (self.state, msg) {
            (HandshakeState::Init, HandshakeMessage::ClientHello(hello)) => {
                self.state = HandshakeState::ReceivedHello;
                self.handle_client_hello(hello, raw)
            }
            (HandshakeState::CertificateExchange, HandshakeMessage::Certificate(ders)) => {
                self.handle_client_certificate(&ders)?;
                self.transcript.add(raw);
                Ok(Vec::new())
            }
            (HandshakeState::Verifying, HandshakeMessage::CertificateVerify { scheme, signature }) => {
                let chain = self
                    .peer_chain
                    .as_ref()
                    .ok_or_else(|| TlsError::unexpected("CertificateVerify without a certificate"))?;
                let hash = self.transcript.hash(self.suite.hash())?;
                check_certificate_verify(chain, Role::Client, scheme, &signature, &hash)?;
                self.transcript.add(raw);
                self.state = HandshakeState::Finished;
                Ok(Vec::new())
            }
            (HandshakeState::Finished, HandshakeMessage::Finished(verify_data)) => {
                self.handle_finished(&verify_data, raw)
            }
            (state, msg) => Err(TlsError::unexpected(format!("{:?} in state {:?}", msg.typ(), state))),
        }
    }

    fn schedule(&self) -> Result<&KeySchedule, TlsError> {
        self.schedule
            .as_ref()
            .ok_or_else(|| TlsError::unexpected("key schedule not started"))
    }

    fn select_version(&self, hello: &ClientHello) -> Result<TlsVersion, TlsError> {
        self.options
            .versions()
            .into_iter()
            .find(|v| hello.versions.contains(&v.wire()))
            .ok_or_else(|| TlsError::Negotiation("no common protocol version".into()))
    }

    fn select_cipher(&self, offered: &[CipherSuite]) -> Result<CipherSuite, TlsError> {
        let ours = &self.options.cipher_suites;
        let chosen = if self.options.honor_cipher_order {
            ours.iter().find(|s| offered.contains(s))
        } else {
            offered.iter().find(|s| ours.contains(s))
        };
        chosen
            .copied()
            .ok_or_else(|| TlsError::Negotiation("no common cipher suite".into()))
    }

    fn select_alpn(&self, hello: &ClientHello) -> Result<Option<String>, TlsError> {
        if self.options.alpn.is_empty() || hello.alpn.is_empty() {
            return Ok(None);
        }
        self.options
            .alpn
            .iter()
            .find(|p| hello.alpn.contains(p))
            .cloned()
            .map(Some)
            .ok_or_else(|| TlsError::Negotiation("no application protocol".into()))
    }

    /// Certificate for the requested name: callback, then SNI map, then default
    fn identity(&self) -> Result<CertifiedKey, TlsError> {
        let context = self.servername.as_deref().and_then(|name| {
            self.options
                .sni_callback
                .as_ref()
                .and_then(|callback| callback(name))
                .or_else(|| self.options.sni.lookup(name))
        });
        context
            .map(|context| context.identity().clone())
            .or_else(|| self.options.identity.clone())
            .ok_or_else(|| TlsError::InvalidConfig("server has no certificate".into()))
    }

    /// Whether a full handshake ends with a NewSessionTicket
    fn issues_sessions(&self) -> bool {
        match self.options.resumption {
            ResumptionPolicy::Disabled => false,
            ResumptionPolicy::SessionIds => self.options.session_store.is_some(),
            ResumptionPolicy::Tickets => self.options.ticket_key.is_some(),
        }
    }

    fn authorized(&self) -> bool {
        match &self.session {
            Some(session) if self.resumed => session.peer_authorized(),
            _ => self.peer_chain.is_some() && self.authorization_error.is_none(),
        }
    }

    /// Session the client offered, if we know it and it still fits
    fn lookup_session(&self, identity: &[u8], offered: &[CipherSuite]) -> Option<Session> {
        let session = match self.options.resumption {
            ResumptionPolicy::Disabled => return None,
            ResumptionPolicy::SessionIds => self.options.session_store.as_ref()?.get(identity),
            ResumptionPolicy::Tickets => self.options.ticket_key.as_ref()?.open(identity),
        }?;

        let suite = session.cipher_suite();
        let name_matches = match (session.server_name(), self.servername.as_deref()) {
            (Some(stored), Some(requested)) => stored.eq_ignore_ascii_case(requested),
            _ => true,
        };
        if session.version() != self.version
            || !offered.contains(&suite)
            || !self.options.cipher_suites.contains(&suite)
            || !name_matches
        {
            debug!("Offered session does not fit this handshake, falling back to full handshake");
            return None;
        }
        if self.options.client_verify == ClientVerify::Required
            && (session.peer_certificate_chain().is_none()
                || (self.options.reject_unauthorized && !session.peer_authorized()))
        {
            debug!("Offered session has no verified client certificate, falling back to full handshake");
            return None;
        }
        Some(session)
    }

    fn handle_client_hello(&mut self, hello: ClientHello, raw: &[u8]) -> Result<Vec<Action>, TlsError> {
        self.servername = hello.server_name.clone();
        self.version = self.select_version(&hello)?;
        let offered: Vec<CipherSuite> = hello
            .cipher_suites
            .iter()
            .filter_map(|code| CipherSuite::from_code(*code))
            .collect();
        self.suite = self.select_cipher(&offered)?;
        self.alpn = self.select_alpn(&hello)?;

        if let Some(psk) = &hello.psk {
            if let Some(session) = self.lookup_session(&psk.identity, &offered) {
                let schedule = KeySchedule::new(self.version, session.cipher_suite(), Some(session.secret()))?;
                let truncated = hello.encode_for_binder()?;
                schedule.check_binder(&schedule.hash().digest(&truncated)?, &psk.binder)?;
                self.suite = session.cipher_suite();
                self.schedule = Some(schedule);
                self.peer_chain = session.peer_certificate_chain().cloned();
                self.authorization_error = session.authorization_error().cloned();
                self.session = Some(session);
                self.resumed = true;
            }
        }
        self.transcript.add(raw);

        let identity = if self.resumed { None } else { Some(self.identity()?) };

        let mut share = None;
        let mut shared = None;
        if !self.resumed {
            let (group, public) = hello
                .key_shares
                .iter()
                .find_map(|(code, public)| {
                    NamedGroup::from_code(*code)
                        .filter(|g| self.options.groups.contains(g))
                        .map(|g| (g, public))
                })
                .ok_or_else(|| TlsError::Negotiation("no common key exchange group".into()))?;
            let ours = KeyShare::generate(group)?;
            shared = Some(ours.agree(public)?);
            share = Some((group.code(), ours.public_bytes().to_vec()));
            self.schedule = Some(KeySchedule::new(self.version, self.suite, None)?);
        }

        let server_hello = HandshakeMessage::ServerHello(ServerHello {
            random: random_array()?,
            version: self.version.wire(),
            cipher_suite: self.suite.code(),
            key_share: share,
            resumed: self.resumed,
            session_ticket: !self.resumed && self.issues_sessions(),
            alpn: self.alpn.clone(),
        })
        .encode()?;
        self.transcript.add(&server_hello);

        let hash = self.suite.hash();
        let hello_hash = self.transcript.hash(hash)?;
        let (client_keys, server_keys) = self
            .schedule
            .as_mut()
            .ok_or_else(|| TlsError::unexpected("key schedule not started"))?
            .handshake_keys(shared.as_deref().map(|s| &s[..]), &hello_hash)?;

        debug!(
            version = %self.version,
            cipher = self.suite.name(),
            resumed = self.resumed,
            servername = ?self.servername,
            "Accepted ClientHello"
        );

        let mut actions = vec![
            Action::Send(server_hello),
            Action::InstallWriteKeys(server_keys),
            Action::InstallReadKeys(client_keys),
        ];

        let mut certificate_requested = false;
        if let Some(identity) = &identity {
            if self.options.client_verify != ClientVerify::None {
                let schemes = [
                    SignatureScheme::EcdsaP256Sha256,
                    SignatureScheme::RsaPssSha256,
                    SignatureScheme::Ed25519,
                ];
                let request = HandshakeMessage::CertificateRequest(schemes.iter().map(|s| s.code()).collect())
                    .encode()?;
                self.transcript.add(&request);
                actions.push(Action::Send(request));
                certificate_requested = true;
            }

            actions.extend(certificate_flight(identity, Role::Server, hash, &mut self.transcript)?);
        }

        let schedule = self.schedule()?;
        let finished = HandshakeMessage::Finished(schedule.server_finished(&self.transcript.hash(hash)?)?).encode()?;
        self.transcript.add(&finished);
        let (client_app, server_app) = self.schedule()?.application_keys(&self.transcript.hash(hash)?)?;
        actions.push(Action::Send(finished));
        actions.push(Action::InstallWriteKeys(server_app));
        self.pending_read_keys = Some(client_app);

        self.state = if certificate_requested {
            HandshakeState::CertificateExchange
        } else {
            HandshakeState::Finished
        };
        Ok(actions)
    }

    /// Create the resumable session once the client has finished
    ///
    /// The session records the client's certificate and verdict. Returns the
    /// encoded NewSessionTicket to send, if this server issues sessions.
    fn issue_session(&mut self) -> Result<Option<Bytes>, TlsError> {
        if !self.issues_sessions() {
            return Ok(None);
        }

        let nonce: [u8; 16] = random_array()?;
        let secret = self.schedule()?.session_secret(&nonce)?;
        let lifetime = self.options.session_timeout;
        let id: [u8; 32] = random_array()?;
        let mut session = Session::new(Bytes::copy_from_slice(&id), self.version, self.suite, secret, lifetime)
            .with_alpn(self.alpn.clone())
            .with_server_name(self.servername.clone())
            .with_peer(self.peer_chain.clone(), self.authorized(), self.authorization_error.clone());

        match self.options.resumption {
            ResumptionPolicy::Tickets => {
                if let Some(key) = &self.options.ticket_key {
                    let ticket = key.seal(&session)?;
                    session = session.with_id(ticket);
                }
            }
            ResumptionPolicy::SessionIds => {
                if let Some(store) = &self.options.session_store {
                    store.put(session.id(), session.clone());
                }
            }
            ResumptionPolicy::Disabled => {}
        }

        let message = HandshakeMessage::NewSessionTicket(NewSessionTicket {
            lifetime: lifetime.as_secs().min(u32::MAX as u64) as u32,
            nonce: nonce.to_vec(),
            identity: session.id().clone(),
        })
        .encode()?;
        debug!(policy = ?self.options.resumption, authorized = session.peer_authorized(), "Issued session");
        self.options.emit(&TlsEvent::SessionNegotiated(session.clone()));
        self.session = Some(session);
        Ok(Some(message))
    }

    fn handle_client_certificate(&mut self, ders: &[Bytes]) -> Result<(), TlsError> {
        let chain = CertificateChain::from_der_list(ders)?;
        if chain.is_empty() {
            if self.options.client_verify == ClientVerify::Required {
                return Err(VerificationError::NoPeerCertificate.into());
            }
            debug!("Client sent no certificate");
            self.authorization_error = Some(VerificationError::NoPeerCertificate);
            self.state = HandshakeState::Finished;
            return Ok(());
        }

        self.authorization_error =
            authorize_peer(&self.options, &chain, None, self.options.reject_unauthorized)?;
        self.peer_chain = Some(chain);
        self.state = HandshakeState::Verifying;
        Ok(())
    }

    fn handle_finished(&mut self, verify_data: &[u8], raw: &[u8]) -> Result<Vec<Action>, TlsError> {
        let hash = self.suite.hash();
        let expected = self.schedule()?.client_finished(&self.transcript.hash(hash)?)?;
        if !ct_eq(&expected, verify_data) {
            return Err(TlsError::ProtocolViolation("decrypt error: Finished mismatch".into()));
        }
        self.transcript.add(raw);

        let read_keys = self
            .pending_read_keys
            .take()
            .ok_or_else(|| TlsError::unexpected("Finished before application keys"))?;
        let mut actions = vec![Action::InstallReadKeys(read_keys)];

        if !self.resumed && self.issues_sessions() {
            let transcript_hash = self.transcript.hash(hash)?;
            self.schedule
                .as_mut()
                .ok_or_else(|| TlsError::unexpected("key schedule not started"))?
                .derive_resumption_master(&transcript_hash)?;
            if let Some(ticket) = self.issue_session()? {
                actions.push(Action::Send(ticket));
            }
        }

        self.negotiated = Some(Negotiated {
            version: self.version,
            cipher_suite: self.suite,
            alpn_protocol: self.alpn.clone(),
            servername: self.servername.clone(),
            resumed: self.resumed,
            peer_chain: self.peer_chain.clone(),
            authorized: self.authorized(),
            authorization_error: self.authorization_error.clone(),
            session: self.session.clone(),
        });
        self.state = HandshakeState::Established;
        Ok(actions)
    }
}
