//! Client side of the handshake

use super::key_schedule::KeySchedule;
use super::messages::{ClientHello, NewSessionTicket, PskOffer, ServerHello};
use super::{
    authorize_peer, certificate_flight, check_certificate_verify, Action, HandshakeMessage,
    HandshakeState, Negotiated, Role, Transcript,
};
use crate::cert::CertificateChain;
use crate::config::{ConnectionOptions, TlsVersion};
use crate::crypto::{ct_eq, random_array, CipherSuite, KeyShare};
use crate::error::TlsError;
use crate::events::TlsEvent;
use crate::session::Session;
use crate::verify::VerificationError;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub(crate) struct ClientHandshake {
    options: Arc<ConnectionOptions>,
    pub(super) state: HandshakeState,
    pub(super) negotiated: Option<Negotiated>,
    transcript: Transcript,
    key_shares: Vec<KeyShare>,
    offered: Option<Session>,
    schedule: Option<KeySchedule>,
    version: TlsVersion,
    suite: CipherSuite,
    resumed: bool,
    alpn: Option<String>,
    certificate_requested: bool,
    peer_chain: Option<CertificateChain>,
    authorization_error: Option<VerificationError>,
    /// ServerHello announced a NewSessionTicket after our Finished
    ticket_expected: bool,
    sent_finished: bool,
}

impl ClientHandshake {
    pub(crate) fn new(options: Arc<ConnectionOptions>) -> Self {
        ClientHandshake {
            options,
            state: HandshakeState::Init,
            negotiated: None,
            transcript: Transcript::default(),
            key_shares: Vec::new(),
            offered: None,
            schedule: None,
            version: TlsVersion::Tls13,
            suite: CipherSuite::Aes128GcmSha256,
            resumed: false,
            alpn: None,
            certificate_requested: false,
            peer_chain: None,
            authorization_error: None,
            ticket_expected: false,
            sent_finished: false,
        }
    }

    /// A cached session that is still acceptable to offer
    fn resumable_session(&self) -> Option<Session> {
        let options = &self.options;
        let session = options.session.clone().or_else(|| {
            let store = options.session_store.as_ref()?;
            store.get(options.servername.as_deref()?.as_bytes())
        })?;

        if session.is_expired() {
            debug!("Not offering expired session");
            return None;
        }
        if !options.versions().contains(&session.version())
            || !options.cipher_suites.contains(&session.cipher_suite())
        {
            debug!(
                version = %session.version(),
                cipher = session.cipher_suite().name(),
                "Not offering session with parameters no longer enabled"
            );
            return None;
        }
        Some(session)
    }

    pub(crate) fn start(&mut self) -> Result<Vec<Action>, TlsError> {
        if self.state != HandshakeState::Init {
            return Err(TlsError::unexpected("handshake already started"));
        }

        self.key_shares = self
            .options
            .groups
            .iter()
            .map(|group| KeyShare::generate(*group))
            .collect::<Result<_, _>>()?;

        let mut hello = ClientHello {
            random: random_array()?,
            versions: self.options.versions().iter().map(|v| v.wire()).collect(),
            cipher_suites: self.options.cipher_suites.iter().map(|s| s.code()).collect(),
            key_shares: self
                .key_shares
                .iter()
                .map(|share| (share.group().code(), share.public_bytes().to_vec()))
                .collect(),
            server_name: self.options.servername.clone(),
            alpn: self.options.alpn.clone(),
            psk: None,
        };

        if let Some(session) = self.resumable_session() {
            hello.psk = Some(PskOffer { identity: session.id().clone(), binder: Vec::new() });
            let schedule = KeySchedule::new(
                session.version(),
                session.cipher_suite(),
                Some(session.secret()),
            )?;
            let truncated = hello.encode_for_binder()?;
            let binder = schedule.binder(&schedule.hash().digest(&truncated)?)?;
            if let Some(psk) = hello.psk.as_mut() {
                psk.binder = binder;
            }
            debug!(cipher = session.cipher_suite().name(), "Offering session for resumption");
            self.offered = Some(session);
        }

        let encoded = HandshakeMessage::ClientHello(hello).encode()?;
        self.transcript.add(&encoded);
        self.state = HandshakeState::SentHello;
        Ok(vec![Action::Send(encoded)])
    }

    pub(crate) fn handle(&mut self, msg: HandshakeMessage, raw: &[u8]) -> Result<Vec<Action>, TlsError> {
        match (self.state, msg) {
            (HandshakeState::SentHello, HandshakeMessage::ServerHello(hello)) => {
                self.handle_server_hello(hello, raw)
            }
            (HandshakeState::KeyExchange, HandshakeMessage::CertificateRequest(_)) => {
                self.certificate_requested = true;
                self.transcript.add(raw);
                Ok(Vec::new())
            }
            (HandshakeState::KeyExchange, HandshakeMessage::Certificate(ders)) => {
                let chain = CertificateChain::from_der_list(&ders)?;
                if chain.is_empty() {
                    return Err(VerificationError::NoPeerCertificate.into());
                }
                self.authorization_error = authorize_peer(
                    &self.options,
                    &chain,
                    self.options.servername.as_deref(),
                    self.options.reject_unauthorized,
                )?;
                self.peer_chain = Some(chain);
                self.transcript.add(raw);
                self.state = HandshakeState::Verifying;
                Ok(Vec::new())
            }
            (HandshakeState::Verifying, HandshakeMessage::CertificateVerify { scheme, signature }) => {
                let chain = self
                    .peer_chain
                    .as_ref()
                    .ok_or_else(|| TlsError::unexpected("CertificateVerify without a certificate"))?;
                let hash = self.transcript.hash(self.suite.hash())?;
                check_certificate_verify(chain, Role::Server, scheme, &signature, &hash)?;
                self.transcript.add(raw);
                self.state = HandshakeState::Finished;
                Ok(Vec::new())
            }
            (HandshakeState::Finished, HandshakeMessage::Finished(verify_data)) if !self.sent_finished => {
                self.handle_finished(&verify_data, raw)
            }
            (HandshakeState::Finished, HandshakeMessage::NewSessionTicket(ticket)) if self.sent_finished => {
                self.handle_ticket(ticket)
            }
            (state, msg) => Err(TlsError::unexpected(format!("{:?} in state {:?}", msg.typ(), state))),
        }
    }

    fn schedule(&self) -> Result<&KeySchedule, TlsError> {
        self.schedule
            .as_ref()
            .ok_or_else(|| TlsError::unexpected("key schedule not started"))
    }

    fn authorized(&self) -> bool {
        match &self.offered {
            Some(session) if self.resumed => session.peer_authorized(),
            _ => self.peer_chain.is_some() && self.authorization_error.is_none(),
        }
    }

    fn handle_server_hello(&mut self, hello: ServerHello, raw: &[u8]) -> Result<Vec<Action>, TlsError> {
        let version = TlsVersion::from_wire(hello.version)
            .filter(|v| self.options.versions().contains(v))
            .ok_or_else(|| {
                TlsError::ProtocolViolation(format!(
                    "illegal parameter: server selected version {:#06x}",
                    hello.version
                ))
            })?;
        let suite = CipherSuite::from_code(hello.cipher_suite)
            .filter(|s| self.options.cipher_suites.contains(s))
            .ok_or_else(|| {
                TlsError::ProtocolViolation(format!(
                    "illegal parameter: server selected cipher {:#06x}",
                    hello.cipher_suite
                ))
            })?;
        if let Some(protocol) = &hello.alpn {
            if !self.options.alpn.contains(protocol) {
                return Err(TlsError::ProtocolViolation(format!(
                    "illegal parameter: server selected protocol {} which was not offered",
                    protocol
                )));
            }
        }

        if hello.resumed && hello.session_ticket {
            return Err(TlsError::ProtocolViolation(
                "illegal parameter: session ticket announced on a resumed handshake".into(),
            ));
        }

        self.version = version;
        self.suite = suite;
        self.alpn = hello.alpn.clone();
        self.ticket_expected = hello.session_ticket;
        self.transcript.add(raw);

        let (mut schedule, shared) = if hello.resumed {
            let session = self.offered.as_ref().ok_or_else(|| {
                TlsError::ProtocolViolation("illegal parameter: resumed a session that was not offered".into())
            })?;
            if session.version() != version || session.cipher_suite() != suite {
                return Err(TlsError::ProtocolViolation(
                    "illegal parameter: resumed session parameters changed".into(),
                ));
            }
            self.resumed = true;
            self.peer_chain = session.peer_certificate_chain().cloned();
            self.authorization_error = session.authorization_error().cloned();
            (KeySchedule::new(version, suite, Some(session.secret()))?, None)
        } else {
            let (group, public) = hello
                .key_share
                .as_ref()
                .ok_or_else(|| TlsError::decode("ServerHello key share"))?;
            let share = self
                .key_shares
                .iter()
                .find(|share| share.group().code() == *group)
                .ok_or_else(|| {
                    TlsError::ProtocolViolation(format!(
                        "illegal parameter: server chose group {:#06x} without a share",
                        group
                    ))
                })?;
            (KeySchedule::new(version, suite, None)?, Some(share.agree(public)?))
        };
        self.key_shares.clear();

        let hello_hash = self.transcript.hash(suite.hash())?;
        let (client_keys, server_keys) = schedule.handshake_keys(shared.as_deref().map(|s| &s[..]), &hello_hash)?;
        self.schedule = Some(schedule);

        debug!(
            version = %version,
            cipher = suite.name(),
            resumed = self.resumed,
            "Received ServerHello"
        );

        self.state = if self.resumed {
            HandshakeState::Finished
        } else {
            HandshakeState::KeyExchange
        };
        Ok(vec![
            Action::InstallReadKeys(server_keys),
            Action::InstallWriteKeys(client_keys),
        ])
    }

    fn handle_ticket(&mut self, ticket: NewSessionTicket) -> Result<Vec<Action>, TlsError> {
        let secret = self.schedule()?.session_secret(&ticket.nonce)?;
        let session = Session::new(
            ticket.identity,
            self.version,
            self.suite,
            secret,
            Duration::from_secs(ticket.lifetime as u64),
        )
        .with_alpn(self.alpn.clone())
        .with_server_name(self.options.servername.clone())
        .with_peer(self.peer_chain.clone(), self.authorized(), self.authorization_error.clone());
        debug!(lifetime = ticket.lifetime, "Received session ticket");

        if let (Some(store), Some(name)) = (&self.options.session_store, &self.options.servername) {
            store.put(name.as_bytes(), session.clone());
        }
        self.options.emit(&TlsEvent::SessionNegotiated(session.clone()));
        self.establish(Some(session));
        Ok(Vec::new())
    }

    fn handle_finished(&mut self, verify_data: &[u8], raw: &[u8]) -> Result<Vec<Action>, TlsError> {
        let hash = self.suite.hash();
        let expected = self.schedule()?.server_finished(&self.transcript.hash(hash)?)?;
        if !ct_eq(&expected, verify_data) {
            return Err(TlsError::ProtocolViolation("decrypt error: Finished mismatch".into()));
        }
        self.transcript.add(raw);
        let (client_app, server_app) = self.schedule()?.application_keys(&self.transcript.hash(hash)?)?;

        let mut actions = Vec::new();
        if self.certificate_requested {
            match &self.options.identity {
                Some(identity) => {
                    actions.extend(certificate_flight(identity, Role::Client, hash, &mut self.transcript)?);
                }
                None => {
                    debug!("Server requested a certificate but none is configured");
                    let empty = HandshakeMessage::Certificate(Vec::new()).encode()?;
                    self.transcript.add(&empty);
                    actions.push(Action::Send(empty));
                }
            }
        }

        let verify_data = self.schedule()?.client_finished(&self.transcript.hash(hash)?)?;
        let finished = HandshakeMessage::Finished(verify_data).encode()?;
        self.transcript.add(&finished);
        actions.push(Action::Send(finished));
        actions.push(Action::InstallWriteKeys(client_app));
        actions.push(Action::InstallReadKeys(server_app));
        self.sent_finished = true;

        if self.ticket_expected {
            let transcript_hash = self.transcript.hash(hash)?;
            self.schedule
                .as_mut()
                .ok_or_else(|| TlsError::unexpected("key schedule not started"))?
                .derive_resumption_master(&transcript_hash)?;
            debug!("Waiting for session ticket");
        } else {
            let session = if self.resumed { self.offered.clone() } else { None };
            self.establish(session);
        }
        Ok(actions)
    }

    fn establish(&mut self, session: Option<Session>) {
        self.negotiated = Some(Negotiated {
            version: self.version,
            cipher_suite: self.suite,
            alpn_protocol: self.alpn.clone(),
            servername: self.options.servername.clone(),
            resumed: self.resumed,
            peer_chain: self.peer_chain.clone(),
            authorized: self.authorized(),
            authorization_error: self.authorization_error.clone(),
            session,
        });
        self.state = HandshakeState::Established;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TlsConfig;
    use crate::crypto::NamedGroup;
    use crate::handshake::messages::HandshakeType;
    use crate::session::SessionStore;
    use bytes::Bytes;

    fn decode_hello(actions: &[Action]) -> ClientHello {
        let Some(Action::Send(bytes)) = actions.first() else {
            panic!("expected a ClientHello");
        };
        assert_eq!(bytes[0], HandshakeType::ClientHello as u8);
        match HandshakeMessage::decode(HandshakeType::ClientHello, &bytes[4..]).unwrap() {
            HandshakeMessage::ClientHello(hello) => hello,
            other => panic!("unexpected {:?}", other),
        }
    }

    fn session(version: TlsVersion, suite: CipherSuite, lifetime: Duration) -> Session {
        Session::new(
            Bytes::from_static(b"session-id"),
            version,
            suite,
            zeroize::Zeroizing::new(vec![7u8; suite.hash().output_len()]),
            lifetime,
        )
    }

    #[test]
    fn test_client_hello_contents() {
        let config = TlsConfig::client()
            .servername("example.com")
            .alpn(&["h2"])
            .unwrap()
            .groups(&[NamedGroup::X25519])
            .build()
            .unwrap();
        let mut client = ClientHandshake::new(config.options.clone());
        let hello = decode_hello(&client.start().unwrap());

        assert_eq!(client.state, HandshakeState::SentHello);
        assert_eq!(hello.versions, vec![0x0304, 0x0303]);
        assert_eq!(hello.cipher_suites.len(), CipherSuite::ALL.len());
        assert_eq!(hello.key_shares.len(), 1);
        assert_eq!(hello.key_shares[0].0, NamedGroup::X25519.code());
        assert_eq!(hello.server_name.as_deref(), Some("example.com"));
        assert_eq!(hello.alpn, vec!["h2".to_string()]);
        assert!(hello.psk.is_none());
        assert!(client.start().is_err());
    }

    #[test]
    fn test_offers_stored_session() {
        let store = Arc::new(SessionStore::new(4));
        store.put(
            b"example.com",
            session(TlsVersion::Tls13, CipherSuite::Aes128GcmSha256, Duration::from_secs(60)),
        );
        let config = TlsConfig::client()
            .servername("example.com")
            .session_store(store)
            .build()
            .unwrap();
        let mut client = ClientHandshake::new(config.options.clone());
        let hello = decode_hello(&client.start().unwrap());
        let psk = hello.psk.clone().unwrap();
        assert_eq!(&psk.identity[..], b"session-id");
        assert_eq!(psk.binder.len(), 32);

        let schedule = KeySchedule::new(TlsVersion::Tls13, CipherSuite::Aes128GcmSha256, Some(&[7u8; 32][..])).unwrap();
        let truncated = hello.encode_for_binder().unwrap();
        let hash = schedule.hash().digest(&truncated).unwrap();
        assert!(schedule.check_binder(&hash, &psk.binder).is_ok());
    }

    #[test]
    fn test_skips_unusable_sessions() {
        let expired = session(TlsVersion::Tls13, CipherSuite::Aes128GcmSha256, Duration::ZERO);
        let config = TlsConfig::client().session(expired).build().unwrap();
        let mut client = ClientHandshake::new(config.options.clone());
        assert!(decode_hello(&client.start().unwrap()).psk.is_none());

        let old_version = session(TlsVersion::Tls12, CipherSuite::Aes128GcmSha256, Duration::from_secs(60));
        let config = TlsConfig::client()
            .version(TlsVersion::Tls13)
            .session(old_version)
            .build()
            .unwrap();
        let mut client = ClientHandshake::new(config.options.clone());
        assert!(decode_hello(&client.start().unwrap()).psk.is_none());
    }

    #[test]
    fn test_rejects_unexpected_messages() {
        let config = TlsConfig::client().build().unwrap();
        let mut client = ClientHandshake::new(config.options.clone());
        client.start().unwrap();
        let err = client
            .handle(HandshakeMessage::Finished(vec![0; 32]), &[])
            .unwrap_err();
        assert!(err.to_string().contains("unexpected message"));
    }

    #[test]
    fn test_rejects_unoffered_parameters() {
        let config = TlsConfig::client()
            .version(TlsVersion::Tls13)
            .build()
            .unwrap();
        let mut client = ClientHandshake::new(config.options.clone());
        client.start().unwrap();
        let hello = ServerHello {
            random: [0; 32],
            version: TlsVersion::Tls12.wire(),
            cipher_suite: CipherSuite::Aes128GcmSha256.code(),
            key_share: None,
            resumed: false,
            session_ticket: false,
            alpn: None,
        };
        let err = client.handle(HandshakeMessage::ServerHello(hello), &[]).unwrap_err();
        assert!(err.to_string().contains("illegal parameter"));

        let mut client = ClientHandshake::new(config.options.clone());
        client.start().unwrap();
        let hello = ServerHello {
            random: [0; 32],
            version: TlsVersion::Tls13.wire(),
            cipher_suite: CipherSuite::Aes128GcmSha256.code(),
            key_share: None,
            resumed: true,
            session_ticket: false,
            alpn: None,
        };
        let err = client.handle(HandshakeMessage::ServerHello(hello), &[]).unwrap_err();
        assert!(err.to_string().contains("not offered"));
    }
}
