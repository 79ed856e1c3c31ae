//! TLS connection
//!
//! [`TlsStream`] wraps a [`Transport`] and carries a connection from the first
//! ClientHello to close_notify. All I/O is blocking: `handshake`, `read` and
//! `write` drive the handshake state machine to completion before touching
//! application data, so plaintext is never exposed early.

use crate::alert::{Alert, AlertDescription, AlertLevel};
use crate::cert::CertificateChain;
use crate::config::{TlsConfig, TlsVersion};
use crate::crypto::CipherSuite;
use crate::error::{ErrorKind, TlsError};
use crate::events::TlsEvent;
use crate::handshake::{Action, Handshake, HandshakeJoiner, HandshakeMessage, HandshakeState, Negotiated, Role};
use crate::info::ConnectionInfo;
use crate::record::{ContentType, Record, RecordLayer, MAX_CIPHERTEXT_LEN, RECORD_HEADER_LEN};
use crate::session::Session;
use crate::transport::Transport;
use crate::verify::VerificationError;
use bytes::{Buf, BytesMut};
use std::collections::VecDeque;
use std::io;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const READ_CHUNK: usize = RECORD_HEADER_LEN + MAX_CIPHERTEXT_LEN;

/// Sliding-window count of renegotiations
#[derive(Debug)]
struct RenegotiationLimiter {
    limit: usize,
    window: Duration,
    history: VecDeque<Instant>,
}

impl RenegotiationLimiter {
    fn new(limit: usize, window: Duration) -> Self {
        RenegotiationLimiter { limit, window, history: VecDeque::new() }
    }

    /// Record one renegotiation at `now`, failing if it exceeds the limit
    fn check_at(&mut self, now: Instant) -> Result<(), TlsError> {
        while let Some(oldest) = self.history.front() {
            if now.duration_since(*oldest) >= self.window {
                self.history.pop_front();
            } else {
                break;
            }
        }
        if self.history.len() >= self.limit {
            return Err(TlsError::RenegotiationLimit { limit: self.limit, window: self.window });
        }
        self.history.push_back(now);
        Ok(())
    }
}

/// A TLS connection over a transport
pub struct TlsStream<T: Transport> {
    transport: T,
    config: TlsConfig,
    role: Role,
    record: RecordLayer,
    joiner: HandshakeJoiner,
    /// Handshake in progress, initial or renegotiation
    handshake: Option<Handshake>,
    negotiated: Option<Negotiated>,
    /// Application data received but not yet read
    plaintext: BytesMut,
    scratch: Vec<u8>,
    renegotiations: RenegotiationLimiter,
    /// Server: HelloRequest sent, the next ClientHello is ours
    hello_requested: bool,
    deadline: Option<Instant>,
    received_close_notify: bool,
    closed: bool,
    failure: Option<String>,
    last_alert: Option<AlertDescription>,
}

impl<T: Transport> TlsStream<T> {
    /// Client side connection; the handshake starts on first use
    pub fn client(transport: T, config: TlsConfig) -> Result<Self, TlsError> {
        if config.is_server() {
            return Err(TlsError::InvalidConfig(
                "Cannot use server config for client connection".to_string(),
            ));
        }
        Self::new(transport, config, Role::Client)
    }

    /// Server side connection; the handshake starts on first use
    pub fn server(transport: T, config: TlsConfig) -> Result<Self, TlsError> {
        if !config.is_server() {
            return Err(TlsError::InvalidConfig(
                "Cannot use client config for server accept".to_string(),
            ));
        }
        Self::new(transport, config, Role::Server)
    }

    fn new(transport: T, config: TlsConfig, role: Role) -> Result<Self, TlsError> {
        let mut record = RecordLayer::new();
        record.set_max_fragment_len(config.options().max_fragment_len())?;
        let (limit, window) = config.options().renegotiation_limit();
        Ok(TlsStream {
            transport,
            config,
            role,
            record,
            joiner: HandshakeJoiner::new(),
            handshake: None,
            negotiated: None,
            plaintext: BytesMut::new(),
            scratch: vec![0u8; READ_CHUNK],
            renegotiations: RenegotiationLimiter::new(limit, window),
            hello_requested: false,
            deadline: None,
            received_close_notify: false,
            closed: false,
            failure: None,
            last_alert: None,
        })
    }

    /// Run the handshake to completion
    ///
    /// Returns immediately if the connection is already established.
    pub fn handshake(&mut self) -> Result<(), TlsError> {
        self.guard(|s| s.ensure_established())
    }

    /// Read decrypted application data
    ///
    /// Returns `Ok(0)` once the peer has sent close_notify. A transport EOF
    /// without close_notify is [`TlsError::Truncated`].
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, TlsError> {
        self.guard(|s| {
            s.ensure_established()?;
            loop {
                if !s.plaintext.is_empty() {
                    let n = buf.len().min(s.plaintext.len());
                    buf[..n].copy_from_slice(&s.plaintext[..n]);
                    s.plaintext.advance(n);
                    return Ok(n);
                }
                if s.received_close_notify || buf.is_empty() {
                    return Ok(0);
                }
                s.process_next_record()?;
            }
        })
    }

    /// Encrypt and send `data`, fragmenting as needed
    ///
    /// An empty `data` still sends one (empty) record.
    pub fn write(&mut self, data: &[u8]) -> Result<usize, TlsError> {
        self.guard(|s| {
            s.ensure_established()?;
            let records = s.record.frame(ContentType::ApplicationData, data)?;
            s.transport.write_all(&records)?;
            s.transport.flush()?;
            Ok(data.len())
        })
    }

    /// Send close_notify and close the transport
    ///
    /// Closing twice, or after a failure, is a no-op.
    pub fn close(&mut self) -> Result<(), TlsError> {
        if self.closed || self.failure.is_some() {
            return Ok(());
        }
        self.closed = true;
        self.handshake = None;
        let _ = self.send_alert(Alert::close_notify());
        debug!(role = ?self.role, "Sent close_notify");
        self.transport.close()?;
        Ok(())
    }

    /// Run a new handshake over the established connection
    ///
    /// A client sends a fresh ClientHello; a server sends HelloRequest and
    /// services the client's handshake, buffering application data that
    /// arrives in between.
    pub fn renegotiate(&mut self) -> Result<(), TlsError> {
        self.guard(|s| {
            s.ensure_established()?;
            debug!(role = ?s.role, "Starting renegotiation");
            match s.role {
                Role::Client => s.begin_handshake()?,
                Role::Server => {
                    s.hello_requested = true;
                    s.deadline = Some(Instant::now() + s.config.options().handshake_timeout());
                    let request = HandshakeMessage::HelloRequest.encode()?;
                    s.send_records(ContentType::Handshake, &request)?;
                    while s.handshake.is_none() {
                        s.process_next_record()?;
                    }
                }
            }
            s.drive_handshake()
        })
    }

    pub fn peer_certificate_chain(&self) -> Option<&CertificateChain> {
        self.negotiated.as_ref()?.peer_chain.as_ref()
    }

    pub fn negotiated_cipher(&self) -> Option<CipherSuite> {
        self.negotiated.as_ref().map(|n| n.cipher_suite)
    }

    pub fn negotiated_protocol_version(&self) -> Option<TlsVersion> {
        self.negotiated.as_ref().map(|n| n.version)
    }

    pub fn alpn_protocol(&self) -> Option<&str> {
        self.negotiated.as_ref()?.alpn_protocol.as_deref()
    }

    /// Server name: the one requested (client) or received via SNI (server)
    pub fn servername(&self) -> Option<&str> {
        match self.role {
            Role::Client => self.config.options().servername(),
            Role::Server => self.negotiated.as_ref()?.servername.as_deref(),
        }
    }

    /// Whether the peer certificate passed verification
    pub fn authorized(&self) -> bool {
        self.negotiated.as_ref().map(|n| n.authorized).unwrap_or(false)
    }

    /// Why the peer is not authorized, when verification failures are tolerated
    pub fn authorization_error(&self) -> Option<&VerificationError> {
        self.negotiated.as_ref()?.authorization_error.as_ref()
    }

    pub fn is_session_reused(&self) -> bool {
        self.negotiated.as_ref().map(|n| n.resumed).unwrap_or(false)
    }

    /// Resumable session issued (or resumed) by the last handshake
    pub fn session(&self) -> Option<&Session> {
        self.negotiated.as_ref()?.session.as_ref()
    }

    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo::new(
            self.negotiated.as_ref(),
            self.failure.is_some(),
            self.last_alert.map(|a| a.as_str().to_string()),
        )
    }

    /// Limit the plaintext carried by each outgoing record
    pub fn set_max_send_fragment(&mut self, len: usize) -> Result<(), TlsError> {
        self.record.set_max_fragment_len(len)
    }

    pub fn state(&self) -> HandshakeState {
        if self.failure.is_some() {
            HandshakeState::Failed
        } else if let Some(handshake) = &self.handshake {
            handshake.state()
        } else if self.negotiated.is_some() {
            HandshakeState::Established
        } else {
            HandshakeState::Init
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Why the connection failed, if it did
    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    pub fn config(&self) -> &TlsConfig {
        &self.config
    }

    /// Get reference to underlying transport
    pub fn get_ref(&self) -> &T {
        &self.transport
    }

    /// Get mutable reference to underlying transport
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Run `op`, tearing the connection down on a fatal error
    fn guard<R>(&mut self, op: impl FnOnce(&mut Self) -> Result<R, TlsError>) -> Result<R, TlsError> {
        if let Some(reason) = &self.failure {
            return Err(TlsError::Failed(reason.clone()));
        }
        if self.closed {
            return Err(TlsError::Closed);
        }
        match op(self) {
            Ok(value) => Ok(value),
            Err(e) if !e.is_fatal() || e.kind() == ErrorKind::Closed => Err(e),
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Best-effort alert, transport close and notification
    fn fail(&mut self, err: TlsError) -> TlsError {
        if let Some(description) = err.alert() {
            if self.send_alert(Alert::fatal(description)).is_ok() {
                self.last_alert = Some(description);
            }
        }
        let _ = self.transport.close();
        self.handshake = None;
        self.deadline = None;
        self.failure = Some(err.to_string());

        debug!(role = ?self.role, error = %err, "Connection failed");
        let event = if self.negotiated.is_none() {
            TlsEvent::handshake_failed(&err)
        } else {
            TlsEvent::protocol_error(&err)
        };
        self.config.options().emit(&event);
        err
    }

    fn ensure_established(&mut self) -> Result<(), TlsError> {
        if self.negotiated.is_none() && self.handshake.is_none() {
            self.begin_handshake()?;
        }
        self.drive_handshake()
    }

    fn begin_handshake(&mut self) -> Result<(), TlsError> {
        let mut handshake = Handshake::new(self.role, self.config.options.clone());
        self.deadline = Some(Instant::now() + self.config.options().handshake_timeout());
        let actions = handshake.start()?;
        self.handshake = Some(handshake);
        self.apply(actions)
    }

    fn drive_handshake(&mut self) -> Result<(), TlsError> {
        while self.handshake.is_some() {
            self.process_next_record()?;
        }
        Ok(())
    }

    fn apply(&mut self, actions: Vec<Action>) -> Result<(), TlsError> {
        for action in actions {
            match action {
                Action::Send(message) => {
                    let records = self.record.frame(ContentType::Handshake, &message)?;
                    self.transport.write_all(&records)?;
                }
                Action::InstallReadKeys(keys) => {
                    if !self.joiner.is_empty() {
                        return Err(TlsError::ProtocolViolation(
                            "unexpected message: handshake data spans a key change".into(),
                        ));
                    }
                    debug!(role = ?self.role, cipher = keys.suite().name(), "Installed read keys");
                    self.record.install_read_keys(keys);
                }
                Action::InstallWriteKeys(keys) => {
                    debug!(role = ?self.role, cipher = keys.suite().name(), "Installed write keys");
                    self.record.install_write_keys(keys);
                }
            }
        }
        self.transport.flush()?;
        Ok(())
    }

    fn send_records(&mut self, content_type: ContentType, data: &[u8]) -> Result<(), TlsError> {
        let records = self.record.frame(content_type, data)?;
        self.transport.write_all(&records)?;
        self.transport.flush()?;
        Ok(())
    }

    fn send_alert(&mut self, alert: Alert) -> Result<(), TlsError> {
        self.send_records(ContentType::Alert, &alert.encode())
    }

    /// Read more bytes from the transport; false at EOF
    fn fill(&mut self) -> Result<bool, TlsError> {
        if let Some(deadline) = self.deadline {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() || !self.transport.poll_read(Some(remaining))? {
                return Err(TlsError::Timeout(self.config.options().handshake_timeout()));
            }
        }
        let n = self.transport.read(&mut self.scratch)?;
        if n == 0 {
            return Ok(false);
        }
        self.record.push(&self.scratch[..n]);
        Ok(true)
    }

    fn process_next_record(&mut self) -> Result<(), TlsError> {
        loop {
            if let Some(record) = self.record.unframe()? {
                return self.dispatch(record);
            }
            if !self.fill()? {
                return Err(TlsError::Truncated);
            }
        }
    }

    fn dispatch(&mut self, record: Record) -> Result<(), TlsError> {
        match record.content_type {
            ContentType::Alert => {
                let alert = Alert::decode(&record.payload).ok_or_else(|| TlsError::decode("alert"))?;
                self.last_alert = Some(alert.description);
                if alert.description == AlertDescription::CloseNotify {
                    debug!(role = ?self.role, "Received close_notify");
                    if self.handshake.is_some() || self.negotiated.is_none() {
                        return Err(TlsError::AlertReceived(alert.description));
                    }
                    self.received_close_notify = true;
                    Ok(())
                } else if alert.level == AlertLevel::Warning
                    && alert.description == AlertDescription::UserCanceled
                {
                    debug!(role = ?self.role, "Peer sent user_canceled");
                    Ok(())
                } else {
                    Err(TlsError::AlertReceived(alert.description))
                }
            }
            ContentType::Handshake => {
                self.joiner.push(&record.payload);
                while let Some((message, raw)) = self.joiner.next_message()? {
                    self.handle_handshake_message(message, &raw)?;
                }
                Ok(())
            }
            ContentType::ApplicationData => {
                if self.negotiated.is_none() {
                    return Err(TlsError::ProtocolViolation(
                        "application data before handshake completion".into(),
                    ));
                }
                // Data interleaved with a renegotiation is kept for the next read.
                self.plaintext.extend_from_slice(&record.payload);
                Ok(())
            }
            ContentType::ChangeCipherSpec => Err(TlsError::unexpected("ChangeCipherSpec")),
        }
    }

    /// Check a peer-initiated renegotiation against the limiter
    fn count_renegotiation(&mut self) -> Result<(), TlsError> {
        if let Err(e) = self.renegotiations.check_at(Instant::now()) {
            warn!(role = ?self.role, "Peer exceeded renegotiation limit: {}", e);
            return Err(e);
        }
        Ok(())
    }

    fn handle_handshake_message(&mut self, message: HandshakeMessage, raw: &[u8]) -> Result<(), TlsError> {
        if self.handshake.is_none() {
            match (self.role, &message) {
                (Role::Client, HandshakeMessage::HelloRequest) => {
                    self.count_renegotiation()?;
                    debug!("Server requested renegotiation");
                    return self.begin_handshake();
                }
                (Role::Server, HandshakeMessage::ClientHello(_)) => {
                    if self.hello_requested {
                        self.hello_requested = false;
                    } else {
                        self.count_renegotiation()?;
                    }
                    debug!("Client started renegotiation");
                    self.handshake = Some(Handshake::new(Role::Server, self.config.options.clone()));
                    self.deadline = Some(Instant::now() + self.config.options().handshake_timeout());
                }
                _ => {
                    return Err(TlsError::unexpected(format!(
                        "{:?} outside a handshake",
                        message.typ()
                    )))
                }
            }
        } else if self.role == Role::Client && matches!(message, HandshakeMessage::HelloRequest) {
            debug!("Ignoring HelloRequest during handshake");
            return Ok(());
        }

        let actions = match self.handshake.as_mut() {
            Some(handshake) => handshake.handle(message, raw)?,
            None => return Err(TlsError::unexpected("no handshake in progress")),
        };
        self.apply(actions)?;

        if let Some(handshake) = self.handshake.as_mut() {
            if let Some(negotiated) = handshake.take_negotiated() {
                self.handshake = None;
                self.complete_handshake(negotiated);
            }
        }
        Ok(())
    }

    fn complete_handshake(&mut self, negotiated: Negotiated) {
        self.deadline = None;
        info!(
            role = ?self.role,
            version = %negotiated.version,
            cipher = negotiated.cipher_suite.name(),
            resumed = negotiated.resumed,
            alpn = ?negotiated.alpn_protocol,
            "TLS handshake established"
        );
        self.config.options().emit(&TlsEvent::HandshakeEstablished {
            version: negotiated.version,
            cipher: negotiated.cipher_suite,
            resumed: negotiated.resumed,
            alpn_protocol: negotiated.alpn_protocol.clone(),
            servername: negotiated.servername.clone(),
        });
        self.negotiated = Some(negotiated);
    }
}

impl<T: Transport> io::Read for TlsStream<T> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        TlsStream::read(self, buf).map_err(io::Error::from)
    }
}

impl<T: Transport> io::Write for TlsStream<T> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        TlsStream::write(self, buf).map_err(io::Error::from)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.transport.flush()
    }
}
