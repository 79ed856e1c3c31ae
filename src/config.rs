//! TLS configuration
//!
//! This module provides TLS configuration builders for both client and server.
//! A built [`TlsConfig`] is immutable and cheap to clone; every connection
//! created from it sees the same [`ConnectionOptions`]. The only thing that
//! can change afterwards is the set of per-hostname server contexts, through
//! [`SniContexts::add`]. A server may also pick contexts at handshake time
//! with an [`SniCallback`].

use crate::cert::{Certificate, CertifiedKey};
use crate::connection::TlsStream;
use crate::crypto::{CipherSuite, NamedGroup};
use crate::error::TlsError;
use crate::events::{EventHandler, Events, TlsEvent};
use crate::record::{MAX_FRAGMENT_LEN, MIN_FRAGMENT_LEN};
use crate::session::{
    ResumptionPolicy, Session, SessionStore, TicketKey, DEFAULT_SESSION_TIMEOUT,
};
use crate::transport::Transport;
use crate::verify::{CertificateVerifier, ServerIdentityCheck, TrustAnchors, VerificationError};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// Default handshake timeout
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default peer-initiated renegotiations allowed per window
pub const DEFAULT_RENEGOTIATION_LIMIT: usize = 3;

/// Default renegotiation accounting window
pub const DEFAULT_RENEGOTIATION_WINDOW: Duration = Duration::from_secs(600);

/// TLS version
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TlsVersion {
    /// TLS 1.2
    Tls12,
    /// TLS 1.3
    Tls13,
}

impl TlsVersion {
    /// Get version as string
    pub fn as_str(&self) -> &'static str {
        match self {
            TlsVersion::Tls12 => "TLSv1.2",
            TlsVersion::Tls13 => "TLSv1.3",
        }
    }

    /// Protocol version code on the wire
    pub fn wire(&self) -> u16 {
        match self {
            TlsVersion::Tls12 => 0x0303,
            TlsVersion::Tls13 => 0x0304,
        }
    }

    pub fn from_wire(code: u16) -> Option<Self> {
        match code {
            0x0303 => Some(TlsVersion::Tls12),
            0x0304 => Some(TlsVersion::Tls13),
            _ => None,
        }
    }

    /// HKDF label prefix binding the version into every derived key
    pub(crate) fn label_prefix(&self) -> &'static str {
        match self {
            TlsVersion::Tls12 => "tls12 ",
            TlsVersion::Tls13 => "tls13 ",
        }
    }
}

impl FromStr for TlsVersion {
    type Err = TlsError;

    /// Parse TLS version from string (case-insensitive)
    fn from_str(s: &str) -> Result<Self, TlsError> {
        match s.to_uppercase().as_str() {
            "TLSV1.2" | "TLS1.2" => Ok(TlsVersion::Tls12),
            "TLSV1.3" | "TLS1.3" => Ok(TlsVersion::Tls13),
            "SSLV3" | "SSL3" | "TLSV1.0" | "TLS1.0" | "TLSV1" | "TLS1" | "TLSV1.1" | "TLS1.1" => {
                Err(TlsError::InvalidVersion(format!("{} is not supported", s)))
            }
            _ => Err(TlsError::InvalidVersion(s.to_string())),
        }
    }
}

impl fmt::Display for TlsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Client certificate verification mode (server-side)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientVerify {
    /// Don't request client certificates
    None,
    /// Request a client certificate; record failures as unauthorized
    Optional,
    /// Require a client certificate that verifies
    Required,
}

/// Certificate context selected for a server name
#[derive(Debug, Clone)]
pub struct ServerContext {
    identity: CertifiedKey,
}

impl ServerContext {
    pub fn new(identity: CertifiedKey) -> Self {
        ServerContext { identity }
    }

    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<Self, TlsError> {
        Ok(Self::new(CertifiedKey::from_pem(cert_pem, key_pem)?))
    }

    /// Load from a PEM file holding both chain and key
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, TlsError> {
        Ok(Self::new(CertifiedKey::from_file(path)?))
    }

    pub fn identity(&self) -> &CertifiedKey {
        &self.identity
    }
}

/// Hostname to [`ServerContext`] mapping consulted on ClientHello
///
/// Names are exact (`www.example.com`) or single-label wildcards
/// (`*.example.com`); exact names win.
#[derive(Debug, Default)]
pub struct SniContexts {
    inner: RwLock<SniInner>,
}

#[derive(Debug, Default)]
struct SniInner {
    exact: HashMap<String, ServerContext>,
    wildcard: HashMap<String, ServerContext>,
}

impl SniContexts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, hostname: &str, context: ServerContext) -> Result<(), TlsError> {
        let name = hostname.trim_end_matches('.').to_ascii_lowercase();
        if name.is_empty() {
            return Err(TlsError::InvalidConfig("Empty SNI hostname".to_string()));
        }
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        match name.strip_prefix("*.") {
            Some(suffix) if !suffix.is_empty() && !suffix.contains('*') => {
                inner.wildcard.insert(suffix.to_string(), context);
            }
            Some(_) => {
                return Err(TlsError::InvalidConfig(format!("Bad wildcard name: {}", hostname)));
            }
            None if name.contains('*') => {
                return Err(TlsError::InvalidConfig(format!("Bad wildcard name: {}", hostname)));
            }
            None => {
                inner.exact.insert(name, context);
            }
        }
        Ok(())
    }

    pub fn lookup(&self, servername: &str) -> Option<ServerContext> {
        let name = servername.trim_end_matches('.').to_ascii_lowercase();
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        if let Some(ctx) = inner.exact.get(&name) {
            return Some(ctx.clone());
        }
        let (_, parent) = name.split_once('.')?;
        inner.wildcard.get(parent).cloned()
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.exact.len() + inner.wildcard.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Picks the certificate context for a requested server name
///
/// Consulted before the [`SniContexts`] map; `None` falls through to the map
/// and then to the default identity.
pub type SniCallback = Arc<dyn Fn(&str) -> Option<ServerContext> + Send + Sync>;

/// Settings a connection is created with
pub struct ConnectionOptions {
    pub(crate) min_version: TlsVersion,
    pub(crate) max_version: TlsVersion,
    pub(crate) cipher_suites: Vec<CipherSuite>,
    pub(crate) honor_cipher_order: bool,
    pub(crate) groups: Vec<NamedGroup>,
    pub(crate) alpn: Vec<String>,
    pub(crate) servername: Option<String>,
    pub(crate) reject_unauthorized: bool,
    pub(crate) client_verify: ClientVerify,
    pub(crate) verifier: CertificateVerifier,
    pub(crate) identity: Option<CertifiedKey>,
    pub(crate) sni: Arc<SniContexts>,
    pub(crate) sni_callback: Option<SniCallback>,
    pub(crate) handshake_timeout: Duration,
    pub(crate) session_timeout: Duration,
    pub(crate) resumption: ResumptionPolicy,
    pub(crate) session_store: Option<Arc<SessionStore>>,
    pub(crate) session: Option<Session>,
    pub(crate) ticket_key: Option<Arc<TicketKey>>,
    pub(crate) renegotiation_limit: usize,
    pub(crate) renegotiation_window: Duration,
    pub(crate) max_fragment_len: usize,
    pub(crate) check_server_identity: Option<ServerIdentityCheck>,
    pub(crate) events: Events,
}

impl ConnectionOptions {
    fn new(is_server: bool) -> Self {
        ConnectionOptions {
            min_version: TlsVersion::Tls12,
            max_version: TlsVersion::Tls13,
            cipher_suites: CipherSuite::ALL.to_vec(),
            honor_cipher_order: false,
            groups: NamedGroup::ALL.to_vec(),
            alpn: Vec::new(),
            servername: None,
            reject_unauthorized: !is_server,
            client_verify: ClientVerify::None,
            verifier: CertificateVerifier::default(),
            identity: None,
            sni: Arc::new(SniContexts::new()),
            sni_callback: None,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            session_timeout: DEFAULT_SESSION_TIMEOUT,
            resumption: if is_server { ResumptionPolicy::SessionIds } else { ResumptionPolicy::Disabled },
            session_store: None,
            session: None,
            ticket_key: None,
            renegotiation_limit: DEFAULT_RENEGOTIATION_LIMIT,
            renegotiation_window: DEFAULT_RENEGOTIATION_WINDOW,
            max_fragment_len: MAX_FRAGMENT_LEN,
            check_server_identity: None,
            events: Events::default(),
        }
    }

    pub fn min_version(&self) -> TlsVersion {
        self.min_version
    }

    pub fn max_version(&self) -> TlsVersion {
        self.max_version
    }

    pub fn cipher_suites(&self) -> &[CipherSuite] {
        &self.cipher_suites
    }

    pub fn alpn_protocols(&self) -> &[String] {
        &self.alpn
    }

    pub fn servername(&self) -> Option<&str> {
        self.servername.as_deref()
    }

    pub fn reject_unauthorized(&self) -> bool {
        self.reject_unauthorized
    }

    pub fn client_verify(&self) -> ClientVerify {
        self.client_verify
    }

    pub fn trust_anchors(&self) -> &TrustAnchors {
        self.verifier.anchors()
    }

    pub fn handshake_timeout(&self) -> Duration {
        self.handshake_timeout
    }

    pub fn session_timeout(&self) -> Duration {
        self.session_timeout
    }

    pub fn resumption(&self) -> ResumptionPolicy {
        self.resumption
    }

    pub fn max_fragment_len(&self) -> usize {
        self.max_fragment_len
    }

    pub fn renegotiation_limit(&self) -> (usize, Duration) {
        (self.renegotiation_limit, self.renegotiation_window)
    }

    /// Versions this side accepts, newest first
    pub(crate) fn versions(&self) -> Vec<TlsVersion> {
        [TlsVersion::Tls13, TlsVersion::Tls12]
            .into_iter()
            .filter(|v| *v >= self.min_version && *v <= self.max_version)
            .collect()
    }

    pub(crate) fn emit(&self, event: &TlsEvent) {
        self.events.emit(event);
    }

    fn validate(&self) -> Result<(), TlsError> {
        if self.min_version > self.max_version {
            return Err(TlsError::InvalidConfig(format!(
                "Minimum version {} is above maximum {}",
                self.min_version, self.max_version
            )));
        }
        if self.cipher_suites.is_empty() {
            return Err(TlsError::InvalidConfig("Empty cipher suite list".to_string()));
        }
        if self.groups.is_empty() {
            return Err(TlsError::InvalidConfig("Empty key exchange group list".to_string()));
        }
        Ok(())
    }
}

impl fmt::Debug for ConnectionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionOptions")
            .field("min_version", &self.min_version)
            .field("max_version", &self.max_version)
            .field("cipher_suites", &self.cipher_suites)
            .field("honor_cipher_order", &self.honor_cipher_order)
            .field("alpn", &self.alpn)
            .field("servername", &self.servername)
            .field("reject_unauthorized", &self.reject_unauthorized)
            .field("client_verify", &self.client_verify)
            .field("trust_anchors", &self.verifier.anchors().len())
            .field("sni_contexts", &self.sni.len())
            .field("sni_callback", &self.sni_callback.is_some())
            .field("handshake_timeout", &self.handshake_timeout)
            .field("resumption", &self.resumption)
            .field("max_fragment_len", &self.max_fragment_len)
            .field("events", &self.events)
            .finish_non_exhaustive()
    }
}

fn validate_alpn(protocols: &[&str]) -> Result<Vec<String>, TlsError> {
    protocols
        .iter()
        .map(|p| {
            if p.is_empty() || p.len() > 255 {
                Err(TlsError::InvalidConfig(format!("Invalid ALPN protocol name: {:?}", p)))
            } else {
                Ok(p.to_string())
            }
        })
        .collect()
}

fn validate_fragment(len: usize) -> Result<usize, TlsError> {
    if (MIN_FRAGMENT_LEN..=MAX_FRAGMENT_LEN).contains(&len) {
        Ok(len)
    } else {
        Err(TlsError::InvalidConfig(format!(
            "Fragment length {} outside {}..={}",
            len, MIN_FRAGMENT_LEN, MAX_FRAGMENT_LEN
        )))
    }
}

/// TLS configuration (immutable after building)
#[derive(Clone, Debug)]
pub struct TlsConfig {
    pub(crate) options: Arc<ConnectionOptions>,
    pub(crate) is_server: bool,
}

impl TlsConfig {
    /// Create a new client configuration builder
    pub fn client() -> ClientConfigBuilder {
        ClientConfigBuilder::new()
    }

    /// Create a new server configuration builder
    pub fn server() -> ServerConfigBuilder {
        ServerConfigBuilder::new()
    }

    pub fn is_server(&self) -> bool {
        self.is_server
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.options
    }

    /// Per-hostname contexts; shared with every listener using this config
    pub fn sni_contexts(&self) -> &Arc<SniContexts> {
        &self.options.sni
    }

    /// Connect to a server over `transport` and complete the handshake
    pub fn connect<T: Transport>(&self, transport: T) -> Result<TlsStream<T>, TlsError> {
        if self.is_server {
            return Err(TlsError::InvalidConfig(
                "Cannot use server config for client connection".to_string(),
            ));
        }
        let mut stream = TlsStream::client(transport, self.clone())?;
        stream.handshake()?;
        Ok(stream)
    }

    /// Accept a client over `transport` and complete the handshake
    pub fn accept<T: Transport>(&self, transport: T) -> Result<TlsStream<T>, TlsError> {
        if !self.is_server {
            return Err(TlsError::InvalidConfig(
                "Cannot use client config for server accept".to_string(),
            ));
        }
        let mut stream = TlsStream::server(transport, self.clone())?;
        stream.handshake()?;
        Ok(stream)
    }
}

/// Client configuration builder
pub struct ClientConfigBuilder {
    options: ConnectionOptions,
}

impl ClientConfigBuilder {
    fn new() -> Self {
        ClientConfigBuilder { options: ConnectionOptions::new(false) }
    }

    /// Set TLS version (both min and max)
    pub fn version(mut self, version: TlsVersion) -> Self {
        self.options.min_version = version;
        self.options.max_version = version;
        self
    }

    /// Set TLS version range
    pub fn version_range(mut self, min: TlsVersion, max: TlsVersion) -> Self {
        self.options.min_version = min;
        self.options.max_version = max;
        self
    }

    /// Set cipher suites from an OpenSSL-style colon separated list
    pub fn cipher_list(mut self, ciphers: &str) -> Result<Self, TlsError> {
        self.options.cipher_suites = CipherSuite::parse_list(ciphers)?;
        Ok(self)
    }

    /// Set cipher suites in preference order
    pub fn cipher_suites(mut self, suites: &[CipherSuite]) -> Self {
        self.options.cipher_suites = suites.to_vec();
        self
    }

    /// Key exchange groups, in the order key shares are offered
    pub fn groups(mut self, groups: &[NamedGroup]) -> Self {
        self.options.groups = groups.to_vec();
        self
    }

    /// Set ALPN protocols
    pub fn alpn(mut self, protocols: &[&str]) -> Result<Self, TlsError> {
        self.options.alpn = validate_alpn(protocols)?;
        Ok(self)
    }

    /// Set SNI servername (also the name verified against the certificate)
    pub fn servername(mut self, name: impl Into<String>) -> Self {
        self.options.servername = Some(name.into());
        self
    }

    /// Enable/disable failing the handshake on verification errors
    pub fn verify_peer(self, verify: bool) -> Self {
        self.reject_unauthorized(verify)
    }

    pub fn reject_unauthorized(mut self, reject: bool) -> Self {
        self.options.reject_unauthorized = reject;
        self
    }

    pub fn trust_anchors(mut self, anchors: TrustAnchors) -> Self {
        self.options.verifier = CertificateVerifier::new(anchors);
        self
    }

    /// Trust the certificates in a PEM file
    pub fn ca_file<P: AsRef<Path>>(self, path: P) -> Result<Self, TlsError> {
        Ok(self.trust_anchors(TrustAnchors::from_file(path)?))
    }

    /// Client certificate and key, sent when the server asks for one
    pub fn identity(mut self, identity: CertifiedKey) -> Self {
        self.options.identity = Some(identity);
        self
    }

    /// Load client certificate and key from a PEM file
    pub fn cert_file<P: AsRef<Path>>(self, path: P) -> Result<Self, TlsError> {
        Ok(self.identity(CertifiedKey::from_file(path)?))
    }

    /// Replace the hostname check run after chain verification
    pub fn check_server_identity<F>(mut self, check: F) -> Self
    where
        F: Fn(&str, &Certificate) -> Result<(), VerificationError> + Send + Sync + 'static,
    {
        self.options.check_server_identity = Some(Arc::new(check));
        self
    }

    /// Offer this session for resumption
    pub fn session(mut self, session: Session) -> Self {
        self.options.session = Some(session);
        self
    }

    /// Cache sessions per server name and offer them on later connections
    pub fn session_store(mut self, store: Arc<SessionStore>) -> Self {
        self.options.session_store = Some(store);
        self
    }

    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.options.handshake_timeout = timeout;
        self
    }

    pub fn max_fragment_len(mut self, len: usize) -> Result<Self, TlsError> {
        self.options.max_fragment_len = validate_fragment(len)?;
        Ok(self)
    }

    /// Limit server-requested renegotiations to `limit` per `window`
    pub fn renegotiation_limit(mut self, limit: usize, window: Duration) -> Self {
        self.options.renegotiation_limit = limit;
        self.options.renegotiation_window = window;
        self
    }

    pub fn disable_renegotiation(self) -> Self {
        self.renegotiation_limit(0, DEFAULT_RENEGOTIATION_WINDOW)
    }

    pub fn on_event<F>(mut self, handler: F) -> Self
    where
        F: Fn(&TlsEvent) + Send + Sync + 'static,
    {
        let handler: EventHandler = Arc::new(handler);
        self.options.events = Events::new(Some(handler));
        self
    }

    /// Build the TLS configuration
    pub fn build(self) -> Result<TlsConfig, TlsError> {
        self.options.validate()?;
        Ok(TlsConfig { options: Arc::new(self.options), is_server: false })
    }
}

/// Server configuration builder
pub struct ServerConfigBuilder {
    options: ConnectionOptions,
}

impl ServerConfigBuilder {
    fn new() -> Self {
        ServerConfigBuilder { options: ConnectionOptions::new(true) }
    }

    /// Set TLS version (both min and max)
    pub fn version(mut self, version: TlsVersion) -> Self {
        self.options.min_version = version;
        self.options.max_version = version;
        self
    }

    /// Set TLS version range
    pub fn version_range(mut self, min: TlsVersion, max: TlsVersion) -> Self {
        self.options.min_version = min;
        self.options.max_version = max;
        self
    }

    /// Set cipher suites from an OpenSSL-style colon separated list
    pub fn cipher_list(mut self, ciphers: &str) -> Result<Self, TlsError> {
        self.options.cipher_suites = CipherSuite::parse_list(ciphers)?;
        Ok(self)
    }

    pub fn cipher_suites(mut self, suites: &[CipherSuite]) -> Self {
        self.options.cipher_suites = suites.to_vec();
        self
    }

    /// Prefer the server's cipher order over the client's
    pub fn honor_cipher_order(mut self, honor: bool) -> Self {
        self.options.honor_cipher_order = honor;
        self
    }

    pub fn groups(mut self, groups: &[NamedGroup]) -> Self {
        self.options.groups = groups.to_vec();
        self
    }

    /// Set ALPN protocols, in server preference order
    pub fn alpn(mut self, protocols: &[&str]) -> Result<Self, TlsError> {
        self.options.alpn = validate_alpn(protocols)?;
        Ok(self)
    }

    /// Default certificate and key
    pub fn identity(mut self, identity: CertifiedKey) -> Self {
        self.options.identity = Some(identity);
        self
    }

    /// Load server certificate chain and key from a PEM file
    pub fn cert_file<P: AsRef<Path>>(self, path: P) -> Result<Self, TlsError> {
        Ok(self.identity(CertifiedKey::from_file(path)?))
    }

    /// Certificate context for clients asking for `hostname` via SNI
    pub fn sni_context(self, hostname: &str, context: ServerContext) -> Result<Self, TlsError> {
        self.options.sni.add(hostname, context)?;
        Ok(self)
    }

    /// Choose a certificate context per requested server name at handshake time
    pub fn sni_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str) -> Option<ServerContext> + Send + Sync + 'static,
    {
        self.options.sni_callback = Some(Arc::new(callback));
        self
    }

    /// Set client certificate verification mode
    pub fn client_verify(mut self, mode: ClientVerify) -> Self {
        self.options.client_verify = mode;
        self.options.reject_unauthorized = mode == ClientVerify::Required;
        self
    }

    pub fn client_trust_anchors(mut self, anchors: TrustAnchors) -> Self {
        self.options.verifier = CertificateVerifier::new(anchors);
        self
    }

    /// Set CA file for client certificate verification
    pub fn client_verify_ca<P: AsRef<Path>>(self, path: P) -> Result<Self, TlsError> {
        Ok(self.client_trust_anchors(TrustAnchors::from_file(path)?))
    }

    pub fn session_resumption(mut self, policy: ResumptionPolicy) -> Self {
        self.options.resumption = policy;
        self
    }

    /// Server-side session cache used with [`ResumptionPolicy::SessionIds`]
    pub fn session_store(mut self, store: Arc<SessionStore>) -> Self {
        self.options.session_store = Some(store);
        self
    }

    /// How long issued sessions stay resumable
    pub fn session_timeout(mut self, timeout: Duration) -> Self {
        self.options.session_timeout = timeout;
        self
    }

    /// Key used with [`ResumptionPolicy::Tickets`]; generated if unset
    pub fn ticket_key(mut self, key: TicketKey) -> Self {
        self.options.ticket_key = Some(Arc::new(key));
        self
    }

    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.options.handshake_timeout = timeout;
        self
    }

    pub fn max_fragment_len(mut self, len: usize) -> Result<Self, TlsError> {
        self.options.max_fragment_len = validate_fragment(len)?;
        Ok(self)
    }

    /// Limit client-initiated renegotiations to `limit` per `window`
    pub fn renegotiation_limit(mut self, limit: usize, window: Duration) -> Self {
        self.options.renegotiation_limit = limit;
        self.options.renegotiation_window = window;
        self
    }

    pub fn disable_renegotiation(self) -> Self {
        self.renegotiation_limit(0, DEFAULT_RENEGOTIATION_WINDOW)
    }

    pub fn on_event<F>(mut self, handler: F) -> Self
    where
        F: Fn(&TlsEvent) + Send + Sync + 'static,
    {
        let handler: EventHandler = Arc::new(handler);
        self.options.events = Events::new(Some(handler));
        self
    }

    /// Build the TLS configuration
    ///
    /// Without an identity the server gets a freshly generated self-signed
    /// certificate for `localhost`.
    pub fn build(mut self) -> Result<TlsConfig, TlsError> {
        self.options.validate()?;
        if self.options.identity.is_none() {
            self.options.identity =
                Some(CertifiedKey::self_signed("localhost", &["localhost", "127.0.0.1"])?);
        }
        match self.options.resumption {
            ResumptionPolicy::SessionIds if self.options.session_store.is_none() => {
                self.options.session_store = Some(Arc::new(SessionStore::default()));
            }
            ResumptionPolicy::Tickets if self.options.ticket_key.is_none() => {
                self.options.ticket_key = Some(Arc::new(TicketKey::generate()?));
            }
            _ => {}
        }
        Ok(TlsConfig { options: Arc::new(self.options), is_server: true })
    }
}
