//! Session caching for abbreviated handshakes
//!
//! A [`Session`] is what survives a full handshake: the negotiated version and
//! cipher suite, a resumption secret and how the peer authenticated. Servers
//! either keep sessions in a
//! [`SessionStore`] keyed by a random session id, or seal them into a ticket
//! under a [`TicketKey`] and keep nothing. Clients keep the sessions they were
//! given in their own store, keyed by server name.

use crate::cert::CertificateChain;
use crate::codec::{put_nested, put_vec_u16, put_vec_u24, put_vec_u8, Reader};
use crate::config::TlsVersion;
use crate::crypto::{random_array, CipherSuite, Secret, NONCE_LEN, TAG_LEN};
use crate::error::TlsError;
use crate::verify::VerificationError;
use bytes::{BufMut, Bytes, BytesMut};
use openssl::symm::{decrypt_aead, encrypt_aead, Cipher};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, RwLock, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::debug;
use zeroize::Zeroizing;

/// Default session lifetime
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(300);

/// Default number of sessions a store holds before evicting the oldest
pub const DEFAULT_STORE_CAPACITY: usize = 1024;

/// How a server offers resumption
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumptionPolicy {
    /// Always perform full handshakes
    Disabled,
    /// Cache sessions server-side and hand out their ids
    SessionIds,
    /// Seal session state into tickets held by the client
    Tickets,
}

/// Parameters of a completed handshake that can be resumed
#[derive(Clone)]
pub struct Session {
    id: Bytes,
    version: TlsVersion,
    cipher_suite: CipherSuite,
    secret: Secret,
    created: SystemTime,
    lifetime: Duration,
    alpn_protocol: Option<String>,
    server_name: Option<String>,
    /// Chain the peer presented in the full handshake
    peer_chain: Option<CertificateChain>,
    peer_authorized: bool,
    authorization_error: Option<VerificationError>,
}

impl Session {
    pub(crate) fn new(
        id: Bytes,
        version: TlsVersion,
        cipher_suite: CipherSuite,
        secret: Secret,
        lifetime: Duration,
    ) -> Self {
        Session {
            id,
            version,
            cipher_suite,
            secret,
            created: SystemTime::now(),
            lifetime,
            alpn_protocol: None,
            server_name: None,
            peer_chain: None,
            peer_authorized: false,
            authorization_error: None,
        }
    }

    pub(crate) fn with_alpn(mut self, alpn: Option<String>) -> Self {
        self.alpn_protocol = alpn;
        self
    }

    pub(crate) fn with_server_name(mut self, name: Option<String>) -> Self {
        self.server_name = name;
        self
    }

    /// Record the peer authentication outcome carried over on resumption
    pub(crate) fn with_peer(
        mut self,
        chain: Option<CertificateChain>,
        authorized: bool,
        error: Option<VerificationError>,
    ) -> Self {
        self.peer_chain = chain;
        self.peer_authorized = authorized;
        self.authorization_error = error;
        self
    }

    pub(crate) fn with_id(mut self, id: Bytes) -> Self {
        self.id = id;
        self
    }

    /// Session id or ticket, as presented by the client
    pub fn id(&self) -> &Bytes {
        &self.id
    }

    pub fn version(&self) -> TlsVersion {
        self.version
    }

    pub fn cipher_suite(&self) -> CipherSuite {
        self.cipher_suite
    }

    pub fn created(&self) -> SystemTime {
        self.created
    }

    pub fn lifetime(&self) -> Duration {
        self.lifetime
    }

    pub fn expires_at(&self) -> SystemTime {
        self.created + self.lifetime
    }

    pub fn is_expired_at(&self, now: SystemTime) -> bool {
        now >= self.expires_at()
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(SystemTime::now())
    }

    pub fn alpn_protocol(&self) -> Option<&str> {
        self.alpn_protocol.as_deref()
    }

    pub fn server_name(&self) -> Option<&str> {
        self.server_name.as_deref()
    }

    pub fn peer_certificate_chain(&self) -> Option<&CertificateChain> {
        self.peer_chain.as_ref()
    }

    /// Whether the peer's certificate verified when the session was created
    pub fn peer_authorized(&self) -> bool {
        self.peer_authorized
    }

    pub fn authorization_error(&self) -> Option<&VerificationError> {
        self.authorization_error.as_ref()
    }

    pub(crate) fn secret(&self) -> &[u8] {
        &self.secret
    }

    /// Serialize for storage outside the process
    ///
    /// The output contains the resumption secret; treat it like a key.
    pub fn to_bytes(&self) -> Result<Bytes, TlsError> {
        let mut buf = BytesMut::new();
        put_vec_u16(&mut buf, &self.id)?;
        self.encode_state(&mut buf)?;
        Ok(buf.freeze())
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, TlsError> {
        let mut r = Reader::new(data, "session");
        let id = Bytes::copy_from_slice(r.vec_u16()?);
        let session = Self::decode_state(&mut r, id)?;
        r.finish()?;
        Ok(session)
    }

    fn encode_state(&self, buf: &mut BytesMut) -> Result<(), TlsError> {
        let created = self
            .created
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        buf.put_u16(self.version.wire());
        buf.put_u16(self.cipher_suite.code());
        buf.put_u64(created);
        buf.put_u32(self.lifetime.as_secs().min(u32::MAX as u64) as u32);
        put_vec_u8(buf, &self.secret)?;
        put_vec_u8(buf, self.alpn_protocol.as_deref().unwrap_or("").as_bytes())?;
        put_vec_u16(buf, self.server_name.as_deref().unwrap_or("").as_bytes())?;
        put_nested(buf, 3, |b| {
            for der in self.peer_chain.iter().flat_map(|c| c.to_der_list()) {
                put_vec_u24(b, &der)?;
            }
            Ok(())
        })?;
        buf.put_u8(self.peer_authorized as u8);
        match &self.authorization_error {
            Some(error) => {
                buf.put_u8(1);
                error.encode(buf)
            }
            None => {
                buf.put_u8(0);
                Ok(())
            }
        }
    }

    fn decode_state(r: &mut Reader<'_>, id: Bytes) -> Result<Self, TlsError> {
        let version = TlsVersion::from_wire(r.u16()?).ok_or_else(|| TlsError::decode("session"))?;
        let cipher_suite =
            CipherSuite::from_code(r.u16()?).ok_or_else(|| TlsError::decode("session"))?;
        let created = UNIX_EPOCH + Duration::from_secs(r.u64()?);
        let lifetime = Duration::from_secs(r.u32()? as u64);
        let secret = Zeroizing::new(r.vec_u8()?.to_vec());
        let text = |b: &[u8]| -> Result<Option<String>, TlsError> {
            if b.is_empty() {
                return Ok(None);
            }
            String::from_utf8(b.to_vec())
                .map(Some)
                .map_err(|_| TlsError::decode("session"))
        };
        let alpn_protocol = text(r.vec_u8()?)?;
        let server_name = text(r.vec_u16()?)?;

        let mut list = r.sub_u24()?;
        let mut ders = Vec::new();
        while !list.is_empty() {
            ders.push(list.vec_u24()?);
        }
        let peer_chain = if ders.is_empty() {
            None
        } else {
            Some(CertificateChain::from_der_list(&ders)?)
        };
        let peer_authorized = match r.u8()? {
            0 => false,
            1 => true,
            _ => return Err(TlsError::decode("session")),
        };
        let authorization_error = match r.u8()? {
            0 => None,
            1 => Some(VerificationError::decode(r)?),
            _ => return Err(TlsError::decode("session")),
        };
        Ok(Session {
            id,
            version,
            cipher_suite,
            secret,
            created,
            lifetime,
            alpn_protocol,
            server_name,
            peer_chain,
            peer_authorized,
            authorization_error,
        })
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id_len", &self.id.len())
            .field("version", &self.version)
            .field("cipher_suite", &self.cipher_suite)
            .field("created", &self.created)
            .field("lifetime", &self.lifetime)
            .field("alpn_protocol", &self.alpn_protocol)
            .field("server_name", &self.server_name)
            .field("peer_chain_len", &self.peer_chain.as_ref().map(|c| c.len()))
            .field("peer_authorized", &self.peer_authorized)
            .finish_non_exhaustive()
    }
}

struct StoreInner {
    sessions: HashMap<Bytes, Session>,
    order: VecDeque<Bytes>,
}

/// Thread-safe session cache
///
/// Lookups share a read lock; inserts and evictions take the write lock, so
/// every per-key mutation is atomic. Expired entries are never returned.
pub struct SessionStore {
    inner: RwLock<StoreInner>,
    capacity: usize,
}

impl SessionStore {
    pub fn new(capacity: usize) -> Self {
        SessionStore {
            inner: RwLock::new(StoreInner {
                sessions: HashMap::new(),
                order: VecDeque::new(),
            }),
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.read_inner().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert or replace; evicts the oldest entry when full
    pub fn put(&self, id: &[u8], session: Session) {
        let key = Bytes::copy_from_slice(id);
        let mut inner = self.write_inner();
        if inner.sessions.insert(key.clone(), session).is_none() {
            inner.order.push_back(key);
        }
        while inner.sessions.len() > self.capacity {
            match inner.order.pop_front() {
                Some(oldest) => {
                    inner.sessions.remove(&oldest);
                }
                None => break,
            }
        }
    }

    pub fn get(&self, id: &[u8]) -> Option<Session> {
        self.get_at(id, SystemTime::now())
    }

    /// Look up `id` as of `now`; an expired entry is evicted and missed
    pub fn get_at(&self, id: &[u8], now: SystemTime) -> Option<Session> {
        {
            let inner = self.read_inner();
            match inner.sessions.get(id) {
                None => return None,
                Some(session) if !session.is_expired_at(now) => return Some(session.clone()),
                Some(_) => {}
            }
        }
        let mut inner = self.write_inner();
        let expired = inner.sessions.get(id).map(|s| s.is_expired_at(now)).unwrap_or(false);
        if expired {
            remove_entry(&mut inner, id);
            debug!("Evicted expired session");
            return None;
        }
        inner.sessions.get(id).cloned()
    }

    pub fn evict(&self, id: &[u8]) -> Option<Session> {
        let mut inner = self.write_inner();
        remove_entry(&mut inner, id)
    }

    /// Drop every expired session, returning how many were removed
    pub fn sweep(&self) -> usize {
        self.sweep_at(SystemTime::now())
    }

    pub fn sweep_at(&self, now: SystemTime) -> usize {
        let mut inner = self.write_inner();
        let before = inner.sessions.len();
        inner.sessions.retain(|_, s| !s.is_expired_at(now));
        let StoreInner { sessions, order } = &mut *inner;
        order.retain(|k| sessions.contains_key(k));
        let removed = before - inner.sessions.len();
        if removed > 0 {
            debug!(removed, "Swept expired sessions");
        }
        removed
    }

    /// Sweep every `interval` on a background thread
    ///
    /// The thread holds only a weak reference and exits once the store is
    /// dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let store: Weak<SessionStore> = Arc::downgrade(self);
        thread::spawn(move || loop {
            thread::sleep(interval);
            match store.upgrade() {
                Some(store) => {
                    store.sweep();
                }
                None => break,
            }
        })
    }

    fn read_inner(&self) -> std::sync::RwLockReadGuard<'_, StoreInner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_inner(&self) -> std::sync::RwLockWriteGuard<'_, StoreInner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new(DEFAULT_STORE_CAPACITY)
    }
}

impl fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionStore")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

fn remove_entry(inner: &mut StoreInner, id: &[u8]) -> Option<Session> {
    let removed = inner.sessions.remove(id);
    if removed.is_some() {
        inner.order.retain(|k| k.as_ref() != id);
    }
    removed
}

const TICKET_NAME_LEN: usize = 16;
const TICKET_KEY_LEN: usize = 32;

/// Server key for sealing session tickets (AES-256-GCM)
pub struct TicketKey {
    name: [u8; TICKET_NAME_LEN],
    key: Secret,
}

impl TicketKey {
    pub fn generate() -> Result<Self, TlsError> {
        let key: [u8; TICKET_KEY_LEN] = random_array()?;
        Ok(TicketKey {
            name: random_array()?,
            key: Zeroizing::new(key.to_vec()),
        })
    }

    /// Build from 48 bytes: a 16 byte key name followed by a 32 byte key
    pub fn from_bytes(material: &[u8]) -> Result<Self, TlsError> {
        if material.len() != TICKET_NAME_LEN + TICKET_KEY_LEN {
            return Err(TlsError::InvalidConfig(format!(
                "Ticket key must be {} bytes, got {}",
                TICKET_NAME_LEN + TICKET_KEY_LEN,
                material.len()
            )));
        }
        let mut name = [0u8; TICKET_NAME_LEN];
        name.copy_from_slice(&material[..TICKET_NAME_LEN]);
        Ok(TicketKey {
            name,
            key: Zeroizing::new(material[TICKET_NAME_LEN..].to_vec()),
        })
    }

    /// Seal the session state into an opaque ticket
    pub fn seal(&self, session: &Session) -> Result<Bytes, TlsError> {
        let mut state = BytesMut::new();
        session.encode_state(&mut state)?;
        let state = Zeroizing::new(state.to_vec());

        let nonce: [u8; NONCE_LEN] = random_array()?;
        let mut tag = [0u8; TAG_LEN];
        let sealed =
            encrypt_aead(Cipher::aes_256_gcm(), &self.key, Some(&nonce), &self.name, &state, &mut tag)?;

        let mut ticket = BytesMut::with_capacity(TICKET_NAME_LEN + NONCE_LEN + sealed.len() + TAG_LEN);
        ticket.put_slice(&self.name);
        ticket.put_slice(&nonce);
        ticket.put_slice(&sealed);
        ticket.put_slice(&tag);
        Ok(ticket.freeze())
    }

    /// Recover a session from a ticket
    ///
    /// Tickets under another key, forged or corrupted tickets, and expired
    /// sessions are all misses.
    pub fn open(&self, ticket: &[u8]) -> Option<Session> {
        self.open_at(ticket, SystemTime::now())
    }

    pub fn open_at(&self, ticket: &[u8], now: SystemTime) -> Option<Session> {
        if ticket.len() < TICKET_NAME_LEN + NONCE_LEN + TAG_LEN
            || ticket[..TICKET_NAME_LEN] != self.name
        {
            return None;
        }
        let nonce = &ticket[TICKET_NAME_LEN..TICKET_NAME_LEN + NONCE_LEN];
        let (sealed, tag) = ticket[TICKET_NAME_LEN + NONCE_LEN..].split_at(
            ticket.len() - TICKET_NAME_LEN - NONCE_LEN - TAG_LEN,
        );
        let state =
            decrypt_aead(Cipher::aes_256_gcm(), &self.key, Some(nonce), &self.name, sealed, tag)
                .ok()
                .map(Zeroizing::new)?;

        let mut r = Reader::new(&state, "ticket");
        let session = Session::decode_state(&mut r, Bytes::copy_from_slice(ticket)).ok()?;
        r.finish().ok()?;
        if session.is_expired_at(now) {
            return None;
        }
        Some(session)
    }
}

impl fmt::Debug for TicketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TicketKey").finish_non_exhaustive()
    }
}
