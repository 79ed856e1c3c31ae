//! Cryptographic primitives consumed by the engine
//!
//! Nothing here is implemented from scratch: hashing, HMAC, AEAD sealing, key
//! agreement and signatures all come from OpenSSL. This module only names the
//! algorithms the engine negotiates and adapts OpenSSL's APIs to the shapes the
//! record layer and key schedule need (HKDF is assembled from HMAC).

use crate::error::TlsError;
use openssl::bn::BigNumContext;
use openssl::derive::Deriver;
use openssl::ec::{EcGroup, EcKey, EcPoint, PointConversionForm};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{HasPublic, Id, PKey, PKeyRef, Private, Public};
use openssl::rsa::Padding;
use openssl::sign::{RsaPssSaltlen, Signer, Verifier};
use openssl::symm::{decrypt_aead, encrypt_aead, Cipher};
use zeroize::Zeroizing;

/// Secret key material, wiped when dropped
pub type Secret = Zeroizing<Vec<u8>>;

/// AEAD nonce length for every supported suite
pub const NONCE_LEN: usize = 12;

/// AEAD tag length for every supported suite
pub const TAG_LEN: usize = 16;

/// Cipher suites understood by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CipherSuite {
    Aes128GcmSha256,
    Aes256GcmSha384,
    Chacha20Poly1305Sha256,
}

impl CipherSuite {
    /// All suites in the default preference order
    pub const ALL: [CipherSuite; 3] = [
        CipherSuite::Aes128GcmSha256,
        CipherSuite::Aes256GcmSha384,
        CipherSuite::Chacha20Poly1305Sha256,
    ];

    pub fn code(&self) -> u16 {
        match self {
            CipherSuite::Aes128GcmSha256 => 0x1301,
            CipherSuite::Aes256GcmSha384 => 0x1302,
            CipherSuite::Chacha20Poly1305Sha256 => 0x1303,
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            0x1301 => Some(CipherSuite::Aes128GcmSha256),
            0x1302 => Some(CipherSuite::Aes256GcmSha384),
            0x1303 => Some(CipherSuite::Chacha20Poly1305Sha256),
            _ => None,
        }
    }

    /// IANA name of the suite
    pub fn name(&self) -> &'static str {
        match self {
            CipherSuite::Aes128GcmSha256 => "TLS_AES_128_GCM_SHA256",
            CipherSuite::Aes256GcmSha384 => "TLS_AES_256_GCM_SHA384",
            CipherSuite::Chacha20Poly1305Sha256 => "TLS_CHACHA20_POLY1305_SHA256",
        }
    }

    /// Parse a suite name (IANA or OpenSSL spelling, case-insensitive)
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_uppercase().as_str() {
            "TLS_AES_128_GCM_SHA256" | "AES128-GCM-SHA256" => Some(CipherSuite::Aes128GcmSha256),
            "TLS_AES_256_GCM_SHA384" | "AES256-GCM-SHA384" => Some(CipherSuite::Aes256GcmSha384),
            "TLS_CHACHA20_POLY1305_SHA256" | "CHACHA20-POLY1305" => {
                Some(CipherSuite::Chacha20Poly1305Sha256)
            }
            _ => None,
        }
    }

    /// Parse an OpenSSL-style colon separated preference list
    pub fn parse_list(list: &str) -> Result<Vec<Self>, TlsError> {
        let mut suites = Vec::new();
        for name in list.split(':').filter(|s| !s.trim().is_empty()) {
            let suite = Self::from_name(name)
                .ok_or_else(|| TlsError::InvalidConfig(format!("Unknown cipher suite: {}", name)))?;
            if !suites.contains(&suite) {
                suites.push(suite);
            }
        }
        if suites.is_empty() {
            return Err(TlsError::InvalidConfig("Empty cipher suite list".to_string()));
        }
        Ok(suites)
    }

    pub fn hash(&self) -> HashAlgorithm {
        match self {
            CipherSuite::Aes256GcmSha384 => HashAlgorithm::Sha384,
            _ => HashAlgorithm::Sha256,
        }
    }

    pub fn key_len(&self) -> usize {
        match self {
            CipherSuite::Aes128GcmSha256 => 16,
            CipherSuite::Aes256GcmSha384 | CipherSuite::Chacha20Poly1305Sha256 => 32,
        }
    }

    fn cipher(&self) -> Cipher {
        match self {
            CipherSuite::Aes128GcmSha256 => Cipher::aes_128_gcm(),
            CipherSuite::Aes256GcmSha384 => Cipher::aes_256_gcm(),
            CipherSuite::Chacha20Poly1305Sha256 => Cipher::chacha20_poly1305(),
        }
    }

    /// Encrypt `plaintext`, returning ciphertext with the tag appended
    pub fn seal(
        &self,
        key: &[u8],
        nonce: &[u8; NONCE_LEN],
        aad: &[u8],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, TlsError> {
        let mut tag = [0u8; TAG_LEN];
        let mut out = encrypt_aead(self.cipher(), key, Some(nonce), aad, plaintext, &mut tag)?;
        out.extend_from_slice(&tag);
        Ok(out)
    }

    /// Decrypt and authenticate `sealed` (ciphertext followed by tag)
    ///
    /// Any failure, including a short input, is an integrity error.
    pub fn open(
        &self,
        key: &[u8],
        nonce: &[u8; NONCE_LEN],
        aad: &[u8],
        sealed: &[u8],
    ) -> Result<Vec<u8>, TlsError> {
        if sealed.len() < TAG_LEN {
            return Err(TlsError::Integrity("record shorter than authentication tag".to_string()));
        }
        let (data, tag) = sealed.split_at(sealed.len() - TAG_LEN);
        decrypt_aead(self.cipher(), key, Some(nonce), aad, data, tag)
            .map_err(|_| TlsError::Integrity("record authentication failed".to_string()))
    }
}

/// Hash functions used by the key schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    Sha256,
    Sha384,
}

impl HashAlgorithm {
    pub fn message_digest(&self) -> MessageDigest {
        match self {
            HashAlgorithm::Sha256 => MessageDigest::sha256(),
            HashAlgorithm::Sha384 => MessageDigest::sha384(),
        }
    }

    pub fn output_len(&self) -> usize {
        match self {
            HashAlgorithm::Sha256 => 32,
            HashAlgorithm::Sha384 => 48,
        }
    }

    pub fn digest(&self, data: &[u8]) -> Result<Vec<u8>, TlsError> {
        Ok(openssl::hash::hash(self.message_digest(), data)?.to_vec())
    }

    pub fn hmac(&self, key: &[u8], data: &[&[u8]]) -> Result<Vec<u8>, TlsError> {
        let pkey = PKey::hmac(key)?;
        let mut signer = Signer::new(self.message_digest(), &pkey)?;
        for chunk in data {
            signer.update(chunk)?;
        }
        Ok(signer.sign_to_vec()?)
    }
}

/// HKDF (RFC 5869) with the TLS 1.3 label conventions (RFC 8446 section 7.1)
///
/// The label prefix carries the negotiated protocol version, so the same
/// inputs produce unrelated secrets under different versions.
#[derive(Debug, Clone, Copy)]
pub struct Hkdf {
    pub hash: HashAlgorithm,
    label_prefix: &'static str,
}

impl Hkdf {
    pub fn new(hash: HashAlgorithm, label_prefix: &'static str) -> Self {
        Hkdf { hash, label_prefix }
    }

    pub fn extract(&self, salt: &[u8], ikm: &[u8]) -> Result<Secret, TlsError> {
        let zeros;
        let salt = if salt.is_empty() {
            zeros = vec![0u8; self.hash.output_len()];
            &zeros[..]
        } else {
            salt
        };
        Ok(Zeroizing::new(self.hash.hmac(salt, &[ikm])?))
    }

    pub fn expand(&self, prk: &[u8], info: &[u8], len: usize) -> Result<Secret, TlsError> {
        let mut out = Zeroizing::new(Vec::with_capacity(len));
        let mut previous: Vec<u8> = Vec::new();
        let mut counter = 1u8;
        while out.len() < len {
            previous = self.hash.hmac(prk, &[previous.as_slice(), info, &[counter][..]])?;
            let take = (len - out.len()).min(previous.len());
            out.extend_from_slice(&previous[..take]);
            counter = counter
                .checked_add(1)
                .ok_or_else(|| TlsError::InvalidConfig("HKDF output too long".to_string()))?;
        }
        previous.iter_mut().for_each(|b| *b = 0);
        Ok(out)
    }

    pub fn expand_label(
        &self,
        secret: &[u8],
        label: &str,
        context: &[u8],
        len: usize,
    ) -> Result<Secret, TlsError> {
        let full_label = format!("{}{}", self.label_prefix, label);
        let mut info = Vec::with_capacity(4 + full_label.len() + context.len());
        info.extend_from_slice(&(len as u16).to_be_bytes());
        info.push(full_label.len() as u8);
        info.extend_from_slice(full_label.as_bytes());
        info.push(context.len() as u8);
        info.extend_from_slice(context);
        self.expand(secret, &info, len)
    }

    pub fn derive_secret(
        &self,
        secret: &[u8],
        label: &str,
        transcript_hash: &[u8],
    ) -> Result<Secret, TlsError> {
        self.expand_label(secret, label, transcript_hash, self.hash.output_len())
    }
}

/// Key exchange groups
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NamedGroup {
    X25519,
    Secp256r1,
}

impl NamedGroup {
    pub const ALL: [NamedGroup; 2] = [NamedGroup::X25519, NamedGroup::Secp256r1];

    pub fn code(&self) -> u16 {
        match self {
            NamedGroup::X25519 => 0x001d,
            NamedGroup::Secp256r1 => 0x0017,
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            0x001d => Some(NamedGroup::X25519),
            0x0017 => Some(NamedGroup::Secp256r1),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            NamedGroup::X25519 => "X25519",
            NamedGroup::Secp256r1 => "P-256",
        }
    }
}

/// An ephemeral key pair for one (EC)DHE exchange
pub struct KeyShare {
    group: NamedGroup,
    private: PKey<Private>,
    public: Vec<u8>,
}

impl KeyShare {
    pub fn generate(group: NamedGroup) -> Result<Self, TlsError> {
        let (private, public) = match group {
            NamedGroup::X25519 => {
                let private = PKey::generate_x25519()?;
                let public = private.raw_public_key()?;
                (private, public)
            }
            NamedGroup::Secp256r1 => {
                let ec_group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1)?;
                let ec_key = EcKey::generate(&ec_group)?;
                let mut ctx = BigNumContext::new()?;
                let public = ec_key.public_key().to_bytes(
                    &ec_group,
                    PointConversionForm::UNCOMPRESSED,
                    &mut ctx,
                )?;
                (PKey::from_ec_key(ec_key)?, public)
            }
        };
        Ok(KeyShare { group, private, public })
    }

    pub fn group(&self) -> NamedGroup {
        self.group
    }

    pub fn public_bytes(&self) -> &[u8] {
        &self.public
    }

    /// Compute the shared secret with the peer's public share
    pub fn agree(&self, peer_public: &[u8]) -> Result<Secret, TlsError> {
        let invalid = |_| TlsError::ProtocolViolation("invalid key share from peer".to_string());
        let peer: PKey<Public> = match self.group {
            NamedGroup::X25519 => {
                PKey::public_key_from_raw_bytes(peer_public, Id::X25519).map_err(invalid)?
            }
            NamedGroup::Secp256r1 => {
                let ec_group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1)?;
                let mut ctx = BigNumContext::new()?;
                let point = EcPoint::from_bytes(&ec_group, peer_public, &mut ctx).map_err(invalid)?;
                let key = EcKey::from_public_key(&ec_group, &point).map_err(invalid)?;
                key.check_key().map_err(invalid)?;
                PKey::from_ec_key(key)?
            }
        };
        let mut deriver = Deriver::new(&self.private)?;
        deriver.set_peer(&peer).map_err(invalid)?;
        Ok(Zeroizing::new(deriver.derive_to_vec()?))
    }
}

/// Signature schemes for CertificateVerify
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureScheme {
    RsaPssSha256,
    EcdsaP256Sha256,
    Ed25519,
}

impl SignatureScheme {
    pub fn code(&self) -> u16 {
        match self {
            SignatureScheme::RsaPssSha256 => 0x0804,
            SignatureScheme::EcdsaP256Sha256 => 0x0403,
            SignatureScheme::Ed25519 => 0x0807,
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            0x0804 => Some(SignatureScheme::RsaPssSha256),
            0x0403 => Some(SignatureScheme::EcdsaP256Sha256),
            0x0807 => Some(SignatureScheme::Ed25519),
            _ => None,
        }
    }

    /// The scheme a key of this type signs with
    pub fn for_key<T: HasPublic>(key: &PKeyRef<T>) -> Result<Self, TlsError> {
        match key.id() {
            Id::RSA => Ok(SignatureScheme::RsaPssSha256),
            Id::EC => {
                let curve = key.ec_key()?.group().curve_name();
                if curve == Some(Nid::X9_62_PRIME256V1) {
                    Ok(SignatureScheme::EcdsaP256Sha256)
                } else {
                    Err(TlsError::Certificate(format!("Unsupported EC curve: {:?}", curve)))
                }
            }
            Id::ED25519 => Ok(SignatureScheme::Ed25519),
            other => Err(TlsError::Certificate(format!("Unsupported key type: {:?}", other))),
        }
    }

    pub fn sign(&self, key: &PKeyRef<Private>, message: &[u8]) -> Result<Vec<u8>, TlsError> {
        match self {
            SignatureScheme::Ed25519 => {
                let mut signer = Signer::new_without_digest(key)?;
                Ok(signer.sign_oneshot_to_vec(message)?)
            }
            SignatureScheme::RsaPssSha256 => {
                let mut signer = Signer::new(MessageDigest::sha256(), key)?;
                signer.set_rsa_padding(Padding::PKCS1_PSS)?;
                signer.set_rsa_pss_saltlen(RsaPssSaltlen::DIGEST_LENGTH)?;
                signer.update(message)?;
                Ok(signer.sign_to_vec()?)
            }
            SignatureScheme::EcdsaP256Sha256 => {
                let mut signer = Signer::new(MessageDigest::sha256(), key)?;
                signer.update(message)?;
                Ok(signer.sign_to_vec()?)
            }
        }
    }

    /// Check a signature. Malformed signatures verify as false.
    pub fn verify<T: HasPublic>(
        &self,
        key: &PKeyRef<T>,
        message: &[u8],
        signature: &[u8],
    ) -> Result<bool, TlsError> {
        if SignatureScheme::for_key(key)? != *self {
            return Ok(false);
        }
        let valid = match self {
            SignatureScheme::Ed25519 => {
                let mut verifier = Verifier::new_without_digest(key)?;
                verifier.verify_oneshot(signature, message)
            }
            SignatureScheme::RsaPssSha256 => {
                let mut verifier = Verifier::new(MessageDigest::sha256(), key)?;
                verifier.set_rsa_padding(Padding::PKCS1_PSS)?;
                verifier.set_rsa_pss_saltlen(RsaPssSaltlen::DIGEST_LENGTH)?;
                verifier.update(message)?;
                verifier.verify(signature)
            }
            SignatureScheme::EcdsaP256Sha256 => {
                let mut verifier = Verifier::new(MessageDigest::sha256(), key)?;
                verifier.update(message)?;
                verifier.verify(signature)
            }
        };
        Ok(valid.unwrap_or(false))
    }
}

/// Fill a fixed-size array from the OpenSSL CSPRNG
pub fn random_array<const N: usize>() -> Result<[u8; N], TlsError> {
    let mut out = [0u8; N];
    openssl::rand::rand_bytes(&mut out)?;
    Ok(out)
}

/// Constant-time equality
pub fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && openssl::memcmp::eq(a, b)
}
