//! Syn-cookie validation and session key agreement for secured connections.
//!
//! The acceptor keeps two rotating 160-bit secrets and a static x25519 keypair.
//! A connecting peer proves it can receive at its claimed address by echoing a
//! cookie, and ships a random pre-secret sealed to the acceptor's public key.
//! Both sides then stretch the pre-secret into the session key.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use hkdf::Hkdf;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};

use super::address::PeerAddress;
use super::clock::TimeMs;
use super::protocol::{SecuredConnectionConfirmation, SecuredConnectionResponse};

pub const COOKIE_ROTATION_MS: u64 = 5_000;
pub const COOKIE_SECRET_LEN: usize = 20;
pub const COOKIE_LEN: usize = 32;
pub const KEY_LEN: usize = 32;
pub const PRE_SECRET_LEN: usize = 32;

const SEAL_INFO: &[u8] = b"keel/seal";
const SESSION_INFO: &[u8] = b"keel/session";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SecurityError {
    #[error("syn-cookie does not match the current or previous secret")]
    CookieMismatch,
    #[error("pre-secret could not be unsealed")]
    Unseal,
    #[error("pre-secret could not be sealed")]
    Seal,
    #[error("server public key does not match the pinned key")]
    PublicKeyMismatch,
}

/// Security settings for [`PeerConfig`](super::PeerConfig).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Static x25519 secret. Generated at startup when absent.
    pub private_key: Option<[u8; KEY_LEN]>,
    /// Key an outgoing connection must see from the remote, when pinned.
    pub expected_server_key: Option<[u8; KEY_LEN]>,
}

/// Symmetric key for one connection, plus which end of it we are.
///
/// The direction keeps the two halves of the connection from ever sharing a nonce.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKey {
    bytes: [u8; KEY_LEN],
    initiator: bool,
}

impl SessionKey {
    pub fn new(bytes: [u8; KEY_LEN], initiator: bool) -> Self {
        Self { bytes, initiator }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.bytes
    }

    pub fn is_initiator(&self) -> bool {
        self.initiator
    }

    /// Direction byte stamped into outgoing nonces.
    pub fn outbound_direction(&self) -> u8 {
        if self.initiator { 0 } else { 1 }
    }

    pub fn inbound_direction(&self) -> u8 {
        1 - self.outbound_direction()
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionKey")
            .field("initiator", &self.initiator)
            .finish_non_exhaustive()
    }
}

fn random_bytes<const N: usize>() -> [u8; N] {
    let mut out = [0u8; N];
    rand::thread_rng().fill_bytes(&mut out);
    out
}

pub fn generate_private_key() -> [u8; KEY_LEN] {
    StaticSecret::random_from_rng(rand::thread_rng()).to_bytes()
}

pub fn public_key_for(private_key: &[u8; KEY_LEN]) -> [u8; KEY_LEN] {
    *PublicKey::from(&StaticSecret::from(*private_key)).as_bytes()
}

/// Current and previous syn-cookie secrets.
#[derive(Debug, Clone)]
pub struct CookieJar {
    current: [u8; COOKIE_SECRET_LEN],
    previous: [u8; COOKIE_SECRET_LEN],
    next_rotation_at: TimeMs,
}

impl CookieJar {
    pub fn new(now: TimeMs) -> Self {
        Self {
            current: random_bytes(),
            previous: random_bytes(),
            next_rotation_at: now + COOKIE_ROTATION_MS,
        }
    }

    /// Called from the network tick; rotation is driven by the caller's clock.
    pub fn rotate_if_due(&mut self, now: TimeMs) -> bool {
        if now < self.next_rotation_at {
            return false;
        }
        self.rotate(now);
        true
    }

    pub fn rotate(&mut self, now: TimeMs) {
        self.previous = self.current;
        self.current = random_bytes();
        self.next_rotation_at = now + COOKIE_ROTATION_MS;
    }

    pub fn issue(&self, addr: PeerAddress) -> [u8; COOKIE_LEN] {
        Self::hash(addr, &self.current)
    }

    /// Accepts cookies minted under either live secret, so a rotation landing
    /// mid-handshake does not fail the dial.
    pub fn verify(&self, addr: PeerAddress, cookie: &[u8; COOKIE_LEN]) -> bool {
        let current: bool = Self::hash(addr, &self.current)[..].ct_eq(&cookie[..]).into();
        let previous: bool = Self::hash(addr, &self.previous)[..].ct_eq(&cookie[..]).into();
        current | previous
    }

    fn hash(addr: PeerAddress, secret: &[u8; COOKIE_SECRET_LEN]) -> [u8; COOKIE_LEN] {
        let mut hasher = Sha256::new();
        hasher.update(addr.ip.to_be_bytes());
        hasher.update(addr.port.to_be_bytes());
        hasher.update(secret);
        hasher.finalize().into()
    }
}

/// Acceptor-side state: keypair plus cookie secrets.
pub struct ServerSecurity {
    secret: StaticSecret,
    public: PublicKey,
    cookies: CookieJar,
}

impl ServerSecurity {
    pub fn new(private_key: Option<[u8; KEY_LEN]>, now: TimeMs) -> Self {
        let secret = match private_key {
            Some(bytes) => StaticSecret::from(bytes),
            None => StaticSecret::random_from_rng(rand::thread_rng()),
        };
        let public = PublicKey::from(&secret);
        Self {
            secret,
            public,
            cookies: CookieJar::new(now),
        }
    }

    pub fn public_key(&self) -> [u8; KEY_LEN] {
        *self.public.as_bytes()
    }

    pub fn cookies(&self) -> &CookieJar {
        &self.cookies
    }

    pub fn cookies_mut(&mut self) -> &mut CookieJar {
        &mut self.cookies
    }

    pub fn respond(&self, addr: PeerAddress) -> SecuredConnectionResponse {
        SecuredConnectionResponse {
            cookie: self.cookies.issue(addr),
            public_key: self.public_key(),
        }
    }

    /// Validates the echoed cookie and unseals the pre-secret into the
    /// acceptor's half of the session key.
    pub fn accept(
        &self,
        addr: PeerAddress,
        confirmation: &SecuredConnectionConfirmation,
    ) -> Result<SessionKey, SecurityError> {
        if !self.cookies.verify(addr, &confirmation.cookie) {
            return Err(SecurityError::CookieMismatch);
        }

        let ephemeral = PublicKey::from(confirmation.ephemeral_public);
        let shared = self.secret.diffie_hellman(&ephemeral);
        let seal_key = derive(shared.as_bytes(), &confirmation.cookie, &[SEAL_INFO]);

        let cipher = ChaCha20Poly1305::new_from_slice(&seal_key).map_err(|_| SecurityError::Unseal)?;
        let pre_secret = cipher
            .decrypt(Nonce::from_slice(&[0u8; 12]), confirmation.sealed_pre_secret.as_slice())
            .map_err(|_| SecurityError::Unseal)?;

        Ok(session_key(&pre_secret, &confirmation.cookie, &self.public_key(), false))
    }
}

impl std::fmt::Debug for ServerSecurity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerSecurity")
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}

/// Initiator side: draws a pre-secret, seals it to the acceptor's public key,
/// and returns the confirmation to send together with our half of the key.
pub fn confirm(
    response: &SecuredConnectionResponse,
    expected_server_key: Option<&[u8; KEY_LEN]>,
) -> Result<(SecuredConnectionConfirmation, SessionKey), SecurityError> {
    if let Some(expected) = expected_server_key {
        let matches: bool = expected[..].ct_eq(&response.public_key[..]).into();
        if !matches {
            return Err(SecurityError::PublicKeyMismatch);
        }
    }

    let pre_secret: [u8; PRE_SECRET_LEN] = random_bytes();
    let ephemeral = EphemeralSecret::random_from_rng(rand::thread_rng());
    let ephemeral_public = PublicKey::from(&ephemeral);
    let shared = ephemeral.diffie_hellman(&PublicKey::from(response.public_key));
    let seal_key = derive(shared.as_bytes(), &response.cookie, &[SEAL_INFO]);

    let cipher = ChaCha20Poly1305::new_from_slice(&seal_key).map_err(|_| SecurityError::Seal)?;
    let sealed_pre_secret = cipher
        .encrypt(Nonce::from_slice(&[0u8; 12]), pre_secret.as_slice())
        .map_err(|_| SecurityError::Seal)?;

    let confirmation = SecuredConnectionConfirmation {
        cookie: response.cookie,
        ephemeral_public: *ephemeral_public.as_bytes(),
        sealed_pre_secret,
    };
    let key = session_key(&pre_secret, &response.cookie, &response.public_key, true);
    Ok((confirmation, key))
}

fn session_key(pre_secret: &[u8], cookie: &[u8], server_public: &[u8], initiator: bool) -> SessionKey {
    SessionKey::new(derive(pre_secret, cookie, &[SESSION_INFO, server_public]), initiator)
}

fn derive(ikm: &[u8], salt: &[u8], info: &[&[u8]]) -> [u8; KEY_LEN] {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
    let mut okm = [0u8; KEY_LEN];
    // 32 bytes is always a valid HKDF-SHA256 output length
    let _ = hk.expand_multi_info(info, &mut okm);
    okm
}
