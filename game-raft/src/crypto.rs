//! Key material for the transport envelope.
//!
//! Each node generates an X25519 keypair at startup. The node that starts a
//! group also generates a 32-byte group secret; joiners receive it sealed
//! under a key derived from the X25519 shared secret, and from then on every
//! data-plane datagram is sealed with AES-256-GCM under the group secret.
//!
//! Sealed layout: `nonce (12 bytes) || ciphertext`.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use hkdf::Hkdf;
use parking_lot::RwLock;
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::Sha256;
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

pub const KEY_SIZE: usize = 32;
pub const NONCE_SIZE: usize = 12;
/// AES-GCM authentication tag appended to every ciphertext.
pub const TAG_SIZE: usize = 16;

const WRAP_INFO: &[u8] = b"game-raft group secret v1";

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("no group secret established")]
    NoGroupSecret,

    #[error("encryption failed")]
    EncryptionFailed,

    /// Wrong key, truncated payload, or tampered ciphertext.
    #[error("decryption failed")]
    DecryptionFailed,

    #[error("invalid key length: expected {KEY_SIZE} bytes, got {0}")]
    InvalidKeyLength(usize),
}

pub type CryptoResult<T> = Result<T, CryptoError>;

struct GroupKey {
    raw: [u8; KEY_SIZE],
    cipher: Aes256Gcm,
}

impl GroupKey {
    fn new(raw: [u8; KEY_SIZE]) -> Self {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&raw));
        Self { raw, cipher }
    }
}

impl Drop for GroupKey {
    fn drop(&mut self) {
        self.raw.zeroize();
    }
}

/// A group secret sealed for one joiner.
#[derive(Debug, Clone)]
pub struct WrappedSecret {
    pub nonce: [u8; NONCE_SIZE],
    pub sealed: Vec<u8>,
}

/// Per-node key material: the static keypair plus the group secret once known.
pub struct Encryption {
    secret: StaticSecret,
    public: PublicKey,
    group: RwLock<Option<GroupKey>>,
}

impl Default for Encryption {
    fn default() -> Self {
        Self::new()
    }
}

impl Encryption {
    /// Generates a fresh X25519 keypair. No group secret is installed yet.
    pub fn new() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self {
            secret,
            public,
            group: RwLock::new(None),
        }
    }

    pub fn public_key(&self) -> [u8; KEY_SIZE] {
        self.public.to_bytes()
    }

    /// Generates and installs a new group secret, replacing any previous one.
    pub fn generate_group_secret(&self) {
        let mut raw = [0u8; KEY_SIZE];
        OsRng.fill_bytes(&mut raw);
        self.install_group_secret(raw);
        raw.zeroize();
    }

    pub fn install_group_secret(&self, raw: [u8; KEY_SIZE]) {
        *self.group.write() = Some(GroupKey::new(raw));
    }

    pub fn has_group_secret(&self) -> bool {
        self.group.read().is_some()
    }

    /// Seals `plaintext` under the group secret.
    pub fn seal(&self, plaintext: &[u8]) -> CryptoResult<Vec<u8>> {
        let guard = self.group.read();
        let key = guard.as_ref().ok_or(CryptoError::NoGroupSecret)?;
        seal_with(&key.cipher, plaintext)
    }

    /// Opens a payload produced by [`Encryption::seal`] on any group member.
    pub fn open(&self, sealed: &[u8]) -> CryptoResult<Vec<u8>> {
        let guard = self.group.read();
        let key = guard.as_ref().ok_or(CryptoError::NoGroupSecret)?;
        open_with(&key.cipher, sealed)
    }

    /// Seals the group secret for the holder of `peer_public`.
    pub fn wrap_group_secret(&self, peer_public: &[u8; KEY_SIZE]) -> CryptoResult<WrappedSecret> {
        let guard = self.group.read();
        let key = guard.as_ref().ok_or(CryptoError::NoGroupSecret)?;
        let cipher = self.wrapping_cipher(peer_public)?;

        let mut nonce = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);
        let sealed = cipher
            .encrypt(Nonce::from_slice(&nonce), key.raw.as_slice())
            .map_err(|_| CryptoError::EncryptionFailed)?;
        Ok(WrappedSecret { nonce, sealed })
    }

    /// Unwraps a group secret sealed by `peer_public` for this node and installs it.
    pub fn unwrap_group_secret(
        &self,
        peer_public: &[u8; KEY_SIZE],
        wrapped: &WrappedSecret,
    ) -> CryptoResult<()> {
        let cipher = self.wrapping_cipher(peer_public)?;
        let mut plain = cipher
            .decrypt(Nonce::from_slice(&wrapped.nonce), wrapped.sealed.as_slice())
            .map_err(|_| CryptoError::DecryptionFailed)?;
        if plain.len() != KEY_SIZE {
            let len = plain.len();
            plain.zeroize();
            return Err(CryptoError::InvalidKeyLength(len));
        }
        let mut raw = [0u8; KEY_SIZE];
        raw.copy_from_slice(&plain);
        plain.zeroize();
        self.install_group_secret(raw);
        raw.zeroize();
        Ok(())
    }

    fn wrapping_cipher(&self, peer_public: &[u8; KEY_SIZE]) -> CryptoResult<Aes256Gcm> {
        let shared = self.secret.diffie_hellman(&PublicKey::from(*peer_public));
        let hk = Hkdf::<Sha256>::new(None, shared.as_bytes());
        let mut okm = [0u8; KEY_SIZE];
        hk.expand(WRAP_INFO, &mut okm)
            .map_err(|_| CryptoError::InvalidKeyLength(KEY_SIZE))?;
        let cipher = Aes256Gcm::new_from_slice(&okm).map_err(|_| CryptoError::InvalidKeyLength(KEY_SIZE));
        okm.zeroize();
        cipher
    }
}

fn seal_with(cipher: &Aes256Gcm, plaintext: &[u8]) -> CryptoResult<Vec<u8>> {
    let mut nonce = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| CryptoError::EncryptionFailed)?;
    let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

fn open_with(cipher: &Aes256Gcm, sealed: &[u8]) -> CryptoResult<Vec<u8>> {
    if sealed.len() < NONCE_SIZE {
        return Err(CryptoError::DecryptionFailed);
    }
    let (nonce, ciphertext) = sealed.split_at(NONCE_SIZE);
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoError::DecryptionFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_requires_group_secret() {
        let enc = Encryption::new();
        assert!(!enc.has_group_secret());
        assert!(matches!(enc.seal(b"hi"), Err(CryptoError::NoGroupSecret)));
        assert!(matches!(enc.open(b"hi"), Err(CryptoError::NoGroupSecret)));
    }

    #[test]
    fn group_members_can_read_each_others_traffic() {
        let leader = Encryption::new();
        leader.generate_group_secret();

        let joiner = Encryption::new();
        let wrapped = leader.wrap_group_secret(&joiner.public_key()).unwrap();
        joiner
            .unwrap_group_secret(&leader.public_key(), &wrapped)
            .unwrap();

        let sealed = joiner.seal(b"move north").unwrap();
        assert_ne!(&sealed[NONCE_SIZE..], b"move north");
        assert_eq!(leader.open(&sealed).unwrap(), b"move north");
    }

    #[test]
    fn outsider_cannot_unwrap_or_open() {
        let leader = Encryption::new();
        leader.generate_group_secret();
        let joiner = Encryption::new();
        let outsider = Encryption::new();

        let wrapped = leader.wrap_group_secret(&joiner.public_key()).unwrap();
        assert!(matches!(
            outsider.unwrap_group_secret(&leader.public_key(), &wrapped),
            Err(CryptoError::DecryptionFailed)
        ));

        outsider.generate_group_secret();
        let sealed = leader.seal(b"secret").unwrap();
        assert!(matches!(outsider.open(&sealed), Err(CryptoError::DecryptionFailed)));
        assert!(matches!(leader.open(&sealed[..4]), Err(CryptoError::DecryptionFailed)));
    }
}
