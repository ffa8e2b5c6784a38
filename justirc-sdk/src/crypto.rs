//! Cryptographic session layer.
//!
//! Per-peer sessions use X25519 key agreement, HKDF-SHA256 key derivation
//! and ChaCha20-Poly1305 AEAD. Channels use a 32-byte symmetric key shared
//! by all members. All state lives on clients; the server only ever sees
//! base64 ciphertext and nonces.
//!
//! Sessions rotate: after an hour of use or 10 000 messages (configurable)
//! a fresh per-peer keypair is exchanged. The retired key stays available
//! for a bounded number of in-flight decrypts so messages encrypted just
//! before the switch still arrive.

use std::collections::HashMap;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// HKDF info string binding derived keys to this protocol.
pub const HKDF_INFO: &[u8] = b"JustIRC-E2E-Encryption";
/// ChaCha20-Poly1305 nonce length in bytes.
pub const NONCE_LEN: usize = 12;
/// Symmetric key length in bytes.
pub const KEY_LEN: usize = 32;
/// How many old-key decrypts a retired session may serve after a rotation
/// completes. Bounds the rekey grace window to the in-flight backlog.
pub const REKEY_GRACE_DECRYPTS: u32 = 16;

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("no encryption key for peer {0}")]
    NoEncryptionKey(String),
    #[error("no key for channel {0}")]
    NoChannelKey(String),
    #[error("decryption failed")]
    DecryptFailure,
    #[error("invalid public key")]
    InvalidPublicKey,
    #[error("invalid key material")]
    InvalidKey,
    #[error("no rotation in progress with peer {0}")]
    RotationPeerUnavailable(String),
}

/// Why a session should be rekeyed now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rotation {
    None,
    /// The key has been in use longer than the configured interval.
    Time,
    /// The key has encrypted more messages than the configured ceiling.
    Count,
}

/// Rotation trigger thresholds.
#[derive(Debug, Clone)]
pub struct RotationPolicy {
    pub interval: Duration,
    pub max_messages: u64,
}

impl Default for RotationPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3600),
            max_messages: 10_000,
        }
    }
}

/// A derived symmetric key, wiped on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
struct AeadKey([u8; KEY_LEN]);

impl AeadKey {
    fn seal(&self, plaintext: &[u8]) -> (Vec<u8>, [u8; NONCE_LEN]) {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.0));
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .expect("ChaCha20-Poly1305 encryption is infallible for in-memory buffers");
        (ciphertext, nonce)
    }

    fn open(&self, ciphertext: &[u8], nonce: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if nonce.len() != NONCE_LEN {
            return Err(CryptoError::DecryptFailure);
        }
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.0));
        cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::DecryptFailure)
    }
}

/// Session state for one remote peer.
struct PeerSession {
    aead_key: AeadKey,
    message_counter: u64,
    first_use: Instant,
    first_use_unix: u64,
    /// Retired key from the previous rotation plus its remaining decrypt
    /// budget. Dropped once the budget reaches zero.
    retired: Option<(AeadKey, u32)>,
    /// Our side of an in-flight rotation, waiting for the peer's new key.
    pending_rotation: Option<StaticSecret>,
}

impl PeerSession {
    fn new(aead_key: AeadKey) -> Self {
        Self {
            aead_key,
            message_counter: 0,
            first_use: Instant::now(),
            first_use_unix: unix_now(),
            retired: None,
            pending_rotation: None,
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn derive_aead_key(shared_secret: &[u8]) -> AeadKey {
    let hk = Hkdf::<Sha256>::new(None, shared_secret);
    let mut okm = [0u8; KEY_LEN];
    hk.expand(HKDF_INFO, &mut okm)
        .expect("32 bytes is a valid HKDF-SHA256 output length");
    AeadKey(okm)
}

fn decode_public_key(b64: &str) -> Result<PublicKey, CryptoError> {
    let bytes = B64.decode(b64).map_err(|_| CryptoError::InvalidPublicKey)?;
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidPublicKey)?;
    Ok(PublicKey::from(bytes))
}

/// Owns the X25519 identity and all per-peer session state for a client.
///
/// The private half never leaves this struct for the process lifetime.
pub struct CryptoCore {
    secret: StaticSecret,
    public: PublicKey,
    policy: RotationPolicy,
    peers: HashMap<String, PeerSession>,
}

impl CryptoCore {
    /// Generate a fresh identity keypair.
    pub fn generate() -> Self {
        Self::with_policy(RotationPolicy::default())
    }

    pub fn with_policy(policy: RotationPolicy) -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self {
            secret,
            public,
            policy,
            peers: HashMap::new(),
        }
    }

    /// Our identity public key, base64.
    pub fn public_key_b64(&self) -> String {
        B64.encode(self.public.as_bytes())
    }

    /// Install (or replace) a peer's public key and derive the session key.
    pub fn install_peer(&mut self, peer_id: &str, public_key_b64: &str) -> Result<(), CryptoError> {
        let peer_public = decode_public_key(public_key_b64)?;
        let mut shared = self.secret.diffie_hellman(&peer_public).to_bytes();
        let key = derive_aead_key(&shared);
        shared.zeroize();
        self.peers.insert(peer_id.to_string(), PeerSession::new(key));
        Ok(())
    }

    pub fn has_peer(&self, peer_id: &str) -> bool {
        self.peers.contains_key(peer_id)
    }

    /// Drop all session state for a peer (disconnect path).
    pub fn remove_peer(&mut self, peer_id: &str) {
        self.peers.remove(peer_id);
    }

    /// Encrypt for a peer. Returns `(ciphertext_b64, nonce_b64)` where the
    /// ciphertext carries the Poly1305 tag appended.
    pub fn encrypt(
        &mut self,
        peer_id: &str,
        plaintext: &[u8],
    ) -> Result<(String, String), CryptoError> {
        let session = self
            .peers
            .get_mut(peer_id)
            .ok_or_else(|| CryptoError::NoEncryptionKey(peer_id.to_string()))?;
        let (ciphertext, nonce) = session.aead_key.seal(plaintext);
        session.message_counter += 1;
        Ok((B64.encode(ciphertext), B64.encode(nonce)))
    }

    /// Decrypt from a peer. Tries the current key first; during a rekey
    /// grace window a failed decrypt is retried once against the retired key.
    pub fn decrypt(
        &mut self,
        peer_id: &str,
        ciphertext_b64: &str,
        nonce_b64: &str,
    ) -> Result<Vec<u8>, CryptoError> {
        let session = self
            .peers
            .get_mut(peer_id)
            .ok_or_else(|| CryptoError::NoEncryptionKey(peer_id.to_string()))?;
        let ciphertext = B64
            .decode(ciphertext_b64)
            .map_err(|_| CryptoError::DecryptFailure)?;
        let nonce = B64.decode(nonce_b64).map_err(|_| CryptoError::DecryptFailure)?;

        match session.aead_key.open(&ciphertext, &nonce) {
            Ok(plaintext) => Ok(plaintext),
            Err(_) => {
                if let Some((old_key, remaining)) = session.retired.as_mut() {
                    if *remaining > 0 {
                        if let Ok(plaintext) = old_key.open(&ciphertext, &nonce) {
                            *remaining -= 1;
                            if *remaining == 0 {
                                session.retired = None;
                            }
                            return Ok(plaintext);
                        }
                    }
                }
                Err(CryptoError::DecryptFailure)
            }
        }
    }

    /// Check whether the session with `peer_id` should be rekeyed.
    pub fn rotation_needed(&self, peer_id: &str) -> Result<Rotation, CryptoError> {
        let session = self
            .peers
            .get(peer_id)
            .ok_or_else(|| CryptoError::NoEncryptionKey(peer_id.to_string()))?;
        if session.message_counter >= self.policy.max_messages {
            Ok(Rotation::Count)
        } else if session.first_use.elapsed() >= self.policy.interval {
            Ok(Rotation::Time)
        } else {
            Ok(Rotation::None)
        }
    }

    /// Start a rotation with a peer: generate a fresh keypair scoped to this
    /// peer and return its public half for the `rekey_request`/`rekey_response`
    /// frame. The existing session keeps working until [`complete_rotation`].
    ///
    /// [`complete_rotation`]: CryptoCore::complete_rotation
    pub fn begin_rotation(&mut self, peer_id: &str) -> Result<String, CryptoError> {
        let session = self
            .peers
            .get_mut(peer_id)
            .ok_or_else(|| CryptoError::NoEncryptionKey(peer_id.to_string()))?;
        let fresh = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&fresh);
        session.pending_rotation = Some(fresh);
        Ok(B64.encode(public.as_bytes()))
    }

    /// Finish a rotation with the peer's new public key: install the new
    /// session key, reset the counter and age, and retire the old key with a
    /// bounded decrypt budget.
    pub fn complete_rotation(
        &mut self,
        peer_id: &str,
        remote_new_public_key_b64: &str,
    ) -> Result<(), CryptoError> {
        let remote_public = decode_public_key(remote_new_public_key_b64)?;
        let session = self
            .peers
            .get_mut(peer_id)
            .ok_or_else(|| CryptoError::NoEncryptionKey(peer_id.to_string()))?;
        let fresh = session
            .pending_rotation
            .take()
            .ok_or_else(|| CryptoError::RotationPeerUnavailable(peer_id.to_string()))?;
        let mut shared = fresh.diffie_hellman(&remote_public).to_bytes();
        let new_key = derive_aead_key(&shared);
        shared.zeroize();
        let old_key = std::mem::replace(&mut session.aead_key, new_key);
        session.retired = Some((old_key, REKEY_GRACE_DECRYPTS));
        session.message_counter = 0;
        session.first_use = Instant::now();
        session.first_use_unix = unix_now();
        Ok(())
    }

    /// Messages encrypted to this peer since the last rotation.
    pub fn message_counter(&self, peer_id: &str) -> Option<u64> {
        self.peers.get(peer_id).map(|s| s.message_counter)
    }

    /// Unix time the current session key was first installed.
    pub fn session_established_at(&self, peer_id: &str) -> Option<u64> {
        self.peers.get(peer_id).map(|s| s.first_use_unix)
    }
}

/// Symmetric channel keys. All members of a channel hold byte-identical key
/// material; the first joiner creates it and distributes it peer-encrypted.
#[derive(Default)]
pub struct ChannelCrypto {
    keys: HashMap<String, AeadKey>,
}

impl ChannelCrypto {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a fresh 32-byte key for a channel and return it base64.
    pub fn create_channel_key(&mut self, channel: &str) -> String {
        let mut key = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut key);
        let b64 = B64.encode(key);
        self.keys.insert(channel.to_string(), AeadKey(key));
        b64
    }

    /// Install a key received from another member. The first installed key
    /// wins: re-installing identical bytes is a no-op, and a differing key
    /// for a channel we already have is ignored (returns `false`).
    pub fn install_channel_key(
        &mut self,
        channel: &str,
        key_b64: &str,
    ) -> Result<bool, CryptoError> {
        let bytes = B64.decode(key_b64).map_err(|_| CryptoError::InvalidKey)?;
        let bytes: [u8; KEY_LEN] = bytes.try_into().map_err(|_| CryptoError::InvalidKey)?;
        match self.keys.get(channel) {
            Some(existing) => Ok(existing.0 == bytes),
            None => {
                self.keys.insert(channel.to_string(), AeadKey(bytes));
                Ok(true)
            }
        }
    }

    pub fn has_channel_key(&self, channel: &str) -> bool {
        self.keys.contains_key(channel)
    }

    /// The channel key base64, for re-distribution to a new joiner.
    pub fn channel_key_b64(&self, channel: &str) -> Option<String> {
        self.keys.get(channel).map(|k| B64.encode(k.0))
    }

    pub fn remove_channel(&mut self, channel: &str) {
        self.keys.remove(channel);
    }

    pub fn encrypt_channel(
        &self,
        channel: &str,
        plaintext: &[u8],
    ) -> Result<(String, String), CryptoError> {
        let key = self
            .keys
            .get(channel)
            .ok_or_else(|| CryptoError::NoChannelKey(channel.to_string()))?;
        let (ciphertext, nonce) = key.seal(plaintext);
        Ok((B64.encode(ciphertext), B64.encode(nonce)))
    }

    pub fn decrypt_channel(
        &self,
        channel: &str,
        ciphertext_b64: &str,
        nonce_b64: &str,
    ) -> Result<Vec<u8>, CryptoError> {
        let key = self
            .keys
            .get(channel)
            .ok_or_else(|| CryptoError::NoChannelKey(channel.to_string()))?;
        let ciphertext = B64
            .decode(ciphertext_b64)
            .map_err(|_| CryptoError::DecryptFailure)?;
        let nonce = B64.decode(nonce_b64).map_err(|_| CryptoError::DecryptFailure)?;
        key.open(&ciphertext, &nonce)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn paired_cores() -> (CryptoCore, CryptoCore) {
        let mut alice = CryptoCore::generate();
        let mut bob = CryptoCore::generate();
        alice.install_peer("bob", &bob.public_key_b64()).unwrap();
        bob.install_peer("alice", &alice.public_key_b64()).unwrap();
        (alice, bob)
    }

    #[test]
    fn roundtrip_both_directions() {
        let (mut alice, mut bob) = paired_cores();
        let (ct, nonce) = alice.encrypt("bob", b"hi").unwrap();
        assert_eq!(bob.decrypt("alice", &ct, &nonce).unwrap(), b"hi");
        let (ct, nonce) = bob.encrypt("alice", b"hello back").unwrap();
        assert_eq!(alice.decrypt("bob", &ct, &nonce).unwrap(), b"hello back");
    }

    #[test]
    fn roundtrip_edge_sizes() {
        let (mut alice, mut bob) = paired_cores();
        let big = vec![0x5au8; 70 * 1024];
        for plaintext in [&b""[..], &b"x"[..], big.as_slice()] {
            let (ct, nonce) = alice.encrypt("bob", plaintext).unwrap();
            assert_eq!(bob.decrypt("alice", &ct, &nonce).unwrap(), plaintext);
        }
    }

    #[test]
    fn ciphertext_carries_tag() {
        let (mut alice, _) = paired_cores();
        let (ct, _) = alice.encrypt("bob", b"abc").unwrap();
        let raw = B64.decode(ct).unwrap();
        assert_eq!(raw.len(), 3 + 16);
    }

    #[test]
    fn unknown_peer_is_an_error() {
        let mut core = CryptoCore::generate();
        assert!(matches!(
            core.encrypt("nobody", b"x"),
            Err(CryptoError::NoEncryptionKey(_))
        ));
        assert!(matches!(
            core.decrypt("nobody", "aa", "bb"),
            Err(CryptoError::NoEncryptionKey(_))
        ));
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let (mut alice, mut bob) = paired_cores();
        let (ct, nonce) = alice.encrypt("bob", b"secret").unwrap();
        let mut raw = B64.decode(&ct).unwrap();
        raw[0] ^= 0xff;
        let tampered = B64.encode(raw);
        assert!(matches!(
            bob.decrypt("alice", &tampered, &nonce),
            Err(CryptoError::DecryptFailure)
        ));
    }

    #[test]
    fn truncated_ciphertext_fails() {
        let (mut alice, mut bob) = paired_cores();
        let (ct, nonce) = alice.encrypt("bob", b"secret").unwrap();
        let raw = B64.decode(&ct).unwrap();
        let truncated = B64.encode(&raw[..raw.len() - 1]);
        assert!(bob.decrypt("alice", &truncated, &nonce).is_err());
    }

    #[test]
    fn nonces_are_unique() {
        let (mut alice, _) = paired_cores();
        let mut seen = HashSet::new();
        for _ in 0..10_000 {
            let (_, nonce) = alice.encrypt("bob", b"m").unwrap();
            assert!(seen.insert(nonce));
        }
    }

    #[test]
    fn counter_tracks_encrypts_and_resets_on_rotation() {
        let (mut alice, mut bob) = paired_cores();
        for _ in 0..5 {
            alice.encrypt("bob", b"m").unwrap();
        }
        assert_eq!(alice.message_counter("bob"), Some(5));

        let a_new = alice.begin_rotation("bob").unwrap();
        let b_new = bob.begin_rotation("alice").unwrap();
        alice.complete_rotation("bob", &b_new).unwrap();
        bob.complete_rotation("alice", &a_new).unwrap();
        assert_eq!(alice.message_counter("bob"), Some(0));
    }

    #[test]
    fn rotation_needed_by_count() {
        let mut alice = CryptoCore::with_policy(RotationPolicy {
            interval: Duration::from_secs(3600),
            max_messages: 3,
        });
        let bob = CryptoCore::generate();
        alice.install_peer("bob", &bob.public_key_b64()).unwrap();
        assert_eq!(alice.rotation_needed("bob").unwrap(), Rotation::None);
        for _ in 0..3 {
            alice.encrypt("bob", b"m").unwrap();
        }
        assert_eq!(alice.rotation_needed("bob").unwrap(), Rotation::Count);
    }

    #[test]
    fn rotation_needed_by_time() {
        let mut alice = CryptoCore::with_policy(RotationPolicy {
            interval: Duration::ZERO,
            max_messages: 10_000,
        });
        let bob = CryptoCore::generate();
        alice.install_peer("bob", &bob.public_key_b64()).unwrap();
        assert_eq!(alice.rotation_needed("bob").unwrap(), Rotation::Time);
    }

    #[test]
    fn rekey_full_handshake() {
        let (mut alice, mut bob) = paired_cores();

        // Ciphertext from before the rotation, still in flight.
        let (old_ct, old_nonce) = alice.encrypt("bob", b"in flight").unwrap();

        let a_new = alice.begin_rotation("bob").unwrap();
        // Bob receives rekey_request{a_new}, answers with his own fresh key.
        let b_new = bob.begin_rotation("alice").unwrap();
        bob.complete_rotation("alice", &a_new).unwrap();
        alice.complete_rotation("bob", &b_new).unwrap();

        // In-flight old-key traffic drains within the grace window.
        assert_eq!(bob.decrypt("alice", &old_ct, &old_nonce).unwrap(), b"in flight");

        // New-key traffic works both ways.
        let (ct, nonce) = alice.encrypt("bob", b"post rekey").unwrap();
        assert_eq!(bob.decrypt("alice", &ct, &nonce).unwrap(), b"post rekey");
        let (ct, nonce) = bob.encrypt("alice", b"ack").unwrap();
        assert_eq!(alice.decrypt("bob", &ct, &nonce).unwrap(), b"ack");
    }

    #[test]
    fn old_key_rejected_after_grace_window() {
        let (mut alice, mut bob) = paired_cores();

        // Pre-rotation ciphertexts: one more than the grace budget.
        let backlog: Vec<_> = (0..=REKEY_GRACE_DECRYPTS)
            .map(|_| alice.encrypt("bob", b"old").unwrap())
            .collect();

        let a_new = alice.begin_rotation("bob").unwrap();
        let b_new = bob.begin_rotation("alice").unwrap();
        bob.complete_rotation("alice", &a_new).unwrap();
        alice.complete_rotation("bob", &b_new).unwrap();

        for (ct, nonce) in &backlog[..REKEY_GRACE_DECRYPTS as usize] {
            assert_eq!(bob.decrypt("alice", ct, nonce).unwrap(), b"old");
        }
        let (ct, nonce) = &backlog[REKEY_GRACE_DECRYPTS as usize];
        assert!(matches!(
            bob.decrypt("alice", ct, nonce),
            Err(CryptoError::DecryptFailure)
        ));
    }

    #[test]
    fn complete_without_begin_is_an_error() {
        let (mut alice, bob) = paired_cores();
        assert!(matches!(
            alice.complete_rotation("bob", &bob.public_key_b64()),
            Err(CryptoError::RotationPeerUnavailable(_))
        ));
    }

    #[test]
    fn install_peer_replaces_session() {
        let (mut alice, mut bob) = paired_cores();
        let (ct, nonce) = alice.encrypt("bob", b"before").unwrap();
        // Bob re-installs Alice's key: the old session (same key material)
        // still decrypts, but the counter starts over.
        bob.install_peer("alice", &alice.public_key_b64()).unwrap();
        assert_eq!(bob.decrypt("alice", &ct, &nonce).unwrap(), b"before");
        assert_eq!(bob.message_counter("alice"), Some(0));
    }

    #[test]
    fn bad_public_key_rejected() {
        let mut core = CryptoCore::generate();
        assert!(core.install_peer("p", "not base64!!!").is_err());
        assert!(core.install_peer("p", &B64.encode([0u8; 16])).is_err());
    }

    #[test]
    fn channel_key_agreement() {
        let mut creator = ChannelCrypto::new();
        let key = creator.create_channel_key("#team");

        let mut joiner_a = ChannelCrypto::new();
        let mut joiner_b = ChannelCrypto::new();
        assert!(joiner_a.install_channel_key("#team", &key).unwrap());
        assert!(joiner_b.install_channel_key("#team", &key).unwrap());

        assert_eq!(creator.channel_key_b64("#team").unwrap(), key);
        assert_eq!(joiner_a.channel_key_b64("#team").unwrap(), key);
        assert_eq!(joiner_b.channel_key_b64("#team").unwrap(), key);

        let (ct, nonce) = joiner_a.encrypt_channel("#team", b"hello team").unwrap();
        assert_eq!(
            creator.decrypt_channel("#team", &ct, &nonce).unwrap(),
            b"hello team"
        );
        assert_eq!(
            joiner_b.decrypt_channel("#team", &ct, &nonce).unwrap(),
            b"hello team"
        );
    }

    #[test]
    fn first_channel_key_wins() {
        let mut crypto = ChannelCrypto::new();
        let first = crypto.create_channel_key("#team");
        let mut other = ChannelCrypto::new();
        let second = other.create_channel_key("#team");

        // Duplicate delivery of the same key is fine.
        assert!(crypto.install_channel_key("#team", &first).unwrap());
        // A conflicting key is not installed.
        assert!(!crypto.install_channel_key("#team", &second).unwrap());
        assert_eq!(crypto.channel_key_b64("#team").unwrap(), first);
    }

    #[test]
    fn channel_decrypt_requires_matching_key() {
        let mut a = ChannelCrypto::new();
        let mut b = ChannelCrypto::new();
        a.create_channel_key("#one");
        b.create_channel_key("#one");
        let (ct, nonce) = a.encrypt_channel("#one", b"secret").unwrap();
        assert!(matches!(
            b.decrypt_channel("#one", &ct, &nonce),
            Err(CryptoError::DecryptFailure)
        ));
        assert!(matches!(
            b.decrypt_channel("#two", &ct, &nonce),
            Err(CryptoError::NoChannelKey(_))
        ));
    }
}
