//! Ephemeral X25519 keypairs used for the per-connection Diffie-Hellman
//! exchange. Unlike a static identity keypair, these are generated fresh for
//! every handshake and never persisted.

use rand::rngs::OsRng;
use x25519_dalek::{EphemeralSecret, PublicKey};
use zeroize::Zeroize;

/// One side of an ephemeral ECDH exchange. `secret` is consumed (moved out)
/// by [`EphemeralKeyPair::diffie_hellman`], matching `x25519_dalek`'s
/// single-use `EphemeralSecret` API, which is what actually gives us forward
/// secrecy instead of a reusable scalar.
pub struct EphemeralKeyPair {
    secret: Option<EphemeralSecret>,
    pub public: PublicKey,
}

impl EphemeralKeyPair {
    pub fn generate() -> Self {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self {
            secret: Some(secret),
            public,
        }
    }

    pub fn public_bytes(&self) -> [u8; 32] {
        *self.public.as_bytes()
    }

    /// Consumes the ephemeral secret to compute the shared point. Returns
    /// `None` if called twice (the secret is gone after the first call).
    pub fn diffie_hellman(&mut self, their_public: &[u8; 32]) -> Option<SharedSecret> {
        let secret = self.secret.take()?;
        let their_public = PublicKey::from(*their_public);
        Some(SharedSecret(secret.diffie_hellman(&their_public)))
    }
}

/// Wraps the raw ECDH output; zeroized on drop so it never lingers after
/// session-key derivation.
pub struct SharedSecret(x25519_dalek::SharedSecret);

impl SharedSecret {
    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }
}

impl Drop for SharedSecret {
    fn drop(&mut self) {
        // x25519_dalek::SharedSecret zeroizes itself on drop; this impl
        // documents the invariant rather than duplicating the wipe.
    }
}

/// A 32-byte secret that is wiped from memory when dropped. Used for session
/// keys derived via HKDF and any other transient symmetric key material.
#[derive(Clone)]
pub struct ZeroizingKey(pub [u8; 32]);

impl Drop for ZeroizingKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl AsRef<[u8]> for ZeroizingKey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matching_ecdh_produces_identical_shared_secret() {
        let mut alice = EphemeralKeyPair::generate();
        let mut bob = EphemeralKeyPair::generate();

        let alice_public = alice.public_bytes();
        let bob_public = bob.public_bytes();

        let alice_shared = alice.diffie_hellman(&bob_public).unwrap();
        let bob_shared = bob.diffie_hellman(&alice_public).unwrap();

        assert_eq!(alice_shared.as_bytes(), bob_shared.as_bytes());
    }

    #[test]
    fn diffie_hellman_is_single_use() {
        let mut alice = EphemeralKeyPair::generate();
        let bob_public = EphemeralKeyPair::generate().public_bytes();

        assert!(alice.diffie_hellman(&bob_public).is_some());
        assert!(alice.diffie_hellman(&bob_public).is_none());
    }

    #[test]
    fn distinct_keypairs_yield_distinct_shared_secrets() {
        let mut a = EphemeralKeyPair::generate();
        let mut b = EphemeralKeyPair::generate();
        let mut c = EphemeralKeyPair::generate();

        let b_pub = b.public_bytes();
        let c_pub = c.public_bytes();

        let ab = a.diffie_hellman(&b_pub).unwrap();
        let mut a2 = EphemeralKeyPair::generate();
        let ac = a2.diffie_hellman(&c_pub).unwrap();

        assert_ne!(ab.as_bytes(), ac.as_bytes());
    }
}
