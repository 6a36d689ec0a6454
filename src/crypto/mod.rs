//! Cryptographic identity and session-key derivation for the sync node.
//!
//! Two keypair kinds are used: a long-lived Ed25519 identity keypair per
//! node (signs handshake messages) and short-lived X25519 ephemeral
//! keypairs per connection (see [`keys::EphemeralKeyPair`]), combined via
//! HKDF-SHA256 into a session key that is never persisted.

pub mod keys;

use crate::error::{Error, Result};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hkdf::Hkdf;
use keys::{SharedSecret, ZeroizingKey};
use rand::rngs::OsRng;
use sha2::Sha256;

/// Domain separation label for session-key derivation; ties the derived key
/// to this protocol so the same ECDH output can never be confused with key
/// material from an unrelated use.
const SESSION_KEY_CONTEXT: &[u8] = b"swarmsync-handshake-session-key-v1";

/// A node's long-lived signing identity.
pub struct IdentityKeyPair {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
}

impl IdentityKeyPair {
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        let verifying_key = signing_key.verifying_key();
        Self {
            signing_key,
            verifying_key,
        }
    }

    pub fn from_bytes(secret: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(secret);
        let verifying_key = signing_key.verifying_key();
        Self {
            signing_key,
            verifying_key,
        }
    }

    pub fn public_bytes(&self) -> [u8; 32] {
        self.verifying_key.to_bytes()
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }
}

/// Verifies a detached Ed25519 signature against a raw 32-byte public key.
/// Returns `false` (never panics) for malformed keys or signatures, since the
/// handshake path treats this purely as a boolean gate.
pub fn verify_signature(public_key: &[u8; 32], message: &[u8], signature: &[u8]) -> bool {
    let Ok(verifying_key) = VerifyingKey::from_bytes(public_key) else {
        return false;
    };
    let Ok(sig_bytes) = <[u8; 64]>::try_from(signature) else {
        return false;
    };
    let sig = Signature::from_bytes(&sig_bytes);
    verifying_key.verify(message, &sig).is_ok()
}

/// Derives a 32-byte session key from an ECDH shared secret via HKDF-SHA256,
/// domain-separated by [`SESSION_KEY_CONTEXT`].
pub fn derive_session_key(shared: &SharedSecret) -> Result<ZeroizingKey> {
    let hkdf = Hkdf::<Sha256>::new(None, shared.as_bytes());
    let mut key = [0u8; 32];
    hkdf.expand(SESSION_KEY_CONTEXT, &mut key)
        .map_err(|e| Error::HandshakeProtocol(format!("session key derivation failed: {e}")))?;
    Ok(ZeroizingKey(key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::EphemeralKeyPair;

    #[test]
    fn sign_and_verify_round_trip() {
        let identity = IdentityKeyPair::generate();
        let message = b"peer-id||base64(ephemeral-public-key)";
        let signature = identity.sign(message);
        assert!(verify_signature(
            &identity.public_bytes(),
            message,
            &signature.to_bytes()
        ));
    }

    #[test]
    fn tampered_message_fails_verification() {
        let identity = IdentityKeyPair::generate();
        let signature = identity.sign(b"original message");
        assert!(!verify_signature(
            &identity.public_bytes(),
            b"tampered message",
            &signature.to_bytes()
        ));
    }

    #[test]
    fn matching_ecdh_outputs_derive_identical_session_keys() {
        let mut client = EphemeralKeyPair::generate();
        let mut server = EphemeralKeyPair::generate();
        let client_public = client.public_bytes();
        let server_public = server.public_bytes();

        let client_shared = client.diffie_hellman(&server_public).unwrap();
        let server_shared = server.diffie_hellman(&client_public).unwrap();

        let client_key = derive_session_key(&client_shared).unwrap();
        let server_key = derive_session_key(&server_shared).unwrap();

        assert_eq!(client_key.0, server_key.0);
    }
}
