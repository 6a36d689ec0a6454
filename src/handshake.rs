//! The mutually-authenticated, forward-secret handshake a [`PeerConnection`]
//! runs once over a freshly-opened TCP stream before any sync traffic flows.
//!
//! Ed25519 identity keys authenticate each side; a fresh X25519 ECDH
//! exchange per connection gives forward secrecy; HKDF-SHA256 turns the ECDH
//! output into the session key the [`crate::session::EncryptedOverlay`]
//! consumes. See `crypto::mod` and `crypto::keys` for the primitives.

use crate::crypto::keys::{EphemeralKeyPair, ZeroizingKey};
use crate::crypto::{self, IdentityKeyPair};
use crate::error::{Error, Result};
use crate::wire::{read_7bit_string, read_length_prefixed, write_7bit_string, write_length_prefixed};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use std::collections::HashMap;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::warn;

const SECURE_HANDSHAKE_HEADER: &str = "SWARMSYNC-SECURE-HANDSHAKE-V1";
const HANDSHAKE_OK: &str = "HANDSHAKE_OK";
const HANDSHAKE_FAILED_PREFIX: &str = "HANDSHAKE_FAILED:";
const INVALID_SIGNATURE: &str = "INVALID_SIGNATURE";
const GENERIC_ERROR: &str = "GENERIC_ERROR";

/// Outcome of a successful handshake, surfaced to the server-side caller.
pub struct HandshakeOutcome {
    pub peer_id: String,
    pub peer_name: String,
    pub is_trusted: bool,
    pub session_key: ZeroizingKey,
}

fn signed_message(peer_id: &str, ephemeral_public: &[u8; 32]) -> Vec<u8> {
    let mut message = peer_id.as_bytes().to_vec();
    message.extend_from_slice(BASE64.encode(ephemeral_public).as_bytes());
    message
}

/// Runs the handshake as the accepting (server) side of a connection.
///
/// `trusted_peer_public_keys` maps peer id to the base64-encoded identity
/// public key this node expects for that peer; a mismatch or absence is
/// logged but does not abort the handshake — trust enforcement lives above
/// this layer.
pub async fn accept<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    trusted_peer_public_keys: &HashMap<String, String>,
) -> Result<HandshakeOutcome> {
    let header = read_7bit_string(stream).await?;
    if header != SECURE_HANDSHAKE_HEADER {
        send_failure(stream, GENERIC_ERROR).await?;
        return Err(Error::HandshakeProtocol(format!(
            "unexpected handshake header: {header}"
        )));
    }

    let peer_id = read_7bit_string(stream).await?;
    let peer_name = read_7bit_string(stream).await?;
    let client_ephemeral_public = read_length_prefixed(stream).await?;
    let client_identity_public = read_length_prefixed(stream).await?;
    let signature = read_length_prefixed(stream).await?;

    let client_ephemeral_public: [u8; 32] = client_ephemeral_public
        .try_into()
        .map_err(|_| Error::HandshakeProtocol("ephemeral public key must be 32 bytes".into()))?;
    let client_identity_public: [u8; 32] = client_identity_public
        .try_into()
        .map_err(|_| Error::HandshakeProtocol("identity public key must be 32 bytes".into()))?;

    let expected_message = signed_message(&peer_id, &client_ephemeral_public);
    if !crypto::verify_signature(&client_identity_public, &expected_message, &signature) {
        send_failure(stream, INVALID_SIGNATURE).await?;
        return Err(Error::HandshakeSignatureInvalid { peer_id });
    }

    let is_trusted = match trusted_peer_public_keys.get(&peer_id) {
        Some(expected_b64) => {
            let matches = BASE64
                .decode(expected_b64)
                .map(|expected| expected == client_identity_public)
                .unwrap_or(false);
            if !matches {
                warn!(%peer_id, "trusted key mismatch for peer");
            }
            matches
        }
        None => {
            warn!(%peer_id, "peer not present in trusted-keys table");
            false
        }
    };

    let mut server_ephemeral = EphemeralKeyPair::generate();
    let server_ephemeral_public = server_ephemeral.public_bytes();

    write_7bit_string(stream, HANDSHAKE_OK).await?;
    write_length_prefixed(stream, &server_ephemeral_public).await?;

    let shared = server_ephemeral
        .diffie_hellman(&client_ephemeral_public)
        .ok_or_else(|| Error::HandshakeProtocol("ephemeral secret already consumed".into()))?;
    let session_key = crypto::derive_session_key(&shared)?;

    Ok(HandshakeOutcome {
        peer_id,
        peer_name,
        is_trusted,
        session_key,
    })
}

/// Runs the handshake as the initiating (client) side of a connection.
pub async fn initiate<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    local_peer_id: &str,
    local_device_name: &str,
    local_identity: &IdentityKeyPair,
) -> Result<ZeroizingKey> {
    let mut client_ephemeral = EphemeralKeyPair::generate();
    let client_ephemeral_public = client_ephemeral.public_bytes();
    let message = signed_message(local_peer_id, &client_ephemeral_public);
    let signature = local_identity.sign(&message);

    write_7bit_string(stream, SECURE_HANDSHAKE_HEADER).await?;
    write_7bit_string(stream, local_peer_id).await?;
    write_7bit_string(stream, local_device_name).await?;
    write_length_prefixed(stream, &client_ephemeral_public).await?;
    write_length_prefixed(stream, &local_identity.public_bytes()).await?;
    write_length_prefixed(stream, &signature.to_bytes()).await?;

    let response = read_7bit_string(stream).await?;
    if response != HANDSHAKE_OK {
        let code = response
            .strip_prefix(HANDSHAKE_FAILED_PREFIX)
            .unwrap_or(&response)
            .to_string();
        return Err(Error::HandshakeProtocol(format!(
            "handshake rejected by peer: {code}"
        )));
    }

    let server_ephemeral_public = read_length_prefixed(stream).await?;
    let server_ephemeral_public: [u8; 32] = server_ephemeral_public
        .try_into()
        .map_err(|_| Error::HandshakeProtocol("server ephemeral public key must be 32 bytes".into()))?;

    let shared = client_ephemeral
        .diffie_hellman(&server_ephemeral_public)
        .ok_or_else(|| Error::HandshakeProtocol("ephemeral secret already consumed".into()))?;
    crypto::derive_session_key(&shared)
}

async fn send_failure<S: AsyncWrite + Unpin>(stream: &mut S, code: &str) -> Result<()> {
    write_7bit_string(stream, &format!("{HANDSHAKE_FAILED_PREFIX}{code}")).await
}
