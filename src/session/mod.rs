//! The authenticated-encryption overlay a [`PeerConnection`](crate::transport::PeerConnection)
//! switches to once the secure handshake completes.
//!
//! Concretely: a length-prefixed ChaCha20-Poly1305 AEAD stream. Each logical
//! write is one frame `u32-LE length || 12-byte nonce || ciphertext || 16-byte
//! tag`. This is a deliberate implementation choice for a swappable wire
//! record format the surrounding contract only specifies via its session-key
//! output (see DESIGN.md) — not a mandated format.
//!
//! The two directions of a connection use independently-keyed ChaCha20Poly1305
//! instances (derived from the shared session key with distinct HKDF context
//! labels) so a client-to-server nonce can never collide with a
//! server-to-client nonce under the same key.

use crate::crypto::keys::ZeroizingKey;
use crate::error::{Error, Result};
use byteorder::{ByteOrder, LittleEndian};
use chacha20poly1305::{AeadInPlace, ChaCha20Poly1305, Key, KeyInit, Nonce};
use hkdf::Hkdf;
use sha2::Sha256;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const CLIENT_TO_SERVER_LABEL: &[u8] = b"swarmsync-overlay-c2s-v1";
const SERVER_TO_CLIENT_LABEL: &[u8] = b"swarmsync-overlay-s2c-v1";
const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

fn derive_directional_key(session_key: &ZeroizingKey, label: &[u8]) -> [u8; 32] {
    let hkdf = Hkdf::<Sha256>::new(None, session_key.as_ref());
    let mut key = [0u8; 32];
    hkdf.expand(label, &mut key)
        .expect("32 bytes is a valid HKDF-SHA256 output length");
    key
}

fn encode_nonce(counter: u64) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    LittleEndian::write_u64(&mut nonce[..8], counter);
    nonce
}

/// Wraps a plain TCP stream with the ChaCha20-Poly1305 framed overlay once a
/// session key has been established. Once constructed, all reads/writes on
/// the underlying stream must go through this wrapper — there is no
/// downgrade path back to plaintext.
pub struct EncryptedOverlay<S> {
    stream: S,
    send_cipher: ChaCha20Poly1305,
    send_counter: u64,
    recv_cipher: ChaCha20Poly1305,
}

impl<S: AsyncRead + AsyncWrite + Unpin> EncryptedOverlay<S> {
    /// `is_client` selects which derived directional key this side sends
    /// with and which it receives with.
    pub fn new(stream: S, session_key: &ZeroizingKey, is_client: bool) -> Self {
        let (send_label, recv_label) = if is_client {
            (CLIENT_TO_SERVER_LABEL, SERVER_TO_CLIENT_LABEL)
        } else {
            (SERVER_TO_CLIENT_LABEL, CLIENT_TO_SERVER_LABEL)
        };

        let send_cipher = ChaCha20Poly1305::new(Key::from_slice(&derive_directional_key(
            session_key,
            send_label,
        )));
        let recv_cipher = ChaCha20Poly1305::new(Key::from_slice(&derive_directional_key(
            session_key,
            recv_label,
        )));

        Self {
            stream,
            send_cipher,
            send_counter: 0,
            recv_cipher,
        }
    }

    /// Encrypts and writes one frame.
    pub async fn write_frame(&mut self, plaintext: &[u8]) -> Result<()> {
        if self.send_counter == u64::MAX {
            return Err(Error::Unexpected(
                "encrypted overlay nonce counter exhausted".into(),
            ));
        }
        let nonce_bytes = encode_nonce(self.send_counter);
        self.send_counter += 1;
        let nonce = Nonce::from_slice(&nonce_bytes);

        let mut buffer = plaintext.to_vec();
        let tag = self
            .send_cipher
            .encrypt_in_place_detached(nonce, b"", &mut buffer)
            .map_err(|e| Error::Unexpected(format!("overlay encryption failed: {e}")))?;

        let frame_len = (12 + buffer.len() + 16) as u32;
        let mut len_buf = [0u8; 4];
        LittleEndian::write_u32(&mut len_buf, frame_len);

        self.stream.write_all(&len_buf).await?;
        self.stream.write_all(&nonce_bytes).await?;
        self.stream.write_all(&buffer).await?;
        self.stream.write_all(&tag).await?;
        Ok(())
    }

    /// Reads and decrypts one frame.
    pub async fn read_frame(&mut self) -> Result<Vec<u8>> {
        let mut len_buf = [0u8; 4];
        self.stream.read_exact(&mut len_buf).await?;
        let frame_len = LittleEndian::read_u32(&len_buf);
        if frame_len > MAX_FRAME_LEN || (frame_len as usize) < 12 + 16 {
            return Err(Error::HandshakeProtocol(format!(
                "invalid overlay frame length {frame_len}"
            )));
        }

        let mut frame = vec![0u8; frame_len as usize];
        self.stream.read_exact(&mut frame).await?;

        let nonce_bytes = &frame[..12];
        let ciphertext_end = frame.len() - 16;
        let tag_bytes = &frame[ciphertext_end..];
        let mut buffer = frame[12..ciphertext_end].to_vec();

        let nonce = Nonce::from_slice(nonce_bytes);
        self.recv_cipher
            .decrypt_in_place_detached(nonce, b"", &mut buffer, tag_bytes.into())
            .map_err(|e| Error::Unexpected(format!("overlay decryption failed: {e}")))?;

        Ok(buffer)
    }
}
