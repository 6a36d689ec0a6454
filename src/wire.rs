//! Primitive framing shared by the handshake: 7-bit length-prefixed strings
//! (.NET `BinaryWriter`-style base-128 varint) and 32-bit little-endian
//! length-prefixed byte arrays.

use crate::error::{Error, Result};
use byteorder::{ByteOrder, LittleEndian};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Writes `len` as a base-128 varint: 7 data bits per byte, continuation bit
/// set on every byte but the last.
pub async fn write_7bit_string<W: AsyncWrite + Unpin>(w: &mut W, s: &str) -> Result<()> {
    let bytes = s.as_bytes();
    let mut len = bytes.len() as u32;
    loop {
        let mut b = (len & 0x7F) as u8;
        len >>= 7;
        if len != 0 {
            b |= 0x80;
            w.write_all(&[b]).await?;
        } else {
            w.write_all(&[b]).await?;
            break;
        }
    }
    w.write_all(bytes).await?;
    Ok(())
}

/// Mirrors [`write_7bit_string`].
pub async fn read_7bit_string<R: AsyncRead + Unpin>(r: &mut R) -> Result<String> {
    let mut len: u32 = 0;
    let mut shift = 0u32;
    loop {
        let mut byte = [0u8; 1];
        r.read_exact(&mut byte).await?;
        let b = byte[0];
        len |= ((b & 0x7F) as u32) << shift;
        if b & 0x80 == 0 {
            break;
        }
        shift += 7;
        if shift > 28 {
            return Err(Error::HandshakeProtocol(
                "7-bit length prefix overflowed u32".into(),
            ));
        }
    }
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf).await?;
    String::from_utf8(buf)
        .map_err(|e| Error::HandshakeProtocol(format!("invalid utf-8 in framed string: {e}")))
}

/// Writes a u32-LE length prefix followed by the raw bytes.
pub async fn write_length_prefixed<W: AsyncWrite + Unpin>(w: &mut W, data: &[u8]) -> Result<()> {
    let mut len_buf = [0u8; 4];
    LittleEndian::write_u32(&mut len_buf, data.len() as u32);
    w.write_all(&len_buf).await?;
    w.write_all(data).await?;
    Ok(())
}

/// Mirrors [`write_length_prefixed`].
pub async fn read_length_prefixed<R: AsyncRead + Unpin>(r: &mut R) -> Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    r.read_exact(&mut len_buf).await?;
    let len = LittleEndian::read_u32(&len_buf) as usize;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf).await?;
    Ok(buf)
}
