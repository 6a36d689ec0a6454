//! Streaming SHA-256 file hashing used by deep rescans and integrity checks.

use crate::error::{Error, Result};
use sha2::{Digest, Sha256};
use std::io::ErrorKind;
use std::path::Path;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::AsyncReadExt;

const MAX_TRANSIENT_RETRIES: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_millis(50);

fn is_transient(err: &std::io::Error) -> bool {
    matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted)
}

/// Streams the file's content through SHA-256, reading in chunks of
/// `buffer_size` bytes (`SyncNodeConfig::file_stream_buffer_size`), and
/// returns the digest as uppercase hex. Retries the whole read on a
/// transient I/O error a bounded number of times before surfacing
/// [`Error::HashIo`].
pub async fn hash_file(path: &Path, buffer_size: usize) -> Result<String> {
    let mut attempt = 0;
    loop {
        match try_hash_file(path, buffer_size).await {
            Ok(digest) => return Ok(digest),
            Err(err) if is_transient(&err) && attempt < MAX_TRANSIENT_RETRIES => {
                attempt += 1;
                tokio::time::sleep(RETRY_DELAY).await;
            }
            Err(err) => {
                return Err(Error::HashIo {
                    path: path.display().to_string(),
                    source: err,
                });
            }
        }
    }
}

async fn try_hash_file(path: &Path, buffer_size: usize) -> std::io::Result<String> {
    let mut file = File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; buffer_size];
    loop {
        let read = file.read(&mut buf).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hex::encode_upper(hasher.finalize()))
}
