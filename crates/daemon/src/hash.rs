//! Content hashing for change detection.
//!
//! Every observed file is identified by the SHA-256 digest of its bytes. The
//! digest is what decides whether a known path needs to be compressed again.

use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

const READ_BUFFER_BYTES: usize = 64 * 1024;

/// Compute the lowercase hex SHA-256 digest of the file at `path`.
///
/// Always reads the full file from disk; retrying a failed read is up to the
/// caller.
pub fn compute_hash(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; READ_BUFFER_BYTES];

    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Hash a file on the blocking pool so async callers are not stalled.
pub async fn compute_hash_async(path: PathBuf) -> io::Result<String> {
    tokio::task::spawn_blocking(move || compute_hash(&path))
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, format!("hash task failed: {}", e)))?
}
