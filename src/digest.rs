//! Content digests used for feed change detection.
//!
//! Fingerprints are truncated SHA-256 hex strings. They are an equality
//! oracle ("did the input change since the last successful import?"),
//! not a security primitive, so the short length is fine.

use crate::error::Result;
use sha2::{Digest, Sha256};
use std::path::Path;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Length of a fingerprint in hex characters.
pub const DIGEST_LENGTH: usize = 6;

fn finish(hasher: Sha256) -> String {
    let mut hex = hex::encode(hasher.finalize());
    hex.truncate(DIGEST_LENGTH);
    hex
}

/// Fingerprint of an in-memory string.
pub fn digest_str(s: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(s.as_bytes());
    finish(hasher)
}

/// Fingerprint of a byte stream, consumed to completion.
pub async fn digest_bytes<R>(mut reader: R) -> Result<String>
where
    R: AsyncRead + Unpin,
{
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(finish(hasher))
}

/// Fingerprint of a file's contents, read in chunks.
pub async fn digest_file(path: &Path) -> Result<String> {
    let file = tokio::fs::File::open(path).await?;
    digest_bytes(file).await
}

/// Combined fingerprint of an ordered set of files.
///
/// Each file is digested independently, the fingerprints are concatenated
/// in the given order, and the concatenation is digested again. The order
/// is the caller's responsibility (lexicographic filename sort by default).
pub async fn digest_files(paths: &[std::path::PathBuf]) -> Result<String> {
    let mut concatenated = String::with_capacity(paths.len() * DIGEST_LENGTH);
    for path in paths {
        concatenated.push_str(&digest_file(path).await?);
    }
    Ok(digest_str(&concatenated))
}

/// Fold an extra fingerprint into a base fingerprint.
pub fn combine(base: &str, extra: &str) -> String {
    digest_str(&format!("{}{}", base, extra))
}
