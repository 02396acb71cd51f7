// kiln-aio/src/checksum.rs
use std::path::Path;

use kiln_common::error::Result;
use sha2::{Digest, Sha256};
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tracing::debug;

/// Computes the lowercase hex SHA-256 of a file, streaming it in chunks.
pub async fn sha256_file_async(path: &Path) -> Result<String> {
    let mut file = File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 64 * 1024];
    let mut total_bytes_read: u64 = 0;

    loop {
        let n = file.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
        total_bytes_read += n as u64;
    }

    let actual = hex::encode(hasher.finalize());
    debug!(
        "Calculated SHA256 for {}: {} ({} bytes read)",
        path.display(),
        actual,
        total_bytes_read
    );
    Ok(actual)
}

pub fn sha256_file_sync(path: &Path) -> Result<String> {
    let std_file = std::fs::File::open(path)?;
    let mut std_reader = std::io::BufReader::new(std_file);
    let mut hasher = Sha256::new();
    std::io::copy(&mut std_reader, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

/// Digests are compared case-insensitively. This is an integrity check, so
/// constant-time comparison is not needed.
pub fn digest_matches(actual: &str, expected: &str) -> bool {
    actual.eq_ignore_ascii_case(expected)
}

#[cfg(test)]
mod tests {
    use super::*;

    // sha256("hello\n")
    const HELLO: &str = "5891b5b522d5df086d0ff0b110fbd9d21bb4fc7163af34d08286a2e846f6be03";

    #[tokio::test]
    async fn hashes_file_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hello.txt");
        std::fs::write(&path, b"hello\n").unwrap();

        assert_eq!(sha256_file_async(&path).await.unwrap(), HELLO);
        assert_eq!(sha256_file_sync(&path).unwrap(), HELLO);
        assert!(digest_matches(HELLO, &HELLO.to_uppercase()));
        assert!(!digest_matches(HELLO, &"0".repeat(64)));
    }
}
