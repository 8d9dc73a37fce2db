use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, BufReader};
use sha2::{Sha256, Digest};

use crate::error::{Error, Result};

/// Compute the hex SHA-256 of a file.
pub async fn sha256_sum(path: &Path) -> Result<String> {
    let file = File::open(path).await?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buffer).await?;
        if n == 0 { break; }
        hasher.update(&buffer[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Check `path` against an advertised digest; comparison ignores case.
pub async fn verify_sha256(path: &Path, expected: &str) -> Result<()> {
    let actual = sha256_sum(path).await?;
    if actual.eq_ignore_ascii_case(expected.trim()) {
        Ok(())
    } else {
        Err(Error::Integrity { expected: expected.to_string(), actual })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn digest_of_known_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("abc.txt");
        tokio::fs::write(&path, b"abc").await.unwrap();

        let expected = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";
        assert_eq!(sha256_sum(&path).await.unwrap(), expected);
        assert!(verify_sha256(&path, &expected.to_uppercase()).await.is_ok());
        assert!(matches!(
            verify_sha256(&path, "00").await,
            Err(Error::Integrity { .. })
        ));
    }
}
