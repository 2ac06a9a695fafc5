use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, BufReader};
use sha2::{Digest, Sha256, Sha512};
use thiserror::Error;

use crate::models::HashAlgorithm;

#[derive(Debug, Error)]
pub enum IntegrityError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Compute the lowercase hex digest of a file asynchronously.
pub async fn file_digest(path: &Path, algorithm: HashAlgorithm) -> Result<String, IntegrityError> {
    match algorithm {
        HashAlgorithm::Md5 => digest_with::<md5::Md5>(path).await,
        HashAlgorithm::Sha1 => digest_with::<sha1::Sha1>(path).await,
        HashAlgorithm::Sha256 => digest_with::<Sha256>(path).await,
        HashAlgorithm::Sha512 => digest_with::<Sha512>(path).await,
    }
}

async fn digest_with<D: Digest>(path: &Path) -> Result<String, IntegrityError> {
    let file = File::open(path).await?;
    let mut reader = BufReader::new(file);
    let mut hasher = D::new();
    let mut buffer = [0u8; 1024 * 8];
    loop {
        let n = reader.read(&mut buffer).await?;
        if n == 0 { break; }
        hasher.update(&buffer[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}
