// panelbackup/src/utils/digest.rs
use md5::{Digest, Md5};
use sha2::Sha256;
use std::path::Path;
use tokio::fs::File;
use tokio::io::AsyncReadExt;

const READ_BUFFER: usize = 1024 * 1024;

async fn digest_file<D: Digest + Send>(path: &Path) -> std::io::Result<String> {
    let mut file = File::open(path).await?;
    let mut hasher = D::new();
    let mut buf = vec![0u8; READ_BUFFER];
    loop {
        let read = file.read(&mut buf).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Streams the file through SHA-256; used for the artifact checksum in the run report.
pub async fn sha256_file(path: &Path) -> std::io::Result<String> {
    digest_file::<Sha256>(path).await
}

/// Streams the file through MD5; both destination kinds report MD5-derived checksums.
pub async fn md5_file(path: &Path) -> std::io::Result<String> {
    digest_file::<Md5>(path).await
}

pub fn md5_bytes(data: &[u8]) -> [u8; 16] {
    Md5::digest(data).into()
}

/// ETag S3 assigns to a completed multipart upload: MD5 over the concatenated part MD5s, then `-<parts>`.
pub fn multipart_etag(part_digests: &[[u8; 16]]) -> String {
    let mut hasher = Md5::new();
    for digest in part_digests {
        hasher.update(digest);
    }
    format!("{}-{}", hex::encode(hasher.finalize()), part_digests.len())
}
