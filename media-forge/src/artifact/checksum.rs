//! Content digests for artifacts.

use std::io::Read;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::{Error, Result};

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// SHA-256 and byte size of a file, or of every file under a directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentDigest {
    pub sha256: String,
    pub size_bytes: u64,
}

/// Digest `path` on the blocking pool.
///
/// Directories are hashed over their files in sorted relative-path order,
/// each entry contributing its relative path followed by its bytes.
pub async fn digest_path(path: &Path) -> Result<ContentDigest> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || digest_path_sync(&path))
        .await
        .map_err(|e| Error::Other(format!("checksum task failed: {}", e)))?
}

fn digest_path_sync(path: &Path) -> Result<ContentDigest> {
    let mut hasher = Sha256::new();
    let mut size_bytes = 0u64;

    if path.is_dir() {
        let mut files = Vec::new();
        collect_files(path, path, &mut files)?;
        files.sort();
        for relative in files {
            hasher.update(relative.to_string_lossy().as_bytes());
            size_bytes += hash_file(&path.join(&relative), &mut hasher)?;
        }
    } else {
        size_bytes = hash_file(path, &mut hasher)?;
    }

    Ok(ContentDigest {
        sha256: hex::encode(hasher.finalize()),
        size_bytes,
    })
}

fn collect_files(root: &Path, dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    let entries =
        std::fs::read_dir(dir).map_err(|e| Error::io_path("reading directory", dir, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| Error::io_path("reading directory", dir, e))?;
        let path = entry.path();
        if path.is_dir() {
            collect_files(root, &path, out)?;
        } else if let Ok(relative) = path.strip_prefix(root) {
            out.push(relative.to_path_buf());
        }
    }
    Ok(())
}

fn hash_file(path: &Path, hasher: &mut Sha256) -> Result<u64> {
    let mut file = std::fs::File::open(path).map_err(|e| Error::io_path("opening", path, e))?;
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        let n = file
            .read(&mut buffer)
            .map_err(|e| Error::io_path("reading", path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
        total += n as u64;
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_file_digest_matches_known_value() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.txt");
        std::fs::write(&file, b"abc").unwrap();
        let digest = digest_path(&file).await.unwrap();
        assert_eq!(
            digest.sha256,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(digest.size_bytes, 3);
    }

    #[tokio::test]
    async fn test_directory_digest_is_order_independent_of_creation() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        std::fs::write(a.path().join("1.png"), b"one").unwrap();
        std::fs::write(a.path().join("2.png"), b"two").unwrap();
        std::fs::write(b.path().join("2.png"), b"two").unwrap();
        std::fs::write(b.path().join("1.png"), b"one").unwrap();

        let da = digest_path(a.path()).await.unwrap();
        let db = digest_path(b.path()).await.unwrap();
        assert_eq!(da, db);
        assert_eq!(da.size_bytes, 6);
    }
}
