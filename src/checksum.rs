//! Streaming checksum computation.
//!
//! The digest algorithm travels with every checksum so that future archives
//! can switch to a stronger hash without invalidating old manifests.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};

use crate::error::{ArchiveError, Result};

/// Digest algorithm used for newly created archives.
pub const DEFAULT_ALGORITHM: &str = "sha256";

// 64 KiB keeps the read syscall count low without buffering whole files.
const CHUNK_SIZE: usize = 64 * 1024;

/// A content digest: the algorithm identifier plus the lowercase hex digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checksum {
    pub algorithm: String,
    pub hex: String,
}

impl std::fmt::Display for Checksum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hex)
    }
}

fn hash_reader<D: Digest, R: Read>(reader: &mut R) -> io::Result<String> {
    let mut hasher = D::new();
    let mut buf = [0u8; CHUNK_SIZE];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    let digest = hasher.finalize();
    Ok(digest.iter().map(|b| format!("{:02x}", b)).collect())
}

/// Compute the digest of a byte stream without ever holding the whole
/// stream in memory.
///
/// Fails with [`ArchiveError::Format`] if the algorithm is not known to
/// this build.
pub fn digest<R: Read>(algorithm: &str, reader: &mut R) -> Result<Checksum> {
    let hex = match algorithm {
        "sha256" => hash_reader::<Sha256, R>(reader)?,
        "sha512" => hash_reader::<Sha512, R>(reader)?,
        other => {
            return Err(ArchiveError::Format(format!(
                "unsupported checksum algorithm '{}'",
                other
            )))
        }
    };
    Ok(Checksum { algorithm: algorithm.to_string(), hex })
}

/// Compute the digest of a file's content.
pub fn digest_file(algorithm: &str, path: &Path) -> Result<Checksum> {
    let mut f = File::open(path).map_err(ArchiveError::io(path))?;
    digest(algorithm, &mut f)
}
