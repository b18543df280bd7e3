//! # Hash & Chunk Engine
//!
//! Streaming digest and chunk access for the sender, plus the verification
//! helpers the receiver uses. The whole-file and per-chunk digests are
//! computed in one sequential pass; nothing here buffers more than a single
//! chunk.

use std::path::Path;

use sha2::{Digest, Sha256};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};

use crate::error::{Error, Result};
use crate::transfer::protocol::{chunk_count, Manifest, MANIFEST_SCHEMA};

/// Default chunk size: 256 KB.
pub const DEFAULT_CHUNK_SIZE: usize = 256 * 1024;

/// Lowercase hex SHA-256 of a byte slice.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Verify a chunk's bytes against an expected digest.
pub fn verify_chunk(data: &[u8], expected: &str) -> bool {
    sha256_hex(data) == expected
}

/// Build a manifest for `path` in a single streaming pass.
///
/// Reads the file chunk by chunk, feeding the whole-file hasher and recording
/// one digest per chunk. The file's length is taken from metadata up front;
/// a file that changes size mid-pass produces an inconsistent manifest, which
/// the receiver will reject.
pub async fn build_manifest(path: &Path, file_id: &str, chunk_size: usize) -> Result<Manifest> {
    if chunk_size == 0 {
        return Err(Error::InvalidChunkSize(chunk_size));
    }

    let metadata = tokio::fs::metadata(path)
        .await
        .map_err(|e| Error::Persistence(format!("stat {}: {}", path.display(), e)))?;
    let size = metadata.len();
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::FileNotFound(path.display().to_string()))?
        .to_string();

    let mut file = File::open(path)
        .await
        .map_err(|e| Error::Persistence(format!("open {}: {}", path.display(), e)))?;

    let total_chunks = chunk_count(size, chunk_size);
    let mut chunk_sha256 = Vec::with_capacity(total_chunks as usize);
    let mut file_hasher = Sha256::new();
    let mut buf = vec![0u8; chunk_size];

    loop {
        let read = read_up_to(&mut file, &mut buf).await?;
        if read == 0 {
            break;
        }
        file_hasher.update(&buf[..read]);
        chunk_sha256.push(hex::encode(Sha256::digest(&buf[..read])));
    }

    let content_type = mime_guess::from_path(path)
        .first_or_octet_stream()
        .essence_str()
        .to_string();

    Ok(Manifest {
        schema: MANIFEST_SCHEMA.to_string(),
        file_id: file_id.to_string(),
        name,
        size,
        chunk_size,
        total_chunks,
        file_sha256: hex::encode(file_hasher.finalize()),
        chunk_sha256,
        content_type,
        timestamp: chrono::Utc::now().timestamp(),
    })
}

/// Positional chunk access over the source file for the publish and retry
/// passes.
pub struct ChunkReader {
    file: File,
    chunk_size: usize,
    size: u64,
}

impl ChunkReader {
    /// Open `path` for chunk reads.
    pub async fn open(path: &Path, chunk_size: usize, size: u64) -> Result<Self> {
        if chunk_size == 0 {
            return Err(Error::InvalidChunkSize(chunk_size));
        }
        let file = File::open(path)
            .await
            .map_err(|e| Error::Persistence(format!("open {}: {}", path.display(), e)))?;
        Ok(Self {
            file,
            chunk_size,
            size,
        })
    }

    /// Byte length of chunk `index`, accounting for a short last chunk.
    pub fn chunk_len(&self, index: u32) -> usize {
        let start = index as u64 * self.chunk_size as u64;
        if start >= self.size {
            return 0;
        }
        (self.size - start).min(self.chunk_size as u64) as usize
    }

    /// Read the bytes of chunk `index`.
    pub async fn read_chunk(&mut self, index: u32) -> Result<Vec<u8>> {
        let len = self.chunk_len(index);
        if len == 0 {
            return Err(Error::Persistence(format!(
                "chunk index {} out of range",
                index
            )));
        }
        let offset = index as u64 * self.chunk_size as u64;
        self.file
            .seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| Error::Persistence(format!("seek to chunk {}: {}", index, e)))?;
        let mut buf = vec![0u8; len];
        self.file
            .read_exact(&mut buf)
            .await
            .map_err(|e| Error::Persistence(format!("read chunk {}: {}", index, e)))?;
        Ok(buf)
    }
}

/// Streaming whole-file SHA-256 of `path`.
pub async fn hash_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)
        .await
        .map_err(|e| Error::Persistence(format!("open {}: {}", path.display(), e)))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1024 * 1024];
    loop {
        let read = read_up_to(&mut file, &mut buf).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Fill `buf` as far as the file allows; returns 0 only at EOF.
async fn read_up_to(file: &mut File, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file
            .read(&mut buf[filled..])
            .await
            .map_err(|e| Error::Persistence(format!("read: {}", e)))?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
