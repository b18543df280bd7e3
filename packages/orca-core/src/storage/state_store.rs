//! # Persistent Receiver State
//!
//! Each transfer owns a directory under the storage root:
//!
//! ```text
//! <root>/<file_id>/state.json       # manifest fields + received set + flags
//! <root>/<file_id>/<original-name>  # reconstructed data file
//! ```
//!
//! `state.json` is rewritten on every mutation via write-to-temp + rename so
//! a crash mid-write can never zero the file. Chunk bytes are written
//! positionally at `index * chunk_size`; writes past the current end extend
//! the file.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncSeekExt, AsyncWriteExt, SeekFrom};

use crate::error::{Error, Result};
use crate::transfer::protocol::Manifest;

// ============================================================================
// TRANSFER STATE
// ============================================================================

/// Durable per-transfer state, mirrored to `state.json`.
///
/// Manifest fields are `None` until the manifest arrives and are immutable
/// once committed. `received` holds verified chunk indices; `BTreeSet` keeps
/// it sorted and duplicate-free on disk as well.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferState {
    /// Transfer id this state belongs to.
    pub file_id: String,
    /// Original filename from the manifest.
    pub name: Option<String>,
    /// Total byte count from the manifest.
    pub size: Option<u64>,
    /// Chunk stride from the manifest.
    pub chunk_size: Option<usize>,
    /// Total chunk count from the manifest.
    pub total_chunks: Option<u32>,
    /// Whole-file digest from the manifest.
    pub file_sha256: Option<String>,
    /// Per-chunk digests from the manifest.
    pub chunk_sha256: Option<Vec<String>>,
    /// Informational MIME type from the manifest.
    pub content_type: Option<String>,
    /// Manifest creation time, seconds since epoch.
    pub timestamp: Option<i64>,
    /// Verified chunk indices.
    pub received: BTreeSet<u32>,
    /// All chunks received and the whole-file digest verified.
    pub complete: bool,
    /// Terminal ack has been published.
    pub ack_sent: bool,
}

impl TransferState {
    /// Fresh state for a transfer whose manifest has not arrived yet.
    pub fn new(file_id: &str) -> Self {
        Self {
            file_id: file_id.to_string(),
            name: None,
            size: None,
            chunk_size: None,
            total_chunks: None,
            file_sha256: None,
            chunk_sha256: None,
            content_type: None,
            timestamp: None,
            received: BTreeSet::new(),
            complete: false,
            ack_sent: false,
        }
    }

    /// Whether the manifest fields have been committed.
    pub fn has_manifest(&self) -> bool {
        self.chunk_size.is_some() && self.total_chunks.is_some()
    }

    /// Commit manifest fields. Once committed they are immutable for this
    /// `file_id`; a duplicate manifest is ignored.
    ///
    /// Returns whether the fields were newly committed.
    pub fn commit_manifest(&mut self, manifest: &Manifest) -> bool {
        if self.has_manifest() {
            return false;
        }
        self.name = Some(manifest.name.clone());
        self.size = Some(manifest.size);
        self.chunk_size = Some(manifest.chunk_size);
        self.total_chunks = Some(manifest.total_chunks);
        self.file_sha256 = Some(manifest.file_sha256.clone());
        self.chunk_sha256 = Some(manifest.chunk_sha256.clone());
        self.content_type = Some(manifest.content_type.clone());
        self.timestamp = Some(manifest.timestamp);
        true
    }

    /// Record a verified chunk. Returns `false` for duplicates.
    pub fn mark_received(&mut self, index: u32) -> bool {
        self.received.insert(index)
    }

    /// Whether every chunk index has been received.
    pub fn is_fully_received(&self) -> bool {
        match self.total_chunks {
            Some(total) => self.received.len() as u32 >= total,
            None => false,
        }
    }

    /// Missing chunk indices, ascending, truncated to `cap`.
    pub fn missing(&self, cap: usize) -> Vec<u32> {
        let total = match self.total_chunks {
            Some(total) => total,
            None => return Vec::new(),
        };
        (0..total)
            .filter(|i| !self.received.contains(i))
            .take(cap)
            .collect()
    }

    /// Expected byte length of chunk `index`, per the committed manifest.
    pub fn expected_chunk_len(&self, index: u32) -> Option<usize> {
        let size = self.size?;
        let chunk_size = self.chunk_size? as u64;
        let start = index as u64 * chunk_size;
        if start >= size && size > 0 {
            return None;
        }
        Some((size - start).min(chunk_size) as usize)
    }
}

// ============================================================================
// STATE STORE
// ============================================================================

/// On-disk store rooted at a storage directory, one subdirectory per
/// `file_id`.
#[derive(Debug, Clone)]
pub struct StateStore {
    root: PathBuf,
}

impl StateStore {
    /// Open (and create if needed) a store rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .map_err(|e| Error::Persistence(format!("create {}: {}", root.display(), e)))?;
        Ok(Self { root })
    }

    /// The storage root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Per-transfer directory, created on first use.
    pub fn transfer_dir(&self, file_id: &str) -> Result<PathBuf> {
        let dir = self.root.join(file_id);
        std::fs::create_dir_all(&dir)
            .map_err(|e| Error::Persistence(format!("create {}: {}", dir.display(), e)))?;
        Ok(dir)
    }

    fn state_path(&self, file_id: &str) -> PathBuf {
        self.root.join(file_id).join("state.json")
    }

    /// Path of the reconstructed data file, if the manifest (and with it the
    /// filename) is known. The name is reduced to its final path component so
    /// a hostile manifest cannot escape the transfer directory.
    pub fn data_path(&self, state: &TransferState) -> Option<PathBuf> {
        let name = state.name.as_deref()?;
        let file_name = Path::new(name)
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| format!("{}.bin", state.file_id).into());
        Some(self.root.join(&state.file_id).join(file_name))
    }

    /// Load the state for `file_id`, or a fresh one if none is persisted.
    pub async fn load(&self, file_id: &str) -> Result<TransferState> {
        let path = self.state_path(file_id);
        match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| Error::Persistence(format!("parse {}: {}", path.display(), e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Ok(TransferState::new(file_id))
            }
            Err(e) => Err(Error::Persistence(format!(
                "read {}: {}",
                path.display(),
                e
            ))),
        }
    }

    /// Persist `state` atomically: write `state.json.tmp`, then rename over
    /// `state.json`.
    pub async fn save(&self, state: &TransferState) -> Result<()> {
        self.transfer_dir(&state.file_id)?;
        let path = self.state_path(&state.file_id);
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec(state)
            .map_err(|e| Error::Persistence(format!("encode state: {}", e)))?;
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| Error::Persistence(format!("write {}: {}", tmp.display(), e)))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| Error::Persistence(format!("rename {}: {}", path.display(), e)))?;
        Ok(())
    }

    /// Write chunk bytes at `index * chunk_size`, creating or extending the
    /// data file as needed.
    pub async fn write_chunk(
        &self,
        state: &TransferState,
        index: u32,
        data: &[u8],
    ) -> Result<()> {
        let chunk_size = state
            .chunk_size
            .ok_or_else(|| Error::Persistence("chunk_size unknown".to_string()))?;
        let path = self
            .data_path(state)
            .ok_or_else(|| Error::Persistence("data file name unknown".to_string()))?;
        self.transfer_dir(&state.file_id)?;

        let mut file = tokio::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .await
            .map_err(|e| Error::Persistence(format!("open {}: {}", path.display(), e)))?;
        file.seek(SeekFrom::Start(index as u64 * chunk_size as u64))
            .await
            .map_err(|e| Error::Persistence(format!("seek {}: {}", path.display(), e)))?;
        file.write_all(data)
            .await
            .map_err(|e| Error::Persistence(format!("write {}: {}", path.display(), e)))?;
        file.flush()
            .await
            .map_err(|e| Error::Persistence(format!("flush {}: {}", path.display(), e)))?;
        Ok(())
    }

    /// Make sure the data file exists (used for empty files, which never see
    /// a chunk write).
    pub async fn ensure_data_file(&self, state: &TransferState) -> Result<()> {
        let path = self
            .data_path(state)
            .ok_or_else(|| Error::Persistence("data file name unknown".to_string()))?;
        self.transfer_dir(&state.file_id)?;
        tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .open(&path)
            .await
            .map_err(|e| Error::Persistence(format!("create {}: {}", path.display(), e)))?;
        Ok(())
    }

    /// Truncate the data file to the manifest size before the final digest
    /// pass, discarding stale bytes a prior transfer with a different chunk
    /// size may have left past the end.
    pub async fn truncate_data_file(&self, state: &TransferState) -> Result<()> {
        let size = state
            .size
            .ok_or_else(|| Error::Persistence("size unknown".to_string()))?;
        let path = self
            .data_path(state)
            .ok_or_else(|| Error::Persistence("data file name unknown".to_string()))?;
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(&path)
            .await
            .map_err(|e| Error::Persistence(format!("open {}: {}", path.display(), e)))?;
        file.set_len(size)
            .await
            .map_err(|e| Error::Persistence(format!("truncate {}: {}", path.display(), e)))?;
        Ok(())
    }
}
