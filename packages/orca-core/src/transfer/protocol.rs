//! # Transfer Wire Protocol
//!
//! Message and topic model for chunked file transfer. Five topics are scoped
//! under one `file_id`:
//!
//! ```text
//! <prefix>/file/<file_id>/meta     sender → receiver   manifest
//! <prefix>/file/<file_id>/chunk    sender → receiver   one chunk
//! <prefix>/file/<file_id>/status   receiver → sender   progress report
//!                                  sender → receiver   {"request":"status"} probe
//! <prefix>/file/<file_id>/retry    receiver → sender   missing chunk indices
//! <prefix>/file/<file_id>/ack      receiver → sender   verified completion
//! ```
//!
//! All payloads are UTF-8 JSON. Chunk bytes travel as lowercase hex inside
//! the `data` field so payloads stay text-safe on the bus.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Manifest schema identifier. Messages with another schema are ignored.
pub const MANIFEST_SCHEMA: &str = "orca.file.manifest.v1";

/// Maximum number of missing indices carried per status/retry message.
pub const MISSING_CAP: usize = 500;

// ============================================================================
// FILE ID
// ============================================================================

/// Generate an opaque transfer id: `<basename>-<size>-<8-hex-random>`.
///
/// The random suffix keeps concurrent transfers of the same file from
/// colliding in receiver state. The result contains no `/`, so it is safe as
/// a single topic segment.
pub fn generate_file_id(name: &str, size: u64) -> String {
    let suffix: String = Uuid::new_v4().simple().to_string()[..8].to_string();
    format!("{}-{}-{}", name, size, suffix)
}

/// Number of chunks needed to cover `size` bytes (0 for an empty file).
pub fn chunk_count(size: u64, chunk_size: usize) -> u32 {
    if size == 0 {
        0
    } else {
        ((size + chunk_size as u64 - 1) / chunk_size as u64) as u32
    }
}

// ============================================================================
// TOPICS
// ============================================================================

/// The five topics scoped to one transfer.
#[derive(Debug, Clone)]
pub struct TransferTopics {
    /// `<prefix>/file/<file_id>`
    pub base: String,
    /// Manifest topic.
    pub meta: String,
    /// Chunk data topic.
    pub chunk: String,
    /// Progress/probe topic.
    pub status: String,
    /// Missing-chunk request topic.
    pub retry: String,
    /// Completion topic.
    pub ack: String,
}

impl TransferTopics {
    /// Build the topic set for a transfer.
    pub fn new(prefix: &str, file_id: &str) -> Self {
        let base = format!("{}/file/{}", prefix, file_id);
        Self {
            meta: format!("{}/meta", base),
            chunk: format!("{}/chunk", base),
            status: format!("{}/status", base),
            retry: format!("{}/retry", base),
            ack: format!("{}/ack", base),
            base,
        }
    }

    /// Subscription filter matching every transfer topic under `prefix`.
    pub fn subscription_filter(prefix: &str) -> String {
        format!("{}/file/+/+", prefix)
    }
}

/// The message kind encoded in a topic's final segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicKind {
    /// `…/meta`
    Meta,
    /// `…/chunk`
    Chunk,
    /// `…/status`
    Status,
    /// `…/retry`
    Retry,
    /// `…/ack`
    Ack,
}

impl TopicKind {
    fn from_segment(segment: &str) -> Option<Self> {
        match segment {
            "meta" => Some(Self::Meta),
            "chunk" => Some(Self::Chunk),
            "status" => Some(Self::Status),
            "retry" => Some(Self::Retry),
            "ack" => Some(Self::Ack),
            _ => None,
        }
    }
}

/// Parse `…/file/<file_id>/<kind>` into its addressing pair.
///
/// Returns `None` for topics that are too short or whose final segment is not
/// a known kind; such messages are ignored.
pub fn parse_topic(topic: &str) -> Option<(String, TopicKind)> {
    let mut segments = topic.rsplit('/');
    let kind = TopicKind::from_segment(segments.next()?)?;
    let file_id = segments.next()?;
    if file_id.is_empty() {
        return None;
    }
    Some((file_id.to_string(), kind))
}

// ============================================================================
// WIRE MESSAGES
// ============================================================================

/// Manifest describing a file and its per-chunk digests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    /// Schema identifier; must equal [`MANIFEST_SCHEMA`].
    #[serde(default)]
    pub schema: String,
    /// Transfer id scoping all topics.
    pub file_id: String,
    /// Original filename, no path components.
    pub name: String,
    /// Total byte count.
    pub size: u64,
    /// Bytes per chunk; the last chunk may be shorter.
    pub chunk_size: usize,
    /// `ceil(size / chunk_size)`, 0 for an empty file.
    pub total_chunks: u32,
    /// Lowercase hex SHA-256 of the whole file.
    pub file_sha256: String,
    /// Lowercase hex SHA-256 per chunk, one entry per chunk.
    pub chunk_sha256: Vec<String>,
    /// Informational MIME type.
    pub content_type: String,
    /// Seconds since epoch at manifest creation.
    pub timestamp: i64,
}

impl Manifest {
    /// Validate schema version and internal consistency.
    ///
    /// Every digest entry must be present and well-formed: a manifest with a
    /// short `chunk_sha256` array or an empty entry is rejected rather than
    /// skipping verification for those chunks.
    pub fn validate(&self) -> Result<()> {
        if self.schema != MANIFEST_SCHEMA {
            return Err(Error::InvalidManifest(format!(
                "unsupported schema {:?}",
                self.schema
            )));
        }
        if self.name.is_empty() {
            return Err(Error::InvalidManifest("empty name".to_string()));
        }
        if self.chunk_size == 0 {
            return Err(Error::InvalidManifest("chunk_size must be >= 1".to_string()));
        }
        let expected = chunk_count(self.size, self.chunk_size);
        if self.total_chunks != expected {
            return Err(Error::InvalidManifest(format!(
                "total_chunks {} inconsistent with size {} / chunk_size {} (expected {})",
                self.total_chunks, self.size, self.chunk_size, expected
            )));
        }
        if self.chunk_sha256.len() != self.total_chunks as usize {
            return Err(Error::InvalidManifest(format!(
                "chunk_sha256 has {} entries, expected {}",
                self.chunk_sha256.len(),
                self.total_chunks
            )));
        }
        if !is_hex_digest(&self.file_sha256) {
            return Err(Error::InvalidManifest("malformed file_sha256".to_string()));
        }
        for (i, digest) in self.chunk_sha256.iter().enumerate() {
            if !is_hex_digest(digest) {
                return Err(Error::InvalidManifest(format!(
                    "malformed chunk_sha256[{}]",
                    i
                )));
            }
        }
        Ok(())
    }
}

/// One chunk of file data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkMessage {
    /// Transfer id.
    pub file_id: String,
    /// Zero-based chunk index.
    pub chunk_index: u32,
    /// Digest of the chunk bytes; must match the manifest entry.
    pub sha256: String,
    /// Lowercase hex encoding of the chunk bytes.
    pub data: String,
}

impl ChunkMessage {
    /// Decode the hex `data` field back into raw bytes.
    pub fn decode_data(&self) -> Result<Vec<u8>> {
        hex::decode(&self.data).map_err(|e| Error::PayloadDecode(format!("chunk data: {}", e)))
    }
}

/// Receiver progress report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusMessage {
    /// Transfer id.
    pub file_id: String,
    /// Number of chunks received and verified.
    pub received: u32,
    /// Total chunks, if the manifest is known.
    pub total: Option<u32>,
    /// Missing indices, ascending, capped at [`MISSING_CAP`].
    pub missing: Vec<u32>,
    /// Whether the whole file has been verified.
    pub complete: bool,
}

/// Sender-originated nudge asking the receiver to report status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusProbe {
    /// Always `"status"`.
    pub request: String,
}

/// Payloads seen on the status topic. The receiver only acts on probes; its
/// own reports loop back through the shared subscription and are ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StatusPayload {
    /// Receiver → sender progress report.
    Report(StatusMessage),
    /// Sender → receiver probe.
    Probe(StatusProbe),
}

/// Receiver request to resend the enumerated chunks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryRequest {
    /// Transfer id.
    pub file_id: String,
    /// Missing indices, ascending, capped at [`MISSING_CAP`].
    pub missing: Vec<u32>,
}

/// Terminal acknowledgement after whole-file verification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckMessage {
    /// Transfer id.
    pub file_id: String,
    /// `"ok"` on success.
    pub status: String,
    /// Seconds since epoch at emission.
    pub timestamp: i64,
}

impl AckMessage {
    /// Whether this ack reports successful completion.
    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}

/// An inbound message, decoded according to its topic kind.
#[derive(Debug, Clone)]
pub enum FileMessage {
    /// Manifest from `…/meta`.
    Meta(Manifest),
    /// Chunk from `…/chunk`.
    Chunk(ChunkMessage),
    /// Probe or report from `…/status`.
    Status(StatusPayload),
    /// Resend request from `…/retry`.
    Retry(RetryRequest),
    /// Completion signal from `…/ack`.
    Ack(AckMessage),
}

impl FileMessage {
    /// Decode a raw payload according to the topic kind it arrived on.
    pub fn parse(kind: TopicKind, payload: &[u8]) -> Result<Self> {
        let decode_err = |e: serde_json::Error| Error::PayloadDecode(e.to_string());
        match kind {
            TopicKind::Meta => serde_json::from_slice(payload)
                .map(FileMessage::Meta)
                .map_err(decode_err),
            TopicKind::Chunk => serde_json::from_slice(payload)
                .map(FileMessage::Chunk)
                .map_err(decode_err),
            TopicKind::Status => serde_json::from_slice(payload)
                .map(FileMessage::Status)
                .map_err(decode_err),
            TopicKind::Retry => serde_json::from_slice(payload)
                .map(FileMessage::Retry)
                .map_err(decode_err),
            TopicKind::Ack => serde_json::from_slice(payload)
                .map(FileMessage::Ack)
                .map_err(decode_err),
        }
    }
}

fn is_hex_digest(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}
