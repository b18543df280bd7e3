//! # Sender State Machine
//!
//! Publishes a file as manifest + chunks and optionally stays up to honor
//! retry requests until the receiver acks.
//!
//! ```text
//! stage:        validate → streaming hash pass → manifest
//! publish_all:  meta → chunks (ascending) → status probe
//! wait_for_ack: retry → republish enumerated chunks (ascending)
//!               ack   → done
//! ```
//!
//! Staging and publishing are separate so a caller can subscribe to the
//! transfer's retry/ack topics between the two and never miss a fast
//! receiver. `send_file` runs both back to back, the fire-and-forget mode
//! used by the one-shot CLI; `wait_for_ack` is the long-running mode with a
//! caller-defined deadline.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::bus::{qos_level, BusPublisher, InboundMessage};
use crate::error::{Error, Result};
use crate::transfer::chunking::{build_manifest, ChunkReader};
use crate::transfer::protocol::{
    generate_file_id, parse_topic, ChunkMessage, FileMessage, Manifest, StatusPayload,
    StatusProbe, TransferTopics,
};

/// Where a send currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendPhase {
    /// Manifest computed; nothing published yet.
    Staged,
    /// Manifest and chunks handed to the bus; terminal ack not yet seen.
    AwaitingAck,
    /// Receiver confirmed whole-file verification.
    Done,
}

/// Publishes files over the bus.
pub struct FileSender {
    bus: Arc<dyn BusPublisher>,
    topic_prefix: String,
}

impl FileSender {
    /// Create a sender publishing under `topic_prefix`.
    pub fn new(bus: Arc<dyn BusPublisher>, topic_prefix: impl Into<String>) -> Self {
        Self {
            bus,
            topic_prefix: topic_prefix.into(),
        }
    }

    /// Validate the input and run the streaming hash pass, without touching
    /// the bus. Nothing is published when the file is missing or
    /// `chunk_size`/`qos` are out of range.
    pub async fn stage(&self, path: &Path, chunk_size: usize, qos: u8) -> Result<SendHandle> {
        qos_level(qos)?;
        if chunk_size == 0 {
            return Err(Error::InvalidChunkSize(chunk_size));
        }
        let metadata = tokio::fs::metadata(path)
            .await
            .map_err(|_| Error::FileNotFound(path.display().to_string()))?;
        if !metadata.is_file() {
            return Err(Error::FileNotFound(path.display().to_string()));
        }
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::FileNotFound(path.display().to_string()))?;

        let file_id = generate_file_id(name, metadata.len());
        let topics = TransferTopics::new(&self.topic_prefix, &file_id);

        tracing::info!(
            file_id = file_id.as_str(),
            size = metadata.len(),
            chunk_size = chunk_size,
            "Hashing file"
        );
        let manifest = build_manifest(path, &file_id, chunk_size).await?;

        Ok(SendHandle {
            bus: Arc::clone(&self.bus),
            path: path.to_path_buf(),
            manifest,
            topics,
            qos,
            phase: SendPhase::Staged,
        })
    }

    /// Stage and publish in one step: manifest, every chunk in ascending
    /// index order, then a status probe to nudge the receiver.
    pub async fn send_file(&self, path: &Path, chunk_size: usize, qos: u8) -> Result<SendHandle> {
        let mut handle = self.stage(path, chunk_size, qos).await?;
        handle.publish_all().await?;
        Ok(handle)
    }
}

/// An in-flight send: publishes the transfer, republishes requested chunks
/// and watches for the ack.
pub struct SendHandle {
    bus: Arc<dyn BusPublisher>,
    path: PathBuf,
    manifest: Manifest,
    topics: TransferTopics,
    qos: u8,
    phase: SendPhase,
}

impl SendHandle {
    /// The transfer id of this send.
    pub fn file_id(&self) -> &str {
        &self.manifest.file_id
    }

    /// The manifest that is (or will be) published.
    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    /// Current phase.
    pub fn phase(&self) -> SendPhase {
        self.phase
    }

    /// Retry topic to subscribe for this send.
    pub fn retry_topic(&self) -> &str {
        &self.topics.retry
    }

    /// Ack topic to subscribe for this send.
    pub fn ack_topic(&self) -> &str {
        &self.topics.ack
    }

    /// Publish the manifest, every chunk in ascending index order, and a
    /// status probe.
    pub async fn publish_all(&mut self) -> Result<()> {
        let payload = serde_json::to_vec(&self.manifest)
            .map_err(|e| Error::PayloadDecode(e.to_string()))?;
        self.bus.publish(&self.topics.meta, payload, self.qos).await?;
        tracing::info!(
            file_id = self.file_id(),
            total_chunks = self.manifest.total_chunks,
            "Manifest published"
        );

        let mut reader =
            ChunkReader::open(&self.path, self.manifest.chunk_size, self.manifest.size).await?;
        for index in 0..self.manifest.total_chunks {
            let data = reader.read_chunk(index).await?;
            publish_chunk(&*self.bus, &self.topics, &self.manifest, index, &data, self.qos)
                .await?;
        }

        // Nudge the receiver to report, so a lossy first pass converges fast.
        let probe = serde_json::to_vec(&StatusProbe {
            request: "status".to_string(),
        })
        .map_err(|e| Error::PayloadDecode(e.to_string()))?;
        self.bus.publish(&self.topics.status, probe, self.qos).await?;

        tracing::info!(
            file_id = self.file_id(),
            chunks = self.manifest.total_chunks,
            "All chunks published"
        );
        self.phase = SendPhase::AwaitingAck;
        Ok(())
    }

    /// Republish the requested chunks in ascending index order.
    ///
    /// Duplicate and out-of-range indices are dropped; resending a chunk the
    /// receiver already has is harmless. Returns how many chunks went out.
    pub async fn resend(&self, missing: &[u32]) -> Result<usize> {
        let mut indices: Vec<u32> = missing
            .iter()
            .copied()
            .filter(|&i| i < self.manifest.total_chunks)
            .collect();
        indices.sort_unstable();
        indices.dedup();
        if indices.is_empty() {
            return Ok(0);
        }

        let mut reader =
            ChunkReader::open(&self.path, self.manifest.chunk_size, self.manifest.size).await?;
        for &index in &indices {
            let data = reader.read_chunk(index).await?;
            publish_chunk(&*self.bus, &self.topics, &self.manifest, index, &data, self.qos)
                .await?;
        }
        tracing::info!(
            file_id = self.file_id(),
            chunks = indices.len(),
            "Republished requested chunks"
        );
        Ok(indices.len())
    }

    /// Serve retry requests until the ack arrives or `deadline` lapses.
    ///
    /// `inbound` must be fed from a subscription covering this send's retry
    /// and ack topics. Returns `true` once the ack is seen; `false` on
    /// deadline. Messages for other transfers are ignored.
    pub async fn wait_for_ack(
        &mut self,
        inbound: &mut mpsc::UnboundedReceiver<InboundMessage>,
        deadline: Duration,
    ) -> Result<bool> {
        let until = tokio::time::Instant::now() + deadline;
        loop {
            let message = match tokio::time::timeout_at(until, inbound.recv()).await {
                Ok(Some(message)) => message,
                Ok(None) => return Ok(false),
                Err(_) => {
                    tracing::warn!(file_id = self.file_id(), "Deadline reached without ack");
                    return Ok(false);
                }
            };

            let (file_id, kind) = match parse_topic(&message.topic) {
                Some(parsed) => parsed,
                None => continue,
            };
            if file_id != self.manifest.file_id {
                continue;
            }

            match FileMessage::parse(kind, &message.payload) {
                Ok(FileMessage::Retry(retry)) => {
                    tracing::info!(
                        file_id = file_id.as_str(),
                        missing = retry.missing.len(),
                        "Retry requested"
                    );
                    self.resend(&retry.missing).await?;
                }
                Ok(FileMessage::Ack(ack)) if ack.is_ok() => {
                    tracing::info!(file_id = file_id.as_str(), "Transfer acknowledged");
                    self.phase = SendPhase::Done;
                    return Ok(true);
                }
                Ok(FileMessage::Status(StatusPayload::Report(report))) => {
                    tracing::debug!(
                        file_id = file_id.as_str(),
                        received = report.received,
                        complete = report.complete,
                        "Receiver status"
                    );
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(
                        topic = message.topic.as_str(),
                        error = %e,
                        "Discarding malformed payload"
                    );
                }
            }
        }
    }
}

async fn publish_chunk(
    bus: &dyn BusPublisher,
    topics: &TransferTopics,
    manifest: &Manifest,
    index: u32,
    data: &[u8],
    qos: u8,
) -> Result<()> {
    let message = ChunkMessage {
        file_id: manifest.file_id.clone(),
        chunk_index: index,
        sha256: manifest.chunk_sha256[index as usize].clone(),
        data: hex::encode(data),
    };
    let payload =
        serde_json::to_vec(&message).map_err(|e| Error::PayloadDecode(e.to_string()))?;
    bus.publish(&topics.chunk, payload, qos).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::testing::MemoryBus;
    use crate::transfer::protocol::RetryRequest;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_fixture(dir: &TempDir, name: &str, data: &[u8]) -> PathBuf {
        let path = dir.path().join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(data).unwrap();
        path
    }

    fn parse_chunk(payload: &[u8]) -> ChunkMessage {
        serde_json::from_slice(payload).unwrap()
    }

    #[tokio::test]
    async fn test_stage_publishes_nothing() {
        let dir = TempDir::new().unwrap();
        let path = write_fixture(&dir, "data.bin", b"abcdef");

        let bus = MemoryBus::new();
        let sender = FileSender::new(bus.clone(), "orca/iot");
        let handle = sender.stage(&path, 4, 1).await.unwrap();

        assert_eq!(handle.phase(), SendPhase::Staged);
        assert_eq!(handle.manifest().total_chunks, 2);
        assert!(bus.published().is_empty());
    }

    #[tokio::test]
    async fn test_send_file_publishes_meta_chunks_probe() {
        let dir = TempDir::new().unwrap();
        let data: Vec<u8> = (0..40u8).collect();
        let path = write_fixture(&dir, "data.bin", &data);

        let bus = MemoryBus::new();
        let sender = FileSender::new(bus.clone(), "orca/iot");
        let handle = sender.send_file(&path, 16, 1).await.unwrap();

        let records = bus.published();
        // meta + 3 chunks + probe
        assert_eq!(records.len(), 5);
        assert!(records[0].0.ends_with("/meta"));
        assert!(records[4].0.ends_with("/status"));

        let manifest: Manifest = serde_json::from_slice(&records[0].1).unwrap();
        assert!(manifest.validate().is_ok());
        assert_eq!(manifest.file_id, handle.file_id());
        assert_eq!(manifest.total_chunks, 3);

        // Chunks come out in ascending order and decode to the source bytes.
        let mut reassembled = Vec::new();
        for (i, record) in records[1..4].iter().enumerate() {
            assert!(record.0.ends_with("/chunk"));
            let chunk = parse_chunk(&record.1);
            assert_eq!(chunk.chunk_index, i as u32);
            assert_eq!(chunk.sha256, manifest.chunk_sha256[i]);
            reassembled.extend(chunk.decode_data().unwrap());
        }
        assert_eq!(reassembled, data);

        let probe: StatusProbe = serde_json::from_slice(&records[4].1).unwrap();
        assert_eq!(probe.request, "status");
        assert_eq!(handle.phase(), SendPhase::AwaitingAck);
    }

    #[tokio::test]
    async fn test_send_empty_file_is_meta_and_probe_only() {
        let dir = TempDir::new().unwrap();
        let path = write_fixture(&dir, "empty.bin", b"");

        let bus = MemoryBus::new();
        let sender = FileSender::new(bus.clone(), "orca/iot");
        sender.send_file(&path, 1024, 1).await.unwrap();

        let records = bus.published();
        assert_eq!(records.len(), 2);
        assert!(records[0].0.ends_with("/meta"));
        assert!(records[1].0.ends_with("/status"));
    }

    #[tokio::test]
    async fn test_invalid_input_publishes_nothing() {
        let dir = TempDir::new().unwrap();
        let path = write_fixture(&dir, "data.bin", b"abc");

        let bus = MemoryBus::new();
        let sender = FileSender::new(bus.clone(), "orca/iot");

        assert!(matches!(
            sender.send_file(&dir.path().join("missing.bin"), 16, 1).await,
            Err(Error::FileNotFound(_))
        ));
        assert!(matches!(
            sender.send_file(&path, 0, 1).await,
            Err(Error::InvalidChunkSize(0))
        ));
        assert!(matches!(
            sender.send_file(&path, 16, 9).await,
            Err(Error::InvalidQos(9))
        ));
        assert!(bus.published().is_empty());
    }

    #[tokio::test]
    async fn test_resend_is_sorted_deduplicated_and_bounded() {
        let dir = TempDir::new().unwrap();
        let data: Vec<u8> = (0..40u8).collect();
        let path = write_fixture(&dir, "data.bin", &data);

        let bus = MemoryBus::new();
        let sender = FileSender::new(bus.clone(), "orca/iot");
        let handle = sender.send_file(&path, 16, 1).await.unwrap();
        bus.take();

        let sent = handle.resend(&[2, 0, 2, 99]).await.unwrap();
        assert_eq!(sent, 2);

        let records = bus.published();
        assert_eq!(records.len(), 2);
        assert_eq!(parse_chunk(&records[0].1).chunk_index, 0);
        assert_eq!(parse_chunk(&records[1].1).chunk_index, 2);
        // The short last chunk keeps its true length on resend.
        assert_eq!(
            parse_chunk(&records[1].1).decode_data().unwrap(),
            &data[32..]
        );
    }

    #[tokio::test]
    async fn test_wait_for_ack_serves_retry_then_finishes() {
        let dir = TempDir::new().unwrap();
        let data: Vec<u8> = (0..40u8).collect();
        let path = write_fixture(&dir, "data.bin", &data);

        let bus = MemoryBus::new();
        let sender = FileSender::new(bus.clone(), "orca/iot");
        let mut handle = sender.send_file(&path, 16, 1).await.unwrap();
        bus.take();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let retry = RetryRequest {
            file_id: handle.file_id().to_string(),
            missing: vec![1],
        };
        tx.send(InboundMessage {
            topic: handle.retry_topic().to_string(),
            payload: serde_json::to_vec(&retry).unwrap(),
        })
        .unwrap();
        tx.send(InboundMessage {
            topic: handle.ack_topic().to_string(),
            payload: format!(
                r#"{{"file_id":"{}","status":"ok","timestamp":1}}"#,
                handle.file_id()
            )
            .into_bytes(),
        })
        .unwrap();

        let acked = handle
            .wait_for_ack(&mut rx, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(acked);
        assert_eq!(handle.phase(), SendPhase::Done);

        let records = bus.published();
        assert_eq!(records.len(), 1);
        assert_eq!(parse_chunk(&records[0].1).chunk_index, 1);
    }

    #[tokio::test]
    async fn test_wait_for_ack_ignores_other_transfers_and_times_out() {
        let dir = TempDir::new().unwrap();
        let path = write_fixture(&dir, "data.bin", b"abcdef");

        let bus = MemoryBus::new();
        let sender = FileSender::new(bus.clone(), "orca/iot");
        let mut handle = sender.send_file(&path, 4, 1).await.unwrap();
        bus.take();

        let (tx, mut rx) = mpsc::unbounded_channel();
        // Ack for a different file_id must not complete this send.
        tx.send(InboundMessage {
            topic: "orca/iot/file/other-1-deadbeef/ack".to_string(),
            payload: br#"{"file_id":"other-1-deadbeef","status":"ok","timestamp":1}"#.to_vec(),
        })
        .unwrap();

        let acked = handle
            .wait_for_ack(&mut rx, Duration::from_millis(50))
            .await
            .unwrap();
        assert!(!acked);
        assert_eq!(handle.phase(), SendPhase::AwaitingAck);
    }
}
