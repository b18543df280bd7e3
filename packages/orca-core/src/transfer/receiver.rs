//! # Receiver State Machine
//!
//! Dispatches inbound file-topic messages, reconstructs files on disk with
//! per-chunk and whole-file verification, and emits status / retry / ack.
//!
//! Every transfer is keyed by `file_id` and guarded by a per-transfer lock:
//! all mutations for one transfer are serialized while distinct transfers
//! progress independently. Durable state is reloaded from [`StateStore`]
//! under the lock on every message, so a failed persist simply leaves the
//! previous durable state in force and a process restart resumes where the
//! last successful save left off.
//!
//! Messages can arrive out of order and duplicated. A chunk that precedes its
//! manifest cannot be positioned (the stride is unknown) and is dropped; the
//! retry flow recovers it.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex};

use crate::bus::{BusPublisher, InboundMessage};
use crate::storage::state_store::{StateStore, TransferState};
use crate::transfer::chunking::{hash_file, verify_chunk};
use crate::transfer::protocol::{
    parse_topic, AckMessage, ChunkMessage, FileMessage, Manifest, RetryRequest, StatusMessage,
    StatusPayload, TopicKind, TransferTopics, MISSING_CAP,
};

/// Default cadence: one unsolicited status per 50 newly received chunks.
pub const DEFAULT_STATUS_INTERVAL: u32 = 50;

/// Receives chunked files and writes them under a storage root.
pub struct FileReceiver {
    bus: Arc<dyn BusPublisher>,
    store: StateStore,
    topic_prefix: String,
    qos: u8,
    status_interval: u32,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl FileReceiver {
    /// Create a receiver publishing feedback under `topic_prefix` at `qos`.
    pub fn new(
        bus: Arc<dyn BusPublisher>,
        store: StateStore,
        topic_prefix: impl Into<String>,
        qos: u8,
    ) -> Self {
        Self {
            bus,
            store,
            topic_prefix: topic_prefix.into(),
            qos,
            status_interval: DEFAULT_STATUS_INTERVAL,
            locks: DashMap::new(),
        }
    }

    /// Override the unsolicited status cadence (newly received chunks per
    /// status). Large transfers are still clamped to at least one status per
    /// `total_chunks / 10` chunks.
    pub fn with_status_interval(mut self, interval: u32) -> Self {
        self.status_interval = interval.max(1);
        self
    }

    /// Storage root files are reconstructed under.
    pub fn storage_root(&self) -> &std::path::Path {
        self.store.root()
    }

    /// Subscription filter covering every transfer under this prefix.
    pub fn subscription_filter(&self) -> String {
        TransferTopics::subscription_filter(&self.topic_prefix)
    }

    /// Drain inbound messages until the channel closes.
    pub async fn run(&self, inbound: &mut mpsc::UnboundedReceiver<InboundMessage>) {
        while let Some(message) = inbound.recv().await {
            self.handle_message(&message.topic, &message.payload).await;
        }
    }

    /// Process one inbound message. Never fails outward: malformed payloads
    /// and I/O problems are logged, and the retry flow re-delivers anything
    /// that did not stick.
    pub async fn handle_message(&self, topic: &str, payload: &[u8]) {
        let (file_id, kind) = match parse_topic(topic) {
            Some(parsed) => parsed,
            None => {
                tracing::trace!(topic = topic, "Ignoring unrecognized topic");
                return;
            }
        };

        // Retry and ack are receiver-originated; the wildcard subscription
        // loops them back to us. Nothing to do.
        if matches!(kind, TopicKind::Retry | TopicKind::Ack) {
            return;
        }

        let message = match FileMessage::parse(kind, payload) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(topic = topic, error = %e, "Discarding malformed payload");
                return;
            }
        };

        match message {
            FileMessage::Meta(manifest) => self.on_meta(&file_id, manifest).await,
            FileMessage::Chunk(chunk) => self.on_chunk(&file_id, chunk).await,
            FileMessage::Status(StatusPayload::Probe(_)) => self.on_probe(&file_id).await,
            FileMessage::Status(StatusPayload::Report(_)) => {
                tracing::trace!(file_id = file_id.as_str(), "Ignoring looped-back status");
            }
            FileMessage::Retry(_) | FileMessage::Ack(_) => unreachable!("filtered above"),
        }
    }

    // ── Per-kind handlers ───────────────────────────────────────────────

    async fn on_meta(&self, file_id: &str, manifest: Manifest) {
        if let Err(e) = manifest.validate() {
            tracing::warn!(file_id = file_id, error = %e, "Rejecting manifest");
            return;
        }
        if manifest.file_id != file_id {
            tracing::warn!(
                file_id = file_id,
                manifest_file_id = manifest.file_id.as_str(),
                "Manifest file_id disagrees with topic; rejecting"
            );
            return;
        }

        let lock = self.transfer_lock(file_id);
        let _serial = lock.lock().await;
        let mut state = match self.load(file_id).await {
            Some(state) => state,
            None => return,
        };

        if state.commit_manifest(&manifest) {
            tracing::info!(
                file_id = file_id,
                name = manifest.name.as_str(),
                size = manifest.size,
                total_chunks = manifest.total_chunks,
                "Manifest committed"
            );
            if let Err(e) = self.store.ensure_data_file(&state).await {
                tracing::warn!(file_id = file_id, error = %e, "Failed to create data file");
            }
            if let Err(e) = self.store.save(&state).await {
                tracing::warn!(file_id = file_id, error = %e, "Failed to persist manifest");
                return;
            }
        }

        // A re-sent manifest on a finished-but-unacked transfer re-attempts
        // the ack; an acked transfer stays silent on the ack topic.
        self.check_completion(&mut state).await;
        self.emit_status(&state).await;
    }

    async fn on_chunk(&self, file_id: &str, chunk: ChunkMessage) {
        let lock = self.transfer_lock(file_id);
        let _serial = lock.lock().await;
        let mut state = match self.load(file_id).await {
            Some(state) => state,
            None => return,
        };

        if !state.has_manifest() {
            // Without the manifest the stride is unknown, so the chunk cannot
            // be positioned. Drop it; the status/retry flow re-delivers.
            tracing::debug!(
                file_id = file_id,
                chunk_index = chunk.chunk_index,
                "Chunk before manifest; dropping"
            );
            return;
        }

        let index = chunk.chunk_index;
        let total = state.total_chunks.unwrap_or(0);
        if index >= total {
            tracing::warn!(
                file_id = file_id,
                chunk_index = index,
                total_chunks = total,
                "Chunk index out of range; dropping"
            );
            return;
        }

        let data = match chunk.decode_data() {
            Ok(data) => data,
            Err(e) => {
                tracing::warn!(file_id = file_id, chunk_index = index, error = %e,
                    "Undecodable chunk data; dropping");
                return;
            }
        };

        let digest_ok = state
            .chunk_sha256
            .as_ref()
            .and_then(|digests| digests.get(index as usize))
            .map(|expected| verify_chunk(&data, expected))
            .unwrap_or(false);

        if state.received.contains(&index) {
            // Duplicate: re-verify, leave state and stored bytes untouched.
            if !digest_ok {
                tracing::warn!(
                    file_id = file_id,
                    chunk_index = index,
                    "Duplicate chunk failed re-verification; keeping stored bytes"
                );
            }
            return;
        }

        if !digest_ok {
            tracing::warn!(
                file_id = file_id,
                chunk_index = index,
                "Chunk digest mismatch; discarding"
            );
            self.emit_status(&state).await;
            return;
        }

        if let Err(e) = self.store.write_chunk(&state, index, &data).await {
            tracing::warn!(file_id = file_id, chunk_index = index, error = %e,
                "Failed to write chunk; it will be retried");
            return;
        }
        state.mark_received(index);
        if let Err(e) = self.store.save(&state).await {
            tracing::warn!(file_id = file_id, chunk_index = index, error = %e,
                "Failed to persist state; chunk not counted");
            return;
        }

        tracing::debug!(
            file_id = file_id,
            chunk_index = index,
            received = state.received.len(),
            total = total,
            "Chunk stored"
        );

        if state.is_fully_received() {
            self.check_completion(&mut state).await;
            self.emit_status(&state).await;
        } else {
            let interval = self.effective_interval(total);
            if state.received.len() as u32 % interval == 0 {
                self.emit_status(&state).await;
            }
        }
    }

    async fn on_probe(&self, file_id: &str) {
        let lock = self.transfer_lock(file_id);
        let _serial = lock.lock().await;
        let mut state = match self.load(file_id).await {
            Some(state) => state,
            None => return,
        };
        // A probe on a complete-but-unacked transfer retries the ack that a
        // failed publish may have swallowed.
        if state.complete && !state.ack_sent {
            self.send_ack(&mut state).await;
        }
        self.emit_status(&state).await;
    }

    // ── Completion, status and ack ──────────────────────────────────────

    /// Unsolicited-status cadence for a transfer of `total` chunks: the
    /// configured interval, clamped so large transfers report at least once
    /// per `total / 10` chunks.
    fn effective_interval(&self, total: u32) -> u32 {
        let floor = total / 10;
        if floor == 0 {
            self.status_interval
        } else {
            self.status_interval.min(floor)
        }
    }

    async fn check_completion(&self, state: &mut TransferState) {
        if state.complete {
            if !state.ack_sent {
                self.send_ack(state).await;
            }
            return;
        }
        if !state.has_manifest() || !state.is_fully_received() {
            return;
        }

        if let Err(e) = self.store.ensure_data_file(state).await {
            tracing::warn!(file_id = state.file_id.as_str(), error = %e,
                "Cannot create data file for verification");
            return;
        }
        // Drop stale bytes past the declared size before hashing; an earlier
        // transfer with a larger stride may have extended the file.
        if let Err(e) = self.store.truncate_data_file(state).await {
            tracing::warn!(file_id = state.file_id.as_str(), error = %e,
                "Cannot truncate data file");
            return;
        }

        let path = match self.store.data_path(state) {
            Some(path) => path,
            None => return,
        };
        let actual = match hash_file(&path).await {
            Ok(digest) => digest,
            Err(e) => {
                tracing::warn!(file_id = state.file_id.as_str(), error = %e,
                    "Failed to hash data file");
                return;
            }
        };

        let expected = state.file_sha256.clone().unwrap_or_default();
        if actual == expected {
            state.complete = true;
            if let Err(e) = self.store.save(state).await {
                tracing::warn!(file_id = state.file_id.as_str(), error = %e,
                    "Failed to persist completion");
                state.complete = false;
                return;
            }
            tracing::info!(
                file_id = state.file_id.as_str(),
                name = state.name.as_deref().unwrap_or(""),
                "File verified"
            );
            self.send_ack(state).await;
        } else {
            // Every per-chunk digest passed yet the file disagrees, so the
            // stored bytes cannot be trusted. Start over: clear the received
            // set and ask for everything again.
            tracing::warn!(
                file_id = state.file_id.as_str(),
                expected = expected.as_str(),
                actual = actual.as_str(),
                "Whole-file digest mismatch; requesting full resend"
            );
            state.received.clear();
            state.complete = false;
            if let Err(e) = self.store.save(state).await {
                tracing::warn!(file_id = state.file_id.as_str(), error = %e,
                    "Failed to persist reset");
            }
        }
    }

    async fn send_ack(&self, state: &mut TransferState) {
        if state.ack_sent || !state.complete {
            return;
        }
        let topics = TransferTopics::new(&self.topic_prefix, &state.file_id);
        let ack = AckMessage {
            file_id: state.file_id.clone(),
            status: "ok".to_string(),
            timestamp: chrono::Utc::now().timestamp(),
        };
        let payload = match serde_json::to_vec(&ack) {
            Ok(payload) => payload,
            Err(_) => return,
        };
        match self.bus.publish(&topics.ack, payload, self.qos).await {
            Ok(()) => {
                state.ack_sent = true;
                tracing::info!(file_id = state.file_id.as_str(), "Ack published");
                if let Err(e) = self.store.save(state).await {
                    tracing::error!(file_id = state.file_id.as_str(), error = %e,
                        "Ack published but not persisted");
                }
            }
            Err(e) => {
                // Left unset so a later probe or manifest re-send retries.
                tracing::warn!(file_id = state.file_id.as_str(), error = %e,
                    "Failed to publish ack");
            }
        }
    }

    async fn emit_status(&self, state: &TransferState) {
        let topics = TransferTopics::new(&self.topic_prefix, &state.file_id);
        let missing = state.missing(MISSING_CAP);
        let status = StatusMessage {
            file_id: state.file_id.clone(),
            received: state.received.len() as u32,
            total: state.total_chunks,
            missing: missing.clone(),
            complete: state.complete,
        };
        match serde_json::to_vec(&status) {
            Ok(payload) => {
                if let Err(e) = self.bus.publish(&topics.status, payload, self.qos).await {
                    tracing::warn!(file_id = state.file_id.as_str(), error = %e,
                        "Failed to publish status");
                }
            }
            Err(_) => return,
        }

        if !missing.is_empty() {
            let retry = RetryRequest {
                file_id: state.file_id.clone(),
                missing,
            };
            if let Ok(payload) = serde_json::to_vec(&retry) {
                if let Err(e) = self.bus.publish(&topics.retry, payload, self.qos).await {
                    tracing::warn!(file_id = state.file_id.as_str(), error = %e,
                        "Failed to publish retry request");
                }
            }
        }
    }

    // ── Serialization and durable state ─────────────────────────────────

    fn transfer_lock(&self, file_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(file_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn load(&self, file_id: &str) -> Option<TransferState> {
        match self.store.load(file_id).await {
            Ok(state) => Some(state),
            Err(e) => {
                tracing::error!(file_id = file_id, error = %e, "Cannot load transfer state");
                None
            }
        }
    }
}
