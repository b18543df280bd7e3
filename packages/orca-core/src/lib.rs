//! # Orca Core
//!
//! Resumable chunked file transfer layered on an MQTT publish/subscribe bus.
//!
//! A sender fragments a file into fixed-size chunks and publishes a manifest
//! plus each chunk to topics scoped by a unique `file_id`; a receiver
//! reconstructs the file on disk with per-chunk and whole-file SHA-256
//! verification, persistent resume state, gap detection with retry requests,
//! and a terminal acknowledgement.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           ORCA CORE MODULES                             │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │   Sender                                       Receiver                │
//! │   ──────                                       ────────                │
//! │   hash pass ──► meta ─────────────────────────► commit manifest        │
//! │                 chunk × N ────────────────────► verify + write + save  │
//! │                 status probe ─────────────────► report                 │
//! │   resend ◄───────────────────────── retry ◄─── gap detection          │
//! │   done   ◄───────────────────────── ack   ◄─── whole-file verify      │
//! │                                                                         │
//! │   ┌──────────┐  ┌──────────────┐  ┌───────────┐  ┌──────────────────┐  │
//! │   │   bus    │  │   transfer   │  │  storage  │  │  config / error  │  │
//! │   │          │  │              │  │           │  │                  │  │
//! │   │ - MQTT   │  │ - protocol   │  │ - state   │  │ - env surface    │  │
//! │   │ - QoS    │  │ - chunking   │  │   .json   │  │ - thiserror      │  │
//! │   │ - backoff│  │ - sender     │  │ - data    │  │                  │  │
//! │   │          │  │ - receiver   │  │   file    │  │                  │  │
//! │   └──────────┘  └──────────────┘  └───────────┘  └──────────────────┘  │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Hierarchy
//!
//! - [`error`] - Error types for the entire library
//! - [`config`] - Broker settings read from the environment
//! - [`bus`] - MQTT adapter: connect, publish, subscribe, reconnect
//! - [`transfer`] - Wire protocol, chunk engine, sender and receiver
//! - [`storage`] - Persistent per-transfer receiver state
//!
//! ## Delivery Model
//!
//! The bus preserves publisher order per topic at QoS 1/2 but gives no
//! cross-topic guarantees, so chunks may precede their manifest and any
//! message may be duplicated. The receiver is written against exactly that
//! model: every mutation for one `file_id` is serialized, every chunk is
//! verified before it counts, and completion is only declared after the
//! reconstructed file's digest matches the manifest.

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

// ============================================================================
// MODULE DECLARATIONS
// ============================================================================

pub mod bus;
pub mod config;
pub mod error;
pub mod storage;
pub mod transfer;

// ============================================================================
// RE-EXPORTS
// ============================================================================

pub use bus::{BusPublisher, InboundMessage, MqttBus, CONNECT_TIMEOUT};
pub use config::BusConfig;
pub use error::{Error, Result};
pub use storage::{StateStore, TransferState};
pub use transfer::receiver::FileReceiver;
pub use transfer::sender::{FileSender, SendHandle};
