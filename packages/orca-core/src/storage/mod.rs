//! # Storage
//!
//! Durable receiver-side state: one directory per transfer holding the
//! reconstructed data file and its `state.json`.

pub mod state_store;

pub use state_store::{StateStore, TransferState};
