//! # File Transfer
//!
//! The transfer protocol proper: wire messages and topics, the streaming
//! hash/chunk engine, and the sender and receiver state machines.

pub mod chunking;
pub mod protocol;
pub mod receiver;
pub mod sender;
