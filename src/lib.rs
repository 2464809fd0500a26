//! bsync: block-level synchronization of files and devices over TCP.
//!
//! Two endpoints agree on a fixed block partitioning, exchange 128-bit
//! per-block fingerprints, and transmit only blocks that differ, optionally
//! zstd-compressed.  Designed for mirroring virtual-disk images and raw
//! devices over thin links, where a second pass moves almost nothing.

pub mod blockio;
pub mod cache;
pub mod cli;
pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod fingerprint;
pub mod msg;
pub mod net;
pub mod progress;
pub mod server;
pub mod ssh;
pub mod taskpool;

/// Block fingerprint of a payload (`ZERO` for empty/all-zero input).
pub use fingerprint::{block_digest, Digest, ZERO_DIGEST};
/// The 44-byte wire control record.
pub use msg::{Frame, FRAME_LEN, MAGIC};
/// Session tuning passed to both drivers.
pub use config::SyncConfig;
/// Error taxonomy of a sync session.
pub use error::SyncError;
/// Counters returned by the initiator drivers.
pub use progress::SyncStats;
