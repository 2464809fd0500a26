//! Session configuration and tuning constants.
//!
//! Everything that used to be a tunable knob lives in [`SyncConfig`], a value
//! passed explicitly to the drivers.  Nothing in here is process-global: a
//! test can run several sessions with different block sizes in one process.

use std::path::PathBuf;
use std::time::Duration;

use crate::codec::Level;

// ---------------------------------------------------------------------------
// Numeric constants
// ---------------------------------------------------------------------------

pub const KB: usize = 1 << 10;
pub const MB: usize = 1 << 20;
pub const GB: usize = 1 << 30;

/// Default block size: 100 MiB.  Large blocks amortize the per-block network
/// round-trip over WAN links; smaller blocks localize diffs better.
pub const DEFAULT_BLOCK_SIZE: u32 = 100 * MB as u32;

/// Default TCP port for the responder.
pub const DEFAULT_PORT: u16 = 8080;

/// Default number of push workers (each owns one TCP connection).
pub const DEFAULT_WORKERS: usize = 4;

/// Default prefetch window: number of block indices that may have a pending
/// fingerprint/payload computation at any instant.  Memory high-water mark is
/// roughly `window * block_size` on top of per-worker buffers.
pub const DEFAULT_WINDOW: u64 = 4;

/// Backoff between retries of a failed network exchange.
pub const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Receive timeout applied by the pull-mode initiator while waiting for the
/// responder's reply frame.  On expiry the stream reconnects and the exchange
/// for the same block is reissued.
pub const PULL_RECV_TIMEOUT: Duration = Duration::from_secs(30);

/// How long the SSH launcher waits for the remote responder's READY line.
pub const SSH_READY_TIMEOUT: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// SyncConfig
// ---------------------------------------------------------------------------

/// Transfer direction, as seen from the initiator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Local object is the source; remote is overwritten.
    Push,
    /// Remote object is the source; local is overwritten.
    Pull,
}

/// Per-session settings shared by both drivers.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Path of the object under sync (file or block device).
    pub device: PathBuf,
    /// Block partitioning, identical on both endpoints of a session.
    pub block_size: u32,
    /// First block index to process (blocks below are assumed in sync).
    pub skip: u64,
    /// Push worker count.  Zero means one per CPU.
    pub workers: usize,
    /// Prefetch window width `W`.
    pub window: u64,
    /// Attempt zstd compression of mismatched blocks.
    pub compress: bool,
    /// Compression level used when `compress` is on.
    pub level: Level,
    /// Suppress the interactive status line.
    pub quiet: bool,
}

impl SyncConfig {
    /// Resolved worker count (`workers == 0` → one per CPU core).
    pub fn effective_workers(&self) -> usize {
        if self.workers == 0 {
            num_cpus::get().max(1)
        } else {
            self.workers
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            device: PathBuf::new(),
            block_size: DEFAULT_BLOCK_SIZE,
            skip: 0,
            workers: DEFAULT_WORKERS,
            window: DEFAULT_WINDOW,
            compress: true,
            level: Level::Fastest,
            quiet: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn effective_workers_auto_detects() {
        let mut cfg = SyncConfig::default();
        cfg.workers = 0;
        assert!(cfg.effective_workers() >= 1);
        cfg.workers = 7;
        assert_eq!(cfg.effective_workers(), 7);
    }

    #[test]
    fn defaults_match_documented_values() {
        let cfg = SyncConfig::default();
        assert_eq!(cfg.block_size, 104_857_600);
        assert_eq!(cfg.window, DEFAULT_WINDOW);
        assert!(cfg.compress);
    }
}
