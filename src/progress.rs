//! Transfer accounting and the interactive status line.
//!
//! Counters are best-effort under concurrent workers: one mutex, cheap
//! updates, and a repaint throttled to five per second so the terminal is
//! never the bottleneck.  Nothing here blocks forward progress; the numbers
//! feed the `\r`-rewritten status line and the final [`SyncStats`] summary.

use std::io::Write;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::info;

/// Minimum interval between repaints of the status line.
const REFRESH_EVERY: Duration = Duration::from_millis(200);

const MB: f64 = 1_048_576.0;

/// What happened to a block, shown as a one-letter tag in the status line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOutcome {
    /// Fingerprints matched; nothing was sent.
    InSync,
    /// Raw payload transmitted.
    Raw,
    /// Compressed payload transmitted.
    Compressed,
    /// Explicit zero-payload transmitted.
    Zero,
}

impl BlockOutcome {
    fn tag(self) -> char {
        match self {
            BlockOutcome::InSync => '-',
            BlockOutcome::Raw => 'w',
            BlockOutcome::Compressed => 'c',
            BlockOutcome::Zero => 'z',
        }
    }
}

/// Immutable snapshot of the counters, returned by the drivers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStats {
    /// Blocks examined (queries issued).
    pub blocks: u64,
    /// Blocks whose fingerprints differed and were transmitted.
    pub diff_blocks: u64,
    /// Bytes of object content covered.
    pub orig_bytes: u64,
    /// Payload bytes that actually crossed the wire.
    pub wire_bytes: u64,
}

struct Counters {
    stats: SyncStats,
    last_paint: Option<Instant>,
}

/// Shared progress aggregate for one transfer.
pub struct Progress {
    start: Instant,
    first_block: u64,
    total_blocks: u64,
    block_size: u32,
    file_size: u64,
    quiet: bool,
    counters: Mutex<Counters>,
}

impl Progress {
    pub fn new(first_block: u64, last_block: u64, block_size: u32, file_size: u64, quiet: bool) -> Self {
        Progress {
            start: Instant::now(),
            first_block,
            total_blocks: last_block + 1,
            block_size,
            file_size,
            quiet,
            counters: Mutex::new(Counters {
                stats: SyncStats::default(),
                last_paint: None,
            }),
        }
    }

    /// Record the outcome of one block exchange.  `wire_bytes` counts payload
    /// bytes only; queries and digests are protocol overhead and ignored.
    pub fn record(&self, idx: u64, outcome: BlockOutcome, raw_len: usize, wire_bytes: usize) {
        let mut guard = self.counters.lock().unwrap();
        guard.stats.blocks += 1;
        guard.stats.orig_bytes += raw_len as u64;
        guard.stats.wire_bytes += wire_bytes as u64;
        if outcome != BlockOutcome::InSync {
            guard.stats.diff_blocks += 1;
        }

        if self.quiet {
            return;
        }
        let now = Instant::now();
        if guard
            .last_paint
            .is_some_and(|t| now.duration_since(t) < REFRESH_EVERY)
        {
            return;
        }
        guard.last_paint = Some(now);
        self.paint(idx, outcome, &guard.stats);
    }

    fn paint(&self, idx: u64, outcome: BlockOutcome, stats: &SyncStats) {
        let secs = self.start.elapsed().as_secs_f64();
        let done_mb = (stats.blocks * self.block_size as u64) as f64 / MB;
        let rate = if secs > 0.0 { done_mb / secs } else { 0.0 };
        let left = self
            .total_blocks
            .saturating_sub(self.first_block + stats.blocks);
        let left_mb = (left * self.block_size as u64) as f64 / MB;
        let eta_min = if rate > 0.0 {
            (left_mb / rate / 60.0) as u64
        } else {
            0
        };
        let ratio = if stats.orig_bytes > 0 {
            100.0 * stats.wire_bytes as f64 / stats.orig_bytes as f64
        } else {
            0.0
        };
        eprint!(
            "\rblock {idx}/{last} [{tag}] size={size} ratio={ratio:.2}% {rate:.2} MB/s ETA={eta_min} min   ",
            last = self.total_blocks.saturating_sub(1),
            tag = outcome.tag(),
            size = self.file_size,
        );
        let _ = std::io::stderr().flush();
    }

    /// Current counter snapshot.
    pub fn stats(&self) -> SyncStats {
        self.counters.lock().unwrap().stats
    }

    /// Finish the status line and log the summary.
    pub fn finish(&self) -> SyncStats {
        let stats = self.stats();
        if !self.quiet {
            eprintln!();
        }
        let secs = self.start.elapsed().as_secs_f64();
        info!(
            blocks = stats.blocks,
            diff = stats.diff_blocks,
            orig_bytes = stats.orig_bytes,
            wire_bytes = stats.wire_bytes,
            secs = format!("{secs:.1}"),
            "transfer finished"
        );
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let p = Progress::new(0, 9, 1024, 10 * 1024, true);
        p.record(0, BlockOutcome::InSync, 1024, 0);
        p.record(1, BlockOutcome::Compressed, 1024, 300);
        p.record(2, BlockOutcome::Raw, 1024, 1024);
        p.record(3, BlockOutcome::Zero, 1000, 1000);
        let s = p.stats();
        assert_eq!(s.blocks, 4);
        assert_eq!(s.diff_blocks, 3);
        assert_eq!(s.orig_bytes, 1024 + 1024 + 1024 + 1000);
        assert_eq!(s.wire_bytes, 300 + 1024 + 1000);
    }

    #[test]
    fn outcome_tags_are_stable() {
        assert_eq!(BlockOutcome::InSync.tag(), '-');
        assert_eq!(BlockOutcome::Raw.tag(), 'w');
        assert_eq!(BlockOutcome::Compressed.tag(), 'c');
        assert_eq!(BlockOutcome::Zero.tag(), 'z');
    }
}
