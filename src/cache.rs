//! Sliding-window precompute cache.
//!
//! Reading and fingerprinting a multi-megabyte block is expensive; the
//! network round-trip for its digest is latency-bound.  The cache decouples
//! the two: [`PrecomputeCache::ensure_window`] schedules background
//! production of fingerprints (and, when payload caching is on, of
//! transmit-ready payloads) for a window of upcoming indices, and the driver
//! blocks only on [`wait_for_fingerprint`]/[`wait_for_payload`] for the index
//! it is currently exchanging.
//!
//! Guarantees:
//! - at most one producer task ever runs per index (test-and-insert under a
//!   write lock);
//! - a slot is published exactly once and can be read any number of times;
//! - indices more than one window below the highest consumed index are
//!   evicted, bounding live memory to about `window * block_size`.
//!
//! [`wait_for_fingerprint`]: PrecomputeCache::wait_for_fingerprint
//! [`wait_for_payload`]: PrecomputeCache::wait_for_payload

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, RwLock};

use tracing::warn;

use crate::blockio::{is_zero, BlockFile};
use crate::codec::BlockCodec;
use crate::fingerprint::{block_digest, Digest, EOF_DIGEST, ERR_DIGEST, ZERO_DIGEST};
use crate::taskpool::TaskPool;

// ---------------------------------------------------------------------------
// One-shot slot
// ---------------------------------------------------------------------------

/// Single-producer cell: published once, readable any number of times.
struct Slot<T> {
    cell: Mutex<Option<T>>,
    ready: Condvar,
}

impl<T: Clone> Slot<T> {
    fn new() -> Self {
        Slot {
            cell: Mutex::new(None),
            ready: Condvar::new(),
        }
    }

    fn publish(&self, value: T) {
        let mut guard = self.cell.lock().unwrap();
        debug_assert!(guard.is_none(), "slot published twice");
        *guard = Some(value);
        self.ready.notify_all();
    }

    fn wait(&self) -> T {
        let mut guard = self.cell.lock().unwrap();
        while guard.is_none() {
            guard = self.ready.wait(guard).unwrap();
        }
        guard.as_ref().unwrap().clone()
    }
}

/// A transmit-ready payload: either the raw block bytes or their zstd
/// encoding, whichever the producer decided to cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedBlock {
    pub bytes: Vec<u8>,
    pub compressed: bool,
    /// Length of the raw block on disk (payload length before compression).
    pub raw_len: usize,
}

struct BlockSlot {
    digest: Slot<Digest>,
    /// Present only when payload caching is enabled for the cache.
    payload: Option<Slot<Option<CachedBlock>>>,
}

impl BlockSlot {
    fn new(store_data: bool) -> Self {
        BlockSlot {
            digest: Slot::new(),
            payload: store_data.then(Slot::new),
        }
    }
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

struct EvictCursor {
    /// One past the highest consumed index.
    base: u64,
    /// Lowest index that may still be resident.
    low: u64,
}

pub struct PrecomputeCache {
    file: Arc<BlockFile>,
    codec: Option<BlockCodec>,
    block_size: u32,
    /// Highest valid block index: `floor(file_size / block_size)`.
    last_block: u64,
    window: u64,
    store_data: bool,
    slots: RwLock<HashMap<u64, Arc<BlockSlot>>>,
    cursor: Mutex<EvictCursor>,
    pool: TaskPool,
}

impl PrecomputeCache {
    /// `codec` enables compress-at-production; it only matters when
    /// `store_data` is true.
    pub fn new(
        file: Arc<BlockFile>,
        block_size: u32,
        window: u64,
        store_data: bool,
        codec: Option<BlockCodec>,
    ) -> Self {
        let last_block = file.len() / block_size as u64;
        let window = window.max(1);
        let threads = num_cpus::get().clamp(1, window as usize + 1);
        let pool = TaskPool::new(threads, window as usize + 1)
            .expect("task pool with nonzero shape");
        PrecomputeCache {
            file,
            codec,
            block_size,
            last_block,
            window,
            store_data,
            slots: RwLock::new(HashMap::new()),
            cursor: Mutex::new(EvictCursor { base: 0, low: 0 }),
            pool,
        }
    }

    pub fn last_block(&self) -> u64 {
        self.last_block
    }

    /// Number of resident slots; pending plus published, minus evicted.
    pub fn resident_slots(&self) -> usize {
        self.slots.read().unwrap().len()
    }

    /// Schedule production for every unscheduled index in
    /// `[i, min(i + window, last_block)]`.  Idempotent: an index is produced
    /// at most once regardless of how many callers pass over it.
    pub fn ensure_window(&self, i: u64) {
        let hi = (i.saturating_add(self.window)).min(self.last_block);
        for j in i..=hi {
            if self.slots.read().unwrap().contains_key(&j) {
                continue;
            }
            let slot = {
                let mut slots = self.slots.write().unwrap();
                if slots.contains_key(&j) {
                    continue; // lost the race; already scheduled
                }
                let slot = Arc::new(BlockSlot::new(self.store_data));
                slots.insert(j, Arc::clone(&slot));
                slot
            };

            let file = Arc::clone(&self.file);
            let codec = self.codec;
            let block_size = self.block_size;
            self.pool
                .submit(Box::new(move || produce(&file, codec, block_size, j, &slot)));
        }
    }

    /// Block until the digest for `i` is published.  Out-of-range indices
    /// yield [`ZERO_DIGEST`] without scheduling anything.  Consuming an index
    /// advances the window base and releases entries that fell out of it.
    pub fn wait_for_fingerprint(&self, i: u64) -> Digest {
        if i > self.last_block {
            return ZERO_DIGEST;
        }
        let slot = self.slot(i);
        let digest = slot.digest.wait();
        self.advance(i);
        digest
    }

    /// Block until the payload for `i` is published.  `None` when payload
    /// caching is off, the index is out of range, or the block could not be
    /// read; the caller then falls back to reading the object directly.
    pub fn wait_for_payload(&self, i: u64) -> Option<CachedBlock> {
        if !self.store_data || i > self.last_block {
            return None;
        }
        let slot = self.slot(i);
        slot.payload.as_ref()?.wait()
    }

    fn slot(&self, i: u64) -> Arc<BlockSlot> {
        if let Some(slot) = self.slots.read().unwrap().get(&i) {
            return Arc::clone(slot);
        }
        // Not scheduled yet (driver jumped ahead of its own window calls).
        self.ensure_window(i);
        Arc::clone(
            self.slots
                .read()
                .unwrap()
                .get(&i)
                .expect("ensure_window schedules its own start index"),
        )
    }

    /// Slide the window base past `i` and drop entries below `base - window`.
    fn advance(&self, i: u64) {
        let mut cursor = self.cursor.lock().unwrap();
        if i + 1 > cursor.base {
            cursor.base = i + 1;
        }
        let cutoff = cursor.base.saturating_sub(self.window);
        if cutoff > cursor.low {
            let mut slots = self.slots.write().unwrap();
            for k in cursor.low..cutoff {
                slots.remove(&k);
            }
            cursor.low = cutoff;
        }
    }
}

// ---------------------------------------------------------------------------
// Producer body
// ---------------------------------------------------------------------------

fn produce(
    file: &BlockFile,
    codec: Option<BlockCodec>,
    block_size: u32,
    idx: u64,
    slot: &BlockSlot,
) {
    let mut buf = vec![0u8; block_size as usize];
    let n = match file.read_block(idx, block_size, &mut buf) {
        Ok(n) => n,
        Err(e) => {
            warn!(block = idx, error = %e, "block read failed");
            if let Some(p) = &slot.payload {
                p.publish(None);
            }
            slot.digest.publish(ERR_DIGEST);
            return;
        }
    };

    if n == 0 {
        // At or past end-of-object; happens for the final index when the
        // object size is an exact multiple of the block size.
        if let Some(p) = &slot.payload {
            p.publish(None);
        }
        slot.digest.publish(EOF_DIGEST);
        return;
    }

    buf.truncate(n);

    if is_zero(&buf) {
        if let Some(p) = &slot.payload {
            p.publish(Some(CachedBlock {
                bytes: buf,
                compressed: false,
                raw_len: n,
            }));
        }
        slot.digest.publish(ZERO_DIGEST);
        return;
    }

    let digest = block_digest(&buf);

    if let Some(p) = &slot.payload {
        let cached = match codec.map(|c| c.encode(&buf)) {
            Some(Ok(enc)) if enc.len() < n => CachedBlock {
                bytes: enc,
                compressed: true,
                raw_len: n,
            },
            Some(Err(e)) => {
                // Degrade to the raw block; compression is an optimization.
                warn!(block = idx, error = %e, "compression failed, caching raw block");
                CachedBlock {
                    bytes: buf,
                    compressed: false,
                    raw_len: n,
                }
            }
            _ => CachedBlock {
                bytes: buf,
                compressed: false,
                raw_len: n,
            },
        };
        p.publish(Some(cached));
    }
    slot.digest.publish(digest);
}

/// Read block `idx` straight from the object and apply the same
/// compress-iff-smaller rule the producers use.  Fallback for drivers that
/// need a payload the cache has no handle for.
pub fn read_block_payload(
    file: &BlockFile,
    codec: Option<BlockCodec>,
    block_size: u32,
    idx: u64,
) -> crate::error::Result<CachedBlock> {
    let mut buf = vec![0u8; block_size as usize];
    let n = file
        .read_block(idx, block_size, &mut buf)
        .map_err(crate::error::SyncError::Read)?;
    buf.truncate(n);

    if !is_zero(&buf) {
        if let Some(c) = codec {
            match c.encode(&buf) {
                Ok(enc) if enc.len() < n => {
                    return Ok(CachedBlock {
                        bytes: enc,
                        compressed: true,
                        raw_len: n,
                    })
                }
                Ok(_) => {}
                Err(e) => warn!(block = idx, error = %e, "compression failed, using raw block"),
            }
        }
    }
    Ok(CachedBlock {
        bytes: buf,
        compressed: false,
        raw_len: n,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Level;
    use crate::fingerprint::block_digest;
    use std::fs;
    use tempfile::TempDir;

    const BS: u32 = 1024;

    fn fixture(content: &[u8]) -> (TempDir, Arc<BlockFile>) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("obj");
        fs::write(&path, content).unwrap();
        let file = Arc::new(BlockFile::open_source(&path).unwrap());
        (dir, file)
    }

    #[test]
    fn digests_match_direct_computation() {
        let content: Vec<u8> = (0u8..=255).cycle().take(3 * BS as usize + 100).collect();
        let (_dir, file) = fixture(&content);
        let cache = PrecomputeCache::new(file, BS, 4, false, None);
        assert_eq!(cache.last_block(), 3);

        cache.ensure_window(0);
        for i in 0..=3u64 {
            let lo = (i * BS as u64) as usize;
            let hi = (lo + BS as usize).min(content.len());
            assert_eq!(cache.wait_for_fingerprint(i), block_digest(&content[lo..hi]));
        }
    }

    #[test]
    fn out_of_range_is_zero_without_scheduling() {
        let (_dir, file) = fixture(&[1u8; 100]);
        let cache = PrecomputeCache::new(file, BS, 4, false, None);
        assert_eq!(cache.wait_for_fingerprint(50), ZERO_DIGEST);
        assert_eq!(cache.resident_slots(), 0);
    }

    #[test]
    fn zero_blocks_publish_the_zero_sentinel() {
        let mut content = vec![0u8; 2 * BS as usize];
        content.extend_from_slice(&[9u8; 10]);
        let (_dir, file) = fixture(&content);
        let cache = PrecomputeCache::new(file, BS, 4, true, None);

        cache.ensure_window(0);
        assert_eq!(cache.wait_for_fingerprint(0), ZERO_DIGEST);
        let p = cache.wait_for_payload(0).unwrap();
        assert!(!p.compressed);
        assert_eq!(p.bytes, vec![0u8; BS as usize]);
    }

    #[test]
    fn exact_multiple_publishes_eof_for_final_index() {
        let (_dir, file) = fixture(&[5u8; 2 * BS as usize]);
        let cache = PrecomputeCache::new(file, BS, 4, false, None);
        assert_eq!(cache.last_block(), 2);
        cache.ensure_window(0);
        assert_ne!(cache.wait_for_fingerprint(0), ZERO_DIGEST);
        assert_ne!(cache.wait_for_fingerprint(1), ZERO_DIGEST);
        assert_eq!(cache.wait_for_fingerprint(2), EOF_DIGEST);
    }

    #[test]
    fn payloads_compress_when_smaller() {
        let content: Vec<u8> = b"abcd".iter().cycle().take(BS as usize).cloned().collect();
        let (_dir, file) = fixture(&content);
        let codec = BlockCodec::new(Level::Fastest);
        let cache = PrecomputeCache::new(file, BS, 4, true, Some(codec));

        cache.ensure_window(0);
        let p = cache.wait_for_payload(0).unwrap();
        assert!(p.compressed);
        assert!(p.bytes.len() < BS as usize);
        assert_eq!(p.raw_len, BS as usize);
        assert_eq!(codec.decode(&p.bytes).unwrap(), content);
    }

    #[test]
    fn payload_queries_without_store_data_yield_none() {
        let (_dir, file) = fixture(&[3u8; 2048]);
        let cache = PrecomputeCache::new(file, BS, 4, false, None);
        cache.ensure_window(0);
        cache.wait_for_fingerprint(0);
        assert!(cache.wait_for_payload(0).is_none());
    }

    #[test]
    fn scheduling_is_idempotent() {
        let (_dir, file) = fixture(&vec![7u8; 10 * BS as usize]);
        let cache = PrecomputeCache::new(file, BS, 4, false, None);
        cache.ensure_window(0);
        let first = cache.resident_slots();
        cache.ensure_window(0);
        cache.ensure_window(2);
        // [0, 4] then [2, 6]: only 5 and 6 are new.
        assert_eq!(first, 5);
        assert_eq!(cache.resident_slots(), 7);
    }

    #[test]
    fn consumption_evicts_below_the_window() {
        let (_dir, file) = fixture(&vec![7u8; 20 * BS as usize]);
        let cache = PrecomputeCache::new(file, BS, 4, false, None);
        for i in 0..=10u64 {
            cache.ensure_window(i);
            cache.wait_for_fingerprint(i);
        }
        // base = 11, cutoff = 7: indices 0..6 must be gone.
        let slots = cache.slots.read().unwrap();
        for k in 0..7u64 {
            assert!(!slots.contains_key(&k), "index {k} should be evicted");
        }
        assert!(slots.contains_key(&7));
    }

    #[test]
    fn published_values_survive_repeated_reads() {
        let (_dir, file) = fixture(&[11u8; 512]);
        let cache = PrecomputeCache::new(file, BS, 4, true, None);
        cache.ensure_window(0);
        let a = cache.wait_for_fingerprint(0);
        let b = cache.wait_for_fingerprint(0);
        assert_eq!(a, b);
        let p1 = cache.wait_for_payload(0).unwrap();
        let p2 = cache.wait_for_payload(0).unwrap();
        assert_eq!(p1, p2);
    }
}
