//! E2E: window discipline of the precompute cache over a 100-block object.

use std::fs;
use std::sync::Arc;

use bsync::blockio::BlockFile;
use bsync::cache::PrecomputeCache;
use bsync::fingerprint::{block_digest, EOF_DIGEST};
use tempfile::TempDir;

const BS: u32 = 1024;
const WINDOW: u64 = 4;

fn pseudo_random(len: usize, mut state: u64) -> Vec<u8> {
    (0..len)
        .map(|_| {
            state = state
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            (state >> 33) as u8
        })
        .collect()
}

#[test]
fn sequential_consumption_stays_within_the_window() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("obj");
    let content = pseudo_random(100 * BS as usize, 0xacce);
    fs::write(&path, &content).unwrap();

    let file = Arc::new(BlockFile::open_source(&path).unwrap());
    let cache = PrecomputeCache::new(Arc::clone(&file), BS, WINDOW, false, None);
    assert_eq!(cache.last_block(), 100);

    for i in 0..=100u64 {
        cache.ensure_window(i);
        let digest = cache.wait_for_fingerprint(i);

        if i < 100 {
            let lo = (i * BS as u64) as usize;
            assert_eq!(digest, block_digest(&content[lo..lo + BS as usize]));
        } else {
            // Exact multiple: the inclusive final index reads zero bytes.
            assert_eq!(digest, EOF_DIGEST);
        }

        // Scheduled at most up to i + W, evicted below i + 1 - W: resident
        // slots never exceed two windows regardless of producer timing.
        assert!(
            cache.resident_slots() <= 2 * WINDOW as usize + 1,
            "slot count {} exceeds the window bound at index {i}",
            cache.resident_slots()
        );
    }
}

#[test]
fn repeated_scheduling_never_spawns_a_second_producer() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("obj");
    fs::write(&path, pseudo_random(20 * BS as usize, 0x2222)).unwrap();

    let file = Arc::new(BlockFile::open_source(&path).unwrap());
    let cache = PrecomputeCache::new(file, BS, WINDOW, false, None);

    cache.ensure_window(0);
    let resident = cache.resident_slots();
    for _ in 0..50 {
        cache.ensure_window(0);
    }
    assert_eq!(cache.resident_slots(), resident);

    // Digests are published once and stable across arbitrarily many reads.
    let first = cache.wait_for_fingerprint(0);
    for _ in 0..10 {
        assert_eq!(cache.wait_for_fingerprint(0), first);
    }
}

#[test]
fn out_of_order_consumption_within_a_window_is_safe() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("obj");
    let content = pseudo_random(10 * BS as usize, 0x3333);
    fs::write(&path, &content).unwrap();

    let file = Arc::new(BlockFile::open_source(&path).unwrap());
    let cache = PrecomputeCache::new(file, BS, WINDOW, false, None);

    cache.ensure_window(0);
    // Consume 2 before 0 and 1, as concurrent push workers do.
    for i in [2u64, 0, 1, 3, 4] {
        let lo = (i * BS as u64) as usize;
        assert_eq!(
            cache.wait_for_fingerprint(i),
            block_digest(&content[lo..lo + BS as usize])
        );
    }
}
