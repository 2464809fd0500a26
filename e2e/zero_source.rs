//! E2E: an all-zero source clears a dirty target with explicit zero frames.
//!
//! Zero payloads are announced with the zero flag, shipped raw, and never
//! compressed; the target ends up bit-for-bit zero including a short tail.

use std::fs;
use std::net::TcpListener;
use std::thread;

use bsync::{client, server, SyncConfig};
use tempfile::TempDir;

const BS: u32 = 128 * 1024;

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

fn quiet_config(device: std::path::PathBuf) -> SyncConfig {
    SyncConfig {
        device,
        block_size: BS,
        workers: 2,
        quiet: true,
        ..SyncConfig::default()
    }
}

#[test]
fn zero_source_clears_dirty_target() {
    let dir = TempDir::new().unwrap();
    let src = dir.path().join("src.img");
    let dst = dir.path().join("dst.img");
    let len = 6 * BS as usize + 500;
    fs::write(&src, vec![0u8; len]).unwrap();
    fs::write(&dst, pseudo_random(len, 0xdead)).unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let server_cfg = quiet_config(dst.clone());
    let responder = thread::spawn(move || server::serve_on(listener, server_cfg));

    let stats = client::push(&quiet_config(src), &addr).unwrap();
    responder.join().unwrap().unwrap();

    // Every destination block differed, and zero payloads travel raw:
    // wire bytes equal the object size exactly.
    assert_eq!(stats.diff_blocks, 7);
    assert_eq!(stats.wire_bytes, len as u64);
    assert_eq!(fs::read(&dst).unwrap(), vec![0u8; len]);
}

#[test]
fn zero_blocks_already_in_sync_are_skipped() {
    let dir = TempDir::new().unwrap();
    let src = dir.path().join("src.img");
    let dst = dir.path().join("dst.img");
    let len = 4 * BS as usize;
    fs::write(&src, vec![0u8; len]).unwrap();
    fs::write(&dst, vec![0u8; len]).unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let server_cfg = quiet_config(dst.clone());
    let responder = thread::spawn(move || server::serve_on(listener, server_cfg));

    let stats = client::push(&quiet_config(src), &addr).unwrap();
    responder.join().unwrap().unwrap();

    assert_eq!(stats.diff_blocks, 0);
    assert_eq!(stats.wire_bytes, 0);
}
