//! E2E: pushing an already-synchronized object moves no payload.
//!
//! Both sides hold identical content; every digest query comes back equal,
//! so the wire carries only queries, digests, and the final done frame.

use std::fs;
use std::net::TcpListener;
use std::thread;

use bsync::{client, server, SyncConfig};
use tempfile::TempDir;

const BS: u32 = 256 * 1024;

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

fn quiet_config(device: std::path::PathBuf, workers: usize) -> SyncConfig {
    SyncConfig {
        device,
        block_size: BS,
        workers,
        quiet: true,
        ..SyncConfig::default()
    }
}

#[test]
fn identical_objects_transfer_nothing() {
    let dir = TempDir::new().unwrap();
    let src = dir.path().join("src.img");
    let dst = dir.path().join("dst.img");
    let content = pseudo_random(2 * 1024 * 1024, 0xb10c);
    fs::write(&src, &content).unwrap();
    fs::write(&dst, &content).unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let server_cfg = quiet_config(dst.clone(), 1);
    let responder = thread::spawn(move || server::serve_on(listener, server_cfg));

    let stats = client::push(&quiet_config(src.clone(), 2), &addr).unwrap();
    responder.join().unwrap().unwrap();

    // 2 MiB / 256 KiB = 8 full blocks, plus the inclusive final index.
    assert_eq!(stats.blocks, 9);
    assert_eq!(stats.diff_blocks, 0);
    assert_eq!(stats.wire_bytes, 0);
    assert_eq!(fs::read(&dst).unwrap(), content);
}

#[test]
fn second_pass_after_transfer_is_free() {
    let dir = TempDir::new().unwrap();
    let src = dir.path().join("src.img");
    let dst = dir.path().join("dst.img");
    let content = pseudo_random(1024 * 1024 + 777, 0xfeed);
    fs::write(&src, &content).unwrap();
    fs::write(&dst, b"").unwrap();

    for pass in 0..2 {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let server_cfg = quiet_config(dst.clone(), 1);
        let responder = thread::spawn(move || server::serve_on(listener, server_cfg));

        let stats = client::push(&quiet_config(src.clone(), 2), &addr).unwrap();
        responder.join().unwrap().unwrap();

        if pass == 0 {
            assert!(stats.diff_blocks > 0);
        } else {
            assert_eq!(stats.diff_blocks, 0, "second pass must be a no-op");
            assert_eq!(stats.wire_bytes, 0);
        }
        assert_eq!(fs::read(&dst).unwrap(), content);
    }
}
