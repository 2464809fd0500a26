//! E2E: full push of a differing object, including a short final block.

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

fn quiet_config(device: std::path::PathBuf, workers: usize) -> SyncConfig {
    SyncConfig {
        device,
        block_size: BS,
        workers,
        quiet: true,
        ..SyncConfig::default()
    }
}

fn run_push(src: &std::path::Path, dst: &std::path::Path, workers: usize) -> bsync::SyncStats {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let server_cfg = quiet_config(dst.to_path_buf(), 1);
    let responder = thread::spawn(move || server::serve_on(listener, server_cfg));
    let stats = client::push(&quiet_config(src.to_path_buf(), workers), &addr).unwrap();
    responder.join().unwrap().unwrap();
    stats
}

#[test]
fn random_source_over_zero_target() {
    let dir = TempDir::new().unwrap();
    let src = dir.path().join("src.img");
    let dst = dir.path().join("dst.img");
    // 9 full blocks plus a 1000-byte tail.
    let content = pseudo_random(9 * BS as usize + 1000, 0xd15c);
    fs::write(&src, &content).unwrap();
    fs::write(&dst, vec![0u8; content.len()]).unwrap();

    let stats = run_push(&src, &dst, 4);

    assert_eq!(stats.blocks, 10);
    assert_eq!(stats.diff_blocks, 10);
    assert_eq!(fs::read(&dst).unwrap(), content);
}

#[test]
fn oversized_target_is_truncated() {
    let dir = TempDir::new().unwrap();
    let src = dir.path().join("src.img");
    let dst = dir.path().join("dst.img");
    let content = pseudo_random(3 * BS as usize + 17, 0xcafe);
    fs::write(&src, &content).unwrap();
    // Target starts larger than the source.
    fs::write(&dst, pseudo_random(8 * BS as usize, 0xbeef)).unwrap();

    run_push(&src, &dst, 2);

    let got = fs::read(&dst).unwrap();
    assert_eq!(got.len(), content.len(), "regular target must be truncated");
    assert_eq!(got, content);
}

#[test]
fn compressible_content_shrinks_on_the_wire() {
    let dir = TempDir::new().unwrap();
    let src = dir.path().join("src.img");
    let dst = dir.path().join("dst.img");
    let content: Vec<u8> = b"log line: everything is fine\n"
        .iter()
        .cycle()
        .take(4 * BS as usize)
        .cloned()
        .collect();
    fs::write(&src, &content).unwrap();
    fs::write(&dst, b"").unwrap();

    let stats = run_push(&src, &dst, 2);

    assert!(
        stats.wire_bytes < stats.orig_bytes / 2,
        "text should compress well ({} vs {})",
        stats.wire_bytes,
        stats.orig_bytes
    );
    assert_eq!(fs::read(&dst).unwrap(), content);
}

#[test]
fn no_compress_sends_raw_blocks() {
    let dir = TempDir::new().unwrap();
    let src = dir.path().join("src.img");
    let dst = dir.path().join("dst.img");
    let content: Vec<u8> = b"abc".iter().cycle().take(2 * BS as usize).cloned().collect();
    fs::write(&src, &content).unwrap();
    fs::write(&dst, b"").unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let server_cfg = quiet_config(dst.clone(), 1);
    let responder = thread::spawn(move || server::serve_on(listener, server_cfg));

    let mut cfg = quiet_config(src, 1);
    cfg.compress = false;
    let stats = client::push(&cfg, &addr).unwrap();
    responder.join().unwrap().unwrap();

    assert_eq!(stats.wire_bytes, content.len() as u64);
    assert_eq!(fs::read(&dst).unwrap(), content);
}
