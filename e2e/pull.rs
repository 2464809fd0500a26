//! E2E: download mode, where the initiator pulls the responder's object.

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
        quiet: true,
        ..SyncConfig::default()
    }
}

fn run_pull(remote_src: &std::path::Path, local_dst: &std::path::Path) -> bsync::SyncStats {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let server_cfg = quiet_config(remote_src.to_path_buf());
    let responder = thread::spawn(move || server::serve_on(listener, server_cfg));
    let stats = client::pull(&quiet_config(local_dst.to_path_buf()), &addr).unwrap();
    responder.join().unwrap().unwrap();
    stats
}

#[test]
fn pull_into_empty_file_truncates_to_remote_size() {
    let dir = TempDir::new().unwrap();
    let remote_src = dir.path().join("remote.img");
    let local_dst = dir.path().join("local.img");
    let content = pseudo_random(5 * BS as usize + 321, 0x5eed);
    fs::write(&remote_src, &content).unwrap();
    // Local side starts empty; the metadata frame sizes it.

    let stats = run_pull(&remote_src, &local_dst);

    assert_eq!(stats.diff_blocks, 6);
    let got = fs::read(&local_dst).unwrap();
    assert_eq!(got.len(), content.len());
    assert_eq!(got, content);
}

#[test]
fn pull_shrinks_an_oversized_local_file() {
    let dir = TempDir::new().unwrap();
    let remote_src = dir.path().join("remote.img");
    let local_dst = dir.path().join("local.img");
    let content = pseudo_random(3 * BS as usize, 0x1234);
    fs::write(&remote_src, &content).unwrap();
    fs::write(&local_dst, pseudo_random(9 * BS as usize, 0x4321)).unwrap();

    run_pull(&remote_src, &local_dst);

    let got = fs::read(&local_dst).unwrap();
    assert_eq!(got.len(), content.len(), "local file must shrink to the remote size");
    assert_eq!(got, content);
}

#[test]
fn second_pull_moves_nothing() {
    let dir = TempDir::new().unwrap();
    let remote_src = dir.path().join("remote.img");
    let local_dst = dir.path().join("local.img");
    let content = pseudo_random(4 * BS as usize + 99, 0xabcd);
    fs::write(&remote_src, &content).unwrap();

    let first = run_pull(&remote_src, &local_dst);
    assert!(first.diff_blocks > 0);

    let second = run_pull(&remote_src, &local_dst);
    assert_eq!(second.diff_blocks, 0);
    assert_eq!(second.wire_bytes, 0);
    assert_eq!(fs::read(&local_dst).unwrap(), content);
}

#[test]
fn pull_of_zero_filled_remote_clears_local() {
    let dir = TempDir::new().unwrap();
    let remote_src = dir.path().join("remote.img");
    let local_dst = dir.path().join("local.img");
    let len = 3 * BS as usize + 50;
    fs::write(&remote_src, vec![0u8; len]).unwrap();
    fs::write(&local_dst, pseudo_random(len, 0x7777)).unwrap();

    run_pull(&remote_src, &local_dst);

    assert_eq!(fs::read(&local_dst).unwrap(), vec![0u8; len]);
}
