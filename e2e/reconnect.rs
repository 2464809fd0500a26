//! E2E: a connection torn down mid-transfer is survived.
//!
//! The initiator talks to the responder through a proxy that kills the first
//! connection after a fixed number of forwarded bytes.  The stream wrapper
//! reconnects, the exchange for the interrupted block is reissued on a fresh
//! responder session, and the transfer completes bit-exact.

use std::fs;
use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::thread;

use bsync::{client, server, SyncConfig};
use tempfile::TempDir;

const BS: u32 = 64 * 1024;

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
        workers: 1,
        quiet: true,
        ..SyncConfig::default()
    }
}

/// Forward bytes between two sockets; kill both after `limit` bytes.
fn pump(mut from: TcpStream, mut to: TcpStream, limit: Option<usize>) {
    let mut buf = [0u8; 4096];
    let mut total = 0usize;
    loop {
        let n = match from.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        if to.write_all(&buf[..n]).is_err() {
            break;
        }
        total += n;
        if limit.is_some_and(|l| total >= l) {
            break;
        }
    }
    let _ = from.shutdown(Shutdown::Both);
    let _ = to.shutdown(Shutdown::Both);
}

/// TCP proxy whose first accepted connection dies after `kill_after` bytes of
/// initiator traffic; later connections forward transparently.
fn flaky_proxy(upstream: SocketAddr, kill_after: usize) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    thread::spawn(move || {
        let mut first = true;
        for conn in listener.incoming() {
            let Ok(down) = conn else { break };
            let Ok(up) = TcpStream::connect(upstream) else { break };
            let limit = first.then_some(kill_after);
            first = false;
            let down2 = down.try_clone().unwrap();
            let up2 = up.try_clone().unwrap();
            thread::spawn(move || pump(down, up, limit));
            thread::spawn(move || pump(up2, down2, None));
        }
    });
    addr
}

#[test]
fn transfer_survives_connection_reset() {
    let dir = TempDir::new().unwrap();
    let src = dir.path().join("src.img");
    let dst = dir.path().join("dst.img");
    let content = pseudo_random(8 * BS as usize, 0x0bad);
    fs::write(&src, &content).unwrap();
    fs::write(&dst, vec![0u8; content.len()]).unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let upstream = listener.local_addr().unwrap();
    let server_cfg = quiet_config(dst.clone());
    let responder = thread::spawn(move || server::serve_on(listener, server_cfg));

    // Cut the first connection a few frames in (mid block 2 or 3).
    let proxy = flaky_proxy(upstream, 3 * BS as usize / 2);

    let stats = client::push(&quiet_config(src), &proxy.to_string()).unwrap();
    responder.join().unwrap().unwrap();

    assert_eq!(fs::read(&dst).unwrap(), content);
    assert_eq!(stats.blocks, 9);
}
