//! Responder driver: accept loop and per-connection sessions.
//!
//! Every connection gets its own session thread; an initiator running `w`
//! push workers therefore holds `w` independent sessions whose per-connection
//! frame order is preserved.  All sessions of a transfer share one lazily
//! created state (target handle + fingerprint cache): the first frame fixes
//! the block partitioning, truncates a regular target to the announced size,
//! and later connections advertising a different block size are rejected.
//!
//! A `done` frame flushes the target and stops the accept loop; process exit
//! is the caller's business, which keeps the responder embeddable in tests.

use std::io::{self, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, Sender};
use tracing::{debug, info, warn};

use crate::blockio::BlockFile;
use crate::cache::{read_block_payload, PrecomputeCache};
use crate::codec::BlockCodec;
use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::fingerprint::{Digest, DIGEST_LEN, EOF_DIGEST, ERR_DIGEST, ZERO_DIGEST};
use crate::msg::{Frame, FRAME_LEN};
use crate::net::shutdown_requested;
use crate::progress::{BlockOutcome, Progress};

// ---------------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------------

/// Bind and serve until a `done` frame arrives.
pub fn serve(cfg: &SyncConfig, listen: &str, port: u16) -> Result<()> {
    let listener = TcpListener::bind((listen, port)).map_err(SyncError::net)?;
    serve_on(listener, cfg.clone())
}

/// Serve on an already-bound listener.  Prints the READY line (the SSH
/// launcher greps for it) and returns after the transfer terminates.
pub fn serve_on(listener: TcpListener, cfg: SyncConfig) -> Result<()> {
    let addr = listener.local_addr().map_err(SyncError::net)?;
    let shared = Arc::new(Shared {
        cfg,
        state: Mutex::new(None),
    });

    println!("READY, listening on {addr}");
    let _ = io::stdout().flush();
    info!(%addr, device = %shared.cfg.device.display(), "responder listening");

    let (done_tx, done_rx) = bounded::<()>(1);
    {
        let shared = Arc::clone(&shared);
        thread::spawn(move || accept_loop(listener, shared, done_tx));
    }

    // Wait for the transfer to finish, staying responsive to SIGINT.
    loop {
        match done_rx.recv_timeout(Duration::from_millis(500)) {
            Ok(()) => break,
            Err(_) if shutdown_requested() => break,
            Err(_) => {}
        }
    }

    if let Some(st) = shared.state.lock().unwrap().as_ref() {
        if let Err(e) = st.file.flush() {
            warn!(error = %e, "flush of target failed");
        }
    }
    Ok(())
}

fn accept_loop(listener: TcpListener, shared: Arc<Shared>, done_tx: Sender<()>) {
    loop {
        match listener.accept() {
            Ok((conn, peer)) => {
                debug!(%peer, "connection accepted");
                let shared = Arc::clone(&shared);
                let done_tx = done_tx.clone();
                thread::spawn(move || {
                    if let Err(e) = handle_conn(conn, &shared, &done_tx) {
                        warn!(%peer, error = %e, "session failed");
                    }
                });
            }
            Err(e) => {
                warn!(error = %e, "accept failed");
                if shutdown_requested() {
                    return;
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Shared transfer state
// ---------------------------------------------------------------------------

struct Shared {
    cfg: SyncConfig,
    state: Mutex<Option<Arc<SessionState>>>,
}

struct SessionState {
    file: Arc<BlockFile>,
    block_size: u32,
    cache: PrecomputeCache,
    progress: Progress,
}

impl Shared {
    /// Get the transfer state, creating it from the first frame seen.
    ///
    /// Push first frames announce the source size: a regular target is
    /// truncated to it before the target handle (and hence the cache's
    /// last-block bound) is fixed.
    fn session(&self, frame: &Frame) -> Result<Arc<SessionState>> {
        let mut guard = self.state.lock().unwrap();
        if let Some(st) = guard.as_ref() {
            if st.block_size != frame.block_size {
                return Err(SyncError::ProtocolViolation(format!(
                    "block size {} conflicts with established {}",
                    frame.block_size, st.block_size
                )));
            }
            return Ok(Arc::clone(st));
        }

        let block_size = frame.block_size;
        if block_size == 0 {
            return Err(SyncError::ProtocolViolation("zero block size".into()));
        }
        let path: &PathBuf = &self.cfg.device;
        if frame.file_size > 0 {
            let target = BlockFile::open_target(path).map_err(SyncError::Write)?;
            target
                .truncate_to(frame.file_size)
                .map_err(SyncError::Write)?;
        }
        let file = Arc::new(BlockFile::open_target(path).map_err(SyncError::Write)?);
        let cache = PrecomputeCache::new(
            Arc::clone(&file),
            block_size,
            self.cfg.window,
            false,
            None,
        );
        let last_block = if frame.file_size > 0 {
            frame.file_size / block_size as u64
        } else {
            file.len() / block_size as u64
        };
        let progress = Progress::new(0, last_block, block_size, frame.file_size.max(file.len()), self.cfg.quiet);
        info!(
            block_size,
            file_size = frame.file_size,
            last_block,
            "transfer state established"
        );

        let st = Arc::new(SessionState {
            file,
            block_size,
            cache,
            progress,
        });
        *guard = Some(Arc::clone(&st));
        Ok(st)
    }
}

// ---------------------------------------------------------------------------
// Session loop
// ---------------------------------------------------------------------------

fn handle_conn(conn: TcpStream, shared: &Shared, done_tx: &Sender<()>) -> Result<()> {
    let mut writer = conn.try_clone().map_err(SyncError::net)?;
    let mut reader = BufReader::new(conn);
    let codec = BlockCodec::new(shared.cfg.level);
    let mut first = true;

    loop {
        let mut wire = [0u8; FRAME_LEN];
        match reader.read_exact(&mut wire) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                debug!("connection ended");
                return Ok(());
            }
            Err(e) => return Err(SyncError::net(e)),
        }
        let frame = Frame::unpack(&wire)?;

        if frame.done {
            info!(block = frame.block_idx, "done frame received");
            if let Some(st) = shared.state.lock().unwrap().as_ref() {
                let _ = st.file.flush();
                st.progress.finish();
            }
            let _ = done_tx.send(());
            return Ok(());
        }

        let st = shared.session(&frame)?;

        if first {
            first = false;
            // A sizeless query opens a pull session: the peer wants to read.
            if frame.file_size == 0 && frame.data_size == 0 {
                return pull_session(st, shared, reader, writer, codec, done_tx);
            }
        }

        let offset = frame.block_idx * st.block_size as u64;
        if frame.data_size == 0 {
            // Digest query.
            st.cache.ensure_window(frame.block_idx);
            let digest = st.cache.wait_for_fingerprint(frame.block_idx);
            writer.write_all(&digest).map_err(SyncError::net)?;
            st.progress
                .record(frame.block_idx, BlockOutcome::InSync, st.block_size as usize, 0);
            continue;
        }

        // Payload application.
        let mut data = vec![0u8; frame.data_size as usize];
        reader.read_exact(&mut data).map_err(SyncError::net)?;

        let outcome = if frame.zero {
            st.file
                .write_zeros(offset, frame.data_size as usize)
                .map_err(SyncError::Write)?;
            BlockOutcome::Zero
        } else if frame.compressed {
            // A payload that does not decode leaves the target block
            // undefined; this session cannot continue.
            let raw = codec.decode(&data)?;
            st.file.write_at(offset, &raw).map_err(SyncError::Write)?;
            BlockOutcome::Compressed
        } else {
            st.file.write_at(offset, &data).map_err(SyncError::Write)?;
            BlockOutcome::Raw
        };
        st.progress
            .record(frame.block_idx, outcome, st.block_size as usize, data.len());
    }
}

// ---------------------------------------------------------------------------
// Pull session: this endpoint is the source
// ---------------------------------------------------------------------------

fn pull_session(
    st: Arc<SessionState>,
    shared: &Shared,
    mut reader: BufReader<TcpStream>,
    mut writer: TcpStream,
    codec: BlockCodec,
    done_tx: &Sender<()>,
) -> Result<()> {
    let file_size = st.file.len();
    let block_size = st.block_size;
    let encode = shared.cfg.compress.then_some(codec);

    // Describe the object; the initiator sizes its target from this.
    let meta = Frame::query(0, block_size, file_size).pack();
    writer.write_all(&meta).map_err(SyncError::net)?;
    info!(file_size, block_size, "pull session opened");

    loop {
        let mut wire = [0u8; FRAME_LEN];
        match reader.read_exact(&mut wire) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                debug!("pull connection ended");
                return Ok(());
            }
            Err(e) => return Err(SyncError::net(e)),
        }
        let frame = Frame::unpack(&wire)?;
        if frame.done {
            info!("pull transfer complete");
            st.progress.finish();
            let _ = done_tx.send(());
            return Ok(());
        }

        let mut peer: Digest = [0u8; DIGEST_LEN];
        reader.read_exact(&mut peer).map_err(SyncError::net)?;

        let idx = frame.block_idx;
        if idx > st.cache.last_block() {
            let end = Frame::end(idx, block_size, file_size).pack();
            writer.write_all(&end).map_err(SyncError::net)?;
            continue;
        }

        st.cache.ensure_window(idx);
        let local = st.cache.wait_for_fingerprint(idx);
        if local == ERR_DIGEST {
            // The source itself is unreadable here; nothing sane to serve.
            return Err(SyncError::BlockUnreadable(idx));
        }

        if local == peer || local == EOF_DIGEST {
            let reply = Frame::query(idx, block_size, file_size).pack();
            writer.write_all(&reply).map_err(SyncError::net)?;
            st.progress
                .record(idx, BlockOutcome::InSync, block_size as usize, 0);
            continue;
        }

        let payload = read_block_payload(&st.file, encode, block_size, idx)?;
        let (reply, outcome) = if local == ZERO_DIGEST {
            (
                Frame::payload(idx, block_size, file_size, payload.raw_len as u32, false, true),
                BlockOutcome::Zero,
            )
        } else if payload.compressed {
            (
                Frame::payload(
                    idx,
                    block_size,
                    file_size,
                    payload.bytes.len() as u32,
                    true,
                    false,
                ),
                BlockOutcome::Compressed,
            )
        } else {
            (
                Frame::payload(
                    idx,
                    block_size,
                    file_size,
                    payload.bytes.len() as u32,
                    false,
                    false,
                ),
                BlockOutcome::Raw,
            )
        };
        writer.write_all(&reply.pack()).map_err(SyncError::net)?;
        writer.write_all(&payload.bytes).map_err(SyncError::net)?;
        st.progress
            .record(idx, outcome, payload.raw_len, payload.bytes.len());
    }
}
