//! Initiator drivers: push (upload) and pull (download).
//!
//! Push runs a producer that enqueues block indices into a bounded job queue
//! and `w` workers that each own a private reconnecting stream, so the
//! per-connection exchange order (query → digest → payload) is never
//! interleaved.  Pull is a single-stream sequential loop with a receive
//! timeout, reissuing the exchange for an index whenever the wait expires.

use std::io;
use std::sync::Arc;
use std::thread;

use crossbeam_channel::bounded;
use tracing::{debug, info, warn};

use crate::blockio::BlockFile;
use crate::cache::{read_block_payload, PrecomputeCache};
use crate::codec::BlockCodec;
use crate::config::{SyncConfig, PULL_RECV_TIMEOUT};
use crate::error::{Result, SyncError};
use crate::fingerprint::{Digest, DIGEST_LEN, EOF_DIGEST, ERR_DIGEST, ZERO_DIGEST};
use crate::msg::{Frame, FRAME_LEN, MAGIC, MAGIC_LEN};
use crate::net::{retry, shutdown_requested, ReconnectStream};
use crate::progress::{BlockOutcome, Progress, SyncStats};

// ---------------------------------------------------------------------------
// Push
// ---------------------------------------------------------------------------

/// Mirror the local object onto `remote`.
pub fn push(cfg: &SyncConfig, remote: &str) -> Result<SyncStats> {
    let file = Arc::new(BlockFile::open_source(&cfg.device).map_err(SyncError::Read)?);
    let block_size = cfg.block_size;
    let file_size = file.len();
    let last_block = file_size / block_size as u64;
    let workers = cfg.effective_workers();

    info!(
        device = %cfg.device.display(),
        remote,
        file_size,
        block_size,
        last_block,
        workers,
        "starting push"
    );

    // A sizeless first frame means "pull" to the responder, so an empty
    // source cannot be queried block-by-block; it has nothing to move anyway.
    if file_size == 0 {
        send_done(remote, last_block, block_size, 0)?;
        return Ok(Progress::new(0, 0, block_size, 0, cfg.quiet).finish());
    }

    let codec = cfg.compress.then(|| BlockCodec::new(cfg.level));
    let cache = Arc::new(PrecomputeCache::new(
        Arc::clone(&file),
        block_size,
        cfg.window,
        true,
        codec,
    ));
    let progress = Arc::new(Progress::new(
        cfg.skip, last_block, block_size, file_size, cfg.quiet,
    ));

    let (job_tx, job_rx) = bounded::<u64>(2 * workers);

    let result: Result<()> = thread::scope(|scope| {
        // Producer: feed indices; the queue bound throttles it when the
        // workers fall behind the network.
        scope.spawn(move || {
            for idx in cfg.skip..=last_block {
                if shutdown_requested() {
                    break;
                }
                if job_tx.send(idx).is_err() {
                    break; // all workers gone
                }
            }
            // Dropping the sender ends the workers' recv loops.
        });

        let mut handles = Vec::with_capacity(workers);
        for _ in 0..workers {
            let job_rx = job_rx.clone();
            let file = Arc::clone(&file);
            let cache = Arc::clone(&cache);
            let progress = Arc::clone(&progress);
            handles.push(scope.spawn(move || -> Result<()> {
                let mut stream = ReconnectStream::new(remote).map_err(SyncError::net)?;
                while let Ok(idx) = job_rx.recv() {
                    if shutdown_requested() {
                        break;
                    }
                    push_block(
                        &mut stream, &file, &cache, codec, block_size, file_size, idx, &progress,
                    )?;
                }
                stream.close();
                Ok(())
            }));
        }
        drop(job_rx);

        let mut first_err = None;
        for handle in handles {
            match handle.join().expect("push worker panicked") {
                Ok(()) => {}
                Err(e) => {
                    crate::net::request_shutdown();
                    warn!(error = %e, "push worker failed");
                    first_err.get_or_insert(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    });
    result?;

    // Workers are done; tell the responder the transfer is over.
    send_done(remote, last_block, block_size, file_size)?;

    Ok(progress.finish())
}

/// One complete block exchange on the worker's private connection.
#[allow(clippy::too_many_arguments)]
fn push_block(
    stream: &mut ReconnectStream,
    file: &BlockFile,
    cache: &PrecomputeCache,
    codec: Option<BlockCodec>,
    block_size: u32,
    file_size: u64,
    idx: u64,
    progress: &Progress,
) -> Result<()> {
    cache.ensure_window(idx);

    let query = Frame::query(idx, block_size, file_size).pack();
    let peer: Digest = retry("digest query", || {
        stream.write_all(&query)?;
        let mut digest = [0u8; DIGEST_LEN];
        stream.read_exact(&mut digest)?;
        Ok(digest)
    })
    .map_err(SyncError::net)?;

    let local = cache.wait_for_fingerprint(idx);
    if local == ERR_DIGEST {
        return Err(SyncError::BlockUnreadable(idx));
    }
    if local == peer || local == EOF_DIGEST {
        // In sync, or nothing on our side to send for this index.
        progress.record(idx, BlockOutcome::InSync, block_size as usize, 0);
        return Ok(());
    }

    let payload = match cache.wait_for_payload(idx) {
        Some(p) => p,
        None => read_block_payload(file, codec, block_size, idx)?,
    };

    let (frame, outcome) = if local == ZERO_DIGEST {
        // Explicit zero: announce with the zero flag and ship the raw bytes
        // so short final blocks need no special casing on the other side.
        (
            Frame::payload(idx, block_size, file_size, payload.raw_len as u32, false, true),
            BlockOutcome::Zero,
        )
    } else if payload.compressed {
        (
            Frame::payload(idx, block_size, file_size, payload.bytes.len() as u32, true, false),
            BlockOutcome::Compressed,
        )
    } else {
        (
            Frame::payload(idx, block_size, file_size, payload.bytes.len() as u32, false, false),
            BlockOutcome::Raw,
        )
    };
    let frame = frame.pack();

    // A plain write can land in a socket buffer and die with the connection
    // without anyone noticing.  The out-of-range query after the payload
    // forces a round trip on the same connection: its reply proves the peer
    // consumed the payload.  A retry re-sends the whole unit, which merely
    // rewrites the same block.
    let last_block = file_size / block_size as u64;
    let confirm = Frame::query(last_block + 1, block_size, file_size).pack();
    retry("block payload", || {
        stream.write_all(&frame)?;
        stream.write_all(&payload.bytes)?;
        stream.write_all(&confirm)?;
        let mut echo = [0u8; DIGEST_LEN];
        stream.read_exact(&mut echo)?;
        Ok(())
    })
    .map_err(SyncError::net)?;

    progress.record(idx, outcome, payload.raw_len, payload.bytes.len());
    Ok(())
}

/// Emit the terminating frame on a fresh connection.
fn send_done(remote: &str, last_block: u64, block_size: u32, file_size: u64) -> Result<()> {
    let mut stream = ReconnectStream::new(remote).map_err(SyncError::net)?;
    let frame = Frame::end(last_block, block_size, file_size).pack();
    retry("done frame", || stream.write_all(&frame)).map_err(SyncError::net)?;
    stream.close();
    debug!("done frame sent");
    Ok(())
}

// ---------------------------------------------------------------------------
// Pull
// ---------------------------------------------------------------------------

/// Mirror the remote object onto the local one.
pub fn pull(cfg: &SyncConfig, remote: &str) -> Result<SyncStats> {
    let block_size = cfg.block_size;
    let codec = BlockCodec::new(cfg.level);

    let mut stream = ReconnectStream::new(remote).map_err(SyncError::net)?;
    stream.set_read_timeout(Some(PULL_RECV_TIMEOUT));

    // Hello: a frame with no size information asks the responder to describe
    // its object.
    let hello = Frame::query(0, block_size, 0).pack();
    let meta_wire = retry("metadata exchange", || {
        stream.write_all(&hello)?;
        let mut buf = [0u8; FRAME_LEN];
        stream.read_exact(&mut buf)?;
        Ok(buf)
    })
    .map_err(SyncError::net)?;
    let meta = Frame::unpack(&meta_wire)?;
    if meta.done || meta.data_size != 0 {
        return Err(SyncError::ProtocolViolation(
            "metadata frame carried payload or done".into(),
        ));
    }
    let remote_size = meta.file_size;
    let last_block = remote_size / block_size as u64;

    info!(
        device = %cfg.device.display(),
        remote,
        remote_size,
        block_size,
        last_block,
        "starting pull"
    );

    // Size the local object first so digests beyond our old length read as
    // zeros rather than end-of-object.
    {
        let target = BlockFile::open_target(&cfg.device).map_err(SyncError::Write)?;
        target.truncate_to(remote_size).map_err(SyncError::Write)?;
    }
    let file = Arc::new(BlockFile::open_target(&cfg.device).map_err(SyncError::Write)?);
    let cache = PrecomputeCache::new(Arc::clone(&file), block_size, cfg.window, false, None);
    let progress = Progress::new(cfg.skip, last_block, block_size, remote_size, cfg.quiet);

    for idx in cfg.skip..=last_block {
        if shutdown_requested() {
            break;
        }
        cache.ensure_window(idx);
        let local = cache.wait_for_fingerprint(idx);
        if local == ERR_DIGEST {
            return Err(SyncError::BlockUnreadable(idx));
        }

        let request = Frame::query(idx, block_size, 0).pack();
        let (reply_wire, data) = retry("block request", || {
            // A fresh connection is a fresh responder session: replay the
            // hello so the peer is back in pull mode before the request.
            if !stream.is_connected() {
                stream.write_all(&hello)?;
                let mut mb = [0u8; FRAME_LEN];
                stream.read_exact(&mut mb)?;
                if &mb[..MAGIC_LEN] != MAGIC {
                    return Err(io::Error::new(io::ErrorKind::InvalidData, "bad magic"));
                }
            }
            stream.write_all(&request)?;
            stream.write_all(&local)?;
            let mut fb = [0u8; FRAME_LEN];
            stream.read_exact(&mut fb)?;
            // Peek the magic before trusting the length field; a permanent
            // framing error must not be retried.
            if &fb[..MAGIC_LEN] != MAGIC {
                return Err(io::Error::new(io::ErrorKind::InvalidData, "bad magic"));
            }
            let data_size = u32::from_le_bytes(fb[37..41].try_into().unwrap()) as usize;
            let mut data = vec![0u8; data_size];
            if data_size > 0 {
                stream.read_exact(&mut data)?;
            }
            Ok((fb, data))
        })
        .map_err(|e| {
            if e.kind() == io::ErrorKind::InvalidData {
                SyncError::BadMagic
            } else {
                SyncError::net(e)
            }
        })?;
        let reply = Frame::unpack(&reply_wire)?;

        if reply.done {
            debug!(block = idx, "responder signalled end of object");
            break;
        }
        if reply.block_idx != idx {
            return Err(SyncError::ProtocolViolation(format!(
                "reply for block {} while requesting {}",
                reply.block_idx, idx
            )));
        }

        if reply.data_size == 0 {
            progress.record(idx, BlockOutcome::InSync, block_size as usize, 0);
            continue;
        }

        let offset = idx * block_size as u64;
        let outcome = if reply.zero {
            file.write_zeros(offset, data.len())
                .map_err(SyncError::Write)?;
            BlockOutcome::Zero
        } else if reply.compressed {
            let raw = codec.decode(&data)?;
            file.write_at(offset, &raw).map_err(SyncError::Write)?;
            BlockOutcome::Compressed
        } else {
            file.write_at(offset, &data).map_err(SyncError::Write)?;
            BlockOutcome::Raw
        };
        progress.record(idx, outcome, block_size as usize, data.len());
    }

    file.flush().map_err(SyncError::Write)?;

    // Courtesy termination so an SSH-launched responder exits.
    let frame = Frame::end(last_block, block_size, 0).pack();
    if let Err(e) = stream.write_all(&frame) {
        warn!(error = %e, "could not send done frame");
    }
    stream.close();

    Ok(progress.finish())
}
