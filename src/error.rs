//! Error taxonomy for a sync session.
//!
//! The classes mirror how a failure must be handled: `Network` errors are
//! absorbed and retried by the stream wrapper, `CompressionFailed` degrades
//! to sending the raw block, everything else terminates the session.

use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SyncError>;

#[derive(Debug, Error)]
pub enum SyncError {
    /// A control frame did not start with the protocol magic.  The peer is
    /// not speaking our protocol (or the stream lost framing); terminate.
    #[error("bad magic in control frame")]
    BadMagic,

    /// Positioned read on the object under sync failed.
    #[error("read failed: {0}")]
    Read(#[source] io::Error),

    /// Positioned write on the object under sync failed.
    #[error("write failed: {0}")]
    Write(#[source] io::Error),

    /// A network fault that survived the retry policy (or occurred after
    /// shutdown was requested).
    #[error("network error: {0}")]
    Network(#[source] io::Error),

    /// Encoder failure.  Non-fatal: the caller sends the raw block instead.
    #[error("compression failed: {0}")]
    CompressionFailed(#[source] io::Error),

    /// Decoder failure on received data.  Fatal for the session: the payload
    /// cannot be applied and the wire position is unrecoverable.
    #[error("decompression failed: {0}")]
    DecompressionFailed(#[source] io::Error),

    /// The peer sent a frame that is invalid in the current session state.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The precompute cache surfaced the `ERR` sentinel for this block: the
    /// underlying object could not be read at that offset.
    #[error("block {0} could not be read")]
    BlockUnreadable(u64),
}

impl SyncError {
    /// Wrap an I/O error from the transport.
    pub fn net(err: io::Error) -> Self {
        SyncError::Network(err)
    }
}
