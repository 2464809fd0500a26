//! Stateless zstd adapter for block payloads.
//!
//! One [`BlockCodec`] is built per session with a fixed level; `encode` and
//! `decode` are pure functions of their input.  The transmit rule lives with
//! the callers: a block travels compressed only when the encoded form is
//! strictly smaller than the raw payload.

use clap::ValueEnum;

use crate::error::SyncError;

/// Named compression levels exposed on the CLI, mapped to zstd levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Level {
    /// zstd level 1, saturates fast links.
    Fastest,
    /// zstd level 3, the zstd default.
    Default,
    /// zstd level 9.
    Better,
    /// zstd level 19, slow, for very thin links.
    Best,
}

impl Level {
    pub fn zstd_level(self) -> i32 {
        match self {
            Level::Fastest => 1,
            Level::Default => 3,
            Level::Better => 9,
            Level::Best => 19,
        }
    }
}

/// Per-session codec handle.
#[derive(Debug, Clone, Copy)]
pub struct BlockCodec {
    level: i32,
}

impl BlockCodec {
    pub fn new(level: Level) -> Self {
        BlockCodec {
            level: level.zstd_level(),
        }
    }

    /// Compress a payload.  The result may be larger than the input; callers
    /// decide whether it is worth transmitting.
    pub fn encode(&self, data: &[u8]) -> Result<Vec<u8>, SyncError> {
        zstd::encode_all(data, self.level).map_err(SyncError::CompressionFailed)
    }

    /// Decompress a payload received with the `compressed` flag set.
    pub fn decode(&self, data: &[u8]) -> Result<Vec<u8>, SyncError> {
        zstd::decode_all(data).map_err(SyncError::DecompressionFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_all_levels() {
        let payload: Vec<u8> = b"compressible compressible compressible "
            .iter()
            .cycle()
            .take(64 * 1024)
            .cloned()
            .collect();
        for level in [Level::Fastest, Level::Default, Level::Better, Level::Best] {
            let codec = BlockCodec::new(level);
            let enc = codec.encode(&payload).unwrap();
            assert!(enc.len() < payload.len(), "level {level:?} should shrink");
            assert_eq!(codec.decode(&enc).unwrap(), payload);
        }
    }

    #[test]
    fn incompressible_data_grows() {
        // A pseudo-random buffer should not get smaller; callers must then
        // send the raw bytes with the compressed flag unset.
        let mut state = 0x9e3779b97f4a7c15u64;
        let payload: Vec<u8> = (0..32 * 1024)
            .map(|_| {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                (state >> 33) as u8
            })
            .collect();
        let codec = BlockCodec::new(Level::Fastest);
        let enc = codec.encode(&payload).unwrap();
        assert!(enc.len() >= payload.len());
    }

    #[test]
    fn decode_garbage_is_an_error() {
        let codec = BlockCodec::new(Level::Fastest);
        let err = codec.decode(b"definitely not a zstd frame").unwrap_err();
        assert!(matches!(err, SyncError::DecompressionFailed(_)));
    }

    #[test]
    fn empty_payload_round_trips() {
        let codec = BlockCodec::new(Level::Default);
        let enc = codec.encode(&[]).unwrap();
        assert_eq!(codec.decode(&enc).unwrap(), Vec::<u8>::new());
    }
}
