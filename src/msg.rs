//! The control frame: a fixed 44-byte little-endian record.
//!
//! Every wire exchange starts with one of these.  Three roles share the
//! layout: a *query* (`data_size == 0`) asks the peer for a block digest, a
//! *payload* frame (`data_size > 0`) announces `data_size` bytes that follow,
//! and a *done* frame terminates the transfer.
//!
//! Layout (offsets in bytes):
//!
//! | field        | off | len |
//! |--------------|----:|----:|
//! | magic        |   0 |  17 |
//! | `block_idx`  |  17 |   8 |
//! | `block_size` |  25 |   4 |
//! | `file_size`  |  29 |   8 |
//! | `data_size`  |  37 |   4 |
//! | `compressed` |  41 |   1 |
//! | `zero`       |  42 |   1 |
//! | `done`       |  43 |   1 |

use crate::error::SyncError;

/// ASCII protocol tag; doubles as a version marker.
pub const MAGIC: &[u8; MAGIC_LEN] = b"blockSync-ver0.01";
pub const MAGIC_LEN: usize = 17;

/// Total packed size of a control frame.
pub const FRAME_LEN: usize = MAGIC_LEN + 8 + 4 + 8 + 4 + 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Frame {
    pub block_idx: u64,
    pub block_size: u32,
    /// Total object size.  Authoritative initiator→responder in push mode;
    /// zero in the pull hello and in pull request frames.
    pub file_size: u64,
    /// Length of the payload that follows this frame on the wire.
    pub data_size: u32,
    /// Payload is zstd-compressed.
    pub compressed: bool,
    /// Payload is semantically all-zero; the receiver writes `data_size`
    /// zeros at the block offset.
    pub zero: bool,
    /// End of transfer.
    pub done: bool,
}

impl Frame {
    /// Digest query for `block_idx`.
    pub fn query(block_idx: u64, block_size: u32, file_size: u64) -> Self {
        Frame {
            block_idx,
            block_size,
            file_size,
            ..Frame::default()
        }
    }

    /// Payload announcement: `data_size` bytes follow.
    pub fn payload(
        block_idx: u64,
        block_size: u32,
        file_size: u64,
        data_size: u32,
        compressed: bool,
        zero: bool,
    ) -> Self {
        Frame {
            block_idx,
            block_size,
            file_size,
            data_size,
            compressed,
            zero,
            done: false,
        }
    }

    /// Transfer termination marker.
    pub fn end(block_idx: u64, block_size: u32, file_size: u64) -> Self {
        Frame {
            block_idx,
            block_size,
            file_size,
            done: true,
            ..Frame::default()
        }
    }

    /// Serialize into the fixed wire layout.  Never fails, never allocates.
    pub fn pack(&self) -> [u8; FRAME_LEN] {
        let mut buf = [0u8; FRAME_LEN];
        buf[..MAGIC_LEN].copy_from_slice(MAGIC);
        buf[17..25].copy_from_slice(&self.block_idx.to_le_bytes());
        buf[25..29].copy_from_slice(&self.block_size.to_le_bytes());
        buf[29..37].copy_from_slice(&self.file_size.to_le_bytes());
        buf[37..41].copy_from_slice(&self.data_size.to_le_bytes());
        buf[41] = self.compressed as u8;
        buf[42] = self.zero as u8;
        buf[43] = self.done as u8;
        buf
    }

    /// Deserialize a wire record, validating the magic tag.
    pub fn unpack(buf: &[u8; FRAME_LEN]) -> Result<Frame, SyncError> {
        if &buf[..MAGIC_LEN] != MAGIC {
            return Err(SyncError::BadMagic);
        }
        Ok(Frame {
            block_idx: u64::from_le_bytes(buf[17..25].try_into().unwrap()),
            block_size: u32::from_le_bytes(buf[25..29].try_into().unwrap()),
            file_size: u64::from_le_bytes(buf[29..37].try_into().unwrap()),
            data_size: u32::from_le_bytes(buf[37..41].try_into().unwrap()),
            compressed: buf[41] != 0,
            zero: buf[42] != 0,
            done: buf[43] != 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_len_is_fixed() {
        assert_eq!(FRAME_LEN, 44);
        assert_eq!(MAGIC.len(), MAGIC_LEN);
    }

    #[test]
    fn pack_unpack_round_trip_bitwise() {
        let frames = [
            Frame::query(0, 1 << 20, 10 << 20),
            Frame::query(u64::MAX, u32::MAX, u64::MAX),
            Frame::payload(42, 1 << 20, 10 << 20, 65_536, true, false),
            Frame::payload(7, 4096, 8192, 4096, false, true),
            Frame::end(11, 1 << 20, 10 << 20),
        ];
        for f in frames {
            let wire = f.pack();
            let back = Frame::unpack(&wire).unwrap();
            assert_eq!(back, f);
            assert_eq!(back.pack(), wire);
        }
    }

    #[test]
    fn unpack_rejects_bad_magic() {
        let mut wire = Frame::query(1, 2, 3).pack();
        wire[0] ^= 0xff;
        assert!(matches!(Frame::unpack(&wire), Err(SyncError::BadMagic)));
    }

    #[test]
    fn flag_bytes_land_at_fixed_offsets() {
        let wire = Frame::payload(1, 2, 3, 4, true, true).pack();
        assert_eq!(wire[41], 1);
        assert_eq!(wire[42], 1);
        assert_eq!(wire[43], 0);
        let wire = Frame::end(0, 0, 0).pack();
        assert_eq!(wire[43], 1);
    }

    #[test]
    fn little_endian_field_layout() {
        let wire = Frame::query(0x0102030405060708, 0x0a0b0c0d, 0x1112131415161718).pack();
        assert_eq!(wire[17], 0x08); // least significant byte first
        assert_eq!(wire[24], 0x01);
        assert_eq!(wire[25], 0x0d);
        assert_eq!(wire[29], 0x18);
    }
}
