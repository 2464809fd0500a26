//! Block fingerprints: 128-bit XXH3 digests plus the protocol sentinels.
//!
//! Thin wrapper around the `xxhash-rust` crate.  The canonical wire form of a
//! digest is the `u128` hash serialized little-endian, so both endpoints
//! agree bit-for-bit regardless of host byte order.

use xxhash_rust::xxh3::xxh3_128;

use crate::blockio::is_zero;

/// Length of a block fingerprint on the wire.
pub const DIGEST_LEN: usize = 16;

/// A block fingerprint.
pub type Digest = [u8; DIGEST_LEN];

/// Fingerprint of an empty or all-zero payload, fixed by definition.
/// An out-of-range block compares equal to this on both endpoints.
pub const ZERO_DIGEST: Digest = [0u8; DIGEST_LEN];

const fn tagged(tag: &[u8; 3]) -> Digest {
    let mut d = [0u8; DIGEST_LEN];
    d[0] = tag[0];
    d[1] = tag[1];
    d[2] = tag[2];
    d
}

/// Sentinel published by a cache producer whose block read failed.
/// Consumers treat this as fatal for the block.
pub const ERR_DIGEST: Digest = tagged(b"ERR");

/// Sentinel published by a cache producer that read zero bytes at end of
/// object.  Natural end: both endpoints derive it for the same index.
pub const EOF_DIGEST: Digest = tagged(b"EOF");

/// Fingerprint of a block payload of exactly `n` bytes.
///
/// Empty and all-zero payloads collapse to [`ZERO_DIGEST`]; everything else
/// is XXH3-128 over the payload.  This is the single digest entry point for
/// both endpoints, which makes sentinel correspondence structural.
pub fn block_digest(payload: &[u8]) -> Digest {
    if payload.is_empty() || is_zero(payload) {
        return ZERO_DIGEST;
    }
    xxh3_128(payload).to_le_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_and_empty_collapse() {
        assert_eq!(block_digest(&[]), ZERO_DIGEST);
        assert_eq!(block_digest(&[0u8; 4096]), ZERO_DIGEST);
        assert_eq!(block_digest(&vec![0u8; 1 << 20]), ZERO_DIGEST);
    }

    #[test]
    fn deterministic_and_content_sensitive() {
        let a = block_digest(b"some block payload");
        let b = block_digest(b"some block payload");
        let c = block_digest(b"some block payloae");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, ZERO_DIGEST);
    }

    #[test]
    fn sentinels_are_distinct() {
        assert_ne!(ERR_DIGEST, ZERO_DIGEST);
        assert_ne!(EOF_DIGEST, ZERO_DIGEST);
        assert_ne!(ERR_DIGEST, EOF_DIGEST);
        assert_eq!(&ERR_DIGEST[..3], b"ERR");
        assert_eq!(&EOF_DIGEST[..3], b"EOF");
    }

    #[test]
    fn single_nonzero_byte_changes_digest() {
        let mut buf = vec![0u8; 8192];
        buf[8191] = 1;
        assert_ne!(block_digest(&buf), ZERO_DIGEST);
    }
}
