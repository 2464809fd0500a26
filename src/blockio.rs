//! Positioned block I/O on the object under sync.
//!
//! A [`BlockFile`] wraps the source or target object (a regular file or a
//! block device) and exposes offset-addressed reads and writes that never
//! touch a shared cursor, so any number of threads can use one handle.
//! Object length is probed by seeking to the end, which is the one method
//! that works for both regular files and devices.

use std::fs::{File, OpenOptions};
use std::io::{self, Seek, SeekFrom};
use std::mem;
use std::os::unix::fs::{FileExt, FileTypeExt};
use std::path::Path;

/// Handle on the object under sync.
#[derive(Debug)]
pub struct BlockFile {
    file: File,
    len: u64,
    regular: bool,
}

impl BlockFile {
    /// Open read-only (initiator push side, responder pull side).
    pub fn open_source(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).open(path)?;
        Self::wrap(file)
    }

    /// Open read-write, creating a missing regular file (target side).
    pub fn open_target(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        Self::wrap(file)
    }

    fn wrap(mut file: File) -> io::Result<Self> {
        let ft = file.metadata()?.file_type();
        let regular = !(ft.is_block_device() || ft.is_char_device());
        // metadata().len() is zero for block devices; seek-to-end works for
        // both kinds.  Rewind afterwards so the cursor stays unsurprising.
        let len = file.seek(SeekFrom::End(0))?;
        file.seek(SeekFrom::Start(0))?;
        Ok(BlockFile { file, len, regular })
    }

    /// Object size in bytes at open time.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// True for anything that is not a block or character device.
    pub fn is_regular(&self) -> bool {
        self.regular
    }

    /// Read block `idx` into `buf` (sized to the block), returning the number
    /// of bytes actually read.  The final block of the object is short; a
    /// return of `0` means the offset is at or past end-of-object.
    pub fn read_block(&self, idx: u64, block_size: u32, buf: &mut [u8]) -> io::Result<usize> {
        debug_assert_eq!(buf.len(), block_size as usize);
        let offset = idx * block_size as u64;
        let mut total = 0;
        while total < buf.len() {
            match self.file.read_at(&mut buf[total..], offset + total as u64) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(total)
    }

    /// Write `data` at byte `offset`, fully.
    pub fn write_at(&self, offset: u64, data: &[u8]) -> io::Result<()> {
        self.file.write_all_at(data, offset)
    }

    /// Write `len` zero bytes at `offset`: explicit-zero application.
    pub fn write_zeros(&self, offset: u64, len: usize) -> io::Result<()> {
        let zeros = vec![0u8; len];
        self.file.write_all_at(&zeros, offset)
    }

    /// Truncate a regular file to `size`; no-op for devices, which cannot be
    /// resized and must not be touched.
    pub fn truncate_to(&self, size: u64) -> io::Result<()> {
        if self.regular {
            self.file.set_len(size)?;
        }
        Ok(())
    }

    /// Flush written data to the storage device.
    pub fn flush(&self) -> io::Result<()> {
        self.file.sync_all()
    }
}

// ---------------------------------------------------------------------------
// Zero-block scan
// ---------------------------------------------------------------------------

const WORD: usize = mem::size_of::<usize>();

/// True iff every byte of `buf` is zero.  Scans native-word-at-a-time with a
/// byte tail; block payloads are word-scale, so this is the hot shape.
pub fn is_zero(buf: &[u8]) -> bool {
    let words = buf.len() / WORD;
    for i in 0..words {
        let w = usize::from_ne_bytes(buf[i * WORD..(i + 1) * WORD].try_into().unwrap());
        if w != 0 {
            return false;
        }
    }
    buf[words * WORD..].iter().all(|&b| b == 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn is_zero_scans_words_and_tail() {
        assert!(is_zero(&[]));
        assert!(is_zero(&[0u8; 7])); // below one word
        assert!(is_zero(&[0u8; 4096]));
        let mut buf = vec![0u8; 4096];
        buf[0] = 1;
        assert!(!is_zero(&buf));
        let mut buf = vec![0u8; 4099];
        buf[4098] = 1; // tail byte
        assert!(!is_zero(&buf));
    }

    #[test]
    fn read_block_handles_short_tail() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("obj");
        fs::write(&path, [7u8; 2500]).unwrap();
        let f = BlockFile::open_source(&path).unwrap();
        assert_eq!(f.len(), 2500);
        assert!(f.is_regular());

        let mut buf = vec![0u8; 1024];
        assert_eq!(f.read_block(0, 1024, &mut buf).unwrap(), 1024);
        assert_eq!(f.read_block(1, 1024, &mut buf).unwrap(), 1024);
        assert_eq!(f.read_block(2, 1024, &mut buf).unwrap(), 452);
        assert_eq!(f.read_block(3, 1024, &mut buf).unwrap(), 0);
    }

    #[test]
    fn write_at_and_zeros_are_positioned() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("obj");
        fs::write(&path, [0xffu8; 100]).unwrap();
        let f = BlockFile::open_target(&path).unwrap();
        f.write_at(10, b"hello").unwrap();
        f.write_zeros(50, 20).unwrap();
        let data = fs::read(&path).unwrap();
        assert_eq!(&data[10..15], b"hello");
        assert_eq!(&data[50..70], &[0u8; 20]);
        assert_eq!(data[49], 0xff);
        assert_eq!(data[70], 0xff);
    }

    #[test]
    fn truncate_applies_to_regular_files() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("obj");
        fs::write(&path, [1u8; 1000]).unwrap();
        let f = BlockFile::open_target(&path).unwrap();
        f.truncate_to(300).unwrap();
        assert_eq!(fs::metadata(&path).unwrap().len(), 300);
    }

    #[test]
    fn open_target_creates_missing_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("fresh");
        let f = BlockFile::open_target(&path).unwrap();
        assert_eq!(f.len(), 0);
        assert!(f.is_empty());
    }
}
