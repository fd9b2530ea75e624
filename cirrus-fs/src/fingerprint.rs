//! File content fingerprints
//!
//! A fingerprint is the `(size, mtime, crc[4])` tuple used for content
//! equality checks between the filesystem, the last-synced state, and the
//! cloud. Small files digest their whole content; large files digest four
//! evenly spaced sample blocks, one per word, so fingerprinting stays cheap
//! on multi-gigabyte files.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::errors::{FsError, Result};

/// Files at or below this size are digested in full.
pub const WHOLE_FILE_LIMIT: u64 = 16 * 1024;

/// Sample block size for large files.
const SAMPLE_BLOCK: u64 = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileFingerprint {
    pub size: u64,
    /// Modification time, seconds since the Unix epoch.
    pub mtime: i64,
    pub crc: [u32; 4],
}

impl FileFingerprint {
    /// Fingerprint from in-memory content. Must agree exactly with
    /// `from_path` so either side can compute the same value: quarters for
    /// small content, the same sparse sample blocks for large content.
    pub fn from_bytes(data: &[u8], mtime: i64) -> Self {
        let size = data.len() as u64;
        let mut crc = [0u32; 4];
        if size <= WHOLE_FILE_LIMIT {
            let quarter = (data.len() + 3) / 4;
            for (i, word) in crc.iter_mut().enumerate() {
                let start = (i * quarter).min(data.len());
                let end = ((i + 1) * quarter).min(data.len());
                *word = digest_word(&data[start..end]);
            }
        } else {
            let span = size - SAMPLE_BLOCK;
            for (i, word) in crc.iter_mut().enumerate() {
                let offset = (span * i as u64 / 3) as usize;
                let end = (offset + SAMPLE_BLOCK as usize).min(data.len());
                *word = digest_word(&data[offset..end]);
            }
        }
        Self { size, mtime, crc }
    }

    /// Fingerprint a file on disk without reading all of it when large.
    pub fn from_path(path: &Path, size: u64, mtime: i64) -> Result<Self> {
        let mut file = File::open(path).map_err(|e| FsError::from_io(path, e))?;

        if size <= WHOLE_FILE_LIMIT {
            let mut data = Vec::with_capacity(size as usize);
            file.read_to_end(&mut data)
                .map_err(|e| FsError::from_io(path, e))?;
            return Ok(Self::from_bytes(&data, mtime));
        }

        // Four sample blocks spread across the file, last one anchored to
        // the tail so appends always change the fingerprint.
        let mut crc = [0u32; 4];
        let span = size - SAMPLE_BLOCK;
        for (i, word) in crc.iter_mut().enumerate() {
            let offset = span * i as u64 / 3;
            file.seek(SeekFrom::Start(offset))
                .map_err(|e| FsError::from_io(path, e))?;
            let mut block = vec![0u8; SAMPLE_BLOCK as usize];
            let n = read_up_to(&mut file, &mut block).map_err(|e| FsError::from_io(path, e))?;
            *word = digest_word(&block[..n]);
        }

        Ok(Self { size, mtime, crc })
    }
}

fn digest_word(data: &[u8]) -> u32 {
    let hash = blake3::hash(data);
    let bytes = hash.as_bytes();
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn read_up_to(file: &mut File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn content_change_changes_fingerprint() {
        let a = FileFingerprint::from_bytes(b"hello world", 100);
        let b = FileFingerprint::from_bytes(b"hello worle", 100);
        assert_eq!(a.size, b.size);
        assert_ne!(a, b);
    }

    #[test]
    fn identical_content_matches() {
        let a = FileFingerprint::from_bytes(b"stable content", 42);
        let b = FileFingerprint::from_bytes(b"stable content", 42);
        assert_eq!(a, b);
    }

    #[test]
    fn mtime_participates_in_equality() {
        let a = FileFingerprint::from_bytes(b"same", 1);
        let b = FileFingerprint::from_bytes(b"same", 2);
        assert_ne!(a, b);
    }

    #[test]
    fn in_memory_and_on_disk_agree_for_large_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.bin");
        let data: Vec<u8> = (0..(WHOLE_FILE_LIMIT * 3) as usize)
            .map(|i| (i % 251) as u8)
            .collect();
        std::fs::write(&path, &data).unwrap();

        let from_disk = FileFingerprint::from_path(&path, data.len() as u64, 11).unwrap();
        let from_memory = FileFingerprint::from_bytes(&data, 11);
        assert_eq!(from_disk, from_memory);
    }

    #[test]
    fn large_file_sampling_detects_tail_append() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.bin");

        let mut data = vec![0xabu8; (WHOLE_FILE_LIMIT * 4) as usize];
        std::fs::write(&path, &data).unwrap();
        let a = FileFingerprint::from_path(&path, data.len() as u64, 7).unwrap();

        data.extend_from_slice(b"appended");
        let mut f = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        f.seek(SeekFrom::End(0)).unwrap();
        f.write_all(b"appended").unwrap();
        drop(f);

        let b = FileFingerprint::from_path(&path, data.len() as u64, 7).unwrap();
        assert_ne!(a, b);
    }
}
