//! Write-ahead log: append-only, CRC-checked, crash-recoverable.
//!
//! On-disk entry format:
//! ```text
//! [length: u32][crc32: u32][entry_type: u8][payload: &[u8]]
//! ```
//!
//! Every registry mutation and every ledger append is written here before
//! it becomes visible in memory. On startup the log is replayed from the
//! beginning to rebuild both.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use crc32fast::Hasher;

use super::error::{KernelError, KernelResult};

/// Discriminant byte for WAL entry types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EntryType {
    // Registry ops
    FunctionUploaded = 1,
    FunctionActivated = 2,
    FunctionDeleted = 3,

    // Ledger ops
    ExecutionRecorded = 10,
    LedgerPurged = 11,

    // Compound
    AtomicBatch = 50,
}

impl EntryType {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::FunctionUploaded),
            2 => Some(Self::FunctionActivated),
            3 => Some(Self::FunctionDeleted),
            10 => Some(Self::ExecutionRecorded),
            11 => Some(Self::LedgerPurged),
            50 => Some(Self::AtomicBatch),
            _ => None,
        }
    }
}

/// A single WAL entry (in-memory representation).
#[derive(Debug, Clone)]
pub struct WalEntry {
    pub entry_type: EntryType,
    pub payload: Vec<u8>,
}

impl WalEntry {
    pub fn new(entry_type: EntryType, payload: Vec<u8>) -> Self {
        Self {
            entry_type,
            payload,
        }
    }

    /// Serialize to on-disk format: [length: u32][crc32: u32][entry_type: u8][payload]
    fn to_bytes(&self) -> KernelResult<Vec<u8>> {
        let content_len = 1 + self.payload.len();
        let len = u32::try_from(content_len)
            .map_err(|_| KernelError::Wal(format!("entry of {content_len} bytes is too large")))?;
        let mut buf = Vec::with_capacity(4 + 4 + content_len);

        buf.extend_from_slice(&len.to_le_bytes());

        // CRC over entry_type + payload
        let mut hasher = Hasher::new();
        hasher.update(&[self.entry_type as u8]);
        hasher.update(&self.payload);
        buf.extend_from_slice(&hasher.finalize().to_le_bytes());

        buf.push(self.entry_type as u8);
        buf.extend_from_slice(&self.payload);
        Ok(buf)
    }
}

/// Append-only write-ahead log with CRC integrity checks.
pub struct Wal {
    file: File,
    path: PathBuf,
}

impl Wal {
    /// Open or create a WAL file at the given path.
    pub fn open(path: &Path) -> KernelResult<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)
            .map_err(|e| {
                KernelError::Wal(format!("failed to open WAL at {}: {e}", path.display()))
            })?;

        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a single entry. Writes + fsync for durability.
    pub fn append(&mut self, entry: &WalEntry) -> KernelResult<()> {
        let bytes = entry.to_bytes()?;
        self.file.write_all(&bytes)?;
        self.file.sync_data()?;
        Ok(())
    }

    /// Append multiple entries atomically as a batch.
    /// Wraps them in an AtomicBatch entry so replay treats them as all-or-nothing.
    pub fn append_batch(&mut self, entries: &[WalEntry]) -> KernelResult<()> {
        let mut batch_payload = Vec::new();
        let count = u32::try_from(entries.len())
            .map_err(|_| KernelError::Wal("batch has too many entries".into()))?;
        batch_payload.extend_from_slice(&count.to_le_bytes());
        for entry in entries {
            batch_payload.extend_from_slice(&entry.to_bytes()?);
        }

        let batch = WalEntry::new(EntryType::AtomicBatch, batch_payload);
        self.file.write_all(&batch.to_bytes()?)?;
        self.file.sync_data()?;
        Ok(())
    }

    /// Replay all entries from the beginning of the WAL.
    /// Corrupted entries are skipped with a warning; subsequent entries are still read.
    pub fn replay(&self) -> KernelResult<Vec<WalEntry>> {
        let mut file = File::open(&self.path)
            .map_err(|e| KernelError::Wal(format!("failed to open WAL for replay: {e}")))?;

        let mut entries = Vec::new();
        let mut offset: u64 = 0;

        loop {
            let mut len_buf = [0u8; 4];
            match file.read_exact(&mut len_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
            let content_len = u32::from_le_bytes(len_buf) as usize;

            let mut crc_buf = [0u8; 4];
            match file.read_exact(&mut crc_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    tracing::warn!("WAL truncated at offset {offset} (incomplete header)");
                    break;
                }
                Err(e) => return Err(e.into()),
            }
            let stored_crc = u32::from_le_bytes(crc_buf);

            if content_len == 0 {
                tracing::warn!("WAL entry at offset {offset} has zero length, skipping");
                offset += 8;
                continue;
            }
            let mut content = vec![0u8; content_len];
            match file.read_exact(&mut content) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    tracing::warn!("WAL truncated at offset {offset} (incomplete payload)");
                    break;
                }
                Err(e) => return Err(e.into()),
            }

            let mut hasher = Hasher::new();
            hasher.update(&content);
            let computed_crc = hasher.finalize();

            if computed_crc != stored_crc {
                tracing::warn!(
                    "WAL entry corrupted at offset {offset}: CRC mismatch (stored={stored_crc:#x}, computed={computed_crc:#x}), skipping"
                );
                offset += 8 + content_len as u64;
                continue;
            }

            let type_byte = content[0];
            let payload = content[1..].to_vec();

            match EntryType::from_u8(type_byte) {
                Some(EntryType::AtomicBatch) => match Self::unpack_batch(&payload) {
                    Ok(batch_entries) => entries.extend(batch_entries),
                    Err(e) => {
                        tracing::warn!("WAL batch at offset {offset} malformed: {e}, skipping");
                    }
                },
                Some(entry_type) => {
                    entries.push(WalEntry {
                        entry_type,
                        payload,
                    });
                }
                None => {
                    tracing::warn!(
                        "WAL entry at offset {offset}: unknown type {type_byte}, skipping"
                    );
                }
            }

            offset += 8 + content_len as u64;
        }

        Ok(entries)
    }

    /// Unpack a batch payload into individual WalEntry values.
    fn unpack_batch(payload: &[u8]) -> KernelResult<Vec<WalEntry>> {
        let count = read_u32(payload, 0)
            .ok_or_else(|| KernelError::InvalidData("batch too short for count".into()))?
            as usize;
        let mut entries = Vec::with_capacity(count.min(1024));
        let mut pos = 4;

        for _ in 0..count {
            let (Some(content_len), Some(stored_crc)) =
                (read_u32(payload, pos), read_u32(payload, pos + 4))
            else {
                return Err(KernelError::InvalidData("batch entry truncated".into()));
            };
            let content_len = content_len as usize;
            pos += 8;

            if content_len == 0 || pos + content_len > payload.len() {
                return Err(KernelError::InvalidData(
                    "batch entry payload truncated".into(),
                ));
            }

            let content = &payload[pos..pos + content_len];

            let mut hasher = Hasher::new();
            hasher.update(content);
            if hasher.finalize() != stored_crc {
                return Err(KernelError::WalCorrupted {
                    offset: pos as u64,
                    reason: "CRC mismatch in batch sub-entry".into(),
                });
            }

            let type_byte = content[0];
            let entry_type = EntryType::from_u8(type_byte).ok_or_else(|| {
                KernelError::InvalidData(format!("unknown entry type in batch: {type_byte}"))
            })?;

            entries.push(WalEntry {
                entry_type,
                payload: content[1..].to_vec(),
            });

            pos += content_len;
        }

        Ok(entries)
    }
}

fn read_u32(buf: &[u8], pos: usize) -> Option<u32> {
    let bytes = buf.get(pos..pos.checked_add(4)?)?;
    Some(u32::from_le_bytes(bytes.try_into().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Seek, SeekFrom};
    use tempfile::TempDir;

    fn wal_in_tmp(dir: &TempDir) -> Wal {
        Wal::open(&dir.path().join("test.wal")).unwrap()
    }

    #[test]
    fn write_and_replay() {
        let dir = TempDir::new().unwrap();
        {
            let mut wal = wal_in_tmp(&dir);
            wal.append(&WalEntry::new(EntryType::FunctionUploaded, b"square-v1".to_vec()))
                .unwrap();
            wal.append(&WalEntry::new(EntryType::ExecutionRecorded, b"run-1".to_vec()))
                .unwrap();
            wal.append(&WalEntry::new(EntryType::FunctionActivated, b"square@1".to_vec()))
                .unwrap();
        }

        let wal = Wal::open(&dir.path().join("test.wal")).unwrap();
        let entries = wal.replay().unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].entry_type, EntryType::FunctionUploaded);
        assert_eq!(entries[0].payload, b"square-v1");
        assert_eq!(entries[1].entry_type, EntryType::ExecutionRecorded);
        assert_eq!(entries[2].entry_type, EntryType::FunctionActivated);
    }

    #[test]
    fn corrupt_entry_skipped() {
        let dir = TempDir::new().unwrap();
        let wal_path = dir.path().join("test.wal");

        {
            let mut wal = Wal::open(&wal_path).unwrap();
            wal.append(&WalEntry::new(EntryType::FunctionUploaded, b"first".to_vec()))
                .unwrap();
            wal.append(&WalEntry::new(EntryType::FunctionUploaded, b"second".to_vec()))
                .unwrap();
        }

        // Corrupt the CRC of the first entry (bytes 4..8)
        {
            let mut file = OpenOptions::new().write(true).open(&wal_path).unwrap();
            file.seek(SeekFrom::Start(4)).unwrap();
            file.write_all(&[0xFF, 0xFF, 0xFF, 0xFF]).unwrap();
        }

        let wal = Wal::open(&wal_path).unwrap();
        let entries = wal.replay().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].payload, b"second");
    }

    #[test]
    fn truncated_tail_is_ignored() {
        let dir = TempDir::new().unwrap();
        let wal_path = dir.path().join("test.wal");
        {
            let mut wal = Wal::open(&wal_path).unwrap();
            wal.append(&WalEntry::new(EntryType::FunctionDeleted, b"gone".to_vec()))
                .unwrap();
        }
        // A crash mid-append leaves half a header behind.
        {
            let mut file = OpenOptions::new().append(true).open(&wal_path).unwrap();
            file.write_all(&[9, 0, 0]).unwrap();
        }

        let entries = Wal::open(&wal_path).unwrap().replay().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].entry_type, EntryType::FunctionDeleted);
    }

    #[test]
    fn empty_wal_replays_empty() {
        let dir = TempDir::new().unwrap();
        let wal = wal_in_tmp(&dir);
        let entries = wal.replay().unwrap();
        assert!(entries.is_empty());
    }

    #[test]
    fn batch_append_and_replay() {
        let dir = TempDir::new().unwrap();
        let wal_path = dir.path().join("test.wal");

        {
            let mut wal = Wal::open(&wal_path).unwrap();
            wal.append_batch(&[
                WalEntry::new(EntryType::FunctionDeleted, b"square".to_vec()),
                WalEntry::new(EntryType::LedgerPurged, b"square".to_vec()),
            ])
            .unwrap();
        }

        let wal = Wal::open(&wal_path).unwrap();
        let entries = wal.replay().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].entry_type, EntryType::FunctionDeleted);
        assert_eq!(entries[1].entry_type, EntryType::LedgerPurged);
    }

    #[test]
    fn large_payload() {
        let dir = TempDir::new().unwrap();
        let wal_path = dir.path().join("test.wal");
        let big = vec![0xAB; 100_000];

        {
            let mut wal = Wal::open(&wal_path).unwrap();
            wal.append(&WalEntry::new(EntryType::FunctionUploaded, big.clone()))
                .unwrap();
        }

        let wal = Wal::open(&wal_path).unwrap();
        let entries = wal.replay().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].payload, big);
    }
}
