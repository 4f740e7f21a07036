//! Recovery log for atomic page-store operations.
//!
//! While an atomic operation is active, page writes and removals are appended
//! to the log instead of the storage file. Closing the window appends a
//! `Final` record carrying the expected log length; only a log that ends with
//! a valid `Final` record whose length matches the file is ever replayed.
//!
//! Record layout:
//! ```text
//! Offset  Size  Description
//! 0       1     Kind (1 = update, 2 = delete, 3 = final)
//! 1       8     Page index (-1 for final)
//! 9       4     Payload length (u32)
//! 13      n     Payload (page content / nothing / expected log length u64)
//! 13+n    4     CRC32 of everything before
//! ```

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{Result, StorageError};
use crate::page::array_at;
use crate::types::PageIndex;

const KIND_UPDATE: u8 = 1;
const KIND_DELETE: u8 = 2;
const KIND_FINAL: u8 = 3;

/// Size of a record without payload and checksum
pub const RECORD_HEADER_SIZE: usize = 13;

/// Size of the record checksum
pub const RECORD_CHECKSUM_SIZE: usize = 4;

/// Total size of a `Final` record
pub const FINAL_RECORD_SIZE: usize = RECORD_HEADER_SIZE + 8 + RECORD_CHECKSUM_SIZE;

/// One record of the recovery log
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryRecord {
    Update { page: PageIndex, content: Vec<u8> },
    Delete { page: PageIndex },
    Final { total_length: u64 },
}

impl RecoveryRecord {
    fn encode(&self) -> Vec<u8> {
        let (kind, page, payload): (u8, i64, Vec<u8>) = match self {
            Self::Update { page, content } => (KIND_UPDATE, page.value(), content.clone()),
            Self::Delete { page } => (KIND_DELETE, page.value(), Vec::new()),
            Self::Final { total_length } => {
                (KIND_FINAL, PageIndex::NONE.value(), total_length.to_le_bytes().to_vec())
            }
        };

        let mut buf = Vec::with_capacity(RECORD_HEADER_SIZE + payload.len() + RECORD_CHECKSUM_SIZE);
        buf.push(kind);
        buf.extend_from_slice(&page.to_le_bytes());
        buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&payload);
        let checksum = crc32fast::hash(&buf);
        buf.extend_from_slice(&checksum.to_le_bytes());
        buf
    }

    /// Decode the record at the start of `bytes`; returns it with its length
    fn decode(bytes: &[u8]) -> Result<(Self, usize)> {
        if bytes.len() < RECORD_HEADER_SIZE + RECORD_CHECKSUM_SIZE {
            return Err(StorageError::corruption("truncated recovery record"));
        }
        let kind = bytes[0];
        let page = PageIndex::new(i64::from_le_bytes(array_at(bytes, 1)));
        let payload_len = u32::from_le_bytes(array_at(bytes, 9)) as usize;
        let total = RECORD_HEADER_SIZE + payload_len + RECORD_CHECKSUM_SIZE;
        if bytes.len() < total {
            return Err(StorageError::corruption("truncated recovery record"));
        }

        let body_end = RECORD_HEADER_SIZE + payload_len;
        let stored = u32::from_le_bytes(array_at(bytes, body_end));
        if crc32fast::hash(&bytes[..body_end]) != stored {
            return Err(StorageError::corruption("recovery record checksum mismatch"));
        }

        let payload = &bytes[RECORD_HEADER_SIZE..body_end];
        let record = match kind {
            KIND_UPDATE => Self::Update {
                page,
                content: payload.to_vec(),
            },
            KIND_DELETE => Self::Delete { page },
            KIND_FINAL if payload_len == 8 => Self::Final {
                total_length: u64::from_le_bytes(array_at(payload, 0)),
            },
            _ => {
                return Err(StorageError::corruption(format!(
                    "unknown recovery record kind {}",
                    kind
                )))
            }
        };
        Ok((record, total))
    }
}

/// Last logged state of a page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoggedState {
    /// Content at `offset` (payload start) of `length` bytes
    Updated { offset: u64, length: usize },
    Deleted,
}

/// What the log says about a page
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoggedPage {
    Updated(Vec<u8>),
    Deleted,
}

/// Append-only recovery log file
pub struct RecoveryLog {
    path: PathBuf,
    file: File,
    length: u64,
    index: HashMap<PageIndex, LoggedState>,
    finished: bool,
    /// Indexing stopped at a damaged record before the end of the file
    damaged: bool,
}

impl RecoveryLog {
    /// Start a new, empty log (an existing file is overwritten)
    pub fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
            length: 0,
            index: HashMap::new(),
            finished: false,
            damaged: false,
        })
    }

    /// Open a log left behind by a previous session, if there is one.
    ///
    /// Records are indexed up to the first damaged one.
    pub fn open_existing(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;

        let mut log = Self {
            path: path.to_path_buf(),
            file,
            length: bytes.len() as u64,
            index: HashMap::new(),
            finished: false,
            damaged: false,
        };

        let mut offset = 0;
        while offset < bytes.len() {
            let (record, size) = match RecoveryRecord::decode(&bytes[offset..]) {
                Ok(decoded) => decoded,
                Err(e) => {
                    warn!(offset, error = %e, "recovery log is damaged");
                    log.damaged = true;
                    break;
                }
            };
            log.index_record(&record, offset as u64);
            if let RecoveryRecord::Final { .. } = record {
                log.finished = true;
            }
            offset += size;
        }
        Ok(Some(log))
    }

    fn index_record(&mut self, record: &RecoveryRecord, offset: u64) {
        match record {
            RecoveryRecord::Update { page, content } => {
                self.index.insert(
                    *page,
                    LoggedState::Updated {
                        offset: offset + RECORD_HEADER_SIZE as u64,
                        length: content.len(),
                    },
                );
            }
            RecoveryRecord::Delete { page } => {
                self.index.insert(*page, LoggedState::Deleted);
            }
            RecoveryRecord::Final { .. } => {}
        }
    }

    fn append(&mut self, record: RecoveryRecord) -> Result<()> {
        if self.finished {
            return Err(StorageError::invalid_operation(
                "recovery log already carries a final marker",
            ));
        }
        let bytes = record.encode();
        self.file.seek(SeekFrom::Start(self.length))?;
        self.file.write_all(&bytes)?;
        self.index_record(&record, self.length);
        self.length += bytes.len() as u64;
        Ok(())
    }

    /// Log new content for a page
    pub fn write_update_page_record(&mut self, page: PageIndex, content: &[u8]) -> Result<()> {
        self.append(RecoveryRecord::Update {
            page,
            content: content.to_vec(),
        })
    }

    /// Log the removal of a page
    pub fn write_delete_page_record(&mut self, page: PageIndex) -> Result<()> {
        self.append(RecoveryRecord::Delete { page })
    }

    /// Close the log with a final marker holding the expected log length
    pub fn write_final_marker(&mut self) -> Result<()> {
        let total_length = self.length + FINAL_RECORD_SIZE as u64;
        self.append(RecoveryRecord::Final { total_length })?;
        self.finished = true;
        Ok(())
    }

    /// Whether every record is intact and the log ends with a valid final
    /// marker matching its length
    pub fn correctly_finished(&mut self) -> Result<bool> {
        if self.damaged {
            return Ok(false);
        }
        let actual = self.file.metadata()?.len();
        if actual < FINAL_RECORD_SIZE as u64 {
            return Ok(false);
        }
        let mut tail = [0u8; FINAL_RECORD_SIZE];
        self.file.seek(SeekFrom::Start(actual - FINAL_RECORD_SIZE as u64))?;
        self.file.read_exact(&mut tail)?;

        match RecoveryRecord::decode(&tail) {
            Ok((RecoveryRecord::Final { total_length }, _)) => Ok(total_length == actual),
            _ => Ok(false),
        }
    }

    /// Latest logged state of a page, if the page was touched
    pub fn lookup(&mut self, page: PageIndex) -> Result<Option<LoggedPage>> {
        match self.index.get(&page).copied() {
            None => Ok(None),
            Some(LoggedState::Deleted) => Ok(Some(LoggedPage::Deleted)),
            Some(LoggedState::Updated { offset, length }) => {
                let mut content = vec![0u8; length];
                self.file.seek(SeekFrom::Start(offset))?;
                self.file.read_exact(&mut content)?;
                Ok(Some(LoggedPage::Updated(content)))
            }
        }
    }

    /// Pages touched by the log, in ascending order
    pub fn touched_pages(&self) -> Vec<PageIndex> {
        let mut pages: Vec<PageIndex> = self.index.keys().copied().collect();
        pages.sort_unstable();
        pages
    }

    /// Number of pages touched by the log
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Whether no page was touched
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Flush the log to disk
    pub fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    /// Delete the log file
    pub fn discard(self) -> Result<()> {
        let path = self.path.clone();
        drop(self.file);
        fs::remove_file(&path)?;
        debug!(path = %path.display(), "recovery log removed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_lookup_sees_latest_record() -> Result<()> {
        let dir = tempdir().unwrap();
        let mut log = RecoveryLog::create(&dir.path().join("recovery"))?;

        log.write_update_page_record(PageIndex::new(4), b"first")?;
        log.write_update_page_record(PageIndex::new(4), b"second")?;
        log.write_delete_page_record(PageIndex::new(7))?;

        assert_eq!(
            log.lookup(PageIndex::new(4))?,
            Some(LoggedPage::Updated(b"second".to_vec()))
        );
        assert_eq!(log.lookup(PageIndex::new(7))?, Some(LoggedPage::Deleted));
        assert_eq!(log.lookup(PageIndex::new(1))?, None);
        assert_eq!(log.touched_pages(), vec![PageIndex::new(4), PageIndex::new(7)]);
        Ok(())
    }

    #[test]
    fn test_unfinished_log_is_detected() -> Result<()> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("recovery");
        {
            let mut log = RecoveryLog::create(&path)?;
            log.write_update_page_record(PageIndex::new(1), &[1u8; 64])?;
            log.sync()?;
        }

        let mut log = RecoveryLog::open_existing(&path)?.unwrap();
        assert!(!log.correctly_finished()?);
        Ok(())
    }

    #[test]
    fn test_finished_log_reopens() -> Result<()> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("recovery");
        {
            let mut log = RecoveryLog::create(&path)?;
            log.write_update_page_record(PageIndex::new(2), &[9u8; 32])?;
            log.write_delete_page_record(PageIndex::new(3))?;
            log.write_final_marker()?;
            assert!(log.correctly_finished()?);
            assert!(log.write_delete_page_record(PageIndex::new(5)).is_err());
            log.sync()?;
        }

        let mut log = RecoveryLog::open_existing(&path)?.unwrap();
        assert!(log.correctly_finished()?);
        assert_eq!(
            log.lookup(PageIndex::new(2))?,
            Some(LoggedPage::Updated(vec![9u8; 32]))
        );
        assert_eq!(log.len(), 2);
        log.discard()?;
        assert!(!path.exists());
        Ok(())
    }

    #[test]
    fn test_length_mismatch_is_not_finished() -> Result<()> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("recovery");
        {
            let mut log = RecoveryLog::create(&path)?;
            log.write_update_page_record(PageIndex::new(2), &[9u8; 32])?;
            log.write_final_marker()?;
        }

        // a final marker copied onto a shorter log does not count
        let bytes = fs::read(&path)?;
        let tail = bytes[bytes.len() - FINAL_RECORD_SIZE..].to_vec();
        fs::write(&path, &tail)?;

        let mut log = RecoveryLog::open_existing(&path)?.unwrap();
        assert!(!log.correctly_finished()?);
        Ok(())
    }

    #[test]
    fn test_damaged_middle_record_is_not_finished() -> Result<()> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("recovery");
        {
            let mut log = RecoveryLog::create(&path)?;
            log.write_update_page_record(PageIndex::new(1), &[1u8; 32])?;
            log.write_update_page_record(PageIndex::new(2), &[2u8; 32])?;
            log.write_delete_page_record(PageIndex::new(3))?;
            log.write_final_marker()?;
            log.sync()?;
        }

        // flip a payload byte of the second record; the final marker stays intact
        let mut bytes = fs::read(&path)?;
        let second = RECORD_HEADER_SIZE + 32 + RECORD_CHECKSUM_SIZE;
        bytes[second + RECORD_HEADER_SIZE] ^= 0xFF;
        fs::write(&path, &bytes)?;

        let mut log = RecoveryLog::open_existing(&path)?.unwrap();
        assert!(!log.correctly_finished()?);
        assert_eq!(log.len(), 1);
        Ok(())
    }

    #[test]
    fn test_corrupt_record_rejected() {
        let mut bytes = RecoveryRecord::Delete {
            page: PageIndex::new(3),
        }
        .encode();
        bytes[2] ^= 0xFF;
        assert!(matches!(
            RecoveryRecord::decode(&bytes),
            Err(StorageError::Corruption(_))
        ));
    }

    #[test]
    fn test_missing_log() -> Result<()> {
        let dir = tempdir().unwrap();
        assert!(RecoveryLog::open_existing(&dir.path().join("recovery"))?.is_none());
        Ok(())
    }
}
