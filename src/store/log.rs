//! Append-only subscription log.

use crate::error::{Result, SubscriberError};
use crate::types::{Subscription, SubscriptionId};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Magic bytes for log entries.
const LOG_MAGIC: &[u8; 4] = b"SUB\0";

/// Current log format version.
const LOG_VERSION: u8 = 1;

/// Entry header size: magic + version + payload length.
const ENTRY_HEADER_SIZE: u64 = 4 + 1 + 4;

/// One change to the record set.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogEntry {
    /// Full record state after a create or update.
    Put(Subscription),
    Remove(SubscriptionId),
}

/// Append-only log of [`LogEntry`] values.
///
/// Layout per entry: magic, version, payload length (u32 LE), MessagePack
/// payload, CRC32 of the payload.
pub struct SubscriptionLog {
    path: PathBuf,

    file: RwLock<File>,

    /// Second handle on the same file, used to sync outside the write lock.
    syncer: RwLock<File>,

    /// Current file size (for appending).
    file_size: RwLock<u64>,

    /// Number of writes since last sync.
    writes_since_sync: Mutex<u64>,

    /// Sync every N writes.
    sync_interval: u64,
}

impl SubscriptionLog {
    /// Default sync interval; subscription changes are rare, sync each one.
    pub const DEFAULT_SYNC_INTERVAL: u64 = 1;

    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_sync_interval(path, Self::DEFAULT_SYNC_INTERVAL)
    }

    /// Open or create a log. A `sync_interval` of 0 behaves like 1.
    pub fn open_with_sync_interval(path: impl AsRef<Path>, sync_interval: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        let file_size = file.metadata()?.len();
        let syncer = file.try_clone()?;

        Ok(Self {
            path,
            file: RwLock::new(file),
            syncer: RwLock::new(syncer),
            file_size: RwLock::new(file_size),
            writes_since_sync: Mutex::new(0),
            sync_interval: sync_interval.max(1),
        })
    }

    /// Append an entry. Returns the offset it was written at.
    pub fn append(&self, entry: &LogEntry) -> Result<u64> {
        let payload = rmp_serde::to_vec_named(entry)?;

        let (offset, due) = {
            let mut file = self.file.write();

            let offset = *self.file_size.read();
            file.seek(SeekFrom::Start(offset))?;
            Self::write_entry(&mut *file, &payload)?;
            *self.file_size.write() = file.stream_position()?;

            let mut writes = self.writes_since_sync.lock();
            *writes += 1;
            let due = *writes >= self.sync_interval;
            if due {
                *writes = 0;
            }
            (offset, due)
        };

        // Other appends may proceed while this one waits for the disk
        if due {
            self.syncer.read().sync_data()?;
        }

        Ok(offset)
    }

    /// Force sync all pending writes to disk.
    pub fn sync(&self) -> Result<()> {
        self.file.write().sync_all()?;
        *self.writes_since_sync.lock() = 0;
        Ok(())
    }

    /// Read every entry from the start of the log.
    ///
    /// An incomplete entry at the tail (a write cut short by a crash) ends
    /// the replay and is truncated away. A complete entry with a bad
    /// checksum is an error.
    pub fn replay(&self) -> Result<Vec<LogEntry>> {
        let mut file = self.file.write();
        let end = *self.file_size.read();
        file.seek(SeekFrom::Start(0))?;

        let mut entries = Vec::new();
        let mut offset = 0u64;
        while offset < end {
            match Self::read_entry(&mut *file) {
                Ok(entry) => {
                    entries.push(entry);
                    offset = file.stream_position()?;
                }
                Err(SubscriberError::Io(e)) if e.kind() == ErrorKind::UnexpectedEof => {
                    tracing::warn!(
                        path = %self.path.display(),
                        offset,
                        "truncating incomplete entry at end of subscription log"
                    );
                    file.set_len(offset)?;
                    *self.file_size.write() = offset;
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        Ok(entries)
    }

    /// Replace the whole log with `entries`, via a temporary file and rename.
    pub fn rewrite(&self, entries: &[LogEntry]) -> Result<()> {
        let tmp_path = self.path.with_extension("compact");
        {
            let mut tmp = File::create(&tmp_path)?;
            for entry in entries {
                Self::write_entry(&mut tmp, &rmp_serde::to_vec_named(entry)?)?;
            }
            tmp.sync_all()?;
        }

        let mut file = self.file.write();
        fs::rename(&tmp_path, &self.path)?;
        let reopened = OpenOptions::new().read(true).write(true).open(&self.path)?;
        *self.file_size.write() = reopened.metadata()?.len();
        *self.syncer.write() = reopened.try_clone()?;
        *file = reopened;
        *self.writes_since_sync.lock() = 0;
        Ok(())
    }

    /// Get current file size.
    pub fn size(&self) -> u64 {
        *self.file_size.read()
    }

    fn write_entry(file: &mut File, payload: &[u8]) -> Result<()> {
        let len = u32::try_from(payload.len())
            .map_err(|_| SubscriberError::Serialization("log entry too large".into()))?;

        let mut buf = Vec::with_capacity(ENTRY_HEADER_SIZE as usize + payload.len() + 4);
        buf.extend_from_slice(LOG_MAGIC);
        buf.push(LOG_VERSION);
        buf.extend_from_slice(&len.to_le_bytes());
        buf.extend_from_slice(payload);
        buf.extend_from_slice(&crc32fast::hash(payload).to_le_bytes());

        file.write_all(&buf)?;
        Ok(())
    }

    fn read_entry(file: &mut File) -> Result<LogEntry> {
        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != LOG_MAGIC {
            return Err(SubscriberError::InvalidFormat(
                "Invalid log entry magic".into(),
            ));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != LOG_VERSION {
            return Err(SubscriberError::InvalidFormat(format!(
                "Unsupported log version: {}",
                version[0]
            )));
        }

        let mut len_bytes = [0u8; 4];
        file.read_exact(&mut len_bytes)?;
        let mut payload = vec![0u8; u32::from_le_bytes(len_bytes) as usize];
        file.read_exact(&mut payload)?;

        let mut checksum_bytes = [0u8; 4];
        file.read_exact(&mut checksum_bytes)?;
        let stored_checksum = u32::from_le_bytes(checksum_bytes);
        let computed_checksum = crc32fast::hash(&payload);
        if stored_checksum != computed_checksum {
            return Err(SubscriberError::ChecksumMismatch {
                expected: stored_checksum,
                got: computed_checksum,
            });
        }

        Ok(rmp_serde::from_slice(&payload)?)
    }
}
