//! File-backed subscription store.

use crate::error::{Result, SubscriberError};
use crate::types::{NewSubscription, Subscription, SubscriptionId};
use fs2::FileExt;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

use super::log::{LogEntry, SubscriptionLog};
use super::memory::MemoryStore;
use super::SubscriptionStore;

/// Magic bytes for the store manifest.
const STORE_MAGIC: &[u8; 4] = b"WSS\0";

/// Current store format version.
const STORE_VERSION: u8 = 1;

/// File store configuration.
#[derive(Clone, Debug)]
pub struct FileStoreConfig {
    /// Directory holding the manifest, lock and log.
    pub path: PathBuf,

    /// Whether to create the store if it doesn't exist.
    pub create_if_missing: bool,

    /// Sync the log every N writes.
    pub sync_interval: u64,
}

impl Default for FileStoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./subscriptions"),
            create_if_missing: true,
            sync_interval: SubscriptionLog::DEFAULT_SYNC_INTERVAL,
        }
    }
}

/// Replay state: live records and the next id to hand out.
struct Records {
    by_id: HashMap<SubscriptionId, Subscription>,
    next_id: u64,
}

impl Records {
    fn apply(&mut self, entry: LogEntry) {
        match entry {
            LogEntry::Put(sub) => {
                self.next_id = self.next_id.max(sub.id.0 + 1);
                self.by_id.insert(sub.id, sub);
            }
            LogEntry::Remove(id) => {
                self.by_id.remove(&id);
            }
        }
    }
}

/// Subscription records persisted in an append-only log.
///
/// The full record set lives in a [`MemoryStore`]; every change is appended
/// to the log before it becomes visible. Opening the store replays the log.
pub struct FileStore {
    config: FileStoreConfig,

    /// Lock file for exclusive access.
    _lock_file: File,

    log: SubscriptionLog,

    records: MemoryStore,

    /// Shared by every write, exclusive for compaction.
    gate: RwLock<()>,
}

impl FileStore {
    /// Open an existing store or create a new one.
    pub fn open_or_create(config: FileStoreConfig) -> Result<Self> {
        if config.path.join("MANIFEST").exists() {
            Self::open(config)
        } else if config.create_if_missing {
            Self::create(config)
        } else {
            Err(SubscriberError::NotInitialized)
        }
    }

    /// Create a new store.
    pub fn create(config: FileStoreConfig) -> Result<Self> {
        fs::create_dir_all(&config.path)?;
        Self::write_manifest(&config.path)?;
        let lock_file = Self::acquire_lock(&config.path)?;

        let log = SubscriptionLog::open_with_sync_interval(
            config.path.join("subscriptions.log"),
            config.sync_interval,
        )?;

        Ok(Self {
            config,
            _lock_file: lock_file,
            log,
            records: MemoryStore::new(),
            gate: RwLock::new(()),
        })
    }

    /// Open an existing store and replay its log.
    pub fn open(config: FileStoreConfig) -> Result<Self> {
        Self::verify_manifest(&config.path)?;
        let lock_file = Self::acquire_lock(&config.path)?;

        let log = SubscriptionLog::open_with_sync_interval(
            config.path.join("subscriptions.log"),
            config.sync_interval,
        )?;

        let mut records = Records {
            by_id: HashMap::new(),
            next_id: 1,
        };
        let entries = log.replay()?;
        let replayed = entries.len();
        for entry in entries {
            records.apply(entry);
        }

        tracing::debug!(
            path = %config.path.display(),
            entries = replayed,
            subscriptions = records.by_id.len(),
            "opened subscription store"
        );

        Ok(Self {
            config,
            _lock_file: lock_file,
            log,
            records: MemoryStore::restore(records.by_id.into_values(), records.next_id),
            gate: RwLock::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Rewrite the log so it holds one entry per live record.
    pub fn compact(&self) -> Result<()> {
        let _gate = self.gate.write();
        let live = self.records.list()?;

        let before = self.log.size();
        let entries: Vec<_> = live.into_iter().map(LogEntry::Put).collect();
        self.log.rewrite(&entries)?;

        tracing::debug!(before, after = self.log.size(), "compacted subscription log");
        Ok(())
    }

    /// Force sync all pending writes to disk.
    pub fn sync(&self) -> Result<()> {
        self.log.sync()
    }

    /// Append a change to the log; it becomes visible only afterwards.
    fn journal(&self, entry: &LogEntry) -> Result<()> {
        self.log.append(entry)?;
        Ok(())
    }

    fn write_manifest(path: &Path) -> Result<()> {
        use std::io::Write;

        let mut file = File::create(path.join("MANIFEST"))?;
        file.write_all(STORE_MAGIC)?;
        file.write_all(&[STORE_VERSION])?;
        file.sync_all()?;

        Ok(())
    }

    fn verify_manifest(path: &Path) -> Result<()> {
        use std::io::Read;

        let mut file = File::open(path.join("MANIFEST"))?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != STORE_MAGIC {
            return Err(SubscriberError::InvalidFormat("Invalid store magic".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != STORE_VERSION {
            return Err(SubscriberError::InvalidFormat(format!(
                "Unsupported store version: {}",
                version[0]
            )));
        }

        Ok(())
    }

    fn acquire_lock(path: &Path) -> Result<File> {
        let lock_file = File::create(path.join("LOCK"))?;

        lock_file
            .try_lock_exclusive()
            .map_err(|_| SubscriberError::Locked)?;

        Ok(lock_file)
    }
}

impl SubscriptionStore for FileStore {
    fn insert(&self, new: NewSubscription) -> Result<Subscription> {
        let _gate = self.gate.read();
        self.records.insert_with(new, &|entry| self.journal(entry))
    }

    fn insert_or_reset(&self, new: NewSubscription) -> Result<(Subscription, bool)> {
        let _gate = self.gate.read();
        self.records.insert_or_reset_with(new, &|entry| self.journal(entry))
    }

    fn get(&self, id: SubscriptionId) -> Result<Option<Subscription>> {
        self.records.get(id)
    }

    fn find_by_topic_hub(&self, topic: &str, hub: &str) -> Result<Option<Subscription>> {
        self.records.find_by_topic_hub(topic, hub)
    }

    fn update(
        &self,
        id: SubscriptionId,
        f: &mut dyn FnMut(&mut Subscription) -> bool,
    ) -> Result<Option<Subscription>> {
        let _gate = self.gate.read();
        self.records.update_with(id, f, &|entry| self.journal(entry))
    }

    fn remove(&self, id: SubscriptionId) -> Result<Option<Subscription>> {
        let _gate = self.gate.read();
        self.records.remove_with(id, &|entry| self.journal(entry))
    }

    fn list(&self) -> Result<Vec<Subscription>> {
        self.records.list()
    }
}

impl Drop for FileStore {
    fn drop(&mut self) {
        // Best-effort sync on drop
        let _ = self.sync();
    }
}
