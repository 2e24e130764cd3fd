//! Persistence for subscription records.
//!
//! The handshake core only needs a handful of record operations, collected
//! in [`SubscriptionStore`]:
//! - create (or reuse) a pending record before the hub is contacted
//! - look records up by id, by `{topic, hub}` and by `{id, topic, token}`
//! - atomic read-modify-write of a single record
//!
//! Two implementations ship with the crate: [`MemoryStore`] for tests and
//! short-lived processes, and [`FileStore`], an append-only log replayed
//! into memory on open.

mod file;
mod log;
mod memory;

pub use file::{FileStore, FileStoreConfig};
pub use log::{LogEntry, SubscriptionLog};
pub use memory::MemoryStore;

use crate::error::Result;
use crate::types::{NewSubscription, Subscription, SubscriptionId};

/// Record store used by the manager and the verification handler.
///
/// Implementations must make [`update`](SubscriptionStore::update) atomic per
/// record: two concurrent updates of the same id never interleave, while
/// updates of different ids do not wait on each other.
pub trait SubscriptionStore: Send + Sync {
    /// Create a record and assign its id.
    fn insert(&self, new: NewSubscription) -> Result<Subscription>;

    /// Reuse the record for `new`'s `{topic, hub}` or create one, as one
    /// step: concurrent calls for the same pair end up on a single record.
    ///
    /// A reused record takes `new.verify_token` and goes back to unverified;
    /// its lease is left alone. Returns the record and whether it was created.
    fn insert_or_reset(&self, new: NewSubscription) -> Result<(Subscription, bool)>;

    fn get(&self, id: SubscriptionId) -> Result<Option<Subscription>>;

    fn find_by_topic_hub(&self, topic: &str, hub: &str) -> Result<Option<Subscription>>;

    /// Atomically modify a record.
    ///
    /// `f` sees the current record and returns whether to commit its changes.
    /// Returns the committed record, or `None` when the id is unknown or `f`
    /// declined.
    fn update(
        &self,
        id: SubscriptionId,
        f: &mut dyn FnMut(&mut Subscription) -> bool,
    ) -> Result<Option<Subscription>>;

    fn remove(&self, id: SubscriptionId) -> Result<Option<Subscription>>;

    /// All records, ordered by id.
    fn list(&self) -> Result<Vec<Subscription>>;

    /// Find the record a verification request refers to.
    ///
    /// Id, topic and token must all match; which one failed is not reported.
    fn find_verifiable(
        &self,
        id: SubscriptionId,
        topic: &str,
        verify_token: &str,
    ) -> Result<Option<Subscription>> {
        Ok(self
            .get(id)?
            .filter(|sub| sub.topic == topic && sub.verify_token == verify_token))
    }

    fn len(&self) -> Result<usize> {
        Ok(self.list()?.len())
    }

    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}
