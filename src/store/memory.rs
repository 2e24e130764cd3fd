//! In-memory subscription store.

use crate::error::Result;
use crate::types::{NewSubscription, Subscription, SubscriptionId};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::log::LogEntry;
use super::SubscriptionStore;

/// One record behind its own lock. `None` once removed.
type Slot = Arc<Mutex<Option<Subscription>>>;

/// Called with every change before it becomes visible.
pub(crate) type Journal<'a> = &'a dyn Fn(&LogEntry) -> Result<()>;

fn no_journal(_: &LogEntry) -> Result<()> {
    Ok(())
}

/// Subscription records, each behind its own lock.
///
/// The map lock is only held to find, add or drop a slot. A read-modify-write
/// holds the lock of that one record, so callbacks for different
/// subscriptions never wait on each other.
pub struct MemoryStore {
    slots: RwLock<HashMap<SubscriptionId, Slot>>,

    /// Serializes record creation, so `{topic, hub}` stays unique.
    claims: Mutex<()>,

    /// Counter for generating record ids.
    next_id: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::restore(Vec::new(), 1)
    }

    /// Rebuild from replayed records. `next_id` is the first id to hand out.
    pub(crate) fn restore(records: impl IntoIterator<Item = Subscription>, next_id: u64) -> Self {
        let slots = records
            .into_iter()
            .map(|sub| (sub.id, Arc::new(Mutex::new(Some(sub)))))
            .collect();

        Self {
            slots: RwLock::new(slots),
            claims: Mutex::new(()),
            next_id: AtomicU64::new(next_id),
        }
    }

    fn slot(&self, id: SubscriptionId) -> Option<Slot> {
        self.slots.read().get(&id).cloned()
    }

    /// Every slot, taken without holding the map lock afterwards.
    fn snapshot(&self) -> Vec<Slot> {
        self.slots.read().values().cloned().collect()
    }

    fn find(&self, pred: impl Fn(&Subscription) -> bool) -> Option<Subscription> {
        self.snapshot()
            .iter()
            .filter_map(|slot| slot.lock().clone())
            .filter(|sub| pred(sub))
            .min_by_key(|sub| sub.id)
    }

    pub(crate) fn insert_with(&self, new: NewSubscription, journal: Journal) -> Result<Subscription> {
        let _claim = self.claims.lock();
        self.create(new, journal)
    }

    pub(crate) fn insert_or_reset_with(
        &self,
        new: NewSubscription,
        journal: Journal,
    ) -> Result<(Subscription, bool)> {
        let _claim = self.claims.lock();

        if let Some(existing) = self.find(|sub| sub.topic == new.topic && sub.hub == new.hub) {
            let reset = self.update_with(
                existing.id,
                &mut |sub| {
                    sub.verify_token = new.verify_token.clone();
                    sub.verified = false;
                    true
                },
                journal,
            )?;
            if let Some(sub) = reset {
                return Ok((sub, false));
            }
        }

        Ok((self.create(new, journal)?, true))
    }

    /// Caller holds `claims`.
    fn create(&self, new: NewSubscription, journal: Journal) -> Result<Subscription> {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let subscription = new.into_subscription(id);

        journal(&LogEntry::Put(subscription.clone()))?;
        self.slots
            .write()
            .insert(id, Arc::new(Mutex::new(Some(subscription.clone()))));
        Ok(subscription)
    }

    pub(crate) fn update_with(
        &self,
        id: SubscriptionId,
        f: &mut dyn FnMut(&mut Subscription) -> bool,
        journal: Journal,
    ) -> Result<Option<Subscription>> {
        let Some(slot) = self.slot(id) else {
            return Ok(None);
        };
        let mut record = slot.lock();
        let Some(current) = record.as_ref() else {
            return Ok(None);
        };

        let mut candidate = current.clone();
        if !f(&mut candidate) {
            return Ok(None);
        }

        journal(&LogEntry::Put(candidate.clone()))?;
        *record = Some(candidate.clone());
        Ok(Some(candidate))
    }

    pub(crate) fn remove_with(&self, id: SubscriptionId, journal: Journal) -> Result<Option<Subscription>> {
        let Some(slot) = self.slot(id) else {
            return Ok(None);
        };

        let removed = {
            let mut record = slot.lock();
            if record.is_none() {
                return Ok(None);
            }
            journal(&LogEntry::Remove(id))?;
            record.take()
        };

        let mut slots = self.slots.write();
        if slots.get(&id).is_some_and(|current| Arc::ptr_eq(current, &slot)) {
            slots.remove(&id);
        }
        Ok(removed)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriptionStore for MemoryStore {
    fn insert(&self, new: NewSubscription) -> Result<Subscription> {
        self.insert_with(new, &no_journal)
    }

    fn insert_or_reset(&self, new: NewSubscription) -> Result<(Subscription, bool)> {
        self.insert_or_reset_with(new, &no_journal)
    }

    fn get(&self, id: SubscriptionId) -> Result<Option<Subscription>> {
        Ok(self.slot(id).and_then(|slot| slot.lock().clone()))
    }

    fn find_by_topic_hub(&self, topic: &str, hub: &str) -> Result<Option<Subscription>> {
        Ok(self.find(|sub| sub.topic == topic && sub.hub == hub))
    }

    fn update(
        &self,
        id: SubscriptionId,
        f: &mut dyn FnMut(&mut Subscription) -> bool,
    ) -> Result<Option<Subscription>> {
        self.update_with(id, f, &no_journal)
    }

    fn remove(&self, id: SubscriptionId) -> Result<Option<Subscription>> {
        self.remove_with(id, &no_journal)
    }

    fn list(&self) -> Result<Vec<Subscription>> {
        let mut all: Vec<_> = self
            .snapshot()
            .iter()
            .filter_map(|slot| slot.lock().clone())
            .collect();
        all.sort_by_key(|sub| sub.id);
        Ok(all)
    }
}
