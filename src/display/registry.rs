//! In-memory registry of known displays.
//!
//! Each identity has its own slot behind its own mutex, so updates to
//! different displays never wait on each other while updates to one
//! display are strictly ordered. The outer map lock is held only long
//! enough to find or create a slot.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};

use super::types::{DisplayHandle, DisplayIdentity, DisplayRecord};

type Slot = Arc<Mutex<Option<DisplayRecord>>>;

#[derive(Debug, Default)]
pub struct DisplayRegistry {
    slots: RwLock<HashMap<DisplayIdentity, Slot>>,
}

fn lock_slot(slot: &Slot) -> MutexGuard<'_, Option<DisplayRecord>> {
    slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl DisplayRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, identity: &DisplayIdentity) -> Option<DisplayRecord> {
        let slot = self.existing_slot(identity)?;
        let guard = lock_slot(&slot);
        guard.clone()
    }

    /// Run `mutator` on the slot for `identity` under that identity's lock.
    ///
    /// The slot is `None` when no record exists; setting it to `None`
    /// deletes the record.
    pub fn upsert<R>(
        &self,
        identity: &DisplayIdentity,
        mutator: impl FnOnce(&mut Option<DisplayRecord>) -> R,
    ) -> R {
        let slot = self.slot(identity);
        let mut guard = lock_slot(&slot);
        mutator(&mut guard)
    }

    /// Identities of every display currently online.
    pub fn enumerate(&self) -> BTreeSet<DisplayIdentity> {
        self.snapshot()
            .into_iter()
            .filter(|record| record.online)
            .map(|record| record.identity)
            .collect()
    }

    /// All records, online or retained, sorted by identity.
    pub fn snapshot(&self) -> Vec<DisplayRecord> {
        let slots: Vec<Slot> = self.read_slots().values().cloned().collect();
        let mut records: Vec<DisplayRecord> =
            slots.iter().filter_map(|slot| lock_slot(slot).clone()).collect();
        records.sort_by(|a, b| a.identity.cmp(&b.identity));
        records
    }

    /// Identity last seen on `handle`. Online records win over retained ones.
    pub fn identity_for_handle(&self, handle: DisplayHandle) -> Option<DisplayIdentity> {
        let matches: Vec<DisplayRecord> = self
            .snapshot()
            .into_iter()
            .filter(|record| record.handle == handle)
            .collect();

        matches
            .iter()
            .find(|record| record.online)
            .or_else(|| matches.first())
            .map(|record| record.identity.clone())
    }

    /// Take `identity` out of the active set, keeping its record for the
    /// retention window. Returns whether it was online.
    pub fn mark_removed(&self, identity: &DisplayIdentity) -> bool {
        let Some(slot) = self.existing_slot(identity) else {
            return false;
        };
        let mut guard = lock_slot(&slot);
        match guard.as_mut() {
            Some(record) if record.online => {
                record.online = false;
                record.removed_at = Some(Instant::now());
                true
            }
            _ => false,
        }
    }

    /// Drop offline records older than `retention` and empty slots.
    pub fn prune_expired(&self, retention: Duration) -> Vec<DisplayIdentity> {
        let mut slots = self.write_slots();
        let mut pruned = Vec::new();

        slots.retain(|identity, slot| {
            // Someone holding a clone may be about to write through it.
            if Arc::strong_count(slot) > 1 {
                return true;
            }
            let Ok(mut guard) = slot.try_lock() else {
                return true;
            };
            let expired = match guard.as_ref() {
                None => return false,
                Some(record) if record.online => false,
                Some(record) => record
                    .removed_at
                    .is_none_or(|removed| removed.elapsed() >= retention),
            };
            if expired {
                *guard = None;
                pruned.push(identity.clone());
            }
            !expired
        });

        pruned
    }

    /// Forget everything (end of a monitoring session).
    pub fn clear(&self) {
        self.write_slots().clear();
    }

    pub fn is_empty(&self) -> bool {
        self.enumerate().is_empty()
    }

    fn existing_slot(&self, identity: &DisplayIdentity) -> Option<Slot> {
        self.read_slots().get(identity).cloned()
    }

    fn slot(&self, identity: &DisplayIdentity) -> Slot {
        if let Some(slot) = self.existing_slot(identity) {
            return slot;
        }
        self.write_slots()
            .entry(identity.clone())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone()
    }

    fn read_slots(&self) -> std::sync::RwLockReadGuard<'_, HashMap<DisplayIdentity, Slot>> {
        self.slots.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_slots(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<DisplayIdentity, Slot>> {
        self.slots
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
