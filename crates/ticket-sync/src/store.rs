//! Canonical ticket set fed by both the page loader and the event stream.
//!
//! Entries live in one of two tiers. Ids touched by the stream sit in the
//! live tier, ordered by touch sequence (most recent first on read). Ids only
//! seen in pages sit in the fetched tier, in the order they were first
//! fetched. Deleted ids are remembered as tombstones for the whole session so
//! a page fetch that raced the delete cannot bring them back.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::sync::{broadcast, watch};
use tracing::{debug, warn};

use crate::config::MergePolicy;
use crate::protocol::Record;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreChange {
    PageApplied {
        inserted: usize,
        updated: usize,
        skipped: usize,
    },
    Upserted(String),
    Deleted(String),
    Cleared,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageSummary {
    pub inserted: usize,
    pub updated: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Live(u64),
    Fetched(u64),
}

#[derive(Debug)]
struct Entry {
    record: Record,
    slot: Slot,
}

#[derive(Debug, Default)]
struct CanonicalSet {
    entries: HashMap<String, Entry>,
    live: BTreeMap<u64, String>,
    fetched: BTreeMap<u64, String>,
    tombstones: HashSet<String>,
    next_touch: u64,
    next_fetch: u64,
}

impl CanonicalSet {
    fn unlink(&mut self, slot: Slot) {
        match slot {
            Slot::Live(seq) => {
                self.live.remove(&seq);
            }
            Slot::Fetched(seq) => {
                self.fetched.remove(&seq);
            }
        }
    }

    fn touch(&mut self, record: Record) {
        if let Some(previous) = self.entries.remove(&record.id) {
            self.unlink(previous.slot);
        }
        self.tombstones.remove(&record.id);
        let seq = self.next_touch;
        self.next_touch += 1;
        self.live.insert(seq, record.id.clone());
        self.entries.insert(
            record.id.clone(),
            Entry {
                record,
                slot: Slot::Live(seq),
            },
        );
    }

    fn ordered(&self) -> impl Iterator<Item = &Record> + '_ {
        self.live
            .values()
            .rev()
            .chain(self.fetched.values())
            .filter_map(|id| self.entries.get(id).map(|entry| &entry.record))
    }
}

/// Cheaply cloneable handle to the session's canonical set.
#[derive(Clone)]
pub struct ReconciliationStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    set: Mutex<CanonicalSet>,
    policy: MergePolicy,
    changes: broadcast::Sender<StoreChange>,
    revision: watch::Sender<u64>,
}

impl Default for ReconciliationStore {
    fn default() -> Self {
        Self::new(MergePolicy::default())
    }
}

impl ReconciliationStore {
    pub fn new(policy: MergePolicy) -> Self {
        let (changes, _) = broadcast::channel(256);
        let (revision, _) = watch::channel(0);
        Self {
            inner: Arc::new(StoreInner {
                set: Mutex::new(CanonicalSet::default()),
                policy,
                changes,
                revision,
            }),
        }
    }

    pub fn policy(&self) -> MergePolicy {
        self.inner.policy
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.inner.changes.subscribe()
    }

    /// Bumped once per visible mutation.
    pub fn watch_revision(&self) -> watch::Receiver<u64> {
        self.inner.revision.subscribe()
    }

    pub fn revision(&self) -> u64 {
        *self.inner.revision.borrow()
    }

    /// Merges one fetched page, in page order.
    pub fn apply_page<I>(&self, records: I) -> PageSummary
    where
        I: IntoIterator<Item = Record>,
    {
        let mut summary = PageSummary::default();
        let mut guard = self.inner.set.lock();
        let set = &mut *guard;
        for record in records {
            if record.id.is_empty() {
                warn!(target = "ticket_sync::store", "dropping page record without id");
                summary.skipped += 1;
                continue;
            }
            if set.tombstones.contains(&record.id) {
                debug!(
                    target = "ticket_sync::store",
                    id = %record.id,
                    "ignoring page record for deleted id"
                );
                summary.skipped += 1;
                continue;
            }
            match set.entries.get_mut(&record.id) {
                Some(entry) => match entry.slot {
                    Slot::Fetched(_) => {
                        entry.record = record;
                        summary.updated += 1;
                    }
                    Slot::Live(_) => {
                        if self.inner.policy == MergePolicy::NewestWins
                            && is_strictly_newer(&record, &entry.record)
                        {
                            entry.record = record;
                            summary.updated += 1;
                        } else {
                            summary.skipped += 1;
                        }
                    }
                },
                None => {
                    let seq = set.next_fetch;
                    set.next_fetch += 1;
                    set.fetched.insert(seq, record.id.clone());
                    set.entries.insert(
                        record.id.clone(),
                        Entry {
                            record,
                            slot: Slot::Fetched(seq),
                        },
                    );
                    summary.inserted += 1;
                }
            }
        }
        if summary.inserted + summary.updated > 0 {
            self.bump();
        }
        let _ = self.inner.changes.send(StoreChange::PageApplied {
            inserted: summary.inserted,
            updated: summary.updated,
            skipped: summary.skipped,
        });
        drop(guard);
        debug!(
            target = "ticket_sync::store",
            inserted = summary.inserted,
            updated = summary.updated,
            skipped = summary.skipped,
            "applied page"
        );
        summary
    }

    /// Inserts or replaces `record` and moves it to the front of the view.
    /// Returns `false` when the record has no id.
    pub fn apply_upsert(&self, record: Record) -> bool {
        self.apply_upsert_if(record, || true)
    }

    /// Like [`apply_upsert`](Self::apply_upsert), but `admit` is evaluated
    /// while the store lock is held and the upsert is dropped when it fails.
    pub fn apply_upsert_if(&self, record: Record, admit: impl FnOnce() -> bool) -> bool {
        if record.id.is_empty() {
            warn!(target = "ticket_sync::store", "rejecting upsert without id");
            return false;
        }
        let id = record.id.clone();
        let mut set = self.inner.set.lock();
        if !admit() {
            return false;
        }
        set.touch(record);
        self.bump();
        let _ = self.inner.changes.send(StoreChange::Upserted(id.clone()));
        drop(set);
        debug!(target = "ticket_sync::store", id = %id, "applied upsert");
        true
    }

    /// Removes `id` and tombstones it. Returns whether an entry was removed.
    pub fn apply_delete(&self, id: &str) -> bool {
        self.apply_delete_if(id, || true)
    }

    /// Like [`apply_delete`](Self::apply_delete), with `admit` checked under
    /// the store lock. A refused delete leaves no tombstone.
    pub fn apply_delete_if(&self, id: &str, admit: impl FnOnce() -> bool) -> bool {
        if id.is_empty() {
            return false;
        }
        let mut set = self.inner.set.lock();
        if !admit() {
            return false;
        }
        set.tombstones.insert(id.to_string());
        let removed = match set.entries.remove(id) {
            Some(entry) => {
                set.unlink(entry.slot);
                true
            }
            None => false,
        };
        if removed {
            self.bump();
        }
        let _ = self.inner.changes.send(StoreChange::Deleted(id.to_string()));
        drop(set);
        debug!(target = "ticket_sync::store", id = %id, removed, "applied delete");
        removed
    }

    /// Merges `patch` into the current record for `id` and applies the result
    /// as an upsert. Returns the patched record, or `None` if `id` is unknown.
    pub fn apply_local_patch(&self, id: &str, patch: Map<String, Value>) -> Option<Record> {
        let mut set = self.inner.set.lock();
        let mut record = set.entries.get(id)?.record.clone();
        record.merge_fields(patch);
        set.touch(record.clone());
        self.bump();
        let _ = self.inner.changes.send(StoreChange::Upserted(id.to_string()));
        drop(set);
        debug!(target = "ticket_sync::store", id = %id, "applied local patch");
        Some(record)
    }

    /// Live entries most-recently-touched first, then fetched entries in fetch order.
    pub fn snapshot(&self) -> Vec<Record> {
        self.inner.set.lock().ordered().cloned().collect()
    }

    pub fn get(&self, id: &str) -> Option<Record> {
        self.inner
            .set
            .lock()
            .entries
            .get(id)
            .map(|entry| entry.record.clone())
    }

    pub fn is_live(&self, id: &str) -> bool {
        matches!(
            self.inner.set.lock().entries.get(id).map(|entry| entry.slot),
            Some(Slot::Live(_))
        )
    }

    pub fn is_tombstoned(&self, id: &str) -> bool {
        self.inner.set.lock().tombstones.contains(id)
    }

    pub fn len(&self) -> usize {
        self.inner.set.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every entry and tombstone.
    pub fn clear(&self) {
        let mut set = self.inner.set.lock();
        *set = CanonicalSet::default();
        self.bump();
        let _ = self.inner.changes.send(StoreChange::Cleared);
    }

    fn bump(&self) {
        self.inner.revision.send_modify(|rev| *rev += 1);
    }
}

fn is_strictly_newer(candidate: &Record, current: &Record) -> bool {
    match (candidate.updated_at(), current.updated_at()) {
        (Some(candidate), Some(current)) => candidate > current,
        _ => false,
    }
}
