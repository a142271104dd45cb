use std::{cmp::Reverse, ops::Deref, sync::Arc};

use ahash::AHashMap;
use cid::Cid;

use crate::message::{Priority, WantType};

/// A raw list of wanted blocks and their priorities.
///
/// Entries are unique per cid. Wanting a cid again updates the existing entry
/// in place and keeps its position among entries of equal priority.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct Wantlist {
    set: AHashMap<Cid, Slot>,
    /// Sorted version of the entires in `set`.
    cached: Vec<Entry>,
    next_seq: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Slot {
    entry: Entry,
    /// Arrival order, used to break priority ties.
    seq: u64,
}

impl Wantlist {
    pub fn len(&self) -> usize {
        self.set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    pub fn clear(&mut self) {
        self.set.clear();
        self.cached.clear();
    }

    /// Adds an entry to the wantlist, or updates the existing one.
    ///
    /// Returns `true` if the wantlist changed.
    pub fn add(&mut self, cid: Cid, priority: Priority, want_type: WantType) -> bool {
        match self.set.entry(cid) {
            std::collections::hash_map::Entry::Vacant(entry) => {
                self.cached.clear();
                let seq = self.next_seq;
                self.next_seq += 1;
                entry.insert(Slot {
                    entry: Entry::new(cid, priority, want_type),
                    seq,
                });
                true
            }
            std::collections::hash_map::Entry::Occupied(mut entry) => {
                let slot = entry.get_mut();
                // Adding want-have should not override want-block
                let want_type = if slot.entry.want_type == WantType::Block {
                    WantType::Block
                } else {
                    want_type
                };
                if slot.entry.priority == priority && slot.entry.want_type == want_type {
                    return false;
                }
                slot.entry = Entry::new(cid, priority, want_type);
                self.cached.clear();
                true
            }
        }
    }

    /// Removes the given Cid from the wantlist.
    pub fn remove(&mut self, cid: &Cid) -> Option<Entry> {
        let removed = self.set.remove(cid).map(|slot| slot.entry);
        if removed.is_some() {
            self.cached.clear();
        }
        removed
    }

    /// Returns the entry if present, otherwise `None`.
    pub fn get(&self, cid: &Cid) -> Option<&Entry> {
        self.set.get(cid).map(|slot| &slot.entry)
    }

    pub fn contains(&self, cid: &Cid) -> bool {
        self.set.contains_key(cid)
    }

    /// Removes the given Cid from the wantlist, respecting the type.
    ///
    /// Sending a HAVE does not satisfy a want-block.
    pub fn remove_type(&mut self, cid: &Cid, want_type: WantType) -> Option<Entry> {
        match self.set.entry(*cid) {
            std::collections::hash_map::Entry::Vacant(_) => None,
            std::collections::hash_map::Entry::Occupied(entry) => {
                if entry.get().entry.want_type == WantType::Block && want_type == WantType::Have {
                    return None;
                }
                self.cached.clear();
                Some(entry.remove().entry)
            }
        }
    }

    /// Returns a list of the entries, sorted descending by priority, oldest first on ties.
    pub fn entries(&mut self) -> impl Iterator<Item = Entry> + '_ {
        if self.cached.is_empty() {
            let mut slots: Vec<_> = self.set.values().collect();
            slots.sort_by_key(|slot| (Reverse(slot.entry.priority), slot.seq));
            self.cached = slots.into_iter().map(|slot| slot.entry.clone()).collect();
        }

        self.cached.iter().cloned()
    }
}

/// An entry in a wantlist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry(Arc<InnerEntry>);

impl Deref for Entry {
    type Target = InnerEntry;
    fn deref(&self) -> &Self::Target {
        self.0.deref()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InnerEntry {
    pub cid: Cid,
    pub priority: Priority,
    pub want_type: WantType,
}

impl Entry {
    pub fn new(cid: Cid, priority: Priority, want_type: WantType) -> Self {
        Entry(Arc::new(InnerEntry {
            cid,
            priority,
            want_type,
        }))
    }
}
