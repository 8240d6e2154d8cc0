// SPDX-License-Identifier: AGPL-3.0

//! Account storage with symbolic keys
//!
//! Writes are kept in order. A read walks the writes from oldest to newest
//! and builds an if-then-else chain over every key that may alias the one
//! being read, starting from zero for keys never written.

use evmsym_bitvec::SymBitVec;
use indexmap::IndexMap;

/// Position and value a key held before it was overwritten
pub type PreviousEntry = Option<(usize, SymBitVec)>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Storage {
    entries: IndexMap<SymBitVec, SymBitVec>,
}

impl Storage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Current value at `key`; zero when nothing was ever written there
    pub fn get(&self, key: &SymBitVec) -> SymBitVec {
        if key.is_concrete() && self.entries.keys().all(SymBitVec::is_concrete) {
            return self
                .entries
                .get(key)
                .cloned()
                .unwrap_or_else(|| SymBitVec::zero(256));
        }

        let mut value = SymBitVec::zero(256);
        for (written, stored) in &self.entries {
            let aliases = key.equals(written);
            value = match aliases.as_bool() {
                Some(true) => stored.clone(),
                Some(false) => value,
                None => SymBitVec::ite(&aliases, stored, &value),
            };
        }
        value
    }

    /// Write `value` at `key`, moving the key to the newest position.
    ///
    /// Returns what is needed to undo the write with [`Storage::restore`].
    pub fn set(&mut self, key: SymBitVec, value: SymBitVec) -> PreviousEntry {
        let previous = self
            .entries
            .shift_remove_full(&key)
            .map(|(index, _, old)| (index, old));
        self.entries.insert(key, value);
        previous
    }

    /// Undo the most recent write of `key`
    pub fn restore(&mut self, key: &SymBitVec, previous: PreviousEntry) {
        self.entries.shift_remove(key);
        if let Some((index, value)) = previous {
            self.entries.shift_insert(index, key.clone(), value);
        }
    }

    /// Written entries, oldest first
    pub fn iter(&self) -> impl Iterator<Item = (&SymBitVec, &SymBitVec)> {
        self.entries.iter()
    }
}
