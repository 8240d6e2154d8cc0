// SPDX-License-Identifier: AGPL-3.0

//! Undo log for in-place world state mutation

use evmsym_bitvec::SymBitVec;

use crate::storage::PreviousEntry;
use crate::world::{Account, Address, LogEntry};

/// One overwritten location and the value it held before
#[derive(Debug, Clone)]
pub enum JournalEntry {
    Storage {
        address: Address,
        key: SymBitVec,
        previous: PreviousEntry,
    },
    Balance {
        address: Address,
        previous: SymBitVec,
    },
    Nonce {
        address: Address,
        previous: SymBitVec,
    },
    Code {
        address: Address,
        previous: Vec<u8>,
    },
    /// The account did not exist, or existed as `previous` at `index`
    AccountTouched {
        address: Address,
        previous: Option<(usize, Account)>,
    },
    Log,
    Destruct {
        address: Address,
    },
    Refund {
        previous: SymBitVec,
    },
}

/// Position in the journal that a revert rolls back to
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Checkpoint(usize);

#[derive(Debug, Clone, Default)]
pub struct Journal {
    entries: Vec<JournalEntry>,
}

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, entry: JournalEntry) {
        self.entries.push(entry);
    }

    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint(self.entries.len())
    }

    /// Remove and return the entries recorded after `checkpoint`, newest first
    pub fn unwind(&mut self, checkpoint: Checkpoint) -> Vec<JournalEntry> {
        let start = checkpoint.0.min(self.entries.len());
        let mut undone = self.entries.split_off(start);
        undone.reverse();
        undone
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unwind_returns_newest_first() {
        let mut journal = Journal::new();
        journal.record(JournalEntry::Log);
        let cp = journal.checkpoint();
        journal.record(JournalEntry::Refund {
            previous: SymBitVec::word(1),
        });
        journal.record(JournalEntry::Refund {
            previous: SymBitVec::word(2),
        });

        let undone = journal.unwind(cp);
        assert_eq!(journal.len(), 1);
        match &undone[0] {
            JournalEntry::Refund { previous } => assert_eq!(previous, &SymBitVec::word(2)),
            other => panic!("unexpected entry {:?}", other),
        }
    }

    #[test]
    fn test_unwind_past_end_is_empty() {
        let mut journal = Journal::new();
        let cp = journal.checkpoint();
        assert!(journal.unwind(cp).is_empty());
    }
}
