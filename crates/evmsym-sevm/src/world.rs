// SPDX-License-Identifier: AGPL-3.0

//! World state: accounts, block context, logs and pending self-destructs
//!
//! Every mutation is applied in place and recorded in the [`Journal`] so a
//! failed context can be rolled back by replaying the undo log.

use std::collections::HashMap;
use std::fmt;

use evmsym_bitvec::{Model, SymBitVec, SymBool};
use evmsym_bytevec::ByteVec;
use evmsym_config::Fork;
use evmsym_constants::{ADDRESS_SIZE, BLOCKHASH_WINDOW};
use evmsym_exceptions::{SevmError, SevmResult};
use evmsym_hashes::{keccak256, LogRecord};
use indexmap::{IndexMap, IndexSet};
use num_bigint::BigUint;
use num_traits::Zero;
use tracing::debug;

use crate::journal::{Checkpoint, Journal, JournalEntry};
use crate::storage::Storage;

/// 160-bit account identifier
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Address(pub [u8; ADDRESS_SIZE]);

impl Address {
    pub fn from_low_u64(value: u64) -> Self {
        let mut bytes = [0u8; 20];
        bytes[12..].copy_from_slice(&value.to_be_bytes());
        Address(bytes)
    }

    /// Low 160 bits of a concrete word
    pub fn from_biguint(value: &BigUint) -> Self {
        let raw = value.to_bytes_be();
        let mut bytes = [0u8; 20];
        let take = raw.len().min(20);
        bytes[20 - take..].copy_from_slice(&raw[raw.len() - take..]);
        Address(bytes)
    }

    /// `None` when the word is symbolic
    pub fn from_word(word: &SymBitVec) -> Option<Self> {
        word.as_biguint().map(Self::from_biguint)
    }

    pub fn to_word(&self) -> SymBitVec {
        SymBitVec::from_bytes_be(&self.0, 256)
    }

    pub fn to_biguint(&self) -> BigUint {
        BigUint::from_bytes_be(&self.0)
    }

    pub fn from_hex(text: &str) -> SevmResult<Self> {
        let digits = text.trim_start_matches("0x");
        let value = BigUint::parse_bytes(digits.as_bytes(), 16)
            .ok_or_else(|| SevmError::ValueOutOfRange(format!("invalid address {}", text)))?;
        if value.bits() > 160 {
            return Err(SevmError::ValueOutOfRange(format!("address too wide {}", text)));
        }
        Ok(Self::from_biguint(&value))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex_bytes(&self.0))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

fn hex_bytes(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub nonce: SymBitVec,
    pub balance: SymBitVec,
    pub code: Vec<u8>,
    pub storage: Storage,
}

impl Default for Account {
    fn default() -> Self {
        Self {
            nonce: SymBitVec::zero(256),
            balance: SymBitVec::zero(256),
            code: Vec::new(),
            storage: Storage::new(),
        }
    }
}

/// Block values frozen for the lifetime of the world
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockContext {
    pub number: SymBitVec,
    pub timestamp: SymBitVec,
    pub difficulty: SymBitVec,
    pub coinbase: SymBitVec,
    pub gaslimit: SymBitVec,
    pub chain_id: SymBitVec,
}

impl Default for BlockContext {
    fn default() -> Self {
        Self {
            number: SymBitVec::zero(256),
            timestamp: SymBitVec::zero(256),
            difficulty: SymBitVec::zero(256),
            coinbase: SymBitVec::zero(256),
            gaslimit: SymBitVec::zero(256),
            chain_id: SymBitVec::word(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub address: Address,
    pub topics: Vec<SymBitVec>,
    pub data: ByteVec,
}

impl LogEntry {
    /// Serializable form, when every topic and data byte is concrete
    pub fn as_record(&self) -> Option<LogRecord> {
        self.eval(&Model::new())
    }

    pub fn eval(&self, model: &Model) -> Option<LogRecord> {
        let topics = self
            .topics
            .iter()
            .map(|topic| {
                let value = topic.eval(model)?;
                let bytes = evmsym_bitvec::be_bytes(&value, 32);
                let mut word = [0u8; 32];
                word.copy_from_slice(&bytes);
                Some(word)
            })
            .collect::<Option<Vec<_>>>()?;
        Some(LogRecord {
            address: self.address.0,
            topics,
            data: self.data.eval(model)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct WorldState {
    accounts: IndexMap<Address, Account>,
    block: BlockContext,
    fork: Fork,
    logs: Vec<LogEntry>,
    pending_destruct: IndexSet<Address>,
    refund: SymBitVec,
    original_storage: HashMap<Address, Storage>,
    journal: Journal,
}

impl WorldState {
    pub fn new(block: BlockContext, fork: Fork) -> Self {
        Self {
            accounts: IndexMap::new(),
            block,
            fork,
            logs: Vec::new(),
            pending_destruct: IndexSet::new(),
            refund: SymBitVec::zero(256),
            original_storage: HashMap::new(),
            journal: Journal::new(),
        }
    }

    pub fn fork(&self) -> Fork {
        self.fork
    }

    pub fn accounts(&self) -> impl Iterator<Item = &Address> {
        self.accounts.keys()
    }

    pub fn account(&self, address: &Address) -> Option<&Account> {
        self.accounts.get(address)
    }

    pub fn account_exists(&self, address: &Address) -> bool {
        self.accounts.contains_key(address)
    }

    /// No code, zero nonce and zero balance; true for missing accounts
    pub fn is_empty_account(&self, address: &Address) -> SymBool {
        match self.accounts.get(address) {
            None => SymBool::Concrete(true),
            Some(account) if !account.code.is_empty() => SymBool::Concrete(false),
            Some(account) => account.nonce.is_zero().and(&account.balance.is_zero()),
        }
    }

    pub fn get_balance(&self, address: &Address) -> SymBitVec {
        self.accounts
            .get(address)
            .map(|a| a.balance.clone())
            .unwrap_or_else(|| SymBitVec::zero(256))
    }

    pub fn get_nonce(&self, address: &Address) -> SymBitVec {
        self.accounts
            .get(address)
            .map(|a| a.nonce.clone())
            .unwrap_or_else(|| SymBitVec::zero(256))
    }

    pub fn get_code(&self, address: &Address) -> &[u8] {
        self.accounts
            .get(address)
            .map(|a| a.code.as_slice())
            .unwrap_or(&[])
    }

    pub fn get_storage_data(&self, address: &Address, key: &SymBitVec) -> SymBitVec {
        self.accounts
            .get(address)
            .map(|a| a.storage.get(key))
            .unwrap_or_else(|| SymBitVec::zero(256))
    }

    /// Value of the slot when the current top-level transaction started
    pub fn get_original_storage_data(&self, address: &Address, key: &SymBitVec) -> SymBitVec {
        match self.original_storage.get(address) {
            Some(storage) => storage.get(key),
            None => self.get_storage_data(address, key),
        }
    }

    /// EXTCODEHASH: zero for missing and empty accounts
    pub fn get_code_hash(&self, address: &Address) -> SymBitVec {
        let Some(account) = self.accounts.get(address) else {
            return SymBitVec::zero(256);
        };
        let hash = SymBitVec::from_bytes_be(&keccak256(&account.code), 256);
        if self.fork >= Fork::SpuriousDragon {
            SymBitVec::ite(&self.is_empty_account(address), &SymBitVec::zero(256), &hash)
        } else {
            hash
        }
    }

    pub fn block(&self) -> &BlockContext {
        &self.block
    }

    pub fn block_number(&self) -> &SymBitVec {
        &self.block.number
    }

    pub fn block_timestamp(&self) -> &SymBitVec {
        &self.block.timestamp
    }

    pub fn block_difficulty(&self) -> &SymBitVec {
        &self.block.difficulty
    }

    pub fn block_coinbase(&self) -> &SymBitVec {
        &self.block.coinbase
    }

    pub fn block_gaslimit(&self) -> &SymBitVec {
        &self.block.gaslimit
    }

    pub fn chain_id(&self) -> &SymBitVec {
        &self.block.chain_id
    }

    /// Replace a symbolic coinbase by the value the driver bound it to
    pub(crate) fn bind_coinbase(&mut self, value: &BigUint) {
        self.block.coinbase = SymBitVec::from_biguint(value.clone(), 256);
    }

    /// Hash of one of the 256 most recent blocks, zero outside that window.
    ///
    /// Historical hashes are unknown, so they are modelled as the keccak of
    /// the block number.
    pub fn block_hash(&self, number: &SymBitVec) -> SymBitVec {
        let current = &self.block.number;
        let in_window = number
            .ult(current)
            .and(&current.sub(number).ule(&SymBitVec::word(BLOCKHASH_WINDOW)));
        SymBitVec::ite(&in_window, &number.keccak(), &SymBitVec::zero(256))
    }

    pub fn logs(&self) -> &[LogEntry] {
        &self.logs
    }

    pub fn refund(&self) -> &SymBitVec {
        &self.refund
    }

    pub fn is_scheduled_for_destruct(&self, address: &Address) -> bool {
        self.pending_destruct.contains(address)
    }

    pub fn pending_destruct(&self) -> impl Iterator<Item = &Address> {
        self.pending_destruct.iter()
    }

    /// Install an account, failing on an address collision.
    ///
    /// An existing account without code and with a zero nonce is replaced,
    /// keeping its balance on top of `balance`.
    pub fn create_account(
        &mut self,
        address: Address,
        balance: SymBitVec,
        nonce: SymBitVec,
        code: Vec<u8>,
    ) -> SevmResult<()> {
        if self.collides(&address) {
            return Err(SevmError::AccountExists(address.0));
        }
        let carried = self.get_balance(&address);
        self.replace_account(
            address,
            Account {
                nonce,
                balance: carried.add(&balance),
                code,
                storage: Storage::new(),
            },
        );
        Ok(())
    }

    /// True when a CREATE at `address` must fail.
    ///
    /// A symbolic nonce counts as a collision; callers that need the exact
    /// answer bind it first.
    pub fn collides(&self, address: &Address) -> bool {
        match self.accounts.get(address) {
            None => false,
            Some(account) => {
                !account.code.is_empty()
                    || account.nonce.as_biguint().map_or(true, |n| !n.is_zero())
            }
        }
    }

    fn replace_account(&mut self, address: Address, account: Account) {
        let previous = self
            .accounts
            .shift_remove_full(&address)
            .map(|(index, _, old)| (index, old));
        self.accounts.insert(address, account);
        self.journal
            .record(JournalEntry::AccountTouched { address, previous });
    }

    fn account_mut(&mut self, address: &Address) -> &mut Account {
        if !self.accounts.contains_key(address) {
            self.accounts.insert(*address, Account::default());
            self.journal.record(JournalEntry::AccountTouched {
                address: *address,
                previous: None,
            });
        }
        self.accounts.entry(*address).or_default()
    }

    pub fn set_storage_data(&mut self, address: &Address, key: SymBitVec, value: SymBitVec) {
        if !self.original_storage.contains_key(address) {
            let snapshot = self
                .accounts
                .get(address)
                .map(|a| a.storage.clone())
                .unwrap_or_default();
            self.original_storage.insert(*address, snapshot);
        }
        let previous = self.account_mut(address).storage.set(key.clone(), value);
        self.journal.record(JournalEntry::Storage {
            address: *address,
            key,
            previous,
        });
    }

    pub fn set_balance(&mut self, address: &Address, value: SymBitVec) {
        let account = self.account_mut(address);
        let previous = std::mem::replace(&mut account.balance, value);
        self.journal.record(JournalEntry::Balance {
            address: *address,
            previous,
        });
    }

    pub fn add_to_balance(&mut self, address: &Address, value: &SymBitVec) {
        let balance = self.get_balance(address).add(value);
        self.set_balance(address, balance);
    }

    pub fn sub_from_balance(&mut self, address: &Address, value: &SymBitVec) {
        let balance = self.get_balance(address).sub(value);
        self.set_balance(address, balance);
    }

    /// Move `value` from `from` to `to`, creating `to` if needed
    pub fn transfer(&mut self, from: &Address, to: &Address, value: &SymBitVec) {
        if value.as_biguint().is_some_and(|v| v.is_zero()) && self.account_exists(to) {
            return;
        }
        self.sub_from_balance(from, value);
        self.add_to_balance(to, value);
    }

    pub fn set_nonce(&mut self, address: &Address, value: SymBitVec) {
        let account = self.account_mut(address);
        let previous = std::mem::replace(&mut account.nonce, value);
        self.journal.record(JournalEntry::Nonce {
            address: *address,
            previous,
        });
    }

    pub fn increase_nonce(&mut self, address: &Address) -> SymBitVec {
        let nonce = self.get_nonce(address).add(&SymBitVec::word(1));
        self.set_nonce(address, nonce.clone());
        nonce
    }

    pub fn set_code(&mut self, address: &Address, code: Vec<u8>) {
        let account = self.account_mut(address);
        let previous = std::mem::replace(&mut account.code, code);
        self.journal.record(JournalEntry::Code {
            address: *address,
            previous,
        });
    }

    pub fn add_log(&mut self, entry: LogEntry) {
        self.logs.push(entry);
        self.journal.record(JournalEntry::Log);
    }

    /// Returns false when the account was already scheduled
    pub fn schedule_destruct(&mut self, address: &Address) -> bool {
        let inserted = self.pending_destruct.insert(*address);
        if inserted {
            self.journal
                .record(JournalEntry::Destruct { address: *address });
        }
        inserted
    }

    pub fn add_refund(&mut self, amount: &SymBitVec) {
        let refund = self.refund.add(amount);
        self.set_refund(refund);
    }

    pub fn sub_refund(&mut self, amount: &SymBitVec) {
        let refund = self.refund.sub(amount);
        self.set_refund(refund);
    }

    fn set_refund(&mut self, value: SymBitVec) {
        let previous = std::mem::replace(&mut self.refund, value);
        self.journal.record(JournalEntry::Refund { previous });
    }

    pub fn checkpoint(&self) -> Checkpoint {
        self.journal.checkpoint()
    }

    /// Undo every mutation recorded since `checkpoint`
    pub fn revert_to(&mut self, checkpoint: Checkpoint) {
        let undone = self.journal.unwind(checkpoint);
        debug!(entries = undone.len(), "reverting world state");
        for entry in undone {
            self.undo(entry);
        }
    }

    fn undo(&mut self, entry: JournalEntry) {
        match entry {
            JournalEntry::Storage {
                address,
                key,
                previous,
            } => {
                if let Some(account) = self.accounts.get_mut(&address) {
                    account.storage.restore(&key, previous);
                }
            }
            JournalEntry::Balance { address, previous } => {
                if let Some(account) = self.accounts.get_mut(&address) {
                    account.balance = previous;
                }
            }
            JournalEntry::Nonce { address, previous } => {
                if let Some(account) = self.accounts.get_mut(&address) {
                    account.nonce = previous;
                }
            }
            JournalEntry::Code { address, previous } => {
                if let Some(account) = self.accounts.get_mut(&address) {
                    account.code = previous;
                }
            }
            JournalEntry::AccountTouched { address, previous } => {
                self.accounts.shift_remove(&address);
                if let Some((index, account)) = previous {
                    self.accounts.shift_insert(index, address, account);
                }
            }
            JournalEntry::Log => {
                self.logs.pop();
            }
            JournalEntry::Destruct { address } => {
                self.pending_destruct.shift_remove(&address);
            }
            JournalEntry::Refund { previous } => {
                self.refund = previous;
            }
        }
    }

    /// Reset per-transaction bookkeeping before a new top-level transaction
    pub(crate) fn begin_transaction(&mut self) {
        self.logs.clear();
        self.pending_destruct.clear();
        self.refund = SymBitVec::zero(256);
        self.original_storage.clear();
        self.journal.clear();
    }

    /// Apply deferred self-destructs and drop the undo log
    pub(crate) fn finalize_transaction(&mut self) {
        let doomed: Vec<Address> = self.pending_destruct.drain(..).collect();
        for address in doomed {
            debug!(%address, "deleting self-destructed account");
            self.delete_account(&address);
        }
        self.original_storage.clear();
        self.journal.clear();
    }

    pub fn delete_account(&mut self, address: &Address) {
        self.accounts.shift_remove(address);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn world() -> WorldState {
        WorldState::new(BlockContext::default(), Fork::Istanbul)
    }

    fn addr(n: u64) -> Address {
        Address::from_low_u64(n)
    }

    #[test]
    fn test_unknown_accounts_read_as_empty() {
        let world = world();
        assert_eq!(world.get_balance(&addr(1)), SymBitVec::zero(256));
        assert_eq!(world.get_nonce(&addr(1)), SymBitVec::zero(256));
        assert!(world.get_code(&addr(1)).is_empty());
        assert_eq!(
            world.get_storage_data(&addr(1), &SymBitVec::word(0)),
            SymBitVec::zero(256)
        );
        assert_eq!(world.get_code_hash(&addr(1)), SymBitVec::zero(256));
    }

    #[test]
    fn test_address_conversions() {
        let a = Address::from_hex("0xcd1722f3947def4cf144679da39c4c32bdc35681").unwrap();
        assert_eq!(a.to_string(), "0xcd1722f3947def4cf144679da39c4c32bdc35681");
        assert_eq!(Address::from_word(&a.to_word()), Some(a));
        assert!(Address::from_hex("0x1cd1722f3947def4cf144679da39c4c32bdc35681").is_err());
    }

    #[test]
    fn test_create_account_collision() {
        let mut world = world();
        world
            .create_account(addr(1), SymBitVec::word(5), SymBitVec::word(0), vec![0x00])
            .unwrap();
        assert_eq!(
            world.create_account(addr(1), SymBitVec::word(0), SymBitVec::word(0), vec![]),
            Err(SevmError::AccountExists(addr(1).0))
        );

        world.add_to_balance(&addr(2), &SymBitVec::word(7));
        world
            .create_account(addr(2), SymBitVec::word(1), SymBitVec::word(1), vec![0x00])
            .unwrap();
        assert_eq!(world.get_balance(&addr(2)), SymBitVec::word(8));
    }

    #[test]
    fn test_revert_restores_everything() {
        let mut world = world();
        world
            .create_account(addr(1), SymBitVec::word(100), SymBitVec::word(0), vec![])
            .unwrap();
        world.set_storage_data(&addr(1), SymBitVec::word(1), SymBitVec::word(11));
        let before_accounts: Vec<_> = world.accounts().copied().collect();
        let before = world.account(&addr(1)).cloned();

        let cp = world.checkpoint();
        world.transfer(&addr(1), &addr(2), &SymBitVec::word(40));
        world.set_storage_data(&addr(1), SymBitVec::word(1), SymBitVec::word(12));
        world.set_storage_data(&addr(1), SymBitVec::word(2), SymBitVec::word(22));
        world.increase_nonce(&addr(1));
        world.set_code(&addr(1), vec![0x60]);
        world.add_log(LogEntry {
            address: addr(1),
            topics: vec![],
            data: ByteVec::new(),
        });
        world.schedule_destruct(&addr(1));
        world.add_refund(&SymBitVec::word(24000));
        world.revert_to(cp);

        assert_eq!(world.account(&addr(1)).cloned(), before);
        assert_eq!(world.accounts().copied().collect::<Vec<_>>(), before_accounts);
        assert!(world.logs().is_empty());
        assert!(!world.is_scheduled_for_destruct(&addr(1)));
        assert_eq!(world.refund(), &SymBitVec::zero(256));
    }

    #[test]
    fn test_original_storage_snapshot() {
        let mut world = world();
        world.set_storage_data(&addr(1), SymBitVec::word(1), SymBitVec::word(5));
        world.finalize_transaction();
        world.set_storage_data(&addr(1), SymBitVec::word(1), SymBitVec::word(6));
        assert_eq!(
            world.get_original_storage_data(&addr(1), &SymBitVec::word(1)),
            SymBitVec::word(5)
        );
        assert_eq!(
            world.get_storage_data(&addr(1), &SymBitVec::word(1)),
            SymBitVec::word(6)
        );
    }

    #[test]
    fn test_destruct_is_deferred() {
        let mut world = world();
        world
            .create_account(addr(1), SymBitVec::word(0), SymBitVec::word(1), vec![0x00])
            .unwrap();
        assert!(world.schedule_destruct(&addr(1)));
        assert!(!world.schedule_destruct(&addr(1)));
        assert_eq!(world.get_code(&addr(1)), &[0x00]);
        world.finalize_transaction();
        assert!(!world.account_exists(&addr(1)));
    }

    #[test]
    fn test_block_hash_window() {
        let block = BlockContext {
            number: SymBitVec::word(1000),
            ..BlockContext::default()
        };
        let world = WorldState::new(block, Fork::Istanbul);
        assert_eq!(world.block_hash(&SymBitVec::word(1000)), SymBitVec::zero(256));
        assert_eq!(world.block_hash(&SymBitVec::word(700)), SymBitVec::zero(256));
        assert_eq!(
            world.block_hash(&SymBitVec::word(999)),
            SymBitVec::word(999).keccak()
        );
        assert_eq!(
            world.block_hash(&SymBitVec::word(744)),
            SymBitVec::word(744).keccak()
        );
    }
}
