// SPDX-License-Identifier: AGPL-3.0

//! Gas schedule per fork
//!
//! Costs are plain integers where the rules allow it and symbolic words where
//! they depend on symbolic state (storage values, account emptiness,
//! call-data bytes).

use evmsym_bitvec::{SymBitVec, SymBool};
use evmsym_bytevec::{ByteVec, SymByte};
use evmsym_config::Fork;
use evmsym_constants::WORD_SIZE;

use crate::opcodes::*;

pub const G_ZERO: u64 = 0;
pub const G_JUMPDEST: u64 = 1;
pub const G_BASE: u64 = 2;
pub const G_VERYLOW: u64 = 3;
pub const G_LOW: u64 = 5;
pub const G_MID: u64 = 8;
pub const G_HIGH: u64 = 10;
pub const G_EXP: u64 = 10;
pub const G_SHA3: u64 = 30;
pub const G_SHA3_WORD: u64 = 6;
pub const G_COPY: u64 = 3;
pub const G_BLOCKHASH: u64 = 20;
pub const G_MEMORY: u64 = 3;
pub const G_QUAD_COEFF_DIV: u64 = 512;
pub const G_LOG: u64 = 375;
pub const G_LOG_TOPIC: u64 = 375;
pub const G_LOG_DATA: u64 = 8;
pub const G_CREATE: u64 = 32000;
pub const G_CODE_DEPOSIT: u64 = 200;
pub const G_CALL_VALUE: u64 = 9000;
pub const G_NEW_ACCOUNT: u64 = 25000;
pub const G_SSET: u64 = 20000;
pub const G_SRESET: u64 = 5000;
pub const R_SCLEAR: u64 = 15000;
pub const R_SELFDESTRUCT: u64 = 24000;
pub const G_TRANSACTION: u64 = 21000;
pub const G_TX_CREATE: u64 = 32000;
pub const G_TX_DATA_ZERO: u64 = 4;
pub const G_SLOAD_ISTANBUL: u64 = 800;
pub const G_SSTORE_SENTRY: u64 = 2300;
pub const R_SRESET_ISTANBUL: u64 = 4200;
pub const R_SSET_ISTANBUL: u64 = 19200;

/// Fork-dependent prices
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GasSchedule {
    pub fork: Fork,
    pub sload: u64,
    pub balance: u64,
    pub extcode: u64,
    pub extcodehash: u64,
    pub call: u64,
    pub selfdestruct: u64,
    pub exp_byte: u64,
    pub tx_data_nonzero: u64,
}

impl GasSchedule {
    pub fn for_fork(fork: Fork) -> Self {
        let mut schedule = GasSchedule {
            fork,
            sload: 50,
            balance: 20,
            extcode: 20,
            extcodehash: 400,
            call: 40,
            selfdestruct: 0,
            exp_byte: 10,
            tx_data_nonzero: 68,
        };
        // EIP-150
        if fork >= Fork::TangerineWhistle {
            schedule.sload = 200;
            schedule.balance = 400;
            schedule.extcode = 700;
            schedule.call = 700;
            schedule.selfdestruct = 5000;
        }
        // EIP-160
        if fork >= Fork::SpuriousDragon {
            schedule.exp_byte = 50;
        }
        // EIP-1884, EIP-2028
        if fork >= Fork::Istanbul {
            schedule.sload = G_SLOAD_ISTANBUL;
            schedule.balance = 700;
            schedule.extcodehash = 700;
            schedule.tx_data_nonzero = 16;
        }
        schedule
    }

    /// Fixed part of an instruction's cost
    pub fn static_cost(&self, op: u8) -> u64 {
        match op {
            OP_STOP | OP_RETURN | OP_REVERT | OP_INVALID | OP_SSTORE => G_ZERO,
            OP_JUMPDEST => G_JUMPDEST,
            OP_ADDRESS | OP_ORIGIN | OP_CALLER | OP_CALLVALUE | OP_CALLDATASIZE | OP_CODESIZE
            | OP_GASPRICE | OP_RETURNDATASIZE | OP_COINBASE | OP_TIMESTAMP | OP_NUMBER
            | OP_DIFFICULTY | OP_GASLIMIT | OP_CHAINID | OP_POP | OP_PC | OP_MSIZE | OP_GAS => {
                G_BASE
            }
            OP_ADD | OP_SUB | OP_NOT | OP_LT | OP_GT | OP_SLT | OP_SGT | OP_EQ | OP_ISZERO
            | OP_AND | OP_OR | OP_XOR | OP_BYTE | OP_SHL | OP_SHR | OP_SAR | OP_CALLDATALOAD
            | OP_MLOAD | OP_MSTORE | OP_MSTORE8 | OP_CALLDATACOPY | OP_CODECOPY
            | OP_RETURNDATACOPY => G_VERYLOW,
            OP_PUSH1..=OP_PUSH32 | OP_DUP1..=OP_DUP16 | OP_SWAP1..=OP_SWAP16 => G_VERYLOW,
            OP_MUL | OP_DIV | OP_SDIV | OP_MOD | OP_SMOD | OP_SIGNEXTEND | OP_SELFBALANCE => G_LOW,
            OP_ADDMOD | OP_MULMOD | OP_JUMP => G_MID,
            OP_JUMPI | OP_EXP => G_HIGH,
            OP_SHA3 => G_SHA3,
            OP_BALANCE => self.balance,
            OP_EXTCODESIZE | OP_EXTCODECOPY => self.extcode,
            OP_EXTCODEHASH => self.extcodehash,
            OP_BLOCKHASH => G_BLOCKHASH,
            OP_SLOAD => self.sload,
            OP_LOG0..=OP_LOG4 => G_LOG + G_LOG_TOPIC * u64::from(op - OP_LOG0),
            OP_CREATE | OP_CREATE2 => G_CREATE,
            OP_CALL | OP_CALLCODE | OP_DELEGATECALL | OP_STATICCALL => self.call,
            OP_SELFDESTRUCT => self.selfdestruct,
            _ => G_ZERO,
        }
    }

    /// EXP cost for an exponent of `exponent_bytes` significant bytes
    pub fn exp_cost(&self, exponent_bytes: u64) -> u64 {
        G_EXP + self.exp_byte * exponent_bytes
    }

    /// Frontier and Homestead hand the callee all requested gas
    pub fn caps_call_gas(&self) -> bool {
        self.fork >= Fork::TangerineWhistle
    }

    /// SSTORE cost and refund delta as `(cost, refund_add, refund_sub)`
    pub fn sstore_cost(
        &self,
        original: &SymBitVec,
        current: &SymBitVec,
        new: &SymBitVec,
    ) -> (SymBitVec, SymBitVec, SymBitVec) {
        let zero = SymBitVec::zero(256);
        let w = SymBitVec::word;

        if self.fork < Fork::Istanbul {
            let sets = current.is_zero().and(&new.is_zero().negate());
            let clears = current.is_zero().negate().and(&new.is_zero());
            let cost = SymBitVec::ite(&sets, &w(G_SSET), &w(G_SRESET));
            let refund = SymBitVec::ite(&clears, &w(R_SCLEAR), &zero);
            return (cost, refund, zero);
        }

        // EIP-2200
        let noop = current.equals(new);
        let fresh = original.equals(current);
        let original_zero = original.is_zero();
        let new_zero = new.is_zero();

        let fresh_cost = SymBitVec::ite(&original_zero, &w(G_SSET), &w(G_SRESET));
        let cost = SymBitVec::ite(
            &noop,
            &w(G_SLOAD_ISTANBUL),
            &SymBitVec::ite(&fresh, &fresh_cost, &w(G_SLOAD_ISTANBUL)),
        );

        let dirty = noop.negate().and(&fresh.negate());
        let clean_clear = noop
            .negate()
            .and(&fresh)
            .and(&original_zero.negate())
            .and(&new_zero);
        let dirty_clear = dirty.and(&original_zero.negate()).and(&new_zero);
        let dirty_unclear = dirty
            .and(&original_zero.negate())
            .and(&current.is_zero());
        let restored = dirty.and(&original.equals(new));
        let restored_amount =
            SymBitVec::ite(&original_zero, &w(R_SSET_ISTANBUL), &w(R_SRESET_ISTANBUL));

        let refund_add = gated(&clean_clear, R_SCLEAR)
            .add(&gated(&dirty_clear, R_SCLEAR))
            .add(&SymBitVec::ite(&restored, &restored_amount, &zero));
        let refund_sub = gated(&dirty_unclear, R_SCLEAR);
        (cost, refund_add, refund_sub)
    }

    /// SSTORE fails outright when no more than the stipend is left
    pub fn has_sstore_sentry(&self) -> bool {
        self.fork >= Fork::Istanbul
    }

    /// Extra charge of a CALL-family instruction on top of its base cost
    pub fn call_extra(
        &self,
        op: u8,
        value: &SymBitVec,
        target_exists: bool,
        target_empty: &SymBool,
    ) -> SymBitVec {
        let zero = SymBitVec::zero(256);
        let transfers = value.is_zero().negate();
        let transfer_cost = match op {
            OP_CALL | OP_CALLCODE => gated(&transfers, G_CALL_VALUE),
            _ => zero.clone(),
        };
        let new_account = if op != OP_CALL {
            SymBool::Concrete(false)
        } else if self.fork >= Fork::SpuriousDragon {
            // EIP-161
            transfers.and(target_empty)
        } else {
            SymBool::Concrete(!target_exists)
        };
        transfer_cost.add(&gated(&new_account, G_NEW_ACCOUNT))
    }

    /// Extra SELFDESTRUCT charge for creating the beneficiary
    pub fn selfdestruct_extra(
        &self,
        beneficiary_exists: bool,
        beneficiary_empty: &SymBool,
        balance: &SymBitVec,
    ) -> SymBitVec {
        if self.fork < Fork::TangerineWhistle {
            return SymBitVec::zero(256);
        }
        let new_account = if self.fork >= Fork::SpuriousDragon {
            beneficiary_empty.and(&balance.is_zero().negate())
        } else {
            SymBool::Concrete(!beneficiary_exists)
        };
        gated(&new_account, G_NEW_ACCOUNT)
    }

    /// Intrinsic gas of a top-level transaction
    pub fn intrinsic_gas(&self, is_create: bool, data: &ByteVec) -> SymBitVec {
        let mut fixed = G_TRANSACTION;
        if is_create && self.fork >= Fork::Homestead {
            fixed += G_TX_CREATE;
        }
        let mut symbolic = SymBitVec::zero(256);
        for byte in data.iter() {
            match byte {
                SymByte::Concrete(0) => fixed += G_TX_DATA_ZERO,
                SymByte::Concrete(_) => fixed += self.tx_data_nonzero,
                SymByte::Symbolic(_) => {
                    let cost = SymBitVec::ite(
                        &byte.to_bitvec().is_zero(),
                        &SymBitVec::word(G_TX_DATA_ZERO),
                        &SymBitVec::word(self.tx_data_nonzero),
                    );
                    symbolic = symbolic.add(&cost);
                }
            }
        }
        SymBitVec::word(fixed).add(&symbolic)
    }
}

fn gated(condition: &SymBool, amount: u64) -> SymBitVec {
    SymBitVec::ite(condition, &SymBitVec::word(amount), &SymBitVec::zero(256))
}

pub fn words(size: u64) -> u64 {
    size.div_ceil(WORD_SIZE as u64)
}

/// Total cost of a memory of `words` words
pub fn memory_cost(words: u64) -> u64 {
    G_MEMORY * words + words * words / G_QUAD_COEFF_DIV
}

/// Cost of growing memory from `current` bytes to cover `[offset, offset + size)`
pub fn memory_expansion_cost(current: usize, offset: u64, size: u64) -> u64 {
    if size == 0 {
        return 0;
    }
    let new_words = words(offset + size);
    let old_words = words(current as u64);
    if new_words <= old_words {
        return 0;
    }
    memory_cost(new_words) - memory_cost(old_words)
}

/// EIP-150: all but one 64th of the available gas
pub fn all_but_one_64th(gas: &SymBitVec) -> SymBitVec {
    gas.sub(&gas.udiv(&SymBitVec::word(64)))
}
