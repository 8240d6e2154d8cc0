// SPDX-License-Identifier: AGPL-3.0

//! JSON report of a finished transaction

use evmsym_bitvec::{be_bytes, SymBitVec};
use evmsym_bytevec::ByteVec;
use evmsym_hashes::{logs_digest, to_hex, LogRecord};
use evmsym_sevm::{EvmWorld, LogEntry, TxResult};
use evmsym_solver::{ConstraintSet, Solver};
use num_bigint::BigUint;
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Serialize)]
pub struct PathReport {
    pub outcome: String,
    pub error: Option<String>,
    pub return_data: String,
    pub gas_left: String,
    pub gas_used: String,
    pub created: Option<String>,
    pub logs: Vec<LogReport>,
    /// keccak256 of the RLP-encoded logs; absent when a log is not concrete
    pub logs_digest: Option<String>,
    pub accounts: BTreeMap<String, AccountReport>,
    pub constraints: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogReport {
    pub address: String,
    pub topics: Vec<String>,
    pub data: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AccountReport {
    pub balance: String,
    pub nonce: String,
    pub code: String,
    pub storage: BTreeMap<String, String>,
}

fn prefixed(bytes: &[u8]) -> String {
    format!("0x{}", to_hex(bytes))
}

/// Renders values, concretizing through the solver where the path pins them
struct Renderer<'a, S: Solver> {
    solver: &'a S,
    constraints: &'a ConstraintSet,
}

impl<'a, S: Solver> Renderer<'a, S> {
    fn word(&self, value: &SymBitVec) -> String {
        match self.value(value) {
            Some(concrete) => format!("0x{:x}", concrete),
            None => value.to_string(),
        }
    }

    /// The value of `value` when the path determines it
    fn value(&self, value: &SymBitVec) -> Option<BigUint> {
        match value.as_biguint() {
            Some(concrete) => Some(concrete.clone()),
            None => self.solver.get_value(self.constraints, value).ok(),
        }
    }

    fn bytes(&self, data: &ByteVec) -> Option<Vec<u8>> {
        self.solver.get_bytes(self.constraints, data).ok()
    }

    fn bytes_text(&self, data: &ByteVec) -> String {
        match self.bytes(data) {
            Some(bytes) => prefixed(&bytes),
            None => data.to_string(),
        }
    }

    fn record(&self, log: &LogEntry) -> Option<LogRecord> {
        let mut topics = Vec::with_capacity(log.topics.len());
        for topic in &log.topics {
            let bytes = be_bytes(&self.value(topic)?, 32);
            topics.push(<[u8; 32]>::try_from(bytes.as_slice()).ok()?);
        }
        Some(LogRecord {
            address: log.address.0,
            topics,
            data: self.bytes(&log.data)?,
        })
    }
}

impl PathReport {
    pub fn build<S: Solver>(
        solver: &S,
        constraints: &ConstraintSet,
        world: &EvmWorld,
        result: &TxResult,
    ) -> Self {
        let render = Renderer {
            solver,
            constraints,
        };

        let logs = result
            .logs
            .iter()
            .map(|log| LogReport {
                address: log.address.to_string(),
                topics: log.topics.iter().map(|t| render.word(t)).collect(),
                data: render.bytes_text(&log.data),
            })
            .collect();
        let records: Option<Vec<LogRecord>> =
            result.logs.iter().map(|log| render.record(log)).collect();

        let mut accounts = BTreeMap::new();
        for address in world.world().accounts() {
            let Some(account) = world.world().account(address) else {
                continue;
            };
            let storage = account
                .storage
                .iter()
                .map(|(key, value)| (render.word(key), render.word(value)))
                .collect();
            accounts.insert(
                address.to_string(),
                AccountReport {
                    balance: render.word(&account.balance),
                    nonce: render.word(&account.nonce),
                    code: prefixed(&account.code),
                    storage,
                },
            );
        }

        Self {
            outcome: result.kind.name().to_string(),
            error: result.error().map(ToString::to_string),
            return_data: render.bytes_text(&result.return_data),
            gas_left: render.word(&result.gas_left),
            gas_used: render.word(&result.gas_used),
            created: result.created.map(|address| address.to_string()),
            logs,
            logs_digest: records.map(|records| prefixed(&logs_digest(&records))),
            accounts,
            constraints: constraints.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use evmsym_solver::PropagationSolver;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_words_render_through_pins() {
        let mut constraints = ConstraintSet::new();
        let x = constraints.new_bitvec(256, "x");
        let y = constraints.new_bitvec(256, "y");
        constraints.add(x.equals(&SymBitVec::word(0x2a)));
        let solver = PropagationSolver::new();
        let render = Renderer {
            solver: &solver,
            constraints: &constraints,
        };
        assert_eq!(render.word(&x.add(&SymBitVec::word(1))), "0x2b");
        assert_eq!(render.word(&SymBitVec::zero(256)), "0x0");
        // y is free: the expression itself is shown
        assert_eq!(render.word(&y), y.to_string());
        assert_eq!(render.bytes_text(&ByteVec::from_bytes(&[0xab])), "0xab");
    }
}
