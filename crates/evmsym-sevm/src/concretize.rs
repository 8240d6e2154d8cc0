// SPDX-License-Identifier: AGPL-3.0

//! Suspension requests for values the interpreter cannot proceed on
//!
//! A suspended instruction has made no observable change. Once the driver
//! binds the expression and resumes, the same instruction runs again and
//! finds the value concrete.

use std::fmt;

use evmsym_bitvec::SymBitVec;

use crate::world::Address;

/// How the driver should pick among the feasible values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Policy {
    /// Every feasible value is a distinct path worth exploring
    All,
    /// Any single feasible value will do
    One,
    /// Prefer the value that makes the instruction fault
    Pessimistic,
}

/// Yes/no questions whose answer is recorded rather than substituted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Check {
    /// Is the remaining gas below the instruction's cost?
    OutOfGas,
    /// Is the JUMPI condition non-zero?
    Branch,
    /// Is the balance below the value a CALL/CREATE wants to send?
    InsufficientFunds,
    /// Is the top-level gas budget below the intrinsic cost?
    IntrinsicGas,
    /// Can the sender not afford `value + gas * price`?
    UpfrontCost,
    /// Is the gas left after initcode below the code deposit cost?
    CodeDeposit,
}

/// Where the value chosen by the driver goes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResumeTarget {
    /// Replace the stack item at this depth from the top
    StackSlot(usize),
    /// Record the answer to a yes/no question (1 means yes)
    Verdict(Check),
    /// Replace the nonce of an account
    Nonce(Address),
    /// Replace the block's coinbase
    Coinbase,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Concretize {
    pub expression: SymBitVec,
    pub policy: Policy,
    pub target: ResumeTarget,
    pub reason: &'static str,
}

impl Concretize {
    pub fn new(
        expression: SymBitVec,
        policy: Policy,
        target: ResumeTarget,
        reason: &'static str,
    ) -> Self {
        Self {
            expression,
            policy,
            target,
            reason,
        }
    }
}

impl fmt::Display for Concretize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "concretize {} ({:?}, {:?}) for {}",
            self.expression, self.policy, self.target, self.reason
        )
    }
}

/// Answers to yes/no questions for the instruction being executed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Verdicts {
    decided: Vec<(Check, bool)>,
}

impl Verdicts {
    pub fn get(&self, check: Check) -> Option<bool> {
        self.decided
            .iter()
            .find(|(c, _)| *c == check)
            .map(|(_, answer)| *answer)
    }

    pub fn set(&mut self, check: Check, answer: bool) {
        self.decided.retain(|(c, _)| *c != check);
        self.decided.push((check, answer));
    }

    pub fn clear(&mut self) {
        self.decided.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.decided.is_empty()
    }
}
