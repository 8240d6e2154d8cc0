// SPDX-License-Identifier: AGPL-3.0

//! Constraint store and solver oracles
//!
//! The engine never calls a solver itself. Drivers hold a [`ConstraintSet`]
//! and a [`Solver`] and use them to answer concretization requests.

pub mod propagation;
pub mod smtlib;

use evmsym_bitvec::{Decls, SymBitVec, SymBool};
use evmsym_bytevec::{ByteVec, SymByte};
use num_bigint::BigUint;
use std::collections::BTreeSet;
use thiserror::Error;

pub use propagation::PropagationSolver;
pub use smtlib::{SatResult, SmtLibSolver};

#[derive(Error, Debug)]
pub enum SolverError {
    #[error("Constraints are unsatisfiable")]
    Unsat,

    #[error("Solver could not decide: {0}")]
    Unknown(String),

    #[error("Solver timed out")]
    Timeout,

    #[error("Solver process failed: {0}")]
    Process(String),

    #[error("Failed to parse solver output: {0}")]
    Parse(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type SolverResult<T> = Result<T, SolverError>;

/// Conjunction of boolean constraints plus the symbols declared for them
#[derive(Debug, Clone, Default)]
pub struct ConstraintSet {
    constraints: Vec<SymBool>,
    names: BTreeSet<String>,
}

impl ConstraintSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn fresh_name(&mut self, name: &str) -> String {
        let mut candidate = name.to_string();
        let mut suffix = 1;
        while self.names.contains(&candidate) {
            candidate = format!("{}_{}", name, suffix);
            suffix += 1;
        }
        self.names.insert(candidate.clone());
        candidate
    }

    /// Declare a fresh symbolic bit vector; the name is made unique
    pub fn new_bitvec(&mut self, size: u32, name: &str) -> SymBitVec {
        let name = self.fresh_name(name);
        SymBitVec::var(name, size)
    }

    /// Declare `len` fresh symbolic bytes named `{name}_{i}`
    pub fn new_bytes(&mut self, len: usize, name: &str) -> ByteVec {
        let base = self.fresh_name(name);
        let bytes = (0..len)
            .map(|i| {
                let byte = self.fresh_name(&format!("{}_{}", base, i));
                SymByte::from_bitvec(&SymBitVec::var(byte, 8))
            })
            .collect();
        ByteVec::from_sym_bytes(bytes)
    }

    /// Constrain symbolic bytes to equal concrete ones
    pub fn add_bytes_eq(&mut self, data: &ByteVec, bytes: &[u8]) {
        for (i, byte) in data.iter().enumerate() {
            let expected = bytes.get(i).copied().unwrap_or(0);
            self.add(byte.to_bitvec().equals(&SymBitVec::from_u64(u64::from(expected), 8)));
        }
    }

    pub fn add(&mut self, constraint: SymBool) {
        if constraint != SymBool::Concrete(true) {
            self.constraints.push(constraint);
        }
    }

    pub fn constraints(&self) -> &[SymBool] {
        &self.constraints
    }

    pub fn len(&self) -> usize {
        self.constraints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.constraints.is_empty()
    }

    /// True when a constraint already folded to false
    pub fn is_trivially_unsat(&self) -> bool {
        self.constraints.contains(&SymBool::Concrete(false))
    }

    pub fn decls(&self) -> Decls {
        let mut decls = Decls::default();
        for constraint in &self.constraints {
            constraint.collect_decls(&mut decls);
        }
        decls
    }
}

/// The solver oracle
pub trait Solver {
    /// Is the constraint set satisfiable?
    fn check(&self, constraints: &ConstraintSet) -> SolverResult<bool>;

    /// Up to `max` distinct values `expression` can take; empty when unsatisfiable
    fn get_all_values(
        &self,
        constraints: &ConstraintSet,
        expression: &SymBitVec,
        max: usize,
    ) -> SolverResult<Vec<BigUint>>;

    /// One satisfying value
    fn get_value(&self, constraints: &ConstraintSet, expression: &SymBitVec) -> SolverResult<BigUint> {
        if let Some(value) = expression.as_biguint() {
            return Ok(value.clone());
        }
        self.get_all_values(constraints, expression, 1)?
            .into_iter()
            .next()
            .ok_or(SolverError::Unsat)
    }

    fn can_be_true(&self, constraints: &ConstraintSet, condition: &SymBool) -> SolverResult<bool> {
        if condition.as_bool() == Some(false) {
            return Ok(false);
        }
        let mut extended = constraints.clone();
        extended.add(condition.clone());
        self.check(&extended)
    }

    fn must_be_true(&self, constraints: &ConstraintSet, condition: &SymBool) -> SolverResult<bool> {
        Ok(!self.can_be_true(constraints, &condition.negate())?)
    }

    /// Concrete bytes for a possibly symbolic byte sequence
    fn get_bytes(&self, constraints: &ConstraintSet, data: &ByteVec) -> SolverResult<Vec<u8>> {
        if let Some(bytes) = data.as_concrete() {
            return Ok(bytes);
        }
        let mut out = Vec::with_capacity(data.len());
        for byte in data.iter() {
            match byte.as_u8() {
                Some(b) => out.push(b),
                None => {
                    let value = self.get_value(constraints, &byte.to_bitvec())?;
                    out.push(evmsym_bitvec::be_bytes(&value, 1)[0]);
                }
            }
        }
        Ok(out)
    }
}
