// SPDX-License-Identifier: AGPL-3.0

//! In-process oracle for pinned inputs
//!
//! Derives a model from `symbol == value` constraints, repeating until no
//! new symbol gets bound, then checks every constraint under that model. It
//! answers exactly when the constraints determine every symbol a query
//! touches, and reports `Unknown` otherwise.

use evmsym_bitvec::{BoolTerm, CmpOp, Model, SymBitVec, SymBool, Term};
use num_bigint::BigUint;
use std::rc::Rc;
use tracing::trace;

use crate::{ConstraintSet, Solver, SolverError, SolverResult};

#[derive(Debug, Clone, Copy, Default)]
pub struct PropagationSolver;

impl PropagationSolver {
    pub fn new() -> Self {
        Self
    }

    /// Bind the symbols of `lhs` so that it evaluates to `value`
    fn bind_eq(lhs: &Rc<Term>, value: &BigUint, model: &mut Model) -> bool {
        match &**lhs {
            Term::Var(name, _) if !model.contains_key(name) => {
                model.insert(name.clone(), value.clone());
                true
            }
            Term::Concat(parts) => {
                let mut changed = false;
                let mut offset = lhs.size();
                for part in parts {
                    let size = part.size();
                    offset -= size;
                    let slice = (value >> offset as usize) & ((BigUint::from(1u8) << size as usize) - 1u8);
                    changed |= Self::bind_eq(part, &slice, model);
                }
                changed
            }
            Term::ZeroExt(_, arg) => Self::bind_eq(arg, value, model),
            _ => false,
        }
    }

    fn propagate(term: &Rc<BoolTerm>, model: &mut Model) -> bool {
        match &**term {
            BoolTerm::Cmp(CmpOp::Eq, lhs, rhs) => {
                if let Some(value) = rhs.eval(model) {
                    if Self::bind_eq(lhs, &value, model) {
                        return true;
                    }
                }
                match lhs.eval(model) {
                    Some(value) => Self::bind_eq(rhs, &value, model),
                    None => false,
                }
            }
            BoolTerm::And(lhs, rhs) => {
                let left = Self::propagate(lhs, model);
                let right = Self::propagate(rhs, model);
                left || right
            }
            _ => false,
        }
    }

    /// The model implied by the constraints, or None when they contradict it
    pub fn model(&self, constraints: &ConstraintSet) -> SolverResult<Option<Model>> {
        let mut model = Model::new();
        loop {
            let mut changed = false;
            for constraint in constraints.constraints() {
                if let SymBool::Symbolic(term) = constraint {
                    changed |= Self::propagate(term, &mut model);
                }
            }
            if !changed {
                break;
            }
        }

        for constraint in constraints.constraints() {
            match constraint.eval(&model) {
                Some(true) => {}
                Some(false) => {
                    trace!("constraint violated: {}", constraint);
                    return Ok(None);
                }
                None => {
                    return Err(SolverError::Unknown(format!(
                        "constraint is not determined by pinned symbols: {}",
                        constraint
                    )))
                }
            }
        }
        Ok(Some(model))
    }
}

impl Solver for PropagationSolver {
    fn check(&self, constraints: &ConstraintSet) -> SolverResult<bool> {
        Ok(self.model(constraints)?.is_some())
    }

    fn get_all_values(
        &self,
        constraints: &ConstraintSet,
        expression: &SymBitVec,
        max: usize,
    ) -> SolverResult<Vec<BigUint>> {
        if max == 0 {
            return Ok(Vec::new());
        }
        let Some(model) = self.model(constraints)? else {
            return Ok(Vec::new());
        };
        expression
            .eval(&model)
            .map(|value| vec![value])
            .ok_or_else(|| {
                SolverError::Unknown(format!("expression has free symbols: {}", expression))
            })
    }

    fn can_be_true(&self, constraints: &ConstraintSet, condition: &SymBool) -> SolverResult<bool> {
        let Some(model) = self.model(constraints)? else {
            return Ok(false);
        };
        condition
            .eval(&model)
            .ok_or_else(|| SolverError::Unknown(format!("condition has free symbols: {}", condition)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn w(value: u64) -> SymBitVec {
        SymBitVec::word(value)
    }

    #[test]
    fn test_pinned_values_evaluate() {
        let mut cs = ConstraintSet::new();
        let gas = cs.new_bitvec(256, "gas");
        cs.add(gas.equals(&w(100000)));
        let remaining = gas.sub(&w(27));
        let solver = PropagationSolver::new();
        assert_eq!(
            solver.get_all_values(&cs, &remaining, 3).unwrap(),
            vec![BigUint::from(99973u32)]
        );
        assert!(solver.must_be_true(&cs, &remaining.ult(&gas)).unwrap());
    }

    #[test]
    fn test_bindings_chain_through_derived_symbols() {
        let mut cs = ConstraintSet::new();
        let a = cs.new_bitvec(256, "a");
        let b = cs.new_bitvec(256, "b");
        cs.add(b.equals(&a.add(&w(1))));
        cs.add(a.equals(&w(41)));
        let solver = PropagationSolver::new();
        assert_eq!(solver.get_value(&cs, &b).unwrap(), BigUint::from(42u8));
    }

    #[test]
    fn test_bytes_bind_through_concat() {
        let mut cs = ConstraintSet::new();
        let data = cs.new_bytes(2, "data");
        let word = data.to_bitvec().unwrap();
        cs.add(word.equals(&SymBitVec::from_u64(0xaabb, 16)));
        let solver = PropagationSolver::new();
        assert_eq!(solver.get_bytes(&cs, &data).unwrap(), vec![0xaa, 0xbb]);
    }

    #[test]
    fn test_contradiction_is_unsat() {
        let mut cs = ConstraintSet::new();
        let x = cs.new_bitvec(256, "x");
        cs.add(x.equals(&w(1)));
        cs.add(x.equals(&w(2)));
        let solver = PropagationSolver::new();
        assert!(!solver.check(&cs).unwrap());
        assert!(solver.get_all_values(&cs, &x, 3).unwrap().is_empty());
        assert!(matches!(solver.get_value(&cs, &x), Err(SolverError::Unsat)));
    }

    #[test]
    fn test_free_symbol_is_unknown() {
        let mut cs = ConstraintSet::new();
        let x = cs.new_bitvec(256, "x");
        let solver = PropagationSolver::new();
        assert!(matches!(
            solver.get_all_values(&cs, &x, 3),
            Err(SolverError::Unknown(_))
        ));
    }
}
