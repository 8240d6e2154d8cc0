// SPDX-License-Identifier: AGPL-3.0

//! Reference driver answering concretization requests with a solver

use evmsym_bitvec::SymBitVec;
use evmsym_exceptions::SevmError;
use evmsym_logs::{warn_code, ErrorCode};
use evmsym_solver::{ConstraintSet, Solver, SolverError};
use num_bigint::BigUint;
use thiserror::Error;
use tracing::{debug, info};

use crate::concretize::{Concretize, Policy};
use crate::transaction::{EvmWorld, RunState, TxResult};
use crate::worklist::Worklist;

#[derive(Error, Debug)]
pub enum DriverError {
    #[error(transparent)]
    Solver(#[from] SolverError),

    #[error(transparent)]
    Engine(#[from] SevmError),

    #[error("No feasible value for {0}")]
    Infeasible(String),
}

pub type DriverResult<T> = Result<T, DriverError>;

/// A finished path of [`Driver::explore`]
#[derive(Debug, Clone)]
pub struct PathResult {
    pub world: EvmWorld,
    pub constraints: ConstraintSet,
    pub result: TxResult,
}

pub struct Driver<S: Solver> {
    pub world: EvmWorld,
    pub constraints: ConstraintSet,
    solver: S,
    max_solutions: usize,
}

impl<S: Solver> Driver<S> {
    pub fn new(world: EvmWorld, constraints: ConstraintSet, solver: S) -> Self {
        let max_solutions = world.config().solver.max_solutions.max(1);
        Self {
            world,
            constraints,
            solver,
            max_solutions,
        }
    }

    pub fn solver(&self) -> &S {
        &self.solver
    }

    /// Run the open transaction to completion, binding one value per suspension
    pub fn run(&mut self) -> DriverResult<TxResult> {
        loop {
            match self.world.run()? {
                RunState::Completed(result) => return Ok(result),
                RunState::Suspended(request) => {
                    let value = choose(&self.solver, &self.constraints, &request)?;
                    bind(&mut self.world, &mut self.constraints, &request, value)?;
                }
            }
        }
    }

    /// Explore every candidate of `All`-policy suspensions as a separate path,
    /// starting from the current world and constraints
    pub fn explore(&self) -> DriverResult<Vec<PathResult>> {
        let mut worklist = Worklist::new();
        worklist.push((self.world.clone(), self.constraints.clone()));
        let mut finished = Vec::new();

        while let Some((mut world, mut constraints)) = worklist.pop() {
            match world.run()? {
                RunState::Completed(result) => {
                    worklist.mark_completed();
                    finished.push(PathResult {
                        world,
                        constraints,
                        result,
                    });
                }
                RunState::Suspended(request) if request.policy == Policy::All => {
                    let values =
                        candidates(&self.solver, &constraints, &request, self.max_solutions)?;
                    if values.len() > 1 {
                        debug!(%request, paths = values.len(), "forking");
                    }
                    // reversed so the first candidate is explored first
                    for value in values.into_iter().rev() {
                        let mut world = world.clone();
                        let mut constraints = constraints.clone();
                        bind(&mut world, &mut constraints, &request, value)?;
                        worklist.push((world, constraints));
                    }
                }
                RunState::Suspended(request) => {
                    let value = choose(&self.solver, &constraints, &request)?;
                    bind(&mut world, &mut constraints, &request, value)?;
                    worklist.push((world, constraints));
                }
            }
        }
        info!(paths = worklist.completed_paths, "exploration finished");
        Ok(finished)
    }

    /// Every value `expression` can take, up to the configured bound
    pub fn values(&self, expression: &SymBitVec) -> DriverResult<Vec<BigUint>> {
        if let Some(value) = expression.as_biguint() {
            return Ok(vec![value.clone()]);
        }
        Ok(self
            .solver
            .get_all_values(&self.constraints, expression, self.max_solutions)?)
    }

    pub fn value(&self, expression: &SymBitVec) -> DriverResult<BigUint> {
        Ok(self.solver.get_value(&self.constraints, expression)?)
    }
}

fn candidates<S: Solver>(
    solver: &S,
    constraints: &ConstraintSet,
    request: &Concretize,
    max: usize,
) -> DriverResult<Vec<BigUint>> {
    if let Some(value) = request.expression.as_biguint() {
        return Ok(vec![value.clone()]);
    }
    let values = solver.get_all_values(constraints, &request.expression, max)?;
    if values.is_empty() {
        return Err(DriverError::Infeasible(request.to_string()));
    }
    Ok(values)
}

/// Pick the single value a non-forking driver continues with
fn choose<S: Solver>(
    solver: &S,
    constraints: &ConstraintSet,
    request: &Concretize,
) -> DriverResult<BigUint> {
    let expression = &request.expression;
    if let Some(value) = expression.as_biguint() {
        return Ok(value.clone());
    }
    if request.policy == Policy::Pessimistic && expression.size() == 1 {
        // the fault stands unless it is shown to be impossible
        let fault = expression.equals(&SymBitVec::from_u64(1, 1));
        return match solver.can_be_true(constraints, &fault) {
            Ok(true) => Ok(BigUint::from(1u8)),
            Ok(false) => Ok(BigUint::from(0u8)),
            Err(SolverError::Unknown(reason)) => {
                warn_code(
                    ErrorCode::SolverUnknown,
                    &format!("assuming the fault for {}: {}", request.reason, reason),
                    false,
                );
                Ok(BigUint::from(1u8))
            }
            Err(err) => Err(err.into()),
        };
    }
    candidates(solver, constraints, request, 1)?
        .into_iter()
        .next()
        .ok_or_else(|| DriverError::Infeasible(request.to_string()))
}

fn bind(
    world: &mut EvmWorld,
    constraints: &mut ConstraintSet,
    request: &Concretize,
    value: BigUint,
) -> DriverResult<()> {
    let size = request.expression.size();
    constraints.add(
        request
            .expression
            .equals(&SymBitVec::from_biguint(value.clone(), size)),
    );
    world.resume(value)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::TxRequest;
    use crate::vm::{CallKind, Outcome};
    use crate::world::{Address, BlockContext};
    use evmsym_bitvec::{Decls, Model};
    use evmsym_bytevec::ByteVec;
    use evmsym_config::{Config, Fork, OogPolicy};
    use evmsym_exceptions::ExceptionalHalt;
    use evmsym_solver::{PropagationSolver, SolverResult};
    use pretty_assertions::assert_eq;

    /// Tries every assignment of the declared symbols over a small domain
    struct BruteSolver {
        domain: Vec<u64>,
    }

    impl BruteSolver {
        fn models(&self, constraints: &ConstraintSet, extra: &SymBitVec) -> Vec<Model> {
            let mut decls = constraints.decls();
            extra.collect_decls(&mut decls);
            let Decls { vars, .. } = decls;
            let names: Vec<String> = vars.into_keys().collect();
            let mut models = vec![Model::new()];
            for name in names {
                let mut next = Vec::new();
                for model in &models {
                    for value in &self.domain {
                        let mut model = model.clone();
                        model.insert(name.clone(), BigUint::from(*value));
                        next.push(model);
                    }
                }
                models = next;
            }
            models
                .into_iter()
                .filter(|model| {
                    constraints
                        .constraints()
                        .iter()
                        .all(|c| c.eval(model) == Some(true))
                })
                .collect()
        }
    }

    impl Solver for BruteSolver {
        fn check(&self, constraints: &ConstraintSet) -> SolverResult<bool> {
            Ok(!self.models(constraints, &SymBitVec::zero(1)).is_empty())
        }

        fn get_all_values(
            &self,
            constraints: &ConstraintSet,
            expression: &SymBitVec,
            max: usize,
        ) -> SolverResult<Vec<BigUint>> {
            let mut values = Vec::new();
            for model in self.models(constraints, expression) {
                if let Some(value) = expression.eval(&model) {
                    if !values.contains(&value) {
                        values.push(value);
                    }
                }
            }
            values.sort();
            values.truncate(max);
            Ok(values)
        }
    }

    fn addr(n: u64) -> Address {
        Address::from_low_u64(n)
    }

    fn open(world: &mut EvmWorld, code: Vec<u8>, data: ByteVec, gas: SymBitVec) {
        world
            .create_account(addr(1), SymBitVec::zero(256), SymBitVec::zero(256), code)
            .unwrap();
        world
            .open_transaction(
                CallKind::Call,
                addr(1),
                SymBitVec::zero(256),
                data,
                addr(2),
                SymBitVec::zero(256),
                gas,
            )
            .unwrap();
    }

    // CALLDATALOAD(0) JUMP; STOP at 4, REVERT at 6, 5 is not a destination
    const JUMP_ON_INPUT: [u8; 11] = [
        0x60, 0x00, 0x35, 0x56, 0x5b, 0x00, 0x5b, 0x60, 0x00, 0x80, 0xfd,
    ];

    #[test]
    fn test_run_binds_symbolic_jump() {
        let mut constraints = ConstraintSet::new();
        let data = constraints.new_bytes(32, "data");
        let mut input = [0u8; 32];
        input[31] = 6;
        constraints.add_bytes_eq(&data, &input);

        let mut world = EvmWorld::new(BlockContext::default(), Config::default());
        open(&mut world, JUMP_ON_INPUT.to_vec(), data, SymBitVec::word(1000));
        let mut driver = Driver::new(world, constraints, PropagationSolver::new());
        let result = driver.run().unwrap();
        assert_eq!(result.kind, Outcome::Revert(ByteVec::new()));
    }

    #[test]
    fn test_explore_forks_per_jump_target() {
        let mut constraints = ConstraintSet::new();
        let target = constraints.new_bitvec(256, "target");
        let data = ByteVec::from_bitvec(&target);
        let mut world = EvmWorld::new(BlockContext::default(), Config::default());
        open(&mut world, JUMP_ON_INPUT.to_vec(), data, SymBitVec::word(1000));

        let solver = BruteSolver {
            domain: vec![4, 5, 6],
        };
        let mut outcomes: Vec<String> = Driver::new(world, constraints, solver)
            .explore()
            .unwrap()
            .into_iter()
            .map(|path| path.result.kind.name().to_string())
            .collect();
        outcomes.sort();
        assert_eq!(outcomes, vec!["REVERT", "STOP", "THROW"]);
    }

    #[test]
    fn test_pessimistic_gas_check_prefers_fault() {
        let mut constraints = ConstraintSet::new();
        let gas = constraints.new_bitvec(256, "gas");
        let mut world = EvmWorld::new(
            BlockContext::default(),
            Config::new(Fork::Istanbul, OogPolicy::Pedantic),
        );
        // PUSH1 0 PUSH1 0 SSTORE
        open(&mut world, vec![0x60, 0x00, 0x60, 0x00, 0x55], ByteVec::new(), gas);
        let solver = BruteSolver {
            domain: vec![10, 100000],
        };
        let mut driver = Driver::new(world, constraints, solver);
        let result = driver.run().unwrap();
        assert_eq!(result.error(), Some(&ExceptionalHalt::OutOfGas));
        assert!(driver.constraints.len() >= 1);
    }

    #[test]
    fn test_start_transaction_with_symbolic_value() {
        let mut constraints = ConstraintSet::new();
        let value = constraints.new_bitvec(256, "value");
        constraints.add(value.equals(&SymBitVec::word(7)));
        let mut world = EvmWorld::new(BlockContext::default(), Config::default());
        world
            .create_account(addr(2), SymBitVec::word(100), SymBitVec::zero(256), vec![])
            .unwrap();
        world
            .start_transaction(TxRequest {
                kind: CallKind::Call,
                caller: addr(2),
                address: addr(1),
                value: value.clone(),
                data: ByteVec::new(),
                gas: SymBitVec::word(21000),
                price: SymBitVec::zero(256),
            })
            .unwrap();
        let mut driver = Driver::new(world, constraints, PropagationSolver::new());
        let result = driver.run().unwrap();
        assert!(result.is_success());
        assert_eq!(
            driver.value(&driver.world.get_balance(&addr(1))).unwrap(),
            BigUint::from(7u8)
        );
        assert_eq!(
            driver.values(&driver.world.get_balance(&addr(2))).unwrap(),
            vec![BigUint::from(93u8)]
        );
    }

    #[test]
    fn test_undecided_pessimistic_check_assumes_fault() {
        let mut constraints = ConstraintSet::new();
        let gas = constraints.new_bitvec(256, "gas");
        let mut world = EvmWorld::new(
            BlockContext::default(),
            Config::new(Fork::Istanbul, OogPolicy::Pedantic),
        );
        open(&mut world, vec![0x60, 0x00, 0x00], ByteVec::new(), gas);
        // gas is unconstrained, so the propagation oracle cannot decide
        let mut driver = Driver::new(world, constraints, PropagationSolver::new());
        let result = driver.run().unwrap();
        assert_eq!(result.error(), Some(&ExceptionalHalt::OutOfGas));
        assert_eq!(driver.constraints.len(), 1);
    }

    #[test]
    fn test_complete_policy_forks_on_gas() {
        let mut constraints = ConstraintSet::new();
        let gas = constraints.new_bitvec(256, "gas");
        let mut world = EvmWorld::new(
            BlockContext::default(),
            Config::new(Fork::Istanbul, OogPolicy::Complete),
        );
        // PUSH1 0 PUSH1 0 SSTORE: 800 gas, and the 2300 sentry applies
        open(&mut world, vec![0x60, 0x00, 0x60, 0x00, 0x55], ByteVec::new(), gas);
        let solver = BruteSolver {
            domain: vec![10, 100000],
        };
        let driver = Driver::new(world, constraints, solver);
        let paths = driver.explore().unwrap();
        let outcomes: Vec<&str> = paths.iter().map(|path| path.result.kind.name()).collect();
        assert_eq!(outcomes, vec!["STOP", "THROW"]);

        let stopped = &paths[0];
        assert_eq!(
            driver
                .solver()
                .get_all_values(&stopped.constraints, &SymBitVec::var("gas", 256), 4)
                .unwrap(),
            vec![BigUint::from(100000u32)]
        );
        assert_eq!(paths[1].result.error(), Some(&ExceptionalHalt::OutOfGas));
    }
}
