// SPDX-License-Identifier: AGPL-3.0

//! External SMT-LIB solver process

use evmsym_bitvec::{keccak_fun_name, Decls, SymBitVec, SymBool};
use num_bigint::BigUint;
use num_traits::Num;
use once_cell::sync::Lazy;
use regex::Regex;
use std::cell::Cell;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;
use tracing::debug;
use wait_timeout::ChildExt;

use crate::{ConstraintSet, Solver, SolverError, SolverResult};

/// Name of the helper constant bound to the queried expression
const QUERY_SYMBOL: &str = "__query";

/// SMT query result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SatResult {
    Sat,
    Unsat,
    Unknown,
}

impl std::fmt::Display for SatResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SatResult::Sat => write!(f, "sat"),
            SatResult::Unsat => write!(f, "unsat"),
            SatResult::Unknown => write!(f, "unknown"),
        }
    }
}

/// Parsed solver output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SolverOutput {
    pub result: SatResult,
    pub value: Option<BigUint>,
}

impl SolverOutput {
    pub fn from_stdout(stdout: &str) -> SolverResult<Self> {
        let first_line = stdout.lines().next().unwrap_or("").trim();
        let result = match first_line {
            "sat" => SatResult::Sat,
            "unsat" => SatResult::Unsat,
            "unknown" | "timeout" => SatResult::Unknown,
            other => return Err(SolverError::Parse(format!("unexpected solver output: {}", other))),
        };
        let value = if result == SatResult::Sat {
            parse_query_value(stdout)?
        } else {
            None
        };
        Ok(Self { result, value })
    }
}

/// Parse constant value from SMT output
pub fn parse_const_value(value: &str) -> SolverResult<BigUint> {
    let parse = |digits: &str, radix: u32| {
        BigUint::from_str_radix(digits, radix)
            .map_err(|e| SolverError::Parse(format!("bad constant {}: {}", value, e)))
    };
    if let Some(bits) = value.strip_prefix("#b") {
        parse(bits, 2)
    } else if let Some(hex) = value.strip_prefix("#x") {
        parse(hex, 16)
    } else if let Some(token) = value.split_whitespace().find(|t| t.starts_with("bv")) {
        parse(&token[2..], 10)
    } else {
        Err(SolverError::Parse(format!("Unknown value format: {}", value)))
    }
}

static QUERY_VALUE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?x)
        \(\s*\|?__query\|?\s+            # the bound query symbol
        (
            \#b[01]+                     # Binary
            |\#x[0-9a-fA-F]+             # Hex
            |\(_\s+bv\d+\s+\d+\)         # Decimal
        )
        ",
    )
    .unwrap_or_else(|e| panic!("invalid query value pattern: {}", e))
});

fn parse_query_value(stdout: &str) -> SolverResult<Option<BigUint>> {
    match QUERY_VALUE.captures(stdout) {
        Some(captures) => parse_const_value(&captures[1]).map(Some),
        None => Ok(None),
    }
}

/// Render constraints (plus optional extra assertions) as an SMT-LIB2 script.
///
/// When `query` is given, it is bound to `__query` and its value requested.
pub fn render_query(
    constraints: &ConstraintSet,
    extra: &[SymBool],
    query: Option<&SymBitVec>,
) -> String {
    let mut decls: Decls = constraints.decls();
    for assertion in extra {
        assertion.collect_decls(&mut decls);
    }
    if let Some(query) = query {
        query.collect_decls(&mut decls);
    }

    let mut out = String::from("(set-option :produce-models true)\n(set-logic QF_UFBV)\n");
    for (name, size) in &decls.vars {
        out.push_str(&format!("(declare-fun |{}| () (_ BitVec {}))\n", name, size));
    }
    for width in &decls.keccak_widths {
        out.push_str(&format!(
            "(declare-fun {} ((_ BitVec {})) (_ BitVec 256))\n",
            keccak_fun_name(*width),
            width
        ));
    }
    for assertion in constraints.constraints().iter().chain(extra) {
        out.push_str("(assert ");
        out.push_str(&assertion.to_term().to_smt());
        out.push_str(")\n");
    }
    if let Some(query) = query {
        out.push_str(&format!(
            "(declare-fun |{}| () (_ BitVec {}))\n(assert (= |{}| {}))\n",
            QUERY_SYMBOL,
            query.size(),
            QUERY_SYMBOL,
            query.to_term().to_smt()
        ));
    }
    out.push_str("(check-sat)\n");
    if query.is_some() {
        out.push_str(&format!("(get-value (|{}|))\n", QUERY_SYMBOL));
    }
    out
}

/// Runs an external solver binary on query files
#[derive(Debug)]
pub struct SmtLibSolver {
    command: Vec<String>,
    timeout: Option<Duration>,
    dump_dir: Option<PathBuf>,
    query_id: Cell<usize>,
}

impl SmtLibSolver {
    pub fn new(command: Vec<String>, timeout: Option<Duration>) -> Self {
        Self {
            command,
            timeout,
            dump_dir: None,
            query_id: Cell::new(0),
        }
    }

    /// Keep every query file under `dir`
    pub fn with_dump_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dump_dir = Some(dir.into());
        self
    }

    fn run(&self, script: &str) -> SolverResult<SolverOutput> {
        let id = self.query_id.get();
        self.query_id.set(id + 1);

        match &self.dump_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                let path = dir.join(format!("query-{}.smt2", id));
                std::fs::write(&path, script)?;
                self.solve_file(&path)
            }
            None => {
                let mut file = tempfile::Builder::new()
                    .prefix("evmsym-")
                    .suffix(".smt2")
                    .tempfile()?;
                file.write_all(script.as_bytes())?;
                file.flush()?;
                self.solve_file(file.path())
            }
        }
    }

    /// Solve SMT query file with external solver
    pub fn solve_file(&self, query_file: &Path) -> SolverResult<SolverOutput> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| SolverError::Process("empty solver command".to_string()))?;
        debug!("running {} on {}", program, query_file.display());

        let mut cmd = Command::new(program);
        cmd.args(args)
            .arg(query_file)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let output = match self.timeout {
            Some(timeout) => {
                let mut child = cmd.spawn()?;
                match child.wait_timeout(timeout)? {
                    Some(_) => child.wait_with_output()?,
                    None => {
                        let _ = child.kill();
                        let _ = child.wait();
                        return Err(SolverError::Timeout);
                    }
                }
            }
            None => cmd.output()?,
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        if stdout.trim().is_empty() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SolverError::Process(format!(
                "solver exited with {:?}: {}",
                output.status.code(),
                stderr.trim()
            )));
        }
        SolverOutput::from_stdout(&stdout)
    }
}

impl Solver for SmtLibSolver {
    fn check(&self, constraints: &ConstraintSet) -> SolverResult<bool> {
        if constraints.is_trivially_unsat() {
            return Ok(false);
        }
        match self.run(&render_query(constraints, &[], None))?.result {
            SatResult::Sat => Ok(true),
            SatResult::Unsat => Ok(false),
            SatResult::Unknown => Err(SolverError::Unknown("check".to_string())),
        }
    }

    fn get_all_values(
        &self,
        constraints: &ConstraintSet,
        expression: &SymBitVec,
        max: usize,
    ) -> SolverResult<Vec<BigUint>> {
        let mut values = Vec::new();
        let mut blocking = Vec::new();
        while values.len() < max {
            let output = self.run(&render_query(constraints, &blocking, Some(expression)))?;
            match output.result {
                SatResult::Unsat => break,
                SatResult::Unknown => {
                    return Err(SolverError::Unknown(format!("value of {}", expression)))
                }
                SatResult::Sat => {
                    let value = output
                        .value
                        .ok_or_else(|| SolverError::Parse("missing get-value result".to_string()))?;
                    blocking.push(
                        expression.not_equals(&SymBitVec::from_biguint(value.clone(), expression.size())),
                    );
                    values.push(value);
                }
            }
        }
        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_const_value() {
        assert_eq!(parse_const_value("#b1010").unwrap(), BigUint::from(10u8));
        assert_eq!(parse_const_value("#xFF").unwrap(), BigUint::from(255u8));
        assert_eq!(parse_const_value("(_ bv123 256)").unwrap(), BigUint::from(123u8));
        assert!(parse_const_value("42").is_err());
    }

    #[test]
    fn test_sat_result_display() {
        assert_eq!(SatResult::Sat.to_string(), "sat");
        assert_eq!(SatResult::Unsat.to_string(), "unsat");
        assert_eq!(SatResult::Unknown.to_string(), "unknown");
    }

    #[test]
    fn test_output_with_value() {
        let output = SolverOutput::from_stdout("sat\n((|__query| #x002a))\n").unwrap();
        assert_eq!(output.result, SatResult::Sat);
        assert_eq!(output.value, Some(BigUint::from(42u8)));

        let output = SolverOutput::from_stdout("unsat\n(error \"model is not available\")").unwrap();
        assert_eq!(output.result, SatResult::Unsat);
        assert_eq!(output.value, None);

        assert!(SolverOutput::from_stdout("(error \"line 1\")").is_err());
    }

    #[test]
    fn test_render_query() {
        let mut cs = ConstraintSet::new();
        let x = cs.new_bitvec(8, "x");
        cs.add(x.ult(&SymBitVec::from_u64(3, 8)));
        let hashed = x.zero_ext(248).keccak();
        let script = render_query(&cs, &[], Some(&hashed));
        assert!(script.contains("(declare-fun |x| () (_ BitVec 8))"));
        assert!(script.contains("(declare-fun keccak_256 ((_ BitVec 256)) (_ BitVec 256))"));
        assert!(script.contains("(assert (bvult |x| (_ bv3 8)))"));
        assert!(script.contains("(get-value (|__query|))"));
    }

    #[test]
    fn test_missing_solver_binary_is_an_error() {
        let solver = SmtLibSolver::new(
            vec!["evmsym-no-such-solver-binary".to_string()],
            Some(Duration::from_millis(100)),
        );
        let cs = ConstraintSet::new();
        assert!(matches!(solver.check(&cs), Err(SolverError::Io(_))));
    }
}
