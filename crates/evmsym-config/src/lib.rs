// SPDX-License-Identifier: AGPL-3.0

//! Engine configuration
//!
//! The fork and out-of-gas strategy are plain values handed to the world at
//! construction time. They can come from a TOML file, from command-line
//! flags, or from code.

use anyhow::{Context, Result};
use clap::Args;
use evmsym_constants::MEMORY_LIMIT;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Historical rule set. Variants are ordered, so feature checks read
/// `fork >= Fork::Byzantium`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Fork {
    Frontier,
    Homestead,
    TangerineWhistle,
    SpuriousDragon,
    Byzantium,
    Petersburg,
    Istanbul,
}

impl Fork {
    pub fn name(&self) -> &'static str {
        match self {
            Fork::Frontier => "frontier",
            Fork::Homestead => "homestead",
            Fork::TangerineWhistle => "tangerine_whistle",
            Fork::SpuriousDragon => "spurious_dragon",
            Fork::Byzantium => "byzantium",
            Fork::Petersburg => "petersburg",
            Fork::Istanbul => "istanbul",
        }
    }

    pub fn all() -> Vec<Fork> {
        vec![
            Fork::Frontier,
            Fork::Homestead,
            Fork::TangerineWhistle,
            Fork::SpuriousDragon,
            Fork::Byzantium,
            Fork::Petersburg,
            Fork::Istanbul,
        ]
    }
}

impl Default for Fork {
    fn default() -> Self {
        Fork::Istanbul
    }
}

impl std::str::FromStr for Fork {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.to_lowercase().replace(['-', ' '], "_");
        match normalized.as_str() {
            "frontier" => Ok(Fork::Frontier),
            "homestead" => Ok(Fork::Homestead),
            "tangerine_whistle" | "tangerinewhistle" | "eip150" => Ok(Fork::TangerineWhistle),
            "spurious_dragon" | "spuriousdragon" | "eip158" => Ok(Fork::SpuriousDragon),
            "byzantium" => Ok(Fork::Byzantium),
            "petersburg" | "constantinople" => Ok(Fork::Petersburg),
            "istanbul" => Ok(Fork::Istanbul),
            _ => Err(anyhow::anyhow!("Invalid fork: {}", s)),
        }
    }
}

impl std::fmt::Display for Fork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// How the engine answers "is there enough gas?" when the answer depends on
/// symbolic values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OogPolicy {
    /// Out of gas unless the solver proves it cannot happen
    #[default]
    Pedantic,
    /// Hand both answers to the driver, which may fork
    Complete,
    /// Do not meter gas
    Ignore,
}

impl OogPolicy {
    pub fn name(&self) -> &'static str {
        match self {
            OogPolicy::Pedantic => "pedantic",
            OogPolicy::Complete => "complete",
            OogPolicy::Ignore => "ignore",
        }
    }
}

impl std::str::FromStr for OogPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "pedantic" => Ok(OogPolicy::Pedantic),
            "complete" => Ok(OogPolicy::Complete),
            "ignore" => Ok(OogPolicy::Ignore),
            _ => Err(anyhow::anyhow!("Invalid out-of-gas policy: {}", s)),
        }
    }
}

impl std::fmt::Display for OogPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Which constraint oracle the driver uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SolverBackend {
    /// In-process evaluation of pinned inputs
    #[default]
    Propagation,
    /// External SMT-LIB solver process
    Smtlib,
}

impl std::str::FromStr for SolverBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "propagation" => Ok(SolverBackend::Propagation),
            "smtlib" | "smt" => Ok(SolverBackend::Smtlib),
            _ => Err(anyhow::anyhow!("Invalid solver backend: {}", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SolverConfig {
    #[serde(default)]
    pub backend: SolverBackend,

    /// External solver command; the query file path is appended
    #[serde(default = "default_solver_command")]
    pub command: Vec<String>,

    /// Per-query timeout in milliseconds (0 = none)
    #[serde(default = "default_solver_timeout")]
    pub timeout_ms: u64,

    /// Upper bound on candidate values requested per concretization
    #[serde(default = "default_max_solutions")]
    pub max_solutions: usize,

    /// Keep query files in this directory instead of a temporary one
    #[serde(default)]
    pub dump_dir: Option<PathBuf>,
}

fn default_solver_command() -> Vec<String> {
    vec!["z3".to_string(), "-smt2".to_string()]
}

fn default_solver_timeout() -> u64 {
    10_000
}

fn default_max_solutions() -> usize {
    3
}

impl SolverConfig {
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_ms > 0).then(|| Duration::from_millis(self.timeout_ms))
    }
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            backend: SolverBackend::default(),
            command: default_solver_command(),
            timeout_ms: default_solver_timeout(),
            max_solutions: default_max_solutions(),
            dump_dir: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub fork: Fork,

    #[serde(default)]
    pub oog: OogPolicy,

    #[serde(default)]
    pub solver: SolverConfig,

    /// Largest memory, in bytes, a single context may grow to; growing past
    /// it is out of gas regardless of the policy
    #[serde(default = "default_max_memory")]
    pub max_memory: u64,

    #[serde(default)]
    pub verbose: u8,
}

fn default_max_memory() -> u64 {
    MEMORY_LIMIT
}

impl Default for Config {
    fn default() -> Self {
        Self {
            fork: Fork::default(),
            oog: OogPolicy::default(),
            solver: SolverConfig::default(),
            max_memory: default_max_memory(),
            verbose: 0,
        }
    }
}

impl Config {
    pub fn new(fork: Fork, oog: OogPolicy) -> Self {
        Self {
            fork,
            oog,
            ..Self::default()
        }
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).context("Failed to parse configuration")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml_str(&text)
            .with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration")
    }

    /// Overlay command-line values that were given explicitly
    pub fn apply(&mut self, args: &ConfigArgs) {
        if let Some(fork) = args.fork {
            self.fork = fork;
        }
        if let Some(oog) = args.oog {
            self.oog = oog;
        }
        if let Some(backend) = args.solver {
            self.solver.backend = backend;
        }
        if let Some(command) = &args.solver_command {
            self.solver.command = command.split_whitespace().map(str::to_string).collect();
        }
        if let Some(timeout) = args.solver_timeout_ms {
            self.solver.timeout_ms = timeout;
        }
        if let Some(max) = args.max_solutions {
            self.solver.max_solutions = max;
        }
        if let Some(max) = args.max_memory {
            self.max_memory = max;
        }
        if args.verbose > 0 {
            self.verbose = args.verbose;
        }
    }
}

/// Command-line overrides for [`Config`]
#[derive(Debug, Clone, Default, Args)]
pub struct ConfigArgs {
    /// Path to a TOML config file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Rule set to execute under
    #[arg(long)]
    pub fork: Option<Fork>,

    /// Out-of-gas strategy: pedantic, complete or ignore
    #[arg(long)]
    pub oog: Option<OogPolicy>,

    /// Constraint oracle: propagation or smtlib
    #[arg(long)]
    pub solver: Option<SolverBackend>,

    /// External solver command line
    #[arg(long)]
    pub solver_command: Option<String>,

    /// Solver timeout in milliseconds
    #[arg(long)]
    pub solver_timeout_ms: Option<u64>,

    /// Maximum candidate values per concretization
    #[arg(long)]
    pub max_solutions: Option<usize>,

    /// Memory ceiling per context in bytes
    #[arg(long)]
    pub max_memory: Option<u64>,

    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

impl ConfigArgs {
    /// Config file (if any) with explicit flags on top
    pub fn resolve(&self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::load(path)?,
            None => Config::default(),
        };
        config.apply(self);
        Ok(config)
    }
}
