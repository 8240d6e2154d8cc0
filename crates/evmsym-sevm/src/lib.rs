// SPDX-License-Identifier: AGPL-3.0

//! Symbolic EVM
//!
//! `WorldState` holds accounts, storage, logs and the undo journal. `Vm`
//! interprets one call context. `EvmWorld` coordinates nested contexts and
//! top-level transactions and hands every value it cannot decide on to the
//! caller as a [`Concretize`] request. `Driver` answers those requests with a
//! solver.

pub mod concretize;
pub mod driver;
pub mod gas;
pub mod journal;
pub mod opcodes;
pub mod storage;
pub mod transaction;
pub mod vm;
pub mod world;
mod worklist;

pub use concretize::{Check, Concretize, Policy, ResumeTarget};
pub use driver::{Driver, DriverError, DriverResult, PathResult};
pub use gas::GasSchedule;
pub use journal::Checkpoint;
pub use storage::Storage;
pub use transaction::{EvmWorld, RunState, Transaction, TxRequest, TxResult};
pub use vm::{CallKind, Message, Outcome, Step, Vm};
pub use world::{Account, Address, BlockContext, LogEntry, WorldState};
pub use worklist::Worklist;
