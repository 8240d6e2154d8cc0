// SPDX-License-Identifier: AGPL-3.0

//! Bytecode interpreter for one execution context
//!
//! Every instruction follows the same shape: resolve the operands that must
//! be concrete, answer the yes/no questions it depends on, charge gas, and
//! only then mutate anything. Any of the first three steps may suspend, so a
//! suspended instruction can simply be executed again after the driver has
//! supplied a value.

use evmsym_bitvec::{SymBitVec, SymBool};
use evmsym_bytevec::{ByteVec, SymByte};
use evmsym_config::{Fork, OogPolicy};
use evmsym_constants::{CALL_STIPEND, MEMORY_LIMIT, STACK_LIMIT, WORD_BITS, WORD_SIZE};
use evmsym_exceptions::{ExceptionalHalt, SevmError, SevmResult};
use evmsym_hashes::{contract_address, create2_address};
use evmsym_logs::{warn_code, ErrorCode};
use num_bigint::BigUint;
use num_traits::{ToPrimitive, Zero};
use tracing::{debug, trace};

use crate::concretize::{Check, Concretize, Policy, ResumeTarget, Verdicts};
use crate::gas::{self, GasSchedule, G_COPY, G_LOG_DATA, G_SHA3_WORD, G_SSTORE_SENTRY};
use crate::opcodes::{self, *};
use crate::world::{Address, LogEntry, WorldState};

/// The calling convention that opened a context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallKind {
    Call,
    CallCode,
    DelegateCall,
    StaticCall,
    Create,
    Create2,
}

impl CallKind {
    pub fn is_create(&self) -> bool {
        matches!(self, CallKind::Create | CallKind::Create2)
    }

    pub fn name(&self) -> &'static str {
        match self {
            CallKind::Call => "CALL",
            CallKind::CallCode => "CALLCODE",
            CallKind::DelegateCall => "DELEGATECALL",
            CallKind::StaticCall => "STATICCALL",
            CallKind::Create => "CREATE",
            CallKind::Create2 => "CREATE2",
        }
    }
}

/// Terminal outcome of a context
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Stop,
    Return(ByteVec),
    Revert(ByteVec),
    SelfDestruct,
    Throw(ExceptionalHalt),
}

impl Outcome {
    pub fn name(&self) -> &'static str {
        match self {
            Outcome::Stop => "STOP",
            Outcome::Return(_) => "RETURN",
            Outcome::Revert(_) => "REVERT",
            Outcome::SelfDestruct => "SELFDESTRUCT",
            Outcome::Throw(_) => "THROW",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(
            self,
            Outcome::Stop | Outcome::Return(_) | Outcome::SelfDestruct
        )
    }

    pub fn output(&self) -> ByteVec {
        match self {
            Outcome::Return(data) | Outcome::Revert(data) => data.clone(),
            _ => ByteVec::new(),
        }
    }
}

/// Everything a context knows about how it was invoked
#[derive(Debug, Clone)]
pub struct Message {
    pub caller: Address,
    pub address: Address,
    pub origin: Address,
    pub value: SymBitVec,
    pub data: ByteVec,
    pub gas_price: SymBitVec,
    pub is_static: bool,
    pub depth: usize,
}

/// A nested context the interpreter wants opened
#[derive(Debug, Clone)]
pub struct CallRequest {
    pub kind: CallKind,
    /// Account whose balance pays `value`
    pub sender: Address,
    /// CALLER inside the child
    pub caller: Address,
    /// Storage and balance context of the child
    pub address: Address,
    pub code_address: Address,
    /// CALLVALUE inside the child
    pub value: SymBitVec,
    /// Whether `value` moves from `sender` to `address`
    pub transfers: bool,
    pub data: ByteVec,
    pub code: Vec<u8>,
    pub gas: SymBitVec,
    pub is_static: bool,
    /// Why the call cannot start, when the interpreter already knows
    pub refused: Option<ExceptionalHalt>,
}

/// What the parent learns when a child context ends
#[derive(Debug, Clone)]
pub struct ChildResult {
    pub success: bool,
    pub output: ByteVec,
    pub gas_left: SymBitVec,
    pub created: Option<Address>,
}

#[derive(Debug, Clone)]
pub enum Step {
    Continue,
    Halt(Outcome),
    Call(CallRequest),
    Suspend(Concretize),
}

#[derive(Debug, Clone, Copy)]
struct PendingCall {
    is_create: bool,
    ret_offset: usize,
    ret_size: usize,
}

enum Interrupt {
    Halt(ExceptionalHalt),
    Suspend(Concretize),
}

impl From<ExceptionalHalt> for Interrupt {
    fn from(halt: ExceptionalHalt) -> Self {
        Interrupt::Halt(halt)
    }
}

type Exec<T> = Result<T, Interrupt>;

/// A concrete `[offset, offset + size)` memory region
type Region = (usize, usize);

#[derive(Debug, Clone)]
pub struct Vm {
    pub message: Message,
    pub code: Vec<u8>,
    pub pc: usize,
    pub stack: Vec<SymBitVec>,
    pub memory: ByteVec,
    pub gas: SymBitVec,
    pub return_data: ByteVec,
    jumpdests: Vec<bool>,
    schedule: GasSchedule,
    oog: OogPolicy,
    /// Memory never grows past this many bytes
    memory_limit: u64,
    verdicts: Verdicts,
    pending_call: Option<PendingCall>,
}

impl Vm {
    pub fn new(message: Message, code: Vec<u8>, gas: SymBitVec, fork: Fork, oog: OogPolicy) -> Self {
        let jumpdests = opcodes::jump_destinations(&code);
        Self {
            message,
            code,
            pc: 0,
            stack: Vec::new(),
            memory: ByteVec::new(),
            gas,
            return_data: ByteVec::new(),
            jumpdests,
            schedule: GasSchedule::for_fork(fork),
            oog,
            memory_limit: MEMORY_LIMIT,
            verdicts: Verdicts::default(),
            pending_call: None,
        }
    }

    pub fn with_memory_limit(mut self, limit: u64) -> Self {
        self.memory_limit = limit;
        self
    }

    pub fn address(&self) -> Address {
        self.message.address
    }

    pub fn fork(&self) -> Fork {
        self.schedule.fork
    }

    /// Execute one instruction
    pub fn step(&mut self, world: &mut WorldState) -> Step {
        match self.execute(world) {
            Ok(step) => {
                self.verdicts.clear();
                step
            }
            Err(Interrupt::Halt(halt)) => {
                debug!(pc = self.pc, %halt, "exceptional halt");
                self.verdicts.clear();
                Step::Halt(Outcome::Throw(halt))
            }
            Err(Interrupt::Suspend(request)) => {
                debug!(pc = self.pc, %request, "suspending");
                Step::Suspend(request)
            }
        }
    }

    /// Feed back a value chosen for a suspension raised by this interpreter
    pub fn resume(&mut self, target: ResumeTarget, value: &BigUint) -> SevmResult<()> {
        match target {
            ResumeTarget::StackSlot(depth) => {
                if value.bits() > u64::from(WORD_BITS) {
                    return Err(SevmError::ValueOutOfRange(value.to_string()));
                }
                let len = self.stack.len();
                let slot = len
                    .checked_sub(depth + 1)
                    .and_then(|index| self.stack.get_mut(index))
                    .ok_or_else(|| SevmError::StaleResume(format!("no stack slot {}", depth)))?;
                *slot = SymBitVec::from_biguint(value.clone(), WORD_BITS);
                Ok(())
            }
            ResumeTarget::Verdict(check) => {
                self.verdicts.set(check, !value.is_zero());
                Ok(())
            }
            other => Err(SevmError::StaleResume(format!("{:?}", other))),
        }
    }

    /// Write back the outcome of the context opened by the last `Step::Call`
    pub fn finish_call(&mut self, result: ChildResult) {
        if self.oog != OogPolicy::Ignore {
            self.gas = self.gas.add(&result.gas_left);
        }
        let pending = self.pending_call.take();
        match pending {
            Some(call) if call.is_create => {
                let pushed = match (result.success, result.created) {
                    (true, Some(address)) => address.to_word(),
                    _ => SymBitVec::zero(WORD_BITS),
                };
                self.stack.push(pushed);
                self.return_data = if result.success {
                    ByteVec::new()
                } else {
                    result.output
                };
            }
            Some(call) => {
                self.stack
                    .push(SymBitVec::word(u64::from(result.success)));
                let copied = call.ret_size.min(result.output.len());
                self.memory
                    .write(call.ret_offset, &result.output.slice(0, copied));
                self.return_data = result.output;
            }
            None => {}
        }
        self.pc += 1;
    }

    fn execute(&mut self, world: &mut WorldState) -> Exec<Step> {
        let Some(&op) = self.code.get(self.pc) else {
            return Ok(Step::Halt(Outcome::Stop));
        };
        if !opcodes::is_valid(op, self.fork()) {
            return Err(ExceptionalHalt::InvalidOpcode(op).into());
        }
        let (pops, pushes) = opcodes::stack_io(op);
        if self.stack.len() < pops {
            return Err(ExceptionalHalt::StackUnderflow.into());
        }
        if self.stack.len() - pops + pushes > STACK_LIMIT {
            return Err(ExceptionalHalt::StackOverflow.into());
        }
        trace!(
            pc = self.pc,
            op = %opcodes::name(op),
            stack = self.stack.len(),
            gas = %self.gas,
            "step"
        );

        match op {
            OP_STOP => {
                self.charge_static(op, 0)?;
                Ok(Step::Halt(Outcome::Stop))
            }

            OP_ADD => self.binary(op, SymBitVec::add),
            OP_MUL => self.binary(op, SymBitVec::mul),
            OP_SUB => self.binary(op, SymBitVec::sub),
            OP_DIV => self.binary(op, SymBitVec::udiv),
            OP_SDIV => self.binary(op, SymBitVec::sdiv),
            OP_MOD => self.binary(op, SymBitVec::urem),
            OP_SMOD => self.binary(op, SymBitVec::srem),
            OP_ADDMOD => self.ternary(op, SymBitVec::addmod),
            OP_MULMOD => self.ternary(op, SymBitVec::mulmod),

            OP_EXP => {
                let exponent = self.concrete(1, Policy::One, "EXP exponent")?;
                let exponent_bytes = exponent.bits().div_ceil(8);
                self.charge_static(op, self.schedule.exp_cost(exponent_bytes) - gas::G_EXP)?;
                let base = self.pop()?;
                self.pop()?;
                self.push(base.exp(&exponent));
                self.next()
            }

            OP_SIGNEXTEND => {
                let index = self.concrete(0, Policy::One, "SIGNEXTEND index")?;
                self.charge_static(op, 0)?;
                self.pop()?;
                let value = self.pop()?;
                self.push(value.signextend(index.to_u64().unwrap_or(u64::MAX).min(32)));
                self.next()
            }

            OP_LT => self.compare(op, SymBitVec::ult),
            OP_GT => self.compare(op, SymBitVec::ugt),
            OP_SLT => self.compare(op, SymBitVec::slt),
            OP_SGT => self.compare(op, SymBitVec::sgt),
            OP_EQ => self.compare(op, SymBitVec::equals),
            OP_ISZERO => self.unary(op, |a| a.is_zero().to_bitvec(WORD_BITS)),
            OP_AND => self.binary(op, SymBitVec::bitwise_and),
            OP_OR => self.binary(op, SymBitVec::bitwise_or),
            OP_XOR => self.binary(op, SymBitVec::bitwise_xor),
            OP_NOT => self.unary(op, SymBitVec::bitwise_not),
            OP_BYTE => self.binary(op, |index, value| value.byte(index)),
            OP_SHL => self.binary(op, |shift, value| value.shl(shift)),
            OP_SHR => self.binary(op, |shift, value| value.lshr(shift)),
            OP_SAR => self.binary(op, |shift, value| value.ashr(shift)),

            OP_SHA3 => {
                let region = self.memory_region(0, 1)?;
                let extra = G_SHA3_WORD * gas::words(region.1 as u64) + self.expansion_cost(&[region]);
                self.charge_static(op, extra)?;
                self.expand_memory(&[region]);
                self.pop_n(2)?;
                let hash = self.memory.slice(region.0, region.1).keccak();
                self.push(hash);
                self.next()
            }

            OP_ADDRESS => self.push_value(op, self.message.address.to_word()),
            OP_BALANCE => {
                let account = self.concrete_address(0, "BALANCE account")?;
                self.charge_static(op, 0)?;
                self.pop()?;
                self.push(world.get_balance(&account));
                self.next()
            }
            OP_ORIGIN => self.push_value(op, self.message.origin.to_word()),
            OP_CALLER => self.push_value(op, self.message.caller.to_word()),
            OP_CALLVALUE => self.push_value(op, self.message.value.clone()),

            OP_CALLDATALOAD => {
                let offset = self.concrete(0, Policy::One, "CALLDATALOAD offset")?;
                self.charge_static(op, 0)?;
                self.pop()?;
                let word = match offset.to_usize() {
                    Some(offset) => self.message.data.read_word(offset),
                    None => SymBitVec::zero(WORD_BITS),
                };
                self.push(word);
                self.next()
            }
            OP_CALLDATASIZE => {
                self.push_value(op, SymBitVec::word(self.message.data.len() as u64))
            }
            OP_CALLDATACOPY => {
                let source = self.message.data.clone();
                self.copy_to_memory(op, 0, &source, 0)
            }
            OP_CODESIZE => self.push_value(op, SymBitVec::word(self.code.len() as u64)),
            OP_CODECOPY => {
                let source = ByteVec::from_bytes(&self.code);
                self.copy_to_memory(op, 0, &source, 0)
            }
            OP_GASPRICE => self.push_value(op, self.message.gas_price.clone()),
            OP_EXTCODESIZE => {
                let account = self.concrete_address(0, "EXTCODESIZE account")?;
                self.charge_static(op, 0)?;
                self.pop()?;
                self.push(SymBitVec::word(world.get_code(&account).len() as u64));
                self.next()
            }
            OP_EXTCODECOPY => {
                let account = self.concrete_address(0, "EXTCODECOPY account")?;
                let source = ByteVec::from_bytes(world.get_code(&account));
                self.copy_to_memory(op, 1, &source, 1)
            }
            OP_RETURNDATASIZE => {
                self.push_value(op, SymBitVec::word(self.return_data.len() as u64))
            }
            OP_RETURNDATACOPY => {
                let source = self.return_data.clone();
                self.copy_to_memory(op, 0, &source, 0)
            }
            OP_EXTCODEHASH => {
                let account = self.concrete_address(0, "EXTCODEHASH account")?;
                self.charge_static(op, 0)?;
                self.pop()?;
                self.push(world.get_code_hash(&account));
                self.next()
            }

            OP_BLOCKHASH => self.unary(op, |number| world.block_hash(number)),
            OP_COINBASE => self.push_value(op, world.block_coinbase().clone()),
            OP_TIMESTAMP => self.push_value(op, world.block_timestamp().clone()),
            OP_NUMBER => self.push_value(op, world.block_number().clone()),
            OP_DIFFICULTY => self.push_value(op, world.block_difficulty().clone()),
            OP_GASLIMIT => self.push_value(op, world.block_gaslimit().clone()),
            OP_CHAINID => self.push_value(op, world.chain_id().clone()),
            OP_SELFBALANCE => self.push_value(op, world.get_balance(&self.message.address)),

            OP_POP => {
                self.charge_static(op, 0)?;
                self.pop()?;
                self.next()
            }
            OP_MLOAD => {
                let region = self.word_region(0, "MLOAD offset")?;
                self.charge_static(op, self.expansion_cost(&[region]))?;
                self.expand_memory(&[region]);
                self.pop()?;
                let word = self.memory.read_word(region.0);
                self.push(word);
                self.next()
            }
            OP_MSTORE => {
                let region = self.word_region(0, "MSTORE offset")?;
                self.charge_static(op, self.expansion_cost(&[region]))?;
                self.expand_memory(&[region]);
                self.pop()?;
                let value = self.pop()?;
                self.memory.write_word(region.0, &value);
                self.next()
            }
            OP_MSTORE8 => {
                let offset = self.memory_offset(0, "MSTORE8 offset")?;
                let region = (offset, 1);
                self.charge_static(op, self.expansion_cost(&[region]))?;
                self.expand_memory(&[region]);
                self.pop()?;
                let value = self.pop()?;
                self.memory
                    .set_byte(offset, SymByte::from_bitvec(&value.extract(7, 0)));
                self.next()
            }
            OP_SLOAD => {
                self.charge_static(op, 0)?;
                let key = self.pop()?;
                self.push(world.get_storage_data(&self.message.address, &key));
                self.next()
            }
            OP_SSTORE => self.sstore(world),

            OP_JUMP => {
                let dest = self.jump_target(0)?;
                self.charge_static(op, 0)?;
                self.pop()?;
                self.pc = dest;
                Ok(Step::Continue)
            }
            OP_JUMPI => {
                let condition = self.peek(1)?;
                let taken = self.decide(
                    Check::Branch,
                    &condition.is_zero().negate(),
                    Policy::All,
                    "JUMPI condition",
                )?;
                let dest = if taken { Some(self.jump_target(0)?) } else { None };
                self.charge_static(op, 0)?;
                self.pop_n(2)?;
                match dest {
                    Some(dest) => {
                        self.pc = dest;
                        Ok(Step::Continue)
                    }
                    None => self.next(),
                }
            }
            OP_PC => self.push_value(op, SymBitVec::word(self.pc as u64)),
            OP_MSIZE => self.push_value(op, SymBitVec::word(self.memory.len() as u64)),
            OP_GAS => {
                self.charge_static(op, 0)?;
                self.push(self.gas.clone());
                self.next()
            }
            OP_JUMPDEST => {
                self.charge_static(op, 0)?;
                self.next()
            }

            OP_PUSH1..=OP_PUSH32 => {
                self.charge_static(op, 0)?;
                let size = opcodes::immediate_size(op);
                let start = (self.pc + 1).min(self.code.len());
                let end = (self.pc + 1 + size).min(self.code.len());
                let mut bytes = self.code[start..end].to_vec();
                bytes.resize(size, 0);
                self.push(SymBitVec::from_bytes_be(&bytes, WORD_BITS));
                self.pc += 1 + size;
                Ok(Step::Continue)
            }
            OP_DUP1..=OP_DUP16 => {
                let depth = (op - OP_DUP1) as usize;
                self.charge_static(op, 0)?;
                let value = self.peek(depth)?;
                self.push(value);
                self.next()
            }
            OP_SWAP1..=OP_SWAP16 => {
                let depth = (op - OP_SWAP1 + 1) as usize;
                self.charge_static(op, 0)?;
                let top = self.stack.len() - 1;
                self.stack.swap(top, top - depth);
                self.next()
            }

            OP_LOG0..=OP_LOG4 => self.log(op, world),

            OP_CREATE | OP_CREATE2 => self.create(op, world),
            OP_CALL | OP_CALLCODE | OP_DELEGATECALL | OP_STATICCALL => self.call(op, world),

            OP_RETURN | OP_REVERT => {
                let region = self.memory_region(0, 1)?;
                self.charge_static(op, self.expansion_cost(&[region]))?;
                self.expand_memory(&[region]);
                self.pop_n(2)?;
                let output = self.memory.slice(region.0, region.1);
                if op == OP_RETURN {
                    Ok(Step::Halt(Outcome::Return(output)))
                } else {
                    Ok(Step::Halt(Outcome::Revert(output)))
                }
            }

            OP_SELFDESTRUCT => self.selfdestruct(world),

            _ => Err(ExceptionalHalt::InvalidOpcode(op).into()),
        }
    }

    // ---------------------------------------------------------------------
    // stack helpers

    fn peek(&self, depth: usize) -> Exec<SymBitVec> {
        self.stack
            .len()
            .checked_sub(depth + 1)
            .and_then(|index| self.stack.get(index))
            .cloned()
            .ok_or(Interrupt::Halt(ExceptionalHalt::StackUnderflow))
    }

    fn pop(&mut self) -> Exec<SymBitVec> {
        self.stack
            .pop()
            .ok_or(Interrupt::Halt(ExceptionalHalt::StackUnderflow))
    }

    fn pop_n(&mut self, n: usize) -> Exec<Vec<SymBitVec>> {
        (0..n).map(|_| self.pop()).collect()
    }

    fn push(&mut self, value: SymBitVec) {
        self.stack.push(value);
    }

    fn next(&mut self) -> Exec<Step> {
        self.pc += 1;
        Ok(Step::Continue)
    }

    fn push_value(&mut self, op: u8, value: SymBitVec) -> Exec<Step> {
        self.charge_static(op, 0)?;
        self.push(value);
        self.next()
    }

    fn unary(&mut self, op: u8, f: impl Fn(&SymBitVec) -> SymBitVec) -> Exec<Step> {
        self.charge_static(op, 0)?;
        let a = self.pop()?;
        self.push(f(&a));
        self.next()
    }

    fn binary(&mut self, op: u8, f: impl Fn(&SymBitVec, &SymBitVec) -> SymBitVec) -> Exec<Step> {
        self.charge_static(op, 0)?;
        let a = self.pop()?;
        let b = self.pop()?;
        self.push(f(&a, &b));
        self.next()
    }

    fn ternary(
        &mut self,
        op: u8,
        f: impl Fn(&SymBitVec, &SymBitVec, &SymBitVec) -> SymBitVec,
    ) -> Exec<Step> {
        self.charge_static(op, 0)?;
        let a = self.pop()?;
        let b = self.pop()?;
        let c = self.pop()?;
        self.push(f(&a, &b, &c));
        self.next()
    }

    fn compare(&mut self, op: u8, f: impl Fn(&SymBitVec, &SymBitVec) -> SymBool) -> Exec<Step> {
        self.binary(op, |a, b| f(a, b).to_bitvec(WORD_BITS))
    }

    // ---------------------------------------------------------------------
    // concretization

    /// The stack item at `depth`, suspending when it is symbolic
    fn concrete(&self, depth: usize, policy: Policy, reason: &'static str) -> Exec<BigUint> {
        let value = self.peek(depth)?;
        match value.as_biguint() {
            Some(v) => Ok(v.clone()),
            None => Err(Interrupt::Suspend(Concretize::new(
                value,
                policy,
                ResumeTarget::StackSlot(depth),
                reason,
            ))),
        }
    }

    fn concrete_address(&self, depth: usize, reason: &'static str) -> Exec<Address> {
        let value = self.concrete(depth, Policy::All, reason)?;
        Ok(Address::from_biguint(&value))
    }

    /// Answer a yes/no question, suspending when the answer is not yet known
    fn decide(
        &self,
        check: Check,
        condition: &SymBool,
        policy: Policy,
        reason: &'static str,
    ) -> Exec<bool> {
        if let Some(answer) = condition.as_bool() {
            return Ok(answer);
        }
        if let Some(answer) = self.verdicts.get(check) {
            return Ok(answer);
        }
        Err(Interrupt::Suspend(Concretize::new(
            condition.to_bitvec(1),
            policy,
            ResumeTarget::Verdict(check),
            reason,
        )))
    }

    fn jump_target(&self, depth: usize) -> Exec<usize> {
        let dest = self.concrete(depth, Policy::All, "jump destination")?;
        match dest.to_usize() {
            Some(pc) if self.jumpdests.get(pc).copied().unwrap_or(false) => Ok(pc),
            Some(pc) => Err(ExceptionalHalt::InvalidJumpDest(pc).into()),
            None => Err(ExceptionalHalt::InvalidJumpDest(usize::MAX).into()),
        }
    }

    // ---------------------------------------------------------------------
    // gas

    fn charge_static(&mut self, op: u8, extra: u64) -> Exec<()> {
        let fee = SymBitVec::word(self.schedule.static_cost(op).saturating_add(extra));
        self.charge(&fee)
    }

    fn charge(&mut self, fee: &SymBitVec) -> Exec<()> {
        let fault = self.gas.ult(fee);
        self.charge_unless(fee, &fault)
    }

    /// Deduct `fee`, throwing out-of-gas when `fault` holds
    fn charge_unless(&mut self, fee: &SymBitVec, fault: &SymBool) -> Exec<()> {
        if self.oog == OogPolicy::Ignore {
            return Ok(());
        }
        let policy = match self.oog {
            OogPolicy::Complete => Policy::All,
            _ => Policy::Pessimistic,
        };
        if self.decide(Check::OutOfGas, fault, policy, "gas feasibility")? {
            return Err(ExceptionalHalt::OutOfGas.into());
        }
        self.gas = self.gas.sub(fee);
        Ok(())
    }

    // ---------------------------------------------------------------------
    // memory

    /// A concrete memory offset, out of gas when it cannot be allocated
    fn memory_offset(&self, depth: usize, reason: &'static str) -> Exec<usize> {
        let offset = self.concrete(depth, Policy::One, reason)?;
        self.bounded(&offset, 0)
    }

    fn word_region(&self, depth: usize, reason: &'static str) -> Exec<Region> {
        let offset = self.concrete(depth, Policy::One, reason)?;
        Ok((self.bounded(&offset, WORD_SIZE as u64)?, WORD_SIZE))
    }

    /// Offset and size taken from the stack; the offset is irrelevant when
    /// the size is zero and stays unresolved
    fn memory_region(&self, offset_depth: usize, size_depth: usize) -> Exec<Region> {
        let size = self.concrete(size_depth, Policy::One, "memory size")?;
        if size.is_zero() {
            return Ok((0, 0));
        }
        let size = self.bounded(&size, 0)?;
        let offset = self.concrete(offset_depth, Policy::One, "memory offset")?;
        Ok((self.bounded(&offset, size as u64)?, size))
    }

    /// Memory position that stays within the limit once `extra` bytes are
    /// added. Checked before any gas question, so it holds under every policy.
    fn bounded(&self, value: &BigUint, extra: u64) -> Exec<usize> {
        value
            .to_u64()
            .and_then(|v| v.checked_add(extra))
            .filter(|end| *end <= self.memory_limit)
            .and_then(|_| value.to_usize())
            .ok_or(Interrupt::Halt(ExceptionalHalt::OutOfGas))
    }

    fn expansion_cost(&self, regions: &[Region]) -> u64 {
        let end = regions
            .iter()
            .filter(|(_, size)| *size > 0)
            .map(|(offset, size)| (offset + size) as u64)
            .max()
            .unwrap_or(0);
        gas::memory_expansion_cost(self.memory.len(), 0, end)
    }

    fn expand_memory(&mut self, regions: &[Region]) {
        for &(offset, size) in regions {
            if size > 0 {
                let words = gas::words((offset + size) as u64) as usize;
                self.memory.ensure_len(words * WORD_SIZE);
            }
        }
    }

    /// CALLDATACOPY, CODECOPY, EXTCODECOPY and RETURNDATACOPY.
    ///
    /// `base` is the stack depth of the memory offset; the source offset and
    /// size follow it.
    fn copy_to_memory(
        &mut self,
        op: u8,
        base: usize,
        source: &ByteVec,
        extra_pops: usize,
    ) -> Exec<Step> {
        let region = self.memory_region(base, base + 2)?;
        let source_offset = if region.1 == 0 && op != OP_RETURNDATACOPY {
            0
        } else {
            self.concrete(base + 1, Policy::One, "copy source offset")?
                .to_usize()
                .unwrap_or(usize::MAX)
        };
        if op == OP_RETURNDATACOPY
            && source_offset
                .checked_add(region.1)
                .map_or(true, |end| end > source.len())
        {
            return Err(ExceptionalHalt::ReturnDataOutOfBounds.into());
        }
        let extra = G_COPY * gas::words(region.1 as u64) + self.expansion_cost(&[region]);
        self.charge_static(op, extra)?;
        self.expand_memory(&[region]);
        self.pop_n(3 + extra_pops)?;
        self.memory
            .write(region.0, &source.slice(source_offset, region.1));
        self.next()
    }

    // ---------------------------------------------------------------------
    // storage and logs

    fn sstore(&mut self, world: &mut WorldState) -> Exec<Step> {
        if self.message.is_static {
            return Err(ExceptionalHalt::WriteInStaticContext.into());
        }
        let key = self.peek(0)?;
        let value = self.peek(1)?;
        let address = self.message.address;
        let current = world.get_storage_data(&address, &key);
        let original = world.get_original_storage_data(&address, &key);
        let (cost, refund_add, refund_sub) = self.schedule.sstore_cost(&original, &current, &value);

        let mut fault = self.gas.ult(&cost);
        if self.schedule.has_sstore_sentry() {
            fault = fault.or(&self.gas.ule(&SymBitVec::word(G_SSTORE_SENTRY)));
        }
        self.charge_unless(&cost, &fault)?;
        self.pop_n(2)?;

        world.set_storage_data(&address, key, value);
        if !refund_add.as_biguint().is_some_and(Zero::is_zero) {
            world.add_refund(&refund_add);
        }
        if !refund_sub.as_biguint().is_some_and(Zero::is_zero) {
            world.sub_refund(&refund_sub);
        }
        self.next()
    }

    fn log(&mut self, op: u8, world: &mut WorldState) -> Exec<Step> {
        if self.message.is_static {
            return Err(ExceptionalHalt::WriteInStaticContext.into());
        }
        let region = self.memory_region(0, 1)?;
        let extra = G_LOG_DATA * region.1 as u64 + self.expansion_cost(&[region]);
        self.charge_static(op, extra)?;
        self.expand_memory(&[region]);
        self.pop_n(2)?;
        let topics = self.pop_n((op - OP_LOG0) as usize)?;
        world.add_log(LogEntry {
            address: self.message.address,
            topics,
            data: self.memory.slice(region.0, region.1),
        });
        self.next()
    }

    // ---------------------------------------------------------------------
    // calls and creation

    fn call(&mut self, op: u8, world: &WorldState) -> Exec<Step> {
        let kind = match op {
            OP_CALL => CallKind::Call,
            OP_CALLCODE => CallKind::CallCode,
            OP_DELEGATECALL => CallKind::DelegateCall,
            _ => CallKind::StaticCall,
        };
        let has_value = matches!(kind, CallKind::Call | CallKind::CallCode);
        let args = if has_value { 3 } else { 2 };

        let target = self.concrete_address(1, "call target")?;
        let value = if has_value {
            self.peek(2)?
        } else {
            SymBitVec::zero(WORD_BITS)
        };
        if kind == CallKind::Call && self.message.is_static {
            let value = self.concrete(2, Policy::One, "value in static context")?;
            if !value.is_zero() {
                return Err(ExceptionalHalt::WriteInStaticContext.into());
            }
        }
        let input = self.memory_region(args, args + 1)?;
        let output = self.memory_region(args + 2, args + 3)?;

        let extra = self.schedule.call_extra(
            op,
            &value,
            world.account_exists(&target),
            &world.is_empty_account(&target),
        );
        let base = SymBitVec::word(
            self.schedule.static_cost(op) + self.expansion_cost(&[input, output]),
        )
        .add(&extra);

        let insufficient = has_value
            && self.decide(
                Check::InsufficientFunds,
                &world.get_balance(&self.message.address).ult(&value),
                Policy::All,
                "call value affordability",
            )?;

        let requested = self.peek(0)?;
        let mut child_gas = if self.schedule.caps_call_gas() {
            self.charge(&base)?;
            let cap = gas::all_but_one_64th(&self.gas);
            let granted = SymBitVec::ite(&requested.ugt(&cap), &cap, &requested);
            if self.oog != OogPolicy::Ignore {
                self.gas = self.gas.sub(&granted);
            }
            granted
        } else {
            let fault = self
                .gas
                .ult(&base)
                .or(&self.gas.sub(&base).ult(&requested));
            self.charge_unless(&base.add(&requested), &fault)?;
            requested
        };
        if has_value {
            let stipend = SymBitVec::ite(
                &value.is_zero(),
                &SymBitVec::zero(WORD_BITS),
                &SymBitVec::word(CALL_STIPEND),
            );
            child_gas = child_gas.add(&stipend);
        }

        self.expand_memory(&[input, output]);
        self.pop_n(args + 4)?;
        let data = self.memory.slice(input.0, input.1);
        self.pending_call = Some(PendingCall {
            is_create: false,
            ret_offset: output.0,
            ret_size: output.1,
        });

        let me = self.message.address;
        let (caller, address, seen_value, transfers) = match kind {
            CallKind::Call => (me, target, value, true),
            CallKind::CallCode => (me, me, value, true),
            CallKind::DelegateCall => (self.message.caller, me, self.message.value.clone(), false),
            _ => (me, target, SymBitVec::zero(WORD_BITS), false),
        };
        debug!(kind = kind.name(), %target, "requesting call");
        Ok(Step::Call(CallRequest {
            kind,
            sender: me,
            caller,
            address,
            code_address: target,
            value: seen_value,
            transfers,
            data,
            code: world.get_code(&target).to_vec(),
            gas: child_gas,
            is_static: self.message.is_static || kind == CallKind::StaticCall,
            refused: insufficient.then_some(ExceptionalHalt::InsufficientFunds),
        }))
    }

    fn create(&mut self, op: u8, world: &WorldState) -> Exec<Step> {
        if self.message.is_static {
            return Err(ExceptionalHalt::WriteInStaticContext.into());
        }
        let kind = if op == OP_CREATE2 {
            CallKind::Create2
        } else {
            CallKind::Create
        };
        let region = self.memory_region(1, 2)?;
        let salt = if kind == CallKind::Create2 {
            Some(self.concrete(3, Policy::One, "CREATE2 salt")?)
        } else {
            None
        };
        let Some(init_code) = self.memory.slice(region.0, region.1).as_concrete() else {
            warn_code(
                ErrorCode::SymbolicCode,
                "initcode with symbolic bytes cannot be executed",
                false,
            );
            return Err(ExceptionalHalt::SymbolicCode.into());
        };
        let value = self.peek(0)?;
        let me = self.message.address;

        let nonce = world.get_nonce(&me);
        let Some(nonce) = nonce.as_biguint().cloned() else {
            return Err(Interrupt::Suspend(Concretize::new(
                nonce,
                Policy::One,
                ResumeTarget::Nonce(me),
                "creator nonce",
            )));
        };

        let insufficient = self.decide(
            Check::InsufficientFunds,
            &world.get_balance(&me).ult(&value),
            Policy::All,
            "create value affordability",
        )?;

        let hash_cost = match kind {
            CallKind::Create2 => G_SHA3_WORD * gas::words(region.1 as u64),
            _ => 0,
        };
        self.charge_static(op, hash_cost + self.expansion_cost(&[region]))?;

        let child_gas = if self.schedule.caps_call_gas() {
            gas::all_but_one_64th(&self.gas)
        } else {
            self.gas.clone()
        };
        if self.oog != OogPolicy::Ignore {
            self.gas = self.gas.sub(&child_gas);
        }
        self.expand_memory(&[region]);
        self.pop_n(if kind == CallKind::Create2 { 4 } else { 3 })?;

        // a nonce past 2^64 - 1 can never be incremented
        let nonce = nonce.to_u64();
        let address = match (salt, nonce) {
            (Some(salt), _) => {
                let bytes = evmsym_bitvec::be_bytes(&salt, 32);
                let mut salt = [0u8; 32];
                salt.copy_from_slice(&bytes);
                Address(create2_address(&me.0, &salt, &init_code))
            }
            (None, Some(nonce)) => Address(contract_address(&me.0, nonce)),
            (None, None) => Address::default(),
        };

        self.pending_call = Some(PendingCall {
            is_create: true,
            ret_offset: 0,
            ret_size: 0,
        });
        debug!(kind = kind.name(), %address, "requesting create");
        Ok(Step::Call(CallRequest {
            kind,
            sender: me,
            caller: me,
            address,
            code_address: address,
            value,
            transfers: true,
            data: ByteVec::new(),
            code: init_code,
            gas: child_gas,
            is_static: false,
            refused: if insufficient {
                Some(ExceptionalHalt::InsufficientFunds)
            } else if nonce.map_or(true, |n| n == u64::MAX) {
                Some(ExceptionalHalt::NonceOverflow)
            } else {
                None
            },
        }))
    }

    fn selfdestruct(&mut self, world: &mut WorldState) -> Exec<Step> {
        if self.message.is_static {
            return Err(ExceptionalHalt::WriteInStaticContext.into());
        }
        let beneficiary = self.concrete_address(0, "SELFDESTRUCT beneficiary")?;
        let me = self.message.address;
        let balance = world.get_balance(&me);
        let extra = self.schedule.selfdestruct_extra(
            world.account_exists(&beneficiary),
            &world.is_empty_account(&beneficiary),
            &balance,
        );
        let fee = SymBitVec::word(self.schedule.static_cost(OP_SELFDESTRUCT)).add(&extra);
        self.charge(&fee)?;
        self.pop()?;

        world.add_to_balance(&beneficiary, &balance);
        world.set_balance(&me, SymBitVec::zero(WORD_BITS));
        if world.schedule_destruct(&me) {
            world.add_refund(&SymBitVec::word(gas::R_SELFDESTRUCT));
        }
        debug!(account = %me, %beneficiary, "self-destruct scheduled");
        Ok(Step::Halt(Outcome::SelfDestruct))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::BlockContext;
    use pretty_assertions::assert_eq;

    fn message() -> Message {
        Message {
            caller: Address::from_low_u64(0xca11),
            address: Address::from_low_u64(0xc0de),
            origin: Address::from_low_u64(0xca11),
            value: SymBitVec::zero(256),
            data: ByteVec::new(),
            gas_price: SymBitVec::zero(256),
            is_static: false,
            depth: 0,
        }
    }

    fn vm(code: &[u8], gas: u64) -> (Vm, WorldState) {
        let world = WorldState::new(BlockContext::default(), Fork::Istanbul);
        let vm = Vm::new(
            message(),
            code.to_vec(),
            SymBitVec::word(gas),
            Fork::Istanbul,
            OogPolicy::Pedantic,
        );
        (vm, world)
    }

    fn run(vm: &mut Vm, world: &mut WorldState) -> Step {
        loop {
            match vm.step(world) {
                Step::Continue => continue,
                other => return other,
            }
        }
    }

    #[test]
    fn test_arithmetic_and_return() {
        // PUSH1 2 PUSH1 3 ADD PUSH1 0 MSTORE PUSH1 32 PUSH1 0 RETURN
        let code = [0x60, 2, 0x60, 3, 0x01, 0x60, 0, 0x52, 0x60, 32, 0x60, 0, 0xf3];
        let (mut vm, mut world) = vm(&code, 100);
        match run(&mut vm, &mut world) {
            Step::Halt(Outcome::Return(data)) => {
                assert_eq!(data.read_word(0), SymBitVec::word(5));
            }
            other => panic!("unexpected {:?}", other),
        }
        // 3 + 3 + 3 + 3 + 3 (mstore) + 3 (memory) + 3 + 3 + 0
        assert_eq!(vm.gas, SymBitVec::word(100 - 24));
    }

    #[test]
    fn test_running_off_the_end_stops() {
        let (mut vm, mut world) = vm(&[0x60, 1], 10);
        assert!(matches!(run(&mut vm, &mut world), Step::Halt(Outcome::Stop)));
    }

    #[test]
    fn test_faults() {
        let (mut vm1, mut world) = vm(&[0x01], 10);
        assert!(matches!(
            run(&mut vm1, &mut world),
            Step::Halt(Outcome::Throw(ExceptionalHalt::StackUnderflow))
        ));

        let (mut vm2, mut world) = vm(&[0x60, 3, 0x56, 0x00], 100);
        assert!(matches!(
            run(&mut vm2, &mut world),
            Step::Halt(Outcome::Throw(ExceptionalHalt::InvalidJumpDest(3)))
        ));

        let (mut vm3, mut world) = vm(&[0x60, 1], 2);
        assert!(matches!(
            run(&mut vm3, &mut world),
            Step::Halt(Outcome::Throw(ExceptionalHalt::OutOfGas))
        ));

        let (mut vm4, mut world) = vm(&[0x0c], 100);
        assert!(matches!(
            run(&mut vm4, &mut world),
            Step::Halt(Outcome::Throw(ExceptionalHalt::InvalidOpcode(0x0c)))
        ));
    }

    #[test]
    fn test_symbolic_jump_suspends_then_resumes() {
        // CALLDATALOAD(0) JUMP ... JUMPDEST STOP
        let code = [0x60, 0, 0x35, 0x56, 0xfe, 0x5b, 0x00];
        let (mut vm, mut world) = vm(&code, 1000);
        vm.message.data = ByteVec::from_bitvec(&SymBitVec::var("target", 256));

        let request = match run(&mut vm, &mut world) {
            Step::Suspend(request) => request,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(request.target, ResumeTarget::StackSlot(0));
        assert_eq!(request.policy, Policy::All);
        let gas_before = vm.gas.clone();

        vm.resume(request.target, &BigUint::from(5u8)).unwrap();
        assert_eq!(vm.gas, gas_before);
        assert!(matches!(run(&mut vm, &mut world), Step::Halt(Outcome::Stop)));
    }

    #[test]
    fn test_symbolic_branch_records_verdict() {
        // PUSH1 1 CALLDATALOAD(0) PUSH1 8 JUMPI; not taken: PUSH1 0 ... STOP; taken at 8
        let code = [0x60, 0, 0x35, 0x60, 8, 0x57, 0x60, 7, 0x5b, 0x00];
        let (mut vm, mut world) = vm(&code, 1000);
        vm.message.data = ByteVec::from_bitvec(&SymBitVec::var("cond", 256));

        let request = match run(&mut vm, &mut world) {
            Step::Suspend(request) => request,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(request.target, ResumeTarget::Verdict(Check::Branch));
        assert_eq!(request.expression.size(), 1);
        vm.resume(request.target, &BigUint::from(0u8)).unwrap();
        assert!(matches!(vm.step(&mut world), Step::Continue));
        assert_eq!(vm.pc, 6);
    }

    #[test]
    fn test_symbolic_gas_suspends_pessimistically() {
        let (mut vm, mut world) = vm(&[0x60, 1, 0x00], 0);
        vm.gas = SymBitVec::var("gas", 256);
        let request = match vm.step(&mut world) {
            Step::Suspend(request) => request,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(request.target, ResumeTarget::Verdict(Check::OutOfGas));
        assert_eq!(request.policy, Policy::Pessimistic);
        vm.resume(request.target, &BigUint::from(1u8)).unwrap();
        assert!(matches!(
            vm.step(&mut world),
            Step::Halt(Outcome::Throw(ExceptionalHalt::OutOfGas))
        ));
    }

    #[test]
    fn test_sstore_in_static_context() {
        let (mut vm, mut world) = vm(&[0x60, 1, 0x60, 0, 0x55], 100000);
        vm.message.is_static = true;
        assert!(matches!(
            run(&mut vm, &mut world),
            Step::Halt(Outcome::Throw(ExceptionalHalt::WriteInStaticContext))
        ));
    }

    #[test]
    fn test_sstore_sentry() {
        let (mut vm, mut world) = vm(&[0x60, 1, 0x60, 0, 0x55], 6 + 2300);
        assert!(matches!(
            run(&mut vm, &mut world),
            Step::Halt(Outcome::Throw(ExceptionalHalt::OutOfGas))
        ));
    }

    #[test]
    fn test_zero_size_return_ignores_symbolic_offset() {
        // PUSH1 0 CALLDATALOAD(0) RETURN  (size 0, symbolic offset)
        let code = [0x60, 0, 0x60, 0, 0x35, 0xf3];
        let (mut vm, mut world) = vm(&code, 100);
        vm.message.data = ByteVec::from_bitvec(&SymBitVec::var("offset", 256));
        match run(&mut vm, &mut world) {
            Step::Halt(Outcome::Return(data)) => assert!(data.is_empty()),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_huge_memory_offset_is_out_of_gas() {
        // PUSH1 1 PUSH32 0xff.. MSTORE
        let mut code = vec![0x60, 1, 0x7f];
        code.extend([0xff; 32]);
        code.push(0x52);
        let (mut vm, mut world) = vm(&code, 1_000_000);
        assert!(matches!(
            run(&mut vm, &mut world),
            Step::Halt(Outcome::Throw(ExceptionalHalt::OutOfGas))
        ));
    }

    #[test]
    fn test_memory_limit_holds_without_metering() {
        // PUSH1 1 PUSH4 0x7fffffff MSTORE
        let code = [0x60, 1, 0x63, 0x7f, 0xff, 0xff, 0xff, 0x52];
        let mut world = WorldState::new(BlockContext::default(), Fork::Istanbul);
        let mut vm = Vm::new(
            message(),
            code.to_vec(),
            SymBitVec::zero(256),
            Fork::Istanbul,
            OogPolicy::Ignore,
        );
        assert!(matches!(
            run(&mut vm, &mut world),
            Step::Halt(Outcome::Throw(ExceptionalHalt::OutOfGas))
        ));
        assert!(vm.memory.is_empty());
    }

    #[test]
    fn test_memory_limit_is_configurable() {
        // PUSH1 1 PUSH1 0x40 MSTORE: needs 0x60 bytes
        let code = [0x60, 1, 0x60, 0x40, 0x52, 0x00];
        let (vm_small, mut world) = vm(&code, 1000);
        let mut small = vm_small.with_memory_limit(0x5f);
        assert!(matches!(
            run(&mut small, &mut world),
            Step::Halt(Outcome::Throw(ExceptionalHalt::OutOfGas))
        ));
        let (vm_exact, mut world) = vm(&code, 1000);
        let mut exact = vm_exact.with_memory_limit(0x60);
        assert!(matches!(run(&mut exact, &mut world), Step::Halt(Outcome::Stop)));
        assert_eq!(exact.memory.len(), 0x60);
    }

    #[test]
    fn test_returndatacopy_bounds() {
        // PUSH1 1 PUSH1 0 PUSH1 0 RETURNDATACOPY
        let (mut vm, mut world) = vm(&[0x60, 1, 0x60, 0, 0x60, 0, 0x3e], 100);
        assert!(matches!(
            run(&mut vm, &mut world),
            Step::Halt(Outcome::Throw(ExceptionalHalt::ReturnDataOutOfBounds))
        ));
    }

    #[test]
    fn test_push_past_end_pads_with_zeros() {
        let (mut vm, mut world) = vm(&[0x61, 0x01], 100);
        assert!(matches!(vm.step(&mut world), Step::Continue));
        assert_eq!(vm.stack, vec![SymBitVec::word(0x0100)]);
    }
}
