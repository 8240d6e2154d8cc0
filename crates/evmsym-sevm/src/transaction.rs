// SPDX-License-Identifier: AGPL-3.0

//! Transaction and call coordinator
//!
//! `EvmWorld` owns the world state and the stack of open contexts. It steps
//! the innermost interpreter, opens a child when the interpreter asks for a
//! call, and closes it when it halts. Control leaves `run` either with a
//! finished top-level transaction or with a concretization request.

use std::fmt;

use evmsym_bitvec::{SymBitVec, SymBool};
use evmsym_bytevec::ByteVec;
use evmsym_config::{Config, Fork, OogPolicy};
use evmsym_constants::{MAX_CALL_DEPTH, MAX_CODE_SIZE};
use evmsym_exceptions::{ExceptionalHalt, SevmError, SevmResult};
use evmsym_hashes::contract_address;
use evmsym_logs::{warn_code, ErrorCode};
use num_bigint::BigUint;
use num_traits::{ToPrimitive, Zero};
use tracing::{debug, info};

use crate::concretize::{Check, Concretize, Policy, ResumeTarget, Verdicts};
use crate::gas::{GasSchedule, G_CODE_DEPOSIT};
use crate::journal::Checkpoint;
use crate::vm::{CallKind, CallRequest, ChildResult, Message, Outcome, Step, Vm};
use crate::world::{Address, BlockContext, LogEntry, WorldState};

/// A top-level transaction with full fee and nonce accounting
#[derive(Debug, Clone)]
pub struct TxRequest {
    /// `Call` or `Create`
    pub kind: CallKind,
    pub caller: Address,
    /// Ignored for creation, where the address derives from the sender nonce
    pub address: Address,
    pub value: SymBitVec,
    pub data: ByteVec,
    pub gas: SymBitVec,
    pub price: SymBitVec,
}

/// Result of a finished top-level transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxResult {
    pub kind: Outcome,
    pub return_data: ByteVec,
    pub gas_left: SymBitVec,
    pub gas_used: SymBitVec,
    pub logs: Vec<LogEntry>,
    /// Address of the deployed contract for a successful creation
    pub created: Option<Address>,
}

impl TxResult {
    pub fn is_success(&self) -> bool {
        self.kind.is_success()
    }

    pub fn error(&self) -> Option<&ExceptionalHalt> {
        match &self.kind {
            Outcome::Throw(halt) => Some(halt),
            _ => None,
        }
    }
}

/// A finished top-level transaction as recorded by [`EvmWorld::transactions`]
#[derive(Debug, Clone)]
pub struct Transaction {
    pub kind: CallKind,
    pub caller: Address,
    pub address: Address,
    pub value: SymBitVec,
    pub data: ByteVec,
    pub gas: SymBitVec,
    pub price: SymBitVec,
    pub result: TxResult,
}

impl fmt::Display for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} -> {} value={} gas={} => {}",
            self.kind.name(),
            self.caller,
            self.address,
            self.value,
            self.gas,
            self.result.kind.name()
        )?;
        if let Some(halt) = self.result.error() {
            write!(f, " ({})", halt)?;
        }
        if !self.result.return_data.is_empty() {
            write!(f, " data={}", self.result.return_data)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub enum RunState {
    Suspended(Concretize),
    Completed(TxResult),
}

#[derive(Debug, Clone)]
struct Frame {
    vm: Vm,
    kind: CallKind,
    checkpoint: Checkpoint,
}

/// Work the coordinator has to finish before the innermost interpreter runs again
#[derive(Debug, Clone)]
enum Pending {
    Start(TxRequest),
    Open(CallRequest),
    Close(Outcome),
    /// A top-level context that fails before its first instruction
    Fail(ExceptionalHalt),
}

#[derive(Debug, Clone)]
struct OpenTx {
    record: Transaction,
    /// Fees, nonce and refunds are settled
    settles: bool,
    origin: Address,
}

enum Flow {
    Continue,
    Suspend(Concretize),
    Done(TxResult),
}

#[derive(Debug, Clone)]
pub struct EvmWorld {
    world: WorldState,
    config: Config,
    frames: Vec<Frame>,
    pending: Option<Pending>,
    suspension: Option<Concretize>,
    verdicts: Verdicts,
    tx: Option<OpenTx>,
    last_result: Option<TxResult>,
    transactions: Vec<Transaction>,
}

impl EvmWorld {
    pub fn new(block: BlockContext, config: Config) -> Self {
        Self::with_world(WorldState::new(block, config.fork), config)
    }

    pub fn with_world(world: WorldState, config: Config) -> Self {
        Self {
            world,
            config,
            frames: Vec::new(),
            pending: None,
            suspension: None,
            verdicts: Verdicts::default(),
            tx: None,
            last_result: None,
            transactions: Vec::new(),
        }
    }

    pub fn world(&self) -> &WorldState {
        &self.world
    }

    pub fn world_mut(&mut self) -> &mut WorldState {
        &mut self.world
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn fork(&self) -> Fork {
        self.world.fork()
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn is_running(&self) -> bool {
        self.tx.is_some()
    }

    /// Interpreter of the innermost open context
    pub fn current_vm(&self) -> Option<&Vm> {
        self.frames.last().map(|frame| &frame.vm)
    }

    pub fn last_result(&self) -> Option<&TxResult> {
        self.last_result.as_ref()
    }

    pub fn transactions(&self) -> &[Transaction] {
        &self.transactions
    }

    pub fn create_account(
        &mut self,
        address: Address,
        balance: SymBitVec,
        nonce: SymBitVec,
        code: Vec<u8>,
    ) -> SevmResult<()> {
        self.world.create_account(address, balance, nonce, code)
    }

    pub fn get_balance(&self, address: &Address) -> SymBitVec {
        self.world.get_balance(address)
    }

    pub fn get_nonce(&self, address: &Address) -> SymBitVec {
        self.world.get_nonce(address)
    }

    pub fn get_code(&self, address: &Address) -> &[u8] {
        self.world.get_code(address)
    }

    pub fn get_storage_data(&self, address: &Address, key: &SymBitVec) -> SymBitVec {
        self.world.get_storage_data(address, key)
    }

    pub fn block_number(&self) -> &SymBitVec {
        self.world.block_number()
    }

    pub fn block_timestamp(&self) -> &SymBitVec {
        self.world.block_timestamp()
    }

    pub fn block_difficulty(&self) -> &SymBitVec {
        self.world.block_difficulty()
    }

    pub fn block_coinbase(&self) -> &SymBitVec {
        self.world.block_coinbase()
    }

    pub fn block_gaslimit(&self) -> &SymBitVec {
        self.world.block_gaslimit()
    }

    pub fn logs(&self) -> &[LogEntry] {
        self.world.logs()
    }

    /// Open a bare top-level context: no intrinsic gas, value transfer or fees.
    ///
    /// For creation `address` is where the contract is installed and `data`
    /// is the initcode. A creation that cannot start (the address is taken or
    /// the initcode is symbolic) finishes with THROW on the next `run`.
    #[allow(clippy::too_many_arguments)]
    pub fn open_transaction(
        &mut self,
        kind: CallKind,
        address: Address,
        price: SymBitVec,
        data: ByteVec,
        caller: Address,
        value: SymBitVec,
        gas: SymBitVec,
    ) -> SevmResult<()> {
        self.ensure_idle()?;
        self.world.begin_transaction();

        let mut failure = None;
        let (code, input) = if kind.is_create() {
            if self.world.collides(&address) {
                failure = Some(ExceptionalHalt::AddressCollision(address.0));
                (Vec::new(), ByteVec::new())
            } else if let Some(code) = data.as_concrete() {
                let nonce = self.creation_nonce();
                self.world
                    .create_account(address, SymBitVec::zero(256), nonce, Vec::new())?;
                (code, ByteVec::new())
            } else {
                warn_code(
                    ErrorCode::SymbolicCode,
                    "initcode with symbolic bytes cannot be executed",
                    false,
                );
                failure = Some(ExceptionalHalt::SymbolicCode);
                (Vec::new(), ByteVec::new())
            }
        } else {
            (self.world.get_code(&address).to_vec(), data.clone())
        };

        self.tx = Some(OpenTx {
            record: Transaction {
                kind,
                caller,
                address,
                value: value.clone(),
                data,
                gas: gas.clone(),
                price: price.clone(),
                result: placeholder_result(),
            },
            settles: false,
            origin: caller,
        });
        if let Some(halt) = failure {
            self.pending = Some(Pending::Fail(halt));
            return Ok(());
        }
        let checkpoint = self.world.checkpoint();
        self.push_frame(
            kind,
            Message {
                caller,
                address,
                origin: caller,
                value,
                data: input,
                gas_price: price,
                is_static: kind == CallKind::StaticCall,
                depth: 0,
            },
            code,
            gas,
            checkpoint,
        );
        Ok(())
    }

    /// Queue a full top-level transaction; it starts on the next `run`
    pub fn start_transaction(&mut self, request: TxRequest) -> SevmResult<()> {
        self.ensure_idle()?;
        if !matches!(request.kind, CallKind::Call | CallKind::Create) {
            return Err(SevmError::ValueOutOfRange(format!(
                "top-level {} transaction",
                request.kind.name()
            )));
        }
        self.world.begin_transaction();
        self.tx = Some(OpenTx {
            record: Transaction {
                kind: request.kind,
                caller: request.caller,
                address: request.address,
                value: request.value.clone(),
                data: request.data.clone(),
                gas: request.gas.clone(),
                price: request.price.clone(),
                result: placeholder_result(),
            },
            settles: true,
            origin: request.caller,
        });
        self.pending = Some(Pending::Start(request));
        Ok(())
    }

    fn ensure_idle(&self) -> SevmResult<()> {
        if self.tx.is_some() {
            return Err(SevmError::TransactionInProgress);
        }
        Ok(())
    }

    /// Drive the open transaction until it finishes or needs a concrete value
    pub fn run(&mut self) -> SevmResult<RunState> {
        if let Some(request) = &self.suspension {
            return Ok(RunState::Suspended(request.clone()));
        }
        if self.tx.is_none() {
            return Err(SevmError::NoTransaction);
        }
        loop {
            if let Some(pending) = self.pending.take() {
                match self.process(pending)? {
                    Flow::Continue => continue,
                    Flow::Suspend(request) => {
                        debug!(%request, "coordinator suspending");
                        self.suspension = Some(request.clone());
                        return Ok(RunState::Suspended(request));
                    }
                    Flow::Done(result) => return Ok(RunState::Completed(result)),
                }
            }

            let frame = self
                .frames
                .last_mut()
                .ok_or_else(|| SevmError::Internal("no open context".to_string()))?;
            match frame.vm.step(&mut self.world) {
                Step::Continue => {}
                Step::Suspend(request) => {
                    self.suspension = Some(request.clone());
                    return Ok(RunState::Suspended(request));
                }
                Step::Call(request) => self.pending = Some(Pending::Open(request)),
                Step::Halt(outcome) => self.pending = Some(Pending::Close(outcome)),
            }
        }
    }

    /// Supply the value chosen for the outstanding suspension
    pub fn resume(&mut self, value: BigUint) -> SevmResult<()> {
        let request = self.suspension.take().ok_or(SevmError::NotSuspended)?;
        debug!(target = ?request.target, %value, "resuming");
        let applied = match request.target {
            ResumeTarget::Verdict(
                check @ (Check::IntrinsicGas | Check::UpfrontCost | Check::CodeDeposit),
            ) => {
                self.verdicts.set(check, !value.is_zero());
                Ok(())
            }
            ResumeTarget::StackSlot(_) | ResumeTarget::Verdict(_) => match self.frames.last_mut() {
                Some(frame) => frame.vm.resume(request.target, &value),
                None => Err(SevmError::StaleResume(format!("{:?}", request.target))),
            },
            ResumeTarget::Nonce(address) => {
                if value.bits() > 256 {
                    Err(SevmError::ValueOutOfRange(value.to_string()))
                } else {
                    self.world
                        .set_nonce(&address, SymBitVec::from_biguint(value, 256));
                    Ok(())
                }
            }
            ResumeTarget::Coinbase => {
                self.world.bind_coinbase(&value);
                Ok(())
            }
        };
        if applied.is_err() {
            self.suspension = Some(request);
        }
        applied
    }

    fn process(&mut self, pending: Pending) -> SevmResult<Flow> {
        let flow = match pending.clone() {
            Pending::Start(request) => self.begin(request)?,
            Pending::Open(request) => self.open(request)?,
            Pending::Close(outcome) => self.close(outcome)?,
            Pending::Fail(halt) => self.close_top(
                Outcome::Throw(halt),
                ByteVec::new(),
                SymBitVec::zero(256),
                None,
            )?,
        };
        match &flow {
            Flow::Suspend(_) => self.pending = Some(pending),
            _ => self.verdicts.clear(),
        }
        Ok(flow)
    }

    fn decide(
        &self,
        check: Check,
        condition: &SymBool,
        policy: Policy,
        reason: &'static str,
    ) -> Result<bool, Concretize> {
        if let Some(answer) = condition.as_bool() {
            return Ok(answer);
        }
        if let Some(answer) = self.verdicts.get(check) {
            return Ok(answer);
        }
        Err(Concretize::new(
            condition.to_bitvec(1),
            policy,
            ResumeTarget::Verdict(check),
            reason,
        ))
    }

    /// Suspension needed before the nonce of `address` can be read exactly
    fn concrete_nonce(&self, address: &Address) -> Option<Concretize> {
        let nonce = self.world.get_nonce(address);
        if nonce.is_concrete() {
            return None;
        }
        Some(Concretize::new(
            nonce,
            Policy::One,
            ResumeTarget::Nonce(*address),
            "account nonce",
        ))
    }

    fn creation_nonce(&self) -> SymBitVec {
        // EIP-161
        if self.fork() >= Fork::SpuriousDragon {
            SymBitVec::word(1)
        } else {
            SymBitVec::zero(256)
        }
    }

    fn gas_price(&self) -> SymBitVec {
        self.tx
            .as_ref()
            .map(|tx| tx.record.price.clone())
            .unwrap_or_else(|| SymBitVec::zero(256))
    }

    fn push_frame(
        &mut self,
        kind: CallKind,
        message: Message,
        code: Vec<u8>,
        gas: SymBitVec,
        checkpoint: Checkpoint,
    ) {
        debug!(
            kind = kind.name(),
            address = %message.address,
            depth = message.depth,
            "opening context"
        );
        let vm = Vm::new(message, code, gas, self.fork(), self.config.oog)
            .with_memory_limit(self.config.max_memory);
        self.frames.push(Frame {
            vm,
            kind,
            checkpoint,
        });
    }

    // ---------------------------------------------------------------------
    // top-level start

    fn begin(&mut self, request: TxRequest) -> SevmResult<Flow> {
        let schedule = GasSchedule::for_fork(self.fork());
        let is_create = request.kind.is_create();
        let caller = request.caller;

        if let Some(suspend) = self.concrete_nonce(&caller) {
            return Ok(Flow::Suspend(suspend));
        }
        if self.world.block_coinbase().is_symbolic() {
            return Ok(Flow::Suspend(Concretize::new(
                self.world.block_coinbase().clone(),
                Policy::One,
                ResumeTarget::Coinbase,
                "fee beneficiary",
            )));
        }
        let sender_nonce = self.world.get_nonce(&caller);
        let address = if is_create {
            // the sender nonce could not be incremented past 2^64 - 1
            let Some(nonce) = sender_nonce
                .as_biguint()
                .and_then(ToPrimitive::to_u64)
                .filter(|nonce| *nonce < u64::MAX)
            else {
                return Ok(Flow::Done(
                    self.reject(ExceptionalHalt::NonceOverflow, request.gas),
                ));
            };
            Address(contract_address(&caller.0, nonce))
        } else {
            request.address
        };
        if is_create {
            if let Some(suspend) = self.concrete_nonce(&address) {
                return Ok(Flow::Suspend(suspend));
            }
        }

        let intrinsic = schedule.intrinsic_gas(is_create, &request.data);
        let too_little_gas = match self.decide(
            Check::IntrinsicGas,
            &request.gas.ult(&intrinsic),
            Policy::Pessimistic,
            "intrinsic gas",
        ) {
            Ok(answer) => answer,
            Err(suspend) => return Ok(Flow::Suspend(suspend)),
        };
        if too_little_gas {
            return Ok(Flow::Done(self.reject(ExceptionalHalt::OutOfGas, request.gas)));
        }

        let fee = request.gas.mul(&request.price);
        let upfront = request.value.add(&fee);
        let cannot_afford = match self.decide(
            Check::UpfrontCost,
            &self.world.get_balance(&caller).ult(&upfront),
            Policy::Pessimistic,
            "upfront cost",
        ) {
            Ok(answer) => answer,
            Err(suspend) => return Ok(Flow::Suspend(suspend)),
        };
        if cannot_afford {
            return Ok(Flow::Done(
                self.reject(ExceptionalHalt::InsufficientFunds, request.gas),
            ));
        }

        info!(kind = request.kind.name(), %caller, %address, "starting transaction");
        self.world.sub_from_balance(&caller, &fee);
        self.world.increase_nonce(&caller);
        if let Some(tx) = self.tx.as_mut() {
            tx.record.address = address;
        }

        let gas = match self.config.oog {
            OogPolicy::Ignore => request.gas.clone(),
            _ => request.gas.sub(&intrinsic),
        };
        let checkpoint = self.world.checkpoint();
        let (code, input) = if is_create {
            if self.world.collides(&address) {
                return self.close_top(
                    Outcome::Throw(ExceptionalHalt::AddressCollision(address.0)),
                    ByteVec::new(),
                    SymBitVec::zero(256),
                    None,
                );
            }
            let Some(code) = request.data.as_concrete() else {
                warn_code(
                    ErrorCode::SymbolicCode,
                    "initcode with symbolic bytes cannot be executed",
                    false,
                );
                return self.close_top(
                    Outcome::Throw(ExceptionalHalt::SymbolicCode),
                    ByteVec::new(),
                    SymBitVec::zero(256),
                    None,
                );
            };
            let nonce = self.creation_nonce();
            self.world
                .create_account(address, SymBitVec::zero(256), nonce, Vec::new())?;
            (code, ByteVec::new())
        } else {
            (self.world.get_code(&address).to_vec(), request.data.clone())
        };
        self.world.transfer(&caller, &address, &request.value);

        self.push_frame(
            request.kind,
            Message {
                caller,
                address,
                origin: caller,
                value: request.value,
                data: input,
                gas_price: request.price,
                is_static: false,
                depth: 0,
            },
            code,
            gas,
            checkpoint,
        );
        Ok(Flow::Continue)
    }

    /// Finish a transaction that never started: nothing changes, no fee is paid
    fn reject(&mut self, halt: ExceptionalHalt, gas: SymBitVec) -> TxResult {
        info!(%halt, "transaction rejected");
        let result = TxResult {
            kind: Outcome::Throw(halt),
            return_data: ByteVec::new(),
            gas_left: gas,
            gas_used: SymBitVec::zero(256),
            logs: Vec::new(),
            created: None,
        };
        self.world.finalize_transaction();
        self.record(result)
    }

    // ---------------------------------------------------------------------
    // nested contexts

    fn open(&mut self, request: CallRequest) -> SevmResult<Flow> {
        let depth = self.frames.len();
        let failed = |gas_left: SymBitVec| ChildResult {
            success: false,
            output: ByteVec::new(),
            gas_left,
            created: None,
        };

        let refused = match &request.refused {
            Some(halt) => Some(halt.clone()),
            None if depth > MAX_CALL_DEPTH => Some(ExceptionalHalt::MessageDepthLimit),
            None => None,
        };
        if let Some(halt) = refused {
            debug!(kind = request.kind.name(), depth, %halt, "call cannot start");
            self.finish_parent(failed(request.gas))?;
            return Ok(Flow::Continue);
        }

        let checkpoint = if request.kind.is_create() {
            if let Some(suspend) = self.concrete_nonce(&request.address) {
                return Ok(Flow::Suspend(suspend));
            }
            self.world.increase_nonce(&request.sender);
            if self.world.collides(&request.address) {
                debug!(address = %request.address, "address collision");
                self.finish_parent(failed(SymBitVec::zero(256)))?;
                return Ok(Flow::Continue);
            }
            let checkpoint = self.world.checkpoint();
            let nonce = self.creation_nonce();
            self.world
                .create_account(request.address, SymBitVec::zero(256), nonce, Vec::new())?;
            checkpoint
        } else {
            self.world.checkpoint()
        };

        if request.transfers {
            self.world
                .transfer(&request.sender, &request.address, &request.value);
        }

        let origin = self
            .tx
            .as_ref()
            .map(|tx| tx.origin)
            .unwrap_or(request.caller);
        let message = Message {
            caller: request.caller,
            address: request.address,
            origin,
            value: request.value,
            data: request.data,
            gas_price: self.gas_price(),
            is_static: request.is_static,
            depth,
        };
        self.push_frame(request.kind, message, request.code, request.gas, checkpoint);
        Ok(Flow::Continue)
    }

    fn finish_parent(&mut self, result: ChildResult) -> SevmResult<()> {
        let parent = self
            .frames
            .last_mut()
            .ok_or_else(|| SevmError::Internal("no parent context".to_string()))?;
        parent.vm.finish_call(result);
        Ok(())
    }

    fn close(&mut self, outcome: Outcome) -> SevmResult<Flow> {
        let Some(frame) = self.frames.last() else {
            return Err(SevmError::Internal("no context to close".to_string()));
        };
        let address = frame.vm.address();
        let is_create = frame.kind.is_create();
        let mut gas_left = frame.vm.gas.clone();
        let mut outcome = outcome;

        if is_create && outcome.is_success() {
            match self.deploy(address, &outcome, &gas_left) {
                Ok(Ok(remaining)) => gas_left = remaining,
                Ok(Err(halt)) => outcome = Outcome::Throw(halt),
                Err(suspend) => return Ok(Flow::Suspend(suspend)),
            }
        }

        let Some(frame) = self.frames.pop() else {
            return Err(SevmError::Internal("no context to close".to_string()));
        };
        let success = outcome.is_success();
        if !success {
            self.world.revert_to(frame.checkpoint);
        }
        if matches!(outcome, Outcome::Throw(_)) {
            gas_left = SymBitVec::zero(256);
        }
        let output = match &outcome {
            Outcome::Revert(data) => data.clone(),
            Outcome::Return(data) if !is_create => data.clone(),
            _ => ByteVec::new(),
        };
        let created = (is_create && success).then_some(address);
        debug!(
            outcome = outcome.name(),
            %address,
            depth = self.frames.len(),
            "closing context"
        );

        if self.frames.is_empty() {
            return self.close_top(outcome, output, gas_left, created);
        }
        self.finish_parent(ChildResult {
            success,
            output,
            gas_left,
            created,
        })?;
        Ok(Flow::Continue)
    }

    /// Store the code returned by initcode, or say why the creation fails
    fn deploy(
        &mut self,
        address: Address,
        outcome: &Outcome,
        gas_left: &SymBitVec,
    ) -> Result<Result<SymBitVec, ExceptionalHalt>, Concretize> {
        let Some(code) = outcome.output().as_concrete() else {
            warn_code(
                ErrorCode::SymbolicCode,
                "returned contract code is symbolic",
                false,
            );
            return Ok(Err(ExceptionalHalt::SymbolicCode));
        };
        // EIP-170
        if self.fork() >= Fork::SpuriousDragon && code.len() > MAX_CODE_SIZE {
            return Ok(Err(ExceptionalHalt::ContractSizeLimit));
        }
        if self.config.oog == OogPolicy::Ignore {
            self.world.set_code(&address, code);
            return Ok(Ok(gas_left.clone()));
        }

        let cost = SymBitVec::word(G_CODE_DEPOSIT * code.len() as u64);
        let policy = match self.config.oog {
            OogPolicy::Complete => Policy::All,
            _ => Policy::Pessimistic,
        };
        let short = self.decide(Check::CodeDeposit, &gas_left.ult(&cost), policy, "code deposit")?;
        if !short {
            self.world.set_code(&address, code);
            return Ok(Ok(gas_left.sub(&cost)));
        }
        if self.fork() == Fork::Frontier {
            debug!(%address, "code deposit unaffordable; leaving an empty contract");
            return Ok(Ok(gas_left.clone()));
        }
        Ok(Err(ExceptionalHalt::OutOfGas))
    }

    fn close_top(
        &mut self,
        outcome: Outcome,
        output: ByteVec,
        gas_left: SymBitVec,
        created: Option<Address>,
    ) -> SevmResult<Flow> {
        let Some(tx) = self.tx.as_ref() else {
            return Err(SevmError::NoTransaction);
        };
        let settles = tx.settles;
        let caller = tx.record.caller;
        let gas_limit = tx.record.gas.clone();
        let price = tx.record.price.clone();

        let mut gas_left = gas_left;
        if settles {
            let used = gas_limit.sub(&gas_left);
            let cap = used.udiv(&SymBitVec::word(2));
            let refund = self.world.refund().clone();
            let refund = SymBitVec::ite(&refund.ugt(&cap), &cap, &refund);
            gas_left = gas_left.add(&refund);

            self.world.add_to_balance(&caller, &gas_left.mul(&price));
            let coinbase = Address::from_word(self.world.block_coinbase())
                .ok_or_else(|| SevmError::NotConcrete("coinbase".to_string()))?;
            let paid = gas_limit.sub(&gas_left).mul(&price);
            self.world.add_to_balance(&coinbase, &paid);
        }
        let gas_used = gas_limit.sub(&gas_left);
        let logs = self.world.logs().to_vec();
        self.world.finalize_transaction();

        let result = TxResult {
            kind: outcome,
            return_data: output,
            gas_left,
            gas_used,
            logs,
            created,
        };
        info!(outcome = result.kind.name(), "transaction finished");
        Ok(Flow::Done(self.record(result)))
    }

    fn record(&mut self, result: TxResult) -> TxResult {
        if let Some(mut tx) = self.tx.take() {
            tx.record.result = result.clone();
            self.transactions.push(tx.record);
        }
        self.frames.clear();
        self.pending = None;
        self.last_result = Some(result.clone());
        result
    }
}

fn placeholder_result() -> TxResult {
    TxResult {
        kind: Outcome::Stop,
        return_data: ByteVec::new(),
        gas_left: SymBitVec::zero(256),
        gas_used: SymBitVec::zero(256),
        logs: Vec::new(),
        created: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn addr(n: u64) -> Address {
        Address::from_low_u64(n)
    }

    fn world(fork: Fork) -> EvmWorld {
        EvmWorld::new(BlockContext::default(), Config::new(fork, OogPolicy::Pedantic))
    }

    fn drain(world: &mut EvmWorld) -> TxResult {
        match world.run().unwrap() {
            RunState::Completed(result) => result,
            RunState::Suspended(request) => panic!("unexpected suspension {}", request),
        }
    }

    #[test]
    fn test_run_without_transaction() {
        let mut world = world(Fork::Istanbul);
        assert_eq!(world.run().unwrap_err(), SevmError::NoTransaction);
        assert_eq!(
            world.resume(BigUint::from(1u8)).unwrap_err(),
            SevmError::NotSuspended
        );
    }

    #[test]
    fn test_second_transaction_while_running() {
        let mut world = world(Fork::Istanbul);
        world
            .open_transaction(
                CallKind::Call,
                addr(1),
                SymBitVec::zero(256),
                ByteVec::new(),
                addr(2),
                SymBitVec::zero(256),
                SymBitVec::word(100),
            )
            .unwrap();
        let again = world.open_transaction(
            CallKind::Call,
            addr(1),
            SymBitVec::zero(256),
            ByteVec::new(),
            addr(2),
            SymBitVec::zero(256),
            SymBitVec::word(100),
        );
        assert_eq!(again.unwrap_err(), SevmError::TransactionInProgress);
    }

    #[test]
    fn test_raw_call_to_empty_account_stops() {
        let mut world = world(Fork::Istanbul);
        world
            .open_transaction(
                CallKind::Call,
                addr(1),
                SymBitVec::zero(256),
                ByteVec::new(),
                addr(2),
                SymBitVec::word(5),
                SymBitVec::word(100),
            )
            .unwrap();
        let result = drain(&mut world);
        assert_eq!(result.kind, Outcome::Stop);
        assert_eq!(result.gas_left, SymBitVec::word(100));
        assert_eq!(world.get_balance(&addr(1)), SymBitVec::zero(256));
        assert_eq!(world.transactions().len(), 1);
        assert!(world.last_result().is_some());
        assert!(!world.is_running());
    }

    #[test]
    fn test_full_transaction_settles_fees() {
        let mut world = world(Fork::Istanbul);
        world
            .create_account(addr(2), SymBitVec::word(1_000_000), SymBitVec::zero(256), vec![])
            .unwrap();
        world
            .start_transaction(TxRequest {
                kind: CallKind::Call,
                caller: addr(2),
                address: addr(1),
                value: SymBitVec::word(10),
                data: ByteVec::new(),
                gas: SymBitVec::word(30000),
                price: SymBitVec::word(2),
            })
            .unwrap();
        let result = drain(&mut world);
        assert_eq!(result.gas_used, SymBitVec::word(21000));
        assert_eq!(
            world.get_balance(&addr(2)),
            SymBitVec::word(1_000_000 - 10 - 42000)
        );
        assert_eq!(world.get_balance(&addr(1)), SymBitVec::word(10));
        assert_eq!(world.get_balance(&Address::default()), SymBitVec::word(42000));
        assert_eq!(world.get_nonce(&addr(2)), SymBitVec::word(1));
    }

    #[test]
    fn test_full_transaction_rejected_without_funds() {
        let mut world = world(Fork::Istanbul);
        world
            .start_transaction(TxRequest {
                kind: CallKind::Call,
                caller: addr(2),
                address: addr(1),
                value: SymBitVec::word(10),
                data: ByteVec::new(),
                gas: SymBitVec::word(30000),
                price: SymBitVec::word(1),
            })
            .unwrap();
        let result = drain(&mut world);
        assert_eq!(result.error(), Some(&ExceptionalHalt::InsufficientFunds));
        assert_eq!(world.get_nonce(&addr(2)), SymBitVec::zero(256));
    }

    #[test]
    fn test_intrinsic_gas_rejection() {
        let mut world = world(Fork::Istanbul);
        world
            .start_transaction(TxRequest {
                kind: CallKind::Call,
                caller: addr(2),
                address: addr(1),
                value: SymBitVec::zero(256),
                data: ByteVec::new(),
                gas: SymBitVec::word(20999),
                price: SymBitVec::zero(256),
            })
            .unwrap();
        let result = drain(&mut world);
        assert_eq!(result.error(), Some(&ExceptionalHalt::OutOfGas));
    }

    #[test]
    fn test_symbolic_coinbase_suspends_start() {
        let block = BlockContext {
            coinbase: SymBitVec::var("coinbase", 256),
            ..BlockContext::default()
        };
        let mut world = EvmWorld::new(block, Config::default());
        world
            .start_transaction(TxRequest {
                kind: CallKind::Call,
                caller: addr(2),
                address: addr(1),
                value: SymBitVec::zero(256),
                data: ByteVec::new(),
                gas: SymBitVec::word(21000),
                price: SymBitVec::zero(256),
            })
            .unwrap();
        match world.run().unwrap() {
            RunState::Suspended(request) => assert_eq!(request.target, ResumeTarget::Coinbase),
            other => panic!("unexpected {:?}", other),
        }
        world.resume(BigUint::from(0xc0ffeeu32)).unwrap();
        let result = drain(&mut world);
        assert!(result.is_success());
        assert_eq!(world.block_coinbase(), &SymBitVec::word(0xc0ffee));
    }

    fn raw_create(world: &mut EvmWorld, at: Address, initcode: ByteVec) -> TxResult {
        world
            .open_transaction(
                CallKind::Create,
                at,
                SymBitVec::zero(256),
                initcode,
                addr(2),
                SymBitVec::zero(256),
                SymBitVec::word(50_000),
            )
            .unwrap();
        drain(world)
    }

    fn full_create(world: &mut EvmWorld, initcode: ByteVec) -> TxResult {
        world
            .start_transaction(TxRequest {
                kind: CallKind::Create,
                caller: addr(2),
                address: Address::default(),
                value: SymBitVec::zero(256),
                data: initcode,
                gas: SymBitVec::word(100_000),
                price: SymBitVec::word(1),
            })
            .unwrap();
        drain(world)
    }

    #[test]
    fn test_raw_create_onto_taken_address_throws() {
        let mut world = world(Fork::Istanbul);
        world
            .create_account(addr(1), SymBitVec::word(9), SymBitVec::word(1), vec![0x00])
            .unwrap();
        let result = raw_create(&mut world, addr(1), ByteVec::from_bytes(&[0x00]));
        assert_eq!(
            result.error(),
            Some(&ExceptionalHalt::AddressCollision(addr(1).0))
        );
        assert_eq!(result.gas_used, SymBitVec::word(50_000));
        assert_eq!(world.get_code(&addr(1)), &[0x00]);
        assert_eq!(world.get_balance(&addr(1)), SymBitVec::word(9));
        assert!(!world.is_running());
        assert_eq!(world.transactions().len(), 1);
    }

    #[test]
    fn test_symbolic_initcode_throws_on_both_entry_points() {
        let initcode = ByteVec::from_bitvec(&SymBitVec::var("initcode", 256));

        let mut raw = world(Fork::Istanbul);
        let result = raw_create(&mut raw, addr(1), initcode.clone());
        assert_eq!(result.error(), Some(&ExceptionalHalt::SymbolicCode));
        assert!(!raw.world().account_exists(&addr(1)));

        let mut full = world(Fork::Istanbul);
        full.create_account(addr(2), SymBitVec::word(1_000_000), SymBitVec::zero(256), vec![])
            .unwrap();
        full.start_transaction(TxRequest {
            kind: CallKind::Create,
            caller: addr(2),
            address: Address::default(),
            value: SymBitVec::zero(256),
            data: initcode,
            gas: SymBitVec::word(100_000),
            price: SymBitVec::word(1),
        })
        .unwrap();
        // the intrinsic cost depends on which initcode bytes are zero
        match full.run().unwrap() {
            RunState::Suspended(request) => {
                assert_eq!(request.target, ResumeTarget::Verdict(Check::IntrinsicGas))
            }
            other => panic!("unexpected {:?}", other),
        }
        full.resume(BigUint::from(0u8)).unwrap();
        let result = drain(&mut full);
        assert_eq!(result.error(), Some(&ExceptionalHalt::SymbolicCode));
        assert_eq!(full.get_nonce(&addr(2)), SymBitVec::word(1));
    }

    #[test]
    fn test_create_with_exhausted_sender_nonce_is_rejected() {
        let mut world = world(Fork::Istanbul);
        world
            .create_account(
                addr(2),
                SymBitVec::word(1_000_000),
                SymBitVec::word(u64::MAX),
                vec![],
            )
            .unwrap();
        let result = full_create(&mut world, ByteVec::from_bytes(&[0x00]));
        assert_eq!(result.error(), Some(&ExceptionalHalt::NonceOverflow));
        assert_eq!(result.gas_used, SymBitVec::zero(256));
        assert_eq!(world.get_nonce(&addr(2)), SymBitVec::word(u64::MAX));
        assert_eq!(world.get_balance(&addr(2)), SymBitVec::word(1_000_000));
    }
}
