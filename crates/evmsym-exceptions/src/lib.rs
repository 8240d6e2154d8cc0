// SPDX-License-Identifier: AGPL-3.0

//! Symbolic EVM errors
//!
//! Two families live here. `ExceptionalHalt` is an EVM-level fault: it ends
//! the faulting context with THROW and is reported to the parent as an
//! ordinary unsuccessful outcome. `SevmError` is misuse of the engine itself
//! and is returned to whoever is driving it.

use thiserror::Error;

/// Indicates that the EVM has experienced an exceptional halt.
/// This causes execution to immediately end with all gas being consumed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExceptionalHalt {
    #[error("Stack underflow")]
    StackUnderflow,

    #[error("Stack overflow")]
    StackOverflow,

    #[error("Out of gas")]
    OutOfGas,

    #[error("Insufficient funds")]
    InsufficientFunds,

    #[error("Invalid opcode: {0:#x}")]
    InvalidOpcode(u8),

    #[error("Invalid jump destination: {0:#x}")]
    InvalidJumpDest(usize),

    #[error("Message depth limit exceeded (>1024)")]
    MessageDepthLimit,

    #[error("Nonce overflow")]
    NonceOverflow,

    #[error("Write in static context")]
    WriteInStaticContext,

    #[error("Address collision at 0x{}", hex_address(.0))]
    AddressCollision([u8; 20]),

    #[error("Contract size limit exceeded")]
    ContractSizeLimit,

    #[error("Return data out of bounds")]
    ReturnDataOutOfBounds,

    #[error("Deployed code is symbolic")]
    SymbolicCode,
}

fn hex_address(address: &[u8; 20]) -> String {
    address.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Errors raised by the engine API rather than by the executed bytecode
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SevmError {
    #[error("No transaction is in progress")]
    NoTransaction,

    #[error("A transaction is already in progress")]
    TransactionInProgress,

    #[error("Nothing is suspended")]
    NotSuspended,

    #[error("Resume target does not match the pending suspension: {0}")]
    StaleResume(String),

    #[error("Value out of range: {0}")]
    ValueOutOfRange(String),

    #[error("Account already exists at 0x{}", hex_address(.0))]
    AccountExists([u8; 20]),

    #[error("Value is not concrete: {0}")]
    NotConcrete(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type SevmResult<T> = Result<T, SevmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exceptional_halt_display() {
        assert_eq!(ExceptionalHalt::StackUnderflow.to_string(), "Stack underflow");
        assert_eq!(ExceptionalHalt::OutOfGas.to_string(), "Out of gas");
        assert_eq!(
            ExceptionalHalt::InvalidOpcode(0xfe).to_string(),
            "Invalid opcode: 0xfe"
        );
        assert_eq!(
            ExceptionalHalt::InvalidJumpDest(0x10).to_string(),
            "Invalid jump destination: 0x10"
        );
    }

    #[test]
    fn test_address_collision_display() {
        let mut address = [0u8; 20];
        address[19] = 0xab;
        assert_eq!(
            ExceptionalHalt::AddressCollision(address).to_string(),
            "Address collision at 0x00000000000000000000000000000000000000ab"
        );
    }

    #[test]
    fn test_sevm_error_display() {
        assert_eq!(
            SevmError::NoTransaction.to_string(),
            "No transaction is in progress"
        );
        assert_eq!(
            SevmError::NotConcrete("gas".to_string()).to_string(),
            "Value is not concrete: gas"
        );
    }
}
