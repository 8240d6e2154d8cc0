// SPDX-License-Identifier: AGPL-3.0

//! EVM opcode table

use evmsym_config::Fork;

pub const OP_STOP: u8 = 0x00;
pub const OP_ADD: u8 = 0x01;
pub const OP_MUL: u8 = 0x02;
pub const OP_SUB: u8 = 0x03;
pub const OP_DIV: u8 = 0x04;
pub const OP_SDIV: u8 = 0x05;
pub const OP_MOD: u8 = 0x06;
pub const OP_SMOD: u8 = 0x07;
pub const OP_ADDMOD: u8 = 0x08;
pub const OP_MULMOD: u8 = 0x09;
pub const OP_EXP: u8 = 0x0a;
pub const OP_SIGNEXTEND: u8 = 0x0b;
pub const OP_LT: u8 = 0x10;
pub const OP_GT: u8 = 0x11;
pub const OP_SLT: u8 = 0x12;
pub const OP_SGT: u8 = 0x13;
pub const OP_EQ: u8 = 0x14;
pub const OP_ISZERO: u8 = 0x15;
pub const OP_AND: u8 = 0x16;
pub const OP_OR: u8 = 0x17;
pub const OP_XOR: u8 = 0x18;
pub const OP_NOT: u8 = 0x19;
pub const OP_BYTE: u8 = 0x1a;
pub const OP_SHL: u8 = 0x1b;
pub const OP_SHR: u8 = 0x1c;
pub const OP_SAR: u8 = 0x1d;
pub const OP_SHA3: u8 = 0x20;
pub const OP_ADDRESS: u8 = 0x30;
pub const OP_BALANCE: u8 = 0x31;
pub const OP_ORIGIN: u8 = 0x32;
pub const OP_CALLER: u8 = 0x33;
pub const OP_CALLVALUE: u8 = 0x34;
pub const OP_CALLDATALOAD: u8 = 0x35;
pub const OP_CALLDATASIZE: u8 = 0x36;
pub const OP_CALLDATACOPY: u8 = 0x37;
pub const OP_CODESIZE: u8 = 0x38;
pub const OP_CODECOPY: u8 = 0x39;
pub const OP_GASPRICE: u8 = 0x3a;
pub const OP_EXTCODESIZE: u8 = 0x3b;
pub const OP_EXTCODECOPY: u8 = 0x3c;
pub const OP_RETURNDATASIZE: u8 = 0x3d;
pub const OP_RETURNDATACOPY: u8 = 0x3e;
pub const OP_EXTCODEHASH: u8 = 0x3f;
pub const OP_BLOCKHASH: u8 = 0x40;
pub const OP_COINBASE: u8 = 0x41;
pub const OP_TIMESTAMP: u8 = 0x42;
pub const OP_NUMBER: u8 = 0x43;
pub const OP_DIFFICULTY: u8 = 0x44;
pub const OP_GASLIMIT: u8 = 0x45;
pub const OP_CHAINID: u8 = 0x46;
pub const OP_SELFBALANCE: u8 = 0x47;
pub const OP_POP: u8 = 0x50;
pub const OP_MLOAD: u8 = 0x51;
pub const OP_MSTORE: u8 = 0x52;
pub const OP_MSTORE8: u8 = 0x53;
pub const OP_SLOAD: u8 = 0x54;
pub const OP_SSTORE: u8 = 0x55;
pub const OP_JUMP: u8 = 0x56;
pub const OP_JUMPI: u8 = 0x57;
pub const OP_PC: u8 = 0x58;
pub const OP_MSIZE: u8 = 0x59;
pub const OP_GAS: u8 = 0x5a;
pub const OP_JUMPDEST: u8 = 0x5b;
pub const OP_PUSH1: u8 = 0x60;
pub const OP_PUSH32: u8 = 0x7f;
pub const OP_DUP1: u8 = 0x80;
pub const OP_DUP16: u8 = 0x8f;
pub const OP_SWAP1: u8 = 0x90;
pub const OP_SWAP16: u8 = 0x9f;
pub const OP_LOG0: u8 = 0xa0;
pub const OP_LOG1: u8 = 0xa1;
pub const OP_LOG2: u8 = 0xa2;
pub const OP_LOG3: u8 = 0xa3;
pub const OP_LOG4: u8 = 0xa4;
pub const OP_CREATE: u8 = 0xf0;
pub const OP_CALL: u8 = 0xf1;
pub const OP_CALLCODE: u8 = 0xf2;
pub const OP_RETURN: u8 = 0xf3;
pub const OP_DELEGATECALL: u8 = 0xf4;
pub const OP_CREATE2: u8 = 0xf5;
pub const OP_STATICCALL: u8 = 0xfa;
pub const OP_REVERT: u8 = 0xfd;
pub const OP_INVALID: u8 = 0xfe;
pub const OP_SELFDESTRUCT: u8 = 0xff;

/// The fork that introduced `op`, or `None` for unassigned bytes
pub fn introduced_in(op: u8) -> Option<Fork> {
    match op {
        OP_DELEGATECALL => Some(Fork::Homestead),
        OP_RETURNDATASIZE | OP_RETURNDATACOPY | OP_STATICCALL | OP_REVERT => Some(Fork::Byzantium),
        OP_SHL | OP_SHR | OP_SAR | OP_EXTCODEHASH | OP_CREATE2 => Some(Fork::Petersburg),
        OP_CHAINID | OP_SELFBALANCE => Some(Fork::Istanbul),
        OP_STOP..=OP_SIGNEXTEND
        | OP_LT..=OP_BYTE
        | OP_SHA3
        | OP_ADDRESS..=OP_EXTCODECOPY
        | OP_BLOCKHASH..=OP_GASLIMIT
        | OP_POP..=OP_JUMPDEST
        | OP_PUSH1..=OP_SWAP16
        | OP_LOG0..=OP_LOG4
        | OP_CREATE
        | OP_CALL
        | OP_CALLCODE
        | OP_RETURN
        | OP_SELFDESTRUCT => Some(Fork::Frontier),
        _ => None,
    }
}

pub fn is_valid(op: u8, fork: Fork) -> bool {
    introduced_in(op).is_some_and(|since| fork >= since)
}

/// Number of immediate bytes following `op`
pub fn immediate_size(op: u8) -> usize {
    match op {
        OP_PUSH1..=OP_PUSH32 => (op - OP_PUSH1 + 1) as usize,
        _ => 0,
    }
}

/// Items popped and pushed by `op`
pub fn stack_io(op: u8) -> (usize, usize) {
    match op {
        OP_STOP | OP_JUMPDEST | OP_INVALID => (0, 0),
        OP_ADD | OP_MUL | OP_SUB | OP_DIV | OP_SDIV | OP_MOD | OP_SMOD | OP_EXP
        | OP_SIGNEXTEND | OP_LT | OP_GT | OP_SLT | OP_SGT | OP_EQ | OP_AND | OP_OR | OP_XOR
        | OP_BYTE | OP_SHL | OP_SHR | OP_SAR | OP_SHA3 => (2, 1),
        OP_ADDMOD | OP_MULMOD => (3, 1),
        OP_ISZERO | OP_NOT | OP_BALANCE | OP_CALLDATALOAD | OP_EXTCODESIZE | OP_EXTCODEHASH
        | OP_BLOCKHASH | OP_MLOAD | OP_SLOAD => (1, 1),
        OP_ADDRESS | OP_ORIGIN | OP_CALLER | OP_CALLVALUE | OP_CALLDATASIZE | OP_CODESIZE
        | OP_GASPRICE | OP_RETURNDATASIZE | OP_COINBASE | OP_TIMESTAMP | OP_NUMBER
        | OP_DIFFICULTY | OP_GASLIMIT | OP_CHAINID | OP_SELFBALANCE | OP_PC | OP_MSIZE
        | OP_GAS => (0, 1),
        OP_CALLDATACOPY | OP_CODECOPY | OP_RETURNDATACOPY => (3, 0),
        OP_EXTCODECOPY => (4, 0),
        OP_POP | OP_JUMP | OP_SELFDESTRUCT => (1, 0),
        OP_MSTORE | OP_MSTORE8 | OP_SSTORE | OP_JUMPI | OP_RETURN | OP_REVERT => (2, 0),
        OP_PUSH1..=OP_PUSH32 => (0, 1),
        OP_DUP1..=OP_DUP16 => {
            let n = (op - OP_DUP1 + 1) as usize;
            (n, n + 1)
        }
        OP_SWAP1..=OP_SWAP16 => {
            let n = (op - OP_SWAP1 + 2) as usize;
            (n, n)
        }
        OP_LOG0..=OP_LOG4 => ((op - OP_LOG0 + 2) as usize, 0),
        OP_CREATE => (3, 1),
        OP_CREATE2 => (4, 1),
        OP_CALL | OP_CALLCODE => (7, 1),
        OP_DELEGATECALL | OP_STATICCALL => (6, 1),
        _ => (0, 0),
    }
}

pub fn name(op: u8) -> String {
    let fixed = match op {
        OP_STOP => "STOP",
        OP_ADD => "ADD",
        OP_MUL => "MUL",
        OP_SUB => "SUB",
        OP_DIV => "DIV",
        OP_SDIV => "SDIV",
        OP_MOD => "MOD",
        OP_SMOD => "SMOD",
        OP_ADDMOD => "ADDMOD",
        OP_MULMOD => "MULMOD",
        OP_EXP => "EXP",
        OP_SIGNEXTEND => "SIGNEXTEND",
        OP_LT => "LT",
        OP_GT => "GT",
        OP_SLT => "SLT",
        OP_SGT => "SGT",
        OP_EQ => "EQ",
        OP_ISZERO => "ISZERO",
        OP_AND => "AND",
        OP_OR => "OR",
        OP_XOR => "XOR",
        OP_NOT => "NOT",
        OP_BYTE => "BYTE",
        OP_SHL => "SHL",
        OP_SHR => "SHR",
        OP_SAR => "SAR",
        OP_SHA3 => "SHA3",
        OP_ADDRESS => "ADDRESS",
        OP_BALANCE => "BALANCE",
        OP_ORIGIN => "ORIGIN",
        OP_CALLER => "CALLER",
        OP_CALLVALUE => "CALLVALUE",
        OP_CALLDATALOAD => "CALLDATALOAD",
        OP_CALLDATASIZE => "CALLDATASIZE",
        OP_CALLDATACOPY => "CALLDATACOPY",
        OP_CODESIZE => "CODESIZE",
        OP_CODECOPY => "CODECOPY",
        OP_GASPRICE => "GASPRICE",
        OP_EXTCODESIZE => "EXTCODESIZE",
        OP_EXTCODECOPY => "EXTCODECOPY",
        OP_RETURNDATASIZE => "RETURNDATASIZE",
        OP_RETURNDATACOPY => "RETURNDATACOPY",
        OP_EXTCODEHASH => "EXTCODEHASH",
        OP_BLOCKHASH => "BLOCKHASH",
        OP_COINBASE => "COINBASE",
        OP_TIMESTAMP => "TIMESTAMP",
        OP_NUMBER => "NUMBER",
        OP_DIFFICULTY => "DIFFICULTY",
        OP_GASLIMIT => "GASLIMIT",
        OP_CHAINID => "CHAINID",
        OP_SELFBALANCE => "SELFBALANCE",
        OP_POP => "POP",
        OP_MLOAD => "MLOAD",
        OP_MSTORE => "MSTORE",
        OP_MSTORE8 => "MSTORE8",
        OP_SLOAD => "SLOAD",
        OP_SSTORE => "SSTORE",
        OP_JUMP => "JUMP",
        OP_JUMPI => "JUMPI",
        OP_PC => "PC",
        OP_MSIZE => "MSIZE",
        OP_GAS => "GAS",
        OP_JUMPDEST => "JUMPDEST",
        OP_CREATE => "CREATE",
        OP_CALL => "CALL",
        OP_CALLCODE => "CALLCODE",
        OP_RETURN => "RETURN",
        OP_DELEGATECALL => "DELEGATECALL",
        OP_CREATE2 => "CREATE2",
        OP_STATICCALL => "STATICCALL",
        OP_REVERT => "REVERT",
        OP_INVALID => "INVALID",
        OP_SELFDESTRUCT => "SELFDESTRUCT",
        OP_PUSH1..=OP_PUSH32 => return format!("PUSH{}", op - OP_PUSH1 + 1),
        OP_DUP1..=OP_DUP16 => return format!("DUP{}", op - OP_DUP1 + 1),
        OP_SWAP1..=OP_SWAP16 => return format!("SWAP{}", op - OP_SWAP1 + 1),
        OP_LOG0..=OP_LOG4 => return format!("LOG{}", op - OP_LOG0),
        _ => return format!("UNKNOWN_{:#04x}", op),
    };
    fixed.to_string()
}

/// Offsets of JUMPDEST bytes that are not inside PUSH immediates
pub fn jump_destinations(code: &[u8]) -> Vec<bool> {
    let mut valid = vec![false; code.len()];
    let mut pc = 0;
    while pc < code.len() {
        let op = code[pc];
        if op == OP_JUMPDEST {
            valid[pc] = true;
        }
        pc += 1 + immediate_size(op);
    }
    valid
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fork_gating() {
        assert!(is_valid(OP_ADD, Fork::Frontier));
        assert!(!is_valid(OP_DELEGATECALL, Fork::Frontier));
        assert!(is_valid(OP_DELEGATECALL, Fork::Homestead));
        assert!(!is_valid(OP_REVERT, Fork::SpuriousDragon));
        assert!(is_valid(OP_REVERT, Fork::Byzantium));
        assert!(!is_valid(OP_SHL, Fork::Byzantium));
        assert!(!is_valid(OP_CHAINID, Fork::Petersburg));
        assert!(is_valid(OP_SELFBALANCE, Fork::Istanbul));
        assert!(!is_valid(0x0c, Fork::Istanbul));
        assert!(!is_valid(OP_INVALID, Fork::Istanbul));
    }

    #[test]
    fn test_names() {
        assert_eq!(name(OP_SSTORE), "SSTORE");
        assert_eq!(name(0x61), "PUSH2");
        assert_eq!(name(0x8f), "DUP16");
        assert_eq!(name(0xa3), "LOG3");
        assert_eq!(name(0xef), "UNKNOWN_0xef");
    }

    #[test]
    fn test_jumpdest_inside_push_data() {
        // PUSH1 0x5b, JUMPDEST
        let dests = jump_destinations(&[0x60, 0x5b, 0x5b]);
        assert_eq!(dests, vec![false, false, true]);
    }

    #[test]
    fn test_stack_io() {
        assert_eq!(stack_io(OP_DUP1 + 2), (3, 4));
        assert_eq!(stack_io(OP_SWAP1), (2, 2));
        assert_eq!(stack_io(OP_LOG4), (6, 0));
        assert_eq!(stack_io(OP_CALL), (7, 1));
    }
}
