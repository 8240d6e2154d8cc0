// SPDX-License-Identifier: AGPL-3.0

use lazy_static::lazy_static;
use num_bigint::BigUint;
use num_traits::One;

/// Common EVM sizes
pub const WORD_SIZE: usize = 32;
pub const WORD_BITS: u32 = 256;
pub const ADDRESS_SIZE: usize = 20;

/// Default ceiling on the memory of one context, in bytes. Metered gas
/// stops growth long before this; it bounds host allocation when gas is
/// unmetered or unconstrained.
pub const MEMORY_LIMIT: u64 = 1 << 23;

/// Maximum operand stack depth
pub const STACK_LIMIT: usize = 1024;

/// Maximum call depth for EVM execution
pub const MAX_CALL_DEPTH: usize = 1024;

/// EIP-170 deployed code size limit
pub const MAX_CODE_SIZE: usize = 0x6000;

/// Value handed to the callee on value-bearing calls
pub const CALL_STIPEND: u64 = 2300;

/// Number of most recent block hashes BLOCKHASH can see
pub const BLOCKHASH_WINDOW: u64 = 256;

/// Empty Keccak-256 hash (keccak256(""))
pub const EMPTY_KECCAK: [u8; 32] = [
    0xC5, 0xD2, 0x46, 0x01, 0x86, 0xF7, 0x23, 0x3C, 0x92, 0x7E, 0x7D, 0xB2, 0xDC, 0xC7, 0x03, 0xC0,
    0xE5, 0x00, 0xB6, 0x53, 0xCA, 0x82, 0x27, 0x3B, 0x7B, 0xFA, 0xD8, 0x04, 0x5D, 0x85, 0xA4, 0x70,
];

/// Keccak-256 of the RLP encoding of an empty list
pub const EMPTY_LIST_KECCAK: [u8; 32] = [
    0x1d, 0xcc, 0x4d, 0xe8, 0xde, 0xc7, 0x5d, 0x7a, 0xab, 0x85, 0xb5, 0x67, 0xb6, 0xcc, 0xd4, 0x1a,
    0xd3, 0x12, 0x45, 0x1b, 0x94, 0x8a, 0x74, 0x13, 0xf0, 0xa1, 0x42, 0xfd, 0x40, 0xd4, 0x93, 0x47,
];

lazy_static! {
    /// 2^256, the modulus of EVM word arithmetic
    pub static ref WORD_MODULUS: BigUint = BigUint::one() << 256;

    /// 2^256 - 1
    pub static ref WORD_MAX: BigUint = (BigUint::one() << 256) - BigUint::one();
}
