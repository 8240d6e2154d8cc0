// SPDX-License-Identifier: AGPL-3.0

//! ByteVec - a sequence of concrete or symbolic bytes
//!
//! Used for memory, call data, return data and log payloads. Reads past the
//! end yield zero bytes, matching EVM memory and call data semantics.

use evmsym_bitvec::{be_bytes, Model, SymBitVec, Term};
use evmsym_hashes::keccak256;
use std::fmt;
use std::rc::Rc;

/// A single byte, concrete or an 8-bit term
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SymByte {
    Concrete(u8),
    Symbolic(Rc<Term>),
}

impl SymByte {
    /// Wrap an 8-bit vector
    pub fn from_bitvec(value: &SymBitVec) -> SymByte {
        debug_assert_eq!(value.size(), 8);
        match value.as_u64() {
            Some(byte) => SymByte::Concrete(byte as u8),
            None => SymByte::Symbolic(value.to_term()),
        }
    }

    pub fn to_bitvec(&self) -> SymBitVec {
        match self {
            SymByte::Concrete(byte) => SymBitVec::from_u64(u64::from(*byte), 8),
            SymByte::Symbolic(term) => SymBitVec::from_term(term.clone()),
        }
    }

    pub fn as_u8(&self) -> Option<u8> {
        match self {
            SymByte::Concrete(byte) => Some(*byte),
            SymByte::Symbolic(_) => None,
        }
    }
}

impl From<u8> for SymByte {
    fn from(byte: u8) -> Self {
        SymByte::Concrete(byte)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ByteVec {
    bytes: Vec<SymByte>,
}

impl ByteVec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            bytes: bytes.iter().copied().map(SymByte::Concrete).collect(),
        }
    }

    pub fn from_sym_bytes(bytes: Vec<SymByte>) -> Self {
        Self { bytes }
    }

    /// Split a bit vector whose width is a whole number of bytes
    pub fn from_bitvec(value: &SymBitVec) -> Self {
        let len = (value.size() / 8) as usize;
        if let Some(bytes) = value.to_bytes_be() {
            return Self::from_bytes(&bytes);
        }
        let bytes = (0..len)
            .map(|i| {
                let lo = ((len - 1 - i) * 8) as u32;
                SymByte::from_bitvec(&value.extract(lo + 7, lo))
            })
            .collect();
        Self { bytes }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn is_concrete(&self) -> bool {
        self.bytes.iter().all(|b| matches!(b, SymByte::Concrete(_)))
    }

    pub fn iter(&self) -> impl Iterator<Item = &SymByte> {
        self.bytes.iter()
    }

    /// Byte at `index`, zero past the end
    pub fn get(&self, index: usize) -> SymByte {
        self.bytes
            .get(index)
            .cloned()
            .unwrap_or(SymByte::Concrete(0))
    }

    /// Copy of `size` bytes from `offset`, zero-filled past the end
    pub fn slice(&self, offset: usize, size: usize) -> ByteVec {
        let bytes = (0..size)
            .map(|i| offset.checked_add(i).map_or(SymByte::Concrete(0), |at| self.get(at)))
            .collect();
        Self { bytes }
    }

    /// Grow with zero bytes to at least `len`
    pub fn ensure_len(&mut self, len: usize) {
        if self.bytes.len() < len {
            self.bytes.resize(len, SymByte::Concrete(0));
        }
    }

    pub fn set_byte(&mut self, offset: usize, byte: SymByte) {
        self.ensure_len(offset + 1);
        self.bytes[offset] = byte;
    }

    /// Overwrite `data.len()` bytes at `offset`, growing as needed
    pub fn write(&mut self, offset: usize, data: &ByteVec) {
        if data.is_empty() {
            return;
        }
        self.ensure_len(offset + data.len());
        self.bytes[offset..offset + data.len()].clone_from_slice(&data.bytes);
    }

    /// 256-bit big-endian word at `offset`
    pub fn read_word(&self, offset: usize) -> SymBitVec {
        self.slice(offset, 32).to_bitvec_or_zero(256)
    }

    pub fn write_word(&mut self, offset: usize, value: &SymBitVec) {
        self.write(offset, &ByteVec::from_bitvec(value));
    }

    fn to_bitvec_or_zero(&self, size: u32) -> SymBitVec {
        self.to_bitvec().unwrap_or_else(|| SymBitVec::zero(size))
    }

    /// The whole sequence as one big-endian bit vector; None when empty
    pub fn to_bitvec(&self) -> Option<SymBitVec> {
        if self.bytes.is_empty() {
            return None;
        }
        if let Some(bytes) = self.as_concrete() {
            return Some(SymBitVec::from_bytes_be(&bytes, (bytes.len() * 8) as u32));
        }
        let parts: Vec<SymBitVec> = self.bytes.iter().map(SymByte::to_bitvec).collect();
        Some(SymBitVec::concat(&parts))
    }

    pub fn as_concrete(&self) -> Option<Vec<u8>> {
        self.bytes.iter().map(SymByte::as_u8).collect()
    }

    /// keccak256 as a 256-bit word; symbolic input yields a keccak term
    pub fn keccak(&self) -> SymBitVec {
        match self.as_concrete() {
            Some(bytes) => SymBitVec::from_bytes_be(&keccak256(&bytes), 256),
            None => self
                .to_bitvec()
                .map(|v| v.keccak())
                .unwrap_or_else(|| SymBitVec::from_bytes_be(&keccak256(&[]), 256)),
        }
    }

    /// Concrete bytes under a model
    pub fn eval(&self, model: &Model) -> Option<Vec<u8>> {
        self.bytes
            .iter()
            .map(|b| match b {
                SymByte::Concrete(byte) => Some(*byte),
                SymByte::Symbolic(term) => term
                    .eval(model)
                    .map(|v| be_bytes(&v, 1)[0]),
            })
            .collect()
    }
}

impl From<Vec<u8>> for ByteVec {
    fn from(bytes: Vec<u8>) -> Self {
        Self::from_bytes(&bytes)
    }
}

impl fmt::Display for ByteVec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x")?;
        for byte in &self.bytes {
            match byte {
                SymByte::Concrete(b) => write!(f, "{:02x}", b)?,
                SymByte::Symbolic(_) => write!(f, "??")?,
            }
        }
        Ok(())
    }
}
