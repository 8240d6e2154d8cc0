// SPDX-License-Identifier: AGPL-3.0

//! Symbolic bit vector operations for EVM execution
//!
//! `SymBitVec` is either a concrete `BigUint` of a known width or a shared
//! expression term. Word-level helpers implement EVM semantics (division by
//! zero yields zero, shifts saturate) on top of the SMT-LIB flavoured terms in
//! [`term`].

pub mod term;

use num_bigint::BigUint;
use num_traits::{One, ToPrimitive, Zero};
use std::fmt;
use std::rc::Rc;

pub use term::{be_bytes, keccak_fun_name, BinOp, BoolTerm, CmpOp, Decls, Model, Term};
use term::{bigint_to_twos_complement, mask, normalize_biguint, to_signed_bigint};

/// A boolean that is either known or an expression
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SymBool {
    Concrete(bool),
    Symbolic(Rc<BoolTerm>),
}

/// A fixed-width bit vector that is either known or an expression.
///
/// A `Symbolic` value never wraps a constant term.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SymBitVec {
    Concrete { value: BigUint, size: u32 },
    Symbolic { term: Rc<Term>, size: u32 },
}

impl SymBool {
    pub fn from_term(term: Rc<BoolTerm>) -> Self {
        match term.as_const() {
            Some(value) => SymBool::Concrete(value),
            None => SymBool::Symbolic(term),
        }
    }

    pub fn to_term(&self) -> Rc<BoolTerm> {
        match self {
            SymBool::Concrete(value) => BoolTerm::constant(*value),
            SymBool::Symbolic(term) => term.clone(),
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            SymBool::Concrete(value) => Some(*value),
            SymBool::Symbolic(_) => None,
        }
    }

    pub fn is_concrete(&self) -> bool {
        matches!(self, SymBool::Concrete(_))
    }

    pub fn negate(&self) -> SymBool {
        SymBool::from_term(BoolTerm::not(self.to_term()))
    }

    pub fn and(&self, other: &SymBool) -> SymBool {
        SymBool::from_term(BoolTerm::and(self.to_term(), other.to_term()))
    }

    pub fn or(&self, other: &SymBool) -> SymBool {
        SymBool::from_term(BoolTerm::or(self.to_term(), other.to_term()))
    }

    /// 1 when true, 0 when false, as a `size`-bit vector
    pub fn to_bitvec(&self, size: u32) -> SymBitVec {
        SymBitVec::ite(self, &SymBitVec::from_u64(1, size), &SymBitVec::zero(size))
    }

    pub fn eval(&self, model: &Model) -> Option<bool> {
        match self {
            SymBool::Concrete(value) => Some(*value),
            SymBool::Symbolic(term) => term.eval(model),
        }
    }

    pub fn collect_decls(&self, decls: &mut Decls) {
        if let SymBool::Symbolic(term) = self {
            term.collect_decls(decls);
        }
    }
}

impl From<bool> for SymBool {
    fn from(value: bool) -> Self {
        SymBool::Concrete(value)
    }
}

impl fmt::Display for SymBool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SymBool::Concrete(value) => write!(f, "{}", value),
            SymBool::Symbolic(term) => write!(f, "{}", term),
        }
    }
}

impl SymBitVec {
    pub fn from_biguint(value: BigUint, size: u32) -> Self {
        SymBitVec::Concrete {
            value: normalize_biguint(value, size),
            size,
        }
    }

    pub fn from_u64(value: u64, size: u32) -> Self {
        Self::from_biguint(BigUint::from(value), size)
    }

    /// 256-bit word from a u64
    pub fn word(value: u64) -> Self {
        Self::from_u64(value, 256)
    }

    pub fn from_bytes_be(bytes: &[u8], size: u32) -> Self {
        Self::from_biguint(BigUint::from_bytes_be(bytes), size)
    }

    pub fn zero(size: u32) -> Self {
        Self::from_biguint(BigUint::zero(), size)
    }

    pub fn var(name: impl Into<String>, size: u32) -> Self {
        SymBitVec::Symbolic {
            term: Term::var(name, size),
            size,
        }
    }

    pub fn from_term(term: Rc<Term>) -> Self {
        let size = term.size();
        match term.as_const() {
            Some(value) => SymBitVec::Concrete {
                value: value.clone(),
                size,
            },
            None => SymBitVec::Symbolic { term, size },
        }
    }

    pub fn to_term(&self) -> Rc<Term> {
        match self {
            SymBitVec::Concrete { value, size } => Term::constant(value.clone(), *size),
            SymBitVec::Symbolic { term, .. } => term.clone(),
        }
    }

    pub fn size(&self) -> u32 {
        match self {
            SymBitVec::Concrete { size, .. } | SymBitVec::Symbolic { size, .. } => *size,
        }
    }

    pub fn is_concrete(&self) -> bool {
        matches!(self, SymBitVec::Concrete { .. })
    }

    pub fn is_symbolic(&self) -> bool {
        !self.is_concrete()
    }

    pub fn as_biguint(&self) -> Option<&BigUint> {
        match self {
            SymBitVec::Concrete { value, .. } => Some(value),
            SymBitVec::Symbolic { .. } => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        self.as_biguint().and_then(|v| v.to_u64())
    }

    pub fn as_usize(&self) -> Option<usize> {
        self.as_biguint().and_then(|v| v.to_usize())
    }

    /// Big-endian bytes of a concrete value, `size / 8` long
    pub fn to_bytes_be(&self) -> Option<Vec<u8>> {
        self.as_biguint()
            .map(|v| be_bytes(v, (self.size() as usize).div_ceil(8)))
    }

    fn bin(&self, op: BinOp, other: &SymBitVec) -> SymBitVec {
        if let (Some(a), Some(b)) = (self.as_biguint(), other.as_biguint()) {
            return Self::from_biguint(op.apply(a, b, self.size()), self.size());
        }
        Self::from_term(Term::bin(op, self.to_term(), other.to_term()))
    }

    fn cmp(&self, op: CmpOp, other: &SymBitVec) -> SymBool {
        if let (Some(a), Some(b)) = (self.as_biguint(), other.as_biguint()) {
            return SymBool::Concrete(op.apply(a, b, self.size()));
        }
        SymBool::from_term(BoolTerm::cmp(op, self.to_term(), other.to_term()))
    }

    pub fn add(&self, other: &SymBitVec) -> SymBitVec {
        self.bin(BinOp::Add, other)
    }

    pub fn sub(&self, other: &SymBitVec) -> SymBitVec {
        self.bin(BinOp::Sub, other)
    }

    pub fn mul(&self, other: &SymBitVec) -> SymBitVec {
        self.bin(BinOp::Mul, other)
    }

    /// Guard an SMT division so that a zero divisor yields zero
    fn guarded(&self, op: BinOp, divisor: &SymBitVec) -> SymBitVec {
        match divisor.as_biguint() {
            Some(d) if d.is_zero() => Self::zero(self.size()),
            Some(_) => self.bin(op, divisor),
            None => Self::ite(
                &divisor.is_zero(),
                &Self::zero(self.size()),
                &self.bin(op, divisor),
            ),
        }
    }

    pub fn udiv(&self, other: &SymBitVec) -> SymBitVec {
        self.guarded(BinOp::UDiv, other)
    }

    pub fn urem(&self, other: &SymBitVec) -> SymBitVec {
        self.guarded(BinOp::URem, other)
    }

    pub fn sdiv(&self, other: &SymBitVec) -> SymBitVec {
        self.guarded(BinOp::SDiv, other)
    }

    pub fn srem(&self, other: &SymBitVec) -> SymBitVec {
        self.guarded(BinOp::SRem, other)
    }

    /// (self + other) % modulus computed without wrapping; zero modulus gives zero
    pub fn addmod(&self, other: &SymBitVec, modulus: &SymBitVec) -> SymBitVec {
        self.wide_mod(BinOp::Add, other, modulus)
    }

    /// (self * other) % modulus computed without wrapping; zero modulus gives zero
    pub fn mulmod(&self, other: &SymBitVec, modulus: &SymBitVec) -> SymBitVec {
        self.wide_mod(BinOp::Mul, other, modulus)
    }

    fn wide_mod(&self, op: BinOp, other: &SymBitVec, modulus: &SymBitVec) -> SymBitVec {
        let size = self.size();
        let wide = size * 2;
        let a = self.zero_ext(size);
        let b = other.zero_ext(size);
        let m = modulus.zero_ext(size);
        debug_assert_eq!(a.size(), wide);
        a.bin(op, &b).urem(&m).extract(size - 1, 0)
    }

    /// self ** exponent by square-and-multiply; the exponent must be known
    pub fn exp(&self, exponent: &BigUint) -> SymBitVec {
        let size = self.size();
        if let Some(base) = self.as_biguint() {
            let modulus = BigUint::one() << size as usize;
            return Self::from_biguint(base.modpow(exponent, &modulus), size);
        }
        let mut result = Self::from_u64(1, size);
        let mut base = self.clone();
        for i in 0..exponent.bits() {
            if exponent.bit(i) {
                result = result.mul(&base);
            }
            if i + 1 < exponent.bits() {
                base = base.mul(&base);
            }
        }
        result
    }

    pub fn bitwise_and(&self, other: &SymBitVec) -> SymBitVec {
        self.bin(BinOp::And, other)
    }

    pub fn bitwise_or(&self, other: &SymBitVec) -> SymBitVec {
        self.bin(BinOp::Or, other)
    }

    pub fn bitwise_xor(&self, other: &SymBitVec) -> SymBitVec {
        self.bin(BinOp::Xor, other)
    }

    pub fn bitwise_not(&self) -> SymBitVec {
        match self.as_biguint() {
            Some(v) => Self::from_biguint(v ^ mask(self.size()), self.size()),
            None => Self::from_term(Term::bitwise_not(self.to_term())),
        }
    }

    /// self << shift
    pub fn shl(&self, shift: &SymBitVec) -> SymBitVec {
        self.bin(BinOp::Shl, shift)
    }

    /// self >> shift, logical
    pub fn lshr(&self, shift: &SymBitVec) -> SymBitVec {
        self.bin(BinOp::LShr, shift)
    }

    /// self >> shift, arithmetic
    pub fn ashr(&self, shift: &SymBitVec) -> SymBitVec {
        self.bin(BinOp::AShr, shift)
    }

    /// EVM BYTE: the `index`-th most significant byte, zero when out of range
    pub fn byte(&self, index: &SymBitVec) -> SymBitVec {
        let size = self.size();
        let bytes = u64::from(size / 8);
        if let Some(i) = index.as_biguint() {
            return match i.to_u64().filter(|i| *i < bytes) {
                Some(i) => {
                    let lo = ((bytes - 1 - i) * 8) as u32;
                    self.extract(lo + 7, lo).zero_ext(size - 8)
                }
                None => Self::zero(size),
            };
        }
        let shift = Self::from_u64(bytes - 1, size)
            .sub(index)
            .mul(&Self::from_u64(8, size));
        let selected = self
            .lshr(&shift)
            .bitwise_and(&Self::from_u64(0xff, size));
        Self::ite(
            &index.ult(&Self::from_u64(bytes, size)),
            &selected,
            &Self::zero(size),
        )
    }

    /// EVM SIGNEXTEND from byte `index` (0 = least significant)
    pub fn signextend(&self, index: u64) -> SymBitVec {
        let size = self.size();
        if index >= u64::from(size / 8) - 1 {
            return self.clone();
        }
        let bits = ((index + 1) * 8) as u32;
        if let Some(v) = self.as_biguint() {
            let low = normalize_biguint(v.clone(), bits);
            let signed = to_signed_bigint(&low, bits);
            return Self::from_biguint(bigint_to_twos_complement(&signed, size), size);
        }
        self.extract(bits - 1, 0).sign_ext(size - bits)
    }

    pub fn equals(&self, other: &SymBitVec) -> SymBool {
        self.cmp(CmpOp::Eq, other)
    }

    pub fn not_equals(&self, other: &SymBitVec) -> SymBool {
        self.equals(other).negate()
    }

    pub fn ult(&self, other: &SymBitVec) -> SymBool {
        self.cmp(CmpOp::Ult, other)
    }

    pub fn ule(&self, other: &SymBitVec) -> SymBool {
        self.cmp(CmpOp::Ule, other)
    }

    pub fn ugt(&self, other: &SymBitVec) -> SymBool {
        other.ult(self)
    }

    pub fn uge(&self, other: &SymBitVec) -> SymBool {
        other.ule(self)
    }

    pub fn slt(&self, other: &SymBitVec) -> SymBool {
        self.cmp(CmpOp::Slt, other)
    }

    pub fn sgt(&self, other: &SymBitVec) -> SymBool {
        other.slt(self)
    }

    pub fn is_zero(&self) -> SymBool {
        self.equals(&Self::zero(self.size()))
    }

    pub fn ite(cond: &SymBool, then: &SymBitVec, otherwise: &SymBitVec) -> SymBitVec {
        match cond {
            SymBool::Concrete(true) => then.clone(),
            SymBool::Concrete(false) => otherwise.clone(),
            SymBool::Symbolic(c) => {
                Self::from_term(Term::ite(c.clone(), then.to_term(), otherwise.to_term()))
            }
        }
    }

    pub fn extract(&self, hi: u32, lo: u32) -> SymBitVec {
        match self.as_biguint() {
            Some(v) => Self::from_biguint(v >> lo as usize, hi - lo + 1),
            None => Self::from_term(Term::extract(hi, lo, self.to_term())),
        }
    }

    /// Concatenate, most significant part first
    pub fn concat(parts: &[SymBitVec]) -> SymBitVec {
        if parts.iter().all(|p| p.is_concrete()) {
            let mut value = BigUint::zero();
            let mut size = 0;
            for part in parts {
                value = (value << part.size() as usize) | part.as_biguint().cloned().unwrap_or_default();
                size += part.size();
            }
            return Self::from_biguint(value, size);
        }
        Self::from_term(Term::concat(parts.iter().map(|p| p.to_term()).collect()))
    }

    pub fn zero_ext(&self, by: u32) -> SymBitVec {
        match self {
            SymBitVec::Concrete { value, size } => Self::from_biguint(value.clone(), size + by),
            SymBitVec::Symbolic { term, .. } => Self::from_term(Term::zero_ext(by, term.clone())),
        }
    }

    pub fn sign_ext(&self, by: u32) -> SymBitVec {
        Self::from_term(Term::sign_ext(by, self.to_term()))
    }

    /// keccak256 of the value's big-endian bytes; the width must be whole bytes
    pub fn keccak(&self) -> SymBitVec {
        Self::from_term(Term::keccak(self.to_term()))
    }

    pub fn eval(&self, model: &Model) -> Option<BigUint> {
        match self {
            SymBitVec::Concrete { value, .. } => Some(value.clone()),
            SymBitVec::Symbolic { term, .. } => term.eval(model),
        }
    }

    pub fn collect_decls(&self, decls: &mut Decls) {
        if let SymBitVec::Symbolic { term, .. } = self {
            term.collect_decls(decls);
        }
    }
}

impl fmt::Display for SymBitVec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SymBitVec::Concrete { value, .. } => write!(f, "0x{:x}", value),
            SymBitVec::Symbolic { term, .. } => write!(f, "{}", term),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn w(value: u64) -> SymBitVec {
        SymBitVec::word(value)
    }

    fn max() -> SymBitVec {
        SymBitVec::from_biguint(mask(256), 256)
    }

    #[test]
    fn test_evm_division_by_zero() {
        assert_eq!(w(7).udiv(&w(0)), w(0));
        assert_eq!(w(7).urem(&w(0)), w(0));
        assert_eq!(w(7).sdiv(&w(0)), w(0));
        assert_eq!(w(7).udiv(&w(2)), w(3));

        let x = SymBitVec::var("x", 256);
        let guarded = w(10).udiv(&x);
        let mut model = Model::new();
        model.insert("x".to_string(), BigUint::zero());
        assert_eq!(guarded.eval(&model), Some(BigUint::zero()));
        model.insert("x".to_string(), BigUint::from(3u8));
        assert_eq!(guarded.eval(&model), Some(BigUint::from(3u8)));
    }

    #[test]
    fn test_wrapping_arithmetic() {
        assert_eq!(max().add(&w(1)), w(0));
        assert_eq!(w(0).sub(&w(1)), max());
    }

    #[test]
    fn test_addmod_mulmod_do_not_wrap() {
        assert_eq!(max().addmod(&w(1), &w(7)), w(2));
        assert_eq!(max().mulmod(&max(), &w(12)), w(9));
        assert_eq!(w(5).addmod(&w(5), &w(0)), w(0));
    }

    #[test]
    fn test_exp() {
        assert_eq!(w(2).exp(&BigUint::from(10u8)), w(1024));
        assert_eq!(w(2).exp(&BigUint::from(256u16)), w(0));
        let x = SymBitVec::var("x", 256);
        let cube = x.exp(&BigUint::from(3u8));
        let mut model = Model::new();
        model.insert("x".to_string(), BigUint::from(3u8));
        assert_eq!(cube.eval(&model), Some(BigUint::from(27u8)));
    }

    #[test]
    fn test_byte_and_signextend() {
        let v = SymBitVec::from_biguint(BigUint::from(0xabcdu32), 256);
        assert_eq!(v.byte(&w(31)), w(0xcd));
        assert_eq!(v.byte(&w(30)), w(0xab));
        assert_eq!(v.byte(&w(32)), w(0));
        assert_eq!(w(0xff).signextend(0), max());
        assert_eq!(w(0x7f).signextend(0), w(0x7f));
        assert_eq!(w(0xff).signextend(31), w(0xff));
    }

    #[test]
    fn test_symbolic_byte_matches_concrete() {
        let i = SymBitVec::var("i", 256);
        let v = SymBitVec::from_biguint(BigUint::from(0xabcdu32), 256);
        let selected = v.byte(&i);
        let mut model = Model::new();
        model.insert("i".to_string(), BigUint::from(30u8));
        assert_eq!(selected.eval(&model), Some(BigUint::from(0xabu8)));
        model.insert("i".to_string(), BigUint::from(40u8));
        assert_eq!(selected.eval(&model), Some(BigUint::zero()));
    }

    #[test]
    fn test_signed_comparisons() {
        assert_eq!(max().slt(&w(0)), SymBool::Concrete(true));
        assert_eq!(max().ult(&w(0)), SymBool::Concrete(false));
        assert_eq!(w(1).sgt(&max()), SymBool::Concrete(true));
    }

    #[test]
    fn test_symbolic_stays_symbolic() {
        let x = SymBitVec::var("x", 256);
        let y = x.add(&w(1));
        assert!(y.is_symbolic());
        assert_eq!(y.sub(&w(1)), x);
        assert_eq!(x.equals(&x), SymBool::Concrete(true));
    }

    #[test]
    fn test_bool_to_bitvec() {
        let x = SymBitVec::var("x", 256);
        let flag = x.is_zero().to_bitvec(256);
        assert_eq!(flag.is_zero(), x.is_zero().negate());
    }
}
