// SPDX-License-Identifier: AGPL-3.0

//! Expression terms
//!
//! Terms are immutable and shared through `Rc`. Every constructor folds
//! constants and applies a handful of local identities, so a term built only
//! from constants is always a `Term::Const`.

use num_bigint::{BigInt, BigUint, Sign};
use num_traits::{One, ToPrimitive, Zero};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::rc::Rc;

use evmsym_hashes::keccak256;

/// Concrete assignment of variable names to values
pub type Model = HashMap<String, BigUint>;

pub(crate) fn mask(bit_size: u32) -> BigUint {
    if bit_size == 0 {
        BigUint::zero()
    } else {
        (BigUint::one() << bit_size as usize) - BigUint::one()
    }
}

pub(crate) fn normalize_biguint(value: BigUint, bit_size: u32) -> BigUint {
    value & mask(bit_size)
}

pub(crate) fn to_signed_bigint(value: &BigUint, bit_size: u32) -> BigInt {
    if bit_size == 0 {
        return BigInt::zero();
    }
    let sign_bit = BigUint::one() << (bit_size as usize - 1);
    if value < &sign_bit {
        BigInt::from(value.clone())
    } else {
        let modulus = BigUint::one() << bit_size as usize;
        BigInt::from_biguint(Sign::Minus, modulus - value)
    }
}

pub(crate) fn bigint_to_twos_complement(value: &BigInt, bit_size: u32) -> BigUint {
    let modulus = BigUint::one() << bit_size as usize;
    match value.sign() {
        Sign::NoSign => BigUint::zero(),
        Sign::Plus => normalize_biguint(value.magnitude().clone(), bit_size),
        Sign::Minus => {
            let magnitude = normalize_biguint(value.magnitude().clone(), bit_size);
            if magnitude.is_zero() {
                BigUint::zero()
            } else {
                modulus - magnitude
            }
        }
    }
}

fn msb(value: &BigUint, bit_size: u32) -> bool {
    bit_size > 0 && value.bit(bit_size as u64 - 1)
}

fn negate(value: &BigUint, bit_size: u32) -> BigUint {
    normalize_biguint((BigUint::one() << bit_size as usize) - value, bit_size)
}

/// Shift amount as usize, or None when it is at least the width
fn shift_amount(amount: &BigUint, bit_size: u32) -> Option<usize> {
    amount
        .to_usize()
        .filter(|shift| *shift < bit_size as usize)
}

/// Binary bitvector operators, with SMT-LIB semantics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    UDiv,
    URem,
    SDiv,
    SRem,
    And,
    Or,
    Xor,
    Shl,
    LShr,
    AShr,
}

impl BinOp {
    pub fn smt_name(&self) -> &'static str {
        match self {
            BinOp::Add => "bvadd",
            BinOp::Sub => "bvsub",
            BinOp::Mul => "bvmul",
            BinOp::UDiv => "bvudiv",
            BinOp::URem => "bvurem",
            BinOp::SDiv => "bvsdiv",
            BinOp::SRem => "bvsrem",
            BinOp::And => "bvand",
            BinOp::Or => "bvor",
            BinOp::Xor => "bvxor",
            BinOp::Shl => "bvshl",
            BinOp::LShr => "bvlshr",
            BinOp::AShr => "bvashr",
        }
    }

    fn is_commutative(&self) -> bool {
        matches!(
            self,
            BinOp::Add | BinOp::Mul | BinOp::And | BinOp::Or | BinOp::Xor
        )
    }

    /// Evaluate on normalized operands of `bit_size` bits.
    ///
    /// Division by zero follows SMT-LIB: `bvudiv` yields all ones and
    /// `bvurem` yields the dividend.
    pub fn apply(&self, a: &BigUint, b: &BigUint, bit_size: u32) -> BigUint {
        match self {
            BinOp::Add => normalize_biguint(a + b, bit_size),
            BinOp::Sub => normalize_biguint(a + negate(b, bit_size), bit_size),
            BinOp::Mul => normalize_biguint(a * b, bit_size),
            BinOp::UDiv => {
                if b.is_zero() {
                    mask(bit_size)
                } else {
                    a / b
                }
            }
            BinOp::URem => {
                if b.is_zero() {
                    a.clone()
                } else {
                    a % b
                }
            }
            BinOp::SDiv => {
                let udiv = |x: &BigUint, y: &BigUint| BinOp::UDiv.apply(x, y, bit_size);
                match (msb(a, bit_size), msb(b, bit_size)) {
                    (false, false) => udiv(a, b),
                    (true, false) => negate(&udiv(&negate(a, bit_size), b), bit_size),
                    (false, true) => negate(&udiv(a, &negate(b, bit_size)), bit_size),
                    (true, true) => udiv(&negate(a, bit_size), &negate(b, bit_size)),
                }
            }
            BinOp::SRem => {
                let urem = |x: &BigUint, y: &BigUint| BinOp::URem.apply(x, y, bit_size);
                match (msb(a, bit_size), msb(b, bit_size)) {
                    (false, false) => urem(a, b),
                    (true, false) => negate(&urem(&negate(a, bit_size), b), bit_size),
                    (false, true) => urem(a, &negate(b, bit_size)),
                    (true, true) => negate(&urem(&negate(a, bit_size), &negate(b, bit_size)), bit_size),
                }
            }
            BinOp::And => a & b,
            BinOp::Or => a | b,
            BinOp::Xor => a ^ b,
            BinOp::Shl => match shift_amount(b, bit_size) {
                Some(shift) => normalize_biguint(a << shift, bit_size),
                None => BigUint::zero(),
            },
            BinOp::LShr => match shift_amount(b, bit_size) {
                Some(shift) => a >> shift,
                None => BigUint::zero(),
            },
            BinOp::AShr => {
                let negative = msb(a, bit_size);
                match shift_amount(b, bit_size) {
                    Some(shift) if negative => {
                        let high = mask(bit_size) ^ mask(bit_size - shift as u32);
                        (a >> shift) | high
                    }
                    Some(shift) => a >> shift,
                    None if negative => mask(bit_size),
                    None => BigUint::zero(),
                }
            }
        }
    }
}

/// Bitvector comparison operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CmpOp {
    Eq,
    Ult,
    Ule,
    Slt,
    Sle,
}

impl CmpOp {
    pub fn smt_name(&self) -> &'static str {
        match self {
            CmpOp::Eq => "=",
            CmpOp::Ult => "bvult",
            CmpOp::Ule => "bvule",
            CmpOp::Slt => "bvslt",
            CmpOp::Sle => "bvsle",
        }
    }

    pub fn apply(&self, a: &BigUint, b: &BigUint, bit_size: u32) -> bool {
        match self {
            CmpOp::Eq => a == b,
            CmpOp::Ult => a < b,
            CmpOp::Ule => a <= b,
            CmpOp::Slt => to_signed_bigint(a, bit_size) < to_signed_bigint(b, bit_size),
            CmpOp::Sle => to_signed_bigint(a, bit_size) <= to_signed_bigint(b, bit_size),
        }
    }
}

/// A bitvector-valued term
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Term {
    Const(BigUint, u32),
    Var(String, u32),
    Not(Rc<Term>),
    Bin(BinOp, Rc<Term>, Rc<Term>),
    Ite(Rc<BoolTerm>, Rc<Term>, Rc<Term>),
    /// Bits `hi..=lo` of the operand
    Extract(u32, u32, Rc<Term>),
    /// Most significant part first
    Concat(Vec<Rc<Term>>),
    ZeroExt(u32, Rc<Term>),
    SignExt(u32, Rc<Term>),
    /// keccak256 of the operand's big-endian bytes
    Keccak(Rc<Term>),
}

/// A boolean-valued term
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BoolTerm {
    Const(bool),
    Not(Rc<BoolTerm>),
    And(Rc<BoolTerm>, Rc<BoolTerm>),
    Or(Rc<BoolTerm>, Rc<BoolTerm>),
    Cmp(CmpOp, Rc<Term>, Rc<Term>),
}

/// Free symbols referenced by a set of terms
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Decls {
    pub vars: BTreeMap<String, u32>,
    pub keccak_widths: BTreeSet<u32>,
}

fn same(a: &Rc<Term>, b: &Rc<Term>) -> bool {
    Rc::ptr_eq(a, b) || a == b
}

impl Term {
    pub fn constant(value: BigUint, size: u32) -> Rc<Term> {
        Rc::new(Term::Const(normalize_biguint(value, size), size))
    }

    pub fn var(name: impl Into<String>, size: u32) -> Rc<Term> {
        Rc::new(Term::Var(name.into(), size))
    }

    pub fn size(&self) -> u32 {
        match self {
            Term::Const(_, size) | Term::Var(_, size) => *size,
            Term::Not(arg) => arg.size(),
            Term::Bin(_, lhs, _) => lhs.size(),
            Term::Ite(_, then, _) => then.size(),
            Term::Extract(hi, lo, _) => hi - lo + 1,
            Term::Concat(parts) => parts.iter().map(|p| p.size()).sum(),
            Term::ZeroExt(by, arg) | Term::SignExt(by, arg) => by + arg.size(),
            Term::Keccak(_) => 256,
        }
    }

    pub fn as_const(&self) -> Option<&BigUint> {
        match self {
            Term::Const(value, _) => Some(value),
            _ => None,
        }
    }

    pub fn bitwise_not(arg: Rc<Term>) -> Rc<Term> {
        match &*arg {
            Term::Const(value, size) => Term::constant(value ^ mask(*size), *size),
            Term::Not(inner) => inner.clone(),
            _ => Rc::new(Term::Not(arg)),
        }
    }

    pub fn bin(op: BinOp, lhs: Rc<Term>, rhs: Rc<Term>) -> Rc<Term> {
        let size = lhs.size();
        if let (Some(a), Some(b)) = (lhs.as_const(), rhs.as_const()) {
            return Term::constant(op.apply(a, b, size), size);
        }

        // keep constants on the right of commutative operators
        let (lhs, rhs) = if op.is_commutative() && lhs.as_const().is_some() {
            (rhs, lhs)
        } else {
            (lhs, rhs)
        };

        if let Some(c) = rhs.as_const() {
            let zero = c.is_zero();
            let one = c.is_one();
            let ones = *c == mask(size);
            match op {
                BinOp::Add | BinOp::Sub | BinOp::Or | BinOp::Xor if zero => return lhs,
                BinOp::Shl | BinOp::LShr | BinOp::AShr if zero => return lhs,
                BinOp::Mul | BinOp::And if zero => return Term::constant(BigUint::zero(), size),
                BinOp::Mul | BinOp::UDiv | BinOp::SDiv if one => return lhs,
                BinOp::And if ones => return lhs,
                BinOp::Or if ones => return rhs,
                _ => {}
            }

            // (x + c1) + c2, (x - c1) - c2 and their mixes collapse to one constant
            if let Term::Bin(inner_op, x, c1) = &*lhs {
                if let Some(c1) = c1.as_const() {
                    let folded = match (inner_op, op) {
                        (BinOp::Add, BinOp::Add) | (BinOp::Sub, BinOp::Sub) => {
                            Some((*inner_op, BinOp::Add.apply(c1, c, size)))
                        }
                        (BinOp::Add, BinOp::Sub) => Some((BinOp::Add, BinOp::Sub.apply(c1, c, size))),
                        (BinOp::Sub, BinOp::Add) => Some((BinOp::Sub, BinOp::Sub.apply(c1, c, size))),
                        _ => None,
                    };
                    if let Some((folded_op, value)) = folded {
                        return Term::bin(folded_op, x.clone(), Term::constant(value, size));
                    }
                }
            }
        }

        if same(&lhs, &rhs) {
            match op {
                BinOp::Sub | BinOp::Xor => return Term::constant(BigUint::zero(), size),
                BinOp::And | BinOp::Or => return lhs,
                _ => {}
            }
        }

        Rc::new(Term::Bin(op, lhs, rhs))
    }

    pub fn ite(cond: Rc<BoolTerm>, then: Rc<Term>, otherwise: Rc<Term>) -> Rc<Term> {
        match &*cond {
            BoolTerm::Const(true) => then,
            BoolTerm::Const(false) => otherwise,
            _ if same(&then, &otherwise) => then,
            BoolTerm::Not(inner) => Rc::new(Term::Ite(inner.clone(), otherwise, then)),
            _ => Rc::new(Term::Ite(cond, then, otherwise)),
        }
    }

    pub fn extract(hi: u32, lo: u32, arg: Rc<Term>) -> Rc<Term> {
        let size = arg.size();
        if lo == 0 && hi + 1 == size {
            return arg;
        }
        let width = hi - lo + 1;
        match &*arg {
            Term::Const(value, _) => Term::constant(value >> lo as usize, width),
            Term::Extract(_, inner_lo, inner) => {
                Term::extract(hi + inner_lo, lo + inner_lo, inner.clone())
            }
            Term::Concat(parts) => {
                let mut offset = size;
                for part in parts {
                    let part_size = part.size();
                    offset -= part_size;
                    if lo >= offset && hi < offset + part_size {
                        return Term::extract(hi - offset, lo - offset, part.clone());
                    }
                }
                Rc::new(Term::Extract(hi, lo, arg))
            }
            Term::ZeroExt(_, inner) => {
                let inner_size = inner.size();
                if hi < inner_size {
                    Term::extract(hi, lo, inner.clone())
                } else if lo >= inner_size {
                    Term::constant(BigUint::zero(), width)
                } else {
                    Rc::new(Term::Extract(hi, lo, arg))
                }
            }
            Term::Ite(cond, then, otherwise)
                if then.as_const().is_some() && otherwise.as_const().is_some() =>
            {
                Term::ite(
                    cond.clone(),
                    Term::extract(hi, lo, then.clone()),
                    Term::extract(hi, lo, otherwise.clone()),
                )
            }
            _ => Rc::new(Term::Extract(hi, lo, arg)),
        }
    }

    pub fn concat(parts: Vec<Rc<Term>>) -> Rc<Term> {
        let mut merged: Vec<Rc<Term>> = Vec::with_capacity(parts.len());
        let mut flat = Vec::with_capacity(parts.len());
        for part in parts {
            match &*part {
                Term::Concat(inner) => flat.extend(inner.iter().cloned()),
                _ => flat.push(part),
            }
        }

        for part in flat {
            let joined = merged.last().and_then(|prev| match (&**prev, &*part) {
                (Term::Const(a, a_size), Term::Const(b, b_size)) => Some(Term::constant(
                    (a << *b_size as usize) | b,
                    a_size + b_size,
                )),
                (Term::Extract(hi, lo, x), Term::Extract(hi2, lo2, y))
                    if *lo == hi2 + 1 && same(x, y) =>
                {
                    Some(Term::extract(*hi, *lo2, x.clone()))
                }
                _ => None,
            });
            match joined {
                Some(term) => {
                    merged.pop();
                    merged.push(term);
                }
                None => merged.push(part),
            }
        }

        if merged.len() == 1 {
            merged.remove(0)
        } else {
            Rc::new(Term::Concat(merged))
        }
    }

    pub fn zero_ext(by: u32, arg: Rc<Term>) -> Rc<Term> {
        if by == 0 {
            return arg;
        }
        match &*arg {
            Term::Const(value, size) => Term::constant(value.clone(), size + by),
            _ => Rc::new(Term::ZeroExt(by, arg)),
        }
    }

    pub fn sign_ext(by: u32, arg: Rc<Term>) -> Rc<Term> {
        if by == 0 {
            return arg;
        }
        match &*arg {
            Term::Const(value, size) => {
                let signed = to_signed_bigint(value, *size);
                Rc::new(Term::Const(bigint_to_twos_complement(&signed, size + by), size + by))
            }
            _ => Rc::new(Term::SignExt(by, arg)),
        }
    }

    pub fn keccak(arg: Rc<Term>) -> Rc<Term> {
        match &*arg {
            Term::Const(value, size) => {
                let digest = keccak256(&be_bytes(value, (*size / 8) as usize));
                Term::constant(BigUint::from_bytes_be(&digest), 256)
            }
            _ => Rc::new(Term::Keccak(arg)),
        }
    }

    /// Evaluate under a model; None when a referenced variable is unassigned
    pub fn eval(&self, model: &Model) -> Option<BigUint> {
        let size = self.size();
        Some(match self {
            Term::Const(value, _) => value.clone(),
            Term::Var(name, size) => normalize_biguint(model.get(name)?.clone(), *size),
            Term::Not(arg) => arg.eval(model)? ^ mask(size),
            Term::Bin(op, lhs, rhs) => op.apply(&lhs.eval(model)?, &rhs.eval(model)?, size),
            Term::Ite(cond, then, otherwise) => {
                if cond.eval(model)? {
                    then.eval(model)?
                } else {
                    otherwise.eval(model)?
                }
            }
            Term::Extract(_, lo, arg) => {
                normalize_biguint(arg.eval(model)? >> *lo as usize, size)
            }
            Term::Concat(parts) => {
                let mut acc = BigUint::zero();
                for part in parts {
                    acc = (acc << part.size() as usize) | part.eval(model)?;
                }
                acc
            }
            Term::ZeroExt(_, arg) => arg.eval(model)?,
            Term::SignExt(_, arg) => {
                let signed = to_signed_bigint(&arg.eval(model)?, arg.size());
                bigint_to_twos_complement(&signed, size)
            }
            Term::Keccak(arg) => {
                let input = be_bytes(&arg.eval(model)?, (arg.size() / 8) as usize);
                BigUint::from_bytes_be(&keccak256(&input))
            }
        })
    }

    pub fn collect_decls(&self, decls: &mut Decls) {
        match self {
            Term::Const(..) => {}
            Term::Var(name, size) => {
                decls.vars.insert(name.clone(), *size);
            }
            Term::Not(arg)
            | Term::Extract(_, _, arg)
            | Term::ZeroExt(_, arg)
            | Term::SignExt(_, arg) => arg.collect_decls(decls),
            Term::Bin(_, lhs, rhs) => {
                lhs.collect_decls(decls);
                rhs.collect_decls(decls);
            }
            Term::Ite(cond, then, otherwise) => {
                cond.collect_decls(decls);
                then.collect_decls(decls);
                otherwise.collect_decls(decls);
            }
            Term::Concat(parts) => parts.iter().for_each(|p| p.collect_decls(decls)),
            Term::Keccak(arg) => {
                decls.keccak_widths.insert(arg.size());
                arg.collect_decls(decls);
            }
        }
    }

    pub fn write_smt(&self, out: &mut String) {
        match self {
            Term::Const(value, size) => out.push_str(&format!("(_ bv{} {})", value, size)),
            Term::Var(name, _) => {
                out.push('|');
                out.push_str(name);
                out.push('|');
            }
            Term::Not(arg) => write_app(out, "bvnot", &[arg]),
            Term::Bin(op, lhs, rhs) => write_app(out, op.smt_name(), &[lhs, rhs]),
            Term::Ite(cond, then, otherwise) => {
                out.push_str("(ite ");
                cond.write_smt(out);
                out.push(' ');
                then.write_smt(out);
                out.push(' ');
                otherwise.write_smt(out);
                out.push(')');
            }
            Term::Extract(hi, lo, arg) => {
                write_app(out, &format!("(_ extract {} {})", hi, lo), &[arg])
            }
            Term::Concat(parts) => {
                // SMT-LIB concat is binary; nest to the right
                for part in &parts[..parts.len() - 1] {
                    out.push_str("(concat ");
                    part.write_smt(out);
                    out.push(' ');
                }
                if let Some(last) = parts.last() {
                    last.write_smt(out);
                }
                for _ in 1..parts.len() {
                    out.push(')');
                }
            }
            Term::ZeroExt(by, arg) => write_app(out, &format!("(_ zero_extend {})", by), &[arg]),
            Term::SignExt(by, arg) => write_app(out, &format!("(_ sign_extend {})", by), &[arg]),
            Term::Keccak(arg) => write_app(out, &keccak_fun_name(arg.size()), &[arg]),
        }
    }

    pub fn to_smt(&self) -> String {
        let mut out = String::new();
        self.write_smt(&mut out);
        out
    }
}

fn write_app(out: &mut String, head: &str, args: &[&Rc<Term>]) {
    out.push('(');
    out.push_str(head);
    for arg in args {
        out.push(' ');
        arg.write_smt(out);
    }
    out.push(')');
}

/// Name of the uninterpreted keccak function for inputs of `width` bits
pub fn keccak_fun_name(width: u32) -> String {
    format!("keccak_{}", width)
}

/// Big-endian bytes of `value`, left-padded to `len`
pub fn be_bytes(value: &BigUint, len: usize) -> Vec<u8> {
    let bytes = value.to_bytes_be();
    if value.is_zero() {
        return vec![0u8; len];
    }
    if bytes.len() >= len {
        return bytes[bytes.len() - len..].to_vec();
    }
    let mut padded = vec![0u8; len - bytes.len()];
    padded.extend_from_slice(&bytes);
    padded
}

impl BoolTerm {
    pub fn constant(value: bool) -> Rc<BoolTerm> {
        Rc::new(BoolTerm::Const(value))
    }

    pub fn as_const(&self) -> Option<bool> {
        match self {
            BoolTerm::Const(value) => Some(*value),
            _ => None,
        }
    }

    pub fn cmp(op: CmpOp, lhs: Rc<Term>, rhs: Rc<Term>) -> Rc<BoolTerm> {
        let size = lhs.size();
        if let (Some(a), Some(b)) = (lhs.as_const(), rhs.as_const()) {
            return BoolTerm::constant(op.apply(a, b, size));
        }
        if same(&lhs, &rhs) {
            return BoolTerm::constant(matches!(op, CmpOp::Eq | CmpOp::Ule | CmpOp::Sle));
        }
        if op == CmpOp::Eq {
            // ite(c, k1, k2) == k decides on c alone
            let (ite, k) = if rhs.as_const().is_some() {
                (&lhs, &rhs)
            } else {
                (&rhs, &lhs)
            };
            if let (Term::Ite(cond, then, otherwise), Some(k)) = (&**ite, k.as_const()) {
                if let (Some(t), Some(e)) = (then.as_const(), otherwise.as_const()) {
                    return match (t == k, e == k) {
                        (true, true) => BoolTerm::constant(true),
                        (true, false) => cond.clone(),
                        (false, true) => BoolTerm::not(cond.clone()),
                        (false, false) => BoolTerm::constant(false),
                    };
                }
            }
        }
        Rc::new(BoolTerm::Cmp(op, lhs, rhs))
    }

    pub fn not(arg: Rc<BoolTerm>) -> Rc<BoolTerm> {
        match &*arg {
            BoolTerm::Const(value) => BoolTerm::constant(!value),
            BoolTerm::Not(inner) => inner.clone(),
            _ => Rc::new(BoolTerm::Not(arg)),
        }
    }

    pub fn and(lhs: Rc<BoolTerm>, rhs: Rc<BoolTerm>) -> Rc<BoolTerm> {
        match (lhs.as_const(), rhs.as_const()) {
            (Some(false), _) | (_, Some(false)) => BoolTerm::constant(false),
            (Some(true), _) => rhs,
            (_, Some(true)) => lhs,
            _ if lhs == rhs => lhs,
            _ => Rc::new(BoolTerm::And(lhs, rhs)),
        }
    }

    pub fn or(lhs: Rc<BoolTerm>, rhs: Rc<BoolTerm>) -> Rc<BoolTerm> {
        match (lhs.as_const(), rhs.as_const()) {
            (Some(true), _) | (_, Some(true)) => BoolTerm::constant(true),
            (Some(false), _) => rhs,
            (_, Some(false)) => lhs,
            _ if lhs == rhs => lhs,
            _ => Rc::new(BoolTerm::Or(lhs, rhs)),
        }
    }

    pub fn eval(&self, model: &Model) -> Option<bool> {
        match self {
            BoolTerm::Const(value) => Some(*value),
            BoolTerm::Not(arg) => arg.eval(model).map(|v| !v),
            BoolTerm::And(lhs, rhs) => match lhs.eval(model) {
                Some(false) => Some(false),
                Some(true) => rhs.eval(model),
                None => match rhs.eval(model) {
                    Some(false) => Some(false),
                    _ => None,
                },
            },
            BoolTerm::Or(lhs, rhs) => match lhs.eval(model) {
                Some(true) => Some(true),
                Some(false) => rhs.eval(model),
                None => match rhs.eval(model) {
                    Some(true) => Some(true),
                    _ => None,
                },
            },
            BoolTerm::Cmp(op, lhs, rhs) => {
                Some(op.apply(&lhs.eval(model)?, &rhs.eval(model)?, lhs.size()))
            }
        }
    }

    pub fn collect_decls(&self, decls: &mut Decls) {
        match self {
            BoolTerm::Const(_) => {}
            BoolTerm::Not(arg) => arg.collect_decls(decls),
            BoolTerm::And(lhs, rhs) | BoolTerm::Or(lhs, rhs) => {
                lhs.collect_decls(decls);
                rhs.collect_decls(decls);
            }
            BoolTerm::Cmp(_, lhs, rhs) => {
                lhs.collect_decls(decls);
                rhs.collect_decls(decls);
            }
        }
    }

    pub fn write_smt(&self, out: &mut String) {
        match self {
            BoolTerm::Const(value) => out.push_str(if *value { "true" } else { "false" }),
            BoolTerm::Not(arg) => {
                out.push_str("(not ");
                arg.write_smt(out);
                out.push(')');
            }
            BoolTerm::And(lhs, rhs) | BoolTerm::Or(lhs, rhs) => {
                out.push_str(if matches!(self, BoolTerm::And(..)) {
                    "(and "
                } else {
                    "(or "
                });
                lhs.write_smt(out);
                out.push(' ');
                rhs.write_smt(out);
                out.push(')');
            }
            BoolTerm::Cmp(op, lhs, rhs) => write_app(out, op.smt_name(), &[lhs, rhs]),
        }
    }

    pub fn to_smt(&self) -> String {
        let mut out = String::new();
        self.write_smt(&mut out);
        out
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_smt())
    }
}

impl fmt::Display for BoolTerm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_smt())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn c(value: u64) -> Rc<Term> {
        Term::constant(BigUint::from(value), 256)
    }

    #[test]
    fn test_sub_chain_collapses() {
        let gas = Term::var("gas", 256);
        let t = Term::bin(BinOp::Sub, Term::bin(BinOp::Sub, gas.clone(), c(3)), c(5));
        assert_eq!(t, Term::bin(BinOp::Sub, gas.clone(), c(8)));
        let t = Term::bin(BinOp::Add, Term::bin(BinOp::Sub, gas.clone(), c(8)), c(8));
        assert_eq!(t, gas);
    }

    #[test]
    fn test_signed_division_matches_smtlib() {
        let minus_six = BinOp::Sub.apply(&BigUint::zero(), &BigUint::from(6u8), 8);
        let two = BigUint::from(2u8);
        let minus_three = BinOp::Sub.apply(&BigUint::zero(), &BigUint::from(3u8), 8);
        assert_eq!(BinOp::SDiv.apply(&minus_six, &two, 8), minus_three);
        assert_eq!(BinOp::SRem.apply(&minus_six, &BigUint::from(4u8), 8), BigUint::from(254u8));
        assert_eq!(BinOp::UDiv.apply(&two, &BigUint::zero(), 8), BigUint::from(255u8));
    }

    #[test]
    fn test_ashr() {
        let v = BigUint::from(0x80u8);
        assert_eq!(BinOp::AShr.apply(&v, &BigUint::from(4u8), 8), BigUint::from(0xf8u8));
        assert_eq!(BinOp::AShr.apply(&v, &BigUint::from(9u8), 8), BigUint::from(0xffu8));
        assert_eq!(BinOp::LShr.apply(&v, &BigUint::from(9u8), 8), BigUint::zero());
    }

    #[test]
    fn test_concat_of_extracts_restores_word() {
        let word = Term::var("w", 256);
        let bytes: Vec<_> = (0..32u32)
            .rev()
            .map(|i| Term::extract(i * 8 + 7, i * 8, word.clone()))
            .collect();
        assert_eq!(Term::concat(bytes), word);
    }

    #[test]
    fn test_extract_through_concat() {
        let x = Term::var("x", 8);
        let y = Term::var("y", 8);
        let xy = Term::concat(vec![x.clone(), y.clone()]);
        assert_eq!(Term::extract(15, 8, xy.clone()), x);
        assert_eq!(Term::extract(7, 0, xy), y);
    }

    #[test]
    fn test_ite_equality_decides_on_condition() {
        let cond = BoolTerm::cmp(CmpOp::Ult, Term::var("a", 256), c(10));
        let as_word = Term::ite(cond.clone(), c(1), c(0));
        assert_eq!(BoolTerm::cmp(CmpOp::Eq, as_word.clone(), c(1)), cond);
        assert_eq!(BoolTerm::cmp(CmpOp::Eq, as_word, c(0)), BoolTerm::not(cond));
    }

    #[test]
    fn test_eval_and_keccak() {
        let mut model = Model::new();
        model.insert("x".to_string(), BigUint::zero());
        let hashed = Term::keccak(Term::var("x", 256));
        let folded = Term::keccak(c(0));
        assert_eq!(hashed.eval(&model), folded.as_const().cloned());
        assert!(Term::var("missing", 256).eval(&model).is_none());
    }

    #[test]
    fn test_smt_rendering() {
        let t = Term::bin(BinOp::Add, Term::var("x", 8), Term::constant(BigUint::from(1u8), 8));
        assert_eq!(t.to_smt(), "(bvadd |x| (_ bv1 8))");
        let k = Term::keccak(Term::var("y", 64));
        let mut decls = Decls::default();
        k.collect_decls(&mut decls);
        assert_eq!(decls.vars.get("y"), Some(&64));
        assert!(decls.keccak_widths.contains(&64));
        assert_eq!(k.to_smt(), "(keccak_64 |y|)");
    }
}
