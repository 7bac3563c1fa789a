//! Values, symbol tables, settings and error causes shared by the assembler and the executor.

use alloc::collections::BTreeMap;
use alloc::rc::Rc;
use alloc::vec::Vec;

use core::cell::RefCell;
use core::cmp::Ordering;
use core::fmt;

#[cfg(feature = "serde")]
use serde::{Serialize, Deserialize};

use compact_str::{CompactString, ToCompactString};

use crate::procedure::Procedure;
use crate::util::modulus;

/// The type of a [`Value`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Type {
    None, Bool, Int, Float, Str, Tuple, List, Iterator, Procedure,
}
impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Type::None => "NoneType",
            Type::Bool => "bool",
            Type::Int => "int",
            Type::Float => "float",
            Type::Str => "str",
            Type::Tuple => "tuple",
            Type::List => "list",
            Type::Iterator => "iterator",
            Type::Procedure => "procedure",
        })
    }
}

/// A binary operation shared by constant expressions and the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Pow, Mul, Mod, Add, Sub, FloorDiv, TrueDiv,
    LShift, RShift, And, Xor, Or,
}
impl BinaryOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Pow => "**",
            BinaryOp::Mul => "*",
            BinaryOp::Mod => "%",
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::FloorDiv => "//",
            BinaryOp::TrueDiv => "/",
            BinaryOp::LShift => "<<",
            BinaryOp::RShift => ">>",
            BinaryOp::And => "&",
            BinaryOp::Xor => "^",
            BinaryOp::Or => "|",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Pos, Neg, Not, Invert,
}
impl UnaryOp {
    pub fn symbol(self) -> &'static str {
        match self {
            UnaryOp::Pos => "+",
            UnaryOp::Neg => "-",
            UnaryOp::Not => "not",
            UnaryOp::Invert => "~",
        }
    }
}

/// A comparison operation, in the order of [`CMP_OPS`](crate::opcode::CMP_OPS).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Less, LessEq, Equal, NotEqual, Greater, GreaterEq,
}
impl CompareOp {
    pub fn from_index(index: u32) -> Option<Self> {
        Some(match index {
            0 => CompareOp::Less,
            1 => CompareOp::LessEq,
            2 => CompareOp::Equal,
            3 => CompareOp::NotEqual,
            4 => CompareOp::Greater,
            5 => CompareOp::GreaterEq,
            _ => return None,
        })
    }
}

/// The cause/explanation of an evaluation or execution error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorCause {
    /// A name lookup failed in every visible scope.
    UndefinedVariable { name: CompactString },
    /// A local slot was read before being assigned.
    UnboundLocal { name: CompactString },
    /// A free slot was read before being assigned.
    UnboundFree { name: CompactString },
    /// A value had a different type than was required.
    ConversionError { got: Type, expected: Type },
    /// A binary operation was applied to unsupported operand types.
    BinaryOperands { op: BinaryOp, left: Type, right: Type },
    /// A unary operation was applied to an unsupported operand type.
    UnaryOperand { op: UnaryOp, got: Type },
    /// An ordering comparison between incomparable types.
    Incomparable { left: Type, right: Type },
    ZeroDivision,
    /// An integer result did not fit in 64 bits, or a repetition would exceed [`MAX_REPEAT_LEN`].
    Overflow,
    NegativeShift,
    IndexOutOfBounds { index: i64, len: usize },
    /// A sequence unpack received the wrong number of values.
    UnpackLength { expected: usize, got: usize },
    NotIterable { got: Type },
    NotCallable { got: Type },
    /// A procedure was called with the wrong number of arguments.
    ArgCount { expected: usize, got: usize },
    /// Exceeded the maximum call depth.
    CallDepthLimit { limit: usize },
    /// An instruction popped from an empty value stack.
    StackUnderflow,
    /// The value stack grew beyond the declared stack size of the compiled unit.
    StackOverflow { limit: usize },
    /// The code contained a byte which is not a known opcode.
    BadOpcode { byte: u8 },
    /// An instruction operand referenced a pool slot that does not exist.
    BadPoolIndex { index: usize, len: usize },
    /// Execution ran off the end of the code without returning.
    EndOfCode,
    /// A non-generator call reached a yield point.
    UnexpectedYield,
    /// The namespace which defined a procedure no longer exists.
    DetachedNamespace,
    /// Attempt to use an unsupported feature.
    NotSupported { feature: &'static str },
}
impl fmt::Display for ErrorCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCause::UndefinedVariable { name } => write!(f, "name '{name}' is not defined"),
            ErrorCause::UnboundLocal { name } => write!(f, "local variable '{name}' referenced before assignment"),
            ErrorCause::UnboundFree { name } => write!(f, "free variable '{name}' referenced before assignment"),
            ErrorCause::ConversionError { got, expected } => write!(f, "expected {expected}, got {got}"),
            ErrorCause::BinaryOperands { op, left, right } => write!(f, "unsupported operand types for {}: {left} and {right}", op.symbol()),
            ErrorCause::UnaryOperand { op, got } => write!(f, "bad operand type for unary {}: {got}", op.symbol()),
            ErrorCause::Incomparable { left, right } => write!(f, "cannot order {left} and {right}"),
            ErrorCause::ZeroDivision => write!(f, "division by zero"),
            ErrorCause::Overflow => write!(f, "result too large"),
            ErrorCause::NegativeShift => write!(f, "negative shift count"),
            ErrorCause::IndexOutOfBounds { index, len } => write!(f, "index {index} out of range for length {len}"),
            ErrorCause::UnpackLength { expected, got } => write!(f, "expected {expected} values to unpack, got {got}"),
            ErrorCause::NotIterable { got } => write!(f, "{got} is not iterable"),
            ErrorCause::NotCallable { got } => write!(f, "{got} is not callable"),
            ErrorCause::ArgCount { expected, got } => write!(f, "expected {expected} arguments, got {got}"),
            ErrorCause::CallDepthLimit { limit } => write!(f, "exceeded the maximum call depth of {limit}"),
            ErrorCause::StackUnderflow => write!(f, "pop from empty stack"),
            ErrorCause::StackOverflow { limit } => write!(f, "value stack exceeded declared size {limit}"),
            ErrorCause::BadOpcode { byte } => write!(f, "unknown opcode {byte}"),
            ErrorCause::BadPoolIndex { index, len } => write!(f, "pool index {index} out of range for pool of {len}"),
            ErrorCause::EndOfCode => write!(f, "execution ran past the end of the code"),
            ErrorCause::UnexpectedYield => write!(f, "yield outside of a generator call"),
            ErrorCause::DetachedNamespace => write!(f, "the defining namespace no longer exists"),
            ErrorCause::NotSupported { feature } => write!(f, "{feature} is not supported"),
        }
    }
}

/// A runtime iterator over a snapshot of a sequence.
#[derive(Debug)]
pub struct SeqIter {
    items: Vec<Value>,
    pos: usize,
}
impl Iterator for SeqIter {
    type Item = Value;
    fn next(&mut self) -> Option<Value> {
        let res = self.items.get(self.pos).cloned();
        if res.is_some() { self.pos += 1; }
        res
    }
}

/// Any value that can be held in a constant pool, a symbol table or the value stack.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(CompactString),
    Tuple(Vec<Value>),
    List(Vec<Value>),
    #[cfg_attr(feature = "serde", serde(skip))]
    Iterator(Rc<RefCell<SeqIter>>),
    #[cfg_attr(feature = "serde", serde(skip))]
    Procedure(Rc<Procedure>),
}
impl From<bool> for Value { fn from(v: bool) -> Self { Value::Bool(v) } }
impl From<i64> for Value { fn from(v: i64) -> Self { Value::Int(v) } }
impl From<f64> for Value { fn from(v: f64) -> Self { Value::Float(v) } }
impl From<&str> for Value { fn from(v: &str) -> Self { Value::Str(v.into()) } }
impl From<CompactString> for Value { fn from(v: CompactString) -> Self { Value::Str(v) } }

#[derive(Clone, Copy)]
enum Num {
    Int(i64),
    Float(f64),
}
impl Num {
    fn to_f64(self) -> f64 {
        match self {
            Num::Int(x) => x as f64,
            Num::Float(x) => x,
        }
    }
}

fn floor_div(a: i64, b: i64) -> Result<i64, ErrorCause> {
    if b == 0 { return Err(ErrorCause::ZeroDivision); }
    let q = a.checked_div(b).ok_or(ErrorCause::Overflow)?;
    Ok(if a % b != 0 && ((a < 0) != (b < 0)) { q - 1 } else { q })
}
fn floor_mod(a: i64, b: i64) -> Result<i64, ErrorCause> {
    if b == 0 { return Err(ErrorCause::ZeroDivision); }
    let r = a.checked_rem(b).unwrap_or(0);
    Ok(if r != 0 && ((r < 0) != (b < 0)) { r + b } else { r })
}
fn shift_left(a: i64, b: i64) -> Result<i64, ErrorCause> {
    if b < 0 { return Err(ErrorCause::NegativeShift); }
    if a == 0 { return Ok(0); }
    if b >= 64 { return Err(ErrorCause::Overflow); }
    let res = a << b;
    if res >> b != a { return Err(ErrorCause::Overflow); }
    Ok(res)
}
fn shift_right(a: i64, b: i64) -> Result<i64, ErrorCause> {
    if b < 0 { return Err(ErrorCause::NegativeShift); }
    Ok(if b >= 64 { if a < 0 { -1 } else { 0 } } else { a >> b })
}

/// Longest string (in bytes) or sequence (in items) that repetition may produce.
pub const MAX_REPEAT_LEN: usize = 1 << 24;

/// Clamps a repetition count for a sequence of length `len`, failing if the result would exceed [`MAX_REPEAT_LEN`].
fn repeat_count(len: usize, count: i64) -> Result<usize, ErrorCause> {
    if len == 0 || count <= 0 { return Ok(0); }
    match usize::try_from(count).ok().and_then(|x| x.checked_mul(len)) {
        Some(total) if total <= MAX_REPEAT_LEN => Ok(total / len),
        _ => Err(ErrorCause::Overflow),
    }
}
fn repeat(items: &[Value], count: i64) -> Result<Vec<Value>, ErrorCause> {
    let count = repeat_count(items.len(), count)?;
    let mut res = Vec::with_capacity(items.len() * count);
    for _ in 0..count {
        res.extend_from_slice(items);
    }
    Ok(res)
}

impl Value {
    pub fn get_type(&self) -> Type {
        match self {
            Value::None => Type::None,
            Value::Bool(_) => Type::Bool,
            Value::Int(_) => Type::Int,
            Value::Float(_) => Type::Float,
            Value::Str(_) => Type::Str,
            Value::Tuple(_) => Type::Tuple,
            Value::List(_) => Type::List,
            Value::Iterator(_) => Type::Iterator,
            Value::Procedure(_) => Type::Procedure,
        }
    }
    fn as_num(&self) -> Option<Num> {
        match self {
            Value::Bool(x) => Some(Num::Int(*x as i64)),
            Value::Int(x) => Some(Num::Int(*x)),
            Value::Float(x) => Some(Num::Float(*x)),
            _ => None,
        }
    }
    /// Interprets the value as an integer (bools included).
    pub fn as_int(&self) -> Result<i64, ErrorCause> {
        match self {
            Value::Bool(x) => Ok(*x as i64),
            Value::Int(x) => Ok(*x),
            x => Err(ErrorCause::ConversionError { got: x.get_type(), expected: Type::Int }),
        }
    }
    pub fn as_str(&self) -> Result<&str, ErrorCause> {
        match self {
            Value::Str(x) => Ok(x),
            x => Err(ErrorCause::ConversionError { got: x.get_type(), expected: Type::Str }),
        }
    }
    /// Interprets the value as a tuple (or list) of items.
    pub fn as_seq(&self) -> Result<&[Value], ErrorCause> {
        match self {
            Value::Tuple(x) | Value::List(x) => Ok(x),
            x => Err(ErrorCause::ConversionError { got: x.get_type(), expected: Type::Tuple }),
        }
    }
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::None => false,
            Value::Bool(x) => *x,
            Value::Int(x) => *x != 0,
            Value::Float(x) => *x != 0.0,
            Value::Str(x) => !x.is_empty(),
            Value::Tuple(x) | Value::List(x) => !x.is_empty(),
            Value::Iterator(_) | Value::Procedure(_) => true,
        }
    }
    /// Checks if two values are indistinguishable: the same type and the same value,
    /// with floats compared by bit pattern. This is the equality used for constant pool slots
    /// and for the identity test of `IS_OP`.
    pub fn is_identical(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::None, Value::None) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Tuple(a), Value::Tuple(b)) => a.len() == b.len() && a.iter().zip(b.iter()).all(|(a, b)| a.is_identical(b)),
            (Value::Iterator(a), Value::Iterator(b)) => Rc::ptr_eq(a, b),
            (Value::Procedure(a), Value::Procedure(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
    /// Value equality (`==`), where numbers compare across int, float and bool.
    pub fn equals(&self, other: &Value) -> bool {
        if let (Some(a), Some(b)) = (self.as_num(), other.as_num()) {
            return match (a, b) {
                (Num::Int(a), Num::Int(b)) => a == b,
                (a, b) => a.to_f64() == b.to_f64(),
            };
        }
        match (self, other) {
            (Value::None, Value::None) => true,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Tuple(a), Value::Tuple(b)) | (Value::List(a), Value::List(b)) => a.len() == b.len() && a.iter().zip(b.iter()).all(|(a, b)| a.equals(b)),
            (Value::Iterator(a), Value::Iterator(b)) => Rc::ptr_eq(a, b),
            (Value::Procedure(a), Value::Procedure(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
    fn ordering(&self, other: &Value) -> Result<Option<Ordering>, ErrorCause> {
        if let (Some(a), Some(b)) = (self.as_num(), other.as_num()) {
            return Ok(match (a, b) {
                (Num::Int(a), Num::Int(b)) => Some(a.cmp(&b)),
                (a, b) => a.to_f64().partial_cmp(&b.to_f64()),
            });
        }
        match (self, other) {
            (Value::Str(a), Value::Str(b)) => Ok(Some(a.cmp(b))),
            (Value::Tuple(a), Value::Tuple(b)) | (Value::List(a), Value::List(b)) => {
                for (a, b) in a.iter().zip(b.iter()) {
                    if !a.equals(b) { return a.ordering(b); }
                }
                Ok(Some(a.len().cmp(&b.len())))
            }
            (a, b) => Err(ErrorCause::Incomparable { left: a.get_type(), right: b.get_type() }),
        }
    }
    pub fn compare(&self, op: CompareOp, other: &Value) -> Result<bool, ErrorCause> {
        Ok(match op {
            CompareOp::Equal => self.equals(other),
            CompareOp::NotEqual => !self.equals(other),
            CompareOp::Less => self.ordering(other)? == Some(Ordering::Less),
            CompareOp::LessEq => matches!(self.ordering(other)?, Some(Ordering::Less | Ordering::Equal)),
            CompareOp::Greater => self.ordering(other)? == Some(Ordering::Greater),
            CompareOp::GreaterEq => matches!(self.ordering(other)?, Some(Ordering::Greater | Ordering::Equal)),
        })
    }
    pub fn unary_op(&self, op: UnaryOp) -> Result<Value, ErrorCause> {
        let bad = || ErrorCause::UnaryOperand { op, got: self.get_type() };
        Ok(match op {
            UnaryOp::Not => Value::Bool(!self.is_truthy()),
            UnaryOp::Pos => match self.as_num().ok_or_else(bad)? {
                Num::Int(x) => Value::Int(x),
                Num::Float(x) => Value::Float(x),
            }
            UnaryOp::Neg => match self.as_num().ok_or_else(bad)? {
                Num::Int(x) => Value::Int(x.checked_neg().ok_or(ErrorCause::Overflow)?),
                Num::Float(x) => Value::Float(-x),
            }
            UnaryOp::Invert => match self.as_num().ok_or_else(bad)? {
                Num::Int(x) => Value::Int(!x),
                Num::Float(_) => return Err(bad()),
            }
        })
    }
    pub fn binary_op(&self, op: BinaryOp, other: &Value) -> Result<Value, ErrorCause> {
        let bad = || ErrorCause::BinaryOperands { op, left: self.get_type(), right: other.get_type() };

        match (op, self, other) {
            (BinaryOp::Add, Value::Str(a), Value::Str(b)) => {
                let mut res = a.clone();
                res.push_str(b);
                return Ok(Value::Str(res));
            }
            (BinaryOp::Add, Value::Tuple(a), Value::Tuple(b)) => return Ok(Value::Tuple(a.iter().chain(b.iter()).cloned().collect())),
            (BinaryOp::Add, Value::List(a), Value::List(b)) => return Ok(Value::List(a.iter().chain(b.iter()).cloned().collect())),
            (BinaryOp::Mul, Value::Str(s), n) | (BinaryOp::Mul, n, Value::Str(s)) if matches!(n, Value::Int(_) | Value::Bool(_)) => {
                return Ok(Value::Str(s.repeat(repeat_count(s.len(), n.as_int()?)?).into()));
            }
            (BinaryOp::Mul, Value::Tuple(s), n) | (BinaryOp::Mul, n, Value::Tuple(s)) if matches!(n, Value::Int(_) | Value::Bool(_)) => {
                return Ok(Value::Tuple(repeat(s, n.as_int()?)?));
            }
            (BinaryOp::Mul, Value::List(s), n) | (BinaryOp::Mul, n, Value::List(s)) if matches!(n, Value::Int(_) | Value::Bool(_)) => {
                return Ok(Value::List(repeat(s, n.as_int()?)?));
            }
            _ => (),
        }

        let (a, b) = match (self.as_num(), other.as_num()) {
            (Some(a), Some(b)) => (a, b),
            _ => return Err(bad()),
        };
        Ok(match (a, b) {
            (Num::Int(a), Num::Int(b)) => match op {
                BinaryOp::Add => Value::Int(a.checked_add(b).ok_or(ErrorCause::Overflow)?),
                BinaryOp::Sub => Value::Int(a.checked_sub(b).ok_or(ErrorCause::Overflow)?),
                BinaryOp::Mul => Value::Int(a.checked_mul(b).ok_or(ErrorCause::Overflow)?),
                BinaryOp::FloorDiv => Value::Int(floor_div(a, b)?),
                BinaryOp::Mod => Value::Int(floor_mod(a, b)?),
                BinaryOp::TrueDiv => {
                    if b == 0 { return Err(ErrorCause::ZeroDivision); }
                    Value::Float(a as f64 / b as f64)
                }
                BinaryOp::Pow => match u32::try_from(b) {
                    Ok(b) => Value::Int(a.checked_pow(b).ok_or(ErrorCause::Overflow)?),
                    Err(_) if b < 0 => {
                        if a == 0 { return Err(ErrorCause::ZeroDivision); }
                        Value::Float(libm::pow(a as f64, b as f64))
                    }
                    Err(_) => return Err(ErrorCause::Overflow),
                }
                BinaryOp::LShift => Value::Int(shift_left(a, b)?),
                BinaryOp::RShift => Value::Int(shift_right(a, b)?),
                BinaryOp::And => Value::Int(a & b),
                BinaryOp::Xor => Value::Int(a ^ b),
                BinaryOp::Or => Value::Int(a | b),
            }
            (a, b) => {
                let (a, b) = (a.to_f64(), b.to_f64());
                match op {
                    BinaryOp::Add => Value::Float(a + b),
                    BinaryOp::Sub => Value::Float(a - b),
                    BinaryOp::Mul => Value::Float(a * b),
                    BinaryOp::TrueDiv => {
                        if b == 0.0 { return Err(ErrorCause::ZeroDivision); }
                        Value::Float(a / b)
                    }
                    BinaryOp::FloorDiv => {
                        if b == 0.0 { return Err(ErrorCause::ZeroDivision); }
                        Value::Float(libm::floor(a / b))
                    }
                    BinaryOp::Mod => {
                        if b == 0.0 { return Err(ErrorCause::ZeroDivision); }
                        Value::Float(modulus(a, b))
                    }
                    BinaryOp::Pow => {
                        if a == 0.0 && b < 0.0 { return Err(ErrorCause::ZeroDivision); }
                        Value::Float(libm::pow(a, b))
                    }
                    BinaryOp::LShift | BinaryOp::RShift | BinaryOp::And | BinaryOp::Xor | BinaryOp::Or => return Err(bad()),
                }
            }
        })
    }
    /// Indexes into a sequence, counting negative indices from the end.
    pub fn subscript(&self, index: &Value) -> Result<Value, ErrorCause> {
        let index = index.as_int()?;
        let get = |len: usize| -> Result<usize, ErrorCause> {
            let real = if index < 0 { index + len as i64 } else { index };
            if real < 0 || real >= len as i64 { return Err(ErrorCause::IndexOutOfBounds { index, len }); }
            Ok(real as usize)
        };
        match self {
            Value::Tuple(x) | Value::List(x) => Ok(x[get(x.len())?].clone()),
            Value::Str(x) => {
                let len = x.chars().count();
                let ch = x.chars().nth(get(len)?).unwrap_or_default();
                Ok(Value::Str(ch.to_compact_string()))
            }
            x => Err(ErrorCause::ConversionError { got: x.get_type(), expected: Type::Tuple }),
        }
    }
    /// Collects the items of an iterable value.
    pub fn items(&self) -> Result<Vec<Value>, ErrorCause> {
        match self {
            Value::Tuple(x) | Value::List(x) => Ok(x.clone()),
            Value::Str(x) => Ok(x.chars().map(|c| Value::Str(c.to_compact_string())).collect()),
            Value::Iterator(x) => Ok(x.borrow_mut().by_ref().collect()),
            x => Err(ErrorCause::NotIterable { got: x.get_type() }),
        }
    }
    pub fn contains(&self, item: &Value) -> Result<bool, ErrorCause> {
        match (self, item) {
            (Value::Str(s), Value::Str(sub)) => Ok(s.contains(sub.as_str())),
            (Value::Str(_), x) => Err(ErrorCause::ConversionError { got: x.get_type(), expected: Type::Str }),
            (Value::Tuple(x) | Value::List(x), item) => Ok(x.iter().any(|x| x.is_identical(item) || x.equals(item))),
            (x, _) => Err(ErrorCause::NotIterable { got: x.get_type() }),
        }
    }
    /// Creates a fresh iterator over the value (iterators are returned as-is).
    pub fn iter(&self) -> Result<Value, ErrorCause> {
        match self {
            Value::Iterator(_) => Ok(self.clone()),
            x => Ok(Value::Iterator(Rc::new(RefCell::new(SeqIter { items: x.items()?, pos: 0 })))),
        }
    }
}

fn write_seq(f: &mut fmt::Formatter<'_>, items: &[Value], open: &str, close: &str, trailing_comma: bool) -> fmt::Result {
    f.write_str(open)?;
    for (i, item) in items.iter().enumerate() {
        if i != 0 { f.write_str(", ")?; }
        write!(f, "{item}")?;
    }
    if trailing_comma && items.len() == 1 { f.write_str(",")?; }
    f.write_str(close)
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::None => f.write_str("None"),
            Value::Bool(true) => f.write_str("True"),
            Value::Bool(false) => f.write_str("False"),
            Value::Int(x) => write!(f, "{x}"),
            Value::Float(x) => {
                if x.is_nan() { return f.write_str("nan"); }
                if x.is_infinite() { return f.write_str(if *x > 0.0 { "inf" } else { "-inf" }); }
                f.write_str(ryu::Buffer::new().format_finite(*x))
            }
            Value::Str(x) => {
                f.write_str("'")?;
                for c in x.chars() {
                    match c {
                        '\'' => f.write_str("\\'")?,
                        '\\' => f.write_str("\\\\")?,
                        '\n' => f.write_str("\\n")?,
                        '\t' => f.write_str("\\t")?,
                        '\r' => f.write_str("\\r")?,
                        c => write!(f, "{c}")?,
                    }
                }
                f.write_str("'")
            }
            Value::Tuple(x) => write_seq(f, x, "(", ")", true),
            Value::List(x) => write_seq(f, x, "[", "]", false),
            Value::Iterator(_) => f.write_str("<iterator>"),
            Value::Procedure(x) => write!(f, "<procedure {}>", x.name()),
        }
    }
}

/// A table of named values.
#[derive(Debug, Clone, Default)]
pub struct SymbolTable(BTreeMap<CompactString, Value>);
impl SymbolTable {
    /// Defines or redefines a symbol, returning the previous value (if any).
    pub fn define(&mut self, name: &str, value: Value) -> Option<Value> {
        self.0.insert(name.into(), value)
    }
    pub fn lookup(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }
    pub fn lookup_mut(&mut self, name: &str) -> Option<&mut Value> {
        self.0.get_mut(name)
    }
    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.0.remove(name)
    }
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }
    pub fn len(&self) -> usize {
        self.0.len()
    }
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
impl<'a> FromIterator<(&'a str, Value)> for SymbolTable {
    fn from_iter<I: IntoIterator<Item = (&'a str, Value)>>(iter: I) -> Self {
        let mut res = SymbolTable::default();
        for (k, v) in iter {
            res.define(k, v);
        }
        res
    }
}

/// A chain of symbol tables searched front to back.
pub struct LookupGroup<'a>(pub &'a [&'a SymbolTable]);
impl LookupGroup<'_> {
    pub fn lookup(&self, name: &str) -> Option<&Value> {
        self.0.iter().find_map(|src| src.lookup(name))
    }
}

/// How the assembler treats [`UnsafeBytecode`](crate::bytecode::UnsafeBytecode) diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnsafePolicy {
    /// Refuse to produce a procedure if any diagnostic was raised.
    #[default]
    Error,
    /// Log each diagnostic as a warning and continue.
    Warn,
    /// Keep the diagnostics in the report but say nothing.
    Ignore,
}

/// Settings used when assembling and running procedures.
#[derive(Debug, Clone, Copy)]
pub struct Settings {
    /// Treatment of stack-balance diagnostics (default [`UnsafePolicy::Error`]).
    pub unsafe_policy: UnsafePolicy,
    /// The maximum depth of nested procedure calls (default `256`).
    pub max_call_depth: usize,
    /// Whether the executor rejects pushing past the declared stack size of a compiled unit (default `true`).
    pub enforce_stack_size: bool,
}
impl Default for Settings {
    fn default() -> Self {
        Self {
            unsafe_policy: UnsafePolicy::Error,
            max_call_depth: 256,
            enforce_stack_size: true,
        }
    }
}

#[test]
fn test_value_arithmetic() {
    assert!(Value::Int(7).binary_op(BinaryOp::FloorDiv, &Value::Int(-2)).unwrap().is_identical(&Value::Int(-4)));
    assert!(Value::Int(-7).binary_op(BinaryOp::Mod, &Value::Int(3)).unwrap().is_identical(&Value::Int(2)));
    match Value::Int(2).binary_op(BinaryOp::Pow, &Value::Float(0.5)).unwrap() {
        Value::Float(x) => assert!((x - core::f64::consts::SQRT_2).abs() < 1e-15),
        x => panic!("{x:?}"),
    }
    assert!(Value::Int(1).binary_op(BinaryOp::TrueDiv, &Value::Int(2)).unwrap().is_identical(&Value::Float(0.5)));
    assert_eq!(Value::Int(i64::MAX).binary_op(BinaryOp::Add, &Value::Int(1)).unwrap_err(), ErrorCause::Overflow);
    assert_eq!(Value::Int(1).binary_op(BinaryOp::Mod, &Value::Int(0)).unwrap_err(), ErrorCause::ZeroDivision);
    assert_eq!(Value::Int(1).binary_op(BinaryOp::LShift, &Value::Int(-1)).unwrap_err(), ErrorCause::NegativeShift);
    assert!(Value::from("ab").binary_op(BinaryOp::Mul, &Value::Int(2)).unwrap().is_identical(&Value::from("abab")));
    assert!(Value::Int(-3).binary_op(BinaryOp::Mul, &Value::from("ab")).unwrap().is_identical(&Value::from("")));
    assert_eq!(Value::from("ab").binary_op(BinaryOp::Mul, &Value::Int(1 << 62)).unwrap_err(), ErrorCause::Overflow);
    assert_eq!(Value::from("ab").binary_op(BinaryOp::Mul, &Value::Int(MAX_REPEAT_LEN as i64)).unwrap_err(), ErrorCause::Overflow);
    assert_eq!(Value::Tuple(alloc::vec![Value::Int(1), Value::Int(2)]).binary_op(BinaryOp::Mul, &Value::Int(1 << 62)).unwrap_err(), ErrorCause::Overflow);
    assert_eq!(Value::Int(i64::MAX).binary_op(BinaryOp::Mul, &Value::List(alloc::vec![Value::None])).unwrap_err(), ErrorCause::Overflow);
    assert!(Value::Tuple(alloc::vec![]).binary_op(BinaryOp::Mul, &Value::Int(i64::MAX)).unwrap().is_identical(&Value::Tuple(alloc::vec![])));
    assert!(Value::from("").binary_op(BinaryOp::Mul, &Value::Int(i64::MAX)).unwrap().is_identical(&Value::from("")));
    assert!(Value::List(alloc::vec![Value::Int(0)]).binary_op(BinaryOp::Mul, &Value::Bool(true)).unwrap().is_identical(&Value::List(alloc::vec![Value::Int(0)])));
    assert_eq!(Value::None.binary_op(BinaryOp::Add, &Value::Int(1)).unwrap_err(), ErrorCause::BinaryOperands { op: BinaryOp::Add, left: Type::None, right: Type::Int });
}

#[test]
fn test_value_identity() {
    use alloc::vec;

    assert!(Value::Int(1).equals(&Value::Float(1.0)));
    assert!(Value::Int(1).equals(&Value::Bool(true)));
    assert!(!Value::Int(1).is_identical(&Value::Float(1.0)));
    assert!(!Value::Int(1).is_identical(&Value::Bool(true)));
    assert!(!Value::Float(0.0).is_identical(&Value::Float(-0.0)));
    assert!(Value::Float(f64::NAN).is_identical(&Value::Float(f64::NAN)));
    assert!(Value::Tuple(vec![Value::Int(1), Value::None]).is_identical(&Value::Tuple(vec![Value::Int(1), Value::None])));
}

#[test]
fn test_value_display() {
    use alloc::string::ToString;
    use alloc::vec;

    assert_eq!(Value::Float(2.0).to_string(), "2.0");
    assert_eq!(Value::Float(core::f64::consts::SQRT_2).to_string(), "1.4142135623730951");
    assert_eq!(Value::from("it's").to_string(), "'it\\'s'");
    assert_eq!(Value::Tuple(vec![Value::Int(1)]).to_string(), "(1,)");
    assert_eq!(Value::List(vec![Value::Int(1), Value::None]).to_string(), "[1, None]");
    assert_eq!(Value::Bool(false).to_string(), "False");
}
