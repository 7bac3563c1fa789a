//! The two-pass assembler which turns a [`ProcedureDecl`] listing into an executable [`CodeUnit`].
//!
//! Pass 1 builds the symbol pools and the label table, pass 2 encodes the instruction stream.
//! The finished stream is then analyzed for stack balance, and the derived metadata
//! (flags, stack size, line table) can be overridden by option statements before finalization.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use core::fmt;

#[cfg(feature = "std")]
use std::io::{self, Write};

#[cfg(feature = "serde")]
use serde::{Serialize, Deserialize};

use compact_str::{CompactString, ToCompactString};
use monostate::MustBeU64;
use num_traits::FromPrimitive;
use superslice::Ext;

use crate::expr::Expr;
use crate::meta::FINGERPRINT;
use crate::opcode::*;
use crate::runtime::*;
use crate::source::*;

/// Number of bytes to display on each line of a hex dump
#[cfg(feature = "std")]
const BYTES_PER_LINE: usize = 8;

/// Names of the options that may be assigned in a listing, in the order they are seeded.
pub const OPTIONS: &[&str] = &["FLAGS", "STACK_SIZE", "NAMES", "CONSTS", "VARNAMES", "FREEVARS"];

/// An error produced while assembling a procedure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssembleError {
    UnknownOpcode { opcode: CompactString, line: u32 },
    /// An undefined label, or a name undefined in every scope during evaluation.
    Resolution { symbol: CompactString, index: usize, line: u32 },
    /// An operand had the wrong form or type for the operand class of its opcode.
    BadOperand { opcode: Opcode, expected: &'static str, got: CompactString, index: usize, line: u32 },
    /// A raw operand did not fit in an unsigned 32-bit integer.
    OperandRange { opcode: Opcode, value: i64, index: usize, line: u32 },
    /// A relative jump targeted a label at or before itself.
    BackwardRelativeJump { opcode: Opcode, label: CompactString, index: usize, line: u32 },
    DuplicateLabel { label: CompactString, line: u32 },
    UnknownOption { name: CompactString, line: u32 },
    OptionType { name: CompactString, expected: &'static str, got: Type, line: u32 },
    /// An expression failed to evaluate for a reason other than an undefined name.
    Eval { cause: ErrorCause, line: u32 },
    /// Stack-balance diagnostics under [`UnsafePolicy::Error`].
    UnsafeBytecode { warnings: Vec<UnsafeBytecode> },
}
impl fmt::Display for AssembleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AssembleError::UnknownOpcode { opcode, line } => write!(f, "line {line}: unknown opcode {opcode}"),
            AssembleError::Resolution { symbol, index, line } => write!(f, "line {line}: could not resolve '{symbol}' in instruction {index}"),
            AssembleError::BadOperand { opcode, expected, got, index, line } => write!(f, "line {line}: {} (instruction {index}) expected {expected}, got {got}", opcode.name()),
            AssembleError::OperandRange { opcode, value, index, line } => write!(f, "line {line}: operand {value} of {} (instruction {index}) is out of range", opcode.name()),
            AssembleError::BackwardRelativeJump { opcode, label, index, line } => write!(f, "line {line}: {} (instruction {index}) cannot jump backwards to {label}", opcode.name()),
            AssembleError::DuplicateLabel { label, line } => write!(f, "line {line}: label {label} is already defined"),
            AssembleError::UnknownOption { name, line } => write!(f, "line {line}: unknown option {name}"),
            AssembleError::OptionType { name, expected, got, line } => write!(f, "line {line}: option {name} expected {expected}, got {got}"),
            AssembleError::Eval { cause, line } => write!(f, "line {line}: {cause}"),
            AssembleError::UnsafeBytecode { warnings } => {
                write!(f, "unsafe bytecode")?;
                for warning in warnings {
                    write!(f, "\n    {warning}")?;
                }
                Ok(())
            }
        }
    }
}
#[cfg(feature = "std")]
impl std::error::Error for AssembleError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnsafeKind {
    EmptyStackPop,
    NonZeroBeforeJump,
    UnknownOpcode,
}

/// An advisory stack-balance diagnostic from [`stack_depth`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsafeBytecode {
    pub kind: UnsafeKind,
    /// Code-unit index of the offending instruction.
    pub index: usize,
    /// Code-unit index of the jump whose target path was being walked, if any.
    pub branch: Option<usize>,
    pub opcode: u8,
    pub arg: u32,
}
impl fmt::Display for UnsafeBytecode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self.kind {
            UnsafeKind::EmptyStackPop => "possible pop from empty stack",
            UnsafeKind::NonZeroBeforeJump => "non-zero stack effect before jump",
            UnsafeKind::UnknownOpcode => "unknown opcode",
        };
        let name = Opcode::from_u8(self.opcode).map(Opcode::name).unwrap_or("<unknown>");
        match self.branch {
            Some(from) => write!(f, "{msg}: [{from}->{}] {name} {}", self.index, self.arg),
            None => write!(f, "{msg}: [{}] {name} {}", self.index, self.arg),
        }
    }
}

/// Reads the instruction starting at code unit `pos`, folding any `EXTENDED_ARG` prefixes into its operand.
/// Returns the opcode, the operand and the code unit just after the instruction.
/// A trailing prefix with nothing after it is returned as-is.
pub fn read_instruction(code: &[u8], pos: usize) -> Result<(Opcode, u32, usize), u8> {
    let mut arg = 0u32;
    let mut pos = pos;
    loop {
        let byte = code[pos * CODE_UNIT];
        let op = Opcode::from_u8(byte).ok_or(byte)?;
        arg = (arg << 8) | code[pos * CODE_UNIT + 1] as u32;
        pos += 1;
        if op != Opcode::EXTENDED_ARG || pos * CODE_UNIT >= code.len() {
            return Ok((op, arg, pos));
        }
    }
}

/// Computes the jump target (in code units) of a jump at code unit `index`.
pub fn jump_target(op: Opcode, index: usize, arg: u32) -> usize {
    match op.operand_class() {
        OperandClass::RelJump => index + 1 + arg as usize,
        _ => arg as usize,
    }
}

/// Simulates the stack effects of a code stream, returning its peak depth and any diagnostics.
///
/// The main walk goes through every code unit in order.
/// Each jump additionally walks the fall-through path from its target to the end of the stream,
/// starting from the depth at the jump; these branch walks contribute to the peak as well.
/// Unknown opcode bytes have no stack effect and are only reported by the main walk.
pub fn stack_depth(code: &[u8]) -> (u32, Vec<UnsafeBytecode>) {
    let mut units = Vec::with_capacity(code.len() / CODE_UNIT);
    let mut ext = 0u32;
    for unit in code.chunks_exact(CODE_UNIT) {
        let arg = (ext << 8) | unit[1] as u32;
        ext = if unit[0] == Opcode::EXTENDED_ARG as u8 { arg } else { 0 };
        units.push((unit[0], Opcode::from_u8(unit[0]), arg));
    }

    let mut warnings = Vec::new();
    let mut peak = 0i64;
    let mut current = 0i64;
    for (i, &(byte, op, arg)) in units.iter().enumerate() {
        let op = match op {
            Some(x) => x,
            None => {
                warnings.push(UnsafeBytecode { kind: UnsafeKind::UnknownOpcode, index: i, branch: None, opcode: byte, arg });
                continue;
            }
        };

        current += op.stack_effect(arg) as i64;
        peak = peak.max(current);
        if current < 0 {
            warnings.push(UnsafeBytecode { kind: UnsafeKind::EmptyStackPop, index: i, branch: None, opcode: byte, arg });
        }
        if !op.is_jump() { continue; }

        if current != 0 {
            warnings.push(UnsafeBytecode { kind: UnsafeKind::NonZeroBeforeJump, index: i, branch: None, opcode: byte, arg });
        }
        let target = jump_target(op, i, arg);
        let mut branch = current;
        for (j, &(byte, op, arg)) in units.iter().enumerate().skip(target) {
            let op = match op {
                Some(x) => x,
                None => continue,
            };
            branch += op.stack_effect(arg) as i64;
            peak = peak.max(branch);
            if branch < 0 {
                warnings.push(UnsafeBytecode { kind: UnsafeKind::EmptyStackPop, index: j, branch: Some(i), opcode: byte, arg });
            }
            if op.is_jump() && branch != 0 {
                warnings.push(UnsafeBytecode { kind: UnsafeKind::NonZeroBeforeJump, index: j, branch: Some(i), opcode: byte, arg });
            }
        }
    }

    (peak.clamp(0, u32::MAX as i64) as u32, warnings)
}

/// Derives execution-mode flags from the opcodes of a code stream.
pub fn guess_flags(code: &[u8], has_locals: bool, original_flags: u32) -> u32 {
    let mut res = flags::NOFREE;
    for &byte in code.iter().step_by(CODE_UNIT) {
        match Opcode::from_u8(byte) {
            Some(op) if op.operand_class() == OperandClass::Free => res &= !flags::NOFREE,
            Some(op) if op.is_yield() => res |= flags::GENERATOR,
            _ => (),
        }
    }
    if has_locals { res |= flags::NEWLOCALS; }
    res |= original_flags & flags::INHERITED;

    if res & flags::COROUTINE != 0 && res & flags::GENERATOR != 0 {
        res &= !(flags::COROUTINE | flags::GENERATOR);
        res |= flags::ASYNC_GENERATOR;
    }
    res
}

/// Builds a delta-encoded line table from `(line, start byte, end byte)` spans of consecutive instructions.
///
/// Consecutive spans on the same line are merged into a single run, and each run is encoded as a
/// (byte length, signed line delta) pair relative to the previous run (the first relative to `first_line`).
/// Returns `None` if any run does not fit the encoding.
pub fn build_line_table(first_line: u32, spans: &[(u32, usize, usize)]) -> Option<Vec<u8>> {
    let mut runs: Vec<(u32, usize, usize)> = Vec::with_capacity(spans.len());
    for &(line, start, end) in spans {
        match runs.last_mut() {
            Some(last) if last.0 == line => last.2 = end,
            _ => runs.push((line, start, end)),
        }
    }

    let mut res = Vec::with_capacity(runs.len() * 2);
    let mut prev = first_line as i64;
    for (line, start, end) in runs {
        let bytes = end - start;
        let delta = line as i64 - prev;
        if bytes > 254 || !(-127..=127).contains(&delta) { return None; }
        res.push(bytes as u8);
        res.push(delta as i8 as u8);
        prev = line as i64;
    }
    Some(res)
}

/// Decodes a line table into `(end byte, line)` runs.
pub fn decode_line_table(first_line: u32, table: &[u8]) -> Vec<(usize, u32)> {
    let mut res = Vec::with_capacity(table.len() / 2);
    let (mut end, mut line) = (0usize, first_line as i64);
    for pair in table.chunks_exact(2) {
        end += pair[0] as usize;
        line += pair[1] as i8 as i64;
        res.push((end, line.max(0) as u32));
    }
    res
}

/// The derived metadata of a procedure, which option statements may read and override.
#[derive(Debug, Clone)]
pub struct AssemblyContext {
    pub flags: u32,
    pub stack_size: u32,
    pub names: Vec<CompactString>,
    pub consts: Vec<Value>,
    pub varnames: Vec<CompactString>,
    pub freevars: Vec<CompactString>,
}
impl AssemblyContext {
    /// The current option values as a symbol table.
    pub fn bindings(&self) -> SymbolTable {
        let strs = |x: &[CompactString]| Value::Tuple(x.iter().map(|x| Value::Str(x.clone())).collect());
        let mut res = SymbolTable::default();
        res.define("FLAGS", Value::Int(self.flags as i64));
        res.define("STACK_SIZE", Value::Int(self.stack_size as i64));
        res.define("NAMES", strs(&self.names));
        res.define("CONSTS", Value::Tuple(self.consts.clone()));
        res.define("VARNAMES", strs(&self.varnames));
        res.define("FREEVARS", strs(&self.freevars));
        res
    }
    /// Assigns an option, checking that the value has the right type.
    pub fn set(&mut self, name: &str, value: Value, line: u32) -> Result<(), AssembleError> {
        let type_err = |expected: &'static str, got: &Value| AssembleError::OptionType { name: name.into(), expected, got: got.get_type(), line };
        let u32_value = |value: &Value| -> Result<u32, AssembleError> {
            match value {
                Value::Int(x) if *x >= 0 && *x <= u32::MAX as i64 => Ok(*x as u32),
                x => Err(type_err("an int in 0..=4294967295", x)),
            }
        };
        let strs_value = |value: &Value| -> Result<Vec<CompactString>, AssembleError> {
            match value {
                Value::Tuple(x) | Value::List(x) => x.iter().map(|x| match x {
                    Value::Str(x) => Ok(x.clone()),
                    x => Err(type_err("a tuple of str", x)),
                }).collect(),
                x => Err(type_err("a tuple of str", x)),
            }
        };

        match name {
            "FLAGS" => self.flags = u32_value(&value)?,
            "STACK_SIZE" => self.stack_size = u32_value(&value)?,
            "NAMES" => self.names = strs_value(&value)?,
            "VARNAMES" => self.varnames = strs_value(&value)?,
            "FREEVARS" => self.freevars = strs_value(&value)?,
            "CONSTS" => self.consts = match value {
                Value::Tuple(x) | Value::List(x) => x,
                x => return Err(type_err("a tuple", &x)),
            },
            _ => return Err(AssembleError::UnknownOption { name: name.into(), line }),
        }
        Ok(())
    }
}

/// A compiled procedure body with everything needed to execute it.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone)]
pub struct CodeUnit {
    #[allow(dead_code)] tag: MustBeU64<FINGERPRINT>,

    pub argcount: usize,
    pub posonlyargcount: usize,
    pub kwonlyargcount: usize,
    pub nlocals: usize,
    pub stacksize: u32,
    pub flags: u32,
    pub code: Box<[u8]>,
    pub consts: Vec<Value>,
    pub names: Vec<CompactString>,
    pub varnames: Vec<CompactString>,
    pub filename: CompactString,
    pub name: CompactString,
    pub firstlineno: u32,
    pub linetable: Box<[u8]>,
    pub freevars: Vec<CompactString>,
}

/// Non-fatal results of assembling a procedure.
#[derive(Debug, Clone, Default)]
pub struct Report {
    pub procedure: CompactString,
    /// Stack-balance diagnostics (empty when none, or when assembly failed under [`UnsafePolicy::Error`]).
    pub diagnostics: Vec<UnsafeBytecode>,
    /// Set if the line table could not be encoded and was left empty.
    pub line_table_degraded: bool,
}

#[derive(Default)]
struct NamePool(Vec<CompactString>);
impl NamePool {
    fn intern(&mut self, name: &str) -> usize {
        match self.0.iter().position(|x| x == name) {
            Some(x) => x,
            None => {
                self.0.push(name.into());
                self.0.len() - 1
            }
        }
    }
}

#[derive(Default)]
struct ConstPool(Vec<Value>);
impl ConstPool {
    fn intern(&mut self, value: Value) -> usize {
        match self.0.iter().position(|x| x.is_identical(&value)) {
            Some(x) => x,
            None => {
                self.0.push(value);
                self.0.len() - 1
            }
        }
    }
}

enum Arg<'a> {
    Value(u32),
    Raw(&'a Expr),
    Label(CompactString),
}

struct PendingIns<'a> {
    op: Opcode,
    arg: Arg<'a>,
    line: u32,
}

struct Assembler<'a> {
    decl: &'a ProcedureDecl,
    scope: LookupGroup<'a>,

    names: NamePool,
    consts: ConstPool,
    varnames: NamePool,
    freevars: NamePool,
    labels: BTreeMap<CompactString, usize>,
    ins: Vec<PendingIns<'a>>,
    options: Vec<(&'a str, Option<BinaryOp>, &'a Expr, u32)>,
}
impl<'a> Assembler<'a> {
    fn eval(&self, expr: &Expr, index: usize, line: u32) -> Result<Value, AssembleError> {
        expr.eval(&self.scope).map_err(|cause| match cause {
            ErrorCause::UndefinedVariable { name } => AssembleError::Resolution { symbol: name, index, line },
            cause => AssembleError::Eval { cause, line },
        })
    }
    fn define_label(&mut self, label: &str, line: u32) -> Result<(), AssembleError> {
        if self.labels.contains_key(label) {
            return Err(AssembleError::DuplicateLabel { label: label.into(), line });
        }
        self.labels.insert(label.into(), self.ins.len());
        Ok(())
    }
    /// Gets the identifier text of a pooled operand: the identifier itself, a string literal, or an expression yielding a string.
    fn symbol(&self, op: Opcode, expr: &Expr, index: usize, line: u32) -> Result<CompactString, AssembleError> {
        if let Some(ident) = expr.as_ident() { return Ok(ident.into()); }
        match self.eval(expr, index, line)? {
            Value::Str(x) => Ok(x),
            x => Err(AssembleError::BadOperand { opcode: op, expected: "an identifier or str", got: x.to_compact_string(), index, line }),
        }
    }
    fn label(&self, op: Opcode, expr: &Expr, index: usize, line: u32) -> Result<CompactString, AssembleError> {
        match expr {
            Expr::Name(x) => Ok(x.clone()),
            Expr::Value(Value::Str(x)) => Ok(x.clone()),
            _ => Err(AssembleError::BadOperand { opcode: op, expected: "a label", got: "an expression".into(), index, line }),
        }
    }
    fn resolve(&mut self, op: Opcode, operand: Option<&'a Operand>, index: usize, line: u32) -> Result<Arg<'a>, AssembleError> {
        let expr = match operand {
            None => return Ok(Arg::Value(0)),
            Some(Operand::Raw(expr)) => return Ok(Arg::Raw(expr)),
            Some(Operand::Resolved(expr)) => expr,
        };

        Ok(match op.operand_class() {
            OperandClass::None | OperandClass::Raw => Arg::Raw(expr),
            OperandClass::Const => {
                let value = self.eval(expr, index, line)?;
                Arg::Value(self.consts.intern(value) as u32)
            }
            OperandClass::Name => {
                let symbol = self.symbol(op, expr, index, line)?;
                Arg::Value(self.names.intern(&symbol) as u32)
            }
            OperandClass::Local => {
                let symbol = self.symbol(op, expr, index, line)?;
                Arg::Value(self.varnames.intern(&symbol) as u32)
            }
            OperandClass::Free => {
                let symbol = self.symbol(op, expr, index, line)?;
                Arg::Value(self.freevars.intern(&symbol) as u32)
            }
            OperandClass::Compare => {
                let value = self.eval(expr, index, line)?;
                match CMP_OPS.iter().position(|x| matches!(&value, Value::Str(s) if s == x)) {
                    Some(x) => Arg::Value(x as u32),
                    None => return Err(AssembleError::BadOperand { opcode: op, expected: "a comparison operator", got: value.to_compact_string(), index, line }),
                }
            }
            OperandClass::AbsJump | OperandClass::RelJump => Arg::Label(self.label(op, expr, index, line)?),
        })
    }
    fn pass1(&mut self) -> Result<(), AssembleError> {
        let decl = self.decl;
        for stmt in decl.body.iter() {
            match stmt {
                Statement::Label { name, line } => self.define_label(name, *line)?,
                Statement::Option { name, op, value, line } => self.options.push((name.as_str(), *op, value, *line)),
                Statement::Instruction { opcode, operand, label, line } => {
                    let op = Opcode::from_name(opcode).ok_or_else(|| AssembleError::UnknownOpcode { opcode: opcode.clone(), line: *line })?;
                    if let Some(label) = label {
                        self.define_label(label, *line)?;
                    }
                    let arg = self.resolve(op, operand.as_ref(), self.ins.len(), *line)?;
                    self.ins.push(PendingIns { op, arg, line: *line });
                }
            }
        }
        Ok(())
    }
    /// Evaluates raw operands and looks up label targets.
    /// Jumps are returned as the instruction index of their target.
    fn pass2_operands(&self) -> Result<Vec<u32>, AssembleError> {
        let mut res = Vec::with_capacity(self.ins.len());
        for (index, ins) in self.ins.iter().enumerate() {
            res.push(match &ins.arg {
                Arg::Value(x) => *x,
                Arg::Raw(expr) => match self.eval(expr, index, ins.line)? {
                    Value::Int(x) => u32::try_from(x).map_err(|_| AssembleError::OperandRange { opcode: ins.op, value: x, index, line: ins.line })?,
                    Value::Bool(x) => x as u32,
                    x => return Err(AssembleError::BadOperand { opcode: ins.op, expected: "an int", got: x.to_compact_string(), index, line: ins.line }),
                }
                Arg::Label(label) => match self.labels.get(label) {
                    Some(&target) => {
                        if ins.op.operand_class() == OperandClass::RelJump && target <= index {
                            return Err(AssembleError::BackwardRelativeJump { opcode: ins.op, label: label.clone(), index, line: ins.line });
                        }
                        target as u32
                    }
                    None => return Err(AssembleError::Resolution { symbol: label.clone(), index, line: ins.line }),
                }
            });
        }
        Ok(res)
    }
    /// Encodes the instruction stream, growing instruction widths until every operand fits.
    /// Returns the code and the final code-unit position of each instruction (plus the end position).
    fn encode(&self, operands: &[u32]) -> (Vec<u8>, Vec<usize>) {
        let final_arg = |i: usize, final_ins_pos: &[usize]| -> u32 {
            let ins = &self.ins[i];
            match (&ins.arg, ins.op.operand_class()) {
                (Arg::Label(_), OperandClass::AbsJump) => final_ins_pos[operands[i] as usize] as u32,
                (Arg::Label(_), OperandClass::RelJump) => (final_ins_pos[operands[i] as usize] - final_ins_pos[i + 1]) as u32,
                _ => operands[i],
            }
        };

        let mut widths = alloc::vec![1usize; self.ins.len()];
        let mut final_ins_pos = Vec::with_capacity(self.ins.len() + 1);
        loop {
            final_ins_pos.clear();
            let mut pos = 0;
            for width in widths.iter() {
                final_ins_pos.push(pos);
                pos += width;
            }
            final_ins_pos.push(pos);

            let mut changed = false;
            for (i, width) in widths.iter_mut().enumerate() {
                let needed = units_for_arg(final_arg(i, &final_ins_pos));
                if needed > *width {
                    *width = needed;
                    changed = true;
                }
            }
            if !changed { break; }
        }

        let mut code = Vec::with_capacity(final_ins_pos[self.ins.len()] * CODE_UNIT);
        for (i, ins) in self.ins.iter().enumerate() {
            let arg = final_arg(i, &final_ins_pos);
            for k in (1..widths[i]).rev() {
                code.push(Opcode::EXTENDED_ARG as u8);
                code.push((arg >> (8 * k)) as u8);
            }
            code.push(ins.op as u8);
            code.push(arg as u8);
            debug_assert_eq!(code.len(), final_ins_pos[i + 1] * CODE_UNIT);
        }
        (code, final_ins_pos)
    }
}

/// Assembles a procedure declaration.
///
/// Operand and option expressions are evaluated against `locals` first and then `globals`
/// (options additionally see the derived metadata ahead of both, see [`AssemblyContext`]).
/// Stack-balance diagnostics are handled according to [`Settings::unsafe_policy`].
pub fn assemble(decl: &ProcedureDecl, locals: &SymbolTable, globals: &SymbolTable, settings: &Settings) -> Result<(CodeUnit, Report), AssembleError> {
    let scopes = [locals, globals];
    let mut asm = Assembler {
        decl,
        scope: LookupGroup(&scopes),
        names: Default::default(),
        consts: Default::default(),
        varnames: Default::default(),
        freevars: Default::default(),
        labels: Default::default(),
        ins: Vec::with_capacity(decl.body.len()),
        options: Vec::new(),
    };
    for param in decl.params.slots() {
        asm.varnames.intern(param);
    }
    for free in decl.freevars.iter() {
        asm.freevars.intern(free);
    }

    asm.pass1()?;
    let operands = asm.pass2_operands()?;
    let (code, final_ins_pos) = asm.encode(&operands);

    let (stack_size, diagnostics) = stack_depth(&code);
    match settings.unsafe_policy {
        UnsafePolicy::Error => if !diagnostics.is_empty() {
            return Err(AssembleError::UnsafeBytecode { warnings: diagnostics });
        }
        UnsafePolicy::Warn => for warning in diagnostics.iter() {
            tracing::warn!(procedure = %decl.name, "{warning}");
        }
        UnsafePolicy::Ignore => (),
    }

    let flags = guess_flags(&code, !asm.varnames.0.is_empty(), decl.flags);

    let spans: Vec<_> = asm.ins.iter().enumerate().map(|(i, ins)| (ins.line, final_ins_pos[i] * CODE_UNIT, final_ins_pos[i + 1] * CODE_UNIT)).collect();
    let (linetable, line_table_degraded) = match build_line_table(decl.first_line, &spans) {
        Some(x) => (x, false),
        None => {
            tracing::debug!(procedure = %decl.name, "line table overflow, leaving it empty");
            (Vec::new(), true)
        }
    };

    let mut context = AssemblyContext {
        flags,
        stack_size,
        names: asm.names.0,
        consts: asm.consts.0,
        varnames: asm.varnames.0,
        freevars: asm.freevars.0,
    };
    for &(name, op, expr, line) in asm.options.iter() {
        if !OPTIONS.contains(&name) {
            return Err(AssembleError::UnknownOption { name: name.into(), line });
        }
        let bindings = context.bindings();
        let scope = [&bindings, locals, globals];
        let eval_err = |cause| match cause {
            ErrorCause::UndefinedVariable { name } => AssembleError::Resolution { symbol: name, index: asm.ins.len(), line },
            cause => AssembleError::Eval { cause, line },
        };
        let mut value = expr.eval(&LookupGroup(&scope)).map_err(eval_err)?;
        if let Some(op) = op {
            let current = bindings.lookup(name).cloned().unwrap_or(Value::None);
            value = current.binary_op(op, &value).map_err(eval_err)?;
        }
        context.set(name, value, line)?;
    }

    tracing::debug!(procedure = %decl.name, bytes = code.len(), stack_size = context.stack_size, flags = context.flags, "assembled");

    let unit = CodeUnit {
        tag: Default::default(),
        argcount: decl.params.positional.len(),
        posonlyargcount: decl.params.posonly_count,
        kwonlyargcount: decl.params.kwonly.len(),
        nlocals: context.varnames.len(),
        stacksize: context.stack_size,
        flags: context.flags,
        code: code.into_boxed_slice(),
        consts: context.consts,
        names: context.names,
        varnames: context.varnames,
        filename: decl.filename.clone(),
        name: decl.name.clone(),
        firstlineno: decl.first_line,
        linetable: linetable.into_boxed_slice(),
        freevars: context.freevars,
    };
    let diagnostics = match settings.unsafe_policy {
        UnsafePolicy::Error => Vec::new(),
        _ => diagnostics,
    };
    Ok((unit, Report { procedure: decl.name.clone(), diagnostics, line_table_degraded }))
}

impl CodeUnit {
    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }
    /// Looks up the source line of the instruction containing the given byte offset.
    pub fn line_for_offset(&self, offset: usize) -> Option<u32> {
        let runs = decode_line_table(self.firstlineno, &self.linetable);
        let p = runs.lower_bound_by_key(&(offset + 1), |x| x.0);
        runs.get(p).map(|x| x.1)
    }
    /// Describes the resolved meaning of an operand, if it has one beyond its numeric value.
    pub fn describe_operand(&self, op: Opcode, index: usize, arg: u32) -> Option<CompactString> {
        let arg = arg as usize;
        let pooled = |pool: &[CompactString]| pool.get(arg).cloned().unwrap_or_else(|| "<out of range>".into());
        Some(match op.operand_class() {
            OperandClass::Const => self.consts.get(arg).map(|x| x.to_compact_string()).unwrap_or_else(|| "<out of range>".into()),
            OperandClass::Name => pooled(&self.names),
            OperandClass::Local => pooled(&self.varnames),
            OperandClass::Free => pooled(&self.freevars),
            OperandClass::Compare => CMP_OPS.get(arg).copied().unwrap_or("<out of range>").into(),
            OperandClass::AbsJump | OperandClass::RelJump => compact_str::format_compact!("to {}", jump_target(op, index, arg as u32) * CODE_UNIT),
            OperandClass::None | OperandClass::Raw => return None,
        })
    }
    /// Generates a disassembly listing of the code, including byte offsets, source lines and hex dumps.
    /// Instructions which are jump targets are marked with `>>`.
    #[cfg(feature = "std")]
    pub fn dump_code(&self, f: &mut dyn Write) -> io::Result<()> {
        let units = self.code.len() / CODE_UNIT;
        let mut targets = alloc::collections::BTreeSet::new();
        let mut pos = 0;
        while pos < units {
            let (op, arg, aft) = match read_instruction(&self.code, pos) {
                Ok(x) => x,
                Err(_) => { pos += 1; continue; }
            };
            if op.is_jump() { targets.insert(jump_target(op, aft - 1, arg)); }
            pos = aft;
        }

        let mut prev_line = None;
        let mut pos = 0;
        while pos < units {
            let (desc, aft) = match read_instruction(&self.code, pos) {
                Ok((op, arg, aft)) => {
                    let mut desc = std::format!("{:<24}", op.name());
                    if op.has_argument() {
                        desc.push_str(&std::format!(" {arg:>5}"));
                        if let Some(x) = self.describe_operand(op, aft - 1, arg) {
                            desc.push_str(&std::format!(" ({x})"));
                        }
                    }
                    (desc, aft)
                }
                Err(byte) => (std::format!("<unknown opcode {byte}>"), pos + 1),
            };

            let offset = pos * CODE_UNIT;
            let line = self.line_for_offset(offset);
            if line != prev_line {
                match line {
                    Some(x) => write!(f, "{x:>6} ")?,
                    None => write!(f, "       ")?,
                }
                prev_line = line;
            } else {
                write!(f, "       ")?;
            }
            let marker = if (pos..aft).any(|x| targets.contains(&x)) { ">>" } else { "  " };
            write!(f, "{marker} {offset:06}  ")?;

            let bytes = &self.code[offset..aft * CODE_UNIT];
            for &b in bytes.iter().take(BYTES_PER_LINE) {
                write!(f, " {b:02x}")?;
            }
            for _ in bytes.len().min(BYTES_PER_LINE)..BYTES_PER_LINE {
                write!(f, "   ")?;
            }
            writeln!(f, "    {desc}")?;
            pos = aft;
        }
        Ok(())
    }
    /// Writes the pools, flags and sizes of the code unit.
    #[cfg(feature = "std")]
    pub fn dump_meta(&self, f: &mut dyn Write) -> io::Result<()> {
        fn write_pool<T: fmt::Display>(f: &mut dyn Write, title: &str, pool: &[T]) -> io::Result<()> {
            writeln!(f, "{title}:")?;
            for (i, x) in pool.iter().enumerate() {
                writeln!(f, "    {i:>4}: {x}")?;
            }
            Ok(())
        }

        writeln!(f, "name:              {}", self.name)?;
        writeln!(f, "filename:          {}", self.filename)?;
        writeln!(f, "first line:        {}", self.firstlineno)?;
        writeln!(f, "argument count:    {}", self.argcount)?;
        writeln!(f, "positional-only:   {}", self.posonlyargcount)?;
        writeln!(f, "keyword-only:      {}", self.kwonlyargcount)?;
        writeln!(f, "locals:            {}", self.nlocals)?;
        writeln!(f, "stack size:        {}", self.stacksize)?;
        write!(f, "flags:             0x{:04x}", self.flags)?;
        for (bit, name) in flags::NAMES {
            if self.flags & bit != 0 { write!(f, " {name}")?; }
        }
        writeln!(f)?;
        writeln!(f, "code size:         {}", self.code.len())?;
        writeln!(f, "line table size:   {}", self.linetable.len())?;
        write_pool(f, "constants", &self.consts)?;
        write_pool(f, "names", &self.names)?;
        write_pool(f, "variable names", &self.varnames)?;
        write_pool(f, "free variables", &self.freevars)?;
        Ok(())
    }
}

#[test]
fn test_line_table() {
    assert_eq!(build_line_table(10, &[]).unwrap(), Vec::<u8>::new());
    assert_eq!(build_line_table(10, &[(11, 0, 2), (11, 2, 4), (12, 4, 6), (11, 6, 8)]).unwrap(), [4, 1, 2, 1, 2, 255]);
    assert!(build_line_table(1, &[(200, 0, 2)]).is_none());
    assert!(build_line_table(1, &[(2, 0, 256)]).is_none());
    assert!(build_line_table(1, &[(128, 0, 2)]).is_some());

    let runs = decode_line_table(10, &[4, 1, 2, 1, 2, 255]);
    assert_eq!(runs, [(4, 11), (6, 12), (8, 11)]);
}

#[test]
fn test_stack_depth_straight_line() {
    let code = [Opcode::LOAD_FAST as u8, 0, Opcode::LOAD_CONST as u8, 0, Opcode::BINARY_POWER as u8, 0, Opcode::RETURN_VALUE as u8, 0];
    let (peak, warnings) = stack_depth(&code);
    assert_eq!(peak, 2);
    assert!(warnings.is_empty());
}

#[test]
fn test_stack_depth_unbalanced() {
    let code = [Opcode::POP_TOP as u8, 0, Opcode::LOAD_CONST as u8, 0, Opcode::LOAD_CONST as u8, 0, Opcode::JUMP_ABSOLUTE as u8, 1];
    let (peak, warnings) = stack_depth(&code);
    assert_eq!(peak, 3);
    assert_eq!(warnings, [
        UnsafeBytecode { kind: UnsafeKind::EmptyStackPop, index: 0, branch: None, opcode: Opcode::POP_TOP as u8, arg: 0 },
        UnsafeBytecode { kind: UnsafeKind::NonZeroBeforeJump, index: 3, branch: None, opcode: Opcode::JUMP_ABSOLUTE as u8, arg: 1 },
        UnsafeBytecode { kind: UnsafeKind::NonZeroBeforeJump, index: 3, branch: Some(3), opcode: Opcode::JUMP_ABSOLUTE as u8, arg: 1 },
    ]);
    assert_eq!(alloc::string::ToString::to_string(&warnings[0]), "possible pop from empty stack: [0] POP_TOP 0");
    assert_eq!(alloc::string::ToString::to_string(&warnings[2]), "non-zero stack effect before jump: [3->3] JUMP_ABSOLUTE 1");
}

#[test]
fn test_stack_depth_extended_arg() {
    let code = [Opcode::EXTENDED_ARG as u8, 1, Opcode::BUILD_TUPLE as u8, 0, Opcode::POP_TOP as u8, 0];
    let (peak, warnings) = stack_depth(&code);
    assert_eq!(peak, 0);
    assert_eq!(warnings.len(), 2);
    assert_eq!((warnings[0].kind, warnings[0].index, warnings[0].arg), (UnsafeKind::EmptyStackPop, 1, 256));

    assert_eq!(read_instruction(&code, 0), Ok((Opcode::BUILD_TUPLE, 256, 2)));
    assert_eq!(read_instruction(&code, 2), Ok((Opcode::POP_TOP, 0, 3)));
    assert_eq!(read_instruction(&[250, 0], 0), Err(250));
}

#[test]
fn test_guess_flags() {
    let gen = [Opcode::LOAD_FAST as u8, 0, Opcode::YIELD_VALUE as u8, 0];
    assert_eq!(guess_flags(&gen, true, 0), flags::NOFREE | flags::GENERATOR | flags::NEWLOCALS);
    assert_eq!(guess_flags(&gen, true, flags::COROUTINE | flags::OPTIMIZED), flags::NOFREE | flags::ASYNC_GENERATOR | flags::NEWLOCALS);

    let free = [Opcode::LOAD_DEREF as u8, 0, Opcode::RETURN_VALUE as u8, 0];
    assert_eq!(guess_flags(&free, false, flags::NESTED | flags::VARARGS), flags::NESTED | flags::VARARGS);

    // operand bytes are never mistaken for opcodes
    let operand = [Opcode::LOAD_CONST as u8, Opcode::YIELD_VALUE as u8];
    assert_eq!(guess_flags(&operand, false, 0), flags::NOFREE);
}
