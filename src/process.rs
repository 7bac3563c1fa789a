use alloc::rc::Rc;
use alloc::vec::Vec;

use core::fmt;

use compact_str::CompactString;

use crate::bytecode::*;
use crate::opcode::*;
use crate::procedure::*;
use crate::runtime::*;

/// Result of stepping through a [`Process`].
#[derive(Debug)]
pub enum StepResult {
    /// The process was not running.
    Idle,
    /// The process executed an instruction successfully and does not need to yield.
    Normal,
    /// The outermost procedure yielded a value. Resuming the process continues after the yield point.
    Yield { value: Value },
    /// The outermost procedure returned the given value.
    Terminate { value: Value },
}

/// An execution error, along with the location where it happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecError {
    pub cause: ErrorCause,
    pub procedure: CompactString,
    /// Byte offset of the failing instruction.
    pub offset: usize,
    /// Source line of the failing instruction, if the line table has one.
    pub line: Option<u32>,
}
impl ExecError {
    pub fn new(cause: ErrorCause, proc: &Procedure, offset: usize) -> Self {
        Self { cause, procedure: proc.name().into(), offset, line: proc.code().line_for_offset(offset) }
    }
}
impl fmt::Display for ExecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.line {
            Some(line) => write!(f, "{} (line {line}, offset {}): {}", self.procedure, self.offset, self.cause),
            None => write!(f, "{} (offset {}): {}", self.procedure, self.offset, self.cause),
        }
    }
}
#[cfg(feature = "std")]
impl std::error::Error for ExecError {}

struct Frame {
    proc: Rc<Procedure>,
    /// Position of the next instruction, in code units.
    pos: usize,
    value_stack: Vec<Value>,
    locals: Vec<Option<Value>>,
    names: SymbolTable,
}
impl Frame {
    fn new(proc: Rc<Procedure>, args: Vec<Value>) -> Result<Self, ErrorCause> {
        let locals = proc.bind_args(args)?;
        let value_stack = Vec::with_capacity(proc.code().stacksize as usize);
        Ok(Self { proc, pos: 0, value_stack, locals, names: Default::default() })
    }
    fn push(&mut self, value: Value, settings: &Settings) -> Result<(), ErrorCause> {
        let limit = self.proc.code().stacksize as usize;
        if settings.enforce_stack_size && self.value_stack.len() >= limit {
            return Err(ErrorCause::StackOverflow { limit });
        }
        self.value_stack.push(value);
        Ok(())
    }
    fn pop(&mut self) -> Result<Value, ErrorCause> {
        self.value_stack.pop().ok_or(ErrorCause::StackUnderflow)
    }
    fn pop_n(&mut self, n: usize) -> Result<Vec<Value>, ErrorCause> {
        if n > self.value_stack.len() { return Err(ErrorCause::StackUnderflow); }
        Ok(self.value_stack.split_off(self.value_stack.len() - n))
    }
    fn peek(&self, depth: usize) -> Result<&Value, ErrorCause> {
        let len = self.value_stack.len();
        if depth >= len { return Err(ErrorCause::StackUnderflow); }
        Ok(&self.value_stack[len - 1 - depth])
    }
    /// Moves the top of the stack down by `n - 1` positions.
    fn rotate(&mut self, n: usize) -> Result<(), ErrorCause> {
        let len = self.value_stack.len();
        if n > len { return Err(ErrorCause::StackUnderflow); }
        self.value_stack[len - n..].rotate_right(1.min(n));
        Ok(())
    }
    fn pooled<'a>(pool: &'a [CompactString], index: u32) -> Result<&'a CompactString, ErrorCause> {
        pool.get(index as usize).ok_or(ErrorCause::BadPoolIndex { index: index as usize, len: pool.len() })
    }
}

/// A [`CodeUnit`] execution primitive.
///
/// Calls between assembled procedures are executed on an explicit frame stack rather than by recursion,
/// bounded by [`Settings::max_call_depth`].
pub struct Process {
    frames: Vec<Frame>,
    settings: Settings,
    last_offset: usize,
}
impl Process {
    /// Creates a new process which is ready to execute `proc` with the given arguments.
    pub fn new(proc: Rc<Procedure>, args: Vec<Value>, settings: Settings) -> Result<Self, ExecError> {
        let frame = Frame::new(proc.clone(), args).map_err(|cause| ExecError::new(cause, &proc, 0))?;
        Ok(Self { frames: alloc::vec![frame], settings, last_offset: 0 })
    }
    /// Checks if the process is currently running.
    pub fn is_running(&self) -> bool {
        !self.frames.is_empty()
    }
    /// Byte offset of the most recently executed instruction.
    pub fn last_offset(&self) -> usize {
        self.last_offset
    }
    /// Executes a single instruction.
    /// If an error is encountered, the process is terminated and the error is returned.
    pub fn step(&mut self) -> Result<StepResult, ExecError> {
        let frame = match self.frames.last() {
            Some(x) => x,
            None => return Ok(StepResult::Idle),
        };
        let (proc, offset) = (frame.proc.clone(), frame.pos * CODE_UNIT);
        self.last_offset = offset;

        match self.step_inner() {
            Ok(x) => Ok(x),
            Err(cause) => {
                self.frames.clear();
                Err(ExecError::new(cause, &proc, offset))
            }
        }
    }
    fn step_inner(&mut self) -> Result<StepResult, ErrorCause> {
        let settings = self.settings;
        let depth = self.frames.len();
        let frame = match self.frames.last_mut() {
            Some(x) => x,
            None => return Ok(StepResult::Idle),
        };
        let code = frame.proc.code().clone();

        if frame.pos * CODE_UNIT >= code.code.len() {
            return Err(ErrorCause::EndOfCode);
        }
        let (op, arg, aft) = read_instruction(&code.code, frame.pos).map_err(|byte| ErrorCause::BadOpcode { byte })?;
        tracing::trace!(procedure = %code.name, offset = frame.pos * CODE_UNIT, "{} {arg}", op.name());

        let here = aft - 1;
        frame.pos = aft;

        macro_rules! binary {
            ($op:expr) => {{
                let right = frame.pop()?;
                let left = frame.pop()?;
                frame.push(left.binary_op($op, &right)?, &settings)?;
            }};
        }
        macro_rules! unary {
            ($op:expr) => {{
                let value = frame.pop()?;
                frame.push(value.unary_op($op)?, &settings)?;
            }};
        }

        match op {
            Opcode::NOP | Opcode::EXTENDED_ARG => (),
            Opcode::POP_TOP => { frame.pop()?; }
            Opcode::ROT_TWO => frame.rotate(2)?,
            Opcode::ROT_THREE => frame.rotate(3)?,
            Opcode::ROT_FOUR => frame.rotate(4)?,
            Opcode::ROT_N => frame.rotate(arg as usize)?,
            Opcode::DUP_TOP => {
                let value = frame.peek(0)?.clone();
                frame.push(value, &settings)?;
            }
            Opcode::DUP_TOP_TWO => {
                let (a, b) = (frame.peek(1)?.clone(), frame.peek(0)?.clone());
                frame.push(a, &settings)?;
                frame.push(b, &settings)?;
            }

            Opcode::UNARY_POSITIVE => unary!(UnaryOp::Pos),
            Opcode::UNARY_NEGATIVE => unary!(UnaryOp::Neg),
            Opcode::UNARY_NOT => unary!(UnaryOp::Not),
            Opcode::UNARY_INVERT => unary!(UnaryOp::Invert),

            Opcode::BINARY_POWER | Opcode::INPLACE_POWER => binary!(BinaryOp::Pow),
            Opcode::BINARY_MULTIPLY | Opcode::INPLACE_MULTIPLY => binary!(BinaryOp::Mul),
            Opcode::BINARY_MODULO | Opcode::INPLACE_MODULO => binary!(BinaryOp::Mod),
            Opcode::BINARY_ADD | Opcode::INPLACE_ADD => binary!(BinaryOp::Add),
            Opcode::BINARY_SUBTRACT | Opcode::INPLACE_SUBTRACT => binary!(BinaryOp::Sub),
            Opcode::BINARY_FLOOR_DIVIDE | Opcode::INPLACE_FLOOR_DIVIDE => binary!(BinaryOp::FloorDiv),
            Opcode::BINARY_TRUE_DIVIDE | Opcode::INPLACE_TRUE_DIVIDE => binary!(BinaryOp::TrueDiv),
            Opcode::BINARY_LSHIFT | Opcode::INPLACE_LSHIFT => binary!(BinaryOp::LShift),
            Opcode::BINARY_RSHIFT | Opcode::INPLACE_RSHIFT => binary!(BinaryOp::RShift),
            Opcode::BINARY_AND | Opcode::INPLACE_AND => binary!(BinaryOp::And),
            Opcode::BINARY_XOR | Opcode::INPLACE_XOR => binary!(BinaryOp::Xor),
            Opcode::BINARY_OR | Opcode::INPLACE_OR => binary!(BinaryOp::Or),
            Opcode::BINARY_SUBSCR => {
                let index = frame.pop()?;
                let seq = frame.pop()?;
                frame.push(seq.subscript(&index)?, &settings)?;
            }

            Opcode::GET_ITER => {
                let value = frame.pop()?;
                frame.push(value.iter()?, &settings)?;
            }
            Opcode::FOR_ITER => {
                let item = match frame.peek(0)? {
                    Value::Iterator(iter) => iter.borrow_mut().next(),
                    x => return Err(ErrorCause::ConversionError { got: x.get_type(), expected: Type::Iterator }),
                };
                match item {
                    Some(item) => frame.push(item, &settings)?,
                    None => {
                        frame.pop()?;
                        frame.pos = jump_target(op, here, arg);
                    }
                }
            }
            Opcode::YIELD_VALUE => {
                if depth != 1 { return Err(ErrorCause::UnexpectedYield); }
                let value = frame.pop()?;
                frame.push(Value::None, &settings)?;
                return Ok(StepResult::Yield { value });
            }
            Opcode::YIELD_FROM => {
                if depth != 1 { return Err(ErrorCause::UnexpectedYield); }
                frame.pop()?;
                let item = match frame.peek(0)? {
                    Value::Iterator(iter) => iter.borrow_mut().next(),
                    x => return Err(ErrorCause::ConversionError { got: x.get_type(), expected: Type::Iterator }),
                };
                match item {
                    Some(value) => {
                        frame.push(Value::None, &settings)?;
                        frame.pos = here;
                        return Ok(StepResult::Yield { value });
                    }
                    None => {
                        frame.pop()?;
                        frame.push(Value::None, &settings)?;
                    }
                }
            }
            Opcode::RETURN_VALUE => {
                let value = frame.pop()?;
                self.frames.pop();
                return match self.frames.last_mut() {
                    Some(caller) => {
                        caller.push(value, &settings)?;
                        Ok(StepResult::Normal)
                    }
                    None => Ok(StepResult::Terminate { value }),
                };
            }

            Opcode::STORE_NAME => {
                let name = Frame::pooled(&code.names, arg)?;
                let value = frame.pop()?;
                frame.names.define(name, value);
            }
            Opcode::DELETE_NAME => {
                let name = Frame::pooled(&code.names, arg)?;
                if frame.names.remove(name).is_none() {
                    return Err(ErrorCause::UndefinedVariable { name: name.clone() });
                }
            }
            Opcode::LOAD_NAME => {
                let name = Frame::pooled(&code.names, arg)?;
                let value = match frame.names.lookup(name) {
                    Some(x) => x.clone(),
                    None => frame.proc.globals()?.borrow().lookup(name).cloned().ok_or_else(|| ErrorCause::UndefinedVariable { name: name.clone() })?,
                };
                frame.push(value, &settings)?;
            }
            Opcode::STORE_GLOBAL => {
                let name = Frame::pooled(&code.names, arg)?;
                let value = frame.pop()?;
                frame.proc.globals()?.borrow_mut().define(name, value);
            }
            Opcode::DELETE_GLOBAL => {
                let name = Frame::pooled(&code.names, arg)?;
                if frame.proc.globals()?.borrow_mut().remove(name).is_none() {
                    return Err(ErrorCause::UndefinedVariable { name: name.clone() });
                }
            }
            Opcode::LOAD_GLOBAL => {
                let name = Frame::pooled(&code.names, arg)?;
                let value = frame.proc.globals()?.borrow().lookup(name).cloned().ok_or_else(|| ErrorCause::UndefinedVariable { name: name.clone() })?;
                frame.push(value, &settings)?;
            }

            Opcode::UNPACK_SEQUENCE => {
                let items = frame.pop()?.items()?;
                if items.len() != arg as usize {
                    return Err(ErrorCause::UnpackLength { expected: arg as usize, got: items.len() });
                }
                for item in items.into_iter().rev() {
                    frame.push(item, &settings)?;
                }
            }
            Opcode::BUILD_TUPLE => {
                let items = frame.pop_n(arg as usize)?;
                frame.push(Value::Tuple(items), &settings)?;
            }
            Opcode::BUILD_LIST => {
                let items = frame.pop_n(arg as usize)?;
                frame.push(Value::List(items), &settings)?;
            }
            Opcode::LOAD_CONST => {
                let value = code.consts.get(arg as usize).cloned().ok_or(ErrorCause::BadPoolIndex { index: arg as usize, len: code.consts.len() })?;
                frame.push(value, &settings)?;
            }

            Opcode::COMPARE_OP => {
                let cmp = CompareOp::from_index(arg).ok_or(ErrorCause::BadPoolIndex { index: arg as usize, len: CMP_OPS.len() })?;
                let right = frame.pop()?;
                let left = frame.pop()?;
                frame.push(Value::Bool(left.compare(cmp, &right)?), &settings)?;
            }
            Opcode::IS_OP => {
                let right = frame.pop()?;
                let left = frame.pop()?;
                frame.push(Value::Bool(left.is_identical(&right) != (arg != 0)), &settings)?;
            }
            Opcode::CONTAINS_OP => {
                let container = frame.pop()?;
                let item = frame.pop()?;
                frame.push(Value::Bool(container.contains(&item)? != (arg != 0)), &settings)?;
            }

            Opcode::JUMP_FORWARD | Opcode::JUMP_ABSOLUTE => frame.pos = jump_target(op, here, arg),
            Opcode::POP_JUMP_IF_FALSE | Opcode::POP_JUMP_IF_TRUE => {
                let cond = frame.pop()?.is_truthy();
                if cond == (op == Opcode::POP_JUMP_IF_TRUE) {
                    frame.pos = jump_target(op, here, arg);
                }
            }
            Opcode::JUMP_IF_FALSE_OR_POP | Opcode::JUMP_IF_TRUE_OR_POP => {
                let cond = frame.peek(0)?.is_truthy();
                if cond == (op == Opcode::JUMP_IF_TRUE_OR_POP) {
                    frame.pos = jump_target(op, here, arg);
                } else {
                    frame.pop()?;
                }
            }

            Opcode::LOAD_FAST => {
                let value = match frame.locals.get(arg as usize) {
                    Some(Some(x)) => x.clone(),
                    Some(None) => return Err(ErrorCause::UnboundLocal { name: Frame::pooled(&code.varnames, arg)?.clone() }),
                    None => return Err(ErrorCause::BadPoolIndex { index: arg as usize, len: frame.locals.len() }),
                };
                frame.push(value, &settings)?;
            }
            Opcode::STORE_FAST => {
                let value = frame.pop()?;
                let len = frame.locals.len();
                *frame.locals.get_mut(arg as usize).ok_or(ErrorCause::BadPoolIndex { index: arg as usize, len })? = Some(value);
            }
            Opcode::DELETE_FAST => {
                let len = frame.locals.len();
                let slot = frame.locals.get_mut(arg as usize).ok_or(ErrorCause::BadPoolIndex { index: arg as usize, len })?;
                if slot.take().is_none() {
                    return Err(ErrorCause::UnboundLocal { name: Frame::pooled(&code.varnames, arg)?.clone() });
                }
            }

            Opcode::LOAD_CLOSURE | Opcode::LOAD_DEREF => {
                let value = {
                    let cells = frame.proc.cells.borrow();
                    match cells.get(arg as usize) {
                        Some(Some(x)) => x.clone(),
                        Some(None) => return Err(ErrorCause::UnboundFree { name: Frame::pooled(&code.freevars, arg)?.clone() }),
                        None => return Err(ErrorCause::BadPoolIndex { index: arg as usize, len: cells.len() }),
                    }
                };
                frame.push(value, &settings)?;
            }
            Opcode::STORE_DEREF => {
                let value = frame.pop()?;
                let mut cells = frame.proc.cells.borrow_mut();
                let len = cells.len();
                *cells.get_mut(arg as usize).ok_or(ErrorCause::BadPoolIndex { index: arg as usize, len })? = Some(value);
            }
            Opcode::DELETE_DEREF => {
                let mut cells = frame.proc.cells.borrow_mut();
                let len = cells.len();
                let slot = cells.get_mut(arg as usize).ok_or(ErrorCause::BadPoolIndex { index: arg as usize, len })?;
                if slot.take().is_none() {
                    return Err(ErrorCause::UnboundFree { name: Frame::pooled(&code.freevars, arg)?.clone() });
                }
            }

            Opcode::CALL_FUNCTION => {
                let args = frame.pop_n(arg as usize)?;
                let callee = match frame.pop()? {
                    Value::Procedure(x) => x,
                    x => return Err(ErrorCause::NotCallable { got: x.get_type() }),
                };
                if callee.is_generator() {
                    return Err(ErrorCause::NotSupported { feature: "calling a generator from bytecode" });
                }
                if depth >= settings.max_call_depth {
                    return Err(ErrorCause::CallDepthLimit { limit: settings.max_call_depth });
                }
                let frame = Frame::new(callee, args)?;
                self.frames.push(frame);
            }
        }

        Ok(StepResult::Normal)
    }
}
