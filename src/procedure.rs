//! Assembled procedures and the namespaces that define them.

use alloc::rc::{Rc, Weak};
use alloc::vec::Vec;

use core::cell::RefCell;
use core::fmt;

use compact_str::CompactString;

use crate::bytecode::*;
use crate::opcode::flags;
use crate::process::*;
use crate::runtime::*;
use crate::source::*;

/// An error from installing a procedure into a [`Namespace`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadError {
    pub procedure: CompactString,
    pub error: AssembleError,
}
impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to assemble {}: {}", self.procedure, self.error)
    }
}
#[cfg(feature = "std")]
impl std::error::Error for LoadError {}

/// An executable procedure: a compiled [`CodeUnit`] bound to the namespace that defined it.
pub struct Procedure {
    code: Rc<CodeUnit>,
    globals: Weak<RefCell<SymbolTable>>,
    pub(crate) cells: RefCell<Vec<Option<Value>>>,
}
impl fmt::Debug for Procedure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Procedure").field("name", &self.code.name).finish_non_exhaustive()
    }
}
impl Procedure {
    /// Wraps a code unit, with free slots initialized from `cells` by name.
    pub fn new(code: CodeUnit, globals: &Rc<RefCell<SymbolTable>>, cells: &SymbolTable) -> Rc<Self> {
        let init = code.freevars.iter().map(|x| cells.lookup(x).cloned()).collect();
        Rc::new(Self { code: Rc::new(code), globals: Rc::downgrade(globals), cells: RefCell::new(init) })
    }
    pub fn name(&self) -> &str {
        &self.code.name
    }
    pub fn code(&self) -> &Rc<CodeUnit> {
        &self.code
    }
    pub(crate) fn globals(&self) -> Result<Rc<RefCell<SymbolTable>>, ErrorCause> {
        self.globals.upgrade().ok_or(ErrorCause::DetachedNamespace)
    }
    pub fn is_generator(&self) -> bool {
        self.code.flags & (flags::GENERATOR | flags::ASYNC_GENERATOR | flags::COROUTINE) != 0
    }
    /// Binds call arguments into a fresh set of local slots.
    ///
    /// Positional parameters come first, then keyword-only ones, then the `*args` and `**kw` slots.
    /// Extra positional arguments are collected into the `*args` tuple, and `**kw` is bound to `None`.
    pub(crate) fn bind_args(&self, args: Vec<Value>) -> Result<Vec<Option<Value>>, ErrorCause> {
        let code = &self.code;
        let varargs = code.flags & flags::VARARGS != 0;
        let varkw = code.flags & flags::VARKEYWORDS != 0;

        if code.kwonlyargcount != 0 {
            return Err(ErrorCause::NotSupported { feature: "keyword-only parameters" });
        }
        if args.len() < code.argcount || (!varargs && args.len() > code.argcount) {
            return Err(ErrorCause::ArgCount { expected: code.argcount, got: args.len() });
        }

        let slots = code.argcount + varargs as usize + varkw as usize;
        let mut locals = alloc::vec![None; code.nlocals.max(code.varnames.len()).max(slots)];
        let mut args = args.into_iter();
        for slot in locals.iter_mut().take(code.argcount) {
            *slot = args.next();
        }
        let mut next = code.argcount;
        if varargs {
            locals[next] = Some(Value::Tuple(args.collect()));
            next += 1;
        }
        if varkw {
            locals[next] = Some(Value::None);
        }
        Ok(locals)
    }
    /// Calls a non-generator procedure and runs it to completion.
    pub fn call(self: &Rc<Self>, args: Vec<Value>, settings: &Settings) -> Result<Value, ExecError> {
        if self.is_generator() {
            return Err(ExecError::new(ErrorCause::NotSupported { feature: "calling a generator (iterate it instead)" }, self, 0));
        }
        let mut proc = Process::new(self.clone(), args, *settings)?;
        loop {
            match proc.step()? {
                StepResult::Normal => (),
                StepResult::Terminate { value } => return Ok(value),
                StepResult::Yield { .. } => return Err(ExecError::new(ErrorCause::UnexpectedYield, self, proc.last_offset())),
                StepResult::Idle => unreachable!(),
            }
        }
    }
    /// Starts a generator procedure, returning an iterator over the values it yields.
    /// Each yield expression evaluates to `None` when the generator is resumed.
    pub fn iter(self: &Rc<Self>, args: Vec<Value>, settings: &Settings) -> Result<Generator, ExecError> {
        Ok(Generator { proc: Process::new(self.clone(), args, *settings)? })
    }
}

/// A running generator procedure.
pub struct Generator {
    proc: Process,
}
impl Iterator for Generator {
    type Item = Result<Value, ExecError>;
    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.proc.step() {
                Ok(StepResult::Normal) => (),
                Ok(StepResult::Yield { value }) => return Some(Ok(value)),
                Ok(StepResult::Terminate { .. } | StepResult::Idle) => return None,
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

/// The defining scope of a set of procedures.
pub struct Namespace {
    globals: Rc<RefCell<SymbolTable>>,
    settings: Settings,
}
impl Namespace {
    pub fn new(bindings: SymbolTable, settings: Settings) -> Self {
        Self { globals: Rc::new(RefCell::new(bindings)), settings }
    }
    /// Creates a namespace from the bindings of a module and installs each of its procedures in source order.
    /// Caller `locals` are visible to operand and option expressions ahead of the module bindings.
    /// Returns one [`Report`] per installed procedure.
    pub fn load(module: &Module, locals: &SymbolTable, settings: Settings) -> Result<(Self, Vec<Report>), LoadError> {
        let res = Self::new(module.bindings.clone(), settings);
        let mut reports = Vec::with_capacity(module.decls.len());
        for decl in module.decls.iter() {
            reports.push(res.install(decl, locals)?.1);
        }
        Ok((res, reports))
    }
    /// Assembles a declaration and binds the resulting procedure to its name, replacing any previous binding.
    /// On failure, the namespace is left untouched.
    pub fn install(&self, decl: &ProcedureDecl, locals: &SymbolTable) -> Result<(Rc<Procedure>, Report), LoadError> {
        let (code, report) = {
            let globals = self.globals.borrow();
            assemble(decl, locals, &globals, &self.settings).map_err(|error| LoadError { procedure: decl.name.clone(), error })?
        };
        let proc = Procedure::new(code, &self.globals, locals);
        self.globals.borrow_mut().define(&decl.name, Value::Procedure(proc.clone()));
        Ok((proc, report))
    }
    pub fn define(&self, name: &str, value: Value) -> Option<Value> {
        self.globals.borrow_mut().define(name, value)
    }
    pub fn lookup(&self, name: &str) -> Option<Value> {
        self.globals.borrow().lookup(name).cloned()
    }
    pub fn procedure(&self, name: &str) -> Option<Rc<Procedure>> {
        match self.lookup(name) {
            Some(Value::Procedure(x)) => Some(x),
            _ => None,
        }
    }
    pub fn settings(&self) -> &Settings {
        &self.settings
    }
    pub fn globals(&self) -> &Rc<RefCell<SymbolTable>> {
        &self.globals
    }
}
