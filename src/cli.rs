//! The `ike` command line tool: assembles listing files, runs procedures from them and dumps the compiled code.

use std::string::String;
use std::vec::Vec;
use std::fs::File;
use std::io::{self, Read};
use std::println;
use std::eprintln;
use std::format;
use std::borrow::ToOwned;

use clap::Parser;
use compact_str::CompactString;
use serde::Serialize;

use crate::bytecode::*;
use crate::expr::*;
use crate::procedure::*;
use crate::runtime::*;
use crate::source::*;
use crate::util::base64_encode;

macro_rules! crash {
    ($ret:literal : $($tt:tt)*) => {{
        std::eprintln!($($tt)*);
        std::process::exit($ret);
    }}
}

/// How to handle bytecode that might pop from an empty stack.
#[derive(clap::ValueEnum, Debug, Clone, Copy)]
pub enum Policy {
    /// Refuse to load the procedure
    Error,
    /// Load the procedure and print the diagnostics
    Warn,
    /// Load the procedure silently
    Ignore,
}
impl From<Policy> for UnsafePolicy {
    fn from(value: Policy) -> Self {
        match value {
            Policy::Error => UnsafePolicy::Error,
            Policy::Warn => UnsafePolicy::Warn,
            Policy::Ignore => UnsafePolicy::Ignore,
        }
    }
}

/// Actions that can be performed on a listing file
#[derive(Parser, Debug)]
pub enum Mode {
    /// Assembles a listing file and runs one of its procedures
    Run {
        /// Path to the listing file
        src: String,
        /// Name of the procedure to run
        proc: String,

        /// An argument expression to pass to the procedure (repeatable)
        #[clap(long = "arg")]
        args: Vec<String>,
        /// A caller local binding of the form NAME=EXPR (repeatable)
        #[clap(long)]
        bind: Vec<String>,
        /// Handling of possibly unsafe bytecode
        #[clap(long = "unsafe", value_enum, default_value_t = Policy::Error)]
        policy: Policy,
        /// Maximum depth of nested procedure calls
        #[clap(long, default_value_t = Settings::default().max_call_depth)]
        max_depth: usize,
    },
    /// Assembles a listing file and dumps the compiled procedures to stdout
    Dump {
        /// Path to the listing file
        src: String,
        /// The specific procedure to dump, or all of them if omitted
        proc: Option<String>,

        /// A caller local binding of the form NAME=EXPR (repeatable)
        #[clap(long)]
        bind: Vec<String>,
        /// Handling of possibly unsafe bytecode
        #[clap(long = "unsafe", value_enum, default_value_t = Policy::Warn)]
        policy: Policy,
        /// Dump as json rather than a disassembly listing
        #[clap(long)]
        json: bool,
    },
    /// Assembles a listing file and reports any errors or diagnostics
    Check {
        /// Path to the listing file
        src: String,

        /// A caller local binding of the form NAME=EXPR (repeatable)
        #[clap(long)]
        bind: Vec<String>,
    },
}

/// The json form of a compiled procedure, with byte strings encoded as base64.
#[derive(Serialize)]
struct CodeJson<'a> {
    name: &'a str,
    filename: &'a str,
    firstlineno: u32,
    argcount: usize,
    posonlyargcount: usize,
    kwonlyargcount: usize,
    nlocals: usize,
    stacksize: u32,
    flags: u32,
    code: String,
    consts: &'a [Value],
    names: &'a [CompactString],
    varnames: &'a [CompactString],
    freevars: &'a [CompactString],
    linetable: String,
}
impl<'a> From<&'a CodeUnit> for CodeJson<'a> {
    fn from(code: &'a CodeUnit) -> Self {
        CodeJson {
            name: &code.name,
            filename: &code.filename,
            firstlineno: code.firstlineno,
            argcount: code.argcount,
            posonlyargcount: code.posonlyargcount,
            kwonlyargcount: code.kwonlyargcount,
            nlocals: code.nlocals,
            stacksize: code.stacksize,
            flags: code.flags,
            code: base64_encode(&code.code),
            consts: &code.consts,
            names: &code.names,
            varnames: &code.varnames,
            freevars: &code.freevars,
            linetable: base64_encode(&code.linetable),
        }
    }
}

fn read_file(src: &str) -> io::Result<String> {
    let mut file = File::open(src)?;
    let mut s = String::new();
    file.read_to_string(&mut s)?;
    Ok(s)
}
fn open_module(src: &str) -> Module {
    let content = read_file(src).unwrap_or_else(|e| crash!(1: "failed to read file '{src}': {e}"));
    Module::parse(src, &content).unwrap_or_else(|e| crash!(2: "{src}: {e}"))
}
fn eval_expr(text: &str, scope: &LookupGroup) -> Value {
    let expr = match tokenize(text).and_then(|tokens| Expr::parse(&tokens)) {
        Ok(x) => x,
        Err(e) => crash!(5: "invalid expression '{text}': {e}"),
    };
    expr.eval(scope).unwrap_or_else(|e| crash!(5: "failed to evaluate '{text}': {e}"))
}
/// Evaluates `NAME=EXPR` bindings in order, each one seeing the previous ones ahead of the module bindings.
fn caller_locals(binds: &[String], module: &Module) -> SymbolTable {
    let mut locals = SymbolTable::default();
    for bind in binds {
        let (name, expr) = match bind.split_once('=') {
            Some((name, expr)) if !name.trim().is_empty() => (name.trim(), expr),
            _ => crash!(5: "invalid binding '{bind}' (expected NAME=EXPR)"),
        };
        let value = eval_expr(expr, &LookupGroup(&[&locals, &module.bindings]));
        locals.define(name, value);
    }
    locals
}
fn print_report(report: &Report) {
    for warning in report.diagnostics.iter() {
        eprintln!("{}: {warning}", report.procedure);
    }
    if report.line_table_degraded {
        eprintln!("{}: line table could not be encoded and was left empty", report.procedure);
    }
}

/// Runs the CLI using the given [`Mode`] configuration.
pub fn run(mode: Mode) {
    match mode {
        Mode::Run { src, proc, args, bind, policy, max_depth } => {
            let module = open_module(&src);
            let locals = caller_locals(&bind, &module);
            let settings = Settings { unsafe_policy: policy.into(), max_call_depth: max_depth, ..Default::default() };

            let (namespace, reports) = Namespace::load(&module, &locals, settings).unwrap_or_else(|e| crash!(3: "{src}: {e}"));
            reports.iter().for_each(print_report);

            let target = namespace.procedure(&proc).unwrap_or_else(|| crash!(4: "no procedure named '{proc}'"));
            let args: Vec<Value> = {
                let globals = namespace.globals().borrow();
                args.iter().map(|x| eval_expr(x, &LookupGroup(&[&locals, &*globals]))).collect()
            };

            if target.is_generator() {
                let iter = target.iter(args, &settings).unwrap_or_else(|e| crash!(6: "{e}"));
                for value in iter {
                    match value {
                        Ok(x) => println!("{x}"),
                        Err(e) => crash!(6: "{e}"),
                    }
                }
            } else {
                match target.call(args, &settings) {
                    Ok(x) => println!("{x}"),
                    Err(e) => crash!(6: "{e}"),
                }
            }
        }
        Mode::Dump { src, proc, bind, policy, json } => {
            let module = open_module(&src);
            let locals = caller_locals(&bind, &module);
            let settings = Settings { unsafe_policy: policy.into(), ..Default::default() };
            let namespace = Namespace::new(module.bindings.clone(), settings);

            let mut procs = Vec::with_capacity(module.decls.len());
            for decl in module.decls.iter() {
                let (installed, report) = namespace.install(decl, &locals).unwrap_or_else(|e| crash!(3: "{src}: {e}"));
                print_report(&report);
                if proc.as_deref().map(|x| x == decl.name.as_str()).unwrap_or(true) {
                    procs.push(installed);
                }
            }
            if let Some(name) = &proc {
                if procs.is_empty() { crash!(4: "no procedure named '{name}'") }
            }

            if json {
                let units: Vec<CodeJson> = procs.iter().map(|x| CodeJson::from(&**x.code())).collect();
                let content = serde_json::to_string_pretty(&units).unwrap_or_else(|e| crash!(7: "failed to serialize: {e}"));
                println!("{content}");
            } else {
                let mut stdout = io::stdout().lock();
                for (i, installed) in procs.iter().enumerate() {
                    if i != 0 { println!(); }
                    let code = installed.code();
                    code.dump_meta(&mut stdout).unwrap_or_else(|e| crash!(7: "failed to write: {e}"));
                    println!("instructions:");
                    code.dump_code(&mut stdout).unwrap_or_else(|e| crash!(7: "failed to write: {e}"));
                }
            }
        }
        Mode::Check { src, bind } => {
            let module = open_module(&src);
            let locals = caller_locals(&bind, &module);
            let settings = Settings { unsafe_policy: UnsafePolicy::Ignore, ..Default::default() };
            let namespace = Namespace::new(module.bindings.clone(), settings);

            let mut failed = false;
            for decl in module.decls.iter() {
                match namespace.install(decl, &locals) {
                    Ok((installed, report)) => {
                        let code = installed.code();
                        println!("{}: ok ({} bytes, stack size {}, flags 0x{:04x})", decl.name, code.code.len(), code.stacksize, code.flags);
                        print_report(&report);
                    }
                    Err(e) => {
                        println!("{}: error: {}", decl.name, e.error);
                        failed = true;
                    }
                }
            }
            if failed { std::process::exit(3) }
        }
    }
}
