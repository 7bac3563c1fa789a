use std::format;
use std::iter;

use crate::bytecode::*;
use crate::procedure::*;
use crate::runtime::*;
use crate::source::*;

mod assembler;
mod source;

fn parse_module(src: &str) -> Module {
    Module::parse("<test>", src).unwrap_or_else(|e| panic!("{e}"))
}

/// Assembles the last procedure declared in `src`, with no caller locals.
fn assemble_last(src: &str, settings: Settings) -> Result<(CodeUnit, Report), AssembleError> {
    assemble_last_with(src, &SymbolTable::default(), settings)
}
fn assemble_last_with(src: &str, locals: &SymbolTable, settings: Settings) -> Result<(CodeUnit, Report), AssembleError> {
    let module = parse_module(src);
    let decl = module.decls.last().expect("no procedures in module");
    assemble(decl, locals, &module.bindings, &settings)
}

fn load_namespace(src: &str, settings: Settings) -> Namespace {
    let module = parse_module(src);
    match Namespace::load(&module, &SymbolTable::default(), settings) {
        Ok((ns, _)) => ns,
        Err(e) => panic!("{e}"),
    }
}

fn warn_settings() -> Settings {
    Settings { unsafe_policy: UnsafePolicy::Warn, ..Default::default() }
}

fn assert_values_eq(got: &Value, expected: &Value, epsilon: f64, path: &str) {
    if got.get_type() != expected.get_type() {
        panic!("{} - type error - got {} expected {} - {}", path, got.get_type(), expected.get_type(), got);
    }
    match (got, expected) {
        (Value::Float(got), Value::Float(expected)) => {
            let good = if got.is_finite() && expected.is_finite() { (got - expected).abs() <= epsilon } else { got.to_bits() == expected.to_bits() };
            if !good { panic!("{} - number error - got {} expected {}", path, got, expected) }
        }
        (Value::Tuple(got), Value::Tuple(expected)) | (Value::List(got), Value::List(expected)) => {
            if got.len() != expected.len() { panic!("{} - len error - got {} expected {}\ngot:      {:?}\nexpected: {:?}", path, got.len(), expected.len(), got, expected) }

            for (i, (got, expected)) in iter::zip(got.iter(), expected.iter()).enumerate() {
                assert_values_eq(got, expected, epsilon, &format!("{}[{}]", path, i));
            }
        }
        (got, expected) => if !got.equals(expected) { panic!("{} - value error - got {} expected {}", path, got, expected) }
    }
}
