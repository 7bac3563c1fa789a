use std::string::String;
use std::vec::Vec;
use std::format;
use std::vec;

use crate::bytecode::*;
use crate::opcode::*;
use crate::procedure::*;
use crate::runtime::*;

use super::*;

#[test]
fn test_asm_sqrt() {
    let (code, report) = assemble_last(include_str!("listings/sqrt.ike"), Default::default()).unwrap();
    assert_eq!(&*code.code, &[124, 0, 100, 0, 19, 0, 83, 0]);
    assert_eq!(code.consts.len(), 1);
    assert_values_eq(&code.consts[0], &Value::Float(0.5), 0.0, "consts");
    assert_eq!(code.varnames, ["n"]);
    assert_eq!(code.names.len(), 0);
    assert_eq!(code.stacksize, 2);
    assert_eq!(code.argcount, 1);
    assert_eq!(code.nlocals, 1);
    assert_eq!(code.name, "sqrt");
    assert_eq!(code.firstlineno, 4);
    assert_eq!(code.flags, flags::NEWLOCALS | flags::NOFREE);
    assert_eq!(&*code.linetable, &[2, 1, 2, 1, 2, 1, 2, 1]);
    assert_eq!(code.line_for_offset(0), Some(5));
    assert_eq!(code.line_for_offset(6), Some(8));
    assert_eq!(report.diagnostics.len(), 0);
    assert!(!report.line_table_degraded);
}

#[test]
fn test_asm_deterministic() {
    let src = include_str!("listings/fib.ike");
    let (a, _) = assemble_last(src, Default::default()).unwrap();
    let (b, _) = assemble_last(src, Default::default()).unwrap();
    assert_eq!(format!("{a:?}"), format!("{b:?}"));
}

#[test]
fn test_asm_caller_locals_shadow_globals() {
    let module = parse_module(include_str!("listings/sqrt.ike"));
    let locals: SymbolTable = [("scale", Value::Float(2.0))].into_iter().collect();
    let (code, _) = assemble(&module.decls[0], &locals, &module.bindings, &Default::default()).unwrap();
    assert_values_eq(&code.consts[0], &Value::Float(2.0), 0.0, "consts");
}

#[test]
fn test_asm_pool_uniqueness() {
    let (code, _) = assemble_last("\
def f():
    LOAD_CONST @ 1
    LOAD_CONST @ 1.0
    LOAD_CONST @ True
    LOAD_CONST @ 1
    LOAD_CONST @ 0.5
    LOAD_CONST @ 1 / 2
    BUILD_TUPLE @ 6
    LOAD_GLOBAL @ x
    STORE_GLOBAL @ 'x'
    LOAD_NAME @ y
    STORE_NAME @ y
    RETURN_VALUE
", Default::default()).unwrap();

    assert_eq!(code.consts.len(), 4);
    assert!(code.consts[0].is_identical(&Value::Int(1)));
    assert!(code.consts[1].is_identical(&Value::Float(1.0)));
    assert!(code.consts[2].is_identical(&Value::Bool(true)));
    assert!(code.consts[3].is_identical(&Value::Float(0.5)));
    assert_eq!(code.names, ["x", "y"]);
    assert_eq!(&code.code[..14], &[100, 0, 100, 1, 100, 2, 100, 0, 100, 3, 100, 3, 102, 6]);
    assert_eq!(&code.code[14..], &[116, 0, 97, 0, 101, 1, 90, 1, 83, 0]);
}

#[test]
fn test_asm_fixed_width() {
    let (code, _) = assemble_last(include_str!("listings/fib.ike"), Default::default()).unwrap();
    assert_eq!(code.code.len() % CODE_UNIT, 0);
    for unit in code.code.chunks_exact(CODE_UNIT) {
        let op = Opcode::ALL.iter().copied().find(|x| *x as u8 == unit[0]).unwrap();
        if !op.has_argument() {
            assert_eq!(unit[1], 0, "{op:?}");
        }
    }
}

#[test]
fn test_asm_labels() {
    let (code, report) = assemble_last("\
def pick(x):
    LOAD_FAST @ x
    POP_JUMP_IF_TRUE @ YES
    LOAD_CONST @ 0
    RETURN_VALUE
    LOAD_CONST @ 1 << YES
    RETURN_VALUE
", Default::default()).unwrap();
    assert_eq!(&*code.code, &[124, 0, 115, 4, 100, 0, 83, 0, 100, 1, 83, 0]);
    assert_eq!(report.diagnostics.len(), 0);

    let (code, _) = assemble_last("\
def skip():
    JUMP_FORWARD @ END
    NOP
    NOP
  END:
    LOAD_CONST @ None
    RETURN_VALUE
", Default::default()).unwrap();
    assert_eq!(&*code.code, &[110, 2, 9, 0, 9, 0, 100, 0, 83, 0]);

    let (code, _) = assemble_last("\
def fib(n):
    LOAD_FAST @ n
    LOAD_CONST @ 2
    COMPARE_OP @ '<'
    POP_JUMP_IF_FALSE @ 'RECURSE'
    LOAD_FAST @ n
    RETURN_VALUE
  RECURSE:
    LOAD_FAST @ n
    RETURN_VALUE
", Default::default()).unwrap();
    assert_eq!(&code.code[4..8], &[107, 0, 114, 6]);
}

#[test]
fn test_asm_wide_operands() {
    let mut src = String::from("def wide():\n");
    for i in 0..300 {
        src.push_str(&format!("    LOAD_CONST @ {i}\n    POP_TOP\n"));
    }
    src.push_str("    JUMP_ABSOLUTE @ END\n    NOP\n  END:\n    LOAD_CONST @ None\n    RETURN_VALUE\n");

    let (code, report) = assemble_last(&src, Default::default()).unwrap();
    assert_eq!(code.consts.len(), 301);
    assert_eq!(code.code.len(), 650 * CODE_UNIT);
    assert_eq!(&code.code[255 * 4..256 * 4], &[100, 255, 1, 0]);
    assert_eq!(&code.code[512 * 2..515 * 2], &[144, 1, 100, 0, 1, 0]);
    assert_eq!(&code.code[641 * 2..643 * 2], &[144, 1, 100, 43]);
    assert_eq!(&code.code[644 * 2..647 * 2], &[144, 2, 113, 0x87, 9, 0]);
    assert_eq!(&code.code[647 * 2..], &[144, 1, 100, 44, 83, 0]);
    assert_eq!(read_instruction(&code.code, 644), Ok((Opcode::JUMP_ABSOLUTE, 647, 646)));
    assert_eq!(report.diagnostics.len(), 0);
    assert_eq!(code.stacksize, 1);
    assert!(!report.line_table_degraded);
    assert_eq!(code.line_for_offset(647 * 2), code.line_for_offset(648 * 2));
}

#[test]
fn test_asm_unsafe_diagnostics() {
    let spin = "\
def spin():
  TOP:
    LOAD_CONST @ 1
    JUMP_ABSOLUTE @ TOP
";
    match assemble_last(spin, Default::default()) {
        Err(AssembleError::UnsafeBytecode { warnings }) => {
            assert_eq!(warnings.len(), 2);
            assert_eq!(warnings[0].kind, UnsafeKind::NonZeroBeforeJump);
            assert_eq!((warnings[0].index, warnings[0].branch), (1, None));
            assert_eq!((warnings[1].index, warnings[1].branch), (1, Some(1)));
            assert_eq!(format!("{}", warnings[1]), "non-zero stack effect before jump: [1->1] JUMP_ABSOLUTE 0");
        }
        x => panic!("{x:?}"),
    }

    let (code, report) = assemble_last(spin, warn_settings()).unwrap();
    assert_eq!(report.diagnostics.len(), 2);
    assert_eq!(code.stacksize, 2);

    let ignore = Settings { unsafe_policy: UnsafePolicy::Ignore, ..Default::default() };
    let (_, report) = assemble_last(spin, ignore).unwrap();
    assert_eq!(report.diagnostics.len(), 2);

    let (_, report) = assemble_last("\
def underflow():
    POP_TOP
    LOAD_CONST @ None
    RETURN_VALUE
", warn_settings()).unwrap();
    assert_eq!(report.diagnostics.len(), 2);
    assert_eq!(report.diagnostics[0].kind, UnsafeKind::EmptyStackPop);
    assert_eq!(format!("{}", report.diagnostics[0]), "possible pop from empty stack: [0] POP_TOP 0");
    assert_eq!(report.diagnostics[1].index, 2);

    let (_, report) = assemble_last(include_str!("listings/fib.ike"), Default::default()).unwrap();
    assert_eq!(report.diagnostics.len(), 0);
}

#[test]
fn test_asm_flags() {
    let (code, _) = assemble_last(include_str!("listings/fib_iter.ike"), Default::default()).unwrap();
    assert_eq!(code.flags, flags::GENERATOR | flags::NEWLOCALS | flags::NOFREE);
    assert_eq!(code.stacksize, 3);
    assert_eq!(code.varnames, ["n", "a", "b"]);
    let units = code.code.len();
    for (end, line) in decode_line_table(code.firstlineno, &code.linetable) {
        assert!(end <= units);
        assert!(line > code.firstlineno && line <= 32, "{line}");
    }

    let (code, _) = assemble_last("def one(): LOAD_CONST @ 1; RETURN_VALUE", Default::default()).unwrap();
    assert_eq!(code.flags, flags::NOFREE);
    assert_eq!(code.nlocals, 0);

    let (code, _) = assemble_last("\
async def agen():
    LOAD_CONST @ 1
    YIELD_VALUE
    RETURN_VALUE
", Default::default()).unwrap();
    assert_eq!(code.flags, flags::ASYNC_GENERATOR | flags::NOFREE);

    let (code, _) = assemble_last("async def coro(): LOAD_CONST @ 1; RETURN_VALUE", Default::default()).unwrap();
    assert_eq!(code.flags, flags::COROUTINE | flags::NOFREE);

    let (code, _) = assemble_last("def pack(first, *rest, **kw): LOAD_FAST @ rest; RETURN_VALUE", Default::default()).unwrap();
    assert_eq!(code.flags, flags::VARARGS | flags::VARKEYWORDS | flags::NEWLOCALS | flags::NOFREE);
    assert_eq!(code.varnames, ["first", "rest", "kw"]);
    assert_eq!(code.argcount, 1);

    let (code, _) = assemble_last("\
def counter():
    nonlocal count
    LOAD_DEREF @ count
    RETURN_VALUE
", Default::default()).unwrap();
    assert_eq!(code.flags, flags::NESTED);
    assert_eq!(code.freevars, ["count"]);
    assert_eq!(code.nlocals, 0);
}

#[test]
fn test_asm_line_table_overflow() {
    let mut src = String::from("def far():\n    LOAD_CONST @ 1\n");
    for _ in 0..200 {
        src.push('\n');
    }
    src.push_str("    RETURN_VALUE\n");

    let (code, report) = assemble_last(&src, Default::default()).unwrap();
    assert!(report.line_table_degraded);
    assert_eq!(code.linetable.len(), 0);
    assert_eq!(code.line_for_offset(0), None);
    assert_eq!(code.code.len(), 4);
}

#[test]
fn test_asm_options() {
    let (code, _) = assemble_last("\
def opts():
    FLAGS |= 0x1
    STACK_SIZE = 10
    LOAD_CONST @ None
    RETURN_VALUE
", Default::default()).unwrap();
    assert_eq!(code.flags, flags::OPTIMIZED | flags::NOFREE);
    assert_eq!(code.stacksize, 10);

    let err = assemble_last("\
def opts():
    LOAD_CONST @ None
    RETURN_VALUE
    STACK_SIZE = STACK_SIZE + 2
    CONSTS += (5, 'five')
    NAMES = ('unused',)
    FLAGS &= ~NOFREE_BIT
", Default::default()).unwrap_err();
    assert_eq!(err, AssembleError::Resolution { symbol: "NOFREE_BIT".into(), index: 2, line: 7 });

    let (code, _) = assemble_last("\
NOFREE_BIT = 0x40

def opts():
    LOAD_CONST @ None
    RETURN_VALUE
    STACK_SIZE = STACK_SIZE + 2
    CONSTS += (5, 'five')
    NAMES = ('unused',)
    FLAGS &= ~NOFREE_BIT
", Default::default()).unwrap();
    assert_eq!(code.stacksize, 3);
    assert_eq!(code.consts.len(), 3);
    assert!(code.consts[2].is_identical(&Value::from("five")));
    assert_eq!(code.names, ["unused"]);
    assert_eq!(code.flags, 0);

    assert_eq!(assemble_last("def f():\n    BOGUS = 1\n    LOAD_CONST @ 1\n    RETURN_VALUE\n", Default::default()).unwrap_err(),
        AssembleError::UnknownOption { name: "BOGUS".into(), line: 2 });
    assert_eq!(assemble_last("def f():\n    STACK_SIZE = 'big'\n    LOAD_CONST @ 1\n    RETURN_VALUE\n", Default::default()).unwrap_err(),
        AssembleError::OptionType { name: "STACK_SIZE".into(), expected: "an int in 0..=4294967295", got: Type::Str, line: 2 });
}

#[test]
fn test_asm_option_scope() {
    let src = "\
EXTRA = 100
LIMIT = 1

def opts():
    STACK_SIZE = STACK_SIZE + EXTRA
    FLAGS |= MARK
    LOAD_CONST @ None
    BUILD_LIST % LIMIT
    RETURN_VALUE
";
    let locals: SymbolTable = [("EXTRA", Value::Int(5)), ("MARK", Value::Int(flags::ITERABLE_COROUTINE as i64)), ("LIMIT", Value::Int(1))].into_iter().collect();
    let (code, _) = assemble_last_with(src, &locals, Default::default()).unwrap();
    assert_eq!(code.stacksize, 6);
    assert!(code.has_flag(flags::ITERABLE_COROUTINE));
    assert_eq!(&code.code[2..4], &[Opcode::BUILD_LIST as u8, 1]);

    let locals: SymbolTable = [("EXTRA", Value::Int(0)), ("MARK", Value::Int(0)), ("LIMIT", Value::Int(7))].into_iter().collect();
    let (code, _) = assemble_last_with(src, &locals, warn_settings()).unwrap();
    assert_eq!(code.stacksize, 1);
    assert_eq!(&code.code[2..4], &[Opcode::BUILD_LIST as u8, 7]);

    let err = assemble_last_with(src, &SymbolTable::default(), Default::default()).unwrap_err();
    assert_eq!(err, AssembleError::Resolution { symbol: "MARK".into(), index: 3, line: 6 });
}

#[test]
fn test_asm_option_derived_values_shadow_locals() {
    let src = "\
FLAGS = 0x7fff
STACK_SIZE = 1000

def opts():
    STACK_SIZE = STACK_SIZE * 2
    FLAGS ^= FLAGS
    NAMES = NAMES + ('extra',)
    LOAD_GLOBAL @ g
    RETURN_VALUE
";
    let locals: SymbolTable = [("STACK_SIZE", Value::Int(50)), ("FLAGS", Value::Int(0xffff)), ("NAMES", Value::Tuple(vec![]))].into_iter().collect();
    let (code, _) = assemble_last_with(src, &locals, Default::default()).unwrap();
    assert_eq!(code.stacksize, 2);
    assert_eq!(code.flags, 0);
    assert_eq!(code.names, ["g", "extra"]);
}

#[cfg(feature = "cli")]
#[test]
fn test_asm_serde_fingerprint() {
    let ns = load_namespace(include_str!("listings/fib.ike"), Default::default());
    let code = ns.procedure("fib").unwrap().code().clone();
    let json = serde_json::to_string(&*code).unwrap();

    let loaded: CodeUnit = serde_json::from_str(&json).unwrap();
    assert_eq!(loaded.code, code.code);
    assert_eq!(loaded.linetable, code.linetable);
    assert_eq!((loaded.stacksize, loaded.flags, loaded.firstlineno), (code.stacksize, code.flags, code.firstlineno));
    assert_eq!(loaded.names, code.names);
    assert_eq!(loaded.varnames, code.varnames);
    assert_eq!(loaded.consts.len(), code.consts.len());
    for (a, b) in loaded.consts.iter().zip(code.consts.iter()) {
        assert!(a.is_identical(b), "{a} vs {b}");
    }
    let proc = Procedure::new(loaded, ns.globals(), &SymbolTable::default());
    assert_values_eq(&proc.call(vec![Value::Int(10)], ns.settings()).unwrap(), &Value::Int(55), 0.0, "fib(10)");

    let mut stale: serde_json::Value = serde_json::from_str(&json).unwrap();
    assert_eq!(stale["tag"], serde_json::json!(crate::meta::FINGERPRINT));
    stale["tag"] = serde_json::json!(crate::meta::FINGERPRINT ^ 1);
    assert!(serde_json::from_value::<CodeUnit>(stale).is_err());
}

#[test]
fn test_asm_errors() {
    let err = |src: &str| assemble_last(src, Default::default()).unwrap_err();

    assert_eq!(err("def f():\n    JUMP_ABSOLUTE @ NOWHERE\n"), AssembleError::Resolution { symbol: "NOWHERE".into(), index: 0, line: 2 });
    assert_eq!(err("def f():\n    LOAD_CONST @ missing\n    RETURN_VALUE\n"), AssembleError::Resolution { symbol: "missing".into(), index: 0, line: 2 });
    assert_eq!(err("def f():\n    LOAD_CONSTANT @ 1\n"), AssembleError::UnknownOpcode { opcode: "LOAD_CONSTANT".into(), line: 2 });
    assert_eq!(err("def f():\n  A:\n  A:\n    NOP\n"), AssembleError::DuplicateLabel { label: "A".into(), line: 3 });
    assert_eq!(err("def f():\n    NOP << A\n    JUMP_FORWARD @ A\n"),
        AssembleError::BackwardRelativeJump { opcode: Opcode::JUMP_FORWARD, label: "A".into(), index: 1, line: 3 });
    assert_eq!(err("def f():\n    BUILD_TUPLE % -1\n"), AssembleError::OperandRange { opcode: Opcode::BUILD_TUPLE, value: -1, index: 0, line: 2 });
    assert_eq!(err("def f():\n    LOAD_CONST @ 1 // 0\n"), AssembleError::Eval { cause: ErrorCause::ZeroDivision, line: 2 });
    assert_eq!(err("def f():\n    LOAD_CONST @ 'ab' * 4611686018427387904\n    RETURN_VALUE\n"), AssembleError::Eval { cause: ErrorCause::Overflow, line: 2 });
    assert_eq!(err("def f():\n    LOAD_CONST @ (1, 2) * (1 << 62)\n    RETURN_VALUE\n"), AssembleError::Eval { cause: ErrorCause::Overflow, line: 2 });
    assert_eq!(err("def f():\n    CONSTS += (None,) * 10 ** 18\n    LOAD_CONST @ 1\n    RETURN_VALUE\n"), AssembleError::Eval { cause: ErrorCause::Overflow, line: 2 });
    match err("def f():\n    LOAD_CONST @ 1\n    LOAD_CONST @ 2\n    COMPARE_OP @ '<>'\n") {
        AssembleError::BadOperand { opcode: Opcode::COMPARE_OP, index: 2, line: 4, .. } => (),
        x => panic!("{x:?}"),
    }
    match err("def f():\n    LOAD_GLOBAL @ 12\n") {
        AssembleError::BadOperand { opcode: Opcode::LOAD_GLOBAL, index: 0, line: 2, .. } => (),
        x => panic!("{x:?}"),
    }
}

#[test]
fn test_asm_raw_operands() {
    let (code, _) = assemble_last("\
WIDTH = 3

def f():
    LOAD_CONST @ 1
    LOAD_CONST @ 2
    LOAD_CONST @ 3
    BUILD_LIST % WIDTH
    COMPARE_OP % 2
    LOAD_CONST @ 1 % 2
    RETURN_VALUE
", warn_settings()).unwrap();
    assert_eq!(code.code[7], 3);
    assert_eq!(&code.code[8..10], &[107, 2]);
    assert_eq!(code.consts.len(), 3);

    let locals: SymbolTable = [("WIDTH", Value::Int(300))].into_iter().collect();
    let (code, _) = assemble_last_with("\
WIDTH = 3

def f():
    BUILD_LIST % WIDTH
    RETURN_VALUE
", &locals, warn_settings()).unwrap();
    assert_eq!(&code.code[..4], &[Opcode::EXTENDED_ARG as u8, 1, Opcode::BUILD_LIST as u8, 44]);
    assert_eq!(code.consts.len(), 0);
}

#[cfg(feature = "std")]
#[test]
fn test_asm_dump() {
    let (code, _) = assemble_last(include_str!("listings/fib.ike"), Default::default()).unwrap();

    let mut listing = vec![];
    code.dump_code(&mut listing).unwrap();
    let listing = String::from_utf8(listing).unwrap();
    let lines: Vec<&str> = listing.lines().collect();
    assert_eq!(lines.len(), 18);
    assert!(lines[0].trim_start().starts_with("2 "), "{}", lines[0]);
    assert!(lines[2].contains("COMPARE_OP") && lines[2].contains("(<)"), "{}", lines[2]);
    assert!(lines[3].contains("POP_JUMP_IF_FALSE") && lines[3].contains("(to 12)"), "{}", lines[3]);
    assert!(lines[6].contains(">> 000012") && lines[6].contains("(fib)"), "{}", lines[6]);

    let mut meta = vec![];
    code.dump_meta(&mut meta).unwrap();
    let meta = String::from_utf8(meta).unwrap();
    assert!(meta.contains("stack size:        4"), "{meta}");
    assert!(meta.contains("NEWLOCALS NOFREE"), "{meta}");
}
