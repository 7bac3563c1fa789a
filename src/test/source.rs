use std::vec::Vec;
use std::format;

use crate::expr::*;
use crate::opcode::flags;
use crate::runtime::*;
use crate::source::*;

use super::*;

fn parse_err(src: &str) -> ParseError {
    Module::parse("<test>", src).unwrap_err()
}

#[test]
fn test_src_module() {
    let module = parse_module(include_str!("listings/sqrt.ike"));
    assert_eq!(module.filename, "<test>");
    assert_eq!(module.bindings.len(), 1);
    assert!(module.bindings.lookup("scale").unwrap().is_identical(&Value::Float(0.5)));
    assert_eq!(module.decls.len(), 1);

    let decl = module.decl("sqrt").unwrap();
    assert_eq!(decl.first_line, 4);
    assert_eq!(decl.params.positional, ["n"]);
    assert_eq!(decl.flags, 0);
    assert_eq!(decl.body.len(), 4);
    assert_eq!(decl.body.iter().map(Statement::line).collect::<Vec<_>>(), [5, 6, 7, 8]);
    match &decl.body[1] {
        Statement::Instruction { opcode, operand: Some(Operand::Resolved(expr)), label: None, line: 6 } => {
            assert_eq!(opcode, "LOAD_CONST");
            assert_eq!(expr.as_ident(), Some("scale"));
        }
        x => panic!("{x:?}"),
    }
}

#[test]
fn test_src_bindings_in_order() {
    let module = parse_module("\
base = 10
offset = base * 2 + 1
names = ('a', 'b')
# comment
both = names + ('c',)
");
    assert!(module.bindings.lookup("offset").unwrap().is_identical(&Value::Int(21)));
    assert_eq!(format!("{}", module.bindings.lookup("both").unwrap()), "('a', 'b', 'c')");
    assert_eq!(module.decls.len(), 0);

    assert_eq!(parse_err("a = b\nb = 1\n"), ParseError { line: 1, kind: ParseErrorKind::Binding { name: "a".into(), cause: ErrorCause::UndefinedVariable { name: "b".into() } } });
}

#[test]
fn test_src_params() {
    let module = parse_module("def f(a, b, /, c, *rest, d, **kw) -> int: RETURN_VALUE");
    let params = &module.decls[0].params;
    assert_eq!(params.positional, ["a", "b", "c"]);
    assert_eq!(params.posonly_count, 2);
    assert_eq!(params.kwonly, ["d"]);
    assert_eq!(params.varargs.as_deref(), Some("rest"));
    assert_eq!(params.varkw.as_deref(), Some("kw"));
    assert_eq!(params.slots().map(|x| x.as_str()).collect::<Vec<_>>(), ["a", "b", "c", "d", "rest", "kw"]);
    assert_eq!(module.decls[0].flags, flags::VARARGS | flags::VARKEYWORDS);

    let module = parse_module("def g(x: float, *, y: int,): RETURN_VALUE");
    let params = &module.decls[0].params;
    assert_eq!(params.positional, ["x"]);
    assert_eq!(params.kwonly, ["y"]);
    assert_eq!(params.varargs, None);

    assert_eq!(parse_err("def f(a=1): RETURN_VALUE").kind, ParseErrorKind::DefaultArgument { name: "a".into() });
    assert_eq!(parse_err("def f(a: int = 1): RETURN_VALUE").kind, ParseErrorKind::DefaultArgument { name: "a".into() });
    assert_eq!(parse_err("def f(a, a): RETURN_VALUE").kind, ParseErrorKind::DuplicateParameter { name: "a".into() });
    assert_eq!(parse_err("def f(**kw, a): RETURN_VALUE").kind, ParseErrorKind::BadParameter);
    assert_eq!(parse_err("def f(/, a): RETURN_VALUE").kind, ParseErrorKind::BadParameter);
    assert_eq!(parse_err("def f(*, *): RETURN_VALUE").kind, ParseErrorKind::BadParameter);
}

#[test]
fn test_src_body_statements() {
    let module = parse_module("\
async def f(x):
    nonlocal cell, other
    pass
    FLAGS |= 0x100; STACK_SIZE = 4
  START:
    LOAD_FAST @ x; POP_TOP << AFTER
    BUILD_TUPLE % 0  # trailing comment
    RETURN_VALUE
");
    let decl = &module.decls[0];
    assert_eq!(decl.flags, flags::COROUTINE | flags::NESTED);
    assert_eq!(decl.freevars, ["cell", "other"]);
    assert_eq!(decl.body.len(), 7);

    match &decl.body[0] {
        Statement::Option { name, op: Some(BinaryOp::Or), value: Expr::Value(Value::Int(0x100)), line: 4 } => assert_eq!(name, "FLAGS"),
        x => panic!("{x:?}"),
    }
    match &decl.body[1] {
        Statement::Option { name, op: None, line: 4, .. } => assert_eq!(name, "STACK_SIZE"),
        x => panic!("{x:?}"),
    }
    match &decl.body[2] {
        Statement::Label { name, line: 5 } => assert_eq!(name, "START"),
        x => panic!("{x:?}"),
    }
    match &decl.body[4] {
        Statement::Instruction { opcode, operand: None, label: Some(label), line: 6 } => {
            assert_eq!(opcode, "POP_TOP");
            assert_eq!(label, "AFTER");
        }
        x => panic!("{x:?}"),
    }
    match &decl.body[5] {
        Statement::Instruction { operand: Some(Operand::Raw(Expr::Value(Value::Int(0)))), line: 7, .. } => (),
        x => panic!("{x:?}"),
    }
}

#[test]
fn test_src_redefinition() {
    let module = parse_module("\
def f(): LOAD_CONST @ 1; RETURN_VALUE
def f(): LOAD_CONST @ 2; RETURN_VALUE
");
    assert_eq!(module.decls.len(), 2);
    assert_eq!(module.decl("f").unwrap().first_line, 2);

    let ns = load_namespace("\
def f(): LOAD_CONST @ 1; RETURN_VALUE
def f(): LOAD_CONST @ 2; RETURN_VALUE
", Default::default());
    let res = ns.procedure("f").unwrap().call(Vec::new(), ns.settings()).unwrap();
    assert!(res.is_identical(&Value::Int(2)));
}

#[test]
fn test_src_errors() {
    assert_eq!(parse_err("    LOAD_CONST @ 1\n"), ParseError { line: 1, kind: ParseErrorKind::UnexpectedIndent });
    assert_eq!(parse_err("LOAD_CONST @ 1\n"), ParseError { line: 1, kind: ParseErrorKind::UnexpectedStatement });
    assert_eq!(parse_err("def f()\n    NOP\n").kind, ParseErrorKind::BadHeader);
    assert_eq!(parse_err("def f(:\n    NOP\n").kind, ParseErrorKind::BadHeader);
    assert_eq!(parse_err("def f() int:\n    NOP\n").kind, ParseErrorKind::BadHeader);
    assert_eq!(parse_err("\ndef empty():\n\nx = 1\n"), ParseError { line: 2, kind: ParseErrorKind::EmptyBody { name: "empty".into() } });
    assert_eq!(parse_err("def f(): NOP\n    NOP\n"), ParseError { line: 2, kind: ParseErrorKind::UnexpectedIndent });
    assert_eq!(parse_err("def f():\n    NOP\n    LOAD_CONST @ 'oops\n"), ParseError { line: 3, kind: ParseErrorKind::Syntax { error: SyntaxError::UnterminatedString } });
    assert_eq!(parse_err("def f():\n    LOAD_CONST 1\n").kind, ParseErrorKind::Syntax { error: SyntaxError::UnexpectedToken { found: "1".into() } });
    assert_eq!(parse_err("def f():\n    LOAD_CONST @ (1 +\n").kind, ParseErrorKind::Syntax { error: SyntaxError::UnexpectedEnd });
    assert_eq!(format!("{}", parse_err("def f(a, a): NOP")), "line 1: duplicate parameter 'a'");
}
