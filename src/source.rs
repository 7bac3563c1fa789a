//! Reader for modules of procedure declarations with hand-written instruction listings.
//!
//! ```text
//! scale = 0.5
//!
//! def sqrt(n: float) -> float:
//!     LOAD_FAST @ n
//!     LOAD_CONST @ scale
//!     BINARY_POWER
//!     RETURN_VALUE
//! ```

use alloc::vec::Vec;

use core::fmt;

use compact_str::{CompactString, ToCompactString};

use crate::expr::*;
use crate::opcode::flags;
use crate::runtime::*;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseErrorKind {
    Syntax { error: SyntaxError },
    /// A procedure header was malformed.
    BadHeader,
    /// A parameter list entry was malformed or out of order.
    BadParameter,
    /// Parameter defaults are not supported.
    DefaultArgument { name: CompactString },
    DuplicateParameter { name: CompactString },
    /// A procedure declaration had no body.
    EmptyBody { name: CompactString },
    /// A line that is neither a binding nor a procedure declaration.
    UnexpectedStatement,
    /// An indented line with no enclosing procedure.
    UnexpectedIndent,
    /// A module-level binding failed to evaluate.
    Binding { name: CompactString, cause: ErrorCause },
}
impl From<SyntaxError> for ParseErrorKind { fn from(error: SyntaxError) -> Self { Self::Syntax { error } } }

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    /// The (1-based) source line of the error.
    pub line: u32,
    pub kind: ParseErrorKind,
}
impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}: ", self.line)?;
        match &self.kind {
            ParseErrorKind::Syntax { error } => write!(f, "{error}"),
            ParseErrorKind::BadHeader => write!(f, "malformed procedure header"),
            ParseErrorKind::BadParameter => write!(f, "malformed parameter list"),
            ParseErrorKind::DefaultArgument { name } => write!(f, "parameter '{name}' has a default value, which is not supported"),
            ParseErrorKind::DuplicateParameter { name } => write!(f, "duplicate parameter '{name}'"),
            ParseErrorKind::EmptyBody { name } => write!(f, "procedure '{name}' has no body"),
            ParseErrorKind::UnexpectedStatement => write!(f, "expected a binding or a procedure declaration"),
            ParseErrorKind::UnexpectedIndent => write!(f, "unexpected indent"),
            ParseErrorKind::Binding { name, cause } => write!(f, "failed to evaluate '{name}': {cause}"),
        }
    }
}
#[cfg(feature = "std")]
impl std::error::Error for ParseError {}

/// The operand of an instruction.
#[derive(Debug, Clone)]
pub enum Operand {
    /// `@ expr`: interpreted according to the operand class of the opcode.
    Resolved(Expr),
    /// `% expr`: evaluated to an integer and used as-is.
    Raw(Expr),
}

/// A statement of an instruction listing.
#[derive(Debug, Clone)]
pub enum Statement {
    Instruction { opcode: CompactString, operand: Option<Operand>, label: Option<CompactString>, line: u32 },
    Label { name: CompactString, line: u32 },
    /// An assignment (`op` is `None`) or augmented assignment to a procedure option.
    Option { name: CompactString, op: Option<BinaryOp>, value: Expr, line: u32 },
}
impl Statement {
    pub fn line(&self) -> u32 {
        match self {
            Statement::Instruction { line, .. } | Statement::Label { line, .. } | Statement::Option { line, .. } => *line,
        }
    }
}

/// The declared parameters of a procedure.
#[derive(Debug, Clone, Default)]
pub struct Params {
    /// All positional parameters, positional-only ones first.
    pub positional: Vec<CompactString>,
    pub posonly_count: usize,
    pub kwonly: Vec<CompactString>,
    pub varargs: Option<CompactString>,
    pub varkw: Option<CompactString>,
}
impl Params {
    /// All parameter names in local-slot order.
    pub fn slots(&self) -> impl Iterator<Item = &CompactString> {
        self.positional.iter().chain(self.kwonly.iter()).chain(self.varargs.iter()).chain(self.varkw.iter())
    }
}

/// A procedure declaration: header information plus the raw instruction listing.
#[derive(Debug, Clone)]
pub struct ProcedureDecl {
    pub name: CompactString,
    pub filename: CompactString,
    pub first_line: u32,
    pub params: Params,
    /// Flags implied by the header (`*args`, `**kw`, `async`, `nonlocal`).
    pub flags: u32,
    pub freevars: Vec<CompactString>,
    pub body: Vec<Statement>,
}

/// A parsed module: evaluated bindings and procedure declarations in source order.
#[derive(Debug, Clone)]
pub struct Module {
    pub filename: CompactString,
    pub bindings: SymbolTable,
    pub decls: Vec<ProcedureDecl>,
}

fn split_top_level<'a>(tokens: &'a [Token], sep: &str) -> Vec<&'a [Token]> {
    let mut res = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, token) in tokens.iter().enumerate() {
        match token {
            x if depth == 0 && x.is_op(sep) => {
                res.push(&tokens[start..i]);
                start = i + 1;
            }
            Token::Op("(" | "[" | "{") => depth += 1,
            Token::Op(")" | "]" | "}") => depth = depth.saturating_sub(1),
            _ => (),
        }
    }
    res.push(&tokens[start..]);
    res
}

fn find_top_level(tokens: &[Token], op: &str) -> Option<usize> {
    let mut pos = 0;
    for part in split_top_level(tokens, op) {
        pos += part.len();
        if pos < tokens.len() { return Some(pos); }
        pos += 1;
    }
    None
}

fn parse_params(tokens: &[Token], params: &mut Params, header_flags: &mut u32) -> Result<(), ParseErrorKind> {
    if tokens.is_empty() { return Ok(()); }

    let mut seen_slash = false;
    let mut seen_star = false;
    let mut names: Vec<CompactString> = Vec::new();
    fn add_name(name: &str, names: &mut Vec<CompactString>) -> Result<CompactString, ParseErrorKind> {
        if names.iter().any(|x| x == name) { return Err(ParseErrorKind::DuplicateParameter { name: name.into() }); }
        names.push(name.into());
        Ok(name.into())
    }

    let parts = split_top_level(tokens, ",");
    let count = parts.len();
    for (i, part) in parts.into_iter().enumerate() {
        if part.is_empty() {
            if i + 1 == count && i != 0 { break; }
            return Err(ParseErrorKind::BadParameter);
        }
        if params.varkw.is_some() { return Err(ParseErrorKind::BadParameter); }

        if let Some(name) = part.iter().find_map(Token::as_name) {
            if find_top_level(part, "=").is_some() { return Err(ParseErrorKind::DefaultArgument { name: name.into() }); }
        }
        let part = match find_top_level(part, ":") {
            Some(pos) => &part[..pos],
            None => part,
        };

        match part {
            [Token::Op("/")] => {
                if seen_slash || seen_star || params.positional.is_empty() { return Err(ParseErrorKind::BadParameter); }
                seen_slash = true;
                params.posonly_count = params.positional.len();
            }
            [Token::Op("*")] => {
                if seen_star { return Err(ParseErrorKind::BadParameter); }
                seen_star = true;
            }
            [Token::Op("*"), Token::Name(name)] => {
                if seen_star { return Err(ParseErrorKind::BadParameter); }
                seen_star = true;
                params.varargs = Some(add_name(name, &mut names)?);
                *header_flags |= flags::VARARGS;
            }
            [Token::Op("**"), Token::Name(name)] => {
                params.varkw = Some(add_name(name, &mut names)?);
                *header_flags |= flags::VARKEYWORDS;
            }
            [Token::Name(name)] => {
                let name = add_name(name, &mut names)?;
                if seen_star { params.kwonly.push(name) } else { params.positional.push(name) }
            }
            _ => return Err(ParseErrorKind::BadParameter),
        }
    }
    Ok(())
}

/// Parses a procedure header, returning the declaration (with empty body) and any inline body tokens.
fn parse_header<'a>(tokens: &'a [Token], filename: &str, line: u32) -> Result<(ProcedureDecl, &'a [Token]), ParseErrorKind> {
    let (is_async, rest) = match tokens {
        [Token::Name(a), rest @ ..] if a == "async" => (true, rest),
        rest => (false, rest),
    };
    let (name, rest) = match rest {
        [Token::Name(d), Token::Name(name), Token::Op("("), rest @ ..] if d == "def" => (name.clone(), rest),
        _ => return Err(ParseErrorKind::BadHeader),
    };
    let close = find_top_level(rest, ")").ok_or(ParseErrorKind::BadHeader)?;
    let (param_tokens, rest) = (&rest[..close], &rest[close + 1..]);
    let colon = find_top_level(rest, ":").ok_or(ParseErrorKind::BadHeader)?;
    match &rest[..colon] {
        [] => (),
        [Token::Op("->"), annotation @ ..] if !annotation.is_empty() => (),
        _ => return Err(ParseErrorKind::BadHeader),
    }

    let mut params = Params::default();
    let mut header_flags = if is_async { flags::COROUTINE } else { 0 };
    parse_params(param_tokens, &mut params, &mut header_flags)?;

    let decl = ProcedureDecl {
        name,
        filename: filename.into(),
        first_line: line,
        params,
        flags: header_flags,
        freevars: Vec::new(),
        body: Vec::new(),
    };
    Ok((decl, &rest[colon + 1..]))
}

fn parse_body_line(decl: &mut ProcedureDecl, tokens: &[Token], line: u32) -> Result<(), ParseErrorKind> {
    const OPTION_OPS: &[(&str, Option<BinaryOp>)] = &[
        ("=", None), ("|=", Some(BinaryOp::Or)), ("&=", Some(BinaryOp::And)), ("^=", Some(BinaryOp::Xor)),
        ("+=", Some(BinaryOp::Add)), ("-=", Some(BinaryOp::Sub)),
    ];

    for stmt in split_top_level(tokens, ";") {
        let (first, rest) = match stmt {
            [] => continue,
            [Token::Name(first), rest @ ..] => (first, rest),
            [x, ..] => return Err(SyntaxError::UnexpectedToken { found: x.to_compact_string() }.into()),
        };

        if first == "pass" && rest.is_empty() { continue; }
        if first == "nonlocal" {
            for part in split_top_level(rest, ",") {
                match part {
                    [Token::Name(name)] => if !decl.freevars.contains(name) { decl.freevars.push(name.clone()) }
                    _ => return Err(ParseErrorKind::UnexpectedStatement),
                }
            }
            decl.flags |= flags::NESTED;
            continue;
        }
        if let [Token::Op(":")] = rest {
            decl.body.push(Statement::Label { name: first.clone(), line });
            continue;
        }
        if let Some(Token::Op(sym)) = rest.first() {
            if let Some((_, op)) = OPTION_OPS.iter().find(|(x, _)| x == sym) {
                let value = Expr::parse(&rest[1..])?;
                decl.body.push(Statement::Option { name: first.clone(), op: *op, value, line });
                continue;
            }
        }

        let (rest, label) = match rest {
            [rest @ .., Token::Op("<<"), Token::Name(label)] => (rest, Some(label.clone())),
            rest => (rest, None),
        };
        let operand = match rest {
            [] => None,
            [Token::Op("@"), expr @ ..] => Some(Operand::Resolved(Expr::parse(expr)?)),
            [Token::Op("%"), expr @ ..] => Some(Operand::Raw(Expr::parse(expr)?)),
            [x, ..] => return Err(SyntaxError::UnexpectedToken { found: x.to_compact_string() }.into()),
        };
        decl.body.push(Statement::Instruction { opcode: first.clone(), operand, label, line });
    }
    Ok(())
}

fn indent_of(line: &str) -> usize {
    line.len() - line.trim_start().len()
}
fn is_blank(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.is_empty() || trimmed.starts_with('#')
}

impl Module {
    /// Parses module text. Bindings are evaluated in order, each seeing the ones before it.
    pub fn parse(filename: &str, src: &str) -> Result<Module, ParseError> {
        let mut bindings = SymbolTable::default();
        let mut decls = Vec::new();
        let lines: Vec<&str> = src.lines().collect();

        let mut i = 0;
        while i < lines.len() {
            let line_no = i as u32 + 1;
            let text = lines[i];
            i += 1;
            let err = |kind: ParseErrorKind| ParseError { line: line_no, kind };

            if is_blank(text) { continue; }
            if indent_of(text) != 0 { return Err(err(ParseErrorKind::UnexpectedIndent)); }

            let tokens = tokenize(text).map_err(|e| err(e.into()))?;
            match tokens.as_slice() {
                [Token::Name(name), Token::Op("="), value @ ..] if name != "def" && name != "async" => {
                    let value = Expr::parse(value).map_err(|e| err(e.into()))?;
                    let value = value.eval(&LookupGroup(&[&bindings])).map_err(|cause| err(ParseErrorKind::Binding { name: name.clone(), cause }))?;
                    bindings.define(name, value);
                }
                [Token::Name(x), ..] if x == "def" || x == "async" => {
                    let (mut decl, inline) = parse_header(&tokens, filename, line_no).map_err(err)?;
                    parse_body_line(&mut decl, inline, line_no).map_err(err)?;

                    let mut has_body = !inline.is_empty();
                    while i < lines.len() && (is_blank(lines[i]) || indent_of(lines[i]) > 0) {
                        let body_line = i as u32 + 1;
                        i += 1;
                        if is_blank(lines[i - 1]) { continue; }
                        if !inline.is_empty() { return Err(ParseError { line: body_line, kind: ParseErrorKind::UnexpectedIndent }); }

                        let body_tokens = tokenize(lines[i - 1]).map_err(|e| ParseError { line: body_line, kind: e.into() })?;
                        parse_body_line(&mut decl, &body_tokens, body_line).map_err(|kind| ParseError { line: body_line, kind })?;
                        has_body = true;
                    }
                    if !has_body { return Err(err(ParseErrorKind::EmptyBody { name: decl.name })); }
                    decls.push(decl);
                }
                _ => return Err(err(ParseErrorKind::UnexpectedStatement)),
            }
        }

        Ok(Module { filename: filename.into(), bindings, decls })
    }
    pub fn decl(&self, name: &str) -> Option<&ProcedureDecl> {
        self.decls.iter().rev().find(|x| x.name == name)
    }
}
