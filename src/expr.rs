//! Tokens and constant expressions used by operands, options and module bindings.

use alloc::boxed::Box;
use alloc::vec::Vec;

use core::fmt;

use compact_str::{CompactString, ToCompactString};

use crate::runtime::*;

/// Multi-character operators first so that the longest match wins.
const OPERATORS: &[&str] = &[
    "**", "//", "<<", ">>", "->", "|=", "&=", "^=", "+=", "-=",
    "(", ")", "[", "]", "{", "}", ",", ":", ";", "=", "@", "%", "*", "/", "+", "-", "~", "&", "^", "|", ".",
];

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Int(i64),
    Float(f64),
    Str(CompactString),
    Name(CompactString),
    Op(&'static str),
}
impl Token {
    pub fn is_op(&self, op: &str) -> bool {
        matches!(self, Token::Op(x) if *x == op)
    }
    pub fn as_name(&self) -> Option<&str> {
        match self {
            Token::Name(x) => Some(x),
            _ => None,
        }
    }
}
impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Int(x) => write!(f, "{x}"),
            Token::Float(x) => write!(f, "{}", Value::Float(*x)),
            Token::Str(x) => write!(f, "{}", Value::Str(x.clone())),
            Token::Name(x) => f.write_str(x),
            Token::Op(x) => f.write_str(x),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyntaxError {
    UnexpectedChar { ch: char },
    UnterminatedString,
    BadEscape { ch: char },
    BadNumber { text: CompactString },
    UnexpectedToken { found: CompactString },
    UnexpectedEnd,
}
impl fmt::Display for SyntaxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyntaxError::UnexpectedChar { ch } => write!(f, "unexpected character {ch:?}"),
            SyntaxError::UnterminatedString => write!(f, "unterminated string literal"),
            SyntaxError::BadEscape { ch } => write!(f, "unknown escape sequence \\{ch}"),
            SyntaxError::BadNumber { text } => write!(f, "invalid number literal '{text}'"),
            SyntaxError::UnexpectedToken { found } => write!(f, "unexpected '{found}'"),
            SyntaxError::UnexpectedEnd => write!(f, "unexpected end of line"),
        }
    }
}

fn parse_number(text: &str) -> Result<Token, SyntaxError> {
    let bad = || SyntaxError::BadNumber { text: text.into() };
    if text.starts_with('_') || text.ends_with('_') || text.contains("__") { return Err(bad()); }
    let clean: CompactString = text.chars().filter(|&c| c != '_').collect();
    let lower = clean.to_ascii_lowercase();

    for (prefix, radix) in [("0x", 16), ("0o", 8), ("0b", 2)] {
        if let Some(digits) = lower.strip_prefix(prefix) {
            return i64::from_str_radix(digits, radix).map(Token::Int).map_err(|_| bad());
        }
    }
    if lower.contains(['.', 'e']) {
        return lower.parse::<f64>().map(Token::Float).map_err(|_| bad());
    }
    if lower.len() > 1 && lower.starts_with('0') && lower.bytes().any(|b| b != b'0') { return Err(bad()); }
    lower.parse::<i64>().map(Token::Int).map_err(|_| bad())
}

/// Splits a line into tokens, stopping at a `#` comment.
pub fn tokenize(src: &str) -> Result<Vec<Token>, SyntaxError> {
    let mut res = Vec::new();
    let bytes = src.as_bytes();
    let mut pos = 0;

    'next: while pos < src.len() {
        let rest = &src[pos..];
        let ch = rest.chars().next().unwrap_or_default();

        if ch.is_whitespace() {
            pos += ch.len_utf8();
            continue;
        }
        if ch == '#' { break; }

        if ch.is_ascii_digit() || (ch == '.' && bytes.get(pos + 1).is_some_and(u8::is_ascii_digit)) {
            let mut end = pos;
            while end < bytes.len() {
                let b = bytes[end];
                let exp_sign = (b == b'+' || b == b'-') && matches!(bytes[end - 1], b'e' | b'E') && !src[pos..end].to_ascii_lowercase().starts_with("0x");
                if b.is_ascii_alphanumeric() || b == b'_' || b == b'.' || exp_sign {
                    end += 1;
                } else {
                    break;
                }
            }
            res.push(parse_number(&src[pos..end])?);
            pos = end;
            continue;
        }

        if ch.is_alphabetic() || ch == '_' {
            let len = rest.find(|c: char| !(c.is_alphanumeric() || c == '_')).unwrap_or(rest.len());
            res.push(Token::Name(rest[..len].into()));
            pos += len;
            continue;
        }

        if ch == '\'' || ch == '"' {
            let mut value = CompactString::default();
            let mut chars = rest.char_indices().skip(1);
            while let Some((i, c)) = chars.next() {
                match c {
                    c if c == ch => {
                        res.push(Token::Str(value));
                        pos += i + 1;
                        continue 'next;
                    }
                    '\\' => match chars.next() {
                        Some((_, 'n')) => value.push('\n'),
                        Some((_, 't')) => value.push('\t'),
                        Some((_, 'r')) => value.push('\r'),
                        Some((_, '0')) => value.push('\0'),
                        Some((_, c @ ('\\' | '\'' | '"'))) => value.push(c),
                        Some((_, c)) => return Err(SyntaxError::BadEscape { ch: c }),
                        None => return Err(SyntaxError::UnterminatedString),
                    }
                    c => value.push(c),
                }
            }
            return Err(SyntaxError::UnterminatedString);
        }

        for op in OPERATORS {
            if rest.starts_with(op) {
                res.push(Token::Op(*op));
                pos += op.len();
                continue 'next;
            }
        }
        return Err(SyntaxError::UnexpectedChar { ch });
    }

    Ok(res)
}

/// A constant expression.
#[derive(Debug, Clone)]
pub enum Expr {
    Value(Value),
    Name(CompactString),
    Tuple(Vec<Expr>),
    Unary { op: UnaryOp, value: Box<Expr> },
    Binary { op: BinaryOp, left: Box<Expr>, right: Box<Expr> },
}
impl Expr {
    /// Parses a complete expression from a token slice.
    pub fn parse(tokens: &[Token]) -> Result<Expr, SyntaxError> {
        let mut parser = Parser { tokens, pos: 0 };
        let res = parser.expr()?;
        match tokens.get(parser.pos) {
            None => Ok(res),
            Some(x) => Err(SyntaxError::UnexpectedToken { found: x.to_compact_string() }),
        }
    }
    /// Gets the identifier this expression consists of, if it is a lone name.
    pub fn as_ident(&self) -> Option<&str> {
        match self {
            Expr::Name(x) => Some(x),
            _ => None,
        }
    }
    pub fn eval(&self, scope: &LookupGroup) -> Result<Value, ErrorCause> {
        Ok(match self {
            Expr::Value(x) => x.clone(),
            Expr::Name(name) => match scope.lookup(name) {
                Some(x) => x.clone(),
                None => return Err(ErrorCause::UndefinedVariable { name: name.clone() }),
            }
            Expr::Tuple(items) => Value::Tuple(items.iter().map(|x| x.eval(scope)).collect::<Result<_, _>>()?),
            Expr::Unary { op, value } => value.eval(scope)?.unary_op(*op)?,
            Expr::Binary { op, left, right } => left.eval(scope)?.binary_op(*op, &right.eval(scope)?)?,
        })
    }
}

/// Binary precedence levels, loosest first.
const LEVELS: &[&[(&str, BinaryOp)]] = &[
    &[("|", BinaryOp::Or)],
    &[("^", BinaryOp::Xor)],
    &[("&", BinaryOp::And)],
    &[("<<", BinaryOp::LShift), (">>", BinaryOp::RShift)],
    &[("+", BinaryOp::Add), ("-", BinaryOp::Sub)],
    &[("*", BinaryOp::Mul), ("/", BinaryOp::TrueDiv), ("//", BinaryOp::FloorDiv), ("%", BinaryOp::Mod)],
];

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
}
impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }
    fn eat(&mut self, op: &str) -> bool {
        let res = self.peek().is_some_and(|x| x.is_op(op));
        if res { self.pos += 1; }
        res
    }
    fn expr(&mut self) -> Result<Expr, SyntaxError> {
        self.binary(0)
    }
    fn binary(&mut self, level: usize) -> Result<Expr, SyntaxError> {
        if level >= LEVELS.len() { return self.factor(); }

        let mut left = self.binary(level + 1)?;
        'outer: loop {
            for (sym, op) in LEVELS[level] {
                if self.eat(sym) {
                    let right = self.binary(level + 1)?;
                    left = Expr::Binary { op: *op, left: Box::new(left), right: Box::new(right) };
                    continue 'outer;
                }
            }
            return Ok(left);
        }
    }
    fn factor(&mut self) -> Result<Expr, SyntaxError> {
        for (sym, op) in [("-", UnaryOp::Neg), ("+", UnaryOp::Pos), ("~", UnaryOp::Invert)] {
            if self.eat(sym) {
                let value = self.factor()?;
                return Ok(match (op, value) {
                    (UnaryOp::Neg, Expr::Value(Value::Int(x))) if x != i64::MIN => Expr::Value(Value::Int(-x)),
                    (UnaryOp::Neg, Expr::Value(Value::Float(x))) => Expr::Value(Value::Float(-x)),
                    (op, value) => Expr::Unary { op, value: Box::new(value) },
                });
            }
        }
        self.power()
    }
    fn power(&mut self) -> Result<Expr, SyntaxError> {
        let base = self.atom()?;
        if self.eat("**") {
            let exp = self.factor()?;
            return Ok(Expr::Binary { op: BinaryOp::Pow, left: Box::new(base), right: Box::new(exp) });
        }
        Ok(base)
    }
    fn atom(&mut self) -> Result<Expr, SyntaxError> {
        let token = self.peek().ok_or(SyntaxError::UnexpectedEnd)?.clone();
        self.pos += 1;
        Ok(match token {
            Token::Int(x) => Expr::Value(Value::Int(x)),
            Token::Float(x) => Expr::Value(Value::Float(x)),
            Token::Str(x) => Expr::Value(Value::Str(x)),
            Token::Name(x) => match x.as_str() {
                "True" => Expr::Value(Value::Bool(true)),
                "False" => Expr::Value(Value::Bool(false)),
                "None" => Expr::Value(Value::None),
                _ => Expr::Name(x),
            }
            Token::Op("(") => {
                if self.eat(")") { return Ok(Expr::Tuple(Vec::new())); }
                let first = self.expr()?;
                if self.eat(")") { return Ok(first); }

                let mut items = alloc::vec![first];
                loop {
                    if !self.eat(",") { return Err(self.unexpected()); }
                    if self.eat(")") { break; }
                    items.push(self.expr()?);
                    if self.eat(")") { break; }
                }
                Expr::Tuple(items)
            }
            x => return Err(SyntaxError::UnexpectedToken { found: x.to_compact_string() }),
        })
    }
    fn unexpected(&self) -> SyntaxError {
        match self.peek() {
            Some(x) => SyntaxError::UnexpectedToken { found: x.to_compact_string() },
            None => SyntaxError::UnexpectedEnd,
        }
    }
}

#[cfg(test)]
fn eval_str(src: &str) -> Result<Value, ErrorCause> {
    let globals: SymbolTable = [("x", Value::Int(10)), ("name", Value::from("abc"))].into_iter().collect();
    Expr::parse(&tokenize(src).unwrap()).unwrap().eval(&LookupGroup(&[&globals]))
}

#[test]
fn test_tokenize() {
    use alloc::vec;

    assert_eq!(tokenize("LOAD_CONST @ 0.5 << top # done").unwrap(), vec![
        Token::Name("LOAD_CONST".into()), Token::Op("@"), Token::Float(0.5), Token::Op("<<"), Token::Name("top".into()),
    ]);
    assert_eq!(tokenize("0x1_F 0o17 0b101 1_000 1e3 .5 2.5e-1").unwrap(), vec![
        Token::Int(31), Token::Int(15), Token::Int(5), Token::Int(1000), Token::Float(1000.0), Token::Float(0.5), Token::Float(0.25),
    ]);
    assert_eq!(tokenize(r#"'it\'s' "a\tb""#).unwrap(), vec![Token::Str("it's".into()), Token::Str("a\tb".into())]);
    assert_eq!(tokenize("FLAGS |= 0x20").unwrap(), vec![Token::Name("FLAGS".into()), Token::Op("|="), Token::Int(32)]);
    assert_eq!(tokenize("'abc").unwrap_err(), SyntaxError::UnterminatedString);
    assert_eq!(tokenize("1 $ 2").unwrap_err(), SyntaxError::UnexpectedChar { ch: '$' });
    assert_eq!(tokenize("012").unwrap_err(), SyntaxError::BadNumber { text: "012".into() });
    assert_eq!(tokenize("99999999999999999999").unwrap_err(), SyntaxError::BadNumber { text: "99999999999999999999".into() });
}

#[test]
fn test_expr_precedence() {
    assert!(eval_str("1 + 2 * 3").unwrap().is_identical(&Value::Int(7)));
    assert!(eval_str("(1 + 2) * 3").unwrap().is_identical(&Value::Int(9)));
    assert!(eval_str("1 << 2 + 1").unwrap().is_identical(&Value::Int(8)));
    assert!(eval_str("6 & 3 | 8 ^ 1").unwrap().is_identical(&Value::Int(11)));
    assert!(eval_str("-2 ** 2").unwrap().is_identical(&Value::Int(-4)));
    assert!(eval_str("2 ** 3 ** 2").unwrap().is_identical(&Value::Int(512)));
    assert!(eval_str("-7 // 2").unwrap().is_identical(&Value::Int(-4)));
    assert!(eval_str("~x").unwrap().is_identical(&Value::Int(-11)));
    assert!(eval_str("x / 4").unwrap().is_identical(&Value::Float(2.5)));
    assert!(eval_str("name + 'd'").unwrap().is_identical(&Value::from("abcd")));
}

#[test]
fn test_expr_tuples() {
    use alloc::vec;

    assert!(eval_str("()").unwrap().is_identical(&Value::Tuple(vec![])));
    assert!(eval_str("(x,)").unwrap().is_identical(&Value::Tuple(vec![Value::Int(10)])));
    assert!(eval_str("(1, 'a', None, True)").unwrap().is_identical(&Value::Tuple(vec![Value::Int(1), Value::from("a"), Value::None, Value::Bool(true)])));
    assert!(eval_str("(x)").unwrap().is_identical(&Value::Int(10)));
}

#[test]
fn test_expr_errors() {
    assert_eq!(eval_str("y + 1").unwrap_err(), ErrorCause::UndefinedVariable { name: "y".into() });
    assert_eq!(eval_str("1 // 0").unwrap_err(), ErrorCause::ZeroDivision);
    assert_eq!(eval_str("name - 1").unwrap_err(), ErrorCause::BinaryOperands { op: BinaryOp::Sub, left: Type::Str, right: Type::Int });
    assert_eq!(Expr::parse(&tokenize("1 +").unwrap()).unwrap_err(), SyntaxError::UnexpectedEnd);
    assert_eq!(Expr::parse(&tokenize("1 2").unwrap()).unwrap_err(), SyntaxError::UnexpectedToken { found: "2".into() });
    assert_eq!(Expr::parse(&tokenize("(1, 2").unwrap()).unwrap_err(), SyntaxError::UnexpectedEnd);
}
