//! Conversion Expression Evaluator
//!
//! Catalog entries describe how a raw reply payload becomes a physical value
//! with a short formula such as `(B0*256+B1)/4`. This module parses those
//! formulas once, when the catalog is built, and evaluates the resulting tree
//! for every decoded frame.
//!
//! Grammar, lowest precedence first:
//!
//! ```text
//! expr       := bit_or
//! bit_or     := bit_xor    ( '|' bit_xor )*
//! bit_xor    := bit_and    ( '^' bit_and )*
//! bit_and    := equality   ( '&' equality )*
//! equality   := comparison ( ('==' | '!=') comparison )*
//! comparison := shift      ( ('<' | '<=' | '>' | '>=') shift )*
//! shift      := additive   ( ('<<' | '>>') additive )*
//! additive   := term       ( ('+' | '-') term )*
//! term       := unary      ( ('*' | '/' | '%') unary )*
//! unary      := ('-' | '+') unary | primary
//! primary    := number | 'B0'..'B3' | 'V' | '(' expr ')'
//! ```
//!
//! Arithmetic is done in `f64`. Bitwise operators and shifts truncate their
//! operands to `i64`. Comparisons yield `1` or `0`.

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Highest byte index an expression may reference (`B3`)
pub const MAX_BYTE_VARIABLE: usize = 3;

/// Errors produced while parsing or evaluating a conversion expression
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExprError {
    #[error("unexpected character '{ch}' at offset {offset}")]
    UnexpectedChar { ch: char, offset: usize },

    #[error("invalid number literal '{0}'")]
    InvalidNumber(String),

    #[error("unknown variable '{0}' (expected B0-B3 or V)")]
    UnknownVariable(String),

    #[error("unexpected token {0}")]
    UnexpectedToken(String),

    #[error("unexpected end of expression")]
    UnexpectedEnd,

    #[error("division by zero")]
    DivisionByZero,

    #[error("shift amount {0} out of range")]
    ShiftOutOfRange(i64),
}

/// A variable an expression can reference
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variable {
    /// `B0`..`B3`: one byte of the reply payload
    Byte(usize),
    /// `V`: the whole payload as one integer
    Whole,
}

impl Variable {
    fn from_name(name: &str) -> Result<Self, ExprError> {
        if name == "V" {
            return Ok(Variable::Whole);
        }
        name.strip_prefix('B')
            .and_then(|index| index.parse::<usize>().ok())
            .filter(|index| *index <= MAX_BYTE_VARIABLE && name.len() == 2)
            .map(Variable::Byte)
            .ok_or_else(|| ExprError::UnknownVariable(name.to_string()))
    }
}

/// Variable bindings for one reply payload
#[derive(Debug, Clone, Copy)]
pub struct Payload<'a> {
    bytes: &'a [u8],
    whole: u64,
}

impl<'a> Payload<'a> {
    /// Bind a payload's bytes and its whole-payload integer value
    pub fn new(bytes: &'a [u8], whole: u64) -> Self {
        Self { bytes, whole }
    }

    /// Resolve a variable.
    ///
    /// A byte index past the end of the payload falls back to the whole value,
    /// so a catalog entry with a short `replyLength` still evaluates.
    pub fn value_of(&self, variable: Variable) -> f64 {
        match variable {
            Variable::Byte(index) => self
                .bytes
                .get(index)
                .map(|b| *b as f64)
                .unwrap_or(self.whole as f64),
            Variable::Whole => self.whole as f64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Token {
    Number(f64),
    Var(Variable),
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Shl,
    Shr,
    Lt,
    Le,
    Gt,
    Ge,
    EqEq,
    Ne,
    Amp,
    Pipe,
    Caret,
    LParen,
    RParen,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Shl,
    Shr,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    BitAnd,
    BitOr,
    BitXor,
}

impl BinOp {
    /// Operator and binding power for a token, if it is a binary operator
    fn from_token(token: &Token) -> Option<(BinOp, u8)> {
        let op = match token {
            Token::Pipe => (BinOp::BitOr, 1),
            Token::Caret => (BinOp::BitXor, 2),
            Token::Amp => (BinOp::BitAnd, 3),
            Token::EqEq => (BinOp::Eq, 4),
            Token::Ne => (BinOp::Ne, 4),
            Token::Lt => (BinOp::Lt, 5),
            Token::Le => (BinOp::Le, 5),
            Token::Gt => (BinOp::Gt, 5),
            Token::Ge => (BinOp::Ge, 5),
            Token::Shl => (BinOp::Shl, 6),
            Token::Shr => (BinOp::Shr, 6),
            Token::Plus => (BinOp::Add, 7),
            Token::Minus => (BinOp::Sub, 7),
            Token::Star => (BinOp::Mul, 8),
            Token::Slash => (BinOp::Div, 8),
            Token::Percent => (BinOp::Mod, 8),
            _ => return None,
        };
        Some(op)
    }

    fn apply(self, a: f64, b: f64) -> Result<f64, ExprError> {
        let value = match self {
            BinOp::Add => a + b,
            BinOp::Sub => a - b,
            BinOp::Mul => a * b,
            BinOp::Div => {
                if b == 0.0 {
                    return Err(ExprError::DivisionByZero);
                }
                a / b
            }
            BinOp::Mod => {
                if b == 0.0 {
                    return Err(ExprError::DivisionByZero);
                }
                a % b
            }
            BinOp::Shl => (a as i64).wrapping_shl(shift_amount(b)?) as f64,
            BinOp::Shr => (a as i64).wrapping_shr(shift_amount(b)?) as f64,
            BinOp::Lt => flag(a < b),
            BinOp::Le => flag(a <= b),
            BinOp::Gt => flag(a > b),
            BinOp::Ge => flag(a >= b),
            BinOp::Eq => flag(a == b),
            BinOp::Ne => flag(a != b),
            BinOp::BitAnd => ((a as i64) & (b as i64)) as f64,
            BinOp::BitOr => ((a as i64) | (b as i64)) as f64,
            BinOp::BitXor => ((a as i64) ^ (b as i64)) as f64,
        };
        Ok(value)
    }
}

fn flag(b: bool) -> f64 {
    if b {
        1.0
    } else {
        0.0
    }
}

fn shift_amount(b: f64) -> Result<u32, ExprError> {
    let n = b as i64;
    if (0..64).contains(&n) {
        Ok(n as u32)
    } else {
        Err(ExprError::ShiftOutOfRange(n))
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Number(f64),
    Var(Variable),
    Neg(Box<Node>),
    Binary(BinOp, Box<Node>, Box<Node>),
}

impl Node {
    fn eval(&self, payload: &Payload<'_>) -> Result<f64, ExprError> {
        match self {
            Node::Number(n) => Ok(*n),
            Node::Var(v) => Ok(payload.value_of(*v)),
            Node::Neg(inner) => Ok(-inner.eval(payload)?),
            Node::Binary(op, lhs, rhs) => {
                let a = lhs.eval(payload)?;
                let b = rhs.eval(payload)?;
                op.apply(a, b)
            }
        }
    }
}

fn tokenize(source: &str) -> Result<Vec<Token>, ExprError> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];

        if c.is_whitespace() {
            i += 1;
            continue;
        }

        if c.is_ascii_digit() || (c == '.' && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit())) {
            let start = i;
            if c == '0' && matches!(chars.get(i + 1), Some('x') | Some('X')) {
                i += 2;
                while i < chars.len() && chars[i].is_ascii_hexdigit() {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let value = u64::from_str_radix(&text[2..], 16)
                    .map_err(|_| ExprError::InvalidNumber(text.clone()))?;
                tokens.push(Token::Number(value as f64));
                continue;
            }
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                i += 1;
            }
            let text: String = chars[start..i].iter().collect();
            let value = text
                .parse::<f64>()
                .map_err(|_| ExprError::InvalidNumber(text.clone()))?;
            tokens.push(Token::Number(value));
            continue;
        }

        if c.is_ascii_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            let name: String = chars[start..i].iter().collect();
            tokens.push(Token::Var(Variable::from_name(&name)?));
            continue;
        }

        let (token, width) = match (c, chars.get(i + 1).copied()) {
            ('<', Some('<')) => (Token::Shl, 2),
            ('>', Some('>')) => (Token::Shr, 2),
            ('<', Some('=')) => (Token::Le, 2),
            ('>', Some('=')) => (Token::Ge, 2),
            ('=', Some('=')) => (Token::EqEq, 2),
            ('!', Some('=')) => (Token::Ne, 2),
            ('<', _) => (Token::Lt, 1),
            ('>', _) => (Token::Gt, 1),
            ('+', _) => (Token::Plus, 1),
            ('-', _) => (Token::Minus, 1),
            ('*', _) => (Token::Star, 1),
            ('/', _) => (Token::Slash, 1),
            ('%', _) => (Token::Percent, 1),
            ('&', _) => (Token::Amp, 1),
            ('|', _) => (Token::Pipe, 1),
            ('^', _) => (Token::Caret, 1),
            ('(', _) => (Token::LParen, 1),
            (')', _) => (Token::RParen, 1),
            _ => return Err(ExprError::UnexpectedChar { ch: c, offset: i }),
        };
        tokens.push(token);
        i += width;
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).copied();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn parse_binary(&mut self, min_power: u8) -> Result<Node, ExprError> {
        let mut lhs = self.parse_unary()?;
        while let Some((op, power)) = self.peek().and_then(BinOp::from_token) {
            if power < min_power {
                break;
            }
            self.pos += 1;
            let rhs = self.parse_binary(power + 1)?;
            lhs = Node::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Node, ExprError> {
        match self.peek() {
            Some(Token::Minus) => {
                self.pos += 1;
                Ok(Node::Neg(Box::new(self.parse_unary()?)))
            }
            Some(Token::Plus) => {
                self.pos += 1;
                self.parse_unary()
            }
            _ => self.parse_primary(),
        }
    }

    fn parse_primary(&mut self) -> Result<Node, ExprError> {
        match self.next() {
            Some(Token::Number(n)) => Ok(Node::Number(n)),
            Some(Token::Var(v)) => Ok(Node::Var(v)),
            Some(Token::LParen) => {
                let inner = self.parse_binary(0)?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    Some(other) => Err(ExprError::UnexpectedToken(format!("{:?}", other))),
                    None => Err(ExprError::UnexpectedEnd),
                }
            }
            Some(other) => Err(ExprError::UnexpectedToken(format!("{:?}", other))),
            None => Err(ExprError::UnexpectedEnd),
        }
    }
}

/// A parsed conversion expression
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    source: String,
    root: Node,
}

impl Expression {
    /// Parse an expression
    pub fn parse(source: &str) -> Result<Self, ExprError> {
        let mut parser = Parser {
            tokens: tokenize(source)?,
            pos: 0,
        };
        let root = parser.parse_binary(0)?;
        if let Some(extra) = parser.peek() {
            return Err(ExprError::UnexpectedToken(format!("{:?}", extra)));
        }
        Ok(Self {
            source: source.trim().to_string(),
            root,
        })
    }

    /// The expression text as written in the catalog
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluate against one reply payload
    pub fn evaluate(&self, payload: &Payload<'_>) -> Result<f64, ExprError> {
        self.root.eval(payload)
    }
}

impl FromStr for Expression {
    type Err = ExprError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Expression::parse(s)
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}
