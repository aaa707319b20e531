// Copyright (c) 2024 Mike Tsao

//! A closed arithmetic language for custom segments. Source text looks like
//! `"t, a, tau: a * exp(-t / tau)"`: a signature naming `t` and the declared
//! parameters, a colon, and a body.
//!
//! The body is lexed and parsed by hand into a small tree and then folded into
//! a closure over `t`. Nothing outside the grammar below is accepted.
//!
//! ```text
//! expr    := term (("+" | "-") term)*
//! term    := unary (("*" | "/") unary)*
//! unary   := "-" unary | power
//! power   := primary (("^" | "**") unary)?
//! primary := NUMBER | IDENT | FUNC "(" expr ")" | "(" expr ")"
//! ```

use crate::error::ExpressionError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use strum::IntoEnumIterator;
use strum_macros::{EnumIter, EnumString, IntoStaticStr};

/// The source of a custom segment plus the values of its declared parameters.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CustomExpression {
    source: String,
    parameters: BTreeMap<String, f64>,
}
impl CustomExpression {
    /// Creates an expression without checking it. [compile()](Self::compile)
    /// reports any problems.
    pub fn new(source: &str, parameters: BTreeMap<String, f64>) -> Self {
        Self {
            source: source.to_string(),
            parameters,
        }
    }

    #[allow(missing_docs)]
    pub fn source(&self) -> &str {
        &self.source
    }

    #[allow(missing_docs)]
    pub fn parameters(&self) -> &BTreeMap<String, f64> {
        &self.parameters
    }

    /// The value of a declared parameter, if one was supplied.
    pub fn parameter(&self, name: &str) -> Option<f64> {
        self.parameters.get(name).copied()
    }

    /// Sets a parameter value. Only names that the signature declares are
    /// accepted.
    pub fn set_parameter(&mut self, name: &str, value: f64) -> bool {
        let Ok(signature) = Signature::parse(&self.source) else {
            return false;
        };
        if signature.parameters.iter().any(|p| p == name) {
            self.parameters.insert(name.to_string(), value);
            true
        } else {
            false
        }
    }

    /// Parses and binds the expression.
    pub fn compile(&self) -> Result<CompiledExpression, ExpressionError> {
        let signature = Signature::parse(&self.source)?;
        for name in signature.parameters.iter() {
            if !self.parameters.contains_key(name) {
                return Err(ExpressionError::UndeclaredParameter(name.clone()));
            }
        }
        // Positions in errors count characters, not bytes.
        let base = self.source[..signature.body_start].chars().count();
        let tokens = Lexer::new(&self.source[signature.body_start..], base).tokenize()?;
        let tree = Parser::new(tokens).parse()?;
        let bound = Binder {
            declared: &signature.parameters,
            values: &self.parameters,
        }
        .bind(tree)?;
        Ok(CompiledExpression {
            function: fold(bound),
        })
    }
}

/// A ready-to-evaluate custom expression.
pub struct CompiledExpression {
    function: Box<dyn Fn(f64) -> f64 + Send + Sync>,
}
impl core::fmt::Debug for CompiledExpression {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("CompiledExpression")
    }
}
impl CompiledExpression {
    /// Evaluates the body at local time `t`.
    pub fn evaluate(&self, t: f64) -> f64 {
        (self.function)(t)
    }
}

#[derive(Debug)]
struct Signature {
    parameters: Vec<String>,
    body_start: usize,
}
impl Signature {
    fn parse(source: &str) -> Result<Self, ExpressionError> {
        let colon = source.find(':').ok_or(ExpressionError::MissingSignature)?;
        let mut names = source[..colon].split(',').map(|n| n.trim().to_string());
        let first = names.next().unwrap_or_default();
        if first != "t" {
            return Err(ExpressionError::MissingTimeParameter(first));
        }
        let mut parameters = Vec::default();
        for name in names {
            if !is_identifier(&name) || name == "t" || Function::from_name(&name).is_some() {
                return Err(ExpressionError::Parse {
                    position: 0,
                    message: format!("'{name}' cannot be used as a parameter name"),
                });
            }
            parameters.push(name);
        }
        Ok(Self {
            parameters,
            body_start: colon + 1,
        })
    }
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// The closed set of functions a body may call.
#[derive(Clone, Copy, Debug, PartialEq, EnumIter, EnumString, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum Function {
    #[allow(missing_docs)]
    Exp,
    #[allow(missing_docs)]
    Sin,
    #[allow(missing_docs)]
    Cos,
    #[allow(missing_docs)]
    Sqrt,
}
impl Function {
    fn from_name(name: &str) -> Option<Self> {
        name.parse().ok()
    }

    /// Every callable name, in declaration order.
    pub fn names() -> Vec<&'static str> {
        Self::iter().map(<&'static str>::from).collect()
    }

    fn apply(&self, x: f64) -> f64 {
        match self {
            Function::Exp => x.exp(),
            Function::Sin => x.sin(),
            Function::Cos => x.cos(),
            Function::Sqrt => x.sqrt(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
enum TokenKind {
    Number(f64),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    Caret,
    LParen,
    RParen,
    Eof,
}

#[derive(Clone, Debug)]
struct Token {
    kind: TokenKind,
    position: usize,
}

struct Lexer {
    chars: Vec<char>,
    pos: usize,
    base: usize,
}
impl Lexer {
    fn new(body: &str, base: usize) -> Self {
        Self {
            chars: body.chars().collect(),
            pos: 0,
            base,
        }
    }

    fn tokenize(mut self) -> Result<Vec<Token>, ExpressionError> {
        let mut tokens = Vec::default();
        loop {
            while self.peek().is_some_and(|c| c.is_whitespace()) {
                self.pos += 1;
            }
            let position = self.base + self.pos;
            let Some(ch) = self.peek() else {
                tokens.push(Token {
                    kind: TokenKind::Eof,
                    position,
                });
                break;
            };
            let kind = match ch {
                '+' => self.single(TokenKind::Plus),
                '-' => self.single(TokenKind::Minus),
                '/' => self.single(TokenKind::Slash),
                '^' => self.single(TokenKind::Caret),
                '(' => self.single(TokenKind::LParen),
                ')' => self.single(TokenKind::RParen),
                '*' => {
                    self.pos += 1;
                    if self.peek() == Some('*') {
                        self.pos += 1;
                        TokenKind::Caret
                    } else {
                        TokenKind::Star
                    }
                }
                '0'..='9' | '.' => self.number()?,
                c if c.is_ascii_alphabetic() || c == '_' => self.ident(),
                _ => {
                    return Err(ExpressionError::Parse {
                        position,
                        message: format!("unexpected character '{ch}'"),
                    })
                }
            };
            tokens.push(Token { kind, position });
        }
        Ok(tokens)
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn single(&mut self, kind: TokenKind) -> TokenKind {
        self.pos += 1;
        kind
    }

    fn number(&mut self) -> Result<TokenKind, ExpressionError> {
        let start = self.pos;
        while self.peek().is_some_and(|c| c.is_ascii_digit() || c == '.') {
            self.pos += 1;
        }
        if matches!(self.peek(), Some('e' | 'E')) {
            let mark = self.pos;
            self.pos += 1;
            if matches!(self.peek(), Some('+' | '-')) {
                self.pos += 1;
            }
            if self.peek().is_some_and(|c| c.is_ascii_digit()) {
                while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                    self.pos += 1;
                }
            } else {
                self.pos = mark;
            }
        }
        let text: String = self.chars[start..self.pos].iter().collect();
        text.parse::<f64>()
            .map(TokenKind::Number)
            .map_err(|_| ExpressionError::Parse {
                position: self.base + start,
                message: format!("'{text}' is not a number"),
            })
    }

    fn ident(&mut self) -> TokenKind {
        let start = self.pos;
        while self
            .peek()
            .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            self.pos += 1;
        }
        TokenKind::Ident(self.chars[start..self.pos].iter().collect())
    }
}

#[derive(Debug, PartialEq)]
enum Node {
    Number(f64),
    Name { name: String, position: usize },
    Call { name: String, position: usize, argument: Box<Node> },
    Negate(Box<Node>),
    Binary { op: BinaryOp, lhs: Box<Node>, rhs: Box<Node> },
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum BinaryOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Power,
}

/// The deepest tree the parser builds. Binding, folding and evaluation all
/// recurse over the tree, so this also bounds their stack use.
const MAX_DEPTH: usize = 256;

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    nesting: usize,
}
impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self {
            tokens,
            pos: 0,
            nesting: 0,
        }
    }

    fn parse(mut self) -> Result<Node, ExpressionError> {
        let (node, _) = self.expr()?;
        let token = self.peek();
        if token.kind != TokenKind::Eof {
            return Err(Self::unexpected(token, "end of expression"));
        }
        Ok(node)
    }

    fn peek(&self) -> &Token {
        // The lexer always terminates the stream with Eof.
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn unexpected(token: &Token, wanted: &str) -> ExpressionError {
        let found = match &token.kind {
            TokenKind::Eof => "end of input".to_string(),
            TokenKind::Number(n) => format!("number {n}"),
            TokenKind::Ident(name) => format!("'{name}'"),
            other => format!("{other:?}"),
        };
        ExpressionError::Parse {
            position: token.position,
            message: format!("expected {wanted}, found {found}"),
        }
    }

    fn check_depth(&self, depth: usize) -> Result<usize, ExpressionError> {
        if depth > MAX_DEPTH {
            Err(ExpressionError::Parse {
                position: self.peek().position,
                message: "expression nested too deeply".to_string(),
            })
        } else {
            Ok(depth)
        }
    }

    fn binary(
        &self,
        op: BinaryOp,
        (lhs, lhs_depth): (Node, usize),
        (rhs, rhs_depth): (Node, usize),
    ) -> Result<(Node, usize), ExpressionError> {
        let depth = self.check_depth(lhs_depth.max(rhs_depth) + 1)?;
        Ok((
            Node::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            },
            depth,
        ))
    }

    // Each parse function returns the node with the depth of its tree.

    fn expr(&mut self) -> Result<(Node, usize), ExpressionError> {
        let mut lhs = self.term()?;
        loop {
            let op = match self.peek().kind {
                TokenKind::Plus => BinaryOp::Add,
                TokenKind::Minus => BinaryOp::Subtract,
                _ => return Ok(lhs),
            };
            self.advance();
            let rhs = self.term()?;
            lhs = self.binary(op, lhs, rhs)?;
        }
    }

    fn term(&mut self) -> Result<(Node, usize), ExpressionError> {
        let mut lhs = self.unary()?;
        loop {
            let op = match self.peek().kind {
                TokenKind::Star => BinaryOp::Multiply,
                TokenKind::Slash => BinaryOp::Divide,
                _ => return Ok(lhs),
            };
            self.advance();
            let rhs = self.unary()?;
            lhs = self.binary(op, lhs, rhs)?;
        }
    }

    /// Every recursive path passes through here, so the call stack is capped
    /// before it can grow past [MAX_DEPTH] levels.
    fn unary(&mut self) -> Result<(Node, usize), ExpressionError> {
        self.nesting += 1;
        self.check_depth(self.nesting)?;
        let r = if self.peek().kind == TokenKind::Minus {
            self.advance();
            self.unary().and_then(|(inner, depth)| {
                Ok((Node::Negate(Box::new(inner)), self.check_depth(depth + 1)?))
            })
        } else {
            self.power()
        };
        self.nesting -= 1;
        r
    }

    fn power(&mut self) -> Result<(Node, usize), ExpressionError> {
        let base = self.primary()?;
        if self.peek().kind == TokenKind::Caret {
            self.advance();
            let exponent = self.unary()?;
            return self.binary(BinaryOp::Power, base, exponent);
        }
        Ok(base)
    }

    fn primary(&mut self) -> Result<(Node, usize), ExpressionError> {
        let token = self.advance();
        match token.kind {
            TokenKind::Number(n) => Ok((Node::Number(n), 1)),
            TokenKind::LParen => {
                let inner = self.expr()?;
                self.expect_close()?;
                Ok(inner)
            }
            TokenKind::Ident(name) => {
                if self.peek().kind == TokenKind::LParen {
                    self.advance();
                    let (argument, depth) = self.expr()?;
                    self.expect_close()?;
                    Ok((
                        Node::Call {
                            name,
                            position: token.position,
                            argument: Box::new(argument),
                        },
                        self.check_depth(depth + 1)?,
                    ))
                } else {
                    Ok((
                        Node::Name {
                            name,
                            position: token.position,
                        },
                        1,
                    ))
                }
            }
            _ => Err(Self::unexpected(&token, "a number, name, or '('")),
        }
    }

    fn expect_close(&mut self) -> Result<(), ExpressionError> {
        if self.peek().kind == TokenKind::RParen {
            self.advance();
            Ok(())
        } else {
            Err(Self::unexpected(self.peek(), "')'"))
        }
    }
}

/// A tree whose names have all been resolved.
enum Bound {
    Constant(f64),
    Time,
    Call(Function, Box<Bound>),
    Negate(Box<Bound>),
    Binary(BinaryOp, Box<Bound>, Box<Bound>),
}

struct Binder<'a> {
    declared: &'a [String],
    values: &'a BTreeMap<String, f64>,
}
impl<'a> Binder<'a> {
    fn bind(&self, node: Node) -> Result<Bound, ExpressionError> {
        Ok(match node {
            Node::Number(n) => Bound::Constant(n),
            Node::Name { name, position } => match name.as_str() {
                "t" => Bound::Time,
                "pi" if !self.declared.iter().any(|p| p == "pi") => {
                    Bound::Constant(core::f64::consts::PI)
                }
                _ => {
                    let value = self
                        .declared
                        .iter()
                        .any(|p| *p == name)
                        .then(|| self.values.get(&name).copied())
                        .flatten()
                        .ok_or(ExpressionError::UnknownIdentifier { name, position })?;
                    Bound::Constant(value)
                }
            },
            Node::Call {
                name,
                position,
                argument,
            } => {
                let function = Function::from_name(&name)
                    .ok_or(ExpressionError::UnknownFunction { name, position })?;
                Bound::Call(function, Box::new(self.bind(*argument)?))
            }
            Node::Negate(inner) => Bound::Negate(Box::new(self.bind(*inner)?)),
            Node::Binary { op, lhs, rhs } => Bound::Binary(
                op,
                Box::new(self.bind(*lhs)?),
                Box::new(self.bind(*rhs)?),
            ),
        })
    }
}

type Closure = Box<dyn Fn(f64) -> f64 + Send + Sync>;

fn fold(bound: Bound) -> Closure {
    match bound {
        Bound::Constant(c) => Box::new(move |_| c),
        Bound::Time => Box::new(|t| t),
        Bound::Call(function, argument) => {
            let argument = fold(*argument);
            Box::new(move |t| function.apply(argument(t)))
        }
        Bound::Negate(inner) => {
            let inner = fold(*inner);
            Box::new(move |t| -inner(t))
        }
        Bound::Binary(op, lhs, rhs) => {
            let (lhs, rhs) = (fold(*lhs), fold(*rhs));
            match op {
                BinaryOp::Add => Box::new(move |t| lhs(t) + rhs(t)),
                BinaryOp::Subtract => Box::new(move |t| lhs(t) - rhs(t)),
                BinaryOp::Multiply => Box::new(move |t| lhs(t) * rhs(t)),
                BinaryOp::Divide => Box::new(move |t| lhs(t) / rhs(t)),
                BinaryOp::Power => Box::new(move |t| lhs(t).powf(rhs(t))),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use float_cmp::approx_eq;

    fn params(pairs: &[(&str, f64)]) -> BTreeMap<String, f64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn evaluates_precedence_and_associativity() {
        let e = CustomExpression::new("t: 1 + 2 * 3 - 4 / 2", BTreeMap::default())
            .compile()
            .unwrap();
        assert_eq!(e.evaluate(0.0), 5.0);

        let e = CustomExpression::new("t: -2 ^ 2", BTreeMap::default())
            .compile()
            .unwrap();
        assert_eq!(e.evaluate(0.0), -4.0, "unary minus binds looser than power");

        let e = CustomExpression::new("t: 2 ** 3 ** 2", BTreeMap::default())
            .compile()
            .unwrap();
        assert_eq!(e.evaluate(0.0), 512.0, "power is right-associative");

        let e = CustomExpression::new("t: 10 - 3 - 2", BTreeMap::default())
            .compile()
            .unwrap();
        assert_eq!(e.evaluate(0.0), 5.0);
    }

    #[test]
    fn binds_time_parameters_and_functions() {
        let e = CustomExpression::new(
            "t, a, tau: a * exp(-t / tau) + sqrt(4) * cos(0) + sin(pi / 2)",
            params(&[("a", 2.0), ("tau", 1.0e-6)]),
        )
        .compile()
        .unwrap();
        assert!(approx_eq!(f64, e.evaluate(0.0), 5.0, epsilon = 1e-12));
        assert!(approx_eq!(
            f64,
            e.evaluate(1.0e-6),
            2.0 * (-1.0f64).exp() + 3.0,
            epsilon = 1e-12
        ));
    }

    #[test]
    fn accepts_scientific_notation() {
        let e = CustomExpression::new("t: 1.5e3 * t + 2E-1", BTreeMap::default())
            .compile()
            .unwrap();
        assert!(approx_eq!(f64, e.evaluate(2.0), 3000.2, epsilon = 1e-9));
    }

    #[test]
    fn reports_missing_signature_and_time_parameter() {
        assert_eq!(
            CustomExpression::new("t * 2", BTreeMap::default())
                .compile()
                .unwrap_err(),
            ExpressionError::MissingSignature
        );
        assert_eq!(
            CustomExpression::new("a, t: a * t", params(&[("a", 1.0)]))
                .compile()
                .unwrap_err(),
            ExpressionError::MissingTimeParameter("a".to_string())
        );
    }

    #[test]
    fn reports_undeclared_and_unknown_names() {
        assert_eq!(
            CustomExpression::new("t, a, b: a * t + b", params(&[("a", 1.0)]))
                .compile()
                .unwrap_err(),
            ExpressionError::UndeclaredParameter("b".to_string())
        );
        assert_eq!(
            CustomExpression::new("t, a: a * t + c", params(&[("a", 1.0)]))
                .compile()
                .unwrap_err(),
            ExpressionError::UnknownIdentifier {
                name: "c".to_string(),
                position: 14
            }
        );
        assert_eq!(
            CustomExpression::new("t: tan(t)", BTreeMap::default())
                .compile()
                .unwrap_err(),
            ExpressionError::UnknownFunction {
                name: "tan".to_string(),
                position: 3
            }
        );
    }

    #[test]
    fn unknown_functions_list_the_known_ones() {
        assert_eq!(Function::names(), vec!["exp", "sin", "cos", "sqrt"]);
        let e = CustomExpression::new("t: tan(t)", BTreeMap::default())
            .compile()
            .unwrap_err();
        assert_eq!(
            e.to_string(),
            "unknown function 'tan' at position 3; expected one of exp, sin, cos, sqrt"
        );
    }

    #[test]
    fn reports_parse_position() {
        let e = CustomExpression::new("t: 1 + * 2", BTreeMap::default())
            .compile()
            .unwrap_err();
        assert!(matches!(e, ExpressionError::Parse { position: 7, .. }), "{e:?}");

        let e = CustomExpression::new("t: (1 + 2", BTreeMap::default())
            .compile()
            .unwrap_err();
        assert!(matches!(e, ExpressionError::Parse { position: 9, .. }), "{e:?}");

        let e = CustomExpression::new("t: 1 $ 2", BTreeMap::default())
            .compile()
            .unwrap_err();
        assert!(matches!(e, ExpressionError::Parse { position: 5, .. }), "{e:?}");

        let e = CustomExpression::new("t: 1 2", BTreeMap::default())
            .compile()
            .unwrap_err();
        assert!(matches!(e, ExpressionError::Parse { position: 5, .. }), "{e:?}");
    }

    #[test]
    fn positions_count_characters() {
        let e = CustomExpression::new("t,\u{2003}a: a + \u{e9}", params(&[("a", 1.0)]))
            .compile()
            .unwrap_err();
        assert!(matches!(e, ExpressionError::Parse { position: 10, .. }), "{e:?}");
    }

    #[test]
    fn deep_nesting_is_an_error() {
        let nested = format!("t: {}t{}", "(".repeat(10_000), ")".repeat(10_000));
        let e = CustomExpression::new(&nested, BTreeMap::default())
            .compile()
            .unwrap_err();
        assert!(
            matches!(&e, ExpressionError::Parse { message, .. } if message.contains("too deeply")),
            "{e:?}"
        );

        let negations = format!("t: {}t", "-".repeat(200_000));
        assert!(CustomExpression::new(&negations, BTreeMap::default())
            .compile()
            .is_err());

        let chain = format!("t: t{}", " + t".repeat(100_000));
        assert!(CustomExpression::new(&chain, BTreeMap::default())
            .compile()
            .is_err());

        let shallow = format!("t: {}t{}", "(".repeat(100), ")".repeat(100));
        assert_eq!(
            CustomExpression::new(&shallow, BTreeMap::default())
                .compile()
                .unwrap()
                .evaluate(2.0),
            2.0
        );
    }

    #[test]
    fn only_declared_parameters_can_be_set() {
        let mut e = CustomExpression::new("t, a: a * t", params(&[("a", 1.0)]));
        assert!(e.set_parameter("a", 3.0));
        assert!(!e.set_parameter("b", 3.0));
        assert_eq!(e.parameter("a"), Some(3.0));
        assert_eq!(e.compile().unwrap().evaluate(2.0), 6.0);
    }
}
