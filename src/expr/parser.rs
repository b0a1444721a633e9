//! Recursive-descent parser producing an [`Expr`] tree.
//!
//! Precedence, loosest first:
//! `+ -`, then `* / // %`, then unary `+ -`, then `**` (right-associative,
//! its right operand may carry a unary sign), then calls and attribute access.

use num_bigint::BigInt;

use super::lexer::{Token, TokenKind};
use super::ParseError;

/// Deepest parenthesis/unary nesting accepted.
const MAX_NESTING: usize = 100;

/// Largest number of nodes accepted in one expression.
const MAX_NODES: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Plus,
    Minus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
    Pow,
}

impl BinaryOp {
    pub const fn symbol(self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
            Self::FloorDiv => "//",
            Self::Mod => "%",
            Self::Pow => "**",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Int(BigInt),
    Float(f64),
    Str(String),
    Name(String),
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Call {
        callee: Box<Expr>,
        args: Vec<Expr>,
    },
    Attribute {
        value: Box<Expr>,
        name: String,
    },
}

/// Parser output: the tree plus every name it references, in first-seen order.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedExpr {
    pub root: Expr,
    pub names: Vec<String>,
}

pub fn parse(tokens: &[Token]) -> Result<ParsedExpr, ParseError> {
    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
        nodes: 0,
        names: Vec::new(),
    };
    let root = parser.expression()?;

    let next = parser.peek();
    match next.kind {
        TokenKind::End => {}
        TokenKind::RParen => return Err(ParseError::new("unmatched ')'", next.offset)),
        ref other => {
            return Err(ParseError::new(
                format!("invalid syntax near {}", other.describe()),
                next.offset,
            ))
        }
    }

    Ok(ParsedExpr {
        root,
        names: parser.names,
    })
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
    depth: usize,
    nodes: usize,
    names: Vec<String>,
}

impl Parser<'_> {
    fn peek(&self) -> &Token {
        // tokenize() always terminates the stream with End
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn advance(&mut self) -> &Token {
        let index = self.pos.min(self.tokens.len() - 1);
        self.pos += 1;
        &self.tokens[index]
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if &self.peek().kind == kind {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn node(&mut self, expr: Expr) -> Result<Expr, ParseError> {
        self.nodes += 1;
        if self.nodes > MAX_NODES {
            return Err(ParseError::new("expression is too complex", self.peek().offset));
        }
        Ok(expr)
    }

    fn enter(&mut self) -> Result<(), ParseError> {
        self.depth += 1;
        if self.depth > MAX_NESTING {
            return Err(ParseError::new("too many nested parentheses", self.peek().offset));
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.depth -= 1;
    }

    fn record_name(&mut self, name: &str) {
        if !self.names.iter().any(|n| n == name) {
            self.names.push(name.to_string());
        }
    }

    fn expression(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.term()?;
        loop {
            let op = match self.peek().kind {
                TokenKind::Plus => BinaryOp::Add,
                TokenKind::Minus => BinaryOp::Sub,
                _ => return Ok(left),
            };
            self.pos += 1;
            let right = self.term()?;
            left = self.node(Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            })?;
        }
    }

    fn term(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.factor()?;
        loop {
            let op = match self.peek().kind {
                TokenKind::Star => BinaryOp::Mul,
                TokenKind::Slash => BinaryOp::Div,
                TokenKind::DoubleSlash => BinaryOp::FloorDiv,
                TokenKind::Percent => BinaryOp::Mod,
                _ => return Ok(left),
            };
            self.pos += 1;
            let right = self.factor()?;
            left = self.node(Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            })?;
        }
    }

    fn factor(&mut self) -> Result<Expr, ParseError> {
        let op = match self.peek().kind {
            TokenKind::Plus => UnaryOp::Plus,
            TokenKind::Minus => UnaryOp::Minus,
            _ => return self.power(),
        };
        self.pos += 1;
        self.enter()?;
        let operand = self.factor();
        self.leave();
        let operand = operand?;
        self.node(Expr::Unary {
            op,
            operand: Box::new(operand),
        })
    }

    fn power(&mut self) -> Result<Expr, ParseError> {
        let base = self.postfix()?;
        if !self.eat(&TokenKind::DoubleStar) {
            return Ok(base);
        }
        self.enter()?;
        let exponent = self.factor();
        self.leave();
        let exponent = exponent?;
        self.node(Expr::Binary {
            op: BinaryOp::Pow,
            left: Box::new(base),
            right: Box::new(exponent),
        })
    }

    fn postfix(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.atom()?;
        loop {
            if self.eat(&TokenKind::LParen) {
                let args = self.arguments()?;
                expr = self.node(Expr::Call {
                    callee: Box::new(expr),
                    args,
                })?;
            } else if self.eat(&TokenKind::Dot) {
                let token = self.advance().clone();
                let TokenKind::Name(name) = token.kind else {
                    return Err(ParseError::new("invalid syntax after '.'", token.offset));
                };
                self.record_name(&name);
                expr = self.node(Expr::Attribute {
                    value: Box::new(expr),
                    name,
                })?;
            } else {
                return Ok(expr);
            }
        }
    }

    /// Parse call arguments; the opening parenthesis is already consumed.
    fn arguments(&mut self) -> Result<Vec<Expr>, ParseError> {
        let mut args = Vec::new();
        if self.eat(&TokenKind::RParen) {
            return Ok(args);
        }
        self.enter()?;
        loop {
            let arg = self.expression();
            let arg = match arg {
                Ok(arg) => arg,
                Err(e) => {
                    self.leave();
                    return Err(e);
                }
            };
            args.push(arg);
            if self.eat(&TokenKind::Comma) {
                // trailing comma before ')' is allowed
                if self.eat(&TokenKind::RParen) {
                    break;
                }
                continue;
            }
            if self.eat(&TokenKind::RParen) {
                break;
            }
            self.leave();
            let token = self.peek();
            return Err(match token.kind {
                TokenKind::End => ParseError::new("'(' was never closed", token.offset),
                ref other => ParseError::new(
                    format!("invalid syntax near {}", other.describe()),
                    token.offset,
                ),
            });
        }
        self.leave();
        Ok(args)
    }

    fn atom(&mut self) -> Result<Expr, ParseError> {
        let token = self.advance().clone();
        match token.kind {
            TokenKind::Int(value) => self.node(Expr::Int(value)),
            TokenKind::Float(value) => self.node(Expr::Float(value)),
            TokenKind::Str(text) => self.node(Expr::Str(text)),
            TokenKind::Name(name) => {
                self.record_name(&name);
                self.node(Expr::Name(name))
            }
            TokenKind::LParen => {
                self.enter()?;
                let inner = self.expression();
                self.leave();
                let inner = inner?;
                if self.eat(&TokenKind::RParen) {
                    Ok(inner)
                } else {
                    let next = self.peek();
                    Err(match next.kind {
                        TokenKind::End => ParseError::new("'(' was never closed", token.offset),
                        ref other => ParseError::new(
                            format!("invalid syntax near {}", other.describe()),
                            next.offset,
                        ),
                    })
                }
            }
            TokenKind::End => Err(ParseError::new("unexpected end of expression", token.offset)),
            TokenKind::RParen => Err(ParseError::new("unmatched ')'", token.offset)),
            other => Err(ParseError::new(
                format!("invalid syntax near {}", other.describe()),
                token.offset,
            )),
        }
    }
}
