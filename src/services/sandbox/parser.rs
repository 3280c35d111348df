//! Recursive-descent parser producing the expression AST.
//!
//! Accepts a single expression, optionally prefixed with `return` and
//! terminated with semicolons, so that function-body style snippets
//! (`return 'target';`) evaluate as expressions.

use crate::domain::errors::SandboxError;

use super::lexer::{tokenize, Spanned, Token};

#[derive(Debug, Clone, PartialEq)]
pub enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalOp {
    And,
    Or,
    Nullish,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Null,
    Bool(bool),
    Num(f64),
    Str(String),
    Array(Vec<Expr>),
    Object(Vec<(String, Expr)>),
    Ident(String),
    Member {
        base: Box<Expr>,
        name: String,
        optional: bool,
    },
    Index {
        base: Box<Expr>,
        index: Box<Expr>,
        optional: bool,
    },
    Call {
        callee: Box<Expr>,
        args: Vec<Expr>,
    },
    Unary {
        op: UnaryOp,
        expr: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Logical {
        op: LogicalOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Ternary {
        cond: Box<Expr>,
        then: Box<Expr>,
        otherwise: Box<Expr>,
    },
}

pub fn parse(source: &str) -> Result<Expr, SandboxError> {
    let tokens = tokenize(source)?;
    let mut parser = Parser { tokens, pos: 0 };

    // Function-body style: optional leading `return`.
    if matches!(parser.peek(), Token::Ident(name) if name == "return") {
        parser.advance();
    }
    let expr = parser.expression()?;
    while matches!(parser.peek(), Token::Semicolon) {
        parser.advance();
    }
    parser.expect_eof()?;
    Ok(expr)
}

struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        &self.tokens[self.pos].token
    }

    fn offset(&self) -> usize {
        self.tokens[self.pos].offset
    }

    fn advance(&mut self) -> Token {
        let token = self.tokens[self.pos].token.clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, expected: &Token, what: &str) -> Result<(), SandboxError> {
        if self.peek() == expected {
            self.advance();
            Ok(())
        } else {
            Err(self.error(format!("expected {what}")))
        }
    }

    fn expect_eof(&self) -> Result<(), SandboxError> {
        if matches!(self.peek(), Token::Eof) {
            Ok(())
        } else {
            Err(self.error("unexpected trailing input".to_string()))
        }
    }

    fn error(&self, message: String) -> SandboxError {
        SandboxError::Syntax { offset: self.offset(), message }
    }

    fn expression(&mut self) -> Result<Expr, SandboxError> {
        self.ternary()
    }

    fn ternary(&mut self) -> Result<Expr, SandboxError> {
        let cond = self.nullish()?;
        if matches!(self.peek(), Token::Question) {
            self.advance();
            let then = self.expression()?;
            self.expect(&Token::Colon, "':' in ternary")?;
            let otherwise = self.expression()?;
            return Ok(Expr::Ternary {
                cond: Box::new(cond),
                then: Box::new(then),
                otherwise: Box::new(otherwise),
            });
        }
        Ok(cond)
    }

    fn nullish(&mut self) -> Result<Expr, SandboxError> {
        let mut lhs = self.logical_or()?;
        while matches!(self.peek(), Token::QuestionQuestion) {
            self.advance();
            let rhs = self.logical_or()?;
            lhs = Expr::Logical {
                op: LogicalOp::Nullish,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn logical_or(&mut self) -> Result<Expr, SandboxError> {
        let mut lhs = self.logical_and()?;
        while matches!(self.peek(), Token::OrOr) {
            self.advance();
            let rhs = self.logical_and()?;
            lhs = Expr::Logical { op: LogicalOp::Or, lhs: Box::new(lhs), rhs: Box::new(rhs) };
        }
        Ok(lhs)
    }

    fn logical_and(&mut self) -> Result<Expr, SandboxError> {
        let mut lhs = self.equality()?;
        while matches!(self.peek(), Token::AndAnd) {
            self.advance();
            let rhs = self.equality()?;
            lhs = Expr::Logical { op: LogicalOp::And, lhs: Box::new(lhs), rhs: Box::new(rhs) };
        }
        Ok(lhs)
    }

    fn equality(&mut self) -> Result<Expr, SandboxError> {
        let mut lhs = self.relational()?;
        loop {
            let op = match self.peek() {
                Token::EqEq => BinaryOp::Eq,
                Token::NotEq => BinaryOp::NotEq,
                _ => break,
            };
            self.advance();
            let rhs = self.relational()?;
            lhs = Expr::Binary { op, lhs: Box::new(lhs), rhs: Box::new(rhs) };
        }
        Ok(lhs)
    }

    fn relational(&mut self) -> Result<Expr, SandboxError> {
        let mut lhs = self.additive()?;
        loop {
            let op = match self.peek() {
                Token::Lt => BinaryOp::Lt,
                Token::Le => BinaryOp::Le,
                Token::Gt => BinaryOp::Gt,
                Token::Ge => BinaryOp::Ge,
                _ => break,
            };
            self.advance();
            let rhs = self.additive()?;
            lhs = Expr::Binary { op, lhs: Box::new(lhs), rhs: Box::new(rhs) };
        }
        Ok(lhs)
    }

    fn additive(&mut self) -> Result<Expr, SandboxError> {
        let mut lhs = self.multiplicative()?;
        loop {
            let op = match self.peek() {
                Token::Plus => BinaryOp::Add,
                Token::Minus => BinaryOp::Sub,
                _ => break,
            };
            self.advance();
            let rhs = self.multiplicative()?;
            lhs = Expr::Binary { op, lhs: Box::new(lhs), rhs: Box::new(rhs) };
        }
        Ok(lhs)
    }

    fn multiplicative(&mut self) -> Result<Expr, SandboxError> {
        let mut lhs = self.unary()?;
        loop {
            let op = match self.peek() {
                Token::Star => BinaryOp::Mul,
                Token::Slash => BinaryOp::Div,
                Token::Percent => BinaryOp::Rem,
                _ => break,
            };
            self.advance();
            let rhs = self.unary()?;
            lhs = Expr::Binary { op, lhs: Box::new(lhs), rhs: Box::new(rhs) };
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr, SandboxError> {
        match self.peek() {
            Token::Not => {
                self.advance();
                let expr = self.unary()?;
                Ok(Expr::Unary { op: UnaryOp::Not, expr: Box::new(expr) })
            }
            Token::Minus => {
                self.advance();
                let expr = self.unary()?;
                Ok(Expr::Unary { op: UnaryOp::Neg, expr: Box::new(expr) })
            }
            _ => self.postfix(),
        }
    }

    fn postfix(&mut self) -> Result<Expr, SandboxError> {
        let mut expr = self.primary()?;
        loop {
            match self.peek() {
                Token::Dot | Token::QuestionDot => {
                    let optional = matches!(self.peek(), Token::QuestionDot);
                    self.advance();
                    match self.advance() {
                        Token::Ident(name) => {
                            expr = Expr::Member { base: Box::new(expr), name, optional };
                        }
                        _ => return Err(self.error("expected property name".into())),
                    }
                }
                Token::LBracket => {
                    self.advance();
                    let index = self.expression()?;
                    self.expect(&Token::RBracket, "']'")?;
                    expr = Expr::Index {
                        base: Box::new(expr),
                        index: Box::new(index),
                        optional: false,
                    };
                }
                Token::LParen => {
                    self.advance();
                    let mut args = Vec::new();
                    if !matches!(self.peek(), Token::RParen) {
                        loop {
                            args.push(self.expression()?);
                            if matches!(self.peek(), Token::Comma) {
                                self.advance();
                            } else {
                                break;
                            }
                        }
                    }
                    self.expect(&Token::RParen, "')'")?;
                    expr = Expr::Call { callee: Box::new(expr), args };
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    fn primary(&mut self) -> Result<Expr, SandboxError> {
        match self.advance() {
            Token::Num(n) => Ok(Expr::Num(n)),
            Token::Str(s) => Ok(Expr::Str(s)),
            Token::True => Ok(Expr::Bool(true)),
            Token::False => Ok(Expr::Bool(false)),
            Token::Null => Ok(Expr::Null),
            Token::Ident(name) => Ok(Expr::Ident(name)),
            Token::LParen => {
                let expr = self.expression()?;
                self.expect(&Token::RParen, "')'")?;
                Ok(expr)
            }
            Token::LBracket => {
                let mut items = Vec::new();
                if !matches!(self.peek(), Token::RBracket) {
                    loop {
                        items.push(self.expression()?);
                        if matches!(self.peek(), Token::Comma) {
                            self.advance();
                        } else {
                            break;
                        }
                    }
                }
                self.expect(&Token::RBracket, "']'")?;
                Ok(Expr::Array(items))
            }
            Token::LBrace => {
                let mut fields = Vec::new();
                if !matches!(self.peek(), Token::RBrace) {
                    loop {
                        let key = match self.advance() {
                            Token::Ident(name) => name,
                            Token::Str(s) => s,
                            _ => return Err(self.error("expected object key".into())),
                        };
                        self.expect(&Token::Colon, "':' after object key")?;
                        let value = self.expression()?;
                        fields.push((key, value));
                        if matches!(self.peek(), Token::Comma) {
                            self.advance();
                        } else {
                            break;
                        }
                    }
                }
                self.expect(&Token::RBrace, "'}'")?;
                Ok(Expr::Object(fields))
            }
            other => Err(self.error(format!("unexpected token {other:?}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_member_chains() {
        let expr = parse("outputs.security.issues").unwrap();
        match expr {
            Expr::Member { name, .. } => assert_eq!(name, "issues"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn parses_ternary_and_logic() {
        let expr = parse("a && b || c ? 1 : 2").unwrap();
        assert!(matches!(expr, Expr::Ternary { .. }));
    }

    #[test]
    fn parses_return_prefix_and_semicolon() {
        let expr = parse("return 'target';").unwrap();
        assert_eq!(expr, Expr::Str("target".into()));
    }

    #[test]
    fn parses_calls_with_args() {
        let expr = parse("hasIssue('severity', 'error')").unwrap();
        match expr {
            Expr::Call { args, .. } => assert_eq!(args.len(), 2),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn parses_array_and_object_literals() {
        let expr = parse("[1, 'two', {a: 3, 'b': [4]}]").unwrap();
        match expr {
            Expr::Array(items) => assert_eq!(items.len(), 3),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn rejects_trailing_garbage() {
        assert!(parse("1 2").is_err());
        assert!(parse("a.").is_err());
        assert!(parse("(a").is_err());
    }

    #[test]
    fn triple_equals_is_equality() {
        let expr = parse("a === 'x'").unwrap();
        assert!(matches!(expr, Expr::Binary { op: BinaryOp::Eq, .. }));
    }
}
