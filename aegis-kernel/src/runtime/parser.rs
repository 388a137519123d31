//! Recursive-descent parser producing the workflow AST.

use super::lexer::{LexError, Lexer, Token, TokenKind};
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    NoneLit,
    Name(String),
    List(Vec<Expr>),
    Dict(Vec<(Expr, Expr)>),
    Attr {
        object: Box<Expr>,
        name: String,
    },
    Subscript {
        object: Box<Expr>,
        index: Box<Expr>,
    },
    Call {
        func: Box<Expr>,
        args: Vec<Expr>,
        kwargs: Vec<(String, Expr)>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    BoolOp {
        op: BoolOpKind,
        left: Box<Expr>,
        right: Box<Expr>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
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
    Mod,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    NotIn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoolOpKind {
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Import {
        module: String,
        line: usize,
    },
    FromImport {
        module: String,
        names: Vec<String>,
        line: usize,
    },
    Assign {
        target: String,
        value: Expr,
        line: usize,
    },
    ExprStmt {
        expr: Expr,
        line: usize,
    },
    If {
        branches: Vec<(Expr, Vec<Stmt>)>,
        else_body: Vec<Stmt>,
        line: usize,
    },
    For {
        target: String,
        iter: Expr,
        body: Vec<Stmt>,
        line: usize,
    },
    While {
        cond: Expr,
        body: Vec<Stmt>,
        line: usize,
    },
    With {
        expr: Expr,
        binding: Option<String>,
        body: Vec<Stmt>,
        line: usize,
    },
    Return {
        value: Option<Expr>,
        line: usize,
    },
    Pass,
    Break {
        line: usize,
    },
    Continue {
        line: usize,
    },
}

/// A parse error with its source position.
#[derive(Debug, Clone)]
pub struct ParseError {
    pub message: String,
    pub line: usize,
    pub col: usize,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}:{}: {}", self.line, self.col, self.message)
    }
}

impl From<LexError> for ParseError {
    fn from(e: LexError) -> Self {
        ParseError {
            message: e.message,
            line: e.line,
            col: e.col,
        }
    }
}

/// Parse workflow source into a statement list.
pub fn parse(source: &str) -> Result<Vec<Stmt>, ParseError> {
    let tokens = Lexer::new(source).tokenize()?;
    Parser { tokens, pos: 0 }.parse_program()
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn parse_program(&mut self) -> Result<Vec<Stmt>, ParseError> {
        let mut stmts = Vec::new();
        while !self.check(&TokenKind::Eof) {
            stmts.push(self.parse_statement()?);
        }
        Ok(stmts)
    }

    fn parse_statement(&mut self) -> Result<Stmt, ParseError> {
        let token = self.peek().clone();
        match &token.kind {
            TokenKind::Import => self.parse_import(),
            TokenKind::From => self.parse_from_import(),
            TokenKind::If => self.parse_if(),
            TokenKind::For => self.parse_for(),
            TokenKind::While => self.parse_while(),
            TokenKind::With => self.parse_with(),
            TokenKind::Return => {
                self.advance();
                let value = if self.check(&TokenKind::Newline) {
                    None
                } else {
                    Some(self.parse_expr()?)
                };
                self.expect_newline()?;
                Ok(Stmt::Return {
                    value,
                    line: token.line,
                })
            }
            TokenKind::Pass => {
                self.advance();
                self.expect_newline()?;
                Ok(Stmt::Pass)
            }
            TokenKind::Break => {
                self.advance();
                self.expect_newline()?;
                Ok(Stmt::Break { line: token.line })
            }
            TokenKind::Continue => {
                self.advance();
                self.expect_newline()?;
                Ok(Stmt::Continue { line: token.line })
            }
            _ => self.parse_assign_or_expr(),
        }
    }

    fn parse_import(&mut self) -> Result<Stmt, ParseError> {
        let line = self.peek().line;
        self.advance(); // import
        let module = self.parse_dotted_name()?;
        // "import x as y" keeps the module for validation purposes
        if self.check(&TokenKind::As) {
            self.advance();
            self.expect_ident()?;
        }
        self.expect_newline()?;
        Ok(Stmt::Import { module, line })
    }

    fn parse_from_import(&mut self) -> Result<Stmt, ParseError> {
        let line = self.peek().line;
        self.advance(); // from
        let module = self.parse_dotted_name()?;
        self.expect(TokenKind::Import)?;
        let mut names = Vec::new();
        loop {
            if self.check(&TokenKind::Star) {
                self.advance();
                names.push("*".to_string());
            } else {
                names.push(self.expect_ident()?);
                if self.check(&TokenKind::As) {
                    self.advance();
                    self.expect_ident()?;
                }
            }
            if self.check(&TokenKind::Comma) {
                self.advance();
            } else {
                break;
            }
        }
        self.expect_newline()?;
        Ok(Stmt::FromImport {
            module,
            names,
            line,
        })
    }

    fn parse_dotted_name(&mut self) -> Result<String, ParseError> {
        let mut name = self.expect_ident()?;
        while self.check(&TokenKind::Dot) {
            self.advance();
            name.push('.');
            name.push_str(&self.expect_ident()?);
        }
        Ok(name)
    }

    fn parse_if(&mut self) -> Result<Stmt, ParseError> {
        let line = self.peek().line;
        self.advance(); // if
        let mut branches = Vec::new();
        let cond = self.parse_expr()?;
        let body = self.parse_block()?;
        branches.push((cond, body));

        let mut else_body = Vec::new();
        loop {
            if self.check(&TokenKind::Elif) {
                self.advance();
                let cond = self.parse_expr()?;
                let body = self.parse_block()?;
                branches.push((cond, body));
            } else if self.check(&TokenKind::Else) {
                self.advance();
                else_body = self.parse_block()?;
                break;
            } else {
                break;
            }
        }
        Ok(Stmt::If {
            branches,
            else_body,
            line,
        })
    }

    fn parse_for(&mut self) -> Result<Stmt, ParseError> {
        let line = self.peek().line;
        self.advance(); // for
        let target = self.expect_ident()?;
        self.expect(TokenKind::In)?;
        let iter = self.parse_expr()?;
        let body = self.parse_block()?;
        Ok(Stmt::For {
            target,
            iter,
            body,
            line,
        })
    }

    fn parse_while(&mut self) -> Result<Stmt, ParseError> {
        let line = self.peek().line;
        self.advance(); // while
        let cond = self.parse_expr()?;
        let body = self.parse_block()?;
        Ok(Stmt::While { cond, body, line })
    }

    fn parse_with(&mut self) -> Result<Stmt, ParseError> {
        let line = self.peek().line;
        self.advance(); // with
        let expr = self.parse_expr()?;
        let binding = if self.check(&TokenKind::As) {
            self.advance();
            Some(self.expect_ident()?)
        } else {
            None
        };
        let body = self.parse_block()?;
        Ok(Stmt::With {
            expr,
            binding,
            body,
            line,
        })
    }

    /// `: NEWLINE INDENT stmt+ DEDENT`
    fn parse_block(&mut self) -> Result<Vec<Stmt>, ParseError> {
        self.expect(TokenKind::Colon)?;
        self.expect(TokenKind::Newline)?;
        self.expect(TokenKind::Indent)?;
        let mut stmts = Vec::new();
        while !self.check(&TokenKind::Dedent) && !self.check(&TokenKind::Eof) {
            stmts.push(self.parse_statement()?);
        }
        self.expect(TokenKind::Dedent)?;
        Ok(stmts)
    }

    fn parse_assign_or_expr(&mut self) -> Result<Stmt, ParseError> {
        let line = self.peek().line;

        // NAME '=' is an assignment; everything else is an expression
        // statement. Attribute and subscript targets are not assignable.
        if let TokenKind::Ident(name) = self.peek().kind.clone() {
            if matches!(self.peek_at(1).map(|t| &t.kind), Some(TokenKind::Assign)) {
                self.advance();
                self.advance();
                let value = self.parse_expr()?;
                self.expect_newline()?;
                return Ok(Stmt::Assign {
                    target: name,
                    value,
                    line,
                });
            }
        }

        let expr = self.parse_expr()?;
        if self.check(&TokenKind::Assign) {
            let token = self.peek().clone();
            return Err(ParseError {
                message: "only simple names can be assigned to".into(),
                line: token.line,
                col: token.col,
            });
        }
        self.expect_newline()?;
        Ok(Stmt::ExprStmt { expr, line })
    }

    // ---------------------------------------------------------------------
    // Expressions
    // ---------------------------------------------------------------------

    fn parse_expr(&mut self) -> Result<Expr, ParseError> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_and()?;
        while self.check(&TokenKind::Or) {
            self.advance();
            let right = self.parse_and()?;
            left = Expr::BoolOp {
                op: BoolOpKind::Or,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_not()?;
        while self.check(&TokenKind::And) {
            self.advance();
            let right = self.parse_not()?;
            left = Expr::BoolOp {
                op: BoolOpKind::And,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr, ParseError> {
        if self.check(&TokenKind::Not) {
            self.advance();
            let operand = self.parse_not()?;
            return Ok(Expr::Unary {
                op: UnaryOp::Not,
                operand: Box::new(operand),
            });
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, ParseError> {
        let left = self.parse_additive()?;
        let op = match self.peek().kind {
            TokenKind::Eq => Some(BinaryOp::Eq),
            TokenKind::Ne => Some(BinaryOp::Ne),
            TokenKind::Lt => Some(BinaryOp::Lt),
            TokenKind::Le => Some(BinaryOp::Le),
            TokenKind::Gt => Some(BinaryOp::Gt),
            TokenKind::Ge => Some(BinaryOp::Ge),
            TokenKind::In => Some(BinaryOp::In),
            TokenKind::Not => {
                // "not in"
                if matches!(self.peek_at(1).map(|t| &t.kind), Some(TokenKind::In)) {
                    self.advance();
                    Some(BinaryOp::NotIn)
                } else {
                    None
                }
            }
            _ => None,
        };
        match op {
            Some(op) => {
                self.advance();
                let right = self.parse_additive()?;
                Ok(Expr::Binary {
                    op,
                    left: Box::new(left),
                    right: Box::new(right),
                })
            }
            None => Ok(left),
        }
    }

    fn parse_additive(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = match self.peek().kind {
                TokenKind::Plus => BinaryOp::Add,
                TokenKind::Minus => BinaryOp::Sub,
                _ => break,
            };
            self.advance();
            let right = self.parse_multiplicative()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek().kind {
                TokenKind::Star => BinaryOp::Mul,
                TokenKind::Slash => BinaryOp::Div,
                TokenKind::Percent => BinaryOp::Mod,
                _ => break,
            };
            self.advance();
            let right = self.parse_unary()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, ParseError> {
        if self.check(&TokenKind::Minus) {
            self.advance();
            let operand = self.parse_unary()?;
            return Ok(Expr::Unary {
                op: UnaryOp::Neg,
                operand: Box::new(operand),
            });
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.parse_primary()?;
        loop {
            match self.peek().kind {
                TokenKind::Dot => {
                    self.advance();
                    let name = self.expect_ident()?;
                    expr = Expr::Attr {
                        object: Box::new(expr),
                        name,
                    };
                }
                TokenKind::LParen => {
                    self.advance();
                    let (args, kwargs) = self.parse_call_args()?;
                    expr = Expr::Call {
                        func: Box::new(expr),
                        args,
                        kwargs,
                    };
                }
                TokenKind::LBracket => {
                    self.advance();
                    let index = self.parse_expr()?;
                    self.expect(TokenKind::RBracket)?;
                    expr = Expr::Subscript {
                        object: Box::new(expr),
                        index: Box::new(index),
                    };
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    fn parse_call_args(&mut self) -> Result<(Vec<Expr>, Vec<(String, Expr)>), ParseError> {
        let mut args = Vec::new();
        let mut kwargs = Vec::new();
        if self.check(&TokenKind::RParen) {
            self.advance();
            return Ok((args, kwargs));
        }
        loop {
            // NAME '=' expr is a keyword argument
            let is_kwarg = matches!(self.peek().kind, TokenKind::Ident(_))
                && matches!(self.peek_at(1).map(|t| &t.kind), Some(TokenKind::Assign));
            if is_kwarg {
                let name = self.expect_ident()?;
                self.advance(); // '='
                let value = self.parse_expr()?;
                kwargs.push((name, value));
            } else {
                if !kwargs.is_empty() {
                    let token = self.peek().clone();
                    return Err(ParseError {
                        message: "positional argument follows keyword argument".into(),
                        line: token.line,
                        col: token.col,
                    });
                }
                args.push(self.parse_expr()?);
            }
            if self.check(&TokenKind::Comma) {
                self.advance();
                // allow trailing comma
                if self.check(&TokenKind::RParen) {
                    break;
                }
            } else {
                break;
            }
        }
        self.expect(TokenKind::RParen)?;
        Ok((args, kwargs))
    }

    fn parse_primary(&mut self) -> Result<Expr, ParseError> {
        let token = self.peek().clone();
        match token.kind {
            TokenKind::Str(value) => {
                self.advance();
                Ok(Expr::Str(value))
            }
            TokenKind::Int(value) => {
                self.advance();
                Ok(Expr::Int(value))
            }
            TokenKind::Float(value) => {
                self.advance();
                Ok(Expr::Float(value))
            }
            TokenKind::True => {
                self.advance();
                Ok(Expr::Bool(true))
            }
            TokenKind::False => {
                self.advance();
                Ok(Expr::Bool(false))
            }
            TokenKind::NoneLit => {
                self.advance();
                Ok(Expr::NoneLit)
            }
            TokenKind::Ident(name) => {
                self.advance();
                Ok(Expr::Name(name))
            }
            TokenKind::LParen => {
                self.advance();
                let expr = self.parse_expr()?;
                self.expect(TokenKind::RParen)?;
                Ok(expr)
            }
            TokenKind::LBracket => {
                self.advance();
                let mut items = Vec::new();
                while !self.check(&TokenKind::RBracket) {
                    items.push(self.parse_expr()?);
                    if self.check(&TokenKind::Comma) {
                        self.advance();
                    } else {
                        break;
                    }
                }
                self.expect(TokenKind::RBracket)?;
                Ok(Expr::List(items))
            }
            TokenKind::LBrace => {
                self.advance();
                let mut entries = Vec::new();
                while !self.check(&TokenKind::RBrace) {
                    let key = self.parse_expr()?;
                    self.expect(TokenKind::Colon)?;
                    let value = self.parse_expr()?;
                    entries.push((key, value));
                    if self.check(&TokenKind::Comma) {
                        self.advance();
                    } else {
                        break;
                    }
                }
                self.expect(TokenKind::RBrace)?;
                Ok(Expr::Dict(entries))
            }
            other => Err(ParseError {
                message: format!("unexpected {}", other),
                line: token.line,
                col: token.col,
            }),
        }
    }

    // ---------------------------------------------------------------------
    // Token helpers
    // ---------------------------------------------------------------------

    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek_at(&self, offset: usize) -> Option<&Token> {
        self.tokens.get(self.pos + offset)
    }

    fn check(&self, kind: &TokenKind) -> bool {
        &self.peek().kind == kind
    }

    fn advance(&mut self) {
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
    }

    fn expect(&mut self, kind: TokenKind) -> Result<(), ParseError> {
        if self.check(&kind) {
            self.advance();
            Ok(())
        } else {
            let token = self.peek().clone();
            Err(ParseError {
                message: format!("expected {}, found {}", kind, token.kind),
                line: token.line,
                col: token.col,
            })
        }
    }

    fn expect_newline(&mut self) -> Result<(), ParseError> {
        self.expect(TokenKind::Newline)
    }

    fn expect_ident(&mut self) -> Result<String, ParseError> {
        let token = self.peek().clone();
        if let TokenKind::Ident(name) = token.kind {
            self.advance();
            Ok(name)
        } else {
            Err(ParseError {
                message: format!("expected identifier, found {}", token.kind),
                line: token.line,
                col: token.col,
            })
        }
    }
}
