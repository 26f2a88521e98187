//! Parser for Melee
//!
//! Converts tokens into an Abstract Syntax Tree.

use crate::ast::{Expr, FunctionKind, InfixOp, PrefixOp, Program, Stmt};
use crate::error::{ErrorKind, MeleeError, Result};
use crate::token::{Span, Token, TokenKind};

/// The parser state
pub struct Parser {
    tokens: Vec<Token>,
    current: usize,
}

impl Parser {
    /// Create a new parser from tokens
    pub fn new(tokens: Vec<Token>) -> Self {
        Self { tokens, current: 0 }
    }

    /// Parse the tokens into a program
    pub fn parse(&mut self) -> Result<Program> {
        let mut statements = Vec::new();

        self.skip_semicolons();
        while !self.is_at_end() {
            statements.push(self.statement()?);
            self.skip_semicolons();
        }

        Ok(Program::new(statements))
    }

    // ==================== Statements ====================

    fn statement(&mut self) -> Result<Stmt> {
        match self.peek().kind.clone() {
            TokenKind::Ident(_) if self.peek_next().map(|t| &t.kind) == Some(&TokenKind::Declare) => {
                self.declaration()
            }
            TokenKind::Return => self.return_statement(),
            TokenKind::Yield => self.yield_statement(),
            TokenKind::While => self.while_statement(),
            TokenKind::Loop => self.loop_statement(),
            TokenKind::For => self.for_statement(),
            TokenKind::Break => Ok(Stmt::Break { span: self.advance().span }),
            TokenKind::Continue => Ok(Stmt::Continue { span: self.advance().span }),
            TokenKind::LeftBrace => {
                let span = self.peek().span;
                let stmts = self.block()?;
                Ok(Stmt::Block { stmts, span })
            }
            _ => {
                let expr = self.expression()?;
                let span = expr.span();
                Ok(Stmt::Expr { expr, span })
            }
        }
    }

    fn declaration(&mut self) -> Result<Stmt> {
        let span = self.peek().span;
        let name = self.expect_ident("variable name")?;
        self.expect(&TokenKind::Declare, "':='")?;

        let mut value = self.expression()?;
        if let Expr::Function { name: fn_name, .. } = &mut value {
            *fn_name = Some(name.clone());
        }

        Ok(Stmt::Declare { name, value, span })
    }

    fn return_statement(&mut self) -> Result<Stmt> {
        let span = self.advance().span;
        let value = self.optional_expression()?;
        Ok(Stmt::Return { value, span })
    }

    fn yield_statement(&mut self) -> Result<Stmt> {
        let span = self.advance().span;
        let value = self.optional_expression()?;
        Ok(Stmt::Yield { value, span })
    }

    fn while_statement(&mut self) -> Result<Stmt> {
        let span = self.advance().span;
        let condition = self.expression()?;
        let body = self.block()?;
        Ok(Stmt::While { condition, body, span })
    }

    fn loop_statement(&mut self) -> Result<Stmt> {
        let span = self.advance().span;
        let body = self.block()?;

        if !body.iter().any(stmt_exits) {
            return Err(MeleeError::at(ErrorKind::UnboundedLoop, span));
        }

        Ok(Stmt::Loop { body, span })
    }

    fn for_statement(&mut self) -> Result<Stmt> {
        let span = self.advance().span;
        let var = self.expect_ident("loop variable name")?;
        self.expect(&TokenKind::In, "'in'")?;
        let iterable = self.expression()?;
        let body = self.block()?;
        Ok(Stmt::For { var, iterable, body, span })
    }

    fn block(&mut self) -> Result<Vec<Stmt>> {
        self.expect(&TokenKind::LeftBrace, "'{'")?;
        let mut stmts = Vec::new();

        self.skip_semicolons();
        while !self.check(&TokenKind::RightBrace) && !self.is_at_end() {
            stmts.push(self.statement()?);
            self.skip_semicolons();
        }

        self.expect(&TokenKind::RightBrace, "'}'")?;
        Ok(stmts)
    }

    // ==================== Expressions ====================

    fn expression(&mut self) -> Result<Expr> {
        self.assignment()
    }

    fn optional_expression(&mut self) -> Result<Option<Expr>> {
        if self.peek().kind.starts_expression() {
            Ok(Some(self.expression()?))
        } else {
            Ok(None)
        }
    }

    fn assignment(&mut self) -> Result<Expr> {
        let target = self.or_expr()?;

        let compound = match self.peek().kind.clone() {
            TokenKind::Assign => None,
            TokenKind::PlusAssign => Some(InfixOp::Add),
            TokenKind::MinusAssign => Some(InfixOp::Sub),
            TokenKind::StarAssign => Some(InfixOp::Mul),
            TokenKind::SlashAssign => Some(InfixOp::Div),
            TokenKind::PercentAssign => Some(InfixOp::Mod),
            _ => return Ok(target),
        };
        let span = self.advance().span;
        let value = Box::new(self.assignment()?);
        let target = Box::new(target);

        Ok(match compound {
            None => Expr::Assign { target, value, span },
            Some(op) => Expr::CompoundAssign { target, op, value, span },
        })
    }

    /// Left-associative binary level: `next` parses the operands, `ops` maps tokens to operators
    fn binary_level(
        &mut self,
        next: fn(&mut Self) -> Result<Expr>,
        ops: &[(TokenKind, InfixOp)],
    ) -> Result<Expr> {
        let mut left = next(self)?;

        'outer: loop {
            for (kind, op) in ops {
                if self.match_token(kind) {
                    let right = next(self)?;
                    let span = left.span().to(right.span());
                    left = Expr::Infix {
                        left: Box::new(left),
                        op: *op,
                        right: Box::new(right),
                        span,
                    };
                    continue 'outer;
                }
            }
            break;
        }

        Ok(left)
    }

    fn or_expr(&mut self) -> Result<Expr> {
        self.binary_level(Self::and_expr, &[(TokenKind::OrOr, InfixOp::Or)])
    }

    fn and_expr(&mut self) -> Result<Expr> {
        self.binary_level(Self::equality, &[(TokenKind::AndAnd, InfixOp::And)])
    }

    fn equality(&mut self) -> Result<Expr> {
        self.binary_level(
            Self::comparison,
            &[
                (TokenKind::EqualEqual, InfixOp::Eq),
                (TokenKind::BangEqual, InfixOp::Ne),
            ],
        )
    }

    fn comparison(&mut self) -> Result<Expr> {
        self.binary_level(
            Self::term,
            &[
                (TokenKind::Less, InfixOp::Lt),
                (TokenKind::LessEqual, InfixOp::Le),
                (TokenKind::Greater, InfixOp::Gt),
                (TokenKind::GreaterEqual, InfixOp::Ge),
            ],
        )
    }

    fn term(&mut self) -> Result<Expr> {
        self.binary_level(
            Self::factor,
            &[(TokenKind::Plus, InfixOp::Add), (TokenKind::Minus, InfixOp::Sub)],
        )
    }

    fn factor(&mut self) -> Result<Expr> {
        self.binary_level(
            Self::unary,
            &[
                (TokenKind::Star, InfixOp::Mul),
                (TokenKind::Slash, InfixOp::Div),
                (TokenKind::Percent, InfixOp::Mod),
            ],
        )
    }

    fn unary(&mut self) -> Result<Expr> {
        let span = self.peek().span;
        match self.peek().kind.clone() {
            TokenKind::Minus | TokenKind::Bang => {
                let op = if self.advance().kind == TokenKind::Minus {
                    PrefixOp::Minus
                } else {
                    PrefixOp::Bang
                };
                let operand = Box::new(self.unary()?);
                Ok(Expr::Prefix { op, operand, span })
            }
            TokenKind::Next => {
                self.advance();
                let operand = self.optional_operand()?;
                Ok(Expr::Next { operand, span })
            }
            TokenKind::Note => {
                self.advance();
                let operand = self.optional_operand()?;
                Ok(Expr::Note { operand, span })
            }
            TokenKind::Skip => {
                self.advance();
                let duration = self.optional_operand()?;
                Ok(Expr::Skip { duration, span })
            }
            TokenKind::Cc => {
                self.advance();
                let operand = self.optional_operand()?;
                Ok(Expr::Cc { operand, span })
            }
            _ => self.postfix(),
        }
    }

    fn optional_operand(&mut self) -> Result<Option<Box<Expr>>> {
        if self.peek().kind.starts_expression() {
            Ok(Some(Box::new(self.unary()?)))
        } else {
            Ok(None)
        }
    }

    fn postfix(&mut self) -> Result<Expr> {
        let mut expr = self.primary()?;

        loop {
            if self.match_token(&TokenKind::LeftParen) {
                let args = self.list(&TokenKind::RightParen)?;
                let span = expr.span().to(self.previous().span);
                expr = Expr::Call {
                    callee: Box::new(expr),
                    args,
                    span,
                };
            } else if self.match_token(&TokenKind::LeftBracket) {
                let index = self.expression()?;
                self.expect(&TokenKind::RightBracket, "']'")?;
                let span = expr.span().to(self.previous().span);
                expr = Expr::Index {
                    collection: Box::new(expr),
                    index: Box::new(index),
                    span,
                };
            } else {
                break;
            }
        }

        Ok(expr)
    }

    /// Comma separated expressions up to and including `close`
    fn list(&mut self, close: &TokenKind) -> Result<Vec<Expr>> {
        let mut items = Vec::new();
        if !self.check(close) {
            loop {
                items.push(self.expression()?);
                if !self.match_token(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.expect(close, &format!("'{}'", close))?;
        Ok(items)
    }

    fn primary(&mut self) -> Result<Expr> {
        let token = self.peek().clone();
        let span = token.span;

        match &token.kind {
            TokenKind::Int(value) => {
                let value = *value;
                self.advance();
                Ok(Expr::Int { value, span })
            }
            TokenKind::True | TokenKind::False => {
                self.advance();
                Ok(Expr::Bool { value: token.kind == TokenKind::True, span })
            }
            TokenKind::Null => {
                self.advance();
                Ok(Expr::Null { span })
            }
            TokenKind::Ident(name) => {
                let name = name.clone();
                self.advance();
                Ok(Expr::Ident { name, span })
            }
            TokenKind::LeftParen => {
                self.advance();
                let expr = self.expression()?;
                self.expect(&TokenKind::RightParen, "')'")?;
                Ok(expr)
            }
            TokenKind::LeftBracket => {
                self.advance();
                let items = self.list(&TokenKind::RightBracket)?;
                Ok(Expr::Array { items, span: span.to(self.previous().span) })
            }
            TokenKind::Fn => self.function(FunctionKind::Fn),
            TokenKind::Gen => self.function(FunctionKind::Gen),
            TokenKind::If => self.if_expression(),
            _ => Err(MeleeError::at(
                ErrorKind::ExpectedExpression(token.kind.to_string()),
                span,
            )),
        }
    }

    fn function(&mut self, kind: FunctionKind) -> Result<Expr> {
        let span = self.advance().span;
        self.expect(&TokenKind::LeftParen, "'(' after fn/gen")?;

        let mut params = Vec::new();
        if !self.check(&TokenKind::RightParen) {
            loop {
                params.push(self.expect_ident("parameter name")?);
                if !self.match_token(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.expect(&TokenKind::RightParen, "')' after parameters")?;

        let body = self.block()?;
        Ok(Expr::Function { kind, name: None, params, body, span })
    }

    fn if_expression(&mut self) -> Result<Expr> {
        let span = self.advance().span;
        let condition = Box::new(self.expression()?);
        let consequence = self.block()?;

        let alternative = if self.match_token(&TokenKind::Else) {
            if self.check(&TokenKind::If) {
                let nested = self.if_expression()?;
                let nested_span = nested.span();
                Some(vec![Stmt::Expr { expr: nested, span: nested_span }])
            } else {
                Some(self.block()?)
            }
        } else {
            None
        };

        Ok(Expr::If { condition, consequence, alternative, span })
    }

    // ==================== Helpers ====================

    fn peek(&self) -> &Token {
        &self.tokens[self.current.min(self.tokens.len() - 1)]
    }

    fn peek_next(&self) -> Option<&Token> {
        self.tokens.get(self.current + 1)
    }

    fn previous(&self) -> &Token {
        &self.tokens[self.current.saturating_sub(1)]
    }

    fn is_at_end(&self) -> bool {
        matches!(self.peek().kind, TokenKind::Eof)
    }

    fn advance(&mut self) -> &Token {
        if !self.is_at_end() {
            self.current += 1;
        }
        self.previous()
    }

    fn check(&self, kind: &TokenKind) -> bool {
        std::mem::discriminant(&self.peek().kind) == std::mem::discriminant(kind)
    }

    fn match_token(&mut self, kind: &TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: &TokenKind, expected: &str) -> Result<&Token> {
        if self.check(kind) {
            Ok(self.advance())
        } else {
            Err(self.expected(expected))
        }
    }

    fn expect_ident(&mut self, expected: &str) -> Result<String> {
        if let TokenKind::Ident(name) = &self.peek().kind {
            let name = name.clone();
            self.advance();
            Ok(name)
        } else {
            Err(self.expected(expected))
        }
    }

    fn expected(&self, expected: &str) -> MeleeError {
        MeleeError::at(
            ErrorKind::ExpectedToken(expected.to_string(), self.peek().kind.to_string()),
            self.peek().span,
        )
    }

    fn skip_semicolons(&mut self) {
        while self.match_token(&TokenKind::Semicolon) {}
    }
}

/// Whether a statement can leave an enclosing `loop` (nested functions excluded)
fn stmt_exits(stmt: &Stmt) -> bool {
    match stmt {
        Stmt::Yield { .. } | Stmt::Return { .. } | Stmt::Break { .. } => true,
        Stmt::Expr { expr, .. } => expr_exits(expr),
        Stmt::Declare { value, .. } => expr_exits(value),
        Stmt::While { body, .. }
        | Stmt::Loop { body, .. }
        | Stmt::For { body, .. }
        | Stmt::Block { stmts: body, .. } => body.iter().any(stmt_exits),
        Stmt::Continue { .. } => false,
    }
}

fn expr_exits(expr: &Expr) -> bool {
    match expr {
        Expr::If { consequence, alternative, .. } => {
            consequence.iter().any(stmt_exits)
                || alternative.as_ref().is_some_and(|alt| alt.iter().any(stmt_exits))
        }
        _ => false,
    }
}
