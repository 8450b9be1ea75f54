//! Parser for corvid source code
//!
//! A recursive descent parser with precedence climbing for binary operators.
//! Errors are collected rather than aborting: after a failed statement the
//! parser resynchronizes at the next statement keyword and keeps going, so a
//! caller sees every problem in one pass. Type annotations are skipped.
//!
//! # Example
//!
//! ```
//! use corvid_core::parser::Parser;
//!
//! let chunk = Parser::parse_chunk("local x = 1 + 2 return x");
//! assert!(chunk.is_ok());
//!
//! let expr = Parser::parse_expression("f(1, 2)[3]");
//! assert!(expr.is_ok());
//! ```

mod error;

pub use error::{ParseError, ParseErrorKind};

use crate::ast::{
    BinOp, Block, Chunk, Expr, ExprKind, FunctionBody, Ident, InterpPart, Stmt, StmtKind,
    TableField, UnaryOp, UNARY_PRIORITY,
};
use crate::lexer::{unescape, Lexer, LineIndex, Span, Token, TokenKind};

pub type ParseResult<T> = Result<T, ParseError>;

/// The corvid parser
pub struct Parser<'src> {
    lines: LineIndex<'src>,
    tokens: Vec<Token>,
    position: usize,
    errors: Vec<ParseError>,
    /// Loop nesting of the function being parsed
    loop_depth: u32,
    /// Whether each enclosing function accepts `...`
    vararg: Vec<bool>,
}

impl<'src> Parser<'src> {
    #[must_use]
    pub fn new(source: &'src str) -> Self {
        let (tokens, lex_errors) = Lexer::tokenize(source);
        let errors = lex_errors
            .into_iter()
            .map(|e| ParseError::new(ParseErrorKind::Lex(e.error), e.span))
            .collect();
        Self {
            lines: LineIndex::new(source),
            tokens,
            position: 0,
            errors,
            loop_depth: 0,
            vararg: vec![true],
        }
    }

    /// Parse a whole chunk. Errors come back ordered by position.
    pub fn parse_chunk(source: &str) -> Result<Chunk, Vec<ParseError>> {
        let mut parser = Parser::new(source);
        let body = parser.block();
        if !parser.is_eof() {
            let found = parser.current_kind();
            let span = parser.current().span;
            parser.errors.push(ParseError::new(
                ParseErrorKind::UnexpectedToken {
                    found,
                    expected: TokenKind::Eof,
                },
                span,
            ));
        }
        parser.finish(Chunk { body })
    }

    /// Parse a single expression (used by the REPL to echo values)
    pub fn parse_expression(source: &str) -> Result<Expr, Vec<ParseError>> {
        let mut parser = Parser::new(source);
        match parser.expression() {
            Ok(expr) => {
                if !parser.is_eof() {
                    let found = parser.current_kind();
                    let span = parser.current().span;
                    parser.errors.push(ParseError::new(
                        ParseErrorKind::UnexpectedToken {
                            found,
                            expected: TokenKind::Eof,
                        },
                        span,
                    ));
                }
                parser.finish(expr)
            }
            Err(e) => {
                parser.errors.push(e);
                parser.finish(Expr::new(ExprKind::Nil, Span::default()))
            }
        }
    }

    fn finish<T>(mut self, value: T) -> Result<T, Vec<ParseError>> {
        if self.errors.is_empty() {
            Ok(value)
        } else {
            self.errors.sort_by_key(|e| e.span.start);
            Err(self.errors)
        }
    }

    // ==================== Token Management ====================

    fn current(&self) -> &Token {
        let index = self.position.min(self.tokens.len() - 1);
        &self.tokens[index]
    }

    fn current_kind(&self) -> TokenKind {
        self.current().kind
    }

    fn peek_kind(&self, offset: usize) -> TokenKind {
        let index = (self.position + offset).min(self.tokens.len() - 1);
        self.tokens[index].kind
    }

    fn is_eof(&self) -> bool {
        self.current_kind() == TokenKind::Eof
    }

    fn advance(&mut self) -> Token {
        let token = self.current().clone();
        if self.position < self.tokens.len() - 1 {
            self.position += 1;
        }
        token
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current_kind() == kind
    }

    /// True for a name token with the given text (contextual keywords)
    fn check_name(&self, text: &str) -> bool {
        self.check(TokenKind::Name) && self.current().lexeme == text
    }

    fn eat(&mut self, kind: TokenKind) -> Option<Token> {
        if self.check(kind) {
            Some(self.advance())
        } else {
            None
        }
    }

    fn expect(&mut self, kind: TokenKind) -> ParseResult<Token> {
        if self.check(kind) {
            Ok(self.advance())
        } else {
            Err(ParseError::new(
                ParseErrorKind::UnexpectedToken {
                    found: self.current_kind(),
                    expected: kind,
                },
                self.current().span,
            ))
        }
    }

    /// Expect a closing token, mentioning the opener in the error
    fn expect_closing(
        &mut self,
        kind: TokenKind,
        opener: &'static str,
        opened_at: Span,
    ) -> ParseResult<Token> {
        if self.check(kind) {
            return Ok(self.advance());
        }
        let line = self.lines.line(opened_at.start);
        if line == self.lines.line(self.current().span.start) {
            return self.expect(kind);
        }
        Err(ParseError::new(
            ParseErrorKind::Unclosed {
                found: self.current_kind(),
                expected: kind,
                opener,
                line,
            },
            self.current().span,
        ))
    }

    fn expect_ident(&mut self) -> ParseResult<Ident> {
        let token = self.current().clone();
        if token.kind == TokenKind::Name {
            self.advance();
            Ok(Ident::new(token.lexeme, token.span))
        } else {
            Err(ParseError::new(
                ParseErrorKind::ExpectedIdentifier(token.kind),
                token.span,
            ))
        }
    }

    fn previous_end(&self) -> u32 {
        self.position
            .checked_sub(1)
            .and_then(|i| self.tokens.get(i))
            .map_or(0, |t| t.span.end)
    }

    fn span_from(&self, start: u32) -> Span {
        Span::new(start, self.previous_end().max(start))
    }

    // ==================== Blocks and Statements ====================

    /// Parse statements until a block terminator
    fn block(&mut self) -> Block {
        let start = self.current().span.start;
        let mut stmts = Vec::new();

        while !self.current_kind().closes_block() {
            if self.eat(TokenKind::Semicolon).is_some() {
                continue;
            }
            let before = self.position;
            match self.statement() {
                Ok(stmt) => {
                    let is_return = matches!(stmt.kind, StmtKind::Return(_));
                    stmts.push(stmt);
                    if is_return {
                        self.eat(TokenKind::Semicolon);
                        if !self.current_kind().closes_block() {
                            self.errors.push(ParseError::new(
                                ParseErrorKind::ReturnNotLast {
                                    found: self.current_kind(),
                                    expected: "end of block",
                                },
                                self.current().span,
                            ));
                            self.synchronize();
                        }
                    }
                }
                Err(error) => {
                    self.errors.push(error);
                    if self.position == before {
                        self.advance();
                    }
                    self.synchronize();
                }
            }
        }

        Block::new(stmts, self.span_from(start))
    }

    fn statement(&mut self) -> ParseResult<Stmt> {
        let start = self.current().span.start;
        let kind = match self.current_kind() {
            TokenKind::If => self.if_statement()?,
            TokenKind::While => self.while_statement()?,
            TokenKind::Do => {
                let open = self.advance().span;
                let body = self.block();
                self.expect_closing(TokenKind::End, "'do'", open)?;
                StmtKind::Do(body)
            }
            TokenKind::For => self.for_statement()?,
            TokenKind::Repeat => self.repeat_statement()?,
            TokenKind::Function => self.function_statement()?,
            TokenKind::Local => self.local_statement()?,
            TokenKind::Return => {
                self.advance();
                let values = if self.current_kind().closes_block() || self.check(TokenKind::Semicolon)
                {
                    Vec::new()
                } else {
                    self.expression_list()?
                };
                StmtKind::Return(values)
            }
            TokenKind::Break => {
                let token = self.advance();
                if self.loop_depth == 0 {
                    return Err(ParseError::new(ParseErrorKind::BreakOutsideLoop, token.span));
                }
                StmtKind::Break
            }
            TokenKind::Name if self.at_continue() => {
                let token = self.advance();
                if self.loop_depth == 0 {
                    return Err(ParseError::new(
                        ParseErrorKind::ContinueOutsideLoop,
                        token.span,
                    ));
                }
                StmtKind::Continue
            }
            TokenKind::Name if self.at_type_declaration() => {
                self.type_declaration()?;
                StmtKind::TypeAlias
            }
            _ => self.expression_statement()?,
        };
        Ok(Stmt::new(kind, self.span_from(start)))
    }

    /// `continue` is a keyword only when it cannot start an expression statement
    fn at_continue(&self) -> bool {
        self.check_name("continue")
            && !matches!(
                self.peek_kind(1),
                TokenKind::LParen
                    | TokenKind::Dot
                    | TokenKind::LBracket
                    | TokenKind::Colon
                    | TokenKind::Assign
                    | TokenKind::Comma
                    | TokenKind::QuotedString
                    | TokenKind::LongString
                    | TokenKind::LBrace
                    | TokenKind::InterpStart
            )
            && !self.peek_kind(1).is_compound_assign()
    }

    fn at_type_declaration(&self) -> bool {
        (self.check_name("type") && self.peek_kind(1) == TokenKind::Name)
            || (self.check_name("export")
                && self.peek_kind(1) == TokenKind::Name
                && self.tokens.get(self.position + 1).is_some_and(|t| t.lexeme == "type"))
    }

    /// `[export] type Name<T> = Type`
    fn type_declaration(&mut self) -> ParseResult<()> {
        if self.check_name("export") {
            self.advance();
        }
        self.advance();
        self.expect_ident()?;
        if self.check(TokenKind::Lt) {
            self.skip_balanced(TokenKind::Lt, TokenKind::Gt)?;
        }
        self.expect(TokenKind::Assign)?;
        self.skip_type()
    }

    fn if_statement(&mut self) -> ParseResult<StmtKind> {
        let open = self.advance().span;
        let mut branches = Vec::new();
        let condition = self.expression()?;
        self.expect(TokenKind::Then)?;
        branches.push((condition, self.block()));

        let mut otherwise = None;
        loop {
            if self.eat(TokenKind::Elseif).is_some() {
                let condition = self.expression()?;
                self.expect(TokenKind::Then)?;
                branches.push((condition, self.block()));
            } else if self.eat(TokenKind::Else).is_some() {
                otherwise = Some(self.block());
                self.expect_closing(TokenKind::End, "'if'", open)?;
                break;
            } else {
                self.expect_closing(TokenKind::End, "'if'", open)?;
                break;
            }
        }
        Ok(StmtKind::If {
            branches,
            otherwise,
        })
    }

    fn while_statement(&mut self) -> ParseResult<StmtKind> {
        let open = self.advance().span;
        let condition = self.expression()?;
        self.expect(TokenKind::Do)?;
        let body = self.loop_body();
        self.expect_closing(TokenKind::End, "'while'", open)?;
        Ok(StmtKind::While { condition, body })
    }

    fn repeat_statement(&mut self) -> ParseResult<StmtKind> {
        let open = self.advance().span;
        let body = self.loop_body();
        self.expect_closing(TokenKind::Until, "'repeat'", open)?;
        let condition = self.expression()?;
        Ok(StmtKind::Repeat { body, condition })
    }

    fn loop_body(&mut self) -> Block {
        self.loop_depth += 1;
        let body = self.block();
        self.loop_depth -= 1;
        body
    }

    fn for_statement(&mut self) -> ParseResult<StmtKind> {
        let open = self.advance().span;
        let first = self.binding()?;

        if self.eat(TokenKind::Assign).is_some() {
            let start = self.expression()?;
            self.expect(TokenKind::Comma)?;
            let limit = self.expression()?;
            let step = if self.eat(TokenKind::Comma).is_some() {
                Some(self.expression()?)
            } else {
                None
            };
            self.expect(TokenKind::Do)?;
            let body = self.loop_body();
            self.expect_closing(TokenKind::End, "'for'", open)?;
            return Ok(StmtKind::NumericFor {
                var: first,
                start,
                limit,
                step,
                body,
            });
        }

        let mut vars = vec![first];
        while self.eat(TokenKind::Comma).is_some() {
            vars.push(self.binding()?);
        }
        self.expect(TokenKind::In)?;
        let exprs = self.expression_list()?;
        self.expect(TokenKind::Do)?;
        let body = self.loop_body();
        self.expect_closing(TokenKind::End, "'for'", open)?;
        Ok(StmtKind::GenericFor { vars, exprs, body })
    }

    /// A name with an optional ignored type annotation
    fn binding(&mut self) -> ParseResult<Ident> {
        let name = self.expect_ident()?;
        if self.eat(TokenKind::Colon).is_some() {
            self.skip_type()?;
        }
        Ok(name)
    }

    fn function_statement(&mut self) -> ParseResult<StmtKind> {
        let open = self.advance().span;
        let first = self.expect_ident()?;
        let mut last_name = first.name.clone();
        let mut target = Expr::new(ExprKind::Name(first.clone()), first.span);
        let mut is_method = false;

        while self.check(TokenKind::Dot) || self.check(TokenKind::Colon) {
            let method = self.advance().kind == TokenKind::Colon;
            let name = self.expect_ident()?;
            last_name.clone_from(&name.name);
            let span = target.span.to(name.span);
            target = Expr::new(
                ExprKind::Field {
                    object: Box::new(target),
                    name,
                },
                span,
            );
            if method {
                is_method = true;
                break;
            }
        }

        let mut func = self.function_body(open, is_method)?;
        func.name = Some(last_name);
        Ok(StmtKind::Function { target, func })
    }

    fn local_statement(&mut self) -> ParseResult<StmtKind> {
        let open = self.advance().span;

        if self.check(TokenKind::Function) {
            self.advance();
            let name = self.expect_ident()?;
            let mut func = self.function_body(open, false)?;
            func.name = Some(name.name.clone());
            return Ok(StmtKind::LocalFunction { name, func });
        }

        let mut names = vec![self.binding()?];
        while self.eat(TokenKind::Comma).is_some() {
            names.push(self.binding()?);
        }
        let mut values = if self.eat(TokenKind::Assign).is_some() {
            self.expression_list()?
        } else {
            Vec::new()
        };
        name_functions(names.iter().map(|n| n.name.as_str()), &mut values);
        Ok(StmtKind::Local { names, values })
    }

    fn expression_statement(&mut self) -> ParseResult<StmtKind> {
        let first = self.suffixed_expression()?;

        if self.check(TokenKind::Assign) || self.check(TokenKind::Comma) {
            let mut targets = vec![first];
            while self.eat(TokenKind::Comma).is_some() {
                targets.push(self.suffixed_expression()?);
            }
            for target in &targets {
                if !target.is_assignable() {
                    return Err(ParseError::new(
                        ParseErrorKind::InvalidAssignmentTarget,
                        target.span,
                    ));
                }
            }
            self.expect(TokenKind::Assign)?;
            let mut values = self.expression_list()?;
            name_functions(
                targets.iter().map(|t| match &t.kind {
                    ExprKind::Name(ident) | ExprKind::Field { name: ident, .. } => {
                        ident.name.as_str()
                    }
                    _ => "",
                }),
                &mut values,
            );
            return Ok(StmtKind::Assign { targets, values });
        }

        if let Some(op) = compound_op(self.current_kind()) {
            if !first.is_assignable() {
                return Err(ParseError::new(
                    ParseErrorKind::InvalidAssignmentTarget,
                    first.span,
                ));
            }
            self.advance();
            let value = self.expression()?;
            return Ok(StmtKind::CompoundAssign {
                target: first,
                op,
                value,
            });
        }

        if matches!(
            first.kind,
            ExprKind::Call { .. } | ExprKind::MethodCall { .. }
        ) {
            Ok(StmtKind::Call(first))
        } else {
            Err(ParseError::new(
                ParseErrorKind::IncompleteStatement,
                first.span,
            ))
        }
    }

    // ==================== Functions ====================

    /// Parameters, optional return type, body and `end`
    fn function_body(&mut self, open: Span, is_method: bool) -> ParseResult<FunctionBody> {
        if self.check(TokenKind::Lt) {
            self.skip_balanced(TokenKind::Lt, TokenKind::Gt)?;
        }
        let paren = self.expect(TokenKind::LParen)?.span;
        let mut params = Vec::new();
        if is_method {
            params.push(Ident::new("self", paren));
        }
        let mut is_vararg = false;

        if !self.check(TokenKind::RParen) {
            loop {
                if self.eat(TokenKind::Ellipsis).is_some() {
                    is_vararg = true;
                    if self.eat(TokenKind::Colon).is_some() {
                        self.skip_type()?;
                    }
                    break;
                }
                params.push(self.binding()?);
                if self.eat(TokenKind::Comma).is_none() {
                    break;
                }
            }
        }
        self.expect_closing(TokenKind::RParen, "'('", paren)?;
        if self.eat(TokenKind::Colon).is_some() {
            self.skip_type()?;
        }

        let saved_loops = std::mem::replace(&mut self.loop_depth, 0);
        self.vararg.push(is_vararg);
        let body = self.block();
        self.vararg.pop();
        self.loop_depth = saved_loops;

        self.expect_closing(TokenKind::End, "'function'", open)?;
        Ok(FunctionBody::new(params, is_vararg, body, self.span_from(open.start)))
    }

    // ==================== Expressions ====================

    fn expression_list(&mut self) -> ParseResult<Vec<Expr>> {
        let mut exprs = vec![self.expression()?];
        while self.eat(TokenKind::Comma).is_some() {
            exprs.push(self.expression()?);
        }
        Ok(exprs)
    }

    pub fn expression(&mut self) -> ParseResult<Expr> {
        self.binary_expression(0)
    }

    /// Precedence climbing over [`BinOp::binding_power`]
    fn binary_expression(&mut self, min_power: u8) -> ParseResult<Expr> {
        let mut left = if let Some(op) = unary_op(self.current_kind()) {
            let start = self.advance().span.start;
            let operand = self.binary_expression(UNARY_PRIORITY)?;
            let span = Span::new(start, operand.span.end);
            Expr::new(
                ExprKind::Unary {
                    op,
                    operand: Box::new(operand),
                },
                span,
            )
        } else {
            self.simple_expression()?
        };

        while let Some(op) = binary_op(self.current_kind()) {
            let (left_power, right_power) = op.binding_power();
            if left_power <= min_power {
                break;
            }
            self.advance();
            let right = self.binary_expression(right_power)?;
            let span = left.span.to(right.span);
            left = Expr::new(
                ExprKind::Binary {
                    op,
                    left: Box::new(left),
                    right: Box::new(right),
                },
                span,
            );
        }

        Ok(left)
    }

    fn simple_expression(&mut self) -> ParseResult<Expr> {
        let token = self.current().clone();
        let expr = match token.kind {
            TokenKind::Nil => {
                self.advance();
                Expr::new(ExprKind::Nil, token.span)
            }
            TokenKind::True => {
                self.advance();
                Expr::new(ExprKind::True, token.span)
            }
            TokenKind::False => {
                self.advance();
                Expr::new(ExprKind::False, token.span)
            }
            TokenKind::Ellipsis => {
                self.advance();
                if !self.vararg.last().copied().unwrap_or(false) {
                    return Err(ParseError::new(
                        ParseErrorKind::VarArgOutsideVararg,
                        token.span,
                    ));
                }
                Expr::new(ExprKind::VarArg, token.span)
            }
            TokenKind::Number | TokenKind::HexNumber | TokenKind::BinaryNumber => {
                self.advance();
                let value = parse_number(&token.lexeme, token.kind).ok_or_else(|| {
                    ParseError::new(
                        ParseErrorKind::InvalidNumber(token.lexeme.clone()),
                        token.span,
                    )
                })?;
                Expr::new(ExprKind::Number(value), token.span)
            }
            TokenKind::QuotedString | TokenKind::LongString => {
                let bytes = self.string_literal()?;
                Expr::new(ExprKind::String(bytes), token.span)
            }
            TokenKind::InterpStart => self.interpolated_string()?,
            TokenKind::LBrace => self.table_constructor()?,
            TokenKind::Function => {
                let open = self.advance().span;
                let func = self.function_body(open, false)?;
                let span = func.span;
                Expr::new(ExprKind::Function(Box::new(func)), span)
            }
            TokenKind::If => self.if_expression()?,
            _ => self.suffixed_expression()?,
        };

        if self.eat(TokenKind::ColonColon).is_some() {
            self.skip_type()?;
        }
        Ok(expr)
    }

    /// `a then b elseif c then d else e`
    fn if_expression(&mut self) -> ParseResult<Expr> {
        let start = self.advance().span.start;
        let mut branches = Vec::new();
        let condition = self.expression()?;
        self.expect(TokenKind::Then)?;
        branches.push((condition, self.expression()?));
        while self.eat(TokenKind::Elseif).is_some() {
            let condition = self.expression()?;
            self.expect(TokenKind::Then)?;
            branches.push((condition, self.expression()?));
        }
        self.expect(TokenKind::Else)?;
        let otherwise = self.expression()?;
        Ok(Expr::new(
            ExprKind::IfElse {
                branches,
                otherwise: Box::new(otherwise),
            },
            self.span_from(start),
        ))
    }

    fn primary_expression(&mut self) -> ParseResult<Expr> {
        let token = self.current().clone();
        match token.kind {
            TokenKind::Name => {
                self.advance();
                Ok(Expr::new(
                    ExprKind::Name(Ident::new(token.lexeme, token.span)),
                    token.span,
                ))
            }
            TokenKind::LParen => {
                self.advance();
                let inner = self.expression()?;
                self.expect_closing(TokenKind::RParen, "'('", token.span)?;
                Ok(Expr::new(
                    ExprKind::Paren(Box::new(inner)),
                    self.span_from(token.span.start),
                ))
            }
            kind => Err(ParseError::new(
                ParseErrorKind::ExpectedExpression(kind),
                token.span,
            )),
        }
    }

    /// Primary expression followed by field, index and call suffixes
    fn suffixed_expression(&mut self) -> ParseResult<Expr> {
        let mut expr = self.primary_expression()?;
        let start = expr.span.start;

        loop {
            match self.current_kind() {
                TokenKind::Dot => {
                    self.advance();
                    let name = self.expect_ident()?;
                    expr = Expr::new(
                        ExprKind::Field {
                            object: Box::new(expr),
                            name,
                        },
                        self.span_from(start),
                    );
                }
                TokenKind::LBracket => {
                    let open = self.advance().span;
                    let key = self.expression()?;
                    self.expect_closing(TokenKind::RBracket, "'['", open)?;
                    expr = Expr::new(
                        ExprKind::Index {
                            object: Box::new(expr),
                            key: Box::new(key),
                        },
                        self.span_from(start),
                    );
                }
                TokenKind::Colon => {
                    self.advance();
                    let method = self.expect_ident()?;
                    let args = self.call_arguments()?;
                    expr = Expr::new(
                        ExprKind::MethodCall {
                            object: Box::new(expr),
                            method,
                            args,
                        },
                        self.span_from(start),
                    );
                }
                TokenKind::LParen
                | TokenKind::QuotedString
                | TokenKind::LongString
                | TokenKind::LBrace
                | TokenKind::InterpStart => {
                    let args = self.call_arguments()?;
                    expr = Expr::new(
                        ExprKind::Call {
                            callee: Box::new(expr),
                            args,
                        },
                        self.span_from(start),
                    );
                }
                _ => return Ok(expr),
            }
        }
    }

    /// `(args)`, a string literal, or a table constructor
    fn call_arguments(&mut self) -> ParseResult<Vec<Expr>> {
        let token = self.current().clone();
        match token.kind {
            TokenKind::LParen => {
                let previous_line = self.lines.line(self.previous_end());
                if self.lines.line(token.span.start) != previous_line {
                    return Err(ParseError::new(ParseErrorKind::AmbiguousCall, token.span)
                        .with_hint("use ';' to separate statements"));
                }
                self.advance();
                let args = if self.check(TokenKind::RParen) {
                    Vec::new()
                } else {
                    self.expression_list()?
                };
                self.expect_closing(TokenKind::RParen, "'('", token.span)?;
                Ok(args)
            }
            TokenKind::QuotedString | TokenKind::LongString => {
                let bytes = self.string_literal()?;
                Ok(vec![Expr::new(ExprKind::String(bytes), token.span)])
            }
            TokenKind::InterpStart => Ok(vec![self.interpolated_string()?]),
            TokenKind::LBrace => Ok(vec![self.table_constructor()?]),
            kind => Err(ParseError::new(
                ParseErrorKind::UnexpectedToken {
                    found: kind,
                    expected: TokenKind::LParen,
                },
                token.span,
            )),
        }
    }

    fn string_literal(&mut self) -> ParseResult<Vec<u8>> {
        let token = self.advance();
        if token.kind == TokenKind::LongString {
            return Ok(token.lexeme.into_bytes());
        }
        let raw = &token.lexeme[1..token.lexeme.len() - 1];
        unescape(raw).map_err(|e| ParseError::new(ParseErrorKind::InvalidString(e), token.span))
    }

    fn interpolated_string(&mut self) -> ParseResult<Expr> {
        let open = self.expect(TokenKind::InterpStart)?.span;
        let mut parts = Vec::new();
        loop {
            let token = self.current().clone();
            match token.kind {
                TokenKind::InterpText => {
                    self.advance();
                    let text = unescape(&token.lexeme).map_err(|e| {
                        ParseError::new(ParseErrorKind::InvalidString(e), token.span)
                    })?;
                    parts.push(InterpPart::Text(text));
                }
                TokenKind::InterpOpen => {
                    self.advance();
                    let expr = self.expression()?;
                    self.expect_closing(TokenKind::InterpClose, "'{'", token.span)?;
                    parts.push(InterpPart::Expr(expr));
                }
                TokenKind::InterpEnd => {
                    self.advance();
                    break;
                }
                _ => {
                    return Err(ParseError::new(
                        ParseErrorKind::Unclosed {
                            found: token.kind,
                            expected: TokenKind::InterpEnd,
                            opener: "'`'",
                            line: self.lines.line(open.start),
                        },
                        token.span,
                    ))
                }
            }
        }
        Ok(Expr::new(
            ExprKind::Interpolated(parts),
            self.span_from(open.start),
        ))
    }

    fn table_constructor(&mut self) -> ParseResult<Expr> {
        let open = self.expect(TokenKind::LBrace)?.span;
        let mut fields = Vec::new();

        while !self.check(TokenKind::RBrace) {
            if self.check(TokenKind::LBracket) {
                let bracket = self.advance().span;
                let key = self.expression()?;
                self.expect_closing(TokenKind::RBracket, "'['", bracket)?;
                self.expect(TokenKind::Assign)?;
                let value = self.expression()?;
                fields.push(TableField::Keyed(key, value));
            } else if self.check(TokenKind::Name) && self.peek_kind(1) == TokenKind::Assign {
                let name = self.expect_ident()?;
                self.advance();
                let mut value = self.expression()?;
                if let ExprKind::Function(func) = &mut value.kind {
                    func.name.get_or_insert_with(|| name.name.clone());
                }
                fields.push(TableField::Named(name, value));
            } else {
                fields.push(TableField::Positional(self.expression()?));
            }

            if self.eat(TokenKind::Comma).is_none() && self.eat(TokenKind::Semicolon).is_none() {
                break;
            }
        }

        self.expect_closing(TokenKind::RBrace, "'{'", open)?;
        Ok(Expr::new(ExprKind::Table(fields), self.span_from(open.start)))
    }

    // ==================== Type Annotations (skipped) ====================

    fn skip_type(&mut self) -> ParseResult<()> {
        if self.eat(TokenKind::Pipe).is_none() {
            self.eat(TokenKind::Ampersand);
        }
        self.skip_simple_type()?;
        while self.eat(TokenKind::Pipe).is_some() || self.eat(TokenKind::Ampersand).is_some() {
            self.skip_simple_type()?;
        }
        Ok(())
    }

    fn skip_simple_type(&mut self) -> ParseResult<()> {
        let token = self.current().clone();
        match token.kind {
            TokenKind::Name => {
                self.advance();
                if token.lexeme == "typeof" && self.check(TokenKind::LParen) {
                    self.skip_balanced(TokenKind::LParen, TokenKind::RParen)?;
                } else {
                    if self.eat(TokenKind::Dot).is_some() {
                        self.expect_ident()?;
                    }
                    if self.check(TokenKind::Lt) {
                        self.skip_balanced(TokenKind::Lt, TokenKind::Gt)?;
                    }
                }
            }
            TokenKind::Nil
            | TokenKind::True
            | TokenKind::False
            | TokenKind::QuotedString
            | TokenKind::LongString => {
                self.advance();
            }
            TokenKind::LBrace => self.skip_balanced(TokenKind::LBrace, TokenKind::RBrace)?,
            TokenKind::LParen | TokenKind::Lt => {
                if token.kind == TokenKind::Lt {
                    self.skip_balanced(TokenKind::Lt, TokenKind::Gt)?;
                }
                self.skip_balanced(TokenKind::LParen, TokenKind::RParen)?;
                if self.eat(TokenKind::Arrow).is_some() {
                    self.skip_type()?;
                }
            }
            TokenKind::Ellipsis => {
                self.advance();
                self.skip_simple_type()?;
            }
            kind => {
                return Err(ParseError::new(ParseErrorKind::ExpectedType(kind), token.span));
            }
        }
        while self.eat(TokenKind::Question).is_some() {}
        Ok(())
    }

    fn skip_balanced(&mut self, open: TokenKind, close: TokenKind) -> ParseResult<()> {
        let opened = self.expect(open)?.span;
        let mut depth = 1u32;
        while depth > 0 {
            let kind = self.current_kind();
            if kind == TokenKind::Eof {
                return self.expect_closing(close, "type", opened).map(|_| ());
            }
            if kind == open {
                depth += 1;
            } else if kind == close {
                depth -= 1;
            }
            self.advance();
        }
        Ok(())
    }

    // ==================== Error Recovery ====================

    /// Skip tokens until something that can start a statement
    fn synchronize(&mut self) {
        while !self.is_eof() {
            match self.current_kind() {
                TokenKind::Semicolon => {
                    self.advance();
                    return;
                }
                TokenKind::Local
                | TokenKind::Function
                | TokenKind::If
                | TokenKind::While
                | TokenKind::For
                | TokenKind::Repeat
                | TokenKind::Return
                | TokenKind::Do
                | TokenKind::End
                | TokenKind::Else
                | TokenKind::Elseif
                | TokenKind::Until => return,
                _ => {
                    self.advance();
                }
            }
        }
    }
}

// ==================== Helper Functions ====================

/// Give anonymous function literals the name they are assigned to
fn name_functions<'a>(names: impl Iterator<Item = &'a str>, values: &mut [Expr]) {
    for (name, value) in names.zip(values.iter_mut()) {
        if let ExprKind::Function(func) = &mut value.kind {
            if func.name.is_none() && !name.is_empty() {
                func.name = Some(name.to_string());
            }
        }
    }
}

fn unary_op(kind: TokenKind) -> Option<UnaryOp> {
    match kind {
        TokenKind::Minus => Some(UnaryOp::Neg),
        TokenKind::Not => Some(UnaryOp::Not),
        TokenKind::Hash => Some(UnaryOp::Len),
        _ => None,
    }
}

fn binary_op(kind: TokenKind) -> Option<BinOp> {
    Some(match kind {
        TokenKind::Plus => BinOp::Add,
        TokenKind::Minus => BinOp::Sub,
        TokenKind::Star => BinOp::Mul,
        TokenKind::Slash => BinOp::Div,
        TokenKind::SlashSlash => BinOp::IDiv,
        TokenKind::Percent => BinOp::Mod,
        TokenKind::Caret => BinOp::Pow,
        TokenKind::DotDot => BinOp::Concat,
        TokenKind::EqEq => BinOp::Eq,
        TokenKind::NotEq => BinOp::Ne,
        TokenKind::Lt => BinOp::Lt,
        TokenKind::LtEq => BinOp::Le,
        TokenKind::Gt => BinOp::Gt,
        TokenKind::GtEq => BinOp::Ge,
        TokenKind::And => BinOp::And,
        TokenKind::Or => BinOp::Or,
        _ => return None,
    })
}

fn compound_op(kind: TokenKind) -> Option<BinOp> {
    Some(match kind {
        TokenKind::PlusAssign => BinOp::Add,
        TokenKind::MinusAssign => BinOp::Sub,
        TokenKind::StarAssign => BinOp::Mul,
        TokenKind::SlashAssign => BinOp::Div,
        TokenKind::SlashSlashAssign => BinOp::IDiv,
        TokenKind::PercentAssign => BinOp::Mod,
        TokenKind::CaretAssign => BinOp::Pow,
        TokenKind::DotDotAssign => BinOp::Concat,
        _ => return None,
    })
}

/// Parse a numeric literal; `_` separators are ignored
pub(crate) fn parse_number(lexeme: &str, kind: TokenKind) -> Option<f64> {
    let clean = lexeme.replace('_', "");
    match kind {
        TokenKind::HexNumber => u64::from_str_radix(&clean[2..], 16).ok().map(|n| n as f64),
        TokenKind::BinaryNumber => u64::from_str_radix(&clean[2..], 2).ok().map(|n| n as f64),
        _ => clean.parse::<f64>().ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(source: &str) -> Chunk {
        Parser::parse_chunk(source).unwrap_or_else(|e| panic!("parse failed: {e:?}"))
    }

    fn parse_expr(source: &str) -> Expr {
        Parser::parse_expression(source).unwrap_or_else(|e| panic!("parse failed: {e:?}"))
    }

    fn first_error(source: &str) -> ParseErrorKind {
        Parser::parse_chunk(source).unwrap_err().remove(0).kind
    }

    #[test]
    fn parse_precedence() {
        let expr = parse_expr("1 + 2 * 3");
        let ExprKind::Binary { op, right, .. } = expr.kind else {
            panic!("expected binary");
        };
        assert_eq!(op, BinOp::Add);
        assert!(matches!(right.kind, ExprKind::Binary { op: BinOp::Mul, .. }));
    }

    #[test]
    fn concat_and_pow_are_right_associative() {
        let expr = parse_expr("a .. b .. c");
        let ExprKind::Binary { left, .. } = expr.kind else {
            panic!("expected binary");
        };
        assert!(matches!(left.kind, ExprKind::Name(_)));

        let expr = parse_expr("2 ^ 3 ^ 2");
        let ExprKind::Binary { right, .. } = expr.kind else {
            panic!("expected binary");
        };
        assert!(matches!(right.kind, ExprKind::Binary { op: BinOp::Pow, .. }));
    }

    #[test]
    fn unary_binds_looser_than_pow() {
        let expr = parse_expr("-x ^ 2");
        let ExprKind::Unary { op, operand } = expr.kind else {
            panic!("expected unary");
        };
        assert_eq!(op, UnaryOp::Neg);
        assert!(matches!(operand.kind, ExprKind::Binary { op: BinOp::Pow, .. }));
    }

    #[test]
    fn parse_numbers() {
        assert_eq!(parse_number("0xff", TokenKind::HexNumber), Some(255.0));
        assert_eq!(parse_number("0b101", TokenKind::BinaryNumber), Some(5.0));
        assert_eq!(parse_number("1_000.5", TokenKind::Number), Some(1000.5));
        assert_eq!(parse_number("1e3", TokenKind::Number), Some(1000.0));
    }

    #[test]
    fn parse_calls_and_methods() {
        let expr = parse_expr("obj:method(1, 2)");
        assert!(matches!(expr.kind, ExprKind::MethodCall { ref args, .. } if args.len() == 2));

        let expr = parse_expr("print 'hi'");
        assert!(matches!(expr.kind, ExprKind::Call { ref args, .. } if args.len() == 1));

        let expr = parse_expr("f{1, 2}");
        assert!(matches!(expr.kind, ExprKind::Call { .. }));
    }

    #[test]
    fn parse_table_constructor() {
        let expr = parse_expr("{1, x = 2; [3] = 4, f()}");
        let ExprKind::Table(fields) = expr.kind else {
            panic!("expected table");
        };
        assert_eq!(fields.len(), 4);
        assert!(matches!(fields[1], TableField::Named(..)));
        assert!(matches!(fields[2], TableField::Keyed(..)));
    }

    #[test]
    fn parse_if_expression() {
        let expr = parse_expr("if a then 1 elseif b then 2 else 3");
        assert!(matches!(expr.kind, ExprKind::IfElse { ref branches, .. } if branches.len() == 2));
    }

    #[test]
    fn parse_interpolation() {
        let expr = parse_expr("`x = {x}!`");
        let ExprKind::Interpolated(parts) = expr.kind else {
            panic!("expected interpolated string");
        };
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], InterpPart::Text(b"x = ".to_vec()));
    }

    #[test]
    fn parse_statements() {
        let chunk = parse(
            "local a, b = 1, 2
             a, b = b, a
             a += 1
             function t.x.y:m(p) return self end
             local function f(...) return ... end
             for i = 1, 10, 2 do end
             for k, v in pairs(t) do continue end
             while true do break end
             repeat local z = 1 until z == 1
             if a then elseif b then else end
             do end",
        );
        assert_eq!(chunk.body.stmts.len(), 11);
        let StmtKind::Function { func, .. } = &chunk.body.stmts[3].kind else {
            panic!("expected function statement");
        };
        assert_eq!(func.params[0].name, "self");
        assert_eq!(func.name.as_deref(), Some("m"));
    }

    #[test]
    fn type_annotations_are_ignored() {
        let chunk = parse(
            "type Point = { x: number, y: number }
             export type Pair<T> = { first: T, second: T? }
             local function add(a: number, b: number): number return a + b end
             local p: Point = { x = 1, y = 2 }
             local f = function<T>(x: T, ...: any): (T, ...any) return x end
             local n = (p :: any).x",
        );
        assert_eq!(chunk.body.stmts.len(), 6);
    }

    #[test]
    fn continue_is_contextual() {
        let chunk = parse("local continue = 1 continue = 2");
        assert_eq!(chunk.body.stmts.len(), 2);
        assert_eq!(first_error("continue"), ParseErrorKind::ContinueOutsideLoop);
    }

    #[test]
    fn function_names_propagate() {
        let chunk = parse("local f = function() end");
        let StmtKind::Local { values, .. } = &chunk.body.stmts[0].kind else {
            panic!("expected local");
        };
        let ExprKind::Function(func) = &values[0].kind else {
            panic!("expected function");
        };
        assert_eq!(func.name.as_deref(), Some("f"));
    }

    #[test]
    fn errors() {
        assert_eq!(
            first_error("return ("),
            ParseErrorKind::ExpectedExpression(TokenKind::Eof)
        );
        assert_eq!(first_error("break"), ParseErrorKind::BreakOutsideLoop);
        assert_eq!(first_error("x"), ParseErrorKind::IncompleteStatement);
        assert_eq!(first_error("f() = 1"), ParseErrorKind::InvalidAssignmentTarget);
        assert_eq!(
            first_error("function f() return ... end"),
            ParseErrorKind::VarArgOutsideVararg
        );
        assert!(matches!(
            first_error("return 1 print(2)"),
            ParseErrorKind::ReturnNotLast { .. }
        ));
    }

    #[test]
    fn unclosed_block_mentions_opener() {
        let kind = first_error("function f()\n  return 1\n");
        assert!(matches!(kind, ParseErrorKind::Unclosed { line: 1, .. }));
        assert_eq!(
            kind.to_string(),
            "expected 'end' (to close 'function' at line 1), got <eof>"
        );
    }

    #[test]
    fn ambiguous_call_is_rejected() {
        assert_eq!(
            first_error("local a = f\n(g)()"),
            ParseErrorKind::AmbiguousCall
        );
    }

    #[test]
    fn recovery_collects_multiple_errors() {
        let errors = Parser::parse_chunk("local = 1\nlocal y = )\nlocal z = 3").unwrap_err();
        assert!(errors.len() >= 2);
    }
}
