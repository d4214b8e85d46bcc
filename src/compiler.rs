// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2025 Tobias Sarnowski <tobias@sarnowski.cloud>

//! Single-pass compiler: a Pratt expression parser fused with the code
//! emitter. There is no intermediate AST — each grammar rule, as it
//! recognizes a construct, emits bytecode directly into the chunk of
//! whichever function is currently being compiled.
//!
//! A stack of [`FunctionScope`]s models nested function bodies (the
//! innermost is the one currently receiving bytecode); a stack of
//! [`ClassScope`]s tracks whether `this`/`super` are in play.

use std::fmt;

use crate::chunk::{Chunk, OpCode};
use crate::gc::Heap;
use crate::object::{ObjFunction, ObjRef, UpvalueDescriptor};
use crate::scanner::{Scanner, Token, TokenKind};
use crate::value::Value;

/// Where a compile error was anchored, matching the three cases the
/// scanner/parser can report: at a specific lexeme, at end-of-input,
/// or with no location (the scanner's own error tokens already embed
/// their message and have no lexeme worth quoting).
#[derive(Debug, Clone)]
enum ErrorLocation {
    Token(String),
    End,
    None,
}

/// A single compile-time diagnostic.
#[derive(Debug, Clone)]
pub struct CompileError {
    pub line: u32,
    location: ErrorLocation,
    pub message: String,
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[line {}] Error", self.line)?;
        match &self.location {
            ErrorLocation::Token(lexeme) => write!(f, " at '{lexeme}'")?,
            ErrorLocation::End => write!(f, " at end")?,
            ErrorLocation::None => {}
        }
        write!(f, ": {}", self.message)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    None,
    Assignment,
    Or,
    And,
    Equality,
    Comparison,
    Term,
    Factor,
    Unary,
    Call,
    Primary,
}

impl Precedence {
    const fn next(self) -> Self {
        match self {
            Self::None => Self::Assignment,
            Self::Assignment => Self::Or,
            Self::Or => Self::And,
            Self::And => Self::Equality,
            Self::Equality => Self::Comparison,
            Self::Comparison => Self::Term,
            Self::Term => Self::Factor,
            Self::Factor => Self::Unary,
            Self::Unary => Self::Call,
            Self::Call | Self::Primary => Self::Primary,
        }
    }
}

fn precedence_of(kind: TokenKind) -> Precedence {
    match kind {
        TokenKind::Minus | TokenKind::Plus => Precedence::Term,
        TokenKind::Slash | TokenKind::Star => Precedence::Factor,
        TokenKind::BangEqual | TokenKind::EqualEqual => Precedence::Equality,
        TokenKind::Greater | TokenKind::GreaterEqual | TokenKind::Less | TokenKind::LessEqual => {
            Precedence::Comparison
        }
        TokenKind::And => Precedence::And,
        TokenKind::Or => Precedence::Or,
        TokenKind::LeftParen | TokenKind::Dot => Precedence::Call,
        _ => Precedence::None,
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum FunctionType {
    Script,
    Function,
    Method,
    Initializer,
}

struct Local<'src> {
    name: &'src str,
    /// -1 means declared but not yet initialized (its own initializer
    /// expression is still being compiled).
    depth: i32,
    is_captured: bool,
}

struct FunctionScope<'src> {
    function: ObjFunction,
    function_type: FunctionType,
    locals: Vec<Local<'src>>,
    upvalues: Vec<UpvalueDescriptor>,
    scope_depth: i32,
}

impl<'src> FunctionScope<'src> {
    fn new(function_type: FunctionType, name: Option<ObjRef>) -> Self {
        // Slot 0 is reserved: the receiver for methods, unnamed (and
        // inaccessible to user code) everywhere else.
        let slot_zero_name = match function_type {
            FunctionType::Method | FunctionType::Initializer => "this",
            FunctionType::Script | FunctionType::Function => "",
        };
        Self {
            function: ObjFunction::new(name),
            function_type,
            locals: vec![Local {
                name: slot_zero_name,
                depth: 0,
                is_captured: false,
            }],
            upvalues: Vec::new(),
            scope_depth: 0,
        }
    }
}

struct ClassScope {
    has_superclass: bool,
}

/// Drives the scanner, tracks compiler state, and emits bytecode.
/// `'src` is the lifetime of the source text (token lexemes borrow it
/// directly rather than allocating); `'heap` is the lifetime of the
/// heap used to intern identifiers/strings and allocate function
/// objects as they finish compiling.
struct Parser<'src, 'heap> {
    scanner: Scanner<'src>,
    heap: &'heap mut Heap,
    previous: Token<'src>,
    current: Token<'src>,
    had_error: bool,
    panic_mode: bool,
    errors: Vec<CompileError>,
    scopes: Vec<FunctionScope<'src>>,
    classes: Vec<ClassScope>,
}

impl<'src, 'heap> Parser<'src, 'heap> {
    fn new(source: &'src str, heap: &'heap mut Heap) -> Self {
        let dummy = Token {
            kind: TokenKind::Eof,
            lexeme: "",
            line: 0,
        };
        Self {
            scanner: Scanner::new(source),
            heap,
            previous: dummy,
            current: dummy,
            had_error: false,
            panic_mode: false,
            errors: Vec::new(),
            scopes: vec![FunctionScope::new(FunctionType::Script, None)],
            classes: Vec::new(),
        }
    }

    // -- token stream -----------------------------------------------

    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.scanner.scan_token();
            if self.current.kind != TokenKind::Error {
                break;
            }
            let message = self.current.lexeme.to_string();
            self.error_at(self.current, &message);
        }
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn match_token(&mut self, kind: TokenKind) -> bool {
        if !self.check(kind) {
            return false;
        }
        self.advance();
        true
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.check(kind) {
            self.advance();
            return;
        }
        self.error_at_current(message);
    }

    fn line(&self) -> u32 {
        self.previous.line
    }

    // -- error reporting ----------------------------------------------

    fn error_at(&mut self, token: Token<'src>, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.had_error = true;
        let location = match token.kind {
            TokenKind::Eof => ErrorLocation::End,
            TokenKind::Error => ErrorLocation::None,
            _ => ErrorLocation::Token(token.lexeme.to_string()),
        };
        self.errors.push(CompileError {
            line: token.line,
            location,
            message: message.to_string(),
        });
    }

    fn error(&mut self, message: &str) {
        let token = self.previous;
        self.error_at(token, message);
    }

    fn error_at_current(&mut self, message: &str) {
        let token = self.current;
        self.error_at(token, message);
    }

    fn synchronize(&mut self) {
        self.panic_mode = false;
        while self.current.kind != TokenKind::Eof {
            if self.previous.kind == TokenKind::Semicolon {
                return;
            }
            match self.current.kind {
                TokenKind::Class
                | TokenKind::Fun
                | TokenKind::Var
                | TokenKind::For
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Print
                | TokenKind::Return => return,
                _ => self.advance(),
            }
        }
    }

    // -- emission -------------------------------------------------------

    fn current_chunk_mut(&mut self) -> &mut Chunk {
        &mut self.scopes.last_mut().expect("scope stack never empty").function.chunk
    }

    fn current_function_type(&self) -> FunctionType {
        self.scopes.last().expect("scope stack never empty").function_type
    }

    fn emit_byte(&mut self, byte: u8) {
        let line = self.line();
        self.current_chunk_mut().write(byte, line);
    }

    fn emit_op(&mut self, op: OpCode) {
        self.emit_byte(op as u8);
    }

    fn emit_two(&mut self, op: OpCode, operand: u8) {
        self.emit_op(op);
        self.emit_byte(operand);
    }

    fn emit_constant(&mut self, value: Value) {
        let idx = self.current_chunk_mut().add_constant(value);
        match idx {
            Some(i) => self.emit_two(OpCode::Constant, i),
            None => self.error("Too many constants in one chunk."),
        }
    }

    fn emit_return(&mut self) {
        if self.current_function_type() == FunctionType::Initializer {
            self.emit_two(OpCode::GetLocal, 0);
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.emit_op(OpCode::Return);
    }

    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_op(op);
        self.emit_byte(0xff);
        self.emit_byte(0xff);
        self.current_chunk_mut().code.len() - 2
    }

    fn patch_jump(&mut self, offset: usize) {
        let jump = self.current_chunk_mut().code.len() - offset - 2;
        if jump > u16::MAX as usize {
            self.error("Too much code to jump over.");
        }
        let chunk = self.current_chunk_mut();
        chunk.code[offset] = ((jump >> 8) & 0xff) as u8;
        chunk.code[offset + 1] = (jump & 0xff) as u8;
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_op(OpCode::Loop);
        let offset = self.current_chunk_mut().code.len() - loop_start + 2;
        if offset > u16::MAX as usize {
            self.error("Loop body too large.");
        }
        self.emit_byte(((offset >> 8) & 0xff) as u8);
        self.emit_byte((offset & 0xff) as u8);
    }

    fn identifier_constant(&mut self, name: &str) -> u8 {
        let obj = self.heap.intern(name);
        let idx = self.current_chunk_mut().add_constant(Value::Obj(obj));
        match idx {
            Some(i) => i,
            None => {
                self.error("Too many constants in one chunk.");
                0
            }
        }
    }

    // -- scope & variable resolution -------------------------------------

    fn begin_scope(&mut self) {
        self.scopes.last_mut().expect("scope stack never empty").scope_depth += 1;
    }

    fn end_scope(&mut self) {
        let scope_index = self.scopes.len() - 1;
        self.scopes[scope_index].scope_depth -= 1;
        let depth = self.scopes[scope_index].scope_depth;
        loop {
            let Some(local) = self.scopes[scope_index].locals.last() else {
                break;
            };
            if local.depth <= depth {
                break;
            }
            let captured = local.is_captured;
            self.scopes[scope_index].locals.pop();
            if captured {
                self.emit_op(OpCode::CloseUpvalue);
            } else {
                self.emit_op(OpCode::Pop);
            }
        }
    }

    fn add_local(&mut self, name: &'src str) {
        let scope_index = self.scopes.len() - 1;
        if self.scopes[scope_index].locals.len() >= 256 {
            self.error("Too many local variables in function.");
            return;
        }
        self.scopes[scope_index].locals.push(Local {
            name,
            depth: -1,
            is_captured: false,
        });
    }

    fn declare_variable(&mut self) {
        let scope_index = self.scopes.len() - 1;
        if self.scopes[scope_index].scope_depth == 0 {
            return;
        }
        let name = self.previous.lexeme;
        let depth = self.scopes[scope_index].scope_depth;
        let mut duplicate = false;
        for local in self.scopes[scope_index].locals.iter().rev() {
            if local.depth != -1 && local.depth < depth {
                break;
            }
            if local.name == name {
                duplicate = true;
                break;
            }
        }
        if duplicate {
            self.error("Already a variable with this name in this scope.");
            return;
        }
        self.add_local(name);
    }

    fn mark_initialized(&mut self) {
        let scope_index = self.scopes.len() - 1;
        if self.scopes[scope_index].scope_depth == 0 {
            return;
        }
        let depth = self.scopes[scope_index].scope_depth;
        if let Some(local) = self.scopes[scope_index].locals.last_mut() {
            local.depth = depth;
        }
    }

    fn parse_variable(&mut self, message: &str) -> u8 {
        self.consume(TokenKind::Identifier, message);
        self.declare_variable();
        let scope_index = self.scopes.len() - 1;
        if self.scopes[scope_index].scope_depth > 0 {
            return 0;
        }
        let name = self.previous.lexeme;
        self.identifier_constant(name)
    }

    fn define_variable(&mut self, global: u8) {
        let scope_index = self.scopes.len() - 1;
        if self.scopes[scope_index].scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_two(OpCode::DefineGlobal, global);
    }

    fn resolve_local(&mut self, scope_index: usize, name: &str) -> Option<u8> {
        let count = self.scopes[scope_index].locals.len();
        for i in (0..count).rev() {
            let (matches_name, depth) = {
                let local = &self.scopes[scope_index].locals[i];
                (local.name == name, local.depth)
            };
            if matches_name {
                if depth == -1 {
                    self.error("Can't read local variable in its own initializer.");
                }
                return Some(i as u8);
            }
        }
        None
    }

    fn add_upvalue(&mut self, scope_index: usize, index: u8, is_local: bool) -> u8 {
        let scope = &mut self.scopes[scope_index];
        for (i, up) in scope.upvalues.iter().enumerate() {
            if up.index == index && up.is_local == is_local {
                return i as u8;
            }
        }
        if scope.upvalues.len() >= 256 {
            self.error("Too many closure variables in function.");
            return 0;
        }
        let scope = &mut self.scopes[scope_index];
        scope.upvalues.push(UpvalueDescriptor { is_local, index });
        scope.function.upvalue_count = scope.upvalues.len();
        (scope.upvalues.len() - 1) as u8
    }

    fn resolve_upvalue(&mut self, scope_index: usize, name: &str) -> Option<u8> {
        if scope_index == 0 {
            return None;
        }
        let enclosing = scope_index - 1;
        if let Some(local) = self.resolve_local(enclosing, name) {
            self.scopes[enclosing].locals[local as usize].is_captured = true;
            return Some(self.add_upvalue(scope_index, local, true));
        }
        if let Some(upvalue) = self.resolve_upvalue(enclosing, name) {
            return Some(self.add_upvalue(scope_index, upvalue, false));
        }
        None
    }

    fn named_variable(&mut self, name: Token<'src>, can_assign: bool) {
        let scope_index = self.scopes.len() - 1;
        let (get_op, set_op, arg) = if let Some(local) = self.resolve_local(scope_index, name.lexeme) {
            (OpCode::GetLocal, OpCode::SetLocal, local)
        } else if let Some(up) = self.resolve_upvalue(scope_index, name.lexeme) {
            (OpCode::GetUpvalue, OpCode::SetUpvalue, up)
        } else {
            let global = self.identifier_constant(name.lexeme);
            (OpCode::GetGlobal, OpCode::SetGlobal, global)
        };

        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_two(set_op, arg);
        } else {
            self.emit_two(get_op, arg);
        }
    }

    // -- expressions ------------------------------------------------------

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let can_assign = precedence <= Precedence::Assignment;
        if !self.prefix_rule(self.previous.kind, can_assign) {
            self.error("Expect expression.");
            return;
        }

        while precedence <= precedence_of(self.current.kind) {
            self.advance();
            self.infix_rule(self.previous.kind, can_assign);
        }

        if can_assign && self.match_token(TokenKind::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    fn prefix_rule(&mut self, kind: TokenKind, can_assign: bool) -> bool {
        match kind {
            TokenKind::LeftParen => self.grouping(),
            TokenKind::Minus | TokenKind::Bang => self.unary(),
            TokenKind::Number => self.number(),
            TokenKind::String => self.string(),
            TokenKind::True | TokenKind::False | TokenKind::Nil => self.literal(),
            TokenKind::Identifier => self.variable(can_assign),
            TokenKind::This => self.this_expr(),
            TokenKind::Super => self.super_expr(),
            _ => return false,
        }
        true
    }

    fn infix_rule(&mut self, kind: TokenKind, can_assign: bool) {
        match kind {
            TokenKind::Plus
            | TokenKind::Minus
            | TokenKind::Star
            | TokenKind::Slash
            | TokenKind::BangEqual
            | TokenKind::EqualEqual
            | TokenKind::Greater
            | TokenKind::GreaterEqual
            | TokenKind::Less
            | TokenKind::LessEqual => self.binary(),
            TokenKind::And => self.and_expr(),
            TokenKind::Or => self.or_expr(),
            TokenKind::LeftParen => self.call_expr(),
            TokenKind::Dot => self.dot_expr(can_assign),
            _ => {}
        }
    }

    fn grouping(&mut self) {
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after expression.");
    }

    fn unary(&mut self) {
        let op_kind = self.previous.kind;
        self.parse_precedence(Precedence::Unary);
        match op_kind {
            TokenKind::Minus => self.emit_op(OpCode::Negate),
            TokenKind::Bang => self.emit_op(OpCode::Not),
            _ => unreachable!("unary() only dispatched for '-' and '!'"),
        }
    }

    fn binary(&mut self) {
        let op_kind = self.previous.kind;
        self.parse_precedence(precedence_of(op_kind).next());
        match op_kind {
            TokenKind::Plus => self.emit_op(OpCode::Add),
            TokenKind::Minus => self.emit_op(OpCode::Subtract),
            TokenKind::Star => self.emit_op(OpCode::Multiply),
            TokenKind::Slash => self.emit_op(OpCode::Divide),
            TokenKind::BangEqual => {
                self.emit_op(OpCode::Equal);
                self.emit_op(OpCode::Not);
            }
            TokenKind::EqualEqual => self.emit_op(OpCode::Equal),
            TokenKind::Greater => self.emit_op(OpCode::Greater),
            TokenKind::GreaterEqual => {
                self.emit_op(OpCode::Less);
                self.emit_op(OpCode::Not);
            }
            TokenKind::Less => self.emit_op(OpCode::Less),
            TokenKind::LessEqual => {
                self.emit_op(OpCode::Greater);
                self.emit_op(OpCode::Not);
            }
            _ => unreachable!("binary() only dispatched for binary operators"),
        }
    }

    fn number(&mut self) {
        let value: f64 = self.previous.lexeme.parse().unwrap_or(0.0);
        self.emit_constant(Value::Number(value));
    }

    fn string(&mut self) {
        let lexeme = self.previous.lexeme;
        let content = &lexeme[1..lexeme.len() - 1];
        let obj = self.heap.intern(content);
        self.emit_constant(Value::Obj(obj));
    }

    fn literal(&mut self) {
        match self.previous.kind {
            TokenKind::False => self.emit_op(OpCode::False),
            TokenKind::True => self.emit_op(OpCode::True),
            TokenKind::Nil => self.emit_op(OpCode::Nil),
            _ => unreachable!("literal() only dispatched for false/true/nil"),
        }
    }

    fn variable(&mut self, can_assign: bool) {
        let name = self.previous;
        self.named_variable(name, can_assign);
    }

    fn this_expr(&mut self) {
        if self.classes.is_empty() {
            self.error("Can't use 'this' outside of a class.");
            return;
        }
        let line = self.line();
        self.named_variable(
            Token {
                kind: TokenKind::Identifier,
                lexeme: "this",
                line,
            },
            false,
        );
    }

    fn super_expr(&mut self) {
        let line = self.line();
        if self.classes.is_empty() {
            self.error("Can't use 'super' outside of a class.");
        } else if !self.classes.last().expect("checked non-empty above").has_superclass {
            self.error("Can't use 'super' in a class with no superclass.");
        }

        self.consume(TokenKind::Dot, "Expect '.' after 'super'.");
        self.consume(TokenKind::Identifier, "Expect superclass method name.");
        let method_lexeme = self.previous.lexeme;
        let name = self.identifier_constant(method_lexeme);

        let this_token = Token {
            kind: TokenKind::Identifier,
            lexeme: "this",
            line,
        };
        let super_token = Token {
            kind: TokenKind::Identifier,
            lexeme: "super",
            line,
        };

        if self.match_token(TokenKind::LeftParen) {
            self.named_variable(this_token, false);
            let argc = self.argument_list();
            self.named_variable(super_token, false);
            self.emit_two(OpCode::SuperInvoke, name);
            self.emit_byte(argc);
        } else {
            self.named_variable(this_token, false);
            self.named_variable(super_token, false);
            self.emit_two(OpCode::GetSuper, name);
        }
    }

    fn and_expr(&mut self) {
        let end_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    fn or_expr(&mut self) {
        let else_jump = self.emit_jump(OpCode::JumpIfFalse);
        let end_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(else_jump);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn call_expr(&mut self) {
        let argc = self.argument_list();
        self.emit_two(OpCode::Call, argc);
    }

    fn dot_expr(&mut self, can_assign: bool) {
        self.consume(TokenKind::Identifier, "Expect property name after '.'.");
        let name_lexeme = self.previous.lexeme;
        let name = self.identifier_constant(name_lexeme);

        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_two(OpCode::SetProperty, name);
        } else if self.match_token(TokenKind::LeftParen) {
            let argc = self.argument_list();
            self.emit_two(OpCode::Invoke, name);
            self.emit_byte(argc);
        } else {
            self.emit_two(OpCode::GetProperty, name);
        }
    }

    fn argument_list(&mut self) -> u8 {
        let mut argc: u32 = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression();
                if argc == 255 {
                    self.error("Can't have more than 255 arguments.");
                }
                argc += 1;
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after arguments.");
        argc.min(255) as u8
    }

    // -- statements -------------------------------------------------------

    fn declaration(&mut self) {
        if self.match_token(TokenKind::Class) {
            self.class_declaration();
        } else if self.match_token(TokenKind::Fun) {
            self.fun_declaration();
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.statement();
        }
        if self.panic_mode {
            self.synchronize();
        }
    }

    fn statement(&mut self) {
        if self.match_token(TokenKind::Print) {
            self.print_statement();
        } else if self.match_token(TokenKind::If) {
            self.if_statement();
        } else if self.match_token(TokenKind::While) {
            self.while_statement();
        } else if self.match_token(TokenKind::For) {
            self.for_statement();
        } else if self.match_token(TokenKind::Return) {
            self.return_statement();
        } else if self.match_token(TokenKind::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression_statement();
        }
    }

    fn block(&mut self) {
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.declaration();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after block.");
    }

    fn print_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after value.");
        self.emit_op(OpCode::Print);
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after expression.");
        self.emit_op(OpCode::Pop);
    }

    fn if_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "Expect '(' after 'if'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();

        let else_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(then_jump);
        self.emit_op(OpCode::Pop);

        if self.match_token(TokenKind::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let loop_start = self.current_chunk_mut().code.len();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'while'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        self.emit_op(OpCode::Pop);
    }

    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'for'.");

        if self.match_token(TokenKind::Semicolon) {
            // No initializer.
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.current_chunk_mut().code.len();
        let mut exit_jump = None;
        if !self.match_token(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after loop condition.");
            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
            self.emit_op(OpCode::Pop);
        }

        if !self.match_token(TokenKind::RightParen) {
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.current_chunk_mut().code.len();
            self.expression();
            self.emit_op(OpCode::Pop);
            self.consume(TokenKind::RightParen, "Expect ')' after for clauses.");

            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        self.statement();
        self.emit_loop(loop_start);

        if let Some(exit_jump) = exit_jump {
            self.patch_jump(exit_jump);
            self.emit_op(OpCode::Pop);
        }

        self.end_scope();
    }

    fn return_statement(&mut self) {
        if self.current_function_type() == FunctionType::Script {
            self.error("Can't return from top-level code.");
        }
        if self.match_token(TokenKind::Semicolon) {
            self.emit_return();
        } else {
            if self.current_function_type() == FunctionType::Initializer {
                self.error("Can't return a value from an initializer.");
            }
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after return value.");
            self.emit_op(OpCode::Return);
        }
    }

    fn var_declaration(&mut self) {
        let global = self.parse_variable("Expect variable name.");
        if self.match_token(TokenKind::Equal) {
            self.expression();
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.consume(TokenKind::Semicolon, "Expect ';' after variable declaration.");
        self.define_variable(global);
    }

    fn fun_declaration(&mut self) {
        let global = self.parse_variable("Expect function name.");
        self.mark_initialized();
        self.function(FunctionType::Function);
        self.define_variable(global);
    }

    fn function(&mut self, function_type: FunctionType) {
        let name_obj = self.heap.intern(self.previous.lexeme);
        self.scopes.push(FunctionScope::new(function_type, Some(name_obj)));
        self.begin_scope();

        self.consume(TokenKind::LeftParen, "Expect '(' after function name.");
        let mut arity: u32 = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                arity += 1;
                if arity > 255 {
                    self.error_at_current("Can't have more than 255 parameters.");
                }
                let constant = self.parse_variable("Expect parameter name.");
                self.define_variable(constant);
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after parameters.");
        {
            let scope_index = self.scopes.len() - 1;
            self.scopes[scope_index].function.arity = arity.min(255) as u8;
        }

        self.consume(TokenKind::LeftBrace, "Expect '{' before function body.");
        self.block();

        let (function_ref, upvalues) = self.end_function();
        self.emit_closure(function_ref, &upvalues);
    }

    fn end_function(&mut self) -> (ObjRef, Vec<UpvalueDescriptor>) {
        self.emit_return();
        let scope = self.scopes.pop().expect("function scope stack underflow");
        let mut function = scope.function;
        function.upvalue_count = scope.upvalues.len();
        let function_ref = self.heap.alloc_function(function);
        (function_ref, scope.upvalues)
    }

    fn emit_closure(&mut self, function_ref: ObjRef, upvalues: &[UpvalueDescriptor]) {
        let idx = self.current_chunk_mut().add_constant(Value::Obj(function_ref));
        let idx = match idx {
            Some(i) => i,
            None => {
                self.error("Too many constants in one chunk.");
                0
            }
        };
        self.emit_two(OpCode::Closure, idx);
        for up in upvalues {
            self.emit_byte(u8::from(up.is_local));
            self.emit_byte(up.index);
        }
    }

    fn class_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "Expect class name.");
        let class_name = self.previous;
        let name_constant = self.identifier_constant(class_name.lexeme);
        self.declare_variable();
        self.emit_two(OpCode::Class, name_constant);
        self.define_variable(name_constant);

        self.classes.push(ClassScope { has_superclass: false });

        if self.match_token(TokenKind::Less) {
            self.consume(TokenKind::Identifier, "Expect superclass name.");
            self.variable(false);
            if class_name.lexeme == self.previous.lexeme {
                self.error("A class can't inherit from itself.");
            }

            self.begin_scope();
            self.add_local("super");
            self.define_variable(0);

            self.named_variable(class_name, false);
            self.emit_op(OpCode::Inherit);
            self.classes.last_mut().expect("just pushed").has_superclass = true;
        }

        self.named_variable(class_name, false);
        self.consume(TokenKind::LeftBrace, "Expect '{' before class body.");
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.method();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after class body.");
        self.emit_op(OpCode::Pop);

        if self.classes.last().expect("just pushed").has_superclass {
            self.end_scope();
        }
        self.classes.pop();
    }

    fn method(&mut self) {
        self.consume(TokenKind::Identifier, "Expect method name.");
        let name_lexeme = self.previous.lexeme;
        let constant = self.identifier_constant(name_lexeme);
        let function_type = if name_lexeme == "init" {
            FunctionType::Initializer
        } else {
            FunctionType::Method
        };
        self.function(function_type);
        self.emit_two(OpCode::Method, constant);
    }
}

/// Compile `source` into a top-level script function.
///
/// # Errors
///
/// Returns every independent diagnostic collected during parsing (the
/// compiler resynchronizes at statement boundaries rather than
/// stopping at the first error). No bytecode from a failed compile is
/// ever handed to the VM.
pub fn compile(source: &str, heap: &mut Heap) -> Result<ObjRef, Vec<CompileError>> {
    let mut parser = Parser::new(source, heap);
    parser.advance();
    while !parser.check(TokenKind::Eof) {
        parser.declaration();
    }
    let (function_ref, _upvalues) = parser.end_function();
    if parser.had_error {
        Err(parser.errors)
    } else {
        Ok(function_ref)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::ObjKind;

    fn compile_ok(source: &str) -> ObjRef {
        let mut heap = Heap::new();
        compile(source, &mut heap).unwrap_or_else(|errs| {
            panic!("expected successful compile, got: {errs:?}");
        })
    }

    fn compile_err(source: &str) -> Vec<CompileError> {
        let mut heap = Heap::new();
        match compile(source, &mut heap) {
            Ok(_) => panic!("expected a compile error"),
            Err(errs) => errs,
        }
    }

    #[test]
    fn compiles_arithmetic_and_print() {
        let f = compile_ok("print 1 + 2 * 3;");
        let ObjKind::Function(func) = &f.get().kind else {
            panic!("expected function");
        };
        assert!(func.chunk.code.contains(&(OpCode::Print as u8)));
    }

    #[test]
    fn reports_missing_semicolon() {
        let errs = compile_err("var x = 1");
        assert!(errs[0].to_string().contains("Expect ';'"));
    }

    #[test]
    fn reports_invalid_assignment_target() {
        let errs = compile_err("1 = 2;");
        assert!(errs.iter().any(|e| e.message == "Invalid assignment target."));
    }

    #[test]
    fn reports_return_from_top_level() {
        let errs = compile_err("return 1;");
        assert!(errs.iter().any(|e| e.message == "Can't return from top-level code."));
    }

    #[test]
    fn reports_this_outside_class() {
        let errs = compile_err("print this;");
        assert!(errs.iter().any(|e| e.message == "Can't use 'this' outside of a class."));
    }

    #[test]
    fn reports_self_inheritance() {
        let errs = compile_err("class A < A {}");
        assert!(errs.iter().any(|e| e.message == "A class can't inherit from itself."));
    }

    #[test]
    fn compiles_class_with_methods_and_inheritance() {
        compile_ok(
            "class Base { m() { print \"B\"; } }\n\
             class Derived < Base { m() { print \"D\"; super.m(); } }\n\
             Derived().m();",
        );
    }

    #[test]
    fn compiles_closures_over_locals() {
        compile_ok(
            "fun make(x) { fun inner() { return x; } return inner; }\n\
             var f = make(42); print f();",
        );
    }

    #[test]
    fn accumulates_multiple_independent_errors() {
        let errs = compile_err("var x = ;\nvar y = ;");
        assert!(errs.len() >= 2);
    }
}
