use crate::chunk::{Chunk, Opcode};
use crate::object::{Function, Object, INIT_NAME};
use crate::scanner::{ScanError, Scanner, Token, TokenKind};
use crate::value::Value;
use arrayvec::ArrayVec;
use log::{debug, trace};
use std::fmt::{Display, Formatter};
use std::mem;
use std::rc::Rc;
use thiserror::Error;

type CompileResult<A> = Result<A, CompileErrors>;

const MAX_LOCALS: usize = 256;
const MAX_UPVALUES: usize = 256;
const MAX_PARAMETERS: usize = 255;
const MAX_ARGUMENTS: usize = 255;

#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, PartialOrd, Ord, Eq)]
enum BindingPower {
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

impl BindingPower {
    fn next(&self) -> Self {
        use BindingPower::*;
        match self {
            None => Assignment,
            Assignment => Or,
            Or => And,
            And => Equality,
            Equality => Comparison,
            Comparison => Term,
            Term => Factor,
            Factor => Unary,
            Unary => Call,
            Call => Primary,
            Primary => Primary,
        }
    }
}

/// Compiles a whole script into its top-level function.
///
/// Every error in the source is collected; bytecode from a failed compile is dropped.
pub fn compile(source: &str) -> CompileResult<Function> {
    let mut compiler = Compiler::new(Scanner::new(source));
    compiler.advance();
    while !compiler.matches(TokenKind::Eof) {
        compiler.declaration();
    }
    compiler.finish()
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum FunctionKind {
    Script,
    Function,
    Method,
    Initializer,
}

#[derive(Debug)]
struct Local<'a> {
    name: &'a str,
    // None until the initializer has been compiled.
    depth: Option<usize>,
    is_captured: bool,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
struct UpvalueDescriptor {
    index: u8,
    is_local: bool,
}

/// Compile-time state of one function body.
#[derive(Debug)]
struct FunctionCompiler<'a> {
    function: Function,
    kind: FunctionKind,
    locals: ArrayVec<Local<'a>, MAX_LOCALS>,
    upvalues: ArrayVec<UpvalueDescriptor, MAX_UPVALUES>,
    scope_depth: usize,
}

impl<'a> FunctionCompiler<'a> {
    fn new(kind: FunctionKind, name: &str) -> Self {
        let mut locals = ArrayVec::new();
        // Slot zero holds the callee, or the receiver inside methods.
        locals.push(Local {
            name: match kind {
                FunctionKind::Method | FunctionKind::Initializer => "this",
                FunctionKind::Function | FunctionKind::Script => "",
            },
            depth: Some(0),
            is_captured: false,
        });
        Self {
            function: Function::new(name),
            kind,
            locals,
            upvalues: ArrayVec::new(),
            scope_depth: 0,
        }
    }

    /// Finds the innermost initialized local called `name`.
    fn resolve_local(&self, name: &str) -> Option<u8> {
        self.locals
            .iter()
            .rposition(|local| local.name == name && local.depth.is_some())
            .and_then(|idx| u8::try_from(idx).ok())
    }

    fn has_uninitialized(&self, name: &str) -> bool {
        self.locals
            .iter()
            .any(|local| local.name == name && local.depth.is_none())
    }

    fn add_local(&mut self, name: &'a str) -> Result<(), ParseError> {
        self.locals
            .try_push(Local {
                name,
                depth: None,
                is_captured: false,
            })
            .map_err(|_| ParseError::TooManyLocals)
    }

    fn add_upvalue(&mut self, index: u8, is_local: bool) -> Result<u8, ParseError> {
        let upvalue = UpvalueDescriptor { index, is_local };
        if let Some(existing) = self.upvalues.iter().position(|u| *u == upvalue) {
            return u8::try_from(existing).map_err(|_| ParseError::TooManyUpvalues);
        }
        self.upvalues
            .try_push(upvalue)
            .map_err(|_| ParseError::TooManyUpvalues)?;
        u8::try_from(self.upvalues.len() - 1).map_err(|_| ParseError::TooManyUpvalues)
    }
}

/// Resolves `name` as an upvalue of `compiler`, walking outwards through `enclosing`
/// (innermost last) and marking the captured local on the way.
fn resolve_upvalue(
    enclosing: &mut [FunctionCompiler<'_>],
    compiler: &mut FunctionCompiler<'_>,
    name: &str,
) -> Result<Option<u8>, ParseError> {
    let Some((parent, rest)) = enclosing.split_last_mut() else {
        return Ok(None);
    };
    if let Some(local) = parent.resolve_local(name) {
        parent.locals[local as usize].is_captured = true;
        return compiler.add_upvalue(local, true).map(Some);
    }
    if let Some(upvalue) = resolve_upvalue(rest, parent, name)? {
        return compiler.add_upvalue(upvalue, false).map(Some);
    }
    Ok(None)
}

#[derive(Debug, Default)]
struct ClassCompiler {
    has_superclass: bool,
}

/// Token window and error-recovery state.
struct Parser<'a> {
    current: Token<'a>,
    previous: Token<'a>,
    had_error: bool,
    panic_mode: bool,
    errors: CompileErrors,
}

type ParseFn<'a> = fn(&mut Compiler<'a>, bool);

struct ParseRule<'a> {
    prefix: Option<ParseFn<'a>>,
    infix: Option<ParseFn<'a>>,
    binding_power: BindingPower,
}

impl<'a> ParseRule<'a> {
    fn new(
        prefix: Option<ParseFn<'a>>,
        infix: Option<ParseFn<'a>>,
        binding_power: BindingPower,
    ) -> Self {
        Self {
            prefix,
            infix,
            binding_power,
        }
    }
}

struct Compiler<'a> {
    scanner: Scanner<'a>,
    parser: Parser<'a>,
    current: FunctionCompiler<'a>,
    enclosing: Vec<FunctionCompiler<'a>>,
    classes: Vec<ClassCompiler>,
    // Name of the global whose initializer is being compiled.
    initializing_global: Option<&'a str>,
}

impl<'a> Compiler<'a> {
    fn new(scanner: Scanner<'a>) -> Self {
        let placeholder = Token::new(TokenKind::Eof, "", 1);
        Self {
            scanner,
            parser: Parser {
                current: placeholder,
                previous: placeholder,
                had_error: false,
                panic_mode: false,
                errors: CompileErrors::new(),
            },
            current: FunctionCompiler::new(FunctionKind::Script, ""),
            enclosing: Vec::new(),
            classes: Vec::new(),
            initializing_global: None,
        }
    }

    fn finish(mut self) -> CompileResult<Function> {
        self.emit_return();
        let Compiler {
            parser, current, ..
        } = self;
        if parser.had_error {
            debug!("Compilation failed with {} error(s)", parser.errors.len());
            Err(parser.errors)
        } else {
            trace!("{}", current.function.chunk.disassemble("<script>"));
            Ok(current.function)
        }
    }

    // Token handling

    fn advance(&mut self) {
        self.parser.previous = self.parser.current;
        loop {
            self.parser.current = self.scanner.scan_token();
            match self.parser.current.kind {
                TokenKind::Error(e) => {
                    let line = self.parser.current.line;
                    self.report(CompileError::Scan { line, error: e });
                }
                _ => break,
            }
        }
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.parser.current.kind == kind
    }

    fn matches(&mut self, kind: TokenKind) -> bool {
        if !self.check(kind) {
            return false;
        }
        self.advance();
        true
    }

    fn consume(&mut self, kind: TokenKind, message: &'static str) {
        if self.check(kind) {
            self.advance();
        } else {
            self.error_at_current(ParseError::Expect(message));
        }
    }

    // Error reporting

    fn error(&mut self, error: ParseError) {
        self.error_at(self.parser.previous, error)
    }

    fn error_at_current(&mut self, error: ParseError) {
        self.error_at(self.parser.current, error)
    }

    fn error_at(&mut self, token: Token<'a>, error: ParseError) {
        let location = match token.kind {
            TokenKind::Eof => "end".to_string(),
            _ => format!("'{}'", token.lexeme),
        };
        self.report(CompileError::Parse {
            line: token.line,
            location,
            error,
        });
    }

    fn report(&mut self, error: CompileError) {
        if self.parser.panic_mode {
            return;
        }
        self.parser.panic_mode = true;
        self.parser.had_error = true;
        debug!("{error}");
        self.parser.errors.push(error);
    }

    fn synchronize(&mut self) {
        self.parser.panic_mode = false;
        while !self.check(TokenKind::Eof) {
            if self.parser.previous.kind == TokenKind::Semicolon {
                return;
            }
            match self.parser.current.kind {
                TokenKind::Class
                | TokenKind::Fun
                | TokenKind::Var
                | TokenKind::For
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Print
                | TokenKind::Assert
                | TokenKind::Return => return,
                _ => self.advance(),
            }
        }
    }

    // Emitting bytecode

    fn chunk(&mut self) -> &mut Chunk {
        &mut self.current.function.chunk
    }

    fn emit_byte(&mut self, byte: u8) {
        let line = self.parser.previous.line;
        self.chunk().write(byte, line);
    }

    fn emit_opcode(&mut self, opcode: Opcode) {
        let line = self.parser.previous.line;
        self.chunk().add_opcode(opcode, line);
    }

    fn emit_opcodes(&mut self, first: Opcode, second: Opcode) {
        self.emit_opcode(first);
        self.emit_opcode(second);
    }

    fn emit_opcode_and_operand(&mut self, opcode: Opcode, operand: u8) {
        let line = self.parser.previous.line;
        self.chunk().add_opcode_and_operand(opcode, operand, line);
    }

    fn emit_return(&mut self) {
        if self.current.kind == FunctionKind::Initializer {
            self.emit_opcode_and_operand(Opcode::GetLocal, 0);
        } else {
            self.emit_opcode(Opcode::Nil);
        }
        self.emit_opcode(Opcode::Return);
    }

    fn emit_jump(&mut self, opcode: Opcode) -> usize {
        let line = self.parser.previous.line;
        self.chunk().add_dummy_jump(opcode, line)
    }

    fn patch_jump(&mut self, offset: usize) {
        if !self.chunk().patch_jump(offset) {
            self.error(ParseError::JumpTooLarge);
        }
    }

    fn emit_loop(&mut self, loop_start: usize) {
        let line = self.parser.previous.line;
        if !self.chunk().emit_loop(loop_start, line) {
            self.error(ParseError::LoopTooLarge);
        }
    }

    fn make_constant(&mut self, value: Value) -> u8 {
        match self.chunk().add_constant(value) {
            Some(idx) => idx,
            None => {
                self.error(ParseError::TooManyConstants);
                0
            }
        }
    }

    fn emit_constant(&mut self, value: Value) {
        let constant = self.make_constant(value);
        self.emit_opcode_and_operand(Opcode::Constant, constant);
    }

    fn identifier_constant(&mut self, name: &str) -> u8 {
        self.make_constant(Value::string(name))
    }

    // Scopes and variables

    fn begin_scope(&mut self) {
        self.current.scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.current.scope_depth -= 1;
        while let Some(local) = self.current.locals.last() {
            if local
                .depth
                .is_some_and(|depth| depth <= self.current.scope_depth)
            {
                break;
            }
            let opcode = if local.is_captured {
                Opcode::CloseUpvalue
            } else {
                Opcode::Pop
            };
            self.emit_opcode(opcode);
            self.current.locals.pop();
        }
    }

    fn parse_variable(&mut self, message: &'static str) -> u8 {
        self.consume(TokenKind::Identifier, message);
        self.declare_variable();
        if self.current.scope_depth > 0 {
            return 0;
        }
        let name = self.parser.previous.lexeme;
        self.identifier_constant(name)
    }

    fn declare_variable(&mut self) {
        if self.current.scope_depth == 0 {
            return;
        }
        let name = self.parser.previous.lexeme;
        let depth = self.current.scope_depth;
        let duplicate = self
            .current
            .locals
            .iter()
            .rev()
            .take_while(|local| local.depth.map_or(true, |d| d >= depth))
            .any(|local| local.name == name);
        if duplicate {
            self.error(ParseError::DuplicateLocal);
        }
        self.add_local(name);
    }

    fn add_local(&mut self, name: &'a str) {
        if let Err(e) = self.current.add_local(name) {
            self.error(e);
        }
    }

    fn mark_initialized(&mut self) {
        let depth = self.current.scope_depth;
        if depth == 0 {
            return;
        }
        if let Some(local) = self.current.locals.last_mut() {
            local.depth = Some(depth);
        }
    }

    fn define_variable(&mut self, global: u8) {
        if self.current.scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_opcode_and_operand(Opcode::DefineGlobal, global);
    }

    fn named_variable(&mut self, name: &'a str, can_assign: bool) {
        let (get_op, set_op, arg) = if let Some(slot) = self.current.resolve_local(name) {
            (Opcode::GetLocal, Opcode::SetLocal, slot)
        } else {
            match resolve_upvalue(&mut self.enclosing, &mut self.current, name) {
                Ok(Some(idx)) => (Opcode::GetUpvalue, Opcode::SetUpvalue, idx),
                Ok(None) => {
                    if self.current.has_uninitialized(name)
                        || self.initializing_global == Some(name)
                    {
                        self.error(ParseError::OwnInitializer);
                    }
                    let idx = self.identifier_constant(name);
                    (Opcode::GetGlobal, Opcode::SetGlobal, idx)
                }
                Err(e) => {
                    self.error(e);
                    (Opcode::GetUpvalue, Opcode::SetUpvalue, 0)
                }
            }
        };

        if can_assign && self.matches(TokenKind::Equal) {
            self.expression();
            self.emit_opcode_and_operand(set_op, arg);
        } else {
            self.emit_opcode_and_operand(get_op, arg);
        }
    }

    // Declarations

    fn declaration(&mut self) {
        if self.matches(TokenKind::Class) {
            self.class_declaration();
        } else if self.matches(TokenKind::Fun) {
            self.fun_declaration();
        } else if self.matches(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.statement();
        }

        if self.parser.panic_mode {
            self.synchronize();
        }
    }

    fn class_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "Expect class name.");
        let class_name = self.parser.previous;
        let name_constant = self.identifier_constant(class_name.lexeme);
        self.declare_variable();

        self.emit_opcode_and_operand(Opcode::Class, name_constant);
        self.define_variable(name_constant);

        self.classes.push(ClassCompiler::default());

        if self.matches(TokenKind::Less) {
            self.consume(TokenKind::Identifier, "Expect superclass name.");
            self.variable(false);

            if class_name.lexeme == self.parser.previous.lexeme {
                self.error(ParseError::InheritFromSelf);
            }

            self.begin_scope();
            self.add_local("super");
            self.define_variable(0);

            self.named_variable(class_name.lexeme, false);
            self.emit_opcode(Opcode::Inherit);
            if let Some(class) = self.classes.last_mut() {
                class.has_superclass = true;
            }
        }

        self.named_variable(class_name.lexeme, false);
        self.consume(TokenKind::LeftBrace, "Expect '{' before class body.");
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.method();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after class body.");
        self.emit_opcode(Opcode::Pop);

        if self.classes.pop().is_some_and(|class| class.has_superclass) {
            self.end_scope();
        }
    }

    fn method(&mut self) {
        self.consume(TokenKind::Identifier, "Expect method name.");
        let name = self.parser.previous.lexeme;
        let constant = self.identifier_constant(name);
        let kind = if name == INIT_NAME {
            FunctionKind::Initializer
        } else {
            FunctionKind::Method
        };
        self.function(kind);
        self.emit_opcode_and_operand(Opcode::Method, constant);
    }

    fn fun_declaration(&mut self) {
        let global = self.parse_variable("Expect function name.");
        self.mark_initialized();
        self.function(FunctionKind::Function);
        self.define_variable(global);
    }

    fn function(&mut self, kind: FunctionKind) {
        let name = self.parser.previous.lexeme;
        let enclosing = mem::replace(&mut self.current, FunctionCompiler::new(kind, name));
        self.enclosing.push(enclosing);
        self.begin_scope();

        self.consume(TokenKind::LeftParen, "Expect '(' after function name.");
        if !self.check(TokenKind::RightParen) {
            loop {
                self.current.function.arity += 1;
                if self.current.function.arity > MAX_PARAMETERS {
                    self.error_at_current(ParseError::TooManyParameters);
                }
                let constant = self.parse_variable("Expect parameter name.");
                self.define_variable(constant);
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after parameters.");
        self.consume(TokenKind::LeftBrace, "Expect '{' before function body.");
        self.block();

        let FunctionCompiler {
            mut function,
            upvalues,
            ..
        } = self.end_function();
        function.upvalue_count = upvalues.len();
        let constant = self.make_constant(Value::Obj(Object::Function(Rc::new(function))));
        self.emit_opcode_and_operand(Opcode::Closure, constant);
        for upvalue in upvalues {
            self.emit_byte(u8::from(upvalue.is_local));
            self.emit_byte(upvalue.index);
        }
    }

    /// Closes the innermost function body and makes its enclosing function current again.
    fn end_function(&mut self) -> FunctionCompiler<'a> {
        self.emit_return();
        let Some(enclosing) = self.enclosing.pop() else {
            unreachable!("function bodies are always nested inside the script")
        };
        let finished = mem::replace(&mut self.current, enclosing);
        if !self.parser.had_error {
            trace!(
                "{}",
                finished
                    .function
                    .chunk
                    .disassemble(finished.function.display_name())
            );
        }
        finished
    }

    fn var_declaration(&mut self) {
        let global = self.parse_variable("Expect variable name.");
        let is_global = self.current.scope_depth == 0;
        if is_global {
            self.initializing_global = Some(self.parser.previous.lexeme);
        }

        if self.matches(TokenKind::Equal) {
            self.expression();
        } else {
            self.emit_opcode(Opcode::Nil);
        }
        self.initializing_global = None;

        self.consume(
            TokenKind::Semicolon,
            "Expect ';' after variable declaration.",
        );
        self.define_variable(global);
    }

    // Statements

    fn statement(&mut self) {
        if self.matches(TokenKind::Print) {
            self.print_statement();
        } else if self.matches(TokenKind::Assert) {
            self.assert_statement();
        } else if self.matches(TokenKind::If) {
            self.if_statement();
        } else if self.matches(TokenKind::Return) {
            self.return_statement();
        } else if self.matches(TokenKind::While) {
            self.while_statement();
        } else if self.matches(TokenKind::For) {
            self.for_statement();
        } else if self.matches(TokenKind::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression_statement();
        }
    }

    fn print_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after value.");
        self.emit_opcode(Opcode::Print);
    }

    fn assert_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after assertion.");
        self.emit_opcode(Opcode::Assert);
    }

    fn block(&mut self) {
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.declaration();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after block.");
    }

    fn if_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "Expect '(' after 'if'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let then_jump = self.emit_jump(Opcode::JumpIfFalse);
        self.emit_opcode(Opcode::Pop);
        self.statement();
        let else_jump = self.emit_jump(Opcode::Jump);
        self.patch_jump(then_jump);
        self.emit_opcode(Opcode::Pop);

        if self.matches(TokenKind::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn return_statement(&mut self) {
        if self.current.kind == FunctionKind::Script {
            self.error(ParseError::TopLevelReturn);
        }

        if self.matches(TokenKind::Semicolon) {
            self.emit_return();
        } else {
            if self.current.kind == FunctionKind::Initializer {
                self.error(ParseError::InitializerReturn);
            }
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after return value.");
            self.emit_opcode(Opcode::Return);
        }
    }

    fn while_statement(&mut self) {
        let loop_start = self.chunk().len();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'while'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let exit_jump = self.emit_jump(Opcode::JumpIfFalse);
        self.emit_opcode(Opcode::Pop);
        self.statement();
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        self.emit_opcode(Opcode::Pop);
    }

    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'for'.");
        if self.matches(TokenKind::Semicolon) {
            // No initializer.
        } else if self.matches(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.chunk().len();
        let mut exit_jump = None;
        if !self.matches(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after loop condition.");
            exit_jump = Some(self.emit_jump(Opcode::JumpIfFalse));
            self.emit_opcode(Opcode::Pop);
        }

        if !self.matches(TokenKind::RightParen) {
            let body_jump = self.emit_jump(Opcode::Jump);
            let increment_start = self.chunk().len();
            self.expression();
            self.emit_opcode(Opcode::Pop);
            self.consume(TokenKind::RightParen, "Expect ')' after for clauses.");

            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        self.statement();
        self.emit_loop(loop_start);

        if let Some(exit_jump) = exit_jump {
            self.patch_jump(exit_jump);
            self.emit_opcode(Opcode::Pop);
        }
        self.end_scope();
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after expression.");
        self.emit_opcode(Opcode::Pop);
    }

    // Expressions

    fn expression(&mut self) {
        self.parse_precedence(BindingPower::Assignment);
    }

    fn parse_precedence(&mut self, min_bp: BindingPower) {
        self.advance();
        let Some(prefix_rule) = Self::rule(self.parser.previous.kind).prefix else {
            self.error(ParseError::ExpectExpression);
            return;
        };
        let can_assign = min_bp <= BindingPower::Assignment;
        prefix_rule(self, can_assign);

        while min_bp <= Self::rule(self.parser.current.kind).binding_power {
            self.advance();
            if let Some(infix_rule) = Self::rule(self.parser.previous.kind).infix {
                infix_rule(self, can_assign);
            }
        }

        if can_assign && self.matches(TokenKind::Equal) {
            self.error(ParseError::InvalidAssignmentTarget);
        }
    }

    fn rule(kind: TokenKind) -> ParseRule<'a> {
        use BindingPower as Bp;
        use TokenKind::*;
        match kind {
            LeftParen => ParseRule::new(Some(Self::grouping), Some(Self::call), Bp::Call),
            Dot => ParseRule::new(None, Some(Self::dot), Bp::Call),
            Minus => ParseRule::new(Some(Self::unary), Some(Self::binary), Bp::Term),
            Plus => ParseRule::new(None, Some(Self::binary), Bp::Term),
            Slash | Asterisk => ParseRule::new(None, Some(Self::binary), Bp::Factor),
            Bang => ParseRule::new(Some(Self::unary), None, Bp::None),
            BangEqual | EqualEqual => ParseRule::new(None, Some(Self::binary), Bp::Equality),
            Greater | GreaterEqual | Less | LessEqual => {
                ParseRule::new(None, Some(Self::binary), Bp::Comparison)
            }
            Identifier => ParseRule::new(Some(Self::variable), None, Bp::None),
            String => ParseRule::new(Some(Self::string), None, Bp::None),
            Number => ParseRule::new(Some(Self::number), None, Bp::None),
            And => ParseRule::new(None, Some(Self::and), Bp::And),
            Or => ParseRule::new(None, Some(Self::or), Bp::Or),
            False | True | Nil => ParseRule::new(Some(Self::literal), None, Bp::None),
            Super => ParseRule::new(Some(Self::super_), None, Bp::None),
            This => ParseRule::new(Some(Self::this), None, Bp::None),
            _ => ParseRule::new(None, None, Bp::None),
        }
    }

    fn grouping(&mut self, _can_assign: bool) {
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after expression.");
    }

    fn call(&mut self, _can_assign: bool) {
        let arg_count = self.argument_list();
        self.emit_opcode_and_operand(Opcode::Call, arg_count);
    }

    fn argument_list(&mut self) -> u8 {
        let mut arg_count: usize = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression();
                if arg_count == MAX_ARGUMENTS {
                    self.error(ParseError::TooManyArguments);
                }
                arg_count += 1;
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after arguments.");
        u8::try_from(arg_count).unwrap_or(u8::MAX)
    }

    fn dot(&mut self, can_assign: bool) {
        self.consume(TokenKind::Identifier, "Expect property name after '.'.");
        let name = self.identifier_constant(self.parser.previous.lexeme);

        if can_assign && self.matches(TokenKind::Equal) {
            self.expression();
            self.emit_opcode_and_operand(Opcode::SetProperty, name);
        } else if self.matches(TokenKind::LeftParen) {
            let arg_count = self.argument_list();
            self.emit_opcode_and_operand(Opcode::Invoke, name);
            self.emit_byte(arg_count);
        } else {
            self.emit_opcode_and_operand(Opcode::GetProperty, name);
        }
    }

    fn unary(&mut self, _can_assign: bool) {
        let operator = self.parser.previous.kind;
        self.parse_precedence(BindingPower::Unary);
        match operator {
            TokenKind::Minus => self.emit_opcode(Opcode::Negate),
            TokenKind::Bang => self.emit_opcode(Opcode::Not),
            _ => unreachable!("Unexpected unary token, got {operator:?}"),
        }
    }

    fn binary(&mut self, _can_assign: bool) {
        let operator = self.parser.previous.kind;
        let binding_power = Self::rule(operator).binding_power;
        self.parse_precedence(binding_power.next());
        match operator {
            TokenKind::Plus => self.emit_opcode(Opcode::Add),
            TokenKind::Minus => self.emit_opcode(Opcode::Subtract),
            TokenKind::Asterisk => self.emit_opcode(Opcode::Multiply),
            TokenKind::Slash => self.emit_opcode(Opcode::Divide),
            TokenKind::EqualEqual => self.emit_opcode(Opcode::Equal),
            TokenKind::BangEqual => self.emit_opcodes(Opcode::Equal, Opcode::Not),
            TokenKind::Greater => self.emit_opcode(Opcode::Greater),
            TokenKind::GreaterEqual => self.emit_opcodes(Opcode::Less, Opcode::Not),
            TokenKind::Less => self.emit_opcode(Opcode::Less),
            TokenKind::LessEqual => self.emit_opcodes(Opcode::Greater, Opcode::Not),
            _ => unreachable!("Unexpected binary token, got {operator:?}"),
        }
    }

    fn number(&mut self, _can_assign: bool) {
        match self.parser.previous.lexeme.parse::<f64>() {
            Ok(number) => self.emit_constant(Value::Number(number)),
            Err(_) => self.error(ParseError::InvalidNumber),
        }
    }

    fn string(&mut self, _can_assign: bool) {
        let lexeme = self.parser.previous.lexeme;
        // Strip the surrounding quotes.
        let contents = lexeme
            .strip_prefix('"')
            .and_then(|s| s.strip_suffix('"'))
            .unwrap_or(lexeme);
        self.emit_constant(Value::string(contents));
    }

    fn literal(&mut self, _can_assign: bool) {
        match self.parser.previous.kind {
            TokenKind::True => self.emit_opcode(Opcode::True),
            TokenKind::False => self.emit_opcode(Opcode::False),
            TokenKind::Nil => self.emit_opcode(Opcode::Nil),
            kind => unreachable!("Unexpected literal token, got {kind:?}"),
        }
    }

    fn variable(&mut self, can_assign: bool) {
        self.named_variable(self.parser.previous.lexeme, can_assign);
    }

    fn this(&mut self, _can_assign: bool) {
        if self.classes.is_empty() {
            self.error(ParseError::ThisOutsideClass);
            return;
        }
        self.variable(false);
    }

    fn super_(&mut self, _can_assign: bool) {
        match self.classes.last() {
            None => self.error(ParseError::SuperOutsideClass),
            Some(class) if !class.has_superclass => {
                self.error(ParseError::SuperWithoutSuperclass)
            }
            Some(_) => {}
        }

        self.consume(TokenKind::Dot, "Expect '.' after 'super'.");
        self.consume(TokenKind::Identifier, "Expect superclass method name.");
        let name = self.identifier_constant(self.parser.previous.lexeme);

        self.named_variable("this", false);
        if self.matches(TokenKind::LeftParen) {
            let arg_count = self.argument_list();
            self.named_variable("super", false);
            self.emit_opcode_and_operand(Opcode::SuperInvoke, name);
            self.emit_byte(arg_count);
        } else {
            self.named_variable("super", false);
            self.emit_opcode_and_operand(Opcode::GetSuper, name);
        }
    }

    fn and(&mut self, _can_assign: bool) {
        let end_jump = self.emit_jump(Opcode::JumpIfFalse);
        self.emit_opcode(Opcode::Pop);
        self.parse_precedence(BindingPower::And);
        self.patch_jump(end_jump);
    }

    fn or(&mut self, _can_assign: bool) {
        let else_jump = self.emit_jump(Opcode::JumpIfFalse);
        let end_jump = self.emit_jump(Opcode::Jump);
        self.patch_jump(else_jump);
        self.emit_opcode(Opcode::Pop);
        self.parse_precedence(BindingPower::Or);
        self.patch_jump(end_jump);
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub struct CompileErrors {
    errors: Vec<CompileError>,
}

impl Display for CompileErrors {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "{} compilation error{}",
            self.errors.len(),
            if self.errors.len() == 1 { "" } else { "s" }
        )?;
        for e in self.errors.iter() {
            writeln!(f, "{e}")?;
        }
        Ok(())
    }
}

impl CompileErrors {
    pub fn new() -> Self {
        Self {
            errors: Vec::with_capacity(4),
        }
    }

    fn push(&mut self, e: CompileError) {
        self.errors.push(e)
    }

    pub fn errors(&self) -> &[CompileError] {
        &self.errors
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }
}

impl Default for CompileErrors {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CompileError {
    #[error("[line {line}] Error: {error}")]
    Scan { line: usize, error: ScanError },
    #[error("[line {line}] Error at {location}: {error}")]
    Parse {
        line: usize,
        location: String,
        error: ParseError,
    },
}

impl CompileError {
    pub fn line(&self) -> usize {
        match self {
            CompileError::Scan { line, .. } | CompileError::Parse { line, .. } => *line,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("{0}")]
    Expect(&'static str),
    #[error("Expect expression.")]
    ExpectExpression,
    #[error("Invalid assignment target.")]
    InvalidAssignmentTarget,
    #[error("Invalid number literal.")]
    InvalidNumber,
    #[error("Can't read local variable in its own initializer.")]
    OwnInitializer,
    #[error("Already a variable with this name in this scope.")]
    DuplicateLocal,
    #[error("Too many local variables in function.")]
    TooManyLocals,
    #[error("Too many closure variables in function.")]
    TooManyUpvalues,
    #[error("Too many constants in one chunk.")]
    TooManyConstants,
    #[error("Can't have more than 255 parameters.")]
    TooManyParameters,
    #[error("Can't have more than 255 arguments.")]
    TooManyArguments,
    #[error("Too much code to jump over.")]
    JumpTooLarge,
    #[error("Loop body is too large.")]
    LoopTooLarge,
    #[error("Can't return from top-level code.")]
    TopLevelReturn,
    #[error("Can't return a value from an initializer.")]
    InitializerReturn,
    #[error("Can't use 'this' outside of a class.")]
    ThisOutsideClass,
    #[error("Can't use 'super' outside of a class.")]
    SuperOutsideClass,
    #[error("Can't use 'super' in a class with no superclass.")]
    SuperWithoutSuperclass,
    #[error("A class can't inherit from itself.")]
    InheritFromSelf,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::MAX_CONSTANTS;

    fn compile_errors(source: &str) -> Vec<CompileError> {
        match compile(source) {
            Ok(_) => panic!("expected compile errors for {source:?}"),
            Err(e) => e.errors().to_vec(),
        }
    }

    fn single_error(source: &str) -> ParseError {
        let errors = compile_errors(source);
        assert_eq!(errors.len(), 1, "{errors:?}");
        match &errors[0] {
            CompileError::Parse { error, .. } => error.clone(),
            e => panic!("unexpected error {e:?}"),
        }
    }

    fn opcodes(chunk: &Chunk) -> Vec<Opcode> {
        let mut offset = 0;
        let mut result = Vec::new();
        while offset < chunk.len() {
            result.push(Opcode::try_from(chunk[offset]).unwrap());
            offset += chunk.instruction_len(offset);
        }
        result
    }

    #[test]
    fn precedence_shapes_bytecode() {
        let function = compile("print 1 + 2 * 3;").unwrap();
        use Opcode::*;
        assert_eq!(
            opcodes(&function.chunk),
            [Constant, Constant, Constant, Multiply, Add, Print, Nil, Return]
        );
    }

    #[test]
    fn comparisons_desugar() {
        let function = compile("1 <= 2;").unwrap();
        use Opcode::*;
        assert_eq!(
            opcodes(&function.chunk),
            [Constant, Constant, Greater, Not, Pop, Nil, Return]
        );
    }

    #[test]
    fn closures_serialize_upvalues() {
        let source = "fun outer() { var x = 1; fun inner() { return x; } return inner; }";
        let script = compile(source).unwrap();
        let outer = find_function(&script, "outer");
        assert_eq!(outer.upvalue_count, 0);
        let inner = find_function(&outer, "inner");
        assert_eq!(inner.upvalue_count, 1);
        assert_eq!(inner.arity, 0);
    }

    fn find_function(parent: &Function, name: &str) -> Rc<Function> {
        (0..=u8::MAX)
            .filter_map(|idx| parent.chunk.get_constant(idx))
            .find_map(|c| match c {
                Value::Obj(Object::Function(f)) if f.name == name => Some(f.clone()),
                _ => None,
            })
            .unwrap_or_else(|| panic!("no function {name}"))
    }

    #[test]
    fn captured_locals_are_closed_at_scope_end() {
        let script = compile("{ var a = 1; fun f() { return a; } }").unwrap();
        let ops = opcodes(&script.chunk);
        assert!(ops.contains(&Opcode::CloseUpvalue));
        // `f` is popped, `a` is closed.
        let tail: Vec<_> = ops.iter().rev().skip(2).take(2).copied().collect();
        assert_eq!(tail, [Opcode::CloseUpvalue, Opcode::Pop]);
    }

    #[test]
    fn own_initializer() {
        assert_eq!(single_error("{ var a = a; }"), ParseError::OwnInitializer);
        assert_eq!(single_error("var a = a;"), ParseError::OwnInitializer);
    }

    #[test]
    fn shadowing_initializer_reads_outer_local() {
        assert!(compile("{ var a = 1; { var a = a + 1; print a; } print a; }").is_ok());
    }

    #[test]
    fn duplicate_local() {
        assert_eq!(
            single_error("{ var a = 1; var a = 2; }"),
            ParseError::DuplicateLocal
        );
        assert!(compile("{ var a = 1; { var a = 2; } }").is_ok());
        assert!(compile("var a = 1; var a = 2;").is_ok());
    }

    #[test]
    fn invalid_assignment_target() {
        assert_eq!(
            single_error("var a; var b; a + b = 3;"),
            ParseError::InvalidAssignmentTarget
        );
    }

    #[test]
    fn return_rules() {
        assert_eq!(single_error("return 1;"), ParseError::TopLevelReturn);
        assert_eq!(
            single_error("class A { init() { return 1; } }"),
            ParseError::InitializerReturn
        );
        assert!(compile("class A { init() { return; } }").is_ok());
    }

    #[test]
    fn this_and_super_need_a_class() {
        assert_eq!(single_error("print this;"), ParseError::ThisOutsideClass);
        assert_eq!(
            single_error("fun f() { super.g(); }"),
            ParseError::SuperOutsideClass
        );
        assert_eq!(
            single_error("class A { f() { super.f(); } }"),
            ParseError::SuperWithoutSuperclass
        );
    }

    #[test]
    fn class_cannot_inherit_from_itself() {
        assert_eq!(single_error("class A < A {}"), ParseError::InheritFromSelf);
    }

    #[test]
    fn too_many_constants() {
        let source: String = (0..300).map(|i| format!("print {i};\n")).collect();
        let errors = compile_errors(&source);
        // Every statement past the limit reports on its own.
        assert_eq!(errors.len(), 300 - MAX_CONSTANTS);
        assert_eq!(errors[0].line(), MAX_CONSTANTS + 1);
        assert!(errors.iter().all(|e| matches!(
            e,
            CompileError::Parse {
                error: ParseError::TooManyConstants,
                ..
            }
        )));
    }

    #[test]
    fn too_many_locals() {
        let declarations: String =
            (0..MAX_LOCALS).map(|i| format!("var v{i};\n")).collect();
        let source = format!("fun f() {{\n{declarations}}}");
        assert_eq!(single_error(&source), ParseError::TooManyLocals);
    }

    #[test]
    fn too_many_parameters() {
        let params: Vec<_> = (0..=MAX_PARAMETERS).map(|i| format!("p{i}")).collect();
        let source = format!("fun f({}) {{}}", params.join(", "));
        assert_eq!(single_error(&source), ParseError::TooManyParameters);
    }

    #[test]
    fn too_many_arguments() {
        let args = vec!["nil"; MAX_ARGUMENTS + 1].join(", ");
        let source = format!("fun f() {{}}\nf({args});");
        assert_eq!(single_error(&source), ParseError::TooManyArguments);

        let args = vec!["nil"; MAX_ARGUMENTS].join(", ");
        assert!(compile(&format!("fun f() {{}}\nf({args});")).is_ok());
    }

    #[test]
    fn too_many_upvalues() {
        // Slot zero and `middle` leave room for 254 locals in `outer`.
        let outer: String = (0..MAX_LOCALS - 2).map(|i| format!("var a{i};\n")).collect();
        let middle: String = (0..3).map(|i| format!("var b{i};\n")).collect();
        let reads: String = (0..MAX_LOCALS - 2)
            .map(|i| format!("a{i};\n"))
            .chain((0..3).map(|i| format!("b{i};\n")))
            .collect();
        let source = format!(
            "fun outer() {{\n{outer}fun middle() {{\n{middle}fun inner() {{\n{reads}}}\n}}\n}}"
        );
        assert_eq!(single_error(&source), ParseError::TooManyUpvalues);
    }

    #[test]
    fn loop_too_large() {
        let body: String = (0..14_000).map(|_| "a = 1;\n").collect();
        let source = format!("var a; while (true) {{\n{body}}}");
        assert_eq!(single_error(&source), ParseError::LoopTooLarge);
    }

    #[test]
    fn jump_too_large() {
        let body: String = (0..14_000).map(|_| "a = 1;\n").collect();
        let source = format!("var a; if (true) {{\n{body}}}");
        assert_eq!(single_error(&source), ParseError::JumpTooLarge);
    }

    #[test]
    fn errors_are_reported_per_statement() {
        let errors = compile_errors("var = 1;\nprint 1 +;\nvar ok = 2;\nprint );");
        assert_eq!(errors.len(), 3, "{errors:?}");
        assert_eq!(
            errors.iter().map(CompileError::line).collect::<Vec<_>>(),
            [1, 2, 4]
        );
    }

    #[test]
    fn error_locations() {
        let errors = compile_errors("print 1");
        assert_eq!(
            errors[0].to_string(),
            "[line 1] Error at end: Expect ';' after value."
        );
        let errors = compile_errors("{ var a = 1; var a = 2; }");
        assert_eq!(
            errors[0].to_string(),
            "[line 1] Error at 'a': Already a variable with this name in this scope."
        );
    }

    #[test]
    fn scan_errors_are_reported() {
        let errors = compile_errors("print 1 @ 2;");
        assert_eq!(errors[0].to_string(), "[line 1] Error: Unexpected character.");
    }
}
