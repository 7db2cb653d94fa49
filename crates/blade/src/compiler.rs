//! Single-pass Pratt-parsing compiler.
//!
//! There is no AST: each grammar rule emits bytecode into the current
//! function's [`Blob`] as it parses. Jump targets use the placeholder/patch
//! approach — jumps are emitted with a dummy target and patched in place
//! once the destination is known.
//!
//! Locals are slot-based: a declaration reserves the next stack slot and
//! emits no code, because the slot index *is* the stack offset at run time.
//! Upvalue resolution walks the stack of enclosing function states; the
//! first enclosing function that owns the name marks its local as captured
//! and every intermediate function records a forwarding descriptor.
//!
//! Errors use panic-mode recovery: the first error in a statement is
//! recorded, tokens are drained to the next statement boundary, and
//! parsing continues so one pass can report several diagnostics.

use std::rc::Rc;

use crate::bytecode::{Blob, Op, UpvalueDesc, NO_FILTER, NO_TARGET};
use crate::error::{CompileDiagnostics, Diagnostic};
use crate::heap::Heap;
use crate::object::{Function, Obj};
use crate::scanner::{decode_bytes, Scanner, Token, TokenKind};
use crate::value::{ObjId, Value};

/// Upper bound on call arguments and function parameters.
const MAX_ARGS: usize = 255;
/// Constant-dedup scan cap; beyond this constants are appended blindly.
const CONST_DEDUP_WINDOW: usize = 256;

/// Operator precedence, lowest to highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Prec {
    None,
    Assignment, // =
    Coalesce,   // ??
    Or,         // or
    And,        // and
    Equality,   // == !=
    Comparison, // < > <= >=
    Range,      // ..
    BitOr,      // |
    BitXor,     // ^
    BitAnd,     // &
    Shift,      // << >> >>>
    Term,       // + -
    Factor,     // * / // %
    Power,      // ** (right associative)
    Unary,      // ! - ~
    Call,       // . () []
    Primary,
}

impl Prec {
    fn next(self) -> Prec {
        match self {
            Prec::None => Prec::Assignment,
            Prec::Assignment => Prec::Coalesce,
            Prec::Coalesce => Prec::Or,
            Prec::Or => Prec::And,
            Prec::And => Prec::Equality,
            Prec::Equality => Prec::Comparison,
            Prec::Comparison => Prec::Range,
            Prec::Range => Prec::BitOr,
            Prec::BitOr => Prec::BitXor,
            Prec::BitXor => Prec::BitAnd,
            Prec::BitAnd => Prec::Shift,
            Prec::Shift => Prec::Term,
            Prec::Term => Prec::Factor,
            Prec::Factor => Prec::Power,
            Prec::Power => Prec::Unary,
            Prec::Unary => Prec::Call,
            Prec::Call | Prec::Primary => Prec::Primary,
        }
    }
}

type ParseFn<'src, 'h> = fn(&mut Compiler<'src, 'h>, bool);

struct Rule<'src, 'h> {
    prefix: Option<ParseFn<'src, 'h>>,
    infix: Option<ParseFn<'src, 'h>>,
    prec: Prec,
}

/// What kind of function body is being compiled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FnKind {
    Script,
    Function,
    Method,
    Constructor,
}

struct Local {
    name: String,
    /// Scope depth, or -1 while the initializer is still being compiled.
    depth: i32,
    captured: bool,
}

struct LoopCtx {
    /// Jump target for `continue`, when known up front.
    continue_target: Option<usize>,
    /// Forward `continue` jumps to patch (do-while).
    continues: Vec<usize>,
    /// Forward `break` jumps to patch at loop end.
    breaks: Vec<usize>,
    /// Local count at loop entry; break paths trim back to it.
    locals: usize,
    /// Open `try` regions outside this loop; break must unwind the rest.
    try_depth: u16,
}

/// Per-function compilation state; one entry per nesting level.
struct FnState {
    name: String,
    kind: FnKind,
    arity: u8,
    is_variadic: bool,
    blob: Blob,
    upvalues: Vec<UpvalueDesc>,
    locals: Vec<Local>,
    scope_depth: i32,
    loops: Vec<LoopCtx>,
    try_depth: u16,
}

impl FnState {
    fn new(name: &str, kind: FnKind) -> FnState {
        // Slot 0 belongs to the callee: `self` inside methods, unnamed and
        // unresolvable otherwise.
        let slot_zero = Local {
            name: if matches!(kind, FnKind::Method | FnKind::Constructor) {
                "self".to_string()
            } else {
                String::new()
            },
            depth: 0,
            captured: false,
        };
        FnState {
            name: name.to_string(),
            kind,
            arity: 0,
            is_variadic: false,
            blob: Blob::default(),
            upvalues: Vec::new(),
            locals: vec![slot_zero],
            scope_depth: 0,
            loops: Vec::new(),
            try_depth: 0,
        }
    }
}

struct ClassCtx {
    name: String,
    has_super: bool,
}

pub struct Compiler<'src, 'h> {
    scanner: Scanner<'src>,
    heap: &'h mut Heap,
    module: ObjId,
    current: Token,
    previous: Token,
    errors: Vec<Diagnostic>,
    panic_mode: bool,
    states: Vec<FnState>,
    classes: Vec<ClassCtx>,
    /// REPL mode: the value of a trailing expression statement becomes the
    /// script's return value instead of being popped.
    interactive: bool,
}

/// Compile a source text into a script [`Function`] owned by `module`.
pub fn compile(
    source: &str,
    heap: &mut Heap,
    module: ObjId,
    name: &str,
    interactive: bool,
) -> Result<ObjId, CompileDiagnostics> {
    let mut scanner = Scanner::new(source);
    let first = scanner.next_token();
    let mut compiler = Compiler {
        scanner,
        heap,
        module,
        current: first,
        previous: Token {
            kind: TokenKind::Eof,
            lexeme: String::new(),
            line: 1,
        },
        errors: Vec::new(),
        panic_mode: false,
        states: vec![FnState::new(name, FnKind::Script)],
        classes: Vec::new(),
        interactive,
    };

    loop {
        compiler.skip_newlines();
        if compiler.matches(TokenKind::Eof) {
            break;
        }
        compiler.declaration();
    }
    compiler.emit(Op::Nil);
    compiler.emit(Op::Return);

    if !compiler.errors.is_empty() {
        return Err(CompileDiagnostics {
            diagnostics: compiler.errors,
        });
    }

    let state = compiler.states.pop().expect("script state");
    let function = Function {
        name: Rc::from(name),
        arity: 0,
        is_variadic: false,
        upvalues: Vec::new(),
        code: Rc::new(state.blob),
        module,
        bound_class: None,
    };
    Ok(compiler.heap.alloc(Obj::Function(function)))
}

impl<'src, 'h> Compiler<'src, 'h> {
    // -----------------------------------------------------------------------
    // Token plumbing
    // -----------------------------------------------------------------------

    fn advance(&mut self) {
        self.previous = std::mem::replace(
            &mut self.current,
            Token {
                kind: TokenKind::Eof,
                lexeme: String::new(),
                line: 0,
            },
        );
        loop {
            self.current = self.scanner.next_token();
            if self.current.kind != TokenKind::Error {
                break;
            }
            let message = self.current.lexeme.clone();
            let line = self.current.line;
            self.error_at_line(line, &message);
        }
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.current.kind == kind {
            self.advance();
        } else {
            self.error_at_current(message);
        }
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn matches(&mut self, kind: TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn skip_newlines(&mut self) {
        while self.matches(TokenKind::Newline) {}
    }

    /// Statements end at a newline, a `;`, EOF, or just before a `}`.
    fn statement_end(&mut self) {
        if self.check(TokenKind::RightBrace) || self.check(TokenKind::Eof) {
            return;
        }
        if self.matches(TokenKind::Semicolon) {
            self.matches(TokenKind::Newline);
            return;
        }
        if self.matches(TokenKind::Newline) {
            return;
        }
        self.error_at_current("expected newline or ';' after statement");
    }

    // -----------------------------------------------------------------------
    // Error reporting
    // -----------------------------------------------------------------------

    fn error(&mut self, message: &str) {
        let line = self.previous.line;
        self.error_at_line(line, message);
    }

    fn error_at_current(&mut self, message: &str) {
        let line = self.current.line;
        self.error_at_line(line, message);
    }

    fn error_at_line(&mut self, line: u32, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.errors.push(Diagnostic {
            line,
            message: message.to_string(),
        });
    }

    /// Drain tokens to the next statement boundary after an error.
    fn synchronize(&mut self) {
        self.panic_mode = false;
        while self.current.kind != TokenKind::Eof {
            if matches!(
                self.previous.kind,
                TokenKind::Newline | TokenKind::Semicolon
            ) {
                return;
            }
            match self.current.kind {
                TokenKind::Class
                | TokenKind::Def
                | TokenKind::Var
                | TokenKind::For
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Return
                | TokenKind::Try
                | TokenKind::Import
                | TokenKind::Echo => return,
                _ => {}
            }
            self.advance();
        }
    }

    // -----------------------------------------------------------------------
    // Emission helpers
    // -----------------------------------------------------------------------

    fn state(&mut self) -> &mut FnState {
        self.states.last_mut().expect("compiler state")
    }

    fn emit(&mut self, op: Op) {
        let line = self.previous.line;
        let state = self.state();
        state.blob.code.push(op);
        state.blob.lines.push(line);
    }

    fn offset(&mut self) -> usize {
        self.state().blob.code.len()
    }

    /// Emit a forward jump with a placeholder target; returns its index.
    fn emit_jump(&mut self, make: fn(u32) -> Op) -> usize {
        let index = self.offset();
        self.emit(make(NO_TARGET));
        index
    }

    /// Patch a previously emitted jump to land on the next instruction.
    fn patch_jump(&mut self, index: usize) {
        let target = self.offset() as u32;
        self.patch_jump_to(index, target);
    }

    fn patch_jump_to(&mut self, index: usize, target: u32) {
        match &mut self.state().blob.code[index] {
            Op::Jump(t)
            | Op::JumpIfFalse(t)
            | Op::JumpIfFalseOrPop(t)
            | Op::JumpIfTrueOrPop(t)
            | Op::JumpIfNotNilOrPop(t)
            | Op::JumpIfNil(t)
            | Op::Loop(t) => *t = target,
            Op::Unwind { target: t, .. } => *t = target,
            other => panic!("patch_jump on non-jump {:?}", other),
        }
    }

    fn make_const(&mut self, value: Value) -> u16 {
        let constants = &self.state().blob.constants;
        for (i, existing) in constants.iter().take(CONST_DEDUP_WINDOW).enumerate() {
            if *existing == value {
                return i as u16;
            }
        }
        let index = constants.len();
        if index > u16::MAX as usize {
            self.error("too many constants in one function");
            return 0;
        }
        self.state().blob.constants.push(value);
        index as u16
    }

    fn identifier_const(&mut self, name: &str) -> u16 {
        let value = self.heap.intern_value(name);
        self.make_const(value)
    }

    // -----------------------------------------------------------------------
    // Scopes and locals
    // -----------------------------------------------------------------------

    fn begin_scope(&mut self) {
        self.state().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        let state = self.state();
        state.scope_depth -= 1;
        let depth = state.scope_depth;
        let mut ops = Vec::new();
        while let Some(local) = state.locals.last() {
            if local.depth <= depth {
                break;
            }
            ops.push(if local.captured {
                Op::CloseUpvalue
            } else {
                Op::Pop
            });
            state.locals.pop();
        }
        for op in ops {
            self.emit(op);
        }
    }

    fn add_local(&mut self, name: &str) {
        if self.state().locals.len() >= u16::MAX as usize {
            self.error("too many local variables in function");
            return;
        }
        self.state().locals.push(Local {
            name: name.to_string(),
            depth: -1,
            captured: false,
        });
    }

    fn declare_variable(&mut self) {
        if self.state().scope_depth == 0 {
            return;
        }
        let name = self.previous.lexeme.clone();
        let mut duplicate = false;
        {
            let state = self.state();
            let depth = state.scope_depth;
            for local in state.locals.iter().rev() {
                if local.depth != -1 && local.depth < depth {
                    break;
                }
                if local.name == name {
                    duplicate = true;
                    break;
                }
            }
        }
        if duplicate {
            self.error("a variable with this name already exists in this scope");
        }
        self.add_local(&name);
    }

    fn mark_initialized(&mut self) {
        let state = self.state();
        if state.scope_depth == 0 {
            return;
        }
        let depth = state.scope_depth;
        if let Some(local) = state.locals.last_mut() {
            local.depth = depth;
        }
    }

    fn define_variable(&mut self, name_const: u16) {
        if self.state().scope_depth > 0 {
            self.mark_initialized();
        } else {
            self.emit(Op::DefineGlobal(name_const));
        }
    }

    fn resolve_local(&mut self, state_index: usize, name: &str) -> Option<u16> {
        let mut uninitialized = false;
        let mut found = None;
        {
            let state = &self.states[state_index];
            for (slot, local) in state.locals.iter().enumerate().rev() {
                if local.name == name && !local.name.is_empty() {
                    if local.depth == -1 {
                        uninitialized = true;
                    }
                    found = Some(slot as u16);
                    break;
                }
            }
        }
        if uninitialized {
            self.error("cannot read a local variable in its own initializer");
        }
        found
    }

    fn resolve_upvalue(&mut self, state_index: usize, name: &str) -> Option<u16> {
        if state_index == 0 {
            return None;
        }
        let parent = state_index - 1;
        if let Some(slot) = self.resolve_local(parent, name) {
            self.states[parent].locals[slot as usize].captured = true;
            return Some(self.add_upvalue(state_index, slot, true));
        }
        if let Some(index) = self.resolve_upvalue(parent, name) {
            return Some(self.add_upvalue(state_index, index, false));
        }
        None
    }

    fn add_upvalue(&mut self, state_index: usize, index: u16, from_parent_local: bool) -> u16 {
        let upvalues = &mut self.states[state_index].upvalues;
        for (i, existing) in upvalues.iter().enumerate() {
            if existing.index == index && existing.from_parent_local == from_parent_local {
                return i as u16;
            }
        }
        upvalues.push(UpvalueDesc {
            from_parent_local,
            index,
        });
        (upvalues.len() - 1) as u16
    }

    // -----------------------------------------------------------------------
    // Declarations
    // -----------------------------------------------------------------------

    fn declaration(&mut self) {
        if self.matches(TokenKind::Var) {
            self.var_declaration();
        } else if self.matches(TokenKind::Def) {
            self.def_declaration();
        } else if self.matches(TokenKind::Class) {
            self.class_declaration();
        } else {
            self.statement();
        }
        if self.panic_mode {
            self.synchronize();
        }
    }

    fn var_declaration(&mut self) {
        loop {
            self.consume(TokenKind::Identifier, "expected variable name");
            let name = self.previous.lexeme.clone();
            let name_const = self.identifier_const(&name);
            self.declare_variable();
            if self.matches(TokenKind::Equal) {
                self.expression();
            } else {
                self.emit(Op::Nil);
            }
            self.define_variable(name_const);
            if !self.matches(TokenKind::Comma) {
                break;
            }
        }
        self.statement_end();
    }

    fn def_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "expected function name");
        let name = self.previous.lexeme.clone();
        let name_const = self.identifier_const(&name);
        self.declare_variable();
        // Mark initialized up front so the body can call itself.
        self.mark_initialized();
        self.function(FnKind::Function, &name);
        self.define_variable(name_const);
        self.statement_end();
    }

    /// Compile a parenthesized parameter list and braced body, then emit
    /// the `Closure` that captures it.
    fn function(&mut self, kind: FnKind, name: &str) {
        self.states.push(FnState::new(name, kind));
        self.begin_scope();

        self.consume(TokenKind::LeftParen, "expected '(' after function name");
        self.parameter_list(TokenKind::RightParen);
        self.consume(TokenKind::RightParen, "expected ')' after parameters");
        self.skip_newlines();
        self.consume(TokenKind::LeftBrace, "expected '{' before function body");
        self.block();

        self.finish_function();
    }

    fn parameter_list(&mut self, terminator: TokenKind) {
        if self.check(terminator) {
            return;
        }
        loop {
            if self.state().arity as usize >= MAX_ARGS {
                self.error_at_current("too many parameters");
            }
            if self.matches(TokenKind::Ellipsis) {
                self.consume(TokenKind::Identifier, "expected parameter name after '...'");
                self.state().is_variadic = true;
                self.state().arity += 1;
                self.declare_variable();
                self.mark_initialized();
                if self.check(TokenKind::Comma) {
                    self.error_at_current("variadic parameter must come last");
                }
                break;
            }
            self.consume(TokenKind::Identifier, "expected parameter name");
            self.state().arity += 1;
            self.declare_variable();
            self.mark_initialized();
            if !self.matches(TokenKind::Comma) {
                break;
            }
        }
    }

    /// Pop the innermost function state, build the `Function` object, and
    /// emit the `Closure` instruction in the enclosing function.
    fn finish_function(&mut self) {
        // Implicit return: constructors hand back their receiver.
        if self.state().kind == FnKind::Constructor {
            self.emit(Op::GetLocal(0));
        } else {
            self.emit(Op::Nil);
        }
        self.emit(Op::Return);

        let state = self.states.pop().expect("function state");
        let function = Function {
            name: Rc::from(state.name.as_str()),
            arity: state.arity,
            is_variadic: state.is_variadic,
            upvalues: state.upvalues,
            code: Rc::new(state.blob),
            module: self.module,
            bound_class: None,
        };
        let id = self.heap.alloc(Obj::Function(function));
        let index = self.make_const(Value::Obj(id));
        self.emit(Op::Closure(index));
    }

    fn class_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "expected class name");
        let name = self.previous.lexeme.clone();
        let name_const = self.identifier_const(&name);
        self.declare_variable();
        self.emit(Op::Class(name_const));
        self.define_variable(name_const);

        let mut has_super = false;
        // Put the class object (back) on the stack for the body ops.
        self.named_variable(&name, false);
        if self.matches(TokenKind::Less) {
            self.consume(TokenKind::Identifier, "expected superclass name");
            let super_name = self.previous.lexeme.clone();
            if super_name == name {
                self.error("a class cannot inherit from itself");
            }
            self.named_variable(&super_name, false);
            self.emit(Op::Inherit);
            has_super = true;
        }
        self.classes.push(ClassCtx { name, has_super });

        self.skip_newlines();
        self.consume(TokenKind::LeftBrace, "expected '{' before class body");
        self.skip_newlines();
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.class_member();
            self.skip_newlines();
        }
        self.consume(TokenKind::RightBrace, "expected '}' after class body");
        self.emit(Op::Pop); // the class object
        self.classes.pop();
        self.statement_end();
    }

    fn class_member(&mut self) {
        let is_static = self.matches(TokenKind::Static);
        if self.matches(TokenKind::Var) {
            // Field initializer, evaluated once at class-creation time.
            loop {
                self.consume(TokenKind::Identifier, "expected field name");
                let field_const = self.identifier_const(&self.previous.lexeme.clone());
                if self.matches(TokenKind::Equal) {
                    self.expression();
                } else {
                    self.emit(Op::Nil);
                }
                self.emit(if is_static {
                    Op::StaticField(field_const)
                } else {
                    Op::Field(field_const)
                });
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
            self.statement_end();
            return;
        }

        // Operator methods are spelled `@name`.
        let name = if self.matches(TokenKind::At) {
            self.consume(TokenKind::Identifier, "expected method name after '@'");
            format!("@{}", self.previous.lexeme)
        } else {
            self.consume(TokenKind::Identifier, "expected method name");
            self.previous.lexeme.clone()
        };

        // A method named after its class is the constructor.
        let class_name = self.classes.last().map(|c| c.name.clone());
        let (kind, method_name) = if !is_static && class_name.as_deref() == Some(name.as_str()) {
            (FnKind::Constructor, "@new".to_string())
        } else if is_static {
            (FnKind::Function, name)
        } else {
            (FnKind::Method, name)
        };
        let name_const = self.identifier_const(&method_name);
        self.function(kind, &method_name);
        self.emit(if is_static {
            Op::StaticMethod(name_const)
        } else {
            Op::Method(name_const)
        });
    }

    // -----------------------------------------------------------------------
    // Statements
    // -----------------------------------------------------------------------

    fn statement(&mut self) {
        match self.current.kind {
            TokenKind::If => {
                self.advance();
                self.if_statement();
            }
            TokenKind::While => {
                self.advance();
                self.while_statement();
            }
            TokenKind::Do => {
                self.advance();
                self.do_while_statement();
            }
            TokenKind::Loop => {
                self.advance();
                self.loop_statement();
            }
            TokenKind::For => {
                self.advance();
                self.for_statement();
            }
            TokenKind::Break => {
                self.advance();
                self.break_statement();
            }
            TokenKind::Continue => {
                self.advance();
                self.continue_statement();
            }
            TokenKind::Return => {
                self.advance();
                self.return_statement();
            }
            TokenKind::Try => {
                self.advance();
                self.try_statement();
            }
            TokenKind::Raise => {
                self.advance();
                self.expression();
                self.emit(Op::Raise);
                self.statement_end();
            }
            TokenKind::Import => {
                self.advance();
                self.import_statement();
            }
            TokenKind::Echo => {
                self.advance();
                self.expression();
                self.emit(Op::Echo);
                self.statement_end();
            }
            TokenKind::LeftBrace => {
                self.advance();
                self.begin_scope();
                self.block();
                self.end_scope();
            }
            TokenKind::Semicolon => {
                self.advance();
            }
            _ => self.expression_statement(),
        }
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.statement_end();
        // In interactive mode a trailing expression becomes the script's
        // return value.
        if self.interactive && self.states.len() == 1 && self.check(TokenKind::Eof) {
            self.emit(Op::Return);
        } else {
            self.emit(Op::Pop);
        }
    }

    fn block(&mut self) {
        self.skip_newlines();
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.declaration();
            self.skip_newlines();
        }
        self.consume(TokenKind::RightBrace, "expected '}' after block");
    }

    fn if_statement(&mut self) {
        self.expression();
        let then_jump = self.emit_jump(Op::JumpIfFalse);
        self.statement();
        if self.matches(TokenKind::Else) {
            let else_jump = self.emit_jump(Op::Jump);
            self.patch_jump(then_jump);
            self.statement();
            self.patch_jump(else_jump);
        } else {
            self.patch_jump(then_jump);
        }
    }

    fn push_loop(&mut self, continue_target: Option<usize>) {
        let locals = self.state().locals.len();
        let try_depth = self.state().try_depth;
        self.state().loops.push(LoopCtx {
            continue_target,
            continues: Vec::new(),
            breaks: Vec::new(),
            locals,
            try_depth,
        });
    }

    /// Pop the loop context, patching breaks (and pending continues) to the
    /// current offset.
    fn pop_loop(&mut self, continue_target_now: Option<usize>) {
        let ctx = self.state().loops.pop().expect("loop context");
        for index in ctx.breaks {
            self.patch_jump(index);
        }
        if let Some(target) = continue_target_now {
            for index in ctx.continues {
                self.patch_jump_to(index, target as u32);
            }
        }
    }

    fn while_statement(&mut self) {
        let loop_start = self.offset();
        self.push_loop(Some(loop_start));
        self.expression();
        let exit_jump = self.emit_jump(Op::JumpIfFalse);
        self.statement();
        self.emit(Op::Loop(loop_start as u32));
        self.patch_jump(exit_jump);
        self.pop_loop(None);
    }

    fn do_while_statement(&mut self) {
        let body_start = self.offset();
        // The condition's offset is unknown until the body ends, so
        // `continue` jumps are collected and patched afterwards.
        self.push_loop(None);
        self.statement();
        let cond_start = self.offset();
        self.consume(TokenKind::While, "expected 'while' after do body");
        self.expression();
        let exit_jump = self.emit_jump(Op::JumpIfFalse);
        self.emit(Op::Loop(body_start as u32));
        self.patch_jump(exit_jump);
        self.pop_loop(Some(cond_start));
        self.statement_end();
    }

    fn loop_statement(&mut self) {
        let body_start = self.offset();
        self.push_loop(Some(body_start));
        self.statement();
        self.emit(Op::Loop(body_start as u32));
        self.pop_loop(None);
    }

    fn for_statement(&mut self) {
        if self.check(TokenKind::LeftParen) {
            self.numeric_for_statement();
        } else {
            self.iterator_for_statement();
        }
    }

    /// `for (init; cond; step) body`
    fn numeric_for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "expected '(' after 'for'");

        if self.matches(TokenKind::Semicolon) {
            // no initializer
        } else if self.matches(TokenKind::Var) {
            self.numeric_for_var();
        } else {
            self.expression();
            self.emit(Op::Pop);
            self.consume(TokenKind::Semicolon, "expected ';' after loop initializer");
        }

        let cond_start = self.offset();
        if self.check(TokenKind::Semicolon) {
            self.emit(Op::True);
        } else {
            self.expression();
        }
        self.consume(TokenKind::Semicolon, "expected ';' after loop condition");
        let exit_jump = self.emit_jump(Op::JumpIfFalse);
        let body_jump = self.emit_jump(Op::Jump);

        let step_start = self.offset();
        if !self.check(TokenKind::RightParen) {
            self.expression();
            self.emit(Op::Pop);
        }
        self.consume(TokenKind::RightParen, "expected ')' after for clauses");
        self.emit(Op::Loop(cond_start as u32));

        self.patch_jump(body_jump);
        self.push_loop(Some(step_start));
        self.statement();
        self.emit(Op::Loop(step_start as u32));
        self.patch_jump(exit_jump);
        self.pop_loop(None);
        self.end_scope();
    }

    /// Initializer clause of a numeric for: like `var_declaration` but
    /// terminated by ';' only.
    fn numeric_for_var(&mut self) {
        loop {
            self.consume(TokenKind::Identifier, "expected variable name");
            let name_const = self.identifier_const(&self.previous.lexeme.clone());
            self.declare_variable();
            if self.matches(TokenKind::Equal) {
                self.expression();
            } else {
                self.emit(Op::Nil);
            }
            self.define_variable(name_const);
            if !self.matches(TokenKind::Comma) {
                break;
            }
        }
        self.consume(TokenKind::Semicolon, "expected ';' after loop initializer");
    }

    /// `for x in expr body`, lowered onto the iterator protocol: `@itern`
    /// advances the key (nil means done, and a nil key restarts), `@iter`
    /// fetches the element for the current key.
    fn iterator_for_statement(&mut self) {
        self.consume(TokenKind::Identifier, "expected loop variable after 'for'");
        let var_name = self.previous.lexeme.clone();
        self.consume(TokenKind::In, "expected 'in' after loop variable");

        self.begin_scope();
        self.expression();
        self.add_local("@iterable");
        self.mark_initialized();
        let iterable_slot = (self.state().locals.len() - 1) as u16;

        self.emit(Op::Nil);
        self.add_local("@key");
        self.mark_initialized();
        let key_slot = (self.state().locals.len() - 1) as u16;

        self.emit(Op::Nil);
        self.add_local(&var_name);
        self.mark_initialized();
        let var_slot = (self.state().locals.len() - 1) as u16;

        let loop_start = self.offset();
        self.push_loop(Some(loop_start));

        self.emit(Op::GetLocal(iterable_slot));
        self.emit(Op::GetLocal(key_slot));
        self.emit(Op::IterNext);
        self.emit(Op::SetLocal(key_slot));
        let exit_jump = self.emit_jump(Op::JumpIfNil);

        self.emit(Op::GetLocal(iterable_slot));
        self.emit(Op::GetLocal(key_slot));
        self.emit(Op::IterGet);
        self.emit(Op::SetLocal(var_slot));
        self.emit(Op::Pop);

        self.statement();
        self.emit(Op::Loop(loop_start as u32));
        self.patch_jump(exit_jump);
        self.pop_loop(None);
        self.end_scope();
    }

    fn break_statement(&mut self) {
        if self.state().loops.is_empty() {
            self.error("'break' outside of a loop");
            self.statement_end();
            return;
        }
        let (locals, trys) = {
            let state = self.state();
            let ctx = state.loops.last().unwrap();
            (ctx.locals, state.try_depth - ctx.try_depth)
        };
        if trys > 0 {
            // Run intervening finally blocks, then resume at the very next
            // instruction as if the unwind were a fall-through.
            let next = (self.offset() + 1) as u32;
            self.emit(Op::Unwind { trys, target: next });
        }
        self.emit(Op::PopToLocal(locals as u16));
        let jump = self.emit_jump(Op::Jump);
        self.state().loops.last_mut().unwrap().breaks.push(jump);
        self.statement_end();
    }

    fn continue_statement(&mut self) {
        if self.state().loops.is_empty() {
            self.error("'continue' outside of a loop");
            self.statement_end();
            return;
        }
        let (locals, trys, target) = {
            let state = self.state();
            let ctx = state.loops.last().unwrap();
            (ctx.locals, state.try_depth - ctx.try_depth, ctx.continue_target)
        };
        if trys > 0 {
            let next = (self.offset() + 1) as u32;
            self.emit(Op::Unwind { trys, target: next });
        }
        self.emit(Op::PopToLocal(locals as u16));
        match target {
            Some(t) => self.emit(Op::Loop(t as u32)),
            None => {
                let jump = self.emit_jump(Op::Jump);
                self.state().loops.last_mut().unwrap().continues.push(jump);
            }
        }
        self.statement_end();
    }

    fn return_statement(&mut self) {
        match self.state().kind {
            FnKind::Script => {
                self.error("cannot return from top-level code");
            }
            FnKind::Constructor => {
                if !self.check(TokenKind::Newline)
                    && !self.check(TokenKind::Semicolon)
                    && !self.check(TokenKind::RightBrace)
                    && !self.check(TokenKind::Eof)
                {
                    self.error("cannot return a value from a constructor");
                }
                self.emit(Op::GetLocal(0));
                self.emit(Op::Return);
            }
            _ => {
                if self.check(TokenKind::Newline)
                    || self.check(TokenKind::Semicolon)
                    || self.check(TokenKind::RightBrace)
                    || self.check(TokenKind::Eof)
                {
                    self.emit(Op::Nil);
                } else {
                    self.expression();
                }
                self.emit(Op::Return);
            }
        }
        self.statement_end();
    }

    fn try_statement(&mut self) {
        let try_index = self.offset();
        self.emit(Op::Try {
            filter: NO_FILTER,
            catch: NO_TARGET,
            finally: NO_TARGET,
        });
        self.state().try_depth += 1;

        self.skip_newlines();
        self.consume(TokenKind::LeftBrace, "expected '{' after 'try'");
        self.begin_scope();
        self.block();
        self.end_scope();
        self.state().try_depth -= 1;
        self.emit(Op::PopTry);
        let normal_exit = self.emit_jump(Op::Jump);

        let mut caught = false;
        if self.matches(TokenKind::Catch) {
            caught = true;
            let catch_target = self.offset() as u32;
            let mut filter = NO_FILTER;
            if self.check(TokenKind::Identifier) {
                self.advance();
                filter = self.identifier_const(&self.previous.lexeme.clone());
            }
            self.set_try_operands(try_index, Some(filter), Some(catch_target), None);

            self.begin_scope();
            if self.matches(TokenKind::As) {
                self.consume(TokenKind::Identifier, "expected binding name after 'as'");
                // The unwinder leaves the raised value exactly at this slot.
                self.declare_variable();
                self.mark_initialized();
            } else {
                self.emit(Op::Pop);
            }
            self.skip_newlines();
            self.consume(TokenKind::LeftBrace, "expected '{' after catch clause");
            self.block();
            self.end_scope();
        }

        if self.check(TokenKind::Finally) {
            if caught {
                // Consume the finally-only handler installed when the catch
                // was entered.
                self.emit(Op::PopTry);
            }
            self.advance();
            // Normal entry records an empty deferred action; the unwinder
            // jumps past it with its own.
            let normal_entry = self.offset() as u32;
            self.emit(Op::BeginFinally);
            let finally_target = self.offset() as u32;
            self.set_try_operands(try_index, None, None, Some(finally_target));
            self.patch_jump_to(normal_exit, normal_entry);

            self.skip_newlines();
            self.consume(TokenKind::LeftBrace, "expected '{' after 'finally'");
            self.begin_scope();
            self.block();
            self.end_scope();
            self.emit(Op::EndTry);
        } else {
            if !caught {
                self.error("expected 'catch' or 'finally' after try block");
            }
            self.patch_jump(normal_exit);
        }
        self.statement_end();
    }

    fn set_try_operands(
        &mut self,
        index: usize,
        filter_value: Option<u16>,
        catch_value: Option<u32>,
        finally_value: Option<u32>,
    ) {
        if let Op::Try {
            filter,
            catch,
            finally,
        } = &mut self.state().blob.code[index]
        {
            if let Some(f) = filter_value {
                *filter = f;
            }
            if let Some(c) = catch_value {
                *catch = c;
            }
            if let Some(f) = finally_value {
                *finally = f;
            }
        } else {
            panic!("set_try_operands on non-try instruction");
        }
    }

    fn import_statement(&mut self) {
        self.consume(TokenKind::Identifier, "expected module name after 'import'");
        let mut path = self.previous.lexeme.clone();
        while self.matches(TokenKind::Dot) {
            self.consume(TokenKind::Identifier, "expected name after '.'");
            path.push('.');
            path.push_str(&self.previous.lexeme);
        }
        let leaf = path.rsplit('.').next().unwrap_or(&path).to_string();
        let path_const = {
            let value = self.heap.intern_value(&path);
            self.make_const(value)
        };
        self.emit(Op::Import(path_const));

        if self.matches(TokenKind::LeftBrace) {
            self.skip_newlines();
            if self.matches(TokenKind::Star) {
                self.emit(Op::ImportAll);
            } else {
                loop {
                    self.consume(TokenKind::Identifier, "expected imported name");
                    let member = self.identifier_const(&self.previous.lexeme.clone());
                    self.emit(Op::ImportMember(member));
                    self.skip_newlines();
                    if !self.matches(TokenKind::Comma) {
                        break;
                    }
                    self.skip_newlines();
                }
            }
            self.skip_newlines();
            self.consume(TokenKind::RightBrace, "expected '}' after import list");
            self.emit(Op::Pop);
            self.statement_end();
            return;
        }

        let bind_name = if self.matches(TokenKind::As) {
            self.consume(TokenKind::Identifier, "expected alias after 'as'");
            self.previous.lexeme.clone()
        } else {
            leaf
        };
        let bind_const = self.identifier_const(&bind_name);
        if self.state().scope_depth > 0 {
            // The module object on the stack becomes the local itself.
            let state = self.state();
            state.locals.push(Local {
                name: bind_name,
                depth: state.scope_depth,
                captured: false,
            });
        } else {
            self.emit(Op::DefineGlobal(bind_const));
        }
        self.statement_end();
    }

    // -----------------------------------------------------------------------
    // Expressions
    // -----------------------------------------------------------------------

    fn expression(&mut self) {
        self.parse_precedence(Prec::Assignment);
    }

    fn parse_precedence(&mut self, prec: Prec) {
        self.advance();
        let Some(prefix) = rule_for(self.previous.kind).prefix else {
            self.error("expected expression");
            return;
        };
        let can_assign = prec <= Prec::Assignment;
        prefix(self, can_assign);

        while prec <= rule_for(self.current.kind).prec {
            self.advance();
            let infix = rule_for(self.previous.kind)
                .infix
                .expect("infix rule for operator");
            infix(self, can_assign);
        }

        if can_assign && self.check(TokenKind::Equal) {
            self.error_at_current("invalid assignment target");
        }
    }

    fn grouping(&mut self, _can_assign: bool) {
        self.expression();
        self.consume(TokenKind::RightParen, "expected ')' after expression");
    }

    fn unary(&mut self, _can_assign: bool) {
        let op = self.previous.kind;
        // `-` and `~` bind looser than `**`, so `-2 ** 2` is `-(2 ** 2)`;
        // `!` stays tight like its C ancestor.
        let operand_prec = match op {
            TokenKind::Minus | TokenKind::Tilde => Prec::Power,
            _ => Prec::Unary,
        };
        self.parse_precedence(operand_prec);
        match op {
            TokenKind::Minus => self.emit(Op::Negate),
            TokenKind::Bang => self.emit(Op::Not),
            TokenKind::Tilde => self.emit(Op::BitNot),
            _ => unreachable!(),
        }
    }

    fn binary(&mut self, _can_assign: bool) {
        let op = self.previous.kind;
        let rule = rule_for(op);
        // `**` is right-associative; everything else binds left.
        let next = if op == TokenKind::StarStar {
            rule.prec
        } else {
            rule.prec.next()
        };
        self.parse_precedence(next);
        match op {
            TokenKind::Plus => self.emit(Op::Add),
            TokenKind::Minus => self.emit(Op::Sub),
            TokenKind::Star => self.emit(Op::Mul),
            TokenKind::Slash => self.emit(Op::Div),
            TokenKind::SlashSlash => self.emit(Op::FloorDiv),
            TokenKind::Percent => self.emit(Op::Mod),
            TokenKind::StarStar => self.emit(Op::Pow),
            TokenKind::Amp => self.emit(Op::BitAnd),
            TokenKind::Pipe => self.emit(Op::BitOr),
            TokenKind::Caret => self.emit(Op::BitXor),
            TokenKind::LessLess => self.emit(Op::Shl),
            TokenKind::GreaterGreater => self.emit(Op::Shr),
            TokenKind::GreaterGreaterGreater => self.emit(Op::UShr),
            TokenKind::EqualEqual => self.emit(Op::Equal),
            TokenKind::BangEqual => {
                self.emit(Op::Equal);
                self.emit(Op::Not);
            }
            TokenKind::Greater => self.emit(Op::Greater),
            TokenKind::GreaterEqual => self.emit(Op::GreaterEqual),
            TokenKind::Less => self.emit(Op::Less),
            TokenKind::LessEqual => self.emit(Op::LessEqual),
            _ => unreachable!(),
        }
    }

    fn range_expr(&mut self, _can_assign: bool) {
        self.parse_precedence(Prec::Range.next());
        self.emit(Op::Range);
    }

    fn and_expr(&mut self, _can_assign: bool) {
        let jump = self.emit_jump(Op::JumpIfFalseOrPop);
        self.parse_precedence(Prec::And);
        self.patch_jump(jump);
    }

    fn or_expr(&mut self, _can_assign: bool) {
        let jump = self.emit_jump(Op::JumpIfTrueOrPop);
        self.parse_precedence(Prec::Or);
        self.patch_jump(jump);
    }

    fn coalesce_expr(&mut self, _can_assign: bool) {
        let jump = self.emit_jump(Op::JumpIfNotNilOrPop);
        self.parse_precedence(Prec::Coalesce);
        self.patch_jump(jump);
    }

    fn number(&mut self, _can_assign: bool) {
        let text = &self.previous.lexeme;
        let value: Option<f64> =
            if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
                u64::from_str_radix(hex, 16).ok().map(|n| n as f64)
            } else if let Some(bin) = text.strip_prefix("0b").or_else(|| text.strip_prefix("0B")) {
                u64::from_str_radix(bin, 2).ok().map(|n| n as f64)
            } else if let Some(oct) = text.strip_prefix("0o").or_else(|| text.strip_prefix("0O")) {
                u64::from_str_radix(oct, 8).ok().map(|n| n as f64)
            } else {
                text.parse::<f64>().ok()
            };
        match value {
            Some(n) => {
                let index = self.make_const(Value::Number(n));
                self.emit(Op::Const(index));
            }
            None => self.error("malformed number literal"),
        }
    }

    fn string(&mut self, _can_assign: bool) {
        let value = self.heap.intern_value(&self.previous.lexeme);
        let index = self.make_const(value);
        self.emit(Op::Const(index));
    }

    fn bytes_literal(&mut self, _can_assign: bool) {
        let bytes = decode_bytes(&self.previous.lexeme);
        let id = self.heap.alloc(Obj::Bytes(bytes));
        let index = self.make_const(Value::Obj(id));
        self.emit(Op::Const(index));
    }

    /// `'text ${expr} more ${expr} tail'` — chunks and expression values
    /// are pushed in order and joined by `BuildString`.
    fn interpolation(&mut self, _can_assign: bool) {
        let mut parts: u16 = 0;
        loop {
            let chunk = self.heap.intern_value(&self.previous.lexeme);
            let index = self.make_const(chunk);
            self.emit(Op::Const(index));
            parts += 1;

            self.expression();
            parts += 1;

            if self.matches(TokenKind::InterpolChunk) {
                continue;
            }
            self.consume(TokenKind::String, "unterminated string interpolation");
            let tail = self.heap.intern_value(&self.previous.lexeme);
            let tail_index = self.make_const(tail);
            self.emit(Op::Const(tail_index));
            parts += 1;
            break;
        }
        self.emit(Op::BuildString(parts));
    }

    fn literal(&mut self, _can_assign: bool) {
        match self.previous.kind {
            TokenKind::True => self.emit(Op::True),
            TokenKind::False => self.emit(Op::False),
            TokenKind::Nil => self.emit(Op::Nil),
            _ => unreachable!(),
        }
    }

    fn list_literal(&mut self, _can_assign: bool) {
        let mut count: u16 = 0;
        self.skip_newlines();
        if !self.check(TokenKind::RightBracket) {
            loop {
                self.expression();
                count += 1;
                self.skip_newlines();
                if !self.matches(TokenKind::Comma) {
                    break;
                }
                self.skip_newlines();
                if self.check(TokenKind::RightBracket) {
                    break; // trailing comma
                }
            }
        }
        self.consume(TokenKind::RightBracket, "expected ']' after list items");
        self.emit(Op::BuildList(count));
    }

    fn dict_literal(&mut self, _can_assign: bool) {
        let mut count: u16 = 0;
        self.skip_newlines();
        if !self.check(TokenKind::RightBrace) {
            loop {
                self.expression();
                self.consume(TokenKind::Colon, "expected ':' after dict key");
                self.expression();
                count += 1;
                self.skip_newlines();
                if !self.matches(TokenKind::Comma) {
                    break;
                }
                self.skip_newlines();
                if self.check(TokenKind::RightBrace) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightBrace, "expected '}' after dict entries");
        self.emit(Op::BuildDict(count));
    }

    fn variable(&mut self, can_assign: bool) {
        let name = self.previous.lexeme.clone();
        self.named_variable(&name, can_assign);
    }

    fn named_variable(&mut self, name: &str, can_assign: bool) {
        let state_index = self.states.len() - 1;
        let (get_op, set_op) = if let Some(slot) = self.resolve_local(state_index, name) {
            (Op::GetLocal(slot), Op::SetLocal(slot))
        } else if let Some(index) = self.resolve_upvalue(state_index, name) {
            (Op::GetUpvalue(index), Op::SetUpvalue(index))
        } else {
            let name_const = self.identifier_const(name);
            (Op::GetGlobal(name_const), Op::SetGlobal(name_const))
        };

        if can_assign && self.matches(TokenKind::Equal) {
            self.expression();
            self.emit(set_op);
        } else if can_assign && compound_op(self.current.kind).is_some() {
            self.advance();
            let arith = compound_op(self.previous.kind).unwrap();
            self.emit(get_op);
            self.expression();
            self.emit(arith);
            self.emit(set_op);
        } else {
            self.emit(get_op);
        }
    }

    fn call(&mut self, _can_assign: bool) {
        let argc = self.argument_list();
        self.emit(Op::Call(argc));
    }

    fn argument_list(&mut self) -> u8 {
        let mut count: usize = 0;
        self.skip_newlines();
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression();
                count += 1;
                if count > MAX_ARGS {
                    self.error("too many arguments");
                }
                self.skip_newlines();
                if !self.matches(TokenKind::Comma) {
                    break;
                }
                self.skip_newlines();
            }
        }
        self.consume(TokenKind::RightParen, "expected ')' after arguments");
        count.min(MAX_ARGS) as u8
    }

    fn dot(&mut self, can_assign: bool) {
        self.consume(TokenKind::Identifier, "expected property name after '.'");
        let name_const = self.identifier_const(&self.previous.lexeme.clone());

        if can_assign && self.matches(TokenKind::Equal) {
            self.expression();
            self.emit(Op::SetProperty(name_const));
        } else if can_assign && compound_op(self.current.kind).is_some() {
            self.advance();
            let arith = compound_op(self.previous.kind).unwrap();
            self.emit(Op::Dup);
            self.emit(Op::GetProperty(name_const));
            self.expression();
            self.emit(arith);
            self.emit(Op::SetProperty(name_const));
        } else if self.matches(TokenKind::LeftParen) {
            let argc = self.argument_list();
            self.emit(Op::Invoke {
                name: name_const,
                argc,
            });
        } else {
            self.emit(Op::GetProperty(name_const));
        }
    }

    fn index(&mut self, can_assign: bool) {
        self.expression();
        self.consume(TokenKind::RightBracket, "expected ']' after index");

        if can_assign && self.matches(TokenKind::Equal) {
            self.expression();
            self.emit(Op::SetIndex);
        } else if can_assign && compound_op(self.current.kind).is_some() {
            self.advance();
            let arith = compound_op(self.previous.kind).unwrap();
            self.emit(Op::DupTwo);
            self.emit(Op::Index);
            self.expression();
            self.emit(arith);
            self.emit(Op::SetIndex);
        } else {
            self.emit(Op::Index);
        }
    }

    fn self_expr(&mut self, _can_assign: bool) {
        if self.classes.is_empty() {
            self.error("cannot use 'self' outside of a class");
            return;
        }
        self.named_variable("self", false);
    }

    /// `parent.m(args)` — dispatched through the defining class's
    /// superclass, bypassing the flattened method table.
    fn parent_expr(&mut self, _can_assign: bool) {
        match self.classes.last() {
            None => {
                self.error("cannot use 'parent' outside of a class");
                return;
            }
            Some(ctx) if !ctx.has_super => {
                self.error("cannot use 'parent' in a class with no superclass");
                return;
            }
            _ => {}
        }
        self.consume(TokenKind::Dot, "expected '.' after 'parent'");
        self.consume(TokenKind::Identifier, "expected method name after 'parent.'");
        let name_const = self.identifier_const(&self.previous.lexeme.clone());
        self.named_variable("self", false);
        self.consume(TokenKind::LeftParen, "expected '(' for parent method call");
        let argc = self.argument_list();
        self.emit(Op::SuperInvoke {
            name: name_const,
            argc,
        });
    }

    /// `new C(...)` is sugar for the plain construction call `C(...)`.
    fn new_expr(&mut self, _can_assign: bool) {
        self.parse_precedence(Prec::Call);
    }

    /// `|a, b| { body }` or `|x| expr` — an anonymous function.
    fn lambda(&mut self, _can_assign: bool) {
        self.states.push(FnState::new("<anonymous>", FnKind::Function));
        self.begin_scope();
        if !self.check(TokenKind::Pipe) {
            self.parameter_list(TokenKind::Pipe);
        }
        self.consume(TokenKind::Pipe, "expected '|' after lambda parameters");
        self.skip_newlines();
        if self.matches(TokenKind::LeftBrace) {
            self.block();
            self.finish_function();
        } else {
            self.expression();
            self.emit(Op::Return);
            self.finish_function();
        }
    }
}

/// Tokens that read as compound assignment, mapped to their arithmetic op.
fn compound_op(kind: TokenKind) -> Option<Op> {
    Some(match kind {
        TokenKind::PlusEqual => Op::Add,
        TokenKind::MinusEqual => Op::Sub,
        TokenKind::StarEqual => Op::Mul,
        TokenKind::SlashEqual => Op::Div,
        TokenKind::SlashSlashEqual => Op::FloorDiv,
        TokenKind::PercentEqual => Op::Mod,
        TokenKind::StarStarEqual => Op::Pow,
        TokenKind::AmpEqual => Op::BitAnd,
        TokenKind::PipeEqual => Op::BitOr,
        TokenKind::CaretEqual => Op::BitXor,
        TokenKind::LessLessEqual => Op::Shl,
        TokenKind::GreaterGreaterEqual => Op::Shr,
        _ => return None,
    })
}

fn rule_for<'src, 'h>(kind: TokenKind) -> Rule<'src, 'h> {
    use TokenKind::*;
    let (prefix, infix, prec): (
        Option<ParseFn<'src, 'h>>,
        Option<ParseFn<'src, 'h>>,
        Prec,
    ) = match kind {
        LeftParen => (Some(Compiler::grouping), Some(Compiler::call), Prec::Call),
        LeftBracket => (
            Some(Compiler::list_literal),
            Some(Compiler::index),
            Prec::Call,
        ),
        LeftBrace => (Some(Compiler::dict_literal), None, Prec::None),
        Dot => (None, Some(Compiler::dot), Prec::Call),
        Minus => (Some(Compiler::unary), Some(Compiler::binary), Prec::Term),
        Plus => (None, Some(Compiler::binary), Prec::Term),
        Star => (None, Some(Compiler::binary), Prec::Factor),
        Slash => (None, Some(Compiler::binary), Prec::Factor),
        SlashSlash => (None, Some(Compiler::binary), Prec::Factor),
        Percent => (None, Some(Compiler::binary), Prec::Factor),
        StarStar => (None, Some(Compiler::binary), Prec::Power),
        Amp => (None, Some(Compiler::binary), Prec::BitAnd),
        Pipe => (Some(Compiler::lambda), Some(Compiler::binary), Prec::BitOr),
        Caret => (None, Some(Compiler::binary), Prec::BitXor),
        Tilde => (Some(Compiler::unary), None, Prec::None),
        LessLess => (None, Some(Compiler::binary), Prec::Shift),
        GreaterGreater => (None, Some(Compiler::binary), Prec::Shift),
        GreaterGreaterGreater => (None, Some(Compiler::binary), Prec::Shift),
        Bang => (Some(Compiler::unary), None, Prec::None),
        BangEqual => (None, Some(Compiler::binary), Prec::Equality),
        EqualEqual => (None, Some(Compiler::binary), Prec::Equality),
        Greater => (None, Some(Compiler::binary), Prec::Comparison),
        GreaterEqual => (None, Some(Compiler::binary), Prec::Comparison),
        Less => (None, Some(Compiler::binary), Prec::Comparison),
        LessEqual => (None, Some(Compiler::binary), Prec::Comparison),
        DotDot => (None, Some(Compiler::range_expr), Prec::Range),
        QuestionQuestion => (None, Some(Compiler::coalesce_expr), Prec::Coalesce),
        And => (None, Some(Compiler::and_expr), Prec::And),
        Or => (None, Some(Compiler::or_expr), Prec::Or),
        Number => (Some(Compiler::number), None, Prec::None),
        String => (Some(Compiler::string), None, Prec::None),
        InterpolChunk => (Some(Compiler::interpolation), None, Prec::None),
        BytesString => (Some(Compiler::bytes_literal), None, Prec::None),
        Identifier => (Some(Compiler::variable), None, Prec::None),
        True | False | Nil => (Some(Compiler::literal), None, Prec::None),
        SelfKw => (Some(Compiler::self_expr), None, Prec::None),
        Parent => (Some(Compiler::parent_expr), None, Prec::None),
        New => (Some(Compiler::new_expr), None, Prec::None),
        _ => (None, None, Prec::None),
    };
    Rule {
        prefix,
        infix,
        prec,
    }
}
