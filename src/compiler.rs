//! Compiler: AST → Bytecode
//!
//! Emits one instruction stream per lexical scope into a growing buffer and
//! back-patches jumps once their targets are known. The symbol table and the
//! constant pool outlive a single [`Compiler::compile`] call, so a host can
//! compile a session incrementally.
//!
//! Every emitted byte is tagged with the span of the node that produced it,
//! which lets the VM report where a runtime error happened.

use std::rc::Rc;

use tracing::debug;

use crate::ast::{Expr, FunctionKind, InfixOp, PrefixOp, Program, Stmt};
use crate::builtins;
use crate::bytecode::{create_instruction, pack_big_endian, Bytecode, Instructions, OpCode, Spans};
use crate::error::{ErrorKind, MeleeError, Result};
use crate::symbols::{Symbol, SymbolKind, SymbolTable, MAX_LOCALS, MAX_VARIABLES};
use crate::token::Span;
use crate::value::{Callable, CallableKind, Capture, Value};

const MAX_CONSTANTS: usize = 1 << 16;
const MAX_U8_OPERAND: usize = u8::MAX as usize;
const MAX_U16_OPERAND: usize = u16::MAX as usize;

/// Placeholder target for jumps that are patched later
const PENDING_JUMP: usize = 0xFFFF;

#[derive(Debug, Clone, Copy)]
struct EmittedInstruction {
    op: OpCode,
    position: usize,
}

#[derive(Debug, Clone)]
struct LoopContext {
    start: usize,
    breaks: Vec<usize>,
}

/// Instruction buffer of one function body (or the top level)
#[derive(Debug, Clone, Default)]
struct CompilationScope {
    instructions: Vec<u8>,
    /// Source span of each byte in `instructions`
    spans: Vec<Span>,
    last: Option<EmittedInstruction>,
    previous: Option<EmittedInstruction>,
    loops: Vec<LoopContext>,
}

/// The bytecode compiler
#[derive(Debug, Clone)]
pub struct Compiler {
    constants: Vec<Value>,
    symbols: SymbolTable,
    scopes: Vec<CompilationScope>,
    /// Span of the node being compiled
    span: Span,
}

impl Compiler {
    pub fn new() -> Self {
        Self {
            constants: Vec::new(),
            symbols: SymbolTable::create_global_symbol_table(&builtins::native_names()),
            scopes: vec![CompilationScope::default()],
            span: Span::default(),
        }
    }

    /// Compile a program into top-level bytecode terminated by `HALT`.
    ///
    /// Each failing top-level statement contributes one error and its partial
    /// output is discarded, so a broken program reports every problem at once.
    /// A failed compile leaves no new globals or constants behind, since none
    /// of its code will run.
    pub fn compile(&mut self, program: &Program) -> std::result::Result<Bytecode, Vec<MeleeError>> {
        self.scopes = vec![CompilationScope::default()];
        self.symbols.reset_to_global();
        let symbols = self.symbols.clone();
        let constants = self.constants.len();

        let mut errors = Vec::new();
        for stmt in &program.statements {
            let mark = self.scope().instructions.len();
            if let Err(err) = self.compile_stmt(stmt) {
                errors.push(err);
                self.discard_since(mark);
            }
        }

        if !errors.is_empty() {
            debug!(errors = errors.len(), "compilation failed");
            self.symbols = symbols;
            self.constants.truncate(constants);
            return Err(errors);
        }

        self.emit(OpCode::Halt, &[]);
        let scope = std::mem::take(&mut self.scopes[0]);
        let instructions: Instructions = scope.instructions.into();
        let spans: Spans = scope.spans.into();
        debug!(
            bytes = instructions.len(),
            constants = self.constants.len(),
            "compiled program"
        );

        Ok(Bytecode {
            instructions,
            spans,
            constants: self.constants.clone().into(),
        })
    }

    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }

    pub fn constants(&self) -> &[Value] {
        &self.constants
    }

    /// Roll back to the top-level scope after a failed statement
    fn discard_since(&mut self, mark: usize) {
        self.scopes.truncate(1);
        self.symbols.reset_to_global();
        let scope = self.scope_mut();
        scope.instructions.truncate(mark);
        scope.spans.truncate(mark);
        scope.loops.clear();
        scope.last = None;
        scope.previous = None;
    }

    // ==================== Emission ====================

    fn scope(&self) -> &CompilationScope {
        &self.scopes[self.scopes.len() - 1]
    }

    fn scope_mut(&mut self) -> &mut CompilationScope {
        let last = self.scopes.len() - 1;
        &mut self.scopes[last]
    }

    fn position(&self) -> usize {
        self.scope().instructions.len()
    }

    fn emit(&mut self, op: OpCode, operands: &[usize]) -> usize {
        let instruction = create_instruction(op, operands);
        let span = self.span;
        let scope = self.scope_mut();
        let position = scope.instructions.len();
        scope.spans.resize(position + instruction.len(), span);
        scope.instructions.extend(instruction);
        scope.previous = scope.last.take();
        scope.last = Some(EmittedInstruction { op, position });
        position
    }

    fn last_is(&self, op: OpCode) -> bool {
        matches!(self.scope().last, Some(last) if last.op == op)
    }

    /// Drop a trailing `POP` emitted at or after `start`, leaving the value on the stack
    fn remove_last_pop(&mut self, start: usize) -> bool {
        let scope = self.scope_mut();
        match scope.last {
            Some(EmittedInstruction { op: OpCode::Pop, position }) if position >= start => {
                scope.instructions.truncate(position);
                scope.spans.truncate(position);
                scope.last = scope.previous.take();
                true
            }
            _ => false,
        }
    }

    fn add_constant(&mut self, value: Value, span: Span) -> Result<usize> {
        if self.constants.len() >= MAX_CONSTANTS {
            return Err(MeleeError::at(ErrorKind::TooManyConstants(MAX_CONSTANTS), span));
        }
        self.constants.push(value);
        Ok(self.constants.len() - 1)
    }

    fn emit_constant(&mut self, value: Value, span: Span) -> Result<()> {
        let index = self.add_constant(value, span)?;
        self.emit(OpCode::Const, &[index]);
        Ok(())
    }

    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit(op, &[PENDING_JUMP])
    }

    /// Point the jump at `position` to the current end of the buffer
    fn patch_jump(&mut self, position: usize, span: Span) -> Result<()> {
        let target = self.position();
        if target > MAX_U16_OPERAND {
            return Err(MeleeError::at(ErrorKind::JumpTooFar(target), span));
        }
        let bytes = pack_big_endian(target, 2);
        self.scope_mut().instructions[position + 1..position + 3].copy_from_slice(&bytes);
        Ok(())
    }

    fn emit_jump_to(&mut self, target: usize, span: Span) -> Result<()> {
        if target > MAX_U16_OPERAND {
            return Err(MeleeError::at(ErrorKind::JumpTooFar(target), span));
        }
        self.emit(OpCode::Jmp, &[target]);
        Ok(())
    }

    fn emit_get(&mut self, symbol: &Symbol) {
        match symbol.kind {
            SymbolKind::Native => self.emit(OpCode::GetNative, &[symbol.index]),
            SymbolKind::Global => self.emit(OpCode::GetGlobal, &[symbol.index]),
            SymbolKind::Local => self.emit(OpCode::Get, &[symbol.index]),
            SymbolKind::Free => self.emit(OpCode::GetFree, &[symbol.index]),
            SymbolKind::SelfRef => self.emit(OpCode::SelfRef, &[]),
        };
    }

    fn emit_set(&mut self, symbol: &Symbol, span: Span) -> Result<()> {
        match symbol.kind {
            SymbolKind::Global => self.emit(OpCode::SetGlobal, &[symbol.index]),
            SymbolKind::Local => self.emit(OpCode::Set, &[symbol.index]),
            SymbolKind::Free => self.emit(OpCode::SetFree, &[symbol.index]),
            SymbolKind::Native | SymbolKind::SelfRef => {
                return Err(MeleeError::at(
                    ErrorKind::ReadOnlyBinding(symbol.label.clone()),
                    span,
                ))
            }
        };
        Ok(())
    }

    /// Allocate a slot for `label`, rejecting indices the operands cannot address
    fn declare(&mut self, label: &str, span: Span) -> Result<Symbol> {
        let index = self.symbols.add(label);
        self.check_slot(index, span)?;
        self.resolve(label, span)
    }

    fn declare_hidden(&mut self, span: Span) -> Result<Symbol> {
        let symbol = self.symbols.add_iota();
        self.check_slot(symbol.index, span)?;
        Ok(symbol)
    }

    fn check_slot(&self, index: usize, span: Span) -> Result<()> {
        let limit = if self.symbols.is_global() { MAX_VARIABLES } else { MAX_LOCALS };
        if index >= limit {
            return Err(MeleeError::at(ErrorKind::TooManyVariables(limit), span));
        }
        Ok(())
    }

    fn resolve(&mut self, name: &str, span: Span) -> Result<Symbol> {
        self.symbols
            .get(name)
            .ok_or_else(|| MeleeError::at(ErrorKind::UndefinedVariable(name.to_string()), span))
    }

    // ==================== Statements ====================

    fn compile_block(&mut self, stmts: &[Stmt]) -> Result<()> {
        for stmt in stmts {
            self.compile_stmt(stmt)?;
        }
        Ok(())
    }

    fn compile_stmt(&mut self, stmt: &Stmt) -> Result<()> {
        let outer = std::mem::replace(&mut self.span, stmt.span());
        let result = self.compile_stmt_at(stmt);
        self.span = outer;
        result
    }

    fn compile_stmt_at(&mut self, stmt: &Stmt) -> Result<()> {
        match stmt {
            Stmt::Expr { expr, .. } => {
                self.compile_expr(expr)?;
                self.emit(OpCode::Pop, &[]);
            }

            Stmt::Declare { name, value, span } => {
                self.compile_expr(value)?;
                let symbol = self.declare(name, *span)?;
                self.emit_set(&symbol, *span)?;
            }

            Stmt::Return { value, span } => {
                if self.symbols.is_global() {
                    return Err(MeleeError::at(ErrorKind::ReturnOutsideFunction, *span));
                }
                match value {
                    Some(value) => self.compile_expr(value)?,
                    None => {
                        self.emit(OpCode::Null, &[]);
                    }
                }
                self.emit(OpCode::Ret, &[]);
            }

            Stmt::Yield { value, span } => {
                if self.symbols.is_global() {
                    return Err(MeleeError::at(ErrorKind::YieldOutsideFunction, *span));
                }
                let value = value
                    .as_ref()
                    .ok_or_else(|| MeleeError::at(ErrorKind::MissingOperand("yield"), *span))?;
                self.compile_expr(value)?;
                self.emit(OpCode::Yield, &[]);
            }

            Stmt::While { condition, body, span } => {
                self.compile_loop(Some(condition), body, *span)?;
            }

            Stmt::Loop { body, span } => {
                self.compile_loop(None, body, *span)?;
            }

            Stmt::For { var, iterable, body, span } => {
                self.compile_for(var, iterable, body, *span)?;
            }

            Stmt::Break { span } => {
                if self.scope().loops.is_empty() {
                    return Err(MeleeError::at(ErrorKind::BreakOutsideLoop, *span));
                }
                let jump = self.emit_jump(OpCode::Jmp);
                if let Some(ctx) = self.scope_mut().loops.last_mut() {
                    ctx.breaks.push(jump);
                }
            }

            Stmt::Continue { span } => {
                let start = self
                    .scope()
                    .loops
                    .last()
                    .map(|ctx| ctx.start)
                    .ok_or_else(|| MeleeError::at(ErrorKind::ContinueOutsideLoop, *span))?;
                self.emit_jump_to(start, *span)?;
            }

            Stmt::Block { stmts, .. } => self.compile_block(stmts)?,
        }
        Ok(())
    }

    /// `while` and `loop`; a missing condition loops forever
    fn compile_loop(&mut self, condition: Option<&Expr>, body: &[Stmt], span: Span) -> Result<()> {
        let start = self.position();
        self.scope_mut().loops.push(LoopContext { start, breaks: Vec::new() });

        match condition {
            Some(condition) => self.compile_expr(condition)?,
            None => {
                self.emit(OpCode::True, &[]);
            }
        }
        let exit = self.emit_jump(OpCode::JmpIfNot);

        self.compile_block(body)?;
        self.emit_jump_to(start, span)?;

        self.patch_jump(exit, span)?;
        self.finish_loop(span)
    }

    /// Desugars to a loop over hidden counter and collection slots. Arrays are
    /// walked by index; sequences are pulled with `NEXT` until they give null.
    fn compile_for(&mut self, var: &str, iterable: &Expr, body: &[Stmt], span: Span) -> Result<()> {
        let counter = self.declare_hidden(span)?;
        self.emit_constant(Value::Int(0), span)?;
        self.emit_set(&counter, span)?;

        self.compile_expr(iterable)?;
        let collection = self.declare_hidden(span)?;
        self.emit_set(&collection, span)?;

        let item = self.declare(var, span)?;

        let start = self.position();
        self.scope_mut().loops.push(LoopContext { start, breaks: Vec::new() });

        self.emit_get(&collection);
        self.emit(OpCode::IsSeq, &[]);
        let to_array = self.emit_jump(OpCode::JmpIfNot);

        // item = next collection; stop on null
        self.emit_get(&collection);
        self.emit(OpCode::Next, &[]);
        self.emit_set(&item, span)?;
        self.emit_get(&item);
        self.emit(OpCode::Null, &[]);
        self.emit(OpCode::Eq, &[]);
        let to_body = self.emit_jump(OpCode::JmpIfNot);
        let seq_exit = self.emit_jump(OpCode::Jmp);

        // counter < len(collection)
        self.patch_jump(to_array, span)?;
        self.emit_get(&collection);
        self.emit(OpCode::Len, &[]);
        self.emit_get(&counter);
        self.emit(OpCode::Gt, &[]);
        let exit = self.emit_jump(OpCode::JmpIfNot);

        self.emit_get(&collection);
        self.emit_get(&counter);
        self.emit(OpCode::Index, &[]);
        self.emit_set(&item, span)?;

        self.emit_get(&counter);
        self.emit_constant(Value::Int(1), span)?;
        self.emit(OpCode::Add, &[]);
        self.emit_set(&counter, span)?;

        self.patch_jump(to_body, span)?;
        self.compile_block(body)?;
        self.emit_jump_to(start, span)?;

        self.patch_jump(exit, span)?;
        self.patch_jump(seq_exit, span)?;
        self.finish_loop(span)
    }

    fn finish_loop(&mut self, span: Span) -> Result<()> {
        let ctx = self
            .scope_mut()
            .loops
            .pop()
            .ok_or_else(|| MeleeError::internal("loop context missing"))?;
        for jump in ctx.breaks {
            self.patch_jump(jump, span)?;
        }
        Ok(())
    }

    // ==================== Expressions ====================

    fn compile_expr(&mut self, expr: &Expr) -> Result<()> {
        let outer = std::mem::replace(&mut self.span, expr.span());
        let result = self.compile_expr_at(expr);
        self.span = outer;
        result
    }

    fn compile_expr_at(&mut self, expr: &Expr) -> Result<()> {
        match expr {
            Expr::Int { value, span } => self.emit_constant(Value::Int(*value), *span)?,

            Expr::Bool { value, .. } => {
                self.emit(if *value { OpCode::True } else { OpCode::False }, &[]);
            }

            Expr::Null { .. } => {
                self.emit(OpCode::Null, &[]);
            }

            Expr::Array { items, span } => {
                if items.len() > MAX_U16_OPERAND {
                    return Err(MeleeError::at(ErrorKind::TooManyOperands(MAX_U16_OPERAND), *span));
                }
                for item in items {
                    self.compile_expr(item)?;
                }
                self.emit(OpCode::Array, &[items.len()]);
            }

            Expr::Ident { name, span } => {
                let symbol = self.resolve(name, *span)?;
                self.emit_get(&symbol);
            }

            Expr::Prefix { op, operand, .. } => {
                self.compile_expr(operand)?;
                match op {
                    PrefixOp::Minus => self.emit(OpCode::Minus, &[]),
                    PrefixOp::Bang => self.emit(OpCode::Bang, &[]),
                };
            }

            Expr::Infix { left, op, right, .. } => match op {
                // a < b is b > a
                InfixOp::Lt | InfixOp::Le => {
                    self.compile_expr(right)?;
                    self.compile_expr(left)?;
                    let op = if *op == InfixOp::Lt { OpCode::Gt } else { OpCode::Gte };
                    self.emit(op, &[]);
                }
                _ => {
                    self.compile_expr(left)?;
                    self.compile_expr(right)?;
                    self.emit(binary_opcode(*op), &[]);
                }
            },

            Expr::Assign { target, value, span } => self.compile_assign(target, None, value, *span)?,

            Expr::CompoundAssign { target, op, value, span } => {
                self.compile_assign(target, Some(*op), value, *span)?
            }

            Expr::Function { kind, name, params, body, span } => {
                self.compile_function(*kind, name.as_deref(), params, body, *span)?
            }

            Expr::Call { callee, args, span } => {
                if args.len() > MAX_U8_OPERAND {
                    return Err(MeleeError::at(ErrorKind::TooManyOperands(MAX_U8_OPERAND), *span));
                }
                self.compile_expr(callee)?;
                for arg in args {
                    self.compile_expr(arg)?;
                }
                self.emit(OpCode::Call, &[args.len()]);
            }

            Expr::Index { collection, index, .. } => {
                self.compile_expr(collection)?;
                self.compile_expr(index)?;
                self.emit(OpCode::Index, &[]);
            }

            Expr::If { condition, consequence, alternative, span } => {
                self.compile_expr(condition)?;
                let to_alternative = self.emit_jump(OpCode::JmpIfNot);

                let start = self.position();
                self.compile_block(consequence)?;
                if !self.remove_last_pop(start) {
                    self.emit(OpCode::Null, &[]);
                }
                let to_end = self.emit_jump(OpCode::Jmp);

                self.patch_jump(to_alternative, *span)?;
                match alternative {
                    Some(stmts) => {
                        let start = self.position();
                        self.compile_block(stmts)?;
                        if !self.remove_last_pop(start) {
                            self.emit(OpCode::Null, &[]);
                        }
                    }
                    None => {
                        self.emit(OpCode::Null, &[]);
                    }
                }
                self.patch_jump(to_end, *span)?;
            }

            Expr::Next { operand, span } => {
                self.compile_operand(operand.as_deref(), "next", *span)?;
                self.emit(OpCode::Next, &[]);
            }

            Expr::Note { operand, span } => {
                self.compile_operand(operand.as_deref(), "note", *span)?;
                self.emit(OpCode::Note, &[]);
            }

            Expr::Skip { duration, span } => {
                match duration {
                    Some(duration) => self.compile_expr(duration)?,
                    None => self.emit_constant(Value::Int(1), *span)?,
                }
                self.emit(OpCode::Skip, &[]);
            }

            Expr::Cc { operand, span } => {
                self.compile_operand(operand.as_deref(), "cc", *span)?;
                self.emit(OpCode::Cc, &[]);
            }
        }
        Ok(())
    }

    fn compile_operand(&mut self, operand: Option<&Expr>, keyword: &'static str, span: Span) -> Result<()> {
        let operand =
            operand.ok_or_else(|| MeleeError::at(ErrorKind::MissingOperand(keyword), span))?;
        self.compile_expr(operand)
    }

    /// Plain and compound assignment. Both leave the stored value on the stack.
    fn compile_assign(
        &mut self,
        target: &Expr,
        op: Option<InfixOp>,
        value: &Expr,
        span: Span,
    ) -> Result<()> {
        match target {
            Expr::Ident { name, span: name_span } => {
                let symbol = self.resolve(name, *name_span)?;
                if matches!(symbol.kind, SymbolKind::Native | SymbolKind::SelfRef) {
                    return Err(MeleeError::at(ErrorKind::ReadOnlyBinding(name.clone()), *name_span));
                }
                if let Some(op) = op {
                    self.emit_get(&symbol);
                    self.compile_expr(value)?;
                    self.emit(binary_opcode(op), &[]);
                } else {
                    self.compile_expr(value)?;
                }
                self.emit_set(&symbol, span)?;
                self.emit_get(&symbol);
            }

            Expr::Index { collection, index, .. } => {
                self.compile_expr(collection)?;
                self.compile_expr(index)?;
                if let Some(op) = op {
                    self.compile_expr(collection)?;
                    self.compile_expr(index)?;
                    self.emit(OpCode::Index, &[]);
                    self.compile_expr(value)?;
                    self.emit(binary_opcode(op), &[]);
                } else {
                    self.compile_expr(value)?;
                }
                self.emit(OpCode::SetIndex, &[]);

                // re-read so the expression yields the stored value
                self.compile_expr(collection)?;
                self.compile_expr(index)?;
                self.emit(OpCode::Index, &[]);
            }

            other => return Err(MeleeError::at(ErrorKind::InvalidAssignmentTarget, other.span())),
        }
        Ok(())
    }

    fn compile_function(
        &mut self,
        kind: FunctionKind,
        name: Option<&str>,
        params: &[String],
        body: &[Stmt],
        span: Span,
    ) -> Result<()> {
        self.scopes.push(CompilationScope::default());
        self.symbols.push_scope();

        if let Some(name) = name {
            self.symbols.set_self(name);
        }
        for param in params {
            self.declare(param, span)?;
        }

        self.compile_block(body)?;
        if !self.last_is(OpCode::Ret) {
            self.emit(OpCode::Null, &[]);
            self.emit(OpCode::Ret, &[]);
        }

        let num_locals = self.symbols.num_definitions();
        let (free, _) = self.symbols.pop_scope();
        let scope = self
            .scopes
            .pop()
            .ok_or_else(|| MeleeError::internal("compilation scope missing"))?;

        if free.len() > MAX_U8_OPERAND {
            return Err(MeleeError::at(ErrorKind::TooManyOperands(MAX_U8_OPERAND), span));
        }
        for symbol in &free {
            self.emit_get(symbol);
        }

        let (callable_kind, keyword) = match kind {
            FunctionKind::Fn => (CallableKind::Fn, "fn"),
            FunctionKind::Gen => (CallableKind::Gen, "gen"),
        };
        let callable = Callable {
            kind: callable_kind,
            instructions: scope.instructions.into(),
            spans: scope.spans.into(),
            repr: format!("{} {}({})", keyword, name.unwrap_or("anonymous"), params.join(", ")),
            num_locals,
            num_params: params.len(),
            captures: free
                .iter()
                .map(|s| Capture { kind: s.kind, index: s.index })
                .collect(),
        };

        let index = self.add_constant(Value::Callable(Rc::new(callable)), span)?;
        self.emit(OpCode::Closure, &[index, free.len()]);
        Ok(())
    }
}

impl Default for Compiler {
    fn default() -> Self {
        Self::new()
    }
}

fn binary_opcode(op: InfixOp) -> OpCode {
    match op {
        InfixOp::Add => OpCode::Add,
        InfixOp::Sub => OpCode::Sub,
        InfixOp::Mul => OpCode::Mul,
        InfixOp::Div => OpCode::Div,
        InfixOp::Mod => OpCode::Mod,
        InfixOp::Eq => OpCode::Eq,
        InfixOp::Ne => OpCode::NotEq,
        InfixOp::Gt => OpCode::Gt,
        InfixOp::Ge => OpCode::Gte,
        InfixOp::And => OpCode::And,
        InfixOp::Or => OpCode::Or,
        // callers swap operands and use GT/GTE
        InfixOp::Lt => OpCode::Gt,
        InfixOp::Le => OpCode::Gte,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::disassemble;
    use crate::lexer::Lexer;
    use crate::parser::Parser;
    use pretty_assertions::assert_eq;

    fn parse(source: &str) -> Program {
        let tokens = Lexer::new(source).tokenize().unwrap();
        Parser::new(tokens).parse().unwrap()
    }

    fn compile(source: &str) -> Bytecode {
        Compiler::new().compile(&parse(source)).unwrap()
    }

    fn compile_err(source: &str) -> Vec<ErrorKind> {
        Compiler::new()
            .compile(&parse(source))
            .unwrap_err()
            .into_iter()
            .map(|e| e.kind)
            .collect()
    }

    fn listing(source: &str) -> String {
        disassemble(&compile(source).instructions)
    }

    #[test]
    fn test_expression_statement_pops() {
        assert_eq!(
            listing("1 + 2"),
            "\
0000 CONST 0
0003 CONST 1
0006 ADD
0007 POP
0008 HALT
"
        );
    }

    #[test]
    fn test_less_than_swaps_operands() {
        let bytecode = compile("1 < 2");
        assert_eq!(
            disassemble(&bytecode.instructions),
            "\
0000 CONST 0
0003 CONST 1
0006 GT
0007 POP
0008 HALT
"
        );
        // right operand is emitted first
        assert_eq!(bytecode.constants[0], Value::Int(2));
        assert_eq!(bytecode.constants[1], Value::Int(1));
    }

    #[test]
    fn test_if_without_else_pushes_null() {
        assert_eq!(
            listing("if true { 10 }"),
            "\
0000 TRUE
0001 JMP_IF_NOT 10
0004 CONST 0
0007 JMP 11
0010 NULL
0011 POP
0012 HALT
"
        );
    }

    #[test]
    fn test_declarations_use_global_slots() {
        assert_eq!(
            listing("x := 1; y := x"),
            "\
0000 CONST 0
0003 SETG 0
0006 GETG 0
0009 SETG 1
0012 HALT
"
        );
    }

    #[test]
    fn test_assignment_reads_back() {
        assert_eq!(
            listing("x := 1; x = 2"),
            "\
0000 CONST 0
0003 SETG 0
0006 CONST 1
0009 SETG 0
0012 GETG 0
0015 POP
0016 HALT
"
        );
    }

    #[test]
    fn test_index_assignment_rereads_slot() {
        let text = listing("a := [1]; a[0] = 5");
        let ops: Vec<&str> = text
            .lines()
            .map(|line| line.split_whitespace().nth(1).unwrap())
            .collect();
        assert_eq!(
            ops,
            vec![
                "CONST", "ARRAY", "SETG", "GETG", "CONST", "CONST", "SET_INDEX", "GETG", "CONST",
                "INDEX", "POP", "HALT"
            ]
        );
    }

    #[test]
    fn test_closure_captures_outer_local() {
        let bytecode = compile("f := fn(a) { return fn(b) { return a + b } }");
        let inner = match &bytecode.constants[0] {
            Value::Callable(c) => c.clone(),
            other => panic!("expected callable, got {}", other),
        };
        assert_eq!(
            disassemble(&inner.instructions),
            "\
0000 GETC 0
0002 GET 0
0004 ADD
0005 RET
"
        );
        assert_eq!(inner.captures, vec![Capture { kind: SymbolKind::Local, index: 0 }]);

        let outer = match &bytecode.constants[1] {
            Value::Callable(c) => c.clone(),
            other => panic!("expected callable, got {}", other),
        };
        assert_eq!(
            disassemble(&outer.instructions),
            "\
0000 GET 0
0002 CLOSURE 0 1
0006 RET
"
        );
        assert_eq!(outer.repr, "fn f(a)");
        assert_eq!((outer.num_params, outer.num_locals), (1, 1));
    }

    #[test]
    fn test_named_function_uses_self() {
        let bytecode = compile("f := fn(n) { return f(n) }");
        let Value::Callable(f) = &bytecode.constants[0] else {
            panic!("expected callable");
        };
        assert!(f.captures.is_empty());
        assert!(disassemble(&f.instructions).starts_with("0000 SELF\n0001 GET 0\n0003 CALL 1\n"));
    }

    #[test]
    fn test_implicit_null_return() {
        let bytecode = compile("g := gen() { yield 1 }");
        let Value::Callable(g) = &bytecode.constants[1] else {
            panic!("expected callable");
        };
        assert_eq!(g.kind, CallableKind::Gen);
        assert_eq!(
            disassemble(&g.instructions),
            "\
0000 CONST 0
0003 YIELD
0004 NULL
0005 RET
"
        );
    }

    #[test]
    fn test_natives_resolve_to_getn() {
        assert!(listing("len([])").starts_with("0000 GETN 1\n"));
    }

    #[test]
    fn test_skip_defaults_duration() {
        assert_eq!(
            listing("skip"),
            "\
0000 CONST 0
0003 SKIP
0004 POP
0005 HALT
"
        );
    }

    #[test]
    fn test_while_patches_break_and_exit() {
        let text = listing("while true { break }");
        assert_eq!(
            text,
            "\
0000 TRUE
0001 JMP_IF_NOT 10
0004 JMP 10
0007 JMP 0
0010 HALT
"
        );
    }

    #[test]
    fn test_nested_for_loops_use_distinct_hidden_slots() {
        let bytecode = compile("for x in [1] { for y in [2] { x + y } }");
        let text = disassemble(&bytecode.instructions);
        // two counters, two collections and two user variables
        let mut slots: Vec<&str> = text
            .lines()
            .filter(|line| line.contains("SETG"))
            .map(|line| line.rsplit(' ').next().unwrap())
            .collect();
        slots.sort();
        slots.dedup();
        assert_eq!(slots, vec!["0", "1", "2", "3", "4", "5"]);
    }

    #[test]
    fn test_compile_errors() {
        assert_eq!(compile_err("y + 1"), vec![ErrorKind::UndefinedVariable("y".into())]);
        assert_eq!(compile_err("z = 1"), vec![ErrorKind::UndefinedVariable("z".into())]);
        assert_eq!(compile_err("1 = 2"), vec![ErrorKind::InvalidAssignmentTarget]);
        assert_eq!(compile_err("len = 2"), vec![ErrorKind::ReadOnlyBinding("len".into())]);
        assert_eq!(compile_err("continue"), vec![ErrorKind::ContinueOutsideLoop]);
        assert_eq!(compile_err("break"), vec![ErrorKind::BreakOutsideLoop]);
        assert_eq!(compile_err("return 1"), vec![ErrorKind::ReturnOutsideFunction]);
        assert_eq!(compile_err("next"), vec![ErrorKind::MissingOperand("next")]);
        assert_eq!(compile_err("note"), vec![ErrorKind::MissingOperand("note")]);
        assert_eq!(compile_err("cc"), vec![ErrorKind::MissingOperand("cc")]);
        assert_eq!(
            compile_err("f := gen() { yield }"),
            vec![ErrorKind::MissingOperand("yield")]
        );
    }

    #[test]
    fn test_errors_collected_per_statement() {
        let errors = compile_err("a\nx := 1\nb\nx");
        assert_eq!(
            errors,
            vec![
                ErrorKind::UndefinedVariable("a".into()),
                ErrorKind::UndefinedVariable("b".into()),
            ]
        );
    }

    #[test]
    fn test_error_positions() {
        let errors = Compiler::new().compile(&parse("x := 1\n  foo")).unwrap_err();
        assert_eq!(errors[0].line(), Some(2));
        assert_eq!(errors[0].column(), Some(3));
        assert_eq!(errors[0].length(), 3);
    }

    #[test]
    fn test_incremental_compilation_shares_globals() {
        let mut compiler = Compiler::new();
        compiler.compile(&parse("x := 40")).unwrap();
        let bytecode = compiler.compile(&parse("x + 2")).unwrap();
        assert!(disassemble(&bytecode.instructions).starts_with("0000 GETG 0\n"));
        assert_eq!(bytecode.constants.len(), 2);
    }

    #[test]
    fn test_failed_function_restores_scopes() {
        let mut compiler = Compiler::new();
        assert!(compiler.compile(&parse("f := fn() { missing }")).is_err());
        assert!(compiler.symbols().is_global());
        assert!(compiler.compile(&parse("g := 1")).is_ok());
    }

    #[test]
    fn test_failed_compile_forgets_its_declarations() {
        let mut compiler = Compiler::new();
        compiler.compile(&parse("keep := 1")).unwrap();
        assert!(compiler.compile(&parse("x := 7\nnope")).is_err());
        let errors = compiler.compile(&parse("x + 1")).unwrap_err();
        assert_eq!(errors[0].kind, ErrorKind::UndefinedVariable("x".into()));

        let bytecode = compiler.compile(&parse("keep")).unwrap();
        assert_eq!(bytecode.constants.len(), 1);
    }

    #[test]
    fn test_every_byte_has_a_span() {
        let bytecode = compile("x := 1\ny := x / 0");
        assert_eq!(bytecode.spans.len(), bytecode.instructions.len());

        let div = bytecode
            .instructions
            .iter()
            .position(|&byte| byte == OpCode::Div as u8)
            .unwrap();
        let span = bytecode.spans[div];
        assert_eq!((span.line, span.column, span.len()), (2, 6, 5));
    }

    #[test]
    fn test_for_branches_on_sequences() {
        let text = listing("for x in [1] { x }");
        let is_seq = text.find("IS_SEQ").unwrap();
        let next = text.find("NEXT").unwrap();
        let len = text.find("LEN").unwrap();
        assert!(is_seq < next && next < len);
    }
}
