//! Stack-based Virtual Machine for Melee
//!
//! One [`ExecutionState`] (operand stack plus call frames) is active at a
//! time. Generators run in their own state; `NEXT` swaps the target's saved
//! state in and records the resumer, `YIELD` and the generator's final `RET`
//! swap it back out. Globals are shared by every state.

use std::cell::RefCell;
use std::rc::Rc;

use tracing::{debug, trace};

use crate::builtins::NATIVES;
use crate::bytecode::{Bytecode, OpCode};
use crate::config::{VmConfig, VmHooks};
use crate::error::{ErrorKind, MeleeError, Result};
use crate::symbols::SymbolKind;
use crate::token::Span;
use crate::value::{
    Callable, CallableKind, Closure, MidiCc, MidiNote, NativeFn, Seq, Value, DEFAULT_VELOCITY,
};

/// A call frame for function calls
#[derive(Debug, Clone)]
struct Frame {
    /// The closure being executed
    closure: Rc<Closure>,

    /// Instruction pointer
    ip: usize,

    /// Stack slot of the first argument; the callee sits just below it
    base: usize,

    /// Unique per call, matched against `Closure::origin_frame` on return
    id: u64,
}

/// A private operand stack and call stack. The main program owns one, and
/// every generator instance owns another while it is suspended.
#[derive(Debug, Default)]
pub struct ExecutionState {
    stack: Vec<Value>,
    frames: Vec<Frame>,
}

/// Bookkeeping for a running generator: who to hand control back to
struct Resume {
    parent: ExecutionState,
    seq: Rc<RefCell<Seq>>,
}

/// Where a nested run stops: when control is back in the given coroutine
/// with the given number of frames.
#[derive(Debug, Clone, Copy)]
struct Exit {
    coroutines: usize,
    frames: usize,
}

/// The Virtual Machine
pub struct Vm {
    state: ExecutionState,

    /// Resumers of the generators currently running, innermost last
    coroutines: Vec<Resume>,

    /// Global variables, addressed by compile-time slot
    globals: Vec<Value>,

    constants: Rc<[Value]>,

    config: VmConfig,

    hooks: VmHooks,

    last_popped: Value,

    next_frame_id: u64,
}

impl Vm {
    pub fn new() -> Self {
        Self::with_config(VmConfig::default())
    }

    pub fn with_config(config: VmConfig) -> Self {
        Self::with_globals(config, Vec::new())
    }

    /// Start from an existing set of global bindings
    pub fn with_globals(config: VmConfig, globals: Vec<Value>) -> Self {
        Self {
            state: ExecutionState::default(),
            coroutines: Vec::new(),
            globals,
            constants: Rc::from(Vec::<Value>::new()),
            config,
            hooks: VmHooks::default(),
            last_popped: Value::Null,
            next_frame_id: 0,
        }
    }

    pub fn set_hooks(&mut self, hooks: VmHooks) {
        self.hooks = hooks;
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn globals(&self) -> &[Value] {
        &self.globals
    }

    pub fn into_globals(self) -> Vec<Value> {
        self.globals
    }

    pub fn global(&self, index: usize) -> Value {
        self.globals.get(index).cloned().unwrap_or(Value::Null)
    }

    /// The value most recently discarded by `POP`, i.e. the result of the
    /// last expression statement
    pub fn last_popped(&self) -> &Value {
        &self.last_popped
    }

    /// Send text to the host's print hook
    pub fn print(&mut self, text: &str) {
        (self.hooks.print)(text);
    }

    /// Run top-level bytecode until `HALT`. Stacks are reset, globals persist.
    pub fn execute(&mut self, bytecode: &Bytecode) -> Result<()> {
        self.constants = bytecode.constants.clone();
        self.coroutines.clear();
        self.last_popped = Value::Null;

        let main = Rc::new(Callable {
            kind: CallableKind::Fn,
            instructions: bytecode.instructions.clone(),
            spans: bytecode.spans.clone(),
            repr: "<main>".to_string(),
            num_locals: 0,
            num_params: 0,
            captures: Vec::new(),
        });
        let closure = Rc::new(Closure::new(main, Vec::new(), 0));
        let id = self.fresh_frame_id();
        self.state = ExecutionState {
            stack: vec![Value::Closure(closure.clone())],
            frames: vec![Frame { closure, ip: 0, base: 1, id }],
        };

        self.run()
    }

    /// Run until the active program halts
    pub fn run(&mut self) -> Result<()> {
        self.run_until(None).map_err(|err| {
            debug!(error = %err, "vm aborted");
            err
        })
    }

    /// Call a function value and drive it to completion, returning its
    /// result. Generators return their new sequence without running.
    pub fn call_and_return(&mut self, callee: Value, args: Vec<Value>) -> Result<Value> {
        let exit = self.exit_here();
        let argc = args.len();
        self.push(callee)?;
        for arg in args {
            self.push(arg)?;
        }
        self.call_value(argc)?;
        if self.state.frames.len() > exit.frames {
            self.run_until(Some(exit))?;
        }
        self.pop()
    }

    /// Pull the next value out of a sequence, running a generator until it
    /// yields or finishes.
    pub fn take_next(&mut self, seq: &Value) -> Result<Value> {
        let exit = self.exit_here();
        if self.advance(seq.clone())? {
            self.run_until(Some(exit))?;
        }
        self.pop()
    }

    fn exit_here(&self) -> Exit {
        Exit {
            coroutines: self.coroutines.len(),
            frames: self.state.frames.len(),
        }
    }

    fn fresh_frame_id(&mut self) -> u64 {
        self.next_frame_id += 1;
        self.next_frame_id
    }

    fn reached(&self, exit: Option<Exit>) -> Result<bool> {
        let Some(exit) = exit else {
            return Ok(false);
        };
        if self.coroutines.len() < exit.coroutines {
            return Err(MeleeError::runtime("cannot yield across a native call"));
        }
        Ok(self.coroutines.len() == exit.coroutines && self.state.frames.len() == exit.frames)
    }

    /// Errors without a location are pinned to the instruction that raised them
    fn run_until(&mut self, exit: Option<Exit>) -> Result<()> {
        self.dispatch(exit).map_err(|mut err| {
            if err.span.is_none() {
                err.span = self.current_span();
            }
            err
        })
    }

    fn current_span(&self) -> Option<Span> {
        let frame = self.state.frames.last()?;
        let span = *frame.closure.func.spans.get(frame.ip.saturating_sub(1))?;
        (span.line > 0).then_some(span)
    }

    fn dispatch(&mut self, exit: Option<Exit>) -> Result<()> {
        loop {
            let byte = self.read_u8()?;
            let op = OpCode::from_byte(byte)
                .ok_or_else(|| MeleeError::internal(format!("unknown opcode {}", byte)))?;

            match op {
                OpCode::Const => {
                    let index = self.read_u16()?;
                    let value = self
                        .constants
                        .get(index)
                        .cloned()
                        .ok_or_else(|| MeleeError::internal(format!("constant {} missing", index)))?;
                    self.push(value)?;
                }

                OpCode::True => self.push(Value::TRUE)?,
                OpCode::False => self.push(Value::FALSE)?,
                OpCode::Null => self.push(Value::Null)?,

                OpCode::Add | OpCode::Sub | OpCode::Mul | OpCode::Div | OpCode::Mod => {
                    self.arithmetic(op)?
                }

                OpCode::Bang => {
                    let value = self.pop()?;
                    self.push(Value::Bool(!value.is_truthy()))?;
                }

                OpCode::Minus => {
                    let value = self.pop()?;
                    let Value::Int(n) = &value else {
                        return Err(type_mismatch("int", value.type_name()));
                    };
                    let negated = n.checked_neg().ok_or(ErrorKind::IntegerOverflow)?;
                    self.push(Value::Int(negated))?;
                }

                // both operands are already evaluated
                OpCode::And | OpCode::Or => {
                    let right = self.pop()?;
                    let left = self.pop()?;
                    let result = if op == OpCode::And {
                        left.is_truthy() && right.is_truthy()
                    } else {
                        left.is_truthy() || right.is_truthy()
                    };
                    self.push(Value::Bool(result))?;
                }

                OpCode::Eq | OpCode::NotEq => {
                    let right = self.pop()?;
                    let left = self.pop()?;
                    let equal = equality(&left, &right)?;
                    self.push(Value::Bool(equal == (op == OpCode::Eq)))?;
                }

                OpCode::Gt | OpCode::Gte => {
                    let right = self.pop()?;
                    let left = self.pop()?;
                    let (Value::Int(a), Value::Int(b)) = (&left, &right) else {
                        return Err(operand_mismatch("int and int", &left, &right));
                    };
                    let result = if op == OpCode::Gt { a > b } else { a >= b };
                    self.push(Value::Bool(result))?;
                }

                OpCode::Array => {
                    let count = self.read_u16()?;
                    let start = self.stack_offset(count)?;
                    let items = self.state.stack.split_off(start);
                    self.push(Value::array(items))?;
                }

                OpCode::Len => {
                    let value = self.pop()?;
                    let Value::Array(items) = &value else {
                        return Err(type_mismatch("array", value.type_name()));
                    };
                    let len = items.borrow().len() as i64;
                    self.push(Value::Int(len))?;
                }

                OpCode::Index => {
                    let index = self.pop()?;
                    let collection = self.pop()?;
                    let value = index_array(&collection, &index)?;
                    self.push(value)?;
                }

                OpCode::SetIndex => {
                    let value = self.pop()?;
                    let index = self.pop()?;
                    let collection = self.pop()?;
                    set_index(&collection, &index, value)?;
                }

                OpCode::SetGlobal => {
                    let index = self.read_u16()?;
                    let value = self.pop()?;
                    self.set_global(index, value)?;
                }

                OpCode::GetGlobal => {
                    let index = self.read_u16()?;
                    if index >= self.config.max_globals {
                        return Err(ErrorKind::GlobalOutOfRange(index).into());
                    }
                    let value = self.global(index);
                    self.push(value)?;
                }

                OpCode::Set => {
                    let index = self.read_u8()? as usize;
                    let value = self.pop()?;
                    let slot = self.frame()?.base + index;
                    let target = self
                        .state
                        .stack
                        .get_mut(slot)
                        .ok_or_else(|| MeleeError::internal(format!("local slot {} missing", slot)))?;
                    *target = value;
                }

                OpCode::Get => {
                    let index = self.read_u8()? as usize;
                    let slot = self.frame()?.base + index;
                    let value = self
                        .state
                        .stack
                        .get(slot)
                        .cloned()
                        .ok_or_else(|| MeleeError::internal(format!("local slot {} missing", slot)))?;
                    self.push(value)?;
                }

                OpCode::SetFree => {
                    let index = self.read_u8()? as usize;
                    let value = self.pop()?;
                    if !self.frame()?.closure.set_var(index, value) {
                        return Err(MeleeError::internal(format!("free variable {} missing", index)));
                    }
                }

                OpCode::GetFree => {
                    let index = self.read_u8()? as usize;
                    let value = self
                        .frame()?
                        .closure
                        .get_var(index)
                        .ok_or_else(|| MeleeError::internal(format!("free variable {} missing", index)))?;
                    self.push(value)?;
                }

                OpCode::GetNative => {
                    let index = self.read_u8()? as usize;
                    let native: &'static NativeFn = NATIVES
                        .get(index)
                        .ok_or_else(|| MeleeError::internal(format!("native {} missing", index)))?;
                    self.push(Value::Native(native))?;
                }

                OpCode::SelfRef => {
                    let closure = self.frame()?.closure.clone();
                    self.push(Value::Closure(closure))?;
                }

                OpCode::Jmp => {
                    let target = self.read_u16()?;
                    self.frame_mut()?.ip = target;
                }

                OpCode::JmpIfNot => {
                    let target = self.read_u16()?;
                    if !self.pop()?.is_truthy() {
                        self.frame_mut()?.ip = target;
                    }
                }

                OpCode::Call => {
                    let argc = self.read_u8()? as usize;
                    self.call_value(argc)?;
                }

                OpCode::Ret => {
                    self.return_from_frame()?;
                    if self.reached(exit)? {
                        return Ok(());
                    }
                }

                OpCode::Closure => {
                    let index = self.read_u16()?;
                    let num_free = self.read_u8()? as usize;
                    let Some(Value::Callable(func)) = self.constants.get(index).cloned() else {
                        return Err(MeleeError::internal(format!("constant {} is not a callable", index)));
                    };
                    let start = self.stack_offset(num_free)?;
                    let vars = self.state.stack.split_off(start);
                    let origin = self.frame()?.id;
                    self.push(Value::Closure(Rc::new(Closure::new(func, vars, origin))))?;
                }

                OpCode::Note => {
                    let value = self.pop()?;
                    let note = build_note(&value)?;
                    self.push(Value::Note(note))?;
                }

                OpCode::Skip => {
                    let value = self.pop()?;
                    let Value::Int(duration) = &value else {
                        return Err(ErrorKind::InvalidNote(format!(
                            "skip duration must be an int, got {}",
                            value.type_name()
                        ))
                        .into());
                    };
                    self.push(Value::Note(MidiNote::rest(*duration)))?;
                }

                OpCode::Cc => {
                    let value = self.pop()?;
                    let cc = build_cc(&value)?;
                    self.push(Value::Cc(cc))?;
                }

                OpCode::Yield => {
                    let value = self.pop()?;
                    self.suspend(value)?;
                    if self.reached(exit)? {
                        return Ok(());
                    }
                }

                OpCode::Next => {
                    let target = self.pop()?;
                    self.advance(target)?;
                }

                OpCode::IsSeq => {
                    let value = self.pop()?;
                    self.push(Value::Bool(value.is_sequence()))?;
                }

                OpCode::Pop => {
                    self.last_popped = self.pop()?;
                }

                OpCode::Halt => return Ok(()),

                OpCode::NotImplemented => {
                    return Err(MeleeError::internal("NOT_IMPLEMENTED reached"));
                }
            }
        }
    }

    // ==================== Calls ====================

    /// Call the value `argc` slots below the top of the stack
    fn call_value(&mut self, argc: usize) -> Result<()> {
        let slot = self.stack_offset(argc + 1)?;
        let callee = self.state.stack[slot].clone();
        match callee {
            Value::Closure(closure) => match closure.func.kind {
                CallableKind::Fn => self.call_closure(closure, argc),
                CallableKind::Gen => self.spawn_sequence(closure, argc),
            },
            Value::Native(native) => self.call_native(native, argc),
            other => Err(ErrorKind::NotCallable(other.type_name().to_string()).into()),
        }
    }

    fn call_closure(&mut self, closure: Rc<Closure>, argc: usize) -> Result<()> {
        if self.state.frames.len() >= self.config.max_frames {
            return Err(ErrorKind::FrameOverflow(self.config.max_frames).into());
        }

        let func = closure.func.clone();
        if argc > func.num_params {
            let len = self.state.stack.len();
            self.state.stack.truncate(len - (argc - func.num_params));
        }
        for _ in argc.min(func.num_params)..func.num_locals {
            self.push(Value::Null)?;
        }

        let base = self.state.stack.len() - func.num_locals;
        let id = self.fresh_frame_id();
        self.state.frames.push(Frame { closure, ip: 0, base, id });
        Ok(())
    }

    /// Calling a generator only builds its sequence; the body runs on `next`
    fn spawn_sequence(&mut self, closure: Rc<Closure>, argc: usize) -> Result<()> {
        let func = closure.func.clone();
        let start = self.stack_offset(argc)?;
        let mut args = self.state.stack.split_off(start);
        self.state.stack.pop();
        args.resize(func.num_params, Value::Null);

        let mut stack = Vec::with_capacity(1 + func.num_locals);
        stack.push(Value::Closure(closure.clone()));
        stack.extend(args);
        stack.resize(1 + func.num_locals, Value::Null);

        let id = self.fresh_frame_id();
        let state = ExecutionState {
            stack,
            frames: vec![Frame { closure, ip: 0, base: 1, id }],
        };
        trace!(generator = %func.repr, "created sequence");

        let seq = Seq { state: Some(state), done: false };
        self.push(Value::Seq(Rc::new(RefCell::new(seq))))
    }

    fn call_native(&mut self, native: &'static NativeFn, argc: usize) -> Result<()> {
        if let Some(arity) = native.arity {
            if argc != arity {
                return Err(ErrorKind::WrongArity(arity.to_string(), argc).into());
            }
        }

        let start = self.stack_offset(argc)?;
        let args = self.state.stack.split_off(start);
        self.state.stack.pop();

        let result = (native.func)(self, &args)?;
        self.push(result)
    }

    fn return_from_frame(&mut self) -> Result<()> {
        let result = self.pop()?;

        if self.state.frames.len() == 1 {
            // a generator ran off its end
            let resume = self
                .coroutines
                .pop()
                .ok_or_else(|| MeleeError::internal("return from the top-level frame"))?;
            {
                let mut seq = resume.seq.borrow_mut();
                seq.done = true;
                seq.state = None;
            }
            self.state = resume.parent;
            trace!(depth = self.coroutines.len(), "sequence finished");
            return self.push(result);
        }

        let frame = self
            .state
            .frames
            .pop()
            .ok_or_else(|| MeleeError::internal("frame stack underflow"))?;
        self.state.stack.truncate(frame.base - 1);

        let written = frame.closure.take_written();
        let caller = self.frame()?;
        if frame.closure.origin_frame == caller.id && !written.is_empty() {
            let (caller_base, caller_closure) = (caller.base, caller.closure.clone());
            for (index, value) in written {
                let Some(capture) = frame.closure.func.captures.get(index) else {
                    continue;
                };
                match capture.kind {
                    SymbolKind::Local => {
                        if let Some(slot) = self.state.stack.get_mut(caller_base + capture.index) {
                            *slot = value;
                        }
                    }
                    SymbolKind::Free => {
                        caller_closure.set_var(capture.index, value);
                    }
                    _ => {}
                }
            }
        }

        self.push(result)
    }

    // ==================== Sequences ====================

    /// Resume a sequence. Returns true when a generator's state was switched
    /// in and must run; virtual sequences and finished generators push their
    /// value directly.
    fn advance(&mut self, target: Value) -> Result<bool> {
        match target {
            Value::Seq(seq) => {
                let state = {
                    let mut inner = seq.borrow_mut();
                    if inner.done {
                        None
                    } else {
                        Some(inner.state.take().ok_or(ErrorKind::SequenceRunning)?)
                    }
                };
                let Some(state) = state else {
                    self.push(Value::Null)?;
                    return Ok(false);
                };
                if self.coroutines.len() >= self.config.max_frames {
                    seq.borrow_mut().state = Some(state);
                    return Err(ErrorKind::FrameOverflow(self.config.max_frames).into());
                }

                let parent = std::mem::replace(&mut self.state, state);
                self.coroutines.push(Resume { parent, seq });
                trace!(depth = self.coroutines.len(), "resumed sequence");
                Ok(true)
            }
            Value::VirtualSeq(virtual_seq) => {
                let value = {
                    let mut pull = virtual_seq
                        .pull
                        .try_borrow_mut()
                        .map_err(|_| MeleeError::from(ErrorKind::SequenceRunning))?;
                    (*pull)(self)?
                };
                self.push(value)?;
                Ok(false)
            }
            other => Err(type_mismatch("seq", other.type_name())),
        }
    }

    /// Hand `value` back to whoever resumed the running generator
    fn suspend(&mut self, value: Value) -> Result<()> {
        let resume = self.coroutines.pop().ok_or(ErrorKind::YieldOutsideSequence)?;
        let state = std::mem::replace(&mut self.state, resume.parent);
        resume.seq.borrow_mut().state = Some(state);
        trace!(depth = self.coroutines.len(), "sequence yielded");
        self.push(value)
    }

    // ==================== Helpers ====================

    fn arithmetic(&mut self, op: OpCode) -> Result<()> {
        let right = self.pop()?;
        let left = self.pop()?;
        let (Value::Int(a), Value::Int(b)) = (&left, &right) else {
            return Err(operand_mismatch("int and int", &left, &right));
        };
        let (a, b) = (*a, *b);

        if matches!(op, OpCode::Div | OpCode::Mod) && b == 0 {
            return Err(ErrorKind::DivisionByZero.into());
        }
        let result = match op {
            OpCode::Add => a.checked_add(b),
            OpCode::Sub => a.checked_sub(b),
            OpCode::Mul => a.checked_mul(b),
            OpCode::Div => floor_div(a, b),
            OpCode::Mod => a.checked_rem(b),
            _ => return Err(MeleeError::internal(format!("{} is not arithmetic", op))),
        };
        let result = result.ok_or(ErrorKind::IntegerOverflow)?;
        self.push(Value::Int(result))
    }

    fn set_global(&mut self, index: usize, value: Value) -> Result<()> {
        if index >= self.config.max_globals {
            return Err(ErrorKind::GlobalOutOfRange(index).into());
        }
        if index >= self.globals.len() {
            self.globals.resize(index + 1, Value::Null);
        }
        self.globals[index] = value;
        Ok(())
    }

    fn push(&mut self, value: Value) -> Result<()> {
        if self.state.stack.len() >= self.config.max_stack {
            return Err(ErrorKind::StackOverflow(self.config.max_stack).into());
        }
        self.state.stack.push(value);
        Ok(())
    }

    fn pop(&mut self) -> Result<Value> {
        self.state
            .stack
            .pop()
            .ok_or_else(|| MeleeError::internal("stack underflow"))
    }

    /// Index of the slot `count` values below the top of the stack
    fn stack_offset(&self, count: usize) -> Result<usize> {
        self.state
            .stack
            .len()
            .checked_sub(count)
            .ok_or_else(|| MeleeError::internal("stack underflow"))
    }

    fn frame(&self) -> Result<&Frame> {
        self.state
            .frames
            .last()
            .ok_or_else(|| MeleeError::internal("no active frame"))
    }

    fn frame_mut(&mut self) -> Result<&mut Frame> {
        self.state
            .frames
            .last_mut()
            .ok_or_else(|| MeleeError::internal("no active frame"))
    }

    fn read_u8(&mut self) -> Result<u8> {
        let frame = self.frame_mut()?;
        let byte = *frame
            .closure
            .func
            .instructions
            .get(frame.ip)
            .ok_or_else(|| MeleeError::internal("instruction pointer out of range"))?;
        frame.ip += 1;
        Ok(byte)
    }

    fn read_u16(&mut self) -> Result<usize> {
        let high = self.read_u8()? as usize;
        let low = self.read_u8()? as usize;
        Ok((high << 8) | low)
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

/// Integer division rounding toward negative infinity
fn floor_div(a: i64, b: i64) -> Option<i64> {
    let quotient = a.checked_div(b)?;
    if a % b != 0 && ((a < 0) != (b < 0)) {
        quotient.checked_sub(1)
    } else {
        Some(quotient)
    }
}

/// Ints and bools compare by value; null compares unequal to everything else
fn equality(left: &Value, right: &Value) -> Result<bool> {
    match (left, right) {
        (Value::Int(a), Value::Int(b)) => Ok(a == b),
        (Value::Bool(a), Value::Bool(b)) => Ok(a == b),
        (Value::Null, _) | (_, Value::Null) => {
            Ok(matches!((left, right), (Value::Null, Value::Null)))
        }
        _ => Err(operand_mismatch("comparable operands", left, right)),
    }
}

fn index_array(collection: &Value, index: &Value) -> Result<Value> {
    let Value::Array(items) = collection else {
        return Err(type_mismatch("array", collection.type_name()));
    };
    let Value::Int(i) = index else {
        return Err(type_mismatch("int index", index.type_name()));
    };
    let items = items.borrow();
    let value = usize::try_from(*i)
        .ok()
        .and_then(|i| items.get(i).cloned())
        .unwrap_or(Value::Null);
    Ok(value)
}

fn set_index(collection: &Value, index: &Value, value: Value) -> Result<()> {
    let Value::Array(items) = collection else {
        return Err(type_mismatch("array", collection.type_name()));
    };
    let Value::Int(i) = index else {
        return Err(type_mismatch("int index", index.type_name()));
    };
    let mut items = items.borrow_mut();
    let len = items.len();
    let slot = usize::try_from(*i)
        .ok()
        .filter(|&slot| slot < len)
        .ok_or(ErrorKind::IndexOutOfBounds(*i, len))?;
    items[slot] = value;
    Ok(())
}

/// `[pitch]`, `[pitch, duration]` or `[pitch, duration, velocity]`
fn build_note(value: &Value) -> Result<MidiNote> {
    let fields = int_fields(value).map_err(ErrorKind::InvalidNote)?;
    match fields.as_slice() {
        [pitch] => Ok(MidiNote::new(*pitch, 1, DEFAULT_VELOCITY)),
        [pitch, duration] => Ok(MidiNote::new(*pitch, *duration, DEFAULT_VELOCITY)),
        [pitch, duration, velocity] => Ok(MidiNote::new(*pitch, *duration, *velocity)),
        _ => Err(ErrorKind::InvalidNote(format!(
            "expected 1 to 3 fields, got {}",
            fields.len()
        ))
        .into()),
    }
}

/// `[key, value]`
fn build_cc(value: &Value) -> Result<MidiCc> {
    let fields = int_fields(value).map_err(ErrorKind::InvalidCc)?;
    match fields.as_slice() {
        [key, value] => Ok(MidiCc::new(*key, *value)),
        _ => Err(ErrorKind::InvalidCc(format!("expected 2 fields, got {}", fields.len())).into()),
    }
}

fn int_fields(value: &Value) -> std::result::Result<Vec<i64>, String> {
    let Value::Array(items) = value else {
        return Err(format!("expected an array, got {}", value.type_name()));
    };
    items
        .borrow()
        .iter()
        .map(|item| {
            item.as_int()
                .ok_or_else(|| format!("fields must be ints, got {}", item.type_name()))
        })
        .collect()
}

fn type_mismatch(expected: &str, got: &str) -> MeleeError {
    ErrorKind::TypeMismatch(expected.to_string(), got.to_string()).into()
}

fn operand_mismatch(expected: &str, left: &Value, right: &Value) -> MeleeError {
    type_mismatch(
        expected,
        &format!("{} and {}", left.type_name(), right.type_name()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::Compiler;
    use crate::lexer::Lexer;
    use crate::parser::Parser;
    use pretty_assertions::assert_eq;

    fn compile(source: &str) -> Bytecode {
        let tokens = Lexer::new(source).tokenize().unwrap();
        let program = Parser::new(tokens).parse().unwrap();
        Compiler::new().compile(&program).unwrap()
    }

    fn run_vm(source: &str) -> Value {
        let mut vm = Vm::new();
        vm.execute(&compile(source)).unwrap();
        vm.last_popped().clone()
    }

    fn run_err(source: &str) -> ErrorKind {
        run_with(Vm::new(), source)
    }

    fn run_with(mut vm: Vm, source: &str) -> ErrorKind {
        vm.execute(&compile(source)).unwrap_err().kind
    }

    #[test]
    fn test_vm_arithmetic() {
        assert_eq!(run_vm("1 + 2 * 3"), Value::Int(7));
        assert_eq!(run_vm("10 - 3"), Value::Int(7));
        assert_eq!(run_vm("-7 / 2"), Value::Int(-4));
        assert_eq!(run_vm("7 / -2"), Value::Int(-4));
        assert_eq!(run_vm("7 / 2"), Value::Int(3));
        assert_eq!(run_vm("-8 / 2"), Value::Int(-4));
        assert_eq!(run_vm("-7 % 2"), Value::Int(-1));
        assert_eq!(run_vm("-(3)"), Value::Int(-3));
    }

    #[test]
    fn test_floor_division_matches_definition() {
        for a in -9i64..=9 {
            for b in [-4i64, -3, -1, 1, 2, 5] {
                let expected = (a as f64 / b as f64).floor() as i64;
                assert_eq!(floor_div(a, b), Some(expected), "{} / {}", a, b);
            }
        }
        assert_eq!(floor_div(i64::MIN, -1), None);
    }

    #[test]
    fn test_vm_comparison_and_logic() {
        assert_eq!(run_vm("1 < 2"), Value::TRUE);
        assert_eq!(run_vm("2 <= 2"), Value::TRUE);
        assert_eq!(run_vm("5 > 3"), Value::TRUE);
        assert_eq!(run_vm("1 != 2"), Value::TRUE);
        assert_eq!(run_vm("true == false"), Value::FALSE);
        assert_eq!(run_vm("null == null"), Value::TRUE);
        assert_eq!(run_vm("[] == null"), Value::FALSE);
        assert_eq!(run_vm("!0"), Value::TRUE);
        assert_eq!(run_vm("1 && 0"), Value::FALSE);
        assert_eq!(run_vm("0 || []"), Value::TRUE);
    }

    #[test]
    fn test_vm_null_compares_by_nullness() {
        assert_eq!(run_vm("null != 0"), Value::TRUE);
        assert_eq!(run_vm("g := gen() { yield 1 }; s := g(); next s; (next s) == null"), Value::TRUE);
        assert!(matches!(run_err("1 == true"), ErrorKind::TypeMismatch(..)));
        assert!(matches!(run_err("[] == []"), ErrorKind::TypeMismatch(..)));
    }

    #[test]
    fn test_vm_logic_evaluates_both_sides() {
        assert_eq!(
            run_vm("calls := 0; f := fn() { calls += 1; return true }; false && f(); true || f(); calls"),
            Value::Int(2)
        );
    }

    #[test]
    fn test_vm_runtime_errors() {
        assert_eq!(run_err("1 / 0"), ErrorKind::DivisionByZero);
        assert_eq!(run_err("1 % 0"), ErrorKind::DivisionByZero);
        assert_eq!(
            run_err("1 + true"),
            ErrorKind::TypeMismatch("int and int".into(), "int and bool".into())
        );
        assert_eq!(
            run_err("1 == true"),
            ErrorKind::TypeMismatch("comparable operands".into(), "int and bool".into())
        );
        assert_eq!(run_err("9223372036854775807 + 1"), ErrorKind::IntegerOverflow);
        assert_eq!(run_err("x := 1; x(2)"), ErrorKind::NotCallable("int".into()));
        assert_eq!(run_err("a := [1]; a[3] = 0"), ErrorKind::IndexOutOfBounds(3, 1));
    }

    #[test]
    fn test_vm_if_else_is_an_expression() {
        assert_eq!(run_vm("if 1 > 2 { 10 } else { 20 }"), Value::Int(20));
        assert_eq!(run_vm("if 0 { 10 }"), Value::Null);
        assert_eq!(
            run_vm("x := 3; if x == 1 { 10 } else if x == 3 { 30 } else { 0 }"),
            Value::Int(30)
        );
    }

    #[test]
    fn test_vm_loops() {
        assert_eq!(
            run_vm("sum := 0; i := 1; while i <= 5 { sum += i; i += 1 }; sum"),
            Value::Int(15)
        );
        assert_eq!(
            run_vm("i := 0; loop { i += 1; if i == 4 { break } }; i"),
            Value::Int(4)
        );
        assert_eq!(
            run_vm("acc := 0; for x in [1, 2, 3, 4] { if x % 2 == 0 { continue }; acc += x }; acc"),
            Value::Int(4)
        );
    }

    #[test]
    fn test_vm_arrays() {
        assert_eq!(run_vm("[1, 2, 3][1]"), Value::Int(2));
        assert_eq!(run_vm("[1, 2, 3][5]"), Value::Null);
        assert_eq!(run_vm("[1, 2, 3][-1]"), Value::Null);
        assert_eq!(run_vm("a := [1, 2]; a[0] = 7"), Value::Int(7));
        assert_eq!(run_vm("a := [1, 2]; a[1] *= 5; a").to_string(), "[1, 10]");
        assert_eq!(run_vm("a := [1]; b := a; b[0] = 9; a[0]"), Value::Int(9));
    }

    #[test]
    fn test_vm_closures_and_recursion() {
        assert_eq!(
            run_vm("addTriad := fn(z) { return fn(y) { return fn(x) { return x + y + z } } }; addTriad(5)(4)(3)"),
            Value::Int(12)
        );
        assert_eq!(
            run_vm("fact := fn(n) { if n <= 1 { return 1 }; return n * fact(n - 1) }; fact(5)"),
            Value::Int(120)
        );
        assert_eq!(
            run_vm("fib := fn(n) { if n < 2 { return n }; return fib(n - 1) + fib(n - 2) }; fib(10)"),
            Value::Int(55)
        );
    }

    #[test]
    fn test_vm_arguments_are_fitted() {
        assert_eq!(run_vm("f := fn(a, b) { return b }; f(1)"), Value::Null);
        assert_eq!(run_vm("f := fn(a) { return a }; f(1, 2, 3)"), Value::Int(1));
    }

    #[test]
    fn test_vm_captured_write_is_visible_to_creator() {
        assert_eq!(
            run_vm("f := fn() { x := 5; fn() { x = 10 }(); return x }; f()"),
            Value::Int(10)
        );
        // reads without writes leave the creator's later assignments alone
        assert_eq!(
            run_vm("f := fn() { x := 0; g := fn() { return x }; x = 5; g(); return x }; f()"),
            Value::Int(5)
        );
    }

    #[test]
    fn test_vm_generators() {
        assert_eq!(
            run_vm("g := gen() { yield 1; yield 2 }; s := g(); [next s, next s, next s]").to_string(),
            "[1, 2, null]"
        );
        assert_eq!(
            run_vm("g := gen() { loop { yield 1; yield 2 } }; s := g(); [next s, next s, next s, next s]")
                .to_string(),
            "[1, 2, 1, 2]"
        );
    }

    #[test]
    fn test_vm_generator_locals_survive_suspension() {
        assert_eq!(
            run_vm(
                "counter := gen(start) { n := start; loop { yield n; n += 1 } }
                 a := counter(10); b := counter(100);
                 [next a, next b, next a, next b]"
            )
            .to_string(),
            "[10, 100, 11, 101]"
        );
    }

    #[test]
    fn test_vm_generator_pulls_from_generator() {
        assert_eq!(
            run_vm(
                "inner := gen() { yield 1; yield 2 }
                 outer := gen() { s := inner(); loop { v := next s; if v == null { return 0 }; yield v * 10 } }
                 o := outer();
                 [next o, next o, next o, next o]"
            )
            .to_string(),
            "[10, 20, 0, null]"
        );
    }

    #[test]
    fn test_vm_generator_running_itself_is_an_error() {
        assert_eq!(
            run_err("s := null; g := gen() { yield next s }; s = g(); next s"),
            ErrorKind::SequenceRunning
        );
    }

    #[test]
    fn test_vm_yield_outside_sequence() {
        assert_eq!(
            run_err("f := fn() { yield 1 }; f()"),
            ErrorKind::YieldOutsideSequence
        );
    }

    #[test]
    fn test_vm_music_values() {
        assert_eq!(run_vm("note [60]"), Value::Note(MidiNote::new(60, 1, 64)));
        assert_eq!(run_vm("note [60, 0, 200]").to_string(), "note(60, 1, 127)");
        assert_eq!(run_vm("skip 3").to_string(), "skip(3)");
        assert_eq!(run_vm("skip").to_string(), "skip(1)");
        assert_eq!(run_vm("cc [7, 300]"), Value::Cc(MidiCc { key: 7, value: 127 }));
        assert!(matches!(run_err("note []"), ErrorKind::InvalidNote(_)));
        assert!(matches!(run_err("note [true]"), ErrorKind::InvalidNote(_)));
        assert!(matches!(run_err("cc [1]"), ErrorKind::InvalidCc(_)));
        assert!(matches!(run_err("cc 5"), ErrorKind::InvalidCc(_)));
    }

    #[test]
    fn test_vm_frame_overflow() {
        let vm = Vm::with_config(VmConfig::default().with_max_frames(64));
        assert_eq!(
            run_with(vm, "f := fn(n) { return f(n + 1) }; f(0)"),
            ErrorKind::FrameOverflow(64)
        );
    }

    #[test]
    fn test_vm_stack_overflow() {
        let vm = Vm::with_config(VmConfig::default().with_max_stack(8));
        assert_eq!(run_with(vm, "[1, 2, 3, 4, 5, 6, 7, 8, 9]"), ErrorKind::StackOverflow(8));
    }

    #[test]
    fn test_vm_global_limit() {
        let vm = Vm::with_config(VmConfig::default().with_max_globals(1));
        assert_eq!(run_with(vm, "a := 1; b := 2"), ErrorKind::GlobalOutOfRange(1));
    }

    #[test]
    fn test_vm_globals_persist_across_executions() {
        let mut compiler = Compiler::new();
        let mut vm = Vm::new();
        for (source, expected) in [("x := 40", Value::Null), ("x + 2", Value::Int(42))] {
            let tokens = Lexer::new(source).tokenize().unwrap();
            let program = Parser::new(tokens).parse().unwrap();
            vm.execute(&compiler.compile(&program).unwrap()).unwrap();
            assert_eq!(vm.last_popped(), &expected);
        }
    }

    #[test]
    fn test_call_and_return_from_host() {
        let mut vm = Vm::new();
        vm.execute(&compile("add := fn(a, b) { return a + b }")).unwrap();
        let add = vm.global(0);
        let result = vm.call_and_return(add, vec![Value::Int(2), Value::Int(3)]).unwrap();
        assert_eq!(result, Value::Int(5));
    }

    #[test]
    fn test_take_next_from_host() {
        let mut vm = Vm::new();
        vm.execute(&compile("g := gen(n) { yield n; yield n + 1 }")).unwrap();
        let seq = vm.call_and_return(vm.global(0), vec![Value::Int(7)]).unwrap();
        assert!(matches!(seq, Value::Seq(_)));
        let pulled: Vec<Value> = (0..3).map(|_| vm.take_next(&seq).unwrap()).collect();
        assert_eq!(pulled, vec![Value::Int(7), Value::Int(8), Value::Null]);
    }
}
