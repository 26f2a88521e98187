//! Runtime value types for Melee

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use crate::bytecode::{Instructions, Spans};
use crate::error::Result;
use crate::symbols::SymbolKind;
use crate::vm::{ExecutionState, Vm};

/// Runtime values in Melee
#[derive(Clone)]
pub enum Value {
    Null,

    Int(i64),

    /// Only two boolean values exist, so value equality is identity
    Bool(bool),

    /// Mutable array shared by reference
    Array(Rc<RefCell<Vec<Value>>>),

    /// Compiled function or generator body, as stored in the constant pool
    Callable(Rc<Callable>),

    /// Callable bound to the free variables it captured
    Closure(Rc<Closure>),

    /// Built-in host function
    Native(&'static NativeFn),

    /// Suspended generator coroutine
    Seq(Rc<RefCell<Seq>>),

    /// Host-backed sequence without its own call stack
    VirtualSeq(Rc<VirtualSeq>),

    Note(MidiNote),

    Cc(MidiCc),

    /// A note from an earlier step that is still sounding
    Hold(Hold),
}

impl Value {
    pub const TRUE: Value = Value::Bool(true);
    pub const FALSE: Value = Value::Bool(false);

    pub fn array(items: Vec<Value>) -> Value {
        Value::Array(Rc::new(RefCell::new(items)))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Int(_) => "int",
            Value::Bool(_) => "bool",
            Value::Array(_) => "array",
            Value::Callable(c) => match c.kind {
                CallableKind::Fn => "fn",
                CallableKind::Gen => "gen",
            },
            Value::Closure(c) => match c.func.kind {
                CallableKind::Fn => "fn",
                CallableKind::Gen => "gen",
            },
            Value::Native(_) => "native fn",
            Value::Seq(_) => "seq",
            Value::VirtualSeq(_) => "seq",
            Value::Note(_) => "note",
            Value::Cc(_) => "cc",
            Value::Hold(_) => "hold",
        }
    }

    /// Nonzero ints and everything but `null` and `false` are truthy
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Int(n) => *n != 0,
            _ => true,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// Anything `next` can pull a value from
    pub fn is_sequence(&self) -> bool {
        matches!(self, Value::Seq(_) | Value::VirtualSeq(_))
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Int(n) => write!(f, "{}", n),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.borrow().iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Value::Callable(c) => write!(f, "<{}>", c.repr),
            Value::Closure(c) => write!(f, "<{}>", c.func.repr),
            Value::Native(n) => write!(f, "<native fn {}>", n.name),
            Value::Seq(seq) => {
                if seq.borrow().done {
                    write!(f, "<seq done>")
                } else {
                    write!(f, "<seq>")
                }
            }
            Value::VirtualSeq(v) => write!(f, "<seq {}>", v.label),
            Value::Note(n) => write!(f, "{}", n),
            Value::Cc(c) => write!(f, "{}", c),
            Value::Hold(h) => write!(f, "{}", h),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => Rc::ptr_eq(a, b) || *a.borrow() == *b.borrow(),
            (Value::Callable(a), Value::Callable(b)) => Rc::ptr_eq(a, b),
            (Value::Closure(a), Value::Closure(b)) => Rc::ptr_eq(a, b),
            (Value::Native(a), Value::Native(b)) => a.name == b.name,
            (Value::Seq(a), Value::Seq(b)) => Rc::ptr_eq(a, b),
            (Value::VirtualSeq(a), Value::VirtualSeq(b)) => Rc::ptr_eq(a, b),
            (Value::Note(a), Value::Note(b)) => a == b,
            (Value::Cc(a), Value::Cc(b)) => a == b,
            (Value::Hold(a), Value::Hold(b)) => a == b,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallableKind {
    Fn,
    /// Calling a generator builds a [`Seq`] instead of running the body
    Gen,
}

/// Where a captured variable lives in the scope that created the closure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capture {
    pub kind: SymbolKind,
    pub index: usize,
}

/// A compiled function or generator body
#[derive(Debug)]
pub struct Callable {
    pub kind: CallableKind,
    pub instructions: Instructions,
    pub spans: Spans,
    pub repr: String,
    pub num_locals: usize,
    pub num_params: usize,
    pub captures: Vec<Capture>,
}

/// Runtime function instance
#[derive(Debug)]
pub struct Closure {
    pub func: Rc<Callable>,
    pub vars: RefCell<Vec<Value>>,
    /// Captured slots assigned since the last return, in first-write order
    written: RefCell<Vec<usize>>,
    /// Id of the frame that executed the CLOSURE instruction
    pub origin_frame: u64,
}

impl Closure {
    pub fn new(func: Rc<Callable>, vars: Vec<Value>, origin_frame: u64) -> Self {
        Self {
            func,
            vars: RefCell::new(vars),
            written: RefCell::new(Vec::new()),
            origin_frame,
        }
    }

    pub fn get_var(&self, index: usize) -> Option<Value> {
        self.vars.borrow().get(index).cloned()
    }

    /// Store a captured variable and remember it for write-back.
    /// Returns false when `index` is not a captured slot.
    pub fn set_var(&self, index: usize, value: Value) -> bool {
        let mut vars = self.vars.borrow_mut();
        let Some(slot) = vars.get_mut(index) else {
            return false;
        };
        *slot = value;
        let mut written = self.written.borrow_mut();
        if !written.contains(&index) {
            written.push(index);
        }
        true
    }

    /// Drain the slots written since the last call, with their current values
    pub fn take_written(&self) -> Vec<(usize, Value)> {
        let indices = std::mem::take(&mut *self.written.borrow_mut());
        let vars = self.vars.borrow();
        indices
            .into_iter()
            .filter_map(|i| vars.get(i).map(|v| (i, v.clone())))
            .collect()
    }
}

/// A generator coroutine handle. Owns the saved machine state while suspended.
#[derive(Debug, Default)]
pub struct Seq {
    /// `None` while the coroutine is running or once it has finished
    pub state: Option<ExecutionState>,
    pub done: bool,
}

pub type PullFn = Box<dyn FnMut(&mut Vm) -> Result<Value>>;

/// A sequence driven by a host pull function
pub struct VirtualSeq {
    pub label: &'static str,
    pub pull: RefCell<PullFn>,
}

impl VirtualSeq {
    pub fn new(label: &'static str, pull: PullFn) -> Self {
        Self {
            label,
            pull: RefCell::new(pull),
        }
    }
}

impl fmt::Debug for VirtualSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<seq {}>", self.label)
    }
}

/// Native function type
pub type NativeFnPtr = fn(&mut Vm, &[Value]) -> Result<Value>;

/// Native/built-in function
pub struct NativeFn {
    pub name: &'static str,
    /// `None` means the function validates its own argument count
    pub arity: Option<usize>,
    pub func: NativeFnPtr,
}

impl fmt::Debug for NativeFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<native fn {}>", self.name)
    }
}

pub const REST_PITCH: i64 = -1;
pub const DEFAULT_VELOCITY: i64 = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MidiNote {
    pub pitch: i64,
    pub duration: i64,
    pub velocity: i64,
}

impl MidiNote {
    pub fn new(pitch: i64, duration: i64, velocity: i64) -> Self {
        Self {
            pitch,
            duration: duration.max(1),
            velocity: velocity.clamp(0, 127),
        }
    }

    pub fn rest(duration: i64) -> Self {
        Self::new(REST_PITCH, duration, 0)
    }

    pub fn is_rest(&self) -> bool {
        self.pitch == REST_PITCH
    }
}

impl fmt::Display for MidiNote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_rest() {
            write!(f, "skip({})", self.duration)
        } else {
            write!(f, "note({}, {}, {})", self.pitch, self.duration, self.velocity)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MidiCc {
    pub key: i64,
    pub value: i64,
}

impl MidiCc {
    pub fn new(key: i64, value: i64) -> Self {
        Self {
            key: key.clamp(0, 127),
            value: value.clamp(0, 127),
        }
    }
}

impl fmt::Display for MidiCc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cc({}, {})", self.key, self.value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hold {
    pub pitch: i64,
    pub duration: i64,
}

impl fmt::Display for Hold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "hold({}, {})", self.pitch, self.duration)
    }
}
