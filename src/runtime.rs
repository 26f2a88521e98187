//! Host driver
//!
//! A [`Runtime`] is one session: a compiler whose symbol table and constant
//! pool grow with every compiled snippet, and a VM whose globals line up with
//! that symbol table. A sequencer starts `main` once and then calls
//! [`Runtime::clock`] for every tick.

use tracing::{debug, trace};

use crate::bytecode::Bytecode;
use crate::compiler::Compiler;
use crate::config::{VmConfig, VmHooks};
use crate::error::{ErrorKind, MeleeError, Result};
use crate::lexer::Lexer;
use crate::parser::Parser;
use crate::value::{CallableKind, Value};
use crate::vm::Vm;

/// Name of the generator a sequencer starts
pub const MAIN: &str = "main";

pub struct Runtime {
    compiler: Compiler,
    vm: Vm,
    main: Option<Value>,
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl Runtime {
    pub fn new() -> Self {
        Self::with_config(VmConfig::default())
    }

    pub fn with_config(config: VmConfig) -> Self {
        Self {
            compiler: Compiler::new(),
            vm: Vm::with_config(config),
            main: None,
        }
    }

    pub fn set_hooks(&mut self, hooks: VmHooks) {
        self.vm.set_hooks(hooks);
    }

    pub fn compiler(&self) -> &Compiler {
        &self.compiler
    }

    pub fn vm(&self) -> &Vm {
        &self.vm
    }

    /// Compile a snippet against the session's symbols. On failure the
    /// session is left as it was before the snippet.
    pub fn compile(&mut self, source: &str) -> std::result::Result<Bytecode, Vec<MeleeError>> {
        let program = parse(source).map_err(|err| vec![err.with_source(source)])?;
        self.compiler.compile(&program).map_err(|errors| {
            errors
                .into_iter()
                .map(|err| err.with_source(source))
                .collect()
        })
    }

    /// Report every compile error without touching the session
    pub fn check(&self, source: &str) -> Vec<MeleeError> {
        let program = match parse(source) {
            Ok(program) => program,
            Err(err) => return vec![err.with_source(source)],
        };
        let mut scratch = self.compiler.clone();
        match scratch.compile(&program) {
            Ok(_) => Vec::new(),
            Err(errors) => errors
                .into_iter()
                .map(|err| err.with_source(source))
                .collect(),
        }
    }

    /// Compile and run a snippet, returning the value of its last expression
    /// statement
    pub fn exec(&mut self, source: &str) -> std::result::Result<Value, Vec<MeleeError>> {
        let bytecode = self.compile(source)?;
        self.vm
            .execute(&bytecode)
            .map_err(|err| vec![err.with_source(source)])?;
        Ok(self.vm.last_popped().clone())
    }

    /// Call the global `main` generator and keep its sequence for [`next`](Self::next)
    pub fn start(&mut self, args: Vec<Value>) -> Result<Value> {
        let main = self
            .compiler
            .symbols()
            .global(MAIN)
            .map(|symbol| self.vm.global(symbol.index))
            .unwrap_or(Value::Null);

        match &main {
            Value::Null => return Err(ErrorKind::MissingMain.into()),
            Value::Closure(closure) if closure.func.kind == CallableKind::Gen => {}
            other => {
                return Err(ErrorKind::MainNotGenerator(other.type_name().to_string()).into())
            }
        }

        let seq = self.vm.call_and_return(main, args)?;
        if !seq.is_sequence() {
            return Err(ErrorKind::MainNotSequence(seq.type_name().to_string()).into());
        }
        debug!("main started");
        self.main = Some(seq.clone());
        Ok(seq)
    }

    /// Pull the next value out of the started `main` sequence
    pub fn next(&mut self) -> Result<Value> {
        let seq = self
            .main
            .clone()
            .ok_or_else(|| MeleeError::runtime("main has not been started"))?;
        self.vm.take_next(&seq)
    }

    /// Advance one tick and return the events to play. Arrays are flattened;
    /// rests and null produce nothing.
    pub fn clock(&mut self) -> Result<Vec<Value>> {
        let value = self.next()?;
        let mut events = Vec::new();
        collect_events(value, &mut events)?;
        trace!(events = events.len(), "clock");
        Ok(events)
    }
}

fn parse(source: &str) -> Result<crate::ast::Program> {
    let tokens = Lexer::new(source).tokenize()?;
    Parser::new(tokens).parse()
}

fn collect_events(value: Value, events: &mut Vec<Value>) -> Result<()> {
    match value {
        Value::Null => {}
        Value::Note(note) if note.is_rest() => {}
        Value::Hold(hold) if hold.pitch < 0 => {}
        Value::Note(_) | Value::Cc(_) | Value::Hold(_) => events.push(value),
        Value::Array(items) => {
            let items = items.borrow().clone();
            for item in items {
                collect_events(item, events)?;
            }
        }
        other => {
            return Err(ErrorKind::TypeMismatch(
                "note, cc, hold or array".to_string(),
                other.type_name().to_string(),
            )
            .into())
        }
    }
    Ok(())
}
