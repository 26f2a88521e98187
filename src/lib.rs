//! Melee - a small language for writing MIDI sequences
//!
//! Programs define generators that yield notes, control changes and rests.
//! A host compiles the source once, starts the `main` generator and pulls one
//! value per clock tick.

pub mod token;
pub mod lexer;
pub mod parser;
pub mod ast;
pub mod error;
pub mod symbols;
pub mod bytecode;
pub mod value;
pub mod compiler;
pub mod config;
pub mod vm;
pub mod builtins;
pub mod runtime;

pub use bytecode::Bytecode;
pub use compiler::Compiler;
pub use config::{VmConfig, VmHooks};
pub use error::{ErrorCategory, ErrorKind, MeleeError, Result};
pub use lexer::Lexer;
pub use parser::Parser;
pub use runtime::Runtime;
pub use value::Value;
pub use vm::Vm;

/// Convenience function to run Melee code and get the value of its last
/// expression statement
pub fn run(source: &str) -> Result<Value> {
    Runtime::new()
        .exec(source)
        .map_err(|mut errors| errors.swap_remove(0))
}

/// Version of the Melee language
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
