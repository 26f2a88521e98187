//! Error types for Melee
//!
//! Every phase reports through [`MeleeError`], which pairs an [`ErrorKind`]
//! with the source span that caused it.

use crate::token::Span;
use std::fmt;
use thiserror::Error;

/// Broad classification of an error, used by hosts to decide how to present it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Syntax,
    Compile,
    Runtime,
    /// A broken VM or compiler invariant; signals a bug rather than a user mistake.
    Internal,
}

/// Error kinds in Melee
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ErrorKind {
    // Lexer errors
    #[error("unexpected character '{0}'")]
    UnexpectedCharacter(char),
    #[error("invalid integer '{0}'")]
    InvalidNumber(String),

    // Parser errors
    #[error("expected {0}, got '{1}'")]
    ExpectedToken(String, String),
    #[error("expected expression, got '{0}'")]
    ExpectedExpression(String),
    #[error("loop never yields, returns or breaks")]
    UnboundedLoop,

    // Compiler errors
    #[error("undefined variable '{0}'")]
    UndefinedVariable(String),
    #[error("invalid assignment target")]
    InvalidAssignmentTarget,
    #[error("cannot assign to '{0}'")]
    ReadOnlyBinding(String),
    #[error("'{0}' requires an operand")]
    MissingOperand(&'static str),
    #[error("break outside of loop")]
    BreakOutsideLoop,
    #[error("continue outside of loop")]
    ContinueOutsideLoop,
    #[error("return outside of function")]
    ReturnOutsideFunction,
    #[error("yield outside of function or generator")]
    YieldOutsideFunction,
    #[error("too many variables in one scope (limit {0})")]
    TooManyVariables(usize),
    #[error("too many constants (limit {0})")]
    TooManyConstants(usize),
    #[error("too many arguments or captures (limit {0})")]
    TooManyOperands(usize),
    #[error("jump target {0} out of range")]
    JumpTooFar(usize),

    // Runtime errors
    #[error("type mismatch: expected {0}, got {1}")]
    TypeMismatch(String, String),
    #[error("division by zero")]
    DivisionByZero,
    #[error("integer overflow")]
    IntegerOverflow,
    #[error("value of type {0} is not callable")]
    NotCallable(String),
    #[error("expected {0} arguments, got {1}")]
    WrongArity(String, usize),
    #[error("index {0} out of bounds for array of length {1}")]
    IndexOutOfBounds(i64, usize),
    #[error("invalid note: {0}")]
    InvalidNote(String),
    #[error("invalid cc: {0}")]
    InvalidCc(String),
    #[error("stack overflow (limit {0})")]
    StackOverflow(usize),
    #[error("maximum call depth exceeded (limit {0})")]
    FrameOverflow(usize),
    #[error("global slot {0} exceeds the variable limit")]
    GlobalOutOfRange(usize),
    #[error("sequence is already running")]
    SequenceRunning,
    #[error("yield outside of a running sequence")]
    YieldOutsideSequence,
    #[error("no 'main' generator defined")]
    MissingMain,
    #[error("'main' must be a generator, got {0}")]
    MainNotGenerator(String),
    #[error("calling 'main' must produce a sequence, got {0}")]
    MainNotSequence(String),
    #[error("{0}")]
    RuntimeError(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ErrorKind {
    pub fn category(&self) -> ErrorCategory {
        match self {
            ErrorKind::UnexpectedCharacter(_)
            | ErrorKind::InvalidNumber(_)
            | ErrorKind::ExpectedToken(..)
            | ErrorKind::ExpectedExpression(_)
            | ErrorKind::UnboundedLoop => ErrorCategory::Syntax,

            ErrorKind::UndefinedVariable(_)
            | ErrorKind::InvalidAssignmentTarget
            | ErrorKind::ReadOnlyBinding(_)
            | ErrorKind::MissingOperand(_)
            | ErrorKind::BreakOutsideLoop
            | ErrorKind::ContinueOutsideLoop
            | ErrorKind::ReturnOutsideFunction
            | ErrorKind::YieldOutsideFunction
            | ErrorKind::TooManyVariables(_)
            | ErrorKind::TooManyConstants(_)
            | ErrorKind::TooManyOperands(_)
            | ErrorKind::JumpTooFar(_) => ErrorCategory::Compile,

            ErrorKind::GlobalOutOfRange(_) | ErrorKind::Internal(_) => ErrorCategory::Internal,

            _ => ErrorCategory::Runtime,
        }
    }
}

/// A Melee error with location information
#[derive(Debug, Clone, PartialEq)]
pub struct MeleeError {
    pub kind: ErrorKind,
    pub span: Option<Span>,
    pub source_line: Option<String>,
}

impl MeleeError {
    pub fn new(kind: ErrorKind, span: Option<Span>) -> Self {
        Self {
            kind,
            span,
            source_line: None,
        }
    }

    pub fn at(kind: ErrorKind, span: Span) -> Self {
        Self::new(kind, Some(span))
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RuntimeError(message.into()), None)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal(message.into()), None)
    }

    pub fn category(&self) -> ErrorCategory {
        self.kind.category()
    }

    pub fn line(&self) -> Option<usize> {
        self.span.map(|s| s.line)
    }

    pub fn column(&self) -> Option<usize> {
        self.span.map(|s| s.column)
    }

    pub fn length(&self) -> usize {
        self.span.map(|s| s.len()).unwrap_or(0)
    }

    pub fn with_source(mut self, source: &str) -> Self {
        if let Some(span) = &self.span {
            let lines: Vec<&str> = source.lines().collect();
            if span.line > 0 && span.line <= lines.len() {
                self.source_line = Some(lines[span.line - 1].to_string());
            }
        }
        self
    }
}

impl fmt::Display for MeleeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self.category() {
            ErrorCategory::Syntax => "Syntax error",
            ErrorCategory::Compile => "Compile error",
            ErrorCategory::Runtime => "Runtime error",
            ErrorCategory::Internal => "Internal error",
        };
        if let Some(span) = &self.span {
            write!(f, "[line {}:{}] {}: {}", span.line, span.column, label, self.kind)?;

            if let Some(ref line) = self.source_line {
                write!(f, "\n  | {}", line)?;
                let carets = "^".repeat(span.len().max(1));
                write!(f, "\n  | {}{}", " ".repeat(span.column.saturating_sub(1)), carets)?;
            }
        } else {
            write!(f, "{}: {}", label, self.kind)?;
        }
        Ok(())
    }
}

impl std::error::Error for MeleeError {}

impl From<ErrorKind> for MeleeError {
    fn from(kind: ErrorKind) -> Self {
        MeleeError::new(kind, None)
    }
}

/// Result type for Melee operations
pub type Result<T> = std::result::Result<T, MeleeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_with_source() {
        let err = MeleeError::at(
            ErrorKind::UndefinedVariable("y".to_string()),
            Span::new(5, 6, 1, 6),
        )
        .with_source("x := y + 1");
        let text = err.to_string();
        assert!(text.contains("[line 1:6] Compile error: undefined variable 'y'"));
        assert!(text.ends_with("     ^"));
        assert_eq!(err.length(), 1);
    }

    #[test]
    fn test_categories() {
        assert_eq!(ErrorKind::UnboundedLoop.category(), ErrorCategory::Syntax);
        assert_eq!(ErrorKind::ContinueOutsideLoop.category(), ErrorCategory::Compile);
        assert_eq!(ErrorKind::DivisionByZero.category(), ErrorCategory::Runtime);
        assert_eq!(ErrorKind::FrameOverflow(8).category(), ErrorCategory::Runtime);
        assert_eq!(
            ErrorKind::Internal("bad slot".into()).category(),
            ErrorCategory::Internal
        );
    }
}
