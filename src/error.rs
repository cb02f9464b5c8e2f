//! Error taxonomy for the interpreter core.
//!
//! Mirrors the three exception families of the original design: control-flow
//! signals (not errors, but modeled as `Err` so they propagate through `?`),
//! compile-time errors, and runtime errors. Every variant carries the
//! [`SourceLocation`] of the node that raised it.

use crate::location::SourceLocation;
use thiserror::Error;

/// Non-error control-flow signals that unwind the execution tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    /// `exit` — stop the current top-level statement / subroutine.
    Exit,
    /// `break` — escape the innermost loop or subroutine.
    Break,
    /// `quit` — tell the driver to exit the process.
    Quit,
    /// Cooperative cancellation, raised when the terminate flag is observed.
    Terminate,
}

/// Compile-time errors: raised while the parser/Environment are constructing
/// the execution tree, before any node has executed.
#[derive(Debug, Error, Clone)]
pub enum CompileError {
    #[error("{location}: syntax error")]
    SyntaxError { location: SourceLocation },

    #[error("{location}: conflicting name \"{name}\"")]
    NamingConflict {
        location: SourceLocation,
        name: String,
    },

    #[error("{location}: using undefined var \"{name}\"")]
    UndefinedVar {
        location: SourceLocation,
        name: String,
    },

    #[error("{location}: no return value")]
    NoReturnValue { location: SourceLocation },

    #[error("{location}: failed to map address range {address:#x} size {size:#x} of device \"{device}\"")]
    MappingFailure {
        location: SourceLocation,
        address: u64,
        size: u64,
        device: String,
    },

    #[error("{location}: file \"{file}\" not found")]
    FileNotFound {
        location: SourceLocation,
        file: String,
    },

    #[error("{location}: illegal usage of non-const expression")]
    NonconstExpression { location: SourceLocation },

    #[error("{location}: division by zero")]
    ConstDivisionByZero { location: SourceLocation },
}

/// Runtime errors: raised while executing an already-constructed tree.
#[derive(Debug, Error, Clone)]
pub enum RuntimeError {
    #[error("{location}: division by zero")]
    DivisionByZero { location: SourceLocation },

    #[error("{location}: no mapping found for {bits} bit access to address {address:#x}")]
    NoMapping {
        location: SourceLocation,
        address: u64,
        bits: u32,
    },

    #[error("{location}: failed {bits} bit access to address {address:#x}")]
    BusError {
        location: SourceLocation,
        address: u64,
        bits: u32,
    },

    #[error("{location}: index {index} does not match size {size}")]
    OutOfBounds {
        location: SourceLocation,
        index: u64,
        size: u64,
    },

    #[error("{location}: failed to allocate array of size {size}")]
    OutOfMemory { location: SourceLocation, size: u64 },

    #[error("{location}: calling dropped subroutine")]
    DroppedSubroutine { location: SourceLocation },

    #[error("{location}: argument type mismatch")]
    ArgTypeMismatch { location: SourceLocation },
}

/// The union of every error an execution-tree node (or a construction-time
/// call into the Environment) can raise.
#[derive(Debug, Error, Clone)]
pub enum MempeekError {
    #[error(transparent)]
    Control(#[from] ControlSignalError),
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

/// Wraps [`ControlSignal`] so it can participate in `thiserror`'s `Error`
/// derive (plain enums without data still need a `Display` impl).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("control signal {0:?}")]
pub struct ControlSignalError(pub ControlSignal);

impl MempeekError {
    pub fn location(&self) -> Option<&SourceLocation> {
        match self {
            MempeekError::Control(_) => None,
            MempeekError::Compile(e) => Some(compile_location(e)),
            MempeekError::Runtime(e) => Some(runtime_location(e)),
        }
    }

    pub fn is_control(&self, signal: ControlSignal) -> bool {
        matches!(self, MempeekError::Control(ControlSignalError(s)) if *s == signal)
    }

    pub fn control(signal: ControlSignal) -> Self {
        MempeekError::Control(ControlSignalError(signal))
    }
}

fn compile_location(e: &CompileError) -> &SourceLocation {
    match e {
        CompileError::SyntaxError { location }
        | CompileError::NamingConflict { location, .. }
        | CompileError::UndefinedVar { location, .. }
        | CompileError::NoReturnValue { location }
        | CompileError::MappingFailure { location, .. }
        | CompileError::FileNotFound { location, .. }
        | CompileError::NonconstExpression { location }
        | CompileError::ConstDivisionByZero { location } => location,
    }
}

fn runtime_location(e: &RuntimeError) -> &SourceLocation {
    match e {
        RuntimeError::DivisionByZero { location }
        | RuntimeError::NoMapping { location, .. }
        | RuntimeError::BusError { location, .. }
        | RuntimeError::OutOfBounds { location, .. }
        | RuntimeError::OutOfMemory { location, .. }
        | RuntimeError::DroppedSubroutine { location }
        | RuntimeError::ArgTypeMismatch { location } => location,
    }
}

pub type MempeekResult<T> = Result<T, MempeekError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_signals_are_not_confused_with_each_other() {
        let err = MempeekError::control(ControlSignal::Break);
        assert!(err.is_control(ControlSignal::Break));
        assert!(!err.is_control(ControlSignal::Quit));
        assert!(err.location().is_none());
    }

    #[test]
    fn compile_and_runtime_errors_carry_their_location() {
        let loc = SourceLocation::builtin();
        let err: MempeekError = CompileError::UndefinedVar {
            location: loc.clone(),
            name: "x".to_string(),
        }
        .into();
        assert_eq!(err.location(), Some(&loc));

        let err: MempeekError = RuntimeError::DivisionByZero { location: loc.clone() }.into();
        assert_eq!(err.location(), Some(&loc));
    }
}
