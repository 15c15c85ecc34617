// ABOUTME: Error types: compile-time diagnostics and runtime error/unknown values

use std::fmt;
use thiserror::Error;

/// Severity of a compile-time diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Error => write!(f, "ERROR"),
            Severity::Warning => write!(f, "WARNING"),
        }
    }
}

/// A compile-time diagnostic with a byte-offset span into the source.
///
/// Diagnostics are host signals. They are never folded into runtime
/// values; only `Value::Error` flows through evaluation.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
    /// Byte offset where the offending region starts.
    pub start: u32,
    /// Byte offset one past the end of the offending region.
    pub end: u32,
}

impl Diagnostic {
    pub fn error(message: impl Into<String>, start: u32, end: u32) -> Self {
        Diagnostic {
            severity: Severity::Error,
            message: message.into(),
            start,
            end,
        }
    }

    pub fn warning(message: impl Into<String>, start: u32, end: u32) -> Self {
        Diagnostic {
            severity: Severity::Warning,
            message: message.into(),
            start,
            end,
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} (at offset {})", self.severity, self.message, self.start)
    }
}

/// An ordered bag of diagnostics produced by one compile phase.
#[derive(Debug, Clone, Default)]
pub struct DiagnosticSet(pub Vec<Diagnostic>);

impl DiagnosticSet {
    pub fn new() -> Self {
        DiagnosticSet(Vec::new())
    }

    pub fn push(&mut self, d: Diagnostic) {
        self.0.push(d);
    }

    /// True when the set carries no error-severity entries. Warnings do
    /// not fail a compile.
    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|d| d.severity != Severity::Error)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Diagnostic> {
        self.0.iter()
    }
}

impl fmt::Display for DiagnosticSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, d) in self.0.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{}", d)?;
        }
        Ok(())
    }
}

/// Host-boundary errors surfaced by compile, plan, and configuration.
#[derive(Error, Debug)]
pub enum CelError {
    #[error("syntax error:\n{0}")]
    Syntax(DiagnosticSet),

    #[error("check error:\n{0}")]
    Check(DiagnosticSet),

    #[error("policy compile error:\n{0}")]
    Policy(DiagnosticSet),

    #[error("planning failed: {0}")]
    Plan(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl CelError {
    pub fn plan(message: impl Into<String>) -> Self {
        CelError::Plan(message.into())
    }

    pub fn config(message: impl Into<String>) -> Self {
        CelError::Config(message.into())
    }
}

/// The runtime error subkinds carried by `Value::Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    DivisionByZero,
    Overflow,
    IndexOutOfRange,
    NoSuchKey,
    NoSuchField,
    NoSuchOverload,
    Conversion,
    Interrupted,
    InvalidArgument,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::DivisionByZero => "division by zero",
            ErrorKind::Overflow => "overflow",
            ErrorKind::IndexOutOfRange => "index out of range",
            ErrorKind::NoSuchKey => "no such key",
            ErrorKind::NoSuchField => "no such field",
            ErrorKind::NoSuchOverload => "no such overload",
            ErrorKind::Conversion => "conversion error",
            ErrorKind::Interrupted => "interrupted",
            ErrorKind::InvalidArgument => "invalid argument",
        };
        write!(f, "{}", name)
    }
}

/// Payload of a `Value::Error`. A datum, not a Rust error: evaluation
/// never unwinds, errors flow through the expression tree as values.
#[derive(Debug, Clone)]
pub struct ErrorValue {
    pub kind: ErrorKind,
    pub message: String,
}

impl ErrorValue {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        ErrorValue {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for ErrorValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.kind)
        } else {
            write!(f, "{}: {}", self.kind, self.message)
        }
    }
}

/// Payload of a `Value::Unknown`: the expression node identifiers whose
/// inputs were declared present-or-unknown by a partial activation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnknownSet {
    pub ids: Vec<u64>,
}

impl UnknownSet {
    pub fn single(id: u64) -> Self {
        UnknownSet { ids: vec![id] }
    }

    /// Merge two unknown sets, preserving order and dropping duplicates.
    pub fn merge(&self, other: &UnknownSet) -> UnknownSet {
        let mut ids = self.ids.clone();
        for id in &other.ids {
            if !ids.contains(id) {
                ids.push(*id);
            }
        }
        UnknownSet { ids }
    }
}

impl fmt::Display for UnknownSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown{:?}", self.ids)
    }
}
