// src/errors.rs
//! Unification errors (E3xxx).
//!
//! The unifier collects errors instead of returning them: a single
//! `try_unify` call may produce several. Variants carry type handles;
//! rendering them against the arena is the embedding checker's job.

use miette::Diagnostic;
use thiserror::Error;

use crate::span::Span;
use crate::type_arena::TypeId;

#[derive(Error, Debug, Diagnostic, Clone, PartialEq)]
pub enum UnifyError {
    #[error(
        "types are not compatible{}",
        .reason.as_deref().map(|r| format!(": {r}")).unwrap_or_default()
    )]
    #[diagnostic(code(E3001))]
    TypeMismatch {
        wanted: TypeId,
        given: TypeId,
        reason: Option<String>,
        cause: Option<Box<TypeError>>,
    },

    #[error("table is missing properties: {}", .properties.join(", "))]
    #[diagnostic(code(E3002))]
    MissingProperties {
        wanted: TypeId,
        given: TypeId,
        properties: Vec<String>,
        kind: MissingPropertiesKind,
    },

    #[error("key '{name}' not found")]
    #[diagnostic(code(E3003))]
    UnknownProperty { ty: TypeId, name: String },

    #[error("expected {expected} values, got {actual} ({context})")]
    #[diagnostic(code(E3004))]
    CountMismatch {
        expected: usize,
        actual: usize,
        context: CountContext,
    },

    #[error("type contains a reference to itself")]
    #[diagnostic(
        code(E3005),
        help("recursive types must go through a table, class, or function")
    )]
    OccursCheckFailed,

    #[error("{message}")]
    #[diagnostic(code(E3006))]
    GenericError { message: String },

    #[error("code is too complex to typecheck")]
    #[diagnostic(
        code(E3007),
        help("consider adding type annotations to simplify inference")
    )]
    UnificationTooComplex,

    #[error("cannot add {kind} to table")]
    #[diagnostic(code(E3008))]
    CannotExtendTable { ty: TypeId, kind: CannotExtendKind },
}

/// Whether the offending properties were absent from the subtype
/// (`Missing`) or present on the subtype but not the supertype (`Extra`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissingPropertiesKind {
    Missing,
    Extra,
}

/// What kind of member could not be added to a closed table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CannotExtendKind {
    Property,
    Indexer,
}

impl std::fmt::Display for CannotExtendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CannotExtendKind::Property => write!(f, "property"),
            CannotExtendKind::Indexer => write!(f, "indexer"),
        }
    }
}

/// Which sequence a count mismatch was found in. `Result` swaps the
/// expected/actual roles in the reported error, since there the subtype
/// holds the values the caller is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountContext {
    Arg,
    Result,
    Return,
}

impl std::fmt::Display for CountContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CountContext::Arg => write!(f, "arguments"),
            CountContext::Result => write!(f, "results"),
            CountContext::Return => write!(f, "return values"),
        }
    }
}

/// A unification error pinned to a source location.
#[derive(Debug, Clone, PartialEq)]
pub struct TypeError {
    pub error: UnifyError,
    pub span: Span,
}

impl TypeError {
    pub fn new(error: UnifyError, span: Span) -> Self {
        Self { error, span }
    }
}

impl std::fmt::Display for TypeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.error)
    }
}
