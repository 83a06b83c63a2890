#![forbid(unsafe_code)]

use std::fmt;

use miette::Diagnostic;
use oath_ast::Span;
use thiserror::Error;

/// Stage-tagged error kind. The engine collects these per unit rather than
/// aborting on the first failure; the stage tag drives gating (a stage does
/// not start on a unit whose prior stage produced a fatal error).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    // symbol stage
    DuplicateSymbol,
    UnresolvedSymbol,
    AmbiguousImport,
    // type stage
    ConstraintViolation,
    TypeMismatch,
    UnresolvedRecursion,
    // effect stage
    EffectViolation,
    ImpureContract,
    // template / typestate stage
    IncompleteInstance,
    SignatureMismatch,
    TemplateConflict,
    InvalidTransition,
    // verification stage
    VerificationFailure,
    VerificationTimeout,
    NoGeneratorForDomain,
    // warnings
    DeprecatedAnnotation,
}

impl ErrorKind {
    pub fn stage(&self) -> Stage {
        match self {
            ErrorKind::DuplicateSymbol
            | ErrorKind::UnresolvedSymbol
            | ErrorKind::AmbiguousImport => Stage::Symbols,
            ErrorKind::ConstraintViolation
            | ErrorKind::TypeMismatch
            | ErrorKind::UnresolvedRecursion => Stage::Types,
            ErrorKind::EffectViolation | ErrorKind::ImpureContract => Stage::Effects,
            ErrorKind::IncompleteInstance
            | ErrorKind::SignatureMismatch
            | ErrorKind::TemplateConflict
            | ErrorKind::InvalidTransition => Stage::Templates,
            ErrorKind::VerificationFailure
            | ErrorKind::VerificationTimeout
            | ErrorKind::NoGeneratorForDomain => Stage::Verification,
            ErrorKind::DeprecatedAnnotation => Stage::Symbols,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ErrorKind::DuplicateSymbol => "DuplicateSymbol",
            ErrorKind::UnresolvedSymbol => "UnresolvedSymbol",
            ErrorKind::AmbiguousImport => "AmbiguousImport",
            ErrorKind::ConstraintViolation => "ConstraintViolation",
            ErrorKind::TypeMismatch => "TypeMismatch",
            ErrorKind::UnresolvedRecursion => "UnresolvedRecursion",
            ErrorKind::EffectViolation => "EffectViolation",
            ErrorKind::ImpureContract => "ImpureContract",
            ErrorKind::IncompleteInstance => "IncompleteInstance",
            ErrorKind::SignatureMismatch => "SignatureMismatch",
            ErrorKind::TemplateConflict => "TemplateConflict",
            ErrorKind::InvalidTransition => "InvalidTransition",
            ErrorKind::VerificationFailure => "VerificationFailure",
            ErrorKind::VerificationTimeout => "VerificationTimeout",
            ErrorKind::NoGeneratorForDomain => "NoGeneratorForDomain",
            ErrorKind::DeprecatedAnnotation => "DeprecatedAnnotation",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Analysis stages in pipeline order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Symbols,
    Types,
    Effects,
    Templates,
    Verification,
}

#[derive(Clone, Debug, Error, Diagnostic)]
#[error("{kind}: {message}")]
#[diagnostic(code(oath::sema))]
pub struct SemanticError {
    pub kind: ErrorKind,
    pub message: String,
    #[label]
    pub span: Span,
}

impl SemanticError {
    pub fn new(kind: ErrorKind, message: impl Into<String>, span: Span) -> Self {
        Self {
            kind,
            message: message.into(),
            span,
        }
    }
}
