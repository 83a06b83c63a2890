#![forbid(unsafe_code)]

use crate::error::{ErrorKind, SemanticError, Stage};

/// Diagnostic severity level.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Severity {
    /// Rejects the unit; later stages do not run on it.
    Error,
    /// Reported, never blocks progression.
    Warning,
}

impl Severity {
    pub fn display(&self) -> &'static str {
        match self {
            Severity::Error => "error",
            Severity::Warning => "warning",
        }
    }
}

/// One entry in the ordered per-unit diagnostics list.
#[derive(Clone, Debug)]
pub struct DiagnosticEntry {
    pub severity: Severity,
    pub unit: String,
    pub decl: Option<String>,
    pub error: SemanticError,
}

impl DiagnosticEntry {
    pub fn display(&self) -> String {
        let where_ = match &self.decl {
            Some(d) => format!("{}::{}", self.unit, d),
            None => self.unit.clone(),
        };
        format!(
            "{}: [{}] {}: {}",
            self.severity.display(),
            where_,
            self.error.kind,
            self.error.message
        )
    }
}

/// Ordered diagnostics sink for a single compilation unit.
///
/// Errors accumulate within a stage so one run surfaces as many independent
/// problems as possible; `stage_open` is what keeps a later stage from
/// starting once an earlier one has failed.
#[derive(Debug)]
pub struct DiagnosticSink {
    unit: String,
    current_decl: Option<String>,
    entries: Vec<DiagnosticEntry>,
    first_fatal_stage: Option<Stage>,
}

impl DiagnosticSink {
    pub fn new(unit: impl Into<String>) -> Self {
        Self {
            unit: unit.into(),
            current_decl: None,
            entries: Vec::new(),
            first_fatal_stage: None,
        }
    }

    pub fn unit(&self) -> &str {
        &self.unit
    }

    /// Names the declaration under analysis so subsequent entries carry it.
    pub fn set_decl(&mut self, decl: Option<String>) {
        self.current_decl = decl;
    }

    pub fn error(&mut self, err: SemanticError) {
        let stage = err.kind.stage();
        self.first_fatal_stage = Some(match self.first_fatal_stage {
            Some(s) if s <= stage => s,
            _ => stage,
        });
        self.entries.push(DiagnosticEntry {
            severity: Severity::Error,
            unit: self.unit.clone(),
            decl: self.current_decl.clone(),
            error: err,
        });
    }

    pub fn warn(&mut self, err: SemanticError) {
        self.entries.push(DiagnosticEntry {
            severity: Severity::Warning,
            unit: self.unit.clone(),
            decl: self.current_decl.clone(),
            error: err,
        });
    }

    pub fn deprecated(&mut self, message: impl Into<String>, span: oath_ast::Span) {
        self.warn(SemanticError::new(
            ErrorKind::DeprecatedAnnotation,
            message,
            span,
        ));
    }

    pub fn has_errors(&self) -> bool {
        self.entries
            .iter()
            .any(|e| e.severity == Severity::Error)
    }

    /// True when `stage` may run: no earlier stage recorded a fatal error.
    pub fn stage_open(&self, stage: Stage) -> bool {
        match self.first_fatal_stage {
            None => true,
            Some(fatal) => stage <= fatal,
        }
    }

    pub fn entries(&self) -> &[DiagnosticEntry] {
        &self.entries
    }

    pub fn errors(&self) -> impl Iterator<Item = &DiagnosticEntry> {
        self.entries
            .iter()
            .filter(|e| e.severity == Severity::Error)
    }

    pub fn into_entries(self) -> Vec<DiagnosticEntry> {
        self.entries
    }
}
