#![forbid(unsafe_code)]

use oath_ast::{Annotation, Decl, Expr, ExprKind, Span, Spanned};

use crate::diagnostics::DiagnosticSink;
use crate::effects::EffectSet;
use crate::symbols::ScopeId;
use crate::types::Type;

/// Stable index into a unit's declaration arena. All cross-references inside
/// the engine go through these rather than names, so relaxation passes can
/// revisit declarations in place.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeclId(pub u32);

impl DeclId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A pre/post-condition or invariant clause: predicate plus the message
/// reported when it fails.
#[derive(Clone, Debug, PartialEq)]
pub struct ContractClause {
    pub span: Span,
    pub predicate: Expr,
    pub message: String,
}

/// A `@verify` assertion; the predicate may be a `forAll` quantifier.
#[derive(Clone, Debug, PartialEq)]
pub struct VerifyClause {
    pub span: Span,
    pub predicate: Expr,
}

/// Interpreted annotation set for one declaration. Raw key/argument pairs
/// are interpreted once at ingestion and threaded explicitly from there on;
/// nothing later in the pipeline re-reads ambient annotation state.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Metadata {
    pub pure: bool,
    /// `None` means unannotated, which is distinct from an explicit empty
    /// `@effects()` declaration only in diagnostics wording.
    pub declared_effects: Option<Vec<Spanned<String>>>,
    pub requires: Vec<ContractClause>,
    pub ensures: Vec<ContractClause>,
    pub invariants: Vec<ContractClause>,
    pub verifies: Vec<VerifyClause>,
    pub deprecated: Option<String>,
    /// `@internal` members sit outside the public-mutation invariant boundary.
    pub internal: bool,
    /// Keys the engine does not interpret; kept opaque.
    pub raw: Vec<Annotation>,
}

impl Metadata {
    /// Interpretation without a sink; deprecation warnings are dropped. Used
    /// where metadata is re-derived for lookup, never for ingestion.
    pub fn parse_quiet(annotations: &[Annotation]) -> Self {
        let mut sink = DiagnosticSink::new("");
        Self::from_annotations(annotations, &mut sink)
    }

    pub fn from_annotations(annotations: &[Annotation], sink: &mut DiagnosticSink) -> Self {
        let mut meta = Metadata::default();
        for ann in annotations {
            match ann.key.node.as_str() {
                "pure" => meta.pure = true,
                "effects" => {
                    let mut labels = Vec::new();
                    for arg in &ann.args {
                        if let ExprKind::Str(label) = &arg.kind {
                            labels.push(Spanned::new(arg.span, label.clone()));
                        }
                    }
                    meta.declared_effects = Some(labels);
                }
                "requires" => meta.requires.push(contract_clause(ann, "precondition")),
                "ensures" => meta.ensures.push(contract_clause(ann, "postcondition")),
                "invariant" => meta.invariants.push(contract_clause(ann, "invariant")),
                "verify" => {
                    if let Some(predicate) = ann.args.first() {
                        meta.verifies.push(VerifyClause {
                            span: ann.span,
                            predicate: predicate.clone(),
                        });
                    }
                }
                "deprecated" => {
                    let msg = match ann.args.first().map(|a| &a.kind) {
                        Some(ExprKind::Str(s)) => s.clone(),
                        _ => "declaration is deprecated".to_string(),
                    };
                    meta.deprecated = Some(msg);
                }
                "internal" => meta.internal = true,
                // Legacy spelling kept for older frontends.
                "sideEffects" => {
                    sink.deprecated(
                        "annotation '@sideEffects' is deprecated; use '@effects'",
                        ann.span,
                    );
                    let mut labels = Vec::new();
                    for arg in &ann.args {
                        if let ExprKind::Str(label) = &arg.kind {
                            labels.push(Spanned::new(arg.span, label.clone()));
                        }
                    }
                    meta.declared_effects = Some(labels);
                }
                _ => meta.raw.push(ann.clone()),
            }
        }
        meta
    }
}

fn contract_clause(ann: &Annotation, what: &str) -> ContractClause {
    let predicate = ann
        .args
        .first()
        .cloned()
        .unwrap_or_else(|| oath_ast::Expr {
            span: ann.span,
            kind: ExprKind::Bool(true),
        });
    let message = match ann.args.get(1).map(|a| &a.kind) {
        Some(ExprKind::Str(s)) => s.clone(),
        _ => format!("{what} '{}' failed", ann.key.node),
    };
    ContractClause {
        span: ann.span,
        predicate,
        message,
    }
}

/// One arena slot. `ty` starts as `Type::Pending` and is filled in by the
/// resolver's relaxation passes; `observed_effects` is filled by the effect
/// stage.
#[derive(Clone, Debug)]
pub struct DeclEntry {
    pub id: DeclId,
    pub name: String,
    pub qualified: String,
    pub span: Span,
    pub scope: ScopeId,
    pub ast: Decl,
    pub meta: Metadata,
    pub ty: Type,
    pub declared_effects: EffectSet,
    pub observed_effects: Option<EffectSet>,
}

/// Per-unit declaration arena. Allocated up front during ingestion; only the
/// resolver stages mutate entries, and only to fill in inferred facts.
#[derive(Debug, Default)]
pub struct DeclTable {
    entries: Vec<DeclEntry>,
}

impl DeclTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc(
        &mut self,
        name: &str,
        qualified: String,
        span: Span,
        scope: ScopeId,
        ast: Decl,
        meta: Metadata,
    ) -> DeclId {
        let id = DeclId(self.entries.len() as u32);
        self.entries.push(DeclEntry {
            id,
            name: name.to_string(),
            qualified,
            span,
            scope,
            ast,
            meta,
            ty: Type::Pending,
            declared_effects: EffectSet::empty(),
            observed_effects: None,
        });
        id
    }

    pub fn get(&self, id: DeclId) -> &DeclEntry {
        &self.entries[id.index()]
    }

    pub fn get_mut(&mut self, id: DeclId) -> &mut DeclEntry {
        &mut self.entries[id.index()]
    }

    pub fn ids(&self) -> Vec<DeclId> {
        (0..self.entries.len() as u32).map(DeclId).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DeclEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// What a unit exports about one top-level declaration. Signatures are kept
/// as type expressions; the importing unit resolves them against its own
/// scope plus this index, which is why exported signatures must stick to
/// primitives, structural types, and qualified names.
#[derive(Clone, Debug)]
pub enum ExportSignature {
    Func {
        params: Vec<oath_ast::TypeExpr>,
        ret: Option<oath_ast::TypeExpr>,
    },
    TypeAlias {
        body: Option<oath_ast::TypeExpr>,
    },
    Var {
        ty: Option<oath_ast::TypeExpr>,
    },
    Namespace,
    Opaque,
}

#[derive(Clone, Debug)]
pub struct ExportInfo {
    pub unit: String,
    pub pure: bool,
    pub declared_effects: Vec<String>,
    pub deprecated: Option<String>,
    pub signature: ExportSignature,
}

/// Read-only global symbol index built in the serial ingestion pass and
/// shared by every parallel unit worker afterwards.
#[derive(Debug, Default)]
pub struct GlobalIndex {
    exports: std::collections::HashMap<String, ExportInfo>,
}

impl GlobalIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, qualified: String, info: ExportInfo) {
        self.exports.insert(qualified, info);
    }

    pub fn get(&self, qualified: &str) -> Option<&ExportInfo> {
        self.exports.get(qualified)
    }

    pub fn contains(&self, qualified: &str) -> bool {
        self.exports.contains_key(qualified)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.exports.keys().map(String::as_str)
    }
}
