#![forbid(unsafe_code)]

mod config;
mod diagnostics;
mod effects;
mod error;
mod program;
mod resolve;
mod sema;
mod symbols;
mod templates;
mod types;
mod typestate;

pub use config::EngineOptions;
pub use diagnostics::{DiagnosticEntry, DiagnosticSink, Severity};
pub use effects::{
    check_declared_superset, CalleeEffects, EffectChecker, EffectLookup, EffectRegistry, EffectSet,
};
pub use error::{ErrorKind, SemanticError, Stage};
pub use program::{
    ContractClause, DeclEntry, DeclId, DeclTable, ExportInfo, ExportSignature, GlobalIndex,
    Metadata, VerifyClause,
};
pub use resolve::{
    const_fold_int, declared_effect_set, literal_value, pred_subset, substitute, Resolver,
};
pub use sema::{analyze_unit, build_global_index, AnalyzedUnit, RuntimeGuard};
pub use symbols::{find_similar, ScopeId, ScopeKind, SymbolRef, SymbolTable};
pub use templates::{ExpandedInstance, ExpandedOp, Provided};
pub use types::{
    decimal_cmp, format_decimal, ConstValue, Field, LenExpr, Predicate, Prim, Type,
};
pub use typestate::TypestateChecker;
