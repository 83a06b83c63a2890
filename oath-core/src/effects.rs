#![forbid(unsafe_code)]

use std::collections::{BTreeSet, HashMap};

use oath_ast::{Block, Expr, ExprKind, Span, Stmt};

use crate::error::{ErrorKind, SemanticError};

/// Set of effect labels. Empty means pure. Ordered so display and equality
/// are deterministic.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EffectSet {
    labels: BTreeSet<String>,
}

impl EffectSet {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_labels<I, S>(labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            labels: labels.into_iter().map(Into::into).collect(),
        }
    }

    pub fn insert(&mut self, label: impl Into<String>) {
        self.labels.insert(label.into());
    }

    pub fn contains(&self, label: &str) -> bool {
        self.labels.contains(label)
    }

    pub fn union_with(&mut self, other: &EffectSet) {
        for l in &other.labels {
            self.labels.insert(l.clone());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.labels.iter().map(String::as_str)
    }

    pub fn display(&self) -> String {
        if self.labels.is_empty() {
            "pure".to_string()
        } else {
            self.labels
                .iter()
                .cloned()
                .collect::<Vec<_>>()
                .join(", ")
        }
    }
}

/// Single-level effect hierarchy: a declared parent label implicitly permits
/// any of its children, never the other way around. Checking is against the
/// declared set, not an inferred closure.
#[derive(Clone, Debug)]
pub struct EffectRegistry {
    parent_of: HashMap<String, String>,
}

impl Default for EffectRegistry {
    fn default() -> Self {
        let mut parent_of = HashMap::new();
        for child in ["network", "filesystem", "database", "console"] {
            parent_of.insert(child.to_string(), "io".to_string());
        }
        Self { parent_of }
    }
}

impl EffectRegistry {
    pub fn with_parent(mut self, child: impl Into<String>, parent: impl Into<String>) -> Self {
        self.parent_of.insert(child.into(), parent.into());
        self
    }

    pub fn parent(&self, label: &str) -> Option<&str> {
        self.parent_of.get(label).map(String::as_str)
    }

    /// Does `declared` permit an operation carrying `label`?
    pub fn permits(&self, declared: &EffectSet, label: &str) -> bool {
        if declared.contains(label) {
            return true;
        }
        self.parent(label)
            .is_some_and(|p| declared.contains(p))
    }

    /// Every label of `observed` permitted by `declared`.
    pub fn subset(&self, observed: &EffectSet, declared: &EffectSet) -> bool {
        observed.iter().all(|l| self.permits(declared, l))
    }
}

/// Resolution of one call site as seen by the effect checker.
pub enum CalleeEffects {
    /// Primitive operation with an intrinsic effect (or none).
    Primitive(Option<String>),
    /// User function; its *declared* set is what propagates, per the
    /// call-chain rule.
    Declared(EffectSet),
    /// Not a call the effect checker can see through; contributes nothing.
    Opaque,
}

/// Environment the effect checker walks bodies against. Lookup goes through
/// the caller so the checker itself stays independent of symbol machinery.
pub trait EffectLookup {
    fn callee_effects(&self, callee: &Expr) -> CalleeEffects;
}

/// Computes the observed effect set of a body: effects of primitive
/// operations used directly, unioned with the declared sets of every callee.
/// Isolation blocks are checked inline against their own declared set and
/// still contribute their interior to the enclosing observed set.
pub struct EffectChecker<'a, L: EffectLookup> {
    registry: &'a EffectRegistry,
    lookup: &'a L,
    errors: Vec<SemanticError>,
}

impl<'a, L: EffectLookup> EffectChecker<'a, L> {
    pub fn new(registry: &'a EffectRegistry, lookup: &'a L) -> Self {
        Self {
            registry,
            lookup,
            errors: Vec::new(),
        }
    }

    pub fn finish(self) -> Vec<SemanticError> {
        self.errors
    }

    /// Observed set of a whole body.
    pub fn observe_block(&mut self, block: &Block) -> EffectSet {
        let mut observed = EffectSet::empty();
        for stmt in &block.stmts {
            self.observe_stmt(stmt, &mut observed);
        }
        if let Some(tail) = &block.tail {
            self.observe_expr(tail, &mut observed);
        }
        observed
    }

    fn observe_stmt(&mut self, stmt: &Stmt, observed: &mut EffectSet) {
        match stmt {
            Stmt::Let(l) => self.observe_expr(&l.init, observed),
            Stmt::Assign(a) => self.observe_expr(&a.expr, observed),
            Stmt::If(i) => {
                self.observe_expr(&i.cond, observed);
                observed.union_with(&self.observe_block(&i.then_block));
                if let Some(else_block) = &i.else_block {
                    observed.union_with(&self.observe_block(else_block));
                }
            }
            Stmt::While(w) => {
                self.observe_expr(&w.cond, observed);
                observed.union_with(&self.observe_block(&w.body));
            }
            Stmt::Return(r) => {
                if let Some(v) = &r.value {
                    self.observe_expr(v, observed);
                }
            }
            Stmt::Isolate(iso) => {
                let inner_declared =
                    EffectSet::from_labels(iso.effects.iter().map(|e| e.node.clone()));
                let inner = self.observe_block(&iso.body);
                for label in inner.iter() {
                    if !self.registry.permits(&inner_declared, label) {
                        self.errors.push(SemanticError::new(
                            ErrorKind::EffectViolation,
                            format!(
                                "operation with effect '{label}' is not permitted inside an isolation block declaring [{}]",
                                inner_declared.display()
                            ),
                            iso.span,
                        ));
                    }
                }
                observed.union_with(&inner);
            }
            Stmt::Expr(e) => self.observe_expr(e, observed),
        }
    }

    pub fn observe_expr(&mut self, expr: &Expr, observed: &mut EffectSet) {
        match &expr.kind {
            ExprKind::Call { callee, args } => {
                self.record_call(callee, expr.span, observed);
                for a in args {
                    self.observe_expr(a, observed);
                }
            }
            ExprKind::MethodCall { recv, args, .. } => {
                // Method effect sets are checked by the typestate/template
                // stages against their declaring signatures.
                self.observe_expr(recv, observed);
                for a in args {
                    self.observe_expr(a, observed);
                }
            }
            ExprKind::Unary { expr, .. } | ExprKind::Cast { expr, .. } => {
                self.observe_expr(expr, observed)
            }
            ExprKind::Binary { left, right, .. } => {
                self.observe_expr(left, observed);
                self.observe_expr(right, observed);
            }
            ExprKind::Field { base, .. } => self.observe_expr(base, observed),
            ExprKind::RecordLit { fields, .. } => {
                for (_, v) in fields {
                    self.observe_expr(v, observed);
                }
            }
            ExprKind::ArrayLit(items) | ExprKind::TupleLit(items) => {
                for item in items {
                    self.observe_expr(item, observed);
                }
            }
            ExprKind::ForAll { guard, body, .. } => {
                if let Some(g) = guard {
                    self.observe_expr(g, observed);
                }
                self.observe_expr(body, observed);
            }
            ExprKind::Ident(_)
            | ExprKind::Int(_)
            | ExprKind::Float(_)
            | ExprKind::Decimal { .. }
            | ExprKind::Bool(_)
            | ExprKind::Str(_) => {}
        }
    }

    fn record_call(&mut self, callee: &Expr, _span: Span, observed: &mut EffectSet) {
        match self.lookup.callee_effects(callee) {
            CalleeEffects::Primitive(Some(effect)) => observed.insert(effect),
            CalleeEffects::Primitive(None) => {}
            CalleeEffects::Declared(set) => observed.union_with(&set),
            CalleeEffects::Opaque => {}
        }
    }
}

/// Declared-versus-observed verdict for one function, with the offending
/// labels spelled out for the diagnostic.
pub fn check_declared_superset(
    registry: &EffectRegistry,
    declared: &EffectSet,
    observed: &EffectSet,
    pure: bool,
    fn_name: &str,
    span: Span,
) -> Vec<SemanticError> {
    let mut errors = Vec::new();
    if pure && !observed.is_empty() {
        errors.push(SemanticError::new(
            ErrorKind::EffectViolation,
            format!(
                "function '{fn_name}' is declared @pure but its observed effect set is [{}]",
                observed.display()
            ),
            span,
        ));
        return errors;
    }
    for label in observed.iter() {
        if !registry.permits(declared, label) {
            errors.push(SemanticError::new(
                ErrorKind::EffectViolation,
                format!(
                    "function '{fn_name}' performs an operation with effect '{label}' not covered by its declared set [{}]",
                    declared.display()
                ),
                span,
            ));
        }
    }
    errors
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parent_permits_children() {
        let reg = EffectRegistry::default();
        let declared = EffectSet::from_labels(["io"]);
        assert!(reg.permits(&declared, "network"));
        assert!(reg.permits(&declared, "filesystem"));
        assert!(reg.permits(&declared, "io"));
    }

    #[test]
    fn child_does_not_permit_parent_or_sibling() {
        let reg = EffectRegistry::default();
        let declared = EffectSet::from_labels(["network"]);
        assert!(!reg.permits(&declared, "io"));
        assert!(!reg.permits(&declared, "filesystem"));
    }

    #[test]
    fn subset_uses_hierarchy() {
        let reg = EffectRegistry::default();
        let declared = EffectSet::from_labels(["io", "database"]);
        let observed = EffectSet::from_labels(["network", "database"]);
        assert!(reg.subset(&observed, &declared));
        let too_much = EffectSet::from_labels(["network", "clock"]);
        assert!(!reg.subset(&too_much, &declared));
    }

    #[test]
    fn display_is_stable() {
        let set = EffectSet::from_labels(["network", "database"]);
        assert_eq!(set.display(), "database, network");
        assert_eq!(EffectSet::empty().display(), "pure");
    }
}
