#![forbid(unsafe_code)]

use std::collections::HashMap;

use oath_ast::Span;

use crate::error::{ErrorKind, SemanticError};
use crate::program::DeclId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ScopeId(pub u32);

impl ScopeId {
    fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScopeKind {
    Unit,
    Namespace,
    Function,
    Block,
}

/// Where a name points: a declaration in this unit's arena, or an exported
/// declaration of another unit, reached through the read-only global index.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SymbolRef {
    Local(DeclId),
    Global(String),
}

#[derive(Clone, Debug)]
struct ImportBinding {
    name: String,
    target: SymbolRef,
    span: Span,
}

#[derive(Debug)]
struct Scope {
    parent: Option<ScopeId>,
    #[allow(dead_code)]
    kind: ScopeKind,
    bindings: HashMap<String, DeclId>,
    imports: Vec<ImportBinding>,
}

/// Scope tree for one compilation unit. A child scope may shadow but never
/// removes a parent binding; imports are aliasing edges, not copies.
#[derive(Debug)]
pub struct SymbolTable {
    scopes: Vec<Scope>,
    namespace_scopes: HashMap<DeclId, ScopeId>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self {
            scopes: vec![Scope {
                parent: None,
                kind: ScopeKind::Unit,
                bindings: HashMap::new(),
                imports: Vec::new(),
            }],
            namespace_scopes: HashMap::new(),
        }
    }

    pub fn root(&self) -> ScopeId {
        ScopeId(0)
    }

    pub fn push_scope(&mut self, parent: ScopeId, kind: ScopeKind) -> ScopeId {
        let id = ScopeId(self.scopes.len() as u32);
        self.scopes.push(Scope {
            parent: Some(parent),
            kind,
            bindings: HashMap::new(),
            imports: Vec::new(),
        });
        id
    }

    /// Registers the scope that holds a namespace's members, so qualified
    /// paths can be resolved into it.
    pub fn bind_namespace_scope(&mut self, decl: DeclId, scope: ScopeId) {
        self.namespace_scopes.insert(decl, scope);
    }

    pub fn namespace_scope(&self, decl: DeclId) -> Option<ScopeId> {
        self.namespace_scopes.get(&decl).copied()
    }

    pub fn declare(
        &mut self,
        scope: ScopeId,
        name: &str,
        decl: DeclId,
        span: Span,
    ) -> Result<(), SemanticError> {
        let bindings = &mut self.scopes[scope.index()].bindings;
        if bindings.contains_key(name) {
            return Err(SemanticError::new(
                ErrorKind::DuplicateSymbol,
                format!("'{name}' is already declared in this scope"),
                span,
            ));
        }
        bindings.insert(name.to_string(), decl);
        Ok(())
    }

    pub fn add_import(&mut self, scope: ScopeId, name: &str, target: SymbolRef, span: Span) {
        self.scopes[scope.index()].imports.push(ImportBinding {
            name: name.to_string(),
            target,
            span,
        });
    }

    /// Walks enclosing scopes outward, then the import edges visible from
    /// them. The nearest binding wins; imports only apply when no scope in
    /// the chain binds the name directly.
    pub fn resolve(&self, name: &str, from: ScopeId) -> Result<SymbolRef, SemanticError> {
        self.resolve_spanned(name, from, oath_ast::span(0, 0))
    }

    pub fn resolve_spanned(
        &self,
        name: &str,
        from: ScopeId,
        span: Span,
    ) -> Result<SymbolRef, SemanticError> {
        let mut cursor = Some(from);
        while let Some(id) = cursor {
            let scope = &self.scopes[id.index()];
            if let Some(decl) = scope.bindings.get(name) {
                return Ok(SymbolRef::Local(*decl));
            }
            cursor = scope.parent;
        }

        // No direct binding; consult import edges along the chain.
        let mut hits: Vec<&ImportBinding> = Vec::new();
        let mut cursor = Some(from);
        while let Some(id) = cursor {
            let scope = &self.scopes[id.index()];
            hits.extend(scope.imports.iter().filter(|i| i.name == name));
            cursor = scope.parent;
        }
        match hits.len() {
            0 => {}
            1 => return Ok(hits[0].target.clone()),
            _ => {
                let first = &hits[0].target;
                if hits.iter().all(|h| &h.target == first) {
                    return Ok(first.clone());
                }
                return Err(SemanticError::new(
                    ErrorKind::AmbiguousImport,
                    format!(
                        "'{name}' is imported {} times with incompatible targets",
                        hits.len()
                    ),
                    hits.last().map(|h| h.span).unwrap_or(span),
                ));
            }
        }

        let mut message = format!("unresolved name '{name}'");
        let similar = find_similar(name, self.visible_names(from).iter().map(String::as_str));
        if !similar.is_empty() {
            message.push_str(&format!("; did you mean '{}'?", similar.join("', '")));
        }
        Err(SemanticError::new(
            ErrorKind::UnresolvedSymbol,
            message,
            span,
        ))
    }

    /// Resolves a member name inside a namespace's own scope only; no outward
    /// walk, a qualified path never falls back to the caller's scope chain.
    pub fn resolve_in_namespace(
        &self,
        ns: DeclId,
        name: &str,
        span: Span,
    ) -> Result<SymbolRef, SemanticError> {
        let scope = self.namespace_scopes.get(&ns).ok_or_else(|| {
            SemanticError::new(
                ErrorKind::UnresolvedSymbol,
                format!("'{name}' resolved through something that is not a namespace"),
                span,
            )
        })?;
        self.scopes[scope.index()]
            .bindings
            .get(name)
            .map(|d| SymbolRef::Local(*d))
            .ok_or_else(|| {
                SemanticError::new(
                    ErrorKind::UnresolvedSymbol,
                    format!("namespace has no member '{name}'"),
                    span,
                )
            })
    }

    pub fn visible_names(&self, from: ScopeId) -> Vec<String> {
        let mut names = Vec::new();
        let mut cursor = Some(from);
        while let Some(id) = cursor {
            let scope = &self.scopes[id.index()];
            names.extend(scope.bindings.keys().cloned());
            names.extend(scope.imports.iter().map(|i| i.name.clone()));
            cursor = scope.parent;
        }
        names
    }
}

impl Default for SymbolTable {
    fn default() -> Self {
        Self::new()
    }
}

fn levenshtein(a: &str, b: &str) -> usize {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    let (m, n) = (a.len(), b.len());
    let mut prev: Vec<usize> = (0..=n).collect();
    let mut curr = vec![0; n + 1];
    for i in 1..=m {
        curr[0] = i;
        for j in 1..=n {
            let cost = usize::from(a[i - 1] != b[j - 1]);
            curr[j] = (prev[j] + 1).min(curr[j - 1] + 1).min(prev[j - 1] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[n]
}

/// Up to 3 names within an edit distance that scales with identifier length.
pub fn find_similar<'a, I>(target: &str, candidates: I) -> Vec<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let max_dist = (target.len() / 3).max(1);
    let mut matches: Vec<(usize, String)> = candidates
        .into_iter()
        .filter(|c| *c != target)
        .filter_map(|c| {
            let d = levenshtein(target, c);
            (d <= max_dist).then(|| (d, c.to_string()))
        })
        .collect();
    matches.sort();
    matches.dedup();
    matches.truncate(3);
    matches.into_iter().map(|(_, s)| s).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use oath_ast::span;

    #[test]
    fn child_shadows_parent() {
        let mut table = SymbolTable::new();
        let root = table.root();
        table.declare(root, "x", DeclId(0), span(0, 1)).unwrap();
        let inner = table.push_scope(root, ScopeKind::Block);
        table.declare(inner, "x", DeclId(1), span(5, 1)).unwrap();

        assert_eq!(table.resolve("x", inner).unwrap(), SymbolRef::Local(DeclId(1)));
        assert_eq!(table.resolve("x", root).unwrap(), SymbolRef::Local(DeclId(0)));
    }

    #[test]
    fn duplicate_in_same_scope_fails() {
        let mut table = SymbolTable::new();
        let root = table.root();
        table.declare(root, "x", DeclId(0), span(0, 1)).unwrap();
        let err = table.declare(root, "x", DeclId(1), span(5, 1)).unwrap_err();
        assert_eq!(err.kind, ErrorKind::DuplicateSymbol);
    }

    #[test]
    fn local_binding_wins_over_import() {
        let mut table = SymbolTable::new();
        let root = table.root();
        table.add_import(
            root,
            "helper",
            SymbolRef::Global("util.helper".into()),
            span(0, 6),
        );
        table.declare(root, "helper", DeclId(3), span(10, 6)).unwrap();
        assert_eq!(
            table.resolve("helper", root).unwrap(),
            SymbolRef::Local(DeclId(3))
        );
    }

    #[test]
    fn conflicting_imports_are_ambiguous() {
        let mut table = SymbolTable::new();
        let root = table.root();
        table.add_import(
            root,
            "log",
            SymbolRef::Global("io.log".into()),
            span(0, 3),
        );
        table.add_import(
            root,
            "log",
            SymbolRef::Global("math.log".into()),
            span(10, 3),
        );
        let err = table.resolve("log", root).unwrap_err();
        assert_eq!(err.kind, ErrorKind::AmbiguousImport);
    }

    #[test]
    fn repeated_identical_imports_are_fine() {
        let mut table = SymbolTable::new();
        let root = table.root();
        for off in [0, 10] {
            table.add_import(
                root,
                "log",
                SymbolRef::Global("io.log".into()),
                span(off, 3),
            );
        }
        assert_eq!(
            table.resolve("log", root).unwrap(),
            SymbolRef::Global("io.log".into())
        );
    }

    #[test]
    fn unresolved_suggests_similar() {
        let mut table = SymbolTable::new();
        let root = table.root();
        table.declare(root, "connect", DeclId(0), span(0, 7)).unwrap();
        let err = table.resolve("conect", root).unwrap_err();
        assert_eq!(err.kind, ErrorKind::UnresolvedSymbol);
        assert!(err.message.contains("connect"));
    }
}
