#![forbid(unsafe_code)]

use std::collections::HashMap;

use oath_ast::{
    DeclKind, Expr, ExprKind, Ident, Span, TypeExpr, TypeExprKind, UnaryOp,
};

use crate::config::EngineOptions;
use crate::effects::{EffectRegistry, EffectSet};
use crate::error::{ErrorKind, SemanticError};
use crate::program::{DeclId, DeclTable, ExportSignature, GlobalIndex, Metadata};
use crate::symbols::{ScopeId, SymbolRef, SymbolTable};
use crate::types::{ConstValue, Field, LenExpr, Predicate, Prim, Type};

/// Type & constraint resolver for one unit. Declarations resolve by repeated
/// relaxation over the arena: a reference to an in-progress declaration
/// yields `Type::Pending`, the pass is retried, and a cycle that stops
/// making progress is reported as `UnresolvedRecursion`.
pub struct Resolver<'a> {
    pub table: &'a mut DeclTable,
    pub symbols: &'a SymbolTable,
    pub global: &'a GlobalIndex,
    pub registry: &'a EffectRegistry,
    pub options: &'a EngineOptions,
    conformance: HashMap<(String, String), Result<(), String>>,
}

impl<'a> Resolver<'a> {
    pub fn new(
        table: &'a mut DeclTable,
        symbols: &'a SymbolTable,
        global: &'a GlobalIndex,
        registry: &'a EffectRegistry,
        options: &'a EngineOptions,
    ) -> Self {
        Self {
            table,
            symbols,
            global,
            registry,
            options,
            conformance: HashMap::new(),
        }
    }

    /// Runs declaration typing to a fixed point. Collected errors are
    /// returned rather than short-circuiting so one pass surfaces as many
    /// independent problems as possible.
    pub fn run_fixed_point(&mut self) -> Vec<SemanticError> {
        let mut errors = Vec::new();
        let ids = self.table.ids();

        for _pass in 0..self.options.max_type_passes {
            let mut changed = false;
            let mut all_resolved = true;

            for &id in &ids {
                if self.table.get(id).ty.is_resolved() {
                    continue;
                }
                match self.compute_decl_type(id) {
                    Ok(ty) if ty.is_resolved() => {
                        let entry = self.table.get_mut(id);
                        entry.ty = ty;
                        changed = true;
                    }
                    Ok(_pending) => {
                        all_resolved = false;
                    }
                    Err(err) => {
                        errors.push(err);
                        let entry = self.table.get_mut(id);
                        entry.ty = Type::Error;
                        changed = true;
                    }
                }
            }

            if all_resolved {
                break;
            }
            if !changed {
                break;
            }
        }

        for &id in &ids {
            let entry = self.table.get(id);
            if !entry.ty.is_resolved() {
                let (name, span) = (entry.name.clone(), entry.span);
                errors.push(SemanticError::new(
                    ErrorKind::UnresolvedRecursion,
                    format!("declaration '{name}' never converged to a concrete type"),
                    span,
                ));
                self.table.get_mut(id).ty = Type::Error;
            }
        }

        errors
    }

    fn compute_decl_type(&mut self, id: DeclId) -> Result<Type, SemanticError> {
        let entry = self.table.get(id);
        let scope = entry.scope;
        let span = entry.span;
        let name = entry.name.clone();
        let ast = entry.ast.clone();
        let meta = entry.meta.clone();

        match &ast.kind {
            DeclKind::Import(_) | DeclKind::Namespace(_) => Ok(Type::unit()),
            // Templates and typestates are not value types; their operations
            // are resolved at instantiation / protocol-checking time.
            DeclKind::Template(_) | DeclKind::Typestate(_) => Ok(Type::unit()),
            DeclKind::Instance(_) => Ok(Type::unit()),
            DeclKind::Var(var) => {
                if let Some(te) = &var.ty {
                    self.resolve_type_expr(te, scope)
                } else if let Some(init) = &var.init {
                    match literal_value(init) {
                        Some(v) => Ok(Type::Prim(v.prim())),
                        None => Err(SemanticError::new(
                            ErrorKind::TypeMismatch,
                            format!("cannot infer a type for '{name}' without an annotation"),
                            span,
                        )),
                    }
                } else {
                    Err(SemanticError::new(
                        ErrorKind::TypeMismatch,
                        format!("'{name}' has neither a type annotation nor an initializer"),
                        span,
                    ))
                }
            }
            DeclKind::Func(func) => {
                let params_map = self.bind_type_params(&func.type_params, scope)?;
                let mut params = Vec::with_capacity(func.params.len());
                for p in &func.params {
                    params.push(self.resolve_type_expr_with(&p.ty, scope, &params_map)?);
                }
                let ret = match &func.ret {
                    Some(te) => self.resolve_type_expr_with(te, scope, &params_map)?,
                    None => Type::unit(),
                };
                Ok(Type::Function {
                    params,
                    ret: Box::new(ret),
                    effects: declared_effect_set(&meta),
                })
            }
            DeclKind::Type(td) => {
                if !td.members.is_empty() || td.body.is_none() {
                    // Nominal type; its unapplied form carries its own
                    // parameters as placeholders.
                    let args = td
                        .type_params
                        .iter()
                        .map(|p| Type::Param {
                            name: p.name.node.clone(),
                            bound: None,
                        })
                        .collect();
                    Ok(Type::Nominal {
                        decl: id,
                        name: name.clone(),
                        args,
                    })
                } else {
                    let params_map = self.bind_type_params(&td.type_params, scope)?;
                    let body = td.body.as_ref().expect("alias body");
                    self.resolve_type_expr_with(body, scope, &params_map)
                }
            }
        }
    }

    pub(crate) fn bind_type_params(
        &mut self,
        params: &[oath_ast::TypeParamDecl],
        scope: ScopeId,
    ) -> Result<HashMap<String, Type>, SemanticError> {
        let mut map = HashMap::new();
        for p in params {
            let bound = match &p.bound {
                Some(b) => Some(Box::new(self.resolve_type_expr(b, scope)?)),
                None => None,
            };
            map.insert(
                p.name.node.clone(),
                Type::Param {
                    name: p.name.node.clone(),
                    bound,
                },
            );
        }
        Ok(map)
    }

    pub fn resolve_type_expr(
        &mut self,
        te: &TypeExpr,
        scope: ScopeId,
    ) -> Result<Type, SemanticError> {
        self.resolve_type_expr_with(te, scope, &HashMap::new())
    }

    pub fn resolve_type_expr_with(
        &mut self,
        te: &TypeExpr,
        scope: ScopeId,
        params: &HashMap<String, Type>,
    ) -> Result<Type, SemanticError> {
        match &te.kind {
            TypeExprKind::Name { path, args } => {
                self.resolve_name_path(path, args, scope, params, te.span)
            }
            TypeExprKind::Range { base, lo, hi } => {
                let base_ty = self.resolve_type_expr_with(base, scope, params)?;
                if base_ty.is_pending() {
                    return Ok(Type::Pending);
                }
                let lo_v = const_fold_int(lo).ok_or_else(|| {
                    SemanticError::new(
                        ErrorKind::ConstraintViolation,
                        "range bounds must be constant integers",
                        lo.span,
                    )
                })?;
                let hi_v = const_fold_int(hi).ok_or_else(|| {
                    SemanticError::new(
                        ErrorKind::ConstraintViolation,
                        "range bounds must be constant integers",
                        hi.span,
                    )
                })?;
                if lo_v > hi_v {
                    return Err(SemanticError::new(
                        ErrorKind::ConstraintViolation,
                        format!("empty range {lo_v}..{hi_v}"),
                        te.span,
                    ));
                }
                match base_ty.base() {
                    Type::Prim(Prim::Int) | Type::Prim(Prim::Float) | Type::Prim(Prim::Decimal) => {}
                    other => {
                        return Err(SemanticError::new(
                            ErrorKind::ConstraintViolation,
                            format!("range constraint over non-numeric base {}", other.display()),
                            te.span,
                        ));
                    }
                }
                Ok(Type::Constrained {
                    base: Box::new(base_ty),
                    pred: Predicate::Range { lo: lo_v, hi: hi_v },
                })
            }
            TypeExprKind::Pattern { base, pattern } => {
                let base_ty = self.resolve_type_expr_with(base, scope, params)?;
                if base_ty.is_pending() {
                    return Ok(Type::Pending);
                }
                if base_ty.base() != &Type::string() {
                    return Err(SemanticError::new(
                        ErrorKind::ConstraintViolation,
                        format!(
                            "pattern constraint over non-string base {}",
                            base_ty.display()
                        ),
                        te.span,
                    ));
                }
                let pred = Predicate::pattern(&pattern.node).map_err(|e| {
                    SemanticError::new(
                        ErrorKind::ConstraintViolation,
                        format!("invalid pattern '{}': {e}", pattern.node),
                        pattern.span,
                    )
                })?;
                Ok(Type::Constrained {
                    base: Box::new(base_ty),
                    pred,
                })
            }
            TypeExprKind::OneOf { base, values } => {
                let base_ty = self.resolve_type_expr_with(base, scope, params)?;
                if base_ty.is_pending() {
                    return Ok(Type::Pending);
                }
                let Type::Prim(base_prim) = *base_ty.base() else {
                    return Err(SemanticError::new(
                        ErrorKind::ConstraintViolation,
                        format!(
                            "enumerated constraint over non-primitive base {}",
                            base_ty.display()
                        ),
                        te.span,
                    ));
                };
                let mut consts = Vec::with_capacity(values.len());
                for v in values {
                    let value = literal_value(v).ok_or_else(|| {
                        SemanticError::new(
                            ErrorKind::ConstraintViolation,
                            "enumerated constraint values must be literals",
                            v.span,
                        )
                    })?;
                    if value.prim() != base_prim {
                        return Err(SemanticError::new(
                            ErrorKind::ConstraintViolation,
                            format!(
                                "enumerated value {} does not belong to base {}",
                                value.display(),
                                base_ty.display()
                            ),
                            v.span,
                        ));
                    }
                    consts.push(value);
                }
                Ok(Type::Constrained {
                    base: Box::new(base_ty),
                    pred: Predicate::OneOf { values: consts },
                })
            }
            TypeExprKind::Array(elem) => Ok(Type::Array(Box::new(
                self.resolve_type_expr_with(elem, scope, params)?,
            ))),
            TypeExprKind::DependentArray { elem, len } => {
                let elem_ty = self.resolve_type_expr_with(elem, scope, params)?;
                let len = match const_fold_int(len) {
                    Some(n) if n >= 0 => LenExpr::Const(n),
                    Some(n) => {
                        return Err(SemanticError::new(
                            ErrorKind::ConstraintViolation,
                            format!("array length {n} is negative"),
                            te.span,
                        ));
                    }
                    // Non-constant length: degrade to a symbolic length that
                    // the verification stage turns into a runtime obligation.
                    None => LenExpr::Sym(oath_ast::render_expr(len)),
                };
                Ok(Type::DependentArray {
                    elem: Box::new(elem_ty),
                    len,
                })
            }
            TypeExprKind::Map { key, value } => Ok(Type::Map {
                key: Box::new(self.resolve_type_expr_with(key, scope, params)?),
                value: Box::new(self.resolve_type_expr_with(value, scope, params)?),
            }),
            TypeExprKind::Tuple(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(self.resolve_type_expr_with(item, scope, params)?);
                }
                Ok(Type::Tuple(out))
            }
            TypeExprKind::Record(fields) => {
                let mut out: Vec<Field> = Vec::with_capacity(fields.len());
                for f in fields {
                    if out.iter().any(|existing| existing.name == f.name.node) {
                        return Err(SemanticError::new(
                            ErrorKind::TypeMismatch,
                            format!("duplicate field '{}' in record type", f.name.node),
                            f.span,
                        ));
                    }
                    out.push(Field {
                        name: f.name.node.clone(),
                        ty: self.resolve_type_expr_with(&f.ty, scope, params)?,
                        optional: f.optional,
                    });
                }
                Ok(Type::Record(out))
            }
            TypeExprKind::Union(alts) => {
                let mut out = Vec::with_capacity(alts.len());
                for alt in alts {
                    out.push(self.resolve_type_expr_with(alt, scope, params)?);
                }
                if out.iter().any(Type::is_pending) {
                    return Ok(Type::Pending);
                }
                Ok(Type::Union(out))
            }
            TypeExprKind::Intersection(parts) => {
                let mut out = Vec::with_capacity(parts.len());
                for part in parts {
                    out.push(self.resolve_type_expr_with(part, scope, params)?);
                }
                if out.iter().any(Type::is_pending) {
                    return Ok(Type::Pending);
                }
                Ok(Type::Intersection(out))
            }
            TypeExprKind::Function {
                params: ps,
                ret,
                effects,
            } => {
                let mut param_tys = Vec::with_capacity(ps.len());
                for p in ps {
                    param_tys.push(self.resolve_type_expr_with(p, scope, params)?);
                }
                let ret_ty = self.resolve_type_expr_with(ret, scope, params)?;
                Ok(Type::Function {
                    params: param_tys,
                    ret: Box::new(ret_ty),
                    effects: EffectSet::from_labels(effects.iter().map(|e| e.node.clone())),
                })
            }
        }
    }

    fn resolve_name_path(
        &mut self,
        path: &[Ident],
        args: &[TypeExpr],
        scope: ScopeId,
        params: &HashMap<String, Type>,
        span: Span,
    ) -> Result<Type, SemanticError> {
        let head = &path[0];

        if path.len() == 1 && args.is_empty() {
            if let Some(t) = params.get(&head.node) {
                return Ok(t.clone());
            }
            if let Some(p) = builtin_prim(&head.node) {
                return Ok(Type::Prim(p));
            }
        }

        let mut resolved = self
            .symbols
            .resolve_spanned(&head.node, scope, head.span)?;

        let mut consumed = 1;
        while consumed < path.len() {
            match &resolved {
                SymbolRef::Local(id) => {
                    let entry = self.table.get(*id);
                    match &entry.ast.kind {
                        DeclKind::Namespace(_) => {
                            let seg = &path[consumed];
                            resolved =
                                self.symbols
                                    .resolve_in_namespace(*id, &seg.node, seg.span)?;
                            consumed += 1;
                        }
                        DeclKind::Typestate(ts) => {
                            let seg = &path[consumed];
                            if consumed + 1 != path.len() || !args.is_empty() {
                                return Err(SemanticError::new(
                                    ErrorKind::TypeMismatch,
                                    "a typestate state takes no further qualification",
                                    seg.span,
                                ));
                            }
                            if !ts.states.iter().any(|s| s.name.node == seg.node) {
                                return Err(SemanticError::new(
                                    ErrorKind::InvalidTransition,
                                    format!(
                                        "'{}' is not a state of typestate '{}'",
                                        seg.node, entry.name
                                    ),
                                    seg.span,
                                ));
                            }
                            return Ok(Type::State {
                                interface: *id,
                                interface_name: entry.name.clone(),
                                state: seg.node.clone(),
                            });
                        }
                        _ => {
                            return Err(SemanticError::new(
                                ErrorKind::UnresolvedSymbol,
                                format!("'{}' is not a namespace", path[consumed - 1].node),
                                path[consumed].span,
                            ));
                        }
                    }
                }
                SymbolRef::Global(q) => {
                    // Qualified further into a foreign namespace: extend the
                    // qualified name and retry against the index.
                    let next = format!("{q}.{}", path[consumed].node);
                    if !self.global.contains(&next) {
                        return Err(SemanticError::new(
                            ErrorKind::UnresolvedSymbol,
                            format!("unresolved name '{next}'"),
                            path[consumed].span,
                        ));
                    }
                    resolved = SymbolRef::Global(next);
                    consumed += 1;
                }
            }
        }

        let mut arg_tys = Vec::with_capacity(args.len());
        for a in args {
            arg_tys.push(self.resolve_type_expr_with(a, scope, params)?);
        }
        if arg_tys.iter().any(Type::is_pending) {
            return Ok(Type::Pending);
        }

        match resolved {
            SymbolRef::Local(id) => self.apply_local_type(id, arg_tys, span),
            SymbolRef::Global(q) => self.global_type(&q, span),
        }
    }

    fn apply_local_type(
        &mut self,
        id: DeclId,
        args: Vec<Type>,
        span: Span,
    ) -> Result<Type, SemanticError> {
        let entry = self.table.get(id);
        let entry_name = entry.name.clone();
        let ast = entry.ast.clone();
        let entry_ty = entry.ty.clone();

        let DeclKind::Type(td) = &ast.kind else {
            return Err(SemanticError::new(
                ErrorKind::TypeMismatch,
                format!("'{entry_name}' is not a type"),
                span,
            ));
        };

        if td.type_params.len() != args.len() {
            return Err(SemanticError::new(
                ErrorKind::TypeMismatch,
                format!(
                    "'{entry_name}' expects {} type argument(s), got {}",
                    td.type_params.len(),
                    args.len()
                ),
                span,
            ));
        }

        // Recheck declared bounds against the concrete arguments.
        let scope = self.table.get(id).scope;
        for (p, arg) in td.type_params.iter().zip(args.iter()) {
            if let Some(bound_expr) = &p.bound {
                let bound = self.resolve_type_expr(bound_expr, scope)?;
                if bound.is_pending() || arg.is_pending() {
                    return Ok(Type::Pending);
                }
                if let Err(missing) = self.satisfies_interface(arg, &bound) {
                    return Err(SemanticError::new(
                        ErrorKind::ConstraintViolation,
                        format!(
                            "type argument {} for parameter '{}' of '{entry_name}' does not satisfy its bound: {missing}",
                            arg.display(),
                            p.name.node
                        ),
                        span,
                    ));
                }
            }
        }

        if !td.members.is_empty() || td.body.is_none() {
            return Ok(Type::Nominal {
                decl: id,
                name: entry_name,
                args,
            });
        }

        // Structural alias: substitute into the resolved body.
        if !entry_ty.is_resolved() {
            return Ok(Type::Pending);
        }
        if matches!(entry_ty, Type::Error) {
            return Ok(Type::Error);
        }
        if args.is_empty() {
            return Ok(entry_ty);
        }
        let mut map = HashMap::new();
        for (p, a) in td.type_params.iter().zip(args.into_iter()) {
            map.insert(p.name.node.clone(), a);
        }
        Ok(substitute(&entry_ty, &map))
    }

    pub(crate) fn global_type(&mut self, qualified: &str, span: Span) -> Result<Type, SemanticError> {
        let Some(info) = self.global.get(qualified) else {
            return Err(SemanticError::new(
                ErrorKind::UnresolvedSymbol,
                format!("unresolved name '{qualified}'"),
                span,
            ));
        };
        let info = info.clone();
        let root = self.symbols.root();
        match &info.signature {
            ExportSignature::TypeAlias { body: Some(body) } => {
                self.resolve_type_expr(body, root)
            }
            ExportSignature::TypeAlias { body: None } | ExportSignature::Namespace => Err(
                SemanticError::new(
                    ErrorKind::TypeMismatch,
                    format!("'{qualified}' cannot be used as a type here"),
                    span,
                ),
            ),
            ExportSignature::Var { ty: Some(te) } => self.resolve_type_expr(te, root),
            ExportSignature::Var { ty: None } | ExportSignature::Opaque => Err(
                SemanticError::new(
                    ErrorKind::TypeMismatch,
                    format!("'{qualified}' has no exported type"),
                    span,
                ),
            ),
            ExportSignature::Func { params, ret } => {
                let mut param_tys = Vec::with_capacity(params.len());
                for p in params {
                    param_tys.push(self.resolve_type_expr(p, root)?);
                }
                let ret_ty = match ret {
                    Some(te) => self.resolve_type_expr(te, root)?,
                    None => Type::unit(),
                };
                let effects = if info.pure {
                    EffectSet::empty()
                } else {
                    EffectSet::from_labels(info.declared_effects.iter().cloned())
                };
                Ok(Type::Function {
                    params: param_tys,
                    ret: Box::new(ret_ty),
                    effects,
                })
            }
        }
    }

    /// Statically safe assignability: `actual` fits where `expected` is
    /// required without a runtime guard. Constraint guards over weaker
    /// sources are the caller's business.
    pub fn types_compatible(&mut self, expected: &Type, actual: &Type) -> bool {
        match (expected, actual) {
            (Type::Error, _) | (_, Type::Error) => true,
            (Type::Pending, _) | (_, Type::Pending) => false,

            (
                Type::Constrained { base: eb, pred: ep },
                Type::Constrained { base: ab, pred: ap },
            ) => self.types_compatible(eb, ab) && pred_subset(ap, ep),

            // A union source must fit wholesale; a union target is tried
            // alternative by alternative, in declaration order.
            (_, Type::Union(alts)) => {
                alts.iter().all(|alt| self.types_compatible(expected, alt))
            }
            (Type::Union(alts), _) => self.union_match_index(alts, actual).is_some(),
            (Type::Intersection(parts), _) => parts
                .iter()
                .all(|part| self.types_compatible(part, actual)),
            (_, Type::Intersection(parts)) => parts
                .iter()
                .any(|part| self.types_compatible(expected, part)),

            // Narrowing into a constraint needs a guard, not a static pass.
            (Type::Constrained { .. }, _) => false,
            // Widening out of a constraint is always safe.
            (_, Type::Constrained { base, .. }) => self.types_compatible(expected, base),

            (Type::Record(_), _) => self.satisfies_interface(actual, expected).is_ok(),

            (Type::Array(e), Type::Array(a)) => self.types_compatible(e, a),
            // Forgetting a known length is fine; inventing one is not.
            (Type::Array(e), Type::DependentArray { elem, .. }) => self.types_compatible(e, elem),
            (
                Type::DependentArray { elem: ee, len: el },
                Type::DependentArray { elem: ae, len: al },
            ) => {
                if !self.types_compatible(ee, ae) {
                    return false;
                }
                match (el, al) {
                    (LenExpr::Const(a), LenExpr::Const(b)) => a == b,
                    // Symbolic on either side degrades to a runtime check.
                    _ => true,
                }
            }
            (
                Type::Map { key: ek, value: ev },
                Type::Map { key: ak, value: av },
            ) => self.types_compatible(ek, ak) && self.types_compatible(ev, av),
            (Type::Tuple(e), Type::Tuple(a)) => {
                e.len() == a.len()
                    && e.iter()
                        .zip(a.iter())
                        .all(|(x, y)| self.types_compatible(x, y))
            }
            (
                Type::Function {
                    params: ep,
                    ret: er,
                    effects: ee,
                },
                Type::Function {
                    params: ap,
                    ret: ar,
                    effects: ae,
                },
            ) => {
                ep.len() == ap.len()
                    && ep
                        .iter()
                        .zip(ap.iter())
                        .all(|(x, y)| self.types_compatible(x, y))
                    && self.types_compatible(er, ar)
                    && self.registry.subset(ae, ee)
            }
            _ => expected == actual,
        }
    }

    /// Index of the first union alternative `actual` fits, in declaration
    /// order. The order is observable, so callers must not sort.
    pub fn union_match_index(&mut self, alts: &[Type], actual: &Type) -> Option<usize> {
        alts.iter()
            .position(|alt| self.types_compatible(alt, actual))
    }

    /// Structural interface satisfaction: every required member of `iface`
    /// must appear in `ty`'s member table with a compatible type. Width
    /// subtyping only. Memoized per (type, interface) pair.
    pub fn satisfies_interface(&mut self, ty: &Type, iface: &Type) -> Result<(), String> {
        let key = (ty.display(), iface.display());
        if let Some(cached) = self.conformance.get(&key) {
            return cached.clone();
        }
        let result = self.check_interface(ty, iface);
        self.conformance.insert(key, result.clone());
        result
    }

    fn check_interface(&mut self, ty: &Type, iface: &Type) -> Result<(), String> {
        let required: Vec<Field> = match iface {
            Type::Record(fields) => fields.clone(),
            Type::Intersection(parts) => {
                for part in parts {
                    self.check_interface(ty, part)?;
                }
                return Ok(());
            }
            Type::Nominal { .. } => match self.member_table(iface) {
                Some(fields) => fields,
                None => return Err(format!("'{}' has no member table", iface.display())),
            },
            other => {
                // A non-structural bound degenerates to compatibility.
                return if self.types_compatible(other, ty) {
                    Ok(())
                } else {
                    Err(format!(
                        "{} is not compatible with {}",
                        ty.display(),
                        other.display()
                    ))
                };
            }
        };

        let Some(members) = self.member_table(ty) else {
            return Err(format!("'{}' has no members", ty.display()));
        };

        for req in &required {
            if req.optional {
                continue;
            }
            let Some(found) = members.iter().find(|m| m.name == req.name) else {
                return Err(format!("missing required member '{}'", req.name));
            };
            if !self.types_compatible(&req.ty, &found.ty) {
                return Err(format!(
                    "member '{}' has type {}, expected {}",
                    req.name,
                    found.ty.display(),
                    req.ty.display()
                ));
            }
        }
        Ok(())
    }

    /// Member table of a type: record fields, or a nominal declaration's
    /// body fields plus its method signatures.
    pub fn member_table(&mut self, ty: &Type) -> Option<Vec<Field>> {
        match ty {
            Type::Record(fields) => Some(fields.clone()),
            Type::Intersection(parts) => {
                let mut out = Vec::new();
                for part in parts {
                    out.extend(self.member_table(part)?);
                }
                Some(out)
            }
            Type::Constrained { base, .. } => self.member_table(base),
            Type::Nominal { decl, args, .. } => {
                let entry = self.table.get(*decl);
                let scope = entry.scope;
                let ast = entry.ast.clone();
                let DeclKind::Type(td) = &ast.kind else {
                    return None;
                };
                let mut subst = HashMap::new();
                for (p, a) in td.type_params.iter().zip(args.iter()) {
                    subst.insert(p.name.node.clone(), a.clone());
                }
                let mut out = Vec::new();
                if let Some(body) = &td.body {
                    if let Ok(Type::Record(fields)) =
                        self.resolve_type_expr_with(body, scope, &subst)
                    {
                        out.extend(fields);
                    }
                }
                for m in &td.members {
                    let mut params = Vec::with_capacity(m.params.len());
                    for p in &m.params {
                        params.push(self.resolve_type_expr_with(&p.ty, scope, &subst).ok()?);
                    }
                    let ret = match &m.ret {
                        Some(te) => self.resolve_type_expr_with(te, scope, &subst).ok()?,
                        None => Type::unit(),
                    };
                    let meta = Metadata::parse_quiet(&m.annotations);
                    out.push(Field {
                        name: m.name.node.clone(),
                        ty: Type::Function {
                            params,
                            ret: Box::new(ret),
                            effects: declared_effect_set(&meta),
                        },
                        optional: false,
                    });
                }
                Some(out)
            }
            _ => None,
        }
    }
}

/// Declared effect set from interpreted metadata; `@pure` wins.
pub fn declared_effect_set(meta: &Metadata) -> EffectSet {
    if meta.pure {
        return EffectSet::empty();
    }
    match &meta.declared_effects {
        Some(labels) => EffectSet::from_labels(labels.iter().map(|l| l.node.clone())),
        None => EffectSet::empty(),
    }
}

/// Is every value admitted by `inner` also admitted by `outer`?
pub fn pred_subset(inner: &Predicate, outer: &Predicate) -> bool {
    match (inner, outer) {
        (Predicate::Range { lo: il, hi: ih }, Predicate::Range { lo: ol, hi: oh }) => {
            il >= ol && ih <= oh
        }
        (Predicate::OneOf { values }, outer) => values
            .iter()
            .all(|v| outer.admits(v).unwrap_or(false)),
        (Predicate::Pattern { source: a, .. }, Predicate::Pattern { source: b, .. }) => a == b,
        _ => false,
    }
}

pub fn substitute(ty: &Type, map: &HashMap<String, Type>) -> Type {
    match ty {
        Type::Param { name, .. } => map.get(name).cloned().unwrap_or_else(|| ty.clone()),
        Type::Constrained { base, pred } => Type::Constrained {
            base: Box::new(substitute(base, map)),
            pred: pred.clone(),
        },
        Type::Array(elem) => Type::Array(Box::new(substitute(elem, map))),
        Type::DependentArray { elem, len } => Type::DependentArray {
            elem: Box::new(substitute(elem, map)),
            len: len.clone(),
        },
        Type::Map { key, value } => Type::Map {
            key: Box::new(substitute(key, map)),
            value: Box::new(substitute(value, map)),
        },
        Type::Tuple(items) => Type::Tuple(items.iter().map(|t| substitute(t, map)).collect()),
        Type::Record(fields) => Type::Record(
            fields
                .iter()
                .map(|f| Field {
                    name: f.name.clone(),
                    ty: substitute(&f.ty, map),
                    optional: f.optional,
                })
                .collect(),
        ),
        Type::Union(alts) => Type::Union(alts.iter().map(|t| substitute(t, map)).collect()),
        Type::Intersection(parts) => {
            Type::Intersection(parts.iter().map(|t| substitute(t, map)).collect())
        }
        Type::Nominal { decl, name, args } => Type::Nominal {
            decl: *decl,
            name: name.clone(),
            args: args.iter().map(|t| substitute(t, map)).collect(),
        },
        Type::Function {
            params,
            ret,
            effects,
        } => Type::Function {
            params: params.iter().map(|t| substitute(t, map)).collect(),
            ret: Box::new(substitute(ret, map)),
            effects: effects.clone(),
        },
        Type::Pending
        | Type::Error
        | Type::Prim(_)
        | Type::State { .. } => ty.clone(),
    }
}

fn builtin_prim(name: &str) -> Option<Prim> {
    match name {
        "Int" => Some(Prim::Int),
        "Float" => Some(Prim::Float),
        "Decimal" => Some(Prim::Decimal),
        "Bool" => Some(Prim::Bool),
        "String" => Some(Prim::Str),
        "Unit" => Some(Prim::Unit),
        _ => None,
    }
}

/// Constant-folds an integer expression: literals, negation, and the four
/// arithmetic operators over statically known operands.
pub fn const_fold_int(expr: &Expr) -> Option<i64> {
    match &expr.kind {
        ExprKind::Int(n) => Some(*n),
        ExprKind::Unary {
            op: UnaryOp::Neg,
            expr,
        } => const_fold_int(expr).map(|n| -n),
        ExprKind::Binary { left, op, right } => {
            let l = const_fold_int(left)?;
            let r = const_fold_int(right)?;
            match op {
                oath_ast::BinOp::Add => l.checked_add(r),
                oath_ast::BinOp::Sub => l.checked_sub(r),
                oath_ast::BinOp::Mul => l.checked_mul(r),
                oath_ast::BinOp::Div => (r != 0).then(|| l / r),
                oath_ast::BinOp::Rem => (r != 0).then(|| l % r),
                _ => None,
            }
        }
        _ => None,
    }
}

/// A literal (or negated numeric literal) as a constant value.
pub fn literal_value(expr: &Expr) -> Option<ConstValue> {
    match &expr.kind {
        ExprKind::Int(n) => Some(ConstValue::Int(*n)),
        ExprKind::Float(x) => Some(ConstValue::Float(*x)),
        ExprKind::Decimal { mantissa, scale } => Some(ConstValue::Decimal {
            mantissa: *mantissa,
            scale: *scale,
        }),
        ExprKind::Bool(b) => Some(ConstValue::Bool(*b)),
        ExprKind::Str(s) => Some(ConstValue::Str(s.clone())),
        ExprKind::Unary {
            op: UnaryOp::Neg,
            expr,
        } => match literal_value(expr)? {
            ConstValue::Int(n) => Some(ConstValue::Int(-n)),
            ConstValue::Float(x) => Some(ConstValue::Float(-x)),
            ConstValue::Decimal { mantissa, scale } => Some(ConstValue::Decimal {
                mantissa: -mantissa,
                scale,
            }),
            _ => None,
        },
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oath_ast::span;

    #[test]
    fn range_subset() {
        let narrow = Predicate::Range { lo: 10, hi: 20 };
        let wide = Predicate::Range { lo: 0, hi: 100 };
        assert!(pred_subset(&narrow, &wide));
        assert!(!pred_subset(&wide, &narrow));
    }

    #[test]
    fn oneof_subset_of_range() {
        let values = Predicate::OneOf {
            values: vec![ConstValue::Int(1), ConstValue::Int(2)],
        };
        let wide = Predicate::Range { lo: 0, hi: 10 };
        assert!(pred_subset(&values, &wide));
        let out = Predicate::OneOf {
            values: vec![ConstValue::Int(11)],
        };
        assert!(!pred_subset(&out, &wide));
    }

    #[test]
    fn substitution_reaches_nested_positions() {
        let mut map = HashMap::new();
        map.insert("T".to_string(), Type::int());
        let ty = Type::Array(Box::new(Type::Param {
            name: "T".to_string(),
            bound: None,
        }));
        assert_eq!(substitute(&ty, &map), Type::Array(Box::new(Type::int())));
    }

    #[test]
    fn folding_handles_arithmetic() {
        let e = Expr {
            span: span(0, 5),
            kind: ExprKind::Binary {
                left: Box::new(Expr::int(span(0, 1), 2)),
                op: oath_ast::BinOp::Mul,
                right: Box::new(Expr::int(span(4, 1), 21)),
            },
        };
        assert_eq!(const_fold_int(&e), Some(42));
    }
}
