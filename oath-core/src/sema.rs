#![forbid(unsafe_code)]

use std::collections::HashMap;

use oath_ast::{
    Block, Decl, DeclKind, Expr, ExprKind, BinOp, Span, Stmt, TypeExpr, UnaryOp, Unit,
};

use crate::config::EngineOptions;
use crate::diagnostics::DiagnosticSink;
use crate::effects::{
    check_declared_superset, CalleeEffects, EffectChecker, EffectLookup, EffectRegistry, EffectSet,
};
use crate::error::{ErrorKind, SemanticError, Stage};
use crate::program::{DeclId, DeclTable, ExportInfo, ExportSignature, GlobalIndex, Metadata};
use crate::resolve::{declared_effect_set, literal_value, Resolver};
use crate::symbols::{ScopeId, ScopeKind, SymbolRef, SymbolTable};
use crate::templates::{resolve_instances, ExpandedInstance};
use crate::types::{Field, LenExpr, Predicate, Prim, Type};
use crate::typestate::TypestateChecker;

/// A constraint that could not be discharged statically; the verification
/// stage lowers it into a runtime check at this boundary.
#[derive(Clone, Debug)]
pub struct RuntimeGuard {
    pub span: Span,
    pub decl: DeclId,
    pub expected: Type,
    pub value: Expr,
}

/// The validated, annotated representation of one unit: types resolved,
/// effect sets finalized, template instances expanded. Produced even when
/// the unit is rejected, so diagnostics can reference it; the engine only
/// hands it onward when the sink carries no errors.
#[derive(Debug)]
pub struct AnalyzedUnit {
    pub name: String,
    pub table: DeclTable,
    pub symbols: SymbolTable,
    pub instances: Vec<ExpandedInstance>,
    pub guards: Vec<RuntimeGuard>,
}

/// Runs symbol, type, effect, and template/typestate stages on one unit, in
/// that order, gating each stage on the previous one's success.
pub fn analyze_unit(
    unit: &Unit,
    global: &GlobalIndex,
    registry: &EffectRegistry,
    options: &EngineOptions,
) -> (AnalyzedUnit, DiagnosticSink) {
    let mut sink = DiagnosticSink::new(unit.name.clone());
    let mut table = DeclTable::new();
    let mut symbols = SymbolTable::new();

    let root = symbols.root();
    ingest_decls(
        &unit.decls,
        &unit.name,
        &mut table,
        &mut symbols,
        root,
        global,
        &mut sink,
    );

    let mut guards = Vec::new();
    let mut instances = Vec::new();

    if sink.stage_open(Stage::Types) {
        let mut resolver = Resolver::new(&mut table, &symbols, global, registry, options);
        for err in resolver.run_fixed_point() {
            sink.error(err);
        }
        let mut bodies = BodyChecker::new(&mut resolver);
        bodies.check_unit_bodies();
        let BodyOutcome {
            errors,
            warnings,
            guards: collected,
        } = bodies.finish();
        for e in errors {
            sink.error(e);
        }
        for w in warnings {
            sink.warn(w);
        }
        guards = collected;
    }

    if sink.stage_open(Stage::Effects) {
        effect_stage(&mut table, &symbols, global, registry, &mut sink);
    }

    if sink.stage_open(Stage::Templates) {
        let mut resolver = Resolver::new(&mut table, &symbols, global, registry, options);
        let (expanded, errors) = resolve_instances(&mut resolver);
        for e in errors {
            sink.error(e);
        }
        instances = expanded;

        for e in TypestateChecker::new(&table, &symbols).check_unit() {
            sink.error(e);
        }
    }

    (
        AnalyzedUnit {
            name: unit.name.clone(),
            table,
            symbols,
            instances,
            guards,
        },
        sink,
    )
}

/// Builds the global symbol index from every unit's top-level declarations.
/// Runs serially before any unit worker starts; the index is read-only from
/// then on.
pub fn build_global_index(program: &oath_ast::Program) -> GlobalIndex {
    let mut index = GlobalIndex::new();
    for unit in &program.units {
        index_decls(&unit.decls, &unit.name, unit, &mut index);
    }
    index
}

fn index_decls(decls: &[Decl], prefix: &str, unit: &Unit, index: &mut GlobalIndex) {
    for decl in decls {
        let qualified = format!("{prefix}.{}", decl.name.node);
        let meta = Metadata::parse_quiet(&decl.annotations);
        let signature = match &decl.kind {
            DeclKind::Func(f) => ExportSignature::Func {
                params: f.params.iter().map(|p| p.ty.clone()).collect(),
                ret: f.ret.clone(),
            },
            DeclKind::Type(t) => ExportSignature::TypeAlias {
                body: if t.members.is_empty() {
                    t.body.clone()
                } else {
                    None
                },
            },
            DeclKind::Var(v) => ExportSignature::Var { ty: v.ty.clone() },
            DeclKind::Namespace(ns) => {
                index_decls(&ns.decls, &qualified, unit, index);
                ExportSignature::Namespace
            }
            DeclKind::Import(_) => continue,
            _ => ExportSignature::Opaque,
        };
        index.insert(
            qualified,
            ExportInfo {
                unit: unit.name.clone(),
                pure: meta.pure,
                declared_effects: meta
                    .declared_effects
                    .as_ref()
                    .map(|ls| ls.iter().map(|l| l.node.clone()).collect())
                    .unwrap_or_default(),
                deprecated: meta.deprecated.clone(),
                signature,
            },
        );
    }
}

fn ingest_decls(
    decls: &[Decl],
    prefix: &str,
    table: &mut DeclTable,
    symbols: &mut SymbolTable,
    scope: ScopeId,
    global: &GlobalIndex,
    sink: &mut DiagnosticSink,
) {
    for decl in decls {
        sink.set_decl(Some(decl.name.node.clone()));
        let qualified = format!("{prefix}.{}", decl.name.node);
        let meta = Metadata::from_annotations(&decl.annotations, sink);
        let id = table.alloc(
            &decl.name.node,
            qualified.clone(),
            decl.span,
            scope,
            decl.clone(),
            meta,
        );

        match &decl.kind {
            DeclKind::Import(import) => {
                let target_path: Vec<String> =
                    import.path.iter().map(|s| s.node.clone()).collect();
                let local_name = import
                    .alias
                    .as_ref()
                    .map(|a| a.node.clone())
                    .unwrap_or_else(|| target_path.last().cloned().unwrap_or_default());
                match resolve_import_target(&target_path, symbols, global, scope, decl.span) {
                    Ok(target) => {
                        if let SymbolRef::Global(q) = &target {
                            if let Some(info) = global.get(q) {
                                if let Some(msg) = &info.deprecated {
                                    sink.deprecated(
                                        format!("import of deprecated '{q}': {msg}"),
                                        decl.span,
                                    );
                                }
                            }
                        }
                        symbols.add_import(scope, &local_name, target, decl.span);
                    }
                    Err(e) => sink.error(e),
                }
            }
            DeclKind::Namespace(ns) => {
                if let Err(e) = symbols.declare(scope, &decl.name.node, id, decl.name.span) {
                    sink.error(e);
                }
                let ns_scope = symbols.push_scope(scope, ScopeKind::Namespace);
                symbols.bind_namespace_scope(id, ns_scope);
                ingest_decls(&ns.decls, &qualified, table, symbols, ns_scope, global, sink);
            }
            _ => {
                if let Err(e) = symbols.declare(scope, &decl.name.node, id, decl.name.span) {
                    sink.error(e);
                }
            }
        }
    }
    sink.set_decl(None);
}

fn resolve_import_target(
    path: &[String],
    symbols: &SymbolTable,
    global: &GlobalIndex,
    scope: ScopeId,
    span: Span,
) -> Result<SymbolRef, SemanticError> {
    let joined = path.join(".");
    if let Some(head) = path.first() {
        if let Ok(mut resolved) = symbols.resolve_spanned(head, scope, span) {
            for seg in &path[1..] {
                match resolved {
                    SymbolRef::Local(ns) => {
                        resolved = symbols.resolve_in_namespace(ns, seg, span)?;
                    }
                    SymbolRef::Global(q) => {
                        resolved = SymbolRef::Global(format!("{q}.{seg}"));
                    }
                }
            }
            return Ok(resolved);
        }
    }
    if global.contains(&joined) {
        return Ok(SymbolRef::Global(joined));
    }
    Err(SemanticError::new(
        ErrorKind::UnresolvedSymbol,
        format!("import target '{joined}' does not exist"),
        span,
    ))
}

// ---------------------------------------------------------------------------
// Effect stage

struct UnitEffectLookup<'t> {
    table: &'t DeclTable,
    symbols: &'t SymbolTable,
    global: &'t GlobalIndex,
    scope: ScopeId,
}

impl EffectLookup for UnitEffectLookup<'_> {
    fn callee_effects(&self, callee: &Expr) -> CalleeEffects {
        let Some(path) = oath_ast::callee_path(callee) else {
            return CalleeEffects::Opaque;
        };
        if let Some(b) = builtin_sig(&path) {
            return CalleeEffects::Primitive(b.effect.map(str::to_string));
        }
        let segments: Vec<&str> = path.split('.').collect();
        let Ok(mut resolved) = self.symbols.resolve(segments[0], self.scope) else {
            return CalleeEffects::Opaque;
        };
        for seg in &segments[1..] {
            match resolved {
                SymbolRef::Local(id) => {
                    match self.symbols.resolve_in_namespace(id, seg, oath_ast::span(0, 0)) {
                        Ok(next) => resolved = next,
                        Err(_) => return CalleeEffects::Opaque,
                    }
                }
                SymbolRef::Global(q) => {
                    resolved = SymbolRef::Global(format!("{q}.{seg}"));
                }
            }
        }
        match resolved {
            SymbolRef::Local(id) => {
                CalleeEffects::Declared(self.table.get(id).declared_effects.clone())
            }
            SymbolRef::Global(q) => match self.global.get(&q) {
                Some(info) => CalleeEffects::Declared(EffectSet::from_labels(
                    info.declared_effects.iter().cloned(),
                )),
                None => CalleeEffects::Opaque,
            },
        }
    }
}

fn effect_stage(
    table: &mut DeclTable,
    symbols: &SymbolTable,
    global: &GlobalIndex,
    registry: &EffectRegistry,
    sink: &mut DiagnosticSink,
) {
    // Finalize declared sets first so call-chain propagation reads the
    // declared (not observed) set of every callee, including ones checked
    // later in arena order.
    for id in table.ids() {
        let declared = declared_effect_set(&table.get(id).meta);
        table.get_mut(id).declared_effects = declared;
    }

    for id in table.ids() {
        let entry = table.get(id);
        let DeclKind::Func(func) = &entry.ast.kind else {
            continue;
        };
        let name = entry.name.clone();
        let span = entry.span;
        let scope = entry.scope;
        let meta = entry.meta.clone();
        let body = func.body.clone();
        sink.set_decl(Some(name.clone()));

        let mut observed = EffectSet::empty();
        {
            let lookup = UnitEffectLookup {
                table,
                symbols,
                global,
                scope,
            };
            let mut checker = EffectChecker::new(registry, &lookup);
            if let Some(body) = &body {
                observed = checker.observe_block(body);
            }

            // Contract predicates must be pure expressions; only @verify may
            // reach for effectful queries.
            for clause in meta.requires.iter().chain(meta.ensures.iter()) {
                let mut contract_observed = EffectSet::empty();
                checker.observe_expr(&clause.predicate, &mut contract_observed);
                if !contract_observed.is_empty() {
                    sink.error(SemanticError::new(
                        ErrorKind::ImpureContract,
                        format!(
                            "contract on '{name}' performs effects [{}]; @requires/@ensures must be pure",
                            contract_observed.display()
                        ),
                        clause.span,
                    ));
                }
            }

            for err in checker.finish() {
                sink.error(err);
            }
        }

        let declared = table.get(id).declared_effects.clone();
        for err in check_declared_superset(registry, &declared, &observed, meta.pure, &name, span)
        {
            sink.error(err);
        }
        table.get_mut(id).observed_effects = Some(observed);
    }
    sink.set_decl(None);
}

// ---------------------------------------------------------------------------
// Body checking (type stage)

struct BuiltinSig {
    params: Vec<Type>,
    ret: Type,
    effect: Option<&'static str>,
}

/// Effect-producing primitive operations and a few pure helpers the engine
/// knows about. Call sites on these contribute their intrinsic effect to the
/// observed set directly.
fn builtin_sig(name: &str) -> Option<BuiltinSig> {
    let sig = |params: Vec<Type>, ret: Type, effect: Option<&'static str>| BuiltinSig {
        params,
        ret,
        effect,
    };
    Some(match name {
        "io.println" => sig(vec![Type::string()], Type::unit(), Some("console")),
        "io.read_line" => sig(vec![], Type::string(), Some("console")),
        "net.fetch" => sig(vec![Type::string()], Type::string(), Some("network")),
        "net.send" => sig(
            vec![Type::string(), Type::string()],
            Type::unit(),
            Some("network"),
        ),
        "fs.read" => sig(vec![Type::string()], Type::string(), Some("filesystem")),
        "fs.write" => sig(
            vec![Type::string(), Type::string()],
            Type::unit(),
            Some("filesystem"),
        ),
        "db.query" => sig(
            vec![Type::string()],
            Type::Array(Box::new(Type::string())),
            Some("database"),
        ),
        "db.exec" => sig(vec![Type::string()], Type::int(), Some("database")),
        "clock.now" => sig(vec![], Type::int(), Some("time")),
        "math.abs" => sig(vec![Type::int()], Type::int(), None),
        "math.min" | "math.max" => sig(vec![Type::int(), Type::int()], Type::int(), None),
        "str.len" => sig(vec![Type::string()], Type::int(), None),
        "str.concat" => sig(
            vec![Type::string(), Type::string()],
            Type::string(),
            None,
        ),
        _ => return None,
    })
}

struct LocalBinding {
    ty: Type,
    mutable: bool,
}

struct BodyOutcome {
    errors: Vec<SemanticError>,
    warnings: Vec<SemanticError>,
    guards: Vec<RuntimeGuard>,
}

struct BodyChecker<'r, 'a> {
    r: &'r mut Resolver<'a>,
    errors: Vec<SemanticError>,
    warnings: Vec<SemanticError>,
    guards: Vec<RuntimeGuard>,
    locals: Vec<HashMap<String, LocalBinding>>,
    type_params: HashMap<String, Type>,
    ret_ty: Type,
    current: DeclId,
    scope: ScopeId,
}

impl<'r, 'a> BodyChecker<'r, 'a> {
    fn new(r: &'r mut Resolver<'a>) -> Self {
        Self {
            r,
            errors: Vec::new(),
            warnings: Vec::new(),
            guards: Vec::new(),
            locals: Vec::new(),
            type_params: HashMap::new(),
            ret_ty: Type::unit(),
            current: DeclId(0),
            scope: ScopeId(0),
        }
    }

    fn finish(self) -> BodyOutcome {
        BodyOutcome {
            errors: self.errors,
            warnings: self.warnings,
            guards: self.guards,
        }
    }

    fn check_unit_bodies(&mut self) {
        for id in self.r.table.ids() {
            let entry = self.r.table.get(id);
            let ast = entry.ast.clone();
            let meta = entry.meta.clone();
            let ty = entry.ty.clone();
            self.current = id;
            self.scope = entry.scope;

            match &ast.kind {
                DeclKind::Func(func) => self.check_function(func, &meta, &ty),
                DeclKind::Var(var) => {
                    if let Some(init) = &var.init {
                        if let Err(e) = self.check_assign_value(&ty, init) {
                            self.errors.push(e);
                        }
                    }
                }
                DeclKind::Type(td) => self.check_type_members(td, &meta, id),
                _ => {}
            }
        }
    }

    fn check_function(&mut self, func: &oath_ast::FuncDecl, meta: &Metadata, ty: &Type) {
        let Type::Function { params, ret, .. } = ty else {
            // Signature already failed to resolve; body errors would cascade.
            return;
        };
        let (params, ret) = (params.clone(), ret.as_ref().clone());

        self.type_params = match self.r.bind_type_params(&func.type_params, self.scope) {
            Ok(map) => map,
            Err(e) => {
                self.errors.push(e);
                HashMap::new()
            }
        };

        self.push_locals();
        for (p, pty) in func.params.iter().zip(params.iter()) {
            self.define_local(&p.name.node, pty.clone(), false);
        }
        self.ret_ty = ret.clone();

        for clause in &meta.requires {
            self.expect_bool(&clause.predicate, "precondition");
        }
        {
            self.push_locals();
            self.define_local("result", ret.clone(), false);
            for clause in &meta.ensures {
                self.expect_bool(&clause.predicate, "postcondition");
            }
            self.pop_locals();
        }
        for clause in &meta.verifies {
            self.expect_bool(&clause.predicate, "verification assertion");
        }

        if let Some(body) = &func.body {
            let tail_ty = self.check_block(body);
            if ret != Type::unit() {
                if let (Some(tail), Some(tail_ty)) = (&body.tail, tail_ty) {
                    if let Err(e) = self.check_assignable(&ret, &tail_ty, tail) {
                        self.errors.push(e);
                    }
                }
            }
        }

        self.pop_locals();
        self.type_params.clear();
    }

    fn check_type_members(&mut self, td: &oath_ast::TypeDecl, meta: &Metadata, id: DeclId) {
        // Invariant predicates see the type's fields as bindings.
        let fields = self
            .r
            .member_table(&Type::Nominal {
                decl: id,
                name: String::new(),
                args: Vec::new(),
            })
            .unwrap_or_default();

        if !meta.invariants.is_empty() {
            self.push_locals();
            for f in &fields {
                self.define_local(&f.name, f.ty.clone(), true);
            }
            for clause in &meta.invariants {
                self.expect_bool(&clause.predicate, "invariant");
            }
            self.pop_locals();
        }

        for m in &td.members {
            let Some(body) = &m.body else { continue };
            self.push_locals();
            for f in &fields {
                self.define_local(&f.name, f.ty.clone(), m.mutates);
            }
            let mut ok = true;
            for p in &m.params {
                match self.resolve_ty(&p.ty) {
                    Ok(t) => self.define_local(&p.name.node, t, false),
                    Err(e) => {
                        self.errors.push(e);
                        ok = false;
                    }
                }
            }
            let ret = match &m.ret {
                Some(te) => match self.resolve_ty(te) {
                    Ok(t) => t,
                    Err(e) => {
                        self.errors.push(e);
                        ok = false;
                        Type::Error
                    }
                },
                None => Type::unit(),
            };
            if ok {
                let saved_ret = std::mem::replace(&mut self.ret_ty, ret);
                let _ = self.check_block(body);
                self.ret_ty = saved_ret;
            }
            self.pop_locals();
        }
    }

    fn expect_bool(&mut self, predicate: &Expr, what: &str) {
        match self.infer_expr(predicate) {
            Ok(Type::Prim(Prim::Bool)) | Ok(Type::Error) => {}
            Ok(other) => self.errors.push(SemanticError::new(
                ErrorKind::TypeMismatch,
                format!("{what} must be Bool, got {}", other.display()),
                predicate.span,
            )),
            Err(e) => self.errors.push(e),
        }
    }

    fn resolve_ty(&mut self, te: &TypeExpr) -> Result<Type, SemanticError> {
        self.r
            .resolve_type_expr_with(te, self.scope, &self.type_params)
    }

    fn push_locals(&mut self) {
        self.locals.push(HashMap::new());
    }

    fn pop_locals(&mut self) {
        self.locals.pop();
    }

    fn define_local(&mut self, name: &str, ty: Type, mutable: bool) {
        if let Some(top) = self.locals.last_mut() {
            top.insert(name.to_string(), LocalBinding { ty, mutable });
        }
    }

    fn local(&self, name: &str) -> Option<&LocalBinding> {
        self.locals.iter().rev().find_map(|s| s.get(name))
    }

    fn check_block(&mut self, block: &Block) -> Option<Type> {
        self.push_locals();
        for stmt in &block.stmts {
            self.check_stmt(stmt);
        }
        let tail_ty = block.tail.as_ref().map(|tail| match self.infer_expr(tail) {
            Ok(t) => t,
            Err(e) => {
                self.errors.push(e);
                Type::Error
            }
        });
        self.pop_locals();
        tail_ty
    }

    fn check_stmt(&mut self, stmt: &Stmt) {
        match stmt {
            Stmt::Let(l) => {
                let declared = l.ty.as_ref().map(|te| self.resolve_ty(te));
                match declared {
                    Some(Ok(expected)) => {
                        if let Err(e) = self.check_assign_value(&expected, &l.init) {
                            self.errors.push(e);
                        }
                        self.define_local(&l.name.node, expected, l.mutable);
                    }
                    Some(Err(e)) => {
                        self.errors.push(e);
                        self.define_local(&l.name.node, Type::Error, l.mutable);
                    }
                    None => {
                        let ty = match self.infer_expr(&l.init) {
                            Ok(t) => t,
                            Err(e) => {
                                self.errors.push(e);
                                Type::Error
                            }
                        };
                        self.define_local(&l.name.node, ty, l.mutable);
                    }
                }
            }
            Stmt::Assign(a) => {
                let Some(binding) = self.local(&a.target.node) else {
                    match self.infer_ident(&a.target.node, a.target.span) {
                        Ok(ty) => {
                            if let Err(e) = self.check_assign_value(&ty, &a.expr) {
                                self.errors.push(e);
                            }
                        }
                        Err(e) => self.errors.push(e),
                    }
                    return;
                };
                let (ty, mutable) = (binding.ty.clone(), binding.mutable);
                if !mutable {
                    self.errors.push(SemanticError::new(
                        ErrorKind::TypeMismatch,
                        format!("cannot assign to immutable binding '{}'", a.target.node),
                        a.target.span,
                    ));
                }
                if let Err(e) = self.check_assign_value(&ty, &a.expr) {
                    self.errors.push(e);
                }
            }
            Stmt::If(i) => {
                self.expect_cond(&i.cond, "if");
                let _ = self.check_block(&i.then_block);
                if let Some(else_block) = &i.else_block {
                    let _ = self.check_block(else_block);
                }
            }
            Stmt::While(w) => {
                self.expect_cond(&w.cond, "while");
                let _ = self.check_block(&w.body);
            }
            Stmt::Return(r) => match (&r.value, self.ret_ty.clone()) {
                (Some(v), expected) => {
                    if let Err(e) = self.check_assign_value(&expected, v) {
                        self.errors.push(e);
                    }
                }
                (None, expected) if expected != Type::unit() => {
                    self.errors.push(SemanticError::new(
                        ErrorKind::TypeMismatch,
                        format!("return without a value in a function returning {}", expected.display()),
                        r.span,
                    ));
                }
                (None, _) => {}
            },
            Stmt::Isolate(iso) => {
                let _ = self.check_block(&iso.body);
            }
            Stmt::Expr(e) => {
                if let Err(err) = self.infer_expr(e) {
                    self.errors.push(err);
                }
            }
        }
    }

    fn expect_cond(&mut self, cond: &Expr, what: &str) {
        match self.infer_expr(cond) {
            Ok(Type::Prim(Prim::Bool)) | Ok(Type::Error) => {}
            Ok(other) => self.errors.push(SemanticError::new(
                ErrorKind::TypeMismatch,
                format!("{what} condition must be Bool, got {}", other.display()),
                cond.span,
            )),
            Err(e) => self.errors.push(e),
        }
    }

    /// Assignment with constraint awareness: statically known values are
    /// checked against the guard now; everything else that reaches a
    /// constrained target through its base type records a runtime guard.
    fn check_assign_value(&mut self, expected: &Type, rhs: &Expr) -> Result<(), SemanticError> {
        let actual = self.infer_expr(rhs)?;
        self.check_assignable(expected, &actual, rhs)
    }

    fn check_assignable(
        &mut self,
        expected: &Type,
        actual: &Type,
        rhs: &Expr,
    ) -> Result<(), SemanticError> {
        if let Type::Constrained { base, pred } = expected {
            if let Some(value) = literal_value(rhs) {
                return match pred.admits(&value) {
                    Some(true) => Ok(()),
                    Some(false) => Err(SemanticError::new(
                        ErrorKind::ConstraintViolation,
                        format!(
                            "value {} does not satisfy {}",
                            value.display(),
                            expected.display()
                        ),
                        rhs.span,
                    )),
                    None => Err(SemanticError::new(
                        ErrorKind::TypeMismatch,
                        format!(
                            "expected {}, got {}",
                            expected.display(),
                            actual.display()
                        ),
                        rhs.span,
                    )),
                };
            }
            if self.r.types_compatible(expected, actual) {
                return Ok(());
            }
            // Statically unknown value into a constrained target: the guard
            // moves to runtime.
            if self.r.types_compatible(base, actual) {
                self.guards.push(RuntimeGuard {
                    span: rhs.span,
                    decl: self.current,
                    expected: expected.clone(),
                    value: rhs.clone(),
                });
                return Ok(());
            }
            return Err(self.mismatch(expected, actual, rhs.span));
        }

        if let Type::Union(alts) = expected {
            // First-match policy: alternatives are tried in declaration
            // order, and the first hit wins.
            if self.r.union_match_index(alts, actual).is_some() {
                return Ok(());
            }
            for alt in alts {
                if let Type::Constrained { base, .. } = alt {
                    if let Some(value) = literal_value(rhs) {
                        if let Type::Constrained { pred, .. } = alt {
                            if pred.admits(&value) == Some(true) {
                                return Ok(());
                            }
                        }
                    } else if self.r.types_compatible(base, actual) {
                        self.guards.push(RuntimeGuard {
                            span: rhs.span,
                            decl: self.current,
                            expected: alt.clone(),
                            value: rhs.clone(),
                        });
                        return Ok(());
                    }
                }
            }
            return Err(self.mismatch(expected, actual, rhs.span));
        }

        if let (
            Type::DependentArray { elem, len: LenExpr::Sym(_) },
            Type::Array(actual_elem) | Type::DependentArray { elem: actual_elem, .. },
        ) = (expected, actual)
        {
            if self.r.types_compatible(elem, actual_elem) {
                self.guards.push(RuntimeGuard {
                    span: rhs.span,
                    decl: self.current,
                    expected: expected.clone(),
                    value: rhs.clone(),
                });
                return Ok(());
            }
        }

        if self.r.types_compatible(expected, actual) {
            return Ok(());
        }
        Err(self.mismatch(expected, actual, rhs.span))
    }

    fn mismatch(&self, expected: &Type, actual: &Type, span: Span) -> SemanticError {
        SemanticError::new(
            ErrorKind::TypeMismatch,
            format!("expected {}, got {}", expected.display(), actual.display()),
            span,
        )
    }

    fn infer_ident(&mut self, name: &str, span: Span) -> Result<Type, SemanticError> {
        if let Some(binding) = self.local(name) {
            return Ok(binding.ty.clone());
        }
        match self.r.symbols.resolve_spanned(name, self.scope, span)? {
            SymbolRef::Local(id) => {
                let entry = self.r.table.get(id);
                if let Some(msg) = &entry.meta.deprecated {
                    self.warnings.push(SemanticError::new(
                        ErrorKind::DeprecatedAnnotation,
                        format!("use of deprecated '{}': {msg}", entry.name),
                        span,
                    ));
                }
                Ok(entry.ty.clone())
            }
            SymbolRef::Global(q) => self.r.global_type(&q, span),
        }
    }

    fn infer_expr(&mut self, expr: &Expr) -> Result<Type, SemanticError> {
        match &expr.kind {
            ExprKind::Ident(id) => {
                if let Some(t) = self.type_params.get(&id.node) {
                    return Ok(t.clone());
                }
                self.infer_ident(&id.node, id.span)
            }
            ExprKind::Int(_) => Ok(Type::int()),
            ExprKind::Float(_) => Ok(Type::Prim(Prim::Float)),
            ExprKind::Decimal { .. } => Ok(Type::Prim(Prim::Decimal)),
            ExprKind::Bool(_) => Ok(Type::bool()),
            ExprKind::Str(_) => Ok(Type::string()),
            ExprKind::Unary { op, expr: inner } => {
                let t = self.infer_expr(inner)?;
                match op {
                    UnaryOp::Neg => match t.base() {
                        Type::Prim(Prim::Int) => Ok(Type::int()),
                        Type::Prim(Prim::Float) => Ok(Type::Prim(Prim::Float)),
                        Type::Prim(Prim::Decimal) => Ok(Type::Prim(Prim::Decimal)),
                        Type::Error => Ok(Type::Error),
                        other => Err(SemanticError::new(
                            ErrorKind::TypeMismatch,
                            format!("cannot negate {}", other.display()),
                            expr.span,
                        )),
                    },
                    UnaryOp::Not => match t.base() {
                        Type::Prim(Prim::Bool) | Type::Error => Ok(Type::bool()),
                        other => Err(SemanticError::new(
                            ErrorKind::TypeMismatch,
                            format!("cannot apply '!' to {}", other.display()),
                            expr.span,
                        )),
                    },
                }
            }
            ExprKind::Binary { left, op, right } => self.infer_binary(left, *op, right, expr.span),
            ExprKind::Field { base, name } => {
                let base_ty = self.infer_expr(base)?;
                if matches!(base_ty, Type::Error) {
                    return Ok(Type::Error);
                }
                let members = self.r.member_table(&base_ty).ok_or_else(|| {
                    SemanticError::new(
                        ErrorKind::TypeMismatch,
                        format!("{} has no members", base_ty.display()),
                        name.span,
                    )
                })?;
                members
                    .iter()
                    .find(|m| m.name == name.node)
                    .map(|m| m.ty.clone())
                    .ok_or_else(|| {
                        SemanticError::new(
                            ErrorKind::TypeMismatch,
                            format!("{} has no member '{}'", base_ty.display(), name.node),
                            name.span,
                        )
                    })
            }
            ExprKind::Call { callee, args } => self.infer_call(callee, args, expr.span),
            ExprKind::MethodCall { recv, method, args } => {
                self.infer_method_call(recv, method, args, expr.span)
            }
            ExprKind::RecordLit { name, fields } => self.infer_record_lit(name, fields, expr.span),
            ExprKind::ArrayLit(items) => {
                let mut elem = Type::Error;
                for (i, item) in items.iter().enumerate() {
                    let t = self.infer_expr(item)?;
                    if i == 0 {
                        elem = t;
                    } else if !self.r.types_compatible(&elem, &t) {
                        return Err(SemanticError::new(
                            ErrorKind::TypeMismatch,
                            format!(
                                "array element has type {}, expected {}",
                                t.display(),
                                elem.display()
                            ),
                            item.span,
                        ));
                    }
                }
                Ok(Type::DependentArray {
                    elem: Box::new(elem),
                    len: LenExpr::Const(items.len() as i64),
                })
            }
            ExprKind::TupleLit(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(self.infer_expr(item)?);
                }
                Ok(Type::Tuple(out))
            }
            ExprKind::Cast { expr: inner, ty } => {
                let from = self.infer_expr(inner)?;
                let to = self.resolve_ty(ty)?;
                let numeric = |t: &Type| {
                    matches!(
                        t.base(),
                        Type::Prim(Prim::Int) | Type::Prim(Prim::Float) | Type::Prim(Prim::Decimal)
                    )
                };
                if numeric(&from) && numeric(&to) {
                    if let (Type::Constrained { pred, .. }, Some(value)) =
                        (&to, literal_value(inner))
                    {
                        if pred.admits(&value) == Some(false) {
                            return Err(SemanticError::new(
                                ErrorKind::ConstraintViolation,
                                format!(
                                    "value {} does not satisfy {}",
                                    value.display(),
                                    to.display()
                                ),
                                expr.span,
                            ));
                        }
                    } else if matches!(to, Type::Constrained { .. }) {
                        self.guards.push(RuntimeGuard {
                            span: expr.span,
                            decl: self.current,
                            expected: to.clone(),
                            value: (**inner).clone(),
                        });
                    }
                    return Ok(to);
                }
                if self.r.types_compatible(&to, &from) {
                    return Ok(to);
                }
                Err(SemanticError::new(
                    ErrorKind::TypeMismatch,
                    format!("cannot convert {} to {}", from.display(), to.display()),
                    expr.span,
                ))
            }
            ExprKind::ForAll {
                binder,
                domain,
                guard,
                body,
            } => {
                let domain_ty = self.resolve_ty(domain)?;
                self.push_locals();
                self.define_local(&binder.node, domain_ty, false);
                if let Some(g) = guard {
                    self.expect_bool(g, "quantifier guard");
                }
                self.expect_bool(body, "quantified property");
                self.pop_locals();
                Ok(Type::bool())
            }
        }
    }

    fn infer_binary(
        &mut self,
        left: &Expr,
        op: BinOp,
        right: &Expr,
        span: Span,
    ) -> Result<Type, SemanticError> {
        let lt = self.infer_expr(left)?;
        let rt = self.infer_expr(right)?;
        if matches!(lt, Type::Error) || matches!(rt, Type::Error) {
            return Ok(Type::Error);
        }

        match op {
            BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Rem => {
                match (lt.base(), rt.base()) {
                    (Type::Prim(Prim::Int), Type::Prim(Prim::Int)) => {
                        Ok(infer_int_binop(op, &lt, &rt))
                    }
                    (Type::Prim(Prim::Float), Type::Prim(Prim::Float)) => {
                        Ok(Type::Prim(Prim::Float))
                    }
                    (Type::Prim(Prim::Decimal), Type::Prim(Prim::Decimal)) => {
                        Ok(Type::Prim(Prim::Decimal))
                    }
                    (a, b) if numeric_prim(a) && numeric_prim(b) => Err(SemanticError::new(
                        ErrorKind::TypeMismatch,
                        format!(
                            "arithmetic between {} and {} requires an explicit conversion",
                            lt.display(),
                            rt.display()
                        ),
                        span,
                    )),
                    _ => Err(SemanticError::new(
                        ErrorKind::TypeMismatch,
                        format!(
                            "cannot apply '{}' to {} and {}",
                            op.symbol(),
                            lt.display(),
                            rt.display()
                        ),
                        span,
                    )),
                }
            }
            BinOp::Lt | BinOp::Gt | BinOp::Le | BinOp::Ge => match (lt.base(), rt.base()) {
                (a, b) if numeric_prim(a) && a == b => Ok(Type::bool()),
                (a, b) if numeric_prim(a) && numeric_prim(b) => Err(SemanticError::new(
                    ErrorKind::TypeMismatch,
                    format!(
                        "comparison between {} and {} requires an explicit conversion",
                        lt.display(),
                        rt.display()
                    ),
                    span,
                )),
                _ => Err(SemanticError::new(
                    ErrorKind::TypeMismatch,
                    format!(
                        "cannot compare {} and {}",
                        lt.display(),
                        rt.display()
                    ),
                    span,
                )),
            },
            BinOp::Eq | BinOp::Ne => {
                let comparable = self.r.types_compatible(&lt, &rt)
                    || self.r.types_compatible(&rt, &lt)
                    || lt.base() == rt.base();
                if comparable {
                    Ok(Type::bool())
                } else {
                    Err(SemanticError::new(
                        ErrorKind::TypeMismatch,
                        format!("cannot compare {} and {}", lt.display(), rt.display()),
                        span,
                    ))
                }
            }
            BinOp::And | BinOp::Or => {
                for (e, t) in [(left, &lt), (right, &rt)] {
                    if t.base() != &Type::bool() {
                        return Err(SemanticError::new(
                            ErrorKind::TypeMismatch,
                            format!("logical operand must be Bool, got {}", t.display()),
                            e.span,
                        ));
                    }
                }
                Ok(Type::bool())
            }
        }
    }

    fn infer_call(
        &mut self,
        callee: &Expr,
        args: &[Expr],
        span: Span,
    ) -> Result<Type, SemanticError> {
        if let Some(path) = oath_ast::callee_path(callee) {
            if let Some(b) = builtin_sig(&path) {
                self.check_args(&path, &b.params, args, span)?;
                return Ok(b.ret);
            }
            if !path.contains('.') {
                if self.local(&path).is_none() && self.type_params.get(&path).is_none() {
                    let ty = self.infer_ident(&path, callee.span)?;
                    return self.apply_function(&path, &ty, args, span);
                }
            } else {
                let ty = self.infer_value_path(&path, callee.span)?;
                return self.apply_function(&path, &ty, args, span);
            }
        }
        let callee_ty = self.infer_expr(callee)?;
        self.apply_function("<expression>", &callee_ty, args, span)
    }

    fn infer_value_path(&mut self, path: &str, span: Span) -> Result<Type, SemanticError> {
        let segments: Vec<&str> = path.split('.').collect();
        let mut resolved = self
            .r
            .symbols
            .resolve_spanned(segments[0], self.scope, span)?;
        for seg in &segments[1..] {
            match resolved {
                SymbolRef::Local(id) => {
                    resolved = self.r.symbols.resolve_in_namespace(id, seg, span)?;
                }
                SymbolRef::Global(q) => {
                    resolved = SymbolRef::Global(format!("{q}.{seg}"));
                }
            }
        }
        match resolved {
            SymbolRef::Local(id) => {
                let entry = self.r.table.get(id);
                if let Some(msg) = &entry.meta.deprecated {
                    self.warnings.push(SemanticError::new(
                        ErrorKind::DeprecatedAnnotation,
                        format!("use of deprecated '{}': {msg}", entry.name),
                        span,
                    ));
                }
                Ok(entry.ty.clone())
            }
            SymbolRef::Global(q) => self.r.global_type(&q, span),
        }
    }

    fn apply_function(
        &mut self,
        name: &str,
        callee_ty: &Type,
        args: &[Expr],
        span: Span,
    ) -> Result<Type, SemanticError> {
        if matches!(callee_ty, Type::Error) {
            for a in args {
                let _ = self.infer_expr(a);
            }
            return Ok(Type::Error);
        }
        let Type::Function { params, ret, .. } = callee_ty else {
            return Err(SemanticError::new(
                ErrorKind::TypeMismatch,
                format!("'{name}' is not callable ({})", callee_ty.display()),
                span,
            ));
        };
        self.check_args(name, params, args, span)?;
        Ok(ret.as_ref().clone())
    }

    fn check_args(
        &mut self,
        name: &str,
        params: &[Type],
        args: &[Expr],
        span: Span,
    ) -> Result<(), SemanticError> {
        if params.len() != args.len() {
            return Err(SemanticError::new(
                ErrorKind::TypeMismatch,
                format!(
                    "wrong number of arguments to '{name}': expected {}, got {}",
                    params.len(),
                    args.len()
                ),
                span,
            ));
        }
        for (p, a) in params.iter().zip(args.iter()) {
            self.check_assign_value(p, a)?;
        }
        Ok(())
    }

    fn infer_method_call(
        &mut self,
        recv: &Expr,
        method: &oath_ast::Ident,
        args: &[Expr],
        span: Span,
    ) -> Result<Type, SemanticError> {
        let recv_ty = self.infer_expr(recv)?;
        match &recv_ty {
            Type::Error => Ok(Type::Error),
            Type::State {
                interface,
                interface_name,
                state,
            } => {
                let entry = self.r.table.get(*interface);
                let iface_scope = entry.scope;
                let DeclKind::Typestate(ts) = entry.ast.kind.clone() else {
                    return Ok(Type::Error);
                };
                let Some(state_decl) = ts.states.iter().find(|s| s.name.node == *state) else {
                    return Ok(Type::Error);
                };
                let Some(m) = state_decl
                    .methods
                    .iter()
                    .find(|m| m.name.node == method.node)
                else {
                    // The typestate stage reports the invalid transition with
                    // full protocol context; don't double-report here.
                    return Ok(Type::Error);
                };
                let mut params = Vec::with_capacity(m.params.len());
                for p in &m.params {
                    params.push(self.r.resolve_type_expr(&p.ty, iface_scope)?);
                }
                self.check_args(&method.node, &params, args, span)?;
                let next = m
                    .next
                    .as_ref()
                    .map(|n| n.node.clone())
                    .unwrap_or_else(|| state.clone());
                Ok(Type::State {
                    interface: *interface,
                    interface_name: interface_name.clone(),
                    state: next,
                })
            }
            _ => {
                let members = self.r.member_table(&recv_ty).ok_or_else(|| {
                    SemanticError::new(
                        ErrorKind::TypeMismatch,
                        format!("{} has no methods", recv_ty.display()),
                        method.span,
                    )
                })?;
                let member = members
                    .iter()
                    .find(|f| f.name == method.node)
                    .cloned()
                    .ok_or_else(|| {
                        SemanticError::new(
                            ErrorKind::TypeMismatch,
                            format!(
                                "{} has no method '{}'",
                                recv_ty.display(),
                                method.node
                            ),
                            method.span,
                        )
                    })?;
                self.apply_function(&method.node, &member.ty, args, span)
            }
        }
    }

    fn infer_record_lit(
        &mut self,
        name: &Option<oath_ast::Ident>,
        fields: &[(oath_ast::Ident, Expr)],
        span: Span,
    ) -> Result<Type, SemanticError> {
        let Some(name) = name else {
            let mut out = Vec::with_capacity(fields.len());
            for (fname, value) in fields {
                out.push(Field {
                    name: fname.node.clone(),
                    ty: self.infer_expr(value)?,
                    optional: false,
                });
            }
            return Ok(Type::Record(out));
        };

        let te = TypeExpr {
            span,
            kind: oath_ast::TypeExprKind::Name {
                path: vec![name.clone()],
                args: Vec::new(),
            },
        };
        let target = self.resolve_ty(&te)?;
        let declared = match &target {
            Type::Record(fs) => fs.clone(),
            Type::Nominal { .. } => self
                .r
                .member_table(&target)
                .unwrap_or_default()
                .into_iter()
                .filter(|f| !matches!(f.ty, Type::Function { .. }))
                .collect(),
            other => {
                return Err(SemanticError::new(
                    ErrorKind::TypeMismatch,
                    format!("'{}' is not a record type ({})", name.node, other.display()),
                    span,
                ));
            }
        };

        for (fname, value) in fields {
            let Some(decl_field) = declared.iter().find(|f| f.name == fname.node) else {
                return Err(SemanticError::new(
                    ErrorKind::TypeMismatch,
                    format!("'{}' has no field '{}'", name.node, fname.node),
                    fname.span,
                ));
            };
            let expected = decl_field.ty.clone();
            self.check_assign_value(&expected, value)?;
        }
        for decl_field in &declared {
            if !decl_field.optional && !fields.iter().any(|(f, _)| f.node == decl_field.name) {
                return Err(SemanticError::new(
                    ErrorKind::TypeMismatch,
                    format!("missing field '{}' of '{}'", decl_field.name, name.node),
                    span,
                ));
            }
        }
        Ok(target)
    }
}

fn numeric_prim(t: &Type) -> bool {
    matches!(
        t,
        Type::Prim(Prim::Int) | Type::Prim(Prim::Float) | Type::Prim(Prim::Decimal)
    )
}

fn int_bounds(ty: &Type) -> Option<(i64, i64)> {
    match ty {
        Type::Prim(Prim::Int) => Some((i64::MIN, i64::MAX)),
        Type::Constrained { base, pred } if **base == Type::int() => match pred {
            Predicate::Range { lo, hi } => Some((*lo, *hi)),
            _ => None,
        },
        _ => None,
    }
}

fn mk_int_range(lo: i64, hi: i64) -> Type {
    if lo == i64::MIN && hi == i64::MAX {
        Type::int()
    } else {
        Type::Constrained {
            base: Box::new(Type::int()),
            pred: Predicate::Range { lo, hi },
        }
    }
}

/// Interval arithmetic over constrained Int operands, so `Int[0..10] +
/// Int[0..5]` infers as `Int[0..15]` instead of flattening to Int.
fn infer_int_binop(op: BinOp, lt: &Type, rt: &Type) -> Type {
    let (Some((l_lo, l_hi)), Some((r_lo, r_hi))) = (int_bounds(lt), int_bounds(rt)) else {
        return Type::int();
    };

    match op {
        BinOp::Add => mk_int_range(l_lo.saturating_add(r_lo), l_hi.saturating_add(r_hi)),
        BinOp::Sub => mk_int_range(l_lo.saturating_sub(r_hi), l_hi.saturating_sub(r_lo)),
        BinOp::Mul => {
            let corners = [
                l_lo.saturating_mul(r_lo),
                l_lo.saturating_mul(r_hi),
                l_hi.saturating_mul(r_lo),
                l_hi.saturating_mul(r_hi),
            ];
            mk_int_range(
                *corners.iter().min().expect("corners"),
                *corners.iter().max().expect("corners"),
            )
        }
        BinOp::Div => {
            // If the divisor range includes 0, be conservative.
            if r_lo <= 0 && r_hi >= 0 {
                return Type::int();
            }
            let corners = [l_lo / r_lo, l_lo / r_hi, l_hi / r_lo, l_hi / r_hi];
            mk_int_range(
                *corners.iter().min().expect("corners"),
                *corners.iter().max().expect("corners"),
            )
        }
        _ => Type::int(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_interval_addition() {
        let a = mk_int_range(0, 10);
        let b = mk_int_range(0, 5);
        assert_eq!(infer_int_binop(BinOp::Add, &a, &b), mk_int_range(0, 15));
    }

    #[test]
    fn division_by_range_containing_zero_widens() {
        let a = mk_int_range(0, 100);
        let b = mk_int_range(0, 5);
        assert_eq!(infer_int_binop(BinOp::Div, &a, &b), Type::int());
    }

    #[test]
    fn builtin_effects() {
        assert_eq!(builtin_sig("net.fetch").unwrap().effect, Some("network"));
        assert_eq!(builtin_sig("math.abs").unwrap().effect, None);
        assert!(builtin_sig("no.such.op").is_none());
    }
}
