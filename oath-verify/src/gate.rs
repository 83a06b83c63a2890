#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::time::Instant;

use oath_ast::{Block, DeclKind, Expr, ExprKind, Span, Stmt};
use oath_core::{
    literal_value, AnalyzedUnit, ConstValue, DiagnosticSink, EffectRegistry, EngineOptions,
    ErrorKind, GlobalIndex, Resolver, SemanticError, SymbolRef, Type,
};

use crate::eval::{eval, Env};
use crate::generators::GeneratorRegistry;
use crate::obligation::{
    GuardCheck, GuardSite, LoweredGuard, Obligation, ObligationKind, ObligationStatus,
};

/// Outcome of the verification gate for one unit: every obligation with its
/// resolution, plus the runtime guards that became part of the validated
/// representation.
#[derive(Debug, Default)]
pub struct VerificationReport {
    pub obligations: Vec<Obligation>,
    pub guards: Vec<LoweredGuard>,
}

/// Runs the verification gate over an analyzed unit: static discharge where
/// the predicate folds, runtime lowering otherwise, and bounded execution of
/// quantified properties. Failures are fatal for the unit; budgets turn
/// runaway executions into `VerificationTimeout` rather than stalling the
/// pipeline.
pub struct Gate<'a> {
    unit: &'a mut AnalyzedUnit,
    global: &'a GlobalIndex,
    generators: &'a GeneratorRegistry,
    effects: &'a EffectRegistry,
    options: &'a EngineOptions,
    consts: Env,
    unit_started: Instant,
    unit_exhausted: bool,
}

impl<'a> Gate<'a> {
    pub fn new(
        unit: &'a mut AnalyzedUnit,
        global: &'a GlobalIndex,
        generators: &'a GeneratorRegistry,
        effects: &'a EffectRegistry,
        options: &'a EngineOptions,
    ) -> Self {
        let consts = unit_consts(unit);
        Self {
            unit,
            global,
            generators,
            effects,
            options,
            consts,
            unit_started: Instant::now(),
            unit_exhausted: false,
        }
    }

    pub fn run(mut self, sink: &mut DiagnosticSink) -> VerificationReport {
        let mut report = VerificationReport::default();
        self.unit_started = Instant::now();

        let ids = self.unit.table.ids();
        for id in ids {
            let entry = self.unit.table.get(id);
            let qualified = entry.qualified.clone();
            let meta = entry.meta.clone();
            let ast_kind = entry.ast.kind.clone();
            sink.set_decl(Some(entry.name.clone()));

            match &ast_kind {
                DeclKind::Func(func) => {
                    self.function_obligations(&qualified, &meta, func, sink, &mut report);
                }
                DeclKind::Type(td) => {
                    self.invariant_obligations(&qualified, &meta, td, sink, &mut report);
                }
                _ => {}
            }

            for clause in &meta.verifies {
                self.verify_obligation(&qualified, clause, sink, &mut report);
            }
        }

        // Template assertions run against their target declaration.
        let instance_work: Vec<(String, oath_core::VerifyClause)> = self
            .unit
            .instances
            .iter()
            .flat_map(|inst| {
                let target = self.unit.table.get(inst.target).qualified.clone();
                inst.verifies
                    .iter()
                    .cloned()
                    .map(move |clause| (target.clone(), clause))
                    .collect::<Vec<_>>()
            })
            .collect();
        for (target, clause) in instance_work {
            sink.set_decl(Some(target.clone()));
            self.verify_obligation(&target, &clause, sink, &mut report);
        }

        let guard_work = self.unit.guards.clone();
        for guard in guard_work {
            let decl = self.unit.table.get(guard.decl).qualified.clone();
            sink.set_decl(Some(decl.clone()));
            self.constraint_obligation(&decl, &guard, sink, &mut report);
        }

        sink.set_decl(None);
        report
    }

    fn budget_left(&mut self, decl: &str, span: Span, sink: &mut DiagnosticSink) -> bool {
        if self.unit_exhausted {
            return false;
        }
        if self.unit_started.elapsed() > self.options.unit_verification_budget {
            self.unit_exhausted = true;
            sink.error(SemanticError::new(
                ErrorKind::VerificationTimeout,
                format!(
                    "verification budget for the unit exhausted at '{decl}'; remaining obligations are failed"
                ),
                span,
            ));
            return false;
        }
        true
    }

    fn function_obligations(
        &mut self,
        qualified: &str,
        meta: &oath_core::Metadata,
        func: &oath_ast::FuncDecl,
        sink: &mut DiagnosticSink,
        report: &mut VerificationReport,
    ) {
        // Preconditions become call-entry guards; call sites with statically
        // known arguments are checked right here (below, per call site).
        for (i, clause) in meta.requires.iter().enumerate() {
            report.guards.push(LoweredGuard {
                site: GuardSite::CallEntry {
                    callee: qualified.to_string(),
                    clause_index: i,
                },
                span: clause.span,
                check: GuardCheck::Expr(clause.predicate.clone()),
                message: clause.message.clone(),
            });
            report.obligations.push(Obligation {
                kind: ObligationKind::Precondition,
                decl: qualified.to_string(),
                span: clause.span,
                predicate: clause.predicate.clone(),
                message: clause.message.clone(),
                status: ObligationStatus::DischargedRuntime,
            });
        }

        for clause in &meta.ensures {
            let status = match eval(&clause.predicate, &self.consts) {
                Some(ConstValue::Bool(true)) => ObligationStatus::ProvedStatic,
                Some(ConstValue::Bool(false)) => {
                    let detail = format!(
                        "postcondition of '{qualified}' is statically false: {}",
                        clause.message
                    );
                    sink.error(SemanticError::new(
                        ErrorKind::VerificationFailure,
                        detail.clone(),
                        clause.span,
                    ));
                    ObligationStatus::Failed { detail }
                }
                _ => {
                    report.guards.push(LoweredGuard {
                        site: GuardSite::ReturnPath,
                        span: clause.span,
                        check: GuardCheck::Expr(clause.predicate.clone()),
                        message: clause.message.clone(),
                    });
                    ObligationStatus::DischargedRuntime
                }
            };
            report.obligations.push(Obligation {
                kind: ObligationKind::Postcondition,
                decl: qualified.to_string(),
                span: clause.span,
                predicate: clause.predicate.clone(),
                message: clause.message.clone(),
                status,
            });
        }

        // Call sites inside this body feed the callee's preconditions.
        if let Some(body) = &func.body {
            let mut calls = Vec::new();
            collect_calls(body, &mut calls);
            for call in calls {
                self.call_site_preconditions(qualified, &call, sink, report);
            }
        }
    }

    fn call_site_preconditions(
        &mut self,
        caller: &str,
        call: &CallSite,
        sink: &mut DiagnosticSink,
        report: &mut VerificationReport,
    ) {
        let Some(target) = self.resolve_local_callee(caller, &call.path) else {
            return;
        };
        let entry = self.unit.table.get(target);
        let callee_name = entry.qualified.clone();
        let requires = entry.meta.requires.clone();
        let DeclKind::Func(func) = entry.ast.kind.clone() else {
            return;
        };
        if requires.is_empty() {
            return;
        }

        let mut env = self.consts.clone();
        let mut all_static = true;
        for (param, arg) in func.params.iter().zip(call.args.iter()) {
            match literal_value(arg) {
                Some(v) => {
                    env.insert(param.name.node.clone(), v);
                }
                None => all_static = false,
            }
        }

        for clause in &requires {
            match eval(&clause.predicate, &env) {
                Some(ConstValue::Bool(false)) => {
                    let inputs: Vec<String> = func
                        .params
                        .iter()
                        .filter_map(|p| {
                            env.get(&p.name.node)
                                .map(|v| format!("{} = {}", p.name.node, v.display()))
                        })
                        .collect();
                    let detail = format!(
                        "call to '{callee_name}' violates its precondition ({}) with {}",
                        clause.message,
                        inputs.join(", ")
                    );
                    sink.error(SemanticError::new(
                        ErrorKind::VerificationFailure,
                        detail.clone(),
                        call.span,
                    ));
                    report.obligations.push(Obligation {
                        kind: ObligationKind::Precondition,
                        decl: callee_name.clone(),
                        span: call.span,
                        predicate: clause.predicate.clone(),
                        message: clause.message.clone(),
                        status: ObligationStatus::Failed { detail },
                    });
                    // Clauses short-circuit on the first failure.
                    break;
                }
                Some(ConstValue::Bool(true)) if all_static => {
                    report.obligations.push(Obligation {
                        kind: ObligationKind::Precondition,
                        decl: callee_name.clone(),
                        span: call.span,
                        predicate: clause.predicate.clone(),
                        message: clause.message.clone(),
                        status: ObligationStatus::ProvedStatic,
                    });
                }
                // Unknown arguments: the call-entry guard already covers it.
                _ => {}
            }
        }
    }

    fn invariant_obligations(
        &mut self,
        qualified: &str,
        meta: &oath_core::Metadata,
        td: &oath_ast::TypeDecl,
        sink: &mut DiagnosticSink,
        report: &mut VerificationReport,
    ) {
        for clause in &meta.invariants {
            let status = match eval(&clause.predicate, &self.consts) {
                Some(ConstValue::Bool(true)) => ObligationStatus::ProvedStatic,
                Some(ConstValue::Bool(false)) => {
                    let detail = format!(
                        "invariant of '{qualified}' is statically false: {}",
                        clause.message
                    );
                    sink.error(SemanticError::new(
                        ErrorKind::VerificationFailure,
                        detail.clone(),
                        clause.span,
                    ));
                    ObligationStatus::Failed { detail }
                }
                _ => {
                    // Re-established after every public mutating operation.
                    for m in td
                        .members
                        .iter()
                        .filter(|m| m.mutates)
                        .filter(|m| !oath_core::Metadata::parse_quiet(&m.annotations).internal)
                    {
                        report.guards.push(LoweredGuard {
                            site: GuardSite::AfterMutation {
                                member: m.name.node.clone(),
                            },
                            span: clause.span,
                            check: GuardCheck::Expr(clause.predicate.clone()),
                            message: clause.message.clone(),
                        });
                    }
                    ObligationStatus::DischargedRuntime
                }
            };
            report.obligations.push(Obligation {
                kind: ObligationKind::Invariant,
                decl: qualified.to_string(),
                span: clause.span,
                predicate: clause.predicate.clone(),
                message: clause.message.clone(),
                status,
            });
        }
    }

    fn verify_obligation(
        &mut self,
        qualified: &str,
        clause: &oath_core::VerifyClause,
        sink: &mut DiagnosticSink,
        report: &mut VerificationReport,
    ) {
        if !self.budget_left(qualified, clause.span, sink) {
            report.obligations.push(Obligation {
                kind: ObligationKind::Assertion,
                decl: qualified.to_string(),
                span: clause.span,
                predicate: clause.predicate.clone(),
                message: "verification budget exhausted".to_string(),
                status: ObligationStatus::Failed {
                    detail: "verification budget exhausted".to_string(),
                },
            });
            return;
        }

        if let ExprKind::ForAll { .. } = &clause.predicate.kind {
            self.property_obligation(qualified, clause, sink, report);
            return;
        }

        let (status, message) = match eval(&clause.predicate, &self.consts) {
            Some(ConstValue::Bool(true)) => {
                (ObligationStatus::ProvedStatic, "holds".to_string())
            }
            Some(ConstValue::Bool(false)) => {
                let detail = format!(
                    "assertion on '{qualified}' is false: {}",
                    oath_ast::render_expr(&clause.predicate)
                );
                sink.error(SemanticError::new(
                    ErrorKind::VerificationFailure,
                    detail.clone(),
                    clause.span,
                ));
                (ObligationStatus::Failed { detail }, "failed".to_string())
            }
            _ => {
                report.guards.push(LoweredGuard {
                    site: GuardSite::VerifyBlock,
                    span: clause.span,
                    check: GuardCheck::Expr(clause.predicate.clone()),
                    message: oath_ast::render_expr(&clause.predicate),
                });
                (
                    ObligationStatus::DischargedRuntime,
                    "lowered to a runtime assertion".to_string(),
                )
            }
        };
        report.obligations.push(Obligation {
            kind: ObligationKind::Assertion,
            decl: qualified.to_string(),
            span: clause.span,
            predicate: clause.predicate.clone(),
            message,
            status,
        });
    }

    /// Executes a `forAll` property over its registered generator. Samples
    /// arrive in magnitude order, so the first failure reported is also the
    /// minimal known failing sample.
    fn property_obligation(
        &mut self,
        qualified: &str,
        clause: &oath_core::VerifyClause,
        sink: &mut DiagnosticSink,
        report: &mut VerificationReport,
    ) {
        let ExprKind::ForAll {
            binder,
            domain,
            guard,
            body,
        } = &clause.predicate.kind
        else {
            return;
        };

        let domain_ty = {
            let mut resolver = Resolver::new(
                &mut self.unit.table,
                &self.unit.symbols,
                self.global,
                self.effects,
                self.options,
            );
            match resolver.resolve_type_expr(domain, self.unit.symbols.root()) {
                Ok(t) => t,
                Err(e) => {
                    sink.error(e);
                    return;
                }
            }
        };
        let domain_key = domain_ty.display();

        let Some(generator) = self.generators.get(&domain_key) else {
            let detail =
                format!("no sample generator registered for domain '{domain_key}'");
            sink.error(SemanticError::new(
                ErrorKind::NoGeneratorForDomain,
                detail.clone(),
                clause.span,
            ));
            report.obligations.push(Obligation {
                kind: ObligationKind::Property,
                decl: qualified.to_string(),
                span: clause.span,
                predicate: clause.predicate.clone(),
                message: detail.clone(),
                status: ObligationStatus::Failed { detail },
            });
            return;
        };
        let generator = generator.clone();

        let started = Instant::now();
        let samples = generator.samples(self.options.property_samples);
        let mut status = ObligationStatus::ProvedStatic;
        let mut message = format!("holds for {} samples", samples.len());

        for sample in samples {
            if started.elapsed() > self.options.obligation_budget {
                let detail = format!(
                    "property on '{qualified}' exceeded its execution budget"
                );
                sink.error(SemanticError::new(
                    ErrorKind::VerificationTimeout,
                    detail.clone(),
                    clause.span,
                ));
                status = ObligationStatus::Failed { detail };
                message = "timed out".to_string();
                break;
            }
            // Values outside the predicate's domain kind (e.g. a Float
            // sample against an Int-ranged constraint) never apply.
            if let Type::Constrained { pred, .. } = &domain_ty {
                if pred.admits(&sample) != Some(true) {
                    continue;
                }
            }

            let mut env = self.consts.clone();
            env.insert(binder.node.clone(), sample.clone());
            if let Some(g) = guard {
                if eval(g, &env) != Some(ConstValue::Bool(true)) {
                    continue;
                }
            }
            match eval(body, &env) {
                Some(ConstValue::Bool(true)) => {}
                _ => {
                    let detail = format!(
                        "property on '{qualified}' failed for {} = {}",
                        binder.node,
                        sample.display()
                    );
                    sink.error(SemanticError::new(
                        ErrorKind::VerificationFailure,
                        detail.clone(),
                        clause.span,
                    ));
                    status = ObligationStatus::Failed { detail };
                    message = format!("failed for {} = {}", binder.node, sample.display());
                    break;
                }
            }
        }

        report.obligations.push(Obligation {
            kind: ObligationKind::Property,
            decl: qualified.to_string(),
            span: clause.span,
            predicate: clause.predicate.clone(),
            message,
            status,
        });
    }

    fn constraint_obligation(
        &mut self,
        decl: &str,
        guard: &oath_core::RuntimeGuard,
        sink: &mut DiagnosticSink,
        report: &mut VerificationReport,
    ) {
        let pred = match &guard.expected {
            Type::Constrained { pred, .. } => Some(pred.clone()),
            _ => None,
        };

        let status = match (&pred, eval(&guard.value, &self.consts)) {
            (Some(p), Some(value)) => match p.admits(&value) {
                Some(true) => ObligationStatus::ProvedStatic,
                Some(false) => {
                    let detail = format!(
                        "value {} does not satisfy {}",
                        value.display(),
                        guard.expected.display()
                    );
                    sink.error(SemanticError::new(
                        ErrorKind::VerificationFailure,
                        detail.clone(),
                        guard.span,
                    ));
                    ObligationStatus::Failed { detail }
                }
                None => ObligationStatus::DischargedRuntime,
            },
            _ => ObligationStatus::DischargedRuntime,
        };

        if status == ObligationStatus::DischargedRuntime {
            report.guards.push(LoweredGuard {
                site: GuardSite::Assignment,
                span: guard.span,
                check: GuardCheck::Constraint {
                    expected: guard.expected.clone(),
                    value: guard.value.clone(),
                },
                message: format!(
                    "{} must satisfy {}",
                    oath_ast::render_expr(&guard.value),
                    guard.expected.display()
                ),
            });
        }

        report.obligations.push(Obligation {
            kind: ObligationKind::ConstraintGuard,
            decl: decl.to_string(),
            span: guard.span,
            predicate: guard.value.clone(),
            message: format!("must satisfy {}", guard.expected.display()),
            status,
        });
    }

    fn resolve_local_callee(&self, _caller: &str, path: &str) -> Option<oath_core::DeclId> {
        let segments: Vec<&str> = path.split('.').collect();
        let mut resolved = self
            .unit
            .symbols
            .resolve(segments[0], self.unit.symbols.root())
            .ok()?;
        for seg in &segments[1..] {
            match resolved {
                SymbolRef::Local(id) => {
                    resolved = self
                        .unit
                        .symbols
                        .resolve_in_namespace(id, seg, oath_ast::span(0, 0))
                        .ok()?;
                }
                SymbolRef::Global(_) => return None,
            }
        }
        match resolved {
            SymbolRef::Local(id) => Some(id),
            SymbolRef::Global(_) => None,
        }
    }
}

/// Statically known module-level constants, usable inside any predicate of
/// the unit.
fn unit_consts(unit: &AnalyzedUnit) -> Env {
    let mut env = Env::new();
    for entry in unit.table.iter() {
        if let DeclKind::Var(var) = &entry.ast.kind {
            if var.mutable {
                continue;
            }
            if let Some(init) = &var.init {
                if let Some(v) = literal_value(init) {
                    env.insert(entry.name.clone(), v);
                }
            }
        }
    }
    env
}

struct CallSite {
    path: String,
    args: Vec<Expr>,
    span: Span,
}

fn collect_calls(block: &Block, out: &mut Vec<CallSite>) {
    for stmt in &block.stmts {
        match stmt {
            Stmt::Let(l) => collect_calls_expr(&l.init, out),
            Stmt::Assign(a) => collect_calls_expr(&a.expr, out),
            Stmt::If(i) => {
                collect_calls_expr(&i.cond, out);
                collect_calls(&i.then_block, out);
                if let Some(e) = &i.else_block {
                    collect_calls(e, out);
                }
            }
            Stmt::While(w) => {
                collect_calls_expr(&w.cond, out);
                collect_calls(&w.body, out);
            }
            Stmt::Return(r) => {
                if let Some(v) = &r.value {
                    collect_calls_expr(v, out);
                }
            }
            Stmt::Isolate(iso) => collect_calls(&iso.body, out),
            Stmt::Expr(e) => collect_calls_expr(e, out),
        }
    }
    if let Some(tail) = &block.tail {
        collect_calls_expr(tail, out);
    }
}

fn collect_calls_expr(expr: &Expr, out: &mut Vec<CallSite>) {
    match &expr.kind {
        ExprKind::Call { callee, args } => {
            if let Some(path) = oath_ast::callee_path(callee) {
                out.push(CallSite {
                    path,
                    args: args.clone(),
                    span: expr.span,
                });
            }
            for a in args {
                collect_calls_expr(a, out);
            }
        }
        ExprKind::MethodCall { recv, args, .. } => {
            collect_calls_expr(recv, out);
            for a in args {
                collect_calls_expr(a, out);
            }
        }
        ExprKind::Unary { expr, .. } | ExprKind::Cast { expr, .. } => {
            collect_calls_expr(expr, out)
        }
        ExprKind::Binary { left, right, .. } => {
            collect_calls_expr(left, out);
            collect_calls_expr(right, out);
        }
        ExprKind::Field { base, .. } => collect_calls_expr(base, out),
        ExprKind::RecordLit { fields, .. } => {
            for (_, v) in fields {
                collect_calls_expr(v, out);
            }
        }
        ExprKind::ArrayLit(items) | ExprKind::TupleLit(items) => {
            for item in items {
                collect_calls_expr(item, out);
            }
        }
        ExprKind::ForAll { guard, body, .. } => {
            if let Some(g) = guard {
                collect_calls_expr(g, out);
            }
            collect_calls_expr(body, out);
        }
        _ => {}
    }
}
