/// Integration tests for the verification gate: static discharge of
/// constant-known contracts, runtime lowering of the rest, quantified
/// property execution against registered generators, and budgets.
use std::time::Duration;

use oath_ast::{
    span, Annotation, BinOp, Block, Decl, DeclKind, Expr, ExprKind, FuncDecl, Ident, LetStmt,
    Param, Spanned, Stmt, TypeExpr, TypeExprKind, Unit, VarDecl,
};
use oath_core::{
    analyze_unit, EffectRegistry, EngineOptions, ErrorKind, GlobalIndex, Stage,
};
use oath_verify::{
    Gate, GeneratorRegistry, GuardSite, IntRangeGenerator, ObligationKind, ObligationStatus,
    VerificationReport,
};

fn sp() -> oath_ast::Span {
    span(0, 0)
}

fn ident(name: &str) -> Ident {
    Spanned::new(sp(), name.to_string())
}

fn ty_name(name: &str) -> TypeExpr {
    TypeExpr {
        span: sp(),
        kind: TypeExprKind::Name {
            path: vec![ident(name)],
            args: Vec::new(),
        },
    }
}

fn ty_range(lo: i64, hi: i64) -> TypeExpr {
    TypeExpr {
        span: sp(),
        kind: TypeExprKind::Range {
            base: Box::new(ty_name("Int")),
            lo: Box::new(Expr::int(sp(), lo)),
            hi: Box::new(Expr::int(sp(), hi)),
        },
    }
}

fn str_lit(s: &str) -> Expr {
    Expr {
        span: sp(),
        kind: ExprKind::Str(s.to_string()),
    }
}

fn binop(l: Expr, op: BinOp, r: Expr) -> Expr {
    Expr {
        span: sp(),
        kind: ExprKind::Binary {
            left: Box::new(l),
            op,
            right: Box::new(r),
        },
    }
}

fn ann(key: &str, args: Vec<Expr>) -> Annotation {
    Annotation {
        span: sp(),
        key: ident(key),
        args,
    }
}

fn func(
    name: &str,
    annotations: Vec<Annotation>,
    params: Vec<(&str, TypeExpr)>,
    ret: Option<TypeExpr>,
    body: Option<Block>,
) -> Decl {
    Decl {
        span: sp(),
        name: ident(name),
        annotations,
        kind: DeclKind::Func(FuncDecl {
            type_params: Vec::new(),
            params: params
                .into_iter()
                .map(|(n, ty)| Param {
                    span: sp(),
                    name: ident(n),
                    ty,
                })
                .collect(),
            ret,
            body,
        }),
    }
}

fn block(stmts: Vec<Stmt>, tail: Option<Expr>) -> Block {
    Block {
        span: sp(),
        stmts,
        tail,
    }
}

fn call(name: &str, args: Vec<Expr>) -> Expr {
    Expr {
        span: sp(),
        kind: ExprKind::Call {
            callee: Box::new(Expr::ident(sp(), name)),
            args,
        },
    }
}

/// `divide(a, b) @requires(b != 0, "b must be non-zero")`, body `a / b`.
fn divide() -> Decl {
    func(
        "divide",
        vec![ann(
            "requires",
            vec![
                binop(Expr::ident(sp(), "b"), BinOp::Ne, Expr::int(sp(), 0)),
                str_lit("b must be non-zero"),
            ],
        )],
        vec![("a", ty_name("Int")), ("b", ty_name("Int"))],
        Some(ty_name("Int")),
        Some(block(
            Vec::new(),
            Some(binop(Expr::ident(sp(), "a"), BinOp::Div, Expr::ident(sp(), "b"))),
        )),
    )
}

fn run_gate(
    u: &Unit,
    generators: &GeneratorRegistry,
    options: &EngineOptions,
) -> (VerificationReport, oath_core::DiagnosticSink) {
    let global = GlobalIndex::new();
    let effects = EffectRegistry::default();
    let (mut analyzed, mut sink) = analyze_unit(u, &global, &effects, options);
    assert!(
        sink.stage_open(Stage::Verification),
        "earlier stage failed: {:?}",
        sink.entries()
    );
    let report = Gate::new(&mut analyzed, &global, generators, &effects, options).run(&mut sink);
    (report, sink)
}

fn error_kinds(sink: &oath_core::DiagnosticSink) -> Vec<ErrorKind> {
    sink.errors().map(|e| e.error.kind).collect()
}

#[test]
fn statically_zero_divisor_fails_the_gate() {
    let main = func(
        "main",
        Vec::new(),
        Vec::new(),
        None,
        Some(block(
            vec![Stmt::Let(LetStmt {
                span: sp(),
                name: ident("r"),
                mutable: false,
                ty: None,
                init: call("divide", vec![Expr::int(sp(), 10), Expr::int(sp(), 0)]),
            })],
            None,
        )),
    );
    let u = Unit {
        name: "m".to_string(),
        decls: vec![divide(), main],
    };
    let (report, sink) = run_gate(&u, &GeneratorRegistry::with_defaults(), &EngineOptions::default());

    assert_eq!(error_kinds(&sink), vec![ErrorKind::VerificationFailure]);
    let err = sink.errors().next().unwrap();
    assert!(err.error.message.contains("precondition"));
    assert!(err.error.message.contains("b = 0"));
    assert!(report
        .obligations
        .iter()
        .any(|o| o.kind == ObligationKind::Precondition && o.is_failed()));
}

#[test]
fn unknown_divisor_compiles_a_call_entry_guard() {
    let main = func(
        "use_divide",
        Vec::new(),
        vec![("b", ty_name("Int"))],
        None,
        Some(block(
            vec![Stmt::Let(LetStmt {
                span: sp(),
                name: ident("r"),
                mutable: false,
                ty: None,
                init: call("divide", vec![Expr::int(sp(), 10), Expr::ident(sp(), "b")]),
            })],
            None,
        )),
    );
    let u = Unit {
        name: "m".to_string(),
        decls: vec![divide(), main],
    };
    let (report, sink) = run_gate(&u, &GeneratorRegistry::with_defaults(), &EngineOptions::default());

    assert!(!sink.has_errors(), "diagnostics: {:?}", sink.entries());
    assert!(report.guards.iter().any(|g| matches!(
        &g.site,
        GuardSite::CallEntry { callee, .. } if callee == "m.divide"
    )));
}

#[test]
fn constant_assertion_is_proved_static() {
    let u = Unit {
        name: "m".to_string(),
        decls: vec![func(
            "laws",
            vec![ann(
                "verify",
                vec![binop(
                    binop(Expr::int(sp(), 1), BinOp::Add, Expr::int(sp(), 1)),
                    BinOp::Eq,
                    Expr::int(sp(), 2),
                )],
            )],
            Vec::new(),
            None,
            None,
        )],
    };
    let (report, sink) = run_gate(&u, &GeneratorRegistry::with_defaults(), &EngineOptions::default());
    assert!(!sink.has_errors());
    assert!(report
        .obligations
        .iter()
        .any(|o| o.kind == ObligationKind::Assertion
            && o.status == ObligationStatus::ProvedStatic));
}

#[test]
fn false_assertion_is_a_verification_failure() {
    let u = Unit {
        name: "m".to_string(),
        decls: vec![func(
            "laws",
            vec![ann(
                "verify",
                vec![binop(Expr::int(sp(), 1), BinOp::Eq, Expr::int(sp(), 2))],
            )],
            Vec::new(),
            None,
            None,
        )],
    };
    let (_, sink) = run_gate(&u, &GeneratorRegistry::with_defaults(), &EngineOptions::default());
    assert_eq!(error_kinds(&sink), vec![ErrorKind::VerificationFailure]);
}

fn forall(binder: &str, domain: TypeExpr, body: Expr) -> Expr {
    Expr {
        span: sp(),
        kind: ExprKind::ForAll {
            binder: ident(binder),
            domain,
            guard: None,
            body: Box::new(body),
        },
    }
}

#[test]
fn property_over_registered_domain_passes() {
    let mut generators = GeneratorRegistry::with_defaults();
    generators.register("Int[0..100]", IntRangeGenerator { lo: 0, hi: 100 });

    let prop = forall(
        "x",
        ty_range(0, 100),
        binop(Expr::ident(sp(), "x"), BinOp::Ge, Expr::int(sp(), 0)),
    );
    let u = Unit {
        name: "m".to_string(),
        decls: vec![func("laws", vec![ann("verify", vec![prop])], Vec::new(), None, None)],
    };
    let (report, sink) = run_gate(&u, &generators, &EngineOptions::default());
    assert!(!sink.has_errors(), "diagnostics: {:?}", sink.entries());
    assert!(report
        .obligations
        .iter()
        .any(|o| o.kind == ObligationKind::Property
            && o.status == ObligationStatus::ProvedStatic));
}

#[test]
fn failing_property_reports_the_minimal_sample() {
    let mut generators = GeneratorRegistry::with_defaults();
    generators.register("Int[0..100]", IntRangeGenerator { lo: 0, hi: 100 });

    let prop = forall(
        "x",
        ty_range(0, 100),
        binop(Expr::ident(sp(), "x"), BinOp::Lt, Expr::int(sp(), 50)),
    );
    let u = Unit {
        name: "m".to_string(),
        decls: vec![func("laws", vec![ann("verify", vec![prop])], Vec::new(), None, None)],
    };
    let (_, sink) = run_gate(&u, &generators, &EngineOptions::default());
    let err = sink
        .errors()
        .find(|e| e.error.kind == ErrorKind::VerificationFailure)
        .expect("property failure");
    // Samples arrive in increasing order, so 50 is the minimal failure.
    assert!(err.error.message.contains("x = 50"), "{}", err.error.message);
}

#[test]
fn missing_generator_fails_with_no_generator_for_domain() {
    let prop = forall(
        "x",
        ty_range(1, 9),
        binop(Expr::ident(sp(), "x"), BinOp::Gt, Expr::int(sp(), 0)),
    );
    let u = Unit {
        name: "m".to_string(),
        decls: vec![func("laws", vec![ann("verify", vec![prop])], Vec::new(), None, None)],
    };
    let (_, sink) = run_gate(&u, &GeneratorRegistry::with_defaults(), &EngineOptions::default());
    assert_eq!(error_kinds(&sink), vec![ErrorKind::NoGeneratorForDomain]);
}

#[test]
fn exhausted_obligation_budget_is_a_timeout() {
    let mut generators = GeneratorRegistry::with_defaults();
    generators.register("Int[0..100]", IntRangeGenerator { lo: 0, hi: 100 });
    let options = EngineOptions::default().with_obligation_budget(Duration::ZERO);

    let prop = forall(
        "x",
        ty_range(0, 100),
        binop(Expr::ident(sp(), "x"), BinOp::Ge, Expr::int(sp(), 0)),
    );
    let u = Unit {
        name: "m".to_string(),
        decls: vec![func("laws", vec![ann("verify", vec![prop])], Vec::new(), None, None)],
    };
    let (report, sink) = run_gate(&u, &generators, &options);
    assert_eq!(error_kinds(&sink), vec![ErrorKind::VerificationTimeout]);
    assert!(report
        .obligations
        .iter()
        .any(|o| o.kind == ObligationKind::Property && o.is_failed()));
}

#[test]
fn non_constant_narrowing_lowers_to_an_assignment_guard() {
    let body = block(
        vec![Stmt::Let(LetStmt {
            span: sp(),
            name: ident("p"),
            mutable: false,
            ty: Some(ty_range(0, 100)),
            init: Expr::ident(sp(), "x"),
        })],
        None,
    );
    let u = Unit {
        name: "m".to_string(),
        decls: vec![func(
            "clamp",
            Vec::new(),
            vec![("x", ty_name("Int"))],
            None,
            Some(body),
        )],
    };
    let (report, sink) = run_gate(&u, &GeneratorRegistry::with_defaults(), &EngineOptions::default());
    assert!(!sink.has_errors(), "diagnostics: {:?}", sink.entries());
    assert!(report
        .guards
        .iter()
        .any(|g| g.site == GuardSite::Assignment));
    assert!(report.obligations.iter().any(|o| {
        o.kind == ObligationKind::ConstraintGuard
            && o.status == ObligationStatus::DischargedRuntime
    }));
}

#[test]
fn module_constants_feed_static_discharge() {
    let konst = Decl {
        span: sp(),
        name: ident("LIMIT"),
        annotations: Vec::new(),
        kind: DeclKind::Var(VarDecl {
            mutable: false,
            ty: Some(ty_name("Int")),
            init: Some(Expr::int(sp(), 10)),
        }),
    };
    let u = Unit {
        name: "m".to_string(),
        decls: vec![
            konst,
            func(
                "laws",
                vec![ann(
                    "verify",
                    vec![binop(Expr::ident(sp(), "LIMIT"), BinOp::Gt, Expr::int(sp(), 0))],
                )],
                Vec::new(),
                None,
                None,
            ),
        ],
    };
    let (report, sink) = run_gate(&u, &GeneratorRegistry::with_defaults(), &EngineOptions::default());
    assert!(!sink.has_errors());
    assert!(report
        .obligations
        .iter()
        .any(|o| o.status == ObligationStatus::ProvedStatic));
}
