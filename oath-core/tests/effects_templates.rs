/// Integration tests for the effect checker and the pattern-template
/// resolver: declared-versus-observed sets, the single-level hierarchy,
/// isolation blocks, contract purity, and instance expansion.
use oath_ast::{
    span, Annotation, Block, Decl, DeclKind, Expr, ExprKind, FuncDecl, Ident, InstanceDecl,
    IsolateStmt, MemberDecl, Param, Spanned, Stmt, TemplateDecl, TemplateOp, TypeDecl, TypeExpr,
    TypeExprKind, Unit,
};
use oath_core::{
    analyze_unit, EffectRegistry, EngineOptions, ErrorKind, GlobalIndex, Provided,
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

fn str_lit(s: &str) -> Expr {
    Expr {
        span: sp(),
        kind: ExprKind::Str(s.to_string()),
    }
}

fn ann(key: &str, args: Vec<Expr>) -> Annotation {
    Annotation {
        span: sp(),
        key: ident(key),
        args,
    }
}

fn dotted_call(path: &[&str], args: Vec<Expr>) -> Expr {
    let mut callee = Expr::ident(sp(), path[0]);
    for seg in &path[1..] {
        callee = Expr {
            span: sp(),
            kind: ExprKind::Field {
                base: Box::new(callee),
                name: ident(seg),
            },
        };
    }
    Expr {
        span: sp(),
        kind: ExprKind::Call {
            callee: Box::new(callee),
            args,
        },
    }
}

fn block(stmts: Vec<Stmt>) -> Block {
    Block {
        span: sp(),
        stmts,
        tail: None,
    }
}

fn func(name: &str, annotations: Vec<Annotation>, body: Option<Block>) -> Decl {
    Decl {
        span: sp(),
        name: ident(name),
        annotations,
        kind: DeclKind::Func(FuncDecl {
            type_params: Vec::new(),
            params: Vec::new(),
            ret: None,
            body,
        }),
    }
}

fn unit(name: &str, decls: Vec<Decl>) -> Unit {
    Unit {
        name: name.to_string(),
        decls,
    }
}

fn analyze(u: &Unit) -> (oath_core::AnalyzedUnit, oath_core::DiagnosticSink) {
    analyze_unit(
        u,
        &GlobalIndex::new(),
        &EffectRegistry::default(),
        &EngineOptions::default(),
    )
}

fn error_kinds(sink: &oath_core::DiagnosticSink) -> Vec<ErrorKind> {
    sink.errors().map(|e| e.error.kind).collect()
}

#[test]
fn pure_function_with_network_call_is_rejected() {
    let body = block(vec![Stmt::Expr(dotted_call(
        &["net", "fetch"],
        vec![str_lit("https://example.test")],
    ))]);
    let u = unit("m", vec![func("f", vec![ann("pure", Vec::new())], Some(body))]);
    let (_, sink) = analyze(&u);
    assert_eq!(error_kinds(&sink), vec![ErrorKind::EffectViolation]);
}

#[test]
fn declared_network_effect_covers_the_call() {
    let body = block(vec![Stmt::Expr(dotted_call(
        &["net", "fetch"],
        vec![str_lit("https://example.test")],
    ))]);
    let u = unit(
        "m",
        vec![func(
            "f",
            vec![ann("effects", vec![str_lit("network")])],
            Some(body),
        )],
    );
    let (analyzed, sink) = analyze(&u);
    assert!(!sink.has_errors(), "diagnostics: {:?}", sink.entries());
    let f = analyzed.table.iter().find(|e| e.name == "f").unwrap();
    let observed = f.observed_effects.as_ref().unwrap();
    assert!(observed.contains("network"));
}

#[test]
fn parent_effect_permits_its_children() {
    let body = block(vec![
        Stmt::Expr(dotted_call(&["net", "fetch"], vec![str_lit("u")])),
        Stmt::Expr(dotted_call(&["fs", "read"], vec![str_lit("p")])),
    ]);
    let u = unit(
        "m",
        vec![func("f", vec![ann("effects", vec![str_lit("io")])], Some(body))],
    );
    let (_, sink) = analyze(&u);
    assert!(!sink.has_errors(), "diagnostics: {:?}", sink.entries());
}

#[test]
fn callee_declared_set_propagates_to_callers() {
    let g = func(
        "g",
        vec![ann("effects", vec![str_lit("network")])],
        None,
    );
    let f_body = block(vec![Stmt::Expr(Expr {
        span: sp(),
        kind: ExprKind::Call {
            callee: Box::new(Expr::ident(sp(), "g")),
            args: Vec::new(),
        },
    })]);
    let f = func("f", Vec::new(), Some(f_body));
    let (_, sink) = analyze(&unit("m", vec![g, f]));
    let kinds = error_kinds(&sink);
    assert_eq!(kinds, vec![ErrorKind::EffectViolation]);
}

#[test]
fn isolation_block_bounds_its_interior() {
    // Enclosing set is wide enough, but the isolation block only admits
    // filesystem; the network call inside it must fail.
    let body = block(vec![Stmt::Isolate(IsolateStmt {
        span: sp(),
        effects: vec![ident("filesystem")],
        body: block(vec![Stmt::Expr(dotted_call(
            &["net", "fetch"],
            vec![str_lit("u")],
        ))]),
    })]);
    let u = unit(
        "m",
        vec![func("f", vec![ann("effects", vec![str_lit("io")])], Some(body))],
    );
    let (_, sink) = analyze(&u);
    assert_eq!(error_kinds(&sink), vec![ErrorKind::EffectViolation]);
}

#[test]
fn effectful_precondition_is_an_impure_contract() {
    let pred = Expr {
        span: sp(),
        kind: ExprKind::Binary {
            left: Box::new(dotted_call(&["net", "fetch"], vec![str_lit("u")])),
            op: oath_ast::BinOp::Eq,
            right: Box::new(str_lit("ok")),
        },
    };
    let u = unit(
        "m",
        vec![func(
            "f",
            vec![
                ann("requires", vec![pred, str_lit("remote check")]),
                ann("effects", vec![str_lit("network")]),
            ],
            Some(block(Vec::new())),
        )],
    );
    let (_, sink) = analyze(&u);
    assert!(error_kinds(&sink).contains(&ErrorKind::ImpureContract));
}

// --- templates ---------------------------------------------------------

fn template(name: &str, ops: Vec<TemplateOp>) -> Decl {
    Decl {
        span: sp(),
        name: ident(name),
        annotations: Vec::new(),
        kind: DeclKind::Template(TemplateDecl {
            type_params: Vec::new(),
            ops,
        }),
    }
}

fn op(name: &str, params: Vec<(&str, TypeExpr)>, ret: &str, default: bool) -> TemplateOp {
    TemplateOp {
        span: sp(),
        name: ident(name),
        annotations: Vec::new(),
        params: params
            .into_iter()
            .map(|(n, ty)| Param {
                span: sp(),
                name: ident(n),
                ty,
            })
            .collect(),
        ret: Some(ty_name(ret)),
        default_body: default.then(|| Block {
            span: sp(),
            stmts: Vec::new(),
            tail: Some(str_lit("default")),
        }),
    }
}

fn target_type(name: &str, members: Vec<MemberDecl>) -> Decl {
    Decl {
        span: sp(),
        name: ident(name),
        annotations: Vec::new(),
        kind: DeclKind::Type(TypeDecl {
            type_params: Vec::new(),
            body: None,
            members,
        }),
    }
}

fn member(name: &str, params: Vec<(&str, TypeExpr)>, ret: &str) -> MemberDecl {
    MemberDecl {
        span: sp(),
        name: ident(name),
        annotations: Vec::new(),
        mutates: false,
        params: params
            .into_iter()
            .map(|(n, ty)| Param {
                span: sp(),
                name: ident(n),
                ty,
            })
            .collect(),
        ret: Some(ty_name(ret)),
        body: None,
    }
}

fn instance(name: &str, template: &str, target: &str) -> Decl {
    Decl {
        span: sp(),
        name: ident(name),
        annotations: Vec::new(),
        kind: DeclKind::Instance(InstanceDecl {
            template: ident(template),
            args: Vec::new(),
            target: ident(target),
        }),
    }
}

#[test]
fn complete_instance_expands_with_target_members() {
    let u = unit(
        "m",
        vec![
            template(
                "Printable",
                vec![op("describe", vec![("sep", ty_name("String"))], "String", false)],
            ),
            target_type(
                "Point",
                vec![member("describe", vec![("sep", ty_name("String"))], "String")],
            ),
            instance("point_printable", "Printable", "Point"),
        ],
    );
    let (analyzed, sink) = analyze(&u);
    assert!(!sink.has_errors(), "diagnostics: {:?}", sink.entries());
    assert_eq!(analyzed.instances.len(), 1);
    let inst = &analyzed.instances[0];
    assert_eq!(inst.ops.len(), 1);
    assert_eq!(inst.ops[0].provided_by, Provided::Target);
}

#[test]
fn missing_operation_without_default_is_incomplete() {
    let u = unit(
        "m",
        vec![
            template(
                "Printable",
                vec![op("describe", Vec::new(), "String", false)],
            ),
            target_type("Point", Vec::new()),
            instance("point_printable", "Printable", "Point"),
        ],
    );
    let (_, sink) = analyze(&u);
    assert_eq!(error_kinds(&sink), vec![ErrorKind::IncompleteInstance]);
}

#[test]
fn default_implementation_fills_the_gap() {
    let u = unit(
        "m",
        vec![
            template(
                "Printable",
                vec![op("describe", Vec::new(), "String", true)],
            ),
            target_type("Point", Vec::new()),
            instance("point_printable", "Printable", "Point"),
        ],
    );
    let (analyzed, sink) = analyze(&u);
    assert!(!sink.has_errors());
    assert_eq!(
        analyzed.instances[0].ops[0].provided_by,
        Provided::TemplateDefault
    );
}

#[test]
fn incompatible_signature_is_a_mismatch() {
    let u = unit(
        "m",
        vec![
            template(
                "Printable",
                vec![op("describe", vec![("sep", ty_name("String"))], "String", false)],
            ),
            target_type(
                "Point",
                vec![member("describe", vec![("sep", ty_name("Int"))], "String")],
            ),
            instance("point_printable", "Printable", "Point"),
        ],
    );
    let (_, sink) = analyze(&u);
    assert_eq!(error_kinds(&sink), vec![ErrorKind::SignatureMismatch]);
}

#[test]
fn two_defaults_for_one_operation_conflict() {
    let u = unit(
        "m",
        vec![
            template("Loggable", vec![op("describe", Vec::new(), "String", true)]),
            template("Traceable", vec![op("describe", Vec::new(), "String", true)]),
            target_type("Point", Vec::new()),
            instance("a", "Loggable", "Point"),
            instance("b", "Traceable", "Point"),
        ],
    );
    let (_, sink) = analyze(&u);
    assert!(error_kinds(&sink).contains(&ErrorKind::TemplateConflict));
}

#[test]
fn target_override_resolves_the_conflict() {
    let u = unit(
        "m",
        vec![
            template("Loggable", vec![op("describe", Vec::new(), "String", true)]),
            template("Traceable", vec![op("describe", Vec::new(), "String", true)]),
            target_type("Point", vec![member("describe", Vec::new(), "String")]),
            instance("a", "Loggable", "Point"),
            instance("b", "Traceable", "Point"),
        ],
    );
    let (_, sink) = analyze(&u);
    assert!(!sink.has_errors(), "diagnostics: {:?}", sink.entries());
}

#[test]
fn instantiation_is_idempotent() {
    let build = || {
        unit(
            "m",
            vec![
                template(
                    "Printable",
                    vec![op("describe", Vec::new(), "String", true)],
                ),
                target_type("Point", Vec::new()),
                instance("point_printable", "Printable", "Point"),
            ],
        )
    };
    let (first, _) = analyze(&build());
    let (second, _) = analyze(&build());
    assert_eq!(first.instances[0].ops, second.instances[0].ops);
}
